//! Hardware hazard mitigation.
//!
//! Two backends selected by chip class. GFX6-9 use per-block linear scans
//! with relative counters ("last VALU that wrote vcc/exec/an SGPR") and
//! insert `s_nop` wait states in front of the consumer. GFX10+ run a full
//! dataflow analysis over the CFG whose state joins by componentwise OR;
//! loops replay with the merged entry state until the header state stops
//! changing. Each GFX10 hazard has a dedicated mitigation instruction
//! rather than a plain NOP.

use crate::ir::{
    Definition, Format, InstrData, Instruction, Opcode, Operand, Program, RegClass, RegType,
    regs_intersect, ChipClass, PhysReg, EXEC, EXEC_HI, EXEC_LO, EXECZ, M0, SGPR_NULL, VCCZ,
};

fn valu_writes_sgpr(instr: &Instruction) -> bool {
    if instr.is_vopc() {
        return true;
    }
    if instr.is_vop3() && instr.definitions.len() == 2 {
        return true;
    }
    matches!(
        instr.opcode,
        Opcode::v_readfirstlane_b32 | Opcode::v_readlane_b32 | Opcode::v_readlane_b32_e64
    )
}

fn instr_writes_exec(instr: &Instruction) -> bool {
    instr
        .definitions
        .iter()
        .any(|def| def.phys_reg() == EXEC_LO || def.phys_reg() == EXEC_HI)
}

fn instr_writes_sgpr(instr: &Instruction) -> bool {
    instr.definitions.iter().any(|def| def.reg_class().ty() == RegType::Sgpr)
}

fn instr_is_branch(instr: &Instruction) -> bool {
    matches!(
        instr.opcode,
        Opcode::s_branch
            | Opcode::s_cbranch_scc0
            | Opcode::s_cbranch_scc1
            | Opcode::s_cbranch_vccz
            | Opcode::s_cbranch_vccnz
            | Opcode::s_cbranch_execz
            | Opcode::s_cbranch_execnz
            | Opcode::s_subvector_loop_begin
            | Opcode::s_subvector_loop_end
            | Opcode::s_setpc_b64
            | Opcode::s_swappc_b64
            | Opcode::s_getpc_b64
    )
}

struct NopCtxGfx89 {
    chip: ChipClass,
    vcc_physical: u32,
    // Initialized below the largest NOP distance.
    valu_wrexec: i32,
    valu_wrvcc: i32,
    valu_wrsgpr: i32,
}

impl NopCtxGfx89 {
    fn new(program: &Program) -> Self {
        Self {
            chip: program.chip_class,
            vcc_physical: program.config.num_sgprs - 2,
            valu_wrexec: -10,
            valu_wrvcc: -10,
            valu_wrsgpr: -10,
        }
    }
}

/// Break an SMEM instruction off a preceding overlapping SMEM clause.
fn handle_smem_clause(instr: &Instruction, new_idx: i32, new_instructions: &[Instruction]) -> u32 {
    let is_store = instr.definitions.is_empty();
    for pred_idx in (0..new_idx).rev() {
        let pred = &new_instructions[pred_idx as usize];
        if pred.format.base() != Format::SMEM {
            break;
        }

        // Clauses with store instructions may reuse the same address.
        if is_store || pred.definitions.is_empty() {
            return 1;
        }

        let instr_def = &instr.definitions[0];
        let pred_def = &pred.definitions[0];

        if regs_intersect(instr_def.phys_reg(), instr_def.size(), pred_def.phys_reg(), pred_def.size())
        {
            return 1;
        }

        for op in &pred.operands {
            if op.is_constant() || !op.is_fixed() {
                continue;
            }
            if regs_intersect(instr_def.phys_reg(), instr_def.size(), op.phys_reg(), op.size()) {
                return 1;
            }
        }
        for op in &instr.operands {
            if op.is_constant() || !op.is_fixed() {
                continue;
            }
            if regs_intersect(pred_def.phys_reg(), pred_def.size(), op.phys_reg(), op.size()) {
                return 1;
            }
        }
    }
    0
}

fn handle_instruction_gfx8_9(
    ctx: &mut NopCtxGfx89,
    instr: &Instruction,
    new_instructions: &[Instruction],
) -> u32 {
    let new_idx = new_instructions.len() as i32;

    if instr.format.base() == Format::SMEM {
        if ctx.chip == ChipClass::Gfx6 {
            let is_buffer_load = !instr.operands.is_empty() && instr.operands[0].size() > 2;
            for pred_idx in ((new_idx - 4).max(0)..new_idx).rev() {
                let pred = &new_instructions[pred_idx as usize];
                // A read of an SGPR by an SMRD instruction requires 4 wait
                // states when the SGPR was written by a VALU instruction.
                if valu_writes_sgpr(pred) {
                    let pred_def = pred.definitions.last().unwrap();
                    for op in &instr.operands {
                        if !op.is_fixed() {
                            continue;
                        }
                        if regs_intersect(pred_def.phys_reg(), pred_def.size(), op.phys_reg(), op.size())
                        {
                            return (4 + pred_idx - new_idx + 1) as u32;
                        }
                    }
                }
                // Undocumented hardware behavior reported by other
                // compilers: SALU writes need the same wait for wide
                // buffer loads.
                if is_buffer_load && pred.is_salu() && !pred.definitions.is_empty() {
                    let pred_def = &pred.definitions[0];
                    let op = &instr.operands[0];
                    if op.is_fixed()
                        && regs_intersect(pred_def.phys_reg(), pred_def.size(), op.phys_reg(), op.size())
                    {
                        return (4 + pred_idx - new_idx + 1) as u32;
                    }
                }
            }
        }

        return handle_smem_clause(instr, new_idx, new_instructions);
    } else if instr.is_valu() || instr.format.base() == Format::VINTRP {
        let mut nops: i32 = 0;

        if instr.is_dpp() {
            // VALU does not forward EXEC to DPP.
            if ctx.valu_wrexec + 5 >= new_idx {
                nops = 5 + ctx.valu_wrexec - new_idx + 1;
            }
            // VALU DPP reads a VGPR written by VALU.
            for pred_idx in ((new_idx - 2).max(0)..new_idx).rev() {
                let pred = &new_instructions[pred_idx as usize];
                if (pred.is_valu() || pred.format.base() == Format::VINTRP)
                    && !pred.definitions.is_empty()
                    && pred.definitions[0].phys_reg() == instr.operands[0].phys_reg()
                {
                    nops = nops.max(2 + pred_idx - new_idx + 1);
                    break;
                }
            }
        }

        // SALU writes m0 before interpolation.
        if instr.format.base() == Format::VINTRP && new_idx > 0 && ctx.chip >= ChipClass::Gfx9 {
            let pred = new_instructions.last().unwrap();
            if pred.is_salu() && !pred.definitions.is_empty() && pred.definitions[0].phys_reg() == M0
            {
                nops = nops.max(1);
            }
        }

        for op in &instr.operands {
            if !op.is_fixed() {
                continue;
            }
            // VALU reading VCCZ.
            if op.phys_reg() == VCCZ && ctx.valu_wrvcc + 5 >= new_idx {
                nops = nops.max(5 + ctx.valu_wrvcc - new_idx + 1);
            }
            // VALU reading EXECZ.
            if op.phys_reg() == EXECZ && ctx.valu_wrexec + 5 >= new_idx {
                nops = nops.max(5 + ctx.valu_wrexec - new_idx + 1);
            }
            // VALU reading VCC as a constant operand.
            if ctx.valu_wrvcc + 1 >= new_idx {
                for k in 0..op.size() {
                    let reg = op.phys_reg().reg() + k;
                    if reg == ctx.vcc_physical || reg == ctx.vcc_physical + 1 {
                        nops = nops.max(1);
                    }
                }
            }
        }

        match instr.opcode {
            Opcode::v_readlane_b32
            | Opcode::v_readlane_b32_e64
            | Opcode::v_writelane_b32
            | Opcode::v_writelane_b32_e64 => {
                if ctx.valu_wrsgpr + 4 >= new_idx {
                    let reg = instr.operands[1].phys_reg();
                    for pred_idx in ((new_idx - 4).max(0)..new_idx).rev() {
                        let pred = &new_instructions[pred_idx as usize];
                        if !pred.is_valu() || !valu_writes_sgpr(pred) {
                            continue;
                        }
                        for def in &pred.definitions {
                            if def.phys_reg() == reg {
                                nops = nops.max(4 + pred_idx - new_idx + 1);
                            }
                        }
                    }
                }
            }
            Opcode::v_div_fmas_f32 | Opcode::v_div_fmas_f64 => {
                if ctx.valu_wrvcc + 4 >= new_idx {
                    nops = nops.max(4 + ctx.valu_wrvcc - new_idx + 1);
                }
            }
            _ => {}
        }

        // VALU writing VGPRs holding >64-bit store data of the previous
        // instruction.
        if new_idx > 0 {
            let pred = new_instructions.last().unwrap();
            let consider_buf = pred.is_vmem()
                && pred.format.base() != Format::MIMG
                && pred.operands.len() == 4
                && pred.operands[3].size() > 2
                && pred.operands[2].phys_reg().reg() >= 128;
            let consider_mimg = pred.format.base() == Format::MIMG
                && pred.operands.len() == 4
                && pred.operands[3].size() > 2
                && pred.operands[1].size() != 8;
            let consider_flat =
                pred.is_flat_like() && pred.operands.len() == 3 && pred.operands[2].size() > 2;
            if consider_buf || consider_mimg || consider_flat {
                let wrdata = pred.operands[3.min(pred.operands.len() - 1)].phys_reg();
                let size = pred.operands[3.min(pred.operands.len() - 1)].size();
                for def in &instr.definitions {
                    if regs_intersect(def.phys_reg(), def.size(), wrdata, size) {
                        nops = nops.max(1);
                    }
                }
            }
        }

        if valu_writes_sgpr(instr) {
            for def in &instr.definitions {
                if def.phys_reg() == crate::ir::VCC {
                    ctx.valu_wrvcc = if nops > 0 { new_idx } else { new_idx + 1 };
                } else if def.phys_reg() == EXEC {
                    ctx.valu_wrexec = if nops > 0 { new_idx } else { new_idx + 1 };
                } else if def.phys_reg().reg() <= 102 {
                    ctx.valu_wrsgpr = if nops > 0 { new_idx } else { new_idx + 1 };
                }
            }
        }
        return nops.max(0) as u32;
    } else if (instr.is_vmem() || instr.is_flat_like()) && ctx.valu_wrsgpr + 5 >= new_idx {
        // A VALU writing an SGPR used by a VMEM requires 5 wait states.
        for pred_idx in ((new_idx - 5).max(0)..new_idx).rev() {
            let pred = &new_instructions[pred_idx as usize];
            if !(pred.is_valu() && valu_writes_sgpr(pred)) {
                continue;
            }
            for def in &pred.definitions {
                if def.phys_reg().reg() > 102 {
                    continue;
                }
                for op_idx in [1usize, 2] {
                    if instr.operands.len() > op_idx
                        && instr.operands[op_idx].is_fixed()
                        && regs_intersect(
                            instr.operands[op_idx].phys_reg(),
                            instr.operands[op_idx].size(),
                            def.phys_reg(),
                            def.size(),
                        )
                    {
                        return (5 + pred_idx - new_idx + 1) as u32;
                    }
                }
            }
        }
    }

    0
}

fn handle_block_gfx8_9(ctx: &mut NopCtxGfx89, block: &mut crate::ir::Block) {
    let old = std::mem::take(&mut block.instructions);
    let mut instructions = Vec::with_capacity(old.len());
    for instr in old {
        let nops = handle_instruction_gfx8_9(ctx, &instr, &instructions);
        if nops > 0 {
            let mut nop = Instruction::new(Opcode::s_nop, Format::SOPP, 0, 0);
            nop.data = InstrData::Sopp { imm: nops as u16 - 1, block: None };
            instructions.push(nop);
        }
        instructions.push(instr);
    }

    ctx.valu_wrvcc -= instructions.len() as i32;
    ctx.valu_wrexec -= instructions.len() as i32;
    ctx.valu_wrsgpr -= instructions.len() as i32;
    block.instructions = instructions;
}

fn insert_nops_gfx8_9(program: &mut Program) {
    let mut ctx = NopCtxGfx89::new(program);
    for block in &mut program.blocks {
        if block.instructions.is_empty() {
            continue;
        }
        handle_block_gfx8_9(&mut ctx, block);
    }
}

/// Dataflow state for the GFX10+ hazards; the join is componentwise OR.
#[derive(Clone, Default, PartialEq)]
struct NopCtxGfx10 {
    has_vopc: bool,
    has_nonvalu_exec_read: bool,
    has_vmem: bool,
    has_branch_after_vmem: bool,
    has_ds: bool,
    has_branch_after_ds: bool,
    sgprs_read_by_vmem: u128,
    sgprs_read_by_smem: u128,
}

impl NopCtxGfx10 {
    fn join(&mut self, other: &NopCtxGfx10) {
        self.has_vopc |= other.has_vopc;
        self.has_nonvalu_exec_read |= other.has_nonvalu_exec_read;
        self.has_vmem |= other.has_vmem;
        self.has_branch_after_vmem |= other.has_branch_after_vmem;
        self.has_ds |= other.has_ds;
        self.has_branch_after_ds |= other.has_branch_after_ds;
        self.sgprs_read_by_vmem |= other.sgprs_read_by_vmem;
        self.sgprs_read_by_smem |= other.sgprs_read_by_smem;
    }
}

fn mark_read_regs(instr: &Instruction, reg_reads: &mut u128) {
    for op in &instr.operands {
        if !op.is_fixed() {
            continue;
        }
        for i in 0..op.size() {
            let reg = op.phys_reg().reg() + i;
            if reg < 128 {
                *reg_reads |= 1u128 << reg;
            }
        }
    }
}

fn check_written_regs(instr: &Instruction, check_regs: u128) -> bool {
    instr.definitions.iter().any(|def| {
        (0..def.size()).any(|i| {
            let reg = def.phys_reg().reg() + i;
            reg < 128 && check_regs & (1u128 << reg) != 0
        })
    })
}

fn handle_instruction_gfx10(
    program: &Program,
    ctx: &mut NopCtxGfx10,
    instr: &Instruction,
    new_instructions: &mut Vec<Instruction>,
) {
    // VMEMtoScalarWriteHazard: an EXEC/M0/SGPR write following a VMEM
    // instruction without a VALU or waitcnt-vmcnt(0) in between.
    if instr.is_vmem() || instr.is_flat_like() || instr.format.base() == Format::DS {
        // Remember all SGPRs read by the VMEM instruction.
        mark_read_regs(instr, &mut ctx.sgprs_read_by_vmem);
        ctx.sgprs_read_by_vmem |= 1u128 << EXEC_LO.reg();
        if program.wave_size == 64 {
            ctx.sgprs_read_by_vmem |= 1u128 << EXEC_HI.reg();
        }
    } else if instr.is_salu() || instr.format.base() == Format::SMEM {
        if instr.opcode == Opcode::s_waitcnt {
            // Mitigated by s_waitcnt vmcnt(0).
            let imm = instr.salu_imm();
            let vmcnt = (imm & 0xF) | ((imm & (0x3 << 14)) >> 10);
            if vmcnt == 0 {
                ctx.sgprs_read_by_vmem = 0;
            }
        } else if check_written_regs(instr, ctx.sgprs_read_by_vmem) {
            ctx.sgprs_read_by_vmem = 0;
            // Insert a v_nop to mitigate the problem.
            new_instructions.push(Instruction::new(Opcode::v_nop, Format::VOP1, 0, 0));
        }
    } else if instr.is_valu() {
        // Any VALU instruction mitigates the hazard.
        ctx.sgprs_read_by_vmem = 0;
    }

    // VcmpxPermlaneHazard: a permlane following a VOPC instruction.
    if instr.is_vopc() {
        ctx.has_vopc = true;
    } else if ctx.has_vopc
        && matches!(instr.opcode, Opcode::v_permlane16_b32 | Opcode::v_permlanex16_b32)
    {
        ctx.has_vopc = false;
        // v_nop would be discarded by the hardware; use v_mov on the first
        // operand of the permlane.
        let mut v_mov = Instruction::new(Opcode::v_mov_b32, Format::VOP1, 1, 1);
        v_mov.definitions[0] = Definition::fixed(instr.operands[0].phys_reg(), RegClass::V1);
        v_mov.operands[0] = Operand::fixed(instr.operands[0].phys_reg(), RegClass::V1);
        new_instructions.push(v_mov);
    } else if instr.is_valu() && instr.opcode != Opcode::v_nop {
        ctx.has_vopc = false;
    }

    // VcmpxExecWARHazard: a VALU writing exec after a non-VALU read of it.
    if !instr.is_valu() && instr.reads_exec() {
        ctx.has_nonvalu_exec_read = true;
    } else if instr.is_valu() {
        if instr_writes_exec(instr) {
            if ctx.has_nonvalu_exec_read {
                ctx.has_nonvalu_exec_read = false;
                // Insert s_waitcnt_depctr with the magic immediate.
                let mut depctr = Instruction::new(Opcode::s_waitcnt_depctr, Format::SOPP, 0, 0);
                depctr.data = InstrData::Sopp { imm: 0xfffe, block: None };
                new_instructions.push(depctr);
            }
        } else if instr_writes_sgpr(instr) {
            // Any VALU instruction writing an SGPR mitigates the problem.
            ctx.has_nonvalu_exec_read = false;
        }
    } else if instr.opcode == Opcode::s_waitcnt_depctr && (instr.salu_imm() & 0xfffe) == 0xfffe {
        ctx.has_nonvalu_exec_read = false;
    }

    // SMEMtoVectorWriteHazard: a VALU writing an SGPR after an SMEM read it.
    if instr.format.base() == Format::SMEM {
        mark_read_regs(instr, &mut ctx.sgprs_read_by_smem);
    } else if valu_writes_sgpr(instr) {
        if check_written_regs(instr, ctx.sgprs_read_by_smem) {
            ctx.sgprs_read_by_smem = 0;
            // Insert an s_mov to null to mitigate the problem.
            let mut s_mov = Instruction::new(Opcode::s_mov_b32, Format::SOP1, 1, 1);
            s_mov.definitions[0] = Definition::fixed(SGPR_NULL, RegClass::S1);
            s_mov.operands[0] = Operand::c32(0);
            new_instructions.push(s_mov);
        }
    } else if instr.is_salu() {
        if instr.format.base() != Format::SOPP && instr.format.base() != Format::SOPK {
            ctx.sgprs_read_by_smem = 0;
        } else if instr.opcode == Opcode::s_waitcnt_lgkmcnt {
            if instr.salu_imm() == 0
                && !instr.definitions.is_empty()
                && instr.definitions[0].phys_reg() == SGPR_NULL
            {
                ctx.sgprs_read_by_smem = 0;
            }
        } else if instr.opcode == Opcode::s_waitcnt {
            let lgkm = (instr.salu_imm() >> 8) & 0x3f;
            if lgkm == 0 {
                ctx.sgprs_read_by_smem = 0;
            }
        }
    }

    // LdsBranchVmemWARHazard: VMEM->branch->DS and DS->branch->VMEM.
    if instr.is_vmem() || instr.format.base() == Format::GLOBAL || instr.format.base() == Format::SCRATCH
    {
        ctx.has_vmem = true;
        ctx.has_branch_after_vmem = false;
        // DS mitigation is only needed when a branch already followed.
        ctx.has_ds = ctx.has_branch_after_ds;
    } else if instr.format.base() == Format::DS {
        ctx.has_ds = true;
        ctx.has_branch_after_ds = false;
        ctx.has_vmem = ctx.has_branch_after_vmem;
    } else if instr_is_branch(instr) {
        ctx.has_branch_after_vmem = ctx.has_vmem;
        ctx.has_branch_after_ds = ctx.has_ds;
    } else if instr.opcode == Opcode::s_waitcnt_vscnt {
        if !instr.definitions.is_empty()
            && instr.definitions[0].phys_reg() == SGPR_NULL
            && instr.salu_imm() == 0
        {
            ctx.has_vmem = false;
            ctx.has_branch_after_vmem = false;
            ctx.has_ds = false;
            ctx.has_branch_after_ds = false;
        }
    }
    if (ctx.has_vmem && ctx.has_branch_after_ds) || (ctx.has_ds && ctx.has_branch_after_vmem) {
        ctx.has_vmem = false;
        ctx.has_branch_after_vmem = false;
        ctx.has_ds = false;
        ctx.has_branch_after_ds = false;
        // Insert s_waitcnt_vscnt 0 to mitigate the problem.
        let mut wait = Instruction::new(Opcode::s_waitcnt_vscnt, Format::SOPK, 0, 1);
        wait.definitions[0] = Definition::fixed(SGPR_NULL, RegClass::S1);
        wait.data = InstrData::Sopk { imm: 0 };
        new_instructions.push(wait);
    }
}

fn handle_block_gfx10(program: &Program, ctx: &mut NopCtxGfx10, block: &mut crate::ir::Block) {
    if block.instructions.is_empty() {
        return;
    }
    let old = std::mem::take(&mut block.instructions);
    let mut instructions = Vec::with_capacity(old.len());
    for instr in old {
        handle_instruction_gfx10(program, ctx, &instr, &mut instructions);
        instructions.push(instr);
    }
    block.instructions = instructions;
}

fn mitigate_hazards_gfx10(program: &mut Program) {
    let mut all_ctx = vec![NopCtxGfx10::default(); program.blocks.len()];
    let mut loop_header_indices: Vec<usize> = Vec::new();

    for i in 0..program.blocks.len() {
        if program.blocks[i].kind.contains(crate::ir::BlockKind::LOOP_HEADER) {
            loop_header_indices.push(i);
        } else if program.blocks[i].kind.contains(crate::ir::BlockKind::LOOP_EXIT) {
            // Replay the whole loop with the merged entry state until the
            // loop header state stops changing.
            let header = *loop_header_indices.last().unwrap();
            for idx in header..i {
                let mut loop_block_ctx = NopCtxGfx10::default();
                for &b in program.blocks[idx].linear_preds.clone().iter() {
                    loop_block_ctx.join(&all_ctx[b as usize]);
                }

                let mut block = std::mem::take(&mut program.blocks[idx]);
                handle_block_gfx10(program, &mut loop_block_ctx, &mut block);
                program.blocks[idx] = block;

                // Iteration stops when the loop header context is stable.
                if idx == header && loop_block_ctx == all_ctx[idx] {
                    break;
                }
                all_ctx[idx] = loop_block_ctx;
            }
            loop_header_indices.pop();
        }

        let mut ctx = NopCtxGfx10::default();
        for &b in program.blocks[i].linear_preds.clone().iter() {
            ctx.join(&all_ctx[b as usize]);
        }

        let mut block = std::mem::take(&mut program.blocks[i]);
        handle_block_gfx10(program, &mut ctx, &mut block);
        program.blocks[i] = block;
        all_ctx[i] = ctx;
    }
}

/// Insert wait states and hazard mitigation instructions.
pub fn insert_nops(program: &mut Program) {
    if program.chip_class >= ChipClass::Gfx10 {
        mitigate_hazards_gfx10(program);
    } else {
        insert_nops_gfx8_9(program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Stage};

    fn one_block(chip: ChipClass) -> Program {
        let mut program = Program::new(chip, 64, Stage::HW_CS);
        program.create_and_insert_block();
        program
    }

    #[test]
    fn vintrp_after_m0_write_needs_nop() {
        let mut program = one_block(ChipClass::Gfx9);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let m0_def = Definition::fixed(M0, RegClass::S1);
            bld.sop1(Opcode::s_mov_b32, &[m0_def], &[Operand::c32(0)]);
            let mut interp = Instruction::new(Opcode::v_interp_p1_f32, Format::VINTRP, 1, 1);
            interp.definitions[0] = Definition::fixed(PhysReg(256), RegClass::V1);
            interp.operands[0] = Operand::fixed(PhysReg(257), RegClass::V1);
            bld.insert(interp);
        }
        program.blocks[0].instructions = instrs;

        insert_nops(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[1].opcode, Opcode::s_nop);
        assert_eq!(instrs[1].salu_imm(), 0);
    }

    #[test]
    fn readlane_after_valu_sgpr_write_waits() {
        let mut program = one_block(ChipClass::Gfx8);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let sgpr = Definition::fixed(PhysReg(4), RegClass::S1);
            bld.vop1(Opcode::v_readfirstlane_b32, &[sgpr], &[Operand::fixed(PhysReg(256), RegClass::V1)]);
            let mut readlane = Instruction::new(Opcode::v_readlane_b32, Format::VOP2, 2, 1);
            readlane.definitions[0] = Definition::fixed(PhysReg(5), RegClass::S1);
            readlane.operands[0] = Operand::fixed(PhysReg(257), RegClass::V1);
            readlane.operands[1] = Operand::fixed(PhysReg(4), RegClass::S1);
            bld.insert(readlane);
        }
        program.blocks[0].instructions = instrs;

        insert_nops(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[1].opcode, Opcode::s_nop);
        assert_eq!(instrs[1].salu_imm(), 3);
    }

    #[test]
    fn gfx10_vmem_to_scalar_write_inserts_vnop() {
        let mut program = one_block(ChipClass::Gfx10);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut load = Instruction::new(Opcode::buffer_load_dword, Format::MUBUF, 3, 1);
            load.operands[0] = Operand::fixed(PhysReg(256), RegClass::V1);
            load.operands[1] = Operand::fixed(PhysReg(8), RegClass::S4);
            load.operands[2] = Operand::fixed(PhysReg(12), RegClass::S1);
            load.definitions[0] = Definition::fixed(PhysReg(257), RegClass::V1);
            bld.insert(load);
            // SALU write of an SGPR the VMEM read.
            let d = Definition::fixed(PhysReg(12), RegClass::S1);
            bld.sop1(Opcode::s_mov_b32, &[d], &[Operand::c32(7)]);
        }
        program.blocks[0].instructions = instrs;

        insert_nops(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[1].opcode, Opcode::v_nop);
    }

    #[test]
    fn gfx10_smem_to_vector_write_inserts_null_mov() {
        let mut program = one_block(ChipClass::Gfx10);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut load = Instruction::new(Opcode::s_load_dword, Format::SMEM, 2, 1);
            load.operands[0] = Operand::fixed(PhysReg(8), RegClass::S2);
            load.operands[1] = Operand::c32(0);
            load.definitions[0] = Definition::fixed(PhysReg(10), RegClass::S1);
            bld.insert(load);
            // VALU write of an SGPR the SMEM read.
            let mut cmp = Instruction::new(Opcode::v_cmp_lt_f32, Format::VOPC, 2, 1);
            cmp.operands[0] = Operand::fixed(PhysReg(256), RegClass::V1);
            cmp.operands[1] = Operand::fixed(PhysReg(257), RegClass::V1);
            cmp.definitions[0] = Definition::fixed(PhysReg(8), RegClass::S2);
            bld.insert(cmp);
        }
        program.blocks[0].instructions = instrs;

        insert_nops(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[1].opcode, Opcode::s_mov_b32);
        assert_eq!(instrs[1].definitions[0].phys_reg(), SGPR_NULL);
    }

    #[test]
    fn gfx10_lds_branch_vmem_war() {
        // DS in block 0, branch, then VMEM in block 1.
        let mut program = Program::new(ChipClass::Gfx10, 64, Stage::HW_CS);
        program.create_and_insert_block();
        program.create_and_insert_block();
        program.blocks[0].linear_succs.push(1);
        program.blocks[1].linear_preds.push(0);

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut ds = Instruction::new(Opcode::ds_read_b32, Format::DS, 1, 1);
            ds.operands[0] = Operand::fixed(PhysReg(256), RegClass::V1);
            ds.definitions[0] = Definition::fixed(PhysReg(257), RegClass::V1);
            bld.insert(ds);
            bld.sopp(Opcode::s_branch, Some(1), 0);
        }
        program.blocks[0].instructions = instrs;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut load = Instruction::new(Opcode::buffer_load_dword, Format::MUBUF, 3, 1);
            load.operands[0] = Operand::fixed(PhysReg(256), RegClass::V1);
            load.operands[1] = Operand::fixed(PhysReg(8), RegClass::S4);
            load.operands[2] = Operand::fixed(PhysReg(12), RegClass::S1);
            load.definitions[0] = Definition::fixed(PhysReg(258), RegClass::V1);
            bld.insert(load);
        }
        program.blocks[1].instructions = instrs;

        insert_nops(&mut program);

        let instrs = &program.blocks[1].instructions;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, Opcode::s_waitcnt_vscnt);
        assert_eq!(instrs[0].definitions[0].phys_reg(), SGPR_NULL);
    }
}
