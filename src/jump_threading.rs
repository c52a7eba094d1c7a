//! Jump threading and branch lowering.
//!
//! A backward sweep over the CFG with three cooperating rewrites: useless
//! exec-mask writes are deleted, empty blocks are spliced out of the linear
//! CFG, and invert blocks whose successors collapsed to one target are
//! removed. A recognizer additionally fuses the break-with-continue pattern
//! into `s_andn2_wrexec` where the hardware has it. `lower_branches` then
//! converts the remaining pseudo branches into concrete SOPP branches, or
//! removes them entirely when executing the skipped instructions with a zero
//! exec mask is cheaper than the jump.

use crate::ir::{
    Builder, BlockKind, ChipClass, Definition, Format, Instruction, Opcode, Operand, Program,
    RegType, EXEC, SCC,
};
use crate::{CodegenError, CodegenResult};

struct JumpThreadingCtx {
    blocks_incoming_exec_used: Vec<bool>,
}

fn is_empty_block(block: &crate::ir::Block, ignore_exec_writes: bool) -> bool {
    // Check if this block is empty and the exec mask is not needed.
    for instr in &block.instructions {
        match instr.opcode {
            Opcode::p_linear_phi
            | Opcode::p_phi
            | Opcode::p_logical_start
            | Opcode::p_logical_end
            | Opcode::p_branch => {}
            Opcode::p_parallelcopy => {
                for (def, op) in instr.definitions.iter().zip(&instr.operands) {
                    if ignore_exec_writes && def.phys_reg() == EXEC {
                        continue;
                    }
                    if def.phys_reg() != op.phys_reg() {
                        return false;
                    }
                }
            }
            Opcode::s_andn2_b64 | Opcode::s_andn2_b32 => {
                if ignore_exec_writes && instr.definitions[0].phys_reg() == EXEC {
                    continue;
                }
                return false;
            }
            _ => return false,
        }
    }
    true
}

fn try_remove_merge_block(program: &mut Program, ctx: &JumpThreadingCtx, block_idx: usize) {
    let block = &program.blocks[block_idx];
    if block.linear_succs.len() != 1 {
        return;
    }
    let succ_idx = block.linear_succs[0] as usize;

    // If the successor is a later block, we did not gather
    // incoming_exec_used for it yet.
    let ignore = !ctx.blocks_incoming_exec_used[succ_idx] && block_idx < succ_idx;
    if !is_empty_block(block, ignore) {
        return;
    }

    // Keep the branch instruction and remove the rest.
    let branch = program.blocks[block_idx].instructions.pop().unwrap();
    program.blocks[block_idx].instructions.clear();
    program.blocks[block_idx].instructions.push(branch);
}

fn try_remove_invert_block(program: &mut Program, ctx: &mut JumpThreadingCtx, block_idx: usize) {
    debug_assert_eq!(program.blocks[block_idx].linear_succs.len(), 2);
    // Only removable once both successors collapsed to one block.
    if program.blocks[block_idx].linear_succs[0] != program.blocks[block_idx].linear_succs[1] {
        return;
    }

    let succ_idx = program.blocks[block_idx].linear_succs[0] as usize;
    debug_assert!(block_idx < succ_idx);

    if !is_empty_block(&program.blocks[block_idx], !ctx.blocks_incoming_exec_used[succ_idx]) {
        return;
    }

    debug_assert_eq!(program.blocks[block_idx].linear_preds.len(), 2);
    let preds = program.blocks[block_idx].linear_preds.clone();
    for (i, &pred_idx) in preds.iter().enumerate() {
        program.blocks[pred_idx as usize].linear_succs[0] = succ_idx as u32;
        program.blocks[succ_idx].linear_preds[i] = pred_idx;

        let branch = program.blocks[pred_idx as usize].instructions.last_mut().unwrap();
        debug_assert!(branch.is_branch());
        branch.branch_targets_mut()[0] = succ_idx as u32;
        branch.branch_targets_mut()[1] = succ_idx as u32;
    }

    let block = &mut program.blocks[block_idx];
    block.instructions.clear();
    block.linear_preds.clear();
    block.linear_succs.clear();
}

fn try_remove_simple_block(program: &mut Program, block_idx: usize) {
    if !is_empty_block(&program.blocks[block_idx], false) {
        return;
    }

    let pred_idx = program.blocks[block_idx].linear_preds[0] as usize;
    let succ_idx = program.blocks[block_idx].linear_succs[0] as usize;
    let block_index = program.blocks[block_idx].index;

    let branch = program.blocks[pred_idx].instructions.last_mut().unwrap();
    let targets = *match &mut branch.data {
        crate::ir::InstrData::Branch { target, .. } => target,
        _ => return,
    };
    if branch.opcode == Opcode::p_branch {
        branch.branch_targets_mut()[0] = succ_idx as u32;
        branch.branch_targets_mut()[1] = succ_idx as u32;
    } else if targets[0] == block_index {
        branch.branch_targets_mut()[0] = succ_idx as u32;
    } else if targets[0] == succ_idx as u32 {
        debug_assert_eq!(targets[1], block_index);
        branch.branch_targets_mut()[1] = succ_idx as u32;
        branch.opcode = Opcode::p_branch;
        if let crate::ir::InstrData::Branch { rarely_taken, never_taken, .. } = &mut branch.data {
            *rarely_taken = false;
            *never_taken = false;
        }
    } else if targets[1] == block_index {
        // Check if there is a fall-through path from the block to succ.
        let mut falls_through = block_index < succ_idx as u32;
        for j in block_index as usize + 1..succ_idx {
            if falls_through && !program.blocks[j].instructions.is_empty() {
                falls_through = false;
            }
        }
        if falls_through {
            let branch = program.blocks[pred_idx].instructions.last_mut().unwrap();
            branch.branch_targets_mut()[1] = succ_idx as u32;
        } else {
            // Check if there is a fall-through path for the alternative
            // target.
            if block_index >= targets[0] {
                return;
            }
            for j in block_index as usize + 1..targets[0] as usize {
                if !program.blocks[j].instructions.is_empty() {
                    return;
                }
            }

            // This is a (uniform) break or continue block; invert the
            // branch condition and swap the successors.
            let branch = program.blocks[pred_idx].instructions.last_mut().unwrap();
            branch.opcode = match branch.opcode {
                Opcode::p_cbranch_z => Opcode::p_cbranch_nz,
                Opcode::p_cbranch_nz => Opcode::p_cbranch_z,
                _ => unreachable!("conditional branch expected"),
            };
            let t0 = branch.branch_targets_mut()[0];
            branch.branch_targets_mut()[1] = t0;
            branch.branch_targets_mut()[0] = succ_idx as u32;
            program.blocks[pred_idx].linear_succs[0] = program.blocks[pred_idx].linear_succs[1];
            program.blocks[pred_idx].linear_succs[1] = succ_idx as u32;
        }
    } else {
        unreachable!("block is not a successor of its predecessor's branch");
    }

    let branch = program.blocks[pred_idx].instructions.last_mut().unwrap();
    let (targets, _, _) = branch.branch();
    if targets[0] == targets[1] {
        branch.operands.clear();
        branch.opcode = Opcode::p_branch;
        if let crate::ir::InstrData::Branch { rarely_taken, never_taken, .. } = &mut branch.data {
            *rarely_taken = false;
            *never_taken = false;
        }
    }

    for i in 0..program.blocks[pred_idx].linear_succs.len() {
        if program.blocks[pred_idx].linear_succs[i] == block_index {
            program.blocks[pred_idx].linear_succs[i] = succ_idx as u32;
        }
    }
    for i in 0..program.blocks[succ_idx].linear_preds.len() {
        if program.blocks[succ_idx].linear_preds[i] == block_index {
            program.blocks[succ_idx].linear_preds[i] = pred_idx as u32;
        }
    }

    let block = &mut program.blocks[block_idx];
    block.instructions.clear();
    block.linear_preds.clear();
    block.linear_succs.clear();
}

fn is_simple_copy(instr: &Instruction) -> bool {
    instr.opcode == Opcode::p_parallelcopy && instr.definitions.len() == 1
}

/// Fuse `cbranch-z exec -> merge -> copy-to-exec + loop-branch` into an
/// `andn2_wrexec` plus conditional branch when the hardware supports the
/// combined form.
fn try_merge_break_with_continue(
    program: &mut Program,
    ctx: &mut JumpThreadingCtx,
    block_idx: usize,
) {
    if program.blocks[block_idx].linear_succs.len() != 2
        || program.blocks[block_idx].instructions.len() < 2
    {
        return;
    }

    let branch = program.blocks[block_idx].instructions.last().unwrap();
    if branch.opcode != Opcode::p_cbranch_z
        || branch.operands.is_empty()
        || branch.operands[0].phys_reg() != SCC
    {
        return;
    }
    let (targets, _, _) = branch.branch();
    let merge_idx = targets[1] as usize;
    let loopexit_idx = targets[0] as usize;

    // The merge block must be just a jump to the loop header.
    if program.blocks[merge_idx].linear_succs.len() != 1 {
        return;
    }

    // Every block between merge and loop exit must be empty so the exit can
    // become the fall-through.
    for i in merge_idx + 1..loopexit_idx {
        if !program.blocks[i].instructions.is_empty() {
            return;
        }
    }

    for &merge_pred in program.blocks[merge_idx].linear_preds.clone().iter() {
        if merge_pred as usize == block_idx {
            continue;
        }
        let pred_branch = program.blocks[merge_pred as usize].instructions.last().unwrap();
        // The branch needs to be exec-zero only, otherwise exec gets
        // corrupted.
        if !pred_branch.is_branch()
            || pred_branch.opcode != Opcode::p_cbranch_z
            || pred_branch.operands.is_empty()
            || pred_branch.operands[0].phys_reg() != EXEC
        {
            return;
        }
    }

    // Merge block shape: copy to exec, logical_start, logical_end, branch.
    if program.blocks[merge_idx].instructions.len() != 4
        || !is_empty_block(&program.blocks[merge_idx], true)
    {
        return;
    }
    {
        let execwrite = &program.blocks[merge_idx].instructions[0];
        if !is_simple_copy(execwrite) || execwrite.definitions[0].phys_reg() != EXEC {
            return;
        }
    }

    let wave64 = program.wave_size == 64;
    let andn2 = if wave64 { Opcode::s_andn2_b64 } else { Opcode::s_andn2_b32 };
    let andn2_wrexec =
        if wave64 { Opcode::s_andn2_wrexec_b64 } else { Opcode::s_andn2_wrexec_b32 };

    let execsrc_pos = program.blocks[block_idx].instructions.len() - 2;
    {
        let execsrc = &program.blocks[block_idx].instructions[execsrc_pos];
        let execwrite = &program.blocks[merge_idx].instructions[0];
        if execsrc.opcode != andn2
            || execsrc.definitions[0].phys_reg() != execwrite.operands[0].phys_reg()
            || execsrc.operands[0].phys_reg() != execwrite.operands[0].phys_reg()
            || execsrc.operands[1].phys_reg() != EXEC
        {
            return;
        }
    }

    // Move the s_andn2 to the merge block.
    let execsrc = program.blocks[block_idx].instructions.remove(execsrc_pos);
    program.blocks[merge_idx].instructions.insert(0, execsrc);

    let merge_succ = program.blocks[merge_idx].linear_succs[0];
    {
        let branch = program.blocks[block_idx].instructions.last_mut().unwrap();
        branch.branch_targets_mut()[0] = merge_succ;
        branch.branch_targets_mut()[1] = loopexit_idx as u32;
        branch.opcode = Opcode::p_cbranch_nz;
    }

    {
        let merge_branch = program.blocks[merge_idx].instructions.last_mut().unwrap();
        merge_branch.branch_targets_mut()[0] = merge_idx as u32;
    }
    let merge_len = program.blocks[merge_idx].instructions.len();
    let block_len = program.blocks[block_idx].instructions.len();
    let merge_branch = program.blocks[merge_idx].instructions.remove(merge_len - 1);
    let block_branch = program.blocks[block_idx].instructions.remove(block_len - 1);
    program.blocks[merge_idx].instructions.push(block_branch);
    program.blocks[block_idx].instructions.push(merge_branch);

    program.blocks[block_idx].linear_succs.clear();
    program.blocks[block_idx].linear_succs.push(merge_idx as u32);
    program.blocks[merge_idx].linear_succs.push(loopexit_idx as u32);
    program.blocks[merge_idx].linear_succs.swap(0, 1);
    ctx.blocks_incoming_exec_used[merge_idx] = true;

    for pred in program.blocks[loopexit_idx].linear_preds.iter_mut() {
        if *pred == block_idx as u32 {
            *pred = merge_idx as u32;
        }
    }

    if program.chip_class < ChipClass::Gfx9 {
        return;
    }

    // Combine the s_andn2 and the copy to exec into s_andn2_wrexec.
    let r_exec = program.blocks[merge_idx].instructions.remove(0);
    let mut wr_exec = Instruction::new(andn2_wrexec, Format::SOP1, 2, 3);
    wr_exec.operands[0] = r_exec.operands[0];
    wr_exec.operands[1] = r_exec.operands[1];
    wr_exec.definitions[0] = r_exec.definitions[0];
    wr_exec.definitions[1] = r_exec.definitions[1];
    wr_exec.definitions[2] = Definition::fixed(EXEC, program.lane_mask());
    program.blocks[merge_idx].instructions[0] = wr_exec;
}

fn eliminate_useless_exec_writes_in_block(
    program: &mut Program,
    ctx: &mut JumpThreadingCtx,
    block_idx: usize,
) {
    // Check if any successor needs the outgoing exec mask.
    let block = &program.blocks[block_idx];
    let mut exec_write_used = if block.kind.contains(BlockKind::END_WITH_REGS) {
        // The final block of a program feeding a subsequent shader part
        // must keep its last exec write.
        true
    } else {
        // blocks_incoming_exec_used is initialized to true, so this is
        // correct even for loops.
        block
            .linear_succs
            .iter()
            .any(|&succ| ctx.blocks_incoming_exec_used[succ as usize])
    };

    let mut removed = vec![false; block.instructions.len()];
    for (i, instr) in block.instructions.iter().enumerate().rev() {
        // Information from phis was already accounted for; stop there.
        if instr.is_phi() {
            break;
        }

        let needs_exec = instr.needs_exec_mask() || instr.is_branch();
        let writes_exec = instr.writes_exec();

        if writes_exec && !exec_write_used {
            // Don't eliminate an instruction writing registers other than
            // exec and scc: an s_and_saveexec result may feed a later
            // branch.
            let writes_other = instr
                .definitions
                .iter()
                .any(|def| def.phys_reg() != EXEC && def.phys_reg() != SCC);
            if !writes_other {
                removed[i] = true;
                continue;
            }
        }

        if writes_exec {
            exec_write_used = false;
        }
        exec_write_used |= needs_exec;
    }

    ctx.blocks_incoming_exec_used[block_idx] = exec_write_used;

    if removed.iter().any(|&r| r) {
        let block = &mut program.blocks[block_idx];
        let mut i = 0;
        block.instructions.retain(|_| {
            let keep = !removed[i];
            i += 1;
            keep
        });
    }
}

/// Merge empty blocks, fold invert blocks and drop redundant exec writes.
pub fn jump_threading(program: &mut Program) {
    let mut ctx =
        JumpThreadingCtx { blocks_incoming_exec_used: vec![true; program.blocks.len()] };

    for i in (0..program.blocks.len()).rev() {
        eliminate_useless_exec_writes_in_block(program, &mut ctx, i);

        if program.blocks[i].kind.contains(BlockKind::BREAK) {
            try_merge_break_with_continue(program, &mut ctx, i);
        }

        if program.blocks[i].kind.contains(BlockKind::INVERT) {
            try_remove_invert_block(program, &mut ctx, i);
            continue;
        }

        if program.blocks[i].linear_succs.len() > 1 {
            continue;
        }

        if program.blocks[i].kind.intersects(BlockKind::MERGE | BlockKind::LOOP_EXIT) {
            try_remove_merge_block(program, &ctx, i);
        }

        if program.blocks[i].linear_preds.len() == 1 {
            try_remove_simple_block(program, i);
        }
    }
}

fn remove_linear_successor(program: &mut Program, block_idx: u32, succ_idx: u32) {
    program.blocks[succ_idx as usize].linear_preds.retain(|p| *p != block_idx);
    program.blocks[block_idx as usize].linear_succs.retain(|s| *s != succ_idx);

    if program.blocks[succ_idx as usize].linear_preds.is_empty() {
        // The block became unreachable; recursively remove its successors.
        program.blocks[succ_idx as usize].instructions.clear();
        let succs = program.blocks[succ_idx as usize].linear_succs.clone();
        for s in succs {
            remove_linear_successor(program, succ_idx, s);
        }
    }
}

/// Check if the branch instruction can be removed: executing the next block
/// with an empty exec mask can be faster than the branch itself.
fn can_remove_branch(program: &Program, block_idx: u32, branch: &Instruction) -> bool {
    let (targets, rarely_taken, never_taken) = branch.branch();
    let target = targets[0];
    let uniform_branch = !(matches!(branch.opcode, Opcode::p_cbranch_z | Opcode::p_cbranch_nz)
        && branch.operands[0].phys_reg() == EXEC);

    if never_taken {
        return true;
    }

    // Back edges cannot be removed.
    if block_idx >= target {
        return false;
    }

    let prefer_remove = rarely_taken;
    let mut num_scalar = 0u32;
    let mut num_vector = 0u32;

    // Check the instructions between the branch and the target.
    for i in block_idx as usize + 1..target as usize {
        // Uniform conditional branches must not jump over actual
        // instructions.
        if uniform_branch && !program.blocks[i].instructions.is_empty() {
            return false;
        }

        for instr in &program.blocks[i].instructions {
            if instr.format.base() == Format::SOPP {
                // Discard early exits and loop breaks/continues work fine
                // with an empty exec mask.
                if matches!(
                    instr.opcode,
                    Opcode::s_cbranch_scc0
                        | Opcode::s_cbranch_scc1
                        | Opcode::s_cbranch_execz
                        | Opcode::s_cbranch_execnz
                ) {
                    let is_break_continue = program.blocks[i]
                        .kind
                        .intersects(BlockKind::BREAK | BlockKind::CONTINUE);
                    let discard_early_exit = match &instr.data {
                        crate::ir::InstrData::Sopp { block: Some(b), .. } => program.blocks
                            [*b as usize]
                            .kind
                            .contains(BlockKind::DISCARD_EARLY_EXIT),
                        _ => false,
                    };
                    if is_break_continue || discard_early_exit {
                        continue;
                    }
                }
                return false;
            } else if instr.is_salu() {
                num_scalar += 1;
            } else if instr.is_valu() || instr.format.base() == Format::VINTRP {
                if matches!(
                    instr.opcode,
                    Opcode::v_writelane_b32 | Opcode::v_writelane_b32_e64
                ) {
                    // writelane ignores exec; writing inactive lanes is
                    // undefined behavior.
                    return false;
                }
                num_vector += 1;
                // VALU writing SGPRs is always executed on GFX10+.
                if program.chip_class >= ChipClass::Gfx10 {
                    for def in &instr.definitions {
                        if def.reg_class().ty() == RegType::Sgpr {
                            num_scalar += 1;
                        }
                    }
                }
            } else if instr.format.base() == Format::EXP
                || instr.format.base() == Format::SMEM
                || instr.format.base() == Format::PSEUDO_BARRIER
            {
                // Exports with exec=0 can hang, SMEM might access invalid
                // addresses and barriers are expensive.
                return false;
            } else if instr.is_vmem()
                || instr.is_flat_like()
                || instr.format.base() == Format::DS
            {
                if !prefer_remove {
                    return false;
                }
            } else if instr.format.base() == Format::PSEUDO {
                // Copies and markers that have not been expanded yet count
                // by their register bank.
                match instr.opcode {
                    Opcode::p_logical_start | Opcode::p_logical_end => {}
                    _ => {
                        for def in &instr.definitions {
                            if def.reg_class().ty() == RegType::Vgpr {
                                num_vector += 1;
                            } else {
                                num_scalar += 1;
                            }
                        }
                    }
                }
            } else {
                return false;
            }

            if !prefer_remove {
                let est_cycles = if program.chip_class >= ChipClass::Gfx10 {
                    num_scalar * 2 + num_vector
                } else {
                    num_scalar * 4 + num_vector * 4
                };
                if est_cycles > 16 {
                    return false;
                }
            }
        }
    }

    true
}

fn lower_branch_instruction(program: &mut Program, block_idx: u32) -> CodegenResult<()> {
    let last_is_branch = program.blocks[block_idx as usize]
        .instructions
        .last()
        .map(|instr| instr.is_branch())
        .unwrap_or(false);
    if !last_is_branch {
        return Ok(());
    }

    let branch = program.blocks[block_idx as usize].instructions.pop().unwrap();
    let target = branch.branch_target();

    if can_remove_branch(program, block_idx, &branch) {
        if branch.opcode != Opcode::p_branch {
            remove_linear_successor(program, block_idx, target);
        }
        return Ok(());
    }

    // Emit the concrete branch instruction.
    let mut instrs = std::mem::take(&mut program.blocks[block_idx as usize].instructions);
    {
        let mut bld = Builder::new(program, &mut instrs);
        match branch.opcode {
            Opcode::p_branch => {
                bld.sopp(Opcode::s_branch, Some(target), 0);
            }
            Opcode::p_cbranch_nz => {
                let reg = branch.operands[0].phys_reg();
                if reg == EXEC {
                    bld.sopp(Opcode::s_cbranch_execnz, Some(target), 0);
                } else if reg == crate::ir::VCC {
                    bld.sopp(Opcode::s_cbranch_vccnz, Some(target), 0);
                } else if reg == SCC {
                    bld.sopp(Opcode::s_cbranch_scc1, Some(target), 0);
                } else {
                    return Err(CodegenError::Unreachable("conditional branch source"));
                }
            }
            Opcode::p_cbranch_z => {
                let reg = branch.operands[0].phys_reg();
                if reg == EXEC {
                    bld.sopp(Opcode::s_cbranch_execz, Some(target), 0);
                } else if reg == crate::ir::VCC {
                    bld.sopp(Opcode::s_cbranch_vccz, Some(target), 0);
                } else if reg == SCC {
                    bld.sopp(Opcode::s_cbranch_scc0, Some(target), 0);
                } else {
                    return Err(CodegenError::Unreachable("conditional branch source"));
                }
            }
            _ => return Err(CodegenError::Unreachable("pseudo branch opcode")),
        }
    }
    program.blocks[block_idx as usize].instructions = instrs;
    Ok(())
}

/// Convert each remaining pseudo branch into the concrete branch opcode, or
/// remove it when the skipped instructions tolerate a zero exec mask and
/// cost less than the jump.
pub fn lower_branches(program: &mut Program) -> CodegenResult<()> {
    for i in (0..program.blocks.len() as u32).rev() {
        lower_branch_instruction(program, i)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ChipClass, PhysReg, RegClass, Stage};

    fn linked_blocks(n: u32, edges: &[(u32, u32)]) -> Program {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        for _ in 0..n {
            program.create_and_insert_block();
        }
        for &(from, to) in edges {
            program.blocks[from as usize].linear_succs.push(to);
            program.blocks[to as usize].linear_preds.push(from);
        }
        for block in &mut program.blocks {
            block.linear_preds.sort_unstable();
            block.linear_succs.sort_unstable();
        }
        program
    }

    #[test]
    fn useless_exec_write_is_removed() {
        let mut program = linked_blocks(1, &[]);
        let saved = program.alloc_tmp(RegClass::S2);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            // Write exec; nothing after it reads exec.
            let ed = Definition::fixed(EXEC, RegClass::S2);
            bld.sop1(Opcode::s_mov_b64, &[ed], &[Operand::temp(saved)]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        jump_threading(&mut program);

        assert_eq!(program.blocks[0].instructions.len(), 1);
        assert_eq!(program.blocks[0].instructions[0].opcode, Opcode::s_endpgm);
    }

    #[test]
    fn exec_write_with_other_results_survives() {
        let mut program = linked_blocks(1, &[]);
        let cond = program.alloc_tmp(RegClass::S2);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let saved = bld.def(RegClass::S2);
            let scc = bld.def_fixed(RegClass::S1, SCC);
            let ed = Definition::fixed(EXEC, RegClass::S2);
            let eop = Operand::fixed(EXEC, RegClass::S2);
            bld.sop1(
                Opcode::s_and_saveexec_b64,
                &[saved, scc, ed],
                &[Operand::temp(cond), eop],
            );
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        jump_threading(&mut program);

        assert_eq!(program.blocks[0].instructions.len(), 2);
        assert_eq!(program.blocks[0].instructions[0].opcode, Opcode::s_and_saveexec_b64);
    }

    #[test]
    fn empty_block_is_spliced_out() {
        // 0 -> 1 -> 2, block 1 contains only identity copies and a branch.
        let mut program = linked_blocks(3, &[(0, 1), (1, 2)]);
        for (idx, target) in [(0usize, 1u32), (1, 2)] {
            let mut instrs = Vec::new();
            {
                let mut bld = Builder::new(&mut program, &mut instrs);
                if idx == 1 {
                    let mut pc = Instruction::new(
                        Opcode::p_parallelcopy,
                        Format::PSEUDO,
                        1,
                        1,
                    );
                    pc.definitions[0] = Definition::fixed(PhysReg(5), RegClass::S1);
                    pc.operands[0] = Operand::fixed(PhysReg(5), RegClass::S1);
                    bld.insert(pc);
                }
                bld.branch(Opcode::p_branch, None, target, target);
            }
            program.blocks[idx].instructions = instrs;
        }
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[2].instructions = instrs;

        jump_threading(&mut program);

        assert!(program.blocks[1].instructions.is_empty());
        assert!(program.blocks[1].linear_preds.is_empty());
        assert_eq!(program.blocks[0].linear_succs[0], 2);
        assert_eq!(program.blocks[2].linear_preds[0], 0);
        assert_eq!(program.blocks[0].instructions.last().unwrap().branch_target(), 2);
    }

    #[test]
    fn short_forward_branch_is_removed() {
        // 0 -> {1, 2}; branch over one cheap VALU instruction in block 1.
        let mut program = linked_blocks(3, &[(0, 1), (0, 2), (1, 2)]);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let eop = Operand::fixed(EXEC, RegClass::S2);
            bld.branch(Opcode::p_cbranch_z, Some(eop), 2, 1);
        }
        program.blocks[0].instructions = instrs;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = Definition::fixed(PhysReg(256), RegClass::V1);
            bld.vop1(Opcode::v_mov_b32, &[d], &[Operand::c32(0)]);
        }
        program.blocks[1].instructions = instrs;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[2].instructions = instrs;

        lower_branches(&mut program).unwrap();

        // The exec-conditional branch is gone entirely.
        assert!(program.blocks[0].instructions.is_empty());
        // Block 2 is still reachable through the fall-through path.
        assert!(!program.blocks[2].instructions.is_empty());
    }

    #[test]
    fn long_skip_keeps_the_branch() {
        let mut program = linked_blocks(3, &[(0, 1), (0, 2), (1, 2)]);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let eop = Operand::fixed(EXEC, RegClass::S2);
            bld.branch(Opcode::p_cbranch_z, Some(eop), 2, 1);
        }
        program.blocks[0].instructions = instrs;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            for _ in 0..8 {
                let d = Definition::fixed(PhysReg(4), RegClass::S1);
                bld.sop1(Opcode::s_mov_b32, &[d], &[Operand::c32(0)]);
            }
        }
        program.blocks[1].instructions = instrs;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[2].instructions = instrs;

        lower_branches(&mut program).unwrap();

        let branch = program.blocks[0].instructions.last().unwrap();
        assert_eq!(branch.opcode, Opcode::s_cbranch_execz);
        match &branch.data {
            crate::ir::InstrData::Sopp { block, .. } => assert_eq!(*block, Some(2)),
            _ => panic!("branch must be SOPP"),
        }
    }

    #[test]
    fn threading_is_idempotent() {
        let mut program = linked_blocks(3, &[(0, 1), (1, 2)]);
        for (idx, target) in [(0usize, 1u32), (1, 2)] {
            let mut instrs = Vec::new();
            {
                let mut bld = Builder::new(&mut program, &mut instrs);
                bld.branch(Opcode::p_branch, None, target, target);
            }
            program.blocks[idx].instructions = instrs;
        }
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[2].instructions = instrs;

        jump_threading(&mut program);
        let layout: Vec<_> =
            program.blocks.iter().map(|b| (b.linear_preds.clone(), b.linear_succs.clone())).collect();
        jump_threading(&mut program);
        let layout2: Vec<_> =
            program.blocks.iter().map(|b| (b.linear_preds.clone(), b.linear_succs.clone())).collect();
        assert_eq!(layout, layout2);
    }
}
