//! Structural and register-allocation validation.
//!
//! The structural checks cover per-format operand and definition shapes,
//! literal-count limits, the scalar-bus limit of VALU encodings, sortedness
//! of the CFG edge lists, the critical-edge ban and phi arities. The RA
//! checks verify that every value has a physical register, that ranges are
//! in bounds and that no two simultaneously live values share a byte. Both
//! run only when the corresponding configuration flag is set; a failure is a
//! fatal compilation error carrying a rendered diagnostic.

use crate::fx::FxHashMap;
use crate::ir::{
    ChipClass, Format, InstrData, Instruction, Opcode, Program, RegClass, RegType, regs_intersect,
    EXEC_LO, M0, SCC, VCC, VCC_HI,
};
use crate::live_vars::live_var_analysis;
use crate::{CodegenError, CodegenResult};

struct Checker {
    errors: Vec<String>,
}

impl Checker {
    fn check(&mut self, ok: bool, msg: &str, instr: &Instruction) {
        if !ok {
            self.errors.push(format!("{msg}: {instr}"));
        }
    }

    fn check_block(&mut self, ok: bool, msg: &str, block: u32) {
        if !ok {
            self.errors.push(format!("{msg}: BB{block}"));
        }
    }

    fn finish(self) -> CodegenResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CodegenError::Verifier(self.errors.join("\n")))
        }
    }
}

fn base_format(instr: &Instruction) -> Format {
    let base = instr.format.base();
    if base == Format::PSEUDO && instr.is_vop3() {
        Format::VOP3
    } else {
        base
    }
}

fn check_instruction(chk: &mut Checker, program: &Program, block: &crate::ir::Block, instr: &Instruction) {
    let chip = program.chip_class;

    // Base format must agree with the opcode table.
    chk.check(
        base_format(instr) == instr.opcode.info().format,
        "Wrong base format for instruction",
        instr,
    );

    // VOP3 is an encoding of VALU and VINTRP bases only.
    if instr.is_vop3() && instr.opcode.info().format != Format::VOP3 {
        chk.check(
            matches!(base_format(instr), Format::VOP2 | Format::VOP1 | Format::VOPC | Format::VINTRP),
            "Format cannot have VOP3 applied",
            instr,
        );
    }

    if instr.is_sdwa() {
        chk.check(
            matches!(base_format(instr), Format::VOP2 | Format::VOP1 | Format::VOPC),
            "Format cannot have SDWA applied",
            instr,
        );
        chk.check(chip >= ChipClass::Gfx8, "SDWA is GFX8+ only", instr);
    }

    if let InstrData::Vop3 { opsel, .. } = &instr.data {
        chk.check(
            !opsel.iter().any(|&b| b) || chip >= ChipClass::Gfx9,
            "Opsel is only supported on GFX9+",
            instr,
        );
    }

    // Undefined operands are only legal in specific positions.
    for (i, op) in instr.operands.iter().enumerate() {
        if !op.is_undefined() {
            continue;
        }
        let flat = instr.is_flat_like();
        let can_be_undef = instr.is_phi()
            || instr.format.base() == Format::EXP
            || instr.format.base() == Format::PSEUDO_REDUCTION
            || instr.opcode == Opcode::p_create_vector
            || (flat && i == 1)
            || (instr.format.base() == Format::MIMG && i == 1)
            || (instr.is_vmem() && instr.format.base() != Format::MIMG && i == 0);
        chk.check(can_be_undef, "Undefs can only be used in certain operands", instr);
    }

    // Subdword definitions only exist for SDWA and pseudo instructions.
    for def in &instr.definitions {
        if def.reg_class().is_subdword() {
            chk.check(
                instr.is_sdwa() || instr.format.base() == Format::PSEUDO,
                "Only SDWA and Pseudo instructions can write subdword registers",
                instr,
            );
        }
    }

    if instr.is_salu() || instr.is_valu() {
        // Literal rules.
        let mut literal: Option<u32> = None;
        for (i, op) in instr.operands.iter().enumerate() {
            if !op.is_literal() {
                continue;
            }
            chk.check(
                instr.format.can_take_literal(chip),
                "Literal applied on wrong instruction format",
                instr,
            );
            chk.check(
                literal.is_none() || literal == Some(op.constant_value()),
                "Only 1 literal allowed",
                instr,
            );
            literal = Some(op.constant_value());
            chk.check(
                !instr.is_valu() || instr.is_vop3() || i == 0 || i == 2,
                "Wrong source position for literal argument",
                instr,
            );
        }

        if instr.is_valu() {
            let const_bus_limit = if chip >= ChipClass::Gfx10 { 2 } else { 1 };
            let scalar_mask: u32 = if instr.is_vop3() { 0x7 } else { 0x5 };

            chk.check(
                instr.definitions.is_empty()
                    || instr.definitions[0].reg_class().ty() == RegType::Vgpr
                    || instr.is_vopc()
                    || matches!(
                        instr.opcode,
                        Opcode::v_readfirstlane_b32
                            | Opcode::v_readlane_b32
                            | Opcode::v_readlane_b32_e64
                    ),
                "Wrong definition type for VALU instruction",
                instr,
            );

            let mut sgpr_ids: Vec<u32> = Vec::new();
            for (i, op) in instr.operands.iter().enumerate() {
                if matches!(
                    instr.opcode,
                    Opcode::v_readfirstlane_b32
                        | Opcode::v_readlane_b32
                        | Opcode::v_readlane_b32_e64
                        | Opcode::v_writelane_b32
                        | Opcode::v_writelane_b32_e64
                ) {
                    chk.check(!op.is_literal(), "No literal allowed on lane instructions", instr);
                    continue;
                }
                if op.is_temp() && op.reg_class().ty() == RegType::Sgpr {
                    chk.check(
                        scalar_mask & (1 << i) != 0,
                        "Wrong source position for SGPR argument",
                        instr,
                    );
                    if !sgpr_ids.contains(&op.temp_id()) {
                        sgpr_ids.push(op.temp_id());
                    }
                }
                if op.is_constant() && !op.is_literal() {
                    chk.check(
                        scalar_mask & (1 << i) != 0,
                        "Wrong source position for constant argument",
                        instr,
                    );
                }
            }
            chk.check(
                sgpr_ids.len() + literal.is_some() as usize <= const_bus_limit,
                "Too many SGPRs/literals",
                instr,
            );
        }

        if matches!(instr.format.base(), Format::SOP1 | Format::SOP2) && !instr.definitions.is_empty()
        {
            chk.check(
                instr.definitions[0].reg_class().ty() == RegType::Sgpr,
                "Wrong definition type for SALU instruction",
                instr,
            );
            for op in &instr.operands {
                chk.check(
                    op.is_constant() || !op.is_of_type(RegType::Vgpr),
                    "Wrong operand type for SALU instruction",
                    instr,
                );
            }
        }
    }

    match instr.format.base() {
        Format::PSEUDO => match instr.opcode {
            Opcode::p_create_vector => {
                let size: u32 = instr.operands.iter().map(|op| op.bytes()).sum();
                chk.check(
                    size == instr.definitions[0].bytes(),
                    "Definition size does not match operand sizes",
                    instr,
                );
                if instr.definitions[0].reg_class().ty() == RegType::Sgpr {
                    for op in &instr.operands {
                        chk.check(
                            op.is_constant() || !op.is_of_type(RegType::Vgpr),
                            "Wrong operand type for scalar vector",
                            instr,
                        );
                    }
                }
            }
            Opcode::p_extract_vector => {
                chk.check(
                    instr.operands[0].is_temp() && instr.operands[1].is_constant(),
                    "Wrong operand types",
                    instr,
                );
                chk.check(
                    instr.operands[1].constant_value() < instr.operands[0].size(),
                    "Index out of range",
                    instr,
                );
                chk.check(
                    instr.definitions[0].reg_class().ty() == RegType::Vgpr
                        || instr.operands[0].reg_class().ty() == RegType::Sgpr,
                    "Cannot extract SGPR value from VGPR vector",
                    instr,
                );
            }
            Opcode::p_parallelcopy => {
                chk.check(
                    instr.definitions.len() == instr.operands.len(),
                    "Number of operands does not match number of definitions",
                    instr,
                );
                for (def, op) in instr.definitions.iter().zip(&instr.operands) {
                    if op.is_temp() {
                        chk.check(
                            def.reg_class().ty() == op.reg_class().ty()
                                || (def.reg_class().ty() == RegType::Vgpr
                                    && op.reg_class().ty() == RegType::Sgpr),
                            "Operand and definition types do not match",
                            instr,
                        );
                    }
                }
            }
            Opcode::p_phi => {
                chk.check(
                    instr.operands.len() == block.logical_preds.len(),
                    "Number of operands does not match number of predecessors",
                    instr,
                );
                chk.check(
                    instr.definitions[0].reg_class().ty() == RegType::Vgpr
                        || instr.definitions[0].reg_class() == program.lane_mask(),
                    "Logical phi definition must be vgpr or divergent boolean",
                    instr,
                );
            }
            Opcode::p_linear_phi => {
                for op in &instr.operands {
                    chk.check(
                        !op.is_temp() || op.reg_class().is_linear(),
                        "Wrong operand type",
                        instr,
                    );
                }
                chk.check(
                    instr.operands.len() == block.linear_preds.len(),
                    "Number of operands does not match number of predecessors",
                    instr,
                );
            }
            _ => {}
        },
        Format::SMEM => {
            if !instr.operands.is_empty() {
                chk.check(
                    instr.operands[0].is_temp() || instr.operands[0].is_fixed(),
                    "SMEM operands must be sgpr",
                    instr,
                );
                chk.check(
                    !instr.operands[0].is_of_type(RegType::Vgpr),
                    "SMEM operands must be sgpr",
                    instr,
                );
            }
            if instr.operands.len() >= 2 {
                chk.check(
                    instr.operands[1].is_constant() || !instr.operands[1].is_of_type(RegType::Vgpr),
                    "SMEM offset must be constant or sgpr",
                    instr,
                );
            }
            if !instr.definitions.is_empty() {
                chk.check(
                    instr.definitions[0].reg_class().ty() == RegType::Sgpr,
                    "SMEM result must be sgpr",
                    instr,
                );
            }
        }
        Format::MTBUF | Format::MUBUF => {
            chk.check(
                instr.operands.len() > 1,
                "VMEM instructions must have at least one operand",
                instr,
            );
            if instr.operands.len() > 1 {
                chk.check(
                    !instr.operands[0].is_of_type(RegType::Sgpr),
                    "VADDR must be in vgpr for VMEM instructions",
                    instr,
                );
                chk.check(
                    instr.operands[1].is_of_type(RegType::Sgpr),
                    "VMEM resource constant must be sgpr",
                    instr,
                );
            }
            if instr.operands.len() > 3 {
                chk.check(
                    instr.operands[3].is_of_type(RegType::Vgpr),
                    "VMEM write data must be vgpr",
                    instr,
                );
            }
        }
        Format::MIMG => {
            chk.check(instr.operands.len() >= 3, "MIMG instructions must have 3 operands", instr);
            if instr.operands.len() >= 3 {
                chk.check(
                    instr.operands[1].has_reg_class()
                        && matches!(instr.operands[1].size(), 4 | 8),
                    "MIMG operands[1] (resource constant) must be 4 or 8 SGPRs",
                    instr,
                );
                chk.check(
                    instr.operands[0].is_of_type(RegType::Vgpr),
                    "MIMG operands[0] (VADDR) must be VGPR",
                    instr,
                );
            }
            if !instr.definitions.is_empty() {
                chk.check(
                    instr.definitions[0].reg_class().ty() == RegType::Vgpr,
                    "MIMG definitions[0] (VDATA) must be VGPR",
                    instr,
                );
            }
        }
        Format::DS => {
            for op in &instr.operands {
                chk.check(
                    op.is_of_type(RegType::Vgpr) || op.phys_reg() == M0,
                    "Only VGPRs are valid DS instruction operands",
                    instr,
                );
            }
            if !instr.definitions.is_empty() {
                chk.check(
                    instr.definitions[0].reg_class().ty() == RegType::Vgpr,
                    "DS instruction must return VGPR",
                    instr,
                );
            }
        }
        Format::EXP => {
            chk.check(instr.operands.len() == 4, "Export needs 4 operands", instr);
            for op in &instr.operands {
                chk.check(
                    op.is_undefined() || op.is_of_type(RegType::Vgpr),
                    "Only VGPRs are valid export arguments",
                    instr,
                );
            }
        }
        Format::FLAT => {
            chk.check(
                instr.operands.len() < 2 || instr.operands[1].is_undefined(),
                "Flat instructions don't support SADDR",
                instr,
            );
        }
        Format::GLOBAL | Format::SCRATCH => {
            chk.check(
                instr.operands[0].is_of_type(RegType::Vgpr),
                "FLAT/GLOBAL/SCRATCH address must be vgpr",
                instr,
            );
            if !instr.definitions.is_empty() {
                chk.check(
                    instr.definitions[0].reg_class().ty() == RegType::Vgpr,
                    "FLAT/GLOBAL/SCRATCH result must be vgpr",
                    instr,
                );
            } else if instr.operands.len() >= 3 {
                chk.check(
                    instr.operands[2].is_of_type(RegType::Vgpr),
                    "FLAT/GLOBAL/SCRATCH data must be vgpr",
                    instr,
                );
            }
        }
        _ => {}
    }
}

/// Run the structural checks.
pub fn validate(program: &Program) -> CodegenResult<()> {
    if !program.config.validate {
        return Ok(());
    }

    let mut chk = Checker { errors: Vec::new() };

    for block in &program.blocks {
        for instr in &block.instructions {
            check_instruction(&mut chk, program, block, instr);
        }
    }

    // CFG checks.
    for (i, block) in program.blocks.iter().enumerate() {
        chk.check_block(block.index == i as u32, "block.index must match actual index", i as u32);

        for w in block.linear_preds.windows(2) {
            chk.check_block(w[0] < w[1], "linear predecessors must be sorted", block.index);
        }
        for w in block.logical_preds.windows(2) {
            chk.check_block(w[0] < w[1], "logical predecessors must be sorted", block.index);
        }
        for w in block.linear_succs.windows(2) {
            chk.check_block(w[0] < w[1], "linear successors must be sorted", block.index);
        }
        for w in block.logical_succs.windows(2) {
            chk.check_block(w[0] < w[1], "logical successors must be sorted", block.index);
        }

        // Critical edges are not allowed.
        if block.linear_preds.len() > 1 {
            for &pred in &block.linear_preds {
                chk.check_block(
                    program.blocks[pred as usize].linear_succs.len() == 1,
                    "linear critical edges are not allowed",
                    pred,
                );
            }
            for &pred in &block.logical_preds {
                chk.check_block(
                    program.blocks[pred as usize].logical_succs.len() == 1,
                    "logical critical edges are not allowed",
                    pred,
                );
            }
        }
    }

    chk.finish()
}

fn reg_in_bounds(program: &Program, reg: u32, size: u32, rc: RegClass) -> bool {
    match rc.ty() {
        RegType::Vgpr => reg >= 256 && reg + size <= 256 + program.config.num_vgprs,
        RegType::Sgpr => {
            // Special scalar registers are individually addressable.
            let special = [VCC.reg(), VCC_HI.reg(), M0.reg(), EXEC_LO.reg(), EXEC_LO.reg() + 1, SCC.reg(), crate::ir::SGPR_NULL.reg()];
            reg + size <= program.config.num_sgprs
                || (0..size).all(|k| special.contains(&(reg + k)))
        }
    }
}

/// Run the register-allocation checks.
pub fn validate_ra(program: &mut Program) -> CodegenResult<()> {
    if !program.config.validate_ra {
        return Ok(());
    }

    let mut errors: Vec<String> = Vec::new();
    let mut assignments: FxHashMap<u32, (u32, RegClass)> = FxHashMap::default();

    for block in &program.blocks {
        for instr in &block.instructions {
            for op in &instr.operands {
                if op.is_temp() {
                    if !op.is_fixed() {
                        errors.push(format!("operand has no register: {instr}"));
                        continue;
                    }
                    if !reg_in_bounds(program, op.phys_reg().reg(), op.size(), op.reg_class()) {
                        errors.push(format!("operand register out of bounds: {instr}"));
                    }
                    if !program.config.needs_vcc
                        && regs_intersect(op.phys_reg(), op.size(), VCC, 2)
                    {
                        errors.push(format!("vcc used but needs_vcc=false: {instr}"));
                    }
                }
            }
            for def in &instr.definitions {
                if def.is_temp() {
                    if !def.is_fixed() {
                        errors.push(format!("definition has no register: {instr}"));
                        continue;
                    }
                    if !reg_in_bounds(program, def.phys_reg().reg(), def.size(), def.reg_class()) {
                        errors.push(format!("definition register out of bounds: {instr}"));
                    }
                    assignments.insert(def.temp_id(), (def.phys_reg().reg(), def.reg_class()));
                }
            }
        }
    }

    // No two simultaneously live values may share a byte. Walk each block
    // backwards with the live set and test every definition against it.
    let live = live_var_analysis(program);
    for block in &program.blocks {
        let mut live_now: Vec<u32> = Vec::new();
        for &succ_live in live.live_in.iter().enumerate().filter_map(|(i, s)| {
            if block.linear_succs.contains(&(i as u32)) || block.logical_succs.contains(&(i as u32))
            {
                Some(s)
            } else {
                None
            }
        }).flat_map(|s| s.iter()) {
            if !live_now.contains(&succ_live) {
                live_now.push(succ_live);
            }
        }

        for instr in block.instructions.iter().rev() {
            for def in &instr.definitions {
                if !def.is_temp() || !def.is_fixed() {
                    continue;
                }
                live_now.retain(|&id| id != def.temp_id());
                for &other in &live_now {
                    if let Some(&(other_reg, other_rc)) = assignments.get(&other) {
                        if other_rc.ty() == def.reg_class().ty()
                            && regs_intersect(
                                def.phys_reg(),
                                def.size(),
                                crate::ir::PhysReg(other_reg),
                                other_rc.size(),
                            )
                        {
                            errors.push(format!(
                                "definition overlaps live value %{other}: {instr}"
                            ));
                        }
                    }
                }
            }
            for op in &instr.operands {
                if op.is_temp() && !live_now.contains(&op.temp_id()) {
                    live_now.push(op.temp_id());
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CodegenError::Verifier(errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Definition, Operand, PhysReg, Stage};

    fn strict_program() -> Program {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        program.config.validate = true;
        program.config.validate_ra = true;
        program.create_and_insert_block();
        program
    }

    #[test]
    fn unsorted_predecessors_are_rejected() {
        let mut program = strict_program();
        program.create_and_insert_block();
        program.blocks[1].linear_preds.push(0);
        program.blocks[1].linear_preds.push(0);
        assert!(matches!(validate(&program), Err(CodegenError::Verifier(_))));
    }

    #[test]
    fn critical_edge_is_rejected() {
        // 0 -> {1, 2}, 1 has two preds {0, 2}: edge 0->1 is critical.
        let mut program = strict_program();
        program.create_and_insert_block();
        program.create_and_insert_block();
        program.blocks[0].linear_succs.push(1);
        program.blocks[0].linear_succs.push(2);
        program.blocks[1].linear_preds.push(0);
        program.blocks[2].linear_preds.push(0);
        program.blocks[2].linear_succs.push(1);
        program.blocks[1].linear_preds.push(2);
        assert!(matches!(validate(&program), Err(CodegenError::Verifier(_))));
    }

    #[test]
    fn two_literals_are_rejected() {
        let mut program = strict_program();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = bld.def(RegClass::S1);
            bld.sop2(
                Opcode::s_add_u32,
                &[d],
                &[Operand::c32(0x12345), Operand::c32(0x54321)],
            );
        }
        program.blocks[0].instructions = instrs;
        assert!(matches!(validate(&program), Err(CodegenError::Verifier(_))));
    }

    #[test]
    fn vop2_literal_in_src1_is_rejected() {
        let mut program = strict_program();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = bld.def(RegClass::V1);
            let v = bld.tmp(RegClass::V1);
            bld.vop2(Opcode::v_add_f32, &[d], &[Operand::temp(v), Operand::c32(0x12345)]);
        }
        program.blocks[0].instructions = instrs;
        assert!(matches!(validate(&program), Err(CodegenError::Verifier(_))));
    }

    #[test]
    fn subdword_def_outside_pseudo_is_rejected() {
        let mut program = strict_program();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = bld.def(RegClass::vgpr_bytes(2));
            bld.vop1(Opcode::v_mov_b32, &[d], &[Operand::c32(0)]);
        }
        program.blocks[0].instructions = instrs;
        assert!(matches!(validate(&program), Err(CodegenError::Verifier(_))));
    }

    #[test]
    fn clean_program_passes() {
        let mut program = strict_program();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = Definition::fixed_temp(bld.tmp(RegClass::V1), PhysReg(256));
            bld.vop1(Opcode::v_mov_b32, &[d], &[Operand::c32(0)]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;
        assert!(validate(&program).is_ok());
        assert!(validate_ra(&mut program).is_ok());
    }

    #[test]
    fn overlapping_live_values_are_rejected() {
        let mut program = strict_program();
        let a = program.alloc_tmp(RegClass::V2);
        let b = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            // a occupies v0-v1, b lands on v1 while a is still live.
            let da = Definition::fixed_temp(a, PhysReg(256));
            bld.pseudo(Opcode::p_parallelcopy, &[da], &[Operand::undef(RegClass::V2)]);
            let db = Definition::fixed_temp(b, PhysReg(257));
            bld.vop1(Opcode::v_mov_b32, &[db], &[Operand::c32(0)]);
            let mut store =
                Instruction::new(Opcode::buffer_store_dword, Format::MUBUF, 4, 0);
            store.operands[0] = Operand::undef(RegClass::V1);
            store.operands[1] = Operand::fixed_temp(bld.tmp(RegClass::S4), PhysReg(8));
            store.operands[2] = Operand::fixed_temp(a, PhysReg(256));
            store.operands[3] = Operand::fixed_temp(b, PhysReg(257));
            bld.insert(store);
        }
        program.blocks[0].instructions = instrs;
        assert!(matches!(validate_ra(&mut program), Err(CodegenError::Verifier(_))));
    }
}
