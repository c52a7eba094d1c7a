//! Dominator-tree value numbering.
//!
//! Implements the algorithm from "Value Numbering" by Briggs, Cooper, and
//! Simpson: each block inherits the expression table of its immediate
//! dominator, so structurally equal instructions whose first occurrence
//! dominates the second collapse into one. Copy instructions feed a rename
//! map instead of the table. Comparisons in vector form depend on the exec
//! mask and memory instructions on ordering, so those are never numbered.

use crate::fx::FxHashMap;
use crate::ir::{Format, InstrData, Instruction, Opcode, Program, Temp, EXEC_LO};

/// Expression table: structural hash to the candidate instructions with that
/// hash. Values are clones; the rename map is what rewrites the program.
type ExprSet = FxHashMap<u64, Vec<Instruction>>;

fn hash_instr(instr: &Instruction) -> u64 {
    let mut hash = instr.opcode as u64;
    for (i, op) in instr.operands.iter().enumerate() {
        let val: u64 = if op.is_temp() {
            op.temp_id() as u64
        } else if op.is_fixed() {
            op.phys_reg().reg() as u64
        } else if op.is_constant() {
            op.constant_value() as u64
        } else {
            0
        };
        hash |= val << ((i as u64 + 1) * 8);
    }
    if let InstrData::Vop3 { abs, neg, opsel, clamp, omod } = &instr.data {
        for i in 0..3 {
            hash ^= (abs[i] as u64) << (i * 3);
            hash ^= (opsel[i] as u64) << (i * 3 + 1);
            hash ^= (neg[i] as u64) << (i * 3 + 2);
        }
        hash ^= (*clamp as u64) << 28;
        hash = hash.wrapping_add((*omod as u64) << 19);
    }
    if let InstrData::Vintrp { attribute, component } = &instr.data {
        hash ^= (*attribute as u64) << 13;
        hash ^= (*component as u64) << 27;
    }
    hash
}

fn operands_equal(a: &Instruction, b: &Instruction) -> bool {
    for (op_a, op_b) in a.operands.iter().zip(&b.operands) {
        if op_a.is_constant() {
            if !op_b.is_constant() || op_a.constant_value64() != op_b.constant_value64() {
                return false;
            }
        } else if op_a.is_temp() {
            if !op_b.is_temp() || op_a.temp_id() != op_b.temp_id() {
                return false;
            }
        } else if op_a.is_undefined() != op_b.is_undefined() {
            return false;
        }
        if op_a.is_fixed() {
            // Exec reads change value between occurrences.
            if op_a.phys_reg() == EXEC_LO {
                return false;
            }
            if !op_b.is_fixed() || op_a.phys_reg() != op_b.phys_reg() {
                return false;
            }
        }
    }
    true
}

fn definitions_equal(a: &Instruction, b: &Instruction) -> bool {
    for (def_a, def_b) in a.definitions.iter().zip(&b.definitions) {
        if def_a.is_temp() {
            if !def_b.is_temp() || def_a.reg_class() != def_b.reg_class() {
                return false;
            }
        }
        if def_a.is_fixed() && (!def_b.is_fixed() || def_a.phys_reg() != def_b.phys_reg()) {
            return false;
        }
    }
    true
}

fn instr_equal(a: &Instruction, b: &Instruction) -> bool {
    if a.format != b.format || a.opcode != b.opcode {
        return false;
    }
    if a.operands.len() != b.operands.len() || a.definitions.len() != b.definitions.len() {
        // Possible with pseudo instructions.
        return false;
    }
    if !operands_equal(a, b) || !definitions_equal(a, b) {
        return false;
    }
    if a.format.base() == Format::PSEUDO_BRANCH || a.format.base() == Format::PSEUDO_REDUCTION {
        return false;
    }
    if a.is_vopc() {
        // The result depends on the exec mask; never number these.
        return false;
    }
    match (&a.data, &b.data) {
        (
            InstrData::Smem { glc: glc_a, nv: nv_a, can_reorder: ro_a, .. },
            InstrData::Smem { glc: glc_b, nv: nv_b, can_reorder: ro_b, .. },
        ) => *ro_a && *ro_b && glc_a == glc_b && nv_a == nv_b,
        (InstrData::Mimg { can_reorder: false, .. }, _) => false,
        (InstrData::Mimg { .. }, InstrData::Mimg { .. })
        | (InstrData::Mtbuf { .. }, InstrData::Mtbuf { .. })
        | (InstrData::Vop3 { .. }, InstrData::Vop3 { .. })
        | (InstrData::Dpp { .. }, InstrData::Dpp { .. })
        | (InstrData::Sopk { .. }, InstrData::Sopk { .. })
        | (InstrData::Vintrp { .. }, InstrData::Vintrp { .. }) => a.data == b.data,
        // Load/store ordering is handled upstream; do not hassle with
        // dependencies here.
        (InstrData::Mubuf { .. }, _) | (InstrData::FlatLike { .. }, _) | (InstrData::Ds { .. }, _) => {
            false
        }
        _ => true,
    }
}

fn rename_operands(instr: &mut Instruction, renames: &FxHashMap<u32, Temp>) {
    for op in &mut instr.operands {
        if !op.is_temp() {
            continue;
        }
        if let Some(&t) = renames.get(&op.temp_id()) {
            op.set_temp(t);
        }
    }
}

fn is_copy(instr: &Instruction) -> bool {
    matches!(instr.opcode, Opcode::s_mov_b32 | Opcode::s_mov_b64 | Opcode::v_mov_b32)
        && !instr.definitions[0].is_fixed()
        && instr.operands[0].is_temp()
        && instr.operands[0].reg_class() == instr.definitions[0].reg_class()
        && !instr.is_dpp()
        && !instr.is_sdwa()
}

fn process_block(
    block_instructions: &mut Vec<Instruction>,
    expr_values: &mut ExprSet,
    renames: &mut FxHashMap<u32, Temp>,
) {
    let mut run = false;
    let mut new_instructions: Vec<Instruction> = Vec::with_capacity(block_instructions.len());
    let mut phi_values: ExprSet = ExprSet::default();

    for mut instr in block_instructions.drain(..) {
        rename_operands(&mut instr, renames);

        if instr.definitions.is_empty() || !run {
            match instr.opcode {
                Opcode::p_logical_start => run = true,
                Opcode::p_logical_end => run = false,
                Opcode::p_phi | Opcode::p_linear_phi => {
                    let hash = hash_instr(&instr);
                    let bucket = phi_values.entry(hash).or_default();
                    if let Some(orig) = bucket.iter().find(|other| instr_equal(other, &instr)) {
                        renames
                            .insert(instr.definitions[0].temp_id(), orig.definitions[0].get_temp());
                        continue;
                    }
                    bucket.push(instr.clone());
                }
                _ => {}
            }
            new_instructions.push(instr);
            continue;
        }

        // Simple copy propagation through renaming.
        if is_copy(&instr) {
            renames.insert(instr.definitions[0].temp_id(), instr.operands[0].get_temp());
        }

        let hash = hash_instr(&instr);
        let bucket = expr_values.entry(hash).or_default();
        if let Some(orig) = bucket.iter().find(|other| instr_equal(other, &instr)) {
            debug_assert_eq!(instr.definitions.len(), orig.definitions.len());
            for (def, orig_def) in instr.definitions.iter().zip(&orig.definitions) {
                debug_assert_eq!(def.reg_class(), orig_def.reg_class());
                renames.insert(def.temp_id(), orig_def.get_temp());
            }
        } else {
            bucket.push(instr.clone());
            new_instructions.push(instr);
        }
    }

    *block_instructions = new_instructions;
}

fn rename_phi_operands(block_instructions: &mut [Instruction], renames: &FxHashMap<u32, Temp>) {
    for phi in block_instructions.iter_mut() {
        if !phi.is_phi() {
            break;
        }
        rename_operands(phi, renames);
    }
}

/// Partition instructions into value-equivalence classes and rewrite later
/// occurrences to reuse the dominating definition.
pub fn value_numbering(program: &mut Program) {
    let mut expr_values: Vec<ExprSet> = vec![ExprSet::default(); program.blocks.len()];
    let mut renames: FxHashMap<u32, Temp> = FxHashMap::default();

    for i in 0..program.blocks.len() {
        let idom = program.blocks[i].logical_idom;
        let mut instructions = std::mem::take(&mut program.blocks[i].instructions);
        if idom != -1 {
            // Initialize the expression table from the immediate dominator.
            let mut set = expr_values[idom as usize].clone();
            process_block(&mut instructions, &mut set, &mut renames);
            expr_values[i] = set;
        } else {
            let mut set = ExprSet::default();
            process_block(&mut instructions, &mut set, &mut renames);
        }
        program.blocks[i].instructions = instructions;
    }

    for block in &mut program.blocks {
        rename_phi_operands(&mut block.instructions, &renames);
    }

    log::debug!("value_numbering: {} renames", renames.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Builder, ChipClass, Definition, Operand, Program, RegClass, Stage,
    };

    fn block_with_logical_region(program: &mut Program) -> u32 {
        let b = program.create_and_insert_block();
        program.blocks[b as usize].logical_idom = b as i32;
        program.blocks[b as usize].linear_idom = b as i32;
        b
    }

    #[test]
    fn common_subexpression_is_renamed() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        block_with_logical_region(&mut program);
        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        let (t1, t2, t3);
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            let d1 = bld.def(RegClass::V1);
            t1 = d1.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d1], &[Operand::temp(a), Operand::temp(b)]);
            let d2 = bld.def(RegClass::V1);
            t2 = d2.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d2], &[Operand::temp(a), Operand::temp(b)]);
            let d3 = bld.def(RegClass::V1);
            t3 = d3.get_temp();
            bld.vop2(Opcode::v_mul_f32, &[d3], &[Operand::temp(t1), Operand::temp(t2)]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
        }
        program.blocks[0].instructions = instrs;

        value_numbering(&mut program);

        let instrs = &program.blocks[0].instructions;
        // Second add removed, multiply reads t1 twice.
        assert_eq!(instrs.len(), 4);
        let mul = &instrs[2];
        assert_eq!(mul.opcode, Opcode::v_mul_f32);
        assert_eq!(mul.operands[0].get_temp(), t1);
        assert_eq!(mul.operands[1].get_temp(), t1);
        let _ = (t2, t3);

        let uses = crate::dce::dead_code_analysis(&program);
        assert_eq!(uses[t1.id() as usize], 2);
    }

    #[test]
    fn vopc_results_are_never_numbered() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        block_with_logical_region(&mut program);
        let a = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            for _ in 0..2 {
                let d = bld.def(RegClass::S2);
                bld.vopc(Opcode::v_cmp_lt_f32, &[d], &[Operand::c32(0), Operand::temp(a)]);
            }
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
        }
        program.blocks[0].instructions = instrs;

        value_numbering(&mut program);
        assert_eq!(program.blocks[0].instructions.len(), 4);
    }

    #[test]
    fn dominated_block_inherits_expressions() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        let b0 = block_with_logical_region(&mut program);
        let b1 = program.create_and_insert_block();
        program.blocks[b1 as usize].logical_idom = b0 as i32;
        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);

        let mut instrs = Vec::new();
        let t1;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            let d1 = bld.def(RegClass::V1);
            t1 = d1.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d1], &[Operand::temp(a), Operand::temp(b)]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
        }
        program.blocks[0].instructions = instrs;

        let mut instrs = Vec::new();
        let t2;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            let d2 = bld.def(RegClass::V1);
            t2 = d2.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d2], &[Operand::temp(a), Operand::temp(b)]);
            let d3 = bld.def(RegClass::V1);
            bld.vop2(Opcode::v_mul_f32, &[d3], &[Operand::temp(t2), Operand::temp(t2)]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
        }
        program.blocks[1].instructions = instrs;

        value_numbering(&mut program);

        // The add in block 1 collapses onto block 0's.
        assert_eq!(program.blocks[1].instructions.len(), 3);
        let mul = &program.blocks[1].instructions[1];
        assert_eq!(mul.operands[0].get_temp(), t1);
    }

    #[test]
    fn copies_propagate_through_renaming() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        block_with_logical_region(&mut program);
        let a = program.alloc_tmp(RegClass::S1);
        let mut instrs = Vec::new();
        let copy_def;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            let d = bld.def(RegClass::S1);
            copy_def = d.get_temp();
            bld.sop1(Opcode::s_mov_b32, &[d], &[Operand::temp(a)]);
            let d2 = bld.def(RegClass::S1);
            bld.sop2(Opcode::s_add_u32, &[d2], &[Operand::temp(copy_def), Operand::c32(1)]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
        }
        program.blocks[0].instructions = instrs;

        value_numbering(&mut program);
        let add = &program.blocks[0].instructions[2];
        assert_eq!(add.opcode, Opcode::s_add_u32);
        assert_eq!(add.operands[0].get_temp(), a);
        let _ = Definition::new(a);
    }
}
