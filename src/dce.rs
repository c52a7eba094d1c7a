//! Use-count analysis for dead-code elimination.
//!
//! Produces a vector of 16-bit use counts indexed by temp id. Instructions
//! whose definitions are all unused and which have no observable side effect
//! contribute no uses, so chains of dead code collapse in a single backward
//! sweep. Loop-header phis are assumed live; their operand uses are counted
//! up front.

use crate::ir::{BlockKind, Instruction, Program};

/// Whether `instr` can be removed once `uses` records no use of any of its
/// definitions.
///
/// Instructions without definitions (stores, exports, barriers, markers) and
/// branches are observable. A definition that names only a physical register
/// (exec, scc, vcc writes) pins the instruction as well.
pub fn is_dead(uses: &[u16], instr: &Instruction) -> bool {
    if instr.definitions.is_empty() || instr.is_branch() {
        return false;
    }
    instr
        .definitions
        .iter()
        .all(|def| def.is_temp() && uses[def.temp_id() as usize] == 0)
}

fn process_loop_header_phis(uses: &mut [u16], block: &crate::ir::Block) {
    for instr in &block.instructions {
        if !instr.is_phi() {
            return;
        }
        for op in &instr.operands {
            if op.is_temp() {
                uses[op.temp_id() as usize] += 1;
            }
        }
    }
}

fn process_block(uses: &mut [u16], block: &crate::ir::Block) {
    for instr in block.instructions.iter().rev() {
        if block.kind.contains(BlockKind::LOOP_HEADER) && instr.is_phi() {
            break;
        }
        if !is_dead(uses, instr) {
            for op in &instr.operands {
                if op.is_temp() {
                    uses[op.temp_id() as usize] += 1;
                }
            }
        }
    }
}

/// Count the uses of every SSA definition. Idempotent.
pub fn dead_code_analysis(program: &Program) -> Vec<u16> {
    let mut uses = vec![0u16; program.peek_allocation_id() as usize];

    for block in &program.blocks {
        if block.kind.contains(BlockKind::LOOP_HEADER) {
            process_loop_header_phis(&mut uses, block);
        }
    }

    for block in program.blocks.iter().rev() {
        process_block(&mut uses, block);
    }

    uses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Builder, ChipClass, Definition, Opcode, Operand, Program, RegClass, Stage,
    };

    #[test]
    fn dead_chain_is_not_counted() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        program.create_and_insert_block();
        let mut instrs = Vec::new();
        let (a, b);
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let da = bld.def(RegClass::S1);
            a = da.get_temp();
            bld.sop1(Opcode::s_mov_b32, &[da], &[Operand::c32(1)]);
            // b uses a, but nothing uses b: the whole chain is dead.
            let db = bld.def(RegClass::S1);
            b = db.get_temp();
            bld.sop2(Opcode::s_add_u32, &[db], &[Operand::temp(a), Operand::c32(1)]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        let uses = dead_code_analysis(&program);
        assert_eq!(uses[a.id() as usize], 0);
        assert_eq!(uses[b.id() as usize], 0);
        assert!(is_dead(&uses, &program.blocks[0].instructions[1]));
        // Idempotent.
        assert_eq!(uses, dead_code_analysis(&program));
    }

    #[test]
    fn live_use_keeps_producer() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        program.create_and_insert_block();
        let mut instrs = Vec::new();
        let a;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let da = bld.def(RegClass::S1);
            a = da.get_temp();
            bld.sop1(Opcode::s_mov_b32, &[da], &[Operand::c32(1)]);
            // A store is observable, so its operand uses count.
            let mut store = crate::ir::Instruction::new(
                Opcode::buffer_store_dword,
                crate::ir::Format::MUBUF,
                4,
                0,
            );
            store.operands[0] = Operand::undef(RegClass::V1);
            store.operands[1] = Operand::undef(RegClass::S4);
            store.operands[2] = Operand::temp(a);
            store.operands[3] = Operand::undef(RegClass::V1);
            bld.insert(store);
        }
        program.blocks[0].instructions = instrs;

        let uses = dead_code_analysis(&program);
        assert_eq!(uses[a.id() as usize], 1);
    }

    #[test]
    fn loop_header_phis_are_live() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        let b0 = program.create_and_insert_block();
        program.blocks[b0 as usize].kind |= crate::ir::BlockKind::LOOP_HEADER;
        let init = program.alloc_tmp(RegClass::S1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = bld.def(RegClass::S1);
            bld.pseudo(Opcode::p_phi, &[d], &[Operand::temp(init), Operand::undef(RegClass::S1)]);
        }
        program.blocks[0].instructions = instrs;
        // `init` is defined nowhere in this fragment; give it a definition slot.
        let _ = Definition::new(init);

        let uses = dead_code_analysis(&program);
        assert_eq!(uses[init.id() as usize], 1);
    }
}
