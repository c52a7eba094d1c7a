//! Phi lowering into positioned parallel copies.
//!
//! After CSSA lowering and register allocation the phi operands no longer
//! interfere, so each phi reduces to one copy per predecessor edge. Copies
//! from logical phis are inserted right before the predecessor's
//! `p_logical_end` marker; copies from linear phis go at the very end of the
//! predecessor, just before its terminator branch. Afterwards no phi remains
//! in the program.

use crate::ir::{Definition, Format, Instruction, Opcode, Operand, Program};

#[derive(Clone, Copy)]
struct PhiInfoItem {
    def: Definition,
    op: Operand,
}

struct SsaEliminationCtx {
    /// Outer index: block. Inner: accumulated copies for that block.
    logical_phi_info: Vec<Vec<PhiInfoItem>>,
    linear_phi_info: Vec<Vec<PhiInfoItem>>,
}

fn collect_phi_info(program: &Program, ctx: &mut SsaEliminationCtx) {
    for block in &program.blocks {
        for phi in &block.instructions {
            if !phi.is_phi() {
                break;
            }

            for (i, op) in phi.operands.iter().enumerate() {
                if op.is_undefined() {
                    continue;
                }
                if op.phys_reg() == phi.definitions[0].phys_reg() {
                    continue;
                }

                debug_assert_eq!(phi.definitions[0].size(), op.size());

                let preds = if phi.opcode == Opcode::p_phi {
                    &block.logical_preds
                } else {
                    &block.linear_preds
                };
                let pred_idx = preds[i] as usize;
                let info_vec = if phi.opcode == Opcode::p_phi {
                    &mut ctx.logical_phi_info[pred_idx]
                } else {
                    &mut ctx.linear_phi_info[pred_idx]
                };
                info_vec.push(PhiInfoItem { def: phi.definitions[0], op: *op });
            }
        }
    }
}

fn build_parallelcopy(items: &[PhiInfoItem]) -> Instruction {
    let mut pc = Instruction::new(Opcode::p_parallelcopy, Format::PSEUDO, items.len(), items.len());
    for (i, item) in items.iter().enumerate() {
        pc.definitions[i] = item.def;
        pc.operands[i] = item.op;
    }
    pc
}

fn insert_parallelcopies(program: &mut Program, ctx: &SsaEliminationCtx) {
    // Insert the parallelcopies from logical phis before p_logical_end.
    for (block_idx, items) in ctx.logical_phi_info.iter().enumerate() {
        if items.is_empty() {
            continue;
        }
        let block = &mut program.blocks[block_idx];
        let mut idx = block.instructions.len() - 1;
        while block.instructions[idx].opcode != Opcode::p_logical_end {
            debug_assert!(idx > 0);
            idx -= 1;
        }
        block.instructions.insert(idx, build_parallelcopy(items));
    }

    // Insert the parallelcopies from linear phis at the end of blocks, just
    // before the branch.
    for (block_idx, items) in ctx.linear_phi_info.iter().enumerate() {
        if items.is_empty() {
            continue;
        }
        let block = &mut program.blocks[block_idx];
        let pos = block.instructions.len() - 1;
        block.instructions.insert(pos, build_parallelcopy(items));
    }
}

fn remove_phis(program: &mut Program) {
    for block in &mut program.blocks {
        let first_non_phi =
            block.instructions.iter().position(|instr| !instr.is_phi()).unwrap_or(block.instructions.len());
        if first_non_phi > 0 {
            block.instructions.drain(..first_non_phi);
        }
    }
}

/// Lower all phis to parallel copies on the predecessor edges.
pub fn ssa_elimination(program: &mut Program) {
    let mut ctx = SsaEliminationCtx {
        logical_phi_info: vec![Vec::new(); program.blocks.len()],
        linear_phi_info: vec![Vec::new(); program.blocks.len()],
    };

    collect_phi_info(program, &mut ctx);
    insert_parallelcopies(program, &mut ctx);
    remove_phis(program);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, ChipClass, PhysReg, RegClass, Stage, Temp};

    fn phi_program() -> Program {
        // 0 -> {1, 2} -> 3, logical phi in 3 with both operands in
        // different registers than the def, plus one already-in-place
        // operand for a second phi.
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        for &(from, to) in &[(0u32, 1u32), (0, 2), (1, 3), (2, 3)] {
            program.blocks[from as usize].linear_succs.push(to);
            program.blocks[from as usize].logical_succs.push(to);
            program.blocks[to as usize].linear_preds.push(from);
            program.blocks[to as usize].logical_preds.push(from);
        }

        for idx in [0usize, 1, 2] {
            let mut instrs = Vec::new();
            {
                let mut bld = Builder::new(&mut program, &mut instrs);
                bld.pseudo(Opcode::p_logical_start, &[], &[]);
                bld.pseudo(Opcode::p_logical_end, &[], &[]);
                let target = if idx == 0 { 1 } else { 3 };
                bld.branch(Opcode::p_branch, None, target, target);
            }
            program.blocks[idx].instructions = instrs;
        }

        let a = Temp::new(program.alloc_id(), RegClass::V1);
        let b = Temp::new(program.alloc_id(), RegClass::V1);
        let d = Temp::new(program.alloc_id(), RegClass::V1);
        let e = Temp::new(program.alloc_id(), RegClass::V1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(
                Opcode::p_phi,
                &[Definition::fixed_temp(d, PhysReg(258))],
                &[
                    Operand::fixed_temp(a, PhysReg(256)),
                    Operand::fixed_temp(b, PhysReg(257)),
                ],
            );
            // Second phi: operand already sits in the def register, so the
            // edge from block 1 contributes no copy.
            bld.pseudo(
                Opcode::p_phi,
                &[Definition::fixed_temp(e, PhysReg(259))],
                &[
                    Operand::fixed_temp(a, PhysReg(259)),
                    Operand::undef(RegClass::V1),
                ],
            );
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[3].instructions = instrs;
        program
    }

    #[test]
    fn copies_are_positioned_on_edges() {
        let mut program = phi_program();
        ssa_elimination(&mut program);

        // No phi survives.
        for block in &program.blocks {
            assert!(block.instructions.iter().all(|instr| !instr.is_phi()));
        }

        // Block 1 has one parallelcopy right before p_logical_end.
        let b1 = &program.blocks[1].instructions;
        let pc_pos = b1.iter().position(|i| i.opcode == Opcode::p_parallelcopy).unwrap();
        assert_eq!(b1[pc_pos + 1].opcode, Opcode::p_logical_end);
        assert_eq!(b1[pc_pos].definitions[0].phys_reg(), PhysReg(258));
        assert_eq!(b1[pc_pos].operands[0].phys_reg(), PhysReg(256));
        // The already-placed operand of the second phi contributed nothing.
        assert_eq!(b1[pc_pos].definitions.len(), 1);

        // Block 2 likewise, for the other operand.
        let b2 = &program.blocks[2].instructions;
        let pc_pos = b2.iter().position(|i| i.opcode == Opcode::p_parallelcopy).unwrap();
        assert_eq!(b2[pc_pos].operands[0].phys_reg(), PhysReg(257));
    }

    #[test]
    fn undefined_operands_contribute_no_copy() {
        let mut program = phi_program();
        ssa_elimination(&mut program);
        // Block 2 carries only the copy for the first phi: the second phi's
        // operand along that edge is undefined.
        let b2 = &program.blocks[2].instructions;
        let copies: Vec<_> =
            b2.iter().filter(|i| i.opcode == Opcode::p_parallelcopy).collect();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].definitions.len(), 1);
    }
}
