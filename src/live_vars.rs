//! Live-variable analysis.
//!
//! Computes per-block live-in sets and register-demand summaries by backward
//! dataflow, iterated to a fixpoint so loop back edges are handled. A
//! temporary with a linear register class propagates along the linear CFG,
//! all others along the logical CFG. Phi operands are not part of the phi
//! block's live-in; they extend the corresponding predecessor's live-out
//! instead.

use crate::fx::FxHashSet;
use crate::ir::{Program, RegClass, RegType, Temp};

/// Number of scalar and vector registers demanded at a program point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterDemand {
    /// VGPR count.
    pub vgpr: u32,
    /// SGPR count.
    pub sgpr: u32,
}

impl RegisterDemand {
    /// Componentwise maximum.
    pub fn update(&mut self, other: RegisterDemand) {
        self.vgpr = self.vgpr.max(other.vgpr);
        self.sgpr = self.sgpr.max(other.sgpr);
    }
}

/// The result of live-variable analysis.
#[derive(Debug, Default)]
pub struct LiveInfo {
    /// Per-block sets of temp ids live into the block.
    pub live_in: Vec<FxHashSet<u32>>,
}

/// Register classes of every allocated temp, gathered from definitions and
/// phi operands.
fn collect_classes(program: &Program) -> Vec<Option<RegClass>> {
    let mut classes: Vec<Option<RegClass>> = vec![None; program.peek_allocation_id() as usize];
    for block in &program.blocks {
        for instr in &block.instructions {
            for def in &instr.definitions {
                if def.is_temp() {
                    classes[def.temp_id() as usize] = Some(def.reg_class());
                }
            }
            for op in &instr.operands {
                if op.is_temp() {
                    classes[op.temp_id() as usize] = Some(op.reg_class());
                }
            }
        }
    }
    classes
}

fn demand_of(live: &FxHashSet<u32>, classes: &[Option<RegClass>]) -> RegisterDemand {
    let mut demand = RegisterDemand::default();
    for &id in live {
        if let Some(rc) = classes[id as usize] {
            match rc.ty() {
                RegType::Vgpr => demand.vgpr += rc.size(),
                RegType::Sgpr => demand.sgpr += rc.size(),
            }
        }
    }
    demand
}

/// The live-out set of `block_idx`: the union of successor live-ins filtered
/// by CFG kind, plus the phi operands this block feeds.
fn live_out(program: &Program, live_in: &[FxHashSet<u32>], block_idx: u32) -> FxHashSet<u32> {
    let block = &program.blocks[block_idx as usize];
    let mut live = FxHashSet::default();

    for &succ in &block.linear_succs {
        for &id in &live_in[succ as usize] {
            live.insert(id);
        }
    }
    for &succ in &block.logical_succs {
        for &id in &live_in[succ as usize] {
            live.insert(id);
        }
    }

    // Phi operands along the edge from this block.
    for succs in [&block.logical_succs, &block.linear_succs] {
        for &succ in succs.iter() {
            let succ_block = &program.blocks[succ as usize];
            for phi in &succ_block.instructions {
                if !phi.is_phi() {
                    break;
                }
                let preds = if phi.opcode == crate::ir::Opcode::p_phi {
                    &succ_block.logical_preds
                } else {
                    &succ_block.linear_preds
                };
                for (i, &pred) in preds.iter().enumerate() {
                    if pred == block_idx && phi.operands[i].is_temp() {
                        live.insert(phi.operands[i].temp_id());
                    }
                }
            }
        }
    }

    live
}

fn process_block(
    program: &Program,
    live_in: &[FxHashSet<u32>],
    block_idx: u32,
    classes: &[Option<RegClass>],
    demand: &mut RegisterDemand,
) -> FxHashSet<u32> {
    let block = &program.blocks[block_idx as usize];
    let mut live = live_out(program, live_in, block_idx);
    demand.update(demand_of(&live, classes));

    for instr in block.instructions.iter().rev() {
        if instr.is_phi() {
            // Phi defs are killed at the top of the block; the operands
            // belong to the predecessors.
            continue;
        }
        for def in &instr.definitions {
            if def.is_temp() {
                live.remove(&def.temp_id());
            }
        }
        for op in &instr.operands {
            if op.is_temp() {
                live.insert(op.temp_id());
            }
        }
        demand.update(demand_of(&live, classes));
    }

    for instr in &block.instructions {
        if !instr.is_phi() {
            break;
        }
        for def in &instr.definitions {
            if def.is_temp() {
                live.remove(&def.temp_id());
            }
        }
    }

    live
}

/// Compute live-in sets and register demand for every block.
pub fn live_var_analysis(program: &mut Program) -> LiveInfo {
    let classes = collect_classes(program);
    let mut live_in: Vec<FxHashSet<u32>> = vec![FxHashSet::default(); program.blocks.len()];
    let mut demands = vec![RegisterDemand::default(); program.blocks.len()];

    let mut changed = true;
    while changed {
        changed = false;
        for idx in (0..program.blocks.len() as u32).rev() {
            let mut demand = RegisterDemand::default();
            let new_in = process_block(program, &live_in, idx, &classes, &mut demand);
            demands[idx as usize] = demand;
            if new_in != live_in[idx as usize] {
                live_in[idx as usize] = new_in;
                changed = true;
            }
        }
    }

    let mut max_demand = RegisterDemand::default();
    for (block, demand) in program.blocks.iter_mut().zip(&demands) {
        block.live_in_demand = demand_of(&live_in[block.index as usize], &classes);
        block.register_demand = *demand;
        max_demand.update(*demand);
    }
    program.max_reg_demand = max_demand;

    log::trace!(
        "live_var_analysis: max demand {} vgprs, {} sgprs",
        max_demand.vgpr,
        max_demand.sgpr
    );
    LiveInfo { live_in }
}

/// Recompute liveness and compare with the stored summary.
pub fn validate_live_vars(program: &mut Program) -> bool {
    let stored = match program.live.take() {
        Some(info) => info,
        None => return false,
    };
    let fresh = live_var_analysis(program);
    let valid = stored.live_in == fresh.live_in;
    if !valid {
        for (idx, (a, b)) in stored.live_in.iter().zip(&fresh.live_in).enumerate() {
            if a != b {
                log::debug!("validate_live_vars: mismatch in block {idx}: {a:?} != {b:?}");
            }
        }
    }
    program.live = Some(fresh);
    valid
}

/// Renumber all SSA temporaries compactly in program order.
///
/// Temp ids are allocated monotonically and never reused, so passes that
/// drop many values leave holes; re-indexing keeps side tables small.
pub fn reindex_ssa(program: &mut Program) {
    let mut remap: Vec<u32> = vec![0; program.peek_allocation_id() as usize];
    let mut next: u32 = 1;
    for block in &program.blocks {
        for instr in &block.instructions {
            for def in &instr.definitions {
                let id = def.temp_id();
                if id != 0 && remap[id as usize] == 0 {
                    remap[id as usize] = next;
                    next += 1;
                }
            }
        }
    }

    for block in &mut program.blocks {
        for instr in &mut block.instructions {
            for def in &mut instr.definitions {
                let id = def.temp_id();
                if id != 0 {
                    def.set_temp(Temp::new(remap[id as usize], def.reg_class()));
                }
            }
            for op in &mut instr.operands {
                let id = op.temp_id();
                if id != 0 {
                    let rc = op.reg_class();
                    op.set_temp(Temp::new(remap[id as usize], rc));
                }
            }
        }
    }

    if let Some(live) = &mut program.live {
        for set in &mut live.live_in {
            *set = set.iter().map(|&id| remap[id as usize]).filter(|&id| id != 0).collect();
        }
    }

    program.set_allocation_id(next);
    log::debug!("reindex_ssa: compacted to {} ids", next - 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Builder, ChipClass, Definition, Opcode, Operand, Program, RegClass, Stage,
    };

    fn two_block_program() -> Program {
        // Block 0 defines a value, block 1 uses it.
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        let b0 = program.create_and_insert_block();
        let b1 = program.create_and_insert_block();
        program.blocks[b0 as usize].linear_succs.push(b1);
        program.blocks[b0 as usize].logical_succs.push(b1);
        program.blocks[b1 as usize].linear_preds.push(b0);
        program.blocks[b1 as usize].logical_preds.push(b0);

        let t = program.alloc_tmp(RegClass::S1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sop1(Opcode::s_mov_b32, &[Definition::new(t)], &[Operand::c32(1)]);
        }
        program.blocks[0].instructions = instrs;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = bld.def(RegClass::S1);
            bld.sop2(Opcode::s_add_u32, &[d], &[Operand::temp(t), Operand::c32(2)]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[1].instructions = instrs;
        program
    }

    #[test]
    fn cross_block_liveness() {
        let mut program = two_block_program();
        let live = live_var_analysis(&mut program);
        assert!(live.live_in[0].is_empty());
        assert_eq!(live.live_in[1].len(), 1);
        assert!(live.live_in[1].contains(&1));
        assert_eq!(program.blocks[1].live_in_demand.sgpr, 1);
    }

    #[test]
    fn validate_matches_fresh_analysis() {
        let mut program = two_block_program();
        let live = live_var_analysis(&mut program);
        program.live = Some(live);
        assert!(validate_live_vars(&mut program));
    }

    #[test]
    fn reindex_is_compact() {
        let mut program = two_block_program();
        // Burn some ids so the numbering has holes.
        for _ in 0..5 {
            program.alloc_id();
        }
        reindex_ssa(&mut program);
        assert_eq!(program.peek_allocation_id(), 3);
        assert_eq!(program.blocks[0].instructions[0].definitions[0].temp_id(), 1);
        assert_eq!(program.blocks[1].instructions[0].operands[0].temp_id(), 1);
    }
}
