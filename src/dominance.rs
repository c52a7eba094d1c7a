//! Immediate-dominator computation for both CFGs.
//!
//! Implements the intersection routine from "A Simple, Fast Dominance
//! Algorithm" by Cooper, Harvey, and Kennedy. Different from the paper, the
//! iterate-to-fixpoint collapses into a single forward sweep because block
//! indices are topologically ordered: every dominating predecessor of a
//! block has a smaller index than the block itself.

use crate::ir::Program;
use crate::{CodegenError, CodegenResult};

fn intersect(idoms: impl Fn(u32) -> i32, preds: &[u32]) -> i32 {
    let mut new_idom: i32 = -1;
    for &pred in preds {
        if idoms(pred) == -1 {
            // Back edge to a block we have not reached yet; skip.
            continue;
        }
        if new_idom == -1 {
            new_idom = pred as i32;
            continue;
        }

        let mut pred = pred as i32;
        while pred != new_idom {
            if pred > new_idom {
                pred = idoms(pred as u32);
            }
            if pred < new_idom {
                new_idom = idoms(new_idom as u32);
            }
        }
    }
    new_idom
}

/// Compute `logical_idom` and `linear_idom` for every block.
///
/// A block without predecessors dominates itself. A reachable block whose
/// predecessors all lack a computed dominator indicates a malformed CFG.
pub fn dominator_tree(program: &mut Program) -> CodegenResult<()> {
    for i in 0..program.blocks.len() {
        if program.blocks[i].linear_preds.is_empty() {
            program.blocks[i].linear_idom = program.blocks[i].index as i32;
            program.blocks[i].logical_idom = program.blocks[i].index as i32;
            continue;
        }

        let logical_preds = program.blocks[i].logical_preds.clone();
        let linear_preds = program.blocks[i].linear_preds.clone();

        let new_logical_idom =
            intersect(|b| program.blocks[b as usize].logical_idom, &logical_preds);
        let new_linear_idom = intersect(|b| program.blocks[b as usize].linear_idom, &linear_preds);

        if new_linear_idom == -1 {
            // All predecessors still carry -1. When some predecessor was
            // already processed, it is itself unreachable and so is this
            // block; leave it skipped. A block fed only by back edges has
            // no path from the entry at all.
            let unreachable = linear_preds.iter().any(|&p| (p as usize) < i);
            if !unreachable {
                return Err(CodegenError::MalformedCfg(program.blocks[i].index));
            }
            continue;
        }

        program.blocks[i].logical_idom = new_logical_idom;
        program.blocks[i].linear_idom = new_linear_idom;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ChipClass, Program, Stage};

    fn program_with_edges(linear: &[(u32, u32)], logical: &[(u32, u32)], blocks: u32) -> Program {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        for _ in 0..blocks {
            program.create_and_insert_block();
        }
        for &(from, to) in linear {
            program.blocks[from as usize].linear_succs.push(to);
            program.blocks[to as usize].linear_preds.push(from);
        }
        for &(from, to) in logical {
            program.blocks[from as usize].logical_succs.push(to);
            program.blocks[to as usize].logical_preds.push(from);
        }
        program
    }

    #[test]
    fn diamond() {
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];
        let mut program = program_with_edges(&edges, &edges, 4);
        dominator_tree(&mut program).unwrap();
        assert_eq!(program.blocks[0].linear_idom, 0);
        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 0);
        assert_eq!(program.blocks[3].linear_idom, 0);
        assert_eq!(program.blocks[3].logical_idom, 0);
    }

    #[test]
    fn straight_line() {
        let edges = [(0, 1), (1, 2)];
        let mut program = program_with_edges(&edges, &edges, 3);
        dominator_tree(&mut program).unwrap();
        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 1);
    }

    #[test]
    fn loop_back_edge() {
        // 0 -> 1 -> 2 -> 1 (back edge), 2 -> 3.
        let edges = [(0, 1), (1, 2), (2, 1), (2, 3)];
        let mut program = program_with_edges(&edges, &edges, 4);
        // Keep predecessor lists sorted.
        for block in &mut program.blocks {
            block.linear_preds.sort_unstable();
            block.logical_preds.sort_unstable();
        }
        dominator_tree(&mut program).unwrap();
        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 1);
        assert_eq!(program.blocks[3].linear_idom, 2);
    }

    #[test]
    fn entryless_block_dominates_itself() {
        let mut program = program_with_edges(&[], &[], 1);
        dominator_tree(&mut program).unwrap();
        assert_eq!(program.blocks[0].linear_idom, 0);
        assert_eq!(program.blocks[0].logical_idom, 0);
    }
}
