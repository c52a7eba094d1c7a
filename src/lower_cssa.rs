//! Lowering to Conventional SSA Form (CSSA).
//!
//! After "Revisiting Out-of-SSA Translation for Correctness, Code Quality,
//! and Efficiency" by Boissinot, Darte, Rastello, Dupont de Dinechin and
//! Guillon. Lowering to CSSA separates parallel-copy insertion from the
//! register-coalescing problem. The pass coalesces non-interfering
//! phi-resources while taking value-equality into account, and re-indexes
//! the SSA defs.
//!
//! Every phi gets one ordered *merge set* holding its (renamed) operands and
//! its def; two temps of a set may only coexist when they are never live
//! simultaneously or carry the same value. Copies that cannot be coalesced
//! are scheduled through a location-transfer graph so that emitted copies
//! never clobber a pending source; residual cycles stay as one parallel-copy
//! instruction for the hardware lowering to resolve with swaps.

use std::collections::BTreeMap;

use crate::fx::FxHashMap;
use crate::ir::{
    dominates_linear, dominates_logical, BlockKind, ChipClass, Definition, Format, Instruction,
    Opcode, Operand, Program, RegClass, RegType, Temp,
};
use crate::live_vars::{live_var_analysis, reindex_ssa, validate_live_vars};
use crate::{CodegenError, CodegenResult};

const NONE: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct Copy {
    def: Definition,
    op: Operand,
}

#[derive(Clone)]
struct MergeNode {
    /// Original value: an SSA def or a constant.
    value: Operand,
    /// Index into the vector of merge sets.
    index: u32,
    /// Defining block.
    defined_at: u32,
    /// Closest equal intersecting ancestor within the same merge set.
    /// Because it intersects with this node, it must dominate it and carry
    /// the same value.
    equal_anc_in: Temp,
    /// Same, for the other set during a tentative merge.
    equal_anc_out: Temp,
}

impl Default for MergeNode {
    fn default() -> Self {
        Self {
            value: Operand::undef(RegClass::S1),
            index: NONE,
            defined_at: NONE,
            equal_anc_in: Temp::new(0, RegClass::S1),
            equal_anc_out: Temp::new(0, RegClass::S1),
        }
    }
}

fn none_temp() -> Temp {
    Temp::new(0, RegClass::S1)
}

struct CssaCtx {
    /// Copies per predecessor block.
    parallelcopies: Vec<Vec<Copy>>,
    /// Each inner vector is one ordered merge set.
    merge_sets: Vec<Vec<Temp>>,
    /// Temp id -> merge node.
    merge_node_table: FxHashMap<u32, MergeNode>,
}

/// Create (virtual) parallelcopies for each phi instruction and merge
/// copy-definitions with phi-defs into merge sets.
fn collect_parallelcopies(program: &mut Program, ctx: &mut CssaCtx) {
    ctx.parallelcopies = vec![Vec::new(); program.blocks.len()];

    for b in 0..program.blocks.len() {
        let kind = program.blocks[b].kind;
        let logical_preds = program.blocks[b].logical_preds.clone();
        let linear_preds = program.blocks[b].linear_preds.clone();

        for j in 0..program.blocks[b].instructions.len() {
            if !program.blocks[b].instructions[j].is_phi() {
                break;
            }
            let opcode = program.blocks[b].instructions[j].opcode;
            let def = program.blocks[b].instructions[j].definitions[0];

            // A non-temp definition is the exec mask; it can be reloaded
            // directly from its spill slot.
            if !def.is_temp() || def.is_kill() {
                continue;
            }

            let preds = if opcode == Opcode::p_phi { &logical_preds } else { &linear_preds };
            let index = ctx.merge_sets.len() as u32;
            let mut set: Vec<Temp> = Vec::new();
            let mut has_preheader_copy = false;

            for i in 0..program.blocks[b].instructions[j].operands.len() {
                let op = program.blocks[b].instructions[j].operands[i];
                if op.is_undefined() {
                    continue;
                }

                if def.reg_class().ty() == RegType::Sgpr && !op.is_temp() {
                    if op.is_constant() {
                        // SGPR inline constants, and literals on GFX10+, can
                        // be spilled and reloaded without an intermediate
                        // register.
                        if program.chip_class >= ChipClass::Gfx10 {
                            continue;
                        }
                        if op.size() == 1 && !op.is_literal() {
                            continue;
                        }
                    } else {
                        debug_assert!(op.is_fixed());
                        continue;
                    }
                }

                // Create a new temporary and rename the operand.
                let tmp = program.alloc_tmp(def.reg_class());
                ctx.parallelcopies[preds[i] as usize]
                    .push(Copy { def: Definition::new(tmp), op });
                let phi_op = &mut program.blocks[b].instructions[j].operands[i];
                *phi_op = Operand::temp(tmp);
                phi_op.set_kill(true);

                set.push(tmp);
                ctx.merge_node_table.insert(
                    tmp.id(),
                    MergeNode {
                        value: op,
                        index,
                        defined_at: preds[i],
                        ..MergeNode::default()
                    },
                );

                has_preheader_copy |= i == 0 && kind.contains(BlockKind::LOOP_HEADER);
            }

            if set.is_empty() {
                continue;
            }

            // Place the definition in dominance order.
            if has_preheader_copy {
                set.insert(1, def.get_temp());
            } else if kind.contains(BlockKind::LOOP_HEADER) {
                set.insert(0, def.get_temp());
            } else {
                set.push(def.get_temp());
            }
            ctx.merge_node_table.insert(
                def.temp_id(),
                MergeNode {
                    value: Operand::temp(def.get_temp()),
                    index,
                    defined_at: b as u32,
                    ..MergeNode::default()
                },
            );
            ctx.merge_sets.push(set);
        }
    }
}

/// Whether the definition of `a` comes after `b`. Two defs in the same block
/// tie-break on the temp id, which follows allocation order.
fn defined_after(ctx: &CssaCtx, a: Temp, b: Temp) -> bool {
    let node_a = &ctx.merge_node_table[&a.id()];
    let node_b = &ctx.merge_node_table[&b.id()];
    if node_a.defined_at == node_b.defined_at {
        return a.id() > b.id();
    }
    node_a.defined_at > node_b.defined_at
}

/// Whether `a` dominates `b`, where `b` is defined after `a`.
fn dominates(program: &Program, ctx: &CssaCtx, a: Temp, b: Temp) -> bool {
    debug_assert!(defined_after(ctx, b, a));
    let parent = ctx.merge_node_table[&a.id()].defined_at;
    let child = ctx.merge_node_table[&b.id()].defined_at;
    if b.ty() == RegType::Vgpr {
        dominates_logical(program, parent, child)
    } else {
        dominates_linear(program, parent, child)
    }
}

/// Whether some variable is live-out of `block_idx`, not considering any
/// phi-uses.
fn is_live_out(program: &Program, var: Temp, block_idx: u32) -> bool {
    let block = &program.blocks[block_idx as usize];
    let succs = if var.is_linear() { &block.linear_succs } else { &block.logical_succs };
    let live = program.live.as_ref().expect("live info required");
    succs.iter().any(|&succ| live.live_in[succ as usize].contains(&var.id()))
}

/// Check intersection between `var` and `parent`, where `parent` is already
/// known to dominate `var`.
fn intersects(program: &Program, ctx: &CssaCtx, var: Temp, parent: Temp) -> bool {
    let node_var = &ctx.merge_node_table[&var.id()];
    let node_parent = &ctx.merge_node_table[&parent.id()];
    debug_assert_ne!(node_var.index, node_parent.index);
    let block_idx = node_var.defined_at;

    if node_parent.defined_at < node_var.defined_at {
        // If the parent is not live-in, they don't interfere.
        let live = program.live.as_ref().expect("live info required");
        if !live.live_in[block_idx as usize].contains(&parent.id()) {
            return false;
        }
    }

    // If the parent is live-out at the definition block of var, they
    // intersect.
    let mut parent_live = is_live_out(program, parent, block_idx);
    if parent_live {
        return true;
    }

    for cp in &ctx.parallelcopies[block_idx as usize] {
        // If var is defined at the edge, they don't intersect.
        if cp.def.get_temp() == var {
            return false;
        }
        if cp.op.is_temp() && cp.op.get_temp() == parent {
            parent_live = true;
        }
    }
    if parent_live {
        return true;
    }

    // Both parent and var are present in the same block: walk backwards to
    // the first defining or using instruction.
    let block = &program.blocks[block_idx as usize];
    for instr in block.instructions.iter().rev() {
        // If the parent was not encountered yet, it can only be used by a
        // phi.
        if instr.is_phi() {
            break;
        }
        for def in &instr.definitions {
            if def.is_temp() && def.get_temp() == var {
                return false;
            }
        }
        for op in &instr.operands {
            if op.is_temp() && op.get_temp() == parent {
                return true;
            }
        }
    }

    false
}

/// Check interference between `var` and `parent`: different values and
/// intersecting live ranges. When they intersect but share a value, records
/// the equal ancestor instead.
fn interference(program: &Program, ctx: &mut CssaCtx, var: Temp, mut parent: Temp) -> bool {
    debug_assert_ne!(var, parent);
    ctx.merge_node_table.get_mut(&var.id()).unwrap().equal_anc_out = none_temp();

    let var_index = ctx.merge_node_table[&var.id()].index;
    if var_index == ctx.merge_node_table[&parent.id()].index {
        // Equal-ancestor-out is only present when it intersects with
        // `parent`, which is necessary for intersecting with `var`.
        parent = ctx.merge_node_table[&parent.id()].equal_anc_out;
    }

    let mut tmp = parent;
    // Check if var intersects with parent or any ancestors that might.
    while tmp.id() != 0 && !intersects(program, ctx, var, tmp) {
        tmp = ctx.merge_node_table[&tmp.id()].equal_anc_in;
    }

    if tmp.id() == 0 {
        return false;
    }

    // Same value and intersecting, but in different sets.
    if ctx.merge_node_table[&var.id()].value == ctx.merge_node_table[&parent.id()].value {
        ctx.merge_node_table.get_mut(&var.id()).unwrap().equal_anc_out = tmp;
        return false;
    }

    true
}

/// Try to merge `set_b` into the merge set of `dst`, dropping `dst` itself
/// as it is being coalesced. `src_index` names the merge set `set_b` was
/// taken from, if any.
fn try_merge_merge_set(
    program: &Program,
    ctx: &mut CssaCtx,
    dst: Temp,
    set_b: &[Temp],
    src_index: Option<u32>,
) -> bool {
    let index = ctx.merge_node_table[&dst.id()].index;
    let set_a = ctx.merge_sets[index as usize].clone();
    let mut dom: Vec<Temp> = Vec::new();
    let mut union_set: Vec<Temp> = Vec::new();
    let mut i_a = 0;
    let mut i_b = 0;

    while i_a < set_a.len() || i_b < set_b.len() {
        let current;
        if i_a == set_a.len() {
            current = set_b[i_b];
            i_b += 1;
        } else if i_b == set_b.len() {
            current = set_a[i_a];
            i_a += 1;
        } else if defined_after(ctx, set_a[i_a], set_b[i_b]) {
            current = set_b[i_b];
            i_b += 1;
        } else {
            current = set_a[i_a];
            i_a += 1;
        }

        while let Some(&top) = dom.last() {
            if dominates(program, ctx, top, current) {
                break;
            }
            dom.pop();
        }

        if let Some(&top) = dom.last() {
            if interference(program, ctx, current, top) {
                // Intersection detected; undo the probing state.
                for t in &union_set {
                    ctx.merge_node_table.get_mut(&t.id()).unwrap().equal_anc_out = none_temp();
                }
                return false;
            }
        }

        dom.push(current);
        if current != dst {
            union_set.push(current);
        }
    }

    // Commit: update equal ancestors and merge-set indices.
    for t in &union_set {
        let node = ctx.merge_node_table.get_mut(&t.id()).unwrap();
        let a_in = node.equal_anc_in;
        let a_out = node.equal_anc_out;
        node.equal_anc_out = none_temp();
        node.index = index;
        if a_in.id() == 0 {
            node.equal_anc_in = a_out;
        } else if a_out.id() != 0 && defined_after(ctx, a_out, a_in) {
            ctx.merge_node_table.get_mut(&t.id()).unwrap().equal_anc_in = a_out;
        }
    }
    if let Some(src) = src_index {
        ctx.merge_sets[src as usize] = Vec::new();
    }
    ctx.merge_sets[index as usize] = union_set;
    ctx.merge_node_table.remove(&dst.id());

    true
}

/// Returns true when the copy can safely be omitted.
fn try_coalesce_copy(program: &Program, ctx: &mut CssaCtx, cp: Copy, block_idx: u32) -> bool {
    // Only temporaries can be coalesced.
    if !cp.op.is_temp() || !cp.op.is_kill() {
        return false;
    }
    if cp.op.reg_class() != cp.def.reg_class() {
        return false;
    }

    let op_id = cp.op.temp_id();
    let needs_def_block = ctx
        .merge_node_table
        .get(&op_id)
        .map(|node| node.defined_at == NONE)
        .unwrap_or(true);
    if needs_def_block {
        // Find the defining block of the operand by walking up the
        // dominator tree while it stays live-in.
        let live = program.live.as_ref().expect("live info required");
        let mut bi = block_idx;
        while live.live_in[bi as usize].contains(&op_id) {
            bi = if cp.op.reg_class().ty() == RegType::Vgpr {
                program.blocks[bi as usize].logical_idom as u32
            } else {
                program.blocks[bi as usize].linear_idom as u32
            };
        }
        let node = ctx.merge_node_table.entry(op_id).or_default();
        node.defined_at = bi;
        node.value = cp.op;
    }

    let op_index = ctx.merge_node_table[&op_id].index;
    if op_index == NONE {
        // Not yet coalesced anywhere.
        return try_merge_merge_set(program, ctx, cp.def.get_temp(), &[cp.op.get_temp()], None);
    }

    // Already coalesced into the same set?
    debug_assert!(ctx.merge_node_table.contains_key(&cp.def.temp_id()));
    if op_index == ctx.merge_node_table[&cp.def.temp_id()].index {
        return true;
    }

    // Otherwise, try to merge both sets.
    let set_b = ctx.merge_sets[op_index as usize].clone();
    try_merge_merge_set(program, ctx, cp.def.get_temp(), &set_b, Some(op_index))
}

/// Node in the location-transfer graph, keyed by the def's merge-set index.
struct LtgNode {
    cp: usize,
    read_idx: u32,
    num_uses: u32,
}

fn make_copy_instr(def: Definition, op: Operand) -> Instruction {
    let mut instr = if def.reg_class().ty() == RegType::Sgpr && def.size() == 1 {
        Instruction::new(Opcode::s_mov_b32, Format::SOP1, 1, 1)
    } else if def.reg_class().ty() == RegType::Sgpr && def.size() == 2 {
        Instruction::new(Opcode::s_mov_b64, Format::SOP1, 1, 1)
    } else if def.reg_class() == RegClass::V1 {
        Instruction::new(Opcode::v_mov_b32, Format::VOP1, 1, 1)
    } else {
        Instruction::new(Opcode::p_parallelcopy, Format::PSEUDO, 1, 1)
    };
    instr.definitions[0] = def;
    instr.operands[0] = op;
    instr
}

/// Emit the copies of one register bank in an order that does not create
/// interferences within a merge set; leftovers are cycles and stay as one
/// parallel-copy instruction.
fn emit_copies_block(
    copies: &mut [Copy],
    ltg: &mut BTreeMap<u32, LtgNode>,
    ty: RegType,
    out: &mut Vec<Instruction>,
) {
    loop {
        let key = ltg
            .iter()
            .find(|(_, node)| copies[node.cp].def.reg_class().ty() == ty && node.num_uses == 0)
            .map(|(&k, _)| k);
        let key = match key {
            Some(k) => k,
            None => break,
        };

        let node = ltg.remove(&key).unwrap();
        if node.read_idx != NONE {
            if let Some(other) = ltg.get_mut(&node.read_idx) {
                other.num_uses -= 1;
            }
        }

        // Drop the kill flag if the operand is still needed by other copies.
        let cp = copies[node.cp];
        let still_needed = ltg
            .values()
            .any(|other| copies[other.cp].op == cp.op);
        let mut op = cp.op;
        if op.is_kill() && still_needed {
            op.set_kill(false);
            copies[node.cp].op = op;
        }

        out.push(make_copy_instr(cp.def, op));
    }

    // Any remaining entries of this bank form circular dependencies; emit
    // them as a single parallelcopy so they can be resolved with swaps.
    let cycle_keys: Vec<u32> = ltg
        .iter()
        .filter(|(_, node)| copies[node.cp].def.reg_class().ty() == ty)
        .map(|(&k, _)| k)
        .collect();
    if !cycle_keys.is_empty() {
        let num = cycle_keys.len();
        let mut pc = Instruction::new(Opcode::p_parallelcopy, Format::PSEUDO, num, num);
        for (i, key) in cycle_keys.into_iter().enumerate() {
            let node = ltg.remove(&key).unwrap();
            pc.definitions[i] = copies[node.cp].def;
            pc.operands[i] = copies[node.cp].op;
        }
        out.push(pc);
    }
}

/// Either emit or coalesce all parallelcopies and rename the phi operands
/// accordingly.
fn emit_parallelcopies(program: &mut Program, ctx: &mut CssaCtx) {
    let mut renames: FxHashMap<u32, Operand> = FxHashMap::default();

    // Iterate backwards to prioritize coalescing in else-blocks.
    for i in (0..program.blocks.len()).rev() {
        if ctx.parallelcopies[i].is_empty() {
            continue;
        }

        let mut ltg: BTreeMap<u32, LtgNode> = BTreeMap::new();
        let mut has_vgpr_copy = false;
        let mut has_sgpr_copy = false;

        // First, try to coalesce all parallelcopies.
        let mut copies = std::mem::take(&mut ctx.parallelcopies[i]);
        for c in 0..copies.len() {
            let cp = copies[c];
            if try_coalesce_copy(program, ctx, cp, i as u32) {
                debug_assert!(cp.op.is_temp() && cp.op.is_kill());
                // The temp will be used as a phi operand and become
                // live-out, so drop the kill flag on any other copy of it.
                for (other_idx, other) in copies.iter_mut().enumerate() {
                    if other_idx != c && other.op.is_temp() && other.op.get_temp() == cp.op.get_temp()
                    {
                        other.op.set_kill(false);
                    }
                }
                renames.insert(cp.def.temp_id(), cp.op);
            } else {
                let mut read_idx = NONE;
                if cp.op.is_temp() {
                    read_idx = ctx.merge_node_table.entry(cp.op.temp_id()).or_default().index;
                    // The original phi operand might still be live-out when
                    // logical and linear successors differ; re-check.
                    let mut op = cp.op;
                    op.set_kill(op.is_kill() && !is_live_out(program, op.get_temp(), i as u32));
                    op.set_first_kill(op.is_kill());
                    copies[c].op = op;
                }
                let write_idx = ctx.merge_node_table[&cp.def.temp_id()].index;
                debug_assert_ne!(write_idx, NONE);
                ltg.insert(write_idx, LtgNode { cp: c, read_idx, num_uses: 0 });

                if cp.def.reg_class().ty() == RegType::Vgpr {
                    has_vgpr_copy = true;
                } else {
                    has_sgpr_copy = true;
                }
            }
        }

        // Build the location-transfer graph edges.
        let reads: Vec<u32> = ltg.values().map(|node| node.read_idx).collect();
        for read in reads {
            if read != NONE {
                if let Some(node) = ltg.get_mut(&read) {
                    node.num_uses += 1;
                }
            }
        }

        // Emit VGPR copies before the end of the logical sequence and SGPR
        // copies at the very end of the block.
        if has_vgpr_copy {
            let pos = program.blocks[i]
                .instructions
                .iter()
                .rposition(|instr| instr.opcode == Opcode::p_logical_end)
                .expect("block with vgpr phi copies must close its logical sequence");
            let mut emitted = Vec::new();
            emit_copies_block(&mut copies, &mut ltg, RegType::Vgpr, &mut emitted);
            let tail: Vec<Instruction> =
                program.blocks[i].instructions.splice(pos..pos, emitted).collect();
            debug_assert!(tail.is_empty());
        }

        if has_sgpr_copy {
            let pos = program.blocks[i].instructions.len().saturating_sub(1);
            let mut emitted = Vec::new();
            emit_copies_block(&mut copies, &mut ltg, RegType::Sgpr, &mut emitted);
            program.blocks[i].instructions.splice(pos..pos, emitted);
        }

        ctx.parallelcopies[i] = copies;
    }

    // Finally, rename coalesced phi operands.
    for block in &mut program.blocks {
        for phi in &mut block.instructions {
            if !phi.is_phi() {
                break;
            }
            for op in &mut phi.operands {
                if !op.is_temp() {
                    continue;
                }
                if let Some(new_op) = renames.remove(&op.temp_id()) {
                    *op = new_op;
                }
            }
        }
    }

    debug_assert!(renames.is_empty());
}

/// Materialize phi-resources as parallel copies and coalesce non-interfering
/// merge sets.
pub fn lower_to_cssa(program: &mut Program) -> CodegenResult<()> {
    reindex_ssa(program);
    let live = live_var_analysis(program);
    program.live = Some(live);

    let mut ctx = CssaCtx {
        parallelcopies: Vec::new(),
        merge_sets: Vec::new(),
        merge_node_table: FxHashMap::default(),
    };
    collect_parallelcopies(program, &mut ctx);
    emit_parallelcopies(program, &mut ctx);

    // Re-validate live variable information.
    if !validate_live_vars(program) {
        return Err(CodegenError::LiveInfo);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominance::dominator_tree;
    use crate::ir::{Builder, Stage};

    /// Diamond: 0 -> {1, 2} -> 3, with a phi in 3.
    fn diamond_with_phi() -> (Program, Temp) {
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

        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
            bld.branch(Opcode::p_cbranch_z, Some(Operand::fixed(crate::ir::EXEC, RegClass::S2)), 2, 1);
        }
        program.blocks[0].instructions = instrs;

        for (idx, def) in [(1usize, a), (2usize, b)] {
            let mut instrs = Vec::new();
            {
                let mut bld = Builder::new(&mut program, &mut instrs);
                bld.pseudo(Opcode::p_logical_start, &[], &[]);
                bld.vop1(
                    Opcode::v_mov_b32,
                    &[Definition::new(def)],
                    &[Operand::c32(idx as u32)],
                );
                bld.pseudo(Opcode::p_logical_end, &[], &[]);
                bld.branch(Opcode::p_branch, None, 3, 3);
            }
            program.blocks[idx].instructions = instrs;
        }

        let phi_def = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(
                Opcode::p_phi,
                &[Definition::new(phi_def)],
                &[Operand::temp(a), Operand::temp(b)],
            );
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            let mut store =
                Instruction::new(Opcode::buffer_store_dword, Format::MUBUF, 4, 0);
            store.operands[0] = Operand::undef(RegClass::V1);
            store.operands[1] = Operand::undef(RegClass::S4);
            store.operands[2] = Operand::undef(RegClass::S1);
            store.operands[3] = Operand::temp(phi_def);
            bld.insert(store);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[3].instructions = instrs;

        (program, phi_def)
    }

    #[test]
    fn phi_operands_become_copies_or_coalesce() {
        let (mut program, _phi_def) = diamond_with_phi();
        dominator_tree(&mut program).unwrap();
        lower_to_cssa(&mut program).unwrap();

        // No phi operand may be a temp from an unrelated merge set anymore:
        // every operand is either coalesced with the source def or defined
        // by a copy in the predecessor.
        let phi = &program.blocks[3].instructions[0];
        assert!(phi.is_phi());
        for (i, op) in phi.operands.iter().enumerate() {
            assert!(op.is_temp());
            let pred = phi_pred(&program, 3, i);
            let defined_in_pred = program.blocks[pred as usize]
                .instructions
                .iter()
                .any(|instr| instr.definitions.iter().any(|d| d.temp_id() == op.temp_id()));
            assert!(defined_in_pred, "operand {i} must be defined in its predecessor");
        }
    }

    fn phi_pred(program: &Program, block: u32, operand: usize) -> u32 {
        program.blocks[block as usize].logical_preds[operand]
    }

    #[test]
    fn live_info_stays_valid() {
        let (mut program, _) = diamond_with_phi();
        dominator_tree(&mut program).unwrap();
        assert!(lower_to_cssa(&mut program).is_ok());
        assert!(validate_live_vars(&mut program));
    }

    #[test]
    fn same_block_defs_tie_break_on_id() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        program.create_and_insert_block();
        let t1 = program.alloc_tmp(RegClass::V1);
        let t2 = program.alloc_tmp(RegClass::V1);
        let mut ctx = CssaCtx {
            parallelcopies: vec![Vec::new()],
            merge_sets: Vec::new(),
            merge_node_table: FxHashMap::default(),
        };
        for t in [t1, t2] {
            ctx.merge_node_table.insert(
                t.id(),
                MergeNode { defined_at: 0, ..MergeNode::default() },
            );
        }
        let _ = &program;
        assert!(defined_after(&ctx, t2, t1));
        assert!(!defined_after(&ctx, t1, t2));
    }
}
