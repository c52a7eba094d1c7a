//! Execution-mask insertion.
//!
//! Tracks a stack of execution masks per block. The top of stack is the
//! currently live `exec`; entries are tagged with the mode they represent.
//! **Exact** mode keeps one lane bit per active invocation, **WQM** extends
//! it to every lane whose pixel quad has any active invocation. Divergent
//! control flow pushes child frames (`s_and_saveexec` at branches, `andn2`
//! at invert blocks) and restores the saved frame at merge points; loops
//! duplicate the predecessor stack and materialize linear phis when breaks,
//! continues or discards leave the mask diverging across iterations.

use crate::ir::{
    Builder, BlockKind, Definition, Format, InstrData, Instruction, Opcode, Operand, Program,
    RegClass, Temp, WaveOp, EXEC, SCC,
};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct MaskType: u8 {
        const GLOBAL = 1 << 0;
        const EXACT = 1 << 1;
        const WQM = 1 << 2;
        /// Active lanes of a loop.
        const LOOP = 1 << 3;
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WqmState {
    Unspecified,
    Exact,
    Wqm,
}

#[derive(Clone)]
struct ExecInfo {
    /// Either a temporary, exec or a constant.
    op: Operand,
    ty: MaskType,
}

struct LoopInfo {
    header: u32,
    num_exec_masks: usize,
    has_divergent_break: bool,
    has_divergent_continue: bool,
    /// Has a discard or demote.
    has_discard: bool,
}

struct ExecCtx {
    info: Vec<Vec<ExecInfo>>,
    loop_stack: Vec<LoopInfo>,
    handle_wqm: bool,
}

fn exec_operand(program: &Program) -> Operand {
    Operand::fixed(EXEC, program.lane_mask())
}

fn exec_def(program: &Program) -> Definition {
    Definition::fixed(EXEC, program.lane_mask())
}

fn needs_exact(instr: &Instruction) -> bool {
    match &instr.data {
        InstrData::Mubuf { disable_wqm, .. }
        | InstrData::Mtbuf { disable_wqm, .. }
        | InstrData::Mimg { disable_wqm, .. }
        | InstrData::FlatLike { disable_wqm, .. } => *disable_wqm,
        _ => instr.format.base() == Format::EXP,
    }
}

fn get_instr_needs(instr: &Instruction) -> WqmState {
    if needs_exact(instr) {
        return WqmState::Exact;
    }
    let pred_by_exec = instr.needs_exec_mask()
        || instr.opcode == Opcode::p_logical_end
        || instr.is_branch();
    if pred_by_exec {
        WqmState::Wqm
    } else {
        WqmState::Unspecified
    }
}

fn transition_to_wqm(ctx: &mut ExecCtx, bld: &mut Builder, idx: usize) {
    if ctx.info[idx].last().unwrap().ty.contains(MaskType::WQM) {
        return;
    }
    if ctx.info[idx].last().unwrap().ty.contains(MaskType::GLOBAL) {
        let mut exec_mask = ctx.info[idx].last().unwrap().op;
        if exec_mask == exec_operand(bld.program) {
            let def = bld.def(bld.lm());
            let t = def.get_temp();
            bld.copy(def, exec_mask);
            exec_mask = Operand::temp(t);
            ctx.info[idx].last_mut().unwrap().op = exec_mask;
        }

        let wqm = bld.w64or32(WaveOp::Wqm);
        let scc = bld.def_fixed(RegClass::S1, SCC);
        let ed = exec_def(bld.program);
        bld.sop1(wqm, &[ed, scc], &[exec_mask]);
        let op = exec_operand(bld.program);
        ctx.info[idx].push(ExecInfo { op, ty: MaskType::GLOBAL | MaskType::WQM });
        return;
    }
    // Otherwise the WQM mask sits one below the current mask.
    ctx.info[idx].pop();
    let below = ctx.info[idx].last().unwrap().clone();
    debug_assert!(below.ty.contains(MaskType::WQM));
    debug_assert!(below.op.is_temp());
    let ed = exec_def(bld.program);
    bld.copy(ed, below.op);
}

fn transition_to_exact(ctx: &mut ExecCtx, bld: &mut Builder, idx: usize) {
    let top = ctx.info[idx].last().unwrap().clone();
    if top.ty.contains(MaskType::EXACT) {
        return;
    }
    // The loop exec mask cannot be removed: the stack depth must stay at
    // num_exec_masks and the mask has other uses.
    if top.ty.contains(MaskType::GLOBAL) && !top.ty.contains(MaskType::LOOP) {
        ctx.info[idx].pop();
        let below = ctx.info[idx].last().unwrap().clone();
        debug_assert!(below.ty.contains(MaskType::EXACT));
        debug_assert!(below.op.is_temp());
        let ed = exec_def(bld.program);
        bld.copy(ed, below.op);
        return;
    }
    // Create an exact mask and push it.
    let global_exact = ctx.info[idx][0].op;
    let wqm = top.op;
    if wqm == exec_operand(bld.program) {
        let saved = bld.def(bld.lm());
        let saved_tmp = saved.get_temp();
        let scc = bld.def_fixed(RegClass::S1, SCC);
        let ed = exec_def(bld.program);
        let eop = exec_operand(bld.program);
        bld.sop1(bld.w64or32(WaveOp::AndSaveexec), &[saved, scc, ed], &[global_exact, eop]);
        ctx.info[idx].last_mut().unwrap().op = Operand::temp(saved_tmp);
    } else {
        let scc = bld.def_fixed(RegClass::S1, SCC);
        let ed = exec_def(bld.program);
        bld.sop2(bld.w64or32(WaveOp::And), &[ed, scc], &[global_exact, wqm]);
        ctx.info[idx].last_mut().unwrap().op = wqm;
    }
    let op = exec_operand(bld.program);
    ctx.info[idx].push(ExecInfo { op, ty: MaskType::EXACT });
}

fn new_linear_phi(bld: &mut Builder, num_preds: usize, first_op: Operand) -> (Temp, Instruction) {
    let mut phi = Instruction::new(Opcode::p_linear_phi, Format::PSEUDO, num_preds, 1);
    let def = bld.def(bld.lm());
    let t = def.get_temp();
    phi.definitions[0] = def;
    phi.operands[0] = first_op;
    (t, phi)
}

fn add_coupling_code(
    program: &mut Program,
    ctx: &mut ExecCtx,
    block_idx: usize,
    old: &mut Vec<Instruction>,
    new_instructions: &mut Vec<Instruction>,
) -> usize {
    let idx = block_idx;
    let kind = program.blocks[idx].kind;
    let preds = program.blocks[idx].linear_preds.clone();
    let mut restore_exec = false;

    // Start block.
    if preds.is_empty() {
        debug_assert_eq!(old[0].opcode, Opcode::p_startpgm);
        let mut bld = Builder::new(program, new_instructions);
        bld.insert(old[0].clone());

        let start_exec = exec_operand(bld.program);
        if ctx.handle_wqm {
            ctx.info[idx]
                .push(ExecInfo { op: start_exec, ty: MaskType::GLOBAL | MaskType::EXACT });
            // Initialize WQM already.
            transition_to_wqm(ctx, &mut bld, idx);
        } else {
            let mut mask = MaskType::GLOBAL;
            if bld.program.config.needs_wqm {
                let wqm = bld.w64or32(WaveOp::Wqm);
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                let eop = exec_operand(bld.program);
                bld.sop1(wqm, &[ed, scc], &[eop]);
                mask |= MaskType::WQM;
            } else {
                mask |= MaskType::EXACT;
            }
            ctx.info[idx].push(ExecInfo { op: start_exec, ty: mask });
        }
        return 1;
    }

    if kind.contains(BlockKind::LOOP_HEADER) {
        debug_assert_eq!(preds[0] as usize, idx - 1);
        ctx.info[idx] = ctx.info[idx - 1].clone();
        let info_idx = ctx.loop_stack.len() - 1;
        debug_assert_eq!(ctx.info[idx].len(), ctx.loop_stack[info_idx].num_exec_masks);

        // Create ssa names for the outer exec masks.
        if ctx.loop_stack[info_idx].has_discard && preds.len() > 1 {
            let mut bld = Builder::new(program, new_instructions);
            for i in 0..ctx.loop_stack[info_idx].num_exec_masks - 1 {
                let (t, phi) = new_linear_phi(&mut bld, preds.len(), ctx.info[idx][i].op);
                bld.insert(phi);
                ctx.info[idx][i].op = Operand::temp(t);
            }
        }

        ctx.info[idx].last_mut().unwrap().ty |= MaskType::LOOP;

        if ctx.loop_stack[info_idx].has_divergent_continue {
            // Create an ssa name for the loop active mask.
            let mut bld = Builder::new(program, new_instructions);
            let top_op = ctx.info[idx].last().unwrap().op;
            let (t, phi) = new_linear_phi(&mut bld, preds.len(), top_op);
            bld.insert(phi);
            ctx.info[idx].last_mut().unwrap().op = Operand::temp(t);

            restore_exec = true;
            let ty = ctx.info[idx].last().unwrap().ty & (MaskType::WQM | MaskType::EXACT);
            ctx.info[idx].push(ExecInfo { op: Operand::temp(t), ty });
        }
    } else if kind.contains(BlockKind::LOOP_EXIT) {
        let loop_info = ctx.loop_stack.pop().unwrap();
        let header = loop_info.header as usize;
        let header_preds = program.blocks[header].linear_preds.clone();
        let mut num_exec_masks = loop_info.num_exec_masks;

        for &pred in &preds {
            debug_assert!(ctx.info[pred as usize].len() >= num_exec_masks);
        }

        // Fill the loop header phis.
        let mut instr_idx = 0;
        if loop_info.has_discard && header_preds.len() > 1 {
            while instr_idx < num_exec_masks - 1 {
                for i in 1..header_preds.len() {
                    let op = ctx.info[header_preds[i] as usize][instr_idx].op;
                    program.blocks[header].instructions[instr_idx].operands[i] = op;
                }
                instr_idx += 1;
            }
        }
        if loop_info.has_divergent_continue {
            for i in 1..header_preds.len() {
                let op = ctx.info[header_preds[i] as usize][num_exec_masks - 1].op;
                program.blocks[header].instructions[instr_idx].operands[i] = op;
            }
            restore_exec = true;
        }
        if loop_info.has_divergent_break {
            restore_exec = true;
            // Drop the loop active mask.
            num_exec_masks -= 1;
        }
        debug_assert!(!kind.contains(BlockKind::TOP_LEVEL) || num_exec_masks <= 2);

        // Create the loop exit phis if not trivial.
        for exec_idx in 0..num_exec_masks {
            let same = ctx.info[preds[0] as usize][exec_idx].op;
            let ty = ctx.info[header_preds[0] as usize][exec_idx].ty;
            let trivial = preds
                .iter()
                .all(|&p| ctx.info[p as usize][exec_idx].op == same);
            if trivial {
                ctx.info[idx].push(ExecInfo { op: same, ty });
            } else {
                let ops: Vec<Operand> =
                    preds.iter().map(|&p| ctx.info[p as usize][exec_idx].op).collect();
                let mut bld = Builder::new(program, new_instructions);
                let (t, mut phi) = new_linear_phi(&mut bld, preds.len(), ops[0]);
                for (i, op) in ops.iter().enumerate() {
                    phi.operands[i] = *op;
                }
                bld.insert(phi);
                ctx.info[idx].push(ExecInfo { op: Operand::temp(t), ty });
            }
        }
        debug_assert_eq!(ctx.info[idx].len(), num_exec_masks);
    } else if preds.len() == 1 {
        ctx.info[idx] = ctx.info[preds[0] as usize].clone();

        // Continue and break blocks implicitly set exec to zero so that
        // parallelcopies before the branch stay unaffected by the changed
        // mask. If the successor does not restore exec, we must.
        if ctx.info[idx].last().unwrap().op.constant_equals(0) {
            debug_assert!(program.blocks[idx].logical_succs.is_empty());
            let succ_kind =
                program.blocks[program.blocks[idx].linear_succs[0] as usize].kind;
            if !succ_kind.intersects(
                BlockKind::LOOP_HEADER
                    | BlockKind::LOOP_EXIT
                    | BlockKind::INVERT
                    | BlockKind::MERGE,
            ) {
                restore_exec = true;
            }
        }
    } else {
        debug_assert_eq!(preds.len(), 2);
        debug_assert_eq!(
            ctx.info[preds[0] as usize].len(),
            ctx.info[preds[1] as usize].len()
        );

        let last = ctx.info[preds[0] as usize].len() - 1;

        // Create phis for diverged temporary exec masks.
        for i in 0..last {
            let op0 = ctx.info[preds[0] as usize][i].op;
            let op1 = ctx.info[preds[1] as usize][i].op;
            let ty = ctx.info[preds[0] as usize][i].ty & ctx.info[preds[1] as usize][i].ty;
            if op0 == op1 {
                ctx.info[idx].push(ExecInfo { op: op0, ty });
                continue;
            }
            let mut bld = Builder::new(program, new_instructions);
            let (t, mut phi) = new_linear_phi(&mut bld, 2, op0);
            phi.operands[1] = op1;
            bld.insert(phi);
            ctx.info[idx].push(ExecInfo { op: Operand::temp(t), ty });
        }

        if kind.contains(BlockKind::MERGE) {
            restore_exec = true;
        } else {
            // The last mask is already in exec.
            let op0 = ctx.info[preds[0] as usize][last].op;
            let op1 = ctx.info[preds[1] as usize][last].op;
            let current = if op0 == op1 { op0 } else { exec_operand(program) };
            let ty = ctx.info[preds[0] as usize][last].ty & ctx.info[preds[1] as usize][last].ty;
            ctx.info[idx].push(ExecInfo { op: current, ty });
        }
    }

    // Move the phis over.
    let mut i = 0;
    while i < old.len() && old[i].is_phi() {
        new_instructions.push(old[i].clone());
        i += 1;
    }

    if ctx.handle_wqm
        && kind.contains(BlockKind::TOP_LEVEL)
        && ctx.info[idx].len() == 2
        && i < old.len()
        && old[i].opcode == Opcode::p_end_wqm
    {
        // End WQM handling when it is not needed anymore.
        ctx.info[idx].last_mut().unwrap().ty |= MaskType::GLOBAL;
        let mut bld = Builder::new(program, new_instructions);
        transition_to_exact(ctx, &mut bld, idx);
        ctx.handle_wqm = false;
        restore_exec = false;
        i += 1;
    }

    // Restore the exec mask after divergent control flow.
    if restore_exec {
        let restore = ctx.info[idx].last().unwrap().op;
        let mut bld = Builder::new(program, new_instructions);
        let ed = exec_def(bld.program);
        bld.copy(ed, restore);
    }

    i
}

/// The data register of atomic VMEM instructions is shared between source
/// and destination, which would force a live-range split in Exact mode;
/// make the split explicit while still in WQM.
fn handle_atomic_data(
    ctx: &mut ExecCtx,
    bld: &mut Builder,
    block_idx: usize,
    instr: &mut Instruction,
) {
    let data_idx: i32 = if !instr.is_vmem() || instr.definitions.is_empty() {
        -1
    } else if instr.format.base() == Format::MIMG {
        if instr.operands.len() > 2 && instr.operands[2].is_temp() {
            2
        } else {
            -1
        }
    } else if instr.operands.len() == 4 {
        3
    } else {
        -1
    };

    if data_idx != -1 {
        transition_to_wqm(ctx, bld, block_idx);
        let data = instr.operands[data_idx as usize].get_temp();
        let def = bld.def(data.reg_class());
        let copy = def.get_temp();
        bld.copy(def, Operand::temp(data));
        instr.operands[data_idx as usize].set_temp(copy);
    }
}

fn process_instructions(
    program: &mut Program,
    ctx: &mut ExecCtx,
    block_idx: usize,
    old: &mut Vec<Instruction>,
    start: usize,
    new_instructions: &mut Vec<Instruction>,
) {
    let idx = block_idx;
    let mut state = if ctx.info[idx].last().unwrap().ty.contains(MaskType::WQM) {
        WqmState::Wqm
    } else {
        WqmState::Exact
    };

    for j in start..old.len() {
        let mut instr = old[j].clone();
        let mut bld = Builder::new(program, new_instructions);

        let needs = if ctx.handle_wqm { get_instr_needs(&instr) } else { WqmState::Unspecified };
        if needs == WqmState::Wqm && state != WqmState::Wqm {
            transition_to_wqm(ctx, &mut bld, idx);
            state = WqmState::Wqm;
        } else if needs == WqmState::Exact {
            if ctx.handle_wqm {
                handle_atomic_data(ctx, &mut bld, idx, &mut instr);
            }
            transition_to_exact(ctx, &mut bld, idx);
            state = WqmState::Exact;
        }

        if instr.opcode == Opcode::p_discard_if {
            let mut current_exec = exec_operand(bld.program);

            if j + 1 < old.len() && old[j + 1].opcode == Opcode::p_end_wqm {
                // Transition to Exact without an extra instruction.
                ctx.info[idx].truncate(1);
                debug_assert_eq!(
                    ctx.info[idx][0].ty,
                    MaskType::EXACT | MaskType::GLOBAL
                );
                current_exec = ctx.info[idx][0].op;
                ctx.info[idx][0].op = exec_operand(bld.program);
                state = WqmState::Exact;
            } else if ctx.info[idx].len() >= 2 && ctx.handle_wqm {
                // Preserve the WQM mask.
                ctx.info[idx][1].ty &= !MaskType::GLOBAL;
            }

            let cond;
            if instr.operands[0].is_constant() {
                debug_assert_eq!(instr.operands[0].constant_value(), u32::MAX);
                // Save the condition and set exec to zero.
                let saved = bld.def(bld.lm());
                cond = saved.get_temp();
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                let eop = exec_operand(bld.program);
                bld.sop1(
                    bld.w64or32(WaveOp::AndSaveexec),
                    &[saved, scc, ed],
                    &[Operand::zero(bld.lm().bytes()), eop],
                );
            } else {
                cond = instr.operands[0].get_temp();
                // Discard from the current exec.
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                bld.sop2(
                    bld.w64or32(WaveOp::AndN2),
                    &[ed, scc],
                    &[current_exec, Operand::temp(cond)],
                );
            }

            if ctx.info[idx].len() == 1 {
                instr.operands[0] = exec_operand(bld.program);
            } else {
                // Discard from the inner to the outer exec mask on the stack.
                let num = ctx.info[idx].len() as i32 - 2;
                let mut exit_cond = None;
                for i in (0..=num).rev() {
                    let d = bld.def(bld.lm());
                    let t = d.get_temp();
                    let scc = bld.def_fixed(RegClass::S1, SCC);
                    let scc_tmp = scc.get_temp();
                    let prev = ctx.info[idx][i as usize].op;
                    bld.sop2(
                        bld.w64or32(WaveOp::AndN2),
                        &[d, scc],
                        &[prev, Operand::temp(cond)],
                    );
                    ctx.info[idx][i as usize].op = Operand::temp(t);
                    exit_cond = Some(scc_tmp);
                }
                instr.operands[0] = Operand::fixed_temp(exit_cond.unwrap(), SCC);
            }

            ctx.info[idx].last_mut().unwrap().op = exec_operand(bld.program);
            instr.opcode = Opcode::p_exit_early_if_not;
            bld.insert(instr);
            continue;
        } else if instr.opcode == Opcode::p_is_helper {
            let dst = instr.definitions[0];
            debug_assert_eq!(dst.size(), bld.lm().size());
            if state == WqmState::Exact {
                bld.sop1(bld.w64or32(WaveOp::Mov), &[dst], &[Operand::zero(bld.lm().bytes())]);
            } else {
                let exact_mask = ctx.info[idx][0].clone();
                debug_assert!(exact_mask.ty.contains(MaskType::EXACT));
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let eop = exec_operand(bld.program);
                bld.sop2(bld.w64or32(WaveOp::AndN2), &[dst, scc], &[eop, exact_mask.op]);
            }
            continue;
        } else if instr.opcode == Opcode::p_demote_to_helper {
            debug_assert!(ctx.info[idx][0]
                .ty
                .contains(MaskType::EXACT | MaskType::GLOBAL));

            let nested_cf = !ctx.info[idx].last().unwrap().ty.contains(MaskType::GLOBAL);
            if ctx.handle_wqm && state == WqmState::Exact && nested_cf {
                // Transition back to WQM without an extra instruction.
                ctx.info[idx].pop();
                state = WqmState::Wqm;
            } else if j + 1 < old.len() && old[j + 1].opcode == Opcode::p_end_wqm {
                // Transition to Exact without an extra instruction.
                ctx.info[idx].truncate(1);
                state = WqmState::Exact;
            } else if nested_cf {
                // Save current exec temporarily.
                let d = bld.def(bld.lm());
                let t = d.get_temp();
                let eop = exec_operand(bld.program);
                bld.copy(d, eop);
                ctx.info[idx].last_mut().unwrap().op = Operand::temp(t);
            } else {
                ctx.info[idx].last_mut().unwrap().op = exec_operand(bld.program);
            }

            // Remove the invocations from the global exact mask.
            let (def, def_op) = if state == WqmState::Exact {
                (exec_def(bld.program), exec_operand(bld.program))
            } else {
                let d = bld.def(bld.lm());
                let t = d.get_temp();
                (d, Operand::temp(t))
            };
            let src = if instr.operands[0].is_constant() {
                exec_operand(bld.program)
            } else {
                instr.operands[0]
            };
            let scc = bld.def_fixed(RegClass::S1, SCC);
            let global = ctx.info[idx][0].op;
            bld.sop2(bld.w64or32(WaveOp::AndN2), &[def, scc], &[global, src]);
            ctx.info[idx][0].op = def_op;

            // Update the global WQM mask and store it in exec.
            if state == WqmState::Wqm {
                debug_assert!(ctx.info[idx].len() > 1);
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                bld.sop1(bld.w64or32(WaveOp::Wqm), &[ed, scc], &[def_op]);
            }

            // End the shader if the global mask is zero.
            instr.opcode = Opcode::p_exit_early_if_not;
            instr.operands[0] = exec_operand(bld.program);
            bld.insert(instr);

            // Update all other exec masks.
            if nested_cf {
                let global_idx = if state == WqmState::Wqm { 1 } else { 0 };
                for i in global_idx + 1..ctx.info[idx].len() - 1 {
                    let d = bld.def(bld.lm());
                    let t = d.get_temp();
                    let scc = bld.def_fixed(RegClass::S1, SCC);
                    let eop = exec_operand(bld.program);
                    let prev = ctx.info[idx][i].op;
                    bld.sop2(bld.w64or32(WaveOp::And), &[d, scc], &[prev, eop]);
                    ctx.info[idx][i].op = Operand::temp(t);
                }
                // Update the current exec and save the WQM mask.
                let saved = bld.def(bld.lm());
                let t = saved.get_temp();
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                let top = ctx.info[idx].last().unwrap().op;
                let eop = exec_operand(bld.program);
                bld.sop1(bld.w64or32(WaveOp::AndSaveexec), &[saved, scc, ed], &[top, eop]);
                ctx.info[idx][global_idx].op = Operand::temp(t);
                ctx.info[idx].last_mut().unwrap().op = exec_operand(bld.program);
            }
            continue;
        } else if instr.opcode == Opcode::p_elect {
            let all_lanes_enabled = ctx.info[idx].last().unwrap().op.constant_equals(u32::MAX);
            let dst = instr.definitions[0];

            if all_lanes_enabled {
                bld.copy(dst, Operand::c32_or_c64(1, dst.size() == 2));
            } else {
                let lane = bld.def(RegClass::S1);
                let lane_tmp = lane.get_temp();
                let eop = exec_operand(bld.program);
                bld.sop1(bld.w64or32(WaveOp::Ff1), &[lane], &[eop]);
                let scc = bld.def_fixed(RegClass::S1, SCC);
                bld.sop2(
                    Opcode::s_lshl_b32,
                    &[dst, scc],
                    &[Operand::c32_or_c64(1, dst.size() == 2), Operand::temp(lane_tmp)],
                );
            }
            continue;
        } else if instr.opcode == Opcode::p_end_wqm {
            debug_assert!(ctx.info[idx].len() <= 2);
            // This instruction indicates the end of WQM mode.
            ctx.info[idx].last_mut().unwrap().ty |= MaskType::GLOBAL;
            transition_to_exact(ctx, &mut bld, idx);
            state = WqmState::Exact;
            ctx.handle_wqm = false;
            continue;
        }

        new_instructions.push(instr);
    }
}

fn add_branch_code(program: &mut Program, ctx: &mut ExecCtx, block_idx: usize) {
    let idx = block_idx;
    let kind = program.blocks[idx].kind;
    let linear_succs = program.blocks[idx].linear_succs.clone();

    if linear_succs.is_empty() {
        return;
    }

    if kind.contains(BlockKind::LOOP_PREHEADER) {
        // Collect information about the succeeding loop.
        let mut has_divergent_break = false;
        let mut has_divergent_continue = false;
        let mut has_discard = false;
        let loop_nest_depth = program.blocks[idx + 1].loop_nest_depth;

        let mut i = idx + 1;
        while i < program.blocks.len() && program.blocks[i].loop_nest_depth >= loop_nest_depth {
            let loop_block = &program.blocks[i];
            if loop_block.kind.contains(BlockKind::USES_DISCARD) {
                has_discard = true;
            }
            if loop_block.loop_nest_depth == loop_nest_depth
                && !loop_block.kind.contains(BlockKind::UNIFORM)
            {
                if loop_block.kind.contains(BlockKind::BREAK) {
                    has_divergent_break = true;
                } else if loop_block.kind.contains(BlockKind::CONTINUE) {
                    has_divergent_continue = true;
                }
            }
            i += 1;
        }

        if has_divergent_break {
            // Save the restore mask.
            let current = ctx.info[idx].last().unwrap().op;
            if !current.is_temp() && !current.is_constant() {
                let mut copy_instrs = Vec::new();
                {
                    let mut bld = Builder::new(program, &mut copy_instrs);
                    let d = bld.def(bld.lm());
                    let t = d.get_temp();
                    let eop = exec_operand(bld.program);
                    bld.copy(d, eop);
                    ctx.info[idx].last_mut().unwrap().op = Operand::temp(t);
                }
                let pos = program.blocks[idx].instructions.len() - 1;
                program.blocks[idx].instructions.splice(pos..pos, copy_instrs);
            }
            let ty = ctx.info[idx].last().unwrap().ty & (MaskType::WQM | MaskType::EXACT);
            ctx.info[idx].push(ExecInfo { op: exec_operand(program), ty });
        }
        let num_exec_masks = ctx.info[idx].len();

        ctx.loop_stack.push(LoopInfo {
            header: linear_succs[0],
            num_exec_masks,
            has_divergent_break,
            has_divergent_continue,
            has_discard,
        });

        let branch = program.blocks[idx].instructions.last_mut().unwrap();
        branch.branch_targets_mut()[0] = linear_succs[0];
    } else if kind.contains(BlockKind::CONTINUE_OR_BREAK) {
        debug_assert_eq!(
            program.blocks[idx].instructions.last().unwrap().opcode,
            Opcode::p_branch
        );
        program.blocks[idx].instructions.pop();

        while !ctx.info[idx].last().unwrap().ty.contains(MaskType::LOOP) {
            ctx.info[idx].pop();
        }

        let mut instrs = std::mem::take(&mut program.blocks[idx].instructions);
        {
            let mut bld = Builder::new(program, &mut instrs);
            let d = bld.def(bld.lm());
            let scc = bld.def_fixed(RegClass::S1, SCC);
            let cond = scc.get_temp();
            let top = ctx.info[idx].last().unwrap().op;
            bld.sop2(bld.w64or32(WaveOp::Or), &[d, scc], &[top, Operand::zero(bld.lm().bytes())]);
            bld.branch(
                Opcode::p_cbranch_nz,
                Some(Operand::fixed_temp(cond, SCC)),
                linear_succs[1],
                linear_succs[0],
            );
        }
        program.blocks[idx].instructions = instrs;
    } else if kind.contains(BlockKind::UNIFORM) {
        let branch = program.blocks[idx].instructions.last_mut().unwrap();
        if branch.opcode == Opcode::p_branch {
            branch.branch_targets_mut()[0] = linear_succs[0];
        } else {
            branch.branch_targets_mut()[0] = linear_succs[1];
            branch.branch_targets_mut()[1] = linear_succs[0];
        }
    } else if kind.contains(BlockKind::BRANCH) {
        debug_assert_eq!(
            program.blocks[idx].instructions.last().unwrap().opcode,
            Opcode::p_cbranch_z
        );
        let branch = program.blocks[idx].instructions.pop().unwrap();
        let cond = branch.operands[0].get_temp();
        let (_, rarely, never) = branch.branch();

        let ty = ctx.info[idx].last().unwrap().ty & (MaskType::WQM | MaskType::EXACT);
        let mut instrs = std::mem::take(&mut program.blocks[idx].instructions);
        {
            let mut bld = Builder::new(program, &mut instrs);
            let top = ctx.info[idx].last().unwrap().op;
            if top.constant_equals(u32::MAX) {
                let ed = exec_def(bld.program);
                bld.copy(ed, Operand::temp(cond));
            } else if top.is_temp() {
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                let eop = exec_operand(bld.program);
                bld.sop2(bld.w64or32(WaveOp::And), &[ed, scc], &[Operand::temp(cond), eop]);
            } else {
                let saved = bld.def(bld.lm());
                let t = saved.get_temp();
                let scc = bld.def_fixed(RegClass::S1, SCC);
                let ed = exec_def(bld.program);
                let eop = exec_operand(bld.program);
                bld.sop1(
                    bld.w64or32(WaveOp::AndSaveexec),
                    &[saved, scc, ed],
                    &[Operand::temp(cond), eop],
                );
                ctx.info[idx].last_mut().unwrap().op = Operand::temp(t);
            }

            ctx.info[idx].push(ExecInfo { op: exec_operand(bld.program), ty });

            let eop = exec_operand(bld.program);
            let r = bld.branch(Opcode::p_cbranch_z, Some(eop), linear_succs[1], linear_succs[0]);
            if let InstrData::Branch { rarely_taken, never_taken, .. } = &mut r.data {
                *rarely_taken = rarely;
                *never_taken = never;
            }
        }
        program.blocks[idx].instructions = instrs;
    } else if kind.contains(BlockKind::INVERT) {
        debug_assert_eq!(
            program.blocks[idx].instructions.last().unwrap().opcode,
            Opcode::p_branch
        );
        let branch = program.blocks[idx].instructions.pop().unwrap();
        let (_, rarely, never) = branch.branch();

        debug_assert!(ctx.info[idx].len() >= 2);
        let orig_exec = ctx.info[idx][ctx.info[idx].len() - 2].op;
        let mut instrs = std::mem::take(&mut program.blocks[idx].instructions);
        {
            let mut bld = Builder::new(program, &mut instrs);
            let scc = bld.def_fixed(RegClass::S1, SCC);
            let ed = exec_def(bld.program);
            let eop = exec_operand(bld.program);
            bld.sop2(bld.w64or32(WaveOp::AndN2), &[ed, scc], &[orig_exec, eop]);

            let eop = exec_operand(bld.program);
            let r = bld.branch(Opcode::p_cbranch_z, Some(eop), linear_succs[1], linear_succs[0]);
            if let InstrData::Branch { rarely_taken, never_taken, .. } = &mut r.data {
                *rarely_taken = rarely;
                *never_taken = never;
            }
        }
        program.blocks[idx].instructions = instrs;
    } else if kind.contains(BlockKind::BREAK) || kind.contains(BlockKind::CONTINUE) {
        debug_assert_eq!(
            program.blocks[idx].instructions.last().unwrap().opcode,
            Opcode::p_branch
        );
        program.blocks[idx].instructions.pop();

        let is_break = kind.contains(BlockKind::BREAK);
        let mut instrs = std::mem::take(&mut program.blocks[idx].instructions);
        let mut cond = None;
        {
            let mut bld = Builder::new(program, &mut instrs);
            for exec_idx in (0..ctx.info[idx].len() - 1).rev() {
                // A continue stops updating at the loop mask; a break
                // includes it.
                if !is_break && ctx.info[idx][exec_idx].ty.contains(MaskType::LOOP) {
                    break;
                }
                let d = bld.def(bld.lm());
                let t = d.get_temp();
                let scc = bld.def_fixed(RegClass::S1, SCC);
                cond = Some(scc.get_temp());
                let mask = ctx.info[idx][exec_idx].op;
                let eop = exec_operand(bld.program);
                bld.sop2(bld.w64or32(WaveOp::AndN2), &[d, scc], &[mask, eop]);
                ctx.info[idx][exec_idx].op = Operand::temp(t);
                if is_break && ctx.info[idx][exec_idx].ty.contains(MaskType::LOOP) {
                    break;
                }
            }
            let cond = cond.expect("break/continue outside of a loop mask");

            // Implicitly set exec to zero and branch.
            ctx.info[idx].last_mut().unwrap().op = Operand::zero(bld.lm().bytes());
            bld.branch(
                Opcode::p_cbranch_nz,
                Some(Operand::fixed_temp(cond, SCC)),
                linear_succs[1],
                linear_succs[0],
            );
        }
        program.blocks[idx].instructions = instrs;
    }
}

fn process_block(program: &mut Program, ctx: &mut ExecCtx, block_idx: usize) {
    let mut old = std::mem::take(&mut program.blocks[block_idx].instructions);
    let mut new_instructions = Vec::with_capacity(old.len());

    let start = add_coupling_code(program, ctx, block_idx, &mut old, &mut new_instructions);

    debug_assert!(
        !program.blocks[block_idx].linear_succs.is_empty() || ctx.info[block_idx].len() <= 2
    );

    process_instructions(program, ctx, block_idx, &mut old, start, &mut new_instructions);

    program.blocks[block_idx].instructions = new_instructions;

    add_branch_code(program, ctx, block_idx);
}

/// Insert the per-block execution-mask bookkeeping.
pub fn insert_exec_mask(program: &mut Program) {
    let mut ctx = ExecCtx {
        info: vec![Vec::new(); program.blocks.len()],
        loop_stack: Vec::new(),
        handle_wqm: program.config.needs_wqm && program.config.needs_exact,
    };

    for block_idx in 0..program.blocks.len() {
        process_block(program, &mut ctx, block_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ChipClass, Stage};

    /// 0 (branch) -> {1 (then), 2 (invert)}; 2 -> {3 (else), 4}; 1,3 -> 4 (merge).
    fn divergent_if() -> Program {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        for _ in 0..5 {
            program.create_and_insert_block();
        }
        let linear = [(0u32, 1u32), (0, 2), (1, 2), (2, 3), (2, 4), (3, 4)];
        for &(from, to) in &linear {
            program.blocks[from as usize].linear_succs.push(to);
            program.blocks[to as usize].linear_preds.push(from);
        }
        for block in &mut program.blocks {
            block.linear_succs.sort_unstable();
            block.linear_preds.sort_unstable();
        }
        program.blocks[0].kind = BlockKind::BRANCH | BlockKind::TOP_LEVEL;
        program.blocks[2].kind = BlockKind::INVERT;
        program.blocks[4].kind = BlockKind::MERGE | BlockKind::TOP_LEVEL;

        let cond = program.alloc_tmp(RegClass::S2);

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_startpgm, &[], &[]);
            bld.branch(Opcode::p_cbranch_z, Some(Operand::temp(cond)), 2, 1);
        }
        program.blocks[0].instructions = instrs;

        for idx in [1usize, 2, 3] {
            let mut instrs = Vec::new();
            {
                let mut bld = Builder::new(&mut program, &mut instrs);
                let (target, fall) = match idx {
                    1 => (2, 2),
                    2 => (4, 3),
                    _ => (4, 4),
                };
                bld.branch(Opcode::p_branch, None, target, fall);
            }
            program.blocks[idx].instructions = instrs;
        }

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[4].instructions = instrs;
        program
    }

    #[test]
    fn branch_block_saves_exec() {
        let mut program = divergent_if();
        insert_exec_mask(&mut program);

        let b0 = &program.blocks[0].instructions;
        let save = b0
            .iter()
            .find(|i| i.opcode == Opcode::s_and_saveexec_b64)
            .expect("branch block must save exec");
        assert!(save.writes_exec());
        let branch = b0.last().unwrap();
        assert_eq!(branch.opcode, Opcode::p_cbranch_z);
        assert_eq!(branch.operands[0].phys_reg(), EXEC);
    }

    #[test]
    fn invert_block_flips_lanes() {
        let mut program = divergent_if();
        insert_exec_mask(&mut program);

        let b2 = &program.blocks[2].instructions;
        let andn2 = b2
            .iter()
            .find(|i| i.opcode == Opcode::s_andn2_b64)
            .expect("invert block computes andn2(orig, exec)");
        assert!(andn2.writes_exec());
        assert_eq!(andn2.operands[1].phys_reg(), EXEC);
    }

    #[test]
    fn merge_block_restores_exec() {
        let mut program = divergent_if();
        insert_exec_mask(&mut program);

        let b4 = &program.blocks[4].instructions;
        let restore = b4.iter().find(|i| i.writes_exec());
        assert!(restore.is_some(), "merge block must restore exec");
    }

    #[test]
    fn elect_lowers_to_first_bit() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        program.create_and_insert_block();
        let dst = program.alloc_tmp(RegClass::S2);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_startpgm, &[], &[]);
            bld.pseudo(Opcode::p_elect, &[Definition::new(dst)], &[]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        insert_exec_mask(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert!(instrs.iter().any(|i| i.opcode == Opcode::s_ff1_i32_b64));
        assert!(instrs.iter().any(|i| i.opcode == Opcode::s_lshl_b32));
        assert!(instrs.iter().all(|i| i.opcode != Opcode::p_elect));
    }
}
