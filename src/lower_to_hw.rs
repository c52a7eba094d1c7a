//! Expansion of pseudo instructions into the concrete instruction stream.
//!
//! Parallel copies partition into chains and cycles: chains are emitted
//! leaves-first, two-cycles use the native swap where available (three XORs
//! otherwise), and larger cycles park one value in a caller-provided scratch
//! register. SCC preservation is tracked because some scratch choices would
//! clobber an scc value a later branch still needs. Reductions expand into
//! the quad-perm / row-shift / broadcast sequences of the ISA generation.
//! Discards route to a lazily created shared exit block holding a null
//! export and `s_endpgm`.

use std::collections::BTreeMap;

use crate::ir::{
    Builder, BlockKind, ChipClass, Definition, Format, InstrData, Instruction, Opcode, Operand,
    PhysReg, Program, ReduceOp, RegClass, RegType, EXEC, EXEC_HI, EXEC_LO, SCC, VCC,
};
use crate::{CodegenError, CodegenResult};

const EXP_NULL_TARGET: u8 = 9;

fn dpp_quad_perm(a: u16, b: u16, c: u16, d: u16) -> u16 {
    a | (b << 2) | (c << 4) | (d << 6)
}
const DPP_ROW_SR_BASE: u16 = 0x110;
const DPP_WF_SR1: u16 = 0x138;
const DPP_ROW_MIRROR: u16 = 0x140;
const DPP_ROW_HALF_MIRROR: u16 = 0x141;
const DPP_ROW_BCAST15: u16 = 0x142;
const DPP_ROW_BCAST31: u16 = 0x143;

fn dpp_row_sr(n: u16) -> u16 {
    DPP_ROW_SR_BASE | n
}

/// `ds_swizzle` lane pattern in bit mode.
fn ds_pattern_bitmode(and_mask: u16, or_mask: u16, xor_mask: u16) -> u16 {
    and_mask | (or_mask << 5) | (xor_mask << 10)
}

#[derive(Clone, Copy)]
struct CopyOperation {
    op: Operand,
    def: Definition,
    uses: u32,
    size: u32,
}

fn reg_of(def: &Definition) -> u32 {
    def.phys_reg().reg()
}

/// Expand one parallel-copy map into moves, swaps and constant loads.
fn handle_operands(
    mut copy_map: BTreeMap<u32, CopyOperation>,
    bld: &mut Builder,
    scratch_sgpr: PhysReg,
    tmp_in_scc: bool,
) {
    let chip = bld.chip();
    let mut writes_scc = false;

    // Count the number of uses for each destination register.
    let keys: Vec<u32> = copy_map.keys().copied().collect();
    for key in keys {
        let entry = copy_map[&key];
        if entry.op.is_constant() {
            continue;
        }
        if entry.def.phys_reg() == SCC {
            writes_scc = true;
        }
        debug_assert!(!tmp_in_scc || entry.def.phys_reg() != scratch_sgpr);

        // Identity copies disappear.
        if key == entry.op.phys_reg().reg() {
            copy_map.remove(&key);
            continue;
        }
        if let Some(target) = copy_map.get_mut(&entry.op.phys_reg().reg()) {
            target.uses += 1;
        }
    }

    // First, emit the non-cyclic paths of the location transfer graph.
    let preserve_scc = tmp_in_scc && !writes_scc;
    'paths: loop {
        let key = copy_map.iter().find(|(_, e)| e.uses == 0).map(|(&k, _)| k);
        let key = match key {
            Some(k) => k,
            None => break 'paths,
        };
        let mut entry = copy_map[&key];

        // Coalesce two 32-bit sgpr copies into one 64-bit copy.
        if entry.def.reg_class().ty() == RegType::Sgpr
            && entry.size == 1
            && !entry.op.is_constant()
            && key % 2 == entry.op.phys_reg().reg() % 2
        {
            let other_def_reg = if key % 2 != 0 { key - 1 } else { key + 1 };
            let other_op_reg = if key % 2 != 0 {
                entry.op.phys_reg().reg() - 1
            } else {
                entry.op.phys_reg().reg() + 1
            };
            let other_matches = copy_map
                .get(&other_def_reg)
                .map(|other| {
                    other.uses == 0
                        && other.size == 1
                        && other.op.is_fixed()
                        && !other.op.is_constant()
                        && other.op.phys_reg().reg() == other_op_reg
                })
                .unwrap_or(false);
            if other_matches {
                let low_key = key.min(other_def_reg);
                let low = copy_map[&low_key];
                copy_map.remove(&key.max(other_def_reg));
                copy_map.remove(&low_key);
                entry = CopyOperation {
                    op: Operand::fixed(low.op.phys_reg(), RegClass::S2),
                    def: Definition::fixed(low.def.phys_reg(), RegClass::S2),
                    uses: 0,
                    size: 2,
                };
                copy_map.insert(low_key, entry);
            }
        }

        if entry.def.phys_reg() == SCC {
            let scc_def = Definition::fixed(SCC, RegClass::S1);
            bld.sopc(Opcode::s_cmp_lg_i32, &[scc_def], &[entry.op, Operand::c32(0)]);
        } else if entry.size == 2 && entry.def.reg_class().ty() == RegType::Sgpr {
            bld.sop1(
                Opcode::s_mov_b64,
                &[Definition::fixed(entry.def.phys_reg(), RegClass::S2)],
                &[Operand::fixed(entry.op.phys_reg(), RegClass::S2)],
            );
        } else {
            bld.copy(entry.def, entry.op);
        }

        // Reduce the use counts of the operand registers.
        if !entry.op.is_constant() {
            for i in 0..entry.size {
                if let Some(target) = copy_map.get_mut(&(entry.op.phys_reg().reg() + i)) {
                    target.uses -= 1;
                }
            }
        }

        copy_map.remove(&key);
    }

    if copy_map.is_empty() {
        return;
    }

    // Every leftover target register is also an operand: all entries are
    // part of a cycle. Resolve with swaps; constants get written last.
    let mut constants = false;
    let keys: Vec<u32> = copy_map.keys().copied().collect();
    for key in keys {
        let swap = match copy_map.get(&key) {
            Some(e) => *e,
            None => continue,
        };
        debug_assert!(swap.op.is_fixed() || swap.op.is_constant());
        if key == swap.op.phys_reg().reg() {
            continue;
        }
        if swap.op.is_constant() {
            constants = true;
            continue;
        }

        if preserve_scc && swap.def.reg_class().ty() == RegType::Sgpr {
            debug_assert!(swap.def.phys_reg() != scratch_sgpr);
        }

        debug_assert_eq!(swap.op.reg_class(), swap.def.reg_class());
        let def_as_op = Operand::fixed(swap.def.phys_reg(), swap.def.reg_class());
        let op_as_def = Definition::fixed(swap.op.phys_reg(), swap.op.reg_class());
        if chip >= ChipClass::Gfx9 && swap.def.reg_class().ty() == RegType::Vgpr {
            bld.vop1(Opcode::v_swap_b32, &[swap.def, op_as_def], &[swap.op, def_as_op]);
        } else if swap.op.phys_reg() == SCC || swap.def.phys_reg() == SCC {
            // Swap scc with another sgpr.
            debug_assert!(!preserve_scc);
            let other =
                if swap.op.phys_reg() == SCC { swap.def.phys_reg() } else { swap.op.phys_reg() };
            bld.sop1(
                Opcode::s_mov_b32,
                &[Definition::fixed(scratch_sgpr, RegClass::S1)],
                &[Operand::fixed(SCC, RegClass::S1)],
            );
            bld.sopc(
                Opcode::s_cmp_lg_i32,
                &[Definition::fixed(SCC, RegClass::S1)],
                &[Operand::fixed(other, RegClass::S1), Operand::c32(0)],
            );
            bld.sop1(
                Opcode::s_mov_b32,
                &[Definition::fixed(other, RegClass::S1)],
                &[Operand::fixed(scratch_sgpr, RegClass::S1)],
            );
        } else if swap.def.reg_class().ty() == RegType::Sgpr {
            if preserve_scc {
                bld.sop1(
                    Opcode::s_mov_b32,
                    &[Definition::fixed(scratch_sgpr, RegClass::S1)],
                    &[swap.op],
                );
                bld.sop1(Opcode::s_mov_b32, &[op_as_def], &[def_as_op]);
                bld.sop1(
                    Opcode::s_mov_b32,
                    &[swap.def],
                    &[Operand::fixed(scratch_sgpr, RegClass::S1)],
                );
            } else {
                let scc_def = Definition::fixed(SCC, RegClass::S1);
                bld.sop2(Opcode::s_xor_b32, &[op_as_def, scc_def], &[swap.op, def_as_op]);
                bld.sop2(Opcode::s_xor_b32, &[swap.def, scc_def], &[swap.op, def_as_op]);
                bld.sop2(Opcode::s_xor_b32, &[op_as_def, scc_def], &[swap.op, def_as_op]);
            }
        } else {
            bld.vop2(Opcode::v_xor_b32, &[op_as_def], &[swap.op, def_as_op]);
            bld.vop2(Opcode::v_xor_b32, &[swap.def], &[swap.op, def_as_op]);
            bld.vop2(Opcode::v_xor_b32, &[op_as_def], &[swap.op, def_as_op]);
        }

        // The target whose operand just moved reads from the new place.
        debug_assert_eq!(swap.uses, 1);
        let fix = copy_map
            .iter()
            .find(|(&k, e)| k > key && e.op.is_fixed() && e.op.phys_reg().reg() == key)
            .map(|(&k, _)| k);
        if let Some(fix_key) = fix {
            copy_map.get_mut(&fix_key).unwrap().op.set_fixed(swap.op.phys_reg());
        }
        copy_map.remove(&key);
    }

    // Copy constants into registers that were operands.
    if constants {
        for (_, entry) in copy_map {
            if !entry.op.is_constant() {
                continue;
            }
            if entry.def.phys_reg() == SCC {
                let scc_def = Definition::fixed(SCC, RegClass::S1);
                let v = if entry.op.constant_value() != 0 { 1 } else { 0 };
                bld.sopc(Opcode::s_cmp_lg_i32, &[scc_def], &[Operand::c32(0), Operand::c32(v)]);
            } else {
                bld.copy(entry.def, entry.op);
            }
        }
    }
}

fn get_reduction_identity(op: ReduceOp, idx: u32) -> u32 {
    match op {
        ReduceOp::IAdd32
        | ReduceOp::FAdd32
        | ReduceOp::IOr32
        | ReduceOp::IXor32
        | ReduceOp::UMax32 => 0,
        ReduceOp::FAdd64 => 0,
        ReduceOp::IMul32 => 1,
        ReduceOp::FMul32 => 0x3f80_0000,
        ReduceOp::FMul64 => {
            if idx != 0 {
                0x3ff0_0000
            } else {
                0
            }
        }
        ReduceOp::IMin32 => i32::MAX as u32,
        ReduceOp::IMax32 => i32::MIN as u32,
        ReduceOp::UMin32 | ReduceOp::IAnd32 => u32::MAX,
        ReduceOp::FMin32 => 0x7f80_0000,
        ReduceOp::FMax32 => 0xff80_0000,
        ReduceOp::FMin64 => {
            if idx != 0 {
                0x7ff0_0000
            } else {
                0
            }
        }
        ReduceOp::FMax64 => {
            if idx != 0 {
                0xfff0_0000
            } else {
                0
            }
        }
        ReduceOp::Gfx10Wave64Bpermute => 0,
    }
}

fn get_reduction_opcode(chip: ChipClass, op: ReduceOp) -> (Opcode, Format, bool) {
    match op {
        ReduceOp::IAdd32 => {
            if chip < ChipClass::Gfx9 {
                (Opcode::v_add_co_u32, Format::VOP2, true)
            } else {
                (Opcode::v_add_u32, Format::VOP2, false)
            }
        }
        ReduceOp::IMul32 => (Opcode::v_mul_lo_u32, Format::VOP3, false),
        ReduceOp::FAdd32 => (Opcode::v_add_f32, Format::VOP2, false),
        ReduceOp::FMul32 => (Opcode::v_mul_f32, Format::VOP2, false),
        ReduceOp::IMax32 => (Opcode::v_max_i32, Format::VOP2, false),
        ReduceOp::IMin32 => (Opcode::v_min_i32, Format::VOP2, false),
        ReduceOp::UMin32 => (Opcode::v_min_u32, Format::VOP2, false),
        ReduceOp::UMax32 => (Opcode::v_max_u32, Format::VOP2, false),
        ReduceOp::FMin32 => (Opcode::v_min_f32, Format::VOP2, false),
        ReduceOp::FMax32 => (Opcode::v_max_f32, Format::VOP2, false),
        ReduceOp::IAnd32 => (Opcode::v_and_b32, Format::VOP2, false),
        ReduceOp::IXor32 => (Opcode::v_xor_b32, Format::VOP2, false),
        ReduceOp::IOr32 => (Opcode::v_or_b32, Format::VOP2, false),
        _ => (Opcode::v_min_u32, Format::VOP2, false),
    }
}

/// Emit `op` with the first source routed through a DPP lane shuffle. VOP3
/// opcodes cannot encode DPP, so their shuffled source goes through vtmp.
#[allow(clippy::too_many_arguments)]
fn emit_dpp_op(
    bld: &mut Builder,
    dst: PhysReg,
    src0: PhysReg,
    src1: PhysReg,
    vtmp: PhysReg,
    op: Opcode,
    format: Format,
    clobber_vcc: bool,
    dpp_ctrl: u16,
    row_mask: u8,
    bank_mask: u8,
    bound_ctrl_zero: bool,
    size: u32,
    identity: Option<[Operand; 2]>,
) {
    let rc = RegClass::new(RegType::Vgpr, size as u8);
    if format == Format::VOP3 {
        if let Some(identity) = identity {
            bld.vop1(Opcode::v_mov_b32, &[Definition::fixed(vtmp, RegClass::V1)], &[identity[0]]);
            if size >= 2 {
                bld.vop1(
                    Opcode::v_mov_b32,
                    &[Definition::fixed(vtmp.advance(1), RegClass::V1)],
                    &[identity[1]],
                );
            }
        }

        for i in 0..size {
            bld.vop1_dpp(
                Opcode::v_mov_b32,
                Definition::fixed(vtmp.advance(i), RegClass::V1),
                Operand::fixed(src0.advance(i), RegClass::V1),
                dpp_ctrl,
                row_mask,
                bank_mask,
                bound_ctrl_zero,
            );
        }

        let mut defs = vec![Definition::fixed(dst, rc)];
        if clobber_vcc {
            defs.push(Definition::fixed(VCC, RegClass::S2));
        }
        bld.vop3(op, &defs, &[Operand::fixed(vtmp, rc), Operand::fixed(src1, rc)]);
    } else {
        debug_assert!(format == Format::VOP2 || format == Format::VOP1);
        debug_assert!(size == 1 || op == Opcode::v_mov_b32);

        for i in 0..size {
            let num_ops = if format == Format::VOP2 { 2 } else { 1 };
            let num_defs = if clobber_vcc { 2 } else { 1 };
            let mut dpp = Instruction::new(op, format.with_dpp(), num_ops, num_defs);
            dpp.operands[0] = Operand::fixed(src0.advance(i), rc);
            if format == Format::VOP2 {
                dpp.operands[1] = Operand::fixed(src1.advance(i), rc);
            }
            dpp.definitions[0] = Definition::fixed(dst.advance(i), rc);
            if clobber_vcc {
                dpp.definitions[1] = Definition::fixed(VCC, RegClass::S2);
            }
            dpp.data = InstrData::Dpp {
                dpp_ctrl,
                row_mask,
                bank_mask,
                bound_ctrl: bound_ctrl_zero,
                abs: [false; 2],
                neg: [false; 2],
            };
            bld.insert(dpp);
        }
    }
}

fn emit_op(
    bld: &mut Builder,
    dst: PhysReg,
    src0: PhysReg,
    src1: PhysReg,
    op: Opcode,
    format: Format,
    clobber_vcc: bool,
    size: u32,
) {
    for i in 0..size.max(1) {
        let src0_rc = if src0.is_vgpr() { RegClass::V1 } else { RegClass::S1 };
        let mut defs = vec![Definition::fixed(dst.advance(i), RegClass::V1)];
        if clobber_vcc {
            defs.push(Definition::fixed(VCC, RegClass::S2));
        }
        let ops =
            [Operand::fixed(src0.advance(i), src0_rc), Operand::fixed(src1.advance(i), RegClass::V1)];
        if format == Format::VOP3 {
            bld.vop3(op, &defs, &ops);
        } else {
            bld.vop2(op, &defs, &ops);
        }
        if size <= 1 {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_reduction(
    bld: &mut Builder,
    op: Opcode,
    reduce_op: ReduceOp,
    cluster_size: u32,
    tmp: PhysReg,
    stmp: PhysReg,
    vtmp: PhysReg,
    sitmp: PhysReg,
    src: Operand,
    dst: Definition,
) {
    debug_assert!(cluster_size == 64 || op == Opcode::p_reduce);
    let chip = bld.chip();

    let (reduce_opcode, format, clobber_vcc) = get_reduction_opcode(chip, reduce_op);
    let mut identity = [
        Operand::c32(get_reduction_identity(reduce_op, 0)),
        Operand::c32(get_reduction_identity(reduce_op, 1)),
    ];
    let mut vcndmask_identity = identity;

    // Copy the source to tmp with inactive lanes set to the identity.
    bld.sop1(
        Opcode::s_or_saveexec_b64,
        &[
            Definition::fixed(stmp, RegClass::S2),
            Definition::fixed(SCC, RegClass::S1),
            Definition::fixed(EXEC, RegClass::S2),
        ],
        &[Operand::c64(u64::MAX), Operand::fixed(EXEC, RegClass::S2)],
    );

    for i in 0..src.size() {
        // The exclusive scan needs the identity in an sgpr or inline
        // constant for v_writelane_b32, except on GFX10 where the lane
        // write takes a literal.
        if identity[i as usize].is_literal()
            && op == Opcode::p_exclusive_scan
            && chip < ChipClass::Gfx10
        {
            bld.sop1(
                Opcode::s_mov_b32,
                &[Definition::fixed(sitmp.advance(i), RegClass::S1)],
                &[identity[i as usize]],
            );
            identity[i as usize] = Operand::fixed(sitmp.advance(i), RegClass::S1);

            bld.vop1(
                Opcode::v_mov_b32,
                &[Definition::fixed(tmp.advance(i), RegClass::V1)],
                &[identity[i as usize]],
            );
            vcndmask_identity[i as usize] = Operand::fixed(tmp.advance(i), RegClass::V1);
        } else if identity[i as usize].is_literal() {
            bld.vop1(
                Opcode::v_mov_b32,
                &[Definition::fixed(tmp.advance(i), RegClass::V1)],
                &[identity[i as usize]],
            );
            vcndmask_identity[i as usize] = Operand::fixed(tmp.advance(i), RegClass::V1);
        }
    }

    for i in 0..src.size() {
        bld.vop2_e64(
            Opcode::v_cndmask_b32,
            &[Definition::fixed(tmp.advance(i), RegClass::V1)],
            &[
                vcndmask_identity[i as usize],
                Operand::fixed(src.phys_reg().advance(i), RegClass::V1),
                Operand::fixed(stmp, RegClass::S2),
            ],
        );
    }

    let mut exec_restored = false;
    let mut dst_written = false;
    match op {
        Opcode::p_reduce => {
            if cluster_size >= 2 {
                emit_dpp_op(
                    bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
                    dpp_quad_perm(1, 0, 3, 2), 0xf, 0xf, false, src.size(), None,
                );
            }
            if cluster_size >= 4 {
                emit_dpp_op(
                    bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
                    dpp_quad_perm(2, 3, 0, 1), 0xf, 0xf, false, src.size(), None,
                );
            }
            if cluster_size >= 8 {
                emit_dpp_op(
                    bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
                    DPP_ROW_HALF_MIRROR, 0xf, 0xf, false, src.size(), None,
                );
            }
            if cluster_size >= 16 {
                emit_dpp_op(
                    bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
                    DPP_ROW_MIRROR, 0xf, 0xf, false, src.size(), None,
                );
            }
            if cluster_size == 32 {
                for i in 0..src.size() {
                    bld.ds(
                        Opcode::ds_swizzle_b32,
                        &[Definition::fixed(vtmp.advance(i), RegClass::V1)],
                        &[Operand::fixed(tmp.advance(i), RegClass::V1)],
                    );
                    if let InstrData::Ds { offset0, .. } = &mut bld.last_mut().data {
                        *offset0 = ds_pattern_bitmode(0x1f, 0, 0x10);
                    }
                }
                bld.sop1(
                    Opcode::s_mov_b64,
                    &[Definition::fixed(EXEC, RegClass::S2)],
                    &[Operand::fixed(stmp, RegClass::S2)],
                );
                exec_restored = true;
                emit_op(bld, dst.phys_reg(), vtmp, tmp, reduce_opcode, format, clobber_vcc, src.size());
                dst_written = true;
            } else if cluster_size == 64 {
                if chip >= ChipClass::Gfx10 {
                    // GFX10+ dropped row_bcast15/31.
                    for i in 0..src.size() {
                        bld.vop3(
                            Opcode::v_permlanex16_b32,
                            &[Definition::fixed(vtmp.advance(i), RegClass::V1)],
                            &[
                                Operand::fixed(tmp.advance(i), RegClass::V1),
                                Operand::c32(0),
                                Operand::c32(0),
                            ],
                        );
                    }
                    emit_op(bld, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc, src.size());

                    for i in 0..src.size() {
                        bld.vop3(
                            Opcode::v_readlane_b32_e64,
                            &[Definition::fixed(sitmp.advance(i), RegClass::S1)],
                            &[Operand::fixed(tmp.advance(i), RegClass::V1), Operand::c32(31)],
                        );
                    }
                    emit_op(bld, tmp, sitmp, tmp, reduce_opcode, format, clobber_vcc, src.size());
                } else {
                    emit_dpp_op(
                        bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
                        DPP_ROW_BCAST15, 0xa, 0xf, false, src.size(), None,
                    );
                    emit_dpp_op(
                        bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
                        DPP_ROW_BCAST31, 0xc, 0xf, false, src.size(), None,
                    );
                }
            }
        }
        Opcode::p_exclusive_scan | Opcode::p_inclusive_scan => {
            if op == Opcode::p_exclusive_scan {
                if chip >= ChipClass::Gfx10 {
                    // GFX10 has no wf_sr1; emulate it.
                    for i in 0..src.size() {
                        bld.vop1_dpp(
                            Opcode::v_mov_b32,
                            Definition::fixed(vtmp.advance(i), RegClass::V1),
                            Operand::fixed(tmp.advance(i), RegClass::V1),
                            dpp_row_sr(1),
                            0xf,
                            0xf,
                            true,
                        );
                    }
                    // Fill the gaps in rows 1 and 3.
                    bld.sop1(
                        Opcode::s_mov_b32,
                        &[Definition::fixed(EXEC_LO, RegClass::S1)],
                        &[Operand::c32(0x10000)],
                    );
                    bld.sop1(
                        Opcode::s_mov_b32,
                        &[Definition::fixed(EXEC_HI, RegClass::S1)],
                        &[Operand::c32(0x10000)],
                    );
                    for i in 0..src.size() {
                        bld.vop3(
                            Opcode::v_permlanex16_b32,
                            &[Definition::fixed(vtmp.advance(i), RegClass::V1)],
                            &[
                                Operand::fixed(tmp.advance(i), RegClass::V1),
                                Operand::c32(u32::MAX),
                                Operand::c32(u32::MAX),
                            ],
                        );
                        if let InstrData::Vop3 { opsel, .. } = &mut bld.last_mut().data {
                            // Fetch-inactive.
                            opsel[0] = true;
                        }
                    }
                    bld.sop1(
                        Opcode::s_mov_b64,
                        &[Definition::fixed(EXEC, RegClass::S2)],
                        &[Operand::c64(u64::MAX)],
                    );
                    // Fill the gap in row 2.
                    for i in 0..src.size() {
                        bld.vop3(
                            Opcode::v_readlane_b32_e64,
                            &[Definition::fixed(sitmp.advance(i), RegClass::S1)],
                            &[Operand::fixed(tmp.advance(i), RegClass::V1), Operand::c32(31)],
                        );
                        bld.vop3(
                            Opcode::v_writelane_b32_e64,
                            &[Definition::fixed(vtmp.advance(i), RegClass::V1)],
                            &[Operand::fixed(sitmp.advance(i), RegClass::S1), Operand::c32(32)],
                        );
                    }
                }
                let (tmp, vtmp) =
                    if chip >= ChipClass::Gfx10 { (vtmp, tmp) } else { (tmp, vtmp) };
                if chip < ChipClass::Gfx10 {
                    emit_dpp_op(
                        bld, tmp, tmp, tmp, vtmp, Opcode::v_mov_b32, Format::VOP1, false,
                        DPP_WF_SR1, 0xf, 0xf, true, src.size(), None,
                    );
                }
                for i in 0..src.size() {
                    if !identity[i as usize].is_constant()
                        || identity[i as usize].constant_value() != 0
                    {
                        // bound_ctrl takes care of a zero identity.
                        bld.vop3(
                            Opcode::v_writelane_b32_e64,
                            &[Definition::fixed(tmp.advance(i), RegClass::V1)],
                            &[identity[i as usize], Operand::c32(0)],
                        );
                    }
                }
                emit_scan_rows(
                    bld, chip, tmp, vtmp, sitmp, reduce_opcode, format, clobber_vcc, src.size(),
                    identity,
                );
            } else {
                emit_scan_rows(
                    bld, chip, tmp, vtmp, sitmp, reduce_opcode, format, clobber_vcc, src.size(),
                    identity,
                );
            }
        }
        _ => unreachable!("invalid reduction mode"),
    }

    if !exec_restored {
        bld.sop1(
            Opcode::s_mov_b64,
            &[Definition::fixed(EXEC, RegClass::S2)],
            &[Operand::fixed(stmp, RegClass::S2)],
        );
    }

    if op == Opcode::p_reduce && cluster_size == 64 {
        for k in 0..src.size() {
            bld.vop3(
                Opcode::v_readlane_b32_e64,
                &[Definition::fixed(dst.phys_reg().advance(k), RegClass::S1)],
                &[Operand::fixed(tmp.advance(k), RegClass::V1), Operand::c32(63)],
            );
        }
    } else if dst.phys_reg() != tmp && !dst_written {
        for k in 0..src.size() {
            bld.vop1(
                Opcode::v_mov_b32,
                &[Definition::fixed(dst.phys_reg().advance(k), RegClass::V1)],
                &[Operand::fixed(tmp.advance(k), RegClass::V1)],
            );
        }
    }
}

/// The shared inclusive-scan row sequence.
#[allow(clippy::too_many_arguments)]
fn emit_scan_rows(
    bld: &mut Builder,
    chip: ChipClass,
    tmp: PhysReg,
    vtmp: PhysReg,
    sitmp: PhysReg,
    reduce_opcode: Opcode,
    format: Format,
    clobber_vcc: bool,
    size: u32,
    identity: [Operand; 2],
) {
    for shift in [1u16, 2, 4, 8] {
        emit_dpp_op(
            bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
            dpp_row_sr(shift), 0xf, 0xf, false, size, Some(identity),
        );
    }
    if chip >= ChipClass::Gfx10 {
        bld.sop1(
            Opcode::s_mov_b32,
            &[Definition::fixed(EXEC_LO, RegClass::S1)],
            &[Operand::c32(0xffff_0000)],
        );
        bld.sop1(
            Opcode::s_mov_b32,
            &[Definition::fixed(EXEC_HI, RegClass::S1)],
            &[Operand::c32(0xffff_0000)],
        );
        for i in 0..size {
            bld.vop3(
                Opcode::v_permlanex16_b32,
                &[Definition::fixed(vtmp.advance(i), RegClass::V1)],
                &[
                    Operand::fixed(tmp.advance(i), RegClass::V1),
                    Operand::c32(u32::MAX),
                    Operand::c32(u32::MAX),
                ],
            );
            if let InstrData::Vop3 { opsel, .. } = &mut bld.last_mut().data {
                opsel[0] = true;
            }
        }
        emit_op(bld, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc, size);

        bld.sop1(
            Opcode::s_mov_b32,
            &[Definition::fixed(EXEC_LO, RegClass::S1)],
            &[Operand::c32(0)],
        );
        bld.sop1(
            Opcode::s_mov_b32,
            &[Definition::fixed(EXEC_HI, RegClass::S1)],
            &[Operand::c32(u32::MAX)],
        );
        for i in 0..size {
            bld.vop3(
                Opcode::v_readlane_b32_e64,
                &[Definition::fixed(sitmp.advance(i), RegClass::S1)],
                &[Operand::fixed(tmp.advance(i), RegClass::V1), Operand::c32(31)],
            );
        }
        emit_op(bld, tmp, sitmp, tmp, reduce_opcode, format, clobber_vcc, size);
    } else {
        emit_dpp_op(
            bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
            DPP_ROW_BCAST15, 0xa, 0xf, false, size, Some(identity),
        );
        emit_dpp_op(
            bld, tmp, tmp, tmp, vtmp, reduce_opcode, format, clobber_vcc,
            DPP_ROW_BCAST31, 0xc, 0xf, false, size, Some(identity),
        );
    }
}

fn pseudo_scratch(instr: &Instruction) -> (PhysReg, bool) {
    match &instr.data {
        InstrData::Pseudo { scratch_sgpr, tmp_in_scc } => (*scratch_sgpr, *tmp_in_scc),
        _ => (PhysReg(0), false),
    }
}

/// Expand all pseudo instructions into concrete ones.
pub fn lower_to_hw(program: &mut Program) -> CodegenResult<()> {
    let mut discard_block: Option<u32> = None;

    let mut i = 0;
    while i < program.blocks.len() {
        let old = std::mem::take(&mut program.blocks[i].instructions);
        let mut instructions = Vec::with_capacity(old.len());

        for (j, instr) in old.iter().enumerate() {
            let mut bld = Builder::new(program, &mut instructions);
            if instr.format.base() == Format::PSEUDO {
                let (scratch_sgpr, tmp_in_scc) = pseudo_scratch(instr);
                match instr.opcode {
                    Opcode::p_extract_vector => {
                        let reg = instr.operands[0]
                            .phys_reg()
                            .advance(instr.operands[1].constant_value() * instr.definitions[0].size());
                        let rc_op = RegClass::new(instr.operands[0].reg_class().ty(), 1);
                        let rc_def = RegClass::new(instr.definitions[0].reg_class().ty(), 1);
                        if reg == instr.definitions[0].phys_reg() {
                            continue;
                        }
                        let mut copy_map = BTreeMap::new();
                        for k in 0..instr.definitions[0].size() {
                            let def =
                                Definition::fixed(instr.definitions[0].phys_reg().advance(k), rc_def);
                            copy_map.insert(
                                reg_of(&def),
                                CopyOperation {
                                    op: Operand::fixed(reg.advance(k), rc_op),
                                    def,
                                    uses: 0,
                                    size: 1,
                                },
                            );
                        }
                        handle_operands(copy_map, &mut bld, scratch_sgpr, tmp_in_scc);
                    }
                    Opcode::p_create_vector => {
                        let rc_def = RegClass::new(instr.definitions[0].reg_class().ty(), 1);
                        let mut copy_map = BTreeMap::new();
                        let mut reg_idx = 0;
                        for op in &instr.operands {
                            if op.is_constant() {
                                let reg = instr.definitions[0].phys_reg().advance(reg_idx);
                                let def = Definition::fixed(reg, rc_def);
                                copy_map.insert(
                                    reg.reg(),
                                    CopyOperation { op: *op, def, uses: 0, size: 1 },
                                );
                                reg_idx += 1;
                                continue;
                            }
                            let rc_op = RegClass::new(op.reg_class().ty(), 1);
                            for k in 0..op.size() {
                                let def = Definition::fixed(
                                    instr.definitions[0].phys_reg().advance(reg_idx),
                                    rc_def,
                                );
                                copy_map.insert(
                                    reg_of(&def),
                                    CopyOperation {
                                        op: Operand::fixed(op.phys_reg().advance(k), rc_op),
                                        def,
                                        uses: 0,
                                        size: 1,
                                    },
                                );
                                reg_idx += 1;
                            }
                        }
                        handle_operands(copy_map, &mut bld, scratch_sgpr, tmp_in_scc);
                    }
                    Opcode::p_split_vector => {
                        let rc_op = if instr.operands[0].is_constant() {
                            RegClass::S1
                        } else {
                            RegClass::new(instr.operands[0].reg_class().ty(), 1)
                        };
                        let mut copy_map = BTreeMap::new();
                        for (d, def) in instr.definitions.iter().enumerate() {
                            let k = def.size();
                            let rc_def = RegClass::new(def.reg_class().ty(), 1);
                            for m in 0..k {
                                let op = Operand::fixed(
                                    instr.operands[0].phys_reg().advance(d as u32 * k + m),
                                    rc_op,
                                );
                                let part = Definition::fixed(def.phys_reg().advance(m), rc_def);
                                copy_map.insert(
                                    reg_of(&part),
                                    CopyOperation { op, def: part, uses: 0, size: 1 },
                                );
                            }
                        }
                        handle_operands(copy_map, &mut bld, scratch_sgpr, tmp_in_scc);
                    }
                    Opcode::p_parallelcopy | Opcode::p_wqm => {
                        let mut copy_map = BTreeMap::new();
                        for (op, def) in instr.operands.iter().zip(&instr.definitions) {
                            if op.is_constant() || op.size() == 1 {
                                debug_assert_eq!(def.size(), 1);
                                copy_map.insert(
                                    reg_of(def),
                                    CopyOperation { op: *op, def: *def, uses: 0, size: 1 },
                                );
                            } else {
                                let def_rc = RegClass::new(def.reg_class().ty(), 1);
                                let op_rc = RegClass::new(op.reg_class().ty(), 1);
                                for k in 0..op.size() {
                                    let part_op = Operand::fixed(op.phys_reg().advance(k), op_rc);
                                    let part_def =
                                        Definition::fixed(def.phys_reg().advance(k), def_rc);
                                    copy_map.insert(
                                        reg_of(&part_def),
                                        CopyOperation { op: part_op, def: part_def, uses: 0, size: 1 },
                                    );
                                }
                            }
                        }
                        handle_operands(copy_map, &mut bld, scratch_sgpr, tmp_in_scc);
                    }
                    Opcode::p_exit_early_if_not => {
                        // An early exit at the very end of the program is
                        // pointless.
                        let only_end_remains = old[j + 1..]
                            .iter()
                            .all(|next| {
                                next.opcode == Opcode::p_logical_end
                                    || next.opcode == Opcode::s_endpgm
                            });
                        if only_end_remains {
                            continue;
                        }

                        drop(bld);
                        if discard_block.is_none() {
                            let block_idx = program.create_and_insert_block();
                            program.blocks[block_idx as usize].kind =
                                BlockKind::DISCARD_EARLY_EXIT;
                            let mut discard_instrs = Vec::new();
                            {
                                let mut dbld = Builder::new(program, &mut discard_instrs);
                                dbld.exp(
                                    [
                                        Operand::undef(RegClass::V1),
                                        Operand::undef(RegClass::V1),
                                        Operand::undef(RegClass::V1),
                                        Operand::undef(RegClass::V1),
                                    ],
                                    0,
                                    EXP_NULL_TARGET,
                                    false,
                                    true,
                                    true,
                                );
                                if dbld.program.config.wb_smem_l1_on_end {
                                    dbld.smem(Opcode::s_dcache_wb, &[], &[]);
                                }
                                dbld.sopp(Opcode::s_endpgm, None, 0);
                            }
                            program.blocks[block_idx as usize].instructions = discard_instrs;
                            discard_block = Some(block_idx);
                        }
                        let target = discard_block.unwrap();

                        let mut bld = Builder::new(program, &mut instructions);
                        if instr.operands[0].phys_reg() == SCC {
                            bld.sopp_with(
                                Opcode::s_cbranch_scc0,
                                &[],
                                &[instr.operands[0]],
                                Some(target),
                                0,
                            );
                        } else {
                            debug_assert_eq!(instr.operands[0].phys_reg(), EXEC);
                            bld.sopp(Opcode::s_cbranch_execz, Some(target), 0);
                        }

                        program.blocks[target as usize].linear_preds.push(i as u32);
                        program.blocks[i].linear_succs.push(target);
                    }
                    Opcode::p_spill => {
                        debug_assert!(instr.operands[0].reg_class() == RegClass::V1.as_linear());
                        for k in 0..instr.operands[2].size() {
                            bld.vop3(
                                Opcode::v_writelane_b32_e64,
                                &[Definition::fixed(instr.operands[0].phys_reg(), RegClass::V1)],
                                &[
                                    Operand::fixed(
                                        instr.operands[2].phys_reg().advance(k),
                                        RegClass::S1,
                                    ),
                                    Operand::c32(instr.operands[1].constant_value() + k),
                                ],
                            );
                        }
                    }
                    Opcode::p_reload => {
                        debug_assert!(instr.operands[0].reg_class() == RegClass::V1.as_linear());
                        for k in 0..instr.definitions[0].size() {
                            bld.vop3(
                                Opcode::v_readlane_b32_e64,
                                &[Definition::fixed(
                                    instr.definitions[0].phys_reg().advance(k),
                                    RegClass::S1,
                                )],
                                &[
                                    instr.operands[0],
                                    Operand::c32(instr.operands[1].constant_value() + k),
                                ],
                            );
                        }
                    }
                    Opcode::p_as_uniform => {
                        if instr.operands[0].is_constant()
                            || instr.operands[0].reg_class().ty() == RegType::Sgpr
                        {
                            let mut copy_map = BTreeMap::new();
                            let op = instr.operands[0];
                            if op.is_constant() || op.size() == 1 {
                                debug_assert_eq!(instr.definitions[0].size(), 1);
                                copy_map.insert(
                                    reg_of(&instr.definitions[0]),
                                    CopyOperation {
                                        op,
                                        def: instr.definitions[0],
                                        uses: 0,
                                        size: 1,
                                    },
                                );
                            } else {
                                for k in 0..op.size() {
                                    let part_op =
                                        Operand::fixed(op.phys_reg().advance(k), RegClass::S1);
                                    let part_def = Definition::fixed(
                                        instr.definitions[0].phys_reg().advance(k),
                                        RegClass::S1,
                                    );
                                    copy_map.insert(
                                        reg_of(&part_def),
                                        CopyOperation { op: part_op, def: part_def, uses: 0, size: 1 },
                                    );
                                }
                            }
                            handle_operands(copy_map, &mut bld, scratch_sgpr, tmp_in_scc);
                        } else {
                            debug_assert_eq!(instr.operands[0].reg_class().ty(), RegType::Vgpr);
                            debug_assert_eq!(
                                instr.definitions[0].reg_class().ty(),
                                RegType::Sgpr
                            );
                            debug_assert_eq!(instr.operands[0].size(), instr.definitions[0].size());
                            for k in 0..instr.definitions[0].size() {
                                bld.vop1(
                                    Opcode::v_readfirstlane_b32,
                                    &[Definition::fixed(
                                        instr.definitions[0].phys_reg().advance(k),
                                        RegClass::S1,
                                    )],
                                    &[Operand::fixed(
                                        instr.operands[0].phys_reg().advance(k),
                                        RegClass::V1,
                                    )],
                                );
                            }
                        }
                    }
                    // Markers and other front-end pseudos are dropped.
                    _ => {}
                }
            } else if instr.format.base() == Format::PSEUDO_BRANCH {
                return Err(CodegenError::Unreachable("pseudo branch survived branch lowering"));
            } else if instr.format.base() == Format::PSEUDO_BARRIER {
                // Barriers order memory within the workgroup; the scheduler
                // already placed waitcnts, so nothing is emitted here.
                continue;
            } else if instr.format.base() == Format::PSEUDO_REDUCTION {
                let (reduce_op, cluster_size) = match &instr.data {
                    InstrData::Reduction { reduce_op, cluster_size } => (*reduce_op, *cluster_size),
                    _ => unreachable!(),
                };
                if reduce_op == ReduceOp::Gfx10Wave64Bpermute {
                    emit_gfx10_wave64_bpermute(&mut bld, instr)?;
                } else {
                    emit_reduction(
                        &mut bld,
                        instr.opcode,
                        reduce_op,
                        cluster_size,
                        instr.operands[1].phys_reg(),
                        instr.definitions[1].phys_reg(),
                        instr.operands[2].phys_reg(),
                        instr.definitions[2].phys_reg(),
                        instr.operands[0],
                        instr.definitions[0],
                    );
                }
            } else {
                instructions.push(instr.clone());
            }
        }

        program.blocks[i].instructions = instructions;
        i += 1;
    }
    Ok(())
}

/// Cross-half lane shuffle for wave64 on GFX10: the hardware bpermute only
/// reaches 32 lanes, so the halves are exchanged through shared VGPRs.
fn emit_gfx10_wave64_bpermute(bld: &mut Builder, instr: &Instruction) -> CodegenResult<()> {
    if bld.chip() < ChipClass::Gfx10 || bld.program.wave_size != 64 {
        return Err(CodegenError::Unreachable("wave64 bpermute on unsupported target"));
    }
    debug_assert_eq!(instr.operands[0].phys_reg(), VCC);

    let num_vgprs = bld.program.config.num_vgprs;
    let shared_vgpr_lo = PhysReg(256 + ((num_vgprs + 3) & !3));
    let shared_vgpr_hi = shared_vgpr_lo.advance(1);
    let compare = instr.operands[0];
    let tmp1 = instr.operands[1].phys_reg();
    let tmp2 = instr.operands[1].phys_reg().advance(1);
    let index_x4 = instr.operands[2];
    let input_data = instr.operands[3];

    // Save EXEC and clear it.
    bld.sop1(
        Opcode::s_and_saveexec_b64,
        &[instr.definitions[1], instr.definitions[2], Definition::fixed(EXEC, RegClass::S2)],
        &[Operand::zero(8), Operand::fixed(EXEC, RegClass::S2)],
    );

    // Enable only the high lanes and stage their data in the shared vgpr.
    bld.sop1(
        Opcode::s_mov_b32,
        &[Definition::fixed(EXEC_HI, RegClass::S1)],
        &[Operand::c32(u32::MAX)],
    );
    bld.vop1(Opcode::v_mov_b32, &[Definition::fixed(shared_vgpr_hi, RegClass::V1)], &[input_data]);

    // Flip to the low lanes, stage their data, read the other half.
    bld.sop1(
        Opcode::s_not_b64,
        &[Definition::fixed(EXEC, RegClass::S2)],
        &[Operand::fixed(EXEC, RegClass::S2)],
    );
    bld.vop1(Opcode::v_mov_b32, &[Definition::fixed(shared_vgpr_lo, RegClass::V1)], &[input_data]);
    bld.vop1(
        Opcode::v_mov_b32,
        &[Definition::fixed(tmp1, RegClass::V1)],
        &[Operand::fixed(shared_vgpr_hi, RegClass::V1)],
    );

    bld.sop1(
        Opcode::s_not_b64,
        &[Definition::fixed(EXEC, RegClass::S2)],
        &[Operand::fixed(EXEC, RegClass::S2)],
    );
    bld.vop1(
        Opcode::v_mov_b32,
        &[Definition::fixed(tmp1, RegClass::V1)],
        &[Operand::fixed(shared_vgpr_lo, RegClass::V1)],
    );

    // All lanes: permute both the original and the swapped input.
    bld.sop1(
        Opcode::s_mov_b64,
        &[Definition::fixed(EXEC, RegClass::S2)],
        &[Operand::c64(u64::MAX)],
    );
    bld.ds(
        Opcode::ds_bpermute_b32,
        &[Definition::fixed(tmp2, RegClass::V1)],
        &[index_x4, input_data],
    );
    bld.ds(
        Opcode::ds_bpermute_b32,
        &[Definition::fixed(tmp1, RegClass::V1)],
        &[index_x4, Operand::fixed(tmp1, RegClass::V1)],
    );

    // Restore EXEC and select the half each lane wanted.
    bld.sop1(
        Opcode::s_mov_b64,
        &[Definition::fixed(EXEC, RegClass::S2)],
        &[Operand::fixed(instr.definitions[1].phys_reg(), RegClass::S2)],
    );
    bld.vop2(
        Opcode::v_cndmask_b32,
        &[instr.definitions[0]],
        &[Operand::fixed(tmp1, RegClass::V1), Operand::fixed(tmp2, RegClass::V1), compare],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Stage};

    fn one_block(chip: ChipClass) -> Program {
        let mut program = Program::new(chip, 64, Stage::HW_FS);
        program.create_and_insert_block();
        program
    }

    fn parallelcopy(pairs: &[(u32, u32)]) -> Instruction {
        let mut pc =
            Instruction::new(Opcode::p_parallelcopy, Format::PSEUDO, pairs.len(), pairs.len());
        for (i, &(def, op)) in pairs.iter().enumerate() {
            pc.definitions[i] = Definition::fixed(PhysReg(def), RegClass::V1);
            pc.operands[i] = Operand::fixed(PhysReg(op), RegClass::V1);
        }
        pc
    }

    #[test]
    fn chain_copies_emit_leaves_first() {
        let mut program = one_block(ChipClass::Gfx8);
        // v2 <- v1, v1 <- v0: v2 must be written before v1 is clobbered.
        program.blocks[0].instructions = vec![parallelcopy(&[(258, 257), (257, 256)])];

        lower_to_hw(&mut program).unwrap();

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, Opcode::v_mov_b32);
        assert_eq!(instrs[0].definitions[0].phys_reg(), PhysReg(258));
        assert_eq!(instrs[1].definitions[0].phys_reg(), PhysReg(257));
    }

    #[test]
    fn swap_uses_native_swap_on_gfx9() {
        let mut program = one_block(ChipClass::Gfx9);
        program.blocks[0].instructions = vec![parallelcopy(&[(256, 257), (257, 256)])];

        lower_to_hw(&mut program).unwrap();

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].opcode, Opcode::v_swap_b32);
    }

    #[test]
    fn swap_uses_three_xors_on_gfx8() {
        let mut program = one_block(ChipClass::Gfx8);
        program.blocks[0].instructions = vec![parallelcopy(&[(256, 257), (257, 256)])];

        lower_to_hw(&mut program).unwrap();

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 3);
        assert!(instrs.iter().all(|i| i.opcode == Opcode::v_xor_b32));
    }

    #[test]
    fn discard_block_is_shared() {
        let mut program = one_block(ChipClass::Gfx9);
        let mut exit1 = Instruction::new(Opcode::p_exit_early_if_not, Format::PSEUDO, 1, 0);
        exit1.operands[0] = Operand::fixed(EXEC, RegClass::S2);
        let mut exit2 = exit1.clone();
        let mut endpgm = Instruction::new(Opcode::s_endpgm, Format::SOPP, 0, 0);
        endpgm.data = InstrData::Sopp { imm: 0, block: None };
        let mut mov = Instruction::new(Opcode::v_mov_b32, Format::VOP1, 1, 1);
        mov.definitions[0] = Definition::fixed(PhysReg(256), RegClass::V1);
        mov.operands[0] = Operand::c32(0);
        exit2.operands[0] = Operand::fixed(EXEC, RegClass::S2);
        program.blocks[0].instructions =
            vec![exit1, mov.clone(), exit2, mov, endpgm];

        lower_to_hw(&mut program).unwrap();

        // One extra block holding the null export and endpgm.
        assert_eq!(program.blocks.len(), 2);
        let discard = &program.blocks[1];
        assert!(discard.kind.contains(BlockKind::DISCARD_EARLY_EXIT));
        assert_eq!(discard.instructions[0].opcode, Opcode::exp);
        assert_eq!(discard.instructions.last().unwrap().opcode, Opcode::s_endpgm);
        // Both exits branch to it.
        let branches = program.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::s_cbranch_execz)
            .count();
        assert_eq!(branches, 2);
        assert_eq!(program.blocks[1].linear_preds.len(), 2);
    }

    #[test]
    fn no_pseudo_survives() {
        let mut program = one_block(ChipClass::Gfx9);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        let mut create = Instruction::new(Opcode::p_create_vector, Format::PSEUDO, 2, 1);
        create.definitions[0] = Definition::fixed(PhysReg(260), RegClass::V2);
        create.operands[0] = Operand::fixed(PhysReg(256), RegClass::V1);
        create.operands[1] = Operand::fixed(PhysReg(257), RegClass::V1);
        instrs.insert(0, create);
        program.blocks[0].instructions = instrs;

        lower_to_hw(&mut program).unwrap();

        for block in &program.blocks {
            for instr in &block.instructions {
                assert!(!instr.is_pseudo(), "{} survived lowering", instr.opcode);
            }
        }
    }

    #[test]
    fn reduction_expands_to_dpp_sequence() {
        let mut program = one_block(ChipClass::Gfx9);
        let mut red =
            Instruction::new(Opcode::p_reduce, Format::PSEUDO_REDUCTION, 3, 3);
        red.data = InstrData::Reduction { reduce_op: ReduceOp::IAdd32, cluster_size: 64 };
        red.operands[0] = Operand::fixed(PhysReg(256), RegClass::V1);
        red.operands[1] = Operand::fixed(PhysReg(257), RegClass::V1);
        red.operands[2] = Operand::fixed(PhysReg(258), RegClass::V1);
        red.definitions[0] = Definition::fixed(PhysReg(4), RegClass::S1);
        red.definitions[1] = Definition::fixed(PhysReg(6), RegClass::S2);
        red.definitions[2] = Definition::fixed(PhysReg(8), RegClass::S1);
        program.blocks[0].instructions = vec![red];

        lower_to_hw(&mut program).unwrap();

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs[0].opcode, Opcode::s_or_saveexec_b64);
        // Four DPP steps plus the two row broadcasts.
        let dpp_count = instrs.iter().filter(|i| i.is_dpp()).count();
        assert_eq!(dpp_count, 6);
        // The final lane read goes to the scalar destination.
        let last = instrs.last().unwrap();
        assert_eq!(last.opcode, Opcode::v_readlane_b32_e64);
        assert_eq!(last.definitions[0].phys_reg(), PhysReg(4));
        // Exec is restored before the result is read.
        assert!(instrs.iter().any(|i| {
            i.opcode == Opcode::s_mov_b64 && i.definitions[0].phys_reg() == EXEC
        }));
    }
}
