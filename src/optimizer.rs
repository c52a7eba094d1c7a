//! Peephole optimizer.
//!
//! The optimizer works in 4 phases:
//! (1) The first pass collects information for each ssa-def, propagates
//!     reg->reg operands of the same type, inline constants and neg/abs
//!     input modifiers.
//! (2) The second pass combines instructions like mad, omod, clamp and
//!     propagates sgpr's on VALU instructions. This pass depends on
//!     information collected in the first pass.
//! (3) The third pass goes backwards, and selects instructions, i.e.
//!     decides if a mad instruction is profitable and eliminates dead code.
//! (4) The fourth pass cleans up the sequence: literals get applied and
//!     dead instructions are removed from the sequence.
//!
//! Labels attached to an ssa-def fall into three mutually exclusive groups:
//! labels locating a defining instruction, labels naming an equivalent
//! temporary, and labels carrying a value. Adding a label of one group
//! clears conflicting labels of the same group but may coexist with labels
//! of the other groups. Instruction locations are stored as
//! `(block, index)` pairs, never as references, so later reordering passes
//! cannot invalidate them.

use crate::dce::dead_code_analysis;
use crate::ir::{
    ChipClass, Definition, Format, InstrData, Instruction, Opcode, Operand, PhysReg, Program,
    RegClass, RegType, Temp,
};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    struct Label: u32 {
        const VEC = 1 << 0;
        const CONSTANT = 1 << 1;
        const ABS = 1 << 2;
        const NEG = 1 << 3;
        const MUL = 1 << 4;
        const TEMP = 1 << 5;
        const LITERAL = 1 << 6;
        const MAD = 1 << 7;
        const OMOD2 = 1 << 8;
        const OMOD4 = 1 << 9;
        const OMOD5 = 1 << 10;
        const OMOD_SUCCESS = 1 << 11;
        const CLAMP = 1 << 12;
        const CLAMP_SUCCESS = 1 << 13;
        const UNDEFINED = 1 << 14;
        const VCC = 1 << 15;
        const B2F = 1 << 16;
        const ADD_SUB = 1 << 17;
        const BITWISE = 1 << 18;
        const MINMAX = 1 << 19;
        const FCMP = 1 << 20;
        const UNIFORM_BOOL = 1 << 21;
    }
}

impl Label {
    const INSTR_LABELS: Label = Label::VEC
        .union(Label::MUL)
        .union(Label::MAD)
        .union(Label::OMOD_SUCCESS)
        .union(Label::CLAMP_SUCCESS)
        .union(Label::ADD_SUB)
        .union(Label::BITWISE)
        .union(Label::MINMAX)
        .union(Label::FCMP);
    const TEMP_LABELS: Label = Label::ABS
        .union(Label::NEG)
        .union(Label::TEMP)
        .union(Label::VCC)
        .union(Label::B2F)
        .union(Label::UNIFORM_BOOL);
    const VAL_LABELS: Label = Label::CONSTANT.union(Label::LITERAL).union(Label::MAD);
}

/// Position of an instruction: block index and position within the block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct InstrLoc {
    block: u32,
    index: u32,
}

#[derive(Clone, Copy)]
struct SsaInfo {
    label: Label,
    val: u32,
    temp: Temp,
    loc: InstrLoc,
}

impl Default for SsaInfo {
    fn default() -> Self {
        Self {
            label: Label::empty(),
            val: 0,
            temp: Temp::new(0, RegClass::S1),
            loc: InstrLoc::default(),
        }
    }
}

impl SsaInfo {
    fn add_label(&mut self, new_label: Label) {
        // All labels which use the instruction location use it for the same
        // thing (the defining instruction), so they don't clear each other.
        if new_label.intersects(Label::INSTR_LABELS) {
            self.label &= !Label::TEMP_LABELS;
        }
        if new_label.intersects(Label::TEMP_LABELS) {
            self.label &= !Label::TEMP_LABELS;
            self.label &= !Label::INSTR_LABELS;
        }
        if new_label.intersects(Label::VAL_LABELS) {
            self.label &= !Label::VAL_LABELS;
        }
        self.label |= new_label;
    }

    fn set_vec(&mut self, loc: InstrLoc) {
        self.add_label(Label::VEC);
        self.loc = loc;
    }
    fn is_vec(&self) -> bool {
        self.label.contains(Label::VEC)
    }
    fn set_constant(&mut self, constant: u32) {
        self.add_label(Label::CONSTANT);
        self.val = constant;
    }
    fn is_constant(&self) -> bool {
        self.label.contains(Label::CONSTANT)
    }
    fn set_abs(&mut self, abs_temp: Temp) {
        self.add_label(Label::ABS);
        self.temp = abs_temp;
    }
    fn is_abs(&self) -> bool {
        self.label.contains(Label::ABS)
    }
    fn set_neg(&mut self, neg_temp: Temp) {
        self.add_label(Label::NEG);
        self.temp = neg_temp;
    }
    fn is_neg(&self) -> bool {
        self.label.contains(Label::NEG)
    }
    fn set_neg_abs(&mut self, neg_abs_temp: Temp) {
        self.add_label(Label::NEG.union(Label::ABS));
        self.temp = neg_abs_temp;
    }
    fn set_mul(&mut self, loc: InstrLoc) {
        self.add_label(Label::MUL);
        self.loc = loc;
    }
    fn is_mul(&self) -> bool {
        self.label.contains(Label::MUL)
    }
    fn set_temp(&mut self, tmp: Temp) {
        self.add_label(Label::TEMP);
        self.temp = tmp;
    }
    fn is_temp(&self) -> bool {
        self.label.contains(Label::TEMP)
    }
    fn set_literal(&mut self, lit: u32) {
        self.add_label(Label::LITERAL);
        self.val = lit;
    }
    fn is_literal(&self) -> bool {
        self.label.contains(Label::LITERAL)
    }
    fn set_mad(&mut self, loc: InstrLoc, mad_info_idx: u32) {
        self.add_label(Label::MAD);
        self.val = mad_info_idx;
        self.loc = loc;
    }
    fn is_mad(&self) -> bool {
        self.label.contains(Label::MAD)
    }
    fn set_omod2(&mut self) {
        self.add_label(Label::OMOD2);
    }
    fn is_omod2(&self) -> bool {
        self.label.contains(Label::OMOD2)
    }
    fn set_omod4(&mut self) {
        self.add_label(Label::OMOD4);
    }
    fn is_omod4(&self) -> bool {
        self.label.contains(Label::OMOD4)
    }
    fn set_omod5(&mut self) {
        self.add_label(Label::OMOD5);
    }
    fn is_omod5(&self) -> bool {
        self.label.contains(Label::OMOD5)
    }
    fn set_omod_success(&mut self, loc: InstrLoc) {
        self.add_label(Label::OMOD_SUCCESS);
        self.loc = loc;
    }
    fn is_omod_success(&self) -> bool {
        self.label.contains(Label::OMOD_SUCCESS)
    }
    fn set_clamp(&mut self) {
        self.add_label(Label::CLAMP);
    }
    fn is_clamp(&self) -> bool {
        self.label.contains(Label::CLAMP)
    }
    fn set_clamp_success(&mut self, loc: InstrLoc) {
        self.add_label(Label::CLAMP_SUCCESS);
        self.loc = loc;
    }
    fn is_clamp_success(&self) -> bool {
        self.label.contains(Label::CLAMP_SUCCESS)
    }
    fn set_undefined(&mut self) {
        self.add_label(Label::UNDEFINED);
    }
    fn is_undefined(&self) -> bool {
        self.label.contains(Label::UNDEFINED)
    }
    fn set_vcc(&mut self, vcc: Temp) {
        self.add_label(Label::VCC);
        self.temp = vcc;
    }
    fn is_vcc(&self) -> bool {
        self.label.contains(Label::VCC)
    }
    fn set_b2f(&mut self, val: Temp) {
        self.add_label(Label::B2F);
        self.temp = val;
    }
    fn is_b2f(&self) -> bool {
        self.label.contains(Label::B2F)
    }
    fn set_add_sub(&mut self, loc: InstrLoc) {
        self.add_label(Label::ADD_SUB);
        self.loc = loc;
    }
    fn is_add_sub(&self) -> bool {
        self.label.contains(Label::ADD_SUB)
    }
    fn set_bitwise(&mut self, loc: InstrLoc) {
        self.add_label(Label::BITWISE);
        self.loc = loc;
    }
    fn set_minmax(&mut self, loc: InstrLoc) {
        self.add_label(Label::MINMAX);
        self.loc = loc;
    }
    fn set_fcmp(&mut self, loc: InstrLoc) {
        self.add_label(Label::FCMP);
        self.loc = loc;
    }
    fn set_uniform_bool(&mut self, uniform_bool: Temp) {
        self.add_label(Label::UNIFORM_BOOL);
        self.temp = uniform_bool;
    }
    fn is_uniform_bool(&self) -> bool {
        self.label.contains(Label::UNIFORM_BOOL)
    }
    fn is_constant_or_literal(&self) -> bool {
        self.is_constant() || self.is_literal()
    }
    fn has_instr_label(&self) -> bool {
        self.label.intersects(Label::INSTR_LABELS)
    }
}

struct MadInfo {
    add_instr: Instruction,
    mul_temp_id: u32,
    literal_idx: u32,
    needs_vop3: bool,
    check_literal: bool,
}

struct OptCtx {
    info: Vec<SsaInfo>,
    uses: Vec<u16>,
    mad_infos: Vec<MadInfo>,
}

fn instr_at(program: &Program, loc: InstrLoc) -> &Instruction {
    &program.blocks[loc.block as usize].instructions[loc.index as usize]
}

fn instr_at_mut(program: &mut Program, loc: InstrLoc) -> &mut Instruction {
    &mut program.blocks[loc.block as usize].instructions[loc.index as usize]
}

fn vop3_fields_mut(instr: &mut Instruction) -> (&mut [bool; 3], &mut [bool; 3], &mut bool, &mut u8) {
    match &mut instr.data {
        InstrData::Vop3 { abs, neg, clamp, omod, .. } => (abs, neg, clamp, omod),
        _ => panic!("not a VOP3 instruction"),
    }
}

fn vop3_fields(instr: &Instruction) -> ([bool; 3], [bool; 3], [bool; 4], bool, u8) {
    match &instr.data {
        InstrData::Vop3 { abs, neg, opsel, clamp, omod } => (*abs, *neg, *opsel, *clamp, *omod),
        _ => ([false; 3], [false; 3], [false; 4], false, 0),
    }
}

fn can_swap_operands(instr: &mut Instruction) -> bool {
    if instr.operands[0].is_constant()
        || (instr.operands[0].is_temp() && instr.operands[0].get_temp().ty() == RegType::Sgpr)
    {
        return false;
    }
    match instr.opcode {
        Opcode::v_add_f32
        | Opcode::v_mul_f32
        | Opcode::v_or_b32
        | Opcode::v_and_b32
        | Opcode::v_xor_b32
        | Opcode::v_max_f32
        | Opcode::v_min_f32
        | Opcode::v_cmp_eq_f32
        | Opcode::v_cmp_lg_f32 => true,
        Opcode::v_sub_f32 => {
            instr.opcode = Opcode::v_subrev_f32;
            true
        }
        Opcode::v_cmp_lt_f32 => {
            instr.opcode = Opcode::v_cmp_gt_f32;
            true
        }
        Opcode::v_cmp_ge_f32 => {
            instr.opcode = Opcode::v_cmp_le_f32;
            true
        }
        Opcode::v_cmp_lt_i32 => {
            instr.opcode = Opcode::v_cmp_gt_i32;
            true
        }
        _ => false,
    }
}

fn can_use_vop3(instr: &Instruction) -> bool {
    if !instr.operands.is_empty() && instr.operands[0].is_literal() {
        return false;
    }
    if instr.is_dpp() || instr.is_sdwa() {
        return false;
    }
    !matches!(
        instr.opcode,
        Opcode::v_madmk_f32
            | Opcode::v_madak_f32
            | Opcode::v_readlane_b32
            | Opcode::v_writelane_b32
            | Opcode::v_readfirstlane_b32
    )
}

fn can_apply_sgprs(instr: &Instruction) -> bool {
    !matches!(
        instr.opcode,
        Opcode::v_readfirstlane_b32
            | Opcode::v_readlane_b32
            | Opcode::v_readlane_b32_e64
            | Opcode::v_writelane_b32
            | Opcode::v_writelane_b32_e64
    )
}

fn to_vop3(instr: &mut Instruction) {
    if instr.is_vop3() {
        return;
    }
    debug_assert!(!instr.operands[0].is_literal());
    instr.promote_to_vop3();
}

/// Only covers special cases.
fn can_accept_constant(instr: &Instruction, operand: usize) -> bool {
    match instr.opcode {
        Opcode::v_interp_p2_f32
        | Opcode::v_mac_f32
        | Opcode::v_writelane_b32
        | Opcode::v_writelane_b32_e64
        | Opcode::v_cndmask_b32 => operand != 2,
        Opcode::s_addk_i32
        | Opcode::s_mulk_i32
        | Opcode::p_wqm
        | Opcode::p_extract_vector
        | Opcode::p_split_vector
        | Opcode::v_readlane_b32
        | Opcode::v_readlane_b32_e64
        | Opcode::v_readfirstlane_b32 => operand != 0,
        _ => {
            if (instr.format.base() == Format::MUBUF || instr.format.base() == Format::MIMG)
                && instr.definitions.len() == 1
                && instr.operands.len() == 4
            {
                operand != 3
            } else {
                true
            }
        }
    }
}

fn valu_can_accept_literal(instr: &Instruction, operand: usize) -> bool {
    // Instructions like v_cndmask_b32 can't take a literal because they
    // always read SGPRs.
    if instr.operands.len() >= 3
        && instr.operands[2].is_temp()
        && instr.operands[2].reg_class().ty() == RegType::Sgpr
    {
        return false;
    }
    !instr.is_sdwa()
        && !instr.is_dpp()
        && !instr.is_vop3()
        && operand == 0
        && can_accept_constant(instr, operand)
}

fn valu_can_accept_vgpr(instr: &Instruction, operand: usize) -> bool {
    if matches!(
        instr.opcode,
        Opcode::v_readlane_b32
            | Opcode::v_readlane_b32_e64
            | Opcode::v_writelane_b32
            | Opcode::v_writelane_b32_e64
    ) {
        return operand != 1;
    }
    true
}

fn parse_base_offset(
    program: &Program,
    ctx: &OptCtx,
    instr: &Instruction,
    op_index: usize,
) -> Option<(Temp, u32)> {
    let op = instr.operands[op_index];
    if !op.is_temp() {
        return None;
    }
    let tmp = op.get_temp();
    if !ctx.info[tmp.id() as usize].is_add_sub() {
        return None;
    }

    let add_instr = instr_at(program, ctx.info[tmp.id() as usize].loc);
    match add_instr.opcode {
        Opcode::v_add_u32 | Opcode::v_add_co_u32 | Opcode::s_add_i32 | Opcode::s_add_u32 => {}
        _ => return None,
    }
    if add_instr.uses_modifiers() {
        return None;
    }

    for i in 0..2 {
        let offset;
        if add_instr.operands[i].is_constant() {
            offset = add_instr.operands[i].constant_value();
        } else if add_instr.operands[i].is_temp()
            && ctx.info[add_instr.operands[i].temp_id() as usize].is_constant_or_literal()
        {
            offset = ctx.info[add_instr.operands[i].temp_id() as usize].val;
        } else {
            continue;
        }
        if !add_instr.operands[1 - i].is_temp() {
            continue;
        }

        if let Some((base, offset2)) = parse_base_offset(program, ctx, add_instr, 1 - i) {
            return Some((base, offset.wrapping_add(offset2)));
        }
        return Some((add_instr.operands[1 - i].get_temp(), offset));
    }

    None
}

fn get_constant_op(chip: ChipClass, val: u32) -> Operand {
    let mut op = Operand::c32(val);
    if val == 0x3e22_f983 && chip >= ChipClass::Gfx8 {
        // 1/2 PI can be an inline constant on GFX8+.
        op.set_fixed(PhysReg(248));
    }
    op
}

fn label_instruction(program: &mut Program, ctx: &mut OptCtx, loc: InstrLoc, instr: &mut Instruction) {
    for i in 0..instr.operands.len() {
        if !instr.operands[i].is_temp() {
            continue;
        }

        let mut info = ctx.info[instr.operands[i].temp_id() as usize];
        // Propagate undef.
        if info.is_undefined() && instr.is_phi() {
            instr.operands[i] = Operand::undef(instr.operands[i].reg_class());
            continue;
        }
        // Propagate reg->reg of same type.
        if info.is_temp() && info.temp.reg_class() == instr.operands[i].get_temp().reg_class() {
            instr.operands[i].set_temp(info.temp);
            info = ctx.info[info.temp.id() as usize];
        }

        if instr.is_salu() || instr.format.base() == Format::PSEUDO {
            // SALU / PSEUDO: propagate inline constants.
            if info.is_temp() && info.temp.ty() == RegType::Sgpr {
                instr.operands[i].set_temp(info.temp);
                info = ctx.info[info.temp.id() as usize];
            } else if info.is_temp() && info.temp.ty() == RegType::Vgpr {
                // Propagate vgpr if it can take it.
                let all_vgpr_ok = matches!(
                    instr.opcode,
                    Opcode::p_create_vector
                        | Opcode::p_split_vector
                        | Opcode::p_extract_vector
                        | Opcode::p_phi
                ) && instr
                    .definitions
                    .iter()
                    .all(|def| def.get_temp().ty() == RegType::Vgpr);
                if all_vgpr_ok {
                    instr.operands[i] = Operand::temp(info.temp);
                    info = ctx.info[info.temp.id() as usize];
                }
            }
            if (info.is_constant()
                || (info.is_literal() && instr.format.base() == Format::PSEUDO))
                && !instr.operands[i].is_fixed()
                && can_accept_constant(instr, i)
            {
                instr.operands[i] = get_constant_op(program.chip_class, info.val);
                continue;
            }
        } else if instr.is_valu() {
            // VALU: propagate neg, abs & inline constants.
            if info.is_temp() && info.temp.ty() == RegType::Vgpr && valu_can_accept_vgpr(instr, i) {
                instr.operands[i].set_temp(info.temp);
                info = ctx.info[info.temp.id() as usize];
            }
            if info.is_abs()
                && (can_use_vop3(instr) || instr.is_dpp())
                && instr.opcode.can_use_input_modifiers()
            {
                if !instr.is_dpp() {
                    to_vop3(instr);
                }
                instr.operands[i] = Operand::temp(info.temp);
                match &mut instr.data {
                    InstrData::Vop3 { abs, .. } => abs[i] = true,
                    InstrData::Dpp { abs, .. } => abs[i] = true,
                    _ => {}
                }
            }
            if info.is_neg() && instr.opcode == Opcode::v_add_f32 {
                instr.opcode = if i != 0 { Opcode::v_sub_f32 } else { Opcode::v_subrev_f32 };
                instr.operands[i].set_temp(info.temp);
                continue;
            } else if info.is_neg()
                && (can_use_vop3(instr) || instr.is_dpp())
                && instr.opcode.can_use_input_modifiers()
            {
                if !instr.is_dpp() {
                    to_vop3(instr);
                }
                instr.operands[i].set_temp(info.temp);
                match &mut instr.data {
                    InstrData::Vop3 { neg, .. } => neg[i] = true,
                    InstrData::Dpp { neg, .. } => neg[i] = true,
                    _ => {}
                }
                continue;
            }
            if info.is_constant() && can_accept_constant(instr, i) {
                if i == 0
                    || instr.opcode == Opcode::v_readlane_b32
                    || instr.opcode == Opcode::v_writelane_b32
                {
                    instr.operands[i] = get_constant_op(program.chip_class, info.val);
                    continue;
                } else if !instr.is_vop3() && can_swap_operands(instr) {
                    instr.operands[i] = instr.operands[0];
                    instr.operands[0] = get_constant_op(program.chip_class, info.val);
                    continue;
                } else if can_use_vop3(instr) {
                    to_vop3(instr);
                    instr.operands[i] = get_constant_op(program.chip_class, info.val);
                    continue;
                }
            }
        } else if instr.format.base() == Format::MUBUF {
            // MUBUF: propagate constants and combine additions.
            let mut flat = info;
            while flat.is_temp() {
                flat = ctx.info[flat.temp.id() as usize];
            }
            let (offen, cur_offset) = match &instr.data {
                InstrData::Mubuf { offen, offset, .. } => (*offen, *offset as u32),
                _ => unreachable!(),
            };
            if offen && i == 0 && flat.is_constant_or_literal() && cur_offset + flat.val < 4096 {
                instr.operands[i] = Operand::undef(RegClass::V1);
                if let InstrData::Mubuf { offset, offen, .. } = &mut instr.data {
                    *offset += flat.val as u16;
                    *offen = false;
                }
                continue;
            } else if i == 2 && flat.is_constant_or_literal() && cur_offset + flat.val < 4096 {
                instr.operands[2] = Operand::c32(0);
                if let InstrData::Mubuf { offset, .. } = &mut instr.data {
                    *offset += flat.val as u16;
                }
                continue;
            } else if let Some((base, add)) = parse_base_offset(program, ctx, instr, i) {
                if offen
                    && i == 0
                    && base.reg_class() == RegClass::V1
                    && cur_offset + add < 4096
                {
                    instr.operands[i].set_temp(base);
                    if let InstrData::Mubuf { offset, .. } = &mut instr.data {
                        *offset += add as u16;
                    }
                    continue;
                } else if i == 2 && base.reg_class() == RegClass::S1 && cur_offset + add < 4096 {
                    instr.operands[i].set_temp(base);
                    if let InstrData::Mubuf { offset, .. } = &mut instr.data {
                        *offset += add as u16;
                    }
                    continue;
                }
            }
        } else if instr.format.base() == Format::DS {
            // DS: combine additions.
            if i == 0 {
                if let Some((base, add)) = parse_base_offset(program, ctx, instr, i) {
                    if base.reg_class() == instr.operands[i].reg_class() {
                        let two_addr = matches!(
                            instr.opcode,
                            Opcode::ds_write2_b32
                                | Opcode::ds_read2_b32
                                | Opcode::ds_write2_b64
                                | Opcode::ds_read2_b64
                        );
                        if let InstrData::Ds { offset0, offset1, .. } = &mut instr.data {
                            if two_addr {
                                if add % 4 == 0
                                    && *offset0 as u32 + (add >> 2) <= 255
                                    && *offset1 as u32 + (add >> 2) <= 255
                                {
                                    instr.operands[i].set_temp(base);
                                    *offset0 += (add >> 2) as u16;
                                    *offset1 += (add >> 2) as u8;
                                }
                            } else if *offset0 as u32 + add <= 65535 {
                                instr.operands[i].set_temp(base);
                                *offset0 += add as u16;
                            }
                        }
                    }
                }
            }
        } else if instr.format.base() == Format::SMEM {
            // SMEM: propagate constants and combine additions.
            if i == 1
                && info.is_constant_or_literal()
                && (program.chip_class < ChipClass::Gfx8 || info.val <= 0xFFFFF)
            {
                instr.operands[i] = Operand::c32(info.val);
                continue;
            } else if i == 1 && program.chip_class >= ChipClass::Gfx9 {
                if let Some((base, add)) = parse_base_offset(program, ctx, instr, i) {
                    if base.reg_class() == RegClass::S1 && add <= 0xFFFFF {
                        let soe = instr.operands.len()
                            >= if instr.definitions.is_empty() { 4 } else { 3 };
                        if soe {
                            let last = *instr.operands.last().unwrap();
                            let soffset_zero = last.is_temp()
                                && ctx.info[last.temp_id() as usize].is_constant_or_literal()
                                && ctx.info[last.temp_id() as usize].val == 0;
                            if !soffset_zero {
                                continue;
                            }
                            instr.operands[1] = Operand::c32(add);
                            *instr.operands.last_mut().unwrap() = Operand::temp(base);
                        } else {
                            instr.operands[1] = Operand::c32(add);
                            instr.operands.push(Operand::temp(base));
                        }
                        continue;
                    }
                }
            }
        }
    }

    // If this instruction doesn't define anything, we're done.
    if instr.definitions.is_empty() {
        return;
    }

    match instr.opcode {
        Opcode::p_create_vector => {
            let mut num_ops = instr.operands.len();
            for op in &instr.operands {
                if op.is_temp() && ctx.info[op.temp_id() as usize].is_vec() {
                    num_ops +=
                        instr_at(program, ctx.info[op.temp_id() as usize].loc).operands.len() - 1;
                }
            }
            if num_ops != instr.operands.len() {
                let old_ops: Vec<Operand> = instr.operands.drain(..).collect();
                for old_op in old_ops {
                    if old_op.is_temp() && ctx.info[old_op.temp_id() as usize].is_vec() {
                        let vec_ops: Vec<Operand> =
                            instr_at(program, ctx.info[old_op.temp_id() as usize].loc)
                                .operands
                                .iter()
                                .copied()
                                .collect();
                        for mut op in vec_ops {
                            if op.is_temp() {
                                let op_info = ctx.info[op.temp_id() as usize];
                                if op_info.is_temp()
                                    && op_info.temp.ty()
                                        == instr.definitions[0].reg_class().ty()
                                {
                                    op.set_temp(op_info.temp);
                                }
                            }
                            instr.operands.push(op);
                        }
                    } else {
                        instr.operands.push(old_op);
                    }
                }
                debug_assert_eq!(instr.operands.len(), num_ops);
            }
            if instr.operands.len() == 1 && instr.operands[0].is_temp() {
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_temp(instr.operands[0].get_temp());
            } else if instr.definitions[0].get_temp().size() as usize == instr.operands.len() {
                ctx.info[instr.definitions[0].temp_id() as usize].set_vec(loc);
            }
        }
        Opcode::p_split_vector => {
            if instr.operands[0].is_temp()
                && ctx.info[instr.operands[0].temp_id() as usize].is_vec()
            {
                let vec_ops: Vec<Operand> =
                    instr_at(program, ctx.info[instr.operands[0].temp_id() as usize].loc)
                        .operands
                        .iter()
                        .copied()
                        .collect();
                if vec_ops.len() == instr.definitions.len() {
                    for (def, vec_op) in instr.definitions.iter().zip(vec_ops) {
                        if vec_op.is_constant() {
                            if vec_op.is_literal() {
                                ctx.info[def.temp_id() as usize]
                                    .set_literal(vec_op.constant_value());
                            } else if vec_op.size() == 1 {
                                ctx.info[def.temp_id() as usize]
                                    .set_constant(vec_op.constant_value());
                            }
                        } else if vec_op.is_temp() {
                            ctx.info[def.temp_id() as usize].set_temp(vec_op.get_temp());
                        }
                    }
                }
            }
        }
        Opcode::p_extract_vector => {
            if instr.operands[0].is_temp()
                && ctx.info[instr.operands[0].temp_id() as usize].is_vec()
            {
                let vec = instr_at(program, ctx.info[instr.operands[0].temp_id() as usize].loc);
                if vec.definitions[0].get_temp().size() as usize == vec.operands.len()
                    && vec.operands[0].size() == instr.definitions[0].size()
                {
                    // Convert this extract into a mov.
                    let vec_op = vec.operands[instr.operands[1].constant_value() as usize];
                    let is_vgpr = instr.definitions[0].get_temp().ty() == RegType::Vgpr;
                    instr.opcode = if is_vgpr { Opcode::v_mov_b32 } else { Opcode::s_mov_b32 };
                    instr.format = if is_vgpr { Format::VOP1 } else { Format::SOP1 };
                    instr.data = InstrData::None;
                    instr.operands.truncate(1);
                    instr.operands[0] = vec_op;

                    if vec_op.is_constant() {
                        if vec_op.is_literal() {
                            ctx.info[instr.definitions[0].temp_id() as usize]
                                .set_literal(vec_op.constant_value());
                        } else if vec_op.size() == 1 {
                            ctx.info[instr.definitions[0].temp_id() as usize]
                                .set_constant(vec_op.constant_value());
                        }
                    } else if vec_op.is_temp() {
                        ctx.info[instr.definitions[0].temp_id() as usize]
                            .set_temp(vec_op.get_temp());
                    }
                }
            }
        }
        Opcode::s_mov_b32 | Opcode::s_mov_b64 | Opcode::v_mov_b32 | Opcode::p_as_uniform => {
            if instr.definitions[0].is_fixed() {
                // Don't copy-propagate copies into fixed registers.
            } else if instr.uses_modifiers() {
            } else if instr.operands[0].is_constant() {
                if instr.operands[0].is_literal() {
                    ctx.info[instr.definitions[0].temp_id() as usize]
                        .set_literal(instr.operands[0].constant_value());
                } else if instr.operands[0].size() == 1 {
                    ctx.info[instr.definitions[0].temp_id() as usize]
                        .set_constant(instr.operands[0].constant_value());
                }
            } else if instr.operands[0].is_temp() {
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_temp(instr.operands[0].get_temp());
            }
        }
        Opcode::p_is_helper => {
            if !program.config.needs_wqm {
                ctx.info[instr.definitions[0].temp_id() as usize].set_constant(0);
            }
        }
        Opcode::s_movk_i32 => {
            let mut v = instr.salu_imm() as u32;
            if v & 0x8000 != 0 {
                v |= 0xFFFF_0000;
            }
            if v <= 64 || v >= 0xFFFF_FFF0 {
                ctx.info[instr.definitions[0].temp_id() as usize].set_constant(v);
            } else {
                ctx.info[instr.definitions[0].temp_id() as usize].set_literal(v);
            }
        }
        Opcode::v_bfrev_b32 | Opcode::s_brev_b32 => {
            if instr.operands[0].is_constant() {
                let v = instr.operands[0].constant_value().reverse_bits();
                if v <= 64 || v >= 0xFFFF_FFF0 {
                    ctx.info[instr.definitions[0].temp_id() as usize].set_constant(v);
                } else {
                    ctx.info[instr.definitions[0].temp_id() as usize].set_literal(v);
                }
            }
        }
        Opcode::s_bfm_b32 => {
            if instr.operands[0].is_constant() && instr.operands[1].is_constant() {
                let size = instr.operands[0].constant_value() & 0x1f;
                let start = instr.operands[1].constant_value() & 0x1f;
                let v = (((1u64 << size) - 1) as u32) << start;
                if v <= 64 || v >= 0xFFFF_FFF0 {
                    ctx.info[instr.definitions[0].temp_id() as usize].set_constant(v);
                } else {
                    ctx.info[instr.definitions[0].temp_id() as usize].set_literal(v);
                }
            }
        }
        Opcode::v_mul_f32 => {
            // omod candidates.
            if !instr.uses_modifiers() {
                for i in 0..2 {
                    if instr.operands[1 - i].is_constant() && instr.operands[i].is_temp() {
                        match instr.operands[1 - i].constant_value() {
                            0x4000_0000 => {
                                ctx.info[instr.operands[i].temp_id() as usize].set_omod2()
                            }
                            0x4080_0000 => {
                                ctx.info[instr.operands[i].temp_id() as usize].set_omod4()
                            }
                            0x3f00_0000 => {
                                ctx.info[instr.operands[i].temp_id() as usize].set_omod5()
                            }
                            0x3f80_0000 => ctx.info[instr.definitions[0].temp_id() as usize]
                                .set_temp(instr.operands[i].get_temp()),
                            _ => continue,
                        }
                        break;
                    }
                }
            }
        }
        Opcode::v_and_b32 => {
            // abs.
            if instr.operands[0].constant_equals(0x7FFF_FFFF) && instr.operands[1].is_temp() {
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_abs(instr.operands[1].get_temp());
            } else {
                ctx.info[instr.definitions[0].temp_id() as usize].set_bitwise(loc);
            }
        }
        Opcode::v_xor_b32 => {
            // neg.
            if instr.operands[0].constant_equals(0x8000_0000) && instr.operands[1].is_temp() {
                let op_info = ctx.info[instr.operands[1].temp_id() as usize];
                if op_info.is_neg() {
                    ctx.info[instr.definitions[0].temp_id() as usize].set_temp(op_info.temp);
                } else if op_info.is_abs() {
                    // neg(abs(x)).
                    instr.operands[1].set_temp(op_info.temp);
                    instr.opcode = Opcode::v_or_b32;
                    ctx.info[instr.definitions[0].temp_id() as usize]
                        .set_neg_abs(instr.operands[1].get_temp());
                } else {
                    ctx.info[instr.definitions[0].temp_id() as usize]
                        .set_neg(instr.operands[1].get_temp());
                }
            } else {
                ctx.info[instr.definitions[0].temp_id() as usize].set_bitwise(loc);
            }
        }
        Opcode::v_med3_f32 => {
            // clamp.
            let (abs, neg, opsel, _, omod) = vop3_fields(instr);
            if abs.iter().any(|&b| b)
                || neg.iter().any(|&b| b)
                || opsel.iter().any(|&b| b)
                || omod != 0
            {
                return;
            }
            let mut idx = 0;
            let mut found_zero = false;
            let mut found_one = false;
            for i in 0..3 {
                if instr.operands[i].constant_equals(0) {
                    found_zero = true;
                } else if instr.operands[i].constant_equals(0x3f80_0000) {
                    found_one = true;
                } else {
                    idx = i;
                }
            }
            if found_zero && found_one && instr.operands[idx].is_temp() {
                ctx.info[instr.operands[idx].temp_id() as usize].set_clamp();
            }
        }
        Opcode::v_cndmask_b32 => {
            if instr.operands[0].constant_equals(0)
                && instr.operands[1].constant_equals(0xFFFF_FFFF)
                && instr.operands[2].is_temp()
            {
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_vcc(instr.operands[2].get_temp());
            } else if instr.operands[0].constant_equals(0)
                && instr.operands[1].constant_equals(0x3f80_0000)
                && instr.operands[2].is_temp()
            {
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_b2f(instr.operands[2].get_temp());
            }
        }
        Opcode::v_cmp_lg_u32 => {
            if instr.format == Format::VOPC
                && instr.operands[0].constant_equals(0)
                && instr.operands[1].is_temp()
                && ctx.info[instr.operands[1].temp_id() as usize].is_vcc()
            {
                let t = ctx.info[instr.operands[1].temp_id() as usize].temp;
                ctx.info[instr.definitions[0].temp_id() as usize].set_temp(t);
            }
        }
        Opcode::p_phi | Opcode::p_linear_phi => {
            // Phis whose operands are all one temp collapse onto it.
            let mut all_same_temp = instr.operands[0].is_temp()
                && instr.definitions[0].reg_class() == instr.operands[0].reg_class();
            for i in 1..instr.operands.len() {
                if !all_same_temp {
                    break;
                }
                if !instr.operands[i].is_temp()
                    || instr.operands[i].temp_id() != instr.operands[0].temp_id()
                {
                    all_same_temp = false;
                }
            }
            if all_same_temp {
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_temp(instr.operands[0].get_temp());
            } else if instr.operands.iter().all(|op| op.is_undefined()) {
                ctx.info[instr.definitions[0].temp_id() as usize].set_undefined();
            }
        }
        Opcode::v_add_u32 | Opcode::v_add_co_u32 | Opcode::s_add_i32 | Opcode::s_add_u32 => {
            ctx.info[instr.definitions[0].temp_id() as usize].set_add_sub(loc);
        }
        Opcode::s_and_b32 | Opcode::s_and_b64 => {
            if instr.operands[1].is_fixed()
                && instr.operands[1].phys_reg() == crate::ir::EXEC
                && instr.operands[0].is_temp()
                && ctx.info[instr.operands[0].temp_id() as usize].is_uniform_bool()
            {
                let t = ctx.info[instr.operands[0].temp_id() as usize].temp;
                if instr.definitions.len() > 1 && instr.definitions[1].is_temp() {
                    ctx.info[instr.definitions[1].temp_id() as usize].set_temp(t);
                }
            }
            ctx.info[instr.definitions[0].temp_id() as usize].set_bitwise(loc);
        }
        Opcode::s_not_b32
        | Opcode::s_not_b64
        | Opcode::s_or_b32
        | Opcode::s_or_b64
        | Opcode::s_xor_b32
        | Opcode::s_xor_b64
        | Opcode::s_lshl_b32
        | Opcode::v_or_b32
        | Opcode::v_lshlrev_b32 => {
            ctx.info[instr.definitions[0].temp_id() as usize].set_bitwise(loc);
        }
        Opcode::v_min_f32
        | Opcode::v_min_f16
        | Opcode::v_min_u32
        | Opcode::v_min_i32
        | Opcode::v_min_u16
        | Opcode::v_min_i16
        | Opcode::v_max_f32
        | Opcode::v_max_f16
        | Opcode::v_max_u32
        | Opcode::v_max_i32
        | Opcode::v_max_u16
        | Opcode::v_max_i16 => {
            ctx.info[instr.definitions[0].temp_id() as usize].set_minmax(loc);
        }
        Opcode::v_cmp_lt_f32
        | Opcode::v_cmp_eq_f32
        | Opcode::v_cmp_le_f32
        | Opcode::v_cmp_gt_f32
        | Opcode::v_cmp_lg_f32
        | Opcode::v_cmp_ge_f32
        | Opcode::v_cmp_o_f32
        | Opcode::v_cmp_u_f32
        | Opcode::v_cmp_nge_f32
        | Opcode::v_cmp_nlg_f32
        | Opcode::v_cmp_ngt_f32
        | Opcode::v_cmp_nle_f32
        | Opcode::v_cmp_neq_f32
        | Opcode::v_cmp_nlt_f32 => {
            ctx.info[instr.definitions[0].temp_id() as usize].set_fcmp(loc);
        }
        Opcode::s_cselect_b32 | Opcode::s_cselect_b64 => {
            if instr.operands[0].constant_equals(u32::MAX)
                && instr.operands[1].constant_equals(0)
                && instr.operands[2].is_temp()
            {
                // A cselect on a uniform bool, e.g. from s_cmp.
                ctx.info[instr.definitions[0].temp_id() as usize]
                    .set_uniform_bool(instr.operands[2].get_temp());
            }
        }
        _ => {}
    }
}

fn get_cmp_info(op: Opcode) -> Option<(Opcode, Opcode, Opcode)> {
    // (ordered, unordered, inverse)
    use Opcode::*;
    Some(match op {
        v_cmp_lt_f32 => (v_cmp_lt_f32, v_cmp_nge_f32, v_cmp_nlt_f32),
        v_cmp_nge_f32 => (v_cmp_lt_f32, v_cmp_nge_f32, v_cmp_ge_f32),
        v_cmp_eq_f32 => (v_cmp_eq_f32, v_cmp_nlg_f32, v_cmp_neq_f32),
        v_cmp_nlg_f32 => (v_cmp_eq_f32, v_cmp_nlg_f32, v_cmp_lg_f32),
        v_cmp_le_f32 => (v_cmp_le_f32, v_cmp_ngt_f32, v_cmp_nle_f32),
        v_cmp_ngt_f32 => (v_cmp_le_f32, v_cmp_ngt_f32, v_cmp_gt_f32),
        v_cmp_gt_f32 => (v_cmp_gt_f32, v_cmp_nle_f32, v_cmp_ngt_f32),
        v_cmp_nle_f32 => (v_cmp_gt_f32, v_cmp_nle_f32, v_cmp_le_f32),
        v_cmp_lg_f32 => (v_cmp_lg_f32, v_cmp_neq_f32, v_cmp_nlg_f32),
        v_cmp_neq_f32 => (v_cmp_lg_f32, v_cmp_neq_f32, v_cmp_eq_f32),
        v_cmp_ge_f32 => (v_cmp_ge_f32, v_cmp_nlt_f32, v_cmp_nge_f32),
        v_cmp_nlt_f32 => (v_cmp_ge_f32, v_cmp_nlt_f32, v_cmp_lt_f32),
        _ => return None,
    })
}

fn is_cmp(op: Opcode) -> bool {
    get_cmp_info(op).is_some()
}

fn original_temp_id(ctx: &OptCtx, tmp: Temp) -> u32 {
    if ctx.info[tmp.id() as usize].is_temp() {
        ctx.info[tmp.id() as usize].temp.id()
    } else {
        tmp.id()
    }
}

fn decrease_uses(ctx: &mut OptCtx, instr: &Instruction) {
    ctx.uses[instr.definitions[0].temp_id() as usize] -= 1;
    if ctx.uses[instr.definitions[0].temp_id() as usize] == 0 {
        for op in &instr.operands {
            if op.is_temp() {
                ctx.uses[op.temp_id() as usize] -= 1;
            }
        }
    }
}

fn follow_operand(ctx: &OptCtx, op: Operand, ignore_uses: bool) -> Option<InstrLoc> {
    if !op.is_temp() || !ctx.info[op.temp_id() as usize].has_instr_label() {
        return None;
    }
    if !ignore_uses && ctx.uses[op.temp_id() as usize] > 1 {
        return None;
    }
    Some(ctx.info[op.temp_id() as usize].loc)
}

/// Check that a followed instruction's secondary definition is dead; such
/// instructions cannot be folded away otherwise.
fn second_def_unused(ctx: &OptCtx, instr: &Instruction) -> bool {
    if instr.definitions.len() == 2 {
        if instr.definitions[1].is_temp() && ctx.uses[instr.definitions[1].temp_id() as usize] > 0 {
            return false;
        }
    }
    true
}

/// Whether the scc definition of a SALU instruction is still needed.
fn scc_def_used(ctx: &OptCtx, instr: &Instruction) -> bool {
    instr
        .definitions
        .get(1)
        .map(|def| def.is_temp() && ctx.uses[def.temp_id() as usize] > 0)
        .unwrap_or(false)
}

fn new_vopc_like(cmp: &Instruction, new_op: Opcode, def: Definition) -> Instruction {
    let mut new_instr = if cmp.is_vop3() {
        let mut i = Instruction::new(new_op, Format::VOPC.as_vop3(), 2, 1);
        i.data = cmp.data.clone();
        i
    } else {
        Instruction::new(new_op, Format::VOPC, 2, 1)
    };
    new_instr.operands[0] = cmp.operands[0];
    new_instr.operands[1] = cmp.operands[1];
    new_instr.definitions[0] = def;
    new_instr
}

/// s_or_b64(neq(a, a), neq(b, b)) -> v_cmp_u_f32(a, b)
/// s_and_b64(eq(a, a), eq(b, b)) -> v_cmp_o_f32(a, b)
fn combine_ordering_test(program: &mut Program, ctx: &mut OptCtx, instr: &mut Instruction) -> bool {
    if instr.definitions[0].reg_class() != program.lane_mask() {
        return false;
    }
    if scc_def_used(ctx, instr) {
        return false;
    }

    let is_or = matches!(instr.opcode, Opcode::s_or_b64 | Opcode::s_or_b32);
    let expected_cmp = if is_or { Opcode::v_cmp_neq_f32 } else { Opcode::v_cmp_eq_f32 };

    let mut neg = [false; 2];
    let mut abs = [false; 2];
    let mut op = [Temp::new(0, RegClass::V1); 2];
    let mut locs = [InstrLoc::default(); 2];

    for i in 0..2 {
        let loc = match follow_operand(ctx, instr.operands[i], true) {
            Some(loc) => loc,
            None => return false,
        };
        locs[i] = loc;
        let op_instr = instr_at(program, loc);
        if op_instr.opcode != expected_cmp {
            return false;
        }
        if !op_instr.operands[0].is_temp() || !op_instr.operands[1].is_temp() {
            return false;
        }
        if op_instr.is_vop3() {
            let (a, n, o, _, _) = vop3_fields(op_instr);
            if n[0] != n[1] || a[0] != a[1] || o[0] != o[1] {
                return false;
            }
            neg[i] = n[0];
            abs[i] = a[0];
        }
        let op0 = op_instr.operands[0].get_temp();
        let op1 = op_instr.operands[1].get_temp();
        if original_temp_id(ctx, op0) != original_temp_id(ctx, op1) {
            return false;
        }
        if op1.ty() != RegType::Vgpr {
            return false;
        }
        op[i] = op1;
    }

    ctx.uses[op[0].id() as usize] += 1;
    ctx.uses[op[1].id() as usize] += 1;
    let cmp0 = instr_at(program, locs[0]).clone();
    let cmp1 = instr_at(program, locs[1]).clone();
    decrease_uses(ctx, &cmp0);
    decrease_uses(ctx, &cmp1);

    let new_op = if is_or { Opcode::v_cmp_u_f32 } else { Opcode::v_cmp_o_f32 };
    let def = instr.definitions[0];
    let mut new_instr = if neg[0] || neg[1] || abs[0] || abs[1] {
        let mut i = Instruction::new(new_op, Format::VOPC.as_vop3(), 2, 1);
        i.data = InstrData::Vop3 {
            abs: [abs[0], abs[1], false],
            neg: [neg[0], neg[1], false],
            opsel: [false; 4],
            clamp: false,
            omod: 0,
        };
        i
    } else {
        Instruction::new(new_op, Format::VOPC, 2, 1)
    };
    new_instr.operands[0] = Operand::temp(op[0]);
    new_instr.operands[1] = Operand::temp(op[1]);
    new_instr.definitions[0] = def;

    ctx.info[def.temp_id() as usize].label = Label::empty();
    *instr = new_instr;
    true
}

/// s_or_b64(v_cmp_u_f32(a, b), cmp(a, b)) -> unordered(cmp)(a, b)
/// s_and_b64(v_cmp_o_f32(a, b), cmp(a, b)) -> ordered(cmp)(a, b)
fn combine_comparison_ordering(
    program: &mut Program,
    ctx: &mut OptCtx,
    instr: &mut Instruction,
) -> bool {
    if instr.definitions[0].reg_class() != program.lane_mask() {
        return false;
    }
    if scc_def_used(ctx, instr) {
        return false;
    }

    let is_or = matches!(instr.opcode, Opcode::s_or_b64 | Opcode::s_or_b32);
    let expected_nan_test = if is_or { Opcode::v_cmp_u_f32 } else { Opcode::v_cmp_o_f32 };

    let loc0 = follow_operand(ctx, instr.operands[0], true);
    let loc1 = follow_operand(ctx, instr.operands[1], true);
    let (mut nan_loc, mut cmp_loc) = match (loc0, loc1) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    if instr_at(program, cmp_loc).opcode == expected_nan_test {
        std::mem::swap(&mut nan_loc, &mut cmp_loc);
    } else if instr_at(program, nan_loc).opcode != expected_nan_test {
        return false;
    }

    let nan_test = instr_at(program, nan_loc).clone();
    let cmp = instr_at(program, cmp_loc).clone();

    if !is_cmp(cmp.opcode) {
        return false;
    }
    if !nan_test.operands[0].is_temp() || !nan_test.operands[1].is_temp() {
        return false;
    }
    if !cmp.operands[0].is_temp() || !cmp.operands[1].is_temp() {
        return false;
    }

    let prop_cmp0 = original_temp_id(ctx, cmp.operands[0].get_temp());
    let prop_cmp1 = original_temp_id(ctx, cmp.operands[1].get_temp());
    let prop_nan0 = original_temp_id(ctx, nan_test.operands[0].get_temp());
    let prop_nan1 = original_temp_id(ctx, nan_test.operands[1].get_temp());
    if prop_cmp0 != prop_nan0 && prop_cmp0 != prop_nan1 {
        return false;
    }
    if prop_cmp1 != prop_nan0 && prop_cmp1 != prop_nan1 {
        return false;
    }

    ctx.uses[cmp.operands[0].temp_id() as usize] += 1;
    ctx.uses[cmp.operands[1].temp_id() as usize] += 1;
    decrease_uses(ctx, &nan_test);
    decrease_uses(ctx, &cmp);

    let (ordered, unordered, _) = get_cmp_info(cmp.opcode).unwrap();
    let new_op = if is_or { unordered } else { ordered };
    let def = instr.definitions[0];
    let new_instr = new_vopc_like(&cmp, new_op, def);

    ctx.info[def.temp_id() as usize].label = Label::empty();
    *instr = new_instr;
    true
}

/// s_or_b64(v_cmp_neq_f32(a, a), cmp(a, #b)), b not NaN -> unordered(cmp)(a, b)
/// s_and_b64(v_cmp_eq_f32(a, a), cmp(a, #b)), b not NaN -> ordered(cmp)(a, b)
fn combine_constant_comparison_ordering(
    program: &mut Program,
    ctx: &mut OptCtx,
    instr: &mut Instruction,
) -> bool {
    if instr.definitions[0].reg_class() != program.lane_mask() {
        return false;
    }
    if scc_def_used(ctx, instr) {
        return false;
    }

    let is_or = matches!(instr.opcode, Opcode::s_or_b64 | Opcode::s_or_b32);
    let expected_nan_test = if is_or { Opcode::v_cmp_neq_f32 } else { Opcode::v_cmp_eq_f32 };

    let loc0 = follow_operand(ctx, instr.operands[0], true);
    let loc1 = follow_operand(ctx, instr.operands[1], true);
    let (mut nan_loc, mut cmp_loc) = match (loc0, loc1) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    if instr_at(program, cmp_loc).opcode == expected_nan_test {
        std::mem::swap(&mut nan_loc, &mut cmp_loc);
    } else if instr_at(program, nan_loc).opcode != expected_nan_test {
        return false;
    }

    let nan_test = instr_at(program, nan_loc).clone();
    let cmp = instr_at(program, cmp_loc).clone();

    if !is_cmp(cmp.opcode) {
        return false;
    }
    if !nan_test.operands[0].is_temp() || !nan_test.operands[1].is_temp() {
        return false;
    }
    if !cmp.operands[0].is_temp() && !cmp.operands[1].is_temp() {
        return false;
    }

    let prop_nan0 = original_temp_id(ctx, nan_test.operands[0].get_temp());
    let prop_nan1 = original_temp_id(ctx, nan_test.operands[1].get_temp());
    if prop_nan0 != prop_nan1 {
        return false;
    }

    let mut constant_operand: i32 = -1;
    for i in 0..2 {
        if cmp.operands[i].is_temp()
            && original_temp_id(ctx, cmp.operands[i].get_temp()) == prop_nan0
        {
            constant_operand = 1 - i as i32;
            break;
        }
    }
    if constant_operand == -1 {
        return false;
    }
    let const_op = cmp.operands[constant_operand as usize];

    let constant = if const_op.is_constant() {
        const_op.constant_value()
    } else if const_op.is_temp() {
        let id = const_op.temp_id() as usize;
        if !ctx.info[id].is_constant_or_literal() {
            return false;
        }
        ctx.info[id].val
    } else {
        return false;
    };

    if f32::from_bits(constant).is_nan() {
        return false;
    }

    if cmp.operands[0].is_temp() {
        ctx.uses[cmp.operands[0].temp_id() as usize] += 1;
    }
    if cmp.operands[1].is_temp() {
        ctx.uses[cmp.operands[1].temp_id() as usize] += 1;
    }
    decrease_uses(ctx, &nan_test);
    decrease_uses(ctx, &cmp);

    let (ordered, unordered, _) = get_cmp_info(cmp.opcode).unwrap();
    let new_op = if is_or { unordered } else { ordered };
    let def = instr.definitions[0];
    let new_instr = new_vopc_like(&cmp, new_op, def);

    ctx.info[def.temp_id() as usize].label = Label::empty();
    *instr = new_instr;
    true
}

/// s_not_b64(cmp(a, b)) -> inverse(cmp)(a, b)
fn combine_inverse_comparison(
    program: &mut Program,
    ctx: &mut OptCtx,
    instr: &mut Instruction,
) -> bool {
    if instr.opcode != Opcode::s_not_b64 {
        return false;
    }
    if scc_def_used(ctx, instr) {
        return false;
    }
    if !instr.operands[0].is_temp() {
        return false;
    }

    let loc = match follow_operand(ctx, instr.operands[0], false) {
        Some(loc) => loc,
        None => return false,
    };
    let cmp = instr_at(program, loc).clone();
    if !second_def_unused(ctx, &cmp) {
        return false;
    }

    let new_opcode = match get_cmp_info(cmp.opcode) {
        Some((_, _, inverse)) => inverse,
        None => return false,
    };

    if cmp.operands[0].is_temp() {
        ctx.uses[cmp.operands[0].temp_id() as usize] += 1;
    }
    if cmp.operands[1].is_temp() {
        ctx.uses[cmp.operands[1].temp_id() as usize] += 1;
    }
    decrease_uses(ctx, &cmp);

    let def = instr.definitions[0];
    let new_instr = new_vopc_like(&cmp, new_opcode, def);

    ctx.info[def.temp_id() as usize].label = Label::empty();
    *instr = new_instr;
    true
}

struct Op3Match {
    operands: [Operand; 3],
    neg: [bool; 3],
    abs: [bool; 3],
    opsel: [bool; 3],
    clamp: bool,
    omod: u8,
    inbetween_neg: bool,
    inbetween_abs: bool,
}

/// op1(op2(1, 2), 0) if swap = false
/// op1(0, op2(1, 2)) if swap = true
#[allow(clippy::too_many_arguments)]
fn match_op3_for_vop3(
    program: &Program,
    ctx: &OptCtx,
    op1: Opcode,
    op2: Opcode,
    op1_instr: &Instruction,
    swap: usize,
    shuffle: [usize; 3],
    allow_inbetween_mods: bool,
) -> Option<Op3Match> {
    if op1_instr.opcode != op1 {
        return None;
    }

    let loc = follow_operand(ctx, op1_instr.operands[swap], false)?;
    let op2_instr = instr_at(program, loc);
    if op2_instr.opcode != op2 || !second_def_unused(ctx, op2_instr) {
        return None;
    }

    let op1_vop3 = op1_instr.is_vop3().then(|| vop3_fields(op1_instr));
    let op2_vop3 = op2_instr.is_vop3().then(|| vop3_fields(op2_instr));

    // No inbetween clamp/omod.
    if let Some((_, _, _, clamp, omod)) = op2_vop3 {
        if clamp || omod != 0 {
            return None;
        }
    }

    let (o1_abs, o1_neg, o1_opsel, clamp, omod) =
        op1_vop3.unwrap_or(([false; 3], [false; 3], [false; 4], false, 0));

    let inbetween_neg = o1_neg[swap];
    let inbetween_abs = o1_abs[swap];
    if (inbetween_neg || inbetween_abs || o1_opsel[swap]) && !allow_inbetween_mods {
        return None;
    }
    if o1_opsel[swap] {
        return None;
    }

    let mut m = Op3Match {
        operands: [Operand::undef(RegClass::V1); 3],
        neg: [false; 3],
        abs: [false; 3],
        opsel: [false; 3],
        clamp,
        omod,
        inbetween_neg,
        inbetween_abs,
    };

    m.operands[shuffle[0]] = op1_instr.operands[1 - swap];
    m.neg[shuffle[0]] = o1_neg[1 - swap];
    m.abs[shuffle[0]] = o1_abs[1 - swap];
    m.opsel[shuffle[0]] = o1_opsel[1 - swap];

    let (o2_abs, o2_neg, o2_opsel, _, _) =
        op2_vop3.unwrap_or(([false; 3], [false; 3], [false; 4], false, 0));
    for i in 0..2 {
        m.operands[shuffle[i + 1]] = op2_instr.operands[i];
        m.neg[shuffle[i + 1]] = o2_neg[i];
        m.abs[shuffle[i + 1]] = o2_abs[i];
        m.opsel[shuffle[i + 1]] = o2_opsel[i];
    }

    // Check operands: no literals, at most one distinct SGPR.
    let mut sgpr_id = 0;
    for op in &m.operands {
        if op.is_literal() {
            return None;
        }
        if op.is_temp() && op.get_temp().ty() == RegType::Sgpr {
            if sgpr_id != 0 && sgpr_id != op.temp_id() {
                return None;
            }
            sgpr_id = op.temp_id();
        }
    }

    Some(m)
}

fn create_vop3_for_op3(ctx: &mut OptCtx, opcode: Opcode, instr: &mut Instruction, m: &Op3Match) {
    let mut new_instr = Instruction::new(opcode, Format::VOP3, 3, 1);
    new_instr.data = InstrData::Vop3 {
        abs: m.abs,
        neg: m.neg,
        opsel: [m.opsel[0], m.opsel[1], m.opsel[2], false],
        clamp: m.clamp,
        omod: m.omod,
    };
    new_instr.operands.copy_from_slice(&m.operands);
    new_instr.definitions[0] = instr.definitions[0];
    ctx.info[instr.definitions[0].temp_id() as usize].label = Label::empty();
    *instr = new_instr;
}

fn combine_three_valu_op(
    program: &mut Program,
    ctx: &mut OptCtx,
    instr: &mut Instruction,
    loc: InstrLoc,
    op2: Opcode,
    new_op: Opcode,
    shuffle: [usize; 3],
    ops: u8,
) -> bool {
    let omod_clamp = ctx.info[instr.definitions[0].temp_id() as usize].label
        & (Label::OMOD_SUCCESS | Label::CLAMP_SUCCESS);

    for swap in 0..2usize {
        if (1 << swap) & ops == 0 {
            continue;
        }
        if let Some(m) =
            match_op3_for_vop3(program, ctx, instr.opcode, op2, instr, swap, shuffle, false)
        {
            ctx.uses[instr.operands[swap].temp_id() as usize] -= 1;
            create_vop3_for_op3(ctx, new_op, instr, &m);
            if omod_clamp.contains(Label::OMOD_SUCCESS) {
                ctx.info[instr.definitions[0].temp_id() as usize].set_omod_success(loc);
            }
            if omod_clamp.contains(Label::CLAMP_SUCCESS) {
                ctx.info[instr.definitions[0].temp_id() as usize].set_clamp_success(loc);
            }
            return true;
        }
    }
    false
}

/// s_not(s_and/or/xor) -> s_nand/nor/xnor
fn combine_salu_not_bitwise(program: &mut Program, ctx: &mut OptCtx, instr: &mut Instruction) -> bool {
    if !instr.operands[0].is_temp() {
        return false;
    }
    if scc_def_used(ctx, instr) {
        return false;
    }

    let loc = match follow_operand(ctx, instr.operands[0], false) {
        Some(loc) => loc,
        None => return false,
    };
    {
        let op2_instr = instr_at(program, loc);
        if !matches!(
            op2_instr.opcode,
            Opcode::s_and_b32
                | Opcode::s_or_b32
                | Opcode::s_xor_b32
                | Opcode::s_and_b64
                | Opcode::s_or_b64
                | Opcode::s_xor_b64
        ) || !second_def_unused(ctx, op2_instr)
        {
            return false;
        }
    }

    ctx.uses[instr.operands[0].temp_id() as usize] -= 1;
    let op2_instr = instr_at_mut(program, loc);
    std::mem::swap(&mut instr.definitions[0], &mut op2_instr.definitions[0]);
    op2_instr.opcode = match op2_instr.opcode {
        Opcode::s_and_b32 => Opcode::s_nand_b32,
        Opcode::s_or_b32 => Opcode::s_nor_b32,
        Opcode::s_xor_b32 => Opcode::s_xnor_b32,
        Opcode::s_and_b64 => Opcode::s_nand_b64,
        Opcode::s_or_b64 => Opcode::s_nor_b64,
        Opcode::s_xor_b64 => Opcode::s_xnor_b64,
        _ => unreachable!(),
    };
    let new_def = op2_instr.definitions[0].temp_id();
    ctx.info[new_def as usize].label = Label::empty();
    true
}

/// s_and(a, s_not(b)) -> s_andn2(a, b)
/// s_or(a, s_not(b)) -> s_orn2(a, b)
fn combine_salu_n2(program: &mut Program, ctx: &mut OptCtx, instr: &mut Instruction) -> bool {
    if scc_def_used(ctx, instr) {
        return false;
    }

    for i in 0..2 {
        let loc = match follow_operand(ctx, instr.operands[i], false) {
            Some(loc) => loc,
            None => continue,
        };
        let op2_instr = instr_at(program, loc);
        if !matches!(op2_instr.opcode, Opcode::s_not_b32 | Opcode::s_not_b64)
            || !second_def_unused(ctx, op2_instr)
        {
            continue;
        }
        let not_operand = op2_instr.operands[0];

        ctx.uses[instr.operands[i].temp_id() as usize] -= 1;
        instr.operands[0] = instr.operands[1 - i];
        instr.operands[1] = not_operand;
        ctx.info[instr.definitions[0].temp_id() as usize].label = Label::empty();

        instr.opcode = match instr.opcode {
            Opcode::s_and_b32 => Opcode::s_andn2_b32,
            Opcode::s_or_b32 => Opcode::s_orn2_b32,
            Opcode::s_and_b64 => Opcode::s_andn2_b64,
            Opcode::s_or_b64 => Opcode::s_orn2_b64,
            _ => instr.opcode,
        };
        return true;
    }
    false
}

/// s_add_{i32,u32}(a, s_lshl_b32(b, <n>)) -> s_lshl<n>_add_u32(a, b)
fn combine_salu_lshl_add(program: &mut Program, ctx: &mut OptCtx, instr: &mut Instruction) -> bool {
    if scc_def_used(ctx, instr) {
        return false;
    }

    for i in 0..2 {
        let loc = match follow_operand(ctx, instr.operands[i], false) {
            Some(loc) => loc,
            None => continue,
        };
        let op2_instr = instr_at(program, loc);
        if op2_instr.opcode != Opcode::s_lshl_b32
            || !op2_instr.operands[1].is_constant()
            || !second_def_unused(ctx, op2_instr)
        {
            continue;
        }
        let shift = op2_instr.operands[1].constant_value();
        if !(1..=4).contains(&shift) {
            continue;
        }
        let shl_operand = op2_instr.operands[0];

        ctx.uses[instr.operands[i].temp_id() as usize] -= 1;
        instr.operands[1] = instr.operands[1 - i];
        instr.operands[0] = shl_operand;
        ctx.info[instr.definitions[0].temp_id() as usize].label = Label::empty();

        instr.opcode = [
            Opcode::s_lshl1_add_u32,
            Opcode::s_lshl2_add_u32,
            Opcode::s_lshl3_add_u32,
            Opcode::s_lshl4_add_u32,
        ][shift as usize - 1];
        return true;
    }
    false
}

struct MinMaxInfo {
    min: Opcode,
    max: Opcode,
    min3: Opcode,
    max3: Opcode,
    med3: Opcode,
    some_gfx9_only: bool,
}

fn get_minmax_info(op: Opcode) -> Option<MinMaxInfo> {
    use Opcode::*;
    macro_rules! minmax {
        ($min:ident, $max:ident, $min3:ident, $max3:ident, $med3:ident, $gfx9:expr) => {
            MinMaxInfo {
                min: $min,
                max: $max,
                min3: $min3,
                max3: $max3,
                med3: $med3,
                some_gfx9_only: $gfx9,
            }
        };
    }
    Some(match op {
        v_min_f32 | v_max_f32 | v_med3_f32 => {
            minmax!(v_min_f32, v_max_f32, v_min3_f32, v_max3_f32, v_med3_f32, false)
        }
        v_min_u32 | v_max_u32 | v_med3_u32 => {
            minmax!(v_min_u32, v_max_u32, v_min3_u32, v_max3_u32, v_med3_u32, false)
        }
        v_min_i32 | v_max_i32 | v_med3_i32 => {
            minmax!(v_min_i32, v_max_i32, v_min3_i32, v_max3_i32, v_med3_i32, false)
        }
        v_min_f16 | v_max_f16 | v_med3_f16 => {
            minmax!(v_min_f16, v_max_f16, v_min3_f16, v_max3_f16, v_med3_f16, true)
        }
        v_min_u16 | v_max_u16 | v_med3_u16 => {
            minmax!(v_min_u16, v_max_u16, v_min3_u16, v_max3_u16, v_med3_u16, true)
        }
        v_min_i16 | v_max_i16 | v_med3_i16 => {
            minmax!(v_min_i16, v_max_i16, v_min3_i16, v_max3_i16, v_med3_i16, true)
        }
        _ => return None,
    })
}

fn half_to_f32(h: u16) -> f32 {
    let sign = (h >> 15) as u32;
    let exp = ((h >> 10) & 0x1f) as u32;
    let mant = (h & 0x3ff) as u32;
    let bits = if exp == 0 {
        if mant == 0 {
            sign << 31
        } else {
            // Subnormal: normalize.
            let mut exp = 127 - 15 + 1;
            let mut mant = mant;
            while mant & 0x400 == 0 {
                mant <<= 1;
                exp -= 1;
            }
            (sign << 31) | ((exp as u32) << 23) | ((mant & 0x3ff) << 13)
        }
    } else if exp == 0x1f {
        (sign << 31) | 0x7f80_0000 | (mant << 13)
    } else {
        (sign << 31) | ((exp + 127 - 15) << 23) | (mant << 13)
    };
    f32::from_bits(bits)
}

/// v_min(v_max(a, lb), ub) -> v_med3(a, lb, ub) when ub > lb
/// v_max(v_min(a, ub), lb) -> v_med3(a, lb, ub) when ub > lb
fn combine_clamp(
    program: &mut Program,
    ctx: &mut OptCtx,
    instr: &mut Instruction,
    loc: InstrLoc,
    min: Opcode,
    max: Opcode,
    med: Opcode,
) -> bool {
    let other_op = if instr.opcode == min {
        max
    } else if instr.opcode == max {
        min
    } else {
        return false;
    };

    let omod_clamp = ctx.info[instr.definitions[0].temp_id() as usize].label
        & (Label::OMOD_SUCCESS | Label::CLAMP_SUCCESS);

    for swap in 0..2usize {
        let mut m = match match_op3_for_vop3(
            program,
            ctx,
            instr.opcode,
            other_op,
            instr,
            swap,
            [0, 1, 2],
            true,
        ) {
            Some(m) => m,
            None => continue,
        };

        let mut const0_idx: i32 = -1;
        let mut const1_idx: i32 = -1;
        let mut const0 = 0u32;
        let mut const1 = 0u32;
        for i in 0..3 {
            let val;
            if m.operands[i].is_constant() {
                val = m.operands[i].constant_value();
            } else if m.operands[i].is_temp()
                && ctx.uses[m.operands[i].temp_id() as usize] == 1
                && ctx.info[m.operands[i].temp_id() as usize].is_constant_or_literal()
            {
                val = ctx.info[m.operands[i].temp_id() as usize].val;
            } else {
                continue;
            }
            if const0_idx >= 0 {
                const1_idx = i as i32;
                const1 = val;
            } else {
                const0_idx = i as i32;
                const0 = val;
            }
        }
        if const0_idx < 0 || const1_idx < 0 {
            continue;
        }

        if m.opsel[const0_idx as usize] {
            const0 >>= 16;
        }
        if m.opsel[const1_idx as usize] {
            const1 >>= 16;
        }

        // Determine which constant is the lower bound, statically.
        let lower_idx = match min {
            Opcode::v_min_f32 | Opcode::v_min_f16 => {
                let mut const0_f = if min == Opcode::v_min_f32 {
                    f32::from_bits(const0)
                } else {
                    half_to_f32(const0 as u16)
                };
                let mut const1_f = if min == Opcode::v_min_f32 {
                    f32::from_bits(const1)
                } else {
                    half_to_f32(const1 as u16)
                };
                if m.abs[const0_idx as usize] {
                    const0_f = const0_f.abs();
                }
                if m.abs[const1_idx as usize] {
                    const1_f = const1_f.abs();
                }
                if m.neg[const0_idx as usize] {
                    const0_f = -const0_f;
                }
                if m.neg[const1_idx as usize] {
                    const1_f = -const1_f;
                }
                if const0_f < const1_f {
                    const0_idx
                } else {
                    const1_idx
                }
            }
            Opcode::v_min_u32 => {
                if const0 < const1 {
                    const0_idx
                } else {
                    const1_idx
                }
            }
            Opcode::v_min_u16 => {
                if (const0 as u16) < (const1 as u16) {
                    const0_idx
                } else {
                    const1_idx
                }
            }
            Opcode::v_min_i32 => {
                if (const0 as i32) < (const1 as i32) {
                    const0_idx
                } else {
                    const1_idx
                }
            }
            Opcode::v_min_i16 => {
                if (const0 as i16) < (const1 as i16) {
                    const0_idx
                } else {
                    const1_idx
                }
            }
            _ => const0_idx,
        };
        let upper_idx = if lower_idx == const0_idx { const1_idx } else { const0_idx };

        // The bound produced by the outer instruction must sit in the outer
        // operand slot (index 0 after the shuffle).
        if instr.opcode == min {
            if upper_idx != 0 || lower_idx == 0 {
                return false;
            }
        } else if upper_idx == 0 || lower_idx != 0 {
            return false;
        }

        m.neg[1] ^= m.inbetween_neg;
        m.neg[2] ^= m.inbetween_neg;
        m.abs[1] |= m.inbetween_abs;
        m.abs[2] |= m.inbetween_abs;

        ctx.uses[instr.operands[swap].temp_id() as usize] -= 1;
        create_vop3_for_op3(ctx, med, instr, &m);
        if omod_clamp.contains(Label::OMOD_SUCCESS) {
            ctx.info[instr.definitions[0].temp_id() as usize].set_omod_success(loc);
        }
        if omod_clamp.contains(Label::CLAMP_SUCCESS) {
            ctx.info[instr.definitions[0].temp_id() as usize].set_clamp_success(loc);
        }
        return true;
    }

    false
}

fn apply_sgprs(ctx: &mut OptCtx, instr: &mut Instruction) {
    let mut sgpr_idx = 0usize;
    let mut sgpr_info_id = 0u32;
    let mut has_sgpr = false;
    let mut sgpr_ssa_id = 0u32;
    // Find the 'best' possible sgpr.
    for (i, op) in instr.operands.iter().enumerate() {
        if op.is_literal() {
            has_sgpr = true;
            break;
        }
        if !op.is_temp() {
            continue;
        }
        if op.get_temp().ty() == RegType::Sgpr {
            has_sgpr = true;
            sgpr_ssa_id = op.temp_id();
            continue;
        }
        let info = ctx.info[op.temp_id() as usize];
        if info.is_temp() && info.temp.ty() == RegType::Sgpr {
            let uses = ctx.uses[op.temp_id() as usize];
            if sgpr_info_id == 0 || uses < ctx.uses[sgpr_info_id as usize] {
                sgpr_idx = i;
                sgpr_info_id = op.temp_id();
            }
        }
    }

    if !has_sgpr && sgpr_info_id != 0 {
        let sgpr = ctx.info[sgpr_info_id as usize].temp;
        if sgpr_idx == 0 || instr.is_vop3() {
            instr.operands[sgpr_idx] = Operand::temp(sgpr);
            ctx.uses[sgpr_info_id as usize] -= 1;
            ctx.uses[sgpr.id() as usize] += 1;
        } else if can_swap_operands(instr) {
            instr.operands[sgpr_idx] = instr.operands[0];
            instr.operands[0] = Operand::temp(sgpr);
            ctx.uses[sgpr_info_id as usize] -= 1;
            ctx.uses[sgpr.id() as usize] += 1;
        } else if can_use_vop3(instr) {
            to_vop3(instr);
            instr.operands[sgpr_idx] = Operand::temp(sgpr);
            ctx.uses[sgpr_info_id as usize] -= 1;
            ctx.uses[sgpr.id() as usize] += 1;
        }
    } else if sgpr_info_id != 0
        && sgpr_ssa_id == sgpr_info_id
        && ctx.uses[sgpr_info_id as usize] == 1
        && can_use_vop3(instr)
    {
        // Two uses of the same sgpr on one instruction are fine.
        to_vop3(instr);
        let sgpr = ctx.info[sgpr_info_id as usize].temp;
        instr.operands[sgpr_idx] = Operand::temp(sgpr);
        ctx.uses[sgpr_info_id as usize] -= 1;
        ctx.uses[sgpr.id() as usize] += 1;
    }
}

fn apply_omod_clamp(
    program: &mut Program,
    ctx: &mut OptCtx,
    loc: InstrLoc,
    instr: &mut Instruction,
) -> bool {
    // Check if omod could be applied on the producer.
    if instr.opcode == Opcode::v_mul_f32 {
        if instr.operands[1].is_temp()
            && ctx.info[instr.operands[1].temp_id() as usize].is_omod_success()
        {
            let producer_tmp = instr.operands[1].get_temp();
            let def = instr.definitions[0];
            // If the omod instruction is a mad, also change the saved add.
            if ctx.info[producer_tmp.id() as usize].is_mad() {
                let mad_idx = ctx.info[producer_tmp.id() as usize].val as usize;
                if ctx.info[def.temp_id() as usize].is_clamp() {
                    let add = &mut ctx.mad_infos[mad_idx].add_instr;
                    add.promote_to_vop3();
                    let (_, _, clamp, _) = vop3_fields_mut(add);
                    *clamp = true;
                }
                ctx.mad_infos[mad_idx].add_instr.definitions[0] = def;
            }

            let omod_loc = ctx.info[producer_tmp.id() as usize].loc;
            // An additional clamp modifier can ride along.
            let apply_clamp =
                ctx.info[def.temp_id() as usize].is_clamp() && ctx.uses[def.temp_id() as usize] == 1;
            {
                let omod_instr = instr_at_mut(program, omod_loc);
                if apply_clamp {
                    let (_, _, clamp, _) = vop3_fields_mut(omod_instr);
                    *clamp = true;
                }
                omod_instr.definitions[0] = def;
            }
            if apply_clamp {
                ctx.info[def.temp_id() as usize].set_clamp_success(omod_loc);
            }

            // Leave this multiply defining something unused.
            instr.definitions[0] = Definition::new(producer_tmp);
            ctx.uses[producer_tmp.id() as usize] = 0;
            return true;
        }
        if ctx.info[instr.definitions[0].temp_id() as usize].label.is_empty() {
            // In all other cases, label this instruction as option for
            // multiply-add.
            ctx.info[instr.definitions[0].temp_id() as usize].set_mul(loc);
        }
    }

    // Check if clamp could be applied on the producer.
    if instr.opcode == Opcode::v_med3_f32 {
        let mut idx = 0;
        let mut found_zero = false;
        let mut found_one = false;
        for i in 0..3 {
            if instr.operands[i].constant_equals(0) {
                found_zero = true;
            } else if instr.operands[i].constant_equals(0x3f80_0000) {
                found_one = true;
            } else {
                idx = i;
            }
        }
        if found_zero
            && found_one
            && instr.operands[idx].is_temp()
            && ctx.info[instr.operands[idx].temp_id() as usize].is_clamp_success()
        {
            let producer_tmp = instr.operands[idx].get_temp();
            let def = instr.definitions[0];
            if ctx.info[producer_tmp.id() as usize].is_mad() {
                let mad_idx = ctx.info[producer_tmp.id() as usize].val as usize;
                ctx.mad_infos[mad_idx].add_instr.definitions[0] = def;
            }
            let clamp_loc = ctx.info[producer_tmp.id() as usize].loc;
            instr_at_mut(program, clamp_loc).definitions[0] = def;

            instr.definitions[0] = Definition::new(producer_tmp);
            ctx.uses[producer_tmp.id() as usize] = 0;
            return true;
        }
    }

    // Apply omod / clamp if the def is used only once and the instruction
    // accepts output modifiers.
    if !instr.definitions.is_empty()
        && ctx.uses[instr.definitions[0].temp_id() as usize] == 1
        && can_use_vop3(instr)
        && instr.opcode.can_use_output_modifiers()
    {
        let def_id = instr.definitions[0].temp_id() as usize;
        if ctx.info[def_id].is_omod2() {
            to_vop3(instr);
            *vop3_fields_mut(instr).3 = 1;
            ctx.info[def_id].set_omod_success(loc);
        } else if ctx.info[def_id].is_omod4() {
            to_vop3(instr);
            *vop3_fields_mut(instr).3 = 2;
            ctx.info[def_id].set_omod_success(loc);
        } else if ctx.info[def_id].is_omod5() {
            to_vop3(instr);
            *vop3_fields_mut(instr).3 = 3;
            ctx.info[def_id].set_omod_success(loc);
        } else if ctx.info[def_id].is_clamp() {
            to_vop3(instr);
            *vop3_fields_mut(instr).2 = true;
            ctx.info[def_id].set_clamp_success(loc);
        }
    }

    false
}

fn combine_instruction(
    program: &mut Program,
    ctx: &mut OptCtx,
    loc: InstrLoc,
    instr: &mut Instruction,
) {
    if instr.definitions.is_empty()
        || !instr.definitions[0].is_temp()
        || ctx.uses[instr.definitions[0].temp_id() as usize] == 0
    {
        return;
    }

    if instr.is_valu() {
        if can_apply_sgprs(instr) {
            apply_sgprs(ctx, instr);
        }
        if apply_omod_clamp(program, ctx, loc, instr) {
            return;
        }
    }

    // neg(mul(a, b)) -> mul(neg(a), b)
    if ctx.info[instr.definitions[0].temp_id() as usize].is_neg()
        && instr.operands.len() > 1
        && instr.operands[1].is_temp()
        && ctx.uses[instr.operands[1].temp_id() as usize] == 1
    {
        let val = ctx.info[instr.definitions[0].temp_id() as usize].temp;

        if ctx.info[val.id() as usize].is_mul() {
            let mul_loc = ctx.info[val.id() as usize].loc;
            let mul_instr = instr_at(program, mul_loc).clone();

            if !mul_instr.operands[0].is_literal() {
                let (_, _, _, mul_clamp, mul_omod) = vop3_fields(&mul_instr);
                if !mul_clamp {
                    // Convert to mul(neg(a), b).
                    ctx.uses[mul_instr.definitions[0].temp_id() as usize] -= 1;
                    let def = instr.definitions[0];
                    let is_abs = ctx.info[def.temp_id() as usize].is_abs();
                    let mut new_mul =
                        Instruction::new(Opcode::v_mul_f32, Format::VOP2.as_vop3(), 2, 1);
                    new_mul.operands[0] = mul_instr.operands[0];
                    new_mul.operands[1] = mul_instr.operands[1];
                    new_mul.definitions[0] = def;
                    let mut abs = [false; 3];
                    let mut neg = [false; 3];
                    if mul_instr.is_vop3() {
                        let (m_abs, m_neg, _, _, _) = vop3_fields(&mul_instr);
                        neg[0] = m_neg[0] && !is_abs;
                        neg[1] = m_neg[1] && !is_abs;
                        abs[0] = m_abs[0] || is_abs;
                        abs[1] = m_abs[1] || is_abs;
                    }
                    neg[0] ^= true;
                    new_mul.data = InstrData::Vop3 {
                        abs,
                        neg,
                        opsel: [false; 4],
                        clamp: false,
                        omod: mul_omod,
                    };
                    *instr = new_mul;
                    ctx.info[def.temp_id() as usize].set_mul(loc);
                    return;
                }
            }
        }
        return;
    }

    // Combine mul+add -> mad.
    if matches!(instr.opcode, Opcode::v_add_f32 | Opcode::v_sub_f32 | Opcode::v_subrev_f32) {
        let mut uses_src0 = u32::MAX;
        let mut uses_src1 = u32::MAX;
        if instr.operands[0].is_temp() && ctx.info[instr.operands[0].temp_id() as usize].is_mul() {
            uses_src0 = ctx.uses[instr.operands[0].temp_id() as usize] as u32;
        }
        if instr.operands[1].is_temp() && ctx.info[instr.operands[1].temp_id() as usize].is_mul() {
            uses_src1 = ctx.uses[instr.operands[1].temp_id() as usize] as u32;
        }
        let mut mul_loc = None;
        let mut add_op_idx = 0;
        if uses_src0 < uses_src1 {
            mul_loc = Some(ctx.info[instr.operands[0].temp_id() as usize].loc);
            add_op_idx = 1;
        } else if uses_src1 < uses_src0 {
            mul_loc = Some(ctx.info[instr.operands[1].temp_id() as usize].loc);
            add_op_idx = 0;
        } else if uses_src0 != u32::MAX {
            // Tiebreaker.
            let loc0 = ctx.info[instr.operands[0].temp_id() as usize].loc;
            if instr_at(program, loc0).operands[0].is_literal() {
                mul_loc = Some(ctx.info[instr.operands[1].temp_id() as usize].loc);
                add_op_idx = 0;
            } else {
                mul_loc = Some(loc0);
                add_op_idx = 1;
            }
        }
        if let Some(mul_loc) = mul_loc {
            let mul_instr = instr_at(program, mul_loc).clone();
            let mut op = [mul_instr.operands[0], mul_instr.operands[1], instr.operands[add_op_idx]];
            let mut neg = [false; 3];
            let mut abs = [false; 3];
            let mut omod = 0u8;
            let mut clamp = false;
            let mut need_vop3 = false;
            let mut num_sgpr = 0;
            for (i, o) in op.iter().enumerate() {
                if o.is_literal() {
                    return;
                }
                if o.is_temp() && o.get_temp().ty() == RegType::Sgpr {
                    num_sgpr += 1;
                }
                if !(i == 0 || (o.is_temp() && o.get_temp().ty() == RegType::Vgpr)) {
                    need_vop3 = true;
                }
            }
            if num_sgpr > 1 {
                return;
            }

            if mul_instr.is_vop3() {
                let (m_abs, m_neg, _, m_clamp, m_omod) = vop3_fields(&mul_instr);
                neg[0] = m_neg[0];
                neg[1] = m_neg[1];
                abs[0] = m_abs[0];
                abs[1] = m_abs[1];
                need_vop3 = true;
                // These modifiers can't sit between the mul and the add.
                if m_clamp || m_omod != 0 {
                    return;
                }
            }

            ctx.uses[mul_instr.definitions[0].temp_id() as usize] -= 1;
            if ctx.uses[mul_instr.definitions[0].temp_id() as usize] > 0 {
                if op[0].is_temp() {
                    ctx.uses[op[0].temp_id() as usize] += 1;
                }
                if op[1].is_temp() {
                    ctx.uses[op[1].temp_id() as usize] += 1;
                }
            }

            if instr.is_vop3() {
                let (a_abs, a_neg, _, a_clamp, a_omod) = vop3_fields(instr);
                neg[2] = a_neg[add_op_idx];
                abs[2] = a_abs[add_op_idx];
                omod = a_omod;
                clamp = a_clamp;
                // abs/neg of the multiplication result.
                if a_abs[1 - add_op_idx] {
                    neg[0] = false;
                    neg[1] = false;
                    abs[0] = true;
                    abs[1] = true;
                }
                neg[1] ^= a_neg[1 - add_op_idx];
                need_vop3 = true;
            }
            if instr.opcode == Opcode::v_sub_f32 {
                neg[1 + add_op_idx] ^= true;
                need_vop3 = true;
            } else if instr.opcode == Opcode::v_subrev_f32 {
                neg[2 - add_op_idx] ^= true;
                need_vop3 = true;
            }

            let mut mad = Instruction::new(Opcode::v_mad_f32, Format::VOP3, 3, 1);
            for i in 0..3 {
                mad.operands[i] = op[i];
            }
            mad.data =
                InstrData::Vop3 { abs, neg, opsel: [false; 4], clamp, omod };
            mad.definitions[0] = instr.definitions[0];
            let mad_def_id = mad.definitions[0].temp_id();

            // Mark this ssa-def to be re-checked for profitability and
            // literals.
            let add_instr = std::mem::replace(instr, mad);
            ctx.mad_infos.push(MadInfo {
                add_instr,
                mul_temp_id: mul_instr.definitions[0].temp_id(),
                literal_idx: 0,
                needs_vop3: need_vop3,
                check_literal: false,
            });
            ctx.info[mad_def_id as usize].set_mad(loc, ctx.mad_infos.len() as u32 - 1);
            return;
        }
    }
    // v_mul_f32(v_cndmask_b32(0, 1.0, cond), a) -> v_cndmask_b32(0, a, cond)
    else if instr.opcode == Opcode::v_mul_f32 && !instr.is_vop3() {
        for i in 0..2 {
            if instr.operands[i].is_temp()
                && ctx.info[instr.operands[i].temp_id() as usize].is_b2f()
                && ctx.uses[instr.operands[i].temp_id() as usize] == 1
                && instr.operands[1 - i].is_temp()
                && instr.operands[1 - i].get_temp().ty() == RegType::Vgpr
            {
                let cond = ctx.info[instr.operands[i].temp_id() as usize].temp;
                ctx.uses[instr.operands[i].temp_id() as usize] -= 1;
                ctx.uses[cond.id() as usize] += 1;

                let mut new_instr = Instruction::new(Opcode::v_cndmask_b32, Format::VOP2, 3, 1);
                new_instr.operands[0] = Operand::c32(0);
                new_instr.operands[1] = instr.operands[1 - i];
                new_instr.operands[2] = Operand::temp(cond);
                new_instr.definitions[0] = instr.definitions[0];
                ctx.info[instr.definitions[0].temp_id() as usize].label = Label::empty();
                *instr = new_instr;
                return;
            }
        }
    } else if instr.opcode == Opcode::v_or_b32 && program.chip_class >= ChipClass::Gfx9 {
        if combine_three_valu_op(program, ctx, instr, loc, Opcode::v_or_b32, Opcode::v_or3_b32, [0, 1, 2], 1 | 2) {
        } else if combine_three_valu_op(program, ctx, instr, loc, Opcode::v_and_b32, Opcode::v_and_or_b32, [1, 2, 0], 1 | 2) {
        } else {
            combine_three_valu_op(program, ctx, instr, loc, Opcode::v_lshlrev_b32, Opcode::v_lshl_or_b32, [2, 1, 0], 1 | 2);
        }
    } else if instr.opcode == Opcode::v_add_u32 && program.chip_class >= ChipClass::Gfx9 {
        if combine_three_valu_op(program, ctx, instr, loc, Opcode::v_xor_b32, Opcode::v_xad_u32, [1, 2, 0], 1 | 2) {
        } else if combine_three_valu_op(program, ctx, instr, loc, Opcode::v_add_u32, Opcode::v_add3_u32, [0, 1, 2], 1 | 2) {
        } else {
            combine_three_valu_op(program, ctx, instr, loc, Opcode::v_lshlrev_b32, Opcode::v_lshl_add_u32, [2, 1, 0], 1 | 2);
        }
    } else if instr.opcode == Opcode::v_lshlrev_b32 && program.chip_class >= ChipClass::Gfx9 {
        combine_three_valu_op(program, ctx, instr, loc, Opcode::v_add_u32, Opcode::v_add_lshl_u32, [1, 2, 0], 2);
    } else if matches!(instr.opcode, Opcode::s_add_u32 | Opcode::s_add_i32)
        && program.chip_class >= ChipClass::Gfx9
    {
        combine_salu_lshl_add(program, ctx, instr);
    } else if instr.opcode == Opcode::s_not_b32 {
        combine_salu_not_bitwise(program, ctx, instr);
    } else if instr.opcode == Opcode::s_not_b64 {
        if combine_inverse_comparison(program, ctx, instr) {
        } else {
            combine_salu_not_bitwise(program, ctx, instr);
        }
    } else if matches!(
        instr.opcode,
        Opcode::s_and_b32 | Opcode::s_or_b32 | Opcode::s_and_b64 | Opcode::s_or_b64
    ) {
        if combine_ordering_test(program, ctx, instr) {
        } else if combine_comparison_ordering(program, ctx, instr) {
        } else if combine_constant_comparison_ordering(program, ctx, instr) {
        } else {
            combine_salu_n2(program, ctx, instr);
        }
    } else if let Some(mm) = get_minmax_info(instr.opcode) {
        if !mm.some_gfx9_only || program.chip_class >= ChipClass::Gfx9 {
            let three = if instr.opcode == mm.min { mm.min3 } else { mm.max3 };
            if !combine_three_valu_op(program, ctx, instr, loc, instr.opcode, three, [0, 1, 2], 1 | 2) {
                combine_clamp(program, ctx, instr, loc, mm.min, mm.max, mm.med3);
            }
        }
    }
}

fn select_instruction(ctx: &mut OptCtx, slot: &mut Option<Instruction>) {
    const THRESHOLD: u16 = 4;
    let instr = slot.as_mut().unwrap();

    // Dead code elimination: remove instructions if all their defined
    // temporaries are unused.
    let is_used = instr.definitions.is_empty()
        || instr
            .definitions
            .iter()
            .any(|def| !def.is_temp() || ctx.uses[def.temp_id() as usize] > 0)
        || instr.is_branch();
    if !is_used {
        *slot = None;
        return;
    }

    // Convert split_vector into extract_vector if only one definition is
    // ever used.
    if instr.opcode == Opcode::p_split_vector {
        let mut num_used = 0;
        let mut idx = 0;
        for (i, def) in instr.definitions.iter().enumerate() {
            if ctx.uses[def.temp_id() as usize] > 0 {
                num_used += 1;
                idx = i;
            }
        }
        if num_used == 1 {
            let mut extract = Instruction::new(Opcode::p_extract_vector, Format::PSEUDO, 2, 1);
            extract.operands[0] = instr.operands[0];
            extract.operands[1] = Operand::c32(idx as u32);
            extract.definitions[0] = instr.definitions[idx];
            *instr = extract;
        }
    }

    // Re-check mad instructions.
    if instr.opcode == Opcode::v_mad_f32
        && ctx.info[instr.definitions[0].temp_id() as usize].is_mad()
    {
        let mad_idx = ctx.info[instr.definitions[0].temp_id() as usize].val as usize;
        // First, profitability: if the multiply result survived for other
        // reasons, revert to the original add.
        if ctx.uses[ctx.mad_infos[mad_idx].mul_temp_id as usize] > 0 {
            ctx.uses[ctx.mad_infos[mad_idx].mul_temp_id as usize] += 1;
            std::mem::swap(instr, &mut ctx.mad_infos[mad_idx].add_instr);
        } else if !ctx.mad_infos[mad_idx].needs_vop3 {
            // Second, check possible literals.
            let mut literal_idx = 0u32;
            let mut literal_uses = u16::MAX;
            for (i, op) in instr.operands.iter().enumerate() {
                if !op.is_temp() {
                    continue;
                }
                // If one operand is an sgpr, no literal fits elsewhere.
                if op.get_temp().ty() == RegType::Sgpr {
                    if ctx.info[op.temp_id() as usize].is_literal() {
                        literal_uses = ctx.uses[op.temp_id() as usize];
                        literal_idx = i as u32;
                    } else {
                        literal_uses = u16::MAX;
                    }
                    break;
                } else if ctx.info[op.temp_id() as usize].is_literal()
                    && ctx.uses[op.temp_id() as usize] < literal_uses
                {
                    literal_uses = ctx.uses[op.temp_id() as usize];
                    literal_idx = i as u32;
                }
            }
            if literal_uses < THRESHOLD {
                ctx.uses[instr.operands[literal_idx as usize].temp_id() as usize] -= 1;
                ctx.mad_infos[mad_idx].check_literal = true;
                ctx.mad_infos[mad_idx].literal_idx = literal_idx;
            }
        }
        return;
    }

    // Mark literals for later application; at most one small literal per
    // instruction, preferring the operand position that can encode it.
    if instr.is_salu() {
        let mut literal_idx = 0usize;
        let mut literal_uses = u16::MAX;
        let mut has_literal = false;
        for (i, op) in instr.operands.iter().enumerate() {
            if op.is_literal() {
                has_literal = true;
                break;
            }
            if !op.is_temp() {
                continue;
            }
            if ctx.info[op.temp_id() as usize].is_literal()
                && ctx.uses[op.temp_id() as usize] < literal_uses
            {
                literal_uses = ctx.uses[op.temp_id() as usize];
                literal_idx = i;
            }
        }
        if !has_literal && literal_uses < THRESHOLD {
            let id = instr.operands[literal_idx].temp_id() as usize;
            ctx.uses[id] -= 1;
            if ctx.uses[id] == 0 {
                instr.operands[literal_idx] = Operand::c32(ctx.info[id].val);
            }
        }
    } else if instr.is_valu()
        && valu_can_accept_literal(instr, 0)
        && instr.operands[0].is_temp()
        && ctx.info[instr.operands[0].temp_id() as usize].is_literal()
        && ctx.uses[instr.operands[0].temp_id() as usize] < THRESHOLD
    {
        let id = instr.operands[0].temp_id() as usize;
        ctx.uses[id] -= 1;
        if ctx.uses[id] == 0 {
            instr.operands[0] = Operand::c32(ctx.info[id].val);
        }
    }
}

fn apply_literals(ctx: &mut OptCtx, instr: &mut Instruction) {
    if instr.is_salu() {
        // Apply literals on SALU.
        for op in instr.operands.iter_mut() {
            if !op.is_temp() {
                if op.is_literal() {
                    break;
                }
                continue;
            }
            let id = op.temp_id() as usize;
            if ctx.info[id].is_literal() && ctx.uses[id] == 0 {
                *op = Operand::c32(ctx.info[id].val);
            }
        }
    } else if instr.is_valu()
        && !instr.is_vop3()
        && instr.operands[0].is_temp()
        && ctx.info[instr.operands[0].temp_id() as usize].is_literal()
        && ctx.uses[instr.operands[0].temp_id() as usize] == 0
    {
        // Apply literals on VALU.
        instr.operands[0] = Operand::c32(ctx.info[instr.operands[0].temp_id() as usize].val);
    } else if instr.opcode == Opcode::v_mad_f32
        && ctx.info[instr.definitions[0].temp_id() as usize].is_mad()
    {
        // Apply literals on MAD.
        let mad_idx = ctx.info[instr.definitions[0].temp_id() as usize].val as usize;
        let info = &ctx.mad_infos[mad_idx];
        if info.check_literal
            && ctx.uses[instr.operands[info.literal_idx as usize].temp_id() as usize] == 0
        {
            let literal_idx = info.literal_idx as usize;
            let lit = ctx.info[instr.operands[literal_idx].temp_id() as usize].val;
            let mut new_mad = if literal_idx == 2 {
                // Add literal -> madak.
                let mut m = Instruction::new(Opcode::v_madak_f32, Format::VOP2, 3, 1);
                m.operands[0] = instr.operands[0];
                m.operands[1] = instr.operands[1];
                m
            } else {
                // Mul literal -> madmk.
                let mut m = Instruction::new(Opcode::v_madmk_f32, Format::VOP2, 3, 1);
                m.operands[0] = instr.operands[1 - literal_idx];
                m.operands[1] = instr.operands[2];
                m
            };
            new_mad.operands[2] = Operand::c32(lit);
            new_mad.definitions[0] = instr.definitions[0];
            *instr = new_mad;
        }
    }
}

/// Run the four optimizer phases over the whole program.
pub fn optimize(program: &mut Program) {
    let mut ctx = OptCtx {
        info: vec![SsaInfo::default(); program.peek_allocation_id() as usize],
        uses: Vec::new(),
        mad_infos: Vec::new(),
    };

    let placeholder = || Instruction::new(Opcode::p_logical_start, Format::PSEUDO, 0, 0);

    // 1. Forward pass to label all ssa-defs.
    for b in 0..program.blocks.len() {
        for j in 0..program.blocks[b].instructions.len() {
            let mut instr =
                std::mem::replace(&mut program.blocks[b].instructions[j], placeholder());
            let loc = InstrLoc { block: b as u32, index: j as u32 };
            label_instruction(program, &mut ctx, loc, &mut instr);
            program.blocks[b].instructions[j] = instr;
        }
    }

    ctx.uses = dead_code_analysis(program);

    // 2. Combine v_mad, omod, clamp and propagate sgprs on VALU instructions.
    for b in 0..program.blocks.len() {
        for j in 0..program.blocks[b].instructions.len() {
            let mut instr =
                std::mem::replace(&mut program.blocks[b].instructions[j], placeholder());
            let loc = InstrLoc { block: b as u32, index: j as u32 };
            combine_instruction(program, &mut ctx, loc, &mut instr);
            program.blocks[b].instructions[j] = instr;
        }
    }

    // 3. Backward pass to select instructions (includes DCE).
    let mut staged: Vec<Vec<Option<Instruction>>> = program
        .blocks
        .iter_mut()
        .map(|block| block.instructions.drain(..).map(Some).collect())
        .collect();
    for block in staged.iter_mut().rev() {
        for slot in block.iter_mut().rev() {
            select_instruction(&mut ctx, slot);
        }
    }

    // 4. Add literals to instructions and drop dead ones from the sequence.
    for (block, slots) in program.blocks.iter_mut().zip(staged) {
        let mut instructions = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(mut instr) = slot {
                apply_literals(&mut ctx, &mut instr);
                instructions.push(instr);
            }
        }
        block.instructions = instructions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Stage};

    fn single_block_program() -> Program {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        let b = program.create_and_insert_block();
        program.blocks[b as usize].logical_idom = b as i32;
        program.blocks[b as usize].linear_idom = b as i32;
        program
    }

    fn store_use(bld: &mut Builder, t: Temp) {
        let mut store =
            Instruction::new(Opcode::buffer_store_dword, Format::MUBUF, 4, 0);
        store.operands[0] = Operand::undef(RegClass::V1);
        store.operands[1] = Operand::undef(RegClass::S4);
        store.operands[2] = Operand::undef(RegClass::S1);
        store.operands[3] = Operand::temp(t);
        bld.insert(store);
    }

    #[test]
    fn mul_add_combines_to_mad() {
        let mut program = single_block_program();
        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);
        let c = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        let t2;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d1 = bld.def(RegClass::V1);
            let t1 = d1.get_temp();
            bld.vop2(Opcode::v_mul_f32, &[d1], &[Operand::temp(a), Operand::temp(b)]);
            let d2 = bld.def(RegClass::V1);
            t2 = d2.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d2], &[Operand::temp(t1), Operand::temp(c)]);
            store_use(&mut bld, t2);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        let mad = &instrs[0];
        assert_eq!(mad.opcode, Opcode::v_mad_f32);
        assert_eq!(mad.operands[0].get_temp(), a);
        assert_eq!(mad.operands[1].get_temp(), b);
        assert_eq!(mad.operands[2].get_temp(), c);
        assert_eq!(mad.definitions[0].get_temp(), t2);
    }

    #[test]
    fn mad_with_clamp_folds_med3() {
        let mut program = single_block_program();
        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);
        let c = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        let t3;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d1 = bld.def(RegClass::V1);
            let t1 = d1.get_temp();
            bld.vop2(Opcode::v_mul_f32, &[d1], &[Operand::temp(a), Operand::temp(b)]);
            let d2 = bld.def(RegClass::V1);
            let t2 = d2.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d2], &[Operand::temp(t1), Operand::temp(c)]);
            let d3 = bld.def(RegClass::V1);
            t3 = d3.get_temp();
            bld.vop3(
                Opcode::v_med3_f32,
                &[d3],
                &[Operand::c32(0), Operand::c32(0x3f80_0000), Operand::temp(t2)],
            );
            store_use(&mut bld, t3);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        let mad = &instrs[0];
        assert_eq!(mad.opcode, Opcode::v_mad_f32);
        assert_eq!(mad.definitions[0].get_temp(), t3);
        match &mad.data {
            InstrData::Vop3 { clamp, .. } => assert!(*clamp),
            _ => panic!("mad must be VOP3"),
        }
    }

    #[test]
    fn neg_label_turns_add_into_sub() {
        let mut program = single_block_program();
        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        let result;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let dneg = bld.def(RegClass::V1);
            let neg = dneg.get_temp();
            bld.vop2(
                Opcode::v_xor_b32,
                &[dneg],
                &[Operand::c32(0x8000_0000), Operand::temp(a)],
            );
            let d = bld.def(RegClass::V1);
            result = d.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d], &[Operand::temp(neg), Operand::temp(b)]);
            store_use(&mut bld, result);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        let sub = &instrs[0];
        assert_eq!(sub.opcode, Opcode::v_subrev_f32);
        assert_eq!(sub.operands[0].get_temp(), a);
        assert_eq!(sub.operands[1].get_temp(), b);
    }

    #[test]
    fn not_and_becomes_nand() {
        let mut program = single_block_program();
        let a = program.alloc_tmp(RegClass::S2);
        let b = program.alloc_tmp(RegClass::S2);
        let mut instrs = Vec::new();
        let result;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d1 = bld.def(RegClass::S2);
            let scc1 = bld.def_fixed(RegClass::S1, crate::ir::SCC);
            let t1 = d1.get_temp();
            bld.sop2(Opcode::s_and_b64, &[d1, scc1], &[Operand::temp(a), Operand::temp(b)]);
            let d2 = bld.def(RegClass::S2);
            let scc2 = bld.def_fixed(RegClass::S1, crate::ir::SCC);
            result = d2.get_temp();
            bld.sop1(Opcode::s_not_b64, &[d2, scc2], &[Operand::temp(t1)]);
            store_use(&mut bld, result);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, Opcode::s_nand_b64);
        assert_eq!(instrs[0].definitions[0].get_temp(), result);
    }

    #[test]
    fn min_max_nest_becomes_med3() {
        let mut program = single_block_program();
        let a = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        let result;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d1 = bld.def(RegClass::V1);
            let t1 = d1.get_temp();
            bld.vop2(Opcode::v_max_f32, &[d1], &[Operand::c32(0), Operand::temp(a)]);
            let d2 = bld.def(RegClass::V1);
            result = d2.get_temp();
            bld.vop2(
                Opcode::v_min_f32,
                &[d2],
                &[Operand::c32(0x3f80_0000), Operand::temp(t1)],
            );
            store_use(&mut bld, result);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, Opcode::v_med3_f32);
    }

    #[test]
    fn literal_mad_becomes_madak() {
        let mut program = single_block_program();
        let a = program.alloc_tmp(RegClass::V1);
        let b = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        let result;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let dlit = bld.def(RegClass::V1);
            let lit = dlit.get_temp();
            bld.vop1(Opcode::v_mov_b32, &[dlit], &[Operand::c32(0x4234_5678)]);
            let d1 = bld.def(RegClass::V1);
            let t1 = d1.get_temp();
            bld.vop2(Opcode::v_mul_f32, &[d1], &[Operand::temp(a), Operand::temp(b)]);
            let d2 = bld.def(RegClass::V1);
            result = d2.get_temp();
            bld.vop2(Opcode::v_add_f32, &[d2], &[Operand::temp(t1), Operand::temp(lit)]);
            store_use(&mut bld, result);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        let madak = &instrs[0];
        assert_eq!(madak.opcode, Opcode::v_madak_f32);
        assert!(madak.operands[2].is_literal());
        assert_eq!(madak.operands[2].constant_value(), 0x4234_5678);
    }

    #[test]
    fn dead_split_vector_becomes_extract() {
        let mut program = single_block_program();
        let v = program.alloc_tmp(RegClass::V2);
        let mut instrs = Vec::new();
        let used;
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d0 = bld.def(RegClass::V1);
            let d1 = bld.def(RegClass::V1);
            used = d1.get_temp();
            bld.pseudo(Opcode::p_split_vector, &[d0, d1], &[Operand::temp(v)]);
            store_use(&mut bld, used);
        }
        program.blocks[0].instructions = instrs;

        optimize(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs[0].opcode, Opcode::p_extract_vector);
        assert_eq!(instrs[0].operands[1].constant_value(), 1);
        assert_eq!(instrs[0].definitions[0].get_temp(), used);
    }
}
