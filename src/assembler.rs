//! Binary machine code emission.
//!
//! One forward walk over the blocks produces the 32-bit word stream: per
//! instruction the chip-specific opcode index is selected from the opcode
//! table and 1-3 words are emitted according to the format's bit layout,
//! with every reserved bit zero. Branches record their emission position and
//! blocks their starting offset; after the walk, exports are fixed up,
//! the GFX10 0x3F-offset erratum is worked around by inserting NOPs, branch
//! words receive their final relative offsets, GFX10+ code is padded for
//! instruction prefetch, and PC-relative constant addresses are patched to
//! point past the code into the appended constant data.

use crate::ir::{
    ChipClass, Format, InstrData, Instruction, Opcode, Program, Stage, EXEC, M0,
    SGPR_NULL,
};
use crate::{CodegenError, CodegenResult};

const S_NOP_WORD: u32 = 0xbf80_0000;
const S_CODE_END_WORD: u32 = 0xbf9f_0000;
const EXP_POS0_TARGET: u32 = 12;
const EXP_NULL_TARGET: u32 = 9;

struct AsmContext {
    chip: ChipClass,
    /// (word position, target block) of every emitted branch.
    branches: Vec<(usize, u32)>,
    /// Word positions reserved for PC-relative constant addresses.
    constaddrs: Vec<usize>,
    subvector_begin_pos: Option<usize>,
}

impl AsmContext {
    fn new(program: &Program) -> Self {
        Self {
            chip: program.chip_class,
            branches: Vec::new(),
            constaddrs: Vec::new(),
            subvector_begin_pos: None,
        }
    }

    fn opcode(&self, op: Opcode) -> CodegenResult<u32> {
        let info = op.info();
        let index = if self.chip <= ChipClass::Gfx7 {
            info.gfx7
        } else if self.chip <= ChipClass::Gfx9 {
            info.gfx9
        } else {
            info.gfx10
        };
        if index < 0 {
            return Err(CodegenError::UnsupportedOpcode(info.mnemonic));
        }
        Ok(index as u32)
    }
}

fn def_reg(instr: &Instruction, idx: usize) -> u32 {
    instr.definitions.get(idx).map(|d| d.phys_reg().reg()).unwrap_or(0)
}

fn op_reg(instr: &Instruction, idx: usize) -> u32 {
    instr.operands.get(idx).map(|o| o.phys_reg().reg()).unwrap_or(0)
}

fn emit_instruction(
    ctx: &mut AsmContext,
    out: &mut Vec<u32>,
    instr: &Instruction,
) -> CodegenResult<()> {
    let instr_offset = out.len() * 4;

    // Expand the remaining constant-address pseudo in place.
    if instr.opcode == Opcode::p_constaddr {
        let dest = def_reg(instr, 0);
        let offset = instr.operands[0].constant_value();

        // s_getpc_b64 dest[0:1]
        let mut encoding: u32 = 0b1_0111_1101 << 23;
        encoding |= dest << 16;
        encoding |= ctx.opcode(Opcode::s_getpc_b64)? << 8;
        out.push(encoding);

        // s_add_u32 dest[0], dest[0], <literal>
        let mut encoding: u32 = 0b10 << 30;
        encoding |= ctx.opcode(Opcode::s_add_u32)? << 23;
        encoding |= dest << 16;
        encoding |= dest;
        encoding |= 255 << 8;
        out.push(encoding);
        ctx.constaddrs.push(out.len());
        out.push((offset as i64 - (instr_offset as i64 + 4)) as u32);

        // s_addc_u32 dest[1], dest[1], 0
        let mut encoding: u32 = 0b10 << 30;
        encoding |= ctx.opcode(Opcode::s_addc_u32)? << 23;
        encoding |= (dest + 1) << 16;
        encoding |= dest + 1;
        encoding |= 128 << 8;
        out.push(encoding);
        return Ok(());
    }

    let mut opcode = ctx.opcode(instr.opcode)?;

    match instr.format.base() {
        Format::SOP2 if !instr.is_vop3() => {
            let mut encoding: u32 = 0b10 << 30;
            encoding |= opcode << 23;
            encoding |= def_reg(instr, 0) << 16;
            encoding |= if instr.operands.len() >= 2 { op_reg(instr, 1) << 8 } else { 0 };
            encoding |= op_reg(instr, 0);
            out.push(encoding);
        }
        Format::SOPK => {
            let imm = instr.salu_imm();
            let mut imm = imm;
            if instr.opcode == Opcode::s_subvector_loop_begin {
                debug_assert!(ctx.chip >= ChipClass::Gfx10);
                debug_assert!(ctx.subvector_begin_pos.is_none());
                ctx.subvector_begin_pos = Some(out.len());
            } else if instr.opcode == Opcode::s_subvector_loop_end {
                let begin = ctx
                    .subvector_begin_pos
                    .take()
                    .ok_or(CodegenError::Unreachable("unmatched subvector loop end"))?;
                // Adjust the begin instruction to the address after the end
                // and this instruction back to the address of the begin.
                out[begin] |= (out.len() - begin) as u32;
                imm = (begin as i64 - out.len() as i64) as u16;
            }

            let mut encoding: u32 = 0b1011 << 28;
            encoding |= opcode << 23;
            let reg = if !instr.definitions.is_empty()
                && instr.definitions[0].phys_reg() != crate::ir::SCC
            {
                def_reg(instr, 0)
            } else if !instr.operands.is_empty() && op_reg(instr, 0) <= 127 {
                op_reg(instr, 0)
            } else {
                0
            };
            encoding |= reg << 16;
            encoding |= imm as u32;
            out.push(encoding);
        }
        Format::SOP1 => {
            let mut encoding: u32 = 0b1_0111_1101 << 23;
            encoding |= def_reg(instr, 0) << 16;
            encoding |= opcode << 8;
            encoding |= op_reg(instr, 0);
            out.push(encoding);
        }
        Format::SOPC => {
            let mut encoding: u32 = 0b1_0111_1110 << 23;
            encoding |= opcode << 16;
            encoding |= if instr.operands.len() == 2 { op_reg(instr, 1) << 8 } else { 0 };
            encoding |= op_reg(instr, 0);
            out.push(encoding);
        }
        Format::SOPP => {
            let (imm, block) = match &instr.data {
                InstrData::Sopp { imm, block } => (*imm, *block),
                _ => (0, None),
            };
            let mut encoding: u32 = 0b1_0111_1111 << 23;
            encoding |= opcode << 16;
            encoding |= imm as u32;
            if let Some(block) = block {
                ctx.branches.push((out.len(), block));
            }
            out.push(encoding);
        }
        Format::SMEM => {
            let (glc, dlc, nv) = match &instr.data {
                InstrData::Smem { glc, dlc, nv, .. } => (*glc, *dlc, *nv),
                _ => (false, false, false),
            };
            let soe =
                instr.operands.len() >= if !instr.definitions.is_empty() { 3 } else { 4 };
            let is_load = !instr.definitions.is_empty();

            if ctx.chip <= ChipClass::Gfx7 {
                let mut encoding: u32 = 0b11000 << 27;
                encoding |= opcode << 22;
                encoding |= def_reg(instr, 0) << 15;
                encoding |= (op_reg(instr, 0) >> 1) << 9;
                let op1 = &instr.operands[1];
                if !op1.is_constant() || op1.constant_value() >= 1024 {
                    if !op1.is_constant() {
                        encoding |= op_reg(instr, 1);
                    }
                } else {
                    encoding |= op1.constant_value() >> 2;
                    encoding |= 1 << 8;
                }
                out.push(encoding);
                // SMRD takes a trailing literal for large offsets.
                if op1.is_constant() && op1.constant_value() >= 1024 {
                    out.push(op1.constant_value() >> 2);
                }
                return Ok(());
            }

            let mut encoding: u32;
            if ctx.chip <= ChipClass::Gfx9 {
                encoding = 0b110000 << 26;
                debug_assert!(!dlc);
                encoding |= if nv { 1 << 15 } else { 0 };
            } else {
                encoding = 0b111101 << 26;
                debug_assert!(!nv);
                encoding |= if dlc { 1 << 14 } else { 0 };
            }

            encoding |= opcode << 18;
            encoding |= if glc { 1 << 16 } else { 0 };

            if ctx.chip <= ChipClass::Gfx9 && instr.operands.len() >= 2 {
                encoding |= if instr.operands[1].is_constant() { 1 << 17 } else { 0 };
            }
            if ctx.chip == ChipClass::Gfx9 {
                encoding |= if soe { 1 << 14 } else { 0 };
            }

            if is_load || instr.operands.len() >= 3 {
                let sdata = if is_load { def_reg(instr, 0) } else { op_reg(instr, 2) };
                encoding |= sdata << 6;
            }
            if !instr.operands.is_empty() {
                encoding |= op_reg(instr, 0) >> 1;
            }
            out.push(encoding);

            let mut offset: u32 = 0;
            let mut soffset: u32 =
                if ctx.chip >= ChipClass::Gfx10 { SGPR_NULL.reg() } else { 0 };
            if instr.operands.len() >= 2 {
                let op1 = &instr.operands[1];
                if ctx.chip <= ChipClass::Gfx9 {
                    offset =
                        if op1.is_constant() { op1.constant_value() } else { op1.phys_reg().reg() };
                } else if op1.is_constant() {
                    // GFX10 only supports constants in OFFSET.
                    offset = op1.constant_value();
                } else {
                    soffset = op1.phys_reg().reg();
                    debug_assert!(!soe);
                }
                if soe {
                    let last = instr.operands.last().unwrap();
                    debug_assert!(ctx.chip >= ChipClass::Gfx9);
                    debug_assert!(!last.is_constant());
                    soffset = last.phys_reg().reg();
                }
            }
            let mut word: u32 = offset;
            word |= soffset << 25;
            out.push(word);
        }
        Format::VINTRP if !instr.is_vop3() => {
            let (attribute, component) = match &instr.data {
                InstrData::Vintrp { attribute, component } => (*attribute, *component),
                _ => (0, 0),
            };
            let mut encoding: u32 = if matches!(ctx.chip, ChipClass::Gfx8 | ChipClass::Gfx9) {
                0b110101 << 26
            } else {
                0b110010 << 26
            };
            encoding |= (def_reg(instr, 0) & 0xFF) << 18;
            encoding |= opcode << 16;
            encoding |= (attribute as u32) << 10;
            encoding |= (component as u32) << 8;
            if instr.opcode == Opcode::v_interp_mov_f32 {
                encoding |= 0x3 & instr.operands[0].constant_value();
            } else {
                encoding |= op_reg(instr, 0) & 0xFF;
            }
            out.push(encoding);
        }
        Format::DS => {
            let (offset0, offset1, gds) = match &instr.data {
                InstrData::Ds { offset0, offset1, gds } => (*offset0, *offset1, *gds),
                _ => (0, 0, false),
            };
            let mut encoding: u32 = 0b110110 << 26;
            if matches!(ctx.chip, ChipClass::Gfx8 | ChipClass::Gfx9) {
                encoding |= opcode << 17;
                encoding |= (gds as u32) << 16;
            } else {
                encoding |= opcode << 18;
                encoding |= (gds as u32) << 17;
            }
            encoding |= (offset1 as u32) << 8;
            encoding |= offset0 as u32;
            out.push(encoding);

            let mut encoding: u32 = 0;
            encoding |= (def_reg(instr, 0) & 0xFF) << 24;
            let reg = if instr.operands.len() >= 3 && instr.operands[2].phys_reg() != M0 {
                op_reg(instr, 2)
            } else {
                0
            };
            encoding |= (reg & 0xFF) << 16;
            let reg = if instr.operands.len() >= 2 && instr.operands[1].phys_reg() != M0 {
                op_reg(instr, 1)
            } else {
                0
            };
            encoding |= (reg & 0xFF) << 8;
            encoding |= op_reg(instr, 0) & 0xFF;
            out.push(encoding);
        }
        Format::MUBUF => {
            let (offset, offen, idxen, glc, dlc, slc, tfe, lds) = match &instr.data {
                InstrData::Mubuf { offset, offen, idxen, glc, dlc, slc, tfe, lds, .. } => {
                    (*offset, *offen, *idxen, *glc, *dlc, *slc, *tfe, *lds)
                }
                _ => (0, false, false, false, false, false, false, false),
            };
            let mut encoding: u32 = 0b111000 << 26;
            encoding |= opcode << 18;
            encoding |= (lds as u32) << 16;
            encoding |= (glc as u32) << 14;
            encoding |= (idxen as u32) << 13;
            encoding |= (offen as u32) << 12;
            if matches!(ctx.chip, ChipClass::Gfx8 | ChipClass::Gfx9) {
                debug_assert!(!dlc);
                encoding |= (slc as u32) << 17;
            } else if ctx.chip >= ChipClass::Gfx10 {
                encoding |= (dlc as u32) << 15;
            }
            encoding |= 0x0FFF & offset as u32;
            out.push(encoding);

            let mut encoding: u32 = 0;
            if ctx.chip >= ChipClass::Gfx10 {
                encoding |= (slc as u32) << 22;
            }
            encoding |= op_reg(instr, 2) << 24;
            encoding |= (tfe as u32) << 23;
            encoding |= (op_reg(instr, 1) >> 2) << 16;
            let reg =
                if instr.operands.len() > 3 { op_reg(instr, 3) } else { def_reg(instr, 0) };
            encoding |= (reg & 0xFF) << 8;
            encoding |= op_reg(instr, 0) & 0xFF;
            out.push(encoding);
        }
        Format::MTBUF => {
            let (dfmt, nfmt, offset, offen, idxen, glc, dlc, slc, tfe) = match &instr.data {
                InstrData::Mtbuf { dfmt, nfmt, offset, offen, idxen, glc, dlc, slc, tfe, .. } => {
                    (*dfmt, *nfmt, *offset, *offen, *idxen, *glc, *dlc, *slc, *tfe)
                }
                _ => (0, 0, 0, false, false, false, false, false, false),
            };
            let img_format = (dfmt as u32) | ((nfmt as u32) << 4);
            debug_assert!(img_format <= 0x7F);
            debug_assert!(!dlc || ctx.chip >= ChipClass::Gfx10);
            let mut encoding: u32 = 0b111010 << 26;
            // The DLC bit replaces one opcode bit on GFX10.
            encoding |= (dlc as u32) << 15;
            encoding |= (glc as u32) << 14;
            encoding |= (idxen as u32) << 13;
            encoding |= (offen as u32) << 12;
            encoding |= 0x0FFF & offset as u32;
            encoding |= img_format << 19;
            if matches!(ctx.chip, ChipClass::Gfx8 | ChipClass::Gfx9) {
                encoding |= opcode << 15;
            } else {
                encoding |= (opcode & 0x07) << 16;
            }
            out.push(encoding);

            let mut encoding: u32 = 0;
            encoding |= op_reg(instr, 2) << 24;
            encoding |= (tfe as u32) << 23;
            encoding |= (slc as u32) << 22;
            encoding |= (op_reg(instr, 1) >> 2) << 16;
            let reg =
                if instr.operands.len() > 3 { op_reg(instr, 3) } else { def_reg(instr, 0) };
            encoding |= (reg & 0xFF) << 8;
            encoding |= op_reg(instr, 0) & 0xFF;
            if ctx.chip >= ChipClass::Gfx10 {
                encoding |= ((opcode & 0x08) >> 3) << 21;
            }
            out.push(encoding);
        }
        Format::MIMG => {
            let data = match &instr.data {
                InstrData::Mimg {
                    dmask, dim, unrm, glc, dlc, slc, tfe, lwe, da, r128, a16, d16, ..
                } => (*dmask, *dim, *unrm, *glc, *dlc, *slc, *tfe, *lwe, *da, *r128, *a16, *d16),
                _ => (0, 0, false, false, false, false, false, false, false, false, false, false),
            };
            let (dmask, dim, unrm, glc, dlc, slc, tfe, lwe, da, r128, a16, d16) = data;
            let mut encoding: u32 = 0b111100 << 26;
            encoding |= (slc as u32) << 25;
            encoding |= opcode << 18;
            encoding |= (lwe as u32) << 17;
            encoding |= (tfe as u32) << 16;
            encoding |= (glc as u32) << 13;
            encoding |= (unrm as u32) << 12;
            if ctx.chip <= ChipClass::Gfx9 {
                debug_assert!(!dlc);
                debug_assert!(!r128);
                encoding |= (a16 as u32) << 15;
                encoding |= (da as u32) << 14;
            } else {
                encoding |= (r128 as u32) << 15;
                encoding |= (dim as u32) << 3;
                encoding |= (dlc as u32) << 7;
            }
            encoding |= (0xF & dmask as u32) << 8;
            out.push(encoding);

            let mut encoding: u32 = op_reg(instr, 0) & 0xFF;
            if !instr.definitions.is_empty() {
                encoding |= (def_reg(instr, 0) & 0xFF) << 8;
            } else if instr.operands.len() == 4 {
                encoding |= (op_reg(instr, 3) & 0xFF) << 8;
            }
            encoding |= (0x1F & (op_reg(instr, 1) >> 2)) << 16;
            if instr.operands.len() > 2 {
                encoding |= (0x1F & (op_reg(instr, 2) >> 2)) << 21;
            }
            debug_assert!(!d16 || ctx.chip >= ChipClass::Gfx9);
            encoding |= (d16 as u32) << 15;
            if ctx.chip >= ChipClass::Gfx10 {
                encoding |= (a16 as u32) << 14;
            }
            out.push(encoding);
        }
        Format::FLAT | Format::SCRATCH | Format::GLOBAL => {
            let (offset, lds, glc, dlc, slc, nv) = match &instr.data {
                InstrData::FlatLike { offset, lds, glc, dlc, slc, nv, .. } => {
                    (*offset, *lds, *glc, *dlc, *slc, *nv)
                }
                _ => (0, false, false, false, false, false),
            };
            let mut encoding: u32 = 0b110111 << 26;
            encoding |= opcode << 18;
            if ctx.chip <= ChipClass::Gfx9 {
                debug_assert!(offset <= 0x1fff);
                encoding |= offset as u32 & 0x1fff;
            } else if instr.format.base() == Format::FLAT {
                // The GFX10 immediate offset field is ignored by the
                // hardware for FLAT (FlatSegmentOffsetBug).
                debug_assert_eq!(offset, 0);
            } else {
                debug_assert!(offset <= 0xfff);
                encoding |= offset as u32 & 0xfff;
            }
            if instr.format.base() == Format::SCRATCH {
                encoding |= 1 << 14;
            } else if instr.format.base() == Format::GLOBAL {
                encoding |= 2 << 14;
            }
            encoding |= (lds as u32) << 13;
            encoding |= (glc as u32) << 16;
            encoding |= (slc as u32) << 17;
            if ctx.chip >= ChipClass::Gfx10 {
                debug_assert!(!nv);
                encoding |= (dlc as u32) << 12;
            } else {
                debug_assert!(!dlc);
            }
            out.push(encoding);

            let mut encoding: u32 = op_reg(instr, 0) & 0xFF;
            if !instr.definitions.is_empty() {
                encoding |= (def_reg(instr, 0) & 0xFF) << 24;
            }
            if instr.operands.len() >= 3 {
                encoding |= (op_reg(instr, 2) & 0xFF) << 8;
            }
            if !instr.operands[1].is_undefined() {
                debug_assert!(instr.format.base() != Format::FLAT);
                encoding |= op_reg(instr, 1) << 16;
            } else if instr.format.base() != Format::FLAT || ctx.chip >= ChipClass::Gfx10 {
                if ctx.chip <= ChipClass::Gfx9 {
                    encoding |= 0x7F << 16;
                } else {
                    encoding |= SGPR_NULL.reg() << 16;
                }
            }
            encoding |= (nv as u32) << 23;
            out.push(encoding);
        }
        Format::EXP => {
            let (enabled_mask, dest, compressed, done, valid_mask) = match &instr.data {
                InstrData::Exp { enabled_mask, dest, compressed, done, valid_mask } => {
                    (*enabled_mask, *dest, *compressed, *done, *valid_mask)
                }
                _ => (0, 0, false, false, false),
            };
            let mut encoding: u32 = if matches!(ctx.chip, ChipClass::Gfx8 | ChipClass::Gfx9) {
                0b110001 << 26
            } else {
                0b111110 << 26
            };
            encoding |= (valid_mask as u32) << 12;
            encoding |= (done as u32) << 11;
            encoding |= (compressed as u32) << 10;
            encoding |= (dest as u32) << 4;
            encoding |= enabled_mask as u32;
            out.push(encoding);

            let mut encoding: u32 = op_reg(instr, 0) & 0xFF;
            encoding |= (op_reg(instr, 1) & 0xFF) << 8;
            encoding |= (op_reg(instr, 2) & 0xFF) << 16;
            encoding |= (op_reg(instr, 3) & 0xFF) << 24;
            out.push(encoding);
        }
        Format::PSEUDO | Format::PSEUDO_BARRIER | Format::PSEUDO_BRANCH
        | Format::PSEUDO_REDUCTION => {
            return Err(CodegenError::Unreachable(
                "pseudo instructions must be lowered before assembly",
            ));
        }
        _ if instr.is_dpp() => {
            // Emit the instruction with the DPP source replaced by the
            // DPP-operand marker, then the DPP control word.
            let mut base = instr.clone();
            base.format = base.format.without_dpp();
            let (dpp_ctrl, row_mask, bank_mask, bound_ctrl, abs, neg) = match &instr.data {
                InstrData::Dpp { dpp_ctrl, row_mask, bank_mask, bound_ctrl, abs, neg } => {
                    (*dpp_ctrl, *row_mask, *bank_mask, *bound_ctrl, *abs, *neg)
                }
                _ => unreachable!(),
            };
            base.data = InstrData::default_for(base.format);
            let dpp_op = base.operands[0];
            base.operands[0] = crate::ir::Operand::fixed(crate::ir::PhysReg(250), crate::ir::RegClass::V1);
            emit_instruction(ctx, out, &base)?;

            let mut encoding: u32 = (0xF & row_mask as u32) << 28;
            encoding |= (0xF & bank_mask as u32) << 24;
            encoding |= (abs[1] as u32) << 23;
            encoding |= (neg[1] as u32) << 22;
            encoding |= (abs[0] as u32) << 21;
            encoding |= (neg[0] as u32) << 20;
            encoding |= (bound_ctrl as u32) << 19;
            encoding |= (dpp_ctrl as u32) << 8;
            encoding |= dpp_op.phys_reg().reg() & 0xFF;
            out.push(encoding);
            return Ok(());
        }
        _ if instr.is_vop3() => {
            // Bias the opcode into the VOP3 space according to the base
            // encoding the opcode comes from.
            let base = instr.format.base();
            if base == Format::VOP2 {
                opcode += 0x100;
            } else if base == Format::VOP1 {
                opcode += if matches!(ctx.chip, ChipClass::Gfx8 | ChipClass::Gfx9) {
                    0x140
                } else {
                    0x180
                };
            } else if base == Format::VINTRP {
                opcode += 0x270;
            }

            let (abs, neg, opsel, clamp, omod) = match &instr.data {
                InstrData::Vop3 { abs, neg, opsel, clamp, omod } => {
                    (*abs, *neg, *opsel, *clamp, *omod)
                }
                _ => ([false; 3], [false; 3], [false; 4], false, 0),
            };

            let mut encoding: u32 = if ctx.chip <= ChipClass::Gfx9 {
                0b110100 << 26
            } else {
                0b110101 << 26
            };
            if ctx.chip <= ChipClass::Gfx7 {
                encoding |= opcode << 17;
                encoding |= (clamp as u32) << 11;
            } else {
                encoding |= opcode << 16;
                encoding |= (clamp as u32) << 15;
            }
            for (i, &a) in abs.iter().enumerate() {
                encoding |= (a as u32) << (8 + i);
            }
            for (i, &o) in opsel.iter().enumerate() {
                encoding |= (o as u32) << (11 + i);
            }
            if instr.definitions.len() == 2 {
                encoding |= def_reg(instr, 1) << 8;
            }
            encoding |= def_reg(instr, 0) & 0xFF;
            out.push(encoding);

            let mut encoding: u32 = 0;
            for i in 0..instr.operands.len() {
                encoding |= op_reg(instr, i) << (i * 9);
            }
            encoding |= (omod as u32) << 27;
            for (i, &n) in neg.iter().enumerate() {
                encoding |= (n as u32) << (29 + i);
            }
            out.push(encoding);
        }
        Format::VOP2 => {
            let mut encoding: u32 = 0;
            encoding |= opcode << 25;
            encoding |= (def_reg(instr, 0) & 0xFF) << 17;
            encoding |= (op_reg(instr, 1) & 0xFF) << 9;
            encoding |= op_reg(instr, 0);
            out.push(encoding);
        }
        Format::VOP1 => {
            let mut encoding: u32 = 0b0111111 << 25;
            encoding |= (def_reg(instr, 0) & 0xFF) << 17;
            encoding |= opcode << 9;
            encoding |= op_reg(instr, 0);
            out.push(encoding);
        }
        Format::VOPC => {
            let mut encoding: u32 = 0b0111110 << 25;
            encoding |= opcode << 17;
            encoding |= (op_reg(instr, 1) & 0xFF) << 9;
            encoding |= op_reg(instr, 0);
            out.push(encoding);
        }
        _ => {
            return Err(CodegenError::Unreachable("unimplemented instruction format"));
        }
    }

    // Append the literal dword, if any.
    for op in &instr.operands {
        if op.is_literal() {
            out.push(op.constant_value());
            break;
        }
    }
    Ok(())
}

fn emit_block(ctx: &mut AsmContext, out: &mut Vec<u32>, block: &crate::ir::Block) -> CodegenResult<()> {
    for instr in &block.instructions {
        emit_instruction(ctx, out, instr)?;
    }
    Ok(())
}

/// Mark the last relevant export of the program `done` (and `valid_mask` on
/// fragment stages); synthesize a null export when a mandatory one is
/// missing.
fn fix_exports(program: &mut Program) {
    let is_vs = program.stage.contains(Stage::HW_VS);
    let is_fs = program.stage.contains(Stage::HW_FS);
    for block in program.blocks.iter_mut().rev() {
        let mut end_block = false;
        let mut exported = false;
        let mut insert_at = None;
        for (i, instr) in block.instructions.iter_mut().enumerate().rev() {
            if instr.format.base() == Format::EXP && end_block {
                if let InstrData::Exp { dest, done, valid_mask, .. } = &mut instr.data {
                    if is_vs {
                        if (*dest as u32) >= EXP_POS0_TARGET && (*dest as u32) <= EXP_POS0_TARGET + 3
                        {
                            *done = true;
                            exported = true;
                            break;
                        }
                    } else {
                        *done = true;
                        *valid_mask = true;
                        exported = true;
                        break;
                    }
                }
            } else if !instr.definitions.is_empty() && instr.definitions[0].phys_reg() == EXEC {
                break;
            } else if instr.opcode == Opcode::s_endpgm {
                if end_block {
                    break;
                }
                end_block = true;
                insert_at = Some(i);
            }
        }
        if !end_block || exported {
            continue;
        }

        // No export was found; insert a null export right before s_endpgm.
        let mut exp = Instruction::new(Opcode::exp, Format::EXP, 4, 0);
        for op in exp.operands.iter_mut() {
            *op = crate::ir::Operand::undef(crate::ir::RegClass::V1);
        }
        exp.data = InstrData::Exp {
            enabled_mask: 0,
            dest: if is_fs { EXP_NULL_TARGET as u8 } else { EXP_POS0_TARGET as u8 },
            compressed: false,
            done: true,
            valid_mask: is_fs,
        };
        block.instructions.insert(insert_at.unwrap(), exp);
    }
}

/// Branches with an offset of 0x3F are buggy on GFX10; insert a NOP behind
/// each occurrence until none remains.
fn fix_branches_gfx10(
    program: &mut Program,
    ctx: &mut AsmContext,
    out: &mut Vec<u32>,
) -> CodegenResult<()> {
    // Each round inserts one word and never creates a new 0x3F offset past
    // the end of the code, so the rounds are bounded by the code length.
    let mut remaining = out.len() + 16;
    loop {
        let buggy = ctx.branches.iter().position(|&(pos, target)| {
            program.blocks[target as usize].offset as i64 - pos as i64 - 1 == 0x3F
        });
        let buggy_pos = match buggy {
            Some(i) => ctx.branches[i].0,
            None => break,
        };
        if remaining == 0 {
            return Err(CodegenError::Unreachable("branch offset fix-up did not terminate"));
        }
        remaining -= 1;

        // Insert an s_nop right after the branch.
        let nop_pos = buggy_pos + 1;
        out.insert(nop_pos, S_NOP_WORD);

        // Update the offset of each affected block.
        for block in &mut program.blocks {
            if block.offset > buggy_pos as u32 {
                block.offset += 1;
            }
        }
        // Update the branches following this one.
        for (pos, _) in ctx.branches.iter_mut() {
            if *pos > buggy_pos {
                *pos += 1;
            }
        }
        // Update the locations of constant addresses behind the insertion.
        for caddr in ctx.constaddrs.iter_mut() {
            if *caddr >= nop_pos {
                *caddr += 1;
            }
        }
    }
    Ok(())
}

fn fix_branches(program: &mut Program, ctx: &mut AsmContext, out: &mut Vec<u32>) -> CodegenResult<()> {
    if ctx.chip >= ChipClass::Gfx10 {
        fix_branches_gfx10(program, ctx, out)?;
    }

    for &(pos, target) in &ctx.branches {
        let offset = program.blocks[target as usize].offset as i64 - pos as i64 - 1;
        out[pos] |= offset as u16 as u32;
    }
    Ok(())
}

fn fix_constaddrs(ctx: &AsmContext, out: &mut Vec<u32>) {
    let code_size = out.len() as u32 * 4;
    for &addr in &ctx.constaddrs {
        out[addr] = out[addr].wrapping_add(code_size);
    }
}

/// Assemble `program` into `code` and return the executable size in bytes
/// (excluding prefetch padding and constant data).
pub fn emit_program(program: &mut Program, code: &mut Vec<u32>) -> CodegenResult<usize> {
    let mut ctx = AsmContext::new(program);

    if program.stage.intersects(Stage::HW_VS | Stage::HW_FS) {
        fix_exports(program);
    }

    for i in 0..program.blocks.len() {
        program.blocks[i].offset = code.len() as u32;
        let block = std::mem::take(&mut program.blocks[i]);
        emit_block(&mut ctx, code, &block)?;
        program.blocks[i] = block;
    }

    fix_branches(program, &mut ctx, code)?;

    let exec_size = code.len() * 4;

    if program.chip_class >= ChipClass::Gfx10 {
        // Pad with s_code_end so instruction prefetch cannot fault.
        let final_size = (code.len() + 3 * 16).div_ceil(16) * 16;
        while code.len() < final_size {
            code.push(S_CODE_END_WORD);
        }
    }

    fix_constaddrs(&ctx, code);

    while program.constant_data.len() % 4 != 0 {
        program.constant_data.push(0);
    }
    for chunk in program.constant_data.chunks_exact(4) {
        code.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    log::debug!(
        "emit_program: {} bytes of code, {} bytes of constant data",
        exec_size,
        program.constant_data.len()
    );
    Ok(exec_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, Definition, Operand, PhysReg, RegClass};

    fn one_block(chip: ChipClass, stage: Stage) -> Program {
        let mut program = Program::new(chip, 64, stage);
        program.create_and_insert_block();
        program
    }

    #[test]
    fn basic_word_encodings() {
        let mut program = one_block(ChipClass::Gfx9, Stage::HW_CS);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_nop, None, 0);
            let d = Definition::fixed(PhysReg(256), RegClass::V1);
            bld.vop1(Opcode::v_mov_b32, &[d], &[Operand::fixed(PhysReg(257), RegClass::V1)]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        let mut code = Vec::new();
        let exec_size = emit_program(&mut program, &mut code).unwrap();

        assert_eq!(exec_size, 12);
        assert_eq!(code[0], 0xBF80_0000);
        assert_eq!(code[1], 0x7E00_0301);
        assert_eq!(code[2], 0xBF81_0000);
    }

    #[test]
    fn literal_follows_instruction() {
        let mut program = one_block(ChipClass::Gfx9, Stage::HW_CS);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = Definition::fixed(PhysReg(256), RegClass::V1);
            bld.vop1(Opcode::v_mov_b32, &[d], &[Operand::c32(0x1234_5678)]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        let mut code = Vec::new();
        emit_program(&mut program, &mut code).unwrap();
        assert_eq!(code[1], 0x1234_5678);
    }

    #[test]
    fn branch_offset_is_patched() {
        // Block 0 branches over block 1 to block 2.
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        for _ in 0..3 {
            program.create_and_insert_block();
        }
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_branch, Some(2), 0);
        }
        program.blocks[0].instructions = instrs;
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            for _ in 0..5 {
                bld.sopp(Opcode::s_nop, None, 0);
            }
        }
        program.blocks[1].instructions = instrs;
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[2].instructions = instrs;

        let mut code = Vec::new();
        emit_program(&mut program, &mut code).unwrap();

        assert_eq!(program.blocks[2].offset, 6);
        // offset = target.offset - pos - 1 in the low 16 bits.
        assert_eq!(code[0] & 0xFFFF, 5);
    }

    #[test]
    fn gfx10_branch_0x3f_gets_a_nop() {
        let mut program = Program::new(ChipClass::Gfx10, 64, Stage::HW_CS);
        program.create_and_insert_block();
        program.create_and_insert_block();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_branch, Some(1), 0);
            for _ in 0..0x3F {
                bld.sopp(Opcode::s_nop, None, 0);
            }
        }
        program.blocks[0].instructions = instrs;
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[1].instructions = instrs;

        let mut code = Vec::new();
        emit_program(&mut program, &mut code).unwrap();

        // The naive offset was exactly 0x3F; a nop was inserted right after
        // the branch, shifting the target block by one word.
        assert_eq!(code[1], S_NOP_WORD);
        assert_eq!(program.blocks[1].offset, 0x41);
        assert_eq!(code[0] & 0xFFFF, 0x40);
    }

    #[test]
    fn fragment_stage_null_export_synthesis() {
        let mut program = one_block(ChipClass::Gfx9, Stage::HW_FS);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        let mut code = Vec::new();
        emit_program(&mut program, &mut code).unwrap();

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, Opcode::exp);
        match &instrs[0].data {
            InstrData::Exp { done, valid_mask, enabled_mask, dest, .. } => {
                assert!(*done);
                assert!(*valid_mask);
                assert_eq!(*enabled_mask, 0);
                assert_eq!(*dest as u32, EXP_NULL_TARGET);
            }
            _ => panic!("null export expected"),
        }
        assert_eq!(instrs[1].opcode, Opcode::s_endpgm);
    }

    #[test]
    fn emission_is_deterministic() {
        let mut code1 = Vec::new();
        let mut code2 = Vec::new();
        {
            let mut program = one_block(ChipClass::Gfx10, Stage::HW_FS);
            let mut instrs = Vec::new();
            {
                let mut bld = Builder::new(&mut program, &mut instrs);
                bld.sopp(Opcode::s_endpgm, None, 0);
            }
            program.blocks[0].instructions = instrs;
            emit_program(&mut program, &mut code1).unwrap();
            emit_program(&mut program, &mut code2).unwrap();
        }
        assert_eq!(code1, code2);
    }

    #[test]
    fn constant_data_is_appended_and_patched() {
        let mut program = one_block(ChipClass::Gfx9, Stage::HW_CS);
        program.constant_data = vec![1, 2, 3];
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut caddr =
                Instruction::new(Opcode::p_constaddr, crate::ir::Format::PSEUDO, 1, 1);
            caddr.definitions[0] = Definition::fixed(PhysReg(4), RegClass::S2);
            caddr.operands[0] = Operand::c32(0);
            bld.insert(caddr);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;

        let mut code = Vec::new();
        let exec_size = emit_program(&mut program, &mut code).unwrap();

        // getpc + add + reserved + addc + endpgm.
        assert_eq!(exec_size, 20);
        // Constant data is zero-padded to a word.
        assert_eq!(code.len(), 6);
        assert_eq!(code[5], u32::from_le_bytes([1, 2, 3, 0]));
        // The PC after s_getpc is byte 4; the patched addend lands exactly
        // on the constant data at byte 20.
        assert_eq!(code[2], 16);
    }
}
