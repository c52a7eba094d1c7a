//! A small instruction builder used by the lowering passes.
//!
//! The builder appends instructions to a caller-provided vector; passes that
//! rewrite a block take its instruction vector out, build a replacement and
//! swap it back in, so the program's SSA allocator and the target vector can
//! be borrowed independently.

use super::opcodes::Opcode;
use super::{
    ChipClass, Definition, Format, InstrData, Instruction, Operand, PhysReg, Program, RegClass,
    RegType, Temp,
};

/// Wave-size-generic scalar operations, resolved to the `_b32` or `_b64`
/// form by the builder according to the program's lane-mask width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum WaveOp {
    And,
    Or,
    Xor,
    AndN2,
    Not,
    Mov,
    Cselect,
    Wqm,
    AndSaveexec,
    OrSaveexec,
    AndN2Wrexec,
    Ff1,
}

/// Appends instructions to a vector, allocating temps from the program.
pub struct Builder<'a> {
    /// The program, used for SSA allocation and target queries.
    pub program: &'a mut Program,
    /// The append target.
    pub instructions: &'a mut Vec<Instruction>,
}

impl<'a> Builder<'a> {
    /// A builder appending to `instructions`.
    pub fn new(program: &'a mut Program, instructions: &'a mut Vec<Instruction>) -> Self {
        Self { program, instructions }
    }

    /// The lane-mask register class of the target.
    pub fn lm(&self) -> RegClass {
        self.program.lane_mask()
    }

    /// The chip class of the target.
    pub fn chip(&self) -> ChipClass {
        self.program.chip_class
    }

    /// A fresh temporary.
    pub fn tmp(&mut self, rc: RegClass) -> Temp {
        self.program.alloc_tmp(rc)
    }

    /// A definition of a fresh temporary.
    pub fn def(&mut self, rc: RegClass) -> Definition {
        Definition::new(self.tmp(rc))
    }

    /// A definition of a fresh temporary fixed to `reg`.
    pub fn def_fixed(&mut self, rc: RegClass, reg: PhysReg) -> Definition {
        Definition::fixed_temp(self.tmp(rc), reg)
    }

    /// Resolve a wave-generic scalar op to the opcode for this wave size.
    pub fn w64or32(&self, op: WaveOp) -> Opcode {
        let wave64 = self.program.wave_size == 64;
        match op {
            WaveOp::And => {
                if wave64 {
                    Opcode::s_and_b64
                } else {
                    Opcode::s_and_b32
                }
            }
            WaveOp::Or => {
                if wave64 {
                    Opcode::s_or_b64
                } else {
                    Opcode::s_or_b32
                }
            }
            WaveOp::Xor => {
                if wave64 {
                    Opcode::s_xor_b64
                } else {
                    Opcode::s_xor_b32
                }
            }
            WaveOp::AndN2 => {
                if wave64 {
                    Opcode::s_andn2_b64
                } else {
                    Opcode::s_andn2_b32
                }
            }
            WaveOp::Not => {
                if wave64 {
                    Opcode::s_not_b64
                } else {
                    Opcode::s_not_b32
                }
            }
            WaveOp::Mov => {
                if wave64 {
                    Opcode::s_mov_b64
                } else {
                    Opcode::s_mov_b32
                }
            }
            WaveOp::Cselect => {
                if wave64 {
                    Opcode::s_cselect_b64
                } else {
                    Opcode::s_cselect_b32
                }
            }
            WaveOp::Wqm => {
                if wave64 {
                    Opcode::s_wqm_b64
                } else {
                    Opcode::s_wqm_b32
                }
            }
            WaveOp::AndSaveexec => {
                if wave64 {
                    Opcode::s_and_saveexec_b64
                } else {
                    Opcode::s_and_saveexec_b32
                }
            }
            WaveOp::OrSaveexec => {
                if wave64 {
                    Opcode::s_or_saveexec_b64
                } else {
                    Opcode::s_or_saveexec_b32
                }
            }
            WaveOp::AndN2Wrexec => {
                if wave64 {
                    Opcode::s_andn2_wrexec_b64
                } else {
                    Opcode::s_andn2_wrexec_b32
                }
            }
            WaveOp::Ff1 => {
                if wave64 {
                    Opcode::s_ff1_i32_b64
                } else {
                    Opcode::s_ff1_i32_b32
                }
            }
        }
    }

    /// Append `instr` and return its first definition's temp, if any.
    pub fn insert(&mut self, instr: Instruction) -> Option<Temp> {
        let tmp = instr.definitions.first().filter(|d| d.is_temp()).map(|d| d.get_temp());
        self.instructions.push(instr);
        tmp
    }

    /// The most recently appended instruction.
    pub fn last_mut(&mut self) -> &mut Instruction {
        self.instructions.last_mut().expect("builder target is empty")
    }

    fn emit(
        &mut self,
        opcode: Opcode,
        format: Format,
        defs: &[Definition],
        ops: &[Operand],
    ) -> Option<Temp> {
        let mut instr = Instruction::new(opcode, format, ops.len(), defs.len());
        instr.operands.copy_from_slice(ops);
        instr.definitions.copy_from_slice(defs);
        self.insert(instr)
    }

    /// Append a SOP1 instruction.
    pub fn sop1(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::SOP1, defs, ops)
    }

    /// Append a SOP2 instruction.
    pub fn sop2(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::SOP2, defs, ops)
    }

    /// Append a SOPC instruction.
    pub fn sopc(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::SOPC, defs, ops)
    }

    /// Append a SOPK instruction.
    pub fn sopk(
        &mut self,
        opcode: Opcode,
        defs: &[Definition],
        ops: &[Operand],
        imm: u16,
    ) -> Option<Temp> {
        let r = self.emit(opcode, Format::SOPK, defs, ops);
        self.last_mut().data = InstrData::Sopk { imm };
        r
    }

    /// Append a SOPP instruction; `block` is a branch target to be patched
    /// by the assembler.
    pub fn sopp(&mut self, opcode: Opcode, block: Option<u32>, imm: u16) {
        self.emit(opcode, Format::SOPP, &[], &[]);
        self.last_mut().data = InstrData::Sopp { imm, block };
    }

    /// Append a SOPP instruction with an operand (e.g. a branch reading scc).
    pub fn sopp_with(
        &mut self,
        opcode: Opcode,
        defs: &[Definition],
        ops: &[Operand],
        block: Option<u32>,
        imm: u16,
    ) {
        self.emit(opcode, Format::SOPP, defs, ops);
        self.last_mut().data = InstrData::Sopp { imm, block };
    }

    /// Append a SMEM instruction.
    pub fn smem(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::SMEM, defs, ops)
    }

    /// Append a VOP1 instruction.
    pub fn vop1(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::VOP1, defs, ops)
    }

    /// Append a VOP2 instruction.
    pub fn vop2(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::VOP2, defs, ops)
    }

    /// Append a VOP2 instruction in its VOP3 encoding.
    pub fn vop2_e64(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::VOP2.as_vop3(), defs, ops)
    }

    /// Append a VOPC instruction.
    pub fn vopc(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::VOPC, defs, ops)
    }

    /// Append a native VOP3 instruction.
    pub fn vop3(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::VOP3, defs, ops)
    }

    /// Append a VOP1 instruction with a DPP lane-shuffle modifier.
    #[allow(clippy::too_many_arguments)]
    pub fn vop1_dpp(
        &mut self,
        opcode: Opcode,
        def: Definition,
        op: Operand,
        dpp_ctrl: u16,
        row_mask: u8,
        bank_mask: u8,
        bound_ctrl: bool,
    ) -> Option<Temp> {
        let format = Format(Format::VOP1.0 | Format::DPP.0);
        let r = self.emit(opcode, format, &[def], &[op]);
        self.last_mut().data = InstrData::Dpp {
            dpp_ctrl,
            row_mask,
            bank_mask,
            bound_ctrl,
            abs: [false; 2],
            neg: [false; 2],
        };
        r
    }

    /// Append a DS instruction.
    pub fn ds(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::DS, defs, ops)
    }

    /// Append an export.
    #[allow(clippy::too_many_arguments)]
    pub fn exp(
        &mut self,
        ops: [Operand; 4],
        enabled_mask: u8,
        dest: u8,
        compressed: bool,
        done: bool,
        valid_mask: bool,
    ) {
        self.emit(Opcode::exp, Format::EXP, &[], &ops);
        self.last_mut().data = InstrData::Exp { enabled_mask, dest, compressed, done, valid_mask };
    }

    /// Append a pseudo instruction.
    pub fn pseudo(&mut self, opcode: Opcode, defs: &[Definition], ops: &[Operand]) -> Option<Temp> {
        self.emit(opcode, Format::PSEUDO, defs, ops)
    }

    /// Append a pseudo branch with a jump target and a fall-through target.
    pub fn branch(
        &mut self,
        opcode: Opcode,
        cond: Option<Operand>,
        target: u32,
        fallthrough: u32,
    ) -> &mut Instruction {
        let ops: &[Operand] = match &cond {
            Some(op) => std::slice::from_ref(op),
            None => &[],
        };
        self.emit(opcode, Format::PSEUDO_BRANCH, &[], ops);
        let instr = self.instructions.last_mut().unwrap();
        instr.data =
            InstrData::Branch { target: [target, fallthrough], rarely_taken: false, never_taken: false };
        instr
    }

    /// Append a copy from `op` to `def`, picking the cheapest encoding for
    /// the class: scalar moves for SGPRs, `v_mov_b32` for single VGPRs, and
    /// a single-entry parallel copy otherwise.
    pub fn copy(&mut self, def: Definition, op: Operand) -> Option<Temp> {
        if def.reg_class().ty() == RegType::Sgpr && def.size() == 1 {
            self.sop1(Opcode::s_mov_b32, &[def], &[op])
        } else if def.reg_class().ty() == RegType::Sgpr && def.size() == 2 {
            self.sop1(Opcode::s_mov_b64, &[def], &[op])
        } else if def.reg_class() == RegClass::V1 {
            self.vop1(Opcode::v_mov_b32, &[def], &[op])
        } else {
            self.pseudo(Opcode::p_parallelcopy, &[def], &[op])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Stage;

    #[test]
    fn wave_dispatch() {
        let mut p64 = Program::new(ChipClass::Gfx10, 64, Stage::HW_CS);
        let mut instrs = Vec::new();
        let bld = Builder::new(&mut p64, &mut instrs);
        assert_eq!(bld.w64or32(WaveOp::And), Opcode::s_and_b64);
        assert_eq!(bld.lm(), RegClass::S2);

        let mut p32 = Program::new(ChipClass::Gfx10, 32, Stage::HW_CS);
        let mut instrs = Vec::new();
        let bld = Builder::new(&mut p32, &mut instrs);
        assert_eq!(bld.w64or32(WaveOp::AndN2Wrexec), Opcode::s_andn2_wrexec_b32);
        assert_eq!(bld.lm(), RegClass::S1);
    }

    #[test]
    fn copy_forms() {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        let mut instrs = Vec::new();
        let mut bld = Builder::new(&mut program, &mut instrs);
        let s = bld.def(RegClass::S1);
        bld.copy(s, Operand::c32(42));
        let v = bld.def(RegClass::V1);
        bld.copy(v, Operand::c32(7));
        let wide = bld.def(RegClass::V2);
        bld.copy(wide, Operand::undef(RegClass::V2));
        assert_eq!(instrs[0].opcode, Opcode::s_mov_b32);
        assert_eq!(instrs[1].opcode, Opcode::v_mov_b32);
        assert_eq!(instrs[2].opcode, Opcode::p_parallelcopy);
    }
}
