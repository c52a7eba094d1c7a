//! GFX11 ALU-delay insertion.
//!
//! On GFX11+ the SIMD frontend does not switch to another wave on an ALU
//! stall, so `s_delay_alu` exists to request the switch and to say when the
//! dependency resolves. Omitting it is still correct; the wave just stalls
//! in the ALU. The pass tracks, per written register, how many VALU and
//! transcendental instructions ago the value was produced and how many
//! cycles remain until each producer retires, and emits a delay in front of
//! the consumer. A combine pass afterwards packs two delays into one
//! instruction using the skip field.

use std::collections::BTreeMap;

use crate::ir::{Format, InstrData, Instruction, Opcode, PhysReg, Program};

/// Wait encodings of the s_delay_alu immediate.
const VALU_DEP_1: u16 = 1;
const TRANS32_DEP_1: u16 = 5;
const SALU_CYCLE_1: u16 = 9;

/// Producer latencies, in frontend cycles.
const TRANS_LATENCY: i8 = 10;
const VALU_LATENCY: i8 = 5;
const SALU_LATENCY: i8 = 2;

#[derive(Clone, Copy)]
struct AluDelayInfo {
    /// Values one above the largest representable wait: waiting for
    /// something further back is a no-op.
    valu_instrs: i8,
    valu_cycles: i8,
    trans_instrs: i8,
    trans_cycles: i8,
    salu_cycles: i8,
}

impl AluDelayInfo {
    const VALU_NOP: i8 = 5;
    const TRANS_NOP: i8 = 4;

    fn new() -> Self {
        Self {
            valu_instrs: Self::VALU_NOP,
            valu_cycles: 0,
            trans_instrs: Self::TRANS_NOP,
            trans_cycles: 0,
            salu_cycles: 0,
        }
    }

    fn combine(&mut self, other: &AluDelayInfo) {
        self.valu_instrs = self.valu_instrs.min(other.valu_instrs);
        self.trans_instrs = self.trans_instrs.min(other.trans_instrs);
        self.salu_cycles = self.salu_cycles.max(other.salu_cycles);
        self.valu_cycles = self.valu_cycles.max(other.valu_cycles);
        self.trans_cycles = self.trans_cycles.max(other.trans_cycles);
    }

    /// Normalize after any change; returns whether the entry became empty.
    fn fixup(&mut self) -> bool {
        if self.valu_instrs >= Self::VALU_NOP || self.valu_cycles <= 0 {
            self.valu_instrs = Self::VALU_NOP;
            self.valu_cycles = 0;
        }
        if self.trans_instrs >= Self::TRANS_NOP || self.trans_cycles <= 0 {
            self.trans_instrs = Self::TRANS_NOP;
            self.trans_cycles = 0;
        }
        self.salu_cycles = self.salu_cycles.max(0);
        self.empty()
    }

    /// Whether a wait on this entry would be a no-op.
    fn empty(&self) -> bool {
        self.valu_instrs == Self::VALU_NOP
            && self.trans_instrs == Self::TRANS_NOP
            && self.salu_cycles == 0
    }
}

struct DelayCtx {
    gpr_map: BTreeMap<PhysReg, AluDelayInfo>,
}

impl DelayCtx {
    fn new() -> Self {
        Self { gpr_map: BTreeMap::new() }
    }
}

fn check_alu(ctx: &DelayCtx, delay: &mut AluDelayInfo, instr: &Instruction) {
    for op in &instr.operands {
        if op.is_constant() || op.is_undefined() || !op.is_fixed() {
            continue;
        }
        // Combine over consecutively read registers.
        for j in 0..op.size() {
            if let Some(entry) = ctx.gpr_map.get(&op.phys_reg().advance(j)) {
                delay.combine(entry);
            }
        }
    }
}

fn update_alu(ctx: &mut DelayCtx, is_valu: bool, is_trans: bool, cycles: i8) {
    ctx.gpr_map.retain(|_, entry| {
        entry.valu_instrs += is_valu as i8;
        entry.trans_instrs += is_trans as i8;
        entry.salu_cycles -= cycles;
        entry.valu_cycles -= cycles;
        entry.trans_cycles -= cycles;
        !entry.fixup()
    });
}

fn kill_alu(ctx: &mut DelayCtx, delay: &mut AluDelayInfo, instr: &Instruction) {
    if instr.is_valu() || instr.is_salu() {
        check_alu(ctx, delay, instr);
    }

    if !delay.empty() {
        let waited = delay.salu_cycles.max(delay.valu_cycles).max(delay.trans_cycles);
        update_alu(ctx, false, false, waited);

        // Remove all registers with a higher counter from the map.
        let valu_instrs = delay.valu_instrs;
        let trans_instrs = delay.trans_instrs;
        ctx.gpr_map.retain(|_, entry| {
            if valu_instrs <= entry.valu_instrs {
                entry.valu_instrs = AluDelayInfo::VALU_NOP;
            }
            if trans_instrs <= entry.trans_instrs {
                entry.trans_instrs = AluDelayInfo::TRANS_NOP;
            }
            !entry.fixup()
        });
    }
}

fn gen_alu(ctx: &mut DelayCtx, instr: &Instruction) {
    let is_valu = instr.is_valu();
    let is_trans = instr.is_trans();

    if is_trans || is_valu || instr.is_salu() {
        let mut delay = AluDelayInfo::new();
        if is_trans {
            delay.trans_instrs = 0;
            delay.trans_cycles = TRANS_LATENCY;
        } else if is_valu {
            delay.valu_instrs = 0;
            delay.valu_cycles = VALU_LATENCY;
        } else {
            delay.salu_cycles = SALU_LATENCY;
        }

        for def in &instr.definitions {
            for j in 0..def.size() {
                ctx.gpr_map
                    .entry(def.phys_reg().advance(j))
                    .and_modify(|entry| entry.combine(&delay))
                    .or_insert(delay);
            }
        }
    }

    update_alu(ctx, is_valu, is_trans, 1);
}

fn emit_delay_alu(instructions: &mut Vec<Instruction>, delay: &mut AluDelayInfo) {
    let mut imm: u16 = 0;
    if delay.trans_instrs != AluDelayInfo::TRANS_NOP {
        imm |= TRANS32_DEP_1 + delay.trans_instrs as u16 - 1;
    }

    if delay.valu_instrs != AluDelayInfo::VALU_NOP {
        let dep = VALU_DEP_1 + delay.valu_instrs as u16 - 1;
        imm |= dep << if imm != 0 { 7 } else { 0 };
    }

    // Only two wait conditions fit; when all three are present the SALU one
    // is dropped, which only costs cycles, not correctness.
    if delay.salu_cycles != 0 && imm <= 0xf {
        let cycles = delay.salu_cycles.min(3) as u16;
        imm |= (SALU_CYCLE_1 + cycles - 1) << if imm != 0 { 7 } else { 0 };
    }

    let mut instr = Instruction::new(Opcode::s_delay_alu, Format::SOPP, 0, 0);
    instr.data = InstrData::Sopp { imm, block: None };
    instructions.push(instr);
    *delay = AluDelayInfo::new();
}

fn handle_block(block: &mut crate::ir::Block, ctx: &mut DelayCtx) {
    let old = std::mem::take(&mut block.instructions);
    let mut new_instructions = Vec::with_capacity(old.len());
    let mut queued_delay = AluDelayInfo::new();

    for instr in old {
        debug_assert!(instr.opcode != Opcode::s_delay_alu);

        kill_alu(ctx, &mut queued_delay, &instr);
        gen_alu(ctx, &instr);

        if !queued_delay.empty() {
            emit_delay_alu(&mut new_instructions, &mut queued_delay);
        }
        new_instructions.push(instr);
    }

    block.instructions = new_instructions;
}

/// Insert `s_delay_alu` in front of instructions consuming still-in-flight
/// ALU results.
pub fn insert_delay_alu(program: &mut Program) {
    let mut ctx = DelayCtx::new();

    for i in 0..program.blocks.len() {
        if program.blocks[i].instructions.is_empty() {
            continue;
        }

        handle_block(&mut program.blocks[i], &mut ctx);

        // Reset on jumps; branch latency is high enough that the ALU will
        // be done.
        let block = &program.blocks[i];
        if block.linear_succs.is_empty()
            || block.instructions.last().unwrap().opcode == Opcode::s_branch
        {
            ctx = DelayCtx::new();
        }
    }
}

/// Combine `s_delay_alu` pairs using the skip field.
pub fn combine_delay_alu(program: &mut Program) {
    for block in &mut program.blocks {
        let mut out: Vec<Instruction> = Vec::with_capacity(block.instructions.len());
        let mut prev_delay_alu: i32 = -1;
        for instr in block.instructions.drain(..) {
            if instr.opcode != Opcode::s_delay_alu {
                out.push(instr);
                continue;
            }

            let imm = instr.salu_imm();
            let skip = out.len() as i32 - prev_delay_alu - 1;
            if imm >> 7 != 0 || prev_delay_alu < 0 || skip >= 6 {
                if imm >> 7 == 0 {
                    prev_delay_alu = out.len() as i32;
                }
                out.push(instr);
                continue;
            }

            *out[prev_delay_alu as usize].salu_imm_mut() |= ((skip as u16) << 4) | (imm << 7);
            prev_delay_alu = -1;
        }
        block.instructions = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Builder, ChipClass, Definition, Operand, RegClass, Stage};

    fn one_block() -> Program {
        let mut program = Program::new(ChipClass::Gfx11, 64, Stage::HW_CS);
        program.create_and_insert_block();
        program
    }

    #[test]
    fn trans_consumer_gets_delay() {
        let mut program = one_block();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = Definition::fixed(PhysReg(256), RegClass::V1);
            bld.vop1(Opcode::v_rcp_f32, &[d], &[Operand::fixed(PhysReg(257), RegClass::V1)]);
            let d2 = Definition::fixed(PhysReg(258), RegClass::V1);
            bld.vop2(
                Opcode::v_add_f32,
                &[d2],
                &[
                    Operand::fixed(PhysReg(256), RegClass::V1),
                    Operand::fixed(PhysReg(259), RegClass::V1),
                ],
            );
        }
        program.blocks[0].instructions = instrs;

        insert_delay_alu(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[1].opcode, Opcode::s_delay_alu);
        assert_eq!(instrs[1].salu_imm(), TRANS32_DEP_1);
    }

    #[test]
    fn independent_reads_need_no_delay() {
        let mut program = one_block();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let d = Definition::fixed(PhysReg(256), RegClass::V1);
            bld.vop1(Opcode::v_mov_b32, &[d], &[Operand::c32(0)]);
            let d2 = Definition::fixed(PhysReg(258), RegClass::V1);
            bld.vop2(
                Opcode::v_add_f32,
                &[d2],
                &[
                    Operand::fixed(PhysReg(259), RegClass::V1),
                    Operand::fixed(PhysReg(260), RegClass::V1),
                ],
            );
        }
        program.blocks[0].instructions = instrs;

        insert_delay_alu(&mut program);
        assert_eq!(program.blocks[0].instructions.len(), 2);
    }

    #[test]
    fn combine_packs_two_delays() {
        let mut program = one_block();
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            for reg in [256u32, 260] {
                let d = Definition::fixed(PhysReg(reg), RegClass::V1);
                bld.vop2(
                    Opcode::v_mul_f32,
                    &[d],
                    &[
                        Operand::fixed(PhysReg(reg + 1), RegClass::V1),
                        Operand::fixed(PhysReg(reg + 2), RegClass::V1),
                    ],
                );
                let d2 = Definition::fixed(PhysReg(reg + 3), RegClass::V1);
                bld.vop2(
                    Opcode::v_add_f32,
                    &[d2],
                    &[
                        Operand::fixed(PhysReg(reg), RegClass::V1),
                        Operand::fixed(PhysReg(reg + 2), RegClass::V1),
                    ],
                );
            }
        }
        program.blocks[0].instructions = instrs;

        insert_delay_alu(&mut program);
        let delays = program.blocks[0]
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::s_delay_alu)
            .count();
        assert_eq!(delays, 2);

        combine_delay_alu(&mut program);
        let instrs = &program.blocks[0].instructions;
        let delays: Vec<_> =
            instrs.iter().filter(|i| i.opcode == Opcode::s_delay_alu).collect();
        assert_eq!(delays.len(), 1);
        // The second wait rides in the high bits, the skip field in between.
        assert!(delays[0].salu_imm() >> 7 != 0);
    }
}
