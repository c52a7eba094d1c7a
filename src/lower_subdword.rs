//! Lowering of sub-32-bit vector pseudo operations.
//!
//! `p_create_vector`, `p_split_vector` and `p_extract_vector` with operands
//! or definitions below 4 bytes are rewritten into whole-dword operations:
//! byte-exact packing is expressed with shifts, `v_alignbyte_b32` and
//! constant folding across adjacent literal bytes. Undefined bytes are
//! don't-care and get absorbed by neighboring operands to keep the emitted
//! sequence short. Multi-dword definitions split into per-dword sub-tasks
//! and recurse.

use crate::ir::{
    Builder, Definition, Format, Instruction, Opcode, Operand, Program, RegClass, RegType, Temp,
    SCC,
};

fn dword_temp(tmp: Temp) -> Temp {
    if !tmp.reg_class().is_subdword() {
        return tmp;
    }
    let mut rc = RegClass::new(tmp.ty(), tmp.size() as u8);
    if tmp.reg_class().is_linear() && tmp.ty() == RegType::Vgpr {
        rc = rc.as_linear();
    }
    Temp::new(tmp.id(), rc)
}

fn dword_def(mut def: Definition) -> Definition {
    def.set_temp(dword_temp(def.get_temp()));
    def
}

fn dword_op(mut op: Operand, convert_const: bool) -> Operand {
    if op.is_temp() || op.is_undefined() {
        op.set_temp(dword_temp(op.get_temp()));
    } else if convert_const && op.is_constant() && op.bytes() < 4 {
        op = Operand::c32(op.constant_value());
    }
    op
}

#[derive(Clone, Copy)]
struct OpInfo {
    op: Operand,
    /// Byte offset into op.
    offset: u32,
    /// How many bytes to use after offset.
    bytes: u32,
}

fn emit_pack(bld: &mut Builder, def: Definition, mut operands: Vec<OpInfo>) {
    debug_assert!(def.reg_class().ty() == RegType::Vgpr);

    // Split the definition into dwords.
    if def.size() > 1 {
        let mut vec =
            Instruction::new(Opcode::p_create_vector, Format::PSEUDO, def.size() as usize, 1);
        vec.definitions[0] = def;

        let mut op_idx = 0;
        for i in 0..def.size() as usize {
            let mut sub_operands = Vec::new();
            let sub_def = bld.def(RegClass::V1);
            vec.operands[i] = Operand::temp(sub_def.get_temp());
            let mut sub_bytes = 0;
            while sub_bytes < 4 {
                let new_bytes = operands[op_idx].bytes.min(4 - sub_bytes);
                sub_bytes += new_bytes;

                sub_operands.push(OpInfo {
                    op: operands[op_idx].op,
                    offset: operands[op_idx].offset,
                    bytes: new_bytes,
                });

                if new_bytes == operands[op_idx].bytes {
                    op_idx += 1;
                    if op_idx >= operands.len() {
                        break;
                    }
                } else {
                    operands[op_idx].offset += new_bytes;
                    operands[op_idx].bytes -= new_bytes;
                }
            }

            emit_pack(bld, sub_def, sub_operands);
        }

        bld.insert(vec);
        return;
    }

    // Split operands into dwords.
    let mut i = 0;
    while i < operands.len() {
        let op = operands[i].op;
        let offset = operands[i].offset;
        let bytes = operands[i].bytes;

        if op.is_undefined() || op.is_constant() {
            if op.is_constant() {
                operands[i].op = Operand::c32((op.constant_value64() >> (offset * 8)) as u32);
            } else {
                operands[i].op = Operand::undef(RegClass::V1);
            }
            operands[i].offset = 0;
            i += 1;
            continue;
        }

        if op.size() == 1 {
            i += 1;
            continue;
        }

        debug_assert!(!op.is_fixed());

        let rc = if op.is_of_type(RegType::Vgpr) { RegClass::V1 } else { RegClass::S1 };
        let mut split =
            Instruction::new(Opcode::p_split_vector, Format::PSEUDO, 1, op.size() as usize);
        split.operands[0] = op;
        for j in 0..op.size() as usize {
            split.definitions[j] = bld.def(rc);
        }

        let mut dword_off = (offset / 4) as usize;
        let new_bytes = (4 - offset % 4).min(bytes);
        operands[i].op = Operand::temp(split.definitions[dword_off].get_temp());
        dword_off += 1;
        operands[i].offset = offset % 4;
        operands[i].bytes = new_bytes;
        if new_bytes != bytes {
            i += 1;
            operands.insert(
                i,
                OpInfo {
                    op: Operand::temp(split.definitions[dword_off].get_temp()),
                    offset: 0,
                    bytes: bytes - new_bytes,
                },
            );
        }

        bld.insert(split);
        i += 1;
    }

    // Remove undef operands; neighbors absorb their byte budget.
    let mut i = 0;
    while i < operands.len() {
        if !operands[i].op.is_undefined() {
            i += 1;
            continue;
        }
        let mut bytes = operands[i].bytes;

        if i != operands.len() - 1 {
            let offset = operands[i + 1].offset;
            let absorbed = offset.min(bytes);
            operands[i + 1].offset -= absorbed;
            bytes -= absorbed;
        }

        if i != 0 {
            let rem = 4 - (operands[i - 1].bytes + operands[i - 1].offset);
            let absorbed = rem.min(bytes);
            operands[i - 1].bytes += absorbed;
            bytes -= absorbed;
        }

        if bytes == 0 {
            operands.remove(i);
        } else {
            operands[i].op = Operand::c32(0);
            operands[i].bytes = bytes;
            i += 1;
        }
    }

    // Combine adjacent constant operands.
    let mut i = 1;
    while i < operands.len() {
        if !operands[i].op.is_constant() || !operands[i - 1].op.is_constant() {
            i += 1;
            continue;
        }
        debug_assert_eq!(operands[i].offset, 0);

        let bytes = operands[i - 1].bytes;
        let mask = ((1u64 << (bytes * 8)) - 1) as u32;
        let prev = operands[i - 1].op.constant_value() & mask;
        let current = operands[i].op.constant_value() << (bytes * 8);

        operands[i - 1].op = Operand::c32(prev | current);
        operands[i - 1].bytes += operands[i].bytes;
        operands.remove(i);
    }

    if operands.len() == 1 {
        let op = operands[0].op;
        let offset = operands[0].offset;
        if offset != 0 {
            if op.is_of_type(RegType::Vgpr) {
                bld.vop2(Opcode::v_lshrrev_b32, &[def], &[Operand::c32(offset * 8), op]);
            } else {
                bld.vop2_e64(Opcode::v_lshrrev_b32, &[def], &[Operand::c32(offset * 8), op]);
            }
        } else {
            bld.copy(def, op);
        }
        return;
    }

    let mut curr = operands[0].op;
    let shift = (4 - (operands[0].bytes + operands[0].offset)) * 8;
    if shift != 0 {
        if curr.is_constant() {
            curr = Operand::c32(curr.constant_value() << shift);
        } else if curr.is_of_type(RegType::Vgpr) {
            let d = bld.def(RegClass::V1);
            let t = d.get_temp();
            bld.vop2(Opcode::v_lshlrev_b32, &[d], &[Operand::c32(shift), curr]);
            curr = Operand::temp(t);
        } else {
            let d = bld.def(RegClass::S1);
            let scc_def = bld.def_fixed(RegClass::S1, SCC);
            let t = d.get_temp();
            bld.sop2(Opcode::s_lshl_b32, &[d, scc_def], &[curr, Operand::c32(shift)]);
            curr = Operand::temp(t);
        }
    }

    if curr.is_literal() {
        let d = bld.def(RegClass::S1);
        let t = d.get_temp();
        bld.copy(d, curr);
        curr = Operand::temp(t);
    }

    let mut packed_bytes = operands[0].bytes;
    for i in 1..operands.len() {
        let mut op = operands[i].op;
        let offset = operands[i].offset;

        if offset != 0 {
            if op.is_of_type(RegType::Vgpr) {
                let d = bld.def(RegClass::V1);
                let t = d.get_temp();
                bld.vop2(Opcode::v_lshrrev_b32, &[d], &[Operand::c32(offset * 8), op]);
                op = Operand::temp(t);
            } else {
                let d = bld.def(RegClass::S1);
                let scc_def = bld.def_fixed(RegClass::S1, SCC);
                let t = d.get_temp();
                bld.sop2(Opcode::s_lshr_b32, &[d, scc_def], &[op, Operand::c32(offset * 8)]);
                op = Operand::temp(t);
            }
        }

        if curr.is_of_type(RegType::Sgpr) && (op.is_of_type(RegType::Sgpr) || op.is_literal()) {
            let d = bld.def(RegClass::V1);
            let t = d.get_temp();
            bld.copy(d, op);
            op = Operand::temp(t);
        } else if op.is_literal() {
            let d = bld.def(RegClass::S1);
            let t = d.get_temp();
            bld.copy(d, op);
            op = Operand::temp(t);
        }

        let last = i + 1 == operands.len();
        let next = if last { def } else { bld.def(RegClass::V1) };
        let bytes = if last { 4 - packed_bytes } else { operands[i].bytes };
        let next_tmp = next.get_temp();
        bld.vop3(Opcode::v_alignbyte_b32, &[next], &[op, curr, Operand::c32(bytes)]);
        curr = Operand::temp(next_tmp);
        packed_bytes += bytes;
    }
}

fn emit_split_vector(bld: &mut Builder, mut instr: Instruction) {
    let needs_lowering = instr.definitions.iter().any(|def| def.reg_class().is_subdword());
    if !needs_lowering {
        bld.insert(instr);
        return;
    }

    let mut info = OpInfo { op: dword_op(instr.operands[0], true), offset: 0, bytes: 0 };
    let defs: Vec<Definition> = instr.definitions.drain(..).collect();
    for def in defs {
        info.bytes = def.bytes();
        emit_pack(bld, dword_def(def), vec![info]);
        info.offset += def.bytes();
    }
}

fn emit_create_vector(bld: &mut Builder, mut instr: Instruction) {
    instr.definitions[0] = dword_def(instr.definitions[0]);
    let needs_lowering = instr
        .operands
        .iter()
        .any(|op| (op.has_reg_class() && op.reg_class().is_subdword()) || op.bytes() < 4);
    if !needs_lowering {
        bld.insert(instr);
        return;
    }

    let operands: Vec<OpInfo> = instr
        .operands
        .iter()
        .map(|op| OpInfo { op: dword_op(*op, true), offset: 0, bytes: op.bytes() })
        .collect();
    emit_pack(bld, instr.definitions[0], operands);
}

fn process_block(program: &mut Program, block_idx: usize) {
    let old_instructions = std::mem::take(&mut program.blocks[block_idx].instructions);
    let mut instructions = Vec::with_capacity(old_instructions.len());
    let mut bld = Builder::new(program, &mut instructions);

    for mut instr in old_instructions {
        if instr.opcode == Opcode::p_split_vector {
            emit_split_vector(&mut bld, instr);
        } else if instr.opcode == Opcode::p_create_vector {
            emit_create_vector(&mut bld, instr);
        } else if instr.opcode == Opcode::p_extract_vector
            && instr.definitions[0].reg_class().is_subdword()
        {
            let def = instr.definitions[0];
            let offset = def.bytes() * instr.operands[1].constant_value();
            let info =
                OpInfo { op: dword_op(instr.operands[0], true), offset, bytes: def.bytes() };
            emit_pack(&mut bld, dword_def(def), vec![info]);
        } else {
            let is_pseudo = instr.is_pseudo();
            for def in instr.definitions.iter_mut() {
                *def = dword_def(*def);
            }
            for op in instr.operands.iter_mut() {
                *op = dword_op(*op, is_pseudo);
            }
            bld.insert(instr);
        }
    }

    program.blocks[block_idx].instructions = instructions;
}

/// Rewrite subdword vector pseudo operations into dword operations.
pub fn lower_subdword(program: &mut Program) {
    for block_idx in 0..program.blocks.len() {
        process_block(program, block_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ChipClass, Stage};

    fn one_block() -> Program {
        let mut program = Program::new(ChipClass::Gfx9, 64, Stage::HW_CS);
        program.create_and_insert_block();
        program
    }

    #[test]
    fn subdword_extract_becomes_shift() {
        let mut program = one_block();
        let src = program.alloc_tmp(RegClass::V1);
        let def = program.alloc_tmp(RegClass::vgpr_bytes(2));
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut extract = Instruction::new(Opcode::p_extract_vector, Format::PSEUDO, 2, 1);
            extract.operands[0] = Operand::temp(src);
            extract.operands[1] = Operand::c32(1);
            extract.definitions[0] = Definition::new(def);
            bld.insert(extract);
        }
        program.blocks[0].instructions = instrs;

        lower_subdword(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].opcode, Opcode::v_lshrrev_b32);
        assert_eq!(instrs[0].operands[0].constant_value(), 16);
        // The definition was widened to a full dword.
        assert!(!instrs[0].definitions[0].reg_class().is_subdword());
    }

    #[test]
    fn create_vector_packs_with_alignbyte() {
        let mut program = one_block();
        let a = program.alloc_tmp(RegClass::vgpr_bytes(2));
        let b = program.alloc_tmp(RegClass::vgpr_bytes(2));
        let def = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut create = Instruction::new(Opcode::p_create_vector, Format::PSEUDO, 2, 1);
            create.operands[0] = Operand::temp(a);
            create.operands[1] = Operand::temp(b);
            create.definitions[0] = Definition::new(def);
            bld.insert(create);
        }
        program.blocks[0].instructions = instrs;

        lower_subdword(&mut program);

        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs[0].opcode, Opcode::v_lshlrev_b32);
        let align = instrs.last().unwrap();
        assert_eq!(align.opcode, Opcode::v_alignbyte_b32);
        assert_eq!(align.definitions[0].get_temp(), def);
        assert_eq!(align.operands[2].constant_value(), 2);
    }

    #[test]
    fn undef_bytes_become_dont_care_zeros() {
        let mut program = one_block();
        let b = program.alloc_tmp(RegClass::vgpr_bytes(2));
        let def = program.alloc_tmp(RegClass::V1);
        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            let mut create = Instruction::new(Opcode::p_create_vector, Format::PSEUDO, 2, 1);
            create.operands[0] = Operand::undef(RegClass::vgpr_bytes(2));
            create.operands[1] = Operand::temp(b);
            create.definitions[0] = Definition::new(def);
            bld.insert(create);
        }
        program.blocks[0].instructions = instrs;

        lower_subdword(&mut program);

        // The undefined low half collapses to a zero constant, so the whole
        // pack is a single alignbyte.
        let instrs = &program.blocks[0].instructions;
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].opcode, Opcode::v_alignbyte_b32);
        assert!(instrs[0].operands[1].is_constant());
        assert_eq!(instrs[0].operands[2].constant_value(), 2);
    }
}
