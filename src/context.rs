//! Compilation context and main entry point.
//!
//! The context owns the program being compiled and runs the pass pipeline
//! in its fixed order; each pass relies on invariants established by the
//! earlier ones. The structural validator runs between passes when the
//! `validate` configuration flag is set, the register-allocation checks
//! when `validate_ra` is set. Compilation is single-threaded and
//! deterministic: the same program in produces the same bytes out.

use crate::assembler::emit_program;
use crate::dominance::dominator_tree;
use crate::insert_delay_alu::{combine_delay_alu, insert_delay_alu};
use crate::insert_exec_mask::insert_exec_mask;
use crate::insert_nops::insert_nops;
use crate::ir::{ChipClass, Program};
use crate::jump_threading::{jump_threading, lower_branches};
use crate::live_vars::live_var_analysis;
use crate::lower_cssa::lower_to_cssa;
use crate::lower_subdword::lower_subdword;
use crate::lower_to_hw::lower_to_hw;
use crate::optimizer::optimize;
use crate::ssa_elimination::ssa_elimination;
use crate::validate::{validate, validate_ra};
use crate::value_numbering::value_numbering;
use crate::CodegenResult;

/// Persistent data structures and the compilation pipeline.
pub struct Context {
    /// The program being compiled.
    pub program: Program,
}

impl Context {
    /// A context wrapping an existing program.
    pub fn for_program(program: Program) -> Self {
        Self { program }
    }

    fn verify_if(&self) -> CodegenResult<()> {
        validate(&self.program)
    }

    /// Run the whole pass pipeline and emit machine code into `code`.
    ///
    /// Returns the size of the executable portion in bytes (excluding the
    /// prefetch padding and the constant-data tail). Block offsets are left
    /// on the program for loader metadata.
    pub fn compile_and_emit(&mut self, code: &mut Vec<u32>) -> CodegenResult<usize> {
        let program = &mut self.program;
        log::debug!(
            "compiling program: {} blocks, {:?}, wave{}",
            program.blocks.len(),
            program.chip_class,
            program.wave_size
        );

        let live = live_var_analysis(program);
        program.live = Some(live);

        dominator_tree(program)?;
        self.verify_if()?;

        value_numbering(&mut self.program);
        optimize(&mut self.program);
        self.verify_if()?;

        lower_to_cssa(&mut self.program)?;
        ssa_elimination(&mut self.program);
        self.verify_if()?;

        lower_subdword(&mut self.program);

        insert_exec_mask(&mut self.program);
        // Exec-mask insertion materializes linear phis for loop masks; they
        // lower like any other phi.
        ssa_elimination(&mut self.program);
        self.verify_if()?;

        jump_threading(&mut self.program);
        lower_branches(&mut self.program)?;
        validate_ra(&mut self.program)?;

        lower_to_hw(&mut self.program)?;
        self.verify_if()?;

        insert_nops(&mut self.program);
        if self.program.chip_class >= ChipClass::Gfx11 {
            insert_delay_alu(&mut self.program);
            combine_delay_alu(&mut self.program);
        }

        emit_program(&mut self.program, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Builder, Definition, Format, Instruction, Opcode, Operand, PhysReg, RegClass, Stage,
    };

    fn small_program(chip: ChipClass) -> Program {
        let mut program = Program::new(chip, 64, Stage::HW_CS);
        program.config.validate = true;
        let b = program.create_and_insert_block();
        program.blocks[b as usize].kind |= crate::ir::BlockKind::TOP_LEVEL;

        let mut instrs = Vec::new();
        {
            let mut bld = Builder::new(&mut program, &mut instrs);
            bld.pseudo(Opcode::p_startpgm, &[], &[]);
            bld.pseudo(Opcode::p_logical_start, &[], &[]);
            let a = Definition::fixed_temp(bld.tmp(RegClass::V1), PhysReg(256));
            let a_tmp = a.get_temp();
            bld.vop1(Opcode::v_mov_b32, &[a], &[Operand::c32(1)]);
            let sum = Definition::fixed_temp(bld.tmp(RegClass::V1), PhysReg(257));
            let sum_tmp = sum.get_temp();
            bld.vop2(
                Opcode::v_add_f32,
                &[sum],
                &[
                    Operand::fixed_temp(a_tmp, PhysReg(256)),
                    Operand::fixed_temp(a_tmp, PhysReg(256)),
                ],
            );
            let mut store = Instruction::new(Opcode::buffer_store_dword, Format::MUBUF, 4, 0);
            store.operands[0] = Operand::undef(RegClass::V1);
            store.operands[1] = Operand::fixed_temp(bld.tmp(RegClass::S4), PhysReg(8));
            store.operands[2] = Operand::c32(0);
            store.operands[3] = Operand::fixed_temp(sum_tmp, PhysReg(257));
            bld.insert(store);
            bld.pseudo(Opcode::p_logical_end, &[], &[]);
            bld.sopp(Opcode::s_endpgm, None, 0);
        }
        program.blocks[0].instructions = instrs;
        program
    }

    #[test]
    fn pipeline_produces_machine_code() {
        let mut ctx = Context::for_program(small_program(ChipClass::Gfx9));
        let mut code = Vec::new();
        let exec_size = ctx.compile_and_emit(&mut code).unwrap();

        assert!(exec_size > 0);
        assert_eq!(exec_size % 4, 0);
        assert!(!code.is_empty());
        // No pseudo instruction survives the pipeline.
        for block in &ctx.program.blocks {
            for instr in &block.instructions {
                assert!(!instr.is_pseudo());
            }
        }
        // The program still ends in s_endpgm.
        let last_word = code[exec_size / 4 - 1];
        assert_eq!(last_word, 0xBF81_0000);
    }

    #[test]
    fn compilation_is_deterministic() {
        let mut code1 = Vec::new();
        let mut code2 = Vec::new();
        Context::for_program(small_program(ChipClass::Gfx10))
            .compile_and_emit(&mut code1)
            .unwrap();
        Context::for_program(small_program(ChipClass::Gfx10))
            .compile_and_emit(&mut code2)
            .unwrap();
        assert_eq!(code1, code2);
    }

    #[test]
    fn gfx11_runs_the_delay_pass() {
        let mut ctx = Context::for_program(small_program(ChipClass::Gfx11));
        let mut code = Vec::new();
        ctx.compile_and_emit(&mut code).unwrap();
        // The add consumes the preceding mov's result, so a delay got
        // inserted in front of it.
        let has_delay = ctx
            .program
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .any(|i| i.opcode == Opcode::s_delay_alu);
        assert!(has_delay);
    }
}
