//! Opcode definitions and per-chip encoding tables.
//!
//! Every opcode is declared once in the table below, which yields the enum,
//! the mnemonic, the base format, three hardware opcode indices (GFX6-7,
//! GFX8-9, GFX10-11; -1 means the opcode cannot be encoded on that
//! generation) and the property flags. Pseudo opcodes have no encodings and
//! must be lowered before assembly.

use super::Format;
use std::fmt;

bitflags::bitflags! {
    /// Static per-opcode properties.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// Input neg/abs modifiers are meaningful.
        const INPUT_MODS = 1 << 0;
        /// Output omod/clamp modifiers are meaningful.
        const OUTPUT_MODS = 1 << 1;
        /// Executes on the transcendental unit.
        const TRANS = 1 << 2;
    }
}

const N: OpFlags = OpFlags::empty();
const IM: OpFlags = OpFlags::INPUT_MODS;
const IOM: OpFlags = OpFlags::INPUT_MODS.union(OpFlags::OUTPUT_MODS);
const TR: OpFlags = OpFlags::TRANS.union(IOM);

/// Static information about one opcode.
#[derive(Debug)]
pub struct OpcodeInfo {
    /// The assembly mnemonic.
    pub mnemonic: &'static str,
    /// The native encoding format.
    pub format: Format,
    /// Hardware opcode index on GFX6-7, or -1.
    pub gfx7: i32,
    /// Hardware opcode index on GFX8-9, or -1.
    pub gfx9: i32,
    /// Hardware opcode index on GFX10-11, or -1.
    pub gfx10: i32,
    /// Property flags.
    pub flags: OpFlags,
}

macro_rules! opcodes {
    ($($name:ident = ($format:expr, $g7:expr, $g9:expr, $g10:expr, $flags:expr),)*) => {
        /// The operation of an instruction, named by its mnemonic.
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $(
                #[allow(missing_docs)]
                $name,
            )*
        }

        static OPCODE_INFO: &[OpcodeInfo] = &[
            $(
                OpcodeInfo {
                    mnemonic: stringify!($name),
                    format: $format,
                    gfx7: $g7,
                    gfx9: $g9,
                    gfx10: $g10,
                    flags: $flags,
                },
            )*
        ];
    };
}

opcodes! {
    // Scalar ALU: SOP1.
    s_mov_b32 = (Format::SOP1, 3, 0, 3, N),
    s_mov_b64 = (Format::SOP1, 4, 1, 4, N),
    s_not_b32 = (Format::SOP1, 7, 4, 7, N),
    s_not_b64 = (Format::SOP1, 8, 5, 8, N),
    s_wqm_b32 = (Format::SOP1, 9, 6, 9, N),
    s_wqm_b64 = (Format::SOP1, 10, 7, 10, N),
    s_brev_b32 = (Format::SOP1, 11, 8, 11, N),
    s_ff1_i32_b32 = (Format::SOP1, 19, 16, 19, N),
    s_ff1_i32_b64 = (Format::SOP1, 20, 17, 20, N),
    s_getpc_b64 = (Format::SOP1, 31, 28, 31, N),
    s_setpc_b64 = (Format::SOP1, 32, 29, 32, N),
    s_swappc_b64 = (Format::SOP1, 33, 30, 33, N),
    s_and_saveexec_b64 = (Format::SOP1, 36, 32, 36, N),
    s_or_saveexec_b64 = (Format::SOP1, 37, 33, 37, N),
    s_and_saveexec_b32 = (Format::SOP1, -1, -1, 30, N),
    s_or_saveexec_b32 = (Format::SOP1, -1, -1, 31, N),
    s_andn2_wrexec_b64 = (Format::SOP1, -1, 51, 55, N),
    s_andn2_wrexec_b32 = (Format::SOP1, -1, -1, 54, N),

    // Scalar ALU: SOP2.
    s_add_u32 = (Format::SOP2, 0, 0, 0, N),
    s_sub_u32 = (Format::SOP2, 1, 1, 1, N),
    s_add_i32 = (Format::SOP2, 2, 2, 2, N),
    s_sub_i32 = (Format::SOP2, 3, 3, 3, N),
    s_addc_u32 = (Format::SOP2, 4, 4, 4, N),
    s_subb_u32 = (Format::SOP2, 5, 5, 5, N),
    s_cselect_b32 = (Format::SOP2, 10, 8, 10, N),
    s_cselect_b64 = (Format::SOP2, 11, 9, 11, N),
    s_and_b32 = (Format::SOP2, 14, 12, 14, N),
    s_and_b64 = (Format::SOP2, 15, 13, 15, N),
    s_or_b32 = (Format::SOP2, 16, 14, 16, N),
    s_or_b64 = (Format::SOP2, 17, 15, 17, N),
    s_xor_b32 = (Format::SOP2, 18, 16, 18, N),
    s_xor_b64 = (Format::SOP2, 19, 17, 19, N),
    s_andn2_b32 = (Format::SOP2, 20, 18, 20, N),
    s_andn2_b64 = (Format::SOP2, 21, 19, 21, N),
    s_orn2_b32 = (Format::SOP2, 22, 20, 22, N),
    s_orn2_b64 = (Format::SOP2, 23, 21, 23, N),
    s_nand_b32 = (Format::SOP2, 24, 22, 24, N),
    s_nand_b64 = (Format::SOP2, 25, 23, 25, N),
    s_nor_b32 = (Format::SOP2, 26, 24, 26, N),
    s_nor_b64 = (Format::SOP2, 27, 25, 27, N),
    s_xnor_b32 = (Format::SOP2, 28, 26, 28, N),
    s_xnor_b64 = (Format::SOP2, 29, 27, 29, N),
    s_lshl_b32 = (Format::SOP2, 30, 28, 30, N),
    s_lshl_b64 = (Format::SOP2, 31, 29, 31, N),
    s_lshr_b32 = (Format::SOP2, 32, 30, 32, N),
    s_lshr_b64 = (Format::SOP2, 33, 31, 33, N),
    s_bfm_b32 = (Format::SOP2, 40, 34, 40, N),
    s_mul_i32 = (Format::SOP2, 38, 36, 38, N),
    s_lshl1_add_u32 = (Format::SOP2, -1, 46, 46, N),
    s_lshl2_add_u32 = (Format::SOP2, -1, 47, 47, N),
    s_lshl3_add_u32 = (Format::SOP2, -1, 48, 48, N),
    s_lshl4_add_u32 = (Format::SOP2, -1, 49, 49, N),

    // Scalar ALU: SOPK.
    s_movk_i32 = (Format::SOPK, 0, 0, 0, N),
    s_addk_i32 = (Format::SOPK, 15, 14, 15, N),
    s_mulk_i32 = (Format::SOPK, 16, 15, 16, N),
    s_waitcnt_vscnt = (Format::SOPK, -1, -1, 24, N),
    s_waitcnt_lgkmcnt = (Format::SOPK, -1, -1, 22, N),
    s_subvector_loop_begin = (Format::SOPK, -1, -1, 27, N),
    s_subvector_loop_end = (Format::SOPK, -1, -1, 28, N),

    // Scalar ALU: SOPP.
    s_nop = (Format::SOPP, 0, 0, 0, N),
    s_endpgm = (Format::SOPP, 1, 1, 1, N),
    s_branch = (Format::SOPP, 2, 2, 2, N),
    s_cbranch_scc0 = (Format::SOPP, 4, 4, 4, N),
    s_cbranch_scc1 = (Format::SOPP, 5, 5, 5, N),
    s_cbranch_vccz = (Format::SOPP, 6, 6, 6, N),
    s_cbranch_vccnz = (Format::SOPP, 7, 7, 7, N),
    s_cbranch_execz = (Format::SOPP, 8, 8, 8, N),
    s_cbranch_execnz = (Format::SOPP, 9, 9, 9, N),
    s_waitcnt = (Format::SOPP, 12, 12, 12, N),
    s_sleep = (Format::SOPP, 14, 14, 14, N),
    s_code_end = (Format::SOPP, -1, -1, 31, N),
    s_waitcnt_depctr = (Format::SOPP, -1, -1, 35, N),
    s_delay_alu = (Format::SOPP, -1, -1, 55, N),

    // Scalar ALU: SOPC.
    s_cmp_eq_i32 = (Format::SOPC, 0, 0, 0, N),
    s_cmp_lg_i32 = (Format::SOPC, 1, 1, 1, N),
    s_cmp_gt_i32 = (Format::SOPC, 2, 2, 2, N),
    s_cmp_ge_i32 = (Format::SOPC, 3, 3, 3, N),
    s_cmp_lt_i32 = (Format::SOPC, 4, 4, 4, N),
    s_cmp_le_i32 = (Format::SOPC, 5, 5, 5, N),
    s_cmp_eq_u32 = (Format::SOPC, 6, 6, 6, N),
    s_cmp_lg_u32 = (Format::SOPC, 7, 7, 7, N),

    // Scalar memory.
    s_load_dword = (Format::SMEM, 0, 0, 0, N),
    s_load_dwordx2 = (Format::SMEM, 1, 1, 1, N),
    s_load_dwordx4 = (Format::SMEM, 2, 2, 2, N),
    s_load_dwordx8 = (Format::SMEM, 3, 3, 3, N),
    s_buffer_load_dword = (Format::SMEM, 8, 8, 8, N),
    s_buffer_load_dwordx2 = (Format::SMEM, 9, 9, 9, N),
    s_buffer_load_dwordx4 = (Format::SMEM, 10, 10, 10, N),
    s_dcache_wb = (Format::SMEM, -1, 33, 33, N),

    // Vector ALU: VOP2.
    v_cndmask_b32 = (Format::VOP2, 0, 0, 1, N),
    v_add_f32 = (Format::VOP2, 3, 1, 3, IOM),
    v_sub_f32 = (Format::VOP2, 4, 2, 4, IOM),
    v_subrev_f32 = (Format::VOP2, 5, 3, 5, IOM),
    v_mul_f32 = (Format::VOP2, 8, 5, 8, IOM),
    v_min_f32 = (Format::VOP2, 15, 10, 15, IOM),
    v_max_f32 = (Format::VOP2, 16, 11, 16, IOM),
    v_min_i32 = (Format::VOP2, 17, 12, 17, N),
    v_max_i32 = (Format::VOP2, 18, 13, 18, N),
    v_min_u32 = (Format::VOP2, 19, 14, 19, N),
    v_max_u32 = (Format::VOP2, 20, 15, 20, N),
    v_lshrrev_b32 = (Format::VOP2, 22, 16, 22, N),
    v_ashrrev_i32 = (Format::VOP2, 24, 17, 24, N),
    v_lshlrev_b32 = (Format::VOP2, 26, 18, 26, N),
    v_and_b32 = (Format::VOP2, 27, 19, 27, N),
    v_or_b32 = (Format::VOP2, 28, 20, 28, N),
    v_xor_b32 = (Format::VOP2, 29, 21, 29, N),
    v_mac_f32 = (Format::VOP2, 31, 22, 31, IOM),
    v_madmk_f32 = (Format::VOP2, 32, 23, 32, N),
    v_madak_f32 = (Format::VOP2, 33, 24, 33, N),
    v_add_co_u32 = (Format::VOP2, 37, 25, -1, N),
    v_add_u32 = (Format::VOP2, -1, 52, 37, N),
    v_min_f16 = (Format::VOP2, -1, 45, 50, IOM),
    v_max_f16 = (Format::VOP2, -1, 44, 49, IOM),
    v_min_i16 = (Format::VOP2, -1, 50, 53, N),
    v_max_i16 = (Format::VOP2, -1, 48, 52, N),
    v_min_u16 = (Format::VOP2, -1, 49, 54, N),
    v_max_u16 = (Format::VOP2, -1, 47, 51, N),
    v_readlane_b32 = (Format::VOP2, 39, 40, -1, N),
    v_writelane_b32 = (Format::VOP2, 41, 41, -1, N),

    // Vector ALU: VOP1.
    v_nop = (Format::VOP1, 0, 0, 0, N),
    v_mov_b32 = (Format::VOP1, 1, 1, 1, N),
    v_readfirstlane_b32 = (Format::VOP1, 2, 2, 2, N),
    v_exp_f32 = (Format::VOP1, 37, 32, 37, TR),
    v_log_f32 = (Format::VOP1, 39, 33, 39, TR),
    v_rcp_f32 = (Format::VOP1, 42, 34, 42, TR),
    v_rsq_f32 = (Format::VOP1, 46, 36, 46, TR),
    v_sqrt_f32 = (Format::VOP1, 51, 39, 51, TR),
    v_bfrev_b32 = (Format::VOP1, 56, 44, 56, N),
    v_swap_b32 = (Format::VOP1, -1, 81, 101, N),

    // Vector ALU: VOPC.
    v_cmp_lt_f32 = (Format::VOPC, 1, 65, 1, IM),
    v_cmp_eq_f32 = (Format::VOPC, 2, 66, 2, IM),
    v_cmp_le_f32 = (Format::VOPC, 3, 67, 3, IM),
    v_cmp_gt_f32 = (Format::VOPC, 4, 68, 4, IM),
    v_cmp_lg_f32 = (Format::VOPC, 5, 69, 5, IM),
    v_cmp_ge_f32 = (Format::VOPC, 6, 70, 6, IM),
    v_cmp_o_f32 = (Format::VOPC, 7, 71, 7, IM),
    v_cmp_u_f32 = (Format::VOPC, 8, 72, 8, IM),
    v_cmp_nge_f32 = (Format::VOPC, 9, 73, 9, IM),
    v_cmp_nlg_f32 = (Format::VOPC, 10, 74, 10, IM),
    v_cmp_ngt_f32 = (Format::VOPC, 11, 75, 11, IM),
    v_cmp_nle_f32 = (Format::VOPC, 12, 76, 12, IM),
    v_cmp_neq_f32 = (Format::VOPC, 13, 77, 13, IM),
    v_cmp_nlt_f32 = (Format::VOPC, 14, 78, 14, IM),
    v_cmp_lt_i32 = (Format::VOPC, 129, 193, 129, N),
    v_cmp_gt_i32 = (Format::VOPC, 132, 196, 132, N),
    v_cmp_lg_u32 = (Format::VOPC, 197, 213, 197, N),

    // Vector ALU: native VOP3.
    v_mad_f32 = (Format::VOP3, 321, 449, 321, IOM),
    v_fma_f32 = (Format::VOP3, 331, 459, 331, IOM),
    v_alignbyte_b32 = (Format::VOP3, 335, 463, 335, N),
    v_min3_f32 = (Format::VOP3, 337, 465, 337, IOM),
    v_min3_i32 = (Format::VOP3, 338, 466, 338, N),
    v_min3_u32 = (Format::VOP3, 339, 467, 339, N),
    v_max3_f32 = (Format::VOP3, 340, 468, 340, IOM),
    v_max3_i32 = (Format::VOP3, 341, 469, 341, N),
    v_max3_u32 = (Format::VOP3, 342, 470, 342, N),
    v_med3_f32 = (Format::VOP3, 343, 471, 343, IOM),
    v_med3_i32 = (Format::VOP3, 344, 472, 344, N),
    v_med3_u32 = (Format::VOP3, 345, 473, 345, N),
    v_min3_f16 = (Format::VOP3, -1, 497, 353, IOM),
    v_min3_i16 = (Format::VOP3, -1, 498, 354, N),
    v_min3_u16 = (Format::VOP3, -1, 499, 355, N),
    v_max3_f16 = (Format::VOP3, -1, 500, 356, IOM),
    v_max3_i16 = (Format::VOP3, -1, 501, 357, N),
    v_max3_u16 = (Format::VOP3, -1, 502, 358, N),
    v_med3_f16 = (Format::VOP3, -1, 503, 359, IOM),
    v_med3_i16 = (Format::VOP3, -1, 504, 360, N),
    v_med3_u16 = (Format::VOP3, -1, 505, 361, N),
    v_xad_u32 = (Format::VOP3, -1, 519, 325, N),
    v_add3_u32 = (Format::VOP3, -1, 511, 365, N),
    v_lshl_add_u32 = (Format::VOP3, -1, 509, 326, N),
    v_add_lshl_u32 = (Format::VOP3, -1, 510, 327, N),
    v_lshl_or_b32 = (Format::VOP3, -1, 512, 367, N),
    v_and_or_b32 = (Format::VOP3, -1, 513, 369, N),
    v_or3_b32 = (Format::VOP3, -1, 514, 376, N),
    v_mul_lo_u32 = (Format::VOP3, 361, 645, 361, N),
    v_div_fmas_f32 = (Format::VOP3, 367, 482, 367, IOM),
    v_div_fmas_f64 = (Format::VOP3, 368, 483, 368, IOM),
    v_readlane_b32_e64 = (Format::VOP3, -1, -1, 352, N),
    v_writelane_b32_e64 = (Format::VOP3, -1, -1, 353, N),
    v_permlane16_b32 = (Format::VOP3, -1, -1, 887, N),
    v_permlanex16_b32 = (Format::VOP3, -1, -1, 888, N),

    // Interpolation.
    v_interp_p1_f32 = (Format::VINTRP, 0, 0, 0, N),
    v_interp_p2_f32 = (Format::VINTRP, 1, 1, 1, N),
    v_interp_mov_f32 = (Format::VINTRP, 2, 2, 2, N),

    // LDS.
    ds_write_b32 = (Format::DS, 13, 13, 13, N),
    ds_write2_b32 = (Format::DS, 14, 14, 14, N),
    ds_read_b32 = (Format::DS, 54, 54, 54, N),
    ds_read2_b32 = (Format::DS, 55, 55, 55, N),
    ds_write_b64 = (Format::DS, 77, 77, 77, N),
    ds_write2_b64 = (Format::DS, 78, 78, 78, N),
    ds_read_b64 = (Format::DS, 118, 118, 118, N),
    ds_read2_b64 = (Format::DS, 119, 119, 119, N),
    ds_swizzle_b32 = (Format::DS, 53, 61, 53, N),
    ds_bpermute_b32 = (Format::DS, -1, 63, 63, N),

    // Untyped buffer.
    buffer_load_format_x = (Format::MUBUF, 0, 0, 0, N),
    buffer_load_dword = (Format::MUBUF, 12, 20, 12, N),
    buffer_load_dwordx2 = (Format::MUBUF, 13, 21, 13, N),
    buffer_load_dwordx4 = (Format::MUBUF, 14, 23, 14, N),
    buffer_store_dword = (Format::MUBUF, 28, 24, 28, N),
    buffer_store_dwordx2 = (Format::MUBUF, 29, 25, 29, N),
    buffer_store_dwordx4 = (Format::MUBUF, 30, 27, 30, N),
    buffer_atomic_add = (Format::MUBUF, 50, 66, 50, N),

    // Typed buffer.
    tbuffer_load_format_x = (Format::MTBUF, 0, 0, 0, N),
    tbuffer_load_format_xyzw = (Format::MTBUF, 3, 3, 3, N),
    tbuffer_store_format_x = (Format::MTBUF, 4, 4, 4, N),
    tbuffer_store_format_xyzw = (Format::MTBUF, 7, 7, 7, N),

    // Image.
    image_load = (Format::MIMG, 0, 0, 0, N),
    image_store = (Format::MIMG, 8, 8, 8, N),
    image_atomic_cmpswap = (Format::MIMG, 17, 17, 17, N),
    image_sample = (Format::MIMG, 32, 32, 32, N),

    // FLAT/GLOBAL/SCRATCH.
    flat_load_dword = (Format::FLAT, 8, 20, 8, N),
    flat_store_dword = (Format::FLAT, 24, 28, 24, N),
    global_load_dword = (Format::GLOBAL, -1, 20, 8, N),
    global_store_dword = (Format::GLOBAL, -1, 28, 24, N),
    scratch_load_dword = (Format::SCRATCH, -1, 20, 8, N),
    scratch_store_dword = (Format::SCRATCH, -1, 28, 24, N),

    // Export.
    exp = (Format::EXP, 0, 0, 0, N),

    // Pseudo instructions. Never survive past lowering; no encodings.
    p_startpgm = (Format::PSEUDO, -1, -1, -1, N),
    p_phi = (Format::PSEUDO, -1, -1, -1, N),
    p_linear_phi = (Format::PSEUDO, -1, -1, -1, N),
    p_parallelcopy = (Format::PSEUDO, -1, -1, -1, N),
    p_wqm = (Format::PSEUDO, -1, -1, -1, N),
    p_as_uniform = (Format::PSEUDO, -1, -1, -1, N),
    p_create_vector = (Format::PSEUDO, -1, -1, -1, N),
    p_extract_vector = (Format::PSEUDO, -1, -1, -1, N),
    p_split_vector = (Format::PSEUDO, -1, -1, -1, N),
    p_logical_start = (Format::PSEUDO, -1, -1, -1, N),
    p_logical_end = (Format::PSEUDO, -1, -1, -1, N),
    p_spill = (Format::PSEUDO, -1, -1, -1, N),
    p_reload = (Format::PSEUDO, -1, -1, -1, N),
    p_constaddr = (Format::PSEUDO, -1, -1, -1, N),
    p_discard_if = (Format::PSEUDO, -1, -1, -1, N),
    p_demote_to_helper = (Format::PSEUDO, -1, -1, -1, N),
    p_is_helper = (Format::PSEUDO, -1, -1, -1, N),
    p_exit_early_if_not = (Format::PSEUDO, -1, -1, -1, N),
    p_end_wqm = (Format::PSEUDO, -1, -1, -1, N),
    p_elect = (Format::PSEUDO, -1, -1, -1, N),
    p_branch = (Format::PSEUDO_BRANCH, -1, -1, -1, N),
    p_cbranch_z = (Format::PSEUDO_BRANCH, -1, -1, -1, N),
    p_cbranch_nz = (Format::PSEUDO_BRANCH, -1, -1, -1, N),
    p_memory_barrier = (Format::PSEUDO_BARRIER, -1, -1, -1, N),
    p_reduce = (Format::PSEUDO_REDUCTION, -1, -1, -1, N),
    p_inclusive_scan = (Format::PSEUDO_REDUCTION, -1, -1, -1, N),
    p_exclusive_scan = (Format::PSEUDO_REDUCTION, -1, -1, -1, N),
}

impl Opcode {
    /// Static information for this opcode.
    pub fn info(self) -> &'static OpcodeInfo {
        &OPCODE_INFO[self as usize]
    }

    /// Whether input neg/abs modifiers are meaningful.
    pub fn can_use_input_modifiers(self) -> bool {
        self.info().flags.contains(OpFlags::INPUT_MODS)
    }

    /// Whether output omod/clamp modifiers are meaningful.
    pub fn can_use_output_modifiers(self) -> bool {
        self.info().flags.contains(OpFlags::OUTPUT_MODS)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.info().mnemonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup() {
        assert_eq!(Opcode::s_mov_b32.info().gfx9, 0);
        assert_eq!(Opcode::s_mov_b32.info().gfx7, 3);
        assert_eq!(Opcode::s_mov_b32.info().format, Format::SOP1);
        assert_eq!(Opcode::v_mad_f32.info().format, Format::VOP3);
        assert_eq!(Opcode::s_andn2_wrexec_b64.info().gfx7, -1);
        assert_eq!(Opcode::p_phi.info().gfx10, -1);
        assert_eq!(Opcode::v_mov_b32.to_string(), "v_mov_b32");
    }

    #[test]
    fn modifier_flags() {
        assert!(Opcode::v_add_f32.can_use_input_modifiers());
        assert!(Opcode::v_add_f32.can_use_output_modifiers());
        assert!(!Opcode::v_and_b32.can_use_input_modifiers());
        assert!(Opcode::v_cmp_lt_f32.can_use_input_modifiers());
        assert!(!Opcode::v_cmp_lt_f32.can_use_output_modifiers());
        assert!(Opcode::v_rcp_f32.info().flags.contains(OpFlags::TRANS));
    }
}
