//! Intermediate representation for the shader backend.
//!
//! The IR is a flat list of [`Block`]s owned by a [`Program`]; every
//! cross-block relation goes through block indices, never pointers. Each
//! block carries two parallel edge lists: the **logical** CFG follows the
//! structured control flow of the source program, the **linear** CFG follows
//! every physical edge including diverged paths. Instructions are plain
//! records with a format tag selecting a variant payload; pseudo
//! instructions model operations (phis, parallel copies, reductions) that
//! later passes expand into real machine instructions.

use smallvec::SmallVec;
use std::fmt;

mod builder;
mod opcodes;

pub use builder::{Builder, WaveOp};
pub use opcodes::{OpFlags, Opcode, OpcodeInfo};

use crate::live_vars::{LiveInfo, RegisterDemand};

/// GPU generation, ordered: comparisons like `chip >= ChipClass::Gfx9` are
/// meaningful and used throughout the passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChipClass {
    /// Southern Islands.
    Gfx6,
    /// Sea Islands.
    Gfx7,
    /// Volcanic Islands.
    Gfx8,
    /// Vega.
    Gfx9,
    /// Navi 1x/2x.
    Gfx10,
    /// Navi 3x.
    Gfx11,
}

bitflags::bitflags! {
    /// Hardware pipeline role of the program.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Stage: u8 {
        /// Hardware vertex shader.
        const HW_VS = 1 << 0;
        /// Hardware fragment shader.
        const HW_FS = 1 << 1;
        /// Hardware compute shader.
        const HW_CS = 1 << 2;
        /// Hardware geometry shader.
        const HW_GS = 1 << 3;
    }
}

/// Register bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegType {
    /// Scalar general-purpose registers.
    Sgpr,
    /// Vector general-purpose registers.
    Vgpr,
}

/// A register class: bank, size and linearity.
///
/// Sizes are stored in bytes; classes whose size is not a multiple of four
/// are *subdword* and only survive until the subdword lowering pass. Linear
/// classes have live ranges that follow the linear CFG (lane masks, spill
/// lanes) rather than the logical one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegClass {
    ty: RegType,
    bytes: u8,
    linear: bool,
}

impl RegClass {
    /// One SGPR.
    pub const S1: RegClass = RegClass::new(RegType::Sgpr, 1);
    /// Two consecutive SGPRs.
    pub const S2: RegClass = RegClass::new(RegType::Sgpr, 2);
    /// Three consecutive SGPRs.
    pub const S3: RegClass = RegClass::new(RegType::Sgpr, 3);
    /// Four consecutive SGPRs.
    pub const S4: RegClass = RegClass::new(RegType::Sgpr, 4);
    /// Eight consecutive SGPRs.
    pub const S8: RegClass = RegClass::new(RegType::Sgpr, 8);
    /// One VGPR.
    pub const V1: RegClass = RegClass::new(RegType::Vgpr, 1);
    /// Two consecutive VGPRs.
    pub const V2: RegClass = RegClass::new(RegType::Vgpr, 2);
    /// Three consecutive VGPRs.
    pub const V3: RegClass = RegClass::new(RegType::Vgpr, 3);
    /// Four consecutive VGPRs.
    pub const V4: RegClass = RegClass::new(RegType::Vgpr, 4);

    /// A class of `dwords` whole registers in `ty`.
    pub const fn new(ty: RegType, dwords: u8) -> Self {
        Self { ty, bytes: dwords * 4, linear: false }
    }

    /// A subdword vector class of `bytes` bytes.
    pub const fn vgpr_bytes(bytes: u8) -> Self {
        Self { ty: RegType::Vgpr, bytes, linear: false }
    }

    /// Register bank of this class.
    pub fn ty(self) -> RegType {
        self.ty
    }

    /// Size in 4-byte registers, rounding subdword classes up.
    pub fn size(self) -> u32 {
        (self.bytes as u32 + 3) / 4
    }

    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        self.bytes as u32
    }

    /// Whether the live range follows the linear CFG.
    pub fn is_linear(self) -> bool {
        self.linear || self.ty == RegType::Sgpr
    }

    /// Whether this class is smaller than a full register.
    pub fn is_subdword(self) -> bool {
        self.bytes % 4 != 0
    }

    /// The same class with linear live-range semantics.
    pub fn as_linear(self) -> Self {
        Self { linear: true, ..self }
    }
}

impl fmt::Debug for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bank = match self.ty {
            RegType::Sgpr => 's',
            RegType::Vgpr => 'v',
        };
        if self.is_subdword() {
            write!(f, "{}{}b", bank, self.bytes)?;
        } else {
            write!(f, "{}{}", bank, self.bytes / 4)?;
        }
        if self.linear {
            write!(f, ".lin")?;
        }
        Ok(())
    }
}

/// An SSA temporary: a monotonically allocated id plus its register class.
///
/// Id 0 is reserved to mean "no temporary" in definitions that only name a
/// physical register.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temp {
    id: u32,
    rc: RegClass,
}

impl Temp {
    /// Create a temp with a given id and class.
    pub fn new(id: u32, rc: RegClass) -> Self {
        Self { id, rc }
    }

    /// The SSA id.
    pub fn id(self) -> u32 {
        self.id
    }

    /// The register class.
    pub fn reg_class(self) -> RegClass {
        self.rc
    }

    /// The register bank.
    pub fn ty(self) -> RegType {
        self.rc.ty()
    }

    /// Size in registers.
    pub fn size(self) -> u32 {
        self.rc.size()
    }

    /// Size in bytes.
    pub fn bytes(self) -> u32 {
        self.rc.bytes()
    }

    /// Whether the live range follows the linear CFG.
    pub fn is_linear(self) -> bool {
        self.rc.is_linear()
    }
}

impl fmt::Debug for Temp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}:{:?}", self.id, self.rc)
    }
}

/// A flat physical register address.
///
/// SGPRs occupy 0..106, special scalar registers follow, VGPRs start at 256.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysReg(pub u32);

/// vcc low half.
pub const VCC: PhysReg = PhysReg(106);
/// vcc high half.
pub const VCC_HI: PhysReg = PhysReg(107);
/// m0.
pub const M0: PhysReg = PhysReg(124);
/// GFX10+ null scalar register: reads 0, writes are dropped.
pub const SGPR_NULL: PhysReg = PhysReg(125);
/// exec low half; also the address compared against whole-`exec` reads.
pub const EXEC: PhysReg = PhysReg(126);
/// exec low half.
pub const EXEC_LO: PhysReg = PhysReg(126);
/// exec high half.
pub const EXEC_HI: PhysReg = PhysReg(127);
/// The vccz pseudo-source.
pub const VCCZ: PhysReg = PhysReg(251);
/// The execz pseudo-source.
pub const EXECZ: PhysReg = PhysReg(252);
/// scc.
pub const SCC: PhysReg = PhysReg(253);

impl PhysReg {
    /// The raw register number.
    pub fn reg(self) -> u32 {
        self.0
    }

    /// The register `n` slots above this one.
    pub fn advance(self, n: u32) -> PhysReg {
        PhysReg(self.0 + n)
    }

    /// Whether this address names a VGPR.
    pub fn is_vgpr(self) -> bool {
        self.0 >= 256
    }
}

impl fmt::Debug for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            VCC => write!(f, "vcc"),
            VCC_HI => write!(f, "vcc_hi"),
            M0 => write!(f, "m0"),
            SGPR_NULL => write!(f, "null"),
            EXEC_LO => write!(f, "exec_lo"),
            EXEC_HI => write!(f, "exec_hi"),
            SCC => write!(f, "scc"),
            PhysReg(r) if r >= 256 => write!(f, "v{}", r - 256),
            PhysReg(r) => write!(f, "s{r}"),
        }
    }
}

/// Returns whether `regs[a_reg..a_reg+a_size]` and `regs[b_reg..b_reg+b_size]`
/// overlap.
pub fn regs_intersect(a_reg: PhysReg, a_size: u32, b_reg: PhysReg, b_size: u32) -> bool {
    if a_reg.0 > b_reg.0 {
        a_reg.0 - b_reg.0 < b_size
    } else {
        b_reg.0 - a_reg.0 < a_size
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum OperandKind {
    Undefined,
    Constant { value: u64, literal: bool },
    Temp(Temp),
}

/// An instruction operand.
///
/// One of: undefined, inline constant, 32-bit literal, or an SSA temporary;
/// any of these may additionally be fixed to a physical register. Kill flags
/// record the live-range discipline established by the front end.
#[derive(Clone, Copy, Debug)]
pub struct Operand {
    kind: OperandKind,
    rc: RegClass,
    reg: Option<PhysReg>,
    kill: bool,
    first_kill: bool,
}

/// Whether a 32-bit value can be encoded as an inline constant rather than a
/// trailing literal dword.
fn is_inline_constant(v: u32) -> bool {
    v <= 64
        || v >= 0xFFFF_FFF0
        || matches!(
            v,
            0x3f00_0000
                | 0xbf00_0000
                | 0x3f80_0000
                | 0xbf80_0000
                | 0x4000_0000
                | 0xc000_0000
                | 0x4080_0000
                | 0xc080_0000
        )
}

/// The hardware source address encoding an inline constant, or 255 for a
/// trailing literal.
fn constant_src_reg(v: u32, literal: bool) -> PhysReg {
    if literal {
        return PhysReg(255);
    }
    PhysReg(match v {
        0..=64 => 128 + v,
        0xFFFF_FFF0..=0xFFFF_FFFF => 192 + v.wrapping_neg(),
        0x3f00_0000 => 240,
        0xbf00_0000 => 241,
        0x3f80_0000 => 242,
        0xbf80_0000 => 243,
        0x4000_0000 => 244,
        0xc000_0000 => 245,
        0x4080_0000 => 246,
        0xc080_0000 => 247,
        _ => 255,
    })
}

impl Operand {
    /// An undefined operand of class `rc`.
    pub fn undef(rc: RegClass) -> Self {
        Self { kind: OperandKind::Undefined, rc, reg: None, kill: false, first_kill: false }
    }

    /// A 32-bit constant; becomes a literal when not inline-encodable.
    pub fn c32(v: u32) -> Self {
        let literal = !is_inline_constant(v);
        Self {
            kind: OperandKind::Constant { value: v as u64, literal },
            rc: RegClass::S1,
            reg: Some(constant_src_reg(v, literal)),
            kill: false,
            first_kill: false,
        }
    }

    /// A 64-bit constant. Only inline-encodable values are accepted here;
    /// larger values must be materialized by the front end.
    pub fn c64(v: u64) -> Self {
        Self {
            kind: OperandKind::Constant { value: v, literal: false },
            rc: RegClass::S2,
            reg: Some(constant_src_reg(v as u32, false)),
            kill: false,
            first_kill: false,
        }
    }

    /// `c32` or `c64` of the sign-extended value, by lane-mask width.
    pub fn c32_or_c64(v: u32, is64: bool) -> Self {
        if is64 {
            Self::c64(v as i32 as i64 as u64)
        } else {
            Self::c32(v)
        }
    }

    /// The zero constant of `bytes` size.
    pub fn zero(bytes: u32) -> Self {
        Self::c32_or_c64(0, bytes == 8)
    }

    /// An SSA temporary.
    pub fn temp(t: Temp) -> Self {
        Self { kind: OperandKind::Temp(t), rc: t.reg_class(), reg: None, kill: false, first_kill: false }
    }

    /// A temporary fixed to a physical register.
    pub fn fixed_temp(t: Temp, reg: PhysReg) -> Self {
        Self { reg: Some(reg), ..Self::temp(t) }
    }

    /// A bare physical register of class `rc` (no SSA identity).
    pub fn fixed(reg: PhysReg, rc: RegClass) -> Self {
        Self { kind: OperandKind::Temp(Temp::new(0, rc)), rc, reg: Some(reg), kill: false, first_kill: false }
    }

    /// Whether this operand names a temporary (including bare registers).
    pub fn is_temp(&self) -> bool {
        matches!(self.kind, OperandKind::Temp(t) if t.id() != 0)
    }

    /// Whether this operand is undefined.
    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, OperandKind::Undefined)
    }

    /// Whether this operand is a constant (inline or literal).
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, OperandKind::Constant { .. })
    }

    /// Whether this operand is a literal constant.
    pub fn is_literal(&self) -> bool {
        matches!(self.kind, OperandKind::Constant { literal: true, .. })
    }

    /// Whether this operand is fixed to a physical register.
    pub fn is_fixed(&self) -> bool {
        self.reg.is_some()
    }

    /// Whether this operand carries a register class (anything non-constant).
    pub fn has_reg_class(&self) -> bool {
        !self.is_constant()
    }

    /// The temporary. Panics on constants and undefs.
    pub fn get_temp(&self) -> Temp {
        match self.kind {
            OperandKind::Temp(t) => t,
            _ => panic!("operand is not a temp"),
        }
    }

    /// The temporary's id, or 0.
    pub fn temp_id(&self) -> u32 {
        match self.kind {
            OperandKind::Temp(t) => t.id(),
            _ => 0,
        }
    }

    /// Replace the temporary, keeping flags and fixed register.
    pub fn set_temp(&mut self, t: Temp) {
        self.kind = OperandKind::Temp(t);
        self.rc = t.reg_class();
    }

    /// The register class.
    pub fn reg_class(&self) -> RegClass {
        self.rc
    }

    /// The fixed physical register; `PhysReg(0)` when unfixed.
    pub fn phys_reg(&self) -> PhysReg {
        self.reg.unwrap_or(PhysReg(0))
    }

    /// Fix the operand to a physical register.
    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.reg = Some(reg);
    }

    /// The constant value truncated to 32 bits.
    pub fn constant_value(&self) -> u32 {
        match self.kind {
            OperandKind::Constant { value, .. } => value as u32,
            _ => panic!("operand is not a constant"),
        }
    }

    /// The full 64-bit constant value.
    pub fn constant_value64(&self) -> u64 {
        match self.kind {
            OperandKind::Constant { value, .. } => value,
            _ => panic!("operand is not a constant"),
        }
    }

    /// Whether this is a constant equal to `v`.
    pub fn constant_equals(&self, v: u32) -> bool {
        matches!(self.kind, OperandKind::Constant { value, .. } if value == v as u64)
    }

    /// Size in registers.
    pub fn size(&self) -> u32 {
        self.rc.size()
    }

    /// Size in bytes.
    pub fn bytes(&self) -> u32 {
        self.rc.bytes()
    }

    /// Whether the operand lives in bank `ty`.
    pub fn is_of_type(&self, ty: RegType) -> bool {
        self.has_reg_class() && self.rc.ty() == ty
    }

    /// Kill flag: the value dies at this use.
    pub fn is_kill(&self) -> bool {
        self.kill
    }

    /// Set the kill flag.
    pub fn set_kill(&mut self, kill: bool) {
        self.kill = kill;
        if !kill {
            self.first_kill = false;
        }
    }

    /// First-kill flag.
    pub fn is_first_kill(&self) -> bool {
        self.first_kill
    }

    /// Set the first-kill flag.
    pub fn set_first_kill(&mut self, fk: bool) {
        self.first_kill = fk;
        if fk {
            self.kill = true;
        }
    }
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.rc == other.rc && self.reg == other.reg
    }
}

/// An instruction definition: a temporary, an optional fixed register, and a
/// kill flag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Definition {
    temp: Temp,
    reg: Option<PhysReg>,
    kill: bool,
}

impl Definition {
    /// A definition of an SSA temporary.
    pub fn new(t: Temp) -> Self {
        Self { temp: t, reg: None, kill: false }
    }

    /// A register-only definition (no SSA identity).
    pub fn fixed(reg: PhysReg, rc: RegClass) -> Self {
        Self { temp: Temp::new(0, rc), reg: Some(reg), kill: false }
    }

    /// A temporary fixed to a physical register.
    pub fn fixed_temp(t: Temp, reg: PhysReg) -> Self {
        Self { temp: t, reg: Some(reg), kill: false }
    }

    /// Whether this definition has an SSA identity.
    pub fn is_temp(&self) -> bool {
        self.temp.id() != 0
    }

    /// The temporary.
    pub fn get_temp(&self) -> Temp {
        self.temp
    }

    /// The temporary's id.
    pub fn temp_id(&self) -> u32 {
        self.temp.id()
    }

    /// Replace the temporary.
    pub fn set_temp(&mut self, t: Temp) {
        self.temp = t;
    }

    /// The register class.
    pub fn reg_class(&self) -> RegClass {
        self.temp.reg_class()
    }

    /// Whether the definition is fixed to a physical register.
    pub fn is_fixed(&self) -> bool {
        self.reg.is_some()
    }

    /// The fixed physical register; `PhysReg(0)` when unfixed.
    pub fn phys_reg(&self) -> PhysReg {
        self.reg.unwrap_or(PhysReg(0))
    }

    /// Fix the definition to a physical register.
    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.reg = Some(reg);
    }

    /// Size in registers.
    pub fn size(&self) -> u32 {
        self.temp.size()
    }

    /// Size in bytes.
    pub fn bytes(&self) -> u32 {
        self.temp.bytes()
    }

    /// Kill flag.
    pub fn is_kill(&self) -> bool {
        self.kill
    }

    /// Set the kill flag.
    pub fn set_kill(&mut self, kill: bool) {
        self.kill = kill;
    }
}

/// Instruction format tag.
///
/// Base formats are enumerated values; the VOP3, DPP and SDWA encodings are
/// modifier bits OR-ed onto a vector-ALU base, so `VOP2 | VOP3` is the
/// VOP3-encoded form of a VOP2 opcode. Hand-rolled newtype in the manner of
/// a flags word since the base values and the modifier bits mix.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format(u16);

#[allow(missing_docs)]
impl Format {
    pub const PSEUDO: Format = Format(0);
    pub const SOP1: Format = Format(1);
    pub const SOP2: Format = Format(2);
    pub const SOPK: Format = Format(3);
    pub const SOPP: Format = Format(4);
    pub const SOPC: Format = Format(5);
    pub const SMEM: Format = Format(6);
    pub const DS: Format = Format(8);
    pub const MTBUF: Format = Format(9);
    pub const MUBUF: Format = Format(10);
    pub const MIMG: Format = Format(11);
    pub const FLAT: Format = Format(12);
    pub const GLOBAL: Format = Format(13);
    pub const SCRATCH: Format = Format(14);
    pub const EXP: Format = Format(15);
    pub const PSEUDO_BRANCH: Format = Format(16);
    pub const PSEUDO_BARRIER: Format = Format(17);
    pub const PSEUDO_REDUCTION: Format = Format(18);
    pub const VINTRP: Format = Format(19);
    pub const VOP1: Format = Format(1 << 8);
    pub const VOP2: Format = Format(1 << 9);
    pub const VOPC: Format = Format(1 << 10);
    pub const VOP3: Format = Format(1 << 11);
    pub const DPP: Format = Format(1 << 14);
    pub const SDWA: Format = Format(1 << 15);
}

impl Format {
    const MODIFIER_MASK: u16 = (1 << 11) | (1 << 14) | (1 << 15);

    /// The format with VOP3/DPP/SDWA modifier bits stripped.
    pub fn base(self) -> Format {
        Format(self.0 & !Self::MODIFIER_MASK)
    }

    /// Whether `bits` (a one-hot format) is present.
    fn has(self, bits: Format) -> bool {
        self.0 & bits.0 != 0
    }

    /// Whether this is the VOP3 encoding (native or promoted).
    pub fn is_vop3(self) -> bool {
        self.has(Format::VOP3)
    }

    /// Whether the DPP modifier is applied.
    pub fn is_dpp(self) -> bool {
        self.has(Format::DPP)
    }

    /// Whether the SDWA modifier is applied.
    pub fn is_sdwa(self) -> bool {
        self.has(Format::SDWA)
    }

    /// The VOP3-promoted form of this format.
    pub fn as_vop3(self) -> Format {
        Format(self.0 | Format::VOP3.0)
    }

    /// The DPP-modified form of this format.
    pub fn with_dpp(self) -> Format {
        Format(self.0 | Format::DPP.0)
    }

    /// Strip the DPP modifier.
    pub fn without_dpp(self) -> Format {
        Format(self.0 & !Format::DPP.0)
    }

    /// Whether this is a scalar-ALU word format.
    pub fn is_salu(self) -> bool {
        matches!(self.base(), Format::SOP1 | Format::SOP2 | Format::SOPK | Format::SOPP | Format::SOPC)
    }

    /// Whether this is a vector-ALU format (any encoding).
    pub fn is_valu(self) -> bool {
        self.has(Format::VOP1) || self.has(Format::VOP2) || self.has(Format::VOPC) || self.is_vop3()
    }

    /// Whether this is a buffer/image vector-memory format.
    pub fn is_vmem(self) -> bool {
        matches!(self.base(), Format::MUBUF | Format::MTBUF | Format::MIMG)
    }

    /// Whether this is FLAT, GLOBAL or SCRATCH.
    pub fn is_flat_like(self) -> bool {
        matches!(self.base(), Format::FLAT | Format::GLOBAL | Format::SCRATCH)
    }

    /// Whether an instruction of this format may carry a literal operand on
    /// the given chip.
    pub fn can_take_literal(self, chip: ChipClass) -> bool {
        if self.is_dpp() || self.is_sdwa() {
            return false;
        }
        if self.is_vop3() {
            return chip >= ChipClass::Gfx10;
        }
        matches!(
            self.base(),
            Format::SOP1 | Format::SOP2 | Format::SOPC | Format::PSEUDO
        ) || self.has(Format::VOP1)
            || self.has(Format::VOP2)
            || self.has(Format::VOPC)
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.base() {
            Format::PSEUDO => "PSEUDO",
            Format::SOP1 => "SOP1",
            Format::SOP2 => "SOP2",
            Format::SOPK => "SOPK",
            Format::SOPP => "SOPP",
            Format::SOPC => "SOPC",
            Format::SMEM => "SMEM",
            Format::DS => "DS",
            Format::MTBUF => "MTBUF",
            Format::MUBUF => "MUBUF",
            Format::MIMG => "MIMG",
            Format::FLAT => "FLAT",
            Format::GLOBAL => "GLOBAL",
            Format::SCRATCH => "SCRATCH",
            Format::EXP => "EXP",
            Format::PSEUDO_BRANCH => "PSEUDO_BRANCH",
            Format::PSEUDO_BARRIER => "PSEUDO_BARRIER",
            Format::PSEUDO_REDUCTION => "PSEUDO_REDUCTION",
            Format::VINTRP => "VINTRP",
            f if f.has(Format::VOP1) => "VOP1",
            f if f.has(Format::VOP2) => "VOP2",
            f if f.has(Format::VOPC) => "VOPC",
            _ => "VOP3",
        };
        write!(f, "{name}")?;
        if self.base().0 != self.0 {
            if self.is_vop3() && self.base().0 != 0 {
                write!(f, "|VOP3")?;
            }
            if self.is_dpp() {
                write!(f, "|DPP")?;
            }
            if self.is_sdwa() {
                write!(f, "|SDWA")?;
            }
        }
        Ok(())
    }
}

/// Reduction operations for `PSEUDO_REDUCTION` instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ReduceOp {
    IAdd32,
    IMul32,
    IMin32,
    IMax32,
    UMin32,
    UMax32,
    IAnd32,
    IOr32,
    IXor32,
    FAdd32,
    FMul32,
    FMin32,
    FMax32,
    FAdd64,
    FMul64,
    FMin64,
    FMax64,
    /// Cross-half lane permutation for wave64 on GFX10.
    Gfx10Wave64Bpermute,
}

/// Format-specific instruction payload.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrData {
    /// Formats without extra fields.
    None,
    /// SOPK immediate.
    Sopk {
        /// 16-bit immediate.
        imm: u16,
    },
    /// SOPP immediate and optional branch target block.
    Sopp {
        /// 16-bit immediate (branch offset, waitcnt fields, nop count).
        imm: u16,
        /// Branch target block, patched by the assembler.
        block: Option<u32>,
    },
    /// Scalar memory access.
    Smem {
        /// Globally coherent.
        glc: bool,
        /// Device-level coherent (GFX10+).
        dlc: bool,
        /// Non-volatile (GFX9).
        nv: bool,
        /// Whether the access may be reordered against others.
        can_reorder: bool,
    },
    /// VOP3 modifiers.
    Vop3 {
        /// Input absolute-value modifiers.
        abs: [bool; 3],
        /// Input negate modifiers.
        neg: [bool; 3],
        /// Operand-select (half-register) bits.
        opsel: [bool; 4],
        /// Output clamp.
        clamp: bool,
        /// Output modifier: 0 none, 1 ×2, 2 ×4, 3 ÷2.
        omod: u8,
    },
    /// Data-parallel primitive modifier on a VALU instruction.
    Dpp {
        /// Lane-shuffle control.
        dpp_ctrl: u16,
        /// Row write mask.
        row_mask: u8,
        /// Bank write mask.
        bank_mask: u8,
        /// Fetch zero for invalid lanes.
        bound_ctrl: bool,
        /// Input absolute-value modifiers.
        abs: [bool; 2],
        /// Input negate modifiers.
        neg: [bool; 2],
    },
    /// Subword addressing modifier on a VALU instruction.
    Sdwa {
        /// Source selection bytes.
        sel: [u8; 2],
        /// Destination selection byte.
        dst_sel: u8,
        /// Output clamp.
        clamp: bool,
        /// Output modifier (GFX9+).
        omod: u8,
    },
    /// Interpolation payload.
    Vintrp {
        /// Source attribute index.
        attribute: u8,
        /// Attribute component.
        component: u8,
    },
    /// LDS access.
    Ds {
        /// First offset.
        offset0: u16,
        /// Second offset for two-address forms.
        offset1: u8,
        /// GDS rather than LDS.
        gds: bool,
    },
    /// Untyped buffer access.
    Mubuf {
        /// Constant offset.
        offset: u16,
        /// Enable offset VGPR.
        offen: bool,
        /// Enable index VGPR.
        idxen: bool,
        /// Globally coherent.
        glc: bool,
        /// Device-level coherent (GFX10+).
        dlc: bool,
        /// System-level coherent.
        slc: bool,
        /// Texture fail enable.
        tfe: bool,
        /// Direct-to-LDS.
        lds: bool,
        /// Execute in exact mode even inside WQM regions.
        disable_wqm: bool,
    },
    /// Typed buffer access.
    Mtbuf {
        /// Data format.
        dfmt: u8,
        /// Numeric format.
        nfmt: u8,
        /// Constant offset.
        offset: u16,
        /// Enable offset VGPR.
        offen: bool,
        /// Enable index VGPR.
        idxen: bool,
        /// Globally coherent.
        glc: bool,
        /// Device-level coherent (GFX10+).
        dlc: bool,
        /// System-level coherent.
        slc: bool,
        /// Texture fail enable.
        tfe: bool,
        /// Execute in exact mode even inside WQM regions.
        disable_wqm: bool,
    },
    /// Image access.
    Mimg {
        /// Component write/read mask.
        dmask: u8,
        /// Dimensionality (GFX10+).
        dim: u8,
        /// Force unnormalized coordinates.
        unrm: bool,
        /// Globally coherent.
        glc: bool,
        /// Device-level coherent (GFX10+).
        dlc: bool,
        /// System-level coherent.
        slc: bool,
        /// Texture fail enable.
        tfe: bool,
        /// LOD warning enable.
        lwe: bool,
        /// Declare array (GFX9 and older).
        da: bool,
        /// 128-bit resource (GFX10+).
        r128: bool,
        /// 16-bit addresses.
        a16: bool,
        /// 16-bit data.
        d16: bool,
        /// Execute in exact mode even inside WQM regions.
        disable_wqm: bool,
        /// Whether the access may be reordered against others.
        can_reorder: bool,
    },
    /// FLAT/GLOBAL/SCRATCH access.
    FlatLike {
        /// Constant offset.
        offset: u16,
        /// Direct-to-LDS.
        lds: bool,
        /// Globally coherent.
        glc: bool,
        /// Device-level coherent (GFX10+).
        dlc: bool,
        /// System-level coherent.
        slc: bool,
        /// Non-volatile.
        nv: bool,
        /// Execute in exact mode even inside WQM regions.
        disable_wqm: bool,
    },
    /// Export.
    Exp {
        /// Which of the four data registers are enabled.
        enabled_mask: u8,
        /// Export target.
        dest: u8,
        /// Compressed (two 16-bit channels per register).
        compressed: bool,
        /// Last export of the program for this target.
        done: bool,
        /// Operand 0 carries the valid mask.
        valid_mask: bool,
    },
    /// Pseudo-instruction payload.
    Pseudo {
        /// Scratch SGPR usable when resolving copy cycles.
        scratch_sgpr: PhysReg,
        /// Whether a live value currently occupies scc, so scratch choices
        /// must preserve it.
        tmp_in_scc: bool,
    },
    /// Pseudo-branch payload: `target[0]` is the jump target, `target[1]`
    /// the fall-through block.
    Branch {
        /// Branch targets.
        target: [u32; 2],
        /// Branch is statically known to be taken rarely.
        rarely_taken: bool,
        /// Branch is statically known to be never taken.
        never_taken: bool,
    },
    /// Pseudo-reduction payload.
    Reduction {
        /// The reduction operator.
        reduce_op: ReduceOp,
        /// Number of lanes per cluster (2/4/8/16/32/64).
        cluster_size: u32,
    },
}

impl InstrData {
    /// Default payload for a freshly created instruction of `format`.
    pub fn default_for(format: Format) -> InstrData {
        match format.base() {
            _ if format.is_dpp() => InstrData::Dpp {
                dpp_ctrl: 0,
                row_mask: 0xf,
                bank_mask: 0xf,
                bound_ctrl: false,
                abs: [false; 2],
                neg: [false; 2],
            },
            _ if format.is_sdwa() => {
                InstrData::Sdwa { sel: [0; 2], dst_sel: 0, clamp: false, omod: 0 }
            }
            _ if format.is_vop3() => InstrData::Vop3 {
                abs: [false; 3],
                neg: [false; 3],
                opsel: [false; 4],
                clamp: false,
                omod: 0,
            },
            Format::SOPK => InstrData::Sopk { imm: 0 },
            Format::SOPP => InstrData::Sopp { imm: 0, block: None },
            Format::SMEM => {
                InstrData::Smem { glc: false, dlc: false, nv: false, can_reorder: true }
            }
            Format::VINTRP => InstrData::Vintrp { attribute: 0, component: 0 },
            Format::DS => InstrData::Ds { offset0: 0, offset1: 0, gds: false },
            Format::MUBUF => InstrData::Mubuf {
                offset: 0,
                offen: false,
                idxen: false,
                glc: false,
                dlc: false,
                slc: false,
                tfe: false,
                lds: false,
                disable_wqm: false,
            },
            Format::MTBUF => InstrData::Mtbuf {
                dfmt: 0,
                nfmt: 0,
                offset: 0,
                offen: false,
                idxen: false,
                glc: false,
                dlc: false,
                slc: false,
                tfe: false,
                disable_wqm: false,
            },
            Format::MIMG => InstrData::Mimg {
                dmask: 0xf,
                dim: 0,
                unrm: false,
                glc: false,
                dlc: false,
                slc: false,
                tfe: false,
                lwe: false,
                da: false,
                r128: false,
                a16: false,
                d16: false,
                disable_wqm: false,
                can_reorder: true,
            },
            Format::FLAT | Format::GLOBAL | Format::SCRATCH => InstrData::FlatLike {
                offset: 0,
                lds: false,
                glc: false,
                dlc: false,
                slc: false,
                nv: false,
                disable_wqm: false,
            },
            Format::EXP => InstrData::Exp {
                enabled_mask: 0,
                dest: 0,
                compressed: false,
                done: false,
                valid_mask: false,
            },
            Format::PSEUDO | Format::PSEUDO_BARRIER => {
                InstrData::Pseudo { scratch_sgpr: PhysReg(0), tmp_in_scc: false }
            }
            Format::PSEUDO_BRANCH => {
                InstrData::Branch { target: [0; 2], rarely_taken: false, never_taken: false }
            }
            Format::PSEUDO_REDUCTION => {
                InstrData::Reduction { reduce_op: ReduceOp::IAdd32, cluster_size: 64 }
            }
            _ => InstrData::None,
        }
    }
}

/// One instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// The operation.
    pub opcode: Opcode,
    /// The encoding format, including VOP3/DPP/SDWA modifier bits.
    pub format: Format,
    /// Ordered operand list.
    pub operands: SmallVec<[Operand; 4]>,
    /// Ordered definition list.
    pub definitions: SmallVec<[Definition; 2]>,
    /// Format-specific payload.
    pub data: InstrData,
}

impl Instruction {
    /// A new instruction with `num_operands` undefined operands and
    /// `num_definitions` placeholder definitions, format taken from the
    /// opcode table unless overridden later.
    pub fn new(opcode: Opcode, format: Format, num_operands: usize, num_definitions: usize) -> Self {
        let mut operands = SmallVec::new();
        operands.resize(num_operands, Operand::undef(RegClass::S1));
        let mut definitions = SmallVec::new();
        definitions.resize(num_definitions, Definition::fixed(PhysReg(0), RegClass::S1));
        Self { opcode, format, operands, definitions, data: InstrData::default_for(format) }
    }

    /// Whether this is a logical or linear phi.
    pub fn is_phi(&self) -> bool {
        matches!(self.opcode, Opcode::p_phi | Opcode::p_linear_phi)
    }

    /// Whether this is a scalar-ALU instruction.
    pub fn is_salu(&self) -> bool {
        self.format.is_salu()
    }

    /// Whether this is a vector-ALU instruction.
    pub fn is_valu(&self) -> bool {
        self.format.is_valu()
    }

    /// Whether this uses the VOP3 encoding.
    pub fn is_vop3(&self) -> bool {
        self.format.is_vop3()
    }

    /// Whether the DPP modifier is applied.
    pub fn is_dpp(&self) -> bool {
        self.format.is_dpp()
    }

    /// Whether the SDWA modifier is applied.
    pub fn is_sdwa(&self) -> bool {
        self.format.is_sdwa()
    }

    /// Whether this is a VOPC comparison (any encoding).
    pub fn is_vopc(&self) -> bool {
        self.format.has(Format::VOPC)
    }

    /// Whether this is buffer/image vector memory.
    pub fn is_vmem(&self) -> bool {
        self.format.is_vmem()
    }

    /// Whether this is FLAT, GLOBAL or SCRATCH.
    pub fn is_flat_like(&self) -> bool {
        self.format.is_flat_like()
    }

    /// Whether this is a pseudo instruction (any pseudo format).
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self.format.base(),
            Format::PSEUDO | Format::PSEUDO_BRANCH | Format::PSEUDO_BARRIER | Format::PSEUDO_REDUCTION
        )
    }

    /// Whether this is a pseudo branch.
    pub fn is_branch(&self) -> bool {
        self.format.base() == Format::PSEUDO_BRANCH
    }

    /// Whether this is a transcendental VALU operation.
    pub fn is_trans(&self) -> bool {
        self.opcode.info().flags.contains(OpFlags::TRANS)
    }

    /// The SOPP/SOPK immediate. Panics on other formats.
    pub fn salu_imm(&self) -> u16 {
        match self.data {
            InstrData::Sopp { imm, .. } | InstrData::Sopk { imm } => imm,
            _ => panic!("instruction has no scalar immediate"),
        }
    }

    /// Mutable SOPP/SOPK immediate.
    pub fn salu_imm_mut(&mut self) -> &mut u16 {
        match &mut self.data {
            InstrData::Sopp { imm, .. } | InstrData::Sopk { imm } => imm,
            _ => panic!("instruction has no scalar immediate"),
        }
    }

    /// Branch payload accessors. Panics if this is not a pseudo branch.
    pub fn branch(&self) -> (&[u32; 2], bool, bool) {
        match &self.data {
            InstrData::Branch { target, rarely_taken, never_taken } => {
                (target, *rarely_taken, *never_taken)
            }
            _ => panic!("not a branch"),
        }
    }

    /// Mutable branch targets. Panics if this is not a pseudo branch.
    pub fn branch_targets_mut(&mut self) -> &mut [u32; 2] {
        match &mut self.data {
            InstrData::Branch { target, .. } => target,
            _ => panic!("not a branch"),
        }
    }

    /// Branch target 0 (the jump target). Panics if this is not a branch.
    pub fn branch_target(&self) -> u32 {
        self.branch().0[0]
    }

    /// Whether any definition writes (part of) exec.
    pub fn writes_exec(&self) -> bool {
        self.definitions.iter().any(|def| {
            def.is_fixed() && regs_intersect(def.phys_reg(), def.size(), EXEC_LO, 2)
        })
    }

    /// Whether execution of this instruction is predicated by the exec mask.
    pub fn needs_exec_mask(&self) -> bool {
        if self.is_valu() || self.format.base() == Format::VINTRP {
            // Lane accessors operate on the register file directly.
            return !matches!(
                self.opcode,
                Opcode::v_readlane_b32
                    | Opcode::v_readlane_b32_e64
                    | Opcode::v_readfirstlane_b32
                    | Opcode::v_writelane_b32
                    | Opcode::v_writelane_b32_e64
            );
        }
        if self.is_vmem() || self.is_flat_like() || self.format.base() == Format::DS {
            return true;
        }
        if self.format.base() == Format::EXP {
            return true;
        }
        if self.format.base() == Format::PSEUDO {
            // Per-lane pseudo operations (copies of vector values) are
            // predicated; purely scalar ones are not.
            return self
                .definitions
                .iter()
                .any(|def| def.reg_class().ty() == RegType::Vgpr && !def.reg_class().is_linear());
        }
        false
    }

    /// Whether this instruction reads the exec mask, either as an explicit
    /// operand or through predication.
    pub fn reads_exec(&self) -> bool {
        self.needs_exec_mask()
            || self.operands.iter().any(|op| {
                op.is_fixed() && regs_intersect(op.phys_reg(), op.size().max(1), EXEC_LO, 2)
            })
    }

    /// Whether any VOP3/DPP/SDWA modifier is in effect.
    pub fn uses_modifiers(&self) -> bool {
        match &self.data {
            InstrData::Vop3 { abs, neg, opsel, clamp, omod } => {
                abs.iter().any(|&b| b)
                    || neg.iter().any(|&b| b)
                    || opsel.iter().any(|&b| b)
                    || *clamp
                    || *omod != 0
            }
            InstrData::Dpp { .. } | InstrData::Sdwa { .. } => true,
            _ => false,
        }
    }

    /// Convert a plain VALU encoding into the VOP3 form, preserving opcode,
    /// operands and definitions ("payload-widening").
    pub fn promote_to_vop3(&mut self) {
        if self.is_vop3() {
            return;
        }
        self.format = self.format.as_vop3();
        self.data = InstrData::default_for(self.format);
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, def) in self.definitions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if def.is_temp() {
                write!(f, "{:?}", def.get_temp())?;
            }
            if def.is_fixed() {
                write!(f, "({:?})", def.phys_reg())?;
            }
        }
        if !self.definitions.is_empty() {
            write!(f, " = ")?;
        }
        write!(f, "{}", self.opcode)?;
        for op in &self.operands {
            if op.is_undefined() {
                write!(f, " undef")?;
            } else if op.is_constant() {
                write!(f, " {:#x}", op.constant_value64())?;
            } else {
                if op.is_temp() {
                    write!(f, " {:?}", op.get_temp())?;
                } else {
                    write!(f, " ")?;
                }
                if op.is_fixed() {
                    write!(f, "({:?})", op.phys_reg())?;
                }
            }
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Block-kind flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BlockKind: u16 {
        /// First block of a loop body.
        const LOOP_HEADER = 1 << 0;
        /// Join block after a loop.
        const LOOP_EXIT = 1 << 1;
        /// Block immediately preceding a loop header.
        const LOOP_PREHEADER = 1 << 2;
        /// Join block after divergent control flow.
        const MERGE = 1 << 3;
        /// Block flipping exec to the else-side lanes.
        const INVERT = 1 << 4;
        /// Block ending in a divergent branch.
        const BRANCH = 1 << 5;
        /// Block performing a divergent loop break.
        const BREAK = 1 << 6;
        /// Block performing a divergent loop continue.
        const CONTINUE = 1 << 7;
        /// Block that either continues or breaks, resolved dynamically.
        const CONTINUE_OR_BREAK = 1 << 8;
        /// Control flow out of this block is uniform.
        const UNIFORM = 1 << 9;
        /// Block at loop-nest depth zero.
        const TOP_LEVEL = 1 << 10;
        /// A discard or demote executes somewhere in this block.
        const USES_DISCARD = 1 << 11;
        /// Final block whose register contents feed a subsequent shader part.
        const END_WITH_REGS = 1 << 12;
        /// Shared early-exit block synthesized for discards.
        const DISCARD_EARLY_EXIT = 1 << 13;
    }
}

/// Edge list of a block. Kept sorted ascending.
pub type EdgeVec = SmallVec<[u32; 2]>;

/// One basic block.
#[derive(Clone, Debug, Default)]
pub struct Block {
    /// The block's index in `Program::blocks`; the authoritative identity.
    pub index: u32,
    /// The instructions.
    pub instructions: Vec<Instruction>,
    /// Logical-CFG predecessors, sorted ascending.
    pub logical_preds: EdgeVec,
    /// Linear-CFG predecessors, sorted ascending.
    pub linear_preds: EdgeVec,
    /// Logical-CFG successors, sorted ascending.
    pub logical_succs: EdgeVec,
    /// Linear-CFG successors, sorted ascending.
    pub linear_succs: EdgeVec,
    /// Kind flags.
    pub kind: BlockKind,
    /// Loop nesting depth.
    pub loop_nest_depth: u32,
    /// Immediate dominator on the logical CFG; -1 when unknown/unreachable.
    pub logical_idom: i32,
    /// Immediate dominator on the linear CFG; -1 when unknown/unreachable.
    pub linear_idom: i32,
    /// Dword offset of the block in the emitted code, set by the assembler.
    pub offset: u32,
    /// Register demand of values live into the block.
    pub live_in_demand: RegisterDemand,
    /// Maximum register demand across the block.
    pub register_demand: RegisterDemand,
}

impl Block {
    fn with_index(index: u32) -> Self {
        Block { index, logical_idom: -1, linear_idom: -1, ..Default::default() }
    }
}

/// Whether block `parent` dominates block `child` on the logical CFG.
/// Both must have computed idoms.
pub fn dominates_logical(program: &Program, parent: u32, child: u32) -> bool {
    let mut idx = child;
    while idx > parent {
        let idom = program.blocks[idx as usize].logical_idom;
        if idom < 0 || idom as u32 == idx {
            return false;
        }
        idx = idom as u32;
    }
    idx == parent
}

/// Whether block `parent` dominates block `child` on the linear CFG.
pub fn dominates_linear(program: &Program, parent: u32, child: u32) -> bool {
    let mut idx = child;
    while idx > parent {
        let idom = program.blocks[idx as usize].linear_idom;
        if idom < 0 || idom as u32 == idx {
            return false;
        }
        idx = idom as u32;
    }
    idx == parent
}

/// Target-independent compilation options and debug switches.
#[derive(Clone, Debug)]
pub struct CompilerConfig {
    /// Number of addressable SGPRs; vcc aliases the top two.
    pub num_sgprs: u32,
    /// Number of addressable VGPRs.
    pub num_vgprs: u32,
    /// The program uses vcc.
    pub needs_vcc: bool,
    /// The program contains derivative computations and needs WQM regions.
    pub needs_wqm: bool,
    /// The program contains operations requiring exact execution.
    pub needs_exact: bool,
    /// Write back the scalar L1 cache before ending the program.
    pub wb_smem_l1_on_end: bool,
    /// Run the structural validator between passes.
    pub validate: bool,
    /// Run register-allocation validation between passes.
    pub validate_ra: bool,
    /// Emit performance warnings through the log channel.
    pub perfwarn: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            num_sgprs: 104,
            num_vgprs: 256,
            needs_vcc: true,
            needs_wqm: false,
            needs_exact: false,
            wb_smem_l1_on_end: false,
            validate: cfg!(debug_assertions),
            validate_ra: false,
            perfwarn: false,
        }
    }
}

/// A whole shader program: the root entity every pass operates on.
#[derive(Debug)]
pub struct Program {
    /// The blocks, indexed by `Block::index`.
    pub blocks: Vec<Block>,
    /// Target GPU generation.
    pub chip_class: ChipClass,
    /// Lanes per wave: 32 or 64.
    pub wave_size: u32,
    /// Hardware stage of the program.
    pub stage: Stage,
    /// Constant data appended after the code by the assembler.
    pub constant_data: Vec<u8>,
    /// Compilation options.
    pub config: CompilerConfig,
    /// Live-variable summary, if computed.
    pub live: Option<LiveInfo>,
    /// Program-wide maximum register demand.
    pub max_reg_demand: RegisterDemand,
    next_id: u32,
}

impl Program {
    /// Create an empty program for the given target.
    pub fn new(chip_class: ChipClass, wave_size: u32, stage: Stage) -> Self {
        assert!(wave_size == 32 || wave_size == 64);
        Self {
            blocks: Vec::new(),
            chip_class,
            wave_size,
            stage,
            constant_data: Vec::new(),
            config: CompilerConfig::default(),
            live: None,
            max_reg_demand: RegisterDemand::default(),
            next_id: 1,
        }
    }

    /// The register class of a per-lane predicate on this target.
    pub fn lane_mask(&self) -> RegClass {
        if self.wave_size == 64 {
            RegClass::S2
        } else {
            RegClass::S1
        }
    }

    /// Append a new block and return its index.
    pub fn create_and_insert_block(&mut self) -> u32 {
        let index = self.blocks.len() as u32;
        self.blocks.push(Block::with_index(index));
        index
    }

    /// Allocate a fresh SSA id.
    pub fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocate a fresh temporary of class `rc`.
    pub fn alloc_tmp(&mut self, rc: RegClass) -> Temp {
        let id = self.alloc_id();
        Temp::new(id, rc)
    }

    /// One past the largest allocated SSA id; the size for side tables
    /// indexed by temp id.
    pub fn peek_allocation_id(&self) -> u32 {
        self.next_id
    }

    /// Reset the SSA id allocator. Only `reindex_ssa` may call this.
    pub(crate) fn set_allocation_id(&mut self, next: u32) {
        self.next_id = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_constants() {
        assert!(!Operand::c32(0).is_literal());
        assert!(!Operand::c32(64).is_literal());
        assert!(Operand::c32(65).is_literal());
        assert!(!Operand::c32(0xFFFF_FFFF).is_literal());
        assert!(!Operand::c32(0x3f80_0000).is_literal());
        assert!(Operand::c32(0x3e22_f983).is_literal());
        assert_eq!(Operand::c32(17).constant_value(), 17);
        assert!(Operand::zero(8).constant_equals(0));
        assert_eq!(Operand::zero(8).size(), 2);
    }

    #[test]
    fn format_bits() {
        let f = Format::VOP2.as_vop3();
        assert!(f.is_vop3());
        assert_eq!(f.base(), Format::VOP2);
        assert!(f.is_valu());
        assert!(!Format::SOP1.is_valu());
        assert!(Format::SOP1.is_salu());
        assert!(Format::GLOBAL.is_flat_like());
        assert!(!Format::MUBUF.is_flat_like());
        assert!(Format::MUBUF.is_vmem());
    }

    #[test]
    fn format_literal_rules() {
        assert!(Format::SOP2.can_take_literal(ChipClass::Gfx8));
        assert!(Format::VOP2.can_take_literal(ChipClass::Gfx8));
        assert!(!Format::VOP2.as_vop3().can_take_literal(ChipClass::Gfx9));
        assert!(Format::VOP2.as_vop3().can_take_literal(ChipClass::Gfx10));
    }

    #[test]
    fn exec_queries() {
        let mut instr = Instruction::new(Opcode::s_and_saveexec_b64, Format::SOP1, 1, 2);
        instr.definitions[0] = Definition::fixed(PhysReg(4), RegClass::S2);
        instr.definitions[1] = Definition::fixed(EXEC, RegClass::S2);
        instr.operands[0] = Operand::fixed(EXEC, RegClass::S2);
        assert!(instr.writes_exec());
        assert!(instr.reads_exec());
        assert!(!instr.needs_exec_mask());

        let mut vadd = Instruction::new(Opcode::v_add_f32, Format::VOP2, 2, 1);
        vadd.definitions[0] = Definition::fixed(PhysReg(256), RegClass::V1);
        assert!(vadd.needs_exec_mask());
        assert!(!vadd.writes_exec());
    }

    #[test]
    fn regs_intersect_ranges() {
        assert!(regs_intersect(PhysReg(4), 2, PhysReg(5), 1));
        assert!(!regs_intersect(PhysReg(4), 2, PhysReg(6), 2));
        assert!(regs_intersect(EXEC_HI, 1, EXEC_LO, 2));
    }
}
