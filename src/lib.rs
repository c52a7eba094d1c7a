//! gcn-codegen shader code generation library.
//!
//! This crate lowers a register-allocated, SSA-form shader program into the
//! final instruction words for AMD GCN/RDNA GPUs. The front end (NIR-style
//! lowering, descriptor plumbing, register allocation) is out of scope: the
//! pipeline consumes a [`ir::Program`] whose operands and definitions are
//! already fixed to physical registers, mutates it through a fixed sequence
//! of passes and emits a little-endian 32-bit word stream plus side-band
//! metadata (executable size, block offsets, register demand).
//!
//! The pass schedule lives in [`Context`]; each pass is a free function over
//! `&mut Program` in its own module.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use crate::context::Context;
pub use crate::result::{CodegenError, CodegenResult};

pub mod assembler;
pub mod dce;
pub mod dominance;
pub mod insert_delay_alu;
pub mod insert_exec_mask;
pub mod insert_nops;
pub mod ir;
pub mod jump_threading;
pub mod live_vars;
pub mod lower_cssa;
pub mod lower_subdword;
pub mod lower_to_hw;
pub mod optimizer;
pub mod ssa_elimination;
pub mod validate;
pub mod value_numbering;

mod context;
mod fx;
mod result;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
