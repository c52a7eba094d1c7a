//! Result and error types representing the outcome of compiling a program.

use std::fmt;

/// A compilation error.
///
/// Every variant represents a programming or configuration defect: there is
/// no recoverable error class inside the pipeline, and a failed compilation
/// never partially emits a binary.
#[derive(Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// A structural or register-allocation invariant does not hold.
    ///
    /// The string is a rendered diagnostic naming the offending instruction
    /// or block.
    Verifier(String),

    /// An opcode has no hardware encoding on the target chip class.
    UnsupportedOpcode(&'static str),

    /// A lowering path that must not be reachable was reached, e.g. a
    /// pseudo instruction survived past the pass that eliminates it.
    Unreachable(&'static str),

    /// Live-variable information failed to re-validate after CSSA lowering.
    LiveInfo,

    /// The control-flow graph is malformed (e.g. a reachable block whose
    /// predecessors all lack a computed dominator).
    MalformedCfg(u32),
}

/// A convenient alias for a `Result` that uses [`CodegenError`] as the error type.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Verifier(msg) => write!(f, "verifier error: {msg}"),
            Self::UnsupportedOpcode(name) => {
                write!(f, "opcode {name} has no encoding on this chip class")
            }
            Self::Unreachable(what) => write!(f, "unreachable lowering path: {what}"),
            Self::LiveInfo => write!(f, "live-variable re-validation failed"),
            Self::MalformedCfg(block) => write!(f, "malformed CFG at block {block}"),
        }
    }
}

impl std::error::Error for CodegenError {}
