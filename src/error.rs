//! Error types for stub compilation and attachment.

use thiserror::Error;

/// Why a CacheIR program could not be turned into a stub.
///
/// None of these are dynamic-language errors: a failing guard at run time is
/// ordinary control flow into a failure path and never surfaces here.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Every allocatable register is reserved by the current instruction and
    /// nothing is left to spill.
    #[error("no spillable register left at CacheIR instruction {instruction}")]
    OutOfRegisters { instruction: u32 },

    /// The CacheIR byte stream could not be decoded.
    #[error("malformed CacheIR at byte {offset}: {reason}")]
    MalformedIr { offset: usize, reason: &'static str },

    /// The immutable stub info block could not be allocated.
    #[error("failed to allocate {bytes} bytes of stub info")]
    StubInfoAlloc { bytes: usize },

    #[error("failed to create assembler: {0}")]
    Io(#[from] std::io::Error),

    #[error("assembler error: {0}")]
    Assembler(String),
}

/// Why a stub was not attached to an IC chain.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to allocate {bytes} bytes of stub memory")]
    StubAlloc { bytes: usize },
}

impl AttachError {
    /// Whether the site should simply run without this stub. Every attach
    /// failure is recoverable this way; the distinction exists for logging.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            AttachError::StubAlloc { .. } | AttachError::Compile(CompileError::StubInfoAlloc { .. })
        )
    }
}
