//! Inline-cache stub compiler.
//!
//! A CacheIR program (a [`CacheIRWriter`]) is compiled to x86-64 machine
//! code that guards on its inputs, computes a result, and on any guard
//! failure restores the inputs and tail-jumps to the next stub of its IC
//! chain. Constants are not baked into code: they live in per-stub data
//! described by a [`CacheIRStubInfo`], so stubs that differ only in their
//! constants share one compiled body.

pub mod arch;
pub mod cacheir;
pub mod cacheir_parse;
pub mod compiler;
pub mod error;
pub mod failure;
pub mod gc;
pub mod options;
pub mod regalloc;
pub mod runtime;
pub mod stub;
pub mod stub_cache;
pub mod stub_data;
pub mod value;


pub use cacheir::{CacheIRWriter, CacheKind, CacheOp};
pub use cacheir_parse::{ParseError, parse_cacheir};
pub use compiler::{JitCode, StubCode, StubInputs, compile_cache_ir};
pub use error::{AttachError, CompileError};
pub use options::JitOptions;
pub use stub::{ICEntry, ICStub, ICStubEngine};
pub use stub_cache::{AttachDecision, StubCodeCache, attach_stub};
pub use stub_data::{CacheIRStubInfo, StubField, StubFieldType};
pub use value::{Value, ValueType};

/// Compile `writer` for a site whose inputs arrive in registers.
pub fn compile_stub(writer: &CacheIRWriter, engine: ICStubEngine) -> Result<StubCode, CompileError> {
    let inputs = StubInputs::registers(writer.num_input_operands());
    compile_cache_ir(writer, engine, &inputs, &JitOptions::from_env())
}
