//! Hooks into the embedding garbage collector.
//!
//! The collector itself is external. Stub data only needs two things from it:
//! a post-write barrier when a GC pointer is stored into freshly allocated
//! stub memory, and a tracer that visits every GC pointer a stub holds.

use crate::stub_data::StubFieldType;

/// Called once for every GC-typed stub field that is initialized.
pub trait WriteBarrier {
    /// `slot` is the address of the field that now holds `new_bits`.
    fn post_barrier(&self, ty: StubFieldType, slot: *mut u64, new_bits: u64);
}

/// Barrier for embedders without a generational collector.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBarrier;

impl WriteBarrier for NoBarrier {
    fn post_barrier(&self, _ty: StubFieldType, _slot: *mut u64, _new_bits: u64) {}
}

/// Visits GC edges held by a stub. A moving collector may rewrite `slot`.
///
/// `slot` always holds a GC pointer: integer property keys and primitive
/// values are never passed in.
pub trait Tracer {
    fn trace_edge(&mut self, ty: StubFieldType, slot: &mut u64);
}
