//! Stub memory and IC chains.
//!
//! A stub is one allocation: an [`ICStubHeader`] followed by its stub data.
//! Generated code receives the header in `rdx` and reads its constants at
//! `[rdx + STUB_DATA_OFFSET + field_offset]`. Stubs of one IC site form a
//! singly linked chain that ends in a fallback stub whose code is a native
//! function.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::compiler::JitCode;
use crate::error::AttachError;
use crate::gc::Tracer;
use crate::stub_data::CacheIRStubInfo;
use crate::value::Value;

/// Which tier a stub is compiled for. Determines the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ICStubEngine {
    Baseline,
    IonSharedIC,
}

/// Signature of every stub and fallback: two boxed inputs and the stub
/// being entered, returning a boxed result.
pub type StubFn = unsafe extern "C" fn(u64, u64, *const ICStubHeader) -> u64;

#[repr(C)]
pub struct ICStubHeader {
    pub code: *const u8,
    pub next: *const ICStubHeader,
    /// Null for fallback stubs.
    pub stub_info: *const CacheIRStubInfo,
}

// Field offset constants for use from JIT code.
pub const STUB_CODE_OFFSET: i32 = core::mem::offset_of!(ICStubHeader, code) as i32;
pub const STUB_NEXT_OFFSET: i32 = core::mem::offset_of!(ICStubHeader, next) as i32;
/// Where stub data begins, relative to the header.
pub const STUB_DATA_OFFSET: u32 = core::mem::size_of::<ICStubHeader>() as u32;

/// An optimized stub. Keeps its code and stub info alive.
pub struct ICStub {
    ptr: NonNull<ICStubHeader>,
    layout: Layout,
    info: Arc<CacheIRStubInfo>,
    code: Arc<JitCode>,
}

impl ICStub {
    /// Allocate a zeroed stub for `info`, pointing at `code`. The caller
    /// fills the stub data and links it into a chain.
    pub fn new(info: Arc<CacheIRStubInfo>, code: Arc<JitCode>) -> Result<ICStub, AttachError> {
        assert_eq!(
            info.stub_data_offset(),
            STUB_DATA_OFFSET,
            "stub info built for a different header layout"
        );
        let bytes = STUB_DATA_OFFSET as usize + info.stub_data_size();
        let layout = Layout::from_size_align(bytes, core::mem::align_of::<ICStubHeader>())
            .map_err(|_| AttachError::StubAlloc { bytes })?;
        // SAFETY: layout has non-zero size (the header alone is 24 bytes).
        let raw = unsafe { alloc_zeroed(layout) } as *mut ICStubHeader;
        let ptr = NonNull::new(raw).ok_or(AttachError::StubAlloc { bytes })?;
        // SAFETY: freshly allocated, properly aligned, and large enough.
        unsafe {
            ptr.as_ptr().write(ICStubHeader {
                code: code.entry_ptr(),
                next: core::ptr::null(),
                stub_info: Arc::as_ptr(&info),
            });
        }
        Ok(ICStub {
            ptr,
            layout,
            info,
            code,
        })
    }

    pub fn header_ptr(&self) -> *const ICStubHeader {
        self.ptr.as_ptr()
    }

    pub fn stub_info(&self) -> &Arc<CacheIRStubInfo> {
        &self.info
    }

    pub fn code(&self) -> &Arc<JitCode> {
        &self.code
    }

    pub fn next(&self) -> *const ICStubHeader {
        // SAFETY: the header is initialized in `new`.
        unsafe { (*self.ptr.as_ptr()).next }
    }

    fn set_next(&mut self, next: *const ICStubHeader) {
        // SAFETY: we own the allocation.
        unsafe { (*self.ptr.as_ptr()).next = next }
    }

    pub fn stub_data(&self) -> &[u8] {
        // SAFETY: the allocation holds `stub_data_size` bytes after the header.
        unsafe {
            core::slice::from_raw_parts(
                (self.ptr.as_ptr() as *const u8).add(STUB_DATA_OFFSET as usize),
                self.info.stub_data_size(),
            )
        }
    }

    pub fn stub_data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe {
            core::slice::from_raw_parts_mut(
                (self.ptr.as_ptr() as *mut u8).add(STUB_DATA_OFFSET as usize),
                self.info.stub_data_size(),
            )
        }
    }

    /// Report every GC pointer held in this stub's data.
    pub fn trace(&mut self, tracer: &mut dyn Tracer) {
        let info = Arc::clone(&self.info);
        info.trace_stub_data(self.stub_data_mut(), tracer);
    }
}

impl Drop for ICStub {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
    }
}

/// The stub chain of one IC site.
pub struct ICEntry {
    fallback: Box<ICStubHeader>,
    stubs: Vec<ICStub>,
}

impl ICEntry {
    pub fn new(fallback: StubFn) -> Self {
        ICEntry {
            fallback: Box::new(ICStubHeader {
                code: fallback as *const u8,
                next: core::ptr::null(),
                stub_info: core::ptr::null(),
            }),
            stubs: Vec::new(),
        }
    }

    /// Optimized stubs in chain order.
    pub fn stubs(&self) -> &[ICStub] {
        &self.stubs
    }

    pub fn num_optimized_stubs(&self) -> usize {
        self.stubs.len()
    }

    pub fn fallback_stub(&self) -> *const ICStubHeader {
        &*self.fallback
    }

    pub fn first_stub(&self) -> *const ICStubHeader {
        self.stubs
            .first()
            .map_or(self.fallback_stub(), |s| s.header_ptr())
    }

    /// Link `stub` in as the last optimized stub, just before the fallback.
    pub fn append(&mut self, mut stub: ICStub) {
        stub.set_next(self.fallback_stub());
        let header = stub.header_ptr();
        if let Some(last) = self.stubs.last_mut() {
            last.set_next(header);
        }
        self.stubs.push(stub);
    }

    /// Enter the chain with the given inputs. Sites with a single input
    /// pass `Value::undefined()` as the second.
    ///
    /// # Safety
    ///
    /// Every object, string or symbol value must point at a live, correctly
    /// laid out runtime thing: stubs dereference them without checks.
    pub unsafe fn call(&self, input0: Value, input1: Value) -> Value {
        let first = self.first_stub();
        // SAFETY: `first` is either a stub we allocated or the fallback;
        // both have a valid code pointer with the `StubFn` signature.
        let bits = unsafe {
            let code: StubFn = core::mem::transmute((*first).code);
            code(input0.bits(), input1.bits(), first)
        };
        Value::from_bits(bits)
    }

    pub fn trace(&mut self, tracer: &mut dyn Tracer) {
        for stub in &mut self.stubs {
            stub.trace(tracer);
        }
    }
}
