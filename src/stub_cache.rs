//! Sharing compiled stub code and attaching stubs to IC chains.
//!
//! Stub code only depends on the CacheIR bytes, the cache kind and the
//! engine: every constant lives in stub data. Two stubs that differ only in
//! their constants therefore run the same machine code, and the table below
//! hands out the same `JitCode` and `CacheIRStubInfo` to both.

use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cacheir::{CacheIRWriter, CacheKind};
use crate::compiler::{JitCode, StubInputs, compile_cache_ir};
use crate::error::AttachError;
use crate::gc::WriteBarrier;
use crate::options::JitOptions;
use crate::stub::{ICEntry, ICStub, ICStubEngine, STUB_DATA_OFFSET};
use crate::stub_data::CacheIRStubInfo;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheIRStubKey {
    pub kind: CacheKind,
    pub engine: ICStubEngine,
    pub code: Box<[u8]>,
}

impl CacheIRStubKey {
    pub fn for_writer(writer: &CacheIRWriter, engine: ICStubEngine) -> Self {
        CacheIRStubKey {
            kind: writer.kind(),
            engine,
            code: writer.code().into(),
        }
    }
}

type CacheEntry = (Arc<CacheIRStubInfo>, Arc<JitCode>);

/// Process-wide table of compiled stub code.
#[derive(Default)]
pub struct StubCodeCache {
    table: Mutex<FxHashMap<CacheIRStubKey, CacheEntry>>,
}

impl StubCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, FxHashMap<CacheIRStubKey, CacheEntry>> {
        // The table holds no invariant a panicking holder could break.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lookup(&self, key: &CacheIRStubKey) -> Option<CacheEntry> {
        self.table().get(key).cloned()
    }

    /// Insert `entry`, replacing any code compiled concurrently for the
    /// same key.
    pub fn insert(&self, key: CacheIRStubKey, entry: CacheEntry) {
        self.table().insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

/// Outcome of a successful [`attach_stub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachDecision {
    /// A new stub was linked in before the fallback.
    Attached,
    /// An identical stub is already on the chain; nothing was added.
    Duplicate,
}

fn get_or_compile(
    cache: &StubCodeCache,
    writer: &CacheIRWriter,
    engine: ICStubEngine,
    options: &JitOptions,
) -> Result<CacheEntry, AttachError> {
    let key = options
        .use_stub_code_cache
        .then(|| CacheIRStubKey::for_writer(writer, engine));
    if let Some(key) = &key {
        if let Some(entry) = cache.lookup(key) {
            debug!(target: "cacheir::stub_cache", kind = %writer.kind(), "stub code cache hit");
            return Ok(entry);
        }
    }

    // Compile without holding the lock.
    let inputs = StubInputs::registers(writer.num_input_operands());
    let stub_code = compile_cache_ir(writer, engine, &inputs, options)?;
    let info = CacheIRStubInfo::new(writer.kind(), engine, false, STUB_DATA_OFFSET, writer)?;
    let entry = (Arc::new(info), Arc::new(stub_code.code));
    if let Some(key) = key {
        cache.insert(key, entry.clone());
    }
    Ok(entry)
}

/// Compile (or reuse) the stub for `writer` and append it to `entry`.
///
/// Any error leaves the chain untouched; the IC site keeps working through
/// its existing stubs and fallback.
pub fn attach_stub(
    cache: &StubCodeCache,
    entry: &mut ICEntry,
    writer: &CacheIRWriter,
    engine: ICStubEngine,
    options: &JitOptions,
    barrier: &dyn WriteBarrier,
) -> Result<AttachDecision, AttachError> {
    let (info, code) = get_or_compile(cache, writer, engine, options)?;

    let duplicate = entry.stubs().iter().any(|stub| {
        let same_program = Arc::ptr_eq(stub.stub_info(), &info)
            || (stub.stub_info().engine() == engine
                && stub.stub_info().kind() == writer.kind()
                && stub.stub_info().code() == writer.code());
        same_program && writer.stub_data_equals(stub.stub_data())
    });
    if duplicate {
        debug!(target: "cacheir::stub_cache", kind = %writer.kind(), "stub already attached");
        return Ok(AttachDecision::Duplicate);
    }

    let mut stub = ICStub::new(info, code)?;
    writer.copy_stub_data(stub.stub_data_mut(), barrier);
    entry.append(stub);
    debug!(
        target: "cacheir::stub_cache",
        kind = %writer.kind(),
        engine = ?engine,
        stubs = entry.num_optimized_stubs(),
        "attached stub"
    );
    Ok(AttachDecision::Attached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::NoBarrier;
    use crate::runtime::{NativeObject, ObjectGroup, PLAIN_OBJECT_CLASS, Shape};
    use crate::value::Value;

    fn shape_guard(shape: usize) -> CacheIRWriter {
        let mut w = CacheIRWriter::new(CacheKind::GetProp);
        let obj = w.guard_is_object(w.input_operand(0));
        w.guard_shape(obj, shape as *const Shape);
        w.load_fixed_slot_result(obj, 32);
        w.return_from_ic();
        w
    }

    unsafe extern "C" fn fallback(_: u64, _: u64, _: *const crate::stub::ICStubHeader) -> u64 {
        0
    }

    #[test]
    fn data_different_stubs_share_code() {
        let cache = StubCodeCache::new();
        let mut entry = ICEntry::new(fallback);
        let opts = JitOptions::default();
        let a = shape_guard(0x1000);
        let b = shape_guard(0x2000);
        assert_eq!(
            attach_stub(&cache, &mut entry, &a, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap(),
            AttachDecision::Attached
        );
        assert_eq!(
            attach_stub(&cache, &mut entry, &b, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap(),
            AttachDecision::Attached
        );
        assert_eq!(cache.len(), 1);
        let stubs = entry.stubs();
        assert!(Arc::ptr_eq(stubs[0].code(), stubs[1].code()));
        assert_ne!(stubs[0].stub_data(), stubs[1].stub_data());
    }

    #[test]
    fn identical_stub_is_not_attached_twice() {
        let cache = StubCodeCache::new();
        let mut entry = ICEntry::new(fallback);
        let opts = JitOptions::default();
        let w = shape_guard(0x1000);
        attach_stub(&cache, &mut entry, &w, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap();
        assert_eq!(
            attach_stub(&cache, &mut entry, &w, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap(),
            AttachDecision::Duplicate
        );
        assert_eq!(entry.num_optimized_stubs(), 1);
    }

    #[test]
    fn engines_do_not_share_code() {
        let cache = StubCodeCache::new();
        let mut baseline = ICEntry::new(fallback);
        let mut ion = ICEntry::new(fallback);
        let opts = JitOptions::default();
        let w = shape_guard(0x1000);
        attach_stub(&cache, &mut baseline, &w, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap();
        attach_stub(&cache, &mut ion, &w, ICStubEngine::IonSharedIC, &opts, &NoBarrier).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn disabled_cache_still_detects_duplicates() {
        let cache = StubCodeCache::new();
        let mut entry = ICEntry::new(fallback);
        let opts = JitOptions {
            use_stub_code_cache: false,
            ..JitOptions::default()
        };
        let w = shape_guard(0x1000);
        attach_stub(&cache, &mut entry, &w, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap();
        assert_eq!(
            attach_stub(&cache, &mut entry, &w, ICStubEngine::Baseline, &opts, &NoBarrier).unwrap(),
            AttachDecision::Duplicate
        );
        assert!(cache.is_empty());
    }

    #[repr(C)]
    struct OneSlotObject {
        header: NativeObject,
        slot: Value,
    }

    #[test]
    fn threads_attaching_the_same_program_share_one_body() {
        const THREADS: i32 = 8;
        let cache = StubCodeCache::new();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let cache = &cache;
                s.spawn(move || {
                    let group = ObjectGroup {
                        clasp: &PLAIN_OBJECT_CLASS,
                        proto: core::ptr::null(),
                    };
                    let shapes = [
                        Shape { id: 2 * t as u32, num_fixed_slots: 1 },
                        Shape { id: 2 * t as u32 + 1, num_fixed_slots: 1 },
                    ];
                    let objects: Vec<_> = shapes
                        .iter()
                        .enumerate()
                        .map(|(i, shape)| OneSlotObject {
                            header: NativeObject {
                                group: &group,
                                shape,
                                slots: core::ptr::null_mut(),
                                elements: core::ptr::null_mut(),
                            },
                            slot: Value::from_int32(100 * t + i as i32),
                        })
                        .collect();

                    let mut entry = ICEntry::new(fallback);
                    let opts = JitOptions::default();
                    for shape in &shapes {
                        let w = shape_guard(shape as *const Shape as usize);
                        let decision =
                            attach_stub(cache, &mut entry, &w, ICStubEngine::Baseline, &opts, &NoBarrier)
                                .unwrap();
                        assert_eq!(decision, AttachDecision::Attached);
                    }

                    for (i, obj) in objects.iter().enumerate() {
                        let got = unsafe { entry.call(Value::from_object(&obj.header), Value::undefined()) };
                        assert_eq!(got, Value::from_int32(100 * t + i as i32));
                    }
                    let miss = unsafe { entry.call(Value::from_int32(1), Value::undefined()) };
                    assert_eq!(miss.bits(), 0);
                });
            }
        });

        assert_eq!(cache.len(), 1);
    }
}
