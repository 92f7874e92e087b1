// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Freelist allocator for sample payload buffers.
//!
//! Buffers are recycled through lock-free per-bucket stacks keyed by
//! `(element type, capacity class)`. Capacity classes are powers of two from
//! 16 to 64Ki elements. `get()` pops from the best-fit class, falling back to
//! larger classes, and allocates fresh when every candidate bucket is empty;
//! it never blocks and never returns nothing. `put()` happens implicitly when
//! the last reference to a [`Sample`](super::Sample) drops.
//!
//! The pool is safe for concurrent producers and consumers; each bucket is a
//! `crossbeam` Treiber-style queue and all accounting is atomic.

use super::{SampleBuf, SampleData, SampleType};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Capacity classes in elements.
const CLASS_SIZES: &[usize] = &[
    16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// Per-bucket retention cap. A bucket at its cap drops returned buffers to
/// the allocator instead of growing without bound.
const BUCKET_WATERMARK: usize = 64;

const NUM_TYPES: usize = 7;

fn type_index(t: SampleType) -> usize {
    t.code() as usize
}

/// Smallest class index whose size is >= `nelems`, or the largest class for
/// oversize requests (which then allocate exactly).
fn class_for(nelems: usize) -> Option<usize> {
    CLASS_SIZES.iter().position(|&c| c >= nelems)
}

/// Class index a returned buffer files under: the largest class size that is
/// <= its capacity, so a later `get` from that bucket is always satisfied.
fn class_for_capacity(cap: usize) -> Option<usize> {
    if cap < CLASS_SIZES[0] {
        return None;
    }
    Some(
        CLASS_SIZES
            .iter()
            .rposition(|&c| c <= cap)
            .unwrap_or(CLASS_SIZES.len() - 1),
    )
}

pub(crate) struct PoolShared {
    buckets: Vec<SegQueue<SampleData>>,
    /// Samples handed out and not yet returned.
    outstanding: AtomicUsize,
    /// Fresh allocations (freelist misses).
    allocations: AtomicUsize,
    /// Freelist hits.
    hits: AtomicUsize,
}

impl PoolShared {
    fn bucket(&self, t: SampleType, class: usize) -> &SegQueue<SampleData> {
        &self.buckets[type_index(t) * CLASS_SIZES.len() + class]
    }

    /// Return a payload buffer to its bucket. Called from `Carrier::drop`.
    pub(crate) fn put(&self, mut data: SampleData) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let t = data.sample_type();
        if let Some(class) = class_for_capacity(data.capacity()) {
            let bucket = self.bucket(t, class);
            if bucket.len() < BUCKET_WATERMARK {
                data.clear();
                bucket.push(data);
            }
        }
        // Undersized or over-watermark buffers just drop.
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Buffers handed out and not yet returned.
    pub outstanding: usize,
    /// Fresh heap allocations.
    pub allocations: usize,
    /// Requests served from the freelist.
    pub hits: usize,
}

/// Process-wide sample allocator. Cheap to clone; all clones share the
/// freelists.
#[derive(Clone)]
pub struct SamplePool {
    shared: Arc<PoolShared>,
}

static GLOBAL_POOL: OnceLock<SamplePool> = OnceLock::new();

impl SamplePool {
    pub fn new() -> Self {
        let buckets = (0..NUM_TYPES * CLASS_SIZES.len())
            .map(|_| SegQueue::new())
            .collect();
        SamplePool {
            shared: Arc::new(PoolShared {
                buckets,
                outstanding: AtomicUsize::new(0),
                allocations: AtomicUsize::new(0),
                hits: AtomicUsize::new(0),
            }),
        }
    }

    /// The process-wide pool, created on first use. The [`Runtime`]
    /// (crate::runtime::Runtime) touches it during startup so it exists
    /// before any acquisition thread allocates.
    pub fn global() -> &'static SamplePool {
        GLOBAL_POOL.get_or_init(SamplePool::new)
    }

    /// Get a cleared sample buffer of at least `nelems` elements of `t`.
    ///
    /// Never fails: a freelist miss allocates a fresh buffer.
    pub fn get(&self, t: SampleType, nelems: usize) -> SampleBuf {
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(start) = class_for(nelems) {
            for class in start..CLASS_SIZES.len() {
                if let Some(data) = self.shared.bucket(t, class).pop() {
                    self.shared.hits.fetch_add(1, Ordering::Relaxed);
                    return SampleBuf::new(data, Arc::downgrade(&self.shared));
                }
            }
        }
        self.shared.allocations.fetch_add(1, Ordering::Relaxed);
        let cap = match class_for(nelems) {
            Some(c) => CLASS_SIZES[c],
            None => nelems,
        };
        let data = match t {
            SampleType::Char => SampleData::Char(Vec::with_capacity(cap)),
            SampleType::UInt16 => SampleData::UInt16(Vec::with_capacity(cap)),
            SampleType::Int16 => SampleData::Int16(Vec::with_capacity(cap)),
            SampleType::UInt32 => SampleData::UInt32(Vec::with_capacity(cap)),
            SampleType::Int32 => SampleData::Int32(Vec::with_capacity(cap)),
            SampleType::Float32 => SampleData::Float32(Vec::with_capacity(cap)),
            SampleType::Float64 => SampleData::Float64(Vec::with_capacity(cap)),
        };
        SampleBuf::new(data, Arc::downgrade(&self.shared))
    }

    /// Get a Float32 sample of exactly `nelems` values, NaN-filled.
    pub fn get_floats(&self, nelems: usize) -> SampleBuf {
        let mut buf = self.get(SampleType::Float32, nelems);
        if let SampleData::Float32(v) = buf.data_mut() {
            v.resize(nelems, f32::NAN);
        }
        buf
    }

    /// Get a Char sample holding a copy of `bytes`.
    pub fn get_chars(&self, bytes: &[u8]) -> SampleBuf {
        let mut buf = self.get(SampleType::Char, bytes.len());
        if let SampleData::Char(v) = buf.data_mut() {
            v.extend_from_slice(bytes);
        }
        buf
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
            allocations: self.shared.allocations.load(Ordering::Relaxed),
            hits: self.shared.hits.load(Ordering::Relaxed),
        }
    }

}

impl Default for SamplePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::make_id;

    #[test]
    fn test_class_lookup() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(65536), Some(CLASS_SIZES.len() - 1));
        assert_eq!(class_for(65537), None);

        assert_eq!(class_for_capacity(8), None);
        assert_eq!(class_for_capacity(16), Some(0));
        assert_eq!(class_for_capacity(31), Some(0));
        assert_eq!(class_for_capacity(32), Some(1));
    }

    #[test]
    fn test_get_share_drop_recycles() {
        let pool = SamplePool::new();
        let mut buf = pool.get(SampleType::Float32, 10);
        if let SampleData::Float32(v) = buf.data_mut() {
            v.extend_from_slice(&[1.0, 2.0]);
        }
        buf.set_time_tag(5).set_id(make_id(1, 1));
        let s = buf.share();
        assert_eq!(pool.stats().outstanding, 1);
        assert_eq!(pool.stats().allocations, 1);

        drop(s);
        assert_eq!(pool.stats().outstanding, 0);

        // Same-class request is a freelist hit and arrives cleared.
        let mut buf = pool.get(SampleType::Float32, 8);
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(buf.data_mut().len(), 0);
    }

    #[test]
    fn test_shared_refs_return_once() {
        let pool = SamplePool::new();
        let s = pool.get_floats(4).share();
        let clones: Vec<_> = (0..5).map(|_| s.clone_ref()).collect();
        assert_eq!(pool.stats().outstanding, 1);
        drop(clones);
        assert_eq!(pool.stats().outstanding, 1);
        drop(s);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_types_do_not_mix_buckets() {
        let pool = SamplePool::new();
        drop(pool.get(SampleType::Float32, 10).share());
        // A char request after a float return must not hit the float bucket.
        let _c = pool.get(SampleType::Char, 10);
        assert_eq!(pool.stats().allocations, 2);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = SamplePool::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = pool.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let mut buf = p.get(SampleType::Float32, (i % 100) + 1);
                    if let SampleData::Float32(v) = buf.data_mut() {
                        v.push(i as f32);
                    }
                    drop(buf.share());
                }
            }));
        }
        for h in handles {
            h.join().expect("pool worker panicked");
        }
        assert_eq!(pool.stats().outstanding, 0);
    }
}
