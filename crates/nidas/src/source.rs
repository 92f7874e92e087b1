// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample fan-out: sources distribute to registered clients.
//!
//! A producer embeds a [`SampleSourceSupport`] and calls
//! [`distribute`](SampleSourceSupport::distribute) for each sample. Clients
//! registered for the whole source receive every sample; clients registered
//! for a tag receive only samples with that tag's id. Clients are invoked in
//! registration order; a client that retains a sample past `receive()` calls
//! `clone_ref` before returning.
//!
//! Client lists are guarded by short mutexes taken only during add/remove and
//! at the top of `distribute`; per-id first/last statistics live in a
//! concurrent map so status readers never contend with the hot path.

use crate::sample::tag::SampleTag;
use crate::sample::{address_of, Sample, SampleId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A consumer of samples.
///
/// `receive` returns true if the sample was consumed, false if it was
/// rejected (filter did not match). `flush` signals end-of-data so the
/// client can emit anything pending.
pub trait SampleClient: Send + Sync {
    fn receive(&self, sample: &Sample) -> bool;

    fn flush(&self) {}
}

/// A producer of samples.
pub trait SampleSource {
    /// Fan-out state for this source.
    fn support(&self) -> &SampleSourceSupport;

    /// The raw-sample side of this source, if it has one.
    fn raw_source(&self) -> Option<&SampleSourceSupport> {
        None
    }

    /// The processed-sample side of this source.
    fn processed_source(&self) -> Option<&SampleSourceSupport> {
        Some(self.support())
    }
}

/// Aggregate statistics kept by every source.
///
/// Counters are written from the distributing thread; readers load them
/// individually and tolerate cross-field skew.
#[derive(Debug, Default)]
pub struct SourceStats {
    nsamples: AtomicU64,
    nbytes: AtomicU64,
    last_time_tag: AtomicI64,
    min_len: AtomicUsize,
    max_len: AtomicUsize,
    back_in_time: AtomicU64,
}

/// Snapshot of [`SourceStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceStatsSnapshot {
    pub nsamples: u64,
    pub nbytes: u64,
    pub last_time_tag: i64,
    pub min_len: usize,
    pub max_len: usize,
    pub back_in_time: u64,
}

impl SourceStats {
    fn update(&self, s: &Sample) {
        self.nsamples.fetch_add(1, Ordering::Relaxed);
        self.nbytes.fetch_add(s.byte_len() as u64, Ordering::Relaxed);
        let tt = s.time_tag();
        let prev = self.last_time_tag.swap(tt, Ordering::AcqRel);
        if tt < prev {
            self.back_in_time.fetch_add(1, Ordering::Relaxed);
        }
        self.min_len.fetch_min(s.byte_len(), Ordering::Relaxed);
        self.max_len.fetch_max(s.byte_len(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SourceStatsSnapshot {
        let min = self.min_len.load(Ordering::Relaxed);
        SourceStatsSnapshot {
            nsamples: self.nsamples.load(Ordering::Relaxed),
            nbytes: self.nbytes.load(Ordering::Relaxed),
            last_time_tag: self.last_time_tag.load(Ordering::Acquire),
            min_len: if min == usize::MAX { 0 } else { min },
            max_len: self.max_len.load(Ordering::Relaxed),
            back_in_time: self.back_in_time.load(Ordering::Relaxed),
        }
    }
}

/// First/last timetags seen for one distinct sample id, for status display.
#[derive(Debug, Clone, Copy)]
pub struct IdStats {
    pub first_time_tag: i64,
    pub last_time_tag: i64,
    pub nsamples: u64,
}

/// Fan-out state embedded by every source.
pub struct SampleSourceSupport {
    clients: Mutex<Vec<Arc<dyn SampleClient>>>,
    tag_clients: Mutex<HashMap<SampleId, Vec<Arc<dyn SampleClient>>>>,
    tags: Mutex<Vec<Arc<SampleTag>>>,
    stats: SourceStats,
    id_stats: DashMap<SampleId, IdStats>,
}

impl SampleSourceSupport {
    pub fn new() -> Self {
        let stats = SourceStats::default();
        stats.min_len.store(usize::MAX, Ordering::Relaxed);
        SampleSourceSupport {
            clients: Mutex::new(Vec::new()),
            tag_clients: Mutex::new(HashMap::new()),
            tags: Mutex::new(Vec::new()),
            stats,
            id_stats: DashMap::new(),
        }
    }

    /// Declare a tag this source produces. Freezes the tag's layout.
    pub fn add_sample_tag(&self, mut tag: SampleTag) -> Arc<SampleTag> {
        tag.freeze();
        let tag = Arc::new(tag);
        self.tags.lock().push(tag.clone());
        tag
    }

    pub fn sample_tags(&self) -> Vec<Arc<SampleTag>> {
        self.tags.lock().clone()
    }

    pub fn add_sample_client(&self, client: Arc<dyn SampleClient>) {
        self.clients.lock().push(client);
    }

    pub fn add_sample_client_for_tag(&self, client: Arc<dyn SampleClient>, tag: &SampleTag) {
        self.tag_clients
            .lock()
            .entry(address_of(tag.id()))
            .or_default()
            .push(client);
    }

    /// Remove a client from the whole-source list and every per-tag list.
    pub fn remove_sample_client(&self, client: &Arc<dyn SampleClient>) {
        self.clients
            .lock()
            .retain(|c| !Arc::ptr_eq(c, client));
        let mut map = self.tag_clients.lock();
        for list in map.values_mut() {
            list.retain(|c| !Arc::ptr_eq(c, client));
        }
        map.retain(|_, list| !list.is_empty());
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Distribute one sample to every registered client in order.
    ///
    /// The per-call snapshot of the client lists keeps the locks off the
    /// receive path.
    pub fn distribute(&self, sample: &Sample) {
        self.stats.update(sample);
        let tt = sample.time_tag();
        let addr = address_of(sample.id());
        self.id_stats
            .entry(addr)
            .and_modify(|e| {
                e.last_time_tag = tt;
                e.nsamples += 1;
            })
            .or_insert(IdStats {
                first_time_tag: tt,
                last_time_tag: tt,
                nsamples: 1,
            });

        let clients: Vec<_> = self.clients.lock().clone();
        for c in &clients {
            c.receive(sample);
        }
        let tagged: Option<Vec<_>> = self.tag_clients.lock().get(&addr).cloned();
        if let Some(tagged) = tagged {
            for c in &tagged {
                c.receive(sample);
            }
        }
    }

    /// Forward a flush to every client.
    pub fn flush(&self) {
        let clients: Vec<_> = self.clients.lock().clone();
        for c in &clients {
            c.flush();
        }
        let tagged: Vec<_> = self
            .tag_clients
            .lock()
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect();
        for c in &tagged {
            c.flush();
        }
    }

    pub fn sample_stats(&self) -> SourceStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-id first/last timetags, for status pages.
    pub fn id_stats(&self) -> Vec<(SampleId, IdStats)> {
        let mut v: Vec<_> = self
            .id_stats
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        v.sort_by_key(|(id, _)| *id);
        v
    }
}

impl Default for SampleSourceSupport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tag::Variable;
    use crate::sample::{make_id, SamplePool};

    struct Collector {
        seen: Mutex<Vec<SampleId>>,
        kept: Mutex<Vec<Sample>>,
        flushes: AtomicUsize,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Collector {
                seen: Mutex::new(Vec::new()),
                kept: Mutex::new(Vec::new()),
                flushes: AtomicUsize::new(0),
            })
        }
    }

    impl SampleClient for Collector {
        fn receive(&self, sample: &Sample) -> bool {
            self.seen.lock().push(sample.id());
            // retain past receive(): take a reference explicitly
            self.kept.lock().push(sample.clone_ref());
            true
        }

        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn float_sample(pool: &SamplePool, id: SampleId, tt: i64) -> Sample {
        let mut buf = pool.get_floats(2);
        buf.set_time_tag(tt).set_id(id);
        buf.share()
    }

    #[test]
    fn test_distribute_order_and_tag_filter() {
        let pool = SamplePool::new();
        let src = SampleSourceSupport::new();

        let mut tag = SampleTag::new(make_id(1, 0x10), 1.0);
        tag.add_variable(Variable::new("T")).unwrap();
        let tag = src.add_sample_tag(tag);

        let all = Collector::new();
        let tagged = Collector::new();
        src.add_sample_client(all.clone());
        src.add_sample_client_for_tag(tagged.clone(), &tag);

        src.distribute(&float_sample(&pool, make_id(1, 0x10), 1000));
        src.distribute(&float_sample(&pool, make_id(1, 0x11), 2000));

        assert_eq!(all.seen.lock().len(), 2);
        // per-tag client saw only its id
        assert_eq!(&*tagged.seen.lock(), &[make_id(1, 0x10)]);

        src.flush();
        assert_eq!(all.flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remove_client() {
        let pool = SamplePool::new();
        let src = SampleSourceSupport::new();
        let c = Collector::new();
        let as_client: Arc<dyn SampleClient> = c.clone();
        src.add_sample_client(c.clone());
        src.remove_sample_client(&as_client);
        src.distribute(&float_sample(&pool, make_id(1, 1), 1));
        assert!(c.seen.lock().is_empty());
        assert_eq!(src.client_count(), 0);
    }

    #[test]
    fn test_stats_back_in_time_and_lengths() {
        let pool = SamplePool::new();
        let src = SampleSourceSupport::new();
        src.distribute(&float_sample(&pool, make_id(1, 1), 2000));
        src.distribute(&float_sample(&pool, make_id(1, 1), 1000));

        let st = src.sample_stats();
        assert_eq!(st.nsamples, 2);
        assert_eq!(st.nbytes, 16);
        assert_eq!(st.back_in_time, 1);
        assert_eq!(st.min_len, 8);
        assert_eq!(st.max_len, 8);
        assert_eq!(st.last_time_tag, 1000);

        let ids = src.id_stats();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].1.first_time_tag, 2000);
        assert_eq!(ids[0].1.last_time_tag, 1000);
        assert_eq!(ids[0].1.nsamples, 2);
    }
}
