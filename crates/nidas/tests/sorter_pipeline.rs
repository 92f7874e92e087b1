// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sorting stage: monotonic output under bounded lateness, cap policies.

use nidas::sample::{make_id, SampleData, SampleType};
use nidas::source::{SampleClient, SampleSource};
use nidas::{OverflowPolicy, Sample, SampleSorter, SamplePool, SorterConfig};
use parking_lot::Mutex;
use std::sync::Arc;

struct Collector {
    tts: Mutex<Vec<i64>>,
}

impl SampleClient for Collector {
    fn receive(&self, s: &Sample) -> bool {
        self.tts.lock().push(s.time_tag());
        true
    }
}

fn sample(pool: &SamplePool, tt: i64) -> Sample {
    let mut buf = pool.get(SampleType::Float32, 1);
    if let SampleData::Float32(v) = buf.data_mut() {
        v.push(0.0);
    }
    buf.set_time_tag(tt).set_id(make_id(1, 1));
    buf.share()
}

/// Inputs monotonic per source, cross-source lateness under the window:
/// output is monotonic with zero drops.
#[test]
fn bounded_lateness_yields_monotonic_output() {
    let pool = SamplePool::new();
    let sorter = SampleSorter::new(SorterConfig {
        sort_length_usecs: 500_000,
        ..Default::default()
    });
    let out = Arc::new(Collector {
        tts: Mutex::new(Vec::new()),
    });
    sorter.support().add_sample_client(out.clone());

    // three streams sharing a timeline, skewed by fixed lags below the
    // window; arrival order is round-robin, so the most-skewed stream is
    // always 400 ms late relative to the newest
    let mut rng = fastrand::Rng::with_seed(99);
    let skews = [0i64, 150_000, 400_000];
    let mut base = 1_000_000i64;
    let mut fed = 0usize;
    for _ in 0..200 {
        base += rng.i64(10_000..60_000);
        for &skew in &skews {
            assert!(sorter.receive(&sample(&pool, base - skew)));
            fed += 1;
        }
    }
    SampleClient::flush(sorter.as_ref());
    sorter.finish();

    let tts = out.tts.lock();
    assert_eq!(tts.len(), fed, "samples were lost");
    assert!(tts.windows(2).all(|w| w[0] <= w[1]), "output not monotonic");
    assert_eq!(sorter.dropped(), 0);
}

#[test]
fn block_policy_keeps_everything_in_order() {
    let pool = SamplePool::new();
    let sorter = SampleSorter::new(SorterConfig {
        sort_length_usecs: 500_000,
        heap_max_bytes: 4,
        late_cache_max: 1,
        policy: OverflowPolicy::Block,
    });
    let out = Arc::new(Collector {
        tts: Mutex::new(Vec::new()),
    });
    sorter.support().add_sample_client(out.clone());

    for tt in [0, 1_000_000, 500_000] {
        assert!(sorter.receive(&sample(&pool, tt)));
    }
    SampleClient::flush(sorter.as_ref());
    sorter.finish();

    assert_eq!(*out.tts.lock(), vec![0, 500_000, 1_000_000]);
    assert_eq!(sorter.dropped(), 0);
}

#[test]
fn drop_policy_sheds_late_samples() {
    let pool = SamplePool::new();
    let sorter = SampleSorter::new(SorterConfig {
        sort_length_usecs: 500_000,
        heap_max_bytes: 4,
        late_cache_max: 1,
        policy: OverflowPolicy::Drop,
    });
    let out = Arc::new(Collector {
        tts: Mutex::new(Vec::new()),
    });
    sorter.support().add_sample_client(out.clone());

    assert!(sorter.receive(&sample(&pool, 0)));
    assert!(sorter.receive(&sample(&pool, 1_000_000)));
    assert!(!sorter.receive(&sample(&pool, 500_000)));
    SampleClient::flush(sorter.as_ref());
    sorter.finish();

    assert_eq!(*out.tts.lock(), vec![0, 1_000_000]);
    assert_eq!(sorter.dropped(), 1);
}
