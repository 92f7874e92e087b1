// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded re-ordering of samples by timetag.
//!
//! Incoming samples go into a min-heap; a worker thread releases, in order,
//! every sample older than `latest_seen - sort_length`. If the inputs are
//! each monotonic and no stream lags another by more than `sort_length`, the
//! output is monotonic with zero loss.
//!
//! Two caps bound memory: `heap_max` bytes and `late_cache_max` samples.
//! Past a cap, [`OverflowPolicy::Block`] stalls the producer until the
//! worker frees room (releasing the oldest early if it has to), while
//! [`OverflowPolicy::Drop`] discards the arriving sample and counts it.

use crate::config::{DEFAULT_HEAP_MAX, DEFAULT_LATE_SAMPLE_CACHE, DEFAULT_SORT_LENGTH_USECS};
use crate::sample::Sample;
use crate::source::{SampleClient, SampleSource, SampleSourceSupport};
use crate::time::DsmTime;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Stall the producer until the worker makes room.
    Block,
    /// Discard the arriving sample and count it.
    Drop,
}

#[derive(Debug, Clone)]
pub struct SorterConfig {
    pub sort_length_usecs: DsmTime,
    pub heap_max_bytes: usize,
    pub late_cache_max: usize,
    pub policy: OverflowPolicy,
}

impl Default for SorterConfig {
    fn default() -> Self {
        SorterConfig {
            sort_length_usecs: DEFAULT_SORT_LENGTH_USECS,
            heap_max_bytes: DEFAULT_HEAP_MAX,
            late_cache_max: DEFAULT_LATE_SAMPLE_CACHE,
            policy: OverflowPolicy::Block,
        }
    }
}

struct Entry {
    time_tag: DsmTime,
    /// Arrival sequence; stabilizes ordering of equal timetags.
    seq: u64,
    sample: Sample,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time_tag == other.time_tag && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time_tag, self.seq).cmp(&(other.time_tag, other.seq))
    }
}

struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    heap_bytes: usize,
    latest: DsmTime,
    seq: u64,
    /// Producers currently blocked on the caps.
    waiting: usize,
}

struct Shared {
    state: Mutex<State>,
    /// Serializes collect+distribute so concurrent releases (worker vs
    /// flush) cannot interleave out of order.
    emit: Mutex<()>,
    worker_wake: Condvar,
    producer_wake: Condvar,
    support: SampleSourceSupport,
    config: SorterConfig,
    running: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn over_caps(&self, state: &State, incoming_bytes: usize) -> bool {
        state.heap_bytes + incoming_bytes > self.config.heap_max_bytes
            || state.heap.len() + usize::from(incoming_bytes > 0) > self.config.late_cache_max
    }

    /// Pop everything releasable under the window; if producers are stalled
    /// and the window released nothing, free the oldest anyway.
    fn collect_ready(&self, state: &mut State) -> Vec<Sample> {
        let threshold = state.latest - self.config.sort_length_usecs;
        let mut batch = Vec::new();
        while let Some(Reverse(e)) = state.heap.peek() {
            if e.time_tag > threshold {
                break;
            }
            let Reverse(e) = state.heap.pop().expect("peeked entry");
            state.heap_bytes -= e.sample.byte_len();
            batch.push(e.sample);
        }
        if state.waiting > 0 {
            while self.over_caps(state, 0) {
                match state.heap.pop() {
                    Some(Reverse(e)) => {
                        state.heap_bytes -= e.sample.byte_len();
                        batch.push(e.sample);
                    }
                    None => break,
                }
            }
        }
        batch
    }
}

/// The sorting stage. A client on the input side, a source on the output.
pub struct SampleSorter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SampleSorter {
    pub fn new(config: SorterConfig) -> Arc<SampleSorter> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                heap_bytes: 0,
                latest: DsmTime::MIN,
                seq: 0,
                waiting: 0,
            }),
            emit: Mutex::new(()),
            worker_wake: Condvar::new(),
            producer_wake: Condvar::new(),
            support: SampleSourceSupport::new(),
            config,
            running: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("sample sorter".into())
            .spawn(move || worker(&worker_shared))
            .expect("spawn sorter thread");

        Arc::new(SampleSorter {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &SorterConfig {
        &self.shared.config
    }

    /// Samples discarded under [`OverflowPolicy::Drop`].
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Buffered samples not yet released.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the worker, draining everything buffered in order.
    pub fn finish(&self) {
        self.flush();
        self.shared.running.store(false, Ordering::Release);
        self.shared.worker_wake.notify_all();
        self.shared.producer_wake.notify_all();
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
    }
}

impl SampleSource for SampleSorter {
    fn support(&self) -> &SampleSourceSupport {
        &self.shared.support
    }
}

impl SampleClient for SampleSorter {
    fn receive(&self, sample: &Sample) -> bool {
        let bytes = sample.byte_len().max(1);
        let mut state = self.shared.state.lock();

        // In-order samples always enter: they advance the window and age
        // the heap out. Only late arrivals are subject to the Drop policy.
        if self.shared.config.policy == OverflowPolicy::Drop
            && sample.time_tag() < state.latest
            && self.shared.over_caps(&state, bytes)
        {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        state.latest = state.latest.max(sample.time_tag());
        state.seq += 1;
        let seq = state.seq;
        state.heap_bytes += sample.byte_len();
        state.heap.push(Reverse(Entry {
            time_tag: sample.time_tag(),
            seq,
            sample: sample.clone_ref(),
        }));
        self.shared.worker_wake.notify_one();

        if self.shared.config.policy == OverflowPolicy::Block {
            while self.shared.over_caps(&state, 0)
                && self.shared.running.load(Ordering::Acquire)
            {
                state.waiting += 1;
                self.shared.worker_wake.notify_one();
                self.shared.producer_wake.wait(&mut state);
                state.waiting -= 1;
            }
        }
        true
    }

    /// Drain everything buffered, in order, then flush downstream.
    fn flush(&self) {
        let emit = self.shared.emit.lock();
        let batch: Vec<Sample> = {
            let mut state = self.shared.state.lock();
            let mut batch = Vec::with_capacity(state.heap.len());
            while let Some(Reverse(e)) = state.heap.pop() {
                state.heap_bytes -= e.sample.byte_len();
                batch.push(e.sample);
            }
            batch
        };
        for s in &batch {
            self.shared.support.distribute(s);
        }
        drop(emit);
        self.shared.producer_wake.notify_all();
        self.shared.support.flush();
    }
}

impl Drop for SampleSorter {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.worker_wake.notify_all();
        self.shared.producer_wake.notify_all();
        if let Some(h) = self.worker.lock().take() {
            let _ = h.join();
        }
    }
}

fn worker(shared: &Arc<Shared>) {
    loop {
        // detect releasable work without holding the emit lock
        {
            let mut state = shared.state.lock();
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                let threshold = state.latest - shared.config.sort_length_usecs;
                let ready = state
                    .heap
                    .peek()
                    .is_some_and(|Reverse(e)| e.time_tag <= threshold)
                    || (state.waiting > 0 && shared.over_caps(&state, 0));
                if ready {
                    break;
                }
                shared
                    .worker_wake
                    .wait_for(&mut state, Duration::from_millis(100));
            }
        }

        // collect and distribute under the emit lock, in one ordered unit
        let emit = shared.emit.lock();
        let batch = {
            let mut state = shared.state.lock();
            shared.collect_ready(&mut state)
        };
        for s in &batch {
            shared.support.distribute(s);
        }
        drop(emit);
        shared.producer_wake.notify_all();
    }
}
