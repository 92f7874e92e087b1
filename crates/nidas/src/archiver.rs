// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The archiver: connects sample sources to a set of outputs.
//!
//! Each incoming sample is handed to every live output (which rolls its own
//! files and flushes on latency). An output that disconnects is dropped and
//! a reconnect request is queued to a background thread, which rebuilds the
//! output from its factory after a delay with exponential-then-capped
//! backoff. A live status view per output feeds external status pages.

use crate::error::Result;
use crate::output::{SampleOutputClient, SampleOutputStream};
use crate::sample::Sample;
use crate::source::{SampleClient, SampleSource};
use crate::time::DsmTime;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Rebuilds an output's channel after a disconnect.
pub type OutputFactory = Box<dyn Fn() -> Result<SampleOutputStream> + Send + Sync>;

/// Live status of one output.
#[derive(Debug, Clone, Default)]
pub struct OutputStatus {
    pub name: String,
    pub connected: bool,
    pub last_time_tag: DsmTime,
    pub samples_per_sec: f64,
    pub bytes_per_sec: f64,
    pub current_file: Option<String>,
    pub file_size: u64,
    pub last_error: Option<String>,
}

struct OutputSlot {
    name: String,
    factory: Arc<OutputFactory>,
    client: Option<Arc<SampleOutputClient>>,
    last_error: Option<String>,
    // previous counters for rate computation in status()
    prev_nsamples: u64,
    prev_nbytes: u64,
    prev_at: Instant,
}

struct ReconnectRequest {
    slot: usize,
    attempt: u32,
}

/// Cap on the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

pub struct SampleArchiver {
    name: String,
    slots: Arc<Mutex<Vec<OutputSlot>>>,
    reconnect_tx: Mutex<Option<Sender<ReconnectRequest>>>,
    reconnect_thread: Mutex<Option<JoinHandle<()>>>,
    reconnect_delay: Duration,
    /// Archive the raw or the processed side of connected sources.
    raw: AtomicBool,
}

impl SampleArchiver {
    pub fn new(name: impl Into<String>) -> Arc<SampleArchiver> {
        Self::with_reconnect_delay(name, Duration::from_secs(10))
    }

    pub fn with_reconnect_delay(
        name: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Arc<SampleArchiver> {
        let (tx, rx) = unbounded::<ReconnectRequest>();
        let slots: Arc<Mutex<Vec<OutputSlot>>> = Arc::new(Mutex::new(Vec::new()));
        let name = name.into();

        let backoff = move |attempt: u32| {
            reconnect_delay
                .saturating_mul(1u32 << attempt.min(5))
                .min(MAX_BACKOFF)
        };

        let thread_slots = slots.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("reconnect {name}"))
            .spawn(move || {
                // (slot, attempt, due time); retried here, never re-queued,
                // so a dropped sender always ends the thread
                let mut pending: Vec<(usize, u32, Instant)> = Vec::new();
                loop {
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(req) => {
                            let due = Instant::now() + backoff(req.attempt);
                            pending.push((req.slot, req.attempt, due));
                        }
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                    }

                    let now = Instant::now();
                    let mut retry = Vec::new();
                    for (slot_idx, attempt, due) in pending.drain(..) {
                        if due > now {
                            retry.push((slot_idx, attempt, due));
                            continue;
                        }
                        let factory = {
                            let slots = thread_slots.lock();
                            match slots.get(slot_idx) {
                                Some(s) => s.factory.clone(),
                                None => continue,
                            }
                        };
                        match factory() {
                            Ok(output) => {
                                log::info!(
                                    "[SampleArchiver] {thread_name}: reconnected {}",
                                    output.name()
                                );
                                let client = SampleOutputClient::new(output);
                                let mut slots = thread_slots.lock();
                                if let Some(s) = slots.get_mut(slot_idx) {
                                    s.client = Some(client);
                                    s.last_error = None;
                                }
                            }
                            Err(e) => {
                                log::warn!(
                                    "[SampleArchiver] {thread_name}: reconnect attempt {} failed: {e}",
                                    attempt + 1
                                );
                                {
                                    let mut slots = thread_slots.lock();
                                    if let Some(s) = slots.get_mut(slot_idx) {
                                        s.last_error = Some(e.to_string());
                                    }
                                }
                                let next = attempt + 1;
                                retry.push((slot_idx, next, Instant::now() + backoff(next)));
                            }
                        }
                    }
                    pending = retry;
                }
            })
            .expect("spawn reconnect thread");

        Arc::new(SampleArchiver {
            name,
            slots,
            reconnect_tx: Mutex::new(Some(tx)),
            reconnect_thread: Mutex::new(Some(handle)),
            reconnect_delay,
            raw: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Select the raw (default) or processed side of connected sources.
    /// Takes effect for subsequent connect_source calls.
    pub fn set_raw(&self, raw: bool) {
        self.raw.store(raw, Ordering::Release);
    }

    /// Register an output. The factory builds the initial connection and
    /// every reconnection after a failure.
    pub fn add_output(&self, factory: OutputFactory) -> Result<()> {
        let output = factory()?;
        let name = output.name().to_string();
        let client = SampleOutputClient::new(output);
        self.slots.lock().push(OutputSlot {
            name,
            factory: Arc::new(factory),
            client: Some(client),
            last_error: None,
            prev_nsamples: 0,
            prev_nbytes: 0,
            prev_at: Instant::now(),
        });
        Ok(())
    }

    /// Wire this archiver as a client of `source`, preferring its raw side
    /// when raw archiving is selected.
    pub fn connect_source(self: &Arc<Self>, source: &dyn SampleSource) {
        let support = if self.raw.load(Ordering::Acquire) {
            source.raw_source().unwrap_or_else(|| source.support())
        } else {
            source
                .processed_source()
                .unwrap_or_else(|| source.support())
        };
        support.add_sample_client(self.clone());
    }

    /// Per-output live status.
    pub fn status(&self) -> Vec<OutputStatus> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        slots
            .iter_mut()
            .map(|slot| {
                let mut st = OutputStatus {
                    name: slot.name.clone(),
                    connected: slot.client.is_some(),
                    last_error: slot.last_error.clone(),
                    ..Default::default()
                };
                if let Some(client) = &slot.client {
                    client.with_output(|out| {
                        let dt = now.duration_since(slot.prev_at).as_secs_f64().max(1e-6);
                        st.last_time_tag = out.last_time_tag();
                        st.samples_per_sec =
                            (out.samples_written() - slot.prev_nsamples) as f64 / dt;
                        st.bytes_per_sec = (out.bytes_written() - slot.prev_nbytes) as f64 / dt;
                        st.current_file = out.current_file();
                        st.file_size = out.current_file_size();
                        slot.prev_nsamples = out.samples_written();
                        slot.prev_nbytes = out.bytes_written();
                    });
                    slot.prev_at = now;
                }
                st
            })
            .collect()
    }

    /// Flush and close every output, stopping the reconnect thread.
    pub fn shutdown(&self) {
        // dropping the sender ends the reconnect loop
        self.reconnect_tx.lock().take();
        if let Some(h) = self.reconnect_thread.lock().take() {
            let _ = h.join();
        }
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if let Some(client) = &slot.client {
                client.with_output(|out| {
                    if let Err(e) = out.close() {
                        if !e.is_disconnect() {
                            log::error!("[SampleArchiver] {}: close: {e}", out.name());
                        }
                    }
                });
            }
        }
    }
}

impl SampleClient for SampleArchiver {
    fn receive(&self, sample: &Sample) -> bool {
        let mut delivered = false;
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            let Some(client) = &slot.client else {
                continue;
            };
            if client.receive(sample) {
                delivered = true;
            }
            if client.is_disconnected() {
                // delete the dead clone, queue a rebuild of the original
                slot.client = None;
                slot.last_error = Some("disconnected".into());
                if let Some(tx) = &*self.reconnect_tx.lock() {
                    let _ = tx.send(ReconnectRequest {
                        slot: i,
                        attempt: 0,
                    });
                }
            }
        }
        delivered
    }

    fn flush(&self) {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            if let Some(client) = &slot.client {
                SampleClient::flush(client.as_ref());
            }
        }
    }
}

impl Drop for SampleArchiver {
    fn drop(&mut self) {
        self.reconnect_tx.lock().take();
        if let Some(h) = self.reconnect_thread.lock().take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveHeader;
    use crate::io::{FileChannel, IOChannel};
    use crate::sample::{make_id, SampleData, SamplePool, SampleType};

    fn float_sample(pool: &SamplePool, tt: i64, val: f32) -> Sample {
        let mut buf = pool.get(SampleType::Float32, 1);
        if let SampleData::Float32(v) = buf.data_mut() {
            v.push(val);
        }
        buf.set_time_tag(tt).set_id(make_id(1, 1));
        buf.share()
    }

    #[test]
    fn test_archiver_fans_to_outputs_and_reports_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p1 = dir.path().join("a.dat");
        let p2 = dir.path().join("b.dat");
        let pool = SamplePool::new();

        let archiver = SampleArchiver::new("archiver");
        for p in [&p1, &p2] {
            let p = p.clone();
            archiver
                .add_output(Box::new(move || {
                    Ok(crate::output::SampleOutputStream::new(
                        IOChannel::File(FileChannel::create(&p)?),
                        ArchiveHeader::default(),
                    ))
                }))
                .expect("add output");
        }

        for i in 0..5 {
            assert!(archiver.receive(&float_sample(&pool, 1_000_000 * i, i as f32)));
        }
        SampleClient::flush(archiver.as_ref());

        let status = archiver.status();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.connected));
        assert!(status.iter().all(|s| s.last_time_tag == 4_000_000));
        assert!(status.iter().all(|s| s.file_size > 0));

        archiver.shutdown();
        assert!(std::fs::metadata(&p1).unwrap().len() > 0);
        assert_eq!(
            std::fs::metadata(&p1).unwrap().len(),
            std::fs::metadata(&p2).unwrap().len()
        );
    }

    #[test]
    fn test_disconnected_output_is_rebuilt() {
        use crate::io::{ConnectionRequester, ServerSocket, SocketChannel};
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Sink {
            accepted: AtomicUsize,
        }
        impl ConnectionRequester for Sink {
            fn connected(&self, mut channel: IOChannel) {
                let n = self.accepted.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // hang up on the first peer immediately
                    let _ = channel.close();
                } else {
                    // keep the second connection alive by leaking it
                    std::mem::forget(channel);
                }
            }
        }

        let server = ServerSocket::bind(0).expect("bind");
        let port = server.local_port().expect("port");
        let sink = Arc::new(Sink {
            accepted: AtomicUsize::new(0),
        });
        server.accept_loop(sink.clone()).expect("accept loop");

        let pool = SamplePool::new();
        let archiver =
            SampleArchiver::with_reconnect_delay("arch", Duration::from_millis(20));
        archiver
            .add_output(Box::new(move || {
                Ok(crate::output::SampleOutputStream::new(
                    IOChannel::Socket(SocketChannel::connect("127.0.0.1", port)?),
                    ArchiveHeader::default(),
                ))
            }))
            .expect("add output");

        // hammer until the closed peer surfaces as a disconnect
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut i = 0i64;
        while archiver.status()[0].connected && std::time::Instant::now() < deadline {
            i += 1;
            archiver.receive(&float_sample(&pool, i, 0.0));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!archiver.status()[0].connected, "disconnect never detected");

        // the reconnect thread rebuilds the output against the live server
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !archiver.status()[0].connected && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(archiver.status()[0].connected, "output never reconnected");
        assert!(sink.accepted.load(Ordering::SeqCst) >= 2);

        archiver.shutdown();
    }
}
