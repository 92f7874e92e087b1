// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The acquisition poll loop.
//!
//! One selector thread per DSM polls every sensor descriptor with a short
//! timeout. Mutators never touch the polled set directly: they append to a
//! pending list under a lock and raise a `changed` flag; the thread promotes
//! pending to active between polls, so the hot path takes no locks.
//!
//! The thread also owns the periodic work: the statistics sweep over active
//! sensors and prompting of prompted sensors.

use super::Sensor;
use crate::config::DEFAULT_STATS_PERIOD_SECS;
use crate::error::Result;
use crate::time::{system_time, DsmTime};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll timeout. Short, so newly added sensors are picked up promptly.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Pending {
    add: Vec<Box<dyn Sensor>>,
    close: Vec<String>,
}

struct Shared {
    pending: Mutex<Pending>,
    changed: AtomicBool,
    interrupted: AtomicBool,
    stats_period_secs: u32,
}

struct Active {
    token: Token,
    sensor: Box<dyn Sensor>,
    next_prompt: DsmTime,
}

/// Handle to the selector thread.
pub struct PortSelector {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl PortSelector {
    pub fn new() -> PortSelector {
        Self::with_stats_period(DEFAULT_STATS_PERIOD_SECS)
    }

    pub fn with_stats_period(stats_period_secs: u32) -> PortSelector {
        PortSelector {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending::default()),
                changed: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                stats_period_secs: stats_period_secs.max(1),
            }),
            handle: None,
        }
    }

    /// Queue an opened sensor for the poll set. Callable from any thread.
    pub fn add_sensor(&self, sensor: Box<dyn Sensor>) {
        debug_assert!(sensor.raw_fd() >= 0, "sensor must be open before add");
        self.shared.pending.lock().add.push(sensor);
        self.shared.changed.store(true, Ordering::Release);
    }

    /// Queue a sensor for closure by name. Callable from any thread.
    pub fn close_sensor(&self, name: &str) {
        self.shared.pending.lock().close.push(name.to_string());
        self.shared.changed.store(true, Ordering::Release);
    }

    /// Ask the loop to exit; it closes every sensor on the way out.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }

    /// Start the selector thread.
    pub fn start(&mut self) -> Result<()> {
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("port selector".into())
            .spawn(move || {
                if let Err(e) = run(&shared) {
                    log::error!("[PortSelector] loop failed: {e}");
                }
            })
            .map_err(|e| crate::error::Error::io("selector thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Interrupt and wait for the thread.
    pub fn join(&mut self) {
        self.interrupt();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Default for PortSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PortSelector {
    fn drop(&mut self) {
        self.join();
    }
}

fn next_sweep(now: DsmTime, period_secs: u32) -> DsmTime {
    let p = i64::from(period_secs) * 1_000_000;
    (now.div_euclid(p) + 1) * p
}

fn run(shared: &Arc<Shared>) -> Result<()> {
    let mut poll = Poll::new().map_err(|e| crate::error::Error::io("poll", e))?;
    let mut events = Events::with_capacity(64);
    let mut active: Vec<Active> = Vec::new();
    let mut next_token = 0usize;
    let mut stats_time = next_sweep(system_time(), shared.stats_period_secs);

    loop {
        if shared.interrupted.load(Ordering::Acquire) {
            break;
        }

        // promote pending -> active before polling
        if shared.changed.swap(false, Ordering::AcqRel) {
            let mut pending = shared.pending.lock();
            for sensor in pending.add.drain(..) {
                let token = Token(next_token);
                next_token += 1;
                let fd = sensor.raw_fd();
                if let Err(e) =
                    poll.registry()
                        .register(&mut SourceFd(&fd), token, Interest::READABLE)
                {
                    log::error!("[PortSelector] register {}: {e}", sensor.name());
                    continue;
                }
                log::info!("[PortSelector] polling {}", sensor.name());
                active.push(Active {
                    token,
                    sensor,
                    next_prompt: 0,
                });
            }
            let closures: Vec<String> = pending.close.drain(..).collect();
            drop(pending);
            for name in closures {
                if let Some(idx) = active.iter().position(|a| a.sensor.name() == name) {
                    let mut a = active.remove(idx);
                    let fd = a.sensor.raw_fd();
                    let _ = poll.registry().deregister(&mut SourceFd(&fd));
                    a.sensor.close();
                }
            }
        }

        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(crate::error::Error::io("poll", e));
        }

        let mut dead: Vec<Token> = Vec::new();
        for event in events.iter() {
            let Some(a) = active.iter_mut().find(|a| a.token == event.token()) else {
                continue;
            };
            match a.sensor.read_samples() {
                Ok(_) => {}
                Err(e) if e.is_eof() => {
                    log::info!("[PortSelector] {}: end of input", a.sensor.name());
                    dead.push(a.token);
                }
                Err(e) if e.is_temporary() => {}
                Err(e) => {
                    // log but keep polling; chronic errors show up in the
                    // sensor's counters
                    log::error!("[PortSelector] {}: {e}", a.sensor.name());
                }
            }
        }
        for token in dead {
            if let Some(idx) = active.iter().position(|a| a.token == token) {
                let mut a = active.remove(idx);
                let fd = a.sensor.raw_fd();
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                a.sensor.close();
            }
        }

        let now = system_time();

        // prompts
        for a in active.iter_mut() {
            let Some(p) = a.sensor.prompt() else { continue };
            if p.rate_hz <= 0.0 {
                continue;
            }
            let interval = (1e6 / p.rate_hz) as DsmTime;
            if now >= a.next_prompt {
                if let Err(e) = a.sensor.send_prompt() {
                    log::warn!("[PortSelector] prompt {}: {e}", a.sensor.name());
                }
                a.next_prompt = if a.next_prompt == 0 {
                    now + interval
                } else {
                    a.next_prompt + interval
                };
            }
        }

        // statistics sweep, re-anchored if we fell behind
        if now > stats_time {
            for a in active.iter() {
                a.sensor.stats().calc_statistics(shared.stats_period_secs);
            }
            stats_time += i64::from(shared.stats_period_secs) * 1_000_000;
            if stats_time < now {
                stats_time = next_sweep(now, shared.stats_period_secs);
            }
        }
    }

    log::info!(
        "[PortSelector] finished, closing remaining {} sensors",
        active.len()
    );
    for a in active.iter_mut() {
        let fd = a.sensor.raw_fd();
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
        a.sensor.close();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tag::{SampleTag, Variable};
    use crate::sample::{make_id, Sample, SamplePool};
    use crate::sensor::{CharacterSensor, RecordFraming, SeparatorPosition};
    use crate::source::SampleClient;
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    struct Collector {
        samples: Mutex<Vec<Sample>>,
    }

    impl SampleClient for Collector {
        fn receive(&self, sample: &Sample) -> bool {
            self.samples.lock().push(sample.clone_ref());
            true
        }
    }

    #[test]
    fn test_selector_reads_sensor() {
        let (ours, mut theirs) = UnixStream::pair().expect("socketpair");
        ours.set_nonblocking(true).expect("nonblocking");

        let mut tag = SampleTag::new(make_id(1, 0x30), 10.0);
        tag.add_variable(Variable::new("T")).unwrap();
        let mut sensor = CharacterSensor::new(
            "pair",
            tag,
            RecordFraming::separator("\\n", SeparatorPosition::End, 64).unwrap(),
            SamplePool::new(),
        );
        sensor.set_fd(OwnedFd::from(ours));

        let collected = Arc::new(Collector {
            samples: Mutex::new(Vec::new()),
        });
        sensor
            .processed_source()
            .add_sample_client(collected.clone());

        let mut selector = PortSelector::with_stats_period(1);
        selector.start().expect("start");
        selector.add_sensor(Box::new(sensor));

        theirs.write_all(b"21.5\n22.5\n").expect("write");

        // wait for the loop to pick the records up
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if collected.samples.lock().len() >= 2 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "selector never delivered samples"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        let samples = collected.samples.lock();
        assert_eq!(samples[0].data().as_floats().unwrap(), &[21.5]);
        assert_eq!(samples[1].data().as_floats().unwrap(), &[22.5]);
        drop(samples);

        selector.join();
    }

    #[test]
    fn test_selector_sends_prompts() {
        let (ours, mut theirs) = UnixStream::pair().expect("socketpair");
        ours.set_nonblocking(true).expect("nonblocking");

        let mut tag = SampleTag::new(make_id(1, 0x31), 1.0);
        tag.add_variable(Variable::new("P")).unwrap();
        let mut sensor = CharacterSensor::new(
            "prompted",
            tag,
            RecordFraming::separator("\\n", SeparatorPosition::End, 64).unwrap(),
            SamplePool::new(),
        );
        sensor.set_fd(OwnedFd::from(ours));
        sensor.set_prompt(crate::sensor::Prompt {
            bytes: b"#D\r".to_vec(),
            rate_hz: 20.0,
        });

        let mut selector = PortSelector::new();
        selector.start().expect("start");
        selector.add_sensor(Box::new(sensor));

        // the peer should see at least one prompt quickly
        theirs
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");
        let mut buf = [0u8; 3];
        use std::io::Read;
        theirs.read_exact(&mut buf).expect("prompt arrived");
        assert_eq!(&buf, b"#D\r");

        selector.join();
    }
}
