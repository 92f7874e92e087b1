// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sensors: the per-fd read loop's units of work.
//!
//! A sensor owns a file descriptor, a record scanner, and two fan-out sides:
//! raw (time-tagged byte records, raw id namespace) and processed (typed
//! engineering values). [`CharacterSensor`] covers the ASCII family (serial
//! NMEA-style streams, prompted or free-running); record framing is
//! configured per sensor (see [`scanner`]).
//!
//! Statistics are windowed over the selector's stats period and folded into
//! rates on each sweep; counters are atomics so status readers never touch
//! the acquisition thread.

pub mod scanner;
pub mod selector;

pub use scanner::{RecordFraming, SampleScanner, SeparatorPosition};
pub use selector::PortSelector;

use crate::config::SENSOR_BUF_LEN;
use crate::error::{Error, Result};
use crate::process::despike::AdaptiveDespiker;
use crate::sample::tag::SampleTag;
use crate::sample::{as_raw, Sample, SampleData, SampleId, SamplePool};
use crate::source::SampleSourceSupport;
use crate::time::{system_time, DsmTime};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Windowed per-sensor statistics, shared with status readers.
#[derive(Debug)]
pub struct SensorStats {
    window_samples: AtomicU64,
    window_min_len: AtomicUsize,
    window_max_len: AtomicUsize,
    /// Rate computed at the last sweep, in millisamples/s.
    sample_rate_milli: AtomicU64,
    read_errors_recent: AtomicU64,
    read_errors_total: AtomicU64,
    write_errors_recent: AtomicU64,
    write_errors_total: AtomicU64,
}

/// Snapshot of a sensor's statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorStatsSnapshot {
    pub sample_rate: f64,
    pub min_len: usize,
    pub max_len: usize,
    pub read_errors_recent: u64,
    pub read_errors_total: u64,
    pub write_errors_recent: u64,
    pub write_errors_total: u64,
}

impl Default for SensorStats {
    fn default() -> Self {
        SensorStats {
            window_samples: AtomicU64::new(0),
            window_min_len: AtomicUsize::new(usize::MAX),
            window_max_len: AtomicUsize::new(0),
            sample_rate_milli: AtomicU64::new(0),
            read_errors_recent: AtomicU64::new(0),
            read_errors_total: AtomicU64::new(0),
            write_errors_recent: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
        }
    }
}

impl SensorStats {
    pub fn record_sample(&self, len: usize) {
        self.window_samples.fetch_add(1, Ordering::Relaxed);
        self.window_min_len.fetch_min(len, Ordering::Relaxed);
        self.window_max_len.fetch_max(len, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors_recent.fetch_add(1, Ordering::Relaxed);
        self.read_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors_recent.fetch_add(1, Ordering::Relaxed);
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the window into rates and reset the recent counters. Called by
    /// the selector on its stats sweep.
    pub fn calc_statistics(&self, period_secs: u32) {
        let n = self.window_samples.swap(0, Ordering::Relaxed);
        let rate_milli = n * 1000 / u64::from(period_secs.max(1));
        self.sample_rate_milli.store(rate_milli, Ordering::Relaxed);
        self.read_errors_recent.store(0, Ordering::Relaxed);
        self.write_errors_recent.store(0, Ordering::Relaxed);
        self.window_min_len.store(usize::MAX, Ordering::Relaxed);
        self.window_max_len.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SensorStatsSnapshot {
        let min = self.window_min_len.load(Ordering::Relaxed);
        SensorStatsSnapshot {
            sample_rate: self.sample_rate_milli.load(Ordering::Relaxed) as f64 / 1000.0,
            min_len: if min == usize::MAX { 0 } else { min },
            max_len: self.window_max_len.load(Ordering::Relaxed),
            read_errors_recent: self.read_errors_recent.load(Ordering::Relaxed),
            read_errors_total: self.read_errors_total.load(Ordering::Relaxed),
            write_errors_recent: self.write_errors_recent.load(Ordering::Relaxed),
            write_errors_total: self.write_errors_total.load(Ordering::Relaxed),
        }
    }
}

/// Periodic prompt sent to a polled sensor.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub bytes: Vec<u8>,
    pub rate_hz: f64,
}

/// One acquisition unit managed by the [`PortSelector`].
pub trait Sensor: Send {
    fn name(&self) -> &str;

    /// Descriptor the selector polls. Valid only while open.
    fn raw_fd(&self) -> RawFd;

    /// Drain the descriptor, scan records, distribute raw and processed
    /// samples. Returns the timetag applied to this batch.
    fn read_samples(&mut self) -> Result<DsmTime>;

    fn raw_source(&self) -> &SampleSourceSupport;

    fn processed_source(&self) -> &SampleSourceSupport;

    fn stats(&self) -> &Arc<SensorStats>;

    fn prompt(&self) -> Option<&Prompt> {
        None
    }

    /// Write the prompt to the device. Only called when `prompt()` is Some.
    fn send_prompt(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self);
}

/// Timetag source. Acquisition prefers the IRIG clock when one is present.
pub type ClockFn = Arc<dyn Fn() -> DsmTime + Send + Sync>;

/// ASCII record sensor: framed text records parsed into numeric scans.
pub struct CharacterSensor {
    name: String,
    device: String,
    fd: Option<OwnedFd>,
    id: SampleId,
    scanner: SampleScanner,
    tag: Arc<SampleTag>,
    raw_support: SampleSourceSupport,
    processed_support: SampleSourceSupport,
    stats: Arc<SensorStats>,
    pool: SamplePool,
    clock: ClockFn,
    /// One optional despiker per scan value, in layout order.
    despikers: Vec<Option<AdaptiveDespiker>>,
    prompt: Option<Prompt>,
}

impl CharacterSensor {
    /// `tag` declares the processed scan layout; its id doubles (raw-flagged)
    /// as the raw stream id.
    pub fn new(
        device: impl Into<String>,
        tag: SampleTag,
        framing: RecordFraming,
        pool: SamplePool,
    ) -> CharacterSensor {
        let device = device.into();
        let id = tag.id();
        let scan_len = tag.scan_length();
        let raw_support = SampleSourceSupport::new();
        let processed_support = SampleSourceSupport::new();
        let tag = processed_support.add_sample_tag(tag);
        let mut despikers = Vec::new();
        despikers.resize_with(scan_len, || None);
        CharacterSensor {
            name: format!("sensor {device}"),
            device,
            fd: None,
            id,
            scanner: SampleScanner::new(framing, SENSOR_BUF_LEN),
            tag,
            raw_support,
            processed_support,
            stats: Arc::new(SensorStats::default()),
            pool,
            clock: Arc::new(system_time),
            despikers,
            prompt: None,
        }
    }

    pub fn tag(&self) -> &Arc<SampleTag> {
        &self.tag
    }

    /// Use the IRIG (or any other) clock instead of the system clock.
    pub fn set_clock(&mut self, clock: ClockFn) {
        self.clock = clock;
    }

    pub fn set_prompt(&mut self, prompt: Prompt) {
        self.prompt = Some(prompt);
    }

    /// Chain a despiker on scan value `index`.
    pub fn set_despiker(&mut self, index: usize, d: AdaptiveDespiker) -> Result<()> {
        let slot = self.despikers.get_mut(index).ok_or_else(|| {
            Error::invalid_parameter("despiker index", format!("{index} out of range"))
        })?;
        *slot = Some(d);
        Ok(())
    }

    /// Open the device non-blocking for the poll loop.
    pub fn open(&mut self) -> Result<()> {
        let cpath = std::ffi::CString::new(self.device.as_str())
            .map_err(|_| Error::invalid_parameter("device", "embedded NUL"))?;
        // SAFETY: cpath outlives the call; the returned fd is checked then
        // owned.
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(Error::io(&self.name, std::io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned open by open(2).
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        log::info!("[Sensor] opened {}", self.device);
        Ok(())
    }

    /// Adopt an already-open descriptor (ptys, socket pairs, tests).
    pub fn set_fd(&mut self, fd: OwnedFd) {
        self.fd = Some(fd);
    }

    fn fd(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| Error::InvalidState(format!("{}: not open", self.name)))
    }

    /// Parse a text record into the tag's scan values: numeric tokens in
    /// order, short records padded with NaN.
    fn parse_record(&self, record: &[u8]) -> Vec<f32> {
        let scan_len = self.tag.scan_length();
        let text = String::from_utf8_lossy(record);
        let mut values = Vec::with_capacity(scan_len);
        for token in text.split(|c: char| {
            c == ',' || c == ';' || c.is_whitespace()
        }) {
            if values.len() == scan_len {
                break;
            }
            if token.is_empty() {
                continue;
            }
            if let Ok(v) = token.parse::<f32>() {
                values.push(v);
            }
        }
        values.resize(scan_len, f32::NAN);
        values
    }

    /// Convert one raw record into a processed sample: parse, screen and
    /// convert per variable, then despike chained values.
    pub fn process(&mut self, raw: &Sample) -> Option<Sample> {
        let bytes = raw.data().as_chars()?;
        let parsed = self.parse_record(bytes);
        let tt = raw.time_tag();

        let tag = self.tag.clone();
        let mut buf = self.pool.get_floats(tag.scan_length());
        if let SampleData::Float32(out) = buf.data_mut() {
            let mut k = 0;
            for var in tag.variables() {
                for _ in 0..var.length() {
                    let mut v = var.convert(tt, f64::from(parsed[k])) as f32;
                    if let Some(d) = &mut self.despikers[k] {
                        let (clean, _spike) = d.despike(tt, v);
                        v = clean;
                    }
                    out[k] = v;
                    k += 1;
                }
            }
        }
        buf.set_time_tag(tt).set_id(self.id);
        Some(buf.share())
    }
}

impl Sensor for CharacterSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn read_samples(&mut self) -> Result<DsmTime> {
        let fd = self.fd()?;
        let tt = (self.clock)();

        // drain the descriptor
        let mut chunk = [0u8; 2048];
        loop {
            // SAFETY: fd is open and chunk bounds are passed explicitly.
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        self.stats.record_read_error();
                        return Err(Error::io(&self.name, err));
                    }
                }
            }
            if n == 0 {
                return Err(Error::eof(&self.name));
            }
            self.scanner.append(&chunk[..n as usize]);
            if (n as usize) < chunk.len() {
                break;
            }
        }

        // emit every complete record
        while let Some(record) = self.scanner.next_record() {
            self.stats.record_sample(record.len());

            let mut buf = self.pool.get_chars(&record);
            buf.set_time_tag(tt).set_id(as_raw(self.id));
            let raw = buf.share();
            self.raw_support.distribute(&raw);

            if let Some(processed) = self.process(&raw) {
                self.processed_support.distribute(&processed);
            }
        }
        Ok(tt)
    }

    fn raw_source(&self) -> &SampleSourceSupport {
        &self.raw_support
    }

    fn processed_source(&self) -> &SampleSourceSupport {
        &self.processed_support
    }

    fn stats(&self) -> &Arc<SensorStats> {
        &self.stats
    }

    fn prompt(&self) -> Option<&Prompt> {
        self.prompt.as_ref()
    }

    fn send_prompt(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let Some(p) = &self.prompt else {
            return Ok(());
        };
        // SAFETY: fd is open; prompt bytes are a live slice.
        let n = unsafe { libc::write(fd, p.bytes.as_ptr().cast(), p.bytes.len()) };
        if n < 0 {
            self.stats.record_write_error();
            return Err(Error::io(&self.name, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.fd.take().is_some() {
            log::info!("[Sensor] closed {}", self.device);
        }
        self.raw_support.flush();
        self.processed_support.flush();
    }
}
