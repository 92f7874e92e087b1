// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed sample output.
//!
//! Writes the archive header, then one frame per sample, rolling the
//! underlying FileSet when sample time crosses a file boundary and flushing
//! on the stream's latency policy. Write failures classify per the error
//! taxonomy; a disconnect marks the output dead so its owner can schedule a
//! reconnect.

use crate::archive::frame::{encode_payload, SampleHeader};
use crate::archive::ArchiveHeader;
use crate::config::DEFAULT_LATENCY_USECS;
use crate::error::{Error, Result};
use crate::io::{IOChannel, IOStream};
use crate::sample::Sample;
use crate::source::SampleClient;
use crate::time::DsmTime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SampleOutputStream {
    stream: IOStream,
    name: String,
    header: ArchiveHeader,
    /// Header is rewritten at the top of every rolled file.
    header_written: bool,
    latency_usecs: i64,
    last_flush_tt: DsmTime,
    nsamples: u64,
    last_time_tag: DsmTime,
    discarded: u64,
}

impl SampleOutputStream {
    pub fn new(channel: IOChannel, header: ArchiveHeader) -> SampleOutputStream {
        let name = channel.name();
        SampleOutputStream {
            stream: IOStream::new(channel),
            name,
            header,
            header_written: false,
            latency_usecs: DEFAULT_LATENCY_USECS,
            last_flush_tt: 0,
            nsamples: 0,
            last_time_tag: 0,
            discarded: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latency in seconds between time-driven flushes. Clamped to
    /// [0.02, 60], matching the acquisition loop's expectations.
    pub fn set_latency_secs(&mut self, secs: f64) -> Result<()> {
        if !(0.02..=60.0).contains(&secs) {
            return Err(Error::invalid_parameter(
                "latency",
                format!("{secs} s out of range [0.02, 60]"),
            ));
        }
        self.latency_usecs = (secs * 1e6) as i64;
        self.stream.set_latency_secs(secs);
        Ok(())
    }

    /// Write one framed sample, rolling files and flushing per policy.
    pub fn write_sample(&mut self, sample: &Sample) -> Result<()> {
        let tt = sample.time_tag();

        if tt >= self.stream.channel().next_file_time() {
            self.stream.flush()?;
            self.stream.channel_mut().create_file(tt)?;
            self.header_written = false;
        }
        if !self.header_written {
            self.header.write(&mut self.stream, None)?;
            self.header_written = true;
        }

        let frame = SampleHeader {
            time_tag: tt,
            length: sample.byte_len() as u32,
            raw_id: sample.raw_id(),
        };
        let payload = encode_payload(sample.data());

        let flush_now = tt - self.last_flush_tt > self.latency_usecs;
        if flush_now {
            self.last_flush_tt = tt;
        }
        self.stream
            .write_parts(&[&frame.encode(), &payload], flush_now)?;

        self.nsamples += 1;
        self.last_time_tag = tt;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.stream.close()
    }

    pub fn samples_written(&self) -> u64 {
        self.nsamples
    }

    pub fn bytes_written(&self) -> u64 {
        self.stream.bytes_written()
    }

    pub fn last_time_tag(&self) -> DsmTime {
        self.last_time_tag
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn current_file(&self) -> Option<String> {
        self.stream.channel().current_file()
    }

    /// Bytes in the file being written, or total stream bytes for
    /// non-rolling channels.
    pub fn current_file_size(&self) -> u64 {
        match self.stream.channel() {
            IOChannel::FileSet(f) => f.bytes_this_file(),
            _ => self.stream.bytes_written(),
        }
    }

    /// Files created so far, oldest first, when writing a FileSet.
    pub fn channel_files(&self) -> Option<Vec<std::path::PathBuf>> {
        match self.stream.channel() {
            IOChannel::FileSet(f) => Some(f.created_files().to_vec()),
            _ => None,
        }
    }

    pub(crate) fn note_discard(&mut self) {
        self.discarded += 1;
        if self.discarded % 1000 == 1 {
            log::warn!(
                "[SampleOutput] {}: {} samples discarded due to output jambs",
                self.name,
                self.discarded
            );
        }
    }
}

/// Adapter making an output stream a [`SampleClient`] for direct wiring to a
/// source. Disconnection is flagged rather than propagated; the owner polls
/// [`is_disconnected`](Self::is_disconnected) and rebuilds the connection.
pub struct SampleOutputClient {
    output: Mutex<SampleOutputStream>,
    disconnected: AtomicBool,
}

impl SampleOutputClient {
    pub fn new(output: SampleOutputStream) -> Arc<SampleOutputClient> {
        Arc::new(SampleOutputClient {
            output: Mutex::new(output),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn with_output<R>(&self, f: impl FnOnce(&mut SampleOutputStream) -> R) -> R {
        f(&mut self.output.lock())
    }
}

impl SampleClient for SampleOutputClient {
    fn receive(&self, sample: &Sample) -> bool {
        if self.disconnected.load(Ordering::Acquire) {
            return false;
        }
        let mut out = self.output.lock();
        match out.write_sample(sample) {
            Ok(()) => true,
            Err(e) if e.is_disconnect() => {
                // broken pipe is the normal way a peer hangs up
                log::info!("[SampleOutput] {}: {}, disconnecting", out.name(), e);
                self.disconnected.store(true, Ordering::Release);
                false
            }
            Err(e) if e.is_temporary() => {
                out.note_discard();
                false
            }
            Err(e) => {
                log::error!("[SampleOutput] {}: {}", out.name(), e);
                self.disconnected.store(true, Ordering::Release);
                false
            }
        }
    }

    fn flush(&self) {
        let mut out = self.output.lock();
        if let Err(e) = out.flush() {
            if !e.is_disconnect() {
                log::error!("[SampleOutput] {}: flush: {}", out.name(), e);
            }
        }
    }
}
