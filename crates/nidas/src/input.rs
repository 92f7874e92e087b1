// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed sample input: archive header, then 16-byte frames.
//!
//! Implausible frame headers do not kill the stream: the reader resyncs by
//! sliding one byte at a time until the next plausible header, counting and
//! rate-limit logging what it skipped.

use crate::archive::frame::{decode_payload, SampleHeader};
use crate::archive::ArchiveHeader;
use crate::config::MAX_SAMPLE_DATA_LEN;
use crate::error::Result;
use crate::io::{IOChannel, IOStream};
use crate::sample::{address_of, Sample, SamplePool};
use crate::time::DsmTime;

/// Resync time plausibility window around the last good timetag.
const RESYNC_TIME_WINDOW_USECS: i64 = 30 * 86_400 * 1_000_000;

pub struct SampleInputStream {
    stream: IOStream,
    pool: SamplePool,
    name: String,
    header: Option<ArchiveHeader>,
    max_sample_len: u32,
    last_time_tag: DsmTime,
    /// Frames accepted.
    nsamples: u64,
    /// Resync events (implausible headers encountered).
    bad_frames: u64,
    /// Bytes skipped while resyncing.
    skipped_bytes: u64,
    scratch: Vec<u8>,
}

impl SampleInputStream {
    pub fn new(channel: IOChannel, pool: SamplePool) -> SampleInputStream {
        let name = channel.name();
        SampleInputStream {
            stream: IOStream::new(channel),
            pool,
            name,
            header: None,
            max_sample_len: MAX_SAMPLE_DATA_LEN,
            last_time_tag: 0,
            nsamples: 0,
            bad_frames: 0,
            skipped_bytes: 0,
            scratch: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tighten the per-stream sanity bound on frame payload length.
    pub fn set_max_sample_len(&mut self, max: u32) {
        self.max_sample_len = max;
    }

    /// Parse the leading archive header. Must be called before the first
    /// [`read_sample`](Self::read_sample) on header-framed streams.
    pub fn read_header(&mut self) -> Result<&ArchiveHeader> {
        if self.header.is_none() {
            let h = ArchiveHeader::parse(&mut self.stream)?;
            log::info!(
                "[SampleInput] {}: project={} system={}",
                self.name,
                h.project_name,
                h.system_name
            );
            self.header = Some(h);
        }
        Ok(self.header.as_ref().expect("header just parsed"))
    }

    pub fn header(&self) -> Option<&ArchiveHeader> {
        self.header.as_ref()
    }

    fn plausible(&self, h: &SampleHeader) -> bool {
        if !h.plausible(self.max_sample_len) {
            return false;
        }
        // after the first good frame, reject timetags wildly far from it
        self.last_time_tag == 0
            || (h.time_tag - self.last_time_tag).abs() < RESYNC_TIME_WINDOW_USECS
    }

    /// Read the next sample, resyncing past garbage if needed.
    ///
    /// `Io(Eof)` ends the stream; callers then `flush()` their clients.
    pub fn read_sample(&mut self) -> Result<Sample> {
        let mut hdr_buf = [0u8; SampleHeader::SIZE];
        self.stream.read_full(&mut hdr_buf)?;
        let mut header = SampleHeader::decode(&hdr_buf);

        if !self.plausible(&header) {
            self.bad_frames += 1;
            if self.bad_frames % 100 == 1 {
                log::warn!(
                    "[SampleInput] {}: implausible frame at offset {}, resyncing ({} so far)",
                    self.name,
                    self.stream.offset() - SampleHeader::SIZE as u64,
                    self.bad_frames
                );
            }
            // slide one byte at a time until the window decodes plausibly
            loop {
                hdr_buf.copy_within(1.., 0);
                let mut b = [0u8; 1];
                self.stream.read_full(&mut b)?;
                hdr_buf[SampleHeader::SIZE - 1] = b[0];
                self.skipped_bytes += 1;
                header = SampleHeader::decode(&hdr_buf);
                if self.plausible(&header) {
                    break;
                }
            }
        }

        let t = header
            .sample_type()
            .expect("plausible header has a valid type");
        self.scratch.resize(header.length as usize, 0);
        self.stream.read_full(&mut self.scratch)?;

        let mut buf = self.pool.get(t, header.length as usize / t.width());
        decode_payload(t, &self.scratch, buf.data_mut());
        buf.set_time_tag(header.time_tag)
            .set_id(address_of(header.raw_id));

        self.last_time_tag = header.time_tag;
        self.nsamples += 1;
        Ok(buf.share())
    }

    pub fn samples_read(&self) -> u64 {
        self.nsamples
    }

    pub fn bad_frames(&self) -> u64 {
        self.bad_frames
    }

    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }
}
