// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffered stream over an [`IOChannel`].
//!
//! Writes accumulate until (a) the buffer reaches its high-water size,
//! (b) wall-clock time since the last flush exceeds the stream latency, or
//! (c) an explicit [`flush`](IOStream::flush). Reads are buffered with a
//! mark/backup capability so a header parser can push bytes back after a
//! failed match.

use super::IOChannel;
use crate::config::{DEFAULT_LATENCY_USECS, IOSTREAM_BUF_LEN};
use crate::error::Result;
use crate::time::DsmTime;
use std::time::Instant;

pub struct IOStream {
    channel: IOChannel,
    name: String,

    rbuf: Vec<u8>,
    /// Next byte to consume.
    rpos: usize,
    /// One past the last valid byte.
    rfilled: usize,
    /// Saved consume position for backup().
    mark: Option<usize>,
    /// Total bytes consumed from the channel, for parse-error offsets.
    consumed: u64,

    wbuf: Vec<u8>,
    high_water: usize,
    latency_usecs: DsmTime,
    last_flush: Instant,
    nbytes_written: u64,
}

impl IOStream {
    pub fn new(channel: IOChannel) -> IOStream {
        Self::with_capacity(channel, IOSTREAM_BUF_LEN)
    }

    pub fn with_capacity(channel: IOChannel, buf_len: usize) -> IOStream {
        let name = channel.name();
        IOStream {
            channel,
            name,
            rbuf: vec![0; buf_len.max(64)],
            rpos: 0,
            rfilled: 0,
            mark: None,
            consumed: 0,
            wbuf: Vec::with_capacity(buf_len.max(64)),
            high_water: buf_len.max(64) / 2,
            latency_usecs: DEFAULT_LATENCY_USECS,
            last_flush: Instant::now(),
            nbytes_written: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-stream write latency in seconds before a forced flush.
    pub fn set_latency_secs(&mut self, secs: f64) {
        self.latency_usecs = (secs * 1_000_000.0) as DsmTime;
    }

    pub fn channel(&self) -> &IOChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut IOChannel {
        &mut self.channel
    }

    // ---------------- read side ----------------

    /// Bytes currently buffered and unconsumed.
    pub fn available(&self) -> usize {
        self.rfilled - self.rpos
    }

    /// Total bytes consumed so far; the byte offset of the next read.
    pub fn offset(&self) -> u64 {
        self.consumed
    }

    /// Remember the current position; [`backup`](Self::backup) returns to it.
    pub fn mark(&mut self) {
        self.mark = Some(self.rpos);
    }

    /// Push back everything consumed since the last [`mark`](Self::mark).
    pub fn backup(&mut self) {
        if let Some(m) = self.mark.take() {
            self.consumed -= (self.rpos - m) as u64;
            self.rpos = m;
        }
    }

    /// Make the marked region no longer required; frees buffer space.
    pub fn clear_mark(&mut self) {
        self.mark = None;
    }

    fn compact(&mut self) {
        let keep_from = self.mark.unwrap_or(self.rpos);
        if keep_from > 0 {
            self.rbuf.copy_within(keep_from..self.rfilled, 0);
            self.rfilled -= keep_from;
            self.rpos -= keep_from;
            if let Some(m) = self.mark.as_mut() {
                *m -= keep_from;
            }
        }
    }

    /// Read more bytes from the channel into the buffer.
    ///
    /// Returns the number added; `Io(Eof)` at end of input.
    pub fn fill(&mut self) -> Result<usize> {
        self.compact();
        if self.rfilled == self.rbuf.len() {
            // Marked region pins the whole buffer; grow rather than lose it.
            self.rbuf.resize(self.rbuf.len() * 2, 0);
        }
        let n = self.channel.read(&mut self.rbuf[self.rfilled..])?;
        self.rfilled += n;
        Ok(n)
    }

    /// Copy up to `out.len()` buffered bytes, filling once if empty.
    pub fn read_buf(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.available() == 0 {
            self.fill()?;
        }
        let n = out.len().min(self.available());
        out[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        self.consumed += n as u64;
        Ok(n)
    }

    /// Read exactly `out.len()` bytes, filling as needed.
    pub fn read_full(&mut self, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let n = self.read_buf(&mut out[done..])?;
            done += n;
        }
        Ok(())
    }

    /// Consume and discard `n` buffered-or-streamed bytes.
    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        while n > 0 {
            if self.available() == 0 {
                self.fill()?;
            }
            let take = n.min(self.available());
            self.rpos += take;
            self.consumed += take as u64;
            n -= take;
        }
        Ok(())
    }

    /// Peek at buffered bytes without consuming.
    pub fn peek(&self) -> &[u8] {
        &self.rbuf[self.rpos..self.rfilled]
    }

    // ---------------- write side ----------------

    fn latency_expired(&self) -> bool {
        self.last_flush.elapsed().as_micros() as i64 >= self.latency_usecs
    }

    /// Buffer `buf` for writing, flushing per policy.
    pub fn write(&mut self, buf: &[u8], flush_now: bool) -> Result<usize> {
        self.wbuf.extend_from_slice(buf);
        if flush_now || self.wbuf.len() >= self.high_water || self.latency_expired() {
            self.flush()?;
        }
        Ok(buf.len())
    }

    /// Buffer several contiguous parts as one record, flushing per policy.
    pub fn write_parts(&mut self, parts: &[&[u8]], flush_now: bool) -> Result<usize> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        for p in parts {
            self.wbuf.extend_from_slice(p);
        }
        if flush_now || self.wbuf.len() >= self.high_water || self.latency_expired() {
            self.flush()?;
        }
        Ok(total)
    }

    /// Write everything buffered through to the channel.
    pub fn flush(&mut self) -> Result<()> {
        let mut off = 0;
        while off < self.wbuf.len() {
            let n = self.channel.write(&self.wbuf[off..])?;
            off += n;
        }
        self.nbytes_written += self.wbuf.len() as u64;
        self.wbuf.clear();
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Total bytes written through to the channel.
    pub fn bytes_written(&self) -> u64 {
        self.nbytes_written
    }

    /// Flush and close the underlying channel.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.channel.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileChannel;

    fn stream_over(bytes: &[u8]) -> IOStream {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("s.dat");
        std::fs::write(&path, bytes).expect("write fixture");
        // keep dir alive by leaking; tests are short-lived
        std::mem::forget(dir);
        IOStream::with_capacity(
            IOChannel::File(FileChannel::open_read(path).expect("open")),
            64,
        )
    }

    #[test]
    fn test_read_mark_backup() {
        let mut s = stream_over(b"NIDAS (ncar.ucar.edu)\nrest of file");
        s.mark();
        let mut probe = [0u8; 10];
        s.read_full(&mut probe).unwrap();
        assert_eq!(&probe, b"NIDAS (nca");
        assert_eq!(s.offset(), 10);

        s.backup();
        assert_eq!(s.offset(), 0);
        let mut probe = [0u8; 5];
        s.read_full(&mut probe).unwrap();
        assert_eq!(&probe, b"NIDAS");
    }

    #[test]
    fn test_read_across_fills() {
        let data: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        let mut s = stream_over(&data);
        let mut out = vec![0u8; 300];
        s.read_full(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(s.fill().unwrap_err().is_eof());
    }

    #[test]
    fn test_mark_grows_buffer_instead_of_losing_bytes() {
        let data = vec![7u8; 200];
        let mut s = stream_over(&data);
        s.mark();
        let mut out = vec![0u8; 150];
        s.read_full(&mut out).unwrap();
        s.backup();
        let mut out2 = vec![0u8; 200];
        s.read_full(&mut out2).unwrap();
        assert_eq!(out2, data);
    }

    #[test]
    fn test_write_flush_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.dat");
        let mut s = IOStream::with_capacity(
            IOChannel::File(FileChannel::create(&path).expect("create")),
            64,
        );
        s.set_latency_secs(3600.0); // keep wall clock out of this test

        s.write(b"0123", false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0); // buffered

        // high water is 32: this pushes past it
        s.write(&[9u8; 40], false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 44);

        s.write_parts(&[b"ab", b"cd"], true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);
        assert_eq!(s.bytes_written(), 48);
    }
}
