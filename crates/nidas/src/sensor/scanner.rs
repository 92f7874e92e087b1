// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Record framing over a sensor's byte ring.
//!
//! Four framings cover the fielded sensors: separator-terminated (the
//! separator ends each record, e.g. NMEA's `\n`), separator-preceded (the
//! separator starts each record), fixed-length, and length-prefixed
//! (16-bit little-endian count). `length` is a hard upper bound; a record
//! that reaches it without completing is emitted as-is and counted as an
//! overflow.

use crate::error::{Error, ParseKind, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;

/// Expand C-style escapes in a separator or prompt spec:
/// `\n`, `\r`, `\t`, `\\`, `\xHH` (hex), `\0NN` (octal).
pub fn replace_escape_sequences(spec: &str) -> Result<Vec<u8>> {
    let bytes = spec.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        let esc = *bytes.get(i).ok_or_else(|| {
            Error::parse(ParseKind::Config, i as u64, "trailing backslash in separator")
        })?;
        match esc {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'\\' => out.push(b'\\'),
            b'x' => {
                let hex = spec.get(i + 1..i + 3).ok_or_else(|| {
                    Error::parse(ParseKind::Config, i as u64, "short \\x escape")
                })?;
                let v = u8::from_str_radix(hex, 16).map_err(|_| {
                    Error::parse(ParseKind::Config, i as u64, format!("bad hex escape \\x{hex}"))
                })?;
                out.push(v);
                i += 2;
            }
            b'0' => {
                let oct = spec.get(i + 1..i + 3).ok_or_else(|| {
                    Error::parse(ParseKind::Config, i as u64, "short \\0 escape")
                })?;
                let v = u8::from_str_radix(oct, 8).map_err(|_| {
                    Error::parse(ParseKind::Config, i as u64, format!("bad octal escape \\0{oct}"))
                })?;
                out.push(v);
                i += 2;
            }
            other => {
                return Err(Error::parse(
                    ParseKind::Config,
                    i as u64,
                    format!("unknown escape \\{}", other as char),
                ))
            }
        }
        i += 1;
    }
    Ok(out)
}

/// Where the separator sits relative to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorPosition {
    /// `beg`: separator precedes the record.
    Beg,
    /// `end`: separator terminates the record.
    End,
}

/// Record framing configuration.
#[derive(Debug, Clone)]
pub enum RecordFraming {
    Separator {
        separator: Vec<u8>,
        position: SeparatorPosition,
        /// Hard upper bound on a record.
        max_len: usize,
    },
    FixedLength {
        length: usize,
    },
    /// 16-bit little-endian byte count precedes each record.
    LengthPrefixed {
        max_len: usize,
    },
}

impl RecordFraming {
    /// Separator-terminated framing from an escaped spec string.
    pub fn separator(spec: &str, position: SeparatorPosition, max_len: usize) -> Result<RecordFraming> {
        let separator = replace_escape_sequences(spec)?;
        if separator.is_empty() {
            return Err(Error::invalid_parameter("separator", "empty"));
        }
        Ok(RecordFraming::Separator {
            separator,
            position,
            max_len,
        })
    }
}

/// Scans a byte ring for complete records.
pub struct SampleScanner {
    framing: RecordFraming,
    ring: VecDeque<u8>,
    capacity: usize,
    /// Records emitted because they hit the length bound.
    overflows: u64,
    /// Bytes discarded hunting for framing.
    discarded: u64,
    /// For Beg separators: whether the ring currently starts on a separator.
    synced: bool,
}

impl SampleScanner {
    pub fn new(framing: RecordFraming, capacity: usize) -> SampleScanner {
        SampleScanner {
            framing,
            ring: VecDeque::with_capacity(capacity),
            capacity,
            overflows: 0,
            discarded: 0,
            synced: false,
        }
    }

    /// Room left in the ring.
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.ring.len())
    }

    /// Append freshly read bytes. Oldest bytes fall off a full ring.
    pub fn append(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.ring.len() == self.capacity {
                self.ring.pop_front();
                self.discarded += 1;
                self.synced = false;
            }
            self.ring.push_back(b);
        }
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn find(&self, pat: &[u8], from: usize) -> Option<usize> {
        if self.ring.len() < pat.len() {
            return None;
        }
        (from..=self.ring.len() - pat.len())
            .find(|&i| pat.iter().enumerate().all(|(j, &p)| self.ring[i + j] == p))
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.ring.drain(..n).collect()
    }

    /// Extract the next complete record, if the ring holds one.
    pub fn next_record(&mut self) -> Option<Vec<u8>> {
        match &self.framing {
            RecordFraming::FixedLength { length } => {
                let length = *length;
                if self.ring.len() >= length {
                    Some(self.take(length))
                } else {
                    None
                }
            }

            RecordFraming::LengthPrefixed { max_len } => {
                let max_len = *max_len;
                loop {
                    if self.ring.len() < 2 {
                        return None;
                    }
                    let len = LittleEndian::read_u16(&[self.ring[0], self.ring[1]]) as usize;
                    if len == 0 || len > max_len {
                        // implausible count: shift one byte and retry
                        self.ring.pop_front();
                        self.discarded += 1;
                        continue;
                    }
                    if self.ring.len() < 2 + len {
                        return None;
                    }
                    self.ring.drain(..2);
                    return Some(self.take(len));
                }
            }

            RecordFraming::Separator {
                separator,
                position: SeparatorPosition::End,
                max_len,
            } => {
                let (sep, max_len) = (separator.clone(), *max_len);
                if let Some(i) = self.find(&sep, 0) {
                    let end = i + sep.len();
                    if end > max_len {
                        self.overflows += 1;
                    }
                    // record includes its terminator
                    return Some(self.take(end));
                }
                if self.ring.len() >= max_len {
                    self.overflows += 1;
                    return Some(self.take(max_len));
                }
                None
            }

            RecordFraming::Separator {
                separator,
                position: SeparatorPosition::Beg,
                max_len,
            } => {
                let (sep, max_len) = (separator.clone(), *max_len);
                if !self.synced {
                    match self.find(&sep, 0) {
                        Some(i) => {
                            if i > 0 {
                                self.discarded += i as u64;
                                self.ring.drain(..i);
                            }
                            self.synced = true;
                        }
                        None => {
                            // keep at most a partial-separator tail
                            let keep = sep.len().saturating_sub(1).min(self.ring.len());
                            let drop = self.ring.len() - keep;
                            self.discarded += drop as u64;
                            self.ring.drain(..drop);
                            return None;
                        }
                    }
                }
                // record runs from this separator to just before the next
                if let Some(next) = self.find(&sep, sep.len()) {
                    return Some(self.take(next));
                }
                if self.ring.len() >= max_len {
                    self.overflows += 1;
                    self.synced = false;
                    return Some(self.take(max_len));
                }
                None
            }
        }
    }
}
