// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The 16-byte per-sample frame.
//!
//! ```text
//! +-----------------+------------+------------+
//! | time (8)        | length (4) | id (4)     |  little endian
//! +-----------------+------------+------------+
//! | payload (length bytes)                    |
//! +-------------------------------------------+
//! ```
//!
//! `id` carries the type code in its top bits, so a reader can rebuild the
//! typed payload. Writers on big-endian hosts byte-swap; the byteorder
//! writers below do that implicitly.

use crate::config::MAX_SAMPLE_DATA_LEN;
use crate::sample::{self, SampleData, SampleId, SampleType};
use byteorder::{ByteOrder, LittleEndian};

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleHeader {
    pub time_tag: i64,
    /// Payload byte count.
    pub length: u32,
    /// Id with type bits, as on the wire.
    pub raw_id: SampleId,
}

impl SampleHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_i64(&mut buf[0..8], self.time_tag);
        LittleEndian::write_u32(&mut buf[8..12], self.length);
        LittleEndian::write_u32(&mut buf[12..16], self.raw_id);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> SampleHeader {
        SampleHeader {
            time_tag: LittleEndian::read_i64(&buf[0..8]),
            length: LittleEndian::read_u32(&buf[8..12]),
            raw_id: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    pub fn sample_type(&self) -> Option<SampleType> {
        sample::type_of(self.raw_id)
    }

    /// A frame header is plausible if its type bits decode, its length is
    /// under the stream sanity bound, and the length is a whole number of
    /// elements. Used both on the normal path and while resyncing.
    pub fn plausible(&self, max_len: u32) -> bool {
        let Some(t) = self.sample_type() else {
            return false;
        };
        self.length <= max_len.min(MAX_SAMPLE_DATA_LEN) && self.length as usize % t.width() == 0
    }
}

/// Serialize a payload to its little-endian wire bytes.
pub fn encode_payload(data: &SampleData) -> Vec<u8> {
    let mut out = vec![0u8; data.byte_len()];
    match data {
        SampleData::Char(v) => out.copy_from_slice(v),
        SampleData::UInt16(v) => LittleEndian::write_u16_into(v, &mut out),
        SampleData::Int16(v) => LittleEndian::write_i16_into(v, &mut out),
        SampleData::UInt32(v) => LittleEndian::write_u32_into(v, &mut out),
        SampleData::Int32(v) => LittleEndian::write_i32_into(v, &mut out),
        SampleData::Float32(v) => LittleEndian::write_f32_into(v, &mut out),
        SampleData::Float64(v) => LittleEndian::write_f64_into(v, &mut out),
    }
    out
}

/// Rebuild a typed payload from wire bytes. `bytes.len()` must be a whole
/// number of elements of `t`.
pub fn decode_payload(t: SampleType, bytes: &[u8], into: &mut SampleData) {
    debug_assert_eq!(bytes.len() % t.width(), 0);
    let n = bytes.len() / t.width();
    match (t, into) {
        (SampleType::Char, SampleData::Char(v)) => v.extend_from_slice(bytes),
        (SampleType::UInt16, SampleData::UInt16(v)) => {
            v.resize(n, 0);
            LittleEndian::read_u16_into(bytes, v);
        }
        (SampleType::Int16, SampleData::Int16(v)) => {
            v.resize(n, 0);
            LittleEndian::read_i16_into(bytes, v);
        }
        (SampleType::UInt32, SampleData::UInt32(v)) => {
            v.resize(n, 0);
            LittleEndian::read_u32_into(bytes, v);
        }
        (SampleType::Int32, SampleData::Int32(v)) => {
            v.resize(n, 0);
            LittleEndian::read_i32_into(bytes, v);
        }
        (SampleType::Float32, SampleData::Float32(v)) => {
            v.resize(n, 0.0);
            LittleEndian::read_f32_into(bytes, v);
        }
        (SampleType::Float64, SampleData::Float64(v)) => {
            v.resize(n, 0.0);
            LittleEndian::read_f64_into(bytes, v);
        }
        _ => debug_assert!(false, "payload type mismatch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{make_id, with_type};

    #[test]
    fn test_header_layout_is_little_endian() {
        let h = SampleHeader {
            time_tag: 0x0102_0304_0506_0708,
            length: 12,
            raw_id: with_type(make_id(1, 0x10), SampleType::Float32),
        };
        let buf = h.encode();
        // time, LSB first
        assert_eq!(&buf[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        // length
        assert_eq!(&buf[8..12], &[12, 0, 0, 0]);
        assert_eq!(SampleHeader::decode(&buf), h);
    }

    #[test]
    fn test_plausibility() {
        let good = SampleHeader {
            time_tag: 1,
            length: 12,
            raw_id: with_type(make_id(1, 1), SampleType::Float32),
        };
        assert!(good.plausible(1024));

        // length not a multiple of the element width
        let bad = SampleHeader {
            length: 13,
            ..good
        };
        assert!(!bad.plausible(1024));

        // oversize
        let bad = SampleHeader {
            length: 2048,
            ..good
        };
        assert!(!bad.plausible(1024));

        // invalid type code
        let bad = SampleHeader {
            raw_id: 0x1F << 27,
            length: 4,
            ..good
        };
        assert!(!bad.plausible(1024));
    }

    #[test]
    fn test_payload_roundtrip_all_types() {
        let cases = vec![
            SampleData::Char(b"abc".to_vec()),
            SampleData::UInt16(vec![1, 0xFFFF]),
            SampleData::Int16(vec![-2, 300]),
            SampleData::UInt32(vec![7, 0xDEAD_BEEF]),
            SampleData::Int32(vec![-100, 100]),
            SampleData::Float32(vec![1.5, -2.25]),
            SampleData::Float64(vec![std::f64::consts::PI]),
        ];
        for data in cases {
            let bytes = encode_payload(&data);
            assert_eq!(bytes.len(), data.byte_len());
            let mut back = match data {
                SampleData::Char(_) => SampleData::Char(Vec::new()),
                SampleData::UInt16(_) => SampleData::UInt16(Vec::new()),
                SampleData::Int16(_) => SampleData::Int16(Vec::new()),
                SampleData::UInt32(_) => SampleData::UInt32(Vec::new()),
                SampleData::Int32(_) => SampleData::Int32(Vec::new()),
                SampleData::Float32(_) => SampleData::Float32(Vec::new()),
                SampleData::Float64(_) => SampleData::Float64(Vec::new()),
            };
            decode_payload(data.sample_type(), &bytes, &mut back);
            assert_eq!(back, data);
        }
    }
}
