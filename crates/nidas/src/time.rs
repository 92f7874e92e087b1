// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timetag helpers.
//!
//! Timetags everywhere in the pipeline are 64-bit microseconds since the Unix
//! epoch (`DsmTime`). This module holds the conversions to wall-clock types,
//! strftime-style filename expansion, and file-boundary arithmetic.

use crate::config::USECS_PER_SEC;
use chrono::{DateTime, TimeZone, Utc};

/// Microseconds since the Unix epoch.
pub type DsmTime = i64;

/// Current system time as a timetag.
pub fn system_time() -> DsmTime {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_micros() as DsmTime
}

/// Convert a timetag to UTC wall-clock time, clamping out-of-range values.
pub fn to_utc(tt: DsmTime) -> DateTime<Utc> {
    let secs = tt.div_euclid(USECS_PER_SEC);
    let micros = tt.rem_euclid(USECS_PER_SEC) as u32;
    Utc.timestamp_opt(secs, micros * 1000)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}

/// Expand strftime fields in a filename template against a timetag.
///
/// `data_%Y%m%d_%H%M%S.dat` at 2006-01-02 15:04:05 UTC becomes
/// `data_20060102_150405.dat`.
pub fn format_filename(template: &str, tt: DsmTime) -> String {
    to_utc(tt).format(template).to_string()
}

/// The next integral file boundary at or after `tt` for files of
/// `file_length_secs` seconds.
///
/// Boundaries are aligned to multiples of the file length since the epoch, so
/// a 3600 s file length rolls on the hour regardless of start time.
pub fn next_file_boundary(tt: DsmTime, file_length_secs: u32) -> DsmTime {
    let flen = i64::from(file_length_secs) * USECS_PER_SEC;
    if flen <= 0 {
        return DsmTime::MAX;
    }
    (tt.div_euclid(flen) + 1) * flen
}

/// Truncate a timetag down to its second boundary.
pub fn second_floor(tt: DsmTime) -> DsmTime {
    tt - tt.rem_euclid(USECS_PER_SEC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_filename() {
        // 2006-01-02 15:04:05 UTC
        let tt = 1_136_214_245 * USECS_PER_SEC;
        assert_eq!(
            format_filename("data_%Y%m%d_%H%M%S.dat", tt),
            "data_20060102_150405.dat"
        );
    }

    #[test]
    fn test_next_file_boundary_aligned() {
        // 1 s files: boundary after t=0.999 s is t=1 s
        assert_eq!(next_file_boundary(999_000, 1), USECS_PER_SEC);
        // exactly on a boundary rolls to the next one
        assert_eq!(next_file_boundary(USECS_PER_SEC, 1), 2 * USECS_PER_SEC);
        // hourly files align to the hour
        let tt = 1_136_214_245 * USECS_PER_SEC;
        let b = next_file_boundary(tt, 3600);
        assert_eq!(b % (3600 * USECS_PER_SEC), 0);
        assert!(b > tt && b - tt <= 3600 * USECS_PER_SEC);
    }

    #[test]
    fn test_second_floor() {
        assert_eq!(second_floor(1_500_000), USECS_PER_SEC);
        assert_eq!(second_floor(999_999), 0);
        assert_eq!(second_floor(2_000_000), 2_000_000);
    }
}
