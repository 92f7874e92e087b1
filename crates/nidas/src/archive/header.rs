// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The archive file header.
//!
//! A fixed magic banner, then `tag: value` lines from a closed recognized
//! set, then `end header\n`. The header may be padded with spaces and
//! newlines ahead of the end line so its byte length matches a previously
//! written header, permitting in-place rewrite.
//!
//! The parser is a small state machine (StartMagic -> ParseMagic -> ParseTag
//! -> ParseValue -> Done). Historical keys are accepted and stored but never
//! emitted; unknown-but-well-formed tag lines are skipped; anything else is
//! a header parse error carrying the byte offset and the first bytes of the
//! offending context.

use crate::error::{Error, ParseKind, Result};
use crate::io::IOStream;

/// Recognized magic banners. The writer emits the first; the reader accepts
/// any.
pub const MAGIC_STRINGS: &[&str] = &["NIDAS (ncar.ucar.edu)\n", "NCAR ADS3\n"];

const END_TAG: &str = "end header\n";

/// Tags emitted by the writer, in emission order.
const EMIT_TAGS: &[&str] = &[
    "archive version:",
    "software version:",
    "project name:",
    "system name:",
    "config name:",
    "config version:",
];

/// Historical tags accepted on input only.
const OLD_TAGS: &[&str] = &[
    "site name:",
    "observation period name:",
    "xml name:",
    "xml version:",
];

/// Longest line the parser will accumulate before declaring the input
/// malformed.
const MAX_LINE: usize = 512;

/// How much offending context a parse error carries.
const CONTEXT_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    StartMagic,
    ParseMagic,
    ParseTag,
    ParseValue,
    Done,
}

/// Keyed fields of an archive header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub archive_version: String,
    pub software_version: String,
    pub project_name: String,
    pub system_name: String,
    pub config_name: String,
    pub config_version: String,
    /// Historical keys seen on input, e.g. `observation period name`.
    pub old_fields: Vec<(String, String)>,
}

impl ArchiveHeader {
    fn set_field(&mut self, tag: &str, value: &str) {
        match tag {
            "archive version:" => self.archive_version = value.into(),
            "software version:" => self.software_version = value.into(),
            "project name:" => self.project_name = value.into(),
            "system name:" => self.system_name = value.into(),
            // "site name" is the pre-rename spelling of "system name"
            "site name:" => self.system_name = value.into(),
            "config name:" => self.config_name = value.into(),
            "config version:" => self.config_version = value.into(),
            other => self
                .old_fields
                .push((other.trim_end_matches(':').into(), value.into())),
        }
    }

    fn field(&self, tag: &str) -> &str {
        match tag {
            "archive version:" => &self.archive_version,
            "software version:" => &self.software_version,
            "project name:" => &self.project_name,
            "system name:" => &self.system_name,
            "config name:" => &self.config_name,
            "config version:" => &self.config_version,
            _ => "",
        }
    }

    /// Serialize without padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(MAGIC_STRINGS[0].as_bytes());
        for tag in EMIT_TAGS {
            out.extend_from_slice(tag.as_bytes());
            out.push(b' ');
            out.extend_from_slice(self.field(tag).as_bytes());
            out.push(b'\n');
        }
        out.extend_from_slice(END_TAG.as_bytes());
        out
    }

    /// Serialize padded to exactly `len` bytes, for in-place rewrite of an
    /// existing header. Padding (newlines) goes ahead of the end line.
    pub fn to_padded_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let bare = self.to_bytes();
        if bare.len() > len {
            return Err(Error::invalid_parameter(
                "header length",
                format!("{} bytes of header will not fit in {len}", bare.len()),
            ));
        }
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&bare[..bare.len() - END_TAG.len()]);
        out.resize(len - END_TAG.len(), b'\n');
        out.extend_from_slice(END_TAG.as_bytes());
        Ok(out)
    }

    /// Write the header to a stream, padded to `len` if given.
    pub fn write(&self, stream: &mut IOStream, len: Option<usize>) -> Result<()> {
        let bytes = match len {
            Some(len) => self.to_padded_bytes(len)?,
            None => self.to_bytes(),
        };
        stream.write(&bytes, false)?;
        Ok(())
    }

    /// Parse a header from the stream, consuming through `end header\n`.
    ///
    /// On a failed magic match the probed bytes are pushed back so the
    /// caller can try another interpretation of the stream.
    pub fn parse(stream: &mut IOStream) -> Result<ArchiveHeader> {
        let mut header = ArchiveHeader::default();
        let mut stage = Stage::StartMagic;
        let mut line: Vec<u8> = Vec::with_capacity(128);
        let mut pending_tag = String::new();

        loop {
            match stage {
                Stage::StartMagic => {
                    stream.mark();
                    stage = Stage::ParseMagic;
                }
                Stage::ParseMagic => {
                    Self::parse_magic(stream)?;
                    stage = Stage::ParseTag;
                }
                Stage::ParseTag => {
                    // padding between lines is whitespace; skip it
                    let b = loop {
                        let b = read_byte(stream)?;
                        if !b.is_ascii_whitespace() {
                            break b;
                        }
                    };
                    line.clear();
                    line.push(b);
                    // accumulate until a known tag matches, or the line ends
                    loop {
                        if let Some(tag) = match_tag(&line) {
                            if tag == END_TAG {
                                // consume the end tag's trailing newline
                                let b = read_byte(stream)?;
                                if b != b'\n' {
                                    return Err(malformed(stream, &[b]));
                                }
                                stage = Stage::Done;
                            } else {
                                pending_tag = tag.to_string();
                                stage = Stage::ParseValue;
                            }
                            break;
                        }
                        if line.len() >= MAX_LINE {
                            return Err(malformed(stream, &line));
                        }
                        let b = read_byte(stream)?;
                        if b == b'\n' {
                            // a complete line that matched nothing: ignore it
                            // if it looks like a "key: value" line
                            if line.contains(&b':') && line.iter().all(|c| c.is_ascii()) {
                                log::debug!(
                                    "[ArchiveHeader] ignoring unknown tag line {:?}",
                                    String::from_utf8_lossy(&line)
                                );
                                stage = Stage::ParseTag;
                                break;
                            }
                            return Err(malformed(stream, &line));
                        }
                        line.push(b);
                        // bail early on clearly-binary garbage
                        if line.iter().any(|&c| c != b'\n' && !(0x20..0x7F).contains(&c)) {
                            return Err(malformed(stream, &line));
                        }
                    }
                }
                Stage::ParseValue => {
                    line.clear();
                    loop {
                        let b = read_byte(stream)?;
                        if b == b'\n' {
                            break;
                        }
                        if line.len() >= MAX_LINE {
                            return Err(malformed(stream, &line));
                        }
                        line.push(b);
                    }
                    let value = String::from_utf8_lossy(&line).trim().to_string();
                    header.set_field(&pending_tag, &value);
                    stage = Stage::ParseTag;
                }
                Stage::Done => {
                    stream.clear_mark();
                    return Ok(header);
                }
            }
        }
    }

    fn parse_magic(stream: &mut IOStream) -> Result<()> {
        let min_len = MAGIC_STRINGS.iter().map(|m| m.len()).min().unwrap_or(0);
        let mut probe = vec![0u8; min_len];
        stream.read_full(&mut probe)?;

        for magic in MAGIC_STRINGS {
            let m = magic.as_bytes();
            if probe[..] == m[..min_len] {
                // prefix matched; consume the rest of this magic
                let mut rest = vec![0u8; m.len() - min_len];
                stream.read_full(&mut rest)?;
                if rest[..] == m[min_len..] {
                    return Ok(());
                }
                break;
            }
        }
        let err = Error::parse(
            ParseKind::Header,
            stream.offset(),
            format!(
                "no magic string match, input begins {:?}",
                String::from_utf8_lossy(&probe[..probe.len().min(CONTEXT_LEN)])
            ),
        );
        stream.backup();
        Err(err)
    }
}

fn read_byte(stream: &mut IOStream) -> Result<u8> {
    let mut b = [0u8; 1];
    stream.read_full(&mut b)?;
    Ok(b[0])
}

/// A tag matches once the accumulated line equals it exactly.
fn match_tag(line: &[u8]) -> Option<&'static str> {
    if line == END_TAG.trim_end().as_bytes() {
        // "end header" before its newline: consume as the end tag
        return Some(END_TAG);
    }
    EMIT_TAGS
        .iter()
        .chain(OLD_TAGS.iter())
        .find(|t| t.as_bytes() == line)
        .copied()
}

fn malformed(stream: &IOStream, line: &[u8]) -> Error {
    let ctx: String = String::from_utf8_lossy(&line[..line.len().min(CONTEXT_LEN)])
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '.' })
        .collect();
    Error::parse(
        ParseKind::Header,
        stream.offset(),
        format!("no match for header string \"{ctx}\""),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileChannel, IOChannel};

    fn stream_over(bytes: &[u8]) -> IOStream {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("h.dat");
        std::fs::write(&path, bytes).expect("fixture");
        std::mem::forget(dir);
        IOStream::new(IOChannel::File(FileChannel::open_read(path).expect("open")))
    }

    fn sample_header() -> ArchiveHeader {
        ArchiveHeader {
            archive_version: "1".into(),
            software_version: "4.2".into(),
            project_name: "VOCALS".into(),
            system_name: "GV_N677F".into(),
            config_name: "research".into(),
            config_version: "7".into(),
            old_fields: Vec::new(),
        }
    }

    #[test]
    fn test_roundtrip_unpadded() {
        let h = sample_header();
        let mut s = stream_over(&h.to_bytes());
        let parsed = ArchiveHeader::parse(&mut s).expect("parse");
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_roundtrip_padded_lengths() {
        let h = sample_header();
        for len in [256usize, 300, 1024, 4096] {
            let bytes = h.to_padded_bytes(len).expect("pad");
            assert_eq!(bytes.len(), len);
            let mut s = stream_over(&bytes);
            let parsed = ArchiveHeader::parse(&mut s).expect("parse padded");
            assert_eq!(parsed, h);
            // everything through the end tag was consumed
            assert_eq!(s.offset(), len as u64);
        }
    }

    #[test]
    fn test_padding_too_small_fails() {
        let h = sample_header();
        assert!(h.to_padded_bytes(10).is_err());
    }

    #[test]
    fn test_second_magic_accepted() {
        let mut bytes = sample_header().to_bytes();
        let first = MAGIC_STRINGS[0].len();
        bytes.splice(0..first, MAGIC_STRINGS[1].bytes());
        let mut s = stream_over(&bytes);
        let parsed = ArchiveHeader::parse(&mut s).expect("parse NCAR ADS3 header");
        assert_eq!(parsed.project_name, "VOCALS");
    }

    #[test]
    fn test_bad_magic_rejected_and_backed_up() {
        let mut s = stream_over(b"GARBAGE GARBAGE GARBAGE\n");
        let err = ArchiveHeader::parse(&mut s).unwrap_err();
        assert!(matches!(
            err,
            Error::Parse {
                kind: ParseKind::Header,
                ..
            }
        ));
        // probed bytes were pushed back
        assert_eq!(s.offset(), 0);
    }

    #[test]
    fn test_historical_keys_accepted_not_emitted() {
        let text = format!(
            "{}archive version: 1\nsite name: RICO\nobservation period name: rf08\nend header\n",
            MAGIC_STRINGS[0]
        );
        let mut s = stream_over(text.as_bytes());
        let parsed = ArchiveHeader::parse(&mut s).expect("parse");
        assert_eq!(parsed.system_name, "RICO");
        assert_eq!(
            parsed.old_fields,
            vec![("observation period name".to_string(), "rf08".to_string())]
        );
        // re-emission drops the historical spellings
        let out = String::from_utf8(parsed.to_bytes()).unwrap();
        assert!(!out.contains("site name"));
        assert!(!out.contains("observation period"));
        assert!(out.contains("system name: RICO"));
    }

    #[test]
    fn test_unknown_tag_line_ignored() {
        let text = format!(
            "{}archive version: 1\nfuture key: something\nproject name: X\nend header\n",
            MAGIC_STRINGS[0]
        );
        let mut s = stream_over(text.as_bytes());
        let parsed = ArchiveHeader::parse(&mut s).expect("parse");
        assert_eq!(parsed.archive_version, "1");
        assert_eq!(parsed.project_name, "X");
    }

    #[test]
    fn test_malformed_line_reports_context() {
        let text = format!("{}\x01\x02\x03binary junk", MAGIC_STRINGS[0]);
        let mut s = stream_over(text.as_bytes());
        let err = ArchiveHeader::parse(&mut s).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no match for header string"));
    }
}
