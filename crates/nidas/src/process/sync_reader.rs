// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reading sync-record streams.
//!
//! The reader waits for the layout document (the sample carrying
//! `SYNC_RECORD_HEADER_ID`), parses it, and rebuilds the same offset tables
//! the builder used, so per-second records can be addressed by variable
//! name. Variable-type codes `n`, `c`, `t`, `o` (and the weight code `w`)
//! are all accepted on input.

use crate::config::{SYNC_RECORD_HEADER_ID, SYNC_RECORD_ID, USECS_PER_SEC};
use crate::error::{Error, ParseKind, Result};
use crate::input::SampleInputStream;
use crate::sample::tag::{Converter, VarType};
use crate::sample::{address_of, SampleData};
use crate::time::DsmTime;
use std::collections::HashMap;

/// One variable as described by the layout document.
#[derive(Debug, Clone)]
pub struct SyncVariable {
    pub name: String,
    pub var_type: VarType,
    pub length: usize,
    pub units: String,
    pub long_name: String,
    pub converter: Option<Converter>,
}

/// One rate group: a rate and the variables laid out under it.
#[derive(Debug, Clone)]
pub struct RateGroup {
    pub rate: f64,
    pub names: Vec<String>,
}

/// Placement of one variable in the per-second record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlot {
    /// Offset of the group's lag slot.
    pub lag_offset: usize,
    /// Offset of the variable's block; data begins one slot later.
    pub block_offset: usize,
    pub length: usize,
    pub samples_per_sec: usize,
}

/// Parsed layout document.
#[derive(Debug, Clone, Default)]
pub struct SyncRecordHeader {
    pub project: String,
    pub platform: String,
    pub flight: String,
    pub variables: Vec<SyncVariable>,
    pub groups: Vec<RateGroup>,
}

impl SyncRecordHeader {
    /// Rebuild the (variable name -> slot) table and total record size.
    pub fn layout(&self) -> Result<(HashMap<String, VarSlot>, usize)> {
        let by_name: HashMap<&str, &SyncVariable> = self
            .variables
            .iter()
            .map(|v| (v.name.as_str(), v))
            .collect();
        let mut slots = HashMap::new();
        let mut cursor = 0usize;
        for group in &self.groups {
            let samples_per_sec = group.rate.ceil() as usize;
            let lag_offset = cursor;
            let mut rel = 0usize;
            for name in &group.names {
                let var = by_name.get(name.as_str()).ok_or_else(|| {
                    Error::parse(
                        ParseKind::Header,
                        0,
                        format!("rate group names unknown variable {name}"),
                    )
                })?;
                slots.insert(
                    name.clone(),
                    VarSlot {
                        lag_offset,
                        block_offset: lag_offset + rel,
                        length: var.length,
                        samples_per_sec,
                    },
                );
                rel += var.length * samples_per_sec;
            }
            cursor += rel + 1;
        }
        Ok((slots, cursor))
    }
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    peeked: Option<Token>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Punct(char),
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Lexer<'a> {
        Lexer {
            text,
            pos: 0,
            peeked: None,
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::parse(ParseKind::Header, self.pos as u64, msg)
    }

    fn lex(&mut self) -> Option<Token> {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }
        match bytes[self.pos] {
            c @ (b'{' | b'}' | b';') => {
                self.pos += 1;
                Some(Token::Punct(c as char))
            }
            b'"' => {
                self.pos += 1;
                let start = self.pos;
                while self.pos < bytes.len() && bytes[self.pos] != b'"' {
                    self.pos += 1;
                }
                let s = self.text[start..self.pos].to_string();
                self.pos = (self.pos + 1).min(bytes.len());
                Some(Token::Quoted(s))
            }
            _ => {
                let start = self.pos;
                while self.pos < bytes.len()
                    && !bytes[self.pos].is_ascii_whitespace()
                    && !matches!(bytes[self.pos], b'{' | b'}' | b';' | b'"')
                {
                    self.pos += 1;
                }
                Some(Token::Word(self.text[start..self.pos].to_string()))
            }
        }
    }

    fn next(&mut self) -> Option<Token> {
        self.peeked.take().or_else(|| self.lex())
    }

    fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.lex();
        }
        self.peeked.as_ref()
    }

    fn expect_word(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            other => Err(self.err(format!("expected word, got {other:?}"))),
        }
    }

    fn expect_quoted(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Quoted(q)) => Ok(q),
            other => Err(self.err(format!("expected quoted string, got {other:?}"))),
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(p)) if p == c => Ok(()),
            other => Err(self.err(format!("expected '{c}', got {other:?}"))),
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        let w = self.expect_word()?;
        if w == kw {
            Ok(())
        } else {
            Err(self.err(format!("expected \"{kw}\", got \"{w}\"")))
        }
    }
}

/// Parse the layout document text.
pub fn parse_header(text: &str) -> Result<SyncRecordHeader> {
    let mut lx = Lexer::new(text);
    let mut header = SyncRecordHeader::default();

    lx.expect_keyword("project")?;
    header.project = lx.expect_word()?;
    lx.expect_keyword("aircraft")?;
    header.platform = lx.expect_word()?;
    lx.expect_keyword("flight")?;
    header.flight = lx.expect_word()?;

    lx.expect_keyword("variables")?;
    lx.expect_punct('{')?;
    loop {
        let name = match lx.next() {
            Some(Token::Punct('}')) => break,
            Some(Token::Word(w)) => w,
            other => return Err(lx.err(format!("expected variable name, got {other:?}"))),
        };
        let tcode = lx.expect_word()?;
        let var_type = tcode
            .chars()
            .next()
            .filter(|_| tcode.len() == 1)
            .and_then(VarType::from_code)
            .ok_or_else(|| lx.err(format!("unexpected variable type: {tcode}")))?;
        let length: usize = lx
            .expect_word()?
            .parse()
            .map_err(|_| lx.err("bad variable length"))?;
        let units = lx.expect_quoted()?;
        let long_name = lx.expect_quoted()?;

        let mut coefs: Vec<f64> = Vec::new();
        while let Some(Token::Word(w)) = lx.peek() {
            let w = w.clone();
            let Ok(c) = w.parse::<f64>() else {
                return Err(lx.err(format!("expected calibration coefficient, got \"{w}\"")));
            };
            coefs.push(c);
            lx.next();
        }
        let converted_units = lx.expect_quoted()?;
        lx.expect_punct(';')?;

        let converter = match coefs.len() {
            2 => Some(Converter::linear(coefs[0], coefs[1], converted_units)),
            n if n > 2 => Some(Converter::polynomial(coefs, converted_units)),
            _ => None,
        };
        header.variables.push(SyncVariable {
            name,
            var_type,
            length,
            units,
            long_name,
            converter,
        });
    }

    lx.expect_keyword("rates")?;
    lx.expect_punct('{')?;
    loop {
        let rate = match lx.next() {
            Some(Token::Punct('}')) => break,
            Some(Token::Word(w)) => w
                .parse::<f64>()
                .map_err(|_| lx.err(format!("bad rate \"{w}\"")))?,
            other => return Err(lx.err(format!("expected rate, got {other:?}"))),
        };
        let mut names = Vec::new();
        loop {
            match lx.next() {
                Some(Token::Punct(';')) => break,
                Some(Token::Word(w)) => names.push(w),
                other => return Err(lx.err(format!("expected variable name, got {other:?}"))),
            }
        }
        header.groups.push(RateGroup { rate, names });
    }

    Ok(header)
}

/// Reads a sync-record stream: layout document first, then per-second
/// records addressable by variable name.
pub struct SyncRecordReader {
    input: SampleInputStream,
    header: SyncRecordHeader,
    slots: HashMap<String, VarSlot>,
    rec_size: usize,
    start_time: DsmTime,
}

impl SyncRecordReader {
    /// Scan the stream for the layout document and parse it.
    pub fn new(mut input: SampleInputStream) -> Result<SyncRecordReader> {
        loop {
            let samp = input.read_sample()?;
            if address_of(samp.id()) != SYNC_RECORD_HEADER_ID {
                continue;
            }
            let text = samp
                .data()
                .as_chars()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .ok_or_else(|| {
                    Error::parse(ParseKind::Header, 0, "sync header is not a char sample")
                })?;
            let header = parse_header(&text)?;
            let (slots, rec_size) = header.layout()?;
            return Ok(SyncRecordReader {
                start_time: samp.time_tag() / USECS_PER_SEC,
                input,
                header,
                slots,
                rec_size,
            });
        }
    }

    pub fn header(&self) -> &SyncRecordHeader {
        &self.header
    }

    pub fn slots(&self) -> &HashMap<String, VarSlot> {
        &self.slots
    }

    pub fn record_size(&self) -> usize {
        self.rec_size
    }

    /// Stream start, seconds since the epoch, from the header's timetag.
    pub fn start_time(&self) -> DsmTime {
        self.start_time
    }

    /// Next per-second record. `Io(Eof)` at end of stream.
    pub fn read_record(&mut self) -> Result<(DsmTime, Vec<f32>)> {
        loop {
            let samp = self.input.read_sample()?;
            if address_of(samp.id()) != SYNC_RECORD_ID {
                continue;
            }
            let values = match samp.data() {
                SampleData::Float32(v) => v.clone(),
                _ => continue,
            };
            return Ok((samp.time_tag(), values));
        }
    }

    /// Extract one variable's values for a time index from a record.
    pub fn values_of<'a>(
        &self,
        record: &'a [f32],
        name: &str,
        time_index: usize,
    ) -> Option<&'a [f32]> {
        let slot = self.slots.get(name)?;
        if time_index >= slot.samples_per_sec {
            return None;
        }
        let start = slot.block_offset + 1 + slot.length * time_index;
        record.get(start..start + slot.length)
    }
}
