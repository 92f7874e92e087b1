// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-second sync records.
//!
//! All variables, at their declared rates, are laid into one float record
//! per wall-clock second. Each rate group (the variables of one sample tag)
//! occupies a contiguous block: one lag slot, then `ceil(rate) * length`
//! slots per variable in declaration order. The lag slot records the offset
//! (microseconds) of the group's first sample in that second.
//!
//! ```text
//! record:  [lag0 | v0_t0..v0_tN  v1_t0..v1_tN | lag1 | ...]
//!           '--------- rate group 0 ---------'
//! ```
//!
//! Offsets are computed once at init and kept in per-tag lookup tables, so
//! `receive` dispatches in O(variables-in-sample). The ASCII layout document
//! (see [`super::sync_reader`]) is emitted as its own sample so downstream
//! readers can rebuild the offset tables.

use crate::config::{SYNC_RECORD_HEADER_ID, SYNC_RECORD_ID, USECS_PER_SEC};
use crate::sample::tag::{Converter, SampleTag, VarType, Variable};
use crate::sample::{address_of, Sample, SampleBuf, SampleData, SampleId, SamplePool, SampleType};
use crate::source::{SampleClient, SampleSource, SampleSourceSupport};
use crate::time::{second_floor, DsmTime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Identity stamped into the sync header document.
#[derive(Debug, Clone, Default)]
pub struct SyncHeaderInfo {
    pub project: String,
    pub platform: String,
    pub flight: String,
}

struct Group {
    rate: f64,
    usecs_per_sample: i64,
    samples_per_sec: usize,
    /// Float slots of group data, lag excluded.
    length: usize,
    /// Absolute offset of the group's lag slot.
    offset: usize,
    vars: Vec<Variable>,
}

struct TagLayout {
    group: usize,
    /// Absolute offset of each variable's block, None for unplaced ones.
    var_offsets: Vec<Option<usize>>,
    var_lengths: Vec<usize>,
}

struct Layout {
    groups: Vec<Group>,
    by_id: HashMap<SampleId, TagLayout>,
    variables: Vec<Variable>,
    rec_size: usize,
}

struct Inner {
    layout: Layout,
    initialized: bool,
    record: Option<SampleBuf>,
    sync_time: DsmTime,
    pending_header: Option<DsmTime>,
    bad_times: u64,
    unknown_sample_type: u64,
    unrecognized_samples: u64,
}

pub struct SyncRecordSource {
    support: SampleSourceSupport,
    info: SyncHeaderInfo,
    pool: SamplePool,
    inner: Mutex<Inner>,
}

impl SyncRecordSource {
    pub fn new(info: SyncHeaderInfo, pool: SamplePool) -> Arc<SyncRecordSource> {
        Arc::new(SyncRecordSource {
            support: SampleSourceSupport::new(),
            info,
            pool,
            inner: Mutex::new(Inner {
                layout: Layout {
                    groups: Vec::new(),
                    by_id: HashMap::new(),
                    variables: Vec::new(),
                    rec_size: 0,
                },
                initialized: false,
                record: None,
                sync_time: 0,
                pending_header: None,
                bad_times: 0,
                unknown_sample_type: 0,
                unrecognized_samples: 0,
            }),
        })
    }

    /// Add a source's processed tags to the layout and register for them.
    ///
    /// Fails once the offset tables are frozen by the first record.
    pub fn connect(self: &Arc<Self>, source: &SampleSourceSupport) -> crate::error::Result<()> {
        let mut inner = self.inner.lock();
        if inner.initialized {
            return Err(crate::error::Error::InvalidState(
                "sync record layout frozen; connect before data flows".into(),
            ));
        }
        for tag in source.sample_tags() {
            if !tag.is_processed() {
                continue;
            }
            Self::add_tag(&mut inner.layout, &tag);
            source.add_sample_client_for_tag(self.clone(), &tag);
        }
        Ok(())
    }

    fn placed(v: &Variable) -> bool {
        matches!(v.var_type(), VarType::Continuous | VarType::Counter)
    }

    fn add_tag(layout: &mut Layout, tag: &SampleTag) {
        let vars = tag.variables();
        // samples with one non-continuous, non-counter variable carry no
        // aligned data
        if vars.len() == 1 && !Self::placed(&vars[0]) {
            return;
        }
        let rate = tag.rate();
        if rate <= 0.0 {
            return;
        }
        let group_id = layout.groups.len();
        let samples_per_sec = rate.ceil() as usize;
        let mut group = Group {
            rate,
            usecs_per_sample: (USECS_PER_SEC as f64 / rate).round() as i64,
            samples_per_sec,
            length: 0,
            offset: 0,
            vars: Vec::new(),
        };

        let mut var_offsets = Vec::with_capacity(vars.len());
        let mut var_lengths = Vec::with_capacity(vars.len());
        for var in vars {
            let vlen = var.length();
            var_lengths.push(vlen);
            if Self::placed(var) {
                var_offsets.push(Some(group.length));
                group.length += vlen * samples_per_sec;
                group.vars.push(var.clone());
                layout.variables.push(var.clone());
            } else {
                var_offsets.push(None);
            }
        }

        layout.groups.push(group);
        layout.by_id.insert(
            address_of(tag.id()),
            TagLayout {
                group: group_id,
                var_offsets,
                var_lengths,
            },
        );
    }

    /// Compute absolute offsets. Runs once, before the first record.
    fn init(inner: &mut Inner) {
        if inner.initialized {
            return;
        }
        inner.initialized = true;
        let mut offset = 0;
        for g in inner.layout.groups.iter_mut() {
            g.offset = offset;
            offset += g.length + 1;
        }
        inner.layout.rec_size = offset;
        for tl in inner.layout.by_id.values_mut() {
            let goff = inner.layout.groups[tl.group].offset;
            for vo in tl.var_offsets.iter_mut().flatten() {
                *vo += goff;
            }
        }
    }

    /// Total floats in one record.
    pub fn record_size(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::init(&mut inner);
        inner.layout.rec_size
    }

    /// `(lag slot offset, variable block offset)` of a variable by header
    /// name, from the frozen layout. The variable's data slots begin at
    /// `block offset + 1`.
    pub fn offsets_of(&self, name: &str) -> Option<(usize, usize)> {
        let mut inner = self.inner.lock();
        Self::init(&mut inner);
        for g in &inner.layout.groups {
            let mut rel = 0;
            for v in &g.vars {
                if v.header_name() == name {
                    return Some((g.offset, g.offset + rel));
                }
                rel += v.length() * g.samples_per_sec;
            }
        }
        None
    }

    pub fn bad_times(&self) -> u64 {
        self.inner.lock().bad_times
    }

    pub fn unknown_sample_type(&self) -> u64 {
        self.inner.lock().unknown_sample_type
    }

    /// Build the ASCII layout document.
    pub fn create_header(&self) -> String {
        let mut inner = self.inner.lock();
        Self::init(&mut inner);
        let mut out = String::new();
        let _ = writeln!(out, "project {}", self.info.project);
        let _ = writeln!(out, "aircraft {}", self.info.platform);
        let _ = writeln!(out, "flight {}", self.info.flight);

        out.push_str("variables {\n");
        for var in &inner.layout.variables {
            let name = var.header_name();
            if name != var.name() {
                log::warn!(
                    "[SyncRecord] variable name \"{}\" has embedded spaces, replaced with '_'",
                    var.name()
                );
            }
            let _ = write!(
                out,
                "{} {} {} \"{}\" \"{}\"",
                name,
                var.var_type().code(),
                var.length(),
                var.units(),
                var.long_name()
            );
            match var.converter() {
                Converter::Linear {
                    intercept,
                    slope,
                    units,
                } => {
                    let _ = write!(out, " {intercept} {slope} \"{units}\"");
                }
                Converter::Polynomial { coefs, units } => {
                    for c in coefs {
                        let _ = write!(out, " {c}");
                    }
                    let _ = write!(out, " \"{units}\"");
                }
                _ => {
                    let _ = write!(out, " \"{}\"", var.units());
                }
            }
            out.push_str(";\n");
        }
        out.push_str("}\n");

        out.push_str("rates {\n");
        for g in &inner.layout.groups {
            let _ = write!(out, "{:.2}", g.rate);
            for var in &g.vars {
                let _ = write!(out, " {}", var.header_name());
            }
            out.push_str(" ;\n");
        }
        out.push_str("}\n");
        out
    }

    /// Ask for the layout document to be distributed ahead of the next
    /// record, time-tagged `tt`.
    pub fn send_header(&self, tt: DsmTime) {
        self.inner.lock().pending_header = Some(tt);
    }

    fn distribute_header(&self, tt: DsmTime) {
        let doc = self.create_header();
        let mut buf = self.pool.get_chars(doc.as_bytes());
        buf.set_time_tag(tt).set_id(SYNC_RECORD_HEADER_ID);
        self.support.distribute(&buf.share());
    }

    fn allocate(&self, inner: &mut Inner) {
        let mut buf = self.pool.get_floats(inner.layout.rec_size);
        buf.set_time_tag(inner.sync_time).set_id(SYNC_RECORD_ID);
        inner.record = Some(buf);
    }

    fn emit(&self, inner: &mut Inner) {
        if let Some(buf) = inner.record.take() {
            self.support.distribute(&buf.share());
            inner.sync_time += USECS_PER_SEC;
        }
    }

    /// Emit the pending record, e.g. at end of data.
    pub fn flush_record(&self) {
        let mut inner = self.inner.lock();
        self.emit(&mut inner);
    }
}

impl SampleSource for SyncRecordSource {
    fn support(&self) -> &SampleSourceSupport {
        &self.support
    }
}

impl SampleClient for SyncRecordSource {
    fn receive(&self, samp: &Sample) -> bool {
        let tt = samp.time_tag();
        let id = address_of(samp.id());
        let mut inner = self.inner.lock();
        Self::init(&mut inner);

        if inner.record.is_none() {
            inner.sync_time = second_floor(tt);
            self.allocate(&mut inner);
        }

        // screen bad times
        if tt < inner.sync_time {
            inner.bad_times += 1;
            if inner.bad_times % 100 == 1 {
                log::warn!(
                    "[SyncRecord] bad time, diff={} us, dsm={}, id={}",
                    inner.sync_time - tt,
                    crate::sample::dsm_id(id),
                    crate::sample::short_id(id)
                );
            }
            return false;
        }

        if tt >= inner.sync_time + USECS_PER_SEC {
            if let Some(htt) = inner.pending_header.take() {
                // header goes out ahead of the record it describes
                drop(inner);
                self.distribute_header(htt);
                inner = self.inner.lock();
            }
            self.emit(&mut inner);
            if tt >= inner.sync_time + USECS_PER_SEC {
                // leap forward
                inner.bad_times += 1;
                inner.sync_time = second_floor(tt);
            }
            self.allocate(&mut inner);
        }

        let group = inner.layout.by_id.get(&id).map(|tl| tl.group);
        let Some(group) = group else {
            inner.unrecognized_samples += 1;
            return false;
        };

        let floats: Vec<f32> = match samp.data() {
            SampleData::Float32(v) => v.clone(),
            SampleData::Float64(v) => v.iter().map(|&x| x as f32).collect(),
            _ => {
                inner.unknown_sample_type += 1;
                if inner.unknown_sample_type % 1000 == 1 {
                    log::warn!("[SyncRecord] sample id {id:#x} is not a float type");
                }
                return true;
            }
        };

        let usecs_per_sample = inner.layout.groups[group].usecs_per_sample;
        let samples_per_sec = inner.layout.groups[group].samples_per_sec;
        let group_offset = inner.layout.groups[group].offset;
        let time_index =
            (((tt - inner.sync_time) as f64) / usecs_per_sample as f64).round() as usize;
        if time_index >= samples_per_sec {
            inner.bad_times += 1;
            return false;
        }

        let var_offsets = inner.layout.by_id[&id].var_offsets.clone();
        let var_lengths = inner.layout.by_id[&id].var_lengths.clone();
        let lag = (tt - inner.sync_time) as f32;

        let Some(rec) = inner.record.as_mut() else {
            return false;
        };
        debug_assert_eq!(rec.sample_type(), SampleType::Float32);
        if let SampleData::Float32(out) = rec.data_mut() {
            // first contributing sample of this group this second carries
            // the group's lag
            if out[group_offset].is_nan() {
                out[group_offset] = lag;
            }
            let mut src = 0usize;
            for (vo, vlen) in var_offsets.iter().zip(var_lengths.iter()) {
                if src + vlen > floats.len() {
                    break;
                }
                if let Some(vo) = vo {
                    let dst = vo + 1 + vlen * time_index;
                    out[dst..dst + vlen].copy_from_slice(&floats[src..src + vlen]);
                }
                src += vlen;
            }
        }
        true
    }

    fn flush(&self) {
        self.flush_record();
        self.support.flush();
    }
}
