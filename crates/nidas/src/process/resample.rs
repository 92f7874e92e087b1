// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Nearest-neighbour resampler.
//!
//! Aligns asynchronous variables around a master variable (the first
//! declared). On each master sample it emits a record time-tagged with the
//! previous master time; each non-master slot gets the tracked value nearest
//! that time, screened by a window of one master interval shrunk 10% at each
//! end, or NaN. A trailing `nonNANs` weight counts the good values. The
//! master itself is never interpolated: every record carries a real master
//! timetag.
//!
//! Input samples are assumed time-sorted (run them through the sorter).

use crate::sample::tag::{SampleTag, VarType, Variable};
use crate::sample::{address_of, Sample, SampleData, SampleId, SamplePool, SampleType};
use crate::source::{SampleClient, SampleSource, SampleSourceSupport};
use crate::time::DsmTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct Inner {
    /// Per input sample id: (index in input scan, index in output, length).
    inmap: HashMap<SampleId, Vec<(usize, usize, usize)>>,
    nmaster: u32,
    prev_tt: Vec<DsmTime>,
    near_tt: Vec<DsmTime>,
    prev_val: Vec<f32>,
    near_val: Vec<f32>,
    samples_since_master: Vec<u32>,
}

pub struct NearestResampler {
    support: SampleSourceSupport,
    out_tag: Arc<SampleTag>,
    out_id: SampleId,
    /// Data values in the output, master first; +1 slot for nonNANs.
    ndata: usize,
    master: usize,
    pool: SamplePool,
    inner: Mutex<Inner>,
}

impl NearestResampler {
    /// Build from the variables to track, master first. `out_id` is the
    /// freshly minted id the emitted records carry.
    pub fn new(vars: &[Variable], out_id: SampleId, pool: SamplePool) -> Arc<NearestResampler> {
        let support = SampleSourceSupport::new();

        let mut out_tag = SampleTag::new(out_id, 0.0);
        let mut ndata = 0;
        for v in vars {
            ndata += v.length();
            out_tag
                .add_variable(v.clone())
                .expect("unwired tag accepts variables");
        }
        out_tag
            .add_variable(
                Variable::new("nonNANs")
                    .with_type(VarType::Weight)
                    .with_units(""),
            )
            .expect("unwired tag accepts variables");
        let out_tag = support.add_sample_tag(out_tag);

        Arc::new(NearestResampler {
            support,
            out_tag,
            out_id,
            ndata,
            master: 0,
            pool,
            inner: Mutex::new(Inner {
                inmap: HashMap::new(),
                nmaster: 0,
                prev_tt: vec![0; ndata],
                near_tt: vec![0; ndata],
                prev_val: vec![f32::NAN; ndata],
                near_val: vec![f32::NAN; ndata],
                samples_since_master: vec![0; ndata],
            }),
        })
    }

    pub fn out_tag(&self) -> &Arc<SampleTag> {
        &self.out_tag
    }

    /// Wire this resampler to a source: match tracked variables against the
    /// source's tags and register for the tags that carry any of them.
    pub fn connect(self: &Arc<Self>, source: &SampleSourceSupport) {
        let mut inner = self.inner.lock();
        for intag in source.sample_tags() {
            let mut matched = false;
            for (vi, var) in intag.variables().iter().enumerate() {
                let in_index = intag.data_index(vi);
                for (oi, myvar) in self.out_tag.variables().iter().enumerate() {
                    if myvar.var_type() == VarType::Weight || myvar != var {
                        continue;
                    }
                    let out_index = self.out_tag.data_index(oi);
                    inner
                        .inmap
                        .entry(address_of(intag.id()))
                        .or_default()
                        .push((in_index, out_index, var.length()));
                    matched = true;
                }
            }
            if matched {
                source.add_sample_client_for_tag(self.clone(), &intag);
            }
        }
    }

    pub fn disconnect(self: &Arc<Self>, source: &SampleSourceSupport) {
        let client: Arc<dyn SampleClient> = self.clone();
        source.remove_sample_client(&client);
    }

    fn emit(&self, inner: &mut Inner, min_tt: DsmTime, max_tt: DsmTime) {
        let mut buf = self.pool.get_floats(self.ndata + 1);
        let mut non_nans = 0u32;
        if let SampleData::Float32(out) = buf.data_mut() {
            for k in 0..self.ndata {
                if k == self.master {
                    out[k] = inner.prev_val[k];
                    if !out[k].is_nan() {
                        non_nans += 1;
                    }
                    continue;
                }
                let v = match inner.samples_since_master[k] {
                    // nothing since the previous master: fall back to the
                    // last value seen
                    0 => {
                        if inner.prev_tt[k] > max_tt || inner.prev_tt[k] < min_tt {
                            f32::NAN
                        } else {
                            inner.prev_val[k]
                        }
                    }
                    _ => {
                        if inner.near_tt[k] > max_tt || inner.near_tt[k] < min_tt {
                            f32::NAN
                        } else {
                            inner.near_val[k]
                        }
                    }
                };
                out[k] = v;
                if !v.is_nan() {
                    non_nans += 1;
                }
                inner.samples_since_master[k] = 0;
            }
            out[self.ndata] = non_nans as f32;
        }
        buf.set_time_tag(inner.prev_tt[self.master]).set_id(self.out_id);
        self.support.distribute(&buf.share());
    }

    fn receive_value(&self, inner: &mut Inner, oi: usize, tt: DsmTime, val: f32) {
        let m = self.master;
        if oi == m {
            // a new master value: emit the record aligned to the previous
            // master time
            if inner.nmaster == 0 {
                inner.nmaster = 1;
                inner.near_tt[m] = inner.prev_tt[m];
                inner.prev_tt[m] = tt;
                inner.prev_val[m] = val;
                return;
            }
            let (min_tt, max_tt) = if inner.nmaster == 1 {
                inner.nmaster = 2;
                let dt = tt - inner.prev_tt[m];
                (inner.prev_tt[m] - dt * 9 / 10, tt - dt / 10)
            } else {
                (
                    inner.near_tt[m] + (inner.prev_tt[m] - inner.near_tt[m]) / 10,
                    tt - (tt - inner.prev_tt[m]) / 10,
                )
            };
            self.emit(inner, min_tt, max_tt);

            inner.near_tt[m] = inner.prev_tt[m];
            inner.prev_tt[m] = tt;
            inner.prev_val[m] = val;
        } else {
            if inner.samples_since_master[oi] == 0 {
                // first sample of this variable since the last master: pick
                // whichever of it and the previous one is nearer the
                // previous master time
                if inner.prev_tt[m] > (tt + inner.prev_tt[oi]) / 2 {
                    inner.near_tt[oi] = tt;
                    inner.near_val[oi] = val;
                } else {
                    inner.near_tt[oi] = inner.prev_tt[oi];
                    inner.near_val[oi] = inner.prev_val[oi];
                }
                inner.samples_since_master[oi] = 1;
            }
            // later samples in the interval cannot be nearer; just retain
            inner.prev_tt[oi] = tt;
            inner.prev_val[oi] = val;
        }
    }

    /// Emit whatever is pending as one final record and reset the bootstrap.
    pub fn finish(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.nmaster < 2 {
                return;
            }
            let m = self.master;
            let max_tt = inner.prev_tt[m] + (inner.prev_tt[m] - inner.near_tt[m]);
            let min_tt = inner.near_tt[m];
            self.emit(&mut inner, min_tt, max_tt);
            for k in 0..self.ndata {
                inner.prev_val[k] = f32::NAN;
            }
            inner.nmaster = 0;
        }
        self.support.flush();
    }
}

impl SampleSource for NearestResampler {
    fn support(&self) -> &SampleSourceSupport {
        &self.support
    }
}

impl SampleClient for NearestResampler {
    fn receive(&self, samp: &Sample) -> bool {
        if !matches!(
            samp.sample_type(),
            SampleType::Float32 | SampleType::Float64
        ) {
            return false;
        }
        let tt = samp.time_tag();
        let id = address_of(samp.id());
        let mut inner = self.inner.lock();
        let Some(mappings) = inner.inmap.get(&id).cloned() else {
            return false;
        };
        for (in_i, out_i, vlen) in mappings {
            let mut ii = in_i;
            let mut oi = out_i;
            for _ in 0..vlen {
                let Some(val) = samp.data().value(ii) else {
                    break;
                };
                self.receive_value(&mut inner, oi, tt, val as f32);
                ii += 1;
                oi += 1;
            }
        }
        true
    }

    fn flush(&self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::make_id;

    struct Collector {
        records: Mutex<Vec<(DsmTime, Vec<f32>)>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Collector {
                records: Mutex::new(Vec::new()),
            })
        }
    }

    impl SampleClient for Collector {
        fn receive(&self, s: &Sample) -> bool {
            self.records
                .lock()
                .push((s.time_tag(), s.data().as_floats().unwrap().to_vec()));
            true
        }
    }

    fn scalar_sample(pool: &SamplePool, id: SampleId, tt: DsmTime, v: f32) -> Sample {
        let mut buf = pool.get(SampleType::Float32, 1);
        if let SampleData::Float32(d) = buf.data_mut() {
            d.push(v);
        }
        buf.set_time_tag(tt).set_id(id);
        buf.share()
    }

    /// Two sources: a 1 Hz master and an asynchronous secondary.
    fn rig() -> (
        Arc<NearestResampler>,
        Arc<Collector>,
        SamplePool,
        SampleId,
        SampleId,
    ) {
        let pool = SamplePool::new();
        let master_id = make_id(1, 0x10);
        let sec_id = make_id(1, 0x11);

        let source = SampleSourceSupport::new();
        let mut mtag = SampleTag::new(master_id, 1.0);
        mtag.add_variable(Variable::new("Tmaster")).unwrap();
        source.add_sample_tag(mtag);
        let mut stag = SampleTag::new(sec_id, 0.0);
        stag.add_variable(Variable::new("U")).unwrap();
        source.add_sample_tag(stag);

        let rs = NearestResampler::new(
            &[Variable::new("Tmaster"), Variable::new("U")],
            make_id(1, 0x100),
            pool.clone(),
        );
        rs.connect(&source);

        let out = Collector::new();
        rs.support().add_sample_client(out.clone());
        (rs, out, pool, master_id, sec_id)
    }

    #[test]
    fn test_master_alignment_and_nearest_pick() {
        let (rs, out, pool, master_id, sec_id) = rig();

        rs.receive(&scalar_sample(&pool, master_id, 1_000_000, 10.0));
        rs.receive(&scalar_sample(&pool, sec_id, 900_000, 9.0));
        rs.receive(&scalar_sample(&pool, sec_id, 1_100_000, 11.0));
        rs.receive(&scalar_sample(&pool, master_id, 2_000_000, 20.0));
        rs.receive(&scalar_sample(&pool, master_id, 3_000_000, 30.0));

        let records = out.records.lock();
        assert_eq!(records.len(), 2);

        // every record is time-tagged with a real master timetag
        let (tt, vals) = &records[0];
        assert_eq!(*tt, 1_000_000);
        assert_eq!(vals.len(), 3);
        assert_eq!(vals[0], 10.0);
        // 900 us sample is the nearest to the 1 s master
        assert_eq!(vals[1], 9.0);
        assert_eq!(vals[2], 2.0); // nonNANs

        let (tt, vals) = &records[1];
        assert_eq!(*tt, 2_000_000);
        assert_eq!(vals[0], 20.0);
        assert_eq!(vals[1], 11.0);
        assert_eq!(vals[2], 2.0);
    }

    #[test]
    fn test_bootstrap_no_output_before_two_masters() {
        let (rs, out, pool, master_id, sec_id) = rig();
        rs.receive(&scalar_sample(&pool, sec_id, 500_000, 5.0));
        rs.receive(&scalar_sample(&pool, master_id, 1_000_000, 10.0));
        assert!(out.records.lock().is_empty());
    }

    #[test]
    fn test_secondary_gap_yields_nan() {
        let (rs, out, pool, master_id, sec_id) = rig();
        rs.receive(&scalar_sample(&pool, master_id, 1_000_000, 10.0));
        rs.receive(&scalar_sample(&pool, sec_id, 1_050_000, 9.0));
        rs.receive(&scalar_sample(&pool, master_id, 2_000_000, 20.0));
        // long secondary silence: next record's secondary is stale and
        // outside the window
        rs.receive(&scalar_sample(&pool, master_id, 10_000_000, 30.0));
        rs.receive(&scalar_sample(&pool, master_id, 11_000_000, 40.0));

        let records = out.records.lock();
        // record at master 10 s covers [2s..10s]-ish: secondary long gone
        let (tt, vals) = &records[2];
        assert_eq!(*tt, 10_000_000);
        assert!(vals[1].is_nan());
        assert_eq!(vals[2], 1.0); // only the master is non-NaN
    }

    #[test]
    fn test_finish_emits_trailing_record() {
        let (rs, out, pool, master_id, sec_id) = rig();
        rs.receive(&scalar_sample(&pool, master_id, 1_000_000, 10.0));
        rs.receive(&scalar_sample(&pool, sec_id, 1_900_000, 19.0));
        rs.receive(&scalar_sample(&pool, master_id, 2_000_000, 20.0));
        assert_eq!(out.records.lock().len(), 1);

        rs.finish();
        let records = out.records.lock();
        assert_eq!(records.len(), 2);
        let (tt, vals) = &records[1];
        assert_eq!(*tt, 2_000_000);
        assert_eq!(vals[0], 20.0);
        assert_eq!(vals[1], 19.0);
    }

    #[test]
    fn test_non_float_rejected() {
        let (rs, _out, pool, master_id, _sec) = rig();
        let mut buf = pool.get(SampleType::Char, 4);
        if let SampleData::Char(v) = buf.data_mut() {
            v.extend_from_slice(b"text");
        }
        buf.set_time_tag(1).set_id(master_id);
        assert!(!rs.receive(&buf.share()));
    }
}
