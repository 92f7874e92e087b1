// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sync records end to end: build, archive, read back, and agree on the
//! layout.

use nidas::config::{SYNC_RECORD_HEADER_ID, SYNC_RECORD_ID};
use nidas::io::{FileChannel, IOChannel};
use nidas::process::sync::SyncHeaderInfo;
use nidas::sample::{address_of, make_id, SampleData, SampleType};
use nidas::source::{SampleClient, SampleSource, SampleSourceSupport};
use nidas::{
    ArchiveHeader, Sample, SampleInputStream, SampleOutputStream, SamplePool, SampleTag,
    SyncRecordReader, SyncRecordSource, Variable,
};
use parking_lot::Mutex;
use std::sync::Arc;

struct Collector {
    samples: Mutex<Vec<Sample>>,
}

impl SampleClient for Collector {
    fn receive(&self, s: &Sample) -> bool {
        self.samples.lock().push(s.clone_ref());
        true
    }
}

fn ten_hz_source() -> (SampleSourceSupport, u32) {
    let source = SampleSourceSupport::new();
    let id = make_id(2, 0x50);
    let mut tag = SampleTag::new(id, 10.0);
    tag.add_variable(
        Variable::new("UWIND")
            .with_units("m/s")
            .with_long_name("wind U component"),
    )
    .unwrap();
    tag.add_variable(
        Variable::new("VWIND")
            .with_units("m/s")
            .with_long_name("wind V component"),
    )
    .unwrap();
    source.add_sample_tag(tag);
    (source, id)
}

fn two_var_sample(pool: &SamplePool, id: u32, tt: i64, u: f32, v: f32) -> Sample {
    let mut buf = pool.get(SampleType::Float32, 2);
    if let SampleData::Float32(d) = buf.data_mut() {
        d.extend_from_slice(&[u, v]);
    }
    buf.set_time_tag(tt).set_id(id);
    buf.share()
}

/// S5: ten evenly spaced 10 Hz samples fill one 21-float record; the
/// sample crossing the boundary triggers emission.
#[test]
fn one_second_record_layout() {
    let (source, id) = ten_hz_source();
    let pool = SamplePool::new();
    let sync = SyncRecordSource::new(SyncHeaderInfo::default(), pool.clone());
    sync.connect(&source).unwrap();
    let out = Arc::new(Collector {
        samples: Mutex::new(Vec::new()),
    });
    sync.support().add_sample_client(out.clone());

    for i in 0..10i64 {
        sync.receive(&two_var_sample(&pool, id, i * 100_000, i as f32, 100.0 + i as f32));
    }
    assert!(out.samples.lock().is_empty());
    sync.receive(&two_var_sample(&pool, id, 1_000_001, -1.0, -1.0));

    let records = out.samples.lock();
    assert_eq!(records.len(), 1);
    let vals = records[0].data().as_floats().unwrap();
    assert_eq!(vals.len(), 21);
    assert_eq!(vals[0], 0.0);
    for i in 0..10 {
        assert_eq!(vals[1 + i], i as f32);
        assert_eq!(vals[11 + i], 100.0 + i as f32);
    }
}

/// The offset map a reader computes from the header equals the builder's.
#[test]
fn reader_layout_matches_builder() {
    let (source, id) = ten_hz_source();

    // a second group at 1 Hz
    let slow_id = make_id(2, 0x51);
    let mut slow = SampleTag::new(slow_id, 1.0);
    slow.add_variable(Variable::new("PCAB").with_units("hPa")).unwrap();
    source.add_sample_tag(slow);

    let pool = SamplePool::new();
    let sync = SyncRecordSource::new(
        SyncHeaderInfo {
            project: "CAESAR".into(),
            platform: "C130".into(),
            flight: "rf01".into(),
        },
        pool.clone(),
    );
    sync.connect(&source).unwrap();

    let header = nidas::process::sync_reader::parse_header(&sync.create_header()).unwrap();
    let (slots, rec_size) = header.layout().unwrap();

    assert_eq!(rec_size, sync.record_size());
    for name in ["UWIND", "VWIND", "PCAB"] {
        let (lag, block) = sync.offsets_of(name).unwrap();
        assert_eq!(slots[name].lag_offset, lag, "{name} lag slot");
        assert_eq!(slots[name].block_offset, block, "{name} block");
    }
    let _ = id;
}

/// Full loop: builder -> archive file -> SyncRecordReader.
#[test]
fn archive_then_read_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sync.dat");
    let (source, id) = ten_hz_source();
    let pool = SamplePool::new();

    let sync = SyncRecordSource::new(
        SyncHeaderInfo {
            project: "CAESAR".into(),
            platform: "C130".into(),
            flight: "rf01".into(),
        },
        pool.clone(),
    );
    sync.connect(&source).unwrap();

    let output = nidas::output::SampleOutputClient::new(SampleOutputStream::new(
        IOChannel::File(FileChannel::create(&path).unwrap()),
        ArchiveHeader::default(),
    ));
    let client: Arc<dyn SampleClient> = output.clone();
    sync.support().add_sample_client(client);

    sync.send_header(0);
    for sec in 0..3i64 {
        for i in 0..10i64 {
            let tt = sec * 1_000_000 + i * 100_000;
            sync.receive(&two_var_sample(&pool, id, tt, tt as f32, -(tt as f32)));
        }
    }
    SampleClient::flush(sync.as_ref());
    output.with_output(|o| o.close()).unwrap();

    let input = SampleInputStream::new(
        IOChannel::File(FileChannel::open_read(&path).unwrap()),
        pool,
    );
    // note: read_header is the archive header; the sync header is a sample
    let mut input = input;
    input.read_header().unwrap();
    let mut reader = SyncRecordReader::new(input).unwrap();

    assert_eq!(reader.header().project, "CAESAR");
    assert_eq!(reader.record_size(), 21);

    for sec in 0..3i64 {
        let (tt, rec) = reader.read_record().unwrap();
        assert_eq!(tt, sec * 1_000_000);
        assert_eq!(rec.len(), 21);
        for i in 0..10usize {
            let want = (sec * 1_000_000 + i as i64 * 100_000) as f32;
            assert_eq!(reader.values_of(&rec, "UWIND", i).unwrap(), &[want]);
            assert_eq!(reader.values_of(&rec, "VWIND", i).unwrap(), &[-want]);
        }
    }
    assert!(reader.read_record().unwrap_err().is_eof());
}

/// Reserved ids sit in the processed namespace of DSM 0 and do not collide.
#[test]
fn reserved_ids() {
    assert_ne!(SYNC_RECORD_ID, SYNC_RECORD_HEADER_ID);
    assert_eq!(address_of(SYNC_RECORD_ID), SYNC_RECORD_ID);
    assert_eq!(nidas::sample::dsm_id(SYNC_RECORD_ID), 0);
}
