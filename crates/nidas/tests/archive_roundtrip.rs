// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Archive round-trip: what goes into a FileSet comes back byte-identical.

use nidas::io::{FileChannel, FileSet, IOChannel};
use nidas::sample::{make_id, SampleData, SampleType};
use nidas::{ArchiveHeader, Sample, SampleInputStream, SampleOutputStream, SamplePool};

fn header() -> ArchiveHeader {
    ArchiveHeader {
        archive_version: "1".into(),
        software_version: "nidas-rs".into(),
        project_name: "RICO".into(),
        system_name: "GV_N677F".into(),
        config_name: "research".into(),
        config_version: "3".into(),
        old_fields: Vec::new(),
    }
}

fn float_sample(pool: &SamplePool, tt: i64, id: u32, vals: &[f32]) -> Sample {
    let mut buf = pool.get(SampleType::Float32, vals.len());
    if let SampleData::Float32(v) = buf.data_mut() {
        v.extend_from_slice(vals);
    }
    buf.set_time_tag(tt).set_id(id);
    buf.share()
}

#[test]
fn three_samples_with_exact_frame_lengths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("s1.dat");
    let pool = SamplePool::new();

    let samples = vec![
        float_sample(&pool, 1_000_000, make_id(1, 0x10), &[1.0, 2.0, 3.0]),
        float_sample(&pool, 1_500_000, make_id(1, 0x10), &[4.0, 5.0, 6.0]),
        float_sample(&pool, 2_000_000, make_id(1, 0x11), &[]),
    ];

    let mut out = SampleOutputStream::new(
        IOChannel::File(FileChannel::create(&path).expect("create")),
        header(),
    );
    for s in &samples {
        out.write_sample(s).expect("write");
    }
    out.close().expect("close");

    // frames are 16+12, 16+12, 16+0 bytes after the header
    let header_len = header().to_bytes().len() as u64;
    let file_len = std::fs::metadata(&path).expect("metadata").len();
    assert_eq!(file_len, header_len + 28 + 28 + 16);

    let mut input = SampleInputStream::new(
        IOChannel::File(FileChannel::open_read(&path).expect("open")),
        pool,
    );
    let h = input.read_header().expect("header");
    assert_eq!(h.project_name, "RICO");
    assert_eq!(h.system_name, "GV_N677F");

    for want in &samples {
        let got = input.read_sample().expect("sample");
        assert_eq!(got.time_tag(), want.time_tag());
        assert_eq!(got.id(), want.id());
        assert_eq!(got.sample_type(), SampleType::Float32);
        assert_eq!(got.data(), want.data());
    }
    assert!(input.read_sample().unwrap_err().is_eof());
}

#[test]
fn random_sequence_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("rand.dat");
    let pool = SamplePool::new();
    let mut rng = fastrand::Rng::with_seed(0xDA7A);

    let mut samples: Vec<Sample> = Vec::new();
    let mut tt = 1_000_000i64;
    for _ in 0..500 {
        tt += rng.i64(1..50_000);
        let id = make_id(rng.u16(0..8), rng.u16(0..64));
        let s = match rng.u8(0..4) {
            0 => {
                let n = rng.usize(0..40);
                let mut buf = pool.get(SampleType::Float32, n);
                if let SampleData::Float32(v) = buf.data_mut() {
                    for _ in 0..n {
                        v.push(rng.f32() * 100.0 - 50.0);
                    }
                }
                buf.set_time_tag(tt).set_id(id);
                buf.share()
            }
            1 => {
                let n = rng.usize(1..100);
                let mut buf = pool.get(SampleType::Char, n);
                if let SampleData::Char(v) = buf.data_mut() {
                    for _ in 0..n {
                        v.push(rng.u8(..));
                    }
                }
                buf.set_time_tag(tt).set_id(id);
                buf.share()
            }
            2 => {
                let n = rng.usize(1..20);
                let mut buf = pool.get(SampleType::UInt16, n);
                if let SampleData::UInt16(v) = buf.data_mut() {
                    for _ in 0..n {
                        v.push(rng.u16(..));
                    }
                }
                buf.set_time_tag(tt).set_id(id);
                buf.share()
            }
            _ => {
                let n = rng.usize(1..10);
                let mut buf = pool.get(SampleType::Float64, n);
                if let SampleData::Float64(v) = buf.data_mut() {
                    for _ in 0..n {
                        v.push(rng.f64() * 1e6);
                    }
                }
                buf.set_time_tag(tt).set_id(id);
                buf.share()
            }
        };
        samples.push(s);
    }

    let mut out = SampleOutputStream::new(
        IOChannel::File(FileChannel::create(&path).expect("create")),
        header(),
    );
    for s in &samples {
        out.write_sample(s).expect("write");
    }
    out.close().expect("close");

    let mut input = SampleInputStream::new(
        IOChannel::File(FileChannel::open_read(&path).expect("open")),
        pool,
    );
    input.read_header().expect("header");
    for want in &samples {
        let got = input.read_sample().expect("sample");
        assert_eq!(got.time_tag(), want.time_tag());
        assert_eq!(got.id(), want.id());
        assert_eq!(got.data(), want.data());
    }
    assert!(input.read_sample().unwrap_err().is_eof());
    assert_eq!(input.bad_frames(), 0);
}

#[test]
fn gzip_fileset_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = SamplePool::new();

    let fset = FileSet::new(dir.path(), "gz_%Y%m%d_%H%M%S.dat.gz", 0);
    let mut out = SampleOutputStream::new(IOChannel::FileSet(fset), header());
    let samples: Vec<Sample> = (0..20)
        .map(|i| float_sample(&pool, 1_000_000 + i * 1000, make_id(1, 0x10), &[i as f32]))
        .collect();
    for s in &samples {
        out.write_sample(s).expect("write");
    }
    out.close().expect("close");

    let path = out.current_file().expect("file");
    let mut input = SampleInputStream::new(
        IOChannel::FileSet(FileSet::for_reading(vec![path.into()])),
        pool,
    );
    input.read_header().expect("header");
    for want in &samples {
        let got = input.read_sample().expect("sample");
        assert_eq!(got.data(), want.data());
    }
    assert!(input.read_sample().unwrap_err().is_eof());
}
