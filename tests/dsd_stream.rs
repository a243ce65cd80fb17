//! Stream format integration tests.
//!
//! End-to-end write/read/repair coverage over real files: ordering and value
//! preservation, scan/sample accounting, skipped ranges, mask and rate
//! history, user metadata, and crash recovery.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read};
use std::path::Path;

use daqpipe::dsd::{repair, DataType, DsdReader, DsdWriter};
use daqpipe::sample::Sample;

fn write_file(path: &Path, rate: u32, data_type: DataType) -> DsdWriter<BufWriter<File>> {
    DsdWriter::new(BufWriter::new(File::create(path).unwrap()), rate, data_type)
}

fn open_file(path: &Path) -> DsdReader<BufReader<File>> {
    DsdReader::open(BufReader::new(File::open(path).unwrap())).unwrap()
}

#[test]
fn two_channels_two_scans() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.nds");

    let mut w = write_file(&path, 1000, DataType::Double);
    w.write_sample(&Sample::new(0, 0, 0, 1)).unwrap();
    w.write_sample(&Sample::new(1, 0, 0, 2)).unwrap();
    w.write_sample(&Sample::new(0, 1, 0, 3)).unwrap();
    w.write_sample(&Sample::new(1, 1, 0, 4)).unwrap();
    w.end().unwrap();

    let mut r = open_file(&path);
    assert_eq!(r.scan_count(), 2);
    assert_eq!(r.sample_count(), 4);

    let scan = r.read_next_scan().unwrap().unwrap();
    assert_eq!(scan[&0].data, 1);
    assert_eq!(scan[&1].data, 2);
    let scan = r.read_next_scan().unwrap().unwrap();
    assert_eq!(scan[&0].data, 3);
    assert_eq!(scan[&1].data, 4);
    assert!(r.read_next_scan().unwrap().is_none());
}

#[test]
fn dropped_scans_are_accounted_not_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.nds");

    let mut w = write_file(&path, 1000, DataType::Double);
    for idx in 0..10u64 {
        w.write_sample(&Sample::new(0, idx, 0, 1)).unwrap();
        w.write_sample(&Sample::new(1, idx, 0, 2)).unwrap();
    }
    w.write_sample(&Sample::new(0, 20, 0, 3)).unwrap();
    w.end().unwrap();

    let r = open_file(&path);
    assert_eq!(r.history().skipped_ranges, vec![(10, 19)]);
    assert_eq!(r.channels_on_between(0, 20), vec![0, 1]);
    assert_eq!(r.scan_count(), 11);
    // scan_count matches the index span minus the skipped scans
    assert_eq!(
        r.scan_count(),
        (r.end_index() - r.start_index() + 1) - 10
    );
}

#[test]
fn rate_change_midway_shifts_the_clock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.nds");

    let mut w = write_file(&path, 1000, DataType::Double);
    for idx in 0..5u64 {
        w.write_sample(&Sample::new(0, idx, 0, 1)).unwrap();
    }
    w.set_sampling_rate(2000);
    for idx in 5..=10u64 {
        w.write_sample(&Sample::new(0, idx, 0, 1)).unwrap();
    }
    w.end().unwrap();

    let r = open_file(&path);
    assert_eq!(r.rate_at(4), 1000);
    assert_eq!(r.rate_at(5), 2000);
    let t = r.time_at(10);
    assert!((t - 0.008).abs() < 1e-12, "time_at(10) = {}", t);

    // time_at is monotone over the whole stream
    let mut prev = 0.0;
    for idx in 0..=10 {
        let t = r.time_at(idx);
        assert!(t >= prev);
        prev = t;
    }

    // wall-clock queries anchor at the recorded start time
    assert!(r.time_started() > 0);
    assert_eq!(r.wall_clock_time_at(0), r.time_started() as f64);
}

#[test]
fn crash_before_end_is_repairable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4.nds");

    let mut w = write_file(&path, 1000, DataType::Double);
    for idx in 0..10u64 {
        w.write_sample(&Sample::new(0, idx, 0, idx as u32)).unwrap();
        w.write_sample(&Sample::new(1, idx, 0, (idx * 7) as u32)).unwrap();
    }
    w.end().unwrap();

    // simulate the crash: chop the footer and a bit of the body off
    let mut bytes = Vec::new();
    File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
    let footer_len =
        u32::from_le_bytes(bytes[bytes.len() - 8..bytes.len() - 4].try_into().unwrap()) as usize;
    let body_len = bytes.len() - (footer_len + 8);
    bytes.truncate(body_len - 10);

    assert!(DsdReader::open(Cursor::new(bytes.clone())).is_err());

    let (stats, recovered) = repair(Cursor::new(bytes), Cursor::new(Vec::new())).unwrap();
    assert!(stats.scans_recovered >= 3);

    let mut r = DsdReader::open(Cursor::new(recovered.into_inner())).unwrap();
    for idx in 0..stats.scans_recovered {
        let scan = r.read_next_scan().unwrap().unwrap();
        assert_eq!(scan[&0].data, idx as u32);
        assert_eq!(scan[&1].data, (idx * 7) as u32);
    }
    assert!(r.read_next_scan().unwrap().is_none());
}

#[test]
fn full_feature_round_trip() {
    // 60 scans; a channel joins every 20 scans; rate change at the midpoint;
    // three user-data entries; two dropped ranges
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("full.nds");
    let dropped: [(u64, u64); 2] = [(25, 29), (40, 44)];
    let is_dropped = |idx: u64| dropped.iter().any(|(f, t)| (*f..=*t).contains(&idx));
    let channels_at = |idx: u64| -> Vec<u8> {
        match idx {
            0..=19 => vec![0],
            20..=39 => vec![0, 1],
            _ => vec![0, 1, 2],
        }
    };
    let value_of = |chan: u8, idx: u64| -> u32 { (u64::from(chan) * 100_000 + idx) as u32 };

    let mut expected: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
    {
        let mut w = write_file(&path, 1000, DataType::Double);
        w.write_user_data("subject", b"rat-42");
        for idx in 0..60u64 {
            if is_dropped(idx) {
                continue;
            }
            if idx == 30 {
                w.set_sampling_rate(500);
            }
            if idx == 10 {
                w.write_user_data("marker", b"stim");
            }
            if idx == 50 {
                w.write_user_data("note", &[0x00, 0xff, 0x80]);
            }
            for chan in channels_at(idx) {
                w.write_sample(&Sample::new(chan, idx, 0, value_of(chan, idx))).unwrap();
                expected.entry(chan).or_default().push(value_of(chan, idx));
            }
        }
        w.end().unwrap();
    }

    let mut r = open_file(&path);

    // per-channel sequences come back exactly, in order
    let mut got: BTreeMap<u8, Vec<u32>> = BTreeMap::new();
    let mut total_samples = 0u64;
    while let Some(s) = r.read_next_sample().unwrap() {
        assert!(!is_dropped(s.scan_index));
        got.entry(s.channel_id).or_default().push(s.data);
        total_samples += 1;
    }
    assert_eq!(got, expected);

    // counts agree with the footer
    assert_eq!(r.sample_count(), total_samples);
    assert_eq!(r.scan_count(), 60 - 10);
    assert_eq!(r.history().skipped_ranges, dropped.to_vec());
    assert_eq!(r.start_index(), 0);
    assert_eq!(r.end_index(), 59);

    // mask history answers range queries
    assert_eq!(r.channels_on_between(0, 19), vec![0]);
    assert_eq!(r.channels_on_between(0, 25), vec![0, 1]);
    assert_eq!(r.channels_on_between(45, 59), vec![0, 1, 2]);
    assert_eq!(r.max_unique_channels_used(), 3);
    assert!(r.is_chan_on(1, 20));
    assert!(!r.is_chan_on(1, 19));

    // rate history: the change lands right after the last 1000 Hz scan
    assert_eq!(r.rate_at(24), 1000);
    assert_eq!(r.rate_at(30), 500);

    // user metadata survives into the footer
    let meta = r.user_metadata();
    assert_eq!(meta.get("subject").map(Vec::as_slice), Some(&b"rat-42"[..]));
    assert_eq!(meta.get("marker").map(Vec::as_slice), Some(&b"stim"[..]));
    assert_eq!(meta.get("note").map(Vec::as_slice), Some(&[0x00, 0xff, 0x80][..]));
}

#[test]
fn repair_is_idempotent_on_well_formed_streams() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sound.nds");

    let mut w = write_file(&path, 1000, DataType::Float);
    for idx in 0..20u64 {
        w.write_sample(&Sample::new(0, idx, 0, idx as u32)).unwrap();
        w.write_sample(&Sample::new(3, idx, 0, (idx + 1000) as u32)).unwrap();
    }
    w.end().unwrap();

    let mut original_bytes = Vec::new();
    File::open(&path).unwrap().read_to_end(&mut original_bytes).unwrap();

    let (_stats, recovered) =
        repair(Cursor::new(original_bytes.clone()), Cursor::new(Vec::new())).unwrap();

    let mut a = DsdReader::open(Cursor::new(original_bytes)).unwrap();
    let mut b = DsdReader::open(Cursor::new(recovered.into_inner())).unwrap();
    loop {
        let (x, y) = (a.read_next_sample().unwrap(), b.read_next_sample().unwrap());
        assert_eq!(x, y);
        if x.is_none() {
            break;
        }
    }
    assert_eq!(a.scan_count(), b.scan_count());
    assert_eq!(a.sample_count(), b.sample_count());
}

#[test]
fn nonzero_start_index_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.nds");

    let mut w = write_file(&path, 1000, DataType::Double);
    for idx in 1000..1005u64 {
        w.write_sample(&Sample::new(0, idx, 0, 9)).unwrap();
    }
    w.end().unwrap();

    let mut r = open_file(&path);
    assert_eq!(r.start_index(), 1000);
    assert_eq!(r.end_index(), 1004);
    assert_eq!(r.scan_count(), 5);
    assert!(r.history().skipped_ranges.is_empty());
    let first = r.read_next_sample().unwrap().unwrap();
    assert_eq!(first.scan_index, 1000);
}
