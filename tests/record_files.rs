//! Day files and record layout as seen on disk

use std::fs;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use ozonespec::exfil::{file_name, record_len, CycleRecord, RecordWriter, Station};

const N: usize = 8;

fn write_at(writer: &mut RecordWriter, channel: usize, timestamp: DateTime<Utc>) {
    let cal = vec![1.0f32; N];
    let above = vec![2.0f32; N];
    let below = vec![3.0f32; N];
    let record = CycleRecord {
        channel,
        timestamp,
        freq_err: 12.5,
        band_counts: [4, 4],
        sample_rate: 1_800_000,
        line_freq: 1_322_454_500.0,
        serial: "00000001",
        max_sig_level: 20,
        cal_spectrum: &cal,
        signal_spectra: [&above, &below],
    };
    writer.write(&record).unwrap();
}

fn station() -> Station {
    Station {
        number: 2,
        name: "Onsala".to_owned(),
    }
}

#[test]
fn test_same_day_appends() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = RecordWriter::new(dir.path(), station());
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    write_at(&mut writer, 0, t);
    write_at(&mut writer, 1, t);
    write_at(&mut writer, 0, t + chrono::Duration::seconds(70));

    let path = dir
        .path()
        .join(file_name(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), 2));
    assert_eq!(writer.current_path(), Some(path.as_path()));
    assert_eq!(fs::read(&path).unwrap().len(), 3 * record_len(N));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_rotates_at_utc_midnight() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = RecordWriter::new(dir.path(), station());
    write_at(&mut writer, 0, Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap());
    write_at(&mut writer, 0, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 1).unwrap());

    let first = fs::read(dir.path().join("20240101_s2.ozo")).unwrap();
    let second = fs::read(dir.path().join("20240102_s2.ozo")).unwrap();
    assert_eq!(first.len(), record_len(N));
    assert_eq!(second.len(), record_len(N));
}

#[test]
fn test_restart_appends_to_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let t = Utc.with_ymd_and_hms(2024, 3, 3, 8, 0, 0).unwrap();
    {
        let mut writer = RecordWriter::new(dir.path(), station());
        write_at(&mut writer, 0, t);
    }
    let mut writer = RecordWriter::new(dir.path(), station());
    write_at(&mut writer, 0, t + chrono::Duration::seconds(60));
    let data = fs::read(dir.path().join("20240303_s2.ozo")).unwrap();
    assert_eq!(data.len(), 2 * record_len(N));
}
