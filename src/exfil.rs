//! This module is responsible for exfilling integrated spectra to disk
//!
//! Every cycle each channel appends one fixed-layout binary record to the
//! station's file for the current UTC day, `<YYYYMMDD>_s<station>.ozo`.
//! All channels share one file per day and are told apart by the channel
//! field of the record. The open file and its day are process-wide state,
//! so the writer lives behind one mutex shared by all recorders.
//!
//! Record layout (native endian, packed):
//!
//! | field | type |
//! |---|---|
//! | magic `0xA9E4B8B4` | u32 |
//! | version | u32 |
//! | record length in bytes | u32 |
//! | timestamp (unix seconds) | u64 |
//! | frequency error (Hz, NaN if unknown) | f64 |
//! | FFT windows integrated above / below line | 2 × i32 |
//! | sample rate | u32 |
//! | FFT length | u32 |
//! | channel | i32 |
//! | dongle serial | 16 bytes |
//! | line frequency (Hz) | f64 |
//! | station number | i32 |
//! | station name | 16 bytes |
//! | peak signal level | i32 |
//! | calibration spectrum | FFT length × f32 |
//! | above / below line spectra | 2 × FFT length × f32 |

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use byte_slice_cast::AsByteSlice;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info};

use crate::{error::Result, fixed_field, MAX_SN_LEN};

pub const HEADER_MAGIC: u32 = 0xA9E4_B8B4;
pub const HEADER_VERSION: u32 = 2;
/// Bytes before the first spectrum
pub const HEADER_LEN: usize = 96;

pub fn record_len(fft_len: usize) -> usize {
    HEADER_LEN + 3 * fft_len * std::mem::size_of::<f32>()
}

/// Name of the station's output file for one UTC day
pub fn file_name(day: NaiveDate, station: i32) -> String {
    format!("{}_s{}.ozo", day.format("%Y%m%d"), station)
}

#[derive(Clone, Debug, Default)]
pub struct Station {
    pub number: i32,
    pub name: String,
}

/// Everything one channel produced in one cycle
#[derive(Clone, Debug)]
pub struct CycleRecord<'a> {
    pub channel: usize,
    pub timestamp: DateTime<Utc>,
    pub freq_err: f64,
    pub band_counts: [usize; 2],
    pub sample_rate: u32,
    pub line_freq: f64,
    pub serial: &'a str,
    pub max_sig_level: i32,
    pub cal_spectrum: &'a [f32],
    pub signal_spectra: [&'a [f32]; 2],
}

impl CycleRecord<'_> {
    pub fn fft_len(&self) -> usize {
        self.cal_spectrum.len()
    }

    /// Serialize into `out` (cleared first)
    pub fn encode(&self, station: &Station, out: &mut Vec<u8>) {
        let fft_len = self.fft_len();
        assert!(
            self.signal_spectra.iter().all(|s| s.len() == fft_len),
            "all spectra in a record must have the same length"
        );
        let len = record_len(fft_len);
        let count = |c: usize| i32::try_from(c).unwrap_or(i32::MAX);
        out.clear();
        out.reserve(len);
        out.extend_from_slice(&HEADER_MAGIC.to_ne_bytes());
        out.extend_from_slice(&HEADER_VERSION.to_ne_bytes());
        out.extend_from_slice(&(len as u32).to_ne_bytes());
        out.extend_from_slice(&(self.timestamp.timestamp() as u64).to_ne_bytes());
        out.extend_from_slice(&self.freq_err.to_ne_bytes());
        out.extend_from_slice(&count(self.band_counts[0]).to_ne_bytes());
        out.extend_from_slice(&count(self.band_counts[1]).to_ne_bytes());
        out.extend_from_slice(&self.sample_rate.to_ne_bytes());
        out.extend_from_slice(&(fft_len as u32).to_ne_bytes());
        out.extend_from_slice(&(self.channel as i32).to_ne_bytes());
        out.extend_from_slice(&fixed_field::<MAX_SN_LEN>(self.serial));
        out.extend_from_slice(&self.line_freq.to_ne_bytes());
        out.extend_from_slice(&station.number.to_ne_bytes());
        out.extend_from_slice(&fixed_field::<MAX_SN_LEN>(&station.name));
        out.extend_from_slice(&self.max_sig_level.to_ne_bytes());
        debug_assert_eq!(out.len(), HEADER_LEN);
        out.extend_from_slice(self.cal_spectrum.as_byte_slice());
        for s in self.signal_spectra {
            out.extend_from_slice(s.as_byte_slice());
        }
        debug_assert_eq!(out.len(), len);
    }
}

struct DayFile {
    day: NaiveDate,
    path: PathBuf,
    file: BufWriter<File>,
}

/// Appends records to the current day's file, rotating at UTC midnight
pub struct RecordWriter {
    data_dir: PathBuf,
    station: Station,
    current: Option<DayFile>,
    buf: Vec<u8>,
}

/// The writer as shared between recorder threads
pub type SharedWriter = Arc<Mutex<RecordWriter>>;

impl RecordWriter {
    pub fn new<P: AsRef<Path>>(data_dir: P, station: Station) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            station,
            current: None,
            buf: Vec::new(),
        }
    }

    pub fn shared(self) -> SharedWriter {
        Arc::new(Mutex::new(self))
    }

    pub fn station(&self) -> &Station {
        &self.station
    }

    /// Path of the file currently open for appending
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }

    fn rotate(&mut self, day: NaiveDate) -> Result<()> {
        if let Some(mut old) = self.current.take() {
            if let Err(e) = old.file.flush() {
                error!("Failed to flush {}: {}", old.path.display(), e);
            }
        }
        let path = self.data_dir.join(file_name(day, self.station.number));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                error!("Cannot open {}: {}", path.display(), e);
                e
            })?;
        info!("Writing records to {}", path.display());
        self.current = Some(DayFile {
            day,
            path,
            file: BufWriter::new(file),
        });
        Ok(())
    }

    /// Append one record, opening a new file if the record's UTC day differs
    /// from the open one. Must only be called with the shared mutex held.
    pub fn write(&mut self, record: &CycleRecord) -> Result<()> {
        let day = record.timestamp.date_naive();
        if self.current.as_ref().map(|f| f.day) != Some(day) {
            self.rotate(day)?;
        }
        record.encode(&self.station, &mut self.buf);
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        let res = current
            .file
            .write_all(&self.buf)
            .and_then(|_| current.file.flush());
        if let Err(e) = res {
            error!("Failed to write record to {}: {}", current.path.display(), e);
            // Reopen on the next record
            self.current = None;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(file_name(day, 12), "20240307_s12.ozo");
    }

    #[test]
    fn test_record_len() {
        assert_eq!(record_len(768), 96 + 3 * 768 * 4);
    }

    #[test]
    fn test_encode_header() {
        let cal = vec![1.0f32; 4];
        let sig = [vec![2.0f32; 4], vec![3.0f32; 4]];
        let rec = CycleRecord {
            channel: 3,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap(),
            freq_err: -1250.5,
            band_counts: [10, 0],
            sample_rate: 1_800_000,
            line_freq: 1.5e9,
            serial: "00000123",
            max_sig_level: 42,
            cal_spectrum: &cal,
            signal_spectra: [&sig[0], &sig[1]],
        };
        let station = Station {
            number: 7,
            name: "Onsala".to_owned(),
        };
        let mut out = Vec::new();
        rec.encode(&station, &mut out);
        assert_eq!(out.len(), record_len(4));
        let u32_at = |o: usize| u32::from_ne_bytes(out[o..o + 4].try_into().unwrap());
        let i32_at = |o: usize| i32::from_ne_bytes(out[o..o + 4].try_into().unwrap());
        let f64_at = |o: usize| f64::from_ne_bytes(out[o..o + 8].try_into().unwrap());
        let f32_at = |o: usize| f32::from_ne_bytes(out[o..o + 4].try_into().unwrap());
        assert_eq!(u32_at(0), HEADER_MAGIC);
        assert_eq!(u32_at(4), HEADER_VERSION);
        assert_eq!(u32_at(8) as usize, record_len(4));
        assert_eq!(u64::from_ne_bytes(out[12..20].try_into().unwrap()), 1704067210);
        assert_eq!(f64_at(20), -1250.5);
        assert_eq!(i32_at(28), 10);
        assert_eq!(i32_at(32), 0);
        assert_eq!(u32_at(36), 1_800_000);
        assert_eq!(u32_at(40), 4);
        assert_eq!(i32_at(44), 3);
        assert_eq!(&out[48..56], b"00000123");
        assert!(out[56..64].iter().all(|&b| b == 0));
        assert_eq!(f64_at(64), 1.5e9);
        assert_eq!(i32_at(72), 7);
        assert_eq!(&out[76..82], b"Onsala");
        assert_eq!(i32_at(92), 42);
        assert_eq!(f32_at(96), 1.0);
        assert_eq!(f32_at(96 + 16), 2.0);
        assert_eq!(f32_at(96 + 32), 3.0);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let mut writer = RecordWriter::new("/nonexistent/ozonespec", Station::default());
        let cal = vec![0.0f32; 2];
        let rec = CycleRecord {
            channel: 0,
            timestamp: Utc::now(),
            freq_err: 0.0,
            band_counts: [1, 1],
            sample_rate: 1,
            line_freq: 1.0,
            serial: "x",
            max_sig_level: 0,
            cal_spectrum: &cal,
            signal_spectra: [&cal, &cal],
        };
        assert!(writer.write(&rec).is_err());
        assert!(writer.current_path().is_none());
    }
}
