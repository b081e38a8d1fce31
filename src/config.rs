//! Station configuration file
//!
//! A plain text file of `KEY VALUE` lines. Blank lines and lines starting
//! with `#` or `*` are ignored. Bad values never stop the station: they are
//! clamped or replaced by defaults with a warning. Only failing to read the
//! file at all is an error.
//!
//! ```text
//! # two receivers, the second with a fixed gain
//! DONGLE 00000001
//! DONGLE 00000002 38.6
//! DATA_DIR /data/ozone
//! STATION 3
//! STATION_NAME Onsala
//! WATCHDOG_TIMEOUT 300
//! KEEP_CAL_ON 0
//! LINE_FREQ 1322454500
//! FFT_WINDOW 0
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    DEFAULT_LINE_FREQ, MAX_CHANNELS, MAX_SN_LEN,
};

pub const DEFAULT_CONFIG_FILE: &str = "ozonespec.conf";
pub const DEFAULT_WATCHDOG_TIMEOUT: u64 = 300;
/// Shortest watchdog window accepted; one cycle takes over a minute
pub const MIN_WATCHDOG_TIMEOUT: u64 = 120;

#[derive(Clone, Debug, PartialEq)]
pub struct DongleConfig {
    pub serial: String,
    /// Manual gain in dB; `None` selects automatic gain
    pub gain: Option<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub dongles: Vec<DongleConfig>,
    pub data_dir: PathBuf,
    pub station_number: i32,
    pub station_name: String,
    pub watchdog_timeout: u64,
    pub keep_cal_on: bool,
    pub line_freq: f64,
    pub fft_window: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dongles: Vec::new(),
            data_dir: PathBuf::from("."),
            station_number: 0,
            station_name: String::new(),
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            keep_cal_on: false,
            line_freq: DEFAULT_LINE_FREQ,
            fft_window: false,
        }
    }
}

fn parse_flag(key: &str, val: &str, default: bool) -> bool {
    match val {
        "0" => false,
        "1" => true,
        _ => {
            warn!("{} must be 0 or 1, got {:?}; using {}", key, val, default as u8);
            default
        }
    }
}

fn truncate_field(key: &str, val: &str) -> String {
    if val.len() <= MAX_SN_LEN {
        return val.to_owned();
    }
    let mut end = MAX_SN_LEN;
    while !val.is_char_boundary(end) {
        end -= 1;
    }
    warn!("{} {:?} longer than {} bytes, truncated", key, val, MAX_SN_LEN);
    val[..end].to_owned()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Cannot open {}: {}", path.display(), e)))?;
        let config = Self::parse(&text);
        for (k, d) in config.dongles.iter().enumerate() {
            info!("Channel {}: {}", k, d.serial);
        }
        Ok(config)
    }

    /// Parse configuration text; never fails, see module docs
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') || line.starts_with('*') {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (line, ""),
            };
            if rest.is_empty() {
                warn!("Format error on line {}: {:?} has no value", lineno + 1, key);
                continue;
            }
            config.apply(key, rest);
        }
        config
    }

    fn apply(&mut self, key: &str, val: &str) {
        match key {
            "DONGLE" => self.add_dongle(val),
            "DATA_DIR" => self.data_dir = PathBuf::from(val),
            "STATION" => match val.parse::<i32>() {
                Ok(n) if n >= 0 => self.station_number = n,
                _ => warn!("Invalid station number {:?}, using {}", val, self.station_number),
            },
            "STATION_NAME" => self.station_name = truncate_field(key, val),
            "WATCHDOG_TIMEOUT" => match val.parse::<u64>() {
                Ok(t) if t < MIN_WATCHDOG_TIMEOUT => {
                    warn!(
                        "Watchdog timeout {} s too short, using {} s",
                        t, MIN_WATCHDOG_TIMEOUT
                    );
                    self.watchdog_timeout = MIN_WATCHDOG_TIMEOUT;
                }
                Ok(t) => self.watchdog_timeout = t,
                Err(_) => warn!(
                    "Invalid watchdog timeout {:?}, using {} s",
                    val, self.watchdog_timeout
                ),
            },
            "KEEP_CAL_ON" => self.keep_cal_on = parse_flag(key, val, self.keep_cal_on),
            "LINE_FREQ" => match val.parse::<f64>() {
                Ok(f) if f.is_finite() && f > 0.0 => self.line_freq = f,
                _ => warn!("Invalid line frequency {:?}, using {} Hz", val, self.line_freq),
            },
            "FFT_WINDOW" => self.fft_window = parse_flag(key, val, self.fft_window),
            _ => warn!("Unknown configuration key {:?} ignored", key),
        }
    }

    fn add_dongle(&mut self, val: &str) {
        let mut fields = val.split_whitespace();
        let Some(serial) = fields.next() else {
            return;
        };
        if self.dongles.len() >= MAX_CHANNELS {
            warn!("Too many channels defined! Ignoring dongle {}", serial);
            return;
        }
        let serial = truncate_field("DONGLE", serial);
        if self.dongles.iter().any(|d| d.serial == serial) {
            warn!("Dongle {} defined twice, ignoring the duplicate", serial);
            return;
        }
        let gain = match fields.next().map(str::parse::<f32>) {
            None => None,
            Some(Ok(g)) if g.is_finite() && g != 0.0 => Some(g),
            Some(Ok(_)) => None,
            Some(Err(_)) => {
                warn!("Invalid gain for dongle {}, using automatic gain", serial);
                None
            }
        };
        if fields.next().is_some() {
            warn!("Extra fields after dongle {} ignored", serial);
        }
        self.dongles.push(DongleConfig { serial, gain });
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config() {
        let text = "\
# comment
* also a comment

DONGLE 00000001
DONGLE 00000002 38.6
DATA_DIR /data/ozone
STATION 3
STATION_NAME Onsala Space Obs
WATCHDOG_TIMEOUT 600
KEEP_CAL_ON 1
LINE_FREQ 1322754500
FFT_WINDOW 1
";
        let c = Config::parse(text);
        assert_eq!(
            c.dongles,
            vec![
                DongleConfig {
                    serial: "00000001".into(),
                    gain: None
                },
                DongleConfig {
                    serial: "00000002".into(),
                    gain: Some(38.6)
                },
            ]
        );
        assert_eq!(c.data_dir, PathBuf::from("/data/ozone"));
        assert_eq!(c.station_number, 3);
        assert_eq!(c.station_name, "Onsala Space Obs");
        assert_eq!(c.watchdog(), Duration::from_secs(600));
        assert!(c.keep_cal_on);
        assert_eq!(c.line_freq, 1322754500.0);
        assert!(c.fft_window);
    }

    #[test]
    fn test_defaults() {
        let c = Config::parse("");
        assert_eq!(c, Config::default());
        assert_eq!(c.line_freq, DEFAULT_LINE_FREQ);
    }

    #[test]
    fn test_clamping() {
        let c = Config::parse(
            "WATCHDOG_TIMEOUT 5\nLINE_FREQ banana\nSTATION -2\nKEEP_CAL_ON yes\nLINE_FREQ -1\n",
        );
        assert_eq!(c.watchdog_timeout, MIN_WATCHDOG_TIMEOUT);
        assert_eq!(c.line_freq, DEFAULT_LINE_FREQ);
        assert_eq!(c.station_number, 0);
        assert!(!c.keep_cal_on);
    }

    #[test]
    fn test_channel_limits() {
        let mut text = String::new();
        for k in 0..10 {
            text.push_str(&format!("DONGLE {:08}\n", k));
        }
        text.push_str("DONGLE 00000001\n");
        let c = Config::parse(&text);
        assert_eq!(c.dongles.len(), MAX_CHANNELS);
    }

    #[test]
    fn test_duplicates_and_bad_gain() {
        let c = Config::parse("DONGLE A1 loud\nDONGLE A1 20\nDONGLE B2 0\n");
        assert_eq!(c.dongles.len(), 2);
        assert_eq!(c.dongles[0].gain, None);
        assert_eq!(c.dongles[1].gain, None);
    }

    #[test]
    fn test_long_fields_truncated() {
        let c = Config::parse("DONGLE 0123456789abcdefXYZ\nSTATION_NAME a-very-long-station-name\n");
        assert_eq!(c.dongles[0].serial, "0123456789abcdef");
        assert_eq!(c.station_name.len(), MAX_SN_LEN);
    }

    #[test]
    fn test_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "DONGLE 42").unwrap();
        let c = Config::from_file(f.path()).unwrap();
        assert_eq!(c.dongles.len(), 1);
        assert!(Config::from_file("/nonexistent/ozonespec.conf").is_err());
    }
}
