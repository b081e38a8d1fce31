//! In this module, we implement the signal level monitoring for the receivers.
//! The recorder tracks the peak excursion of the raw samples every cycle so
//! clipping (gain set too high) shows up in the log and in the output record,
//! and the gain check tool reports RMS amplitude.

use tracing::warn;

use crate::{dongle::Dongle, MID_SCALE};

/// How many leading bytes of each signal block are scanned for the peak
pub const PEAK_SCAN_BYTES: usize = 65536;

/// Largest |v - mid-scale| over the first `min(len, PEAK_SCAN_BYTES)` bytes
pub fn peak_excursion(samples: &[u8]) -> i32 {
    let n = samples.len().min(PEAK_SCAN_BYTES);
    samples[..n]
        .iter()
        .map(|&v| (v as i32 - MID_SCALE as i32).abs())
        .max()
        .unwrap_or(0)
}

/// RMS amplitude (in ADC counts) of interleaved I/Q bytes
pub fn rms_amplitude(samples: &[u8]) -> f32 {
    let pairs = samples.len() / 2;
    if pairs == 0 {
        return 0.0;
    }
    let power: f32 = samples
        .iter()
        .map(|&v| {
            let x = v as f32 - MID_SCALE as f32;
            x * x
        })
        .sum();
    (power / pairs as f32).sqrt()
}

/// Amplitude relative to full scale
pub fn dbfs(rms: f32) -> f32 {
    20.0 * (rms / MID_SCALE as f32).log10()
}

/// One gain check reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    pub rms: f32,
    pub dbfs: f32,
    pub peak: i32,
}

/// Read one block from `dongle` into `buf` and measure it. Receiver errors
/// and short reads are logged; `None` means nothing was delivered.
pub fn measure_level<D: Dongle>(dongle: &mut D, buf: &mut [u8]) -> Option<LevelReading> {
    let n = match dongle.read_block(buf) {
        Ok(n) => n.min(buf.len()),
        Err(e) => {
            warn!("Read failed: {}", e);
            return None;
        }
    };
    if n < buf.len() {
        warn!("Short read ({} bytes)", n);
    }
    if n == 0 {
        return None;
    }
    let rms = rms_amplitude(&buf[..n]);
    Some(LevelReading {
        rms,
        dbfs: dbfs(rms),
        peak: peak_excursion(&buf[..n]),
    })
}

/// Peak signal level seen over one cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct PeakLevel(i32);

impl PeakLevel {
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub fn observe(&mut self, samples: &[u8]) {
        self.0 = self.0.max(peak_excursion(samples));
    }

    pub fn get(&self) -> i32 {
        self.0
    }

    /// Warn if the ADC hit full scale this cycle
    pub fn check_clipping(&self, channel: usize) {
        if self.0 >= MID_SCALE as i32 {
            warn!(channel, level = self.0, "Signal clipping, reduce dongle gain");
        }
    }
}
