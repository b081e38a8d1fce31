pub mod args;
pub mod calibrator;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod dongle;
pub mod error;
pub mod exfil;
pub mod f_engine;
pub mod freq_error;
pub mod integration;
pub mod monitoring;
pub mod queue;
pub mod shutdown;
pub mod watchdog;

// Receiver sampling, fixed by the dongle setup
pub const SAMPLE_RATE: u32 = 1_800_000;
pub const FFT_LEN: usize = 768;

/// Actual calibrator frequency (Hz); the receiver is tuned exactly here for calibration
pub const CAL_FREQ: f64 = 1_320_000_000.0;
/// Nominal line frequency (Hz) when the configuration doesn't override it
pub const DEFAULT_LINE_FREQ: f64 = 1_322_454_500.0;

/// Bytes per synchronous receiver read
pub const READ_SIZE: usize = 16384 * 256;
/// Reads concatenated into one signal block
pub const BLOCKS_PER_SPECTRUM: usize = 4;
/// Spectra per band per cycle (K)
pub const SPECTRA_PER_BAND: usize = 8;
/// Depth of the sample block queue
pub const SAMPLE_QUEUE_LEN: usize = 3;

pub const MAX_CHANNELS: usize = 8;
/// Width of the fixed serial number and station name fields
pub const MAX_SN_LEN: usize = 16;

/// Byte value of a zero-amplitude sample
pub const MID_SCALE: u8 = 127;

/// Convert an offset 8-bit sample into a float with full-scale = 1
pub fn sample_to_f32(v: u8) -> f32 {
    (v as f32 - MID_SCALE as f32) / MID_SCALE as f32
}

/// Element-wise accumulate `a` into `b`
pub fn vsum_mut(a: &[f32], b: &mut [f32]) {
    assert_eq!(a.len(), b.len());
    for (x, acc) in a.iter().zip(b.iter_mut()) {
        *acc += x;
    }
}

/// Copy `s` into a zero-padded fixed-width byte field, truncating if needed
pub fn fixed_field<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = s.len().min(N);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}
