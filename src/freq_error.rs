//! Tuner frequency error from the calibration tone
//!
//! The strongest FFT bin of the calibration spectrum is refined with a
//! parabola through it and its two (wrapping) neighbours, which resolves
//! the tone to a fraction of a bin.

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Signed bin index of FFT bin `m` (upper half maps to negative frequencies)
pub fn signed_bin(m: usize, n: usize) -> isize {
    if m >= n / 2 {
        m as isize - n as isize
    } else {
        m as isize
    }
}

/// Sub-bin offset of the peak at `m`, in bins
pub fn parabolic_offset(spectrum: &[f32], m: usize) -> Result<f64> {
    let n = spectrum.len();
    let prev = spectrum[(m + n - 1) % n] as f64;
    let peak = spectrum[m] as f64;
    let next = spectrum[(m + 1) % n] as f64;
    let denom = prev - 2.0 * peak + next;
    if denom == 0.0 || !denom.is_finite() {
        return Err(Error::DegenerateSpectrum);
    }
    Ok(0.5 * (prev - next) / denom)
}

/// Estimate how far the receiver's actual frequency sits from where it was tuned.
///
/// `tuned_freq` is the frequency the receiver was set to while recording the
/// calibration spectrum, `cal_freq` the true calibrator frequency. The result
/// is in Hz and is added to every subsequent tuning request.
pub fn find_freq_error(
    cal_spectrum: &[f32],
    sample_rate: f64,
    tuned_freq: f64,
    cal_freq: f64,
) -> Result<f64> {
    let n = cal_spectrum.len();
    if n < 3 {
        return Err(Error::DegenerateSpectrum);
    }
    // First strictly greater bin wins, so an all-zero spectrum stays at 0
    let mut max_idx = 0;
    let mut max_pow = 0f32;
    for (k, &p) in cal_spectrum.iter().enumerate() {
        if p > max_pow {
            max_pow = p;
            max_idx = k;
        }
    }
    if max_pow <= 0.0 {
        return Err(Error::DegenerateSpectrum);
    }
    let delta = parabolic_offset(cal_spectrum, max_idx)?;
    debug!(bin = max_idx, delta, "Calibration peak");

    let bins = signed_bin(max_idx, n) as f64 + delta;
    let err = bins * sample_rate / n as f64 + tuned_freq - cal_freq;
    info!("Frequency error {:.0} Hz (f_interp = {:.2})", err, delta);
    Ok(err)
}
