//! Per-cycle accumulation of the above-line and below-line spectra

use tracing::warn;

use crate::vsum_mut;

/// Which side of the line frequency a spectrum was recorded on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    Above = 0,
    Below = 1,
}

impl Band {
    /// Even signal iterations are recorded above the line, odd ones below
    pub fn of_iteration(i: usize) -> Self {
        if i % 2 == 0 {
            Band::Above
        } else {
            Band::Below
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Running sums of both bands plus the number of FFT windows merged into each
#[derive(Clone, Debug)]
pub struct Integration {
    fft_len: usize,
    sums: [Vec<f32>; 2],
    counts: [usize; 2],
}

/// A normalized band; `count == 0` means no valid data this cycle and the
/// spectrum is all zeros
#[derive(Clone, Debug, PartialEq)]
pub struct BandSpectrum {
    pub count: usize,
    pub spectrum: Vec<f32>,
}

impl BandSpectrum {
    pub fn is_valid(&self) -> bool {
        self.count > 0
    }
}

impl Integration {
    pub fn new(fft_len: usize) -> Self {
        Self {
            fft_len,
            sums: [vec![0.0; fft_len], vec![0.0; fft_len]],
            counts: [0; 2],
        }
    }

    pub fn reset(&mut self) {
        self.sums.iter_mut().for_each(|s| s.fill(0.0));
        self.counts = [0; 2];
    }

    pub fn add(&mut self, band: Band, windows: usize, spectrum: &[f32]) {
        vsum_mut(spectrum, &mut self.sums[band.index()]);
        self.counts[band.index()] += windows;
    }

    pub fn counts(&self) -> [usize; 2] {
        self.counts
    }

    /// Divide every bin by `count × N²`, the scale of an unnormalized FFT
    /// summed over `count` windows
    pub fn finalize(&self) -> [BandSpectrum; 2] {
        let n2 = (self.fft_len as f32) * (self.fft_len as f32);
        let norm = |band: Band| {
            let count = self.counts[band.index()];
            if count == 0 {
                warn!(?band, "No spectra integrated, band flagged invalid");
                return BandSpectrum {
                    count: 0,
                    spectrum: vec![0.0; self.fft_len],
                };
            }
            let scale = count as f32 * n2;
            BandSpectrum {
                count,
                spectrum: self.sums[band.index()].iter().map(|x| x / scale).collect(),
            }
        };
        [norm(Band::Above), norm(Band::Below)]
    }
}
