//! The F-engine: turns raw interleaved I/Q bytes into accumulated power spectra
//!
//! Each signal block is cut into whole FFT windows of `FFT_LEN` complex
//! samples. Every window is transformed and its squared magnitudes summed
//! into one spectrum, so the spectrum of a block is a sum (not an average)
//! over the windows it contained. Any partial trailing window is dropped.

use std::{f32::consts::PI, sync::Arc};

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::{debug, warn};

use crate::{
    error::Result,
    queue::{Consumer, Producer},
    sample_to_f32, MID_SCALE,
};

/// Number of whole FFT windows contained in `sig_len` interleaved bytes
pub fn window_count(sig_len: usize, fft_len: usize) -> usize {
    sig_len / 2 / fft_len
}

/// Fixed window function applied sample-wise before the transform
pub fn fft_window(len: usize) -> Vec<f32> {
    let mid = (len as f32 - 1.0) / 2.0;
    (0..len)
        .map(|n| {
            let t = 2.0 * PI * (n as f32 - mid) / len as f32;
            1.0 + 2.0 * (5.0f32 / 9.0).sqrt() * t.cos()
        })
        .collect()
}

pub struct SpectrumEngine {
    fft_len: usize,
    fft: Arc<dyn Fft<f32>>,
    buf: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumEngine {
    pub fn new(fft_len: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_len);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Self {
            fft_len,
            fft,
            buf: vec![Complex::default(); fft_len],
            scratch,
        }
    }

    pub fn fft_len(&self) -> usize {
        self.fft_len
    }

    /// Compute the summed power spectrum of `signal` into `spectrum` and
    /// return the number of FFT windows it consumed.
    pub fn calc_spectrum(
        &mut self,
        signal: &[u8],
        window: Option<&[f32]>,
        spectrum: &mut [f32],
    ) -> usize {
        let n = self.fft_len;
        assert_eq!(spectrum.len(), n, "spectrum must be one FFT long");
        if let Some(w) = window {
            assert_eq!(w.len(), n, "window must be one FFT long");
        }
        if signal.len() % (2 * n) != 0 {
            warn!(
                len = signal.len(),
                fft_len = n,
                "Signal length not divisible by FFT length"
            );
        }
        let nspec = window_count(signal.len(), n);
        spectrum.fill(0.0);
        for chunk in signal.chunks_exact(2 * n).take(nspec) {
            // Convert format into the FFT buffer
            for (k, (iq, c)) in chunk.chunks_exact(2).zip(self.buf.iter_mut()).enumerate() {
                let w = window.map_or(1.0, |w| w[k]);
                *c = Complex::new(w * sample_to_f32(iq[0]), w * sample_to_f32(iq[1]));
            }
            self.fft
                .process_with_scratch(&mut self.buf, &mut self.scratch);
            for (acc, c) in spectrum.iter_mut().zip(&self.buf) {
                *acc += c.norm_sqr();
            }
        }
        nspec
    }
}

/// One raw capture: interleaved offset-binary I/Q bytes and how many of them are valid
#[derive(Clone, Debug)]
pub struct SampleBlock {
    pub data: Vec<u8>,
    pub len: usize,
}

impl SampleBlock {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![MID_SCALE; capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The bytes the receiver actually delivered
    pub fn valid(&self) -> &[u8] {
        &self.data[..self.len.min(self.data.len())]
    }

    /// Reset to zero signal
    pub fn clear(&mut self) {
        self.data.fill(MID_SCALE);
        self.len = 0;
    }
}

/// An accumulated power spectrum and the number of FFT windows summed into it
#[derive(Clone, Debug)]
pub struct PowerSpectrum {
    pub bins: Vec<f32>,
    pub windows: usize,
}

impl PowerSpectrum {
    pub fn new(fft_len: usize) -> Self {
        Self {
            bins: vec![0.0; fft_len],
            windows: 0,
        }
    }
}

/// Drains sample blocks, publishing one power spectrum per block
pub struct ComputationWorker {
    channel: usize,
    engine: SpectrumEngine,
    window: Option<Arc<[f32]>>,
    input: Consumer<SampleBlock>,
    output: Producer<PowerSpectrum>,
}

impl ComputationWorker {
    pub fn new(
        channel: usize,
        fft_len: usize,
        window: Option<Arc<[f32]>>,
        input: Consumer<SampleBlock>,
        output: Producer<PowerSpectrum>,
    ) -> Self {
        Self {
            channel,
            engine: SpectrumEngine::new(fft_len),
            window,
            input,
            output,
        }
    }

    /// Process exactly one block, returning the number of windows it held
    pub fn step(&mut self) -> Result<usize> {
        let Self {
            engine,
            window,
            input,
            output,
            ..
        } = self;
        input.pop_with(|block| {
            output.push_with(|spectrum| {
                spectrum.windows =
                    engine.calc_spectrum(block.valid(), window.as_deref(), &mut spectrum.bins);
                spectrum.windows
            })
        })?
    }

    /// Run until the queue is shut down or the recorder goes away
    pub fn run(mut self) {
        debug!(channel = self.channel, "Computation worker alive");
        loop {
            match self.step() {
                Ok(windows) => debug!(channel = self.channel, windows, "Computed spectrum"),
                Err(e) => {
                    debug!(channel = self.channel, "Computation worker exiting: {}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::slot_queue, shutdown::Shutdown};

    const N: usize = 64;

    #[test]
    fn test_window_count() {
        assert_eq!(window_count(0, N), 0);
        assert_eq!(window_count(2 * N * 3, N), 3);
        assert_eq!(window_count(2 * N * 3 + 5, N), 3);
        assert_eq!(window_count(2 * N - 1, N), 0);
    }

    #[test]
    fn test_consumes_whole_windows_only() {
        let mut engine = SpectrumEngine::new(N);
        let mut spec = vec![0f32; N];
        // A trailing partial window of loud samples must not contribute
        let mut signal = vec![MID_SCALE; 2 * N * 2];
        signal.extend(std::iter::repeat(250).take(2 * N - 2));
        assert_eq!(engine.calc_spectrum(&signal, None, &mut spec), 2);
        assert!(spec.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_mid_scale_is_silent() {
        let mut engine = SpectrumEngine::new(N);
        let mut spec = vec![1f32; N];
        let signal = vec![MID_SCALE; 2 * N];
        assert_eq!(engine.calc_spectrum(&signal, None, &mut spec), 1);
        assert!(spec.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_dc_offset_lands_in_bin_zero() {
        let mut engine = SpectrumEngine::new(N);
        let mut spec = vec![0f32; N];
        let signal = vec![MID_SCALE + 10; 2 * N];
        engine.calc_spectrum(&signal, None, &mut spec);
        let a = 10.0 / 127.0 * N as f32;
        // |a + ja|^2
        let expected = 2.0 * a * a;
        assert!((spec[0] - expected).abs() / expected < 1e-4);
        assert!(spec[1..].iter().all(|&p| p < expected * 1e-6));
    }

    #[test]
    fn test_tone_bin() {
        let mut engine = SpectrumEngine::new(N);
        let mut spec = vec![0f32; N];
        let bin = 5;
        let signal: Vec<u8> = (0..N)
            .flat_map(|k| {
                let ph = 2.0 * PI * (bin * k) as f32 / N as f32;
                [
                    (127.0 + 100.0 * ph.cos()).round() as u8,
                    (127.0 + 100.0 * ph.sin()).round() as u8,
                ]
            })
            .collect();
        engine.calc_spectrum(&signal, None, &mut spec);
        let peak = spec
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(peak, bin);
    }

    #[test]
    fn test_window_shape() {
        let w = fft_window(N);
        assert_eq!(w.len(), N);
        // Peaks in the middle, symmetric about (N-1)/2
        let peak = 1.0 + 2.0 * (5.0f32 / 9.0).sqrt();
        assert!(w.iter().all(|&x| x <= peak + 1e-5));
        for k in 0..N {
            assert!((w[k] - w[N - 1 - k]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_worker_step_publishes_spectrum() {
        let shutdown = Shutdown::new();
        let (mut blocks_tx, blocks_rx) = slot_queue(vec![SampleBlock::new(4 * N); 2], shutdown.clone());
        let (spec_tx, mut spec_rx) = slot_queue(vec![PowerSpectrum::new(N); 2], shutdown);
        let mut worker = ComputationWorker::new(0, N, None, blocks_rx, spec_tx);
        blocks_tx
            .push_with(|b| {
                b.clear();
                b.len = 3 * N;
            })
            .unwrap();
        assert_eq!(worker.step().unwrap(), 1);
        let out = spec_rx.pop().unwrap();
        assert_eq!(out.windows, 1);
        assert!(out.bins.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_worker_exits_when_recorder_drops() {
        let shutdown = Shutdown::new();
        let (blocks_tx, blocks_rx) = slot_queue(vec![SampleBlock::new(2 * N)], shutdown.clone());
        let (spec_tx, _spec_rx) = slot_queue(vec![PowerSpectrum::new(N)], shutdown);
        let worker = ComputationWorker::new(0, N, None, blocks_rx, spec_tx);
        drop(blocks_tx);
        // Returns instead of blocking forever
        worker.run();
    }
}
