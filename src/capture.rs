//! This module contains all the capture logic
//!
//! One [`RecorderWorker`] runs per receiver channel. It owns its dongle and
//! a private F-engine thread, and walks through the calibration cycle in
//! lock-step with the other channels:
//!
//! 1. wait for the calibrator to come on
//! 2. record one calibration block directly (no queue, it is a single shot)
//! 3. compute the calibration spectrum and this cycle's frequency error
//! 4. record `2K` signal blocks alternately above and below the line, each
//!    pushed into the sample queue for the F-engine
//! 5. pull the `2K` spectra back and integrate them per band
//! 6. normalize, append the record to the day file, and meet the others
//!
//! Receiver errors never abort a cycle. They are logged and the cycle goes
//! on with whatever the dongle delivered; missing samples read as zero
//! signal because every buffer is cleared to mid-scale before reading.

use std::{
    io,
    sync::{Arc, PoisonError},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    coordinator::{CalibrationCoordinator, Phase},
    dongle::Dongle,
    error::Result,
    exfil::{CycleRecord, SharedWriter},
    f_engine::{ComputationWorker, PowerSpectrum, SampleBlock, SpectrumEngine},
    freq_error::find_freq_error,
    integration::{Band, Integration},
    monitoring::PeakLevel,
    queue::{slot_queue, Consumer, Producer},
    BLOCKS_PER_SPECTRUM, CAL_FREQ, DEFAULT_LINE_FREQ, FFT_LEN, MID_SCALE, READ_SIZE,
    SAMPLE_QUEUE_LEN, SAMPLE_RATE, SPECTRA_PER_BAND,
};

/// Acquisition geometry and frequencies of one channel
#[derive(Clone, Debug, PartialEq)]
pub struct Acquisition {
    pub sample_rate: u32,
    pub fft_len: usize,
    /// Bytes per receiver read
    pub read_size: usize,
    /// Reads concatenated into one signal block
    pub reads_per_block: usize,
    /// Signal blocks per band per cycle (K)
    pub spectra_per_band: usize,
    /// Depth of the sample queue
    pub queue_len: usize,
    pub cal_freq: f64,
    pub line_freq: f64,
}

impl Default for Acquisition {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            fft_len: FFT_LEN,
            read_size: READ_SIZE,
            reads_per_block: BLOCKS_PER_SPECTRUM,
            spectra_per_band: SPECTRA_PER_BAND,
            queue_len: SAMPLE_QUEUE_LEN,
            cal_freq: CAL_FREQ,
            line_freq: DEFAULT_LINE_FREQ,
        }
    }
}

impl Acquisition {
    pub fn block_size(&self) -> usize {
        self.read_size * self.reads_per_block
    }

    /// Signal blocks per cycle, both bands
    pub fn blocks_per_cycle(&self) -> usize {
        2 * self.spectra_per_band
    }

    /// Receiver frequency for one band: a quarter of the sample rate either
    /// side of the line, shifted by the measured tuner error
    pub fn band_freq(&self, band: Band, freq_err: f64) -> u32 {
        let offset = (self.sample_rate / 4) as f64;
        let freq = match band {
            Band::Above => self.line_freq + offset + freq_err,
            Band::Below => self.line_freq - offset + freq_err,
        };
        freq as u32
    }
}

pub struct RecorderWorker<D: Dongle> {
    channel: usize,
    dongle: D,
    params: Acquisition,
    window: Option<Arc<[f32]>>,
    coordinator: Arc<CalibrationCoordinator>,
    writer: SharedWriter,
    engine: SpectrumEngine,
    cal_block: Vec<u8>,
    cal_spectrum: Vec<f32>,
    integration: Integration,
    peak: PeakLevel,
}

impl<D: Dongle + 'static> RecorderWorker<D> {
    pub fn new(
        channel: usize,
        dongle: D,
        params: Acquisition,
        coordinator: Arc<CalibrationCoordinator>,
        writer: SharedWriter,
    ) -> Self {
        Self {
            channel,
            engine: SpectrumEngine::new(params.fft_len),
            cal_block: vec![MID_SCALE; params.read_size],
            cal_spectrum: vec![0.0; params.fft_len],
            integration: Integration::new(params.fft_len),
            peak: PeakLevel::default(),
            dongle,
            params,
            window: None,
            coordinator,
            writer,
        }
    }

    /// Window the signal spectra (the calibration spectrum never is)
    pub fn with_window(mut self, window: Arc<[f32]>) -> Self {
        assert_eq!(window.len(), self.params.fft_len);
        self.window = Some(window);
        self
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Run on a dedicated thread
    pub fn spawn(self) -> io::Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name(format!("rec-{}", self.channel))
            .spawn(move || self.run())
    }

    /// Start the F-engine thread and cycle until shutdown
    pub fn run(mut self) -> Result<()> {
        info!(channel = self.channel, serial = self.dongle.serial(), "Recorder started");
        let shutdown = self.coordinator.shutdown().clone();
        let (mut blocks, block_rx) = slot_queue(
            vec![SampleBlock::new(self.params.block_size()); self.params.queue_len],
            shutdown.clone(),
        );
        // Every block of a cycle is pushed before any result is pulled, so
        // the result ring must hold a whole cycle
        let (spec_tx, mut spectra) = slot_queue(
            vec![PowerSpectrum::new(self.params.fft_len); self.params.blocks_per_cycle()],
            shutdown,
        );
        let worker = ComputationWorker::new(
            self.channel,
            self.params.fft_len,
            self.window.clone(),
            block_rx,
            spec_tx,
        );
        let comp = thread::Builder::new()
            .name(format!("comp-{}", self.channel))
            .spawn(move || worker.run())?;

        let err = loop {
            if let Err(e) = self.run_cycle(&mut blocks, &mut spectra) {
                break e;
            }
        };
        drop(blocks);
        drop(spectra);
        if comp.join().is_err() {
            error!(channel = self.channel, "Computation thread panicked");
        }
        if err.is_shutdown() {
            info!(channel = self.channel, "Recorder stopped");
            Ok(())
        } else {
            error!(channel = self.channel, "Recorder failed: {}", err);
            Err(err)
        }
    }

    /// One calibration cycle. Only a cancelled wait or a lost F-engine
    /// returns an error.
    pub fn run_cycle(
        &mut self,
        blocks: &mut Producer<SampleBlock>,
        spectra: &mut Consumer<PowerSpectrum>,
    ) -> Result<()> {
        self.coordinator.wait(Phase::CalibratorOn)?;
        let timestamp = self.coordinator.cycle_start();
        self.integration.reset();
        self.peak.reset();

        self.record_calibration();
        self.coordinator.wait(Phase::CalibrationRecorded)?;

        let freq_err = self.analyze_calibration();
        self.coordinator.wait(Phase::CalibratorOff)?;

        self.record_signal(blocks, freq_err.unwrap_or(0.0))?;
        self.drain_spectra(spectra)?;
        self.write_record(timestamp, freq_err);

        self.coordinator.wait(Phase::SignalRecorded)?;
        Ok(())
    }

    /// Tune the receiver, returning the frequency it reports
    fn tune(&mut self, freq: u32) -> Option<u32> {
        match self.dongle.set_frequency(freq) {
            Ok(actual) => {
                if actual != freq {
                    warn!(
                        channel = self.channel,
                        "Tuned to {} Hz (wanted {} Hz)", actual, freq
                    );
                } else {
                    debug!(channel = self.channel, "Tuned to {} Hz", actual);
                }
                Some(actual)
            }
            Err(e) => {
                warn!(channel = self.channel, "Failed to tune to {} Hz: {}", freq, e);
                None
            }
        }
    }

    fn reset_buffer(&mut self) {
        if let Err(e) = self.dongle.reset_buffer() {
            warn!(channel = self.channel, "{}", e);
        }
    }

    /// Read up to `buf.len()` bytes, logging short or failed reads
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let wanted = buf.len();
        let n = match self.dongle.read_block(buf) {
            Ok(n) => n.min(wanted),
            Err(e) => {
                warn!(channel = self.channel, "Receiver read failed: {}", e);
                0
            }
        };
        if n != wanted {
            warn!(channel = self.channel, "Received wrong number of samples ({})", n);
        }
        n
    }

    fn record_calibration(&mut self) {
        self.tune(self.params.cal_freq as u32);
        self.cal_block.fill(MID_SCALE);
        self.reset_buffer();
        let mut buf = std::mem::take(&mut self.cal_block);
        self.read(&mut buf);
        self.cal_block = buf;
    }

    /// This cycle's frequency error, `None` if the calibration tone was not found
    fn analyze_calibration(&mut self) -> Option<f64> {
        self.engine
            .calc_spectrum(&self.cal_block, None, &mut self.cal_spectrum);
        match find_freq_error(
            &self.cal_spectrum,
            self.params.sample_rate as f64,
            self.params.cal_freq,
            self.params.cal_freq,
        ) {
            Ok(err) => Some(err),
            Err(e) => {
                warn!(channel = self.channel, "{}, recording without correction", e);
                None
            }
        }
    }

    /// Fill one queue slot with `reads_per_block` back-to-back reads
    fn fill_block(&mut self, block: &mut SampleBlock) {
        block.clear();
        let read_size = self.params.read_size;
        let mut idx = 0;
        for _ in 0..self.params.reads_per_block {
            let end = (idx + read_size).min(block.capacity());
            let mut n = self.read(&mut block.data[idx..end]);
            if n % 2 != 0 {
                warn!(channel = self.channel, "Odd number of samples received!");
                // Keep I/Q pairs aligned
                n += 1;
            }
            idx = (idx + n).min(block.capacity());
        }
        block.len = idx;
        self.peak.observe(block.valid());
    }

    fn record_signal(&mut self, blocks: &mut Producer<SampleBlock>, freq_err: f64) -> Result<()> {
        for i in 0..self.params.blocks_per_cycle() {
            let band = Band::of_iteration(i);
            let freq = self.params.band_freq(band, freq_err);
            debug!(channel = self.channel, "Recording signal {} ({:?})", i, band);
            blocks.push_with(|block| {
                self.tune(freq);
                self.reset_buffer();
                self.fill_block(block);
            })?;
        }
        Ok(())
    }

    fn drain_spectra(&mut self, spectra: &mut Consumer<PowerSpectrum>) -> Result<()> {
        for i in 0..self.params.blocks_per_cycle() {
            let band = Band::of_iteration(i);
            let integration = &mut self.integration;
            spectra.pop_with(|s| integration.add(band, s.windows, &s.bins))?;
        }
        Ok(())
    }

    fn write_record(&mut self, timestamp: DateTime<Utc>, freq_err: Option<f64>) {
        let [above, below] = self.integration.finalize();
        let level = self.peak.get();
        self.peak.check_clipping(self.channel);
        info!(
            channel = self.channel,
            above = above.count,
            below = below.count,
            "Max signal level {}",
            level
        );
        let record = CycleRecord {
            channel: self.channel,
            timestamp,
            freq_err: freq_err.unwrap_or(f64::NAN),
            band_counts: [above.count, below.count],
            sample_rate: self.params.sample_rate,
            line_freq: self.params.line_freq,
            serial: self.dongle.serial(),
            max_sig_level: level,
            cal_spectrum: &self.cal_spectrum,
            signal_spectra: [&above.spectrum, &below.spectrum],
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write(&record) {
            error!(channel = self.channel, "Record lost: {}", e);
        }
    }
}
