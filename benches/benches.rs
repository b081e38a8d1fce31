use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ozonespec::{
    f_engine::{fft_window, SpectrumEngine},
    freq_error::find_freq_error,
    monitoring::{peak_excursion, PEAK_SCAN_BYTES},
    CAL_FREQ, FFT_LEN, SAMPLE_RATE,
};
use rand::prelude::*;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    // One receiver read worth of noise would take too long per iteration,
    // 64 FFT windows is plenty
    let mut dummy_samples = vec![0u8; 2 * FFT_LEN * 64];
    rng.fill(&mut dummy_samples[..]);

    // Containers
    let mut engine = SpectrumEngine::new(FFT_LEN);
    let window = fft_window(FFT_LEN);
    let mut spectrum = vec![0f32; FFT_LEN];

    c.bench_function("power spectrum", |b| {
        b.iter(|| {
            engine.calc_spectrum(
                black_box(&dummy_samples),
                black_box(None),
                black_box(&mut spectrum),
            )
        })
    });

    c.bench_function("windowed power spectrum", |b| {
        b.iter(|| {
            engine.calc_spectrum(
                black_box(&dummy_samples),
                black_box(Some(window.as_slice())),
                black_box(&mut spectrum),
            )
        })
    });

    let mut cal_spectrum: Vec<f32> = (0..FFT_LEN).map(|_| rng.gen::<f32>()).collect();
    cal_spectrum[100] = 1000.0;
    c.bench_function("frequency error", |b| {
        b.iter(|| {
            find_freq_error(
                black_box(&cal_spectrum),
                SAMPLE_RATE as f64,
                CAL_FREQ,
                CAL_FREQ,
            )
        })
    });

    c.bench_function("peak excursion", |b| {
        b.iter(|| peak_excursion(black_box(&dummy_samples[..PEAK_SCAN_BYTES])))
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
