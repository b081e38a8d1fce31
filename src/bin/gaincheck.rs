//! Prints the received signal level of one dongle once per second, for
//! choosing the manual gain of a channel.

use anyhow::Context;
use clap::Parser;
use ozonespec::{
    args::{convert_filter, GainCheckArgs},
    dongle::{Dongle, RtlDongle},
    monitoring::measure_level,
    shutdown::Shutdown,
    SAMPLE_RATE,
};
use std::{thread, time::Duration};
use tracing::{info, warn};

const CHECK_LEN: usize = 65536;

fn main() -> anyhow::Result<()> {
    let cli = GainCheckArgs::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(cli.verbose.log_level_filter()))
        .init();

    let mut dongle = RtlDongle::open(&cli.serial, SAMPLE_RATE, cli.gain)
        .with_context(|| format!("Cannot open dongle {}", cli.serial))?;

    if cli.list_gains {
        let gains: Vec<String> = dongle
            .tuner_gains()
            .iter()
            .map(|g| format!("{:.1}", *g as f32 / 10.0))
            .collect();
        println!("Supported gains (dB): {}", gains.join(" "));
        return Ok(());
    }

    if let Some(wanted) = cli.gain.filter(|g| *g != 0.0) {
        let applied = dongle.tuner_gain();
        if (applied - wanted).abs() > 0.05 {
            warn!("Requested gain {:.1} dB, tuner applied {:.1} dB", wanted, applied);
        }
    }
    dongle.set_frequency(cli.freq)?;

    let shutdown = Shutdown::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || handler_token.trigger())
        .context("Failed to install signal handler")?;

    // Once is enough, later reads just continue the stream
    if let Err(e) = dongle.reset_buffer() {
        warn!("Failed to reset buffer: {}", e);
    }
    let mut buf = vec![0u8; CHECK_LEN];
    while !shutdown.is_triggered() {
        if let Some(level) = measure_level(&mut dongle, &mut buf) {
            info!(
                peak = level.peak,
                "RMS amplitude {:.2}, {:.1} dBFS", level.rms, level.dbfs
            );
        }
        thread::sleep(Duration::from_secs(1));
    }
    Ok(())
}
