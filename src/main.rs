use anyhow::{bail, Context};
use clap::Parser;
use ozonespec::{
    args,
    calibrator::GpioCalibrator,
    capture::{Acquisition, RecorderWorker},
    config::Config,
    coordinator::{CalibrationController, CalibrationCoordinator},
    dongle::RtlDongle,
    exfil::{RecordWriter, Station},
    f_engine::fft_window,
    shutdown::Shutdown,
    watchdog,
};
use std::sync::Arc;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    // Get the CLI options
    let cli = args::Args::parse();

    // Logger
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(cli.verbose.log_level_filter()))
        .init();

    let config = Config::from_file(&cli.config)?;
    if config.dongles.is_empty() {
        bail!("No dongles defined in {}", cli.config.display());
    }
    let channels = config.dongles.len();
    info!("Starting station with {} channel(s)", channels);

    // Graceful shutdown on ctrl-c
    let shutdown = Shutdown::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted, shutting down");
        handler_token.trigger();
    })
    .context("Failed to install signal handler")?;

    let params = Acquisition {
        line_freq: config.line_freq,
        ..Acquisition::default()
    };
    let window: Option<Arc<[f32]>> = config
        .fft_window
        .then(|| fft_window(params.fft_len).into());

    let calibrator = GpioCalibrator::open(&cli.gpio)
        .with_context(|| format!("Cannot control calibrator at {}", cli.gpio.display()))?;
    let coordinator = Arc::new(CalibrationCoordinator::new(channels, shutdown.clone()));
    let writer = RecordWriter::new(
        &config.data_dir,
        Station {
            number: config.station_number,
            name: config.station_name.clone(),
        },
    )
    .shared();

    // Open every dongle before starting anything so a missing one fails fast
    let mut dongles = Vec::with_capacity(channels);
    for d in &config.dongles {
        let dongle = RtlDongle::open(&d.serial, params.sample_rate, d.gain)
            .with_context(|| format!("Cannot open dongle {}", d.serial))?;
        dongles.push(dongle);
    }

    let (heartbeat, _watchdog) = watchdog::spawn(config.watchdog(), || std::process::exit(1))
        .context("Failed to start watchdog")?;

    let mut recorders = Vec::with_capacity(channels);
    for (channel, dongle) in dongles.into_iter().enumerate() {
        let mut worker = RecorderWorker::new(
            channel,
            dongle,
            params.clone(),
            coordinator.clone(),
            writer.clone(),
        );
        if let Some(w) = &window {
            worker = worker.with_window(w.clone());
        }
        recorders.push(worker.spawn()?);
    }

    // The controller runs here until shutdown
    let controller = CalibrationController::new(calibrator, &coordinator, config.keep_cal_on)
        .with_heartbeat(heartbeat.clone());
    controller.run();

    for (channel, handle) in recorders.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => error!(channel, "Recorder failed: {}", e),
            Err(_) => error!(channel, "Recorder panicked"),
        }
    }
    // Keeps the watchdog armed until every recorder has unwound
    drop(heartbeat);
    info!("Station stopped");
    Ok(())
}
