//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Station configuration file
    #[clap(short = 'f', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// GPIO directory of the calibrator switch
    #[clap(long, default_value = crate::calibrator::DEFAULT_GPIO)]
    pub gpio: PathBuf,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Print received signal level of one dongle, for setting its gain by hand
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct GainCheckArgs {
    /// Serial number of the dongle to open
    pub serial: String,
    /// Manual tuner gain in dB (automatic if not given or 0)
    #[clap(short, long)]
    pub gain: Option<f32>,
    /// Frequency to tune to in Hz
    #[clap(long, default_value_t = crate::CAL_FREQ as u32)]
    pub freq: u32,
    /// List the gains the tuner supports and exit
    #[clap(short, long)]
    pub list_gains: bool,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
