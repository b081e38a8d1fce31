//! Calibration source control
//!
//! The calibrator is a noise/tone source switched by one GPIO line. Only the
//! controller thread ever touches it.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{error, info};

use crate::error::Result;

/// Default sysfs GPIO line wired to the calibrator
pub const DEFAULT_GPIO: &str = "/sys/class/gpio/gpio60";

pub trait Calibrator: Send {
    fn set_state(&mut self, on: bool) -> Result<()>;
}

/// Calibrator switched through the sysfs GPIO interface
pub struct GpioCalibrator {
    path: PathBuf,
    value: File,
}

impl GpioCalibrator {
    /// Configure `gpio` as an output and open its value file. Failing to set the
    /// direction is only logged (it may already be an output); failing to open
    /// the value file is an error.
    pub fn open<P: AsRef<Path>>(gpio: P) -> Result<Self> {
        let path = gpio.as_ref().to_path_buf();
        let direction = path.join("direction");
        if let Err(e) = File::create(&direction).and_then(|mut f| f.write_all(b"out\n")) {
            error!("{}: {}", direction.display(), e);
        }
        let value = OpenOptions::new().write(true).open(path.join("value"))?;
        info!("Calibrator control on {}", path.display());
        Ok(Self { path, value })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Calibrator for GpioCalibrator {
    fn set_state(&mut self, on: bool) -> Result<()> {
        self.value.write_all(if on { b"1\n" } else { b"0\n" })?;
        self.value.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_gpio_writes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("value"), b"").unwrap();
        let mut cal = GpioCalibrator::open(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("direction")).unwrap(), "out\n");
        cal.set_state(true).unwrap();
        cal.set_state(false).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("value")).unwrap(), "1\n0\n");
    }

    #[test]
    fn test_missing_value_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GpioCalibrator::open(dir.path().join("nope")).is_err());
    }
}
