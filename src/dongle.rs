//! RTL2832U receiver ("dongle") access
//!
//! The recorder only needs three things from a receiver: tune it, flush its
//! sample FIFO, and read a block of interleaved 8-bit offset I/Q bytes. That
//! is the [`Dongle`] trait. [`RtlDongle`] implements it on top of librtlsdr,
//! which is loaded at runtime (libloading) so the station builds without the
//! library and only needs it when it actually opens a device.

use std::{
    ffi::{c_char, c_int, c_uint, c_void, CString},
    ptr,
    sync::OnceLock,
};

use libloading::Library;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A receiver channel as seen by the recorder
pub trait Dongle: Send {
    /// Serial number the device was opened by
    fn serial(&self) -> &str;
    /// Tune to `freq_hz`, returning the frequency actually set
    fn set_frequency(&mut self, freq_hz: u32) -> Result<u32>;
    /// Discard buffered samples so the next read starts fresh
    fn reset_buffer(&mut self) -> Result<()>;
    /// Fill `buf` synchronously; returns the number of bytes delivered, which may be short
    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize>;
}

type DevHandle = *mut c_void;

struct RtlSdrLib {
    _lib: Library,
    get_index_by_serial: unsafe extern "C" fn(*const c_char) -> c_int,
    open: unsafe extern "C" fn(*mut DevHandle, c_uint) -> c_int,
    close: unsafe extern "C" fn(DevHandle) -> c_int,
    set_center_freq: unsafe extern "C" fn(DevHandle, c_uint) -> c_int,
    get_center_freq: unsafe extern "C" fn(DevHandle) -> c_uint,
    set_sample_rate: unsafe extern "C" fn(DevHandle, c_uint) -> c_int,
    set_tuner_gain_mode: unsafe extern "C" fn(DevHandle, c_int) -> c_int,
    get_tuner_gains: unsafe extern "C" fn(DevHandle, *mut c_int) -> c_int,
    set_tuner_gain: unsafe extern "C" fn(DevHandle, c_int) -> c_int,
    get_tuner_gain: unsafe extern "C" fn(DevHandle) -> c_int,
    reset_buffer: unsafe extern "C" fn(DevHandle) -> c_int,
    read_sync: unsafe extern "C" fn(DevHandle, *mut c_void, c_int, *mut c_int) -> c_int,
}

unsafe fn sym<T: Copy>(lib: &Library, name: &[u8]) -> std::result::Result<T, libloading::Error> {
    Ok(*lib.get::<T>(name)?)
}

impl RtlSdrLib {
    /// Resolve every symbol we use. The function pointers stay valid because
    /// the library is kept alive alongside them for the life of the process.
    unsafe fn bind(lib: Library) -> std::result::Result<Self, libloading::Error> {
        Ok(Self {
            get_index_by_serial: sym(&lib, b"rtlsdr_get_index_by_serial\0")?,
            open: sym(&lib, b"rtlsdr_open\0")?,
            close: sym(&lib, b"rtlsdr_close\0")?,
            set_center_freq: sym(&lib, b"rtlsdr_set_center_freq\0")?,
            get_center_freq: sym(&lib, b"rtlsdr_get_center_freq\0")?,
            set_sample_rate: sym(&lib, b"rtlsdr_set_sample_rate\0")?,
            set_tuner_gain_mode: sym(&lib, b"rtlsdr_set_tuner_gain_mode\0")?,
            get_tuner_gains: sym(&lib, b"rtlsdr_get_tuner_gains\0")?,
            set_tuner_gain: sym(&lib, b"rtlsdr_set_tuner_gain\0")?,
            get_tuner_gain: sym(&lib, b"rtlsdr_get_tuner_gain\0")?,
            reset_buffer: sym(&lib, b"rtlsdr_reset_buffer\0")?,
            read_sync: sym(&lib, b"rtlsdr_read_sync\0")?,
            _lib: lib,
        })
    }
}

static RTLSDR_LIB: OnceLock<Option<RtlSdrLib>> = OnceLock::new();

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["librtlsdr.dylib", "librtlsdr.0.dylib"];
#[cfg(not(target_os = "macos"))]
const LIB_NAMES: &[&str] = &["librtlsdr.so.0", "librtlsdr.so"];

fn load_library() -> Option<RtlSdrLib> {
    for name in LIB_NAMES {
        // Safety: librtlsdr has no library constructors with preconditions
        let lib = match unsafe { Library::new(name) } {
            Ok(lib) => lib,
            Err(_) => continue,
        };
        match unsafe { RtlSdrLib::bind(lib) } {
            Ok(bound) => {
                info!("Loaded RTL-SDR library: {}", name);
                return Some(bound);
            }
            Err(e) => warn!("{} is missing symbols: {}", name, e),
        }
    }
    None
}

fn lib() -> Result<&'static RtlSdrLib> {
    RTLSDR_LIB
        .get_or_init(load_library)
        .as_ref()
        .ok_or_else(|| Error::device("librtlsdr not found, install the rtl-sdr package"))
}

/// An open RTL-SDR device
pub struct RtlDongle {
    lib: &'static RtlSdrLib,
    handle: DevHandle,
    serial: String,
}

// Safety: the handle is only ever used from the thread that owns the RtlDongle
unsafe impl Send for RtlDongle {}

impl RtlDongle {
    /// Open the dongle with the given serial number and set it up for recording.
    /// `gain_db` of `None` (or zero) selects automatic gain.
    pub fn open(serial: &str, sample_rate: u32, gain_db: Option<f32>) -> Result<Self> {
        let lib = lib()?;
        let c_serial = CString::new(serial)
            .map_err(|_| Error::device(format!("Invalid serial number {:?}", serial)))?;
        let index = unsafe { (lib.get_index_by_serial)(c_serial.as_ptr()) };
        if index < 0 {
            return Err(Error::device(format!(
                "No dongle with serial number {} found",
                serial
            )));
        }
        let mut handle: DevHandle = ptr::null_mut();
        let ret = unsafe { (lib.open)(&mut handle, index as c_uint) };
        if ret < 0 || handle.is_null() {
            return Err(Error::device(format!(
                "Failed to open rtlsdr device #{} ({})",
                index, ret
            )));
        }
        info!("Dongle {} is device #{}", serial, index);
        let mut dongle = Self {
            lib,
            handle,
            serial: serial.to_owned(),
        };

        if unsafe { (lib.set_sample_rate)(handle, sample_rate) } < 0 {
            warn!(serial, "Failed to set sample rate");
        }
        match gain_db.filter(|g| *g != 0.0) {
            None => {
                if unsafe { (lib.set_tuner_gain_mode)(handle, 0) } < 0 {
                    warn!(serial, "Failed to enable automatic gain");
                }
            }
            Some(gain) => {
                if let Err(e) = dongle.set_gain(gain) {
                    warn!(serial, "{}", e);
                }
            }
        }
        if let Err(e) = dongle.reset_buffer() {
            warn!(serial, "{}", e);
        }
        Ok(dongle)
    }

    /// Tuner gains the device supports, in tenths of a dB
    pub fn tuner_gains(&self) -> Vec<i32> {
        let n = unsafe { (self.lib.get_tuner_gains)(self.handle, ptr::null_mut()) };
        if n <= 0 {
            return Vec::new();
        }
        let mut gains = vec![0 as c_int; n as usize];
        let n = unsafe { (self.lib.get_tuner_gains)(self.handle, gains.as_mut_ptr()) };
        gains.truncate(n.max(0) as usize);
        gains
    }

    /// Currently applied tuner gain in dB
    pub fn tuner_gain(&self) -> f32 {
        unsafe { (self.lib.get_tuner_gain)(self.handle) as f32 / 10.0 }
    }

    /// Switch to manual gain and apply the supported gain nearest `gain_db`
    pub fn set_gain(&mut self, gain_db: f32) -> Result<f32> {
        if unsafe { (self.lib.set_tuner_gain_mode)(self.handle, 1) } < 0 {
            warn!(serial = %self.serial, "Failed to enable manual gain");
        }
        let wanted = (gain_db * 10.0).round() as i32;
        let tenths = self
            .tuner_gains()
            .into_iter()
            .min_by_key(|g| (g - wanted).abs())
            .unwrap_or(wanted);
        if unsafe { (self.lib.set_tuner_gain)(self.handle, tenths) } < 0 {
            return Err(Error::device("Failed to set tuner gain"));
        }
        let actual = self.tuner_gain();
        info!(serial = %self.serial, "Tuner gain set to {:.1} dB", actual);
        Ok(actual)
    }
}

impl Dongle for RtlDongle {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn set_frequency(&mut self, freq_hz: u32) -> Result<u32> {
        if unsafe { (self.lib.set_center_freq)(self.handle, freq_hz) } < 0 {
            return Err(Error::device("Failed to set center freq"));
        }
        let actual = unsafe { (self.lib.get_center_freq)(self.handle) };
        debug!("Tuned to {} Hz (wanted {} Hz)", actual, freq_hz);
        Ok(actual)
    }

    fn reset_buffer(&mut self) -> Result<()> {
        if unsafe { (self.lib.reset_buffer)(self.handle) } < 0 {
            return Err(Error::device("rtlsdr_reset_buffer() failed"));
        }
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut n_read: c_int = 0;
        let ret = unsafe {
            (self.lib.read_sync)(
                self.handle,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as c_int,
                &mut n_read,
            )
        };
        let n_read = n_read.max(0) as usize;
        if ret < 0 {
            if n_read == 0 {
                return Err(Error::device("rtlsdr_read_sync() failed"));
            }
            warn!(serial = %self.serial, n_read, "rtlsdr_read_sync() failed, keeping partial read");
        }
        Ok(n_read.min(buf.len()))
    }
}

impl Drop for RtlDongle {
    fn drop(&mut self) {
        unsafe { (self.lib.close)(self.handle) };
    }
}
