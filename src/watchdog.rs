//! Liveness monitor for the calibration cycle
//!
//! The controller beats once per completed cycle. If no beat arrives within
//! the timeout, some channel is stuck at a barrier and the whole station is
//! wedged, so the expiry action (process exit in production) runs without
//! any cleanup.

use std::{
    io,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

/// Resets the watchdog deadline; dropping every clone stops the watchdog
#[derive(Clone, Debug)]
pub struct Heartbeat(Sender<()>);

impl Heartbeat {
    pub fn beat(&self) {
        // A full channel already holds an unconsumed beat
        let _ = self.0.try_send(());
    }
}

/// Start the watchdog thread. The deadline is armed immediately.
pub fn spawn<F>(timeout: Duration, on_expire: F) -> io::Result<(Heartbeat, JoinHandle<()>)>
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let handle = thread::Builder::new()
        .name("watchdog".to_owned())
        .spawn(move || loop {
            match rx.recv_timeout(timeout) {
                Ok(()) => trace!("Watchdog reset"),
                Err(RecvTimeoutError::Timeout) => {
                    error!("Watchdog timer expired after {:?}! Exiting.", timeout);
                    on_expire();
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Watchdog stopped");
                    return;
                }
            }
        })?;
    Ok((Heartbeat(tx), handle))
}
