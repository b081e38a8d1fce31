//! Lock-step calibration across all receiver channels
//!
//! Every channel's recorder and the calibrator controller meet at four
//! barriers per cycle, always in the same order:
//!
//! 1. `CalibratorOn`: the controller has switched the calibrator on
//! 2. `CalibrationRecorded`: every channel has its calibration block
//! 3. `CalibratorOff`: the controller has switched the calibrator off
//!    (between 2 and 3) and every channel has its frequency correction
//! 4. `SignalRecorded`: every channel has written its integrated spectra
//!
//! A channel that never arrives stalls everyone; the watchdog turns that
//! into a process exit.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Mutex, PoisonError,
};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::{
    calibrator::Calibrator,
    error::{Error, Result},
    shutdown::Shutdown,
    watchdog::Heartbeat,
};

/// One generation of a barrier. Waiters hold a clone of `gate`; the last
/// arrival drops `open`, which disconnects the gate and releases them all.
#[derive(Debug)]
struct Generation {
    arrived: usize,
    open: Sender<()>,
    gate: Receiver<()>,
}

impl Generation {
    fn new() -> Self {
        let (open, gate) = bounded(0);
        Self {
            arrived: 0,
            open,
            gate,
        }
    }
}

/// Reusable rendezvous for a fixed number of participants whose waits can be
/// cancelled through the station [`Shutdown`] token
pub struct Rendezvous {
    parties: usize,
    state: Mutex<Generation>,
    shutdown: Shutdown,
}

impl Rendezvous {
    pub fn new(parties: usize, shutdown: Shutdown) -> Self {
        assert!(parties > 0, "barrier needs at least one participant");
        Self {
            parties,
            state: Mutex::new(Generation::new()),
            shutdown,
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until all participants have arrived. Exactly one caller per
    /// generation gets `Ok(true)` (the last to arrive).
    pub fn wait(&self) -> Result<bool> {
        if self.shutdown.is_triggered() {
            return Err(Error::ShuttingDown);
        }
        let gate = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.arrived += 1;
            if state.arrived == self.parties {
                // Dropping the old generation's sender releases its waiters
                *state = Generation::new();
                return Ok(true);
            }
            state.gate.clone()
        };
        select! {
            recv(gate) -> _ => Ok(false),
            recv(self.shutdown.signal()) -> _ => Err(Error::ShuttingDown),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    CalibratorOn = 0,
    CalibrationRecorded = 1,
    CalibratorOff = 2,
    SignalRecorded = 3,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::CalibratorOn,
        Phase::CalibrationRecorded,
        Phase::CalibratorOff,
        Phase::SignalRecorded,
    ];
}

/// The four barriers shared by `channels` recorders and one controller, plus
/// the cycle timestamp the controller publishes for the recorders
pub struct CalibrationCoordinator {
    channels: usize,
    barriers: [Rendezvous; 4],
    cycle_start: AtomicI64,
    shutdown: Shutdown,
}

impl CalibrationCoordinator {
    pub fn new(channels: usize, shutdown: Shutdown) -> Self {
        let parties = channels + 1;
        Self {
            channels,
            barriers: [
                Rendezvous::new(parties, shutdown.clone()),
                Rendezvous::new(parties, shutdown.clone()),
                Rendezvous::new(parties, shutdown.clone()),
                Rendezvous::new(parties, shutdown.clone()),
            ],
            cycle_start: AtomicI64::new(0),
            shutdown,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Token that cancels every wait on these barriers
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn wait(&self, phase: Phase) -> Result<bool> {
        self.barriers[phase as usize].wait()
    }

    /// Called by the controller before `CalibratorOn`
    pub fn begin_cycle(&self, start: DateTime<Utc>) {
        self.cycle_start.store(start.timestamp(), Ordering::SeqCst);
    }

    /// Start of the current cycle; valid for recorders after `CalibratorOn`
    pub fn cycle_start(&self) -> DateTime<Utc> {
        let secs = self.cycle_start.load(Ordering::SeqCst);
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }
}

/// Drives the calibrator in step with the recorders
pub struct CalibrationController<'a, C: Calibrator> {
    calibrator: C,
    coordinator: &'a CalibrationCoordinator,
    keep_cal_on: bool,
    heartbeat: Option<Heartbeat>,
    cycles: u64,
}

impl<'a, C: Calibrator> CalibrationController<'a, C> {
    pub fn new(calibrator: C, coordinator: &'a CalibrationCoordinator, keep_cal_on: bool) -> Self {
        Self {
            calibrator,
            coordinator,
            keep_cal_on,
            heartbeat: None,
            cycles: 0,
        }
    }

    /// Reset the watchdog after every completed cycle
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn set_calibrator(&mut self, on: bool) {
        if let Err(e) = self.calibrator.set_state(on) {
            warn!("Failed to switch calibrator {}: {}", if on { "on" } else { "off" }, e);
        }
    }

    /// One full cycle: on, wait for calibration, off, wait for signal
    pub fn run_cycle(&mut self) -> Result<()> {
        info!("Calibrator on");
        self.set_calibrator(true);
        self.coordinator.begin_cycle(Utc::now());
        self.coordinator.wait(Phase::CalibratorOn)?;

        debug!("Waiting for calibration recordings");
        self.coordinator.wait(Phase::CalibrationRecorded)?;

        if self.keep_cal_on {
            info!("Calibrator remains on");
        } else {
            info!("Calibrator off");
            self.set_calibrator(false);
        }
        self.coordinator.wait(Phase::CalibratorOff)?;

        debug!("Waiting for signal recordings to finish");
        self.coordinator.wait(Phase::SignalRecorded)?;

        self.cycles += 1;
        if let Some(hb) = &self.heartbeat {
            hb.beat();
        }
        Ok(())
    }

    /// Cycle until shutdown, then leave the calibrator off
    pub fn run(mut self) -> C {
        loop {
            if let Err(e) = self.run_cycle() {
                info!("Controller stopping after {} cycles: {}", self.cycles, e);
                break;
            }
        }
        self.set_calibrator(false);
        self.calibrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn test_single_party_never_blocks() {
        let b = Rendezvous::new(1, Shutdown::new());
        assert!(b.wait().unwrap());
        assert!(b.wait().unwrap());
    }

    #[test]
    fn test_exactly_one_leader() {
        let b = Arc::new(Rendezvous::new(4, Shutdown::new()));
        let leaders = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = b.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        if b.wait().unwrap() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(leaders.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_no_one_crosses_early() {
        // Per-phase arrival counters: when anyone leaves barrier k, all
        // participants must have arrived at it.
        let channels = 3;
        let coord = Arc::new(CalibrationCoordinator::new(channels, Shutdown::new()));
        let arrived: Arc<Vec<AtomicUsize>> =
            Arc::new((0..4 * 5).map(|_| AtomicUsize::new(0)).collect());
        let handles: Vec<_> = (0..=channels)
            .map(|id| {
                let coord = coord.clone();
                let arrived = arrived.clone();
                thread::spawn(move || {
                    for cycle in 0..5 {
                        for phase in Phase::ALL {
                            let slot = cycle * 4 + phase as usize;
                            // Jitter the arrival order
                            thread::sleep(Duration::from_millis(((id * 7 + slot) % 5) as u64));
                            arrived[slot].fetch_add(1, Ordering::SeqCst);
                            coord.wait(phase).unwrap();
                            assert_eq!(arrived[slot].load(Ordering::SeqCst), channels + 1);
                        }
                    }
                })
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
    }

    #[test]
    fn test_shutdown_releases_barrier() {
        let shutdown = Shutdown::new();
        let coord = Arc::new(CalibrationCoordinator::new(2, shutdown.clone()));
        let c = coord.clone();
        let h = thread::spawn(move || c.wait(Phase::CalibratorOn));
        thread::sleep(Duration::from_millis(100));
        shutdown.trigger();
        assert!(matches!(h.join().unwrap(), Err(Error::ShuttingDown)));
    }

    #[derive(Default)]
    struct RecordingCalibrator(Arc<Mutex<Vec<bool>>>);

    impl Calibrator for RecordingCalibrator {
        fn set_state(&mut self, on: bool) -> Result<()> {
            self.0.lock().unwrap().push(on);
            Ok(())
        }
    }

    #[test]
    fn test_controller_toggles_between_barriers() {
        let shutdown = Shutdown::new();
        let coord = Arc::new(CalibrationCoordinator::new(1, shutdown.clone()));
        let states = Arc::new(Mutex::new(Vec::new()));
        let cal = RecordingCalibrator(states.clone());

        let c = coord.clone();
        let s = states.clone();
        let channel = thread::spawn(move || {
            c.wait(Phase::CalibratorOn).unwrap();
            assert_eq!(*s.lock().unwrap(), vec![true]);
            c.wait(Phase::CalibrationRecorded).unwrap();
            c.wait(Phase::CalibratorOff).unwrap();
            assert_eq!(*s.lock().unwrap(), vec![true, false]);
            c.wait(Phase::SignalRecorded).unwrap();
        });

        let mut controller = CalibrationController::new(cal, &coord, false);
        controller.run_cycle().unwrap();
        channel.join().unwrap();
        assert_eq!(controller.cycles(), 1);
    }

    #[test]
    fn test_keep_cal_on() {
        let coord = CalibrationCoordinator::new(0, Shutdown::new());
        let states = Arc::new(Mutex::new(Vec::new()));
        let mut controller =
            CalibrationController::new(RecordingCalibrator(states.clone()), &coord, true);
        controller.run_cycle().unwrap();
        controller.run_cycle().unwrap();
        assert_eq!(*states.lock().unwrap(), vec![true, true]);
    }
}
