//! Fixed-slot queue between the acquisition thread and its FFT worker
//!
//! The slots are allocated once up front and circulate between two bounded
//! crossbeam channels: the producer takes an empty slot from `free`, fills
//! it in place and sends it down `filled`; the consumer reads it and hands
//! it back through `free`. A full sample block is never copied, at most
//! `capacity` slots exist, and order is FIFO. Every wait also selects on
//! the station [`Shutdown`] token.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::trace;

use crate::{
    error::{Error, Result},
    shutdown::Shutdown,
};

/// Writing half of a slot queue
pub struct Producer<T> {
    free: Receiver<Box<T>>,
    filled: Sender<Box<T>>,
    capacity: usize,
    shutdown: Shutdown,
}

/// Reading half of a slot queue
pub struct Consumer<T> {
    filled: Receiver<Box<T>>,
    free: Sender<Box<T>>,
    // Lets `drop` take back the idle slots so the producer sees the disconnect
    reclaim: Receiver<Box<T>>,
    capacity: usize,
    shutdown: Shutdown,
}

/// Build a single-producer single-consumer queue over preallocated `slots`.
/// The capacity of the queue is the number of slots.
pub fn slot_queue<T>(slots: Vec<T>, shutdown: Shutdown) -> (Producer<T>, Consumer<T>) {
    assert!(!slots.is_empty(), "slot queue needs at least one slot");
    let capacity = slots.len();
    let (free_tx, free_rx) = bounded(capacity);
    let (filled_tx, filled_rx) = bounded(capacity);
    for slot in slots {
        // Cannot fail, the channel holds exactly `capacity` and we own both ends
        let _ = free_tx.send(Box::new(slot));
    }
    (
        Producer {
            free: free_rx.clone(),
            filled: filled_tx,
            capacity,
            shutdown: shutdown.clone(),
        },
        Consumer {
            filled: filled_rx,
            free: free_tx,
            reclaim: free_rx,
            capacity,
            shutdown,
        },
    )
}

impl<T> Producer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of published slots not yet taken by the consumer
    pub fn len(&self) -> usize {
        self.filled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    /// Wait for a free slot, fill it in place with `fill` and publish it.
    pub fn push_with<R, F>(&mut self, fill: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        if self.shutdown.is_triggered() {
            return Err(Error::ShuttingDown);
        }
        if self.free.is_empty() {
            trace!("Queue full, waiting for space");
        }
        let mut slot = select! {
            recv(self.free) -> slot => slot.map_err(|_| Error::Disconnected)?,
            recv(self.shutdown.signal()) -> _ => return Err(Error::ShuttingDown),
        };
        let out = fill(&mut *slot);
        self.filled.send(slot).map_err(|_| Error::Disconnected)?;
        Ok(out)
    }

    /// Copy `value` into the next free slot
    pub fn push(&mut self, value: &T) -> Result<()>
    where
        T: Clone,
    {
        self.push_with(|slot| slot.clone_from(value))
    }
}

impl<T> Consumer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.filled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    /// Wait for the oldest published slot, hand it to `read` and release it.
    /// Slots published before the producer went away are still delivered.
    pub fn pop_with<R, F>(&mut self, read: F) -> Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        if self.shutdown.is_triggered() {
            return Err(Error::ShuttingDown);
        }
        if self.filled.is_empty() {
            trace!("Queue empty, waiting for data");
        }
        let slot = select! {
            recv(self.filled) -> slot => slot.map_err(|_| Error::Disconnected)?,
            recv(self.shutdown.signal()) -> _ => return Err(Error::ShuttingDown),
        };
        let out = read(&*slot);
        // Only fails once the producer is gone, and then nobody needs the slot
        let _ = self.free.send(slot);
        Ok(out)
    }

    /// Clone the oldest slot out of the queue
    pub fn pop(&mut self) -> Result<T>
    where
        T: Clone,
    {
        self.pop_with(T::clone)
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        while self.reclaim.try_recv().is_ok() {}
    }
}
