//! The reader loop: fan samples out to listeners, per channel.
//!
//! The loop owns the sample reader and a per-channel vector of listener
//! references; dispatch is a direct call on each listener in insertion order.
//! Scheduling is cooperative: each [`ReaderLoop::tick`] drains the source once
//! and reports how long the caller should wait before the next tick (from the
//! source's own suggestion). [`ReaderLoop::run`] is the blocking form.
//!
//! Failure policy:
//!
//! - end-of-stream stops the loop cleanly and drains the sample counters to
//!   stderr;
//! - source errors stop the loop and surface to the caller;
//! - a listener that fails is removed and logged, never propagated — one bad
//!   display must not take down acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::error::DaqResult;
use crate::listener::ListenerRef;
use crate::reader::SampleReader;
use crate::sample::MAX_CHANNELS;

/// What a tick decided.
#[derive(Debug)]
pub enum TickOutcome {
    /// Keep going; call `tick` again after roughly this long.
    Continue(Duration),
    /// The loop is done (stop requested or the source ended).
    Stopped,
}

/// Cooperative cancellation handle for a running loop.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub(crate) fn from_flag(flag: Arc<AtomicBool>) -> Self {
        StopHandle(flag)
    }

    /// Ask the loop to stop at the top of its next tick.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns the reader and the per-channel listener table.
pub struct ReaderLoop {
    reader: SampleReader,
    listeners: Vec<Vec<ListenerRef>>,
    stop: Arc<AtomicBool>,
}

impl ReaderLoop {
    /// Build a loop over `reader` with no listeners attached.
    pub fn new(reader: SampleReader) -> Self {
        ReaderLoop {
            reader,
            listeners: (0..MAX_CHANNELS).map(|_| Vec::new()).collect(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that can stop this loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Attach a listener to every channel it subscribes to.
    pub fn add_listener(&mut self, listener: ListenerRef) {
        let channels = match listener.lock() {
            Ok(guard) => guard.channel_ids(),
            Err(_) => return,
        };
        for chan in channels {
            if let Some(slot) = self.listeners.get_mut(chan as usize) {
                slot.push(Arc::clone(&listener));
            }
        }
    }

    /// Detach a listener from every channel. Idempotent.
    pub fn remove_listener(&mut self, listener: &ListenerRef) {
        for slot in &mut self.listeners {
            slot.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// True iff a listener with the "plot" capability is attached to `chan`.
    pub fn graph_listener_exists(&self, chan: u32) -> bool {
        self.listeners
            .get(chan as usize)
            .map(|slot| {
                slot.iter()
                    .any(|l| l.lock().map(|g| g.is_graph()).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    /// Total records delivered without error.
    pub fn num_read(&self) -> u64 {
        self.reader.num_read()
    }

    /// Total scans detected as dropped by the producer.
    pub fn num_dropped(&self) -> u64 {
        self.reader.num_dropped()
    }

    /// Run one iteration: read everything available and dispatch it.
    pub fn tick(&mut self) -> DaqResult<TickOutcome> {
        if self.stop.load(Ordering::SeqCst) {
            return Ok(TickOutcome::Stopped);
        }

        let records = match self.reader.read_all() {
            Ok(records) => records,
            Err(e) if e.is_clean_eof() => {
                drain_counters(self.reader.num_read(), self.reader.num_dropped());
                return Ok(TickOutcome::Stopped);
            }
            Err(e) => return Err(e),
        };

        let mut failed: Vec<ListenerRef> = Vec::new();
        for sample in records {
            let chan = usize::from(sample.channel_id);
            let Some(slot) = self.listeners.get(chan) else {
                continue;
            };
            for listener in slot {
                match listener.lock() {
                    Ok(mut guard) => {
                        if let Err(e) = guard.consume(sample) {
                            error!(listener = guard.name(), "listener failed, removing: {}", e);
                            failed.push(Arc::clone(listener));
                        }
                    }
                    Err(_) => {
                        error!("listener mutex poisoned, removing");
                        failed.push(Arc::clone(listener));
                    }
                }
            }
        }
        for listener in &failed {
            for slot in &mut self.listeners {
                slot.retain(|l| !Arc::ptr_eq(l, listener));
            }
        }

        Ok(TickOutcome::Continue(self.reader.suggest_poll_wait()))
    }

    /// Drive `tick` until the loop stops or a source error surfaces.
    pub fn run(&mut self) -> DaqResult<()> {
        loop {
            match self.tick()? {
                TickOutcome::Stopped => return Ok(()),
                TickOutcome::Continue(wait) => {
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                }
            }
        }
    }
}

fn drain_counters(num_read: u64, num_dropped: u64) {
    eprintln!(
        "Read: {} samples without errors, dropped {} samples.",
        num_read, num_dropped
    );
    if num_dropped > 0 {
        eprintln!(
            "(Dropped samples can occur when the reader is too slow for the \
             sampling task, or when channels are turned off and back on.)"
        );
    }
}
