//! The listener protocol and the stock listeners.
//!
//! A listener is anything that consumes samples for a set of subscribed
//! channel ids. The reader loop dispatches to listeners serially, so
//! implementations need no internal locking of their own; the `Arc<Mutex<..>>`
//! in [`ListenerRef`] only exists so the same listener can also be inspected
//! from outside the loop.
//!
//! Stock listeners:
//!
//! - [`TraceWindow`]: a rolling per-channel window of recent samples, the
//!   data structure behind a live trace display.
//! - [`SpikeLogger`]: counts and logs samples whose spike flag is set.
//! - [`DsdWriterListener`]: forwards samples into a stream writer.
//! - [`SpoolListener`]: spools samples to a temp file for later replay.

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::dsd::DsdWriter;
use crate::error::{DaqError, DaqResult};
use crate::sample::Sample;
use crate::spool::TempSpooler;

/// A consumer of samples for a subscribed set of channels.
pub trait SampleListener: Send {
    /// Short name used in log messages when the listener is removed.
    fn name(&self) -> &str;

    /// The channel ids this listener wants.
    fn channel_ids(&self) -> Vec<u32>;

    /// Handle one sample. An error removes the listener from the loop.
    fn consume(&mut self, sample: &Sample) -> DaqResult<()>;

    /// Whether this listener renders a live trace ("plot" capability).
    fn is_graph(&self) -> bool {
        false
    }
}

/// Shared handle to a listener, as stored by the reader loop.
pub type ListenerRef = Arc<Mutex<dyn SampleListener>>;

/// Wrap a listener for handing to the reader loop.
pub fn listener_ref<L: SampleListener + 'static>(listener: L) -> Arc<Mutex<L>> {
    Arc::new(Mutex::new(listener))
}

/// Rolling window of recent samples per channel.
pub struct TraceWindow {
    name: String,
    channels: Vec<u32>,
    capacity: usize,
    traces: BTreeMap<u32, VecDeque<(u64, u32)>>,
    spikes_seen: u64,
}

impl TraceWindow {
    /// A window holding `seconds` worth of samples at `rate_hz` for each of
    /// `channels`.
    pub fn new(name: &str, channels: Vec<u32>, seconds: u32, rate_hz: u32) -> Self {
        let capacity = (seconds.max(1) as usize) * (rate_hz.max(1) as usize);
        let traces = channels.iter().map(|c| (*c, VecDeque::new())).collect();
        TraceWindow {
            name: name.to_owned(),
            channels,
            capacity,
            traces,
            spikes_seen: 0,
        }
    }

    /// The buffered (scan_index, value) pairs for a channel, oldest first.
    pub fn trace(&self, chan: u32) -> Vec<(u64, u32)> {
        self.traces
            .get(&chan)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Samples currently buffered for a channel.
    pub fn len(&self, chan: u32) -> usize {
        self.traces.get(&chan).map(VecDeque::len).unwrap_or(0)
    }

    /// True if nothing has been buffered yet.
    pub fn is_empty(&self) -> bool {
        self.traces.values().all(VecDeque::is_empty)
    }

    /// Spike-flagged samples observed so far.
    pub fn spikes_seen(&self) -> u64 {
        self.spikes_seen
    }
}

impl SampleListener for TraceWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_ids(&self) -> Vec<u32> {
        self.channels.clone()
    }

    fn consume(&mut self, sample: &Sample) -> DaqResult<()> {
        if let Some(trace) = self.traces.get_mut(&u32::from(sample.channel_id)) {
            trace.push_back((sample.scan_index, sample.data));
            while trace.len() > self.capacity {
                trace.pop_front();
            }
            if sample.is_spike() {
                self.spikes_seen += 1;
            }
        }
        Ok(())
    }

    fn is_graph(&self) -> bool {
        true
    }
}

/// Logs spike-flagged samples and keeps per-channel counts.
pub struct SpikeLogger {
    channels: Vec<u32>,
    counts: BTreeMap<u32, u64>,
}

impl SpikeLogger {
    /// Log spikes on the given channels.
    pub fn new(channels: Vec<u32>) -> Self {
        SpikeLogger {
            channels,
            counts: BTreeMap::new(),
        }
    }

    /// Spikes seen on one channel.
    pub fn count(&self, chan: u32) -> u64 {
        self.counts.get(&chan).copied().unwrap_or(0)
    }

    /// Spikes seen across all channels.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl SampleListener for SpikeLogger {
    fn name(&self) -> &str {
        "spike-logger"
    }

    fn channel_ids(&self) -> Vec<u32> {
        self.channels.clone()
    }

    fn consume(&mut self, sample: &Sample) -> DaqResult<()> {
        if sample.is_spike() {
            info!(
                channel = sample.channel_id,
                scan_index = sample.scan_index,
                period_ms = sample.spike_period_ms,
                "spike detected"
            );
            *self.counts.entry(u32::from(sample.channel_id)).or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Forwards samples into a stream writer.
pub struct DsdWriterListener<W: Write + Send> {
    writer: Option<DsdWriter<W>>,
    channels: Vec<u32>,
}

impl<W: Write + Send> DsdWriterListener<W> {
    /// Record the given channels through `writer`.
    pub fn new(writer: DsdWriter<W>, channels: Vec<u32>) -> Self {
        DsdWriterListener {
            writer: Some(writer),
            channels,
        }
    }

    /// Pass a sampling-rate change through to the stream.
    pub fn set_sampling_rate(&mut self, rate_hz: u32) {
        if let Some(w) = self.writer.as_mut() {
            w.set_sampling_rate(rate_hz);
        }
    }

    /// Samples written so far.
    pub fn sample_count(&self) -> u64 {
        self.writer.as_ref().map(DsdWriter::sample_count).unwrap_or(0)
    }

    /// Close the stream, writing the footer, and return the sink.
    pub fn finish(&mut self) -> DaqResult<Option<W>> {
        match self.writer.take() {
            Some(w) => Ok(Some(w.end()?)),
            None => Ok(None),
        }
    }
}

impl<W: Write + Send> SampleListener for DsdWriterListener<W> {
    fn name(&self) -> &str {
        "stream-writer"
    }

    fn channel_ids(&self) -> Vec<u32> {
        self.channels.clone()
    }

    fn consume(&mut self, sample: &Sample) -> DaqResult<()> {
        match self.writer.as_mut() {
            Some(w) => w.write_sample(sample),
            None => Err(DaqError::Listener("stream already finished".to_string())),
        }
    }
}

/// Spools samples to local disk for later in-order replay.
pub struct SpoolListener {
    spool: TempSpooler<Sample>,
    channels: Vec<u32>,
    records_lost: u64,
}

impl SpoolListener {
    /// Spool the given channels into a fresh temp file.
    pub fn new(channels: Vec<u32>) -> DaqResult<Self> {
        Ok(SpoolListener {
            spool: TempSpooler::new("samples", true)?,
            channels,
            records_lost: 0,
        })
    }

    /// Samples spooled and not yet truncated.
    pub fn num_spooled(&self) -> u64 {
        self.spool.num_spooled()
    }

    /// Samples lost to full-disk resets.
    pub fn records_lost(&self) -> u64 {
        self.records_lost
    }

    /// Replay every spooled sample, in order, through `op`.
    pub fn replay<F: FnMut(&Sample)>(&mut self, op: F) -> DaqResult<()> {
        self.spool.for_each(op)
    }

    /// Replay every spooled sample into another listener, fanning the spool
    /// back out. Listener errors are returned immediately.
    pub fn replay_into(&mut self, target: &mut dyn SampleListener) -> DaqResult<()> {
        let mut first_err = None;
        self.spool.for_each(|s| {
            if first_err.is_none() {
                if let Err(e) = target.consume(s) {
                    first_err = Some(e);
                }
            }
        })?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop everything spooled so far.
    pub fn truncate(&mut self) -> DaqResult<()> {
        self.spool.truncate()
    }
}

impl SampleListener for SpoolListener {
    fn name(&self) -> &str {
        "spooler"
    }

    fn channel_ids(&self) -> Vec<u32> {
        self.channels.clone()
    }

    fn consume(&mut self, sample: &Sample) -> DaqResult<()> {
        match self.spool.spool(std::slice::from_ref(sample)) {
            Ok(()) => Ok(()),
            Err(DaqError::DiskFull { records_lost }) => {
                self.records_lost += records_lost;
                warn!(records_lost, "spool disk full; spool truncated, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
