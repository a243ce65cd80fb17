//! Per-channel spike detection.
//!
//! The rule, per channel: a reading fires iff detection is enabled, the
//! reading is on the configured side of the threshold, and at least the
//! blanking interval has passed since the previous accepted spike on that
//! channel. Accepted spikes stamp the outgoing sample with the spike flag and
//! the milliseconds elapsed since the previous one (0 for the first).
//!
//! The detector runs in the producer domain, reading its parameters from the
//! control block each scan.

use crate::control::{SpikeParams, SpikePolarity};
use crate::sample::{ChannelMask, Sample, MAX_CHANNELS};

/// Stateful spike detector over all channels.
pub struct SpikeDetector {
    last_spike_scan: Box<[u64; MAX_CHANNELS]>,
    has_spiked: ChannelMask,
}

impl Default for SpikeDetector {
    fn default() -> Self {
        SpikeDetector::new()
    }
}

impl SpikeDetector {
    /// A detector with no spike history.
    pub fn new() -> Self {
        SpikeDetector {
            last_spike_scan: Box::new([0; MAX_CHANNELS]),
            has_spiked: ChannelMask::empty(),
        }
    }

    /// Forget all spike history.
    pub fn reset(&mut self) {
        self.last_spike_scan = Box::new([0; MAX_CHANNELS]);
        self.has_spiked = ChannelMask::empty();
    }

    /// Evaluate one reading.
    ///
    /// Returns `Some(period_ms)` when a spike is accepted, where `period_ms`
    /// is the time since the previous accepted spike on this channel (0 for
    /// the channel's first spike).
    pub fn evaluate(
        &mut self,
        params: &SpikeParams,
        chan: u32,
        scan_index: u64,
        data: u32,
        rate_hz: u32,
    ) -> Option<u32> {
        if !params.enabled || chan as usize >= MAX_CHANNELS {
            return None;
        }

        let reading = f64::from(data);
        let fired = match params.polarity {
            SpikePolarity::Positive => reading >= params.threshold,
            SpikePolarity::Negative => reading <= params.threshold,
        };
        if !fired {
            return None;
        }

        let rate = u64::from(rate_hz.max(1));
        let period_ms = if self.has_spiked.is_on(chan) {
            let elapsed_scans = scan_index.saturating_sub(self.last_spike_scan[chan as usize]);
            let elapsed_ms = elapsed_scans * 1000 / rate;
            if elapsed_ms < u64::from(params.blanking_ms) {
                return None;
            }
            elapsed_ms as u32
        } else {
            0
        };

        self.last_spike_scan[chan as usize] = scan_index;
        self.has_spiked.set(chan, true);
        Some(period_ms)
    }

    /// Stamp `sample` with the detection outcome for its own reading.
    pub fn apply(&mut self, params: &SpikeParams, sample: Sample, rate_hz: u32) -> Sample {
        match self.evaluate(
            params,
            u32::from(sample.channel_id),
            sample.scan_index,
            sample.data,
            rate_hz,
        ) {
            Some(period_ms) => sample.with_spike(period_ms),
            None => sample,
        }
    }
}
