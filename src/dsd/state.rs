//! Stream state bookkeeping: mask/rate intervals and the footer payload.
//!
//! The writer and reader both hold one "current" [`MaskState`] and
//! [`RateState`]; closed intervals accumulate in the [`StateHistory`], which
//! the writer serializes into the footer on close and the reader restores
//! from it on open. All index ranges are inclusive on both ends.

use std::collections::BTreeMap;

use crate::error::{DaqError, DaqResult};
use crate::sample::ChannelMask;
use crate::settings::Settings;

/// A period during which the channel mask was constant.
#[derive(Clone, Debug, Default)]
pub struct MaskState {
    /// The mask itself.
    pub mask: ChannelMask,
    /// First scan index of the period.
    pub start_index: u64,
    /// Last scan index of the period.
    pub end_index: u64,
    channels_on: Vec<u32>,
    id_to_pos: BTreeMap<u32, usize>,
}

impl MaskState {
    /// Recompute the dense channel order after the mask changed.
    ///
    /// Afterward `channels_on().len() == mask.num_on()` and
    /// `pos_of(channels_on()[i]) == Some(i)`.
    pub fn recompute(&mut self) {
        self.channels_on = self.mask.channels_on();
        self.id_to_pos = self
            .channels_on
            .iter()
            .enumerate()
            .map(|(pos, chan)| (*chan, pos))
            .collect();
    }

    /// The enabled channels, in the order their values appear within a scan.
    pub fn channels_on(&self) -> &[u32] {
        &self.channels_on
    }

    /// Dense position of a channel within the current mask.
    pub fn pos_of(&self, chan: u32) -> Option<usize> {
        self.id_to_pos.get(&chan).copied()
    }
}

/// A period during which the sampling rate was constant.
#[derive(Clone, Debug, Default)]
pub struct RateState {
    /// Sampling rate in Hz.
    pub rate_hz: u32,
    /// First scan index of the period.
    pub start_index: u64,
    /// Last scan index of the period.
    pub end_index: u64,
}

/// Everything the footer records about a finished stream.
#[derive(Clone, Debug, Default)]
pub struct StateHistory {
    /// First scan index in the stream.
    pub start_index: u64,
    /// Last scan index in the stream.
    pub end_index: u64,
    /// Total scalar values in the stream body.
    pub sample_count: u64,
    /// Number of scans actually present (skipped ranges excluded).
    pub scan_count: u64,
    /// Wall-clock time the first sample was written, unix seconds.
    pub time_started: i64,
    /// Number of distinct channels used anywhere in the stream.
    pub max_unique_channels_used: u32,
    /// Closed mask periods, oldest first.
    pub mask_states: Vec<MaskState>,
    /// Closed rate periods, oldest first.
    pub rate_states: Vec<RateState>,
    /// Inclusive index ranges the producer dropped.
    pub skipped_ranges: Vec<(u64, u64)>,
}

impl StateHistory {
    /// The mask period covering `index`, if any.
    pub fn mask_state_at(&self, index: u64) -> Option<&MaskState> {
        self.mask_states
            .iter()
            .find(|m| m.start_index <= index && index <= m.end_index)
    }

    /// Whether `chan` was enabled at `index`.
    pub fn is_chan_on(&self, chan: u32, index: u64) -> bool {
        self.mask_state_at(index)
            .map(|m| m.mask.is_on(chan))
            .unwrap_or(false)
    }

    /// Scans present in the inclusive range, skipped ranges excluded.
    pub fn scan_count_between(&self, from: u64, to: u64) -> u64 {
        let from = from.max(self.start_index);
        let to = to.min(self.end_index);
        if from > to {
            return 0;
        }
        let mut count = to - from + 1;
        for (sf, st) in &self.skipped_ranges {
            let overlap_from = (*sf).max(from);
            let overlap_to = (*st).min(to);
            if overlap_from <= overlap_to {
                count -= overlap_to - overlap_from + 1;
            }
        }
        count
    }

    /// Union of all channels enabled anywhere in the inclusive range.
    pub fn channels_on_between(&self, from: u64, to: u64) -> Vec<u32> {
        let from = from.max(self.start_index);
        let to = to.min(self.end_index);
        let mut union = ChannelMask::empty();
        for m in &self.mask_states {
            if m.start_index <= to && m.end_index >= from {
                union = union.union(&m.mask);
            }
        }
        union.channels_on()
    }

    /// The sampling rate in force at `index`, 0 outside the stream.
    pub fn rate_at(&self, index: u64) -> u32 {
        if index < self.start_index || index > self.end_index {
            return 0;
        }
        self.rate_states
            .iter()
            .find(|r| r.start_index <= index && index <= r.end_index)
            .map(|r| r.rate_hz)
            .unwrap_or(0)
    }

    /// Rates in force over the inclusive range, keyed by the index at which
    /// each takes effect (the first key is the clamped `from`).
    pub fn rates_between(&self, from: u64, to: u64) -> BTreeMap<u64, u32> {
        let from = from.max(self.start_index);
        let to = to.min(self.end_index);
        let mut rates = BTreeMap::new();
        if from > to {
            return rates;
        }
        rates.insert(from, self.rate_at(from));
        for r in &self.rate_states {
            if r.start_index > from && r.start_index <= to {
                rates.insert(r.start_index, r.rate_hz);
            }
        }
        rates
    }

    /// Seconds from the first scan to `index`, by summing each constant-rate
    /// region's `scans / rate`. 0 for indices outside the stream.
    pub fn time_at(&self, index: u64) -> f64 {
        if index < self.start_index || index > self.end_index {
            return 0.0;
        }
        let rates = self.rates_between(self.start_index, index);
        let mut total = 0.0;
        let mut iter = rates.iter().peekable();
        while let Some((region_start, rate)) = iter.next() {
            let region_end = iter
                .peek()
                .map(|(next_start, _)| **next_start - 1)
                .unwrap_or(index);
            if *rate > 0 {
                total += (region_end - region_start + 1) as f64 / f64::from(*rate);
            }
        }
        total
    }

    /// Recompute `max_unique_channels_used` from the mask periods.
    pub fn compute_max_unique_channels_used(&mut self) {
        let mut union = ChannelMask::empty();
        for m in &self.mask_states {
            union = union.union(&m.mask);
        }
        self.max_unique_channels_used = union.num_on() as u32;
    }

    /// Serialize into footer settings sections.
    pub fn serialize(&self, settings: &mut Settings) {
        const S: &str = "state history";
        settings.put(S, "start_index", self.start_index.to_string());
        settings.put(S, "end_index", self.end_index.to_string());
        settings.put(S, "sample_count", self.sample_count.to_string());
        settings.put(S, "scan_count", self.scan_count.to_string());
        settings.put(S, "time_started", self.time_started.to_string());
        settings.put(
            S,
            "max_unique_channels_used",
            self.max_unique_channels_used.to_string(),
        );
        settings.put(S, "num_mask_states", self.mask_states.len().to_string());
        settings.put(S, "num_rate_states", self.rate_states.len().to_string());
        let flat: Vec<String> = self
            .skipped_ranges
            .iter()
            .flat_map(|(f, t)| [f.to_string(), t.to_string()])
            .collect();
        settings.put(S, "skipped_ranges", flat.join(","));

        for (i, m) in self.mask_states.iter().enumerate() {
            let section = format!("mask state {}", i);
            settings.put(&section, "mask", to_hex(m.mask.as_bytes()));
            settings.put(&section, "start_index", m.start_index.to_string());
            settings.put(&section, "end_index", m.end_index.to_string());
        }
        for (i, r) in self.rate_states.iter().enumerate() {
            let section = format!("rate state {}", i);
            settings.put(&section, "rate_hz", r.rate_hz.to_string());
            settings.put(&section, "start_index", r.start_index.to_string());
            settings.put(&section, "end_index", r.end_index.to_string());
        }
    }

    /// Restore from footer settings sections.
    pub fn unserialize(settings: &Settings) -> DaqResult<StateHistory> {
        const S: &str = "state history";
        let mut history = StateHistory {
            start_index: get_u64(settings, S, "start_index")?,
            end_index: get_u64(settings, S, "end_index")?,
            sample_count: get_u64(settings, S, "sample_count")?,
            scan_count: get_u64(settings, S, "scan_count")?,
            time_started: get_u64(settings, S, "time_started")? as i64,
            max_unique_channels_used: get_u64(settings, S, "max_unique_channels_used")? as u32,
            ..StateHistory::default()
        };

        let skipped = settings.get(S, "skipped_ranges").unwrap_or("");
        if !skipped.is_empty() {
            let values: Vec<u64> = skipped
                .split(',')
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| {
                        DaqError::FileCorrupt(format!("bad skipped range value '{}'", v))
                    })
                })
                .collect::<DaqResult<_>>()?;
            if values.len() % 2 != 0 {
                return Err(DaqError::FileCorrupt(
                    "odd number of skipped range endpoints".to_string(),
                ));
            }
            history.skipped_ranges = values.chunks(2).map(|p| (p[0], p[1])).collect();
        }

        let n_masks = get_u64(settings, S, "num_mask_states")?;
        for i in 0..n_masks {
            let section = format!("mask state {}", i);
            let hex = settings
                .get(&section, "mask")
                .ok_or_else(|| DaqError::FileCorrupt(format!("missing [{}] mask", section)))?;
            let bytes = from_hex(hex)
                .ok_or_else(|| DaqError::FileCorrupt(format!("bad mask hex in [{}]", section)))?;
            let mut state = MaskState {
                mask: ChannelMask::from_bytes(&bytes),
                start_index: get_u64(settings, &section, "start_index")?,
                end_index: get_u64(settings, &section, "end_index")?,
                ..MaskState::default()
            };
            state.recompute();
            history.mask_states.push(state);
        }

        let n_rates = get_u64(settings, S, "num_rate_states")?;
        for i in 0..n_rates {
            let section = format!("rate state {}", i);
            history.rate_states.push(RateState {
                rate_hz: get_u64(settings, &section, "rate_hz")? as u32,
                start_index: get_u64(settings, &section, "start_index")?,
                end_index: get_u64(settings, &section, "end_index")?,
            });
        }

        Ok(history)
    }
}

fn get_u64(settings: &Settings, section: &str, key: &str) -> DaqResult<u64> {
    let value = settings
        .get(section, key)
        .ok_or_else(|| DaqError::FileCorrupt(format!("footer missing [{}] {}", section, key)))?;
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| DaqError::FileCorrupt(format!("bad [{}] {} value '{}'", section, key, value)))
}

/// Lowercase hex encoding for footer values.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Inverse of [`to_hex`]. None on odd length or non-hex digits.
pub(crate) fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_state(chans: &[u32], start: u64, end: u64) -> MaskState {
        let mut m = MaskState {
            mask: ChannelMask::from_channels(chans.iter().copied()),
            start_index: start,
            end_index: end,
            ..MaskState::default()
        };
        m.recompute();
        m
    }

    fn sample_history() -> StateHistory {
        let mut h = StateHistory {
            start_index: 0,
            end_index: 20,
            sample_count: 21,
            scan_count: 11,
            time_started: 1_000_000_000,
            skipped_ranges: vec![(10, 19)],
            mask_states: vec![mask_state(&[0, 1], 0, 9), mask_state(&[0], 10, 20)],
            rate_states: vec![
                RateState { rate_hz: 1000, start_index: 0, end_index: 4 },
                RateState { rate_hz: 2000, start_index: 5, end_index: 20 },
            ],
            ..StateHistory::default()
        };
        h.compute_max_unique_channels_used();
        h
    }

    #[test]
    fn mask_state_positions_are_dense() {
        let m = mask_state(&[3, 7, 200], 0, 0);
        assert_eq!(m.channels_on(), &[3, 7, 200]);
        assert_eq!(m.pos_of(3), Some(0));
        assert_eq!(m.pos_of(200), Some(2));
        assert_eq!(m.pos_of(4), None);
    }

    #[test]
    fn scan_count_subtracts_clamped_skips() {
        let h = sample_history();
        assert_eq!(h.scan_count_between(0, 20), 11);
        assert_eq!(h.scan_count_between(0, 9), 10);
        // window half-overlapping the skipped range
        assert_eq!(h.scan_count_between(5, 14), 5);
        assert_eq!(h.scan_count_between(30, 40), 0);
    }

    #[test]
    fn channels_on_unions_intersecting_masks() {
        let h = sample_history();
        assert_eq!(h.channels_on_between(0, 20), vec![0, 1]);
        assert_eq!(h.channels_on_between(10, 20), vec![0]);
        assert_eq!(h.channels_on_between(0, 5), vec![0, 1]);
    }

    #[test]
    fn rates_and_times() {
        let h = sample_history();
        assert_eq!(h.rate_at(4), 1000);
        assert_eq!(h.rate_at(5), 2000);
        assert_eq!(h.rate_at(21), 0);
        let rates = h.rates_between(0, 10);
        assert_eq!(rates.get(&0), Some(&1000));
        assert_eq!(rates.get(&5), Some(&2000));
        // 5 scans at 1000 Hz + 6 scans at 2000 Hz
        let t = h.time_at(10);
        assert!((t - 0.008).abs() < 1e-12, "time_at(10) = {}", t);
        // monotonically non-decreasing
        let mut prev = 0.0;
        for i in 0..=20 {
            let t = h.time_at(i);
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn settings_round_trip() {
        let h = sample_history();
        let mut settings = Settings::new();
        h.serialize(&mut settings);
        let restored = StateHistory::unserialize(&Settings::parse(&settings.render())).unwrap();

        assert_eq!(restored.start_index, h.start_index);
        assert_eq!(restored.end_index, h.end_index);
        assert_eq!(restored.sample_count, h.sample_count);
        assert_eq!(restored.scan_count, h.scan_count);
        assert_eq!(restored.time_started, h.time_started);
        assert_eq!(restored.skipped_ranges, h.skipped_ranges);
        assert_eq!(restored.max_unique_channels_used, 2);
        assert_eq!(restored.mask_states.len(), 2);
        assert_eq!(restored.mask_states[1].channels_on(), &[0]);
        assert_eq!(restored.rate_states.len(), 2);
        assert_eq!(restored.rate_states[1].rate_hz, 2000);
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00, 0x0f, 0xf0, 0xff, 0x42];
        assert_eq!(from_hex(&to_hex(&bytes)).unwrap(), bytes);
        assert!(from_hex("abc").is_none());
        assert!(from_hex("zz").is_none());
    }
}
