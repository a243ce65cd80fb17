//! The stream encoder.
//!
//! Scans are written densely: each scan is zero or more instructions followed
//! by one scalar per enabled channel, in mask order. Mask, rate, and index
//! changes are staged as flags and emitted as instructions immediately before
//! the scan they precede; user data is staged per scan the same way.
//!
//! `write_sample` tolerates samples arriving in any channel order within a
//! scan, auto-senses channels that were not yet in the mask, and rejects scan
//! indices that move backward. `end` closes the open mask/rate intervals and
//! serializes the footer; a stream that never reaches `end` (crash) stays
//! recoverable through the repair path.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;
use tracing::warn;

use crate::error::{DaqError, DaqResult};
use crate::sample::{Sample, CHAN_MASK_BYTES, MAX_CHANNELS};
use crate::settings::{Section, Settings};

use super::state::{to_hex, MaskState, RateState, StateHistory};
use super::{DataType, Instruction, INSTRUCTION_NAN_F32, INSTRUCTION_NAN_F64, MAGIC};

/// Encodes scans into a byte sink in the NDS/DSD format.
pub struct DsdWriter<W: Write> {
    out: W,
    data_type: DataType,
    history: StateHistory,
    mask_state: MaskState,
    rate_state: RateState,
    scan_data: Vec<f64>,
    /// Index of the scan currently being assembled.
    current_index: u64,
    /// Index of the last scan flushed to the sink.
    last_index: u64,
    wrote_prelude: bool,
    first_sample_seen: bool,
    flush_pending: bool,
    mask_changed_this_scan: bool,
    rate_changed_this_scan: bool,
    index_changed_this_scan: bool,
    pending_user_data: BTreeMap<String, Vec<u8>>,
    user_metadata: BTreeMap<String, Vec<u8>>,
    remove_queue: BTreeMap<u64, BTreeSet<u32>>,
}

impl<W: Write> DsdWriter<W> {
    /// Start a stream over `out` at the given initial sampling rate.
    pub fn new(out: W, rate_hz: u32, data_type: DataType) -> Self {
        let rate_state = RateState {
            rate_hz: rate_hz.max(1),
            start_index: 0,
            end_index: 0,
        };
        DsdWriter {
            out,
            data_type,
            history: StateHistory::default(),
            mask_state: MaskState::default(),
            rate_state,
            scan_data: Vec::new(),
            current_index: 0,
            last_index: 0,
            wrote_prelude: false,
            first_sample_seen: false,
            flush_pending: false,
            mask_changed_this_scan: false,
            // the initial rate is announced before the first scan
            rate_changed_this_scan: true,
            index_changed_this_scan: false,
            pending_user_data: BTreeMap::new(),
            user_metadata: BTreeMap::new(),
            remove_queue: BTreeMap::new(),
        }
    }

    /// Index of the scan currently being assembled.
    pub fn scan_index(&self) -> u64 {
        self.current_index
    }

    /// Number of distinct scans seen so far.
    pub fn scan_count(&self) -> u64 {
        self.history.scan_count
    }

    /// Number of scalars flushed so far.
    pub fn sample_count(&self) -> u64 {
        self.history.sample_count
    }

    /// The sampling rate currently in force.
    pub fn sampling_rate(&self) -> u32 {
        self.rate_state.rate_hz
    }

    /// Scalar width of this stream.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The accumulated stream metadata (finalized by [`DsdWriter::end`]).
    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Write one sample.
    ///
    /// A sample with a higher scan index than the current scan flushes the
    /// pending scan first; a lower index fails with `OutOfOrderSample`.
    pub fn write_sample(&mut self, s: &Sample) -> DaqResult<()> {
        if !self.wrote_prelude {
            self.write_prelude()?;
        }
        let chan = u32::from(s.channel_id);

        if !self.first_sample_seen {
            self.first_sample_seen = true;
            self.current_index = s.scan_index;
            self.last_index = s.scan_index;
            self.history.start_index = s.scan_index;
            self.history.end_index = s.scan_index;
            self.history.scan_count = 1;
            self.mask_state.start_index = s.scan_index;
            self.mask_state.end_index = s.scan_index;
            self.rate_state.start_index = s.scan_index;
            self.rate_state.end_index = s.scan_index;
            if s.scan_index != 0 {
                // announce the true starting index to readers
                self.index_changed_this_scan = true;
            }
        } else if s.scan_index < self.current_index {
            return Err(DaqError::OutOfOrderSample {
                current: self.current_index,
                got: s.scan_index,
            });
        } else if s.scan_index > self.current_index {
            self.flush_scan()?;
            self.history.scan_count += 1;
            self.set_scan_index(s.scan_index);
        }

        if !self.mask_state.mask.is_on(chan) {
            self.add_channel(chan);
        }
        if let Some(pos) = self.mask_state.pos_of(chan) {
            self.scan_data[pos] = f64::from(s.data);
        }
        self.flush_pending = true;
        Ok(())
    }

    /// Change the sampling rate. Call between full scans: the change takes
    /// effect at the scan index after the current one.
    pub fn set_sampling_rate(&mut self, rate_hz: u32) {
        let rate_hz = rate_hz.max(1);
        if !self.first_sample_seen {
            self.rate_state.rate_hz = rate_hz;
            return;
        }
        if rate_hz == self.rate_state.rate_hz {
            return;
        }
        self.history.rate_states.push(self.rate_state.clone());
        self.rate_state.start_index = self.rate_state.end_index + 1;
        self.rate_state.end_index = self.rate_state.start_index;
        self.rate_state.rate_hz = rate_hz;
        self.rate_changed_this_scan = true;
    }

    /// Attach a named byte blob to the scan currently being assembled; the
    /// instruction is emitted immediately before that scan's scalars. The
    /// pair is also recorded in the footer's user-metadata map.
    pub fn write_user_data(&mut self, name: &str, data: &[u8]) {
        self.pending_user_data
            .insert(name.to_owned(), data.to_vec());
    }

    /// Schedule `chan` to stop producing data once the scan index has passed
    /// `future_index`. If the channel produces a sample after that, it is
    /// auto-sensed back on; an auto-sense before that cancels the removal.
    pub fn remove_channel_after(&mut self, chan: u32, future_index: u64) {
        if future_index < self.current_index || chan as usize >= MAX_CHANNELS {
            return;
        }
        self.remove_queue.entry(future_index).or_default().insert(chan);
    }

    /// The channels currently in the mask, in scan value order.
    pub fn channels_on(&self) -> Vec<u32> {
        self.mask_state.mask.channels_on()
    }

    /// Flush the pending scan, close the open intervals, serialize the
    /// footer, and hand the sink back.
    pub fn end(mut self) -> DaqResult<W> {
        if !self.wrote_prelude {
            self.write_prelude()?;
        }
        self.flush_scan()?;
        self.mask_state.end_index = self.current_index;
        self.rate_state.end_index = self.current_index;
        self.history.end_index = self.current_index;
        let mask_state = std::mem::take(&mut self.mask_state);
        let rate_state = std::mem::take(&mut self.rate_state);
        self.history.mask_states.push(mask_state);
        self.history.rate_states.push(rate_state);
        self.history.compute_max_unique_channels_used();

        let mut settings = Settings::new();
        let mut user = Section::new();
        for (name, data) in &self.user_metadata {
            user.insert(to_hex(name.as_bytes()), to_hex(data));
        }
        settings.put_section("user data", user);
        self.history.serialize(&mut settings);
        let footer = settings.render().into_bytes();

        self.out.write_all(&footer)?;
        self.out.write_u32::<LittleEndian>(footer.len() as u32)?;
        self.out.write_u32::<LittleEndian>(MAGIC)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_prelude(&mut self) -> DaqResult<()> {
        self.out.write_u32::<LittleEndian>(MAGIC)?;
        self.out.write_u32::<LittleEndian>(self.data_type as u32)?;
        self.history.time_started = Utc::now().timestamp();
        self.wrote_prelude = true;
        Ok(())
    }

    /// Advance to a new (strictly greater) scan index, recording any gap.
    fn set_scan_index(&mut self, index: u64) {
        if index > self.current_index + 1 {
            self.index_changed_this_scan = true;
            self.history
                .skipped_ranges
                .push((self.current_index + 1, index - 1));
        }
        self.current_index = index;
        self.history.end_index = index;
        self.mask_state.end_index = index;
        self.rate_state.end_index = index;

        let due: Vec<u64> = self
            .remove_queue
            .range(..index)
            .map(|(k, _)| *k)
            .collect();
        for key in due {
            if let Some(chans) = self.remove_queue.remove(&key) {
                for chan in chans {
                    self.remove_channel(chan);
                }
            }
        }
    }

    fn begin_mask_change(&mut self) {
        if self.mask_changed_this_scan {
            return;
        }
        // Close the old interval, unless the stream has not produced anything
        // under it yet (the very first mask of the stream).
        if !(self.history.mask_states.is_empty() && self.mask_state.mask.is_empty()) {
            let mut closed = self.mask_state.clone();
            closed.end_index = self.last_index;
            self.history.mask_states.push(closed);
        }
        self.mask_state.start_index = self.current_index;
        self.mask_state.end_index = self.current_index;
        self.mask_changed_this_scan = true;
    }

    fn add_channel(&mut self, chan: u32) {
        self.begin_mask_change();
        self.mask_state.mask.set(chan, true);
        // most recent explicit operation wins over a scheduled removal
        self.remove_queue.retain(|_, chans| {
            chans.remove(&chan);
            !chans.is_empty()
        });
        self.remap_scan_data();
    }

    fn remove_channel(&mut self, chan: u32) {
        self.begin_mask_change();
        self.mask_state.mask.set(chan, false);
        self.remap_scan_data();
    }

    /// Recompute the dense channel order and carry current values across.
    fn remap_scan_data(&mut self) {
        let old_channels = self.mask_state.channels_on().to_vec();
        let old_data = std::mem::take(&mut self.scan_data);
        self.mask_state.recompute();
        self.scan_data = vec![0.0; self.mask_state.channels_on().len()];
        for (i, chan) in old_channels.iter().enumerate() {
            if let (Some(pos), Some(value)) = (self.mask_state.pos_of(*chan), old_data.get(i)) {
                self.scan_data[pos] = *value;
            }
        }
    }

    /// Emit the pending instructions and the pending scan's scalars.
    fn flush_scan(&mut self) -> DaqResult<()> {
        if !self.flush_pending {
            return Ok(());
        }
        if self.mask_changed_this_scan {
            self.put_insn(Instruction::MaskChanged)?;
            self.out
                .write_u32::<LittleEndian>(MAX_CHANNELS as u32)?;
            self.out.write_all(&self.mask_state.mask.as_bytes()[..CHAN_MASK_BYTES])?;
            self.out
                .write_u32::<LittleEndian>(self.mask_state.mask.num_on() as u32)?;
        }
        if self.rate_changed_this_scan {
            self.put_insn(Instruction::RateChanged)?;
            self.out.write_u32::<LittleEndian>(self.rate_state.rate_hz)?;
        }
        if self.index_changed_this_scan {
            self.put_insn(Instruction::IndexChanged)?;
            self.out.write_u64::<LittleEndian>(self.current_index)?;
        }
        let staged = std::mem::take(&mut self.pending_user_data);
        for (name, data) in staged {
            self.put_insn(Instruction::UserData)?;
            self.out.write_u32::<LittleEndian>(name.len() as u32)?;
            self.out.write_all(name.as_bytes())?;
            self.out.write_u32::<LittleEndian>(data.len() as u32)?;
            self.out.write_all(&data)?;
            self.user_metadata.insert(name, data);
        }

        for i in 0..self.scan_data.len() {
            let value = self.scan_data[i];
            self.put_scalar(value)?;
            self.history.sample_count += 1;
        }

        self.flush_pending = false;
        self.mask_changed_this_scan = false;
        self.rate_changed_this_scan = false;
        self.index_changed_this_scan = false;
        self.last_index = self.current_index;
        Ok(())
    }

    fn put_scalar(&mut self, value: f64) -> DaqResult<()> {
        let value = if value.is_nan() {
            warn!("NaN data value sanitized to +inf to keep the instruction escape unambiguous");
            f64::INFINITY
        } else {
            value
        };
        match self.data_type {
            DataType::Float => self.out.write_f32::<LittleEndian>(value as f32)?,
            DataType::Double => self.out.write_f64::<LittleEndian>(value)?,
        }
        Ok(())
    }

    fn put_insn(&mut self, insn: Instruction) -> DaqResult<()> {
        match self.data_type {
            DataType::Float => self.out.write_u32::<LittleEndian>(INSTRUCTION_NAN_F32)?,
            DataType::Double => self.out.write_u64::<LittleEndian>(INSTRUCTION_NAN_F64)?,
        }
        self.out.write_u32::<LittleEndian>(insn as u32)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::{Cursor, Read};

    #[test]
    fn prelude_is_magic_then_data_type() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 1000, DataType::Double);
        w.write_sample(&Sample::new(0, 0, 0, 1)).unwrap();
        let bytes = w.end().unwrap().into_inner();

        let mut r = Cursor::new(&bytes);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), MAGIC);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), 1);
    }

    #[test]
    fn stream_ends_with_length_and_magic() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 1000, DataType::Float);
        w.write_sample(&Sample::new(0, 0, 0, 1)).unwrap();
        let bytes = w.end().unwrap().into_inner();

        let mut r = Cursor::new(&bytes[bytes.len() - 8..]);
        let footer_len = r.read_u32::<LittleEndian>().unwrap() as usize;
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), MAGIC);

        // the footer bytes sit immediately before the trailing length
        let footer_start = bytes.len() - 8 - footer_len;
        let mut r = Cursor::new(&bytes[footer_start..]);
        let mut footer = vec![0u8; footer_len];
        r.read_exact(&mut footer).unwrap();
        let text = String::from_utf8(footer).unwrap();
        assert!(text.contains("[state history]"));
    }

    #[test]
    fn first_scan_is_preceded_by_mask_and_rate_instructions() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 500, DataType::Float);
        w.write_sample(&Sample::new(3, 0, 0, 7)).unwrap();
        let bytes = w.end().unwrap().into_inner();

        let mut r = Cursor::new(&bytes[8..]);
        // mask instruction
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), INSTRUCTION_NAN_F32);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), 1);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), MAX_CHANNELS as u32);
        let mut mask = [0u8; CHAN_MASK_BYTES];
        r.read_exact(&mut mask).unwrap();
        assert_eq!(mask[0], 0b0000_1000);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), 1);
        // rate instruction
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), INSTRUCTION_NAN_F32);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), 2);
        assert_eq!(r.read_u32::<LittleEndian>().unwrap(), 500);
        // the scan's single scalar
        assert_eq!(r.read_f32::<LittleEndian>().unwrap(), 7.0);
    }

    #[test]
    fn out_of_order_scan_is_rejected() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 1000, DataType::Float);
        w.write_sample(&Sample::new(0, 5, 0, 1)).unwrap();
        w.write_sample(&Sample::new(0, 6, 0, 2)).unwrap();
        let err = w.write_sample(&Sample::new(0, 4, 0, 3)).unwrap_err();
        assert!(matches!(
            err,
            DaqError::OutOfOrderSample { current: 6, got: 4 }
        ));
    }

    #[test]
    fn skipped_scans_are_recorded() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 1000, DataType::Double);
        w.write_sample(&Sample::new(0, 0, 0, 1)).unwrap();
        w.write_sample(&Sample::new(0, 10, 0, 2)).unwrap();
        assert_eq!(w.history().skipped_ranges, vec![(1, 9)]);
        assert_eq!(w.scan_count(), 2);
        w.end().unwrap();
    }

    #[test]
    fn nonzero_start_does_not_fabricate_a_skip() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 1000, DataType::Double);
        w.write_sample(&Sample::new(0, 40, 0, 1)).unwrap();
        assert!(w.history().skipped_ranges.is_empty());
        assert_eq!(w.history().start_index, 40);
        w.end().unwrap();
    }

    #[test]
    fn scheduled_removal_fires_and_explicit_readd_cancels() {
        let out = Cursor::new(Vec::new());
        let mut w = DsdWriter::new(out, 1000, DataType::Double);
        w.write_sample(&Sample::new(0, 0, 0, 1)).unwrap();
        w.write_sample(&Sample::new(1, 0, 0, 2)).unwrap();
        w.remove_channel_after(1, 2);

        // scan 1 and 2: channel 1 still present
        for idx in 1..=2 {
            w.write_sample(&Sample::new(0, idx, 0, 1)).unwrap();
            w.write_sample(&Sample::new(1, idx, 0, 2)).unwrap();
        }
        // at scan 3 the removal (after index 2) fires
        w.write_sample(&Sample::new(0, 3, 0, 1)).unwrap();
        assert!(!w.history().mask_states.is_empty());
        assert_eq!(w.channels_on(), vec![0]);

        // writing channel 1 again auto-senses it back on
        w.write_sample(&Sample::new(1, 4, 0, 2)).unwrap();
        assert_eq!(w.channels_on(), vec![0, 1]);
        w.end().unwrap();
    }
}
