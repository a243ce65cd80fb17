//! The stream decoder.
//!
//! Reading walks the body one scalar at a time: a NaN-pattern scalar is an
//! instruction (executed immediately, mutating the decoder's mask, rate,
//! index, or user-data state); anything else is the first value of the next
//! scan, whose remaining `channels_on - 1` scalars are pulled into a cache and
//! handed out one sample at a time.
//!
//! A well-formed stream ends with a footer; [`DsdReader::open`] restores the
//! [`StateHistory`] from it, which answers all range queries without touching
//! the body. [`DsdReader::open_recovery`] skips the footer entirely and reads
//! until the first error or EOF — the repair path uses it to salvage streams
//! whose writer never reached `end()`.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::warn;

use crate::error::{DaqError, DaqResult};
use crate::sample::{ChannelMask, Sample};
use crate::settings::Settings;

use super::state::{from_hex, MaskState, RateState, StateHistory};
use super::{DataType, Instruction, INSTRUCTION_NAN_F32, INSTRUCTION_NAN_F64, MAGIC};

/// Byte length of the prelude (magic + data-type tag).
const PRELUDE_SIZE: u64 = 8;

/// Decodes an NDS/DSD stream from a seekable byte source.
#[derive(Debug)]
pub struct DsdReader<R: Read + Seek> {
    inp: R,
    data_type: DataType,
    history: StateHistory,
    has_footer: bool,
    /// Byte offset one past the last body byte.
    body_end: u64,
    /// Current byte offset within the source.
    pos: u64,
    mask_state: MaskState,
    rate_state: RateState,
    scan_data: Vec<f64>,
    /// Cached samples of the current scan not yet handed out.
    chans_this_scan: usize,
    current_index: u64,
    user_data: BTreeMap<String, Vec<u8>>,
    user_data_stale: bool,
    user_metadata: BTreeMap<String, Vec<u8>>,
}

impl<R: Read + Seek> DsdReader<R> {
    /// Open a well-formed stream, validating the prelude and footer.
    pub fn open(mut inp: R) -> DaqResult<Self> {
        let size = inp.seek(SeekFrom::End(0))?;
        let data_type = read_prelude(&mut inp, size)?;

        // End-anchored footer discovery: trailing (length, MAGIC) pair.
        if size < PRELUDE_SIZE + 8 {
            return Err(DaqError::FileCorruptNoFooter);
        }
        inp.seek(SeekFrom::Start(size - 8))?;
        let footer_len = u64::from(inp.read_u32::<LittleEndian>()?);
        let trailing_magic = inp.read_u32::<LittleEndian>()?;
        if trailing_magic != MAGIC {
            return Err(DaqError::FileCorruptNoFooter);
        }
        let footer_start = size
            .checked_sub(8 + footer_len)
            .ok_or(DaqError::FileCorruptNoFooter)?;
        if footer_start < PRELUDE_SIZE {
            return Err(DaqError::FileCorruptNoFooter);
        }
        inp.seek(SeekFrom::Start(footer_start))?;

        let mut footer = vec![0u8; footer_len as usize];
        inp.read_exact(&mut footer)?;
        let settings = Settings::parse(&String::from_utf8_lossy(&footer));
        let history = StateHistory::unserialize(&settings)?;

        let mut user_metadata = BTreeMap::new();
        for (hex_name, hex_value) in settings.section("user data") {
            let name = from_hex(&hex_name)
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or_else(|| DaqError::FileCorrupt("bad user metadata name".to_string()))?;
            let value = from_hex(&hex_value)
                .ok_or_else(|| DaqError::FileCorrupt("bad user metadata value".to_string()))?;
            user_metadata.insert(name, value);
        }

        inp.seek(SeekFrom::Start(PRELUDE_SIZE))?;
        Ok(DsdReader {
            inp,
            data_type,
            history,
            has_footer: true,
            body_end: footer_start,
            pos: PRELUDE_SIZE,
            mask_state: MaskState::default(),
            rate_state: RateState::default(),
            scan_data: Vec::new(),
            chans_this_scan: 0,
            current_index: 0,
            user_data: BTreeMap::new(),
            user_data_stale: false,
            user_metadata,
        })
    }

    /// Open a stream without trusting its footer (repair mode). Reading stops
    /// at the first decode error or EOF instead of a known end index.
    pub fn open_recovery(mut inp: R) -> DaqResult<Self> {
        let size = inp.seek(SeekFrom::End(0))?;
        let data_type = read_prelude(&mut inp, size)?;
        inp.seek(SeekFrom::Start(PRELUDE_SIZE))?;
        Ok(DsdReader {
            inp,
            data_type,
            history: StateHistory {
                end_index: u64::MAX,
                ..StateHistory::default()
            },
            has_footer: false,
            body_end: size,
            pos: PRELUDE_SIZE,
            mask_state: MaskState::default(),
            rate_state: RateState::default(),
            scan_data: Vec::new(),
            chans_this_scan: 0,
            current_index: 0,
            user_data: BTreeMap::new(),
            user_data_stale: false,
            user_metadata: BTreeMap::new(),
        })
    }

    /// Scalar width of this stream.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The footer metadata (defaults in recovery mode).
    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Index of the scan currently being handed out.
    pub fn scan_index(&self) -> u64 {
        self.current_index
    }

    /// The sampling rate currently in force in the body.
    pub fn sampling_rate(&self) -> u32 {
        self.rate_state.rate_hz
    }

    /// Channels of the scan currently being handed out, in value order.
    pub fn channels_on(&self) -> Vec<u32> {
        self.mask_state.channels_on().to_vec()
    }

    /// User data attached to the scan most recently read, by name.
    pub fn user_data(&self, name: &str) -> Option<&[u8]> {
        self.user_data.get(name).map(Vec::as_slice)
    }

    /// All user data attached to the scan most recently read.
    pub fn user_data_map(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.user_data
    }

    /// All user data pairs recorded in the footer.
    pub fn user_metadata(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.user_metadata
    }

    // ---- footer-backed queries ----

    /// First scan index in the stream.
    pub fn start_index(&self) -> u64 {
        self.history.start_index
    }

    /// Last scan index in the stream.
    pub fn end_index(&self) -> u64 {
        self.history.end_index
    }

    /// Number of scans present in the whole stream.
    pub fn scan_count(&self) -> u64 {
        self.history.scan_count
    }

    /// Scans present in an inclusive index range.
    pub fn scan_count_between(&self, from: u64, to: u64) -> u64 {
        self.history.scan_count_between(from, to)
    }

    /// Total scalar values in the stream.
    pub fn sample_count(&self) -> u64 {
        self.history.sample_count
    }

    /// Number of distinct channels used anywhere in the stream.
    pub fn max_unique_channels_used(&self) -> u32 {
        self.history.max_unique_channels_used
    }

    /// Union of channels enabled anywhere in an inclusive index range.
    pub fn channels_on_between(&self, from: u64, to: u64) -> Vec<u32> {
        self.history.channels_on_between(from, to)
    }

    /// The sampling rate in force at an index.
    pub fn rate_at(&self, index: u64) -> u32 {
        self.history.rate_at(index)
    }

    /// Rates in force over an inclusive range, keyed by effective index.
    pub fn rates_between(&self, from: u64, to: u64) -> BTreeMap<u64, u32> {
        self.history.rates_between(from, to)
    }

    /// Seconds from the stream start to an index.
    pub fn time_at(&self, index: u64) -> f64 {
        self.history.time_at(index)
    }

    /// Unix time the first sample was written.
    pub fn time_started(&self) -> i64 {
        self.history.time_started
    }

    /// Wall-clock time at an index, unix seconds.
    pub fn wall_clock_time_at(&self, index: u64) -> f64 {
        let relative = self.history.time_at(index);
        if relative == 0.0 && index != self.history.start_index {
            return 0.0;
        }
        self.history.time_started as f64 + relative
    }

    /// Whether a channel was enabled at an index.
    pub fn is_chan_on(&self, chan: u32, index: u64) -> bool {
        self.history.is_chan_on(chan, index)
    }

    // ---- body iteration ----

    /// Read the next sample, or `None` at the end of the stream.
    pub fn read_next_sample(&mut self) -> DaqResult<Option<Sample>> {
        loop {
            if self.chans_this_scan > 0 {
                return Ok(Some(self.take_cached()));
            }
            if self.current_index > self.history.end_index {
                return Ok(None);
            }
            if self.user_data_stale {
                self.user_data.clear();
                self.user_data_stale = false;
            }

            let Some((value, is_insn)) = self.read_scalar()? else {
                return Ok(None);
            };
            if is_insn {
                if !self.do_insn()? {
                    return Ok(None);
                }
                continue;
            }

            let n = self.mask_state.mask.num_on();
            if n == 0 {
                // data with no mask in force can't be attributed to a channel
                continue;
            }
            self.scan_data.resize(n, 0.0);
            self.scan_data[0] = value;
            for i in 1..n {
                match self.read_scalar()? {
                    Some((v, false)) => self.scan_data[i] = v,
                    Some((_, true)) => {
                        return if self.has_footer {
                            Err(DaqError::FileCorrupt(
                                "instruction in the middle of a scan".to_string(),
                            ))
                        } else {
                            Ok(None)
                        };
                    }
                    None => {
                        return if self.has_footer {
                            Err(DaqError::FileCorrupt("truncated scan".to_string()))
                        } else {
                            Ok(None)
                        };
                    }
                }
            }
            self.chans_this_scan = n;
        }
    }

    /// Read the next full scan as a channel-id -> sample map, or `None` at
    /// the end of the stream. User data attached to the scan stays readable
    /// via [`DsdReader::user_data`] until the next scan is read.
    pub fn read_next_scan(&mut self) -> DaqResult<Option<BTreeMap<u32, Sample>>> {
        let Some(first) = self.read_next_sample()? else {
            return Ok(None);
        };
        let mut scan = BTreeMap::new();
        scan.insert(u32::from(first.channel_id), first);
        while self.chans_this_scan > 0 {
            match self.read_next_sample()? {
                Some(s) => {
                    scan.insert(u32::from(s.channel_id), s);
                }
                None => break,
            }
        }
        Ok(Some(scan))
    }

    /// Position the stream at `target`: forward by iterating scans, backward
    /// by rewinding to the prelude and iterating forward.
    pub fn seek(&mut self, target: u64) -> DaqResult<()> {
        if target < self.current_index {
            self.inp.seek(SeekFrom::Start(PRELUDE_SIZE))?;
            self.pos = PRELUDE_SIZE;
            self.chans_this_scan = 0;
            self.current_index = 0;
            self.mask_state = MaskState::default();
            self.rate_state = RateState::default();
            self.scan_data.clear();
            self.user_data.clear();
            self.user_data_stale = false;
        }
        while self.current_index < target {
            if self.read_next_scan()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn take_cached(&mut self) -> Sample {
        let n = self.mask_state.mask.num_on();
        let pos = n - self.chans_this_scan;
        let chan = self.mask_state.channels_on()[pos];
        let value = self.scan_data[pos];
        let sample = Sample::new(chan as u8, self.current_index, 0, value as u32);
        self.chans_this_scan -= 1;
        if self.chans_this_scan == 0 {
            self.mask_state.end_index = self.current_index;
            self.rate_state.end_index = self.current_index;
            self.current_index += 1;
            self.user_data_stale = true;
        }
        sample
    }

    /// Read one scalar, reporting whether it is the instruction escape.
    /// `None` at the end of the body.
    fn read_scalar(&mut self) -> DaqResult<Option<(f64, bool)>> {
        let size = self.data_type.scalar_size() as u64;
        if self.pos + size > self.body_end {
            return Ok(None);
        }
        match self.data_type {
            DataType::Float => {
                let bits = self.inp.read_u32::<LittleEndian>()?;
                self.pos += 4;
                Ok(Some((
                    f64::from(f32::from_bits(bits)),
                    bits == INSTRUCTION_NAN_F32,
                )))
            }
            DataType::Double => {
                let bits = self.inp.read_u64::<LittleEndian>()?;
                self.pos += 8;
                Ok(Some((f64::from_bits(bits), bits == INSTRUCTION_NAN_F64)))
            }
        }
    }

    fn payload_u32(&mut self) -> DaqResult<Option<u32>> {
        if self.pos + 4 > self.body_end {
            return Ok(None);
        }
        let v = self.inp.read_u32::<LittleEndian>()?;
        self.pos += 4;
        Ok(Some(v))
    }

    fn payload_u64(&mut self) -> DaqResult<Option<u64>> {
        if self.pos + 8 > self.body_end {
            return Ok(None);
        }
        let v = self.inp.read_u64::<LittleEndian>()?;
        self.pos += 8;
        Ok(Some(v))
    }

    fn payload_bytes(&mut self, len: usize) -> DaqResult<Option<Vec<u8>>> {
        if self.pos + len as u64 > self.body_end {
            return Ok(None);
        }
        let mut buf = vec![0u8; len];
        self.inp.read_exact(&mut buf)?;
        self.pos += len as u64;
        Ok(Some(buf))
    }

    fn truncated(&self) -> DaqResult<bool> {
        if self.has_footer {
            Err(DaqError::FileCorrupt("truncated instruction".to_string()))
        } else {
            Ok(false)
        }
    }

    /// Execute one instruction. `Ok(false)` means the body ended inside the
    /// instruction (recovery mode only).
    fn do_insn(&mut self) -> DaqResult<bool> {
        let Some(code) = self.payload_u32()? else {
            return self.truncated();
        };
        match Instruction::from_code(code) {
            None => Err(DaqError::UnknownInstruction(code)),
            Some(Instruction::MaskChanged) => {
                let Some(bit_len) = self.payload_u32()? else {
                    return self.truncated();
                };
                let n_bytes = (bit_len as usize).div_ceil(8);
                let Some(bytes) = self.payload_bytes(n_bytes)? else {
                    return self.truncated();
                };
                let Some(count) = self.payload_u32()? else {
                    return self.truncated();
                };
                let mask = ChannelMask::from_bytes(&bytes);
                if mask.num_on() != count as usize {
                    return if self.has_footer {
                        Err(DaqError::FileCorrupt(format!(
                            "mask claims {} channels but has {}",
                            count,
                            mask.num_on()
                        )))
                    } else {
                        Ok(false)
                    };
                }
                self.mask_state.mask = mask;
                self.mask_state.start_index = self.current_index;
                self.mask_state.recompute();
                Ok(true)
            }
            Some(Instruction::RateChanged) => {
                let Some(rate) = self.payload_u32()? else {
                    return self.truncated();
                };
                self.rate_state.rate_hz = rate;
                self.rate_state.start_index = self.current_index;
                Ok(true)
            }
            Some(Instruction::IndexChanged) => {
                let Some(index) = self.payload_u64()? else {
                    return self.truncated();
                };
                if index < self.current_index {
                    warn!(
                        from = self.current_index,
                        to = index,
                        "scan index moved backward (legacy stream); accepting"
                    );
                }
                self.current_index = index;
                Ok(true)
            }
            Some(Instruction::UserData) => {
                let Some(name_len) = self.payload_u32()? else {
                    return self.truncated();
                };
                let Some(name) = self.payload_bytes(name_len as usize)? else {
                    return self.truncated();
                };
                let Some(data_len) = self.payload_u32()? else {
                    return self.truncated();
                };
                let Some(data) = self.payload_bytes(data_len as usize)? else {
                    return self.truncated();
                };
                self.user_data
                    .insert(String::from_utf8_lossy(&name).into_owned(), data);
                Ok(true)
            }
        }
    }
}

fn read_prelude<R: Read + Seek>(inp: &mut R, size: u64) -> DaqResult<DataType> {
    if size < PRELUDE_SIZE {
        return Err(DaqError::FileCorrupt("shorter than the prelude".to_string()));
    }
    inp.seek(SeekFrom::Start(0))?;
    let magic = inp.read_u32::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(DaqError::FileCorrupt(format!(
            "bad magic {:#010x}: not an NDS/DSD stream",
            magic
        )));
    }
    let tag = inp.read_u32::<LittleEndian>()?;
    DataType::from_tag(tag)
        .ok_or_else(|| DaqError::FileCorrupt(format!("unknown data type tag {}", tag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsd::writer::DsdWriter;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    fn write_two_channel_stream() -> Vec<u8> {
        let mut w = DsdWriter::new(Cursor::new(Vec::new()), 1000, DataType::Double);
        for idx in 0..4u64 {
            w.write_sample(&Sample::new(0, idx, 0, (idx * 10 + 1) as u32)).unwrap();
            w.write_sample(&Sample::new(1, idx, 0, (idx * 10 + 2) as u32)).unwrap();
        }
        w.end().unwrap().into_inner()
    }

    #[test]
    fn round_trip_preserves_order_and_values() {
        let bytes = write_two_channel_stream();
        let mut r = DsdReader::open(Cursor::new(bytes)).unwrap();

        assert_eq!(r.scan_count(), 4);
        assert_eq!(r.sample_count(), 8);
        for idx in 0..4u64 {
            let scan = r.read_next_scan().unwrap().unwrap();
            assert_eq!(scan.len(), 2);
            assert_eq!(scan[&0].data, (idx * 10 + 1) as u32);
            assert_eq!(scan[&1].data, (idx * 10 + 2) as u32);
            assert_eq!(scan[&0].scan_index, idx);
            assert!(!scan[&0].is_spike());
        }
        assert!(r.read_next_scan().unwrap().is_none());
    }

    #[test]
    fn missing_footer_is_reported_as_such() {
        let mut bytes = write_two_channel_stream();
        bytes.truncate(bytes.len() - 6); // destroy the trailing magic
        let err = DsdReader::open(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DaqError::FileCorruptNoFooter));
    }

    #[test]
    fn recovery_mode_reads_a_footerless_body() {
        let full = write_two_channel_stream();
        // drop the footer and tear the last scan in half, as a crash would
        let mut tail = Cursor::new(&full[full.len() - 8..]);
        let footer_len = tail.read_u32::<LittleEndian>().unwrap() as usize;
        let body_len = full.len() - (footer_len + 8);
        let cut = body_len - 8;

        let mut r = DsdReader::open_recovery(Cursor::new(full[..cut].to_vec())).unwrap();
        let mut n = 0;
        while let Some(s) = r.read_next_sample().unwrap() {
            assert!(s.scan_index < 4);
            n += 1;
        }
        // 3 whole scans survive; the torn final scan is dropped
        assert_eq!(n, 6);
    }

    #[test]
    fn backward_index_jump_is_accepted_on_read() {
        // hand-assemble: prelude, mask {0}, then one scan at index 5,
        // an INDEX_CHANGED back to 2, and another scan
        let mut out = Cursor::new(Vec::new());
        out.write_u32::<LittleEndian>(MAGIC).unwrap();
        out.write_u32::<LittleEndian>(DataType::Double as u32).unwrap();
        // mask instruction
        out.write_u64::<LittleEndian>(INSTRUCTION_NAN_F64).unwrap();
        out.write_u32::<LittleEndian>(1).unwrap();
        out.write_u32::<LittleEndian>(8).unwrap();
        out.write_u8(0b0000_0001).unwrap();
        out.write_u32::<LittleEndian>(1).unwrap();
        // index -> 5
        out.write_u64::<LittleEndian>(INSTRUCTION_NAN_F64).unwrap();
        out.write_u32::<LittleEndian>(3).unwrap();
        out.write_u64::<LittleEndian>(5).unwrap();
        out.write_f64::<LittleEndian>(11.0).unwrap();
        // index -> 2 (backward)
        out.write_u64::<LittleEndian>(INSTRUCTION_NAN_F64).unwrap();
        out.write_u32::<LittleEndian>(3).unwrap();
        out.write_u64::<LittleEndian>(2).unwrap();
        out.write_f64::<LittleEndian>(22.0).unwrap();

        let mut r = DsdReader::open_recovery(Cursor::new(out.into_inner())).unwrap();
        let a = r.read_next_sample().unwrap().unwrap();
        assert_eq!((a.scan_index, a.data), (5, 11));
        let b = r.read_next_sample().unwrap().unwrap();
        assert_eq!((b.scan_index, b.data), (2, 22));
    }

    #[test]
    fn unknown_instruction_is_fatal() {
        let mut out = Cursor::new(Vec::new());
        out.write_u32::<LittleEndian>(MAGIC).unwrap();
        out.write_u32::<LittleEndian>(DataType::Float as u32).unwrap();
        out.write_u32::<LittleEndian>(INSTRUCTION_NAN_F32).unwrap();
        out.write_u32::<LittleEndian>(0x99).unwrap();

        let mut r = DsdReader::open_recovery(Cursor::new(out.into_inner())).unwrap();
        assert!(matches!(
            r.read_next_sample(),
            Err(DaqError::UnknownInstruction(0x99))
        ));
    }

    #[test]
    fn seek_rewinds_and_fast_forwards() {
        let bytes = write_two_channel_stream();
        let mut r = DsdReader::open(Cursor::new(bytes)).unwrap();

        r.seek(2).unwrap();
        let scan = r.read_next_scan().unwrap().unwrap();
        assert_eq!(scan[&0].scan_index, 2);

        // backward: rewind + replay
        r.seek(1).unwrap();
        let scan = r.read_next_scan().unwrap().unwrap();
        assert_eq!(scan[&0].scan_index, 1);
        assert_eq!(scan[&0].data, 11);
    }

    #[test]
    fn per_scan_user_data_is_scoped_to_its_scan() {
        let mut w = DsdWriter::new(Cursor::new(Vec::new()), 1000, DataType::Double);
        w.write_sample(&Sample::new(0, 0, 0, 1)).unwrap();
        // staged while scan 0 is pending: attaches to scan 0
        w.write_user_data("marker", b"stim-on");
        w.write_sample(&Sample::new(0, 1, 0, 2)).unwrap();
        w.write_sample(&Sample::new(0, 2, 0, 3)).unwrap();
        let bytes = w.end().unwrap().into_inner();

        let mut r = DsdReader::open(Cursor::new(bytes)).unwrap();
        r.read_next_scan().unwrap().unwrap();
        assert_eq!(r.user_data("marker"), Some(&b"stim-on"[..]));
        r.read_next_scan().unwrap().unwrap();
        assert_eq!(r.user_data("marker"), None);
        r.read_next_scan().unwrap().unwrap();
        assert_eq!(r.user_data("marker"), None);
        // and it made it into the footer map
        assert_eq!(r.user_metadata().get("marker").map(Vec::as_slice), Some(&b"stim-on"[..]));
    }

    #[test]
    fn float_stream_round_trips_small_values() {
        let mut w = DsdWriter::new(Cursor::new(Vec::new()), 100, DataType::Float);
        for idx in 0..3u64 {
            w.write_sample(&Sample::new(5, idx, 0, 1000 + idx as u32)).unwrap();
        }
        let bytes = w.end().unwrap().into_inner();
        let mut r = DsdReader::open(Cursor::new(bytes)).unwrap();
        for idx in 0..3u64 {
            let s = r.read_next_sample().unwrap().unwrap();
            assert_eq!(s.channel_id, 5);
            assert_eq!(s.data, 1000 + idx as u32);
        }
        assert!(r.read_next_sample().unwrap().is_none());
    }
}
