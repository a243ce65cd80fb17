//! The sample reader: drives a source and accounts for dropped scans.
//!
//! Wraps one [`SampleSource`] and tracks, per channel, the last scan index
//! seen. A gap between consecutive indices on the same channel means the
//! producer dropped scans (it never blocks); the reader counts the gap but
//! does not treat it as an error.

use std::time::Duration;

use crate::error::DaqResult;
use crate::sample::{ChannelMask, Sample, MAX_CHANNELS};
use crate::source::SampleSource;

/// Reads from a source, detecting drops and keeping counters.
pub struct SampleReader {
    source: Box<dyn SampleSource + Send>,
    /// How long `read_all` may block for the first record. `None` blocks
    /// indefinitely.
    block_time: Option<Duration>,
    started: bool,
    scan_started_index: u64,
    last_seen: Box<[u64; MAX_CHANNELS]>,
    seen_once: ChannelMask,
    total_read: u64,
    total_dropped: u64,
    last_read: usize,
    last_dropped: u64,
}

impl SampleReader {
    /// Build a reader over `source`. `block_time` bounds each read's wait for
    /// the first record; `None` means wait indefinitely.
    pub fn new(source: Box<dyn SampleSource + Send>, block_time: Option<Duration>) -> Self {
        SampleReader {
            source,
            block_time,
            started: false,
            scan_started_index: 0,
            last_seen: Box::new([0; MAX_CHANNELS]),
            seen_once: ChannelMask::empty(),
            total_read: 0,
            total_dropped: 0,
            last_read: 0,
            last_dropped: 0,
        }
    }

    /// Replace the source; all statistics reset.
    pub fn set_source(&mut self, source: Box<dyn SampleSource + Send>) {
        self.source = source;
        self.started = false;
        self.scan_started_index = 0;
        self.last_seen = Box::new([0; MAX_CHANNELS]);
        self.seen_once = ChannelMask::empty();
        self.total_read = 0;
        self.total_dropped = 0;
        self.last_read = 0;
        self.last_dropped = 0;
    }

    /// The wrapped source.
    pub fn source(&self) -> &(dyn SampleSource + Send) {
        self.source.as_ref()
    }

    /// Read all records available now.
    ///
    /// Blocks up to the configured block time for the first record; a timeout
    /// yields an empty slice. The slice points into an internal buffer and is
    /// invalidated by the next call.
    pub fn read_all(&mut self) -> DaqResult<&[Sample]> {
        let records = self.source.read(self.block_time)?;

        self.last_dropped = 0;
        for s in records {
            let chan = u32::from(s.channel_id);
            if !self.started {
                self.started = true;
                self.scan_started_index = s.scan_index;
            }
            if self.seen_once.is_on(chan) {
                let expected = self.last_seen[chan as usize] + 1;
                if s.scan_index > expected {
                    self.last_dropped += s.scan_index - expected;
                }
            } else {
                self.seen_once.set(chan, true);
            }
            self.last_seen[chan as usize] = s.scan_index;
        }
        self.total_dropped += self.last_dropped;
        self.last_read = records.len();
        self.total_read += records.len() as u64;
        Ok(records)
    }

    /// Total records read without error from the current source.
    pub fn num_read(&self) -> u64 {
        self.total_read
    }

    /// Total scans detected as dropped from the current source.
    pub fn num_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Records delivered by the most recent `read_all`.
    pub fn num_last_read(&self) -> usize {
        self.last_read
    }

    /// Scans detected as dropped during the most recent `read_all`.
    pub fn num_last_dropped(&self) -> u64 {
        self.last_dropped
    }

    /// The first scan index ever seen, 0 before any read.
    pub fn first_scan_index(&self) -> u64 {
        self.scan_started_index
    }

    /// The greatest scan index seen so far, 0 before any read.
    pub fn current_scan_index(&self) -> u64 {
        self.seen_once
            .channels_on()
            .iter()
            .map(|c| self.last_seen[*c as usize])
            .max()
            .unwrap_or(0)
    }

    /// How long the source suggests waiting before the next read.
    pub fn suggest_poll_wait(&self) -> Duration {
        self.source.suggest_poll_wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::sample_fifo;
    use crate::source::FifoSource;

    fn reader_over(records: &[Sample]) -> (crate::fifo::FifoWriter, SampleReader) {
        let (mut w, r) = sample_fifo(records.len().max(1));
        for s in records {
            assert!(w.push(s));
        }
        let reader =
            SampleReader::new(Box::new(FifoSource::new(r)), Some(Duration::from_millis(10)));
        (w, reader)
    }

    #[test]
    fn counts_contiguous_reads_without_drops() {
        let records: Vec<Sample> = (0..6)
            .map(|i| Sample::new((i % 2) as u8, i / 2, 0, i as u32))
            .collect();
        let (_w, mut reader) = reader_over(&records);

        let got = reader.read_all().unwrap();
        assert_eq!(got.len(), 6);
        assert_eq!(reader.num_read(), 6);
        assert_eq!(reader.num_dropped(), 0);
        assert_eq!(reader.first_scan_index(), 0);
        assert_eq!(reader.current_scan_index(), 2);
    }

    #[test]
    fn detects_gaps_per_channel() {
        // channel 0 sees scans 0,1,5 -> 3 dropped; channel 1 sees 0,5 -> 4 dropped
        let records = vec![
            Sample::new(0, 0, 0, 0),
            Sample::new(1, 0, 0, 0),
            Sample::new(0, 1, 0, 0),
            Sample::new(0, 5, 0, 0),
            Sample::new(1, 5, 0, 0),
        ];
        let (_w, mut reader) = reader_over(&records);
        reader.read_all().unwrap();
        assert_eq!(reader.num_dropped(), 3 + 4);
        assert_eq!(reader.num_last_dropped(), 7);
    }

    #[test]
    fn first_sight_of_a_channel_is_not_a_drop() {
        let records = vec![Sample::new(3, 100, 0, 0), Sample::new(3, 101, 0, 0)];
        let (_w, mut reader) = reader_over(&records);
        reader.read_all().unwrap();
        assert_eq!(reader.num_dropped(), 0);
        assert_eq!(reader.first_scan_index(), 100);
        assert_eq!(reader.current_scan_index(), 101);
    }
}
