//! Sample sources: where the consumer domain gets its records.
//!
//! [`SampleSource`] is the seam between the reader loop and whatever carries
//! the records. Two implementations live here:
//!
//! - [`FifoSource`] drains the in-process SPSC FIFO fed by the producer
//!   domain. Its suggested poll wait aims the next read at a ~30 ms cadence
//!   while draining faster when the ring is filling up.
//! - [`FileSource`] replays a previously recorded raw record stream from disk
//!   (the FIFO wire format, packed). Its suggested poll wait is zero.
//!
//! `read` returns a slice into the source's internal buffer; the slice is only
//! valid until the next call.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::error::{DaqError, DaqResult};
use crate::fifo::{FifoReader, WaitOutcome};
use crate::sample::{Sample, SAMPLE_WIRE_SIZE};

/// The poll cadence the FIFO source steers toward, in milliseconds. Waiting
/// much longer makes live displays jerky and risks overflowing the ring;
/// waiting less burns the consumer thread.
const DESIRED_FIFO_FEEL_MS: u64 = 30;

/// Records per read block for the file source.
const FILE_READ_BLOCK_RECORDS: usize = 256;

/// A supplier of sample records to the consumer domain.
pub trait SampleSource {
    /// Bytes available to read right now.
    fn bytes_ready(&self) -> DaqResult<usize>;

    /// Block until data is ready, the stream ends, or `max_wait` elapses
    /// (`None` waits indefinitely).
    fn wait_for_data(&mut self, max_wait: Option<Duration>) -> DaqResult<WaitOutcome>;

    /// Read every record available now, blocking up to `max_wait` for the
    /// first one. A timeout yields an empty slice, not an error. The returned
    /// slice is invalidated by the next call.
    fn read(&mut self, max_wait: Option<Duration>) -> DaqResult<&[Sample]>;

    /// Discard anything pending (stale data from before a restart).
    fn flush(&mut self) -> DaqResult<()>;

    /// How long the reading process should wait before the next read.
    fn suggest_poll_wait(&self) -> Duration;
}

/// Source over the in-process sample FIFO.
pub struct FifoSource {
    fifo: FifoReader,
    buf: Vec<Sample>,
}

impl FifoSource {
    /// Wrap the consumer half of a FIFO.
    pub fn new(fifo: FifoReader) -> Self {
        FifoSource {
            fifo,
            buf: Vec::new(),
        }
    }
}

impl SampleSource for FifoSource {
    fn bytes_ready(&self) -> DaqResult<usize> {
        Ok(self.fifo.bytes_ready())
    }

    fn wait_for_data(&mut self, max_wait: Option<Duration>) -> DaqResult<WaitOutcome> {
        Ok(self.fifo.wait_for_data(max_wait))
    }

    fn read(&mut self, max_wait: Option<Duration>) -> DaqResult<&[Sample]> {
        self.buf.clear();
        match self.fifo.wait_for_data(max_wait) {
            WaitOutcome::Ready => {
                self.fifo.read_records(&mut self.buf)?;
                Ok(&self.buf)
            }
            WaitOutcome::TimedOut => Ok(&self.buf),
            WaitOutcome::Eof => {
                // a torn trailing record is corruption, not a clean end
                self.fifo.read_records(&mut self.buf)?;
                Err(DaqError::SampleDeviceEof)
            }
        }
    }

    fn flush(&mut self) -> DaqResult<()> {
        self.fifo.discard_pending();
        Ok(())
    }

    fn suggest_poll_wait(&self) -> Duration {
        // Steer toward the desired feel, but drain immediately once the ring
        // is more than half full so the producer never has to drop records.
        let capacity = self.fifo.capacity_bytes().max(1);
        let fill = self.fifo.bytes_ready() as f64 / capacity as f64;
        if fill >= 0.5 {
            return Duration::ZERO;
        }
        let scale = 1.0 - 2.0 * fill;
        Duration::from_millis((DESIRED_FIFO_FEEL_MS as f64 * scale) as u64)
    }
}

/// Source replaying a raw record file.
pub struct FileSource {
    file: File,
    remaining: u64,
    buf: Vec<Sample>,
}

impl FileSource {
    /// Open a packed record file for replay.
    pub fn open(path: &Path) -> DaqResult<Self> {
        let file = File::open(path)
            .map_err(|e| DaqError::SampleDeviceError(format!("{}: {}", path.display(), e)))?;
        let len = file.metadata()?.len();
        if len % SAMPLE_WIRE_SIZE as u64 != 0 {
            return Err(DaqError::FifoCorruption(format!(
                "record file length {} is not a multiple of the record size",
                len
            )));
        }
        Ok(FileSource {
            file,
            remaining: len,
            buf: Vec::new(),
        })
    }
}

impl SampleSource for FileSource {
    fn bytes_ready(&self) -> DaqResult<usize> {
        Ok(self.remaining as usize)
    }

    fn wait_for_data(&mut self, _max_wait: Option<Duration>) -> DaqResult<WaitOutcome> {
        if self.remaining == 0 {
            Ok(WaitOutcome::Eof)
        } else {
            Ok(WaitOutcome::Ready)
        }
    }

    fn read(&mut self, _max_wait: Option<Duration>) -> DaqResult<&[Sample]> {
        if self.remaining == 0 {
            return Err(DaqError::SampleDeviceEof);
        }
        let want = (self.remaining as usize).min(FILE_READ_BLOCK_RECORDS * SAMPLE_WIRE_SIZE);
        let mut bytes = vec![0u8; want];
        self.file.read_exact(&mut bytes)?;
        self.remaining -= want as u64;

        self.buf.clear();
        for chunk in bytes.chunks_exact(SAMPLE_WIRE_SIZE) {
            let sample = Sample::from_bytes(chunk)
                .ok_or_else(|| DaqError::FifoCorruption("record failed to decode".to_string()))?;
            self.buf.push(sample);
        }
        Ok(&self.buf)
    }

    fn flush(&mut self) -> DaqResult<()> {
        Ok(())
    }

    fn suggest_poll_wait(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::sample_fifo;
    use std::io::Write;

    #[test]
    fn fifo_source_reads_and_times_out() {
        let (mut w, r) = sample_fifo(16);
        let mut src = FifoSource::new(r);

        let empty = src.read(Some(Duration::from_millis(2))).unwrap();
        assert!(empty.is_empty());

        w.push(&Sample::new(0, 0, 0, 11));
        w.push(&Sample::new(1, 0, 0, 22));
        let records = src.read(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data, 22);

        drop(w);
        assert!(matches!(
            src.read(Some(Duration::from_millis(2))),
            Err(DaqError::SampleDeviceEof)
        ));
    }

    #[test]
    fn fifo_source_flush_discards_backlog() {
        let (mut w, r) = sample_fifo(16);
        let mut src = FifoSource::new(r);
        w.push(&Sample::new(0, 0, 0, 1));
        src.flush().unwrap();
        assert_eq!(src.bytes_ready().unwrap(), 0);
    }

    #[test]
    fn file_source_replays_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.raw");
        {
            let mut f = File::create(&path).unwrap();
            for i in 0..600u32 {
                f.write_all(Sample::new(0, u64::from(i), 0, i).as_bytes()).unwrap();
            }
        }

        let mut src = FileSource::open(&path).unwrap();
        assert_eq!(src.suggest_poll_wait(), Duration::ZERO);

        let mut seen = 0u32;
        loop {
            match src.read(None) {
                Ok(records) => {
                    for s in records {
                        assert_eq!(s.data, seen);
                        seen += 1;
                    }
                }
                Err(DaqError::SampleDeviceEof) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(seen, 600);
    }

    #[test]
    fn file_source_rejects_torn_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.raw");
        std::fs::write(&path, [0u8; SAMPLE_WIRE_SIZE + 5]).unwrap();
        assert!(matches!(
            FileSource::open(&path),
            Err(DaqError::FifoCorruption(_))
        ));
    }
}
