//! Single-producer / single-consumer sample FIFO.
//!
//! The FIFO is a byte-granular ring carrying fixed-size [`Sample`] records.
//! The wrapper enforces record discipline on both sides:
//!
//! - the producer writes one whole record or none ([`FifoWriter::push`] checks
//!   for room first and never blocks — a full FIFO drops the record and counts
//!   it);
//! - the consumer only ever pops whole records; a trailing partial record with
//!   the producer gone is surfaced as `FifoCorruption`.
//!
//! The consumer may wait for data with a timeout; the producer never waits.
//! Dropping the writer closes the channel, which the reader observes as EOF
//! once the ring drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use crate::error::{DaqError, DaqResult};
use crate::sample::{Sample, SAMPLE_WIRE_SIZE};

/// Outcome of a bounded wait on a sample channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one whole record is ready.
    Ready,
    /// The wait elapsed with no complete record; not an error.
    TimedOut,
    /// The producer side is gone and the ring is drained.
    Eof,
}

/// Granularity of the consumer's bounded wait.
const POLL_SLICE: Duration = Duration::from_micros(500);

/// Build a FIFO sized for `capacity_records` in-flight records.
pub fn sample_fifo(capacity_records: usize) -> (FifoWriter, FifoReader) {
    let rb = HeapRb::<u8>::new(capacity_records.max(1) * SAMPLE_WIRE_SIZE);
    let (producer, consumer) = rb.split();
    let closed = Arc::new(AtomicBool::new(false));
    (
        FifoWriter {
            producer,
            closed: Arc::clone(&closed),
            dropped: 0,
        },
        FifoReader { consumer, closed },
    )
}

/// Producer half. Lives in the producer domain; never blocks.
pub struct FifoWriter {
    producer: HeapProducer<u8>,
    closed: Arc<AtomicBool>,
    dropped: u64,
}

impl FifoWriter {
    /// Write one record if it fits, atomically at record granularity.
    ///
    /// Returns false (and counts the record as dropped) when the consumer has
    /// fallen behind and the ring has no room for a whole record.
    pub fn push(&mut self, sample: &Sample) -> bool {
        if self.producer.free_len() < SAMPLE_WIRE_SIZE {
            self.dropped += 1;
            return false;
        }
        let written = self.producer.push_slice(sample.as_bytes());
        debug_assert_eq!(written, SAMPLE_WIRE_SIZE);
        true
    }

    /// Records dropped so far because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Drop for FifoWriter {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Consumer half. Lives in the consumer domain.
pub struct FifoReader {
    consumer: HeapConsumer<u8>,
    closed: Arc<AtomicBool>,
}

impl FifoReader {
    /// Bytes currently queued.
    pub fn bytes_ready(&self) -> usize {
        self.consumer.len()
    }

    /// Total ring capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.consumer.capacity()
    }

    /// True once the producer is gone. Queued records remain readable.
    pub fn producer_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until a whole record is ready, the producer closes, or `max_wait`
    /// elapses. `None` waits indefinitely.
    pub fn wait_for_data(&self, max_wait: Option<Duration>) -> WaitOutcome {
        let deadline = max_wait.map(|d| Instant::now() + d);
        loop {
            if self.consumer.len() >= SAMPLE_WIRE_SIZE {
                return WaitOutcome::Ready;
            }
            if self.producer_closed() {
                return WaitOutcome::Eof;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return WaitOutcome::TimedOut;
                }
            }
            std::thread::sleep(POLL_SLICE);
        }
    }

    /// Pop every whole record currently queued into `out` (appended).
    ///
    /// Returns the number of records popped. A trailing fragment smaller than
    /// one record is left in the ring unless the producer is gone, in which
    /// case it can never complete and is reported as corruption.
    pub fn read_records(&mut self, out: &mut Vec<Sample>) -> DaqResult<usize> {
        let avail = self.consumer.len();
        let whole = avail / SAMPLE_WIRE_SIZE;
        if whole == 0 {
            if avail > 0 && self.producer_closed() {
                return Err(DaqError::FifoCorruption(format!(
                    "{} trailing bytes do not form a whole record",
                    avail
                )));
            }
            return Ok(0);
        }

        let mut bytes = vec![0u8; whole * SAMPLE_WIRE_SIZE];
        let popped = self.consumer.pop_slice(&mut bytes);
        // SPSC: only the producer adds data, so everything we saw is still there.
        debug_assert_eq!(popped, bytes.len());

        out.reserve(whole);
        for chunk in bytes.chunks_exact(SAMPLE_WIRE_SIZE) {
            let sample = Sample::from_bytes(chunk).ok_or_else(|| {
                DaqError::FifoCorruption("record failed to decode".to_string())
            })?;
            out.push(sample);
        }
        Ok(whole)
    }

    /// Discard everything queued (stale data from before a restart).
    pub fn discard_pending(&mut self) {
        let len = self.consumer.len();
        self.consumer.skip(len);
    }
}
