//! Custom error types for the acquisition pipeline.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different kinds of failures that can occur, from control-block
//! attach problems to stream-format corruption.
//!
//! The variants map onto the pipeline's failure policy:
//!
//! - **Control block errors** (`ControlBlockUnavailable`, `ControlBlockVersionMismatch`,
//!   `ControlBlockSizeMismatch`) are fatal at startup; the reader loop cannot run
//!   without a valid shared control region.
//! - **`SampleDeviceEof`** is non-fatal: it terminates the reader loop cleanly.
//! - **`SampleDeviceError`** and **`FifoCorruption`** are fatal to the reader loop.
//! - **`OutOfOrderSample`** is fatal to the current stream writer; the partial
//!   file remains recoverable via the repair path.
//! - **`FileCorrupt`** / **`FileCorruptNoFooter`** / **`UnknownInstruction`** are
//!   surfaced to the caller of the stream reader; repair is the suggested recovery.
//! - **`DiskFull`** is recovered locally by the temp spooler, which truncates
//!   itself and reports the number of records lost through this variant.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// The error type shared by every component of the pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("control block unavailable: {0}")]
    ControlBlockUnavailable(String),

    #[error("control block version mismatch: expected {expected:#010x}, found {found:#010x}")]
    ControlBlockVersionMismatch { expected: u32, found: u32 },

    #[error("control block size mismatch: expected at least {expected} bytes, found {found}")]
    ControlBlockSizeMismatch { expected: usize, found: usize },

    #[error("sample device reached end of stream")]
    SampleDeviceEof,

    #[error("sample device error: {0}")]
    SampleDeviceError(String),

    #[error("sample FIFO corruption: {0}")]
    FifoCorruption(String),

    #[error("sample out of order: scan index {got} precedes current index {current}")]
    OutOfOrderSample { current: u64, got: u64 },

    #[error("corrupt stream: {0}")]
    FileCorrupt(String),

    #[error("stream footer missing or truncated; run `ndstool repair` on this file")]
    FileCorruptNoFooter,

    #[error("disk full: {records_lost} spooled records lost")]
    DiskFull { records_lost: u64 },

    #[error("unknown instruction code {0:#x}; the file may use a newer format")]
    UnknownInstruction(u32),

    #[error("listener failure: {0}")]
    Listener(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// True for errors that end a reader-loop run without being a fault.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, DaqError::SampleDeviceEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_clean() {
        assert!(DaqError::SampleDeviceEof.is_clean_eof());
        assert!(!DaqError::SampleDeviceError("gone".into()).is_clean_eof());
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> DaqResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))?;
            Ok(())
        }
        match fails() {
            Err(DaqError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn version_mismatch_message_names_both_values() {
        let e = DaqError::ControlBlockVersionMismatch {
            expected: 0x38,
            found: 0x37,
        };
        let msg = e.to_string();
        assert!(msg.contains("0x00000038"));
        assert!(msg.contains("0x00000037"));
    }
}
