//! # daqpipe core library
//!
//! A multi-channel data-acquisition pipeline: a producer domain samples
//! analog channels at a fixed rate into a lock-free FIFO, and a cooperative
//! reader loop fans the samples out to listeners — live trace windows, spike
//! loggers, disk spoolers, and the NDS/DSD stream writer. The NDS/DSD format
//! is self-describing: typed scalars interleaved with in-band instructions,
//! closed by a metadata footer, with a repair path for streams that never got
//! one.
//!
//! ## Crate structure
//!
//! - **`control`**: the version-tagged shared control block both domains
//!   configure the acquisition through.
//! - **`fifo`**: the single-producer/single-consumer record FIFO between the
//!   domains.
//! - **`sample`**: the fixed-size sample record and channel-mask bitset.
//! - **`source`** / **`reader`**: pull records out of a FIFO or a recorded
//!   file, with dropped-scan accounting.
//! - **`reader_loop`** / **`listener`**: per-channel listener fan-out and the
//!   stock listeners.
//! - **`spike`**: threshold/polarity/blanking spike detection.
//! - **`spool`**: spool-to-temp-then-consume for bounded-memory buffering.
//! - **`dsd`**: the NDS/DSD stream writer, reader, and repair pass.
//! - **`settings`**: the INI-shaped settings grammar shared by application
//!   configuration and the stream footer.
//! - **`producer`**: the in-process emulated producer domain.
//! - **`error`**: the crate-wide [`error::DaqError`].

pub mod control;
pub mod dsd;
pub mod error;
pub mod fifo;
pub mod listener;
pub mod producer;
pub mod reader;
pub mod reader_loop;
pub mod sample;
pub mod settings;
pub mod source;
pub mod spike;
pub mod spool;

pub use error::{DaqError, DaqResult};
pub use sample::{ChannelMask, Sample, MAX_CHANNELS};
