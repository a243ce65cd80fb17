//! Salvage a stream whose footer is missing or truncated.
//!
//! The repair pass replays the damaged stream with the footerless recovery
//! decoder and pumps every whole scan it can reconstruct into a fresh writer,
//! which closes normally and so regenerates a proper footer. Rate changes,
//! per-scan user data, and channel removals observed while salvaging are
//! re-emitted, so repairing an already well-formed stream yields an
//! equivalent one.

use std::io::{Read, Seek, Write};

use tracing::info;

use crate::error::DaqResult;

use super::reader::DsdReader;
use super::writer::DsdWriter;

/// What a repair pass managed to recover.
#[derive(Clone, Copy, Debug, Default)]
pub struct RepairStats {
    /// Individual samples written to the recovered stream.
    pub samples_recovered: u64,
    /// Whole scans written to the recovered stream.
    pub scans_recovered: u64,
}

/// Replay `input` defensively and write a well-formed copy to `output`.
///
/// Reading stops at the first decode error or EOF; a torn trailing scan is
/// dropped. Returns the recovery counts and the finished sink.
pub fn repair<R: Read + Seek, W: Write>(input: R, output: W) -> DaqResult<(RepairStats, W)> {
    let mut reader = DsdReader::open_recovery(input)?;
    let mut writer = DsdWriter::new(output, 1000, reader.data_type());
    let mut stats = RepairStats::default();

    loop {
        let scan = match reader.read_next_scan() {
            Ok(Some(scan)) => scan,
            Ok(None) => break,
            Err(e) => {
                info!("stopping recovery at first decode error: {}", e);
                break;
            }
        };
        let rate = reader.sampling_rate();

        // channels that vanished from the mask stop after the previous scan
        for chan in writer.channels_on() {
            if !scan.contains_key(&chan) {
                writer.remove_channel_after(chan, writer.scan_index());
            }
        }
        if stats.scans_recovered == 0 && rate > 0 {
            // before the first sample this replaces the default rate outright
            writer.set_sampling_rate(rate);
        }

        for sample in scan.values() {
            writer.write_sample(sample)?;
            stats.samples_recovered += 1;
        }

        // staged against the scan just written, which is now the pending one
        if rate > 0 && rate != writer.sampling_rate() {
            writer.set_sampling_rate(rate);
        }
        for (name, data) in reader.user_data_map() {
            writer.write_user_data(name, data);
        }
        stats.scans_recovered += 1;
    }

    let output = writer.end()?;
    Ok((stats, output))
}
