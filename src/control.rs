//! The shared control block between the producer and consumer domains.
//!
//! The control block is a fixed-layout `#[repr(C)]` structure living in a
//! memory-mapped file. The producer domain (the sampling task, or this crate's
//! emulated producer) creates it; the consumer side attaches and validates the
//! version tag and layout size before anything else runs.
//!
//! # Field ownership
//!
//! Ownership of individual fields is split by domain rather than guarded by
//! locks:
//!
//! - **Consumer-writable**: channel enable masks, per-channel range/reference
//!   words, the sampling rate, and the spike parameters. The producer re-reads
//!   these every scan.
//! - **Producer-writable**: the monotonic scan index and the board-identity
//!   words. The consumer treats them as read-only.
//!
//! Every cross-domain field is a single atomic word, so reads are tear-free by
//! layout and neither side ever takes a lock. The `f64` spike threshold
//! travels as its `u64` bit pattern.
//!
//! # Thread Safety
//!
//! - **Writes**: each field is independently atomic; no field spans words.
//! - **Scan index**: store with Release, load with Acquire, so a consumer that
//!   observes an index also observes the configuration it was sampled under.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{DaqError, DaqResult};
use crate::sample::{ChannelMask, CHAN_MASK_BYTES, MAX_CHANNELS};

/// Compile-time layout tag. Bumped whenever the `#[repr(C)]` layout changes;
/// attach fails fast on any mismatch.
pub const CONTROL_BLOCK_VERSION: u32 = 0x00da_0038;

/// Which subdevice a channel operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubdevKind {
    /// Analog input channels.
    AnalogInput,
    /// Analog output channels.
    AnalogOutput,
}

/// Spike detection polarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpikePolarity {
    /// Fire when the reading rises to or above the threshold.
    Positive,
    /// Fire when the reading falls to or below the threshold.
    Negative,
}

/// A read-out of one channel's spike configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpikeParams {
    /// Whether detection is enabled on this channel.
    pub enabled: bool,
    /// Which side of the threshold fires.
    pub polarity: SpikePolarity,
    /// Threshold in raw converter units.
    pub threshold: f64,
    /// Refractory window after an accepted spike, in milliseconds.
    pub blanking_ms: u32,
}

impl Default for SpikeParams {
    fn default() -> Self {
        SpikeParams {
            enabled: false,
            polarity: SpikePolarity::Positive,
            threshold: 0.0,
            blanking_ms: 0,
        }
    }
}

/// Per-channel spike fields as they sit in the shared region.
#[repr(C)]
struct SpikeSlot {
    threshold_bits: AtomicU64,
    blanking_ms: AtomicU32,
    polarity: AtomicU8,
    enabled: AtomicU8,
    _pad: [u8; 2],
}

/// The shared layout. Layout (per field group):
/// - version tag + pad: 8 bytes
/// - per-channel packed range/aref words, both subdevices: 2 * 1024 bytes
/// - channel enable masks, both subdevices: 2 * 32 bytes
/// - sampling rate + pad + scan index: 16 bytes
/// - board identity words: 24 bytes
/// - spike slots: 256 * 16 bytes
#[repr(C)]
struct ControlLayout {
    version: u32,
    _pad0: u32,
    ai_chan: [AtomicU32; MAX_CHANNELS],
    ao_chan: [AtomicU32; MAX_CHANNELS],
    ai_chans_in_use: [AtomicU8; CHAN_MASK_BYTES],
    ao_chans_in_use: [AtomicU8; CHAN_MASK_BYTES],
    sampling_rate_hz: AtomicU32,
    _pad1: u32,
    scan_index: AtomicU64,
    n_ai_chans: AtomicU32,
    n_ao_chans: AtomicU32,
    ai_fifo_minor: i32,
    ao_fifo_minor: i32,
    ai_subdev: i32,
    ao_subdev: i32,
    spike: [SpikeSlot; MAX_CHANNELS],
}

const CONTROL_BLOCK_SIZE: usize = std::mem::size_of::<ControlLayout>();

// Spike slots must stay word-packed for the layout arithmetic above.
const _: () = assert!(std::mem::size_of::<SpikeSlot>() == 16);

/// Handle onto the shared control block.
///
/// Both domains hold one of these (typically behind an `Arc`); the producer
/// obtains it from [`ControlBlock::create`] and the consumer from
/// [`ControlBlock::attach`].
pub struct ControlBlock {
    /// Keeps the mapping alive; all access goes through `layout`.
    #[allow(dead_code)]
    mmap: MmapMut,
    /// SAFETY invariant: points into `mmap`, valid for the lifetime of `self`.
    layout: *const ControlLayout,
}

// SAFETY: every cross-domain field of ControlLayout is an atomic; the raw
// pointer is only dereferenced for atomic accesses (plus the read-only version
// word written before the handle is shared).
unsafe impl Send for ControlBlock {}
// SAFETY: see above; shared references only perform atomic operations.
unsafe impl Sync for ControlBlock {}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("sampling_rate_hz", &self.sampling_rate_hz())
            .field("scan_index", &self.scan_index())
            .field("ai_in_use", &self.channels_in_use(SubdevKind::AnalogInput).num_on())
            .finish()
    }
}

impl ControlBlock {
    /// Create and initialize the shared region (producer side).
    ///
    /// The file at `path` is truncated to the layout size and zero-filled,
    /// then the version tag, channel counts, and the default sampling rate
    /// (1000 Hz) are written.
    pub fn create(path: &Path, n_ai_chans: u32, n_ao_chans: u32) -> DaqResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                DaqError::ControlBlockUnavailable(format!("cannot create {}: {}", path.display(), e))
            })?;
        file.set_len(CONTROL_BLOCK_SIZE as u64)?;

        // SAFETY: the file was just sized to CONTROL_BLOCK_SIZE; the mapping
        // covers the whole layout.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let raw = mmap.as_mut_ptr() as *mut ControlLayout;

        // SAFETY: raw points at a zero-filled region of the right size; the
        // plain words are written before the handle escapes this function.
        unsafe {
            (*raw).version = CONTROL_BLOCK_VERSION;
            // no character devices behind the emulated producer
            (*raw).ai_fifo_minor = -1;
            (*raw).ao_fifo_minor = -1;
            (*raw).ai_subdev = -1;
            (*raw).ao_subdev = -1;
        }
        let layout = raw as *const ControlLayout;

        let block = ControlBlock { mmap, layout };
        block.inner().n_ai_chans.store(n_ai_chans.min(MAX_CHANNELS as u32), Ordering::Relaxed);
        block.inner().n_ao_chans.store(n_ao_chans.min(MAX_CHANNELS as u32), Ordering::Relaxed);
        block.inner().sampling_rate_hz.store(1000, Ordering::Relaxed);
        Ok(block)
    }

    /// Attach to an existing region (consumer side), validating version,
    /// size, and channel-count bounds.
    pub fn attach(path: &Path) -> DaqResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                DaqError::ControlBlockUnavailable(format!("cannot open {}: {}", path.display(), e))
            })?;
        let found = file.metadata()?.len() as usize;
        if found < CONTROL_BLOCK_SIZE {
            return Err(DaqError::ControlBlockSizeMismatch {
                expected: CONTROL_BLOCK_SIZE,
                found,
            });
        }

        // SAFETY: size validated above; the mapping covers the whole layout.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let layout = mmap.as_ptr() as *const ControlLayout;

        // SAFETY: layout points at a mapping of at least CONTROL_BLOCK_SIZE bytes.
        let version = unsafe { (*layout).version };
        if version != CONTROL_BLOCK_VERSION {
            return Err(DaqError::ControlBlockVersionMismatch {
                expected: CONTROL_BLOCK_VERSION,
                found: version,
            });
        }

        let block = ControlBlock { mmap, layout };
        let n_ai = block.inner().n_ai_chans.load(Ordering::Relaxed);
        let n_ao = block.inner().n_ao_chans.load(Ordering::Relaxed);
        if n_ai as usize > MAX_CHANNELS || n_ao as usize > MAX_CHANNELS {
            return Err(DaqError::ControlBlockUnavailable(format!(
                "channel counts out of bounds: ai={} ao={} (max {})",
                n_ai, n_ao, MAX_CHANNELS
            )));
        }
        Ok(block)
    }

    fn inner(&self) -> &ControlLayout {
        // SAFETY: layout is valid for the lifetime of self (see struct invariant).
        unsafe { &*self.layout }
    }

    fn chan_words(&self, kind: SubdevKind) -> &[AtomicU32; MAX_CHANNELS] {
        match kind {
            SubdevKind::AnalogInput => &self.inner().ai_chan,
            SubdevKind::AnalogOutput => &self.inner().ao_chan,
        }
    }

    fn use_mask(&self, kind: SubdevKind) -> &[AtomicU8; CHAN_MASK_BYTES] {
        match kind {
            SubdevKind::AnalogInput => &self.inner().ai_chans_in_use,
            SubdevKind::AnalogOutput => &self.inner().ao_chans_in_use,
        }
    }

    /// Enable or disable acquisition on a channel.
    pub fn set_channel_enabled(&self, kind: SubdevKind, chan: u32, on: bool) {
        let chan = chan as usize;
        if chan >= MAX_CHANNELS {
            return;
        }
        let byte = &self.use_mask(kind)[chan / 8];
        let bit = 1u8 << (chan % 8);
        if on {
            byte.fetch_or(bit, Ordering::Relaxed);
        } else {
            byte.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    /// Whether a channel is currently enabled.
    pub fn is_channel_enabled(&self, kind: SubdevKind, chan: u32) -> bool {
        let chan = chan as usize;
        if chan >= MAX_CHANNELS {
            return false;
        }
        self.use_mask(kind)[chan / 8].load(Ordering::Relaxed) & (1 << (chan % 8)) != 0
    }

    /// Snapshot of the enable mask for one subdevice.
    pub fn channels_in_use(&self, kind: SubdevKind) -> ChannelMask {
        let mut bytes = [0u8; CHAN_MASK_BYTES];
        for (dst, src) in bytes.iter_mut().zip(self.use_mask(kind).iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        ChannelMask::from_bytes(&bytes)
    }

    /// Number of channels the subdevice exposes.
    pub fn num_channels(&self, kind: SubdevKind) -> u32 {
        match kind {
            SubdevKind::AnalogInput => self.inner().n_ai_chans.load(Ordering::Relaxed),
            SubdevKind::AnalogOutput => self.inner().n_ao_chans.load(Ordering::Relaxed),
        }
    }

    /// Number of currently enabled channels on the subdevice.
    pub fn num_channels_in_use(&self, kind: SubdevKind) -> u32 {
        self.channels_in_use(kind).num_on() as u32
    }

    /// Set the range id for a channel (packed into the channel word).
    pub fn set_channel_range(&self, kind: SubdevKind, chan: u32, range: u32) {
        if let Some(word) = self.chan_words(kind).get(chan as usize) {
            let old = word.load(Ordering::Relaxed);
            word.store((old & !0x00ff_0000) | ((range & 0xff) << 16), Ordering::Relaxed);
        }
    }

    /// The range id a channel is configured for.
    pub fn channel_range(&self, kind: SubdevKind, chan: u32) -> u32 {
        self.chan_words(kind)
            .get(chan as usize)
            .map(|w| (w.load(Ordering::Relaxed) >> 16) & 0xff)
            .unwrap_or(0)
    }

    /// Set the analog reference for a channel (packed into the channel word).
    pub fn set_channel_aref(&self, kind: SubdevKind, chan: u32, aref: u32) {
        if let Some(word) = self.chan_words(kind).get(chan as usize) {
            let old = word.load(Ordering::Relaxed);
            word.store((old & !0xff00_0000) | ((aref & 0xff) << 24), Ordering::Relaxed);
        }
    }

    /// The analog reference a channel is configured for.
    pub fn channel_aref(&self, kind: SubdevKind, chan: u32) -> u32 {
        self.chan_words(kind)
            .get(chan as usize)
            .map(|w| (w.load(Ordering::Relaxed) >> 24) & 0xff)
            .unwrap_or(0)
    }

    /// Request a new sampling rate from the producer.
    pub fn set_sampling_rate_hz(&self, rate: u32) {
        self.inner().sampling_rate_hz.store(rate.max(1), Ordering::Relaxed);
    }

    /// The configured sampling rate.
    pub fn sampling_rate_hz(&self) -> u32 {
        self.inner().sampling_rate_hz.load(Ordering::Relaxed)
    }

    /// Current scan index. Producer-owned; read-only for the consumer.
    pub fn scan_index(&self) -> u64 {
        self.inner().scan_index.load(Ordering::Acquire)
    }

    /// Advance the scan index by one. Only the producer domain calls this.
    pub fn advance_scan_index(&self) -> u64 {
        self.inner().scan_index.fetch_add(1, Ordering::Release) + 1
    }

    /// Minor number of the sample FIFO device, or -1 when in-process.
    pub fn ai_fifo_minor(&self) -> i32 {
        self.inner().ai_fifo_minor
    }

    /// Minor number of the output FIFO device, or -1 when in-process.
    pub fn ao_fifo_minor(&self) -> i32 {
        self.inner().ao_fifo_minor
    }

    /// Board subdevice index for a subdevice kind, or -1 when in-process.
    pub fn subdev_index(&self, kind: SubdevKind) -> i32 {
        match kind {
            SubdevKind::AnalogInput => self.inner().ai_subdev,
            SubdevKind::AnalogOutput => self.inner().ao_subdev,
        }
    }

    /// Enable or disable spike detection on a channel.
    pub fn set_spike_enabled(&self, chan: u32, on: bool) {
        if let Some(slot) = self.inner().spike.get(chan as usize) {
            slot.enabled.store(u8::from(on), Ordering::Relaxed);
        }
    }

    /// Set the spike threshold (raw converter units) for a channel.
    pub fn set_spike_threshold(&self, chan: u32, threshold: f64) {
        if let Some(slot) = self.inner().spike.get(chan as usize) {
            slot.threshold_bits.store(threshold.to_bits(), Ordering::Relaxed);
        }
    }

    /// Set the spike blanking window for a channel, in milliseconds.
    pub fn set_spike_blanking(&self, chan: u32, ms: u32) {
        if let Some(slot) = self.inner().spike.get(chan as usize) {
            slot.blanking_ms.store(ms, Ordering::Relaxed);
        }
    }

    /// Set the spike polarity for a channel.
    pub fn set_spike_polarity(&self, chan: u32, polarity: SpikePolarity) {
        if let Some(slot) = self.inner().spike.get(chan as usize) {
            let bit = u8::from(polarity == SpikePolarity::Positive);
            slot.polarity.store(bit, Ordering::Relaxed);
        }
    }

    /// Read one channel's spike configuration.
    pub fn spike_params(&self, chan: u32) -> SpikeParams {
        let Some(slot) = self.inner().spike.get(chan as usize) else {
            return SpikeParams::default();
        };
        SpikeParams {
            enabled: slot.enabled.load(Ordering::Relaxed) != 0,
            polarity: if slot.polarity.load(Ordering::Relaxed) != 0 {
                SpikePolarity::Positive
            } else {
                SpikePolarity::Negative
            },
            threshold: f64::from_bits(slot.threshold_bits.load(Ordering::Relaxed)),
            blanking_ms: slot.blanking_ms.load(Ordering::Relaxed),
        }
    }

    /// Reset every channel's spike configuration to disabled defaults.
    pub fn clear_spike_settings(&self) {
        for chan in 0..MAX_CHANNELS as u32 {
            self.set_spike_enabled(chan, false);
            self.set_spike_threshold(chan, 0.0);
            self.set_spike_blanking(chan, 0);
            self.set_spike_polarity(chan, SpikePolarity::Positive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.shm");

        let producer = ControlBlock::create(&path, 16, 0).unwrap();
        producer.set_channel_enabled(SubdevKind::AnalogInput, 3, true);
        producer.set_sampling_rate_hz(2000);
        producer.advance_scan_index();

        let consumer = ControlBlock::attach(&path).unwrap();
        assert!(consumer.is_channel_enabled(SubdevKind::AnalogInput, 3));
        assert!(!consumer.is_channel_enabled(SubdevKind::AnalogInput, 4));
        assert_eq!(consumer.sampling_rate_hz(), 2000);
        assert_eq!(consumer.scan_index(), 1);
        assert_eq!(consumer.num_channels(SubdevKind::AnalogInput), 16);
        assert_eq!(consumer.ai_fifo_minor(), -1);
        assert_eq!(consumer.subdev_index(SubdevKind::AnalogOutput), -1);
    }

    #[test]
    fn attach_missing_region_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControlBlock::attach(&dir.path().join("nope.shm")).unwrap_err();
        assert!(matches!(err, DaqError::ControlBlockUnavailable(_)));
    }

    #[test]
    fn attach_short_region_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.shm");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let err = ControlBlock::attach(&path).unwrap_err();
        assert!(matches!(err, DaqError::ControlBlockSizeMismatch { .. }));
    }

    #[test]
    fn attach_wrong_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versioned.shm");
        {
            let _block = ControlBlock::create(&path, 8, 0).unwrap();
        }
        // Clobber the version word.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = ControlBlock::attach(&path).unwrap_err();
        assert!(matches!(err, DaqError::ControlBlockVersionMismatch { .. }));
    }

    #[test]
    fn range_and_aref_pack_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.shm");
        let block = ControlBlock::create(&path, 16, 0).unwrap();

        block.set_channel_range(SubdevKind::AnalogInput, 5, 3);
        block.set_channel_aref(SubdevKind::AnalogInput, 5, 1);
        assert_eq!(block.channel_range(SubdevKind::AnalogInput, 5), 3);
        assert_eq!(block.channel_aref(SubdevKind::AnalogInput, 5), 1);

        block.set_channel_range(SubdevKind::AnalogInput, 5, 7);
        assert_eq!(block.channel_range(SubdevKind::AnalogInput, 5), 7);
        assert_eq!(block.channel_aref(SubdevKind::AnalogInput, 5), 1);
    }

    #[test]
    fn spike_params_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.shm");
        let block = ControlBlock::create(&path, 4, 0).unwrap();

        block.set_spike_enabled(2, true);
        block.set_spike_threshold(2, 2048.5);
        block.set_spike_blanking(2, 120);
        block.set_spike_polarity(2, SpikePolarity::Negative);

        let p = block.spike_params(2);
        assert!(p.enabled);
        assert_eq!(p.threshold, 2048.5);
        assert_eq!(p.blanking_ms, 120);
        assert_eq!(p.polarity, SpikePolarity::Negative);

        block.clear_spike_settings();
        assert!(!block.spike_params(2).enabled);
    }
}
