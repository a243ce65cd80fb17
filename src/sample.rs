//! The sample record and the channel mask.
//!
//! A [`Sample`] is the fixed-size unit that crosses the producer/consumer FIFO
//! and raw record files. Its layout is `#[repr(C)]` with explicit padding so the
//! in-memory image *is* the wire image: all multi-byte fields are native-endian
//! and the FIFO is not intended to cross hosts.
//!
//! A [`ChannelMask`] is a bitset over the full channel-id space, used both by
//! the control block (which channels the producer should acquire) and by the
//! stream format (which channels a scan contains). Bit numbering is LSB-first
//! within each byte, matching the on-disk mask payload of the stream format.

use bytemuck::{Pod, Zeroable};

/// Maximum number of channels per subdevice. Channel ids are `0..MAX_CHANNELS`.
pub const MAX_CHANNELS: usize = 256;

/// Number of bytes in a channel mask.
pub const CHAN_MASK_BYTES: usize = MAX_CHANNELS / 8;

/// Size in bytes of one [`Sample`] on the wire (FIFO and raw record files).
pub const SAMPLE_WIRE_SIZE: usize = std::mem::size_of::<Sample>();

/// One acquired reading from one channel at one scan tick.
///
/// All samples belonging to the same scan share a `scan_index`. Within a single
/// producer run the scan index is non-decreasing; gaps indicate dropped scans,
/// which the reader accounts for but does not treat as errors.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Sample {
    /// Channel this reading came from, `0..MAX_CHANNELS`.
    pub channel_id: u8,
    _pad0: [u8; 7],
    /// Monotonic scan counter maintained by the producer.
    pub scan_index: u64,
    /// Range setting the board used for this reading.
    pub range_id: u32,
    /// The raw converter reading.
    pub data: u32,
    /// Nonzero if the spike detector fired on this sample.
    pub spike: u8,
    _pad1: [u8; 3],
    /// Milliseconds since the previous accepted spike on this channel, or 0.
    pub spike_period_ms: u32,
}

// The wire format is fixed; catch accidental layout drift at compile time.
const _: () = assert!(std::mem::size_of::<Sample>() == 32);

impl Sample {
    /// Build a sample with the spike fields clear.
    pub fn new(channel_id: u8, scan_index: u64, range_id: u32, data: u32) -> Self {
        Sample {
            channel_id,
            _pad0: [0; 7],
            scan_index,
            range_id,
            data,
            spike: 0,
            _pad1: [0; 3],
            spike_period_ms: 0,
        }
    }

    /// Mark this sample as a detected spike.
    pub fn with_spike(mut self, period_ms: u32) -> Self {
        self.spike = 1;
        self.spike_period_ms = period_ms;
        self
    }

    /// True if the spike detector fired on this sample.
    pub fn is_spike(&self) -> bool {
        self.spike != 0
    }

    /// The wire image of this record.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode one record from exactly [`SAMPLE_WIRE_SIZE`] bytes. The bytes
    /// need not be aligned (they usually come out of a byte ring or file).
    pub fn from_bytes(bytes: &[u8]) -> Option<Sample> {
        if bytes.len() != SAMPLE_WIRE_SIZE {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

/// Bitset over channel ids, LSB-first within each byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask {
    bits: [u8; CHAN_MASK_BYTES],
}

impl Default for ChannelMask {
    fn default() -> Self {
        ChannelMask::empty()
    }
}

impl std::fmt::Debug for ChannelMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMask")
            .field("channels_on", &self.channels_on())
            .finish()
    }
}

impl ChannelMask {
    /// A mask with no channels enabled.
    pub fn empty() -> Self {
        ChannelMask {
            bits: [0; CHAN_MASK_BYTES],
        }
    }

    /// Build a mask from a list of channel ids. Out-of-range ids are ignored.
    pub fn from_channels<I: IntoIterator<Item = u32>>(chans: I) -> Self {
        let mut m = ChannelMask::empty();
        for c in chans {
            m.set(c, true);
        }
        m
    }

    /// Reconstruct a mask from its byte image. Extra bytes are ignored,
    /// missing bytes read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut m = ChannelMask::empty();
        for (dst, src) in m.bits.iter_mut().zip(bytes) {
            *dst = *src;
        }
        m
    }

    /// The byte image of this mask (LSB-first within each byte).
    pub fn as_bytes(&self) -> &[u8; CHAN_MASK_BYTES] {
        &self.bits
    }

    /// Whether `chan` is enabled. Out-of-range ids read as off.
    pub fn is_on(&self, chan: u32) -> bool {
        let chan = chan as usize;
        if chan >= MAX_CHANNELS {
            return false;
        }
        self.bits[chan / 8] & (1 << (chan % 8)) != 0
    }

    /// Enable or disable `chan`. Out-of-range ids are ignored.
    pub fn set(&mut self, chan: u32, on: bool) {
        let chan = chan as usize;
        if chan >= MAX_CHANNELS {
            return;
        }
        if on {
            self.bits[chan / 8] |= 1 << (chan % 8);
        } else {
            self.bits[chan / 8] &= !(1 << (chan % 8));
        }
    }

    /// Number of enabled channels.
    pub fn num_on(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True if no channel is enabled.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// The enabled channel ids, in increasing order.
    pub fn channels_on(&self) -> Vec<u32> {
        (0..MAX_CHANNELS as u32).filter(|c| self.is_on(*c)).collect()
    }

    /// Set-union with another mask.
    pub fn union(&self, other: &ChannelMask) -> ChannelMask {
        let mut out = *self;
        for (dst, src) in out.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= *src;
        }
        out
    }
}
