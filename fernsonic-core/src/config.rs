//! Compile-time configuration for Fernsonic.
//!
//! Everything here is fixed at compile time so that the audio thread can use
//! stack and thread-local storage instead of the heap. Changing any of these
//! values is a recompile.

/// Sample rate of the engine, in Hz. Decoders deliver PCM at this rate.
pub const SR: u32 = 44100;

/// Number of frames rendered per block. A multiple of 16.
pub const BLOCK_SIZE: usize = 256;

/// The maximum number of channels any node can ever produce or consume.
///
/// Used to size scratch blocks up front, so that nothing on the audio thread
/// allocates per block.
pub const MAX_CHANNELS: usize = 16;

/// Length, in samples, of the short intra-block crossfades used by panners.
///
/// Must be a multiple of 4 and less than [`BLOCK_SIZE`].
pub const CROSSFADE_SAMPLES: usize = 64;

/// Fundamental alignment, in bytes, of sample arrays.
pub const ALIGNMENT: usize = 16;

/// Maximum interaural time delay, in samples.
///
/// Comes from the Woodworth formula's maximum for a 0.15 m head radius at
/// [`SR`], rounded up to a power of 2.
pub const HRTF_MAX_ITD: usize = 64;

/// The maximum number of lanes a single panner can hold.
pub const PANNER_MAX_LANES: usize = 4;

/// Samples per page of chunked buffer storage. A power of 2, and a multiple
/// of [`ALIGNMENT`]. The trade-off is speed at page boundaries, not
/// fragmentation.
pub const BUFFER_CHUNK_SIZE: usize = 1 << 14;

/// Upper bound, in bytes, on the captured state of a single command.
pub const MAX_COMMAND_SIZE: usize = 128;

/// Capacity of the per-context command ring.
pub const COMMAND_RING_CAPACITY: usize = 1024;

/// Capacity of the per-context property ring.
pub const PROPERTY_RING_CAPACITY: usize = 1024;

/// Soft limit on deletion records processed at the end of one block.
pub const DELETION_DRAIN_LIMIT: usize = 64;
