//! Common utilities shared by the demuxer and protocol layers: a bit-level
//! reader for codec headers and PSI sections, and the CRC32 variants used
//! for table validation and channel UIDs.

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// CRC calculation implementations
pub mod crc;

// Re-export commonly used types
pub use bits::BitReader;
pub use crc::{ChannelUid, Crc32Mpeg2};
