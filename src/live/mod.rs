//! # Live Streaming
//!
//! The per-client live pipeline: a tuner receiver fills a byte ring, the
//! streamer task demultiplexes the transport stream through a
//! [`DemuxerBundle`](crate::demux::DemuxerBundle) while the PAT/PMT filter
//! watches for program changes, and the delivery queue decouples the
//! real-time producer from the client socket with optional disk-backed
//! time-shift.

/// Persistent per-channel stream bundle snapshots
pub mod cache;

/// Receiver byte ring between tuner callback and streamer task
pub mod ring;

/// Bounded delivery queue with disk-backed time-shift
pub mod queue;

/// Tuner device abstraction (host PVR collaborator)
pub mod tuner;

/// The live streamer task
pub mod streamer;

pub use cache::ChannelCache;
pub use queue::LiveQueue;
pub use ring::PacketRing;
pub use streamer::LiveStreamer;
pub use tuner::{LoopbackTuner, TunerDevice, TunerPool};
