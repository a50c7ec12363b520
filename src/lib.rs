#![doc(html_root_url = "https://docs.rs/pvrlink/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # pvrlink - PVR Streaming Backend
//!
//! `pvrlink` exposes a personal video recorder backend to remote client
//! frontends over a length-prefixed TCP protocol. Clients discover
//! channels, open a live channel or a stored recording and receive a
//! continuous, parsed, demultiplexed MPEG transport-stream feed.
//!
//! The core of the crate is the live streaming pipeline: a tuner receiver
//! fills a byte ring, the streamer task parses PAT/PMT, builds per-PID
//! demuxers for the program's elementary streams (H.264/H.265, MPEG-2
//! video and audio, AC-3/E-AC-3, AAC, DVB subtitles, teletext), discovers
//! stream parameters from the codec headers and delivers framed access
//! units over a bounded queue with optional disk-backed time-shift.
//! A recording player replays on-disk TS recordings through the same
//! demuxer pipeline with random-access seek.
//!
//! ## Embedding
//!
//! The host PVR provides the channel list and tuner devices; everything
//! else is owned by [`server::Server`]:
//!
//! ```rust,no_run
//! use pvrlink::channels::ChannelList;
//! use pvrlink::config::Config;
//! use pvrlink::live::TunerPool;
//! use pvrlink::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pvrlink::Result<()> {
//!     let config = Config::load(None);
//!     let channels = Arc::new(ChannelList::new());
//!     let tuners = Arc::new(TunerPool::new(vec![]));
//!
//!     let server = Arc::new(Server::new(config, channels, tuners));
//!     server.init();
//!
//!     let (_tx, rx) = tokio::sync::watch::channel(false);
//!     server.run(rx).await
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `demux`: stream model, codec parsers, per-PID demuxers and PAT/PMT
//! - `live`: streamer task, delivery queue, channel cache, tuner seam
//! - `rec`: segmented recording reader and packet player
//! - `net`: wire framing and protocol constants
//! - `server`: accept loop, ACL and command dispatch
//! - `channels`: host channel list
//! - `utils`: bit reader and CRC32 variants

/// Host channel list (PVR collaborator surface)
pub mod channels;

/// Configuration module
pub mod config;

/// Transport-stream demultiplexing core
pub mod demux;

/// Error types and utilities
pub mod error;

/// Live streaming pipeline
pub mod live;

/// Wire protocol framing
pub mod net;

/// Recording playback
pub mod rec;

/// Server loop and command dispatch
pub mod server;

/// Common utilities and helper functions
pub mod utils;

pub use error::{ResponseCode, Result, ServerError};
