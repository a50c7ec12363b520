//! # Error Types
//!
//! This module provides the error types used throughout the pvrlink crate.
//! It defines a central error type `ServerError` that encapsulates all
//! possible errors that can occur while serving live streams, recordings
//! and protocol requests, plus the stable response codes a client sees.

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the pvrlink crate
#[derive(Error, Debug)]
pub enum ServerError {
    /// I/O errors that occur during file or network operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors that occur during parsing of bitstreams and sections
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors related to the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A referenced channel, recording or resource does not exist
    #[error("unknown resource: {0}")]
    Unknown(String),

    /// The tuner subsystem could not fulfil a request
    #[error("tuner error: {0}")]
    Tuner(TuneError),

    /// Errors that occur during integer parsing
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// Why a channel switch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneError {
    /// No CAM slot can decrypt the channel
    Encrypted,
    /// No free device for the channel
    AllTunersBusy,
    /// An active recording blocks the channel
    RecordingBlocked,
    /// Generic device failure
    TuneFailed,
}

impl std::fmt::Display for TuneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TuneError::Encrypted => "channel is encrypted",
            TuneError::AllTunersBusy => "all tuners busy",
            TuneError::RecordingBlocked => "blocked by active recording",
            TuneError::TuneFailed => "failed to tune",
        };
        f.write_str(s)
    }
}

/// Stable response codes visible to clients on the request/response channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    /// Success
    Ok = 0,
    /// Malformed request arguments or malformed stream data
    DataInvalid = 1,
    /// Unknown UID or missing recording file
    DataUnknown = 2,
    /// Resource busy
    DataLocked = 3,
    /// A recording is in progress
    RecRunning = 4,
    /// No CAM can decrypt this channel
    Encrypted = 5,
    /// Optional feature not installed
    NotSupported = 6,
    /// Generic tuner/device failure
    Error = 7,
}

impl From<&ServerError> for ResponseCode {
    fn from(err: &ServerError) -> Self {
        match err {
            ServerError::InvalidData(_) | ServerError::Parser(_) => ResponseCode::DataInvalid,
            ServerError::Unknown(_) => ResponseCode::DataUnknown,
            ServerError::Tuner(TuneError::Encrypted) => ResponseCode::Encrypted,
            ServerError::Tuner(TuneError::AllTunersBusy) => ResponseCode::DataLocked,
            ServerError::Tuner(TuneError::RecordingBlocked) => ResponseCode::RecRunning,
            _ => ResponseCode::Error,
        }
    }
}

/// A specialized Result type for pvrlink operations.
pub type Result<T> = std::result::Result<T, ServerError>;
