//! Engine error types
//!
//! Only request refusal surfaces synchronously. Everything that goes wrong on
//! the process thread becomes state, a counter, or a notification.

use thiserror::Error;

use crate::RequestSource;

/// Why a transport request was refused at the API boundary
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum RequestError {
    #[error("transport is actively recording; locate refused")]
    ActivelyRecording,

    #[error("session event queue is full")]
    QueueFull,

    #[error("audio engine is halted")]
    EngineHalted,

    #[error("following an external transport master; request from {0:?} ignored")]
    FollowingExternalMaster(RequestSource),

    #[error("invalid transport speed {0}")]
    InvalidSpeed(f64),

    #[error("invalid range {start}..{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("no session range is defined")]
    NoSessionRange,

    #[error("no loop range is defined")]
    NoLoopRange,

    #[error("no punch range is defined")]
    NoPunchRange,

    #[error("auto punch and looping cannot be armed together")]
    PunchLoopConflict,

    #[error("play range request has no ranges")]
    NoPlayRange,

    #[error("transport is already rolling")]
    TransportRolling,
}

/// A route-processing fault reported back to the cycle driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("DSP fault in route {0}")]
    Dsp(u32),

    #[error("route processing failed: {0}")]
    Other(&'static str),
}

/// Failure inside deferred butler work
#[derive(Error, Debug)]
pub enum ButlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("seek to {0} failed")]
    Seek(u64),

    #[error("{0}")]
    Worker(String),
}

pub type RequestResult<T = ()> = Result<T, RequestError>;
