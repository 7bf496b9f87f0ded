//! Fault taxonomy.  Every fault is handled where it occurs and only ever
//! reaches the orchestrator as a state transition.

use klarfunk_proto::model::LineId;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by the audio backend.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("clip not found: {}", .0.display())]
    MissingClip(PathBuf),

    /// The backend played the item but it ended with an error (decode error,
    /// refused connection, 404, ...).
    #[error("playback failed: {0}")]
    Playback(String),

    /// The backend itself is unreachable (IPC gone, process dead).
    #[error("audio backend unavailable: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for AudioError {
    fn from(err: anyhow::Error) -> Self {
        AudioError::Backend(err.to_string())
    }
}

/// A raw sample could not be read.  Sampling continues with the last level.
#[derive(Debug, Error)]
#[error("failed to read {line}: {source}")]
pub struct InputFault {
    pub line: LineId,
    #[source]
    pub source: std::io::Error,
}

/// An announcement could not be played; treated as completed.
#[derive(Debug, Error)]
#[error("announcement {} failed: {source}", .clip.display())]
pub struct AnnouncementFault {
    pub clip: PathBuf,
    #[source]
    pub source: AudioError,
}

/// Faults inside a stream session.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error("stream connect failed: {0}")]
    Connect(String),

    #[error("stream stalled: no audio progress for {0:.1}s")]
    Stall(f64),

    #[error("stream ended unexpectedly")]
    Ended,

    #[error("giving up after {0} connection attempts")]
    Exhausted(u32),

    #[error("no internet connectivity")]
    NoConnectivity,
}
