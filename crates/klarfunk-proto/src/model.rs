use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Number of channel buttons on the front panel.
pub const CHANNEL_COUNT: u8 = 5;

/// One-based channel identifier, `1..=CHANNEL_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(number: u8) -> Option<Self> {
        (1..=CHANNEL_COUNT).contains(&number).then_some(Self(number))
    }

    /// Zero-based position in the configured channel list.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    pub fn all() -> impl Iterator<Item = ChannelId> {
        (1..=CHANNEL_COUNT).map(ChannelId)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A radio channel as loaded from configuration.  Immutable; the engine only
/// ever holds clones or references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub stream_url: String,
    /// Fully resolved path of the spoken channel name.
    pub announcement: PathBuf,
}

/// Logical identity of a sampled input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineId {
    Channel(ChannelId),
    Switch,
}

impl LineId {
    /// The six lines in sampling order: channel buttons first, then the switch.
    pub fn all() -> impl Iterator<Item = LineId> {
        ChannelId::all()
            .map(LineId::Channel)
            .chain(std::iter::once(LineId::Switch))
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineId::Channel(id) => write!(f, "button {}", id),
            LineId::Switch => write!(f, "switch"),
        }
    }
}

/// Electrical level of an input line.  Buttons are wired against pull-ups, so
/// a pressed button reads `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    On,
    #[default]
    Off,
}

impl PowerState {
    /// Derive the power state from the switch level.  Without inversion a
    /// `High` switch means on.
    pub fn from_level(level: Level, inverted: bool) -> Self {
        match (level, inverted) {
            (Level::High, false) | (Level::Low, true) => PowerState::On,
            _ => PowerState::Off,
        }
    }
}

/// Domain commands produced by the input router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SelectChannel(ChannelId),
    RequestShutdown,
    /// The switch settled in a new position; carries the derived power state.
    PowerToggle(PowerState),
}

/// Lifecycle state of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Connection attempt `attempt` (1-based) in progress.
    Connecting { attempt: u32 },
    Playing,
    /// Waiting to reconnect; `retry` is the retry count after incrementing.
    Retrying { retry: u32 },
    Failed,
    Stopped,
}
