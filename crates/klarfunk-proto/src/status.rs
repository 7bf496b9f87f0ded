use crate::model::{ChannelId, PowerState, SessionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Snapshot of what the radio is doing.  `rev` is incremented on every
/// change so observers can tell whether anything happened between reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RadioStatus {
    pub rev: u64,
    pub power: PowerState,
    pub channel: Option<ChannelId>,
    pub channel_name: Option<String>,
    pub session: Option<SessionState>,
    #[serde(default)]
    pub shutting_down: bool,
}

/// Shared, revisioned status written by the orchestrator and read by the
/// heartbeat writer.  Never persisted.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    state: Arc<RwLock<RadioStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> RadioStatus {
        self.state.read().await.clone()
    }

    pub async fn set_power(&self, power: PowerState) {
        let mut state = self.state.write().await;
        state.power = power;
        state.rev += 1;
    }

    /// Record the state of the session playing `channel`.
    pub async fn set_session(&self, channel: ChannelId, name: &str, session: SessionState) {
        let mut state = self.state.write().await;
        state.channel = Some(channel);
        state.channel_name = Some(name.to_string());
        state.session = Some(session);
        state.rev += 1;
    }

    /// No session any more: idle.
    pub async fn clear_session(&self) {
        let mut state = self.state.write().await;
        state.channel = None;
        state.channel_name = None;
        state.session = None;
        state.rev += 1;
    }

    pub async fn set_shutting_down(&self) {
        let mut state = self.state.write().await;
        state.shutting_down = true;
        state.rev += 1;
    }
}
