//! Stream session: the lifecycle of one channel's connection.
//!
//! ```text
//!   precheck ──fail──▶ "no_internet" ──▶ Ended(NoConnectivity)
//!      │
//!   announcement (or preload)
//!      │
//!   Connecting ──ok──▶ Playing ──stall/end──┐
//!      ▲    │                               │
//!      │    └──fail──▶ Retrying ◀───────────┘
//!      │                  │  retry < max: "error_retrying" once, wait
//!      └──────────────────┘  retry = max:  Failed ──▶ "error_failed" ──▶ Ended(Failed)
//! ```
//!
//! The session runs as its own task and reports every transition on the
//! orchestrator queue tagged with its id.  Teardown is an abort of that task;
//! the watchdog lives inside it and dies with it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use klarfunk_proto::config::{AnnouncementClips, Config, Sequencing};
use klarfunk_proto::model::{Channel, ChannelId, SessionState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::announce::Announcer;
use crate::audio::{AudioOutput, StreamProbe};
use crate::connectivity::Reachability;
use crate::core::DaemonEvent;
use crate::error::SessionFault;

pub type SessionId = u64;

/// Minimum position advance that counts as audio progress.
const PROGRESS_EPSILON: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub stall: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub watchdog: Option<WatchdogSettings>,
    /// Probe reachability before the first connect.
    pub precheck: bool,
    pub sequencing: Sequencing,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry.max_attempts,
            retry_delay: config.retry.delay(),
            connect_timeout: config.retry.connect_timeout(),
            watchdog: config.watchdog.enabled.then(|| WatchdogSettings {
                interval: config.watchdog.check_interval(),
                stall: config.watchdog.stall_threshold(),
            }),
            precheck: config.connectivity.enabled,
            sequencing: config.announcements.sequencing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionClips {
    pub retrying: PathBuf,
    pub failed: PathBuf,
    pub no_internet: PathBuf,
}

impl From<&AnnouncementClips> for SessionClips {
    fn from(clips: &AnnouncementClips) -> Self {
        Self {
            retrying: clips.retrying.clone(),
            failed: clips.failed.clone(),
            no_internet: clips.no_internet.clone(),
        }
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub audio: Arc<dyn AudioOutput>,
    pub announcer: Arc<Announcer>,
    pub reachability: Arc<dyn Reachability>,
    pub settings: Arc<SessionSettings>,
    pub clips: Arc<SessionClips>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Failed,
    NoConnectivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    State(SessionState),
    /// The session task is done; the orchestrator falls back to idle.
    Ended(SessionEnd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    pub channel: ChannelId,
    pub update: SessionUpdate,
}

pub struct StreamSession {
    id: SessionId,
    channel: Channel,
    ctx: SessionContext,
    reports: mpsc::Sender<DaemonEvent>,
}

impl StreamSession {
    pub fn spawn(
        id: SessionId,
        channel: Channel,
        ctx: SessionContext,
        reports: mpsc::Sender<DaemonEvent>,
    ) -> JoinHandle<()> {
        let session = Self {
            id,
            channel,
            ctx,
            reports,
        };
        tokio::spawn(session.run())
    }

    async fn run(self) {
        let settings = self.ctx.settings.clone();
        info!(
            "session {}: channel {} ({})",
            self.id, self.channel.id, self.channel.name
        );

        // The channel announcement always plays; the precheck only gates
        // the first connect.
        let mut lead_in = match settings.sequencing {
            Sequencing::Before => {
                self.ctx.announcer.play(&self.channel.announcement).await;
                if !self.precheck().await {
                    self.end_offline().await;
                    return;
                }
                None
            }
            Sequencing::Preload => {
                if !self.precheck().await {
                    self.ctx.announcer.play(&self.channel.announcement).await;
                    self.end_offline().await;
                    return;
                }
                Some(self.channel.announcement.clone())
            }
        };

        let mut attempt = 0;
        let mut retry = 0;
        let mut retry_clip_played = false;
        loop {
            attempt += 1;
            self.report_state(SessionState::Connecting { attempt }).await;

            let fault = match self.connect(lead_in.take()).await {
                Ok(()) => {
                    retry = 0;
                    retry_clip_played = false;
                    self.report_state(SessionState::Playing).await;
                    let fault = self.watch().await;
                    // Unload the dead stream so nothing resumes it later.
                    if let Err(e) = self.ctx.audio.stop().await {
                        debug!("session {}: stop after {}: {}", self.id, fault, e);
                    }
                    fault
                }
                Err(fault) => fault,
            };
            warn!("session {}: {}", self.id, fault);

            retry += 1;
            self.report_state(SessionState::Retrying { retry }).await;
            if retry >= settings.max_attempts {
                error!("session {}: {}", self.id, SessionFault::Exhausted(retry));
                self.report_state(SessionState::Failed).await;
                self.ctx.announcer.play(&self.ctx.clips.failed).await;
                self.report(SessionUpdate::Ended(SessionEnd::Failed)).await;
                return;
            }
            if !retry_clip_played {
                self.ctx.announcer.play(&self.ctx.clips.retrying).await;
                retry_clip_played = true;
            }
            tokio::time::sleep(settings.retry_delay).await;
        }
    }

    /// Reachability before the first connect; true when disabled.
    async fn precheck(&self) -> bool {
        !self.ctx.settings.precheck || self.ctx.reachability.is_reachable().await
    }

    async fn end_offline(&self) {
        warn!("session {}: {}", self.id, SessionFault::NoConnectivity);
        self.ctx.announcer.play(&self.ctx.clips.no_internet).await;
        self.report(SessionUpdate::Ended(SessionEnd::NoConnectivity)).await;
    }

    async fn connect(&self, lead_in: Option<PathBuf>) -> Result<(), SessionFault> {
        let mut budget = self.ctx.settings.connect_timeout;
        if lead_in.is_some() {
            budget += self.ctx.announcer.timeout();
        }
        let open = self
            .ctx
            .audio
            .open_stream(&self.channel.stream_url, lead_in.as_deref());
        match tokio::time::timeout(budget, open).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionFault::Connect(e.to_string())),
            Err(_) => {
                // A late connect must not play while we back off.
                if let Err(e) = self.ctx.audio.stop().await {
                    debug!("session {}: stop after connect timeout: {}", self.id, e);
                }
                Err(SessionFault::Connect(format!(
                    "timed out after {:.1}s",
                    budget.as_secs_f64()
                )))
            }
        }
    }

    /// Probe the stream until it stalls or ends.
    async fn watch(&self) -> SessionFault {
        let Some(watchdog) = self.ctx.settings.watchdog else {
            return std::future::pending().await;
        };
        let mut ticker = interval_at(Instant::now() + watchdog.interval, watchdog.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_position: Option<f64> = None;
        let mut last_progress = Instant::now();

        loop {
            let now = ticker.tick().await;
            match self.ctx.audio.probe().await {
                Ok(StreamProbe::Ended) => return SessionFault::Ended,
                Ok(StreamProbe::Position(pos)) => {
                    if last_position.map_or(true, |last| pos > last + PROGRESS_EPSILON) {
                        last_position = Some(pos);
                        last_progress = now;
                    }
                }
                Ok(StreamProbe::NoPosition) => {}
                Err(e) => debug!("session {}: probe failed: {}", self.id, e),
            }
            let quiet = now.duration_since(last_progress);
            if quiet >= watchdog.stall {
                return SessionFault::Stall(quiet.as_secs_f64());
            }
        }
    }

    async fn report_state(&self, state: SessionState) {
        debug!("session {}: {:?}", self.id, state);
        self.report(SessionUpdate::State(state)).await;
    }

    async fn report(&self, update: SessionUpdate) {
        let report = SessionReport {
            id: self.id,
            channel: self.channel.id,
            update,
        };
        if self.reports.send(DaemonEvent::Session(report)).await.is_err() {
            debug!("session {}: orchestrator gone", self.id);
        }
    }
}
