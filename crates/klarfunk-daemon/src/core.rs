//! Orchestrator: the single owner of power state and the playback session.
//!
//! Everything that can change what the radio does arrives as a
//! [`DaemonEvent`] on one ordered queue and is handled here one at a time:
//!
//! ```text
//!   sampler ──Startup / Command──┐
//!   sessions ──Session(report)───┼──▶ Orchestrator::run ──▶ Announcer / StreamSession
//!   signals ──Exit───────────────┘
//! ```
//!
//! Announcements and sessions run as spawned tasks.  Teardown aborts them and
//! waits for the abort to land before stopping the output, so nothing that
//! was cancelled can make a sound afterwards.
use std::future::Future;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use klarfunk_proto::config::AnnouncementClips;
use klarfunk_proto::model::{Channel, ChannelId, Command, PowerState, SessionState};
use klarfunk_proto::status::StatusBoard;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::announce::Announcer;
use crate::audio::AudioOutput;
use crate::connectivity::Reachability;
use crate::session::{SessionContext, SessionId, SessionReport, SessionUpdate, StreamSession};
use crate::shutdown::ShutdownHandler;

#[derive(Debug)]
pub enum DaemonEvent {
    /// Initial switch position, sent once by the sampler.
    Startup(PowerState),
    Command(Command),
    Session(SessionReport),
    /// Leave without powering the machine off (signal, keyboard quit).
    Exit,
}

struct ActiveSession {
    id: SessionId,
    channel: ChannelId,
    state: Option<SessionState>,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    channels: Vec<Channel>,
    clips: AnnouncementClips,
    audio: Arc<dyn AudioOutput>,
    announcer: Arc<Announcer>,
    reachability: Arc<dyn Reachability>,
    shutdown: Arc<dyn ShutdownHandler>,
    session_ctx: SessionContext,
    status: StatusBoard,
    /// Handed to sessions for their reports.
    events: mpsc::Sender<DaemonEvent>,

    power: PowerState,
    session: Option<ActiveSession>,
    /// Announcement sequence in flight (startup, power on/off).
    job: Option<JoinHandle<()>>,
    next_session_id: SessionId,
}

impl Orchestrator {
    pub fn new(
        channels: Vec<Channel>,
        clips: AnnouncementClips,
        session_ctx: SessionContext,
        shutdown: Arc<dyn ShutdownHandler>,
        status: StatusBoard,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            channels,
            clips,
            audio: session_ctx.audio.clone(),
            announcer: session_ctx.announcer.clone(),
            reachability: session_ctx.reachability.clone(),
            shutdown,
            session_ctx,
            status,
            events,
            power: PowerState::Off,
            session: None,
            job: None,
            next_session_id: 1,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("orchestrator: {} channels configured", self.channels.len());

        while let Some(event) = events.recv().await {
            match event {
                DaemonEvent::Startup(power) => self.on_startup(power).await,
                DaemonEvent::Command(command) => {
                    info!("orchestrator: {:?}", command);
                    if self.on_command(command).await.is_break() {
                        break;
                    }
                }
                DaemonEvent::Session(report) => self.on_session_report(report).await,
                DaemonEvent::Exit => {
                    info!("orchestrator: exit requested");
                    self.silence().await;
                    break;
                }
            }
        }

        info!("orchestrator: stopped");
        Ok(())
    }

    async fn on_startup(&mut self, power: PowerState) {
        info!("orchestrator: startup, switch {:?}", power);
        self.power = power;
        self.status.set_power(power).await;

        let branding = self.clips.startup_branding.clone();
        let follow_up = match power {
            PowerState::On => None,
            PowerState::Off => Some(self.clips.selector_off.clone()),
        };
        let connected = self.clips.boot_connected.clone();
        let no_internet = self.clips.boot_no_internet.clone();
        let announcer = self.announcer.clone();
        let reachability = self.reachability.clone();

        // Connectivity is announced whatever the switch says.
        self.start_job(async move {
            if branding.exists() {
                announcer.play(&branding).await;
            }
            let boot = if reachability.is_reachable().await {
                connected
            } else {
                no_internet
            };
            announcer.play(&boot).await;
            if let Some(clip) = follow_up {
                announcer.play(&clip).await;
            }
        })
        .await;
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::PowerToggle(power) => self.on_power(power).await,
            Command::SelectChannel(id) => self.on_select(id).await,
            Command::RequestShutdown => {
                self.on_shutdown().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_power(&mut self, power: PowerState) {
        if power == self.power {
            debug!("orchestrator: already {:?}", power);
            return;
        }
        self.power = power;
        self.status.set_power(power).await;
        self.silence().await;

        let clip = match power {
            PowerState::On => self.clips.power_on.clone(),
            PowerState::Off => self.clips.goodbye.clone(),
        };
        self.announce(clip).await;
    }

    async fn on_select(&mut self, id: ChannelId) {
        if self.power == PowerState::Off {
            debug!("orchestrator: ignoring channel {} while off", id);
            return;
        }
        let Some(channel) = self.channels.get(id.index()).cloned() else {
            warn!("orchestrator: channel {} is not configured", id);
            return;
        };
        if let Some(active) = &self.session {
            if active.channel == id && active.state == Some(SessionState::Playing) {
                debug!("orchestrator: channel {} already playing", id);
                return;
            }
        }

        self.silence().await;

        let session_id = self.next_session_id;
        self.next_session_id += 1;
        info!(
            "orchestrator: session {} for channel {} ({})",
            session_id, id, channel.name
        );
        let task = StreamSession::spawn(
            session_id,
            channel,
            self.session_ctx.clone(),
            self.events.clone(),
        );
        self.session = Some(ActiveSession {
            id: session_id,
            channel: id,
            state: None,
            task,
        });
    }

    async fn on_shutdown(&mut self) {
        info!("orchestrator: shutdown requested");
        self.status.set_shutting_down().await;
        self.silence().await;
        self.announcer.play(&self.clips.shutdown).await;
        if let Err(e) = self.shutdown.shutdown().await {
            error!("orchestrator: shutdown failed: {:#}", e);
        }
    }

    async fn on_session_report(&mut self, report: SessionReport) {
        let Some(active) = self.session.as_mut().filter(|a| a.id == report.id) else {
            debug!("orchestrator: dropping stale report from session {}", report.id);
            return;
        };

        match report.update {
            SessionUpdate::State(state) => {
                active.state = Some(state);
                let name = self
                    .channels
                    .get(report.channel.index())
                    .map(|c| c.name.as_str())
                    .unwrap_or_default();
                self.status.set_session(report.channel, name, state).await;
            }
            SessionUpdate::Ended(end) => {
                info!("orchestrator: session {} ended ({:?})", report.id, end);
                self.session = None;
                self.status.clear_session().await;
            }
        }
    }

    /// Replace the running announcement job with `clip`.
    async fn announce(&mut self, clip: PathBuf) {
        let announcer = self.announcer.clone();
        self.start_job(async move {
            announcer.play(&clip).await;
        })
        .await;
    }

    async fn start_job<F>(&mut self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.job.take() {
            previous.abort();
            let _ = previous.await;
        }
        self.job = Some(tokio::spawn(job));
    }

    /// Stop everything audible: the announcement job, the session, then the
    /// output itself.
    async fn silence(&mut self) {
        // Abort both before yielding: an aborted task is never polled again,
        // so a session cannot move on from its cut-off announcement.
        let job = self.job.take();
        let session = self.session.take();
        if let Some(job) = &job {
            job.abort();
        }
        if let Some(active) = &session {
            active.task.abort();
        }
        self.announcer.interrupt();

        if let Some(job) = job {
            let _ = job.await;
        }
        if let Some(active) = session {
            let _ = active.task.await;
            info!("orchestrator: session {} stopped", active.id);
            if let Some(channel) = self.channels.get(active.channel.index()) {
                self.status
                    .set_session(active.channel, &channel.name, SessionState::Stopped)
                    .await;
            }
            self.status.clear_session().await;
        }
        if let Err(e) = self.audio.stop().await {
            warn!("orchestrator: stopping output failed: {}", e);
        }
    }
}
