//! Input sampling and routing.
//!
//! A single periodic task polls every line through a [`LineSampler`], feeds
//! the [`Debouncer`] and turns debounced events into [`Command`]s on the
//! orchestrator queue.  The task never awaits audio or network.

use std::collections::HashSet;
use std::time::Duration;

use klarfunk_proto::model::{ChannelId, Command, Level, LineId, PowerState};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;
use crate::debounce::{Debouncer, InputEvent, InputEventKind, LineKind};
use crate::error::InputFault;

/// Something that can report the current raw level of each input line.
pub trait LineSampler: Send {
    fn read(&mut self, line: LineId) -> Result<Level, InputFault>;
}

/// Static mapping from debounced line events to domain commands.
#[derive(Debug, Clone, Copy)]
pub struct InputRouter {
    shutdown_line: LineId,
    invert_switch: bool,
}

impl InputRouter {
    pub fn new(shutdown_channel: ChannelId, invert_switch: bool) -> Self {
        Self {
            shutdown_line: LineId::Channel(shutdown_channel),
            invert_switch,
        }
    }

    pub fn power_state(&self, switch_level: Level) -> PowerState {
        PowerState::from_level(switch_level, self.invert_switch)
    }

    /// Only the shutdown button carries a long-press action.
    pub fn has_long_press_action(&self, line: LineId) -> bool {
        line == self.shutdown_line
    }

    pub fn route(&self, event: InputEvent) -> Option<Command> {
        match (event.line, event.kind) {
            (LineId::Channel(id), InputEventKind::ShortPress) => Some(Command::SelectChannel(id)),
            (line, InputEventKind::LongPress) if line == self.shutdown_line => {
                Some(Command::RequestShutdown)
            }
            (LineId::Switch, InputEventKind::SwitchChanged(level)) => {
                Some(Command::PowerToggle(self.power_state(level)))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub debounce: Duration,
    pub long_press: Duration,
}

/// Poll `sampler` forever.  The first round of samples seeds the debouncer
/// and is reported as `DaemonEvent::Startup` with the initial power state.
/// Returns once the orchestrator queue is closed.
pub async fn run_sampler<S: LineSampler>(
    mut sampler: S,
    router: InputRouter,
    settings: SamplerSettings,
    events: mpsc::Sender<DaemonEvent>,
) {
    let mut debouncer = Debouncer::new(settings.debounce);
    let mut faulted: HashSet<LineId> = HashSet::new();
    let start = Instant::now();

    for line in LineId::all() {
        let level = match sampler.read(line) {
            Ok(level) => level,
            Err(fault) => {
                warn!("input: {}", fault);
                faulted.insert(line);
                Level::High
            }
        };
        let kind = match line {
            LineId::Switch => LineKind::Switch,
            LineId::Channel(_) => LineKind::Button {
                long_press: router
                    .has_long_press_action(line)
                    .then_some(settings.long_press),
            },
        };
        debouncer.add_line(line, kind, level, start);
    }

    let switch_level = debouncer
        .line(LineId::Switch)
        .map(|l| l.level())
        .unwrap_or(Level::Low);
    let initial = router.power_state(switch_level);
    info!("input: sampling every {:?}, switch starts {:?}", settings.interval, initial);
    if events.send(DaemonEvent::Startup(initial)).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let now = ticker.tick().await;
        for line in LineId::all() {
            let raw = match sampler.read(line) {
                Ok(level) => {
                    if faulted.remove(&line) {
                        info!("input: {} readable again", line);
                    }
                    level
                }
                Err(fault) => {
                    if faulted.insert(line) {
                        warn!("input: {}, keeping last level", fault);
                    }
                    match debouncer.line(line) {
                        Some(l) => l.level(),
                        None => continue,
                    }
                }
            };

            let Some(event) = debouncer.sample(line, raw, now) else {
                continue;
            };
            debug!("input: {} {:?}", event.line, event.kind);
            let Some(command) = router.route(event) else {
                continue;
            };
            info!("input: {} -> {:?}", event.line, command);
            match events.try_send(DaemonEvent::Command(command)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("input: command queue full, dropping {:?}", command);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("input: command queue closed, sampler exiting");
                    return;
                }
            }
        }
    }
}
