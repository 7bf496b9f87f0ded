//! In-process fakes for the engine's seams.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use klarfunk_proto::model::{Level, LineId};
use tokio::time::Instant;

use crate::audio::{AudioOutput, StreamProbe};
use crate::connectivity::Reachability;
use crate::error::{AudioError, InputFault};
use crate::input::LineSampler;
use crate::shutdown::ShutdownHandler;

#[derive(Debug, Clone, PartialEq)]
pub enum AudioCall {
    Clip(PathBuf),
    Stream { url: String, lead_in: Option<PathBuf> },
    Probe,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBehavior {
    /// Connect fails after a short delay.
    Fail,
    /// Connects; position advances with time.
    Play,
    /// Connects; position never moves.
    Stall,
}

#[derive(Debug)]
struct AudioState {
    calls: Vec<AudioCall>,
    stream: StreamBehavior,
    missing: HashSet<PathBuf>,
    started: Option<Instant>,
}

/// Records every call.  Clips take `clip_duration` of (virtual) time.
#[derive(Debug)]
pub struct FakeAudio {
    clip_duration: Duration,
    state: Mutex<AudioState>,
}

impl FakeAudio {
    pub fn new(clip_duration: Duration) -> Self {
        Self {
            clip_duration,
            state: Mutex::new(AudioState {
                calls: Vec::new(),
                stream: StreamBehavior::Play,
                missing: HashSet::new(),
                started: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AudioState> {
        self.state.lock().unwrap()
    }

    pub fn set_stream(&self, behavior: StreamBehavior) {
        self.state().stream = behavior;
    }

    pub fn mark_missing(&self, clip: impl Into<PathBuf>) {
        self.state().missing.insert(clip.into());
    }

    /// The current stream stops as if the server hung up.
    pub fn end_stream(&self) {
        self.state().started = None;
    }

    pub fn calls(&self) -> Vec<AudioCall> {
        self.state().calls.clone()
    }

    pub fn stream_opens(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, AudioCall::Stream { .. }))
            .count()
    }

    pub fn probes(&self) -> usize {
        self.calls().iter().filter(|c| **c == AudioCall::Probe).count()
    }

    pub fn clip_count(&self, clip: impl AsRef<Path>) -> usize {
        let clip = clip.as_ref();
        self.calls()
            .iter()
            .filter(|c| matches!(c, AudioCall::Clip(p) if p == clip))
            .count()
    }

    /// Calls other than probes, for ordering assertions.
    pub fn timeline(&self) -> Vec<AudioCall> {
        self.calls()
            .into_iter()
            .filter(|c| *c != AudioCall::Probe)
            .collect()
    }
}

#[async_trait]
impl AudioOutput for FakeAudio {
    async fn play_clip(&self, clip: &Path) -> Result<(), AudioError> {
        {
            let mut state = self.state();
            state.calls.push(AudioCall::Clip(clip.to_path_buf()));
            // Like mpv: a missing file is rejected before anything is loaded,
            // so whatever was playing keeps playing.
            if state.missing.contains(clip) {
                return Err(AudioError::MissingClip(clip.to_path_buf()));
            }
            state.started = None;
        }
        tokio::time::sleep(self.clip_duration).await;
        Ok(())
    }

    async fn open_stream(&self, url: &str, lead_in: Option<&Path>) -> Result<(), AudioError> {
        let behavior = {
            let mut state = self.state();
            state.calls.push(AudioCall::Stream {
                url: url.to_string(),
                lead_in: lead_in.map(Path::to_path_buf),
            });
            state.started = None;
            state.stream
        };
        if lead_in.is_some() {
            tokio::time::sleep(self.clip_duration).await;
        }
        match behavior {
            StreamBehavior::Fail => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(AudioError::Playback("error (connection refused)".to_string()))
            }
            StreamBehavior::Play | StreamBehavior::Stall => {
                self.state().started = Some(Instant::now());
                Ok(())
            }
        }
    }

    async fn probe(&self) -> Result<StreamProbe, AudioError> {
        let mut state = self.state();
        state.calls.push(AudioCall::Probe);
        Ok(match (state.started, state.stream) {
            (None, _) | (Some(_), StreamBehavior::Fail) => StreamProbe::Ended,
            (Some(_), StreamBehavior::Stall) => StreamProbe::Position(0.0),
            (Some(at), StreamBehavior::Play) => StreamProbe::Position(at.elapsed().as_secs_f64()),
        })
    }

    async fn stop(&self) -> Result<(), AudioError> {
        let mut state = self.state();
        state.calls.push(AudioCall::Stop);
        state.started = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeReachability {
    reachable: AtomicBool,
    checks: AtomicUsize,
}

impl FakeReachability {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reachability for FakeReachability {
    async fn is_reachable(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct RecordingShutdown {
    calls: AtomicUsize,
}

impl RecordingShutdown {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShutdownHandler for RecordingShutdown {
    async fn shutdown(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Line levels set by the test.  Buttons start released, the switch Off.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLines {
    levels: Arc<Mutex<HashMap<LineId, Level>>>,
    failing: Arc<Mutex<HashSet<LineId>>>,
}

impl ScriptedLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, line: LineId, level: Level) {
        self.levels.lock().unwrap().insert(line, level);
    }

    pub fn fail(&self, line: LineId, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(line);
        } else {
            set.remove(&line);
        }
    }
}

impl LineSampler for ScriptedLines {
    fn read(&mut self, line: LineId) -> Result<Level, InputFault> {
        if self.failing.lock().unwrap().contains(&line) {
            return Err(InputFault {
                line,
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted fault"),
            });
        }
        let default = match line {
            LineId::Switch => Level::Low,
            LineId::Channel(_) => Level::High,
        };
        Ok(*self.levels.lock().unwrap().get(&line).unwrap_or(&default))
    }
}
