//! The single audio output.  Clips and streams share it: loading one replaces
//! whatever was playing before.

use async_trait::async_trait;
use klarfunk_proto::config::AudioConfig;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::error::AudioError;
use crate::mpv::{MpvEvent, MpvHandle, MpvOptions, MpvProcess};

/// Result of a watchdog probe of the current stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamProbe {
    /// Playback position in seconds.
    Position(f64),
    /// Playing, but no position is known yet.
    NoPosition,
    /// Nothing is playing any more.
    Ended,
}

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `clip` to its end.
    async fn play_clip(&self, clip: &Path) -> Result<(), AudioError>;

    /// Open `url` and return once audio is flowing.  With a `lead_in` clip
    /// the stream is queued behind it and connects while the clip plays.
    async fn open_stream(&self, url: &str, lead_in: Option<&Path>) -> Result<(), AudioError>;

    async fn probe(&self) -> Result<StreamProbe, AudioError>;

    /// Silence the output.
    async fn stop(&self) -> Result<(), AudioError>;
}

/// [`AudioOutput`] backed by an mpv child process.
pub struct MpvAudio {
    handle: MpvHandle,
    /// Template receiver; each wait takes a fresh one.
    events: Mutex<broadcast::Receiver<MpvEvent>>,
    _process: Mutex<MpvProcess>,
}

impl MpvAudio {
    pub async fn start(config: &AudioConfig) -> anyhow::Result<Self> {
        let options = MpvOptions::from_config(config)?;
        let sender = MpvProcess::event_channel();
        let events = sender.subscribe();
        let (process, handle) = MpvProcess::spawn(&options, sender).await?;
        Ok(Self {
            handle,
            events: Mutex::new(events),
            _process: Mutex::new(process),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<MpvEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .resubscribe()
    }

    /// Queue `target` and return the playlist entry id mpv assigned to it.
    async fn load(&self, target: &str, mode: &str) -> Result<Option<u64>, AudioError> {
        let reply = self
            .handle
            .send(json!(["loadfile", target, mode]))
            .await
            .map_err(|e| AudioError::Playback(format!("loadfile {}: {}", target, e)))?;
        Ok(loaded_entry(&reply))
    }
}

/// mpv 0.38+ answers `loadfile` with `{"data": {"playlist_entry_id": N}}`.
fn loaded_entry(reply: &Value) -> Option<u64> {
    reply.get("data")?.get("playlist_entry_id")?.as_u64()
}

async fn next_event(rx: &mut broadcast::Receiver<MpvEvent>) -> Result<MpvEvent, AudioError> {
    loop {
        match rx.recv().await {
            Ok(event) => return Ok(event),
            Err(RecvError::Lagged(n)) => warn!("mpv: missed {} events", n),
            Err(RecvError::Closed) => {
                return Err(AudioError::Backend("mpv event stream closed".to_string()))
            }
        }
    }
}

/// Wait for the `start-file` of playlist entry `entry` and return its id.
/// `start-file` events of other entries, such as one loaded just before an
/// abort, are skipped.  Older mpv versions do not report the entry id; then
/// the `nth` start after subscribing (1-based) is taken.
async fn wait_started(
    rx: &mut broadcast::Receiver<MpvEvent>,
    entry: Option<u64>,
    nth: usize,
) -> Result<Option<u64>, AudioError> {
    let mut seen = 0;
    loop {
        let event = next_event(rx).await?;
        if event.name() != Some("start-file") {
            continue;
        }
        match entry {
            Some(id) if event.playlist_entry_id() == Some(id) => return Ok(entry),
            Some(_) => debug!("audio: skipping start of entry {:?}", event.playlist_entry_id()),
            None => {
                seen += 1;
                if seen == nth {
                    return Ok(event.playlist_entry_id());
                }
            }
        }
    }
}

fn is_entry(event: &MpvEvent, entry: Option<u64>) -> bool {
    entry.is_none() || event.playlist_entry_id() == entry
}

fn end_error(event: &MpvEvent) -> AudioError {
    let reason = event.end_reason().unwrap_or("unknown");
    match event.file_error() {
        Some(detail) => AudioError::Playback(format!("{} ({})", reason, detail)),
        None => AudioError::Playback(reason.to_string()),
    }
}

#[async_trait]
impl AudioOutput for MpvAudio {
    async fn play_clip(&self, clip: &Path) -> Result<(), AudioError> {
        if !clip.exists() {
            return Err(AudioError::MissingClip(clip.to_path_buf()));
        }
        let mut rx = self.subscribe();
        let loaded = self.load(&clip.to_string_lossy(), "replace").await?;
        let entry = wait_started(&mut rx, loaded, 1).await?;
        debug!("audio: clip {} started", clip.display());

        loop {
            let event = next_event(&mut rx).await?;
            if event.name() == Some("end-file") && is_entry(&event, entry) {
                return match event.end_reason() {
                    Some("eof") => Ok(()),
                    _ => Err(end_error(&event)),
                };
            }
        }
    }

    async fn open_stream(&self, url: &str, lead_in: Option<&Path>) -> Result<(), AudioError> {
        let mut rx = self.subscribe();
        let lead_in = lead_in.filter(|clip| {
            let exists = clip.exists();
            if !exists {
                warn!("audio: lead-in clip {} missing, connecting directly", clip.display());
            }
            exists
        });

        let (loaded, nth) = match lead_in {
            Some(clip) => {
                self.load(&clip.to_string_lossy(), "replace").await?;
                (self.load(url, "append").await?, 2)
            }
            None => (self.load(url, "replace").await?, 1),
        };
        let entry = wait_started(&mut rx, loaded, nth).await?;
        debug!("audio: stream {} loading", url);

        loop {
            let event = next_event(&mut rx).await?;
            match event.name() {
                Some("playback-restart") => {
                    info!("audio: stream {} playing", url);
                    return Ok(());
                }
                Some("end-file") if is_entry(&event, entry) => return Err(end_error(&event)),
                _ => {}
            }
        }
    }

    async fn probe(&self) -> Result<StreamProbe, AudioError> {
        if self.handle.get_property("idle-active").await?.as_bool() == Some(true) {
            return Ok(StreamProbe::Ended);
        }
        // time-pos is "property unavailable" until the first frame decodes.
        match self.handle.get_property("time-pos").await {
            Ok(Value::Number(n)) => Ok(n.as_f64().map_or(StreamProbe::NoPosition, StreamProbe::Position)),
            Ok(_) | Err(_) => Ok(StreamProbe::NoPosition),
        }
    }

    async fn stop(&self) -> Result<(), AudioError> {
        self.handle.send(json!(["stop"])).await?;
        Ok(())
    }
}
