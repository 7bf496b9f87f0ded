//! mpv child process and its JSON IPC connection.
//!
//! ```text
//!   MpvProcess::spawn()
//!         │
//!         ├── writer_task   ← IpcRequest via mpsc, one JSON line each → socket
//!         └── reader_task   ← JSON lines from socket
//!                                ├── reply (has request_id) → waiting oneshot
//!                                └── event                  → broadcast to every subscriber
//! ```
//!
//! Replies resolve the future returned by [`MpvHandle::send`].  Events are
//! broadcast so several waiters (a clip, a stream connect) can follow the
//! same playback without stealing each other's messages.
use klarfunk_proto::config::AudioConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_WAIT_ATTEMPTS: u32 = 50;
const SOCKET_POLL: Duration = Duration::from_millis(100);
const EVENT_BUFFER: usize = 256;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

type Reply = anyhow::Result<Value>;
type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

struct IpcRequest {
    id: u64,
    line: String,
    reply: oneshot::Sender<Reply>,
}

/// Unsolicited message from mpv (`start-file`, `end-file`, `playback-restart`, ...).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    pub fn playlist_entry_id(&self) -> Option<u64> {
        self.raw.get("playlist_entry_id")?.as_u64()
    }

    /// `end-file` reason: "eof", "stop", "quit", "error" or "redirect".
    pub fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }

    pub fn file_error(&self) -> Option<&str> {
        self.raw.get("file_error")?.as_str()
    }
}

/// Cloneable sender side of the IPC connection.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<IpcRequest>,
}

impl MpvHandle {
    /// Send one command and wait for mpv's reply.  A reply whose `error` field
    /// is not "success" becomes an `Err`.
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "command": command, "request_id": id }))?;
        line.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IpcRequest {
                id,
                line,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for request {}", id))?
            .map_err(|_| anyhow::anyhow!("mpv reply dropped for request {}", id))?
    }

    pub async fn get_property(&self, name: &str) -> anyhow::Result<Value> {
        let reply = self.send(json!(["get_property", name])).await?;
        Ok(reply.get("data").cloned().unwrap_or(Value::Null))
    }
}

/// Command-line options for the mpv child, derived from `[audio]`.
#[derive(Debug, Clone)]
pub struct MpvOptions {
    pub binary: PathBuf,
    pub socket_path: PathBuf,
    pub args: Vec<String>,
}

impl MpvOptions {
    pub fn from_config(config: &AudioConfig) -> anyhow::Result<Self> {
        let binary = klarfunk_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found (set MPV_PATH or install mpv)"))?;

        let mut args = vec![
            "--no-video".to_string(),
            "--idle=yes".to_string(),
            "--quiet".to_string(),
            "--no-terminal".to_string(),
            "--prefetch-playlist=yes".to_string(),
            klarfunk_proto::platform::mpv_socket_arg(),
            format!("--volume={}", config.volume.min(100)),
        ];
        if config.backend != "auto" {
            args.push(format!("--ao={}", config.backend));
            if config.device != "default" {
                args.push(format!("--audio-device={}/{}", config.backend, config.device));
            }
        }
        let buffer = &config.buffer;
        if buffer.enabled {
            args.push("--cache=yes".to_string());
            args.push(format!("--cache-secs={}", buffer.cache_secs));
            args.push(format!("--demuxer-max-bytes={}", buffer.demuxer_max_bytes));
        } else {
            args.push("--cache=no".to_string());
        }
        args.push(format!("--network-timeout={}", buffer.network_timeout_secs));

        Ok(Self {
            binary,
            socket_path: PathBuf::from(klarfunk_proto::platform::mpv_socket_name()),
            args,
        })
    }
}

/// The running mpv child.  Dropping it kills the process and removes the
/// socket file.
pub struct MpvProcess {
    child: Child,
    socket_path: PathBuf,
}

impl MpvProcess {
    /// Spawn mpv, wait for its IPC socket and start the reader/writer tasks.
    /// Events are published on `events`.
    pub async fn spawn(
        options: &MpvOptions,
        events: broadcast::Sender<MpvEvent>,
    ) -> anyhow::Result<(Self, MpvHandle)> {
        let socket_path = options.socket_path.clone();
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning {}", options.binary.display());
        debug!("mpv: args {:?}", options.args);
        let child = Command::new(&options.binary)
            .args(&options.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut process = Self { child, socket_path };

        let mut appeared = false;
        for _ in 0..SOCKET_WAIT_ATTEMPTS {
            tokio::time::sleep(SOCKET_POLL).await;
            if let Ok(Some(status)) = process.child.try_wait() {
                anyhow::bail!("mpv exited during startup ({})", status);
            }
            if process.socket_path.exists() {
                appeared = true;
                break;
            }
        }
        if !appeared {
            anyhow::bail!("mpv IPC socket {} did not appear", process.socket_path.display());
        }

        let stream = UnixStream::connect(&process.socket_path).await?;
        info!("mpv: connected to {}", process.socket_path.display());
        Ok((process, start_io_tasks(stream, events)))
    }

    pub fn event_channel() -> broadcast::Sender<MpvEvent> {
        broadcast::channel(EVENT_BUFFER).0
    }
}

impl Drop for MpvProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("mpv: kill on drop: {}", e);
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn start_io_tasks(stream: UnixStream, events: broadcast::Sender<MpvEvent>) -> MpvHandle {
    let (read_half, write_half) = stream.into_split();
    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::channel::<IpcRequest>(64);

    tokio::spawn(writer_task(write_half, rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, events));

    MpvHandle { tx }
}

async fn fail_pending(pending: &PendingReplies, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingReplies,
    events: broadcast::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                warn!("mpv: IPC connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(text) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv: ignoring malformed line '{}': {}", text, e);
                        continue;
                    }
                };

                match value.get("request_id").and_then(Value::as_u64) {
                    Some(id) => {
                        let Some(tx) = pending.lock().await.remove(&id) else {
                            debug!("mpv: reply for unknown request {}", id);
                            continue;
                        };
                        let result = match value.get("error").and_then(Value::as_str) {
                            Some("success") => Ok(value),
                            other => Err(anyhow::anyhow!(
                                "mpv error: {}",
                                other.unwrap_or("unknown error")
                            )),
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        if value.get("event").is_some() {
                            debug!("mpv: event {}", text);
                            // No subscribers is fine.
                            let _ = events.send(MpvEvent { raw: value });
                        }
                    }
                }
            }
            Err(e) => {
                warn!("mpv: IPC read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<IpcRequest>, pending: PendingReplies)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.id, req.reply);
        debug!("mpv: send {}", req.line.trim());
        if let Err(e) = writer.write_all(req.line.as_bytes()).await {
            warn!("mpv: IPC write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv IPC write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv: writer task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use klarfunk_proto::config::BufferConfig;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_event_accessors() {
        let ev = MpvEvent {
            raw: json!({
                "event": "end-file",
                "reason": "error",
                "playlist_entry_id": 4,
                "file_error": "loading failed"
            }),
        };
        assert_eq!(ev.name(), Some("end-file"));
        assert_eq!(ev.playlist_entry_id(), Some(4));
        assert_eq!(ev.end_reason(), Some("error"));
        assert_eq!(ev.file_error(), Some("loading failed"));
    }

    #[test]
    fn test_options_from_config() {
        if klarfunk_proto::platform::find_mpv_binary().is_none() {
            return;
        }
        let config = AudioConfig {
            backend: "alsa".to_string(),
            device: "hw:1".to_string(),
            volume: 65,
            buffer: BufferConfig {
                enabled: false,
                ..BufferConfig::default()
            },
        };
        let options = MpvOptions::from_config(&config).unwrap();
        assert!(options.args.contains(&"--ao=alsa".to_string()));
        assert!(options.args.contains(&"--audio-device=alsa/hw:1".to_string()));
        assert!(options.args.contains(&"--volume=65".to_string()));
        assert!(options.args.contains(&"--cache=no".to_string()));
    }

    #[tokio::test]
    async fn test_reply_and_event_routing() {
        let (client, server) = UnixStream::pair().unwrap();
        let events = MpvProcess::event_channel();
        let mut event_rx = events.subscribe();
        let handle = start_io_tasks(client, events);

        let (server_read, mut server_write) = server.into_split();
        let fake_mpv = tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["command"], json!(["get_property", "idle-active"]));
            let id = request["request_id"].as_u64().unwrap();

            server_write
                .write_all(b"{\"event\":\"playback-restart\"}\n")
                .await
                .unwrap();
            let reply = json!({ "request_id": id, "error": "success", "data": true });
            server_write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();

            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;
        });

        let idle = handle.get_property("idle-active").await.unwrap();
        assert_eq!(idle, Value::Bool(true));
        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.name(), Some("playback-restart"));

        drop(handle);
        fake_mpv.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_is_err() {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = start_io_tasks(client, MpvProcess::event_channel());

        let (server_read, mut server_write) = server.into_split();
        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let id = serde_json::from_str::<Value>(&line).unwrap()["request_id"]
                .as_u64()
                .unwrap();
            let reply = json!({ "request_id": id, "error": "property unavailable" });
            server_write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        });

        let err = handle.get_property("time-pos").await.unwrap_err();
        assert!(err.to_string().contains("property unavailable"));
    }
}
