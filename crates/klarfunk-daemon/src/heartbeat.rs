use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use klarfunk_proto::status::{RadioStatus, StatusBoard};
use serde::Serialize;
use tracing::{debug, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct Heartbeat<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    status: &'a RadioStatus,
}

/// Write the status snapshot to `path` every `every`, forever.
pub async fn run_heartbeat(path: PathBuf, status: StatusBoard, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        if let Err(e) = write_heartbeat(&path, &status).await {
            warn!("heartbeat: {}: {:#}", path.display(), e);
        }
    }
}

async fn write_heartbeat(path: &Path, status: &StatusBoard) -> anyhow::Result<()> {
    let snapshot = status.snapshot().await;
    let body = serde_json::to_string_pretty(&Heartbeat {
        timestamp: Utc::now(),
        status: &snapshot,
    })?;

    // Replace atomically so readers never see a half-written file.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("heartbeat: rev {}", snapshot.rev);
    Ok(())
}
