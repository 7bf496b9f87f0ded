use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::AudioOutput;
use crate::error::AnnouncementFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementOutcome {
    Completed,
    TimedOut,
    /// Missing or undecodable clip.  Callers carry on as if it had played.
    Failed,
    /// A newer `play` took over the output.
    Interrupted,
}

/// Plays one bounded voice clip at a time.  Starting a clip interrupts the
/// one in flight.
pub struct Announcer {
    audio: Arc<dyn AudioOutput>,
    timeout: Duration,
    current: Mutex<Slot>,
}

/// The clip in flight, tagged with a generation that only ever grows.
#[derive(Default)]
struct Slot {
    generation: u64,
    token: Option<CancellationToken>,
}

impl Announcer {
    pub fn new(audio: Arc<dyn AudioOutput>, timeout: Duration) -> Self {
        Self {
            audio,
            timeout,
            current: Mutex::new(Slot::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn play(&self, clip: &Path) -> AnnouncementOutcome {
        let token = CancellationToken::new();
        let generation = self.take_over(token.clone());
        debug!("announce: {}", clip.display());

        let outcome = tokio::select! {
            _ = token.cancelled() => AnnouncementOutcome::Interrupted,
            result = tokio::time::timeout(self.timeout, self.audio.play_clip(clip)) => match result {
                Ok(Ok(())) => AnnouncementOutcome::Completed,
                Ok(Err(source)) => {
                    let fault = AnnouncementFault {
                        clip: clip.to_path_buf(),
                        source,
                    };
                    warn!("announce: {}", fault);
                    AnnouncementOutcome::Failed
                }
                Err(_) => {
                    warn!(
                        "announce: {} still playing after {:?}, stopping",
                        clip.display(),
                        self.timeout
                    );
                    if let Err(e) = self.audio.stop().await {
                        warn!("announce: stop after timeout failed: {}", e);
                    }
                    AnnouncementOutcome::TimedOut
                }
            },
        };

        self.release(generation);
        outcome
    }

    /// Cancel the clip in flight, if any.  The output itself is left alone.
    pub fn interrupt(&self) {
        if let Some(token) = self.lock().token.take() {
            token.cancel();
        }
    }

    fn take_over(&self, token: CancellationToken) -> u64 {
        let mut slot = self.lock();
        slot.generation += 1;
        if let Some(previous) = slot.token.replace(token) {
            previous.cancel();
        }
        slot.generation
    }

    fn release(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.token = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AudioCall, FakeAudio};
    use std::path::PathBuf;

    fn announcer(audio: &Arc<FakeAudio>, timeout_secs: u64) -> Arc<Announcer> {
        Arc::new(Announcer::new(audio.clone(), Duration::from_secs(timeout_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clip_plays_to_completion() {
        let audio = Arc::new(FakeAudio::new(Duration::from_secs(3)));
        let announcer = announcer(&audio, 15);

        let outcome = announcer.play(Path::new("/clips/power_on.mp3")).await;
        assert_eq!(outcome, AnnouncementOutcome::Completed);
        assert_eq!(
            audio.calls(),
            vec![AudioCall::Clip(PathBuf::from("/clips/power_on.mp3"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_output() {
        let audio = Arc::new(FakeAudio::new(Duration::from_secs(60)));
        let announcer = announcer(&audio, 15);

        let start = tokio::time::Instant::now();
        let outcome = announcer.play(Path::new("/clips/long.mp3")).await;
        assert_eq!(outcome, AnnouncementOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(15));
        assert!(start.elapsed() < Duration::from_secs(16));
        assert_eq!(audio.calls().last(), Some(&AudioCall::Stop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_clip_counts_as_done() {
        let audio = Arc::new(FakeAudio::new(Duration::from_secs(3)));
        audio.mark_missing("/clips/gone.mp3");
        let announcer = announcer(&audio, 15);

        let outcome = announcer.play(Path::new("/clips/gone.mp3")).await;
        assert_eq!(outcome, AnnouncementOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_play_interrupts_previous() {
        let audio = Arc::new(FakeAudio::new(Duration::from_secs(5)));
        let announcer = announcer(&audio, 15);

        let first = tokio::spawn({
            let announcer = announcer.clone();
            async move { announcer.play(Path::new("/clips/a.mp3")).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = announcer.play(Path::new("/clips/b.mp3")).await;
        assert_eq!(first.await.unwrap(), AnnouncementOutcome::Interrupted);
        assert_eq!(second, AnnouncementOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_cancels_in_flight_clip() {
        let audio = Arc::new(FakeAudio::new(Duration::from_secs(5)));
        let announcer = announcer(&audio, 15);

        let playing = tokio::spawn({
            let announcer = announcer.clone();
            async move { announcer.play(Path::new("/clips/a.mp3")).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        announcer.interrupt();
        assert_eq!(playing.await.unwrap(), AnnouncementOutcome::Interrupted);
    }
}
