mod announce;
mod audio;
mod connectivity;
mod core;
mod debounce;
mod error;
mod gpio;
mod heartbeat;
mod input;
mod keyboard;
mod mpv;
mod session;
mod shutdown;
#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use klarfunk_proto::config::Config;
use klarfunk_proto::status::StatusBoard;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::announce::Announcer;
use crate::audio::{AudioOutput, MpvAudio};
use crate::connectivity::TcpProbe;
use crate::core::{DaemonEvent, Orchestrator};
use crate::input::{InputRouter, SamplerSettings};
use crate::session::{SessionClips, SessionContext, SessionSettings};
use crate::shutdown::{DryRunShutdown, ShutdownHandler, SystemShutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GpioBackend {
    /// Raspberry Pi GPIO via sysfs
    Rpi,
    /// Keyboard stand-in
    Mock,
}

#[derive(Parser, Debug)]
#[command(name = "klarfunk", version)]
#[command(about = "Five-button internet radio controller", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Input backend (default: rpi on a Raspberry Pi, mock elsewhere)
    #[arg(long, value_enum)]
    gpio: Option<GpioBackend>,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write a JSON status snapshot here every 30 seconds
    #[arg(long)]
    heartbeat_file: Option<PathBuf>,
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let default_filter = if cli.verbose {
        "info,klarfunk=debug"
    } else {
        "info"
    };
    let file_layer = match &cli.log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
    Ok(())
}

fn resolve_backend(requested: Option<GpioBackend>) -> GpioBackend {
    let on_pi = klarfunk_proto::platform::is_raspberry_pi();
    match requested {
        Some(GpioBackend::Rpi) if !on_pi => {
            warn!("rpi GPIO requested but this is not a Raspberry Pi; using mock");
            GpioBackend::Mock
        }
        Some(backend) => backend,
        None if on_pi => GpioBackend::Rpi,
        None => GpioBackend::Mock,
    }
}

fn warn_missing(kind: &str, path: &Path) {
    if !path.exists() {
        warn!("{} clip missing: {}", kind, path.display());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path.display());

    let channels = config.channel_list();
    let clips = config.clips();
    for (name, path) in clips.entries() {
        warn_missing(name, path);
    }
    for channel in &channels {
        warn_missing(&format!("channel {}", channel.id), &channel.announcement);
    }

    let audio: Arc<dyn AudioOutput> = Arc::new(
        MpvAudio::start(&config.audio)
            .await
            .context("failed to start the audio backend")?,
    );
    let announcer = Arc::new(Announcer::new(audio.clone(), config.announcements.timeout()));
    let session_ctx = SessionContext {
        audio: audio.clone(),
        announcer,
        reachability: Arc::new(TcpProbe::from_config(&config.connectivity)),
        settings: Arc::new(SessionSettings::from_config(&config)),
        clips: Arc::new(SessionClips::from(&clips)),
    };

    // Every input, session report and signal funnels into the orchestrator.
    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);

    let shutdown_channel = config
        .input
        .shutdown_channel()
        .context("input.shutdown_button out of range")?;
    let router = InputRouter::new(shutdown_channel, config.input.invert_switch);
    let sampler_settings = SamplerSettings {
        interval: config.input.sample_interval(),
        debounce: config.input.debounce(),
        long_press: config.input.long_press(),
    };

    let backend = resolve_backend(cli.gpio);
    info!("Input backend: {:?}", backend);
    let (shutdown, _keyboard): (Arc<dyn ShutdownHandler>, Option<keyboard::Keyboard>) = match backend {
        GpioBackend::Rpi => {
            let gpio = gpio::SysfsGpio::open(&config.gpio).await?;
            tokio::spawn(input::run_sampler(
                gpio,
                router,
                sampler_settings,
                event_tx.clone(),
            ));
            (Arc::new(SystemShutdown::new(config.shutdown.command.clone())), None)
        }
        GpioBackend::Mock => {
            let keyboard = keyboard::Keyboard::start(event_tx.clone());
            tokio::spawn(input::run_sampler(
                keyboard.lines(),
                router,
                sampler_settings,
                event_tx.clone(),
            ));
            (Arc::new(DryRunShutdown), Some(keyboard))
        }
    };

    let status = StatusBoard::new();
    if let Some(path) = cli.heartbeat_file.clone() {
        tokio::spawn(heartbeat::run_heartbeat(
            path,
            status.clone(),
            heartbeat::HEARTBEAT_INTERVAL,
        ));
    }

    let signal_tx = event_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, exiting");
        let _ = signal_tx.send(DaemonEvent::Exit).await;
    });

    let orchestrator = Orchestrator::new(channels, clips, session_ctx, shutdown, status, event_tx);
    info!("klarfunk running");
    orchestrator.run(event_rx).await?;

    audio.stop().await.ok();
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
