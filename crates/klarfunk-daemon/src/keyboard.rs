//! Keyboard stand-in for the front panel, for development off the Pi.
//!
//! Keys `1`-`5` press a channel button for a short hold window; terminal key
//! repeat keeps extending it, so holding `1` down long enough becomes a
//! long-press.  `s` flips the switch, `q` or Ctrl-C quits.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use klarfunk_proto::model::{ChannelId, Level, LineId, CHANNEL_COUNT};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::DaemonEvent;
use crate::error::InputFault;
use crate::input::LineSampler;

const HOLD_WINDOW: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct PanelState {
    held_until: HashMap<ChannelId, Instant>,
    switch: Level,
}

impl PanelState {
    fn new() -> Self {
        Self {
            held_until: HashMap::new(),
            switch: Level::High,
        }
    }

    fn level(&self, line: LineId, now: Instant) -> Level {
        match line {
            LineId::Channel(id) => match self.held_until.get(&id) {
                Some(until) if now < *until => Level::Low,
                _ => Level::High,
            },
            LineId::Switch => self.switch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Press(ChannelId),
    ToggleSwitch,
    Quit,
    Ignore,
}

fn classify(key: &KeyEvent) -> KeyAction {
    if key.kind == KeyEventKind::Release {
        return KeyAction::Ignore;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
        KeyCode::Char('q') | KeyCode::Char('Q') => KeyAction::Quit,
        KeyCode::Char('s') | KeyCode::Char('S') => KeyAction::ToggleSwitch,
        KeyCode::Char(c) => c
            .to_digit(10)
            .and_then(|d| u8::try_from(d).ok())
            .and_then(ChannelId::new)
            .map_or(KeyAction::Ignore, KeyAction::Press),
        _ => KeyAction::Ignore,
    }
}

fn apply(state: &mut PanelState, action: KeyAction, now: Instant) {
    match action {
        KeyAction::Press(id) => {
            state.held_until.insert(id, now + HOLD_WINDOW);
        }
        KeyAction::ToggleSwitch => {
            state.switch = match state.switch {
                Level::High => Level::Low,
                Level::Low => Level::High,
            };
        }
        KeyAction::Quit | KeyAction::Ignore => {}
    }
}

/// Sampler view of the keyboard panel.
#[derive(Clone)]
pub struct KeyboardLines {
    state: Arc<Mutex<PanelState>>,
}

impl LineSampler for KeyboardLines {
    fn read(&mut self, line: LineId) -> Result<Level, InputFault> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Ok(state.level(line, Instant::now()))
    }
}

/// Owns the terminal while the mock is active.  Raw mode is restored on drop.
pub struct Keyboard {
    lines: KeyboardLines,
    stop: Arc<AtomicBool>,
    raw_mode: bool,
}

impl Keyboard {
    pub fn start(events: mpsc::Sender<DaemonEvent>) -> Self {
        let lines = KeyboardLines {
            state: Arc::new(Mutex::new(PanelState::new())),
        };
        let stop = Arc::new(AtomicBool::new(false));

        if !std::io::stdin().is_terminal() {
            warn!("keyboard: stdin is not a terminal, mock panel has no input");
            return Self {
                lines,
                stop,
                raw_mode: false,
            };
        }
        let raw_mode = match terminal::enable_raw_mode() {
            Ok(()) => true,
            Err(e) => {
                warn!("keyboard: raw mode unavailable: {}", e);
                false
            }
        };

        let state = lines.state.clone();
        let stop_flag = stop.clone();
        std::thread::spawn(move || read_keys(state, stop_flag, events));
        info!(
            "keyboard: 1-{} = channels (hold 1 to shut down), s = switch, q = quit",
            CHANNEL_COUNT
        );

        Self {
            lines,
            stop,
            raw_mode,
        }
    }

    pub fn lines(&self) -> KeyboardLines {
        self.lines.clone()
    }
}

impl Drop for Keyboard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.raw_mode {
            if let Err(e) = terminal::disable_raw_mode() {
                warn!("keyboard: failed to restore terminal: {}", e);
            }
        }
    }
}

fn read_keys(state: Arc<Mutex<PanelState>>, stop: Arc<AtomicBool>, events: mpsc::Sender<DaemonEvent>) {
    while !stop.load(Ordering::Relaxed) {
        let key = match event::poll(POLL) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) => key,
                Ok(_) => continue,
                Err(e) => {
                    warn!("keyboard: read failed: {}", e);
                    break;
                }
            },
            Ok(false) => continue,
            Err(e) => {
                warn!("keyboard: poll failed: {}", e);
                break;
            }
        };

        let action = classify(&key);
        debug!("keyboard: {:?} -> {:?}", key.code, action);
        if action == KeyAction::Quit {
            let _ = events.blocking_send(DaemonEvent::Exit);
            break;
        }
        let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
        apply(&mut state, action, Instant::now());
    }
}
