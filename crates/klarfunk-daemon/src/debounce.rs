//! Software debouncing and long-press detection for polled input lines.
//!
//! The sampler feeds one raw level per line per tick.  A level change is
//! accepted only after the raw level has stayed put for the debounce window;
//! shorter pulses are noise and vanish without an event.  Long-press time is
//! measured from the first raw sample of the press, and a long-press fires at
//! most once until the button is released again.

use klarfunk_proto::model::{Level, LineId};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEventKind {
    /// Press on a plain button, or a press released before the long-press
    /// threshold on a button that has a long-press action.
    ShortPress,
    LongPress,
    SwitchChanged(Level),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub line: LineId,
    pub kind: InputEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Active-low push button.  Without a long-press threshold the press edge
    /// itself is reported; with one, the event is decided on release or when
    /// the threshold is crossed.
    Button { long_press: Option<Duration> },
    Switch,
}

/// Debounce state of one line.
#[derive(Debug)]
pub struct InputLine {
    id: LineId,
    kind: LineKind,
    level: Level,
    changed_at: Instant,
    candidate: Option<(Level, Instant)>,
    long_press_fired: bool,
}

impl InputLine {
    fn new(id: LineId, kind: LineKind, level: Level, now: Instant) -> Self {
        Self {
            id,
            kind,
            level,
            changed_at: now,
            candidate: None,
            // A button already held at startup must not turn into a gesture.
            long_press_fired: level == Level::Low,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    fn sample(&mut self, raw: Level, now: Instant, window: Duration) -> Option<InputEventKind> {
        if raw == self.level {
            self.candidate = None;
        } else {
            let since = match self.candidate {
                Some((level, since)) if level == raw => since,
                _ => {
                    self.candidate = Some((raw, now));
                    now
                }
            };
            if now.duration_since(since) >= window {
                self.candidate = None;
                if let Some(kind) = self.accept(raw, since) {
                    return Some(kind);
                }
            }
        }
        self.check_long_press(now)
    }

    fn accept(&mut self, level: Level, at: Instant) -> Option<InputEventKind> {
        self.level = level;
        self.changed_at = at;
        match (self.kind, level) {
            (LineKind::Switch, _) => Some(InputEventKind::SwitchChanged(level)),
            (LineKind::Button { long_press }, Level::Low) => {
                self.long_press_fired = false;
                long_press.is_none().then_some(InputEventKind::ShortPress)
            }
            (LineKind::Button { long_press }, Level::High) => {
                let fired = std::mem::replace(&mut self.long_press_fired, false);
                (long_press.is_some() && !fired).then_some(InputEventKind::ShortPress)
            }
        }
    }

    fn check_long_press(&mut self, now: Instant) -> Option<InputEventKind> {
        let LineKind::Button {
            long_press: Some(threshold),
        } = self.kind
        else {
            return None;
        };
        if self.level == Level::Low
            && !self.long_press_fired
            && now.duration_since(self.changed_at) >= threshold
        {
            self.long_press_fired = true;
            return Some(InputEventKind::LongPress);
        }
        None
    }
}

pub struct Debouncer {
    window: Duration,
    lines: Vec<InputLine>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            lines: Vec::new(),
        }
    }

    /// Register a line, seeding its stable level without emitting an event.
    pub fn add_line(&mut self, id: LineId, kind: LineKind, initial: Level, now: Instant) {
        self.lines.retain(|l| l.id != id);
        self.lines.push(InputLine::new(id, kind, initial, now));
    }

    pub fn line(&self, id: LineId) -> Option<&InputLine> {
        self.lines.iter().find(|l| l.id == id)
    }

    /// Feed one raw sample.  Unknown lines are ignored.
    pub fn sample(&mut self, id: LineId, raw: Level, now: Instant) -> Option<InputEvent> {
        let window = self.window;
        let line = self.lines.iter_mut().find(|l| l.id == id)?;
        line.sample(raw, now, window)
            .map(|kind| InputEvent { line: id, kind })
    }
}
