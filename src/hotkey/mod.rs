//! Push-to-talk input: a global key hook, debounced into press/release events.
//!
//! # Design
//!
//! ```text
//! rdev::listen thread ──KeyEdge──▶ ptt worker thread ──▶ on_press / on_release
//!   (OS hook, shared)              (Debouncer, timers)     (user callbacks)
//! ```
//!
//! `rdev::listen()` blocks forever and must own a dedicated OS thread; it is
//! started once per process and shared by every [`PttHandler`].  The hook
//! callback only forwards raw edges.  Debouncing and callback invocation run
//! on a per-handler worker thread so the OS hook never waits on user code.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use ptt_translator::hotkey::{parse_key, PttEvent, PttHandler};
//!
//! let (tx, mut rx) = mpsc::channel::<PttEvent>(16);
//! let key = parse_key("F8").expect("unknown key");
//! let mut ptt = PttHandler::new(key, Duration::from_millis(50));
//!
//! let press_tx = tx.clone();
//! ptt.on_press(move || { let _ = press_tx.try_send(PttEvent::Pressed); });
//! ptt.on_release(move || { let _ = tx.try_send(PttEvent::Released); });
//! ptt.start().expect("keyboard hook");
//! ```

pub mod debounce;
pub mod listener;

pub use debounce::Debouncer;
pub use listener::{KeyEdge, KeySink, KeySource, PttHandler, RdevSource};

#[cfg(test)]
pub use listener::ManualKeySource;

use thiserror::Error;

// ---------------------------------------------------------------------------
// PttEvent
// ---------------------------------------------------------------------------

/// A debounced push-to-talk gesture edge, as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttEvent {
    Pressed,
    Released,
}

// ---------------------------------------------------------------------------
// InputHookError
// ---------------------------------------------------------------------------

/// Failures setting up push-to-talk input.  Always fatal at startup.
#[derive(Debug, Error)]
pub enum InputHookError {
    #[error("unknown push-to-talk key {0:?}")]
    UnknownKey(String),

    #[error("failed to hook keyboard input: {0}")]
    Hook(String),

    #[error("failed to spawn {name} thread: {reason}")]
    Thread { name: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// parse_key
// ---------------------------------------------------------------------------

const FUNCTION_KEYS: [rdev::Key; 12] = [
    rdev::Key::F1,
    rdev::Key::F2,
    rdev::Key::F3,
    rdev::Key::F4,
    rdev::Key::F5,
    rdev::Key::F6,
    rdev::Key::F7,
    rdev::Key::F8,
    rdev::Key::F9,
    rdev::Key::F10,
    rdev::Key::F11,
    rdev::Key::F12,
];

const LETTER_KEYS: [rdev::Key; 26] = [
    rdev::Key::KeyA,
    rdev::Key::KeyB,
    rdev::Key::KeyC,
    rdev::Key::KeyD,
    rdev::Key::KeyE,
    rdev::Key::KeyF,
    rdev::Key::KeyG,
    rdev::Key::KeyH,
    rdev::Key::KeyI,
    rdev::Key::KeyJ,
    rdev::Key::KeyK,
    rdev::Key::KeyL,
    rdev::Key::KeyM,
    rdev::Key::KeyN,
    rdev::Key::KeyO,
    rdev::Key::KeyP,
    rdev::Key::KeyQ,
    rdev::Key::KeyR,
    rdev::Key::KeyS,
    rdev::Key::KeyT,
    rdev::Key::KeyU,
    rdev::Key::KeyV,
    rdev::Key::KeyW,
    rdev::Key::KeyX,
    rdev::Key::KeyY,
    rdev::Key::KeyZ,
];

/// Parse a key name from the config into an [`rdev::Key`].
///
/// Case-insensitive.  Accepts F1–F12, single letters, and the usual named
/// keys including right-hand modifiers (a common push-to-talk choice).
///
/// ```
/// use ptt_translator::hotkey::parse_key;
///
/// assert_eq!(parse_key("F8"), Some(rdev::Key::F8));
/// assert_eq!(parse_key("rightctrl"), Some(rdev::Key::ControlRight));
/// assert_eq!(parse_key("q"), Some(rdev::Key::KeyQ));
/// assert_eq!(parse_key("F13"), None);
/// ```
pub fn parse_key(name: &str) -> Option<rdev::Key> {
    let upper = name.trim().to_ascii_uppercase();

    if let Some(n) = upper.strip_prefix('F').and_then(|n| n.parse::<usize>().ok()) {
        return FUNCTION_KEYS.get(n.checked_sub(1)?).copied();
    }
    if let [c] = upper.as_bytes() {
        if c.is_ascii_uppercase() {
            return Some(LETTER_KEYS[(c - b'A') as usize]);
        }
    }

    let key = match upper.as_str() {
        "ESC" | "ESCAPE" => rdev::Key::Escape,
        "SPACE" => rdev::Key::Space,
        "ENTER" | "RETURN" => rdev::Key::Return,
        "TAB" => rdev::Key::Tab,
        "BACKSPACE" => rdev::Key::Backspace,
        "INSERT" | "INS" => rdev::Key::Insert,
        "DELETE" | "DEL" => rdev::Key::Delete,
        "HOME" => rdev::Key::Home,
        "END" => rdev::Key::End,
        "PAGEUP" => rdev::Key::PageUp,
        "PAGEDOWN" => rdev::Key::PageDown,
        "UP" | "UPARROW" => rdev::Key::UpArrow,
        "DOWN" | "DOWNARROW" => rdev::Key::DownArrow,
        "LEFT" | "LEFTARROW" => rdev::Key::LeftArrow,
        "RIGHT" | "RIGHTARROW" => rdev::Key::RightArrow,
        "CAPSLOCK" => rdev::Key::CapsLock,
        "NUMLOCK" => rdev::Key::NumLock,
        "SCROLLLOCK" => rdev::Key::ScrollLock,
        "PRINTSCREEN" => rdev::Key::PrintScreen,
        "PAUSE" => rdev::Key::Pause,
        "RIGHTCTRL" | "CONTROLRIGHT" => rdev::Key::ControlRight,
        "RIGHTSHIFT" | "SHIFTRIGHT" => rdev::Key::ShiftRight,
        "RIGHTALT" | "ALTGR" => rdev::Key::AltGr,
        _ => return None,
    };
    Some(key)
}
