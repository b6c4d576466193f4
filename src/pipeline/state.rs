//! Pipeline state machine and the status snapshot other components read.
//!
//! [`PipelineState`] is owned by the orchestrator, which is its only writer.
//! Everything else observes it through [`SharedStatus`], a copy the
//! orchestrator refreshes on every transition.

use std::fmt;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// Phase of the current utterance.
///
/// ```text
/// Idle ──press──▶ Capturing ──release──▶ Processing ──result──▶ Playing
///  ▲                  │                       │                   │
///  └──────────────────┴───── error / silence ─┴──── done ─────────┘
/// ```
///
/// `Capturing` is only reachable from `Idle`, so a press while busy is never
/// turned into a second utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    /// Waiting for a press.  Mic strip live, TTS strip muted.
    #[default]
    Idle,

    /// Key held; frames are streamed to the translation session.
    Capturing,

    /// Key released; waiting for translated speech.
    Processing,

    /// Synthesized speech is being played to the output device.
    Playing,
}

impl PipelineState {
    pub const ALL: [PipelineState; 4] = [
        PipelineState::Idle,
        PipelineState::Capturing,
        PipelineState::Processing,
        PipelineState::Playing,
    ];

    /// `true` while an utterance is in flight.
    ///
    /// ```
    /// use ptt_translator::pipeline::PipelineState;
    ///
    /// assert!(!PipelineState::Idle.is_busy());
    /// assert!(PipelineState::Processing.is_busy());
    /// ```
    pub fn is_busy(self) -> bool {
        self != PipelineState::Idle
    }

    pub fn label(self) -> &'static str {
        match self {
            PipelineState::Idle => "IDLE",
            PipelineState::Capturing => "CAPTURING",
            PipelineState::Processing => "PROCESSING",
            PipelineState::Playing => "PLAYING",
        }
    }

    /// Whether `self → next` is an edge of the state machine.
    ///
    /// Any state may fall back to `Idle`; the forward edges are
    /// `Idle → Capturing → Processing → Playing`.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (_, Idle) | (Idle, Capturing) | (Capturing, Processing) | (Processing, Playing)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// PipelineStatus
// ---------------------------------------------------------------------------

/// Snapshot of one orchestrator, for diagnostics and the CLI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStatus {
    pub state: PipelineState,

    /// Mixer commands are failing; routing is restored on the next
    /// transition once the mixer answers again.
    pub degraded: bool,

    /// Reason the most recent utterance was aborted.
    pub last_error: Option<String>,

    /// Translated text of the most recent utterance that produced speech.
    pub last_translation: Option<String>,

    /// Utterances that ran to completion (including silent ones).
    pub utterances: u64,

    /// Utterances aborted by a device, translation or internal error.
    pub aborted: u64,

    /// Capture frames dropped because the consumer fell behind, all sessions.
    pub capture_overflows: u64,
}

// ---------------------------------------------------------------------------
// SharedStatus
// ---------------------------------------------------------------------------

/// Written by the orchestrator only.  Do not hold the lock across `.await`.
pub type SharedStatus = Arc<Mutex<PipelineStatus>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(Mutex::new(PipelineStatus::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
