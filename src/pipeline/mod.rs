//! Per-utterance pipeline: the state machine that ties PTT input, capture,
//! translation, playback and mixer routing together.
//!
//! # Architecture
//!
//! ```text
//! PttHandler callbacks ──PttEvent (bounded mpsc)──▶ PipelineOrchestrator::run()
//!                                                      │  (single writer of state)
//!        CaptureStream ──frames──▶ resample ──▶ SpeechTranslator::push_audio
//!                                                      │
//!        SpeechTranslator::finalize ──▶ resample ──▶ PlaybackDevice::play
//!                                                      │
//!        MixerController  ◀── mute / unmute strips ────┘
//!
//! SharedStatus (Arc<Mutex<PipelineStatus>>) ◀── read by diagnostics / CLI
//! ```
//!
//! Several orchestrators may run side by side, one per profile; they share
//! no mutable state.

pub mod runner;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use runner::{PipelineError, PipelineOrchestrator};
pub use state::{new_shared_status, PipelineState, PipelineStatus, SharedStatus};
