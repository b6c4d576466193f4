//! External mixer control: strip mute and bus routing.
//!
//! The mixer is a separate process reached over the network, so nothing it
//! reports back is trusted.  [`MixerController`] only remembers what it last
//! *commanded*, and every command is an absolute assignment
//! (`Strip[1].Mute=1;`) that is safe to repeat.
//!
//! ```text
//! PipelineOrchestrator ──▶ MixerController ──(serialized)──▶ dyn MixerBackend
//!                           retry/backoff                     └─ VbanTextBackend (UDP)
//! ```

pub mod controller;
pub mod vban;

pub use controller::{MixerController, RetryPolicy, StripState};
pub use vban::VbanTextBackend;

#[cfg(test)]
pub use controller::{MockMixerBackend, MockMixerState};

use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// MixerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("mixer is not connected")]
    NotConnected,

    #[error("mixer at {addr} did not answer within {timeout_ms} ms")]
    NoResponse { addr: String, timeout_ms: u64 },

    #[error("cannot resolve mixer address {0:?}")]
    Address(String),

    #[error("mixer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// MixerBackend
// ---------------------------------------------------------------------------

/// Transport to a running mixer.
///
/// Implementations need not be thread-safe beyond `Send + Sync`: the
/// controller guarantees a single in-flight call.
#[async_trait]
pub trait MixerBackend: Send + Sync {
    /// Establish (or re-establish) the connection and verify the mixer answers.
    async fn login(&mut self) -> Result<(), MixerError>;

    /// Assign `value` to a named parameter, e.g. `Strip[0].Mute` = `1.0`.
    async fn set_parameter(&mut self, param: &str, value: f32) -> Result<(), MixerError>;

    /// Check that the mixer behind an established connection still answers.
    async fn check_alive(&mut self) -> Result<(), MixerError>;

    async fn logout(&mut self);
}

/// Allowed bus identifiers: hardware outputs A1–A5, virtual buses B1–B3.
pub const BUSES: [&str; 8] = ["A1", "A2", "A3", "A4", "A5", "B1", "B2", "B3"];

pub fn is_valid_bus(bus: &str) -> bool {
    BUSES.contains(&bus)
}
