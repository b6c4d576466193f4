//! The `SpeechTranslator` trait and the types that cross it.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::audio::AudioFrame;

// ---------------------------------------------------------------------------
// TranslationError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TranslationError {
    /// HTTP transport or connection error.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// No result within the finalize deadline.
    #[error("translation timed out")]
    Timeout,

    #[error("speech service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse speech service response: {0}")]
    Parse(String),

    /// The recognizer rejected or cancelled the audio.
    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("failed to encode audio: {0}")]
    Encoding(String),

    #[error("unknown translation session {0}")]
    UnknownSession(SessionId),

    #[error("speech credentials unavailable: {0}")]
    Credentials(String),
}

impl From<reqwest::Error> for TranslationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TranslationError::Timeout
        } else {
            TranslationError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Session types
// ---------------------------------------------------------------------------

/// Opaque handle to one utterance's translation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of a finalized session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Translation {
    pub recognized_text: String,
    pub translated_text: String,
    /// Synthesized speech, mono.
    pub audio: Vec<i16>,
    /// Rate of `audio`, fixed per implementation.
    pub sample_rate: u32,
}

impl Translation {
    /// Nothing was recognized, so there is nothing to play.
    pub fn is_silent(&self) -> bool {
        self.audio.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SpeechTranslator trait
// ---------------------------------------------------------------------------

/// Streaming recognize → translate → synthesize capability.
///
/// Audio is pushed while the user speaks; [`finalize`](Self::finalize)
/// signals end-of-audio and waits for the translated text and speech.
/// Object-safe so it can sit behind an `Arc<dyn SpeechTranslator>`.
#[async_trait]
pub trait SpeechTranslator: Send + Sync {
    async fn start_session(&self, source: &str, target: &str)
        -> Result<SessionId, TranslationError>;

    /// Feed one frame at the recognizer rate.  Transient failures are retried
    /// a bounded number of times, then the frame is dropped and logged.
    async fn push_audio(&self, session: SessionId, frame: &AudioFrame);

    async fn finalize(&self, session: SessionId) -> Result<Translation, TranslationError>;

    /// Discard the session and cancel any outstanding network work.
    async fn abort(&self, session: SessionId);
}

// ---------------------------------------------------------------------------
// StubTranslator  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use stub::StubTranslator;
