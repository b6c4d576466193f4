//! Device-level audio errors shared by capture and playback.

use thiserror::Error;

/// Errors raised when an audio device cannot be opened or fails mid-stream.
///
/// Any `DeviceError` surfacing during an utterance aborts that utterance only;
/// the pipeline returns to idle and stays ready for the next press.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {direction} device matching {name:?}")]
    NotFound { direction: &'static str, name: String },

    #[error("no default {0} device on the audio host")]
    NoDefault(&'static str),

    #[error("failed to query {direction} device config: {reason}")]
    Config {
        direction: &'static str,
        reason: String,
    },

    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),

    #[error("failed to build {direction} stream: {reason}")]
    BuildStream {
        direction: &'static str,
        reason: String,
    },

    #[error("failed to start {direction} stream: {reason}")]
    PlayStream {
        direction: &'static str,
        reason: String,
    },

    #[error("{direction} device disconnected: {reason}")]
    Disconnected {
        direction: &'static str,
        reason: String,
    },

    #[error("playback did not complete within {0} ms")]
    PlaybackStalled(u128),

    #[error("audio worker thread failed: {0}")]
    Worker(String),
}

impl DeviceError {
    /// `true` when the error means the device went away after it was opened.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DeviceError::Disconnected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_mentions_name() {
        let e = DeviceError::NotFound {
            direction: "input",
            name: "Voicemeeter".into(),
        };
        assert!(e.to_string().contains("Voicemeeter"));
        assert!(e.to_string().contains("input"));
    }

    #[test]
    fn only_disconnected_is_disconnect() {
        let lost = DeviceError::Disconnected {
            direction: "input",
            reason: "unplugged".into(),
        };
        assert!(lost.is_disconnect());
        assert!(!DeviceError::NoDefault("output").is_disconnect());
    }
}
