//! Application settings structs, defaults, validation and TOML persistence.
//!
//! Every section carries `#[serde(default)]`, so a settings file only needs
//! the keys it changes.  Secrets are never stored here; see
//! [`SpeechCredentials`](crate::translate::SpeechCredentials).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AppPaths;
use crate::hotkey::parse_key;
use crate::mixer::{is_valid_bus, RetryPolicy};

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A setting that parsed but makes no sense.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("audio.frame_ms must be within 5..=200, got {0}")]
    FrameDuration(u32),

    #[error("unknown push-to-talk key {0:?}")]
    UnknownKey(String),

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("mixer.strip_mic and mixer.strip_tts must differ (both {0})")]
    SameStrip(usize),

    #[error("unknown mixer bus {0:?} (expected A1-A5 or B1-B3)")]
    UnknownBus(String),

    #[error("cannot resample {from} Hz to {to} Hz")]
    RateRatio { from: u32, to: u32 },
}

// ---------------------------------------------------------------------------
// PttConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PttConfig {
    /// Key name understood by [`parse_key`] (e.g. `"F8"`, `"RightCtrl"`).
    pub key: String,
    /// Release-edge flutter window in milliseconds.
    pub debounce_ms: u64,
}

impl PttConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for PttConfig {
    fn default() -> Self {
        Self {
            key: "F8".into(),
            debounce_ms: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Capture, recognition and playback formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Microphone name substring; `None` uses the system default.
    pub capture_device: Option<String>,
    /// Output device name substring (typically a virtual cable / mixer input).
    pub playback_device: Option<String>,
    pub capture_sample_rate: u32,
    /// Rate the recognizer expects.
    pub recognizer_sample_rate: u32,
    pub playback_sample_rate: u32,
    /// Capture frame length in milliseconds.
    pub frame_ms: u32,
    /// Capture frames buffered before the oldest is dropped.
    pub queue_frames: usize,
}

impl AudioConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: None,
            playback_device: None,
            capture_sample_rate: 48_000,
            recognizer_sample_rate: 16_000,
            playback_sample_rate: 48_000,
            frame_ms: 20,
            queue_frames: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// SpeechConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Service region, used when `SPEECH_REGION` is not set.
    pub region: String,
    /// Recognition locale, e.g. `"uk-UA"`.
    pub source_language: String,
    /// Translation target, e.g. `"en"`.
    pub target_language: String,
    /// Synthesis voice, e.g. `"en-GB-RyanNeural"`.
    pub voice: String,
    /// Hard ceiling on finalize (recognition + translation + synthesis).
    pub finalize_timeout_ms: u64,
    /// Retries for a frame that cannot be queued for upload.
    pub push_retries: u32,
}

impl SpeechConfig {
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            region: "westeurope".into(),
            source_language: "uk-UA".into(),
            target_language: "en".into(),
            voice: "en-GB-RyanNeural".into(),
            finalize_timeout_ms: 5_000,
            push_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// MixerConfig
// ---------------------------------------------------------------------------

/// Remote mixer endpoint and strip layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    pub host: String,
    /// VBAN UDP port.
    pub port: u16,
    /// Name of the mixer's incoming text command stream.
    pub stream_name: String,
    /// Strip carrying the physical microphone.
    pub strip_mic: usize,
    /// Strip carrying synthesized speech.
    pub strip_tts: usize,
    /// Bus the meeting application listens to.
    pub bus: String,
    pub connect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub ping_timeout_ms: u64,
}

impl MixerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
        }
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6980,
            stream_name: "Command1".into(),
            strip_mic: 0,
            strip_tts: 1,
            bus: "B1".into(),
            connect_attempts: 3,
            initial_backoff_ms: 500,
            ping_timeout_ms: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// DiagnosticsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Default `env_logger` filter; `RUST_LOG` overrides it.
    pub log_level: String,
    /// Samples kept per timing stage.
    pub timing_window: usize,
    /// Write captured and synthesized audio to `dump_dir` as WAV.
    pub dump_audio: bool,
    pub dump_dir: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            timing_window: 200,
            dump_audio: false,
            dump_dir: "debug_dumps".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// One file describes one pipeline instance; run several files side by side
/// for independent profiles (e.g. speak and listen directions).
///
/// ```rust,no_run
/// use ptt_translator::config::AppConfig;
///
/// // Missing file → defaults
/// let config = AppConfig::load().unwrap();
/// config.validate().expect("invalid settings");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Label used in log lines to tell instances apart.
    pub profile: String,
    pub ptt: PttConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub mixer: MixerConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl AppConfig {
    /// Load from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_or_default(&AppPaths::new().settings_file)
    }

    /// Load an explicitly named file.  A missing file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read settings file {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Save to an explicit path, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Name shown in logs: `profile`, or `"default"` when unset.
    pub fn label(&self) -> &str {
        if self.profile.is_empty() {
            "default"
        } else {
            &self.profile
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let audio = &self.audio;
        for (field, rate) in [
            ("audio.capture_sample_rate", audio.capture_sample_rate),
            ("audio.recognizer_sample_rate", audio.recognizer_sample_rate),
            ("audio.playback_sample_rate", audio.playback_sample_rate),
        ] {
            if rate == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if !(5..=200).contains(&audio.frame_ms) {
            return Err(ConfigError::FrameDuration(audio.frame_ms));
        }
        if audio.queue_frames == 0 {
            return Err(ConfigError::Zero {
                field: "audio.queue_frames",
            });
        }
        if !crate::audio::validate_ratio(audio.capture_sample_rate, audio.recognizer_sample_rate) {
            return Err(ConfigError::RateRatio {
                from: audio.capture_sample_rate,
                to: audio.recognizer_sample_rate,
            });
        }

        if parse_key(&self.ptt.key).is_none() {
            return Err(ConfigError::UnknownKey(self.ptt.key.clone()));
        }

        for (field, value) in [
            ("speech.source_language", &self.speech.source_language),
            ("speech.target_language", &self.speech.target_language),
            ("speech.voice", &self.speech.voice),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { field });
            }
        }
        if self.speech.finalize_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "speech.finalize_timeout_ms",
            });
        }

        let mixer = &self.mixer;
        if mixer.connect_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "mixer.connect_attempts",
            });
        }
        if mixer.strip_mic == mixer.strip_tts {
            return Err(ConfigError::SameStrip(mixer.strip_mic));
        }
        if !is_valid_bus(&mixer.bus) {
            return Err(ConfigError::UnknownBus(mixer.bus.clone()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
