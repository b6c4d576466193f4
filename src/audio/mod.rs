//! Audio I/O: microphone capture, resampling, playback and WAV dumps.
//!
//! # Data flow
//!
//! ```text
//! cpal callback → i16 → FrameAssembler (20 ms, mono) → FrameQueue (drop-oldest)
//!               → CaptureStream::read_frame → resample(48k → 16k) → recognizer
//!
//! synthesized PCM → resample(engine rate → device rate) → PlaybackDevice::play
//! ```
//!
//! Device access sits behind the [`CaptureDevice`] and [`PlaybackDevice`]
//! traits so the orchestrator can be driven by fakes in tests.

pub mod capture;
pub mod dump;
pub mod error;
pub mod frame;
pub mod playback;
pub mod queue;
pub mod resample;

pub use capture::{CaptureDevice, CaptureRequest, CaptureStream, CpalCapture};
pub use dump::AudioDump;
pub use error::DeviceError;
pub use frame::{downmix_to_mono, samples_per_frame, AudioFrame, FrameAssembler};
pub use playback::{CpalPlayback, PlaybackDevice};
pub use queue::{CaptureRead, FrameQueue};
pub use resample::{resample, validate_ratio};

#[cfg(test)]
pub use capture::FakeCapture;
#[cfg(test)]
pub use playback::FakePlayback;

use cpal::traits::{DeviceTrait, HostTrait};

/// Names of the input and output devices on the default host.
pub fn list_devices() -> Result<(Vec<String>, Vec<String>), DeviceError> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()
        .map_err(|e| DeviceError::Config {
            direction: "input",
            reason: e.to_string(),
        })?
        .filter_map(|d| d.name().ok())
        .collect();
    let outputs = host
        .output_devices()
        .map_err(|e| DeviceError::Config {
            direction: "output",
            reason: e.to_string(),
        })?
        .filter_map(|d| d.name().ok())
        .collect();
    Ok((inputs, outputs))
}
