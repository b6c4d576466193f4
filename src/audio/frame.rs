//! Fixed-duration PCM frames and the helpers that produce them.
//!
//! The hardware callback delivers buffers of arbitrary length and channel
//! layout.  [`FrameAssembler`] slices them into constant-duration mono
//! [`AudioFrame`]s so everything downstream of capture sees one cadence.

use std::time::Duration;

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// A block of signed 16-bit samples tagged with its rate and layout.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved samples (mono once the frame leaves the capture engine).
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioFrame {
    /// Build a mono frame.
    pub fn mono(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Wall-clock duration covered by this frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(per_channel * 1_000_000 / self.sample_rate as u64)
    }

    /// Little-endian byte encoding, as expected by PCM upload endpoints.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Number of samples per channel in one frame of `frame_duration` at `sample_rate`.
///
/// ```
/// use std::time::Duration;
/// use ptt_translator::audio::samples_per_frame;
///
/// assert_eq!(samples_per_frame(48_000, Duration::from_millis(20)), 960);
/// assert_eq!(samples_per_frame(16_000, Duration::from_millis(20)), 320);
/// ```
pub fn samples_per_frame(sample_rate: u32, frame_duration: Duration) -> usize {
    (sample_rate as u128 * frame_duration.as_micros() / 1_000_000) as usize
}

// ---------------------------------------------------------------------------
// downmix_to_mono
// ---------------------------------------------------------------------------

/// Average interleaved channels down to mono, clamping to the `i16` range.
///
/// A trailing partial frame is discarded.  `channels == 0` yields an empty
/// vector and `channels == 1` copies the input.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                    (sum / n as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16
                })
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// FrameAssembler
// ---------------------------------------------------------------------------

/// Accumulates hardware buffers and emits constant-length mono frames.
pub struct FrameAssembler {
    sample_rate: u32,
    channels: u16,
    /// Interleaved samples needed for one frame.
    frame_len: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(sample_rate: u32, channels: u16, frame_duration: Duration) -> Self {
        let channels = channels.max(1);
        let frame_len = samples_per_frame(sample_rate, frame_duration).max(1) * channels as usize;
        Self {
            sample_rate,
            channels,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Append interleaved samples and call `emit` for every completed frame.
    pub fn push(&mut self, interleaved: &[i16], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(interleaved);
        let mut start = 0;
        while self.pending.len() - start >= self.frame_len {
            let chunk = &self.pending[start..start + self.frame_len];
            emit(AudioFrame::mono(
                downmix_to_mono(chunk, self.channels),
                self.sample_rate,
            ));
            start += self.frame_len;
        }
        self.pending.drain(..start);
    }

    /// Interleaved samples waiting for the next frame boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
