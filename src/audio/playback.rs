//! Synthesized-speech playback via `cpal`.
//!
//! [`PlaybackDevice::play`] blocks until the whole buffer has been heard (or
//! a stall deadline passes).  Call it from `tokio::task::spawn_blocking`.
//!
//! The output callback only knows when samples were copied into the device
//! buffer, not when they left the speaker, so every buffer is followed by
//! `DRAIN_TAIL` of silence and completion is signalled once that silence
//! has been consumed.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SizedSample};

use super::capture::find_device;
use super::error::DeviceError;

/// Slack added to the buffer duration before playback counts as stalled.
const STALL_MARGIN: Duration = Duration::from_secs(2);

/// Silence appended after the speech; must cover one device buffer.
const DRAIN_TAIL: Duration = Duration::from_millis(150);

/// Anything that can play mono 16-bit PCM to completion.
pub trait PlaybackDevice: Send + Sync {
    /// Play `samples` (mono) at `sample_rate` and return once finished.
    fn play(&self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError>;
}

// ---------------------------------------------------------------------------
// CpalPlayback
// ---------------------------------------------------------------------------

/// Production [`PlaybackDevice`] that opens a fresh output stream per call.
#[derive(Debug, Clone, Default)]
pub struct CpalPlayback {
    device: Option<String>,
}

impl CpalPlayback {
    /// `device` is a case-insensitive name substring; `None` = host default.
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

impl PlaybackDevice for CpalPlayback {
    fn play(&self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError> {
        if samples.is_empty() || sample_rate == 0 {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = find_device(&host, self.device.as_deref(), false)?;
        let supported = device
            .default_output_config()
            .map_err(|e| DeviceError::Config {
                direction: "output",
                reason: e.to_string(),
            })?;
        let channels = supported.channels();
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let queued = with_drain_tail(samples, sample_rate);
        let queued_len = queued.len();
        let pending = Arc::new(Mutex::new(queued));
        let (done_tx, done_rx) = std_mpsc::channel::<()>();

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                output_stream::<f32>(&device, &config, channels, Arc::clone(&pending), done_tx)
            }
            cpal::SampleFormat::I16 => {
                output_stream::<i16>(&device, &config, channels, Arc::clone(&pending), done_tx)
            }
            cpal::SampleFormat::U16 => {
                output_stream::<u16>(&device, &config, channels, Arc::clone(&pending), done_tx)
            }
            cpal::SampleFormat::I32 => {
                output_stream::<i32>(&device, &config, channels, Arc::clone(&pending), done_tx)
            }
            other => return Err(DeviceError::UnsupportedFormat(format!("{other:?}"))),
        }
        .map_err(|e| DeviceError::BuildStream {
            direction: "output",
            reason: e.to_string(),
        })?;

        stream.play().map_err(|e| DeviceError::PlayStream {
            direction: "output",
            reason: e.to_string(),
        })?;

        let budget = Duration::from_micros(queued_len as u64 * 1_000_000 / sample_rate as u64)
            + STALL_MARGIN;
        log::debug!(
            "playback: streaming {} samples @ {} Hz to {} channel(s)",
            samples.len(),
            sample_rate,
            channels
        );

        let outcome = done_rx.recv_timeout(budget);
        drop(stream);
        match outcome {
            Ok(()) => Ok(()),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                Err(DeviceError::PlaybackStalled(budget.as_millis()))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(DeviceError::Disconnected {
                direction: "output",
                reason: "stream dropped before completion".into(),
            }),
        }
    }
}

/// `samples` followed by `DRAIN_TAIL` of zeros at `sample_rate`.
fn with_drain_tail(samples: &[i16], sample_rate: u32) -> VecDeque<i16> {
    let tail = (sample_rate as u128 * DRAIN_TAIL.as_millis() / 1000) as usize;
    let mut queued = VecDeque::with_capacity(samples.len() + tail);
    queued.extend(samples.iter().copied());
    queued.extend(std::iter::repeat(0).take(tail));
    queued
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    pending: Arc<Mutex<VecDeque<i16>>>,
    done_tx: std_mpsc::Sender<()>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = channels.max(1) as usize;
    let mut finished = false;

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = pending.lock().unwrap_or_else(PoisonError::into_inner);
            for frame in data.chunks_mut(channels) {
                let sample = queue.pop_front().unwrap_or(0);
                // Mono source duplicated onto every output channel.
                for out in frame.iter_mut() {
                    *out = T::from_sample(sample);
                }
            }
            if queue.is_empty() && !finished {
                finished = true;
                let _ = done_tx.send(());
            }
        },
        |err: cpal::StreamError| {
            log::error!("playback: stream error: {err}");
        },
        None,
    )
}

// ---------------------------------------------------------------------------
// FakePlayback  (test-only)
// ---------------------------------------------------------------------------

/// Test double that records every buffer it is asked to play.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct FakePlayback {
    played: Arc<Mutex<Vec<(Vec<i16>, u32)>>>,
    fail: bool,
}

#[cfg(test)]
impl FakePlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `play` fails with [`DeviceError::Disconnected`].
    pub fn failing() -> Self {
        Self {
            played: Arc::default(),
            fail: true,
        }
    }

    pub fn played(&self) -> Vec<(Vec<i16>, u32)> {
        self.played.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl PlaybackDevice for FakePlayback {
    fn play(&self, samples: &[i16], sample_rate: u32) -> Result<(), DeviceError> {
        if self.fail {
            return Err(DeviceError::Disconnected {
                direction: "output",
                reason: "fake".into(),
            });
        }
        self.played
            .lock()
            .unwrap()
            .push((samples.to_vec(), sample_rate));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_a_no_op() {
        // Returns before touching the audio host.
        let playback = CpalPlayback::new(Some("does-not-exist".into()));
        assert!(playback.play(&[], 48_000).is_ok());
        assert!(playback.play(&[1, 2, 3], 0).is_ok());
    }

    #[test]
    fn speech_is_followed_by_silent_tail() {
        let queued = with_drain_tail(&[7; 480], 48_000);
        // 150 ms at 48 kHz
        assert_eq!(queued.len(), 480 + 7_200);
        assert!(queued.iter().take(480).all(|&s| s == 7));
        assert!(queued.iter().skip(480).all(|&s| s == 0));

        assert_eq!(with_drain_tail(&[1], 16_000).len(), 1 + 2_400);
    }

    #[test]
    fn playback_device_is_object_safe() {
        let _: Arc<dyn PlaybackDevice> = Arc::new(CpalPlayback::default());
    }

    #[test]
    fn fake_records_buffers() {
        let fake = FakePlayback::new();
        fake.play(&[1, 2, 3], 48_000).unwrap();
        assert_eq!(fake.played(), vec![(vec![1, 2, 3], 48_000)]);
        assert!(FakePlayback::failing().play(&[1], 48_000).is_err());
    }
}
