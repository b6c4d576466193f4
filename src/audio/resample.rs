//! Sample-rate conversion for mono 16-bit PCM.
//!
//! Used in both directions:
//!
//! 1. capture rate (commonly 48 kHz) → recognizer rate (16 kHz), per frame;
//! 2. synthesis rate → playback device rate, per utterance.
//!
//! [`resample`] is a pure function: linear interpolation with exact integer
//! source positions, so the same input always yields the same output and no
//! state is carried between calls.  Any rate pair is accepted.
//!
//! Downsampling first runs a Blackman-windowed sinc low-pass at 90% of the
//! output Nyquist frequency, so content above it does not fold into the
//! recognizer band.  Each call filters its own buffer; edges are extended by
//! point reflection about the first and last sample.

use std::f64::consts::PI;

/// Largest up/down ratio [`validate_ratio`] accepts.
pub const MAX_RATIO: u32 = 8;

/// Fraction of the output Nyquist band kept when decimating.
const PASSBAND: f64 = 0.9;
/// Anti-alias filter half-length, in output samples.
const HALF_TAPS: f64 = 8.0;

/// Resample mono `samples` from `rate_in` Hz to `rate_out` Hz.
///
/// * Equal rates return a copy of the input.
/// * Empty input or a zero rate returns an empty vector.
/// * Output length is `ceil(len * rate_out / rate_in)`.
/// * Results are clipped to the `i16` range, never wrapped.
/// * Downsampling is low-pass filtered first.
///
/// # Example
///
/// ```rust
/// use ptt_translator::audio::resample;
///
/// let hi = vec![1000_i16; 960]; // 20 ms @ 48 kHz
/// let lo = resample(&hi, 48_000, 16_000);
/// assert_eq!(lo.len(), 320);
/// assert!(lo.iter().all(|&s| s == 1000));
/// ```
pub fn resample(samples: &[i16], rate_in: u32, rate_out: u32) -> Vec<i16> {
    if rate_in == rate_out {
        return samples.to_vec();
    }
    if samples.is_empty() || rate_in == 0 || rate_out == 0 {
        return Vec::new();
    }

    if rate_out < rate_in {
        let filtered = low_pass(samples, &anti_alias_taps(rate_in, rate_out));
        return interpolate(&filtered, rate_in as u64, rate_out as u64);
    }
    interpolate(samples, rate_in as u64, rate_out as u64)
}

fn interpolate(samples: &[i16], rate_in: u64, rate_out: u64) -> Vec<i16> {
    let output_len = (samples.len() as u64 * rate_out).div_ceil(rate_in) as usize;
    let last = samples.len() - 1;

    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len as u64 {
        // Source position i * rate_in / rate_out, kept as integer + remainder.
        let numerator = i * rate_in;
        let idx = (numerator / rate_out) as usize;
        let rem = (numerator % rate_out) as i64;

        let sample = if idx >= last {
            samples[last] as i64
        } else {
            let a = samples[idx] as i64;
            let b = samples[idx + 1] as i64;
            a + (b - a) * rem / rate_out as i64
        };
        output.push(sample.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
    }

    output
}

/// Unity-gain windowed-sinc taps for decimating `rate_in` to `rate_out`.
fn anti_alias_taps(rate_in: u32, rate_out: u32) -> Vec<f64> {
    let ratio = rate_in as f64 / rate_out as f64;
    let half = (HALF_TAPS * ratio).ceil() as usize;
    // cycles per input sample
    let cutoff = PASSBAND * 0.5 / ratio;
    let len = 2 * half + 1;
    let span = (len - 1) as f64;

    let mut taps: Vec<f64> = (0..len)
        .map(|n| {
            let k = n as f64 - half as f64;
            let sinc = if n == half {
                2.0 * cutoff
            } else {
                (2.0 * PI * cutoff * k).sin() / (PI * k)
            };
            let phase = 2.0 * PI * n as f64 / span;
            let window = 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos();
            sinc * window
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    taps.iter_mut().for_each(|t| *t /= sum);
    taps
}

fn low_pass(samples: &[i16], taps: &[f64]) -> Vec<i16> {
    let half = (taps.len() / 2) as isize;
    let last = samples.len() as isize - 1;
    let at = |i: isize| -> f64 {
        if i < 0 {
            2.0 * samples[0] as f64 - samples[(-i).min(last) as usize] as f64
        } else if i > last {
            2.0 * samples[last as usize] as f64 - samples[(2 * last - i).max(0) as usize] as f64
        } else {
            samples[i as usize] as f64
        }
    };

    (0..=last)
        .map(|i| {
            let acc: f64 = taps
                .iter()
                .enumerate()
                .map(|(k, &t)| t * at(i + k as isize - half))
                .sum();
            acc.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

/// `true` when both rates are non-zero and at most [`MAX_RATIO`] apart.
pub fn validate_ratio(rate_in: u32, rate_out: u32) -> bool {
    if rate_in == 0 || rate_out == 0 {
        return false;
    }
    let (lo, hi) = if rate_in < rate_out {
        (rate_in, rate_out)
    } else {
        (rate_out, rate_in)
    };
    hi <= lo.saturating_mul(MAX_RATIO)
}
