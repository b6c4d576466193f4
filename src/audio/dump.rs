//! Optional WAV dumps of captured and synthesized audio for offline inspection.
//!
//! Writing is a side channel: every failure is logged and swallowed so a full
//! disk or a bad path never affects an utterance.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes mono 16-bit WAV files into a directory.
#[derive(Debug, Clone)]
pub struct AudioDump {
    dir: PathBuf,
}

impl AudioDump {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `samples` as `<label>_<unix_ms>.wav`.
    ///
    /// Returns the written path, or `None` when nothing was written.
    pub fn write(&self, label: &str, samples: &[i16], sample_rate: u32) -> Option<PathBuf> {
        if samples.is_empty() || sample_rate == 0 {
            return None;
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = self.dir.join(format!("{label}_{stamp}.wav"));

        match write_wav(&path, samples, sample_rate) {
            Ok(()) => {
                log::debug!(
                    "dump: wrote {} samples={} rate={}",
                    path.display(),
                    samples.len(),
                    sample_rate
                );
                Some(path)
            }
            Err(e) => {
                log::warn!("dump: failed to write {}: {e}", path.display());
                None
            }
        }
    }
}

fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<(), hound::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()
}
