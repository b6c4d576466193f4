//! Latency bookkeeping for the pipeline stages.

pub mod timing;

pub use timing::{StageSummary, StageTimer, TimingDiagnostics};

/// Stage names recorded by the orchestrator.
pub mod stage {
    /// PTT press → capture stopped.
    pub const CAPTURING: &str = "capturing";
    /// Capture stopped → translated speech ready.
    pub const PROCESSING: &str = "processing";
    /// Playback start → playback finished.
    pub const PLAYING: &str = "playing";
    /// PTT press → playback finished, successful utterances only.
    pub const TOTAL: &str = "total";
}
