//! Pipeline orchestrator: one utterance at a time, press to playback.
//!
//! [`PipelineOrchestrator`] consumes [`PttEvent`]s from a bounded channel and
//! is the only writer of the pipeline state.  Device, translation and mixer
//! collaborators are injected as trait objects.
//!
//! # Utterance flow
//!
//! ```text
//! Pressed
//!   └─▶ open capture, start session                 ──err──▶ IDLE
//!         └─▶ [CAPTURING] mute mic, unmute TTS (best-effort)
//!               frames ─▶ resample ─▶ push_audio
//! Released
//!   └─▶ [PROCESSING] close capture, drain, finalize (hard timeout)
//!         ├─ error / timeout ─▶ abort session ─▶ IDLE
//!         ├─ silence ─────────────────────────▶ IDLE
//!         └─ speech ─▶ [PLAYING] resample, play (blocking pool) ─▶ IDLE
//!
//! IDLE entry: unmute mic, mute TTS (when routing changed or degraded)
//! ```
//!
//! Presses that arrive while busy are read and dropped, never queued.
//! Mid-utterance mixer failures set the degraded flag instead of aborting;
//! the next transition tries to reconnect and restore routing.

use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::{
    resample, AudioDump, AudioFrame, CaptureDevice, CaptureRead, CaptureRequest, CaptureStream,
    DeviceError, PlaybackDevice,
};
use crate::config::{AppConfig, ConfigError};
use crate::diagnostics::{stage, StageTimer, TimingDiagnostics};
use crate::hotkey::{InputHookError, PttEvent};
use crate::mixer::{MixerController, MixerError};
use crate::translate::{SessionId, SpeechTranslator, Translation, TranslationError};

use super::state::{new_shared_status, PipelineState, PipelineStatus, SharedStatus};

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error(transparent)]
    InputHook(#[from] InputHookError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The mixer never answered during startup.
    #[error("mixer unreachable after {attempts} connection attempts")]
    MixerConnection { attempts: u32 },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// How an utterance that was not aborted ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Played,
    /// Nothing recognized; nothing to play.
    Silent,
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

/// Drives the capture → translate → playback loop for one profile.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use ptt_translator::audio::{CpalCapture, CpalPlayback};
/// use ptt_translator::config::AppConfig;
/// use ptt_translator::mixer::{MixerController, VbanTextBackend};
/// use ptt_translator::pipeline::PipelineOrchestrator;
/// use ptt_translator::translate::{AzureTranslator, SpeechCredentials};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::default();
/// let credentials = SpeechCredentials::from_env(&config.speech.region)?;
/// let translator = AzureTranslator::new(
///     credentials,
///     config.speech.voice.clone(),
///     config.audio.recognizer_sample_rate,
///     config.speech.push_retries,
///     Duration::from_secs(10),
/// );
/// let backend = VbanTextBackend::new("127.0.0.1", 6980, "Command1");
/// let mixer = MixerController::new(Box::new(backend), config.mixer.retry_policy());
///
/// let mut orchestrator = PipelineOrchestrator::new(
///     config,
///     Arc::new(CpalCapture::new()),
///     Arc::new(CpalPlayback::default()),
///     Arc::new(translator),
///     Arc::new(mixer),
/// );
/// orchestrator.startup().await?;
///
/// let (ptt_tx, ptt_rx) = tokio::sync::mpsc::channel(16);
/// // ptt_tx goes to PttHandler callbacks
/// # drop(ptt_tx);
/// orchestrator.run(ptt_rx).await;
/// # Ok(())
/// # }
/// ```
pub struct PipelineOrchestrator {
    config: AppConfig,
    capture: Arc<dyn CaptureDevice>,
    playback: Arc<dyn PlaybackDevice>,
    translator: Arc<dyn SpeechTranslator>,
    mixer: Arc<MixerController>,
    timing: Arc<TimingDiagnostics>,
    status: SharedStatus,
    dump: Option<AudioDump>,
    state: PipelineState,
    /// Capture routing was (at least partly) applied and not yet reverted.
    mixer_dirty: bool,
    degraded: bool,
}

impl PipelineOrchestrator {
    /// `config` must already have passed [`AppConfig::validate`].
    pub fn new(
        config: AppConfig,
        capture: Arc<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
        translator: Arc<dyn SpeechTranslator>,
        mixer: Arc<MixerController>,
    ) -> Self {
        let timing = Arc::new(TimingDiagnostics::new(config.diagnostics.timing_window));
        let dump = config
            .diagnostics
            .dump_audio
            .then(|| AudioDump::new(&config.diagnostics.dump_dir));
        Self {
            config,
            capture,
            playback,
            translator,
            mixer,
            timing,
            status: new_shared_status(),
            dump,
            state: PipelineState::Idle,
            mixer_dirty: false,
            degraded: false,
        }
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn timing(&self) -> Arc<TimingDiagnostics> {
        Arc::clone(&self.timing)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn label(&self) -> &str {
        self.config.label()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect the mixer and put it into idle routing.
    ///
    /// An unreachable mixer is fatal here; later failures only degrade.
    pub async fn startup(&mut self) -> Result<(), PipelineError> {
        if !self.mixer.connect().await {
            return Err(PipelineError::MixerConnection {
                attempts: self.config.mixer.connect_attempts,
            });
        }

        let (tts, bus) = (self.config.mixer.strip_tts, self.config.mixer.bus.clone());
        if let Err(e) = self.mixer.route_to_bus(tts, &bus, true).await {
            log::warn!(
                "pipeline: profile={} could not route strip={tts} to bus={bus}: {e}",
                self.label()
            );
            self.mark_degraded(&e);
        }
        self.apply_idle_routing().await;

        log::info!(
            "pipeline: ready profile={} source={} target={} key={}",
            self.label(),
            self.config.speech.source_language,
            self.config.speech.target_language,
            self.config.ptt.key
        );
        Ok(())
    }

    /// Process PTT events until the sender side is dropped, then shut down.
    pub async fn run(mut self, mut ptt_rx: mpsc::Receiver<PttEvent>) {
        while let Some(event) = ptt_rx.recv().await {
            match event {
                PttEvent::Pressed => self.handle_press(&mut ptt_rx).await,
                PttEvent::Released => {
                    log::debug!("pipeline: profile={} release while idle ignored", self.label());
                }
            }
        }

        log::info!("pipeline: profile={} input closed, shutting down", self.label());
        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        self.restore_mixer().await;
        self.apply_idle_routing().await;
        self.timing.log_summary();
        self.mixer.disconnect().await;
    }

    // -----------------------------------------------------------------------
    // Utterance
    // -----------------------------------------------------------------------

    async fn handle_press(&mut self, ptt_rx: &mut mpsc::Receiver<PttEvent>) {
        let pressed_at = Instant::now();

        match self.utterance(ptt_rx).await {
            Ok(outcome) => {
                if outcome == Outcome::Played {
                    self.timing.record(stage::TOTAL, pressed_at.elapsed());
                }
                self.update_status(|s| s.utterances += 1);
            }
            Err(e) => {
                log::error!("pipeline: profile={} utterance aborted: {e}", self.label());
                let reason = e.to_string();
                self.update_status(|s| {
                    s.aborted += 1;
                    s.last_error = Some(reason);
                });
            }
        }

        self.enter_idle().await;
    }

    async fn utterance(
        &mut self,
        ptt_rx: &mut mpsc::Receiver<PttEvent>,
    ) -> Result<Outcome, PipelineError> {
        self.restore_mixer().await;

        // ── Open capture and session before touching the mixer ──────────
        let audio = &self.config.audio;
        let request = CaptureRequest {
            device: audio.capture_device.clone(),
            sample_rate: audio.capture_sample_rate,
            frame_duration: audio.frame_duration(),
            queue_frames: audio.queue_frames,
        };
        let capture = Arc::clone(&self.capture);
        let mut stream = tokio::task::spawn_blocking(move || capture.open(&request))
            .await
            .map_err(|e| PipelineError::Internal(format!("capture open task failed: {e}")))??;

        let speech = &self.config.speech;
        let session = match self
            .translator
            .start_session(&speech.source_language, &speech.target_language)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                stream.shutdown().await;
                return Err(e.into());
            }
        };

        // ── CAPTURING ───────────────────────────────────────────────────
        self.transition(PipelineState::Capturing)?;
        let capturing = StageTimer::start(&self.timing, stage::CAPTURING);
        self.apply_capture_routing().await;

        let captured = match self.capture_until_release(&mut stream, session, ptt_rx).await {
            Ok(captured) => captured,
            Err(e) => {
                self.translator.abort(session).await;
                return Err(e);
            }
        };
        drop(capturing);

        // ── PROCESSING ──────────────────────────────────────────────────
        self.transition(PipelineState::Processing)?;
        let processing = StageTimer::start(&self.timing, stage::PROCESSING);
        if let Some(dump) = &self.dump {
            dump.write("capture", &captured, self.config.audio.recognizer_sample_rate);
        }

        let translation = self.finalize(session, ptt_rx).await?;
        drop(processing);

        if translation.is_silent() {
            log::info!("pipeline: profile={} nothing recognized", self.label());
            return Ok(Outcome::Silent);
        }
        log::info!(
            "pipeline: profile={} recognized={:?} translated={:?}",
            self.label(),
            translation.recognized_text,
            translation.translated_text
        );
        let translated = translation.translated_text.clone();
        self.update_status(|s| s.last_translation = Some(translated));

        // ── PLAYING ─────────────────────────────────────────────────────
        self.play(translation, ptt_rx).await?;
        Ok(Outcome::Played)
    }

    /// Stream frames to `session` until the key is released.
    ///
    /// Returns the recognizer-rate audio when dumping is enabled, otherwise
    /// an empty buffer.
    async fn capture_until_release(
        &self,
        stream: &mut CaptureStream,
        session: SessionId,
        ptt_rx: &mut mpsc::Receiver<PttEvent>,
    ) -> Result<Vec<i16>, PipelineError> {
        let mut captured = Vec::new();
        let mut stream_done = false;

        let read_result: Result<(), DeviceError> = loop {
            tokio::select! {
                event = ptt_rx.recv() => match event {
                    Some(PttEvent::Released) | None => break Ok(()),
                    Some(PttEvent::Pressed) => {}
                },
                read = stream.read_frame(), if !stream_done => match read {
                    Ok(CaptureRead::Frame(frame)) => {
                        self.forward_frame(session, &frame, &mut captured).await;
                    }
                    Ok(CaptureRead::EndOfStream) => {
                        log::warn!("capture: profile={} stream ended before release", self.label());
                        stream_done = true;
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        stream.shutdown().await;
        read_result?;
        while let Some(frame) = stream.try_read_frame() {
            self.forward_frame(session, &frame, &mut captured).await;
        }

        let overflows = stream.overflows();
        if overflows > 0 {
            log::warn!("capture: profile={} dropped_frames={overflows}", self.label());
            self.update_status(|s| s.capture_overflows += overflows);
        }
        Ok(captured)
    }

    async fn forward_frame(&self, session: SessionId, frame: &AudioFrame, captured: &mut Vec<i16>) {
        let rate = self.config.audio.recognizer_sample_rate;
        let frame = AudioFrame::mono(resample(&frame.samples, frame.sample_rate, rate), rate);
        self.translator.push_audio(session, &frame).await;
        if self.dump.is_some() {
            captured.extend_from_slice(&frame.samples);
        }
    }

    /// Finalize under the hard timeout.  On timeout the session is aborted.
    async fn finalize(
        &self,
        session: SessionId,
        ptt_rx: &mut mpsc::Receiver<PttEvent>,
    ) -> Result<Translation, PipelineError> {
        let limit = self.config.speech.finalize_timeout();
        let finalize = tokio::time::timeout(limit, self.translator.finalize(session));

        match drive_ignoring_presses(ptt_rx, finalize).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => {
                log::warn!(
                    "translate: profile={} session={session} no result within {} ms",
                    self.label(),
                    limit.as_millis()
                );
                self.translator.abort(session).await;
                Err(TranslationError::Timeout.into())
            }
        }
    }

    async fn play(
        &mut self,
        translation: Translation,
        ptt_rx: &mut mpsc::Receiver<PttEvent>,
    ) -> Result<(), PipelineError> {
        let rate = self.config.audio.playback_sample_rate;
        let audio = resample(&translation.audio, translation.sample_rate, rate);
        if let Some(dump) = &self.dump {
            dump.write("tts", &audio, rate);
        }

        self.transition(PipelineState::Playing)?;
        let _playing = StageTimer::start(&self.timing, stage::PLAYING);

        let playback = Arc::clone(&self.playback);
        let task = tokio::task::spawn_blocking(move || playback.play(&audio, rate));
        match drive_ignoring_presses(ptt_rx, task).await {
            Ok(result) => Ok(result?),
            Err(e) => Err(PipelineError::Internal(format!("playback task failed: {e}"))),
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.set_state(next);
        Ok(())
    }

    fn set_state(&mut self, next: PipelineState) {
        if self.state != next {
            log::info!("pipeline: profile={} {} -> {}", self.label(), self.state, next);
        }
        self.state = next;
        self.update_status(|s| s.state = next);
    }

    async fn enter_idle(&mut self) {
        self.set_state(PipelineState::Idle);
        self.restore_mixer().await;
        if self.mixer_dirty || self.degraded {
            self.apply_idle_routing().await;
        }
    }

    fn update_status(&self, edit: impl FnOnce(&mut PipelineStatus)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        edit(&mut status);
    }

    // -----------------------------------------------------------------------
    // Mixer routing
    // -----------------------------------------------------------------------

    async fn apply_capture_routing(&mut self) {
        self.mixer_dirty = true;
        let (mic, tts) = (self.config.mixer.strip_mic, self.config.mixer.strip_tts);
        self.command_mute(mic, true).await;
        self.command_mute(tts, false).await;
    }

    async fn apply_idle_routing(&mut self) {
        let (mic, tts) = (self.config.mixer.strip_mic, self.config.mixer.strip_tts);
        let mic_ok = self.command_mute(mic, false).await;
        let tts_ok = self.command_mute(tts, true).await;
        if mic_ok && tts_ok {
            self.mixer_dirty = false;
        }
    }

    /// Best-effort mute command; a failure degrades instead of erroring.
    async fn command_mute(&mut self, strip: usize, muted: bool) -> bool {
        match self.mixer.set_strip_mute(strip, muted).await {
            Ok(()) => true,
            Err(e) => {
                self.mark_degraded(&e);
                false
            }
        }
    }

    fn mark_degraded(&mut self, cause: &MixerError) {
        if !self.degraded {
            log::warn!("pipeline: profile={} mixer degraded: {cause}", self.label());
        }
        self.degraded = true;
        self.update_status(|s| s.degraded = true);
    }

    /// Check the mixer still answers, and make one reconnect attempt when
    /// degraded.  Routing is reapplied by the caller.
    async fn restore_mixer(&mut self) {
        if !self.degraded {
            match self.mixer.verify().await {
                Ok(()) => return,
                Err(e) => self.mark_degraded(&e),
            }
        }
        if !self.mixer.is_connected() && !self.mixer.reconnect().await {
            return;
        }
        log::info!("pipeline: profile={} mixer restored", self.label());
        self.degraded = false;
        self.mixer_dirty = true;
        self.update_status(|s| s.degraded = false);
    }
}

/// Await `fut` while reading and discarding PTT events.
async fn drive_ignoring_presses<F: Future>(
    ptt_rx: &mut mpsc::Receiver<PttEvent>,
    fut: F,
) -> F::Output {
    tokio::pin!(fut);
    let mut input_open = true;
    loop {
        tokio::select! {
            output = &mut fut => return output,
            event = ptt_rx.recv(), if input_open => match event {
                Some(event) => log::debug!("pipeline: {event:?} ignored while busy"),
                None => input_open = false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::audio::{FakeCapture, FakePlayback};
    use crate::mixer::{MockMixerBackend, MockMixerState, RetryPolicy};
    use crate::translate::StubTranslator;

    const SPEECH_RATE: u32 = 16_000;

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        orchestrator: PipelineOrchestrator,
        mixer: Arc<Mutex<MockMixerState>>,
        translator: Arc<StubTranslator>,
        playback: FakePlayback,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.profile = "test".into();
        config.audio.capture_sample_rate = SPEECH_RATE;
        config.mixer.connect_attempts = 2;
        config.mixer.initial_backoff_ms = 1;
        config
    }

    /// One second of a 440 Hz sine at 16 kHz, in 20 ms frames.
    fn sine_second() -> Vec<AudioFrame> {
        let samples: Vec<i16> = (0..SPEECH_RATE)
            .map(|i| {
                let t = i as f32 / SPEECH_RATE as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16
            })
            .collect();
        samples
            .chunks(320)
            .map(|chunk| AudioFrame::mono(chunk.to_vec(), SPEECH_RATE))
            .collect()
    }

    fn hello() -> Translation {
        Translation {
            recognized_text: "привіт".into(),
            translated_text: "hello".into(),
            audio: (0..4_800).map(|i| (i % 200) as i16).collect(),
            sample_rate: 48_000,
        }
    }

    fn harness_with(
        config: AppConfig,
        capture: FakeCapture,
        translator: StubTranslator,
        playback: FakePlayback,
    ) -> Harness {
        let backend = MockMixerBackend::new();
        let mixer = backend.handle();
        let controller = MixerController::new(
            Box::new(backend),
            RetryPolicy {
                attempts: config.mixer.connect_attempts,
                initial_backoff: Duration::from_millis(1),
            },
        );
        let translator = Arc::new(translator);
        let orchestrator = PipelineOrchestrator::new(
            config,
            Arc::new(capture),
            Arc::new(playback.clone()),
            Arc::clone(&translator) as Arc<dyn SpeechTranslator>,
            Arc::new(controller),
        );
        Harness {
            orchestrator,
            mixer,
            translator,
            playback,
        }
    }

    fn harness(translator: StubTranslator) -> Harness {
        harness_with(
            test_config(),
            FakeCapture::with_frames(sine_second()),
            translator,
            FakePlayback::new(),
        )
    }

    /// Start up, deliver `events`, close the channel and run to completion.
    async fn run_events(mut orchestrator: PipelineOrchestrator, events: &[PttEvent]) {
        orchestrator.startup().await.expect("startup");
        run_started(orchestrator, events).await;
    }

    /// Deliver `events` to an orchestrator that has already started up.
    async fn run_started(orchestrator: PipelineOrchestrator, events: &[PttEvent]) {
        let (tx, rx) = mpsc::channel(16);
        for event in events {
            tx.send(*event).await.unwrap();
        }
        drop(tx);
        orchestrator.run(rx).await;
    }

    const UTTERANCE: [PttEvent; 2] = [PttEvent::Pressed, PttEvent::Released];

    fn snapshot(status: &SharedStatus) -> PipelineStatus {
        status.lock().unwrap().clone()
    }

    async fn wait_until(status: &SharedStatus, done: impl Fn(&PipelineStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&snapshot(status)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline did not reach the expected status");
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn press_release_plays_translation_and_returns_idle() {
        let h = harness(StubTranslator::new(hello()));
        let status = h.orchestrator.status();
        let timing = h.orchestrator.timing();

        run_events(h.orchestrator, &UTTERANCE).await;

        assert_eq!(h.translator.started(), 1);
        assert_eq!(h.translator.pushed_samples(), SPEECH_RATE as usize);
        assert_eq!(h.playback.played(), vec![(hello().audio, 48_000)]);

        assert_eq!(timing.count(stage::CAPTURING), 1);
        assert_eq!(timing.count(stage::PLAYING), 1);
        assert_eq!(timing.count(stage::PROCESSING), 1);
        assert_eq!(timing.count(stage::TOTAL), 1);

        let s = snapshot(&status);
        assert_eq!(s.state, PipelineState::Idle);
        assert_eq!(s.utterances, 1);
        assert_eq!(s.aborted, 0);
        assert_eq!(s.last_translation.as_deref(), Some("hello"));
        assert!(!s.degraded);

        let mixer = h.mixer.lock().unwrap();
        assert_eq!(mixer.muted(0), Some(false));
        assert_eq!(mixer.muted(1), Some(true));
        assert_eq!(mixer.count("Strip[1].B1"), 1);
        assert!(mixer.log.contains(&("Strip[0].Mute".to_string(), 1.0)));
        assert!(mixer.log.contains(&("Strip[1].Mute".to_string(), 0.0)));
    }

    #[tokio::test]
    async fn synthesized_audio_is_resampled_to_playback_rate() {
        let translation = Translation {
            audio: vec![1_000; 1_600],
            sample_rate: 16_000,
            ..hello()
        };
        let h = harness(StubTranslator::new(translation));
        run_events(h.orchestrator, &UTTERANCE).await;

        let played = h.playback.played();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].1, 48_000);
        assert_eq!(played[0].0.len(), 4_800);
    }

    #[tokio::test]
    async fn press_while_processing_is_ignored() {
        let h = harness(StubTranslator::new(hello()).with_delay(Duration::from_millis(50)));
        let status = h.orchestrator.status();

        let events = [
            PttEvent::Pressed,
            PttEvent::Released,
            PttEvent::Pressed,
            PttEvent::Released,
        ];
        run_events(h.orchestrator, &events).await;

        assert_eq!(h.translator.started(), 1);
        assert_eq!(h.playback.played().len(), 1);
        assert_eq!(snapshot(&status).utterances, 1);
    }

    #[tokio::test]
    async fn release_while_idle_does_nothing() {
        let h = harness(StubTranslator::new(hello()));
        run_events(h.orchestrator, &[PttEvent::Released]).await;
        assert_eq!(h.translator.started(), 0);
        assert!(h.playback.played().is_empty());
    }

    #[tokio::test]
    async fn capture_open_failure_leaves_routing_untouched() {
        let h = harness_with(
            test_config(),
            FakeCapture::failing(),
            StubTranslator::new(hello()),
            FakePlayback::new(),
        );
        let status = h.orchestrator.status();

        run_events(h.orchestrator, &UTTERANCE).await;

        let s = snapshot(&status);
        assert_eq!(s.state, PipelineState::Idle);
        assert_eq!(s.aborted, 1);
        assert!(s.last_error.is_some());
        assert_eq!(h.translator.started(), 0);

        let mixer = h.mixer.lock().unwrap();
        assert!(!mixer.log.contains(&("Strip[1].Mute".to_string(), 0.0)));
        assert!(!mixer.log.contains(&("Strip[0].Mute".to_string(), 1.0)));
        assert_eq!(mixer.muted(0), Some(false));
    }

    #[tokio::test]
    async fn refused_session_closes_capture_without_routing() {
        let h = harness(StubTranslator::refusing());
        let status = h.orchestrator.status();

        run_events(h.orchestrator, &UTTERANCE).await;

        assert_eq!(snapshot(&status).aborted, 1);
        let mixer = h.mixer.lock().unwrap();
        assert!(!mixer.log.contains(&("Strip[1].Mute".to_string(), 0.0)));
    }

    #[tokio::test]
    async fn mixer_loss_degrades_but_utterance_completes() {
        let mut h = harness(StubTranslator::new(hello()));
        h.orchestrator.startup().await.unwrap();
        h.mixer.lock().unwrap().offline = true;
        let status = h.orchestrator.status();

        run_started(h.orchestrator, &UTTERANCE).await;

        assert_eq!(h.translator.pushed_samples(), SPEECH_RATE as usize);
        assert_eq!(h.playback.played().len(), 1);
        let s = snapshot(&status);
        assert!(s.degraded);
        assert_eq!(s.utterances, 1);
        assert_eq!(s.aborted, 0);
    }

    #[tokio::test]
    async fn degraded_mode_clears_once_mixer_returns() {
        let mut h = harness(StubTranslator::new(hello()));
        h.orchestrator.startup().await.unwrap();
        h.mixer.lock().unwrap().offline = true;
        let status = h.orchestrator.status();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(h.orchestrator.run(rx));

        for event in UTTERANCE {
            tx.send(event).await.unwrap();
        }
        wait_until(&status, |s| s.utterances == 1).await;
        assert!(snapshot(&status).degraded);

        h.mixer.lock().unwrap().offline = false;
        for event in UTTERANCE {
            tx.send(event).await.unwrap();
        }
        wait_until(&status, |s| s.utterances == 2).await;
        drop(tx);
        task.await.unwrap();

        assert!(!snapshot(&status).degraded);
        let mixer = h.mixer.lock().unwrap();
        assert_eq!(mixer.muted(0), Some(false));
        assert_eq!(mixer.muted(1), Some(true));
    }

    #[tokio::test]
    async fn silently_dead_mixer_is_detected_on_next_press() {
        let mut h = harness(StubTranslator::new(hello()));
        h.orchestrator.startup().await.unwrap();
        h.mixer.lock().unwrap().unresponsive = true;
        let status = h.orchestrator.status();

        run_started(h.orchestrator, &UTTERANCE).await;

        let s = snapshot(&status);
        assert!(s.degraded);
        assert_eq!((s.utterances, s.aborted), (1, 0));
        assert_eq!(h.playback.played().len(), 1);
    }

    #[tokio::test]
    async fn capture_disconnect_aborts_and_restores_idle_routing() {
        let one_frame = sine_second().into_iter().take(1).collect();
        let h = harness_with(
            test_config(),
            FakeCapture::disconnecting(one_frame, "unplugged"),
            StubTranslator::new(hello()),
            FakePlayback::new(),
        );
        let mut orchestrator = h.orchestrator;
        orchestrator.startup().await.unwrap();
        let status = orchestrator.status();

        // Hold the key: the device fails before any release arrives.
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(orchestrator.run(rx));
        tx.send(PttEvent::Pressed).await.unwrap();
        wait_until(&status, |s| s.aborted == 1 && s.state == PipelineState::Idle).await;
        drop(tx);
        task.await.unwrap();

        assert_eq!(h.translator.started(), 1);
        assert_eq!(h.translator.aborted(), 1);
        assert!(h.translator.live_session().is_none());
        assert!(h.playback.played().is_empty());

        let s = snapshot(&status);
        assert_eq!(s.utterances, 0);
        assert!(s.last_error.unwrap().contains("unplugged"));

        let mixer = h.mixer.lock().unwrap();
        assert!(mixer.log.contains(&("Strip[0].Mute".to_string(), 1.0)));
        assert_eq!(mixer.muted(0), Some(false));
        assert_eq!(mixer.muted(1), Some(true));
    }

    #[tokio::test]
    async fn slow_capture_open_does_not_stall_runtime() {
        let h = harness_with(
            test_config(),
            FakeCapture::with_frames(sine_second()).with_open_delay(Duration::from_millis(400)),
            StubTranslator::new(hello()),
            FakePlayback::new(),
        );
        let mut orchestrator = h.orchestrator;
        orchestrator.startup().await.unwrap();
        let status = orchestrator.status();

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(orchestrator.run(rx));
        tx.send(PttEvent::Pressed).await.unwrap();

        // The orchestrator runs on this same thread while the device opens.
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");

        tx.send(PttEvent::Released).await.unwrap();
        wait_until(&status, |s| s.utterances == 1).await;
        drop(tx);
        task.await.unwrap();
        assert_eq!(h.playback.played().len(), 1);
    }

    #[tokio::test]
    async fn finalize_timeout_aborts_without_playback() {
        let mut config = test_config();
        config.speech.finalize_timeout_ms = 200;
        let h = harness_with(
            config,
            FakeCapture::with_frames(sine_second()),
            StubTranslator::new(hello()).with_delay(Duration::from_secs(10)),
            FakePlayback::new(),
        );
        let status = h.orchestrator.status();

        let started = Instant::now();
        run_events(h.orchestrator, &UTTERANCE).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert!(h.playback.played().is_empty());
        assert_eq!(h.translator.aborted(), 1);

        let s = snapshot(&status);
        assert_eq!(s.state, PipelineState::Idle);
        assert_eq!(s.aborted, 1);
        assert!(s.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn translation_failure_is_silent() {
        let h = harness(StubTranslator::failing("no speech service"));
        let status = h.orchestrator.status();
        let timing = h.orchestrator.timing();

        run_events(h.orchestrator, &UTTERANCE).await;

        assert!(h.playback.played().is_empty());
        assert_eq!(timing.count(stage::PLAYING), 0);
        assert_eq!(timing.count(stage::TOTAL), 0);
        let s = snapshot(&status);
        assert_eq!(s.aborted, 1);
        assert!(s.last_error.unwrap().contains("no speech service"));
        assert_eq!(h.mixer.lock().unwrap().muted(1), Some(true));
    }

    #[tokio::test]
    async fn empty_recognition_returns_idle_quietly() {
        let h = harness(StubTranslator::new(Translation::default()));
        let status = h.orchestrator.status();

        run_events(h.orchestrator, &UTTERANCE).await;

        assert!(h.playback.played().is_empty());
        let s = snapshot(&status);
        assert_eq!((s.utterances, s.aborted), (1, 0));
        assert!(s.last_translation.is_none());
    }

    #[tokio::test]
    async fn playback_failure_aborts_utterance() {
        let h = harness_with(
            test_config(),
            FakeCapture::with_frames(sine_second()),
            StubTranslator::new(hello()),
            FakePlayback::failing(),
        );
        let status = h.orchestrator.status();
        let timing = h.orchestrator.timing();

        run_events(h.orchestrator, &UTTERANCE).await;

        assert_eq!(timing.count(stage::PLAYING), 1);
        let s = snapshot(&status);
        assert_eq!(s.aborted, 1);
        assert_eq!(s.state, PipelineState::Idle);
    }

    #[tokio::test]
    async fn unreachable_mixer_is_fatal_at_startup() {
        let mut h = harness(StubTranslator::new(hello()));
        h.mixer.lock().unwrap().offline = true;

        let err = h.orchestrator.startup().await.unwrap_err();
        assert!(matches!(err, PipelineError::MixerConnection { attempts: 2 }));
        assert_eq!(h.mixer.lock().unwrap().logins, 2);
    }

    #[tokio::test]
    async fn audio_dumps_written_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.diagnostics.dump_audio = true;
        config.diagnostics.dump_dir = dir.path().to_string_lossy().into_owned();
        let h = harness_with(
            config,
            FakeCapture::with_frames(sine_second()),
            StubTranslator::new(hello()),
            FakePlayback::new(),
        );

        run_events(h.orchestrator, &UTTERANCE).await;

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("capture_"));
        assert!(names[1].starts_with("tts_"));
    }

    #[tokio::test]
    async fn capturing_rejected_unless_idle() {
        let mut h = harness(StubTranslator::new(hello()));
        h.orchestrator.set_state(PipelineState::Capturing);
        h.orchestrator.transition(PipelineState::Processing).unwrap();

        let err = h.orchestrator.transition(PipelineState::Capturing).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: PipelineState::Processing,
                to: PipelineState::Capturing
            }
        ));
        assert_eq!(h.orchestrator.state(), PipelineState::Processing);
    }
}
