//! Azure Speech REST implementation of [`SpeechTranslator`].
//!
//! Per session:
//!
//! 1. `start_session` opens a chunked POST to the short-audio recognizer and
//!    keeps its body fed from a bounded channel (WAV header first, then raw
//!    16-bit PCM frames as they are pushed);
//! 2. `finalize` closes the body, awaits the recognition JSON, translates the
//!    text with the Translator API and synthesizes it as raw 48 kHz PCM.
//!
//! Secrets come from [`SpeechCredentials`]; nothing is stored in config files.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::client::{SessionId, SpeechTranslator, Translation, TranslationError};
use crate::audio::AudioFrame;

/// Rate of audio returned by synthesis (`raw-48khz-16bit-mono-pcm`).
pub const SYNTHESIS_SAMPLE_RATE: u32 = 48_000;
const SYNTHESIS_FORMAT: &str = "raw-48khz-16bit-mono-pcm";
const TRANSLATOR_URL: &str = "https://api.cognitive.microsofttranslator.com/translate";
/// Upload chunks buffered per session (~1.3 s of 20 ms frames).
const UPLOAD_QUEUE: usize = 64;
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(10);

type UploadChunk = Result<Vec<u8>, std::io::Error>;

// ---------------------------------------------------------------------------
// SpeechCredentials
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SpeechCredentials {
    pub key: String,
    pub region: String,
}

impl SpeechCredentials {
    /// Read `SPEECH_KEY` (required) and `SPEECH_REGION` (falls back to
    /// `default_region`).
    pub fn from_env(default_region: &str) -> Result<Self, TranslationError> {
        Self::from_lookup(default_region, |name| std::env::var(name).ok())
    }

    fn from_lookup(
        default_region: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TranslationError> {
        let key = lookup("SPEECH_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| TranslationError::Credentials("SPEECH_KEY is not set".into()))?;
        let region = lookup("SPEECH_REGION")
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| default_region.to_string());
        Ok(Self { key, region })
    }
}

impl fmt::Debug for SpeechCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechCredentials")
            .field("key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// `"uk-UA"` → `"uk"`.
pub fn language_prefix(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

/// Escape text for inclusion in SSML.
pub fn escape_ssml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Voice names look like `en-GB-RyanNeural`; the locale is the first two parts.
fn voice_locale(voice: &str) -> String {
    voice.splitn(3, '-').take(2).collect::<Vec<_>>().join("-")
}

pub fn build_ssml(voice: &str, text: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{}'><voice name='{}'>{}</voice></speak>",
        voice_locale(voice),
        escape_ssml(voice),
        escape_ssml(text)
    )
}

/// Extract the display text from a short-audio recognition response.
///
/// "No speech" outcomes yield an empty string rather than an error.
pub fn parse_recognition(json: &serde_json::Value) -> Result<String, TranslationError> {
    let status = json["RecognitionStatus"]
        .as_str()
        .ok_or_else(|| TranslationError::Parse("missing RecognitionStatus".into()))?;
    match status {
        "Success" => Ok(json["DisplayText"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string()),
        "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => Ok(String::new()),
        other => Err(TranslationError::Recognition(other.to_string())),
    }
}

/// Extract the first translation from a Translator API response.
pub fn parse_translation(json: &serde_json::Value) -> Result<String, TranslationError> {
    json[0]["translations"][0]["text"]
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| TranslationError::Parse("missing translations[0].text".into()))
}

/// Decode little-endian 16-bit PCM; a trailing odd byte is ignored.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// A WAV header for an open-ended mono 16-bit stream.
fn streaming_wav_header(sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buf = Vec::new();
    hound::WavWriter::new(Cursor::new(&mut buf), spec)?.finalize()?;
    Ok(buf)
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, TranslationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TranslationError::Status {
        status: status.as_u16(),
        body,
    })
}

// ---------------------------------------------------------------------------
// AzureTranslator
// ---------------------------------------------------------------------------

/// Aborts the recognition request when the session is dropped, so a
/// cancelled `finalize` or an `abort` never leaves an upload running.
struct RecognitionTask(JoinHandle<Result<String, TranslationError>>);

impl Drop for RecognitionTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Session {
    source: String,
    target: String,
    upload: mpsc::Sender<UploadChunk>,
    recognition: RecognitionTask,
    started: Instant,
}

pub struct AzureTranslator {
    client: reqwest::Client,
    credentials: SpeechCredentials,
    voice: String,
    recognizer_rate: u32,
    push_retries: u32,
    request_timeout: Duration,
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl AzureTranslator {
    pub fn new(
        credentials: SpeechCredentials,
        voice: impl Into<String>,
        recognizer_rate: u32,
        push_retries: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            voice: voice.into(),
            recognizer_rate,
            push_retries,
            request_timeout,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recognition_url(&self, language: &str) -> String {
        format!(
            "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?language={}&format=simple",
            self.credentials.region, language
        )
    }

    fn synthesis_url(&self) -> String {
        format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            self.credentials.region
        )
    }

    async fn translate_text(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, TranslationError> {
        let from = language_prefix(source);
        if from.eq_ignore_ascii_case(language_prefix(target)) {
            return Ok(text.to_string());
        }
        let response = self
            .client
            .post(TRANSLATOR_URL)
            .query(&[("api-version", "3.0"), ("from", from), ("to", target)])
            .header("Ocp-Apim-Subscription-Key", &self.credentials.key)
            .header("Ocp-Apim-Subscription-Region", &self.credentials.region)
            .timeout(self.request_timeout)
            .json(&serde_json::json!([{ "Text": text }]))
            .send()
            .await?;
        let json: serde_json::Value = check(response)
            .await?
            .json()
            .await
            .map_err(|e| TranslationError::Parse(e.to_string()))?;
        parse_translation(&json)
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<i16>, TranslationError> {
        let response = self
            .client
            .post(self.synthesis_url())
            .header("Ocp-Apim-Subscription-Key", &self.credentials.key)
            .header(reqwest::header::CONTENT_TYPE, "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", SYNTHESIS_FORMAT)
            .header(reqwest::header::USER_AGENT, "ptt-translator")
            .timeout(self.request_timeout)
            .body(build_ssml(&self.voice, text))
            .send()
            .await?;
        let bytes = check(response).await?.bytes().await?;
        Ok(pcm_from_le_bytes(&bytes))
    }
}

#[async_trait]
impl SpeechTranslator for AzureTranslator {
    async fn start_session(
        &self,
        source: &str,
        target: &str,
    ) -> Result<SessionId, TranslationError> {
        let header = streaming_wav_header(self.recognizer_rate)
            .map_err(|e| TranslationError::Encoding(e.to_string()))?;
        let (upload, rx) = mpsc::channel::<UploadChunk>(UPLOAD_QUEUE);
        upload
            .try_send(Ok(header))
            .map_err(|e| TranslationError::Request(e.to_string()))?;

        let request = self
            .client
            .post(self.recognition_url(source))
            .header("Ocp-Apim-Subscription-Key", &self.credentials.key)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!(
                    "audio/wav; codecs=audio/pcm; samplerate={}",
                    self.recognizer_rate
                ),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));

        let handle = tokio::spawn(async move {
            let response = check(request.send().await?).await?;
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| TranslationError::Parse(e.to_string()))?;
            parse_recognition(&json)
        });

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions().insert(
            id,
            Session {
                source: source.to_string(),
                target: target.to_string(),
                upload,
                recognition: RecognitionTask(handle),
                started: Instant::now(),
            },
        );
        log::info!("translate: session={id} started {source}->{target}");
        Ok(id)
    }

    async fn push_audio(&self, session: SessionId, frame: &AudioFrame) {
        let upload = self.sessions().get(&session).map(|s| s.upload.clone());
        let Some(upload) = upload else {
            log::warn!("translate: push to unknown session={session}");
            return;
        };

        let mut chunk: UploadChunk = Ok(frame.to_le_bytes());
        for _ in 0..=self.push_retries {
            match upload.try_send(chunk) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    chunk = back;
                    tokio::time::sleep(PUSH_RETRY_DELAY).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::warn!("translate: session={session} upload closed, frame dropped");
                    return;
                }
            }
        }
        log::warn!(
            "translate: session={session} upload backlogged, dropped frame after {} retries",
            self.push_retries
        );
    }

    async fn finalize(&self, session: SessionId) -> Result<Translation, TranslationError> {
        let Session {
            source,
            target,
            upload,
            mut recognition,
            started,
        } = self
            .sessions()
            .remove(&session)
            .ok_or(TranslationError::UnknownSession(session))?;

        // Closing the channel ends the request body.
        drop(upload);
        let recognized = (&mut recognition.0)
            .await
            .map_err(|e| TranslationError::Request(format!("recognition task: {e}")))??;
        log::info!(
            "translate: session={session} recognized chars={} after_ms={}",
            recognized.chars().count(),
            started.elapsed().as_millis()
        );

        if recognized.is_empty() {
            return Ok(Translation {
                sample_rate: SYNTHESIS_SAMPLE_RATE,
                ..Translation::default()
            });
        }

        let translated = self.translate_text(&recognized, &source, &target).await?;
        let audio = if translated.is_empty() {
            Vec::new()
        } else {
            self.synthesize(&translated).await?
        };
        log::info!(
            "translate: session={session} synthesized samples={} total_ms={}",
            audio.len(),
            started.elapsed().as_millis()
        );

        Ok(Translation {
            recognized_text: recognized,
            translated_text: translated,
            audio,
            sample_rate: SYNTHESIS_SAMPLE_RATE,
        })
    }

    async fn abort(&self, session: SessionId) {
        if self.sessions().remove(&session).is_some() {
            log::info!("translate: session={session} aborted");
        }
    }
}
