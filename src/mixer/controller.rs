//! [`MixerController`]: retrying connection and idempotent strip commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{MixerBackend, MixerError};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total login attempts, including the first.
    pub attempts: u32,
    /// Wait after the first failure; doubles after each further failure.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1` (1-based `attempt`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Last state the controller asked the mixer to put a strip in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripState {
    Muted,
    Unmuted,
}

impl From<bool> for StripState {
    fn from(muted: bool) -> Self {
        if muted {
            StripState::Muted
        } else {
            StripState::Unmuted
        }
    }
}

// ---------------------------------------------------------------------------
// MixerController
// ---------------------------------------------------------------------------

/// Shared handle to the external mixer.
///
/// The backend sits behind an async mutex, so at most one command is in
/// flight and mute/unmute pairs from different callers never interleave.
pub struct MixerController {
    backend: tokio::sync::Mutex<Box<dyn MixerBackend>>,
    connected: AtomicBool,
    commanded: Mutex<HashMap<usize, StripState>>,
    retry: RetryPolicy,
}

impl MixerController {
    pub fn new(backend: Box<dyn MixerBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend: tokio::sync::Mutex::new(backend),
            connected: AtomicBool::new(false),
            commanded: Mutex::new(HashMap::new()),
            retry,
        }
    }

    /// Log in, retrying with backoff.  Returns `false` once the budget is spent.
    pub async fn connect(&self) -> bool {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            let result = self.backend.lock().await.login().await;
            match result {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("mixer: connected attempt={attempt}");
                    return true;
                }
                Err(e) => {
                    log::warn!("mixer: connect attempt={attempt}/{attempts} failed: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        log::error!("mixer: giving up after {attempts} attempts");
        false
    }

    /// One login attempt, no backoff.  Used to leave degraded mode.
    pub async fn reconnect(&self) -> bool {
        match self.backend.lock().await.login().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                log::info!("mixer: reconnected");
                true
            }
            Err(e) => {
                log::warn!("mixer: reconnect failed: {e}");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Ask the mixer to answer.  A failure marks the controller disconnected.
    pub async fn verify(&self) -> Result<(), MixerError> {
        if !self.is_connected() {
            return Err(MixerError::NotConnected);
        }
        let result = self.backend.lock().await.check_alive().await;
        if let Err(e) = &result {
            self.connected.store(false, Ordering::SeqCst);
            log::warn!("mixer: liveness check failed, marking disconnected: {e}");
        }
        result
    }

    /// Command `Strip[strip].Mute`.
    ///
    /// The command is an absolute assignment and is always sent, so repeating
    /// it is harmless and corrects a mixer that drifted.  A failure marks the
    /// controller disconnected.
    ///
    /// `Ok` only means the command left this host.  The transport has no
    /// acknowledgement, so a mixer that died silently (ICMP filtered, remote
    /// host gone) still reports success here; use [`verify`](Self::verify)
    /// to confirm the mixer is listening.
    pub async fn set_strip_mute(&self, strip: usize, muted: bool) -> Result<(), MixerError> {
        self.send(&format!("Strip[{strip}].Mute"), muted).await?;
        self.commanded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(strip, StripState::from(muted));
        log::debug!("mixer: strip={strip} muted={muted}");
        Ok(())
    }

    /// Command `Strip[strip].<bus>` (e.g. `B1`) on or off.
    pub async fn route_to_bus(&self, strip: usize, bus: &str, on: bool) -> Result<(), MixerError> {
        self.send(&format!("Strip[{strip}].{bus}"), on).await?;
        log::debug!("mixer: strip={strip} bus={bus} on={on}");
        Ok(())
    }

    async fn send(&self, param: &str, on: bool) -> Result<(), MixerError> {
        if !self.is_connected() {
            return Err(MixerError::NotConnected);
        }
        let value = if on { 1.0 } else { 0.0 };
        let result = self.backend.lock().await.set_parameter(param, value).await;
        if let Err(e) = &result {
            self.connected.store(false, Ordering::SeqCst);
            log::warn!("mixer: {param} failed, marking disconnected: {e}");
        }
        result
    }

    /// Last commanded state of `strip`.  Informational only: the mixer may
    /// have been changed behind our back.
    pub fn commanded(&self, strip: usize) -> Option<StripState> {
        self.commanded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&strip)
            .copied()
    }

    pub async fn disconnect(&self) {
        self.backend.lock().await.logout().await;
        if self.connected.swap(false, Ordering::SeqCst) {
            log::info!("mixer: disconnected");
        }
    }
}

// ---------------------------------------------------------------------------
// MockMixerBackend  (test-only)
// ---------------------------------------------------------------------------

/// Observable state behind a [`MockMixerBackend`].
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMixerState {
    /// Current value of every parameter ever set.
    pub params: HashMap<String, f32>,
    /// Every successful `set_parameter`, in order.
    pub log: Vec<(String, f32)>,
    pub logins: u32,
    /// Logins that fail before one succeeds.
    pub login_failures_remaining: u32,
    /// Mixer unreachable: logins and commands all fail.
    pub offline: bool,
    /// Mixer stopped answering but datagrams still go out: logins and liveness checks
    /// fail, commands report success and are lost.
    pub unresponsive: bool,
}

#[cfg(test)]
impl MockMixerState {
    pub fn muted(&self, strip: usize) -> Option<bool> {
        self.params
            .get(&format!("Strip[{strip}].Mute"))
            .map(|v| *v != 0.0)
    }

    pub fn count(&self, param: &str) -> usize {
        self.log.iter().filter(|(p, _)| p == param).count()
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MockMixerBackend {
    pub state: std::sync::Arc<Mutex<MockMixerState>>,
    logged_in: bool,
}

#[cfg(test)]
impl MockMixerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> std::sync::Arc<Mutex<MockMixerState>> {
        std::sync::Arc::clone(&self.state)
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl MixerBackend for MockMixerBackend {
    async fn login(&mut self) -> Result<(), MixerError> {
        let mut s = self.state.lock().unwrap();
        s.logins += 1;
        if s.offline || s.unresponsive || s.login_failures_remaining > 0 {
            s.login_failures_remaining = s.login_failures_remaining.saturating_sub(1);
            self.logged_in = false;
            return Err(MixerError::NoResponse {
                addr: "mock".into(),
                timeout_ms: 0,
            });
        }
        self.logged_in = true;
        Ok(())
    }

    async fn set_parameter(&mut self, param: &str, value: f32) -> Result<(), MixerError> {
        let mut s = self.state.lock().unwrap();
        if s.offline {
            self.logged_in = false;
            return Err(MixerError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        if !self.logged_in {
            return Err(MixerError::NotConnected);
        }
        if s.unresponsive {
            return Ok(());
        }
        s.params.insert(param.to_string(), value);
        s.log.push((param.to_string(), value));
        Ok(())
    }

    async fn check_alive(&mut self) -> Result<(), MixerError> {
        let s = self.state.lock().unwrap();
        if !self.logged_in {
            return Err(MixerError::NotConnected);
        }
        if s.offline || s.unresponsive {
            self.logged_in = false;
            return Err(MixerError::NoResponse {
                addr: "mock".into(),
                timeout_ms: 0,
            });
        }
        Ok(())
    }

    async fn logout(&mut self) {
        self.logged_in = false;
    }
}
