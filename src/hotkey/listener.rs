//! [`PttHandler`]: raw key edges in, debounced press/release callbacks out.
//!
//! # Shutdown caveat
//!
//! `rdev::listen` has **no graceful shutdown API**.  [`RdevSource::unhook`]
//! removes the subscription so no further edges are forwarded, but the shared
//! listener thread stays blocked in the OS event loop until the process exits.
//! rdev holds no resources that need explicit cleanup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::debounce::Debouncer;
use super::{InputHookError, PttEvent};

/// How long `rdev::listen` gets to report a hook failure before it is
/// assumed to be running.
const HOOK_STARTUP_WAIT: Duration = Duration::from_millis(150);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// KeySource
// ---------------------------------------------------------------------------

/// Raw, undebounced key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEdge {
    Down,
    Up,
}

/// Receives raw edges.  Called on the input thread, so it must not block.
pub type KeySink = Arc<dyn Fn(KeyEdge) + Send + Sync>;

/// A source of raw key edges for one key.
pub trait KeySource: Send {
    /// Start forwarding edges of `key` to `sink`.
    fn hook(&mut self, key: rdev::Key, sink: KeySink) -> Result<(), InputHookError>;
    /// Stop forwarding.  Safe to call when not hooked.
    fn unhook(&mut self);
}

// ---------------------------------------------------------------------------
// RdevSource
// ---------------------------------------------------------------------------

struct Subscriber {
    id: u64,
    key: rdev::Key,
    sink: KeySink,
}

enum ListenState {
    NotStarted,
    Running,
    Failed(String),
}

/// Process-wide fan-out over the single `rdev::listen` thread.
struct Hub {
    subscribers: Mutex<Vec<Subscriber>>,
    state: Mutex<ListenState>,
    next_id: AtomicU64,
}

static HUB: OnceLock<Hub> = OnceLock::new();

fn hub() -> &'static Hub {
    HUB.get_or_init(|| Hub {
        subscribers: Mutex::new(Vec::new()),
        state: Mutex::new(ListenState::NotStarted),
        next_id: AtomicU64::new(1),
    })
}

impl Hub {
    fn dispatch(&self, key: rdev::Key, edge: KeyEdge) {
        for sub in lock(&self.subscribers).iter() {
            if sub.key == key {
                (sub.sink)(edge);
            }
        }
    }

    fn ensure_listening(&'static self) -> Result<(), InputHookError> {
        let mut state = lock(&self.state);
        match &*state {
            ListenState::Running => return Ok(()),
            ListenState::Failed(reason) => return Err(InputHookError::Hook(reason.clone())),
            ListenState::NotStarted => {}
        }

        let (err_tx, err_rx) = std_mpsc::channel::<String>();
        std::thread::Builder::new()
            .name("ptt-listener".into())
            .spawn(move || {
                let result = rdev::listen(move |event| match event.event_type {
                    rdev::EventType::KeyPress(k) => self.dispatch(k, KeyEdge::Down),
                    rdev::EventType::KeyRelease(k) => self.dispatch(k, KeyEdge::Up),
                    _ => {}
                });
                let reason = match result {
                    Ok(()) => "listener exited".to_string(),
                    Err(e) => format!("{e:?}"),
                };
                log::error!("ptt: rdev::listen stopped: {reason}");
                let _ = err_tx.send(reason);
            })
            .map_err(|e| InputHookError::Thread {
                name: "ptt-listener",
                reason: e.to_string(),
            })?;

        match err_rx.recv_timeout(HOOK_STARTUP_WAIT) {
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                *state = ListenState::Running;
                Ok(())
            }
            Ok(reason) => {
                *state = ListenState::Failed(reason.clone());
                Err(InputHookError::Hook(reason))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let reason = "listener thread exited".to_string();
                *state = ListenState::Failed(reason.clone());
                Err(InputHookError::Hook(reason))
            }
        }
    }
}

/// Production [`KeySource`] on top of the shared `rdev::listen` thread.
#[derive(Default)]
pub struct RdevSource {
    id: Option<u64>,
}

impl RdevSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeySource for RdevSource {
    fn hook(&mut self, key: rdev::Key, sink: KeySink) -> Result<(), InputHookError> {
        self.unhook();
        let hub = hub();
        hub.ensure_listening()?;
        let id = hub.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&hub.subscribers).push(Subscriber { id, key, sink });
        self.id = Some(id);
        Ok(())
    }

    fn unhook(&mut self) {
        if let Some(id) = self.id.take() {
            lock(&hub().subscribers).retain(|s| s.id != id);
        }
    }
}

// ---------------------------------------------------------------------------
// PttHandler
// ---------------------------------------------------------------------------

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    press: Option<Callback>,
    release: Option<Callback>,
}

enum WorkerMsg {
    Edge(KeyEdge, Instant),
    Shutdown,
}

struct Worker {
    tx: std_mpsc::Sender<WorkerMsg>,
    thread: JoinHandle<()>,
}

/// Debounced push-to-talk on a single key.
///
/// Callbacks run on the handler's worker thread, never on the OS input
/// thread, and at most once per physical gesture.
pub struct PttHandler {
    key: rdev::Key,
    source: Box<dyn KeySource>,
    debouncer: Arc<Mutex<Debouncer>>,
    callbacks: Arc<Mutex<Callbacks>>,
    worker: Option<Worker>,
}

impl PttHandler {
    /// Handler backed by the global `rdev` hook.
    pub fn new(key: rdev::Key, debounce: Duration) -> Self {
        Self::with_source(key, debounce, Box::new(RdevSource::new()))
    }

    pub fn with_source(key: rdev::Key, debounce: Duration, source: Box<dyn KeySource>) -> Self {
        Self {
            key,
            source,
            debouncer: Arc::new(Mutex::new(Debouncer::new(debounce))),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            worker: None,
        }
    }

    pub fn on_press<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.callbacks).press = Some(Arc::new(callback));
    }

    pub fn on_release<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.callbacks).release = Some(Arc::new(callback));
    }

    /// Hook the key and start delivering callbacks.
    ///
    /// Fails fast when the OS refuses the hook; this is not retried.
    pub fn start(&mut self) -> Result<(), InputHookError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = std_mpsc::channel::<WorkerMsg>();
        let debouncer = Arc::clone(&self.debouncer);
        let callbacks = Arc::clone(&self.callbacks);
        let thread = std::thread::Builder::new()
            .name("ptt-worker".into())
            .spawn(move || worker_loop(rx, debouncer, callbacks))
            .map_err(|e| InputHookError::Thread {
                name: "ptt-worker",
                reason: e.to_string(),
            })?;
        let worker = Worker { tx, thread };

        let edge_tx = Mutex::new(worker.tx.clone());
        let sink: KeySink = Arc::new(move |edge| {
            let _ = lock(&edge_tx).send(WorkerMsg::Edge(edge, Instant::now()));
        });

        if let Err(e) = self.source.hook(self.key, sink) {
            shutdown_worker(worker);
            return Err(e);
        }
        log::info!("ptt: listening key={:?}", self.key);
        self.worker = Some(worker);
        Ok(())
    }

    /// Unhook the key, stop the worker and forget any held state.
    ///
    /// A gesture in progress ends without a release callback.
    pub fn stop(&mut self) {
        self.source.unhook();
        if let Some(worker) = self.worker.take() {
            shutdown_worker(worker);
            log::info!("ptt: stopped key={:?}", self.key);
        }
        lock(&self.debouncer).reset();
    }

    /// `true` while a press has been accepted and its release not yet fired.
    pub fn is_pressed(&self) -> bool {
        lock(&self.debouncer).is_down()
    }
}

impl Drop for PttHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn shutdown_worker(worker: Worker) {
    let _ = worker.tx.send(WorkerMsg::Shutdown);
    if worker.thread.join().is_err() {
        log::error!("ptt: worker thread panicked");
    }
}

fn worker_loop(
    rx: std_mpsc::Receiver<WorkerMsg>,
    debouncer: Arc<Mutex<Debouncer>>,
    callbacks: Arc<Mutex<Callbacks>>,
) {
    loop {
        let deadline = lock(&debouncer).next_deadline();
        let msg = match deadline {
            Some(deadline) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(msg) => Some(msg),
                    Err(std_mpsc::RecvTimeoutError::Timeout) => None,
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            },
        };

        // Decide under the lock, fire outside it.
        let fired: Vec<PttEvent> = {
            let mut d = lock(&debouncer);
            match msg {
                Some(WorkerMsg::Shutdown) => return,
                Some(WorkerMsg::Edge(edge, at)) => {
                    let mut fired: Vec<PttEvent> = d.poll(at).into_iter().collect();
                    let next = match edge {
                        KeyEdge::Down => d.key_down(at),
                        KeyEdge::Up => d.key_up(at),
                    };
                    fired.extend(next);
                    fired
                }
                None => d.poll(Instant::now()).into_iter().collect(),
            }
        };

        for event in fired {
            log::debug!("ptt: {event:?}");
            let callback = {
                let cbs = lock(&callbacks);
                match event {
                    PttEvent::Pressed => cbs.press.clone(),
                    PttEvent::Released => cbs.release.clone(),
                }
            };
            if let Some(cb) = callback {
                cb();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ManualKeySource  (test-only)
// ---------------------------------------------------------------------------

/// Test [`KeySource`] whose edges are injected by hand.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct ManualKeySource {
    sink: Arc<Mutex<Option<KeySink>>>,
    refuse: bool,
}

#[cfg(test)]
impl ManualKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `hook` fails as if permission was denied.
    pub fn refusing() -> Self {
        Self {
            sink: Arc::default(),
            refuse: true,
        }
    }

    pub fn down(&self) {
        self.send(KeyEdge::Down);
    }

    pub fn up(&self) {
        self.send(KeyEdge::Up);
    }

    pub fn is_hooked(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    fn send(&self, edge: KeyEdge) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(edge);
        }
    }
}

#[cfg(test)]
impl KeySource for ManualKeySource {
    fn hook(&mut self, _key: rdev::Key, sink: KeySink) -> Result<(), InputHookError> {
        if self.refuse {
            return Err(InputHookError::Hook("permission denied".into()));
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn unhook(&mut self) {
        *self.sink.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(30);
    const SETTLE: Duration = Duration::from_millis(150);

    fn handler(keys: &ManualKeySource) -> (PttHandler, std_mpsc::Receiver<PttEvent>) {
        let (tx, rx) = std_mpsc::channel();
        let mut ptt = PttHandler::with_source(rdev::Key::F8, DEBOUNCE, Box::new(keys.clone()));
        let press_tx = Mutex::new(tx.clone());
        ptt.on_press(move || {
            let _ = press_tx.lock().unwrap().send(PttEvent::Pressed);
        });
        let release_tx = Mutex::new(tx);
        ptt.on_release(move || {
            let _ = release_tx.lock().unwrap().send(PttEvent::Released);
        });
        (ptt, rx)
    }

    fn drain(rx: &std_mpsc::Receiver<PttEvent>) -> Vec<PttEvent> {
        std::thread::sleep(SETTLE);
        rx.try_iter().collect()
    }

    #[test]
    fn held_key_with_auto_repeat_fires_once_each_way() {
        let keys = ManualKeySource::new();
        let (mut ptt, rx) = handler(&keys);
        ptt.start().unwrap();

        keys.down();
        for _ in 0..10 {
            keys.down();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(ptt.is_pressed());
        keys.up();

        assert_eq!(drain(&rx), vec![PttEvent::Pressed, PttEvent::Released]);
        assert!(!ptt.is_pressed());
    }

    #[test]
    fn release_flutter_does_not_split_gesture() {
        let keys = ManualKeySource::new();
        let (mut ptt, rx) = handler(&keys);
        ptt.start().unwrap();

        keys.down();
        keys.up();
        keys.down();
        keys.up();
        keys.down();
        std::thread::sleep(Duration::from_millis(80));
        keys.up();

        assert_eq!(drain(&rx), vec![PttEvent::Pressed, PttEvent::Released]);
    }

    #[test]
    fn stop_unhooks_and_resets() {
        let keys = ManualKeySource::new();
        let (mut ptt, rx) = handler(&keys);
        ptt.start().unwrap();
        assert!(keys.is_hooked());

        keys.down();
        std::thread::sleep(Duration::from_millis(20));
        ptt.stop();
        assert!(!keys.is_hooked());
        assert!(!ptt.is_pressed());

        // edges after stop go nowhere
        keys.up();
        assert_eq!(drain(&rx), vec![PttEvent::Pressed]);
    }

    #[test]
    fn refused_hook_fails_fast() {
        let keys = ManualKeySource::refusing();
        let (mut ptt, _rx) = handler(&keys);
        let err = ptt.start().unwrap_err();
        assert!(matches!(err, InputHookError::Hook(_)));
        // a failed start leaves the handler restartable
        assert!(ptt.worker.is_none());
    }

    #[test]
    fn start_twice_is_harmless() {
        let keys = ManualKeySource::new();
        let (mut ptt, rx) = handler(&keys);
        ptt.start().unwrap();
        ptt.start().unwrap();
        keys.down();
        keys.up();
        assert_eq!(drain(&rx), vec![PttEvent::Pressed, PttEvent::Released]);
    }
}
