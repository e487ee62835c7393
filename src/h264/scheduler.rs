//! Asynchronous key frame requests toward the remote peer.
//!
//! The depacketizer raises a flag when it suspects the decoder needs a key
//! frame (packet loss, or no key frame seen yet) and lowers it when an IDR,
//! SPS or PPS arrives. A background tokio task watches the flag and asks the
//! collaborator-supplied requesters for a key frame, subject to two
//! cool-downs:
//! - a grace period after the last key frame, during which the encoder may
//!   still send one on its own schedule;
//! - a minimum interval between two consecutive requests.
//!
//! State shared with the task lives behind one mutex. The task is woken by a
//! `Notify` whenever the flag changes and re-evaluates after every wake. It is
//! retired by bumping a generation counter, never by aborting it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::DepacketizerConfig;

/// Something able to ask the remote peer for a key frame (e.g. an RTCP PLI
/// sender). Implementations must not block.
pub trait KeyFrameRequester: Send + Sync {
    /// Returns `Ok(true)` if the request was sent.
    fn request_key_frame(&self) -> anyhow::Result<bool>;
}

/// Supplies the ordered list of requesters tried for each request.
pub trait KeyFrameControl: Send + Sync {
    fn key_frame_requesters(&self) -> Vec<Arc<dyn KeyFrameRequester>>;
}

impl KeyFrameControl for Vec<Arc<dyn KeyFrameRequester>> {
    fn key_frame_requesters(&self) -> Vec<Arc<dyn KeyFrameRequester>> {
        self.clone()
    }
}

/// Cool-down thresholds of the request loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTiming {
    /// Time after the last key frame before a request is considered due.
    pub key_frame_grace: Duration,
    /// Minimum spacing between two requests.
    pub min_request_interval: Duration,
}

impl RequestTiming {
    pub fn from_config(config: &DepacketizerConfig) -> Self {
        Self {
            key_frame_grace: config.key_frame_grace(),
            min_request_interval: config.min_request_interval(),
        }
    }
}

/// Key frame bookkeeping shared by the packet path and the request loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFrameState {
    pub request_key_frame: bool,
    pub last_key_frame: Option<Instant>,
    pub last_request: Option<Instant>,
}

/// What the request loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No key frame wanted; sleep until notified.
    Idle,
    /// A request is wanted but a cool-down is still running.
    Wait(Duration),
    Request,
}

/// Decide the next step of the request loop at `now`.
pub fn next_action(state: &KeyFrameState, timing: &RequestTiming, now: Instant) -> Action {
    if !state.request_key_frame {
        return Action::Idle;
    }

    // A key frame may still arrive through the normal encoder cadence.
    if let Some(last) = state.last_key_frame {
        let due = last + timing.key_frame_grace;
        if now < due {
            return Action::Wait(due - now);
        }
    }

    // Do not overwhelm the peer with requests.
    if let Some(last) = state.last_request {
        let allowed = last + timing.min_request_interval;
        if now < allowed {
            return Action::Wait(allowed - now);
        }
    }

    Action::Request
}

struct Inner {
    state: KeyFrameState,
    /// Liveness token of the request loop. A loop whose generation differs
    /// from this value must exit.
    generation: u64,
    closed: bool,
    task: Option<JoinHandle<()>>,
    control: Option<Arc<dyn KeyFrameControl>>,
    requests_sent: u64,
    warned_no_runtime: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    timing: RequestTiming,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns the key frame request flag and the background loop acting on it.
pub struct KeyFrameRequestScheduler {
    shared: Arc<Shared>,
    runtime: Option<Handle>,
}

impl KeyFrameRequestScheduler {
    /// Create a scheduler. The loop will be spawned on the tokio runtime
    /// current at this point, if any.
    pub fn new(timing: RequestTiming) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: KeyFrameState::default(),
                    generation: 0,
                    closed: false,
                    task: None,
                    control: None,
                    requests_sent: 0,
                    warned_no_runtime: false,
                }),
                wake: Notify::new(),
                timing,
            }),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Spawn the request loop on `handle` instead of the runtime captured at
    /// construction.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn timing(&self) -> RequestTiming {
        self.shared.timing
    }

    pub fn set_key_frame_control(&self, control: Option<Arc<dyn KeyFrameControl>>) {
        self.shared.lock().control = control;
    }

    /// Raise or lower the request flag. Raising it starts the loop if none
    /// is running; any change wakes the loop.
    pub fn set_request_key_frame(&self, request: bool) {
        self.update(|state| state.request_key_frame = request);
    }

    /// Apply `f` to the shared key frame state under the lock. If the request
    /// flag ends up raised the loop is started, and a change of the flag
    /// wakes it.
    pub fn update<R>(&self, f: impl FnOnce(&mut KeyFrameState) -> R) -> R {
        let mut inner = self.shared.lock();
        let before = inner.state.request_key_frame;
        let out = f(&mut inner.state);
        let after = inner.state.request_key_frame;
        if after {
            self.ensure_running(&mut inner);
        }
        drop(inner);
        if before != after {
            self.shared.wake.notify_one();
        }
        out
    }

    /// Note that a key frame was received at `now`.
    pub fn record_key_frame(&self, now: Instant) {
        self.shared.lock().state.last_key_frame = Some(now);
    }

    /// Ask for a key frame regardless of when the last one arrived.
    ///
    /// With `urgent` the minimum interval since the previous request is
    /// skipped as well. The request is accepted, not necessarily sent yet,
    /// so this always returns `true`.
    pub fn request_key_frame(&self, urgent: bool) -> bool {
        let mut inner = self.shared.lock();
        inner.state.last_key_frame = None;
        if urgent {
            inner.state.last_request = None;
        }
        inner.state.request_key_frame = true;
        self.ensure_running(&mut inner);
        drop(inner);
        self.shared.wake.notify_one();
        true
    }

    pub fn key_frame_requested(&self) -> bool {
        self.shared.lock().state.request_key_frame
    }

    pub fn last_key_frame(&self) -> Option<Instant> {
        self.shared.lock().state.last_key_frame
    }

    pub fn state(&self) -> KeyFrameState {
        self.shared.lock().state
    }

    /// Number of requests at least one requester reported as sent.
    pub fn requests_sent(&self) -> u64 {
        self.shared.lock().requests_sent
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().task.is_some()
    }

    /// Return to the initial state and retire any running loop.
    pub fn reset(&self) {
        self.retire(false);
    }

    /// Retire the loop and refuse to start a new one until `reset`.
    /// Safe to call repeatedly, and when no loop ever ran.
    pub fn stop(&self) {
        self.retire(true);
    }

    fn retire(&self, closed: bool) {
        let mut inner = self.shared.lock();
        inner.generation = inner.generation.wrapping_add(1);
        inner.closed = closed;
        inner.state = KeyFrameState::default();
        inner.requests_sent = 0;
        // Detach; the loop notices the new generation on its next wake.
        inner.task = None;
        drop(inner);
        self.shared.wake.notify_one();
    }

    fn ensure_running(&self, inner: &mut Inner) {
        if inner.closed {
            return;
        }
        // A loop that died without clearing its handle is replaced.
        if inner.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(runtime) = &self.runtime else {
            if !inner.warned_no_runtime {
                tracing::warn!("No tokio runtime available, key frame requests will not be sent");
                inner.warned_no_runtime = true;
            }
            return;
        };
        let generation = inner.generation;
        inner.task = Some(runtime.spawn(request_loop(self.shared.clone(), generation)));
    }
}

impl Drop for KeyFrameRequestScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn request_loop(shared: Arc<Shared>, generation: u64) {
    tracing::debug!("Key frame request loop started (generation {})", generation);

    loop {
        let (action, control) = {
            let inner = shared.lock();
            if inner.closed || inner.generation != generation {
                break;
            }
            (
                next_action(&inner.state, &shared.timing, Instant::now()),
                inner.control.clone(),
            )
        };

        match action {
            Action::Idle => shared.wake.notified().await,
            Action::Wait(timeout) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = time::sleep(timeout) => {}
                }
            }
            Action::Request => {
                let sent = control.is_some_and(|c| invoke_requesters(c.as_ref()));

                let mut inner = shared.lock();
                if inner.closed || inner.generation != generation {
                    break;
                }
                inner.state.last_request = Some(Instant::now());
                if sent {
                    inner.requests_sent += 1;
                }
            }
        }
    }

    let mut inner = shared.lock();
    if inner.generation == generation {
        inner.task = None;
    }
    tracing::debug!("Key frame request loop exited (generation {})", generation);
}

/// Try each requester in order until one reports success. A failing or
/// panicking requester does not keep the others from being tried.
fn invoke_requesters(control: &dyn KeyFrameControl) -> bool {
    for requester in control.key_frame_requesters() {
        match catch_unwind(AssertUnwindSafe(|| requester.request_key_frame())) {
            Ok(Ok(true)) => {
                tracing::debug!("Requested key frame from remote peer");
                return true;
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => tracing::warn!("Key frame requester failed: {:#}", e),
            Err(_) => tracing::warn!("Key frame requester panicked"),
        }
    }
    false
}
