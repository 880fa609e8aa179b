//! Generic pipeline lifecycle.
//!
//! A [`Pipeline`] is a long-lived unit of work with an explicit
//! start/stop/cleanup lifecycle and idempotent teardown. The state machine
//! itself is fixed; behavior plugs in through the three [`PipelineHooks`]
//! operations:
//!
//! - `on_run`: the long-running body, observing a [`StopToken`]
//!   cooperatively;
//! - `on_stop`: reaction to an explicit stop request (graceful: the body is
//!   expected to drain and complete normally);
//! - `on_cleanup`: resource release, guaranteed to execute exactly once no
//!   matter how the run ended or how many times the pipeline is disposed.
//!
//! ```text
//! Created ──run──► Running ──stop──► StopRequested ──► Stopped
//!     │                │                                  │
//!     └────────────────┴──────────dispose────────────────►└──► Disposed
//! ```
//!
//! Concurrent `run` calls share one run: the second call returns a handle
//! to the already-running body instead of starting it twice. Explicit stop
//! is distinct from cancellation: stop invokes `on_stop` and lets the body
//! finish; cancelling the token passed to `run` (or disposing) fires the
//! body's stop token and the run reports [`PipelineError::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, OnceCell};
use tracing::debug;

use crate::error::{Error, PipelineError, Result};

/// Boxed future alias used at dyn trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// Stop signaling
// =============================================================================

/// Owning side of a stop signal.
///
/// The watch-channel shutdown pattern: one sender flips a boolean, any
/// number of [`StopToken`] clones observe it.
#[derive(Debug)]
pub struct StopSource {
    tx: Arc<watch::Sender<bool>>,
    /// Keeps the channel open while the source is alive, so a linked
    /// forwarder does not observe "all receivers gone" before the first
    /// token is handed out.
    _rx: watch::Receiver<bool>,
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSource {
    /// Create an un-signaled stop source.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            _rx: rx,
        }
    }

    /// Create a source that also fires when `parent` fires.
    ///
    /// Stopping the child never affects the parent. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn linked_to(parent: &StopToken) -> Self {
        let source = Self::new();
        if parent.is_stopped() {
            // Propagate synchronously so a child token observed right after
            // creation already reads as stopped.
            source.stop();
            return source;
        }
        let tx = Arc::clone(&source.tx);
        let parent = parent.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = parent.stopped() => {
                    let _ = tx.send(true);
                }
                () = tx.closed() => {}
            }
        });
        source
    }

    /// Obtain a token observing this source.
    #[must_use]
    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal stop to every token.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observing side of a stop signal.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    /// Whether stop has been signaled.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until stop is signaled.
    ///
    /// If the source is dropped without signaling, the stop can never
    /// arrive and this pends forever.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// The three overridable operations of a pipeline.
///
/// Implementations use interior mutability for any state shared between the
/// operations; the wrapper invokes them through a shared reference.
pub trait PipelineHooks: Send + Sync + 'static {
    /// Long-running body. Must observe `stop` cooperatively and return
    /// [`Error::Cancelled`] when ended by it.
    fn on_run<'a>(&'a self, stop: StopToken) -> BoxFuture<'a, Result<()>>;

    /// React to an explicit stop request. The default does nothing; session
    /// pipelines use this to stop the underlying session so the body drains
    /// and completes normally.
    fn on_stop<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Release owned resources. Invoked exactly once.
    fn on_cleanup<'a>(&'a self) -> BoxFuture<'a, ()>;
}

// =============================================================================
// State machine
// =============================================================================

/// Externally observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
    Disposed = 4,
}

impl PipelineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::StopRequested,
            3 => Self::Stopped,
            _ => Self::Disposed,
        }
    }
}

/// Cloneable run/stop outcome broadcast to shared handles.
type Outcome = std::result::Result<(), PipelineError>;

struct Channels {
    /// Stop source wired to the running body's token.
    stop_source: Option<StopSource>,
    /// Broadcasts the run outcome; `None` until the body finishes.
    run_rx: Option<watch::Receiver<Option<Outcome>>>,
    /// Broadcasts the explicit-stop outcome.
    stop_rx: Option<watch::Receiver<Option<Outcome>>>,
}

struct Shared<H: PipelineHooks> {
    hooks: Arc<H>,
    state: AtomicU8,
    channels: Mutex<Channels>,
    cleanup: OnceCell<()>,
}

impl<H: PipelineHooks> Shared<H> {
    async fn run_cleanup(&self) {
        self.cleanup
            .get_or_init(|| async {
                self.hooks.on_cleanup().await;
            })
            .await;
    }
}

/// Lifecycle wrapper around a [`PipelineHooks`] implementation.
pub struct Pipeline<H: PipelineHooks> {
    shared: Arc<Shared<H>>,
}

impl<H: PipelineHooks> std::fmt::Debug for Pipeline<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<H: PipelineHooks> Pipeline<H> {
    /// Wrap `hooks` in a fresh pipeline in the `Created` state.
    #[must_use]
    pub fn new(hooks: H) -> Self {
        Self {
            shared: Arc::new(Shared {
                hooks: Arc::new(hooks),
                state: AtomicU8::new(PipelineState::Created as u8),
                channels: Mutex::new(Channels {
                    stop_source: None,
                    run_rx: None,
                    stop_rx: None,
                }),
                cleanup: OnceCell::new(),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Access the hook implementation (shared).
    #[must_use]
    pub fn hooks(&self) -> Arc<H> {
        Arc::clone(&self.shared.hooks)
    }

    /// Start the body, or join the already-running body.
    ///
    /// The first call transitions `Created -> Running` and spawns `on_run`
    /// under a stop token linked to `token`; subsequent calls return a
    /// handle to the same run rather than starting a second one. The
    /// returned future resolves with the body's outcome.
    pub async fn run(&self, token: StopToken) -> Result<()> {
        let run_rx = {
            let mut channels = self.shared.channels.lock().expect("pipeline lock");
            match self.state() {
                PipelineState::Disposed => return Err(PipelineError::Disposed.into()),
                PipelineState::Created => {
                    let source = StopSource::linked_to(&token);
                    let body_token = source.token();
                    let (done_tx, done_rx) = watch::channel(None);
                    channels.stop_source = Some(source);
                    channels.run_rx = Some(done_rx.clone());
                    self.shared
                        .state
                        .store(PipelineState::Running as u8, Ordering::Release);

                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let outcome = match shared.hooks.on_run(body_token).await {
                            Ok(()) => Ok(()),
                            Err(Error::Cancelled(_)) => Err(PipelineError::Cancelled),
                            Err(Error::Pipeline(e)) => Err(e),
                            Err(other) => Err(PipelineError::Faulted(other.to_string())),
                        };
                        // Never overwrite Disposed.
                        for live in [PipelineState::Running, PipelineState::StopRequested] {
                            if shared
                                .state
                                .compare_exchange(
                                    live as u8,
                                    PipelineState::Stopped as u8,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                            {
                                break;
                            }
                        }
                        let _ = done_tx.send(Some(outcome));
                        // Completion schedules teardown; dispose remains a
                        // no-op for cleanup afterwards.
                        shared.run_cleanup().await;
                    });
                    done_rx
                }
                _ => channels
                    .run_rx
                    .clone()
                    .expect("running pipeline has a run channel"),
            }
        };

        Self::wait_outcome(run_rx).await
    }

    /// Request a graceful stop and wait for the body to finish.
    ///
    /// Fails with [`PipelineError::NotStarted`] when the pipeline was never
    /// run. Concurrent callers share one stop operation and observe the
    /// same outcome. If `token` fires before the stop completes, the wait
    /// surfaces cancellation (the stop itself keeps going).
    pub async fn stop(&self, token: StopToken) -> Result<()> {
        let stop_rx = {
            let mut channels = self.shared.channels.lock().expect("pipeline lock");
            match self.state() {
                PipelineState::Created => return Err(PipelineError::NotStarted.into()),
                PipelineState::Disposed => return Err(PipelineError::Disposed.into()),
                PipelineState::Stopped => return Ok(()),
                PipelineState::Running => {
                    let (stop_tx, stop_rx) = watch::channel(None);
                    channels.stop_rx = Some(stop_rx.clone());
                    self.shared
                        .state
                        .store(PipelineState::StopRequested as u8, Ordering::Release);

                    let run_rx = channels
                        .run_rx
                        .clone()
                        .expect("running pipeline has a run channel");
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        let outcome = match shared.hooks.on_stop().await {
                            Ok(()) => Self::wait_outcome_raw(run_rx).await,
                            Err(e) => Err(PipelineError::Faulted(e.to_string())),
                        };
                        let _ = stop_tx.send(Some(outcome));
                    });
                    stop_rx
                }
                PipelineState::StopRequested => channels
                    .stop_rx
                    .clone()
                    .expect("stop-requested pipeline has a stop channel"),
            }
        };

        tokio::select! {
            outcome = Self::wait_outcome(stop_rx) => outcome,
            () = token.stopped() => {
                Err(Error::Cancelled("stop wait cancelled".to_string()))
            }
        }
    }

    /// Dispose the pipeline: cancel any in-flight run, wait for it to
    /// settle, and execute cleanup.
    ///
    /// Idempotent; cleanup runs exactly once across any number of calls and
    /// regardless of how the run ended.
    pub async fn dispose(&self) {
        let run_rx = {
            let channels = self.shared.channels.lock().expect("pipeline lock");
            let previous = self.state();
            self.shared
                .state
                .store(PipelineState::Disposed as u8, Ordering::Release);
            if let Some(source) = &channels.stop_source {
                source.stop();
            }
            match previous {
                PipelineState::Running | PipelineState::StopRequested => channels.run_rx.clone(),
                _ => None,
            }
        };

        if let Some(rx) = run_rx {
            let _ = Self::wait_outcome_raw(rx).await;
        }
        self.shared.run_cleanup().await;
        debug!("pipeline disposed");
    }

    async fn wait_outcome(rx: watch::Receiver<Option<Outcome>>) -> Result<()> {
        Self::wait_outcome_raw(rx).await.map_err(Error::from)
    }

    async fn wait_outcome_raw(
        mut rx: watch::Receiver<Option<Outcome>>,
    ) -> std::result::Result<(), PipelineError> {
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|guard| guard.clone().expect("checked above"));
        match outcome {
            Ok(outcome) => outcome,
            // Sender dropped without broadcasting: the runtime is tearing
            // down; report cancellation rather than panic.
            Err(_) => Err(PipelineError::Cancelled),
        }
    }
}
