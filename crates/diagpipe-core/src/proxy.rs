//! Diagnostic IPC proxy runner.
//!
//! A [`ConnectedProxy`] pumps bytes bidirectionally between one front-end
//! (target runtime) connection and one back-end (tooling) connection. The
//! [`ProxyRunner`] drives an unbounded accept loop over a
//! [`DiagnosticProxy`] transport: it races "accept the next pairing"
//! against the completion of every running pump, sweeps dead pairs out of
//! its tracking list (disposing them on detection), and applies a defined
//! recovery policy to connection-establishment failures:
//!
//! - back-end connect timeout with zero running proxies: the back end is
//!   presumed dead — `reset()` the transport so the next attempt can bind
//!   to a refreshed endpoint;
//! - front-end (runtime) connect timeout: no runtime is alive — terminate
//!   the runner when auto-shutdown is configured, otherwise keep looping;
//! - anything else: logged, loop continues.
//!
//! Consecutive failures back off exponentially with jitter so a dead peer
//! does not produce a hot loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::pipeline::StopToken;

/// A bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Boxed duplex connection handed over by transports.
pub type BoxedDuplex = Box<dyn Duplex>;

// =============================================================================
// Reconnect backoff
// =============================================================================

/// Exponential backoff with jitter between failed accept attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub backoff_factor: f64,
    /// Random jitter range as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retrying after `consecutive_failures` failures.
    #[must_use]
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + rand::rng().random_range(-self.jitter_percent..=self.jitter_percent);
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

// =============================================================================
// Connected proxy
// =============================================================================

/// One paired front-end/back-end connection with its pump task.
pub struct ConnectedProxy {
    id: u64,
    frontend: Option<BoxedDuplex>,
    backend: Option<BoxedDuplex>,
    is_running: Arc<AtomicBool>,
    completed: Arc<AtomicBool>,
    frontend_to_backend: Arc<AtomicU64>,
    backend_to_frontend: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectedProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedProxy")
            .field("id", &self.id)
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ConnectedProxy {
    /// Pair two connections; the pump starts only on [`Self::start`].
    #[must_use]
    pub fn new(id: u64, frontend: BoxedDuplex, backend: BoxedDuplex) -> Self {
        Self {
            id,
            frontend: Some(frontend),
            backend: Some(backend),
            is_running: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicBool::new(false)),
            frontend_to_backend: Arc::new(AtomicU64::new(0)),
            backend_to_frontend: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// Pairing identifier (for logs and completion notifications).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Spawn the bidirectional pump, notifying `completions` when it ends.
    pub fn start(&mut self, completions: mpsc::UnboundedSender<u64>) {
        let (Some(mut frontend), Some(mut backend)) = (self.frontend.take(), self.backend.take())
        else {
            return;
        };
        self.is_running.store(true, Ordering::Release);

        let id = self.id;
        let is_running = Arc::clone(&self.is_running);
        let completed = Arc::clone(&self.completed);
        let f2b = Arc::clone(&self.frontend_to_backend);
        let b2f = Arc::clone(&self.backend_to_frontend);
        self.task = Some(tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut frontend, &mut backend).await {
                Ok((to_backend, to_frontend)) => {
                    f2b.store(to_backend, Ordering::Release);
                    b2f.store(to_frontend, Ordering::Release);
                    info!(
                        proxy_id = id,
                        to_backend, to_frontend, "proxy pair completed"
                    );
                }
                Err(error) => {
                    debug!(proxy_id = id, %error, "proxy pump ended with error");
                }
            }
            is_running.store(false, Ordering::Release);
            completed.store(true, Ordering::Release);
            let _ = completions.send(id);
        }));
    }

    /// Whether the pump is currently moving bytes.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// A proxy is dead when it never ran, stopped running, or its task
    /// settled.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        !self.is_running() || self.completed.load(Ordering::Acquire)
    }

    /// Bytes moved in each direction (front-end to back-end, back-end to
    /// front-end), final values once the pump completed.
    #[must_use]
    pub fn bytes_transferred(&self) -> (u64, u64) {
        (
            self.frontend_to_backend.load(Ordering::Acquire),
            self.backend_to_frontend.load(Ordering::Acquire),
        )
    }

    /// Tear down the pair, aborting the pump if still running.
    pub async fn dispose(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        let (to_backend, to_frontend) = self.bytes_transferred();
        debug!(
            proxy_id = self.id,
            to_backend, to_frontend, "proxy pair disposed"
        );
    }
}

// =============================================================================
// Transport boundary
// =============================================================================

/// Abstract diagnostic proxy transport.
///
/// Concrete implementations accept a front-end connection, establish the
/// matching back-end connection, and hand back the wrapped pair.
pub trait DiagnosticProxy: Send + Sync + 'static {
    /// Bind/prepare the transport.
    fn start(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Accept the next front-end/back-end pairing.
    fn connect_proxy(
        &self,
        token: StopToken,
    ) -> impl std::future::Future<Output = std::result::Result<ConnectedProxy, ProxyError>> + Send;

    /// Refresh the transport's target endpoint after a presumed-dead back
    /// end.
    fn reset(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Release listeners and sockets.
    fn stop(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

// =============================================================================
// Runner
// =============================================================================

/// Runner policy knobs.
#[derive(Debug, Clone, Default)]
pub struct ProxyRunnerOptions {
    /// Terminate the runner when the runtime side times out (no runtime is
    /// alive to serve).
    pub auto_shutdown: bool,
    /// Backoff between failed accept attempts.
    pub reconnect: ReconnectPolicy,
}

/// Final runner statistics, reported on loop exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyRunnerStatus {
    /// Pairings accepted and started.
    pub accepted: u64,
    /// Pairings observed completed and swept.
    pub completed: u64,
    /// Accept attempts that failed.
    pub failed_accepts: u64,
}

/// Multiplexes many concurrent proxy pairs over one transport.
pub struct ProxyRunner<P: DiagnosticProxy> {
    proxy: P,
    options: ProxyRunnerOptions,
}

impl<P: DiagnosticProxy> ProxyRunner<P> {
    /// Create a runner over `proxy`.
    #[must_use]
    pub fn new(proxy: P, options: ProxyRunnerOptions) -> Self {
        Self { proxy, options }
    }

    /// The wrapped transport.
    #[must_use]
    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    /// Run the accept loop until `token` fires or auto-shutdown triggers.
    ///
    /// On auto-shutdown the front-end timeout is re-raised as the original
    /// error; every other exit path reports final statistics.
    pub async fn run(&self, token: StopToken) -> Result<ProxyRunnerStatus> {
        self.proxy.start().await?;

        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel::<u64>();
        let mut running: Vec<ConnectedProxy> = Vec::new();
        let mut status = ProxyRunnerStatus::default();
        let mut consecutive_failures: u32 = 0;

        let exit: Result<()> = loop {
            Self::sweep(&mut running, &mut status).await;

            // Race the accept against pump completions, re-sweeping each
            // time a running pair finishes, until the accept settles.
            let accepted = {
                let accept = self.proxy.connect_proxy(token.clone());
                tokio::pin!(accept);
                loop {
                    tokio::select! {
                        result = &mut accept => break result,
                        Some(id) = completions_rx.recv() => {
                            debug!(proxy_id = id, "proxy pair reported completion");
                            Self::sweep(&mut running, &mut status).await;
                        }
                        () = token.stopped() => break Err(ProxyError::Cancelled),
                    }
                }
            };

            match accepted {
                Ok(mut pair) => {
                    consecutive_failures = 0;
                    pair.start(completions_tx.clone());
                    info!(proxy_id = pair.id(), active = running.len() + 1, "proxy pair started");
                    running.push(pair);
                    status.accepted += 1;
                }
                Err(ProxyError::Cancelled) => break Ok(()),
                Err(error) => {
                    status.failed_accepts += 1;
                    consecutive_failures += 1;
                    match &error {
                        ProxyError::BackendTimeout { endpoint } if running.is_empty() => {
                            // No pair is alive to contradict it: the back
                            // end is presumed dead. Refresh the endpoint.
                            warn!(backend = %endpoint, "back-end timeout with no running proxies, resetting endpoint");
                            if let Err(reset_error) = self.proxy.reset().await {
                                warn!(%reset_error, "proxy reset failed");
                            }
                        }
                        ProxyError::FrontendTimeout { endpoint } => {
                            if self.options.auto_shutdown {
                                info!(frontend = %endpoint, "runtime timeout with auto-shutdown, terminating proxy");
                                break Err(error.into());
                            }
                            debug!(frontend = %endpoint, "runtime timeout, continuing to listen");
                        }
                        other => {
                            warn!(error = %other, "proxy accept failed, continuing");
                        }
                    }

                    let delay = self.options.reconnect.delay_for(consecutive_failures);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = token.stopped() => break Ok(()),
                    }
                }
            }
        };

        // Loop exit: tear down every tracked pair and the transport.
        for pair in running.drain(..) {
            status.completed += 1;
            pair.dispose().await;
        }
        if let Err(stop_error) = self.proxy.stop().await {
            warn!(%stop_error, "proxy transport stop failed");
        }
        info!(
            accepted = status.accepted,
            completed = status.completed,
            failed = status.failed_accepts,
            "proxy runner exited"
        );

        exit.map(|()| status)
    }

    /// Remove dead pairs from the tracking list, disposing each on
    /// detection so resources never accumulate.
    async fn sweep(running: &mut Vec<ConnectedProxy>, status: &mut ProxyRunnerStatus) {
        let mut index = 0;
        while index < running.len() {
            if running[index].is_dead() {
                let pair = running.swap_remove(index);
                status.completed += 1;
                pair.dispose().await;
            } else {
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StopSource;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn duplex_pair() -> (BoxedDuplex, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        (Box::new(a), b)
    }

    // -- ConnectedProxy --------------------------------------------------------

    #[tokio::test]
    async fn pump_moves_bytes_both_ways() {
        let (frontend, mut frontend_peer) = duplex_pair();
        let (backend, mut backend_peer) = duplex_pair();
        let mut pair = ConnectedProxy::new(1, frontend, backend);
        let (tx, mut rx) = mpsc::unbounded_channel();
        pair.start(tx);
        assert!(pair.is_running());

        frontend_peer.write_all(b"to-backend").await.unwrap();
        let mut buf = [0u8; 10];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-backend");

        backend_peer.write_all(b"to-frontend").await.unwrap();
        let mut buf = [0u8; 11];
        frontend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-frontend");

        // Closing both peers ends the pump.
        drop(frontend_peer);
        drop(backend_peer);
        let id = rx.recv().await.unwrap();
        assert_eq!(id, 1);
        assert!(pair.is_dead());
        assert_eq!(pair.bytes_transferred(), (10, 11));
        pair.dispose().await;
    }

    #[tokio::test]
    async fn unstarted_pair_is_dead() {
        let (frontend, _f) = duplex_pair();
        let (backend, _b) = duplex_pair();
        let pair = ConnectedProxy::new(7, frontend, backend);
        assert!(!pair.is_running());
        assert!(pair.is_dead());
        pair.dispose().await;
    }

    // -- ReconnectPolicy -------------------------------------------------------

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        // Capped at max_delay.
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_secs_f64();
            assert!((0.09..=0.11).contains(&delay), "{delay}");
        }
    }

    // -- Runner ----------------------------------------------------------------

    enum Scripted {
        Pair,
        BackendTimeout,
        FrontendTimeout,
        Fail,
        /// Park until the runner token fires.
        Wait,
    }

    struct ScriptedProxy {
        script: Mutex<VecDeque<Scripted>>,
        resets: AtomicUsize,
        stops: AtomicUsize,
        next_id: AtomicU64,
    }

    impl ScriptedProxy {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                resets: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }
        }
    }

    impl DiagnosticProxy for ScriptedProxy {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn connect_proxy(
            &self,
            token: StopToken,
        ) -> std::result::Result<ConnectedProxy, ProxyError> {
            let step = self.script.lock().expect("script lock").pop_front();
            match step {
                Some(Scripted::Pair) => {
                    let (frontend, _keep_f) = tokio::io::duplex(64);
                    let (backend, _keep_b) = tokio::io::duplex(64);
                    // Peers dropped: the pump completes immediately after
                    // start. Good enough for tracking-list tests.
                    Ok(ConnectedProxy::new(
                        self.next_id.fetch_add(1, Ordering::SeqCst),
                        Box::new(frontend),
                        Box::new(backend),
                    ))
                }
                Some(Scripted::BackendTimeout) => Err(ProxyError::BackendTimeout {
                    endpoint: "tcp:127.0.0.1:9000".to_string(),
                }),
                Some(Scripted::FrontendTimeout) => Err(ProxyError::FrontendTimeout {
                    endpoint: "unix:/tmp/app.sock".to_string(),
                }),
                Some(Scripted::Fail) => Err(ProxyError::Accept("scripted failure".to_string())),
                Some(Scripted::Wait) | None => {
                    token.stopped().await;
                    Err(ProxyError::Cancelled)
                }
            }
        }

        async fn reset(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_options(auto_shutdown: bool) -> ProxyRunnerOptions {
        ProxyRunnerOptions {
            auto_shutdown,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_factor: 1.0,
                jitter_percent: 0.0,
            },
        }
    }

    #[tokio::test]
    async fn backend_timeout_with_no_proxies_resets_once_then_pairs() {
        let runner = ProxyRunner::new(
            ScriptedProxy::new(vec![
                Scripted::BackendTimeout,
                Scripted::Pair,
                Scripted::Wait,
            ]),
            fast_options(false),
        );
        let stopper = StopSource::new();

        let (status, ()) = tokio::join!(runner.run(stopper.token()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
        });
        let status = status.unwrap();
        assert_eq!(runner.proxy().resets.load(Ordering::SeqCst), 1);
        assert_eq!(status.accepted, 1);
        assert_eq!(status.failed_accepts, 1);
        assert_eq!(runner.proxy().stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frontend_timeout_with_auto_shutdown_reraises_the_original_error() {
        let runner = ProxyRunner::new(
            ScriptedProxy::new(vec![Scripted::FrontendTimeout]),
            fast_options(true),
        );
        let err = runner.run(StopToken::never()).await.unwrap_err();
        match err {
            crate::error::Error::Proxy(ProxyError::FrontendTimeout { endpoint }) => {
                assert_eq!(endpoint, "unix:/tmp/app.sock");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Teardown still happened.
        assert_eq!(runner.proxy().stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frontend_timeout_without_auto_shutdown_keeps_looping() {
        let runner = ProxyRunner::new(
            ScriptedProxy::new(vec![
                Scripted::FrontendTimeout,
                Scripted::FrontendTimeout,
                Scripted::Pair,
                Scripted::Wait,
            ]),
            fast_options(false),
        );
        let stopper = StopSource::new();
        let (status, ()) = tokio::join!(runner.run(stopper.token()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
        });
        let status = status.unwrap();
        assert_eq!(status.accepted, 1);
        assert_eq!(status.failed_accepts, 2);
    }

    #[tokio::test]
    async fn arbitrary_accept_failures_do_not_end_the_loop() {
        let runner = ProxyRunner::new(
            ScriptedProxy::new(vec![Scripted::Fail, Scripted::Fail, Scripted::Wait]),
            fast_options(false),
        );
        let stopper = StopSource::new();
        let (status, ()) = tokio::join!(runner.run(stopper.token()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
        });
        let status = status.unwrap();
        assert_eq!(status.failed_accepts, 2);
        assert_eq!(status.accepted, 0);
        // No reset for non-backend-timeout failures.
        assert_eq!(runner.proxy().resets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completed_pairs_are_swept_and_disposed() {
        let runner = ProxyRunner::new(
            ScriptedProxy::new(vec![Scripted::Pair, Scripted::Pair, Scripted::Wait]),
            fast_options(false),
        );
        let stopper = StopSource::new();
        let (status, ()) = tokio::join!(runner.run(stopper.token()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.stop();
        });
        let status = status.unwrap();
        assert_eq!(status.accepted, 2);
        // Both pumps completed instantly (peers dropped) and were swept.
        assert_eq!(status.completed, 2);
    }

    #[tokio::test]
    async fn cancellation_before_any_accept_exits_cleanly() {
        let runner = ProxyRunner::new(
            ScriptedProxy::new(vec![Scripted::Wait]),
            fast_options(false),
        );
        let stopper = StopSource::new();
        stopper.stop();
        let status = runner.run(stopper.token()).await.unwrap();
        assert_eq!(status, ProxyRunnerStatus {
            accepted: 0,
            completed: 0,
            failed_accepts: 0,
        });
    }
}
