//! Generic event-source pipeline.
//!
//! [`EventSourcePipeline`] owns a diagnostic session against a target
//! process and runs a handler coroutine once the session's event source is
//! live. It supplies the three lifecycle hooks to [`Pipeline`]:
//!
//! - `on_run` lazily opens the session, then drives the handler under the
//!   run's stop token;
//! - `on_stop` stops the underlying session (flushing buffered events) so
//!   the handler's drain wait completes and the body finishes normally;
//! - `on_cleanup` releases the session iff one was actually opened.
//!
//! Handlers represent "callback fired" as awaitable [`EventWaiter`]s from
//! the session's [`EventSource`], so multiple event waits compose with
//! `tokio::select!` / `tokio::join!`.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::event_source::{
    DiagnosticSession, DiagnosticSessionProvider, EventSource, SessionControl, SessionSpec,
};
use crate::pipeline::{BoxFuture, Pipeline, PipelineHooks, StopToken};

/// Lazily populated session state, shared between the run body, the stop
/// hook, and cleanup.
#[derive(Default)]
pub struct SessionSlot {
    control: Mutex<Option<Box<dyn SessionControl>>>,
    raw: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl SessionSlot {
    fn store(&self, session: DiagnosticSession) -> EventSource {
        let DiagnosticSession {
            control,
            source,
            raw,
        } = session;
        *self.control.lock().expect("session lock") = Some(control);
        *self.raw.lock().expect("session lock") = raw;
        source
    }

    /// Stop the session if it is still running.
    ///
    /// Safe to call repeatedly; only the first call reaches the session.
    async fn stop_session(&self) -> Result<()> {
        let control = self.control.lock().expect("session lock").take();
        match control {
            Some(mut control) => control.stop().await,
            None => Ok(()),
        }
    }

    /// Release whatever was created.
    fn release(&self) {
        self.control.lock().expect("session lock").take();
        self.raw.lock().expect("session lock").take();
    }

    /// Take the raw byte stream, if the provider exposed one.
    pub fn take_raw(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.raw.lock().expect("session lock").take()
    }
}

/// Handler context: the live event source plus session stop access.
#[derive(Clone)]
pub struct SessionContext {
    source: EventSource,
    slot: Arc<SessionSlot>,
}

impl SessionContext {
    /// The session's event source.
    #[must_use]
    pub fn source(&self) -> &EventSource {
        &self.source
    }

    /// Stop the underlying session, flushing buffered events.
    ///
    /// The source's `completed` signal fires once the flush has drained.
    pub async fn stop_session(&self) -> Result<()> {
        self.slot.stop_session().await
    }

    /// Take the session's raw byte stream, if any.
    #[must_use]
    pub fn take_raw(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.slot.take_raw()
    }
}

/// Per-pipeline behavior plugged into [`EventSourcePipeline`].
pub trait EventPipelineHandler: Send + Sync + 'static {
    /// Provider subscriptions this pipeline needs.
    fn session_spec(&self) -> SessionSpec;

    /// Body invoked once the event source is live.
    ///
    /// Implementations register event interest on `ctx.source()`, stop the
    /// session via `ctx.stop_session()` when enough signal has been
    /// gathered, then await `ctx.source().completed()` before returning.
    fn on_event_source_available<'a>(
        &'a self,
        ctx: SessionContext,
        stop: StopToken,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Pipeline hooks wrapping a diagnostic session and an event handler.
pub struct EventSourcePipeline<H: EventPipelineHandler> {
    provider: Arc<dyn DiagnosticSessionProvider>,
    handler: H,
    slot: Arc<SessionSlot>,
}

impl<H: EventPipelineHandler> EventSourcePipeline<H> {
    /// Create the hooks; wrap with [`Pipeline::new`] to get the lifecycle.
    #[must_use]
    pub fn new(provider: Arc<dyn DiagnosticSessionProvider>, handler: H) -> Self {
        Self {
            provider,
            handler,
            slot: Arc::new(SessionSlot::default()),
        }
    }

    /// Convenience: wrap into a [`Pipeline`].
    #[must_use]
    pub fn into_pipeline(self) -> Pipeline<Self> {
        Pipeline::new(self)
    }

    /// The handler (for result extraction after the run).
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: EventPipelineHandler> PipelineHooks for EventSourcePipeline<H> {
    fn on_run<'a>(&'a self, stop: StopToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if stop.is_stopped() {
                return Err(Error::Cancelled("pipeline cancelled before start".into()));
            }

            let spec = self.handler.session_spec();
            let session = self.provider.start_session(&spec).await?;
            let source = self.slot.store(session);
            let ctx = SessionContext {
                source,
                slot: Arc::clone(&self.slot),
            };

            tokio::select! {
                result = self.handler.on_event_source_available(ctx, stop.clone()) => result,
                () = stop.stopped() => Err(Error::Cancelled("pipeline run cancelled".into())),
            }
        })
    }

    fn on_stop<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.slot.stop_session().await })
    }

    fn on_cleanup<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // No-op when the session was never opened.
            self.slot.release();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::event_source::ProviderConfig;
    use crate::events::EventRecord;
    use crate::pipeline::StopSource;
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake session provider: hands out an EventSource and completes it
    /// when the session is stopped.
    struct FakeProvider {
        started: AtomicUsize,
        last_source: Mutex<Option<EventSource>>,
    }

    impl FakeProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                last_source: Mutex::new(None),
            })
        }

        /// Spin until a session is open, then return its source.
        async fn live_source(&self) -> EventSource {
            loop {
                if let Some(source) = self.last_source.lock().expect("lock").clone() {
                    return source;
                }
                tokio::task::yield_now().await;
            }
        }
    }

    struct FakeControl {
        source: EventSource,
    }

    impl SessionControl for FakeControl {
        fn stop<'a>(&'a mut self) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.source.complete();
                Ok(())
            })
        }
    }

    impl DiagnosticSessionProvider for FakeProvider {
        fn start_session<'a>(
            &'a self,
            _spec: &'a SessionSpec,
        ) -> BoxFuture<'a, Result<DiagnosticSession>> {
            Box::pin(async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                let source = EventSource::new();
                *self.last_source.lock().expect("lock") = Some(source.clone());
                Ok(DiagnosticSession {
                    control: Box::new(FakeControl {
                        source: source.clone(),
                    }),
                    source,
                    raw: None,
                })
            })
        }
    }

    /// Handler that waits for one event, stops the session, and drains.
    struct OneEventHandler {
        seen: AtomicUsize,
    }

    impl EventPipelineHandler for OneEventHandler {
        fn session_spec(&self) -> SessionSpec {
            SessionSpec::new(vec![ProviderConfig::all("Test.Provider")])
        }

        fn on_event_source_available<'a>(
            &'a self,
            ctx: SessionContext,
            _stop: StopToken,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                let waiter = ctx.source().wait_for("Test.Provider", "Ping");
                if waiter.wait().await.is_some() {
                    self.seen.fetch_add(1, Ordering::SeqCst);
                }
                ctx.stop_session().await?;
                ctx.source().completed().await;
                Ok(())
            })
        }
    }

    fn record() -> EventRecord {
        EventRecord::new("Test.Provider", "Ping", Utc::now(), Map::new())
    }

    #[tokio::test]
    async fn handler_runs_to_completion_on_event() {
        let provider = FakeProvider::new();
        let hooks = EventSourcePipeline::new(
            provider.clone(),
            OneEventHandler {
                seen: AtomicUsize::new(0),
            },
        );
        let pipeline = hooks.into_pipeline();

        let (outcome, ()) = tokio::join!(
            pipeline.run(crate::pipeline::StopToken::never()),
            async {
                let source = provider.live_source().await;
                source.dispatch(&record());
            }
        );
        outcome.unwrap();
        assert_eq!(pipeline.hooks().handler().seen.load(Ordering::SeqCst), 1);
        assert_eq!(provider.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_opens_a_session() {
        let provider = FakeProvider::new();
        let hooks = EventSourcePipeline::new(
            provider.clone(),
            OneEventHandler {
                seen: AtomicUsize::new(0),
            },
        );
        let pipeline = hooks.into_pipeline();

        let source = StopSource::new();
        source.stop();
        let err = pipeline.run(source.token()).await.unwrap_err();
        assert!(matches!(err, Error::Pipeline(PipelineError::Cancelled)));

        pipeline.dispose().await;
        assert_eq!(provider.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_stop_flushes_and_completes() {
        let provider = FakeProvider::new();
        let pipeline = EventSourcePipeline::new(
            provider,
            OneEventHandler {
                seen: AtomicUsize::new(0),
            },
        )
        .into_pipeline();

        let (run_outcome, stop_outcome) = tokio::join!(
            pipeline.run(crate::pipeline::StopToken::never()),
            async {
                tokio::task::yield_now().await;
                pipeline.stop(crate::pipeline::StopToken::never()).await
            }
        );
        // Stopping completes the source; the waiter resolves None and the
        // handler drains normally.
        run_outcome.unwrap();
        stop_outcome.unwrap();
    }
}
