//! Raw trace egress pipeline.
//!
//! Streams a session's raw byte stream (the undecoded trace container)
//! straight into an [`EgressProvider`] destination. Optionally bounded by a
//! duration: when the bound elapses the session is stopped, the stream
//! drains to end-of-file, and the transfer completes with whatever the
//! flush delivered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::egress::EgressProvider;
use crate::error::{Error, Result};
use crate::event_pipeline::{EventPipelineHandler, EventSourcePipeline, SessionContext};
use crate::event_source::{DiagnosticSessionProvider, ProviderConfig, SessionSpec};
use crate::pipeline::{BoxFuture, Pipeline, StopToken};

/// Raw trace pipeline configuration.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// Providers to enable in the session.
    pub providers: Vec<ProviderConfig>,
    /// Artifact name handed to the egress provider.
    pub artifact_name: String,
    /// Optional collection bound; `None` runs until an explicit stop.
    pub duration: Option<Duration>,
    /// Whether to request rundown events on stop.
    pub request_rundown: bool,
}

/// Trace pipeline behavior plugged into [`EventSourcePipeline`].
pub struct TraceHandler {
    settings: TraceSettings,
    egress: Arc<dyn EgressProvider>,
    destination: Mutex<Option<String>>,
}

impl TraceHandler {
    /// Destination identifier reported by the egress provider, after a
    /// successful run.
    #[must_use]
    pub fn destination(&self) -> Option<String> {
        self.destination.lock().expect("destination lock").clone()
    }
}

impl EventPipelineHandler for TraceHandler {
    fn session_spec(&self) -> SessionSpec {
        SessionSpec {
            providers: self.settings.providers.clone(),
            request_rundown: self.settings.request_rundown,
        }
    }

    fn on_event_source_available<'a>(
        &'a self,
        ctx: SessionContext,
        stop: StopToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut stream = ctx.take_raw().ok_or_else(|| {
                Error::Session("session provider exposed no raw byte stream".to_string())
            })?;

            let egress = Arc::clone(&self.egress);
            let name = self.settings.artifact_name.clone();
            let transfer = async move {
                egress.egress(&name, stream.as_mut(), stop).await
            };
            tokio::pin!(transfer);

            if let Some(duration) = self.settings.duration {
                tokio::select! {
                    // The stream can hit end-of-file early (session died);
                    // take whatever was transferred.
                    result = &mut transfer => {
                        *self.destination.lock().expect("destination lock") = Some(result?);
                        return Ok(());
                    }
                    () = tokio::time::sleep(duration) => {
                        debug!("trace duration elapsed, stopping session");
                        ctx.stop_session().await?;
                    }
                }
            }

            // Unbounded, or stopped after the duration: the transfer ends
            // when the stream drains to EOF (explicit stop closes it).
            let destination = transfer.await?;
            *self.destination.lock().expect("destination lock") = Some(destination);
            Ok(())
        })
    }
}

/// Build a raw trace pipeline over `provider`, delivering to `egress`.
#[must_use]
pub fn trace_pipeline(
    provider: Arc<dyn DiagnosticSessionProvider>,
    settings: TraceSettings,
    egress: Arc<dyn EgressProvider>,
) -> Pipeline<EventSourcePipeline<TraceHandler>> {
    EventSourcePipeline::new(
        provider,
        TraceHandler {
            settings,
            egress,
            destination: Mutex::new(None),
        },
    )
    .into_pipeline()
}
