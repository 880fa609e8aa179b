//! Process info pipeline.
//!
//! Extracts the target process's command line from the event stream's
//! `ProcessInfo` event. Ordering is deliberate: the pipeline first waits
//! for *any* trace event as a proxy for "the session is actually flowing",
//! because requesting stop too early races with a runtime that has not
//! emitted `ProcessInfo` yet. Only then does it issue the stop request and
//! await the `ProcessInfo` completion — which may be delivered as part of
//! the stop flush.

use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::event_pipeline::{EventPipelineHandler, EventSourcePipeline, SessionContext};
use crate::event_source::{DiagnosticSessionProvider, ProviderConfig, SessionSpec};
use crate::pipeline::{BoxFuture, Pipeline, StopToken};

/// Provider emitting session-level events, including `ProcessInfo`.
pub const EVENT_PIPE_PROVIDER: &str = "Microsoft-DotNETCore-EventPipe";

const PROCESS_INFO_EVENT: &str = "ProcessInfo";

/// Invoked with the extracted command line once available.
pub type ProcessInfoCallback =
    Box<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Process info pipeline behavior plugged into [`EventSourcePipeline`].
pub struct ProcessInfoHandler {
    callback: ProcessInfoCallback,
    command_line: Mutex<Option<String>>,
}

impl ProcessInfoHandler {
    /// The extracted command line, after a successful run.
    #[must_use]
    pub fn command_line(&self) -> Option<String> {
        self.command_line.lock().expect("command line lock").clone()
    }
}

impl EventPipelineHandler for ProcessInfoHandler {
    fn session_spec(&self) -> SessionSpec {
        SessionSpec::new(vec![ProviderConfig::all(EVENT_PIPE_PROVIDER)])
    }

    fn on_event_source_available<'a>(
        &'a self,
        ctx: SessionContext,
        _stop: StopToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // Register interest in ProcessInfo before anything else so the
            // event cannot be missed while we gate on session liveness.
            let process_info = ctx.source().wait_for(EVENT_PIPE_PROVIDER, PROCESS_INFO_EVENT);
            let any_event = ctx.source().wait_for_any();

            // "Any event observed" means the session is live; stopping now
            // cannot race with a runtime that never started delivering.
            if any_event.wait().await.is_none() {
                return Err(Error::Session(
                    "event source completed before any event was observed".to_string(),
                ));
            }
            debug!("session is live, requesting stop");
            ctx.stop_session().await?;

            let record = process_info.wait().await.ok_or_else(|| {
                Error::IncompleteData(
                    "session drained without delivering ProcessInfo".to_string(),
                )
            })?;
            let command_line = record
                .field_str("CommandLine")
                .unwrap_or_default()
                .to_string();

            ctx.source().completed().await;

            *self.command_line.lock().expect("command line lock") =
                Some(command_line.clone());
            (self.callback)(command_line).await
        })
    }
}

/// Build a process info pipeline over `provider`, invoking `callback` with
/// the extracted command line.
#[must_use]
pub fn process_info_pipeline(
    provider: std::sync::Arc<dyn DiagnosticSessionProvider>,
    callback: ProcessInfoCallback,
) -> Pipeline<EventSourcePipeline<ProcessInfoHandler>> {
    EventSourcePipeline::new(
        provider,
        ProcessInfoHandler {
            callback,
            command_line: Mutex::new(None),
        },
    )
    .into_pipeline()
}
