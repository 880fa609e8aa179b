//! Activity (distributed tracing) pipeline.
//!
//! Streams activity-shaped events from the diagnostic source provider,
//! extracts a structured [`ActivityPayload`] from each, and fans it out to
//! every registered [`ActivityLogger`]. Fan-out is fault-isolated: one
//! faulty sink can neither break delivery to its siblings nor crash event
//! processing — its error is logged and discarded. The lifecycle hooks
//! `pipeline_started`/`pipeline_stopped` are invoked on every logger before
//! and after the event loop, each independently guarded the same way.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::event_pipeline::{EventPipelineHandler, EventSourcePipeline, SessionContext};
use crate::event_source::{DiagnosticSessionProvider, ProviderConfig, SessionSpec};
use crate::events::EventRecord;
use crate::pipeline::{BoxFuture, Pipeline, StopToken};

/// Provider bridging `System.Diagnostics.Activity` into the event stream.
pub const DIAGNOSTIC_SOURCE_PROVIDER: &str = "Microsoft-Diagnostics-DiagnosticSource";

/// Completed activities arrive on the stop event.
const ACTIVITY_STOP_EVENT: &str = "ActivityStop";

// =============================================================================
// Payload
// =============================================================================

/// Structured data extracted from one completed activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPayload {
    /// Operation name.
    pub name: String,
    /// Hierarchical activity identifier.
    pub activity_id: String,
    /// Completion timestamp.
    pub timestamp: DateTime<Utc>,
    /// Duration in milliseconds, when reported.
    pub duration_ms: Option<f64>,
    /// Activity tags as ordered key/value pairs.
    pub tags: Vec<(String, String)>,
}

impl ActivityPayload {
    /// Extract an activity payload from an activity-shaped record.
    ///
    /// Returns `None` when the record lacks the minimal activity shape
    /// (a `Name` field).
    #[must_use]
    pub fn from_event(record: &EventRecord) -> Option<Self> {
        let name = record.field_str("Name")?.to_string();
        let activity_id = record
            .field_str("ActivityId")
            .or_else(|| record.field_str("Id"))
            .unwrap_or_default()
            .to_string();
        let duration_ms = record.field_f64("DurationMs");

        let mut tags = Vec::new();
        if let Some(raw_tags) = record.payload.get("Tags").and_then(Value::as_array) {
            for tag in raw_tags {
                let Some(obj) = tag.as_object() else { continue };
                let (Some(key), Some(value)) = (
                    obj.get("Key").and_then(Value::as_str),
                    obj.get("Value").and_then(Value::as_str),
                ) else {
                    continue;
                };
                tags.push((key.to_string(), value.to_string()));
            }
        }

        Some(Self {
            name,
            activity_id,
            timestamp: record.timestamp,
            duration_ms,
            tags,
        })
    }
}

// =============================================================================
// Logger fan-out
// =============================================================================

/// A sink receiving extracted activities.
pub trait ActivityLogger: Send + Sync {
    /// Invoked once before the event loop starts.
    fn pipeline_started(&self) -> Result<()> {
        Ok(())
    }

    /// Invoked per extracted activity.
    fn log_activity(&self, activity: &ActivityPayload) -> Result<()>;

    /// Invoked once after the event loop ends.
    fn pipeline_stopped(&self) -> Result<()> {
        Ok(())
    }
}

/// Logger writing activities as structured tracing events.
#[derive(Debug, Default)]
pub struct TracingActivityLogger;

impl ActivityLogger for TracingActivityLogger {
    fn log_activity(&self, activity: &ActivityPayload) -> Result<()> {
        tracing::info!(
            name = %activity.name,
            activity_id = %activity.activity_id,
            duration_ms = activity.duration_ms,
            tags = activity.tags.len(),
            "activity completed"
        );
        Ok(())
    }
}

/// Dispatch one guarded call per logger, discarding individual failures.
fn each_logger<F>(loggers: &[Arc<dyn ActivityLogger>], what: &str, call: F)
where
    F: Fn(&dyn ActivityLogger) -> Result<()>,
{
    for logger in loggers {
        if let Err(error) = call(logger.as_ref()) {
            warn!(%error, "activity logger failed during {what}");
        }
    }
}

// =============================================================================
// Pipeline handler
// =============================================================================

/// Traces pipeline behavior plugged into [`EventSourcePipeline`].
pub struct TracesHandler {
    loggers: Arc<Vec<Arc<dyn ActivityLogger>>>,
}

impl EventPipelineHandler for TracesHandler {
    fn session_spec(&self) -> SessionSpec {
        SessionSpec::new(vec![ProviderConfig::all(DIAGNOSTIC_SOURCE_PROVIDER)])
    }

    fn on_event_source_available<'a>(
        &'a self,
        ctx: SessionContext,
        _stop: StopToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            each_logger(&self.loggers, "start", |logger| logger.pipeline_started());

            let loggers = Arc::clone(&self.loggers);
            let _guard = ctx.source().subscribe(
                DIAGNOSTIC_SOURCE_PROVIDER,
                ACTIVITY_STOP_EVENT,
                move |record| {
                    let Some(activity) = ActivityPayload::from_event(record) else {
                        return;
                    };
                    each_logger(&loggers, "log", |logger| logger.log_activity(&activity));
                },
            );

            // Run until an explicit stop completes the source.
            ctx.source().completed().await;

            each_logger(&self.loggers, "stop", |logger| logger.pipeline_stopped());
            Ok(())
        })
    }
}

/// Build a traces pipeline over `provider`, fanning out to `loggers`.
#[must_use]
pub fn traces_pipeline(
    provider: Arc<dyn DiagnosticSessionProvider>,
    loggers: Vec<Arc<dyn ActivityLogger>>,
) -> Pipeline<EventSourcePipeline<TracesHandler>> {
    EventSourcePipeline::new(
        provider,
        TracesHandler {
            loggers: Arc::new(loggers),
        },
    )
    .into_pipeline()
}
