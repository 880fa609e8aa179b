//! Live counter collection pipeline.
//!
//! Subscribes to the `EventCounters` event of each configured provider,
//! normalizes samples into [`CounterPayload`]s, forwards them to registered
//! metric sinks, and optionally evaluates an [`EventCounterTrigger`]. When
//! the trigger condition is satisfied the pipeline stops its session and
//! completes, which is the signal the owning tool reacts to (collect a
//! dump, egress a trace, notify).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{FieldFailure, Result, ValidationError};
use crate::event_pipeline::{EventPipelineHandler, EventSourcePipeline, SessionContext};
use crate::event_source::{DiagnosticSessionProvider, ProviderConfig, SessionSpec};
use crate::events::{CounterPayload, EVENT_COUNTERS_EVENT};
use crate::pipeline::{BoxFuture, Pipeline, StopToken};
use crate::triggers::{EventCounterTrigger, EventCounterTriggerSettings};

/// Receives every counter sample observed by a counter pipeline.
pub trait MetricSink: Send + Sync {
    /// Record one sample.
    fn add_metric(&self, payload: &CounterPayload);
}

/// One provider's counter interest.
#[derive(Debug, Clone)]
pub struct CounterGroup {
    /// Provider to subscribe to.
    pub provider: String,
    /// Counters to keep; `None` keeps every counter of the provider.
    pub counters: Option<Vec<String>>,
}

impl CounterGroup {
    /// Keep every counter of `provider`.
    #[must_use]
    pub fn all(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            counters: None,
        }
    }

    fn keeps(&self, counter: &str) -> bool {
        self.counters
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| n == counter))
    }
}

/// Counter pipeline configuration.
#[derive(Debug, Clone)]
pub struct CounterPipelineSettings {
    /// Providers (and optionally specific counters) to collect.
    pub groups: Vec<CounterGroup>,
    /// Sampling interval requested from the runtime, in seconds.
    pub counter_interval_seconds: f64,
    /// Optional trigger; satisfaction completes the pipeline.
    pub trigger: Option<EventCounterTriggerSettings>,
}

impl CounterPipelineSettings {
    /// Validate eagerly, before any session is opened.
    pub fn validate(&self) -> Result<()> {
        if let Some(trigger) = &self.trigger {
            trigger.validate()?;
        }
        if self.groups.is_empty() {
            return Err(ValidationError {
                failures: vec![FieldFailure {
                    field: "groups".to_string(),
                    message: "at least one counter group is required".to_string(),
                }],
            }
            .into());
        }
        Ok(())
    }
}

/// Handler state shared with per-event subscription closures.
struct SharedState {
    sinks: Vec<Arc<dyn MetricSink>>,
    trigger: Mutex<Option<EventCounterTrigger>>,
    triggered: AtomicBool,
}

/// Counter pipeline behavior plugged into [`EventSourcePipeline`].
pub struct CounterPipelineHandler {
    groups: Vec<CounterGroup>,
    interval_seconds: f64,
    has_trigger: bool,
    state: Arc<SharedState>,
}

impl CounterPipelineHandler {
    /// Whether the trigger condition was met during the run.
    #[must_use]
    pub fn triggered(&self) -> bool {
        self.state.triggered.load(Ordering::Acquire)
    }
}

impl EventPipelineHandler for CounterPipelineHandler {
    fn session_spec(&self) -> SessionSpec {
        SessionSpec::new(
            self.groups
                .iter()
                .map(|group| {
                    ProviderConfig::all(group.provider.clone())
                        .with_counter_interval(self.interval_seconds)
                })
                .collect(),
        )
    }

    fn on_event_source_available<'a>(
        &'a self,
        ctx: SessionContext,
        _stop: StopToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (satisfied_tx, mut satisfied_rx) = tokio::sync::watch::channel(false);
            let satisfied_tx = Arc::new(satisfied_tx);

            let mut guards = Vec::with_capacity(self.groups.len());
            for group in &self.groups {
                let group = group.clone();
                let state = Arc::clone(&self.state);
                let satisfied_tx = Arc::clone(&satisfied_tx);
                guards.push(ctx.source().subscribe(
                    group.provider.clone(),
                    EVENT_COUNTERS_EVENT,
                    move |record| {
                        let Some(payload) = CounterPayload::from_event(record) else {
                            return;
                        };
                        if !group.keeps(&payload.name) {
                            return;
                        }
                        for sink in &state.sinks {
                            sink.add_metric(&payload);
                        }
                        let mut trigger = state.trigger.lock().expect("trigger lock");
                        if let Some(trigger) = trigger.as_mut() {
                            if trigger.has_satisfied_condition(record) {
                                state.triggered.store(true, Ordering::Release);
                                let _ = satisfied_tx.send(true);
                            }
                        }
                    },
                ));
            }

            if self.has_trigger {
                tokio::select! {
                    satisfied = async { satisfied_rx.wait_for(|s| *s).await.is_ok() } => {
                        if satisfied {
                            debug!("counter trigger satisfied, stopping session");
                            ctx.stop_session().await?;
                        }
                        ctx.source().completed().await;
                    }
                    () = ctx.source().completed() => {}
                }
            } else {
                // Run until an explicit stop completes the source.
                ctx.source().completed().await;
            }

            drop(guards);
            Ok(())
        })
    }
}

/// Build a counter pipeline over `provider` with the given sinks.
///
/// Settings validate before any session work (fail fast).
pub fn counter_pipeline(
    provider: Arc<dyn DiagnosticSessionProvider>,
    settings: &CounterPipelineSettings,
    sinks: Vec<Arc<dyn MetricSink>>,
) -> Result<Pipeline<EventSourcePipeline<CounterPipelineHandler>>> {
    settings.validate()?;
    let trigger = settings
        .trigger
        .as_ref()
        .map(EventCounterTrigger::new)
        .transpose()?;

    let handler = CounterPipelineHandler {
        groups: settings.groups.clone(),
        interval_seconds: settings.counter_interval_seconds,
        has_trigger: trigger.is_some(),
        state: Arc::new(SharedState {
            sinks,
            trigger: Mutex::new(trigger),
            triggered: AtomicBool::new(false),
        }),
    };
    Ok(EventSourcePipeline::new(provider, handler).into_pipeline())
}
