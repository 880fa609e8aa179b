//! Typed event records and counter payloads.
//!
//! The diagnostic session boundary delivers decoded trace events as
//! [`EventRecord`]s: a (provider, event) identity, a timestamp, and a bag of
//! named payload fields. Counter samples arrive as `EventCounters` events
//! whose payload carries one sampled value of a named performance counter;
//! [`CounterPayload`] is the normalized, read-only representation used by
//! triggers and metric sinks.
//!
//! Two counter wire shapes exist — plain (mean/gauge) and incrementing
//! (rate) — and both normalize to the same contract: name, value, display
//! string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known event name carrying counter samples.
pub const EVENT_COUNTERS_EVENT: &str = "EventCounters";

/// Provider emitting the built-in runtime counters.
pub const SYSTEM_RUNTIME_PROVIDER: &str = "System.Runtime";

// =============================================================================
// Event record
// =============================================================================

/// One decoded trace event observed on a diagnostic session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Provider (event source) name, e.g. `System.Runtime`.
    pub provider_name: String,
    /// Event name within the provider, e.g. `EventCounters`.
    pub event_name: String,
    /// Wall-clock timestamp assigned by the event source.
    pub timestamp: DateTime<Utc>,
    /// Named payload fields as delivered by the decoder.
    pub payload: Map<String, Value>,
}

impl EventRecord {
    /// Create a record with the given identity and payload.
    #[must_use]
    pub fn new(
        provider_name: impl Into<String>,
        event_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            event_name: event_name.into(),
            timestamp,
            payload,
        }
    }

    /// Fetch a payload field as a string slice, if present and textual.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    /// Fetch a payload field as a float, accepting integer wire encodings.
    #[must_use]
    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.payload.get(name).and_then(Value::as_f64)
    }

    /// Fetch a payload field as an unsigned integer.
    #[must_use]
    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.payload.get(name).and_then(Value::as_u64)
    }
}

// =============================================================================
// Counter payload
// =============================================================================

/// How a counter value was produced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Plain counter: the sample is a mean over the interval.
    Gauge,
    /// Incrementing counter: the sample is the increment over the interval.
    Rate,
}

/// One sampled value of a named performance counter.
///
/// Immutable once constructed from a raw event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterPayload {
    /// Counter name, e.g. `cpu-usage`.
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Sampled value (mean for gauges, increment for rate counters).
    pub value: f64,
    /// Display units as reported by the provider, if any.
    pub unit: Option<String>,
    /// Provider (namespace) the counter belongs to.
    pub namespace: String,
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sampling interval in seconds.
    pub interval_seconds: f64,
    /// Dimension names, parallel to `dimension_values`.
    pub dimension_names: Vec<String>,
    /// Dimension values, parallel to `dimension_names`.
    pub dimension_values: Vec<String>,
    /// Wire shape the sample arrived in.
    pub kind: CounterKind,
}

impl CounterPayload {
    /// Construct a plain (mean/gauge) counter sample.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn gauge(
        namespace: impl Into<String>,
        name: impl Into<String>,
        display_name: impl Into<String>,
        unit: Option<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        interval_seconds: f64,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            value,
            unit,
            namespace: namespace.into(),
            timestamp,
            interval_seconds,
            dimension_names: Vec::new(),
            dimension_values: Vec::new(),
            kind: CounterKind::Gauge,
        }
    }

    /// Construct an incrementing (rate) counter sample.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn rate(
        namespace: impl Into<String>,
        name: impl Into<String>,
        display_name: impl Into<String>,
        unit: Option<String>,
        increment: f64,
        timestamp: DateTime<Utc>,
        interval_seconds: f64,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            value: increment,
            unit,
            namespace: namespace.into(),
            timestamp,
            interval_seconds,
            dimension_names: Vec::new(),
            dimension_values: Vec::new(),
            kind: CounterKind::Rate,
        }
    }

    /// Attach parsed dimensions (parallel name/value sequences).
    #[must_use]
    pub fn with_dimensions(mut self, names: Vec<String>, values: Vec<String>) -> Self {
        debug_assert_eq!(names.len(), values.len());
        self.dimension_names = names;
        self.dimension_values = values;
        self
    }

    /// Display string for human-facing output.
    ///
    /// Rate counters render as `<display name> / <interval> sec` to make the
    /// interval explicit, matching how they were sampled.
    #[must_use]
    pub fn display_string(&self) -> String {
        match self.kind {
            CounterKind::Gauge => self.display_name.clone(),
            CounterKind::Rate => {
                format!("{} / {} sec", self.display_name, self.interval_seconds)
            }
        }
    }

    /// Decode an `EventCounters` event into a counter payload.
    ///
    /// Returns `None` when the record is not an `EventCounters` event or its
    /// payload does not carry the expected fields. Both wire shapes are
    /// accepted: `Mean`-bearing payloads become gauges, `Increment`-bearing
    /// payloads become rate samples.
    #[must_use]
    pub fn from_event(record: &EventRecord) -> Option<Self> {
        if record.event_name != EVENT_COUNTERS_EVENT {
            return None;
        }
        let body = record.payload.get("Payload")?.as_object()?;

        let name = body.get("Name")?.as_str()?.to_string();
        let display_name = body
            .get("DisplayName")
            .and_then(Value::as_str)
            .unwrap_or(&name)
            .to_string();
        let unit = body
            .get("DisplayUnits")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(ToString::to_string);
        let interval_seconds = body
            .get("IntervalSec")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let payload = if let Some(mean) = body.get("Mean").and_then(Value::as_f64) {
            Self::gauge(
                record.provider_name.clone(),
                name,
                display_name,
                unit,
                mean,
                record.timestamp,
                interval_seconds,
            )
        } else if let Some(increment) = body.get("Increment").and_then(Value::as_f64) {
            Self::rate(
                record.provider_name.clone(),
                name,
                display_name,
                unit,
                increment,
                record.timestamp,
                interval_seconds,
            )
        } else {
            return None;
        };

        let (names, values) = body
            .get("Metadata")
            .and_then(Value::as_str)
            .map(parse_metadata)
            .unwrap_or_default();
        Some(payload.with_dimensions(names, values))
    }
}

/// Parse a `key=value,key2=value2` metadata string into parallel sequences.
///
/// Entries without `=` are skipped. Order is preserved; dimension identity
/// depends on it.
fn parse_metadata(metadata: &str) -> (Vec<String>, Vec<String>) {
    let mut names = Vec::new();
    let mut values = Vec::new();
    for entry in metadata.split(',') {
        if let Some((key, value)) = entry.split_once('=') {
            names.push(key.trim().to_string());
            values.push(value.trim().to_string());
        }
    }
    (names, values)
}
