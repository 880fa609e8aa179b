//! Counter trigger evaluation.
//!
//! An [`EventCounterTrigger`] watches one named counter from one provider
//! and decides whether its value has satisfied a threshold predicate
//! (greater-than, less-than, or between) continuously for a configured
//! sliding-window duration. Settings validate eagerly at construction; the
//! evaluation itself is a small amount of per-sample state in
//! [`EventCounterTriggerImpl`].
//!
//! Dropped-sample handling: if consecutive samples are spaced more than
//! 1.5x the expected sampling interval apart, the window restarts from the
//! current sample. A delayed or missing sample can therefore never produce
//! a false positive from stale state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FieldFailure, ValidationError};
use crate::events::{CounterPayload, EventRecord, EVENT_COUNTERS_EVENT};
use crate::sliding_window::SlidingWindow;

/// Sampling interval bounds, in seconds.
const MIN_COUNTER_INTERVAL_SECS: f64 = 1.0;
const MAX_COUNTER_INTERVAL_SECS: f64 = 86_400.0;

/// Sliding window duration bounds.
const MIN_WINDOW: Duration = Duration::from_secs(1);
const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Samples spaced wider than this multiple of the interval count as dropped.
const DROP_FACTOR: f64 = 1.5;

// =============================================================================
// Settings
// =============================================================================

/// Configuration for an [`EventCounterTrigger`].
///
/// At least one of `greater_than`/`less_than` is required; when both are
/// present they form a band and `greater_than` must be strictly below
/// `less_than`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCounterTriggerSettings {
    /// Provider (event source) to subscribe to.
    pub provider_name: String,
    /// Counter name within the provider.
    pub counter_name: String,
    /// Pass when the sampled value is strictly greater than this.
    pub greater_than: Option<f64>,
    /// Pass when the sampled value is strictly less than this.
    pub less_than: Option<f64>,
    /// How long the condition must hold continuously.
    pub sliding_window_duration: Duration,
    /// Expected counter sampling interval, in seconds.
    pub counter_interval_seconds: f64,
}

impl EventCounterTriggerSettings {
    /// Validate the settings, reporting every field-level violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut failures = Vec::new();

        if self.provider_name.is_empty() {
            failures.push(FieldFailure {
                field: "provider_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.counter_name.is_empty() {
            failures.push(FieldFailure {
                field: "counter_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        match (self.greater_than, self.less_than) {
            (None, None) => failures.push(FieldFailure {
                field: "greater_than".to_string(),
                message: "at least one of greater_than/less_than is required".to_string(),
            }),
            (Some(gt), Some(lt)) if gt >= lt => failures.push(FieldFailure {
                field: "greater_than".to_string(),
                message: format!("must be less than less_than ({gt} >= {lt})"),
            }),
            _ => {}
        }

        if self.counter_interval_seconds < MIN_COUNTER_INTERVAL_SECS
            || self.counter_interval_seconds > MAX_COUNTER_INTERVAL_SECS
        {
            failures.push(FieldFailure {
                field: "counter_interval_seconds".to_string(),
                message: format!(
                    "must be within [{MIN_COUNTER_INTERVAL_SECS}, {MAX_COUNTER_INTERVAL_SECS}] seconds"
                ),
            });
        }

        if self.sliding_window_duration < MIN_WINDOW || self.sliding_window_duration > MAX_WINDOW {
            failures.push(FieldFailure {
                field: "sliding_window_duration".to_string(),
                message: "must be within [1 second, 24 hours]".to_string(),
            });
        }

        ValidationError::from_failures(failures)
    }

    fn value_filter(&self) -> Box<dyn Fn(f64) -> bool + Send> {
        let greater_than = self.greater_than;
        let less_than = self.less_than;
        Box::new(move |value| match (greater_than, less_than) {
            (Some(gt), Some(lt)) => value > gt && value < lt,
            (Some(gt), None) => value > gt,
            (None, Some(lt)) => value < lt,
            (None, None) => false,
        })
    }
}

// =============================================================================
// Window/threshold evaluator
// =============================================================================

/// Per-sample evaluation state shared by counter triggers.
///
/// Tracks when the threshold condition started holding and where the
/// "held long enough" target sits. Assumes samples arrive in non-decreasing
/// timestamp order (the event source's own ordering guarantee).
pub struct EventCounterTriggerImpl {
    interval_ms: i64,
    window_ms: i64,
    value_filter: Box<dyn Fn(f64) -> bool + Send>,
    latest_ms: Option<i64>,
    target_ms: Option<i64>,
}

impl std::fmt::Debug for EventCounterTriggerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCounterTriggerImpl")
            .field("interval_ms", &self.interval_ms)
            .field("window_ms", &self.window_ms)
            .field("latest_ms", &self.latest_ms)
            .field("target_ms", &self.target_ms)
            .finish_non_exhaustive()
    }
}

impl EventCounterTriggerImpl {
    /// Build the evaluator from validated settings.
    #[must_use]
    pub fn new(settings: &EventCounterTriggerSettings) -> Self {
        Self {
            interval_ms: (settings.counter_interval_seconds * 1_000.0) as i64,
            window_ms: settings.sliding_window_duration.as_millis() as i64,
            value_filter: settings.value_filter(),
            latest_ms: None,
            target_ms: None,
        }
    }

    /// Feed one sample; returns whether the condition has now held for the
    /// full window.
    ///
    /// A failing value fully resets the state (no partial credit); a gap
    /// wider than 1.5x the interval restarts the window from this sample.
    pub fn has_satisfied_condition(&mut self, value: f64, timestamp: DateTime<Utc>) -> bool {
        let ts = timestamp.timestamp_millis();

        if (self.value_filter)(value) {
            let dropped = self
                .latest_ms
                .is_some_and(|latest| (ts - latest) as f64 > DROP_FACTOR * self.interval_ms as f64);
            if self.target_ms.is_none() || dropped {
                // The window is considered to start one interval before this
                // sample: the first passing sample already covers its own
                // sampling period.
                self.target_ms = Some(ts - self.interval_ms + self.window_ms);
            }
        } else {
            self.target_ms = None;
        }

        self.latest_ms = Some(ts);
        self.target_ms.is_some_and(|target| ts >= target)
    }
}

// =============================================================================
// Trigger
// =============================================================================

/// Stateful trigger over a live stream of counter events.
#[derive(Debug)]
pub struct EventCounterTrigger {
    provider_name: String,
    counter_name: String,
    evaluator: EventCounterTriggerImpl,
}

impl EventCounterTrigger {
    /// Validate `settings` and build the trigger.
    pub fn new(settings: &EventCounterTriggerSettings) -> Result<Self, ValidationError> {
        settings.validate()?;
        Ok(Self {
            provider_name: settings.provider_name.clone(),
            counter_name: settings.counter_name.clone(),
            evaluator: EventCounterTriggerImpl::new(settings),
        })
    }

    /// The subscription filter this trigger needs from the event source:
    /// exactly the `EventCounters` event of the configured provider.
    #[must_use]
    pub fn provider_event_map(&self) -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        map.insert(
            self.provider_name.clone(),
            vec![EVENT_COUNTERS_EVENT.to_string()],
        );
        map
    }

    /// Feed one event; returns whether the trigger condition is now met.
    ///
    /// Only `EventCounters` payloads for the configured provider/counter
    /// pass the name filter; everything else leaves the state untouched.
    pub fn has_satisfied_condition(&mut self, record: &EventRecord) -> bool {
        if record.provider_name != self.provider_name {
            return false;
        }
        let Some(payload) = CounterPayload::from_event(record) else {
            return false;
        };
        if payload.name != self.counter_name {
            return false;
        }
        self.evaluator
            .has_satisfied_condition(payload.value, payload.timestamp)
    }
}

// =============================================================================
// Event rate trigger
// =============================================================================

/// Configuration for an [`EventRateTrigger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRateTriggerSettings {
    /// Provider to subscribe to.
    pub provider_name: String,
    /// Event name within the provider.
    pub event_name: String,
    /// Occurrences required inside the window.
    pub event_count: u64,
    /// Window the occurrences must fall into.
    pub sliding_window_duration: Duration,
}

impl EventRateTriggerSettings {
    /// Validate the settings, reporting every field-level violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut failures = Vec::new();
        if self.provider_name.is_empty() {
            failures.push(FieldFailure {
                field: "provider_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.event_name.is_empty() {
            failures.push(FieldFailure {
                field: "event_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.event_count == 0 {
            failures.push(FieldFailure {
                field: "event_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.sliding_window_duration < MIN_WINDOW || self.sliding_window_duration > MAX_WINDOW {
            failures.push(FieldFailure {
                field: "sliding_window_duration".to_string(),
                message: "must be within [1 second, 24 hours]".to_string(),
            });
        }
        ValidationError::from_failures(failures)
    }
}

/// Fires when a named event occurs at least `event_count` times within the
/// sliding window.
#[derive(Debug)]
pub struct EventRateTrigger {
    provider_name: String,
    event_name: String,
    event_count: u64,
    window: SlidingWindow,
}

impl EventRateTrigger {
    /// Validate `settings` and build the trigger.
    pub fn new(settings: &EventRateTriggerSettings) -> Result<Self, ValidationError> {
        settings.validate()?;
        Ok(Self {
            provider_name: settings.provider_name.clone(),
            event_name: settings.event_name.clone(),
            event_count: settings.event_count,
            window: SlidingWindow::new(settings.sliding_window_duration),
        })
    }

    /// The subscription filter this trigger needs from the event source.
    #[must_use]
    pub fn provider_event_map(&self) -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        map.insert(self.provider_name.clone(), vec![self.event_name.clone()]);
        map
    }

    /// Feed one event; returns whether the occurrence threshold is met.
    pub fn has_satisfied_condition(&mut self, record: &EventRecord) -> bool {
        if record.provider_name != self.provider_name || record.event_name != self.event_name {
            return false;
        }
        self.window.add_data_point(record.timestamp);
        self.window.count() >= self.event_count
    }

    /// Forget all observed occurrences.
    pub fn clear(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Map, Value};

    fn settings() -> EventCounterTriggerSettings {
        EventCounterTriggerSettings {
            provider_name: "System.Runtime".to_string(),
            counter_name: "cpu-usage".to_string(),
            greater_than: Some(50.0),
            less_than: None,
            sliding_window_duration: Duration::from_secs(10),
            counter_interval_seconds: 2.0,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    // -- Validation ------------------------------------------------------------

    #[test]
    fn valid_settings_pass() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn missing_thresholds_fail_validation() {
        let mut s = settings();
        s.greater_than = None;
        s.less_than = None;
        let err = s.validate().unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(err.failures[0].message.contains("at least one"));
    }

    #[test]
    fn inverted_band_fails_validation() {
        let mut s = settings();
        s.greater_than = Some(80.0);
        s.less_than = Some(20.0);
        assert!(s.validate().is_err());
    }

    #[test]
    fn interval_out_of_range_fails_validation() {
        let mut s = settings();
        s.counter_interval_seconds = 0.5;
        let err = s.validate().unwrap_err();
        assert_eq!(err.failures[0].field, "counter_interval_seconds");

        s.counter_interval_seconds = 100_000.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn window_out_of_range_fails_validation() {
        let mut s = settings();
        s.sliding_window_duration = Duration::from_millis(100);
        assert!(s.validate().is_err());
        s.sliding_window_duration = Duration::from_secs(25 * 60 * 60);
        assert!(s.validate().is_err());
    }

    #[test]
    fn multiple_violations_reported_together() {
        let mut s = settings();
        s.greater_than = None;
        s.less_than = None;
        s.counter_interval_seconds = 0.0;
        let err = s.validate().unwrap_err();
        assert_eq!(err.failures.len(), 2);
    }

    // -- Evaluator -------------------------------------------------------------

    #[test]
    fn satisfied_exactly_at_window_boundary() {
        // interval 2s, window 10s: first passing sample at t=0 covers
        // [-2, 0], so the condition holds for the full window at t=8.
        let mut eval = EventCounterTriggerImpl::new(&settings());
        for t in [0, 2, 4, 6] {
            assert!(!eval.has_satisfied_condition(75.0, at(t)), "t={t}");
        }
        assert!(eval.has_satisfied_condition(75.0, at(8)));
    }

    #[test]
    fn failing_sample_resets_the_window() {
        let mut eval = EventCounterTriggerImpl::new(&settings());
        for t in [0, 2, 4] {
            eval.has_satisfied_condition(75.0, at(t));
        }
        // One failing sample: no partial credit.
        assert!(!eval.has_satisfied_condition(10.0, at(6)));
        // Satisfaction is now computed from the first passing sample after
        // the gap (t=8), not from t=0.
        for t in [8, 10, 12, 14] {
            assert!(!eval.has_satisfied_condition(75.0, at(t)), "t={t}");
        }
        assert!(eval.has_satisfied_condition(75.0, at(16)));
    }

    #[test]
    fn wide_gap_restarts_even_when_value_passes() {
        let mut eval = EventCounterTriggerImpl::new(&settings());
        eval.has_satisfied_condition(75.0, at(0));
        eval.has_satisfied_condition(75.0, at(2));
        // 4s gap > 1.5 * 2s interval: restart from t=6.
        assert!(!eval.has_satisfied_condition(75.0, at(6)));
        for t in [8, 10, 12] {
            assert!(!eval.has_satisfied_condition(75.0, at(t)), "t={t}");
        }
        assert!(eval.has_satisfied_condition(75.0, at(14)));
    }

    #[test]
    fn gap_exactly_at_drop_threshold_does_not_restart() {
        let mut eval = EventCounterTriggerImpl::new(&settings());
        eval.has_satisfied_condition(75.0, at(0));
        // 3s gap == 1.5 * 2s exactly: not a drop.
        for t in [3, 5, 7] {
            assert!(!eval.has_satisfied_condition(75.0, at(t)), "t={t}");
        }
        assert!(eval.has_satisfied_condition(75.0, at(9)));
    }

    #[test]
    fn band_filter_requires_both_bounds() {
        let mut s = settings();
        s.greater_than = Some(20.0);
        s.less_than = Some(80.0);
        let mut eval = EventCounterTriggerImpl::new(&s);
        assert!(!eval.has_satisfied_condition(10.0, at(0)));
        assert!(!eval.has_satisfied_condition(90.0, at(2)));
        // In-band samples start accruing from t=4.
        for t in [4, 6, 8, 10] {
            assert!(!eval.has_satisfied_condition(50.0, at(t)), "t={t}");
        }
        assert!(eval.has_satisfied_condition(50.0, at(12)));
    }

    // -- Trigger ---------------------------------------------------------------

    fn counter_record(provider: &str, name: &str, value: f64, t: DateTime<Utc>) -> EventRecord {
        let mut payload = Map::new();
        payload.insert(
            "Payload".to_string(),
            json!({ "Name": name, "Mean": value, "IntervalSec": 2.0 }),
        );
        EventRecord {
            provider_name: provider.to_string(),
            event_name: EVENT_COUNTERS_EVENT.to_string(),
            timestamp: t,
            payload,
        }
    }

    #[test]
    fn provider_event_map_advertises_event_counters() {
        let trigger = EventCounterTrigger::new(&settings()).unwrap();
        let map = trigger.provider_event_map();
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get("System.Runtime").unwrap(),
            &vec!["EventCounters".to_string()]
        );
    }

    #[test]
    fn other_counters_are_filtered_out() {
        let mut trigger = EventCounterTrigger::new(&settings()).unwrap();
        // A different counter passing the threshold must not advance state.
        for t in 0..20 {
            assert!(!trigger.has_satisfied_condition(&counter_record(
                "System.Runtime",
                "working-set",
                99.0,
                at(t * 2)
            )));
        }
    }

    #[test]
    fn other_providers_are_filtered_out(){
        let mut trigger = EventCounterTrigger::new(&settings()).unwrap();
        for t in 0..20 {
            assert!(!trigger.has_satisfied_condition(&counter_record(
                "Other.Provider",
                "cpu-usage",
                99.0,
                at(t * 2)
            )));
        }
    }

    #[test]
    fn matching_counter_satisfies_after_window() {
        let mut trigger = EventCounterTrigger::new(&settings()).unwrap();
        let mut satisfied_at = None;
        for t in [0, 2, 4, 6, 8, 10] {
            if trigger.has_satisfied_condition(&counter_record(
                "System.Runtime",
                "cpu-usage",
                75.0,
                at(t),
            )) {
                satisfied_at = Some(t);
                break;
            }
        }
        assert_eq!(satisfied_at, Some(8));
    }

    #[test]
    fn invalid_settings_rejected_at_construction() {
        let mut s = settings();
        s.counter_name = String::new();
        assert!(EventCounterTrigger::new(&s).is_err());
    }

    // -- Event rate trigger ----------------------------------------------------

    fn rate_settings(count: u64) -> EventRateTriggerSettings {
        EventRateTriggerSettings {
            provider_name: "Microsoft-Windows-DotNETRuntime".to_string(),
            event_name: "Exception/Start".to_string(),
            event_count: count,
            sliding_window_duration: Duration::from_secs(10),
        }
    }

    fn plain_record(provider: &str, event: &str, t: DateTime<Utc>) -> EventRecord {
        EventRecord {
            provider_name: provider.to_string(),
            event_name: event.to_string(),
            timestamp: t,
            payload: Map::new(),
        }
    }

    #[test]
    fn rate_trigger_counts_within_window() {
        let mut trigger = EventRateTrigger::new(&rate_settings(3)).unwrap();
        let record =
            |t| plain_record("Microsoft-Windows-DotNETRuntime", "Exception/Start", at(t));
        assert!(!trigger.has_satisfied_condition(&record(0)));
        assert!(!trigger.has_satisfied_condition(&record(2)));
        assert!(trigger.has_satisfied_condition(&record(4)));
    }

    #[test]
    fn rate_trigger_forgets_old_occurrences() {
        let mut trigger = EventRateTrigger::new(&rate_settings(3)).unwrap();
        let record =
            |t| plain_record("Microsoft-Windows-DotNETRuntime", "Exception/Start", at(t));
        trigger.has_satisfied_condition(&record(0));
        trigger.has_satisfied_condition(&record(2));
        // 15s later: both previous occurrences aged out of the 10s window.
        assert!(!trigger.has_satisfied_condition(&record(17)));
        assert!(!trigger.has_satisfied_condition(&record(18)));
        assert!(trigger.has_satisfied_condition(&record(19)));
    }

    #[test]
    fn rate_trigger_filters_identity() {
        let mut trigger = EventRateTrigger::new(&rate_settings(1)).unwrap();
        assert!(!trigger
            .has_satisfied_condition(&plain_record("Other", "Exception/Start", at(0))));
        assert!(!trigger.has_satisfied_condition(&plain_record(
            "Microsoft-Windows-DotNETRuntime",
            "Other",
            at(1)
        )));
    }

    #[test]
    fn rate_trigger_validation() {
        let mut s = rate_settings(0);
        let err = s.validate().unwrap_err();
        assert_eq!(err.failures[0].field, "event_count");
        s.event_count = 1;
        s.sliding_window_duration = Duration::from_millis(10);
        assert!(s.validate().is_err());
    }

    #[test]
    fn rate_trigger_clear_resets() {
        let mut trigger = EventRateTrigger::new(&rate_settings(2)).unwrap();
        let record =
            |t| plain_record("Microsoft-Windows-DotNETRuntime", "Exception/Start", at(t));
        trigger.has_satisfied_condition(&record(0));
        trigger.clear();
        assert!(!trigger.has_satisfied_condition(&record(1)));
    }
}
