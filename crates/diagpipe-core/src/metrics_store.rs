//! Bounded time-series store with Prometheus text exposition.
//!
//! [`MetricsStore`] keys samples by metric identity (name plus ordered
//! dimension names/values) and retains a bounded FIFO of history per key.
//! Producers on any task mutate under one coarse lock; the snapshot path
//! deep-copies the store under the same lock and renders the exposition
//! text without holding it, so a slow writer never blocks collection.
//!
//! Exposition format: `# HELP`/`# TYPE` header pair per metric, then one
//! line per historical sample as
//! `name{dim="value",...} value timestamp_ms`, newline-terminated with
//! `\n` only.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::counters::MetricSink;
use crate::error::{Error, FieldFailure, Result, ValidationError};
use crate::events::CounterPayload;
use crate::pipeline::StopToken;

// =============================================================================
// Key and series
// =============================================================================

/// Structural metric identity: name plus ordered dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    namespace: String,
    name: String,
    dimension_names: Vec<String>,
    dimension_values: Vec<String>,
}

impl MetricKey {
    fn of(payload: &CounterPayload) -> Self {
        Self {
            namespace: payload.namespace.clone(),
            name: payload.name.clone(),
            dimension_names: payload.dimension_names.clone(),
            dimension_values: payload.dimension_values.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    timestamp: DateTime<Utc>,
}

/// All samples under one key share name and dimensions; only values and
/// timestamps vary.
#[derive(Debug, Clone)]
struct MetricSeries {
    display_name: String,
    unit: Option<String>,
    samples: VecDeque<Sample>,
}

// =============================================================================
// Store
// =============================================================================

/// Thread-safe bounded metric history.
#[derive(Debug)]
pub struct MetricsStore {
    max_metric_count: usize,
    series: Mutex<HashMap<MetricKey, MetricSeries>>,
}

impl MetricsStore {
    /// Create a store retaining at most `max_metric_count` samples per key.
    pub fn new(max_metric_count: usize) -> Result<Self> {
        if max_metric_count < 1 {
            return Err(ValidationError {
                failures: vec![FieldFailure {
                    field: "max_metric_count".to_string(),
                    message: "must be at least 1".to_string(),
                }],
            }
            .into());
        }
        Ok(Self {
            max_metric_count,
            series: Mutex::new(HashMap::new()),
        })
    }

    /// Record one sample, evicting the oldest under the same key when the
    /// retention bound is exceeded.
    pub fn add_metric(&self, payload: &CounterPayload) {
        let mut series = self.series.lock().expect("metrics lock");
        let entry = series
            .entry(MetricKey::of(payload))
            .or_insert_with(|| MetricSeries {
                display_name: payload.display_name.clone(),
                unit: payload.unit.clone(),
                samples: VecDeque::with_capacity(self.max_metric_count),
            });
        entry.samples.push_back(Sample {
            value: payload.value,
            timestamp: payload.timestamp,
        });
        if entry.samples.len() > self.max_metric_count {
            entry.samples.pop_front();
        }
    }

    /// Drop all stored series.
    pub fn clear(&self) {
        self.series.lock().expect("metrics lock").clear();
    }

    /// Render a Prometheus text snapshot into `out`.
    ///
    /// Takes a deep copy under the lock, then formats and writes without
    /// holding it.
    pub async fn snapshot_metrics(
        &self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        stop: StopToken,
    ) -> Result<()> {
        let snapshot: Vec<(MetricKey, MetricSeries)> = {
            let series = self.series.lock().expect("metrics lock");
            series
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };

        for (key, series) in snapshot {
            if stop.is_stopped() {
                return Err(Error::Cancelled("metrics snapshot cancelled".to_string()));
            }

            let (suffix, scale) = unit_rendering(series.unit.as_deref());
            let metric_name = format!("{}{suffix}", exposition_name(&key.namespace, &key.name));
            let labels = render_labels(&key.dimension_names, &key.dimension_values);

            let mut block = String::new();
            block.push_str(&format!("# HELP {metric_name} {}\n", series.display_name));
            block.push_str(&format!("# TYPE {metric_name} gauge\n"));
            for sample in &series.samples {
                block.push_str(&format!(
                    "{metric_name}{labels} {} {}\n",
                    sample.value * scale,
                    sample.timestamp.timestamp_millis()
                ));
            }
            out.write_all(block.as_bytes()).await?;
        }
        out.flush().await?;
        Ok(())
    }
}

impl MetricSink for MetricsStore {
    fn add_metric(&self, payload: &CounterPayload) {
        Self::add_metric(self, payload);
    }
}

// =============================================================================
// Exposition formatting
// =============================================================================

/// `namespace + name`, dots stripped, hyphens to underscores, lowercased.
fn exposition_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
        .chars()
        .filter_map(|c| match c {
            '.' => None,
            '-' => Some('_'),
            other => Some(other.to_ascii_lowercase()),
        })
        .collect()
}

/// Map a display unit to a metric-name suffix and a value scale factor.
///
/// Unknown units are appended verbatim, which can produce names the
/// downstream scraper rejects — a known limitation, deliberately not
/// corrected here.
fn unit_rendering(unit: Option<&str>) -> (String, f64) {
    match unit {
        None | Some("count") => (String::new(), 1.0),
        Some("B") => ("_bytes".to_string(), 1.0),
        Some("MB") => ("_bytes".to_string(), 1_000_000.0),
        Some("%") => ("_ratio".to_string(), 1.0),
        Some(other) => (format!("_{other}"), 1.0),
    }
}

fn render_labels(names: &[String], values: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{name}=\"{}\"", escape_label(value)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(name: &str, value: f64, seconds: i64) -> CounterPayload {
        CounterPayload::gauge(
            "System.Runtime",
            name,
            format!("Display {name}"),
            None,
            value,
            Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
            5.0,
        )
    }

    async fn render(store: &MetricsStore) -> String {
        let mut out = Vec::new();
        store
            .snapshot_metrics(&mut out, StopToken::never())
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn zero_retention_is_rejected() {
        assert!(MetricsStore::new(0).is_err());
    }

    #[test]
    fn retention_keeps_most_recent_in_order() {
        let store = MetricsStore::new(3).unwrap();
        for i in 0..5 {
            store.add_metric(&payload("cpu-usage", f64::from(i), i64::from(i)));
        }
        let series = store.series.lock().unwrap();
        let samples: Vec<f64> = series
            .values()
            .next()
            .unwrap()
            .samples
            .iter()
            .map(|s| s.value)
            .collect();
        assert_eq!(samples, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn distinct_dimensions_are_distinct_keys() {
        let store = MetricsStore::new(10).unwrap();
        let plain = payload("requests", 1.0, 0);
        let tagged = payload("requests", 2.0, 0).with_dimensions(
            vec!["route".to_string()],
            vec!["/api".to_string()],
        );
        store.add_metric(&plain);
        store.add_metric(&tagged);
        assert_eq!(store.series.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exposition_has_help_type_and_samples() {
        let store = MetricsStore::new(10).unwrap();
        store.add_metric(&payload("cpu-usage", 42.5, 0));
        let text = render(&store).await;

        assert!(text.contains("# HELP systemruntime_cpu_usage Display cpu-usage\n"));
        assert!(text.contains("# TYPE systemruntime_cpu_usage gauge\n"));
        assert!(text.contains("systemruntime_cpu_usage 42.5 1700000000000\n"));
        // Newline-terminated with \n only.
        assert!(!text.contains('\r'));
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn megabyte_values_scale_to_bytes() {
        let store = MetricsStore::new(10).unwrap();
        let mut sample = payload("gc-heap-size", 2.0, 0);
        sample.unit = Some("MB".to_string());
        store.add_metric(&sample);
        let text = render(&store).await;
        assert!(text.contains("systemruntime_gc_heap_size_bytes 2000000 "), "{text}");
    }

    #[tokio::test]
    async fn no_dimensions_means_no_braces() {
        let store = MetricsStore::new(10).unwrap();
        store.add_metric(&payload("cpu-usage", 1.0, 0));
        let text = render(&store).await;
        assert!(!text.contains('{'));
    }

    #[tokio::test]
    async fn dimensions_render_as_labels() {
        let store = MetricsStore::new(10).unwrap();
        let sample = payload("requests", 7.0, 0).with_dimensions(
            vec!["route".to_string(), "method".to_string()],
            vec!["/api/items".to_string(), "GET".to_string()],
        );
        store.add_metric(&sample);
        let text = render(&store).await;
        assert!(
            text.contains("systemruntime_requests{route=\"/api/items\",method=\"GET\"} 7 "),
            "{text}"
        );
    }

    #[tokio::test]
    async fn percent_maps_to_ratio_suffix_unscaled() {
        let store = MetricsStore::new(10).unwrap();
        let mut sample = payload("cpu-usage", 12.5, 0);
        sample.unit = Some("%".to_string());
        store.add_metric(&sample);
        let text = render(&store).await;
        assert!(text.contains("systemruntime_cpu_usage_ratio 12.5 "), "{text}");
    }

    #[tokio::test]
    async fn unknown_unit_is_appended_verbatim() {
        let store = MetricsStore::new(10).unwrap();
        let mut sample = payload("speed", 3.0, 0);
        sample.unit = Some("req/sec".to_string());
        store.add_metric(&sample);
        let text = render(&store).await;
        // Known limitation: no sanitization of the unit token.
        assert!(text.contains("systemruntime_speed_req/sec 3 "), "{text}");
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let store = MetricsStore::new(10).unwrap();
        store.add_metric(&payload("cpu-usage", 1.0, 0));
        store.clear();
        let text = render(&store).await;
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn cancelled_snapshot_reports_cancellation() {
        let store = MetricsStore::new(10).unwrap();
        store.add_metric(&payload("cpu-usage", 1.0, 0));
        let source = crate::pipeline::StopSource::new();
        source.stop();
        let mut out = Vec::new();
        let err = store
            .snapshot_metrics(&mut out, source.token())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
