//! GC heap dump pipeline.
//!
//! Captures a snapshot of the managed heap's object graph by correlating a
//! live event stream around a garbage-collection cycle:
//!
//! 1. wait for first GC evidence (a `GC/Start` or the first `GC/BulkNode`)
//!    or a 5-second timeout, whichever comes first;
//! 2. if evidence arrived, additionally wait for the `GC/Stop` matching the
//!    first induced GC (by GC number; background GCs do not count);
//! 3. stop the session — the flush may still deliver buffered node/edge
//!    events even when live delivery never started;
//! 4. after the source drains, require that *both* the graph-data and the
//!    GC-stop signals were observed. Partial data is never silently
//!    accepted: the run fails with an incomplete-data error instead.
//!
//! The timeout is a race, not a hard abort: when it wins, the flush still
//! proceeds and may recover everything from the session's buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event_pipeline::{EventPipelineHandler, EventSourcePipeline, SessionContext};
use crate::event_source::{
    DiagnosticSessionProvider, EventLevel, ProviderConfig, SessionSpec,
};
use crate::events::EventRecord;
use crate::pipeline::{BoxFuture, Pipeline, StopToken};

/// CLR runtime provider.
pub const CLR_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";

/// Keyword mask enabling heap-snapshot events (type names, GC heap dump,
/// bulk nodes/edges).
pub const GC_HEAP_SNAPSHOT_KEYWORDS: u64 = 0x198_0001;

const GC_START_EVENT: &str = "GC/Start";
const GC_STOP_EVENT: &str = "GC/Stop";
const GC_BULK_NODE_EVENT: &str = "GC/BulkNode";
const GC_BULK_EDGE_EVENT: &str = "GC/BulkEdge";

/// How long to wait for first GC evidence before falling back to a flush.
const GC_EVIDENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Generation depth of a full (induced) collection.
const FULL_GC_DEPTH: u64 = 2;
/// `Type` payload value marking a background collection.
const BACKGROUND_GC_TYPE: u64 = 1;

// =============================================================================
// Heap graph
// =============================================================================

/// One object node observed in the heap dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapNode {
    /// Object address.
    pub address: u64,
    /// Object size in bytes.
    pub size: u64,
    /// Type identity token.
    pub type_id: u64,
}

/// One reference edge between heap objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapEdge {
    /// Referencing object address.
    pub source: u64,
    /// Referenced object address.
    pub target: u64,
}

/// Accumulates node/edge events while the dump is in flight.
#[derive(Debug, Default)]
struct HeapGraphBuilder {
    nodes: Vec<HeapNode>,
    edges: Vec<HeapEdge>,
}

impl HeapGraphBuilder {
    fn add_nodes(&mut self, record: &EventRecord) {
        let Some(values) = record.payload.get("Values").and_then(Value::as_array) else {
            return;
        };
        for value in values {
            let Some(obj) = value.as_object() else {
                continue;
            };
            self.nodes.push(HeapNode {
                address: obj.get("Address").and_then(Value::as_u64).unwrap_or(0),
                size: obj.get("Size").and_then(Value::as_u64).unwrap_or(0),
                type_id: obj.get("TypeID").and_then(Value::as_u64).unwrap_or(0),
            });
        }
    }

    fn add_edges(&mut self, record: &EventRecord) {
        let Some(values) = record.payload.get("Values").and_then(Value::as_array) else {
            return;
        };
        for value in values {
            let Some(obj) = value.as_object() else {
                continue;
            };
            self.edges.push(HeapEdge {
                source: obj.get("Source").and_then(Value::as_u64).unwrap_or(0),
                target: obj.get("Target").and_then(Value::as_u64).unwrap_or(0),
            });
        }
    }

    fn finish(self) -> HeapGraph {
        HeapGraph {
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

/// Finalized, readable heap object graph.
#[derive(Debug)]
pub struct HeapGraph {
    nodes: Vec<HeapNode>,
    edges: Vec<HeapEdge>,
}

impl HeapGraph {
    /// All object nodes.
    #[must_use]
    pub fn nodes(&self) -> &[HeapNode] {
        &self.nodes
    }

    /// All reference edges.
    #[must_use]
    pub fn edges(&self) -> &[HeapEdge] {
        &self.edges
    }

    /// Total heap bytes accounted for by the dump.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.nodes.iter().map(|n| n.size).sum()
    }
}

// =============================================================================
// Pipeline handler
// =============================================================================

/// GC dump pipeline behavior plugged into [`EventSourcePipeline`].
pub struct GcDumpHandler {
    graph: Mutex<Option<HeapGraph>>,
}

impl GcDumpHandler {
    /// Take the finalized graph after a successful run.
    #[must_use]
    pub fn take_graph(&self) -> Option<HeapGraph> {
        self.graph.lock().expect("graph lock").take()
    }
}

impl EventPipelineHandler for GcDumpHandler {
    fn session_spec(&self) -> SessionSpec {
        let mut provider = ProviderConfig::all(CLR_PROVIDER);
        provider.keywords = GC_HEAP_SNAPSHOT_KEYWORDS;
        provider.level = EventLevel::Verbose;
        SessionSpec {
            providers: vec![provider],
            request_rundown: true,
        }
    }

    fn on_event_source_available<'a>(
        &'a self,
        ctx: SessionContext,
        _stop: StopToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let builder = Arc::new(Mutex::new(HeapGraphBuilder::default()));
            let data_seen = Arc::new(AtomicBool::new(false));
            let stop_seen = Arc::new(AtomicBool::new(false));
            let gc_number: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));

            let (evidence_tx, mut evidence_rx) = tokio::sync::watch::channel(false);
            let evidence_tx = Arc::new(evidence_tx);
            let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

            // First full, non-background GC determines the number the stop
            // event must match.
            let _start_guard = {
                let gc_number = Arc::clone(&gc_number);
                let evidence_tx = Arc::clone(&evidence_tx);
                ctx.source()
                    .subscribe(CLR_PROVIDER, GC_START_EVENT, move |record| {
                        let mut number = gc_number.lock().expect("gc number lock");
                        if number.is_none()
                            && record.field_u64("Depth") == Some(FULL_GC_DEPTH)
                            && record.field_u64("Type") != Some(BACKGROUND_GC_TYPE)
                        {
                            *number = record.field_u64("Count");
                            let _ = evidence_tx.send(true);
                        }
                    })
            };

            let _node_guard = {
                let builder = Arc::clone(&builder);
                let data_seen = Arc::clone(&data_seen);
                let evidence_tx = Arc::clone(&evidence_tx);
                ctx.source()
                    .subscribe(CLR_PROVIDER, GC_BULK_NODE_EVENT, move |record| {
                        data_seen.store(true, Ordering::Release);
                        let _ = evidence_tx.send(true);
                        builder.lock().expect("builder lock").add_nodes(record);
                    })
            };

            let _edge_guard = {
                let builder = Arc::clone(&builder);
                ctx.source()
                    .subscribe(CLR_PROVIDER, GC_BULK_EDGE_EVENT, move |record| {
                        builder.lock().expect("builder lock").add_edges(record);
                    })
            };

            let _stop_guard = {
                let gc_number = Arc::clone(&gc_number);
                let stop_seen = Arc::clone(&stop_seen);
                ctx.source()
                    .subscribe(CLR_PROVIDER, GC_STOP_EVENT, move |record| {
                        let number = *gc_number.lock().expect("gc number lock");
                        if number.is_some() && record.field_u64("Count") == number {
                            stop_seen.store(true, Ordering::Release);
                            let _ = stop_tx.send(true);
                        }
                    })
            };

            // Race first GC evidence against the fallback timeout.
            let evidence = tokio::select! {
                result = evidence_rx.wait_for(|seen| *seen) => result.is_ok(),
                () = tokio::time::sleep(GC_EVIDENCE_TIMEOUT) => false,
            };

            if evidence {
                // Live delivery started: wait for the matching GC to end so
                // the node/edge stream is complete before flushing.
                let _ = stop_rx.wait_for(|seen| *seen).await;
            } else {
                debug!("no GC evidence within timeout, proceeding to flush");
            }

            ctx.stop_session().await?;
            ctx.source().completed().await;

            // Buffered events delivered during the flush count; judge
            // completeness only now.
            if !data_seen.load(Ordering::Acquire) || !stop_seen.load(Ordering::Acquire) {
                return Err(Error::IncompleteData(
                    "GC dump did not observe both heap data and GC completion".to_string(),
                ));
            }

            let builder = std::mem::take(&mut *builder.lock().expect("builder lock"));
            *self.graph.lock().expect("graph lock") = Some(builder.finish());
            Ok(())
        })
    }
}

/// Build a GC dump pipeline over `provider`.
#[must_use]
pub fn gcdump_pipeline(
    provider: Arc<dyn DiagnosticSessionProvider>,
) -> Pipeline<EventSourcePipeline<GcDumpHandler>> {
    EventSourcePipeline::new(
        provider,
        GcDumpHandler {
            graph: Mutex::new(None),
        },
    )
    .into_pipeline()
}
