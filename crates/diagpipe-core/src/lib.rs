//! diagpipe-core: Core library for diagpipe
//!
//! This crate provides the core functionality for `dp`, a diagnostics
//! toolchain for managed-runtime processes: live event-stream sessions with
//! trigger evaluation, counter collection with Prometheus exposition, GC
//! heap dump correlation, and a diagnostic IPC proxy.
//!
//! # Architecture
//!
//! ```text
//! Target process ──► DiagnosticSessionProvider ──► EventSource
//!                                                     │
//!              Pipeline (run/stop/cleanup) ◄──────────┤
//!              ├── counters  ──► triggers ──► MetricsStore
//!              ├── gcdump    ──► HeapGraph
//!              ├── process_info
//!              ├── activity  ──► ActivityLogger fan-out
//!              └── trace     ──► EgressProvider
//!
//! Target runtime ◄──► SocketProxy / ProxyRunner ◄──► Tooling transport
//! ```
//!
//! # Modules
//!
//! - `pipeline`: Generic run/stop/cleanup lifecycle and stop tokens
//! - `event_source`: Event callback registry and session boundaries
//! - `event_pipeline`: Session-owning pipeline scaffolding
//! - `events`: Event records and counter payloads
//! - `sliding_window`: Rolling occurrence counter
//! - `triggers`: Counter threshold triggers
//! - `counters`: Counter collection pipeline
//! - `gcdump`: GC heap dump pipeline
//! - `process_info`: Command-line extraction pipeline
//! - `activity`: Activity trace fan-out pipeline
//! - `trace`: Raw trace egress pipeline
//! - `metrics_store`: Bounded history with Prometheus exposition
//! - `proxy`: Connected-proxy pump and multiplexing runner
//! - `transport`: TCP/Unix socket proxy transports
//! - `egress`: Artifact egress boundary
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod activity;
pub mod config;
pub mod counters;
pub mod egress;
pub mod error;
pub mod event_pipeline;
pub mod event_source;
pub mod events;
pub mod gcdump;
pub mod logging;
pub mod metrics_store;
pub mod pipeline;
pub mod process_info;
pub mod proxy;
pub mod sliding_window;
pub mod trace;
pub mod transport;
pub mod triggers;

pub use error::{Error, PipelineError, ProxyError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
