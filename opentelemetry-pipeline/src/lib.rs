//! Span-tree assembly for pipeline execution engines.
//!
//! A pipeline engine reports lifecycle events (step start/end, async
//! scheduling, container start/end) asynchronously, out of order and from
//! many worker threads. This crate correlates those events into one
//! transaction per correlation id, maintains the tree of active spans for
//! each transaction, reconciles fan-out constructs whose parallel branches
//! finish independently, and closes every span exactly once through
//! whatever [`TracerProvider`] the application has configured.
//!
//! [`TracerProvider`]: opentelemetry::trace::TracerProvider
//!
//! ## Getting Started
//!
//! ```no_run
//! use opentelemetry::global;
//! use opentelemetry_pipeline::{PipelineTracer, StepNotification};
//!
//! // One engine per host pipeline, built on the globally configured
//! // tracer provider.
//! let engine = PipelineTracer::new(global::tracer("pipeline"));
//!
//! // The adapter translates host notifications into StepNotifications.
//! let started = StepNotification::new("tx-1", "order-flow", "order-flow");
//! let flow = engine.container_start(&started);
//!
//! let step = StepNotification::new("tx-1", "order-flow", "validate")
//!     .with_location("order-flow/validate");
//! let record = engine.step_start(&step);
//!
//! // ... the step runs, possibly on another thread ...
//!
//! engine.step_end(record, &step);
//! engine.container_end(flow, &started);
//!
//! // Trace context for downstream request headers.
//! let headers = engine.transaction_context("tx-1");
//!
//! engine.shutdown().unwrap();
//! ```
//!
//! ## Overview
//!
//! * [`PipelineTracer`] is the entry point the host's event adapter
//!   drives; start events hand out a [`SpanRecord`] that travels with the
//!   step and comes back on the matching end event.
//! * [`TransactionRegistry`] maps correlation ids to their trees of active
//!   spans; all of its operations are per-key atomic, so events for one
//!   transaction may arrive on any thread in any order.
//! * [`RecordPool`] recycles the per-step metadata records and reclaims
//!   the ones whose end event never came.
//! * [`propagation`] extracts and injects trace context through the
//!   globally configured propagator and derives the per-transaction
//!   context map (including numeric id encodings).

#![warn(missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod engine;
mod error;
mod registry;
mod tree;

pub mod event;
pub mod pool;
pub mod propagation;
pub mod record;

pub use engine::{
    PipelineTracer, SIBLING_COUNT_KEY, STEP_LOCATION_KEY, TRANSACTION_ID_KEY,
};
pub use error::Error;
pub use event::{EventAction, StepNotification};
pub use pool::{PoolConfig, PoolConfigBuilder, PoolStats, RecordPool};
pub use record::{nested_context_id, SpanRecord};
pub use registry::TransactionRegistry;
