//! The facade the host pipeline's event adapter drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use opentelemetry::trace::{SpanBuilder, SpanKind, SpanRef, Status, Tracer};
use opentelemetry::{otel_debug, KeyValue};

use crate::error::Error;
use crate::event::{EventAction, StepNotification};
use crate::pool::{PoolConfig, PoolStats, RecordPool};
use crate::propagation;
use crate::record::SpanRecord;
use crate::registry::TransactionRegistry;

/// Span attribute carrying the transaction's correlation id.
pub const TRANSACTION_ID_KEY: &str = "pipeline.transaction.id";
/// Span attribute carrying the step's structural location.
pub const STEP_LOCATION_KEY: &str = "pipeline.step.location";
/// Span attribute carrying the step's sibling count, when known.
pub const SIBLING_COUNT_KEY: &str = "pipeline.step.siblings";

/// Turns pipeline lifecycle notifications into OpenTelemetry spans.
///
/// One instance per host engine: it owns the transaction registry and the
/// record pool, and builds spans through the tracer it was constructed
/// with. Start notifications hand out a [`SpanRecord`] which the caller
/// carries alongside the step and passes back with the matching end
/// notification.
pub struct PipelineTracer<T: Tracer> {
    tracer: T,
    registry: Arc<TransactionRegistry>,
    pool: RecordPool,
    is_shutdown: AtomicBool,
}

impl<T: Tracer> std::fmt::Debug for PipelineTracer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineTracer")
            .field("transactions", &self.registry.len())
            .field("pool", &self.pool)
            .finish()
    }
}

impl<T> PipelineTracer<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    pub fn new(tracer: T) -> Self {
        PipelineTracer::with_pool_config(tracer, PoolConfig::default())
    }

    pub fn with_pool_config(tracer: T, config: PoolConfig) -> Self {
        PipelineTracer {
            tracer,
            registry: Arc::new(TransactionRegistry::new()),
            pool: RecordPool::new(config),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// The registry tracking this engine's in-flight transactions.
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Counters of the record pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Dispatch one notification by action. Start actions return the
    /// record the caller must carry to the matching end notification; end
    /// actions consume it.
    pub fn on_event(
        &self,
        action: EventAction,
        event: &StepNotification,
        record: Option<SpanRecord>,
    ) -> Option<SpanRecord> {
        match action {
            EventAction::ContainerStart => Some(self.container_start(event)),
            EventAction::StepStart => Some(self.step_start(event)),
            EventAction::AsyncScheduled => Some(self.async_scheduled(event)),
            EventAction::ContainerEnd | EventAction::StepEnd | EventAction::AsyncComplete => {
                let Some(record) = record else {
                    otel_debug!(
                        name: "PipelineTracer.Event.MissingRecord",
                        action = format!("{action:?}")
                    );
                    return None;
                };
                if action == EventAction::ContainerEnd {
                    self.container_end(record, event);
                } else {
                    self.step_end(record, event);
                }
                None
            }
        }
    }

    /// A container (top-level or nested flow) began processing the
    /// transaction.
    pub fn container_start(&self, event: &StepNotification) -> SpanRecord {
        let at = event.timestamp.unwrap_or_else(SystemTime::now);
        let mut record = self.pool.acquire(
            &event.transaction_id,
            &event.container_name,
            event.location.as_deref(),
        );
        populate(&mut record, event);
        record.set_start_time(at);

        let builder = span_builder(&record, at);
        self.registry
            .start_transaction(&record, builder, &self.tracer);
        record
    }

    /// The container finished; ends the transaction (or the nested
    /// sub-container's span) and returns the record to the pool.
    pub fn container_end(&self, mut record: SpanRecord, event: &StepNotification) {
        let at = event.timestamp.unwrap_or_else(SystemTime::now);
        merge_end(&mut record, event, at);
        self.registry
            .end_transaction(&event.container_name, &record, |span| finalize(span, &record), at);
        self.pool.release(record);
    }

    /// A processor step started.
    pub fn step_start(&self, event: &StepNotification) -> SpanRecord {
        let at = event.timestamp.unwrap_or_else(SystemTime::now);
        let mut record = self.pool.acquire(
            &event.transaction_id,
            &event.step_name,
            event.location.as_deref(),
        );
        populate(&mut record, event);
        record.set_start_time(at);

        let builder = span_builder(&record, at);
        self.registry
            .add_processor_span(&event.container_name, &record, builder, &self.tracer);
        record
    }

    /// The step finished. Fan-out steps reconcile their branches first so
    /// the router's span closes at the latest branch end; then the step's
    /// own span is finalized, ended, and the record returned to the pool.
    pub fn step_end(&self, mut record: SpanRecord, event: &StepNotification) {
        let at = event.timestamp.unwrap_or_else(SystemTime::now);
        merge_end(&mut record, event, at);

        let route_end = self.registry.end_route_spans(&record, at);
        let end_at = route_end.map_or(at, |latest| latest.max(at));
        record.set_end_time(end_at);

        self.registry
            .end_processor_span(&record, |span| finalize(span, &record), end_at);
        self.pool.release(record);
    }

    /// A step handed its work to another thread. The span stays open until
    /// [`async_complete`](Self::async_complete); unless the notification
    /// says otherwise it is recorded as a producer span.
    pub fn async_scheduled(&self, event: &StepNotification) -> SpanRecord {
        if event.kind == SpanKind::Internal {
            let mut event = event.clone();
            event.kind = SpanKind::Producer;
            self.step_start(&event)
        } else {
            self.step_start(event)
        }
    }

    /// The scheduled work finished, possibly on another thread.
    pub fn async_complete(&self, record: SpanRecord, event: &StepNotification) {
        self.step_end(record, event);
    }

    /// The propagation map for a transaction; see
    /// [`propagation::transaction_context`].
    pub fn transaction_context(&self, transaction_id: &str) -> Option<HashMap<String, String>> {
        propagation::transaction_context(&self.registry, transaction_id)
    }

    /// Tear the engine down: close every transaction still open and stop
    /// the pool sweeper.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyShutdown);
        }
        self.registry.shutdown(SystemTime::now());
        self.pool.shutdown()
    }
}

fn span_builder(record: &SpanRecord, at: SystemTime) -> SpanBuilder {
    SpanBuilder::from_name(record.span_name().to_string())
        .with_kind(record.kind())
        .with_start_time(at)
        .with_attributes(base_attributes(record))
}

fn base_attributes(record: &SpanRecord) -> Vec<KeyValue> {
    let mut attributes = vec![KeyValue::new(
        TRANSACTION_ID_KEY,
        record.transaction_id().to_string(),
    )];
    if let Some(location) = record.location() {
        attributes.push(KeyValue::new(STEP_LOCATION_KEY, location.to_string()));
    }
    attributes
}

fn populate(record: &mut SpanRecord, event: &StepNotification) {
    record.set_event_context_id(event.event_context_id.clone());
    record.set_kind(event.kind.clone());
    record.set_fan_out(event.fan_out);
    record.set_sibling_count(event.sibling_count);
    for (key, value) in &event.tags {
        record.set_tag(key.clone(), value.clone());
    }
    if let Some(error) = &event.error {
        record.set_error_message(error.clone());
    }
    if let Some(parent) = &event.remote_parent {
        record.set_parent_context(parent.clone());
    }
}

fn merge_end(record: &mut SpanRecord, event: &StepNotification, at: SystemTime) {
    record.set_end_time(at);
    for (key, value) in &event.tags {
        record.set_tag(key.clone(), value.clone());
    }
    if let Some(error) = &event.error {
        record.set_error_message(error.clone());
        record.set_status(Status::error(error.clone()));
    }
}

/// Apply the record's collected state to the span right before it ends.
/// Failures observed by the pipeline are data here: they become the span's
/// status and an exception event, never control flow.
fn finalize(span: &SpanRef<'_>, record: &SpanRecord) {
    for (key, value) in record.tags() {
        span.set_attribute(KeyValue::new(key.clone(), value.clone()));
    }
    if let Some(count) = record.sibling_count() {
        span.set_attribute(KeyValue::new(SIBLING_COUNT_KEY, count as i64));
    }
    if let Some(message) = record.error_message() {
        span.add_event(
            "exception",
            vec![KeyValue::new("exception.message", message.to_string())],
        );
        span.set_status(Status::error(message.to_string()));
    } else if record.status() != Status::Unset {
        span.set_status(record.status());
    }
}
