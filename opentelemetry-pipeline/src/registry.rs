//! Concurrent transaction-id → span-tree registry.
//!
//! The registry is explicitly constructed and injected (one per engine
//! instance) rather than reached through process-wide state, so tests get a
//! fresh instance each and teardown is a plain method call. All operations
//! are per-key atomic: first start wins, exactly one end succeeds, late
//! duplicate ends are no-ops.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::trace::{SpanBuilder, SpanContext, SpanRef, TraceId, Tracer};
use opentelemetry::{otel_debug, Context};

use crate::record::SpanRecord;
use crate::tree::SpanTree;

/// Owns every in-flight transaction's tree of active spans, keyed by
/// correlation id.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    transactions: DashMap<String, Arc<SpanTree>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        TransactionRegistry::default()
    }

    /// Begin a transaction rooted at a span built from `builder`.
    ///
    /// A start for an id already tracked under the same container name is
    /// a duplicate and changes nothing. The same id arriving under a
    /// *different* container name is a sub-pipeline invoked from an
    /// already-tracked request: a span for the container is attached under
    /// the existing root instead of starting a new transaction.
    pub fn start_transaction<T>(
        &self,
        record: &SpanRecord,
        builder: SpanBuilder,
        tracer: &T,
    ) -> SpanContext
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let container_name = record.name();
        match self.transactions.entry(record.transaction_id().to_string()) {
            Entry::Occupied(entry) => {
                let tree = entry.get().clone();
                drop(entry);
                if tree.container_name() == container_name {
                    otel_debug!(
                        name: "TransactionRegistry.Start.Duplicate",
                        transaction_id = format!("{}", record.transaction_id())
                    );
                    tree.root_span_context()
                } else {
                    tree.add_container_span(container_name, builder, tracer)
                }
            }
            Entry::Vacant(entry) => {
                let parent_cx = record.parent_context().cloned().unwrap_or_else(Context::new);
                let tree = Arc::new(SpanTree::new(
                    record.transaction_id(),
                    container_name,
                    &parent_cx,
                    builder,
                    tracer,
                ));
                let span_context = tree.root_span_context();
                entry.insert(tree);
                span_context
            }
        }
    }

    /// Add a processor span to the record's transaction, creating the tree
    /// rooted at this span when events arrived out of order.
    pub fn add_processor_span<T>(
        &self,
        container_name: &str,
        record: &SpanRecord,
        builder: SpanBuilder,
        tracer: &T,
    ) -> SpanContext
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let tree = match self.transactions.entry(record.transaction_id().to_string()) {
            Entry::Occupied(entry) => {
                let tree = entry.get().clone();
                drop(entry);
                tree
            }
            Entry::Vacant(entry) => {
                otel_debug!(
                    name: "TransactionRegistry.AddSpan.UntrackedTransaction",
                    transaction_id = format!("{}", record.transaction_id())
                );
                let parent_cx = record.parent_context().cloned().unwrap_or_else(Context::new);
                let tree = Arc::new(SpanTree::new(
                    record.transaction_id(),
                    container_name,
                    &parent_cx,
                    builder,
                    tracer,
                ));
                let span_context = tree.root_span_context();
                entry.insert(tree);
                return span_context;
            }
        };
        tree.add_span(container_name, record, builder, tracer)
    }

    /// End the span tracked for `record`'s location. Unknown transactions
    /// and unknown locations are no-ops.
    pub fn end_processor_span<F>(
        &self,
        record: &SpanRecord,
        finalizer: F,
        end_time: SystemTime,
    ) -> bool
    where
        F: FnOnce(&SpanRef<'_>),
    {
        let Some(tree) = self.tree_of(record.transaction_id()) else {
            otel_debug!(
                name: "TransactionRegistry.EndSpan.UnknownTransaction",
                transaction_id = format!("{}", record.transaction_id())
            );
            return false;
        };
        tree.end_span(record, finalizer, end_time)
    }

    /// Reconcile the branches of a fan-out step: cheap no-op for other
    /// records, otherwise every still-tracked branch is closed. Returns
    /// the latest branch end time observed for the record's route group.
    pub fn end_route_spans(
        &self,
        record: &SpanRecord,
        end_time: SystemTime,
    ) -> Option<SystemTime> {
        let tree = self.tree_of(record.transaction_id())?;
        tree.end_route_spans(record, end_time)
    }

    /// End a transaction, or the sub-container span of one.
    ///
    /// When `container_name` names the container the transaction was
    /// started under, the whole tree is removed atomically (exactly one of
    /// two racing ends wins) and every remaining span is closed. A
    /// different container name ends only that sub-container's span.
    pub fn end_transaction<F>(
        &self,
        container_name: &str,
        record: &SpanRecord,
        finalizer: F,
        end_time: SystemTime,
    ) -> bool
    where
        F: FnOnce(&SpanRef<'_>),
    {
        let Some(tree) = self.tree_of(record.transaction_id()) else {
            otel_debug!(
                name: "TransactionRegistry.EndTransaction.Unknown",
                transaction_id = format!("{}", record.transaction_id())
            );
            return false;
        };
        if tree.container_name() != container_name {
            return tree.finish_key(container_name, finalizer, end_time);
        }

        // remove-if-same-tree: a retry may have registered a fresh tree
        // under this id after we resolved ours
        let removed = self
            .transactions
            .remove_if(record.transaction_id(), |_, candidate| {
                Arc::ptr_eq(candidate, &tree)
            });
        match removed {
            Some((_, tree)) => {
                tree.end(finalizer, end_time);
                true
            }
            None => false,
        }
    }

    /// End every transaction still tracked. Part of engine teardown.
    pub fn shutdown(&self, end_time: SystemTime) {
        let ids: Vec<String> = self.transactions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, tree)) = self.transactions.remove(&id) {
                otel_debug!(
                    name: "TransactionRegistry.Shutdown.OpenTransaction",
                    transaction_id = format!("{id}")
                );
                tree.end(|_| {}, end_time);
            }
        }
    }

    /// Span context of the transaction's root span.
    pub fn root_span_context(&self, transaction_id: &str) -> Option<SpanContext> {
        self.tree_of(transaction_id)
            .map(|tree| tree.root_span_context())
    }

    /// Trace id the transaction's spans are recorded under.
    pub fn transaction_trace_id(&self, transaction_id: &str) -> Option<TraceId> {
        self.tree_of(transaction_id).map(|tree| tree.trace_id())
    }

    pub fn contains(&self, transaction_id: &str) -> bool {
        self.transactions.contains_key(transaction_id)
    }

    /// Number of transactions currently tracked.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Number of active child spans tracked for a transaction.
    pub fn active_spans(&self, transaction_id: &str) -> Option<usize> {
        self.tree_of(transaction_id).map(|tree| tree.active_spans())
    }

    fn tree_of(&self, transaction_id: &str) -> Option<Arc<SpanTree>> {
        self.transactions
            .get(transaction_id)
            .map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{SpanBuilder, TracerProvider as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use std::time::{Duration, UNIX_EPOCH};

    fn test_provider() -> (SdkTracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider, exporter)
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn start_then_end_leaves_no_residual_entry() {
        let (provider, exporter) = test_provider();
        let tracer = provider.tracer("test");
        let registry = TransactionRegistry::new();

        let record = SpanRecord::new("tx-1", "order-flow");
        registry.start_transaction(&record, SpanBuilder::from_name("order-flow"), &tracer);
        assert!(registry.contains("tx-1"));

        let ended =
            registry.end_transaction("order-flow", &record, |_| {}, at(10));
        assert!(ended);
        assert!(registry.is_empty());

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name.as_ref(), "order-flow");
    }

    #[test]
    fn processor_span_ends_exactly_once() {
        let (provider, exporter) = test_provider();
        let tracer = provider.tracer("test");
        let registry = TransactionRegistry::new();

        let root = SpanRecord::new("tx-1", "order-flow");
        registry.start_transaction(&root, SpanBuilder::from_name("order-flow"), &tracer);

        let mut step = SpanRecord::new("tx-1", "validate");
        step.set_location("order-flow/validate");
        step.set_event_context_id("E1");
        registry.add_processor_span(
            "order-flow",
            &step,
            SpanBuilder::from_name("validate"),
            &tracer,
        );
        assert_eq!(registry.active_spans("tx-1"), Some(1));

        assert!(registry.end_processor_span(&step, |_| {}, at(5)));
        // pipelines double-fire end notifications under error conditions
        assert!(!registry.end_processor_span(&step, |_| {}, at(6)));
        assert_eq!(registry.active_spans("tx-1"), Some(0));

        registry.end_transaction("order-flow", &root, |_| {}, at(10));
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        let step_span = spans.iter().find(|s| s.name.as_ref() == "validate").unwrap();
        assert_eq!(step_span.end_time, at(5));
    }

    #[test]
    fn duplicate_start_keeps_single_root() {
        let (provider, exporter) = test_provider();
        let tracer = provider.tracer("test");
        let registry = TransactionRegistry::new();

        let record = SpanRecord::new("tx-1", "order-flow");
        let first =
            registry.start_transaction(&record, SpanBuilder::from_name("order-flow"), &tracer);
        let second =
            registry.start_transaction(&record, SpanBuilder::from_name("order-flow"), &tracer);
        assert_eq!(first.span_id(), second.span_id());
        assert_eq!(registry.len(), 1);

        registry.end_transaction("order-flow", &record, |_| {}, at(10));
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
    }

    #[test]
    fn same_id_different_container_attaches_child() {
        let (provider, exporter) = test_provider();
        let tracer = provider.tracer("test");
        let registry = TransactionRegistry::new();

        let outer = SpanRecord::new("tx-1", "order-flow");
        let root_context =
            registry.start_transaction(&outer, SpanBuilder::from_name("order-flow"), &tracer);

        let inner = SpanRecord::new("tx-1", "enrich-flow");
        let child_context =
            registry.start_transaction(&inner, SpanBuilder::from_name("enrich-flow"), &tracer);
        assert_eq!(registry.len(), 1);
        assert_eq!(child_context.trace_id(), root_context.trace_id());

        // the sub-container end closes only its own span
        assert!(registry.end_transaction("enrich-flow", &inner, |_| {}, at(5)));
        assert!(registry.contains("tx-1"));

        registry.end_transaction("order-flow", &outer, |_| {}, at(10));
        assert!(registry.is_empty());

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        let child = spans.iter().find(|s| s.name.as_ref() == "enrich-flow").unwrap();
        assert_eq!(child.parent_span_id, root_context.span_id());
        assert_eq!(child.end_time, at(5));
    }

    #[test]
    fn out_of_order_processor_span_roots_the_transaction() {
        let (provider, _exporter) = test_provider();
        let tracer = provider.tracer("test");
        let registry = TransactionRegistry::new();

        let mut step = SpanRecord::new("tx-9", "validate");
        step.set_location("order-flow/validate");
        registry.add_processor_span(
            "order-flow",
            &step,
            SpanBuilder::from_name("validate"),
            &tracer,
        );
        assert!(registry.contains("tx-9"));
        assert_eq!(registry.active_spans("tx-9"), Some(0));
    }

    #[test]
    fn unknown_transaction_ends_are_silent() {
        let registry = TransactionRegistry::new();

        let record = SpanRecord::new("tx-missing", "order-flow");
        assert!(!registry.end_processor_span(&record, |_| {}, at(1)));
        assert!(!registry.end_transaction("order-flow", &record, |_| {}, at(1)));
        assert!(registry.end_route_spans(&record, at(1)).is_none());
    }

    #[test]
    fn transaction_exposes_trace_identity() {
        let (provider, _exporter) = test_provider();
        let tracer = provider.tracer("test");
        let registry = TransactionRegistry::new();

        let record = SpanRecord::new("tx-1", "order-flow");
        let root = registry.start_transaction(&record, SpanBuilder::from_name("order-flow"), &tracer);
        assert_eq!(registry.transaction_trace_id("tx-1"), Some(root.trace_id()));
        assert_eq!(
            registry.root_span_context("tx-1").map(|sc| sc.span_id()),
            Some(root.span_id())
        );
        registry.end_transaction("order-flow", &record, |_| {}, at(2));
        assert_eq!(registry.transaction_trace_id("tx-1"), None);
    }
}
