//! Per-transaction tree of active spans.
//!
//! Spans are keyed by their context-scoped location so that identical
//! structural locations reached through different concurrent nested
//! invocations stay distinguishable. Fan-out (router) constructs are
//! reconciled through a prefix index built at insertion time: every span
//! one or more scopes deep registers with the group of its trimmed context
//! prefix, so closing a router's branches is a direct lookup instead of a
//! scan over unrelated siblings.

use std::time::SystemTime;

use dashmap::DashMap;
use opentelemetry::trace::{
    Span, SpanBuilder, SpanContext, SpanRef, TraceContextExt, TraceId, Tracer,
};
use opentelemetry::{otel_debug, Context};

use crate::record::SpanRecord;

struct ActiveSpan {
    cx: Context,
    name: String,
    group_key: Option<String>,
}

#[derive(Default)]
struct RouteGroup {
    members: Vec<String>,
    latest_end: Option<SystemTime>,
}

/// The active (not yet ended) spans of one transaction.
///
/// The tree owns its child span handles until each is explicitly ended;
/// ending an unknown or already-ended key is a logged no-op because
/// pipelines double-fire end notifications under error conditions.
pub(crate) struct SpanTree {
    transaction_id: String,
    container_name: String,
    trace_id: TraceId,
    root: Context,
    start_time: SystemTime,
    spans: DashMap<String, ActiveSpan>,
    by_name: DashMap<String, String>,
    route_groups: DashMap<String, RouteGroup>,
}

impl std::fmt::Debug for SpanTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanTree")
            .field("transaction_id", &self.transaction_id)
            .field("container_name", &self.container_name)
            .field("trace_id", &self.trace_id)
            .field("start_time", &self.start_time)
            .field("active_spans", &self.spans.len())
            .finish()
    }
}

impl SpanTree {
    /// Start the transaction's root span and wrap it in a new tree.
    pub(crate) fn new<T>(
        transaction_id: &str,
        container_name: &str,
        parent_cx: &Context,
        builder: SpanBuilder,
        tracer: &T,
    ) -> Self
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let start_time = builder.start_time.unwrap_or_else(SystemTime::now);
        let span = builder.start_with_context(tracer, parent_cx);
        let trace_id = span.span_context().trace_id();
        let root = parent_cx.with_span(span);
        SpanTree {
            transaction_id: transaction_id.to_string(),
            container_name: container_name.to_string(),
            trace_id,
            root,
            start_time,
            spans: DashMap::new(),
            by_name: DashMap::new(),
            route_groups: DashMap::new(),
        }
    }

    pub(crate) fn container_name(&self) -> &str {
        &self.container_name
    }

    pub(crate) fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub(crate) fn root_span_context(&self) -> SpanContext {
        self.root.span().span_context().clone()
    }

    /// Number of active child spans, the root excluded.
    pub(crate) fn active_spans(&self) -> usize {
        self.spans.len()
    }

    /// Add a span for a nested sub-container invocation, parented to the
    /// root and addressable by the container's name.
    pub(crate) fn add_container_span<T>(
        &self,
        container_name: &str,
        builder: SpanBuilder,
        tracer: &T,
    ) -> SpanContext
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let span = builder.start_with_context(tracer, &self.root);
        let span_context = span.span_context().clone();
        let cx = self.root.with_span(span);
        self.spans.insert(
            container_name.to_string(),
            ActiveSpan {
                cx,
                name: container_name.to_string(),
                group_key: None,
            },
        );
        self.by_name
            .insert(container_name.to_string(), container_name.to_string());
        span_context
    }

    /// Add a processor span for `record`, keyed by its context-scoped
    /// location.
    ///
    /// Parent resolution, most specific first: the span one context scope
    /// up (a fan-out branch attaches to the router that spawned it), then a
    /// previously added span named `container_name`, then the root.
    pub(crate) fn add_span<T>(
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
        let location = record.location().unwrap_or_else(|| record.name());
        let key = record.context_scoped_path(location);
        let group_key = record.prev_context_scoped_path(location);

        let parent_cx = group_key
            .as_ref()
            .and_then(|scope_up| self.context_of(scope_up))
            .or_else(|| {
                let named = self.by_name.get(container_name).map(|k| k.value().clone());
                named.and_then(|named_key| self.context_of(&named_key))
            })
            .unwrap_or_else(|| self.root.clone());

        let span = builder.start_with_context(tracer, &parent_cx);
        let span_context = span.span_context().clone();
        let cx = parent_cx.with_span(span);

        if let Some(group) = &group_key {
            self.route_groups
                .entry(group.clone())
                .or_default()
                .members
                .push(key.clone());
        }
        self.by_name.insert(record.name().to_string(), key.clone());
        self.spans.insert(
            key,
            ActiveSpan {
                cx,
                name: record.name().to_string(),
                group_key,
            },
        );
        span_context
    }

    /// End the span tracked for `record`'s context-scoped location.
    /// Returns false when no such span is tracked.
    pub(crate) fn end_span<F>(
        &self,
        record: &SpanRecord,
        finalizer: F,
        end_time: SystemTime,
    ) -> bool
    where
        F: FnOnce(&SpanRef<'_>),
    {
        let location = record.location().unwrap_or_else(|| record.name());
        let key = record.context_scoped_path(location);
        self.finish_key(&key, finalizer, end_time)
    }

    pub(crate) fn finish_key<F>(&self, key: &str, finalizer: F, end_time: SystemTime) -> bool
    where
        F: FnOnce(&SpanRef<'_>),
    {
        let Some((key, active)) = self.spans.remove(key) else {
            otel_debug!(
                name: "SpanTree.EndSpan.NotTracked",
                transaction_id = format!("{}", self.transaction_id),
                key = format!("{key}")
            );
            return false;
        };
        self.by_name.remove_if(&active.name, |_, tracked| tracked == &key);

        let span = active.cx.span();
        finalizer(&span);
        span.end_with_timestamp(end_time);

        if let Some(group_key) = &active.group_key {
            if let Some(mut group) = self.route_groups.get_mut(group_key) {
                group.members.retain(|member| member != &key);
                group.latest_end =
                    Some(group.latest_end.map_or(end_time, |seen| seen.max(end_time)));
            }
        }
        true
    }

    /// Reconcile the branches of a fan-out step.
    ///
    /// Cheap no-op for anything that is not a fan-out record; a fan-out
    /// record without a structural location cannot be reconciled and
    /// short-circuits. Otherwise every still-tracked branch in the record's
    /// route group is closed at `end_time` and the latest branch end
    /// observed for the group is returned, so the router's own span can be
    /// closed at the tightest correct boundary.
    pub(crate) fn end_route_spans(
        &self,
        record: &SpanRecord,
        end_time: SystemTime,
    ) -> Option<SystemTime> {
        if !record.fan_out() {
            return None;
        }
        let Some(location) = record.location() else {
            otel_debug!(
                name: "SpanTree.RouteReconcile.NoLocation",
                transaction_id = format!("{}", self.transaction_id)
            );
            return None;
        };

        let bucket = record.context_scoped_path(location);
        let (_, group) = self.route_groups.remove(&bucket)?;

        let mut latest = group.latest_end;
        for member in group.members {
            // a sibling may be concurrently removed by its own end event
            if let Some((_, active)) = self.spans.remove(&member) {
                self.by_name
                    .remove_if(&active.name, |_, tracked| tracked == &member);
                active.cx.span().end_with_timestamp(end_time);
                latest = Some(latest.map_or(end_time, |seen| seen.max(end_time)));
            }
        }
        latest
    }

    /// End the whole tree: remaining children are closed best-effort, then
    /// the root.
    pub(crate) fn end<F>(&self, finalizer: F, end_time: SystemTime)
    where
        F: FnOnce(&SpanRef<'_>),
    {
        let remaining: Vec<String> = self.spans.iter().map(|entry| entry.key().clone()).collect();
        if !remaining.is_empty() {
            otel_debug!(
                name: "SpanTree.End.OpenChildren",
                transaction_id = format!("{}", self.transaction_id),
                count = remaining.len()
            );
        }
        for key in remaining {
            self.finish_key(&key, |_| {}, end_time);
        }
        self.route_groups.clear();

        let root = self.root.span();
        finalizer(&root);
        root.end_with_timestamp(end_time);
    }

    fn context_of(&self, key: &str) -> Option<Context> {
        self.spans.get(key).map(|active| active.cx.clone())
    }
}
