use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::Context;

/// Mutable metadata for one pipeline step instance.
///
/// A record is created (or recycled from the [`RecordPool`]) when a step
/// starts, carried by the host pipeline alongside the step, mutated by the
/// handler that observes the step's end event, and released once the
/// corresponding span has ended.
///
/// The step name and transaction id are fixed for one logical use of the
/// record; everything else is populated as the step progresses.
///
/// [`RecordPool`]: crate::pool::RecordPool
#[derive(Debug)]
pub struct SpanRecord {
    transaction_id: String,
    name: String,
    span_name: String,
    location: Option<String>,
    event_context_id: String,
    kind: SpanKind,
    fan_out: bool,
    sibling_count: Option<u32>,
    tags: HashMap<String, String>,
    parent_context: Option<Context>,
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    error_message: Option<String>,
    status: Status,
    borrowed_at: Option<Instant>,
}

impl SpanRecord {
    /// Create a fresh record for the given transaction and step name.
    pub fn new(transaction_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        SpanRecord {
            transaction_id: transaction_id.into(),
            span_name: name.clone(),
            name,
            location: None,
            event_context_id: String::new(),
            kind: SpanKind::Internal,
            fan_out: false,
            sibling_count: None,
            tags: HashMap::new(),
            parent_context: None,
            start_time: None,
            end_time: None,
            error_message: None,
            status: Status::Unset,
            borrowed_at: None,
        }
    }

    pub(crate) fn blank() -> Self {
        SpanRecord::new("", "")
    }

    /// Re-identify a recycled record and clear all mutable state.
    pub(crate) fn reset(&mut self, transaction_id: &str, name: &str) {
        self.clear();
        self.transaction_id.clear();
        self.transaction_id.push_str(transaction_id);
        self.name.clear();
        self.name.push_str(name);
        self.span_name.clear();
        self.span_name.push_str(name);
    }

    /// Clear everything populated during the record's active lifetime.
    pub(crate) fn clear(&mut self) {
        self.location = None;
        self.event_context_id.clear();
        self.kind = SpanKind::Internal;
        self.fan_out = false;
        self.sibling_count = None;
        self.tags.clear();
        self.parent_context = None;
        self.start_time = None;
        self.end_time = None;
        self.error_message = None;
        self.status = Status::Unset;
        self.borrowed_at = None;
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span_name(&self) -> &str {
        &self.span_name
    }

    pub fn set_span_name(&mut self, span_name: impl Into<String>) {
        self.span_name = span_name.into();
    }

    /// Structural path of the step within its container, if known.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn set_location(&mut self, location: impl Into<String>) {
        self.location = Some(location.into());
    }

    pub fn kind(&self) -> SpanKind {
        self.kind.clone()
    }

    pub fn set_kind(&mut self, kind: SpanKind) {
        self.kind = kind;
    }

    /// Whether the step is a fan-out (router) construct whose branches
    /// share this step's span as their parent.
    pub fn fan_out(&self) -> bool {
        self.fan_out
    }

    pub fn set_fan_out(&mut self, fan_out: bool) {
        self.fan_out = fan_out;
    }

    /// Number of steps sharing the same immediate container, if known.
    pub fn sibling_count(&self) -> Option<u32> {
        self.sibling_count
    }

    pub fn set_sibling_count(&mut self, count: Option<u32>) {
        self.sibling_count = count;
    }

    /// Set a string tag; the last write for a key wins.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }

    /// Propagation context the step's span should be parented to, when the
    /// transaction was continued from a remote carrier.
    pub fn parent_context(&self) -> Option<&Context> {
        self.parent_context.as_ref()
    }

    pub fn set_parent_context(&mut self, cx: Context) {
        self.parent_context = Some(cx);
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        self.start_time
    }

    pub fn set_start_time(&mut self, at: SystemTime) {
        self.start_time = Some(at);
    }

    pub fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }

    pub fn set_end_time(&mut self, at: SystemTime) {
        self.end_time = Some(at);
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub fn status(&self) -> Status {
        self.status.clone()
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// When the record was borrowed from the pool, if it is pooled.
    pub fn borrowed_at(&self) -> Option<Instant> {
        self.borrowed_at
    }

    pub(crate) fn mark_borrowed(&mut self, at: Instant) {
        self.borrowed_at = Some(at);
    }
}

/// Nested event-context addressing.
///
/// The event-context id is a primary id followed by zero or more
/// `_`-separated identity segments, one per nested scope the execution has
/// passed through. Trimming the last *k* segments yields the addressing
/// context of the ancestor *k* levels up. These operations run on every
/// span open and close, so they scan backwards for separators instead of
/// tokenizing the whole id.
impl SpanRecord {
    pub fn event_context_id(&self) -> &str {
        &self.event_context_id
    }

    pub fn set_event_context_id(&mut self, id: impl Into<String>) {
        self.event_context_id = id.into();
    }

    /// Number of `_`-separated segments, counting the primary id.
    pub fn context_nesting_level(&self) -> usize {
        if self.event_context_id.is_empty() {
            return 0;
        }
        self.event_context_id
            .bytes()
            .filter(|b| *b == b'_')
            .count()
            + 1
    }

    /// The time-ordered id of the originating request: everything before
    /// the first `_`, or the whole id when there is none.
    pub fn context_primary_id(&self) -> &str {
        match self.event_context_id.find('_') {
            Some(idx) => &self.event_context_id[..idx],
            None => &self.event_context_id,
        }
    }

    /// Full-depth addressing key for `path`.
    pub fn context_scoped_path(&self, path: &str) -> String {
        let mut key =
            String::with_capacity(self.event_context_id.len() + path.len() + 1);
        key.push_str(&self.event_context_id);
        key.push('/');
        key.push_str(path);
        key
    }

    /// Addressing key for `path` with the last `trim` segments removed.
    /// Trimming past the primary id collapses to the primary id.
    pub fn context_scoped_path_trimmed(&self, path: &str, trim: usize) -> String {
        let prefix = trim_segments(&self.event_context_id, trim);
        let mut key = String::with_capacity(prefix.len() + path.len() + 1);
        key.push_str(prefix);
        key.push('/');
        key.push_str(path);
        key
    }

    /// Addressing key for `path` one nesting level up, or `None` when the
    /// context is already at the primary id.
    pub fn prev_context_scoped_path(&self, path: &str) -> Option<String> {
        if !self.event_context_id.contains('_') {
            return None;
        }
        Some(self.context_scoped_path_trimmed(path, 1))
    }
}

/// Derive the event-context id of a nested scope: entering a sub-container
/// appends one identity segment.
pub fn nested_context_id(parent: &str, scope: &str) -> String {
    let mut id = String::with_capacity(parent.len() + scope.len() + 1);
    id.push_str(parent);
    id.push('_');
    id.push_str(scope);
    id
}

/// Drop the last `trim` `_`-separated segments, scanning from the end.
fn trim_segments(id: &str, trim: usize) -> &str {
    let bytes = id.as_bytes();
    let mut end = id.len();
    for _ in 0..trim {
        match bytes[..end].iter().rposition(|b| *b == b'_') {
            Some(idx) => end = idx,
            None => break,
        }
    }
    &id[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEEP_ID: &str =
        "58660cf1-04ff-4fb7-a197-60475db64_493033029_784814100_894835844_515059234";

    #[test]
    fn nesting_level_counts_all_segments() {
        let mut record = SpanRecord::new("tx", "step");
        record.set_event_context_id(DEEP_ID);
        assert_eq!(record.context_nesting_level(), 5);
        assert_eq!(
            record.context_primary_id(),
            "58660cf1-04ff-4fb7-a197-60475db64"
        );

        record.set_event_context_id("A_1_2_3_4");
        assert_eq!(record.context_nesting_level(), 5);
        assert_eq!(record.context_primary_id(), "A");

        record.set_event_context_id("A");
        assert_eq!(record.context_nesting_level(), 1);
        assert_eq!(record.context_primary_id(), "A");

        record.set_event_context_id("");
        assert_eq!(record.context_nesting_level(), 0);
    }

    #[test]
    fn trimmed_paths_shrink_one_segment_at_a_time() {
        let mut record = SpanRecord::new("tx", "step");
        record.set_event_context_id(DEEP_ID);

        let full = record.context_scoped_path("p/1");
        assert_eq!(full, format!("{DEEP_ID}/p/1"));
        assert_eq!(record.context_scoped_path_trimmed("p/1", 0), full);

        let mut previous = full;
        for trim in 1..=4 {
            let shorter = record.context_scoped_path_trimmed("p/1", trim);
            assert!(shorter.len() < previous.len());
            assert!(previous.starts_with(shorter.trim_end_matches("/p/1")));
            previous = shorter;
        }
        assert_eq!(
            record.context_scoped_path_trimmed("p/1", 3),
            "58660cf1-04ff-4fb7-a197-60475db64_493033029/p/1"
        );
        // trimming at or past the trailing-segment count collapses to the
        // primary id
        for trim in [4, 5, 100] {
            assert_eq!(
                record.context_scoped_path_trimmed("p/1", trim),
                "58660cf1-04ff-4fb7-a197-60475db64/p/1"
            );
        }
    }

    #[test]
    fn prev_path_stops_at_primary() {
        let mut record = SpanRecord::new("tx", "step");
        record.set_event_context_id("A_1");
        assert_eq!(record.prev_context_scoped_path("loc").as_deref(), Some("A/loc"));

        record.set_event_context_id("A");
        assert_eq!(record.prev_context_scoped_path("loc"), None);
    }

    #[test]
    fn nested_id_appends_one_segment() {
        let child = nested_context_id("A_1", "42");
        assert_eq!(child, "A_1_42");
        let mut record = SpanRecord::new("tx", "step");
        record.set_event_context_id(child);
        assert_eq!(record.context_nesting_level(), 3);
    }

    #[test]
    fn reset_clears_mutable_state() {
        let mut record = SpanRecord::new("tx-1", "step-a");
        record.set_tag("component", "http");
        record.set_end_time(SystemTime::now());
        record.set_status(Status::error("boom"));
        record.set_location("flow/step-a");

        record.reset("tx-2", "step-b");
        assert_eq!(record.transaction_id(), "tx-2");
        assert_eq!(record.name(), "step-b");
        assert_eq!(record.span_name(), "step-b");
        assert!(record.tags().is_empty());
        assert!(record.end_time().is_none());
        assert!(record.location().is_none());
        assert_eq!(record.status(), Status::Unset);
    }
}
