//! The notification surface consumed from the host pipeline.

use std::time::SystemTime;

use opentelemetry::trace::SpanKind;
use opentelemetry::Context;

/// Lifecycle actions observed from the host pipeline, with their stable
/// numeric codes. Both the event producer and the engine share this one
/// enumeration, so the two sides cannot drift apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventAction {
    ContainerStart,
    ContainerEnd,
    StepStart,
    StepEnd,
    AsyncScheduled,
    AsyncComplete,
}

impl EventAction {
    /// The action's numeric wire code.
    pub fn code(self) -> i32 {
        match self {
            EventAction::ContainerStart => 1,
            EventAction::ContainerEnd => 2,
            EventAction::StepStart => 3,
            EventAction::StepEnd => 4,
            EventAction::AsyncScheduled => 5,
            EventAction::AsyncComplete => 6,
        }
    }

    /// The action for a numeric wire code, if any.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(EventAction::ContainerStart),
            2 => Some(EventAction::ContainerEnd),
            3 => Some(EventAction::StepStart),
            4 => Some(EventAction::StepEnd),
            5 => Some(EventAction::AsyncScheduled),
            6 => Some(EventAction::AsyncComplete),
            _ => None,
        }
    }
}

/// One normalized lifecycle notification.
///
/// The host pipeline's notification mechanism is adapted into this shape
/// before it reaches the engine; only the correlation id, container name
/// and step name are mandatory.
#[derive(Clone, Debug)]
pub struct StepNotification {
    /// Correlation id of the logical request.
    pub transaction_id: String,
    /// Name of the container (flow, route) the step belongs to.
    pub container_name: String,
    /// Identity of the step itself.
    pub step_name: String,
    /// Structural path of the step within its container.
    pub location: Option<String>,
    /// Nested addressing context of the originating event.
    pub event_context_id: String,
    /// Kind recorded on the step's span.
    pub kind: SpanKind,
    /// Whether the step fans out into parallel branches.
    pub fan_out: bool,
    /// Steps sharing the same immediate container, when known.
    pub sibling_count: Option<u32>,
    /// Failure reported by the step, if any.
    pub error: Option<String>,
    /// Extra tags recorded as span attributes.
    pub tags: Vec<(String, String)>,
    /// Context extracted from an upstream carrier, for transactions
    /// continued across a boundary.
    pub remote_parent: Option<Context>,
    /// When the event happened; the engine's receive time otherwise.
    pub timestamp: Option<SystemTime>,
}

impl StepNotification {
    pub fn new(
        transaction_id: impl Into<String>,
        container_name: impl Into<String>,
        step_name: impl Into<String>,
    ) -> Self {
        StepNotification {
            transaction_id: transaction_id.into(),
            container_name: container_name.into(),
            step_name: step_name.into(),
            location: None,
            event_context_id: String::new(),
            kind: SpanKind::Internal,
            fan_out: false,
            sibling_count: None,
            error: None,
            tags: Vec::new(),
            remote_parent: None,
            timestamp: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_event_context_id(mut self, id: impl Into<String>) -> Self {
        self.event_context_id = id.into();
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_fan_out(mut self, fan_out: bool) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_sibling_count(mut self, count: u32) -> Self {
        self.sibling_count = Some(count);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_remote_parent(mut self, cx: Context) -> Self {
        self.remote_parent = Some(cx);
        self
    }

    pub fn with_timestamp(mut self, at: SystemTime) -> Self {
        self.timestamp = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_round_trip() {
        let actions = [
            EventAction::ContainerStart,
            EventAction::ContainerEnd,
            EventAction::StepStart,
            EventAction::StepEnd,
            EventAction::AsyncScheduled,
            EventAction::AsyncComplete,
        ];
        for action in actions {
            assert_eq!(EventAction::from_code(action.code()), Some(action));
        }
        assert_eq!(EventAction::from_code(0), None);
        assert_eq!(EventAction::from_code(7), None);
    }
}
