//! Trace-context propagation across process and sub-pipeline boundaries.
//!
//! All format-specific work is delegated to the globally configured
//! [`TextMapPropagator`]; this module only adds the per-transaction context
//! map the host pipeline embeds into downstream request headers, including
//! numeric encodings of the trace and span ids for carriers that cannot
//! transport hex strings.

use std::collections::HashMap;

use opentelemetry::global;
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;

use crate::registry::TransactionRegistry;

/// Hex trace id, as carried by the propagation format.
pub const TRACE_ID_FIELD: &str = "trace-id";
/// Hex span id of the transaction's root span.
pub const SPAN_ID_FIELD: &str = "span-id";
/// Decimal encoding of the low 64 bits of the trace id.
pub const TRACE_ID_NUMERIC_FIELD: &str = "trace-id-numeric";
/// Decimal encoding of the span id.
pub const SPAN_ID_NUMERIC_FIELD: &str = "span-id-numeric";

/// Extract a context from a carrier with the configured propagator.
pub fn extract(extractor: &dyn Extractor) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(extractor))
}

/// Inject a context into a carrier with the configured propagator.
pub fn inject(cx: &Context, injector: &mut dyn Injector) {
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, injector))
}

/// The propagation map for a tracked transaction: the configured
/// propagator's fields plus the trace/span ids in hex and decimal form.
/// `None` when the transaction is not (or no longer) tracked.
pub fn transaction_context(
    registry: &TransactionRegistry,
    transaction_id: &str,
) -> Option<HashMap<String, String>> {
    let span_context = registry.root_span_context(transaction_id)?;
    let trace_id_hex = format!(
        "{:032x}",
        u128::from_be_bytes(span_context.trace_id().to_bytes())
    );
    let span_id_hex = format!(
        "{:016x}",
        u64::from_be_bytes(span_context.span_id().to_bytes())
    );

    let mut fields = HashMap::new();
    let cx = Context::new().with_remote_span_context(span_context);
    global::get_text_map_propagator(|propagator| propagator.inject_context(&cx, &mut fields));
    insert_id_fields(&mut fields, &trace_id_hex, &span_id_hex);
    Some(fields)
}

/// Add the hex ids and, when the hex is well-formed, their decimal
/// encodings. Malformed hex omits the numeric field rather than failing.
fn insert_id_fields(fields: &mut HashMap<String, String>, trace_id_hex: &str, span_id_hex: &str) {
    if let Some(numeric) = numeric_trace_id(trace_id_hex) {
        fields.insert(TRACE_ID_NUMERIC_FIELD.to_string(), numeric.to_string());
    }
    if let Some(numeric) = numeric_span_id(span_id_hex) {
        fields.insert(SPAN_ID_NUMERIC_FIELD.to_string(), numeric.to_string());
    }
    fields.insert(TRACE_ID_FIELD.to_string(), trace_id_hex.to_string());
    fields.insert(SPAN_ID_FIELD.to_string(), span_id_hex.to_string());
}

/// Low 64 bits of a hex trace id as an integer, for systems that cannot
/// carry the full 128-bit id. `None` for malformed hex.
pub fn numeric_trace_id(hex: &str) -> Option<u64> {
    if !is_hex(hex, 32) {
        return None;
    }
    u128::from_str_radix(hex, 16).ok().map(|id| id as u64)
}

/// A hex span id as an integer. `None` for malformed hex.
pub fn numeric_span_id(hex: &str) -> Option<u64> {
    if !is_hex(hex, 16) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

fn is_hex(value: &str, max_len: usize) -> bool {
    !value.is_empty()
        && value.len() <= max_len
        && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SpanRecord;
    use opentelemetry::trace::{SpanBuilder, TracerProvider as _};
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    #[test]
    fn numeric_encodings_validate_hex() {
        assert_eq!(numeric_span_id("ff"), Some(255));
        assert_eq!(numeric_span_id("00f0"), Some(240));
        assert_eq!(numeric_trace_id("00000000000000000000000000000010"), Some(16));
        // high 64 bits are discarded
        assert_eq!(
            numeric_trace_id("00000000000000010000000000000002"),
            Some(2)
        );

        assert_eq!(numeric_trace_id(""), None);
        assert_eq!(numeric_trace_id("zz"), None);
        assert_eq!(numeric_trace_id("+10"), None);
        assert_eq!(numeric_span_id("00112233445566778899"), None);
        assert_eq!(
            numeric_trace_id("000000000000000000000000000000101"),
            None
        );
    }

    #[test]
    fn malformed_hex_omits_numeric_fields_only() {
        let mut fields = HashMap::new();
        insert_id_fields(&mut fields, "not-hex-at-all", "00f067aa0ba902b7");
        assert!(!fields.contains_key(TRACE_ID_NUMERIC_FIELD));
        assert_eq!(
            fields.get(TRACE_ID_FIELD).map(String::as_str),
            Some("not-hex-at-all")
        );
        assert_eq!(
            fields.get(SPAN_ID_NUMERIC_FIELD).map(String::as_str),
            Some("67667974448284343")
        );
    }

    #[test]
    fn transaction_context_carries_propagation_and_id_fields() {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter)
            .build();
        let tracer = provider.tracer("test");

        let registry = TransactionRegistry::new();
        let record = SpanRecord::new("tx-1", "order-flow");
        let root =
            registry.start_transaction(&record, SpanBuilder::from_name("order-flow"), &tracer);

        let fields = transaction_context(&registry, "tx-1").unwrap();
        let trace_id_hex = format!("{:032x}", u128::from_be_bytes(root.trace_id().to_bytes()));
        let span_id_hex = format!("{:016x}", u64::from_be_bytes(root.span_id().to_bytes()));
        assert_eq!(fields.get(TRACE_ID_FIELD), Some(&trace_id_hex));
        assert_eq!(fields.get(SPAN_ID_FIELD), Some(&span_id_hex));
        let expected_numeric =
            (u128::from_be_bytes(root.trace_id().to_bytes()) as u64).to_string();
        assert_eq!(fields.get(TRACE_ID_NUMERIC_FIELD), Some(&expected_numeric));
        let traceparent = fields.get("traceparent").expect("w3c field");
        assert!(traceparent.contains(&trace_id_hex));

        assert!(transaction_context(&registry, "tx-unknown").is_none());
    }

    #[test]
    fn extract_and_inject_round_trip_through_carrier() {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );

        let cx = extract(&carrier);
        let span_context = cx.span().span_context().clone();
        assert!(span_context.is_valid());
        assert!(span_context.is_remote());

        let mut out: HashMap<String, String> = HashMap::new();
        inject(&cx, &mut out);
        assert_eq!(out.get("traceparent"), carrier.get("traceparent"));
    }
}
