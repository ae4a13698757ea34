use apm_agent_core::config::TraceContinuationStrategy;
use apm_agent_core::propagation::{HeaderList, MapHeaders, TRACESTATE_HEADER_NAME, TRACE_PARENT_HEADER_NAME};
use apm_agent_core::report::InMemoryReporter;
use apm_agent_core::trace::{ConstantSampler, SpanId, SpanLink, TraceId, Tracer};
use apm_agent_core::Config;
use rstest::rstest;
use std::collections::HashMap;

const INCOMING_TRACE_ID: TraceId = TraceId::from_bytes([
    0x0a, 0xf7, 0x65, 0x19, 0x16, 0xcd, 0x43, 0xdd, 0x84, 0x48, 0xeb, 0x21, 0x1c, 0x80, 0x31, 0x9c,
]);
const INCOMING_PARENT_ID: SpanId = SpanId::from_bytes([0xb7, 0xad, 0x6b, 0x71, 0x69, 0x20, 0x33, 0x31]);
const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

fn tracer(strategy: TraceContinuationStrategy) -> (Tracer, InMemoryReporter) {
    let reporter = InMemoryReporter::default();
    let tracer = Tracer::builder()
        .with_config(Config::builtin().with_trace_continuation_strategy(strategy))
        .with_reporter(reporter.clone())
        .with_sampler(ConstantSampler::always_on())
        .build();
    (tracer, reporter)
}

fn headers(tracestate: Option<&str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(TRACE_PARENT_HEADER_NAME.to_string(), TRACEPARENT.to_string());
    if let Some(tracestate) = tracestate {
        headers.insert(TRACESTATE_HEADER_NAME.to_string(), tracestate.to_string());
    }
    headers
}

#[rustfmt::skip]
#[rstest]
#[case::continue_foreign(TraceContinuationStrategy::Continue, None, false)]
#[case::continue_own(TraceContinuationStrategy::Continue, Some("es=s:0.5"), false)]
#[case::restart_foreign(TraceContinuationStrategy::Restart, None, true)]
#[case::restart_own(TraceContinuationStrategy::Restart, Some("es=s:0.5"), true)]
#[case::restart_external_foreign(TraceContinuationStrategy::RestartExternal, Some("other=1"), true)]
#[case::restart_external_own(TraceContinuationStrategy::RestartExternal, Some("other=1,es=s:0.5"), false)]
fn continuation_strategies(
    #[case] strategy: TraceContinuationStrategy,
    #[case] tracestate: Option<&str>,
    #[case] restarted: bool,
) {
    let (tracer, reporter) = tracer(strategy);
    let transaction = tracer.start_child_transaction(&headers(tracestate), &MapHeaders, None);
    transaction.end();

    let data = &reporter.transactions()[0];
    if restarted {
        assert_ne!(data.trace_id, INCOMING_TRACE_ID);
        assert!(data.parent_id.is_empty());
        assert_eq!(
            data.span_links,
            vec![SpanLink {
                trace_id: INCOMING_TRACE_ID,
                span_id: INCOMING_PARENT_ID,
            }]
        );
    } else {
        assert_eq!(data.trace_id, INCOMING_TRACE_ID);
        assert_eq!(data.parent_id, INCOMING_PARENT_ID);
        assert!(data.span_links.is_empty());
    }
}

#[test]
fn continued_sample_rate_comes_from_tracestate() {
    let (tracer, reporter) = tracer(TraceContinuationStrategy::Continue);
    let transaction = tracer.start_child_transaction(&headers(Some("es=s:0.5")), &MapHeaders, None);
    transaction.end();
    assert_eq!(reporter.transactions()[0].sample_rate, Some(0.5));
}

#[rstest]
#[case::missing(None)]
#[case::garbage(Some("not a traceparent"))]
#[case::zero_trace_id(Some("00-00000000000000000000000000000000-b7ad6b7169203331-01"))]
#[case::zero_parent_id(Some("00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01"))]
fn invalid_headers_start_a_new_trace(#[case] traceparent: Option<&str>) {
    let (tracer, reporter) = tracer(TraceContinuationStrategy::Continue);
    let mut headers = HashMap::new();
    if let Some(traceparent) = traceparent {
        headers.insert(TRACE_PARENT_HEADER_NAME.to_string(), traceparent.to_string());
    }
    let transaction = tracer.start_child_transaction(&headers, &MapHeaders, None);
    transaction.end();

    let data = &reporter.transactions()[0];
    assert!(!data.trace_id.is_empty());
    assert_ne!(data.trace_id, INCOMING_TRACE_ID);
    assert!(data.parent_id.is_empty());
    assert!(data.sampled);
}

#[test]
fn multiple_tracestate_headers_are_joined() {
    let (tracer, _) = tracer(TraceContinuationStrategy::Continue);
    let headers = vec![
        (TRACE_PARENT_HEADER_NAME.to_string(), TRACEPARENT.to_string()),
        (TRACESTATE_HEADER_NAME.to_string(), "a=1".to_string()),
        (TRACESTATE_HEADER_NAME.to_string(), "es=s:0.25,b=2".to_string()),
    ];
    let transaction = tracer.start_child_transaction(&headers, &HeaderList, None);
    let outgoing = transaction.trace_context().outgoing_trace_state();
    assert_eq!(outgoing.as_deref(), Some("a=1,es=s:0.25,b=2"));
    transaction.end();
}

#[test]
fn propagation_round_trip_through_a_downstream_service() {
    let (upstream, _) = tracer(TraceContinuationStrategy::Continue);
    let (downstream, reporter) = tracer(TraceContinuationStrategy::Continue);

    let transaction = upstream.start_root_transaction(None);
    let trace_id = transaction.trace_id();
    let call = transaction.create_span();
    let mut outgoing: HashMap<String, String> = HashMap::new();
    call.propagate_trace_context(&mut outgoing, &MapHeaders);

    let remote = downstream.start_child_transaction(&outgoing, &MapHeaders, None);
    remote.end();
    call.end();
    transaction.end();

    let data = &reporter.transactions()[0];
    assert_eq!(data.trace_id, trace_id);
    assert_eq!(data.parent_id, call_id(&outgoing));
}

fn call_id(headers: &HashMap<String, String>) -> SpanId {
    let header = &headers[TRACE_PARENT_HEADER_NAME];
    SpanId::from_hex(&header[36..52]).expect("span id in traceparent")
}
