use apm_agent_core::report::InMemoryReporter;
use apm_agent_core::trace::{AbstractSpan, ActiveStack, ConstantSampler, Span, Tracer, Transaction};
use apm_agent_core::Config;
use std::sync::mpsc;
use std::thread;

fn tracer(config: Config) -> (Tracer, InMemoryReporter) {
    let reporter = InMemoryReporter::default();
    let tracer = Tracer::builder()
        .with_config(config)
        .with_reporter(reporter.clone())
        .with_sampler(ConstantSampler::always_on())
        .build();
    (tracer, reporter)
}

#[test]
fn every_entity_returns_to_its_pool_once() {
    let (tracer, reporter) = tracer(Config::builtin());
    let mut stack = ActiveStack::new(&tracer);
    let transaction = stack.start_root_transaction(None);

    let spans: Vec<Span> = (0..4).map(|_| transaction.create_span()).collect();
    let nested = spans[0].create_span();
    {
        let _scope = stack.scope(&nested);
        let error = std::io::Error::new(std::io::ErrorKind::Other, "timeout");
        assert!(nested.capture_exception(&error).is_some());
    }
    nested.end();
    for span in &spans {
        span.end();
    }
    stack.deactivate(&AbstractSpan::from(&transaction));
    transaction.end();

    assert_eq!(reporter.spans().len(), 5);
    let data = &reporter.transactions()[0];
    assert_eq!(data.span_count.started, 5);
    assert_eq!(data.span_count.reported, 5);

    let stats = tracer.pool_stats();
    assert_eq!(stats.transactions.recycled, 1);
    assert_eq!(stats.spans.recycled, 5);
    assert_eq!(stats.errors.recycled, 1);
    assert_eq!(stats.spans.size, stats.spans.objects_created);
}

#[test]
fn children_may_end_on_other_threads() {
    let (tracer, reporter) = tracer(Config::builtin().with_span_compression_enabled(false));
    let transaction = tracer.start_root_transaction(None);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let transaction = transaction.clone();
            thread::spawn(move || {
                let span = transaction.create_span();
                span.set_name(&format!("work {i}"), apm_agent_core::trace::PRIORITY_USER_SUPPLIED);
                let child = span.create_span();
                child.end();
                span.end();
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }
    transaction.end();

    assert_eq!(reporter.spans().len(), 16);
    let data = &reporter.transactions()[0];
    assert_eq!(data.span_count.started, 16);
    assert_eq!(data.span_count.started, data.span_count.reported + data.span_count.dropped);
    assert_eq!(tracer.pool_stats().transactions.size, 1);
    assert_eq!(tracer.pool_stats().spans.size, tracer.pool_stats().spans.objects_created);
}

#[test]
fn siblings_compress_while_ending_on_other_threads() {
    const THREADS: u32 = 8;
    const SPANS_PER_THREAD: u32 = 50;
    let (tracer, reporter) = tracer(Config::builtin());
    let transaction = tracer.start_root_transaction_at(None, 0);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let transaction = transaction.clone();
            thread::spawn(move || {
                for i in 0..SPANS_PER_THREAD {
                    let start = i64::from(t * SPANS_PER_THREAD + i) * 10;
                    let span = transaction.create_span_at(start);
                    span.as_exit();
                    span.set_name("SELECT FROM users", apm_agent_core::trace::PRIORITY_DEFAULT);
                    span.set_type_subtype_action("db", "mysql", "query");
                    span.end_at(start + 5);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread");
    }
    transaction.end_at(i64::from(THREADS * SPANS_PER_THREAD) * 10);

    let spans = reporter.spans();
    let compressed: u32 = spans
        .iter()
        .map(|span| span.composite.as_ref().map_or(1, |composite| composite.count()))
        .sum();
    assert_eq!(compressed, THREADS * SPANS_PER_THREAD);

    let data = &reporter.transactions()[0];
    assert_eq!(data.span_count.started, THREADS * SPANS_PER_THREAD);
    assert_eq!(data.span_count.reported as usize, spans.len());
    assert_eq!(data.span_count.started, data.span_count.reported + data.span_count.dropped);

    let stats = tracer.pool_stats();
    assert_eq!(stats.transactions.size, 1);
    assert_eq!(stats.spans.size, stats.spans.objects_created);
}

#[test]
fn transaction_outlives_end_while_a_span_is_handed_over() {
    let (tracer, reporter) = tracer(Config::builtin());
    let transaction = tracer.start_root_transaction(None);
    let span = transaction.create_span();
    transaction.end();
    assert_eq!(reporter.transactions().len(), 1);
    assert_eq!(tracer.pool_stats().transactions.size, 0);

    let (sender, receiver) = mpsc::channel::<Span>();
    let worker = thread::spawn(move || {
        for span in receiver {
            span.end();
        }
    });
    sender.send(span).expect("worker is running");
    drop(sender);
    worker.join().expect("worker thread");

    // the parent had already ended, so the span is reported directly
    assert_eq!(reporter.spans().len(), 1);
    assert_eq!(tracer.pool_stats().transactions.size, 1);
    assert_eq!(tracer.pool_stats().spans.size, 1);
}

#[test]
fn span_limit_accounting() {
    let (tracer, reporter) = tracer(Config::builtin().with_transaction_max_spans(3));
    let transaction = tracer.start_root_transaction_at(None, 0);
    for i in 0..5 {
        let span = transaction.create_span_at(i * 100);
        let child = span.create_span_at(i * 100 + 10);
        child.end_at(i * 100 + 20);
        span.end_at(i * 100 + 50);
    }
    transaction.end_at(1_000);

    let data = &reporter.transactions()[0];
    assert_eq!(data.span_count.started, 10);
    assert_eq!(data.span_count.reported, 3);
    assert_eq!(data.span_count.dropped, 7);
    assert_eq!(reporter.spans().len(), 3);
}

#[test]
fn unsampled_transactions_report_no_spans() {
    let (tracer, reporter) = tracer(Config::builtin().with_transaction_max_spans(1));
    let transaction: Transaction = tracer.start_root_transaction(Some(&ConstantSampler::always_off()));
    let span = transaction.create_span();
    assert!(!span.is_sampled());
    assert_eq!(span.trace_id(), transaction.trace_id());
    assert_eq!(span.parent_id(), transaction.id());
    span.create_span().end();
    span.end();
    for _ in 0..3 {
        transaction.create_span().end();
    }
    transaction.end();

    assert!(reporter.spans().is_empty());
    let data = &reporter.transactions()[0];
    assert!(!data.sampled);
    assert_eq!(data.span_count.started, 0);
    assert_eq!(data.span_count.started, data.span_count.reported + data.span_count.dropped);
    assert!(data.dropped_span_stats.is_empty());
    assert_eq!(tracer.pool_stats().spans.objects_created, 0);
}

#[test]
fn noop_transaction_is_never_reported() {
    let (tracer, reporter) = tracer(Config::builtin());
    let transaction = tracer.noop_transaction();
    transaction.create_span().end();
    transaction.end();
    assert!(reporter.transactions().is_empty());
    assert_eq!(tracer.pool_stats().transactions.size, 1);
}
