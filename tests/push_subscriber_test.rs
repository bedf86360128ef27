mod common;

use common::{wait_for_state, wait_until, FlakyBroker, HandlerProbe, RecordingMetrics, WAIT_TIMEOUT};
use llm_event_bus::error::MessagingError;
use llm_event_bus::messaging::{
    BrokerConnection, InMemoryBroker, Message, MessageContext, MessageHandler, Subscriber,
    SubscriberConfig, SubscriptionState,
};
use llm_event_bus::metrics::{CONSUME_DURATION_SECONDS, CONSUME_TOTAL};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn subscriber(broker: Arc<dyn BrokerConnection>, concurrency: usize) -> Subscriber {
    Subscriber::new(
        broker,
        SubscriberConfig {
            concurrency,
            ..Default::default()
        },
    )
    .unwrap()
}

/// Handler that records into `probe`, spending `work` per message
fn probing(probe: Arc<HandlerProbe>, work: Duration) -> Arc<dyn MessageHandler> {
    Arc::new(move |_ctx: MessageContext, message: Message| {
        let probe = probe.clone();
        async move {
            probe.observe(&message, work).await;
            anyhow::Ok(())
        }
    })
}

/// Start a subscription in the background and wait until it is Ready
async fn start(
    subscriber: &Subscriber,
    subject: &str,
    ctx: &MessageContext,
    handler: Arc<dyn MessageHandler>,
) -> JoinHandle<Result<(), MessagingError>> {
    let subscription = subscriber.subscription(subject);
    let mut state = subscription.watch_state();
    let ctx = ctx.clone();
    let handle = tokio::spawn(async move { subscription.run(&ctx, handler).await });
    assert!(wait_for_state(&mut state, SubscriptionState::Ready).await);
    handle
}

async fn publish_all(broker: &InMemoryBroker, subject: &str, count: usize) {
    for i in 0..count {
        broker
            .publish(Message::new(subject, format!("m-{}", i)))
            .await
            .unwrap();
    }
}

/// Under overload every produced message is either handled once or dropped
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overload_accounts_for_every_message() {
    const PRODUCED: u64 = 50;
    let broker = Arc::new(InMemoryBroker::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let subscriber = subscriber(broker.clone(), 2).with_metrics(metrics.clone());
    let probe = Arc::new(HandlerProbe::new());
    let (gate_tx, gate_rx) = watch::channel(false);

    let handler: Arc<dyn MessageHandler> = {
        let probe = probe.clone();
        Arc::new(move |_ctx: MessageContext, message: Message| {
            let probe = probe.clone();
            let mut gate = gate_rx.clone();
            async move {
                if gate.wait_for(|open| *open).await.is_err() {
                    anyhow::bail!("gate dropped");
                }
                probe.observe(&message, Duration::ZERO).await;
                Ok(())
            }
        })
    };

    let ctx = MessageContext::new();
    let run = start(&subscriber, "load", &ctx, handler).await;
    publish_all(&broker, "load", PRODUCED as usize).await;

    let dropped = || metrics.count(CONSUME_TOTAL, &[("status", "dropped")]);
    assert!(wait_until(WAIT_TIMEOUT, || dropped() > 0).await);

    ctx.cancel();
    gate_tx.send_replace(true);
    run.await.unwrap().unwrap();

    let delivered = probe.calls() as u64;
    assert_eq!(delivered + dropped(), PRODUCED);
    assert_eq!(metrics.count(CONSUME_TOTAL, &[("status", "received")]), delivered);
    assert_eq!(metrics.count(CONSUME_TOTAL, &[("status", "processed")]), delivered);

    let payloads = probe.payloads();
    let unique: HashSet<&String> = payloads.iter().collect();
    assert_eq!(unique.len(), payloads.len());
}

/// Consume returns only after the last handler invocation has completed
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_waits_for_in_flight_handlers() {
    let broker = Arc::new(InMemoryBroker::new());
    let subscriber = subscriber(broker.clone(), 4);
    let probe = Arc::new(HandlerProbe::new());

    let ctx = MessageContext::new();
    let run = start(
        &subscriber,
        "orders",
        &ctx,
        probing(probe.clone(), Duration::from_millis(30)),
    )
    .await;

    publish_all(&broker, "orders", 12).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    ctx.cancel();
    run.await.unwrap().unwrap();
    let returned = Instant::now();

    let calls = probe.calls();
    assert!(calls > 0);
    for (_, end) in probe.intervals() {
        assert!(end <= returned);
    }

    // Nothing starts after return
    publish_all(&broker, "orders", 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.calls(), calls);
    assert_eq!(broker.subscription_count(), 0);
}

/// With concurrency 1 invocations never overlap
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_worker_serializes_handlers() {
    let broker = Arc::new(InMemoryBroker::new());
    let subscriber = subscriber(broker.clone(), 1);
    let probe = Arc::new(HandlerProbe::new());

    let ctx = MessageContext::new();
    let run = start(
        &subscriber,
        "serial",
        &ctx,
        probing(probe.clone(), Duration::from_millis(2)),
    )
    .await;

    // Capacity is 4, so publish in small bursts to avoid load shedding
    for _ in 0..5 {
        publish_all(&broker, "serial", 2).await;
        let expected = probe.calls() + 2;
        assert!(wait_until(WAIT_TIMEOUT, || probe.calls() >= expected).await);
    }
    ctx.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(probe.max_active(), 1);
    let mut intervals = probe.intervals();
    intervals.sort_by_key(|(start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(pair[1].0 >= pair[0].1);
    }
}

/// Subscribe failure is returned immediately and never reaches Ready
#[tokio::test]
async fn test_subscribe_failure() {
    let broker = Arc::new(FlakyBroker::new(InMemoryBroker::new()));
    broker.fail_subscribe.store(true, Ordering::SeqCst);
    let subscriber = subscriber(broker.clone(), 2);
    let probe = Arc::new(HandlerProbe::new());

    let subscription = subscriber.subscription("orders");
    let state = subscription.watch_state();
    let err = subscription
        .run(&MessageContext::new(), probing(probe, Duration::ZERO))
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::SubscribeFailed { ref subject, .. } if subject == "orders"));
    assert_eq!(*state.borrow(), SubscriptionState::Stopped);
}

/// A failed flush after subscribe removes the subscription again
#[tokio::test]
async fn test_flush_failure_unsubscribes() {
    let broker = Arc::new(FlakyBroker::new(InMemoryBroker::new()));
    broker.fail_flush.store(true, Ordering::SeqCst);
    let subscriber = subscriber(broker.clone(), 2);

    let err = subscriber
        .consume(&MessageContext::new(), "orders", |_ctx: MessageContext, _message: Message| async {
            anyhow::Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::SubscribeFailed { .. }));
    assert_eq!(broker.inner.subscription_count(), 0);
}

/// Subscriptions sharing a queue group split the messages between them
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_group_load_balancing() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = SubscriberConfig {
        concurrency: 4,
        queue_group: Some("billing".to_string()),
        ..Default::default()
    };
    let first = Subscriber::new(broker.clone(), config.clone()).unwrap();
    let second = Subscriber::new(broker.clone(), config).unwrap();
    let probe_a = Arc::new(HandlerProbe::new());
    let probe_b = Arc::new(HandlerProbe::new());

    let ctx = MessageContext::new();
    let run_a = start(&first, "invoices", &ctx, probing(probe_a.clone(), Duration::ZERO)).await;
    let run_b = start(&second, "invoices", &ctx, probing(probe_b.clone(), Duration::ZERO)).await;

    publish_all(&broker, "invoices", 10).await;
    assert!(wait_until(WAIT_TIMEOUT, || probe_a.calls() + probe_b.calls() == 10).await);
    ctx.cancel();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();

    assert_eq!(probe_a.calls(), 5);
    assert_eq!(probe_b.calls(), 5);
}

/// Handler errors are counted and do not stop the subscription
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_errors_counted() {
    let broker = Arc::new(InMemoryBroker::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let subscriber = subscriber(broker.clone(), 2).with_metrics(metrics.clone());

    let handler: Arc<dyn MessageHandler> = Arc::new(|_ctx: MessageContext, message: Message| async move {
        if message.payload.ends_with(b"3") {
            anyhow::bail!("cannot handle {}", String::from_utf8_lossy(&message.payload));
        }
        Ok(())
    });

    let ctx = MessageContext::new();
    let run = start(&subscriber, "orders", &ctx, handler).await;
    publish_all(&broker, "orders", 5).await;

    let handled = || {
        metrics.count(CONSUME_TOTAL, &[("status", "processed")])
            + metrics.count(CONSUME_TOTAL, &[("status", "error")])
    };
    assert!(wait_until(WAIT_TIMEOUT, || handled() == 5).await);
    ctx.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(metrics.count(CONSUME_TOTAL, &[("status", "error"), ("reason", "handler")]), 1);
    assert_eq!(metrics.count(CONSUME_TOTAL, &[("status", "processed")]), 4);
    assert_eq!(metrics.observed(CONSUME_DURATION_SECONDS, &[("subject", "orders")]), 5);
}

/// Per-message contexts carry a correlation id and the dedup header as message id
#[tokio::test]
async fn test_default_context_derivation() {
    let broker = Arc::new(InMemoryBroker::new());
    let subscriber = subscriber(broker.clone(), 1);
    let seen: Arc<Mutex<Vec<(Option<String>, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));

    let handler: Arc<dyn MessageHandler> = {
        let seen = seen.clone();
        Arc::new(move |ctx: MessageContext, _message: Message| {
            let seen = seen.clone();
            async move {
                seen.lock().push((
                    ctx.correlation_id().map(str::to_string),
                    ctx.message_id().map(str::to_string),
                ));
                anyhow::Ok(())
            }
        })
    };

    let ctx = MessageContext::new();
    let run = start(&subscriber, "orders", &ctx, handler).await;
    broker
        .publish(Message::new("orders", "a").with_dedup_id("order-1"))
        .await
        .unwrap();
    broker.publish(Message::new("orders", "b")).await.unwrap();

    assert!(wait_until(WAIT_TIMEOUT, || seen.lock().len() == 2).await);
    ctx.cancel();
    run.await.unwrap().unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen[0].1.as_deref(), Some("order-1"));
    assert_eq!(seen[1].1, None);
    let first = seen[0].0.clone().unwrap();
    let second = seen[1].0.clone().unwrap();
    assert!(!first.is_empty());
    assert_ne!(first, second);
}

/// A caller-supplied deriver replaces the default one
#[tokio::test]
async fn test_custom_context_deriver() {
    let broker = Arc::new(InMemoryBroker::new());
    let subscriber = subscriber(broker.clone(), 1).with_context_deriver(|parent, message| {
        let correlation = message.headers.get("x-request-id").unwrap_or("none").to_string();
        parent.child().with_correlation_id(correlation)
    });
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handler: Arc<dyn MessageHandler> = {
        let seen = seen.clone();
        Arc::new(move |ctx: MessageContext, _message: Message| {
            let seen = seen.clone();
            async move {
                seen.lock().push(ctx.correlation_id().unwrap_or_default().to_string());
                anyhow::Ok(())
            }
        })
    };

    let ctx = MessageContext::new();
    let run = start(&subscriber, "orders", &ctx, handler).await;
    broker
        .publish(Message::new("orders", "a").with_header("x-request-id", "req-7"))
        .await
        .unwrap();

    assert!(wait_until(WAIT_TIMEOUT, || seen.lock().len() == 1).await);
    ctx.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(seen.lock()[0], "req-7");
}

/// Lifecycle moves Created -> Ready -> Stopped and is observable throughout
#[tokio::test]
async fn test_lifecycle_observable() {
    let broker = Arc::new(InMemoryBroker::new());
    let subscriber = subscriber(broker.clone(), 1);
    let probe = Arc::new(HandlerProbe::new());

    let subscription = subscriber.subscription("orders");
    assert_eq!(subscription.state(), SubscriptionState::Created);
    let mut state = subscription.watch_state();

    let ctx = MessageContext::new();
    let run = {
        let ctx = ctx.clone();
        let handler = probing(probe, Duration::ZERO);
        tokio::spawn(async move { subscription.run(&ctx, handler).await })
    };

    assert!(wait_for_state(&mut state, SubscriptionState::Ready).await);
    ctx.cancel();
    assert!(wait_for_state(&mut state, SubscriptionState::Stopped).await);
    run.await.unwrap().unwrap();
}
