mod common;

use common::FlakyBroker;
use llm_event_bus::error::{BrokerError, MessagingError};
use llm_event_bus::messaging::{DurableLog, InMemoryBroker, StreamProvisioner};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Repeated ensure calls create the stream once and never fail afterwards
#[tokio::test]
async fn test_ensure_is_idempotent() {
    let broker = Arc::new(InMemoryBroker::new());
    let provisioner = StreamProvisioner::new(broker.clone());

    for _ in 0..5 {
        provisioner.ensure("orders.created").await.unwrap();
    }

    assert_eq!(broker.streams_created(), 1);
    assert_eq!(broker.stream_names(), vec!["orders_created".to_string()]);
}

/// Concurrent ensure calls for one subject race on creation without error
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure() {
    let broker = Arc::new(InMemoryBroker::new());
    let provisioner = StreamProvisioner::new(broker.clone());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let provisioner = provisioner.clone();
            tokio::spawn(async move { provisioner.ensure("payments").await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(broker.streams_created(), 1);
}

/// Distinct subjects get distinct streams
#[tokio::test]
async fn test_streams_per_subject() {
    let broker = Arc::new(InMemoryBroker::new());
    let provisioner = StreamProvisioner::new(broker.clone());

    provisioner.ensure("orders").await.unwrap();
    provisioner.ensure("payments").await.unwrap();
    provisioner.ensure("orders").await.unwrap();

    assert_eq!(broker.streams_created(), 2);
    assert_eq!(
        broker.stream_names(),
        vec!["orders".to_string(), "payments".to_string()]
    );
    let info = broker.stream_info("payments").await.unwrap();
    assert_eq!(info.subjects, vec!["payments".to_string()]);
}

/// Lookup failures other than "not found" are reported as provisioning errors
#[tokio::test]
async fn test_lookup_failure() {
    let broker = Arc::new(FlakyBroker::new(InMemoryBroker::new()));
    broker.fail_stream_info.store(true, Ordering::SeqCst);
    let provisioner = StreamProvisioner::new(broker.clone());

    let err = provisioner.ensure("orders").await.unwrap_err();
    assert!(matches!(err, MessagingError::StreamProvisioning { ref subject, .. } if subject == "orders"));
    assert_eq!(broker.inner.streams_created(), 0);
}

/// Creation failures are reported as provisioning errors
#[tokio::test]
async fn test_create_failure() {
    let broker = Arc::new(FlakyBroker::new(InMemoryBroker::new()));
    broker.fail_create_stream.store(true, Ordering::SeqCst);
    let provisioner = StreamProvisioner::new(broker.clone());

    let err = provisioner.ensure("orders").await.unwrap_err();
    assert!(matches!(err, MessagingError::StreamProvisioning { .. }));

    broker.fail_create_stream.store(false, Ordering::SeqCst);
    provisioner.ensure("orders").await.unwrap();
    assert_eq!(broker.inner.streams_created(), 1);
}

/// A stream whose derived name collides with another subject's is not accepted
#[tokio::test]
async fn test_colliding_stream_name_rejected() {
    let broker = Arc::new(InMemoryBroker::new());
    let provisioner = StreamProvisioner::new(broker.clone());

    provisioner.ensure("orders.created").await.unwrap();
    let err = provisioner.ensure("orders_created").await.unwrap_err();

    match err {
        MessagingError::StreamProvisioning { subject, source } => {
            assert_eq!(subject, "orders_created");
            assert_eq!(
                source,
                BrokerError::SubjectConflict {
                    stream: "orders_created".to_string(),
                    bound: vec!["orders.created".to_string()],
                }
            );
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(broker.streams_created(), 1);
}

/// Losing a creation race to a stream for another subject is a provisioning error
#[tokio::test]
async fn test_colliding_stream_created_concurrently() {
    let broker = Arc::new(FlakyBroker::new(InMemoryBroker::new()));
    let provisioner = StreamProvisioner::new(broker.clone());
    provisioner.ensure("orders.created").await.unwrap();

    // The lookup misses, creation then reports the name as taken
    broker.stale_stream_lookups.store(1, Ordering::SeqCst);
    let err = provisioner.ensure("orders_created").await.unwrap_err();

    assert!(matches!(
        err,
        MessagingError::StreamProvisioning {
            source: BrokerError::SubjectConflict { .. },
            ..
        }
    ));
    assert_eq!(broker.inner.streams_created(), 1);
}

/// Losing a creation race for the same subject counts as success
#[tokio::test]
async fn test_same_subject_created_concurrently() {
    let broker = Arc::new(FlakyBroker::new(InMemoryBroker::new()));
    let provisioner = StreamProvisioner::new(broker.clone());
    provisioner.ensure("orders").await.unwrap();

    broker.stale_stream_lookups.store(1, Ordering::SeqCst);
    provisioner.ensure("orders").await.unwrap();
    assert_eq!(broker.inner.streams_created(), 1);
}
