//! Property tests for event bus delivery order, filters, once-subscriptions
//! and dead-lettering.

#![allow(clippy::unwrap_used)]

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiz_kernel_core::{Event, KernelError};
use wiz_kernel_runtime::{EventBus, EventBusConfig, SubscribeOptions};
use wiz_kernel_testing::CallLog;
use wiz_kernel_testing::properties::{arb_event, arb_priorities};

proptest! {
    #[test]
    fn handlers_run_in_descending_priority(priorities in arb_priorities(), event in arb_event()) {
        tokio_test::block_on(async {
            // One handler at a time so completion order equals start order.
            let bus = EventBus::new(EventBusConfig::default().with_max_concurrent_handlers(1));
            let log = CallLog::new();
            for priority in &priorities {
                bus.subscribe(
                    event.event_type.clone(),
                    log.event_recorder(&priority.to_string()),
                    SubscribeOptions::new().priority(*priority),
                );
            }

            let report = bus.publish(event.clone()).await.unwrap();
            assert_eq!(report.success_count, priorities.len());

            let mut expected = priorities.clone();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            let expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
            assert_eq!(log.entries(), expected);
        });
    }

    #[test]
    fn rejecting_filter_never_runs(events in proptest::collection::vec(arb_event(), 1..20)) {
        tokio_test::block_on(async {
            let bus = EventBus::default();
            let log = CallLog::new();
            for event in &events {
                bus.subscribe(
                    event.event_type.clone(),
                    log.event_recorder("filtered"),
                    SubscribeOptions::new().filter(|_| false),
                );
            }

            for event in events {
                let report = bus.publish(event).await.unwrap();
                assert_eq!(report.handler_count, 0);
            }
            assert!(log.is_empty());
        });
    }

    #[test]
    fn once_subscription_delivers_exactly_once(publishes in 1usize..10, event in arb_event()) {
        tokio_test::block_on(async {
            let bus = EventBus::default();
            let log = CallLog::new();
            bus.subscribe(
                event.event_type.clone(),
                log.event_recorder("once"),
                SubscribeOptions::new().once(),
            );

            for _ in 0..publishes {
                bus.publish(event.clone()).await.unwrap();
            }
            assert_eq!(log.entries(), vec!["once"]);
            assert_eq!(bus.subscription_count(Some(&event.event_type)), 0);
        });
    }
}

#[tokio::test]
async fn only_fully_failed_events_are_dead_lettered() {
    let bus = EventBus::default();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    bus.subscribe(
        "order.failed",
        move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(KernelError::handler("payment gateway down")) }
        },
        SubscribeOptions::new(),
    );
    bus.subscribe(
        "order.partial",
        |_event| async { Err(KernelError::handler("one bad handler")) },
        SubscribeOptions::new(),
    );
    bus.subscribe(
        "order.partial",
        |_event| async { Ok(()) },
        SubscribeOptions::new(),
    );

    let failed = bus
        .publish(Event::new("order.failed", json!({})).with_id("e-failed"))
        .await
        .unwrap();
    let partial = bus
        .publish(Event::new("order.partial", json!({})).with_id("e-partial"))
        .await
        .unwrap();

    assert_eq!((failed.success_count, failed.failure_count), (0, 1));
    assert_eq!((partial.success_count, partial.failure_count), (1, 1));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let dead: Vec<String> = bus
        .dead_letter_queue()
        .into_iter()
        .map(|letter| letter.payload.id)
        .collect();
    assert_eq!(dead, vec!["e-failed"]);
    assert!(bus.dead_letter_queue()[0].error_message.contains("payment gateway down"));
}
