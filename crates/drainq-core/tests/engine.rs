mod common;

use common::{engine, seed};
use drainq::memory::MemoryBroker;
use drainq::{
    Engine, EngineConfig, EngineError, FailurePolicy, RunEnd, RunFailure, SubQueue,
    SubQueueMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cancel_after(token: CancellationToken, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[tokio::test]
async fn drain_deletes_every_message_in_full_batches() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 250);
    let engine = engine(&broker, 100).await;

    let summary = engine
        .run_drain("orders", SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(broker.fetch_sizes("orders", SubQueue::Main), vec![100, 100, 50, 0]);
    assert_eq!(summary.totals().checked, 250);
    assert_eq!(summary.totals().deleted, 250);
    assert_eq!(summary.totals().batches, 3);
    assert_eq!(summary.run(SubQueue::Main).unwrap().end, RunEnd::Exhausted);
    assert!(broker.is_empty("orders", SubQueue::Main));
}

#[tokio::test]
async fn drain_both_runs_main_then_dead_letter() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 3);
    for i in 0..2 {
        broker.dead_letter_text("orders", &format!("d{i}"), "body", "Expired", "ttl");
    }
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_drain("orders", SubQueueMode::Both)
        .await
        .unwrap();

    let order: Vec<_> = summary.runs().iter().map(|r| r.sub_queue).collect();
    assert_eq!(order, vec![SubQueue::Main, SubQueue::DeadLetter]);
    assert_eq!(summary.run(SubQueue::Main).unwrap().counters.deleted, 3);
    assert_eq!(summary.run(SubQueue::DeadLetter).unwrap().counters.deleted, 2);
    assert_eq!(summary.totals().deleted, 5);
    assert!(broker.is_empty("orders", SubQueue::DeadLetter));

    let stats = broker.stats();
    assert_eq!(stats.receivers_opened, 2);
    assert_eq!(stats.receivers_closed, 2);
}

#[tokio::test]
async fn failed_delete_is_skipped_and_left_on_the_queue() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 5);
    broker.fail_delete("m3");
    let engine = engine(&broker, 2).await;

    let summary = engine
        .run_drain("orders", SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(summary.totals().checked, 5);
    assert_eq!(summary.totals().deleted, 4);
    assert_eq!(summary.totals().skipped, 1);
    let left = broker.messages("orders", SubQueue::Main);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].message_id, "m3");
}

#[tokio::test]
async fn transfer_leaves_unsent_message_on_source() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 10);
    broker.create_queue("archive");
    broker.fail_send("m7");
    let engine = engine(&broker, 100).await;

    let summary = engine
        .run_transfer("orders", "archive", SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(summary.totals().checked, 10);
    assert_eq!(summary.totals().moved, 9);
    assert_eq!(summary.totals().skipped, 1);
    assert_eq!(summary.totals().duplicated, 0);

    let left = broker.messages("orders", SubQueue::Main);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].message_id, "m7");

    let moved = broker.messages("archive", SubQueue::Main);
    assert_eq!(moved.len(), 9);
    assert!(moved.iter().all(|m| m.message_id != "m7"));
    assert_eq!(moved[0].body.as_text(), "message 0");
}

#[tokio::test]
async fn transfer_reports_sent_but_not_deleted_as_duplicate() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 4);
    broker.create_queue("archive");
    broker.fail_delete("m2");
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_transfer("orders", "archive", SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(summary.totals().moved, 3);
    assert_eq!(summary.totals().duplicated, 1);
    assert_eq!(broker.len("archive", SubQueue::Main), 4);
    assert_eq!(broker.len("orders", SubQueue::Main), 1);
}

#[tokio::test]
async fn failed_send_call_leaves_the_whole_batch_on_the_source() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 6);
    broker.create_queue("archive");
    broker.fail_send_call(1);
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_transfer("orders", "archive", SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(summary.totals().checked, 6);
    assert_eq!(summary.totals().moved, 0);
    assert_eq!(summary.totals().skipped, 6);
    assert_eq!(summary.totals().duplicated, 0);
    assert_eq!(broker.stats().deletes, 0);
    assert_eq!(broker.len("orders", SubQueue::Main), 6);
    assert!(broker.is_empty("archive", SubQueue::Main));
}

#[tokio::test]
async fn transfer_shares_one_sender_and_closes_it_once() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 2);
    broker.dead_letter_text("orders", "d0", "body", "Rejected", "bad payload");
    broker.create_queue("archive");
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_transfer("orders", "archive", SubQueueMode::Both)
        .await
        .unwrap();
    engine.close().await.unwrap();

    assert_eq!(summary.totals().moved, 3);
    let stats = broker.stats();
    assert_eq!(stats.senders_opened, 1);
    assert_eq!(stats.senders_closed, 1);
    assert_eq!(stats.receivers_opened, stats.receivers_closed);
    assert_eq!(stats.client_closed, 1);
}

#[tokio::test]
async fn transfer_closes_sender_after_a_failed_run() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 2);
    broker.create_queue("archive");
    broker.fail_fetch("orders", SubQueue::Main, 1);
    let engine = engine(&broker, 10).await;

    let err = engine
        .run_transfer("orders", "archive", SubQueueMode::Both)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Interrupted(_)));
    let stats = broker.stats();
    assert_eq!(stats.senders_closed, 1);
    assert_eq!(stats.receivers_opened, 1);
    assert_eq!(stats.receivers_closed, 1);
}

#[tokio::test]
async fn dead_letter_messages_can_be_redriven_into_their_own_queue() {
    let broker = MemoryBroker::new();
    broker.create_queue("orders");
    broker.dead_letter_text("orders", "d0", "retry me", "Timeout", "handler timed out");
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_transfer("orders", "orders", SubQueueMode::DeadLetter)
        .await
        .unwrap();

    assert_eq!(summary.totals().moved, 1);
    assert!(broker.is_empty("orders", SubQueue::DeadLetter));
    let main = broker.messages("orders", SubQueue::Main);
    assert_eq!(main.len(), 1);
    assert_eq!(main[0].body.as_text(), "retry me");
}

#[tokio::test]
async fn transfer_into_the_same_main_queue_is_rejected() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 1);
    let engine = engine(&broker, 10).await;

    let err = engine
        .run_transfer("orders", "orders", SubQueueMode::Both)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    assert_eq!(broker.stats().senders_opened, 0);
}

#[tokio::test]
async fn missing_destination_fails_before_touching_the_source() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 3);
    let engine = engine(&broker, 10).await;

    let err = engine
        .run_transfer("orders", "nowhere", SubQueueMode::Main)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::OpenSender { .. }));
    assert_eq!(broker.stats().receivers_opened, 0);
    assert_eq!(broker.len("orders", SubQueue::Main), 3);
}

#[tokio::test]
async fn search_matches_dead_letter_messages_case_sensitively() {
    let broker = MemoryBroker::new();
    broker.create_queue("orders");
    let bodies = [
        "ERROR: payment declined",
        "all good",
        "error in lowercase",
        "Timeout",
        "fatal ERROR while saving",
    ];
    for (i, body) in bodies.iter().enumerate() {
        broker.dead_letter_text(
            "orders",
            &format!("d{i}"),
            body,
            "MaxDeliveryCountExceeded",
            "handler failed",
        );
    }
    let engine = engine(&broker, 2).await;

    let summary = engine
        .run_search("orders", "ERROR", true, SubQueueMode::DeadLetter)
        .await
        .unwrap();

    assert_eq!(summary.totals().checked, 5);
    assert_eq!(summary.totals().matched, 2);

    let matches: Vec<_> = summary.matches().collect();
    assert_eq!(matches[0].message_id, "d0");
    assert_eq!(matches[0].ordinal, 1);
    assert_eq!(matches[1].message_id, "d4");
    assert_eq!(matches[1].ordinal, 2);
    for found in matches {
        let dead_letter = found.dead_letter.as_ref().unwrap();
        assert_eq!(dead_letter.reason.as_deref(), Some("MaxDeliveryCountExceeded"));
        assert_eq!(found.source, SubQueue::DeadLetter);
    }

    assert_eq!(broker.len("orders", SubQueue::DeadLetter), 5);
}

#[tokio::test]
async fn search_is_case_insensitive_unless_asked() {
    let broker = MemoryBroker::new();
    broker.create_queue("greetings");
    broker.send_text("greetings", "g0", "Hello World");
    let engine = engine(&broker, 10).await;

    let insensitive = engine
        .run_search("greetings", "hello", false, SubQueueMode::Main)
        .await
        .unwrap();
    let sensitive = engine
        .run_search("greetings", "hello", true, SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(insensitive.totals().matched, 1);
    assert_eq!(sensitive.totals().matched, 0);
    assert_eq!(sensitive.totals().checked, 1);
}

#[tokio::test]
async fn search_is_repeatable() {
    let broker = MemoryBroker::new();
    broker.create_queue("orders");
    for i in 0..30 {
        let body = if i % 4 == 0 { "needle" } else { "hay" };
        broker.send_text("orders", &format!("m{i}"), body);
    }
    let engine = engine(&broker, 7).await;

    let first = engine
        .run_search("orders", "needle", false, SubQueueMode::Main)
        .await
        .unwrap();
    let second = engine
        .run_search("orders", "needle", false, SubQueueMode::Main)
        .await
        .unwrap();

    let ids = |s: &drainq::SessionSummary| {
        s.matches()
            .map(|m| m.message_id.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(first.totals().matched, 8);
    assert_eq!(first.totals().matched, second.totals().matched);
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn long_bodies_are_previewed() {
    let broker = MemoryBroker::new();
    broker.create_queue("orders");
    let body = format!("ERROR {}", "x".repeat(400));
    broker.send_text("orders", "long", &body);
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_search("orders", "error", false, SubQueueMode::Main)
        .await
        .unwrap();

    let found = summary.matches().next().unwrap();
    assert!(found.preview.ends_with("..."));
    assert_eq!(found.preview.chars().count(), drainq::PREVIEW_CHARS + 3);
}

#[tokio::test]
async fn snapshot_stops_at_count_and_leaves_messages() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 5);
    let engine = engine(&broker, 2).await;

    let summary = engine
        .run_snapshot("orders", 3, SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(broker.fetch_sizes("orders", SubQueue::Main), vec![2, 1]);
    assert_eq!(summary.run(SubQueue::Main).unwrap().end, RunEnd::LimitReached);
    let ids: Vec<_> = summary.snapshots().map(|s| s.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m0", "m1", "m2"]);
    assert_eq!(broker.len("orders", SubQueue::Main), 5);
}

#[tokio::test]
async fn snapshot_of_both_sub_queues_tags_the_source() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 1);
    broker.dead_letter_text("orders", "d0", "body", "Rejected", "schema mismatch");
    let engine = engine(&broker, 10).await;

    let summary = engine
        .run_snapshot("orders", 10, SubQueueMode::Both)
        .await
        .unwrap();

    let snapshots: Vec<_> = summary.snapshots().collect();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].source, SubQueue::Main);
    assert_eq!(snapshots[1].source, SubQueue::DeadLetter);
    assert_eq!(snapshots[1].dead_letter_reason.as_deref(), Some("Rejected"));
    assert_eq!(
        summary.run(SubQueue::DeadLetter).unwrap().end,
        RunEnd::Exhausted
    );
}

#[tokio::test]
async fn fetch_failure_keeps_partial_progress() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 5);
    broker.fail_fetch("orders", SubQueue::Main, 2);
    let engine = engine(&broker, 2).await;

    let err = engine
        .run_drain("orders", SubQueueMode::Both)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert_eq!(summary.runs().len(), 1);
    assert_eq!(summary.totals().deleted, 2);
    assert!(matches!(
        summary.run(SubQueue::Main).unwrap().end,
        RunEnd::Failed(RunFailure::Fetch { .. })
    ));
    assert_eq!(broker.len("orders", SubQueue::Main), 3);
    assert!(err.to_string().contains("main queue"));
}

#[tokio::test]
async fn continue_on_error_still_drains_the_dead_letter_queue() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 2);
    broker.dead_letter_text("orders", "d0", "body", "Rejected", "bad");
    broker.fail_fetch("orders", SubQueue::Main, 1);
    let engine = engine(&broker, 10)
        .await
        .with_policy(FailurePolicy::ContinueOnError);

    let err = engine
        .run_drain("orders", SubQueueMode::Both)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert_eq!(summary.runs().len(), 2);
    assert_eq!(summary.run(SubQueue::DeadLetter).unwrap().counters.deleted, 1);
    assert!(broker.is_empty("orders", SubQueue::DeadLetter));
    assert_eq!(broker.len("orders", SubQueue::Main), 2);
}

#[tokio::test]
async fn missing_queue_fails_the_run() {
    let broker = MemoryBroker::new();
    let engine = engine(&broker, 10).await;

    let err = engine
        .run_drain("orders", SubQueueMode::Main)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert!(matches!(
        summary.runs()[0].end,
        RunEnd::Failed(RunFailure::OpenReceiver { .. })
    ));
}

#[tokio::test]
async fn invalid_configuration_fails_before_any_remote_call() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 1);
    let engine = engine(&broker, 10).await;

    let results = [
        engine.run_drain("", SubQueueMode::Main).await,
        engine.run_drain("bad name", SubQueueMode::Main).await,
        engine.run_snapshot("orders", 0, SubQueueMode::Main).await,
        engine.run_search("orders", "", false, SubQueueMode::Main).await,
    ];
    for result in results {
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
    }
    assert_eq!(broker.stats().receivers_opened, 0);

    let client = broker.connect().await.unwrap();
    let config = EngineConfig {
        batch_size: 0,
        ..Default::default()
    };
    assert!(matches!(
        Engine::new(client, config),
        Err(EngineError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn progress_is_reported_after_every_batch() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 25);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let engine = engine(&broker, 10).await.with_progress(move |progress| {
        let call = seen.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(progress.sub_queue, SubQueue::Main);
        assert_eq!(progress.counters.batches, call as u64);
    });

    engine
        .run_drain("orders", SubQueueMode::Main)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancellation_between_batches_stops_before_the_next_fetch() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 50);
    let engine = engine(&broker, 10).await;
    let token = engine.cancellation_token();
    let engine = engine.with_progress(move |_| token.cancel());

    let err = engine
        .run_drain("orders", SubQueueMode::Both)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert_eq!(summary.runs().len(), 1);
    assert_eq!(summary.runs()[0].end, RunEnd::Cancelled);
    assert_eq!(summary.totals().deleted, 10);
    assert_eq!(broker.len("orders", SubQueue::Main), 40);
    assert_eq!(broker.stats().receivers_closed, 1);
}

#[tokio::test]
async fn cancelled_engine_does_not_fetch() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 5);
    let engine = engine(&broker, 10).await;
    engine.cancellation_token().cancel();

    let err = engine
        .run_search("orders", "message", false, SubQueueMode::Main)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cancelled"));
    assert!(broker.fetch_sizes("orders", SubQueue::Main).is_empty());
}

#[tokio::test]
async fn cancelling_mid_batch_counts_the_deletes_that_completed() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 5);
    broker.delay_delete("m4", Duration::from_secs(5));
    let engine = engine(&broker, 5).await;
    cancel_after(engine.cancellation_token(), Duration::from_millis(200));

    let err = engine
        .run_drain("orders", SubQueueMode::Main)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert_eq!(summary.runs()[0].end, RunEnd::Cancelled);
    assert_eq!(broker.stats().deletes, 4);
    assert_eq!(summary.totals().deleted, 4);
    assert_eq!(summary.totals().skipped, 1);
    assert_eq!(summary.totals().checked, 5);

    let left = broker.messages("orders", SubQueue::Main);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].message_id, "m4");
}

#[tokio::test]
async fn cancelling_a_transfer_reports_abandoned_deletes_as_duplicates() {
    let broker = MemoryBroker::new();
    seed(&broker, "orders", 4);
    broker.create_queue("archive");
    broker.delay_delete("m2", Duration::from_secs(5));
    let engine = engine(&broker, 10).await;
    cancel_after(engine.cancellation_token(), Duration::from_millis(200));

    let err = engine
        .run_transfer("orders", "archive", SubQueueMode::Main)
        .await
        .unwrap_err();

    let summary = err.summary().unwrap();
    assert_eq!(summary.runs()[0].end, RunEnd::Cancelled);
    assert_eq!(summary.totals().moved, 3);
    assert_eq!(summary.totals().duplicated, 1);
    assert_eq!(broker.len("archive", SubQueue::Main), 4);
    assert_eq!(broker.len("orders", SubQueue::Main), 1);
    assert_eq!(broker.stats().senders_closed, 1);
}
