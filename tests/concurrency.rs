//! Bursts of notifications never run more invocations at once than
//! the configured ceiling.

mod common;

use common::{config, Harness, ScriptedClassifier, Step};
use core::time::Duration;
use image_label_bridge::classify::Label;
use image_label_bridge::observability::TraceContext;

async fn flood(ceiling: usize, burst: usize) {
    let harness = Harness::new(
        ScriptedClassifier::new(
            Vec::new(),
            Step::Slow(Duration::from_millis(250), vec![Label::new("cat", 0.97)]),
        ),
        config(ceiling, 0),
    );
    let mut events = Vec::with_capacity(burst);
    for i in 0..burst {
        events.push(harness.write(&format!("burst/{i}.jpg"), 32).await);
    }

    let outcomes = harness
        .dispatcher
        .dispatch_all(events, TraceContext::default(), None)
        .await;

    assert_eq!(outcomes.len(), burst);
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert!(
        harness.dispatcher.peak_in_flight() <= ceiling,
        "ceiling {ceiling} exceeded: {}",
        harness.dispatcher.peak_in_flight()
    );
    assert!(harness.classifier.peak() <= ceiling);
    assert_eq!(harness.dispatcher.in_flight(), 0);
    assert_eq!(harness.classifier.calls(), burst);
    assert!(harness.dead_letters.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bursts_respect_the_ceiling() {
    for ceiling in [1, 4, 16] {
        for burst in [1, 7, 50, 200] {
            flood(ceiling, burst).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bursts_respect_the_ceiling_across_threads() {
    flood(3, 60).await;
}

#[tokio::test(start_paused = true)]
async fn excess_requests_queue_instead_of_failing() {
    let harness = Harness::new(
        ScriptedClassifier::new(
            Vec::new(),
            Step::Slow(Duration::from_secs(10), vec![Label::new("cat", 0.97)]),
        ),
        config(2, 0),
    );
    let mut events = Vec::new();
    for i in 0..6 {
        events.push(harness.write(&format!("queued/{i}.jpg"), 32).await);
    }

    let started = tokio::time::Instant::now();
    let outcomes = harness
        .dispatcher
        .dispatch_all(events, TraceContext::default(), None)
        .await;

    assert!(outcomes.into_iter().all(|o| o.is_ok()));
    assert_eq!(harness.dispatcher.peak_in_flight(), 2);
    // Six ten-second invocations, two at a time.
    assert!(started.elapsed() >= Duration::from_secs(30));
}
