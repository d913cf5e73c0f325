//! Event queue ordering, draining and shutdown.

use std::time::Duration;

use uuid::Uuid;

use arras_node::http::{EventQueue, NodeEvent};

fn ready_event() -> NodeEvent {
    NodeEvent::ComputationReady {
        session_id: Uuid::new_v4(),
        computation_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn events_pop_in_enqueue_order() {
    let queue = EventQueue::new();
    let first = ready_event();
    let second = NodeEvent::SessionExpired {
        session_id: Uuid::new_v4(),
        reason: "Client failed to connect".into(),
    };
    queue.push(first.clone());
    queue.push(second.clone());

    assert_eq!(queue.pop().await, Some(first));
    assert_eq!(queue.pop().await, Some(second));
}

#[tokio::test]
async fn pop_wakes_on_push() {
    let queue = EventQueue::new();
    let popper = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.pop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.push(ready_event());

    let event = tokio::time::timeout(Duration::from_secs(1), popper)
        .await
        .expect("pop must wake")
        .unwrap();
    assert!(event.is_some());
}

#[tokio::test]
async fn wait_until_empty_blocks_for_the_consumer() {
    let queue = EventQueue::new();
    queue.push(ready_event());

    assert!(
        !queue.wait_until_empty(Duration::from_millis(50)).await,
        "queue with an unconsumed event must time out"
    );

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue.pop().await
        })
    };
    assert!(
        queue.wait_until_empty(Duration::from_secs(1)).await,
        "drained queue must report empty"
    );
    consumer.await.unwrap();
}

#[tokio::test]
async fn empty_queue_reports_empty_immediately() {
    let queue = EventQueue::new();
    assert!(queue.wait_until_empty(Duration::from_millis(1)).await);
}

#[tokio::test]
async fn shutdown_unblocks_the_worker_and_refuses_new_events() {
    let queue = EventQueue::new();
    let worker = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.pop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shutdown();

    let popped = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("pop must unblock on shutdown")
        .unwrap();
    assert!(popped.is_none());

    // a post-shutdown push is logged as undelivered, never queued
    queue.push(ready_event());
    assert!(queue.pop().await.is_none());
}
