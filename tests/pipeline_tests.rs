mod common;

use std::sync::Arc;
use std::time::Duration;

use postoffice::envelope::{EnvelopeShapeValidator, PayloadValidator};
use postoffice::events::{CloseReason, DropReason, EvictReason, RelayEvent};
use postoffice::metadata::ConnectRequest;
use postoffice::relay::RelayState;
use postoffice::router::route;

use common::{
    connect_peer, envelope, recording_config, wait_until, BrokenSource, BurstSource, MemorySink,
    SinkBehaviour,
};

#[tokio::test]
async fn burst_beyond_queue_capacity_drops_newest_and_keeps_order() {
    let (config, events) = recording_config();
    let state = RelayState::new(config);
    let target = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    let frames: Vec<Vec<u8>> = (0..150)
        .map(|i| envelope("A", "B", "msg", &i.to_string()).into_bytes())
        .collect();
    let (sink, _sender_log) = MemorySink::new(SinkBehaviour::Healthy);
    let connection = state
        .connect(
            &ConnectRequest::new("A").with_timestamp(1),
            Box::new(sink),
            Box::new(BurstSource::new(frames)),
        )
        .await
        .expect("sender accepted");
    let sender = tokio::spawn(connection.run());

    // The reader never waits on the queue, so all 150 frames are offered
    // before the dispatcher has a chance to drain anything.
    assert!(
        wait_until(|| {
            let dropped = events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, RelayEvent::Dropped { reason: DropReason::QueueFull, .. }))
                .count();
            let delivered = target.log.frames().len();
            dropped > 0 && dropped + delivered == 150
        })
        .await,
        "every frame is either delivered or dropped"
    );

    let received: Vec<u64> = target
        .log
        .frames()
        .iter()
        .map(|frame| {
            let value: serde_json::Value = serde_json::from_str(frame).expect("json");
            value["payload"].as_str().unwrap().parse().unwrap()
        })
        .collect();
    assert!(!received.is_empty());
    assert!(received.len() <= 100, "at most the queue capacity is processed");
    assert_eq!(received[0], 0);
    assert!(received.windows(2).all(|w| w[0] < w[1]), "read order kept");

    // Backpressure never closes the sender.
    assert!(state.registry().lookup("A").is_some());
    assert!(!sender.is_finished());
    sender.abort();
}

#[tokio::test]
async fn frames_failing_validation_are_dropped_before_routing() {
    let (config, events) = recording_config();
    let state = RelayState::new(config).with_validator(Arc::new(EnvelopeShapeValidator));
    let a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;
    let b = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    a.send(r#"{"from":"A","to":["B",5],"type":"msg"}"#);
    let good = envelope("A", "B", "msg", "ok");
    a.send(&good);

    assert!(wait_until(|| b.log.frames().len() == 1).await);
    assert_eq!(b.log.frames(), vec![good]);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        RelayEvent::Dropped { reason: DropReason::Invalid, detail: Some(d), .. } if d.contains("to[1]")
    )));
}

struct PanickingValidator;

impl PayloadValidator for PanickingValidator {
    fn validate(&self, payload: &[u8]) -> Result<(), Vec<String>> {
        if payload.windows(4).any(|w| w == b"boom") {
            panic!("validator exploded");
        }
        Ok(())
    }
}

#[tokio::test]
async fn fault_while_routing_one_frame_spares_the_connection() {
    let (config, events) = recording_config();
    let state = RelayState::new(config).with_validator(Arc::new(PanickingValidator));
    let a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;
    let b = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    a.send(&envelope("A", "B", "msg", "boom"));
    let after = envelope("A", "B", "msg", "still here");
    a.send(&after);

    assert!(wait_until(|| b.log.frames().len() == 1).await);
    assert_eq!(b.log.frames(), vec![after]);
    assert!(state.registry().lookup("A").is_some());
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        RelayEvent::Fault { connection, detail } if connection == "A" && detail.contains("validator exploded")
    )));
}

#[tokio::test]
async fn client_close_tears_down_once() {
    let (config, events) = recording_config();
    let state = RelayState::new(config);
    let a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;
    assert_eq!(state.current_connection_count(), 1);

    let log = a.log.clone();
    assert_eq!(a.hang_up().await, CloseReason::ClientClosed);

    assert!(state.registry().lookup("A").is_none());
    assert_eq!(state.current_connection_count(), 0);
    assert_eq!(log.closes(), 1);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        RelayEvent::Disconnected { id, reason: CloseReason::ClientClosed } if id == "A"
    )));
}

#[tokio::test]
async fn heartbeats_route_quietly() {
    let (config, events) = recording_config();
    let state = RelayState::new(config);
    let a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;
    let b = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    let beat = envelope("A", "B", "heartbeat", "");
    a.send(&beat);
    assert!(wait_until(|| b.log.frames().len() == 1).await);
    assert_eq!(b.log.frames(), vec![beat]);

    let events = events.lock().unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e, RelayEvent::Routed { .. } | RelayEvent::Delivered { .. })));
}

#[tokio::test]
async fn frames_without_to_are_accepted_but_not_routed() {
    let (config, _events) = recording_config();
    let state = RelayState::new(config);
    let a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;
    let b = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    a.send(r#"{"from":"A","type":"msg"}"#);
    a.send("not json at all");
    let marker = envelope("A", "B", "msg", "marker");
    a.send(&marker);

    assert!(wait_until(|| !b.log.frames().is_empty()).await);
    assert_eq!(b.log.frames(), vec![marker]);
    assert!(state.registry().lookup("A").is_some());
}

#[tokio::test]
async fn shutdown_all_closes_every_connection() {
    let (config, events) = recording_config();
    let state = RelayState::new(config);
    let a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;
    let b = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    assert_eq!(state.shutdown_all(), 2);
    let mut evicted: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            RelayEvent::Evicted {
                id,
                reason: EvictReason::Shutdown,
                ..
            } => Some(id.clone()),
            _ => None,
        })
        .collect();
    evicted.sort();
    assert_eq!(evicted, ["A", "B"]);

    assert!(state.drain(Duration::from_secs(2)).await, "relay drained");
    for peer in [a, b] {
        let reason = tokio::time::timeout(Duration::from_secs(2), peer.handle)
            .await
            .expect("teardown in time")
            .expect("pipeline task");
        assert_eq!(reason, CloseReason::Signalled);
        assert_eq!(peer.log.closes(), 1);
    }
    assert!(state.registry().is_empty());
    assert_eq!(state.current_connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn drain_gives_up_while_connections_remain() {
    let state = RelayState::new(recording_config().0);
    let _a = connect_peer(&state, "A", 1, SinkBehaviour::Healthy).await;

    let started = tokio::time::Instant::now();
    assert!(!state.drain(Duration::from_secs(3)).await);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(state.current_connection_count(), 1);
}

async fn broken_reader_tears_down_only_its_connection(source: BrokenSource, expected: CloseReason) {
    let (config, events) = recording_config();
    let state = RelayState::new(config);
    let b = connect_peer(&state, "B", 1, SinkBehaviour::Healthy).await;

    let (sink, log) = MemorySink::new(SinkBehaviour::Healthy);
    let connection = state
        .connect(
            &ConnectRequest::new("A").with_timestamp(1),
            Box::new(sink),
            Box::new(source),
        )
        .await
        .expect("accepted");
    assert_eq!(state.current_connection_count(), 2);

    let reason = tokio::time::timeout(Duration::from_secs(2), connection.run())
        .await
        .expect("teardown in time");
    assert_eq!(reason, expected);

    assert!(state.registry().lookup("A").is_none());
    assert_eq!(log.closes(), 1);
    assert_eq!(state.current_connection_count(), 1);
    {
        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, RelayEvent::Fault { connection, .. } if connection == "A")));
        assert!(events.iter().any(|e| matches!(
            e,
            RelayEvent::Disconnected { id, reason } if id == "A" && *reason == expected
        )));
    }

    // The neighbour keeps its registration and still receives.
    assert!(state.registry().lookup("B").is_some());
    assert!(!b.handle.is_finished());
    let frame = envelope("C", "B", "msg", "still routed");
    route(&state, "C", frame.clone().into_bytes()).await;
    assert_eq!(b.log.frames(), vec![frame]);
    assert_eq!(b.log.closes(), 0);
}

#[tokio::test]
async fn read_error_ends_the_connection_cleanly() {
    broken_reader_tears_down_only_its_connection(BrokenSource::Errors, CloseReason::ReadError)
        .await;
}

#[tokio::test]
async fn panicking_reader_is_reported_as_a_fault() {
    broken_reader_tears_down_only_its_connection(BrokenSource::Panics, CloseReason::Fault).await;
}
