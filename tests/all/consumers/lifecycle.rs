use crate::helpers::{
    connection_params, consumer, AckLog, Answer, FakeBroker, FakeSink, Harness, QUEUE_NAME,
};
use queue_relay::{
    broker::{
        BindingId, Broker, BrokerEvent, ConsumerEvent, QueueDescriptor, SessionEvent, SessionId,
    },
    consumers::{ConsumerError, ConsumerState},
    persistence::PersistenceForwarder,
    service::ConsumerService,
    session::SessionState,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

const EXAMPLE: &[u8] = b"\x1F{\"Shipno\":\"S1\",\"Text\":\"ok\",\"Location\":\"NYC\",\"Status\":\"DELIVERED\",\"Lattitude\":\"40.7\",\"Longitude\":\"-74.0\"}\x00";

#[tokio::test]
async fn the_consumer_starts_once_the_session_is_up() {
    let mut harness = Harness::new(FakeBroker::new(Answer::Up, Answer::Up), FakeSink::default());

    harness.controller.connect(&connection_params());
    assert_eq!(harness.controller.state(), SessionState::Connecting);
    harness.settle().await;

    assert_eq!(harness.controller.state(), SessionState::Up);
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Up);
    assert_eq!(harness.controller.consumer().binding_id(), Some(BindingId(0)));
    assert_eq!(
        harness.broker.calls(),
        vec![
            "broker.create_session",
            "session.connect",
            "binding-0.create",
            "binding-0.connect"
        ]
    );
}

#[tokio::test]
async fn connecting_twice_opens_a_single_session() {
    let mut harness = Harness::new(
        FakeBroker::new(Answer::Silent, Answer::Up),
        FakeSink::default(),
    );

    harness.controller.connect(&connection_params());
    harness.controller.connect(&connection_params());
    harness.broker.emit_session(SessionEvent::Up);
    harness.settle().await;
    harness.controller.connect(&connection_params());

    assert_eq!(harness.broker.count("session.connect"), 1);
    assert_eq!(harness.controller.state(), SessionState::Up);
}

#[tokio::test]
async fn starting_an_already_started_consumer_creates_a_single_binding() {
    let mut harness = Harness::new(
        FakeBroker::new(Answer::Up, Answer::Silent),
        FakeSink::default(),
    );
    harness.controller.connect(&connection_params());
    harness.settle().await;
    // The binding has not reported back yet.
    assert_eq!(
        harness.controller.consumer().state(),
        ConsumerState::Connecting
    );

    // A second `Up` for the same session asks the consumer to start again.
    harness.broker.emit_session(SessionEvent::Up);
    harness.settle().await;
    harness.broker.emit(BrokerEvent::Consumer {
        binding: BindingId(0),
        event: ConsumerEvent::Up,
    });
    harness.broker.emit_session(SessionEvent::Up);
    harness.settle().await;

    assert_eq!(harness.broker.count("binding-0.create"), 1);
    assert_eq!(harness.broker.count("binding-1.create"), 0);
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Up);
}

#[tokio::test]
async fn losing_the_session_tears_the_binding_down_once() {
    let mut harness = Harness::new(FakeBroker::new(Answer::Up, Answer::Up), FakeSink::default());
    harness.controller.connect(&connection_params());
    harness.settle().await;

    harness
        .broker
        .emit_session(SessionEvent::Disconnected);
    harness
        .broker
        .emit_session(SessionEvent::Disconnected);
    harness.settle().await;

    assert_eq!(harness.controller.state(), SessionState::Disconnected);
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Down);
    assert_eq!(harness.controller.consumer().binding_id(), None);
    assert_eq!(harness.broker.count("binding-0.disconnect"), 1);
    assert_eq!(harness.broker.count("binding-0.dispose"), 1);
    assert_eq!(harness.broker.count("session.dispose"), 1);
}

#[tokio::test]
async fn a_late_event_from_a_released_session_does_not_affect_its_replacement() {
    // Arrange
    let mut harness = Harness::new(FakeBroker::new(Answer::Up, Answer::Up), FakeSink::default());
    harness.controller.connect(&connection_params());
    harness.settle().await;
    // A broken connection is reported twice: once by the error callback, once by the close.
    harness.broker.emit_session(SessionEvent::Disconnected);
    harness.broker.emit_session(SessionEvent::Disconnected);
    harness.step().await;
    assert_eq!(harness.controller.state(), SessionState::Disconnected);

    // Act
    harness.controller.connect(&connection_params());
    harness.settle().await;

    // Assert
    assert_eq!(harness.controller.state(), SessionState::Up);
    assert_eq!(harness.controller.session_id(), Some(SessionId(1)));
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Up);
    assert_eq!(harness.controller.consumer().binding_id(), Some(BindingId(1)));
    assert_eq!(harness.broker.count("session.dispose"), 1);
}

#[tokio::test]
async fn a_late_connect_failure_from_a_released_session_is_ignored() {
    let mut harness = Harness::new(
        FakeBroker::new(Answer::Silent, Answer::Up),
        FakeSink::default(),
    );
    harness.controller.connect(&connection_params());
    harness.broker.emit_session(SessionEvent::Disconnected);
    harness.settle().await;

    harness.controller.connect(&connection_params());
    harness.broker.emit(BrokerEvent::Session {
        session: SessionId(0),
        event: SessionEvent::ConnectFailed("connection reset".into()),
    });
    harness.broker.emit_session(SessionEvent::Up);
    harness.settle().await;

    assert_eq!(harness.controller.state(), SessionState::Up);
    assert_eq!(harness.controller.session_id(), Some(SessionId(1)));
}

#[tokio::test]
async fn a_failed_connection_is_not_retried() {
    let mut harness = Harness::new(
        FakeBroker::new(Answer::Fail, Answer::Up),
        FakeSink::default(),
    );

    harness.controller.connect(&connection_params());
    harness.settle().await;

    assert_eq!(harness.controller.state(), SessionState::Failed);
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Down);
    assert_eq!(harness.broker.count("session.connect"), 1);
    assert_eq!(harness.broker.count("binding-0.create"), 0);

    // Asking again is allowed.
    harness.controller.connect(&connection_params());
    harness.settle().await;
    assert_eq!(harness.broker.count("session.connect"), 2);
}

#[tokio::test]
async fn a_binding_that_cannot_attach_leaves_the_consumer_in_error() {
    let mut harness = Harness::new(
        FakeBroker::new(Answer::Up, Answer::Fail),
        FakeSink::default(),
    );

    harness.controller.connect(&connection_params());
    harness.settle().await;

    assert_eq!(harness.controller.state(), SessionState::Up);
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Error);
    assert_eq!(harness.controller.consumer().binding_id(), None);
    assert_eq!(harness.broker.count("binding-0.dispose"), 1);
}

#[tokio::test]
async fn starting_without_a_session_is_rejected() {
    let mut consumer = consumer(Arc::new(FakeSink::default()));

    let error = consumer.start(None).unwrap_err();

    assert!(
        matches!(&error, ConsumerError::NotConnected { queue_name } if queue_name == QUEUE_NAME),
        "{error:?}"
    );
    assert_eq!(consumer.state(), ConsumerState::Down);
}

#[tokio::test]
async fn a_binding_coming_up_after_the_session_dropped_stays_down() {
    let mut harness = Harness::new(
        FakeBroker::new(Answer::Up, Answer::Silent),
        FakeSink::default(),
    );
    harness.controller.connect(&connection_params());
    harness.settle().await;

    // The session drops while the binding is still attaching.
    harness
        .broker
        .emit_session(SessionEvent::Disconnected);
    harness.broker.emit(BrokerEvent::Consumer {
        binding: BindingId(0),
        event: ConsumerEvent::Up,
    });
    harness.settle().await;

    assert_eq!(harness.controller.state(), SessionState::Disconnected);
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Down);
}

#[tokio::test]
async fn a_binding_reported_up_while_the_session_is_not_is_torn_down() {
    let broker = FakeBroker::new(Answer::Silent, Answer::Silent);
    let (events, _receiver) = mpsc::unbounded_channel();
    let mut session = broker
        .create_session(&connection_params(), SessionId(0), events)
        .unwrap();
    let mut consumer = consumer(Arc::new(FakeSink::default()));
    consumer.start(Some(&mut session)).unwrap();

    consumer
        .handle_event(BindingId(0), ConsumerEvent::Up, None)
        .await;

    assert_eq!(consumer.state(), ConsumerState::Down);
    assert_eq!(consumer.binding_id(), None);
    assert_eq!(broker.count("binding-0.disconnect"), 1);
    assert_eq!(broker.count("binding-0.dispose"), 1);
}

#[tokio::test]
async fn a_binding_starved_by_unacknowledged_deliveries_is_replaced() {
    // Arrange
    let mut harness = Harness::with_queue(
        FakeBroker::new(Answer::Up, Answer::Up),
        FakeSink::default(),
        QueueDescriptor::durable(QUEUE_NAME).with_prefetch_count(2),
    );
    let acks = AckLog::default();
    harness.controller.connect(&connection_params());
    harness.settle().await;

    // Act
    harness
        .broker
        .deliver(BindingId(0), acks.message(1, b"not framed".to_vec()));
    harness
        .broker
        .deliver(BindingId(0), acks.message(2, EXAMPLE.to_vec()));
    harness.settle().await;
    assert_eq!(harness.controller.consumer().binding_id(), Some(BindingId(0)));
    harness
        .broker
        .deliver(BindingId(0), acks.message(3, b"not framed either".to_vec()));
    harness.settle().await;

    // Assert
    // Only two deliveries were left unacknowledged: the window of two is full.
    assert_eq!(acks.tags(), vec![2]);
    assert_eq!(harness.broker.count("binding-0.disconnect"), 1);
    assert_eq!(harness.broker.count("binding-0.dispose"), 1);
    assert_eq!(harness.broker.count("binding-1.connect"), 1);
    assert_eq!(harness.controller.consumer().binding_id(), Some(BindingId(1)));
    assert_eq!(harness.controller.consumer().state(), ConsumerState::Up);
    assert_eq!(harness.controller.state(), SessionState::Up);
}

#[tokio::test]
async fn acknowledged_deliveries_never_trigger_a_rebind() {
    let mut harness = Harness::with_queue(
        FakeBroker::new(Answer::Up, Answer::Up),
        FakeSink::default(),
        QueueDescriptor::durable(QUEUE_NAME).with_prefetch_count(2),
    );
    let acks = AckLog::default();
    harness.controller.connect(&connection_params());
    harness.settle().await;

    for tag in 1..=5 {
        harness
            .broker
            .deliver(BindingId(0), acks.message(tag, EXAMPLE.to_vec()));
    }
    harness.settle().await;

    assert_eq!(acks.tags(), vec![1, 2, 3, 4, 5]);
    assert_eq!(harness.broker.count("binding-0.disconnect"), 0);
    assert_eq!(harness.controller.consumer().binding_id(), Some(BindingId(0)));
}

#[tokio::test]
async fn deliveries_from_a_stale_binding_are_ignored() {
    let mut harness = Harness::new(FakeBroker::new(Answer::Up, Answer::Up), FakeSink::default());
    let acks = AckLog::default();
    harness.controller.connect(&connection_params());
    harness.settle().await;

    // Reconnect: binding-0 is gone, binding-1 takes over.
    harness
        .broker
        .emit_session(SessionEvent::Disconnected);
    harness.settle().await;
    harness.controller.connect(&connection_params());
    harness.settle().await;
    assert_eq!(harness.controller.consumer().binding_id(), Some(BindingId(1)));

    harness
        .broker
        .deliver(BindingId(0), acks.message(1, EXAMPLE.to_vec()));
    harness
        .broker
        .deliver(BindingId(1), acks.message(2, EXAMPLE.to_vec()));
    harness.settle().await;

    assert_eq!(acks.tags(), vec![2]);
    assert_eq!(harness.sink.inserted().len(), 1);
}

#[tokio::test]
async fn the_service_disconnects_and_exits_within_the_grace_period_on_shutdown() {
    // Arrange
    let broker = FakeBroker::new(Answer::Up, Answer::Up);
    let grace_period = Duration::from_millis(500);
    let mut service = ConsumerService::new(
        Arc::new(broker.clone()),
        QueueDescriptor::durable(QUEUE_NAME),
        PersistenceForwarder::new(FakeSink::default()),
    )
    .with_grace_period(grace_period);

    // Act
    let started = Instant::now();
    service
        .run(
            &connection_params(),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await;

    // Assert
    assert!(started.elapsed() < Duration::from_millis(50) + grace_period);
    assert_eq!(service.session().state(), SessionState::Disconnected);
    assert_eq!(
        service.session().consumer().state(),
        ConsumerState::Down
    );
    assert_eq!(broker.count("binding-0.disconnect"), 1);
    assert_eq!(broker.count("binding-0.dispose"), 1);
    assert_eq!(broker.count("session.disconnect"), 1);
}

#[tokio::test]
async fn shutting_down_before_the_session_is_up_still_disconnects() {
    // Arrange
    let broker = FakeBroker::new(Answer::Silent, Answer::Up);
    let grace_period = Duration::from_millis(100);
    let mut service = ConsumerService::new(
        Arc::new(broker.clone()),
        QueueDescriptor::durable(QUEUE_NAME),
        PersistenceForwarder::new(FakeSink::default()),
    )
    .with_grace_period(grace_period);

    // Act
    service
        .run(&connection_params(), std::future::ready(()))
        .await;

    // Assert
    assert_eq!(broker.count("binding-0.create"), 0);
    assert_eq!(broker.count("session.disconnect"), 1);
    assert_eq!(service.session().state(), SessionState::Disconnected);
}
