//! Integration tests for the messaging client against the memory broker.

use courier::{
    AckPolicy, BrokerConfig, Connection, ConnectionError, ConnectionOptions, MemoryBroker,
    Message, ReconnectPolicy, Sequence, SessionEvent, SessionStatus, StartPosition,
    SubscriptionOptions, SubscriptionState, Timestamp,
};
use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_broker() -> MemoryBroker {
    MemoryBroker::new(BrokerConfig::default())
}

fn test_options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_connect_timeout(Duration::from_millis(500))
        .with_request_timeout(Duration::from_millis(500))
}

fn connect(broker: &MemoryBroker, client_id: &str) -> Connection {
    Connection::connect(broker.clone(), "test-cluster", client_id, test_options()).unwrap()
}

/// Subscribe on `subject`, forwarding every message to the returned channel.
fn collect(
    conn: &Connection,
    subject: &str,
    options: SubscriptionOptions,
) -> (courier::Subscription, Receiver<Message>) {
    let (tx, rx) = unbounded();
    let sub = conn
        .subscribe(subject, options, move |msg| {
            let _ = tx.send(msg.clone());
            Ok(())
        })
        .unwrap();
    (sub, rx)
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn next_event(events: &Receiver<SessionEvent>, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let event = events
            .recv_deadline(deadline)
            .expect("event not received in time");
        if wanted(&event) {
            return event;
        }
    }
}

// --- Basic Flow ---

#[test]
fn test_publish_sync_hello_world() {
    init_tracing();
    let broker = test_broker();
    let conn = connect(&broker, "publisher");

    let started = Instant::now();
    let seq = conn
        .publisher()
        .publish_sync("foo", "Hello World", Duration::from_secs(2))
        .unwrap();

    assert!(seq >= Sequence(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(broker.message_count("foo"), 1);
}

#[test]
fn test_subscribe_then_publish() {
    init_tracing();
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (sub, rx) = collect(&conn, "foo", SubscriptionOptions::default());

    conn.publish("foo", "Hello World").unwrap();

    let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(msg.text(), Some("Hello World"));
    assert_eq!(msg.subject, "foo");
    assert!(!msg.redelivered);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    wait_for(|| sub.stats().acked == 1);
    assert_eq!(sub.stats().delivered, 1);
}

#[test]
fn test_session_info() {
    let broker = test_broker();
    let conn = connect(&broker, "client-7");

    let info = conn.session();
    assert_eq!(info.cluster_id, "test-cluster");
    assert_eq!(info.client_id, "client-7");
    assert_eq!(info.endpoint, "nats://127.0.0.1:4222");
    assert_eq!(info.status, SessionStatus::Open);
    assert_eq!(conn.max_payload(), BrokerConfig::default().max_payload);
    assert_eq!(broker.client_count(), 1);
}

#[test]
fn test_json_round_trip_through_broker() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        item: String,
    }

    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (_sub, rx) = collect(&conn, "orders", SubscriptionOptions::default());

    let order = Order {
        id: 42,
        item: "widget".to_string(),
    };
    conn.publisher()
        .publish_json("orders", &order, Duration::from_secs(2))
        .unwrap();

    let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(msg.json::<Order>().unwrap(), order);
}

// --- Ordering ---

#[test]
fn test_messages_arrive_in_sequence_order() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (_sub, rx) = collect(&conn, "events", SubscriptionOptions::default());

    let publisher = conn.publisher();
    for i in 0..50 {
        publisher
            .publish_sync("events", format!("event-{}", i), Duration::from_secs(2))
            .unwrap();
    }

    let got: Vec<Sequence> = (0..50)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().sequence)
        .collect();
    let expected: Vec<Sequence> = (1..=50).map(Sequence).collect();
    assert_eq!(got, expected);
}

#[test]
fn test_async_acks_in_publish_order() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let publisher = conn.publisher();
    let (tx, rx) = unbounded();

    for i in 0..20 {
        let tx = tx.clone();
        publisher
            .publish_async("foo", format!("{}", i), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
    }

    let acks: Vec<Sequence> = (0..20)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap())
        .collect();
    let expected: Vec<Sequence> = (1..=20).map(Sequence).collect();
    assert_eq!(acks, expected);
    assert_eq!(publisher.pending(), 0);
}

#[test]
fn test_ack_handle_tracks_resolution() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (tx, rx) = unbounded();

    let handle = conn
        .publisher()
        .publish_async("foo", "x", move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    assert_eq!(handle.subject(), "foo");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(Sequence(1)));
    assert!(!handle.is_pending());
}

// --- Subjects And Start Positions ---

#[test]
fn test_wildcard_subscriptions() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (_one, one_rx) = collect(&conn, "orders.*", SubscriptionOptions::default());
    let (_tail, tail_rx) = collect(&conn, "orders.>", SubscriptionOptions::default());

    conn.publish("orders.created", "a").unwrap();
    conn.publish("orders.eu.created", "b").unwrap();
    conn.publish("invoices.created", "c").unwrap();

    assert_eq!(
        one_rx.recv_timeout(Duration::from_secs(2)).unwrap().subject,
        "orders.created"
    );
    assert!(one_rx.recv_timeout(Duration::from_millis(100)).is_err());

    let tail: Vec<String> = (0..2)
        .map(|_| tail_rx.recv_timeout(Duration::from_secs(2)).unwrap().subject)
        .collect();
    assert_eq!(tail, vec!["orders.created", "orders.eu.created"]);
}

#[test]
fn test_start_positions() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    for i in 1..=3 {
        conn.publish("history", format!("m{}", i)).unwrap();
    }

    let received = |start: StartPosition| -> Vec<u64> {
        let (sub, rx) = collect(&conn, "history", SubscriptionOptions::default().with_start(start));
        let mut got = Vec::new();
        while let Ok(msg) = rx.recv_timeout(Duration::from_millis(150)) {
            got.push(msg.sequence.0);
        }
        sub.unsubscribe().unwrap();
        got
    };

    assert_eq!(received(StartPosition::AllAvailable), vec![1, 2, 3]);
    assert_eq!(received(StartPosition::FromSequence(Sequence(2))), vec![2, 3]);
    assert_eq!(received(StartPosition::LastReceived), vec![3]);
    assert_eq!(received(StartPosition::NewOnly), Vec::<u64>::new());

    thread::sleep(Duration::from_millis(5));
    let cutoff = Timestamp::now();
    thread::sleep(Duration::from_millis(5));
    conn.publish("history", "m4").unwrap();
    conn.publish("history", "m5").unwrap();
    assert_eq!(received(StartPosition::FromTime(cutoff)), vec![4, 5]);
}

#[test]
fn test_from_time_applies_to_subjects_created_later() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    conn.publish("sensors.a", "old").unwrap();
    thread::sleep(Duration::from_millis(5));
    let cutoff = Timestamp::now();
    thread::sleep(Duration::from_millis(5));

    let (_sub, rx) = collect(
        &conn,
        "sensors.*",
        SubscriptionOptions::default().with_start(StartPosition::FromTime(cutoff)),
    );
    conn.publish("sensors.b", "new").unwrap();

    let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(msg.subject, "sensors.b");
    assert_eq!(msg.text(), Some("new"));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

// --- Durable Subscriptions ---

#[test]
fn test_durable_redelivered_after_crash() {
    init_tracing();
    let broker = test_broker();

    {
        let conn = connect(&broker, "worker");
        let sub = conn
            .subscribe(
                "orders",
                SubscriptionOptions::durable("worker-1").with_ack_policy(AckPolicy::OnSuccess),
                |msg| {
                    // Crash on the fifth message: never acknowledged.
                    if msg.sequence == Sequence(5) {
                        return Err("crashed".into());
                    }
                    Ok(())
                },
            )
            .unwrap();

        for i in 1..=5 {
            conn.publish("orders", format!("order-{}", i)).unwrap();
        }
        wait_for(|| sub.stats().delivered == 5);
        assert_eq!(sub.stats().acked, 4);
    }

    assert!(broker.has_durable("worker", "worker-1", "orders"));

    let conn = connect(&broker, "worker");
    let (_sub, rx) = collect(&conn, "orders", SubscriptionOptions::durable("worker-1"));

    let msg = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(msg.sequence, Sequence(5));
    assert!(msg.redelivered);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_durable_resumes_after_unsubscribe() {
    let broker = test_broker();
    let conn = connect(&broker, "client");

    let (sub, rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));
    conn.publish("orders", "1").unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    wait_for(|| sub.stats().acked == 1);
    sub.unsubscribe().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);

    // Published while nobody is attached.
    conn.publish("orders", "2").unwrap();
    conn.publish("orders", "3").unwrap();

    let (_again, rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));
    let resumed: Vec<u64> = (0..2)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().sequence.0)
        .collect();
    assert_eq!(resumed, vec![2, 3]);
}

#[test]
fn test_close_durable_erases_cursor() {
    let broker = test_broker();
    let conn = connect(&broker, "client");

    let (sub, _rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));
    assert!(broker.has_durable("client", "audit", "orders"));

    sub.close_durable().unwrap();

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert!(!broker.has_durable("client", "audit", "orders"));
}

#[test]
fn test_close_durable_after_unsubscribe() {
    let broker = test_broker();
    let conn = connect(&broker, "client");

    let (sub, _rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));
    sub.unsubscribe().unwrap();
    assert!(broker.has_durable("client", "audit", "orders"));

    sub.close_durable().unwrap();

    assert!(!broker.has_durable("client", "audit", "orders"));
}

#[test]
fn test_unsubscribe_twice_is_noop() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (sub, rx) = collect(&conn, "foo", SubscriptionOptions::default());

    sub.unsubscribe().unwrap();
    sub.unsubscribe().unwrap();

    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    assert_eq!(conn.subscriptions().subscription_count(), 0);
    conn.publish("foo", "ignored").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

// --- Queue Groups ---

#[test]
fn test_queue_group_splits_work() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (a, a_rx) = collect(&conn, "jobs", SubscriptionOptions::queue("workers"));
    let (b, b_rx) = collect(&conn, "jobs", SubscriptionOptions::queue("workers"));

    for i in 0..10 {
        conn.publish("jobs", format!("job-{}", i)).unwrap();
    }
    wait_for(|| a.stats().delivered + b.stats().delivered == 10);

    let a_seqs: Vec<u64> = a_rx.try_iter().map(|m| m.sequence.0).collect();
    let b_seqs: Vec<u64> = b_rx.try_iter().map(|m| m.sequence.0).collect();
    assert_eq!(a_seqs.len() + b_seqs.len(), 10);

    let all: HashSet<u64> = a_seqs.iter().chain(b_seqs.iter()).copied().collect();
    assert_eq!(all, (1..=10).collect::<HashSet<u64>>());
    assert!(!a_seqs.is_empty());
    assert!(!b_seqs.is_empty());
}

// --- Handler Failures ---

#[test]
fn test_handler_failure_reported_and_acked() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let events = conn.events();
    let sub = conn
        .subscribe("foo", SubscriptionOptions::default(), |_msg| {
            Err("handler exploded".into())
        })
        .unwrap();

    conn.publish("foo", "x").unwrap();

    let event = next_event(&events, |e| matches!(e, SessionEvent::CallbackFailed { .. }));
    match event {
        SessionEvent::CallbackFailed {
            subscription,
            sequence,
            error,
            acked,
            ..
        } => {
            assert_eq!(subscription, sub.id());
            assert_eq!(sequence, Sequence(1));
            assert_eq!(error, "handler exploded");
            assert!(acked);
        }
        other => panic!("Expected CallbackFailed, got {:?}", other),
    }
    wait_for(|| broker.pending_count() == 0);
}

#[test]
fn test_withheld_ack_redelivers_after_ack_wait() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let (tx, rx) = unbounded();

    let _sub = conn
        .subscribe(
            "foo",
            SubscriptionOptions::default()
                .with_ack_policy(AckPolicy::OnSuccess)
                .with_ack_wait(Duration::from_millis(100)),
            move |msg| {
                let _ = tx.send(msg.clone());
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err("not yet".into());
                }
                Ok(())
            },
        )
        .unwrap();

    conn.publish("foo", "retry-me").unwrap();

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.sequence, second.sequence);
    assert!(!first.redelivered);
    assert!(second.redelivered);
    wait_for(|| broker.pending_count() == 0);
}

#[test]
fn test_panicking_handler_keeps_dispatching() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let (tx, rx) = unbounded();
    let _sub = conn
        .subscribe("foo", SubscriptionOptions::default(), move |msg| {
            if msg.sequence == Sequence(1) {
                panic!("first message is poison");
            }
            let _ = tx.send(msg.sequence);
            Ok(())
        })
        .unwrap();

    conn.publish("foo", "poison").unwrap();
    conn.publish("foo", "fine").unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Sequence(2));
}

// --- Close ---

#[test]
fn test_close_cancels_publish_sync() {
    init_tracing();
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let publisher = conn.publisher();

    broker.set_responsive(false);
    let waiter = thread::spawn(move || {
        publisher.publish_sync("foo", "Hello World", Duration::from_secs(10))
    });
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    conn.close();

    assert_eq!(
        waiter.join().unwrap(),
        Err(courier::PublishError::ConnectionClosed)
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_close_cancels_publish_sync_inside_handler() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let publisher = conn.publisher();
    let (entered_tx, entered_rx) = unbounded();
    let (gate_tx, gate_rx) = unbounded::<()>();
    let (result_tx, result_rx) = unbounded();

    let _sub = conn
        .subscribe("in", SubscriptionOptions::default(), move |_msg| {
            let _ = entered_tx.send(());
            let _ = gate_rx.recv();
            let _ = result_tx.send(publisher.publish_sync("out", "x", Duration::from_secs(5)));
            Ok(())
        })
        .unwrap();

    conn.publish("in", "go").unwrap();
    entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    broker.set_responsive(false);
    gate_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    conn.close();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        result_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Err(courier::PublishError::ConnectionClosed)
    );
}

#[test]
fn test_close_is_idempotent_and_stops_subscriptions() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let events = conn.events();
    let (sub, _rx) = collect(&conn, "foo", SubscriptionOptions::default());

    conn.close();
    conn.close();

    assert_eq!(conn.status(), SessionStatus::Closed);
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(sub.dispatch_state(), courier::DispatchState::Stopped);
    assert_eq!(broker.client_count(), 0);
    sub.unsubscribe().unwrap();

    let closed: Vec<SessionEvent> = events.try_iter().collect();
    assert_eq!(closed, vec![SessionEvent::Closed]);
}

#[test]
fn test_close_fails_async_publishes_once() {
    let broker = test_broker();
    let conn = connect(&broker, "client");
    let publisher = conn.publisher();
    let (tx, rx) = unbounded();

    broker.set_responsive(false);
    for _ in 0..3 {
        let tx = tx.clone();
        publisher
            .publish_async("foo", "x", move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
    }
    drop(tx);
    conn.close();

    let results: Vec<_> = rx.iter().collect();
    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|r| *r == Err(courier::PublishError::ConnectionClosed)));
}

#[test]
fn test_close_from_handler() {
    let broker = test_broker();
    let conn = Arc::new(connect(&broker, "client"));
    let (tx, rx) = unbounded();

    let inner = Arc::clone(&conn);
    let _sub = conn
        .subscribe("shutdown", SubscriptionOptions::default(), move |_msg| {
            inner.close();
            let _ = tx.send(());
            Ok(())
        })
        .unwrap();

    conn.publish("shutdown", "now").unwrap();

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(conn.status(), SessionStatus::Closed);
}

// --- Reconnect ---

fn reconnect_options() -> ConnectionOptions {
    test_options().with_reconnect(ReconnectPolicy {
        max_attempts: 20,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
    })
}

#[test]
fn test_reconnect_after_sever() {
    init_tracing();
    let broker = test_broker();
    let conn =
        Connection::connect(broker.clone(), "test-cluster", "client", reconnect_options()).unwrap();
    let events = conn.events();
    let (_durable, durable_rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));
    let (_plain, plain_rx) = collect(&conn, "orders", SubscriptionOptions::default());

    assert!(broker.sever("client"));

    next_event(&events, |e| *e == SessionEvent::Disconnected);
    let event = next_event(&events, |e| matches!(e, SessionEvent::Reconnected { .. }));
    assert_eq!(
        event,
        SessionEvent::Reconnected {
            resumed_durables: 1,
            restarted: 1,
        }
    );
    assert_eq!(conn.status(), SessionStatus::Open);

    conn.publish("orders", "after").unwrap();
    assert_eq!(
        durable_rx.recv_timeout(Duration::from_secs(2)).unwrap().text(),
        Some("after")
    );
    assert_eq!(
        plain_rx.recv_timeout(Duration::from_secs(2)).unwrap().text(),
        Some("after")
    );
}

#[test]
fn test_durable_catches_up_after_outage() {
    let broker = test_broker();
    let conn =
        Connection::connect(broker.clone(), "test-cluster", "client", reconnect_options()).unwrap();
    let events = conn.events();
    let (_sub, rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));

    // Another client keeps publishing while this one is cut off.
    let other = connect(&broker, "other");
    broker.set_reachable(false);
    broker.sever("client");
    next_event(&events, |e| *e == SessionEvent::Disconnected);
    other.publish("orders", "missed-1").unwrap();
    other.publish("orders", "missed-2").unwrap();
    broker.set_reachable(true);

    next_event(&events, |e| matches!(e, SessionEvent::Reconnected { .. }));
    let texts: Vec<String> = (0..2)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(2))
                .unwrap()
                .text()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(texts, vec!["missed-1", "missed-2"]);
}

#[test]
fn test_unacked_publish_resent_after_reconnect() {
    let broker = test_broker();
    let conn =
        Connection::connect(broker.clone(), "test-cluster", "client", reconnect_options()).unwrap();
    let events = conn.events();
    let publisher = conn.publisher();

    broker.set_reachable(false);
    broker.sever("client");
    next_event(&events, |e| *e == SessionEvent::Disconnected);

    let waiter = thread::spawn(move || {
        publisher.publish_sync("foo", "during outage", Duration::from_secs(5))
    });
    thread::sleep(Duration::from_millis(50));
    broker.set_reachable(true);

    assert_eq!(waiter.join().unwrap(), Ok(Sequence(1)));
    assert_eq!(broker.message_count("foo"), 1);
}

#[test]
fn test_close_durable_retried_after_reconnect() {
    let broker = test_broker();
    let conn =
        Connection::connect(broker.clone(), "test-cluster", "client", reconnect_options()).unwrap();
    let events = conn.events();
    let (sub, _rx) = collect(&conn, "orders", SubscriptionOptions::durable("audit"));

    broker.set_reachable(false);
    broker.sever("client");
    next_event(&events, |e| *e == SessionEvent::Disconnected);

    assert_eq!(
        sub.close_durable(),
        Err(courier::SubscribeError::Connection(ConnectionError::LostConnection))
    );
    assert!(sub.close_durable().is_err());
    assert!(broker.has_durable("client", "audit", "orders"));

    broker.set_reachable(true);
    next_event(&events, |e| matches!(e, SessionEvent::Reconnected { .. }));

    sub.close_durable().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert!(!broker.has_durable("client", "audit", "orders"));
    // Confirmed now: further calls are no-ops again.
    sub.close_durable().unwrap();
}

#[test]
fn test_unanswered_heartbeats_exhaust_reconnects() {
    init_tracing();
    let broker = test_broker();
    let options = ConnectionOptions::default()
        .with_connect_timeout(Duration::from_millis(100))
        .with_request_timeout(Duration::from_millis(100))
        .with_pings(Duration::from_millis(20), 2)
        .with_reconnect(ReconnectPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        });
    let conn = Connection::connect(broker.clone(), "test-cluster", "client", options).unwrap();
    let events = conn.events();
    let (sub, _rx) = collect(&conn, "foo", SubscriptionOptions::default());

    broker.set_responsive(false);

    next_event(&events, |e| *e == SessionEvent::Disconnected);
    let lost = next_event(&events, |e| matches!(e, SessionEvent::ConnectionLost(_)));
    assert_eq!(lost, SessionEvent::ConnectionLost(ConnectionError::LostConnection));
    next_event(&events, |e| *e == SessionEvent::Closed);

    assert_eq!(conn.status(), SessionStatus::Closed);
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(
        conn.publish("foo", "late"),
        Err(courier::PublishError::ConnectionClosed)
    );
}
