//! Connection loss, buffering and subscription restoration.

use courier::{ClientError, Connection, ConnectionConfig, ConnectionStatus, LoopbackServer};
use crossbeam_channel::{unbounded, Receiver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection plus channels fed by its disconnected/reconnected handlers.
struct Watched {
    conn: Connection,
    disconnected: Receiver<()>,
    reconnected: Receiver<()>,
}

fn watched(server: &LoopbackServer, config: ConnectionConfig) -> Watched {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let conn = server.connect(config).unwrap();

    let (dtx, disconnected) = unbounded();
    conn.set_disconnected_handler(move || {
        let _ = dtx.send(());
    });
    let (rtx, reconnected) = unbounded();
    conn.set_reconnected_handler(move || {
        let _ = rtx.send(());
    });

    Watched {
        conn,
        disconnected,
        reconnected,
    }
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_auto_unsub_and_reconnect() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;
    let received = Arc::new(AtomicUsize::new(0));
    let max = 10;

    let counter = Arc::clone(&received);
    let sub = conn
        .subscribe("foo", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    sub.auto_unsubscribe(max).unwrap();

    // Half before the outage.
    for _ in 0..(max / 2) {
        conn.publish("foo", b"Hello").unwrap();
    }
    conn.flush(EVENT_TIMEOUT).unwrap();

    server.restart();
    w.reconnected
        .recv_timeout(EVENT_TIMEOUT)
        .expect("reconnected handler not called");
    assert!(sub.is_valid());
    assert_eq!(conn.stats().reconnects, 1);

    // More than enough after; the server only has the remainder.
    for _ in 0..(max * 3) {
        conn.publish("foo", b"Hello").unwrap();
    }
    conn.flush(EVENT_TIMEOUT).unwrap();

    assert!(wait_until(Duration::from_secs(2), || received.load(Ordering::SeqCst) == max as usize));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(received.load(Ordering::SeqCst), max as usize);
    assert_eq!(conn.stats().in_msgs, max);
    assert!(!sub.is_valid());

    // Exactly one reconnect notification.
    assert!(w.reconnected.try_recv().is_err());
    conn.close();
}

#[test]
fn test_exhausted_subscription_not_restored() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;

    let sub = conn.subscribe_sync("foo").unwrap();
    sub.auto_unsubscribe(3).unwrap();
    for _ in 0..5 {
        conn.publish("foo", b"Hello").unwrap();
    }
    conn.flush(EVENT_TIMEOUT).unwrap();
    assert_eq!(sub.pending().0, 3);

    server.restart();
    w.reconnected.recv_timeout(EVENT_TIMEOUT).unwrap();

    // Everything it may receive is already queued; nothing to ask for.
    assert_eq!(server.interest_count(), 0);
    for _ in 0..3 {
        sub.next_message(Duration::from_millis(100)).unwrap();
    }
    assert_eq!(
        sub.next_message(Duration::from_millis(100)),
        Err(ClientError::MaxMessagesReached)
    );
    conn.close();
}

#[test]
fn test_queued_messages_survive_reconnect() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;

    let sub = conn.queue_subscribe_sync("jobs", "workers").unwrap();
    for i in 0..3u8 {
        conn.publish("jobs", &[i]).unwrap();
    }
    conn.flush(EVENT_TIMEOUT).unwrap();

    server.restart();
    w.reconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(sub.pending().0, 3);
    assert_eq!(server.interest_count(), 1);

    conn.publish("jobs", &[3]).unwrap();
    conn.flush(EVENT_TIMEOUT).unwrap();

    for i in 0..4u8 {
        let msg = sub.next_message(Duration::from_millis(100)).unwrap();
        assert_eq!(msg.payload, vec![i]);
    }
    conn.close();
}

#[test]
fn test_publish_buffered_while_disconnected() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;
    let sub = conn.subscribe_sync("foo").unwrap();

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert!(conn.is_reconnecting());

    for i in 0..3u8 {
        conn.publish("foo", &[i]).unwrap();
    }
    assert_eq!(conn.stats().buffered_bytes, 3);
    assert_eq!(conn.flush(Duration::from_millis(50)), Err(ClientError::NotConnected));

    server.start();
    w.reconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    conn.flush(EVENT_TIMEOUT).unwrap();
    assert_eq!(conn.stats().buffered_bytes, 0);

    for i in 0..3u8 {
        let msg = sub.next_message(Duration::from_millis(100)).unwrap();
        assert_eq!(msg.payload, vec![i]);
    }
    conn.close();
}

#[test]
fn test_publish_rejected_without_reconnect_buffer() {
    let server = LoopbackServer::new();
    let w = watched(
        &server,
        ConnectionConfig {
            reconnect_buffer_size: 0,
            ..Default::default()
        },
    );

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(w.conn.publish("foo", b"x"), Err(ClientError::NotConnected));
    w.conn.close();
}

#[test]
fn test_reconnect_buffer_exceeded() {
    let server = LoopbackServer::new();
    let w = watched(
        &server,
        ConnectionConfig {
            reconnect_buffer_size: 16,
            ..Default::default()
        },
    );

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    w.conn.publish("foo", &[0; 10]).unwrap();
    assert_eq!(
        w.conn.publish("foo", &[0; 10]),
        Err(ClientError::ReconnectBufferExceeded)
    );
    w.conn.close();
}

#[test]
fn test_subscribe_while_disconnected() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    let sub = conn.subscribe_sync("late").unwrap();

    server.start();
    w.reconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    conn.publish("late", b"hello").unwrap();
    conn.flush(EVENT_TIMEOUT).unwrap();

    assert_eq!(
        sub.next_message(Duration::from_millis(100)).unwrap().payload,
        b"hello"
    );
    conn.close();
}

#[test]
fn test_unsubscribe_while_disconnected_not_restored() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;
    let sub = conn.subscribe_sync("foo").unwrap();

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    sub.unsubscribe().unwrap();

    server.start();
    w.reconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(server.interest_count(), 0);
    conn.close();
}

#[test]
fn test_reconnect_disabled_closes() {
    let server = LoopbackServer::new();
    let w = watched(
        &server,
        ConnectionConfig {
            allow_reconnect: false,
            ..Default::default()
        },
    );
    let (closed_tx, closed_rx) = unbounded();
    w.conn.set_closed_handler(move || {
        let _ = closed_tx.send(());
    });
    let sub = w.conn.subscribe_sync("foo").unwrap();

    server.shutdown();
    closed_rx.recv_timeout(EVENT_TIMEOUT).unwrap();

    assert!(w.conn.is_closed());
    assert_eq!(w.conn.status(), ConnectionStatus::Closed);
    assert!(w.disconnected.try_recv().is_err());
    assert_eq!(
        sub.next_message(Duration::from_millis(10)),
        Err(ClientError::ConnectionClosed)
    );
    assert_eq!(w.conn.publish("foo", b"x"), Err(ClientError::ConnectionClosed));
}

#[test]
fn test_wait_for_reconnect() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());

    assert!(w.conn.wait_for_reconnect(Duration::from_millis(10)).is_ok());

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(
        w.conn.wait_for_reconnect(Duration::from_millis(20)),
        Err(ClientError::Timeout)
    );

    let restarter = {
        let server = server.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            server.start();
        })
    };
    w.conn.wait_for_reconnect(EVENT_TIMEOUT).unwrap();
    assert_eq!(w.conn.status(), ConnectionStatus::Connected);
    restarter.join().unwrap();
    w.conn.close();
}

#[test]
fn test_close_releases_wait_for_reconnect() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());

    server.shutdown();
    w.disconnected.recv_timeout(EVENT_TIMEOUT).unwrap();

    let closer = {
        let conn = w.conn.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            conn.close();
        })
    };
    let start = Instant::now();
    assert_eq!(
        w.conn.wait_for_reconnect(EVENT_TIMEOUT),
        Err(ClientError::ConnectionClosed)
    );
    assert!(start.elapsed() < Duration::from_secs(1));
    closer.join().unwrap();
}

#[test]
fn test_async_delivery_resumes_after_reconnect() {
    let server = LoopbackServer::new();
    let w = watched(&server, ConnectionConfig::default());
    let conn = &w.conn;
    let (tx, rx) = unbounded();

    conn.subscribe("ticks.*", move |msg| {
        let _ = tx.send(msg.subject);
    })
    .unwrap();

    conn.publish("ticks.a", b"").unwrap();
    assert_eq!(rx.recv_timeout(EVENT_TIMEOUT).unwrap(), "ticks.a");

    server.restart();
    w.reconnected.recv_timeout(EVENT_TIMEOUT).unwrap();

    conn.publish("ticks.b", b"").unwrap();
    assert_eq!(rx.recv_timeout(EVENT_TIMEOUT).unwrap(), "ticks.b");
    assert_eq!(conn.stats().threads_created, 1);
    conn.close();
}
