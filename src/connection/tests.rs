//! Connection module tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::protocol::{Publish, QoS};

fn connection(limits: ConnectionLimits) -> (Arc<Connection>, mpsc::Receiver<Packet>) {
    with_writer(64, limits)
}

fn with_writer(
    capacity: usize,
    limits: ConnectionLimits,
) -> (Arc<Connection>, mpsc::Receiver<Packet>) {
    let (outbound, rx) = ChannelOutbound::new(capacity);
    (Arc::new(Connection::new(Arc::new(outbound), limits)), rx)
}

fn attach(conn: &Connection, client_id: &str, clean_session: bool) {
    conn.attach(
        ClientInfo {
            client_id: Arc::from(client_id),
            version: ProtocolVersion::V311,
            clean_session,
            keep_alive: 60,
        },
        None,
        None,
    );
}

fn expect_publish(rx: &mut mpsc::Receiver<Packet>) -> Publish {
    match rx.try_recv() {
        Ok(Packet::Publish(p)) => p,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_qos0_is_untracked() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    let sent = conn.deliver(Message::new("t", "x", QoS::AtMostOnce));
    assert_eq!(sent, Ok(Delivery::Sent));
    let publish = expect_publish(&mut rx);
    assert_eq!(publish.packet_id, None);
    assert_eq!(conn.inflight_count(), 0);
}

#[test]
fn test_qos1_tracked_until_puback() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    conn.deliver(Message::new("t", "x", QoS::AtLeastOnce)).unwrap();
    let publish = expect_publish(&mut rx);
    let pid = publish.packet_id.expect("packet id");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);
    assert_eq!(conn.snapshot().inflight[&pid].state, DeliveryState::Sent);

    assert!(conn.on_puback(pid).unwrap());
    assert_eq!(conn.inflight_count(), 0);
    assert!(!conn.on_puback(pid).unwrap());
}

#[test]
fn test_qos2_handshake() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    conn.deliver(Message::new("t", "x", QoS::ExactlyOnce)).unwrap();
    let pid = expect_publish(&mut rx).packet_id.unwrap();

    assert!(conn.on_pubrec(pid).unwrap());
    assert!(matches!(rx.try_recv(), Ok(Packet::PubRel(r)) if r.packet_id == pid));
    assert_eq!(conn.snapshot().inflight[&pid].state, DeliveryState::Released);

    assert!(conn.on_pubcomp(pid).unwrap());
    assert_eq!(conn.inflight_count(), 0);
}

#[test]
fn test_pubrec_for_unknown_id_still_answers() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    assert!(!conn.on_pubrec(99).unwrap());
    assert!(matches!(rx.try_recv(), Ok(Packet::PubRel(r)) if r.packet_id == 99));
}

#[test]
fn test_parks_until_connected() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", false);

    let parked = conn.deliver(Message::new("a", "1", QoS::AtLeastOnce));
    assert_eq!(parked, Ok(Delivery::Parked));
    assert!(rx.try_recv().is_err());

    conn.mark_connected();
    conn.resume(VecDeque::new()).unwrap();
    assert_eq!(expect_publish(&mut rx).topic.as_ref(), "a");
    assert_eq!(conn.parked_count(), 0);
}

#[test]
fn test_inflight_window_parks_and_drains_in_order() {
    let (conn, mut rx) = connection(ConnectionLimits {
        max_inflight: 1,
        max_queued: 0,
    });
    attach(&conn, "c", true);
    conn.mark_connected();

    for topic in ["1", "2", "3"] {
        conn.deliver(Message::new(topic, "x", QoS::AtLeastOnce)).unwrap();
    }
    // QoS 0 queues behind parked messages to keep order
    assert_eq!(
        conn.deliver(Message::new("4", "x", QoS::AtMostOnce)),
        Ok(Delivery::Parked)
    );

    let first = expect_publish(&mut rx);
    assert_eq!(first.topic.as_ref(), "1");
    assert!(rx.try_recv().is_err());
    assert_eq!(conn.parked_count(), 3);

    conn.on_puback(first.packet_id.unwrap()).unwrap();
    let second = expect_publish(&mut rx);
    assert_eq!(second.topic.as_ref(), "2");

    conn.on_puback(second.packet_id.unwrap()).unwrap();
    assert_eq!(expect_publish(&mut rx).topic.as_ref(), "3");
    assert_eq!(expect_publish(&mut rx).topic.as_ref(), "4");
    assert_eq!(conn.parked_count(), 0);
}

#[test]
fn test_retry_sets_dup() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    conn.deliver(Message::new("t", "x", QoS::AtLeastOnce)).unwrap();
    let original = expect_publish(&mut rx);
    assert!(!original.dup);

    assert_eq!(conn.retry(Duration::ZERO).unwrap(), 1);
    let retried = expect_publish(&mut rx);
    assert!(retried.dup);
    assert_eq!(retried.packet_id, original.packet_id);
}

#[test]
fn test_full_writer_drops_qos0() {
    let (conn, mut rx) = with_writer(1, ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    let first = conn.deliver(Message::new("a", "x", QoS::AtMostOnce));
    assert_eq!(first, Ok(Delivery::Sent));
    let second = conn.deliver(Message::new("b", "x", QoS::AtMostOnce));
    assert_eq!(second, Ok(Delivery::Dropped));
    assert_eq!(conn.parked_count(), 0);

    assert_eq!(expect_publish(&mut rx).topic.as_ref(), "a");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_full_writer_parks_acknowledged_messages() {
    let (conn, mut rx) = with_writer(1, ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    conn.deliver(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
    let parked = conn.deliver(Message::new("b", "x", QoS::ExactlyOnce));
    assert_eq!(parked, Ok(Delivery::Parked));
    // parked messages hold no packet id
    assert_eq!(conn.inflight_count(), 1);
    assert_eq!(conn.parked_count(), 1);

    // control packets see the same full queue
    assert_eq!(conn.send_packet(Packet::PingResp), Err(SendError::Full));

    let first = expect_publish(&mut rx);
    assert_eq!(first.topic.as_ref(), "a");
    conn.on_puback(first.packet_id.unwrap()).unwrap();

    let second = expect_publish(&mut rx);
    assert_eq!(second.topic.as_ref(), "b");
    assert_eq!(second.qos, QoS::ExactlyOnce);
    assert_eq!(conn.parked_count(), 0);
}

#[test]
fn test_retry_writes_parked_once_writer_drains() {
    let (conn, mut rx) = with_writer(1, ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();

    conn.deliver(Message::new("a", "x", QoS::AtMostOnce)).unwrap();
    conn.deliver(Message::new("b", "x", QoS::AtLeastOnce)).unwrap();
    assert_eq!(conn.parked_count(), 1);

    assert_eq!(expect_publish(&mut rx).topic.as_ref(), "a");
    assert_eq!(conn.retry(Duration::from_secs(60)), Ok(0));
    assert_eq!(expect_publish(&mut rx).topic.as_ref(), "b");
    assert_eq!(conn.parked_count(), 0);
}

#[test]
fn test_resume_orders_pending_before_parked() {
    let (conn, mut rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", false);
    conn.deliver(Message::new("after-bind", "x", QoS::AtLeastOnce)).unwrap();

    conn.mark_connected();
    let pending: VecDeque<Message> = ["stored1", "stored2"]
        .into_iter()
        .map(|t| Message::new(t, "x", QoS::AtLeastOnce))
        .collect();
    assert_eq!(conn.resume(pending), Ok(3));

    let order: Vec<String> = (0..3)
        .map(|_| expect_publish(&mut rx).topic.to_string())
        .collect();
    assert_eq!(order, vec!["stored1", "stored2", "after-bind"]);
}

#[test]
fn test_begin_close_snapshots_persistent_session() {
    let (conn, _rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", false);
    conn.deliver(Message::new("parked", "x", QoS::AtLeastOnce)).unwrap();

    let mut saved = None;
    assert!(conn.begin_close(|s| saved = Some(s)));
    let saved = saved.expect("snapshot");
    assert_eq!(saved.client_id.as_ref(), "c");
    assert_eq!(saved.outgoing.len(), 1);
    assert_eq!(conn.parked_count(), 0);

    // second close is a no-op
    assert!(!conn.begin_close(|_| panic!("snapshot taken twice")));
    assert_eq!(
        conn.deliver(Message::new("late", "x", QoS::AtMostOnce)),
        Err(SendError::Closed)
    );
}

#[test]
fn test_clean_session_has_no_snapshot() {
    let (conn, _rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    assert!(conn.begin_close(|_| panic!("clean sessions are not saved")));
}

#[test]
fn test_dropped_peer_is_transport_error() {
    let (conn, rx) = connection(ConnectionLimits::default());
    attach(&conn, "c", true);
    conn.mark_connected();
    drop(rx);

    let result = conn.deliver(Message::new("t", "x", QoS::AtMostOnce));
    assert!(matches!(result, Err(SendError::Transport(_))));
}

#[test]
fn test_closed_transport() {
    let (conn, _rx) = connection(ConnectionLimits::default());
    conn.close_transport();
    assert_eq!(conn.send_packet(Packet::PingResp), Err(SendError::Closed));
}

#[tokio::test]
async fn test_wait_closed() {
    let (conn, _rx) = connection(ConnectionLimits::default());
    let waiter = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.wait_closed().await })
    };
    assert!(!conn.is_closed());
    conn.mark_closed();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait_closed resolves")
        .unwrap();
    assert!(conn.is_closed());
}

#[test]
fn test_table_binding() {
    let table = ConnectionTable::new();
    let (a, _ra) = connection(ConnectionLimits::default());
    let (b, _rb) = connection(ConnectionLimits::default());
    table.insert(a.clone());
    table.insert(b.clone());
    assert_eq!(table.len(), 2);

    assert!(table.bind_client(Arc::from("c"), a.clone()).is_none());
    let previous = table.bind_client(Arc::from("c"), b.clone()).expect("previous");
    assert_eq!(previous.id(), a.id());

    // a stale unbind must not detach the newer connection
    assert!(!table.unbind_client_if("c", a.id()));
    assert_eq!(table.live("c").map(|c| c.id()), Some(b.id()));
    assert!(table.unbind_client_if("c", b.id()));
    assert!(table.live("c").is_none());

    table.remove(a.id());
    assert_eq!(table.all().len(), 1);
}
