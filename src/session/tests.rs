//! Session module tests

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

fn msg(topic: &str, qos: QoS) -> Message {
    Message::new(topic, topic.as_bytes().to_vec(), qos)
}

fn topics(queue: &VecDeque<Message>) -> Vec<&str> {
    queue.iter().map(|m| m.topic.as_ref()).collect()
}

#[test]
fn test_packet_id_wraps_and_skips_inflight() {
    let mut session = Session::new(Arc::from("c"));
    assert_eq!(session.next_packet_id(), 1);
    assert_eq!(session.next_packet_id(), 2);

    session.set_next_packet_id(u16::MAX);
    assert_eq!(session.next_packet_id(), u16::MAX);
    // zero is never handed out
    assert_eq!(session.next_packet_id(), 1);

    session.set_next_packet_id(1);
    let held = session.track(msg("a", QoS::AtLeastOnce));
    assert_eq!(held, 1);
    session.set_next_packet_id(1);
    assert_eq!(session.next_packet_id(), 2);
}

#[test]
fn test_queue_drops_oldest_when_full() {
    let mut session = Session::new(Arc::from("c"));
    assert!(session.queue_message(msg("1", QoS::AtMostOnce), 2));
    assert!(session.queue_message(msg("2", QoS::AtMostOnce), 2));
    assert!(!session.queue_message(msg("3", QoS::AtMostOnce), 2));
    assert_eq!(topics(&session.outgoing), vec!["2", "3"]);

    let taken = session.take_outgoing();
    assert_eq!(taken.len(), 2);
    assert!(session.outgoing.is_empty());
}

#[test]
fn test_unbounded_queue() {
    let mut session = Session::new(Arc::from("c"));
    for i in 0..100 {
        assert!(session.queue_message(msg(&i.to_string(), QoS::AtMostOnce), 0));
    }
    assert_eq!(session.outgoing.len(), 100);
}

#[test]
fn test_qos1_handshake() {
    let mut session = Session::new(Arc::from("c"));
    let pid = session.track(msg("t", QoS::AtLeastOnce));
    assert_eq!(session.inflight[&pid].state, DeliveryState::Pending);

    session.mark_sent(pid);
    assert_eq!(session.inflight[&pid].state, DeliveryState::Sent);

    // PUBREC/PUBCOMP do not apply to QoS 1
    assert!(!session.receive(pid));
    assert!(session.complete(pid).is_none());

    let done = session.acknowledge(pid).expect("entry");
    assert_eq!(done.message.topic.as_ref(), "t");
    assert!(session.inflight.is_empty());
    assert!(session.acknowledge(pid).is_none());
}

#[test]
fn test_qos2_handshake() {
    let mut session = Session::new(Arc::from("c"));
    let pid = session.track(msg("t", QoS::ExactlyOnce));
    session.mark_sent(pid);

    // PUBACK does not complete a QoS 2 exchange
    assert!(session.acknowledge(pid).is_none());
    // PUBCOMP before PUBREC is ignored
    assert!(session.complete(pid).is_none());

    assert!(session.receive(pid));
    assert_eq!(session.inflight[&pid].state, DeliveryState::Received);
    session.mark_sent(pid);
    assert_eq!(session.inflight[&pid].state, DeliveryState::Released);

    // a repeated PUBREC keeps the entry released
    assert!(session.receive(pid));
    assert_eq!(session.inflight[&pid].state, DeliveryState::Released);

    assert!(session.complete(pid).is_some());
    assert!(session.inflight.is_empty());
    assert!(!session.receive(pid));
}

#[test]
fn test_due_for_retry() {
    let mut session = Session::new(Arc::from("c"));
    let a = session.track(msg("a", QoS::AtLeastOnce));
    let b = session.track(msg("b", QoS::ExactlyOnce));
    session.mark_sent(a);
    session.mark_sent(b);

    assert!(session.due_for_retry(Duration::from_secs(3600)).is_empty());

    let due = session.due_for_retry(Duration::ZERO);
    let ids: Vec<u16> = due.iter().map(|e| e.packet_id).collect();
    assert_eq!(ids, vec![a, b]);
    assert!(due.iter().all(|e| e.retries == 1));
    assert_eq!(session.inflight[&a].retries, 1);
}

#[test]
fn test_incoming_qos2_is_stored_once() {
    let mut session = Session::new(Arc::from("c"));
    assert!(session.store_incoming(7, msg("in", QoS::ExactlyOnce)));
    assert!(!session.store_incoming(7, msg("dup", QoS::ExactlyOnce)));

    let released = session.release_incoming(7).expect("stored");
    assert_eq!(released.topic.as_ref(), "in");
    assert!(session.release_incoming(7).is_none());
}

#[test]
fn test_adopt_orders_stored_before_parked() {
    let mut stored = Session::new(Arc::from("c"));
    stored.queue_message(msg("old1", QoS::AtLeastOnce), 0);
    stored.queue_message(msg("old2", QoS::AtLeastOnce), 0);
    let s1 = stored.track(msg("inflight1", QoS::AtLeastOnce));
    let s2 = stored.track(msg("inflight2", QoS::ExactlyOnce));
    stored.receive(s2);
    stored.store_incoming(40, msg("incoming", QoS::ExactlyOnce));
    stored.subscriptions = vec![Subscription::new("c", "a/#", QoS::AtLeastOnce)];

    let mut live = Session::new(Arc::from("c"));
    live.queue_message(msg("parked", QoS::AtMostOnce), 0);
    live.adopt(stored);

    assert_eq!(topics(&live.outgoing), vec!["old1", "old2", "parked"]);
    let order: Vec<u16> = live.inflight_in_order().iter().map(|e| e.packet_id).collect();
    assert_eq!(order, vec![s1, s2]);
    assert_eq!(live.inflight[&s2].state, DeliveryState::Received);
    assert!(live.incoming.contains_key(&40));
    assert_eq!(live.subscriptions.len(), 1);

    // new ids never collide with adopted ones
    let next = live.track(msg("new", QoS::AtLeastOnce));
    assert!(next != s1 && next != s2);
    assert_eq!(live.inflight_in_order().last().map(|e| e.packet_id), Some(next));
}

#[test]
fn test_delivery_state_codes() {
    for state in [
        DeliveryState::Pending,
        DeliveryState::Sent,
        DeliveryState::Received,
        DeliveryState::Released,
    ] {
        assert_eq!(DeliveryState::from_u8(state.as_u8()), Some(state));
    }
    assert_eq!(DeliveryState::from_u8(9), None);
    assert!(DeliveryState::Released.awaiting_pubcomp());
    assert!(!DeliveryState::Sent.awaiting_pubcomp());
}

#[test]
fn test_store_get_save_clear() {
    let store = SessionStore::new(10);
    assert!(store.get("c").is_none());
    assert!(!store.clear("c"));

    let mut session = Session::new(Arc::from("other"));
    session.queue_message(msg("q", QoS::AtLeastOnce), 0);
    store.save(
        "c",
        session,
        vec![Subscription::new("c", "x/+", QoS::ExactlyOnce)],
    );

    let loaded = store.get("c").expect("saved");
    assert_eq!(loaded.client_id.as_ref(), "c");
    assert_eq!(loaded.subscriptions.len(), 1);
    assert_eq!(loaded.outgoing.len(), 1);
    assert!(store.contains("c"));
    assert_eq!(store.len(), 1);

    assert!(store.clear("c"));
    assert!(store.get("c").is_none());
    assert!(store.is_empty());
}

#[test]
fn test_store_enqueue_requires_session() {
    let store = SessionStore::new(2);
    assert!(!store.enqueue("nobody", msg("t", QoS::AtMostOnce)));

    store.save("c", Session::new(Arc::from("c")), Vec::new());
    assert!(store.enqueue("c", msg("1", QoS::AtLeastOnce)));
    assert!(store.enqueue("c", msg("2", QoS::AtLeastOnce)));
    assert!(store.enqueue("c", msg("3", QoS::AtLeastOnce)));

    let taken = store.take_outgoing("c");
    assert_eq!(topics(&taken), vec!["2", "3"]);
    assert!(store.take_outgoing("c").is_empty());
    assert!(store.take_outgoing("nobody").is_empty());
}

#[test]
fn test_store_requeue_front() {
    let store = SessionStore::new(0);
    assert!(!store.requeue_front("nobody", VecDeque::new()));

    store.save("c", Session::new(Arc::from("c")), Vec::new());
    store.enqueue("c", msg("1", QoS::AtLeastOnce));
    store.enqueue("c", msg("2", QoS::AtLeastOnce));
    let taken = store.take_outgoing("c");
    store.enqueue("c", msg("3", QoS::AtLeastOnce));

    assert!(store.requeue_front("c", taken));
    assert_eq!(topics(&store.take_outgoing("c")), vec!["1", "2", "3"]);
}

#[test]
fn test_store_restore_skips_corrupt() {
    use crate::persistence::{StoredMessage, StoredSession};

    let mut good = Session::new(Arc::from("good"));
    good.queue_message(msg("kept", QoS::AtLeastOnce), 0);
    let good = StoredSession::from_session(&good);

    let mut bad = StoredSession::from_session(&Session::new(Arc::from("bad")));
    bad.outgoing.push(StoredMessage {
        topic: "t".to_string(),
        payload: Vec::new(),
        qos: 7,
        retain: false,
    });

    let store = SessionStore::default();
    let restored = store.restore(vec![("good".to_string(), good), ("bad".to_string(), bad)]);
    assert_eq!(restored.len(), 1);
    assert_eq!(store.client_ids(), vec![Arc::<str>::from("good")]);
    assert_eq!(store.get("good").map(|s| s.outgoing.len()), Some(1));
}
