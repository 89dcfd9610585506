use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::auth::FnAuthenticator;
use crate::protocol::{Connect, ConnectReturnCode};

fn counting_broker(accept: bool) -> (Broker, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let check = FnAuthenticator(move |_: Option<&str>, _: Option<&[u8]>| {
        counter.fetch_add(1, Ordering::SeqCst);
        accept
    });
    let broker = Broker::builder(BrokerConfig::default())
        .access_gate(AccessGate::new(Arc::new(check), Duration::from_secs(1)))
        .build();
    (broker, calls)
}

#[test_case(6, "client", true, ConnectReturnCode::UnacceptableProtocolVersion ; "protocol level")]
#[test_case(3, "client-id-longer-than-23-bytes", true, ConnectReturnCode::IdentifierRejected ; "v31 id length")]
#[test_case(4, "", false, ConnectReturnCode::IdentifierRejected ; "empty id")]
#[tokio::test]
async fn test_rejected_before_credentials(
    level: u8,
    client_id: &str,
    clean: bool,
    expected: ConnectReturnCode,
) {
    let (broker, calls) = counting_broker(false);
    let connect = Connect {
        protocol_level: level,
        client_id: client_id.to_string(),
        clean_session: clean,
        username: Some("user".to_string()),
        ..Default::default()
    };

    assert_eq!(broker.connect_return_code(&connect).await, expected);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_credentials_checked_last() {
    let (broker, calls) = counting_broker(false);
    let connect = Connect {
        protocol_level: 3,
        client_id: "short".to_string(),
        ..Default::default()
    };

    assert_eq!(
        broker.connect_return_code(&connect).await,
        ConnectReturnCode::BadUsernameOrPassword
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_will_published_only_on_abnormal_close() {
    assert!(CloseReason::Lost.publishes_will());
    assert!(CloseReason::Evicted.publishes_will());
    assert!(!CloseReason::Graceful.publishes_will());
    assert!(!CloseReason::Shutdown.publishes_will());
    assert!(!CloseReason::Rejected.publishes_will());
}

#[test]
fn test_max_qos_grant() {
    let grants = MaxQosGrant(QoS::AtLeastOnce);
    assert_eq!(grants.grant("c", "a/#", QoS::ExactlyOnce), QoS::AtLeastOnce);
    assert_eq!(grants.grant("c", "a/#", QoS::AtMostOnce), QoS::AtMostOnce);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = Broker::new(BrokerConfig::default());
    let (conn, mut rx) = broker.accept_channel();
    assert_eq!(broker.connections.len(), 1);

    tokio::join!(
        broker.close(&conn, CloseReason::Lost),
        broker.close(&conn, CloseReason::Lost)
    );
    assert!(conn.is_closed());
    assert!(broker.connections.is_empty());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_server_publish_reaches_subscriber() {
    let broker = Broker::new(BrokerConfig::default());
    let (conn, mut rx) = broker.accept_channel();
    let connect = Connect {
        client_id: "listener".to_string(),
        ..Default::default()
    };
    assert!(broker.handle_connect(&conn, connect).await.unwrap());
    assert!(matches!(rx.recv().await, Some(Packet::ConnAck(_))));

    broker
        .subscriptions
        .subscribe(crate::topic::Subscription::new("listener", "alerts", QoS::AtMostOnce));
    let fan_out = broker
        .publish(Message::new("alerts", "fire", QoS::AtLeastOnce))
        .await;
    assert_eq!(fan_out.delivered, 1);

    match rx.recv().await {
        Some(Packet::Publish(publish)) => assert_eq!(publish.qos, QoS::AtMostOnce),
        other => panic!("Expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn test_own_will_is_queued_in_saved_session() {
    let broker = Broker::new(BrokerConfig::default());
    let (conn, mut rx) = broker.accept_channel();
    let connect = Connect {
        client_id: "sensor".to_string(),
        clean_session: false,
        will: Some(crate::protocol::Will {
            topic: "sensor/status".to_string(),
            payload: bytes::Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: false,
        }),
        ..Default::default()
    };
    assert!(broker.handle_connect(&conn, connect).await.unwrap());
    assert!(matches!(rx.recv().await, Some(Packet::ConnAck(_))));
    broker
        .subscriptions
        .subscribe(crate::topic::Subscription::new("sensor", "sensor/#", QoS::AtLeastOnce));

    broker.close(&conn, CloseReason::Lost).await;

    let saved = broker.sessions.get("sensor").expect("saved session");
    assert_eq!(saved.subscriptions.len(), 1);
    let queued: Vec<&str> = saved.outgoing.iter().map(|m| m.topic.as_ref()).collect();
    assert_eq!(queued, vec!["sensor/status"]);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_close_before_resume_keeps_stored_queue() {
    let broker = Broker::new(BrokerConfig::default());
    broker
        .sessions
        .save("p", crate::session::Session::new(Arc::from("p")), Vec::new());
    broker
        .sessions
        .enqueue("p", Message::new("stored", "x", QoS::AtLeastOnce));

    // bound, but the stored queue has not been folded in yet
    let (conn, _rx) = broker.accept_channel();
    let mut resumed = broker.sessions.get("p").expect("stored");
    resumed.outgoing.clear();
    conn.attach(
        crate::connection::ClientInfo {
            client_id: Arc::from("p"),
            version: ProtocolVersion::V311,
            clean_session: false,
            keep_alive: 0,
        },
        None,
        Some(resumed),
    );
    broker.connections.bind_client(Arc::from("p"), conn.clone());
    conn.deliver(Message::new("parked", "x", QoS::AtLeastOnce)).unwrap();

    broker.close(&conn, CloseReason::Lost).await;

    let saved = broker.sessions.get("p").expect("saved session");
    let queued: Vec<&str> = saved.outgoing.iter().map(|m| m.topic.as_ref()).collect();
    assert_eq!(queued, vec!["stored", "parked"]);
}
