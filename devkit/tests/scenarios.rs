//! End-to-end scenarios: real TCP between raw peers or node sessions and an
//! in-process collector.

use sensorlink_collector::{load_config_from, ClientStatus, CollectorEvent, StatusReason};
use sensorlink_devkit::{RawPeer, SequenceSensor, StaticSensor, TestCollector, DEFAULT_WAIT};
use sensorlink_node::{ClientSession, SessionConfig, SessionEvent, SessionState};
use sensorlink_protocol::Reading;
use std::io::Write;
use std::time::Duration;

const SHORT: Duration = Duration::from_millis(300);

fn fast_session() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_millis(60),
        data_interval: Duration::from_millis(40),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn scenario_a_first_connect_goes_online() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();

    let handshake = peer.handshake("C1").await.unwrap();
    assert!(handshake.success);
    assert_eq!(handshake.identity, "C1");

    let status = collector.next_status(DEFAULT_WAIT).await.unwrap();
    assert_eq!(status.identity, "C1");
    assert_eq!(status.status, ClientStatus::Online);
    assert_eq!(status.reason, StatusReason::FirstConnect);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_b_duplicate_identity_is_rejected_and_closed() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut first = RawPeer::connect(collector.addr()).await.unwrap();
    assert!(first.handshake("C1").await.unwrap().success);
    collector.next_status(DEFAULT_WAIT).await.unwrap();

    let mut second = RawPeer::connect(collector.addr()).await.unwrap();
    let handshake = second.handshake("C1").await.unwrap();
    assert!(!handshake.success);
    assert!(second.expect_closed(DEFAULT_WAIT).await.unwrap());

    // la session d'origine n'est pas touchée
    first.data("C1", 21.0, 40.0).await.unwrap();
    collector
        .wait_until(DEFAULT_WAIT, |c| c.history().len() == 1)
        .await
        .unwrap();
    assert_eq!(collector.client("C1").unwrap().status, ClientStatus::Online);
    assert_eq!(collector.online_count(), 1);
    assert_eq!(collector.health().get_health(&collector.hub()).handshakes_rejected, 1);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_c_data_updates_history_and_fires_reading() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();
    peer.handshake("C1").await.unwrap();
    collector.next_status(DEFAULT_WAIT).await.unwrap();

    peer.data("C1", 23.4, 55.0).await.unwrap();

    match collector.next_event(DEFAULT_WAIT).await.unwrap() {
        CollectorEvent::Reading(reading) => {
            assert_eq!(reading.identity, "C1");
            assert_eq!(reading.temperature, 23.4);
            assert_eq!(reading.humidity, 55.0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let history = collector.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].identity, "C1");
    assert_eq!(collector.client("C1").unwrap().last_reading, Some(Reading::new(23.4, 55.0)));

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_d_silence_times_out_then_heartbeat_recovers() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();
    peer.handshake("C1").await.unwrap();
    collector.next_status(DEFAULT_WAIT).await.unwrap();

    let offline = collector
        .wait_for_status("C1", ClientStatus::Offline, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(offline.reason, StatusReason::Timeout);
    let view = collector.client("C1").unwrap();
    assert_eq!(view.status, ClientStatus::Offline);
    assert_eq!(view.missed_heartbeats, 0);

    // une seule transition pour cet épisode de silence
    collector.expect_no_status(SHORT).await.unwrap();

    // la connexion est restée ouverte : un heartbeat suffit
    peer.heartbeat("C1").await.unwrap();
    let online = collector
        .wait_for_status("C1", ClientStatus::Online, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(online.reason, StatusReason::HeartbeatRecovered);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_e_graceful_disconnect_keeps_last_reading() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();
    peer.handshake("C1").await.unwrap();
    peer.data("C1", 19.5, 61.0).await.unwrap();
    peer.disconnect("C1").await.unwrap();

    let offline = collector
        .wait_for_status("C1", ClientStatus::Offline, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(offline.reason, StatusReason::GracefulDisconnect);
    assert!(peer.expect_closed(DEFAULT_WAIT).await.unwrap());

    let view = collector.client("C1").unwrap();
    assert_eq!(view.status, ClientStatus::Offline);
    assert_eq!(view.last_reading, Some(Reading::new(19.5, 61.0)));

    // retour après déconnexion
    let mut again = RawPeer::connect(collector.addr()).await.unwrap();
    assert!(again.handshake("C1").await.unwrap().success);
    let online = collector
        .wait_for_status("C1", ClientStatus::Online, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(online.reason, StatusReason::Reconnected);
    assert_eq!(collector.client("C1").unwrap().sessions, 2);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_after_timeout_replaces_lingering_connection() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut stale = RawPeer::connect(collector.addr()).await.unwrap();
    stale.handshake("C1").await.unwrap();
    collector
        .wait_for_status("C1", ClientStatus::Offline, DEFAULT_WAIT)
        .await
        .unwrap();

    let mut fresh = RawPeer::connect(collector.addr()).await.unwrap();
    assert!(fresh.handshake("C1").await.unwrap().success);
    let online = collector
        .wait_for_status("C1", ClientStatus::Online, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(online.reason, StatusReason::ReplacedConnection);
    assert!(stale.expect_closed(DEFAULT_WAIT).await.unwrap());

    // la fermeture de l'ancienne connexion ne touche pas la nouvelle session
    collector.expect_no_status(Duration::from_millis(100)).await.unwrap();
    fresh.heartbeat("C1").await.unwrap();
    assert_eq!(collector.client("C1").unwrap().status, ClientStatus::Online);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn abrupt_close_marks_connection_lost() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();
    peer.handshake("C1").await.unwrap();
    drop(peer);

    let offline = collector
        .wait_for_status("C1", ClientStatus::Offline, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(offline.reason, StatusReason::ConnectionLost);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_identity_gets_assigned_names() {
    let collector = TestCollector::start().await.unwrap();

    let mut first = RawPeer::connect(collector.addr()).await.unwrap();
    let mut second = RawPeer::connect(collector.addr()).await.unwrap();
    assert_eq!(first.handshake("").await.unwrap().identity, "CLIENT1");
    assert_eq!(second.handshake("").await.unwrap().identity, "CLIENT2");

    // les frames suivantes utilisent l'identité attribuée
    first.data("CLIENT1", 20.0, 50.0).await.unwrap();
    collector
        .wait_until(DEFAULT_WAIT, |c| c.client("CLIENT1").and_then(|v| v.last_reading).is_some())
        .await
        .unwrap();

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_connects_leave_one_online() {
    let collector = TestCollector::start().await.unwrap();
    let addr = collector.addr();

    let attempts: Vec<_> = (0..6)
        .map(|_| {
            tokio::spawn(async move {
                let mut peer = RawPeer::connect(addr).await.unwrap();
                let handshake = peer.handshake("C1").await.unwrap();
                (handshake.success, peer)
            })
        })
        .collect();

    let mut peers = Vec::new();
    let mut accepted = 0;
    for attempt in attempts {
        let (success, peer) = attempt.await.unwrap();
        if success {
            accepted += 1;
        }
        peers.push(peer);
    }
    assert_eq!(accepted, 1);
    assert_eq!(collector.online_count(), 1);
    assert_eq!(collector.hub().lock().registry().len(), 1);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn frames_before_connect_are_dropped_and_garbage_closes() {
    let collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();

    peer.data("C1", 20.0, 50.0).await.unwrap();
    peer.heartbeat("C1").await.unwrap();
    assert!(peer.handshake("C1").await.unwrap().success);
    assert!(collector.history().is_empty());

    peer.send_raw(b"{\"kind\":\"teleport\"}\n").await.unwrap();
    assert!(peer.expect_closed(DEFAULT_WAIT).await.unwrap());
    collector
        .wait_until(DEFAULT_WAIT, |c| c.client("C1").map(|v| v.status) == Some(ClientStatus::Offline))
        .await
        .unwrap();
    assert_eq!(collector.health().get_health(&collector.hub()).malformed_frames, 1);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn node_session_streams_pauses_and_disconnects() {
    let mut collector = TestCollector::start().await.unwrap();
    let (mut session, mut events) = ClientSession::new(fast_session(), StaticSensor::new(22.0, 45.0));

    let identity = session.connect(&collector.addr().to_string(), "N1").await.unwrap();
    assert_eq!(identity, "N1");
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected { identity: "N1".into() });

    collector
        .wait_until(DEFAULT_WAIT, |c| c.history().len() >= 3)
        .await
        .unwrap();

    session.pause();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let paused_len = collector.history().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(collector.history().len(), paused_len);
    // les heartbeats continuent : toujours online
    assert_eq!(collector.client("N1").unwrap().status, ClientStatus::Online);

    session.resume();
    collector
        .wait_until(DEFAULT_WAIT, |c| c.history().len() > paused_len)
        .await
        .unwrap();

    session.disconnect().await;
    session.disconnect().await;
    let offline = collector
        .wait_for_status("N1", ClientStatus::Offline, DEFAULT_WAIT)
        .await
        .unwrap();
    assert_eq!(offline.reason, StatusReason::GracefulDisconnect);
    assert_eq!(session.state(), SessionState::Disconnected);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn node_readings_reach_history_in_order() {
    let mut collector = TestCollector::start().await.unwrap();
    let sequence = vec![
        Reading::new(18.5, 40.0),
        Reading::new(19.0, 41.5),
        Reading::new(19.5, 43.0),
    ];
    let (mut session, _events) = ClientSession::new(fast_session(), SequenceSensor::new(sequence.clone()));
    session.connect(&collector.addr().to_string(), "N2").await.unwrap();

    collector
        .wait_until(DEFAULT_WAIT, |c| c.history().len() >= 4)
        .await
        .unwrap();
    session.disconnect().await;

    let received: Vec<Reading> = collector
        .history()
        .iter()
        .map(|entry| Reading::new(entry.temperature, entry.humidity))
        .collect();
    assert_eq!(&received[..3], &sequence[..]);
    // la séquence reboucle
    assert_eq!(received[3], sequence[0]);
    assert!(collector.history().iter().all(|entry| entry.identity == "N2"));

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn node_session_reports_rejection() {
    let collector = TestCollector::start().await.unwrap();
    let mut holder = RawPeer::connect(collector.addr()).await.unwrap();
    holder.handshake("N1").await.unwrap();

    let (mut session, mut events) = ClientSession::new(fast_session(), StaticSensor::new(22.0, 45.0));
    let err = session.connect(&collector.addr().to_string(), "N1").await.unwrap_err();
    assert!(matches!(err, sensorlink_node::SessionError::HandshakeRejected(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(events.recv().await.unwrap(), SessionEvent::Rejected { .. }));

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn collector_shutdown_unblocks_everyone() {
    let collector = TestCollector::start().await.unwrap();
    let hub = collector.hub();

    let mut bound = RawPeer::connect(collector.addr()).await.unwrap();
    bound.handshake("C1").await.unwrap();
    let mut idle = RawPeer::connect(collector.addr()).await.unwrap();
    let (mut session, mut events) = ClientSession::new(fast_session(), StaticSensor::new(22.0, 45.0));
    session.connect(&collector.addr().to_string(), "N1").await.unwrap();

    tokio::time::timeout(DEFAULT_WAIT, collector.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();

    assert!(bound.expect_closed(DEFAULT_WAIT).await.unwrap());
    assert!(idle.expect_closed(DEFAULT_WAIT).await.unwrap());

    let lost = tokio::time::timeout(DEFAULT_WAIT, async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::ConnectionLost { reason } = event {
                return reason;
            }
        }
        String::new()
    })
    .await
    .unwrap();
    assert!(!lost.is_empty());
    assert_eq!(session.state(), SessionState::Disconnected);
    session.disconnect().await;

    let hub = hub.lock();
    assert_eq!(hub.online_count(), 0);
    assert_eq!(hub.client("C1").unwrap().status, ClientStatus::Offline);
}

#[tokio::test]
async fn yaml_config_bounds_history() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "listen: 127.0.0.1:0\nmax_history: 2\nliveness:\n  grace_ms: 5000").unwrap();
    let config = load_config_from(file.path()).await;
    assert_eq!(config.max_history, 2);

    let collector = TestCollector::start_with(config).await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();
    peer.handshake("C1").await.unwrap();
    for n in 0..3 {
        peer.data("C1", 20.0 + n as f64, 50.0).await.unwrap();
    }
    collector
        .wait_until(DEFAULT_WAIT, |c| {
            c.client("C1").and_then(|v| v.last_reading) == Some(Reading::new(22.0, 50.0))
        })
        .await
        .unwrap();

    let history = collector.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].temperature, 21.0);
    assert_eq!(history[1].temperature, 22.0);

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_events_serialize_for_presentation() {
    let mut collector = TestCollector::start().await.unwrap();
    let mut peer = RawPeer::connect(collector.addr()).await.unwrap();
    peer.handshake("C1").await.unwrap();

    let event = collector.next_event(DEFAULT_WAIT).await.unwrap();
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "status");
    assert_eq!(json["identity"], "C1");
    assert_eq!(json["status"], "online");
    assert_eq!(json["reason"], "first connect");

    collector.shutdown().await.unwrap();
}
