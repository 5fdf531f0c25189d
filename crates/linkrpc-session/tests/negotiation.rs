mod common;

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{calc, pair, Raw};
use linkrpc_frame::{Outcome, ProtocolVersion, Value};
use linkrpc_session::{
    ClientConfig, Connection, ConnectionState, ControlMessage, ServerConfig, SessionError,
    UpgradePolicy,
};
use linkrpc_transport::{TransportUpgrade, UpgradeSide};

#[derive(Default)]
struct CountingUpgrade {
    client: AtomicUsize,
    server: AtomicUsize,
}

impl TransportUpgrade for CountingUpgrade {
    fn upgrade(&self, side: UpgradeSide) -> linkrpc_transport::Result<()> {
        match side {
            UpgradeSide::Client => self.client.fetch_add(1, Ordering::SeqCst),
            UpgradeSide::Server => self.server.fetch_add(1, Ordering::SeqCst),
        };
        Ok(())
    }
}

#[test]
fn current_peers_settle_on_version_2() {
    let (server, client) = pair(calc(), ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");
    assert_eq!(client.version(), ProtocolVersion::V2);
    assert_eq!(client.state(), ConnectionState::NegotiatingService);
    assert!(server.wait_for_state(ConnectionState::NegotiatingService, Duration::from_secs(2)));
    assert_eq!(server.version(), ProtocolVersion::V2);

    let proxy = client.select_service("calc", None, ()).expect("calc should bind");
    assert!(client.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)));
    assert_eq!(
        proxy.call("add(int,int)", vec![Value::Int(2), Value::Int(3)]),
        Outcome::Value(Value::Int(5))
    );
}

#[test]
fn legacy_server_forces_version_0() {
    let (server, client) = pair(
        calc(),
        ServerConfig::default().with_max_version(ProtocolVersion::V0),
        ClientConfig::default(),
    );
    let client = client.expect("client should connect");
    assert_eq!(client.version(), ProtocolVersion::V0);

    let proxy = client.select_service("calc", None, ()).expect("legacy selection");
    assert_eq!(proxy.service_id(), 0);
    assert!(server.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)));
    assert_eq!(
        proxy.call("add(int,int)", vec![Value::Int(20), Value::Int(22)]),
        Outcome::Value(Value::Int(42))
    );
    assert_eq!(server.version(), ProtocolVersion::V0);
}

#[test]
fn client_cap_lowers_the_version() {
    let (server, client) = pair(
        calc(),
        ServerConfig::default(),
        ClientConfig::default().with_max_version(ProtocolVersion::V1),
    );
    let client = client.expect("client should connect");
    assert_eq!(client.version(), ProtocolVersion::V1);
    assert!(server.wait_for_state(ConnectionState::NegotiatingService, Duration::from_secs(2)));
    assert_eq!(server.version(), ProtocolVersion::V1);
}

#[test]
fn greeting_without_a_version_means_legacy() {
    let (a, b) = UnixStream::pair().expect("socket pair");
    let server = thread::spawn(move || {
        let mut raw = Raw::new(a);
        raw.send(0, ControlMessage::Welcome { max_version: None });
        let (id, msg) = raw.control();
        assert!(matches!(msg, ControlMessage::SelectService { .. }), "got {msg:?}");
        raw.send(id, ControlMessage::Ready(Value::UInt(1)));
        raw.send(0, ControlMessage::StateChanged(2));
        raw
    });

    let client = Connection::connect(b, ClientConfig::default()).expect("client should connect");
    assert_eq!(client.version(), ProtocolVersion::V0);
    let proxy = client.select_service("anything", None, ()).expect("legacy selection");
    assert!(proxy.is_valid());
    assert!(client.wait_for_state(ConnectionState::Ready, Duration::from_secs(2)));
    server.join().expect("raw server should finish");
}

#[test]
fn silent_server_times_out_the_handshake() {
    let (_a, b) = UnixStream::pair().expect("socket pair");
    let config = ClientConfig::default().with_connect_timeout(Duration::from_millis(100));
    let err = Connection::connect(b, config).expect_err("handshake should not finish");
    assert!(matches!(err, SessionError::Timeout(_)), "got {err:?}");
}

#[test]
fn requested_upgrade_runs_on_both_ends() {
    let hook = Arc::new(CountingUpgrade::default());
    let (server, client) = pair(
        calc(),
        ServerConfig::default()
            .with_upgrade_policy(UpgradePolicy::Required)
            .with_upgrader(hook.clone()),
        ClientConfig::default().with_upgrade(hook.clone()),
    );
    let client = client.expect("client should connect");
    assert!(server.wait_for_state(ConnectionState::NegotiatingService, Duration::from_secs(2)));
    assert_eq!(hook.server.load(Ordering::SeqCst), 1);
    assert_eq!(hook.client.load(Ordering::SeqCst), 1);
    assert!(client.select_service("calc", None, ()).is_ok());
}

#[test]
fn required_upgrade_without_request_is_refused() {
    let hook = Arc::new(CountingUpgrade::default());
    let (server, client) = pair(
        calc(),
        ServerConfig::default()
            .with_upgrade_policy(UpgradePolicy::Required)
            .with_upgrader(hook.clone()),
        ClientConfig::default(),
    );
    let err = client.expect_err("server should refuse");
    assert!(matches!(err, SessionError::HandshakeFailed(_)), "got {err:?}");
    server.join();
    assert!(!server.is_connected());
    assert_eq!(hook.server.load(Ordering::SeqCst), 0);
}

#[test]
fn upgrade_request_against_disabled_policy_is_refused() {
    let hook = Arc::new(CountingUpgrade::default());
    let (server, client) = pair(
        calc(),
        ServerConfig::default()
            .with_upgrade_policy(UpgradePolicy::Disabled)
            .with_upgrader(hook.clone()),
        ClientConfig::default().with_upgrade(hook.clone()),
    );
    assert!(client.is_err());
    server.join();
    assert_eq!(hook.client.load(Ordering::SeqCst), 0);
}

#[test]
fn unrequested_upgrade_from_server_closes_the_client() {
    let (a, b) = UnixStream::pair().expect("socket pair");
    let server = thread::spawn(move || {
        let mut raw = Raw::new(a);
        raw.send(0, ControlMessage::Welcome { max_version: Some(2) });
        let (id, _) = raw.control();
        raw.send(id, ControlMessage::SetProtocolVersion(2));
        raw.set_version(ProtocolVersion::V2);
        raw.control();
        raw.send(0, ControlMessage::EnableSsl);
    });
    let err = Connection::connect(b, ClientConfig::default()).expect_err("client should bail out");
    assert!(matches!(err, SessionError::HandshakeFailed(_)), "got {err:?}");
    server.join().expect("raw server should finish");
}
