mod common;

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{calc, pair, Raw};
use linkrpc_frame::{Call, CallSignature, Frame, Outcome, ProtocolVersion, Value};
use linkrpc_session::{
    codes, AuthToken, ClientConfig, Connection, ControlMessage, Handlers, Invocation,
    OperationTable, Reply, ServerConfig, ServiceDirectory, SessionError,
};

#[test]
fn one_service_id_is_shared_by_every_proxy() {
    let (a, b) = UnixStream::pair().expect("socket pair");
    let (events_tx, events_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let secondary_callbacks = Arc::new(AtomicUsize::new(0));

    let server = thread::spawn(move || {
        let mut raw = Raw::new(a);
        raw.serve_negotiation(ProtocolVersion::V2);
        raw.serve_selection(7, true);
        raw.serve_selection(7, false);
        go_rx.recv().expect("client should signal");

        let changed = CallSignature::parse("changed(int)").expect("signature");
        raw.write(Frame::Event(Call::new(0, 7, changed, vec![Value::Int(5)])));

        let ask = CallSignature::parse("ask(int)").expect("signature");
        raw.write(Frame::Function(Call::new(900, 7, ask, vec![Value::Int(2)])));
        let reply = raw.ret();
        (raw, reply)
    });

    let client = Connection::connect(b, ClientConfig::default()).expect("client should connect");

    let tx = events_tx.clone();
    let first_handler = Handlers::new()
        .with_event(move |_sig, args| {
            let _ = tx.send(("first", args.to_vec()));
        })
        .with_callback(|_sig, args| {
            Outcome::Value(Value::Int(args[0].as_i64().unwrap_or_default() * 10))
        });
    let counter = Arc::clone(&secondary_callbacks);
    let second_handler = Handlers::new()
        .with_event(move |_sig, args| {
            let _ = events_tx.send(("second", args.to_vec()));
        })
        .with_callback(move |_sig, _args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::Value(Value::Int(-1))
        });

    let first = client.select_service("svc", None, first_handler).expect("first selection");
    let second = client.select_service("svc", None, second_handler).expect("second selection");
    assert_eq!(first.service_id(), 7);
    assert_eq!(second.service_id(), 7);
    assert_eq!(client.binding_count(), 1);
    assert_eq!(first.proxy_count(), 2);
    assert!(first.is_primary());
    assert!(!second.is_primary());
    go_tx.send(()).expect("raw server should be waiting");

    let mut seen: Vec<_> = (0..2)
        .map(|_| events_rx.recv_timeout(Duration::from_secs(2)).expect("event should arrive"))
        .collect();
    seen.sort_by_key(|(who, _)| *who);
    assert_eq!(
        seen,
        vec![("first", vec![Value::Int(5)]), ("second", vec![Value::Int(5)])]
    );

    let (_raw, reply) = server.join().expect("raw server should finish");
    assert_eq!(reply, (900, Outcome::Value(Value::Int(20))));
    assert_eq!(secondary_callbacks.load(Ordering::SeqCst), 0);
}

#[test]
fn dropping_the_primary_promotes_the_next_proxy() {
    let shared = OperationTable::new()
        .operation("ping()", |_call: &Invocation<'_>| Value::from("pong"))
        .expect("ping should register")
        .into_service();
    let provider = ServiceDirectory::new().with_shared("hub", shared);
    let (server, client) = pair(provider, ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");

    let first = client.select_service("hub", None, ()).expect("first selection");
    let second = client.select_service("hub", None, ()).expect("second selection");
    let third = second.share(());
    assert_eq!(first.service_id(), second.service_id());
    assert_eq!(third.proxy_count(), 3);
    assert_eq!(server.service_count(), 1);

    drop(first);
    assert!(second.is_primary());
    assert!(!third.is_primary());
    assert_eq!(third.call("ping()", vec![]), Outcome::Value(Value::from("pong")));
}

#[test]
fn releasing_every_proxy_destroys_the_remote_object() {
    let (server, client) = pair(calc(), ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");

    let proxy = client.select_service("calc", None, ()).expect("calc should bind");
    let again = proxy.share(());
    assert_eq!(server.service_count(), 1);
    drop(proxy);
    assert_eq!(client.binding_count(), 1);
    drop(again);
    assert_eq!(client.binding_count(), 0);

    // destroyService carries no reply; a listing round trip orders it.
    client.list_services().expect("listing should succeed");
    assert_eq!(server.service_count(), 0);
}

#[test]
fn connection_outlives_its_handle_while_proxies_remain() {
    let (server, client) = pair(calc(), ServerConfig::default(), ClientConfig::default());
    let proxy = client
        .expect("client should connect")
        .select_service("calc", None, ())
        .expect("calc should bind");
    assert_eq!(
        proxy.call("add(int,int)", vec![Value::Int(1), Value::Int(1)]),
        Outcome::Value(Value::Int(2))
    );
    assert!(proxy.connection().is_connected());
    drop(proxy);
    server.join();
    assert!(!server.is_connected());
}

fn guarded() -> ServiceDirectory {
    ServiceDirectory::new().with_service("vault", || {
        OperationTable::new()
            .operation("open()", |_call: &Invocation<'_>| Value::Bool(true))
            .expect("open should register")
            .authenticator(|token: &AuthToken| {
                if token.username == "alice" && token.password == "secret" {
                    Outcome::Value(Value::Bool(true))
                } else {
                    Outcome::error(codes::ERROR, "access denied")
                }
            })
            .into_service()
    })
}

#[test]
fn selection_authenticates_with_the_given_token() {
    let (_server, client) = pair(guarded(), ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");

    let err = client
        .select_service("vault", Some(AuthToken::new("alice", "guess")), ())
        .expect_err("wrong password should fail");
    assert!(
        matches!(&err, SessionError::Call { message, .. } if message == "access denied"),
        "got {err:?}"
    );
    assert_eq!(client.binding_count(), 0);

    let proxy = client
        .select_service("vault", Some(AuthToken::new("alice", "secret")), ())
        .expect("right password should bind");
    assert_eq!(proxy.call("open()", vec![]), Outcome::Value(Value::Bool(true)));
}

#[test]
fn default_token_covers_selection_without_one() {
    let config = ClientConfig::default().with_default_token(AuthToken::new("alice", "secret"));
    let (_server, client) = pair(guarded(), ServerConfig::default(), config);
    let client = client.expect("client should connect");
    let proxy = client.select_service("vault", None, ()).expect("default token should bind");
    assert_eq!(proxy.call("open()", vec![]), Outcome::Value(Value::Bool(true)));
}

#[test]
fn unknown_service_names_are_reported() {
    let (_server, client) = pair(calc(), ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");
    let err = client.select_service("nope", None, ()).expect_err("nope is not offered");
    assert!(
        matches!(err, SessionError::Call { code, .. } if code == codes::UNKNOWN_SERVICE),
        "got {err:?}"
    );
}

#[test]
fn services_and_operations_can_be_listed() {
    let (_server, client) = pair(calc(), ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");
    assert_eq!(client.list_services().expect("services"), ["calc"]);

    let operations: Vec<String> = client
        .list_operations("calc")
        .expect("operations")
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(operations, ["add(int,int)", "echo(int)"]);
    assert!(client.list_operations("nope").is_err());

    let events = client.list_events("calc").expect("events");
    assert_eq!(events, [CallSignature::parse("overflow(int)").expect("signature")]);
    let callbacks = client.list_callbacks("calc").expect("callbacks");
    assert_eq!(callbacks, [CallSignature::parse("confirm(int)").expect("signature")]);
    assert!(client.list_events("nope").is_err());
    assert!(client.list_callbacks("nope").is_err());
}

/// A `counters` service whose `open()` hands out a fresh counter object
/// that reports every bump as an event.
fn counters() -> ServiceDirectory {
    ServiceDirectory::new().with_service("counters", || {
        OperationTable::new()
            .operation("open()", |_call: &Invocation<'_>| -> Reply {
                let count = Arc::new(AtomicI64::new(0));
                let counter = OperationTable::new()
                    .operation("bump()", move |call: &Invocation<'_>| {
                        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
                        let (peer, id) = (call.context.peer(), call.context.service_id());
                        if peer.emit_event(id, "bumped(int)", vec![Value::Int(now)]).is_err() {
                            return Outcome::error(codes::ERROR, "event not sent");
                        }
                        Outcome::Value(Value::Int(now))
                    })
                    .expect("bump should register")
                    .event("bumped(int)")
                    .expect("bumped should declare")
                    .into_service();
                Reply::Service(counter)
            })
            .expect("open should register")
            .operation("ping()", |_call: &Invocation<'_>| Value::from("pong"))
            .expect("ping should register")
            .into_service()
    })
}

#[test]
fn returned_services_bind_their_own_proxies() {
    let (server, client) = pair(counters(), ServerConfig::default(), ClientConfig::default());
    let client = client.expect("client should connect");
    let root = client.select_service("counters", None, ()).expect("counters should bind");

    let (tx, rx) = mpsc::channel();
    let handler = Handlers::new().with_event(move |sig, args| {
        let _ = tx.send((sig.to_string(), args.to_vec()));
    });
    let counter = root
        .call_service("open()", vec![], handler)
        .expect("open should return a service");
    assert_ne!(counter.service_id(), root.service_id());
    assert!(counter.is_primary());
    assert_eq!(client.binding_count(), 2);
    assert_eq!(server.service_count(), 2);

    assert_eq!(counter.call("bump()", vec![]), Outcome::Value(Value::Int(1)));
    let (sig, args) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("counter event should reach its proxy");
    assert_eq!(sig, "bumped(int)");
    assert_eq!(args, vec![Value::Int(1)]);

    let again = client.attach_service(counter.service_id(), ());
    assert_eq!(again.proxy_count(), 2);
    assert!(!again.is_primary());
    assert_eq!(client.binding_count(), 2);

    drop(counter);
    drop(again);
    assert_eq!(client.binding_count(), 1);
    client.list_services().expect("listing should succeed");
    assert_eq!(server.service_count(), 1);

    let err = root
        .call_service("ping()", vec![], ())
        .expect_err("ping returns a plain value");
    assert!(matches!(err, SessionError::Protocol(_)), "got {err:?}");
    let err = root
        .call_service("missing()", vec![], ())
        .expect_err("missing is not an operation");
    assert!(
        matches!(err, SessionError::Call { code, .. } if code == codes::NOT_FOUND),
        "got {err:?}"
    );
    assert_eq!(client.binding_count(), 1);
}

#[test]
fn events_for_unbound_services_are_dropped() {
    let (a, b) = UnixStream::pair().expect("socket pair");
    let server = thread::spawn(move || {
        let mut raw = Raw::new(a);
        raw.serve_negotiation(ProtocolVersion::V2);
        let stray = CallSignature::parse("stray()").expect("signature");
        raw.write(Frame::Event(Call::new(0, 42, stray, vec![])));
        let (id, msg) = raw.control();
        assert_eq!(msg, ControlMessage::ListServices);
        raw.write(Frame::Return { id, outcome: Outcome::Value(Value::List(vec![])) });
        raw
    });
    let client = Connection::connect(b, ClientConfig::default()).expect("client should connect");
    assert!(client.list_services().expect("listing").is_empty());
    assert!(client.is_connected());
    server.join().expect("raw server should finish");
}
