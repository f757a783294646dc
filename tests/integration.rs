//! End-to-end tests for packwire.
//!
//! Two setups are used throughout: a pair of sessions joined back-to-back
//! over an in-memory duplex, and a single session whose peer end is driven
//! manually so the wire bytes themselves can be asserted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use packwire::codec::{DecodeStream, EncodeStream};
use packwire::{Client, Dispatcher, Indexer, Message, RpcError, Session, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

/// Two sessions joined back-to-back: what one writes, the other reads.
fn session_pair() -> (Session, Session) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_reader, a_writer) = tokio::io::split(a);
    let (b_reader, b_writer) = tokio::io::split(b);
    (
        Session::new(a_reader, a_writer),
        Session::new(b_reader, b_writer),
    )
}

/// A session whose peer end is driven manually as raw bytes.
fn raw_peer_session() -> (Session, DuplexStream) {
    let (local, peer) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(local);
    (Session::new(reader, writer), peer)
}

fn sum_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("sum", |params: Vec<Value>| async move {
        let total: i64 = params.iter().filter_map(Value::as_i64).sum();
        Ok(Value::from(total))
    });
    dispatcher
}

fn encode(value: &Value) -> Vec<u8> {
    EncodeStream::encode(value).unwrap().to_vec()
}

async fn read_values(peer: &mut DuplexStream, count: usize) -> Vec<Value> {
    let mut decoder = DecodeStream::new();
    let mut values = Vec::new();
    let mut buf = [0u8; 4096];
    timeout(Duration::from_secs(5), async {
        while values.len() < count {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed before {count} values arrived");
            values.extend(decoder.push(&buf[..n]).unwrap());
        }
    })
    .await
    .expect("timed out waiting for wire values");
    values
}

/// Assert that nothing further arrives on the wire within a short window.
async fn assert_wire_silent(peer: &mut DuplexStream) {
    let mut buf = [0u8; 64];
    match timeout(Duration::from_millis(200), peer.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes on the wire"),
        Ok(Err(_)) => {}
    }
}

#[tokio::test]
async fn test_simple_call() {
    let (client_side, server_side) = session_pair();
    server_side.set_dispatcher(sum_dispatcher());
    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    let result = timeout(
        Duration::from_secs(5),
        client.call("sum", vec![Value::from(1), Value::from(2)]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result, Value::from(3));
}

#[tokio::test]
async fn test_simple_call_wire_shape() {
    let (server, mut peer) = raw_peer_session();
    server.set_dispatcher(sum_dispatcher());
    server.start().unwrap();

    let request = Message::request(0, "sum", vec![Value::from(1), Value::from(2)]);
    peer.write_all(&encode(&request.into_value())).await.unwrap();

    let values = read_values(&mut peer, 1).await;
    assert_eq!(
        values[0],
        Message::response(0, Value::from(3)).into_value()
    );
}

#[tokio::test]
async fn test_handler_error() {
    let (client_side, server_side) = session_pair();
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("sum", |_params: Vec<Value>| async move {
        Err(Value::from("This is error"))
    });
    server_side.set_dispatcher(dispatcher);
    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    let err = timeout(
        Duration::from_secs(5),
        client.call("sum", vec![Value::from(1), Value::from(2)]),
    )
    .await
    .unwrap()
    .unwrap_err();
    match err {
        RpcError::Remote(payload) => assert_eq!(payload, Value::from("This is error")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unknown_method() {
    let (client_side, server_side) = session_pair();
    // The server's dispatcher stays empty.
    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    let err = timeout(
        Duration::from_secs(5),
        client.call("sum", vec![Value::from(1), Value::from(2)]),
    )
    .await
    .unwrap()
    .unwrap_err();
    match err {
        RpcError::Remote(payload) => {
            assert_eq!(payload, Value::from("No MessagePack-RPC method 'sum' exists"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_bidirectional_call() {
    let (client_side, server_side) = session_pair();

    // The originating side can answer sum itself.
    client_side.set_dispatcher(sum_dispatcher());

    // The server's sum calls back over the same connection and relays the
    // answer. Both dispatchers suspend, so no deadlock.
    let back = Client::new(server_side.clone());
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("sum", move |params: Vec<Value>| {
        let back = back.clone();
        async move {
            back.call("sum", params)
                .await
                .map_err(|err| Value::from(err.to_string()))
        }
    });
    server_side.set_dispatcher(dispatcher);

    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    let result = timeout(
        Duration::from_secs(5),
        client.call("sum", vec![Value::from(1), Value::from(2)]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result, Value::from(3));
}

#[tokio::test]
async fn test_notification_wire_shape() {
    let (session, mut peer) = raw_peer_session();
    session.start().unwrap();

    let client = Client::new(session.clone());
    client
        .notify("sum", vec![Value::from(1), Value::from(2)])
        .await
        .unwrap();

    let values = read_values(&mut peer, 1).await;
    assert_eq!(
        values[0],
        Message::notification("sum", vec![Value::from(1), Value::from(2)]).into_value()
    );
    // Exactly one message; a notification never produces a response.
    assert_wire_silent(&mut peer).await;
}

#[tokio::test]
async fn test_notification_runs_handler_without_response() {
    let (client_side, server_side) = session_pair();

    let (ran_tx, mut ran_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("sum", move |params: Vec<Value>| {
        let ran_tx = ran_tx.clone();
        async move {
            let _ = ran_tx.send(params);
            Ok(Value::from(3))
        }
    });
    server_side.set_dispatcher(dispatcher);

    // Any response coming back would be an orphan on the notifying side.
    let orphans = Arc::new(Mutex::new(0u32));
    let counter = orphans.clone();
    client_side.on_message_error(move |_error, _message| {
        *counter.lock().unwrap() += 1;
    });

    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    client
        .notify("sum", vec![Value::from(1), Value::from(2)])
        .await
        .unwrap();

    let params = timeout(Duration::from_secs(5), ran_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params, vec![Value::from(1), Value::from(2)]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*orphans.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_frame_tolerance() {
    let (server, mut peer) = raw_peer_session();
    server.set_dispatcher(sum_dispatcher());

    let invalid = Arc::new(Mutex::new(Vec::new()));
    let sink = invalid.clone();
    server.on_invalid_message(move |value| {
        sink.lock().unwrap().push(value.clone());
    });
    server.start().unwrap();

    // A decodable non-message, a valid request, and a bad tag in one chunk.
    let mut chunk = encode(&Value::from("invalid"));
    chunk.extend(encode(
        &Message::request(1, "sum", vec![Value::from(1), Value::from(2)]).into_value(),
    ));
    chunk.extend(encode(&Value::Array(vec![
        Value::from(3),
        Value::from("bad"),
    ])));
    peer.write_all(&chunk).await.unwrap();

    // The request in the middle is still answered.
    let values = read_values(&mut peer, 1).await;
    assert_eq!(values[0], Message::response(1, Value::from(3)).into_value());

    // The dispatch runs concurrently with classification, so the second
    // invalid value may land just after the response.
    timeout(Duration::from_secs(5), async {
        while invalid.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("invalid-message hook not invoked twice");

    let seen = invalid.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            Value::from("invalid"),
            Value::Array(vec![Value::from(3), Value::from("bad")]),
        ]
    );
}

#[tokio::test]
async fn test_graceful_drain_writes_pending_response() {
    let (server, mut peer) = raw_peer_session();

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("slow", move |_params: Vec<Value>| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Value::from(3))
        }
    });
    server.set_dispatcher(dispatcher);
    server.start().unwrap();

    let request = Message::request(0, "slow", vec![]);
    peer.write_all(&encode(&request.into_value())).await.unwrap();
    timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // Graceful shutdown waits for the dispatch to finish and the writer to
    // take the response.
    timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap()
        .unwrap();

    let mut bytes = Vec::new();
    peer.read_to_end(&mut bytes).await.unwrap();
    let mut decoder = DecodeStream::new();
    let values = decoder.push(&bytes).unwrap();
    assert_eq!(values, vec![Message::response(0, Value::from(3)).into_value()]);
}

#[tokio::test]
async fn test_forced_shutdown_may_drop_responses() {
    let (server, mut peer) = raw_peer_session();

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("slow", move |_params: Vec<Value>| {
        let started_tx = started_tx.clone();
        async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::from(3))
        }
    });
    server.set_dispatcher(dispatcher);
    server.start().unwrap();

    let request = Message::request(0, "slow", vec![]);
    peer.write_all(&encode(&request.into_value())).await.unwrap();
    timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    // Forced shutdown does not wait for the dispatch; nothing reaches the
    // wire.
    timeout(Duration::from_secs(5), server.force_shutdown())
        .await
        .unwrap()
        .unwrap();

    let mut bytes = Vec::new();
    peer.read_to_end(&mut bytes).await.unwrap();
    assert!(bytes.is_empty(), "forced shutdown leaked {} bytes", bytes.len());
}

#[tokio::test]
async fn test_hook_panics_do_not_terminate_session() {
    let (server, mut peer) = raw_peer_session();
    server.set_dispatcher(sum_dispatcher());
    server.on_invalid_message(|_value| panic!("invalid-message hook exploded"));
    server.on_message_error(|_error, _message| panic!("message-error hook exploded"));
    server.start().unwrap();

    let mut chunk = encode(&Value::from("junk"));
    chunk.extend(encode(
        &Message::request(2, "sum", vec![Value::from(20), Value::from(22)]).into_value(),
    ));
    peer.write_all(&chunk).await.unwrap();

    let values = read_values(&mut peer, 1).await;
    assert_eq!(values[0], Message::response(2, Value::from(42)).into_value());
}

#[tokio::test]
async fn test_responses_match_msgids_independent_of_completion_order() {
    let (client_side, server_side) = session_pair();

    let mut dispatcher = Dispatcher::new();
    dispatcher.register("tagged_sleep", |params: Vec<Value>| async move {
        let delay = params[0].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(params[1].clone())
    });
    server_side.set_dispatcher(dispatcher);
    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    let slow = client.call("tagged_sleep", vec![Value::from(100), Value::from("slow")]);
    let fast = client.call("tagged_sleep", vec![Value::from(0), Value::from("fast")]);

    let (slow, fast) = timeout(Duration::from_secs(5), async {
        tokio::join!(slow, fast)
    })
    .await
    .unwrap();
    assert_eq!(slow.unwrap(), Value::from("slow"));
    assert_eq!(fast.unwrap(), Value::from("fast"));
}

#[tokio::test]
async fn test_sequential_notifies_preserve_wire_order() {
    let (session, mut peer) = raw_peer_session();
    session.start().unwrap();

    let client = Client::new(session.clone());
    for i in 0..10 {
        client.notify("tick", vec![Value::from(i)]).await.unwrap();
    }

    let values = read_values(&mut peer, 10).await;
    for (i, value) in values.into_iter().enumerate() {
        assert_eq!(
            value,
            Message::notification("tick", vec![Value::from(i as i64)]).into_value()
        );
    }
}

#[tokio::test]
async fn test_clients_sharing_an_indexer_do_not_collide() {
    let (client_side, server_side) = session_pair();
    server_side.set_dispatcher(sum_dispatcher());
    client_side.start().unwrap();
    server_side.start().unwrap();

    let first = Client::new(client_side.clone());
    let second = Client::with_indexer(client_side.clone(), first.indexer());

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let client = if i % 2 == 0 { first.clone() } else { second.clone() };
        handles.push(tokio::spawn(async move {
            client
                .call("sum", vec![Value::from(i), Value::from(1)])
                .await
                .unwrap()
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(result, Value::from(i as i64 + 1));
    }
}

#[tokio::test]
async fn test_msgid_wrap_collision_surfaces_already_reserved() {
    let (client_side, server_side) = session_pair();

    // The server never answers, so the first reservation stays outstanding.
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("hang", |_params: Vec<Value>| async move {
        std::future::pending::<()>().await;
        Ok(Value::Nil)
    });
    server_side.set_dispatcher(dispatcher);
    client_side.start().unwrap();
    server_side.start().unwrap();

    let first = Client::new(client_side.clone());
    let hanging = {
        let first = first.clone();
        tokio::spawn(async move { first.call("hang", vec![]).await })
    };

    // Give the first call time to take its reservation.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A second client whose msgid space wrapped around to the same id.
    let second = Client::with_indexer(client_side.clone(), Arc::new(Indexer::new()));
    let err = second.call("hang", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::AlreadyReserved(0)));

    client_side.force_shutdown().await.unwrap();
    let outcome = hanging.await.unwrap();
    assert!(outcome.is_err());
}

#[tokio::test]
async fn test_error_serializer_round_trip() {
    let (client_side, server_side) = session_pair();

    let mut dispatcher = Dispatcher::new();
    dispatcher.register("sum", |_params: Vec<Value>| async move {
        Err(Value::from("boom"))
    });
    server_side.set_dispatcher(dispatcher);
    server_side.set_error_serializer(|error| {
        Value::Array(vec![Value::from("wrapped"), error])
    });
    client_side.start().unwrap();
    server_side.start().unwrap();

    let mut client = Client::new(client_side.clone());
    client.set_error_deserializer(|error| {
        match error {
            Value::Array(mut items) if items.len() == 2 => items.remove(1),
            other => other,
        }
    });

    let err = timeout(Duration::from_secs(5), client.call("sum", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        RpcError::Remote(payload) => assert_eq!(payload, Value::from("boom")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_failing_notification_handler_reaches_hook() {
    let (client_side, server_side) = session_pair();

    let mut dispatcher = Dispatcher::new();
    dispatcher.register("burn", |_params: Vec<Value>| async move {
        Err(Value::from("scorched"))
    });
    server_side.set_dispatcher(dispatcher);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    server_side.on_message_error(move |error, message| {
        sink.lock().unwrap().push((error.to_string(), message.clone()));
    });

    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());
    client.notify("burn", vec![Value::from(9)]).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("message-error hook not invoked");

    let (error, message) = seen.lock().unwrap()[0].clone();
    assert!(error.contains("scorched"));
    assert_eq!(
        message,
        Message::notification("burn", vec![Value::from(9)])
    );
}

#[tokio::test]
async fn test_dispatcher_replacement_is_observed_per_dispatch() {
    let (client_side, server_side) = session_pair();
    client_side.start().unwrap();
    server_side.start().unwrap();

    let client = Client::new(client_side.clone());

    // No handler installed yet: the dispatch misses.
    let err = timeout(Duration::from_secs(5), client.call("sum", vec![]))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));

    // Installing a dispatcher on the running session takes effect for the
    // next inbound request.
    server_side.set_dispatcher(sum_dispatcher());
    let result = timeout(
        Duration::from_secs(5),
        client.call("sum", vec![Value::from(2), Value::from(2)]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result, Value::from(4));
}

#[tokio::test]
async fn test_multiple_messages_in_one_chunk() {
    let (server, mut peer) = raw_peer_session();
    server.set_dispatcher(sum_dispatcher());
    server.start().unwrap();

    let mut chunk = Vec::new();
    for msgid in 0..5u32 {
        chunk.extend(encode(
            &Message::request(msgid, "sum", vec![Value::from(msgid), Value::from(1)])
                .into_value(),
        ));
    }
    peer.write_all(&chunk).await.unwrap();

    let mut values = read_values(&mut peer, 5).await;
    // Dispatch is concurrent; order responses by msgid before asserting.
    values.sort_by_key(|value| {
        value
            .as_array()
            .and_then(|items| items.get(1))
            .and_then(Value::as_u64)
            .unwrap_or(u64::MAX)
    });
    for (msgid, value) in values.into_iter().enumerate() {
        assert_eq!(
            value,
            Message::response(msgid as u32, Value::from(msgid as u64 + 1)).into_value()
        );
    }
}
