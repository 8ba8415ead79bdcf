//! End-to-end behaviour of two connections wired together in memory.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use plugwire::bridge::codec::MessageCodec;
use plugwire::{
    ConnectionState, Controller, ControllerConfig, Error, FrameFormat, Message, Plugin, values,
};
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Functions both sides know about. The caller's copy declares the wire types.
fn shared(controller: &mut Controller) {
    controller
        .register_function("add", |a: i64, b: i64| a + b)
        .unwrap();
    controller
        .register_function("sleep_ms", |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            ms
        })
        .unwrap();
    controller
        .register_function("div", |a: i64, b: i64| -> Result<i64, String> {
            if b == 0 {
                Err("division by zero".to_string())
            } else {
                Ok(a / b)
            }
        })
        .unwrap();
    controller
        .register_variadic("join", |sep: String, parts: Vec<String>| parts.join(&sep))
        .unwrap();
    controller
        .register_function("len", |bytes: Vec<u8>| bytes.len() as u64)
        .unwrap();
    controller
        .register_function("blob", |n: u64| vec![7u8; n as usize])
        .unwrap();
    controller
        .register_function("ratio", |a: f64, b: f64| a / b)
        .unwrap();
}

fn controller() -> Controller {
    let mut controller = Controller::new();
    shared(&mut controller);
    controller
}

fn wire(a: Controller, b: Controller) -> (Plugin, Plugin) {
    let (a_io, b_io) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a_io);
    let (b_read, b_write) = tokio::io::split(b_io);
    let a = a.connect(a_read, a_write);
    let b = b.connect(b_read, b_write);
    a.start().unwrap();
    b.start().unwrap();
    (a, b)
}

/// A connection whose peer is driven by hand through raw frames.
fn with_raw_peer(
    controller: Controller,
) -> (
    Plugin,
    FramedRead<tokio::io::ReadHalf<DuplexStream>, MessageCodec>,
    FramedWrite<tokio::io::WriteHalf<DuplexStream>, MessageCodec>,
) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(local);
    let plugin = controller.connect(read, write);
    plugin.start().unwrap();

    let (remote_read, remote_write) = tokio::io::split(remote);
    (
        plugin,
        FramedRead::new(remote_read, MessageCodec::default()),
        FramedWrite::new(remote_write, MessageCodec::default()),
    )
}

#[tokio::test]
async fn remote_add_matches_local() {
    let (a, b) = wire(controller(), controller());

    let remote = a.invoke("add", values![2i64, 3i64]).await.unwrap();
    let local = a
        .controller()
        .invoke_local("add", values![2i64, 3i64])
        .unwrap();
    assert_eq!(remote.get::<i64>(0), Some(&5));
    assert_eq!(remote.get::<i64>(0), local.get::<i64>(0));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
    assert_eq!(b.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn responses_are_matched_by_id_not_order() {
    let (a, b) = wire(controller(), controller());

    let delays = [80u64, 10, 50, 0, 30];
    let mut calls = Vec::new();
    for ms in delays {
        calls.push(a.call("sleep_ms", values![ms]).await.unwrap());
    }
    let results = futures::future::join_all(calls.into_iter().map(|call| call.wait())).await;

    for (ms, result) in delays.iter().zip(results) {
        assert_eq!(result.unwrap().get::<u64>(0), Some(ms));
    }
    assert_eq!(a.pending_calls(), 0);

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn slow_call_does_not_delay_others() {
    let (a, b) = wire(controller(), controller());

    let slow = a.call("sleep_ms", values![500u64]).await.unwrap();
    let fast = timeout(Duration::from_millis(250), a.invoke("add", values![20i64, 22i64]))
        .await
        .expect("fast call stuck behind slow one")
        .unwrap();
    assert_eq!(fast.get::<i64>(0), Some(&42));
    assert_eq!(slow.await.unwrap().get::<u64>(0), Some(&500));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn full_queue_blocks_callers() {
    let mut controller = Controller::new();
    controller
        .register_function("add", |a: i64, b: i64| a + b)
        .unwrap();

    // Nobody reads the outbound side, so the writer stalls on its first frame.
    let (inbound, _inbound_peer) = tokio::io::duplex(64);
    let (outbound, _outbound_peer) = tokio::io::duplex(8);
    let plugin = controller.connect(inbound, outbound);
    plugin.start().unwrap();

    // One frame held by the writer plus a full queue of six.
    let mut queued = Vec::new();
    for i in 0..7i64 {
        let call = timeout(Duration::from_secs(1), plugin.call("add", values![i, 1i64]))
            .await
            .expect("queue should still have room")
            .unwrap();
        queued.push(call);
    }

    let blocked = timeout(
        Duration::from_millis(100),
        plugin.call("add", values![7i64, 1i64]),
    )
    .await;
    assert!(blocked.is_err(), "eighth call should wait for queue space");
    assert_eq!(plugin.pending_calls(), 7);

    drop(queued);
    assert_eq!(plugin.pending_calls(), 0);
    plugin.stop().await.unwrap();
}

#[tokio::test]
async fn stop_resolves_callers_waiting_for_queue_space() {
    let mut controller = Controller::new();
    controller
        .register_function("add", |a: i64, b: i64| a + b)
        .unwrap();

    let (inbound, _inbound_peer) = tokio::io::duplex(64);
    let (outbound, _outbound_peer) = tokio::io::duplex(8);
    let plugin = controller.connect(inbound, outbound);
    plugin.start().unwrap();

    let mut queued = Vec::new();
    for i in 0..7i64 {
        queued.push(plugin.call("add", values![i, 1i64]).await.unwrap());
    }
    let waiting = tokio::spawn({
        let plugin = plugin.clone();
        async move { plugin.call("add", values![7i64, 1i64]).await.map(|_| ()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished(), "eighth call should wait for queue space");

    assert_eq!(plugin.stop().await.unwrap(), None);

    assert_eq!(waiting.await.unwrap().unwrap_err(), Error::ConnectionClosed);
    for call in queued {
        assert_eq!(call.await.unwrap_err(), Error::ConnectionClosed);
    }
    assert_eq!(plugin.pending_calls(), 0);
}

#[tokio::test]
async fn closed_stream_fails_pending_calls() {
    let (plugin, mut peer_in, peer_out) = with_raw_peer(controller());

    let call = plugin.call("add", values![1i64, 1i64]).await.unwrap();
    let request = peer_in.next().await.unwrap().unwrap();
    assert_eq!(request.func_id, "add");
    assert!(!request.is_response);

    drop(peer_out);
    drop(peer_in);

    assert_eq!(call.await.unwrap_err(), Error::ConnectionClosed);
    assert_eq!(plugin.wait().await.unwrap(), None);
    assert_eq!(plugin.state(), ConnectionState::Stopped);
    assert!(plugin.is_closed());

    let err = plugin.call("add", values![1i64, 1i64]).await.unwrap_err();
    assert_eq!(err, Error::ConnectionClosed);
}

#[tokio::test]
async fn malformed_frame_is_a_protocol_error() {
    let (plugin, mut peer_in, mut peer_out) = with_raw_peer(controller());

    let call = plugin.call("add", values![1i64, 1i64]).await.unwrap();
    peer_in.next().await.unwrap().unwrap();

    // Valid framing, body is not a message.
    let inner = peer_out.get_mut();
    tokio::io::AsyncWriteExt::write_all(inner, &[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'])
        .await
        .unwrap();

    let err = call.await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err}");

    // Surfaced once by wait(), then the connection just reports its status.
    assert!(matches!(plugin.wait().await, Err(Error::Protocol(_))));
    assert_eq!(plugin.wait().await.unwrap(), None);
}

#[tokio::test]
async fn late_and_unknown_responses_are_dropped() {
    let (plugin, mut peer_in, mut peer_out) = with_raw_peer(controller());

    let call = plugin.call("add", values![2i64, 2i64]).await.unwrap();
    let request = peer_in.next().await.unwrap().unwrap();

    // A response nobody asked for is ignored.
    peer_out
        .send(Message::response(9_999, "add", vec![]))
        .await
        .unwrap();

    let four = plugin.controller().encode(&4i64).unwrap();
    peer_out
        .send(Message::response(request.id, "add", vec![four]))
        .await
        .unwrap();
    assert_eq!(call.await.unwrap().get::<i64>(0), Some(&4));

    drop(peer_in);
    drop(peer_out);
    plugin.wait().await.unwrap();
}

#[tokio::test]
async fn remote_failures_resolve_the_caller() {
    let (a, b) = wire(controller(), controller());

    let err = a.invoke("div", values![1i64, 0i64]).await.unwrap_err();
    assert_eq!(
        err,
        Error::Remote {
            func_id: "div".into(),
            message: "function div failed: division by zero".into(),
        }
    );

    let err = a.invoke("add", values![1i64]).await.unwrap_err();
    assert_eq!(
        err,
        Error::Remote {
            func_id: "add".into(),
            message: "invalid arguments for add: expected 2 arguments, got 1".into(),
        }
    );

    // Still usable after failed calls.
    let out = a.invoke("div", values![9i64, 3i64]).await.unwrap();
    assert_eq!(out.get::<i64>(0), Some(&3));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn unknown_remote_function_is_reported() {
    let mut caller = controller();
    caller.register_function("only_here", || 1u8).unwrap();
    let (a, b) = wire(caller, controller());

    let err = a.invoke("only_here", values![]).await.unwrap_err();
    assert_eq!(
        err,
        Error::Remote {
            func_id: "only_here".into(),
            message: "unknown function: only_here".into(),
        }
    );

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn unregistered_outbound_call_fails_locally() {
    let (plugin, mut peer_in, _peer_out) = with_raw_peer(controller());

    let err = plugin.invoke("nope", values![1i64]).await.unwrap_err();
    assert_eq!(err, Error::UnknownFunction("nope".into()));
    assert_eq!(plugin.pending_calls(), 0);

    // Nothing went out for it; the next frame is the next real call.
    let _call = plugin.call("add", values![1i64, 1i64]).await.unwrap();
    let request = peer_in.next().await.unwrap().unwrap();
    assert_eq!(request.func_id, "add");

    plugin.stop().await.unwrap();
}

#[tokio::test]
async fn megabyte_payloads_cross_with_default_limit() {
    let (a, b) = wire(controller(), controller());

    let bytes = vec![255u8; 2_000_000];
    let (len, sum) = tokio::join!(
        a.invoke("len", values![bytes]),
        a.invoke("add", values![1i64, 2i64]),
    );
    assert_eq!(len.unwrap().get::<u64>(0), Some(&2_000_000));
    assert_eq!(sum.unwrap().get::<i64>(0), Some(&3));

    let blob = a.invoke("blob", values![1_500_000u64]).await.unwrap();
    assert_eq!(blob.get::<Vec<u8>>(0).map(Vec::len), Some(1_500_000));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn oversized_frames_fail_only_their_call() {
    let small = || {
        let mut controller =
            Controller::with_config(ControllerConfig::default().with_max_frame_length(16 * 1024));
        shared(&mut controller);
        controller
    };
    let (a, b) = wire(small(), small());

    let sleeping = a.call("sleep_ms", values![200u64]).await.unwrap();

    // Request too large: refused before it is queued.
    let err = a
        .invoke("len", values![vec![1u8; 20_000]])
        .await
        .unwrap_err();
    assert!(
        matches!(&err, Error::EncodeFailure { reason, .. } if reason.contains("exceeds")),
        "{err}"
    );
    assert_eq!(a.pending_calls(), 1);

    // Result too large: the peer answers with an error instead.
    let err = a.invoke("blob", values![20_000u64]).await.unwrap_err();
    assert!(
        matches!(&err, Error::Remote { func_id, message } if func_id == "blob" && message.contains("exceeds")),
        "{err}"
    );

    assert_eq!(sleeping.await.unwrap().get::<u64>(0), Some(&200));
    assert!(!a.is_closed());
    assert!(!b.is_closed());
    let out = a.invoke("len", values![vec![1u8; 100]]).await.unwrap();
    assert_eq!(out.get::<u64>(0), Some(&100));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn non_finite_floats_are_encode_failures() {
    let (a, b) = wire(controller(), controller());

    let err = a
        .invoke("ratio", values![f64::NAN, 1.0f64])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EncodeFailure { .. }), "{err}");

    // The callee cannot encode its infinite result and says so.
    let err = a.invoke("ratio", values![1.0f64, 0.0f64]).await.unwrap_err();
    assert_eq!(
        err,
        Error::Remote {
            func_id: "ratio".into(),
            message: "failed to encode value of type f64: inf cannot be represented in JSON"
                .into(),
        }
    );

    let out = a.invoke("ratio", values![3.0f64, 2.0f64]).await.unwrap();
    assert_eq!(out.get::<f64>(0), Some(&1.5));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn panicking_function_still_answers() {
    let mut callee = controller();
    callee
        .register_function("boom", |_: u8| -> u8 { panic!("boom") })
        .unwrap();
    let mut caller = controller();
    caller.register_function("boom", |x: u8| x).unwrap();
    let (a, b) = wire(caller, callee);

    let err = a.invoke("boom", values![1u8]).await.unwrap_err();
    assert_eq!(
        err,
        Error::Remote {
            func_id: "boom".into(),
            message: "function boom failed: function panicked".into(),
        }
    );

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn variadic_accepts_both_forms_over_the_wire() {
    let (a, b) = wire(controller(), controller());

    let spread = a
        .invoke(
            "join",
            values!["-".to_string(), "a".to_string(), "b".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(spread.get::<String>(0).unwrap(), "a-b");

    let slice = a
        .invoke(
            "join",
            values!["+".to_string(), vec!["x".to_string(), "y".to_string()]],
        )
        .await
        .unwrap();
    assert_eq!(slice.get::<String>(0).unwrap(), "x+y");

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_sides_call_each_other() {
    let plugin_peer: Arc<OnceLock<Plugin>> = Arc::new(OnceLock::new());

    let mut master = controller();
    master
        .register_function("hello", |name: String| format!("hi {name}"))
        .unwrap();
    master.register_function("relay", |name: String| name).unwrap();

    let mut plugin = controller();
    plugin
        .register_function("hello", |name: String| name)
        .unwrap();
    let peer = Arc::clone(&plugin_peer);
    plugin
        .register_function("relay", move |name: String| -> Result<String, String> {
            let conn = peer.get().ok_or_else(|| "not connected".to_string())?;
            let out = tokio::runtime::Handle::current()
                .block_on(conn.invoke("hello", values![name]))
                .map_err(|e| e.to_string())?;
            out.take::<String>(0).ok_or_else(|| "no result".to_string())
        })
        .unwrap();

    let (a, b) = wire(master, plugin);
    plugin_peer.set(b.clone()).unwrap();

    // Concurrent calls in both directions.
    let (from_a, from_b) = tokio::join!(
        a.invoke("add", values![1i64, 2i64]),
        b.invoke("add", values![10i64, 20i64]),
    );
    assert_eq!(from_a.unwrap().get::<i64>(0), Some(&3));
    assert_eq!(from_b.unwrap().get::<i64>(0), Some(&30));

    // A call that calls back into the caller before answering.
    let relayed = a.invoke("relay", values!["ann".to_string()]).await.unwrap();
    assert_eq!(relayed.get::<String>(0).unwrap(), "hi ann");

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn configured_timeout_clears_the_call() {
    let config = ControllerConfig::default().with_call_timeout(Duration::from_millis(50));
    let mut caller = Controller::with_config(config);
    shared(&mut caller);
    let (a, b) = wire(caller, controller());

    let err = a.invoke("sleep_ms", values![120u64]).await.unwrap_err();
    assert_eq!(err, Error::Timeout(Duration::from_millis(50)));
    assert_eq!(a.pending_calls(), 0);

    // Per-call override. Outlasts the abandoned call, whose late response is dropped.
    let call = a.call("sleep_ms", values![200u64]).await.unwrap();
    let out = call.without_timeout().await.unwrap();
    assert_eq!(out.get::<u64>(0), Some(&200));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn lines_framing_works_end_to_end() {
    let lines = || {
        let mut controller =
            Controller::with_config(ControllerConfig::default().with_frame_format(FrameFormat::Lines));
        shared(&mut controller);
        controller
    };
    let (a, b) = wire(lines(), lines());

    let out = a.invoke("add", values![40i64, 2i64]).await.unwrap();
    assert_eq!(out.get::<i64>(0), Some(&42));

    a.stop().await.unwrap();
    b.wait().await.unwrap();
}
