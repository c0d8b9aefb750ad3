//! Integration tests for the dispatcher.
//!
//! These drive whole requests through `Dispatcher` the way a transport
//! would: build a registry, hand in a decoded `Request`, and inspect the
//! response that comes back (directly or through a delivery channel).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pitaya_core::protos::SessionData;
use pitaya_core::{
    ChannelDelivery, Codec, CodecError, CustomMetrics, Dispatcher, HandlerError,
    HandlerRegistryBuilder, JsonCodec, LoggingRpcClient, MetricSpec, Metrics, Request,
    RequestHandle, Response, RpcType, Session,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

fn dispatcher(builder: HandlerRegistryBuilder<JsonCodec>) -> Dispatcher {
    let (delivery, _rx) = ChannelDelivery::channel();
    Dispatcher::new(
        builder.build(),
        JsonCodec,
        Arc::new(LoggingRpcClient),
        Arc::new(delivery),
    )
}

fn user_request(route: &str, data: &[u8]) -> Request {
    Request {
        rpc_type: RpcType::User,
        route: route.to_string(),
        data: data.to_vec(),
        session: Vec::new(),
        frontend_id: String::new(),
    }
}

fn sys_request(route: &str, session_id: i64, data: &[u8]) -> Request {
    let session = SessionData {
        id: session_id,
        ..Default::default()
    };
    Request {
        rpc_type: RpcType::Sys,
        route: route.to_string(),
        data: data.to_vec(),
        session: session.encode().unwrap(),
        frontend_id: "connector-1".to_string(),
    }
}

fn error_code(response: &Response) -> &str {
    &response.error.as_ref().expect("Expected error").code
}

#[tokio::test]
async fn test_remote_join_end_to_end() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .remote_with_arg("room.join", |arg: String| async move {
            Ok(format!("joined:{}", arg))
        })
        .unwrap();
    let dispatcher = dispatcher(builder);

    let response = dispatcher
        .handle(&user_request("room.room.join", br#""hello""#))
        .await;

    assert_eq!(response.error, None);
    assert_eq!(response.data, br#""joined:hello""#.to_vec());
}

#[tokio::test]
async fn test_system_join_sees_session() {
    let seen = Arc::new(AtomicI64::new(0));
    let mut builder = HandlerRegistryBuilder::new();
    {
        let seen = seen.clone();
        builder
            .handler("room.join", move |session: Session| {
                let seen = seen.clone();
                async move {
                    seen.store(session.id(), Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
    }
    let dispatcher = dispatcher(builder);

    let response = dispatcher.handle(&sys_request("room.room.join", 42, b"")).await;

    assert_eq!(response, Response::ok(Vec::new()));
    assert_eq!(seen.load(Ordering::SeqCst), 42);
}

#[tokio::test]
async fn test_missing_handler_is_404_and_runs_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = HandlerRegistryBuilder::new();
    {
        let calls = calls.clone();
        builder
            .remote("room.leave", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .unwrap();
    }
    let dispatcher = dispatcher(builder);

    let response = dispatcher.handle(&user_request("room.room.join", b"")).await;
    assert_eq!(error_code(&response), "PIT-404");
    assert!(response.data.is_empty());

    // A remote does not answer for a sys request on the same name.
    let response = dispatcher.handle(&sys_request("room.leave", 1, b"")).await;
    assert_eq!(error_code(&response), "PIT-404");
    assert_eq!(
        response.error.unwrap().msg,
        "handler not found! handler name: room.leave"
    );

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_decode_failure_is_500_and_skips_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut builder = HandlerRegistryBuilder::new();
    {
        let calls = calls.clone();
        builder
            .remote_with_arg("room.sit", move |seat: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(seat) }
            })
            .unwrap();
    }
    let dispatcher = dispatcher(builder);

    let response = dispatcher
        .handle(&user_request("room.sit", br#""front row""#))
        .await;

    assert_eq!(error_code(&response), "PIT-500");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_error_reports_root_cause_and_keeps_serving() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .remote_with_arg("room.join", |name: String| async move {
            if name == "full" {
                return Err(HandlerError::new("room capacity reached").context("join refused"));
            }
            Ok(name)
        })
        .unwrap();
    let dispatcher = dispatcher(builder);

    let response = dispatcher.handle(&user_request("room.join", br#""full""#)).await;
    let error = response.error.expect("Expected error");
    assert_eq!(error.code, "PIT-500");
    assert_eq!(error.msg, "room capacity reached");

    let response = dispatcher.handle(&user_request("room.join", br#""lobby""#)).await;
    assert_eq!(response, Response::ok(br#""lobby""#.to_vec()));
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .remote("room.crash", || async {
            if true {
                panic!("table flipped");
            }
            Ok(())
        })
        .unwrap()
        .remote("room.ping", || async { Ok("pong") })
        .unwrap();
    let dispatcher = dispatcher(builder);

    let response = dispatcher.handle(&user_request("room.crash", b"")).await;
    let error = response.error.expect("Expected error");
    assert_eq!(error.code, "PIT-500");
    assert_eq!(error.msg, "table flipped");

    let response = dispatcher.handle(&user_request("room.ping", b"")).await;
    assert_eq!(response, Response::ok(br#""pong""#.to_vec()));
}

#[tokio::test]
async fn test_panic_before_future_is_contained() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .remote_with_arg("room.join", |name: String| {
            if name == "boom" {
                panic!("sync prefix exploded");
            }
            async move { Ok(name) }
        })
        .unwrap();
    let (delivery, mut rx) = ChannelDelivery::channel();
    let dispatcher = Dispatcher::new(
        builder.build(),
        JsonCodec,
        Arc::new(LoggingRpcClient),
        Arc::new(delivery),
    );

    let response = dispatcher.handle(&user_request("room.join", br#""boom""#)).await;
    let error = response.error.expect("Expected error");
    assert_eq!(error.code, "PIT-500");
    assert_eq!(error.msg, "sync prefix exploded");

    let joined = dispatcher.spawn(RequestHandle::new(9), user_request("room.join", br#""boom""#));
    assert!(joined.await.is_ok(), "dispatch task must survive the panic");
    let delivered = rx.recv().await.unwrap().decode().unwrap();
    assert_eq!(delivered.error.unwrap().msg, "sync prefix exploded");

    let response = dispatcher.handle(&user_request("room.join", br#""ok""#)).await;
    assert_eq!(response, Response::ok(br#""ok""#.to_vec()));
}

/// Argument type whose deserializer panics on a poisoned value.
#[derive(Debug)]
struct Fragile(String);

impl<'de> Deserialize<'de> for Fragile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "poison" {
            panic!("argument decoder blew up");
        }
        Ok(Fragile(raw))
    }
}

#[tokio::test]
async fn test_panic_while_decoding_is_contained() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .remote_with_arg("room.echo", |arg: Fragile| async move { Ok(arg.0) })
        .unwrap();
    let dispatcher = dispatcher(builder);

    let response = dispatcher.handle(&user_request("room.echo", br#""poison""#)).await;
    let error = response.error.expect("Expected error");
    assert_eq!(error.code, "PIT-500");
    assert_eq!(error.msg, "argument decoder blew up");

    let response = dispatcher.handle(&user_request("room.echo", br#""fine""#)).await;
    assert_eq!(response, Response::ok(br#""fine""#.to_vec()));
}

#[tokio::test]
async fn test_dispatch_records_metrics() {
    let mut custom = CustomMetrics::new();
    custom.add_counter(MetricSpec::new(
        "game",
        "room",
        "joins",
        "Players that joined a room",
        &["room"],
    ));
    let metrics = Arc::new(Metrics::with_custom(custom).unwrap());

    let mut builder = HandlerRegistryBuilder::new();
    {
        let metrics = metrics.clone();
        builder
            .remote_with_arg("room.join", move |room: String| {
                let metrics = metrics.clone();
                async move {
                    metrics
                        .inc_counter("joins", &[room.as_str()])
                        .await
                        .map_err(|e| HandlerError::new(e.to_string()))?;
                    Ok(room)
                }
            })
            .unwrap();
    }
    let dispatcher = dispatcher(builder).with_metrics(metrics.clone());

    dispatcher.handle(&user_request("room.room.join", br#""lobby""#)).await;
    dispatcher.handle(&user_request("room.join", br#""lobby""#)).await;
    dispatcher.handle(&user_request("room.join", b"12")).await;
    dispatcher.handle(&user_request("room.leave", b"")).await;

    assert_eq!(metrics.counter_value("joins", &["lobby"]).await, Some(2));
    assert_eq!(
        metrics
            .counter_value("requests", &["room.join", "user", "ok"])
            .await,
        Some(2)
    );
    assert_eq!(
        metrics
            .counter_value("requests", &["room.join", "user", "PIT-500"])
            .await,
        Some(1)
    );
    assert_eq!(
        metrics
            .counter_value("requests", &["unknown", "user", "PIT-404"])
            .await,
        Some(1)
    );

    let latency = metrics
        .histogram_snapshot("handler_duration", &["room.join", "ok"])
        .await
        .unwrap();
    assert_eq!(latency.count, 2);
    assert!(latency.sum >= 0.0);
}

#[tokio::test]
async fn test_malformed_route_is_500() {
    let dispatcher = dispatcher(HandlerRegistryBuilder::new());
    for route in ["join", "a.b.c.d"] {
        let response = dispatcher.handle(&user_request(route, b"")).await;
        assert_eq!(error_code(&response), "PIT-500");
    }
}

#[tokio::test]
async fn test_bad_session_is_500() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .handler("room.join", |_session: Session| async { Ok(()) })
        .unwrap();
    let dispatcher = dispatcher(builder);

    let mut request = sys_request("room.join", 1, b"");
    request.session = Vec::new();
    let response = dispatcher.handle(&request).await;
    assert_eq!(error_code(&response), "PIT-500");

    request.session = b"{not json".to_vec();
    let response = dispatcher.handle(&request).await;
    assert_eq!(error_code(&response), "PIT-500");
}

#[tokio::test]
async fn test_unencodable_result_is_500() {
    let mut builder = HandlerRegistryBuilder::new();
    builder
        .remote("room.seats", || async {
            let mut seats = BTreeMap::new();
            seats.insert((1u8, 2u8), "taken");
            Ok(seats)
        })
        .unwrap();
    let dispatcher = dispatcher(builder);

    let response = dispatcher.handle(&user_request("room.seats", b"")).await;
    assert_eq!(error_code(&response), "PIT-500");
}

/// JSON codec that counts how often it is asked to encode.
struct CountingCodec {
    encodes: Arc<AtomicUsize>,
}

impl Codec for CountingCodec {
    fn name(&self) -> &'static str {
        "counting-json"
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        JsonCodec.decode(data)
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        JsonCodec.encode(value)
    }
}

#[tokio::test]
async fn test_void_return_skips_codec() {
    let mut builder = HandlerRegistryBuilder::<CountingCodec>::new();
    builder
        .remote_with_arg("room.leave", |_who: String| async { Ok(()) })
        .unwrap()
        .remote("room.size", || async { Ok(4u32) })
        .unwrap();
    let encodes = Arc::new(AtomicUsize::new(0));
    let (delivery, _rx) = ChannelDelivery::channel();
    let dispatcher = Dispatcher::new(
        builder.build(),
        CountingCodec {
            encodes: encodes.clone(),
        },
        Arc::new(LoggingRpcClient),
        Arc::new(delivery),
    );

    let response = dispatcher.handle(&user_request("room.leave", br#""p1""#)).await;
    assert_eq!(response, Response::ok(Vec::new()));
    assert_eq!(encodes.load(Ordering::SeqCst), 0);

    let response = dispatcher.handle(&user_request("room.size", b"")).await;
    assert_eq!(response, Response::ok(b"4".to_vec()));
    assert_eq!(encodes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dispatch_delivers_exactly_once() {
    let mut builder = HandlerRegistryBuilder::new();
    builder.remote("room.ping", || async { Ok("pong") }).unwrap();
    let (delivery, mut rx) = ChannelDelivery::channel();
    let dispatcher = Dispatcher::new(
        builder.build(),
        JsonCodec,
        Arc::new(LoggingRpcClient),
        Arc::new(delivery),
    );

    dispatcher
        .dispatch(RequestHandle::new(7), user_request("room.ping", b""))
        .await;
    dispatcher
        .dispatch(RequestHandle::new(8), user_request("room.missing", b""))
        .await;

    let first = rx.recv().await.unwrap();
    assert_eq!(first.handle, RequestHandle::new(7));
    assert_eq!(first.decode().unwrap(), Response::ok(br#""pong""#.to_vec()));

    let second = rx.recv().await.unwrap();
    assert_eq!(second.handle, RequestHandle::new(8));
    assert_eq!(error_code(&second.decode().unwrap()), "PIT-404");

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_delivery_failure_does_not_break_dispatcher() {
    let mut builder = HandlerRegistryBuilder::new();
    builder.remote("room.ping", || async { Ok("pong") }).unwrap();
    let (delivery, rx) = ChannelDelivery::channel();
    drop(rx);
    let dispatcher = Dispatcher::new(
        builder.build(),
        JsonCodec,
        Arc::new(LoggingRpcClient),
        Arc::new(delivery),
    );

    dispatcher
        .spawn(RequestHandle::new(1), user_request("room.ping", b""))
        .await
        .expect("dispatch task must not panic");

    let response = dispatcher.handle(&user_request("room.ping", b"")).await;
    assert!(!response.is_error());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatches_do_not_cross_talk() {
    const N: usize = 128;

    let mut builder = HandlerRegistryBuilder::new();
    for i in 0..N {
        let remote = format!("svc{}.mark", i);
        builder
            .remote_with_arg(&remote, move |delay_ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(format!("marker-{}", i))
            })
            .unwrap();
        let handler = format!("svc{}.whoami", i);
        builder
            .handler(&handler, move |session: Session| async move {
                tokio::time::sleep(Duration::from_millis((session.id() % 7) as u64)).await;
                Ok(session.id())
            })
            .unwrap();
    }

    let (delivery, mut rx) = ChannelDelivery::channel();
    let dispatcher = Dispatcher::new(
        builder.build(),
        JsonCodec,
        Arc::new(LoggingRpcClient),
        Arc::new(delivery),
    );

    for i in 0..N {
        let delay = ((N - i) % 11) as u64;
        let data = serde_json::to_vec(&delay).unwrap();
        dispatcher.spawn(
            RequestHandle::new(i as u64),
            user_request(&format!("svc{}.mark", i), &data),
        );
        dispatcher.spawn(
            RequestHandle::new((N + i) as u64),
            sys_request(&format!("svc{}.whoami", i), 1000 + i as i64, b""),
        );
    }

    let mut responses = HashMap::new();
    for _ in 0..(2 * N) {
        let delivered = rx.recv().await.expect("Expected a response per request");
        let previous = responses.insert(delivered.handle.id(), delivered.decode().unwrap());
        assert!(previous.is_none(), "duplicate response for {}", delivered.handle);
    }

    for i in 0..N {
        let marker: String = serde_json::from_slice(&responses[&(i as u64)].data).unwrap();
        assert_eq!(marker, format!("marker-{}", i));

        let id: i64 = serde_json::from_slice(&responses[&((N + i) as u64)].data).unwrap();
        assert_eq!(id, 1000 + i as i64);
    }
}
