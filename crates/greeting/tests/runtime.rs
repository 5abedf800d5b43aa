//! End-to-end tests of the call runtime over the in-process transport.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout};

use greeting::{
    BoxMessage, CallEnvelope, CallOutcome, ChannelObserver, Code, Connector, Frame, Greeter,
    GreeterSettings, HeaderMode, HelloRequest, HelloResponse, Message, MessageChannel, Metadata,
    MethodHandler, ObservedChannel, Server, ServerConfig, ServerHandle, ServiceDefinition, Status,
    StreamInterceptor, StreamNext, UnaryHandler, UnaryInterceptor, UnaryNext, greeting_service,
    inspect_unary, methods, transport,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("greeting=debug")
            .with_test_writer()
            .init();
    });
}

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Records unary and stream hooks under a name.
#[derive(Clone)]
struct Recording {
    name: &'static str,
    log: Log,
}

impl Recording {
    fn new(name: &'static str, log: &Log) -> Self {
        Self {
            name,
            log: Arc::clone(log),
        }
    }

    fn push(&self, event: impl AsRef<str>) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {}", self.name, event.as_ref()));
    }

    fn push_result<T>(&self, result: &Result<T, Status>) {
        match result {
            Ok(_) => self.push("post ok"),
            Err(status) => self.push(format!("post {}", status.code())),
        }
    }
}

#[async_trait]
impl UnaryInterceptor for Recording {
    async fn intercept(
        &self,
        call: &CallEnvelope,
        request: BoxMessage,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status> {
        self.push("pre");
        let result = next.run(call, request).await;
        self.push_result(&result);
        result
    }
}

#[async_trait]
impl StreamInterceptor for Recording {
    async fn intercept(
        &self,
        channel: &mut dyn MessageChannel,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        self.push("pre");
        let result = {
            let mut observed = ObservedChannel::new(channel, self);
            next.run(&mut observed).await
        };
        self.push_result(&result);
        result
    }
}

impl ChannelObserver for Recording {
    fn on_recv(&self, _call: &CallEnvelope, message: &dyn Message) {
        let request = message.downcast_ref::<HelloRequest>().unwrap();
        self.push(format!("recv {}", request.name));
    }

    fn on_send(&self, _call: &CallEnvelope, message: &dyn Message) {
        let response = message.downcast_ref::<HelloResponse>().unwrap();
        self.push(format!("send {}", response.message));
    }
}

fn start(settings: GreeterSettings, config: ServerConfig) -> (ServerHandle, Connector) {
    init_tracing();
    let server = Server::builder()
        .config(config)
        .add_service(greeting_service(Greeter::new(settings)))
        .build();
    let (listener, connector) = transport::memory(16);
    (server.start(listener).unwrap(), connector)
}

fn client_metadata() -> Metadata {
    Metadata::from_pairs([("type", "test"), ("from", "client")])
}

async fn unary(connector: &Connector, name: &str) -> CallOutcome {
    let mut call = connector
        .call(methods::HELLO, client_metadata())
        .await
        .unwrap();
    call.send(HelloRequest::new(name)).await.unwrap();
    call.finish().await
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unary_greets_by_name() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let outcome = unary(&connector, "Alice").await;
    assert!(outcome.status.is_none(), "status: {:?}", outcome.status);

    let header = outcome.header.clone().unwrap();
    assert_eq!(header.get("type"), Some("unary"));
    assert_eq!(header.get("in"), Some("header"));
    assert_eq!(outcome.trailer.get("in"), Some("trailer"));

    let messages = outcome.into_messages::<HelloResponse>().unwrap();
    assert_eq!(
        messages,
        [HelloResponse {
            message: "hello, Alice!".to_string()
        }]
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_unary_empty_name_is_invalid_argument() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let outcome = unary(&connector, "").await;
    let status = outcome.status.unwrap();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "name empty");
    assert_eq!(status.debug_info(), Some("detail error"));
    assert!(outcome.messages.is_empty());
    // Metadata set before the failure still reaches the caller.
    assert_eq!(outcome.trailer.get("in"), Some("trailer"));

    handle.stop().await;
}

#[tokio::test]
async fn test_server_stream_preserves_order() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_SERVER_STREAM, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("Bob")).await.unwrap();
    let outcome = call.finish().await;
    assert!(outcome.status.is_none());

    let messages: Vec<String> = outcome
        .into_messages::<HelloResponse>()
        .unwrap()
        .into_iter()
        .map(|r| r.message)
        .collect();
    let expected: Vec<String> = (0..5).map(|i| format!("[{i}] Hello, Bob!")).collect();
    assert_eq!(messages, expected);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_stream_paces_sends() {
    let settings = GreeterSettings {
        stream_count: 3,
        stream_interval: Duration::from_secs(1),
        ..GreeterSettings::immediate()
    };
    let (handle, connector) = start(settings, ServerConfig::new());

    let started = Instant::now();
    let mut call = connector
        .call(methods::HELLO_SERVER_STREAM, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("Bob")).await.unwrap();
    let outcome = call.finish().await;
    assert_eq!(outcome.messages.len(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));

    handle.stop().await;
}

#[tokio::test]
async fn test_client_stream_with_no_messages() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let call = connector
        .call(methods::HELLO_CLIENT_STREAM, Metadata::new())
        .await
        .unwrap();
    let outcome = call.finish().await;
    assert!(outcome.status.is_none());
    let messages = outcome.into_messages::<HelloResponse>().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "Hello, []!");

    handle.stop().await;
}

#[tokio::test]
async fn test_client_stream_aggregates_in_order() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_CLIENT_STREAM, Metadata::new())
        .await
        .unwrap();
    for name in ["a", "b", "c"] {
        call.send(HelloRequest::new(name)).await.unwrap();
    }
    let outcome = call.finish().await;
    let messages = outcome.into_messages::<HelloResponse>().unwrap();
    assert_eq!(messages[0].message, "Hello, [a b c]!");

    handle.stop().await;
}

#[tokio::test]
async fn test_client_stream_cap_is_resource_exhausted() {
    let settings = GreeterSettings {
        max_client_stream_messages: Some(2),
        ..GreeterSettings::immediate()
    };
    let (handle, connector) = start(settings, ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_CLIENT_STREAM, Metadata::new())
        .await
        .unwrap();
    for name in ["a", "b", "c"] {
        call.send(HelloRequest::new(name)).await.unwrap();
    }
    let outcome = call.finish().await;
    assert_eq!(outcome.status.unwrap().code(), Code::ResourceExhausted);
    assert!(outcome.messages.is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_client_stream_request_error_aborts_without_reply() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_CLIENT_STREAM, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("a")).await.unwrap();
    call.send_error(Status::new(Code::DataLoss, "torn"))
        .await
        .unwrap();

    let outcome = call.finish().await;
    let status = outcome.status.unwrap();
    assert_eq!(status.code(), Code::DataLoss);
    assert_eq!(status.message(), "torn");
    assert!(outcome.messages.is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_bidi_replies_in_lockstep() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_BI_STREAMS, client_metadata())
        .await
        .unwrap();
    for i in 0..4 {
        call.send(HelloRequest::new(format!("#{i}"))).await.unwrap();
        let reply: HelloResponse = call.message().await.unwrap().unwrap();
        assert_eq!(reply.message, format!("Hello, #{i}!"));
    }
    call.close_send();
    assert!(call.message::<HelloResponse>().await.unwrap().is_none());

    assert_eq!(call.header().await.unwrap().get("type"), Some("stream"));
    assert_eq!(call.trailer().unwrap().get("in"), Some("trailer"));

    handle.stop().await;
}

#[tokio::test]
async fn test_bidi_request_error_keeps_earlier_replies() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_BI_STREAMS, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("one")).await.unwrap();
    call.send_error(Status::new(Code::DataLoss, "torn"))
        .await
        .unwrap();

    let outcome = call.finish().await;
    assert_eq!(outcome.status.as_ref().unwrap().code(), Code::DataLoss);
    let replies = outcome.into_messages::<HelloResponse>().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message, "Hello, one!");

    handle.stop().await;
}

#[tokio::test]
async fn test_bidi_deferred_header_rides_first_message() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_BI_STREAMS, Metadata::new())
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(50), call.recv_frame())
            .await
            .is_err(),
        "deferred header must wait for the first message"
    );

    call.send(HelloRequest::new("Carol")).await.unwrap();
    match call.recv_frame().await.unwrap() {
        Frame::Header(md) => assert_eq!(md.get("in"), Some("header")),
        other => panic!("expected header, got {other:?}"),
    }
    assert!(matches!(call.recv_frame().await.unwrap(), Frame::Message(_)));

    call.close_send();
    assert!(call.finish().await.status.is_none());
    handle.stop().await;
}

#[tokio::test]
async fn test_bidi_immediate_header_precedes_requests() {
    let settings = GreeterSettings {
        bidi_header: HeaderMode::Immediate,
        ..GreeterSettings::immediate()
    };
    let (handle, connector) = start(settings, ServerConfig::new());

    let mut call = connector
        .call(methods::HELLO_BI_STREAMS, Metadata::new())
        .await
        .unwrap();
    let frame = timeout(Duration::from_secs(1), call.recv_frame())
        .await
        .unwrap()
        .unwrap();
    match frame {
        Frame::Header(md) => assert_eq!(md.get("type"), Some("stream")),
        other => panic!("expected header, got {other:?}"),
    }

    call.send(HelloRequest::new("Dave")).await.unwrap();
    assert!(matches!(call.recv_frame().await.unwrap(), Frame::Message(_)));

    call.close_send();
    let outcome = call.finish().await;
    assert!(outcome.status.is_none());
    assert!(outcome.header.is_none(), "header must be sent exactly once");
    handle.stop().await;
}

#[tokio::test]
async fn test_unary_interceptors_run_in_stack_order() {
    let log = Log::default();
    let config = ServerConfig::new()
        .unary_interceptor(Recording::new("A", &log))
        .unary_interceptor(Recording::new("B", &log));
    let (handle, connector) = start(GreeterSettings::immediate(), config);

    let outcome = unary(&connector, "Alice").await;
    assert!(outcome.status.is_none());
    assert_eq!(entries(&log), ["A pre", "B pre", "B post ok", "A post ok"]);

    log.lock().unwrap().clear();
    let outcome = unary(&connector, "").await;
    assert_eq!(outcome.status.unwrap().code(), Code::InvalidArgument);
    assert_eq!(
        entries(&log),
        [
            "A pre",
            "B pre",
            "B post InvalidArgument",
            "A post InvalidArgument"
        ]
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_stream_wrappers_observe_inward_then_outward() {
    let log = Log::default();
    let config = ServerConfig::new()
        .stream_interceptor(Recording::new("A", &log))
        .stream_interceptor(Recording::new("B", &log));
    let (handle, connector) = start(GreeterSettings::immediate(), config);

    let mut call = connector
        .call(methods::HELLO_BI_STREAMS, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("x")).await.unwrap();
    let _reply: HelloResponse = call.message().await.unwrap().unwrap();
    call.close_send();
    assert!(call.finish().await.status.is_none());
    wait_for(|| handle.in_flight() == 0).await;

    assert_eq!(
        entries(&log),
        [
            "A pre",
            "B pre",
            "A recv x",
            "B recv x",
            "B send Hello, x!",
            "A send Hello, x!",
            "B post ok",
            "A post ok",
        ]
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_stream_interceptor_sees_server_stream_request() {
    let log = Log::default();
    let config = ServerConfig::new().stream_interceptor(Recording::new("A", &log));
    let settings = GreeterSettings {
        stream_count: 2,
        ..GreeterSettings::immediate()
    };
    let (handle, connector) = start(settings, config);

    let mut call = connector
        .call(methods::HELLO_SERVER_STREAM, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("y")).await.unwrap();
    assert!(call.finish().await.status.is_none());
    wait_for(|| handle.in_flight() == 0).await;

    assert_eq!(
        entries(&log),
        [
            "A pre",
            "A recv y",
            "A send [0] Hello, y!",
            "A send [1] Hello, y!",
            "A post ok",
        ]
    );

    handle.stop().await;
}

/// Upper-cases greetings and marks the trailer.
struct Shout;

#[async_trait]
impl UnaryInterceptor for Shout {
    async fn intercept(
        &self,
        call: &CallEnvelope,
        request: BoxMessage,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status> {
        let mut response = next.run(call, request).await?;
        if let Some(reply) = (*response).downcast_mut::<HelloResponse>() {
            reply.message = reply.message.to_uppercase();
        }
        call.set_trailer(Metadata::from_pairs([("shouted", "true")]))?;
        Ok(response)
    }
}

#[tokio::test]
async fn test_mutating_interceptor_rewrites_response() {
    let seen = Log::default();
    let recorder = Arc::clone(&seen);
    let config = ServerConfig::new()
        .unary_interceptor(inspect_unary(move |call, request| {
            recorder
                .lock()
                .unwrap()
                .push(format!("{} {:?}", call.method(), request));
        }))
        .unary_interceptor(Shout);
    let (handle, connector) = start(GreeterSettings::immediate(), config);

    let outcome = unary(&connector, "Alice").await;
    assert_eq!(outcome.trailer.get("shouted"), Some("true"));
    assert_eq!(outcome.trailer.get("in"), Some("trailer"));
    let messages = outcome.into_messages::<HelloResponse>().unwrap();
    assert_eq!(messages[0].message, "HELLO, ALICE!");
    assert_eq!(
        entries(&seen),
        [format!(
            "{} {:?}",
            methods::HELLO,
            HelloRequest::new("Alice")
        )]
    );

    handle.stop().await;
}

#[tokio::test]
async fn test_unknown_method_is_not_found_before_interceptors() {
    let log = Log::default();
    let config = ServerConfig::new()
        .unary_interceptor(Recording::new("A", &log))
        .stream_interceptor(Recording::new("A", &log));
    let (handle, connector) = start(GreeterSettings::immediate(), config);

    let mut call = connector
        .call("/myapp.GreetingService/Goodbye", Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("z")).await.unwrap();
    let outcome = call.finish().await;

    assert_eq!(outcome.status.unwrap().code(), Code::NotFound);
    assert!(outcome.header.is_none());
    assert!(entries(&log).is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_dropped_client_cancels_server_stream() {
    let log = Log::default();
    let config = ServerConfig::new().stream_interceptor(Recording::new("A", &log));
    let settings = GreeterSettings {
        stream_count: 1_000,
        stream_interval: Duration::from_millis(5),
        ..GreeterSettings::immediate()
    };
    let (handle, connector) = start(settings, config);

    let mut call = connector
        .call(methods::HELLO_SERVER_STREAM, Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("w")).await.unwrap();
    call.close_send();
    let first: HelloResponse = call.message().await.unwrap().unwrap();
    assert_eq!(first.message, "[0] Hello, w!");
    drop(call);

    wait_for(|| handle.in_flight() == 0).await;
    let log = entries(&log);
    assert_eq!(log.last().map(String::as_str), Some("A post Cancelled"));
    assert!(log.len() < 1_000);

    handle.stop().await;
}

#[tokio::test]
async fn test_deadline_surfaces_at_next_recv() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let mut call = connector
        .call_with_deadline(
            methods::HELLO_BI_STREAMS,
            Metadata::new(),
            Instant::now() + Duration::from_millis(50),
        )
        .await
        .unwrap();

    // Keep the request stream open so the handler blocks in recv.
    let status = timeout(Duration::from_secs(2), async {
        loop {
            if let Frame::Trailer { status, .. } = call.recv_frame().await.unwrap() {
                break status;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(status.unwrap().code(), Code::DeadlineExceeded);

    handle.stop().await;
}

/// Waits for a release signal, then echoes the request.
struct Gate {
    release: Arc<Notify>,
}

#[async_trait]
impl UnaryHandler for Gate {
    async fn call(&self, _call: &CallEnvelope, request: BoxMessage) -> Result<BoxMessage, Status> {
        self.release.notified().await;
        Ok(request)
    }
}

#[tokio::test]
async fn test_stop_drains_in_flight_and_refuses_new_calls() {
    init_tracing();
    let release = Arc::new(Notify::new());
    let server = Server::builder()
        .add_service(ServiceDefinition::new("test.Gate").method(
            "Wait",
            MethodHandler::Unary(Arc::new(Gate {
                release: Arc::clone(&release),
            })),
        ))
        .build();
    let (listener, connector) = transport::memory(8);
    let handle = Arc::new(server.start(listener).unwrap());

    let mut blocked = connector
        .call("/test.Gate/Wait", Metadata::new())
        .await
        .unwrap();
    blocked.send(HelloRequest::new("held")).await.unwrap();
    wait_for(|| handle.in_flight() == 1).await;

    let stopping = tokio::spawn({
        let handle = Arc::clone(&handle);
        async move { handle.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished(), "stop returned before the drain");

    let refused = match connector.call("/test.Gate/Wait", Metadata::new()).await {
        Err(status) => status,
        Ok(call) => call.finish().await.status.unwrap(),
    };
    assert_eq!(refused.code(), Code::Unavailable);

    release.notify_one();
    timeout(Duration::from_secs(2), stopping)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.in_flight(), 0);

    let outcome = blocked.finish().await;
    assert!(outcome.status.is_none());
    let echoed = outcome.into_messages::<HelloRequest>().unwrap();
    assert_eq!(echoed[0].name, "held");

    // A second stop is a no-op.
    timeout(Duration::from_secs(1), handle.stop()).await.unwrap();
}

struct Panics;

#[async_trait]
impl UnaryHandler for Panics {
    async fn call(&self, _call: &CallEnvelope, _request: BoxMessage) -> Result<BoxMessage, Status> {
        panic!("boom");
    }
}

#[tokio::test]
async fn test_handler_panic_is_internal() {
    init_tracing();
    let server = Server::builder()
        .add_service(
            ServiceDefinition::new("test.Panics")
                .method("Boom", MethodHandler::Unary(Arc::new(Panics))),
        )
        .build();
    let (listener, connector) = transport::memory(4);
    let handle = server.start(listener).unwrap();

    let mut call = connector
        .call("/test.Panics/Boom", Metadata::new())
        .await
        .unwrap();
    call.send(HelloRequest::new("p")).await.unwrap();
    let status = call.finish().await.status.unwrap();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "internal error");

    handle.stop().await;
}

#[tokio::test]
async fn test_unary_without_request_is_internal() {
    let (handle, connector) = start(GreeterSettings::immediate(), ServerConfig::new());

    let call = connector.call(methods::HELLO, Metadata::new()).await.unwrap();
    let status = call.finish().await.status.unwrap();
    assert_eq!(status.code(), Code::Internal);

    handle.stop().await;
}
