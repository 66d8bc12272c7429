//! End-to-end tests of the RPC bridge over in-memory channels implementing
//! both transport strategies.

use async_trait::async_trait;
use futures::future::BoxFuture;
use roomrpc::{
    erase,
    service::{UserInputReport, UserInputType},
    ui::{perform_ui_action_key, UiAction, UiActionHandler, UiActionRequest, UiState},
    ActionOutcome, CallError, DirectTransport, Frame, Handler, InboundRpc,
    MessageChannel, MethodKey, PubSubTransport, ResponseEnvelope, RpcChannel, RpcChannelError,
    RpcClient, SendError, Transport,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// In-memory pub/sub topic: each published frame lands in the opposite peer's
// inbound queue (peer addressing belongs to the excluded session layer).

struct HubChannel {
    to_other: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl MessageChannel for HubChannel {
    async fn publish(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.to_other
            .send(bytes)
            .await
            .map_err(|_| SendError("peer disconnected".into()))
    }
}

fn linked_pair() -> (Arc<PubSubTransport>, Arc<PubSubTransport>) {
    let (client_tx, client_rx) = mpsc::channel(64);
    let (agent_tx, agent_rx) = mpsc::channel(64);
    let client = PubSubTransport::new(Arc::new(HubChannel { to_other: agent_tx }), client_rx);
    let agent = PubSubTransport::new(Arc::new(HubChannel { to_other: client_tx }), agent_rx);
    (client, agent)
}

/// A transport whose requests go to a queue nobody serves, with a handle to
/// inject inbound frames by hand.
fn silent_peer() -> (
    Arc<PubSubTransport>,
    mpsc::Receiver<Vec<u8>>,
    mpsc::Sender<Vec<u8>>,
) {
    let (in_tx, in_rx) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel(64);
    let transport = PubSubTransport::new(Arc::new(HubChannel { to_other: out_tx }), in_rx);
    (transport, out_rx, in_tx)
}

// ---------------------------------------------------------------------------
// Test handlers

struct Echo;

impl Handler for Echo {
    type Request = serde_json::Value;

    fn call(&self, request: serde_json::Value) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async move { ActionOutcome::ok_with("echo", request) })
    }
}

/// Echoes its payload after a caller-chosen delay, so response order can be
/// forced to differ from send order.
struct DelayedEcho;

#[derive(serde::Serialize, serde::Deserialize)]
struct DelayedRequest {
    index: u64,
    delay_ms: u64,
}

impl Handler for DelayedEcho {
    type Request = DelayedRequest;

    fn call(&self, request: DelayedRequest) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(request.delay_ms)).await;
            ActionOutcome::ok_with("done", serde_json::json!({ "index": request.index }))
        })
    }
}

/// A handler whose future unwinds, for checking that a panic becomes a
/// failure response instead of a dropped one.
struct Panicker;

impl Handler for Panicker {
    type Request = serde_json::Value;

    fn call(&self, _request: serde_json::Value) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async { panic!("flashcard state poisoned") })
    }
}

fn echo_key() -> MethodKey {
    "test.Echo/Echo".parse().unwrap()
}

// ---------------------------------------------------------------------------
// Pub/sub strategy

#[tokio::test(flavor = "multi_thread")]
async fn round_trip_resolves_to_echoed_payload() {
    let (client, agent) = linked_pair();
    agent.register_handler(&echo_key(), erase(Echo));

    let rpc = RpcClient::new(client, "agent");
    let payload = serde_json::json!({ "lesson": 3, "phrase": "où est la gare" });
    let outcome: ActionOutcome = rpc.call(&echo_key(), &payload).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.data, Some(payload));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_calls_resolve_independently_out_of_order() {
    let (client, agent) = linked_pair();
    agent.register_handler(&echo_key(), erase(DelayedEcho));
    let rpc = RpcClient::new(client, "agent");

    // Earlier calls respond later, so every response arrives out of order.
    let calls = (0..5u64).map(|index| {
        let rpc = rpc.clone();
        async move {
            let request = DelayedRequest {
                index,
                delay_ms: (4 - index) * 40,
            };
            let outcome: ActionOutcome = rpc.call(&echo_key(), &request).await.unwrap();
            (index, outcome)
        }
    });

    for (index, outcome) in futures::future::join_all(calls).await {
        assert!(outcome.success);
        assert_eq!(
            outcome.data,
            Some(serde_json::json!({ "index": index })),
            "response crosstalk on call {index}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_ignores_late_response() {
    let (transport, mut outbound, inject) = silent_peer();
    let rpc = RpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>, "agent")
        .with_timeout(Duration::from_secs(10));

    let started = tokio::time::Instant::now();
    let pending = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.request(&echo_key(), b"{}").await }
    });

    // Capture the correlation id from the frame that went out.
    let sent = outbound.recv().await.unwrap();
    let correlation_id = match Frame::decode(&sent).unwrap() {
        Frame::Request(env) => env.correlation_id,
        other => panic!("expected request frame, got {other:?}"),
    };

    let err = pending.await.unwrap().unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, CallError::Timeout { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11));
    assert_eq!(transport.pending_count(), 0);

    // A response arriving after expiry is discarded without side effects.
    let late = Frame::Response(ResponseEnvelope {
        service: "test.Echo".into(),
        method: "Echo".into(),
        correlation_id,
        success: true,
        payload: b"{}".to_vec(),
        error_message: None,
    });
    inject.send(late.encode()).await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_response_settles_exactly_once() {
    let (transport, mut outbound, inject) = silent_peer();
    let rpc = RpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>, "agent");

    let pending = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.request(&echo_key(), b"{}").await }
    });

    let sent = outbound.recv().await.unwrap();
    let correlation_id = match Frame::decode(&sent).unwrap() {
        Frame::Request(env) => env.correlation_id,
        other => panic!("expected request frame, got {other:?}"),
    };

    for body in ["first", "second"] {
        let frame = Frame::Response(ResponseEnvelope {
            service: "test.Echo".into(),
            method: "Echo".into(),
            correlation_id: correlation_id.clone(),
            success: true,
            payload: body.as_bytes().to_vec(),
            error_message: None,
        });
        inject.send(frame.encode()).await.unwrap();
    }

    assert_eq!(pending.await.unwrap().unwrap(), b"first".to_vec());
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_method_fails_without_breaking_the_session() {
    let (client, agent) = linked_pair();
    agent.register_handler(&echo_key(), erase(Echo));
    let rpc = RpcClient::new(client, "agent");

    let unknown: MethodKey = "x.Y/Z".parse().unwrap();
    let err = rpc.request(&unknown, b"{}").await.unwrap_err();
    match err {
        CallError::Remote(message) => assert!(message.contains("Unknown")),
        other => panic!("expected remote failure, got {other:?}"),
    }

    // The session keeps working after the failed call.
    let outcome: ActionOutcome = rpc
        .call(&echo_key(), &serde_json::json!({ "still": "alive" }))
        .await
        .unwrap();
    assert!(outcome.success);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_answers_promptly_with_failure() {
    let (client, agent) = linked_pair();
    agent.register_handler(&echo_key(), erase(Panicker));
    let rpc = RpcClient::new(client, "agent").with_timeout(Duration::from_secs(10));

    let started = tokio::time::Instant::now();
    let err = rpc.request(&echo_key(), b"{}").await.unwrap_err();
    match err {
        CallError::Remote(message) => assert!(message.contains("flashcard state poisoned")),
        other => panic!("expected remote failure, got {other:?}"),
    }
    // The response came from the panic, not from the timeout window.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn unencodable_request_surfaces_before_send() {
    let (transport, _outbound, _inject) = silent_peer();
    let rpc = RpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>, "agent");

    // serde_json refuses maps with non-string keys.
    let bad: std::collections::BTreeMap<Vec<u8>, u8> =
        std::collections::BTreeMap::from([(vec![1], 1)]);
    let err = rpc
        .call::<_, ActionOutcome>(&echo_key(), &bad)
        .await
        .unwrap_err();
    match err {
        CallError::Transport(message) => assert!(message.contains("encode")),
        other => panic!("expected transport failure, got {other:?}"),
    }
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_rejects_all_pending_and_drops_handlers() {
    let (transport, _outbound, _inject) = silent_peer();
    transport.register_handler(&echo_key(), erase(Echo));
    let rpc = RpcClient::new(Arc::clone(&transport) as Arc<dyn Transport>, "agent")
        .with_timeout(Duration::from_secs(60));

    let pending: Vec<_> = (0..4)
        .map(|_| {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.request(&echo_key(), b"{}").await })
        })
        .collect();
    tokio::task::yield_now().await;
    assert_eq!(transport.pending_count(), 4);

    transport.close().await;
    for call in pending {
        assert!(matches!(
            call.await.unwrap(),
            Err(CallError::ConnectionClosed)
        ));
    }
    assert_eq!(transport.pending_count(), 0);
    assert_eq!(transport.registered_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn perform_ui_action_scenario() {
    let (client, agent) = linked_pair();

    // The client registers the UI action surface; the agent calls it.
    let state = UiState::new();
    client.register_handler(
        &perform_ui_action_key(),
        erase(UiActionHandler::new(Arc::clone(&state))),
    );

    let agent_rpc =
        RpcClient::new(agent, "client").with_timeout(Duration::from_millis(1000));
    let request = UiActionRequest {
        request_id: "r1".into(),
        action: UiAction::UpdateText {
            element_id: "prompt".into(),
            content: "Répétez, s'il vous plaît".into(),
        },
    };
    let outcome: ActionOutcome = agent_rpc
        .call(&perform_ui_action_key(), &request)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(
        state.text_of("prompt").as_deref(),
        Some("Répétez, s'il vous plaît")
    );

    let err = agent_rpc
        .request(&"x.Y/Z".parse::<MethodKey>().unwrap(), b"{}")
        .await
        .unwrap_err();
    match err {
        CallError::Remote(message) => assert!(message.contains("Unknown")),
        other => panic!("expected remote failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_stub_fixes_method_and_types() {
    struct Evaluate;

    impl Handler for Evaluate {
        type Request = UserInputReport;

        fn call(&self, request: UserInputReport) -> BoxFuture<'_, ActionOutcome> {
            Box::pin(async move {
                let correct = request.content == "bonjour";
                ActionOutcome::ok_with(
                    if correct { "correct" } else { "try again" },
                    serde_json::json!({ "request_id": request.request_id }),
                )
            })
        }
    }

    let (client, agent) = linked_pair();
    agent.register_handler(
        &"rox.interaction.AgentInterface/SubmitUserInput"
            .parse()
            .unwrap(),
        erase(Evaluate),
    );

    let stub = roomrpc::service::AgentInteractionClient::new(RpcClient::new(client, "agent"));
    let outcome = stub
        .submit_user_input(&UserInputReport {
            request_id: "r7".into(),
            input_type: UserInputType::Speech,
            content: "bonjour".into(),
        })
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.message, "correct");
}

// ---------------------------------------------------------------------------
// Direct strategy: the channel's paired call primitive does the pairing.

struct DirectLink {
    to_other: mpsc::Sender<InboundRpc>,
}

#[async_trait]
impl RpcChannel for DirectLink {
    async fn perform_rpc(
        &self,
        destination: &str,
        method_key: &str,
        payload: String,
        timeout: Duration,
    ) -> Result<String, RpcChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.to_other
            .send(InboundRpc {
                caller: "caller".into(),
                method_key: method_key.to_owned(),
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RpcChannelError::Unavailable(destination.to_owned()))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(RpcChannelError::Timeout),
            Ok(Err(_)) => Err(RpcChannelError::Unavailable(destination.to_owned())),
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(message))) => Err(RpcChannelError::Remote(message)),
        }
    }
}

fn linked_direct_pair() -> (Arc<DirectTransport>, Arc<DirectTransport>) {
    let (client_tx, client_rx) = mpsc::channel(64);
    let (agent_tx, agent_rx) = mpsc::channel(64);
    let client = DirectTransport::new(Arc::new(DirectLink { to_other: agent_tx }), client_rx);
    let agent = DirectTransport::new(Arc::new(DirectLink { to_other: client_tx }), agent_rx);
    (client, agent)
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_round_trip_and_unknown_method() {
    let (client, agent) = linked_direct_pair();
    agent.register_handler(&echo_key(), erase(Echo));
    let rpc = RpcClient::new(client, "agent");

    let payload = serde_json::json!({ "word": "merci" });
    let outcome: ActionOutcome = rpc.call(&echo_key(), &payload).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.data, Some(payload));

    let err = rpc
        .request(&"x.Y/Z".parse::<MethodKey>().unwrap(), b"{}")
        .await
        .unwrap_err();
    match err {
        CallError::Remote(message) => assert!(message.contains("Unknown")),
        other => panic!("expected remote failure, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_send_failure_surfaces_as_transport_error() {
    // Peer side never constructed: the inbound queue's receiver is dropped.
    let (gone_tx, gone_rx) = mpsc::channel(1);
    drop(gone_rx);
    let (_unused_tx, own_rx) = mpsc::channel(1);
    let client = DirectTransport::new(Arc::new(DirectLink { to_other: gone_tx }), own_rx);

    let rpc = RpcClient::new(client, "agent");
    let err = rpc.request(&echo_key(), b"{}").await.unwrap_err();
    assert!(matches!(err, CallError::Transport(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn direct_panicking_handler_answers_with_failure() {
    let (client, agent) = linked_direct_pair();
    agent.register_handler(&echo_key(), erase(Panicker));
    let rpc = RpcClient::new(client, "agent").with_timeout(Duration::from_secs(10));

    let err = rpc.request(&echo_key(), b"{}").await.unwrap_err();
    match err {
        CallError::Remote(message) => assert!(message.contains("flashcard state poisoned")),
        other => panic!("expected remote failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn direct_close_interrupts_in_flight_call() {
    let (silent_tx, _held_rx) = mpsc::channel(1);
    let (_unused_tx, own_rx) = mpsc::channel(1);
    let client = DirectTransport::new(Arc::new(DirectLink { to_other: silent_tx }), own_rx);

    let rpc = RpcClient::new(Arc::clone(&client) as Arc<dyn Transport>, "agent")
        .with_timeout(Duration::from_secs(60));
    let pending = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.request(&echo_key(), b"{}").await }
    });
    tokio::task::yield_now().await;

    client.close().await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(CallError::ConnectionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn direct_timeout_carries_method_key() {
    let (silent_tx, _held_rx) = mpsc::channel(1);
    let (_unused_tx, own_rx) = mpsc::channel(1);
    let client = DirectTransport::new(Arc::new(DirectLink { to_other: silent_tx }), own_rx);

    let rpc = RpcClient::new(client, "agent").with_timeout(Duration::from_secs(10));
    let err = rpc.request(&echo_key(), b"{}").await.unwrap_err();
    match err {
        CallError::Timeout { method_key, .. } => assert_eq!(method_key, "test.Echo/Echo"),
        other => panic!("expected timeout, got {other:?}"),
    }
}
