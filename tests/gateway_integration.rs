//! Integration tests for the gateway poller and the reply path.
//!
//! Each test spins up an Axum server on a random port standing in for the
//! Everlife service gateway and/or the Graph API, and drives the bridge
//! against it over real HTTP.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use messenger_bridge::auth::AuthChallenge;
use messenger_bridge::bridge::{Bridge, BridgeDeps};
use messenger_bridge::bus::{
    BusEvent, BusMessage, COMM_SERVICE, LocalBus, MessageBus, ReplyAddl, ReplyRequest,
};
use messenger_bridge::channels::poller::{GatewayPoller, PollOutcome, PollState};
use messenger_bridge::channels::GraphApiClient;
use messenger_bridge::config::{BridgeConfig, PollConfig};
use messenger_bridge::pipeline::EnvelopeKind;
use messenger_bridge::store::LibSqlStore;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Fake gateway ────────────────────────────────────────────────────

#[derive(Default)]
struct FakeGateway {
    /// Scripted responses; once empty the gateway answers 502 (no messages).
    script: Mutex<VecDeque<(StatusCode, String)>>,
    auth_headers: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
}

async fn gateway_msg(
    State(gw): State<Arc<FakeGateway>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    gw.keys.lock().await.push(key);
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        gw.auth_headers.lock().await.push(auth.to_string());
    }

    let next = gw.script.lock().await.pop_front();
    match next {
        Some(response) => response,
        None => {
            // Behave like a long poll with an empty mailbox.
            tokio::time::sleep(Duration::from_millis(20)).await;
            (StatusCode::BAD_GATEWAY, String::new())
        }
    }
}

async fn start_gateway(script: Vec<(StatusCode, &str)>) -> (String, Arc<FakeGateway>) {
    let gw = Arc::new(FakeGateway::default());
    *gw.script.lock().await = script
        .into_iter()
        .map(|(status, body)| (status, body.to_string()))
        .collect();

    let app = Router::new()
        .route("/{key}/msg", get(gateway_msg))
        .with_state(Arc::clone(&gw));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{port}"), gw)
}

// ── Fake Graph API ──────────────────────────────────────────────────

#[derive(Default)]
struct FakeGraph {
    sends: Mutex<Vec<(Option<String>, Value)>>,
}

async fn graph_send(
    State(graph): State<Arc<FakeGraph>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> StatusCode {
    graph
        .sends
        .lock()
        .await
        .push((query.get("access_token").cloned(), body));
    StatusCode::OK
}

async fn graph_profile(Path(user_id): Path<String>) -> Response {
    if user_id == "u1" {
        Json(json!({"first_name": "Ada", "last_name": "Lovelace", "id": "u1"})).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn start_graph() -> (String, Arc<FakeGraph>) {
    let graph = Arc::new(FakeGraph::default());
    let app = Router::new()
        .route("/me/messages", post(graph_send))
        .route("/{user_id}", get(graph_profile))
        .with_state(Arc::clone(&graph));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{port}"), graph)
}

fn poller(base: &str) -> GatewayPoller {
    GatewayPoller::new(
        reqwest::Client::new(),
        base,
        Arc::new(AuthChallenge::new("@+/+/AQ==.ed25519", "signed-secret")),
        &PollConfig::default(),
    )
}

async fn build_bridge(
    gateway_base: Option<String>,
    graph_base: &str,
) -> (Arc<Bridge>, Arc<LocalBus>) {
    let config = BridgeConfig {
        gateway_base,
        graph_api_base: graph_base.to_string(),
        page_access_token: Some(SecretString::from("page-token".to_string())),
        ..Default::default()
    };
    let bus = Arc::new(LocalBus::new());
    let platform = Arc::new(GraphApiClient::new(
        graph_base,
        Some(SecretString::from("page-token".to_string())),
        reqwest::Client::new(),
    ));
    let deps = BridgeDeps {
        bus: bus.clone(),
        platform,
        store: Arc::new(LibSqlStore::new_memory().await.unwrap()),
        http: reqwest::Client::new(),
    };
    (Arc::new(Bridge::new(Arc::new(config), deps).await), bus)
}

// ── Poller over HTTP ────────────────────────────────────────────────

#[tokio::test]
async fn poll_sends_basic_auth_to_url_safe_key() {
    let (base, gw) = start_gateway(vec![(
        StatusCode::OK,
        r#"[{"sender":{"id":"u1"},"message":{"text":"hi"}}]"#,
    )])
    .await;

    let mut poller = poller(&base);
    let batch = timeout(TEST_TIMEOUT, poller.poll_once()).await.unwrap();

    assert_eq!(batch.outcome, PollOutcome::Success);
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].sender_id, "u1");
    assert_eq!(batch.messages[0].text, "hi");

    assert_eq!(gw.keys.lock().await.as_slice(), ["-_-_AQ".to_string()]);
    let expected = format!(
        "Basic {}",
        STANDARD.encode("@+/+/AQ==.ed25519:signed-secret")
    );
    assert_eq!(gw.auth_headers.lock().await.as_slice(), [expected]);
}

#[tokio::test]
async fn bad_gateway_resets_backoff_after_errors() {
    let (base, _gw) = start_gateway(vec![
        (StatusCode::INTERNAL_SERVER_ERROR, "boom"),
        (StatusCode::SERVICE_UNAVAILABLE, ""),
        (StatusCode::BAD_GATEWAY, ""),
    ])
    .await;

    let mut poller = poller(&base);
    let mut state = PollState::new(PollConfig::default().backoff);

    let first = poller.poll_once().await;
    assert_eq!(first.outcome, PollOutcome::TransientFailure);
    assert_eq!(state.next_delay(first.outcome), Some(Duration::from_secs(1)));

    let second = poller.poll_once().await;
    assert_eq!(second.outcome, PollOutcome::TransientFailure);
    assert_eq!(state.next_delay(second.outcome), Some(Duration::from_secs(2)));
    assert_eq!(poller.state().last_status, Some(503));

    let third = poller.poll_once().await;
    assert_eq!(third.outcome, PollOutcome::Success);
    assert!(third.messages.is_empty());
    assert_eq!(state.next_delay(third.outcome), Some(Duration::ZERO));
    assert_eq!(state.index(), 0);
    assert_eq!(poller.state().last_status, Some(502));
}

#[tokio::test]
async fn malformed_body_is_an_empty_success() {
    let (base, _gw) = start_gateway(vec![(StatusCode::OK, "not json at all")]).await;
    let batch = poller(&base).poll_once().await;
    assert_eq!(batch.outcome, PollOutcome::Success);
    assert!(batch.messages.is_empty());
}

// ── End to end ──────────────────────────────────────────────────────

#[tokio::test]
async fn polled_messages_are_published_as_envelopes() {
    let (gateway, _gw) = start_gateway(vec![(
        StatusCode::OK,
        r#"[{"sender":{"id":"u1"},"message":{"text":"hi"}},
            {"sender":{"id":"u2"},"message":{"text":"hello"}}]"#,
    )])
    .await;
    let (graph, _graph) = start_graph().await;
    let (bridge, bus) = build_bridge(Some(gateway), &graph).await;

    bridge
        .load_auth(Some(AuthChallenge::new("@key.ed25519", "sig")))
        .await
        .unwrap();
    let handle = bridge.start_polling().expect("poller should start");

    let envelopes = timeout(TEST_TIMEOUT, async {
        loop {
            let sent = bus.sent_to(COMM_SERVICE).await;
            if sent.len() >= 2 {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("envelopes were not published in time");
    handle.abort();

    let BusMessage::Envelope(first) = &envelopes[0] else {
        panic!("expected envelope, got {:?}", envelopes[0]);
    };
    assert_eq!(first.kind, EnvelopeKind::NotOwnerMessage);
    assert_eq!(first.from, "u1");
    assert_eq!(first.msg, "hi");
    assert_eq!(first.chan, "everlife-comm-fb-msg-svc");

    let BusMessage::Envelope(second) = &envelopes[1] else {
        panic!("expected envelope");
    };
    assert_eq!(second.from, "u2");
}

#[tokio::test]
async fn replies_reach_user_or_support_through_the_event_loop() {
    let (graph, fake_graph) = start_graph().await;
    let (bridge, bus) = build_bridge(None, &graph).await;

    let events = bus.subscribe("everlife-comm-fb-msg-svc").await.unwrap();
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(events).await })
    };

    // Answered: goes straight to the Send API.
    let answered = bus.deliver(BusEvent::Reply(ReplyRequest {
        ctx: Some("u2".into()),
        msg: "We open at nine".into(),
        addl: Some(ReplyAddl {
            kind: Some("not-owner-message".into()),
            ans: Some(json!("We open at nine")),
        }),
    }));
    // Unanswered: forwarded to support with the profile name.
    let unanswered = bus.deliver(BusEvent::Reply(ReplyRequest {
        ctx: Some("u1".into()),
        msg: "Can I talk to a human?".into(),
        addl: Some(ReplyAddl {
            kind: Some("not-owner-message".into()),
            ans: None,
        }),
    }));

    assert!(timeout(TEST_TIMEOUT, answered).await.unwrap().unwrap());
    assert!(timeout(TEST_TIMEOUT, unanswered).await.unwrap().unwrap());
    runner.abort();

    let sends = fake_graph.sends.lock().await.clone();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0.as_deref(), Some("page-token"));
    assert_eq!(
        sends[0].1,
        json!({"recipient": {"id": "u2"}, "message": {"text": "We open at nine"}})
    );

    let forwarded: Vec<_> = bus
        .sent_to(COMM_SERVICE)
        .await
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::Reply(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].chan.as_deref(), Some("everlife-comm-telegram-svc"));
    assert_eq!(
        forwarded[0].msg,
        "You got message from Ada Lovelace <u1>: Can I talk to a human?"
    );
}

#[tokio::test]
async fn support_switch_redirects_forwarding() {
    let (graph, _fake_graph) = start_graph().await;
    let (bridge, bus) = build_bridge(None, &graph).await;

    let events = bus.subscribe("everlife-comm-fb-msg-svc").await.unwrap();
    let runner = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run(events).await })
    };

    let switched = bus.deliver(BusEvent::Msg(messenger_bridge::bus::CommandRequest {
        msg: Some("/use_for_support qwert".into()),
        ..Default::default()
    }));
    assert!(timeout(TEST_TIMEOUT, switched).await.unwrap().unwrap());

    let forwarded = bus.deliver(BusEvent::Reply(ReplyRequest {
        ctx: Some("u7".into()),
        msg: "anyone there?".into(),
        addl: Some(ReplyAddl {
            kind: Some("not-owner-message".into()),
            ans: Some(json!(false)),
        }),
    }));
    assert!(timeout(TEST_TIMEOUT, forwarded).await.unwrap().unwrap());
    runner.abort();

    let last = bus.sent_to(COMM_SERVICE).await.pop().unwrap();
    let BusMessage::Reply(reply) = last else {
        panic!("expected reply");
    };
    assert_eq!(reply.chan.as_deref(), Some("everlife-comm-qwert-svc"));
    assert_eq!(reply.msg, "You got message from u7 <u7>: anyone there?");
}
