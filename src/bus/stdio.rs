//! JSON-lines bus over stdin/stdout.
//!
//! Every request is written as one line, `{"id": n, "service": "...",
//! "message": {...}}`, and waits for the peer to answer with
//! `{"id": n, "response": ...}` or `{"id": n, "error": "..."}`.
//!
//! Any other input line carrying a `type` is an event for the bridge,
//! optionally with an `id`. Once the event has been processed the bridge
//! writes `{"id": ..., "ack": true|false}`, echoing the event id when there
//! was one.
//!
//! Input is read from the moment the bus is created, so requests made
//! before `subscribe` (registration, the auth challenge) still get their
//! responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};

use super::{BusEvent, BusEventStream, BusMessage, IncomingEvent, MessageBus};
use crate::error::BusError;

/// How long a request waits for the peer's response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>;

struct Shared {
    writer: Mutex<Writer>,
    pending: Pending,
}

pub struct StdioBus {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    events: Mutex<Option<mpsc::UnboundedReceiver<IncomingEvent>>>,
    response_timeout: Duration,
}

impl Default for StdioBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioBus {
    /// Bus on the process's stdin/stdout. Must be called inside a runtime.
    pub fn new() -> Self {
        Self::from_io(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }

    /// Bus over arbitrary line-oriented handles. Starts reading immediately.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, Arc::clone(&shared), events_tx));

        Self {
            shared,
            next_id: AtomicU64::new(0),
            events: Mutex::new(Some(events_rx)),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// One parsed input line.
#[derive(Debug, PartialEq)]
enum InboundLine {
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    Event {
        id: Option<Value>,
        event: BusEvent,
    },
}

fn parse_line(line: &str) -> Result<InboundLine, String> {
    let mut value: Value = serde_json::from_str(line).map_err(|e| format!("not JSON: {e}"))?;
    let Some(fields) = value.as_object_mut() else {
        return Err("expected a JSON object".into());
    };
    let id = fields.remove("id");

    if !fields.contains_key("type") {
        let id = id
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or("response without a numeric id")?;
        let result = match (fields.remove("error"), fields.remove("response")) {
            (Some(Value::String(reason)), _) => Err(reason),
            (Some(other), _) => Err(other.to_string()),
            (None, response) => Ok(response.unwrap_or(Value::Null)),
        };
        return Ok(InboundLine::Response { id, result });
    }

    let event = serde_json::from_value(value).map_err(|e| format!("unknown event: {e}"))?;
    Ok(InboundLine::Event { id, event })
}

async fn write_line(writer: &Mutex<Writer>, value: &Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    let mut out = writer.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

async fn read_loop<R>(
    reader: R,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<IncomingEvent>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Ok(InboundLine::Response { id, result }) => {
                        match shared.pending.lock().await.remove(&id) {
                            Some(waiter) => {
                                let _ = waiter.send(result);
                            }
                            None => tracing::debug!(id, "Response for unknown request"),
                        }
                    }
                    Ok(InboundLine::Event { id, event }) => {
                        let (ack_tx, ack_rx) = oneshot::channel::<bool>();
                        tokio::spawn(write_ack(Arc::clone(&shared), id, ack_rx));
                        // Keep reading after the subscriber is gone so
                        // responses still reach pending requests.
                        let _ = events.send(IncomingEvent::with_ack(event, ack_tx));
                    }
                    Err(e) => tracing::warn!("Ignoring bus input line: {e}"),
                }
            }
            Ok(None) => {
                tracing::info!("Bus input closed");
                break;
            }
            Err(e) => {
                tracing::error!("Error reading bus input: {}", e);
                break;
            }
        }
    }
    // Dropping the waiters fails their requests.
    shared.pending.lock().await.clear();
}

async fn write_ack(shared: Arc<Shared>, id: Option<Value>, ack: oneshot::Receiver<bool>) {
    let Ok(handled) = ack.await else {
        return;
    };
    let mut line = serde_json::json!({ "ack": handled });
    if let Some(id) = id {
        line["id"] = id;
    }
    if let Err(e) = write_line(&shared.writer, &line).await {
        tracing::warn!("Failed to write ack: {e}");
    }
}

#[async_trait]
impl MessageBus for StdioBus {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn send(&self, service: &str, message: BusMessage) -> Result<Value, BusError> {
        let failed = |reason: String| BusError::SendFailed {
            service: service.to_string(),
            reason,
        };

        let message = serde_json::to_value(&message)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let line = serde_json::json!({ "id": id, "service": service, "message": message });
        if let Err(e) = write_line(&self.shared.writer, &line).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(failed(e.to_string()));
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(failed(reason)),
            Ok(Err(_)) => Err(failed("bus input closed".into())),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(failed(format!(
                    "no response within {}s",
                    self.response_timeout.as_secs_f32()
                )))
            }
        }
    }

    async fn subscribe(&self, key: &str) -> Result<BusEventStream, BusError> {
        let rx = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| BusError::SubscribeFailed {
                key: key.to_string(),
                reason: "stdio bus already has a subscriber".into(),
            })?;
        tracing::info!(key, "Reading bus events from stdin");

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthChallenge;
    use crate::bus::{CommandRequest, ReplyRequest, SSB_SERVICE};
    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    /// The other end of the bus: reads what the bridge writes, writes what
    /// the bridge reads.
    struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn read_json(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn write(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }
    }

    fn connect() -> (Arc<StdioBus>, Peer) {
        let (ours, theirs) = tokio::io::duplex(8192);
        let (reader, writer) = tokio::io::split(ours);
        let bus = Arc::new(StdioBus::from_io(BufReader::new(reader), writer));

        let (reader, writer) = tokio::io::split(theirs);
        let peer = Peer {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        (bus, peer)
    }

    #[test]
    fn parse_line_distinguishes_responses_and_events() {
        assert_eq!(
            parse_line(r#"{"id": 3, "response": {"ok": true}}"#),
            Ok(InboundLine::Response {
                id: 3,
                result: Ok(json!({"ok": true}))
            })
        );
        assert_eq!(
            parse_line(r#"{"id": 4, "error": "denied"}"#),
            Ok(InboundLine::Response {
                id: 4,
                result: Err("denied".into())
            })
        );
        assert_eq!(
            parse_line(r#"{"id": 5}"#),
            Ok(InboundLine::Response {
                id: 5,
                result: Ok(Value::Null)
            })
        );
        assert_eq!(
            parse_line(r#"{"id": "e1", "type": "msg", "msg": "/tell"}"#),
            Ok(InboundLine::Event {
                id: Some(json!("e1")),
                event: BusEvent::Msg(CommandRequest {
                    msg: Some("/tell".into()),
                    ..Default::default()
                }),
            })
        );
    }

    #[test]
    fn parse_line_rejects_garbage() {
        assert!(parse_line("hello").is_err());
        assert!(parse_line("[1, 2]").is_err());
        assert!(parse_line(r#"{"response": 1}"#).is_err());
        assert!(parse_line(r#"{"type": "unknown"}"#).is_err());
    }

    #[tokio::test]
    async fn request_writes_envelope_and_gets_response() {
        let (bus, mut peer) = connect();

        let request = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { AuthChallenge::request(bus.as_ref()).await })
        };

        let line = peer.read_json().await;
        assert_eq!(
            line,
            json!({
                "id": 0,
                "service": SSB_SERVICE,
                "message": {"type": "everlife-service-auth"},
            })
        );
        peer.write(r#"{"id": 0, "response": {"key": "@k.ed25519", "signed": "sig"}}"#)
            .await;

        let challenge = request.await.unwrap().unwrap();
        assert_eq!(challenge.key, "@k.ed25519");
        assert_eq!(challenge.signed(), "sig");
    }

    #[tokio::test]
    async fn responses_are_matched_by_id() {
        let (bus, mut peer) = connect();

        let first = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.send("a", BusMessage::service_auth()).await })
        };
        assert_eq!(peer.read_json().await["id"], 0);
        let second = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.send("b", BusMessage::service_auth()).await })
        };
        assert_eq!(peer.read_json().await["id"], 1);

        peer.write(r#"{"id": 1, "response": "second"}"#).await;
        peer.write(r#"{"id": 0, "error": "first failed"}"#).await;

        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        let err = first.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("first failed"));
    }

    #[tokio::test]
    async fn request_times_out_without_response() {
        let (ours, _theirs) = tokio::io::duplex(8192);
        let (reader, writer) = tokio::io::split(ours);
        let bus = StdioBus::from_io(BufReader::new(reader), writer)
            .with_response_timeout(Duration::from_millis(50));

        let err = bus
            .send("svc", BusMessage::service_auth())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SendFailed { .. }));
        assert!(bus.shared.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn closed_input_fails_pending_request() {
        let (bus, mut peer) = connect();

        let request = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.send("svc", BusMessage::service_auth()).await })
        };
        peer.read_json().await;
        drop(peer);

        let err = request.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn events_are_parsed_and_acked_with_their_id() {
        let (bus, mut peer) = connect();
        let mut events = bus.subscribe("bot").await.unwrap();

        peer.write("not json").await;
        peer.write(r#"{"id": "e1", "type": "msg", "msg": "/fbwebhookinfo", "chan": "tg"}"#)
            .await;
        peer.write(r#"{"id": 9, "type": "reply", "ctx": "u1", "msg": "hi"}"#)
            .await;

        let mut msg = events.next().await.unwrap();
        assert_eq!(
            msg.event,
            BusEvent::Msg(CommandRequest {
                msg: Some("/fbwebhookinfo".into()),
                chan: Some("tg".into()),
                ctx: None,
            })
        );
        msg.acknowledge(false);
        assert_eq!(peer.read_json().await, json!({"id": "e1", "ack": false}));

        let mut reply = events.next().await.unwrap();
        assert_eq!(
            reply.event,
            BusEvent::Reply(ReplyRequest {
                ctx: Some("u1".into()),
                msg: "hi".into(),
                addl: None,
            })
        );
        reply.acknowledge(true);
        assert_eq!(peer.read_json().await, json!({"id": 9, "ack": true}));
    }

    #[tokio::test]
    async fn event_without_id_gets_bare_ack() {
        let (bus, mut peer) = connect();
        let mut events = bus.subscribe("bot").await.unwrap();

        peer.write(r#"{"type": "msg", "msg": "hello"}"#).await;
        let mut incoming = events.next().await.unwrap();
        incoming.acknowledge(true);

        assert_eq!(peer.read_json().await, json!({"ack": true}));
    }

    #[tokio::test]
    async fn events_before_subscribe_are_buffered() {
        let (bus, mut peer) = connect();
        peer.write(r#"{"type": "msg", "msg": "early"}"#).await;

        let mut events = bus.subscribe("bot").await.unwrap();
        let incoming = events.next().await.unwrap();
        assert!(matches!(
            incoming.event,
            BusEvent::Msg(CommandRequest { msg: Some(ref m), .. }) if m == "early"
        ));
        assert!(bus.subscribe("bot").await.is_err());
    }

    #[tokio::test]
    async fn stream_ends_when_input_closes() {
        let (bus, peer) = connect();
        let mut events = bus.subscribe("bot").await.unwrap();
        drop(peer);
        assert!(events.next().await.is_none());
    }
}
