use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use lib::host::HostError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, HostError>>>>>;

/// A DevTools protocol command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: &'static str,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Request {
    /// A command addressed to the browser itself.
    pub fn browser(method: &'static str, params: Value) -> Self {
        Request {
            method,
            params,
            session_id: None,
        }
    }

    /// A command addressed to an attached page.
    pub fn page(session: &str, method: &'static str, params: Value) -> Self {
        Request {
            method,
            params,
            session_id: Some(session.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: &'a Request,
}

#[derive(Debug, Deserialize)]
struct Failure {
    code: i64,
    message: String,
}

/// Anything the browser sends over the socket.
#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<Failure>,
    method: Option<String>,
}

impl Incoming {
    fn into_result(self) -> Result<Value, HostError> {
        match (self.error, self.result) {
            (Some(f), _) => Err(HostError::Protocol(format!("{} ({})", f.message, f.code))),
            (None, r) => Ok(r.unwrap_or(Value::Null)),
        }
    }
}

/// Sends DevTools protocol commands and waits for their results.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: Request) -> Result<Value, HostError>;
}

/// A DevTools protocol connection over a WebSocket.
pub struct Connection {
    sink: Mutex<SplitSink<Socket, Message>>,
    pending: Pending,
    next: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects to the DevTools endpoint at `url`.
    #[instrument(level = "debug", err)]
    pub async fn connect(url: &str) -> Result<Self, HostError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| HostError::Unavailable(e.to_string()))?;

        let (sink, mut stream) = socket.split();
        let pending = Pending::default();

        let reader = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => route(&pending, &text),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "devtools connection failed");
                            break;
                        }
                    }
                }

                debug!("devtools connection closed");

                // Dropping the senders fails every request still in flight.
                if let Ok(mut pending) = pending.lock() {
                    pending.clear();
                }
            }
        });

        Ok(Connection {
            sink: Mutex::new(sink),
            pending,
            next: AtomicU64::new(1),
            reader,
        })
    }
}

fn route(pending: &Pending, text: &str) {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "malformed devtools message");
            return;
        }
    };

    match incoming.id {
        None => trace!(method = ?incoming.method, "ignoring event"),
        Some(id) => {
            let tx = pending.lock().ok().and_then(|mut p| p.remove(&id));
            match tx {
                Some(tx) => drop(tx.send(incoming.into_result())),
                None => warn!(id, "unsolicited devtools response"),
            }
        }
    }
}

#[async_trait]
impl Transport for Connection {
    #[instrument(level = "trace", skip(self, request), fields(method = request.method), err)]
    async fn request(&self, request: Request) -> Result<Value, HostError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&Envelope {
            id,
            request: &request,
        })?;

        let (_inflight, rx) = Inflight::register(&self.pending, id)?;

        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| HostError::Unavailable(e.to_string()))?;

        rx.await
            .map_err(|_| HostError::Unavailable("devtools connection closed".into()))?
    }
}

/// A request awaiting its response.
///
/// The request is forgotten once dropped, answered or not.
struct Inflight {
    pending: Pending,
    id: u64,
}

impl Inflight {
    fn register(
        pending: &Pending,
        id: u64,
    ) -> Result<(Self, oneshot::Receiver<Result<Value, HostError>>), HostError> {
        let (tx, rx) = oneshot::channel();

        pending
            .lock()
            .map_err(|_| HostError::Unavailable("devtools connection poisoned".into()))?
            .insert(id, tx);

        let inflight = Inflight {
            pending: pending.clone(),
            id,
        };

        Ok((inflight, rx))
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_strategy::proptest;

    #[proptest]
    fn browser_requests_carry_no_session(id: u64, m: String) {
        let request = Request::browser("Target.createTarget", json!({ "url": m }));

        assert_eq!(
            serde_json::to_value(Envelope {
                id,
                request: &request
            })?,
            json!({ "id": id, "method": "Target.createTarget", "params": { "url": m } })
        );
    }

    #[proptest]
    fn page_requests_carry_the_session(id: u64, s: String) {
        let request = Request::page(&s, "Page.enable", json!({}));

        assert_eq!(
            serde_json::to_value(Envelope {
                id,
                request: &request
            })?,
            json!({ "id": id, "method": "Page.enable", "params": {}, "sessionId": s })
        );
    }

    #[proptest]
    fn responses_are_routed_by_id(id: u64, v: String) {
        let pending = Pending::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);

        route(&pending, &json!({ "id": id, "result": { "v": v } }).to_string());

        assert_eq!(rx.try_recv()?.ok(), Some(json!({ "v": v })));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[proptest]
    fn errors_are_protocol_failures(id: u64, code: i64, msg: String) {
        let pending = Pending::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);

        let error = json!({ "id": id, "error": { "code": code, "message": msg } });
        route(&pending, &error.to_string());

        assert!(matches!(rx.try_recv()?, Err(HostError::Protocol(m)) if m.contains(&msg)));
    }

    #[proptest]
    fn events_are_ignored(id: u64) {
        let pending = Pending::default();
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);

        route(&pending, r#"{"method":"Page.loadEventFired","params":{}}"#);
        route(&pending, "not json");

        assert!(rx.try_recv().is_err());
        assert_eq!(pending.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_results_are_null() -> Result<(), serde_json::Error> {
        let incoming: Incoming = serde_json::from_str(r#"{"id":1}"#)?;
        assert!(matches!(incoming.into_result(), Ok(Value::Null)));
        Ok(())
    }

    #[proptest]
    fn abandoned_requests_are_forgotten(id: u64) {
        let pending = Pending::default();
        let (inflight, _rx) = Inflight::register(&pending, id)?;
        assert_eq!(pending.lock().unwrap().len(), 1);

        drop(inflight);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[proptest]
    fn inflight_requests_are_answered(id: u64, v: String) {
        let pending = Pending::default();
        let (inflight, mut rx) = Inflight::register(&pending, id)?;

        route(&pending, &json!({ "id": id, "result": v }).to_string());
        drop(inflight);

        assert_eq!(rx.try_recv()?.ok(), Some(json!(v)));
        assert!(pending.lock().unwrap().is_empty());
    }
}
