//! Local stand-in for the realtime service, used by unit tests.
//!
//! Listens on `127.0.0.1:0`, accepts any number of connections and plays a
//! [`Script`] on each: greeting, a possibly delayed reply to `session.update`, a burst of events,
//! and canned events for every `response.create`. Every client event is
//! recorded for assertions.

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct Script {
    pub greeting: Value,
    pub configure_reply: Value,
    /// Held before `configure_reply` is sent.
    pub configure_delay: Duration,
    pub after_configure: Vec<Value>,
    pub on_response_create: Vec<Value>,
    pub close_after_configure: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: json!({"type": "session.created", "session": {"id": "sess_test"}}),
            configure_reply: json!({"type": "session.updated", "session": {"id": "sess_test"}}),
            configure_delay: Duration::ZERO,
            after_configure: Vec::new(),
            on_response_create: Vec::new(),
            close_after_configure: false,
        }
    }
}

/// Delta events for each fragment followed by one done event.
pub fn audio_response(fragments: &[Vec<u8>]) -> Vec<Value> {
    let mut events: Vec<Value> = fragments
        .iter()
        .map(|f| json!({"type": "response.output_audio.delta", "delta": BASE64_STANDARD.encode(f)}))
        .collect();
    events.push(json!({"type": "response.output_audio.done"}));
    events
}

pub struct ScriptedService {
    port: u16,
    received: Arc<Mutex<Vec<Value>>>,
    authorization: Arc<Mutex<Option<String>>>,
    request_uri: Arc<Mutex<Option<String>>>,
}

impl ScriptedService {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let service = Self {
            port,
            received: Arc::new(Mutex::new(Vec::new())),
            authorization: Arc::new(Mutex::new(None)),
            request_uri: Arc::new(Mutex::new(None)),
        };

        let received = service.received.clone();
        let authorization = service.authorization.clone();
        let request_uri = service.request_uri.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let script = script.clone();
                let received = received.clone();
                let authorization = authorization.clone();
                let request_uri = request_uri.clone();

                tokio::spawn(async move {
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        *request_uri.lock().unwrap() = Some(req.uri().to_string());
                        *authorization.lock().unwrap() = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                        return;
                    };
                    let (mut tx, mut rx) = ws.split();

                    let send = |value: &Value| Message::Text(value.to_string());
                    if tx.send(send(&script.greeting)).await.is_err() {
                        return;
                    }

                    while let Some(Ok(message)) = rx.next().await {
                        let Message::Text(text) = message else { continue };
                        let Ok(event) = serde_json::from_str::<Value>(&text) else { continue };
                        let kind = event["type"].as_str().unwrap_or_default().to_string();
                        received.lock().unwrap().push(event);

                        match kind.as_str() {
                            "session.update" => {
                                tokio::time::sleep(script.configure_delay).await;
                                let _ = tx.send(send(&script.configure_reply)).await;
                                for value in &script.after_configure {
                                    let _ = tx.send(send(value)).await;
                                }
                                if script.close_after_configure {
                                    let _ = tx.close().await;
                                    return;
                                }
                            }
                            "response.create" => {
                                for value in &script.on_response_create {
                                    let _ = tx.send(send(value)).await;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        });

        service
    }

    pub fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}/v1/realtime", self.port)
    }

    pub fn authorization(&self) -> Option<String> {
        self.authorization.lock().unwrap().clone()
    }

    pub fn request_uri(&self) -> Option<String> {
        self.request_uri.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` client events have arrived.
    pub async fn wait_for_count(&self, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} client events, got {:?}", count, self.received());
    }

    /// Wait until at least one event of `kind` has arrived and return all of them.
    pub async fn received_of_type(&self, kind: &str) -> Vec<Value> {
        for _ in 0..200 {
            let matching: Vec<Value> = self
                .received()
                .into_iter()
                .filter(|v| v["type"] == kind)
                .collect();
            if !matching.is_empty() {
                return matching;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no {} event received", kind);
    }
}
