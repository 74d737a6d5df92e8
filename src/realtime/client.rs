//! # Session Client
//!
//! Owns one persistent WebSocket to the realtime service and walks it through
//! the protocol state machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──configure──▶ Configured ──listen──▶ Streaming
//!       │                       │                         │                    │
//!       └───────────────────────┴────────disconnect───────┴────────────────────┴──▶ Closed
//! ```
//!
//! A streaming session that loses its socket also moves to `Closed`.
//!
//! ## Concurrency:
//! The socket is split once connected. The write half sits behind a
//! `tokio::sync::Mutex` so the uplink task and `say` can both send; the read
//! half is only ever used by `connect`, `configure` and then the listen task.
//!
//! ## Failure Model:
//! - Handshake or configuration problems are returned to the caller, never retried
//! - Error events and bad fragments while streaming are logged and skipped
//! - A closed or broken socket ends `listen` with an error

use crate::config::RealtimeProfile;
use crate::error::VoiceError;
use crate::realtime::assembler::ResponseAssembler;
use crate::realtime::messages::{event_type, ClientEvent, ServerEvent};
use crate::voice::GuildId;
use base64::prelude::*;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Where the remote session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Disconnected,
    Connected,
    Configured,
    Streaming,
    Closed,
}

impl ProtocolState {
    /// Audio and text may only be sent once the session is configured.
    pub fn accepts_input(self) -> bool {
        matches!(self, ProtocolState::Configured | ProtocolState::Streaming)
    }
}

pub struct SessionClient {
    guild: GuildId,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    handshake_timeout: Duration,
    state: Mutex<ProtocolState>,
    running: AtomicBool,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    reader: tokio::sync::Mutex<Option<WsReader>>,
}

impl SessionClient {
    pub fn new(guild: GuildId, profile: &RealtimeProfile, handshake_timeout: Duration) -> Self {
        Self {
            guild,
            endpoint: profile.endpoint.clone(),
            model: profile.model.clone(),
            api_key: profile.api_key.clone(),
            handshake_timeout,
            state: Mutex::new(ProtocolState::Disconnected),
            running: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProtocolState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ProtocolState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Endpoint with the model in the query string.
    pub fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.endpoint, separator, self.model)
    }

    /// Open the socket and wait for `session.created`.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let current = self.state();
        if current != ProtocolState::Disconnected {
            return Err(VoiceError::InvalidState(format!("connect called in state {:?}", current)));
        }

        let api_key = match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => key,
            _ => {
                error!(guild_id = %self.guild, "No API key configured for realtime session");
                return Err(VoiceError::MissingCredential(self.guild));
            }
        };

        let url = self.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::ConnectionFailed(format!("Invalid endpoint {}: {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| VoiceError::ConnectionFailed(format!("Invalid API key header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| VoiceError::Timeout("realtime connection"))?
            .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?;

        let (writer, mut reader) = stream.split();

        let first = timeout(self.handshake_timeout, next_text(&mut reader))
            .await
            .map_err(|_| VoiceError::Timeout("session.created"))??;
        let Some(first) = first else {
            return Err(VoiceError::ConnectionFailed(
                "Connection closed before session.created".to_string(),
            ));
        };

        if !matches!(ServerEvent::parse(&first), Ok(ServerEvent::SessionCreated)) {
            return Err(VoiceError::HandshakeRejected(event_type(&first)));
        }

        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        self.running.store(true, Ordering::Release);
        self.set_state(ProtocolState::Connected);

        info!(guild_id = %self.guild, model = %self.model, "Realtime session created");
        Ok(())
    }

    /// Send `session.update` and wait for `session.updated`.
    pub async fn configure(&self, instructions: &str, voice: &str, model: &str) -> Result<(), VoiceError> {
        let current = self.state();
        if current != ProtocolState::Connected {
            return Err(VoiceError::InvalidState(format!("configure called in state {:?}", current)));
        }

        info!(guild_id = %self.guild, model = %model, voice = %voice, "Configuring realtime session");
        debug!(guild_id = %self.guild, instructions = %instructions, "Session instructions");

        self.send_event(&ClientEvent::session_update(model, voice, instructions)).await?;

        let reply = {
            let mut reader = self.reader.lock().await;
            let reader = reader
                .as_mut()
                .ok_or_else(|| VoiceError::InvalidState("no open connection".to_string()))?;
            timeout(self.handshake_timeout, next_text(reader))
                .await
                .map_err(|_| VoiceError::Timeout("session.updated"))??
        };

        let Some(reply) = reply else {
            return Err(VoiceError::ConfigurationRejected("connection closed".to_string()));
        };

        if !matches!(ServerEvent::parse(&reply), Ok(ServerEvent::SessionUpdated)) {
            warn!(guild_id = %self.guild, reply = %reply, "Unexpected reply to session.update");
            return Err(VoiceError::ConfigurationRejected(event_type(&reply)));
        }

        self.set_state(ProtocolState::Configured);
        info!(guild_id = %self.guild, "Realtime session configured");
        Ok(())
    }

    /// Append captured audio to the service's input buffer.
    ///
    /// Returns `false` without sending when the session is not configured yet
    /// or the buffer is empty.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<bool, VoiceError> {
        if pcm.is_empty() || !self.state().accepts_input() {
            return Ok(false);
        }

        let event = ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(pcm),
        };
        self.send_event(&event).await?;
        Ok(true)
    }

    /// Add a user text turn and ask for a spoken response.
    pub async fn send_text(&self, text: &str) -> Result<(), VoiceError> {
        let current = self.state();
        if !current.accepts_input() {
            return Err(VoiceError::InvalidState(format!("send_text called in state {:?}", current)));
        }

        self.send_event(&ClientEvent::user_text(text)).await?;
        info!(guild_id = %self.guild, "Sent text message");

        self.send_event(&ClientEvent::ResponseCreate).await?;
        info!(guild_id = %self.guild, "Triggered response from assistant");
        Ok(())
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<(), VoiceError> {
        let payload = serde_json::to_string(event)?;
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| VoiceError::InvalidState("no open connection".to_string()))?;
        writer.send(Message::Text(payload)).await?;
        Ok(())
    }

    /// Receive events until cancelled or the connection fails.
    ///
    /// Each receive waits at most `recv_timeout` so cancellation and
    /// `disconnect` are noticed promptly. Returns `Ok` on cancellation and
    /// `Err` when the connection is lost while still running.
    pub async fn listen(
        &self,
        assembler: &mut ResponseAssembler,
        cancel: &CancellationToken,
        recv_timeout: Duration,
    ) -> Result<(), VoiceError> {
        let mut reader = self.reader.lock().await;
        let reader = reader
            .as_mut()
            .ok_or_else(|| VoiceError::InvalidState("no open connection".to_string()))?;

        match self.state() {
            ProtocolState::Configured => self.set_state(ProtocolState::Streaming),
            ProtocolState::Streaming => {}
            other => {
                return Err(VoiceError::InvalidState(format!("listen called in state {:?}", other)));
            }
        }

        info!(guild_id = %self.guild, "Listening for realtime events");

        loop {
            if !self.is_running() {
                return Ok(());
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = timeout(recv_timeout, reader.next()) => received,
            };

            let message = match received {
                Err(_) => continue,
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => return self.connection_lost(e.to_string()),
                Ok(None) => return self.connection_lost("stream ended".to_string()),
            };

            match message {
                Message::Text(text) => self.handle_event(&text, assembler),
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_event(text, assembler),
                    Err(_) => trace!(guild_id = %self.guild, len = bytes.len(), "Ignoring binary frame"),
                },
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "no reason".to_string());
                    return self.connection_lost(format!("closed by service: {}", reason));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    fn connection_lost(&self, reason: String) -> Result<(), VoiceError> {
        if !self.is_running() {
            debug!(guild_id = %self.guild, reason = %reason, "Connection ended during shutdown");
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        self.set_state(ProtocolState::Closed);
        error!(guild_id = %self.guild, reason = %reason, "Realtime connection lost");
        Err(VoiceError::Protocol(reason))
    }

    fn handle_event(&self, text: &str, assembler: &mut ResponseAssembler) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(guild_id = %self.guild, event_type = %event_type(text), error = %e, "Unparseable realtime event");
                return;
            }
        };

        match event {
            ServerEvent::AudioDelta { delta } => {
                match assembler.push_delta(&delta) {
                    Ok(()) => trace!(guild_id = %self.guild, pending_bytes = assembler.pending_bytes(), "Audio fragment buffered"),
                    Err(e) => warn!(guild_id = %self.guild, error = %e, "Dropping audio fragment"),
                }
            }
            ServerEvent::AudioDone => {
                let bytes = assembler.finish();
                info!(guild_id = %self.guild, bytes, "Audio response complete");
            }
            ServerEvent::TranscriptDelta { delta } => {
                debug!(guild_id = %self.guild, transcript = %delta, "Transcript");
            }
            ServerEvent::TranscriptDone => debug!(guild_id = %self.guild, "Transcript complete"),
            ServerEvent::SpeechStarted => info!(guild_id = %self.guild, "User started speaking"),
            ServerEvent::SpeechStopped => info!(guild_id = %self.guild, "User stopped speaking"),
            ServerEvent::SessionUpdated => info!(guild_id = %self.guild, "Session updated"),
            ServerEvent::SessionCreated => debug!(guild_id = %self.guild, "Duplicate session.created ignored"),
            ServerEvent::Error { error } => {
                error!(guild_id = %self.guild, error = %error, "Realtime service reported an error");
            }
            ServerEvent::Other => trace!(guild_id = %self.guild, event_type = %event_type(text), "Unhandled event"),
        }
    }

    /// Close the connection. Safe to call any number of times.
    ///
    /// A lost connection reads `Closed` but still holds its write half,
    /// which is released here.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::Release);
        self.set_state(ProtocolState::Closed);

        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        if let Err(e) = writer.close().await {
            debug!(guild_id = %self.guild, error = %e, "Error closing realtime connection");
        }
        // The listen task may still hold the reader; it exits on its own
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        info!(guild_id = %self.guild, "Realtime session disconnected");
    }
}

/// Next text payload, skipping control frames. `None` once the peer closes.
async fn next_text(reader: &mut WsReader) -> Result<Option<String>, VoiceError> {
    while let Some(message) = reader.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text)),
            Message::Binary(bytes) => {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::{PlaybackItem, Utterance};
    use crate::realtime::testing::{audio_response, Script, ScriptedService};
    use crate::session::stats::ConversationStats;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn profile(endpoint: &str, api_key: Option<&str>) -> RealtimeProfile {
        RealtimeProfile {
            endpoint: endpoint.to_string(),
            model: "test-model".to_string(),
            voice: "alloy".to_string(),
            api_key: api_key.map(str::to_string),
            instructions: "Be brief.".to_string(),
        }
    }

    fn client(service: &ScriptedService) -> SessionClient {
        SessionClient::new(GuildId(1), &profile(&service.endpoint(), Some("sk-test")), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_connecting() {
        let client = SessionClient::new(GuildId(3), &profile("ws://127.0.0.1:9/v1", None), Duration::from_secs(1));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, VoiceError::MissingCredential(GuildId(3))));
        assert_eq!(client.state(), ProtocolState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_and_configure() {
        let service = ScriptedService::start(Script::default()).await;
        let client = client(&service);

        client.connect().await.unwrap();
        assert_eq!(client.state(), ProtocolState::Connected);

        // Audio before configuration is a no-op
        assert!(!client.send_audio(&[1, 2]).await.unwrap());

        client.configure("Be brief.", "alloy", "test-model").await.unwrap();
        assert_eq!(client.state(), ProtocolState::Configured);

        assert_eq!(service.authorization().as_deref(), Some("Bearer sk-test"));
        assert!(service.request_uri().unwrap().ends_with("?model=test-model"));

        let update = service.received_of_type("session.update").await.remove(0);
        assert_eq!(update["session"]["audio"]["output"]["voice"], "alloy");
        assert_eq!(update["session"]["instructions"], "Be brief.");

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ProtocolState::Closed);
    }

    #[tokio::test]
    async fn test_wrong_greeting_is_rejected() {
        let service = ScriptedService::start(Script {
            greeting: json!({"type": "error", "error": {"message": "nope"}}),
            ..Script::default()
        })
        .await;

        let err = client(&service).connect().await.unwrap_err();
        assert!(matches!(err, VoiceError::HandshakeRejected(ref kind) if kind == "error"));
    }

    #[tokio::test]
    async fn test_wrong_configure_reply_is_rejected() {
        let service = ScriptedService::start(Script {
            configure_reply: json!({"type": "error", "error": {}}),
            ..Script::default()
        })
        .await;

        let client = client(&service);
        client.connect().await.unwrap();
        let err = client.configure("x", "alloy", "test-model").await.unwrap_err();
        assert!(matches!(err, VoiceError::ConfigurationRejected(_)));
        assert_eq!(client.state(), ProtocolState::Connected);
    }

    #[tokio::test]
    async fn test_audio_is_base64_encoded() {
        let service = ScriptedService::start(Script::default()).await;
        let client = client(&service);
        client.connect().await.unwrap();
        client.configure("x", "alloy", "test-model").await.unwrap();

        assert!(client.send_audio(&[1, 2, 3]).await.unwrap());
        let appends = service.received_of_type("input_audio_buffer.append").await;
        assert_eq!(appends[0]["audio"], BASE64_STANDARD.encode([1u8, 2, 3]));
    }

    #[tokio::test]
    async fn test_listen_assembles_responses_and_survives_errors() {
        let mut events = vec![json!({"type": "error", "error": {"message": "transient"}})];
        events.push(json!({"type": "response.output_audio.delta", "delta": "!!!"}));
        events.extend(audio_response(&[vec![1, 2], vec![3]]));
        events.extend(audio_response(&[]));
        events.extend(audio_response(&[vec![4]]));

        let service = ScriptedService::start(Script {
            after_configure: events,
            ..Script::default()
        })
        .await;
        let client = Arc::new(client(&service));
        client.connect().await.unwrap();
        client.configure("x", "alloy", "test-model").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stats = Arc::new(ConversationStats::default());
        let cancel = CancellationToken::new();

        let listener = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut assembler = ResponseAssembler::new(tx, stats);
                client.listen(&mut assembler, &cancel, Duration::from_millis(20)).await
            })
        };

        let mut items = Vec::new();
        while items.len() < 5 {
            let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            items.push(item);
        }
        assert_eq!(client.state(), ProtocolState::Streaming);
        assert_eq!(
            items,
            vec![
                PlaybackItem::Utterance(Utterance { sequence: 1, pcm: vec![1, 2, 3] }),
                PlaybackItem::EndOfResponse,
                PlaybackItem::EndOfResponse,
                PlaybackItem::Utterance(Utterance { sequence: 2, pcm: vec![4] }),
                PlaybackItem::EndOfResponse,
            ]
        );

        cancel.cancel();
        assert!(listener.await.unwrap().is_ok());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_listen_fails_when_service_closes() {
        let service = ScriptedService::start(Script {
            close_after_configure: true,
            ..Script::default()
        })
        .await;
        let client = client(&service);
        client.connect().await.unwrap();
        client.configure("x", "alloy", "test-model").await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut assembler = ResponseAssembler::new(tx, Arc::new(ConversationStats::default()));
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.listen(&mut assembler, &CancellationToken::new(), Duration::from_millis(20)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(VoiceError::Protocol(_))));
        assert_eq!(client.state(), ProtocolState::Closed);
        assert!(!client.is_running());
        assert!(matches!(client.send_text("hello?").await, Err(VoiceError::InvalidState(_))));
        assert!(!client.send_audio(&[0u8; 4]).await.unwrap());

        client.disconnect().await;
        assert!(matches!(
            client.send_event(&ClientEvent::ResponseCreate).await,
            Err(VoiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_send_text_emits_item_then_response() {
        let service = ScriptedService::start(Script::default()).await;
        let client = client(&service);
        assert!(matches!(client.send_text("hi").await, Err(VoiceError::InvalidState(_))));

        client.connect().await.unwrap();
        client.configure("x", "alloy", "test-model").await.unwrap();
        client.send_text("hello there").await.unwrap();

        let kinds: Vec<String> = service
            .wait_for_count(3)
            .await
            .iter()
            .map(|v| v["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kinds, vec!["session.update", "conversation.item.create", "response.create"]);
    }
}
