//! # Session Controller
//!
//! Owns every guild's [`GuildSession`] and is the only thing that mutates
//! them. Each guild's session sits behind its own async mutex, so a slow
//! handshake in one guild never blocks another.
//!
//! ## Runtime:
//! All operations run on the pipeline runtime handed to [`SessionController::new`].
//! The WebSocket, the three conversation tasks and their timers therefore
//! live on one multi-threaded runtime no matter which thread the caller is on.

use crate::audio::capture::CaptureSink;
use crate::audio::playback::run_playback;
use crate::config::{GuildConfigProvider, RealtimeProfile};
use crate::error::VoiceError;
use crate::realtime::{ResponseAssembler, SessionClient};
use crate::session::state::{
    build_instructions, ActiveConversation, ConversationRequest, GuildSession, SessionSummary,
};
use crate::session::stats::ConversationStats;
use crate::session::PipelineTimings;
use crate::voice::{ChannelId, GuildId, VoiceConnector, VoiceHandle};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SessionMap = HashMap<GuildId, Arc<AsyncMutex<GuildSession>>>;

/// Per-guild lifecycle owner. Cheap to clone.
#[derive(Clone)]
pub struct SessionController {
    runtime: Handle,
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    connector: Arc<dyn VoiceConnector>,
    config: Arc<dyn GuildConfigProvider>,
    sessions: Mutex<SessionMap>,
}

impl SessionController {
    pub fn new(
        runtime: Handle,
        connector: Arc<dyn VoiceConnector>,
        config: Arc<dyn GuildConfigProvider>,
    ) -> Self {
        Self {
            runtime,
            inner: Arc::new(ControllerInner {
                connector,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, VoiceError>
    where
        F: Future<Output = Result<T, VoiceError>> + Send + 'static,
        T: Send + 'static,
    {
        self.runtime
            .spawn(op)
            .await
            .map_err(|e| VoiceError::Transport(format!("Session operation failed: {}", e)))?
    }

    /// Connect to a voice channel and create the guild's session.
    pub async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<SessionSummary, VoiceError> {
        let inner = self.inner.clone();
        self.run(async move { inner.join(guild, channel).await }).await
    }

    /// Connect the realtime service and start the listen, playback and uplink tasks.
    pub async fn start_conversation(
        &self,
        guild: GuildId,
        request: ConversationRequest,
    ) -> Result<SessionSummary, VoiceError> {
        let inner = self.inner.clone();
        self.run(async move { inner.start_conversation(guild, request).await }).await
    }

    /// Stop the conversation but stay in the voice channel.
    pub async fn stop_conversation(&self, guild: GuildId) -> Result<SessionSummary, VoiceError> {
        let inner = self.inner.clone();
        self.run(async move { inner.stop_conversation(guild).await }).await
    }

    /// Stop everything and leave the voice channel.
    pub async fn leave(&self, guild: GuildId) -> Result<(), VoiceError> {
        let inner = self.inner.clone();
        self.run(async move { inner.leave(guild).await }).await
    }

    /// Inject a user text turn into the running conversation.
    pub async fn say(&self, guild: GuildId, text: String) -> Result<(), VoiceError> {
        let inner = self.inner.clone();
        self.run(async move { inner.say(guild, &text).await }).await
    }

    pub async fn session(&self, guild: GuildId) -> Result<SessionSummary, VoiceError> {
        let session = self.inner.lock_entry(guild).await?;
        Ok(session.summary())
    }

    /// Snapshot of every session, ordered by guild.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let mut entries: Vec<(GuildId, Arc<AsyncMutex<GuildSession>>)> = self
            .inner
            .lock_sessions()
            .iter()
            .map(|(guild, entry)| (*guild, entry.clone()))
            .collect();
        entries.sort_by_key(|(guild, _)| *guild);

        let mut summaries = Vec::with_capacity(entries.len());
        for (guild, entry) in entries {
            let session = entry.lock().await;
            if self.inner.is_current(guild, &entry) {
                summaries.push(session.summary());
            }
        }
        summaries
    }

    /// Best-effort `leave` for every guild. Individual failures are logged.
    pub async fn teardown_all(&self) {
        let inner = self.inner.clone();
        let result = self
            .run(async move {
                let guilds: Vec<GuildId> = inner.lock_sessions().keys().copied().collect();
                info!(count = guilds.len(), "Tearing down all voice sessions");
                for guild in guilds {
                    if let Err(e) = inner.leave(guild).await {
                        warn!(guild_id = %guild, error = %e, "Failed to leave guild during teardown");
                    }
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            error!(error = %e, "Session teardown did not complete");
        }
    }
}

impl ControllerInner {
    fn lock_sessions(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, guild: GuildId) -> Result<Arc<AsyncMutex<GuildSession>>, VoiceError> {
        self.lock_sessions()
            .get(&guild)
            .cloned()
            .ok_or(VoiceError::NotJoined(guild))
    }

    /// Whether `entry` is still the session the map holds for `guild`.
    fn is_current(&self, guild: GuildId, entry: &Arc<AsyncMutex<GuildSession>>) -> bool {
        self.lock_sessions()
            .get(&guild)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Lock the guild's session, failing if it was left while waiting for the lock.
    async fn lock_entry(&self, guild: GuildId) -> Result<OwnedMutexGuard<GuildSession>, VoiceError> {
        let entry = self.entry(guild)?;
        let session = entry.clone().lock_owned().await;
        if !self.is_current(guild, &entry) {
            return Err(VoiceError::NotJoined(guild));
        }
        Ok(session)
    }

    fn check_capacity(&self, sessions: &SessionMap, guild: GuildId) -> Result<(), VoiceError> {
        if sessions.contains_key(&guild) {
            return Err(VoiceError::AlreadyJoined(guild));
        }
        let limit = self.config.max_concurrent_sessions();
        if sessions.len() >= limit {
            return Err(VoiceError::SessionLimit(limit));
        }
        Ok(())
    }

    async fn join(&self, guild: GuildId, channel: ChannelId) -> Result<SessionSummary, VoiceError> {
        self.check_capacity(&self.lock_sessions(), guild)?;

        let voice = self.connector.connect(guild, channel).await?;
        let session = GuildSession {
            session_id: Uuid::new_v4(),
            guild,
            channel,
            voice: voice.clone(),
            joined_at: chrono::Utc::now(),
            conversation: None,
        };
        let summary = session.summary();

        // Another join may have won the race while the voice handle was acquired
        let rejected = {
            let mut sessions = self.lock_sessions();
            match self.check_capacity(&sessions, guild) {
                Ok(()) => {
                    sessions.insert(guild, Arc::new(AsyncMutex::new(session)));
                    None
                }
                Err(e) => Some(e),
            }
        };
        if let Some(e) = rejected {
            if let Err(disconnect_error) = voice.disconnect().await {
                warn!(guild_id = %guild, error = %disconnect_error, "Failed to release rejected voice handle");
            }
            return Err(e);
        }

        info!(
            guild_id = %guild,
            channel_id = %channel,
            session_id = %summary.session_id,
            "Joined voice channel"
        );
        Ok(summary)
    }

    async fn start_conversation(
        &self,
        guild: GuildId,
        request: ConversationRequest,
    ) -> Result<SessionSummary, VoiceError> {
        let mut session = self.lock_entry(guild).await?;

        if session.conversation.is_some() {
            return Err(VoiceError::AlreadyActive(guild));
        }
        if !session.voice.is_connected() {
            return Err(VoiceError::Transport("Voice connection is closed".to_string()));
        }

        let profile = self.config.realtime_profile(guild);
        let timings = self.config.timings();
        let instructions = build_instructions(&profile.instructions, request.listen_to_name.as_deref());

        let client = Arc::new(SessionClient::new(guild, &profile, timings.handshake_timeout));
        if let Err(e) = open_remote(&client, &profile, &instructions).await {
            warn!(guild_id = %guild, error = %e, "Realtime session failed to start");
            client.disconnect().await;
            return Err(e);
        }

        let conversation = spawn_conversation(guild, &session.voice, client, request, timings);
        if let Err(e) = session.voice.listen(conversation.sink.clone()) {
            error!(guild_id = %guild, error = %e, "Failed to install capture sink");
            shutdown_conversation(guild, &session.voice, conversation, timings.shutdown_grace).await;
            return Err(e);
        }

        info!(
            guild_id = %guild,
            session_id = %session.session_id,
            target_speaker = ?conversation.sink.target(),
            "Conversation started"
        );
        session.conversation = Some(conversation);
        Ok(session.summary())
    }

    async fn stop_conversation(&self, guild: GuildId) -> Result<SessionSummary, VoiceError> {
        let mut session = self.lock_entry(guild).await?;

        match session.conversation.take() {
            Some(conversation) => {
                let grace = self.config.timings().shutdown_grace;
                shutdown_conversation(guild, &session.voice, conversation, grace).await;
            }
            None => debug!(guild_id = %guild, "No active conversation to stop"),
        }

        Ok(session.summary())
    }

    async fn leave(&self, guild: GuildId) -> Result<(), VoiceError> {
        // The entry stays in the map until teardown finishes so a concurrent
        // join sees AlreadyJoined instead of connecting a second voice.
        let entry = self.entry(guild)?;
        let mut session = entry.lock().await;
        if !self.is_current(guild, &entry) {
            return Err(VoiceError::NotJoined(guild));
        }

        if let Some(conversation) = session.conversation.take() {
            let grace = self.config.timings().shutdown_grace;
            shutdown_conversation(guild, &session.voice, conversation, grace).await;
        }

        if let Err(e) = session.voice.disconnect().await {
            warn!(guild_id = %guild, error = %e, "Voice disconnect failed");
        }

        // Removed while still holding the lock; waiters then fail is_current
        self.lock_sessions().remove(&guild);

        info!(guild_id = %guild, session_id = %session.session_id, "Left voice channel");
        Ok(())
    }

    async fn say(&self, guild: GuildId, text: &str) -> Result<(), VoiceError> {
        let session = self.lock_entry(guild).await?;

        let conversation = session
            .conversation
            .as_ref()
            .ok_or(VoiceError::NotActive(guild))?;
        if conversation.is_degraded() {
            return Err(VoiceError::InvalidState(
                "conversation lost its connection; stop it first".to_string(),
            ));
        }

        conversation.client.send_text(text).await
    }
}

async fn open_remote(
    client: &SessionClient,
    profile: &RealtimeProfile,
    instructions: &str,
) -> Result<(), VoiceError> {
    client.connect().await?;
    client.configure(instructions, &profile.voice, &profile.model).await
}

/// Create the queues and spawn the three tasks on the current runtime.
fn spawn_conversation(
    guild: GuildId,
    voice: &Arc<dyn VoiceHandle>,
    client: Arc<SessionClient>,
    request: ConversationRequest,
    timings: PipelineTimings,
) -> ActiveConversation {
    let stats = Arc::new(ConversationStats::default());
    let cancel = CancellationToken::new();
    let degraded = Arc::new(AtomicBool::new(false));

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();

    let listen = tokio::spawn(listen_task(
        guild,
        client.clone(),
        ResponseAssembler::new(playback_tx, stats.clone()),
        cancel.clone(),
        degraded.clone(),
        timings.listen_timeout,
    ));
    let playback = tokio::spawn(run_playback(
        guild,
        voice.clone(),
        playback_rx,
        cancel.clone(),
        timings,
        stats.clone(),
    ));
    let uplink = tokio::spawn(uplink_task(
        guild,
        client.clone(),
        outbound_rx,
        cancel.clone(),
        stats.clone(),
    ));

    ActiveConversation {
        client,
        sink: Arc::new(CaptureSink::new(request.listen_to, outbound_tx, stats.clone())),
        cancel,
        tasks: vec![("listen", listen), ("playback", playback), ("uplink", uplink)],
        degraded,
        target_name: request.listen_to_name,
        started_at: chrono::Utc::now(),
        stats,
    }
}

async fn listen_task(
    guild: GuildId,
    client: Arc<SessionClient>,
    mut assembler: ResponseAssembler,
    cancel: CancellationToken,
    degraded: Arc<AtomicBool>,
    recv_timeout: Duration,
) {
    match client.listen(&mut assembler, &cancel, recv_timeout).await {
        Ok(()) => debug!(guild_id = %guild, "Listen task stopped"),
        Err(e) => {
            error!(guild_id = %guild, error = %e, "Listen loop failed, conversation degraded");
            degraded.store(true, Ordering::Release);
            cancel.cancel();
        }
    }
}

/// Forward captured audio to the service in arrival order.
async fn uplink_task(
    guild: GuildId,
    client: Arc<SessionClient>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    stats: Arc<ConversationStats>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(pcm) = frame else { break };

        match client.send_audio(&pcm).await {
            Ok(true) => stats.bytes_sent(pcm.len()),
            Ok(false) => {}
            Err(e) => warn!(guild_id = %guild, error = %e, "Failed to send audio upstream"),
        }
    }
    debug!(guild_id = %guild, "Uplink task stopped");
}

/// Detach capture, cancel and await the tasks, then close the remote session.
async fn shutdown_conversation(
    guild: GuildId,
    voice: &Arc<dyn VoiceHandle>,
    conversation: ActiveConversation,
    grace: Duration,
) {
    voice.stop_listening();
    conversation.cancel.cancel();

    for (name, mut handle) in conversation.tasks {
        match timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!(guild_id = %guild, task = name, error = %e, "Task panicked"),
            Err(_) => {
                warn!(guild_id = %guild, task = name, "Task did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    conversation.client.disconnect().await;
    voice.stop();

    let stats = conversation.stats.snapshot();
    info!(
        guild_id = %guild,
        frames_forwarded = stats.frames_forwarded,
        frames_filtered = stats.frames_filtered,
        bytes_sent = stats.bytes_sent,
        utterances_played = stats.utterances_played,
        "Conversation stopped"
    );
}
