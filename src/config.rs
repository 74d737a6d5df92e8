//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML, JSON and environment variables
//! - **Custom Debug**: Secrets are redacted so they never reach the logs
//! - **Trait objects**: `GuildConfigProvider` lets the session controller read
//!   per-guild settings without knowing where they are stored
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, OPENAI_API_KEY)
//! 2. Environment variables (APP__SERVER__PORT, APP__REALTIME__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::session::PipelineTimings;
use crate::voice::GuildId;

/// Default realtime endpoint; the model is appended as a query parameter.
pub const DEFAULT_REALTIME_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

/// Instructions used when neither the config nor a guild override sets any.
pub const DEFAULT_INSTRUCTIONS: &str = "You are Juno, a friendly Discord bot assistant. \
Keep responses brief and conversational. You're talking to people in a Discord voice channel.";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each concern (HTTP server, realtime service, pipeline timings, loopback
/// transport) changes for different reasons, so each gets its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub pipeline: PipelineConfig,
    pub performance: PerformanceConfig,
    pub loopback: LoopbackConfig,

    /// Per-guild overrides, keyed by guild id
    #[serde(default)]
    pub guilds: HashMap<String, GuildOverride>,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection settings for the realtime conversational-audio service.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL without the `model` query parameter
/// - `model`: Model id sent in the URL and in `session.update`
/// - `voice`: Output voice id
/// - `api_key`: Bearer credential; usually supplied through `OPENAI_API_KEY`
/// - `instructions`: System instructions for the conversation
#[derive(Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub instructions: String,
}

/// Keeps the credential out of logs.
impl fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("api_key", &redact(&self.api_key))
            .field("instructions", &self.instructions)
            .finish()
    }
}

/// Per-guild replacements for any realtime field.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GuildOverride {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl fmt::Debug for GuildOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuildOverride")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("api_key", &redact(&self.api_key))
            .field("instructions", &self.instructions)
            .finish()
    }
}

/// Waits and timeouts used by the voice pipeline, in milliseconds.
///
/// ## Tuning guidelines:
/// - `listen_timeout_ms` and `queue_timeout_ms` bound how long a cancelled
///   task can take to notice
/// - `settle_delay_ms` gives the transport time to release the previous source
/// - `shutdown_grace_ms` is how long `stop` waits before aborting a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub listen_timeout_ms: u64,
    pub queue_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub handshake_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl PipelineConfig {
    pub fn timings(&self) -> PipelineTimings {
        PipelineTimings {
            listen_timeout: Duration::from_millis(self.listen_timeout_ms),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Maximum number of guilds joined at once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Settings for the in-process loopback voice transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Delay between frame pulls; 20 matches a real transport
    pub frame_interval_ms: u64,
    /// How much played audio to keep for WAV export
    pub recording_seconds: u32,
}

impl LoopbackConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let timings = PipelineTimings::default();

        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            realtime: RealtimeConfig {
                endpoint: DEFAULT_REALTIME_ENDPOINT.to_string(),
                model: "gpt-realtime".to_string(),
                voice: "alloy".to_string(),
                api_key: None,
                instructions: DEFAULT_INSTRUCTIONS.to_string(),
            },
            pipeline: PipelineConfig {
                listen_timeout_ms: timings.listen_timeout.as_millis() as u64,
                queue_timeout_ms: timings.queue_timeout.as_millis() as u64,
                poll_interval_ms: timings.poll_interval.as_millis() as u64,
                settle_delay_ms: timings.settle_delay.as_millis() as u64,
                handshake_timeout_ms: timings.handshake_timeout.as_millis() as u64,
                shutdown_grace_ms: timings.shutdown_grace.as_millis() as u64,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
            loopback: LoopbackConfig {
                frame_interval_ms: 20,
                recording_seconds: 30,
            },
            guilds: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__REALTIME__VOICE=verse`: Override output voice
    /// - `APP__GUILDS__1234__MODEL=gpt-realtime-mini`: Override the model for guild 1234
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `OPENAI_API_KEY=sk-...`: Realtime credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("realtime.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let p = &self.pipeline;
        for (name, value) in [
            ("listen_timeout_ms", p.listen_timeout_ms),
            ("queue_timeout_ms", p.queue_timeout_ms),
            ("poll_interval_ms", p.poll_interval_ms),
            ("handshake_timeout_ms", p.handshake_timeout_ms),
            ("shutdown_grace_ms", p.shutdown_grace_ms),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("pipeline.{} must be greater than 0", name));
            }
        }

        if self.realtime.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Realtime endpoint cannot be empty"));
        }
        if self.realtime.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Realtime model cannot be empty"));
        }
        if self.realtime.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Realtime voice cannot be empty"));
        }

        for key in self.guilds.keys() {
            if key.parse::<u64>().is_err() {
                return Err(anyhow::anyhow!("Guild override key '{}' is not a guild id", key));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example,
    /// `{"realtime": {"voice": "verse"}}` changes just the voice. A guild
    /// override object is merged field by field into any existing override.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(realtime) = partial_config.get("realtime") {
            let text = |key: &str| realtime.get(key).and_then(|v| v.as_str()).map(str::to_string);
            if let Some(endpoint) = text("endpoint") {
                self.realtime.endpoint = endpoint;
            }
            if let Some(model) = text("model") {
                self.realtime.model = model;
            }
            if let Some(voice) = text("voice") {
                self.realtime.voice = voice;
            }
            if let Some(instructions) = text("instructions") {
                self.realtime.instructions = instructions;
            }
            if let Some(api_key) = text("api_key") {
                self.realtime.api_key = Some(api_key);
            }
        }

        if let Some(pipeline) = partial_config.get("pipeline") {
            let p = &mut self.pipeline;
            for (key, slot) in [
                ("listen_timeout_ms", &mut p.listen_timeout_ms),
                ("queue_timeout_ms", &mut p.queue_timeout_ms),
                ("poll_interval_ms", &mut p.poll_interval_ms),
                ("settle_delay_ms", &mut p.settle_delay_ms),
                ("handshake_timeout_ms", &mut p.handshake_timeout_ms),
                ("shutdown_grace_ms", &mut p.shutdown_grace_ms),
            ] {
                if let Some(value) = pipeline.get(key).and_then(|v| v.as_u64()) {
                    *slot = value;
                }
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        if let Some(guilds) = partial_config.get("guilds").and_then(|v| v.as_object()) {
            for (guild, fields) in guilds {
                let entry = self.guilds.entry(guild.clone()).or_default();
                let text = |key: &str| fields.get(key).and_then(|v| v.as_str()).map(str::to_string);
                for (key, slot) in [
                    ("endpoint", &mut entry.endpoint),
                    ("model", &mut entry.model),
                    ("voice", &mut entry.voice),
                    ("api_key", &mut entry.api_key),
                    ("instructions", &mut entry.instructions),
                ] {
                    if let Some(value) = text(key) {
                        *slot = Some(value);
                    }
                }
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Realtime settings for one guild, with its overrides applied.
    pub fn profile_for(&self, guild: GuildId) -> RealtimeProfile {
        let base = &self.realtime;
        let guild_override = self.guilds.get(&guild.to_string());
        let pick = |value: Option<&Option<String>>, fallback: &str| {
            value
                .and_then(|v| v.clone())
                .unwrap_or_else(|| fallback.to_string())
        };

        RealtimeProfile {
            endpoint: pick(guild_override.map(|o| &o.endpoint), &base.endpoint),
            model: pick(guild_override.map(|o| &o.model), &base.model),
            voice: pick(guild_override.map(|o| &o.voice), &base.voice),
            api_key: guild_override
                .and_then(|o| o.api_key.clone())
                .or_else(|| base.api_key.clone()),
            instructions: pick(guild_override.map(|o| &o.instructions), &base.instructions),
        }
    }

    /// JSON view of the configuration with every credential masked.
    pub fn redacted_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(realtime) = value.get_mut("realtime") {
            realtime["api_key"] = serde_json::json!(redact(&self.realtime.api_key));
        }
        if let Some(guilds) = value.get_mut("guilds").and_then(|v| v.as_object_mut()) {
            for (key, guild) in guilds.iter_mut() {
                let api_key = self.guilds.get(key).and_then(|o| o.api_key.clone());
                guild["api_key"] = serde_json::json!(redact(&api_key));
            }
        }
        value
    }
}

/// Resolved realtime settings handed to one session.
#[derive(Clone)]
pub struct RealtimeProfile {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub api_key: Option<String>,
    pub instructions: String,
}

impl fmt::Debug for RealtimeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeProfile")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("api_key", &redact(&self.api_key))
            .finish_non_exhaustive()
    }
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "[REDACTED]")
}

/// Source of per-guild settings for the session controller.
pub trait GuildConfigProvider: Send + Sync {
    fn realtime_profile(&self, guild: GuildId) -> RealtimeProfile;

    fn timings(&self) -> PipelineTimings;

    fn max_concurrent_sessions(&self) -> usize;
}

/// Reads straight from the live, runtime-updatable application config.
#[derive(Debug, Clone)]
pub struct SharedConfigProvider {
    config: Arc<RwLock<AppConfig>>,
}

impl SharedConfigProvider {
    pub fn new(config: Arc<RwLock<AppConfig>>) -> Self {
        Self { config }
    }
}

impl GuildConfigProvider for SharedConfigProvider {
    fn realtime_profile(&self, guild: GuildId) -> RealtimeProfile {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .profile_for(guild)
    }

    fn timings(&self) -> PipelineTimings {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pipeline
            .timings()
    }

    fn max_concurrent_sessions(&self) -> usize {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .performance
            .max_concurrent_sessions
    }
}
