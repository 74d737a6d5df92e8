use crate::audio::frame::{SERVICE_FORMAT, TRANSPORT_FORMAT};
use crate::session::{SessionPhase, SessionSummary};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let sessions = state.controller.sessions().await;
    let load = SessionLoad::from_sessions(&sessions, config.performance.max_concurrent_sessions);

    HttpResponse::Ok().json(json!({
        "status": if load.degraded > 0 { "degraded" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "realtime": {
            "model": config.realtime.model,
            "voice": config.realtime.voice,
            "credential_configured": config.realtime.api_key.is_some()
        },
        "audio": {
            "transport_format": TRANSPORT_FORMAT,
            "service_format": SERVICE_FORMAT
        },
        "sessions": load,
        "memory": MemoryInfo::current()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();
    let sessions = state.controller.sessions().await;

    let mut endpoint_stats: Vec<serde_json::Value> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let conversations: Vec<serde_json::Value> = sessions
        .iter()
        .filter_map(|s| {
            s.conversation.as_ref().map(|c| {
                json!({
                    "guild_id": s.guild_id,
                    "phase": s.phase,
                    "stats": c.stats
                })
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": SessionLoad::from_sessions(&sessions, config.performance.max_concurrent_sessions),
        "conversations": conversations,
        "memory": MemoryInfo::current()
    }))
}

/// How full the session table is.
#[derive(Debug, Serialize, PartialEq)]
pub struct SessionLoad {
    pub joined: usize,
    pub active: usize,
    pub degraded: usize,
    pub max_sessions: usize,
    pub usage_percent: f64,
    pub status: &'static str,
}

impl SessionLoad {
    pub fn from_sessions(sessions: &[SessionSummary], max_sessions: usize) -> Self {
        let count = |phase| sessions.iter().filter(|s| s.phase == phase).count();
        let usage = if max_sessions > 0 {
            sessions.len() as f64 / max_sessions as f64
        } else {
            0.0
        };

        let status = if usage > 0.9 {
            "high_load"
        } else if usage > 0.7 {
            "moderate_load"
        } else {
            "normal"
        };

        Self {
            joined: count(SessionPhase::Joined),
            active: count(SessionPhase::Active),
            degraded: count(SessionPhase::Degraded),
            max_sessions,
            usage_percent: (usage * 100.0).round(),
            status,
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct MemoryInfo {
    resident_memory_bytes: u64,
    virtual_memory_bytes: u64,
    available: bool,
}

impl MemoryInfo {
    /// Reads `/proc/self/status` on Linux; reports unavailable elsewhere.
    fn current() -> Self {
        #[cfg(target_os = "linux")]
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kib = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0)
            };
            return Self {
                resident_memory_bytes: kib("VmRSS:") * 1024,
                virtual_memory_bytes: kib("VmSize:") * 1024,
                available: true,
            };
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSummary;
    use crate::voice::{ChannelId, GuildId};

    fn summary(guild: u64, phase: SessionPhase) -> SessionSummary {
        SessionSummary {
            session_id: uuid::Uuid::new_v4(),
            guild_id: GuildId(guild),
            channel_id: ChannelId(1),
            phase,
            joined_at: chrono::Utc::now(),
            voice_connected: true,
            playing: false,
            conversation: None,
        }
    }

    #[test]
    fn test_session_load_counts_phases() {
        let sessions = vec![
            summary(1, SessionPhase::Joined),
            summary(2, SessionPhase::Active),
            summary(3, SessionPhase::Active),
            summary(4, SessionPhase::Degraded),
        ];
        let load = SessionLoad::from_sessions(&sessions, 5);

        assert_eq!(load.joined, 1);
        assert_eq!(load.active, 2);
        assert_eq!(load.degraded, 1);
        assert_eq!(load.usage_percent, 80.0);
        assert_eq!(load.status, "moderate_load");
    }

    #[test]
    fn test_empty_table_is_normal() {
        let load = SessionLoad::from_sessions(&[], 10);
        assert_eq!(load.status, "normal");
        assert_eq!(load.usage_percent, 0.0);
    }
}
