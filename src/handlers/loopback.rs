//! Endpoints for driving the in-process voice transport: inject captured
//! audio as if a speaker talked, and export what the bot played back.

use crate::audio::frame::TRANSPORT_FORMAT;
use crate::error::AppError;
use crate::session::{GuildId, SpeakerId};
use crate::state::AppState;
use crate::voice::LoopbackVoice;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CaptureQuery {
    pub speaker: SpeakerId,
}

fn loopback_voice(state: &AppState, guild: GuildId) -> Result<Arc<LoopbackVoice>, AppError> {
    state
        .loopback
        .voice(guild)
        .ok_or_else(|| AppError::NotFound(format!("No voice connection for guild {}", guild)))
}

/// Body: raw 48kHz stereo 16-bit little-endian PCM.
pub async fn inject_capture(
    state: web::Data<AppState>,
    path: web::Path<u64>,
    query: web::Query<CaptureQuery>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let guild = GuildId(path.into_inner());
    let voice = loopback_voice(&state, guild)?;

    if body.is_empty() {
        return Err(AppError::BadRequest("Capture body is empty".to_string()));
    }
    if body.len() % TRANSPORT_FORMAT.bytes_per_frame() != 0 {
        return Err(AppError::ValidationError(format!(
            "Capture body must hold whole {}-byte sample frames",
            TRANSPORT_FORMAT.bytes_per_frame()
        )));
    }

    let speaker = query.speaker;
    voice.set_speaking(speaker, true);
    let frames = voice.deliver_capture(speaker, &body);
    voice.set_speaking(speaker, false);

    Ok(HttpResponse::Ok().json(json!({
        "guild_id": guild,
        "channel_id": voice.channel(),
        "speaker_id": speaker,
        "bytes": body.len(),
        "frames_delivered": frames,
        "listening": voice.has_sink(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// The recent playback window as a WAV file.
pub async fn export_playback(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, AppError> {
    let voice = loopback_voice(&state, GuildId(path.into_inner()))?;
    let recorder = voice.recorder();
    let wav = recorder
        .to_wav()
        .map_err(|e| AppError::Internal(format!("Failed to encode playback: {}", e)))?;

    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header(("X-Frames-Played", voice.frames_played().to_string()))
        .insert_header(("X-Duration-Seconds", format!("{:.3}", recorder.duration_seconds())))
        .body(wav))
}
