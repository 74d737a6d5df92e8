use crate::error::AppError;
use crate::session::{ChannelId, ConversationRequest, GuildId};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub channel_id: ChannelId,
}

#[derive(Debug, Deserialize)]
pub struct SayRequest {
    pub text: String,
}

pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.controller.sessions().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, AppError> {
    let summary = state.controller.session(GuildId(path.into_inner())).await?;
    Ok(HttpResponse::Ok().json(summary))
}

pub async fn join(
    state: web::Data<AppState>,
    path: web::Path<u64>,
    body: web::Json<JoinRequest>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .controller
        .join(GuildId(path.into_inner()), body.channel_id)
        .await?;
    Ok(HttpResponse::Created().json(summary))
}

/// Start a conversation. The body is optional; an empty body listens to everyone.
pub async fn start_conversation(
    state: web::Data<AppState>,
    path: web::Path<u64>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    let request: ConversationRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ConversationRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let summary = state
        .controller
        .start_conversation(GuildId(path.into_inner()), request)
        .await?;
    Ok(HttpResponse::Created().json(summary))
}

pub async fn stop_conversation(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .controller
        .stop_conversation(GuildId(path.into_inner()))
        .await?;
    Ok(HttpResponse::Ok().json(summary))
}

pub async fn say(
    state: web::Data<AppState>,
    path: web::Path<u64>,
    body: web::Json<SayRequest>,
) -> Result<HttpResponse, AppError> {
    let text = body.into_inner().text;
    if text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }

    state.controller.say(GuildId(path.into_inner()), text).await?;

    Ok(HttpResponse::Accepted().json(json!({
        "status": "sent",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn leave(
    state: web::Data<AppState>,
    path: web::Path<u64>,
) -> Result<HttpResponse, AppError> {
    let guild = GuildId(path.into_inner());
    state.controller.leave(guild).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "left",
        "guild_id": guild,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
