//! Conversation API surface: creation, audio upload, retrieval.

use crate::db;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::middleware::ownership::require_conversation_ownership;
use crate::models::{Audio, Conversation, ConversationMode, RecordingType};
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpResponse};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub mode: ConversationMode,
    pub recording_type: RecordingType,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub audios: Vec<Audio>,
}

#[post("/conversations")]
pub async fn create_conversation(
    user: AuthenticatedUser,
    state: web::Data<AppState>,
    body: web::Json<CreateConversationRequest>,
) -> Result<HttpResponse, AppError> {
    // The session may outlive a (soft-deleted) account.
    db::users::find_by_id(&state.db, user.0)
        .await?
        .ok_or(AppError::UserNotFound)?;

    state.quota.check_and_count(user.0).await?;

    let conversation =
        db::conversations::create(&state.db, user.0, body.mode, body.recording_type).await?;
    info!(conversation_id = %conversation.id, user_id = %user.0, "conversation created");

    Ok(HttpResponse::Created().json(conversation))
}

#[get("/conversations")]
pub async fn list_conversations(
    user: AuthenticatedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let conversations = db::conversations::list_by_user(&state.db, user.0).await?;
    Ok(HttpResponse::Ok().json(conversations))
}

#[get("/conversations/{id}")]
pub async fn get_conversation(
    user: AuthenticatedUser,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let conversation =
        require_conversation_ownership(&state.db, path.into_inner(), user.0).await?;
    let audios = db::audios::find_by_conversation(&state.db, conversation.id).await?;

    Ok(HttpResponse::Ok().json(ConversationDetail {
        conversation,
        audios,
    }))
}

/// Admission checks for an audio upload, run before any file is persisted.
async fn check_audio_upload_constraints(
    state: &AppState,
    conversation: &Conversation,
    audio_key: &str,
) -> AppResult<()> {
    if conversation.status.is_terminal() {
        return Err(AppError::BadRequest(
            "conversation is no longer accepting audio".to_string(),
        ));
    }

    if db::audios::slot_exists(&state.db, conversation.id, audio_key).await? {
        return Err(AppError::DuplicateAudio);
    }

    let count = db::audios::count_by_conversation(&state.db, conversation.id).await?;
    if count >= conversation.recording_type.max_audios() {
        return Err(AppError::TooManyAudios);
    }

    Ok(())
}

#[post("/conversations/{id}/audio")]
pub async fn upload_audio(
    user: AuthenticatedUser,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let conversation =
        require_conversation_ownership(&state.db, path.into_inner(), user.0).await?;

    // Read multipart fields: `audio_key` and the file itself.
    let mut audio_key: Option<String> = None;
    let mut audio_data: Vec<u8> = Vec::new();

    while let Some(field) = payload.next().await {
        let mut field =
            field.map_err(|e| AppError::BadRequest(format!("multipart error: {e}")))?;

        match field.name().unwrap_or_default() {
            "audio_key" => {
                let mut raw = Vec::new();
                while let Some(chunk) = field.next().await {
                    let data = chunk
                        .map_err(|e| AppError::BadRequest(format!("field read error: {e}")))?;
                    raw.extend_from_slice(&data);
                }
                audio_key = Some(String::from_utf8_lossy(&raw).trim().to_string());
            }
            "audio" => {
                while let Some(chunk) = field.next().await {
                    let data = chunk
                        .map_err(|e| AppError::BadRequest(format!("audio read error: {e}")))?;
                    audio_data.extend_from_slice(&data);
                }
            }
            _ => {}
        }
    }

    let audio_key = audio_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AppError::BadRequest("audio_key field is required".to_string()))?;
    if audio_data.is_empty() {
        return Err(AppError::BadRequest("audio file is required".to_string()));
    }

    check_audio_upload_constraints(&state, &conversation, &audio_key).await?;

    let file_path = store_audio_file(&state, conversation.id, &audio_key, &audio_data).await?;
    let audio =
        db::audios::insert(&state.db, conversation.id, user.0, &audio_key, &file_path).await?;

    // First accepted upload moves the conversation into processing.
    db::conversations::mark_processing(&state.db, conversation.id).await?;
    let conversation = db::conversations::find_by_id(&state.db, conversation.id)
        .await?
        .ok_or(AppError::ConversationNotFound)?;

    info!(
        conversation_id = %conversation.id,
        audio_id = audio.id,
        audio_key = %audio.audio_key,
        bytes = audio_data.len(),
        "audio accepted"
    );
    state.pipeline.handle_upload(conversation, audio.clone());

    Ok(HttpResponse::Created().json(audio))
}

async fn store_audio_file(
    state: &AppState,
    conversation_id: Uuid,
    audio_key: &str,
    data: &[u8],
) -> AppResult<String> {
    let dir = format!("{}/{}", state.settings.storage.audio_dir, conversation_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| AppError::Internal(format!("audio storage: {e}")))?;

    let file_path = format!("{dir}/{audio_key}.audio");
    let mut file = tokio::fs::File::create(&file_path)
        .await
        .map_err(|e| AppError::Internal(format!("audio storage: {e}")))?;
    file.write_all(data)
        .await
        .map_err(|e| AppError::Internal(format!("audio storage: {e}")))?;
    file.flush()
        .await
        .map_err(|e| AppError::Internal(format!("audio storage: {e}")))?;

    Ok(file_path)
}
