//! Conversation database operations.
//!
//! Status writes carry `WHERE` guards matching the monotone order
//! `waiting < processing < {completed, failed}`; a write that would move a
//! conversation backward or out of a terminal state affects zero rows and is
//! reported as such so callers can ignore it.

use crate::error::AppResult;
use crate::models::{Conversation, ConversationMode, ConversationStatus, RecordingType};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn create(
    pool: &PgPool,
    user_id: Uuid,
    mode: ConversationMode,
    recording_type: RecordingType,
) -> AppResult<Conversation> {
    let conversation = sqlx::query_as::<_, Conversation>(
        r#"
        INSERT INTO conversations (id, user_id, mode, recording_type, status)
        VALUES ($1, $2, $3, $4, 'waiting')
        RETURNING *
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(user_id)
    .bind(mode)
    .bind(recording_type)
    .fetch_one(pool)
    .await?;

    Ok(conversation)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> AppResult<Option<Conversation>> {
    let conversation =
        sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(conversation)
}

pub async fn list_by_user(pool: &PgPool, user_id: Uuid) -> AppResult<Vec<Conversation>> {
    let conversations = sqlx::query_as::<_, Conversation>(
        "SELECT * FROM conversations WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(conversations)
}

/// `waiting -> processing` on first audio upload. Returns `false` when the
/// conversation was not in `waiting` (already processing or terminal).
pub async fn mark_processing(pool: &PgPool, id: Uuid) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE conversations SET status = 'processing', updated_at = now() \
         WHERE id = $1 AND status = 'waiting'",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// `processing -> completed` with the stored analysis and combined transcript.
pub async fn complete(
    pool: &PgPool,
    id: Uuid,
    transcript: &str,
    analysis: &str,
) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE conversations \
         SET status = 'completed', transcript = $2, analysis = $3, updated_at = now() \
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(transcript)
    .bind(analysis)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Terminal failure. Allowed from `waiting` or `processing`; ignored once the
/// conversation is already terminal.
pub async fn fail(pool: &PgPool, id: Uuid, error_message: &str) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE conversations SET status = 'failed', error_message = $2, updated_at = now() \
         WHERE id = $1 AND status IN ('waiting', 'processing')",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn current_status(pool: &PgPool, id: Uuid) -> AppResult<Option<ConversationStatus>> {
    let status =
        sqlx::query_scalar::<_, ConversationStatus>("SELECT status FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(status)
}
