//! Audio database operations.

use crate::error::AppResult;
use crate::models::{Audio, AudioStatus};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn insert(
    pool: &PgPool,
    conversation_id: Uuid,
    user_id: Uuid,
    audio_key: &str,
    file_path: &str,
) -> AppResult<Audio> {
    let audio = sqlx::query_as::<_, Audio>(
        r#"
        INSERT INTO audios (conversation_id, user_id, audio_key, file_path, status)
        VALUES ($1, $2, $3, $4, 'uploaded')
        RETURNING *
        "#,
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(audio_key)
    .bind(file_path)
    .fetch_one(pool)
    .await?;

    Ok(audio)
}

pub async fn find_by_id(pool: &PgPool, id: i64) -> AppResult<Option<Audio>> {
    let audio = sqlx::query_as::<_, Audio>("SELECT * FROM audios WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(audio)
}

pub async fn find_by_conversation(pool: &PgPool, conversation_id: Uuid) -> AppResult<Vec<Audio>> {
    let audios = sqlx::query_as::<_, Audio>(
        "SELECT * FROM audios WHERE conversation_id = $1 ORDER BY id",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(audios)
}

/// Whether the `(conversation_id, audio_key)` slot is already taken.
pub async fn slot_exists(
    pool: &PgPool,
    conversation_id: Uuid,
    audio_key: &str,
) -> AppResult<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM audios WHERE conversation_id = $1 AND audio_key = $2)",
    )
    .bind(conversation_id)
    .bind(audio_key)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

pub async fn count_by_conversation(pool: &PgPool, conversation_id: Uuid) -> AppResult<i64> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM audios WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(pool)
            .await?;

    Ok(count)
}

pub async fn mark_transcribing(pool: &PgPool, id: i64) -> AppResult<()> {
    sqlx::query(
        "UPDATE audios SET status = 'transcribing', updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Store the transcript, null the file path, and mark the audio transcribed.
pub async fn store_transcript(pool: &PgPool, id: i64, transcript: &str) -> AppResult<()> {
    sqlx::query(
        "UPDATE audios \
         SET status = 'transcribed', transcript = $2, file_path = NULL, updated_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(transcript)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_failed(pool: &PgPool, id: i64, error_message: &str) -> AppResult<()> {
    sqlx::query(
        "UPDATE audios SET status = 'failed', error_message = $2, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(())
}

/// Count audios in the conversation by status, for pipeline completion checks.
pub async fn count_by_status(
    pool: &PgPool,
    conversation_id: Uuid,
    status: AudioStatus,
) -> AppResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM audios WHERE conversation_id = $1 AND status = $2",
    )
    .bind(conversation_id)
    .bind(status)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
