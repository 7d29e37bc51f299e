//! Resource-ownership admission.
//!
//! Runs after `RequireAuth`: fetch the targeted resource, reject when absent
//! or owned by someone else, and hand the record to the handler. Each step is
//! a plain `Result` so the route reads as a pipeline of admission checks.

use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::Conversation;
use sqlx::PgPool;
use uuid::Uuid;

/// Fetch a conversation and verify the caller owns it.
pub async fn require_conversation_ownership(
    pool: &PgPool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> AppResult<Conversation> {
    let conversation = db::conversations::find_by_id(pool, conversation_id)
        .await?
        .ok_or(AppError::ConversationNotFound)?;

    if conversation.user_id != user_id {
        return Err(AppError::Forbidden);
    }

    Ok(conversation)
}
