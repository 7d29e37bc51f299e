use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "audio_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AudioStatus {
    Uploaded,
    Transcribing,
    Transcribed,
    Failed,
}

/// One uploaded recording. `(conversation_id, audio_key)` is unique; the file
/// path is nulled once transcription succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Audio {
    pub id: i64,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    /// Logical slot within the conversation (client-chosen label).
    pub audio_key: String,
    pub file_path: Option<String>,
    pub transcript: Option<String>,
    pub status: AudioStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
