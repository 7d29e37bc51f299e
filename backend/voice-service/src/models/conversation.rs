use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Coaching stance the analysis prompt is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "conversation_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    Vent,
    Coach,
    Mediator,
}

/// How the audio was captured: one shared live recording, or one track per
/// participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "recording_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    Separate,
    Live,
}

impl RecordingType {
    /// Slot limit per conversation: `live` admits 1 audio, `separate` 2.
    pub fn max_audios(&self) -> i64 {
        match self {
            RecordingType::Live => 1,
            RecordingType::Separate => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "conversation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl ConversationStatus {
    /// Terminal states admit no further status writes; the `WHERE` guards in
    /// `db::conversations` enforce the same order at the database.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationStatus::Completed | ConversationStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub mode: ConversationMode,
    pub recording_type: RecordingType,
    pub status: ConversationStatus,
    pub transcript: Option<String>,
    pub analysis: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
