//! Push-channel wire frames.
//!
//! Every frame is one JSON text message with a `type` tag. Inbound and
//! outbound taxonomies are separate enums so the boundary stays explicit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOPIC_PREFIX: &str = "conversation:";

/// Inbound frames from client to server. Only `authenticate` is accepted
/// before the connection is authenticated.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate { token: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Best-effort "stop polling": unsubscribes without aborting in-flight
    /// provider work.
    Cancel { topic: String },
    Ping,
}

/// Outbound frames from server to client, protocol and domain events alike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        server_time: i64,
    },
    AuthSuccess {
        user_id: Uuid,
    },
    AuthError {
        reason: String,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Pong,
    Error {
        message: String,
    },
    // Domain events (conversation pipeline)
    ConversationProgress {
        conversation_id: Uuid,
        progress: f32,
    },
    AudioProcessed {
        audio_id: i64,
    },
    AudioFailed {
        audio_id: i64,
        error: String,
    },
    ConversationCompleted {
        conversation_id: Uuid,
    },
    ConversationFailed {
        error: String,
    },
}

impl ClientFrame {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("server frames always serialize")
    }
}

/// Parse a `conversation:<id>` topic. Other prefixes are rejected.
pub fn parse_topic(topic: &str) -> Option<Uuid> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

pub fn conversation_topic(conversation_id: Uuid) -> String {
    format!("{TOPIC_PREFIX}{conversation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_decode_by_type_tag() {
        let frame = ClientFrame::decode(r#"{"type":"subscribe","topic":"conversation:abc"}"#)
            .unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { topic } if topic == "conversation:abc"));

        let frame = ClientFrame::decode(r#"{"type":"authenticate","token":"t"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Authenticate { token } if token == "t"));

        assert!(matches!(
            ClientFrame::decode(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
    }

    #[test]
    fn unknown_frame_types_fail_to_decode() {
        assert!(ClientFrame::decode(r#"{"type":"launch_missiles"}"#).is_err());
        assert!(ClientFrame::decode("not json").is_err());
    }

    #[test]
    fn server_frames_carry_snake_case_tags() {
        let user_id = Uuid::now_v7();
        let encoded = ServerFrame::AuthSuccess { user_id }.encode();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "auth_success");
        assert_eq!(value["user_id"], user_id.to_string());

        let encoded = ServerFrame::ConversationProgress {
            conversation_id: user_id,
            progress: 0.5,
        }
        .encode();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "conversation_progress");
        assert_eq!(value["progress"], 0.5);
    }

    #[test]
    fn server_frames_round_trip() {
        let frame = ServerFrame::AudioFailed {
            audio_id: 7,
            error: "too large".to_string(),
        };
        let decoded: ServerFrame = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn topics_must_use_the_conversation_prefix() {
        let id = Uuid::now_v7();
        assert_eq!(parse_topic(&format!("conversation:{id}")), Some(id));
        assert_eq!(parse_topic(&conversation_topic(id)), Some(id));

        assert_eq!(parse_topic(&format!("user:{id}")), None);
        assert_eq!(parse_topic("conversation:not-a-uuid"), None);
        assert_eq!(parse_topic("conversation:"), None);
    }
}
