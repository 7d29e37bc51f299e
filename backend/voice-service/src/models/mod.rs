pub mod audio;
pub mod conversation;
pub mod user;

pub use audio::{Audio, AudioStatus};
pub use conversation::{Conversation, ConversationMode, ConversationStatus, RecordingType};
pub use user::User;
