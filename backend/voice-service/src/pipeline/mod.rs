//! Transcription + analysis pipeline.
//!
//! Uploaded audios become independent transcription jobs; when every audio of
//! a conversation is transcribed, one analysis job produces the final result.
//! The pipeline never touches the push manager directly: it emits
//! [`PushEvent`]s on a channel the manager side consumes, so the two
//! subsystems stay acyclic.

use resilience::Retryable;

pub mod analysis;
pub mod coordinator;
pub mod transcription;

pub use analysis::{AnalysisProvider, HttpAnalysisProvider};
pub use coordinator::{spawn_event_pump, PipelineCoordinator, PushEvent};
pub use transcription::{HttpTranscriptionProvider, TranscriptionProvider};

/// Provider call failure, classified for the retry policy: transport faults
/// are retryable, provider-reported validation errors are terminal.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider rejected input: {0}")]
    Validation(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ProviderError::Transport("timeout".into()).is_retryable());
        assert!(!ProviderError::Validation("file too large".into()).is_retryable());
    }
}
