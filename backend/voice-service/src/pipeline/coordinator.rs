//! Pipeline coordinator.
//!
//! Owns the provider clients and the job lifecycle. Audio jobs are isolated:
//! one audio's terminal failure fails the conversation but never another
//! audio's job. Every state change is reported as a [`PushEvent`]; a pump
//! task forwards those to the push channel manager.

use crate::db;
use crate::models::{Audio, Conversation};
use crate::pipeline::analysis::{combine_transcripts, compose_prompt, AnalysisProvider};
use crate::pipeline::transcription::TranscriptionProvider;
use crate::pipeline::ProviderError;
use crate::websocket::frames::{conversation_topic, ServerFrame};
use crate::websocket::ChannelManager;
use resilience::{with_retry, RetryPolicy};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A domain event addressed to a conversation topic.
#[derive(Debug)]
pub struct PushEvent {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub frame: ServerFrame,
}

/// Progress milestones published while a conversation is processing.
pub const PROGRESS_UPLOAD_ACCEPTED: f32 = 0.25;
pub const PROGRESS_ANALYSIS_STARTED: f32 = 0.75;
pub const PROGRESS_COMPLETED: f32 = 1.0;

/// Progress after `transcribed` of `expected` audios finished, strictly
/// between the upload-accepted and analysis-started milestones.
pub fn transcription_progress(transcribed: i64, expected: i64) -> f32 {
    let expected = expected.max(1) as f32;
    let fraction = (transcribed.max(0) as f32 / expected).clamp(0.0, 1.0);
    PROGRESS_UPLOAD_ACCEPTED + (PROGRESS_ANALYSIS_STARTED - PROGRESS_UPLOAD_ACCEPTED) * fraction
}

/// Forward pipeline events to the push manager. This is the only bridge
/// between the two subsystems.
pub fn spawn_event_pump(
    manager: Arc<ChannelManager>,
    mut events: UnboundedReceiver<PushEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let topic = conversation_topic(event.conversation_id);
            manager.publish(event.user_id, &topic, event.frame).await;
        }
    })
}

pub struct PipelineCoordinator {
    db: PgPool,
    transcriber: Arc<dyn TranscriptionProvider>,
    analyst: Arc<dyn AnalysisProvider>,
    events: UnboundedSender<PushEvent>,
    retry: RetryPolicy,
}

impl PipelineCoordinator {
    pub fn new(
        db: PgPool,
        transcriber: Arc<dyn TranscriptionProvider>,
        analyst: Arc<dyn AnalysisProvider>,
        events: UnboundedSender<PushEvent>,
    ) -> Self {
        Self {
            db,
            transcriber,
            analyst,
            events,
            retry: RetryPolicy::provider(),
        }
    }

    fn publish(&self, user_id: Uuid, conversation_id: Uuid, frame: ServerFrame) {
        // The pump consuming this channel lives as long as the process.
        let _ = self.events.send(PushEvent {
            user_id,
            conversation_id,
            frame,
        });
    }

    fn publish_progress(&self, conversation: &Conversation, progress: f32) {
        self.publish(
            conversation.user_id,
            conversation.id,
            ServerFrame::ConversationProgress {
                conversation_id: conversation.id,
                progress,
            },
        );
    }

    /// Entry point after an accepted upload: report progress and run the
    /// audio job in the background.
    pub fn handle_upload(self: &Arc<Self>, conversation: Conversation, audio: Audio) {
        self.publish_progress(&conversation, PROGRESS_UPLOAD_ACCEPTED);

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.process_audio(conversation, audio).await;
        });
    }

    async fn process_audio(self: Arc<Self>, conversation: Conversation, audio: Audio) {
        let correlation_id = Uuid::new_v4();
        info!(
            correlation_id = %correlation_id,
            conversation_id = %conversation.id,
            audio_id = audio.id,
            "transcription job started"
        );

        if let Err(err) = db::audios::mark_transcribing(&self.db, audio.id).await {
            error!(correlation_id = %correlation_id, error = %err, "cannot mark audio transcribing");
            return;
        }

        let result = match &audio.file_path {
            Some(path) => {
                let transcriber = self.transcriber.clone();
                with_retry(&self.retry, || {
                    let transcriber = transcriber.clone();
                    let path = path.clone();
                    async move { transcriber.transcribe(&path).await }
                })
                .await
            }
            None => Err(ProviderError::Validation(
                "audio has no stored file".to_string(),
            )),
        };

        match result {
            Ok(transcript) => {
                if let Err(err) = db::audios::store_transcript(&self.db, audio.id, &transcript).await
                {
                    error!(correlation_id = %correlation_id, error = %err, "cannot store transcript");
                    return;
                }

                self.publish(
                    conversation.user_id,
                    conversation.id,
                    ServerFrame::AudioProcessed { audio_id: audio.id },
                );

                let expected = conversation.recording_type.max_audios();
                match db::audios::count_by_status(
                    &self.db,
                    conversation.id,
                    crate::models::AudioStatus::Transcribed,
                )
                .await
                {
                    Ok(transcribed) => {
                        self.publish_progress(
                            &conversation,
                            transcription_progress(transcribed, expected),
                        );
                        if transcribed >= expected {
                            self.enqueue_analysis(conversation).await;
                        }
                    }
                    Err(err) => {
                        error!(correlation_id = %correlation_id, error = %err, "cannot count transcribed audios");
                    }
                }
            }
            Err(provider_err) => {
                // Full cause stays server-side under the correlation id; the
                // client sees a redacted message.
                error!(
                    correlation_id = %correlation_id,
                    conversation_id = %conversation.id,
                    audio_id = audio.id,
                    error = %provider_err,
                    "transcription failed terminally"
                );
                let redacted = "Transcription failed".to_string();

                if let Err(err) = db::audios::mark_failed(&self.db, audio.id, &redacted).await {
                    error!(correlation_id = %correlation_id, error = %err, "cannot mark audio failed");
                }

                self.publish(
                    conversation.user_id,
                    conversation.id,
                    ServerFrame::AudioFailed {
                        audio_id: audio.id,
                        error: redacted.clone(),
                    },
                );

                self.fail_conversation(&conversation, &redacted).await;
            }
        }
    }

    async fn enqueue_analysis(self: &Arc<Self>, conversation: Conversation) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.process_analysis(conversation).await;
        });
    }

    async fn process_analysis(self: Arc<Self>, conversation: Conversation) {
        let correlation_id = Uuid::new_v4();
        info!(
            correlation_id = %correlation_id,
            conversation_id = %conversation.id,
            "analysis job started"
        );
        self.publish_progress(&conversation, PROGRESS_ANALYSIS_STARTED);

        let audios = match db::audios::find_by_conversation(&self.db, conversation.id).await {
            Ok(audios) => audios,
            Err(err) => {
                error!(correlation_id = %correlation_id, error = %err, "cannot load audios for analysis");
                return;
            }
        };

        let transcripts: Vec<(String, String)> = audios
            .iter()
            .filter_map(|a| {
                a.transcript
                    .as_ref()
                    .map(|t| (a.audio_key.clone(), t.clone()))
            })
            .collect();

        let prompt = compose_prompt(conversation.mode, &transcripts);
        let analyst = self.analyst.clone();
        let result = with_retry(&self.retry, || {
            let analyst = analyst.clone();
            let prompt = prompt.clone();
            async move { analyst.analyze(&prompt).await }
        })
        .await;

        match result {
            Ok(analysis) => {
                let transcript = combine_transcripts(&transcripts);
                match db::conversations::complete(&self.db, conversation.id, &transcript, &analysis)
                    .await
                {
                    Ok(true) => {
                        self.publish(
                            conversation.user_id,
                            conversation.id,
                            ServerFrame::ConversationCompleted {
                                conversation_id: conversation.id,
                            },
                        );
                        self.publish_progress(&conversation, PROGRESS_COMPLETED);
                        info!(correlation_id = %correlation_id, conversation_id = %conversation.id, "conversation completed");
                    }
                    Ok(false) => {
                        // Already terminal; the completion write was ignored.
                        warn!(correlation_id = %correlation_id, conversation_id = %conversation.id, "completion ignored: conversation already terminal");
                    }
                    Err(err) => {
                        error!(correlation_id = %correlation_id, error = %err, "cannot store analysis");
                    }
                }
            }
            Err(provider_err) => {
                error!(
                    correlation_id = %correlation_id,
                    conversation_id = %conversation.id,
                    error = %provider_err,
                    "analysis failed terminally"
                );
                self.fail_conversation(&conversation, "Analysis failed").await;
            }
        }
    }

    async fn fail_conversation(&self, conversation: &Conversation, redacted: &str) {
        match db::conversations::fail(&self.db, conversation.id, redacted).await {
            Ok(true) => {
                self.publish(
                    conversation.user_id,
                    conversation.id,
                    ServerFrame::ConversationFailed {
                        error: redacted.to_string(),
                    },
                );
            }
            Ok(false) => {
                // Another job already drove the conversation terminal.
            }
            Err(err) => {
                error!(conversation_id = %conversation.id, error = %err, "cannot mark conversation failed");
            }
        }
    }
}
