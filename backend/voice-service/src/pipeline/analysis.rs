//! Analysis provider client and prompt composition.

use crate::models::ConversationMode;
use crate::pipeline::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Run the composed prompt and return the analysis text.
    async fn analyze(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Build the analysis prompt from per-audio transcripts. Each transcript is
/// labeled with its slot key so two-sided recordings keep speakers apart.
pub fn compose_prompt(mode: ConversationMode, transcripts: &[(String, String)]) -> String {
    let stance = match mode {
        ConversationMode::Vent => {
            "The speaker needed to vent. Validate their feelings, reflect the emotional \
             core of what happened, and gently surface one or two insights."
        }
        ConversationMode::Coach => {
            "Act as a communication coach. Identify patterns in how the speakers express \
             themselves and suggest concrete ways to communicate more effectively."
        }
        ConversationMode::Mediator => {
            "Act as a neutral mediator between the two speakers. Summarize each \
             perspective fairly, find the shared ground, and propose a constructive next step."
        }
    };

    let mut prompt = String::new();
    prompt.push_str(stance);
    prompt.push_str("\n\n");
    for (key, transcript) in transcripts {
        prompt.push_str(&format!("[{key}]\n{transcript}\n\n"));
    }
    prompt.push_str("Respond with a thoughtful analysis of this conversation.");
    prompt
}

/// Combined transcript stored on the conversation record.
pub fn combine_transcripts(transcripts: &[(String, String)]) -> String {
    transcripts
        .iter()
        .map(|(key, transcript)| format!("[{key}]\n{transcript}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

pub struct HttpAnalysisProvider {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpAnalysisProvider {
    pub fn new(url: String, api_key: Option<String>, model: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisProvider {
    async fn analyze(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt},
            ],
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Validation(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!("status {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("malformed response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Transport("empty completion".to_string()))?;

        debug!(chars = content.len(), "analysis completed");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcripts() -> Vec<(String, String)> {
        vec![
            ("a".to_string(), "I felt ignored all week.".to_string()),
            ("b".to_string(), "I was overwhelmed at work.".to_string()),
        ]
    }

    #[test]
    fn prompt_includes_every_transcript_with_its_slot() {
        let prompt = compose_prompt(ConversationMode::Mediator, &transcripts());
        assert!(prompt.contains("[a]\nI felt ignored all week."));
        assert!(prompt.contains("[b]\nI was overwhelmed at work."));
    }

    #[test]
    fn prompt_stance_follows_the_mode() {
        let vent = compose_prompt(ConversationMode::Vent, &transcripts());
        let coach = compose_prompt(ConversationMode::Coach, &transcripts());
        let mediator = compose_prompt(ConversationMode::Mediator, &transcripts());

        assert!(vent.contains("vent"));
        assert!(coach.contains("communication coach"));
        assert!(mediator.contains("neutral mediator"));
        assert_ne!(vent, coach);
        assert_ne!(coach, mediator);
    }

    #[test]
    fn combined_transcript_keeps_slot_order() {
        let combined = combine_transcripts(&transcripts());
        let a = combined.find("[a]").unwrap();
        let b = combined.find("[b]").unwrap();
        assert!(a < b);
    }
}
