use actix_web::http::header;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    // Auth
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    ExpiredToken,

    #[error("challenge required before further attempts")]
    AuthChallengeRequired,

    #[error("account temporarily locked")]
    AccountLocked { retry_after_secs: u64 },

    // Authorization
    #[error("forbidden")]
    Forbidden,

    // Not found
    #[error("user not found")]
    UserNotFound,

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("audio not found")]
    AudioNotFound,

    // Validation
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("audio slot already uploaded")]
    DuplicateAudio,

    #[error("audio slot limit reached for this conversation")]
    TooManyAudios,

    // Limits
    #[error("weekly conversation quota exceeded")]
    QuotaExceeded { retry_after_secs: u64 },

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    // Upstream
    #[error("identity provider error: {0}")]
    IdentityProvider(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("key-value store unavailable: {0}")]
    KvUnavailable(String),

    // Internal
    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code carried on the wire.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::MissingToken => "MISSING_TOKEN",
            AppError::InvalidToken(_) => "INVALID_TOKEN",
            AppError::ExpiredToken => "EXPIRED_TOKEN",
            AppError::AuthChallengeRequired => "AUTH_CHALLENGE_REQUIRED",
            AppError::AccountLocked { .. } => "ACCOUNT_LOCKED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::UserNotFound => "USER_NOT_FOUND",
            AppError::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            AppError::AudioNotFound => "AUDIO_NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::DuplicateAudio => "DUPLICATE_AUDIO",
            AppError::TooManyAudios => "TOO_MANY_AUDIOS",
            AppError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::IdentityProvider(_) => "IDENTITY_PROVIDER_ERROR",
            AppError::Transcription(_) => "TRANSCRIPTION_ERROR",
            AppError::Analysis(_) => "ANALYSIS_ERROR",
            AppError::KvUnavailable(_) => "KV_UNAVAILABLE",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code_u16(&self) -> u16 {
        match self {
            AppError::MissingToken | AppError::InvalidToken(_) | AppError::ExpiredToken => 401,
            AppError::AuthChallengeRequired => 403,
            AppError::AccountLocked { .. } => 403,
            AppError::Forbidden => 403,
            AppError::UserNotFound | AppError::ConversationNotFound | AppError::AudioNotFound => {
                404
            }
            AppError::BadRequest(_) => 400,
            AppError::DuplicateAudio => 409,
            AppError::TooManyAudios => 400,
            AppError::QuotaExceeded { .. } | AppError::RateLimited { .. } => 429,
            AppError::IdentityProvider(_)
            | AppError::Transcription(_)
            | AppError::Analysis(_) => 502,
            AppError::KvUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// User-safe message; internals are logged, never surfaced.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => "Internal server error".to_string(),
            AppError::IdentityProvider(_) => "Identity provider unavailable".to_string(),
            AppError::Transcription(_) => "Transcription provider unavailable".to_string(),
            AppError::Analysis(_) => "Analysis provider unavailable".to_string(),
            AppError::KvUnavailable(_) => "Service temporarily degraded".to_string(),
            other => other.to_string(),
        }
    }

    /// Seconds the caller should wait before trying again, for limit errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after_secs }
            | AppError::QuotaExceeded { retry_after_secs }
            | AppError::AccountLocked { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.status_code_u16())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, AppError::Database(_) | AppError::Internal(_)) {
            tracing::error!(code = self.error_code(), error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.error_code(),
            "message": self.public_message(),
            "status": self.status_code_u16(),
        });

        let mut builder = HttpResponse::build(self.status_code());
        if let Some(secs) = self.retry_after_secs() {
            builder.insert_header((header::RETRY_AFTER, secs.to_string()));
        }
        builder.json(body)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        AppError::Database(err.to_string())
    }
}

impl From<kv_store::KvError> for AppError {
    fn from(err: kv_store::KvError) -> Self {
        AppError::KvUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_errors_carry_retry_advice() {
        let err = AppError::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(err.status_code_u16(), 429);
        assert_eq!(err.retry_after_secs(), Some(42));

        let err = AppError::QuotaExceeded {
            retry_after_secs: 3600,
        };
        assert_eq!(err.retry_after_secs(), Some(3600));
    }

    #[test]
    fn auth_errors_map_to_401() {
        assert_eq!(AppError::MissingToken.status_code_u16(), 401);
        assert_eq!(
            AppError::InvalidToken("bad signature".into()).status_code_u16(),
            401
        );
        assert_eq!(AppError::ExpiredToken.status_code_u16(), 401);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = AppError::Database("connection refused to 10.0.0.3".into());
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }

    #[test]
    fn duplicate_audio_conflicts() {
        assert_eq!(AppError::DuplicateAudio.status_code_u16(), 409);
        assert_eq!(AppError::TooManyAudios.status_code_u16(), 400);
    }
}
