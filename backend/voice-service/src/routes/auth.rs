//! Authentication endpoint: exchange an Apple identity token for a session
//! token, under the full abuse ladder.

use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::user::UserView;
use crate::models::User;
use crate::security::{unverified_email_claim, VerifiedIdentity};
use crate::state::AppState;
use actix_web::{post, web, HttpRequest, HttpResponse};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct AppleSignInRequest {
    pub identity_token: String,
    /// Display name, offered by the client on first sign-in only.
    pub name: Option<String>,
    /// Present when the client has just solved a challenge.
    pub challenge_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub session_token: String,
    pub user: UserView,
}

#[post("/apple")]
pub async fn apple_sign_in(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<AppleSignInRequest>,
) -> Result<HttpResponse, AppError> {
    let ip = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();

    if body.challenge_token.as_deref().is_some_and(|t| !t.is_empty()) {
        state.abuse.challenge_solved(&ip).await?;
    }

    // IP rungs first: progressive delay, then a pending challenge.
    state.abuse.pre_auth_gate(&ip).await?;

    let identity = match state.identity.verify(&body.identity_token).await {
        Ok(identity) => identity,
        Err(err) => {
            // Attribute the failure to the (unverified) email claim so the
            // lockout rung advances even for forged tokens.
            let email = unverified_email_claim(&body.identity_token);
            let outcome = state
                .abuse
                .record_failure(&ip, email.as_deref())
                .await
                .unwrap_or_default();
            if outcome.locked_out {
                if let Some(email) = &email {
                    flag_account_locked(&state, email).await?;
                }
            }
            return Err(err);
        }
    };

    let user = upsert_user(&state, &identity, body.name.as_deref()).await?;
    let email_lower = user.email.to_lowercase();

    // Email rungs once the attempt is attributable: sliding-window budget and
    // the lockout counter.
    let decision = state.rate_limits.check(
        "auth",
        &format!("email:{email_lower}"),
        req.method().as_str(),
        req.path(),
    );
    if let Some(retry_after_secs) = decision.retry_after_secs {
        return Err(AppError::RateLimited { retry_after_secs });
    }
    state.abuse.check_lockout(&email_lower).await?;

    let now = Utc::now();
    if user.is_locked(now) {
        let retry_after_secs = user
            .locked_until
            .map(|until| (until - now).num_seconds().max(1) as u64)
            .unwrap_or(state.settings.abuse.lockout_cooldown_secs);
        return Err(AppError::AccountLocked { retry_after_secs });
    }

    state.abuse.record_success(&ip, &email_lower).await?;

    let session_token = state.sessions.create(user.id).await?;
    info!(user_id = %user.id, "session issued");

    Ok(HttpResponse::Ok().json(AuthResponse {
        session_token,
        user: UserView::from(&user),
    }))
}

/// Resolve the verified identity to a user record: by provider subject, then
/// by email, creating the account on first sign-in.
async fn upsert_user(
    state: &AppState,
    identity: &VerifiedIdentity,
    name: Option<&str>,
) -> AppResult<User> {
    if let Some(user) = db::users::find_by_apple_user_id(&state.db, &identity.subject).await? {
        return Ok(user);
    }

    if let Some(email) = &identity.email {
        if let Some(user) = db::users::find_by_email(&state.db, email).await? {
            return db::users::link_apple_account(&state.db, user.id, &identity.subject).await;
        }

        let user = db::users::create(&state.db, email, name, &identity.subject).await?;
        info!(user_id = %user.id, "user created on first sign-in");
        return Ok(user);
    }

    // No subject match and the token carried no email: nothing to attach the
    // account to. Apple only omits email after the first sign-in.
    Err(AppError::InvalidToken(
        "identity token missing email for first sign-in".to_string(),
    ))
}

async fn flag_account_locked(state: &AppState, email_lower: &str) -> AppResult<()> {
    let until = Utc::now()
        + ChronoDuration::seconds(state.settings.abuse.lockout_cooldown_secs as i64);
    db::users::set_locked_until(&state.db, email_lower, Some(until)).await
}
