use crate::config::Settings;
use crate::middleware::{AbuseControl, RateLimitEngine};
use crate::pipeline::PipelineCoordinator;
use crate::security::{AppleIdentityVerifier, KeyRing, SessionTokenService};
use crate::services::QuotaGate;
use crate::websocket::ChannelManager;
use kv_store::KeyValueStore;
use sqlx::PgPool;
use std::sync::Arc;

/// Constructor-injected collaborators shared by every handler. Built once in
/// `main`; no module-level state.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub kv: Arc<dyn KeyValueStore>,
    pub settings: Arc<Settings>,
    pub keyring: Arc<KeyRing>,
    pub sessions: Arc<SessionTokenService>,
    pub identity: Arc<AppleIdentityVerifier>,
    pub rate_limits: Arc<RateLimitEngine>,
    pub abuse: Arc<AbuseControl>,
    pub quota: Arc<QuotaGate>,
    pub push: Arc<ChannelManager>,
    pub pipeline: Arc<PipelineCoordinator>,
}
