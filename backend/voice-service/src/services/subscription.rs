//! External subscription entitlement check.
//!
//! The receipt-validation service is an external collaborator; only its answer
//! matters here: paying, free, or unknown when it cannot be reached.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    Free,
    Paying,
    /// The subscription service could not answer.
    Unknown,
}

#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    async fn entitlement(&self, user_id: Uuid) -> Entitlement;
}

#[derive(Debug, Deserialize)]
struct EntitlementResponse {
    status: String,
}

pub struct HttpEntitlementChecker {
    http: reqwest::Client,
    /// Unset means no subscription service is deployed: everyone is free tier.
    url: Option<String>,
}

impl HttpEntitlementChecker {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http, url }
    }
}

#[async_trait]
impl EntitlementChecker for HttpEntitlementChecker {
    async fn entitlement(&self, user_id: Uuid) -> Entitlement {
        let Some(base) = &self.url else {
            return Entitlement::Free;
        };

        let url = format!("{}/users/{}/entitlement", base.trim_end_matches('/'), user_id);
        let response = match self.http.get(&url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "entitlement check unreachable");
                return Entitlement::Unknown;
            }
        };

        if !response.status().is_success() {
            warn!(user_id = %user_id, status = %response.status(), "entitlement check failed");
            return Entitlement::Unknown;
        }

        match response.json::<EntitlementResponse>().await {
            Ok(body) if body.status == "paying" => Entitlement::Paying,
            Ok(_) => Entitlement::Free,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "entitlement response malformed");
                Entitlement::Unknown
            }
        }
    }
}
