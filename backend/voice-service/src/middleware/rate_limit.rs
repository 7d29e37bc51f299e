//! In-process sliding-window rate limiting.
//!
//! Counters are keyed `identity|method|path` within a named scope. They are
//! deliberately per-process (AP under restarts); abuse-ladder state that must
//! survive restarts lives in the KV store (see `middleware::abuse`).

use crate::config::RateLimitSettings;
use crate::error::AppError;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error, HttpMessage};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Advisory outcome of a rate-limit check.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
    /// Window end, epoch seconds.
    pub reset_epoch_secs: i64,
    /// Set when the request is over the limit.
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    pub fn is_limited(&self) -> bool {
        self.retry_after_secs.is_some()
    }
}

#[derive(Debug)]
struct Entry {
    count: u32,
    reset_at_ms: u64,
}

struct Scope {
    max_requests: u32,
    entries: Mutex<HashMap<String, Entry>>,
}

pub struct RateLimitEngine {
    window_ms: u64,
    max_keys_per_scope: usize,
    scopes: HashMap<&'static str, Scope>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Scope for a request path. Audio uploads get their own budget inside the
/// conversations surface.
pub fn scope_for_path(path: &str) -> &'static str {
    if path.starts_with("/v1/auth") {
        "auth"
    } else if path.starts_with("/v1/conversations") && path.contains("/audio") {
        "audio"
    } else if path.starts_with("/v1/conversations") {
        "conversations"
    } else {
        "default"
    }
}

impl RateLimitEngine {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let mut scopes = HashMap::new();
        for (name, max_requests) in [
            ("default", settings.max_default),
            ("auth", settings.max_auth),
            ("conversations", settings.max_conversations),
            ("audio", settings.max_audio),
        ] {
            scopes.insert(
                name,
                Scope {
                    max_requests,
                    entries: Mutex::new(HashMap::new()),
                },
            );
        }

        Self {
            window_ms: settings.window_ms,
            max_keys_per_scope: settings.max_keys_per_scope,
            scopes,
        }
    }

    /// Record one request against `(scope, identity, method, path)` and
    /// return the advisory decision.
    pub fn check(&self, scope: &str, identity: &str, method: &str, path: &str) -> RateDecision {
        let scope = self.scopes.get(scope).unwrap_or(&self.scopes["default"]);
        let key = format!("{identity}|{method}|{path}");
        let now = now_ms();

        let mut entries = scope.entries.lock().expect("rate-limit scope poisoned");
        let entry = entries.entry(key).or_insert(Entry {
            count: 0,
            reset_at_ms: now + self.window_ms,
        });

        if entry.reset_at_ms <= now {
            entry.count = 0;
            entry.reset_at_ms = now + self.window_ms;
        }

        entry.count += 1;
        let remaining = scope.max_requests.saturating_sub(entry.count);
        let reset_epoch_secs = (entry.reset_at_ms / 1000) as i64;
        let retry_after_secs = if entry.count > scope.max_requests {
            Some((entry.reset_at_ms.saturating_sub(now)).div_ceil(1000))
        } else {
            None
        };

        RateDecision {
            limit: scope.max_requests,
            remaining,
            reset_epoch_secs,
            retry_after_secs,
        }
    }

    /// Drop expired entries; then, if a scope still exceeds its key cap,
    /// evict oldest-reset entries until it fits.
    pub fn sweep(&self) {
        let now = now_ms();

        for (name, scope) in &self.scopes {
            let mut entries = scope.entries.lock().expect("rate-limit scope poisoned");
            entries.retain(|_, entry| entry.reset_at_ms > now);

            if entries.len() > self.max_keys_per_scope {
                let excess = entries.len() - self.max_keys_per_scope;
                warn!(
                    scope = name,
                    keys = entries.len(),
                    evicting = excess,
                    "rate-limit scope over key cap; evicting oldest entries"
                );

                let mut by_reset: Vec<(String, u64)> = entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.reset_at_ms))
                    .collect();
                by_reset.sort_by_key(|(_, reset)| *reset);
                for (key, _) in by_reset.into_iter().take(excess) {
                    entries.remove(&key);
                }
            }
        }
    }

    /// Background sweep loop, every `rate_limit.sweep_interval_secs`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.sweep();
            }
        })
    }
}

pub struct RateLimitMiddleware {
    engine: Arc<RateLimitEngine>,
}

impl RateLimitMiddleware {
    pub fn new(engine: Arc<RateLimitEngine>) -> Self {
        Self { engine }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            engine: self.engine.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    engine: Arc<RateLimitEngine>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let engine = self.engine.clone();

        Box::pin(async move {
            let authenticated = {
                let extensions = req.extensions();
                extensions
                    .get::<crate::middleware::auth::AuthenticatedUser>()
                    .map(|u| u.0.to_string())
            };
            let identity = match authenticated {
                Some(user_id) => user_id,
                None => req
                    .connection_info()
                    .realip_remote_addr()
                    .unwrap_or("unknown")
                    .to_string(),
            };

            let path = req.path().to_string();
            let method = req.method().to_string();
            let scope = scope_for_path(&path);

            let decision = engine.check(scope, &identity, &method, &path);
            if let Some(retry_after_secs) = decision.retry_after_secs {
                warn!(scope, identity = %identity, path = %path, "rate limit exceeded");
                return Err(AppError::RateLimited { retry_after_secs }.into());
            }

            let mut res = service.call(req).await?;
            let headers = res.headers_mut();
            headers.insert(
                HeaderName::from_static("x-ratelimit-limit"),
                HeaderValue::from_str(&decision.limit.to_string()).expect("numeric header"),
            );
            headers.insert(
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderValue::from_str(&decision.remaining.to_string()).expect("numeric header"),
            );
            headers.insert(
                HeaderName::from_static("x-ratelimit-reset"),
                HeaderValue::from_str(&decision.reset_epoch_secs.to_string())
                    .expect("numeric header"),
            );
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(window_ms: u64, max_auth: u32) -> RateLimitSettings {
        RateLimitSettings {
            window_ms,
            max_default: 100,
            max_auth,
            max_conversations: 60,
            max_audio: 30,
            max_keys_per_scope: 10000,
            sweep_interval_secs: 300,
        }
    }

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let engine = RateLimitEngine::new(&settings(900_000, 5));

        for i in 0..5 {
            let d = engine.check("auth", "198.51.100.7", "POST", "/v1/auth/apple");
            assert!(!d.is_limited(), "request {} should pass", i + 1);
        }

        // At exactly max the advisory remaining is zero...
        let at_limit = engine.check("auth", "198.51.100.7", "POST", "/v1/auth/apple");
        assert!(at_limit.is_limited());
        let retry = at_limit.retry_after_secs.unwrap();
        assert!(retry > 0 && retry <= 900);
        assert_eq!(at_limit.remaining, 0);
    }

    #[test]
    fn remaining_reaches_zero_at_the_limit() {
        let engine = RateLimitEngine::new(&settings(900_000, 2));
        assert_eq!(engine.check("auth", "ip", "POST", "/p").remaining, 1);
        assert_eq!(engine.check("auth", "ip", "POST", "/p").remaining, 0);
    }

    #[test]
    fn window_expiry_resets_the_counter() {
        let engine = RateLimitEngine::new(&settings(10, 1));

        assert!(!engine.check("auth", "ip", "POST", "/p").is_limited());
        assert!(engine.check("auth", "ip", "POST", "/p").is_limited());

        std::thread::sleep(Duration::from_millis(30));
        assert!(!engine.check("auth", "ip", "POST", "/p").is_limited());
    }

    #[test]
    fn identities_are_counted_separately() {
        let engine = RateLimitEngine::new(&settings(900_000, 1));

        assert!(!engine.check("auth", "ip-a", "POST", "/p").is_limited());
        assert!(!engine.check("auth", "ip-b", "POST", "/p").is_limited());
        assert!(engine.check("auth", "ip-a", "POST", "/p").is_limited());
    }

    #[test]
    fn email_keys_track_independently_of_ip() {
        let engine = RateLimitEngine::new(&settings(900_000, 2));

        engine.check("auth", "203.0.113.9", "POST", "/v1/auth/apple");
        engine.check("auth", "203.0.113.9", "POST", "/v1/auth/apple");
        assert!(engine
            .check("auth", "203.0.113.9", "POST", "/v1/auth/apple")
            .is_limited());

        // The per-email key still has budget.
        assert!(!engine
            .check("auth", "email:u@x.io", "POST", "/v1/auth/apple")
            .is_limited());
    }

    #[test]
    fn sweep_evicts_oldest_reset_entries_over_cap() {
        let mut s = settings(900_000, 100);
        s.max_keys_per_scope = 3;
        let engine = RateLimitEngine::new(&s);

        for i in 0..5 {
            engine.check("default", &format!("id-{i}"), "GET", "/p");
            std::thread::sleep(Duration::from_millis(2));
        }

        engine.sweep();

        let scope = &engine.scopes["default"];
        let entries = scope.entries.lock().unwrap();
        assert_eq!(entries.len(), 3);
        // The oldest two entries are gone.
        assert!(!entries.contains_key("id-0|GET|/p"));
        assert!(!entries.contains_key("id-1|GET|/p"));
        assert!(entries.contains_key("id-4|GET|/p"));
    }

    #[test]
    fn path_scope_classification() {
        assert_eq!(scope_for_path("/v1/auth/apple"), "auth");
        assert_eq!(scope_for_path("/v1/conversations"), "conversations");
        assert_eq!(scope_for_path("/v1/conversations/abc/audio"), "audio");
        assert_eq!(scope_for_path("/v1/users/me"), "default");
    }

    #[test]
    fn unknown_scope_falls_back_to_default_budget() {
        let engine = RateLimitEngine::new(&settings(900_000, 5));
        let d = engine.check("nonexistent", "ip", "GET", "/p");
        assert_eq!(d.limit, 100);
    }
}
