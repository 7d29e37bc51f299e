//! Bearer-token admission.
//!
//! Header parsing is strict: the scheme is exactly `Bearer` (case-sensitive)
//! followed by a single space and a non-empty token. Anything else is treated
//! as a missing token, not an invalid one.

use crate::error::AppError;
use crate::security::SessionTokenService;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpMessage};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

/// User id attached to the request after successful verification.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

/// Parse a strict `Bearer <token>` authorization header value.
pub fn parse_bearer(value: &str) -> Result<&str, AppError> {
    let token = value.strip_prefix("Bearer ").ok_or(AppError::MissingToken)?;
    if token.is_empty() || token.starts_with(' ') || token.contains(' ') {
        return Err(AppError::MissingToken);
    }
    Ok(token)
}

pub struct RequireAuth {
    sessions: Arc<SessionTokenService>,
}

impl RequireAuth {
    pub fn new(sessions: Arc<SessionTokenService>) -> Self {
        Self { sessions }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequireAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequireAuthService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequireAuthService {
            service: Rc::new(service),
            sessions: self.sessions.clone(),
        }))
    }
}

pub struct RequireAuthService<S> {
    service: Rc<S>,
    sessions: Arc<SessionTokenService>,
}

impl<S, B> Service<ServiceRequest> for RequireAuthService<S>
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
        let sessions = self.sessions.clone();

        Box::pin(async move {
            let header_value = req
                .headers()
                .get(actix_web::http::header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .ok_or(AppError::MissingToken)?;

            let token = parse_bearer(header_value)?;
            let user_id = sessions.verify(token).await?;

            req.extensions_mut().insert(AuthenticatedUser(user_id));
            service.call(req).await
        })
    }
}

impl actix_web::FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        match req.extensions().get::<AuthenticatedUser>() {
            Some(user) => ready(Ok(*user)),
            None => ready(Err(AppError::MissingToken.into())),
        }
    }
}
