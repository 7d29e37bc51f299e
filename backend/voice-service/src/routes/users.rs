//! Profile routes for the authenticated user.

use crate::db;
use crate::error::AppError;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::user::UserView;
use crate::state::AppState;
use actix_web::{get, patch, web, HttpResponse};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
}

#[get("/users/me")]
pub async fn me(
    user: AuthenticatedUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let user = db::users::find_by_id(&state.db, user.0)
        .await?
        .ok_or(AppError::UserNotFound)?;

    Ok(HttpResponse::Ok().json(UserView::from(&user)))
}

#[patch("/users/me")]
pub async fn update_me(
    user: AuthenticatedUser,
    state: web::Data<AppState>,
    body: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, AppError> {
    if let Some(name) = &body.name {
        if name.len() > 200 {
            return Err(AppError::BadRequest("name too long".to_string()));
        }
    }

    let user = db::users::update_name(&state.db, user.0, body.name.as_deref())
        .await?
        .ok_or(AppError::UserNotFound)?;

    Ok(HttpResponse::Ok().json(UserView::from(&user)))
}
