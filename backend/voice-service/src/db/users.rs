//! User database operations.

use crate::error::AppResult;
use crate::models::User;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Find user by id (excluding soft-deleted users).
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> AppResult<Option<User>> {
    let user =
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(user)
}

/// Find user by email (excluding soft-deleted users).
pub async fn find_by_email(pool: &PgPool, email: &str) -> AppResult<Option<User>> {
    let user =
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1 AND deleted_at IS NULL")
            .bind(email)
            .fetch_optional(pool)
            .await?;

    Ok(user)
}

/// Find user by the identity provider's stable subject.
pub async fn find_by_apple_user_id(pool: &PgPool, apple_user_id: &str) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE apple_user_id = $1 AND deleted_at IS NULL",
    )
    .bind(apple_user_id)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

pub async fn create(
    pool: &PgPool,
    email: &str,
    name: Option<&str>,
    apple_user_id: &str,
) -> AppResult<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, email, name, apple_user_id)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(email)
    .bind(name)
    .bind(apple_user_id)
    .fetch_one(pool)
    .await?;

    Ok(user)
}

/// Attach the provider subject to an account found by email. Idempotent:
/// a subject already present is left untouched.
pub async fn link_apple_account(pool: &PgPool, id: Uuid, apple_user_id: &str) -> AppResult<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET apple_user_id = COALESCE(apple_user_id, $2), updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(apple_user_id)
    .fetch_one(pool)
    .await?;

    Ok(user)
}

pub async fn update_name(pool: &PgPool, id: Uuid, name: Option<&str>) -> AppResult<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET name = $2, updated_at = now()
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(user)
}

/// Flag the account as locked until the given instant (abuse ladder).
pub async fn set_locked_until(
    pool: &PgPool,
    email: &str,
    until: Option<DateTime<Utc>>,
) -> AppResult<()> {
    sqlx::query("UPDATE users SET locked_until = $2, updated_at = now() WHERE lower(email) = lower($1)")
        .bind(email)
        .bind(until)
        .execute(pool)
        .await?;

    Ok(())
}
