use std::time::Duration as StdDuration;

use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::*;
use crate::core::errors::{ApiError, StoreError};
use crate::core::helpers::{from_micros, is_safe_redirect, now, redirect, to_micros};
use crate::core::query_params::{get_string, login_url, parse_query};
use crate::email::send_password_reset_email;
use crate::models::models::{SessionData, User};
use crate::templates::{self, flash_redirect};
use crate::users::{find_by_email, find_by_id, find_by_username, set_password, touch_last_seen};
use crate::AppState;

// === Sessions ===

/// `start` moved by `hours`, pinned to the representable range.
fn hours_after(start: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    Duration::try_hours(hours)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(if hours < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// Opens a new session and sweeps out every session that has already expired.
pub fn create_session(conn: &Connection, user_id: i64, lifetime_hours: i64) -> Result<String, StoreError> {
    let token = Uuid::new_v4().to_string();
    let created_at = now();
    let expires_at = hours_after(created_at, lifetime_hours);

    let purged = conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?1",
        params![to_micros(&created_at)],
    )?;
    if purged > 0 {
        tracing::debug!(purged, "removed expired sessions");
    }

    conn.execute(
        "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        params![token, user_id, to_micros(&created_at), to_micros(&expires_at)],
    )?;
    Ok(token)
}

/// Resolves a session token to its user id. Expired sessions are deleted.
pub fn session_user_id(conn: &Connection, token: &str) -> Result<Option<i64>, StoreError> {
    let data = conn
        .query_row(
            "SELECT user_id, created_at, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |r| {
                Ok(SessionData {
                    user_id: r.get(0)?,
                    created_at: from_micros(r.get(1)?),
                    expires_at: from_micros(r.get(2)?),
                })
            },
        )
        .optional()?;

    match data {
        Some(data) if data.expires_at > now() => Ok(Some(data.user_id)),
        Some(data) => {
            tracing::debug!(user_id = data.user_id, created_at = %data.created_at, "session expired");
            delete_session(conn, token)?;
            Ok(None)
        }
        None => Ok(None),
    }
}

pub fn delete_session(conn: &Connection, token: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
    Ok(())
}

/// Session token from the cookie, or from an `Authorization: Bearer` header.
fn request_token(req: &HttpRequest) -> Option<String> {
    if let Some(cookie) = req.cookie(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }
    let auth_header = req.headers().get("Authorization")?.to_str().ok()?;
    auth_header
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

/// The authenticated user for this request, if any. Refreshes `last_seen`.
pub fn current_user(req: &HttpRequest, state: &AppState) -> Result<Option<User>, ApiError> {
    let token = match request_token(req) {
        Some(t) => t,
        None => return Ok(None),
    };

    let user = state.db.transaction(|tx| {
        let user_id = match session_user_id(tx, &token)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let user = find_by_id(tx, user_id)?;
        if user.is_some() {
            touch_last_seen(tx, user_id)?;
        }
        Ok::<_, StoreError>(user)
    })?;

    Ok(user)
}

/// Sends anonymous visitors to the login form, remembering where they were going.
pub fn login_required(req: &HttpRequest) -> HttpResponse {
    let target = match req.query_string() {
        "" => req.path().to_string(),
        q => format!("{}?{}", req.path(), q),
    };
    flash_redirect(&login_url(&target), "Please log in to access this page.")
}

pub fn session_cookie(token: String, max_age_hours: Option<i64>) -> Cookie<'static> {
    let mut builder = Cookie::build(SESSION_COOKIE, token)
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    if let Some(hours) = max_age_hours {
        builder = builder.max_age(CookieDuration::seconds(hours.saturating_mul(3600)));
    }
    builder.finish()
}

/// Opens a session for `user_id` and returns the cookie that carries it.
pub fn start_session(state: &AppState, user_id: i64, remember_me: bool) -> Result<Cookie<'static>, ApiError> {
    let lifetime = state.config.session_lifetime_hours(remember_me);
    let token = state
        .db
        .transaction(|tx| create_session(tx, user_id, lifetime))?;
    Ok(session_cookie(token, remember_me.then_some(lifetime)))
}

// === Password reset tokens ===

#[derive(Debug, Serialize, Deserialize)]
struct ResetClaims {
    reset_password: i64,
    exp: u64,
}

fn encode_reset_claims(claims: &ResetClaims, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Signed token that lets the holder set a new password for `user` until it expires.
pub fn get_password_reset_token(
    user: &User,
    secret: &str,
    expires_in: StdDuration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = i64::try_from(expires_in.as_secs())
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .timestamp();
    let claims = ResetClaims {
        reset_password: user.id,
        exp: exp.max(0) as u64,
    };
    encode_reset_claims(&claims, secret)
}

/// The user a reset token was issued for. Any invalid, tampered or expired
/// token resolves to `None`.
pub fn verify_reset_password_token(conn: &Connection, secret: &str, token: &str) -> Option<User> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    let claims = match decode::<ResetClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
        Ok(data) => data.claims,
        Err(e) => {
            tracing::debug!(error = %e, "rejected password reset token");
            return None;
        }
    };

    find_by_id(conn, claims.reset_password).ok().flatten()
}

// === HTTP Handlers ===

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub remember_me: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct ResetPasswordRequestForm {
    pub email: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct ResetPasswordForm {
    pub password: String,
    pub password2: String,
}

pub async fn login_page(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    if current_user(&req, &state)?.is_some() {
        return Ok(redirect("/index"));
    }
    Ok(templates::render_login(&req, &LoginForm::default(), &[]))
}

pub async fn login_user(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<LoginForm>,
) -> Result<HttpResponse, ApiError> {
    if current_user(&req, &state)?.is_some() {
        return Ok(redirect("/index"));
    }

    if form.username.trim().is_empty() || form.password.is_empty() {
        let errors = vec!["Username and password are required".to_string()];
        return Ok(templates::render_login(&req, &form, &errors));
    }

    let user = find_by_username(&state.db.conn(), form.username.trim())?;
    let user = match user {
        Some(u) if u.check_password(&form.password) => u,
        _ => {
            tracing::info!(username = %form.username.trim(), "failed login");
            let back = match req.query_string() {
                "" => "/login".to_string(),
                q => format!("/login?{}", q),
            };
            return Ok(flash_redirect(&back, "Invalid username or password"));
        }
    };

    let remember_me = form.remember_me.is_some();
    let cookie = start_session(&state, user.id, remember_me)?;

    let next = get_string(&parse_query(req.query_string()), "next")
        .filter(|n| is_safe_redirect(n))
        .unwrap_or_else(|| "/index".to_string());

    tracing::info!(user_id = user.id, "user logged in");
    let mut resp = redirect(&next);
    resp.add_cookie(&cookie).map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(resp)
}

pub async fn logout_user(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    if let Some(token) = request_token(&req) {
        delete_session(&state.db.conn(), &token)?;
    }

    let removal = session_cookie(String::new(), None);
    let mut resp = redirect("/index");
    resp.add_removal_cookie(&removal).map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(resp)
}

pub async fn reset_password_request_page(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if current_user(&req, &state)?.is_some() {
        return Ok(redirect("/index"));
    }
    Ok(templates::render_reset_request(&req, &[]))
}

pub async fn reset_password_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<ResetPasswordRequestForm>,
) -> Result<HttpResponse, ApiError> {
    if current_user(&req, &state)?.is_some() {
        return Ok(redirect("/index"));
    }

    let email = form.email.trim();
    if email.is_empty() {
        return Ok(templates::render_reset_request(&req, &["Email is required".to_string()]));
    }

    let user = find_by_email(&state.db.conn(), email)?;
    if let Some(user) = user {
        let source = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        send_password_reset_email(&state, &user, &source)?;
    }

    // Same answer either way, so the form does not reveal which emails exist.
    Ok(flash_redirect(
        "/login",
        "Check your email for the instructions to reset your password",
    ))
}

fn reset_target(req: &HttpRequest, state: &AppState, token: &str) -> Result<Option<User>, ApiError> {
    if current_user(req, state)?.is_some() {
        return Ok(None);
    }
    Ok(verify_reset_password_token(&state.db.conn(), &state.config.secret_key, token))
}

pub async fn reset_password_page(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    match reset_target(&req, &state, &path)? {
        Some(_) => Ok(templates::render_reset_password(&req, &[])),
        None => Ok(redirect("/index")),
    }
}

pub async fn reset_password(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Form<ResetPasswordForm>,
) -> Result<HttpResponse, ApiError> {
    let user = match reset_target(&req, &state, &path)? {
        Some(u) => u,
        None => return Ok(redirect("/index")),
    };

    if form.password != form.password2 {
        return Ok(templates::render_reset_password(&req, &["Passwords must match".to_string()]));
    }

    match state.db.transaction(|tx| set_password(tx, user.id, &form.password)) {
        Ok(()) => {
            tracing::info!(user_id = user.id, "password reset");
            Ok(flash_redirect("/login", "Your password has been reset."))
        }
        Err(e) if e.is_user_facing() => Ok(templates::render_reset_password(&req, &[e.to_string()])),
        Err(e) => Err(e.into()),
    }
}
