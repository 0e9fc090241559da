use actix_web::{web, HttpRequest, HttpResponse};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Deserialize;

use crate::auth::{current_user, login_required, start_session};
use crate::config::*;
use crate::core::errors::{ApiError, StoreError};
use crate::core::helpers::{char_len, from_micros, hash_password, now, redirect, to_micros, validate_email};
use crate::core::query_params::{get_page, page_url, parse_query};
use crate::feed::PostQuery;
use crate::follow::{follower_count, followed_count, is_following};
use crate::models::models::{NewUser, User};
use crate::templates::{self, flash_redirect};
use crate::AppState;

const USER_COLUMNS: &str = "id, username, email, password_hash, about_me, last_seen";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        about_me: row.get(4)?,
        last_seen: from_micros(row.get(5)?),
    })
}

fn find_one(conn: &Connection, column: &str, value: &dyn rusqlite::ToSql) -> Result<Option<User>, StoreError> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    Ok(conn.query_row(&sql, &[value], user_from_row).optional()?)
}

pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<User>, StoreError> {
    find_one(conn, "id", &id)
}

pub fn find_by_username(conn: &Connection, username: &str) -> Result<Option<User>, StoreError> {
    find_one(conn, "username", &username)
}

pub fn find_by_email(conn: &Connection, email: &str) -> Result<Option<User>, StoreError> {
    find_one(conn, "email", &email)
}

fn validate_username(username: &str) -> Result<(), StoreError> {
    if username.is_empty() {
        return Err(StoreError::Validation("Username is required".to_string()));
    }
    if char_len(username) > MAX_USERNAME_LENGTH {
        return Err(StoreError::Validation(format!(
            "Please enter a username of at most {} characters",
            MAX_USERNAME_LENGTH
        )));
    }
    Ok(())
}

/// Turns a unique-constraint failure into the matching domain error.
fn map_unique_violation(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(e, Some(msg)) = &err {
        if e.code == ErrorCode::ConstraintViolation {
            if msg.contains("users.username") {
                return StoreError::UsernameTaken;
            }
            if msg.contains("users.email") {
                return StoreError::EmailTaken;
            }
        }
    }
    StoreError::Sqlite(err)
}

pub fn create_user(conn: &Connection, new_user: NewUser<'_>) -> Result<User, StoreError> {
    let username = new_user.username.trim();
    let email = new_user.email.trim();

    validate_username(username)?;
    if !validate_email(email) {
        return Err(StoreError::Validation("Invalid email address".to_string()));
    }
    if new_user.password.is_empty() {
        return Err(StoreError::Validation("Password is required".to_string()));
    }
    if find_by_username(conn, username)?.is_some() {
        return Err(StoreError::UsernameTaken);
    }
    if find_by_email(conn, email)?.is_some() {
        return Err(StoreError::EmailTaken);
    }

    let password_hash = hash_password(new_user.password)?;
    let last_seen = now();
    conn.execute(
        "INSERT INTO users (username, email, password_hash, about_me, last_seen) VALUES (?1, ?2, ?3, NULL, ?4)",
        params![username, email, password_hash, to_micros(&last_seen)],
    )
    .map_err(map_unique_violation)?;

    Ok(User {
        id: conn.last_insert_rowid(),
        username: username.to_string(),
        email: email.to_string(),
        password_hash,
        about_me: None,
        last_seen,
    })
}

pub fn update_profile(
    conn: &Connection,
    user_id: i64,
    username: &str,
    about_me: &str,
) -> Result<User, StoreError> {
    let mut user = find_by_id(conn, user_id)?.ok_or_else(|| StoreError::NotFound("User".to_string()))?;
    let username = username.trim();
    let about_me = about_me.trim();

    validate_username(username)?;
    if char_len(about_me) > MAX_ABOUT_ME_LENGTH {
        return Err(StoreError::Validation(format!(
            "About me must be at most {} characters",
            MAX_ABOUT_ME_LENGTH
        )));
    }
    if username != user.username && find_by_username(conn, username)?.is_some() {
        return Err(StoreError::UsernameTaken);
    }

    let about_me = (!about_me.is_empty()).then(|| about_me.to_string());
    conn.execute(
        "UPDATE users SET username = ?1, about_me = ?2 WHERE id = ?3",
        params![username, about_me, user_id],
    )
    .map_err(map_unique_violation)?;

    user.username = username.to_string();
    user.about_me = about_me;
    Ok(user)
}

pub fn set_password(conn: &Connection, user_id: i64, password: &str) -> Result<(), StoreError> {
    if password.is_empty() {
        return Err(StoreError::Validation("Password is required".to_string()));
    }
    let password_hash = hash_password(password)?;
    let changed = conn.execute(
        "UPDATE users SET password_hash = ?1 WHERE id = ?2",
        params![password_hash, user_id],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound("User".to_string()));
    }
    Ok(())
}

pub fn touch_last_seen(conn: &Connection, user_id: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE users SET last_seen = ?1 WHERE id = ?2",
        params![to_micros(&now()), user_id],
    )?;
    Ok(())
}

// === HTTP Handlers ===

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct RegistrationForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password2: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct EditProfileForm {
    pub username: String,
    pub about_me: String,
}

pub async fn register_page(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    if current_user(&req, &state)?.is_some() {
        return Ok(redirect("/index"));
    }
    Ok(templates::render_register(&req, &RegistrationForm::default(), &[]))
}

pub async fn register(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<RegistrationForm>,
) -> Result<HttpResponse, ApiError> {
    if current_user(&req, &state)?.is_some() {
        return Ok(redirect("/index"));
    }

    if form.password != form.password2 {
        let errors = vec!["Passwords must match".to_string()];
        return Ok(templates::render_register(&req, &form, &errors));
    }

    let created = state.db.transaction(|tx| {
        create_user(
            tx,
            NewUser {
                username: &form.username,
                email: &form.email,
                password: &form.password,
            },
        )
    });

    let user = match created {
        Ok(user) => user,
        Err(e) if e.is_user_facing() => {
            return Ok(templates::render_register(&req, &form, &[e.to_string()]));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(user_id = user.id, username = %user.username, "registered new user");

    let cookie = start_session(&state, user.id, false)?;
    let mut resp = flash_redirect("/index", &format!("Thank you for registering, {}", user.username));
    resp.add_cookie(&cookie).map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(resp)
}

pub async fn user_profile(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let viewer = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    let username = path.into_inner();
    let page = get_page(&parse_query(req.query_string()));

    let conn = state.db.conn();
    let user = find_by_username(&conn, &username)?
        .ok_or_else(|| ApiError::NotFound(format!("User {} not found", username)))?;

    let posts = PostQuery::ByAuthor(user.id).paginate(&conn, page, state.config.posts_per_page)?;
    let profile = templates::Profile {
        followers: follower_count(&conn, user.id)?,
        following: followed_count(&conn, user.id)?,
        viewer_follows: is_following(&conn, viewer.id, user.id)?,
        user: &user,
    };
    drop(conn);

    let base = format!("/user/{}", urlencoding::encode(&user.username));
    let links = templates::PageLinks {
        prev: posts.prev_num().map(|n| page_url(&base, n)),
        next: posts.next_num().map(|n| page_url(&base, n)),
    };

    Ok(templates::render_profile(&req, &viewer, &profile, &posts.items, &links))
}

pub async fn edit_profile_page(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    let form = EditProfileForm {
        username: user.username.clone(),
        about_me: user.about_me.clone().unwrap_or_default(),
    };
    Ok(templates::render_edit_profile(&req, &user, &form, &[]))
}

pub async fn edit_profile(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<EditProfileForm>,
) -> Result<HttpResponse, ApiError> {
    let user = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    match state
        .db
        .transaction(|tx| update_profile(tx, user.id, &form.username, &form.about_me))
    {
        Ok(_) => Ok(flash_redirect("/edit_profile", "Your changes have been saved.")),
        Err(e) if e.is_user_facing() => Ok(templates::render_edit_profile(&req, &user, &form, &[e.to_string()])),
        Err(e) => Err(e.into()),
    }
}
