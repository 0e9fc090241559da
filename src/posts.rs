use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Deserialize;

use crate::auth::{current_user, login_required};
use crate::config::*;
use crate::core::errors::{ApiError, StoreError};
use crate::core::helpers::{char_len, now, to_micros};
use crate::core::query_params::{get_page, page_url, parse_query};
use crate::feed::{followed_posts, PostQuery};
use crate::models::models::{Post, User};
use crate::templates::{self, flash_redirect, PageLinks};
use crate::AppState;

fn validate_body(body: &str) -> Result<(), StoreError> {
    if body.is_empty() {
        return Err(StoreError::Validation("Post must not be empty".to_string()));
    }
    let len = char_len(body);
    if len > MAX_POST_LENGTH {
        return Err(StoreError::Validation(format!(
            "Must be at most {} characters (you used {})",
            MAX_POST_LENGTH, len
        )));
    }
    Ok(())
}

/// Stores a post with an explicit timestamp. Posts are never edited afterwards.
pub fn insert_post_at(
    conn: &Connection,
    author_id: i64,
    body: &str,
    timestamp: DateTime<Utc>,
) -> Result<Post, StoreError> {
    let body = body.trim();
    validate_body(body)?;

    conn.execute(
        "INSERT INTO posts (body, timestamp, user_id) VALUES (?1, ?2, ?3)",
        params![body, to_micros(&timestamp), author_id],
    )?;

    Ok(Post {
        id: conn.last_insert_rowid(),
        body: body.to_string(),
        timestamp,
        user_id: author_id,
    })
}

pub fn create_post(conn: &Connection, author_id: i64, body: &str) -> Result<Post, StoreError> {
    insert_post_at(conn, author_id, body, now())
}

// === HTTP Handlers ===

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct PostForm {
    pub post: String,
}

fn render_home(
    req: &HttpRequest,
    state: &AppState,
    user: &User,
    form: &PostForm,
    errors: &[String],
) -> Result<HttpResponse, ApiError> {
    let page = get_page(&parse_query(req.query_string()));
    let posts = followed_posts(&state.db.conn(), user.id, page, state.config.posts_per_page)?;
    let links = PageLinks {
        prev: posts.prev_num().map(|n| page_url("/index", n)),
        next: posts.next_num().map(|n| page_url("/index", n)),
    };
    Ok(templates::render_index(req, user, "Home", Some((form, errors)), &posts.items, &links))
}

pub async fn index(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    render_home(&req, &state, &user, &PostForm::default(), &[])
}

pub async fn submit_post(
    req: HttpRequest,
    state: web::Data<AppState>,
    form: web::Form<PostForm>,
) -> Result<HttpResponse, ApiError> {
    let user = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    match state.db.transaction(|tx| create_post(tx, user.id, &form.post)) {
        Ok(post) => {
            tracing::info!(post_id = post.id, user_id = user.id, "post created");
            Ok(flash_redirect("/index", "Your post is now live!"))
        }
        Err(e) if e.is_user_facing() => render_home(&req, &state, &user, &form, &[e.to_string()]),
        Err(e) => Err(e.into()),
    }
}

pub async fn explore(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let user = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    let page = get_page(&parse_query(req.query_string()));
    let posts = PostQuery::Explore.paginate(&state.db.conn(), page, state.config.posts_per_page)?;
    let links = PageLinks {
        prev: posts.prev_num().map(|n| page_url("/explore", n)),
        next: posts.next_num().map(|n| page_url("/explore", n)),
    };

    Ok(templates::render_index(&req, &user, "Explore", None, &posts.items, &links))
}
