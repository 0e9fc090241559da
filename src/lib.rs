use actix_web::{web, HttpResponse};

pub mod auth;
pub mod config;
pub mod core;
pub mod email;
pub mod feed;
pub mod follow;
pub mod models;
pub mod posts;
pub mod templates;
pub mod users;

use crate::config::Config;
use crate::core::db::Db;
use crate::core::errors::ApiError;
use crate::email::MailQueue;

/// Everything a request handler needs. Shared across workers.
pub struct AppState {
    pub db: Db,
    pub config: Config,
    pub mail: MailQueue,
}

async fn not_found() -> Result<HttpResponse, ApiError> {
    Err(ApiError::NotFound("No route found".to_string()))
}

/// Registers every route of the application.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(posts::index))
        .route("/", web::post().to(posts::submit_post))
        .route("/index", web::get().to(posts::index))
        .route("/index", web::post().to(posts::submit_post))
        .route("/explore", web::get().to(posts::explore))
        .route("/login", web::get().to(auth::login_page))
        .route("/login", web::post().to(auth::login_user))
        .route("/logout", web::get().to(auth::logout_user))
        .route("/register", web::get().to(users::register_page))
        .route("/register", web::post().to(users::register))
        .route("/user/{username}", web::get().to(users::user_profile))
        .route("/follow/{username}", web::get().to(follow::handle_follow))
        .route("/unfollow/{username}", web::get().to(follow::handle_unfollow))
        .route("/edit_profile", web::get().to(users::edit_profile_page))
        .route("/edit_profile", web::post().to(users::edit_profile))
        .route("/reset_password_request", web::get().to(auth::reset_password_request_page))
        .route("/reset_password_request", web::post().to(auth::reset_password_request))
        .route("/reset_password/{token}", web::get().to(auth::reset_password_page))
        .route("/reset_password/{token}", web::post().to(auth::reset_password))
        .route("/static/{file:.*}", web::get().to(core::static_server::serve_static))
        .default_service(web::to(not_found));
}
