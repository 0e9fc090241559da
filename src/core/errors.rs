use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Failures raised by the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Please use a different username")]
    UsernameTaken,

    #[error("Email already in use")]
    EmailTaken,

    #[error("You cannot follow yourself!")]
    SelfFollow,

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Failed to hash password: {0}")]
    Hashing(String),
}

impl StoreError {
    /// Errors a user can fix by resubmitting the form.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, StoreError::Sqlite(_) | StoreError::Hashing(_))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal Error: {0}")]
    InternalError(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let html = match self {
            ApiError::NotFound(_) => crate::templates::render_not_found(),
            ApiError::InternalError(msg) => {
                tracing::error!(error = %msg, "request failed");
                crate::templates::render_server_error()
            }
            other => crate::templates::render_error(status.as_u16(), &other.to_string()),
        };

        HttpResponse::build(status)
            .content_type("text/html; charset=utf-8")
            .body(html)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UsernameTaken | StoreError::EmailTaken => ApiError::Conflict(err.to_string()),
            StoreError::SelfFollow | StoreError::Validation(_) => ApiError::BadRequest(err.to_string()),
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Sqlite(e) => ApiError::InternalError(e.to_string()),
            StoreError::Hashing(msg) => ApiError::InternalError(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        assert_eq!(ApiError::from(StoreError::UsernameTaken).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(StoreError::SelfFollow).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(StoreError::NotFound("User".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows)).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_pages_carry_status_and_message() {
        let resp = ApiError::from(StoreError::SelfFollow).error_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError::from(StoreError::UsernameTaken).error_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError::NotFound("User bob".into()).error_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn only_storage_failures_are_hidden_from_users() {
        assert!(StoreError::EmailTaken.is_user_facing());
        assert!(StoreError::Validation("too long".into()).is_user_facing());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_user_facing());
    }
}
