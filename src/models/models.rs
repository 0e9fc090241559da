use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub about_me: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl User {
    /// Gravatar identicon for this account, keyed by the normalized email.
    pub fn avatar(&self, size: u32) -> String {
        avatar_url(&self.email, size)
    }

    pub fn check_password(&self, password: &str) -> bool {
        crate::core::helpers::verify_password(password, &self.password_hash)
    }
}

pub fn avatar_url(email: &str, size: u32) -> String {
    let digest = Md5::digest(email.trim().to_lowercase().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("https://www.gravatar.com/avatar/{}?d=identicon&s={}", hex, size)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Post {
    pub id: i64,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: i64,
}

/// A post joined with the author fields a view needs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PostView {
    pub post: Post,
    pub author_username: String,
    pub author_email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionData {
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

pub type Followings = Vec<i64>;
pub type Followers = Vec<i64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_is_derived_from_normalized_email() {
        assert_eq!(
            avatar_url("john@example.com", 128),
            "https://www.gravatar.com/avatar/d4c74594d841139328695756648b6bd6?d=identicon&s=128"
        );
        assert_eq!(avatar_url("  John@Example.COM ", 128), avatar_url("john@example.com", 128));
    }

    #[test]
    fn avatar_size_is_passed_through() {
        assert!(avatar_url("a@b.c", 36).ends_with("&s=36"));
    }
}
