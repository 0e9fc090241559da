use actix_web::{web, HttpRequest, HttpResponse};
use rusqlite::{params, Connection};

use crate::auth::{current_user, login_required};
use crate::core::errors::{ApiError, StoreError};
use crate::models::models::{Followers, Followings};
use crate::templates::flash_redirect;
use crate::users::find_by_username;
use crate::AppState;

/// Adds the edge `follower_id -> followed_id`. Returns whether a new edge was
/// written; following someone twice is a no-op.
pub fn follow_user(conn: &Connection, follower_id: i64, followed_id: i64) -> Result<bool, StoreError> {
    if follower_id == followed_id {
        return Err(StoreError::SelfFollow);
    }

    // The unique (follower_id, followed_id) pair makes concurrent follows collapse to one row.
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO followers (follower_id, followed_id) VALUES (?1, ?2)",
        params![follower_id, followed_id],
    )?;

    Ok(inserted > 0)
}

/// Removes the edge if present. Returns whether anything was removed.
pub fn unfollow_user(conn: &Connection, follower_id: i64, followed_id: i64) -> Result<bool, StoreError> {
    let removed = conn.execute(
        "DELETE FROM followers WHERE follower_id = ?1 AND followed_id = ?2",
        params![follower_id, followed_id],
    )?;

    Ok(removed > 0)
}

pub fn is_following(conn: &Connection, follower_id: i64, followed_id: i64) -> Result<bool, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM followers WHERE follower_id = ?1 AND followed_id = ?2)",
        params![follower_id, followed_id],
        |r| r.get(0),
    )?;
    Ok(exists)
}

/// How many users `user_id` follows.
pub fn followed_count(conn: &Connection, user_id: i64) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM followers WHERE follower_id = ?1",
        params![user_id],
        |r| r.get(0),
    )?;
    Ok(n as usize)
}

/// How many users follow `user_id`.
pub fn follower_count(conn: &Connection, user_id: i64) -> Result<usize, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM followers WHERE followed_id = ?1",
        params![user_id],
        |r| r.get(0),
    )?;
    Ok(n as usize)
}

fn collect_ids(conn: &Connection, sql: &str, user_id: i64) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![user_id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

pub fn get_followings(conn: &Connection, user_id: i64) -> Result<Followings, StoreError> {
    collect_ids(
        conn,
        "SELECT followed_id FROM followers WHERE follower_id = ?1 ORDER BY followed_id",
        user_id,
    )
}

pub fn get_followers(conn: &Connection, user_id: i64) -> Result<Followers, StoreError> {
    collect_ids(
        conn,
        "SELECT follower_id FROM followers WHERE followed_id = ?1 ORDER BY follower_id",
        user_id,
    )
}

// === HTTP Handlers ===

#[derive(Clone, Copy)]
enum Action {
    Follow,
    Unfollow,
}

async fn change_follow(
    req: HttpRequest,
    state: web::Data<AppState>,
    username: String,
    action: Action,
) -> Result<HttpResponse, ApiError> {
    let user = match current_user(&req, &state)? {
        Some(u) => u,
        None => return Ok(login_required(&req)),
    };

    let outcome = state.db.transaction(|tx| {
        let target = match find_by_username(tx, &username)? {
            Some(t) => t,
            None => return Ok(None),
        };
        match action {
            Action::Follow => follow_user(tx, user.id, target.id)?,
            Action::Unfollow if target.id == user.id => return Err(StoreError::SelfFollow),
            Action::Unfollow => unfollow_user(tx, user.id, target.id)?,
        };
        Ok(Some(target))
    });

    let profile = format!("/user/{}", urlencoding::encode(&username));
    match (outcome, action) {
        (Ok(None), _) => Ok(flash_redirect("/index", &format!("User {} not found.", username))),
        (Err(StoreError::SelfFollow), Action::Follow) => {
            Ok(flash_redirect(&profile, "You cannot follow yourself!"))
        }
        (Err(StoreError::SelfFollow), Action::Unfollow) => {
            Ok(flash_redirect(&profile, "You cannot unfollow yourself!"))
        }
        (Err(e), _) => Err(e.into()),
        (Ok(Some(target)), Action::Follow) => {
            tracing::debug!(follower = user.id, followed = target.id, "follow");
            Ok(flash_redirect(&profile, &format!("You are following {}!", username)))
        }
        (Ok(Some(target)), Action::Unfollow) => {
            tracing::debug!(follower = user.id, followed = target.id, "unfollow");
            Ok(flash_redirect(&profile, &format!("You are not following {}.", username)))
        }
    }
}

pub async fn handle_follow(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    change_follow(req, state, path.into_inner(), Action::Follow).await
}

pub async fn handle_unfollow(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    change_follow(req, state, path.into_inner(), Action::Unfollow).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::Db;
    use crate::models::models::{NewUser, User};
    use crate::users::create_user;

    fn user(conn: &Connection, name: &str) -> User {
        create_user(
            conn,
            NewUser {
                username: name,
                email: &format!("{}@example.com", name),
                password: "pw",
            },
        )
        .unwrap()
    }

    #[test]
    fn follow_then_unfollow_restores_counts() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let john = user(&conn, "john");
        let susan = user(&conn, "susan");

        assert!(!is_following(&conn, john.id, susan.id).unwrap());
        assert_eq!(followed_count(&conn, john.id).unwrap(), 0);
        assert_eq!(follower_count(&conn, susan.id).unwrap(), 0);

        assert!(follow_user(&conn, john.id, susan.id).unwrap());
        assert!(is_following(&conn, john.id, susan.id).unwrap());
        assert_eq!(followed_count(&conn, john.id).unwrap(), 1);
        assert_eq!(follower_count(&conn, susan.id).unwrap(), 1);
        assert_eq!(get_followings(&conn, john.id).unwrap(), vec![susan.id]);
        assert_eq!(get_followers(&conn, susan.id).unwrap(), vec![john.id]);

        assert!(unfollow_user(&conn, john.id, susan.id).unwrap());
        assert!(!is_following(&conn, john.id, susan.id).unwrap());
        assert_eq!(followed_count(&conn, john.id).unwrap(), 0);
        assert_eq!(follower_count(&conn, susan.id).unwrap(), 0);
    }

    #[test]
    fn edges_are_directed() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let john = user(&conn, "john");
        let susan = user(&conn, "susan");

        follow_user(&conn, john.id, susan.id).unwrap();
        assert!(!is_following(&conn, susan.id, john.id).unwrap());
        assert_eq!(followed_count(&conn, susan.id).unwrap(), 0);
        assert_eq!(follower_count(&conn, john.id).unwrap(), 0);
    }

    #[test]
    fn following_twice_keeps_one_edge() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let john = user(&conn, "john");
        let susan = user(&conn, "susan");

        assert!(follow_user(&conn, john.id, susan.id).unwrap());
        assert!(!follow_user(&conn, john.id, susan.id).unwrap());
        assert_eq!(followed_count(&conn, john.id).unwrap(), 1);

        assert!(unfollow_user(&conn, john.id, susan.id).unwrap());
        assert!(!unfollow_user(&conn, john.id, susan.id).unwrap());
    }

    #[test]
    fn self_follow_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let john = user(&conn, "john");

        assert!(matches!(follow_user(&conn, john.id, john.id), Err(StoreError::SelfFollow)));
        assert_eq!(followed_count(&conn, john.id).unwrap(), 0);
    }

    #[test]
    fn id_sets_are_sorted() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        let b = user(&conn, "b");
        let c = user(&conn, "c");

        follow_user(&conn, a.id, c.id).unwrap();
        follow_user(&conn, a.id, b.id).unwrap();
        follow_user(&conn, b.id, c.id).unwrap();

        assert_eq!(get_followings(&conn, a.id).unwrap(), vec![b.id, c.id]);
        assert_eq!(get_followers(&conn, c.id).unwrap(), vec![a.id, b.id]);
    }
}
