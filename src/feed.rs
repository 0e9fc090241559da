//! Post listings: the followed-posts feed, the global explore stream and a
//! single author's posts, all paginated the same way.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::core::helpers::from_micros;
use crate::models::models::{Post, PostView};

const POST_COLUMNS: &str =
    "p.id AS id, p.body AS body, p.timestamp AS timestamp, p.user_id AS user_id, \
     u.username AS username, u.email AS email";

/// One page of an ordered result set.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page.saturating_mul(self.per_page) < self.total
    }

    pub fn prev_num(&self) -> Option<usize> {
        self.has_prev().then(|| self.page - 1)
    }

    pub fn next_num(&self) -> Option<usize> {
        self.page.checked_add(1).filter(|_| self.has_next())
    }
}

/// Which posts to list. Values are cheap and can be re-run any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostQuery {
    /// Posts by the users `user` follows, plus `user`'s own posts.
    Followed(i64),
    /// Every post.
    Explore,
    /// Posts written by one user.
    ByAuthor(i64),
}

impl PostQuery {
    fn from_clause(&self) -> String {
        match self {
            PostQuery::Followed(_) => format!(
                "(SELECT {cols} FROM posts p \
                    JOIN followers f ON f.followed_id = p.user_id \
                    JOIN users u ON u.id = p.user_id \
                    WHERE f.follower_id = ?1 \
                  UNION \
                  SELECT {cols} FROM posts p \
                    JOIN users u ON u.id = p.user_id \
                    WHERE p.user_id = ?1)",
                cols = POST_COLUMNS
            ),
            PostQuery::Explore => format!(
                "(SELECT {cols} FROM posts p JOIN users u ON u.id = p.user_id)",
                cols = POST_COLUMNS
            ),
            PostQuery::ByAuthor(_) => format!(
                "(SELECT {cols} FROM posts p JOIN users u ON u.id = p.user_id WHERE p.user_id = ?1)",
                cols = POST_COLUMNS
            ),
        }
    }

    fn user_param(&self) -> Option<i64> {
        match self {
            PostQuery::Followed(id) | PostQuery::ByAuthor(id) => Some(*id),
            PostQuery::Explore => None,
        }
    }

    pub fn count(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.from_clause());
        let total: i64 = match self.user_param() {
            Some(id) => conn.query_row(&sql, params![id], |r| r.get(0))?,
            None => conn.query_row(&sql, [], |r| r.get(0))?,
        };
        Ok(total.max(0) as usize)
    }

    /// Newest first; equal timestamps fall back to the higher post id first.
    fn fetch(&self, conn: &Connection, limit: i64, offset: i64) -> rusqlite::Result<Vec<PostView>> {
        let sql = format!(
            "SELECT id, body, timestamp, user_id, username, email FROM {} \
             ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3",
            self.from_clause()
        );
        let mut stmt = conn.prepare(&sql)?;
        // ?1 is unused by the explore listing; binding NULL to it is harmless.
        let rows = stmt.query_map(params![self.user_param(), limit, offset], post_view_from_row)?;
        rows.collect()
    }

    pub fn fetch_all(&self, conn: &Connection) -> rusqlite::Result<Vec<PostView>> {
        self.fetch(conn, -1, 0)
    }

    /// 1-based `page`; values below 1 are treated as 1.
    pub fn paginate(
        &self,
        conn: &Connection,
        page: usize,
        per_page: usize,
    ) -> rusqlite::Result<Page<PostView>> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = self.count(conn)?;
        let offset = (page - 1).saturating_mul(per_page);
        let items = if offset >= total {
            Vec::new()
        } else {
            self.fetch(conn, per_page as i64, offset as i64)?
        };

        Ok(Page {
            items,
            page,
            per_page,
            total,
        })
    }
}

fn post_view_from_row(row: &Row<'_>) -> rusqlite::Result<PostView> {
    Ok(PostView {
        post: Post {
            id: row.get(0)?,
            body: row.get(1)?,
            timestamp: from_micros(row.get(2)?),
            user_id: row.get(3)?,
        },
        author_username: row.get(4)?,
        author_email: row.get(5)?,
    })
}

/// The home feed for `user_id`.
pub fn followed_posts(
    conn: &Connection,
    user_id: i64,
    page: usize,
    per_page: usize,
) -> rusqlite::Result<Page<PostView>> {
    PostQuery::Followed(user_id).paginate(conn, page, per_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::Db;
    use crate::follow::{follow_user, unfollow_user};
    use crate::models::models::{NewUser, User};
    use crate::posts::insert_post_at;
    use crate::users::create_user;
    use chrono::{Duration, TimeZone, Utc};

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

    fn bodies(posts: &[PostView]) -> Vec<String> {
        posts.iter().map(|p| p.post.body.clone()).collect()
    }

    #[test]
    fn followed_posts_merge_own_and_followed_by_recency() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let u1 = user(&conn, "john");
        let u2 = user(&conn, "susan");
        let u3 = user(&conn, "mary");
        let u4 = user(&conn, "david");

        let t = Utc.with_ymd_and_hms(2018, 6, 27, 12, 0, 0).unwrap();
        insert_post_at(&conn, u1.id, "post from john", t + Duration::seconds(1)).unwrap();
        insert_post_at(&conn, u2.id, "post from susan", t + Duration::seconds(4)).unwrap();
        insert_post_at(&conn, u3.id, "post from mary", t + Duration::seconds(3)).unwrap();
        insert_post_at(&conn, u4.id, "post from david", t + Duration::seconds(2)).unwrap();

        follow_user(&conn, u1.id, u2.id).unwrap();
        follow_user(&conn, u1.id, u4.id).unwrap();
        follow_user(&conn, u2.id, u3.id).unwrap();
        follow_user(&conn, u3.id, u4.id).unwrap();

        let feed = |id| bodies(&PostQuery::Followed(id).fetch_all(&conn).unwrap());
        assert_eq!(feed(u1.id), vec!["post from susan", "post from david", "post from john"]);
        assert_eq!(feed(u2.id), vec!["post from susan", "post from mary"]);
        assert_eq!(feed(u3.id), vec!["post from mary", "post from david"]);
        assert_eq!(feed(u4.id), vec!["post from david"]);
    }

    #[test]
    fn unfollowing_removes_posts_from_feed() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        let b = user(&conn, "b");
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        insert_post_at(&conn, b.id, "from b", t).unwrap();

        follow_user(&conn, a.id, b.id).unwrap();
        assert_eq!(PostQuery::Followed(a.id).count(&conn).unwrap(), 1);
        unfollow_user(&conn, a.id, b.id).unwrap();
        assert_eq!(PostQuery::Followed(a.id).count(&conn).unwrap(), 0);
    }

    #[test]
    fn equal_timestamps_order_by_newest_id() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let first = insert_post_at(&conn, a.id, "first", t).unwrap();
        let second = insert_post_at(&conn, a.id, "second", t).unwrap();

        let ids: Vec<i64> = PostQuery::ByAuthor(a.id)
            .fetch_all(&conn)
            .unwrap()
            .iter()
            .map(|p| p.post.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn pagination_boundaries() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for i in 0..7 {
            insert_post_at(&conn, a.id, &format!("p{}", i), t + Duration::seconds(i)).unwrap();
        }

        let all = bodies(&PostQuery::Explore.fetch_all(&conn).unwrap());
        assert_eq!(all.len(), 7);

        let first = followed_posts(&conn, a.id, 1, 3).unwrap();
        assert_eq!(bodies(&first.items), all[0..3]);
        assert!(!first.has_prev());
        assert!(first.has_next());
        assert_eq!(first.next_num(), Some(2));
        assert_eq!(first.prev_num(), None);

        let second = followed_posts(&conn, a.id, 2, 3).unwrap();
        assert_eq!(bodies(&second.items), all[3..6]);
        assert!(second.has_prev());
        assert!(second.has_next());

        let last = followed_posts(&conn, a.id, 3, 3).unwrap();
        assert_eq!(bodies(&last.items), all[6..7]);
        assert!(last.has_prev());
        assert!(!last.has_next());

        let beyond = followed_posts(&conn, a.id, 9, 3).unwrap();
        assert!(beyond.items.is_empty());
        assert!(!beyond.has_next());
        assert_eq!(beyond.total, 7);

        let clamped = followed_posts(&conn, a.id, 0, 3).unwrap();
        assert_eq!(clamped.page, 1);
    }

    #[test]
    fn huge_page_numbers_do_not_overflow() {
        let page: Page<()> = Page {
            items: Vec::new(),
            page: usize::MAX,
            per_page: 25,
            total: 3,
        };
        assert!(!page.has_next());
        assert_eq!(page.next_num(), None);
        assert_eq!(page.prev_num(), Some(usize::MAX - 1));

        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        insert_post_at(&conn, a.id, "only", Utc::now()).unwrap();
        let far = followed_posts(&conn, a.id, usize::MAX, 3).unwrap();
        assert!(far.items.is_empty());
        assert!(!far.has_next());
    }

    #[test]
    fn exact_multiple_of_page_size_has_no_next() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for i in 0..6 {
            insert_post_at(&conn, a.id, "x", t + Duration::seconds(i)).unwrap();
        }
        let page = PostQuery::ByAuthor(a.id).paginate(&conn, 2, 3).unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(!page.has_next());
    }

    #[test]
    fn author_listing_excludes_followed_users() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn();
        let a = user(&conn, "a");
        let b = user(&conn, "b");
        let t = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        insert_post_at(&conn, a.id, "mine", t).unwrap();
        insert_post_at(&conn, b.id, "theirs", t).unwrap();
        follow_user(&conn, a.id, b.id).unwrap();

        assert_eq!(bodies(&PostQuery::ByAuthor(a.id).fetch_all(&conn).unwrap()), vec!["mine"]);
        assert_eq!(PostQuery::Explore.count(&conn).unwrap(), 2);
    }
}
