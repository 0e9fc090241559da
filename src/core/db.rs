use std::sync::{Mutex, MutexGuard};

use chrono::Duration;
use rusqlite::{Connection, Transaction};

use crate::core::errors::StoreError;
use crate::core::helpers::now;
use crate::follow::follow_user;
use crate::models::models::NewUser;
use crate::posts::insert_post_at;
use crate::users::{create_user, find_by_username};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        username      TEXT NOT NULL UNIQUE,
        email         TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        about_me      TEXT,
        last_seen     INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS posts (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        body      TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        user_id   INTEGER NOT NULL REFERENCES users(id)
    );
    CREATE INDEX IF NOT EXISTS idx_posts_timestamp ON posts(timestamp);
    CREATE INDEX IF NOT EXISTS idx_posts_user_id ON posts(user_id);

    CREATE TABLE IF NOT EXISTS followers (
        follower_id INTEGER NOT NULL REFERENCES users(id),
        followed_id INTEGER NOT NULL REFERENCES users(id),
        UNIQUE (follower_id, followed_id)
    );
    CREATE INDEX IF NOT EXISTS idx_followers_followed ON followers(followed_id);

    CREATE TABLE IF NOT EXISTS sessions (
        token      TEXT PRIMARY KEY,
        user_id    INTEGER NOT NULL REFERENCES users(id),
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
";

/// Shared handle to the SQLite database.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Opens the database named by a `sqlite://path` url (or `sqlite::memory:`)
    /// and makes sure the schema exists.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let conn = match url {
            "sqlite::memory:" | ":memory:" => Connection::open_in_memory()?,
            _ => Connection::open(url.trim_start_matches("sqlite://"))?,
        };
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Db {
            conn: Mutex::new(conn),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind, so the poisoned connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` inside one transaction. Commits on `Ok`, rolls back otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Seeds the demo accounts used for local development. Safe to call repeatedly.
pub fn init_test_data(db: &Db) -> Result<(), StoreError> {
    db.transaction(|tx| {
        if find_by_username(tx, "test")?.is_some() {
            return Ok(());
        }

        let base = now() - Duration::minutes(10);

        let test = create_user(
            tx,
            NewUser {
                username: "test",
                email: "test@microblog.local",
                password: "test",
            },
        )?;
        insert_post_at(tx, test.id, "This is my first post on Microblog!", base)?;

        let alice = create_user(
            tx,
            NewUser {
                username: "alice",
                email: "alice@microblog.local",
                password: "alice",
            },
        )?;
        insert_post_at(
            tx,
            alice.id,
            "Welcome to my blog! Excited to share thoughts here.",
            base + Duration::minutes(1),
        )?;
        insert_post_at(
            tx,
            alice.id,
            "Just finished an amazing project. Feeling productive today!",
            base + Duration::minutes(2),
        )?;

        let bob = create_user(
            tx,
            NewUser {
                username: "bob",
                email: "bob@microblog.local",
                password: "bob",
            },
        )?;
        insert_post_at(
            tx,
            bob.id,
            "Hey everyone! Just joined, looking forward to connecting with you all.",
            base + Duration::minutes(3),
        )?;

        follow_user(tx, test.id, bob.id)?;
        tracing::info!("seeded demo users test, alice and bob");
        Ok(())
    })
}
