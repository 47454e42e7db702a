use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::models::*;

pub mod feed;
pub mod friends;

use feed::FeedQueryEngine;
use friends::{FriendGraphStore, FriendRequestWorkflow};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Users cannot befriend themselves")]
    SelfFriendship,
    #[error("Users are already friends")]
    AlreadyFriends,
    #[error("Friend request already pending")]
    DuplicateRequest,
    #[error("Friend request not found")]
    RequestNotFound,
    #[error("Friendship pair out of sync: deleted {deleted} of 2 rows")]
    BrokenSymmetry { deleted: usize },
    #[error("Limit must be positive, got {0}")]
    InvalidLimit(i64),
    #[error("Malformed feed cursor")]
    BadCursor,
    #[error("latitude, longitude and radius_km must be supplied together")]
    IncompleteGeoFilter,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe SQLite store
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        configure_connection(&conn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store for testing
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Friend-graph storage port sharing this store's connection.
    pub fn friend_graph(&self) -> FriendGraphStore {
        FriendGraphStore::new(self.conn.clone())
    }

    /// Friend-request workflow layered on the friend graph.
    pub fn friend_requests(&self) -> FriendRequestWorkflow {
        FriendRequestWorkflow::new(self.conn.clone())
    }

    /// Feed query engine sharing this store's connection.
    pub fn feed(&self) -> FeedQueryEngine {
        FeedQueryEngine::new(self.conn.clone())
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE NOT NULL,
                display_name TEXT DEFAULT '',
                bio TEXT DEFAULT '',
                avatar_url TEXT DEFAULT '',
                is_admin INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                password_hash TEXT,
                provider_uid TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, provider),
                CHECK ((password_hash IS NULL) <> (provider_uid IS NULL)),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS friend_requests (
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (sender_id, receiver_id),
                CHECK (sender_id <> receiver_id),
                FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (receiver_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS friends (
                user_id TEXT NOT NULL,
                friend_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, friend_id),
                CHECK (user_id <> friend_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (friend_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS car_models (
                id TEXT PRIMARY KEY,
                make TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(make, name)
            );

            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                car_model_id TEXT NOT NULL,
                image_path TEXT NOT NULL,
                description TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (car_model_id) REFERENCES car_models(id)
            );

            CREATE INDEX IF NOT EXISTS idx_posts_feed ON posts(created_at DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_posts_user_id ON posts(user_id);
            CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver ON friend_requests(receiver_id);
            "#,
        )?;
        Ok(())
    }

    // ==================== User Operations ====================

    pub fn create_user(&self, user: &mut User) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        user.id = Uuid::new_v4().to_string();
        let created = now();
        user.created_at = created;
        user.updated_at = created;

        conn.execute(
            r#"INSERT INTO users (id, username, email, display_name, bio, avatar_url,
                is_admin, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                &user.id,
                &user.username,
                &user.email,
                &user.display_name,
                &user.bio,
                &user.avatar_url,
                user.is_admin,
                fmt_ts(&user.created_at),
                fmt_ts(&user.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, email, display_name, bio, avatar_url, is_admin, created_at, updated_at
             FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("User {}", id)),
            _ => StoreError::Database(e),
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, email, display_name, bio, avatar_url, is_admin, created_at, updated_at
             FROM users WHERE username = ?1",
            params![username],
            row_to_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound(format!("User {}", username))
            }
            _ => StoreError::Database(e),
        })
    }

    /// Delete a user. Foreign-key cascades remove credentials, both
    /// directions of every friendship, all pending requests and all posts
    /// in the same statement, so nothing is ever left dangling.
    pub fn delete_user(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("User {}", id)));
        }
        Ok(())
    }

    // ==================== Credential Operations ====================

    pub fn create_password_credential(&self, user_id: &str, password_hash: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO credentials (user_id, provider, password_hash, provider_uid, created_at)
               VALUES (?1, 'password', ?2, NULL, ?3)"#,
            params![user_id, password_hash, fmt_ts(&now())],
        )?;
        Ok(())
    }

    pub fn create_google_credential(&self, user_id: &str, google_uid: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO credentials (user_id, provider, password_hash, provider_uid, created_at)
               VALUES (?1, 'google', NULL, ?2, ?3)"#,
            params![user_id, google_uid, fmt_ts(&now())],
        )?;
        Ok(())
    }

    pub fn password_hash_for(&self, user_id: &str) -> StoreResult<String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT password_hash FROM credentials WHERE user_id = ?1 AND provider = 'password'",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound(format!("Password credential for user {}", user_id))
            }
            _ => StoreError::Database(e),
        })
    }

    pub fn find_user_by_google_uid(&self, google_uid: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"SELECT u.id, u.username, u.email, u.display_name, u.bio, u.avatar_url,
                      u.is_admin, u.created_at, u.updated_at
               FROM users u
               JOIN credentials c ON c.user_id = u.id
               WHERE c.provider = 'google' AND c.provider_uid = ?1"#,
            params![google_uid],
            row_to_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound("Google credential".to_string())
            }
            _ => StoreError::Database(e),
        })
    }

    // ==================== Car Model Operations ====================

    pub fn create_car_model(&self, model: &mut CarModel) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        model.id = Uuid::new_v4().to_string();
        model.created_at = now();

        conn.execute(
            "INSERT INTO car_models (id, make, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![&model.id, &model.make, &model.name, fmt_ts(&model.created_at)],
        )?;
        Ok(())
    }

    pub fn list_car_models(&self) -> StoreResult<Vec<CarModel>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, make, name, created_at FROM car_models ORDER BY make ASC, name ASC",
        )?;
        let models = stmt
            .query_map([], |row| {
                Ok(CarModel {
                    id: row.get("id")?,
                    make: row.get("make")?,
                    name: row.get("name")?,
                    created_at: parse_datetime(row.get::<_, String>("created_at")?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(models)
    }

    // ==================== Post Operations ====================

    /// Insert a new sighting. Post ids are UUIDv7 so `(created_at, id)` is a
    /// total order with a decisive id tie-break under TEXT comparison.
    pub fn create_post(&self, post: &mut Post) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        post.id = Uuid::now_v7().to_string();
        let created = now();
        post.created_at = created;
        post.updated_at = created;

        conn.execute(
            r#"INSERT INTO posts (id, user_id, car_model_id, image_path, description,
                latitude, longitude, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                &post.id,
                &post.user_id,
                &post.car_model_id,
                &post.image_path,
                &post.description,
                post.latitude,
                post.longitude,
                fmt_ts(&post.created_at),
                fmt_ts(&post.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_post(&self, id: &str) -> StoreResult<Post> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, user_id, car_model_id, image_path, description, latitude, longitude, created_at, updated_at
             FROM posts WHERE id = ?1",
            params![id],
            row_to_post,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("Post {}", id)),
            _ => StoreError::Database(e),
        })
    }

    /// Posts are immutable except for their description.
    pub fn update_post_description(&self, post: &mut Post) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        post.updated_at = now();

        let rows = conn.execute(
            "UPDATE posts SET description = ?1, updated_at = ?2 WHERE id = ?3",
            params![&post.description, fmt_ts(&post.updated_at), &post.id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Post {}", post.id)));
        }
        Ok(())
    }

    pub fn delete_post(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("Post {}", id)));
        }
        Ok(())
    }
}

/// Per-connection setup: referential integrity on, plus the haversine
/// scalar function the feed engine's radius filter uses in SQL.
fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.create_scalar_function(
        "haversine_km",
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let lat1 = ctx.get::<f64>(0)?;
            let lon1 = ctx.get::<f64>(1)?;
            let lat2 = ctx.get::<f64>(2)?;
            let lon2 = ctx.get::<f64>(3)?;
            Ok(feed::haversine_km(lat1, lon1, lat2, lon2))
        },
    )
}

/// Current time truncated to microseconds, the precision we persist.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 (microseconds, `Z` suffix) so TEXT comparison in
/// SQL agrees with chronological order.
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        email: row.get("email")?,
        display_name: row.get("display_name")?,
        bio: row.get("bio")?,
        avatar_url: row.get("avatar_url")?,
        is_admin: row.get("is_admin")?,
        created_at: parse_datetime(row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(row.get::<_, String>("updated_at")?),
    })
}

pub(crate) fn row_to_post(row: &rusqlite::Row) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        car_model_id: row.get("car_model_id")?,
        image_path: row.get("image_path")?,
        description: row.get("description")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        created_at: parse_datetime(row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(row.get::<_, String>("updated_at")?),
    })
}

/// True when the error is a primary-key or unique-constraint conflict.
pub(crate) fn is_duplicate(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _)
        if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
}

pub(crate) fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _)
        if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}
