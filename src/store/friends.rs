//! Social-graph storage: the symmetric friendship relation and the
//! directed pending-request relation.
//!
//! Friendships are stored as two mirrored rows, `(user_id, friend_id)` and
//! `(friend_id, user_id)`, always created and destroyed inside one
//! transaction. The pending-request table is keyed by the ordered
//! `(sender_id, receiver_id)` pair; the reverse pair is a distinct slot and
//! is never merged automatically.

use rusqlite::{params, Connection, Transaction};
use std::sync::{Arc, Mutex};

use crate::models::{FriendRequest, Friendship, User};

use super::{
    fmt_ts, is_duplicate, is_foreign_key_violation, now, parse_datetime, row_to_user, StoreError,
    StoreResult,
};

/// Durable storage and invariant enforcement for the friend graph.
pub struct FriendGraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl FriendGraphStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert both directions of a friendship in one transaction and return
    /// the row for the caller's direction. Re-friending is a conflict, not
    /// a silent no-op.
    pub fn add_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<Friendship> {
        if user_id == friend_id {
            return Err(StoreError::SelfFriendship);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let friendship = Self::insert_pair(&tx, user_id, friend_id)?;
        tx.commit()?;
        Ok(friendship)
    }

    /// Insert the mirrored pair inside the caller's transaction, so the
    /// accept path can run it atomically with the request deletion.
    fn insert_pair(tx: &Transaction, user_id: &str, friend_id: &str) -> StoreResult<Friendship> {
        let created_at = now();
        let ts = fmt_ts(&created_at);
        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            tx.execute(
                "INSERT INTO friends (user_id, friend_id, created_at) VALUES (?1, ?2, ?3)",
                params![a, b, &ts],
            )
            .map_err(|e| {
                if is_duplicate(&e) {
                    StoreError::AlreadyFriends
                } else if is_foreign_key_violation(&e) {
                    StoreError::NotFound(format!("User {}", b))
                } else {
                    StoreError::Database(e)
                }
            })?;
        }
        Ok(Friendship {
            user_id: user_id.to_string(),
            friend_id: friend_id.to_string(),
            created_at,
        })
    }

    /// Delete both directions in one transaction. Returns 2 on success and
    /// 0 when no such friendship existed. Exactly one affected row means
    /// the mirror invariant was already broken; the transaction is rolled
    /// back and the condition surfaced as a fatal error.
    pub fn remove_friendship(&self, user_id: &str, friend_id: &str) -> StoreResult<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM friends
             WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
            params![user_id, friend_id],
        )?;
        match deleted {
            0 | 2 => {
                tx.commit()?;
                Ok(deleted)
            }
            n => Err(StoreError::BrokenSymmetry { deleted: n }),
        }
    }

    pub fn list_friends(&self, user_id: &str) -> StoreResult<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT u.id, u.username, u.email, u.display_name, u.bio, u.avatar_url,
                      u.is_admin, u.created_at, u.updated_at
               FROM users u
               JOIN friends f ON f.friend_id = u.id
               WHERE f.user_id = ?1
               ORDER BY f.created_at DESC"#,
        )?;
        let users = stmt
            .query_map(params![user_id], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Every directional row in the graph. Operational use only.
    pub fn list_all_friendships(&self) -> StoreResult<Vec<Friendship>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, friend_id, created_at FROM friends ORDER BY created_at DESC",
        )?;
        let friendships = stmt
            .query_map([], |row| {
                Ok(Friendship {
                    user_id: row.get("user_id")?,
                    friend_id: row.get("friend_id")?,
                    created_at: parse_datetime(row.get::<_, String>("created_at")?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(friendships)
    }
}

/// Sequences the pending-request lifecycle on top of [`FriendGraphStore`]:
/// `NONE -> PENDING -> { FRIENDS, NONE }`.
pub struct FriendRequestWorkflow {
    conn: Arc<Mutex<Connection>>,
}

impl FriendRequestWorkflow {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// The graph store this workflow resolves accepted requests into.
    pub fn graph(&self) -> FriendGraphStore {
        FriendGraphStore::new(self.conn.clone())
    }

    /// Create a pending request. A second send for the same ordered pair
    /// hits the primary key and surfaces as `DuplicateRequest`; the reverse
    /// pair is a separate slot and is not affected. Whether the two users
    /// are already friends is deliberately not checked here.
    pub fn send_friend_request(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> StoreResult<FriendRequest> {
        if sender_id == receiver_id {
            return Err(StoreError::SelfFriendship);
        }
        let conn = self.conn.lock().unwrap();
        let created_at = now();
        conn.execute(
            "INSERT INTO friend_requests (sender_id, receiver_id, created_at) VALUES (?1, ?2, ?3)",
            params![sender_id, receiver_id, fmt_ts(&created_at)],
        )
        .map_err(|e| {
            if is_duplicate(&e) {
                StoreError::DuplicateRequest
            } else if is_foreign_key_violation(&e) {
                StoreError::NotFound(format!("User {}", receiver_id))
            } else {
                StoreError::Database(e)
            }
        })?;
        Ok(FriendRequest {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            created_at,
        })
    }

    /// Atomically delete the `(sender_id, receiver_id)` request and insert
    /// the mirrored friendship pair in the same transaction. Returns
    /// `Ok(false)` without side effect when no pending request exists,
    /// which is the normal outcome for a concurrent second accept.
    pub fn accept_friend_request(&self, sender_id: &str, receiver_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2",
            params![sender_id, receiver_id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        match FriendGraphStore::insert_pair(&tx, sender_id, receiver_id) {
            Ok(_) => {
                tx.commit()?;
                Ok(true)
            }
            // Raced with a direct add: the desired end state (friends, no
            // pending request) already holds once the delete commits.
            Err(StoreError::AlreadyFriends) => {
                tx.commit()?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the request without creating a friendship. Unlike accept,
    /// an already-resolved request is reported as an error: decline is a
    /// user-visible action and the caller should learn the request is gone.
    pub fn decline_friend_request(&self, sender_id: &str, receiver_id: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2",
            params![sender_id, receiver_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::RequestNotFound);
        }
        Ok(deleted)
    }

    /// Counterparties of every pending request touching the user, newest
    /// request first.
    pub fn get_all_friend_requests(&self, user_id: &str) -> StoreResult<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT u.id, u.username, u.email, u.display_name, u.bio, u.avatar_url,
                      u.is_admin, u.created_at, u.updated_at
               FROM users u
               JOIN friend_requests fr
                 ON (fr.sender_id = u.id AND fr.receiver_id = ?1)
                 OR (fr.receiver_id = u.id AND fr.sender_id = ?1)
               ORDER BY fr.created_at DESC"#,
        )?;
        let users = stmt
            .query_map(params![user_id], row_to_user)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }
}
