//! SQLite-backed directory storage: one `Arc<Mutex<Connection>>` guarding
//! three tables (user identities, one-time keys, queued message frames),
//! with an atomic `DELETE ... RETURNING` used both to pop a one-time key
//! and to drain a mailbox.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// The durable half of a published bundle: identity keys plus the
/// current signed prekey. One-time keys are tracked separately so they
/// can be popped independently of a SPK rotation.
pub struct StoredIdentity {
    pub identity_public: [u8; 32],
    pub identity_sign_public: [u8; 32],
    pub spk_id: u32,
    pub spk_public: [u8; 32],
    pub spk_signature: [u8; 64],
}

#[derive(Clone)]
pub struct SqliteDirectory(Arc<Mutex<Connection>>);

impl SqliteDirectory {
    pub fn new(connection: Connection) -> Result<Self> {
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "normal")?;
        connection.pragma_update(None, "foreign_keys", "on")?;

        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS user (
                    identity TEXT PRIMARY KEY,
                    identity_public BLOB NOT NULL,
                    identity_sign_public BLOB NOT NULL,
                    spk_id INTEGER NOT NULL,
                    spk_public BLOB NOT NULL,
                    spk_signature BLOB NOT NULL,
                    creation_time INTEGER NOT NULL
                )",
                (),
            )
            .context("creating user table failed")?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS one_time_key (
                    id INTEGER NOT NULL,
                    user_identity TEXT NOT NULL,
                    public BLOB NOT NULL,
                    creation_time INTEGER NOT NULL,
                    PRIMARY KEY (user_identity, id),
                    FOREIGN KEY (user_identity) REFERENCES user(identity)
                )",
                (),
            )
            .context("creating one_time_key table failed")?;
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS message (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_identity TEXT NOT NULL,
                    sender_identity TEXT NOT NULL,
                    frame BLOB NOT NULL,
                    creation_time INTEGER NOT NULL,
                    FOREIGN KEY (user_identity) REFERENCES user(identity)
                )",
                (),
            )
            .context("creating message table failed")?;

        Ok(Self(Arc::new(Mutex::new(connection))))
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.0.lock().expect("sqlite connection mutex poisoned")
    }

    /// Publish or replace `identity`'s identity keys and current SPK.
    pub fn put_identity(&self, identity: &str, stored: &StoredIdentity) -> Result<()> {
        let now = now_secs();
        self.connection()
            .execute(
                "INSERT INTO user (identity, identity_public, identity_sign_public, spk_id, spk_public, spk_signature, creation_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(identity) DO UPDATE SET
                    identity_public = excluded.identity_public,
                    identity_sign_public = excluded.identity_sign_public,
                    spk_id = excluded.spk_id,
                    spk_public = excluded.spk_public,
                    spk_signature = excluded.spk_signature",
                params![
                    identity,
                    &stored.identity_public[..],
                    &stored.identity_sign_public[..],
                    stored.spk_id,
                    &stored.spk_public[..],
                    &stored.spk_signature[..],
                    now,
                ],
            )
            .context("failed to upsert identity")?;
        Ok(())
    }

    pub fn add_one_time_keys(&self, identity: &str, keys: &[(u32, [u8; 32])]) -> Result<()> {
        let now = now_secs();
        let connection = self.connection();
        let mut stmt = connection
            .prepare("INSERT INTO one_time_key (id, user_identity, public, creation_time) VALUES (?1, ?2, ?3, ?4)")?;
        for (id, public) in keys {
            stmt.execute(params![id, identity, &public[..], now])
                .context("failed to insert one-time key")?;
        }
        Ok(())
    }

    pub fn get_identity(&self, identity: &str) -> Result<Option<StoredIdentity>> {
        self.connection()
            .query_row(
                "SELECT identity_public, identity_sign_public, spk_id, spk_public, spk_signature
                 FROM user WHERE identity = ?1",
                [identity],
                |row| {
                    Ok(StoredIdentity {
                        identity_public: row_blob32(row, 0)?,
                        identity_sign_public: row_blob32(row, 1)?,
                        spk_id: row.get(2)?,
                        spk_public: row_blob32(row, 3)?,
                        spk_signature: row_blob64(row, 4)?,
                    })
                },
            )
            .optional()
            .context("failed to query identity")
    }

    /// Atomically pop the oldest unconsumed one-time key, if any.
    pub fn pop_one_time_key(&self, identity: &str) -> Result<Option<(u32, [u8; 32])>> {
        let result = self.connection().query_row(
            "DELETE FROM one_time_key
             WHERE (user_identity, id) = (
                SELECT user_identity, id FROM one_time_key
                WHERE user_identity = ?1 ORDER BY creation_time LIMIT 1
             )
             RETURNING id, public",
            [identity],
            |row| {
                let id: u32 = row.get(0)?;
                let public = row_blob32(row, 1)?;
                Ok((id, public))
            },
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("failed to pop one-time key"),
        }
    }

    pub fn one_time_key_count(&self, identity: &str) -> Result<u32> {
        self.connection()
            .query_row(
                "SELECT COUNT(*) FROM one_time_key WHERE user_identity = ?1",
                [identity],
                |row| row.get(0),
            )
            .context("failed to count one-time keys")
    }

    pub fn add_message(&self, recipient: &str, sender: &str, frame: &[u8]) -> Result<()> {
        let now = now_secs();
        self.connection()
            .execute(
                "INSERT INTO message (user_identity, sender_identity, frame, creation_time) VALUES (?1, ?2, ?3, ?4)",
                params![recipient, sender, frame, now],
            )
            .context("failed to enqueue message")?;
        Ok(())
    }

    /// Drain and return every queued `(sender_identity, frame)` pair for
    /// `identity`, oldest first.
    pub fn take_messages(&self, identity: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let connection = self.connection();
        let mut stmt = connection
            .prepare("DELETE FROM message WHERE user_identity = ?1 RETURNING sender_identity, frame")
            .context("failed to prepare message drain")?;
        let rows = stmt
            .query_map([identity], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .context("failed to query messages")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read message row")
    }
}

fn row_blob32(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<[u8; 32]> {
    let bytes: Vec<u8> = row.get(idx)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, "expected 32 bytes".into())
    })
}

fn row_blob64(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<[u8; 64]> {
    let bytes: Vec<u8> = row.get(idx)?;
    <[u8; 64]>::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, "expected 64 bytes".into())
    })
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_identity() -> StoredIdentity {
        StoredIdentity {
            identity_public: [1u8; 32],
            identity_sign_public: [2u8; 32],
            spk_id: 0,
            spk_public: [3u8; 32],
            spk_signature: [4u8; 64],
        }
    }

    #[test]
    fn put_and_get_identity() {
        let db = SqliteDirectory::new(Connection::open_in_memory().unwrap()).unwrap();
        db.put_identity("alice", &fixture_identity()).unwrap();
        let fetched = db.get_identity("alice").unwrap().unwrap();
        assert_eq!(fetched.identity_public, [1u8; 32]);
        assert_eq!(fetched.spk_id, 0);
    }

    #[test]
    fn get_identity_missing_returns_none() {
        let db = SqliteDirectory::new(Connection::open_in_memory().unwrap()).unwrap();
        assert!(db.get_identity("nobody").unwrap().is_none());
    }

    #[test]
    fn one_time_keys_pop_oldest_first_then_empty() {
        let db = SqliteDirectory::new(Connection::open_in_memory().unwrap()).unwrap();
        db.put_identity("bob", &fixture_identity()).unwrap();
        db.add_one_time_keys("bob", &[(0, [10u8; 32]), (1, [11u8; 32])])
            .unwrap();
        assert_eq!(db.one_time_key_count("bob").unwrap(), 2);
        assert_eq!(db.pop_one_time_key("bob").unwrap(), Some((0, [10u8; 32])));
        assert_eq!(db.pop_one_time_key("bob").unwrap(), Some((1, [11u8; 32])));
        assert_eq!(db.pop_one_time_key("bob").unwrap(), None);
    }

    #[test]
    fn messages_are_drained_in_order() {
        let db = SqliteDirectory::new(Connection::open_in_memory().unwrap()).unwrap();
        db.put_identity("carol", &fixture_identity()).unwrap();
        db.add_message("carol", "alice", b"frame-1").unwrap();
        db.add_message("carol", "bob", b"frame-2").unwrap();
        assert_eq!(
            db.take_messages("carol").unwrap(),
            vec![
                ("alice".to_string(), b"frame-1".to_vec()),
                ("bob".to_string(), b"frame-2".to_vec()),
            ]
        );
        assert!(db.take_messages("carol").unwrap().is_empty());
    }
}
