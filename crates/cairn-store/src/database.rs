//! SQLite-backed bucket hash registry.
//!
//! Any durable key-value store satisfies the registry contract; this one
//! keeps the pointers in a single table next to the rest of a node's local
//! state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use cairn_shared::UserId;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::registry::{BucketKind, BucketPointer, HashRegistry, RegistryEntry};

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) a registry database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "opening registry database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// A registry that lives only as long as the process.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.lock().path().map(PathBuf::from)
    }
}

impl HashRegistry for SqliteRegistry {
    fn get(&self, user: &UserId) -> Result<Option<RegistryEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT kind, hash, created_at FROM bucket_pointers WHERE user_id = ?1")?;

        let rows = stmt.query_map(params![user.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entry: Option<RegistryEntry> = None;
        for row in rows {
            let (kind, hash, created) = row?;
            let kind = BucketKind::parse(&kind)
                .ok_or_else(|| StoreError::Registry(format!("unknown bucket kind {kind}")))?;
            let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Registry(format!("bad timestamp {created}: {e}")))?;

            entry
                .get_or_insert_with(RegistryEntry::default)
                .set(kind, BucketPointer { hash, created_at });
        }
        Ok(entry)
    }

    fn set(&self, user: &UserId, kind: BucketKind, hash: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO bucket_pointers (user_id, kind, hash, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, kind) DO UPDATE SET
                hash = excluded.hash,
                created_at = excluded.created_at",
            params![user.as_str(), kind.as_str(), hash, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(user = %user, kind = kind.as_str(), hash = %hash, "registry pointer updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let user = UserId::from("42");

        {
            let registry = SqliteRegistry::open_at(&path).expect("should open");
            assert!(registry.path().is_some());
            registry.set(&user, BucketKind::Main, "a").unwrap();
            registry.set(&user, BucketKind::Main, "b").unwrap();
            registry.set(&user, BucketKind::ReceivedRequests, "r").unwrap();
        }

        let registry = SqliteRegistry::open_at(&path).unwrap();
        let entry = registry.get(&user).unwrap().unwrap();
        assert_eq!(entry.hash(BucketKind::Main), Some("b"));
        assert_eq!(entry.hash(BucketKind::ReceivedRequests), Some("r"));
        assert_eq!(entry.hash(BucketKind::SentRequests), None);
    }

    #[test]
    fn unknown_user_is_none() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        assert!(registry.get(&UserId::from("nobody")).unwrap().is_none());
        assert!(!registry.has_bucket(&UserId::from("nobody")).unwrap());
    }
}
