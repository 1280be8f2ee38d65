//! v001 -- Initial schema creation.
//!
//! One row per (user, document kind) holding the latest snapshot hash.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bucket_pointers (
    user_id    TEXT NOT NULL,
    kind       TEXT NOT NULL,               -- main | sent_requests | received_requests
    hash       TEXT NOT NULL,               -- content store hash of the sealed snapshot
    created_at TEXT NOT NULL,               -- RFC-3339

    PRIMARY KEY (user_id, kind)
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
