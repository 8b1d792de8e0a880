//! Database schema definitions and migrations.

use rusqlite::Connection;

use crate::domain::StoreError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 2;

/// `seq` gives a stable insertion order for items enqueued in the same
/// millisecond. Timestamps are epoch milliseconds (UTC).
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS upload_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    content_ref TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    not_before INTEGER,
    claimed_at INTEGER,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_items_claim ON upload_items(state, enqueued_at, seq);
"#;

/// Claim token of the current `in_flight` claim.
const SCHEMA_V2: &str = "ALTER TABLE upload_items ADD COLUMN claim_id TEXT;";

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Initialize or migrate the database schema.
///
/// Idempotent; safe on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        migrate_to_version(conn, version)?;
    }

    Ok(())
}

/// Apply one schema step inside its own transaction.
fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    let ddl = match version {
        1 => SCHEMA_V1,
        2 => SCHEMA_V2,
        other => {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: other,
                expected: SCHEMA_VERSION,
            });
        }
    };

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let applied = (|| {
        // another process may have migrated while we waited for the lock
        if get_schema_version(conn)? >= version {
            return Ok(false);
        }
        conn.execute_batch(ddl)?;
        conn.pragma_update(None, "user_version", version)?;
        Ok::<_, StoreError>(true)
    })();
    match applied {
        Ok(applied) => {
            conn.execute_batch("COMMIT")?;
            if applied {
                tracing::debug!("Migrated queue schema to version {}", version);
            }
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
