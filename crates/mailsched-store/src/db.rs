use rusqlite::Connection;

use crate::error::Result;

/// Initialise the event store schema in `conn`.
///
/// Creates the `events` table (idempotent) and a covering index for the
/// due-event scan so polling stays cheap as the audit history grows.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            subject       TEXT    NOT NULL,
            content       TEXT    NOT NULL,
            recipients    TEXT    NOT NULL,   -- JSON array, de-duplicated, ordered
            scheduled_at  TEXT    NOT NULL,   -- fixed-width RFC 3339 UTC
            created_at    TEXT    NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending', 'claimed', 'done', 'failed')),
            claimed_at    TEXT,
            done_at       TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error    TEXT
        ) STRICT;

        -- Due scan: WHERE status = 'pending' AND scheduled_at <= ? ORDER BY scheduled_at, id
        CREATE INDEX IF NOT EXISTS idx_events_due
            ON events (status, scheduled_at, id);
        ",
    )?;
    Ok(())
}

/// Connection settings for a file-backed store shared by several processes.
pub fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    Ok(())
}
