//! v001 -- Initial schema creation.
//!
//! Creates `outbox_entries` and `cached_messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Outbox
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox_entries (
    temp_id           TEXT PRIMARY KEY NOT NULL,  -- "tmp-<uuid>"
    seq               INTEGER NOT NULL,           -- submission order
    conversation_id   TEXT NOT NULL,
    sender_id         TEXT NOT NULL,
    draft             TEXT NOT NULL,              -- JSON Draft
    created_at_client INTEGER NOT NULL,           -- ms, server-relative
    reserved_id       TEXT,                       -- store key once reserved
    retry_count       INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    state             TEXT NOT NULL               -- pending|sending|confirmed|failed
);

CREATE INDEX IF NOT EXISTS idx_outbox_conversation_seq
    ON outbox_entries(conversation_id, seq);

-- ----------------------------------------------------------------
-- Confirmed messages of each conversation window
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS cached_messages (
    conversation_id   TEXT NOT NULL,
    id                TEXT NOT NULL,              -- store-assigned key
    created_at_server INTEGER NOT NULL,           -- ms
    record            TEXT NOT NULL,              -- JSON MessageRecord

    PRIMARY KEY (conversation_id, id)
);

CREATE INDEX IF NOT EXISTS idx_cached_messages_conversation_ts
    ON cached_messages(conversation_id, created_at_server DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
