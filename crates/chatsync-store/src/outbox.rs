//! Persistence for [`OutboxEntry`] records.

use rusqlite::params;

use chatsync_shared::{
    ConversationId, Draft, OutboxEntry, OutboxState, ServerTime, TempId, UserId,
};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert a new entry behind every entry already stored.
    pub fn insert_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        let draft = serde_json::to_string(&entry.draft)?;
        self.conn().execute(
            "INSERT INTO outbox_entries
                (temp_id, seq, conversation_id, sender_id, draft, created_at_client,
                 reserved_id, retry_count, last_error, state)
             VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM outbox_entries),
                     ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.temp_id.to_string(),
                entry.conversation_id.as_str(),
                entry.sender_id.as_str(),
                draft,
                entry.created_at_client.millis(),
                entry.reserved_id,
                entry.retry_count,
                entry.last_error,
                entry.state.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Persist the mutable fields of an entry. Returns `false` if the entry
    /// is not stored.
    pub fn update_outbox_entry(&self, entry: &OutboxEntry) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE outbox_entries
             SET reserved_id = ?2, retry_count = ?3, last_error = ?4, state = ?5
             WHERE temp_id = ?1",
            params![
                entry.temp_id.to_string(),
                entry.reserved_id,
                entry.retry_count,
                entry.last_error,
                entry.state.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Mark an entry delivered, keeping only the newest `retain` delivered
    /// rows. Returns `false` if the entry is not stored.
    pub fn confirm_outbox_entry(&self, temp_id: TempId, retain: usize) -> Result<bool> {
        let conn = self.conn();
        let affected = conn.execute(
            "UPDATE outbox_entries SET state = 'confirmed' WHERE temp_id = ?1",
            params![temp_id.to_string()],
        )?;
        conn.execute(
            "DELETE FROM outbox_entries
             WHERE state = 'confirmed'
               AND seq NOT IN (SELECT seq FROM outbox_entries
                               WHERE state = 'confirmed'
                               ORDER BY seq DESC LIMIT ?1)",
            params![retain as i64],
        )?;
        Ok(affected > 0)
    }

    pub fn is_outbox_confirmed(&self, temp_id: TempId) -> Result<bool> {
        let found = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM outbox_entries
                           WHERE temp_id = ?1 AND state = 'confirmed')",
            params![temp_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    pub fn delete_outbox_entry(&self, temp_id: TempId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox_entries WHERE temp_id = ?1",
            params![temp_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn get_outbox_entry(&self, temp_id: TempId) -> Result<OutboxEntry> {
        self.conn()
            .query_row(
                "SELECT temp_id, conversation_id, sender_id, draft, created_at_client,
                        reserved_id, retry_count, last_error, state
                 FROM outbox_entries WHERE temp_id = ?1",
                params![temp_id.to_string()],
                row_to_entry,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Every unconfirmed entry, in submission order.
    pub fn list_outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT temp_id, conversation_id, sender_id, draft, created_at_client,
                    reserved_id, retry_count, last_error, state
             FROM outbox_entries
             WHERE state != 'confirmed'
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let temp_id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let draft_json: String = row.get(3)?;
    let created_at_client: i64 = row.get(4)?;
    let reserved_id: Option<String> = row.get(5)?;
    let retry_count: u32 = row.get(6)?;
    let last_error: Option<String> = row.get(7)?;
    let state_str: String = row.get(8)?;

    let temp_id: TempId = temp_id_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let draft: Draft = serde_json::from_str(&draft_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let state = OutboxState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown outbox state {state_str:?}").into(),
        )
    })?;

    Ok(OutboxEntry {
        temp_id,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        draft,
        created_at_client: ServerTime(created_at_client),
        reserved_id,
        retry_count,
        last_error,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conv: &str, text: &str) -> OutboxEntry {
        OutboxEntry {
            temp_id: TempId::new(),
            conversation_id: conv.into(),
            sender_id: "alice".into(),
            draft: Draft::text(text),
            created_at_client: ServerTime(1_000),
            reserved_id: None,
            retry_count: 0,
            last_error: None,
            state: OutboxState::Pending,
        }
    }

    #[test]
    fn entries_come_back_in_submission_order() {
        let db = Database::open_in_memory().unwrap();
        let a = entry("c1", "a");
        let b = entry("c2", "b");
        let c = entry("c1", "c");
        for e in [&a, &b, &c] {
            db.insert_outbox_entry(e).unwrap();
        }

        let listed = db.list_outbox_entries().unwrap();
        let ids: Vec<TempId> = listed.iter().map(|e| e.temp_id).collect();
        assert_eq!(ids, vec![a.temp_id, b.temp_id, c.temp_id]);
        assert_eq!(listed[0], a);
    }

    #[test]
    fn update_and_confirmed_entries_are_hidden() {
        let db = Database::open_in_memory().unwrap();
        let mut a = entry("c1", "a");
        db.insert_outbox_entry(&a).unwrap();

        a.reserved_id = Some("k1".into());
        a.retry_count = 2;
        a.last_error = Some("offline".into());
        a.state = OutboxState::Failed;
        assert!(db.update_outbox_entry(&a).unwrap());
        assert_eq!(db.get_outbox_entry(a.temp_id).unwrap(), a);

        a.state = OutboxState::Confirmed;
        db.update_outbox_entry(&a).unwrap();
        assert!(db.list_outbox_entries().unwrap().is_empty());
    }

    #[test]
    fn delivered_entries_are_remembered_up_to_the_retention() {
        let db = Database::open_in_memory().unwrap();
        let entries: Vec<OutboxEntry> = (0..3).map(|i| entry("c1", &format!("m{i}"))).collect();
        for e in &entries {
            db.insert_outbox_entry(e).unwrap();
        }

        assert!(db.confirm_outbox_entry(entries[0].temp_id, 2).unwrap());
        assert!(db.is_outbox_confirmed(entries[0].temp_id).unwrap());
        assert!(!db.is_outbox_confirmed(entries[1].temp_id).unwrap());
        assert_eq!(db.list_outbox_entries().unwrap().len(), 2);

        db.confirm_outbox_entry(entries[1].temp_id, 2).unwrap();
        db.confirm_outbox_entry(entries[2].temp_id, 2).unwrap();
        assert!(!db.is_outbox_confirmed(entries[0].temp_id).unwrap());
        assert!(db.is_outbox_confirmed(entries[1].temp_id).unwrap());
        assert!(db.is_outbox_confirmed(entries[2].temp_id).unwrap());
        assert!(db.list_outbox_entries().unwrap().is_empty());
    }

    #[test]
    fn delete_missing_entry() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.delete_outbox_entry(TempId::new()).unwrap());
        assert!(matches!(
            db.get_outbox_entry(TempId::new()),
            Err(StoreError::NotFound)
        ));
    }
}
