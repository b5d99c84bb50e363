//! Persistence for the confirmed part of a conversation's message window.

use rusqlite::params;

use chatsync_shared::record::MessageRecord;
use chatsync_shared::{ConversationId, Message};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or refresh confirmed messages. Unconfirmed ones are skipped.
    /// Returns the number of rows written.
    pub fn upsert_cached_messages(
        &mut self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cached_messages (conversation_id, id, created_at_server, record)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (conversation_id, id)
                 DO UPDATE SET created_at_server = excluded.created_at_server,
                               record = excluded.record",
            )?;
            for msg in messages {
                let (Some(key), Some(record)) =
                    (msg.id.as_confirmed(), MessageRecord::from_message(msg))
                else {
                    continue;
                };
                let ts = record.created_at_server.unwrap_or_default();
                let json = serde_json::to_string(&record)?;
                stmt.execute(params![conversation_id.as_str(), key, ts, json])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// The newest `limit` cached messages, ascending by server time.
    ///
    /// Fails with [`StoreError::Corrupt`] if any row no longer decodes; the
    /// caller is expected to discard the window and reload it.
    pub fn cached_window(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, record FROM cached_messages
             WHERE conversation_id = ?1
             ORDER BY created_at_server DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(
            params![conversation_id.as_str(), limit as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let (key, json) = row?;
            let message = serde_json::from_str::<MessageRecord>(&json)
                .ok()
                .and_then(|r| r.into_message(conversation_id.clone(), &key).ok())
                .ok_or_else(|| StoreError::Corrupt(conversation_id.to_string()))?;
            messages.push(message);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Drop every cached message of a conversation.
    pub fn discard_window(&self, conversation_id: &ConversationId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM cached_messages WHERE conversation_id = ?1",
            params![conversation_id.as_str()],
        )?;
        tracing::debug!(conversation = %conversation_id, rows = affected, "discarded cached window");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_shared::{Draft, MessageId, ServerTime, TempId};

    fn confirmed(conv: &str, key: &str, ts: i64) -> Message {
        let mut m = Message::local(
            TempId::new(),
            conv.into(),
            "alice".into(),
            ServerTime(ts - 1),
            &Draft::text(key),
        );
        m.id = MessageId::Confirmed(key.into());
        m.created_at_server = Some(ServerTime(ts));
        m
    }

    #[test]
    fn window_is_newest_first_then_reversed() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::from("c1");
        let msgs = vec![
            confirmed("c1", "m1", 10),
            confirmed("c1", "m2", 20),
            confirmed("c1", "m3", 30),
        ];
        assert_eq!(db.upsert_cached_messages(&conv, &msgs).unwrap(), 3);

        let window = db.cached_window(&conv, 2).unwrap();
        assert_eq!(window, msgs[1..].to_vec());
    }

    #[test]
    fn unconfirmed_messages_are_not_cached() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::from("c1");
        let local = Message::local(
            TempId::new(),
            conv.clone(),
            "alice".into(),
            ServerTime(1),
            &Draft::text("pending"),
        );
        assert_eq!(db.upsert_cached_messages(&conv, &[local]).unwrap(), 0);
        assert!(db.cached_window(&conv, 10).unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::from("c1");
        let mut m = confirmed("c1", "m1", 10);
        db.upsert_cached_messages(&conv, std::slice::from_ref(&m)).unwrap();
        m.read_by.insert("bob".into(), ServerTime(11));
        db.upsert_cached_messages(&conv, std::slice::from_ref(&m)).unwrap();

        let window = db.cached_window(&conv, 10).unwrap();
        assert_eq!(window, vec![m]);
    }

    #[test]
    fn corrupt_row_is_reported_and_discardable() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = ConversationId::from("c1");
        db.upsert_cached_messages(&conv, &[confirmed("c1", "m1", 10)])
            .unwrap();
        db.conn()
            .execute(
                "UPDATE cached_messages SET record = 'not json' WHERE id = 'm1'",
                [],
            )
            .unwrap();

        assert!(matches!(
            db.cached_window(&conv, 10),
            Err(StoreError::Corrupt(_))
        ));
        assert_eq!(db.discard_window(&conv).unwrap(), 1);
        assert!(db.cached_window(&conv, 10).unwrap().is_empty());
    }
}
