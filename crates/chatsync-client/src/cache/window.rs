//! The ordered, deduplicated message list of one conversation.
//!
//! Ordering key per entry is `(position, tier, seq)`:
//! - confirmed messages sit at their server timestamp (tier 0);
//! - unconfirmed messages sit at their client timestamp, but never above
//!   the newest confirmed message (tier 1), so confirming the head of a
//!   burst of pending sends never lets a later one overtake it;
//! - `seq` is arrival order. Live arrivals count up from zero, older pages
//!   count down, so older history always sorts first on ties.

use chatsync_shared::{Message, MessageId, ServerTime, TempId};

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MessageWindow {
    entries: Vec<Entry>,
    next_seq: i64,
    prev_seq: i64,
    exhausted: bool,
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.iter().find(|m| &m.id == id)
    }

    /// Whether `message` is already present, by id or as the pending copy
    /// of the same submission.
    pub fn contains(&self, message: &Message) -> bool {
        self.position_of(message).is_some()
    }

    pub fn contains_confirmed(&self, key: &str) -> bool {
        self.iter().any(|m| m.id.as_confirmed() == Some(key))
    }

    /// Server time of the oldest confirmed message.
    pub fn floor(&self) -> Option<ServerTime> {
        self.iter().filter_map(|m| m.created_at_server).min()
    }

    /// Number of confirmed messages at or before `ts`.
    pub fn confirmed_at_or_before(&self, ts: ServerTime) -> usize {
        self.iter()
            .filter(|m| m.created_at_server.is_some_and(|t| t <= ts))
            .count()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn set_exhausted(&mut self, exhausted: bool) {
        self.exhausted = exhausted;
    }

    /// Drop every confirmed message, keeping local pending ones.
    pub fn reset_confirmed(&mut self) {
        self.entries.retain(|e| !e.message.id.is_confirmed());
        self.exhausted = false;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.exhausted = false;
    }

    /// Merge messages delivered by the live feed or the initial load.
    /// Returns `true` if anything visible changed.
    pub fn merge_live(&mut self, incoming: Vec<Message>) -> bool {
        let mut changed = false;
        for message in incoming {
            changed |= self.upsert(message, false);
        }
        if changed {
            self.sort();
        }
        changed
    }

    /// Merge an older page (ascending). Returns the messages that were not
    /// present before, in ascending order.
    pub fn merge_older(&mut self, page: Vec<Message>) -> Vec<Message> {
        let mut added = Vec::new();
        for message in page.into_iter().rev() {
            if self.position_of(&message).is_none() {
                added.push(message.clone());
            }
            self.upsert(message, true);
        }
        self.sort();
        added.reverse();
        added
    }

    /// Add a locally created, unconfirmed message.
    pub fn insert_local(&mut self, message: Message) {
        if self.get(&message.id).is_some() {
            return;
        }
        let seq = self.bump_next();
        self.entries.push(Entry { message, seq });
        self.sort();
    }

    /// Replace a temp entry with its confirmed identity. If the live feed
    /// already delivered the confirmed copy the temp entry is dropped.
    /// Returns `true` if the window changed.
    pub fn confirm(&mut self, temp_id: TempId, key: &str, server_time: ServerTime) -> bool {
        let temp = MessageId::Temp(temp_id);
        let Some(idx) = self.entries.iter().position(|e| e.message.id == temp) else {
            return false;
        };
        if self.contains_confirmed(key) {
            self.entries.remove(idx);
        } else {
            let message = &mut self.entries[idx].message;
            message.id = MessageId::Confirmed(key.to_string());
            message.created_at_server = Some(server_time);
        }
        self.sort();
        true
    }

    pub fn remove_local(&mut self, temp_id: TempId) -> bool {
        let temp = MessageId::Temp(temp_id);
        let before = self.entries.len();
        self.entries.retain(|e| e.message.id != temp);
        before != self.entries.len()
    }

    /// Apply `f` to the confirmed message `key`.
    pub fn update_confirmed(&mut self, key: &str, f: impl FnOnce(&mut Message)) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.message.id.as_confirmed() == Some(key))
        {
            Some(entry) => {
                f(&mut entry.message);
                true
            }
            None => false,
        }
    }

    /// No duplicate ids, confirmed messages strictly ordered by server time
    /// (ties by arrival).
    pub fn is_consistent(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        if !self.entries.iter().all(|e| seen.insert(&e.message.id)) {
            return false;
        }
        let confirmed: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|e| e.message.is_confirmed())
            .collect();
        confirmed.windows(2).all(|w| {
            (w[0].message.order_time(), w[0].seq) < (w[1].message.order_time(), w[1].seq)
        })
    }

    fn position_of(&self, message: &Message) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.id == message.id)
            .or_else(|| {
                self.entries.iter().position(|e| {
                    !e.message.id.is_confirmed() && e.message.same_submission(message)
                })
            })
    }

    fn upsert(&mut self, message: Message, older: bool) -> bool {
        match self.position_of(&message) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                if entry.message == message {
                    false
                } else {
                    entry.message = message;
                    true
                }
            }
            None => {
                let seq = if older {
                    self.bump_prev()
                } else {
                    self.bump_next()
                };
                self.entries.push(Entry { message, seq });
                true
            }
        }
    }

    fn bump_next(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn bump_prev(&mut self) -> i64 {
        self.prev_seq -= 1;
        self.prev_seq
    }

    fn sort(&mut self) {
        let newest_confirmed = self
            .entries
            .iter()
            .filter_map(|e| e.message.created_at_server)
            .max()
            .unwrap_or(ServerTime(i64::MIN));
        self.entries.sort_by_key(|e| match e.message.created_at_server {
            Some(ts) if e.message.id.is_confirmed() => (ts, 0u8, e.seq),
            _ => (e.message.created_at_client.max(newest_confirmed), 1u8, e.seq),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_shared::Draft;

    fn local(text: &str, client_ts: i64) -> Message {
        Message::local(
            TempId::new(),
            "c1".into(),
            "alice".into(),
            ServerTime(client_ts),
            &Draft::text(text),
        )
    }

    fn confirmed(key: &str, sender: &str, server_ts: i64) -> Message {
        let mut m = Message::local(
            TempId::new(),
            "c1".into(),
            sender.into(),
            ServerTime(server_ts - 1),
            &Draft::text(key),
        );
        m.id = MessageId::Confirmed(key.into());
        m.created_at_server = Some(ServerTime(server_ts));
        m
    }

    fn ids(w: &MessageWindow) -> Vec<String> {
        w.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn live_merge_orders_and_dedups() {
        let mut w = MessageWindow::new();
        assert!(w.merge_live(vec![confirmed("m2", "bob", 20), confirmed("m1", "bob", 10)]));
        assert!(!w.merge_live(vec![confirmed("m1", "bob", 10)]));
        assert_eq!(ids(&w), vec!["m1", "m2"]);
        assert!(w.is_consistent());
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut w = MessageWindow::new();
        w.merge_live(vec![confirmed("b", "bob", 10)]);
        w.merge_live(vec![confirmed("a", "bob", 10)]);
        assert_eq!(ids(&w), vec!["b", "a"]);
    }

    #[test]
    fn live_copy_replaces_matching_temp() {
        let mut w = MessageWindow::new();
        let pending = local("hi", 50);
        let temp_id = pending.id.as_temp().unwrap();
        w.insert_local(pending.clone());

        let mut server_copy = pending.clone();
        server_copy.id = MessageId::Confirmed("k1".into());
        server_copy.created_at_server = Some(ServerTime(55));
        w.merge_live(vec![server_copy]);
        assert_eq!(ids(&w), vec!["k1"]);

        // The outbox's own confirmation arrives afterwards: nothing to do.
        assert!(!w.confirm(temp_id, "k1", ServerTime(55)));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn pending_burst_keeps_submission_order_through_confirmation() {
        let mut w = MessageWindow::new();
        w.merge_live(vec![confirmed("old", "bob", 100)]);
        let a = local("a", 10);
        let b = local("b", 11);
        let c = local("c", 12);
        for m in [&a, &b, &c] {
            w.insert_local(m.clone());
        }
        let text = |w: &MessageWindow| -> Vec<String> {
            w.iter()
                .map(|m| m.body().map(|b| b.preview()).unwrap_or_default())
                .collect()
        };
        assert_eq!(text(&w), vec!["old", "a", "b", "c"]);

        w.confirm(a.id.as_temp().unwrap(), "ka", ServerTime(500));
        assert_eq!(text(&w), vec!["old", "a", "b", "c"]);
        w.confirm(b.id.as_temp().unwrap(), "kb", ServerTime(501));
        assert_eq!(text(&w), vec!["old", "a", "b", "c"]);
        assert!(w.is_consistent());
    }

    #[test]
    fn older_page_reports_only_new_messages() {
        let mut w = MessageWindow::new();
        w.merge_live(vec![confirmed("m3", "bob", 30), confirmed("m4", "bob", 40)]);
        let added = w.merge_older(vec![
            confirmed("m1", "bob", 10),
            confirmed("m2", "bob", 20),
            confirmed("m3", "bob", 30),
        ]);
        let added: Vec<String> = added.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(added, vec!["m1", "m2"]);
        assert_eq!(ids(&w), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(w.floor(), Some(ServerTime(10)));
    }

    #[test]
    fn older_messages_sort_before_live_ones_on_ties() {
        let mut w = MessageWindow::new();
        w.merge_live(vec![confirmed("live", "bob", 10)]);
        w.merge_older(vec![confirmed("older", "bob", 10)]);
        assert_eq!(ids(&w), vec!["older", "live"]);
        assert!(w.is_consistent());
    }

    #[test]
    fn reset_keeps_pending() {
        let mut w = MessageWindow::new();
        w.merge_live(vec![confirmed("m1", "bob", 10)]);
        let pending = local("p", 20);
        w.insert_local(pending.clone());
        w.set_exhausted(true);

        w.reset_confirmed();
        assert_eq!(w.messages(), vec![pending]);
        assert!(!w.is_exhausted());
    }
}
