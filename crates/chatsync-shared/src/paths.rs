//! Layout of the hosted store's tree. Every path the engine touches is
//! built here.

use crate::types::{ConversationId, UserId};

pub fn conversation(c: &ConversationId) -> String {
    format!("conversations/{c}")
}

pub fn members(c: &ConversationId) -> String {
    format!("conversations/{c}/members")
}

pub fn messages(c: &ConversationId) -> String {
    format!("messages/{c}")
}

pub fn message(c: &ConversationId, key: &str) -> String {
    format!("messages/{c}/{key}")
}

pub fn presence(u: &UserId) -> String {
    format!("presence/{u}")
}

pub fn typing_root(c: &ConversationId) -> String {
    format!("typing/{c}")
}

pub fn typing(c: &ConversationId, u: &UserId) -> String {
    format!("typing/{c}/{u}")
}

pub fn block(blocker: &UserId, blocked: &UserId) -> String {
    format!("blocks/{blocker}/{blocked}")
}

pub fn unread_root(u: &UserId) -> String {
    format!("unread/{u}")
}

pub fn unread(u: &UserId, c: &ConversationId) -> String {
    format!("unread/{u}/{c}")
}

pub fn read_marker(u: &UserId, c: &ConversationId) -> String {
    format!("readMarkers/{u}/{c}")
}

pub fn user_conversations(u: &UserId) -> String {
    format!("users/{u}/conversations")
}

pub fn user_conversation(u: &UserId, c: &ConversationId) -> String {
    format!("users/{u}/conversations/{c}")
}

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Whether one path is a prefix of (or equal to) the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    let a = segments(a);
    let b = segments(b);
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}
