//! Comment data model and input validation.
//!
//! Comments are immutable once written. An edit is a new comment whose
//! `edited_from_id` points at the original; a reply sets `reply_to`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::ValidationError;

/// Maximum comment length in characters.
pub const MAX_COMMENT_LEN: usize = 10_000;

/// Collaboration scope: one ticket's comment thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(ticket_id: impl Into<String>) -> Self {
        Self(ticket_id.into())
    }

    /// The ticket this room belongs to.
    pub fn ticket_id(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Who is writing a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
}

impl Author {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A single entry of the replicated comment log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub ticket_id: String,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    /// Milliseconds since the Unix epoch, assigned by the writer.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_from_id: Option<Uuid>,
}

impl Comment {
    /// Build a new comment with a fresh id and the current time.
    ///
    /// Content is trimmed; validation happens before construction.
    pub fn new(ticket_id: impl Into<String>, content: &str, author: &Author) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id: ticket_id.into(),
            content: content.trim().to_string(),
            author_id: author.id.clone(),
            author_name: author.name.clone(),
            created_at: now_millis(),
            reply_to: None,
            edited_from_id: None,
        }
    }

    pub fn in_reply_to(mut self, parent: Uuid) -> Self {
        self.reply_to = Some(parent);
        self
    }

    pub fn revising(mut self, original: Uuid) -> Self {
        self.edited_from_id = Some(original);
        self
    }

    /// Total order key shared by every replica.
    pub fn order_key(&self) -> (u64, Uuid) {
        (self.created_at, self.id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Reject input that must never enter the replicated log.
pub fn validate(content: &str, author: &Author) -> Result<(), ValidationError> {
    if author.id.trim().is_empty() || author.name.trim().is_empty() {
        return Err(ValidationError::MissingAuthor);
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let len = trimmed.chars().count();
    if len > MAX_COMMENT_LEN {
        return Err(ValidationError::ContentTooLong {
            len,
            max: MAX_COMMENT_LEN,
        });
    }
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
