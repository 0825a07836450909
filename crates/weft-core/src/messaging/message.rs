//! Message log entries.
//!
//! Entries are numbered per store, monotonically from 0. Identity across
//! the mesh is `(sender user id, sender's message number)`; a receiver
//! keeps the sender's number alongside its own so receipts and file
//! requests can reference the sender's log.

use serde::{Deserialize, Serialize};

use crate::crypto::UserId;

/// Kind of a message log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Plain text.
    TextMessage,
    /// Inline image bytes in the payload.
    InlineImage,
    /// File offered for pull-based transfer.
    FileAttachment,
    /// Informational entry (membership, renames).
    Info,
}

/// Per-recipient delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientStatus {
    /// Not yet acknowledged.
    Undelivered,
    /// Acknowledged by the recipient.
    Delivered,
}

/// One recipient row of a message.
///
/// The row layout is fixed-width so a delivery-status rewrite never
/// changes the encoded entry size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecipient {
    /// The recipient's user id.
    pub user_id: UserId,
    /// Delivery state.
    pub status: RecipientStatus,
    /// Unix seconds of the acknowledgment; 0 while undelivered.
    pub delivered_at: i64,
}

/// A message log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageItem {
    /// Entry kind.
    pub message_type: MessageType,
    /// Authoring user id.
    pub sender: UserId,
    /// Recipients with delivery state.
    pub recipients: Vec<MessageRecipient>,
    /// Body bytes: UTF-8 text, image data, or empty for attachments.
    pub payload: Vec<u8>,
    /// Optional preview thumbnail.
    pub thumbnail: Option<Vec<u8>>,
    /// Attachment file name.
    pub file_name: Option<String>,
    /// Attachment size in bytes.
    pub file_size: Option<u64>,
    /// Where the attachment lives on this node; never sent on the wire.
    pub local_file_path: Option<String>,
    /// The sender's message number, kept by receivers; `None` on entries
    /// we authored.
    pub remote_number: Option<u32>,
    /// Unix seconds the message was composed.
    pub timestamp: i64,
}

impl MessageItem {
    /// Build a text message.
    pub fn new_text(
        sender: UserId,
        recipients: Vec<UserId>,
        text: &[u8],
        timestamp: i64,
    ) -> Self {
        Self {
            message_type: MessageType::TextMessage,
            sender,
            recipients: recipients.into_iter().map(MessageRecipient::undelivered).collect(),
            payload: text.to_vec(),
            thumbnail: None,
            file_name: None,
            file_size: None,
            local_file_path: None,
            remote_number: None,
            timestamp,
        }
    }

    /// Build an informational entry.
    pub fn new_info(sender: UserId, text: &str, timestamp: i64) -> Self {
        Self {
            message_type: MessageType::Info,
            sender,
            recipients: Vec::new(),
            payload: text.as_bytes().to_vec(),
            thumbnail: None,
            file_name: None,
            file_size: None,
            local_file_path: None,
            remote_number: None,
            timestamp,
        }
    }

    /// Build a file attachment entry.
    pub fn new_file_attachment(
        sender: UserId,
        recipients: Vec<UserId>,
        file_name: String,
        file_size: u64,
        local_file_path: String,
        thumbnail: Option<Vec<u8>>,
        timestamp: i64,
    ) -> Self {
        Self {
            message_type: MessageType::FileAttachment,
            sender,
            recipients: recipients.into_iter().map(MessageRecipient::undelivered).collect(),
            payload: Vec::new(),
            thumbnail,
            file_name: Some(file_name),
            file_size: Some(file_size),
            local_file_path: Some(local_file_path),
            remote_number: None,
            timestamp,
        }
    }

    /// Whether `user_id` has acknowledged this entry.
    pub fn is_delivered_to(&self, user_id: &UserId) -> bool {
        self.recipients
            .iter()
            .any(|r| r.user_id == *user_id && r.status == RecipientStatus::Delivered)
    }

    /// Whether every recipient has acknowledged.
    pub fn is_delivered_to_all(&self) -> bool {
        !self.recipients.is_empty()
            && self
                .recipients
                .iter()
                .all(|r| r.status == RecipientStatus::Delivered)
    }

    /// Mark `user_id`'s row delivered. Returns false when the id is not a
    /// recipient; already-delivered rows are left untouched.
    pub fn mark_delivered(&mut self, user_id: &UserId, delivered_at: i64) -> bool {
        match self.recipients.iter_mut().find(|r| r.user_id == *user_id) {
            Some(row) => {
                if row.status != RecipientStatus::Delivered {
                    row.status = RecipientStatus::Delivered;
                    row.delivered_at = delivered_at;
                }
                true
            }
            None => false,
        }
    }

    /// Copy for the wire: local-only fields cleared.
    pub fn for_wire(&self) -> Self {
        let mut item = self.clone();
        item.local_file_path = None;
        item.remote_number = None;
        item
    }
}

impl MessageRecipient {
    /// A fresh, unacknowledged recipient row.
    pub fn undelivered(user_id: UserId) -> Self {
        Self {
            user_id,
            status: RecipientStatus::Undelivered,
            delivered_at: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(b: u8) -> UserId {
        UserId([b; 32])
    }

    #[test]
    fn test_delivery_marking() {
        let mut item = MessageItem::new_text(uid(1), vec![uid(2), uid(3)], b"hey", 100);
        assert!(!item.is_delivered_to(&uid(2)));
        assert!(!item.is_delivered_to_all());

        assert!(item.mark_delivered(&uid(2), 200));
        assert!(item.is_delivered_to(&uid(2)));
        assert!(!item.is_delivered_to_all());

        assert!(item.mark_delivered(&uid(3), 300));
        assert!(item.is_delivered_to_all());

        // Not a recipient.
        assert!(!item.mark_delivered(&uid(9), 400));
    }

    #[test]
    fn test_mark_delivered_keeps_first_timestamp() {
        let mut item = MessageItem::new_text(uid(1), vec![uid(2)], b"hey", 100);
        item.mark_delivered(&uid(2), 200);
        item.mark_delivered(&uid(2), 999);
        assert_eq!(item.recipients[0].delivered_at, 200);
    }

    #[test]
    fn test_rewrite_size_stable() {
        // A delivery-status flip must not change the encoded size; the
        // store rewrites entries in place.
        let mut item = MessageItem::new_text(uid(1), vec![uid(2)], b"payload", 100);
        let before = bincode::serialize(&item).unwrap().len();
        item.mark_delivered(&uid(2), 123_456_789);
        let after = bincode::serialize(&item).unwrap().len();
        assert_eq!(before, after);
    }

    #[test]
    fn test_for_wire_strips_local_fields() {
        let mut item = MessageItem::new_file_attachment(
            uid(1),
            vec![uid(2)],
            "report.pdf".into(),
            1024,
            "/home/a/report.pdf".into(),
            None,
            100,
        );
        item.remote_number = Some(4);
        let wire = item.for_wire();
        assert!(wire.local_file_path.is_none());
        assert!(wire.remote_number.is_none());
        assert_eq!(wire.file_name.as_deref(), Some("report.pdf"));
    }
}
