//! Message types for conversation turns
//!
//! A [`Message`] is one side of a conversation turn: either the user's
//! prompt or the assistant's response. Content is plain text or an
//! ordered list of typed parts (text / image reference).

use serde::{Deserialize, Serialize};

use crate::types::MessageId;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side of the turn
    User,
    /// The model side of the turn
    Assistant,
}

/// One typed part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    /// A run of plain text
    Text {
        /// The text content
        text: String,
    },
    /// A reference to an image (content-addressed or URL)
    Image {
        /// Opaque reference resolved by the caller
        reference: String,
    },
}

/// Message content: plain text, or an ordered list of typed parts.
///
/// Serialized untagged so the wire form is either a JSON string or a
/// JSON array - both shapes round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content
    Text(String),
    /// Ordered typed parts
    Parts(Vec<MessagePart>),
}

impl MessageContent {
    /// Flatten the content to displayable text.
    ///
    /// Image parts contribute their reference in brackets.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    MessagePart::Text { text } => text.clone(),
                    MessagePart::Image { reference } => format!("[image: {}]", reference),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Check whether the content is empty.
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// Attestation metadata attached to an assistant response.
///
/// Opaque to the sync core; carried verbatim so the display layer can
/// verify and render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationInfo {
    /// Attestation provider identifier
    pub provider: String,
    /// Provider-specific signature material
    pub signature: String,
}

/// One side of a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier; the merge engine deduplicates by this id
    pub id: MessageId,
    /// Who authored the message
    pub role: Role,
    /// Plain text or ordered typed parts
    pub content: MessageContent,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Optional attestation metadata for assistant responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationInfo>,
}

impl Message {
    /// Create a message with the given role and content, stamped now.
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            attestation: None,
        }
    }

    /// Create a user message with plain text content.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message with plain text content.
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Override the timestamp (milliseconds).
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach attestation metadata.
    pub fn with_attestation(mut self, attestation: AttestationInfo) -> Self {
        self.attestation = Some(attestation);
        self
    }

    /// Flattened text content for display and summaries.
    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello");
        assert!(msg.attestation.is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn test_plain_text_content_is_json_string() {
        let msg = Message::user("just text");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], serde_json::json!("just text"));
    }

    #[test]
    fn test_parts_content_roundtrip() {
        let content = MessageContent::Parts(vec![
            MessagePart::Text {
                text: "look at this".to_string(),
            },
            MessagePart::Image {
                reference: "blob:abc123".to_string(),
            },
        ]);
        let msg = Message::new(Role::User, content.clone());

        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.content, content);
        assert_eq!(decoded.text(), "look at this\n[image: blob:abc123]");
    }

    #[test]
    fn test_untagged_content_decodes_both_shapes() {
        let text: MessageContent = serde_json::from_str("\"hi\"").unwrap();
        assert_eq!(text, MessageContent::Text("hi".to_string()));

        let parts: MessageContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"}]"#).unwrap();
        assert!(matches!(parts, MessageContent::Parts(ref p) if p.len() == 1));
    }

    #[test]
    fn test_attestation_carried() {
        let msg = Message::assistant("signed").with_attestation(AttestationInfo {
            provider: "tee".to_string(),
            signature: "sig-bytes".to_string(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.attestation.unwrap().provider, "tee");
    }

    #[test]
    fn test_with_timestamp() {
        let msg = Message::user("x").with_timestamp(12345);
        assert_eq!(msg.timestamp, 12345);
    }
}
