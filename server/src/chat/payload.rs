//! The JSON message envelope exchanged over the chat endpoint.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::UserId;

/// Reserved type for delivery receipts emitted by the server.
pub const TYPE_SEND_STATUS: &str = "send-status";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{0}")]
    Parse(#[from] serde_json::Error),
    #[error("message type is empty")]
    EmptyType,
    #[error("sender is required for non-bot messages")]
    MissingSender,
}

/// A routable chat message. Unknown `type` values pass through unchanged;
/// only `send-status` has meaning to the server itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    message_type: String,
    sender: UserId,
    #[serde(default)]
    recipients: Vec<UserId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    binary: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl MessagePayload {
    pub fn new(
        message_type: impl Into<String>,
        sender: UserId,
        recipients: Vec<UserId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            sender,
            recipients,
            text: text.into(),
            data: None,
            time: None,
            binary: false,
        }
    }

    /// Parse and validate an envelope from raw frame bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_slice(data)?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.message_type.is_empty() {
            return Err(PayloadError::EmptyType);
        }
        // Sender 0 is only legal for server-synthesized receipts and
        // bot-only messages.
        if self.sender == 0 && !self.is_for_bot() && !self.is_type_of_sent_status() {
            return Err(PayloadError::MissingSender);
        }
        Ok(())
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn sender(&self) -> UserId {
        self.sender
    }

    pub fn recipients(&self) -> &[UserId] {
        &self.recipients
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Carried in the envelope but routing still emits TEXT frames.
    /// TODO: emit BINARY frames when this is set.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Bot messages carry no addressable recipients; they are served by the
    /// listener fan-out only.
    pub fn is_for_bot(&self) -> bool {
        self.recipients.is_empty() || self.recipients.iter().all(|&r| r == 0)
    }

    pub fn is_type_of_sent_status(&self) -> bool {
        self.message_type == TYPE_SEND_STATUS
    }

    /// Narrow the recipient list to a single user, e.g. before enqueueing an
    /// undeliverable copy or reporting a per-recipient delivery.
    pub fn with_recipient(mut self, recipient: UserId) -> Self {
        self.recipients = vec![recipient];
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Build the delivery receipt sent back to the original sender after a
    /// successful transport write.
    pub fn create_send_status(delivered: &MessagePayload) -> Self {
        Self {
            message_type: TYPE_SEND_STATUS.to_string(),
            sender: 0,
            recipients: vec![delivered.sender],
            text: String::new(),
            data: Some(serde_json::json!({ "recipients": delivered.recipients })),
            time: Some(chrono::Utc::now().to_rfc3339()),
            binary: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_envelope() {
        let raw = br#"{"type":"text","sender":10,"recipients":[20,30],"text":"hi","data":{"k":1},"time":"2024-01-01T00:00:00Z"}"#;
        let payload = MessagePayload::from_slice(raw).unwrap();
        assert_eq!(payload.message_type(), "text");
        assert_eq!(payload.sender(), 10);
        assert_eq!(payload.recipients(), &[20, 30]);
        assert_eq!(payload.text(), "hi");
        assert!(!payload.is_for_bot());
        assert!(!payload.is_binary());
    }

    #[test]
    fn unknown_types_pass_through() {
        let raw = br#"{"type":"whatever-v2","sender":1,"recipients":[2]}"#;
        let payload = MessagePayload::from_slice(raw).unwrap();
        let json = payload.to_json().unwrap();
        assert!(json.contains("whatever-v2"));
    }

    #[test]
    fn missing_sender_is_a_parse_error() {
        let raw = br#"{"type":"text","recipients":[2]}"#;
        assert!(matches!(
            MessagePayload::from_slice(raw),
            Err(PayloadError::Parse(_))
        ));
    }

    #[test]
    fn zero_sender_rejected_unless_bot_or_status() {
        let raw = br#"{"type":"text","sender":0,"recipients":[2]}"#;
        assert!(matches!(
            MessagePayload::from_slice(raw),
            Err(PayloadError::MissingSender)
        ));

        let bot = br#"{"type":"text","sender":0,"recipients":[]}"#;
        assert!(MessagePayload::from_slice(bot).is_ok());

        let status = br#"{"type":"send-status","sender":0,"recipients":[2]}"#;
        assert!(MessagePayload::from_slice(status).is_ok());
    }

    #[test]
    fn empty_type_rejected() {
        let raw = br#"{"type":"","sender":1,"recipients":[2]}"#;
        assert!(matches!(
            MessagePayload::from_slice(raw),
            Err(PayloadError::EmptyType)
        ));
    }

    #[test]
    fn bot_detection() {
        assert!(MessagePayload::new("text", 1, vec![], "x").is_for_bot());
        assert!(MessagePayload::new("text", 1, vec![0], "x").is_for_bot());
        assert!(!MessagePayload::new("text", 1, vec![0, 2], "x").is_for_bot());
    }

    #[test]
    fn with_recipient_narrows_the_list() {
        let payload = MessagePayload::new("text", 1, vec![2, 3], "x").with_recipient(3);
        assert_eq!(payload.recipients(), &[3]);
    }

    #[test]
    fn send_status_addresses_the_original_sender() {
        let original = MessagePayload::new("text", 10, vec![20, 30], "hi");
        let status = MessagePayload::create_send_status(&original);
        assert!(status.is_type_of_sent_status());
        assert_eq!(status.sender(), 0);
        assert_eq!(status.recipients(), &[10]);
        assert_eq!(
            status.data().unwrap()["recipients"],
            serde_json::json!([20, 30])
        );
        assert!(status.time.is_some());
    }
}
