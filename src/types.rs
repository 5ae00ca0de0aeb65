//! Event envelopes from the bus and record types of the ZaloOA gateway API

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::HandlerError;

// =============================================================================
// Event Types (from the `zalo.events` exchange)
// =============================================================================

pub const USER_MESSAGE_RECEIVED: &str = "user_message_received";
pub const USER_FOLLOW: &str = "user_follow";
pub const USER_UNFOLLOW: &str = "user_unfollow";

/// Decoded bus message: the type tag plus every other field, untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            fields,
        }
    }

    /// String value of a payload field, if present and a string
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Correlation id for logs (`message_id` when the publisher set one)
    pub fn correlation_id(&self) -> Option<&str> {
        self.str_field("message_id")
    }

    /// Deserialize the payload fields into a typed event
    ///
    /// A missing required field or a field of the wrong type is reported as a
    /// malformed event.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| HandlerError::malformed(&self.event_type, e.to_string()))
    }
}

/// `user_message_received`: a user wrote to the Official Account
#[derive(Debug, Clone, Deserialize)]
pub struct MessageReceived {
    #[serde(deserialize_with = "non_empty_string")]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub oa_id: Option<String>,
    #[serde(default)]
    pub oa_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// `user_follow` / `user_unfollow`
#[derive(Debug, Clone, Deserialize)]
pub struct FollowChanged {
    #[serde(deserialize_with = "non_empty_string")]
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub oa_id: Option<String>,
    #[serde(default)]
    pub oa_name: Option<String>,
    #[serde(default)]
    pub is_follow: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn non_empty_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = String::deserialize(deserializer)?;
    if value.trim().is_empty() {
        return Err(de::Error::custom("must not be empty"));
    }
    Ok(value)
}

// =============================================================================
// Outbound Message Types (to the gateway)
// =============================================================================

/// Message type as the gateway numbers it on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    Image,
    File,
    Sticker,
    Gif,
    Audio,
    Video,
    Location,
    BusinessCard,
    List,
    RequestUserInfo,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Image => 1,
            Self::File => 2,
            Self::Sticker => 3,
            Self::Gif => 4,
            Self::Audio => 5,
            Self::Video => 6,
            Self::Location => 7,
            Self::BusinessCard => 8,
            Self::List => 9,
            Self::RequestUserInfo => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Text,
            1 => Self::Image,
            2 => Self::File,
            3 => Self::Sticker,
            4 => Self::Gif,
            5 => Self::Audio,
            6 => Self::Video,
            7 => Self::Location,
            8 => Self::BusinessCard,
            9 => Self::List,
            10 => Self::RequestUserInfo,
            _ => return None,
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown message type {}", code)))
    }
}

/// Body of `POST {base}/{accountId}/messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessageRequest {
    #[serde(rename = "zaloUserId")]
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

impl OutboundMessageRequest {
    pub fn text(recipient_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            message_type: MessageType::Text,
            text: Some(text.into()),
            attachment_url: None,
            attachment_id: None,
        }
    }

    pub fn image(
        recipient_id: impl Into<String>,
        image_url: impl Into<String>,
        caption: Option<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            message_type: MessageType::Image,
            text: caption,
            attachment_url: Some(image_url.into()),
            attachment_id: None,
        }
    }

    pub fn file(recipient_id: impl Into<String>, attachment_id: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            message_type: MessageType::File,
            text: None,
            attachment_url: None,
            attachment_id: Some(attachment_id.into()),
        }
    }

    pub fn sticker(recipient_id: impl Into<String>, sticker_id: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            message_type: MessageType::Sticker,
            text: None,
            attachment_url: None,
            attachment_id: Some(sticker_id.into()),
        }
    }

    /// A request needs a recipient and at least one content field
    pub fn is_meaningful(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        !self.recipient_id.is_empty()
            && (set(&self.text) || set(&self.attachment_url) || set(&self.attachment_id))
    }
}

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResult {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
}

// =============================================================================
// Gateway Records (read-only)
// =============================================================================

/// Connected Official Account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub oa_id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub auth_type: Option<i32>,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub token_expires_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountList {
    #[serde(default)]
    pub items: Vec<Account>,
    #[serde(default)]
    pub total_count: i64,
}

/// User who followed or wrote to an Official Account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follower {
    #[serde(default)]
    pub id: Option<String>,
    pub zalo_user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_follower: bool,
    #[serde(default)]
    pub last_interaction_at: Option<String>,
    #[serde(default)]
    pub followed_at: Option<String>,
    #[serde(default)]
    pub last_message_preview: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>,
    #[serde(default)]
    pub unread_count: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerPage {
    #[serde(default)]
    pub followers: Vec<Follower>,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i64,
}

/// Message direction relative to the Official Account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl TryFrom<u8> for Direction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Inbound),
            1 => Ok(Self::Outbound),
            other => Err(format!("unknown direction {}", other)),
        }
    }
}

impl From<Direction> for u8 {
    fn from(value: Direction) -> Self {
        match value {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }
}

/// One entry of a conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    #[serde(default)]
    pub zalo_message_id: Option<String>,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub status: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: i64,
}
