//! Error taxonomy for the dispatch pipeline
//!
//! Decode failures are terminal (acked, never retried). Handler failures are
//! handed to the acknowledgment controller, which requeues them.

use thiserror::Error;

/// Payload could not be turned into an event envelope
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no string `event_type` field")]
    MissingEventType,
}

/// Gateway API call failed
///
/// `status` is `None` for transport-level failures (connect, timeout, TLS)
/// and for requests refused before they reach the wire (`rejected`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("outbound call failed ({}): {message}", status_label(.status, .rejected))]
pub struct OutboundCallError {
    pub status: Option<u16>,
    pub message: String,
    /// Refused locally; retrying the same request cannot succeed
    pub rejected: bool,
}

fn status_label(status: &Option<u16>, rejected: &bool) -> String {
    match status {
        Some(code) => code.to_string(),
        None if *rejected => "rejected".to_string(),
        None => "transport".to_string(),
    }
}

impl OutboundCallError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            rejected: false,
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            rejected: false,
        }
    }

    /// Request refused by the client without any HTTP call
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            rejected: true,
        }
    }

    /// True for failures a later attempt might not hit (transport, 408, 429, 5xx)
    pub fn is_transient(&self) -> bool {
        if self.rejected {
            return false;
        }
        match self.status {
            None => true,
            Some(code) => code == 408 || code == 429 || code >= 500,
        }
    }
}

impl From<reqwest::Error> for OutboundCallError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::status(status.as_u16(), err.to_string()),
            None => Self::transport(err.to_string()),
        }
    }
}

/// Handler could not finish processing an event
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed `{event_type}` event: {reason}")]
    MalformedEvent { event_type: String, reason: String },

    #[error(transparent)]
    Outbound(#[from] OutboundCallError),

    #[error("no gateway account known for oa_id '{oa_id}'")]
    UnresolvedAccount { oa_id: String },

    #[error("`{event_type}` handler panicked: {message}")]
    Panicked { event_type: String, message: String },
}

impl HandlerError {
    pub fn malformed(event_type: &str, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event_type: event_type.to_string(),
            reason: reason.into(),
        }
    }
}
