//! Event envelope codec: raw delivery bytes to [`EventEnvelope`]

use serde_json::Value;

use crate::error::DecodeError;
use crate::types::EventEnvelope;

/// Decode a delivery body (UTF-8 JSON object with an `event_type` string)
pub fn decode(payload: &[u8]) -> Result<EventEnvelope, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let value: Value = serde_json::from_str(text)?;

    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let event_type = match fields.remove("event_type") {
        Some(Value::String(tag)) if !tag.is_empty() => tag,
        _ => return Err(DecodeError::MissingEventType),
    };

    Ok(EventEnvelope::new(event_type, fields))
}

/// Encode an envelope back to the wire format
pub fn encode(envelope: &EventEnvelope) -> Vec<u8> {
    let mut fields = envelope.fields.clone();
    fields.insert(
        "event_type".to_string(),
        Value::String(envelope.event_type.clone()),
    );
    Value::Object(fields).to_string().into_bytes()
}

/// Short, log-safe rendering of a payload
pub fn preview(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}
