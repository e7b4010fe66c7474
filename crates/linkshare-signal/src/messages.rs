//! Signal protocol messages
//!
//! Every frame is a JSON object discriminated by an `@type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Discriminator field carried by every message
pub const TYPE_FIELD: &str = "@type";

/// Messages sent from the server to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Newly issued token for this connection
    Refresh { token: String },

    /// Pairing succeeded
    Connected,

    /// Pair target is not a live token
    CodeNotFound { code: String },

    /// Relayed payload from another group member
    Content { content: Value, sender: String },

    /// Sent right before the server force-closes the connection
    Disconnected,

    /// Sent before closing because the client sent a malformed message
    Disconnect,
}

impl ServerMessage {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> String {
        // Every variant is a plain object of strings and JSON values
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Messages received from a client
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Pair with the connection holding `target`
    Pair { target: String },

    /// Relay an opaque payload to the rest of the group
    Content { content: Value },

    /// Any other discriminator; accepted and ignored
    Unknown(String),
}

impl ClientMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Interpret an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        // Only an absent discriminator is a violation; odd values are just unknown kinds
        let kind = match fields.remove(TYPE_FIELD) {
            Some(Value::String(kind)) => kind,
            Some(other) => return Ok(ClientMessage::Unknown(other.to_string())),
            None => return Err(ProtocolError::MissingType),
        };

        match kind.as_str() {
            "pair" => match fields.remove("target") {
                Some(Value::String(target)) => Ok(ClientMessage::Pair { target }),
                _ => Err(ProtocolError::InvalidField {
                    field: "target",
                    expected: "string",
                }),
            },
            "content" => Ok(ClientMessage::Content {
                content: fields.remove("content").unwrap_or(Value::Null),
            }),
            _ => Ok(ClientMessage::Unknown(kind)),
        }
    }

    /// Whether this message resets the inactivity deadline
    pub fn is_activity(&self) -> bool {
        !matches!(self, ClientMessage::Unknown(_))
    }
}
