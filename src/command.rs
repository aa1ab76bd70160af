//! Replicated command protocol.
//!
//! A [`Command`] is the only thing that ever travels through the Raft log. It is encoded as a
//! small JSON object (`{"op":"set","key":"k","value":"v"}` / `{"op":"delete","key":"k"}`) and
//! decoded again by every replica when the entry commits.

use serde::{Deserialize, Serialize};

/// A committed mutation of the key-value map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Wire shape of an encoded command.
#[derive(Serialize)]
struct WireCommand<'a> {
    op: &'a str,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
}

/// Decoded wire shape, validated into a [`Command`] afterwards so that an unknown `op` can be
/// told apart from malformed input.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommand {
    op: String,
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Bytes are not a well-formed command object.
    Decode { reason: String },
    /// Well-formed object carrying an operation this store does not know.
    UnsupportedOperation { op: String },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode { reason } => write!(f, "decode command: {reason}"),
            Self::UnsupportedOperation { op } => write!(f, "unsupported operation: {op}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let wire = match self {
            Self::Set { key, value } => WireCommand {
                op: "set",
                key,
                value: Some(value),
            },
            Self::Delete { key } => WireCommand {
                op: "delete",
                key,
                value: None,
            },
        };
        serde_json::to_vec(&wire).expect("string-only command serializes")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let wire: RawCommand =
            serde_json::from_slice(bytes).map_err(|e| CommandError::Decode {
                reason: e.to_string(),
            })?;

        if wire.key.is_empty() {
            return Err(CommandError::Decode {
                reason: "empty key".to_string(),
            });
        }

        match wire.op.as_str() {
            "set" => {
                let value = wire.value.ok_or_else(|| CommandError::Decode {
                    reason: "set requires a value".to_string(),
                })?;
                Ok(Self::Set {
                    key: wire.key,
                    value,
                })
            }
            "delete" => Ok(Self::Delete { key: wire.key }),
            _ => Err(CommandError::UnsupportedOperation { op: wire.op }),
        }
    }
}
