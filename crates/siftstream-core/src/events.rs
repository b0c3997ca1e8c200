use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted to consumers of the stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsumerEvent {
    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "success")]
    Success { message: String, record: Value },

    /// Server warnings carry their record; locally raised warnings
    /// (undecodable lines, end of stream) do not.
    #[serde(rename = "warning")]
    Warning {
        message: String,
        record: Option<Value>,
    },

    #[serde(rename = "delete")]
    Delete { record: Value },

    #[serde(rename = "tick")]
    Tick { record: Value },

    #[serde(rename = "interaction")]
    Interaction { record: Value },

    #[serde(rename = "unknown_event")]
    UnknownEvent { record: Value },

    #[serde(rename = "debug")]
    Debug { message: String },

    #[serde(rename = "recycle")]
    Recycle,
}

impl ConsumerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::Success { .. } => "success",
            Self::Warning { .. } => "warning",
            Self::Delete { .. } => "delete",
            Self::Tick { .. } => "tick",
            Self::Interaction { .. } => "interaction",
            Self::UnknownEvent { .. } => "unknownEvent",
            Self::Debug { .. } => "debug",
            Self::Recycle => "recycle",
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
            record: None,
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::Debug {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
