use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Status,
    Error,
    /// Sent to the server
    Command,
    /// Received from the server
    Response,
    DebugWarning,
    DebugInfo,
    DebugVerbose,
    DebugDebug,
    /// Raw directory listing lines
    RawList,
}

impl MessageType {
    /// Minimum `LoggingDebugLevel` at which the message is shown to the
    /// caller, `None` for messages that are always shown.
    pub fn debug_level(&self) -> Option<i64> {
        match self {
            MessageType::DebugWarning => Some(1),
            MessageType::DebugInfo => Some(2),
            MessageType::DebugVerbose => Some(3),
            MessageType::DebugDebug => Some(4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub kind: MessageType,
    pub text: String,
    pub time: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(kind: MessageType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            time: Utc::now(),
        }
    }
}
