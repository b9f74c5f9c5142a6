use std::sync::Arc;

use ferry_common::{LogMessage, MessageType, Notification, NotificationSink, OptionId, Options};
use tracing::{debug, error, info, trace, warn};

/// Writes engine messages to `tracing` and queues the ones the caller
/// asked for as [Notification::LogMessage].
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn NotificationSink>,
    options: Arc<Options>,
    tag: Arc<str>,
}

impl Logger {
    pub fn new(sink: Arc<dyn NotificationSink>, options: Arc<Options>, tag: &str) -> Self {
        Self {
            sink,
            options,
            tag: tag.into(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            sink: self.sink.clone(),
            options: self.options.clone(),
            tag: tag.into(),
        }
    }

    pub fn should_log(&self, kind: MessageType) -> bool {
        match kind {
            MessageType::RawList => self.options.get_bool(OptionId::LoggingRawListing),
            kind => match kind.debug_level() {
                Some(level) => self.options.get_int(OptionId::LoggingDebugLevel) >= level,
                None => true,
            },
        }
    }

    pub fn log(&self, kind: MessageType, text: impl Into<String>) {
        let text = text.into();
        let tag = &*self.tag;
        match kind {
            MessageType::Error => error!(engine = tag, "{text}"),
            MessageType::Status => info!(engine = tag, "{text}"),
            MessageType::Command => debug!(engine = tag, "> {text}"),
            MessageType::Response => debug!(engine = tag, "< {text}"),
            MessageType::DebugWarning => warn!(engine = tag, "{text}"),
            MessageType::DebugInfo | MessageType::DebugVerbose => debug!(engine = tag, "{text}"),
            MessageType::DebugDebug | MessageType::RawList => trace!(engine = tag, "{text}"),
        }
        if self.should_log(kind) {
            self.sink
                .post(Notification::LogMessage(LogMessage::new(kind, text)));
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.log(MessageType::Status, text)
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(MessageType::Error, text)
    }

    pub fn debug(&self, text: impl Into<String>) {
        self.log(MessageType::DebugInfo, text)
    }
}
