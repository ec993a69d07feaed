//! The embedder-facing log sink.
//!
//! The node core logs through `tracing` macros. Embedders that want the
//! records delivered to their own sink implement [`Logger`] and install a
//! [`LoggerLayer`] in their subscriber:
//!
//! ```no_run
//! use std::sync::Arc;
//! use thunder_core::logger::{Logger, LoggerLayer, Record};
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! struct Stdout;
//! impl Logger for Stdout {
//!     fn log(&self, record: &Record) {
//!         println!("{} {}: {}", record.level, record.target, record.message);
//!     }
//! }
//!
//! let subscriber = tracing_subscriber::registry().with(LoggerLayer::new(Arc::new(Stdout)));
//! tracing::subscriber::set_global_default(subscriber).unwrap();
//! ```

use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Severity of a [`Record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Very detailed tracing
    Trace,
    /// Debugging detail
    Debug,
    /// Normal operation
    Info,
    /// Something unexpected but recoverable
    Warn,
    /// Something failed
    Error,
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// One formatted log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Severity
    pub level: Level,
    /// Module path the event was emitted from
    pub target: String,
    /// The message followed by any structured fields as `key=value`
    pub message: String,
    /// Source file, when known
    pub file: Option<&'static str>,
    /// Source line, when known
    pub line: Option<u32>,
}

/// A best-effort log sink
pub trait Logger: Send + Sync {
    /// Deliver one record
    fn log(&self, record: &Record);
}

/// A `tracing-subscriber` layer forwarding every event to a [`Logger`]
pub struct LoggerLayer {
    logger: Arc<dyn Logger>,
}

impl LoggerLayer {
    /// Wrap a sink
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

impl<S: Subscriber> Layer<S> for LoggerLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);

        self.logger.log(&Record {
            level: meta.level().into(),
            target: meta.target().to_string(),
            message: visitor.message,
            file: meta.file(),
            line: meta.line(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Record>>);

    impl Logger for Capture {
        fn log(&self, record: &Record) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    #[test]
    fn test_layer_forwards_events() {
        let sink = Arc::new(Capture::default());
        let subscriber = tracing_subscriber::registry().with(LoggerLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(peer = "abc", count = 3, "dropping gossip");
            tracing::debug!("plain");
        });

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, Level::Warn);
        assert_eq!(records[0].message, "dropping gossip peer=abc count=3");
        assert_eq!(records[1].message, "plain");
        assert!(records[0].target.contains("logger"));
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error > Level::Warn);
        assert_eq!(Level::from(&tracing::Level::INFO), Level::Info);
        assert_eq!(Level::Trace.to_string(), "TRACE");
    }
}
