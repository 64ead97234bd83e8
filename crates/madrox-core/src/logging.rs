//! Process-level logging: tracing init plus the system-stream broadcaster.
//!
//! The system stream is every `tracing` event, converted to a
//! [`SystemLogEvent`] by a capture layer, appended to `system.jsonl` under the
//! log directory, and fanned out to any live WebSocket subscribers through a
//! broadcast channel. Lagged or dropped receivers are pruned by the channel
//! itself; emission never blocks.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Buffered entries per subscriber before the channel drops the laggard.
const LOG_CHANNEL_CAPACITY: usize = 512;

static INIT: OnceLock<()> = OnceLock::new();
static SYSTEM_TX: OnceLock<broadcast::Sender<SystemLogEvent>> = OnceLock::new();

/// One record on the system log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLogEvent {
    pub timestamp: String,
    pub level: String,
    pub module: String,
    pub line: Option<u32>,
    pub message: String,
}

fn system_tx() -> &'static broadcast::Sender<SystemLogEvent> {
    SYSTEM_TX.get_or_init(|| broadcast::channel(LOG_CHANNEL_CAPACITY).0)
}

/// Subscribe to the live system log stream.
pub fn subscribe_system() -> broadcast::Receiver<SystemLogEvent> {
    system_tx().subscribe()
}

/// Directory for append-only log files (`MADROX_LOG_DIR`, default `./logs`).
pub fn log_dir() -> PathBuf {
    std::env::var("MADROX_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./logs"))
}

fn parse_level() -> tracing::Level {
    match std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing from `LOG_LEVEL`.
///
/// Installs a stderr fmt layer plus the system-stream capture layer. Safe to
/// call multiple times; only the first call initializes the subscriber. Never
/// returns an error.
pub fn init() {
    if INIT.get().is_some() {
        return;
    }
    let level = parse_level();
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level);
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(SystemCaptureLayer {
            file: log_dir().join("system.jsonl"),
        })
        .try_init();
    let _ = INIT.set(());
}

/// Converts tracing events into [`SystemLogEvent`]s, appends them to the
/// system log file, and broadcasts them.
struct SystemCaptureLayer {
    file: PathBuf,
}

impl SystemCaptureLayer {
    fn append(&self, event: &SystemLogEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Some(parent) = self.file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.file) {
            let _ = writeln!(f, "{line}");
        }
    }
}

impl<S> Layer<S> for SystemCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        let record = SystemLogEvent {
            timestamp: Utc::now().to_rfc3339(),
            level: meta.level().to_string(),
            module: meta.target().to_string(),
            line: meta.line(),
            message: visitor.0,
        };
        self.append(&record);
        // Ignore send errors (no subscribers).
        let _ = system_tx().send(record);
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        } else if self.0.is_empty() {
            self.0 = format!("{}={value:?}", field.name());
        } else {
            self.0.push_str(&format!(", {}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        } else if self.0.is_empty() {
            self.0 = format!("{}={value}", field.name());
        } else {
            self.0.push_str(&format!(", {}={value}", field.name()));
        }
    }
}
