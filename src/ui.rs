//! UI sink: the single fan-in point for build progress output.
//!
//! Two interchangeable encodings of the same event stream: a human-oriented
//! one ([`WriterUi`]) and a machine-readable one-line-per-event format
//! ([`MachineReadableUi`]) for scripting. Plugin-originated events are
//! relayed through the RPC bridge into the same sink.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiEventKind {
    Say,
    Message,
    Error,
    Ask,
}

impl UiEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UiEventKind::Say => "say",
            UiEventKind::Message => "message",
            UiEventKind::Error => "error",
            UiEventKind::Ask => "ask",
        }
    }
}

/// One progress event. Immutable once constructed; `target` is empty for
/// host-level messages and carries the build name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiEvent {
    pub timestamp: u64,
    pub target: String,
    pub kind: UiEventKind,
    pub data: Vec<String>,
}

impl UiEvent {
    pub fn new(kind: UiEventKind, data: Vec<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        UiEvent {
            timestamp,
            target: String::new(),
            kind,
            data,
        }
    }

    fn single(kind: UiEventKind, message: &str) -> Self {
        UiEvent::new(kind, vec![message.to_string()])
    }
}

/// Progress/output reporting. Object-safe and async so a plugin-side proxy
/// can implement it by calling back into the host.
#[async_trait]
pub trait Ui: Send + Sync {
    /// Deliver one event to the sink. Line emission is atomic; events with
    /// a causal order at the call site arrive in that order.
    async fn event(&self, event: UiEvent);

    /// Ask the operator a question and return the answer line.
    async fn ask(&self, query: &str) -> Result<String, CoreError>;

    async fn say(&self, message: &str) {
        self.event(UiEvent::single(UiEventKind::Say, message)).await;
    }

    async fn message(&self, message: &str) {
        self.event(UiEvent::single(UiEventKind::Message, message)).await;
    }

    async fn error(&self, message: &str) {
        self.event(UiEvent::single(UiEventKind::Error, message)).await;
    }
}

/// Human-oriented sink writing free text to a shared writer.
pub struct WriterUi {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterUi {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        WriterUi {
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        WriterUi::new(Box::new(std::io::stdout()))
    }
}

#[async_trait]
impl Ui for WriterUi {
    async fn event(&self, event: UiEvent) {
        let text = event.data.join(" ");
        let line = match event.kind {
            UiEventKind::Say if event.target.is_empty() => format!("{} {text}", "==>".green()),
            UiEventKind::Say => format!("{} {text}", format!("==> {}:", event.target).green()),
            UiEventKind::Message if event.target.is_empty() => text,
            UiEventKind::Message => format!("{}: {text}", event.target),
            UiEventKind::Error => format!("{} {text}", "error:".red().bold()),
            UiEventKind::Ask => text,
        };
        let mut writer = self.writer.lock().expect("ui writer poisoned");
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }

    async fn ask(&self, query: &str) -> Result<String, CoreError> {
        self.event(UiEvent::single(UiEventKind::Ask, query)).await;
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await
        .map_err(|e| CoreError::Build(format!("stdin reader failed: {e}")))??;
        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Machine-readable sink: one escaped, comma-separated line per event.
pub struct MachineReadableUi {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl MachineReadableUi {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        MachineReadableUi {
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        MachineReadableUi::new(Box::new(std::io::stdout()))
    }
}

#[async_trait]
impl Ui for MachineReadableUi {
    async fn event(&self, event: UiEvent) {
        let line = encode_event(&event);
        let mut writer = self.writer.lock().expect("ui writer poisoned");
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }

    async fn ask(&self, query: &str) -> Result<String, CoreError> {
        self.event(UiEvent::single(UiEventKind::Ask, query)).await;
        Err(CoreError::Build(
            "cannot prompt for input in machine-readable mode".to_string(),
        ))
    }
}

/// Wraps another sink and stamps every event with a build name so
/// concurrent builds stay distinguishable.
pub struct TargetedUi {
    target: String,
    inner: Arc<dyn Ui>,
}

impl TargetedUi {
    pub fn new(target: impl Into<String>, inner: Arc<dyn Ui>) -> Self {
        TargetedUi {
            target: target.into(),
            inner,
        }
    }
}

#[async_trait]
impl Ui for TargetedUi {
    async fn event(&self, mut event: UiEvent) {
        if event.target.is_empty() {
            event.target = self.target.clone();
        }
        self.inner.event(event).await;
    }

    async fn ask(&self, query: &str) -> Result<String, CoreError> {
        self.inner.ask(&format!("{}: {query}", self.target)).await
    }
}

/// Encode an event as `timestamp,target,type,data...` with escaping.
pub fn encode_event(event: &UiEvent) -> String {
    let mut fields = Vec::with_capacity(3 + event.data.len());
    fields.push(event.timestamp.to_string());
    fields.push(escape(&event.target));
    fields.push(event.kind.as_str().to_string());
    fields.extend(event.data.iter().map(|d| escape(d)));
    fields.join(",")
}

/// Split a machine-readable line back into unescaped fields.
pub fn decode_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => current.push('\\'),
                Some(',') => current.push(','),
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            ',' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}
