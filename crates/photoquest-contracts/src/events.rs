use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Destination for structured pipeline events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value>;
}

/// Emits an event and reports sink failures on stderr instead of propagating them.
pub fn emit_best_effort(sink: &dyn EventSink, event_type: &str, payload: EventPayload) {
    if let Err(err) = sink.emit(event_type, payload) {
        eprintln!("photoquest event '{event_type}' not recorded: {err:#}");
    }
}

/// Append-only writer for an `events.jsonl` file.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct JsonlEventWriter {
    inner: Arc<JsonlEventWriterInner>,
}

#[derive(Debug)]
struct JsonlEventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl JsonlEventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JsonlEventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }
}

impl EventSink for JsonlEventWriter {
    fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = build_event(event_type, &self.inner.session_id, payload);

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(event)
    }
}

/// Keeps emitted events in memory; used by tests and by callers that forward events elsewhere.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    session_id: String,
    events: Mutex<Vec<Value>>,
}

impl MemoryEventSink {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Value> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|event| event.get("type").and_then(Value::as_str) == Some(event_type))
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = build_event(event_type, &self.session_id, payload);
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("memory event sink lock poisoned"))?
            .push(event.clone());
        Ok(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        Ok(build_event(event_type, "", payload))
    }
}

fn build_event(event_type: &str, session_id: &str, payload: EventPayload) -> Value {
    let mut event = Map::new();
    event.insert("type".to_string(), Value::String(event_type.to_string()));
    event.insert(
        "session_id".to_string(),
        Value::String(session_id.to_string()),
    );
    event.insert("ts".to_string(), Value::String(now_utc_iso()));
    for (key, value) in payload {
        event.insert(key, value);
    }
    Value::Object(event)
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
