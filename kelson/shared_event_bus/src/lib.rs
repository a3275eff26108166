#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Lifecycle event records and the sinks that consume them.
//!
//! The orchestrator emits one [`LifecycleEvent`] per stage transition or metric
//! and hands it to an [`EventSink`]. Sinks are fire-and-forget: a failing sink
//! is reported by the caller and never alters the run.

use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One of the four lifecycle stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Loading raw data.
    LoadData,
    /// Preprocessing loaded data.
    Transform,
    /// Preparing model state.
    Build,
    /// Training.
    Fit,
}

impl Stage {
    /// All stages in execution order.
    pub const ORDER: [Self; 4] = [Self::LoadData, Self::Transform, Self::Build, Self::Fit];

    /// Method name of the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoadData => "load_data",
            Self::Transform => "transform",
            Self::Build => "build",
            Self::Fit => "fit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Run accepted, hyperparameters resolved.
    RunStarted,
    /// A stage is about to execute.
    Started,
    /// A stage returned successfully.
    Completed,
    /// Metric reported by the model while a stage runs.
    Metric,
    /// A stage failed; the run is terminal.
    Failed,
    /// The caller cancelled the run; the run is terminal.
    Cancelled,
    /// Every stage completed.
    RunCompleted,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Metric => "metric",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RunCompleted => "run_completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a stage transition or metric emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Run the event belongs to.
    pub run_id: Uuid,
    /// Position within the run, starting at zero.
    pub sequence: u64,
    /// Stage the event refers to; `None` for run-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// Event kind.
    pub kind: EventKind,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary key-value payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl LifecycleEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        sequence: u64,
        stage: Option<Stage>,
        kind: EventKind,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            sequence,
            stage,
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Payload field lookup.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Consumer of lifecycle events.
pub trait EventSink: Send + Sync {
    /// Accepts an event. Must return promptly; errors are reported by the
    /// caller and never change the run.
    fn emit(&self, event: &LifecycleEvent) -> Result<()>;
}

/// Recording sink with a bounded backlog and live broadcast subscribers.
#[derive(Debug, Clone)]
pub struct MemoryEventSink {
    sender: broadcast::Sender<LifecycleEvent>,
    backlog: Arc<Mutex<VecDeque<LifecycleEvent>>>,
    capacity: usize,
}

impl MemoryEventSink {
    /// Creates a sink retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Events retained in memory, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events of the given kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<LifecycleEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .cloned()
            .collect()
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// File-backed sink appending one JSON event per line.
#[derive(Debug)]
pub struct JsonLinesEventSink {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLinesEventSink {
    /// Opens (or creates) the event log at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Returns the event log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesEventSink {
    fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Reads an event log written by [`JsonLinesEventSink`].
pub fn read_event_log(path: impl AsRef<Path>) -> Result<Vec<LifecycleEvent>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("opening event log {}", path.display()))?;
    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).context("decoding lifecycle event")?);
    }
    Ok(events)
}

/// Tee forwarding every event to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True when no sink is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for FanoutSink {
    /// Every sink sees the event even when an earlier one fails; the first
    /// error is returned.
    fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(event) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
