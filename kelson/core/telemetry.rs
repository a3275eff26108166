use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use kelson_events::{EventSink, LifecycleEvent};
use kelson_logging::{JsonLogger, LogLevel, LogRecord};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Builder for run telemetry.
pub struct RunTelemetryBuilder {
    module: String,
    logger: Option<JsonLogger>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RunTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            logger: None,
            sink: None,
        }
    }

    /// Sets the structured log file writer.
    #[must_use]
    pub fn logger(mut self, logger: JsonLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the telemetry handle.
    #[must_use]
    pub fn build(self) -> RunTelemetry {
        RunTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger: self.logger,
                sink: self.sink,
                failures: AtomicU64::new(0),
            }),
        }
    }
}

/// Log and event outlet of the orchestrator. Neither a log nor a sink failure
/// ever reaches the caller; failures are counted and traced.
#[derive(Clone)]
pub struct RunTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    sink: Option<Arc<dyn EventSink>>,
    failures: AtomicU64,
}

impl fmt::Debug for RunTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.as_ref().map(JsonLogger::path))
            .field("sink", &self.inner.sink.is_some())
            .finish()
    }
}

impl RunTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> RunTelemetryBuilder {
        RunTelemetryBuilder::new(module)
    }

    /// Writes a structured log record when a log file is configured.
    pub fn log(&self, level: LogLevel, message: &str, run_id: Option<Uuid>, metadata: Value) {
        let Some(logger) = &self.inner.logger else {
            return;
        };
        let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
        record.run_id = run_id;
        if let Err(err) = logger.log(&record) {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, path = %logger.path().display(), "log write failed");
        }
    }

    /// Hands an event to the sink.
    pub fn emit(&self, event: &LifecycleEvent) {
        let Some(sink) = &self.inner.sink else {
            return;
        };
        if let Err(err) = sink.emit(event) {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %err,
                run_id = %event.run_id,
                kind = %event.kind,
                "event sink rejected lifecycle event"
            );
        }
    }

    /// Number of log writes or emissions that failed so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kelson_events::{EventKind, MemoryEventSink, Stage};
    use serde_json::{json, Map};
    use tempfile::tempdir;

    struct BrokenSink;

    impl EventSink for BrokenSink {
        fn emit(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    fn event() -> LifecycleEvent {
        LifecycleEvent::new(Uuid::new_v4(), 0, Some(Stage::Fit), EventKind::Started, Map::new())
    }

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("kelson.log");
        let sink = MemoryEventSink::new(8);
        let telemetry = RunTelemetry::builder("orchestrator")
            .logger(JsonLogger::new(&path).unwrap())
            .sink(Arc::new(sink.clone()))
            .build();
        let run_id = Uuid::new_v4();
        telemetry.log(LogLevel::Info, "run.started", Some(run_id), json!({ "model": "Iris" }));
        telemetry.emit(&event());

        let records = kelson_logging::read_records(&path).unwrap();
        assert_eq!(records[0].message, "run.started");
        assert_eq!(records[0].run_id, Some(run_id));
        assert_eq!(sink.snapshot().len(), 1);
        assert_eq!(telemetry.failures(), 0);
    }

    #[test]
    fn sink_failures_are_counted_not_raised() {
        let telemetry = RunTelemetry::builder("orchestrator")
            .sink(Arc::new(BrokenSink))
            .build();
        telemetry.emit(&event());
        telemetry.emit(&event());
        assert_eq!(telemetry.failures(), 2);
    }
}
