use std::{
    fmt::Write as _,
    io::{self, Write},
};

use anyhow::Result;
use kelson_events::{EventKind, EventSink, LifecycleEvent};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Terminal sink rendering stage progress and a metrics table.
pub struct ConsoleDashboard {
    out: Mutex<Box<dyn Write + Send>>,
    state: Mutex<DashboardState>,
}

#[derive(Default)]
struct DashboardState {
    total_epochs: Option<u64>,
    rows: usize,
}

impl ConsoleDashboard {
    /// Dashboard writing to stdout.
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    /// Dashboard writing to `out`.
    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            state: Mutex::new(DashboardState::default()),
        }
    }

    fn render(&self, event: &LifecycleEvent) -> String {
        let stage = event.stage.map_or("run", |stage| stage.as_str());
        let mut state = self.state.lock();
        let mut line = String::new();
        match event.kind {
            EventKind::RunStarted => {
                let model = event.field("model").and_then(Value::as_str).unwrap_or("model");
                let params = event.field("hyperparameters").and_then(Value::as_object);
                state.total_epochs = params
                    .and_then(|params| params.get("epochs"))
                    .and_then(Value::as_u64);
                state.rows = 0;
                let _ = writeln!(line, "Training {model} (run {})", event.run_id);
                if let Some(params) = params.filter(|params| !params.is_empty()) {
                    let _ = writeln!(line, "  hyperparameters: {}", inline(params));
                }
            }
            EventKind::Started => {
                let _ = writeln!(line, "  > {stage}");
            }
            EventKind::Completed => {
                let _ = writeln!(line, "  ok {stage} {}", inline(&event.payload));
            }
            EventKind::Metric => {
                if state.rows == 0 {
                    let _ = writeln!(line, "    {:>7}  {:>10}  {:>10}", "epoch", "loss", "accuracy");
                }
                state.rows += 1;
                let epoch = event
                    .field("epoch")
                    .map_or_else(|| state.rows.to_string(), Value::to_string);
                let epoch = match state.total_epochs {
                    Some(total) => format!("{epoch}/{total}"),
                    None => epoch,
                };
                let loss = number(event.field("loss"));
                let accuracy = number(event.field("accuracy").or_else(|| event.field("acc")));
                let _ = writeln!(line, "    {epoch:>7}  {loss:>10}  {accuracy:>10}");
            }
            EventKind::Failed => {
                let kind = event.field("kind").and_then(Value::as_str).unwrap_or("Error");
                let message = event.field("message").and_then(Value::as_str).unwrap_or_default();
                let _ = writeln!(line, "  FAILED {stage}: {kind}: {message}");
            }
            EventKind::Cancelled => {
                let _ = writeln!(line, "  cancelled during {stage}");
            }
            EventKind::RunCompleted => {
                let _ = writeln!(line, "Training completed");
            }
        }
        line
    }
}

impl EventSink for ConsoleDashboard {
    fn emit(&self, event: &LifecycleEvent) -> Result<()> {
        let rendered = self.render(event);
        let mut out = self.out.lock();
        out.write_all(rendered.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

fn number(value: Option<&Value>) -> String {
    match value.and_then(Value::as_f64) {
        Some(number) => format!("{number:.4}"),
        None => "N/A".to_owned(),
    }
}

fn inline(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kelson_events::Stage;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn event(sequence: u64, stage: Option<Stage>, kind: EventKind, payload: Value) -> LifecycleEvent {
        let payload = payload.as_object().cloned().unwrap_or_default();
        LifecycleEvent::new(Uuid::nil(), sequence, stage, kind, payload)
    }

    #[test]
    fn renders_metric_rows_with_epoch_progress() {
        let buffer = Buffer::default();
        let dashboard = ConsoleDashboard::with_writer(Box::new(buffer.clone()));
        let events = [
            event(0, None, EventKind::RunStarted, json!({ "model": "Iris", "hyperparameters": { "epochs": 2 } })),
            event(1, Some(Stage::Fit), EventKind::Started, json!({})),
            event(2, Some(Stage::Fit), EventKind::Metric, json!({ "epoch": 1, "loss": 0.5 })),
            event(3, Some(Stage::Fit), EventKind::Metric, json!({ "epoch": 2, "loss": 0.25, "accuracy": 0.9 })),
            event(4, Some(Stage::Fit), EventKind::Failed, json!({ "kind": "Diverged", "message": "nan" })),
        ];
        for event in &events {
            dashboard.emit(event).unwrap();
        }
        let output = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert!(output.contains("Training Iris"));
        assert!(output.contains("1/2"));
        assert!(output.contains("0.2500"));
        assert!(output.contains("0.9000"));
        assert!(output.contains("N/A"));
        assert!(output.contains("FAILED fit: Diverged: nan"));
    }
}
