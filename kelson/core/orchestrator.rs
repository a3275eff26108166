//! Lifecycle orchestrator driving `load_data → transform → build → fit`.
//!
//! One call to [`Orchestrator::run`] is one lifecycle run: resolve the model,
//! inject its hyperparameters, execute each declared stage in order, and
//! report every transition to the event sink. Runs never retry; the first
//! failing stage makes the run terminal.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use kelson_events::{EventKind, LifecycleEvent, Stage};
use kelson_logging::{JsonLogger, LogLevel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    container::{model_capability, Container, ContainerError, EVENT_SINK},
    contract::{FitResult, Metadata, Method, MetricReporter, Model, StageContext, StageError, StageResult},
    dataset::Dataset,
    hyperparams::{HyperparameterSet, ParamLayer},
    telemetry::RunTelemetry,
};

/// State of a lifecycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted, nothing executed yet.
    Created,
    /// `load_data` running.
    LoadingData,
    /// `transform` running.
    Transforming,
    /// `build` running.
    Building,
    /// `fit` running.
    Fitting,
    /// Every stage succeeded.
    Completed,
    /// A stage failed or the run was cancelled.
    Failed,
}

impl RunState {
    /// State entered when `stage` starts.
    #[must_use]
    pub const fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::LoadData => Self::LoadingData,
            Stage::Transform => Self::Transforming,
            Stage::Build => Self::Building,
            Stage::Fit => Self::Fitting,
        }
    }

    /// True for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal edges of the state machine. `Transforming` may be skipped.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        match (self, to) {
            (from, Self::Failed) => !from.is_terminal(),
            (Self::Created, Self::LoadingData)
            | (Self::LoadingData, Self::Transforming | Self::Building)
            | (Self::Transforming, Self::Building)
            | (Self::Building, Self::Fitting)
            | (Self::Fitting, Self::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::LoadingData => "loading_data",
            Self::Transforming => "transforming",
            Self::Building => "building",
            Self::Fitting => "fitting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Bookkeeping of one run.
#[derive(Debug, Clone)]
pub struct LifecycleRun {
    run_id: Uuid,
    model: String,
    state: RunState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    next_sequence: u64,
    metric_events: usize,
    last_metric: Map<String, Value>,
    events: Vec<LifecycleEvent>,
}

impl LifecycleRun {
    /// New run in `Created`.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            model: model.into(),
            state: RunState::Created,
            started_at: Utc::now(),
            finished_at: None,
            next_sequence: 0,
            metric_events: 0,
            last_metric: Map::new(),
            events: Vec::new(),
        }
    }

    /// Run identifier.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Events emitted so far.
    #[must_use]
    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// Moves to `to`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, to: RunState) -> Result<(), TrainingError> {
        if !self.state.can_transition(to) {
            return Err(TrainingError::InvalidTransition {
                run_id: self.run_id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    fn record(
        &mut self,
        telemetry: &RunTelemetry,
        stage: Option<Stage>,
        kind: EventKind,
        payload: Map<String, Value>,
    ) {
        if kind == EventKind::Metric {
            self.metric_events += 1;
            self.last_metric.clone_from(&payload);
        }
        let event = LifecycleEvent::new(self.run_id, self.next_sequence, stage, kind, payload);
        self.next_sequence += 1;
        telemetry.emit(&event);
        self.events.push(event);
    }
}

/// Metric reporter tied to a run; each report becomes a `metric` event.
struct RunRecorder<'a> {
    run: &'a mut LifecycleRun,
    telemetry: &'a RunTelemetry,
}

impl MetricReporter for RunRecorder<'_> {
    fn report(&mut self, stage: Stage, payload: Metadata) {
        self.run
            .record(self.telemetry, Some(stage), EventKind::Metric, payload);
    }
}

/// Aggregated metrics of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Number of `metric` events emitted.
    pub metric_events: usize,
    /// Payload of the last `metric` event.
    pub last: Map<String, Value>,
    /// Final metrics returned by `fit`.
    pub fit: Map<String, Value>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Run identifier.
    pub run_id: Uuid,
    /// Model name (without the `Model:` prefix).
    pub model: String,
    /// Terminal state; always `Completed` for a returned result.
    pub status: RunState,
    /// Hyperparameters injected into the model.
    pub hyperparameters: HyperparameterSet,
    /// Metrics gathered during the run.
    pub metrics_summary: MetricsSummary,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Every event emitted, in sequence order.
    pub events: Vec<LifecycleEvent>,
}

impl RunResult {
    /// Events of one kind.
    #[must_use]
    pub fn events_of(&self, kind: EventKind) -> Vec<&LifecycleEvent> {
        self.events.iter().filter(|event| event.kind == kind).collect()
    }
}

enum Interruption {
    Cancelled(Stage),
    Stage(Stage, StageError),
    Transition(TrainingError),
}

/// Drives lifecycle runs against a sealed container.
pub struct Orchestrator {
    container: Arc<Container>,
    telemetry: RunTelemetry,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("container", &self.container)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator emitting to the container's `EventSink`.
    pub fn new(container: Arc<Container>) -> Result<Self, ContainerError> {
        if !container.is_sealed() {
            return Err(ContainerError::NotSealed);
        }
        let sink = container.resolve_sink(EVENT_SINK)?;
        Ok(Self {
            container,
            telemetry: RunTelemetry::builder("orchestrator").sink(sink).build(),
        })
    }

    /// Also writes structured log records to `logger`.
    pub fn with_logger(mut self, logger: JsonLogger) -> Result<Self, ContainerError> {
        let sink = self.container.resolve_sink(EVENT_SINK)?;
        self.telemetry = RunTelemetry::builder("orchestrator")
            .sink(sink)
            .logger(logger)
            .build();
        Ok(self)
    }

    /// Telemetry handle, e.g. to inspect failure counts.
    #[must_use]
    pub const fn telemetry(&self) -> &RunTelemetry {
        &self.telemetry
    }

    /// Trains `Model:<model>` once.
    pub fn run(
        &self,
        model: &str,
        overrides: &ParamLayer,
        cancel: &CancellationToken,
    ) -> Result<RunResult, TrainingError> {
        if !self.container.is_sealed() {
            return Err(ContainerError::NotSealed.into());
        }
        let capability = model_capability(model);
        let shared = self.container.resolve_model(&capability)?;
        let mut instance = shared.lock();

        let config = self.container.overrides(&capability).unwrap_or_default();
        let params = instance
            .hyperparameters()
            .resolve(&config, overrides)
            .map_err(|source| ContainerError::Hyperparameter {
                capability: capability.clone(),
                source,
            })?;
        instance
            .configure(&params)
            .map_err(|err| ContainerError::Construction {
                capability: capability.clone(),
                source: anyhow::Error::new(err),
            })?;

        let mut run = LifecycleRun::new(model);
        let hyperparameters = Value::Object(params.to_json());
        info!(run_id = %run.run_id, model, "lifecycle run started");
        self.telemetry.log(
            LogLevel::Info,
            "run.started",
            Some(run.run_id),
            json!({ "model": model, "hyperparameters": hyperparameters }),
        );
        run.record(
            &self.telemetry,
            None,
            EventKind::RunStarted,
            object(json!({ "model": model, "hyperparameters": hyperparameters })),
        );

        match self.drive(&mut *instance, &params, &mut run, cancel) {
            Ok(fit) => self.complete(run, params, fit),
            Err(interruption) => Err(self.interrupt(&mut run, interruption)),
        }
    }

    fn drive(
        &self,
        model: &mut dyn Model,
        params: &HyperparameterSet,
        run: &mut LifecycleRun,
        cancel: &CancellationToken,
    ) -> Result<FitResult, Interruption> {
        let declared = model.capabilities();
        let data = self.stage(
            run,
            Stage::LoadData,
            params,
            cancel,
            |ctx| model.load_data(ctx),
            Dataset::summary,
        )?;
        let data = if declared.contains(Method::Transform) {
            self.stage(
                run,
                Stage::Transform,
                params,
                cancel,
                |ctx| model.transform(data, ctx),
                Dataset::summary,
            )?
        } else {
            data
        };
        self.stage(
            run,
            Stage::Build,
            params,
            cancel,
            |ctx| model.build(ctx),
            |metadata: &Metadata| metadata.clone(),
        )?;
        self.stage(
            run,
            Stage::Fit,
            params,
            cancel,
            |ctx| model.fit(&data, ctx),
            |fit: &FitResult| fit.metrics.clone(),
        )
    }

    fn stage<T>(
        &self,
        run: &mut LifecycleRun,
        stage: Stage,
        params: &HyperparameterSet,
        cancel: &CancellationToken,
        body: impl FnOnce(&mut StageContext<'_>) -> StageResult<T>,
        summarize: impl FnOnce(&T) -> Metadata,
    ) -> Result<T, Interruption> {
        if cancel.is_cancelled() {
            return Err(Interruption::Cancelled(stage));
        }
        run.transition(RunState::for_stage(stage))
            .map_err(Interruption::Transition)?;
        run.record(&self.telemetry, Some(stage), EventKind::Started, Map::new());

        let outcome = {
            let mut recorder = RunRecorder {
                run: &mut *run,
                telemetry: &self.telemetry,
            };
            let mut ctx = StageContext::new(stage, &mut recorder, cancel, params);
            body(&mut ctx)
        };
        match outcome {
            Ok(value) => {
                run.record(&self.telemetry, Some(stage), EventKind::Completed, summarize(&value));
                Ok(value)
            }
            Err(StageError::Cancelled) => Err(Interruption::Cancelled(stage)),
            Err(err) => Err(Interruption::Stage(stage, err)),
        }
    }

    fn complete(
        &self,
        mut run: LifecycleRun,
        hyperparameters: HyperparameterSet,
        fit: FitResult,
    ) -> Result<RunResult, TrainingError> {
        run.transition(RunState::Completed)?;
        run.record(
            &self.telemetry,
            None,
            EventKind::RunCompleted,
            object(json!({ "metrics": fit.metrics })),
        );
        info!(run_id = %run.run_id, model = %run.model, "lifecycle run completed");
        self.telemetry.log(
            LogLevel::Info,
            "run.completed",
            Some(run.run_id),
            json!({ "model": run.model, "metrics": fit.metrics }),
        );
        Ok(RunResult {
            run_id: run.run_id,
            status: run.state,
            hyperparameters,
            metrics_summary: MetricsSummary {
                metric_events: run.metric_events,
                last: run.last_metric,
                fit: fit.metrics,
            },
            started_at: run.started_at,
            finished_at: run.finished_at.unwrap_or_else(Utc::now),
            model: run.model,
            events: run.events,
        })
    }

    fn interrupt(&self, run: &mut LifecycleRun, interruption: Interruption) -> TrainingError {
        if !run.state.is_terminal() {
            run.state = RunState::Failed;
            run.finished_at = Some(Utc::now());
        }
        match interruption {
            Interruption::Cancelled(stage) => {
                let metric_events = run.metric_events;
                run.record(
                    &self.telemetry,
                    Some(stage),
                    EventKind::Cancelled,
                    object(json!({ "kind": "Cancelled", "metric_events": metric_events })),
                );
                self.telemetry.log(
                    LogLevel::Warn,
                    "run.cancelled",
                    Some(run.run_id),
                    json!({ "model": run.model, "stage": stage }),
                );
                TrainingError::Cancelled {
                    run_id: run.run_id,
                    stage,
                }
            }
            Interruption::Stage(stage, err) => {
                let kind = err.kind().to_owned();
                let message = err.message();
                run.record(
                    &self.telemetry,
                    Some(stage),
                    EventKind::Failed,
                    object(json!({ "kind": kind, "message": message })),
                );
                self.telemetry.log(
                    LogLevel::Error,
                    "run.failed",
                    Some(run.run_id),
                    json!({ "model": run.model, "stage": stage, "kind": kind, "message": message }),
                );
                TrainingError::TrainingFailed {
                    run_id: run.run_id,
                    stage,
                    kind,
                    message,
                }
            }
            Interruption::Transition(err) => err,
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Run-time errors.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// The run could not start (unknown model, contract, hyperparameters).
    #[error(transparent)]
    Setup(#[from] ContainerError),
    /// A stage failed.
    #[error("run {run_id} failed during `{stage}`: {kind}: {message}")]
    TrainingFailed {
        /// Run identifier.
        run_id: Uuid,
        /// Failing stage.
        stage: Stage,
        /// Error kind.
        kind: String,
        /// Error detail.
        message: String,
    },
    /// The caller cancelled the run.
    #[error("run {run_id} cancelled at `{stage}`")]
    Cancelled {
        /// Run identifier.
        run_id: Uuid,
        /// Stage that was running or about to run.
        stage: Stage,
    },
    /// The state machine rejected a transition.
    #[error("run {run_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Run identifier.
        run_id: Uuid,
        /// Current state.
        from: RunState,
        /// Requested state.
        to: RunState,
    },
}

impl TrainingError {
    /// Run identifier, when a run was started.
    #[must_use]
    pub const fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Setup(_) => None,
            Self::TrainingFailed { run_id, .. }
            | Self::Cancelled { run_id, .. }
            | Self::InvalidTransition { run_id, .. } => Some(*run_id),
        }
    }

    /// Stage the run stopped in.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::TrainingFailed { stage, .. } | Self::Cancelled { stage, .. } => Some(*stage),
            Self::Setup(_) | Self::InvalidTransition { .. } => None,
        }
    }

    /// Short error kind for the command line.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Setup(_) => "SetupError",
            Self::TrainingFailed { kind, .. } => kind,
            Self::Cancelled { .. } => "Cancelled",
            Self::InvalidTransition { .. } => "InvalidTransition",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::Bootstrap,
        config::ConfigTree,
        container::{BindingSpec, DATA_LOADER},
        contract::CapabilitySet,
        dataset::{DataLoader, DataLoaderError, DataPoint, SyntheticDataLoader},
        hyperparams::{parse_overrides, HyperparamSchema, ParamValue},
    };
    use kelson_events::MemoryEventSink;
    use parking_lot::Mutex;

    /// Scripted model recording what each stage received.
    struct Scripted {
        loader: Arc<dyn DataLoader>,
        declares_transform: bool,
        fail_at_epoch: Option<usize>,
        cancel_at_epoch: Option<(usize, CancellationToken)>,
        seen: Arc<Mutex<Seen>>,
    }

    #[derive(Default)]
    struct Seen {
        learning_rate: Option<f64>,
        built_with: Option<usize>,
        fit_with: Option<Dataset>,
        loaded: Option<Dataset>,
    }

    impl Scripted {
        fn new(seen: &Arc<Mutex<Seen>>) -> Self {
            Self {
                loader: Arc::new(SyntheticDataLoader::new(8, 2, 3)),
                declares_transform: true,
                fail_at_epoch: None,
                cancel_at_epoch: None,
                seen: Arc::clone(seen),
            }
        }
    }

    impl Model for Scripted {
        fn capabilities(&self) -> CapabilitySet {
            let all = CapabilitySet::lifecycle();
            if self.declares_transform {
                all
            } else {
                all.without(Method::Transform)
            }
        }

        fn hyperparameters(&self) -> HyperparamSchema {
            HyperparamSchema::new().float("learning_rate", 0.1).int("epochs", 5)
        }

        fn configure(&mut self, params: &HyperparameterSet) -> StageResult<()> {
            self.seen.lock().learning_rate = params.float("learning_rate");
            Ok(())
        }

        fn load_data(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
            let data = self.loader.load()?;
            self.seen.lock().loaded = Some(data.clone());
            Ok(data)
        }

        fn transform(&mut self, mut data: Dataset, _ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
            data.name.push_str("-transformed");
            Ok(data)
        }

        fn build(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<Metadata> {
            self.seen.lock().built_with = Some(1);
            Ok(object(json!({ "layers": 1 })))
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        fn fit(&mut self, data: &Dataset, ctx: &mut StageContext<'_>) -> StageResult<FitResult> {
            self.seen.lock().fit_with = Some(data.clone());
            let epochs = ctx.hyperparameters().int("epochs").unwrap_or(5) as usize;
            for epoch in 1..=epochs {
                if let Some((at, token)) = &self.cancel_at_epoch {
                    if *at == epoch {
                        token.cancel();
                    }
                }
                ctx.checkpoint()?;
                if self.fail_at_epoch == Some(epoch) {
                    return Err(StageError::domain("Diverged", format!("loss exploded at epoch {epoch}")));
                }
                ctx.log(json!({ "epoch": epoch, "loss": 1.0 / epoch as f64 }));
            }
            Ok(FitResult::new().metric("loss", 0.2))
        }
    }

    fn setup(model: Scripted, config: ParamLayer) -> (Orchestrator, MemoryEventSink) {
        let sink = MemoryEventSink::new(256);
        let container = Container::new();
        container
            .register(BindingSpec::shared_sink(EVENT_SINK, Arc::new(sink.clone())))
            .unwrap();
        container
            .register(BindingSpec::data_loader(DATA_LOADER, |_| Ok(SyntheticDataLoader::default())))
            .unwrap();
        let model = Mutex::new(Some(model));
        container
            .register(
                BindingSpec::model("Model:Iris", move |_| {
                    model
                        .lock()
                        .take()
                        .ok_or_else(|| anyhow::anyhow!("scripted model already taken"))
                })
                .overrides(config),
            )
            .unwrap();
        container.seal();
        (Orchestrator::new(Arc::new(container)).unwrap(), sink)
    }

    fn kinds(events: &[LifecycleEvent]) -> Vec<(Option<Stage>, EventKind)> {
        events.iter().map(|event| (event.stage, event.kind)).collect()
    }

    #[test]
    fn full_run_emits_ordered_events() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (orchestrator, sink) = setup(Scripted::new(&seen), ParamLayer::new());
        let overrides = parse_overrides(["epochs=2"]).unwrap();
        let result = orchestrator
            .run("Iris", &overrides, &CancellationToken::new())
            .unwrap();

        assert_eq!(result.status, RunState::Completed);
        let expected = vec![
            (None, EventKind::RunStarted),
            (Some(Stage::LoadData), EventKind::Started),
            (Some(Stage::LoadData), EventKind::Completed),
            (Some(Stage::Transform), EventKind::Started),
            (Some(Stage::Transform), EventKind::Completed),
            (Some(Stage::Build), EventKind::Started),
            (Some(Stage::Build), EventKind::Completed),
            (Some(Stage::Fit), EventKind::Started),
            (Some(Stage::Fit), EventKind::Metric),
            (Some(Stage::Fit), EventKind::Metric),
            (Some(Stage::Fit), EventKind::Completed),
            (None, EventKind::RunCompleted),
        ];
        assert_eq!(kinds(&result.events), expected);
        assert_eq!(kinds(&sink.snapshot()), expected);

        let sequences: Vec<u64> = result.events.iter().map(|event| event.sequence).collect();
        assert_eq!(sequences, (0..12).collect::<Vec<u64>>());
        assert!(result.events.iter().all(|event| event.run_id == result.run_id));
        assert_eq!(result.metrics_summary.metric_events, 2);
        assert_eq!(result.metrics_summary.last["epoch"], json!(2));
        assert_eq!(result.metrics_summary.fit["loss"], json!(0.2));
        assert!(result.started_at <= result.finished_at);
        assert_eq!(result.events_of(EventKind::Started)[0].payload, Map::new());
        assert_eq!(result.events_of(EventKind::Completed)[2].payload["layers"], json!(1));
    }

    #[test]
    fn unknown_model_is_a_setup_error() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (orchestrator, sink) = setup(Scripted::new(&seen), ParamLayer::new());
        let err = orchestrator
            .run("Missing", &ParamLayer::new(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            TrainingError::Setup(ContainerError::UnknownBinding { ref capability }) if capability == "Model:Missing"
        ));
        assert!(err.run_id().is_none());
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn model_without_transform_passes_data_through() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let mut model = Scripted::new(&seen);
        model.declares_transform = false;
        let (orchestrator, _sink) = setup(model, ParamLayer::new());
        let result = orchestrator
            .run("Iris", &ParamLayer::new(), &CancellationToken::new())
            .unwrap();

        assert!(result
            .events
            .iter()
            .all(|event| event.stage != Some(Stage::Transform)));
        let seen = seen.lock();
        assert_eq!(seen.fit_with, seen.loaded);
        assert_eq!(seen.built_with, Some(1));
    }

    #[test]
    fn override_beats_config() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let config: ParamLayer = [("learning_rate".to_owned(), ParamValue::Float(0.01))]
            .into_iter()
            .collect();
        let (orchestrator, _sink) = setup(Scripted::new(&seen), config);
        let overrides = parse_overrides(["learning_rate=0.05"]).unwrap();
        let result = orchestrator
            .run("Iris", &overrides, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.hyperparameters.float("learning_rate"), Some(0.05));
        assert_eq!(seen.lock().learning_rate, Some(0.05));

        let result = orchestrator
            .run("Iris", &ParamLayer::new(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.hyperparameters.float("learning_rate"), Some(0.01));
    }

    #[test]
    fn fit_failure_stops_the_run() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let mut model = Scripted::new(&seen);
        model.fail_at_epoch = Some(3);
        let (orchestrator, sink) = setup(model, ParamLayer::new());
        let err = orchestrator
            .run("Iris", &ParamLayer::new(), &CancellationToken::new())
            .unwrap_err();

        match &err {
            TrainingError::TrainingFailed { stage, kind, .. } => {
                assert_eq!(*stage, Stage::Fit);
                assert_eq!(kind, "Diverged");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(sink.of_kind(EventKind::Metric).len(), 2);
        let failed = sink.of_kind(EventKind::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].field("kind"), Some(&json!("Diverged")));
        assert!(sink
            .snapshot()
            .iter()
            .all(|event| !(event.stage == Some(Stage::Fit) && event.kind == EventKind::Completed)));
        assert!(sink.of_kind(EventKind::RunCompleted).is_empty());
    }

    #[test]
    fn cancellation_keeps_emitted_metrics() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let token = CancellationToken::new();
        let mut model = Scripted::new(&seen);
        model.cancel_at_epoch = Some((3, token.clone()));
        let (orchestrator, sink) = setup(model, ParamLayer::new());
        let err = orchestrator.run("Iris", &ParamLayer::new(), &token).unwrap_err();

        assert!(matches!(err, TrainingError::Cancelled { stage: Stage::Fit, .. }));
        assert_eq!(err.kind(), "Cancelled");
        assert_eq!(sink.of_kind(EventKind::Metric).len(), 2);
        let cancelled = sink.of_kind(EventKind::Cancelled);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].field("metric_events"), Some(&json!(2)));
        assert!(sink.of_kind(EventKind::Failed).is_empty());
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (orchestrator, sink) = setup(Scripted::new(&seen), ParamLayer::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = orchestrator.run("Iris", &ParamLayer::new(), &token).unwrap_err();
        assert!(matches!(err, TrainingError::Cancelled { stage: Stage::LoadData, .. }));
        assert!(sink.of_kind(EventKind::Started).is_empty());
        assert!(seen.lock().loaded.is_none());
    }

    #[test]
    fn unknown_override_is_rejected_before_the_run() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let (orchestrator, sink) = setup(Scripted::new(&seen), ParamLayer::new());
        let overrides = parse_overrides(["dropout=0.5"]).unwrap();
        let err = orchestrator
            .run("Iris", &overrides, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            TrainingError::Setup(ContainerError::Hyperparameter { .. })
        ));
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn override_repairs_rejected_config_value() {
        let config = ConfigTree::from_value(json!({
            "ml": { "models": { "LinearRegression": { "learning_rate": 0, "epochs": 2.5 } } }
        }));
        let container = Bootstrap::new(config).build().unwrap();
        let orchestrator = Orchestrator::new(container).unwrap();

        let err = orchestrator
            .run("LinearRegression", &parse_overrides(["epochs=3"]).unwrap(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TrainingError::Setup(ContainerError::Construction { .. })));

        let overrides = parse_overrides(["learning_rate=0.1", "epochs=3"]).unwrap();
        let result = orchestrator
            .run("LinearRegression", &overrides, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.status, RunState::Completed);
        assert_eq!(result.hyperparameters.float("learning_rate"), Some(0.1));
        assert_eq!(result.hyperparameters.int("epochs"), Some(3));
        assert_eq!(result.metrics_summary.metric_events, 3);
    }

    struct RaggedLoader;

    impl DataLoader for RaggedLoader {
        fn load(&self) -> Result<Dataset, DataLoaderError> {
            Ok(Dataset {
                name: "ragged".into(),
                feature_names: Vec::new(),
                samples: vec![
                    DataPoint { features: vec![1.0], label: 0.0 },
                    DataPoint { features: vec![1.0, 2.0], label: 1.0 },
                ],
            })
        }
    }

    #[test]
    fn ragged_dataset_fails_the_run() {
        let sink = MemoryEventSink::new(32);
        let container = Bootstrap::new(ConfigTree::empty())
            .bind(BindingSpec::data_loader(DATA_LOADER, |_| Ok(RaggedLoader)))
            .bind(BindingSpec::shared_sink(EVENT_SINK, Arc::new(sink.clone())))
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(container).unwrap();
        let err = orchestrator
            .run("LinearRegression", &ParamLayer::new(), &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(
            err,
            TrainingError::TrainingFailed { stage: Stage::LoadData, ref kind, .. } if kind == "InvalidShape"
        ));
        let failed = sink.of_kind(EventKind::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].field("kind"), Some(&json!("InvalidShape")));
    }

    #[test]
    fn unsealed_container_is_rejected() {
        let container = Container::new();
        container
            .register(BindingSpec::event_sink(EVENT_SINK, |_| Ok(MemoryEventSink::default())))
            .unwrap();
        assert!(matches!(
            Orchestrator::new(Arc::new(container)),
            Err(ContainerError::NotSealed)
        ));
    }

    #[test]
    fn state_machine_edges() {
        assert!(RunState::Created.can_transition(RunState::LoadingData));
        assert!(RunState::LoadingData.can_transition(RunState::Building));
        assert!(!RunState::Building.can_transition(RunState::Transforming));
        assert!(!RunState::LoadingData.can_transition(RunState::Fitting));
        assert!(RunState::Fitting.can_transition(RunState::Failed));
        assert!(!RunState::Completed.can_transition(RunState::Failed));
        assert!(!RunState::Failed.can_transition(RunState::LoadingData));

        let mut run = LifecycleRun::new("Iris");
        let err = run.transition(RunState::Fitting).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::InvalidTransition {
                from: RunState::Created,
                to: RunState::Fitting,
                ..
            }
        ));
        assert_eq!(run.state(), RunState::Created);
    }
}
