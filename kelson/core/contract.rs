//! The lifecycle contract components implement and its conformance check.
//!
//! Components declare the methods they implement through
//! [`Model::capabilities`]. The container compares the declaration with the
//! contract a binding claims once, at resolution time, so a model missing
//! `fit` fails before any run starts instead of halfway through one.

use std::{collections::BTreeSet, fmt};

use kelson_events::Stage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    dataset::{DataLoaderError, Dataset},
    hyperparams::{HyperparamSchema, HyperparameterSet},
};

/// Free-form stage metadata attached to `completed` events.
pub type Metadata = Map<String, Value>;

/// Result type of lifecycle stage methods.
pub type StageResult<T> = Result<T, StageError>;

/// A method a component can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// `Model::load_data`.
    LoadData,
    /// `Model::transform`.
    Transform,
    /// `Model::build`.
    Build,
    /// `Model::fit`.
    Fit,
    /// `DataLoader::load`.
    Load,
    /// `EventSink::emit`.
    Emit,
}

impl Method {
    /// Method name as written in code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoadData => "load_data",
            Self::Transform => "transform",
            Self::Build => "build",
            Self::Fit => "fit",
            Self::Load => "load",
            Self::Emit => "emit",
        }
    }

    /// Method implementing a lifecycle stage.
    #[must_use]
    pub const fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::LoadData => Self::LoadData,
            Stage::Transform => Self::Transform,
            Stage::Build => Self::Build,
            Stage::Fit => Self::Fit,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of methods a component declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Method>);

impl CapabilitySet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set of the given methods.
    #[must_use]
    pub fn of(methods: &[Method]) -> Self {
        Self(methods.iter().copied().collect())
    }

    /// All four lifecycle methods.
    #[must_use]
    pub fn lifecycle() -> Self {
        Self::of(&[Method::LoadData, Method::Transform, Method::Build, Method::Fit])
    }

    /// Adds a method.
    #[must_use]
    pub fn with(mut self, method: Method) -> Self {
        self.0.insert(method);
        self
    }

    /// Removes a method.
    #[must_use]
    pub fn without(mut self, method: Method) -> Self {
        self.0.remove(&method);
        self
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, method: Method) -> bool {
        self.0.contains(&method)
    }

    /// Declared methods in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = Method> + '_ {
        self.0.iter().copied()
    }
}

/// Contract a binding claims its instances satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contract {
    /// Trainable model: `load_data`, `build`, `fit`, optionally `transform`.
    Model,
    /// Dataset producer.
    DataLoader,
    /// Lifecycle event consumer.
    EventSink,
    /// Arbitrary shared service; no required methods.
    Service,
}

impl Contract {
    /// Methods an instance must declare.
    #[must_use]
    pub const fn required(self) -> &'static [Method] {
        match self {
            Self::Model => &[Method::LoadData, Method::Build, Method::Fit],
            Self::DataLoader => &[Method::Load],
            Self::EventSink => &[Method::Emit],
            Self::Service => &[],
        }
    }

    /// First required method missing from `declared`, in declaration order.
    #[must_use]
    pub fn missing(self, declared: &CapabilitySet) -> Option<Method> {
        self.required()
            .iter()
            .copied()
            .find(|method| !declared.contains(*method))
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Model => "Model",
            Self::DataLoader => "DataLoader",
            Self::EventSink => "EventSink",
            Self::Service => "Service",
        })
    }
}

/// Receives metrics a component reports while a stage runs.
pub trait MetricReporter {
    /// Records one metric payload for `stage`.
    fn report(&mut self, stage: Stage, payload: Metadata);
}

/// Reporter discarding every metric; handy when driving a model by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl MetricReporter for NullReporter {
    fn report(&mut self, _stage: Stage, _payload: Metadata) {}
}

/// Per-stage handle given to component methods.
pub struct StageContext<'a> {
    stage: Stage,
    reporter: &'a mut dyn MetricReporter,
    cancel: &'a CancellationToken,
    params: &'a HyperparameterSet,
}

impl<'a> StageContext<'a> {
    /// Creates a context for `stage`.
    pub fn new(
        stage: Stage,
        reporter: &'a mut dyn MetricReporter,
        cancel: &'a CancellationToken,
        params: &'a HyperparameterSet,
    ) -> Self {
        Self {
            stage,
            reporter,
            cancel,
            params,
        }
    }

    /// Stage being executed.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Hyperparameters injected for this run.
    #[must_use]
    pub const fn hyperparameters(&self) -> &HyperparameterSet {
        self.params
    }

    /// Reports a metric immediately. Non-object payloads are wrapped under
    /// `value`.
    pub fn log(&mut self, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        self.reporter.report(self.stage, payload);
    }

    /// True once the caller requested cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns [`StageError::Cancelled`] once cancellation was requested.
    /// Long-running stages call this between epochs.
    pub fn checkpoint(&self) -> StageResult<()> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Outcome of `fit`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Final metrics (loss, accuracy, ...).
    pub metrics: Metadata,
}

impl FitResult {
    /// Empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metric.
    #[must_use]
    pub fn metric(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.to_owned(), value.into());
        self
    }
}

/// A trainable model bound in the container.
///
/// Every stage method has a default body that fails with
/// [`StageError::NotImplemented`]; a model overrides the ones it supports and
/// lists them in [`Model::capabilities`]. The orchestrator only calls declared
/// stages, and skips `transform` (passing the loaded dataset through) when it
/// is not declared.
pub trait Model: Send {
    /// Methods this model implements.
    fn capabilities(&self) -> CapabilitySet;

    /// Declared hyperparameters with their defaults.
    fn hyperparameters(&self) -> HyperparamSchema {
        HyperparamSchema::new()
    }

    /// Receives the run's hyperparameters (defaults, then config, then
    /// overrides) before the first stage. Called once per run.
    fn configure(&mut self, params: &HyperparameterSet) -> StageResult<()> {
        let _ = params;
        Ok(())
    }

    /// Loads raw data.
    fn load_data(&mut self, ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
        let _ = ctx;
        Err(StageError::NotImplemented(Stage::LoadData))
    }

    /// Preprocesses loaded data.
    fn transform(&mut self, data: Dataset, ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
        let _ = (data, ctx);
        Err(StageError::NotImplemented(Stage::Transform))
    }

    /// Prepares internal state and parameters.
    fn build(&mut self, ctx: &mut StageContext<'_>) -> StageResult<Metadata> {
        let _ = ctx;
        Err(StageError::NotImplemented(Stage::Build))
    }

    /// Trains on the prepared data.
    fn fit(&mut self, data: &Dataset, ctx: &mut StageContext<'_>) -> StageResult<FitResult> {
        let _ = (data, ctx);
        Err(StageError::NotImplemented(Stage::Fit))
    }
}

/// Failure raised by a lifecycle stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage method was called but the model does not implement it.
    #[error("`{0}` is not implemented")]
    NotImplemented(Stage),
    /// The stage observed a cancellation request.
    #[error("cancelled")]
    Cancelled,
    /// Model-specific failure with a stable kind (`Diverged`, `InvalidShape`).
    #[error("{kind}: {message}")]
    Domain {
        /// Short machine-readable kind.
        kind: String,
        /// Human-readable detail.
        message: String,
    },
    /// Data loading failure.
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Model-specific failure.
    pub fn domain(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Domain {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Kind reported in `failed` events and on the command line.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::NotImplemented(_) => "NotImplemented",
            Self::Cancelled => "Cancelled",
            Self::Domain { kind, .. } => kind,
            Self::DataLoader(_) => "DataLoaderError",
            Self::Other(_) => "Error",
        }
    }

    /// Human-readable message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Domain { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
