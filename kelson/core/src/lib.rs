#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Kelson core: service container, component contract, and the model
//! lifecycle orchestrator.

/// Typed hyperparameter schemas and precedence resolution.
#[path = "../hyperparams.rs"]
pub mod hyperparams;

/// Project configuration tree.
#[path = "../config.rs"]
pub mod config;

/// Datasets and data loaders.
#[path = "../dataset.rs"]
pub mod dataset;

/// Component contract and stage context.
#[path = "../contract.rs"]
pub mod contract;

/// Service container.
#[path = "../container.rs"]
pub mod container;

/// Built-in models.
#[path = "../models.rs"]
pub mod models;

/// Implementation catalog and bootstrap.
#[path = "../catalog.rs"]
pub mod catalog;

/// Structured log and event outlet for runs.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Lifecycle orchestrator.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

/// Project and model scaffolding.
#[path = "../scaffold.rs"]
pub mod scaffold;

pub use catalog::{Bootstrap, ComponentCatalog, Provider, DEFAULT_EVENT_LOG, PRIMARY_SINK};
pub use config::{ConfigError, ConfigTree};
pub use container::{
    model_capability, BindingDescriptor, BindingSpec, Container, ContainerError, Dependencies,
    Factory, Instance, Lifecycle, SharedModel, Violation, DATA_LOADER, EVENT_SINK,
};
pub use contract::{
    CapabilitySet, Contract, FitResult, Metadata, Method, MetricReporter, Model, NullReporter,
    StageContext, StageError, StageResult,
};
pub use dataset::{CsvDataLoader, DataLoader, DataLoaderError, DataPoint, Dataset, SyntheticDataLoader};
pub use hyperparams::{
    parse_override, parse_overrides, HyperparamSchema, HyperparameterError, HyperparameterSet,
    ParamKind, ParamLayer, ParamSpec, ParamValue,
};
pub use models::{LinearRegression, MeanBaseline};
pub use orchestrator::{
    LifecycleRun, MetricsSummary, Orchestrator, RunResult, RunState, TrainingError,
};
pub use scaffold::{generate_model_file, scaffold_project, to_snake_case, ScaffoldError};
pub use telemetry::{RunTelemetry, RunTelemetryBuilder};

pub use kelson_events::{EventKind, EventSink, LifecycleEvent, Stage};
pub use tokio_util::sync::CancellationToken;
