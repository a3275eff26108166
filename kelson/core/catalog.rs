//! Named implementations and the bootstrap that turns config into a sealed
//! container.

use std::{fmt, path::PathBuf, sync::Arc};

use indexmap::IndexMap;
use kelson_events::{EventSink, FanoutSink, JsonLinesEventSink, MemoryEventSink};

use crate::{
    config::ConfigTree,
    container::{model_capability, BindingSpec, Container, ContainerError, DATA_LOADER, EVENT_SINK},
    contract::{Contract, Model},
    dataset::{CsvDataLoader, DataLoader, SyntheticDataLoader},
    models::{LinearRegression, MeanBaseline},
};

/// Default event log of the `jsonl` sink.
pub const DEFAULT_EVENT_LOG: &str = "storage/logs/events.jsonl";

/// Capability the configured sink moves to when observers are attached.
pub const PRIMARY_SINK: &str = "EventSink:primary";

/// Builds the binding of an implementation for a capability.
pub type Provider =
    Arc<dyn Fn(&str, &ConfigTree) -> Result<BindingSpec, ContainerError> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    contract: Contract,
    provider: Provider,
}

/// Implementations selectable by name from configuration.
#[derive(Clone, Default)]
pub struct ComponentCatalog {
    entries: IndexMap<String, Entry>,
}

impl ComponentCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the components shipped with Kelson.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new()
            .provider("synthetic", Contract::DataLoader, |capability, config| {
                let samples = config.get_u64("data.samples").unwrap_or(128);
                let features = config.get_u64("data.features").unwrap_or(4);
                let seed = config.get_u64("data.seed").unwrap_or(42);
                let loader = SyntheticDataLoader::new(to_usize(samples), to_usize(features), seed);
                Ok(
                    BindingSpec::data_loader(capability, move |_| Ok(loader.clone()))
                        .implementation("synthetic"),
                )
            })
            .provider("csv", Contract::DataLoader, |capability, config| {
                let path = PathBuf::from(config.require_str("data.path")?);
                let headers = config
                    .get("data.headers")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                Ok(BindingSpec::data_loader(capability, move |_| {
                    let loader = CsvDataLoader::new(&path);
                    Ok(if headers { loader } else { loader.without_headers() })
                })
                .implementation("csv"))
            })
            .provider("memory", Contract::EventSink, |capability, _| {
                Ok(
                    BindingSpec::event_sink(capability, |_| Ok(MemoryEventSink::default()))
                        .implementation("memory"),
                )
            })
            .provider("jsonl", Contract::EventSink, |capability, config| {
                let path = PathBuf::from(config.get_str("events.path").unwrap_or(DEFAULT_EVENT_LOG));
                Ok(
                    BindingSpec::event_sink(capability, move |_| JsonLinesEventSink::new(&path))
                        .implementation("jsonl"),
                )
            })
            .model("LinearRegression", LinearRegression::new)
            .model("MeanBaseline", MeanBaseline::new)
    }

    /// Adds an implementation.
    #[must_use]
    pub fn provider<F>(mut self, name: &str, contract: Contract, provider: F) -> Self
    where
        F: Fn(&str, &ConfigTree) -> Result<BindingSpec, ContainerError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_owned(),
            Entry {
                contract,
                provider: Arc::new(provider),
            },
        );
        self
    }

    /// Adds a model built from the shared data loader.
    #[must_use]
    pub fn model<M, F>(self, name: &str, build: F) -> Self
    where
        M: Model + 'static,
        F: Fn(Arc<dyn DataLoader>) -> M + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        let implementation = name.to_owned();
        self.provider(name, Contract::Model, move |capability, _| {
            let build = Arc::clone(&build);
            Ok(BindingSpec::model(capability, move |deps| {
                Ok(build(deps.data_loader(DATA_LOADER)?))
            })
            .depends_on(DATA_LOADER)
            .implementation(implementation.clone()))
        })
    }

    /// Contract of a named implementation.
    #[must_use]
    pub fn contract(&self, name: &str) -> Option<Contract> {
        self.entries.get(name).map(|entry| entry.contract)
    }

    /// Implementation names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Names of catalogued models.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.contract == Contract::Model)
            .map(|(name, _)| name.as_str())
    }

    /// Binding of implementation `name` for `capability`.
    pub fn bind(&self, capability: &str, name: &str, config: &ConfigTree) -> Result<BindingSpec, ContainerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ContainerError::UnknownImplementation {
                capability: capability.to_owned(),
                implementation: name.to_owned(),
            })?;
        (entry.provider)(capability, config)
    }
}

impl fmt::Debug for ComponentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCatalog")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Assembles the container for a project.
///
/// Precedence, lowest first: built-in defaults (`DataLoader → synthetic`,
/// `EventSink → memory`), one `Model:<Name>` binding per catalogued model,
/// selections from `ml.bindings` and `data.loader`, then bindings passed to
/// [`Bootstrap::bind`]. Model bindings receive their `ml.models.<Name>` layer.
pub struct Bootstrap {
    config: ConfigTree,
    catalog: ComponentCatalog,
    explicit: Vec<BindingSpec>,
    observers: Vec<Arc<dyn EventSink>>,
}

impl Bootstrap {
    /// Bootstrap over `config` with the built-in catalog.
    #[must_use]
    pub fn new(config: ConfigTree) -> Self {
        Self {
            config,
            catalog: ComponentCatalog::with_builtins(),
            explicit: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Replaces the catalog.
    #[must_use]
    pub fn catalog(mut self, catalog: ComponentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Adds a binding that wins over defaults and configuration.
    #[must_use]
    pub fn bind(mut self, spec: BindingSpec) -> Self {
        self.explicit.push(spec);
        self
    }

    /// Tees every lifecycle event to `sink` in addition to the configured sink.
    #[must_use]
    pub fn observe(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.observers.push(sink);
        self
    }

    /// Registers everything and seals the container.
    pub fn build(self) -> Result<Arc<Container>, ContainerError> {
        let mut specs: IndexMap<String, BindingSpec> = IndexMap::new();
        let mut select = |spec: BindingSpec| {
            specs.insert(spec.capability().to_owned(), spec);
        };

        select(self.catalog.bind(DATA_LOADER, "synthetic", &self.config)?);
        select(self.catalog.bind(EVENT_SINK, "memory", &self.config)?);
        for name in self.catalog.models() {
            let capability = model_capability(name);
            let spec = self.catalog.bind(&capability, name, &self.config)?;
            select(spec.overrides(self.config.model_layer(name)?));
        }
        for (capability, implementation) in self.config.bindings()? {
            let mut spec = self.catalog.bind(&capability, &implementation, &self.config)?;
            if let Some(model) = capability.strip_prefix("Model:") {
                spec = spec.overrides(self.config.model_layer(model)?);
            }
            select(spec);
        }
        for spec in self.explicit {
            select(spec);
        }

        if !self.observers.is_empty() {
            if let Some(primary) = specs.shift_remove(EVENT_SINK) {
                specs.insert(PRIMARY_SINK.to_owned(), primary.renamed(PRIMARY_SINK));
            }
            let observers = self.observers;
            let fanout = BindingSpec::event_sink(EVENT_SINK, move |deps| {
                let mut fanout = FanoutSink::new();
                if deps.get(PRIMARY_SINK).is_some() {
                    fanout = fanout.with(deps.event_sink(PRIMARY_SINK)?);
                }
                Ok(observers
                    .iter()
                    .fold(fanout, |fanout, sink| fanout.with(Arc::clone(sink))))
            })
            .implementation("fanout");
            let fanout = if specs.contains_key(PRIMARY_SINK) {
                fanout.depends_on(PRIMARY_SINK)
            } else {
                fanout
            };
            specs.insert(EVENT_SINK.to_owned(), fanout);
        }

        let container = Container::new();
        for spec in specs.into_values() {
            container.register(spec)?;
        }
        container.seal();
        Ok(Arc::new(container))
    }
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("catalog", &self.catalog)
            .field("explicit", &self.explicit)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{container::Lifecycle, hyperparams::ParamValue};
    use kelson_events::{EventKind, LifecycleEvent};
    use serde_json::{json, Map};
    use std::fs;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn defaults_register_builtins_and_seal() {
        let container = Bootstrap::new(ConfigTree::empty()).build().unwrap();
        assert!(container.is_sealed());
        let listing = container.bindings();
        let names: Vec<&str> = listing.iter().map(|b| b.capability.as_str()).collect();
        assert_eq!(
            names,
            vec!["DataLoader", "EventSink", "Model:LinearRegression", "Model:MeanBaseline"]
        );
        assert_eq!(listing[0].implementation.as_deref(), Some("synthetic"));
        assert_eq!(listing[2].dependencies, vec![DATA_LOADER]);
        assert_eq!(listing[2].lifecycle, Lifecycle::Singleton);
        assert!(container.resolve_model("Model:LinearRegression").is_ok());
    }

    #[test]
    fn config_selects_implementations_and_layers() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("iris.csv");
        fs::write(&csv, "a,b,label\n1,2,0\n3,4,1\n").unwrap();
        let config = ConfigTree::from_value(json!({
            "data": { "loader": "csv", "path": csv.to_string_lossy() },
            "ml": {
                "bindings": { "Model:Iris": "LinearRegression" },
                "models": { "Iris": { "learning_rate": 0.01 } }
            }
        }));
        let container = Bootstrap::new(config).build().unwrap();
        let loader = container.resolve_data_loader(DATA_LOADER).unwrap();
        assert_eq!(loader.load().unwrap().len(), 2);
        assert_eq!(
            container.overrides("Model:Iris").unwrap().get("learning_rate"),
            Some(&ParamValue::Float(0.01))
        );
        assert!(container.resolve_model("Model:Iris").is_ok());
    }

    #[test]
    fn unknown_implementation_fails_fast() {
        let config = ConfigTree::from_value(json!({ "data": { "loader": "parquet" } }));
        let err = Bootstrap::new(config).build().unwrap_err();
        assert!(matches!(
            err,
            ContainerError::UnknownImplementation { ref implementation, .. } if implementation == "parquet"
        ));
    }

    #[test]
    fn csv_loader_requires_path() {
        let config = ConfigTree::from_value(json!({ "data": { "loader": "csv" } }));
        assert!(matches!(
            Bootstrap::new(config).build(),
            Err(ContainerError::Config(_))
        ));
    }

    #[test]
    fn explicit_binding_wins_over_config() {
        let sink = MemoryEventSink::new(4);
        let config = ConfigTree::from_value(json!({ "ml": { "bindings": { "EventSink": "jsonl" } } }));
        let container = Bootstrap::new(config)
            .bind(BindingSpec::shared_sink(EVENT_SINK, Arc::new(sink.clone())))
            .build()
            .unwrap();
        let resolved = container.resolve_sink(EVENT_SINK).unwrap();
        resolved
            .emit(&LifecycleEvent::new(Uuid::nil(), 0, None, EventKind::RunStarted, Map::new()))
            .unwrap();
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[test]
    fn observers_receive_events_next_to_configured_sink() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("events.jsonl");
        let config = ConfigTree::from_value(json!({
            "ml": { "bindings": { "EventSink": "jsonl" } },
            "events": { "path": log.to_string_lossy() }
        }));
        let observer = MemoryEventSink::new(4);
        let container = Bootstrap::new(config)
            .observe(Arc::new(observer.clone()))
            .build()
            .unwrap();
        assert!(container.contains(PRIMARY_SINK));
        let sink = container.resolve_sink(EVENT_SINK).unwrap();
        sink.emit(&LifecycleEvent::new(Uuid::nil(), 0, None, EventKind::RunStarted, Map::new()))
            .unwrap();
        assert_eq!(observer.snapshot().len(), 1);
        assert_eq!(kelson_events::read_event_log(&log).unwrap().len(), 1);
    }

    #[test]
    fn custom_catalog_model_is_bound() {
        let catalog = ComponentCatalog::with_builtins().model("Iris", MeanBaseline::new);
        assert_eq!(catalog.contract("Iris"), Some(Contract::Model));
        assert!(catalog.models().any(|name| name == "Iris"));
        let container = Bootstrap::new(ConfigTree::empty())
            .catalog(catalog)
            .build()
            .unwrap();
        assert!(container.resolve_model("Model:Iris").is_ok());
    }
}
