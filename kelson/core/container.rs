//! Service container: named bindings, dependency resolution, lifecycle caching.
//!
//! A binding maps a capability name (`DataLoader`, `Model:Iris`) to a factory,
//! a lifecycle policy, the capabilities it depends on, and the contract its
//! instances must satisfy. Resolution walks dependencies depth-first while
//! tracking the active path, so only revisiting an ancestor is a cycle and
//! diamonds share one singleton.

use std::{
    any::{type_name, Any},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use indexmap::IndexMap;
use kelson_events::EventSink;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    config::ConfigError,
    contract::{CapabilitySet, Contract, Method, Model},
    dataset::DataLoader,
    hyperparams::{HyperparameterError, ParamLayer},
};

/// Capability of the data loader shared by models.
pub const DATA_LOADER: &str = "DataLoader";
/// Capability of the event sink used by the orchestrator.
pub const EVENT_SINK: &str = "EventSink";

/// Capability name of a model binding.
#[must_use]
pub fn model_capability(name: &str) -> String {
    format!("Model:{name}")
}

/// How long a resolved instance lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// One shared instance per container.
    #[default]
    Singleton,
    /// A fresh instance on every resolution.
    Transient,
}

/// Shared handle to a resolved model.
pub type SharedModel = Arc<Mutex<dyn Model>>;

/// Resolved instance, tagged by the contract it implements.
#[derive(Clone)]
pub enum Instance {
    /// Trainable model.
    Model(SharedModel),
    /// Dataset producer.
    DataLoader(Arc<dyn DataLoader>),
    /// Event consumer.
    EventSink(Arc<dyn EventSink>),
    /// Any other shared service.
    Service(Arc<dyn Any + Send + Sync>),
}

impl Instance {
    /// Wraps a model.
    pub fn model(model: impl Model + 'static) -> Self {
        let shared: SharedModel = Arc::new(Mutex::new(model));
        Self::Model(shared)
    }

    /// Wraps a data loader.
    pub fn data_loader(loader: impl DataLoader + 'static) -> Self {
        Self::DataLoader(Arc::new(loader))
    }

    /// Wraps an event sink.
    pub fn event_sink(sink: impl EventSink + 'static) -> Self {
        Self::EventSink(Arc::new(sink))
    }

    /// Wraps an arbitrary service.
    pub fn service<T: Any + Send + Sync>(service: T) -> Self {
        Self::Service(Arc::new(service))
    }

    /// Contract implied by the instance kind.
    #[must_use]
    pub const fn contract(&self) -> Contract {
        match self {
            Self::Model(_) => Contract::Model,
            Self::DataLoader(_) => Contract::DataLoader,
            Self::EventSink(_) => Contract::EventSink,
            Self::Service(_) => Contract::Service,
        }
    }

    /// Methods the instance declares.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        match self {
            Self::Model(model) => model.lock().capabilities(),
            Self::DataLoader(_) => CapabilitySet::of(&[Method::Load]),
            Self::EventSink(_) => CapabilitySet::of(&[Method::Emit]),
            Self::Service(_) => CapabilitySet::new(),
        }
    }

    /// True when both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Model(a), Self::Model(b)) => same_allocation(a, b),
            (Self::DataLoader(a), Self::DataLoader(b)) => same_allocation(a, b),
            (Self::EventSink(a), Self::EventSink(b)) => same_allocation(a, b),
            (Self::Service(a), Self::Service(b)) => same_allocation(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance::{}", self.contract())
    }
}

fn same_allocation<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Factory producing an instance from its resolved dependencies.
pub type Factory = Arc<dyn Fn(&Dependencies) -> anyhow::Result<Instance> + Send + Sync>;

/// Resolved dependencies handed to a factory, keyed by capability.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    resolved: IndexMap<String, Instance>,
}

impl Dependencies {
    fn insert(&mut self, capability: String, instance: Instance) {
        self.resolved.insert(capability, instance);
    }

    /// Raw lookup.
    #[must_use]
    pub fn get(&self, capability: &str) -> Option<&Instance> {
        self.resolved.get(capability)
    }

    /// Number of resolved dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// True without dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Declared data-loader dependency.
    pub fn data_loader(&self, capability: &str) -> anyhow::Result<Arc<dyn DataLoader>> {
        match self.get(capability) {
            Some(Instance::DataLoader(loader)) => Ok(Arc::clone(loader)),
            other => Err(missing_dependency(capability, Contract::DataLoader, other)),
        }
    }

    /// Declared event-sink dependency.
    pub fn event_sink(&self, capability: &str) -> anyhow::Result<Arc<dyn EventSink>> {
        match self.get(capability) {
            Some(Instance::EventSink(sink)) => Ok(Arc::clone(sink)),
            other => Err(missing_dependency(capability, Contract::EventSink, other)),
        }
    }

    /// Declared model dependency.
    pub fn model(&self, capability: &str) -> anyhow::Result<SharedModel> {
        match self.get(capability) {
            Some(Instance::Model(model)) => Ok(Arc::clone(model)),
            other => Err(missing_dependency(capability, Contract::Model, other)),
        }
    }

    /// Declared service dependency of type `T`.
    pub fn service<T: Any + Send + Sync>(&self, capability: &str) -> anyhow::Result<Arc<T>> {
        match self.get(capability) {
            Some(Instance::Service(service)) => Arc::clone(service)
                .downcast::<T>()
                .map_err(|_| anyhow::anyhow!("dependency `{capability}` is not a {}", type_name::<T>())),
            other => Err(missing_dependency(capability, Contract::Service, other)),
        }
    }
}

fn missing_dependency(capability: &str, expected: Contract, found: Option<&Instance>) -> anyhow::Error {
    match found {
        Some(instance) => anyhow::anyhow!(
            "dependency `{capability}` is a {}, expected a {expected}",
            instance.contract()
        ),
        None => anyhow::anyhow!("dependency `{capability}` was not declared"),
    }
}

/// Everything needed to register one binding.
#[derive(Clone)]
pub struct BindingSpec {
    capability: String,
    contract: Contract,
    factory: Factory,
    lifecycle: Lifecycle,
    dependencies: Vec<String>,
    overrides: ParamLayer,
    implementation: Option<String>,
}

impl BindingSpec {
    /// Binding with an untyped factory claiming `contract`.
    pub fn new(capability: impl Into<String>, contract: Contract, factory: Factory) -> Self {
        Self {
            capability: capability.into(),
            contract,
            factory,
            lifecycle: Lifecycle::default(),
            dependencies: Vec::new(),
            overrides: ParamLayer::new(),
            implementation: None,
        }
    }

    /// Model binding.
    pub fn model<M, F>(capability: impl Into<String>, factory: F) -> Self
    where
        M: Model + 'static,
        F: Fn(&Dependencies) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        Self::new(
            capability,
            Contract::Model,
            Arc::new(move |deps: &Dependencies| factory(deps).map(Instance::model)),
        )
    }

    /// Data-loader binding.
    pub fn data_loader<L, F>(capability: impl Into<String>, factory: F) -> Self
    where
        L: DataLoader + 'static,
        F: Fn(&Dependencies) -> anyhow::Result<L> + Send + Sync + 'static,
    {
        Self::new(
            capability,
            Contract::DataLoader,
            Arc::new(move |deps: &Dependencies| factory(deps).map(Instance::data_loader)),
        )
    }

    /// Event-sink binding.
    pub fn event_sink<S, F>(capability: impl Into<String>, factory: F) -> Self
    where
        S: EventSink + 'static,
        F: Fn(&Dependencies) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        Self::new(
            capability,
            Contract::EventSink,
            Arc::new(move |deps: &Dependencies| factory(deps).map(Instance::event_sink)),
        )
    }

    /// Event-sink binding handing out an existing shared sink.
    pub fn shared_sink(capability: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self::new(
            capability,
            Contract::EventSink,
            Arc::new(move |_: &Dependencies| -> anyhow::Result<Instance> {
                Ok(Instance::EventSink(Arc::clone(&sink)))
            }),
        )
    }

    /// Service binding.
    pub fn service<T, F>(capability: impl Into<String>, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Dependencies) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::new(
            capability,
            Contract::Service,
            Arc::new(move |deps: &Dependencies| factory(deps).map(Instance::service)),
        )
    }

    /// Declares a dependency resolved before the factory runs.
    #[must_use]
    pub fn depends_on(mut self, capability: impl Into<String>) -> Self {
        self.dependencies.push(capability.into());
        self
    }

    /// Sets the lifecycle policy.
    #[must_use]
    pub const fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Shorthand for [`Lifecycle::Transient`].
    #[must_use]
    pub const fn transient(self) -> Self {
        self.lifecycle(Lifecycle::Transient)
    }

    /// Config hyperparameter layer of a model binding. It is merged with the
    /// model's defaults and the run's overrides when a run configures the
    /// model, so a run-time override always beats it.
    #[must_use]
    pub fn overrides(mut self, overrides: ParamLayer) -> Self {
        self.overrides = overrides;
        self
    }

    /// Records the implementation name shown in listings.
    #[must_use]
    pub fn implementation(mut self, name: impl Into<String>) -> Self {
        self.implementation = Some(name.into());
        self
    }

    /// Same binding under another capability name.
    #[must_use]
    pub fn renamed(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    /// Capability name.
    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }
}

impl fmt::Debug for BindingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingSpec")
            .field("capability", &self.capability)
            .field("contract", &self.contract)
            .field("lifecycle", &self.lifecycle)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Listing entry for one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingDescriptor {
    /// Capability name.
    pub capability: String,
    /// Implementation name, when registered through the catalog.
    pub implementation: Option<String>,
    /// Claimed contract.
    pub contract: Contract,
    /// Lifecycle policy.
    pub lifecycle: Lifecycle,
    /// Declared dependencies.
    pub dependencies: Vec<String>,
    /// True once a singleton instance exists.
    pub cached: bool,
}

struct Binding {
    spec: BindingSpec,
    cache: OnceCell<Instance>,
}

/// Registry of bindings. `Send + Sync`; share it behind an `Arc`.
#[derive(Default)]
pub struct Container {
    bindings: RwLock<IndexMap<String, Arc<Binding>>>,
    sealed: AtomicBool,
}

impl Container {
    /// Empty, unsealed container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding; the capability must be new.
    pub fn register(&self, spec: BindingSpec) -> Result<(), ContainerError> {
        self.ensure_open()?;
        let mut bindings = self.bindings.write();
        if bindings.contains_key(&spec.capability) {
            return Err(ContainerError::DuplicateBinding {
                capability: spec.capability,
            });
        }
        bindings.insert(spec.capability.clone(), Arc::new(Binding::new(spec)));
        Ok(())
    }

    /// Adds or replaces a binding. A replaced binding loses its cached
    /// instance. Returns true when something was replaced.
    pub fn rebind(&self, spec: BindingSpec) -> Result<bool, ContainerError> {
        self.ensure_open()?;
        let previous = self
            .bindings
            .write()
            .insert(spec.capability.clone(), Arc::new(Binding::new(spec)));
        Ok(previous.is_some())
    }

    /// Removes a binding and its cached instance. Returns true when it existed.
    pub fn forget(&self, capability: &str) -> Result<bool, ContainerError> {
        self.ensure_open()?;
        Ok(self.bindings.write().shift_remove(capability).is_some())
    }

    /// Freezes the binding set.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// True after [`Container::seal`].
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// True when `capability` is bound.
    #[must_use]
    pub fn contains(&self, capability: &str) -> bool {
        self.bindings.read().contains_key(capability)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// True without bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Configured hyperparameter layer of a binding.
    #[must_use]
    pub fn overrides(&self, capability: &str) -> Option<ParamLayer> {
        self.bindings
            .read()
            .get(capability)
            .map(|binding| binding.spec.overrides.clone())
    }

    /// Descriptors of every binding in registration order.
    #[must_use]
    pub fn bindings(&self) -> Vec<BindingDescriptor> {
        self.bindings
            .read()
            .values()
            .map(|binding| BindingDescriptor {
                capability: binding.spec.capability.clone(),
                implementation: binding.spec.implementation.clone(),
                contract: binding.spec.contract,
                lifecycle: binding.spec.lifecycle,
                dependencies: binding.spec.dependencies.clone(),
                cached: binding.cache.get().is_some(),
            })
            .collect()
    }

    /// Resolves `capability` and its dependencies.
    pub fn resolve(&self, capability: &str) -> Result<Instance, ContainerError> {
        let mut path = Vec::new();
        self.resolve_on_path(capability, &mut path)
    }

    /// Resolves a model binding.
    pub fn resolve_model(&self, capability: &str) -> Result<SharedModel, ContainerError> {
        match self.resolve(capability)? {
            Instance::Model(model) => Ok(model),
            other => Err(wrong_kind(capability, Contract::Model, &other)),
        }
    }

    /// Resolves a data-loader binding.
    pub fn resolve_data_loader(&self, capability: &str) -> Result<Arc<dyn DataLoader>, ContainerError> {
        match self.resolve(capability)? {
            Instance::DataLoader(loader) => Ok(loader),
            other => Err(wrong_kind(capability, Contract::DataLoader, &other)),
        }
    }

    /// Resolves an event-sink binding.
    pub fn resolve_sink(&self, capability: &str) -> Result<Arc<dyn EventSink>, ContainerError> {
        match self.resolve(capability)? {
            Instance::EventSink(sink) => Ok(sink),
            other => Err(wrong_kind(capability, Contract::EventSink, &other)),
        }
    }

    /// Resolves a service binding and downcasts it to `T`.
    pub fn resolve_service<T: Any + Send + Sync>(&self, capability: &str) -> Result<Arc<T>, ContainerError> {
        match self.resolve(capability)? {
            Instance::Service(service) => {
                service
                    .downcast::<T>()
                    .map_err(|_| ContainerError::ServiceType {
                        capability: capability.to_owned(),
                        expected: type_name::<T>(),
                    })
            }
            other => Err(wrong_kind(capability, Contract::Service, &other)),
        }
    }

    fn ensure_open(&self) -> Result<(), ContainerError> {
        if self.is_sealed() {
            Err(ContainerError::ContainerSealed)
        } else {
            Ok(())
        }
    }

    fn binding(&self, capability: &str) -> Result<Arc<Binding>, ContainerError> {
        self.bindings
            .read()
            .get(capability)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownBinding {
                capability: capability.to_owned(),
            })
    }

    fn resolve_on_path(&self, capability: &str, path: &mut Vec<String>) -> Result<Instance, ContainerError> {
        if let Some(start) = path.iter().position(|entry| entry == capability) {
            let mut cycle = path[start..].to_vec();
            cycle.push(capability.to_owned());
            return Err(ContainerError::CyclicDependency { path: cycle });
        }
        let binding = self.binding(capability)?;
        if let Some(instance) = binding.cache.get() {
            return Ok(instance.clone());
        }

        path.push(capability.to_owned());
        let resolved = self.construct(&binding, path);
        path.pop();
        resolved
    }

    fn construct(&self, binding: &Binding, path: &mut Vec<String>) -> Result<Instance, ContainerError> {
        let mut deps = Dependencies::default();
        for dependency in &binding.spec.dependencies {
            let instance = self.resolve_on_path(dependency, path)?;
            deps.insert(dependency.clone(), instance);
        }
        match binding.spec.lifecycle {
            Lifecycle::Singleton => binding
                .cache
                .get_or_try_init(|| binding.build(&deps))
                .cloned(),
            Lifecycle::Transient => binding.build(&deps),
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("bindings", &self.bindings.read().keys().collect::<Vec<_>>())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Binding {
    fn new(spec: BindingSpec) -> Self {
        Self {
            spec,
            cache: OnceCell::new(),
        }
    }

    fn build(&self, deps: &Dependencies) -> Result<Instance, ContainerError> {
        let capability = &self.spec.capability;
        let instance = (self.spec.factory)(deps).map_err(|source| ContainerError::Construction {
            capability: capability.clone(),
            source,
        })?;

        let found = instance.contract();
        if found != self.spec.contract {
            return Err(ContainerError::ContractViolation {
                capability: capability.clone(),
                contract: self.spec.contract,
                violation: Violation::WrongKind(found),
            });
        }
        if let Some(method) = self.spec.contract.missing(&instance.capabilities()) {
            return Err(ContainerError::ContractViolation {
                capability: capability.clone(),
                contract: self.spec.contract,
                violation: Violation::Missing(method),
            });
        }

        debug!(
            capability = %capability,
            contract = %self.spec.contract,
            lifecycle = ?self.spec.lifecycle,
            "constructed binding"
        );
        Ok(instance)
    }
}

fn wrong_kind(capability: &str, expected: Contract, found: &Instance) -> ContainerError {
    ContainerError::ContractViolation {
        capability: capability.to_owned(),
        contract: expected,
        violation: Violation::WrongKind(found.contract()),
    }
}

/// Why an instance does not satisfy its contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A required method is not declared.
    Missing(Method),
    /// The factory produced a different kind of component.
    WrongKind(Contract),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(method) => write!(f, "missing `{method}`"),
            Self::WrongKind(found) => write!(f, "instance is a {found}"),
        }
    }
}

/// Startup errors raised by the container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The capability is already bound.
    #[error("`{capability}` is already bound")]
    DuplicateBinding {
        /// Capability name.
        capability: String,
    },
    /// Nothing is bound to the capability.
    #[error("no binding for `{capability}`")]
    UnknownBinding {
        /// Capability name.
        capability: String,
    },
    /// Resolution revisited an ancestor.
    #[error("dependency cycle: {}", path.join(" -> "))]
    CyclicDependency {
        /// Resolution path ending with the repeated capability.
        path: Vec<String>,
    },
    /// The instance does not satisfy the claimed contract.
    #[error("`{capability}` violates the {contract} contract: {violation}")]
    ContractViolation {
        /// Capability name.
        capability: String,
        /// Claimed contract.
        contract: Contract,
        /// What is wrong.
        violation: Violation,
    },
    /// The binding set is frozen.
    #[error("container is sealed")]
    ContainerSealed,
    /// Runs require a sealed container.
    #[error("container must be sealed before running")]
    NotSealed,
    /// The factory or the model's `configure` failed.
    #[error("constructing `{capability}`: {source}")]
    Construction {
        /// Capability name.
        capability: String,
        /// Underlying failure.
        source: anyhow::Error,
    },
    /// Hyperparameters could not be resolved.
    #[error("hyperparameters of `{capability}`: {source}")]
    Hyperparameter {
        /// Capability name.
        capability: String,
        /// Underlying failure.
        source: HyperparameterError,
    },
    /// A service binding holds a different type.
    #[error("`{capability}` is not a {expected}")]
    ServiceType {
        /// Capability name.
        capability: String,
        /// Requested type.
        expected: &'static str,
    },
    /// Configuration selects an implementation the catalog does not know.
    #[error("unknown implementation `{implementation}` for `{capability}`")]
    UnknownImplementation {
        /// Capability name.
        capability: String,
        /// Requested implementation.
        implementation: String,
    },
    /// Configuration could not be read.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
