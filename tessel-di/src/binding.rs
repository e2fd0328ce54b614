//! Bindings: named, scoped recipes for producing values

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::DiResult;
use crate::metadata::ClassId;
use crate::resolver::{
    class_builder, class_strategy, provider_output, Injectable, InjectionSpec, Provider,
};
use crate::single_flight::{Instance, Slot};
use crate::value::{Arguments, Value};

/// Key identifying a binding within a context
pub type BindingKey = String;

static NEXT_BINDING_ID: AtomicU64 = AtomicU64::new(1);

/// Caching policy for a binding's resolved value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindingScope {
    /// A new value is produced on every request
    #[default]
    Transient,
    /// One value cached in the context that owns the binding
    Singleton,
    /// One value cached per requesting context
    ContextBound,
}

impl BindingScope {
    pub fn is_cached(&self) -> bool {
        !matches!(self, BindingScope::Transient)
    }
}

impl fmt::Display for BindingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingScope::Transient => write!(f, "transient"),
            BindingScope::Singleton => write!(f, "singleton"),
            BindingScope::ContextBound => write!(f, "context-bound"),
        }
    }
}

pub(crate) type SyncFactoryFn = Arc<dyn Fn(Arguments) -> DiResult<Value> + Send + Sync>;
pub(crate) type AsyncFactoryFn =
    Arc<dyn Fn(Arguments) -> BoxFuture<'static, DiResult<Value>> + Send + Sync>;
pub(crate) type ClassBuilder =
    Arc<dyn Fn(Arguments, Vec<(String, Option<Value>)>) -> DiResult<Instance> + Send + Sync>;
pub(crate) type ProviderOutput =
    Arc<dyn Fn(Value) -> BoxFuture<'static, DiResult<Value>> + Send + Sync>;

/// How a binding produces its value
#[derive(Clone)]
pub(crate) enum Strategy {
    Constant(Value),
    SyncFactory {
        params: Vec<InjectionSpec>,
        factory: SyncFactoryFn,
    },
    AsyncFactory {
        params: Vec<InjectionSpec>,
        factory: AsyncFactoryFn,
    },
    Class {
        class: ClassId,
        build: ClassBuilder,
    },
    Provider {
        class: ClassId,
        build: ClassBuilder,
        output: ProviderOutput,
    },
    Alias(BindingKey),
}

impl Strategy {
    fn describe(&self) -> String {
        match self {
            Strategy::Constant(_) => "constant".to_string(),
            Strategy::SyncFactory { .. } => "factory".to_string(),
            Strategy::AsyncFactory { .. } => "async factory".to_string(),
            Strategy::Class { class, .. } => format!("class {}", class),
            Strategy::Provider { class, .. } => format!("provider {}", class),
            Strategy::Alias(key) => format!("alias of {}", key),
        }
    }
}

struct BindingConfig {
    strategy: Option<Strategy>,
    scope: BindingScope,
    tags: BTreeSet<String>,
}

/// A keyed cell holding a resolution strategy and a scope.
///
/// Configuration methods take `&self` and return `&Self` so a binding
/// handed out by [`Context::bind`](crate::Context::bind) can be set up
/// fluently:
///
/// ```ignore
/// ctx.bind("greeting")?.to("hi".to_string()).in_scope(BindingScope::Singleton);
/// ```
pub struct Binding {
    id: u64,
    key: BindingKey,
    config: RwLock<BindingConfig>,
    slot: Slot,
    /// Bumped whenever cached values stop matching the configuration
    revision: AtomicU64,
    /// Singletons displaced by reconfiguration, disposed with the owner
    retired: Mutex<Vec<Instance>>,
}

impl Binding {
    /// Create an unbound cell
    pub fn new(key: impl Into<BindingKey>) -> Self {
        Self {
            id: NEXT_BINDING_ID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            config: RwLock::new(BindingConfig {
                strategy: None,
                scope: BindingScope::default(),
                tags: BTreeSet::new(),
            }),
            slot: Slot::new(),
            revision: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn slot(&self) -> &Slot {
        &self.slot
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Displaced singletons awaiting disposal
    pub(crate) fn take_retired(&self) -> Vec<Instance> {
        std::mem::take(&mut *self.retired.lock())
    }

    /// Drop cached values, keeping a displaced singleton for disposal
    fn invalidate(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
        if let Some(instance) = self.slot.reset() {
            self.retired.lock().push(instance);
        }
    }

    pub(crate) fn strategy(&self) -> Option<Strategy> {
        self.config.read().strategy.clone()
    }

    /// Whether a strategy has been configured
    pub fn is_bound(&self) -> bool {
        self.config.read().strategy.is_some()
    }

    fn set_strategy(&self, strategy: Strategy) -> &Self {
        debug!("Binding '{}' to {}", self.key, strategy.describe());
        self.config.write().strategy = Some(strategy);
        self.invalidate();
        self
    }

    /// Bind to a constant value
    pub fn to<T: Any + Send + Sync>(&self, value: T) -> &Self {
        self.to_value(Arc::new(value))
    }

    /// Bind to an already type-erased constant
    pub fn to_value(&self, value: Value) -> &Self {
        self.set_strategy(Strategy::Constant(value))
    }

    /// Bind to a non-suspending factory without injected arguments
    pub fn to_sync_factory<T, F>(&self, factory: F) -> &Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> DiResult<T> + Send + Sync + 'static,
    {
        self.to_sync_factory_with(Vec::new(), factory)
    }

    /// Bind to a non-suspending factory whose arguments are injected
    pub fn to_sync_factory_with<T, F>(
        &self,
        params: impl IntoIterator<Item = InjectionSpec>,
        factory: F,
    ) -> &Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> DiResult<T> + Send + Sync + 'static,
    {
        self.set_strategy(Strategy::SyncFactory {
            params: params.into_iter().collect(),
            factory: Arc::new(move |args: Arguments| factory(args).map(|value| Arc::new(value) as Value)),
        })
    }

    /// Bind to an asynchronous factory without injected arguments
    pub fn to_factory<T, F, Fut>(&self, factory: F) -> &Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<T>> + Send + 'static,
    {
        self.to_factory_with(Vec::new(), factory)
    }

    /// Bind to an asynchronous factory whose arguments are injected
    pub fn to_factory_with<T, F, Fut>(
        &self,
        params: impl IntoIterator<Item = InjectionSpec>,
        factory: F,
    ) -> &Self
    where
        T: Any + Send + Sync,
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<T>> + Send + 'static,
    {
        self.set_strategy(Strategy::AsyncFactory {
            params: params.into_iter().collect(),
            factory: Arc::new(move |args: Arguments| {
                factory(args)
                    .map(|result| result.map(|value| Arc::new(value) as Value))
                    .boxed()
            }),
        })
    }

    /// Bind to a class built by the injector
    pub fn to_class<T: Injectable>(&self) -> &Self {
        self.set_strategy(class_strategy::<T>())
    }

    /// Bind to the value of an injected provider class
    pub fn to_provider<P: Provider>(&self) -> &Self {
        self.set_strategy(Strategy::Provider {
            class: P::class_id(),
            build: class_builder::<P>(),
            output: provider_output::<P>(),
        })
    }

    /// Resolve another key instead
    pub fn to_alias(&self, target: impl Into<BindingKey>) -> &Self {
        self.set_strategy(Strategy::Alias(target.into()))
    }

    /// Set the caching policy
    pub fn in_scope(&self, scope: BindingScope) -> &Self {
        let mut config = self.config.write();
        if config.scope != scope {
            config.scope = scope;
            self.invalidate();
        }
        self
    }

    pub fn scope(&self) -> BindingScope {
        self.config.read().scope
    }

    /// Attach a tag
    pub fn tag(&self, tag: impl Into<String>) -> &Self {
        self.config.write().tags.insert(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.config.read().tags.contains(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        self.config.read().tags.iter().cloned().collect()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.config.read();
        f.debug_struct("Binding")
            .field("key", &self.key)
            .field(
                "strategy",
                &config.strategy.as_ref().map(Strategy::describe),
            )
            .field("scope", &config.scope)
            .field("tags", &config.tags)
            .finish()
    }
}
