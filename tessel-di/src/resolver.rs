//! Injector and resolution engine
//!
//! Resolution walks the context chain to find the owning binding, then
//! runs its strategy in the context dictated by the binding's scope:
//!
//! - `Singleton`: cached in the owning context, dependencies resolved there
//! - `ContextBound`: cached in the requesting context, dependencies resolved there
//! - `Transient`: never cached, dependencies resolved in the requesting context
//!
//! Dependencies are resolved depth-first, left to right over declared
//! parameter positions, before the dependent constructor or factory runs.
//! Properties are injected after construction and before `on_create`.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::any::{type_name, Any};
use std::sync::Arc;
use tracing::trace;

use crate::binding::{Binding, BindingKey, BindingScope, ClassBuilder, ProviderOutput, Strategy};
use crate::context::Context;
use crate::error::{DiError, DiResult};
use crate::lifecycle::{Disposable, Disposer};
use crate::metadata::{ClassId, MetadataKey, MetadataMode, MetadataRegistry, MetadataTarget};
use crate::single_flight::Instance;
use crate::value::{downcast, Arguments, Value};

/// Metadata key for constructor parameter injections
pub const INJECT_PARAMETERS: &str = "tessel:inject:parameters";
/// Metadata key for property injections
pub const INJECT_PROPERTIES: &str = "tessel:inject:properties";

/// Declares which binding satisfies a dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionSpec {
    pub key: BindingKey,
    pub optional: bool,
}

impl InjectionSpec {
    /// Required dependency on `key`
    pub fn key(key: impl Into<BindingKey>) -> Self {
        Self {
            key: key.into(),
            optional: false,
        }
    }

    /// Supply absence instead of failing when the key is not bound
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Declare the dependency injected at constructor position `index`
pub fn declare_parameter(
    registry: &MetadataRegistry,
    class: &ClassId,
    index: usize,
    spec: InjectionSpec,
) {
    registry.define(
        &MetadataKey::new(INJECT_PARAMETERS),
        MetadataTarget::Parameter(class.clone(), index),
        spec,
    );
}

/// Declare the dependency injected into property `name`
pub fn declare_property(
    registry: &MetadataRegistry,
    class: &ClassId,
    name: &str,
    spec: InjectionSpec,
) {
    registry.define(
        &MetadataKey::new(INJECT_PROPERTIES),
        MetadataTarget::Member(class.clone(), name.to_string()),
        spec,
    );
}

/// A class the injector can construct
pub trait Injectable: Any + Send + Sync + Sized {
    /// Identity used to look up injection metadata
    fn class_id() -> ClassId {
        ClassId::of::<Self>()
    }

    /// Build an instance from positional constructor arguments
    fn construct(args: Arguments) -> DiResult<Self>;

    /// Receive an injected property; `None` for an unbound optional one
    fn set_property(&mut self, name: &str, value: Option<Value>) -> DiResult<()> {
        let _ = value;
        Err(DiError::Other(format!(
            "{} does not accept injected property '{}'",
            type_name::<Self>(),
            name
        )))
    }

    /// Runs once all properties are injected, before the instance is handed out
    fn on_create(&mut self) -> DiResult<()> {
        Ok(())
    }

    /// Disposal capability, queried once the instance is built
    fn as_disposable(&self) -> Option<&dyn Disposable> {
        None
    }
}

/// An injectable class whose product, not itself, is the bound value
#[async_trait]
pub trait Provider: Injectable {
    type Output: Any + Send + Sync;

    async fn value(&self) -> DiResult<Self::Output>;
}

pub(crate) fn class_strategy<T: Injectable>() -> Strategy {
    Strategy::Class {
        class: T::class_id(),
        build: class_builder::<T>(),
    }
}

pub(crate) fn class_builder<T: Injectable>() -> ClassBuilder {
    Arc::new(|args: Arguments, properties: Vec<(String, Option<Value>)>| {
        let mut instance = T::construct(args)?;
        for (name, value) in properties {
            instance.set_property(&name, value)?;
        }
        instance.on_create()?;

        let instance = Arc::new(instance);
        let disposer = instance.as_disposable().is_some().then(|| {
            let held = instance.clone();
            Arc::new(move || held.as_disposable().map_or(Ok(()), |d| d.dispose())) as Disposer
        });
        let value: Value = instance;
        Ok(Instance::new(value, disposer))
    })
}

pub(crate) fn provider_output<P: Provider>() -> ProviderOutput {
    Arc::new(|instance: Value| {
        async move {
            let provider = downcast::<P>(type_name::<P>(), instance)?;
            let output = provider.value().await?;
            Ok(Arc::new(output) as Value)
        }
        .boxed()
    })
}

/// Whether the engine may suspend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Suspend,
    NoSuspend,
}

/// Bindings currently under construction on this resolution path
#[derive(Debug, Clone, Default)]
pub(crate) struct Session {
    path: Vec<(u64, BindingKey)>,
    /// Innermost cached resolution this path runs inside
    flight: Option<u64>,
}

impl Session {
    fn enter(&self, binding: &Binding) -> DiResult<Session> {
        if self.path.iter().any(|(id, _)| *id == binding.id()) {
            let mut keys: Vec<&str> = self.path.iter().map(|(_, key)| key.as_str()).collect();
            keys.push(binding.key());
            return Err(DiError::CircularDependency {
                path: keys.join(" -> "),
            });
        }
        let mut next = self.clone();
        next.path.push((binding.id(), binding.key().to_string()));
        Ok(next)
    }

    fn in_flight(mut self, flight: u64) -> Session {
        self.flight = Some(flight);
        self
    }
}

/// Resolve `key` on behalf of `requester`
pub(crate) fn resolve_key(
    requester: Context,
    key: BindingKey,
    session: Session,
    mode: Mode,
) -> BoxFuture<'static, DiResult<Value>> {
    async move {
        requester.ensure_open()?;
        let (owner, binding) = requester.lookup(&key)?;
        trace!(
            "Resolving '{}' for context '{}' (owned by '{}')",
            key,
            requester.name(),
            owner.name()
        );
        resolve_binding(requester, owner, binding, session, mode)
            .await
            .map(|instance| instance.value)
    }
    .boxed()
}

async fn resolve_binding(
    requester: Context,
    owner: Context,
    binding: Arc<Binding>,
    session: Session,
    mode: Mode,
) -> DiResult<Instance> {
    let session = session.enter(&binding)?;
    let strategy = binding
        .strategy()
        .ok_or_else(|| DiError::UnboundKey(binding.key().to_string()))?;
    let key = binding.key().to_string();

    match binding.scope() {
        BindingScope::Transient => run_strategy(requester, key, strategy, session, mode).await,
        BindingScope::Singleton => {
            let slot_key = key.clone();
            let waiter = session.flight;
            binding
                .slot()
                .get_or_resolve(&slot_key, waiter, mode == Mode::Suspend, move |flight| {
                    run_strategy(owner, key, strategy, session.in_flight(flight), mode)
                })
                .await
        }
        BindingScope::ContextBound => {
            let slot = requester.bound_slot(&binding);
            let slot_key = key.clone();
            let waiter = session.flight;
            slot.get_or_resolve(&slot_key, waiter, mode == Mode::Suspend, move |flight| {
                run_strategy(requester, key, strategy, session.in_flight(flight), mode)
            })
            .await
        }
    }
}

/// Execute a strategy with dependencies resolved from `ctx`
pub(crate) fn run_strategy(
    ctx: Context,
    key: String,
    strategy: Strategy,
    session: Session,
    mode: Mode,
) -> BoxFuture<'static, DiResult<Instance>> {
    async move {
        match strategy {
            Strategy::Constant(value) => Ok(Instance::plain(value)),
            Strategy::Alias(target) => resolve_key(ctx, target, session, mode)
                .await
                .map(Instance::plain),
            Strategy::SyncFactory { params, factory } => {
                let specs: Vec<_> = params.into_iter().map(Some).collect();
                let args = resolve_arguments(&ctx, &key, &specs, &session, mode).await?;
                factory(args).map(Instance::plain)
            }
            Strategy::AsyncFactory { params, factory } => {
                if mode == Mode::NoSuspend {
                    return Err(DiError::AsyncResolutionRequired { key });
                }
                let specs: Vec<_> = params.into_iter().map(Some).collect();
                let args = resolve_arguments(&ctx, &key, &specs, &session, mode).await?;
                factory(args).await.map(Instance::plain)
            }
            Strategy::Class { class, build } => {
                construct(&ctx, &class, &build, &session, mode).await
            }
            Strategy::Provider {
                class,
                build,
                output,
            } => {
                if mode == Mode::NoSuspend {
                    return Err(DiError::AsyncResolutionRequired { key });
                }
                let provider = construct(&ctx, &class, &build, &session, mode).await?;
                output(provider.value).await.map(Instance::plain)
            }
        }
    }
    .boxed()
}

/// Build a class: constructor arguments, then properties, then `on_create`
async fn construct(
    ctx: &Context,
    class: &ClassId,
    build: &ClassBuilder,
    session: &Session,
    mode: Mode,
) -> DiResult<Instance> {
    let registry = ctx.registry().clone();

    let declared = registry.parameters(&MetadataKey::new(INJECT_PARAMETERS), class);
    let arity = declared.last().map_or(0, |(index, _)| index + 1);
    let mut specs: Vec<Option<InjectionSpec>> = vec![None; arity];
    for (index, spec) in declared {
        let spec = downcast::<InjectionSpec>(&format!("{}#{}", class, index), spec)?;
        specs[index] = Some((*spec).clone());
    }
    let args = resolve_arguments(ctx, class.name(), &specs, session, mode).await?;

    let mut properties = Vec::new();
    for (name, spec) in registry.members(
        &MetadataKey::new(INJECT_PROPERTIES),
        class,
        MetadataMode::Inherited,
    ) {
        let spec = downcast::<InjectionSpec>(&format!("{}.{}", class, name), spec)?;
        let value = resolve_dependency(ctx, &spec, session, mode).await?;
        properties.push((name, value));
    }

    trace!("Constructing {}", class);
    build(args, properties)
}

async fn resolve_arguments(
    ctx: &Context,
    target: &str,
    specs: &[Option<InjectionSpec>],
    session: &Session,
    mode: Mode,
) -> DiResult<Arguments> {
    let mut values = Vec::with_capacity(specs.len());
    for spec in specs {
        let value = match spec {
            Some(spec) => resolve_dependency(ctx, spec, session, mode).await?,
            None => None,
        };
        values.push(value);
    }
    Ok(Arguments::new(target, values))
}

async fn resolve_dependency(
    ctx: &Context,
    spec: &InjectionSpec,
    session: &Session,
    mode: Mode,
) -> DiResult<Option<Value>> {
    if spec.optional && !ctx.contains(&spec.key) {
        trace!("Optional dependency '{}' is not bound", spec.key);
        return Ok(None);
    }
    resolve_key(ctx.clone(), spec.key.clone(), session.clone(), mode)
        .await
        .map(Some)
}

/// Drive a resolution without suspending
pub(crate) fn resolve_now<T>(
    key: &str,
    future: BoxFuture<'static, DiResult<T>>,
) -> DiResult<T> {
    future.now_or_never().unwrap_or_else(|| {
        Err(DiError::AsyncResolutionRequired {
            key: key.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock {
        zone: String,
    }

    impl Injectable for Clock {
        fn construct(args: Arguments) -> DiResult<Self> {
            Ok(Self {
                zone: args.cloned::<String>(0)?,
            })
        }
    }

    #[test]
    fn test_session_detects_cycle_with_path() {
        let a = Binding::new("a");
        let b = Binding::new("b");
        let session = Session::default().enter(&a).unwrap().enter(&b).unwrap();

        match session.enter(&a) {
            Err(DiError::CircularDependency { path }) => assert_eq!(path, "a -> b -> a"),
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_injection_spec_builder() {
        let spec = InjectionSpec::key("auth.user").optional();
        assert_eq!(spec.key, "auth.user");
        assert!(spec.optional);
        assert!(!InjectionSpec::key("x").optional);
    }

    #[test]
    fn test_class_builder_constructs() {
        let build = class_builder::<Clock>();
        let args = Arguments::new("Clock", vec![Some(Arc::new("UTC".to_string()) as Value)]);
        let instance = build(args, Vec::new()).unwrap();
        let clock = instance.value.downcast::<Clock>().unwrap();
        assert_eq!(clock.zone, "UTC");
        assert!(instance.disposer.is_none());
    }

    #[test]
    fn test_unexpected_property_rejected() {
        let build = class_builder::<Clock>();
        let args = Arguments::new("Clock", vec![Some(Arc::new("UTC".to_string()) as Value)]);
        let result = build(args, vec![("logger".to_string(), None)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_declarations_are_metadata() {
        let registry = MetadataRegistry::new();
        let class = Clock::class_id();
        declare_parameter(&registry, &class, 0, InjectionSpec::key("timezone"));

        let spec = registry
            .get::<InjectionSpec>(
                &MetadataKey::new(INJECT_PARAMETERS),
                &MetadataTarget::Parameter(class, 0),
                MetadataMode::Own,
            )
            .unwrap()
            .unwrap();
        assert_eq!(spec.key, "timezone");
    }
}
