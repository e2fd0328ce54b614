//! Hierarchical binding contexts

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use crate::binding::{Binding, BindingKey};
use crate::builder::ContextBuilder;
use crate::error::{DiError, DiResult};
use crate::lifecycle::DisposalQueue;
use crate::metadata::MetadataRegistry;
use crate::resolver::{self, Injectable, Mode, Session};
use crate::single_flight::{Instance, Slot};
use crate::value::{downcast, Value};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// What `bind` does when the key is already bound locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Last write wins
    #[default]
    Replace,
    /// Fail with `DuplicateBinding`
    Reject,
}

pub(crate) struct ContextInner {
    id: u64,
    name: String,
    parent: Option<Weak<ContextInner>>,
    registry: Arc<MetadataRegistry>,
    policy: DuplicatePolicy,
    bindings: RwLock<HashMap<BindingKey, Arc<Binding>>>,
    /// Context-bound values requested through this context, by binding id
    bound: DashMap<u64, BoundSlot>,
    /// Cached instances displaced by rebinding, disposed on close
    retired: Mutex<Vec<(BindingKey, Instance)>>,
    children: Mutex<Vec<Weak<ContextInner>>>,
    locked: AtomicBool,
    closed: AtomicBool,
}

struct BoundSlot {
    key: BindingKey,
    revision: u64,
    slot: Arc<Slot>,
}

impl BoundSlot {
    fn new(binding: &Binding) -> Self {
        Self {
            key: binding.key().to_string(),
            revision: binding.revision(),
            slot: Arc::new(Slot::new()),
        }
    }
}

/// A hierarchical namespace of bindings.
///
/// Cloning a `Context` yields another handle to the same context. A child
/// holds only a weak reference to its parent; whoever created the parent
/// keeps it alive.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create a root context with its own metadata registry
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_parts(
            name.into(),
            None,
            Arc::new(MetadataRegistry::new()),
            DuplicatePolicy::default(),
        )
    }

    /// Create a context builder
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn from_parts(
        name: String,
        parent: Option<&Context>,
        registry: Arc<MetadataRegistry>,
        policy: DuplicatePolicy,
    ) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(id, name, parent, registry, policy)
    }

    fn with_id(
        id: u64,
        name: String,
        parent: Option<&Context>,
        registry: Arc<MetadataRegistry>,
        policy: DuplicatePolicy,
    ) -> Self {
        debug!("Creating context '{}' ({})", name, id);
        let ctx = Self {
            inner: Arc::new(ContextInner {
                id,
                name,
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                registry,
                policy,
                bindings: RwLock::new(HashMap::new()),
                bound: DashMap::new(),
                retired: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                locked: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        if let Some(parent) = parent {
            let mut children = parent.inner.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&ctx.inner));
        }
        ctx
    }

    /// Create a child context whose bindings shadow this one's
    pub fn create_child(&self) -> Context {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_id(
            id,
            format!("{}.{}", self.inner.name, id),
            Some(self),
            self.inner.registry.clone(),
            self.inner.policy,
        )
    }

    /// Create a named child context
    pub fn create_child_named(&self, name: impl Into<String>) -> Context {
        Self::from_parts(
            name.into(),
            Some(self),
            self.inner.registry.clone(),
            self.inner.policy,
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The parent context, if any and still alive
    pub fn parent(&self) -> Option<Context> {
        let weak = self.inner.parent.as_ref()?;
        match weak.upgrade() {
            Some(inner) => Some(Context { inner }),
            None => {
                warn!("Parent of context '{}' has been dropped", self.inner.name);
                None
            }
        }
    }

    /// Metadata registry shared by the whole context tree
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.inner.registry
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.inner.policy
    }

    /// Whether both handles refer to the same context
    pub fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ensure_open(&self) -> DiResult<()> {
        if self.is_closed() {
            Err(DiError::ContextClosed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    fn ensure_mutable(&self, key: &str) -> DiResult<()> {
        self.ensure_open()?;
        if self.is_locked() {
            return Err(DiError::LockedContext {
                context: self.inner.name.clone(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Create or replace the local binding for `key`
    pub fn bind(&self, key: impl Into<BindingKey>) -> DiResult<Arc<Binding>> {
        let key = key.into();
        self.ensure_mutable(&key)?;

        let binding = Arc::new(Binding::new(key.clone()));
        let replaced = {
            let mut bindings = self.inner.bindings.write();
            if self.inner.policy == DuplicatePolicy::Reject && bindings.contains_key(&key) {
                return Err(DiError::DuplicateBinding {
                    context: self.inner.name.clone(),
                    key,
                });
            }
            bindings.insert(key.clone(), binding.clone())
        };

        match replaced {
            Some(old) => {
                debug!("Replaced binding '{}' in context '{}'", key, self.inner.name);
                self.retire_binding(&old);
            }
            None => trace!("Added binding '{}' to context '{}'", key, self.inner.name),
        }
        Ok(binding)
    }

    /// Remove the local binding for `key`; `Ok(false)` when there was none
    pub fn unbind(&self, key: &str) -> DiResult<bool> {
        self.ensure_mutable(key)?;
        let removed = self.inner.bindings.write().remove(key);
        if let Some(binding) = &removed {
            debug!("Removed binding '{}' from context '{}'", key, self.inner.name);
            self.retire_binding(binding);
        }
        Ok(removed.is_some())
    }

    /// Keep a displaced cached instance until this context closes
    fn retire(&self, key: BindingKey, instance: Instance) {
        trace!("Retiring cached '{}' in context '{}'", key, self.inner.name);
        self.inner.retired.lock().push((key, instance));
    }

    /// Retire everything cached for a binding that left this context
    fn retire_binding(&self, binding: &Binding) {
        let mut displaced = binding.take_retired();
        displaced.extend(binding.slot().reset());
        for instance in displaced {
            self.retire(binding.key().to_string(), instance);
        }
        self.release_bound(binding.id());
    }

    /// Drop the context-bound slots of a binding here and in every descendant
    fn release_bound(&self, binding_id: u64) {
        if let Some((_, bound)) = self.inner.bound.remove(&binding_id) {
            if let Some(instance) = bound.slot.reset() {
                self.retire(bound.key, instance);
            }
        }
        for child in self.children() {
            child.release_bound(binding_id);
        }
    }

    fn children(&self) -> Vec<Context> {
        let mut children = self.inner.children.lock();
        children.retain(|child| child.strong_count() > 0);
        children
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Context { inner })
            .collect()
    }

    /// Reject further binding additions and removals
    pub fn lock(&self) {
        if !self.inner.locked.swap(true, Ordering::SeqCst) {
            debug!("Locked context '{}'", self.inner.name);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dispose the instances cached in this context and make it unusable.
    ///
    /// Covers singletons of bindings owned here, context-bound values
    /// requested through here, and instances displaced by rebinding or
    /// unbinding since. Closing twice is a no-op.
    pub fn close(&self) -> DiResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut cached: Vec<(BindingKey, Instance)> = Vec::new();
        let bindings: Vec<Arc<Binding>> = self
            .inner
            .bindings
            .write()
            .drain()
            .map(|(_, binding)| binding)
            .collect();
        for binding in bindings {
            let mut owned = binding.take_retired();
            owned.extend(binding.slot().reset());
            cached.extend(owned.into_iter().map(|instance| (binding.key().to_string(), instance)));
        }
        let bound: Vec<u64> = self.inner.bound.iter().map(|entry| *entry.key()).collect();
        for id in bound {
            if let Some((_, bound)) = self.inner.bound.remove(&id) {
                if let Some(instance) = bound.slot.reset() {
                    cached.push((bound.key, instance));
                }
            }
        }
        cached.append(&mut self.inner.retired.lock());

        cached.sort_by_key(|(_, instance)| instance.created);
        let mut queue = DisposalQueue::new();
        for (key, instance) in cached {
            if let Some(disposer) = instance.disposer {
                queue.push(key, disposer);
            }
        }

        debug!(
            "Closing context '{}' ({} disposable instances)",
            self.inner.name,
            queue.len()
        );
        queue.dispose()
    }

    /// Whether any context in the chain binds `key`
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_ok()
    }

    /// Whether this context itself binds `key`
    pub fn contains_local(&self, key: &str) -> bool {
        self.inner.bindings.read().contains_key(key)
    }

    /// Locally bound keys, sorted
    pub fn keys(&self) -> Vec<BindingKey> {
        let mut keys: Vec<_> = self.inner.bindings.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The binding that would serve `key`, searching up the chain
    pub fn get_binding(&self, key: &str) -> Option<Arc<Binding>> {
        self.lookup(key).ok().map(|(_, binding)| binding)
    }

    /// Visible bindings carrying `tag`; a child binding hides the parent's
    pub fn find_by_tag(&self, tag: &str) -> Vec<Arc<Binding>> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut current = Some(self.clone());
        while let Some(ctx) = current {
            let mut local: Vec<Arc<Binding>> =
                ctx.inner.bindings.read().values().cloned().collect();
            local.sort_by(|a, b| a.key().cmp(b.key()));
            for binding in local {
                if seen.insert(binding.key().to_string()) && binding.has_tag(tag) {
                    found.push(binding);
                }
            }
            current = ctx.parent();
        }
        found
    }

    /// Find the owning context and binding for `key`
    pub(crate) fn lookup(&self, key: &str) -> DiResult<(Context, Arc<Binding>)> {
        let mut current = Some(self.clone());
        while let Some(ctx) = current {
            let local = ctx.inner.bindings.read().get(key).cloned();
            if let Some(binding) = local {
                return Ok((ctx, binding));
            }
            current = ctx.parent();
        }
        Err(DiError::BindingNotFound {
            key: key.to_string(),
            context: self.inner.name.clone(),
        })
    }

    /// Cache cell for a context-bound binding requested through this context
    pub(crate) fn bound_slot(&self, binding: &Binding) -> Arc<Slot> {
        let mut entry = self
            .inner
            .bound
            .entry(binding.id())
            .or_insert_with(|| BoundSlot::new(binding));
        if entry.revision != binding.revision() {
            // The binding was reconfigured since this value was cached
            if let Some(instance) = entry.slot.reset() {
                self.retire(entry.key.clone(), instance);
            }
            *entry = BoundSlot::new(binding);
        }
        entry.slot.clone()
    }

    /// Resolve `key` to an untyped value
    pub async fn get_value(&self, key: &str) -> DiResult<Value> {
        resolver::resolve_key(self.clone(), key.to_string(), Session::default(), Mode::Suspend)
            .await
    }

    /// Resolve `key` to a typed value
    pub async fn get<T: Any + Send + Sync>(&self, key: &str) -> DiResult<Arc<T>> {
        downcast::<T>(key, self.get_value(key).await?)
    }

    /// Resolve `key`, yielding `None` when no context in the chain binds it
    pub async fn get_optional<T: Any + Send + Sync>(&self, key: &str) -> DiResult<Option<Arc<T>>> {
        match self.get::<T>(key).await {
            Ok(value) => Ok(Some(value)),
            Err(DiError::BindingNotFound { key: missing, .. }) if missing == key => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Non-suspending variant of [`get_value`](Self::get_value)
    pub fn get_value_sync(&self, key: &str) -> DiResult<Value> {
        resolver::resolve_now(
            key,
            resolver::resolve_key(self.clone(), key.to_string(), Session::default(), Mode::NoSuspend),
        )
    }

    /// Non-suspending variant of [`get`](Self::get)
    pub fn get_sync<T: Any + Send + Sync>(&self, key: &str) -> DiResult<Arc<T>> {
        downcast::<T>(key, self.get_value_sync(key)?)
    }

    /// Construct an unbound class, injecting its dependencies from this context
    pub async fn instantiate<T: Injectable>(&self) -> DiResult<Arc<T>> {
        self.ensure_open()?;
        let class = T::class_id();
        let instance = resolver::run_strategy(
            self.clone(),
            class.name().to_string(),
            resolver::class_strategy::<T>(),
            Session::default(),
            Mode::Suspend,
        )
        .await?;
        downcast::<T>(class.name(), instance.value)
    }

    /// Non-suspending variant of [`instantiate`](Self::instantiate)
    pub fn instantiate_sync<T: Injectable>(&self) -> DiResult<Arc<T>> {
        self.ensure_open()?;
        let class = T::class_id();
        let instance = resolver::resolve_now(
            class.name(),
            resolver::run_strategy(
                self.clone(),
                class.name().to_string(),
                resolver::class_strategy::<T>(),
                Session::default(),
                Mode::NoSuspend,
            ),
        )?;
        downcast::<T>(class.name(), instance.value)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("bindings", &self.keys())
            .field("locked", &self.is_locked())
            .field("closed", &self.is_closed())
            .finish()
    }
}
