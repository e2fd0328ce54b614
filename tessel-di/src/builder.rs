//! Context builder for fluent configuration

use std::sync::Arc;

use crate::context::{Context, DuplicatePolicy};
use crate::error::DiResult;
use crate::metadata::MetadataRegistry;

/// A group of related bindings registered together.
///
/// Modules are how capabilities are composed into an application: an
/// authentication module binds its token service and user lookup, a
/// persistence module binds its repositories, and so on.
pub trait Module {
    /// Register this module's bindings and metadata
    fn configure(&self, ctx: &Context) -> DiResult<()>;
}

impl<F> Module for F
where
    F: Fn(&Context) -> DiResult<()>,
{
    fn configure(&self, ctx: &Context) -> DiResult<()> {
        self(ctx)
    }
}

/// Builder for constructing a context
pub struct ContextBuilder {
    name: String,
    parent: Option<Context>,
    policy: Option<DuplicatePolicy>,
    registry: Option<Arc<MetadataRegistry>>,
    modules: Vec<Box<dyn Module>>,
    lock: bool,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            name: "application".to_string(),
            parent: None,
            policy: None,
            registry: None,
            modules: Vec::new(),
            lock: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make the built context a child of `parent`
    pub fn parent(mut self, parent: &Context) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Override the duplicate policy; children inherit the parent's by default
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Use an existing registry instead of the parent's or a fresh one
    pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Apply a module once the context exists
    pub fn add_module<M: Module + 'static>(mut self, module: M) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    /// Lock the context after all modules ran
    pub fn locked(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    /// Build the context
    pub fn build(self) -> DiResult<Context> {
        let registry = self
            .registry
            .or_else(|| self.parent.as_ref().map(|p| p.registry().clone()))
            .unwrap_or_else(|| Arc::new(MetadataRegistry::new()));
        let policy = self
            .policy
            .or_else(|| self.parent.as_ref().map(Context::duplicate_policy))
            .unwrap_or_default();

        let ctx = Context::from_parts(self.name, self.parent.as_ref(), registry, policy);
        for module in &self.modules {
            module.configure(&ctx)?;
        }
        if self.lock {
            ctx.lock();
        }
        Ok(ctx)
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiError;

    struct LoggingModule;

    impl Module for LoggingModule {
        fn configure(&self, ctx: &Context) -> DiResult<()> {
            ctx.bind("logging.level")?.to("info".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_modules_and_lock() {
        let ctx = ContextBuilder::new()
            .name("system")
            .add_module(LoggingModule)
            .add_module(|ctx: &Context| -> DiResult<()> {
                ctx.bind("app.name")?.to("todo".to_string());
                Ok(())
            })
            .locked(true)
            .build()
            .unwrap();

        assert_eq!(ctx.name(), "system");
        assert!(ctx.is_locked());
        assert_eq!(*ctx.get_sync::<String>("logging.level").unwrap(), "info");
        assert!(matches!(ctx.bind("late"), Err(DiError::LockedContext { .. })));
    }

    #[test]
    fn test_child_inherits_registry_and_policy() {
        let root = ContextBuilder::new()
            .duplicate_policy(DuplicatePolicy::Reject)
            .build()
            .unwrap();
        let child = ContextBuilder::new()
            .name("request")
            .parent(&root)
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(root.registry(), child.registry()));
        assert_eq!(child.duplicate_policy(), DuplicatePolicy::Reject);
        assert!(child.parent().unwrap().same(&root));
    }

    #[test]
    fn test_failing_module_aborts_build() {
        let result = ContextBuilder::new()
            .add_module(|_: &Context| -> DiResult<()> { Err(DiError::Other("bad wiring".into())) })
            .build();
        assert!(result.is_err());
    }
}
