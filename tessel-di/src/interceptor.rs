//! Interceptor chains around method invocations
//!
//! A chain wraps a terminal [`InvocationHandler`] with an ordered list of
//! [`Interceptor`]s. Global interceptors run first, then the remaining ones
//! in registration order. Each interceptor receives a [`Next`] continuation
//! that can be consumed at most once; not calling it short-circuits the
//! rest of the chain.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

use crate::binding::{Binding, BindingKey};
use crate::context::Context;
use crate::error::DiResult;
use crate::value::Value;

/// Tag marking a binding as a global interceptor
pub const GLOBAL_INTERCEPTOR_TAG: &str = "tessel:interceptor:global";

/// One method call travelling through a chain
#[derive(Clone)]
pub struct Invocation {
    target: Value,
    method: String,
    args: Vec<Value>,
    context: Context,
}

impl Invocation {
    pub fn new(context: &Context, target: Value, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target,
            method: method.into(),
            args,
            context: context.clone(),
        }
    }

    pub fn target(&self) -> &Value {
        &self.target
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Interceptors may rewrite the arguments seen downstream
    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }

    /// Context the invocation runs in, typically a per-request child
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("args", &self.args.len())
            .field("context", &self.context.name())
            .finish()
    }
}

/// A cross-cutting step wrapped around an invocation
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Handle the invocation, calling `next.proceed` to continue the chain
    async fn intercept(&self, invocation: &mut Invocation, next: Next<'_>) -> DiResult<Value>;
}

/// The method call at the end of a chain
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn handle(&self, invocation: &Invocation) -> DiResult<Value>;
}

/// Adapter turning an async closure into an [`InvocationHandler`]
pub struct HandlerFn<F>(F);

/// Wrap an async closure as the terminal step of a chain
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DiResult<Value>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> InvocationHandler for HandlerFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DiResult<Value>> + Send + 'static,
{
    async fn handle(&self, invocation: &Invocation) -> DiResult<Value> {
        (self.0)(invocation.clone()).await
    }
}

/// Continuation into the rest of the chain
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn InvocationHandler,
}

impl<'a> Next<'a> {
    /// Run the remaining interceptors and the handler
    pub async fn proceed(self, invocation: &mut Invocation) -> DiResult<Value> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    remaining: rest,
                    handler: self.handler,
                };
                current.intercept(invocation, next).await
            }
            None => {
                trace!("Invoking handler for '{}'", invocation.method());
                self.handler.handle(invocation).await
            }
        }
    }
}

#[derive(Clone)]
enum Source {
    Instance(Arc<dyn Interceptor>),
    Binding(BindingKey),
}

#[derive(Clone)]
struct Entry {
    source: Source,
    global: bool,
}

/// Ordered set of interceptors
#[derive(Clone, Default)]
pub struct InterceptorChain {
    entries: Vec<Entry>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain of every visible binding tagged [`GLOBAL_INTERCEPTOR_TAG`]
    pub fn from_tagged(ctx: &Context) -> Self {
        let mut chain = Self::new();
        for binding in ctx.find_by_tag(GLOBAL_INTERCEPTOR_TAG) {
            chain.add_global_binding(binding.key());
        }
        chain
    }

    fn push(&mut self, source: Source, global: bool) -> &mut Self {
        self.entries.push(Entry { source, global });
        self
    }

    pub fn add(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.push(Source::Instance(interceptor), false)
    }

    pub fn add_global(&mut self, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.push(Source::Instance(interceptor), true)
    }

    /// Interceptor resolved from the invoking context at call time
    pub fn add_binding(&mut self, key: impl Into<BindingKey>) -> &mut Self {
        self.push(Source::Binding(key.into()), false)
    }

    pub fn add_global_binding(&mut self, key: impl Into<BindingKey>) -> &mut Self {
        self.push(Source::Binding(key.into()), true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Globals first, each group in registration order
    fn ordered(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|entry| entry.global)
            .chain(self.entries.iter().filter(|entry| !entry.global))
    }

    async fn materialize(&self, ctx: &Context) -> DiResult<Vec<Arc<dyn Interceptor>>> {
        let mut resolved = Vec::with_capacity(self.entries.len());
        for entry in self.ordered() {
            let interceptor = match &entry.source {
                Source::Instance(interceptor) => interceptor.clone(),
                Source::Binding(key) => {
                    let bound = ctx.get::<Arc<dyn Interceptor>>(key).await?;
                    Arc::clone(&*bound)
                }
            };
            resolved.push(interceptor);
        }
        Ok(resolved)
    }

    /// Run `invocation` through the chain and into `handler`
    pub async fn invoke(
        &self,
        mut invocation: Invocation,
        handler: &dyn InvocationHandler,
    ) -> DiResult<Value> {
        let ctx = invocation.context().clone();
        let interceptors = self.materialize(&ctx).await?;
        trace!(
            "Invoking '{}' through {} interceptors",
            invocation.method(),
            interceptors.len()
        );
        Next {
            remaining: &interceptors,
            handler,
        }
        .proceed(&mut invocation)
        .await
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let describe = |entry: &Entry| match &entry.source {
            Source::Instance(_) => format!("instance(global={})", entry.global),
            Source::Binding(key) => format!("{}(global={})", key, entry.global),
        };
        f.debug_list()
            .entries(self.ordered().map(describe))
            .finish()
    }
}

/// Bind an interceptor under `key`, tagging it global when asked
pub fn bind_interceptor(
    ctx: &Context,
    key: impl Into<BindingKey>,
    interceptor: Arc<dyn Interceptor>,
    global: bool,
) -> DiResult<Arc<Binding>> {
    let binding = ctx.bind(key)?;
    binding.to(interceptor);
    if global {
        binding.tag(GLOBAL_INTERCEPTOR_TAG);
    }
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiError;
    use crate::value::value;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recording {
        async fn intercept(&self, invocation: &mut Invocation, next: Next<'_>) -> DiResult<Value> {
            self.log.lock().push(self.name.to_string());
            next.proceed(invocation).await
        }
    }

    fn recording(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        Arc::new(Recording {
            name,
            log: log.clone(),
        })
    }

    fn echo_handler(log: Arc<Mutex<Vec<String>>>) -> impl InvocationHandler {
        handler_fn(move |invocation: Invocation| {
            let log = log.clone();
            async move {
                log.lock().push("handler".to_string());
                Ok(value(invocation.method().to_string()))
            }
        })
    }

    #[tokio::test]
    async fn test_globals_run_first() {
        let ctx = Context::new("request");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain
            .add(recording("method", &log))
            .add_global(recording("global", &log))
            .add(recording("class", &log));

        let invocation = Invocation::new(&ctx, value(()), "find", Vec::new());
        let result = chain
            .invoke(invocation, &echo_handler(log.clone()))
            .await
            .unwrap();

        assert_eq!(*result.downcast::<String>().unwrap(), "find");
        assert_eq!(
            *log.lock(),
            vec!["global", "method", "class", "handler"]
        );
    }

    #[tokio::test]
    async fn test_missing_binding_interceptor_fails_before_running() {
        let ctx = Context::new("request");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.add(recording("first", &log)).add_binding("interceptors.absent");

        let invocation = Invocation::new(&ctx, value(()), "find", Vec::new());
        let err = chain
            .invoke(invocation, &echo_handler(log.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, DiError::BindingNotFound { .. }));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_chain_calls_handler() {
        let ctx = Context::new("request");
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new();
        assert!(chain.is_empty());

        let invocation = Invocation::new(&ctx, value(()), "count", Vec::new());
        chain
            .invoke(invocation, &echo_handler(log.clone()))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["handler"]);
    }
}
