//! Hierarchical dependency injection for Tessel
//!
//! Values are registered as [`Binding`]s in a tree of [`Context`]s. A child
//! context sees every binding of its ancestors and may shadow them. Each
//! binding carries a strategy (constant, factory, class, provider or alias)
//! and a [`BindingScope`] deciding where its value is cached.
//!
//! Classes opt into constructor and property injection through the
//! [`Injectable`] trait and metadata declared in the shared
//! [`MetadataRegistry`]. Cross-cutting behavior is layered onto method
//! calls with an [`InterceptorChain`].
//!
//! ```ignore
//! use tessel_di::prelude::*;
//!
//! let app = Context::new("application");
//! app.bind("greeting")?.to("Hello".to_string()).in_scope(BindingScope::Singleton);
//!
//! let request = app.create_child_named("request");
//! let greeting = request.get::<String>("greeting").await?;
//! ```

pub mod binding;
pub mod builder;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod metadata;
pub mod resolver;
pub mod value;

mod single_flight;

#[cfg(feature = "config")]
pub mod config;

pub use binding::{Binding, BindingKey, BindingScope};
pub use builder::{ContextBuilder, Module};
pub use context::{Context, DuplicatePolicy};
pub use error::{DiError, DiResult};
pub use interceptor::{
    bind_interceptor, handler_fn, Interceptor, InterceptorChain, Invocation, InvocationHandler,
    Next, GLOBAL_INTERCEPTOR_TAG,
};
pub use lifecycle::{Disposable, DisposalQueue};
pub use metadata::{ClassId, MetadataKey, MetadataMode, MetadataRegistry, MetadataTarget};
pub use resolver::{
    declare_parameter, declare_property, Injectable, InjectionSpec, Provider, INJECT_PARAMETERS,
    INJECT_PROPERTIES,
};
pub use value::{value, Arguments, Value};

#[cfg(feature = "config")]
pub use config::{ConfigBuilder, ContextConfig};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        declare_parameter, declare_property, value, Arguments, Binding, BindingScope, ClassId,
        Context, ContextBuilder, DiError, DiResult, Disposable, Injectable, InjectionSpec,
        Interceptor, InterceptorChain, Invocation, Module, Next, Provider, Value,
    };

    #[cfg(feature = "config")]
    pub use crate::ContextConfig;
}
