//! # ctxkit - hierarchical dependency injection
//!
//! A tree of [`Context`]s holds [`Binding`]s addressed by string keys. Each
//! binding produces its value from a constant, a factory, a registered
//! class, a provider or an alias, and caches it according to its
//! [`BindingScope`]. Lookups fall back to ancestor contexts.
//!
//! Resolution is synchronous whenever every involved factory is:
//! [`ValueOrPromise::Ready`] values are usable immediately, and a single
//! asynchronous dependency turns the enclosing resolution into
//! [`ValueOrPromise::Pending`].
//!
//! ## Example
//!
//! ```rust
//! use ctxkit::{inject, ClassDef, Context};
//!
//! struct Greeter {
//!     name: String,
//! }
//!
//! ClassDef::<Greeter>::new("Greeter")
//!     .param(inject("name"))
//!     .constructor(|args| {
//!         let name = args.arg::<String>(0)?;
//!         Ok(Greeter { name: name.to_string() })
//!     })
//!     .register();
//!
//! let ctx = Context::named("app");
//! ctx.bind("name")?.to(String::from("world"));
//! ctx.bind("greeter")?.to_class::<Greeter>();
//!
//! let greeter = ctx.get_sync::<Greeter>("greeter")?;
//! assert_eq!(greeter.name, "world");
//! # Ok::<(), ctxkit::ContextError>(())
//! ```

pub mod binding;
pub mod binding_filter;
pub mod binding_inspector;
pub mod binding_key;
pub mod context;
pub mod error;
pub mod inject;
pub mod keys;
pub mod observer;
pub mod provider;
pub mod resolution_session;
pub mod resolver;
pub mod value;

pub use binding::{
    Binding, BindingEvent, BindingOperation, BindingScope, BindingSource, BindingSpec,
    BindingTemplate, BindingType, TagArg,
};
pub use binding_filter::{BindingFilter, TagFilter, TagValueMatcher};
pub use binding_inspector::{
    create_binding_from_class, create_binding_from_class_ref, BindingFromClassOptions,
};
pub use binding_key::{BindingKey, IntoBindingKey};
pub use context::{Context, ContextId, Subscription};
pub use error::{ContextError, Result};
pub use inject::{
    class_metadata, inject, inject_config, inject_context, inject_filter, inject_tag,
    inject_with, BindingSelector, ClassDef, ClassMetadata, ClassRef, Injection, InjectionSpec,
};
pub use keys::ContextTags;
pub use observer::{ContextEvent, ContextEventType, ContextObserver, FilteredObserver};
pub use provider::Provider;
pub use resolution_session::{ResolutionContext, ResolutionOptions, ResolutionSession};
pub use resolver::{instantiate_class, InjectedArgs};
pub use value::{resolve_list, BoundValue, ValueOrPromise};
