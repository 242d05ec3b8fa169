//! A single registry entry: key, scope, tags and value source.
//!
//! `Binding` is a cheap handle; clones share state, so a binding obtained
//! from a context can be reconfigured in place. Values are computed by one
//! dispatch over [`BindingSource`] and cached per scope under a [`ContextId`]:
//! the owning context for singletons, the resolving context for
//! context-scoped bindings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, trace};

use crate::binding_key::{BindingKey, IntoBindingKey};
use crate::context::{Context, ContextId};
use crate::error::{ContextError, Result};
use crate::inject::ClassRef;
use crate::keys::ContextTags;
use crate::provider::Provider;
use crate::resolution_session::{ResolutionContext, ResolutionOptions};
use crate::resolver::instantiate_class;
use crate::value::{BoundValue, ValueOrPromise};

/// Caching policy of a binding's value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingScope {
    /// Computed on every request.
    #[default]
    #[serde(alias = "transient")]
    Transient,
    /// Cached per resolving context.
    #[serde(alias = "context")]
    Context,
    /// Cached once in the owning context and shared with descendants.
    #[serde(alias = "singleton")]
    Singleton,
}

impl fmt::Display for BindingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingScope::Transient => "Transient",
            BindingScope::Context => "Context",
            BindingScope::Singleton => "Singleton",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BindingType {
    Constant,
    DynamicValue,
    Class,
    Provider,
    Alias,
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingType::Constant => "Constant",
            BindingType::DynamicValue => "DynamicValue",
            BindingType::Class => "Class",
            BindingType::Provider => "Provider",
            BindingType::Alias => "Alias",
        };
        f.write_str(s)
    }
}

/// Erased value factory of a dynamic binding.
pub type ValueFactory = Arc<
    dyn Fn(&ResolutionContext) -> Result<ValueOrPromise<Option<BoundValue>>> + Send + Sync,
>;

/// Calls `value()` on an instantiated provider.
pub type ProviderInvoker =
    Arc<dyn Fn(BoundValue) -> Result<ValueOrPromise<Option<BoundValue>>> + Send + Sync>;

/// Where a binding's value comes from.
#[derive(Clone)]
pub enum BindingSource {
    Constant(BoundValue),
    DynamicValue(ValueFactory),
    Class(ClassRef),
    Provider(ClassRef, ProviderInvoker),
    Alias(BindingKey),
}

impl BindingSource {
    pub fn binding_type(&self) -> BindingType {
        match self {
            BindingSource::Constant(_) => BindingType::Constant,
            BindingSource::DynamicValue(_) => BindingType::DynamicValue,
            BindingSource::Class(_) => BindingType::Class,
            BindingSource::Provider(..) => BindingType::Provider,
            BindingSource::Alias(_) => BindingType::Alias,
        }
    }
}

impl fmt::Debug for BindingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingSource::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            BindingSource::DynamicValue(_) => f.write_str("DynamicValue(<fn>)"),
            BindingSource::Class(c) => f.debug_tuple("Class").field(c).finish(),
            BindingSource::Provider(c, _) => f.debug_tuple("Provider").field(c).finish(),
            BindingSource::Alias(k) => f.debug_tuple("Alias").field(k).finish(),
        }
    }
}

/// A tag argument: a bare name (its own value), a name/value pair or a map.
#[derive(Clone, Debug, PartialEq)]
pub enum TagArg {
    Name(String),
    Pair(String, Json),
    Map(Map<String, Json>),
}

impl From<&str> for TagArg {
    fn from(name: &str) -> Self {
        TagArg::Name(name.to_string())
    }
}

impl From<String> for TagArg {
    fn from(name: String) -> Self {
        TagArg::Name(name)
    }
}

impl<V: Into<Json>> From<(&str, V)> for TagArg {
    fn from((name, value): (&str, V)) -> Self {
        TagArg::Pair(name.to_string(), value.into())
    }
}

impl From<Map<String, Json>> for TagArg {
    fn from(map: Map<String, Json>) -> Self {
        TagArg::Map(map)
    }
}

impl TryFrom<Json> for TagArg {
    type Error = ContextError;

    fn try_from(value: Json) -> Result<Self> {
        match value {
            Json::String(name) => Ok(TagArg::Name(name)),
            Json::Object(map) => Ok(TagArg::Map(map)),
            other => Err(ContextError::InvalidTagArgument {
                tag: other.to_string(),
            }),
        }
    }
}

/// What changed on a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingOperation {
    Value,
    Tag,
    Scope,
}

impl fmt::Display for BindingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingOperation::Value => "value",
            BindingOperation::Tag => "tag",
            BindingOperation::Scope => "scope",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct BindingEvent {
    pub binding: Binding,
    pub operation: BindingOperation,
}

pub type BindingListener = Arc<dyn Fn(&BindingEvent) + Send + Sync>;

/// Reusable binding configuration, applied with [`Binding::apply`].
pub type BindingTemplate = Arc<dyn Fn(&Binding) + Send + Sync>;

/// Declarative scope and tags, convertible into a template.
#[derive(Clone, Debug, Default)]
pub struct BindingSpec {
    pub scope: Option<BindingScope>,
    pub tags: Vec<TagArg>,
}

impl BindingSpec {
    pub fn scope(mut self, scope: BindingScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn tag(mut self, tag: impl Into<TagArg>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn as_binding_template(&self) -> BindingTemplate {
        let spec = self.clone();
        Arc::new(move |binding: &Binding| {
            if let Some(scope) = spec.scope {
                binding.in_scope(scope);
            }
            for tag in &spec.tags {
                binding.tag(tag.clone());
            }
        })
    }
}

#[derive(Default)]
struct BindingState {
    scope: Option<BindingScope>,
    tags: BTreeMap<String, Json>,
    locked: bool,
    source: Option<BindingSource>,
}

#[derive(Default)]
struct ValueCache {
    values: HashMap<ContextId, BoundValue>,
    // Bumped on every clear; pending computations started before a clear
    // must not repopulate the cache.
    generation: u64,
}

struct BindingInner {
    key: BindingKey,
    state: RwLock<BindingState>,
    cache: Mutex<ValueCache>,
    listeners: Mutex<Vec<(u64, BindingListener)>>,
    next_listener: AtomicU64,
}

#[derive(Clone)]
pub struct Binding {
    inner: Arc<BindingInner>,
}

pub(crate) struct WeakBinding(Weak<BindingInner>);

impl WeakBinding {
    pub(crate) fn upgrade(&self) -> Option<Binding> {
        self.0.upgrade().map(|inner| Binding { inner })
    }

    pub(crate) fn is(&self, binding: &Binding) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&binding.inner))
    }
}

impl Binding {
    /// Create a detached binding; add it to a context with `Context::add`.
    pub fn bind(key: impl IntoBindingKey) -> Result<Self> {
        let key = key.into_binding_key()?;
        if key.path().is_some() {
            return Err(ContextError::invalid_key(
                &key.to_string(),
                "a binding key cannot carry a property path",
            ));
        }
        Ok(Self::from_key(key))
    }

    /// Configuration binding for `key`, tagged with the key it configures.
    pub fn configure(key: &str) -> Result<Self> {
        let binding = Self::bind(BindingKey::build_key_for_config(key)?)?;
        binding.tag((ContextTags::CONFIGURATION_FOR, key));
        Ok(binding)
    }

    fn from_key(key: BindingKey) -> Self {
        Self {
            inner: Arc::new(BindingInner {
                key,
                state: RwLock::new(BindingState::default()),
                cache: Mutex::new(ValueCache::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Same configuration under a different key; cache and listeners are not copied.
    pub(crate) fn with_key(&self, key: BindingKey) -> Self {
        let copy = Self::from_key(key);
        {
            let src = self.inner.state.read();
            let mut dst = copy.inner.state.write();
            dst.scope = src.scope;
            dst.tags = src.tags.clone();
            dst.locked = src.locked;
            dst.source = src.source.clone();
        }
        copy
    }

    pub fn key(&self) -> &str {
        self.inner.key.key()
    }

    pub fn binding_key(&self) -> &BindingKey {
        &self.inner.key
    }

    pub fn scope(&self) -> BindingScope {
        self.inner.state.read().scope.unwrap_or_default()
    }

    pub fn binding_type(&self) -> Option<BindingType> {
        self.inner
            .state
            .read()
            .source
            .as_ref()
            .map(BindingSource::binding_type)
    }

    pub fn source(&self) -> Option<BindingSource> {
        self.inner.state.read().source.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state.read().locked
    }

    pub fn tag_map(&self) -> BTreeMap<String, Json> {
        self.inner.state.read().tags.clone()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.inner.state.read().tags.keys().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Binding) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakBinding {
        WeakBinding(Arc::downgrade(&self.inner))
    }

    // ---- configuration ----

    /// Bind to a constant value.
    ///
    /// `value` is stored as is, even when it is a future. Deferred values go
    /// through [`Binding::to_value`] (rejects pending values) or
    /// [`Binding::to_async_value`].
    pub fn to<T: Send + Sync + 'static>(&self, value: T) -> &Self {
        self.to_bound(BoundValue::new(value))
    }

    /// Bind to an already erased constant, keeping its identity.
    pub fn to_bound(&self, value: BoundValue) -> &Self {
        debug!(key = self.key(), value = ?value, "Bind to constant");
        self.set_source(BindingSource::Constant(value))
    }

    /// Bind to a constant that must already be resolved.
    pub fn to_value(&self, value: ValueOrPromise<BoundValue>) -> Result<&Self> {
        match value {
            ValueOrPromise::Ready(v) => Ok(self.to_bound(v)),
            ValueOrPromise::Pending(_) => Err(ContextError::InvalidConstantValue {
                key: self.key().to_string(),
            }),
        }
    }

    /// Bind to a factory invoked on every cache miss.
    pub fn to_dynamic_value<T, F>(&self, factory: F) -> &Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ResolutionContext) -> Result<ValueOrPromise<T>> + Send + Sync + 'static,
    {
        self.to_bound_factory(move |rc: &ResolutionContext| {
            factory(rc)?.map(|v| Ok(Some(BoundValue::new(v))))
        })
    }

    /// Bind to an async factory.
    pub fn to_async_value<T, F, Fut>(&self, factory: F) -> &Self
    where
        T: Send + Sync + 'static,
        F: Fn(&ResolutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.to_bound_factory(move |rc: &ResolutionContext| {
            let fut = factory(rc);
            Ok(ValueOrPromise::promise(async move {
                Ok(Some(BoundValue::new(fut.await?)))
            }))
        })
    }

    /// Bind to a factory producing erased values (or nothing).
    pub fn to_bound_factory<F>(&self, factory: F) -> &Self
    where
        F: Fn(&ResolutionContext) -> Result<ValueOrPromise<Option<BoundValue>>>
            + Send
            + Sync
            + 'static,
    {
        debug!(key = self.key(), "Bind to dynamic value");
        self.set_source(BindingSource::DynamicValue(Arc::new(factory)))
    }

    /// Bind to an instance of `T`, built from its registered class definition.
    pub fn to_class<T: Send + Sync + 'static>(&self) -> &Self {
        self.to_class_ref(ClassRef::of::<T>())
    }

    pub fn to_class_ref(&self, class: ClassRef) -> &Self {
        debug!(key = self.key(), class = class.name(), "Bind to class");
        self.set_source(BindingSource::Class(class))
    }

    /// Bind to the value produced by provider `P`.
    pub fn to_provider<P: Provider>(&self) -> &Self {
        let class = ClassRef::of::<P>();
        debug!(key = self.key(), provider = class.name(), "Bind to provider");
        let key = self.key().to_string();
        let invoke: ProviderInvoker = Arc::new(move |instance: BoundValue| {
            let provider = instance
                .downcast::<P>()
                .ok_or_else(|| ContextError::TypeMismatch {
                    key: key.clone(),
                    expected: std::any::type_name::<P>(),
                    actual: instance.type_name(),
                })?;
            provider.value()?.map(|v| Ok(Some(BoundValue::new(v))))
        });
        self.set_source(BindingSource::Provider(class, invoke))
    }

    /// Delegate to another binding, optionally descending into a property path.
    pub fn to_alias(&self, target: impl IntoBindingKey) -> Result<&Self> {
        let target = target.into_binding_key()?;
        debug!(key = self.key(), alias = %target, "Bind to alias");
        Ok(self.set_source(BindingSource::Alias(target)))
    }

    fn set_source(&self, source: BindingSource) -> &Self {
        self.inner.state.write().source = Some(source);
        self.clear_cache();
        self.emit_changed(BindingOperation::Value);
        self
    }

    pub fn lock(&self) -> &Self {
        self.inner.state.write().locked = true;
        self
    }

    pub fn unlock(&self) -> &Self {
        self.inner.state.write().locked = false;
        self
    }

    /// Merge a tag into the tag map.
    pub fn tag(&self, tag: impl Into<TagArg>) -> &Self {
        {
            let mut state = self.inner.state.write();
            match tag.into() {
                TagArg::Name(name) => {
                    state.tags.insert(name.clone(), Json::String(name));
                }
                TagArg::Pair(name, value) => {
                    state.tags.insert(name, value);
                }
                TagArg::Map(map) => state.tags.extend(map),
            }
        }
        self.emit_changed(BindingOperation::Tag);
        self
    }

    /// Tag from an untyped JSON argument; arrays and scalars are rejected.
    pub fn try_tag(&self, tag: Json) -> Result<&Self> {
        Ok(self.tag(TagArg::try_from(tag)?))
    }

    pub fn in_scope(&self, scope: BindingScope) -> &Self {
        let changed = {
            let mut state = self.inner.state.write();
            let changed = state.scope != Some(scope);
            state.scope = Some(scope);
            changed
        };
        if changed {
            self.clear_cache();
        }
        self.emit_changed(BindingOperation::Scope);
        self
    }

    /// Set the scope only if none was chosen explicitly.
    pub fn apply_default_scope(&self, scope: BindingScope) -> &Self {
        let unset = self.inner.state.read().scope.is_none();
        if unset {
            self.in_scope(scope);
        }
        self
    }

    pub fn apply<F: Fn(&Binding)>(&self, template: F) -> &Self {
        template(self);
        self
    }

    pub fn apply_templates(&self, templates: &[BindingTemplate]) -> &Self {
        for template in templates {
            template(self);
        }
        self
    }

    // ---- events ----

    /// Register a listener for `changed` events; returns its id.
    pub fn on_changed(&self, listener: BindingListener) -> u64 {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit_changed(&self, operation: BindingOperation) {
        let listeners: Vec<BindingListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let event = BindingEvent {
            binding: self.clone(),
            operation,
        };
        for listener in listeners {
            listener(&event);
        }
    }

    // ---- values ----

    fn cache_owner(&self, ctx: &Context) -> Option<Context> {
        match self.scope() {
            BindingScope::Transient => None,
            BindingScope::Context => Some(ctx.clone()),
            BindingScope::Singleton => Some(
                ctx.get_owner_context(self.key())
                    .unwrap_or_else(|| ctx.clone()),
            ),
        }
    }

    // Evicted values are dropped after the lock is released: a value may
    // hold the last handle to a context whose teardown touches this cache.
    pub(crate) fn clear_cache(&self) {
        let evicted = {
            let mut cache = self.inner.cache.lock();
            cache.generation += 1;
            std::mem::take(&mut cache.values)
        };
        drop(evicted);
    }

    fn store_cached(&self, owner: &Context, generation: u64, value: BoundValue) {
        let evicted;
        {
            let mut cache = self.inner.cache.lock();
            if cache.generation != generation {
                trace!(key = self.key(), "Discarding value computed before cache reset");
                return;
            }
            evicted = cache.values.insert(owner.id(), value);
        }
        drop(evicted);
        owner.track_cached(self);
    }

    /// Drop the cached value held for `id`.
    pub(crate) fn release_context(&self, id: ContextId) {
        let evicted = self.inner.cache.lock().values.remove(&id);
        drop(evicted);
    }

    /// Invalidate the cached value for the scope this binding has in `ctx`.
    pub fn refresh(&self, ctx: &Context) {
        if let Some(owner) = self.cache_owner(ctx) {
            debug!(key = self.key(), context = owner.name(), "Refresh binding");
            self.release_context(owner.id());
        }
    }

    /// Resolve the value of this binding in `ctx`.
    ///
    /// Cached values are returned synchronously. Otherwise the source is
    /// evaluated with this binding pushed onto the caller's session, and the
    /// outcome (once available) is cached according to the scope.
    pub fn get_value(
        &self,
        ctx: &Context,
        options: ResolutionOptions,
    ) -> Result<ValueOrPromise<Option<BoundValue>>> {
        trace!(key = self.key(), context = ctx.name(), "Get value for binding");
        let owner = self.cache_owner(ctx);
        let generation = {
            let cache = self.inner.cache.lock();
            if let Some(owner) = &owner {
                if let Some(value) = cache.values.get(&owner.id()) {
                    trace!(key = self.key(), "Cache hit");
                    return Ok(ValueOrPromise::Ready(Some(value.clone())));
                }
            }
            cache.generation
        };

        let Some(source) = self.source() else {
            if options.optional {
                return Ok(ValueOrPromise::Ready(None));
            }
            return Err(ContextError::NoValueConfigured {
                key: self.key().to_string(),
            });
        };
        if options.as_proxy_with_interceptors && source.binding_type() != BindingType::Class {
            return Err(ContextError::ProxyNotSupported {
                key: self.key().to_string(),
                binding_type: source.binding_type().to_string(),
            });
        }

        let ResolutionOptions {
            session,
            optional,
            as_proxy_with_interceptors,
        } = options;
        let mut session = session.unwrap_or_default();
        session.push_binding(self)?;
        let rc = ResolutionContext {
            context: ctx.clone(),
            binding: self.clone(),
            options: ResolutionOptions {
                session: Some(session),
                optional,
                as_proxy_with_interceptors,
            },
        };
        let result = self.compute(&source, &rc)?;

        let Some(owner) = owner else {
            return Ok(result);
        };
        Ok(match result {
            ValueOrPromise::Ready(Some(value)) => {
                self.store_cached(&owner, generation, value.clone());
                ValueOrPromise::Ready(Some(value))
            }
            ValueOrPromise::Ready(None) => ValueOrPromise::Ready(None),
            ValueOrPromise::Pending(fut) => {
                let binding = self.clone();
                ValueOrPromise::promise(async move {
                    let value = fut.await?;
                    if let Some(v) = &value {
                        binding.store_cached(&owner, generation, v.clone());
                    }
                    Ok(value)
                })
            }
        })
    }

    fn compute(
        &self,
        source: &BindingSource,
        rc: &ResolutionContext,
    ) -> Result<ValueOrPromise<Option<BoundValue>>> {
        match source {
            BindingSource::Constant(value) => Ok(ValueOrPromise::Ready(Some(value.clone()))),
            BindingSource::DynamicValue(factory) => factory(rc),
            BindingSource::Class(class) => {
                let instance = instantiate_class(class, &rc.context, rc.session())?;
                let proxy = if rc.options.as_proxy_with_interceptors {
                    class.metadata().and_then(|m| m.proxy().cloned())
                } else {
                    None
                };
                match proxy {
                    Some(proxy) => {
                        let ctx = rc.context.clone();
                        instance.map(move |v| proxy(v, &ctx).map(Some))
                    }
                    None => instance.map(|v| Ok(Some(v))),
                }
            }
            BindingSource::Provider(class, invoke) => {
                let invoke = invoke.clone();
                instantiate_class(class, &rc.context, rc.session())?.and_then(move |p| invoke(p))
            }
            BindingSource::Alias(target) => rc
                .context
                .get_value_or_promise(target.clone(), rc.options.clone()),
        }
    }

    // ---- inspection ----

    pub fn to_json(&self) -> Json {
        let state = self.inner.state.read();
        let mut json = json!({
            "key": self.key(),
            "scope": state.scope.unwrap_or_default(),
            "tags": state.tags,
            "isLocked": state.locked,
        });
        if let Some(source) = &state.source {
            json["type"] = json!(source.binding_type());
            match source {
                BindingSource::Class(class) => json["valueConstructor"] = json!(class.name()),
                BindingSource::Provider(class, _) => {
                    json["providerConstructor"] = json!(class.name())
                }
                BindingSource::Alias(target) => json["alias"] = json!(target.to_string()),
                BindingSource::Constant(_) | BindingSource::DynamicValue(_) => {}
            }
        }
        json
    }

    /// JSON view, optionally with the injection points of the bound class.
    pub fn inspect(&self, include_injections: bool) -> Json {
        let mut json = self.to_json();
        if include_injections {
            let class = match self.source() {
                Some(BindingSource::Class(c)) | Some(BindingSource::Provider(c, _)) => Some(c),
                _ => None,
            };
            if let Some(meta) = class.and_then(|c| c.metadata()) {
                let injections = meta.injections_json();
                if injections.as_object().is_some_and(|o| !o.is_empty()) {
                    json["injections"] = injections;
                }
            }
        }
        json
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Binding")
            .field("key", &self.key())
            .field("scope", &state.scope.unwrap_or_default())
            .field("type", &state.source.as_ref().map(BindingSource::binding_type))
            .field("locked", &state.locked)
            .finish()
    }
}
