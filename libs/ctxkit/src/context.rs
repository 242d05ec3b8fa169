//! Hierarchical binding registry.
//!
//! A context owns its bindings and delegates lookups of unknown keys to its
//! parent. The parent link is weak: a child never keeps its ancestors alive.
//! Registry changes are reported to observers of the context and of all its
//! live descendants.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, trace};

use crate::binding::{Binding, BindingEvent, BindingOperation, WeakBinding};
use crate::binding_filter::{BindingFilter, TagFilter};
use crate::binding_key::{BindingKey, IntoBindingKey, PROPERTY_SEPARATOR};
use crate::error::{ContextError, Result};
use crate::observer::{notify_observer, ContextEvent, ContextEventType, ContextObserver};
use crate::resolution_session::{ResolutionOptions, ResolutionSession};
use crate::value::{get_deep_property, resolve_list, BoundValue, ValueOrPromise};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique context identity; never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct RegistryEntry {
    binding: Binding,
    listener: u64,
}

type ObserverList = Vec<(u64, Arc<dyn ContextObserver>)>;

struct ContextInner {
    id: ContextId,
    name: String,
    parent: RwLock<Option<Weak<ContextInner>>>,
    registry: RwLock<BTreeMap<String, RegistryEntry>>,
    children: Mutex<Vec<Weak<ContextInner>>>,
    observers: RwLock<ObserverList>,
    next_observer: AtomicU64,
    // Bindings holding a cached value under this context's id.
    cached: Mutex<Vec<WeakBinding>>,
    closed: AtomicBool,
}

impl ContextInner {
    fn release_cached(&self) {
        let entries = std::mem::take(&mut *self.cached.lock());
        for binding in entries.iter().filter_map(WeakBinding::upgrade) {
            binding.release_context(self.id);
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.release_cached();
    }
}

/// Handle to a node in the context tree. Clones share the node.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Root context with a generated name.
    pub fn new() -> Self {
        Self::create(None, None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::create(None, Some(name.into()))
    }

    /// Child of this context; a name is generated when `None`.
    pub fn child(&self, name: Option<&str>) -> Self {
        Self::create(Some(self), name.map(str::to_string))
    }

    fn create(parent: Option<&Context>, name: Option<String>) -> Self {
        let name = name.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ctx = Self {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                name,
                parent: RwLock::new(parent.map(|p| Arc::downgrade(&p.inner))),
                registry: RwLock::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(0),
                cached: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        if let Some(parent) = parent {
            let mut children = parent.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&ctx.inner));
        }
        debug!(name = ctx.name(), id = %ctx.id(), "Context created");
        ctx
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<Context> {
        self.inner
            .parent
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Context { inner })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// This context followed by its live ancestors, nearest first.
    fn chain(&self) -> Vec<Context> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(ctx) = current {
            current = ctx.parent();
            chain.push(ctx);
        }
        chain
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ContextError::ContextClosed {
                name: self.name().to_string(),
            });
        }
        Ok(())
    }

    // ---- registry ----

    /// Create a binding at `key`, replacing an unlocked one.
    pub fn bind(&self, key: impl IntoBindingKey) -> Result<Binding> {
        let binding = Binding::bind(key)?;
        self.add(binding.clone())?;
        Ok(binding)
    }

    /// Create the configuration binding (`key:$config`) for `key`.
    pub fn configure(&self, key: &str) -> Result<Binding> {
        let binding = Binding::configure(key)?;
        self.add(binding.clone())?;
        Ok(binding)
    }

    /// Register a pre-built binding owned by this context.
    pub fn add(&self, binding: Binding) -> Result<()> {
        self.ensure_open()?;
        let key = binding.key().to_string();

        let weak = Arc::downgrade(&self.inner);
        let listener = binding.on_changed(Arc::new(move |event: &BindingEvent| {
            if let Some(inner) = weak.upgrade() {
                let ctx = Context { inner };
                ctx.notify(
                    ContextEventType::Changed,
                    &event.binding,
                    Some(event.operation),
                );
            }
        }));

        let replaced = {
            let mut registry = self.inner.registry.write();
            if registry.get(&key).is_some_and(|e| e.binding.is_locked()) {
                drop(registry);
                binding.remove_listener(listener);
                return Err(ContextError::BindingIsLocked { key });
            }
            registry.insert(
                key.clone(),
                RegistryEntry {
                    binding: binding.clone(),
                    listener,
                },
            )
        };

        if let Some(old) = replaced {
            old.binding.remove_listener(old.listener);
            old.binding.clear_cache();
            self.notify(ContextEventType::Unbind, &old.binding, None);
        }
        debug!(context = self.name(), key = %key, "Binding added");
        self.notify(ContextEventType::Bind, &binding, None);
        Ok(())
    }

    /// Remove the local binding at `key`. Returns `false` if there was none.
    pub fn unbind(&self, key: impl IntoBindingKey) -> Result<bool> {
        self.ensure_open()?;
        let key = key.into_binding_key()?;
        if key.path().is_some() {
            return Err(ContextError::invalid_key(
                &key.to_string(),
                "cannot unbind a property path",
            ));
        }
        let removed = {
            let mut registry = self.inner.registry.write();
            let locked = match registry.get(key.key()) {
                None => return Ok(false),
                Some(e) => e.binding.is_locked(),
            };
            if locked {
                return Err(ContextError::BindingIsLocked {
                    key: key.key().to_string(),
                });
            }
            registry.remove(key.key())
        };
        if let Some(entry) = removed {
            entry.binding.remove_listener(entry.listener);
            entry.binding.clear_cache();
            debug!(context = self.name(), key = key.key(), "Binding removed");
            self.notify(ContextEventType::Unbind, &entry.binding, None);
        }
        Ok(true)
    }

    /// Whether `key` is bound directly in this context.
    pub fn contains(&self, key: &str) -> bool {
        let key = strip_path(key);
        self.inner.registry.read().contains_key(key)
    }

    /// Whether `key` is bound here or in an ancestor.
    pub fn is_bound(&self, key: &str) -> bool {
        self.find_binding(key).is_some()
    }

    /// Nearest context (self or ancestor) that owns `key`.
    pub fn get_owner_context(&self, key: &str) -> Option<Context> {
        let key = strip_path(key);
        self.chain().into_iter().find(|ctx| ctx.contains(key))
    }

    fn find_binding(&self, key: &str) -> Option<Binding> {
        let key = strip_path(key);
        self.chain().into_iter().find_map(|ctx| {
            ctx.inner
                .registry
                .read()
                .get(key)
                .map(|e| e.binding.clone())
        })
    }

    pub fn get_binding(&self, key: impl IntoBindingKey) -> Result<Binding> {
        let key = key.into_binding_key()?;
        self.find_binding(key.key())
            .ok_or_else(|| ContextError::BindingNotFound {
                key: key.key().to_string(),
                context: self.name().to_string(),
            })
    }

    pub fn get_binding_optional(&self, key: impl IntoBindingKey) -> Result<Option<Binding>> {
        let key = key.into_binding_key()?;
        Ok(self.find_binding(key.key()))
    }

    /// Bindings visible from this context that match `filter`.
    ///
    /// A key bound at several levels is represented by its nearest binding
    /// only, and only if that binding matches.
    pub fn find(&self, filter: impl Into<BindingFilter>) -> Vec<Binding> {
        if self.is_closed() {
            return Vec::new();
        }
        let filter = filter.into();
        let mut seen = HashSet::new();
        let mut visible = Vec::new();
        for ctx in self.chain() {
            let snapshot: Vec<(String, Binding)> = ctx
                .inner
                .registry
                .read()
                .iter()
                .map(|(k, e)| (k.clone(), e.binding.clone()))
                .collect();
            for (key, binding) in snapshot {
                if seen.insert(key) {
                    visible.push(binding);
                }
            }
        }
        visible.retain(|b| filter.matches(b));
        visible
    }

    pub fn find_by_tag(&self, filter: impl Into<TagFilter>) -> Vec<Binding> {
        self.find(BindingFilter::Tag(filter.into()))
    }

    // ---- resolution ----

    /// Resolve `key` (deep paths allowed) without forcing a suspension.
    pub fn get_value_or_promise(
        &self,
        key: impl IntoBindingKey,
        options: ResolutionOptions,
    ) -> Result<ValueOrPromise<Option<BoundValue>>> {
        let key = key.into_binding_key()?;
        self.ensure_open()?;
        trace!(context = self.name(), key = %key, "Resolve value");

        let Some(binding) = self.find_binding(key.key()) else {
            if options.optional {
                return Ok(ValueOrPromise::Ready(None));
            }
            return Err(ContextError::BindingNotFound {
                key: key.key().to_string(),
                context: self.name().to_string(),
            });
        };

        let optional = options.optional;
        let value = binding.get_value(self, options)?;
        let Some(path) = key.path().map(str::to_string) else {
            return Ok(value);
        };
        value.map(move |value| {
            let Some(value) = value else {
                return Ok(None);
            };
            match get_deep_property(&value, &path) {
                Some(property) => Ok(Some(property)),
                None if optional => Ok(None),
                None => Err(ContextError::PropertyNotFound {
                    key: key.key().to_string(),
                    path,
                }),
            }
        })
    }

    /// Resolve `key` synchronously; fails if the value is still pending.
    pub fn get_value_sync(
        &self,
        key: impl IntoBindingKey,
        options: ResolutionOptions,
    ) -> Result<Option<BoundValue>> {
        let key = key.into_binding_key()?;
        let display = key.to_string();
        match self.get_value_or_promise(key, options)? {
            ValueOrPromise::Ready(value) => Ok(value),
            ValueOrPromise::Pending(_) => Err(ContextError::AsyncResolutionRequired { key: display }),
        }
    }

    pub async fn get_value(
        &self,
        key: impl IntoBindingKey,
        options: ResolutionOptions,
    ) -> Result<Option<BoundValue>> {
        self.get_value_or_promise(key, options)?.resolve().await
    }

    /// Resolve `key` as `T`.
    pub async fn get<T: Send + Sync + 'static>(&self, key: impl IntoBindingKey) -> Result<Arc<T>> {
        let key = key.into_binding_key()?;
        let value = self.get_value(&key, ResolutionOptions::default()).await?;
        require_typed(&key, value)
    }

    /// Resolve `key` as `T`, or `None` when nothing is bound.
    pub async fn get_optional<T: Send + Sync + 'static>(
        &self,
        key: impl IntoBindingKey,
    ) -> Result<Option<Arc<T>>> {
        let key = key.into_binding_key()?;
        let value = self.get_value(&key, ResolutionOptions::optional()).await?;
        value.map(|v| typed(&key, v)).transpose()
    }

    pub fn get_sync<T: Send + Sync + 'static>(&self, key: impl IntoBindingKey) -> Result<Arc<T>> {
        let key = key.into_binding_key()?;
        let value = self.get_value_sync(&key, ResolutionOptions::default())?;
        require_typed(&key, value)
    }

    pub fn get_sync_optional<T: Send + Sync + 'static>(
        &self,
        key: impl IntoBindingKey,
    ) -> Result<Option<Arc<T>>> {
        let key = key.into_binding_key()?;
        let value = self.get_value_sync(&key, ResolutionOptions::optional())?;
        value.map(|v| typed(&key, v)).transpose()
    }

    /// Values of every visible binding matching `filter`, in `find` order.
    pub(crate) fn resolve_all_or_promise(
        &self,
        filter: &BindingFilter,
        session: Option<ResolutionSession>,
    ) -> Result<ValueOrPromise<Vec<BoundValue>>> {
        let bindings = self.find(filter.clone());
        let session = session.unwrap_or_default();
        let values = resolve_list(&bindings, |binding, _| {
            binding.get_value(self, ResolutionOptions::with_session(session.fork()))
        })?;
        values.map(|values| Ok(values.into_iter().flatten().collect()))
    }

    pub async fn resolve_all(&self, filter: impl Into<BindingFilter>) -> Result<Vec<BoundValue>> {
        self.resolve_all_or_promise(&filter.into(), None)?
            .resolve()
            .await
    }

    // ---- configuration ----

    /// Resolve the configuration bound for `key`, optionally at `path`.
    pub fn get_config_value_or_promise(
        &self,
        key: &str,
        path: Option<&str>,
        options: ResolutionOptions,
    ) -> Result<ValueOrPromise<Option<BoundValue>>> {
        let config_key = BindingKey::build_key_for_config(key)?;
        let address = match path {
            Some(path) => config_key.deep_property(path)?,
            None => config_key,
        };
        trace!(key, address = %address, "Resolve configuration");
        self.get_value_or_promise(address, options)
    }

    /// Configuration for `key`; `None` when not configured.
    pub async fn get_config(&self, key: &str, path: Option<&str>) -> Result<Option<BoundValue>> {
        self.get_config_value_or_promise(key, path, ResolutionOptions::optional())?
            .resolve()
            .await
    }

    pub fn get_config_sync(&self, key: &str, path: Option<&str>) -> Result<Option<BoundValue>> {
        match self.get_config_value_or_promise(key, path, ResolutionOptions::optional())? {
            ValueOrPromise::Ready(value) => Ok(value),
            ValueOrPromise::Pending(_) => Err(ContextError::AsyncResolutionRequired {
                key: BindingKey::build_key_for_config(key)?.to_string(),
            }),
        }
    }

    // ---- observation ----

    /// Register an observer for events in this context and its ancestors.
    pub fn subscribe(&self, observer: impl ContextObserver + 'static) -> Subscription {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.write().push((id, Arc::new(observer)));
        Subscription {
            context: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().len()
    }

    fn notify(
        &self,
        event_type: ContextEventType,
        binding: &Binding,
        operation: Option<BindingOperation>,
    ) {
        let event = ContextEvent {
            event_type,
            binding: binding.clone(),
            context: self.clone(),
            operation,
        };
        deliver(&self.inner, &event);
    }

    pub(crate) fn track_cached(&self, binding: &Binding) {
        let mut cached = self.inner.cached.lock();
        if !cached.iter().any(|w| w.is(binding)) {
            cached.push(binding.downgrade());
        }
    }

    // ---- lifecycle ----

    /// Close the context: detach from the parent, drop all bindings and the
    /// values cached for this context. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(name = self.name(), "Close context");

        let parent = self.inner.parent.write().take();
        if let Some(parent) = parent.as_ref().and_then(Weak::upgrade) {
            let me = Arc::as_ptr(&self.inner);
            parent
                .children
                .lock()
                .retain(|c| c.strong_count() > 0 && c.as_ptr() != me);
        }

        let entries = std::mem::take(&mut *self.inner.registry.write());
        for entry in entries.values() {
            entry.binding.remove_listener(entry.listener);
            entry.binding.release_context(self.id());
        }
        drop(entries);
        self.inner.release_cached();
        let observers = std::mem::take(&mut *self.inner.observers.write());
        drop(observers);
    }

    // ---- inspection ----

    /// JSON dump of this context and its ancestors.
    pub fn inspect(&self) -> Json {
        let bindings: Map<String, Json> = self
            .inner
            .registry
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.binding.inspect(true)))
            .collect();
        let mut json = json!({
            "name": self.name(),
            "bindings": bindings,
        });
        if let Some(parent) = self.parent() {
            json["parent"] = parent.inspect();
        }
        json
    }
}

fn deliver(inner: &Arc<ContextInner>, event: &ContextEvent) {
    let observers: Vec<Arc<dyn ContextObserver>> = inner
        .observers
        .read()
        .iter()
        .map(|(_, o)| o.clone())
        .collect();
    for observer in observers {
        notify_observer(observer.as_ref(), event);
    }
    let children: Vec<Arc<ContextInner>> = inner
        .children
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for child in children {
        deliver(&child, event);
    }
}

fn strip_path(key: &str) -> &str {
    key.split(PROPERTY_SEPARATOR).next().unwrap_or(key)
}

fn typed<T: Send + Sync + 'static>(key: &BindingKey, value: BoundValue) -> Result<Arc<T>> {
    value.downcast::<T>().ok_or_else(|| ContextError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>(),
        actual: value.type_name(),
    })
}

fn require_typed<T: Send + Sync + 'static>(
    key: &BindingKey,
    value: Option<BoundValue>,
) -> Result<Arc<T>> {
    let value = value.ok_or_else(|| ContextError::NoValueConfigured {
        key: key.to_string(),
    })?;
    typed(key, value)
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle returned by [`Context::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    context: Weak<ContextInner>,
    id: u64,
}

impl Subscription {
    /// Stop delivering events; returns `false` if already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.context.upgrade() else {
            return false;
        };
        let mut observers = inner.observers.write();
        let before = observers.len();
        observers.retain(|(id, _)| *id != self.id);
        observers.len() != before
    }

    pub fn is_active(&self) -> bool {
        self.context
            .upgrade()
            .is_some_and(|inner| inner.observers.read().iter().any(|(id, _)| *id == self.id))
    }
}
