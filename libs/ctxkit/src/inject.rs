//! Injection metadata and the class side-table.
//!
//! Rust has no runtime reflection over constructor parameters, so each
//! injectable type is described once with a [`ClassDef`] and registered
//! explicitly. The registry maps the type to its constructor, the selector
//! of every constructor parameter and property, and optional binding
//! templates (the equivalent of a class-level `@bind`).

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{json, Map, Value as Json};

use crate::binding::{Binding, BindingSpec, BindingTemplate};
use crate::binding_filter::{BindingFilter, TagFilter};
use crate::binding_key::BindingKey;
use crate::context::Context;
use crate::error::{ContextError, Result};
use crate::keys::ContextTags;
use crate::provider::Provider;
use crate::resolution_session::{ResolutionOptions, ResolutionSession};
use crate::resolver::InjectedArgs;
use crate::value::{BoundValue, ValueOrPromise};

/// Custom resolution function for an injection point.
pub type CustomResolver = Arc<
    dyn Fn(&Context, &Injection, &mut ResolutionSession) -> Result<ValueOrPromise<Option<BoundValue>>>
        + Send
        + Sync,
>;

/// What to inject.
#[derive(Clone)]
pub enum BindingSelector {
    /// A binding address, possibly with a deep property path.
    Key(String),
    /// Values of every binding matching the filter, as `Vec<BoundValue>`.
    Filter(BindingFilter),
    /// A resolution function.
    Custom(CustomResolver),
}

impl fmt::Debug for BindingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingSelector::Key(key) => write!(f, "Key({key})"),
            BindingSelector::Filter(filter) => write!(f, "Filter({filter:?})"),
            BindingSelector::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl fmt::Display for BindingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingSelector::Key(key) => f.write_str(key),
            BindingSelector::Filter(filter) => write!(f, "{filter:?}"),
            BindingSelector::Custom(_) => f.write_str("<custom>"),
        }
    }
}

/// Options attached to an injection point.
#[derive(Clone, Debug, Default)]
pub struct InjectionMetadata {
    /// Name of the declaring helper, e.g. `@inject` or `@inject.tag`.
    pub decorator: &'static str,
    /// Resolve to `None` instead of failing when nothing is bound.
    pub optional: bool,
    /// Decorator-specific options.
    pub extra: Map<String, Json>,
}

/// An injection point declaration before it is attached to a class.
#[derive(Clone, Debug)]
pub struct InjectionSpec {
    pub selector: BindingSelector,
    pub metadata: InjectionMetadata,
}

impl InjectionSpec {
    fn new(decorator: &'static str, selector: BindingSelector) -> Self {
        Self {
            selector,
            metadata: InjectionMetadata {
                decorator,
                ..Default::default()
            },
        }
    }

    pub fn optional(mut self) -> Self {
        self.metadata.optional = true;
        self
    }

    /// Attach a decorator option. `required` also drives `optional`.
    pub fn with_option(mut self, name: impl Into<String>, value: Json) -> Self {
        let name = name.into();
        if name == "required" {
            self.metadata.optional = !value.as_bool().unwrap_or(false);
        }
        self.metadata.extra.insert(name, value);
        self
    }
}

/// Inject the value bound at `key` (deep paths allowed).
pub fn inject(key: impl Into<String>) -> InjectionSpec {
    InjectionSpec::new("@inject", BindingSelector::Key(key.into()))
}

/// Inject the values of all bindings carrying a matching tag.
pub fn inject_tag(filter: impl Into<TagFilter>) -> InjectionSpec {
    InjectionSpec::new(
        "@inject.tag",
        BindingSelector::Filter(BindingFilter::Tag(filter.into())),
    )
}

/// Inject the values of all bindings accepted by `filter`.
pub fn inject_filter(filter: impl Into<BindingFilter>) -> InjectionSpec {
    InjectionSpec::new("@inject", BindingSelector::Filter(filter.into()))
}

/// Inject whatever `resolver` produces.
pub fn inject_with<F>(resolver: F) -> InjectionSpec
where
    F: Fn(&Context, &Injection, &mut ResolutionSession) -> Result<ValueOrPromise<Option<BoundValue>>>
        + Send
        + Sync
        + 'static,
{
    InjectionSpec::new("@inject", BindingSelector::Custom(Arc::new(resolver)))
}

/// Inject the resolving context itself.
pub fn inject_context() -> InjectionSpec {
    InjectionSpec::new(
        "@inject.context",
        BindingSelector::Custom(Arc::new(|ctx: &Context, _: &Injection, _: &mut ResolutionSession| {
            Ok(ValueOrPromise::Ready(Some(BoundValue::new(ctx.clone()))))
        })),
    )
}

/// Inject the configuration of the binding being resolved.
///
/// Looks up `<current binding key>:$config`, optionally descending into
/// `path`. Missing configuration resolves to `None` unless the injection carries
/// `with_option("required", true)`.
pub fn inject_config(path: Option<&str>) -> InjectionSpec {
    let owned_path = path.map(str::to_string);
    let resolver = move |ctx: &Context, injection: &Injection, session: &mut ResolutionSession| {
        let Some(binding) = session.current_binding() else {
            return Err(ContextError::ResolutionError {
                target: injection.target_name(),
                reason: "configuration can only be injected while resolving a binding".into(),
            });
        };
        let required = !injection.metadata.optional;
        let config_key = BindingKey::build_key_for_config(binding.key())?;
        let address = match &owned_path {
            Some(p) => config_key.deep_property(p)?,
            None => config_key,
        };
        let options = ResolutionOptions {
            session: Some(session.fork()),
            optional: !required,
            ..Default::default()
        };
        ctx.get_value_or_promise(address, options)
    };
    let spec =
        InjectionSpec::new("@config", BindingSelector::Custom(Arc::new(resolver))).optional();
    match path {
        Some(p) => spec.with_option("path", json!(p)),
        None => spec,
    }
}

/// A resolved injection point: its `InjectionSpec` plus where it sits on the target.
#[derive(Clone, Debug)]
pub struct Injection {
    /// Name of the class receiving the value.
    pub target: &'static str,
    /// Property name, for property injections.
    pub member: Option<String>,
    /// Constructor parameter position, for parameter injections.
    pub parameter_index: Option<usize>,
    pub selector: BindingSelector,
    pub metadata: InjectionMetadata,
}

impl Injection {
    /// Human readable location: `Class[0]` or `Class.property`.
    pub fn target_name(&self) -> String {
        match (&self.member, self.parameter_index) {
            (Some(member), _) => format!("{}.{member}", self.target),
            (None, Some(index)) => format!("{}[{index}]", self.target),
            (None, None) => self.target.to_string(),
        }
    }

    pub fn to_json(&self) -> Json {
        let mut json = json!({
            "targetName": self.target_name(),
            "bindingSelector": self.selector.to_string(),
            "metadata": {
                "decorator": self.metadata.decorator,
                "optional": self.metadata.optional,
            },
        });
        if !self.metadata.extra.is_empty() {
            json["metadata"]["options"] = Json::Object(self.metadata.extra.clone());
        }
        json
    }
}

type ErasedConstructor = Arc<dyn Fn(InjectedArgs) -> Result<BoundValue> + Send + Sync>;
type ErasedProxy = Arc<dyn Fn(BoundValue, &Context) -> Result<BoundValue> + Send + Sync>;

/// Registered description of an injectable type.
pub struct ClassMetadata {
    name: &'static str,
    params: Vec<Injection>,
    properties: Vec<Injection>,
    constructor: Option<ErasedConstructor>,
    proxy: Option<ErasedProxy>,
    templates: Vec<BindingTemplate>,
}

impl fmt::Debug for ClassMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassMetadata")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("properties", &self.properties)
            .field("has_constructor", &self.constructor.is_some())
            .field("has_proxy", &self.proxy.is_some())
            .finish()
    }
}

impl ClassMetadata {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> &[Injection] {
        &self.params
    }

    pub fn properties(&self) -> &[Injection] {
        &self.properties
    }

    pub fn templates(&self) -> &[BindingTemplate] {
        &self.templates
    }

    pub(crate) fn constructor(&self) -> Result<&ErasedConstructor> {
        self.constructor
            .as_ref()
            .ok_or_else(|| ContextError::NoConstructorFound {
                class: self.name.to_string(),
            })
    }

    pub(crate) fn proxy(&self) -> Option<&ErasedProxy> {
        self.proxy.as_ref()
    }

    /// Injection points as JSON, keyed the way they are declared.
    pub fn injections_json(&self) -> Json {
        let mut out = Map::new();
        if !self.params.is_empty() {
            out.insert(
                "constructorArguments".into(),
                Json::Array(self.params.iter().map(Injection::to_json).collect()),
            );
        }
        if !self.properties.is_empty() {
            let props = self
                .properties
                .iter()
                .map(|i| (i.member.clone().unwrap_or_default(), i.to_json()))
                .collect();
            out.insert("properties".into(), Json::Object(props));
        }
        Json::Object(out)
    }
}

static CLASS_REGISTRY: Lazy<RwLock<HashMap<TypeId, Arc<ClassMetadata>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Builder describing how to construct `T` from injected values.
pub struct ClassDef<T> {
    name: &'static str,
    params: Vec<InjectionSpec>,
    properties: Vec<(String, InjectionSpec)>,
    constructor: Option<ErasedConstructor>,
    proxy: Option<ErasedProxy>,
    templates: Vec<BindingTemplate>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ClassDef<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            params: Vec::new(),
            properties: Vec::new(),
            constructor: None,
            proxy: None,
            templates: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Declare the next constructor parameter.
    pub fn param(mut self, spec: InjectionSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Declare a property injection.
    pub fn property(mut self, name: impl Into<String>, spec: InjectionSpec) -> Self {
        self.properties.push((name.into(), spec));
        self
    }

    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(InjectedArgs) -> Result<T> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(move |args| f(args).map(BoundValue::new)));
        self
    }

    /// Wrap instances when resolved with interception enabled.
    pub fn proxy<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<T>, &Context) -> Result<BoundValue> + Send + Sync + 'static,
    {
        let name = self.name;
        self.proxy = Some(Arc::new(move |value: BoundValue, ctx: &Context| {
            let instance = value.downcast::<T>().ok_or(ContextError::TypeMismatch {
                key: name.to_string(),
                expected: std::any::type_name::<T>(),
                actual: value.type_name(),
            })?;
            f(instance, ctx)
        }));
        self
    }

    /// Binding template applied by [`crate::create_binding_from_class`].
    pub fn template<F>(mut self, f: F) -> Self
    where
        F: Fn(&Binding) + Send + Sync + 'static,
    {
        self.templates.push(Arc::new(f));
        self
    }

    /// Binding template built from a declarative scope/tags spec.
    pub fn spec(mut self, spec: BindingSpec) -> Self {
        self.templates.push(spec.as_binding_template());
        self
    }

    /// Register (or replace) the metadata for `T`.
    pub fn register(self) -> Arc<ClassMetadata> {
        let name = self.name;
        let params = self
            .params
            .into_iter()
            .enumerate()
            .map(|(index, spec)| Injection {
                target: name,
                member: None,
                parameter_index: Some(index),
                selector: spec.selector,
                metadata: spec.metadata,
            })
            .collect();
        let properties = self
            .properties
            .into_iter()
            .map(|(member, spec)| Injection {
                target: name,
                member: Some(member),
                parameter_index: None,
                selector: spec.selector,
                metadata: spec.metadata,
            })
            .collect();
        let meta = Arc::new(ClassMetadata {
            name,
            params,
            properties,
            constructor: self.constructor,
            proxy: self.proxy,
            templates: self.templates,
        });
        CLASS_REGISTRY
            .write()
            .insert(TypeId::of::<T>(), meta.clone());
        tracing::debug!(class = name, "Registered injectable class");
        meta
    }
}

impl<P: Provider> ClassDef<P> {
    /// Bind as a provider: the binding's value is `P::value()`.
    pub fn as_provider(self) -> Self {
        self.template(|binding: &Binding| {
            binding.to_provider::<P>().tag(ContextTags::PROVIDER);
        })
    }
}

/// Metadata registered for `T`, if any.
pub fn class_metadata<T: 'static>() -> Option<Arc<ClassMetadata>> {
    class_metadata_by_id(TypeId::of::<T>())
}

pub(crate) fn class_metadata_by_id(type_id: TypeId) -> Option<Arc<ClassMetadata>> {
    CLASS_REGISTRY.read().get(&type_id).cloned()
}

/// Reference from a binding to an injectable type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ClassRef {
    type_id: TypeId,
    type_name: &'static str,
}

impl ClassRef {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Registered class name, falling back to the Rust type name.
    pub fn name(&self) -> &'static str {
        self.metadata().map_or(self.type_name, |m| m.name)
    }

    pub fn metadata(&self) -> Option<Arc<ClassMetadata>> {
        class_metadata_by_id(self.type_id)
    }

    pub(crate) fn require_metadata(&self) -> Result<Arc<ClassMetadata>> {
        self.metadata().ok_or_else(|| ContextError::NoConstructorFound {
            class: self.type_name.to_string(),
        })
    }
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassRef({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget;

    #[test]
    fn register_builds_positions() {
        let meta = ClassDef::<Widget>::new("Widget")
            .param(inject("a"))
            .param(inject("b").optional())
            .property("c", inject_tag("plugin"))
            .constructor(|_| Ok(Widget))
            .register();

        assert_eq!(meta.params().len(), 2);
        assert_eq!(meta.params()[1].target_name(), "Widget[1]");
        assert!(meta.params()[1].metadata.optional);
        assert_eq!(meta.properties()[0].target_name(), "Widget.c");
        assert_eq!(meta.properties()[0].metadata.decorator, "@inject.tag");

        let found = class_metadata::<Widget>().unwrap();
        assert!(Arc::ptr_eq(&found, &meta));
        assert_eq!(ClassRef::of::<Widget>().name(), "Widget");
    }

    #[test]
    fn config_injection_is_optional_until_required() {
        let spec = inject_config(Some("port"));
        assert!(spec.metadata.optional);
        assert_eq!(spec.metadata.extra["path"], json!("port"));

        let spec = spec.with_option("required", json!(true));
        assert!(!spec.metadata.optional);
        let spec = spec.with_option("required", json!(false));
        assert!(spec.metadata.optional);

        assert!(!inject("x").metadata.optional);
    }

    #[test]
    fn unregistered_class_has_no_constructor() {
        struct Ghost;
        let err = ClassRef::of::<Ghost>().require_metadata().unwrap_err();
        assert!(matches!(err, ContextError::NoConstructorFound { .. }));
    }

    #[test]
    fn injections_json_lists_arguments_and_properties() {
        struct Gadget;
        let meta = ClassDef::<Gadget>::new("Gadget")
            .param(inject("x").with_option("note", json!("first")))
            .property("y", inject("y").optional())
            .register();
        let json = meta.injections_json();
        assert_eq!(json["constructorArguments"][0]["targetName"], "Gadget[0]");
        assert_eq!(
            json["constructorArguments"][0]["metadata"]["options"]["note"],
            "first"
        );
        assert_eq!(json["properties"]["y"]["metadata"]["optional"], true);
    }
}
