//! Bindings derived from registered class definitions.

use serde_json::Value as Json;
use tracing::debug;

use crate::binding::{Binding, BindingScope};
use crate::binding_key::BindingKey;
use crate::error::Result;
use crate::inject::ClassRef;
use crate::keys::ContextTags;

/// How to derive the binding for a class.
///
/// The key is the first available of: `key`, a `key` tag set by the class
/// templates, or `<namespace>.<name>` where each part again falls back to
/// the corresponding tag (the name finally to the registered class name).
#[derive(Clone, Debug, Default)]
pub struct BindingFromClassOptions {
    pub key: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub default_namespace: Option<String>,
    pub default_scope: Option<BindingScope>,
}

pub fn create_binding_from_class<T: Send + Sync + 'static>(
    options: BindingFromClassOptions,
) -> Result<Binding> {
    create_binding_from_class_ref(ClassRef::of::<T>(), options)
}

/// Bind `class` (as a class; templates may turn it into a provider) and
/// apply its registered templates.
pub fn create_binding_from_class_ref(
    class: ClassRef,
    options: BindingFromClassOptions,
) -> Result<Binding> {
    let meta = class.require_metadata()?;
    let draft = Binding::bind("$class")?;
    draft.to_class_ref(class).apply_templates(meta.templates());

    let tags = draft.tag_map();
    let tag = |name: &str| tags.get(name).and_then(Json::as_str).map(str::to_string);
    let key = match options.key.or_else(|| tag(ContextTags::KEY)) {
        Some(key) => key,
        None => {
            let name = options
                .name
                .or_else(|| tag(ContextTags::NAME))
                .unwrap_or_else(|| meta.name().to_string());
            let namespace = options
                .namespace
                .or_else(|| tag(ContextTags::NAMESPACE))
                .or(options.default_namespace);
            match namespace {
                Some(ns) => format!("{ns}.{name}"),
                None => name,
            }
        }
    };

    BindingKey::validate(&key)?;
    let binding = draft.with_key(BindingKey::create(&key)?);
    if let Some(scope) = options.default_scope {
        binding.apply_default_scope(scope);
    }
    debug!(class = meta.name(), key = %key, "Binding created from class");
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingSpec, BindingType};
    use crate::inject::ClassDef;

    struct MyController;
    struct Tagged;

    #[test]
    fn key_from_namespace_and_name() {
        ClassDef::<MyController>::new("MyController")
            .constructor(|_| Ok(MyController))
            .register();
        let b = create_binding_from_class::<MyController>(BindingFromClassOptions {
            namespace: Some("controllers".into()),
            default_scope: Some(BindingScope::Singleton),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(b.key(), "controllers.MyController");
        assert_eq!(b.binding_type(), Some(BindingType::Class));
        assert_eq!(b.scope(), BindingScope::Singleton);
    }

    #[test]
    fn templates_win_over_defaults() {
        ClassDef::<Tagged>::new("Tagged")
            .constructor(|_| Ok(Tagged))
            .template(|b: &Binding| {
                b.tag((ContextTags::NAMESPACE, "services"))
                    .in_scope(BindingScope::Context);
            })
            .spec(BindingSpec::default().tag(("name", "tagged-service")))
            .register();
        let b = create_binding_from_class::<Tagged>(BindingFromClassOptions {
            default_namespace: Some("ignored".into()),
            default_scope: Some(BindingScope::Singleton),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(b.key(), "services.tagged-service");
        assert_eq!(b.scope(), BindingScope::Context);
    }

    #[test]
    fn unregistered_class_fails() {
        struct Nope;
        assert!(create_binding_from_class::<Nope>(Default::default()).is_err());
    }
}
