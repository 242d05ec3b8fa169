//! Class instantiation with constructor and property injection.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::trace;

use crate::binding_key::BindingKey;
use crate::context::Context;
use crate::error::{ContextError, Result};
use crate::inject::{BindingSelector, ClassRef, Injection};
use crate::resolution_session::{ResolutionOptions, ResolutionSession};
use crate::value::{resolve_list, BoundValue, ValueOrPromise};

/// Resolved constructor arguments and properties handed to a constructor.
#[derive(Debug)]
pub struct InjectedArgs {
    class: &'static str,
    args: Vec<Option<BoundValue>>,
    properties: BTreeMap<String, Option<BoundValue>>,
}

impl InjectedArgs {
    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn raw_arg(&self, index: usize) -> Option<&BoundValue> {
        self.args.get(index).and_then(Option::as_ref)
    }

    pub fn raw_property(&self, name: &str) -> Option<&BoundValue> {
        self.properties.get(name).and_then(Option::as_ref)
    }

    /// Required constructor argument `index` as `T`.
    pub fn arg<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>> {
        let target = format!("{}[{index}]", self.class);
        let value = self.raw_arg(index).ok_or_else(|| missing(&target))?;
        downcast(&target, value)
    }

    pub fn optional_arg<T: Send + Sync + 'static>(&self, index: usize) -> Result<Option<Arc<T>>> {
        let target = format!("{}[{index}]", self.class);
        self.raw_arg(index).map(|v| downcast(&target, v)).transpose()
    }

    /// Required property `name` as `T`.
    pub fn property<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let target = format!("{}.{name}", self.class);
        let value = self.raw_property(name).ok_or_else(|| missing(&target))?;
        downcast(&target, value)
    }

    pub fn optional_property<T: Send + Sync + 'static>(&self, name: &str) -> Result<Option<Arc<T>>> {
        let target = format!("{}.{name}", self.class);
        self.raw_property(name).map(|v| downcast(&target, v)).transpose()
    }

    /// Values injected by a filter selector at `index`, each as `T`.
    pub fn values<T: Send + Sync + 'static>(&self, index: usize) -> Result<Vec<Arc<T>>> {
        let target = format!("{}[{index}]", self.class);
        let list = self.arg::<Vec<BoundValue>>(index)?;
        list.iter().map(|v| downcast(&target, v)).collect()
    }

    /// Deserialize a JSON argument (typically injected configuration).
    pub fn deserialize_arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let json = self.arg::<serde_json::Value>(index)?;
        serde_json::from_value(json.as_ref().clone()).map_err(|e| ContextError::ResolutionError {
            target: format!("{}[{index}]", self.class),
            reason: e.to_string(),
        })
    }
}

fn missing(target: &str) -> ContextError {
    ContextError::ResolutionError {
        target: target.to_string(),
        reason: "no value was injected".into(),
    }
}

fn downcast<T: Send + Sync + 'static>(target: &str, value: &BoundValue) -> Result<Arc<T>> {
    value.downcast::<T>().ok_or_else(|| ContextError::TypeMismatch {
        key: target.to_string(),
        expected: std::any::type_name::<T>(),
        actual: value.type_name(),
    })
}

/// Resolve one injection point on a fresh injection frame.
pub fn resolve_injection(
    ctx: &Context,
    injection: &Injection,
    mut session: ResolutionSession,
) -> Result<ValueOrPromise<Option<BoundValue>>> {
    let optional = injection.metadata.optional;
    let resolved = session.run_with_injection(injection, |session| match &injection.selector {
        BindingSelector::Key(key) => ctx.get_value_or_promise(
            BindingKey::create(key)?,
            ResolutionOptions {
                session: Some(session.fork()),
                optional,
                as_proxy_with_interceptors: false,
            },
        ),
        BindingSelector::Filter(filter) => ctx
            .resolve_all_or_promise(filter, Some(session.fork()))?
            .map(|values| Ok(Some(BoundValue::new(values)))),
        BindingSelector::Custom(resolver) => resolver(ctx, injection, session),
    })?;

    let target = injection.target_name();
    let selector = injection.selector.to_string();
    resolved.map(move |value| match value {
        None if !optional => Err(ContextError::ResolutionError {
            target,
            reason: format!("the value of '{selector}' is undefined"),
        }),
        other => Ok(other),
    })
}

fn resolve_injections(
    ctx: &Context,
    injections: &[Injection],
    session: &ResolutionSession,
) -> Result<ValueOrPromise<Vec<Option<BoundValue>>>> {
    resolve_list(injections, |injection, _| {
        resolve_injection(ctx, injection, session.fork())
    })
}

/// Create an instance of `class`, injecting its declared dependencies.
///
/// Arguments and properties are requested in declaration order. When all of
/// them are ready the constructor runs immediately; otherwise the pending
/// ones are awaited concurrently and the constructor runs afterwards.
pub fn instantiate_class(
    class: &ClassRef,
    ctx: &Context,
    session: ResolutionSession,
) -> Result<ValueOrPromise<BoundValue>> {
    let meta = class.require_metadata()?;
    let constructor = meta.constructor()?.clone();
    trace!(class = meta.name(), path = %session, "Instantiate class");

    let args = resolve_injections(ctx, meta.params(), &session)?;
    let props = resolve_injections(ctx, meta.properties(), &session)?;

    let names: Vec<String> = meta
        .properties()
        .iter()
        .map(|p| p.member.clone().unwrap_or_default())
        .collect();
    let class_name = meta.name();
    let build = move |args: Vec<Option<BoundValue>>, props: Vec<Option<BoundValue>>| {
        trace!(class = class_name, "Invoke constructor");
        constructor(InjectedArgs {
            class: class_name,
            args,
            properties: names.into_iter().zip(props).collect(),
        })
    };

    match (args, props) {
        (ValueOrPromise::Ready(args), ValueOrPromise::Ready(props)) => {
            build(args, props).map(ValueOrPromise::Ready)
        }
        (args, props) => Ok(ValueOrPromise::promise(async move {
            let (args, props) = futures::try_join!(args.into_future(), props.into_future())?;
            build(args, props)
        })),
    }
}
