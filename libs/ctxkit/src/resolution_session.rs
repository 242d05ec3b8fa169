//! Per-call-chain resolution state.
//!
//! A session is a stack of the bindings and injection points currently being
//! resolved. It exists to detect circular dependencies and to describe the
//! chain in error messages. Sessions are plain values: branches that resolve
//! independently (several constructor arguments, a factory continuing after
//! a suspension) work on a [`fork`](ResolutionSession::fork) so their pushes
//! and pops never interfere.

use std::fmt;

use tracing::trace;

use serde_json::Value as Json;

use crate::binding::Binding;
use crate::binding_key::IntoBindingKey;
use crate::context::Context;
use crate::error::{ContextError, Result};
use crate::inject::Injection;
use crate::value::{BoundValue, ValueOrPromise};

/// One frame of the resolution stack.
#[derive(Clone, Debug)]
pub enum ResolutionElement {
    Binding(Binding),
    Injection(Injection),
}

impl ResolutionElement {
    fn describe(&self) -> String {
        match self {
            ResolutionElement::Binding(b) => b.key().to_string(),
            ResolutionElement::Injection(i) => format!("@{}", i.target_name()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResolutionSession {
    stack: Vec<ResolutionElement>,
}

impl ResolutionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this session sharing its history.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Push `binding`, run `action`, then pop whatever the outcome.
    pub fn run_with_binding<R>(
        &mut self,
        binding: &Binding,
        action: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.push_binding(binding)?;
        let result = action(self);
        self.pop_binding()?;
        result
    }

    /// Push `injection`, run `action`, then pop whatever the outcome.
    pub fn run_with_injection<R>(
        &mut self,
        injection: &Injection,
        action: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.push_injection(injection.clone());
        let result = action(self);
        self.pop_injection()?;
        result
    }

    /// Enter a binding; fails if the same binding is already on the stack.
    pub fn push_binding(&mut self, binding: &Binding) -> Result<()> {
        trace!(key = binding.key(), "Enter binding");
        let seen = self
            .stack
            .iter()
            .any(|e| matches!(e, ResolutionElement::Binding(b) if b.ptr_eq(binding)));
        if seen {
            let path = format!("{} --> {}", self.resolution_path(), binding.key());
            tracing::debug!(%path, "Circular dependency detected");
            return Err(ContextError::CircularDependency { path });
        }
        self.stack.push(ResolutionElement::Binding(binding.clone()));
        trace!(path = %self.resolution_path(), "Resolution path");
        Ok(())
    }

    pub fn pop_binding(&mut self) -> Result<Binding> {
        match self.stack.pop() {
            Some(ResolutionElement::Binding(b)) => {
                trace!(key = b.key(), "Exit binding");
                Ok(b)
            }
            Some(other) => {
                self.stack.push(other);
                Err(ContextError::InvalidSessionState(
                    "the top element must be a binding",
                ))
            }
            None => Err(ContextError::InvalidSessionState(
                "the top element must be a binding",
            )),
        }
    }

    pub fn push_injection(&mut self, injection: Injection) {
        trace!(target_name = %injection.target_name(), "Enter injection");
        self.stack.push(ResolutionElement::Injection(injection));
    }

    pub fn pop_injection(&mut self) -> Result<Injection> {
        match self.stack.pop() {
            Some(ResolutionElement::Injection(i)) => {
                trace!(target_name = %i.target_name(), "Exit injection");
                Ok(i)
            }
            Some(other) => {
                self.stack.push(other);
                Err(ContextError::InvalidSessionState(
                    "the top element must be an injection",
                ))
            }
            None => Err(ContextError::InvalidSessionState(
                "the top element must be an injection",
            )),
        }
    }

    /// Innermost binding being resolved.
    pub fn current_binding(&self) -> Option<&Binding> {
        self.stack.iter().rev().find_map(|e| match e {
            ResolutionElement::Binding(b) => Some(b),
            ResolutionElement::Injection(_) => None,
        })
    }

    /// Innermost injection being resolved.
    pub fn current_injection(&self) -> Option<&Injection> {
        self.stack.iter().rev().find_map(|e| match e {
            ResolutionElement::Injection(i) => Some(i),
            ResolutionElement::Binding(_) => None,
        })
    }

    pub fn binding_stack(&self) -> Vec<&Binding> {
        self.stack
            .iter()
            .filter_map(|e| match e {
                ResolutionElement::Binding(b) => Some(b),
                ResolutionElement::Injection(_) => None,
            })
            .collect()
    }

    pub fn injection_stack(&self) -> Vec<&Injection> {
        self.stack
            .iter()
            .filter_map(|e| match e {
                ResolutionElement::Injection(i) => Some(i),
                ResolutionElement::Binding(_) => None,
            })
            .collect()
    }

    /// `a --> b --> c`
    pub fn binding_path(&self) -> String {
        self.binding_stack()
            .iter()
            .map(|b| b.key())
            .collect::<Vec<_>>()
            .join(" --> ")
    }

    /// `A[0] --> B.prop`
    pub fn injection_path(&self) -> String {
        self.injection_stack()
            .iter()
            .map(|i| i.target_name())
            .collect::<Vec<_>>()
            .join(" --> ")
    }

    /// Bindings and injections interleaved: `a --> @A[0] --> b`.
    pub fn resolution_path(&self) -> String {
        self.stack
            .iter()
            .map(ResolutionElement::describe)
            .collect::<Vec<_>>()
            .join(" --> ")
    }

    /// JSON description of the innermost injection, for diagnostics.
    pub fn describe_injection(&self) -> Option<Json> {
        self.current_injection().map(Injection::to_json)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

impl fmt::Display for ResolutionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolution_path())
    }
}

/// Options for a single resolution request.
#[derive(Clone, Debug, Default)]
pub struct ResolutionOptions {
    /// Session inherited from the caller, if this is a nested resolution.
    pub session: Option<ResolutionSession>,
    /// Resolve to `None` instead of failing when nothing is bound.
    pub optional: bool,
    /// Wrap class instances with their registered interception proxy.
    pub as_proxy_with_interceptors: bool,
}

impl ResolutionOptions {
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    pub fn with_session(session: ResolutionSession) -> Self {
        Self {
            session: Some(session),
            ..Default::default()
        }
    }

    pub fn proxied(mut self) -> Self {
        self.as_proxy_with_interceptors = true;
        self
    }
}

impl From<ResolutionSession> for ResolutionOptions {
    fn from(session: ResolutionSession) -> Self {
        Self::with_session(session)
    }
}

/// What a value factory sees while its binding is being resolved.
#[derive(Clone, Debug)]
pub struct ResolutionContext {
    /// Context the value is requested from.
    pub context: Context,
    /// Binding being resolved; it is on top of `options.session`.
    pub binding: Binding,
    pub options: ResolutionOptions,
}

impl ResolutionContext {
    /// Fork of the current session, for nested resolutions.
    pub fn session(&self) -> ResolutionSession {
        self.options.session.clone().unwrap_or_default()
    }

    /// Resolve another binding as a dependency of the current one, so that
    /// cycles through factories are detected too.
    pub fn get_value_or_promise(
        &self,
        key: impl IntoBindingKey,
        optional: bool,
    ) -> Result<ValueOrPromise<Option<BoundValue>>> {
        self.context.get_value_or_promise(
            key,
            ResolutionOptions {
                session: Some(self.session()),
                optional,
                as_proxy_with_interceptors: false,
            },
        )
    }
}
