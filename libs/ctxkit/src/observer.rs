//! Context events and observers.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::binding::{Binding, BindingOperation};
use crate::binding_filter::BindingFilter;
use crate::context::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextEventType {
    Bind,
    Unbind,
    Changed,
}

impl fmt::Display for ContextEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextEventType::Bind => "bind",
            ContextEventType::Unbind => "unbind",
            ContextEventType::Changed => "changed",
        };
        f.write_str(s)
    }
}

/// A change in some context's registry.
#[derive(Clone, Debug)]
pub struct ContextEvent {
    pub event_type: ContextEventType,
    pub binding: Binding,
    /// Context whose registry changed; an ancestor of the observing context
    /// for inherited events.
    pub context: Context,
    /// Set for `Changed` events.
    pub operation: Option<BindingOperation>,
}

/// Receives events for bindings accepted by its filter.
pub trait ContextObserver: Send + Sync {
    /// `None` observes every binding.
    fn filter(&self) -> Option<&BindingFilter> {
        None
    }

    fn observe(&self, event: &ContextEvent) -> anyhow::Result<()>;
}

impl<F> ContextObserver for F
where
    F: Fn(&ContextEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn observe(&self, event: &ContextEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// A callback restricted to the bindings matching a filter.
pub struct FilteredObserver<F> {
    filter: BindingFilter,
    callback: F,
}

impl<F> FilteredObserver<F>
where
    F: Fn(&ContextEvent) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(filter: impl Into<BindingFilter>, callback: F) -> Self {
        Self {
            filter: filter.into(),
            callback,
        }
    }
}

impl<F> ContextObserver for FilteredObserver<F>
where
    F: Fn(&ContextEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn filter(&self) -> Option<&BindingFilter> {
        Some(&self.filter)
    }

    fn observe(&self, event: &ContextEvent) -> anyhow::Result<()> {
        (self.callback)(event)
    }
}

/// Deliver `event` to `observer`. Failures are logged and dropped so that a
/// bad observer cannot interrupt the registry change that triggered it.
pub(crate) fn notify_observer(observer: &dyn ContextObserver, event: &ContextEvent) {
    if let Some(filter) = observer.filter() {
        if !filter.matches(&event.binding) {
            return;
        }
    }
    match catch_unwind(AssertUnwindSafe(|| observer.observe(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            event = %event.event_type,
            key = event.binding.key(),
            error = %e,
            "Context observer failed"
        ),
        Err(_) => warn!(
            event = %event.event_type,
            key = event.binding.key(),
            "Context observer panicked"
        ),
    }
}
