//! Type-erased values and the value-or-promise duality.
//!
//! Synchronous factories produce [`ValueOrPromise::Ready`], which callers can
//! unwrap without touching an executor. Anything that suspends produces
//! [`ValueOrPromise::Pending`]; once a single dependency is pending the whole
//! enclosing computation becomes pending.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use crate::error::{ContextError, Result};

/// A resolved value stored in or produced by a binding.
///
/// Cloning is cheap and keeps identity: two clones are [`ptr_eq`](Self::ptr_eq).
#[derive(Clone)]
pub struct BoundValue {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl BoundValue {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an existing `Arc` without re-allocating, preserving its identity.
    pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            inner: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Type name of the wrapped value, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Send + Sync + 'static>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Identity comparison (same underlying allocation).
    pub fn ptr_eq(&self, other: &BoundValue) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

impl fmt::Debug for BoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(json) = self.downcast_ref::<serde_json::Value>() {
            return write!(f, "BoundValue({json})");
        }
        write!(f, "BoundValue(<{}>)", self.type_name)
    }
}

/// Future half of [`ValueOrPromise`].
pub type Pending<T> = BoxFuture<'static, Result<T>>;

/// Either an immediately available value or one that must be awaited.
pub enum ValueOrPromise<T> {
    Ready(T),
    Pending(Pending<T>),
}

impl<T> From<T> for ValueOrPromise<T> {
    fn from(value: T) -> Self {
        ValueOrPromise::Ready(value)
    }
}

impl<T> fmt::Debug for ValueOrPromise<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueOrPromise::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            ValueOrPromise::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

impl<T: Send + 'static> ValueOrPromise<T> {
    /// Wrap a future as a pending value.
    pub fn promise<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        ValueOrPromise::Pending(fut.boxed())
    }

    /// A pending value that fails when awaited.
    pub fn rejected(err: ContextError) -> Self {
        ValueOrPromise::Pending(future::ready(Err(err)).boxed())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ValueOrPromise::Pending(_))
    }

    /// The ready value, if no suspension is needed.
    pub fn ready(self) -> Option<T> {
        match self {
            ValueOrPromise::Ready(v) => Some(v),
            ValueOrPromise::Pending(_) => None,
        }
    }

    /// Convert into a future; a ready value resolves on first poll.
    pub fn into_future(self) -> Pending<T> {
        match self {
            ValueOrPromise::Ready(v) => future::ready(Ok(v)).boxed(),
            ValueOrPromise::Pending(fut) => fut,
        }
    }

    /// Await the value regardless of which variant it is.
    pub async fn resolve(self) -> Result<T> {
        self.into_future().await
    }

    /// Transform the eventual value, staying synchronous when possible.
    pub fn map<U, F>(self, f: F) -> Result<ValueOrPromise<U>>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        match self {
            ValueOrPromise::Ready(v) => f(v).map(ValueOrPromise::Ready),
            ValueOrPromise::Pending(fut) => Ok(ValueOrPromise::promise(async move { f(fut.await?) })),
        }
    }

    /// Chain another value-or-promise computation.
    pub fn and_then<U, F>(self, f: F) -> Result<ValueOrPromise<U>>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<ValueOrPromise<U>> + Send + 'static,
    {
        match self {
            ValueOrPromise::Ready(v) => f(v),
            ValueOrPromise::Pending(fut) => Ok(ValueOrPromise::promise(async move {
                f(fut.await?)?.resolve().await
            })),
        }
    }
}

/// Resolve a list of items, one value-or-promise each.
///
/// Items are requested in order. If all are ready the result is ready;
/// otherwise pending items are awaited concurrently and the result keeps the
/// original order.
pub fn resolve_list<I, T, F>(items: I, mut resolver: F) -> Result<ValueOrPromise<Vec<T>>>
where
    I: IntoIterator,
    T: Send + 'static,
    F: FnMut(I::Item, usize) -> Result<ValueOrPromise<T>>,
{
    let mut slots = Vec::new();
    let mut any_pending = false;
    for (index, item) in items.into_iter().enumerate() {
        let slot = resolver(item, index)?;
        any_pending |= slot.is_pending();
        slots.push(slot);
    }

    if !any_pending {
        return Ok(ValueOrPromise::Ready(
            slots.into_iter().filter_map(ValueOrPromise::ready).collect(),
        ));
    }

    let futures: Vec<Pending<T>> = slots.into_iter().map(ValueOrPromise::into_future).collect();
    Ok(ValueOrPromise::promise(future::try_join_all(futures)))
}

/// Descend into a JSON value following a dotted property path.
///
/// Object members are looked up by name and array elements by index. Values
/// that are not JSON have no addressable properties.
pub fn get_deep_property(value: &BoundValue, path: &str) -> Option<BoundValue> {
    let mut current = value.downcast_ref::<serde_json::Value>()?;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(BoundValue::new(current.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bound_value_keeps_identity_across_clones() {
        let a = BoundValue::new(String::from("x"));
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&BoundValue::new(String::from("x"))));
        assert_eq!(a.downcast::<String>().unwrap().as_str(), "x");
        assert!(a.downcast::<u32>().is_none());
        assert!(a.type_name().contains("String"));
    }

    #[test]
    fn map_stays_ready_for_ready_values() {
        let v = ValueOrPromise::Ready(2).map(|x| Ok(x * 21)).unwrap();
        assert_eq!(v.ready(), Some(42));
    }

    #[tokio::test]
    async fn map_over_pending_value() {
        let v = ValueOrPromise::promise(async { Ok(20) })
            .map(|x| Ok(x + 1))
            .unwrap();
        assert!(v.is_pending());
        assert_eq!(v.resolve().await.unwrap(), 21);
    }

    #[tokio::test]
    async fn rejected_fails_on_await() {
        let v: ValueOrPromise<u8> = ValueOrPromise::rejected(ContextError::InvalidSessionState("x"));
        assert!(v.resolve().await.is_err());
    }

    #[test]
    fn resolve_list_all_ready() {
        let out = resolve_list(vec![1usize, 2, 3], |x, i| Ok(ValueOrPromise::Ready(x * 10 + i)))
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(out, vec![10, 21, 32]);
    }

    #[tokio::test]
    async fn resolve_list_with_pending_keeps_order() {
        let out = resolve_list(vec![1u64, 2, 3], |x, _| {
            if x == 2 {
                Ok(ValueOrPromise::promise(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    Ok(x)
                }))
            } else {
                Ok(ValueOrPromise::Ready(x))
            }
        })
        .unwrap();
        assert!(out.is_pending());
        assert_eq!(out.resolve().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn deep_property_walks_objects_and_arrays() {
        let v = BoundValue::new(json!({"a": {"b": 42, "list": ["x", "y"]}}));
        let b = get_deep_property(&v, "a.b").unwrap();
        assert_eq!(b.downcast_ref::<serde_json::Value>(), Some(&json!(42)));
        let y = get_deep_property(&v, "a.list.1").unwrap();
        assert_eq!(y.downcast_ref::<serde_json::Value>(), Some(&json!("y")));
        assert!(get_deep_property(&v, "a.c").is_none());
        assert!(get_deep_property(&BoundValue::new(5u8), "a").is_none());
    }
}
