use crate::error::Result;
use crate::value::ValueOrPromise;

/// A class whose only job is to produce a value.
///
/// The provider itself is instantiated through its registered class
/// definition, so its dependencies are injected like any other class. Its
/// `value()` result (possibly pending) becomes the binding's value.
pub trait Provider: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    fn value(&self) -> Result<ValueOrPromise<Self::Value>>;
}
