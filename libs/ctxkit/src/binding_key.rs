//! Binding keys (addresses).
//!
//! A key is a plain string such as `servers.rest.port`. An *address* may
//! additionally carry a deep property path after the separator:
//! `servers.rest.options#port` resolves `servers.rest.options` first and
//! then descends into the `port` property of its value.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ContextError, Result};

/// Separator between the binding key and the property path.
pub const PROPERTY_SEPARATOR: char = '#';

/// Suffix namespace holding configuration for another binding.
pub const CONFIG_NAMESPACE: &str = "$config";

/// Immutable binding address: `key` or `key#deep.path`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    key: Arc<str>,
    path: Option<Arc<str>>,
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '$')
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '$')
}

impl BindingKey {
    /// Validate a bare key (no property path allowed).
    pub fn validate(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(ContextError::invalid_key(key, "binding key must be provided"));
        }
        if key.contains(PROPERTY_SEPARATOR) {
            return Err(ContextError::invalid_key(
                key,
                format!("binding key cannot contain '{PROPERTY_SEPARATOR}'"),
            ));
        }
        if let Some(bad) = key.chars().find(|c| !is_key_char(*c)) {
            return Err(ContextError::invalid_key(
                key,
                format!("unsupported character '{bad}'"),
            ));
        }
        Ok(())
    }

    /// Parse `key` or `key#path` into an address.
    pub fn create(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        if address.matches(PROPERTY_SEPARATOR).count() > 1 {
            return Err(ContextError::invalid_key(
                address,
                format!("the separator '{PROPERTY_SEPARATOR}' may appear only once"),
            ));
        }
        match address.split_once(PROPERTY_SEPARATOR) {
            Some((key, path)) => Self::with_path(key, path),
            None => {
                Self::validate(address)?;
                Ok(Self {
                    key: Arc::from(address),
                    path: None,
                })
            }
        }
    }

    /// Build an address from a key and an explicit property path.
    pub fn with_path(key: &str, path: &str) -> Result<Self> {
        Self::validate(key)?;
        if path.is_empty() {
            return Err(ContextError::invalid_key(key, "property path must not be empty"));
        }
        if path.split('.').any(str::is_empty) {
            return Err(ContextError::invalid_key(
                &format!("{key}{PROPERTY_SEPARATOR}{path}"),
                "property path contains an empty segment",
            ));
        }
        if let Some(bad) = path.chars().find(|c| !is_path_char(*c)) {
            return Err(ContextError::invalid_key(
                &format!("{key}{PROPERTY_SEPARATOR}{path}"),
                format!("unsupported character '{bad}' in property path"),
            ));
        }
        Ok(Self {
            key: Arc::from(key),
            path: Some(Arc::from(path)),
        })
    }

    /// Key under which configuration for `key` is bound (`key:$config`).
    pub fn build_key_for_config(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Self::create(CONFIG_NAMESPACE);
        }
        let base = Self::create(key)?;
        Self::create(format!("{}:{CONFIG_NAMESPACE}", base.key()))
    }

    /// The binding key part (without property path).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The deep property path, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Address of the bare key, dropping any property path.
    pub fn without_path(&self) -> Self {
        Self {
            key: self.key.clone(),
            path: None,
        }
    }

    /// Address pointing at `path` under the same key.
    pub fn deep_property(&self, path: &str) -> Result<Self> {
        Self::with_path(&self.key, path)
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}{PROPERTY_SEPARATOR}{path}", self.key),
            None => f.write_str(&self.key),
        }
    }
}

impl fmt::Debug for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindingKey({self})")
    }
}

impl FromStr for BindingKey {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        Self::create(s)
    }
}

/// Anything accepted where a binding address is expected.
pub trait IntoBindingKey {
    fn into_binding_key(self) -> Result<BindingKey>;
}

impl IntoBindingKey for BindingKey {
    fn into_binding_key(self) -> Result<BindingKey> {
        Ok(self)
    }
}

impl IntoBindingKey for &BindingKey {
    fn into_binding_key(self) -> Result<BindingKey> {
        Ok(self.clone())
    }
}

impl IntoBindingKey for &str {
    fn into_binding_key(self) -> Result<BindingKey> {
        BindingKey::create(self)
    }
}

impl IntoBindingKey for String {
    fn into_binding_key(self) -> Result<BindingKey> {
        BindingKey::create(self)
    }
}

impl IntoBindingKey for &String {
    fn into_binding_key(self) -> Result<BindingKey> {
        BindingKey::create(self)
    }
}
