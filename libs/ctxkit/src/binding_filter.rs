//! Predicates used by `find`, tag lookups, observers and filter injections.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as Json;

use crate::binding::Binding;

/// Translate a glob into an anchored regex where `*` and `?` never cross
/// `.` or `:`.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 16);
    source.push('^');
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => source.push_str("[^.:]*"),
            '?' => source.push_str("[^.:]"),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    source.push('$');
    Regex::new(&source)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Expected value of a tag in a [`TagFilter::Values`] filter.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValueMatcher {
    /// The tag must be present; its value is irrelevant.
    Any,
    Value(Json),
}

impl From<Json> for TagValueMatcher {
    fn from(value: Json) -> Self {
        TagValueMatcher::Value(value)
    }
}

impl From<&str> for TagValueMatcher {
    fn from(value: &str) -> Self {
        TagValueMatcher::Value(Json::String(value.to_string()))
    }
}

impl From<String> for TagValueMatcher {
    fn from(value: String) -> Self {
        TagValueMatcher::Value(Json::String(value))
    }
}

impl From<bool> for TagValueMatcher {
    fn from(value: bool) -> Self {
        TagValueMatcher::Value(Json::Bool(value))
    }
}

/// Selects bindings by their tags.
#[derive(Clone, Debug)]
pub enum TagFilter {
    /// Some tag name equals the string.
    Name(String),
    /// Some tag name matches the regex.
    Pattern(Regex),
    /// Every listed tag is present with a matching value.
    Values(BTreeMap<String, TagValueMatcher>),
}

impl TagFilter {
    /// Exact tag name, or a glob over tag names when it has wildcards.
    pub fn name(name: impl Into<String>) -> Self {
        let name = name.into();
        if is_glob(&name) {
            if let Ok(re) = glob_to_regex(&name) {
                return TagFilter::Pattern(re);
            }
        }
        TagFilter::Name(name)
    }

    pub fn values<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<TagValueMatcher>,
    {
        TagFilter::Values(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn matches(&self, binding: &Binding) -> bool {
        let tags = binding.tag_map();
        match self {
            TagFilter::Name(name) => tags.contains_key(name),
            TagFilter::Pattern(re) => tags.keys().any(|name| re.is_match(name)),
            TagFilter::Values(expected) => expected.iter().all(|(name, matcher)| {
                match (tags.get(name), matcher) {
                    (None, _) => false,
                    (Some(_), TagValueMatcher::Any) => true,
                    (Some(actual), TagValueMatcher::Value(v)) => actual == v,
                }
            }),
        }
    }
}

impl From<&str> for TagFilter {
    fn from(name: &str) -> Self {
        TagFilter::name(name)
    }
}

impl From<String> for TagFilter {
    fn from(name: String) -> Self {
        TagFilter::name(name)
    }
}

impl From<Regex> for TagFilter {
    fn from(re: Regex) -> Self {
        TagFilter::Pattern(re)
    }
}

impl From<BTreeMap<String, TagValueMatcher>> for TagFilter {
    fn from(map: BTreeMap<String, TagValueMatcher>) -> Self {
        TagFilter::Values(map)
    }
}

pub type BindingPredicate = Arc<dyn Fn(&Binding) -> bool + Send + Sync>;

/// Selects bindings.
#[derive(Clone)]
pub enum BindingFilter {
    All,
    /// Key equals the string.
    Key(String),
    KeyRegex(Regex),
    Tag(TagFilter),
    Custom(BindingPredicate),
}

impl BindingFilter {
    /// Exact key, or a glob over keys when it has wildcards.
    pub fn key(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if is_glob(&pattern) {
            if let Ok(re) = glob_to_regex(&pattern) {
                return BindingFilter::KeyRegex(re);
            }
        }
        BindingFilter::Key(pattern)
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Binding) -> bool + Send + Sync + 'static,
    {
        BindingFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, binding: &Binding) -> bool {
        match self {
            BindingFilter::All => true,
            BindingFilter::Key(key) => binding.key() == key,
            BindingFilter::KeyRegex(re) => re.is_match(binding.key()),
            BindingFilter::Tag(filter) => filter.matches(binding),
            BindingFilter::Custom(predicate) => predicate(binding),
        }
    }
}

impl Default for BindingFilter {
    fn default() -> Self {
        BindingFilter::All
    }
}

impl fmt::Debug for BindingFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingFilter::All => f.write_str("All"),
            BindingFilter::Key(k) => write!(f, "Key({k})"),
            BindingFilter::KeyRegex(re) => write!(f, "KeyRegex({})", re.as_str()),
            BindingFilter::Tag(t) => write!(f, "Tag({t:?})"),
            BindingFilter::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

impl From<&str> for BindingFilter {
    fn from(pattern: &str) -> Self {
        BindingFilter::key(pattern)
    }
}

impl From<String> for BindingFilter {
    fn from(pattern: String) -> Self {
        BindingFilter::key(pattern)
    }
}

impl From<Regex> for BindingFilter {
    fn from(re: Regex) -> Self {
        BindingFilter::KeyRegex(re)
    }
}

impl From<TagFilter> for BindingFilter {
    fn from(filter: TagFilter) -> Self {
        BindingFilter::Tag(filter)
    }
}
