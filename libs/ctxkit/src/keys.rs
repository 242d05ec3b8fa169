/// Well-known tag names.
pub struct ContextTags;

impl ContextTags {
    /// Namespace used to derive a key from a class definition.
    pub const NAMESPACE: &'static str = "namespace";
    /// Name used to derive a key from a class definition.
    pub const NAME: &'static str = "name";
    /// Explicit key for a binding created from a class definition.
    pub const KEY: &'static str = "key";
    /// Marks a binding as a provider.
    pub const PROVIDER: &'static str = "provider";
    /// Set on `key:$config` bindings to the key they configure.
    pub const CONFIGURATION_FOR: &'static str = "configurationFor";
}
