//! Cache key scoping.
//!
//! A scope is a key prefix (`scope:key`) that lets several logically isolated
//! caches share one physical backend and one local tier.

/// Default separator placed between a scope name and the key.
pub const DEFAULT_SCOPE_SEPARATOR: &str = ":";

/// A key-prefix namespace.
///
/// Scopes nest: a scope created inside another scope carries both prefixes,
/// so `orders` inside `tenant-1` yields keys like `tenant-1:orders:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyScope {
    prefix: String,
}

impl KeyScope {
    /// Create a top-level scope using the default separator.
    pub fn new(name: &str) -> Self {
        Self::with_separator(name, DEFAULT_SCOPE_SEPARATOR)
    }

    /// Create a top-level scope using a custom separator.
    pub fn with_separator(name: &str, separator: &str) -> Self {
        let name = name.trim();
        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{name}{separator}")
        };
        Self { prefix }
    }

    /// Create a scope nested inside this one.
    pub fn nested(&self, name: &str, separator: &str) -> Self {
        let child = Self::with_separator(name, separator);
        Self {
            prefix: format!("{}{}", self.prefix, child.prefix),
        }
    }

    /// The full prefix prepended to every key of this scope.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns `true` for the empty (unscoped) prefix.
    pub fn is_root(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Prepend the scope prefix to a key.
    pub fn apply(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Remove the scope prefix from a key, if the key belongs to this scope.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_strip() {
        let scope = KeyScope::new("users");
        assert_eq!(scope.prefix(), "users:");
        assert_eq!(scope.apply("42"), "users:42");
        assert_eq!(scope.strip("users:42"), Some("42"));
        assert_eq!(scope.strip("orders:42"), None);
    }

    #[test]
    fn test_empty_scope_is_root() {
        let scope = KeyScope::new("  ");
        assert!(scope.is_root());
        assert_eq!(scope.apply("key"), "key");
    }

    #[test]
    fn test_nested_scope() {
        let outer = KeyScope::new("tenant-1");
        let inner = outer.nested("orders", DEFAULT_SCOPE_SEPARATOR);
        assert_eq!(inner.apply("7"), "tenant-1:orders:7");
        assert_eq!(inner.strip("tenant-1:orders:7"), Some("7"));
        assert_eq!(outer.strip("tenant-1:orders:7"), Some("orders:7"));
    }

    #[test]
    fn test_custom_separator() {
        let scope = KeyScope::with_separator("a", "/");
        assert_eq!(scope.apply("b"), "a/b");
    }
}
