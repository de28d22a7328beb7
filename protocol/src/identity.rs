//! Resource identity: `"<namespace>:<local-id>"`.
//!
//! Every user-visible kernel, vector index, and agent is named this way. The
//! namespace is the tenant scope; the local id is a URL-safe token (a v4 UUID
//! by default, but callers may supply their own). A resource id with no `:`
//! belongs to the implicit public namespace (`""`).

use std::fmt;

/// A parsed `"<namespace>:<local-id>"` resource id.
///
/// Splits on the *first* colon, so local ids themselves may not contain one
/// without becoming part of the namespace segment — this project resolves
/// the source's namespace-derivation ambiguity (spec Open Question (a)) by
/// treating the id prefix as the single source of truth; callers never pass
/// a namespace out of band once an id is constructed this way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    namespace: String,
    local_id: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_id: local_id.into(),
        }
    }

    /// Generate a fresh id in `namespace` with a random v4 UUID local id.
    pub fn generate(namespace: impl Into<String>) -> Self {
        Self::new(namespace, uuid::Uuid::new_v4().to_string())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Parse `"<namespace>:<local-id>"`. An id with no `:` is treated as
    /// belonging to the public namespace `""`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((ns, id)) => Self::new(ns, id),
            None => Self::new("", raw),
        }
    }

    pub fn matches_namespace(&self, caller_namespace: &str) -> bool {
        self.namespace == caller_namespace
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.local_id)
    }
}

impl From<&str> for ResourceId {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for ResourceId {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl serde::Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_first_colon_only() {
        let id = ResourceId::parse("tenant:a:b:c");
        assert_eq!(id.namespace(), "tenant");
        assert_eq!(id.local_id(), "a:b:c");
    }

    #[test]
    fn id_with_no_colon_is_public_namespace() {
        let id = ResourceId::parse("standalone");
        assert_eq!(id.namespace(), "");
        assert_eq!(id.local_id(), "standalone");
    }

    #[test]
    fn display_round_trips_through_parse() {
        let id = ResourceId::new("t", "v1");
        assert_eq!(ResourceId::parse(&id.to_string()), id);
    }

    #[test]
    fn matches_namespace_checks_exact_equality() {
        let id = ResourceId::new("A", "idx1");
        assert!(id.matches_namespace("A"));
        assert!(!id.matches_namespace("B"));
    }
}
