//! Cache identity tuple and canonical query parameters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Query parameters in canonical (key-sorted) form.
///
/// Two parameter sets that differ only in insertion order compare equal and
/// serialize to the same canonical text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(BTreeMap<String, String>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Deterministic JSON text used as the `query_params` column.
    pub fn canonical(&self) -> String {
        // BTreeMap<String, String> serialization cannot fail.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Composite key identifying one logical cache entry and one upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheIdentity {
    pub object: String,
    pub account_code: String,
    pub event_code: Option<String>,
    pub identifier_code: Option<String>,
    pub query_params: QueryParams,
}

impl CacheIdentity {
    pub fn new(
        object: impl Into<String>,
        account_code: impl Into<String>,
        event_code: Option<String>,
        identifier_code: Option<String>,
        query_params: QueryParams,
    ) -> Result<Self, DomainError> {
        let object = object.into();
        let account_code = account_code.into();

        if object.trim().is_empty() {
            return Err(DomainError::validation("object", "must not be empty"));
        }
        if account_code.trim().is_empty() {
            return Err(DomainError::validation("account_code", "must not be empty"));
        }

        Ok(Self {
            object,
            account_code,
            event_code: non_blank(event_code),
            identifier_code: non_blank(identifier_code),
            query_params,
        })
    }

    /// Upstream path below the API prefix, whitespace stripped.
    pub fn upstream_path(&self) -> String {
        let mut path = format!("{}/{}", self.object, self.account_code);
        if let Some(event) = self.event_code.as_deref() {
            path.push('/');
            path.push_str(event);
        }
        if let Some(identifier) = self.identifier_code.as_deref() {
            path.push('/');
            path.push_str(identifier);
        }
        strip_whitespace(&path)
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} {}",
            self.object,
            self.account_code,
            self.event_code.as_deref().unwrap_or("NULL"),
            self.identifier_code.as_deref().unwrap_or("NULL"),
            self.query_params.canonical()
        )
    }
}

pub fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_text_ignores_insertion_order() {
        let a = QueryParams::new()
            .with("orderBy", "startDate_asc")
            .with("includeList", "profile_questions");
        let b = QueryParams::new()
            .with("includeList", "profile_questions")
            .with("orderBy", "startDate_asc");

        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(
            a.canonical(),
            r#"{"includeList":"profile_questions","orderBy":"startDate_asc"}"#
        );
    }

    #[test]
    fn empty_params_are_an_empty_object() {
        assert_eq!(QueryParams::new().canonical(), "{}");
        assert!(QueryParams::new().is_empty());
    }

    #[test]
    fn blank_optional_segments_collapse_to_none() {
        let identity = CacheIdentity::new(
            "Registration",
            "ACME",
            Some("EV1".to_string()),
            Some("  ".to_string()),
            QueryParams::new(),
        )
        .expect("valid identity");

        assert_eq!(identity.identifier_code, None);
        assert_eq!(identity.upstream_path(), "Registration/ACME/EV1");
    }

    #[test]
    fn upstream_path_strips_whitespace() {
        let identity = CacheIdentity::new(
            "Registration ",
            "AC ME",
            Some("EV1".to_string()),
            Some("R100\n".to_string()),
            QueryParams::new(),
        )
        .expect("valid identity");

        assert_eq!(identity.upstream_path(), "Registration/ACME/EV1/R100");
    }

    #[test]
    fn rejects_missing_object() {
        let err = CacheIdentity::new("", "ACME", None, None, QueryParams::new()).unwrap_err();
        assert!(matches!(err, DomainError::Validation { field: "object", .. }));
    }
}
