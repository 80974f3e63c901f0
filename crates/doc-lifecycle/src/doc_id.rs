//! DocId: Identifier of a single document in the workspace.
//!
//! Ids are opaque strings. New ids are generated as simple (dash-less) UUID v4
//! strings, but any non-empty string without whitespace is accepted so ids
//! created by older clients keep working.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocIdError {
    #[error("Document ID cannot be empty")]
    Empty,
    #[error("Document ID cannot contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Identifier of a document.
///
/// Cheap to clone (shared string), ordered and hashable so it can key pools,
/// caches and sorted indexes.
///
/// # Examples
/// ```
/// use doc_lifecycle::DocId;
///
/// let id: DocId = "page-1".parse().unwrap();
/// assert_eq!(id.as_str(), "page-1");
/// assert!("has space".parse::<DocId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocId(Arc<str>);

impl DocId {
    /// Generate a new random document id.
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().simple().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), DocIdError> {
        if s.is_empty() {
            return Err(DocIdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(DocIdError::Whitespace(s.to_string()));
        }
        Ok(())
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocId {
    type Err = DocIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)?;
        Ok(Self(Arc::from(s)))
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for DocId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Serialize as plain string for logs, events and JSON
impl serde::Serialize for DocId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DocId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
