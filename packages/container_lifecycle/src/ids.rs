//! Container identifiers and prefix resolution.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::ops::Bound;

use crate::error::LifecycleError;

/// Length of the short form shown to users.
pub const SHORT_ID_LEN: usize = 12;

/// Shortest prefix `IdResolver::resolve` will consider.
pub const DEFAULT_MIN_PREFIX_LEN: usize = 4;

/// Full, immutable container identifier (64 lowercase hex characters when generated).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn generate() -> Self {
        let high = uuid::Uuid::new_v4().simple();
        let low = uuid::Uuid::new_v4().simple();
        Self(format!("{high}{low}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ContainerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Shorten an identifier to its display form.
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Maps full identifiers and unambiguous prefixes to registered identifiers.
#[derive(Debug)]
pub struct IdResolver {
    ids: BTreeSet<ContainerId>,
    min_prefix_len: usize,
}

impl Default for IdResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PREFIX_LEN)
    }
}

impl IdResolver {
    pub fn new(min_prefix_len: usize) -> Self {
        Self {
            ids: BTreeSet::new(),
            min_prefix_len,
        }
    }

    pub fn min_prefix_len(&self) -> usize {
        self.min_prefix_len
    }

    /// Returns false if the identifier was already registered.
    pub fn register(&mut self, id: ContainerId) -> bool {
        self.ids.insert(id)
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resolve a full identifier or a unique prefix.
    ///
    /// An exact match always wins, even when it is also a prefix of another id.
    /// Inputs shorter than the configured minimum are rejected rather than padded.
    pub fn resolve(&self, candidate: &str) -> Result<ContainerId, LifecycleError> {
        if let Some(id) = self.ids.get(candidate) {
            return Ok(id.clone());
        }
        if candidate.is_empty() || candidate.len() < self.min_prefix_len {
            return Err(LifecycleError::NotFound(candidate.to_string()));
        }

        // Ids sharing the prefix are contiguous in sorted order.
        let mut matches = self
            .ids
            .range::<str, _>((Bound::Included(candidate), Bound::Unbounded))
            .take_while(|id| id.as_str().starts_with(candidate));

        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (None, _) => Err(LifecycleError::NotFound(candidate.to_string())),
            (Some(_), Some(_)) => Err(LifecycleError::AmbiguousId {
                prefix: candidate.to_string(),
                matches: 2 + matches.count(),
            }),
        }
    }
}
