//! Ditto core types: the engine's view of object metadata and key helpers.

#![forbid(unsafe_code)]

pub mod annotations;

pub use annotations::{
    normalize_annotations, AnnotationKeys, UnknownAnnotations, CHECKED_ANNOTATION, DEFAULT_PREFIX,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String-to-string metadata maps, ordered for stable output.
pub type AnnotationMap = BTreeMap<String, String>;
pub type LabelMap = BTreeMap<String, String>;

/// The slice of object metadata the replication engine reasons about.
///
/// Object ports translate their concrete resource type into this view; the
/// engine never sees payloads or type information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub namespace: String,
    pub name: String,
    /// Opaque optimistic-concurrency token from the cluster. Empty on an
    /// object that has not been created yet.
    pub resource_version: String,
    pub annotations: AnnotationMap,
    pub labels: LabelMap,
}

impl Meta {
    /// Canonical `"{namespace}/{name}"` key, used for all indexing.
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Splits a canonical key into `(namespace, name)`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Some((ns, name)),
        _ => None,
    }
}
