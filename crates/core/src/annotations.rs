//! The annotation vocabulary that drives replication.
//!
//! Every behavior of the controller is declared through annotations under a
//! single configurable prefix. This module owns the key names, the
//! deprecation aliases, and the validation pass run on every observed
//! object.

use std::collections::{HashMap, HashSet};

use crate::Meta;

/// Validation memo stored on cached metadata. Deliberately not a legal
/// annotation name, so it can never reach the cluster.
pub const CHECKED_ANNOTATION: &str = "#checked#";

const CHECKED_VALID: &str = "valid";
const CHECKED_UPDATE: &str = "update";

/// Default annotation prefix, compatible with the widely deployed
/// replicator vocabulary.
pub const DEFAULT_PREFIX: &str = "kubernetes-replicator/";

const REPLICATE_FROM: &str = "replicate-from";
const REPLICATE_TO: &str = "replicate-to";
const REPLICATE_TO_NAMESPACES: &str = "replicate-to-namespaces";
const REPLICATE_ONCE: &str = "replicate-once";
const REPLICATE_ONCE_VERSION: &str = "replicate-once-version";
const REPLICATION_ALLOWED: &str = "replication-allowed";
const REPLICATION_ALLOWED_NAMESPACES: &str = "replication-allowed-namespaces";
const REPLICATED_AT: &str = "replicated-at";
const REPLICATED_BY: &str = "replicated-by";
const REPLICATED_VERSION: &str = "replicated-version";

/// The effective annotation names under a given prefix.
#[derive(Debug, Clone)]
pub struct AnnotationKeys {
    prefix: String,
    /// Target pulls its data from this source (`name` or `namespace/name`).
    pub replicate_from: String,
    /// Source pushes to these targets (comma-separated list).
    pub replicate_to: String,
    /// Source pushes into these namespaces (names or patterns).
    pub replicate_to_namespaces: String,
    /// Boolean; once replicated, do not overwrite.
    pub replicate_once: String,
    /// Semantic version; overrides `replicate-once` when it rises.
    pub replicate_once_version: String,
    /// Boolean on a source; gates pull-based replication.
    pub replication_allowed: String,
    /// Namespaces (names or patterns) allowed to pull from a source.
    pub replication_allowed_namespaces: String,
    /// Engine-written RFC-3339 timestamp on a target.
    pub replicated_at: String,
    /// Engine-written back-reference on a push-created target.
    pub replicated_by: String,
    /// Engine-written; the source resource version last copied.
    pub replicated_version: String,
    known: HashSet<String>,
    deprecated: HashMap<String, String>,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl AnnotationKeys {
    pub fn with_prefix(prefix: &str) -> Self {
        let full = |name: &str| format!("{prefix}{name}");
        let logical = [
            REPLICATE_FROM,
            REPLICATE_TO,
            REPLICATE_TO_NAMESPACES,
            REPLICATE_ONCE,
            REPLICATE_ONCE_VERSION,
            REPLICATION_ALLOWED,
            REPLICATION_ALLOWED_NAMESPACES,
            REPLICATED_AT,
            REPLICATED_BY,
            REPLICATED_VERSION,
        ];
        let mut keys = Self {
            prefix: prefix.to_string(),
            replicate_from: full(REPLICATE_FROM),
            replicate_to: full(REPLICATE_TO),
            replicate_to_namespaces: full(REPLICATE_TO_NAMESPACES),
            replicate_once: full(REPLICATE_ONCE),
            replicate_once_version: full(REPLICATE_ONCE_VERSION),
            replication_allowed: full(REPLICATION_ALLOWED),
            replication_allowed_namespaces: full(REPLICATION_ALLOWED_NAMESPACES),
            replicated_at: full(REPLICATED_AT),
            replicated_by: full(REPLICATED_BY),
            replicated_version: full(REPLICATED_VERSION),
            known: logical.iter().map(|name| full(name)).collect(),
            deprecated: HashMap::new(),
        };
        // renamed in an earlier release, still honored on existing objects
        keys.register_alias("replicated-from-version", REPLICATED_VERSION);
        keys
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a deprecated logical name, transparently rewritten to
    /// `target` on any object observed carrying it.
    pub fn register_alias(&mut self, old: &str, target: &str) {
        let old = format!("{}{}", self.prefix, old);
        let new = format!("{}{}", self.prefix, target);
        self.deprecated.insert(old, new);
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(name)
    }
}

/// An object carries annotations under the prefix that the vocabulary does
/// not define; the engine treats such an object as inert.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown annotations")]
pub struct UnknownAnnotations;

/// Validates the annotations of a cached object and rewrites deprecated
/// names to their replacements. Returns `Ok(true)` when a rewrite happened
/// and the object should be written back to the cluster.
///
/// The outcome is memoized on the metadata under [`CHECKED_ANNOTATION`];
/// callers strip that sentinel before any write.
pub fn normalize_annotations(
    meta: &mut Meta,
    keys: &AnnotationKeys,
) -> Result<bool, UnknownAnnotations> {
    match meta.annotations.get(CHECKED_ANNOTATION).map(String::as_str) {
        Some(CHECKED_VALID) => return Ok(false),
        Some(CHECKED_UPDATE) => return Ok(true),
        Some(_) => return Err(UnknownAnnotations),
        None => {}
    }
    // an empty or slash-less prefix cannot distinguish foreign annotations
    let prefixed = keys.prefix().contains('/');
    let mut valid = true;
    let mut rewrite = Vec::new();
    for name in meta.annotations.keys() {
        if let Some(replacement) = keys.deprecated.get(name) {
            tracing::warn!(
                key = %meta.key(),
                annotation = %name,
                replacement = %replacement,
                "deprecated annotation"
            );
            rewrite.push(name.clone());
        } else if !prefixed || keys.is_known(name) {
            // recognized, or not ours to police
        } else if name.starts_with(keys.prefix()) {
            tracing::warn!(key = %meta.key(), annotation = %name, "unknown annotation");
            valid = false;
        }
    }
    if !valid {
        meta.annotations
            .insert(CHECKED_ANNOTATION.into(), "error".into());
        return Err(UnknownAnnotations);
    }
    if rewrite.is_empty() {
        meta.annotations
            .insert(CHECKED_ANNOTATION.into(), CHECKED_VALID.into());
        return Ok(false);
    }
    meta.annotations
        .insert(CHECKED_ANNOTATION.into(), CHECKED_UPDATE.into());
    for old in rewrite {
        if let Some(value) = meta.annotations.remove(&old) {
            if let Some(new) = keys.deprecated.get(&old) {
                meta.annotations.entry(new.clone()).or_insert(value);
            }
        }
    }
    Ok(true)
}
