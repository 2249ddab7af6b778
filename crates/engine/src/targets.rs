//! Resolution of the `replicate-to` / `replicate-to-namespaces` annotations
//! into concrete targets and namespace patterns.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use ditto_core::{object_key, AnnotationKeys, Meta};

use crate::checks::CheckError;

/// Shape of a valid object or namespace name.
static VALID_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-z.-]+$").unwrap());
/// Shape of a valid `namespace/name` path.
static VALID_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[0-9a-z.-]+/[0-9a-z.-]+$").unwrap());

pub(crate) fn is_valid_name(value: &str) -> bool {
    VALID_NAME.is_match(value)
}

pub(crate) fn is_valid_path(value: &str) -> bool {
    VALID_PATH.is_match(value)
}

/// User-supplied namespace patterns must match the whole name.
pub(crate) fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// A target expressed as a namespace regular expression plus a fixed name.
#[derive(Debug, Clone)]
pub struct TargetPattern {
    namespace: Regex,
    name: String,
}

impl TargetPattern {
    /// True when the pattern designates the given object.
    pub fn matches_meta(&self, meta: &Meta) -> bool {
        meta.name == self.name && self.namespace.is_match(&meta.namespace)
    }

    /// True when the pattern designates the given `"{namespace}/{name}"` key.
    pub fn matches_key(&self, target: &str) -> bool {
        match target.split_once('/') {
            Some((ns, name)) => name == self.name && self.namespace.is_match(ns),
            None => false,
        }
    }

    /// The target key this pattern yields in `namespace`, if it matches.
    pub fn match_namespace(&self, namespace: &str) -> Option<String> {
        self.namespace
            .is_match(namespace)
            .then(|| object_key(namespace, &self.name))
    }

    /// Expands the pattern over candidate namespaces.
    pub fn targets<'a>(&self, namespaces: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        namespaces
            .into_iter()
            .filter(|ns| self.namespace.is_match(ns))
            .map(|ns| object_key(ns, &self.name))
            .collect()
    }
}

/// Computes the declared targets of a source object.
///
/// Returns `None` when neither targeting annotation is present. Literal
/// targets are unique and never include the source itself; patterns may
/// still expand to duplicates or to the source, which expansion sites
/// filter out.
pub fn replication_targets(
    meta: &Meta,
    keys: &AnnotationKeys,
) -> Result<Option<(Vec<String>, Vec<TargetPattern>)>, CheckError> {
    let to = meta.annotations.get(&keys.replicate_to);
    let to_namespaces = meta.annotations.get(&keys.replicate_to_namespaces);
    if to.is_none() && to_namespaces.is_none() {
        return Ok(None);
    }

    let key = meta.key();
    let mut targets = Vec::new();
    let mut patterns = Vec::new();
    let mut compiled: HashMap<String, Regex> = HashMap::new();
    // qualified paths already emitted; the source never targets itself
    let mut seen: BTreeSet<String> = BTreeSet::from([key.clone()]);

    // target names; absent annotation means "same name as the source"
    let mut names: BTreeSet<String> = BTreeSet::new();
    let mut qualified: BTreeSet<String> = BTreeSet::new();
    match to {
        None => {
            names.insert(meta.name.clone());
        }
        Some(list) => {
            for item in list.split(',') {
                if item.is_empty() {
                } else if item.contains('/') {
                    qualified.insert(item.to_string());
                } else if is_valid_name(item) {
                    names.insert(item.to_string());
                } else {
                    return Err(CheckError(format!(
                        "source {key} has invalid name on annotation {} ({item})",
                        keys.replicate_to
                    )));
                }
            }
        }
    }
    // target namespaces; absent annotation means "same namespace"
    let mut namespaces: BTreeSet<String> = BTreeSet::new();
    match to_namespaces {
        None => {
            namespaces.insert(meta.namespace.clone());
        }
        Some(list) => {
            for ns in list.split(',') {
                if ns.contains('/') {
                    return Err(CheckError(format!(
                        "source {key} has invalid namespace pattern on annotation {} ({ns})",
                        keys.replicate_to_namespaces
                    )));
                } else if !ns.is_empty() {
                    namespaces.insert(ns.to_string());
                }
            }
        }
    }
    // cross-product of namespaces and names
    for ns in &namespaces {
        if is_valid_name(ns) {
            for name in &names {
                let full = object_key(ns, name);
                if seen.insert(full.clone()) {
                    targets.push(full);
                }
            }
        } else {
            match compile_anchored(ns) {
                Ok(regex) => {
                    compiled.insert(ns.clone(), regex.clone());
                    for name in &names {
                        if seen.insert(format!("{ns}/{name}")) {
                            patterns.push(TargetPattern {
                                namespace: regex.clone(),
                                name: name.clone(),
                            });
                        }
                    }
                }
                Err(err) => {
                    return Err(CheckError(format!(
                        "source {key} has compilation error on annotation {} ({ns}): {err}",
                        keys.replicate_to_namespaces
                    )));
                }
            }
        }
    }
    // qualified paths; the namespace part may itself be a pattern
    for q in &qualified {
        if seen.contains(q) {
            continue;
        }
        let Some((ns, name)) = q.split_once('/') else {
            continue;
        };
        if name.contains('/') {
            return Err(CheckError(format!(
                "source {key} has invalid path on annotation {} ({q})",
                keys.replicate_to
            )));
        }
        if !is_valid_name(name) {
            return Err(CheckError(format!(
                "source {key} has invalid name on annotation {} ({name})",
                keys.replicate_to
            )));
        }
        if is_valid_name(ns) {
            targets.push(q.clone());
        } else if let Some(regex) = compiled.get(ns) {
            patterns.push(TargetPattern {
                namespace: regex.clone(),
                name: name.to_string(),
            });
        } else {
            match compile_anchored(ns) {
                Ok(regex) => {
                    compiled.insert(ns.to_string(), regex.clone());
                    patterns.push(TargetPattern {
                        namespace: regex,
                        name: name.to_string(),
                    });
                }
                Err(err) => {
                    return Err(CheckError(format!(
                        "source {key} has compilation error on annotation {} ({ns}): {err}",
                        keys.replicate_to
                    )));
                }
            }
        }
    }

    Ok(Some((targets, patterns)))
}
