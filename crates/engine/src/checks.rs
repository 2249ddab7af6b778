//! Pure decision functions over (target, source) metadata pairs.

use ditto_core::{object_key, AnnotationKeys, LabelMap, Meta};
use semver::Version;

use crate::targets::{compile_anchored, is_valid_name, is_valid_path};

/// A user-authored annotation could not be interpreted. The affected object
/// is treated as inert until its next update.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CheckError(pub String);

/// Outcome of a pull-permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    /// Replication is refused; an already replicated target gets cleared.
    Denied(String),
}

/// Outcome of the freshness check before copying data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataUpdate {
    Needed,
    /// The target already carries the source's current version.
    UpToDate(String),
    /// Once semantics freeze the target at its current content.
    Frozen(String),
}

/// The boolean forms the cluster ecosystem accepts.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parses a semantic version, padding missing minor/patch components
/// (`1` and `1.0` both mean `1.0.0`).
fn parse_version(value: &str) -> Result<Version, semver::Error> {
    match Version::parse(value) {
        Ok(version) => Ok(version),
        Err(err) => {
            let (core, rest) = match value.find(|c| c == '-' || c == '+') {
                Some(idx) => value.split_at(idx),
                None => (value, ""),
            };
            let padded = match core.split('.').count() {
                1 => format!("{core}.0.0{rest}"),
                2 => format!("{core}.0{rest}"),
                _ => return Err(err),
            };
            Version::parse(&padded).map_err(|_| err)
        }
    }
}

/// Decides whether `target` may pull from `source`.
///
/// Without allow-all mode the source must opt in through
/// `replication-allowed` or `replication-allowed-namespaces`; an explicit
/// `false` wins even in allow-all mode, and a source that itself pulls can
/// never grant further pulls.
pub fn replication_allowed(
    target: &Meta,
    source: &Meta,
    allow_all: bool,
    keys: &AnnotationKeys,
) -> Result<Permission, CheckError> {
    let source_key = source.key();
    let allowed = source.annotations.get(&keys.replication_allowed);
    let allowed_namespaces = source.annotations.get(&keys.replication_allowed_namespaces);
    if !allow_all && allowed.is_none() && allowed_namespaces.is_none() {
        return Ok(Permission::Denied(format!(
            "source {source_key} does not explicitly allow replication"
        )));
    }
    if let Some(value) = allowed {
        match parse_bool(value) {
            None => {
                return Err(CheckError(format!(
                    "source {source_key} has illformed annotation {} ({value})",
                    keys.replication_allowed
                )));
            }
            Some(false) => {
                return Ok(Permission::Denied(format!(
                    "source {source_key} explicitly disallows replication"
                )));
            }
            Some(true) => {}
        }
    }
    if let Some(list) = allowed_namespaces {
        let mut matched = false;
        for ns in list.split(',') {
            if ns.is_empty() {
            } else if is_valid_name(ns) {
                if ns == target.namespace {
                    matched = true;
                }
            } else {
                match compile_anchored(ns) {
                    Ok(regex) => {
                        if regex.is_match(&target.namespace) {
                            matched = true;
                        }
                    }
                    Err(err) => {
                        return Err(CheckError(format!(
                            "source {source_key} has compilation error on annotation {} ({ns}): {err}",
                            keys.replication_allowed_namespaces
                        )));
                    }
                }
            }
        }
        if !matched {
            return Ok(Permission::Denied(format!(
                "source {source_key} does not allow replication to namespace {}",
                target.namespace
            )));
        }
    }
    if let Some(upstream) = resolve_annotation(source, &keys.replicate_from) {
        return Ok(Permission::Denied(format!(
            "source {source_key} is itself replicated from {upstream}"
        )));
    }
    Ok(Permission::Allowed)
}

/// Decides whether the target's data must be refreshed from the source.
pub fn needs_data_update(
    target: &Meta,
    source: &Meta,
    keys: &AnnotationKeys,
) -> Result<DataUpdate, CheckError> {
    let target_key = target.key();
    match target.annotations.get(&keys.replicated_version) {
        // cleared after a source deletion, or never replicated
        None => return Ok(DataUpdate::Needed),
        Some(version) if *version == source.resource_version => {
            return Ok(DataUpdate::UpToDate(format!(
                "target {target_key} is already up-to-date"
            )));
        }
        Some(_) => {}
    }

    let mut once = false;
    for (meta, role) in [(source, "source"), (target, "target")] {
        if let Some(value) = meta.annotations.get(&keys.replicate_once) {
            match parse_bool(value) {
                None => {
                    return Err(CheckError(format!(
                        "{role} {} has illformed annotation {} ({value})",
                        meta.key(),
                        keys.replicate_once
                    )));
                }
                Some(true) => once = true,
                Some(false) => {}
            }
        }
    }

    if once {
        if let Some(value) = source.annotations.get(&keys.replicate_once_version) {
            let source_version = parse_version(value).map_err(|err| {
                CheckError(format!(
                    "source {} has illformed annotation {} ({value}): {err}",
                    source.key(),
                    keys.replicate_once_version
                ))
            })?;
            if source_version == Version::new(0, 0, 0) {
                // zero disables once-versioning; the freeze stands
            } else {
                match target.annotations.get(&keys.replicate_once_version) {
                    None => once = false,
                    Some(value) => {
                        let target_version = parse_version(value).map_err(|err| {
                            CheckError(format!(
                                "target {target_key} has illformed annotation {} ({value}): {err}",
                                keys.replicate_once_version
                            ))
                        })?;
                        if source_version > target_version {
                            once = false;
                        } else {
                            return Ok(DataUpdate::Frozen(format!(
                                "target {target_key} is already replicated once at version {source_version}"
                            )));
                        }
                    }
                }
            }
        }
    }

    if once {
        return Ok(DataUpdate::Frozen(format!(
            "target {target_key} is already replicated once"
        )));
    }
    Ok(DataUpdate::Needed)
}

/// True when a relay target's `replicate-from` / `replicate-once`
/// annotations or managed labels drifted from its source.
pub fn needs_from_annotations_update(
    target: &Meta,
    source: &Meta,
    keys: &AnnotationKeys,
    copy_labels: &LabelMap,
) -> Result<bool, CheckError> {
    let mut update = needs_label_update(target, copy_labels);
    let source_key = source.key();
    match resolve_annotation(source, &keys.replicate_from) {
        None => {
            return Err(CheckError(format!(
                "source {source_key} misses annotation {}",
                keys.replicate_from
            )));
        }
        Some(from) => {
            if !is_valid_path(&from) || from == source_key {
                return Err(CheckError(format!(
                    "source {source_key} has invalid annotation {} ({from})",
                    keys.replicate_from
                )));
            }
            if target.annotations.get(&keys.replicate_from) != Some(&from) {
                update = true;
            }
        }
    }
    let source_once = source.annotations.get(&keys.replicate_once);
    if let Some(value) = source_once {
        if parse_bool(value).is_none() {
            return Err(CheckError(format!(
                "source {source_key} has illformed annotation {} ({value})",
                keys.replicate_once
            )));
        }
    }
    if target.annotations.get(&keys.replicate_once) != source_once {
        update = true;
    }
    Ok(update)
}

/// True when the target's `replication-allowed*` annotations or managed
/// labels drifted from its source.
pub fn needs_allowed_annotations_update(
    target: &Meta,
    source: &Meta,
    keys: &AnnotationKeys,
    copy_labels: &LabelMap,
) -> Result<bool, CheckError> {
    let mut update = needs_label_update(target, copy_labels);
    let source_key = source.key();

    let allowed = source.annotations.get(&keys.replication_allowed);
    if target.annotations.get(&keys.replication_allowed) != allowed {
        update = true;
    }
    let allowed_namespaces = source.annotations.get(&keys.replication_allowed_namespaces);
    if target.annotations.get(&keys.replication_allowed_namespaces) != allowed_namespaces {
        update = true;
    }
    if !update {
        return Ok(false);
    }

    if let Some(value) = allowed {
        if parse_bool(value).is_none() {
            return Err(CheckError(format!(
                "source {source_key} has illformed annotation {} ({value})",
                keys.replication_allowed
            )));
        }
    }
    if let Some(list) = allowed_namespaces {
        for ns in list.split(',') {
            if ns.is_empty() || is_valid_name(ns) {
                continue;
            }
            if let Err(err) = compile_anchored(ns) {
                return Err(CheckError(format!(
                    "source {source_key} has compilation error on annotation {} ({ns}): {err}",
                    keys.replication_allowed_namespaces
                )));
            }
        }
    }
    Ok(true)
}

/// True when any managed label is missing or wrong on the target. Foreign
/// labels are left alone.
pub fn needs_label_update(target: &Meta, copy_labels: &LabelMap) -> bool {
    copy_labels
        .iter()
        .any(|(k, v)| target.labels.get(k) != Some(v))
}

/// Verifies that `target` was installed by `source` (carries the
/// back-reference annotation); the engine refuses to touch anything else.
pub fn replicated_by_check(
    target: &Meta,
    source: &Meta,
    keys: &AnnotationKeys,
) -> Result<(), CheckError> {
    match target.annotations.get(&keys.replicated_by) {
        None => Err(CheckError(format!(
            "target {} was not replicated",
            target.key()
        ))),
        Some(by) if *by != source.key() => Err(CheckError(format!(
            "target {} was not replicated from {}",
            target.key(),
            source.key()
        ))),
        Some(_) => Ok(()),
    }
}

/// Reads an annotation as a fully qualified `"{namespace}/{name}"`, using
/// the object's own namespace when the value is a bare name.
pub fn resolve_annotation(meta: &Meta, name: &str) -> Option<String> {
    let value = meta.annotations.get(name)?;
    if value.contains('/') {
        Some(value.clone())
    } else {
        Some(object_key(&meta.namespace, value))
    }
}

/// True when the annotation on `meta` designates `reference`.
pub fn annotation_refers_to(meta: &Meta, name: &str, reference: &Meta) -> bool {
    match meta.annotations.get(name) {
        None => false,
        Some(value) => match value.split_once('/') {
            Some((ns, n)) => ns == reference.namespace && n == reference.name,
            None => meta.namespace == reference.namespace && *value == reference.name,
        },
    }
}
