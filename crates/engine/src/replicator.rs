//! The reactive replication state machine.
//!
//! The engine is purely event-driven: informer callbacks come in through
//! [`Replicator::object_added`], [`Replicator::object_deleted`] and
//! [`Replicator::namespace_added`], and every handler re-derives the desired
//! state from the object's annotations. Handlers can be re-run any number of
//! times, in any order, and converge to the same fixed point; any mutation
//! the engine performs comes back as another watch event.
//!
//! All state lives in one place and is only ever touched by the single
//! serialized event loop driving these methods, so no locking is required.

use std::collections::{BTreeSet, HashMap, HashSet};

use metrics::counter;
use tracing::{debug, info, warn};

use ditto_core::{
    normalize_annotations, AnnotationKeys, LabelMap, Meta, UnknownAnnotations, CHECKED_ANNOTATION,
};

use crate::checks::{
    annotation_refers_to, needs_allowed_annotations_update, needs_data_update,
    needs_from_annotations_update, replicated_by_check, replication_allowed, resolve_annotation,
    CheckError, DataUpdate, Permission,
};
use crate::ports::{ActionError, ObjectActions};
use crate::store::SnapshotStore;
use crate::targets::{replication_targets, TargetPattern};

/// Labels stamped on every engine-managed target by default.
pub fn default_copy_labels() -> LabelMap {
    [("managed-by".to_string(), "kubernetes-replicator".to_string())]
        .into_iter()
        .collect()
}

/// Tunables for one replication engine instance.
#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    /// Display name of the replicated kind, used in logs.
    pub kind: String,
    /// Treat every source as allowing replication unless it explicitly
    /// disallows it.
    pub allow_all: bool,
    pub keys: AnnotationKeys,
    /// Labels reconciled onto every engine-managed target.
    pub copy_labels: LabelMap,
}

impl ReplicatorOptions {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            allow_all: false,
            keys: AnnotationKeys::default(),
            copy_labels: default_copy_labels(),
        }
    }
}

/// Errors flowing out of engine sub-procedures. Handlers log them and move
/// on; nothing here is fatal to the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("parse: {0}")]
    Parse(#[from] CheckError),
    #[error("denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("{0}")]
    Missing(String),
}

impl From<UnknownAnnotations> for EngineError {
    fn from(err: UnknownAnnotations) -> Self {
        EngineError::Parse(CheckError(err.to_string()))
    }
}

/// The annotation-driven replication engine for one resource kind.
pub struct Replicator<A: ObjectActions> {
    kind: String,
    allow_all: bool,
    keys: AnnotationKeys,
    copy_labels: LabelMap,
    actions: A,

    /// Local snapshot of the watched objects.
    objects: SnapshotStore<A::Object>,
    /// Names of the namespaces currently known to exist.
    namespaces: BTreeSet<String>,

    /// source key -> targets currently installed by that source
    targets_to: HashMap<String, Vec<String>>,
    /// source key -> literal targets declared by that source
    watched_targets: HashMap<String, Vec<String>>,
    /// source key -> pattern targets declared by that source
    watched_patterns: HashMap<String, Vec<TargetPattern>>,
    /// source key -> objects that pull from that source
    targets_from: HashMap<String, Vec<String>>,
}

impl<A: ObjectActions> Replicator<A> {
    pub fn new(actions: A, options: ReplicatorOptions) -> Self {
        Self {
            kind: options.kind,
            allow_all: options.allow_all,
            keys: options.keys,
            copy_labels: options.copy_labels,
            actions,
            objects: SnapshotStore::new(),
            namespaces: BTreeSet::new(),
            targets_to: HashMap::new(),
            watched_targets: HashMap::new(),
            watched_patterns: HashMap::new(),
            targets_from: HashMap::new(),
        }
    }

    /// Seeds the namespace set without running handlers, for the initial
    /// list and for tests.
    pub fn seed_namespaces(&mut self, names: impl IntoIterator<Item = String>) {
        self.namespaces.extend(names);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains(name)
    }

    /// The current local view of an object, if any.
    pub fn get_object(&self, key: &str) -> Option<A::Object> {
        self.objects.get(key).map(|(object, _)| object.clone())
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.objects.keys()
    }

    /// Called when an object was created, updated or re-listed.
    ///
    /// The object may want to start or stop replicating, may pull from
    /// another object, or may itself be an engine-owned copy.
    pub async fn object_added(&mut self, object: A::Object) {
        let mut object = object;
        let mut meta = self.actions.meta(&object);
        let key = meta.key();
        debug!(kind = %self.kind, key = %key, "object added");
        // transient intent indexes are recomputed below
        self.watched_targets.remove(&key);
        self.watched_patterns.remove(&key);
        // refresh the local view
        self.objects.insert(object.clone(), meta.clone());

        match normalize_annotations(&mut meta, &self.keys) {
            Err(err) => {
                warn!(kind = %self.kind, key = %key, error = %err, "could not parse object");
                self.objects.set_meta(&key, meta);
                return;
            }
            Ok(true) => {
                info!(kind = %self.kind, key = %key, "updating deprecated annotations");
                let mut annotations = meta.annotations.clone();
                annotations.remove(CHECKED_ANNOTATION);
                match self.actions.update(&object, &object, annotations).await {
                    Err(err) => {
                        // the store keeps the un-rewritten view; the next
                        // watch event re-drives the rewrite
                        warn!(kind = %self.kind, key = %key, error = %err, "error while updating");
                        return;
                    }
                    Ok(updated) => {
                        let mut updated_meta = self.actions.meta(&updated);
                        if normalize_annotations(&mut updated_meta, &self.keys).is_err() {
                            warn!(kind = %self.kind, key = %key, "rewritten annotations came back invalid");
                            self.objects.insert(updated, updated_meta);
                            return;
                        }
                        self.objects.insert(updated.clone(), updated_meta.clone());
                        object = updated;
                        meta = updated_meta;
                    }
                }
            }
            Ok(false) => self.objects.set_meta(&key, meta.clone()),
        }

        let resolved = match replication_targets(&meta, &self.keys) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(kind = %self.kind, key = %key, error = %err, "could not parse object");
                // an unparseable source replicates nowhere
                self.targets_to.remove(&key);
                return;
            }
        };

        // previously installed targets that the annotations no longer name
        // have to go
        if let Some(mut old_targets) = self.targets_to.remove(&key) {
            debug!(kind = %self.kind, key = %key, "source changed");
            old_targets.sort();
            old_targets.dedup();
            for target in &old_targets {
                let still_named = match &resolved {
                    None => false,
                    Some((targets, patterns)) => {
                        targets.iter().any(|t| t == target)
                            || patterns.iter().any(|p| p.matches_key(target))
                    }
                };
                if !still_named {
                    info!(kind = %self.kind, key = %key, target = %target, "target dropped from annotations");
                    self.delete_object(target, &object, "source has updated \"replicate-to\" annotations")
                        .await;
                }
            }
        }

        // refresh objects pulling from this one
        if let Some(mut dependents) = self.targets_from.remove(&key) {
            debug!(kind = %self.kind, key = %key, dependents = dependents.len(), "has dependents");
            dependents.sort();
            dependents.dedup();
            let mut kept = Vec::new();
            for dependent in dependents {
                let (dependent_object, dependent_meta) =
                    match self.object_from_store(&dependent, true) {
                        Ok(Some(found)) => found,
                        Ok(None) | Err(_) => {
                            debug!(kind = %self.kind, dependent = %dependent, "could not get dependent");
                            continue;
                        }
                    };
                match resolve_annotation(&dependent_meta, &self.keys.replicate_from) {
                    Some(from) if from == key => {}
                    _ => {
                        debug!(kind = %self.kind, dependent = %dependent, "dependent changed");
                        continue;
                    }
                }
                kept.push(dependent.clone());
                let _ = self.replicate_object(&dependent_object, &object).await;
            }
            if !kept.is_empty() {
                self.targets_from.insert(key.clone(), kept);
            }
        }

        if let Some(created_by) = meta.annotations.get(&self.keys.replicated_by).cloned() {
            // this object is an engine-owned copy
            info!(kind = %self.kind, key = %key, source = %created_by, "replicated by");
            let source = match self.object_from_store(&created_by, false) {
                Err(err) => {
                    warn!(kind = %self.kind, source = %created_by, error = %err, "could not get source");
                    return;
                }
                Ok(None) => None,
                Ok(Some((source_object, source_meta))) => {
                    match self.replicated_to(&source_meta, &meta) {
                        Err(err) => {
                            warn!(kind = %self.kind, source = %created_by, error = %err, "could not parse source");
                            return;
                        }
                        Ok(true) => Some(source_object),
                        Ok(false) => None,
                    }
                }
            };
            match source {
                None => {
                    info!(kind = %self.kind, key = %key, source = %created_by, "source gone, deleting target");
                    let _ = self.do_delete_object(&object, "source does not exist").await;
                    return;
                }
                Some(source_object) => {
                    if self
                        .install_object("", Some(object.clone()), &source_object)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    match self.object_from_store(&key, true) {
                        // an owned copy never pushes on its own; fall
                        // through to the pull branch with the fresh view
                        Ok(Some((fresh_object, fresh_meta))) => {
                            object = fresh_object;
                            meta = fresh_meta;
                        }
                        Ok(None) | Err(_) => return,
                    }
                }
            }
        } else if let Some((targets, patterns)) = resolved {
            // this object pushes to other locations
            let mut existing: Vec<String> = Vec::new();
            for target in &targets {
                let ns = target.split('/').next().unwrap_or_default();
                if self.namespaces.contains(ns) {
                    existing.push(target.clone());
                } else {
                    info!(kind = %self.kind, key = %key, target = %target, "replication deferred: no namespace");
                }
            }
            if !patterns.is_empty() {
                let mut seen: HashSet<String> = existing.iter().cloned().collect();
                seen.insert(key.clone());
                let namespaces: Vec<String> = self.namespaces.iter().cloned().collect();
                for pattern in &patterns {
                    for target in pattern.targets(namespaces.iter().map(String::as_str)) {
                        if seen.insert(target.clone()) {
                            existing.push(target);
                        }
                    }
                }
            }
            if !targets.is_empty() {
                self.watched_targets.insert(key.clone(), targets);
            }
            if !patterns.is_empty() {
                self.watched_patterns.insert(key.clone(), patterns);
            }
            if !existing.is_empty() {
                self.targets_to.insert(key.clone(), existing.clone());
                for target in &existing {
                    info!(kind = %self.kind, key = %key, target = %target, "replicating to target");
                    let _ = self.install_object(target, None, &object).await;
                }
            }
            // a source that pushes cannot simultaneously pull
            return;
        }

        if let Some(source_key) = resolve_annotation(&meta, &self.keys.replicate_from) {
            // this object pulls from another
            info!(kind = %self.kind, key = %key, source = %source_key, "replicated from");
            self.targets_from
                .entry(source_key.clone())
                .or_default()
                .push(key.clone());
            match self.object_from_store(&source_key, false) {
                Err(err) => {
                    warn!(kind = %self.kind, source = %source_key, error = %err, "could not get source");
                }
                Ok(None) => {
                    info!(kind = %self.kind, key = %key, source = %source_key, "source gone, clearing target");
                    let _ = self.do_clear_object(&object, "source does not exist").await;
                }
                Ok(Some((source_object, _))) => {
                    let _ = self.replicate_object(&object, &source_object).await;
                }
            }
        }
    }

    /// Called when an object was deleted: tear down what it installed, clear
    /// what pulled from it, and let any waiting source claim the free slot.
    pub async fn object_deleted(&mut self, object: A::Object) {
        let meta = self.actions.meta(&object);
        let key = meta.key();
        debug!(kind = %self.kind, key = %key, "object deleted");
        self.objects.remove(&key);

        if let Some(targets) = self.targets_to.remove(&key) {
            for target in &targets {
                self.delete_object(target, &object, "source deleted").await;
            }
        }
        self.watched_targets.remove(&key);
        self.watched_patterns.remove(&key);

        if let Some(mut dependents) = self.targets_from.remove(&key) {
            dependents.sort();
            dependents.dedup();
            let mut kept = Vec::new();
            for dependent in dependents {
                // the target is cleared but stays interesting: the source
                // may be created again
                if self.clear_object(&dependent, &object).await {
                    kept.push(dependent);
                }
            }
            if !kept.is_empty() {
                self.targets_from.insert(key.clone(), kept);
            }
        }

        // nothing can be installed into a namespace that is gone
        if !self.namespaces.contains(&meta.namespace) {
            return;
        }

        // the slot is free; find a source that wants it
        let mut candidates: BTreeSet<String> = BTreeSet::new();
        for (source, watched) in &self.watched_targets {
            if watched.iter().any(|t| t == &key) {
                candidates.insert(source.clone());
            }
        }
        for (source, patterns) in &self.watched_patterns {
            if candidates.contains(source) {
                continue;
            }
            if patterns.iter().any(|p| p.matches_meta(&meta)) {
                candidates.insert(source.clone());
            }
        }
        for source in candidates {
            match self.object_from_store(&source, true) {
                Ok(Some((source_object, source_meta))) => {
                    match self.replicated_to(&source_meta, &meta) {
                        Err(err) => {
                            self.watched_targets.remove(&source);
                            self.watched_patterns.remove(&source);
                            warn!(kind = %self.kind, source = %source, error = %err, "could not parse source");
                        }
                        Ok(false) => {}
                        Ok(true) => {
                            let _ = self.install_object(&key, None, &source_object).await;
                            break;
                        }
                    }
                }
                Ok(None) | Err(_) => {
                    debug!(kind = %self.kind, source = %source, "could not get source");
                }
            }
        }
    }

    /// Called when a namespace was created: every source watching it gets to
    /// install the targets that land there.
    pub async fn namespace_added(&mut self, namespace: &str) {
        info!(kind = %self.kind, namespace, "namespace added");
        self.namespaces.insert(namespace.to_string());

        let mut candidates: BTreeSet<String> = BTreeSet::new();
        for (source, watched) in &self.watched_targets {
            if watched
                .iter()
                .any(|t| t.split('/').next() == Some(namespace))
            {
                candidates.insert(source.clone());
            }
        }
        for (source, patterns) in &self.watched_patterns {
            if candidates.contains(source) {
                continue;
            }
            if patterns.iter().any(|p| p.match_namespace(namespace).is_some()) {
                candidates.insert(source.clone());
            }
        }
        for source in candidates {
            match self.object_from_store(&source, true) {
                Ok(Some((source_object, _))) => {
                    info!(kind = %self.kind, source = %source, namespace, "source is watching namespace");
                    self.replicate_to_namespace(&source_object, namespace).await;
                }
                Ok(None) | Err(_) => {
                    debug!(kind = %self.kind, source = %source, "could not get source");
                }
            }
        }
    }

    /// Namespace deletions only shrink the local set; member objects come
    /// back as their own deleted events.
    pub fn namespace_deleted(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
    }

    /// Applies a fresh full list: tombstones for keys that vanished, then an
    /// add for everything listed. The store is filled before any handler
    /// runs so cross-object lookups see the complete view.
    pub async fn objects_relisted(&mut self, objects: Vec<A::Object>) {
        let fresh: HashSet<String> = objects
            .iter()
            .map(|object| self.actions.meta(object).key())
            .collect();
        let stale: Vec<String> = self
            .objects
            .keys()
            .into_iter()
            .filter(|key| !fresh.contains(key))
            .collect();
        for key in stale {
            if let Some((object, _)) = self.objects.get_cloned(&key) {
                self.object_deleted(object).await;
            }
        }
        for object in &objects {
            let meta = self.actions.meta(object);
            self.objects.insert(object.clone(), meta);
        }
        for object in objects {
            self.object_added(object).await;
        }
    }

    /// Applies a fresh namespace list.
    pub async fn namespaces_relisted(&mut self, names: Vec<String>) {
        let fresh: BTreeSet<String> = names.into_iter().collect();
        self.namespaces.retain(|ns| fresh.contains(ns));
        for name in fresh {
            self.namespace_added(&name).await;
        }
    }

    /// Re-delivers every live object as a synthetic update.
    pub async fn resync(&mut self) {
        for key in self.objects.keys() {
            if let Some((object, _)) = self.objects.get_cloned(&key) {
                self.object_added(object).await;
            }
        }
    }

    /// Fetches an object from the local snapshot, validating its annotations
    /// on the way out. An unparseable or missing object loses its transient
    /// intent indexes.
    fn object_from_store(
        &mut self,
        key: &str,
        must_exist: bool,
    ) -> Result<Option<(A::Object, Meta)>, EngineError> {
        let Some((object, mut meta)) = self.objects.get_cloned(key) else {
            self.watched_targets.remove(key);
            self.watched_patterns.remove(key);
            if must_exist {
                return Err(EngineError::Missing(format!("{key} does not exist")));
            }
            return Ok(None);
        };
        match normalize_annotations(&mut meta, &self.keys) {
            Err(err) => {
                self.objects.set_meta(key, meta);
                self.watched_targets.remove(key);
                self.watched_patterns.remove(key);
                Err(err.into())
            }
            Ok(_) => {
                self.objects.set_meta(key, meta.clone());
                Ok(Some((object, meta)))
            }
        }
    }

    /// True when the source's annotations name the target, literally or
    /// through a pattern.
    fn replicated_to(&self, source_meta: &Meta, target_meta: &Meta) -> Result<bool, CheckError> {
        let Some((targets, patterns)) = replication_targets(source_meta, &self.keys)? else {
            return Ok(false);
        };
        let key = target_meta.key();
        Ok(targets.iter().any(|t| *t == key)
            || patterns.iter().any(|p| p.matches_meta(target_meta)))
    }

    /// Installs the subset of a source's targets that land in a freshly
    /// created namespace.
    async fn replicate_to_namespace(&mut self, object: &A::Object, namespace: &str) {
        let meta = self.actions.meta(object);
        let key = meta.key();
        // an engine-owned copy has no push intent of its own
        if meta.annotations.contains_key(&self.keys.replicated_by) {
            info!(kind = %self.kind, key = %key, "already created by another source");
            self.watched_targets.remove(&key);
            self.watched_patterns.remove(&key);
            return;
        }
        let resolved = match replication_targets(&meta, &self.keys) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(kind = %self.kind, key = %key, error = %err, "could not parse object");
                self.watched_targets.remove(&key);
                self.watched_patterns.remove(&key);
                return;
            }
        };
        let Some((targets, patterns)) = resolved else {
            return;
        };
        let mut landing: BTreeSet<String> = BTreeSet::new();
        for target in &targets {
            if target.split('/').next() == Some(namespace) {
                landing.insert(target.clone());
            }
        }
        for pattern in &patterns {
            if let Some(target) = pattern.match_namespace(namespace) {
                landing.insert(target);
            }
        }
        landing.remove(&key);
        if landing.is_empty() {
            return;
        }
        let mut current = self.targets_to.remove(&key).unwrap_or_default();
        for target in &landing {
            info!(kind = %self.kind, key = %key, target = %target, "replicating to target");
            current.push(target.clone());
            let _ = self.install_object(target, None, object).await;
        }
        // the watched indexes already cover this namespace, or we would not
        // be here
        self.targets_to.insert(key, current);
    }

    /// Pull: copies the source's data into a target that asked for it.
    async fn replicate_object(
        &mut self,
        object: &A::Object,
        source: &A::Object,
    ) -> Result<(), EngineError> {
        let meta = self.actions.meta(object);
        let source_meta = self.actions.meta(source);
        let key = meta.key();
        let was_replicated = meta.annotations.contains_key(&self.keys.replicated_version);

        match replication_allowed(&meta, &source_meta, self.allow_all, &self.keys) {
            Ok(Permission::Allowed) => {}
            Ok(Permission::Denied(reason)) => {
                info!(kind = %self.kind, key = %key, %reason, "replication cancelled");
                if was_replicated {
                    return self.do_clear_object(object, "source disallowed").await;
                }
                return Err(EngineError::Denied(reason));
            }
            Err(err) => {
                warn!(kind = %self.kind, key = %key, error = %err, "replication cancelled");
                return Err(err.into());
            }
        }
        match needs_data_update(&meta, &source_meta, &self.keys) {
            Ok(DataUpdate::Needed) => {}
            Ok(DataUpdate::UpToDate(reason)) | Ok(DataUpdate::Frozen(reason)) => {
                debug!(kind = %self.kind, key = %key, %reason, "replication skipped");
                return Ok(());
            }
            Err(err) => {
                warn!(kind = %self.kind, key = %key, error = %err, "replication skipped");
                return Err(err.into());
            }
        }

        let mut annotations = meta.annotations.clone();
        annotations.remove(CHECKED_ANNOTATION);
        annotations.insert(self.keys.replicated_at.clone(), now_rfc3339());
        annotations.insert(
            self.keys.replicated_version.clone(),
            source_meta.resource_version.clone(),
        );
        match source_meta.annotations.get(&self.keys.replicate_once_version) {
            Some(value) => {
                annotations.insert(self.keys.replicate_once_version.clone(), value.clone());
            }
            None => {
                annotations.remove(&self.keys.replicate_once_version);
            }
        }

        info!(kind = %self.kind, key = %key, "updating data");
        match self.actions.update(object, source, annotations).await {
            Err(err) => {
                self.count_failure(&err);
                warn!(kind = %self.kind, key = %key, error = %err, "error while updating");
                Err(err.into())
            }
            Ok(updated) => {
                counter!("replicator_updates_total", 1u64);
                let updated_meta = self.actions.meta(&updated);
                self.objects.insert(updated, updated_meta);
                Ok(())
            }
        }
    }

    /// Push: creates or refreshes a target from a source. The target is
    /// passed either as a key (looked up locally) or as the current object.
    async fn install_object(
        &mut self,
        target: &str,
        existing: Option<A::Object>,
        source: &A::Object,
    ) -> Result<(), EngineError> {
        let source_meta = self.actions.meta(source);
        let mut target_object = existing;
        let mut target_meta: Option<Meta> = None;
        let (target_namespace, target_name): (String, String);

        if let Some(object) = &target_object {
            let meta = self.actions.meta(object);
            target_namespace = meta.namespace.clone();
            target_name = meta.name.clone();
            target_meta = Some(meta);
        } else {
            let Some((ns, name)) = ditto_core::split_key(target) else {
                let err = CheckError(format!(
                    "invalid target path for source {} ({target}): expected namespace/name",
                    source_meta.key()
                ));
                warn!(kind = %self.kind, error = %err, "cannot install");
                return Err(err.into());
            };
            target_namespace = ns.to_string();
            target_name = name.to_string();
            match self.object_from_store(target, false) {
                Err(err) => {
                    warn!(kind = %self.kind, target = %target, error = %err, "could not get target");
                    return Err(err);
                }
                Ok(None) => {}
                Ok(Some((object, meta))) => {
                    // only ever overwrite our own copies
                    if let Err(err) = replicated_by_check(&meta, &source_meta, &self.keys) {
                        info!(kind = %self.kind, target = %target, reason = %err, "replication cancelled");
                        return Err(err.into());
                    }
                    target_object = Some(object);
                    target_meta = Some(meta);
                }
            }
        }

        // relay: the source itself pulls, so the target only receives the
        // pull annotations and keeps whatever data it already has
        if let Some(upstream) = resolve_annotation(&source_meta, &self.keys.replicate_from) {
            let reason;
            if let Some(meta) = &target_meta {
                match needs_from_annotations_update(meta, &source_meta, &self.keys, &self.copy_labels)
                {
                    Err(err) => {
                        warn!(kind = %self.kind, key = %source_meta.key(), error = %err, "replication cancelled");
                        return Err(err.into());
                    }
                    Ok(false) => return Ok(()),
                    Ok(true) => {}
                }
                reason = "updating \"replicate-from\" annotations";
            } else {
                reason = "creating with \"replicate-from\" annotations";
            }
            let mut copy_meta = Meta {
                namespace: target_namespace,
                name: target_name,
                resource_version: target_meta
                    .as_ref()
                    .map(|m| m.resource_version.clone())
                    .unwrap_or_default(),
                labels: self.managed_labels(target_meta.as_ref()),
                annotations: Default::default(),
            };
            copy_meta
                .annotations
                .insert(self.keys.replicated_by.clone(), source_meta.key());
            copy_meta
                .annotations
                .insert(self.keys.replicate_from.clone(), upstream);
            if let Some(value) = source_meta.annotations.get(&self.keys.replicate_once) {
                copy_meta
                    .annotations
                    .insert(self.keys.replicate_once.clone(), value.clone());
            }
            return self
                .do_install_object(copy_meta, source, target_object.as_ref(), reason)
                .await;
        }

        let reason;
        if let Some(meta) = target_meta.clone() {
            if meta.annotations.contains_key(&self.keys.replicate_from) {
                // a former relay target now gets the source's own data
            } else {
                match needs_data_update(&meta, &source_meta, &self.keys) {
                    Err(err) => {
                        warn!(kind = %self.kind, key = %source_meta.key(), error = %err, "replication skipped");
                        return Err(err.into());
                    }
                    Ok(DataUpdate::Needed) => {}
                    Ok(DataUpdate::UpToDate(skip)) => {
                        debug!(kind = %self.kind, key = %source_meta.key(), reason = %skip, "replication skipped");
                        return Ok(());
                    }
                    Ok(DataUpdate::Frozen(skip)) => {
                        // data stays frozen, but permission annotations are
                        // still reconciled
                        match needs_allowed_annotations_update(
                            &meta,
                            &source_meta,
                            &self.keys,
                            &self.copy_labels,
                        ) {
                            Err(err) => {
                                warn!(kind = %self.kind, key = %source_meta.key(), error = %err, "replication skipped");
                                return Err(err.into());
                            }
                            Ok(false) => {
                                debug!(kind = %self.kind, key = %source_meta.key(), reason = %skip, "replication skipped");
                                return Ok(());
                            }
                            Ok(true) => {
                                let mut copy_meta = meta.clone();
                                copy_meta.labels = self.managed_labels(Some(&meta));
                                for name in [
                                    &self.keys.replication_allowed,
                                    &self.keys.replication_allowed_namespaces,
                                ] {
                                    match source_meta.annotations.get(name) {
                                        Some(value) => {
                                            copy_meta
                                                .annotations
                                                .insert(name.clone(), value.clone());
                                        }
                                        None => {
                                            copy_meta.annotations.remove(name);
                                        }
                                    }
                                }
                                return self
                                    .do_install_object(
                                        copy_meta,
                                        source,
                                        target_object.as_ref(),
                                        "updating \"replication-allowed\" annotations",
                                    )
                                    .await;
                            }
                        }
                    }
                }
            }
            reason = "updating data";
        } else {
            reason = "creating with data";
        }

        let mut copy_meta = Meta {
            namespace: target_namespace,
            name: target_name,
            resource_version: target_meta
                .as_ref()
                .map(|m| m.resource_version.clone())
                .unwrap_or_default(),
            labels: self.managed_labels(target_meta.as_ref()),
            annotations: Default::default(),
        };
        copy_meta
            .annotations
            .insert(self.keys.replicated_at.clone(), now_rfc3339());
        copy_meta
            .annotations
            .insert(self.keys.replicated_by.clone(), source_meta.key());
        copy_meta.annotations.insert(
            self.keys.replicated_version.clone(),
            source_meta.resource_version.clone(),
        );
        for name in [
            &self.keys.replicate_once_version,
            &self.keys.replication_allowed,
            &self.keys.replication_allowed_namespaces,
        ] {
            if let Some(value) = source_meta.annotations.get(name) {
                copy_meta.annotations.insert(name.clone(), value.clone());
            }
        }
        self.do_install_object(copy_meta, source, Some(source), reason)
            .await
    }

    async fn do_install_object(
        &mut self,
        mut meta: Meta,
        source: &A::Object,
        data: Option<&A::Object>,
        reason: &str,
    ) -> Result<(), EngineError> {
        info!(kind = %self.kind, key = %meta.key(), reason, "installing");
        meta.annotations.remove(CHECKED_ANNOTATION);
        match self.actions.install(meta, source, data).await {
            Err(err) => {
                self.count_failure(&err);
                warn!(kind = %self.kind, error = %err, "error while installing");
                Err(err.into())
            }
            Ok(installed) => {
                counter!("replicator_installs_total", 1u64);
                let installed_meta = self.actions.meta(&installed);
                self.objects.insert(installed, installed_meta);
                Ok(())
            }
        }
    }

    /// Clears a dependent after its source was deleted, provided it still
    /// points at that source. Returns true when the dependent should stay on
    /// the watch list for a future resurrection of the source.
    async fn clear_object(&mut self, key: &str, source: &A::Object) -> bool {
        let source_meta = self.actions.meta(source);
        let (target_object, target_meta) = match self.object_from_store(key, true) {
            Ok(Some(found)) => found,
            Ok(None) | Err(_) => {
                debug!(kind = %self.kind, key = %key, "could not load dependent");
                return false;
            }
        };
        if !annotation_refers_to(&target_meta, &self.keys.replicate_from, &source_meta) {
            debug!(kind = %self.kind, key = %key, "dependent changed");
            return false;
        }
        let _ = self.do_clear_object(&target_object, "source deleted").await;
        true
    }

    async fn do_clear_object(
        &mut self,
        object: &A::Object,
        reason: &str,
    ) -> Result<(), EngineError> {
        let meta = self.actions.meta(object);
        let key = meta.key();
        if !meta.annotations.contains_key(&self.keys.replicated_version) {
            debug!(kind = %self.kind, key = %key, "already clear");
            return Ok(());
        }
        let mut annotations = meta.annotations.clone();
        annotations.remove(CHECKED_ANNOTATION);
        annotations.insert(self.keys.replicated_at.clone(), now_rfc3339());
        annotations.remove(&self.keys.replicated_version);
        annotations.remove(&self.keys.replicate_once_version);

        info!(kind = %self.kind, key = %key, reason, "clearing");
        match self.actions.clear(object, annotations).await {
            Err(err) => {
                self.count_failure(&err);
                warn!(kind = %self.kind, key = %key, error = %err, "error while clearing");
                Err(err.into())
            }
            Ok(cleared) => {
                counter!("replicator_clears_total", 1u64);
                let cleared_meta = self.actions.meta(&cleared);
                self.objects.insert(cleared, cleared_meta);
                Ok(())
            }
        }
    }

    /// Deletes an engine-owned target, re-verifying ownership first.
    /// Returns true when the delete went through.
    async fn delete_object(&mut self, key: &str, source: &A::Object, reason: &str) -> bool {
        let source_meta = self.actions.meta(source);
        let (object, meta) = match self.object_from_store(key, true) {
            Ok(Some(found)) => found,
            Ok(None) | Err(_) => {
                debug!(kind = %self.kind, key = %key, "could not get target");
                return false;
            }
        };
        if let Err(err) = replicated_by_check(&meta, &source_meta, &self.keys) {
            info!(kind = %self.kind, key = %key, reason = %err, "deletion cancelled");
            return false;
        }
        self.do_delete_object(&object, reason).await.is_ok()
    }

    async fn do_delete_object(
        &mut self,
        object: &A::Object,
        reason: &str,
    ) -> Result<(), EngineError> {
        let meta = self.actions.meta(object);
        let key = meta.key();
        info!(kind = %self.kind, key = %key, reason, "deleting");
        match self.actions.delete(object).await {
            Err(err) => {
                self.count_failure(&err);
                warn!(kind = %self.kind, key = %key, error = %err, "error while deleting");
                Err(err.into())
            }
            Ok(()) => {
                counter!("replicator_deletes_total", 1u64);
                self.objects.remove(&key);
                Ok(())
            }
        }
    }

    /// Managed labels merged over whatever the target already carries;
    /// foreign labels survive.
    fn managed_labels(&self, target: Option<&Meta>) -> LabelMap {
        let mut labels = target.map(|m| m.labels.clone()).unwrap_or_default();
        for (k, v) in &self.copy_labels {
            labels.insert(k.clone(), v.clone());
        }
        labels
    }

    fn count_failure(&self, err: &ActionError) {
        match err {
            ActionError::Conflict(_) => counter!("replicator_conflicts_total", 1u64),
            _ => counter!("replicator_errors_total", 1u64),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
