//! Shared fake harness for driving the replication engine without a
//! cluster.
//!
//! The fake object port assigns monotonically increasing resource versions
//! and enforces optimistic concurrency on every mutation, including delete,
//! so stale writes surface as `Conflict` exactly like they would against the
//! real API. Every successful call is recorded for call-count assertions.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ditto_core::{object_key, AnnotationMap, Meta};
use ditto_engine::{ActionError, ObjectActions, Replicator, ReplicatorOptions};

/// A simplified cluster object: metadata plus a single opaque data string.
#[derive(Debug, Clone)]
pub struct FakeObject {
    pub meta: Meta,
    pub data: String,
    pub version: u64,
}

impl FakeObject {
    pub fn key(&self) -> String {
        self.meta.key()
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.meta.annotations.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct RecordedAction {
    pub key: String,
    pub kind: ActionKind,
    pub data: String,
    pub annotations: AnnotationMap,
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Version of every object existing cluster-side.
    pub versions: HashMap<String, u64>,
    /// Every successful mutation, in order.
    pub log: Vec<RecordedAction>,
    /// Total port calls, successful or not.
    pub calls: u64,
    counter: u64,
}

impl FakeState {
    pub fn next_version(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

/// The fake object port.
#[derive(Clone, Default)]
pub struct FakeActions {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeActions {
    fn mutate(
        &self,
        object: &FakeObject,
        data: String,
        annotations: AnnotationMap,
    ) -> Result<FakeObject, ActionError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let key = object.key();
        match state.versions.get(&key) {
            Some(version) if *version == object.version => {}
            stored => {
                return Err(ActionError::Conflict(format!(
                    "fake {key}: stored {stored:?}, got {}",
                    object.version
                )));
            }
        }
        let version = state.next_version();
        let updated = FakeObject {
            meta: Meta {
                resource_version: version.to_string(),
                annotations: annotations.clone(),
                ..object.meta.clone()
            },
            data,
            version,
        };
        state.versions.insert(key.clone(), version);
        state.log.push(RecordedAction {
            key,
            kind: ActionKind::Update,
            data: updated.data.clone(),
            annotations,
        });
        Ok(updated)
    }
}

#[async_trait]
impl ObjectActions for FakeActions {
    type Object = FakeObject;

    fn meta(&self, object: &FakeObject) -> Meta {
        object.meta.clone()
    }

    async fn update(
        &self,
        object: &FakeObject,
        source: &FakeObject,
        annotations: AnnotationMap,
    ) -> Result<FakeObject, ActionError> {
        self.mutate(object, source.data.clone(), annotations)
    }

    async fn clear(
        &self,
        object: &FakeObject,
        annotations: AnnotationMap,
    ) -> Result<FakeObject, ActionError> {
        self.mutate(object, String::new(), annotations)
    }

    async fn install(
        &self,
        meta: Meta,
        _source: &FakeObject,
        data: Option<&FakeObject>,
    ) -> Result<FakeObject, ActionError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let key = meta.key();
        let kind = if meta.resource_version.is_empty() {
            if let Some(version) = state.versions.get(&key) {
                return Err(ActionError::Conflict(format!(
                    "fake {key} already exists with version {version}"
                )));
            }
            ActionKind::Create
        } else {
            let expected: u64 = meta.resource_version.parse().unwrap_or_default();
            match state.versions.get(&key) {
                Some(version) if *version == expected => ActionKind::Update,
                stored => {
                    return Err(ActionError::Conflict(format!(
                        "fake {key}: stored {stored:?}, got {expected}"
                    )));
                }
            }
        };
        let version = state.next_version();
        let object = FakeObject {
            meta: Meta {
                resource_version: version.to_string(),
                ..meta
            },
            data: data.map(|d| d.data.clone()).unwrap_or_default(),
            version,
        };
        state.versions.insert(key.clone(), version);
        state.log.push(RecordedAction {
            key,
            kind,
            data: object.data.clone(),
            annotations: object.meta.annotations.clone(),
        });
        Ok(object)
    }

    async fn delete(&self, object: &FakeObject) -> Result<(), ActionError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let key = object.key();
        match state.versions.get(&key) {
            Some(version) if *version == object.version => {}
            stored => {
                return Err(ActionError::Conflict(format!(
                    "fake {key}: stored {stored:?}, got {}",
                    object.version
                )));
            }
        }
        state.versions.remove(&key);
        state.log.push(RecordedAction {
            key,
            kind: ActionKind::Delete,
            data: String::new(),
            annotations: AnnotationMap::new(),
        });
        Ok(())
    }
}

/// An engine wired to the fake port, with helpers mirroring informer
/// behavior: "set" touches the fake cluster, "add"/"delete" notify the
/// engine the way the watch would.
pub struct Harness {
    pub repl: Replicator<FakeActions>,
    pub actions: FakeActions,
}

impl Harness {
    pub fn new(allow_all: bool) -> Self {
        let mut options = ReplicatorOptions::new("fake object");
        options.allow_all = allow_all;
        Self::with_options(options)
    }

    pub fn with_options(options: ReplicatorOptions) -> Self {
        let actions = FakeActions::default();
        Harness {
            repl: Replicator::new(actions.clone(), options),
            actions,
        }
    }

    pub fn new_fake(
        &self,
        namespace: &str,
        name: &str,
        data: &str,
        annotations: &[(&str, &str)],
    ) -> FakeObject {
        let version = self.actions.state.lock().unwrap().next_version();
        FakeObject {
            meta: Meta {
                namespace: namespace.into(),
                name: name.into(),
                resource_version: version.to_string(),
                annotations: to_map(annotations),
                labels: Default::default(),
            },
            data: data.into(),
            version,
        }
    }

    /// Cluster-side update without notifying the engine. `None` keeps the
    /// current annotations.
    pub fn update_fake(
        &self,
        object: &FakeObject,
        data: &str,
        annotations: Option<&[(&str, &str)]>,
    ) -> FakeObject {
        let mut state = self.actions.state.lock().unwrap();
        let version = state.next_version();
        let annotations = annotations
            .map(to_map)
            .unwrap_or_else(|| object.meta.annotations.clone());
        let updated = FakeObject {
            meta: Meta {
                resource_version: version.to_string(),
                annotations,
                ..object.meta.clone()
            },
            data: data.into(),
            version,
        };
        state.versions.insert(updated.key(), version);
        updated
    }

    pub fn set_fake(&self, object: &FakeObject) {
        self.actions
            .state
            .lock()
            .unwrap()
            .versions
            .insert(object.key(), object.version);
    }

    pub fn unset_fake(&self, object: &FakeObject) {
        self.actions
            .state
            .lock()
            .unwrap()
            .versions
            .remove(&object.key());
    }

    pub async fn add_fake(&mut self, object: &FakeObject) {
        self.repl.object_added(object.clone()).await;
    }

    pub async fn set_add_fake(&mut self, object: &FakeObject) {
        self.set_fake(object);
        self.add_fake(object).await;
    }

    pub async fn update_add_fake(
        &mut self,
        object: &FakeObject,
        data: &str,
        annotations: Option<&[(&str, &str)]>,
    ) -> FakeObject {
        let updated = self.update_fake(object, data, annotations);
        self.add_fake(&updated).await;
        updated
    }

    pub async fn delete_fake(&mut self, object: &FakeObject) {
        self.repl.object_deleted(object.clone()).await;
    }

    pub async fn unset_delete_fake(&mut self, object: &FakeObject) {
        self.unset_fake(object);
        self.delete_fake(object).await;
    }

    pub fn init_namespaces(&mut self, names: &[&str]) {
        self.repl
            .seed_namespaces(names.iter().map(|name| name.to_string()));
    }

    pub async fn add_namespace(&mut self, name: &str) {
        self.repl.namespace_added(name).await;
    }

    /// Removes a namespace and returns the store objects living in it; the
    /// caller delivers their deletion events like the watch would.
    pub async fn delete_namespace(&mut self, name: &str) -> Vec<FakeObject> {
        self.repl.namespace_deleted(name);
        self.repl
            .object_keys()
            .into_iter()
            .filter_map(|key| self.repl.get_object(&key))
            .filter(|object| object.meta.namespace == name)
            .collect()
    }

    pub fn calls(&self) -> u64 {
        self.actions.state.lock().unwrap().calls
    }

    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.actions.state.lock().unwrap().versions.get(key).copied()
    }

    /// Keys of every object existing cluster-side.
    pub fn existing_keys(&self) -> BTreeSet<String> {
        self.actions
            .state
            .lock()
            .unwrap()
            .versions
            .keys()
            .cloned()
            .collect()
    }

    /// The engine's local view, without consistency checks.
    pub fn get_store_fake(&self, namespace: &str, name: &str) -> Option<FakeObject> {
        self.repl.get_object(&object_key(namespace, name))
    }

    /// The engine's local view, cross-checked against the fake cluster.
    /// Panics when the two disagree.
    pub fn get_fake(&self, namespace: &str, name: &str) -> Option<FakeObject> {
        let key = object_key(namespace, name);
        let stored = self.repl.get_object(&key);
        let version = self.version_of(&key);
        match (stored, version) {
            (None, None) => None,
            (None, Some(version)) => {
                panic!("fake {key} not in store, but version {version} saved")
            }
            (Some(object), None) => {
                panic!(
                    "fake {key} in store with version {}, but not saved",
                    object.version
                )
            }
            (Some(object), Some(version)) => {
                assert_eq!(
                    object.version, version,
                    "fake {key} disagrees between store and cluster"
                );
                Some(object)
            }
        }
    }
}

pub fn to_map(annotations: &[(&str, &str)]) -> AnnotationMap {
    annotations
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn refs(annotations: &[(String, String)]) -> Vec<(&str, &str)> {
    annotations
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Loose RFC-3339 shape check, enough for `replicated-at` assertions.
pub fn is_timestamp(value: &str) -> bool {
    let bytes = value.as_bytes();
    value.len() >= 19
        && value[..4].chars().all(|c| c.is_ascii_digit())
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[10] == b'T'
        && bytes[13] == b':'
        && bytes[16] == b':'
}
