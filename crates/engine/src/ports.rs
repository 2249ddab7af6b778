//! The object port: resource-type-specific operations the engine drives.

use async_trait::async_trait;
use ditto_core::{AnnotationMap, Meta};

/// Errors surfaced by an object port, classified by how the engine reacts.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The cluster rejected the version precondition. Logged and dropped;
    /// the next watch event re-drives convergence.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The object disappeared mid-operation.
    #[error("not found: {0}")]
    NotFound(String),
    /// Client I/O failure; the informer resync will retry.
    #[error("transport: {0}")]
    Transport(String),
}

/// Resource-type-specific operations, all version-guarded.
///
/// Implementations must deep-copy payload collections: the engine may hold
/// on to any object it has passed in or received.
#[async_trait]
pub trait ObjectActions: Send + Sync {
    type Object: Clone + Send + Sync + 'static;

    /// Extracts the metadata view of an object.
    fn meta(&self, object: &Self::Object) -> Meta;

    /// Returns a new object carrying `source`'s data and exactly the given
    /// annotations.
    async fn update(
        &self,
        object: &Self::Object,
        source: &Self::Object,
        annotations: AnnotationMap,
    ) -> Result<Self::Object, ActionError>;

    /// Returns a new object with its data emptied and exactly the given
    /// annotations.
    async fn clear(
        &self,
        object: &Self::Object,
        annotations: AnnotationMap,
    ) -> Result<Self::Object, ActionError>;

    /// Creates (`meta.resource_version` empty) or replaces the object at
    /// `meta`, copying type information from `source` and data from `data`
    /// (`None` installs an empty payload).
    async fn install(
        &self,
        meta: Meta,
        source: &Self::Object,
        data: Option<&Self::Object>,
    ) -> Result<Self::Object, ActionError>;

    /// Deletes the object, preconditioned on its resource version.
    async fn delete(&self, object: &Self::Object) -> Result<(), ActionError>;
}
