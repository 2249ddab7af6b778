//! Ditto engine: the annotation-driven replication state machine.
//!
//! Everything here is cluster-agnostic. The engine consumes metadata views
//! and talks to the cluster through the [`ObjectActions`] port, which makes
//! the whole state machine drivable from tests with a fake port.

#![forbid(unsafe_code)]

mod checks;
mod ports;
mod replicator;
mod store;
mod targets;

pub use checks::{
    annotation_refers_to, needs_allowed_annotations_update, needs_data_update,
    needs_from_annotations_update, needs_label_update, replicated_by_check, replication_allowed,
    resolve_annotation, CheckError, DataUpdate, Permission,
};
pub use ports::{ActionError, ObjectActions};
pub use replicator::{default_copy_labels, EngineError, Replicator, ReplicatorOptions};
pub use store::SnapshotStore;
pub use targets::{replication_targets, TargetPattern};
