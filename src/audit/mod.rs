//! Audit & snapshot store.
//!
//! Append-only JSONL audit trail, a pretty-printed live-table snapshot, a
//! tolerant query/export surface, and the garbage-collection helpers that
//! clean up after crashed processes.

mod events;
mod store;

pub use events::{AuditEvent, AuditKind};
pub use store::{
    sweep_orphan_workspaces, terminate_stale_pid, AuditFilter, AuditStore, SnapshotEntry,
    AUDIT_FILE, SNAPSHOT_FILE,
};
