//! Value encoding shared by span snapshots and checkpoint artifacts

pub mod hybrid;

pub use hybrid::{
    DEFAULT_MAX_SNAPSHOT_BYTES, HybridValue, SerializationFormat, Snapshot, SnapshotCapture,
};
