//! mangrove: the keyspace engine of an in-memory key-value database.
//!
//! Owns the mapping from binary keys to typed values, per-key and
//! sub-key expiration, layered copy-on-write snapshots for consistent
//! long-running scans, and the MVCC timestamps an active-active
//! replication layer merges by. Command dispatch, wire protocol,
//! persistence formats, and the value-type command surfaces live with
//! external collaborators reached through [`hooks`].

pub mod config;
pub mod data;
pub mod database;
pub mod dict;
pub mod dropper;
pub mod error;
pub mod expire;
pub mod expiry;
pub mod hooks;
pub mod keyspace;
pub mod slots;
pub mod time;
pub mod value;
mod worker;

pub use config::{EngineConfig, RecencyPolicy, Role};
pub use database::ClientId;
pub use dropper::DropHandle;
pub use error::KeyspaceError;
pub use expire::{ExpireRecord, ExpireSet};
pub use expiry::run_expiration_cycle;
pub use hooks::{EventKind, Hooks, NullHooks, StorageTier};
pub use keyspace::{
    parse_cursor, DbStats, GlobPattern, Keyspace, KeyspaceCounters, LookupFlags, ScanItems,
    ScanOptions, SnapshotRef,
};
pub use slots::{key_slot, SlotIndex, SLOT_COUNT};
pub use time::{Clock, MvccClock};
pub use value::{
    shared_int, Encoding, HashRepr, Payload, SetRepr, StreamEntry, Value, ValueType, ZSetRepr,
};
pub use worker::ScanCancel;
