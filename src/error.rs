//! Error types for the keyspace engine.

use thiserror::Error;

/// Errors returned by keyspace operations.
///
/// Missing keys are not errors — lookups return `None`. Invariant
/// violations (inserting over an existing key, expire records without a
/// backing entry) are programmer errors and panic instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyspaceError {
    /// The operation was attempted on a key holding a value of the wrong type.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// RENAME (or a similar two-key operation) was given a missing source key.
    #[error("ERR no such key")]
    NoSuchKey,

    /// MOVE between a database and itself.
    #[error("ERR source and destination objects are the same")]
    SameObject,

    /// A database index outside `[0, db_count)`.
    #[error("ERR DB index is out of range")]
    OutOfRange,

    /// Malformed scan options (e.g. COUNT below 1).
    #[error("ERR syntax error")]
    Syntax,

    /// A scan cursor that is not a valid unsigned integer.
    #[error("ERR invalid cursor")]
    InvalidCursor,

    /// The operation is unavailable while cluster mode is enabled.
    #[error("ERR {0} is not allowed in cluster mode")]
    ClusterMode(&'static str),
}
