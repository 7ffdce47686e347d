//! Engine configuration.
//!
//! Every piece of process-wide state the engine consults — replication
//! role, cluster flag, lazy-free and recency policies, the clock — is
//! carried here explicitly and passed in at construction. There are no
//! global singletons.

use crate::time::Clock;

/// Replication role of the server owning this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// No configured masters; expiration deletes keys directly.
    #[default]
    Primary,
    /// Follows a master and waits for its DELs to expire keys.
    Replica,
    /// Accepts writes and merges them by MVCC timestamp; expires keys
    /// itself and does not propagate expiration DELs to its peers.
    ActiveReplica,
}

impl Role {
    /// `true` for both replica flavors.
    pub fn is_replica(self) -> bool {
        !matches!(self, Role::Primary)
    }
}

/// Which access-recency metadata lookups maintain on values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecencyPolicy {
    /// Stamp the LRU clock (second resolution) on access.
    Lru,
    /// Maintain a logarithmic access counter with time-based decay.
    Lfu {
        /// Growth damping factor; larger means slower counter growth.
        log_factor: u8,
        /// Minutes per halving-step of the decay.
        decay_minutes: u8,
    },
}

impl RecencyPolicy {
    /// LFU with the stock factor/decay pair.
    pub fn lfu() -> Self {
        RecencyPolicy::Lfu {
            log_factor: 10,
            decay_minutes: 1,
        }
    }
}

impl Default for RecencyPolicy {
    fn default() -> Self {
        RecencyPolicy::Lru
    }
}

/// Configuration for a [`Keyspace`](crate::Keyspace).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of numbered databases.
    pub db_count: usize,
    /// Replication role.
    pub role: Role,
    /// Whether a replica rejects client writes. Writable replicas track
    /// client-set expires separately so they can enforce them locally.
    pub replica_read_only: bool,
    /// Whether the cluster slot index is maintained.
    pub cluster_enabled: bool,
    /// Whether an append-only log collaborator is attached (gates the
    /// AOF propagation of expiration deletes).
    pub aof_enabled: bool,
    /// Expiration deletes go through the background dropper.
    pub lazy_free_expire: bool,
    /// Explicit deletes go through the background dropper.
    pub lazy_free_server_del: bool,
    /// Recency metadata policy applied on lookups.
    pub recency: RecencyPolicy,
    /// Millisecond wall-clock source.
    pub clock: Clock,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_count: 16,
            role: Role::Primary,
            replica_read_only: true,
            cluster_enabled: false,
            aof_enabled: false,
            lazy_free_expire: false,
            lazy_free_server_del: false,
            recency: RecencyPolicy::Lru,
            clock: Clock::System,
        }
    }
}
