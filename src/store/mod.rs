// 🗄️ Client Store - the narrow, typed repository the merge saga depends on
//
// Two backends:
// - sqlite: the production relational store (rusqlite, WAL, foreign keys ON)
// - memory: an in-process registry with the same semantics (tests, embedding)
//
// Every method is a single storage call. The executor composes them into an
// ordered, idempotent sequence; the store never has to span a transaction
// across the whole merge.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{setup_database, SqliteStore};

use crate::client::{ClientId, ClientProfile};
use crate::dependents::{AssistanceRequest, DependentKind, Disbursement, Interaction};
use crate::error::StoreError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// QUERY
// ============================================================================

/// Loose lookup criteria. Any populated field may match (OR semantics);
/// names match as case-insensitive substrings, email and phone digits exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientQuery {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone_digits: Option<String>,
    /// Upper bound on rows returned by the loose lookup, newest first
    pub limit: usize,
}

impl ClientQuery {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.phone_digits.is_none()
    }
}

// ============================================================================
// MERGE LEASE
// ============================================================================

/// Longest lease a merge may hold: one day
pub const MAX_LOCK_TTL_SECS: i64 = 86_400;

/// A short-lived advisory lock held by one merge execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLease {
    /// Unique per execution attempt
    pub owner: String,
    pub plan_fingerprint: String,
    pub acquired_at: DateTime<Utc>,
    /// After this instant the lock is considered abandoned and may be taken over
    pub expires_at: DateTime<Utc>,
}

impl MergeLease {
    /// `ttl_secs` is clamped to `1..=MAX_LOCK_TTL_SECS`
    pub fn new(plan_fingerprint: &str, ttl_secs: i64) -> Self {
        let ttl_secs = ttl_secs.clamp(1, MAX_LOCK_TTL_SECS);
        let now = Utc::now();
        MergeLease {
            owner: uuid::Uuid::new_v4().to_string(),
            plan_fingerprint: plan_fingerprint.to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }
}

// ============================================================================
// AUDIT EVENT
// ============================================================================

/// Event for audit trail ("every merge is an event")
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// CLIENT STORE
// ============================================================================

pub trait ClientStore {
    // ---- clients -----------------------------------------------------------

    /// Insert a new client. Fails with `IdRetired` for an id that was merged away.
    fn insert_client(&self, client: &ClientProfile) -> Result<(), StoreError>;

    /// Current record, `None` when absent (including merged-away ids)
    fn get_client(&self, id: &ClientId) -> Result<Option<ClientProfile>, StoreError>;

    /// Surviving client a merged-away id was folded into
    fn merged_into(&self, id: &ClientId) -> Result<Option<ClientId>, StoreError>;

    /// Loose lookup; see `ClientQuery`
    fn find_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError>;

    /// Clients equal to the query on any whole field: first name, last name, email or
    /// phone digits (names and email case-insensitive). Ignores `limit`: every client
    /// that can score above a threshold of 20 or more is in this set.
    fn find_exact_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError>;

    /// Overwrite attributes of an existing client. Returns false if it does not exist.
    fn update_client(&self, client: &ClientProfile) -> Result<bool, StoreError>;

    /// Delete a client and record that it was merged into `merged_into`.
    /// Refuses while any dependent record still references it.
    /// Returns false when the client was already gone.
    fn delete_client(&self, id: &ClientId, merged_into: &ClientId) -> Result<bool, StoreError>;

    // ---- dependents --------------------------------------------------------

    fn insert_interaction(&self, interaction: &Interaction) -> Result<(), StoreError>;

    fn insert_assistance_request(&self, request: &AssistanceRequest) -> Result<(), StoreError>;

    fn insert_disbursement(&self, disbursement: &Disbursement) -> Result<(), StoreError>;

    /// IDs of every record of `kind` referencing `client_id`
    fn dependent_ids(&self, kind: DependentKind, client_id: &ClientId) -> Result<Vec<String>, StoreError>;

    fn count_dependents(&self, kind: DependentKind, client_id: &ClientId) -> Result<usize, StoreError>;

    /// Repoint at most `batch_size` records of `kind` from `from` to `to`.
    /// Returns how many rows moved; 0 means nothing references `from` any more.
    fn reassign_dependents(
        &self,
        kind: DependentKind,
        from: &ClientId,
        to: &ClientId,
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    // ---- merge locks -------------------------------------------------------

    /// Lock every id for `lease`, all or nothing.
    /// Fails with `LockHeld` if another unexpired lease holds any of them.
    fn acquire_merge_locks(&self, ids: &[ClientId], lease: &MergeLease) -> Result<(), StoreError>;

    /// Release every lock held by `owner`; returns how many were released
    fn release_merge_locks(&self, owner: &str) -> Result<usize, StoreError>;

    // ---- audit -------------------------------------------------------------

    fn record_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Events for a client, newest first
    fn events_for_client(&self, client_id: &ClientId) -> Result<Vec<Event>, StoreError>;
}
