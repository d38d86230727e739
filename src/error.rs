//! Error types for client identity resolution.
//!
//! The merge taxonomy is deliberately split by what the caller should do next:
//! fix the input, re-propose from fresh data, resubmit the identical plan, or
//! simply retry. A UI must never collapse these into one message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::client::{ClientField, ClientId};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Client {client_id} is locked by another merge ({owner})")]
    LockHeld {
        client_id: ClientId,
        owner: String,
    },

    #[error("Client id {0} was merged away and cannot be reused")]
    IdRetired(ClientId),

    #[error("Client {0} does not exist")]
    MissingClient(ClientId),

    #[error("Client {client_id} is still referenced by {remaining} dependent records")]
    StillReferenced {
        client_id: ClientId,
        remaining: usize,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Malformed plan or profile. Never retry-safe as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("A merge needs at least 2 records, got {count}")]
    TooFewRecords {
        count: usize,
    },

    #[error("Record {0} appears more than once")]
    RepeatedRecord(ClientId),

    #[error("Primary record {0} is not among the records being merged")]
    PrimaryNotInRecords(ClientId),

    #[error("Merge plan has no duplicates")]
    NoDuplicates,

    #[error("Primary record {0} is also listed as a duplicate")]
    PrimaryListedAsDuplicate(ClientId),

    #[error("Required field '{0}' is empty after resolution")]
    MissingRequiredField(ClientField),

    #[error("Client not found: {0}")]
    ClientNotFound(ClientId),

    #[error("Client {id} was already merged into {merged_into}")]
    MergedElsewhere {
        id: ClientId,
        merged_into: ClientId,
    },
}

/// The saga steps of a merge, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStep {
    Validate,
    Lock,
    UpdateCanonical,
    Reassign,
    Verify,
    Delete,
    Release,
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStep::Validate => "validate",
            MergeStep::Lock => "lock",
            MergeStep::UpdateCanonical => "update canonical fields",
            MergeStep::Reassign => "reassign dependents",
            MergeStep::Verify => "verify",
            MergeStep::Delete => "delete duplicates",
            MergeStep::Release => "release locks",
        };
        f.write_str(name)
    }
}

/// What the caller should do after a failed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// The plan itself is wrong; edit it
    FixInput,
    /// Another merge touched these clients; search again with fresh data
    Repropose,
    /// Some steps were applied; resubmit exactly the same plan
    ResubmitSamePlan,
    /// Nothing happened; safe to retry right away
    RetryNow,
}

/// Errors from executing a merge plan.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Invalid merge plan: {0}")]
    Validation(#[from] ValidationError),

    #[error("Merge conflict on client {client_id}: {reason}")]
    Conflict {
        client_id: ClientId,
        reason: String,
    },

    #[error("Merge partially applied (stopped at step '{step}'): {detail}. Resubmit the same plan to finish.")]
    PartialFailure {
        step: MergeStep,
        detail: String,
    },

    #[error("Storage error, nothing was changed: {0}")]
    Storage(#[source] StoreError),
}

impl MergeError {
    pub fn recovery(&self) -> Recovery {
        match self {
            MergeError::Validation(_) => Recovery::FixInput,
            MergeError::Conflict { .. } => Recovery::Repropose,
            MergeError::PartialFailure { .. } => Recovery::ResubmitSamePlan,
            MergeError::Storage(_) => Recovery::RetryNow,
        }
    }

    /// Whether any write may have reached storage
    pub fn mutated_state(&self) -> bool {
        matches!(self, MergeError::PartialFailure { .. })
    }

    pub(crate) fn partial(step: MergeStep, detail: impl fmt::Display) -> Self {
        MergeError::PartialFailure {
            step,
            detail: detail.to_string(),
        }
    }
}

/// Errors from driving a merge workflow through its states.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Cannot {action} while the workflow is {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("No merge plan to submit; review the records first")]
    NoPlan,

    #[error("Invalid merge plan: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}
