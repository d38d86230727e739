// Client Identity Resolution - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod client;       // Client records + CSV import
pub mod config;
pub mod dependents;   // Interactions, assistance requests, disbursements
pub mod error;
pub mod executor;     // Merge saga
pub mod matching;     // Weighted match scoring
pub mod planner;      // Canonical field resolution
pub mod search;       // Candidate search
pub mod service;      // Facade + merge workflow state machine
pub mod store;        // Storage trait, SQLite and in-memory backends

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use client::{load_clients_csv, ClientField, ClientId, ClientProfile, PartialClientProfile};
pub use config::{MergeConfig, ResolutionConfig, SearchConfig};
pub use dependents::{AssistanceRequest, DependentKind, Disbursement, Interaction};
pub use error::{MergeError, MergeStep, Recovery, StoreError, ValidationError, WorkflowError};
pub use executor::{MergeExecutor, MergeResult};
pub use matching::{MatchRule, MatchScorer, ScoreBreakdown};
pub use planner::{CanonicalFields, MergePlan, MergePlanner};
pub use search::{CandidateSearch, MatchCandidate, SearchResults, SearchStatus};
pub use service::{IdentityResolutionService, MergeWorkflow, WorkflowState};
pub use store::{
    setup_database, ClientQuery, ClientStore, Event, MemoryStore, MergeLease, SqliteStore, MAX_LOCK_TTL_SECS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
