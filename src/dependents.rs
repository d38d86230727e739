// 🔗 Dependent Records - everything that points at a client by foreign key
//
// Interactions are contact events, assistance requests hang off an interaction,
// disbursements reference the client directly (and optionally the interaction).
// A merge must carry every one of these over to the surviving client.

use crate::client::ClientId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// DEPENDENT KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentKind {
    Interaction,
    AssistanceRequest,
    Disbursement,
}

impl DependentKind {
    /// Reassignment order: parents before children
    pub const ALL: [DependentKind; 3] = [
        DependentKind::Interaction,
        DependentKind::AssistanceRequest,
        DependentKind::Disbursement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependentKind::Interaction => "interaction",
            DependentKind::AssistanceRequest => "assistance_request",
            DependentKind::Disbursement => "disbursement",
        }
    }

    /// Backing table in the relational store
    pub fn table(&self) -> &'static str {
        match self {
            DependentKind::Interaction => "interactions",
            DependentKind::AssistanceRequest => "assistance_requests",
            DependentKind::Disbursement => "disbursements",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// A contact event (walk-in, phone call, intake form)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub client_id: ClientId,
    pub occurred_at: DateTime<Utc>,
    pub summary: String,
}

impl Interaction {
    pub fn new(client_id: &ClientId, summary: &str) -> Self {
        Interaction {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.clone(),
            occurred_at: Utc::now(),
            summary: summary.to_string(),
        }
    }
}

/// A help request raised during an interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceRequest {
    pub id: String,
    pub client_id: ClientId,
    pub interaction_id: String,
    pub description: String,
}

impl AssistanceRequest {
    pub fn new(interaction: &Interaction, description: &str) -> Self {
        AssistanceRequest {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: interaction.client_id.clone(),
            interaction_id: interaction.id.clone(),
            description: description.to_string(),
        }
    }
}

/// Money or goods handed out to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disbursement {
    pub id: String,
    pub client_id: ClientId,
    pub interaction_id: Option<String>,
    /// Amount in cents (no floating point for ledgers)
    pub amount_cents: i64,
    pub disbursed_at: DateTime<Utc>,
}

impl Disbursement {
    pub fn new(client_id: &ClientId, interaction_id: Option<&str>, amount_cents: i64) -> Self {
        Disbursement {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.clone(),
            interaction_id: interaction_id.map(str::to_string),
            amount_cents,
            disbursed_at: Utc::now(),
        }
    }
}
