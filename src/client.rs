// 👤 Client Profile - Stable identity + identity attributes
//
// "The client ID is IDENTITY (never changes, never reused), the name/phone/address are VALUES"
//
// A ClientProfile is what storage holds. A PartialClientProfile is what the intake forms,
// the new-client form and the barcode reader produce: any subset of the same attributes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// CLIENT ID
// ============================================================================

/// Opaque, stable client identifier (UUID v4 rendered as text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Mint a fresh identifier
    pub fn new() -> Self {
        ClientId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        ClientId(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        ClientId(value)
    }
}

// ============================================================================
// CLIENT FIELD
// ============================================================================

/// Identity attributes a reviewer can see, compare and override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientField {
    FirstName,
    LastName,
    Email,
    Phone,
    Address,
    City,
    State,
    PostalCode,
    County,
}

impl ClientField {
    /// Every field, in display order
    pub const ALL: [ClientField; 9] = [
        ClientField::FirstName,
        ClientField::LastName,
        ClientField::Email,
        ClientField::Phone,
        ClientField::Address,
        ClientField::City,
        ClientField::State,
        ClientField::PostalCode,
        ClientField::County,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientField::FirstName => "first_name",
            ClientField::LastName => "last_name",
            ClientField::Email => "email",
            ClientField::Phone => "phone",
            ClientField::Address => "address",
            ClientField::City => "city",
            ClientField::State => "state",
            ClientField::PostalCode => "postal_code",
            ClientField::County => "county",
        }
    }

    /// First and last name must survive every merge
    pub fn is_required(&self) -> bool {
        matches!(self, ClientField::FirstName | ClientField::LastName)
    }
}

impl fmt::Display for ClientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientField {
    type Err = String;

    /// Accepts the snake_case column names plus the short forms the CLI uses
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first_name" | "first" | "firstname" => Ok(ClientField::FirstName),
            "last_name" | "last" | "lastname" => Ok(ClientField::LastName),
            "email" => Ok(ClientField::Email),
            "phone" => Ok(ClientField::Phone),
            "address" | "street" | "street_address" => Ok(ClientField::Address),
            "city" => Ok(ClientField::City),
            "state" => Ok(ClientField::State),
            "postal_code" | "zip" | "zipcode" => Ok(ClientField::PostalCode),
            "county" => Ok(ClientField::County),
            other => Err(format!("Unknown client field: {}", other)),
        }
    }
}

// ============================================================================
// PARTIAL PROFILE (query side)
// ============================================================================

/// Any subset of identity attributes, as captured from a form or a scanned ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialClientProfile {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
}

impl PartialClientProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, field: ClientField, value: &str) -> Self {
        self.set(field, Some(value.to_string()));
        self
    }

    pub fn set(&mut self, field: ClientField, value: Option<String>) {
        let slot = match field {
            ClientField::FirstName => &mut self.first_name,
            ClientField::LastName => &mut self.last_name,
            ClientField::Email => &mut self.email,
            ClientField::Phone => &mut self.phone,
            ClientField::Address => &mut self.address,
            ClientField::City => &mut self.city,
            ClientField::State => &mut self.state,
            ClientField::PostalCode => &mut self.postal_code,
            ClientField::County => &mut self.county,
        };
        *slot = value;
    }

    /// Trimmed value, `None` when missing or blank
    pub fn get(&self, field: ClientField) -> Option<&str> {
        let value = match field {
            ClientField::FirstName => &self.first_name,
            ClientField::LastName => &self.last_name,
            ClientField::Email => &self.email,
            ClientField::Phone => &self.phone,
            ClientField::Address => &self.address,
            ClientField::City => &self.city,
            ClientField::State => &self.state,
            ClientField::PostalCode => &self.postal_code,
            ClientField::County => &self.county,
        };
        non_blank(value.as_deref())
    }

    /// True when no field carries a value
    pub fn is_empty(&self) -> bool {
        ClientField::ALL.iter().all(|f| self.get(*f).is_none())
    }
}

// ============================================================================
// CLIENT PROFILE (stored side)
// ============================================================================

/// A persisted client record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    /// Stable identity - NEVER changes, never reused after a merge deletes it
    pub id: ClientId,

    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub county: Option<String>,

    /// When the record was created (newest wins ties in candidate ranking)
    pub created_at: DateTime<Utc>,
}

impl ClientProfile {
    /// Create new client with a fresh ID
    pub fn new(first_name: &str, last_name: &str) -> Self {
        ClientProfile {
            id: ClientId::new(),
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            email: None,
            phone: None,
            address: None,
            city: None,
            state: None,
            postal_code: None,
            county: None,
            created_at: Utc::now(),
        }
    }

    /// Build a client from a partial profile; `None` without both names
    pub fn from_partial(partial: &PartialClientProfile) -> Option<Self> {
        let first = partial.get(ClientField::FirstName)?;
        let last = partial.get(ClientField::LastName)?;

        let mut client = ClientProfile::new(first, last);
        for field in ClientField::ALL.iter().filter(|f| !f.is_required()) {
            client.set(*field, partial.get(*field).map(str::to_string));
        }
        Some(client)
    }

    /// Builder-style setter for optional attributes
    pub fn with(mut self, field: ClientField, value: &str) -> Self {
        self.set(field, Some(value.to_string()));
        self
    }

    /// Set an attribute. Names are never cleared: `None` leaves them untouched.
    pub fn set(&mut self, field: ClientField, value: Option<String>) {
        let value = value.and_then(|v| non_blank(Some(&v)).map(str::to_string));
        match field {
            ClientField::FirstName => {
                if let Some(v) = value {
                    self.first_name = v;
                }
            }
            ClientField::LastName => {
                if let Some(v) = value {
                    self.last_name = v;
                }
            }
            ClientField::Email => self.email = value,
            ClientField::Phone => self.phone = value,
            ClientField::Address => self.address = value,
            ClientField::City => self.city = value,
            ClientField::State => self.state = value,
            ClientField::PostalCode => self.postal_code = value,
            ClientField::County => self.county = value,
        }
    }

    /// Trimmed value, `None` when missing or blank
    pub fn get(&self, field: ClientField) -> Option<&str> {
        match field {
            ClientField::FirstName => non_blank(Some(&self.first_name)),
            ClientField::LastName => non_blank(Some(&self.last_name)),
            ClientField::Email => non_blank(self.email.as_deref()),
            ClientField::Phone => non_blank(self.phone.as_deref()),
            ClientField::Address => non_blank(self.address.as_deref()),
            ClientField::City => non_blank(self.city.as_deref()),
            ClientField::State => non_blank(self.state.as_deref()),
            ClientField::PostalCode => non_blank(self.postal_code.as_deref()),
            ClientField::County => non_blank(self.county.as_deref()),
        }
    }

    /// "First Last" for display
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Digits of the phone number, if any
    pub fn phone_digits(&self) -> Option<String> {
        self.phone.as_deref().map(phone_digits).filter(|d| !d.is_empty())
    }
}

// ============================================================================
// CSV IMPORT
// ============================================================================

/// One row of a client roster export
#[derive(Debug, Clone, Deserialize)]
pub struct ClientCsvRow {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
}

impl From<ClientCsvRow> for PartialClientProfile {
    fn from(row: ClientCsvRow) -> Self {
        PartialClientProfile {
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            phone: row.phone,
            address: row.address,
            city: row.city,
            state: row.state,
            postal_code: row.postal_code,
            county: row.county,
        }
    }
}

/// Load client profiles from CSV.
/// Returns (clients, skipped) where skipped counts rows missing a first or last name.
pub fn load_clients_csv(csv_path: &Path) -> Result<(Vec<ClientProfile>, usize)> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut clients = Vec::new();
    let mut skipped = 0;

    for result in rdr.deserialize() {
        let row: ClientCsvRow = result.context("Failed to deserialize client row")?;
        match ClientProfile::from_partial(&row.into()) {
            Some(client) => clients.push(client),
            None => skipped += 1,
        }
    }

    Ok((clients, skipped))
}

// ============================================================================
// NORMALIZATION HELPERS
// ============================================================================

/// Trim and lowercase for case-insensitive comparison
pub fn normalize_text(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Strip formatting punctuation: "(404) 555-1234" → "4045551234"
pub fn phone_digits(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// TESTS
// ============================================================================
