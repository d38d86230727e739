// SQLite backend (rusqlite)
//
// WAL journal for crash recovery, foreign keys ON so the database itself refuses to
// orphan a dependent record, and a tombstone table so merged-away ids stay retired.

use super::{ClientQuery, ClientStore, Event, MergeLease};
use crate::client::{normalize_text, ClientId, ClientProfile};
use crate::dependents::{AssistanceRequest, DependentKind, Disbursement, Interaction};
use crate::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    /// Throwaway in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Total number of live clients
    pub fn count_clients(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))?;
        Ok(count)
    }

    fn total_references(tx: &Connection, client_id: &ClientId) -> Result<usize, StoreError> {
        let mut total = 0;
        for kind in DependentKind::ALL {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE client_id = ?1", kind.table());
            let count: i64 = tx.query_row(&sql, params![client_id.as_str()], |row| row.get(0))?;
            total += count as usize;
        }
        Ok(total)
    }
}

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // ==========================================================================
    // Clients
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            phone_digits TEXT,
            address TEXT,
            city TEXT,
            state TEXT,
            postal_code TEXT,
            county TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Dependent records (all reference clients by foreign key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS interactions (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL REFERENCES clients(id),
            occurred_at TEXT NOT NULL,
            summary TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assistance_requests (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL REFERENCES clients(id),
            interaction_id TEXT NOT NULL REFERENCES interactions(id),
            description TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS disbursements (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL REFERENCES clients(id),
            interaction_id TEXT REFERENCES interactions(id),
            amount_cents INTEGER NOT NULL,
            disbursed_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Merge bookkeeping: tombstones and advisory locks
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS merged_clients (
            id TEXT PRIMARY KEY,
            merged_into TEXT NOT NULL,
            merged_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_locks (
            client_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            plan_fingerprint TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clients_phone_digits ON clients(phone_digits)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clients_email ON clients(lower(email))",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clients_first_name ON clients(lower(first_name))",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clients_last_name ON clients(lower(last_name))",
        [],
    )?;

    for kind in DependentKind::ALL {
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_client ON {table}(client_id)",
                table = kind.table()
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

impl ClientStore for SqliteStore {
    fn insert_client(&self, client: &ClientProfile) -> Result<(), StoreError> {
        if self.merged_into(&client.id)?.is_some() {
            return Err(StoreError::IdRetired(client.id.clone()));
        }

        self.conn.execute(
            "INSERT INTO clients (
                id, first_name, last_name, email, phone, phone_digits,
                address, city, state, postal_code, county, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                client.id.as_str(),
                client.first_name,
                client.last_name,
                client.email,
                client.phone,
                client.phone_digits(),
                client.address,
                client.city,
                client.state,
                client.postal_code,
                client.county,
                format_timestamp(&client.created_at),
            ],
        )?;

        Ok(())
    }

    fn get_client(&self, id: &ClientId) -> Result<Option<ClientProfile>, StoreError> {
        let client = self
            .conn
            .query_row(
                &format!("SELECT {} FROM clients WHERE id = ?1", CLIENT_COLUMNS),
                params![id.as_str()],
                map_client_row,
            )
            .optional()?;
        Ok(client)
    }

    fn merged_into(&self, id: &ClientId) -> Result<Option<ClientId>, StoreError> {
        let merged_into: Option<String> = self
            .conn
            .query_row(
                "SELECT merged_into FROM merged_clients WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(merged_into.map(ClientId::from))
    }

    fn find_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        if query.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut conditions = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(first) = &query.first_name {
            values.push(like_pattern(first));
            conditions.push(format!("lower(first_name) LIKE ?{} ESCAPE '\\'", values.len()));
        }
        if let Some(last) = &query.last_name {
            values.push(like_pattern(last));
            conditions.push(format!("lower(last_name) LIKE ?{} ESCAPE '\\'", values.len()));
        }
        if let Some(email) = &query.email {
            values.push(email.trim().to_lowercase());
            conditions.push(format!("lower(email) = ?{}", values.len()));
        }
        if let Some(digits) = &query.phone_digits {
            values.push(digits.clone());
            conditions.push(format!("phone_digits = ?{}", values.len()));
        }

        let sql = format!(
            "SELECT {} FROM clients WHERE {} ORDER BY created_at DESC LIMIT {}",
            CLIENT_COLUMNS,
            conditions.join(" OR "),
            query.limit
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let clients = stmt
            .query_map(params_from_iter(values.iter()), map_client_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(clients)
    }

    fn find_exact_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        let mut conditions = Vec::new();
        let mut values: Vec<String> = Vec::new();

        let columns = [
            ("lower(first_name)", query.first_name.as_deref().map(normalize_text)),
            ("lower(last_name)", query.last_name.as_deref().map(normalize_text)),
            ("lower(email)", query.email.as_deref().map(normalize_text)),
            ("phone_digits", query.phone_digits.clone()),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                values.push(value);
                conditions.push(format!("{} = ?{}", column, values.len()));
            }
        }
        if conditions.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM clients WHERE {} ORDER BY created_at DESC",
            CLIENT_COLUMNS,
            conditions.join(" OR ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let clients = stmt
            .query_map(params_from_iter(values.iter()), map_client_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(clients)
    }

    fn update_client(&self, client: &ClientProfile) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE clients
             SET first_name = ?2, last_name = ?3, email = ?4, phone = ?5, phone_digits = ?6,
                 address = ?7, city = ?8, state = ?9, postal_code = ?10, county = ?11
             WHERE id = ?1",
            params![
                client.id.as_str(),
                client.first_name,
                client.last_name,
                client.email,
                client.phone,
                client.phone_digits(),
                client.address,
                client.city,
                client.state,
                client.postal_code,
                client.county,
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_client(&self, id: &ClientId, merged_into: &ClientId) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        let remaining = Self::total_references(&tx, id)?;
        if remaining > 0 {
            return Err(StoreError::StillReferenced {
                client_id: id.clone(),
                remaining,
            });
        }

        let deleted = tx.execute("DELETE FROM clients WHERE id = ?1", params![id.as_str()])?;
        if deleted > 0 {
            tx.execute(
                "INSERT OR IGNORE INTO merged_clients (id, merged_into, merged_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), merged_into.as_str(), format_timestamp(&Utc::now())],
            )?;
        }

        tx.commit()?;
        Ok(deleted > 0)
    }

    fn insert_interaction(&self, interaction: &Interaction) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO interactions (id, client_id, occurred_at, summary) VALUES (?1, ?2, ?3, ?4)",
            params![
                interaction.id,
                interaction.client_id.as_str(),
                format_timestamp(&interaction.occurred_at),
                interaction.summary,
            ],
        )?;
        Ok(())
    }

    fn insert_assistance_request(&self, request: &AssistanceRequest) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO assistance_requests (id, client_id, interaction_id, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                request.id,
                request.client_id.as_str(),
                request.interaction_id,
                request.description,
            ],
        )?;
        Ok(())
    }

    fn insert_disbursement(&self, disbursement: &Disbursement) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO disbursements (id, client_id, interaction_id, amount_cents, disbursed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                disbursement.id,
                disbursement.client_id.as_str(),
                disbursement.interaction_id,
                disbursement.amount_cents,
                format_timestamp(&disbursement.disbursed_at),
            ],
        )?;
        Ok(())
    }

    fn dependent_ids(&self, kind: DependentKind, client_id: &ClientId) -> Result<Vec<String>, StoreError> {
        let sql = format!("SELECT id FROM {} WHERE client_id = ?1 ORDER BY id", kind.table());
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![client_id.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn count_dependents(&self, kind: DependentKind, client_id: &ClientId) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE client_id = ?1", kind.table());
        let count: i64 = self
            .conn
            .query_row(&sql, params![client_id.as_str()], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn reassign_dependents(
        &self,
        kind: DependentKind,
        from: &ClientId,
        to: &ClientId,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        if from == to || batch_size == 0 {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {table} SET client_id = ?1
             WHERE rowid IN (SELECT rowid FROM {table} WHERE client_id = ?2 LIMIT {batch})",
            table = kind.table(),
            batch = batch_size
        );
        let moved = self.conn.execute(&sql, params![to.as_str(), from.as_str()])?;
        Ok(moved)
    }

    fn acquire_merge_locks(&self, ids: &[ClientId], lease: &MergeLease) -> Result<(), StoreError> {
        // IMMEDIATE: take the write lock up front so two acquirers serialize
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let now = Utc::now();

        for id in ids {
            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT owner, expires_at FROM merge_locks WHERE client_id = ?1",
                    params![id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((owner, expires_at)) = existing {
                let expires_at = parse_timestamp(1, &expires_at)?;
                if owner != lease.owner && expires_at > now {
                    // Dropping `tx` rolls back anything taken so far
                    return Err(StoreError::LockHeld {
                        client_id: id.clone(),
                        owner,
                    });
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO merge_locks
                    (client_id, owner, plan_fingerprint, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.as_str(),
                    lease.owner,
                    lease.plan_fingerprint,
                    format_timestamp(&lease.acquired_at),
                    format_timestamp(&lease.expires_at),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn release_merge_locks(&self, owner: &str) -> Result<usize, StoreError> {
        let released = self
            .conn
            .execute("DELETE FROM merge_locks WHERE owner = ?1", params![owner])?;
        Ok(released)
    }

    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        let data_json = serde_json::to_string(&event.data)?;

        self.conn.execute(
            "INSERT INTO events (
                event_id, timestamp, event_type, entity_type, entity_id, data, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id,
                format_timestamp(&event.timestamp),
                event.event_type,
                event.entity_type,
                event.entity_id,
                data_json,
                event.actor,
            ],
        )?;

        Ok(())
    }

    fn events_for_client(&self, client_id: &ClientId) -> Result<Vec<Event>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = 'client' AND entity_id = ?1
             ORDER BY timestamp DESC",
        )?;

        let events = stmt
            .query_map(params![client_id.as_str()], |row| {
                let timestamp_str: String = row.get(1)?;
                let data_json: String = row.get(5)?;

                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(1, &timestamp_str)?,
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    data: serde_json::from_str(&data_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                    })?,
                    actor: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

// ============================================================================
// ROW HELPERS
// ============================================================================

const CLIENT_COLUMNS: &str = "id, first_name, last_name, email, phone, address, city, state, \
                              postal_code, county, created_at";

fn map_client_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientProfile> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(10)?;

    Ok(ClientProfile {
        id: ClientId::from(id),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        address: row.get(5)?,
        city: row.get(6)?,
        state: row.get(7)?,
        postal_code: row.get(8)?,
        county: row.get(9)?,
        created_at: parse_timestamp(10, &created_at)?,
    })
}

/// Fixed-width RFC 3339 so text ordering equals time ordering
fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Case-insensitive substring pattern with LIKE wildcards escaped
fn like_pattern(value: &str) -> String {
    let escaped = value
        .trim()
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

// ============================================================================
// TESTS
// ============================================================================
