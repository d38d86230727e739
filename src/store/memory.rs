// In-memory backend
//
// Same contract as the SQLite store, held behind Arc<RwLock<_>> so clones share state
// and any number of threads can call into it. Foreign keys and tombstones are enforced
// by hand.

use super::{ClientQuery, ClientStore, Event, MergeLease};
use crate::client::{normalize_text, ClientId, ClientProfile};
use crate::dependents::{AssistanceRequest, DependentKind, Disbursement, Interaction};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
struct LockRow {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    clients: HashMap<ClientId, ClientProfile>,
    interactions: Vec<Interaction>,
    requests: Vec<AssistanceRequest>,
    disbursements: Vec<Disbursement>,
    tombstones: HashMap<ClientId, ClientId>,
    locks: HashMap<ClientId, LockRow>,
    events: Vec<Event>,
}

impl MemoryState {
    fn require_client(&self, id: &ClientId) -> Result<(), StoreError> {
        if self.clients.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::MissingClient(id.clone()))
        }
    }

    /// Mutable client references of every record of `kind`
    fn client_refs_mut(&mut self, kind: DependentKind) -> Vec<&mut ClientId> {
        match kind {
            DependentKind::Interaction => self.interactions.iter_mut().map(|r| &mut r.client_id).collect(),
            DependentKind::AssistanceRequest => self.requests.iter_mut().map(|r| &mut r.client_id).collect(),
            DependentKind::Disbursement => self.disbursements.iter_mut().map(|r| &mut r.client_id).collect(),
        }
    }

    fn records(&self, kind: DependentKind) -> Vec<(&str, &ClientId)> {
        match kind {
            DependentKind::Interaction => self.interactions.iter().map(|r| (r.id.as_str(), &r.client_id)).collect(),
            DependentKind::AssistanceRequest => self.requests.iter().map(|r| (r.id.as_str(), &r.client_id)).collect(),
            DependentKind::Disbursement => self.disbursements.iter().map(|r| (r.id.as_str(), &r.client_id)).collect(),
        }
    }

    fn count(&self, kind: DependentKind, client_id: &ClientId) -> usize {
        self.records(kind).iter().filter(|(_, c)| *c == client_id).count()
    }
}

/// Shared in-process client registry
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl ClientStore for MemoryStore {
    fn insert_client(&self, client: &ClientProfile) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.tombstones.contains_key(&client.id) {
            return Err(StoreError::IdRetired(client.id.clone()));
        }
        if state.clients.contains_key(&client.id) {
            return Err(StoreError::Unavailable(format!("duplicate client id {}", client.id)));
        }
        state.clients.insert(client.id.clone(), client.clone());
        Ok(())
    }

    fn get_client(&self, id: &ClientId) -> Result<Option<ClientProfile>, StoreError> {
        Ok(self.read()?.clients.get(id).cloned())
    }

    fn merged_into(&self, id: &ClientId) -> Result<Option<ClientId>, StoreError> {
        Ok(self.read()?.tombstones.get(id).cloned())
    }

    fn find_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        if query.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }

        let first = query.first_name.as_deref().map(normalize_text);
        let last = query.last_name.as_deref().map(normalize_text);
        let email = query.email.as_deref().map(normalize_text);

        let state = self.read()?;
        let mut found: Vec<ClientProfile> = state
            .clients
            .values()
            .filter(|c| {
                first.as_ref().is_some_and(|f| normalize_text(&c.first_name).contains(f.as_str()))
                    || last.as_ref().is_some_and(|l| normalize_text(&c.last_name).contains(l.as_str()))
                    || email
                        .as_ref()
                        .is_some_and(|e| c.email.as_deref().map(normalize_text).as_ref() == Some(e))
                    || query.phone_digits.is_some() && c.phone_digits() == query.phone_digits
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(query.limit);
        Ok(found)
    }

    fn find_exact_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        let first = query.first_name.as_deref().map(normalize_text);
        let last = query.last_name.as_deref().map(normalize_text);
        let email = query.email.as_deref().map(normalize_text);
        let same = |wanted: &Option<String>, value: Option<&str>| {
            wanted.is_some() && value.map(normalize_text) == *wanted
        };

        let state = self.read()?;
        let mut found: Vec<ClientProfile> = state
            .clients
            .values()
            .filter(|c| {
                same(&first, Some(c.first_name.as_str()))
                    || same(&last, Some(c.last_name.as_str()))
                    || same(&email, c.email.as_deref())
                    || query.phone_digits.is_some() && c.phone_digits() == query.phone_digits
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    fn update_client(&self, client: &ClientProfile) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.clients.get_mut(&client.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = client.clone();
                existing.created_at = created_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_client(&self, id: &ClientId, merged_into: &ClientId) -> Result<bool, StoreError> {
        let mut state = self.write()?;

        let remaining: usize = DependentKind::ALL.iter().map(|k| state.count(*k, id)).sum();
        if remaining > 0 {
            return Err(StoreError::StillReferenced {
                client_id: id.clone(),
                remaining,
            });
        }

        if state.clients.remove(id).is_none() {
            return Ok(false);
        }
        state.tombstones.insert(id.clone(), merged_into.clone());
        Ok(true)
    }

    fn insert_interaction(&self, interaction: &Interaction) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.require_client(&interaction.client_id)?;
        state.interactions.push(interaction.clone());
        Ok(())
    }

    fn insert_assistance_request(&self, request: &AssistanceRequest) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.require_client(&request.client_id)?;
        state.requests.push(request.clone());
        Ok(())
    }

    fn insert_disbursement(&self, disbursement: &Disbursement) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.require_client(&disbursement.client_id)?;
        state.disbursements.push(disbursement.clone());
        Ok(())
    }

    fn dependent_ids(&self, kind: DependentKind, client_id: &ClientId) -> Result<Vec<String>, StoreError> {
        let state = self.read()?;
        let mut ids: Vec<String> = state
            .records(kind)
            .into_iter()
            .filter(|(_, c)| *c == client_id)
            .map(|(id, _)| id.to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn count_dependents(&self, kind: DependentKind, client_id: &ClientId) -> Result<usize, StoreError> {
        Ok(self.read()?.count(kind, client_id))
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

        let mut state = self.write()?;
        state.require_client(to)?;

        let mut moved = 0;
        for client_ref in state.client_refs_mut(kind) {
            if moved == batch_size {
                break;
            }
            if client_ref == from {
                *client_ref = to.clone();
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn acquire_merge_locks(&self, ids: &[ClientId], lease: &MergeLease) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let now = Utc::now();

        // Check everything first so a refusal takes nothing
        for id in ids {
            if let Some(lock) = state.locks.get(id) {
                if lock.owner != lease.owner && lock.expires_at > now {
                    return Err(StoreError::LockHeld {
                        client_id: id.clone(),
                        owner: lock.owner.clone(),
                    });
                }
            }
        }

        for id in ids {
            state.locks.insert(
                id.clone(),
                LockRow {
                    owner: lease.owner.clone(),
                    expires_at: lease.expires_at,
                },
            );
        }
        Ok(())
    }

    fn release_merge_locks(&self, owner: &str) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let before = state.locks.len();
        state.locks.retain(|_, lock| lock.owner != owner);
        Ok(before - state.locks.len())
    }

    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        self.write()?.events.push(event.clone());
        Ok(())
    }

    fn events_for_client(&self, client_id: &ClientId) -> Result<Vec<Event>, StoreError> {
        let state = self.read()?;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.entity_type == "client" && e.entity_id == client_id.as_str())
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(events)
    }
}
