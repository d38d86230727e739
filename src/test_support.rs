//! Test fixtures and a fault-injecting store wrapper.

use crate::client::{ClientId, ClientProfile};
use crate::dependents::{AssistanceRequest, DependentKind, Disbursement, Interaction};
use crate::error::StoreError;
use crate::store::{ClientQuery, ClientStore, Event, MergeLease};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Barrier, Mutex};

/// Store operations a test can fail or pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetClient,
    FindClients,
    UpdateClient,
    DeleteClient,
    CountDependents,
    Reassign,
    AcquireLocks,
    ReleaseLocks,
    RecordEvent,
}

struct Pause {
    op: Op,
    reached: Arc<Barrier>,
    resume: Arc<Barrier>,
}

/// Delegates to a real store, failing or pausing on chosen calls
pub struct FaultyStore<'a, S: ClientStore> {
    inner: &'a S,
    calls: Mutex<HashMap<Op, usize>>,
    failures: Mutex<HashMap<Op, usize>>,
    pause: Mutex<Option<Pause>>,
}

impl<'a, S: ClientStore> FaultyStore<'a, S> {
    pub fn new(inner: &'a S) -> Self {
        FaultyStore {
            inner,
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            pause: Mutex::new(None),
        }
    }

    /// Fail the `nth` (1-based) call of `op` made from now on
    pub fn fail_on(&self, op: Op, nth: usize) {
        let already = self.calls.lock().unwrap().get(&op).copied().unwrap_or(0);
        self.failures.lock().unwrap().insert(op, already + nth);
    }

    /// On the first call of `op`: wait on `reached`, then wait on `resume`
    pub fn pause_on(&self, op: Op, reached: Arc<Barrier>, resume: Arc<Barrier>) {
        *self.pause.lock().unwrap() = Some(Pause { op, reached, resume });
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn check(&self, op: Op) -> Result<(), StoreError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(op).or_insert(0);
            *entry += 1;
            *entry
        };

        let pause = {
            let mut slot = self.pause.lock().unwrap();
            if slot.as_ref().is_some_and(|p| p.op == op) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(pause) = pause {
            pause.reached.wait();
            pause.resume.wait();
        }

        if self.failures.lock().unwrap().get(&op) == Some(&count) {
            return Err(StoreError::Unavailable(format!("injected failure on {:?} call {}", op, count)));
        }
        Ok(())
    }
}

impl<'a, S: ClientStore> ClientStore for FaultyStore<'a, S> {
    fn insert_client(&self, client: &ClientProfile) -> Result<(), StoreError> {
        self.inner.insert_client(client)
    }

    fn get_client(&self, id: &ClientId) -> Result<Option<ClientProfile>, StoreError> {
        self.check(Op::GetClient)?;
        self.inner.get_client(id)
    }

    fn merged_into(&self, id: &ClientId) -> Result<Option<ClientId>, StoreError> {
        self.inner.merged_into(id)
    }

    fn find_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        self.check(Op::FindClients)?;
        self.inner.find_clients(query)
    }

    fn find_exact_clients(&self, query: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        self.check(Op::FindClients)?;
        self.inner.find_exact_clients(query)
    }

    fn update_client(&self, client: &ClientProfile) -> Result<bool, StoreError> {
        self.check(Op::UpdateClient)?;
        self.inner.update_client(client)
    }

    fn delete_client(&self, id: &ClientId, merged_into: &ClientId) -> Result<bool, StoreError> {
        self.check(Op::DeleteClient)?;
        self.inner.delete_client(id, merged_into)
    }

    fn insert_interaction(&self, interaction: &Interaction) -> Result<(), StoreError> {
        self.inner.insert_interaction(interaction)
    }

    fn insert_assistance_request(&self, request: &AssistanceRequest) -> Result<(), StoreError> {
        self.inner.insert_assistance_request(request)
    }

    fn insert_disbursement(&self, disbursement: &Disbursement) -> Result<(), StoreError> {
        self.inner.insert_disbursement(disbursement)
    }

    fn dependent_ids(&self, kind: DependentKind, client_id: &ClientId) -> Result<Vec<String>, StoreError> {
        self.inner.dependent_ids(kind, client_id)
    }

    fn count_dependents(&self, kind: DependentKind, client_id: &ClientId) -> Result<usize, StoreError> {
        self.check(Op::CountDependents)?;
        self.inner.count_dependents(kind, client_id)
    }

    fn reassign_dependents(
        &self,
        kind: DependentKind,
        from: &ClientId,
        to: &ClientId,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        self.check(Op::Reassign)?;
        self.inner.reassign_dependents(kind, from, to, batch_size)
    }

    fn acquire_merge_locks(&self, ids: &[ClientId], lease: &MergeLease) -> Result<(), StoreError> {
        self.check(Op::AcquireLocks)?;
        self.inner.acquire_merge_locks(ids, lease)
    }

    fn release_merge_locks(&self, owner: &str) -> Result<usize, StoreError> {
        self.check(Op::ReleaseLocks)?;
        self.inner.release_merge_locks(owner)
    }

    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        self.check(Op::RecordEvent)?;
        self.inner.record_event(event)
    }

    fn events_for_client(&self, client_id: &ClientId) -> Result<Vec<Event>, StoreError> {
        self.inner.events_for_client(client_id)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub fn seed_client<S: ClientStore + ?Sized>(store: &S, first: &str, last: &str) -> ClientProfile {
    let client = ClientProfile::new(first, last);
    store.insert_client(&client).unwrap();
    client
}

/// A reproducible data set that can be loaded into several stores
#[derive(Debug, Clone, Default)]
pub struct Fixture {
    pub clients: Vec<ClientProfile>,
    pub interactions: Vec<Interaction>,
    pub requests: Vec<AssistanceRequest>,
    pub disbursements: Vec<Disbursement>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client with `visits` interactions, each carrying one assistance
    /// request and one disbursement
    pub fn client(&mut self, first: &str, last: &str, visits: usize) -> ClientProfile {
        let client = ClientProfile::new(first, last);
        for i in 0..visits {
            let interaction = Interaction::new(&client.id, &format!("visit {}", i));
            self.requests.push(AssistanceRequest::new(&interaction, "rent help"));
            self.disbursements
                .push(Disbursement::new(&client.id, Some(&interaction.id), 5000));
            self.interactions.push(interaction);
        }
        self.clients.push(client.clone());
        client
    }

    pub fn load<S: ClientStore + ?Sized>(&self, store: &S) {
        for client in &self.clients {
            store.insert_client(client).unwrap();
        }
        for interaction in &self.interactions {
            store.insert_interaction(interaction).unwrap();
        }
        for request in &self.requests {
            store.insert_assistance_request(request).unwrap();
        }
        for disbursement in &self.disbursements {
            store.insert_disbursement(disbursement).unwrap();
        }
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.id.clone()).collect()
    }
}

/// Comparable view of the clients and their dependents
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub clients: BTreeMap<ClientId, Option<ClientProfile>>,
    pub dependents: BTreeMap<(ClientId, DependentKind), Vec<String>>,
}

pub fn snapshot<S: ClientStore + ?Sized>(store: &S, ids: &[ClientId]) -> Snapshot {
    let mut clients = BTreeMap::new();
    let mut dependents = BTreeMap::new();
    for id in ids {
        clients.insert(id.clone(), store.get_client(id).unwrap());
        for kind in DependentKind::ALL {
            dependents.insert((id.clone(), kind), store.dependent_ids(kind, id).unwrap());
        }
    }
    Snapshot { clients, dependents }
}

pub fn total_dependents<S: ClientStore + ?Sized>(store: &S, id: &ClientId) -> usize {
    DependentKind::ALL
        .iter()
        .map(|k| store.count_dependents(*k, id).unwrap())
        .sum()
}
