// 🧭 Identity Resolution Service - the one entry point for every calling flow
//
// Intake triage, new-client creation and the client-search merge screen all go through
// here. The service composes search → planner → executor; `MergeWorkflow` holds the
// only mutable state (which records the reviewer picked, which primary, which edits).
//
// Proposed ──begin_review──▶ Reviewing ──submit──▶ Executing ──▶ Completed
//                               ▲                    │
//                               │                    ├─ partial ──▶ Failed ──submit──▶ Executing
//                               │                    ├─ validation/storage ─▶ Reviewing (Failed if resubmitted)
//     Proposed ◀────────────────┼────────────────────┴─ conflict
//
// Proposed never goes straight to Executing; a reviewer has to pick the records.

use crate::client::{ClientField, ClientId, ClientProfile, PartialClientProfile};
use crate::config::ResolutionConfig;
use crate::dependents::DependentKind;
use crate::error::{MergeError, MergeStep, StoreError, ValidationError, WorkflowError};
use crate::executor::{MergeExecutor, MergeResult};
use crate::planner::{MergePlan, MergePlanner};
use crate::search::{CandidateSearch, MatchCandidate, SearchResults, SearchStatus};
use crate::store::ClientStore;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

// ============================================================================
// WORKFLOW STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowState {
    /// Candidates found; waiting for a reviewer
    Proposed,

    /// A reviewer is choosing the primary and editing fields
    Reviewing,

    Executing,

    Completed(MergeResult),

    /// Some steps were applied; only the identical plan may be resubmitted
    Failed {
        step: MergeStep,
        detail: String,
        plan_fingerprint: String,
    },
}

impl WorkflowState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowState::Proposed => "proposed",
            WorkflowState::Reviewing => "reviewing",
            WorkflowState::Executing => "executing",
            WorkflowState::Completed(_) => "completed",
            WorkflowState::Failed { .. } => "failed",
        }
    }
}

// ============================================================================
// MERGE WORKFLOW
// ============================================================================

/// One merge decision, from proposed candidates to a finished merge
#[derive(Debug, Clone)]
pub struct MergeWorkflow {
    search: SearchResults,
    records: Vec<ClientProfile>,
    primary_id: Option<ClientId>,
    overrides: BTreeMap<ClientField, String>,
    plan: Option<MergePlan>,
    state: WorkflowState,
}

impl MergeWorkflow {
    pub fn proposed(search: SearchResults) -> Self {
        MergeWorkflow {
            search,
            records: Vec::new(),
            primary_id: None,
            overrides: BTreeMap::new(),
            plan: None,
            state: WorkflowState::Proposed,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn candidates(&self) -> &[MatchCandidate] {
        &self.search.candidates
    }

    pub fn search_status(&self) -> &SearchStatus {
        &self.search.status
    }

    pub fn plan(&self) -> Option<&MergePlan> {
        self.plan.as_ref()
    }

    /// Reviewer picked the records to merge and the one to keep.
    /// Enters `Reviewing` even when the first plan is invalid, so it can be fixed.
    pub fn begin_review(
        &mut self,
        records: Vec<ClientProfile>,
        primary_id: ClientId,
    ) -> Result<&MergePlan, WorkflowError> {
        match self.state {
            WorkflowState::Proposed | WorkflowState::Reviewing => {}
            _ => return Err(self.invalid("begin review")),
        }

        self.state = WorkflowState::Reviewing;
        self.records = records;
        self.primary_id = Some(primary_id);
        self.overrides.clear();
        self.replan()
    }

    pub fn set_primary(&mut self, primary_id: ClientId) -> Result<&MergePlan, WorkflowError> {
        self.require_reviewing("change the primary")?;
        self.primary_id = Some(primary_id);
        self.replan()
    }

    /// Pin a field to a reviewer-chosen value. A blank value clears the field.
    pub fn override_field(&mut self, field: ClientField, value: &str) -> Result<&MergePlan, WorkflowError> {
        self.require_reviewing("edit fields")?;
        self.overrides.insert(field, value.to_string());
        self.replan()
    }

    fn replan(&mut self) -> Result<&MergePlan, WorkflowError> {
        self.plan = None;
        let primary_id = self.primary_id.as_ref().ok_or(WorkflowError::NoPlan)?;
        let plan = MergePlanner::plan(&self.records, primary_id, &self.overrides)?;
        Ok(self.plan.insert(plan))
    }

    fn require_reviewing(&self, action: &'static str) -> Result<(), WorkflowError> {
        if self.state == WorkflowState::Reviewing {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> WorkflowError {
        WorkflowError::InvalidTransition {
            state: self.state.name(),
            action,
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct IdentityResolutionService<'a, S: ClientStore + ?Sized> {
    store: &'a S,
    config: ResolutionConfig,
}

impl<'a, S: ClientStore + ?Sized> IdentityResolutionService<'a, S> {
    pub fn new(store: &'a S, config: ResolutionConfig) -> Self {
        IdentityResolutionService { store, config }
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    pub fn propose_matches(&self, profile: &PartialClientProfile, exclude_ids: &HashSet<ClientId>) -> SearchResults {
        CandidateSearch::new(self.store, self.config.search.clone()).search(profile, exclude_ids)
    }

    pub fn create_merge_plan(
        &self,
        records: &[ClientProfile],
        primary_id: &ClientId,
        overrides: &BTreeMap<ClientField, String>,
    ) -> Result<MergePlan, ValidationError> {
        MergePlanner::plan(records, primary_id, overrides)
    }

    pub fn execute_merge(&self, plan: &MergePlan) -> Result<MergeResult, MergeError> {
        MergeExecutor::new(self.store, self.config.merge.clone()).execute(plan)
    }

    /// Fetch records in the order given; an unknown or merged-away id is not found
    pub fn load_clients(&self, ids: &[ClientId]) -> Result<Vec<ClientProfile>, MergeError> {
        let mut clients = Vec::with_capacity(ids.len());
        for id in ids {
            let client = self
                .store
                .get_client(id)
                .map_err(MergeError::Storage)?
                .ok_or_else(|| ValidationError::ClientNotFound(id.clone()))?;
            clients.push(client);
        }
        Ok(clients)
    }

    /// IDs of every interaction, assistance request and disbursement that
    /// references `id`, keyed by kind
    pub fn dependent_records(&self, id: &ClientId) -> Result<BTreeMap<DependentKind, Vec<String>>, StoreError> {
        DependentKind::ALL
            .iter()
            .map(|kind| Ok((*kind, self.store.dependent_ids(*kind, id)?)))
            .collect()
    }

    /// Search and open a workflow on the results
    pub fn start_workflow(&self, profile: &PartialClientProfile, exclude_ids: &HashSet<ClientId>) -> MergeWorkflow {
        MergeWorkflow::proposed(self.propose_matches(profile, exclude_ids))
    }

    /// Execute the workflow's current plan.
    ///
    /// Allowed from `Reviewing` (with a valid plan) or from `Failed`, where the
    /// plan is frozen so a resubmission is always the identical plan.
    pub fn submit(&self, workflow: &mut MergeWorkflow) -> Result<MergeResult, WorkflowError> {
        match workflow.state {
            WorkflowState::Reviewing | WorkflowState::Failed { .. } => {}
            _ => return Err(workflow.invalid("submit")),
        }
        let plan = workflow.plan.clone().ok_or(WorkflowError::NoPlan)?;

        // Step reached by the earlier partial run, if this is a resubmission
        let resumed_step = match &workflow.state {
            WorkflowState::Failed { step, plan_fingerprint, .. } => {
                if *plan_fingerprint != plan.fingerprint() {
                    return Err(workflow.invalid("submit a different plan"));
                }
                info!(primary = %plan.primary_id, "Resubmitting partially applied merge");
                Some(*step)
            }
            _ => None,
        };

        workflow.state = WorkflowState::Executing;
        match self.execute_merge(&plan) {
            Ok(result) => {
                workflow.state = WorkflowState::Completed(result.clone());
                Ok(result)
            }
            Err(e) => {
                workflow.state = match &e {
                    MergeError::PartialFailure { step, detail } => WorkflowState::Failed {
                        step: *step,
                        detail: detail.clone(),
                        plan_fingerprint: plan.fingerprint(),
                    },
                    MergeError::Conflict { .. } => {
                        // Stale selection: start over from fresh candidates
                        workflow.records.clear();
                        workflow.primary_id = None;
                        workflow.overrides.clear();
                        workflow.plan = None;
                        WorkflowState::Proposed
                    }
                    // The store still holds the earlier partial merge: stay frozen
                    MergeError::Validation(_) | MergeError::Storage(_) => match resumed_step {
                        Some(step) => WorkflowState::Failed {
                            step,
                            detail: e.to_string(),
                            plan_fingerprint: plan.fingerprint(),
                        },
                        None => WorkflowState::Reviewing,
                    },
                };
                warn!(state = workflow.state.name(), error = %e, "Merge workflow submission failed");
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MergeLease};
    use crate::test_support::{total_dependents, FaultyStore, Fixture, Op};

    fn setup() -> (MemoryStore, Fixture, ClientProfile, ClientProfile) {
        let mut fixture = Fixture::new();
        let kept = fixture.client("Maria", "Garcia", 2);
        let dup = fixture.client("Maria", "Garcia", 1);
        let store = MemoryStore::new();
        fixture.load(&store);
        (store, fixture, kept, dup)
    }

    fn maria() -> PartialClientProfile {
        PartialClientProfile::new()
            .with(ClientField::FirstName, "maria")
            .with(ClientField::LastName, "garcia")
    }

    #[test]
    fn test_full_workflow_reaches_completed() {
        let (store, _, kept, dup) = setup();
        let service = IdentityResolutionService::new(&store, ResolutionConfig::default());

        let mut workflow = service.start_workflow(&maria(), &HashSet::new());
        assert_eq!(workflow.state(), &WorkflowState::Proposed);
        assert_eq!(workflow.candidates().len(), 2);

        let records = service.load_clients(&[kept.id.clone(), dup.id.clone()]).unwrap();
        workflow.begin_review(records, kept.id.clone()).unwrap();
        let plan = workflow
            .override_field(ClientField::Email, "maria@example.org")
            .unwrap();
        assert_eq!(plan.canonical_fields[&ClientField::Email], "maria@example.org");

        let result = service.submit(&mut workflow).unwrap();

        assert!(matches!(workflow.state(), WorkflowState::Completed(_)));
        assert_eq!(result.deleted_ids, vec![dup.id.clone()]);
        assert_eq!(total_dependents(&store, &kept.id), 9);
        assert!(matches!(
            service.submit(&mut workflow),
            Err(WorkflowError::InvalidTransition { state: "completed", .. })
        ));
    }

    #[test]
    fn test_proposed_cannot_execute_directly() {
        let (store, fixture, _, _) = setup();
        let service = IdentityResolutionService::new(&store, ResolutionConfig::default());
        let mut workflow = service.start_workflow(&maria(), &HashSet::new());

        let err = service.submit(&mut workflow).unwrap_err();

        assert!(matches!(err, WorkflowError::InvalidTransition { state: "proposed", .. }));
        assert_eq!(workflow.state(), &WorkflowState::Proposed);
        for id in fixture.ids() {
            assert!(store.get_client(&id).unwrap().is_some());
        }
    }

    #[test]
    fn test_invalid_selection_stays_in_review_until_fixed() {
        let (store, _, kept, dup) = setup();
        let service = IdentityResolutionService::new(&store, ResolutionConfig::default());
        let mut workflow = service.start_workflow(&maria(), &HashSet::new());

        let stranger = ClientId::new();
        let err = workflow
            .begin_review(vec![kept.clone(), dup.clone()], stranger)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid(ValidationError::PrimaryNotInRecords(_))));
        assert_eq!(workflow.state(), &WorkflowState::Reviewing);
        assert!(matches!(service.submit(&mut workflow), Err(WorkflowError::NoPlan)));

        workflow.set_primary(dup.id.clone()).unwrap();
        let result = service.submit(&mut workflow).unwrap();
        assert_eq!(result.primary_id, dup.id);
    }

    #[test]
    fn test_partial_failure_allows_only_identical_resubmission() {
        let (store, _, kept, dup) = setup();
        let faulty = FaultyStore::new(&store);
        faulty.fail_on(Op::DeleteClient, 1);
        let service = IdentityResolutionService::new(&faulty, ResolutionConfig::default());
        let mut workflow = service.start_workflow(&maria(), &HashSet::new());
        workflow.begin_review(vec![kept.clone(), dup.clone()], kept.id.clone()).unwrap();

        let err = service.submit(&mut workflow).unwrap_err();
        assert!(matches!(err, WorkflowError::Merge(MergeError::PartialFailure { .. })));
        assert!(matches!(workflow.state(), WorkflowState::Failed { step: MergeStep::Delete, .. }));

        // The plan is frozen while failed
        assert!(workflow.override_field(ClientField::City, "Decatur").is_err());
        assert!(workflow.set_primary(dup.id.clone()).is_err());

        let result = service.submit(&mut workflow).unwrap();
        assert!(matches!(workflow.state(), WorkflowState::Completed(_)));
        assert_eq!(result.deleted_ids, vec![dup.id.clone()]);
        assert_eq!(store.count_dependents(DependentKind::Interaction, &kept.id).unwrap(), 3);
    }

    #[test]
    fn test_storage_error_on_resubmission_keeps_workflow_failed() {
        let (store, _, kept, dup) = setup();
        let faulty = FaultyStore::new(&store);
        faulty.fail_on(Op::DeleteClient, 1);
        let service = IdentityResolutionService::new(&faulty, ResolutionConfig::default());
        let mut workflow = service.start_workflow(&maria(), &HashSet::new());
        workflow.begin_review(vec![kept.clone(), dup.clone()], kept.id.clone()).unwrap();
        let fingerprint = workflow.plan().unwrap().fingerprint();

        assert!(service.submit(&mut workflow).is_err());
        faulty.fail_on(Op::AcquireLocks, 1);
        let err = service.submit(&mut workflow).unwrap_err();

        assert!(matches!(err, WorkflowError::Merge(MergeError::Storage(_))));
        match workflow.state() {
            WorkflowState::Failed { step, plan_fingerprint, .. } => {
                assert_eq!(*step, MergeStep::Delete);
                assert_eq!(*plan_fingerprint, fingerprint);
            }
            other => panic!("expected failed, got {}", other.name()),
        }
        assert!(workflow.set_primary(dup.id.clone()).is_err());
        assert!(workflow.override_field(ClientField::City, "Decatur").is_err());

        let result = service.submit(&mut workflow).unwrap();
        assert_eq!(result.deleted_ids, vec![dup.id.clone()]);
        assert!(matches!(workflow.state(), WorkflowState::Completed(_)));
    }

    #[test]
    fn test_conflict_returns_workflow_to_proposed() {
        let (store, _, kept, dup) = setup();
        let service = IdentityResolutionService::new(&store, ResolutionConfig::default());
        let mut workflow = service.start_workflow(&maria(), &HashSet::new());
        workflow.begin_review(vec![kept.clone(), dup.clone()], kept.id.clone()).unwrap();

        store
            .acquire_merge_locks(&[dup.id.clone()], &MergeLease::new("other", 60))
            .unwrap();
        let err = service.submit(&mut workflow).unwrap_err();

        assert!(matches!(err, WorkflowError::Merge(MergeError::Conflict { .. })));
        assert_eq!(workflow.state(), &WorkflowState::Proposed);
        assert!(workflow.plan().is_none());
    }

    #[test]
    fn test_storage_failure_returns_to_review_with_plan() {
        let (store, _, kept, dup) = setup();
        let faulty = FaultyStore::new(&store);
        let service = IdentityResolutionService::new(&faulty, ResolutionConfig::default());
        let mut workflow = service.start_workflow(&maria(), &HashSet::new());
        workflow.begin_review(vec![kept.clone(), dup.clone()], kept.id.clone()).unwrap();

        faulty.fail_on(Op::AcquireLocks, 1);
        let err = service.submit(&mut workflow).unwrap_err();

        assert!(matches!(err, WorkflowError::Merge(MergeError::Storage(_))));
        assert_eq!(workflow.state(), &WorkflowState::Reviewing);
        assert!(workflow.plan().is_some());
        assert!(service.submit(&mut workflow).is_ok());
    }

    #[test]
    fn test_failed_search_still_opens_a_workflow() {
        let (store, _, _, _) = setup();
        let faulty = FaultyStore::new(&store);
        faulty.fail_on(Op::FindClients, 1);
        let service = IdentityResolutionService::new(&faulty, ResolutionConfig::default());

        let workflow = service.start_workflow(&maria(), &HashSet::new());

        assert!(matches!(workflow.search_status(), SearchStatus::Failed { .. }));
        assert!(workflow.candidates().is_empty());
    }

    #[test]
    fn test_load_clients_reports_missing_ids() {
        let (store, _, kept, _) = setup();
        let service = IdentityResolutionService::new(&store, ResolutionConfig::default());

        let missing = ClientId::new();
        let err = service.load_clients(&[kept.id.clone(), missing.clone()]).unwrap_err();

        assert!(matches!(err, MergeError::Validation(ValidationError::ClientNotFound(id)) if id == missing));
    }

    #[test]
    fn test_dependent_records_follow_the_merge() {
        let (store, _, kept, dup) = setup();
        let service = IdentityResolutionService::new(&store, ResolutionConfig::default());

        let before = service.dependent_records(&dup.id).unwrap();
        assert_eq!(before.len(), DependentKind::ALL.len());
        assert!(before.values().all(|ids| ids.len() == 1));

        let records = service.load_clients(&[kept.id.clone(), dup.id.clone()]).unwrap();
        let plan = service.create_merge_plan(&records, &kept.id, &BTreeMap::new()).unwrap();
        service.execute_merge(&plan).unwrap();

        let after = service.dependent_records(&kept.id).unwrap();
        assert!(after.values().all(|ids| ids.len() == 3));
        for (kind, ids) in &before {
            assert!(ids.iter().all(|id| after[kind].contains(id)));
        }
        assert!(service.dependent_records(&dup.id).unwrap().values().all(Vec::is_empty));
    }
}
