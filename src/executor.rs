// ⚙️ Merge Executor - apply a merge plan as a resumable saga
//
// No dependent record may be lost, duplicated, or left pointing at a deleted client,
// even under partial failure or repeated execution of the same plan.
//
// Steps (each idempotent, the only destructive one last):
//   1. validate      - plan shape + existence, zero side effects
//   2. lock          - per-id advisory lock, all or nothing → ConflictError
//   3. canonical     - write resolved fields onto the primary
//   4. reassign      - repoint dependents of every duplicate, in bounded batches
//   5. verify        - re-read: zero dependents left on any duplicate
//   6. delete        - remove duplicates (tombstoned as merged into the primary)
//   7. release       - drop the locks
//
// Interrupted after 4 → duplicates exist but are childless. Resubmitting the same
// plan re-runs 3-5 as no-ops and finishes 6.

use crate::client::ClientId;
use crate::config::MergeConfig;
use crate::dependents::DependentKind;
use crate::error::{MergeError, MergeStep, StoreError, ValidationError};
use crate::planner::MergePlan;
use crate::store::{ClientStore, Event, MergeLease};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// ============================================================================
// MERGE RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub primary_id: ClientId,

    /// Duplicates deleted by this execution
    pub deleted_ids: Vec<ClientId>,

    /// Dependents repointed by this execution, per record type
    pub reassigned_counts: BTreeMap<DependentKind, usize>,

    /// True when every duplicate had already been merged into the primary
    pub already_merged: bool,
}

impl MergeResult {
    fn new(primary_id: &ClientId) -> Self {
        MergeResult {
            primary_id: primary_id.clone(),
            deleted_ids: Vec::new(),
            reassigned_counts: DependentKind::ALL.iter().map(|k| (*k, 0)).collect(),
            already_merged: false,
        }
    }

    pub fn total_reassigned(&self) -> usize {
        self.reassigned_counts.values().sum()
    }
}

// ============================================================================
// MERGE EXECUTOR
// ============================================================================

pub struct MergeExecutor<'a, S: ClientStore + ?Sized> {
    store: &'a S,
    config: MergeConfig,
}

impl<'a, S: ClientStore + ?Sized> MergeExecutor<'a, S> {
    pub fn new(store: &'a S, config: MergeConfig) -> Self {
        MergeExecutor { store, config }
    }

    pub fn execute(&self, plan: &MergePlan) -> Result<MergeResult, MergeError> {
        let fingerprint = plan.fingerprint();
        info!(
            primary = %plan.primary_id,
            duplicates = plan.duplicate_ids.len(),
            plan = %short(&fingerprint),
            "Executing merge plan"
        );

        // 1. Validate
        plan.validate_shape()?;
        let pending = self.pending_duplicates(plan)?;
        if pending.is_empty() {
            info!(primary = %plan.primary_id, "Plan already applied; nothing to do");
            let mut result = MergeResult::new(&plan.primary_id);
            result.already_merged = true;
            return Ok(result);
        }

        // 2. Lock
        let lease = MergeLease::new(&fingerprint, self.config.lock_ttl_secs);
        self.store
            .acquire_merge_locks(&plan.all_ids(), &lease)
            .map_err(|e| match e {
                StoreError::LockHeld { client_id, owner } => MergeError::Conflict {
                    client_id,
                    reason: format!("locked by merge {}", short(&owner)),
                },
                other => MergeError::Storage(other),
            })?;
        debug!(owner = %lease.owner, "Merge locks acquired");

        let outcome = self.run_locked(plan, &pending, &fingerprint);

        // 7. Release (locks also expire on their own)
        if let Err(e) = self.store.release_merge_locks(&lease.owner) {
            warn!(error = %e, owner = %lease.owner, "Failed to release merge locks");
        }

        match &outcome {
            Ok(result) => info!(
                primary = %result.primary_id,
                deleted = result.deleted_ids.len(),
                reassigned = result.total_reassigned(),
                "Merge completed"
            ),
            Err(e) => warn!(primary = %plan.primary_id, error = %e, "Merge failed"),
        }
        outcome
    }

    /// Steps 3-6, run while holding every lock in the plan
    fn run_locked(
        &self,
        plan: &MergePlan,
        pending: &[ClientId],
        fingerprint: &str,
    ) -> Result<MergeResult, MergeError> {
        let mut result = MergeResult::new(&plan.primary_id);

        // Someone may have merged these clients between validation and locking
        let current = self.pending_duplicates(plan).map_err(|e| match e {
            MergeError::Validation(v) => MergeError::Conflict {
                client_id: plan.primary_id.clone(),
                reason: format!("clients changed before the lock was taken: {}", v),
            },
            other => other,
        })?;
        if current.is_empty() {
            result.already_merged = true;
            return Ok(result);
        }
        if current != pending {
            return Err(MergeError::Conflict {
                client_id: plan.primary_id.clone(),
                reason: "clients changed before the lock was taken".to_string(),
            });
        }

        // 3. Canonical fields (a single atomic write: failure means nothing changed)
        let primary = self
            .store
            .get_client(&plan.primary_id)
            .map_err(MergeError::Storage)?
            .ok_or_else(|| ValidationError::ClientNotFound(plan.primary_id.clone()))?;
        let updated = self
            .store
            .update_client(&plan.apply_to(&primary))
            .map_err(MergeError::Storage)?;
        if !updated {
            return Err(ValidationError::ClientNotFound(plan.primary_id.clone()).into());
        }
        debug!(primary = %plan.primary_id, "Canonical fields written");

        // 4. Reassign
        for duplicate in pending {
            for kind in DependentKind::ALL {
                let moved = self
                    .reassign_all(kind, duplicate, &plan.primary_id)
                    .map_err(|e| MergeError::partial(MergeStep::Reassign, e))?;
                if moved > 0 {
                    debug!(kind = %kind, from = %duplicate, moved, "Dependents reassigned");
                }
                *result.reassigned_counts.entry(kind).or_insert(0) += moved;
            }
        }

        // 5. Verify
        for duplicate in pending {
            for kind in DependentKind::ALL {
                let remaining = self
                    .store
                    .count_dependents(kind, duplicate)
                    .map_err(|e| MergeError::partial(MergeStep::Verify, e))?;
                if remaining > 0 {
                    return Err(MergeError::partial(
                        MergeStep::Verify,
                        format!("{} {} records still reference {}", remaining, kind, duplicate),
                    ));
                }
            }
        }

        // 6. Delete
        for duplicate in pending {
            let deleted = self
                .store
                .delete_client(duplicate, &plan.primary_id)
                .map_err(|e| MergeError::partial(MergeStep::Delete, e))?;
            if deleted {
                result.deleted_ids.push(duplicate.clone());
            }
        }

        self.record_audit(plan, &result, fingerprint);
        Ok(result)
    }

    /// Move every dependent of `kind` from `from` to `to`, one batch per call
    fn reassign_all(&self, kind: DependentKind, from: &ClientId, to: &ClientId) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let moved = self
                .store
                .reassign_dependents(kind, from, to, self.config.batch_size)?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    /// Duplicates that still exist. Duplicates already merged into this primary are
    /// skipped; anything else missing is a validation failure.
    fn pending_duplicates(&self, plan: &MergePlan) -> Result<Vec<ClientId>, MergeError> {
        if self
            .store
            .get_client(&plan.primary_id)
            .map_err(MergeError::Storage)?
            .is_none()
        {
            return Err(ValidationError::ClientNotFound(plan.primary_id.clone()).into());
        }

        let mut pending = Vec::new();
        for id in &plan.duplicate_ids {
            if self.store.get_client(id).map_err(MergeError::Storage)?.is_some() {
                pending.push(id.clone());
                continue;
            }

            match self.store.merged_into(id).map_err(MergeError::Storage)? {
                Some(target) if target == plan.primary_id => {
                    debug!(duplicate = %id, "Duplicate already merged into primary");
                }
                Some(target) => {
                    return Err(ValidationError::MergedElsewhere {
                        id: id.clone(),
                        merged_into: target,
                    }
                    .into())
                }
                None => return Err(ValidationError::ClientNotFound(id.clone()).into()),
            }
        }
        Ok(pending)
    }

    fn record_audit(&self, plan: &MergePlan, result: &MergeResult, fingerprint: &str) {
        let event = Event::new(
            "client_merged",
            "client",
            plan.primary_id.as_str(),
            serde_json::json!({
                "plan_fingerprint": fingerprint,
                "merged_ids": result.deleted_ids,
                "reassigned_counts": result.reassigned_counts,
                "canonical_fields": plan.canonical_fields,
            }),
            &self.config.actor,
        );

        if let Err(e) = self.store.record_event(&event) {
            warn!(error = %e, primary = %plan.primary_id, "Failed to write merge audit event");
        }
    }
}

fn short(token: &str) -> &str {
    token.get(..12).unwrap_or(token)
}

// ============================================================================
// TESTS
// ============================================================================
