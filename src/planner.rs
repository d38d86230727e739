// 🧩 Merge Planner - decide what the surviving client looks like
//
// Pure: no storage access. A plan can be recomputed every time the reviewer changes
// the primary or edits a field, and thrown away at no cost.

use crate::client::{ClientField, ClientId, ClientProfile};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Resolved attribute values to write onto the primary. Absent field = no value.
pub type CanonicalFields = BTreeMap<ClientField, String>;

// ============================================================================
// MERGE PLAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    /// The surviving client
    pub primary_id: ClientId,

    /// Clients folded into the primary and then deleted
    pub duplicate_ids: Vec<ClientId>,

    pub canonical_fields: CanonicalFields,
}

impl MergePlan {
    /// Primary first, then duplicates
    pub fn all_ids(&self) -> Vec<ClientId> {
        let mut ids = Vec::with_capacity(self.duplicate_ids.len() + 1);
        ids.push(self.primary_id.clone());
        ids.extend(self.duplicate_ids.iter().cloned());
        ids
    }

    /// Structural checks that need no storage
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        if self.duplicate_ids.is_empty() {
            return Err(ValidationError::NoDuplicates);
        }

        let mut seen = HashSet::new();
        for id in &self.duplicate_ids {
            if *id == self.primary_id {
                return Err(ValidationError::PrimaryListedAsDuplicate(id.clone()));
            }
            if !seen.insert(id) {
                return Err(ValidationError::RepeatedRecord(id.clone()));
            }
        }

        for field in [ClientField::FirstName, ClientField::LastName] {
            let present = self
                .canonical_fields
                .get(&field)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ValidationError::MissingRequiredField(field));
            }
        }

        Ok(())
    }

    /// SHA-256 over primary, sorted duplicates and canonical fields.
    /// Two plans with the same fingerprint describe the same merge.
    pub fn fingerprint(&self) -> String {
        let mut duplicates: Vec<&str> = self.duplicate_ids.iter().map(|id| id.as_str()).collect();
        duplicates.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.primary_id.as_str());
        hasher.update([0u8]);
        for id in duplicates {
            hasher.update(id);
            hasher.update([0u8]);
        }
        for (field, value) in &self.canonical_fields {
            hasher.update(field.as_str());
            hasher.update([b'=']);
            hasher.update(value);
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// The primary record as it should look after the merge
    pub fn apply_to(&self, primary: &ClientProfile) -> ClientProfile {
        let mut merged = primary.clone();
        for field in ClientField::ALL {
            merged.set(field, self.canonical_fields.get(&field).cloned());
        }
        merged
    }
}

// ============================================================================
// MERGE PLANNER
// ============================================================================

pub struct MergePlanner;

impl MergePlanner {
    /// Build a plan from 2+ records.
    ///
    /// Each field takes the first non-empty value scanning `records` in the order
    /// given; `overrides` win over that default. A blank override clears the field.
    pub fn plan(
        records: &[ClientProfile],
        primary_id: &ClientId,
        overrides: &BTreeMap<ClientField, String>,
    ) -> Result<MergePlan, ValidationError> {
        if records.len() < 2 {
            return Err(ValidationError::TooFewRecords {
                count: records.len(),
            });
        }

        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(&record.id) {
                return Err(ValidationError::RepeatedRecord(record.id.clone()));
            }
        }

        if !seen.contains(primary_id) {
            return Err(ValidationError::PrimaryNotInRecords(primary_id.clone()));
        }

        let plan = MergePlan {
            primary_id: primary_id.clone(),
            duplicate_ids: records
                .iter()
                .filter(|r| r.id != *primary_id)
                .map(|r| r.id.clone())
                .collect(),
            canonical_fields: Self::resolve_fields(records, overrides),
        };

        plan.validate_shape()?;
        Ok(plan)
    }

    /// Default first-non-empty policy plus reviewer overrides
    pub fn resolve_fields(
        records: &[ClientProfile],
        overrides: &BTreeMap<ClientField, String>,
    ) -> CanonicalFields {
        let mut fields = CanonicalFields::new();

        for field in ClientField::ALL {
            let resolved = match overrides.get(&field) {
                Some(value) => Some(value.trim()).filter(|v| !v.is_empty()),
                None => records.iter().find_map(|r| r.get(field)),
            };
            if let Some(value) = resolved {
                fields.insert(field, value.to_string());
            }
        }

        fields
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<ClientProfile> {
        vec![
            ClientProfile::new("Jon", "Smith").with(ClientField::City, "Atlanta"),
            ClientProfile::new("John", "Smith")
                .with(ClientField::Email, "john@example.org")
                .with(ClientField::City, "Decatur"),
            ClientProfile::new("J", "Smith").with(ClientField::Phone, "404-555-1234"),
        ]
    }

    #[test]
    fn test_first_non_empty_in_given_order() {
        let records = records();
        let plan = MergePlanner::plan(&records, &records[1].id, &BTreeMap::new()).unwrap();

        assert_eq!(plan.primary_id, records[1].id);
        assert_eq!(plan.duplicate_ids, vec![records[0].id.clone(), records[2].id.clone()]);
        assert_eq!(plan.canonical_fields[&ClientField::FirstName], "Jon");
        assert_eq!(plan.canonical_fields[&ClientField::City], "Atlanta");
        assert_eq!(plan.canonical_fields[&ClientField::Email], "john@example.org");
        assert_eq!(plan.canonical_fields[&ClientField::Phone], "404-555-1234");
        assert!(!plan.canonical_fields.contains_key(&ClientField::County));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let records = records();
        let overrides: BTreeMap<ClientField, String> = [
            (ClientField::FirstName, "John".to_string()),
            (ClientField::City, "  ".to_string()),
        ]
        .into_iter()
        .collect();

        let plan = MergePlanner::plan(&records, &records[0].id, &overrides).unwrap();

        assert_eq!(plan.canonical_fields[&ClientField::FirstName], "John");
        assert!(!plan.canonical_fields.contains_key(&ClientField::City));
    }

    #[test]
    fn test_blank_name_override_is_rejected() {
        let records = records();
        let overrides: BTreeMap<ClientField, String> =
            [(ClientField::LastName, String::new())].into_iter().collect();

        let err = MergePlanner::plan(&records, &records[0].id, &overrides).unwrap_err();

        assert_eq!(err, ValidationError::MissingRequiredField(ClientField::LastName));
    }

    #[test]
    fn test_requires_two_records_and_known_primary() {
        let records = records();

        assert_eq!(
            MergePlanner::plan(&records[..1], &records[0].id, &BTreeMap::new()).unwrap_err(),
            ValidationError::TooFewRecords { count: 1 }
        );

        let stranger = ClientId::new();
        assert_eq!(
            MergePlanner::plan(&records, &stranger, &BTreeMap::new()).unwrap_err(),
            ValidationError::PrimaryNotInRecords(stranger)
        );

        let repeated = vec![records[0].clone(), records[0].clone()];
        assert!(matches!(
            MergePlanner::plan(&repeated, &records[0].id, &BTreeMap::new()),
            Err(ValidationError::RepeatedRecord(_))
        ));
    }

    #[test]
    fn test_fingerprint_ignores_duplicate_order() {
        let records = records();
        let plan = MergePlanner::plan(&records, &records[0].id, &BTreeMap::new()).unwrap();

        let mut reordered = plan.clone();
        reordered.duplicate_ids.reverse();
        assert_eq!(plan.fingerprint(), reordered.fingerprint());

        let mut edited = plan.clone();
        edited
            .canonical_fields
            .insert(ClientField::County, "DeKalb".to_string());
        assert_ne!(plan.fingerprint(), edited.fingerprint());
        assert_eq!(plan.fingerprint().len(), 64);
    }

    #[test]
    fn test_apply_to_clears_unresolved_optional_fields() {
        let records = records();
        let mut plan = MergePlanner::plan(&records, &records[0].id, &BTreeMap::new()).unwrap();
        plan.canonical_fields.remove(&ClientField::City);

        let merged = plan.apply_to(&records[0]);

        assert_eq!(merged.id, records[0].id);
        assert_eq!(merged.city, None);
        assert_eq!(merged.email.as_deref(), Some("john@example.org"));
    }

    #[test]
    fn test_plan_json_uses_field_names_as_keys() {
        let records = records();
        let plan = MergePlanner::plan(&records, &records[0].id, &BTreeMap::new()).unwrap();

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["canonical_fields"]["first_name"], "Jon");

        let back: MergePlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }
}
