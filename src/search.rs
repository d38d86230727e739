// 🔎 Candidate Search - loose lookup, then rank with the Match Scorer
//
// One implementation for all three calling flows (intake triage, new-client creation,
// client-search merge). Never fails into the caller: a storage error comes back as an
// empty result with `SearchStatus::Failed`, distinct from "searched, nothing found".

use crate::client::{phone_digits, ClientField, ClientId, ClientProfile, PartialClientProfile};
use crate::config::SearchConfig;
use crate::error::StoreError;
use crate::matching::{MatchScorer, ScoreBreakdown};
use crate::store::{ClientQuery, ClientStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

// ============================================================================
// RESULTS
// ============================================================================

/// A stored client proposed as a possible duplicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub client: ClientProfile,
    pub score: u32,
    pub breakdown: ScoreBreakdown,
}

impl MatchCandidate {
    /// Stable percentage shown next to the candidate
    pub fn percentage(&self) -> u32 {
        self.breakdown.percentage()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchStatus {
    /// Storage was queried; the candidate list is authoritative (possibly empty)
    Searched,

    /// No field was long enough to justify a lookup
    InsufficientInput,

    /// Storage could not be queried; the empty list means nothing
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub candidates: Vec<MatchCandidate>,
    pub status: SearchStatus,
}

impl SearchResults {
    fn empty(status: SearchStatus) -> Self {
        SearchResults {
            candidates: Vec::new(),
            status,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, SearchStatus::Failed { .. })
    }

    /// Searched successfully and found nobody
    pub fn no_matches(&self) -> bool {
        self.status == SearchStatus::Searched && self.candidates.is_empty()
    }
}

// ============================================================================
// CANDIDATE SEARCH
// ============================================================================

pub struct CandidateSearch<'a, S: ClientStore + ?Sized> {
    store: &'a S,
    config: SearchConfig,
}

impl<'a, S: ClientStore + ?Sized> CandidateSearch<'a, S> {
    pub fn new(store: &'a S, config: SearchConfig) -> Self {
        CandidateSearch { store, config }
    }

    /// Search with the configured threshold and limit
    pub fn search(&self, query: &PartialClientProfile, exclude_ids: &HashSet<ClientId>) -> SearchResults {
        self.search_with(query, exclude_ids, self.config.threshold, self.config.limit)
    }

    pub fn search_with(
        &self,
        query: &PartialClientProfile,
        exclude_ids: &HashSet<ClientId>,
        threshold: u32,
        limit: usize,
    ) -> SearchResults {
        let lookup = match self.build_query(query) {
            Some(lookup) => lookup,
            None => {
                debug!("Candidate search skipped: no field long enough to search on");
                return SearchResults::empty(SearchStatus::InsufficientInput);
            }
        };

        // Exact rows are never capped, so a loose lookup flooded by newer
        // substring hits cannot push a real duplicate out
        let rows = match self.fetch(&lookup) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Candidate search failed");
                return SearchResults::empty(SearchStatus::Failed {
                    message: e.to_string(),
                });
            }
        };

        let fetched = rows.len();
        let candidates = rank(query, rows, exclude_ids, threshold, limit);
        debug!(fetched, returned = candidates.len(), threshold, "Candidate search complete");

        SearchResults {
            candidates,
            status: SearchStatus::Searched,
        }
    }

    fn fetch(&self, lookup: &ClientQuery) -> Result<Vec<ClientProfile>, StoreError> {
        let mut rows = self.store.find_exact_clients(lookup)?;
        let loose = self.store.find_clients(lookup)?;
        if loose.len() >= lookup.limit {
            debug!(cap = lookup.limit, "Loose lookup hit its row cap");
        }
        rows.extend(loose);
        Ok(rows)
    }

    /// Storage lookup criteria, or `None` when every field is too short.
    /// Only fields that pass their length guard are sent to storage.
    pub fn build_query(&self, query: &PartialClientProfile) -> Option<ClientQuery> {
        let name = |field| {
            query
                .get(field)
                .filter(|v| v.chars().count() >= self.config.min_name_len)
                .map(str::to_string)
        };

        let lookup = ClientQuery {
            first_name: name(ClientField::FirstName),
            last_name: name(ClientField::LastName),
            email: query
                .get(ClientField::Email)
                .filter(|v| v.chars().count() >= self.config.min_email_len)
                .map(str::to_string),
            phone_digits: query
                .get(ClientField::Phone)
                .map(phone_digits)
                .filter(|d| d.len() >= self.config.min_phone_digits),
            limit: self.config.lookup_cap,
        };

        if lookup.is_empty() {
            None
        } else {
            Some(lookup)
        }
    }
}

/// Exclude, score, keep score > threshold, order by score then newest, cap at `limit`
pub fn rank(
    query: &PartialClientProfile,
    clients: Vec<ClientProfile>,
    exclude_ids: &HashSet<ClientId>,
    threshold: u32,
    limit: usize,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = clients
        .into_iter()
        .filter(|c| !exclude_ids.contains(&c.id))
        .map(|client| {
            let breakdown = MatchScorer::explain(query, &client);
            MatchCandidate {
                score: breakdown.score,
                client,
                breakdown,
            }
        })
        .filter(|c| c.score > threshold)
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.client.created_at.cmp(&a.client.created_at))
            .then(a.client.id.cmp(&b.client.id))
    });
    candidates.dedup_by(|a, b| a.client.id == b.client.id);
    candidates.truncate(limit);
    candidates
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{FaultyStore, Op};
    use chrono::{Duration, Utc};

    fn seeded_store() -> (MemoryStore, ClientProfile, ClientProfile) {
        let store = MemoryStore::new();

        let mut older = ClientProfile::new("John", "Smith").with(ClientField::Phone, "(404) 555-1234");
        older.created_at = Utc::now() - Duration::days(30);
        let newer = ClientProfile::new("John", "Smith").with(ClientField::Email, "john@example.org");

        store.insert_client(&older).unwrap();
        store.insert_client(&newer).unwrap();
        store
            .insert_client(&ClientProfile::new("Mary", "Jones").with(ClientField::City, "Atlanta"))
            .unwrap();

        (store, older, newer)
    }

    fn john_smith() -> PartialClientProfile {
        PartialClientProfile::new()
            .with(ClientField::FirstName, "john")
            .with(ClientField::LastName, "SMITH")
    }

    #[test]
    fn test_ranks_by_score_then_newest() {
        let (store, older, newer) = seeded_store();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let results = search.search(&john_smith(), &HashSet::new());

        assert_eq!(results.status, SearchStatus::Searched);
        assert_eq!(results.candidates.len(), 2);
        // Tie at 60: newest first
        assert_eq!(results.candidates[0].client.id, newer.id);
        assert_eq!(results.candidates[1].client.id, older.id);

        let with_phone = john_smith().with(ClientField::Phone, "404.555.1234");
        let results = search.search(&with_phone, &HashSet::new());
        assert_eq!(results.candidates[0].client.id, older.id);
        assert_eq!(results.candidates[0].score, 80);
        assert_eq!(results.candidates[0].percentage(), 100);
    }

    #[test]
    fn test_excluded_ids_are_filtered() {
        let (store, older, newer) = seeded_store();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let exclude: HashSet<ClientId> = [newer.id.clone()].into_iter().collect();
        let results = search.search(&john_smith(), &exclude);

        assert_eq!(results.candidates.len(), 1);
        assert_eq!(results.candidates[0].client.id, older.id);
    }

    #[test]
    fn test_city_only_match_below_default_threshold() {
        let (store, _, _) = seeded_store();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        // "Mar" passes the length guard and loosely finds Mary; only the city scores
        let query = PartialClientProfile::new()
            .with(ClientField::FirstName, "Mar")
            .with(ClientField::City, "atlanta");
        let results = search.search(&query, &HashSet::new());

        assert!(results.no_matches());

        let client = ClientProfile::new("Mary", "Jones").with(ClientField::City, "Atlanta");
        let city_only = PartialClientProfile::new().with(ClientField::City, "Atlanta");
        assert_eq!(MatchScorer::score(&city_only, &client), 5);
        assert!(rank(&city_only, vec![client], &HashSet::new(), 21, 10).is_empty());
    }

    #[test]
    fn test_short_input_skips_lookup() {
        let (store, _, _) = seeded_store();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let query = PartialClientProfile::new()
            .with(ClientField::FirstName, "Jo")
            .with(ClientField::Phone, "555-1234")
            .with(ClientField::Email, "a@b.c");

        let results = search.search(&query, &HashSet::new());

        assert_eq!(results.status, SearchStatus::InsufficientInput);
        assert!(results.candidates.is_empty());
        assert!(!results.no_matches());
    }

    #[test]
    fn test_length_guards_are_exclusive_bounds() {
        let store = MemoryStore::new();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let lookup = search
            .build_query(
                &PartialClientProfile::new()
                    .with(ClientField::FirstName, "Ann")
                    .with(ClientField::Phone, "(404) 555-123")
                    .with(ClientField::Email, "ab@c.d"),
            )
            .unwrap();

        assert_eq!(lookup.first_name.as_deref(), Some("Ann"));
        assert_eq!(lookup.phone_digits, None);
        assert_eq!(lookup.email.as_deref(), Some("ab@c.d"));
    }

    #[test]
    fn test_limit_caps_results() {
        let store = MemoryStore::new();
        for _ in 0..15 {
            store.insert_client(&ClientProfile::new("Pat", "Lee")).unwrap();
        }
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let query = PartialClientProfile::new()
            .with(ClientField::FirstName, "Pat")
            .with(ClientField::LastName, "Lee");

        assert_eq!(search.search(&query, &HashSet::new()).candidates.len(), 10);
        assert_eq!(search.search_with(&query, &HashSet::new(), 21, 3).candidates.len(), 3);
    }

    #[test]
    fn test_older_exact_match_survives_a_full_loose_lookup() {
        let store = MemoryStore::new();
        let mut original = ClientProfile::new("John", "Smith").with(ClientField::Phone, "4045551234");
        original.created_at = Utc::now() - Duration::days(365);
        store.insert_client(&original).unwrap();
        for i in 0..SearchConfig::default().lookup_cap {
            store
                .insert_client(&ClientProfile::new("Johnny", &format!("Other{}", i)))
                .unwrap();
        }
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let query = john_smith().with(ClientField::Phone, "4045551234");
        let results = search.search(&query, &HashSet::new());

        assert_eq!(results.status, SearchStatus::Searched);
        assert_eq!(results.candidates.len(), 1, "the exact duplicate was crowded out");
        assert_eq!(results.candidates[0].client.id, original.id);
        assert_eq!(results.candidates[0].score, 80);
    }

    #[test]
    fn test_exact_and_loose_hits_are_not_doubled() {
        let (store, older, newer) = seeded_store();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let results = search.search(&john_smith(), &HashSet::new());

        let ids: Vec<&ClientId> = results.candidates.iter().map(|c| &c.client.id).collect();
        assert_eq!(ids, vec![&newer.id, &older.id]);
    }

    #[test]
    fn test_padded_short_name_does_not_trigger_lookup() {
        let store = MemoryStore::new();
        let search = CandidateSearch::new(&store, SearchConfig::default());

        let query = PartialClientProfile::new()
            .with(ClientField::FirstName, "Jo ")
            .with(ClientField::Email, " a@b.c ");

        assert_eq!(search.build_query(&query), None);
    }

    #[test]
    fn test_storage_failure_is_reported_not_thrown() {
        let (store, _, _) = seeded_store();
        let faulty = FaultyStore::new(&store);
        faulty.fail_on(Op::FindClients, 1);
        let search = CandidateSearch::new(&faulty, SearchConfig::default());

        let results = search.search(&john_smith(), &HashSet::new());

        assert!(results.is_failed());
        assert!(results.candidates.is_empty());
        assert!(!results.no_matches());
    }
}
