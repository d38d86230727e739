// 🔍 Match Scorer - Is this contact the same person as that client?
// Field-weighted, additive, fully deterministic. No edit distance, no phonetics:
// staff see the resulting percentage and must be able to explain it.

use crate::client::{normalize_text, phone_digits, ClientField, ClientProfile, PartialClientProfile};
use serde::{Deserialize, Serialize};

// ============================================================================
// MATCH RULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// First name equal (case-insensitive) → +30
    FirstName,

    /// Last name equal (case-insensitive) → +30
    LastName,

    /// Email equal (case-insensitive) → +25
    Email,

    /// Phone digit sequences equal → +20
    Phone,

    /// One address contains the other → +10
    Address,

    /// City equal (case-insensitive) → +5
    City,
}

impl MatchRule {
    pub const ALL: [MatchRule; 6] = [
        MatchRule::FirstName,
        MatchRule::LastName,
        MatchRule::Email,
        MatchRule::Phone,
        MatchRule::Address,
        MatchRule::City,
    ];

    pub fn weight(&self) -> u32 {
        match self {
            MatchRule::FirstName => 30,
            MatchRule::LastName => 30,
            MatchRule::Email => 25,
            MatchRule::Phone => 20,
            MatchRule::Address => 10,
            MatchRule::City => 5,
        }
    }

    pub fn field(&self) -> ClientField {
        match self {
            MatchRule::FirstName => ClientField::FirstName,
            MatchRule::LastName => ClientField::LastName,
            MatchRule::Email => ClientField::Email,
            MatchRule::Phone => ClientField::Phone,
            MatchRule::Address => ClientField::Address,
            MatchRule::City => ClientField::City,
        }
    }
}

// ============================================================================
// SCORE BREAKDOWN
// ============================================================================

/// Why a candidate scored what it did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Sum of the weights of every rule that fired
    pub score: u32,

    /// Sum of the weights of every rule both sides had data for
    pub max_score: u32,

    /// Rules that fired, in rule order
    pub matched: Vec<MatchRule>,
}

impl ScoreBreakdown {
    /// Whole-number percentage shown to staff (0 when nothing was comparable)
    pub fn percentage(&self) -> u32 {
        if self.max_score == 0 {
            return 0;
        }
        self.score * 100 / self.max_score
    }
}

// ============================================================================
// MATCH SCORER
// ============================================================================

/// Stateless scorer; all methods are pure
pub struct MatchScorer;

impl MatchScorer {
    /// Score a query profile against one stored client
    pub fn score(query: &PartialClientProfile, candidate: &ClientProfile) -> u32 {
        MatchRule::ALL
            .iter()
            .filter(|rule| Self::rule_matches(**rule, query, candidate))
            .map(|rule| rule.weight())
            .sum()
    }

    /// Score plus the list of rules that fired and the attainable maximum
    pub fn explain(query: &PartialClientProfile, candidate: &ClientProfile) -> ScoreBreakdown {
        let mut matched = Vec::new();
        let mut score = 0;
        let mut max_score = 0;

        for rule in MatchRule::ALL {
            if Self::comparable(rule, query, candidate) {
                max_score += rule.weight();
            }
            if Self::rule_matches(rule, query, candidate) {
                score += rule.weight();
                matched.push(rule);
            }
        }

        ScoreBreakdown {
            score,
            max_score,
            matched,
        }
    }

    /// Highest score any candidate could reach for this query
    pub fn max_score(query: &PartialClientProfile) -> u32 {
        MatchRule::ALL
            .iter()
            .filter(|rule| Self::query_value(**rule, query).is_some())
            .map(|rule| rule.weight())
            .sum()
    }

    fn comparable(rule: MatchRule, query: &PartialClientProfile, candidate: &ClientProfile) -> bool {
        Self::query_value(rule, query).is_some() && Self::candidate_value(rule, candidate).is_some()
    }

    fn rule_matches(rule: MatchRule, query: &PartialClientProfile, candidate: &ClientProfile) -> bool {
        let (q, c) = match (
            Self::query_value(rule, query),
            Self::candidate_value(rule, candidate),
        ) {
            (Some(q), Some(c)) => (q, c),
            // Missing on either side never matches
            _ => return false,
        };

        match rule {
            MatchRule::Address => q.contains(&c) || c.contains(&q),
            _ => q == c,
        }
    }

    fn query_value(rule: MatchRule, query: &PartialClientProfile) -> Option<String> {
        Self::normalized(rule, query.get(rule.field()))
    }

    fn candidate_value(rule: MatchRule, candidate: &ClientProfile) -> Option<String> {
        Self::normalized(rule, candidate.get(rule.field()))
    }

    /// Lowercased text, or bare digits for phones; `None` when nothing is left
    fn normalized(rule: MatchRule, value: Option<&str>) -> Option<String> {
        let value = value?;
        let normalized = match rule {
            MatchRule::Phone => phone_digits(value),
            _ => normalize_text(value),
        };
        if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
