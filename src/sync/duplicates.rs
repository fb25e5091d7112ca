//! Duplicate Contact Detection - advisory fuzzy matching over local contacts
//!
//! Scoring per pair:
//! - normalized name similarity (edit distance, and the same over sorted tokens),
//!   with legal suffixes such as "Pte Ltd" removed
//! - exact email match
//! - exact phone match (digits only)
//!
//! Pairs at or above the threshold are joined transitively with a union-find.
//! Nothing is merged or deleted; groups are recomputed on every scan.

use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::db::{Contact, Database, DbError};

pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.8;

/// Name similarity at which "similar_name" is reported as a reason
const NAME_REASON_MIN: f64 = 0.8;
/// Phones shorter than this (in digits) are too generic to compare
const MIN_PHONE_DIGITS: usize = 6;

const LEGAL_SUFFIXES: &[&str] = &[
    "pte", "ltd", "limited", "inc", "llc", "llp", "co", "corp", "sdn", "bhd", "plc", "gmbh", "the",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    SimilarName,
    ExactEmail,
    ExactPhone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub contact_ids: Vec<i64>,
    pub similarity_score: f64,
    pub match_reasons: Vec<MatchReason>,
    pub suggested_canonical_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairScore {
    pub score: f64,
    pub reasons: Vec<MatchReason>,
}

#[derive(Debug, thiserror::Error)]
pub enum DuplicateError {
    #[error("Threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f64),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<DbError> for DuplicateError {
    fn from(err: DbError) -> Self {
        DuplicateError::Database(err.to_string())
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// Lowercase, strip punctuation, drop legal suffixes
pub fn normalize_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|token| !LEGAL_SUFFIXES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let direct = strsim::normalized_levenshtein(&a, &b);
    let sorted = strsim::normalized_levenshtein(&sorted_tokens(&a), &sorted_tokens(&b));
    direct.max(sorted)
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn normalized_email(contact: &Contact) -> Option<String> {
    contact
        .email
        .as_deref()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}

fn normalized_phone(contact: &Contact) -> Option<String> {
    let digits: String = contact
        .phone
        .as_deref()?
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    (digits.len() >= MIN_PHONE_DIGITS).then_some(digits)
}

pub fn score_pair(a: &Contact, b: &Contact) -> PairScore {
    let name = name_similarity(&a.name, &b.name);
    let email = matches!((normalized_email(a), normalized_email(b)), (Some(x), Some(y)) if x == y);
    let phone = matches!((normalized_phone(a), normalized_phone(b)), (Some(x), Some(y)) if x == y);

    let mut score = 0.85 * name;
    if email {
        score = score.max(0.9 + 0.1 * name);
    }
    if phone {
        score = score.max(0.85 + 0.1 * name);
    }
    if email && phone {
        score = score.max(0.95 + 0.05 * name);
    }

    let mut reasons = Vec::new();
    if name >= NAME_REASON_MIN {
        reasons.push(MatchReason::SimilarName);
    }
    if email {
        reasons.push(MatchReason::ExactEmail);
    }
    if phone {
        reasons.push(MatchReason::ExactPhone);
    }

    PairScore {
        score: score.clamp(0.0, 1.0),
        reasons,
    }
}

// ============================================================================
// Detector
// ============================================================================

pub struct DuplicateContactDetector {
    db: Arc<Database>,
}

impl DuplicateContactDetector {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn scan(&self, threshold: f64) -> Result<Vec<DuplicateGroup>, DuplicateError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DuplicateError::InvalidThreshold(threshold));
        }

        let contacts = self.db.get_all_contacts()?;
        let groups = group_contacts(&contacts, threshold);
        log::info!(
            "Duplicate scan over {} contacts found {} group(s)",
            contacts.len(),
            groups.len()
        );
        Ok(groups)
    }
}

/// Pairwise scoring + transitive grouping
pub fn group_contacts(contacts: &[Contact], threshold: f64) -> Vec<DuplicateGroup> {
    let mut sets = UnionFind::<usize>::new(contacts.len());
    let mut edges: Vec<(usize, PairScore)> = Vec::new();

    for i in 0..contacts.len() {
        for j in (i + 1)..contacts.len() {
            let pair = score_pair(&contacts[i], &contacts[j]);
            if pair.score >= threshold {
                sets.union(i, j);
                edges.push((i, pair));
            }
        }
    }

    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..contacts.len() {
        members.entry(sets.find(i)).or_default().push(i);
    }

    let mut stats: HashMap<usize, (f64, BTreeSet<MatchReason>)> = HashMap::new();
    for (i, pair) in edges {
        let entry = stats.entry(sets.find(i)).or_insert((0.0, BTreeSet::new()));
        entry.0 = entry.0.max(pair.score);
        entry.1.extend(pair.reasons);
    }

    let mut groups: Vec<DuplicateGroup> = members
        .into_iter()
        .filter(|(_, indices)| indices.len() > 1)
        .filter_map(|(root, indices)| {
            let (score, reasons) = stats.remove(&root)?;
            let group: Vec<&Contact> = indices.iter().map(|&i| &contacts[i]).collect();
            let canonical = group
                .iter()
                .min_by_key(|c| (c.external_id.is_none(), c.created_at, c.id))?;

            let mut contact_ids: Vec<i64> = group.iter().map(|c| c.id).collect();
            contact_ids.sort_unstable();

            Some(DuplicateGroup {
                suggested_canonical_id: canonical.id,
                contact_ids,
                similarity_score: score,
                match_reasons: reasons.into_iter().collect(),
            })
        })
        .collect();

    groups.sort_by_key(|g| g.contact_ids[0]);
    groups
}
