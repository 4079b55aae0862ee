// 🔗 Entity Resolution - Fuzzy Matching Across Documents
// Names extracted from documents resolve to canonical entities so that
// "ACME Corp.", "Acme Corporation" and "acme corp" land on one record.
// Matching policy lives here; the transactional upsert lives in db.rs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strsim::jaro_winkler;

use crate::document::FieldValue;

// ============================================================================
// CATEGORIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Vendor,
    Bank,
    Employer,
    Employee,
    Payer,
    Payee,
    Biller,
    AccountHolder,
    Institution,
}

impl EntityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCategory::Vendor => "vendor",
            EntityCategory::Bank => "bank",
            EntityCategory::Employer => "employer",
            EntityCategory::Employee => "employee",
            EntityCategory::Payer => "payer",
            EntityCategory::Payee => "payee",
            EntityCategory::Biller => "biller",
            EntityCategory::AccountHolder => "account_holder",
            EntityCategory::Institution => "institution",
        }
    }

    pub fn parse(s: &str) -> Option<EntityCategory> {
        match s {
            "vendor" => Some(EntityCategory::Vendor),
            "bank" => Some(EntityCategory::Bank),
            "employer" => Some(EntityCategory::Employer),
            "employee" => Some(EntityCategory::Employee),
            "payer" => Some(EntityCategory::Payer),
            "payee" => Some(EntityCategory::Payee),
            "biller" => Some(EntityCategory::Biller),
            "account_holder" => Some(EntityCategory::AccountHolder),
            "institution" => Some(EntityCategory::Institution),
            _ => None,
        }
    }
}

/// Extracted-field name -> entity category + document relationship label.
/// Matching is fuzzy per category; categories never merge with each other.
const FIELD_CATEGORY_MAP: &[(&str, EntityCategory, &str)] = &[
    ("vendor_name", EntityCategory::Vendor, "vendor"),
    ("merchant_name", EntityCategory::Vendor, "vendor"),
    ("bank_name", EntityCategory::Bank, "bank"),
    ("institution_name", EntityCategory::Institution, "institution"),
    ("employer_name", EntityCategory::Employer, "employer"),
    ("employee_name", EntityCategory::Employee, "employee"),
    ("payer_name", EntityCategory::Payer, "payer"),
    ("payee_name", EntityCategory::Payee, "payee"),
    ("biller_name", EntityCategory::Biller, "biller"),
    ("account_holder", EntityCategory::AccountHolder, "account_holder"),
    ("account_holder_name", EntityCategory::AccountHolder, "account_holder"),
    ("customer_name", EntityCategory::AccountHolder, "account_holder"),
];

// ============================================================================
// CANDIDATES AND MATCHES
// ============================================================================

/// A name pulled out of a document, not yet resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityCandidate {
    pub category: EntityCategory,
    pub raw_name: String,
    pub normalized_name: String,
    /// Relationship label for the document-entity edge
    pub relationship: String,
}

/// Outcome of matching one candidate against the stored population.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMatch {
    /// Candidate resolved to an existing entity id with this similarity
    Existing { entity_id: String, score: f64 },
    /// No close-enough entity; caller creates a new one
    New,
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct EntityResolver {
    /// Jaro-Winkler similarity at or above this merges into an existing entity
    pub merge_threshold: f64,
}

impl EntityResolver {
    pub fn new() -> Self {
        EntityResolver {
            merge_threshold: 0.90,
        }
    }

    pub fn with_threshold(threshold: f64) -> Self {
        EntityResolver {
            merge_threshold: threshold,
        }
    }

    /// Canonical key: lowercase, strip punctuation, collapse whitespace.
    pub fn normalize_name(raw: &str) -> String {
        let cleaned: String = raw
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect();
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Match a normalized candidate against same-category entities.
    /// Exact normalized match wins immediately; otherwise the best
    /// Jaro-Winkler score at or above the threshold.
    pub fn resolve<'a, I>(&self, normalized: &str, population: I) -> EntityMatch
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if normalized.is_empty() {
            return EntityMatch::New;
        }

        let mut best: Option<(String, f64)> = None;
        for (entity_id, existing) in population {
            if existing == normalized {
                return EntityMatch::Existing {
                    entity_id: entity_id.to_string(),
                    score: 1.0,
                };
            }
            let score = jaro_winkler(existing, normalized);
            if score >= self.merge_threshold
                && best.as_ref().map_or(true, |(_, b)| score > *b)
            {
                best = Some((entity_id.to_string(), score));
            }
        }

        match best {
            Some((entity_id, score)) => EntityMatch::Existing { entity_id, score },
            None => EntityMatch::New,
        }
    }

    /// Pull entity candidates out of a document's extracted fields.
    /// Duplicate (category, normalized) pairs collapse to the first mention.
    pub fn extract_candidates(
        &self,
        fields: &HashMap<String, FieldValue>,
    ) -> Vec<EntityCandidate> {
        let mut candidates: Vec<EntityCandidate> = Vec::new();
        for (field, category, relationship) in FIELD_CATEGORY_MAP {
            let raw = match fields.get(*field) {
                Some(FieldValue::Text(s)) if !s.trim().is_empty() => s.trim().to_string(),
                _ => continue,
            };
            let normalized = Self::normalize_name(&raw);
            if normalized.is_empty() {
                continue;
            }
            let already = candidates
                .iter()
                .any(|c| c.category == *category && c.normalized_name == normalized);
            if already {
                continue;
            }
            candidates.push(EntityCandidate {
                category: *category,
                raw_name: raw,
                normalized_name: normalized,
                relationship: relationship.to_string(),
            });
        }
        candidates
    }
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
