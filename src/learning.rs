// 🎓 Self-Learning Loop - Corrections, Clusters, Triggered Rule Synthesis
// Human corrections accumulate per field; when the aggregate count or the
// extraction error rate crosses its threshold the engine synthesizes rule
// text that rides along with future extraction prompts, then re-arms at a
// higher water mark so reviews don't fire it on every subsequent correction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::LearningSyncError;

// ============================================================================
// CORRECTIONS
// ============================================================================

/// One human correction of one extracted field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    pub document_id: String,
    pub field_name: String,
    pub original_value: String,
    pub corrected_value: String,
    pub corrected_by: String,
    pub created_at: DateTime<Utc>,
}

impl Correction {
    pub fn new(
        document_id: &str,
        field_name: &str,
        original_value: &str,
        corrected_value: &str,
        corrected_by: &str,
    ) -> Self {
        Correction {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            field_name: field_name.to_string(),
            original_value: original_value.to_string(),
            corrected_value: corrected_value.to_string(),
            corrected_by: corrected_by.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionExample {
    pub original: String,
    pub corrected: String,
}

/// Per-field aggregate of corrections, capped example list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionCluster {
    pub field_name: String,
    pub count: usize,
    pub examples: Vec<CorrectionExample>,
}

// ============================================================================
// LEARNING EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningEventKind {
    CorrectionClusterUpdate,
    LearningSync,
    ManualTrigger,
}

impl LearningEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningEventKind::CorrectionClusterUpdate => "correction_cluster_update",
            LearningEventKind::LearningSync => "learning_sync",
            LearningEventKind::ManualTrigger => "manual_trigger",
        }
    }

    pub fn parse(s: &str) -> Option<LearningEventKind> {
        match s {
            "correction_cluster_update" => Some(LearningEventKind::CorrectionClusterUpdate),
            "learning_sync" => Some(LearningEventKind::LearningSync),
            "manual_trigger" => Some(LearningEventKind::ManualTrigger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: String,
    pub kind: LearningEventKind,
    pub detail: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

impl LearningEvent {
    pub fn new(kind: LearningEventKind, detail: impl Into<String>, success: bool) -> Self {
        LearningEvent {
            id: Uuid::new_v4().to_string(),
            kind,
            detail: detail.into(),
            success,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// TRIGGER POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TriggerReason {
    /// Total corrections reached the count threshold
    CountThreshold { corrections: usize },
    /// Corrections per extracted field reached the rate threshold
    ErrorRate { rate: f64, corrections: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningTrigger {
    pub reason: TriggerReason,
    /// Corrections total at which the next trigger re-arms
    pub cooldown_mark: usize,
}

pub struct LearningEngine {
    /// Total corrections that fire a learning event
    pub correction_threshold: usize,
    /// Corrections / extracted fields that fires a learning event
    pub error_rate_threshold: f64,
    /// Minimum corrections before the rate branch may fire
    pub rate_volume_floor: usize,
    /// Corrections added to the water mark after each trigger
    pub rearm_step: usize,
    /// Examples kept per cluster
    pub max_examples: usize,
    /// Corrections per field before a rule is synthesized
    pub min_cluster_for_rule: usize,
}

impl LearningEngine {
    pub fn new() -> Self {
        LearningEngine {
            correction_threshold: 100,
            error_rate_threshold: 0.10,
            rate_volume_floor: 25,
            rearm_step: 25,
            max_examples: 5,
            min_cluster_for_rule: 3,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        LearningEngine {
            correction_threshold: config.learning_correction_threshold,
            error_rate_threshold: config.learning_error_rate_threshold,
            rearm_step: config.learning_rearm_step,
            rate_volume_floor: config.learning_rearm_step,
            ..LearningEngine::new()
        }
    }

    pub fn error_rate(&self, corrections: usize, fields_extracted: usize) -> f64 {
        if fields_extracted == 0 {
            0.0
        } else {
            corrections as f64 / fields_extracted as f64
        }
    }

    /// Decide whether a learning cycle fires. `cooldown_mark` is the
    /// corrections total at which triggering re-arms (0 = armed); a fired
    /// trigger moves it to current + rearm_step.
    pub fn maybe_trigger(
        &self,
        corrections: usize,
        fields_extracted: usize,
        cooldown_mark: usize,
    ) -> Option<LearningTrigger> {
        if corrections < cooldown_mark {
            return None;
        }

        if corrections >= self.correction_threshold {
            return Some(LearningTrigger {
                reason: TriggerReason::CountThreshold { corrections },
                cooldown_mark: corrections + self.rearm_step,
            });
        }

        let rate = self.error_rate(corrections, fields_extracted);
        if rate >= self.error_rate_threshold && corrections >= self.rate_volume_floor {
            return Some(LearningTrigger {
                reason: TriggerReason::ErrorRate { rate, corrections },
                cooldown_mark: corrections + self.rearm_step,
            });
        }

        None
    }

    /// Group corrections by field, newest examples first up to the cap.
    /// Input order is preserved inside each cluster, so callers passing
    /// newest-first rows get newest-first examples.
    pub fn cluster(&self, corrections: &[Correction]) -> Vec<CorrectionCluster> {
        let mut grouped: HashMap<&str, CorrectionCluster> = HashMap::new();
        for c in corrections {
            let cluster = grouped
                .entry(c.field_name.as_str())
                .or_insert_with(|| CorrectionCluster {
                    field_name: c.field_name.clone(),
                    count: 0,
                    examples: Vec::new(),
                });
            cluster.count += 1;
            if cluster.examples.len() < self.max_examples {
                cluster.examples.push(CorrectionExample {
                    original: c.original_value.clone(),
                    corrected: c.corrected_value.clone(),
                });
            }
        }

        let mut clusters: Vec<CorrectionCluster> = grouped.into_values().collect();
        clusters.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.field_name.cmp(&b.field_name)));
        clusters
    }

    /// Rule lines for clusters with enough evidence. These ride along with
    /// future extraction prompts verbatim, one line per field.
    pub fn synthesize_rules(&self, clusters: &[CorrectionCluster]) -> Vec<String> {
        clusters
            .iter()
            .filter(|c| c.count >= self.min_cluster_for_rule)
            .map(|c| {
                let example = c
                    .examples
                    .first()
                    .map(|e| format!(": '{}' → '{}'", e.original, e.corrected))
                    .unwrap_or_default();
                format!(
                    "{} (corrected {} times){}",
                    c.field_name, c.count, example
                )
            })
            .collect()
    }
}

impl Default for LearningEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// EXTERNAL MEMORY SYNC
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub skipped: bool,
    pub failures: Vec<String>,
}

impl SyncReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Pushes synthesized rules to the external memory channel so other
/// deployments pick them up. Missing endpoint means sync is skipped,
/// never an error.
pub struct MemorySyncClient {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_key: String,
}

impl MemorySyncClient {
    pub fn new(config: &PipelineConfig) -> Self {
        MemorySyncClient {
            http: reqwest::Client::new(),
            endpoint: config.memory_url.clone(),
            api_key: config.memory_api_key.clone(),
        }
    }

    pub async fn sync(&self, clusters: &[CorrectionCluster], rules: &[String]) -> SyncReport {
        let endpoint = match &self.endpoint {
            Some(e) => e.clone(),
            None => {
                return SyncReport {
                    pushed: 0,
                    skipped: true,
                    failures: Vec::new(),
                }
            }
        };

        let mut pushed = 0;
        let mut failures = Vec::new();
        for (cluster, rule) in clusters.iter().zip(rules.iter()) {
            match self.push_cluster(&endpoint, cluster, rule).await {
                Ok(()) => pushed += 1,
                Err(e) => {
                    warn!(field = %e.field, error = %e.message, "memory sync push failed");
                    failures.push(e.to_string());
                }
            }
        }
        info!(pushed, failed = failures.len(), "memory sync complete");
        SyncReport {
            pushed,
            skipped: false,
            failures,
        }
    }

    async fn push_cluster(
        &self,
        endpoint: &str,
        cluster: &CorrectionCluster,
        rule: &str,
    ) -> Result<(), LearningSyncError> {
        let body = serde_json::json!({
            "field": cluster.field_name,
            "rule": rule,
            "count": cluster.count,
            "examples": cluster.examples,
        });

        let mut request = self.http.post(endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| LearningSyncError {
            field: cluster.field_name.clone(),
            message: e.to_string(),
        })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(LearningSyncError {
                field: cluster.field_name.clone(),
                message: format!("memory endpoint returned {}", response.status()),
            })
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_correction(field: &str, original: &str, corrected: &str) -> Correction {
        Correction::new("doc-1", field, original, corrected, "reviewer@test")
    }

    #[test]
    fn test_trigger_below_both_thresholds() {
        let engine = LearningEngine::new();
        assert_eq!(engine.maybe_trigger(99, 10_000, 0), None);
    }

    #[test]
    fn test_trigger_at_count_threshold() {
        let engine = LearningEngine::new();
        let trigger = engine.maybe_trigger(100, 10_000, 0).unwrap();
        assert_eq!(
            trigger.reason,
            TriggerReason::CountThreshold { corrections: 100 }
        );
        assert_eq!(trigger.cooldown_mark, 125);
    }

    #[test]
    fn test_cooldown_holds_until_rearm_mark() {
        let engine = LearningEngine::new();
        // Fired at 100, re-armed at 125
        assert_eq!(engine.maybe_trigger(101, 10_000, 125), None);
        assert_eq!(engine.maybe_trigger(124, 10_000, 125), None);

        let trigger = engine.maybe_trigger(125, 10_000, 125).unwrap();
        assert_eq!(trigger.cooldown_mark, 150);
    }

    #[test]
    fn test_error_rate_trigger() {
        let engine = LearningEngine::new();
        // 30 corrections over 200 fields = 15%
        let trigger = engine.maybe_trigger(30, 200, 0).unwrap();
        match trigger.reason {
            TriggerReason::ErrorRate { rate, corrections } => {
                assert!((rate - 0.15).abs() < 1e-9);
                assert_eq!(corrections, 30);
            }
            _ => panic!("expected rate trigger"),
        }
        assert_eq!(trigger.cooldown_mark, 55);
    }

    #[test]
    fn test_error_rate_needs_volume() {
        let engine = LearningEngine::new();
        // 20% rate but only 10 corrections: too little evidence
        assert_eq!(engine.maybe_trigger(10, 50, 0), None);
    }

    #[test]
    fn test_error_rate_with_no_fields() {
        let engine = LearningEngine::new();
        assert_eq!(engine.error_rate(5, 0), 0.0);
    }

    #[test]
    fn test_clustering_caps_examples() {
        let engine = LearningEngine::new();
        let mut corrections = Vec::new();
        for i in 0..7 {
            corrections.push(create_test_correction(
                "account_number",
                &format!("bad-{}", i),
                &format!("good-{}", i),
            ));
        }
        corrections.push(create_test_correction("vendor_name", "ACNE", "ACME"));

        let clusters = engine.cluster(&corrections);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].field_name, "account_number");
        assert_eq!(clusters[0].count, 7);
        assert_eq!(clusters[0].examples.len(), 5);
        assert_eq!(clusters[1].count, 1);
    }

    #[test]
    fn test_rule_synthesis_needs_cluster_minimum() {
        let engine = LearningEngine::new();
        let corrections = vec![
            create_test_correction("account_number", "12B45", "12845"),
            create_test_correction("account_number", "99O01", "99001"),
            create_test_correction("account_number", "4I400", "41400"),
            create_test_correction("vendor_name", "ACNE", "ACME"),
        ];
        let clusters = engine.cluster(&corrections);
        let rules = engine.synthesize_rules(&clusters);

        assert_eq!(rules.len(), 1);
        assert!(rules[0].contains("account_number"));
        assert!(rules[0].contains("corrected 3 times"));
        assert!(rules[0].contains("12B45"));
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in [
            LearningEventKind::CorrectionClusterUpdate,
            LearningEventKind::LearningSync,
            LearningEventKind::ManualTrigger,
        ] {
            assert_eq!(LearningEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LearningEventKind::parse("other"), None);
    }

    #[tokio::test]
    async fn test_sync_skipped_without_endpoint() {
        let client = MemorySyncClient::new(&PipelineConfig::default());
        let clusters = vec![CorrectionCluster {
            field_name: "account_number".to_string(),
            count: 4,
            examples: vec![],
        }];
        let report = client.sync(&clusters, &["rule".to_string()]).await;
        assert!(report.skipped);
        assert_eq!(report.pushed, 0);
        assert!(report.ok());
    }
}
