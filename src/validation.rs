// 🕵️ Forensic Validation Engine - Independent Checks + Confidence Composition
// Runs every anomaly check over the extracted transaction set, composes the
// confidence penalty, and decides the document's resulting status.
//
// Checks are isolated: one check failing internally becomes an info anomaly
// and the rest still run. Error-class anomalies force REVIEW; the fraud-pattern
// family (benford/structuring/velocity/ghost/synthetic) can never cost more
// than 12 percentage points combined.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use crate::currency::CurrencyProfile;
use crate::document::DocumentStatus;
use crate::spreadsheet::{MetadataDiscrepancy, NormalizedRow};

/// Checks whose combined confidence penalty is capped.
pub const FRAUD_PATTERN_CHECKS: &[&str] = &[
    "benford_deviation",
    "structuring",
    "velocity",
    "ghost_lifestyle",
    "synthetic_pattern",
];

// ============================================================================
// ANOMALY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "critical" => Some(Severity::Critical),
            "warning" => Some(Severity::Warning),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }
}

/// Error-class anomalies force REVIEW and carry the heaviest penalty;
/// warning-class anomalies only cost confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyClass {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// Stable check tag ("benford_deviation", "structuring", ...)
    pub check: String,
    pub class: AnomalyClass,
    pub severity: Severity,
    pub description: String,
    pub details: serde_json::Value,
    /// Affected transaction row indexes (empty = document-level)
    pub rows: Vec<usize>,
}

impl Anomaly {
    pub fn error(check: &str, description: impl Into<String>, details: serde_json::Value) -> Self {
        Anomaly {
            check: check.to_string(),
            class: AnomalyClass::Error,
            severity: Severity::Critical,
            description: description.into(),
            details,
            rows: Vec::new(),
        }
    }

    pub fn warning(
        check: &str,
        severity: Severity,
        description: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Anomaly {
            check: check.to_string(),
            class: AnomalyClass::Warning,
            severity,
            description: description.into(),
            details,
            rows: Vec::new(),
        }
    }

    pub fn info(check: &str, description: impl Into<String>, details: serde_json::Value) -> Self {
        Anomaly::warning(check, Severity::Info, description, details)
    }

    pub fn with_rows(mut self, rows: Vec<usize>) -> Self {
        self.rows = rows;
        self
    }

    pub fn is_fraud_pattern(&self) -> bool {
        FRAUD_PATTERN_CHECKS.contains(&self.check.as_str())
    }
}

// ============================================================================
// INPUT / OUTCOME
// ============================================================================

/// Prior statement of the same account, for continuity and coverage checks.
#[derive(Debug, Clone, Default)]
pub struct PriorStatementContext {
    pub closing_balance: Option<f64>,
    pub period_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationInput {
    pub doc_type: String,
    pub raw_confidence: f64,
    pub currency: CurrencyProfile,
    pub rows: Vec<NormalizedRow>,
    pub opening_balance: Option<f64>,
    pub closing_balance: Option<f64>,
    pub period_from: Option<String>,
    pub prior: Option<PriorStatementContext>,
    pub metadata_discrepancy: Option<MetadataDiscrepancy>,
    pub quality_warnings: Vec<String>,
    pub quality_below_floor: bool,
    pub mixed_date_formats: bool,
    pub via_ocr_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub anomalies: Vec<Anomaly>,
    /// Confidence after penalties, clamped to the floor
    pub confidence: f64,
    pub raw_confidence: f64,
    /// Portion of the penalty charged to fraud-pattern checks (post-cap)
    pub fraud_penalty: f64,
    /// VALIDATED or REVIEW
    pub status: DocumentStatus,
    pub status_reason: Option<String>,
}

// ============================================================================
// VALIDATION ENGINE
// ============================================================================

pub struct ValidationEngine {
    // Benford
    pub benford_min_samples: usize,
    pub benford_deviation_threshold: f64,

    // Structuring / currency threshold
    pub structuring_percentile: f64,
    pub structuring_band_fraction: f64,
    pub structuring_min_cluster: usize,

    // Velocity
    pub velocity_sigma: f64,
    pub velocity_min_count: usize,

    // Ghost lifestyle / synthetic
    pub ghost_min_transactions: usize,
    pub synthetic_repetition_ratio: f64,
    pub synthetic_min_rows: usize,
    pub sequential_min_rows: usize,

    // Round numbers / weekend
    pub round_number_floor: f64,
    pub round_number_ratio: f64,
    pub round_number_min_rows: usize,
    pub weekend_min_rows: usize,
    pub weekend_ratio_limit: f64,

    // Balance checks
    pub balance_tolerance: f64,
    pub closing_magnitude_multiplier: f64,
    pub negative_balance_ratio: f64,

    // Cross-statement coverage
    pub coverage_gap_days: i64,

    // Confidence composition
    pub error_penalty: f64,
    pub critical_warning_penalty: f64,
    pub warning_penalty: f64,
    pub info_penalty: f64,
    pub fraud_penalty_cap: f64,
    pub confidence_floor: f64,
    pub review_confidence_threshold: f64,
}

impl ValidationEngine {
    pub fn new() -> Self {
        ValidationEngine {
            benford_min_samples: 20,
            benford_deviation_threshold: 0.25,
            structuring_percentile: 0.90,
            structuring_band_fraction: 0.02,
            structuring_min_cluster: 4,
            velocity_sigma: 2.0,
            velocity_min_count: 3,
            ghost_min_transactions: 10,
            synthetic_repetition_ratio: 0.8,
            synthetic_min_rows: 10,
            sequential_min_rows: 5,
            round_number_floor: 100.0,
            round_number_ratio: 0.30,
            round_number_min_rows: 5,
            weekend_min_rows: 10,
            weekend_ratio_limit: 2.0 * (2.0 / 7.0),
            balance_tolerance: 0.05,
            closing_magnitude_multiplier: 50.0,
            negative_balance_ratio: 0.5,
            coverage_gap_days: 45,
            error_penalty: 0.15,
            critical_warning_penalty: 0.10,
            warning_penalty: 0.03,
            info_penalty: 0.01,
            fraud_penalty_cap: 0.12,
            confidence_floor: 0.10,
            review_confidence_threshold: 0.80,
        }
    }

    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_confidence_threshold = threshold;
        self
    }

    /// Run every check, compose the confidence, decide the status.
    pub fn validate(&self, input: &ValidationInput) -> ValidationOutcome {
        let mut anomalies: Vec<Anomaly> = Vec::new();

        run_check(&mut anomalies, "benford_deviation", || {
            self.check_benford(&input.rows)
        });
        run_check(&mut anomalies, "structuring", || {
            self.check_structuring(&input.rows)
        });
        run_check(&mut anomalies, "velocity", || self.check_velocity(&input.rows));
        run_check(&mut anomalies, "ghost_lifestyle", || {
            self.check_ghost_lifestyle(&input.rows)
        });
        run_check(&mut anomalies, "synthetic_pattern", || {
            self.check_synthetic(&input.rows)
        });
        run_check(&mut anomalies, "balance_continuity", || {
            self.check_balance_continuity(input)
        });
        run_check(&mut anomalies, "date_sequence", || {
            self.check_date_sequence(&input.rows)
        });
        run_check(&mut anomalies, "duplicate_transactions", || {
            self.check_duplicates(&input.rows)
        });
        run_check(&mut anomalies, "round_number_bias", || {
            self.check_round_numbers(&input.rows)
        });
        run_check(&mut anomalies, "weekend_density", || {
            self.check_weekend_density(&input.rows)
        });
        run_check(&mut anomalies, "coverage_gap", || {
            self.check_coverage_gap(input)
        });
        run_check(&mut anomalies, "currency_threshold", || {
            self.check_currency_threshold(&input.rows, &input.currency)
        });

        // Statement-internal supplements
        run_check(&mut anomalies, "running_balance", || {
            self.check_running_balance(&input.rows, input.opening_balance)
        });
        run_check(&mut anomalies, "summary_injection", || {
            self.check_summary_injection(&input.rows, input.closing_balance)
        });
        run_check(&mut anomalies, "closing_magnitude", || {
            self.check_closing_magnitude(&input.rows, input.closing_balance)
        });
        run_check(&mut anomalies, "sustained_negative_balance", || {
            self.check_negative_balances(&input.rows)
        });

        // Upstream signals folded into the same anomaly stream
        if let Some(disc) = &input.metadata_discrepancy {
            anomalies.push(Anomaly::error(
                "metadata_integrity",
                format!("statement metadata contradicts row data: {}", disc.detail),
                json!({
                    "stated_closing": disc.stated_closing,
                    "computed_closing": disc.computed_closing,
                }),
            ));
        }
        if input.mixed_date_formats {
            anomalies.push(Anomaly::info(
                "mixed_date_formats",
                "multiple date formats in one statement (possible merged exports)",
                json!({}),
            ));
        }
        if input.quality_below_floor {
            anomalies.push(Anomaly::warning(
                "low_image_quality",
                Severity::Warning,
                "composite image quality below configured floor",
                json!({ "warnings": input.quality_warnings }),
            ));
        } else {
            for w in &input.quality_warnings {
                anomalies.push(Anomaly::info("image_quality", w.clone(), json!({})));
            }
        }
        if input.via_ocr_fallback {
            anomalies.push(Anomaly::info(
                "ocr_fallback",
                "extraction used the local OCR fallback path",
                json!({}),
            ));
        }

        let (confidence, fraud_penalty) = self.compose_confidence(input.raw_confidence, &anomalies);

        let error_checks: Vec<&str> = {
            let mut seen: Vec<&str> = Vec::new();
            for a in anomalies.iter().filter(|a| a.class == AnomalyClass::Error) {
                if !seen.contains(&a.check.as_str()) {
                    seen.push(&a.check);
                }
            }
            seen
        };

        let (status, status_reason) = if !error_checks.is_empty() {
            (
                DocumentStatus::Review,
                Some(format!("error-class anomalies: {}", error_checks.join(", "))),
            )
        } else if confidence < self.review_confidence_threshold {
            (
                DocumentStatus::Review,
                Some(format!(
                    "confidence {:.2} below review threshold {:.2}",
                    confidence, self.review_confidence_threshold
                )),
            )
        } else {
            (DocumentStatus::Validated, None)
        };

        debug!(
            doc_type = %input.doc_type,
            anomalies = anomalies.len(),
            confidence,
            status = status.as_str(),
            "validation complete"
        );

        ValidationOutcome {
            anomalies,
            confidence,
            raw_confidence: input.raw_confidence,
            fraud_penalty,
            status,
            status_reason,
        }
    }

    /// Exact composition: 15 points per distinct error-class check, 10 per
    /// critical warning, 3 per normal warning, 1 per info; fraud-pattern
    /// contributions capped; floor 10%.
    pub fn compose_confidence(&self, raw: f64, anomalies: &[Anomaly]) -> (f64, f64) {
        let mut seen_error_checks: Vec<&str> = Vec::new();
        let mut fraud_total = 0.0;
        let mut other_total = 0.0;

        for a in anomalies {
            let contribution = match (a.class, a.severity) {
                (AnomalyClass::Error, _) => {
                    if seen_error_checks.contains(&a.check.as_str()) {
                        0.0
                    } else {
                        seen_error_checks.push(&a.check);
                        self.error_penalty
                    }
                }
                (AnomalyClass::Warning, Severity::Critical) => self.critical_warning_penalty,
                (AnomalyClass::Warning, Severity::Warning) => self.warning_penalty,
                (AnomalyClass::Warning, Severity::Info) => self.info_penalty,
            };
            if a.is_fraud_pattern() {
                fraud_total += contribution;
            } else {
                other_total += contribution;
            }
        }

        let fraud_applied = fraud_total.min(self.fraud_penalty_cap);
        let confidence = (raw - other_total - fraud_applied).clamp(self.confidence_floor, 1.0);
        (confidence, fraud_applied)
    }

    // ========================================================================
    // CHECK 1: BENFORD'S LAW
    // ========================================================================

    fn check_benford(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        let digits: Vec<u32> = rows
            .iter()
            .filter_map(|r| leading_digit(r.amount))
            .collect();
        if digits.len() < self.benford_min_samples {
            return Ok(vec![]);
        }

        let mut observed = [0.0f64; 9];
        for d in &digits {
            observed[(*d - 1) as usize] += 1.0;
        }
        let n = digits.len() as f64;
        let mut deviation = 0.0;
        let mut distribution = Vec::with_capacity(9);
        for (i, count) in observed.iter().enumerate() {
            let obs = count / n;
            let expected = (1.0 + 1.0 / (i as f64 + 1.0)).log10();
            deviation += (obs - expected).abs();
            distribution.push(json!({ "digit": i + 1, "observed": obs, "expected": expected }));
        }

        if deviation > self.benford_deviation_threshold {
            Ok(vec![Anomaly::warning(
                "benford_deviation",
                Severity::Warning,
                format!(
                    "leading-digit distribution deviates {:.2} from Benford's law over {} amounts",
                    deviation,
                    digits.len()
                ),
                json!({ "deviation": deviation, "sample_size": digits.len(), "distribution": distribution }),
            )])
        } else {
            Ok(vec![])
        }
    }

    // ========================================================================
    // CHECK 2: STRUCTURING (dynamic percentile band)
    // ========================================================================

    fn check_structuring(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }
        let magnitudes: Vec<f64> = rows.iter().map(|r| r.amount.abs()).collect();
        let p90 = percentile(&magnitudes, self.structuring_percentile);
        if p90 <= 0.0 {
            return Ok(vec![]);
        }
        let band_floor = p90 * (1.0 - self.structuring_band_fraction);

        let mut by_day: HashMap<&str, Vec<usize>> = HashMap::new();
        for r in rows {
            let magnitude = r.amount.abs();
            if magnitude >= band_floor && magnitude <= p90 {
                by_day.entry(r.date.as_str()).or_default().push(r.row_index);
            }
        }

        let mut hits: Vec<(String, Vec<usize>)> = by_day
            .into_iter()
            .filter(|(_, v)| v.len() >= self.structuring_min_cluster)
            .map(|(d, v)| (d.to_string(), v))
            .collect();
        hits.sort();

        if hits.is_empty() {
            return Ok(vec![]);
        }
        let rows_hit: Vec<usize> = hits.iter().flat_map(|(_, v)| v.clone()).collect();
        Ok(vec![Anomaly::warning(
            "structuring",
            Severity::Warning,
            format!(
                "{} same-day cluster(s) of near-threshold amounts (band floor {:.2})",
                hits.len(),
                band_floor
            ),
            json!({ "band_floor": band_floor, "percentile": p90, "clusters": hits }),
        )
        .with_rows(rows_hit)])
    }

    // ========================================================================
    // CHECK 3: VELOCITY
    // ========================================================================

    fn check_velocity(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        let mut by_day: HashMap<&str, usize> = HashMap::new();
        for r in rows {
            *by_day.entry(r.date.as_str()).or_default() += 1;
        }
        if by_day.len() < 3 {
            return Ok(vec![]);
        }

        let counts: Vec<f64> = by_day.values().map(|&c| c as f64).collect();
        let mean = counts.iter().sum::<f64>() / counts.len() as f64;
        let variance =
            counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / counts.len() as f64;
        let limit = mean + self.velocity_sigma * variance.sqrt();

        let mut spikes: Vec<(String, usize)> = by_day
            .iter()
            .filter(|(_, &c)| c as f64 > limit && c >= self.velocity_min_count)
            .map(|(d, &c)| (d.to_string(), c))
            .collect();
        spikes.sort();

        if spikes.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![Anomaly::warning(
            "velocity",
            Severity::Warning,
            format!(
                "{} day(s) with transaction count beyond mean+{:.0}σ ({:.1})",
                spikes.len(),
                self.velocity_sigma,
                limit
            ),
            json!({ "limit": limit, "mean": mean, "spikes": spikes }),
        )])
    }

    // ========================================================================
    // CHECK 4: GHOST LIFESTYLE
    // ========================================================================

    fn check_ghost_lifestyle(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        if rows.len() < self.ghost_min_transactions {
            return Ok(vec![]);
        }
        const LIFESTYLE_MARKERS: &[&str] = &[
            "grocery",
            "groceries",
            "supermarket",
            "restaurant",
            "food",
            "dining",
            "utility",
            "electricity",
            "water",
            "gas",
            "fuel",
            "petrol",
            "pharmacy",
            "medical",
            "rent",
            "recharge",
            "subscription",
        ];
        let lifestyle_hits = rows
            .iter()
            .filter(|r| {
                let text = format!("{} {}", r.description, r.category).to_lowercase();
                LIFESTYLE_MARKERS.iter().any(|m| text.contains(m))
            })
            .count();

        if lifestyle_hits == 0 {
            Ok(vec![Anomaly::warning(
                "ghost_lifestyle",
                Severity::Warning,
                format!(
                    "{} transactions with zero lifestyle spending markers",
                    rows.len()
                ),
                json!({ "transactions": rows.len() }),
            )])
        } else {
            Ok(vec![])
        }
    }

    // ========================================================================
    // CHECK 5: SYNTHETIC PATTERN
    // ========================================================================

    fn check_synthetic(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        let mut found = Vec::new();
        if rows.len() >= self.synthetic_min_rows {
            let mut unique: Vec<i64> = rows.iter().map(|r| cents(r.amount)).collect();
            unique.sort_unstable();
            unique.dedup();
            let repetition = 1.0 - unique.len() as f64 / rows.len() as f64;

            if repetition > self.synthetic_repetition_ratio {
                found.push(Anomaly::warning(
                    "synthetic_pattern",
                    Severity::Warning,
                    format!(
                        "amount repetition ratio {:.2} across {} rows",
                        repetition,
                        rows.len()
                    ),
                    json!({ "repetition_ratio": repetition, "unique_amounts": unique.len() }),
                ));
            } else if unique.len() <= 2 {
                found.push(Anomaly::warning(
                    "synthetic_pattern",
                    Severity::Warning,
                    format!("only {} distinct amount(s) across {} rows", unique.len(), rows.len()),
                    json!({ "unique_amounts": unique.len(), "rows": rows.len() }),
                ));
            }
        }

        // Perfectly sequential amounts (constant nonzero step in row order)
        if rows.len() >= self.sequential_min_rows && found.is_empty() {
            let amounts: Vec<i64> = rows.iter().map(|r| cents(r.amount)).collect();
            let step = amounts[1] - amounts[0];
            if step != 0
                && amounts.windows(2).all(|w| w[1] - w[0] == step)
            {
                found.push(Anomaly::warning(
                    "synthetic_pattern",
                    Severity::Warning,
                    format!(
                        "amounts form a perfect arithmetic sequence (step {:.2}) over {} rows",
                        step as f64 / 100.0,
                        rows.len()
                    ),
                    json!({ "step": step as f64 / 100.0, "rows": rows.len() }),
                ));
            }
        }

        Ok(found)
    }

    // ========================================================================
    // CHECK 6: BALANCE CONTINUITY (prior statement)
    // ========================================================================

    fn check_balance_continuity(&self, input: &ValidationInput) -> anyhow::Result<Vec<Anomaly>> {
        let (prior_closing, opening) = match (
            input.prior.as_ref().and_then(|p| p.closing_balance),
            input.opening_balance,
        ) {
            (Some(p), Some(o)) => (p, o),
            _ => return Ok(vec![]),
        };

        if (prior_closing - opening).abs() > self.balance_tolerance {
            Ok(vec![Anomaly::error(
                "balance_continuity",
                format!(
                    "prior statement closed at {:.2} but this statement opens at {:.2}",
                    prior_closing, opening
                ),
                json!({ "prior_closing": prior_closing, "opening": opening }),
            )])
        } else {
            Ok(vec![])
        }
    }

    // ========================================================================
    // CHECK 7: DATE SEQUENCE
    // ========================================================================

    fn check_date_sequence(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        let mut found = Vec::new();

        let invalid: Vec<usize> = rows
            .iter()
            .filter(|r| !r.date.trim().is_empty() && parse_flexible_date(&r.date).is_none())
            .map(|r| r.row_index)
            .collect();
        if !invalid.is_empty() {
            found.push(
                Anomaly::error(
                    "invalid_dates",
                    format!("{} row(s) with unparseable dates", invalid.len()),
                    json!({ "rows": invalid.iter().take(10).collect::<Vec<_>>() }),
                )
                .with_rows(invalid),
            );
        }

        let mut out_of_order: Vec<usize> = Vec::new();
        let mut prev: Option<NaiveDate> = None;
        for r in rows {
            if let Some(d) = parse_flexible_date(&r.date) {
                if let Some(p) = prev {
                    if d < p {
                        out_of_order.push(r.row_index);
                    }
                }
                prev = Some(d);
            }
        }
        if !out_of_order.is_empty() {
            found.push(
                Anomaly::warning(
                    "date_sequence",
                    Severity::Warning,
                    format!("{} row(s) out of chronological order", out_of_order.len()),
                    json!({ "rows": out_of_order.iter().take(10).collect::<Vec<_>>() }),
                )
                .with_rows(out_of_order),
            );
        }

        Ok(found)
    }

    // ========================================================================
    // CHECK 8: DUPLICATES
    // ========================================================================

    fn check_duplicates(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        let mut groups: HashMap<(String, i64, String), Vec<usize>> = HashMap::new();
        for r in rows {
            let key = (
                r.date.trim().to_string(),
                cents(r.amount),
                r.description.trim().to_lowercase(),
            );
            groups.entry(key).or_default().push(r.row_index);
        }

        let mut duplicated: Vec<Vec<usize>> = groups
            .into_values()
            .filter(|v| v.len() >= 2)
            .collect();
        duplicated.sort();

        if duplicated.is_empty() {
            return Ok(vec![]);
        }
        let rows_hit: Vec<usize> = duplicated.iter().flatten().copied().collect();
        Ok(vec![Anomaly::warning(
            "duplicate_transactions",
            Severity::Warning,
            format!(
                "{} group(s) of identical date+amount+description rows",
                duplicated.len()
            ),
            json!({ "groups": duplicated }),
        )
        .with_rows(rows_hit)])
    }

    // ========================================================================
    // CHECK 9: ROUND-NUMBER BIAS
    // ========================================================================

    fn check_round_numbers(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        if rows.len() < self.round_number_min_rows {
            return Ok(vec![]);
        }
        let round = rows
            .iter()
            .filter(|r| {
                let c = cents(r.amount).abs();
                c >= cents(self.round_number_floor) && c % cents(self.round_number_floor) == 0
            })
            .count();
        let ratio = round as f64 / rows.len() as f64;

        if ratio > self.round_number_ratio {
            Ok(vec![Anomaly::warning(
                "round_number_bias",
                Severity::Warning,
                format!(
                    "{:.0}% of amounts are round multiples of {:.0}",
                    ratio * 100.0,
                    self.round_number_floor
                ),
                json!({ "ratio": ratio, "round_count": round, "total": rows.len() }),
            )])
        } else {
            Ok(vec![])
        }
    }

    // ========================================================================
    // CHECK 10: WEEKEND DENSITY
    // ========================================================================

    fn check_weekend_density(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        if rows.len() < self.weekend_min_rows {
            return Ok(vec![]);
        }
        let parsed: Vec<NaiveDate> = rows
            .iter()
            .filter_map(|r| parse_flexible_date(&r.date))
            .collect();
        if parsed.len() < self.weekend_min_rows {
            return Ok(vec![]);
        }
        let weekend = parsed
            .iter()
            .filter(|d| {
                matches!(d.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
            })
            .count();
        let ratio = weekend as f64 / parsed.len() as f64;

        if ratio > self.weekend_ratio_limit {
            Ok(vec![Anomaly::warning(
                "weekend_density",
                Severity::Warning,
                format!(
                    "{:.0}% of transactions fall on weekends (limit {:.0}%)",
                    ratio * 100.0,
                    self.weekend_ratio_limit * 100.0
                ),
                json!({ "ratio": ratio, "weekend_count": weekend, "total": parsed.len() }),
            )])
        } else {
            Ok(vec![])
        }
    }

    // ========================================================================
    // CHECK 11: CROSS-STATEMENT COVERAGE
    // ========================================================================

    fn check_coverage_gap(&self, input: &ValidationInput) -> anyhow::Result<Vec<Anomaly>> {
        let prior_to = input
            .prior
            .as_ref()
            .and_then(|p| p.period_to.as_deref())
            .and_then(parse_flexible_date);
        let current_from = input.period_from.as_deref().and_then(parse_flexible_date);

        if let (Some(prev_end), Some(this_start)) = (prior_to, current_from) {
            let gap = (this_start - prev_end).num_days();
            if gap > self.coverage_gap_days {
                return Ok(vec![Anomaly::warning(
                    "coverage_gap",
                    Severity::Warning,
                    format!(
                        "{} day gap between this statement and the prior one for the same account",
                        gap
                    ),
                    json!({ "gap_days": gap, "prior_period_to": prev_end.to_string(), "period_from": this_start.to_string() }),
                )]);
            }
        }
        Ok(vec![])
    }

    // ========================================================================
    // CHECK 12: CURRENCY THRESHOLD (fixed reporting limit)
    // ========================================================================

    fn check_currency_threshold(
        &self,
        rows: &[NormalizedRow],
        currency: &CurrencyProfile,
    ) -> anyhow::Result<Vec<Anomaly>> {
        let mut by_day: HashMap<&str, Vec<usize>> = HashMap::new();
        for r in rows {
            if currency.is_near_limit(r.amount) {
                by_day.entry(r.date.as_str()).or_default().push(r.row_index);
            }
        }

        let mut hits: Vec<(String, Vec<usize>)> = by_day
            .into_iter()
            .filter(|(_, v)| v.len() >= self.structuring_min_cluster)
            .map(|(d, v)| (d.to_string(), v))
            .collect();
        hits.sort();

        if hits.is_empty() {
            return Ok(vec![]);
        }
        let rows_hit: Vec<usize> = hits.iter().flat_map(|(_, v)| v.clone()).collect();
        Ok(vec![Anomaly::warning(
            "currency_threshold",
            Severity::Warning,
            format!(
                "same-day cluster(s) just below the {} reporting limit of {:.0}",
                currency.code, currency.reporting_limit
            ),
            json!({
                "currency": currency.code,
                "reporting_limit": currency.reporting_limit,
                "clusters": hits,
            }),
        )
        .with_rows(rows_hit)])
    }

    // ========================================================================
    // SUPPLEMENT: RUNNING BALANCE
    // ========================================================================

    fn check_running_balance(
        &self,
        rows: &[NormalizedRow],
        opening: Option<f64>,
    ) -> anyhow::Result<Vec<Anomaly>> {
        let mut prev = opening;
        let mut mismatches: Vec<usize> = Vec::new();
        for r in rows {
            if let Some(stated) = r.balance {
                if let Some(p) = prev {
                    let expected = p + r.amount;
                    if (expected - stated).abs() > self.balance_tolerance {
                        mismatches.push(r.row_index);
                    }
                }
                // Continue from the stated value: one bad row, one anomaly
                prev = Some(stated);
            } else if let Some(p) = prev {
                prev = Some(p + r.amount);
            }
        }

        if mismatches.is_empty() {
            return Ok(vec![]);
        }
        let description = format!(
            "{} row(s) where previous balance + amount does not match the stated balance",
            mismatches.len()
        );
        let details = json!({ "rows": mismatches.iter().take(10).collect::<Vec<_>>() });

        // Tiny statements lack the context to call this an error
        if rows.len() < 3 {
            Ok(vec![
                Anomaly::info("running_balance", description, details).with_rows(mismatches)
            ])
        } else {
            Ok(vec![
                Anomaly::error("running_balance", description, details).with_rows(mismatches)
            ])
        }
    }

    // ========================================================================
    // SUPPLEMENT: SUMMARY INJECTION / CLOSING MAGNITUDE / NEGATIVE BALANCES
    // ========================================================================

    fn check_summary_injection(
        &self,
        rows: &[NormalizedRow],
        closing: Option<f64>,
    ) -> anyhow::Result<Vec<Anomaly>> {
        let last_balance = rows.iter().rev().find_map(|r| r.balance);
        if let (Some(stated), Some(last)) = (closing, last_balance) {
            if (stated - last).abs() > self.balance_tolerance {
                return Ok(vec![Anomaly::warning(
                    "summary_injection",
                    Severity::Critical,
                    format!(
                        "stated closing balance {:.2} does not match last row balance {:.2}",
                        stated, last
                    ),
                    json!({ "stated_closing": stated, "last_row_balance": last }),
                )]);
            }
        }
        Ok(vec![])
    }

    fn check_closing_magnitude(
        &self,
        rows: &[NormalizedRow],
        closing: Option<f64>,
    ) -> anyhow::Result<Vec<Anomaly>> {
        let closing = match closing {
            Some(c) => c,
            None => return Ok(vec![]),
        };
        let mut balances: Vec<f64> = rows.iter().filter_map(|r| r.balance.map(f64::abs)).collect();
        if balances.len() < 3 {
            return Ok(vec![]);
        }
        balances.sort_by(|a, b| a.total_cmp(b));
        let median = balances[balances.len() / 2];
        if median > 0.0 && closing.abs() > self.closing_magnitude_multiplier * median {
            return Ok(vec![Anomaly::warning(
                "closing_magnitude",
                Severity::Critical,
                format!(
                    "closing balance {:.2} is {:.0}x the median row balance {:.2}",
                    closing,
                    closing.abs() / median,
                    median
                ),
                json!({ "closing": closing, "median_balance": median }),
            )]);
        }
        Ok(vec![])
    }

    fn check_negative_balances(&self, rows: &[NormalizedRow]) -> anyhow::Result<Vec<Anomaly>> {
        let with_balance: Vec<f64> = rows.iter().filter_map(|r| r.balance).collect();
        if with_balance.len() < 3 {
            return Ok(vec![]);
        }
        let negative = with_balance.iter().filter(|&&b| b < 0.0).count();
        let ratio = negative as f64 / with_balance.len() as f64;
        if ratio > self.negative_balance_ratio {
            return Ok(vec![Anomaly::warning(
                "sustained_negative_balance",
                Severity::Warning,
                format!("balance negative on {:.0}% of rows", ratio * 100.0),
                json!({ "ratio": ratio, "negative_rows": negative }),
            )]);
        }
        Ok(vec![])
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Isolation wrapper: a check that faults internally becomes an info anomaly
/// instead of aborting the battery.
fn run_check<F>(anomalies: &mut Vec<Anomaly>, name: &str, check: F)
where
    F: FnOnce() -> anyhow::Result<Vec<Anomaly>>,
{
    match check() {
        Ok(mut found) => anomalies.append(&mut found),
        Err(e) => {
            tracing::warn!(check = name, error = %e, "validation check faulted");
            anomalies.push(Anomaly::info(
                "check_internal_error",
                format!("{} check failed internally: {}", name, e),
                json!({ "check": name }),
            ));
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Leading digit of amounts with magnitude >= 1.
fn leading_digit(amount: f64) -> Option<u32> {
    let mut magnitude = amount.abs();
    if magnitude < 1.0 {
        return None;
    }
    while magnitude >= 10.0 {
        magnitude /= 10.0;
    }
    Some(magnitude as u32)
}

fn cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Linear-interpolation percentile over unsorted data. p in [0, 1].
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

/// Parse statement dates across the formats seen in the wild.
/// Day-first beats month-first for ambiguous slashed dates.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    const FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%d/%m/%Y",
        "%m/%d/%Y",
        "%d-%m-%Y",
        "%d/%m/%y",
        "%d %b %Y",
        "%d-%b-%Y",
        "%b %d, %Y",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::CurrencyRegistry;

    fn create_test_row(index: usize, date: &str, description: &str, amount: f64) -> NormalizedRow {
        NormalizedRow {
            row_index: index,
            date: date.to_string(),
            description: description.to_string(),
            amount,
            balance: None,
            category: String::new(),
        }
    }

    fn create_test_input(rows: Vec<NormalizedRow>) -> ValidationInput {
        ValidationInput {
            doc_type: "bank_statement".to_string(),
            raw_confidence: 0.95,
            currency: CurrencyRegistry::new().get("USD").unwrap().clone(),
            rows,
            opening_balance: None,
            closing_balance: None,
            period_from: None,
            prior: None,
            metadata_discrepancy: None,
            quality_warnings: vec![],
            quality_below_floor: false,
            mixed_date_formats: false,
            via_ocr_fallback: false,
        }
    }

    fn benford_conforming_rows() -> Vec<NormalizedRow> {
        // Leading-digit counts per log10(1+1/d), n=100
        let counts = [30usize, 18, 12, 10, 8, 7, 6, 5, 4];
        let mut rows = Vec::new();
        let mut i = 0;
        for (digit, &count) in counts.iter().enumerate() {
            for k in 0..count {
                let amount = (digit as f64 + 1.0) * 100.0 + k as f64;
                rows.push(create_test_row(i, "2024-05-01", "txn", amount));
                i += 1;
            }
        }
        rows
    }

    #[test]
    fn test_benford_conforming_set_passes() {
        let engine = ValidationEngine::new();
        let found = engine.check_benford(&benford_conforming_rows()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_benford_uniform_digits_fire() {
        let engine = ValidationEngine::new();
        let mut rows = Vec::new();
        let mut i = 0;
        for digit in 1..=9 {
            for k in 0..11 {
                rows.push(create_test_row(
                    i,
                    "2024-05-01",
                    "txn",
                    digit as f64 * 100.0 + k as f64,
                ));
                i += 1;
            }
        }
        let found = engine.check_benford(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "benford_deviation");
        assert_eq!(found[0].severity, Severity::Warning);
        assert!(found[0].is_fraud_pattern());
    }

    #[test]
    fn test_benford_skips_small_samples() {
        let engine = ValidationEngine::new();
        let rows: Vec<NormalizedRow> = (0..10)
            .map(|i| create_test_row(i, "2024-05-01", "txn", 111.0))
            .collect();
        assert!(engine.check_benford(&rows).unwrap().is_empty());
    }

    #[test]
    fn test_structuring_cluster_fires_at_four() {
        let engine = ValidationEngine::new();

        // Five same-day transactions each 2% below a 10,000 threshold
        let rows: Vec<NormalizedRow> = (0..5)
            .map(|i| create_test_row(i, "2024-05-01", "transfer", 9800.0))
            .collect();
        let found = engine.check_structuring(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "structuring");
        assert!(found[0].severity == Severity::Warning || found[0].severity == Severity::Critical);
        assert_eq!(found[0].rows.len(), 5);

        // Two such transactions stay quiet
        let rows: Vec<NormalizedRow> = (0..2)
            .map(|i| create_test_row(i, "2024-05-01", "transfer", 9800.0))
            .collect();
        assert!(engine.check_structuring(&rows).unwrap().is_empty());
    }

    #[test]
    fn test_currency_threshold_uses_registry_limit() {
        let engine = ValidationEngine::new();
        let inr = CurrencyRegistry::new().get("INR").unwrap().clone();

        // 49,000 sits inside the 5% band under the 50,000 INR limit
        let rows: Vec<NormalizedRow> = (0..4)
            .map(|i| create_test_row(i, "2024-05-01", "cash deposit", 49_000.0))
            .collect();
        let found = engine.check_currency_threshold(&rows, &inr).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "currency_threshold");

        let rows: Vec<NormalizedRow> = (0..3)
            .map(|i| create_test_row(i, "2024-05-01", "cash deposit", 49_000.0))
            .collect();
        assert!(engine.check_currency_threshold(&rows, &inr).unwrap().is_empty());
    }

    #[test]
    fn test_velocity_spike_detected() {
        let engine = ValidationEngine::new();
        let mut rows = Vec::new();
        let mut i = 0;
        for day in 1..=10 {
            rows.push(create_test_row(i, &format!("2024-05-{:02}", day), "txn", 10.0));
            i += 1;
        }
        for _ in 0..8 {
            rows.push(create_test_row(i, "2024-05-11", "burst", 10.0));
            i += 1;
        }
        let found = engine.check_velocity(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].description.contains("day(s)"));
    }

    #[test]
    fn test_ghost_lifestyle() {
        let engine = ValidationEngine::new();

        let rows: Vec<NormalizedRow> = (0..12)
            .map(|i| create_test_row(i, "2024-05-01", "WIRE TRANSFER OUT", -5000.0))
            .collect();
        let found = engine.check_ghost_lifestyle(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "ghost_lifestyle");

        let mut rows = rows;
        rows.push(create_test_row(12, "2024-05-02", "GROCERY MART", -45.0));
        assert!(engine.check_ghost_lifestyle(&rows).unwrap().is_empty());
    }

    #[test]
    fn test_synthetic_repetition_and_sequence() {
        let engine = ValidationEngine::new();

        // Ten identical amounts: repetition ratio 0.9
        let rows: Vec<NormalizedRow> = (0..10)
            .map(|i| create_test_row(i, "2024-05-01", "txn", 500.0))
            .collect();
        let found = engine.check_synthetic(&rows).unwrap();
        assert_eq!(found.len(), 1);

        // Perfect arithmetic sequence
        let rows: Vec<NormalizedRow> = (0..6)
            .map(|i| create_test_row(i, "2024-05-01", "txn", 100.0 * (i as f64 + 1.0)))
            .collect();
        let found = engine.check_synthetic(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].description.contains("arithmetic sequence"));

        // Organic amounts stay quiet
        let amounts = [12.34, 56.11, 9.87, 105.44, 33.2, 71.09];
        let rows: Vec<NormalizedRow> = amounts
            .iter()
            .enumerate()
            .map(|(i, &a)| create_test_row(i, "2024-05-01", "txn", a))
            .collect();
        assert!(engine.check_synthetic(&rows).unwrap().is_empty());
    }

    #[test]
    fn test_balance_continuity_error() {
        let engine = ValidationEngine::new();
        let mut input = create_test_input(vec![]);
        input.opening_balance = Some(5_000.0);
        input.prior = Some(PriorStatementContext {
            closing_balance: Some(4_200.0),
            period_to: None,
        });

        let found = engine.check_balance_continuity(&input).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class, AnomalyClass::Error);

        // Within tolerance: silent
        input.prior = Some(PriorStatementContext {
            closing_balance: Some(5_000.03),
            period_to: None,
        });
        assert!(engine.check_balance_continuity(&input).unwrap().is_empty());
    }

    #[test]
    fn test_date_sequence_and_invalid_dates() {
        let engine = ValidationEngine::new();
        let rows = vec![
            create_test_row(0, "2024-05-03", "a", -1.0),
            create_test_row(1, "2024-05-01", "b", -1.0),
            create_test_row(2, "not a date", "c", -1.0),
        ];
        let found = engine.check_date_sequence(&rows).unwrap();
        assert_eq!(found.len(), 2);

        let invalid = found.iter().find(|a| a.check == "invalid_dates").unwrap();
        assert_eq!(invalid.class, AnomalyClass::Error);
        assert_eq!(invalid.rows, vec![2]);

        let order = found.iter().find(|a| a.check == "date_sequence").unwrap();
        assert_eq!(order.class, AnomalyClass::Warning);
        assert_eq!(order.rows, vec![1]);
    }

    #[test]
    fn test_duplicates() {
        let engine = ValidationEngine::new();
        let rows = vec![
            create_test_row(0, "2024-05-01", "COFFEE SHOP", -4.5),
            create_test_row(1, "2024-05-01", "coffee shop", -4.5),
            create_test_row(2, "2024-05-01", "BOOKSTORE", -20.0),
        ];
        let found = engine.check_duplicates(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rows, vec![0, 1]);
    }

    #[test]
    fn test_round_number_bias() {
        let engine = ValidationEngine::new();
        let rows: Vec<NormalizedRow> = [500.0, 1200.0, 300.0, 47.12, 88.3, 9.99]
            .iter()
            .enumerate()
            .map(|(i, &a)| create_test_row(i, "2024-05-01", "txn", a))
            .collect();
        // 3 of 6 round: ratio 0.5 > 0.3
        let found = engine.check_round_numbers(&rows).unwrap();
        assert_eq!(found.len(), 1);

        let rows: Vec<NormalizedRow> = [500.0, 47.12, 88.3, 9.99, 12.01]
            .iter()
            .enumerate()
            .map(|(i, &a)| create_test_row(i, "2024-05-01", "txn", a))
            .collect();
        assert!(engine.check_round_numbers(&rows).unwrap().is_empty());
    }

    #[test]
    fn test_weekend_density() {
        let engine = ValidationEngine::new();
        // 2024-05-04 and 2024-05-05 are Sat/Sun; 8 weekend rows of 10
        let mut rows: Vec<NormalizedRow> = (0..4)
            .map(|i| create_test_row(i, "2024-05-04", "txn", -10.0))
            .collect();
        for i in 4..8 {
            rows.push(create_test_row(i, "2024-05-05", "txn", -10.0));
        }
        rows.push(create_test_row(8, "2024-05-06", "txn", -10.0));
        rows.push(create_test_row(9, "2024-05-07", "txn", -10.0));

        let found = engine.check_weekend_density(&rows).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "weekend_density");
    }

    #[test]
    fn test_coverage_gap() {
        let engine = ValidationEngine::new();
        let mut input = create_test_input(vec![]);
        input.period_from = Some("2024-06-01".to_string());
        input.prior = Some(PriorStatementContext {
            closing_balance: None,
            period_to: Some("2024-03-01".to_string()),
        });

        let found = engine.check_coverage_gap(&input).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].check, "coverage_gap");

        input.prior = Some(PriorStatementContext {
            closing_balance: None,
            period_to: Some("2024-05-28".to_string()),
        });
        assert!(engine.check_coverage_gap(&input).unwrap().is_empty());
    }

    #[test]
    fn test_running_balance_mismatch_is_error() {
        let engine = ValidationEngine::new();
        let mut rows = vec![
            create_test_row(0, "2024-05-01", "a", -100.0),
            create_test_row(1, "2024-05-02", "b", -50.0),
            create_test_row(2, "2024-05-03", "c", -25.0),
        ];
        rows[0].balance = Some(900.0);
        rows[1].balance = Some(850.0);
        rows[2].balance = Some(700.0); // should be 825

        let found = engine.check_running_balance(&rows, Some(1000.0)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class, AnomalyClass::Error);
        assert_eq!(found[0].rows, vec![2]);
    }

    #[test]
    fn test_running_balance_downgrades_for_tiny_statements() {
        let engine = ValidationEngine::new();
        let mut rows = vec![create_test_row(0, "2024-05-01", "a", -100.0)];
        rows[0].balance = Some(500.0); // opening 1000 - 100 = 900, stated 500

        let found = engine.check_running_balance(&rows, Some(1000.0)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Info);
        assert_eq!(found[0].class, AnomalyClass::Warning);
    }

    #[test]
    fn test_summary_injection_and_magnitude() {
        let engine = ValidationEngine::new();
        let mut rows = vec![
            create_test_row(0, "2024-05-01", "a", -5.0),
            create_test_row(1, "2024-05-02", "b", -20.0),
            create_test_row(2, "2024-05-03", "c", -10.0),
        ];
        rows[0].balance = Some(995.0);
        rows[1].balance = Some(975.0);
        rows[2].balance = Some(965.0);

        let found = engine
            .check_summary_injection(&rows, Some(2_500_000.0))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Critical);
        assert_eq!(found[0].class, AnomalyClass::Warning);

        let found = engine
            .check_closing_magnitude(&rows, Some(2_500_000.0))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Critical);

        // Honest closing: both quiet
        assert!(engine.check_summary_injection(&rows, Some(965.0)).unwrap().is_empty());
        assert!(engine.check_closing_magnitude(&rows, Some(965.0)).unwrap().is_empty());
    }

    #[test]
    fn test_confidence_composition_exact() {
        let engine = ValidationEngine::new();
        let anomalies = vec![
            Anomaly::error("metadata_integrity", "bad metadata", json!({})),
            Anomaly::warning("summary_injection", Severity::Critical, "injected", json!({})),
        ];
        let (confidence, fraud) = engine.compose_confidence(0.95, &anomalies);
        assert!((confidence - 0.70).abs() < 1e-9);
        assert_eq!(fraud, 0.0);
    }

    #[test]
    fn test_confidence_counts_error_checks_once() {
        let engine = ValidationEngine::new();
        // Same error-class check firing on many rows costs 15 points once
        let anomalies = vec![
            Anomaly::error("running_balance", "row 3", json!({})),
            Anomaly::error("running_balance", "row 7", json!({})),
            Anomaly::error("running_balance", "row 9", json!({})),
        ];
        let (confidence, _) = engine.compose_confidence(0.95, &anomalies);
        assert!((confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_fraud_penalty_cap() {
        let engine = ValidationEngine::new();
        let anomalies: Vec<Anomaly> = FRAUD_PATTERN_CHECKS
            .iter()
            .map(|c| Anomaly::warning(c, Severity::Warning, "fires", json!({})))
            .collect();
        // 5 x 0.03 = 0.15, capped at 0.12
        let (confidence, fraud) = engine.compose_confidence(0.95, &anomalies);
        assert!((fraud - 0.12).abs() < 1e-9);
        assert!((confidence - 0.83).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_floor() {
        let engine = ValidationEngine::new();
        let anomalies = vec![
            Anomaly::error("metadata_integrity", "a", json!({})),
            Anomaly::error("invalid_dates", "b", json!({})),
        ];
        let (confidence, _) = engine.compose_confidence(0.20, &anomalies);
        assert!((confidence - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_status_decision() {
        let engine = ValidationEngine::new();

        // Clean document validates
        let input = create_test_input(vec![
            create_test_row(0, "2024-05-01", "GROCERY MART", -45.0),
            create_test_row(1, "2024-05-02", "SALARY", 3000.0),
        ]);
        let outcome = engine.validate(&input);
        assert_eq!(outcome.status, DocumentStatus::Validated);
        assert!(outcome.status_reason.is_none());

        // Error-class anomaly forces review regardless of confidence
        let mut input = create_test_input(vec![]);
        input.metadata_discrepancy = Some(MetadataDiscrepancy {
            stated_closing: 1_000_000.0,
            computed_closing: 850.0,
            detail: "inflated".to_string(),
        });
        let outcome = engine.validate(&input);
        assert_eq!(outcome.status, DocumentStatus::Review);
        assert!(outcome
            .status_reason
            .as_deref()
            .unwrap()
            .contains("metadata_integrity"));

        // Low raw confidence alone routes to review
        let mut input = create_test_input(vec![]);
        input.raw_confidence = 0.55;
        let outcome = engine.validate(&input);
        assert_eq!(outcome.status, DocumentStatus::Review);
        assert!(outcome
            .status_reason
            .as_deref()
            .unwrap()
            .contains("below review threshold"));
    }

    #[test]
    fn test_check_fault_isolation() {
        let mut anomalies = Vec::new();
        run_check(&mut anomalies, "exploding", || {
            anyhow::bail!("division by zero")
        });
        run_check(&mut anomalies, "healthy", || {
            Ok(vec![Anomaly::info("healthy", "fine", json!({}))])
        });

        // The fault became an info anomaly; the next check still ran
        assert_eq!(anomalies.len(), 2);
        assert_eq!(anomalies[0].check, "check_internal_error");
        assert_eq!(anomalies[0].severity, Severity::Info);
        assert!(anomalies[0].description.contains("exploding"));
        assert_eq!(anomalies[1].check, "healthy");
    }

    #[test]
    fn test_quality_and_ocr_signals() {
        let engine = ValidationEngine::new();
        let mut input = create_test_input(vec![]);
        input.quality_below_floor = true;
        input.quality_warnings = vec!["high blur".to_string()];
        input.via_ocr_fallback = true;
        input.raw_confidence = 0.95;

        let outcome = engine.validate(&input);
        assert!(outcome.anomalies.iter().any(|a| a.check == "low_image_quality"));
        assert!(outcome.anomalies.iter().any(|a| a.check == "ocr_fallback"));
        // 0.95 - 0.03 (quality warning) - 0.01 (ocr info) = 0.91
        assert!((outcome.confidence - 0.91).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_interpolation() {
        let values = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 1.0), 40.0);
        assert_eq!(percentile(&values, 0.5), 25.0);
        assert!((percentile(&values, 0.9) - 37.0).abs() < 1e-9);
    }

    #[test]
    fn test_flexible_date_parsing() {
        assert_eq!(
            parse_flexible_date("2024-05-01"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(
            parse_flexible_date("01/05/2024"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(
            parse_flexible_date("01 May 2024"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(parse_flexible_date("garbage"), None);
        assert_eq!(parse_flexible_date(""), None);
    }

    #[test]
    fn test_leading_digit() {
        assert_eq!(leading_digit(9823.45), Some(9));
        assert_eq!(leading_digit(-150.0), Some(1));
        assert_eq!(leading_digit(7.2), Some(7));
        assert_eq!(leading_digit(0.45), None);
    }
}
