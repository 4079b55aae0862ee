// 🏭 Forensic Pipeline - Per-Document Orchestration
// One task per document: normalize → extract → validate → resolve entities →
// persist. Reanalysis re-runs the same path while the audit trail and the
// correction history stay on record. Status transitions for a single document
// serialize behind a per-document lock; unrelated documents never contend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::currency::CurrencyRegistry;
use crate::db::{self, StoredAnomaly, StoredTransaction};
use crate::document::{Document, DocumentStatus, FieldValue, SourceFormat};
use crate::entity_resolution::EntityResolver;
use crate::error::ExtractError;
use crate::extraction::{ExtractionClient, ExtractionResult};
use crate::graph::{EntityRef, GraphBuilder, KnowledgeGraph};
use crate::learning::{
    Correction, CorrectionCluster, LearningEngine, LearningEvent, LearningEventKind,
    MemorySyncClient,
};
use crate::quality::{GrayImage, QualityEngine};
use crate::spreadsheet::{NormalizedRow, NormalizedStatement, SpreadsheetNormalizer};
use crate::validation::{PriorStatementContext, ValidationEngine, ValidationInput};

const STATE_FIELDS_EXTRACTED: &str = "fields_extracted";
const STATE_COOLDOWN_MARK: &str = "learning_cooldown_mark";
const STATE_LEARNED_RULES: &str = "learned_rules";

// ============================================================================
// READ-MODEL SHAPES
// ============================================================================

/// Everything the review surface needs for one document.
#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub document: Document,
    pub transactions: Vec<StoredTransaction>,
    pub anomalies: Vec<StoredAnomaly>,
    pub corrections: Vec<Correction>,
    pub entities: Vec<EntityLink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityLink {
    pub entity_id: String,
    pub canonical_name: String,
    pub category: String,
    pub relationship: String,
    pub mention_count: i64,
}

#[derive(Debug, Serialize)]
pub struct LearningStatus {
    pub corrections_total: usize,
    pub fields_extracted: usize,
    pub error_rate: f64,
    pub cooldown_mark: usize,
    pub clusters: Vec<CorrectionCluster>,
    pub active_rules: Vec<String>,
    pub recent_events: Vec<LearningEvent>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct ForensicPipeline {
    config: PipelineConfig,
    db: Arc<Mutex<Connection>>,
    extractor: ExtractionClient,
    normalizer: SpreadsheetNormalizer,
    quality: QualityEngine,
    validator: ValidationEngine,
    resolver: EntityResolver,
    graph: GraphBuilder,
    learning: LearningEngine,
    memory_sync: MemorySyncClient,
    /// One lock per document id: reanalysis and finalization serialize
    /// per document, never across documents.
    doc_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ForensicPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let conn = db::open_database(Path::new(&config.db_path))?;
        Self::with_connection(config, conn)
    }

    /// Pipeline over an already-open connection (in-memory under test).
    pub fn with_connection(config: PipelineConfig, conn: Connection) -> Result<Self> {
        db::setup_database(&conn)?;
        let extractor = ExtractionClient::new(&config)?;
        let validator =
            ValidationEngine::new().with_review_threshold(config.review_confidence_threshold);
        Ok(ForensicPipeline {
            extractor,
            normalizer: SpreadsheetNormalizer::new(),
            quality: QualityEngine::new(),
            validator,
            resolver: EntityResolver::with_threshold(config.entity_merge_threshold),
            graph: GraphBuilder::new(),
            learning: LearningEngine::from_config(&config),
            memory_sync: MemorySyncClient::new(&config),
            db: Arc::new(Mutex::new(conn)),
            doc_locks: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().expect("database mutex poisoned")
    }

    fn doc_lock(&self, doc_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.doc_locks.lock().expect("lock map poisoned");
        Arc::clone(
            locks
                .entry(doc_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Accept an upload, create the document record, and process it to a
    /// settled status. Returns the document as persisted.
    pub async fn submit_document(
        &self,
        bytes: &[u8],
        filename: &str,
        batch_id: Option<&str>,
    ) -> Result<Document> {
        if bytes.len() > self.config.max_upload_mb * 1024 * 1024 {
            return Err(anyhow!(
                "upload exceeds {} MB limit",
                self.config.max_upload_mb
            ));
        }

        let format = SourceFormat::detect(filename, bytes);
        let mut doc = Document::new(filename, format);
        if let Some(batch) = batch_id {
            doc = doc.with_batch(batch);
        }

        {
            let conn = self.conn();
            db::insert_document(&conn, &doc)?;
            db::save_document_blob(&conn, &doc.id, bytes)?;
        }
        info!(doc_id = %doc.id, filename, format = format.as_str(), "document submitted");

        self.process(&doc.id).await
    }

    /// Run (or re-run) the full pipeline for a stored document.
    async fn process(&self, doc_id: &str) -> Result<Document> {
        let lock = self.doc_lock(doc_id);
        let _guard = lock.lock().await;

        let (mut doc, bytes) = {
            let conn = self.conn();
            let doc = db::get_document(&conn, doc_id)?
                .ok_or_else(|| anyhow!("document {} not found", doc_id))?;
            let bytes = db::get_document_blob(&conn, doc_id)?
                .ok_or_else(|| anyhow!("document {} has no stored content", doc_id))?;
            (doc, bytes)
        };

        if doc.status == DocumentStatus::Pending {
            doc.transition_to(DocumentStatus::Processing)?;
        } else if doc.status != DocumentStatus::Processing {
            // reanalyze() already moved it; anything else is a caller bug
            doc.reanalyze()?;
        }
        {
            let conn = self.conn();
            db::set_document_status(&conn, &doc.id, DocumentStatus::Processing, None, "pipeline")?;
        }

        let started = Instant::now();
        let outcome = self.run_extraction(&doc, &bytes).await;
        match outcome {
            Ok((extraction, statement, quality)) => {
                self.finalize(&mut doc, extraction, statement, quality, started)?;
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(doc_id = %doc.id, error = %reason, "document failed");
                doc.transition_to(DocumentStatus::Failed)?;
                doc.status_reason = Some(reason.clone());
                doc.processing_time_ms = Some(started.elapsed().as_millis() as i64);
                let conn = self.conn();
                db::update_document(&conn, &doc)?;
                db::set_document_status(
                    &conn,
                    &doc.id,
                    DocumentStatus::Failed,
                    Some(&reason),
                    "pipeline",
                )?;
            }
        }

        let conn = self.conn();
        db::get_document(&conn, doc_id)?.ok_or_else(|| anyhow!("document {} vanished", doc_id))
    }

    /// Format-specific extraction. Spreadsheets that normalize locally skip
    /// the model round-trip entirely; everything else goes through the model
    /// with retry, backoff and the OCR fallback.
    async fn run_extraction(
        &self,
        doc: &Document,
        bytes: &[u8],
    ) -> Result<
        (
            ExtractionResult,
            Option<NormalizedStatement>,
            QualitySignals,
        ),
        ExtractError,
    > {
        let mut quality = QualitySignals::default();

        if doc.source_format == SourceFormat::Spreadsheet {
            match self.normalizer.normalize(bytes) {
                Ok(statement) => {
                    let extraction = extraction_from_statement(&statement);
                    return Ok((extraction, Some(statement), quality));
                }
                Err(e) => {
                    // Binary workbook or mangled export: the model path owns it
                    warn!(doc_id = %doc.id, error = %e, "local normalization failed, using model");
                }
            }
        }

        if doc.source_format == SourceFormat::Image {
            if let Some(image) = GrayImage::from_pgm(bytes) {
                let assessment = self.quality.assess(&image);
                // No skew estimate for opaque uploads; the plan keeps the
                // fixed denoise/contrast/threshold steps
                let plan = self.quality.plan_enhancement(0.0);
                info!(
                    doc_id = %doc.id,
                    score = assessment.score,
                    steps = plan.len(),
                    "image quality assessed"
                );
                quality.score = Some(assessment.score);
                quality.below_floor = assessment.score < self.config.quality_floor;
                quality.warnings = assessment.warnings;
            }
        }

        let rules = self.active_rules();
        let extraction = self.extractor.extract(bytes, &doc.filename, &rules).await?;
        Ok((extraction, None, quality))
    }

    /// Validate, persist, and settle a successfully extracted document.
    fn finalize(
        &self,
        doc: &mut Document,
        extraction: ExtractionResult,
        statement: Option<NormalizedStatement>,
        quality: QualitySignals,
        started: Instant,
    ) -> Result<()> {
        let currencies = CurrencyRegistry::new();

        doc.doc_type = extraction.doc_type.clone();
        doc.language = extraction.language.clone();
        doc.quality_score = quality.score;
        doc.extracted_fields = extraction.fields.clone();

        // Statement-derived values win over model guesses for balances
        let rows: Vec<NormalizedRow>;
        let mut metadata_discrepancy = None;
        let mut mixed_date_formats = false;
        if let Some(stmt) = &statement {
            rows = stmt.rows.clone();
            metadata_discrepancy = stmt.metadata_discrepancy.clone();
            mixed_date_formats = stmt.mixed_date_formats;
            if let Some(v) = stmt.opening_balance {
                doc.extracted_fields
                    .insert("opening_balance".to_string(), FieldValue::Number(v));
            }
            if let Some(v) = stmt.closing_balance {
                doc.extracted_fields
                    .insert("closing_balance".to_string(), FieldValue::Number(v));
            }
            doc.currency = stmt
                .currency
                .clone()
                .or(extraction.currency.clone())
                .unwrap_or_default();
        } else {
            rows = extraction
                .transactions
                .iter()
                .enumerate()
                .map(|(i, r)| NormalizedRow {
                    row_index: i,
                    date: r.date.clone(),
                    description: r.description.clone(),
                    amount: r.amount,
                    balance: r.balance,
                    category: r.category.clone(),
                })
                .collect();
            doc.currency = extraction.currency.clone().unwrap_or_default();
        }

        let prior = {
            let conn = self.conn();
            let account = doc.field_str("account_number").unwrap_or("");
            db::get_prior_statement(&conn, account, &doc.id)?
        };

        let input = ValidationInput {
            doc_type: doc.doc_type.clone(),
            raw_confidence: extraction.confidence,
            currency: currencies.get_or_default(&doc.currency).clone(),
            rows: rows.clone(),
            opening_balance: doc.field_f64("opening_balance"),
            closing_balance: doc.field_f64("closing_balance"),
            period_from: doc.field_str("period_from").map(|s| s.to_string()),
            prior: prior.as_ref().map(|(_, ctx)| PriorStatementContext {
                closing_balance: ctx.closing_balance,
                period_to: ctx.period_to.clone(),
            }),
            metadata_discrepancy,
            quality_warnings: quality.warnings,
            quality_below_floor: quality.below_floor,
            mixed_date_formats,
            via_ocr_fallback: extraction.via_ocr_fallback,
        };
        let outcome = self.validator.validate(&input);

        // Row-level anomaly annotations travel with the transactions
        let mut stored: Vec<StoredTransaction> = rows
            .iter()
            .map(|r| StoredTransaction::from_normalized(&doc.id, r))
            .collect();
        for anomaly in &outcome.anomalies {
            for &idx in &anomaly.rows {
                if let Some(tx) = stored.get_mut(idx) {
                    tx.is_anomaly = true;
                    tx.anomaly_reason = Some(anomaly.check.clone());
                }
            }
        }

        doc.confidence = outcome.confidence;
        doc.status_reason = outcome.status_reason.clone();
        doc.processing_time_ms = Some(started.elapsed().as_millis() as i64);
        doc.transition_to(outcome.status)?;

        let candidates = self.resolver.extract_candidates(&doc.extracted_fields);
        {
            let mut conn = self.conn();
            db::replace_transactions(&conn, &doc.id, &stored)?;
            db::replace_anomalies(&conn, &doc.id, &outcome.anomalies)?;
            db::add_to_counter(&conn, STATE_FIELDS_EXTRACTED, doc.extracted_fields.len())?;
            for candidate in &candidates {
                db::resolve_entity(&mut conn, &self.resolver, candidate, &doc.id)?;
            }
            db::update_document(&conn, &doc)?;
            db::set_document_status(
                &conn,
                &doc.id,
                doc.status,
                doc.status_reason.as_deref(),
                "pipeline",
            )?;
        }

        info!(
            doc_id = %doc.id,
            status = doc.status.as_str(),
            confidence = doc.confidence,
            anomalies = outcome.anomalies.len(),
            entities = candidates.len(),
            "document settled"
        );
        Ok(())
    }

    // ========================================================================
    // REVIEW ACTIONS
    // ========================================================================

    pub fn approve(&self, doc_id: &str, actor: &str) -> Result<Document> {
        self.human_transition(doc_id, DocumentStatus::Approved, actor)
    }

    pub fn reject(&self, doc_id: &str, actor: &str) -> Result<Document> {
        self.human_transition(doc_id, DocumentStatus::Rejected, actor)
    }

    fn human_transition(
        &self,
        doc_id: &str,
        next: DocumentStatus,
        actor: &str,
    ) -> Result<Document> {
        let conn = self.conn();
        let mut doc = db::get_document(&conn, doc_id)?
            .ok_or_else(|| anyhow!("document {} not found", doc_id))?;
        doc.transition_to(next)
            .with_context(|| format!("cannot move document {} to {}", doc_id, next.as_str()))?;
        db::set_document_status(&conn, doc_id, next, None, actor)?;
        doc.status_reason = None;
        Ok(doc)
    }

    /// Return a settled document to PROCESSING and run the pipeline again.
    /// Prior anomalies are superseded in the current view; the audit event
    /// trail and all corrections remain queryable.
    pub async fn reanalyze(&self, doc_id: &str, actor: &str) -> Result<Document> {
        {
            let conn = self.conn();
            let mut doc = db::get_document(&conn, doc_id)?
                .ok_or_else(|| anyhow!("document {} not found", doc_id))?;
            doc.reanalyze()
                .with_context(|| format!("cannot reanalyze document {}", doc_id))?;
            db::set_document_status(&conn, doc_id, DocumentStatus::Processing, None, actor)?;
        }
        self.process(doc_id).await
    }

    pub fn resolve_anomaly(&self, anomaly_id: &str, actor: &str) -> Result<bool> {
        let conn = self.conn();
        db::resolve_anomaly(&conn, anomaly_id, actor)
    }

    // ========================================================================
    // CORRECTIONS AND LEARNING
    // ========================================================================

    /// Record one human correction and report whether it tripped a learning
    /// cycle. The external memory push happens separately in `sync`.
    pub fn record_correction(
        &self,
        doc_id: &str,
        field: &str,
        original: &str,
        corrected: &str,
        author: &str,
    ) -> Result<Option<LearningEvent>> {
        {
            let conn = self.conn();
            if db::get_document(&conn, doc_id)?.is_none() {
                return Err(anyhow!("document {} not found", doc_id));
            }
            let correction = Correction::new(doc_id, field, original, corrected, author);
            db::insert_correction(&conn, &correction)?;
        }
        self.maybe_trigger_learning()
    }

    /// Threshold check over the full correction history. Idempotent within
    /// the cooldown window: a second call right after a trigger returns None
    /// until the rearm mark is passed.
    pub fn maybe_trigger_learning(&self) -> Result<Option<LearningEvent>> {
        let conn = self.conn();
        let corrections = db::correction_count(&conn)? as usize;
        let fields = db::get_counter(&conn, STATE_FIELDS_EXTRACTED)?;
        let mark = db::get_counter(&conn, STATE_COOLDOWN_MARK)?;

        let trigger = match self.learning.maybe_trigger(corrections, fields, mark) {
            Some(t) => t,
            None => return Ok(None),
        };

        let recent = db::recent_corrections(&conn, 500)?;
        let clusters = self.learning.cluster(&recent);
        let rules = self.learning.synthesize_rules(&clusters);

        db::set_state(&conn, STATE_LEARNED_RULES, &serde_json::to_string(&rules)?)?;
        db::set_state(&conn, STATE_COOLDOWN_MARK, &trigger.cooldown_mark.to_string())?;

        let event = LearningEvent::new(
            LearningEventKind::CorrectionClusterUpdate,
            format!(
                "{} cluster(s), {} rule(s) synthesized from {} corrections",
                clusters.len(),
                rules.len(),
                corrections
            ),
            true,
        );
        db::insert_learning_event(&conn, &event)?;
        info!(
            corrections,
            rules = rules.len(),
            cooldown_mark = trigger.cooldown_mark,
            "learning cycle fired"
        );
        Ok(Some(event))
    }

    /// Operator-driven cycle: re-clusters and re-synthesizes regardless of
    /// thresholds, and records a manual_trigger event.
    pub fn trigger_learning_manually(&self, actor: &str) -> Result<LearningEvent> {
        let conn = self.conn();
        let recent = db::recent_corrections(&conn, 500)?;
        let clusters = self.learning.cluster(&recent);
        let rules = self.learning.synthesize_rules(&clusters);
        db::set_state(&conn, STATE_LEARNED_RULES, &serde_json::to_string(&rules)?)?;

        let event = LearningEvent::new(
            LearningEventKind::ManualTrigger,
            format!(
                "manual cycle by {}: {} cluster(s), {} rule(s)",
                actor,
                clusters.len(),
                rules.len()
            ),
            true,
        );
        db::insert_learning_event(&conn, &event)?;
        Ok(event)
    }

    /// Push the current rule pool to the external memory channel. A failed
    /// push is recorded and retried on the next call; it never blocks
    /// document processing.
    pub async fn sync(&self) -> Result<LearningEvent> {
        let (clusters, rules) = {
            let conn = self.conn();
            let recent = db::recent_corrections(&conn, 500)?;
            let clusters = self.learning.cluster(&recent);
            let rules = self.learning.synthesize_rules(&clusters);
            (clusters, rules)
        };

        let report = self.memory_sync.sync(&clusters, &rules).await;
        let detail = if report.skipped {
            "sync skipped: no memory endpoint configured".to_string()
        } else {
            format!("pushed {} rule(s), {} failed", report.pushed, report.failures.len())
        };
        let event = LearningEvent::new(LearningEventKind::LearningSync, detail, report.ok());

        let conn = self.conn();
        db::insert_learning_event(&conn, &event)?;
        Ok(event)
    }

    /// Rule pool injected into extraction prompts.
    pub fn active_rules(&self) -> Vec<String> {
        let conn = self.conn();
        db::get_state(&conn, STATE_LEARNED_RULES)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn learning_status(&self) -> Result<LearningStatus> {
        let conn = self.conn();
        let corrections_total = db::correction_count(&conn)? as usize;
        let fields_extracted = db::get_counter(&conn, STATE_FIELDS_EXTRACTED)?;
        let cooldown_mark = db::get_counter(&conn, STATE_COOLDOWN_MARK)?;
        let recent = db::recent_corrections(&conn, 500)?;
        let clusters = self.learning.cluster(&recent);
        let active_rules = db::get_state(&conn, STATE_LEARNED_RULES)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let recent_events = db::recent_learning_events(&conn, 20)?;

        Ok(LearningStatus {
            corrections_total,
            fields_extracted,
            error_rate: self.learning.error_rate(corrections_total, fields_extracted),
            cooldown_mark,
            clusters,
            active_rules,
            recent_events,
        })
    }

    // ========================================================================
    // READ MODEL
    // ========================================================================

    pub fn document_view(&self, doc_id: &str) -> Result<Option<DocumentView>> {
        let conn = self.conn();
        let document = match db::get_document(&conn, doc_id)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let transactions = db::get_transactions(&conn, doc_id)?;
        let anomalies = db::get_anomalies(&conn, doc_id)?;
        let corrections = db::corrections_for_document(&conn, doc_id)?;
        let entities = db::entities_for_document(&conn, doc_id)?
            .into_iter()
            .map(|(e, relationship)| EntityLink {
                entity_id: e.id,
                canonical_name: e.canonical_name,
                category: e.category,
                relationship,
                mention_count: e.mention_count,
            })
            .collect();

        Ok(Some(DocumentView {
            document,
            transactions,
            anomalies,
            corrections,
            entities,
        }))
    }

    pub fn review_queue(&self, limit: i64) -> Result<Vec<Document>> {
        let conn = self.conn();
        db::review_queue(&conn, limit)
    }

    pub fn list_documents(
        &self,
        status: Option<&str>,
        batch_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let conn = self.conn();
        db::list_documents(&conn, status, batch_id, limit)
    }

    pub fn metrics(&self) -> Result<db::PipelineMetrics> {
        let conn = self.conn();
        db::metrics(&conn)
    }

    pub fn anomaly_summary(&self) -> Result<db::AnomalySummary> {
        let conn = self.conn();
        db::anomaly_summary(&conn)
    }

    pub fn failure_clusters(&self) -> Result<Vec<db::FailureCluster>> {
        let conn = self.conn();
        db::failure_clusters(&conn)
    }

    pub fn batch_status(&self, batch_id: &str) -> Result<db::BatchStatus> {
        let conn = self.conn();
        db::batch_status(&conn, batch_id)
    }

    pub fn search_entities(&self, query: &str, limit: i64) -> Result<Vec<db::StoredEntity>> {
        let conn = self.conn();
        db::search_entities(&conn, query, limit)
    }

    pub fn entity_category_counts(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn();
        db::entity_category_counts(&conn)
    }

    /// Audit trail for one document, newest first.
    pub fn document_events(&self, doc_id: &str) -> Result<Vec<db::Event>> {
        let conn = self.conn();
        db::get_events_for_entity(&conn, "document", doc_id)
    }

    /// Read-only graph projection: one document, or the overview across all.
    /// Never mutates state, safe to run alongside ingestion.
    pub fn knowledge_graph(&self, doc_id: Option<&str>) -> Result<KnowledgeGraph> {
        let conn = self.conn();
        let docs = match doc_id {
            Some(id) => db::get_document(&conn, id)?.into_iter().collect(),
            None => db::list_documents(&conn, None, None, 200)?,
        };

        let mut graph = KnowledgeGraph::default();
        let mut by_account: HashMap<String, Vec<String>> = HashMap::new();
        for doc in &docs {
            let rows: Vec<NormalizedRow> = db::get_transactions(&conn, &doc.id)?
                .iter()
                .map(|t| t.to_normalized())
                .collect();
            let entities: Vec<EntityRef> = db::entities_for_document(&conn, &doc.id)?
                .into_iter()
                .map(|(e, relationship)| EntityRef {
                    entity_id: e.id,
                    canonical_name: e.canonical_name,
                    category: e.category,
                    relationship,
                })
                .collect();
            graph.merge(self.graph.document_graph(doc, &rows, &entities));

            if let Some(account) = doc.field_str("account_number") {
                by_account
                    .entry(account.to_string())
                    .or_default()
                    .push(doc.id.clone());
            }
        }

        // Statements of one account cross-check each other
        for (account, ids) in by_account {
            for pair in ids.windows(2) {
                graph.edges.push(self.graph.link_documents(
                    &pair[0],
                    &pair[1],
                    &format!("same account {}", account),
                ));
            }
        }
        Ok(graph)
    }
}

#[derive(Debug, Default)]
struct QualitySignals {
    score: Option<f64>,
    below_floor: bool,
    warnings: Vec<String>,
}

/// Locally-normalized spreadsheets become extraction results without a model
/// round-trip: the rows are already structured and deterministic.
fn extraction_from_statement(statement: &NormalizedStatement) -> ExtractionResult {
    let mut fields: HashMap<String, FieldValue> = HashMap::new();
    if let Some(v) = statement.opening_balance {
        fields.insert("opening_balance".to_string(), FieldValue::Number(v));
    }
    if let Some(v) = statement.closing_balance {
        fields.insert("closing_balance".to_string(), FieldValue::Number(v));
    }
    if let Some(c) = &statement.currency {
        fields.insert("currency".to_string(), FieldValue::Text(c.clone()));
    }

    ExtractionResult {
        doc_type: "bank_statement".to_string(),
        confidence: 0.90,
        language: None,
        currency: statement.currency.clone(),
        fields,
        transactions: statement
            .rows
            .iter()
            .map(|r| crate::extraction::ExtractedRow {
                date: r.date.clone(),
                description: r.description.clone(),
                amount: r.amount,
                balance: r.balance,
                category: r.category.clone(),
            })
            .collect(),
        via_ocr_fallback: false,
        attempts: 0,
        trace: Vec::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            // Unroutable endpoint so the model path fails fast under test
            model_url: "http://127.0.0.1:9".to_string(),
            max_attempts: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 1,
            request_timeout_secs: 2,
            message_timeout_secs: 2,
            ..PipelineConfig::default()
        }
    }

    fn create_test_pipeline() -> ForensicPipeline {
        let conn = Connection::open_in_memory().unwrap();
        ForensicPipeline::with_connection(test_config(), conn).unwrap()
    }

    const CLEAN_STATEMENT: &str = "Date,Description,Amount,Balance\n\
        ,OPENING BALANCE,,1000.00\n\
        01/05/2024,GROCERY MART,-45.00,955.00\n\
        02/05/2024,SALARY MAY,3000.00,3955.00\n\
        03/05/2024,ELECTRICITY BILL,-120.00,3835.00\n\
        ,CLOSING BALANCE,,3835.00\n";

    #[tokio::test]
    async fn test_clean_spreadsheet_validates() {
        let pipeline = create_test_pipeline();
        let doc = pipeline
            .submit_document(CLEAN_STATEMENT.as_bytes(), "may.csv", Some("batch-1"))
            .await
            .unwrap();

        assert_eq!(doc.status, DocumentStatus::Validated);
        assert_eq!(doc.doc_type, "bank_statement");
        assert!(doc.status_reason.is_none());
        assert_eq!(doc.field_f64("opening_balance"), Some(1000.0));
        assert_eq!(doc.field_f64("closing_balance"), Some(3835.0));

        let view = pipeline.document_view(&doc.id).unwrap().unwrap();
        assert_eq!(view.transactions.len(), 3);
        assert_eq!(view.transactions[0].amount, -45.0);
        assert!(view.anomalies.iter().all(|a| a.anomaly.severity.as_str() != "critical"));

        let batch = pipeline.batch_status("batch-1").unwrap();
        assert_eq!(batch.total, 1);
        assert!(batch.complete);
    }

    #[tokio::test]
    async fn test_metadata_fraud_routes_to_review() {
        let pipeline = create_test_pipeline();
        let fraudulent = "Date,Description,Amount,Balance\n\
            ,OPENING BALANCE,,1000.00\n\
            01/05/2024,groceries,-100.00,900.00\n\
            02/05/2024,fuel,-50.00,850.00\n\
            ,CLOSING BALANCE,,2500000.00\n";

        let doc = pipeline
            .submit_document(fraudulent.as_bytes(), "inflated.csv", None)
            .await
            .unwrap();

        assert_eq!(doc.status, DocumentStatus::Review);
        assert!(doc
            .status_reason
            .as_deref()
            .unwrap()
            .contains("metadata_integrity"));

        let queue = pipeline.review_queue(10).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, doc.id);
    }

    #[tokio::test]
    async fn test_unusable_binary_fails_with_reason() {
        let pipeline = create_test_pipeline();
        // No format, no text: model unreachable and OCR finds nothing
        let doc = pipeline
            .submit_document(&[0u8, 255, 1, 254, 2, 253], "blob.bin", None)
            .await
            .unwrap();

        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.status_reason.is_some());

        let clusters = pipeline.failure_clusters().unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 1);
    }

    #[tokio::test]
    async fn test_approve_and_illegal_transitions() {
        let pipeline = create_test_pipeline();
        let doc = pipeline
            .submit_document(CLEAN_STATEMENT.as_bytes(), "may.csv", None)
            .await
            .unwrap();

        let approved = pipeline.approve(&doc.id, "reviewer@test").unwrap();
        assert_eq!(approved.status, DocumentStatus::Approved);

        // APPROVED is settled: no second approval, no rejection
        assert!(pipeline.approve(&doc.id, "reviewer@test").is_err());
        assert!(pipeline.reject(&doc.id, "reviewer@test").is_err());
    }

    #[tokio::test]
    async fn test_reanalyze_preserves_corrections() {
        let pipeline = create_test_pipeline();
        let doc = pipeline
            .submit_document(CLEAN_STATEMENT.as_bytes(), "may.csv", None)
            .await
            .unwrap();

        pipeline
            .record_correction(&doc.id, "closing_balance", "3835", "3836", "reviewer@test")
            .unwrap();
        pipeline.approve(&doc.id, "reviewer@test").unwrap();

        // Reanalyze from APPROVED returns through PROCESSING to a settled state
        let doc = pipeline.reanalyze(&doc.id, "reviewer@test").await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Validated);

        let view = pipeline.document_view(&doc.id).unwrap().unwrap();
        assert_eq!(view.corrections.len(), 1);
        assert_eq!(view.transactions.len(), 3);
    }

    #[tokio::test]
    async fn test_learning_trigger_and_cooldown() {
        let pipeline = {
            let config = PipelineConfig {
                learning_correction_threshold: 5,
                learning_rearm_step: 3,
                ..test_config()
            };
            let conn = Connection::open_in_memory().unwrap();
            ForensicPipeline::with_connection(config, conn).unwrap()
        };
        let doc = pipeline
            .submit_document(CLEAN_STATEMENT.as_bytes(), "may.csv", None)
            .await
            .unwrap();

        // Plenty of extracted fields keeps the rate branch quiet; only the
        // count threshold is under test here
        {
            let conn = pipeline.conn();
            db::add_to_counter(&conn, STATE_FIELDS_EXTRACTED, 1000).unwrap();
        }

        for i in 0..4 {
            let fired = pipeline
                .record_correction(&doc.id, "account_number", &format!("bad{}", i), "good", "r@t")
                .unwrap();
            assert!(fired.is_none(), "correction {} must not trigger", i + 1);
        }

        // Fifth correction crosses the threshold
        let fired = pipeline
            .record_correction(&doc.id, "account_number", "bad4", "good", "r@t")
            .unwrap();
        let event = fired.expect("fifth correction fires");
        assert_eq!(event.kind, LearningEventKind::CorrectionClusterUpdate);

        // Idempotent inside the cooldown window
        assert!(pipeline.maybe_trigger_learning().unwrap().is_none());

        let status = pipeline.learning_status().unwrap();
        assert_eq!(status.corrections_total, 5);
        assert_eq!(status.cooldown_mark, 8);
        assert_eq!(status.clusters.len(), 1);
        assert!(!status.active_rules.is_empty());
        assert!(status.active_rules[0].contains("account_number"));

        // Learned rules now ride along with extraction prompts
        assert_eq!(pipeline.active_rules(), status.active_rules);

        // Three more corrections pass the rearm mark and fire again
        for i in 5..8 {
            pipeline
                .record_correction(&doc.id, "account_number", &format!("bad{}", i), "good", "r@t")
                .unwrap();
        }
        let status = pipeline.learning_status().unwrap();
        assert_eq!(status.cooldown_mark, 11);
        assert_eq!(
            status
                .recent_events
                .iter()
                .filter(|e| e.kind == LearningEventKind::CorrectionClusterUpdate)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_manual_trigger_and_sync_event() {
        let pipeline = create_test_pipeline();
        let doc = pipeline
            .submit_document(CLEAN_STATEMENT.as_bytes(), "may.csv", None)
            .await
            .unwrap();
        for i in 0..3 {
            pipeline
                .record_correction(&doc.id, "vendor_name", &format!("ACNE{}", i), "ACME", "r@t")
                .unwrap();
        }

        let event = pipeline.trigger_learning_manually("ops@test").unwrap();
        assert_eq!(event.kind, LearningEventKind::ManualTrigger);
        assert!(!pipeline.active_rules().is_empty());

        // No memory endpoint configured: sync records a successful skip
        let event = pipeline.sync().await.unwrap();
        assert_eq!(event.kind, LearningEventKind::LearningSync);
        assert!(event.success);
        assert!(event.detail.contains("skipped"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entity_resolution_under_concurrent_ingestion() {
        let pipeline = Arc::new(create_test_pipeline());

        // Two documents ingested at the same time both mention the same vendor
        // under different spellings; the atomic upsert must leave exactly one
        // canonical entity no matter how the writes interleave
        let statement = "Date,Description,Amount,Balance\n01/05/2024,a,-1.00,99.00\n";
        let mut handles = Vec::new();
        for (filename, name) in [("a.csv", "AMAZON"), ("b.csv", "Amazon.in")] {
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                let doc = pipeline
                    .submit_document(statement.as_bytes(), filename, None)
                    .await
                    .unwrap();
                // Spreadsheet rows carry no name fields; resolve the vendor
                // mention directly, as finalize does for extracted names
                let candidate = crate::entity_resolution::EntityCandidate {
                    category: crate::entity_resolution::EntityCategory::Vendor,
                    raw_name: name.to_string(),
                    normalized_name: EntityResolver::normalize_name(name),
                    relationship: "vendor".to_string(),
                };
                {
                    let mut conn = pipeline.conn();
                    let resolver = EntityResolver::new();
                    db::resolve_entity(&mut conn, &resolver, &candidate, &doc.id).unwrap();
                }
                doc
            }));
        }
        let doc_a = handles.remove(0).await.unwrap();
        let doc_b = handles.remove(0).await.unwrap();

        let view_a = pipeline.document_view(&doc_a.id).unwrap().unwrap();
        let view_b = pipeline.document_view(&doc_b.id).unwrap().unwrap();
        assert_eq!(view_a.entities.len(), 1);
        assert_eq!(view_b.entities.len(), 1);
        assert_eq!(view_a.entities[0].entity_id, view_b.entities[0].entity_id);
        assert_eq!(view_b.entities[0].mention_count, 2);

        let metrics = pipeline.metrics().unwrap();
        assert_eq!(metrics.entities, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_bulk_ingestion_settles_every_document() {
        let pipeline = Arc::new(create_test_pipeline());

        // One task per document, all running at once against one store
        let mut handles = Vec::new();
        for i in 0..6 {
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                pipeline
                    .submit_document(
                        CLEAN_STATEMENT.as_bytes(),
                        &format!("statement-{}.csv", i),
                        Some("bulk-1"),
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let doc = handle.await.unwrap();
            assert_eq!(doc.status, DocumentStatus::Validated);
        }

        let metrics = pipeline.metrics().unwrap();
        assert_eq!(metrics.documents, 6);
        assert_eq!(metrics.by_status.get("VALIDATED"), Some(&6));

        let batch = pipeline.batch_status("bulk-1").unwrap();
        assert_eq!(batch.total, 6);
        assert!(batch.complete);
    }

    #[tokio::test]
    async fn test_graph_overview_cross_links_same_account() {
        let pipeline = create_test_pipeline();
        let statement = "Date,Description,Amount,Balance\n\
            01/05/2024,UPI ACME STORES,-50.00,950.00\n";
        let doc_a = pipeline
            .submit_document(statement.as_bytes(), "april.csv", None)
            .await
            .unwrap();
        let doc_b = pipeline
            .submit_document(statement.as_bytes(), "may.csv", None)
            .await
            .unwrap();

        {
            let conn = pipeline.conn();
            for doc in [&doc_a, &doc_b] {
                let mut updated = doc.clone();
                updated
                    .extracted_fields
                    .insert("account_number".to_string(), FieldValue::from("XX1234"));
                db::update_document(&conn, &updated).unwrap();
            }
        }

        let graph = pipeline.knowledge_graph(None).unwrap();
        assert!(graph
            .edges
            .iter()
            .any(|e| e.edge_type == crate::graph::EDGE_CROSS_CHECKED_WITH));

        // Single-document projection stays scoped
        let graph = pipeline.knowledge_graph(Some(&doc_a.id)).unwrap();
        assert!(graph.nodes.iter().any(|n| n.id == format!("doc:{}", doc_a.id)));
        assert!(!graph.nodes.iter().any(|n| n.id == format!("doc:{}", doc_b.id)));
    }

    #[tokio::test]
    async fn test_metrics_aggregate() {
        let pipeline = create_test_pipeline();
        pipeline
            .submit_document(CLEAN_STATEMENT.as_bytes(), "may.csv", None)
            .await
            .unwrap();

        let metrics = pipeline.metrics().unwrap();
        assert_eq!(metrics.documents, 1);
        assert_eq!(metrics.by_status.get("VALIDATED"), Some(&1));

        let summary = pipeline.anomaly_summary().unwrap();
        assert_eq!(summary.open, summary.total);
    }

    #[tokio::test]
    async fn test_upload_size_limit() {
        let pipeline = {
            let config = PipelineConfig {
                max_upload_mb: 1,
                ..test_config()
            };
            let conn = Connection::open_in_memory().unwrap();
            ForensicPipeline::with_connection(config, conn).unwrap()
        };
        let oversized = vec![b'a'; 2 * 1024 * 1024];
        let result = pipeline.submit_document(&oversized, "big.csv", None).await;
        assert!(result.is_err());
    }
}
