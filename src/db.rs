// 🗄️ Forensics Store - SQLite Persistence for the Pipeline
// Documents, transactions, anomalies, corrections, entities and learning
// events live in one SQLite file in WAL mode. Transaction rows carry an
// idempotency hash so a duplicated insert never double-counts; every
// status change lands in the audit event trail.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

use crate::document::{Document, DocumentStatus, FieldValue, SourceFormat};
use crate::entity_resolution::{EntityCandidate, EntityMatch, EntityResolver};
use crate::learning::{Correction, LearningEvent, LearningEventKind};
use crate::spreadsheet::NormalizedRow;
use crate::validation::{Anomaly, AnomalyClass, PriorStatementContext, Severity};

// ============================================================================
// STORED ROW TYPES
// ============================================================================

/// Transaction row as persisted, with its anomaly annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTransaction {
    #[serde(skip_serializing_if = "is_zero_i64", default)]
    pub id: i64,
    pub document_id: String,
    pub row_index: i64,
    pub date: String,
    pub description: String,
    pub amount: f64,
    pub balance: Option<f64>,
    pub category: String,
    pub is_anomaly: bool,
    pub anomaly_reason: Option<String>,
}

fn is_zero_i64(val: &i64) -> bool {
    *val == 0
}

impl StoredTransaction {
    pub fn from_normalized(document_id: &str, row: &NormalizedRow) -> Self {
        StoredTransaction {
            id: 0,
            document_id: document_id.to_string(),
            row_index: row.row_index as i64,
            date: row.date.clone(),
            description: row.description.clone(),
            amount: row.amount,
            balance: row.balance,
            category: row.category.clone(),
            is_anomaly: false,
            anomaly_reason: None,
        }
    }

    /// Deduplication hash, not identity. Row index participates so that two
    /// genuinely identical purchases in one statement both persist.
    pub fn compute_idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}{}{}{}{}",
            self.document_id, self.row_index, self.date, self.amount, self.description
        ));
        format!("{:x}", hasher.finalize())
    }

    pub fn to_normalized(&self) -> NormalizedRow {
        NormalizedRow {
            row_index: self.row_index as usize,
            date: self.date.clone(),
            description: self.description.clone(),
            amount: self.amount,
            balance: self.balance,
            category: self.category.clone(),
        }
    }
}

/// Anomaly with its persistence envelope (resolution state, timestamps).
#[derive(Debug, Clone, Serialize)]
pub struct StoredAnomaly {
    pub id: String,
    pub document_id: String,
    #[serde(flatten)]
    pub anomaly: Anomaly,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredEntity {
    pub id: String,
    pub category: String,
    pub canonical_name: String,
    pub normalized_name: String,
    pub aliases: Vec<String>,
    pub mention_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Event for the audit trail. Every status change writes one.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// AGGREGATE SHAPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total: i64,
    pub counts: HashMap<String, i64>,
    pub avg_confidence: Option<f64>,
    /// True once no document in the batch is PENDING or PROCESSING
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalySummary {
    pub total: i64,
    pub open: i64,
    pub resolved: i64,
    pub by_severity: HashMap<String, i64>,
    pub by_check: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureCluster {
    pub reason: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub documents: i64,
    pub by_status: HashMap<String, i64>,
    pub avg_confidence: Option<f64>,
    pub avg_quality: Option<f64>,
    pub anomalies: i64,
    pub open_anomalies: i64,
    pub corrections: i64,
    pub entities: i64,
    pub learning_events: i64,
}

// ============================================================================
// SETUP
// ============================================================================

pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("Failed to open database")?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            format TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT '',
            quality_score REAL,
            status TEXT NOT NULL,
            status_reason TEXT,
            batch_id TEXT,
            language TEXT,
            extracted_fields TEXT NOT NULL DEFAULT '{}',
            -- Derived columns for cross-statement queries
            account_number TEXT NOT NULL DEFAULT '',
            opening_balance REAL,
            closing_balance REAL,
            period_from TEXT,
            period_to TEXT,
            processing_time_ms INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            document_id TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            balance REAL,
            category TEXT NOT NULL DEFAULT '',
            is_anomaly INTEGER NOT NULL DEFAULT 0,
            anomaly_reason TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS anomalies (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            check_name TEXT NOT NULL,
            class TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            details TEXT NOT NULL,
            rows TEXT NOT NULL DEFAULT '[]',
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_by TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS corrections (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            original_value TEXT NOT NULL,
            corrected_value TEXT NOT NULL,
            corrected_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            canonical_name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            aliases TEXT NOT NULL DEFAULT '[]',
            mention_count INTEGER NOT NULL DEFAULT 1,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            UNIQUE(category, normalized_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS document_entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            relationship TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(document_id, entity_id, relationship)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS learning_events (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            detail TEXT NOT NULL,
            success INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Key/value state: learning water mark, field counters, cancel flags
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Raw upload bytes, kept so reanalysis can re-run the full pipeline
    conn.execute(
        "CREATE TABLE IF NOT EXISTS document_blobs (
            document_id TEXT PRIMARY KEY,
            content BLOB NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_batch ON documents(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_account ON documents(account_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_document ON transactions(document_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_anomalies_document ON anomalies(document_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_corrections_field ON corrections(field_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_document_entities_doc ON document_entities(document_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// DOCUMENTS
// ============================================================================

/// Cross-statement query columns pulled out of the extracted fields.
fn derived_columns(doc: &Document) -> (String, Option<f64>, Option<f64>, Option<String>, Option<String>) {
    (
        doc.field_str("account_number").unwrap_or("").to_string(),
        doc.field_f64("opening_balance"),
        doc.field_f64("closing_balance"),
        doc.field_str("period_from").map(|s| s.to_string()),
        doc.field_str("period_to").map(|s| s.to_string()),
    )
}

pub fn insert_document(conn: &Connection, doc: &Document) -> Result<()> {
    let fields_json = serde_json::to_string(&doc.extracted_fields)?;
    let (account, opening, closing, from, to) = derived_columns(doc);

    conn.execute(
        "INSERT INTO documents (
            id, filename, format, doc_type, confidence, currency, quality_score,
            status, status_reason, batch_id, language, extracted_fields,
            account_number, opening_balance, closing_balance, period_from, period_to,
            processing_time_ms, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            doc.id,
            doc.filename,
            doc.source_format.as_str(),
            doc.doc_type,
            doc.confidence,
            doc.currency,
            doc.quality_score,
            doc.status.as_str(),
            doc.status_reason,
            doc.batch_id,
            doc.language,
            fields_json,
            account,
            opening,
            closing,
            from,
            to,
            doc.processing_time_ms,
            doc.created_at.to_rfc3339(),
            doc.updated_at.to_rfc3339(),
        ],
    )?;

    let event = Event::new(
        "document_ingested",
        "document",
        &doc.id,
        serde_json::json!({ "filename": doc.filename, "format": doc.source_format.as_str() }),
        "pipeline",
    );
    insert_event(conn, &event)?;

    Ok(())
}

/// Full rewrite of a document's mutable columns after a processing pass.
pub fn update_document(conn: &Connection, doc: &Document) -> Result<()> {
    let fields_json = serde_json::to_string(&doc.extracted_fields)?;
    let (account, opening, closing, from, to) = derived_columns(doc);

    conn.execute(
        "UPDATE documents SET
            doc_type = ?2, confidence = ?3, currency = ?4, quality_score = ?5,
            status = ?6, status_reason = ?7, language = ?8, extracted_fields = ?9,
            account_number = ?10, opening_balance = ?11, closing_balance = ?12,
            period_from = ?13, period_to = ?14, processing_time_ms = ?15, updated_at = ?16
         WHERE id = ?1",
        params![
            doc.id,
            doc.doc_type,
            doc.confidence,
            doc.currency,
            doc.quality_score,
            doc.status.as_str(),
            doc.status_reason,
            doc.language,
            fields_json,
            account,
            opening,
            closing,
            from,
            to,
            doc.processing_time_ms,
            doc.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Status column change plus audit event. The caller is responsible for
/// having validated the transition.
pub fn set_document_status(
    conn: &Connection,
    doc_id: &str,
    status: DocumentStatus,
    reason: Option<&str>,
    actor: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE documents SET status = ?2, status_reason = ?3, updated_at = ?4 WHERE id = ?1",
        params![doc_id, status.as_str(), reason, Utc::now().to_rfc3339()],
    )?;

    let event = Event::new(
        "status_changed",
        "document",
        doc_id,
        serde_json::json!({ "to": status.as_str(), "reason": reason }),
        actor,
    );
    insert_event(conn, &event)?;
    Ok(())
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

const DOCUMENT_COLUMNS: &str = "id, filename, format, doc_type, confidence, currency, \
     quality_score, status, status_reason, batch_id, language, extracted_fields, \
     processing_time_ms, created_at, updated_at";

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let format_str: String = row.get(2)?;
    let status_str: String = row.get(7)?;
    let fields_json: String = row.get(11)?;
    let created_str: String = row.get(13)?;
    let updated_str: String = row.get(14)?;

    let extracted_fields: HashMap<String, FieldValue> =
        serde_json::from_str(&fields_json).unwrap_or_default();

    Ok(Document {
        id: row.get(0)?,
        filename: row.get(1)?,
        source_format: SourceFormat::parse(&format_str),
        doc_type: row.get(3)?,
        confidence: row.get(4)?,
        currency: row.get(5)?,
        quality_score: row.get(6)?,
        status: DocumentStatus::parse(&status_str).ok_or(rusqlite::Error::InvalidQuery)?,
        status_reason: row.get(8)?,
        batch_id: row.get(9)?,
        language: row.get(10)?,
        extracted_fields,
        processing_time_ms: row.get(12)?,
        created_at: parse_ts(&created_str)?,
        updated_at: parse_ts(&updated_str)?,
    })
}

pub fn get_document(conn: &Connection, doc_id: &str) -> Result<Option<Document>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM documents WHERE id = ?1",
        DOCUMENT_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![doc_id], row_to_document)?;
    match rows.next() {
        Some(doc) => Ok(Some(doc?)),
        None => Ok(None),
    }
}

pub fn list_documents(
    conn: &Connection,
    status: Option<&str>,
    batch_id: Option<&str>,
    limit: i64,
) -> Result<Vec<Document>> {
    let mut sql = format!("SELECT {} FROM documents WHERE 1=1", DOCUMENT_COLUMNS);
    let mut binds: Vec<String> = Vec::new();
    if let Some(s) = status {
        binds.push(s.to_string());
        sql.push_str(&format!(" AND status = ?{}", binds.len()));
    }
    if let Some(b) = batch_id {
        binds.push(b.to_string());
        sql.push_str(&format!(" AND batch_id = ?{}", binds.len()));
    }
    sql.push_str(&format!(
        " ORDER BY created_at DESC LIMIT {}",
        limit.max(1)
    ));

    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), row_to_document)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(docs)
}

/// Documents awaiting a human, least confident and oldest first.
pub fn review_queue(conn: &Connection, limit: i64) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM documents WHERE status = 'REVIEW'
         ORDER BY confidence ASC, created_at ASC LIMIT ?1",
        DOCUMENT_COLUMNS
    ))?;
    let docs = stmt
        .query_map(params![limit.max(1)], row_to_document)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(docs)
}

/// Most recent other statement on the same account, for continuity checks.
pub fn get_prior_statement(
    conn: &Connection,
    account_number: &str,
    exclude_doc_id: &str,
) -> Result<Option<(String, PriorStatementContext)>> {
    if account_number.is_empty() {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT id, closing_balance, period_to FROM documents
         WHERE account_number = ?1 AND id != ?2 AND status != 'FAILED'
         ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![account_number, exclude_doc_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            PriorStatementContext {
                closing_balance: row.get(1)?,
                period_to: row.get(2)?,
            },
        ))
    })?;
    match rows.next() {
        Some(pair) => Ok(Some(pair?)),
        None => Ok(None),
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Replace a document's rows (reanalysis re-derives them from scratch).
/// Returns (inserted, duplicates); duplicates are hash collisions within
/// the incoming set, tolerated like any idempotent import.
pub fn replace_transactions(
    conn: &Connection,
    document_id: &str,
    rows: &[StoredTransaction],
) -> Result<(usize, usize)> {
    conn.execute(
        "DELETE FROM transactions WHERE document_id = ?1",
        params![document_id],
    )?;

    let mut inserted = 0;
    let mut duplicates = 0;
    for tx in rows {
        let hash = tx.compute_idempotency_hash();
        let result = conn.execute(
            "INSERT INTO transactions (
                idempotency_hash, document_id, row_index, date, description,
                amount, balance, category, is_anomaly, anomaly_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                hash,
                tx.document_id,
                tx.row_index,
                tx.date,
                tx.description,
                tx.amount,
                tx.balance,
                tx.category,
                tx.is_anomaly,
                tx.anomaly_reason,
            ],
        );
        match result {
            Ok(_) => inserted += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok((inserted, duplicates))
}

pub fn get_transactions(conn: &Connection, document_id: &str) -> Result<Vec<StoredTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, document_id, row_index, date, description, amount, balance,
                category, is_anomaly, anomaly_reason
         FROM transactions WHERE document_id = ?1 ORDER BY row_index ASC",
    )?;
    let rows = stmt
        .query_map(params![document_id], |row| {
            Ok(StoredTransaction {
                id: row.get(0)?,
                document_id: row.get(1)?,
                row_index: row.get(2)?,
                date: row.get(3)?,
                description: row.get(4)?,
                amount: row.get(5)?,
                balance: row.get(6)?,
                category: row.get(7)?,
                is_anomaly: row.get(8)?,
                anomaly_reason: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================================================
// ANOMALIES
// ============================================================================

/// Replace a document's anomalies with a fresh validation outcome.
/// The audit event trail keeps the history across reanalyses.
pub fn replace_anomalies(
    conn: &Connection,
    document_id: &str,
    anomalies: &[Anomaly],
) -> Result<usize> {
    conn.execute(
        "DELETE FROM anomalies WHERE document_id = ?1",
        params![document_id],
    )?;

    let now = Utc::now().to_rfc3339();
    for anomaly in anomalies {
        conn.execute(
            "INSERT INTO anomalies (
                id, document_id, check_name, class, severity, description,
                details, rows, resolved, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                uuid::Uuid::new_v4().to_string(),
                document_id,
                anomaly.check,
                class_str(anomaly.class),
                anomaly.severity.as_str(),
                anomaly.description,
                serde_json::to_string(&anomaly.details)?,
                serde_json::to_string(&anomaly.rows)?,
                now,
            ],
        )?;
    }
    Ok(anomalies.len())
}

fn class_str(class: AnomalyClass) -> &'static str {
    match class {
        AnomalyClass::Error => "error",
        AnomalyClass::Warning => "warning",
    }
}

fn parse_class(raw: &str) -> AnomalyClass {
    if raw == "error" {
        AnomalyClass::Error
    } else {
        AnomalyClass::Warning
    }
}

pub fn get_anomalies(conn: &Connection, document_id: &str) -> Result<Vec<StoredAnomaly>> {
    let mut stmt = conn.prepare(
        "SELECT id, document_id, check_name, class, severity, description,
                details, rows, resolved, resolved_by, created_at
         FROM anomalies WHERE document_id = ?1 ORDER BY created_at ASC, check_name ASC",
    )?;
    let rows = stmt
        .query_map(params![document_id], |row| {
            let class: String = row.get(3)?;
            let severity: String = row.get(4)?;
            let details_json: String = row.get(6)?;
            let rows_json: String = row.get(7)?;
            let created_str: String = row.get(10)?;
            Ok(StoredAnomaly {
                id: row.get(0)?,
                document_id: row.get(1)?,
                anomaly: Anomaly {
                    check: row.get(2)?,
                    class: parse_class(&class),
                    severity: Severity::parse(&severity).unwrap_or(Severity::Info),
                    description: row.get(5)?,
                    details: serde_json::from_str(&details_json)
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    rows: serde_json::from_str(&rows_json).unwrap_or_default(),
                },
                resolved: row.get(8)?,
                resolved_by: row.get(9)?,
                created_at: parse_ts(&created_str)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn resolve_anomaly(conn: &Connection, anomaly_id: &str, resolved_by: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE anomalies SET resolved = 1, resolved_by = ?2 WHERE id = ?1 AND resolved = 0",
        params![anomaly_id, resolved_by],
    )?;
    Ok(changed > 0)
}

pub fn anomaly_summary(conn: &Connection) -> Result<AnomalySummary> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))?;
    let resolved: i64 = conn.query_row(
        "SELECT COUNT(*) FROM anomalies WHERE resolved = 1",
        [],
        |row| row.get(0),
    )?;

    let mut by_severity = HashMap::new();
    let mut stmt =
        conn.prepare("SELECT severity, COUNT(*) FROM anomalies GROUP BY severity")?;
    let pairs = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for pair in pairs {
        let (severity, count) = pair?;
        by_severity.insert(severity, count);
    }

    let mut by_check = HashMap::new();
    let mut stmt =
        conn.prepare("SELECT check_name, COUNT(*) FROM anomalies GROUP BY check_name")?;
    let pairs = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for pair in pairs {
        let (check, count) = pair?;
        by_check.insert(check, count);
    }

    Ok(AnomalySummary {
        total,
        open: total - resolved,
        resolved,
        by_severity,
        by_check,
    })
}

// ============================================================================
// CORRECTIONS
// ============================================================================

pub fn insert_correction(conn: &Connection, correction: &Correction) -> Result<()> {
    conn.execute(
        "INSERT INTO corrections (
            id, document_id, field_name, original_value, corrected_value,
            corrected_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            correction.id,
            correction.document_id,
            correction.field_name,
            correction.original_value,
            correction.corrected_value,
            correction.corrected_by,
            correction.created_at.to_rfc3339(),
        ],
    )?;

    let event = Event::new(
        "field_corrected",
        "document",
        &correction.document_id,
        serde_json::json!({ "field": correction.field_name }),
        &correction.corrected_by,
    );
    insert_event(conn, &event)?;
    Ok(())
}

fn row_to_correction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Correction> {
    let created_str: String = row.get(6)?;
    Ok(Correction {
        id: row.get(0)?,
        document_id: row.get(1)?,
        field_name: row.get(2)?,
        original_value: row.get(3)?,
        corrected_value: row.get(4)?,
        corrected_by: row.get(5)?,
        created_at: parse_ts(&created_str)?,
    })
}

pub fn corrections_for_document(conn: &Connection, document_id: &str) -> Result<Vec<Correction>> {
    let mut stmt = conn.prepare(
        "SELECT id, document_id, field_name, original_value, corrected_value,
                corrected_by, created_at
         FROM corrections WHERE document_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map(params![document_id], row_to_correction)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Newest first, so cluster examples favor recent review behavior.
pub fn recent_corrections(conn: &Connection, limit: i64) -> Result<Vec<Correction>> {
    let mut stmt = conn.prepare(
        "SELECT id, document_id, field_name, original_value, corrected_value,
                corrected_by, created_at
         FROM corrections ORDER BY created_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit.max(1)], row_to_correction)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn correction_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM corrections", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// PIPELINE STATE (counters, water marks, cancel flags)
// ============================================================================

pub fn set_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO pipeline_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM pipeline_state WHERE key = ?1")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(v) => Ok(Some(v?)),
        None => Ok(None),
    }
}

pub fn clear_state(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM pipeline_state WHERE key = ?1", params![key])?;
    Ok(())
}

pub fn get_counter(conn: &Connection, key: &str) -> Result<usize> {
    Ok(get_state(conn, key)?
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0))
}

pub fn save_document_blob(conn: &Connection, document_id: &str, content: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO document_blobs (document_id, content) VALUES (?1, ?2)
         ON CONFLICT(document_id) DO UPDATE SET content = excluded.content",
        params![document_id, content],
    )?;
    Ok(())
}

pub fn get_document_blob(conn: &Connection, document_id: &str) -> Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare("SELECT content FROM document_blobs WHERE document_id = ?1")?;
    let mut rows = stmt.query_map(params![document_id], |row| row.get::<_, Vec<u8>>(0))?;
    match rows.next() {
        Some(blob) => Ok(Some(blob?)),
        None => Ok(None),
    }
}

pub fn add_to_counter(conn: &Connection, key: &str, delta: usize) -> Result<usize> {
    let next = get_counter(conn, key)? + delta;
    set_state(conn, key, &next.to_string())?;
    Ok(next)
}

// ============================================================================
// LEARNING EVENTS
// ============================================================================

pub fn insert_learning_event(conn: &Connection, event: &LearningEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO learning_events (id, kind, detail, success, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event.id,
            event.kind.as_str(),
            event.detail,
            event.success,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn recent_learning_events(conn: &Connection, limit: i64) -> Result<Vec<LearningEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, detail, success, created_at
         FROM learning_events ORDER BY created_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit.max(1)], |row| {
            let kind_str: String = row.get(1)?;
            let created_str: String = row.get(4)?;
            Ok(LearningEvent {
                id: row.get(0)?,
                kind: LearningEventKind::parse(&kind_str)
                    .ok_or(rusqlite::Error::InvalidQuery)?,
                detail: row.get(2)?,
                success: row.get(3)?,
                created_at: parse_ts(&created_str)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================================================
// ENTITIES
// ============================================================================

/// Resolve one candidate against the stored population and upsert, all
/// inside a single SQL transaction so concurrent documents cannot create
/// twin entities for the same name.
pub fn resolve_entity(
    conn: &mut Connection,
    resolver: &EntityResolver,
    candidate: &EntityCandidate,
    document_id: &str,
) -> Result<(String, bool)> {
    let tx = conn.transaction()?;

    let (entity_id, merged) = {
        let mut stmt =
            tx.prepare("SELECT id, normalized_name FROM entities WHERE category = ?1")?;
        let population: Vec<(String, String)> = stmt
            .query_map(params![candidate.category.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        match resolver.resolve(
            &candidate.normalized_name,
            population.iter().map(|(id, n)| (id.as_str(), n.as_str())),
        ) {
            EntityMatch::Existing { entity_id, .. } => {
                let aliases_json: String = tx.query_row(
                    "SELECT aliases FROM entities WHERE id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )?;
                let mut aliases: Vec<String> =
                    serde_json::from_str(&aliases_json).unwrap_or_default();
                if !aliases.iter().any(|a| a == &candidate.raw_name) {
                    aliases.push(candidate.raw_name.clone());
                }
                tx.execute(
                    "UPDATE entities SET mention_count = mention_count + 1,
                            last_seen = ?2, aliases = ?3
                     WHERE id = ?1",
                    params![
                        entity_id,
                        Utc::now().to_rfc3339(),
                        serde_json::to_string(&aliases)?
                    ],
                )?;
                (entity_id, true)
            }
            EntityMatch::New => {
                let id = uuid::Uuid::new_v4().to_string();
                let now = Utc::now().to_rfc3339();
                tx.execute(
                    "INSERT INTO entities (
                        id, category, canonical_name, normalized_name, aliases,
                        mention_count, first_seen, last_seen
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                    params![
                        id,
                        candidate.category.as_str(),
                        candidate.raw_name,
                        candidate.normalized_name,
                        serde_json::to_string(&vec![candidate.raw_name.clone()])?,
                        now,
                    ],
                )?;
                (id, false)
            }
        }
    };

    tx.execute(
        "INSERT OR IGNORE INTO document_entities (document_id, entity_id, relationship, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            document_id,
            entity_id,
            candidate.relationship,
            Utc::now().to_rfc3339()
        ],
    )?;
    tx.commit()?;

    Ok((entity_id, merged))
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntity> {
    let aliases_json: String = row.get(4)?;
    let first_str: String = row.get(6)?;
    let last_str: String = row.get(7)?;
    Ok(StoredEntity {
        id: row.get(0)?,
        category: row.get(1)?,
        canonical_name: row.get(2)?,
        normalized_name: row.get(3)?,
        aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
        mention_count: row.get(5)?,
        first_seen: parse_ts(&first_str)?,
        last_seen: parse_ts(&last_str)?,
    })
}

pub fn entities_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<(StoredEntity, String)>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.category, e.canonical_name, e.normalized_name, e.aliases,
                e.mention_count, e.first_seen, e.last_seen, de.relationship
         FROM entities e
         JOIN document_entities de ON de.entity_id = e.id
         WHERE de.document_id = ?1
         ORDER BY e.canonical_name ASC",
    )?;
    let rows = stmt
        .query_map(params![document_id], |row| {
            let entity = row_to_entity(row)?;
            let relationship: String = row.get(8)?;
            Ok((entity, relationship))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn search_entities(conn: &Connection, query: &str, limit: i64) -> Result<Vec<StoredEntity>> {
    let needle = format!("%{}%", EntityResolver::normalize_name(query));
    let mut stmt = conn.prepare(
        "SELECT id, category, canonical_name, normalized_name, aliases,
                mention_count, first_seen, last_seen
         FROM entities WHERE normalized_name LIKE ?1
         ORDER BY mention_count DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![needle, limit.max(1)], row_to_entity)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn entity_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
    Ok(count)
}

pub fn entity_category_counts(conn: &Connection) -> Result<HashMap<String, i64>> {
    let mut counts = HashMap::new();
    let mut stmt = conn.prepare("SELECT category, COUNT(*) FROM entities GROUP BY category")?;
    let pairs = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for pair in pairs {
        let (category, count) = pair?;
        counts.insert(category, count);
    }
    Ok(counts)
}

// ============================================================================
// BATCH / REVIEW / METRICS
// ============================================================================

pub fn batch_status(conn: &Connection, batch_id: &str) -> Result<BatchStatus> {
    let mut counts = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM documents WHERE batch_id = ?1 GROUP BY status",
    )?;
    let pairs = stmt.query_map(params![batch_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for pair in pairs {
        let (status, count) = pair?;
        counts.insert(status, count);
    }

    let total: i64 = counts.values().sum();
    let avg_confidence: Option<f64> = conn.query_row(
        "SELECT AVG(confidence) FROM documents WHERE batch_id = ?1 AND status != 'FAILED'",
        params![batch_id],
        |row| row.get(0),
    )?;
    let pending = counts.get("PENDING").copied().unwrap_or(0)
        + counts.get("PROCESSING").copied().unwrap_or(0);

    Ok(BatchStatus {
        batch_id: batch_id.to_string(),
        total,
        counts,
        avg_confidence,
        complete: total > 0 && pending == 0,
    })
}

/// FAILED documents grouped by their status reason, most common first.
pub fn failure_clusters(conn: &Connection) -> Result<Vec<FailureCluster>> {
    let mut stmt = conn.prepare(
        "SELECT COALESCE(status_reason, 'unknown'), COUNT(*)
         FROM documents WHERE status = 'FAILED'
         GROUP BY status_reason ORDER BY COUNT(*) DESC",
    )?;
    let clusters = stmt
        .query_map([], |row| {
            Ok(FailureCluster {
                reason: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(clusters)
}

pub fn metrics(conn: &Connection) -> Result<PipelineMetrics> {
    let documents: i64 =
        conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;

    let mut by_status = HashMap::new();
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")?;
    let pairs = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for pair in pairs {
        let (status, count) = pair?;
        by_status.insert(status, count);
    }

    let avg_confidence: Option<f64> = conn.query_row(
        "SELECT AVG(confidence) FROM documents WHERE status IN ('VALIDATED', 'APPROVED')",
        [],
        |row| row.get(0),
    )?;
    let avg_quality: Option<f64> = conn.query_row(
        "SELECT AVG(quality_score) FROM documents WHERE quality_score IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    let anomalies: i64 =
        conn.query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))?;
    let open_anomalies: i64 = conn.query_row(
        "SELECT COUNT(*) FROM anomalies WHERE resolved = 0",
        [],
        |row| row.get(0),
    )?;
    let corrections = correction_count(conn)?;
    let entities = entity_count(conn)?;
    let learning_events: i64 =
        conn.query_row("SELECT COUNT(*) FROM learning_events", [], |row| row.get(0))?;

    Ok(PipelineMetrics {
        documents,
        by_status,
        avg_confidence,
        avg_quality,
        anomalies,
        open_anomalies,
        corrections,
        entities,
        learning_events,
    })
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;
    Ok(())
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;
            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_ts(&timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SourceFormat;
    use serde_json::json;

    fn create_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn create_test_document(filename: &str, account: &str) -> Document {
        let mut doc = Document::new(filename, SourceFormat::Spreadsheet);
        doc.doc_type = "bank_statement".to_string();
        doc.confidence = 0.92;
        doc.currency = "USD".to_string();
        if !account.is_empty() {
            doc.extracted_fields
                .insert("account_number".to_string(), FieldValue::from(account));
        }
        doc
    }

    fn create_test_transaction(doc_id: &str, index: i64, amount: f64) -> StoredTransaction {
        StoredTransaction {
            id: 0,
            document_id: doc_id.to_string(),
            row_index: index,
            date: "2024-05-01".to_string(),
            description: format!("TXN {}", index),
            amount,
            balance: None,
            category: "Expense".to_string(),
            is_anomaly: false,
            anomaly_reason: None,
        }
    }

    #[test]
    fn test_document_roundtrip() {
        let conn = create_test_db();
        let mut doc = create_test_document("may.csv", "XX1234");
        doc.extracted_fields
            .insert("closing_balance".to_string(), FieldValue::Number(740.25));
        doc.batch_id = Some("batch-1".to_string());

        insert_document(&conn, &doc).unwrap();
        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();

        assert_eq!(loaded.id, doc.id);
        assert_eq!(loaded.filename, "may.csv");
        assert_eq!(loaded.status, DocumentStatus::Pending);
        assert_eq!(loaded.batch_id.as_deref(), Some("batch-1"));
        assert_eq!(loaded.field_str("account_number"), Some("XX1234"));
        assert_eq!(loaded.field_f64("closing_balance"), Some(740.25));

        // Ingestion left an audit event
        let events = get_events_for_entity(&conn, "document", &doc.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "document_ingested");
    }

    #[test]
    fn test_status_change_records_event() {
        let conn = create_test_db();
        let doc = create_test_document("a.csv", "");
        insert_document(&conn, &doc).unwrap();

        set_document_status(
            &conn,
            &doc.id,
            DocumentStatus::Review,
            Some("confidence 0.62 below review threshold 0.80"),
            "pipeline",
        )
        .unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Review);
        assert!(loaded.status_reason.as_deref().unwrap().contains("0.62"));

        let events = get_events_for_entity(&conn, "document", &doc.id).unwrap();
        assert!(events.iter().any(|e| e.event_type == "status_changed"));
    }

    #[test]
    fn test_transaction_idempotency() {
        let conn = create_test_db();
        let doc = create_test_document("a.csv", "");
        insert_document(&conn, &doc).unwrap();

        let tx = create_test_transaction(&doc.id, 0, -45.99);
        // Same row twice in one set: the second is a tolerated duplicate
        let (inserted, duplicates) =
            replace_transactions(&conn, &doc.id, &[tx.clone(), tx.clone()]).unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(duplicates, 1);

        // Replacing re-derives from scratch
        let rows = vec![
            create_test_transaction(&doc.id, 0, -45.99),
            create_test_transaction(&doc.id, 1, -12.50),
        ];
        let (inserted, duplicates) = replace_transactions(&conn, &doc.id, &rows).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(duplicates, 0);

        let loaded = get_transactions(&conn, &doc.id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].row_index, 0);
        assert_eq!(loaded[1].amount, -12.50);
    }

    #[test]
    fn test_anomaly_persistence_and_summary() {
        let conn = create_test_db();
        let doc = create_test_document("a.csv", "");
        insert_document(&conn, &doc).unwrap();

        let anomalies = vec![
            Anomaly::error("running_balance", "chain broken", json!({"rows": [3]})),
            Anomaly::warning("structuring", Severity::Warning, "clusters", json!({})),
        ];

        replace_anomalies(&conn, &doc.id, &anomalies).unwrap();
        let stored = get_anomalies(&conn, &doc.id).unwrap();
        assert_eq!(stored.len(), 2);

        let running = stored
            .iter()
            .find(|a| a.anomaly.check == "running_balance")
            .unwrap();
        assert_eq!(running.anomaly.class, AnomalyClass::Error);
        assert!(!running.resolved);

        assert!(resolve_anomaly(&conn, &running.id, "reviewer@test").unwrap());
        // Second resolve is a no-op
        assert!(!resolve_anomaly(&conn, &running.id, "reviewer@test").unwrap());

        let summary = anomaly_summary(&conn).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.open, 1);
        assert_eq!(summary.by_check.get("structuring"), Some(&1));
        assert_eq!(summary.by_severity.get("critical"), Some(&1));
    }

    #[test]
    fn test_corrections_roundtrip() {
        let conn = create_test_db();
        let doc = create_test_document("a.csv", "");
        insert_document(&conn, &doc).unwrap();

        for i in 0..3 {
            let correction = Correction::new(
                &doc.id,
                "account_number",
                &format!("bad-{}", i),
                &format!("good-{}", i),
                "reviewer@test",
            );
            insert_correction(&conn, &correction).unwrap();
        }

        assert_eq!(correction_count(&conn).unwrap(), 3);
        assert_eq!(corrections_for_document(&conn, &doc.id).unwrap().len(), 3);
        let recent = recent_corrections(&conn, 2).unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_entity_resolution_merges_spellings() {
        let mut conn = create_test_db();
        let resolver = EntityResolver::new();

        let first = EntityCandidate {
            category: crate::entity_resolution::EntityCategory::Vendor,
            raw_name: "ACME Corporation".to_string(),
            normalized_name: "acme corporation".to_string(),
            relationship: "vendor".to_string(),
        };
        let (id1, merged1) = resolve_entity(&mut conn, &resolver, &first, "doc-1").unwrap();
        assert!(!merged1);

        let second = EntityCandidate {
            category: crate::entity_resolution::EntityCategory::Vendor,
            raw_name: "ACME Corporatin".to_string(),
            normalized_name: "acme corporatin".to_string(),
            relationship: "vendor".to_string(),
        };
        let (id2, merged2) = resolve_entity(&mut conn, &resolver, &second, "doc-2").unwrap();
        assert!(merged2);
        assert_eq!(id1, id2);

        assert_eq!(entity_count(&conn).unwrap(), 1);
        let found = search_entities(&conn, "ACME", 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mention_count, 2);
        assert_eq!(found[0].aliases.len(), 2);
    }

    #[test]
    fn test_entity_categories_never_merge() {
        let mut conn = create_test_db();
        let resolver = EntityResolver::new();

        let vendor = EntityCandidate {
            category: crate::entity_resolution::EntityCategory::Vendor,
            raw_name: "Meridian".to_string(),
            normalized_name: "meridian".to_string(),
            relationship: "vendor".to_string(),
        };
        let bank = EntityCandidate {
            category: crate::entity_resolution::EntityCategory::Bank,
            raw_name: "Meridian".to_string(),
            normalized_name: "meridian".to_string(),
            relationship: "bank".to_string(),
        };

        resolve_entity(&mut conn, &resolver, &vendor, "doc-1").unwrap();
        let (_, merged) = resolve_entity(&mut conn, &resolver, &bank, "doc-1").unwrap();
        assert!(!merged);
        assert_eq!(entity_count(&conn).unwrap(), 2);

        let attached = entities_for_document(&conn, "doc-1").unwrap();
        assert_eq!(attached.len(), 2);
    }

    #[test]
    fn test_prior_statement_lookup() {
        let conn = create_test_db();

        let mut older = create_test_document("april.csv", "XX1234");
        older.created_at = Utc::now() - chrono::Duration::days(30);
        older
            .extracted_fields
            .insert("closing_balance".to_string(), FieldValue::Number(4_200.0));
        older
            .extracted_fields
            .insert("period_to".to_string(), FieldValue::from("2024-04-30"));
        insert_document(&conn, &older).unwrap();

        let newer = create_test_document("may.csv", "XX1234");
        insert_document(&conn, &newer).unwrap();

        let (prior_id, context) = get_prior_statement(&conn, "XX1234", &newer.id)
            .unwrap()
            .unwrap();
        assert_eq!(prior_id, older.id);
        assert_eq!(context.closing_balance, Some(4_200.0));
        assert_eq!(context.period_to.as_deref(), Some("2024-04-30"));

        // No account, no prior
        assert!(get_prior_statement(&conn, "", &newer.id).unwrap().is_none());
    }

    #[test]
    fn test_batch_status_and_metrics() {
        let conn = create_test_db();

        let mut a = create_test_document("a.csv", "").with_batch("batch-7");
        a.status = DocumentStatus::Validated;
        a.confidence = 0.9;
        insert_document(&conn, &a).unwrap();

        let mut b = create_test_document("b.csv", "").with_batch("batch-7");
        b.status = DocumentStatus::Review;
        b.confidence = 0.6;
        insert_document(&conn, &b).unwrap();

        let status = batch_status(&conn, "batch-7").unwrap();
        assert_eq!(status.total, 2);
        assert!(status.complete);
        assert_eq!(status.counts.get("VALIDATED"), Some(&1));
        assert!((status.avg_confidence.unwrap() - 0.75).abs() < 1e-9);

        let m = metrics(&conn).unwrap();
        assert_eq!(m.documents, 2);
        assert_eq!(m.by_status.get("REVIEW"), Some(&1));

        let mut c = create_test_document("c.csv", "").with_batch("batch-8");
        c.status = DocumentStatus::Pending;
        insert_document(&conn, &c).unwrap();
        assert!(!batch_status(&conn, "batch-8").unwrap().complete);
    }

    #[test]
    fn test_review_queue_orders_by_confidence() {
        let conn = create_test_db();
        for (name, confidence) in [("a.csv", 0.75), ("b.csv", 0.40), ("c.csv", 0.60)] {
            let mut doc = create_test_document(name, "");
            doc.status = DocumentStatus::Review;
            doc.confidence = confidence;
            insert_document(&conn, &doc).unwrap();
        }

        let queue = review_queue(&conn, 10).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[0].filename, "b.csv");
        assert_eq!(queue[1].filename, "c.csv");
        assert_eq!(queue[2].filename, "a.csv");
    }

    #[test]
    fn test_failure_clusters() {
        let conn = create_test_db();
        for (name, reason) in [
            ("a.pdf", Some("extraction exhausted after 3 attempts")),
            ("b.pdf", Some("extraction exhausted after 3 attempts")),
            ("c.pdf", Some("payload missing classification")),
        ] {
            let mut doc = create_test_document(name, "");
            doc.status = DocumentStatus::Failed;
            doc.status_reason = reason.map(|s| s.to_string());
            insert_document(&conn, &doc).unwrap();
        }

        let clusters = failure_clusters(&conn).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].count, 2);
        assert!(clusters[0].reason.contains("exhausted"));
    }

    #[test]
    fn test_state_counters_and_learning_events() {
        let conn = create_test_db();

        assert_eq!(get_counter(&conn, "fields_extracted").unwrap(), 0);
        add_to_counter(&conn, "fields_extracted", 12).unwrap();
        let total = add_to_counter(&conn, "fields_extracted", 8).unwrap();
        assert_eq!(total, 20);

        set_state(&conn, "learning_cooldown_mark", "125").unwrap();
        assert_eq!(
            get_state(&conn, "learning_cooldown_mark").unwrap().as_deref(),
            Some("125")
        );
        clear_state(&conn, "learning_cooldown_mark").unwrap();
        assert!(get_state(&conn, "learning_cooldown_mark").unwrap().is_none());

        let event = LearningEvent::new(
            LearningEventKind::CorrectionClusterUpdate,
            "3 clusters over threshold",
            true,
        );
        insert_learning_event(&conn, &event).unwrap();
        let recent = recent_learning_events(&conn, 5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, LearningEventKind::CorrectionClusterUpdate);
        assert!(recent[0].success);
    }

    #[test]
    fn test_update_document_rewrites_fields() {
        let conn = create_test_db();
        let mut doc = create_test_document("a.csv", "");
        insert_document(&conn, &doc).unwrap();

        doc.doc_type = "invoice".to_string();
        doc.confidence = 0.70;
        doc.status = DocumentStatus::Review;
        doc.status_reason = Some("confidence 0.70 below review threshold 0.80".to_string());
        doc.extracted_fields
            .insert("account_number".to_string(), FieldValue::from("YY9876"));
        update_document(&conn, &doc).unwrap();

        let loaded = get_document(&conn, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.doc_type, "invoice");
        assert_eq!(loaded.status, DocumentStatus::Review);
        assert_eq!(loaded.field_str("account_number"), Some("YY9876"));
    }
}
