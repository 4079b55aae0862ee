// 📄 Document Model - Identity, Lifecycle, Typed Fields
// A document's status only moves forward through the lifecycle; the single
// exception is reanalyze, which returns any non-PROCESSING document to
// PROCESSING while keeping every prior anomaly and correction on record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

// ============================================================================
// SOURCE FORMAT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Image,
    Pdf,
    Spreadsheet,
    Unknown,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Image => "image",
            SourceFormat::Pdf => "pdf",
            SourceFormat::Spreadsheet => "spreadsheet",
            SourceFormat::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> SourceFormat {
        match s {
            "image" => SourceFormat::Image,
            "pdf" => SourceFormat::Pdf,
            "spreadsheet" => SourceFormat::Spreadsheet,
            _ => SourceFormat::Unknown,
        }
    }

    /// Sniff format from filename extension and leading bytes.
    pub fn detect(filename: &str, bytes: &[u8]) -> SourceFormat {
        let lower = filename.to_lowercase();
        let ext = lower.rsplit('.').next().unwrap_or("");
        match ext {
            "jpg" | "jpeg" | "png" | "webp" | "tif" | "tiff" => return SourceFormat::Image,
            "pdf" => return SourceFormat::Pdf,
            "csv" | "xls" | "xlsx" | "tsv" => return SourceFormat::Spreadsheet,
            _ => {}
        }
        // Magic-byte fallback for extensionless uploads
        if bytes.starts_with(b"%PDF") {
            SourceFormat::Pdf
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G'])
            || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        {
            SourceFormat::Image
        } else {
            SourceFormat::Unknown
        }
    }
}

// ============================================================================
// DOCUMENT STATUS - state machine
// ============================================================================

/// Lifecycle: PENDING → PROCESSING → {VALIDATED, REVIEW, FAILED};
/// VALIDATED/REVIEW → {APPROVED, REJECTED} by human action;
/// any non-PROCESSING state → PROCESSING via reanalyze.
/// FAILED is terminal except via reanalyze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Validated,
    Review,
    Failed,
    Approved,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Validated => "VALIDATED",
            DocumentStatus::Review => "REVIEW",
            DocumentStatus::Failed => "FAILED",
            DocumentStatus::Approved => "APPROVED",
            DocumentStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentStatus> {
        match s {
            "PENDING" => Some(DocumentStatus::Pending),
            "PROCESSING" => Some(DocumentStatus::Processing),
            "VALIDATED" => Some(DocumentStatus::Validated),
            "REVIEW" => Some(DocumentStatus::Review),
            "FAILED" => Some(DocumentStatus::Failed),
            "APPROVED" => Some(DocumentStatus::Approved),
            "REJECTED" => Some(DocumentStatus::Rejected),
            _ => None,
        }
    }

    /// Forward transitions only. Reanalyze is handled separately because it
    /// is the one legal move back to PROCESSING.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Validated)
                | (Processing, Review)
                | (Processing, Failed)
                | (Validated, Approved)
                | (Validated, Rejected)
                | (Review, Approved)
                | (Review, Rejected)
        )
    }

    /// Reanalyze returns any settled document to PROCESSING. A document
    /// already in flight cannot be re-entered.
    pub fn can_reanalyze(&self) -> bool {
        *self != DocumentStatus::Processing
    }

    /// Human review actions are only legal on validated or flagged documents.
    pub fn awaits_human(&self) -> bool {
        matches!(self, DocumentStatus::Validated | DocumentStatus::Review)
    }
}

// ============================================================================
// FIELD VALUE - typed extracted fields
// ============================================================================

/// Typed sum for extracted field maps. Conversion from model JSON is explicit:
/// nulls are dropped, nothing is coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(HashMap<String, FieldValue>),
}

impl FieldValue {
    /// Convert a JSON value. Returns None for null (callers drop the key).
    pub fn from_json(value: serde_json::Value) -> Option<FieldValue> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(FieldValue::Bool(b)),
            serde_json::Value::Number(n) => n.as_f64().map(FieldValue::Number),
            serde_json::Value::String(s) => Some(FieldValue::Text(s)),
            serde_json::Value::Array(items) => Some(FieldValue::List(
                items.into_iter().filter_map(FieldValue::from_json).collect(),
            )),
            serde_json::Value::Object(map) => Some(FieldValue::Map(
                map.into_iter()
                    .filter_map(|(k, v)| FieldValue::from_json(v).map(|fv| (k, fv)))
                    .collect(),
            )),
        }
    }

    /// Convert a whole JSON object into a field map, dropping nulls.
    pub fn map_from_json(value: serde_json::Value) -> HashMap<String, FieldValue> {
        match FieldValue::from_json(value) {
            Some(FieldValue::Map(map)) => map,
            _ => HashMap::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: numbers directly, numeric-looking text parsed explicitly.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, FieldValue>> {
        match self {
            FieldValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Display form used in review payloads and correction logs.
    pub fn to_display(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identity (UUID v4) - never changes
    pub id: String,

    pub filename: String,

    #[serde(rename = "format")]
    pub source_format: SourceFormat,

    /// Classification from the extraction model (bank_statement, invoice, ...)
    #[serde(rename = "doc_type")]
    pub doc_type: String,

    /// Confidence after validation penalties (0-1)
    pub confidence: f64,

    /// ISO currency code ("" until detected)
    pub currency: String,

    /// Composite image quality score (images only)
    pub quality_score: Option<f64>,

    pub status: DocumentStatus,

    /// Non-empty whenever status is not VALIDATED/APPROVED
    pub status_reason: Option<String>,

    /// Bulk-ingestion batch this document arrived in
    pub batch_id: Option<String>,

    pub language: Option<String>,

    pub extracted_fields: HashMap<String, FieldValue>,

    pub processing_time_ms: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(filename: &str, source_format: SourceFormat) -> Self {
        let now = Utc::now();
        Document {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            source_format,
            doc_type: "unknown".to_string(),
            confidence: 0.0,
            currency: String::new(),
            quality_score: None,
            status: DocumentStatus::Pending,
            status_reason: None,
            batch_id: None,
            language: None,
            extracted_fields: HashMap::new(),
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }

    /// Forward transition with legality enforcement.
    pub fn transition_to(&mut self, next: DocumentStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::new(
                self.status,
                next,
                "not a legal forward transition",
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The one legal move backwards: any settled state returns to PROCESSING.
    /// Prior anomalies and corrections stay on record.
    pub fn reanalyze(&mut self) -> Result<(), StateError> {
        if !self.status.can_reanalyze() {
            return Err(StateError::new(
                self.status,
                DocumentStatus::Processing,
                "document is already processing",
            ));
        }
        self.status = DocumentStatus::Processing;
        self.status_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Field accessor that tolerates missing keys.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.extracted_fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|v| v.as_str())
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(|v| v.as_f64())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_document() -> Document {
        Document::new("statement_jan.csv", SourceFormat::Spreadsheet)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut doc = create_test_document();
        assert_eq!(doc.status, DocumentStatus::Pending);

        doc.transition_to(DocumentStatus::Processing).unwrap();
        doc.transition_to(DocumentStatus::Validated).unwrap();
        doc.transition_to(DocumentStatus::Approved).unwrap();
        assert_eq!(doc.status, DocumentStatus::Approved);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut doc = create_test_document();

        // Cannot skip PROCESSING
        assert!(doc.transition_to(DocumentStatus::Validated).is_err());

        doc.transition_to(DocumentStatus::Processing).unwrap();
        doc.transition_to(DocumentStatus::Failed).unwrap();

        // FAILED is terminal: no approve, no reject
        assert!(doc.transition_to(DocumentStatus::Approved).is_err());
        assert!(doc.transition_to(DocumentStatus::Rejected).is_err());
    }

    #[test]
    fn test_reanalyze_from_every_settled_state() {
        for settled in [
            DocumentStatus::Pending,
            DocumentStatus::Validated,
            DocumentStatus::Review,
            DocumentStatus::Failed,
            DocumentStatus::Approved,
            DocumentStatus::Rejected,
        ] {
            let mut doc = create_test_document();
            doc.status = settled;
            doc.reanalyze().unwrap();
            assert_eq!(doc.status, DocumentStatus::Processing);
        }

        // ...but not while already in flight
        let mut doc = create_test_document();
        doc.status = DocumentStatus::Processing;
        assert!(doc.reanalyze().is_err());
    }

    #[test]
    fn test_status_serialization_contract() {
        // Stable wire spellings
        let json = serde_json::to_string(&DocumentStatus::Review).unwrap();
        assert_eq!(json, "\"REVIEW\"");
        let back: DocumentStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(back, DocumentStatus::Failed);
    }

    #[test]
    fn test_field_value_from_json_drops_nulls() {
        let raw = serde_json::json!({
            "vendor_name": "ACME Corp",
            "total_amount": 129.99,
            "paid": true,
            "missing": null,
            "line_items": [{"desc": "widget", "qty": 2}, null],
        });
        let map = FieldValue::map_from_json(raw);

        assert_eq!(map.get("vendor_name").and_then(|v| v.as_str()), Some("ACME Corp"));
        assert_eq!(map.get("total_amount").and_then(|v| v.as_f64()), Some(129.99));
        assert_eq!(map.get("paid").and_then(|v| v.as_bool()), Some(true));
        assert!(!map.contains_key("missing"));
        assert_eq!(map.get("line_items").and_then(|v| v.as_list()).map(|l| l.len()), Some(1));
    }

    #[test]
    fn test_field_numeric_view_is_explicit() {
        let v = FieldValue::Text("12,450.75".to_string());
        assert_eq!(v.as_f64(), Some(12450.75));

        let v = FieldValue::Text("not a number".to_string());
        assert_eq!(v.as_f64(), None);

        // No implicit bool→number coercion
        let v = FieldValue::Bool(true);
        assert_eq!(v.as_f64(), None);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            SourceFormat::detect("scan.JPG", &[]),
            SourceFormat::Image
        );
        assert_eq!(
            SourceFormat::detect("statement.csv", &[]),
            SourceFormat::Spreadsheet
        );
        assert_eq!(
            SourceFormat::detect("noext", b"%PDF-1.7"),
            SourceFormat::Pdf
        );
        assert_eq!(
            SourceFormat::detect("noext", &[0xFF, 0xD8, 0xFF, 0xE0]),
            SourceFormat::Image
        );
        assert_eq!(SourceFormat::detect("data.bin", &[0u8; 4]), SourceFormat::Unknown);
    }
}
