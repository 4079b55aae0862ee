// 🤖 Extraction Client - Model Calls with Retry, Fallback, Learned Rules
// Talks to the external extraction model: bounded retry with exponential
// backoff, primary/secondary payload strategies, local OCR as the last-resort
// path, and learned correction rules injected into every instruction set.
//
// Each extraction is an explicit state machine
// (Attempting → Retrying → FallbackOcr → Succeeded/Failed) so timeout and
// cancellation behavior stays auditable in the trace.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::document::FieldValue;
use crate::error::ExtractError;
use crate::spreadsheet::{classify_category, repair_number};

/// Upstream statuses that consume a retry attempt instead of failing hard.
const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

// ============================================================================
// EXTRACTION RESULT
// ============================================================================

/// One transaction row as the model (or fallback) reported it.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedRow {
    pub date: String,
    pub description: String,
    pub amount: f64,
    pub balance: Option<f64>,
    pub category: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub doc_type: String,
    /// Raw model confidence, before validation penalties
    pub confidence: f64,
    pub language: Option<String>,
    pub currency: Option<String>,
    pub fields: HashMap<String, FieldValue>,
    pub transactions: Vec<ExtractedRow>,
    pub via_ocr_fallback: bool,
    pub attempts: u32,
    /// Full phase history of this extraction
    pub trace: Vec<AttemptPhase>,
}

// ============================================================================
// ATTEMPT STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadStrategy {
    /// Primary: "files" array
    FilesArray,
    /// Secondary: single "file" object
    SingleFile,
}

impl PayloadStrategy {
    /// Primary strategy first; every retry after a failure switches to the
    /// secondary shape.
    pub fn for_attempt(attempt: u32) -> PayloadStrategy {
        if attempt == 0 {
            PayloadStrategy::FilesArray
        } else {
            PayloadStrategy::SingleFile
        }
    }

    fn payload(
        &self,
        model_name: &str,
        instructions: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Value {
        let encoded = BASE64.encode(bytes);
        match self {
            PayloadStrategy::FilesArray => json!({
                "model": model_name,
                "instructions": instructions,
                "files": [{ "name": filename, "content": encoded }],
            }),
            PayloadStrategy::SingleFile => json!({
                "model": model_name,
                "instructions": instructions,
                "file": { "name": filename, "content": encoded },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AttemptPhase {
    Attempting {
        attempt: u32,
        strategy: PayloadStrategy,
    },
    Retrying {
        next_attempt: u32,
        delay_ms: u64,
    },
    FallbackOcr,
    Succeeded {
        attempts: u32,
        via_ocr: bool,
    },
    Failed {
        reason: String,
    },
}

// ============================================================================
// OCR FALLBACK
// ============================================================================

/// Last-resort text recognition. The production engine is an external
/// collaborator; the default heuristic recovers printable text runs, which is
/// enough for text-bearing formats and deterministic under test.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bytes: &[u8]) -> anyhow::Result<String>;
}

pub struct HeuristicOcr;

impl OcrEngine for HeuristicOcr {
    fn recognize(&self, bytes: &[u8]) -> anyhow::Result<String> {
        let text = String::from_utf8_lossy(bytes);
        let mut out = String::new();
        let mut run = String::new();
        for ch in text.chars() {
            if ch.is_alphanumeric() || ch.is_ascii_punctuation() || ch == ' ' {
                run.push(ch);
            } else {
                // Keep runs long enough to be words, drop glyph noise
                if run.trim().len() >= 4 {
                    out.push_str(run.trim());
                    out.push('\n');
                }
                run.clear();
            }
        }
        if run.trim().len() >= 4 {
            out.push_str(run.trim());
            out.push('\n');
        }
        Ok(out)
    }
}

// ============================================================================
// EXTRACTION CLIENT
// ============================================================================

pub struct ExtractionClient {
    http: reqwest::Client,
    config: PipelineConfig,
    ocr: Arc<dyn OcrEngine>,
}

impl ExtractionClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("ledger-forensics/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()?;
        Ok(ExtractionClient {
            http,
            config: config.clone(),
            ocr: Arc::new(HeuristicOcr),
        })
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    /// Run the full retry/fallback machine for one document.
    ///
    /// Errors only when every model attempt *and* the OCR fallback fail, or
    /// when the model answers with an unusable payload.
    pub async fn extract(
        &self,
        bytes: &[u8],
        filename: &str,
        learned_rules: &[String],
    ) -> Result<ExtractionResult, ExtractError> {
        let instructions = build_instructions(learned_rules);
        let mut trace: Vec<AttemptPhase> = Vec::new();
        let mut last_error: Option<ExtractError> = None;

        for attempt in 0..self.config.max_attempts {
            let strategy = PayloadStrategy::for_attempt(attempt);
            trace.push(AttemptPhase::Attempting { attempt, strategy });
            debug!(filename, attempt, ?strategy, "extraction attempt");

            match self
                .attempt_once(bytes, filename, &instructions, strategy)
                .await
            {
                Ok(mut result) => {
                    result.attempts = attempt + 1;
                    trace.push(AttemptPhase::Succeeded {
                        attempts: attempt + 1,
                        via_ocr: false,
                    });
                    result.trace = trace;
                    info!(
                        filename,
                        attempts = result.attempts,
                        doc_type = %result.doc_type,
                        "extraction succeeded"
                    );
                    return Ok(result);
                }
                Err(e @ ExtractError::MalformedPayload(_)) => {
                    // Integrity failure: the model answered, the answer is
                    // unusable. Retrying the same bytes will not fix it.
                    trace.push(AttemptPhase::Failed {
                        reason: e.to_string(),
                    });
                    warn!(filename, error = %e, "unusable extraction payload");
                    return Err(e);
                }
                Err(e) => {
                    let retryable = e.is_transient() && attempt + 1 < self.config.max_attempts;
                    warn!(filename, attempt, error = %e, retryable, "extraction attempt failed");
                    last_error = Some(e);
                    if retryable {
                        let delay = self.config.backoff_delay(attempt);
                        trace.push(AttemptPhase::Retrying {
                            next_attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                        });
                        tokio::time::sleep(delay).await;
                    } else {
                        break;
                    }
                }
            }
        }

        // Model path exhausted: local OCR, lower confidence, never a hang.
        trace.push(AttemptPhase::FallbackOcr);
        warn!(filename, "model attempts exhausted, trying OCR fallback");

        let ocr = Arc::clone(&self.ocr);
        let owned_bytes = bytes.to_vec();
        let recognized = tokio::task::spawn_blocking(move || ocr.recognize(&owned_bytes))
            .await
            .map_err(|e| ExtractError::Exhausted {
                attempts: self.config.max_attempts,
                last_error: format!("ocr task panicked: {e}"),
            })?;

        match recognized {
            Ok(text) if !text.trim().is_empty() => {
                trace.push(AttemptPhase::Succeeded {
                    attempts: self.config.max_attempts,
                    via_ocr: true,
                });
                info!(filename, "OCR fallback produced text");
                Ok(ocr_result(text, self.config.max_attempts, trace))
            }
            Ok(_) => Err(ExtractError::Exhausted {
                attempts: self.config.max_attempts,
                last_error: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "ocr produced no text".to_string()),
            }),
            Err(e) => Err(ExtractError::Exhausted {
                attempts: self.config.max_attempts,
                last_error: format!("ocr fallback failed: {e}"),
            }),
        }
    }

    async fn attempt_once(
        &self,
        bytes: &[u8],
        filename: &str,
        instructions: &str,
        strategy: PayloadStrategy,
    ) -> Result<ExtractionResult, ExtractError> {
        let body = strategy.payload(&self.config.model_name, instructions, filename, bytes);

        let mut request = self
            .http
            .post(&self.config.model_url)
            .timeout(self.config.message_timeout())
            .json(&body);
        if !self.config.model_api_key.is_empty() {
            request = request.bearer_auth(&self.config.model_api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExtractError::Timeout {
                    seconds: self.config.message_timeout_secs,
                }
            } else {
                ExtractError::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        classify_status(status, &text)?;

        parse_extraction_response(&text)
    }
}

/// Map an upstream HTTP status onto the retry taxonomy.
fn classify_status(status: u16, body: &str) -> Result<(), ExtractError> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    let message = body.chars().take(200).collect::<String>();
    if RETRYABLE_STATUSES.contains(&status) {
        Err(ExtractError::Transient {
            status: Some(status),
            message,
        })
    } else {
        Err(ExtractError::Rejected { status, message })
    }
}

// ============================================================================
// INSTRUCTIONS
// ============================================================================

const BASE_INSTRUCTIONS: &str = "\
Extract structured data from the attached financial document.
Respond with a single JSON object:
{
  \"classification\": {
    \"type\": \"invoice|bank_statement|payslip|contract|check|utility_bill|form_16|unknown\",
    \"confidence\": 0.0-1.0,
    \"language\": \"ISO 639-1 code\"
  },
  \"extracted_fields\": {
    \"vendor_name\": null, \"bank_name\": null, \"employer_name\": null,
    \"account_holder\": null, \"account_number\": null, \"currency\": null,
    \"opening_balance\": null, \"closing_balance\": null,
    \"period_from\": null, \"period_to\": null, \"total_amount\": null,
    \"transactions\": [
      {\"date\": \"\", \"description\": \"\", \"amount\": 0.0, \"balance\": null, \"category\": null}
    ]
  }
}
Use null for fields absent from the document. Amounts are signed: debits negative.";

/// Base instructions plus the learned-rule block from the correction loop.
pub fn build_instructions(learned_rules: &[String]) -> String {
    if learned_rules.is_empty() {
        return BASE_INSTRUCTIONS.to_string();
    }
    let mut out = String::from(BASE_INSTRUCTIONS);
    out.push_str("\n\n--- LEARNED CORRECTION PATTERNS (from human reviewers) ---\n");
    for rule in learned_rules {
        out.push_str("- ");
        out.push_str(rule);
        out.push('\n');
    }
    out
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

/// Parse a model response body into an extraction result.
///
/// Accepts the payload directly, wrapped in a "content" envelope, fenced in
/// markdown, or buried in prose (first-brace-to-last-brace salvage).
pub fn parse_extraction_response(text: &str) -> Result<ExtractionResult, ExtractError> {
    let direct: Option<Value> = serde_json::from_str(text).ok();

    let payload: Value = match direct {
        Some(v) if v.get("classification").is_some() => v,
        Some(v) => {
            // Envelope with the real payload in a content string
            let content = v
                .get("content")
                .and_then(|c| c.as_str())
                .ok_or_else(|| {
                    ExtractError::MalformedPayload("no classification and no content".into())
                })?;
            salvage_json(content).ok_or_else(|| {
                ExtractError::MalformedPayload("content is not parseable JSON".into())
            })?
        }
        None => salvage_json(text)
            .ok_or_else(|| ExtractError::MalformedPayload("response is not JSON".into()))?,
    };

    let classification = payload
        .get("classification")
        .and_then(|c| c.as_object())
        .ok_or_else(|| ExtractError::MalformedPayload("missing classification".into()))?;
    let fields_json = payload
        .get("extracted_fields")
        .filter(|f| f.is_object())
        .cloned()
        .ok_or_else(|| ExtractError::MalformedPayload("missing extracted_fields".into()))?;

    let doc_type = classification
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string();
    let confidence = classification
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let language = classification
        .get("language")
        .and_then(|l| l.as_str())
        .map(|s| s.to_string());

    let transactions = fields_json
        .get("transactions")
        .and_then(|t| t.as_array())
        .map(|rows| parse_rows(rows))
        .unwrap_or_default();

    let mut fields = FieldValue::map_from_json(fields_json);
    fields.remove("transactions");

    let currency = fields
        .get("currency")
        .and_then(|v| v.as_str())
        .map(|s| s.to_uppercase());

    Ok(ExtractionResult {
        doc_type,
        confidence,
        language,
        currency,
        fields,
        transactions,
        via_ocr_fallback: false,
        attempts: 0,
        trace: Vec::new(),
    })
}

fn parse_rows(rows: &[Value]) -> Vec<ExtractedRow> {
    rows.iter()
        .filter_map(|row| {
            let obj = row.as_object()?;
            let date = obj.get("date").and_then(|d| d.as_str()).unwrap_or("").to_string();
            let description = obj
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string();
            let amount = match obj.get("amount") {
                Some(Value::Number(n)) => n.as_f64()?,
                Some(Value::String(s)) => repair_number(s)?.0,
                _ => return None,
            };
            let balance = match obj.get("balance") {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => repair_number(s).map(|(v, _)| v),
                _ => None,
            };
            let category = obj
                .get("category")
                .and_then(|c| c.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| classify_category(&description, amount));
            Some(ExtractedRow {
                date,
                description,
                amount,
                balance,
                category,
            })
        })
        .collect()
}

/// Dig a JSON object out of fenced or prose-wrapped text.
pub fn salvage_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    // ```json ... ``` or ``` ... ```
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                if let Ok(v) = serde_json::from_str::<Value>(after[..end].trim()) {
                    return Some(v);
                }
            }
        }
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    // Last resort: first { to last }
    let first = trimmed.find('{')?;
    let last = trimmed.rfind('}')?;
    if last > first {
        serde_json::from_str::<Value>(&trimmed[first..=last]).ok()
    } else {
        None
    }
}

fn ocr_result(text: String, attempts: u32, trace: Vec<AttemptPhase>) -> ExtractionResult {
    let mut fields = HashMap::new();
    fields.insert("raw_text".to_string(), FieldValue::Text(text));
    ExtractionResult {
        doc_type: "unknown".to_string(),
        confidence: 0.35,
        language: None,
        currency: None,
        fields,
        transactions: Vec::new(),
        via_ocr_fallback: true,
        attempts,
        trace,
    }
}

// ============================================================================
// TESTS
// ============================================================================
