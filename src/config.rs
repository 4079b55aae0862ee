// ⚙️ Pipeline Configuration - Environment-Driven Knobs
// Every threshold the pipeline consults lives here with its documented default.
// Override any value with an LF_-prefixed environment variable.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Extraction model endpoint (message post target)
    pub model_url: String,

    /// Bearer token for the extraction model (empty = unauthenticated/mock)
    pub model_api_key: String,

    /// Model identifier sent with each extraction request
    pub model_name: String,

    /// Whole-request deadline for the HTTP client
    pub request_timeout_secs: u64,

    /// Per-message deadline for the extraction call itself
    pub message_timeout_secs: u64,

    /// Retry budget for the extraction call (attempts, not retries)
    pub max_attempts: u32,

    /// Exponential backoff: first delay, doubling per retry
    pub retry_base_delay_ms: u64,

    /// Exponential backoff cap
    pub retry_max_delay_ms: u64,

    /// Confidence below this routes the document to REVIEW
    pub review_confidence_threshold: f64,

    /// Composite image quality below this attaches a quality warning
    pub quality_floor: f64,

    /// Corrections per field before a learning event fires
    pub learning_correction_threshold: usize,

    /// Error rate (corrections / fields extracted) before a learning event fires
    pub learning_error_rate_threshold: f64,

    /// Additional corrections required to re-arm a fired cluster
    pub learning_rearm_step: usize,

    /// Similarity at or above which entity mentions merge (0-1)
    pub entity_merge_threshold: f64,

    /// External memory endpoint learned rules sync to (unset = sync skipped)
    pub memory_url: Option<String>,

    /// Bearer token for the memory endpoint
    pub memory_api_key: String,

    /// Upload size ceiling for the ingestion surface
    pub max_upload_mb: usize,

    /// SQLite database path
    pub db_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            model_url: "http://localhost:9090/v1/extract".to_string(),
            model_api_key: String::new(),
            model_name: "forensic-extractor-v1".to_string(),
            request_timeout_secs: 120,
            message_timeout_secs: 90,
            max_attempts: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 12_000,
            review_confidence_threshold: 0.80,
            quality_floor: 0.70,
            learning_correction_threshold: 100,
            learning_error_rate_threshold: 0.10,
            learning_rearm_step: 25,
            entity_merge_threshold: 0.90,
            memory_url: None,
            memory_api_key: String::new(),
            max_upload_mb: 25,
            db_path: "forensics.db".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Build a config from defaults, overridden by LF_* environment variables.
    pub fn from_env() -> Self {
        let base = PipelineConfig::default();
        PipelineConfig {
            model_url: env_or("LF_MODEL_URL", base.model_url),
            model_api_key: env_or("LF_MODEL_API_KEY", base.model_api_key),
            model_name: env_or("LF_MODEL_NAME", base.model_name),
            request_timeout_secs: env_parse("LF_REQUEST_TIMEOUT_SECS", base.request_timeout_secs),
            message_timeout_secs: env_parse("LF_MESSAGE_TIMEOUT_SECS", base.message_timeout_secs),
            max_attempts: env_parse("LF_MAX_ATTEMPTS", base.max_attempts),
            retry_base_delay_ms: env_parse("LF_RETRY_BASE_DELAY_MS", base.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("LF_RETRY_MAX_DELAY_MS", base.retry_max_delay_ms),
            review_confidence_threshold: env_parse(
                "LF_REVIEW_CONFIDENCE_THRESHOLD",
                base.review_confidence_threshold,
            ),
            quality_floor: env_parse("LF_QUALITY_FLOOR", base.quality_floor),
            learning_correction_threshold: env_parse(
                "LF_LEARNING_CORRECTION_THRESHOLD",
                base.learning_correction_threshold,
            ),
            learning_error_rate_threshold: env_parse(
                "LF_LEARNING_ERROR_RATE_THRESHOLD",
                base.learning_error_rate_threshold,
            ),
            learning_rearm_step: env_parse("LF_LEARNING_REARM_STEP", base.learning_rearm_step),
            entity_merge_threshold: env_parse(
                "LF_ENTITY_MERGE_THRESHOLD",
                base.entity_merge_threshold,
            ),
            memory_url: env::var("LF_MEMORY_URL").ok().filter(|v| !v.is_empty()),
            memory_api_key: env_or("LF_MEMORY_API_KEY", base.memory_api_key),
            max_upload_mb: env_parse("LF_MAX_UPLOAD_MB", base.max_upload_mb),
            db_path: env_or("LF_DB_PATH", base.db_path),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    /// Backoff delay for a given retry round (0-based), doubled each round
    /// and capped at the configured maximum.
    pub fn backoff_delay(&self, retry_round: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_round);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }
}

fn env_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.review_confidence_threshold, 0.80);
        assert_eq!(config.learning_correction_threshold, 100);
        assert_eq!(config.learning_error_rate_threshold, 0.10);
        assert_eq!(config.entity_merge_threshold, 0.90);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = PipelineConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(2_000));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(4_000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(8_000));
        // Capped at retry_max_delay_ms from round 3 on
        assert_eq!(config.backoff_delay(3), Duration::from_millis(12_000));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(12_000));
    }
}
