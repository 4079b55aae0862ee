// Ledger Forensics - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod currency;
pub mod db;
pub mod document;
pub mod entity_resolution;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod learning;
pub mod pipeline;
pub mod quality;
pub mod spreadsheet;
pub mod validation;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use currency::{CurrencyProfile, CurrencyRegistry};
pub use db::{
    open_database, setup_database, AnomalySummary, BatchStatus, Event, FailureCluster,
    PipelineMetrics, StoredAnomaly, StoredEntity, StoredTransaction,
};
pub use document::{Document, DocumentStatus, FieldValue, SourceFormat};
pub use entity_resolution::{EntityCandidate, EntityCategory, EntityMatch, EntityResolver};
pub use error::{ExtractError, LearningSyncError, StateError};
pub use extraction::{ExtractionClient, ExtractionResult, OcrEngine, PayloadStrategy};
pub use graph::{GraphBuilder, KnowledgeEdge, KnowledgeGraph, KnowledgeNode};
pub use learning::{
    Correction, CorrectionCluster, LearningEngine, LearningEvent, LearningEventKind,
    MemorySyncClient,
};
pub use pipeline::{DocumentView, ForensicPipeline, LearningStatus};
pub use quality::{GrayImage, QualityAssessment, QualityEngine};
pub use spreadsheet::{NormalizedRow, NormalizedStatement, SpreadsheetNormalizer};
pub use validation::{Anomaly, AnomalyClass, Severity, ValidationEngine, ValidationOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
