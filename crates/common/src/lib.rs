//! Scholarbot Common Library
//!
//! Shared code for the Scholarbot binaries including:
//! - The retrieval-augmented answer pipeline
//! - Completion, embedding and vector index clients
//! - Audit log persistence
//! - Prompt catalog
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod index;
pub mod llm;
pub mod metrics;
pub mod prompts;

// Re-export commonly used types
pub use config::AppConfig;
pub use context::{ChatAnswer, ChatPipeline, ChatQuery, PipelineEvent};
pub use db::{QaLogStore, Repository};
pub use embeddings::Embedder;
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
