//! Configuration management for Scholarbot services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Audit log database configuration
    pub database: DatabaseConfig,

    /// Completion model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration
    pub vector_index: VectorIndexConfig,

    /// Answer pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (JSON responses only; streams are not cut)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Allowed CORS origins; empty allows any origin
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply embedded migrations on start-up
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Completion provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the completion service
    pub api_key: Option<String>,

    /// API base URL (for OpenAI-compatible endpoints)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Chat model to use
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for embedding service (falls back to the llm key)
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorIndexConfig {
    /// Milvus / Zilliz REST endpoint
    pub endpoint: String,

    /// Bearer token
    pub token: Option<String>,

    /// Collection holding the scholarship chunks
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Name of the vector field
    #[serde(default = "default_vector_field")]
    pub vector_field: String,

    /// Similarity metric
    #[serde(default = "default_metric_type")]
    pub metric_type: String,

    /// IVF probe count
    #[serde(default = "default_nprobe")]
    pub nprobe: u32,

    /// Request timeout in seconds
    #[serde(default = "default_index_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Number of contexts requested from the index
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Conversation turns kept for question rewriting
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Extract a metadata filter before searching
    #[serde(default = "default_enabled")]
    pub metadata_filtering: bool,

    /// JSON file with the metadata vocabulary (built-in when absent)
    pub metadata_schema_path: Option<PathBuf>,

    /// TOML prompt catalog (built-in when absent)
    pub prompts_path: Option<PathBuf>,

    /// Language used when a request carries none or an unknown one
    #[serde(default = "default_language")]
    pub default_language: String,

    /// Sampling temperature for small talk
    #[serde(default = "default_smalltalk_temperature")]
    pub smalltalk_temperature: f32,

    /// Output cap for question rewriting
    #[serde(default = "default_rephrase_max_tokens")]
    pub rephrase_max_tokens: u32,

    /// Ask the completion service for usage on the final stream chunk
    #[serde(default = "default_enabled")]
    pub stream_usage: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 60 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_provider() -> String { "openai".to_string() }
fn default_api_base() -> String { "https://api.openai.com/v1".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_embedding_model() -> String { crate::DEFAULT_EMBEDDING_MODEL.to_string() }
fn default_embedding_dimension() -> usize { crate::DEFAULT_EMBEDDING_DIMENSION }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_collection() -> String { "rag5_scholarships_hybrid".to_string() }
fn default_vector_field() -> String { "vector".to_string() }
fn default_metric_type() -> String { "COSINE".to_string() }
fn default_nprobe() -> u32 { 10 }
fn default_index_timeout() -> u64 { 15 }
fn default_top_k() -> usize { 7 }
fn default_history_window() -> usize { 8 }
fn default_language() -> String { "zh".to_string() }
fn default_smalltalk_temperature() -> f32 { 0.7 }
fn default_rephrase_max_tokens() -> u32 { 150 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "scholarbot".to_string() }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: default_api_base(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            history_window: default_history_window(),
            metadata_filtering: default_enabled(),
            metadata_schema_path: None,
            prompts_path: None,
            default_language: default_language(),
            smalltalk_temperature: default_smalltalk_temperature(),
            rephrase_max_tokens: default_rephrase_max_tokens(),
            stream_usage: default_enabled(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__VECTOR_INDEX__ENDPOINT=https://...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Embedding key, falling back to the completion key
    pub fn embedding_api_key(&self) -> Option<&str> {
        self.embedding
            .api_key
            .as_deref()
            .or(self.llm.api_key.as_deref())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/scholarbot".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                run_migrations: default_enabled(),
            },
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_index: VectorIndexConfig {
                endpoint: "http://localhost:19530".to_string(),
                token: None,
                collection: default_collection(),
                vector_field: default_vector_field(),
                metric_type: default_metric_type(),
                nprobe: default_nprobe(),
                timeout_secs: default_index_timeout(),
            },
            pipeline: PipelineConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
