//! Error types for Engram core operations

use thiserror::Error;

/// Main error type aggregating all subsystems
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Graph storage error: {0}")]
    Storage(#[from] GraphError),

    #[error("LLM client error: {0}")]
    Llm(#[from] LlmError),

    #[error("Memory pipeline error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors related to graph storage operations
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Edge not found: {0}")]
    EdgeNotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors related to LLM client operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error from LLM provider (status {status:?}, code {code:?}): {message}")]
    Api {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("LLM returned an empty response (stage {0})")]
    EmptyResponse(String),

    #[error("LLM returned malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Failed to parse LLM response: {0}")]
    ResponseParseError(String),

    #[error("No models configured for the LLM client")]
    NoModelsConfigured,
}

impl LlmError {
    /// Status code of the underlying API failure, when there is one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LlmError::Api { status, .. } => *status,
            _ => None,
        }
    }
}

/// Errors surfaced by the graph memory pipeline
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Extraction failed: {0}")]
    Extraction(#[from] LlmError),

    #[error("Storage failed: {0}")]
    Storage(#[from] GraphError),

    #[error("Updater is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;
