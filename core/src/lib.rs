//! # Engram Core
//!
//! Core types, traits, and shared logic for the Engram temporal knowledge
//! graph memory. This crate provides the fundamental abstractions that all
//! adapters and pipeline components implement.

pub mod activity;
pub mod errors;
pub mod ontology;
pub mod similarity;
pub mod traits;
pub mod types;

// Re-export commonly used types and traits
pub use activity::Activity;
pub use errors::{CoreError, GraphError, LlmError, MemoryError};
pub use ontology::{Ontology, OntologyEntry};
pub use traits::{ContradictionDetector, GraphStore, KnowledgeExtractor};
pub use types::{Chunk, EdgeFact, Entity, GraphId, GraphMeta, Relation};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activity::*;
    pub use crate::errors::*;
    pub use crate::ontology::*;
    pub use crate::traits::*;
    pub use crate::types::*;
    pub use async_trait::async_trait;
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
