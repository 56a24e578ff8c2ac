//! # Engram Memory
//!
//! The episodic graph memory pipeline: converts streams of agent activity
//! into validated, deduplicated, temporally-consistent graph mutations.
//!
//! Components compose acyclically: the extractor turns episode text into
//! candidate entities and relations, the resolver deduplicates entities
//! against the store, the invalidator finds contradicted edges, and the
//! per-graph updater drives them all from a worker task. The registry owns
//! one updater per simulation.

pub mod extractor;
pub mod invalidator;
pub mod registry;
pub mod resolver;
pub mod updater;

pub use extractor::LlmGraphExtractor;
pub use invalidator::{HybridEdgeInvalidator, LlmEdgeInvalidator, RuleBasedEdgeInvalidator};
pub use registry::UpdaterRegistry;
pub use resolver::{EntityResolver, LlmDisambiguator, ResolvedEntity};
pub use updater::{GraphMemoryUpdater, UpdaterStats, BATCH_SIZE};
