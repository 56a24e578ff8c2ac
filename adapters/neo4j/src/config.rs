//! Configuration for the Neo4j adapter

use serde::{Deserialize, Serialize};

/// Neo4j connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    /// Bolt URI, e.g. "bolt://localhost:7687"
    pub uri: String,
    /// Username (defaults to "neo4j")
    pub user: Option<String>,
    /// Password (defaults to "neo4j")
    pub password: Option<String>,
}

impl Neo4jConfig {
    /// Create a config for the given URI with default credentials
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            user: None,
            password: None,
        }
    }

    /// Set the credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self::new("bolt://localhost:7687")
    }
}
