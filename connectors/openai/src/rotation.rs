//! Shared error classification for model rotation.
//!
//! Gateway-style APIs give each model its own quota. When one model is
//! exhausted or unavailable the client advances to the next model in the
//! configured order; errors that rotation cannot fix (auth, malformed
//! requests) surface immediately.

use serde::{Deserialize, Serialize};

/// A classified failure from one attempt against one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFailure {
    /// Coarse failure kind, e.g. `api_error` or `network`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ApiFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: "network".to_string(),
            status_code: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "api_error".to_string(),
            status_code: Some(status),
            code,
            message: message.into(),
        }
    }
}

const QUOTA_HINTS: &[&str] = &[
    "insufficient_quota",
    "quota",
    "billing",
    "balance",
    "credit",
    "exceeded",
    "payment required",
    "no remaining",
    "out of credits",
];

const MODEL_HINTS: &[&str] = &[
    "model_not_found",
    "does not exist",
    "not found",
    "unknown model",
    "no such model",
];

/// Decide whether the failure warrants advancing to the next model.
/// Returns `(should_rotate, reason)`.
pub fn should_rotate(failure: &ApiFailure) -> (bool, &'static str) {
    let code = failure
        .code
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    let msg = failure.message.to_lowercase();

    // Explicit provider codes first.
    if code == "insufficient_quota" {
        return (true, "insufficient_quota");
    }
    if code == "model_not_found" {
        return (true, "model_not_found");
    }

    // HTTP-based heuristics.
    match failure.status_code {
        Some(402) => return (true, "payment_required"),
        // Gateways commonly reuse 429 for quota depletion.
        Some(429) => return (true, "rate_limit_or_quota"),
        Some(403) if QUOTA_HINTS.iter().any(|h| msg.contains(h)) => {
            return (true, "forbidden_quota")
        }
        Some(404) if msg.contains("model") && MODEL_HINTS.iter().any(|h| msg.contains(h)) => {
            return (true, "model_not_found")
        }
        _ => {}
    }

    // Message-only fallbacks for unstructured gateway errors.
    if QUOTA_HINTS.iter().any(|h| msg.contains(h)) {
        return (true, "quota_hint");
    }
    if msg.contains("model") && MODEL_HINTS.iter().any(|h| msg.contains(h)) {
        return (true, "model_hint");
    }

    (false, "non_rotatable")
}
