//! LLM settings persisted on disk, plus stage routing metadata.
//!
//! Settings live in a single JSON file. Writes go through a temp file and an
//! atomic rename, so concurrent readers never observe a partial document.
//! In-process the current settings sit behind a [`SettingsHandle`] that is
//! re-read per LLM call and swapped when an update is applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

/// Environment variable overriding the settings file location
pub const SETTINGS_PATH_ENV: &str = "ENGRAM_LLM_CONFIG_FILE";
/// Upper bound on the configured model pool
pub const MAX_MODELS: usize = 10;

/// Task stages used for per-stage model routing and usage aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    JsonStructure,
    ContentGeneration,
    Reasoning,
    ProfileGeneration,
    OasisSimulation,
    Fallback,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::JsonStructure,
        Stage::ContentGeneration,
        Stage::Reasoning,
        Stage::ProfileGeneration,
        Stage::OasisSimulation,
        Stage::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::JsonStructure => "json_structure",
            Stage::ContentGeneration => "content_generation",
            Stage::Reasoning => "reasoning",
            Stage::ProfileGeneration => "profile_generation",
            Stage::OasisSimulation => "oasis_simulation",
            Stage::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptive metadata for one stage, served by the configuration API.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub stage: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub recommended: &'static [&'static str],
}

/// The stage catalog served by `GET /llm/stages`.
pub fn stage_catalog() -> Vec<StageInfo> {
    vec![
        StageInfo {
            stage: "json_structure",
            label: "Structured JSON output",
            description: "Extraction, outline planning and other tasks that demand strict JSON",
            recommended: &["gpt-4o", "deepseek-chat"],
        },
        StageInfo {
            stage: "content_generation",
            label: "Long-form content",
            description: "Report sections and other long text that needs writing quality",
            recommended: &["claude-sonnet-4-5"],
        },
        StageInfo {
            stage: "reasoning",
            label: "Complex reasoning",
            description: "Deep analysis and planning tasks",
            recommended: &["claude-opus-4-5", "deepseek-reasoner"],
        },
        StageInfo {
            stage: "profile_generation",
            label: "Agent profile generation",
            description: "Creative persona text for simulated agents",
            recommended: &["claude-sonnet-4-5", "deepseek-chat"],
        },
        StageInfo {
            stage: "oasis_simulation",
            label: "Simulation driving",
            description: "High-volume agent action generation inside the simulation",
            recommended: &["deepseek-chat"],
        },
        StageInfo {
            stage: "fallback",
            label: "Default",
            description: "Anything not covered by another stage",
            recommended: &[],
        },
    ]
}

/// A named routing preset applied via `POST /llm/routing`.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingPreset {
    pub name: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub routing: BTreeMap<&'static str, &'static str>,
}

/// The preset catalog served by `GET /llm/presets`.
pub fn routing_presets() -> Vec<RoutingPreset> {
    vec![
        RoutingPreset {
            name: "economy",
            label: "Economy",
            description: "Lowest cost, suitable for testing",
            routing: BTreeMap::from([
                ("json_structure", "gpt-4o-mini"),
                ("content_generation", "deepseek-chat"),
                ("reasoning", "deepseek-reasoner"),
                ("profile_generation", "deepseek-chat"),
                ("fallback", "gpt-4o-mini"),
            ]),
        },
        RoutingPreset {
            name: "quality",
            label: "Quality first",
            description: "Best output quality, higher cost",
            routing: BTreeMap::from([
                ("json_structure", "gpt-4o"),
                ("content_generation", "claude-opus-4-5"),
                ("reasoning", "claude-opus-4-5"),
                ("profile_generation", "claude-sonnet-4-5"),
                ("fallback", "gpt-4o"),
            ]),
        },
        RoutingPreset {
            name: "balanced",
            label: "Balanced",
            description: "Balances quality and cost (default)",
            routing: BTreeMap::from([
                ("json_structure", "gpt-4o"),
                ("content_generation", "claude-sonnet-4-5"),
                ("reasoning", "claude-opus-4-5"),
                ("profile_generation", "deepseek-chat"),
                ("fallback", "gpt-4o"),
            ]),
        },
    ]
}

/// Normalize a base url so it ends with `/v1` (appended when absent).
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// On-disk LLM settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub base_url: String,
    /// Stored as plaintext; never included in the public projection
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    /// stage name -> model
    #[serde(default)]
    pub model_routing: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl LlmSettings {
    pub fn normalized_base_url(&self) -> String {
        normalize_base_url(&self.base_url)
    }

    /// Routed model for the stage, falling back to the `fallback` route.
    pub fn model_for_stage(&self, stage: Stage) -> Option<&str> {
        self.model_routing
            .get(stage.as_str())
            .or_else(|| self.model_routing.get(Stage::Fallback.as_str()))
            .map(|s| s.as_str())
    }

    /// Ordered model pool for one call: the stage-routed model first (when
    /// configured), then the remaining configured models in order.
    pub fn model_pool(&self, stage: Stage) -> Vec<String> {
        match self.model_for_stage(stage) {
            Some(routed) => {
                let mut pool = vec![routed.to_string()];
                pool.extend(
                    self.models
                        .iter()
                        .filter(|m| m.as_str() != routed)
                        .cloned(),
                );
                pool
            }
            None => self.models.clone(),
        }
    }

    /// Projection safe to return over the API: the key itself is replaced by
    /// a set-flag and its last four characters.
    pub fn public_view(&self) -> serde_json::Value {
        let key = self.api_key.trim();
        let last4 = if key.len() >= 4 {
            &key[key.len() - 4..]
        } else {
            key
        };
        serde_json::json!({
            "base_url": self.normalized_base_url(),
            "models": self.models,
            "model_routing": self.model_routing,
            "api_key_set": !key.is_empty(),
            "api_key_last4": last4,
            "updated_at": self.updated_at,
        })
    }
}

/// A partial settings update; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub clear_api_key: bool,
    pub models: Option<Vec<String>>,
    /// Merged into the current routing; an empty value removes the stage.
    pub model_routing: Option<BTreeMap<String, String>>,
}

/// Resolve the settings file location: env override, then the preferred
/// config directory, then the legacy uploads location.
pub fn resolve_settings_path(root: &Path) -> PathBuf {
    if let Ok(explicit) = std::env::var(SETTINGS_PATH_ENV) {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit);
        }
    }
    let preferred = root.join("engram-config").join("llm.json");
    let legacy = root.join("uploads").join("settings").join("llm.json");
    if preferred.exists() {
        return preferred;
    }
    if legacy.exists() {
        return legacy;
    }
    preferred
}

/// Load settings from disk; a missing or unreadable file yields defaults.
pub fn load_settings(path: &Path) -> LlmSettings {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return LlmSettings::default(),
    };
    match serde_json::from_str::<LlmSettings>(&data) {
        Ok(mut settings) => {
            settings.models.retain(|m| !m.trim().is_empty());
            settings.models.truncate(MAX_MODELS);
            settings
        }
        Err(e) => {
            warn!("Ignoring unparsable LLM settings at {}: {}", path.display(), e);
            LlmSettings::default()
        }
    }
}

/// Apply an update on top of the current on-disk settings and persist the
/// result atomically (write to `<path>.tmp`, then rename).
pub fn save_settings(path: &Path, update: SettingsUpdate) -> std::io::Result<LlmSettings> {
    let current = load_settings(path);

    let base_url = match update.base_url {
        Some(url) => normalize_base_url(&url),
        None => current.base_url.clone(),
    };

    let api_key = if update.clear_api_key {
        String::new()
    } else {
        match update.api_key {
            Some(key) => key.trim().to_string(),
            None => current.api_key.clone(),
        }
    };

    let models = match update.models {
        Some(models) => {
            let mut cleaned: Vec<String> = models
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            cleaned.truncate(MAX_MODELS);
            cleaned
        }
        None => current.models.clone(),
    };

    let mut model_routing = current.model_routing.clone();
    if let Some(routing) = update.model_routing {
        for (stage, model) in routing {
            let stage = stage.trim().to_string();
            if stage.is_empty() {
                continue;
            }
            let model = model.trim().to_string();
            if model.is_empty() {
                model_routing.remove(&stage);
            } else {
                model_routing.insert(stage, model);
            }
        }
    }

    let next = LlmSettings {
        base_url,
        api_key,
        models,
        model_routing,
        updated_at: Some(chrono::Utc::now().to_rfc3339()),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(&next)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, payload)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(next)
}

/// Shared handle over the current settings. Reads take a snapshot per LLM
/// call; updates persist to disk first and then swap the in-memory value.
pub struct SettingsHandle {
    path: PathBuf,
    inner: RwLock<LlmSettings>,
}

impl SettingsHandle {
    /// Load the handle from the given file.
    pub fn load(path: PathBuf) -> Self {
        let settings = load_settings(&path);
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    /// Construct a handle with explicit settings, bypassing the filesystem.
    /// The path is still used for subsequent saves.
    pub fn with_settings(path: PathBuf, settings: LlmSettings) -> Self {
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings snapshot.
    pub fn snapshot(&self) -> LlmSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Persist an update and swap it in.
    pub fn apply(&self, update: SettingsUpdate) -> std::io::Result<LlmSettings> {
        let next = save_settings(&self.path, update)?;
        *self.inner.write().expect("settings lock poisoned") = next.clone();
        Ok(next)
    }
}
