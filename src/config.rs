// ⚙️ Pipeline Config - One JSON file, every field defaulted
//
// An empty `{}` (or no file at all) yields a working setup. Provider daily
// limits can be overridden from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::matcher::MergeEngine;
use crate::providers::Provider;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-source and diet caches live here
    pub cache_dir: PathBuf,

    pub ledger_path: PathBuf,

    /// Optional manual corrections file
    pub overrides_path: PathBuf,

    /// Catalog JSON destination
    pub output_path: PathBuf,

    pub cache_max_age_hours: u64,

    pub sources: Vec<SourceConfig>,
    pub merge: MergeConfig,
    pub diet: DietConfig,
    pub providers: ProvidersConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            cache_dir: PathBuf::from(".cache"),
            ledger_path: PathBuf::from(".cache/verification.db"),
            overrides_path: PathBuf::from("overrides.json"),
            output_path: PathBuf::from("dist/catalog.json"),
            cache_max_age_hours: 24,
            sources: default_sources(),
            merge: MergeConfig::default(),
            diet: DietConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

/// A venue source backed by a harvested JSON/CSV file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub path: PathBuf,
}

fn default_sources() -> Vec<SourceConfig> {
    [
        ("dohmh", "NYC DOHMH restaurant inspections"),
        ("sla", "NY State Liquor Authority active licenses"),
        ("dpr", "NYC Parks concessions"),
        ("greenmarket", "GrowNYC greenmarkets"),
        ("grocery", "NY State retail food stores"),
    ]
    .into_iter()
    .map(|(name, description)| SourceConfig {
        name: name.to_string(),
        description: description.to_string(),
        path: PathBuf::from(format!("data/{}.json", name)),
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub geo_radius_m: f64,
    pub geo_cell_deg: f64,
    /// `null` disables the name gate on geo merges
    pub geo_min_similarity: Option<f64>,
    pub max_range_span: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let engine = MergeEngine::new();
        MergeConfig {
            geo_radius_m: engine.geo_radius_m,
            geo_cell_deg: engine.geo_cell_deg,
            geo_min_similarity: engine.geo_min_similarity,
            max_range_span: engine.max_range_span,
        }
    }
}

impl MergeConfig {
    pub fn engine(&self) -> MergeEngine {
        MergeEngine {
            geo_radius_m: self.geo_radius_m,
            geo_cell_deg: self.geo_cell_deg,
            geo_min_similarity: self.geo_min_similarity,
            max_range_span: self.max_range_span,
        }
    }
}

/// Diet certification matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DietConfig {
    /// Max distance to a kosher listing (meters)
    pub geo_radius_m: f64,
    pub min_similarity: f64,
    /// Halal certification listing (JSON array)
    pub halal_path: Option<PathBuf>,
    /// Kosher listing (JSON array)
    pub kosher_path: Option<PathBuf>,
}

impl Default for DietConfig {
    fn default() -> Self {
        DietConfig {
            geo_radius_m: 80.0,
            min_similarity: 0.45,
            halal_path: Some(PathBuf::from("data/diet_hms_halal.json")),
            kosher_path: Some(PathBuf::from("data/diet_knm_kosher.json")),
        }
    }
}

// ============================================================================
// PROVIDERS
// ============================================================================

/// Operational controls for one verification provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Max rows checked per run
    pub daily_limit: usize,
    pub requests_per_second: f64,
    /// Only venues in this borough are checked; others are marked `skip`
    pub region: Option<String>,
    /// First search result at or above this name similarity is accepted
    pub min_similarity: f64,
    pub commit_every: usize,
    /// Environment variable holding the API key (None: keyless endpoint)
    pub api_key_env: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            daily_limit: 1000,
            requests_per_second: 4.0,
            region: None,
            min_similarity: 0.45,
            commit_every: 200,
            api_key_env: None,
        }
    }
}

impl ProviderSettings {
    pub fn defaults_for(provider: Provider) -> Self {
        let key_env = Some(format!("{}_API_KEY", provider.env_prefix()));
        match provider {
            Provider::Yelp => ProviderSettings {
                daily_limit: 4500,
                requests_per_second: 4.0,
                api_key_env: key_env,
                ..ProviderSettings::default()
            },
            // Find Place returns its best guess; no name gate
            Provider::Google => ProviderSettings {
                daily_limit: 1000,
                requests_per_second: 8.0,
                region: Some("manhattan".to_string()),
                min_similarity: 0.0,
                api_key_env: key_env,
                ..ProviderSettings::default()
            },
            Provider::OpenTable => ProviderSettings {
                daily_limit: 2000,
                requests_per_second: 3.0,
                commit_every: 100,
                ..ProviderSettings::default()
            },
            Provider::TripAdvisor => ProviderSettings {
                daily_limit: 4500,
                requests_per_second: 4.0,
                commit_every: 100,
                api_key_env: key_env,
                ..ProviderSettings::default()
            },
        }
    }

    /// Resolve the API key; Ok(None) for keyless providers
    pub fn api_key(&self) -> Result<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
                _ => anyhow::bail!("{} not set", var),
            },
        }
    }
}

/// Each provider block is laid over that provider's own defaults, so
/// `{"google": {"region": null}}` keeps Google's key and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProviders")]
pub struct ProvidersConfig {
    pub yelp: ProviderSettings,
    pub google: ProviderSettings,
    pub opentable: ProviderSettings,
    pub tripadvisor: ProviderSettings,
}

#[derive(Deserialize)]
struct RawProviders {
    #[serde(default)]
    yelp: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    google: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    opentable: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    tripadvisor: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<RawProviders> for ProvidersConfig {
    type Error = String;

    fn try_from(raw: RawProviders) -> std::result::Result<Self, Self::Error> {
        Ok(ProvidersConfig {
            yelp: overlay(Provider::Yelp, raw.yelp)?,
            google: overlay(Provider::Google, raw.google)?,
            opentable: overlay(Provider::OpenTable, raw.opentable)?,
            tripadvisor: overlay(Provider::TripAdvisor, raw.tripadvisor)?,
        })
    }
}

fn overlay(
    provider: Provider,
    patch: serde_json::Map<String, serde_json::Value>,
) -> std::result::Result<ProviderSettings, String> {
    let mut base = serde_json::to_value(ProviderSettings::defaults_for(provider))
        .map_err(|e| e.to_string())?;
    if let serde_json::Value::Object(fields) = &mut base {
        fields.extend(patch);
    }
    serde_json::from_value(base).map_err(|e| format!("providers.{}: {}", provider.as_str(), e))
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            yelp: ProviderSettings::defaults_for(Provider::Yelp),
            google: ProviderSettings::defaults_for(Provider::Google),
            opentable: ProviderSettings::defaults_for(Provider::OpenTable),
            tripadvisor: ProviderSettings::defaults_for(Provider::TripAdvisor),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Yelp => &self.yelp,
            Provider::Google => &self.google,
            Provider::OpenTable => &self.opentable,
            Provider::TripAdvisor => &self.tripadvisor,
        }
    }

    pub fn get_mut(&mut self, provider: Provider) -> &mut ProviderSettings {
        match provider {
            Provider::Yelp => &mut self.yelp,
            Provider::Google => &mut self.google,
            Provider::OpenTable => &mut self.opentable,
            Provider::TripAdvisor => &mut self.tripadvisor,
        }
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl PipelineConfig {
    /// Load from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let mut config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        config.apply_env(|var| std::env::var(var).ok());
        Ok(config)
    }

    /// Load when the file exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let mut config = PipelineConfig::default();
                config.apply_env(|var| std::env::var(var).ok());
                Ok(config)
            }
        }
    }

    /// `{PROVIDER}_DAILY_LIMIT` overrides the configured daily limit
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for provider in Provider::ALL {
            let var = format!("{}_DAILY_LIMIT", provider.env_prefix());
            if let Some(raw) = lookup(&var) {
                match raw.trim().parse::<usize>() {
                    Ok(limit) => {
                        debug!("{} = {}", var, limit);
                        self.providers.get_mut(provider).daily_limit = limit;
                    }
                    Err(_) => warn!("Ignoring {}: not a number ({:?})", var, raw),
                }
            }
        }
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}
