// 📥 Venue Sources - Where raw venue records come from
//
// A source hands back its venues plus stats describing what it removed on
// the way in. Stats are always present, even when nothing was removed.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

use crate::config::SourceConfig;
use crate::normalize::{normalize_address, normalize_borough, normalize_text};
use crate::venue::{load_venues, VenueRecord};

// ============================================================================
// CORE TYPES
// ============================================================================

/// One line in the catalog's pipeline report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStat {
    pub label: String,
    pub removed: usize,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceStats {
    /// Records seen before in-source dedup
    pub raw_count: usize,
    /// Records dropped as duplicates
    pub removed: usize,
    /// What counted as a duplicate, e.g. "same name + address"
    pub dedup_rule: String,
}

impl SourceStats {
    /// Report line for this source; None when nothing was removed
    pub fn pipeline_stat(&self, source_name: &str) -> Option<PipelineStat> {
        if self.removed == 0 {
            return None;
        }
        Some(PipelineStat {
            label: format!("{} dedup ({})", source_name.to_uppercase(), self.dedup_rule),
            removed: self.removed,
            detail: format!(
                "{} raw → {} after dedup",
                self.raw_count,
                self.raw_count.saturating_sub(self.removed)
            ),
        })
    }
}

/// What a fetch produced; also the cached form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceBatch {
    pub venues: Vec<VenueRecord>,
    pub stats: SourceStats,
}

/// VenueSource - a provider of raw venue records
pub trait VenueSource {
    /// Short identifier, also the cache entry name
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn fetch(&self) -> Result<SourceBatch>;
}

// ============================================================================
// FILE-BACKED SOURCE
// ============================================================================

/// Source reading a harvested JSON or CSV export
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    name: String,
    description: String,
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(name: &str, description: &str, path: impl Into<PathBuf>) -> Self {
        JsonFileSource {
            name: name.to_string(),
            description: description.to_string(),
            path: path.into(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(&config.name, &config.description, config.path.clone())
    }
}

impl VenueSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn fetch(&self) -> Result<SourceBatch> {
        let raw = load_venues(&self.path)?;
        let raw_count = raw.len();
        let venues = dedup_same_name_address(raw);
        let removed = raw_count - venues.len();

        if removed > 0 {
            info!("{}: deduped {} same-name-same-address entries", self.name, removed);
        }

        Ok(SourceBatch {
            venues,
            stats: SourceStats {
                raw_count,
                removed,
                dedup_rule: "same name + address".to_string(),
            },
        })
    }
}

/// Keep the first record per (name, address, borough) after normalization.
/// Records without an address are never collapsed.
pub fn dedup_same_name_address(venues: Vec<VenueRecord>) -> Vec<VenueRecord> {
    let mut seen = HashSet::new();
    venues
        .into_iter()
        .filter(|v| {
            let addr = normalize_address(&v.address);
            if addr.is_empty() {
                return true;
            }
            seen.insert((normalize_text(&v.name), addr, normalize_borough(&v.borough)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::SourceTag;
    use std::fs;

    #[test]
    fn test_dedup_same_name_address() {
        let venues = vec![
            VenueRecord::new("Dead Rabbit", SourceTag::Sla).at("30 Water St", "Manhattan"),
            VenueRecord::new("DEAD RABBIT", SourceTag::Sla).at("30 WATER STREET", "New York"),
            VenueRecord::new("Dead Rabbit", SourceTag::Sla).at("30 Water St", "Brooklyn"),
            VenueRecord::new("Food Cart", SourceTag::Sla),
            VenueRecord::new("Food Cart", SourceTag::Sla),
        ];

        let kept = dedup_same_name_address(venues);
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0].name, "Dead Rabbit");
    }

    #[test]
    fn test_file_source_reports_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sla.json");
        fs::write(
            &path,
            r#"[
                {"name": "Dead Rabbit", "source": "sla", "address": "30 Water St", "borough": "Manhattan"},
                {"name": "Dead Rabbit", "source": "sla", "address": "30 Water St", "borough": "Manhattan"},
                {"name": "Pete's Tavern", "source": "sla", "address": "129 E 18th St", "borough": "Manhattan"}
            ]"#,
        )
        .unwrap();

        let source = JsonFileSource::new("sla", "Liquor licenses", &path);
        let batch = source.fetch().unwrap();

        assert_eq!(batch.venues.len(), 2);
        assert_eq!(batch.stats.raw_count, 3);
        let stat = batch.stats.pipeline_stat(source.name()).unwrap();
        assert_eq!(stat.label, "SLA dedup (same name + address)");
        assert_eq!(stat.removed, 1);
        assert_eq!(stat.detail, "3 raw → 2 after dedup");
    }

    #[test]
    fn test_no_stat_line_without_removals() {
        assert_eq!(SourceStats::default().pipeline_stat("dpr"), None);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let source = JsonFileSource::new("dpr", "", "/nonexistent/dpr.json");
        assert!(source.fetch().is_err());
    }
}
