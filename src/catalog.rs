// 📦 Catalog - Final venue list plus everything the front end reports on

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::diet::DietStats;
use crate::enrich::StampStats;
use crate::ledger::LedgerStats;
use crate::matcher::MergeStats;
use crate::sources::PipelineStat;
use crate::venue::VenueRecord;

/// Length of the hex content hash used for cache busting
const HASH_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMeta {
    pub name: String,
    pub description: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub generated_at: DateTime<Utc>,
    pub venue_count: usize,
    /// SHA-256 prefix of the serialized venues
    pub data_hash: String,

    pub venues: Vec<VenueRecord>,

    pub merge_stats: MergeStats,
    pub tag_counts: BTreeMap<String, usize>,
    pub all_tags: Vec<String>,
    pub all_sources: Vec<String>,
    pub all_diets: Vec<String>,
    pub source_meta: Vec<SourceMeta>,
    pub pipeline_stats: Vec<PipelineStat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<StampStats>,
    /// provider -> status -> rows, from the ledger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_stats: Option<LedgerStats>,

    pub diet_stats: DietStats,
}

/// Pipeline results that go into the catalog besides the venues
#[derive(Debug, Clone, Default)]
pub struct CatalogInputs {
    pub merge_stats: MergeStats,
    pub source_meta: Vec<SourceMeta>,
    pub pipeline_stats: Vec<PipelineStat>,
    pub verification: Option<StampStats>,
    pub provider_stats: Option<LedgerStats>,
    pub diet_stats: DietStats,
}

impl Catalog {
    pub fn assemble(venues: Vec<VenueRecord>, inputs: CatalogInputs) -> Result<Self> {
        let tag_counts = tag_counts(&venues);
        let all_tags = tag_counts.keys().cloned().collect();
        let all_sources = venues
            .iter()
            .map(|v| v.source.as_str().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let all_diets = inputs.diet_stats.counts.keys().cloned().collect();
        let data_hash = data_hash(&venues)?;

        Ok(Catalog {
            generated_at: Utc::now(),
            venue_count: venues.len(),
            data_hash,
            venues,
            merge_stats: inputs.merge_stats,
            tag_counts,
            all_tags,
            all_sources,
            all_diets,
            source_meta: inputs.source_meta,
            pipeline_stats: inputs.pipeline_stats,
            verification: inputs.verification,
            provider_stats: inputs.provider_stats,
            diet_stats: inputs.diet_stats,
        })
    }

    /// Write compact JSON, creating parent directories
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output dir: {:?}", parent))?;
        }
        let body = serde_json::to_vec(self).context("Failed to serialize catalog")?;
        fs::write(path, &body).with_context(|| format!("Failed to write catalog: {:?}", path))?;

        info!(
            "Wrote {:?} ({:.1} MB, {} venues, hash={})",
            path,
            body.len() as f64 / 1e6,
            self.venue_count,
            self.data_hash
        );
        Ok(())
    }
}

/// Venues per tag, counting each tag once per venue
pub fn tag_counts(venues: &[VenueRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for v in venues {
        let unique: BTreeSet<&String> = v.tags.iter().collect();
        for tag in unique {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
    }
    counts
}

pub fn data_hash(venues: &[VenueRecord]) -> Result<String> {
    let body = serde_json::to_vec(venues).context("Failed to serialize venues for hashing")?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    let hex = format!("{:x}", hasher.finalize());
    Ok(hex[..HASH_LEN].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::SourceTag;

    fn sample() -> Vec<VenueRecord> {
        vec![
            VenueRecord::new("Katz's", SourceTag::Both).with_tag("deli").with_tag("bar"),
            VenueRecord::new("Union Square", SourceTag::Greenmarket).with_tag("market"),
            VenueRecord::new("Joe's", SourceTag::Dohmh).with_tag("deli").with_tag("deli"),
        ]
    }

    #[test]
    fn test_tag_counts_once_per_venue() {
        let counts = tag_counts(&sample());
        assert_eq!(counts["deli"], 2);
        assert_eq!(counts["bar"], 1);
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn test_assemble_sorted_lists() {
        let mut inputs = CatalogInputs::default();
        inputs.diet_stats.counts.insert("vegan".to_string(), 1);
        inputs.diet_stats.counts.insert("halal".to_string(), 4);

        let catalog = Catalog::assemble(sample(), inputs).unwrap();

        assert_eq!(catalog.venue_count, 3);
        assert_eq!(catalog.all_tags, vec!["bar", "deli", "market"]);
        assert_eq!(catalog.all_sources, vec!["both", "dohmh", "greenmarket"]);
        assert_eq!(catalog.all_diets, vec!["halal", "vegan"]);
    }

    #[test]
    fn test_data_hash_tracks_content() {
        let a = data_hash(&sample()).unwrap();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, data_hash(&sample()).unwrap());

        let mut changed = sample();
        changed[0].name = "Katz's Delicatessen".to_string();
        assert_ne!(a, data_hash(&changed).unwrap());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dist/catalog.json");

        let catalog = Catalog::assemble(sample(), CatalogInputs::default()).unwrap();
        catalog.write(&path).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["venue_count"], 3);
        assert_eq!(json["venues"][0]["source"], "both");
        assert!(json.get("provider_stats").is_none());
    }
}
