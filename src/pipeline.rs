// 🚚 Pipeline - Sources → merge → enrichment → catalog
//
// Also drives the verification side: syncing cached venues into the ledger
// and running provider batches.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

use crate::cache::JsonCache;
use crate::catalog::{Catalog, CatalogInputs, SourceMeta};
use crate::config::PipelineConfig;
use crate::diet::{load_entries, DietEntry, DietTagger};
use crate::enrich::{apply_bbox_filter, apply_overrides, load_overrides, stamp_verification};
use crate::ledger::Ledger;
use crate::providers::{Provider, VerificationProvider};
use crate::sources::{JsonFileSource, PipelineStat, SourceBatch, VenueSource};
use crate::venue::VenueRecord;

/// Raw records gathered from every source, before merging
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub venues: Vec<VenueRecord>,
    pub source_meta: Vec<SourceMeta>,
    pub pipeline_stats: Vec<PipelineStat>,
}

/// Per-run overrides for `verify`
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Replaces the configured daily limit
    pub limits: BTreeMap<Provider, usize>,
    /// Replaces the configured Google region
    pub google_region: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    pub synced: usize,
    pub checked: BTreeMap<Provider, usize>,
}

pub struct Pipeline {
    config: PipelineConfig,
    cache: JsonCache,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let cache = JsonCache::with_max_age_hours(&config.cache_dir, config.cache_max_age_hours);
        Pipeline { config, cache }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========================================================================
    // BUILD
    // ========================================================================

    /// Configured sources, optionally narrowed to `selected` names
    pub fn sources(&self, selected: Option<&[String]>) -> Vec<Box<dyn VenueSource>> {
        if let Some(names) = selected {
            for name in names {
                if self.config.source(name).is_none() {
                    warn!("Unknown source: {}", name);
                }
            }
        }

        self.config
            .sources
            .iter()
            .filter(|s| selected.map_or(true, |names| names.iter().any(|n| n == &s.name)))
            .map(|s| Box::new(JsonFileSource::from_config(s)) as Box<dyn VenueSource>)
            .collect()
    }

    /// Fetch every source through the cache.
    ///
    /// With `use_cache`, a fresh cache entry short-circuits the fetch. A
    /// failed fetch falls back to the cache at any age; with no cache at all
    /// the source contributes nothing.
    pub fn collect(&self, sources: &[Box<dyn VenueSource>], use_cache: bool) -> Result<Collected> {
        let mut out = Collected::default();

        for source in sources {
            info!("=== Fetching: {} - {} ===", source.name(), source.description());

            let cached: Option<SourceBatch> = if use_cache {
                self.cache.load(source.name())?
            } else {
                None
            };

            let batch = match cached {
                Some(batch) => {
                    info!("Using cached data for {}", source.name());
                    batch
                }
                None => match source.fetch() {
                    Ok(batch) => {
                        self.cache.save(source.name(), &batch)?;
                        info!("Cached {} venues for {}", batch.venues.len(), source.name());
                        batch
                    }
                    Err(e) => {
                        error!("Failed to fetch from {}: {:#}", source.name(), e);
                        match self.cache.load_stale::<SourceBatch>(source.name())? {
                            Some(batch) => {
                                warn!("Using stale cache for {} as fallback", source.name());
                                batch
                            }
                            None => SourceBatch::default(),
                        }
                    }
                },
            };

            out.source_meta.push(SourceMeta {
                name: source.name().to_string(),
                description: source.description().to_string(),
                count: batch.venues.len(),
            });
            out.pipeline_stats.extend(batch.stats.pipeline_stat(source.name()));
            out.venues.extend(batch.venues);
        }

        info!(
            "Total venues (pre-merge): {} from {} sources",
            out.venues.len(),
            out.source_meta.len()
        );
        Ok(out)
    }

    pub fn build(&self, selected: Option<&[String]>, use_cache: bool) -> Result<Catalog> {
        let sources = self.sources(selected);
        if sources.is_empty() {
            anyhow::bail!("No data sources selected");
        }
        info!(
            "Active sources: {}",
            sources.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );
        self.build_from(&sources, use_cache)
    }

    /// Full build over explicit sources
    pub fn build_from(&self, sources: &[Box<dyn VenueSource>], use_cache: bool) -> Result<Catalog> {
        let collected = self.collect(sources, use_cache)?;

        let (mut venues, merge_stats) = self.config.merge.engine().merge(collected.venues);

        match load_overrides(&self.config.overrides_path)? {
            Some(overrides) => {
                apply_overrides(&mut venues, &overrides);
            }
            None => info!("No overrides file at {:?}, skipping", self.config.overrides_path),
        }

        apply_bbox_filter(&mut venues);

        let (verification, provider_stats) = if self.config.ledger_path.exists() {
            let ledger = Ledger::open(&self.config.ledger_path)?;
            let flags = ledger.all_flags()?;
            let stamp = stamp_verification(&mut venues, &flags);
            let stats = ledger.stats()?;
            info!("Ledger status: {:?}", stats);
            (Some(stamp), Some(stats))
        } else {
            info!("Verification: no ledger yet, skipping (run `verify` first)");
            (None, None)
        };

        let halal = self.diet_listing("hms_halal", self.config.diet.halal_path.as_deref(), use_cache)?;
        let kosher = self.diet_listing("knm_kosher", self.config.diet.kosher_path.as_deref(), use_cache)?;
        let diet_stats = DietTagger::new(&self.config.diet, &halal, kosher).tag(&mut venues);

        Catalog::assemble(
            venues,
            CatalogInputs {
                merge_stats,
                source_meta: collected.source_meta,
                pipeline_stats: collected.pipeline_stats,
                verification,
                provider_stats,
                diet_stats,
            },
        )
    }

    /// Build and write the catalog to the configured output path
    pub fn build_and_write(&self, selected: Option<&[String]>, use_cache: bool) -> Result<Catalog> {
        let catalog = self.build(selected, use_cache)?;
        catalog.write(&self.config.output_path)?;
        info!("Build complete → {:?}", self.config.output_path);
        Ok(catalog)
    }

    /// Certification listing, cached as `diet_{name}`; empty when unavailable
    fn diet_listing(&self, name: &str, path: Option<&Path>, use_cache: bool) -> Result<Vec<DietEntry>> {
        let cache_name = format!("diet_{}", name);

        if use_cache {
            if let Some(entries) = self.cache.load(&cache_name)? {
                return Ok(entries);
            }
        }

        let loaded = match path {
            Some(p) if p.exists() => load_entries(p),
            Some(p) => Err(anyhow::anyhow!("listing not found at {:?}", p)),
            None => Err(anyhow::anyhow!("no listing configured")),
        };

        match loaded {
            Ok(entries) => {
                self.cache.save(&cache_name, &entries)?;
                info!("{}: {} listings", name, entries.len());
                Ok(entries)
            }
            Err(e) => match self.cache.load_stale::<Vec<DietEntry>>(&cache_name)? {
                Some(entries) => {
                    warn!("{}: {:#}; using stale cache", name, e);
                    Ok(entries)
                }
                None => {
                    info!("{}: {:#}; skipping", name, e);
                    Ok(Vec::new())
                }
            },
        }
    }

    // ========================================================================
    // VERIFICATION
    // ========================================================================

    pub fn open_ledger(&self) -> Result<Ledger> {
        Ledger::open(&self.config.ledger_path)
    }

    /// Raw venues from every cached source batch, at any age
    pub fn cached_venues(&self) -> Result<Vec<VenueRecord>> {
        let mut venues = Vec::new();
        for source in &self.config.sources {
            if let Some(batch) = self.cache.load_stale::<SourceBatch>(&source.name)? {
                venues.extend(batch.venues);
            }
        }
        Ok(venues)
    }

    /// Sync cached venues into the ledger, then run each provider's batch
    pub fn verify(&self, providers: &[Box<dyn VerificationProvider>], options: &VerifyOptions) -> Result<VerifyReport> {
        let mut ledger = self.open_ledger()?;
        let mut report = VerifyReport::default();

        let venues = self.cached_venues()?;
        if venues.is_empty() {
            warn!("No cached venue data found, run `build` first");
        } else {
            report.synced = ledger.sync(&venues)?;
        }

        for client in providers {
            let p = client.provider();
            let settings = client.settings();
            let limit = options.limits.get(&p).copied().unwrap_or(settings.daily_limit);
            let region = match (p, &options.google_region) {
                (Provider::Google, Some(r)) => Some(r.as_str()),
                _ => settings.region.as_deref(),
            };

            let n = ledger.check_provider(client.as_ref(), limit, region)?;
            report.checked.insert(p, n);
        }

        info!("Verification status: {:?}", ledger.stats()?);
        Ok(report)
    }

    /// Details backfill for every provider with a details endpoint
    pub fn backfill(&self, providers: &[Box<dyn VerificationProvider>], limit: usize) -> Result<BTreeMap<Provider, usize>> {
        let mut ledger = self.open_ledger()?;
        let mut filled = BTreeMap::new();

        for client in providers.iter().filter(|c| c.supports_details()) {
            let n = ledger.backfill(client.as_ref(), limit)?;
            filled.insert(client.provider(), n);
        }

        info!("Backfill: {:?}", filled);
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderSettings, SourceConfig};
    use crate::ledger::Status;
    use crate::normalize::venue_key;
    use crate::providers::{Candidate, LookupError, VenueQuery};
    use crate::venue::SourceTag;
    use std::fs;

    struct FailingSource;

    impl VenueSource for FailingSource {
        fn name(&self) -> &str {
            "dohmh"
        }

        fn description(&self) -> &str {
            "always down"
        }

        fn fetch(&self) -> Result<SourceBatch> {
            anyhow::bail!("connection refused")
        }
    }

    /// Finds every venue under its own name
    struct EchoProvider {
        provider: Provider,
        settings: ProviderSettings,
    }

    impl EchoProvider {
        fn boxed(provider: Provider) -> Box<dyn VerificationProvider> {
            let mut settings = ProviderSettings::defaults_for(provider);
            settings.requests_per_second = 0.0;
            Box::new(EchoProvider { provider, settings })
        }
    }

    impl VerificationProvider for EchoProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn settings(&self) -> &ProviderSettings {
            &self.settings
        }

        fn search(&self, query: &VenueQuery) -> Result<Vec<Candidate>, LookupError> {
            Ok(vec![Candidate {
                name: query.name.clone(),
                external_id: Some(format!("id-{}", query.name)),
                rating: Some(4.5),
                review_count: Some(120),
                lat: Some(40.7308),
                lng: Some(-73.9973),
                ..Candidate::default()
            }])
        }
    }

    fn test_config(root: &Path) -> PipelineConfig {
        let data = root.join("data");
        fs::create_dir_all(&data).unwrap();

        fs::write(
            data.join("dohmh.json"),
            r#"[
                {"name": "Joe's Pizza", "source": "dohmh", "address": "7 Carmine St", "borough": "Manhattan",
                 "lat": 40.7306, "lng": -74.0021, "tags": ["pizza"]},
                {"name": "Blossom", "source": "dohmh", "address": "187 9th Ave", "borough": "Manhattan",
                 "lat": 40.7460, "lng": -74.0011, "cuisine": "Vegan"}
            ]"#,
        )
        .unwrap();
        fs::write(
            data.join("sla.json"),
            r#"[
                {"name": "JOES PIZZA INC", "source": "sla", "address": "7 CARMINE STREET", "borough": "NEW YORK",
                 "tags": ["beer"]},
                {"name": "Dead Rabbit", "source": "sla", "address": "30 Water St", "borough": "Manhattan",
                 "lat": 40.6782, "lng": -73.9442}
            ]"#,
        )
        .unwrap();

        let mut config = PipelineConfig::default();
        config.cache_dir = root.join("cache");
        config.ledger_path = root.join("cache/verification.db");
        config.overrides_path = root.join("overrides.json");
        config.output_path = root.join("dist/catalog.json");
        config.sources = ["dohmh", "sla"]
            .iter()
            .map(|name| SourceConfig {
                name: name.to_string(),
                description: format!("{} export", name),
                path: data.join(format!("{}.json", name)),
            })
            .collect();
        config.diet.halal_path = None;
        config.diet.kosher_path = Some(root.join("data/knm.json"));
        config
    }

    #[test]
    fn test_build_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));

        let catalog = pipeline.build_and_write(None, false).unwrap();

        assert_eq!(catalog.merge_stats.pass1, 1);
        assert_eq!(catalog.venue_count, 3);
        assert_eq!(catalog.all_sources, vec!["both", "dohmh", "sla"]);
        assert_eq!(catalog.all_tags, vec!["beer", "pizza"]);
        assert_eq!(catalog.source_meta[1].count, 2);

        let joes = catalog.venues.iter().find(|v| v.name == "Joe's Pizza").unwrap();
        assert_eq!(joes.source, SourceTag::Both);
        assert_eq!(joes.license_name.as_deref(), Some("JOES PIZZA INC"));

        // Brooklyn coordinates on a Manhattan address
        let rabbit = catalog.venues.iter().find(|v| v.name == "Dead Rabbit").unwrap();
        assert_eq!(rabbit.coords(), None);

        let blossom = catalog.venues.iter().find(|v| v.name == "Blossom").unwrap();
        assert_eq!(blossom.diet, vec!["vegan", "vegetarian"]);

        assert!(catalog.provider_stats.is_none());
        assert!(dir.path().join("dist/catalog.json").exists());
        assert!(dir.path().join("cache/dohmh.json").exists());
    }

    #[test]
    fn test_selected_sources() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));

        let selected = vec!["sla".to_string(), "osm".to_string()];
        let sources = pipeline.sources(Some(&selected));

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name(), "sla");
    }

    #[test]
    fn test_failed_fetch_uses_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));

        let cached = SourceBatch {
            venues: vec![VenueRecord::new("Cached Diner", SourceTag::Dohmh)],
            ..SourceBatch::default()
        };
        pipeline.cache.save("dohmh", &cached).unwrap();

        let sources: Vec<Box<dyn VenueSource>> = vec![Box::new(FailingSource)];
        let collected = pipeline.collect(&sources, false).unwrap();

        assert_eq!(collected.venues.len(), 1);
        assert_eq!(collected.venues[0].name, "Cached Diner");
        assert_eq!(collected.source_meta[0].count, 1);
    }

    #[test]
    fn test_failed_fetch_without_cache_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));

        let sources: Vec<Box<dyn VenueSource>> = vec![Box::new(FailingSource)];
        let collected = pipeline.collect(&sources, false).unwrap();

        assert!(collected.venues.is_empty());
        assert_eq!(collected.source_meta[0].count, 0);
    }

    #[test]
    fn test_overrides_applied_before_stamping() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));
        fs::write(
            dir.path().join("overrides.json"),
            r#"{"overrides": [{"name": "Blossom", "address": "187 9th Ave", "borough": "Manhattan", "action": "drop_coords"}]}"#,
        )
        .unwrap();

        let catalog = pipeline.build(None, false).unwrap();
        let blossom = catalog.venues.iter().find(|v| v.name == "Blossom").unwrap();

        assert_eq!(blossom.coords(), None);
    }

    #[test]
    fn test_verify_then_build_stamps_flags() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));

        // populate the source cache
        pipeline.build(None, false).unwrap();

        let providers = vec![EchoProvider::boxed(Provider::Yelp), EchoProvider::boxed(Provider::Google)];
        let options = VerifyOptions {
            limits: [(Provider::Yelp, 2)].into_iter().collect(),
            google_region: Some("brooklyn".to_string()),
        };
        let report = pipeline.verify(&providers, &options).unwrap();

        assert_eq!(report.synced, 4);
        assert_eq!(report.checked[&Provider::Yelp], 2);
        assert_eq!(report.checked[&Provider::Google], 0);

        let ledger = pipeline.open_ledger().unwrap();
        let key = venue_key("Joe's Pizza", "7 Carmine St", "Manhattan");
        assert_eq!(ledger.flags(&key).unwrap().unwrap().status(Provider::Google), Status::Skip);
        drop(ledger);

        let catalog = pipeline.build(None, true).unwrap();
        let joes = catalog.venues.iter().find(|v| v.name == "Joe's Pizza").unwrap();
        assert_eq!(joes.verification["yelp"].status, "found");
        assert_eq!(joes.verification["yelp"].reviews, Some(120));
        assert_eq!(joes.verification["google"].status, "skip");
        assert_eq!(joes.coords(), Some((40.7308, -73.9973)));
        assert!(catalog.provider_stats.is_some());
    }

    #[test]
    fn test_backfill_skips_providers_without_details() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(test_config(dir.path()));

        let providers = vec![EchoProvider::boxed(Provider::OpenTable)];
        let filled = pipeline.backfill(&providers, 10).unwrap();

        assert!(filled.is_empty());
    }
}
