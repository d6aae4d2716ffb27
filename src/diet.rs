// 🥗 Diet Tagging - Certification listings and venue hints as ordered rules
//
// Rules run in priority order and the first rule to assert a tag owns it.
// Certification bodies come first, then registry cuisine, name keywords and
// provider categories.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::DietConfig;
use crate::geo::{GeoIndex, DEFAULT_CELL_DEG};
use crate::normalize::{name_similarity, normalize_address, normalize_borough, normalize_text};
use crate::providers::Provider;
use crate::venue::VenueRecord;

pub const HALAL: &str = "halal";
pub const KOSHER: &str = "kosher";
pub const VEGAN: &str = "vegan";
pub const VEGETARIAN: &str = "vegetarian";
pub const GLUTEN_FREE: &str = "gluten-free";

// ============================================================================
// LISTING ENTRIES
// ============================================================================

/// One certified establishment from an external listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DietEntry {
    pub name: String,

    /// May include city/state after the first comma
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub borough: String,

    #[serde(default)]
    pub lat: Option<f64>,

    #[serde(default)]
    pub lng: Option<f64>,

    #[serde(default)]
    pub source_id: String,
}

/// Load a JSON array of listing entries
pub fn load_entries(path: &Path) -> Result<Vec<DietEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read diet listing: {:?}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse diet listing: {:?}", path))
}

// ============================================================================
// RULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DietRule {
    /// HMS USA listing, by street address or name within the borough
    HalalCertified,
    /// KosherNearMe listing, by proximity or a unique exact name
    KosherCertified,
    /// Health registry cuisine description
    RegistryCuisine,
    /// Keywords in the venue name
    NameKeyword,
    /// Yelp category aliases
    ProviderCategory,
}

impl DietRule {
    /// Label recorded in `diet_src`
    pub fn source(&self) -> &'static str {
        match self {
            DietRule::HalalCertified => "HMS USA",
            DietRule::KosherCertified => "KosherNearMe",
            DietRule::RegistryCuisine => "DOHMH",
            DietRule::NameKeyword => "Name",
            DietRule::ProviderCategory => "Yelp",
        }
    }
}

/// Highest priority first
pub const DEFAULT_RULES: [DietRule; 5] = [
    DietRule::HalalCertified,
    DietRule::KosherCertified,
    DietRule::RegistryCuisine,
    DietRule::NameKeyword,
    DietRule::ProviderCategory,
];

const NAME_KEYWORDS: [&str; 4] = [HALAL, KOSHER, VEGAN, VEGETARIAN];

/// Yelp alias -> diet tag. Halal/kosher aliases are checked after these.
const CATEGORY_TAGS: [(&str, &str); 7] = [
    ("vegan", VEGAN),
    ("vegetarian", VEGETARIAN),
    ("veganraw", VEGAN),
    ("raw_food", VEGAN),
    ("gluten_free", GLUTEN_FREE),
    ("halal", HALAL),
    ("kosher", KOSHER),
];

// ============================================================================
// TAGGER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DietStats {
    /// tag -> venues
    pub counts: BTreeMap<String, usize>,
    /// tag -> source -> venues
    pub source_counts: BTreeMap<String, BTreeMap<String, usize>>,
    pub hms_matched: usize,
    pub knm_matched: usize,
}

pub struct DietTagger {
    rules: Vec<DietRule>,
    geo_radius_m: f64,
    min_similarity: f64,

    /// (normalized street, borough)
    halal_by_addr: HashMap<(String, String), usize>,
    /// (normalized name, borough)
    halal_by_name: HashMap<(String, String), usize>,

    kosher: Vec<DietEntry>,
    kosher_geo: GeoIndex<usize>,
    kosher_by_name: HashMap<String, Vec<usize>>,
}

impl DietTagger {
    pub fn new(config: &DietConfig, halal: &[DietEntry], kosher: Vec<DietEntry>) -> Self {
        let mut halal_by_addr = HashMap::new();
        let mut halal_by_name = HashMap::new();
        for (i, h) in halal.iter().enumerate() {
            let borough = normalize_borough(&h.borough);
            if borough.is_empty() {
                continue;
            }
            let street = h.address.split(',').next().unwrap_or_default();
            let addr = normalize_address(street);
            if !addr.is_empty() {
                halal_by_addr.insert((addr, borough.clone()), i);
            }
            let name = normalize_text(&h.name);
            if !name.is_empty() {
                halal_by_name.insert((name, borough), i);
            }
        }

        let mut kosher_geo = GeoIndex::new(DEFAULT_CELL_DEG);
        let mut kosher_by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, k) in kosher.iter().enumerate() {
            if let (Some(lat), Some(lng)) = (k.lat, k.lng) {
                if lat != 0.0 && lng != 0.0 {
                    kosher_geo.insert(lat, lng, i);
                }
            }
            let name = normalize_text(&k.name);
            if !name.is_empty() {
                kosher_by_name.entry(name).or_default().push(i);
            }
        }

        DietTagger {
            rules: DEFAULT_RULES.to_vec(),
            geo_radius_m: config.geo_radius_m,
            min_similarity: config.min_similarity,
            halal_by_addr,
            halal_by_name,
            kosher,
            kosher_geo,
            kosher_by_name,
        }
    }

    /// Replace the rule order (first writer wins)
    pub fn with_rules(mut self, rules: Vec<DietRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Stamp `diet` and `diet_src` on every venue
    pub fn tag(&self, venues: &mut [VenueRecord]) -> DietStats {
        let mut stats = DietStats::default();

        for v in venues.iter_mut() {
            let mut diets: BTreeMap<String, String> = BTreeMap::new();

            for rule in &self.rules {
                let tags = self.evaluate(*rule, v);
                if !tags.is_empty() {
                    match rule {
                        DietRule::HalalCertified => stats.hms_matched += 1,
                        DietRule::KosherCertified => stats.knm_matched += 1,
                        _ => {}
                    }
                }
                for tag in tags {
                    diets
                        .entry(tag.to_string())
                        .or_insert_with(|| rule.source().to_string());
                }
            }

            // vegan implies vegetarian
            if let Some(src) = diets.get(VEGAN).cloned() {
                diets.entry(VEGETARIAN.to_string()).or_insert(src);
            }

            for (tag, src) in &diets {
                *stats.counts.entry(tag.clone()).or_insert(0) += 1;
                *stats
                    .source_counts
                    .entry(tag.clone())
                    .or_default()
                    .entry(src.clone())
                    .or_insert(0) += 1;
            }

            v.diet = diets.keys().cloned().collect();
            v.diet_src = diets;
        }

        info!("Dietary tags: {:?}", stats.counts);
        info!("Diet source breakdown: {:?}", stats.source_counts);
        info!(
            "Authoritative matches: HMS={}, KNM={}",
            stats.hms_matched, stats.knm_matched
        );
        stats
    }

    /// Tags one rule asserts for a venue, in rule-local order
    fn evaluate(&self, rule: DietRule, v: &VenueRecord) -> Vec<&'static str> {
        match rule {
            DietRule::HalalCertified => {
                if self.match_halal(v).is_some() {
                    vec![HALAL]
                } else {
                    vec![]
                }
            }
            DietRule::KosherCertified => {
                if self.match_kosher(v).is_some() {
                    vec![KOSHER]
                } else {
                    vec![]
                }
            }
            DietRule::RegistryCuisine => cuisine_tags(&v.cuisine),
            DietRule::NameKeyword => {
                let name = v.name.to_lowercase();
                NAME_KEYWORDS
                    .iter()
                    .copied()
                    .filter(|k| name.contains(k))
                    .collect()
            }
            DietRule::ProviderCategory => {
                let categories = match v.verification.get(Provider::Yelp.as_str()) {
                    Some(stamp) => &stamp.categories,
                    None => return vec![],
                };
                CATEGORY_TAGS
                    .iter()
                    .filter(|(alias, _)| categories.iter().any(|c| c == alias))
                    .map(|(_, tag)| *tag)
                    .collect()
            }
        }
    }

    /// Street address first, then name, both within the venue's borough
    pub fn match_halal(&self, v: &VenueRecord) -> Option<usize> {
        let borough = normalize_borough(&v.borough);
        if borough.is_empty() {
            return None;
        }
        let addr = normalize_address(&v.address);
        if let Some(i) = self.halal_by_addr.get(&(addr, borough.clone())) {
            return Some(*i);
        }
        self.halal_by_name
            .get(&(normalize_text(&v.name), borough))
            .copied()
    }

    /// Closest similar listing within the radius, else a unique exact name
    pub fn match_kosher(&self, v: &VenueRecord) -> Option<&DietEntry> {
        let name = normalize_text(&v.name);

        if let Some((lat, lng)) = v.coords() {
            let mut best: Option<(f64, usize)> = None;
            for (d, &i) in self.kosher_geo.nearby(lat, lng, self.geo_radius_m) {
                if best.map_or(false, |(bd, _)| d >= bd) {
                    continue;
                }
                let sim = name_similarity(&name, &normalize_text(&self.kosher[i].name));
                if sim >= self.min_similarity {
                    best = Some((d, i));
                }
            }
            if let Some((_, i)) = best {
                return self.kosher.get(i);
            }
        }

        match self.kosher_by_name.get(&name).map(Vec::as_slice) {
            Some([only]) => self.kosher.get(*only),
            _ => None,
        }
    }
}

fn cuisine_tags(cuisine: &str) -> Vec<&'static str> {
    let mut tags = Vec::new();
    match cuisine {
        "Vegetarian" => tags.push(VEGETARIAN),
        "Vegan" => tags.push(VEGAN),
        _ => {}
    }
    let lower = cuisine.to_lowercase();
    if lower.contains(HALAL) {
        tags.push(HALAL);
    }
    if lower.contains(KOSHER) || cuisine == "Jewish/Kosher" {
        tags.push(KOSHER);
    }
    tags
}
