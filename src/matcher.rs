// 🔍 Merge Engine - Cross-source venue deduplication
// Three passes over health-registry (Authority) and liquor-license (License)
// records: Exact Address, Address Range, Geo Proximity.
//
// The Authority record is the base of every merge (it carries grade,
// cuisine, phone); License tags and meta are folded in.

use crate::geo::{GeoIndex, DEFAULT_CELL_DEG};
use crate::normalize::{name_similarity, normalize_address, normalize_borough, normalize_text};
use crate::venue::{SourceTag, VenueRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

// ============================================================================
// MATCH STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// Pass 1: same normalized address and borough
    ExactAddress,

    /// Pass 2: license range "77 79 HUDSON ST" covers the authority number
    AddressRange,

    /// Pass 3: closest authority within the radius, names similar enough
    GeoProximity,
}

// ============================================================================
// MATCH RESULT
// ============================================================================

/// One accepted Authority/License pair, by index into the input list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMatch {
    pub authority: usize,
    pub license: usize,
    pub strategy: MatchStrategy,

    /// Pass 3 only
    pub distance_m: Option<f64>,
}

/// Per-run merge counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub pre_merge: usize,
    pub pass1: usize,
    pub pass2: usize,
    pub pass3: usize,
    pub total_merges: usize,
    pub post_merge: usize,
}

/// Parsed license address range
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRange {
    pub low: u32,
    pub high: u32,
    pub street: String,
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergeEngine {
    /// Max distance for a geo merge in meters (default: 30)
    pub geo_radius_m: f64,

    /// Grid cell size in degrees (default: 0.0003 ≈ 33 m)
    pub geo_cell_deg: f64,

    /// Name similarity gate for geo merges (default: Some(0.35); None disables)
    pub geo_min_similarity: Option<f64>,

    /// Widest plausible address range (default: 30)
    pub max_range_span: u32,
}

impl MergeEngine {
    /// Create engine with default thresholds
    pub fn new() -> Self {
        MergeEngine {
            geo_radius_m: 30.0,
            geo_cell_deg: DEFAULT_CELL_DEG,
            geo_min_similarity: Some(0.35),
            max_range_span: 30,
        }
    }

    /// Merge records seen by both registries into `source = both`.
    ///
    /// Every input shows up exactly once in the output: standalone, or
    /// absorbed into one combined record. Output keeps input order, with a
    /// combined record taking its Authority's position.
    pub fn merge(&self, records: Vec<VenueRecord>) -> (Vec<VenueRecord>, MergeStats) {
        let matches = self.find_matches(&records);

        let mut stats = MergeStats {
            pre_merge: records.len(),
            ..MergeStats::default()
        };
        for m in &matches {
            match m.strategy {
                MatchStrategy::ExactAddress => stats.pass1 += 1,
                MatchStrategy::AddressRange => stats.pass2 += 1,
                MatchStrategy::GeoProximity => stats.pass3 += 1,
            }
        }
        stats.total_merges = matches.len();

        let partner: HashMap<usize, usize> = matches.iter().map(|m| (m.authority, m.license)).collect();
        let absorbed: HashSet<usize> = matches.iter().map(|m| m.license).collect();

        let mut merged = Vec::with_capacity(records.len() - matches.len());
        for (i, record) in records.iter().enumerate() {
            if absorbed.contains(&i) {
                continue;
            }
            match partner.get(&i) {
                Some(&license) => merged.push(combine(record, &records[license])),
                None => merged.push(record.clone()),
            }
        }

        stats.post_merge = merged.len();
        info!(
            pre = stats.pre_merge,
            post = stats.post_merge,
            merges = stats.total_merges,
            "Cross-source merge complete"
        );

        (merged, stats)
    }

    /// Run the three passes and return accepted pairs.
    /// Later passes only see what earlier passes left unmatched.
    pub fn find_matches(&self, records: &[VenueRecord]) -> Vec<MergeMatch> {
        let mut matches = Vec::new();

        let (unmatched_auth, unmatched_lic) = self.exact_pass(records, &mut matches);
        info!("  Pass 1 (exact address): {} merges", matches.len());

        let before = matches.len();
        let (still_auth, still_lic) = self.range_pass(records, unmatched_auth, unmatched_lic, &mut matches);
        info!("  Pass 2 (address range): {} merges", matches.len() - before);

        let before = matches.len();
        self.geo_pass(records, &still_auth, &still_lic, &mut matches);
        info!("  Pass 3 (geo ≤{}m): {} merges", self.geo_radius_m, matches.len() - before);

        matches
    }

    /// Pass 1: bucket by (normalized address, normalized borough).
    ///
    /// The first Authority/License pair of a bucket merges; other bucket
    /// members stay standalone and take no part in later passes.
    fn exact_pass(&self, records: &[VenueRecord], matches: &mut Vec<MergeMatch>) -> (Vec<usize>, Vec<usize>) {
        let mut bucket_order: Vec<(String, String)> = Vec::new();
        let mut buckets: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let mut unmatched_auth = Vec::new();
        let mut unmatched_lic = Vec::new();

        for (i, v) in records.iter().enumerate() {
            if !is_mergeable(&v.source) {
                continue;
            }
            let addr = normalize_address(&v.address);
            if addr.is_empty() {
                // Nothing to bucket on; still a candidate for later passes
                push_side(v, i, &mut unmatched_auth, &mut unmatched_lic);
                continue;
            }
            let key = (addr, normalize_borough(&v.borough));
            if !buckets.contains_key(&key) {
                bucket_order.push(key.clone());
            }
            buckets.entry(key).or_default().push(i);
        }

        for key in &bucket_order {
            let group = &buckets[key];
            let authority = group.iter().copied().find(|&i| records[i].source.is_authority());
            let license = group.iter().copied().find(|&i| records[i].source.is_license());

            match (authority, license) {
                (Some(a), Some(l)) => {
                    debug!("Exact match: {:?} ↔ {:?} at {}", records[a].name, records[l].name, key.0);
                    matches.push(MergeMatch {
                        authority: a,
                        license: l,
                        strategy: MatchStrategy::ExactAddress,
                        distance_m: None,
                    });
                }
                _ => {
                    for &i in group {
                        push_side(&records[i], i, &mut unmatched_auth, &mut unmatched_lic);
                    }
                }
            }
        }

        unmatched_auth.sort_unstable();
        unmatched_lic.sort_unstable();
        (unmatched_auth, unmatched_lic)
    }

    /// Pass 2: License ranges against Authority house numbers on the same
    /// street and borough. First unclaimed candidate wins.
    fn range_pass(
        &self,
        records: &[VenueRecord],
        unmatched_auth: Vec<usize>,
        unmatched_lic: Vec<usize>,
        matches: &mut Vec<MergeMatch>,
    ) -> (Vec<usize>, Vec<usize>) {
        let mut by_street: HashMap<(String, String), Vec<(u32, usize)>> = HashMap::new();
        for &i in &unmatched_auth {
            let normed = normalize_address(&records[i].address);
            if let Some((number, street)) = parse_house_number(&normed) {
                let boro = normalize_borough(&records[i].borough);
                by_street.entry((street.to_string(), boro)).or_default().push((number, i));
            }
        }

        let mut claimed_auth: HashSet<usize> = HashSet::new();
        let mut claimed_lic: HashSet<usize> = HashSet::new();

        for &l in &unmatched_lic {
            let range = match parse_range(&records[l].address, self.max_range_span) {
                Some(r) => r,
                None => continue,
            };
            let boro = normalize_borough(&records[l].borough);
            let candidates = match by_street.get(&(range.street.clone(), boro)) {
                Some(c) => c,
                None => continue,
            };

            let hit = candidates
                .iter()
                .find(|(number, a)| range.low <= *number && *number <= range.high && !claimed_auth.contains(a));

            if let Some(&(number, a)) = hit {
                debug!(
                    "Range match: {:?} [{}-{} {}] ↔ {:?} at {}",
                    records[l].name, range.low, range.high, range.street, records[a].name, number
                );
                claimed_auth.insert(a);
                claimed_lic.insert(l);
                matches.push(MergeMatch {
                    authority: a,
                    license: l,
                    strategy: MatchStrategy::AddressRange,
                    distance_m: None,
                });
            }
        }

        (
            unmatched_auth.into_iter().filter(|i| !claimed_auth.contains(i)).collect(),
            unmatched_lic.into_iter().filter(|i| !claimed_lic.contains(i)).collect(),
        )
    }

    /// Pass 3: closest unclaimed Authority within the radius whose name is
    /// similar enough. Records without coordinates sit this pass out.
    fn geo_pass(&self, records: &[VenueRecord], auth: &[usize], lic: &[usize], matches: &mut Vec<MergeMatch>) {
        let mut grid: GeoIndex<usize> = GeoIndex::new(self.geo_cell_deg);
        for &a in auth {
            if let Some((lat, lng)) = records[a].coords() {
                grid.insert(lat, lng, a);
            }
        }
        if grid.is_empty() {
            return;
        }

        let mut claimed: HashSet<usize> = HashSet::new();

        for &l in lic {
            let (lat, lng) = match records[l].coords() {
                Some(c) => c,
                None => continue,
            };
            let license_name = normalize_text(&records[l].name);

            let mut best: Option<(f64, usize)> = None;
            for (dist, &a) in grid.nearby(lat, lng, self.geo_radius_m) {
                if claimed.contains(&a) {
                    continue;
                }
                if best.map(|(d, _)| dist >= d).unwrap_or(false) {
                    continue;
                }
                if let Some(min) = self.geo_min_similarity {
                    let authority_name = normalize_text(&records[a].name);
                    if name_similarity(&license_name, &authority_name) < min {
                        continue;
                    }
                }
                best = Some((dist, a));
            }

            if let Some((dist, a)) = best {
                debug!("Geo match: {:?} ↔ {:?} ({:.1}m)", records[l].name, records[a].name, dist);
                claimed.insert(a);
                matches.push(MergeMatch {
                    authority: a,
                    license: l,
                    strategy: MatchStrategy::GeoProximity,
                    distance_m: Some(dist),
                });
            }
        }
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_mergeable(source: &SourceTag) -> bool {
    source.is_authority() || source.is_license()
}

fn push_side(v: &VenueRecord, i: usize, auth: &mut Vec<usize>, lic: &mut Vec<usize>) {
    if v.source.is_authority() {
        auth.push(i);
    } else if v.source.is_license() {
        lic.push(i);
    }
}

// ============================================================================
// COMBINATION
// ============================================================================

/// Fold a License record into its Authority counterpart
pub fn combine(authority: &VenueRecord, license: &VenueRecord) -> VenueRecord {
    let mut combined = authority.clone();
    combined.source = SourceTag::Both;
    combined.license_name = Some(license.name.clone());

    for tag in &license.tags {
        if !combined.tags.contains(tag) {
            combined.tags.push(tag.clone());
        }
    }

    for (k, v) in &license.meta {
        combined.meta.insert(k.clone(), v.clone());
    }

    // Earliest opening date wins (ISO dates compare lexically)
    combined.opened = match (authority.opened.is_empty(), license.opened.is_empty()) {
        (false, false) => authority.opened.clone().min(license.opened.clone()),
        (true, false) => license.opened.clone(),
        _ => authority.opened.clone(),
    };

    combined
}

// ============================================================================
// ADDRESS PARSING
// ============================================================================

/// "30-12 20TH AVE": Queens block-lot, never a range
fn is_block_lot(raw: &str) -> bool {
    let mut chars = raw.trim().chars().peekable();
    let mut lead = 0;
    while chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        chars.next();
        lead += 1;
    }
    lead > 0 && chars.next() == Some('-') && chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

/// Parse "77 79 HUDSON ST" → 77..=79 on "hudson street".
///
/// None for block-lot addresses, single numbers, reversed ranges and
/// ranges wider than `max_span`.
pub fn parse_range(raw: &str, max_span: u32) -> Option<AddressRange> {
    if is_block_lot(raw) {
        return None;
    }

    let normed = normalize_address(raw);
    let mut parts = normed.splitn(3, ' ');
    let low: u32 = parts.next()?.parse().ok()?;
    let high: u32 = parts.next()?.parse().ok()?;
    let street = parts.next()?.trim();

    if street.is_empty() || high < low || high - low > max_span {
        return None;
    }

    Some(AddressRange {
        low,
        high,
        street: street.to_string(),
    })
}

/// Parse "77 hudson street" → (77, "hudson street")
pub fn parse_house_number(normed: &str) -> Option<(u32, &str)> {
    let (number, street) = normed.split_once(' ')?;
    let number: u32 = number.parse().ok()?;
    let street = street.trim();
    if street.is_empty() {
        return None;
    }
    Some((number, street))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{lat_offset, lng_offset};

    fn authority(name: &str, address: &str, borough: &str) -> VenueRecord {
        VenueRecord::new(name, SourceTag::Dohmh).at(address, borough)
    }

    fn license(name: &str, address: &str, borough: &str) -> VenueRecord {
        VenueRecord::new(name, SourceTag::Sla).at(address, borough)
    }

    #[test]
    fn test_end_to_end_three_records() {
        let engine = MergeEngine::new();
        let records = vec![
            authority("Joe's Pizza", "123 Main St", "Manhattan"),
            license("Joes Pizza Inc", "123 MAIN STREET", "Manhattan"),
            authority("Tea House", "999 Broadway", "Manhattan"),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.iter().filter(|v| v.source == SourceTag::Both).count(), 1);
        assert_eq!(stats.pass1, 1);
        assert_eq!(stats.pre_merge, 3);
        assert_eq!(stats.post_merge, 2);
        assert_eq!(merged[0].license_name.as_deref(), Some("Joes Pizza Inc"));
    }

    #[test]
    fn test_exact_match_borough_alias() {
        let engine = MergeEngine::new();
        let records = vec![
            license("Dead Rabbit", "30 WATER ST", "NY"),
            authority("The Dead Rabbit", "30 Water Street", "MANHATTAN"),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, SourceTag::Both);
        assert_eq!(merged[0].name, "The Dead Rabbit");
        assert_eq!(stats.pass1, 1);
    }

    #[test]
    fn test_extra_bucket_members_pass_through() {
        let engine = MergeEngine::new();
        let records = vec![
            authority("A1", "1 Main St", "Brooklyn"),
            authority("A2", "1 Main St", "Brooklyn"),
            license("L1", "1 MAIN ST", "Brooklyn"),
            license("L2", "1 MAIN ST", "Brooklyn"),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(stats.total_merges, 1);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].name, "A1");
        assert_eq!(merged[0].license_name.as_deref(), Some("L1"));
    }

    #[test]
    fn test_non_mergeable_sources_untouched() {
        let engine = MergeEngine::new();
        let records = vec![
            VenueRecord::new("Union Square Greenmarket", SourceTag::Greenmarket).at("1 Union Sq", "Manhattan"),
            license("Bar", "1 Union Sq", "Manhattan"),
        ];

        let (merged, stats) = engine.merge(records.clone());

        assert_eq!(stats.total_merges, 0);
        assert_eq!(merged, records);
    }

    #[test]
    fn test_no_merge_when_far_apart() {
        let engine = MergeEngine::new();
        let records = vec![
            authority("Joe's Pizza", "7 Carmine St", "Manhattan").with_coords(40.7306, -74.0021),
            license("Joe's Pizza", "150 E 14th St", "Manhattan").with_coords(40.7339, -73.9880),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(merged.len(), 2);
        assert_eq!(stats.total_merges, 0);
    }

    #[test]
    fn test_range_match_boundaries() {
        let engine = MergeEngine::new();

        for (number, expect) in [(10, true), (15, true), (20, true), (21, false), (9, false)] {
            let records = vec![
                authority("Diner", &format!("{} Main Street", number), "Queens"),
                license("Diner LLC", "10 20 MAIN ST", "Queens"),
            ];
            let (_, stats) = engine.merge(records);
            assert_eq!(stats.pass2 == 1, expect, "house number {}", number);
        }
    }

    #[test]
    fn test_range_match_requires_same_borough() {
        let engine = MergeEngine::new();
        let records = vec![
            authority("Diner", "15 Main Street", "Queens"),
            license("Diner LLC", "10 20 MAIN ST", "Brooklyn"),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(stats.pass2, 0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_range_claims_each_authority_once() {
        let engine = MergeEngine::new();
        let records = vec![
            authority("Cafe", "78 Hudson St", "Manhattan"),
            license("Cafe One", "77 79 HUDSON ST", "Manhattan"),
            license("Cafe Two", "76 80 HUDSON ST", "Manhattan"),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(stats.pass2, 1);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].license_name.as_deref(), Some("Cafe One"));
    }

    #[test]
    fn test_parse_range_rejections() {
        assert_eq!(
            parse_range("77 79 HUDSON ST", 30),
            Some(AddressRange { low: 77, high: 79, street: "hudson street".to_string() })
        );
        assert_eq!(parse_range("30-12 20TH AVE", 30), None);
        assert_eq!(parse_range("79 77 HUDSON ST", 30), None);
        assert_eq!(parse_range("1 99 HUDSON ST", 30), None);
        assert_eq!(parse_range("77 HUDSON ST", 30), None);
        assert_eq!(parse_range("", 30), None);
    }

    #[test]
    fn test_parse_house_number() {
        assert_eq!(parse_house_number("77 hudson street"), Some((77, "hudson street")));
        assert_eq!(parse_house_number("hudson street"), None);
        assert_eq!(parse_house_number("77"), None);
    }

    #[test]
    fn test_geo_boundary() {
        let engine = MergeEngine::new();
        let (lat, lng) = (40.7412, -73.9897);

        let near = vec![
            authority("Shake Shack", "Madison Sq Park", "Manhattan").with_coords(lat, lng),
            license("Shake Shack Madison", "11 Madison Ave", "Manhattan").with_coords(lat + lat_offset(29.0), lng),
        ];
        let (_, stats) = engine.merge(near);
        assert_eq!(stats.pass3, 1);

        let far = vec![
            authority("Shake Shack", "Madison Sq Park", "Manhattan").with_coords(lat, lng),
            license("Shake Shack Madison", "11 Madison Ave", "Manhattan").with_coords(lat + lat_offset(31.0), lng),
        ];
        let (merged, stats) = engine.merge(far);
        assert_eq!(stats.pass3, 0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_geo_boundary_east_west() {
        // Longitude cells are narrower than the radius at this latitude
        let engine = MergeEngine::new();
        let (lat, lng) = (40.75, -73.98992);

        let near = vec![
            authority("Joe's Pizza", "7 Carmine St", "Manhattan").with_coords(lat, lng + lng_offset(lat, 29.0)),
            license("Joe's Pizza", "1435 Broadway", "Manhattan").with_coords(lat, lng),
        ];
        let (merged, stats) = engine.merge(near);
        assert_eq!(stats.pass3, 1);
        assert_eq!(merged.len(), 1);

        let far = vec![
            authority("Joe's Pizza", "7 Carmine St", "Manhattan").with_coords(lat, lng + lng_offset(lat, 31.0)),
            license("Joe's Pizza", "1435 Broadway", "Manhattan").with_coords(lat, lng),
        ];
        let (_, stats) = engine.merge(far);
        assert_eq!(stats.pass3, 0);
    }

    #[test]
    fn test_geo_rejects_dissimilar_names() {
        let engine = MergeEngine::new();
        let (lat, lng) = (40.7412, -73.9897);
        let records = vec![
            authority("Tea House", "1 Broadway", "Manhattan").with_coords(lat, lng),
            license("Burger Joint", "3 Broadway", "Manhattan").with_coords(lat + lat_offset(10.0), lng),
        ];

        let (merged, stats) = engine.merge(records);

        assert_eq!(stats.pass3, 0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_geo_gate_can_be_disabled() {
        let engine = MergeEngine {
            geo_min_similarity: None,
            ..MergeEngine::new()
        };
        let (lat, lng) = (40.7412, -73.9897);
        let records = vec![
            authority("Tea House", "1 Broadway", "Manhattan").with_coords(lat, lng),
            license("Burger Joint", "3 Broadway", "Manhattan").with_coords(lat + lat_offset(10.0), lng),
        ];

        let (_, stats) = engine.merge(records);
        assert_eq!(stats.pass3, 1);
    }

    #[test]
    fn test_geo_picks_closest_candidate() {
        let engine = MergeEngine::new();
        let (lat, lng) = (40.7412, -73.9897);
        let records = vec![
            authority("Pizza Place", "1 A St", "Manhattan").with_coords(lat + lat_offset(20.0), lng),
            authority("Pizza Place", "2 B St", "Manhattan").with_coords(lat + lat_offset(5.0), lng),
            license("Pizza Place Corp", "3 C St", "Manhattan").with_coords(lat, lng),
        ];

        let matches = engine.find_matches(&records);

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].authority, 1);
        assert_eq!(matches[0].strategy, MatchStrategy::GeoProximity);
    }

    #[test]
    fn test_combine_unions_tags_and_meta() {
        let mut a = authority("Joe's", "1 Main St", "Manhattan").with_tag("restaurant").with_tag("pizza");
        a.meta.insert("grade".to_string(), serde_json::json!("A"));
        a.meta.insert("shared".to_string(), serde_json::json!("authority"));
        a.opened = "2015-03-01".to_string();

        let mut l = license("Joe's Inc", "1 Main St", "Manhattan").with_tag("bar").with_tag("pizza");
        l.meta.insert("shared".to_string(), serde_json::json!("license"));
        l.opened = "2012-06-15".to_string();

        let c = combine(&a, &l);

        assert_eq!(c.source, SourceTag::Both);
        assert_eq!(c.tags, vec!["restaurant", "pizza", "bar"]);
        assert_eq!(c.meta["shared"], serde_json::json!("license"));
        assert_eq!(c.meta["grade"], serde_json::json!("A"));
        assert_eq!(c.opened, "2012-06-15");

        let mut l2 = l.clone();
        l2.opened.clear();
        assert_eq!(combine(&a, &l2).opened, "2015-03-01");
    }

    #[test]
    fn test_every_input_appears_once() {
        let engine = MergeEngine::new();
        let records = vec![
            authority("A", "1 Main St", "Queens"),
            license("B", "1 Main St", "Queens"),
            authority("C", "15 Elm St", "Queens"),
            license("D", "10 20 ELM ST", "Queens"),
            license("E", "", "Queens"),
            VenueRecord::new("F", SourceTag::Dpr),
        ];

        let (merged, stats) = engine.merge(records);

        let absorbed: usize = merged.iter().filter(|v| v.source == SourceTag::Both).count();
        assert_eq!(merged.len() + absorbed, 6);
        assert_eq!(stats.pre_merge - stats.total_merges, stats.post_merge);
    }
}
