// 🧹 Enrichment - Corrections and ledger flags stamped onto merged venues
//
// Order matters: manual overrides, then the borough bbox filter, then ledger
// stamping (which may bring better coordinates back in).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::geo::borough_bounds;
use crate::ledger::{Status, VenueFlags};
use crate::normalize::{normalize_borough, venue_key};
use crate::providers::Provider;
use crate::venue::{ProviderStamp, VenueRecord};

/// Providers whose coordinates may replace a venue's, best first
const COORDINATE_PREFERENCE: [Provider; 2] = [Provider::Google, Provider::Yelp];

// ============================================================================
// MANUAL OVERRIDES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    /// Source coordinates are known to be wrong
    DropCoords,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub borough: String,
    pub action: OverrideAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    overrides: Vec<Override>,
}

/// Read the overrides file; Ok(None) when it does not exist
pub fn load_overrides(path: &Path) -> Result<Option<Vec<Override>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read overrides: {:?}", path))?;
    let file: OverrideFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse overrides: {:?}", path))?;
    Ok(Some(file.overrides))
}

fn override_key(name: &str, address: &str, borough: &str) -> (String, String, String) {
    (
        name.trim().to_lowercase(),
        address.trim().to_lowercase(),
        normalize_borough(borough),
    )
}

/// Apply `drop_coords` overrides by exact (name, address, borough).
/// Returns how many venues lost their coordinates.
pub fn apply_overrides(venues: &mut [VenueRecord], overrides: &[Override]) -> usize {
    let drop: HashSet<_> = overrides
        .iter()
        .filter(|o| o.action == OverrideAction::DropCoords)
        .map(|o| override_key(&o.name, &o.address, &o.borough))
        .collect();

    let mut applied = 0;
    for v in venues.iter_mut() {
        if v.lat.is_none() && v.lng.is_none() {
            continue;
        }
        if drop.contains(&override_key(&v.name, &v.address, &v.borough)) {
            v.clear_coords();
            applied += 1;
        }
    }

    info!("Overrides: applied {} from {} entries", applied, overrides.len());
    applied
}

// ============================================================================
// BOROUGH BBOX FILTER
// ============================================================================

/// Drop coordinates that fall outside the venue's borough box.
/// Unknown boroughs are left alone. Returns venues affected.
pub fn apply_bbox_filter(venues: &mut [VenueRecord]) -> usize {
    let mut dropped = 0;
    for v in venues.iter_mut() {
        let (lat, lng) = match v.coords() {
            Some(c) => c,
            None => continue,
        };
        let bounds = match borough_bounds(&v.borough) {
            Some(b) => b,
            None => continue,
        };
        if !bounds.contains(lat, lng) {
            debug!(
                "Bad coords for {} at {} ({}): {:.5},{:.5} outside borough bbox",
                v.name, v.address, v.borough, lat, lng
            );
            v.clear_coords();
            dropped += 1;
        }
    }

    info!("Dropped {} venues with coords outside their borough bbox", dropped);
    dropped
}

// ============================================================================
// LEDGER STAMPING
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StampStats {
    pub stamped: usize,
    pub coords_upgraded: usize,
}

/// Copy ledger flags onto venues and upgrade coordinates from the
/// preferred provider whose position falls inside the borough box.
pub fn stamp_verification(venues: &mut [VenueRecord], flags: &HashMap<String, VenueFlags>) -> StampStats {
    let mut stats = StampStats::default();

    for v in venues.iter_mut() {
        let f = match flags.get(&venue_key(&v.name, &v.address, &v.borough)) {
            Some(f) => f,
            None => continue,
        };

        for (provider, pf) in &f.providers {
            if pf.status == Status::Unchecked {
                continue;
            }
            v.verification.insert(
                provider.as_str().to_string(),
                ProviderStamp {
                    status: pf.status.as_str().to_string(),
                    url: pf.url.clone(),
                    rating: pf.rating,
                    reviews: pf.review_count,
                    categories: pf.categories.clone(),
                },
            );
        }

        if upgrade_coords(v, f) {
            stats.coords_upgraded += 1;
        }
        stats.stamped += 1;
    }

    info!(
        "Verification: stamped {} venues ({} coords upgraded)",
        stats.stamped, stats.coords_upgraded
    );
    stats
}

fn upgrade_coords(v: &mut VenueRecord, flags: &VenueFlags) -> bool {
    let bounds = borough_bounds(&v.borough);

    for provider in COORDINATE_PREFERENCE {
        let (lat, lng) = match flags.get(provider).and_then(|pf| pf.lat.zip(pf.lng)) {
            Some((lat, lng)) if lat != 0.0 && lng != 0.0 => (lat, lng),
            _ => continue,
        };
        match bounds {
            Some(b) if !b.contains(lat, lng) => {
                debug!(
                    "{} coords rejected for {} ({}): {:.5},{:.5} outside borough bbox",
                    provider, v.name, v.borough, lat, lng
                );
            }
            _ => {
                v.lat = Some(lat);
                v.lng = Some(lng);
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ProviderFlags;
    use crate::venue::SourceTag;

    fn venue(name: &str, address: &str, borough: &str, lat: f64, lng: f64) -> VenueRecord {
        VenueRecord::new(name, SourceTag::Dohmh).at(address, borough).with_coords(lat, lng)
    }

    fn flags_with(entries: &[(Provider, ProviderFlags)]) -> VenueFlags {
        VenueFlags {
            providers: entries.iter().cloned().collect(),
        }
    }

    #[test]
    fn test_overrides_drop_coords_by_exact_key() {
        let mut venues = vec![
            venue("Joe's Pizza", "7 Carmine St", "Manhattan", 40.73, -74.00),
            venue("Joe's Pizza", "1435 Broadway", "Manhattan", 40.75, -73.98),
        ];
        let overrides = vec![Override {
            name: "  JOE'S PIZZA ".to_string(),
            address: "7 carmine st".to_string(),
            borough: "NY".to_string(),
            action: OverrideAction::DropCoords,
            note: None,
        }];

        assert_eq!(apply_overrides(&mut venues, &overrides), 1);
        assert_eq!(venues[0].coords(), None);
        assert!(venues[1].coords().is_some());
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        assert_eq!(load_overrides(&path).unwrap(), None);

        fs::write(
            &path,
            r#"{"overrides": [
                {"name": "A", "address": "1 Main St", "borough": "Queens", "action": "drop_coords"},
                {"name": "B", "address": "2 Main St", "action": "rename"}
            ]}"#,
        )
        .unwrap();

        let overrides = load_overrides(&path).unwrap().unwrap();
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides[0].action, OverrideAction::DropCoords);
        assert_eq!(overrides[1].action, OverrideAction::Unsupported);
    }

    #[test]
    fn test_bbox_filter() {
        let mut venues = vec![
            // Manhattan venue placed in Brooklyn
            venue("Misplaced", "1 Broadway", "Manhattan", 40.6782, -73.9442),
            venue("Fine", "1 Broadway", "Manhattan", 40.7128, -74.0060),
            venue("Unknown Borough", "1 Main", "Hoboken", 40.7440, -74.0324),
        ];

        assert_eq!(apply_bbox_filter(&mut venues), 1);
        assert_eq!(venues[0].coords(), None);
        assert!(venues[1].coords().is_some());
        assert!(venues[2].coords().is_some());
    }

    #[test]
    fn test_stamp_prefers_google_inside_bbox() {
        let v = venue("Katz's", "205 E Houston St", "Manhattan", 40.70, -74.01);
        let key = venue_key(&v.name, &v.address, &v.borough);

        let google = ProviderFlags {
            status: Status::Found,
            lat: Some(40.7223),
            lng: Some(-73.9874),
            rating: Some(4.5),
            review_count: Some(30211),
            ..ProviderFlags::default()
        };
        let yelp = ProviderFlags {
            status: Status::Found,
            lat: Some(40.7222),
            lng: Some(-73.9873),
            categories: vec!["delis".to_string(), "kosher".to_string()],
            ..ProviderFlags::default()
        };
        let flags: HashMap<_, _> = [(key, flags_with(&[(Provider::Google, google), (Provider::Yelp, yelp)]))].into();

        let mut venues = vec![v];
        let stats = stamp_verification(&mut venues, &flags);

        assert_eq!(stats, StampStats { stamped: 1, coords_upgraded: 1 });
        assert_eq!(venues[0].coords(), Some((40.7223, -73.9874)));
        assert_eq!(venues[0].verification["google"].reviews, Some(30211));
        assert_eq!(venues[0].verification["yelp"].categories, vec!["delis", "kosher"]);
        assert!(!venues[0].verification.contains_key("opentable"));
    }

    #[test]
    fn test_stamp_falls_back_to_yelp_when_google_outside_bbox() {
        let v = venue("Katz's", "205 E Houston St", "Manhattan", 40.72, -73.98);
        let key = venue_key(&v.name, &v.address, &v.borough);
        let google = ProviderFlags {
            status: Status::Found,
            lat: Some(40.6782),
            lng: Some(-73.9442),
            ..ProviderFlags::default()
        };
        let yelp = ProviderFlags {
            status: Status::Found,
            lat: Some(40.7222),
            lng: Some(-73.9873),
            ..ProviderFlags::default()
        };
        let flags: HashMap<_, _> = [(key, flags_with(&[(Provider::Google, google), (Provider::Yelp, yelp)]))].into();

        let mut venues = vec![v];
        stamp_verification(&mut venues, &flags);

        assert_eq!(venues[0].coords(), Some((40.7222, -73.9873)));
    }

    #[test]
    fn test_stamp_without_ledger_row_is_noop() {
        let mut venues = vec![venue("Nobody", "1 Nowhere", "Queens", 40.7, -73.8)];
        let before = venues.clone();

        let stats = stamp_verification(&mut venues, &HashMap::new());

        assert_eq!(stats, StampStats::default());
        assert_eq!(venues, before);
    }
}
