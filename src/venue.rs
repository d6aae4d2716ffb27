// 🏪 Venue Records - One business observation from one source
// Core fields are fixed, `meta` can grow without breaking the schema

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

// ============================================================================
// SOURCE TAG
// ============================================================================

/// Origin of a record. Only `Dohmh` (health registry, the Authority) and
/// `Sla` (liquor licenses, the License) take part in merging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceTag {
    Dohmh,
    Sla,
    Dpr,
    Greenmarket,
    Grocery,
    /// Produced only by the merge engine
    Both,
    Other(String),
}

impl SourceTag {
    pub fn as_str(&self) -> &str {
        match self {
            SourceTag::Dohmh => "dohmh",
            SourceTag::Sla => "sla",
            SourceTag::Dpr => "dpr",
            SourceTag::Greenmarket => "greenmarket",
            SourceTag::Grocery => "grocery",
            SourceTag::Both => "both",
            SourceTag::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "dohmh" => SourceTag::Dohmh,
            "sla" => SourceTag::Sla,
            "dpr" => SourceTag::Dpr,
            "greenmarket" => SourceTag::Greenmarket,
            "grocery" => SourceTag::Grocery,
            "both" => SourceTag::Both,
            other => SourceTag::Other(other.to_string()),
        }
    }

    pub fn is_authority(&self) -> bool {
        *self == SourceTag::Dohmh
    }

    pub fn is_license(&self) -> bool {
        *self == SourceTag::Sla
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SourceTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SourceTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(SourceTag::parse(&s))
    }
}

// ============================================================================
// VENUE RECORD
// ============================================================================

/// A single venue (restaurant, bar, market, store).
///
/// Optional text fields serialize only when non-empty to keep the
/// catalog compact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    pub name: String,
    pub source: SourceTag,

    // ========================================================================
    // LOCATION
    // ========================================================================
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub borough: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,

    // ========================================================================
    // DESCRIPTIVE
    // ========================================================================
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cuisine: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phone: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub grade: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zipcode: String,

    /// Earliest known opening date (YYYY-MM-DD)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub opened: String,

    /// Display order is insertion order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,

    /// Name carried over from the license record of a combined venue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_name: Option<String>,

    // ========================================================================
    // ENRICHMENT (stamped before output)
    // ========================================================================
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verification: BTreeMap<String, ProviderStamp>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diet: Vec<String>,

    /// diet tag -> which source asserted it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub diet_src: BTreeMap<String, String>,
}

/// What one verification provider said about a venue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStamp {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviews: Option<i64>,

    /// Provider category aliases; feeds diet tagging, never written out
    #[serde(skip)]
    pub categories: Vec<String>,
}

impl VenueRecord {
    /// Create a record with only the required fields set
    pub fn new(name: &str, source: SourceTag) -> Self {
        VenueRecord {
            name: name.to_string(),
            source,
            address: String::new(),
            borough: String::new(),
            lat: None,
            lng: None,
            cuisine: String::new(),
            phone: String::new(),
            grade: String::new(),
            zipcode: String::new(),
            opened: String::new(),
            tags: Vec::new(),
            meta: BTreeMap::new(),
            license_name: None,
            verification: BTreeMap::new(),
            diet: Vec::new(),
            diet_src: BTreeMap::new(),
        }
    }

    /// Builder pattern: set address and borough
    pub fn at(mut self, address: &str, borough: &str) -> Self {
        self.address = address.to_string();
        self.borough = borough.to_string();
        self
    }

    /// Builder pattern: set coordinates
    pub fn with_coords(mut self, lat: f64, lng: f64) -> Self {
        self.lat = Some(lat);
        self.lng = Some(lng);
        self
    }

    /// Builder pattern: append a tag
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Both coordinates present, finite and non-zero
    pub fn coords(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng))
                if lat.is_finite() && lng.is_finite() && lat != 0.0 && lng != 0.0 =>
            {
                Some((lat, lng))
            }
            _ => None,
        }
    }

    pub fn clear_coords(&mut self) {
        self.lat = None;
        self.lng = None;
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Load a JSON array of venue records
pub fn load_json(path: &Path) -> Result<Vec<VenueRecord>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read venue file: {:?}", path))?;
    let venues: Vec<VenueRecord> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse venue JSON: {:?}", path))?;
    Ok(venues.into_iter().filter(|v| !v.name.trim().is_empty()).collect())
}

/// Flat CSV row; tags are `;`-separated
#[derive(Debug, Deserialize)]
struct CsvVenue {
    name: String,
    source: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    borough: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(default)]
    cuisine: String,
    #[serde(default)]
    tags: String,
}

/// Load venue records from a CSV export
pub fn load_csv(path: &Path) -> Result<Vec<VenueRecord>> {
    let mut rdr = csv::Reader::from_path(path).context("Failed to open CSV file")?;

    let mut venues = Vec::new();
    for result in rdr.deserialize() {
        let row: CsvVenue = result.context("Failed to deserialize venue")?;
        if row.name.trim().is_empty() {
            continue;
        }
        let mut venue = VenueRecord::new(&row.name, SourceTag::parse(&row.source))
            .at(&row.address, &row.borough);
        venue.lat = row.lat;
        venue.lng = row.lng;
        venue.cuisine = row.cuisine;
        venue.tags = row
            .tags
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        venues.push(venue);
    }

    Ok(venues)
}

/// Pick the loader by file extension
pub fn load_venues(path: &Path) -> Result<Vec<VenueRecord>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => load_csv(path),
        _ => load_json(path),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_source_tag_roundtrip_names() {
        assert_eq!(SourceTag::parse("DOHMH"), SourceTag::Dohmh);
        assert_eq!(SourceTag::parse("sla"), SourceTag::Sla);
        assert_eq!(SourceTag::parse("both").as_str(), "both");
        assert_eq!(SourceTag::parse("osm"), SourceTag::Other("osm".to_string()));
        assert!(SourceTag::Dohmh.is_authority());
        assert!(SourceTag::Sla.is_license());
        assert!(!SourceTag::Both.is_license());
    }

    #[test]
    fn test_json_skips_empty_optional_fields() {
        let v = VenueRecord::new("Joe's Pizza", SourceTag::Dohmh).at("7 Carmine St", "Manhattan");
        let json = serde_json::to_value(&v).unwrap();

        assert_eq!(json["source"], "dohmh");
        assert!(json.get("lat").is_none());
        assert!(json.get("tags").is_none());
        assert!(json.get("license_name").is_none());
    }

    #[test]
    fn test_coords_rejects_zero_and_missing() {
        let mut v = VenueRecord::new("X", SourceTag::Sla);
        assert_eq!(v.coords(), None);

        v.lat = Some(0.0);
        v.lng = Some(0.0);
        assert_eq!(v.coords(), None);

        v = v.with_coords(40.73, -74.0);
        assert_eq!(v.coords(), Some((40.73, -74.0)));
    }

    #[test]
    fn test_load_json_drops_nameless_records() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"Tea House","source":"dohmh","address":"999 Broadway"}},{{"name":"  ","source":"sla"}}]"#
        )
        .unwrap();

        let venues = load_json(file.path()).unwrap();
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].address, "999 Broadway");
    }

    #[test]
    fn test_load_csv_splits_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("venues.csv");
        fs::write(
            &path,
            "name,source,address,borough,lat,lng,cuisine,tags\n\
             Dead Rabbit,sla,30 WATER ST,MANHATTAN,40.7033,-74.0111,,bar; liquor\n",
        )
        .unwrap();

        let venues = load_venues(&path).unwrap();
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].source, SourceTag::Sla);
        assert_eq!(venues[0].tags, vec!["bar", "liquor"]);
        assert_eq!(venues[0].coords(), Some((40.7033, -74.0111)));
    }
}
