// 🗺️ Geo Index - Coarse spatial grid for neighbor lookups
//
// Buckets points into square-degree cells (default 0.0003°: ~33 m tall, ~25 m
// wide at NYC's latitude). A lookup scans as many rings of cells as the search
// radius needs on each axis instead of every point.

use crate::normalize::normalize_borough;
use std::collections::HashMap;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default grid cell size in degrees (~33 m of latitude)
pub const DEFAULT_CELL_DEG: f64 = 0.0003;

/// Meters per degree of latitude
const METERS_PER_DEG: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Ring cap near the poles, where a degree of longitude shrinks to nothing
const MAX_RINGS: i64 = 1_000;

/// Great-circle distance in meters between two (lat, lng) points in degrees
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let p = std::f64::consts::PI / 180.0;
    let a = 0.5 - ((lat2 - lat1) * p).cos() / 2.0
        + (lat1 * p).cos() * (lat2 * p).cos() * (1.0 - ((lng2 - lng1) * p).cos()) / 2.0;
    2.0 * EARTH_RADIUS_M * a.clamp(0.0, 1.0).sqrt().asin()
}

// ============================================================================
// GRID
// ============================================================================

pub type Cell = (i64, i64);

/// Spatial grid over items of type `T` (usually an index into a working list)
#[derive(Debug, Clone)]
pub struct GeoIndex<T> {
    cell_deg: f64,
    cells: HashMap<Cell, Vec<(f64, f64, T)>>,
    len: usize,
}

impl<T> GeoIndex<T> {
    pub fn new(cell_deg: f64) -> Self {
        GeoIndex {
            cell_deg,
            cells: HashMap::new(),
            len: 0,
        }
    }

    pub fn cell_of(&self, lat: f64, lng: f64) -> Cell {
        (
            (lat / self.cell_deg).floor() as i64,
            (lng / self.cell_deg).floor() as i64,
        )
    }

    pub fn insert(&mut self, lat: f64, lng: f64, item: T) {
        let cell = self.cell_of(lat, lng);
        self.cells.entry(cell).or_default().push((lat, lng, item));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rings of cells to scan (lat axis, lng axis) so that every point
    /// within `radius_m` of a point at `lat` is covered
    pub fn rings_for(&self, lat: f64, radius_m: f64) -> (i64, i64) {
        let cell_h = self.cell_deg * METERS_PER_DEG;
        let cell_w = cell_h * lat.to_radians().cos().abs();
        let rings = |cell_m: f64| {
            if cell_m <= 0.0 {
                return MAX_RINGS;
            }
            ((radius_m.max(0.0) / cell_m).ceil() as i64).clamp(1, MAX_RINGS)
        };
        (rings(cell_h), rings(cell_w))
    }

    /// Items within `radius_m` of (lat, lng), with their distance in meters.
    /// Order: cell by cell, insertion order inside a cell.
    pub fn nearby(&self, lat: f64, lng: f64, radius_m: f64) -> Vec<(f64, &T)> {
        let (ci, cj) = self.cell_of(lat, lng);
        let (ri, rj) = self.rings_for(lat, radius_m);
        let mut out = Vec::new();

        for di in -ri..=ri {
            for dj in -rj..=rj {
                if let Some(bucket) = self.cells.get(&(ci + di, cj + dj)) {
                    for (plat, plng, item) in bucket {
                        let d = haversine_m(lat, lng, *plat, *plng);
                        if d <= radius_m {
                            out.push((d, item));
                        }
                    }
                }
            }
        }

        out
    }
}

// ============================================================================
// BOROUGH BOUNDING BOXES
// ============================================================================

/// Axis-aligned lat/lng box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_lo: f64,
    pub lat_hi: f64,
    pub lng_lo: f64,
    pub lng_hi: f64,
}

impl BoundingBox {
    pub const fn new(lat_lo: f64, lat_hi: f64, lng_lo: f64, lng_hi: f64) -> Self {
        BoundingBox { lat_lo, lat_hi, lng_lo, lng_hi }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        self.lat_lo <= lat && lat <= self.lat_hi && self.lng_lo <= lng && lng <= self.lng_hi
    }
}

const BOROUGH_BOUNDS: &[(&str, BoundingBox)] = &[
    ("manhattan", BoundingBox::new(40.698, 40.882, -74.025, -73.907)),
    ("brooklyn", BoundingBox::new(40.566, 40.740, -74.045, -73.830)),
    ("queens", BoundingBox::new(40.540, 40.812, -73.963, -73.700)),
    ("bronx", BoundingBox::new(40.785, 40.917, -73.935, -73.748)),
    ("staten island", BoundingBox::new(40.490, 40.652, -74.260, -74.050)),
];

/// Generous box around all five boroughs
pub const NYC_BOUNDS: BoundingBox = BoundingBox::new(40.490, 40.920, -74.260, -73.700);

/// Bounding box for a borough in any alias form; None when unknown
pub fn borough_bounds(borough: &str) -> Option<BoundingBox> {
    let canonical = normalize_borough(borough);
    BOROUGH_BOUNDS
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, bounds)| *bounds)
}

/// Degrees of latitude spanning `meters` due north
#[cfg(test)]
pub(crate) fn lat_offset(meters: f64) -> f64 {
    meters / METERS_PER_DEG
}

/// Degrees of longitude spanning `meters` due east at `lat`
#[cfg(test)]
pub(crate) fn lng_offset(lat: f64, meters: f64) -> f64 {
    meters / (METERS_PER_DEG * lat.to_radians().cos())
}

// ============================================================================
// TESTS
// ============================================================================
