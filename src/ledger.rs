// 📒 Verification Ledger - Resumable per-venue, per-provider checks
//
// One SQLite row per venue (keyed by venue_key). Each provider owns a set of
// `{provider}_*` columns. Status moves unchecked → found | not_found | error
// | skip and never back, so a run picks up exactly where the last one left
// off. Rows are never deleted.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::normalize::{name_similarity, normalize_borough, venue_key};
use crate::providers::{
    Candidate, Details, LookupError, Provider, Throttle, VenueQuery, VerificationProvider,
};
use crate::venue::VenueRecord;

/// Per-provider columns, added on demand
const PROVIDER_COLUMNS: &[(&str, &str)] = &[
    ("status", "TEXT"),
    ("checked_at", "TEXT"),
    ("external_id", "TEXT"),
    ("url", "TEXT"),
    ("rating", "REAL"),
    ("review_count", "INTEGER"),
    ("lat", "REAL"),
    ("lng", "REAL"),
    ("categories", "TEXT"),
    ("price", "TEXT"),
    ("backfilled_at", "TEXT"),
];

/// Timestamps kept in the table but not surfaced as flags
const BOOKKEEPING_COLUMNS: &[&str] = &["checked_at", "backfilled_at"];

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unchecked,
    Found,
    NotFound,
    Error,
    Skip,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unchecked => "unchecked",
            Status::Found => "found",
            Status::NotFound => "not_found",
            Status::Error => "error",
            Status::Skip => "skip",
        }
    }

    /// NULL and unknown values read as unchecked
    pub fn parse(s: Option<&str>) -> Status {
        match s {
            Some("found") => Status::Found,
            Some("not_found") => Status::NotFound,
            Some("error") => Status::Error,
            Some("skip") => Status::Skip,
            _ => Status::Unchecked,
        }
    }
}

// ============================================================================
// FLAGS (read side)
// ============================================================================

/// Everything the ledger knows about one venue from one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderFlags {
    pub status: Status,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub categories: Vec<String>,
    pub price: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VenueFlags {
    pub providers: BTreeMap<Provider, ProviderFlags>,
}

impl VenueFlags {
    pub fn get(&self, provider: Provider) -> Option<&ProviderFlags> {
        self.providers.get(&provider)
    }

    pub fn status(&self, provider: Provider) -> Status {
        self.get(provider).map(|f| f.status).unwrap_or_default()
    }
}

/// Review-count spread among found venues of one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewDistribution {
    pub count: usize,
    pub min: i64,
    pub p10: i64,
    pub p25: i64,
    pub median: i64,
    pub p75: i64,
    pub p90: i64,
    pub max: i64,
    pub avg_rating: Option<f64>,
    pub under_10: usize,
    pub under_25: usize,
    pub under_50: usize,
    pub under_100: usize,
    /// Fewer than 50 reviews but rated 4.0 or better
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_gems_candidates: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_gems_pct: Option<f64>,
}

/// Provider → status → row count
pub type LedgerStats = BTreeMap<String, BTreeMap<String, usize>>;

// ============================================================================
// LEDGER
// ============================================================================

pub struct Ledger {
    conn: Connection,
}

struct PendingRow {
    key: String,
    name: String,
    address: String,
    borough: String,
}

enum Outcome {
    Found(Candidate),
    NotFound,
    Failed,
}

impl Ledger {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create ledger directory: {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger: {:?}", path))?;
        // WAL for crash safety between commit batches
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection, creating or migrating the schema
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let ledger = Ledger { conn };
        ledger.setup()?;
        Ok(ledger)
    }

    fn setup(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS verification (
                venue_key TEXT PRIMARY KEY,
                venue_name TEXT NOT NULL,
                venue_address TEXT NOT NULL DEFAULT '',
                venue_borough TEXT NOT NULL DEFAULT '',
                synced_at TEXT
            )",
            [],
        )?;

        // Additive migrations: new providers/columns appear as NULL
        let existing: Vec<String> = {
            let mut stmt = self.conn.prepare("PRAGMA table_info(verification)")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };

        let mut added = 0;
        for provider in Provider::ALL {
            for (suffix, sql_type) in PROVIDER_COLUMNS {
                let column = format!("{}_{}", provider.as_str(), suffix);
                if !existing.contains(&column) {
                    self.conn
                        .execute(&format!("ALTER TABLE verification ADD COLUMN {} {}", column, sql_type), [])
                        .with_context(|| format!("Failed to add column {}", column))?;
                    added += 1;
                }
            }
        }
        if added > 0 {
            debug!("Ledger schema: added {} columns", added);
        }

        Ok(())
    }

    pub fn row_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM verification", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========================================================================
    // SYNC
    // ========================================================================

    /// Ensure every venue has a row. Existing rows are never touched.
    /// Returns the number of rows inserted.
    pub fn sync(&mut self, venues: &[VenueRecord]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut new = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO verification (venue_key, venue_name, venue_address, venue_borough, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for v in venues {
                let key = venue_key(&v.name, &v.address, &v.borough);
                new += stmt.execute(params![key, v.name, v.address, v.borough, now])?;
            }
        }
        tx.commit()?;

        info!("Synced venues: {} new, {} total", new, self.row_count()?);
        Ok(new)
    }

    // ========================================================================
    // CHECK
    // ========================================================================

    /// Look up to `limit` unchecked venues with `provider`.
    ///
    /// With a `region`, unchecked rows outside that borough are marked
    /// `skip` first and never queued. A rate-limit response commits what
    /// has been done and ends the batch early. Returns rows checked.
    pub fn check_provider(
        &mut self,
        provider: &dyn VerificationProvider,
        limit: usize,
        region: Option<&str>,
    ) -> Result<usize> {
        let p = provider.provider();
        let settings = provider.settings();

        if let Some(region) = region {
            let skipped = self.skip_outside_region(p, region)?;
            if skipped > 0 {
                info!("{}: {} venues outside {} marked skip", p, skipped, region);
            }
        }

        let rows = self.pending_rows(p, limit)?;
        if rows.is_empty() {
            info!("{}: nothing to check", p);
            return Ok(0);
        }
        info!("{}: {} venues to check (limit {})", p, rows.len(), limit);

        let mut throttle = Throttle::per_second(settings.requests_per_second);
        let commit_every = settings.commit_every.max(1);
        let total = rows.len();
        let mut checked = 0;

        for chunk in rows.chunks(commit_every) {
            let tx = self.conn.transaction()?;
            for row in chunk {
                let query = VenueQuery {
                    key: row.key.clone(),
                    name: row.name.clone(),
                    address: row.address.clone(),
                    borough: row.borough.clone(),
                };
                let outcome = match lookup(provider, &query, &mut throttle) {
                    Ok(Some(candidate)) => Outcome::Found(candidate),
                    Ok(None) => Outcome::NotFound,
                    Err(LookupError::RateLimited) => {
                        warn!("{} rate-limited after {} requests", p, checked);
                        tx.commit()?;
                        return Ok(checked);
                    }
                    Err(e) => {
                        error!("{} error for {}: {}", p, row.name, e);
                        Outcome::Failed
                    }
                };
                write_outcome(&tx, p, &row.key, &outcome)?;
                checked += 1;
            }
            tx.commit()?;
            info!("{}: {} / {} checked", p, checked, total);
        }

        info!("{}: finished {} checks", p, checked);
        Ok(checked)
    }

    fn skip_outside_region(&mut self, provider: Provider, region: &str) -> Result<usize> {
        let status = format!("{}_status", provider.as_str());
        let target = normalize_borough(region);

        let tx = self.conn.transaction()?;
        let outside: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT venue_key, venue_borough FROM verification
                 WHERE {s} IS NULL OR {s} = 'unchecked'",
                s = status
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, borough)| normalize_borough(borough) != target)
                .map(|(key, _)| key)
                .collect()
        };
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE verification SET {} = 'skip' WHERE venue_key = ?1",
                status
            ))?;
            for key in &outside {
                stmt.execute(params![key])?;
            }
        }
        tx.commit()?;

        Ok(outside.len())
    }

    fn pending_rows(&self, provider: Provider, limit: usize) -> Result<Vec<PendingRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT venue_key, venue_name, venue_address, venue_borough FROM verification
             WHERE {s} IS NULL OR {s} = 'unchecked'
             ORDER BY rowid
             LIMIT ?1",
            s = format!("{}_status", provider.as_str())
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(PendingRow {
                    key: row.get(0)?,
                    name: row.get(1)?,
                    address: row.get(2)?,
                    borough: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // BACKFILL
    // ========================================================================

    /// Fill missing rating / review count / coordinates on `found` rows
    /// from the provider's details endpoint. Status never changes.
    ///
    /// A row is asked once per lookup: once the details endpoint has
    /// answered, `{p}_backfilled_at` keeps it out of later runs even when
    /// gaps remain. Returns rows where at least one gap was filled.
    pub fn backfill(&mut self, provider: &dyn VerificationProvider, limit: usize) -> Result<usize> {
        let p = provider.provider();
        if !provider.supports_details() {
            debug!("{}: no details endpoint, backfill skipped", p);
            return Ok(0);
        }

        let prefix = p.as_str();
        let targets: Vec<BackfillTarget> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT venue_key, {p}_external_id,
                        {p}_rating IS NULL, {p}_review_count IS NULL, {p}_lat IS NULL, {p}_lng IS NULL
                 FROM verification
                 WHERE {p}_status = 'found' AND {p}_external_id IS NOT NULL
                   AND {p}_backfilled_at IS NULL
                   AND ({p}_review_count IS NULL OR {p}_rating IS NULL OR {p}_lat IS NULL)
                 ORDER BY rowid
                 LIMIT ?1",
                p = prefix
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(BackfillTarget {
                        key: row.get(0)?,
                        external_id: row.get(1)?,
                        missing_rating: row.get(2)?,
                        missing_reviews: row.get(3)?,
                        missing_lat: row.get(4)?,
                        missing_lng: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        if targets.is_empty() {
            info!("{} backfill: nothing to do", p);
            return Ok(0);
        }
        info!("{} backfill: {} venues to update", p, targets.len());

        let settings = provider.settings();
        let mut throttle = Throttle::per_second(settings.requests_per_second);
        let update = format!(
            "UPDATE verification SET
                {p}_rating = COALESCE({p}_rating, ?1),
                {p}_review_count = COALESCE({p}_review_count, ?2),
                {p}_lat = COALESCE({p}_lat, ?3),
                {p}_lng = COALESCE({p}_lng, ?4),
                {p}_url = COALESCE({p}_url, ?5),
                {p}_backfilled_at = ?6
             WHERE venue_key = ?7",
            p = prefix
        );
        let answered_empty = format!(
            "UPDATE verification SET {p}_backfilled_at = ?1 WHERE venue_key = ?2",
            p = prefix
        );

        let total = targets.len();
        let mut filled = 0;
        for chunk in targets.chunks(settings.commit_every.max(1)) {
            let tx = self.conn.transaction()?;
            for target in chunk {
                throttle.wait();
                let now = Utc::now().to_rfc3339();
                match provider.details(&target.external_id) {
                    Ok(Some(d)) => {
                        tx.execute(
                            &update,
                            params![d.rating, d.review_count, d.lat, d.lng, d.url, now, target.key],
                        )?;
                        if target.filled_by(&d) {
                            filled += 1;
                        } else {
                            debug!("{} backfill: details for {} fill no gaps", p, target.external_id);
                        }
                    }
                    Ok(None) => {
                        tx.execute(&answered_empty, params![now, target.key])?;
                        debug!("{} backfill: no details for {}", p, target.external_id);
                    }
                    Err(LookupError::RateLimited) => {
                        warn!("{} backfill rate-limited after {}", p, filled);
                        tx.commit()?;
                        return Ok(filled);
                    }
                    Err(e) => error!("{} backfill error for {}: {}", p, target.external_id, e),
                }
            }
            tx.commit()?;
            info!("{} backfill: {} / {}", p, filled, total);
        }

        info!("{} backfill: finished {}", p, filled);
        Ok(filled)
    }

    // ========================================================================
    // READ SIDE
    // ========================================================================

    fn flag_columns() -> String {
        let mut cols = vec!["venue_key".to_string()];
        for provider in Provider::ALL {
            for (suffix, _) in PROVIDER_COLUMNS {
                if !BOOKKEEPING_COLUMNS.contains(suffix) {
                    cols.push(format!("{}_{}", provider.as_str(), suffix));
                }
            }
        }
        cols.join(", ")
    }

    fn read_flags(row: &Row<'_>) -> rusqlite::Result<(String, VenueFlags)> {
        let key: String = row.get(0)?;
        let mut flags = VenueFlags::default();
        let mut i = 1;
        for provider in Provider::ALL {
            let status: Option<String> = row.get(i)?;
            let categories: Option<String> = row.get(i + 7)?;
            flags.providers.insert(
                provider,
                ProviderFlags {
                    status: Status::parse(status.as_deref()),
                    external_id: row.get(i + 1)?,
                    url: row.get(i + 2)?,
                    rating: row.get(i + 3)?,
                    review_count: row.get(i + 4)?,
                    lat: row.get(i + 5)?,
                    lng: row.get(i + 6)?,
                    categories: categories
                        .map(|c| c.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
                        .unwrap_or_default(),
                    price: row.get(i + 8)?,
                },
            );
            i += PROVIDER_COLUMNS.len() - BOOKKEEPING_COLUMNS.len();
        }
        Ok((key, flags))
    }

    /// Flags for one venue; None when it was never synced
    pub fn flags(&self, key: &str) -> Result<Option<VenueFlags>> {
        let sql = format!("SELECT {} FROM verification WHERE venue_key = ?1", Self::flag_columns());
        let found = self
            .conn
            .query_row(&sql, params![key], Self::read_flags)
            .optional()?;
        Ok(found.map(|(_, flags)| flags))
    }

    pub fn all_flags(&self) -> Result<HashMap<String, VenueFlags>> {
        let sql = format!("SELECT {} FROM verification", Self::flag_columns());
        let mut stmt = self.conn.prepare(&sql)?;
        let flags = stmt
            .query_map([], Self::read_flags)?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(flags)
    }

    /// Row counts per provider per status (NULL counted as unchecked)
    pub fn stats(&self) -> Result<LedgerStats> {
        let mut stats = LedgerStats::new();
        for provider in Provider::ALL {
            let column = format!("{}_status", provider.as_str());
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {c}, COUNT(*) FROM verification GROUP BY {c}",
                c = column
            ))?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let entry = stats.entry(provider.as_str().to_string()).or_default();
            for (status, n) in counts {
                let status = Status::parse(status.as_deref()).as_str().to_string();
                *entry.entry(status).or_insert(0) += n as usize;
            }
        }
        Ok(stats)
    }

    /// Review-count percentiles for found venues, per provider
    pub fn review_distribution(&self) -> Result<BTreeMap<String, ReviewDistribution>> {
        let mut out = BTreeMap::new();
        for provider in Provider::ALL {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {p}_review_count, {p}_rating FROM verification
                 WHERE {p}_status = 'found' AND {p}_review_count IS NOT NULL",
                p = provider.as_str()
            ))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(provider.as_str().to_string(), distribution(&rows));
        }
        Ok(out)
    }

    /// (found, found with coordinates) per provider
    pub fn coordinate_coverage(&self) -> Result<Vec<(Provider, usize, usize)>> {
        let mut out = Vec::new();
        for provider in Provider::ALL {
            let (found, with_coords): (i64, i64) = self.conn.query_row(
                &format!(
                    "SELECT COUNT(*), COUNT({p}_lat) FROM verification WHERE {p}_status = 'found'",
                    p = provider.as_str()
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            out.push((provider, found as usize, with_coords as usize));
        }
        Ok(out)
    }
}

/// Search, then accept the first candidate whose name is close enough
fn lookup(
    provider: &dyn VerificationProvider,
    query: &VenueQuery,
    throttle: &mut Throttle,
) -> Result<Option<Candidate>, LookupError> {
    let min_similarity = provider.settings().min_similarity;

    throttle.wait();
    let candidates = provider.search(query)?;
    let hit = candidates
        .into_iter()
        .find(|c| name_similarity(&query.name, &c.name) >= min_similarity);

    let mut candidate = match hit {
        Some(c) => c,
        None => return Ok(None),
    };

    if provider.details_on_match() {
        if let Some(id) = candidate.external_id.clone() {
            throttle.wait();
            match provider.details(&id) {
                Ok(Some(details)) => candidate.fill_from(&details),
                Ok(None) => {}
                Err(LookupError::RateLimited) => return Err(LookupError::RateLimited),
                Err(e) => debug!("{} details failed for {}: {}", provider.provider(), id, e),
            }
        }
    }

    Ok(Some(candidate))
}

/// A `found` row with at least one gap, and which gaps it has
struct BackfillTarget {
    key: String,
    external_id: String,
    missing_rating: bool,
    missing_reviews: bool,
    missing_lat: bool,
    missing_lng: bool,
}

impl BackfillTarget {
    /// Whether `details` carries a value for any of this row's gaps
    fn filled_by(&self, details: &Details) -> bool {
        (self.missing_rating && details.rating.is_some())
            || (self.missing_reviews && details.review_count.is_some())
            || (self.missing_lat && details.lat.is_some())
            || (self.missing_lng && details.lng.is_some())
    }
}

fn write_outcome(conn: &Connection, provider: Provider, key: &str, outcome: &Outcome) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let p = provider.as_str();

    match outcome {
        Outcome::Failed => {
            conn.execute(
                &format!(
                    "UPDATE verification SET {p}_status = 'error', {p}_checked_at = ?1 WHERE venue_key = ?2",
                    p = p
                ),
                params![now, key],
            )?;
        }
        Outcome::Found(_) | Outcome::NotFound => {
            let (status, c) = match outcome {
                Outcome::Found(c) => (Status::Found, c.clone()),
                _ => (Status::NotFound, Candidate::default()),
            };
            let categories = if c.categories.is_empty() {
                None
            } else {
                Some(c.categories.join(","))
            };
            conn.execute(
                &format!(
                    "UPDATE verification SET
                        {p}_status = ?1, {p}_checked_at = ?2, {p}_external_id = ?3, {p}_url = ?4,
                        {p}_rating = ?5, {p}_review_count = ?6, {p}_lat = ?7, {p}_lng = ?8,
                        {p}_categories = ?9, {p}_price = ?10, {p}_backfilled_at = NULL
                     WHERE venue_key = ?11",
                    p = p
                ),
                params![
                    status.as_str(),
                    now,
                    c.external_id,
                    c.url,
                    c.rating,
                    c.review_count,
                    c.lat,
                    c.lng,
                    categories,
                    c.price,
                    key
                ],
            )?;
        }
    }
    Ok(())
}

fn distribution(rows: &[(i64, Option<f64>)]) -> ReviewDistribution {
    if rows.is_empty() {
        return ReviewDistribution::default();
    }

    let mut counts: Vec<i64> = rows.iter().map(|(c, _)| *c).collect();
    counts.sort_unstable();
    let n = counts.len();
    let at = |q: f64| counts[((n as f64) * q) as usize];

    let ratings: Vec<f64> = rows.iter().filter_map(|(_, r)| *r).collect();
    let avg_rating = if ratings.is_empty() {
        None
    } else {
        let avg = ratings.iter().sum::<f64>() / ratings.len() as f64;
        Some((avg * 100.0).round() / 100.0)
    };
    let under = |limit: i64| counts.iter().filter(|&&c| c < limit).count();

    let low_reviews: Vec<f64> = rows
        .iter()
        .filter(|(c, _)| *c < 50)
        .filter_map(|(_, r)| *r)
        .collect();
    let (hidden_gems_candidates, hidden_gems_pct) = if low_reviews.is_empty() {
        (None, None)
    } else {
        let gems = low_reviews.iter().filter(|&&r| r >= 4.0).count();
        let pct = (gems as f64 / low_reviews.len() as f64 * 1000.0).round() / 10.0;
        (Some(gems), Some(pct))
    };

    ReviewDistribution {
        count: n,
        min: counts[0],
        p10: at(0.10),
        p25: at(0.25),
        median: counts[n / 2],
        p75: at(0.75),
        p90: at(0.90),
        max: counts[n - 1],
        avg_rating,
        under_10: under(10),
        under_25: under(25),
        under_50: under(50),
        under_100: under(100),
        hidden_gems_candidates,
        hidden_gems_pct,
    }
}

// ============================================================================
// TESTS
// ============================================================================
