// 🌐 Verification Providers - External listings lookups
// Yelp, Google Places, OpenTable, TripAdvisor behind one trait so the
// ledger never touches HTTP directly.
//
// Every lookup is a single blocking request. HTTP 429 (or Google's
// OVER_QUERY_LIMIT) surfaces as `LookupError::RateLimited`, which halts a
// batch; every other failure is per-row.

use crate::config::{ProviderSettings, ProvidersConfig};
use crate::normalize::normalize_borough;
use serde_json::{json, Value};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("venue-catalog/", env!("CARGO_PKG_VERSION"));

/// Center of the city for proximity-biased searches
const NYC_CENTER: (f64, f64) = (40.7128, -74.0060);

// ============================================================================
// PROVIDER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    Yelp,
    Google,
    OpenTable,
    TripAdvisor,
}

impl Provider {
    /// Batch order for a verify run
    pub const ALL: [Provider; 4] = [
        Provider::Yelp,
        Provider::Google,
        Provider::OpenTable,
        Provider::TripAdvisor,
    ];

    /// Column prefix in the ledger and key in output flags
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Yelp => "yelp",
            Provider::Google => "google",
            Provider::OpenTable => "opentable",
            Provider::TripAdvisor => "tripadvisor",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Provider::Yelp => "Yelp",
            Provider::Google => "Google",
            Provider::OpenTable => "OpenTable",
            Provider::TripAdvisor => "TripAdvisor",
        }
    }

    pub fn env_prefix(&self) -> &'static str {
        match self {
            Provider::Yelp => "YELP",
            Provider::Google => "GOOGLE",
            Provider::OpenTable => "OPENTABLE",
            Provider::TripAdvisor => "TRIPADVISOR",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// LOOKUP TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LookupError {
    /// Provider asked us to stop; the batch halts and commits
    #[error("rate limited")]
    RateLimited,

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bad response: {0}")]
    Decode(String),
}

/// What we know about the venue being looked up
#[derive(Debug, Clone, PartialEq)]
pub struct VenueQuery {
    pub key: String,
    pub name: String,
    pub address: String,
    pub borough: String,
}

/// One search result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub categories: Vec<String>,
    pub price: Option<String>,
}

impl Candidate {
    /// Fill gaps from a details lookup; search values win
    pub fn fill_from(&mut self, details: &Details) {
        self.rating = self.rating.or(details.rating);
        self.review_count = self.review_count.or(details.review_count);
        self.lat = self.lat.or(details.lat);
        self.lng = self.lng.or(details.lng);
        if self.url.is_none() {
            self.url = details.url.clone();
        }
    }
}

/// Details lookup by external id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Details {
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub url: Option<String>,
}

// ============================================================================
// TRAIT
// ============================================================================

/// A listings service the ledger can verify venues against
pub trait VerificationProvider {
    fn provider(&self) -> Provider;

    fn settings(&self) -> &ProviderSettings;

    /// Ranked search results for a venue
    fn search(&self, query: &VenueQuery) -> Result<Vec<Candidate>, LookupError>;

    fn details(&self, _external_id: &str) -> Result<Option<Details>, LookupError> {
        Ok(None)
    }

    /// Whether `details` does anything (backfill eligibility)
    fn supports_details(&self) -> bool {
        false
    }

    /// Search results carry no ratings; fetch details right after a hit
    fn details_on_match(&self) -> bool {
        false
    }
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Spaces requests at a fixed minimum interval
#[derive(Debug)]
pub struct Throttle {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl Throttle {
    /// Non-positive rates disable throttling
    pub fn per_second(requests_per_second: f64) -> Self {
        let interval = if requests_per_second > 0.0 && requests_per_second.is_finite() {
            Some(Duration::from_secs_f64(1.0 / requests_per_second))
        } else {
            None
        };
        Throttle { interval, last: None }
    }

    /// Block until the next request is allowed
    pub fn wait(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

// ============================================================================
// HTTP PLUMBING
// ============================================================================

fn build_client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?)
}

/// Send and map the response onto `LookupError`
fn send_json(request: reqwest::blocking::RequestBuilder) -> Result<Value, LookupError> {
    let resp = request
        .send()
        .map_err(|e| LookupError::Transport(e.to_string()))?;

    let status = resp.status().as_u16();
    if status == 429 {
        return Err(LookupError::RateLimited);
    }
    if !resp.status().is_success() {
        return Err(LookupError::Http { status });
    }

    resp.json::<Value>()
        .map_err(|e| LookupError::Decode(e.to_string()))
}

fn str_at(v: &Value, pointer: &str) -> Option<String> {
    match v.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers sometimes arrive as strings ("4.5")
fn f64_at(v: &Value, pointer: &str) -> Option<f64> {
    match v.pointer(pointer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn i64_at(v: &Value, pointer: &str) -> Option<i64> {
    match v.pointer(pointer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn array_at<'a>(v: &'a Value, pointer: &str) -> &'a [Value] {
    v.pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// City name the listing services expect for a borough
fn city_for(borough: &str) -> &'static str {
    match normalize_borough(borough).as_str() {
        "brooklyn" => "Brooklyn",
        "queens" => "Queens",
        "bronx" => "Bronx",
        "staten island" => "Staten Island",
        _ => "New York",
    }
}

// ============================================================================
// YELP FUSION
// ============================================================================

pub struct YelpClient {
    http: reqwest::blocking::Client,
    api_key: String,
    settings: ProviderSettings,
}

impl YelpClient {
    const SEARCH_URL: &'static str = "https://api.yelp.com/v3/businesses/search";
    const DETAILS_URL: &'static str = "https://api.yelp.com/v3/businesses";

    pub fn new(api_key: String, settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(YelpClient {
            http: build_client()?,
            api_key,
            settings,
        })
    }
}

impl VerificationProvider for YelpClient {
    fn provider(&self) -> Provider {
        Provider::Yelp
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn search(&self, query: &VenueQuery) -> Result<Vec<Candidate>, LookupError> {
        let location = format!("{}, {}, NY", query.address, city_for(&query.borough));
        let body = send_json(
            self.http
                .get(Self::SEARCH_URL)
                .bearer_auth(&self.api_key)
                .query(&[("term", query.name.as_str()), ("location", location.as_str()), ("limit", "3")]),
        )?;
        Ok(parse_yelp_search(&body))
    }

    fn details(&self, external_id: &str) -> Result<Option<Details>, LookupError> {
        let body = send_json(
            self.http
                .get(format!("{}/{}", Self::DETAILS_URL, external_id))
                .bearer_auth(&self.api_key),
        )?;
        Ok(Some(parse_yelp_business(&body)))
    }

    fn supports_details(&self) -> bool {
        true
    }
}

fn yelp_candidate(biz: &Value) -> Candidate {
    Candidate {
        name: str_at(biz, "/name").unwrap_or_default(),
        external_id: str_at(biz, "/id"),
        url: str_at(biz, "/url"),
        rating: f64_at(biz, "/rating"),
        review_count: i64_at(biz, "/review_count"),
        lat: f64_at(biz, "/coordinates/latitude"),
        lng: f64_at(biz, "/coordinates/longitude"),
        categories: array_at(biz, "/categories")
            .iter()
            .filter_map(|c| str_at(c, "/alias"))
            .collect(),
        price: str_at(biz, "/price"),
    }
}

pub fn parse_yelp_search(body: &Value) -> Vec<Candidate> {
    array_at(body, "/businesses").iter().map(yelp_candidate).collect()
}

pub fn parse_yelp_business(body: &Value) -> Details {
    Details {
        rating: f64_at(body, "/rating"),
        review_count: i64_at(body, "/review_count"),
        lat: f64_at(body, "/coordinates/latitude"),
        lng: f64_at(body, "/coordinates/longitude"),
        url: str_at(body, "/url"),
    }
}

// ============================================================================
// GOOGLE PLACES
// ============================================================================

pub struct GoogleClient {
    http: reqwest::blocking::Client,
    api_key: String,
    settings: ProviderSettings,
}

impl GoogleClient {
    const FIND_URL: &'static str = "https://maps.googleapis.com/maps/api/place/findplacefromtext/json";
    const DETAILS_URL: &'static str = "https://maps.googleapis.com/maps/api/place/details/json";

    pub fn new(api_key: String, settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(GoogleClient {
            http: build_client()?,
            api_key,
            settings,
        })
    }
}

impl VerificationProvider for GoogleClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn search(&self, query: &VenueQuery) -> Result<Vec<Candidate>, LookupError> {
        let input = format!("{}, {}, New York, NY", query.name, query.address);
        let body = send_json(self.http.get(Self::FIND_URL).query(&[
            ("input", input.as_str()),
            ("inputtype", "textquery"),
            ("fields", "place_id,name,formatted_address,rating,user_ratings_total,geometry"),
            ("key", self.api_key.as_str()),
        ]))?;
        google_status(&body)?;
        Ok(parse_google_candidates(&body))
    }

    fn details(&self, external_id: &str) -> Result<Option<Details>, LookupError> {
        let body = send_json(self.http.get(Self::DETAILS_URL).query(&[
            ("place_id", external_id),
            ("fields", "rating,user_ratings_total,geometry,url"),
            ("key", self.api_key.as_str()),
        ]))?;
        google_status(&body)?;
        Ok(body.get("result").map(parse_google_details))
    }

    fn supports_details(&self) -> bool {
        true
    }
}

/// Places reports quota exhaustion in the body with a 200
fn google_status(body: &Value) -> Result<(), LookupError> {
    match body.get("status").and_then(Value::as_str) {
        Some("OVER_QUERY_LIMIT") => Err(LookupError::RateLimited),
        Some("REQUEST_DENIED") | Some("INVALID_REQUEST") => Err(LookupError::Http { status: 400 }),
        _ => Ok(()),
    }
}

pub fn parse_google_candidates(body: &Value) -> Vec<Candidate> {
    array_at(body, "/candidates")
        .iter()
        .map(|c| Candidate {
            name: str_at(c, "/name").unwrap_or_default(),
            external_id: str_at(c, "/place_id"),
            rating: f64_at(c, "/rating"),
            review_count: i64_at(c, "/user_ratings_total"),
            lat: f64_at(c, "/geometry/location/lat"),
            lng: f64_at(c, "/geometry/location/lng"),
            ..Candidate::default()
        })
        .collect()
}

pub fn parse_google_details(result: &Value) -> Details {
    Details {
        rating: f64_at(result, "/rating"),
        review_count: i64_at(result, "/user_ratings_total"),
        lat: f64_at(result, "/geometry/location/lat"),
        lng: f64_at(result, "/geometry/location/lng"),
        url: str_at(result, "/url"),
    }
}

// ============================================================================
// OPENTABLE (keyless autocomplete)
// ============================================================================

pub struct OpenTableClient {
    http: reqwest::blocking::Client,
    settings: ProviderSettings,
}

impl OpenTableClient {
    const GQL_URL: &'static str = "https://www.opentable.com/dapi/fe/gql";
    const SITE: &'static str = "https://www.opentable.com";
    const QUERY: &'static str = "query Autocomplete($term: String!, $latitude: Float!, $longitude: Float!) {
  autocomplete(term: $term, latitude: $latitude, longitude: $longitude) {
    restaurants {
      rid
      name
      urls { profileLink }
      statistics { reviews { allTimeSummary { overallRating reviewCount } } }
      priceBand
    }
  }
}";

    pub fn new(settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(OpenTableClient {
            http: build_client()?,
            settings,
        })
    }
}

impl VerificationProvider for OpenTableClient {
    fn provider(&self) -> Provider {
        Provider::OpenTable
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn search(&self, query: &VenueQuery) -> Result<Vec<Candidate>, LookupError> {
        let payload = json!({
            "operationName": "Autocomplete",
            "variables": {
                "term": format!("{} {}", query.name, query.borough),
                "latitude": NYC_CENTER.0,
                "longitude": NYC_CENTER.1,
            },
            "query": Self::QUERY,
        });
        let body = send_json(
            self.http
                .post(Self::GQL_URL)
                .header("Accept", "application/json")
                .header("Origin", Self::SITE)
                .header("Referer", format!("{}/", Self::SITE))
                .json(&payload),
        )?;
        Ok(parse_opentable_autocomplete(&body))
    }
}

pub fn parse_opentable_autocomplete(body: &Value) -> Vec<Candidate> {
    array_at(body, "/data/autocomplete/restaurants")
        .iter()
        .map(|r| {
            let url = str_at(r, "/urls/profileLink").map(|link| {
                if link.starts_with("http") {
                    link
                } else {
                    format!("{}{}", OpenTableClient::SITE, link)
                }
            });
            Candidate {
                name: str_at(r, "/name").unwrap_or_default(),
                external_id: str_at(r, "/rid"),
                url,
                rating: f64_at(r, "/statistics/reviews/allTimeSummary/overallRating"),
                review_count: i64_at(r, "/statistics/reviews/allTimeSummary/reviewCount"),
                price: str_at(r, "/priceBand"),
                ..Candidate::default()
            }
        })
        .collect()
}

// ============================================================================
// TRIPADVISOR CONTENT API
// ============================================================================

pub struct TripAdvisorClient {
    http: reqwest::blocking::Client,
    api_key: String,
    settings: ProviderSettings,
}

impl TripAdvisorClient {
    const SEARCH_URL: &'static str = "https://api.content.tripadvisor.com/api/v1/location/search";
    const LOCATION_URL: &'static str = "https://api.content.tripadvisor.com/api/v1/location";

    pub fn new(api_key: String, settings: ProviderSettings) -> anyhow::Result<Self> {
        Ok(TripAdvisorClient {
            http: build_client()?,
            api_key,
            settings,
        })
    }
}

impl VerificationProvider for TripAdvisorClient {
    fn provider(&self) -> Provider {
        Provider::TripAdvisor
    }

    fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    fn search(&self, query: &VenueQuery) -> Result<Vec<Candidate>, LookupError> {
        let search = format!("{}, {}, New York", query.name, query.address);
        let lat_long = format!("{},{}", NYC_CENTER.0, NYC_CENTER.1);
        let body = send_json(
            self.http
                .get(Self::SEARCH_URL)
                .header("Accept", "application/json")
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("searchQuery", search.as_str()),
                    ("category", "restaurants"),
                    ("language", "en"),
                    ("latLong", lat_long.as_str()),
                ]),
        )?;
        Ok(parse_tripadvisor_search(&body))
    }

    fn details(&self, external_id: &str) -> Result<Option<Details>, LookupError> {
        let body = send_json(
            self.http
                .get(format!("{}/{}/details", Self::LOCATION_URL, external_id))
                .header("Accept", "application/json")
                .query(&[("key", self.api_key.as_str()), ("language", "en"), ("currency", "USD")]),
        )?;
        Ok(Some(parse_tripadvisor_details(&body)))
    }

    fn supports_details(&self) -> bool {
        true
    }

    fn details_on_match(&self) -> bool {
        true
    }
}

pub fn parse_tripadvisor_search(body: &Value) -> Vec<Candidate> {
    array_at(body, "/data")
        .iter()
        .map(|r| Candidate {
            name: str_at(r, "/name").unwrap_or_default(),
            external_id: str_at(r, "/location_id"),
            ..Candidate::default()
        })
        .collect()
}

pub fn parse_tripadvisor_details(body: &Value) -> Details {
    Details {
        rating: f64_at(body, "/rating"),
        review_count: i64_at(body, "/num_reviews"),
        lat: f64_at(body, "/latitude"),
        lng: f64_at(body, "/longitude"),
        url: str_at(body, "/web_url"),
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Build a client for `provider`; Ok(None) when its API key is missing
pub fn client_for(
    provider: Provider,
    settings: &ProviderSettings,
) -> anyhow::Result<Option<Box<dyn VerificationProvider>>> {
    let key = match settings.api_key() {
        Ok(key) => key,
        Err(e) => {
            warn!("{}: {} - skipping", provider.label(), e);
            return Ok(None);
        }
    };

    let settings = settings.clone();
    let client: Box<dyn VerificationProvider> = match (provider, key) {
        (Provider::OpenTable, _) => Box::new(OpenTableClient::new(settings)?),
        (Provider::Yelp, Some(key)) => Box::new(YelpClient::new(key, settings)?),
        (Provider::Google, Some(key)) => Box::new(GoogleClient::new(key, settings)?),
        (Provider::TripAdvisor, Some(key)) => Box::new(TripAdvisorClient::new(key, settings)?),
        (p, None) => {
            warn!("{}: no API key configured - skipping", p.label());
            return Ok(None);
        }
    };
    Ok(Some(client))
}

/// Every provider that can run with the current configuration
pub fn configured(config: &ProvidersConfig) -> anyhow::Result<Vec<Box<dyn VerificationProvider>>> {
    let mut out = Vec::new();
    for provider in Provider::ALL {
        if let Some(client) = client_for(provider, config.get(provider))? {
            out.push(client);
        }
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================
