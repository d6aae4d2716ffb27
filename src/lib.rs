// Venue Catalog - Core Library
// Cross-source venue merging plus a resumable verification ledger

pub mod venue;
pub mod normalize;
pub mod geo;
pub mod matcher;   // Merge Engine - exact, range, geo passes
pub mod config;
pub mod providers; // Verification Providers - Yelp, Google, OpenTable, TripAdvisor
pub mod ledger;    // Verification Ledger - SQLite checkpoint
pub mod enrich;
pub mod diet;
pub mod cache;
pub mod sources;
pub mod catalog;
pub mod pipeline;

// Re-export commonly used types
pub use venue::{load_venues, ProviderStamp, SourceTag, VenueRecord};
pub use normalize::{
    name_similarity, normalize_address, normalize_borough, normalize_text, venue_key,
};
pub use geo::{borough_bounds, haversine_m, BoundingBox, GeoIndex};
pub use matcher::{MatchStrategy, MergeEngine, MergeMatch, MergeStats};
pub use config::{PipelineConfig, ProviderSettings, ProvidersConfig};
pub use providers::{
    Candidate, LookupError, Provider, VenueQuery, VerificationProvider,
};
pub use ledger::{Ledger, LedgerStats, ReviewDistribution, Status, VenueFlags};
pub use enrich::{Override, OverrideAction, StampStats};
pub use diet::{DietRule, DietStats, DietTagger};
pub use cache::JsonCache;
pub use sources::{JsonFileSource, SourceBatch, SourceStats, VenueSource};
pub use catalog::Catalog;
pub use pipeline::{Pipeline, VerifyOptions, VerifyReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
