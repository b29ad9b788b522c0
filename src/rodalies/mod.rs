// Rodalies de Catalunya (regional rail) departures computed from the static
// Renfe Cercanías GTFS feed.

pub mod departures;
pub mod error;
pub mod fetcher;
pub mod freshness;
pub mod gtfs;

pub use error::RodaliesError;
pub use fetcher::HttpFetcher;
pub use freshness::Rodalies;
