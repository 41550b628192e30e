pub mod geo;

pub use geo::{EnrichOutcome, EnrichmentDispatcher, GeoCache, GeoError, LookupStrategy};
