//! # WHOIS Geo
//!
//! Geolocation enrichment for WHOIS replies. When an operator WHOISes a
//! user, one extra `320` line reports where the user connects from,
//! resolved either from a local MaxMind city database or from the IPinfo
//! HTTP API, and cached per IP.
//!
//! Library usage:
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use whois_geo::core::{ClientId, ReplySink, WhoisRequest, WhoisTarget};
//! use whois_geo::services::geo::LocalLookupSource;
//! use whois_geo::services::{EnrichmentDispatcher, GeoCache, LookupStrategy};
//!
//! struct Stdout;
//!
//! impl ReplySink for Stdout {
//!     fn is_live(&self, _client: ClientId) -> bool {
//!         true
//!     }
//!
//!     fn deliver(&self, _destination: ClientId, numeric: u16, text: &str) -> bool {
//!         println!("{} {}", numeric, text);
//!         true
//!     }
//! }
//!
//! let local = Arc::new(LocalLookupSource::new());
//! local.open("GeoLite2-City.mmdb".as_ref()).unwrap();
//!
//! let dispatcher = EnrichmentDispatcher::new(
//!     Arc::new(GeoCache::new(Duration::from_secs(86400))),
//!     LookupStrategy::Local(local),
//!     Arc::new(Stdout),
//!     true,
//! );
//! dispatcher.enrich(&WhoisRequest {
//!     requester: ClientId(1),
//!     requester_is_oper: true,
//!     target: WhoisTarget::user("alice", Some("203.0.113.5")),
//! });
//! ```

pub mod config;
pub mod core;
pub mod server;
pub mod services;

// Re-export commonly used types for convenience
pub use core::{ClientId, ClientKind, ReplySink, WhoisRequest, WhoisTarget};
pub use services::{EnrichOutcome, EnrichmentDispatcher, GeoCache, GeoError, LookupStrategy};
