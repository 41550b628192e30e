//! IP geolocation enrichment for WHOIS replies
//!
//! - [`cache`]: TTL-bounded cache of rendered results
//! - [`local`]: MaxMind database lookups (synchronous)
//! - [`remote`]: IPinfo API lookups (asynchronous, completion queue)
//! - [`dispatcher`]: cache check, source selection and delivery

pub mod cache;
pub mod dispatcher;
pub mod formatters;
pub mod local;
pub mod remote;
pub mod types;

pub use cache::{Clock, GeoCache, ManualClock, SystemClock, spawn_sweeper};
pub use dispatcher::{EnrichOutcome, EnrichmentDispatcher, LookupStrategy};
pub use local::{GeoDataset, LocalLookupSource, MaxMindDataset, open_maxmind};
pub use remote::{
    CompletionReceiver, CompletionSender, HttpFetch, RemoteCompletion, RemoteLookupSource,
    RemoteSettings, ReqwestFetch, completion_channel,
};
pub use types::{GeoError, GeoResult, LookupResult};
