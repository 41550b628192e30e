use serde::Deserialize;
use thiserror::Error;

/// Location fields produced by either lookup source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub organization: Option<String>,
    /// The address was known to the source
    pub found: bool,
}

impl LookupResult {
    /// A successful lookup that has no record for the address
    pub fn not_found() -> Self {
        Self::default()
    }
}

/// Raw IPinfo payload
///
/// Every field is optional here; the four we render are checked for
/// presence and type in [`super::remote::parse_ipinfo_body`].
#[derive(Debug, Deserialize)]
pub struct IpinfoResponse {
    pub city: Option<serde_json::Value>,
    pub region: Option<serde_json::Value>,
    pub country: Option<serde_json::Value>,
    pub org: Option<serde_json::Value>,
}

/// Geolocation enrichment error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeoError {
    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("Geolocation source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    #[error("Malformed response body: {0}")]
    MalformedResponse(String),

    #[error("Response is missing field: {0}")]
    MissingFields(&'static str),

    #[error("Requester {0} is no longer connected")]
    StaleIdentity(String),

    #[error("Geolocation database error: {0}")]
    Database(String),
}

/// Result type for geolocation operations
pub type GeoResult<T> = Result<T, GeoError>;

impl GeoError {
    /// Failures where the API answered, so the requester still gets an
    /// "unknown location" line
    pub fn api_responded(&self) -> bool {
        matches!(self, Self::MalformedResponse(_) | Self::MissingFields(_))
    }

    /// Short classification used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAddress(_) => "invalid-address",
            Self::SourceUnavailable(_) => "source-unavailable",
            Self::TransportFailure(_) => "transport",
            Self::HttpStatus(_) => "http-status",
            Self::MalformedResponse(_) => "malformed-response",
            Self::MissingFields(_) => "missing-fields",
            Self::StaleIdentity(_) => "stale-identity",
            Self::Database(_) => "database",
        }
    }
}

impl From<reqwest::Error> for GeoError {
    fn from(e: reqwest::Error) -> Self {
        // The request URL carries the API token
        let e = e.without_url();
        match e.status() {
            Some(status) => GeoError::HttpStatus(status.as_u16()),
            None => GeoError::TransportFailure(e.to_string()),
        }
    }
}
