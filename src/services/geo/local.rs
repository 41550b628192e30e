//! Local geolocation lookups against a MaxMind GeoLite2/GeoIP2 City database
//!
//! The database file is memory-mapped on open and is read-only after that,
//! so concurrent lookups share it through an `Arc` without further locking.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use maxminddb::Reader;

use super::types::{GeoError, GeoResult, LookupResult};
use crate::{log_debug, log_info, log_warn};

/// Fields a dataset knows about one address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CityRecord {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub organization: Option<String>,
}

/// Read-only geolocation dataset
pub trait GeoDataset: Send + Sync {
    /// `Ok(None)` when the address is valid but has no record
    fn lookup_city(&self, ip: IpAddr) -> GeoResult<Option<CityRecord>>;
}

/// MaxMind `.mmdb` city database over any byte source
pub struct MaxMindDataset<S: AsRef<[u8]>> {
    reader: Reader<S>,
}

impl<S: AsRef<[u8]>> MaxMindDataset<S> {
    pub fn from_reader(reader: Reader<S>) -> Self {
        Self { reader }
    }
}

/// Memory-map the database at `path`
pub fn open_maxmind(path: &Path) -> GeoResult<Arc<dyn GeoDataset>> {
    // SAFETY: the mapping is only read. Database updates must replace the
    // file (rename), never rewrite it in place while it is open.
    let reader = unsafe { Reader::open_mmap(path) }.map_err(|e| {
        GeoError::SourceUnavailable(format!(
            "failed to open MaxMind DB '{}': {}",
            path.display(),
            e
        ))
    })?;
    Ok(Arc::new(MaxMindDataset::from_reader(reader)))
}

impl<S> GeoDataset for MaxMindDataset<S>
where
    S: AsRef<[u8]> + Send + Sync,
{
    fn lookup_city(&self, ip: IpAddr) -> GeoResult<Option<CityRecord>> {
        let result = self
            .reader
            .lookup(ip)
            .map_err(|e| GeoError::Database(e.to_string()))?;
        let city: Option<maxminddb::geoip2::City> = result
            .decode()
            .map_err(|e| GeoError::Database(e.to_string()))?;

        Ok(city.map(|city| CityRecord {
            city: city.city.names.english.map(|s| s.to_string()),
            region: None,
            country: city.country.iso_code.map(String::from),
            organization: None,
        }))
    }
}

/// Synchronous lookup source wrapping an optional open dataset
#[derive(Default)]
pub struct LocalLookupSource {
    dataset: RwLock<Option<Arc<dyn GeoDataset>>>,
    path: RwLock<Option<PathBuf>>,
}

impl LocalLookupSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that is already open on `dataset`
    pub fn with_dataset(dataset: Arc<dyn GeoDataset>) -> Self {
        Self {
            dataset: RwLock::new(Some(dataset)),
            path: RwLock::new(None),
        }
    }

    /// Open the database at `path`.
    ///
    /// Opening an already open source is a no-op.
    pub fn open(&self, path: &Path) -> GeoResult<()> {
        let mut dataset = self.dataset.write().unwrap_or_else(|p| p.into_inner());
        if dataset.is_some() {
            let current = self.path.read().unwrap_or_else(|p| p.into_inner());
            if current.as_deref() != Some(path) {
                log_warn!(
                    "Geo database already open, ignoring open of {}",
                    path.display()
                );
            }
            return Ok(());
        }

        *dataset = Some(open_maxmind(path)?);
        *self.path.write().unwrap_or_else(|p| p.into_inner()) = Some(path.to_path_buf());
        log_info!("Loaded geo database from {}", path.display());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.dataset
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Release the dataset; safe to call when never opened
    pub fn close(&self) {
        let previous = self
            .dataset
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        self.path.write().unwrap_or_else(|p| p.into_inner()).take();
        if previous.is_some() {
            log_debug!("Closed geo database");
        }
    }

    pub fn lookup(&self, ip: &str) -> GeoResult<LookupResult> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| GeoError::InvalidAddress(ip.to_string()))?;

        // Clone the Arc so the lock is not held during the lookup
        let dataset = self
            .dataset
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| GeoError::SourceUnavailable("geo database not loaded".to_string()))?;

        let result = match dataset.lookup_city(addr)? {
            Some(record) => LookupResult {
                city: record.city,
                region: record.region,
                country: record.country,
                organization: record.organization,
                found: true,
            },
            None => LookupResult::not_found(),
        };

        log_debug!("Local geo lookup for {}: {:?}", ip, result);
        Ok(result)
    }
}
