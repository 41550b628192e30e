//! Asynchronous lookups against the IPinfo API (https://ipinfo.io)
//!
//! [`RemoteLookupSource::begin_lookup`] returns as soon as the request task is
//! spawned. The task pushes exactly one [`RemoteCompletion`] onto the
//! completion queue when the response, an error or the timeout arrives, and
//! the host drains that queue on its own schedule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::types::{GeoError, GeoResult, IpinfoResponse, LookupResult};
use crate::core::ClientId;
use crate::{log_debug, log_warn};

const USER_AGENT: &str = "akaere-whois-geo/1.0";

/// Status and body of one GET
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Outbound HTTP capability
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str) -> GeoResult<HttpReply>;
}

pub struct ReqwestFetch {
    client: Client,
}

impl ReqwestFetch {
    pub fn new(timeout: Duration) -> GeoResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                GeoError::SourceUnavailable(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str) -> GeoResult<HttpReply> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpReply { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// API base, e.g. `https://ipinfo.io`
    pub endpoint: String,
    pub apikey: String,
    /// Upper bound for one lookup, including connect and body read
    pub timeout: Duration,
}

/// Where an answer for a pending lookup has to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub requester: ClientId,
    /// Name of the WHOIS target, used as the line prefix
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub ip: String,
    pub waiter: Waiter,
    pub issued_at: Instant,
}

impl PendingRequest {
    pub fn new(ip: impl Into<String>, waiter: Waiter) -> Self {
        Self {
            ip: ip.into(),
            waiter,
            issued_at: Instant::now(),
        }
    }
}

/// A finished remote lookup, consumed once by the dispatcher
#[derive(Debug)]
pub struct RemoteCompletion {
    pub request: PendingRequest,
    pub outcome: GeoResult<LookupResult>,
}

pub type CompletionSender = mpsc::UnboundedSender<RemoteCompletion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<RemoteCompletion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Handle to an in-flight lookup
///
/// Dropping it detaches the task; the completion is still delivered.
pub struct LookupHandle {
    ip: String,
    task: JoinHandle<()>,
}

impl LookupHandle {
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the completion has been queued
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            log_warn!("Remote geo lookup task for {} failed: {}", self.ip, e);
        }
    }
}

pub struct RemoteLookupSource {
    transport: Arc<dyn HttpFetch>,
    settings: RemoteSettings,
    completions: CompletionSender,
    runtime: Handle,
}

impl RemoteLookupSource {
    /// Create a source that runs lookups on the current tokio runtime
    pub fn new(
        settings: RemoteSettings,
        transport: Arc<dyn HttpFetch>,
        completions: CompletionSender,
    ) -> GeoResult<Self> {
        if settings.apikey.trim().is_empty() {
            return Err(GeoError::SourceUnavailable(
                "no IPinfo API key configured".to_string(),
            ));
        }
        if settings.timeout.is_zero() {
            return Err(GeoError::SourceUnavailable(
                "remote lookup timeout must be non-zero".to_string(),
            ));
        }
        Url::parse(&settings.endpoint).map_err(|e| {
            GeoError::SourceUnavailable(format!("invalid endpoint '{}': {}", settings.endpoint, e))
        })?;

        let runtime = Handle::try_current().map_err(|e| {
            GeoError::SourceUnavailable(format!("no async runtime for remote lookups: {}", e))
        })?;

        Ok(Self {
            transport,
            settings,
            completions,
            runtime,
        })
    }

    /// Build the lookup URL: `{endpoint}/{ip}?token={apikey}`
    pub fn lookup_url(&self, ip: &str) -> GeoResult<String> {
        let mut url = Url::parse(&self.settings.endpoint)
            .map_err(|e| GeoError::SourceUnavailable(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| {
                GeoError::SourceUnavailable(format!(
                    "endpoint '{}' cannot take a path",
                    self.settings.endpoint
                ))
            })?
            .pop_if_empty()
            .push(ip);
        url.query_pairs_mut().append_pair("token", &self.settings.apikey);
        Ok(url.into())
    }

    /// Start a lookup without waiting for it
    pub fn begin_lookup(&self, request: PendingRequest) -> LookupHandle {
        let ip = request.ip.clone();
        let url = self.lookup_url(&request.ip);
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let timeout = self.settings.timeout;

        log_debug!("Starting remote geo lookup for {}", ip);

        let task = self.runtime.spawn(async move {
            let outcome = match url {
                Ok(url) => run_lookup(transport.as_ref(), &url, timeout).await,
                Err(e) => Err(e),
            };

            log_debug!(
                "Remote geo lookup for {} finished in {:?}",
                request.ip,
                request.issued_at.elapsed()
            );

            if completions.send(RemoteCompletion { request, outcome }).is_err() {
                log_debug!("Completion queue closed, dropping remote geo result");
            }
        });

        LookupHandle { ip, task }
    }
}

async fn run_lookup(
    transport: &dyn HttpFetch,
    url: &str,
    timeout: Duration,
) -> GeoResult<LookupResult> {
    match tokio::time::timeout(timeout, fetch_and_parse(transport, url)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(GeoError::TransportFailure(format!(
            "no response within {}ms",
            timeout.as_millis()
        ))),
    }
}

async fn fetch_and_parse(transport: &dyn HttpFetch, url: &str) -> GeoResult<LookupResult> {
    let reply = transport.get(url).await?;
    if !(200..300).contains(&reply.status) {
        return Err(GeoError::HttpStatus(reply.status));
    }
    parse_ipinfo_body(&reply.body)
}

/// Parse an IPinfo body.
///
/// A body that is not a JSON object is `MalformedResponse`. A valid object
/// lacking any of `city`, `region`, `country`, `org` as strings is a
/// successful lookup with `found == false`.
pub fn parse_ipinfo_body(body: &[u8]) -> GeoResult<LookupResult> {
    if body.is_empty() {
        return Err(GeoError::MalformedResponse("no data (body) returned".to_string()));
    }

    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GeoError::MalformedResponse(e.to_string()))?;
    // Serde would also fill the struct from a positional array
    if !value.is_object() {
        return Err(GeoError::MalformedResponse(
            "response root is not a JSON object".to_string(),
        ));
    }
    let response: IpinfoResponse = serde_json::from_value(value)
        .map_err(|e| GeoError::MalformedResponse(e.to_string()))?;

    match extract_fields(&response) {
        Err(GeoError::MissingFields(field)) => {
            log_debug!("IPinfo response has no usable '{}' field", field);
            Ok(LookupResult::not_found())
        }
        other => other,
    }
}

fn extract_fields(response: &IpinfoResponse) -> GeoResult<LookupResult> {
    fn text(value: &Option<serde_json::Value>, name: &'static str) -> GeoResult<String> {
        value
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or(GeoError::MissingFields(name))
    }

    Ok(LookupResult {
        city: Some(text(&response.city, "city")?),
        region: Some(text(&response.region, "region")?),
        country: Some(text(&response.country, "country")?),
        organization: Some(text(&response.org, "org")?),
        found: true,
    })
}
