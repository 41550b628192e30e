//! Per-request enrichment flow
//!
//! `enrich` either delivers a line synchronously (cache hit, local lookup,
//! no-IP marker) or starts a remote lookup and returns. Remote answers come
//! back through [`EnrichmentDispatcher::on_remote_result`], which checks that
//! each waiting requester is still connected before delivering.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use super::cache::GeoCache;
use super::formatters::{
    UNKNOWN_LOCATION, connecting_from_line, no_data_line, no_ip_line, render_local, render_remote,
};
use super::local::LocalLookupSource;
use super::remote::{
    CompletionReceiver, PendingRequest, RemoteCompletion, RemoteLookupSource, Waiter,
};
use super::types::GeoError;
use crate::core::{ClientId, ClientKind, RPL_WHOISSPECIAL, ReplySink, WhoisRequest};
use crate::{log_debug, log_error, log_warn};

/// Which source answers cache misses, chosen once at startup
pub enum LookupStrategy {
    Local(Arc<LocalLookupSource>),
    Remote(Arc<RemoteLookupSource>),
}

impl LookupStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LookupStrategy::Local(_) => "local",
            LookupStrategy::Remote(_) => "remote",
        }
    }
}

/// What `enrich` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// Requester not privileged or target not a user; nothing delivered
    Rejected,
    /// Target has no IP; the no-IP marker was delivered
    NoAddress,
    /// Target IP does not parse; nothing delivered
    InvalidAddress,
    CacheHit,
    /// Answered by the local database
    Resolved,
    /// Source not usable; the neutral no-data line was delivered
    Unavailable,
    /// Lookup failed; nothing delivered
    Failed,
    /// Remote lookup started
    Pending,
    /// Joined a remote lookup already in flight for the same IP
    Coalesced,
}

pub struct EnrichmentDispatcher {
    cache: Arc<GeoCache>,
    strategy: LookupStrategy,
    sink: Arc<dyn ReplySink>,
    coalesce: bool,
    // Extra waiters per IP; the first one travels inside the PendingRequest
    inflight: Mutex<HashMap<String, Vec<Waiter>>>,
    unavailable_logged: AtomicBool,
}

impl EnrichmentDispatcher {
    pub fn new(
        cache: Arc<GeoCache>,
        strategy: LookupStrategy,
        sink: Arc<dyn ReplySink>,
        coalesce: bool,
    ) -> Self {
        Self {
            cache,
            strategy,
            sink,
            coalesce,
            inflight: Mutex::new(HashMap::new()),
            unavailable_logged: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<GeoCache> {
        &self.cache
    }

    pub fn strategy(&self) -> &LookupStrategy {
        &self.strategy
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<String, Vec<Waiter>>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of distinct IPs with a coalesced remote lookup in flight
    pub fn inflight_len(&self) -> usize {
        self.inflight().len()
    }

    pub fn enrich(&self, request: &WhoisRequest) -> EnrichOutcome {
        if !request.requester_is_oper || request.target.kind != ClientKind::User {
            return EnrichOutcome::Rejected;
        }

        let target = request.target.name.as_str();
        let Some(ip) = request.target.address() else {
            self.deliver(request.requester, &no_ip_line(target));
            return EnrichOutcome::NoAddress;
        };

        // Canonical text form, so 2001:DB8::1 and 2001:db8::1 share an entry
        let key = match ip.parse::<IpAddr>() {
            Ok(addr) => addr.to_string(),
            Err(_) => {
                log_debug!("Skipping geo enrichment for {}: invalid IP '{}'", target, ip);
                return EnrichOutcome::InvalidAddress;
            }
        };

        if let Some(rendered) = self.cache.get(&key) {
            log_debug!("Geo cache hit for {}", key);
            self.deliver(request.requester, &connecting_from_line(target, &rendered));
            return EnrichOutcome::CacheHit;
        }

        let waiter = Waiter {
            requester: request.requester,
            target: target.to_string(),
        };

        match &self.strategy {
            LookupStrategy::Local(source) => self.enrich_local(source, key, waiter),
            LookupStrategy::Remote(source) => self.enrich_remote(source, key, waiter),
        }
    }

    fn enrich_local(
        &self,
        source: &LocalLookupSource,
        key: String,
        waiter: Waiter,
    ) -> EnrichOutcome {
        match source.lookup(&key) {
            Ok(result) => {
                let rendered = render_local(&result);
                self.cache.put(&key, &rendered);
                self.deliver(waiter.requester, &connecting_from_line(&waiter.target, &rendered));
                EnrichOutcome::Resolved
            }
            Err(GeoError::SourceUnavailable(reason)) => {
                self.report_unavailable(&reason);
                self.deliver(waiter.requester, &no_data_line(&waiter.target));
                EnrichOutcome::Unavailable
            }
            Err(GeoError::InvalidAddress(ip)) => {
                log_debug!("Local geo lookup rejected address {}", ip);
                EnrichOutcome::InvalidAddress
            }
            Err(e) => {
                log_error!("Local geo lookup for {} failed ({}): {}", key, e.kind(), e);
                EnrichOutcome::Failed
            }
        }
    }

    fn enrich_remote(
        &self,
        source: &RemoteLookupSource,
        key: String,
        waiter: Waiter,
    ) -> EnrichOutcome {
        if self.coalesce {
            let mut inflight = self.inflight();
            if let Some(waiters) = inflight.get_mut(&key) {
                log_debug!("Joining in-flight geo lookup for {}", key);
                waiters.push(waiter);
                return EnrichOutcome::Coalesced;
            }
            inflight.insert(key.clone(), Vec::new());
        }

        // Detached: the answer arrives through the completion queue
        let handle = source.begin_lookup(PendingRequest::new(key, waiter));
        log_debug!("Remote geo lookup for {} in flight", handle.ip());
        EnrichOutcome::Pending
    }

    /// Handle one remote completion. Returns how many lines were delivered.
    pub fn on_remote_result(&self, completion: RemoteCompletion) -> usize {
        let RemoteCompletion { request, outcome } = completion;

        let mut waiters = vec![request.waiter];
        if self.coalesce {
            if let Some(extra) = self.inflight().remove(&request.ip) {
                waiters.extend(extra);
            }
        }

        let rendered = match outcome {
            Ok(result) if result.found => {
                let rendered = render_remote(&result);
                self.cache.put(&request.ip, &rendered);
                rendered
            }
            Ok(_) => {
                log_debug!("IPinfo returned incomplete data for {}", request.ip);
                UNKNOWN_LOCATION.to_string()
            }
            Err(e) if e.api_responded() => {
                log_warn!("Unusable IPinfo response for {}: {}", request.ip, e);
                UNKNOWN_LOCATION.to_string()
            }
            Err(e) => {
                log_warn!(
                    "Error while trying to get IP info for {} ({}): {}",
                    request.ip,
                    e.kind(),
                    e
                );
                return 0;
            }
        };

        waiters
            .iter()
            .filter(|waiter| self.deliver_if_live(waiter, &rendered))
            .count()
    }

    fn deliver_if_live(&self, waiter: &Waiter, rendered: &str) -> bool {
        if !self.sink.is_live(waiter.requester) {
            let stale = GeoError::StaleIdentity(waiter.requester.to_string());
            log_debug!("Dropping geo result for {}: {}", waiter.target, stale);
            return false;
        }
        self.deliver(waiter.requester, &connecting_from_line(&waiter.target, rendered))
    }

    fn deliver(&self, destination: ClientId, text: &str) -> bool {
        self.sink.deliver(destination, RPL_WHOISSPECIAL, text)
    }

    fn report_unavailable(&self, reason: &str) {
        if !self.unavailable_logged.swap(true, Ordering::SeqCst) {
            log_error!("Geo enrichment unavailable: {}", reason);
        }
    }

    /// Drain the completion queue until every sender is gone
    pub async fn run_completions(self: Arc<Self>, mut completions: CompletionReceiver) {
        while let Some(completion) = completions.recv().await {
            self.on_remote_result(completion);
        }
        log_debug!("Geo completion queue closed");
    }

    pub fn spawn_completion_loop(
        self: &Arc<Self>,
        completions: CompletionReceiver,
    ) -> JoinHandle<()> {
        tokio::spawn(self.clone().run_completions(completions))
    }

    /// Close the local dataset and drop all cached entries
    pub fn shutdown(&self) {
        if let LookupStrategy::Local(source) = &self.strategy {
            source.close();
        }
        self.inflight().clear();
        self.cache.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    use crate::core::WhoisTarget;
    use crate::services::geo::cache::ManualClock;
    use crate::services::geo::local::tests::FakeDataset;
    use crate::services::geo::remote::tests::{FakeFetch, PARIS_BODY, settings};
    use crate::services::geo::remote::{HttpFetch, completion_channel};

    const PARIS_LINE: &str =
        "alice :is connecting from City: Paris, Region: IDF, Country: FR, Org: ExampleNet";

    #[derive(Default)]
    struct RecordingSink {
        live: Mutex<HashSet<ClientId>>,
        lines: Mutex<Vec<(ClientId, u16, String)>>,
    }

    impl RecordingSink {
        fn with_live(ids: &[u64]) -> Arc<Self> {
            let sink = Self::default();
            sink.live.lock().unwrap().extend(ids.iter().copied().map(ClientId));
            Arc::new(sink)
        }

        fn disconnect(&self, id: u64) {
            self.live.lock().unwrap().remove(&ClientId(id));
        }

        fn lines(&self) -> Vec<(ClientId, u16, String)> {
            self.lines.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<String> {
            self.lines().into_iter().map(|(_, _, text)| text).collect()
        }
    }

    impl ReplySink for RecordingSink {
        fn is_live(&self, client: ClientId) -> bool {
            self.live.lock().unwrap().contains(&client)
        }

        fn deliver(&self, destination: ClientId, numeric: u16, text: &str) -> bool {
            if !self.is_live(destination) {
                return false;
            }
            self.lines
                .lock()
                .unwrap()
                .push((destination, numeric, text.to_string()));
            true
        }
    }

    fn cache() -> Arc<GeoCache> {
        Arc::new(GeoCache::with_clock(
            Duration::from_secs(86400),
            Arc::new(ManualClock::new(0)),
        ))
    }

    fn request(requester: u64, name: &str, ip: Option<&str>) -> WhoisRequest {
        WhoisRequest {
            requester: ClientId(requester),
            requester_is_oper: true,
            target: WhoisTarget::user(name, ip),
        }
    }

    fn local_dispatcher(sink: Arc<RecordingSink>) -> EnrichmentDispatcher {
        let dataset = FakeDataset::with(&[("203.0.113.5", Some("Paris")), ("203.0.113.9", None)]);
        let source = Arc::new(LocalLookupSource::with_dataset(Arc::new(dataset)));
        EnrichmentDispatcher::new(cache(), LookupStrategy::Local(source), sink, true)
    }

    fn remote_dispatcher(
        sink: Arc<RecordingSink>,
        fetch: Arc<dyn HttpFetch>,
        coalesce: bool,
    ) -> (Arc<EnrichmentDispatcher>, CompletionReceiver) {
        let (tx, rx) = completion_channel();
        let source = RemoteLookupSource::new(settings(Duration::from_secs(5)), fetch, tx).unwrap();
        let dispatcher = EnrichmentDispatcher::new(
            cache(),
            LookupStrategy::Remote(Arc::new(source)),
            sink,
            coalesce,
        );
        (Arc::new(dispatcher), rx)
    }

    #[test]
    fn test_policy_rejections_are_silent() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());

        let mut not_oper = request(1, "alice", Some("203.0.113.5"));
        not_oper.requester_is_oper = false;
        assert_eq!(dispatcher.enrich(&not_oper), EnrichOutcome::Rejected);

        let mut service = request(1, "NickServ", Some("203.0.113.5"));
        service.target.kind = ClientKind::Service;
        assert_eq!(dispatcher.enrich(&service), EnrichOutcome::Rejected);

        let mut server = request(1, "irc.example.net", Some("203.0.113.5"));
        server.target.kind = ClientKind::Server;
        assert_eq!(dispatcher.enrich(&server), EnrichOutcome::Rejected);

        assert!(sink.lines().is_empty());
        assert!(dispatcher.cache().is_empty());
    }

    #[test]
    fn test_no_ip_marker() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());

        assert_eq!(dispatcher.enrich(&request(1, "alice", None)), EnrichOutcome::NoAddress);
        assert_eq!(
            sink.lines(),
            vec![(ClientId(1), 320, "alice :No IP found!!".to_string())]
        );
    }

    #[test]
    fn test_invalid_address_delivers_nothing() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());

        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("999.1.2.3"))),
            EnrichOutcome::InvalidAddress
        );
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_local_found_unknown_city_unknown_location() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());

        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::Resolved
        );
        dispatcher.enrich(&request(1, "bob", Some("203.0.113.9")));
        dispatcher.enrich(&request(1, "carol", Some("198.51.100.1")));

        assert_eq!(
            sink.texts(),
            vec![
                "alice :is connecting from City: Paris".to_string(),
                "bob :is connecting from an unknown city".to_string(),
                "carol :is connecting from an unknown location".to_string(),
            ]
        );
        assert_eq!(dispatcher.cache().len(), 3);
    }

    #[test]
    fn test_local_write_through_then_cache_hit() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));
        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::CacheHit
        );
        let texts = sink.texts();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], texts[1]);
    }

    #[test]
    fn test_local_unavailable_delivers_neutral_line() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());
        dispatcher.shutdown();

        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::Unavailable
        );
        assert_eq!(
            dispatcher.enrich(&request(1, "bob", Some("203.0.113.5"))),
            EnrichOutcome::Unavailable
        );
        assert_eq!(
            sink.texts(),
            vec![
                "alice :No geolocation data available".to_string(),
                "bob :No geolocation data available".to_string(),
            ]
        );
    }

    #[test]
    fn test_local_dataset_error_is_silent() {
        let sink = RecordingSink::with_live(&[1]);
        let source = LocalLookupSource::with_dataset(Arc::new(FakeDataset {
            corrupt: true,
            ..Default::default()
        }));
        let dispatcher = EnrichmentDispatcher::new(
            cache(),
            LookupStrategy::Local(Arc::new(source)),
            sink.clone(),
            true,
        );

        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::Failed
        );
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_remote_dispatch_does_not_block() {
        let sink = RecordingSink::with_live(&[1]);
        let fetch = Arc::new(FakeFetch::ok(PARIS_BODY).delayed(Duration::from_millis(200)));
        let (dispatcher, mut rx) = remote_dispatcher(sink.clone(), fetch, true);

        let started = Instant::now();
        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::Pending
        );
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(sink.lines().is_empty());

        let completion = rx.recv().await.unwrap();
        assert_eq!(dispatcher.on_remote_result(completion), 1);
        assert_eq!(sink.texts(), vec![PARIS_LINE.to_string()]);

        // Written through to the cache
        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::CacheHit
        );
        assert_eq!(dispatcher.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_remote_missing_org_delivers_unknown_without_caching() {
        let sink = RecordingSink::with_live(&[1]);
        let body = r#"{"city": "Paris", "region": "IDF", "country": "FR"}"#;
        let (dispatcher, mut rx) =
            remote_dispatcher(sink.clone(), Arc::new(FakeFetch::ok(body)), true);

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));
        dispatcher.on_remote_result(rx.recv().await.unwrap());

        assert_eq!(
            sink.texts(),
            vec!["alice :is connecting from an unknown location".to_string()]
        );
        assert!(dispatcher.cache().is_empty());
    }

    #[tokio::test]
    async fn test_remote_array_body_is_not_cached() {
        let sink = RecordingSink::with_live(&[1]);
        let body = r#"["Paris","IDF","FR","ExampleNet"]"#;
        let (dispatcher, mut rx) =
            remote_dispatcher(sink.clone(), Arc::new(FakeFetch::ok(body)), true);

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));
        dispatcher.on_remote_result(rx.recv().await.unwrap());

        assert_eq!(
            sink.texts(),
            vec!["alice :is connecting from an unknown location".to_string()]
        );
        assert!(dispatcher.cache().is_empty());
    }

    #[tokio::test]
    async fn test_remote_transport_failure_is_silent() {
        let sink = RecordingSink::with_live(&[1]);
        let fetch = Arc::new(FakeFetch::with_reply(Err(GeoError::TransportFailure(
            "connection refused".to_string(),
        ))));
        let (dispatcher, mut rx) = remote_dispatcher(sink.clone(), fetch, true);

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));
        assert_eq!(dispatcher.on_remote_result(rx.recv().await.unwrap()), 0);
        assert!(sink.lines().is_empty());
        assert!(dispatcher.cache().is_empty());
        assert_eq!(dispatcher.inflight_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_destination_is_dropped() {
        let sink = RecordingSink::with_live(&[1]);
        let fetch = Arc::new(FakeFetch::ok(PARIS_BODY).delayed(Duration::from_millis(50)));
        let (dispatcher, mut rx) = remote_dispatcher(sink.clone(), fetch, true);

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));
        sink.disconnect(1);

        assert_eq!(dispatcher.on_remote_result(rx.recv().await.unwrap()), 0);
        assert!(sink.lines().is_empty());
        // The answer is still worth keeping
        assert_eq!(dispatcher.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_misses_are_coalesced() {
        let sink = RecordingSink::with_live(&[1, 2]);
        let fetch = Arc::new(FakeFetch::ok(PARIS_BODY).delayed(Duration::from_millis(50)));
        let (dispatcher, mut rx) = remote_dispatcher(sink.clone(), fetch.clone(), true);

        assert_eq!(
            dispatcher.enrich(&request(1, "alice", Some("203.0.113.5"))),
            EnrichOutcome::Pending
        );
        assert_eq!(
            dispatcher.enrich(&request(2, "alice", Some("203.0.113.5"))),
            EnrichOutcome::Coalesced
        );
        assert_eq!(dispatcher.inflight_len(), 1);

        assert_eq!(dispatcher.on_remote_result(rx.recv().await.unwrap()), 2);
        assert_eq!(fetch.calls(), 1);

        let destinations: Vec<ClientId> = sink.lines().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(destinations, vec![ClientId(1), ClientId(2)]);
    }

    #[tokio::test]
    async fn test_without_coalescing_each_miss_goes_remote() {
        let sink = RecordingSink::with_live(&[1, 2]);
        let fetch = Arc::new(FakeFetch::ok(PARIS_BODY).delayed(Duration::from_millis(20)));
        let (dispatcher, mut rx) = remote_dispatcher(sink.clone(), fetch.clone(), false);

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));
        dispatcher.enrich(&request(2, "alice", Some("203.0.113.5")));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(dispatcher.on_remote_result(first), 1);
        assert_eq!(dispatcher.on_remote_result(second), 1);
        assert_eq!(fetch.calls(), 2);
        assert_eq!(dispatcher.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_loop_delivers() {
        let sink = RecordingSink::with_live(&[1]);
        let (dispatcher, rx) =
            remote_dispatcher(sink.clone(), Arc::new(FakeFetch::ok(PARIS_BODY)), true);
        let completion_loop = dispatcher.spawn_completion_loop(rx);

        dispatcher.enrich(&request(1, "alice", Some("203.0.113.5")));

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.lines().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.texts(), vec![PARIS_LINE.to_string()]);
        completion_loop.abort();
    }

    #[test]
    fn test_ipv6_spellings_share_cache_entry() {
        let sink = RecordingSink::with_live(&[1]);
        let dispatcher = local_dispatcher(sink.clone());

        dispatcher.enrich(&request(1, "dave", Some("2001:DB8::1")));
        assert_eq!(
            dispatcher.enrich(&request(1, "dave", Some("2001:db8:0::1"))),
            EnrichOutcome::CacheHit
        );
        assert_eq!(dispatcher.cache().len(), 1);
    }
}
