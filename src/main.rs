/*
 * WHOIS Geo - geolocation enrichment for WHOIS replies
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use whois_geo::config::{Cli, SourceConfig, load_config};
use whois_geo::core::logger::init_from_args;
use whois_geo::server::{ClientRegistry, ConnectionContext, run_async_server};
use whois_geo::services::geo::{
    LocalLookupSource, RemoteLookupSource, ReqwestFetch, completion_channel, spawn_sweeper,
};
use whois_geo::services::{EnrichmentDispatcher, GeoCache, LookupStrategy};
use whois_geo::{
    log_error, log_info, log_init_failed, log_init_ok, log_init_ok_with_details, log_init_start,
    log_init_warn,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if let Err(e) = init_from_args(args.debug, args.trace, args.journald) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    log_init_start!("configuration");
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log_init_failed!("configuration", &e.to_string());
            std::process::exit(1);
        }
    };
    log_init_ok!("configuration");

    let cache = Arc::new(GeoCache::new(config.geo.cache_ttl));
    if let Some(ref path) = config.geo.cache_file {
        if let Err(e) = cache.load_from_file(path).await {
            log_init_warn!("geo cache", &format!("snapshot not restored: {}", e));
        }
    }

    let registry = Arc::new(ClientRegistry::new(config.server.name.clone()));

    log_init_start!("geolocation source");
    let mut completions = None;
    let strategy = match config.geo.source {
        SourceConfig::Local { ref database_path } => {
            let local = Arc::new(LocalLookupSource::new());
            if let Err(e) = local.open(database_path) {
                log_init_failed!("geolocation source", &e.to_string());
                std::process::exit(1);
            }
            log_init_ok_with_details!(
                "geolocation source",
                &format!("local database {}", database_path.display())
            );
            LookupStrategy::Local(local)
        }
        SourceConfig::Remote(ref settings) => {
            let (tx, rx) = completion_channel();
            let source = ReqwestFetch::new(settings.timeout).and_then(|transport| {
                RemoteLookupSource::new(settings.clone(), Arc::new(transport), tx)
            });
            let source = match source {
                Ok(source) => source,
                Err(e) => {
                    log_init_failed!("geolocation source", &e.to_string());
                    std::process::exit(1);
                }
            };
            completions = Some(rx);
            log_init_ok_with_details!(
                "geolocation source",
                &format!("remote {}", settings.endpoint)
            );
            LookupStrategy::Remote(Arc::new(source))
        }
    };

    let dispatcher = Arc::new(EnrichmentDispatcher::new(
        cache.clone(),
        strategy,
        registry.clone(),
        config.geo.coalesce_inflight,
    ));
    if let Some(rx) = completions {
        dispatcher.spawn_completion_loop(rx);
    }
    log_info!(
        "Geo enrichment using {} lookups, cache TTL {:?}",
        dispatcher.strategy().name(),
        cache.ttl()
    );
    if let Some(interval) = config.geo.sweep_interval {
        spawn_sweeper(cache.clone(), interval);
        log_info!("Geo cache sweep every {:?}", interval);
    }

    let ctx = Arc::new(ConnectionContext {
        registry,
        dispatcher: dispatcher.clone(),
        oper_networks: config.server.oper_networks.clone(),
        idle_timeout: Duration::from_secs(args.timeout),
    });

    let addr = format!("{}:{}", args.host, args.port);
    log_info!("Starting WHOIS geo server {} on {}", config.server.name, addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log_error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    let served = run_async_server(&addr, args.max_connections, ctx, shutdown).await;

    if let Some(ref path) = config.geo.cache_file {
        if let Err(e) = cache.save_to_file(path).await {
            log_error!("Failed to save geo cache: {}", e);
        }
    }
    dispatcher.shutdown();
    log_info!("Shutdown complete");

    served
}
