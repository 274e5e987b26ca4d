// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process wiring: configuration, logging, collaborator construction, the
//! reaper task, and the HTTP bind.

use crate::account::{AccountStore, FileAccountStore, MemoryAccountStore};
use crate::app::App;
use crate::auth::{AuthConfig, AuthPipeline, HANDOFF_TIMEOUT};
use crate::entitlement::EntitlementVerifier;
use crate::front;
use crate::front::promos::{default_promos, FilePromoSource, PromoSource, StaticPromoSource};
use crate::identity::{IdentityResolver, DEFAULT_LOOKUP_TIMEOUT};
use crate::metrics::MasterMetrics;
use crate::options::Options;
use crate::pdata::{FilePdataStore, JsonPdataCodec, MemoryPdataStore, PdataStore};
use crate::registry::{Lifecycle, RegistryLimits, ServerRegistry};
use crate::udp::UdpControl;
use server_util::rate_limiter::{IpRateLimiter, RateLimit};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use structopt::StructOpt;

/// How often gone registry entries are swept.
const REAP_PERIOD: Duration = Duration::from_secs(5 * 60);

pub fn entry_point() {
    let options = Options::from_args();

    let mut logger = env_logger::builder();
    logger.format_timestamp(None);
    logger.filter_level(log::LevelFilter::Warn);
    logger.filter_module("master_server", options.debug_core);
    logger.filter_module("master_server::front", options.debug_http);
    logger.filter_module("master_server::udp", options.debug_udp);
    logger.filter_module("server_util", options.debug_core);
    logger.init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");
    runtime.block_on(run(options));
}

async fn run(options: Options) {
    if options.insecure_no_check_player_auth {
        log::warn!("player auth checks are DISABLED; do not expose this instance publicly");
    }

    let registry = Arc::new(ServerRegistry::new(
        Lifecycle {
            dead_time: Duration::from_secs(options.dead_time),
            ghost_time: Duration::from_secs(options.ghost_time),
        },
        Duration::from_secs(options.verify_time),
        options.allow_gameserver_ipv6,
    ));
    let limits = RegistryLimits {
        max_servers: options.max_servers,
        max_servers_per_ip: options.max_servers_per_ip,
    };

    let accounts: Arc<dyn AccountStore> = match &options.accounts_dir {
        Some(dir) => Arc::new(
            FileAccountStore::open(dir)
                .await
                .expect("failed to open accounts directory"),
        ),
        None => {
            log::warn!("no --accounts-dir set; accounts are in-memory and lost on restart");
            Arc::new(MemoryAccountStore::new())
        }
    };
    let pdata: Arc<dyn PdataStore> = match &options.pdata_dir {
        Some(dir) => Arc::new(
            FilePdataStore::open(dir)
                .await
                .expect("failed to open pdata directory"),
        ),
        None => {
            log::warn!("no --pdata-dir set; player data is in-memory and lost on restart");
            Arc::new(MemoryPdataStore::new())
        }
    };
    let promos: Arc<dyn PromoSource> = match &options.promos_file {
        Some(path) => Arc::new(FilePromoSource::new(path)),
        None => Arc::new(StaticPromoSource(default_promos())),
    };

    let udp = UdpControl::spawn(SocketAddr::from(([0, 0, 0, 0], options.udp_port)))
        .await
        .expect("failed to bind udp control socket");

    // Per-request timeouts are set at the call sites; identity lookups get a
    // dedicated client with the longer budget.
    let http = reqwest::Client::builder()
        .build()
        .expect("failed to build http client");
    let identity_http = reqwest::Client::builder()
        .timeout(DEFAULT_LOOKUP_TIMEOUT)
        .build()
        .expect("failed to build http client");

    let identity = IdentityResolver::new(
        options.username_source,
        identity_http,
        options.origin_lookup_url.clone(),
        options.eax_lookup_url.clone(),
    );
    let entitlement = if options.insecure_no_check_player_auth {
        EntitlementVerifier::insecure(http.clone(), options.entitlement_url.clone())
    } else {
        EntitlementVerifier::new(http.clone(), options.entitlement_url.clone())
    };

    let pipeline = AuthPipeline::new(
        accounts.clone(),
        pdata.clone(),
        registry.clone(),
        identity,
        entitlement,
        udp.clone(),
        http.clone(),
        AuthConfig {
            token_expiry: Duration::from_secs(options.token_expiry),
            minimum_launcher_version: options.minimum_launcher_version,
            insecure_no_check_player_auth: options.insecure_no_check_player_auth,
            handoff_timeout: HANDOFF_TIMEOUT,
        },
    );

    let auth_rate = if options.auth_rate_period == 0 {
        RateLimit::unlimited()
    } else {
        RateLimit::new(
            Duration::from_secs(options.auth_rate_period),
            options.auth_rate_burst,
        )
    };

    let app = Arc::new(App {
        registry: registry.clone(),
        accounts,
        pdata,
        codec: Arc::new(JsonPdataCodec),
        promos,
        pipeline,
        udp,
        limits,
        verify_time: Duration::from_secs(options.verify_time),
        http,
        auth_limiter: Mutex::new(IpRateLimiter::new(auth_rate)),
        metrics: MasterMetrics::new(),
        started: Instant::now(),
    });

    tokio::spawn(async move {
        let mut governor = tokio::time::interval(REAP_PERIOD);
        // The immediate first tick has nothing to reap.
        governor.tick().await;
        loop {
            governor.tick().await;
            registry.reap();
        }
    });

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested, draining connections");
            shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], options.http_port));
    log::info!("master server listening on {}", addr);
    let served = axum_server::bind(addr)
        .handle(handle)
        .serve(front::router(app).into_make_service_with_connect_info::<SocketAddr>())
        .await;
    if let Err(e) = served {
        log::error!("http server stopped: {}", e);
    }
}
