// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::identity::UsernameSource;
use crate::version::LauncherVersion;
use log::LevelFilter;
use structopt::StructOpt;

/// Server options, to be specified as arguments.
#[derive(Debug, StructOpt)]
pub struct Options {
    /// HTTP listen port.
    #[structopt(long, default_value = "8080")]
    pub http_port: u16,
    /// UDP control listen port.
    #[structopt(long, default_value = "8081")]
    pub udp_port: u16,
    /// Total registered-server cap. Negative disables.
    #[structopt(long, default_value = "1000")]
    pub max_servers: i64,
    /// Registered-server cap per source IP. -1 disables.
    #[structopt(long, default_value = "25")]
    pub max_servers_per_ip: i64,
    /// Seconds without a heartbeat before a server stops being listed.
    /// 0 keeps servers listed until ghost-time.
    #[structopt(long, default_value = "30")]
    pub dead_time: u64,
    /// Seconds without a heartbeat before a server's entry is freed for
    /// reuse. 0 disables the ghost stage.
    #[structopt(long, default_value = "120")]
    pub ghost_time: u64,
    /// Seconds a new registration has to pass reachability verification.
    #[structopt(long, default_value = "10")]
    pub verify_time: u64,
    /// Session token lifetime in seconds.
    #[structopt(long, default_value = "86400")]
    pub token_expiry: u64,
    /// DANGER: accept any entitlement token and skip session validation.
    /// Development only.
    #[structopt(long)]
    pub insecure_no_check_player_auth: bool,
    /// Accept game servers registering from IPv6 addresses.
    #[structopt(long)]
    pub allow_gameserver_ipv6: bool,
    /// Oldest launcher version allowed, e.g. 1.10.0. Unset disables the
    /// gate.
    #[structopt(long)]
    pub minimum_launcher_version: Option<LauncherVersion>,
    /// Username lookup policy: none, origin, origin-eax, origin-eax-debug,
    /// eax, or eax-origin.
    #[structopt(long, default_value = "origin-eax")]
    pub username_source: UsernameSource,
    /// Directory for player profile blobs. In-memory storage when unset.
    #[structopt(long)]
    pub pdata_dir: Option<String>,
    /// Directory for account records. In-memory storage when unset.
    #[structopt(long)]
    pub accounts_dir: Option<String>,
    /// JSON file served as /client/mainmenupromos.
    #[structopt(long)]
    pub promos_file: Option<String>,
    /// Entitlement upstream base URL.
    #[structopt(long, default_value = "https://r2-pc.stryder.respawn.com")]
    pub entitlement_url: String,
    /// Origin identity API base URL.
    #[structopt(long, default_value = "https://api1.origin.com")]
    pub origin_lookup_url: String,
    /// EAX identity API base URL.
    #[structopt(long, default_value = "https://service-aggregation-layer.juno.ea.com")]
    pub eax_lookup_url: String,
    /// Authentication attempts allowed per IP within one rate period.
    #[structopt(long, default_value = "16")]
    pub auth_rate_burst: u32,
    /// Authentication rate period in seconds. 0 disables rate limiting.
    #[structopt(long, default_value = "30")]
    pub auth_rate_period: u64,
    /// Log incoming HTTP requests
    #[cfg_attr(debug_assertions, structopt(long, default_value = "debug"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_http: LevelFilter,
    /// Log core diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_core: LevelFilter,
    /// Log UDP control diagnostics
    #[cfg_attr(debug_assertions, structopt(long, default_value = "info"))]
    #[cfg_attr(not(debug_assertions), structopt(long, default_value = "warn"))]
    pub debug_udp: LevelFilter,
}
