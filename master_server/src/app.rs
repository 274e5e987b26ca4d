// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::account::AccountStore;
use crate::auth::AuthPipeline;
use crate::front::promos::PromoSource;
use crate::metrics::MasterMetrics;
use crate::pdata::{PdataCodec, PdataStore};
use crate::registry::{RegistryLimits, ServerRegistry};
use crate::udp::UdpControl;
use server_util::rate_limiter::IpRateLimiter;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Everything the HTTP front needs, shared across handlers.
pub struct App {
    pub registry: Arc<ServerRegistry>,
    pub accounts: Arc<dyn AccountStore>,
    pub pdata: Arc<dyn PdataStore>,
    pub codec: Arc<dyn PdataCodec>,
    pub promos: Arc<dyn PromoSource>,
    pub pipeline: AuthPipeline,
    pub udp: Arc<UdpControl>,
    pub limits: RegistryLimits,
    /// Budget for the post-registration verification round trip.
    pub verify_time: Duration,
    /// Client for `/verify` calls to game servers.
    pub http: reqwest::Client,
    pub auth_limiter: Mutex<IpRateLimiter>,
    pub metrics: MasterMetrics,
    pub started: Instant,
}
