// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::metrics::MetricsSummaryDto;
use serde::Serialize;
use std::sync::atomic::AtomicU64;

/// Handler panics caught at the HTTP boundary since startup.
pub static CAUGHT_PANICS: AtomicU64 = AtomicU64::new(0);

/// Payload of `/status`, for operators and uptime monitors.
#[derive(Clone, Debug, Serialize)]
pub struct StatusDto {
    pub uptime_secs: u64,
    pub alive_servers: usize,
    pub pending_servers: usize,
    pub dropped_datagrams: u64,
    pub caught_panics: u64,
    pub metrics: MetricsSummaryDto,
}
