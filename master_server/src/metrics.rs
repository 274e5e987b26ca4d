// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Operational counters for the service, aggregated in-process and exposed
//! through `/status`.

use master_protocol::metrics::{
    ContinuousMetric, ContinuousMetricSummary, DiscreteMetric, Metric, RatioMetric,
    RatioMetricSummary,
};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Frame {
    /// Authentication attempts, counting successes.
    authenticates: RatioMetric,
    /// Join attempts, counting successes.
    joins: RatioMetric,
    /// Wall time of each join attempt, dominated by the hand-off.
    join_millis: ContinuousMetric,
    /// Registration attempts reaching verification, counting promotions.
    registrations: RatioMetric,
    /// UDP hand-off verdicts deposited via the HTTP callback.
    connect_deposits: DiscreteMetric,
    pdata_uploads: DiscreteMetric,
    pdata_upload_bytes: DiscreteMetric,
}

pub struct MasterMetrics {
    frame: Mutex<Frame>,
}

impl MasterMetrics {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(Frame::default()),
        }
    }

    pub fn push_authenticate(&self, success: bool) {
        self.frame.lock().unwrap().authenticates.push(success);
    }

    pub fn push_join(&self, success: bool, elapsed: Duration) {
        let mut frame = self.frame.lock().unwrap();
        frame.joins.push(success);
        frame.join_millis.push(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn push_registration(&self, verified: bool) {
        self.frame.lock().unwrap().registrations.push(verified);
    }

    pub fn push_connect_deposit(&self) {
        self.frame.lock().unwrap().connect_deposits.increment();
    }

    pub fn push_pdata_upload(&self, bytes: usize) {
        let mut frame = self.frame.lock().unwrap();
        frame.pdata_uploads.increment();
        frame.pdata_upload_bytes.add_length(bytes);
    }

    pub fn summarize(&self) -> MetricsSummaryDto {
        let frame = self.frame.lock().unwrap();
        MetricsSummaryDto {
            authenticates: frame.authenticates.summarize(),
            joins: frame.joins.summarize(),
            join_millis: frame.join_millis.summarize(),
            registrations: frame.registrations.summarize(),
            connect_deposits: frame.connect_deposits.summarize(),
            pdata_uploads: frame.pdata_uploads.summarize(),
            pdata_upload_bytes: frame.pdata_upload_bytes.summarize(),
        }
    }
}

impl Default for MasterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummaryDto {
    pub authenticates: RatioMetricSummary,
    pub joins: RatioMetricSummary,
    pub join_millis: ContinuousMetricSummary,
    pub registrations: RatioMetricSummary,
    pub connect_deposits: u64,
    pub pdata_uploads: u64,
    pub pdata_upload_bytes: u64,
}
