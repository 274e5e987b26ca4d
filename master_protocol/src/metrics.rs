// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Small self-aggregating metrics, serialized with short field names so
//! frames stay cheap to snapshot and ship.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::Add;

pub trait Metric: Sized + Add<Output = Self> + Default {
    type Summary: Serialize + DeserializeOwned;

    fn summarize(&self) -> Self::Summary;
}

/// Counts events.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DiscreteMetric {
    #[serde(rename = "t")]
    pub total: u64,
}

impl DiscreteMetric {
    pub fn increment(&mut self) {
        self.add_multiple(1);
    }

    pub fn add_multiple(&mut self, amount: u64) {
        self.total = self.total.saturating_add(amount);
    }

    pub fn add_length(&mut self, amount: usize) {
        self.add_multiple(amount as u64);
    }
}

impl Metric for DiscreteMetric {
    type Summary = u64;

    fn summarize(&self) -> Self::Summary {
        self.total
    }
}

impl Add for DiscreteMetric {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            total: self.total.saturating_add(rhs.total),
        }
    }
}

/// Tracks how much of a population satisfies a condition.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RatioMetric {
    /// Population size.
    #[serde(rename = "t")]
    pub total: u64,
    /// How many satisfied the condition.
    #[serde(rename = "c")]
    pub count: u64,
}

impl RatioMetric {
    pub fn push(&mut self, condition: bool) {
        self.total = self.total.saturating_add(1);
        if condition {
            self.count = self.count.saturating_add(1);
        }
    }

    /// Percent in `[0, 100]`, or zero for an empty population.
    fn percent(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.count as f32 * 100.0 / self.total as f32
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct RatioMetricSummary {
    pub percent: f32,
    pub total: u64,
}

impl Metric for RatioMetric {
    type Summary = RatioMetricSummary;

    fn summarize(&self) -> Self::Summary {
        RatioMetricSummary {
            percent: self.percent(),
            total: self.total,
        }
    }
}

impl Add for RatioMetric {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            total: self.total.saturating_add(rhs.total),
            count: self.count.saturating_add(rhs.count),
        }
    }
}

/// Tracks the spread and mean of a continuous sample, e.g. a latency.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousMetric {
    #[serde(rename = "c")]
    pub count: u64,
    #[serde(rename = "s")]
    pub sum: f64,
    #[serde(rename = "l")]
    pub min: f64,
    #[serde(rename = "h")]
    pub max: f64,
}

impl ContinuousMetric {
    pub fn push(&mut self, sample: f64) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count = self.count.saturating_add(1);
        self.sum += sample;
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ContinuousMetricSummary {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Metric for ContinuousMetric {
    type Summary = ContinuousMetricSummary;

    fn summarize(&self) -> Self::Summary {
        ContinuousMetricSummary {
            count: self.count,
            mean: if self.count == 0 {
                0.0
            } else {
                self.sum / self.count as f64
            },
            min: self.min,
            max: self.max,
        }
    }
}

impl Add for ContinuousMetric {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        if self.count == 0 {
            rhs
        } else if rhs.count == 0 {
            self
        } else {
            Self {
                count: self.count.saturating_add(rhs.count),
                sum: self.sum + rhs.sum,
                min: self.min.min(rhs.min),
                max: self.max.max(rhs.max),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_counts_and_saturates() {
        let mut metric = DiscreteMetric::default();
        metric.increment();
        metric.add_multiple(41);
        assert_eq!(metric.summarize(), 42);

        metric.add_multiple(u64::MAX);
        assert_eq!(metric.summarize(), u64::MAX);
    }

    #[test]
    fn ratio_percent() {
        let mut metric = RatioMetric::default();
        assert_eq!(metric.summarize().percent, 0.0);
        metric.push(true);
        metric.push(true);
        metric.push(false);
        metric.push(true);
        let summary = metric.summarize();
        assert_eq!(summary.total, 4);
        assert!((summary.percent - 75.0).abs() < f32::EPSILON);
    }

    #[test]
    fn continuous_tracks_spread() {
        let mut metric = ContinuousMetric::default();
        for sample in [250.0, 750.0, 500.0] {
            metric.push(sample);
        }
        let summary = metric.summarize();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, 250.0);
        assert_eq!(summary.max, 750.0);
        assert_eq!(summary.mean, 500.0);
    }

    #[test]
    fn addition_merges_frames() {
        let mut a = ContinuousMetric::default();
        a.push(1.0);
        let mut b = ContinuousMetric::default();
        b.push(9.0);
        b.push(5.0);
        let merged = a + b;
        assert_eq!(merged.summarize().count, 3);
        assert_eq!(merged.summarize().min, 1.0);
        assert_eq!(merged.summarize().max, 9.0);

        // Empty frames are identity elements.
        let merged = ContinuousMetric::default() + merged;
        assert_eq!(merged.summarize().count, 3);

        let mut x = RatioMetric::default();
        x.push(true);
        let mut y = RatioMetric::default();
        y.push(false);
        assert_eq!((x + y).summarize().total, 2);
    }

    #[test]
    fn short_wire_names() {
        let mut metric = DiscreteMetric::default();
        metric.increment();
        assert_eq!(serde_json::to_string(&metric).unwrap(), r#"{"t":1}"#);
        let mut ratio = RatioMetric::default();
        ratio.push(true);
        assert_eq!(serde_json::to_string(&ratio).unwrap(), r#"{"t":1,"c":1}"#);
    }
}
