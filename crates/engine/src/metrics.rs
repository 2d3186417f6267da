// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process counter/gauge registry with labelled series.
//!
//! Series emitted by the queue manager and worker supervisor:
//! `tm_queue_enqueued_total{flow}`, `tm_queue_acked_total{flow}`,
//! `tm_queue_idempo_hits_total{flow}`, `tm_queue_redelivered_total{flow}`,
//! `tm_retries_total{flow}`, `tm_dlq_total{flow,reason}`, and the gauges
//! `tm_queue_depth`, `tm_queue_inflight`, `tm_workers_live`.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

type SeriesKey = BTreeMap<String, String>;

#[derive(Default)]
struct RegistryInner {
    counters: HashMap<String, HashMap<SeriesKey, f64>>,
    gauges: HashMap<String, HashMap<SeriesKey, f64>>,
}

/// Point-in-time view of every series.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, Vec<(Vec<(String, String)>, f64)>>,
    pub gauges: HashMap<String, Vec<(Vec<(String, String)>, f64)>>,
}

/// Labelled counter and gauge table.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

fn series_key(labels: &[(&str, &str)]) -> SeriesKey {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut inner = self.inner.lock();
        *inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(series_key(labels))
            .or_insert(0.0) += delta;
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock();
        inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .insert(series_key(labels), value);
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut inner = self.inner.lock();
        *inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .entry(series_key(labels))
            .or_insert(0.0) += delta;
    }

    /// Counter value for an exact label set (0 when absent).
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock();
        inner
            .counters
            .get(name)
            .and_then(|series| series.get(&series_key(labels)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Gauge value for an exact label set (0 when absent).
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock();
        inner
            .gauges
            .get(name)
            .and_then(|series| series.get(&series_key(labels)))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let collect = |table: &HashMap<String, HashMap<SeriesKey, f64>>| {
            table
                .iter()
                .map(|(name, series)| {
                    let entries = series
                        .iter()
                        .map(|(key, value)| {
                            (key.iter().map(|(k, v)| (k.clone(), v.clone())).collect(), *value)
                        })
                        .collect();
                    (name.clone(), entries)
                })
                .collect()
        };
        MetricsSnapshot {
            counters: collect(&inner.counters),
            gauges: collect(&inner.gauges),
        }
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
