//! Prometheus-backed metrics sink
//!
//! Each instance owns its own registry; metric vectors are created on first
//! use, keyed by metric name and the sorted set of tag keys.

use super::MetricsSink;
use dashmap::DashMap;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;

/// Prometheus implementation of [`MetricsSink`]
pub struct PrometheusMetrics {
    registry: Registry,
    counters: DashMap<String, Option<CounterVec>>,
    histograms: DashMap<String, Option<HistogramVec>>,
}

impl PrometheusMetrics {
    /// Create a sink whose metric names are prefixed with `namespace`
    pub fn new(namespace: &str) -> Self {
        Self::with_default_tags(namespace, HashMap::new())
    }

    /// Create a sink that attaches `default_tags` to every metric
    pub fn with_default_tags(namespace: &str, default_tags: HashMap<String, String>) -> Self {
        let prefix = (!namespace.is_empty()).then(|| namespace.to_string());
        let labels = (!default_tags.is_empty()).then_some(default_tags);

        let registry = Registry::new_custom(prefix, labels).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid metrics namespace or default tags, using bare registry");
            Registry::new()
        });

        Self {
            registry,
            counters: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// Underlying registry, for hosts that expose it themselves
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();

        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }

    fn counter(&self, name: &str, keys: &[&str]) -> Option<CounterVec> {
        let key = vector_key(name, keys);
        if let Some(existing) = self.counters.get(&key) {
            return existing.clone();
        }

        let created = CounterVec::new(Opts::new(name, name), keys)
            .and_then(|vec| self.registry.register(Box::new(vec.clone())).map(|_| vec))
            .map_err(|e| tracing::debug!(metric = name, error = %e, "Counter registration failed"))
            .ok();

        self.counters.entry(key).or_insert(created).clone()
    }

    fn histogram(&self, name: &str, keys: &[&str]) -> Option<HistogramVec> {
        let key = vector_key(name, keys);
        if let Some(existing) = self.histograms.get(&key) {
            return existing.clone();
        }

        let created = HistogramVec::new(HistogramOpts::new(name, name), keys)
            .and_then(|vec| self.registry.register(Box::new(vec.clone())).map(|_| vec))
            .map_err(|e| tracing::debug!(metric = name, error = %e, "Histogram registration failed"))
            .ok();

        self.histograms.entry(key).or_insert(created).clone()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn inc_with_tags(&self, name: &str, delta: u64, tags: &[(&str, &str)]) {
        let (keys, values) = split_tags(tags);
        if let Some(counter) = self.counter(name, &keys) {
            if let Ok(metric) = counter.get_metric_with_label_values(&values) {
                metric.inc_by(delta as f64);
            }
        }
    }

    fn observe_with_tags(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let (keys, values) = split_tags(tags);
        if let Some(histogram) = self.histogram(name, &keys) {
            if let Ok(metric) = histogram.get_metric_with_label_values(&values) {
                metric.observe(value);
            }
        }
    }
}

/// Sort by key and drop repeated keys (first wins)
fn split_tags<'a>(tags: &[(&'a str, &'a str)]) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut sorted: Vec<(&str, &str)> = tags.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted.dedup_by(|later, earlier| later.0 == earlier.0);
    sorted.into_iter().unzip()
}

fn vector_key(name: &str, keys: &[&str]) -> String {
    format!("{}|{}", name, keys.join(","))
}
