use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Histograms keep this many most recent observations.
const HISTOGRAM_WINDOW: usize = 4096;

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Can go up or down. Stored as f64 bits.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0f64.to_bits() as i64),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn add(&self, delta: f64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next = f64::from_bits(current as u64) + delta;
                Some(next.to_bits() as i64)
            });
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

struct Histogram {
    observations: Mutex<VecDeque<f64>>,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
            count: AtomicU64::new(0),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs: Vec<f64> = self.observations.lock().iter().copied().collect();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = obs.len();
        let at = |q: f64| obs[((n as f64 * q) as usize).min(n - 1)];
        HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            sum: obs.iter().sum(),
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Percentiles over the retained observation window. `count` is lifetime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramSample {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub summary: HistogramSummary,
}

/// Point-in-time view of every metric, sorted by name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<MetricSample>,
    pub gauges: Vec<MetricSample>,
    pub histograms: Vec<HistogramSample>,
}

/// Thread-safe in-process metrics registry.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.increment(n);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.set(value);
            return;
        }
        self.gauges.write().entry(key).or_insert_with(Gauge::new).set(value);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.add(delta);
            return;
        }
        self.gauges.write().entry(key).or_insert_with(Gauge::new).add(delta);
    }

    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, Counter::get)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0.0, Gauge::get)
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<MetricSample> = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| MetricSample {
                name: k.name.clone(),
                labels: k.label_map(),
                value: c.get() as f64,
            })
            .collect();
        let mut gauges: Vec<MetricSample> = self
            .gauges
            .read()
            .iter()
            .map(|(k, g)| MetricSample {
                name: k.name.clone(),
                labels: k.label_map(),
                value: g.get(),
            })
            .collect();
        let mut histograms: Vec<HistogramSample> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| HistogramSample {
                name: k.name.clone(),
                labels: k.label_map(),
                summary: h.summary(),
            })
            .collect();

        counters.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        gauges.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));
        histograms.sort_by(|a, b| (&a.name, &a.labels).cmp(&(&b.name, &b.labels)));

        MetricsSnapshot {
            counters,
            gauges,
            histograms,
        }
    }
}
