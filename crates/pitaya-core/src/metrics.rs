//! Dispatch metrics and user-declared custom metrics.
//!
//! [`Metrics`] holds labelled counters and histograms. Two are always
//! present and fed by the dispatcher:
//!
//! - `requests` (`pitaya_dispatcher_requests_total`): one increment per
//!   dispatched request, labelled by route, rpc type and response code.
//! - `handler_duration` (`pitaya_dispatcher_handler_duration_seconds`):
//!   dispatch latency in seconds, labelled by route and response code.
//!
//! Applications declare their own metrics up front with [`CustomMetrics`]
//! and record them by short name through [`Metrics::inc_counter`] and
//! [`Metrics::observe_hist`]. Everything can be rendered in the Prometheus
//! text format with [`Metrics::export_prometheus`].

use std::collections::{BTreeMap, HashMap};

use tokio::sync::RwLock;

/// Built-in request counter.
pub const REQUESTS: &str = "requests";
/// Built-in dispatch latency histogram.
pub const HANDLER_DURATION: &str = "handler_duration";

/// Label value recorded for a successful response.
pub const CODE_OK: &str = "ok";

/// Buckets used when a histogram is declared without any.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("metric {0} is already registered")]
    Duplicate(String),

    #[error("unknown metric: {0}")]
    Unknown(String),

    #[error("metric {name} expects {expected} label values, got {got}")]
    LabelMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("histogram {0} has unsorted or non-finite buckets")]
    InvalidBuckets(String),
}

/// Declaration of one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub namespace: String,
    pub subsystem: String,
    /// Short name used when recording.
    pub name: String,
    pub help: String,
    /// Names of the labels every sample must provide, in order.
    pub labels: Vec<String>,
}

impl MetricSpec {
    pub fn new(
        namespace: impl Into<String>,
        subsystem: impl Into<String>,
        name: impl Into<String>,
        help: impl Into<String>,
        labels: &[&str],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            subsystem: subsystem.into(),
            name: name.into(),
            help: help.into(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// `namespace_subsystem_name`, skipping empty parts.
    pub fn full_name(&self) -> String {
        [&self.namespace, &self.subsystem, &self.name]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Metrics an application declares before the dispatcher starts.
#[derive(Debug, Clone, Default)]
pub struct CustomMetrics {
    counters: Vec<MetricSpec>,
    histograms: Vec<(MetricSpec, Vec<f64>)>,
}

impl CustomMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_counter(&mut self, spec: MetricSpec) -> &mut Self {
        self.counters.push(spec);
        self
    }

    /// Declare a histogram. Empty `buckets` means [`DEFAULT_BUCKETS`].
    pub fn add_hist(&mut self, spec: MetricSpec, buckets: &[f64]) -> &mut Self {
        self.histograms.push((spec, buckets.to_vec()));
        self
    }
}

#[derive(Debug)]
struct Counter {
    spec: MetricSpec,
    series: BTreeMap<Vec<String>, u64>,
}

#[derive(Debug)]
struct Histogram {
    spec: MetricSpec,
    buckets: Vec<f64>,
    series: BTreeMap<Vec<String>, HistogramSnapshot>,
}

/// Accumulated observations of one labelled histogram series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    /// Cumulative count per upper bound, in bucket order.
    pub buckets: Vec<(f64, u64)>,
}

impl HistogramSnapshot {
    fn empty(bounds: &[f64]) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            buckets: bounds.iter().map(|b| (*b, 0)).collect(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        for (bound, count) in self.buckets.iter_mut() {
            if value <= *bound {
                *count += 1;
            }
        }
    }
}

/// Counter and histogram registry shared by the dispatcher and handlers.
#[derive(Debug)]
pub struct Metrics {
    counters: RwLock<HashMap<String, Counter>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl Metrics {
    /// Built-in dispatch metrics only.
    pub fn new() -> Self {
        let (counters, histograms) = builtins();
        Self {
            counters: RwLock::new(counters),
            histograms: RwLock::new(histograms),
        }
    }

    /// Built-in metrics plus everything declared in `custom`.
    pub fn with_custom(custom: CustomMetrics) -> Result<Self, MetricsError> {
        let (mut counters, mut histograms) = builtins();

        for spec in custom.counters {
            if counters.contains_key(&spec.name) || histograms.contains_key(&spec.name) {
                return Err(MetricsError::Duplicate(spec.name));
            }
            tracing::debug!("[Metrics] Registered counter {}", spec.full_name());
            counters.insert(
                spec.name.clone(),
                Counter {
                    spec,
                    series: BTreeMap::new(),
                },
            );
        }
        for (spec, buckets) in custom.histograms {
            if counters.contains_key(&spec.name) || histograms.contains_key(&spec.name) {
                return Err(MetricsError::Duplicate(spec.name));
            }
            let buckets = if buckets.is_empty() {
                DEFAULT_BUCKETS.to_vec()
            } else {
                buckets
            };
            let sorted = buckets.windows(2).all(|w| w[0] < w[1]);
            if !sorted || buckets.iter().any(|b| !b.is_finite()) {
                return Err(MetricsError::InvalidBuckets(spec.name));
            }
            tracing::debug!("[Metrics] Registered histogram {}", spec.full_name());
            histograms.insert(
                spec.name.clone(),
                Histogram {
                    spec,
                    buckets,
                    series: BTreeMap::new(),
                },
            );
        }

        Ok(Self {
            counters: RwLock::new(counters),
            histograms: RwLock::new(histograms),
        })
    }

    pub async fn inc_counter(&self, name: &str, labels: &[&str]) -> Result<(), MetricsError> {
        let mut counters = self.counters.write().await;
        let counter = counters
            .get_mut(name)
            .ok_or_else(|| MetricsError::Unknown(name.to_string()))?;
        let key = series_key(&counter.spec, labels)?;
        *counter.series.entry(key).or_insert(0) += 1;
        Ok(())
    }

    pub async fn observe_hist(
        &self,
        name: &str,
        value: f64,
        labels: &[&str],
    ) -> Result<(), MetricsError> {
        let mut histograms = self.histograms.write().await;
        let histogram = histograms
            .get_mut(name)
            .ok_or_else(|| MetricsError::Unknown(name.to_string()))?;
        let key = series_key(&histogram.spec, labels)?;
        let bounds = &histogram.buckets;
        histogram
            .series
            .entry(key)
            .or_insert_with(|| HistogramSnapshot::empty(bounds))
            .observe(value);
        Ok(())
    }

    /// Current value of one counter series; `None` if never incremented.
    pub async fn counter_value(&self, name: &str, labels: &[&str]) -> Option<u64> {
        let counters = self.counters.read().await;
        let key: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        counters.get(name)?.series.get(&key).copied()
    }

    pub async fn histogram_snapshot(
        &self,
        name: &str,
        labels: &[&str],
    ) -> Option<HistogramSnapshot> {
        let histograms = self.histograms.read().await;
        let key: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        histograms.get(name)?.series.get(&key).cloned()
    }

    /// Render every metric in the Prometheus text exposition format.
    pub async fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().await;
        let mut names: Vec<&String> = counters.keys().collect();
        names.sort();
        for name in names {
            let counter = &counters[name];
            let full = counter.spec.full_name();
            output.push_str(&format!("# HELP {} {}\n", full, counter.spec.help));
            output.push_str(&format!("# TYPE {} counter\n", full));
            for (values, count) in &counter.series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    full,
                    format_labels(&counter.spec.labels, values, None),
                    count
                ));
            }
        }

        let histograms = self.histograms.read().await;
        let mut names: Vec<&String> = histograms.keys().collect();
        names.sort();
        for name in names {
            let histogram = &histograms[name];
            let full = histogram.spec.full_name();
            let labels = &histogram.spec.labels;
            output.push_str(&format!("# HELP {} {}\n", full, histogram.spec.help));
            output.push_str(&format!("# TYPE {} histogram\n", full));
            for (values, snapshot) in &histogram.series {
                for (bound, count) in &snapshot.buckets {
                    let le = bound.to_string();
                    output.push_str(&format!(
                        "{}_bucket{} {}\n",
                        full,
                        format_labels(labels, values, Some(&le)),
                        count
                    ));
                }
                output.push_str(&format!(
                    "{}_bucket{} {}\n",
                    full,
                    format_labels(labels, values, Some("+Inf")),
                    snapshot.count
                ));
                let plain = format_labels(labels, values, None);
                output.push_str(&format!("{}_sum{} {}\n", full, plain, snapshot.sum));
                output.push_str(&format!("{}_count{} {}\n", full, plain, snapshot.count));
            }
        }

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn builtins() -> (HashMap<String, Counter>, HashMap<String, Histogram>) {
    let mut counters = HashMap::new();
    counters.insert(
        REQUESTS.to_string(),
        Counter {
            spec: MetricSpec::new(
                "pitaya",
                "dispatcher",
                "requests_total",
                "Dispatched requests by route, rpc type and response code",
                &["route", "type", "code"],
            ),
            series: BTreeMap::new(),
        },
    );
    let mut histograms = HashMap::new();
    histograms.insert(
        HANDLER_DURATION.to_string(),
        Histogram {
            spec: MetricSpec::new(
                "pitaya",
                "dispatcher",
                "handler_duration_seconds",
                "Dispatch latency by route and response code",
                &["route", "code"],
            ),
            buckets: DEFAULT_BUCKETS.to_vec(),
            series: BTreeMap::new(),
        },
    );
    (counters, histograms)
}

fn series_key(spec: &MetricSpec, labels: &[&str]) -> Result<Vec<String>, MetricsError> {
    if labels.len() != spec.labels.len() {
        return Err(MetricsError::LabelMismatch {
            name: spec.name.clone(),
            expected: spec.labels.len(),
            got: labels.len(),
        });
    }
    Ok(labels.iter().map(|l| l.to_string()).collect())
}

fn format_labels(names: &[String], values: &[String], le: Option<&str>) -> String {
    let mut pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, escape(value)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{}\"", le));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
