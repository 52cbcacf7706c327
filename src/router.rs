//! Shapes collected metrics into backend payloads and enqueues them.

use std::collections::BTreeMap;
use std::sync::mpsc::SyncSender;

use thiserror::Error;

use crate::metric::{self, Metric, MetricDriver, ParseError};
use crate::payload::{Dimension, MackerelTarget, MetricDatum, MetricValue, PutMetricData, ServiceMetric};

/// Upper bound of data points in one time-series request.
pub const MAX_DATUMS_PER_REQUEST: usize = 20;

/// Prefix the metrics service requires for host custom metrics.
pub const HOST_METRIC_PREFIX: &str = "custom.";

/// The consumer of a delivery channel has gone away.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("delivery channel closed")]
pub struct DeliveryClosed;

/// Cuts `items` into consecutive windows of at most `limit` elements.
pub fn split_batches<T>(items: Vec<T>, limit: usize) -> Vec<Vec<T>> {
    let limit = limit.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(limit));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(limit).collect());
    }
    batches
}

/// One datum per dimension-set followed by an untagged one.
pub fn expand_dimensions(metric: &Metric, dimensions: &[Vec<Dimension>]) -> Vec<MetricDatum> {
    dimensions
        .iter()
        .cloned()
        .chain(std::iter::once(Vec::new()))
        .map(|dimensions| MetricDatum {
            name: metric.name.clone(),
            value: metric.value,
            timestamp: metric.timestamp,
            dimensions,
        })
        .collect()
}

/// Groups by namespace, fans out dimensions and batches each namespace.
pub fn time_series_batches(
    metrics: Vec<Metric>,
    dimensions: &[Vec<Dimension>],
) -> Vec<PutMetricData> {
    let mut by_namespace: BTreeMap<String, Vec<MetricDatum>> = BTreeMap::new();
    for metric in &metrics {
        by_namespace
            .entry(metric.namespace.clone())
            .or_default()
            .extend(expand_dimensions(metric, dimensions));
    }
    by_namespace
        .into_iter()
        .flat_map(|(namespace, data)| {
            split_batches(data, MAX_DATUMS_PER_REQUEST)
                .into_iter()
                .map(move |data| PutMetricData {
                    namespace: namespace.clone(),
                    data,
                })
        })
        .collect()
}

pub fn service_payload(metrics: Vec<Metric>, target: &MackerelTarget) -> ServiceMetric {
    let values = metrics
        .into_iter()
        .map(|m| MetricValue {
            name: match target {
                MackerelTarget::Host(_) if !m.name.starts_with(HOST_METRIC_PREFIX) => {
                    format!("{}{}", HOST_METRIC_PREFIX, m.name)
                }
                _ => m.name,
            },
            time: m.timestamp.timestamp(),
            value: m.value,
        })
        .collect();
    ServiceMetric {
        target: target.clone(),
        values,
    }
}

pub struct TimeSeriesDriver<'a> {
    pub dimensions: &'a [Vec<Dimension>],
    pub sender: &'a SyncSender<PutMetricData>,
}

impl MetricDriver for TimeSeriesDriver<'_> {
    fn parse_line(&self, line: &str) -> Result<Metric, ParseError> {
        metric::parse_namespaced(line)
    }

    fn enqueue(&self, metrics: Vec<Metric>) -> Result<(), DeliveryClosed> {
        for batch in time_series_batches(metrics, self.dimensions) {
            self.sender.send(batch).map_err(|_| DeliveryClosed)?;
        }
        Ok(())
    }
}

pub struct ServiceMetricsDriver<'a> {
    pub target: &'a MackerelTarget,
    pub sender: &'a SyncSender<ServiceMetric>,
}

impl MetricDriver for ServiceMetricsDriver<'_> {
    fn parse_line(&self, line: &str) -> Result<Metric, ParseError> {
        metric::parse_flat(line)
    }

    fn enqueue(&self, metrics: Vec<Metric>) -> Result<(), DeliveryClosed> {
        self.sender
            .send(service_payload(metrics, self.target))
            .map_err(|_| DeliveryClosed)
    }
}

/// The two destination drivers a metric plugin can be bound to.
pub enum Driver<'a> {
    TimeSeries(TimeSeriesDriver<'a>),
    ServiceMetrics(ServiceMetricsDriver<'a>),
}

impl MetricDriver for Driver<'_> {
    fn parse_line(&self, line: &str) -> Result<Metric, ParseError> {
        match self {
            Driver::TimeSeries(d) => d.parse_line(line),
            Driver::ServiceMetrics(d) => d.parse_line(line),
        }
    }

    fn enqueue(&self, metrics: Vec<Metric>) -> Result<(), DeliveryClosed> {
        match self {
            Driver::TimeSeries(d) => d.enqueue(metrics),
            Driver::ServiceMetrics(d) => d.enqueue(metrics),
        }
    }
}
