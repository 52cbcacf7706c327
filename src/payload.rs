use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ConfigError;

/// A single `Name=Value` tag attached to a time-series data point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parses a dimension-set written as `Key1=Val1,Key2=Val2`.
    pub fn parse_set(text: &str) -> Result<Vec<Dimension>, ConfigError> {
        text.split(',')
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => Ok(Dimension::new(name, value)),
                None => Err(ConfigError::InvalidDimension(pair.to_string())),
            })
            .collect()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// One time-series data point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDatum {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
}

/// A namespace-scoped batch for the time-series service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PutMetricData {
    pub namespace: String,
    pub data: Vec<MetricDatum>,
}

/// Where a metrics-service payload is posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MackerelTarget {
    Service(String),
    Host(String),
}

impl fmt::Display for MackerelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MackerelTarget::Service(name) => write!(f, "service {}", name),
            MackerelTarget::Host(id) => write!(f, "host {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub name: String,
    pub time: i64,
    pub value: f64,
}

/// All metrics one tick of a metrics-service plugin produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetric {
    pub target: MackerelTarget,
    pub values: Vec<MetricValue>,
}

/// Anything a delivery channel carries.
pub trait Payload: Serialize + Send + 'static {
    fn is_empty(&self) -> bool;
    fn len(&self) -> usize;
}

impl Payload for PutMetricData {
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

impl Payload for ServiceMetric {
    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}
