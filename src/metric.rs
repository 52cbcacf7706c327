//! Metric plugins: output line parsing and per-tick collection.
//!
//! A metric plugin prints one sample per line as
//! `name<TAB>value<TAB>unix-seconds`. How the name is interpreted and where
//! the samples go depends on the destination, see [`MetricDriver`].

use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use thiserror::Error;

use crate::command::{self, Command, CommandError, ExitState};
use crate::router::DeliveryClosed;

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub namespace: String,
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid metric format. insufficient columns: {0:?}")]
    InsufficientColumns(String),

    #[error("invalid metric name: {0}")]
    InvalidName(String),

    #[error("invalid metric value: {0}")]
    InvalidValue(String),

    #[error("invalid metric time: {0}")]
    InvalidTime(String),
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("command execute failed with exit code {0}")]
    ExitCode(i32),

    #[error("command terminated by signal {0}")]
    Signaled(i32),

    #[error("command execute timed out")]
    TimedOut,

    #[error(transparent)]
    Delivery(#[from] DeliveryClosed),
}

/// Destination-specific behavior of a metric plugin.
pub trait MetricDriver {
    fn parse_line(&self, line: &str) -> Result<Metric, ParseError>;

    /// Hands one tick's metrics to the delivery channel, blocking while it is
    /// full.
    fn enqueue(&self, metrics: Vec<Metric>) -> Result<(), DeliveryClosed>;
}

fn split_columns(line: &str) -> Result<(&str, f64, DateTime<Utc>), ParseError> {
    let mut cols = line.splitn(3, '\t');
    let (Some(name), Some(value), Some(time)) = (cols.next(), cols.next(), cols.next()) else {
        return Err(ParseError::InsufficientColumns(line.to_string()));
    };
    let value = value
        .parse::<f64>()
        .map_err(|_| ParseError::InvalidValue(value.to_string()))?;
    let timestamp = time
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| ParseError::InvalidTime(time.to_string()))?;
    Ok((name, value, timestamp))
}

/// Parses a line whose name is `service.subsystem.metric`; the namespace
/// becomes `service/subsystem`.
pub fn parse_namespaced(line: &str) -> Result<Metric, ParseError> {
    let (name, value, timestamp) = split_columns(line)?;
    let mut parts = name.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(subsystem), Some(metric)) => Ok(Metric {
            namespace: format!("{}/{}", service, subsystem),
            name: metric.to_string(),
            value,
            timestamp,
        }),
        _ => Err(ParseError::InvalidName(name.to_string())),
    }
}

/// Parses a line keeping the name as a single flat identifier.
pub fn parse_flat(line: &str) -> Result<Metric, ParseError> {
    let (name, value, timestamp) = split_columns(line)?;
    Ok(Metric {
        namespace: String::new(),
        name: name.to_string(),
        value,
        timestamp,
    })
}

/// Parses every non-blank line of `output`, logging and skipping bad lines.
pub fn parse_output<D: MetricDriver + ?Sized>(id: &str, output: &str, driver: &D) -> Vec<Metric> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match driver.parse_line(line) {
            Ok(metric) => Some(metric),
            Err(e) => {
                warn!("[{}] {}", id, e);
                None
            }
        })
        .collect()
}

/// Runs the plugin once and enqueues what it printed. Returns the number of
/// metrics collected.
pub fn collect<D: MetricDriver + ?Sized>(
    id: &str,
    command: &Command,
    driver: &D,
) -> Result<usize, CollectError> {
    let output = command::run(id, command)?;
    match output.state {
        ExitState::Exited(0) => {}
        ExitState::Exited(code) => return Err(CollectError::ExitCode(code)),
        ExitState::Signaled(signal) => return Err(CollectError::Signaled(signal)),
        ExitState::TimedOut | ExitState::Killed => return Err(CollectError::TimedOut),
    }
    let metrics = parse_output(id, &String::from_utf8_lossy(&output.stdout), driver);
    let count = metrics.len();
    driver.enqueue(metrics)?;
    Ok(count)
}
