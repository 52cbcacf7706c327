use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::checker::CheckRunner;
use crate::config::{Config, Destination, PluginKind, PluginSpec};
use crate::error::Error;
use crate::metric;
use crate::payload::{PutMetricData, ServiceMetric};
use crate::router::{Driver, ServiceMetricsDriver, TimeSeriesDriver};
use crate::shutdown::Shutdown;

pub const STARTUP_STAGGER: Duration = Duration::from_secs(1);

/// Producer ends of the delivery channels, one per backend.
#[derive(Clone)]
pub struct Sinks {
    pub time_series: SyncSender<PutMetricData>,
    pub service_metrics: SyncSender<ServiceMetric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Repeat every interval until shutdown.
    Daemon,
    /// Run every plugin exactly once.
    Once,
}

pub struct Scheduler {
    plugins: Vec<PluginSpec>,
    stagger: Duration,
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        Self {
            plugins: config.plugins.clone(),
            stagger: STARTUP_STAGGER,
        }
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Starts one thread per plugin. If a thread cannot be started, the ones
    /// already running are stopped and joined before the error is returned.
    pub fn spawn(
        self,
        sinks: &Sinks,
        shutdown: &Shutdown,
        mode: RunMode,
    ) -> Result<Vec<JoinHandle<()>>, Error> {
        let mut handles = Vec::with_capacity(self.plugins.len());
        for (i, plugin) in self.plugins.into_iter().enumerate() {
            if mode == RunMode::Daemon && i > 0 && shutdown.wait_timeout(self.stagger) {
                break;
            }
            info!("starting {}", plugin.id);
            let name = plugin.id.clone();
            let sinks = sinks.clone();
            let stop = shutdown.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || match mode {
                    RunMode::Daemon => plugin_loop(&plugin, &sinks, &stop),
                    RunMode::Once => run_tick(&plugin, &sinks),
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    shutdown.trigger();
                    join_all(handles);
                    return Err(Error::Spawn { name, source });
                }
            }
        }
        Ok(handles)
    }
}

/// Executes one tick of `plugin` and enqueues its output.
pub fn run_tick(plugin: &PluginSpec, sinks: &Sinks) {
    let started = Instant::now();
    match &plugin.kind {
        PluginKind::Check { namespace } => {
            let runner = CheckRunner {
                id: &plugin.id,
                namespace: namespace.as_str(),
                command: &plugin.command,
                dimensions: &plugin.dimensions,
                sender: &sinks.time_series,
            };
            match runner.run_once() {
                Ok(result) => debug!("[{}] {}", plugin.id, result),
                Err(e) => error!("[{}] {}", plugin.id, e),
            }
        }
        PluginKind::Metrics(destination) => {
            let driver = match destination {
                Destination::TimeSeries => Driver::TimeSeries(TimeSeriesDriver {
                    dimensions: &plugin.dimensions,
                    sender: &sinks.time_series,
                }),
                Destination::ServiceMetrics(target) => {
                    Driver::ServiceMetrics(ServiceMetricsDriver {
                        target,
                        sender: &sinks.service_metrics,
                    })
                }
            };
            match metric::collect(&plugin.id, &plugin.command, &driver) {
                Ok(count) => debug!("[{}] collected {} metrics", plugin.id, count),
                Err(e) => error!("[{}] {}", plugin.id, e),
            }
        }
    }
    debug!("[{}] tick finished in {:?}", plugin.id, started.elapsed());
}

/// Runs `plugin` immediately and then on every interval boundary until
/// `shutdown` is triggered.
pub fn plugin_loop(plugin: &PluginSpec, sinks: &Sinks, shutdown: &Shutdown) {
    let mut deadline = Instant::now();
    while !shutdown.is_triggered() {
        run_tick(plugin, sinks);
        let now = Instant::now();
        let next = next_deadline(deadline, plugin.interval, now);
        if next > deadline + plugin.interval {
            warn!(
                "[{}] run took longer than interval {:?}, skipping missed runs",
                plugin.id, plugin.interval
            );
        }
        deadline = next;
        if shutdown.wait_until(deadline) {
            break;
        }
    }
    info!("[{}] stopped", plugin.id);
}

/// The first interval boundary after `now`, counted from `prev`.
pub fn next_deadline(prev: Instant, interval: Duration, now: Instant) -> Instant {
    let next = prev + interval;
    if next > now || interval.is_zero() {
        return next.max(now);
    }
    let behind = now.duration_since(prev).as_nanos() / interval.as_nanos();
    let skips = u32::try_from(behind).unwrap_or(u32::MAX);
    prev + interval * skips + interval
}

pub fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("plugin").to_string();
        if handle.join().is_err() {
            error!("{} panicked", name);
        }
    }
}
