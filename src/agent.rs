use log::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::output::{spawn_output, Outputs};
use crate::output_cloudwatch::CloudWatchOutput;
use crate::output_mackerel::MackerelOutput;
use crate::output_print::PrintOutput;
use crate::payload::{PutMetricData, ServiceMetric};
use crate::scheduler::{join_all, RunMode, Scheduler, Sinks};
use crate::shutdown::Shutdown;

pub const CHANNEL_CAPACITY: usize = 1000;

/// The client each dispatcher will own.
pub struct Backends {
    pub time_series: Box<dyn Outputs<PutMetricData>>,
    pub service_metrics: Box<dyn Outputs<ServiceMetric>>,
}

impl Backends {
    /// Real clients for every backend some plugin targets. A backend nobody
    /// targets gets a print output so its credentials are never required.
    pub fn from_env(config: &Config) -> Result<Self, Error> {
        let time_series: Box<dyn Outputs<PutMetricData>> = if config.uses_time_series() {
            let output = CloudWatchOutput::from_env().map_err(|e| Error::Backend {
                backend: "cloudwatch",
                reason: e.to_string(),
            })?;
            Box::new(output)
        } else {
            Box::new(PrintOutput::stdout("cloudwatch"))
        };
        let service_metrics: Box<dyn Outputs<ServiceMetric>> = if config.uses_service_metrics() {
            Box::new(MackerelOutput::from_env()?)
        } else {
            Box::new(PrintOutput::stdout("mackerel"))
        };
        Ok(Self {
            time_series,
            service_metrics,
        })
    }

    /// Prints every payload instead of sending it.
    pub fn print() -> Self {
        Self {
            time_series: Box::new(PrintOutput::stdout("cloudwatch")),
            service_metrics: Box::new(PrintOutput::stdout("mackerel")),
        }
    }
}

/// Runs every plugin until `shutdown` is triggered, then drains the
/// delivery channels.
pub fn run(scheduler: Scheduler, backends: Backends, shutdown: &Shutdown) -> Result<(), Error> {
    drive(scheduler, backends, shutdown, RunMode::Daemon)
}

/// Runs every plugin once, delivers what they produced and returns.
pub fn run_once(scheduler: Scheduler, backends: Backends, shutdown: &Shutdown) -> Result<(), Error> {
    drive(scheduler, backends, shutdown, RunMode::Once)
}

fn drive(
    scheduler: Scheduler,
    backends: Backends,
    shutdown: &Shutdown,
    mode: RunMode,
) -> Result<(), Error> {
    let (time_series, ts_handle) = spawn_output(backends.time_series, CHANNEL_CAPACITY)?;
    let (service_metrics, sm_handle) = spawn_output(backends.service_metrics, CHANNEL_CAPACITY)?;
    let sinks = Sinks {
        time_series,
        service_metrics,
    };

    if scheduler.is_empty() {
        warn!("no plugins configured");
    } else {
        info!("starting {} plugins", scheduler.len());
    }
    let spawned = scheduler.spawn(&sinks, shutdown, mode);
    if spawned.is_ok() && mode == RunMode::Daemon {
        shutdown.wait();
    }
    let result = spawned.map(join_all);

    // every producer has exited; closing the channels lets the dispatchers drain
    drop(sinks);
    join_all(vec![ts_handle, sm_handle]);
    info!("shutdown complete");
    result
}
