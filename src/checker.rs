use std::fmt;
use std::sync::mpsc::SyncSender;

use chrono::{DateTime, SubsecRound, Utc};
use log::{debug, error};
use thiserror::Error;

use crate::command::{self, Command, CommandError, ExitState};
use crate::metric::Metric;
use crate::payload::{Dimension, PutMetricData};
use crate::router::{self, DeliveryClosed};

/// Health state derived from a check command's exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckResult {
    Ok,
    Failed,
    Warning,
    Unknown,
}

impl CheckResult {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => CheckResult::Ok,
            1 => CheckResult::Failed,
            2 => CheckResult::Warning,
            _ => CheckResult::Unknown,
        }
    }

    /// Name of the data point emitted for this result.
    pub fn metric_name(&self) -> &'static str {
        match self {
            CheckResult::Ok => "CheckOK",
            CheckResult::Failed => "CheckFailed",
            CheckResult::Warning => "CheckWarning",
            CheckResult::Unknown => "CheckUnknown",
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_name())
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("command execute timed out")]
    TimedOut,

    #[error("command execute failed with exit code {0}")]
    UnexpectedExitCode(i32),

    #[error("command terminated by signal {0}")]
    Signaled(i32),

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug)]
pub struct Evaluation {
    pub result: CheckResult,
    pub error: Option<CheckError>,
}

impl Evaluation {
    fn ok(result: CheckResult) -> Self {
        Self {
            result,
            error: None,
        }
    }

    fn unknown(error: CheckError) -> Self {
        Self {
            result: CheckResult::Unknown,
            error: Some(error),
        }
    }
}

/// Maps the outcome of one command run to a check result.
pub fn classify(outcome: Result<ExitState, CommandError>) -> Evaluation {
    match outcome {
        Err(e) => Evaluation::unknown(e.into()),
        Ok(ExitState::TimedOut) | Ok(ExitState::Killed) => {
            Evaluation::unknown(CheckError::TimedOut)
        }
        Ok(ExitState::Signaled(signal)) => Evaluation::unknown(CheckError::Signaled(signal)),
        Ok(ExitState::Exited(code)) => match CheckResult::from_exit_code(code) {
            CheckResult::Unknown => Evaluation::unknown(CheckError::UnexpectedExitCode(code)),
            result => Evaluation::ok(result),
        },
    }
}

pub fn evaluate(id: &str, command: &Command) -> Evaluation {
    let outcome = command::run(id, command).map(|output| {
        if !output.stdout.is_empty() {
            debug!(
                "[{}] {}",
                id,
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
        }
        output.state
    });
    classify(outcome)
}

/// Builds the data points for one evaluation: one per dimension-set plus an
/// untagged one, all sharing `now`.
pub fn check_data(
    namespace: &str,
    result: CheckResult,
    dimensions: &[Vec<Dimension>],
    now: DateTime<Utc>,
) -> Vec<PutMetricData> {
    let metric = Metric {
        namespace: namespace.to_string(),
        name: result.metric_name().to_string(),
        value: 1.0,
        timestamp: now.trunc_subsecs(0),
    };
    router::split_batches(
        router::expand_dimensions(&metric, dimensions),
        router::MAX_DATUMS_PER_REQUEST,
    )
    .into_iter()
    .map(|data| PutMetricData {
        namespace: namespace.to_string(),
        data,
    })
    .collect()
}

/// A check plugin bound to the time-series delivery channel.
pub struct CheckRunner<'a> {
    pub id: &'a str,
    pub namespace: &'a str,
    pub command: &'a Command,
    pub dimensions: &'a [Vec<Dimension>],
    pub sender: &'a SyncSender<PutMetricData>,
}

impl CheckRunner<'_> {
    /// Evaluates once and enqueues the result.
    pub fn run_once(&self) -> Result<CheckResult, DeliveryClosed> {
        let evaluation = evaluate(self.id, self.command);
        if let Some(e) = &evaluation.error {
            error!("[{}] {} {}", self.id, evaluation.result, e);
        }
        for batch in check_data(self.namespace, evaluation.result, self.dimensions, Utc::now()) {
            self.sender.send(batch).map_err(|_| DeliveryClosed)?;
        }
        Ok(evaluation.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn classifies_exit_codes() {
        for code in [-1, 3, 4, 42, 127, 255] {
            let ev = classify(Ok(ExitState::Exited(code)));
            assert_eq!(ev.result, CheckResult::Unknown, "exit code {}", code);
            assert!(matches!(ev.error, Some(CheckError::UnexpectedExitCode(c)) if c == code));
        }
        assert_eq!(classify(Ok(ExitState::Exited(0))).result, CheckResult::Ok);
        assert_eq!(classify(Ok(ExitState::Exited(1))).result, CheckResult::Failed);
        assert_eq!(classify(Ok(ExitState::Exited(2))).result, CheckResult::Warning);
        assert!(classify(Ok(ExitState::Exited(1))).error.is_none());
    }

    #[test]
    fn timeout_and_kill_are_unknown() {
        for state in [ExitState::TimedOut, ExitState::Killed] {
            let ev = classify(Ok(state));
            assert_eq!(ev.result, CheckResult::Unknown);
            assert_eq!(ev.error.unwrap().to_string(), "command execute timed out");
        }
    }

    #[test]
    fn spawn_failure_is_unknown() {
        let ev = classify(Err(CommandError::Empty));
        assert_eq!(ev.result, CheckResult::Unknown);
        assert!(matches!(ev.error, Some(CheckError::Command(_))));
    }

    #[test]
    fn fans_out_one_point_per_dimension_set_plus_untagged() {
        let dims = vec![
            vec![Dimension::new("Host", "a")],
            vec![Dimension::new("Host", "b"), Dimension::new("Role", "db")],
        ];
        let now = Utc::now();
        let batches = check_data("memcached/check", CheckResult::Warning, &dims, now);
        assert_eq!(batches.len(), 1);
        let data = &batches[0].data;
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].dimensions, dims[0]);
        assert_eq!(data[1].dimensions, dims[1]);
        assert!(data[2].dimensions.is_empty());
        for datum in data {
            assert_eq!(datum.name, "CheckWarning");
            assert_eq!(datum.value, 1.0);
            assert_eq!(datum.timestamp, now.trunc_subsecs(0));
        }
    }

    #[test]
    fn splits_large_fan_out() {
        let dims: Vec<_> = (0..25)
            .map(|i| vec![Dimension::new("Shard", i.to_string())])
            .collect();
        let batches = check_data("ns", CheckResult::Ok, &dims, Utc::now());
        let sizes: Vec<_> = batches.iter().map(|b| b.data.len()).collect();
        assert_eq!(sizes, vec![20, 6]);
        assert!(batches.iter().all(|b| b.namespace == "ns"));
    }

    #[test]
    fn runner_enqueues_result() {
        let (tx, rx) = mpsc::sync_channel(4);
        let command = Command::new(
            vec!["sh".into(), "-c".into(), "exit 1".into()],
            Duration::from_secs(5),
        );
        let runner = CheckRunner {
            id: "plugin.check.test",
            namespace: "test/check",
            command: &command,
            dimensions: &[],
            sender: &tx,
        };
        assert_eq!(runner.run_once().unwrap(), CheckResult::Failed);
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.namespace, "test/check");
        assert_eq!(batch.data.len(), 1);
        assert_eq!(batch.data[0].name, "CheckFailed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn background_child_does_not_outlive_timeout() {
        let command = Command::new(
            vec!["sh".into(), "-c".into(), "sleep 8 & echo started".into()],
            Duration::from_secs(1),
        )
        .with_kill_after(Duration::from_millis(500));
        let started = std::time::Instant::now();
        let ev = evaluate("plugin.check.test", &command);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(ev.result, CheckResult::Unknown);
        assert!(matches!(ev.error, Some(CheckError::TimedOut)));
    }
}
