use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use env_logger::Env;
use log::{debug, info, LevelFilter};

use plugin_agent::agent::{self, Backends};
use plugin_agent::config::{load_config, parse_duration};
use plugin_agent::scheduler::Scheduler;
use plugin_agent::shutdown::{listen_for_signals, Shutdown};

#[derive(Debug, Parser)]
#[command(version, about = "Runs check and metric plugins and ships their results", long_about = None)]
struct Args {
    /// Config file path or http(s):// / s3:// URL.
    #[arg(long, env = "CONFIG", value_name = "PATH")]
    config: String,

    /// Enable debug logging.
    #[arg(long, env = "DEBUG", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    debug: bool,

    /// Sleep duration at wake up, e.g. 10s.
    #[arg(long, env = "SLEEP", value_parser = parse_duration)]
    sleep: Option<Duration>,

    /// Run every plugin once and exit.
    #[arg(long, env = "AT_ONCE", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    at_once: bool,

    /// Print payloads to stdout instead of sending them.
    #[arg(long, env = "DRY_RUN", action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    dry_run: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    debug!("{:?}", args);

    if let Some(sleep) = args.sleep.filter(|d| !d.is_zero()) {
        info!("sleeping {:?}", sleep);
        thread::sleep(sleep);
    }

    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config))?;
    let backends = if args.dry_run {
        Backends::print()
    } else {
        Backends::from_env(&config).context("failed to initialize backends")?
    };
    let scheduler = Scheduler::new(&config);
    let shutdown = Shutdown::new();
    // detached; a pending signal wait must not block exit
    listen_for_signals(shutdown.clone())?;

    if args.at_once {
        agent::run_once(scheduler, backends, &shutdown)?;
    } else {
        agent::run(scheduler, backends, &shutdown)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn boolean_flags_accept_numeric_env_values() {
        for (value, expected) in [("1", true), ("0", false), ("true", true), ("", false)] {
            env::set_var("DEBUG", value);
            env::set_var("AT_ONCE", value);
            env::set_var("DRY_RUN", value);
            let args = Args::try_parse_from(["plugin-agent", "--config", "agent.yaml"]).unwrap();
            assert_eq!(args.debug, expected, "DEBUG={:?}", value);
            assert_eq!(args.at_once, expected, "AT_ONCE={:?}", value);
            assert_eq!(args.dry_run, expected, "DRY_RUN={:?}", value);
        }
        env::remove_var("DEBUG");
        env::remove_var("AT_ONCE");
        env::remove_var("DRY_RUN");
    }

    #[test]
    fn sleep_takes_a_duration() {
        let parse = |sleep: &str| {
            Args::try_parse_from(["plugin-agent", "--config", "agent.yaml", "--sleep", sleep])
        };
        assert_eq!(parse("1m30s").unwrap().sleep, Some(Duration::from_secs(90)));
        assert!(parse("soon").is_err());
    }
}
