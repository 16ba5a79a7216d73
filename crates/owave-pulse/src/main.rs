use anyhow::Context;
use clap::Parser;
use owave_core::pulse::{
    Generator, GeneratorError, PulseSchedule, SignalSink, TargetError, TargetPid, MAX_INTERVAL,
};
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "owave-pulse")]
#[command(about = "Send randomly spaced heartbeat pulses to a dashboard", long_about = None)]
struct Cli {
    /// Process id of the dashboard
    #[arg(allow_hyphen_values = true)]
    target: String,
    #[arg(long, default_value_t = MAX_INTERVAL.as_secs())]
    max_interval_secs: u64,
    /// Stop after this many pulses
    #[arg(long)]
    count: Option<u64>,
    /// Seed for a reproducible delay sequence
    #[arg(long)]
    seed: Option<u64>,
}

fn init_logging() {
    let level = std::env::var("OWAVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn announce(delay: Duration) {
    println!("Delaying for {:.3} seconds...", delay.as_secs_f64());
    let _ = io::stdout().flush();
}

fn parse_target(raw: &str) -> Result<TargetPid, TargetError> {
    raw.parse()
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    let target = match parse_target(&cli.target) {
        Ok(target) => target,
        Err(err) => {
            error!(input = %cli.target, error = %err, "invalid_target");
            eprintln!("owave-pulse: {err}");
            return ExitCode::from(2);
        }
    };
    let schedule = PulseSchedule::new(Duration::from_secs(cli.max_interval_secs), cli.seed);
    info!(
        target_pid = %target,
        max_interval_secs = cli.max_interval_secs,
        count = ?cli.count,
        "generator_start"
    );
    let mut generator =
        Generator::new(target, schedule, SignalSink::default()).with_count(cli.count);
    let result = generator
        .run(|delay| {
            announce(delay);
            std::thread::sleep(delay);
        })
        .with_context(|| format!("pulsing process {target}"));
    match result {
        Ok(report) => {
            info!(pulses = report.pulses, "generator_done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Some(GeneratorError::TargetGone(pid)) = err.downcast_ref::<GeneratorError>() {
                error!(target_pid = %pid, "target_gone");
            }
            eprintln!("owave-pulse: {err:#}");
            ExitCode::from(1)
        }
    }
}
