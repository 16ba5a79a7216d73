mod app;
mod logging;
mod roles;
mod shell;
mod supervisor;
mod ui;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use owave_core::config::{ConfigError, DashboardConfig};
use roles::Role;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "owave")]
#[command(about = "Orange Wave terminal dashboard", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, env = "OWAVE_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the dashboard (default)
    Run(RunArgs),
    #[command(hide = true)]
    AlarmRenderer(ChildArgs),
    #[command(hide = true)]
    ClockRenderer(ChildArgs),
    #[command(hide = true)]
    ClockUpdater(ChildArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Write the dashboard pid here for owave-pulse
    #[arg(long)]
    pid_file: Option<PathBuf>,
    #[arg(long)]
    alarm_poll_ms: Option<u32>,
    #[arg(long)]
    clock_refresh_secs: Option<u32>,
}

impl RunArgs {
    fn apply(&self, config: &mut DashboardConfig) {
        if let Some(session) = &self.session {
            config.session = Some(session.clone());
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(path) = &self.pid_file {
            config.pid_file = Some(path.clone());
        }
        if let Some(ms) = self.alarm_poll_ms {
            config.alarm_poll_ms = ms;
        }
        if let Some(secs) = self.clock_refresh_secs {
            config.clock_refresh_secs = secs;
        }
    }
}

#[derive(Args, Debug)]
struct ChildArgs {
    #[arg(long)]
    session: String,
    #[arg(long)]
    lock_path: PathBuf,
}

fn resolve_config(cli: &Cli) -> Result<DashboardConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => DashboardConfig::load(path)?,
        None => DashboardConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(level) = &cli.log_level {
        config.log_level = Some(level.clone());
    }
    if let Some(Commands::Run(args)) = &cli.command {
        args.apply(&mut config);
    }
    config.validate()?;
    Ok(config)
}

fn run_child(role: Role, args: &ChildArgs, config: &DashboardConfig) -> Result<()> {
    let _log_guard = logging::init_logging(
        &config.log_dir,
        &args.session,
        role.as_str(),
        config.log_level.as_deref(),
    );
    let result = match role {
        Role::AlarmRenderer => roles::run_alarm_renderer(config, &args.session, &args.lock_path),
        Role::ClockRenderer => roles::run_clock_renderer(config, &args.session, &args.lock_path),
        Role::ClockUpdater => roles::run_clock_updater(config, &args.session),
    };
    if let Err(err) = &result {
        error!(role = %role, error = %format!("{err:#}"), "child_failed");
    }
    result
}

fn run(cli: Cli, config: DashboardConfig) -> Result<()> {
    match &cli.command {
        None | Some(Commands::Run(_)) => {
            let session = config.session_name(std::process::id());
            let _log_guard = logging::init_logging(
                &config.log_dir,
                &session,
                "dashboard",
                config.log_level.as_deref(),
            );
            let result = app::run_dashboard(config, cli.config.clone());
            if let Err(err) = &result {
                error!(error = %format!("{err:#}"), "dashboard_failed");
            }
            result
        }
        Some(Commands::AlarmRenderer(args)) => run_child(Role::AlarmRenderer, args, &config),
        Some(Commands::ClockRenderer(args)) => run_child(Role::ClockRenderer, args, &config),
        Some(Commands::ClockUpdater(args)) => run_child(Role::ClockUpdater, args, &config),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("owave: {err}");
            return ExitCode::from(2);
        }
    };
    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("owave: {err:#}");
            ExitCode::from(1)
        }
    }
}
