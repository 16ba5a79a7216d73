use crate::roles::Role;
use crate::shell::{EditAction, LineEditor, Shell};
use crate::supervisor::Supervisor;
use crate::ui::{restore_terminal, setup_terminal, ShellView};
use anyhow::{Context, Result};
use crossterm::event::{self, Event};
use owave_core::alarm::{AlarmChannel, AlarmRecord, AlarmTracker};
use owave_core::channel::{region_name, unlink_region, ChannelError, SharedRecord};
use owave_core::clock::ClockRecord;
use owave_core::config::DashboardConfig;
use owave_core::control::{ControlChannel, ControlRecord, ControlSettings, LIFECYCLE_CHECK};
use owave_core::layout::DashboardLayout;
use owave_core::print_lock::PrintLock;
use owave_core::pulse::PULSE_SIGNAL;
use owave_core::render::TerminalSurface;
use owave_core::receiver::{
    block_on_current_thread, monotonic_now, PulseReceiver, PulseWorker, ReceiverError, WorkerReport,
};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type WorkerHandle = JoinHandle<(AlarmChannel, Result<WorkerReport, ReceiverError>)>;

/// Everything the dashboard process needs to pass to its children.
pub struct Launch {
    pub exe: PathBuf,
    pub config_path: Option<PathBuf>,
    pub session: String,
    pub lock_path: PathBuf,
}

impl Launch {
    pub fn command(&self, role: Role, config: &DashboardConfig) -> Command {
        let mut command = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg(role.as_str())
            .arg("--session")
            .arg(&self.session)
            .arg("--lock-path")
            .arg(&self.lock_path)
            .env("OWAVE_LOG_DIR", &config.log_dir)
            .stdin(Stdio::null())
            .stderr(Stdio::null());
        if let Some(level) = &config.log_level {
            command.env("OWAVE_LOG_LEVEL", level);
        }
        command
    }
}

pub fn run_dashboard(config: DashboardConfig, config_path: Option<PathBuf>) -> Result<()> {
    let pid = std::process::id();
    let session = config.session_name(pid);
    let (cols, rows) = crossterm::terminal::size().context("reading terminal size")?;
    let layout = DashboardLayout::compute(cols, rows);
    info!(pid, session = %session, cols, rows, "dashboard_start");

    let control_name = region_name(&session, ControlRecord::KIND);
    let control = Arc::new(
        ControlChannel::create_fresh(&control_name)
            .with_context(|| format!("creating control channel {control_name}"))?,
    );
    control.initialize(ControlSettings {
        clock_refresh_secs: config.clock_refresh_secs,
        alarm_poll_ms: config.alarm_poll_ms,
        screen_cols: cols,
        screen_rows: rows,
    });
    let lock_path = config.lock_path_for(&session);
    let lock = PrintLock::create(&lock_path).context("creating print lock")?;
    let alarm_name = region_name(&session, AlarmRecord::KIND);
    let alarm = AlarmChannel::create_fresh(&alarm_name)
        .with_context(|| format!("creating alarm channel {alarm_name}"))?;
    let prepared = std::env::current_exe()
        .context("locating dashboard executable")
        .and_then(|exe| Ok((exe, arm_receiver(config.pid_file.as_deref(), pid)?)));
    let (exe, receiver) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            teardown_channels(&session, Some(alarm), control, &alarm_name);
            if let Err(err) = lock.remove() {
                warn!(error = %err, "print_lock_remove_failed");
            }
            return Err(err);
        }
    };
    println!("Orange Wave dashboard pid {pid} (session {session})");

    let launch = Launch {
        exe,
        config_path,
        session: session.clone(),
        lock_path: lock_path.clone(),
    };

    setup_terminal()?;
    let mut supervisor = Supervisor::default();
    let mut worker = None;
    let outcome = start_and_interact(
        &config,
        &launch,
        &layout,
        &control,
        &lock,
        alarm,
        receiver,
        &mut supervisor,
        &mut worker,
    );

    // Teardown runs whatever happened above.
    control.request_drain();
    let alarm = worker.and_then(join_worker);
    let report = supervisor.shutdown(&control, Duration::from_millis(config.shutdown_grace_ms));
    info!(
        exited = ?report.exited,
        killed = ?report.killed,
        "children_stopped"
    );
    if let Err(err) = restore_terminal() {
        warn!(error = %err, "terminal_restore_failed");
    }
    teardown_channels(&session, alarm, control, &alarm_name);
    if let Err(err) = lock.remove() {
        warn!(error = %err, "print_lock_remove_failed");
    }
    if let Some(path) = &config.pid_file {
        if let Err(err) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "pid_file_remove_failed");
        }
    }
    info!(session = %session, "dashboard_exit");
    outcome
}

#[allow(clippy::too_many_arguments)]
fn start_and_interact(
    config: &DashboardConfig,
    launch: &Launch,
    layout: &DashboardLayout,
    control: &Arc<ControlChannel>,
    lock: &PrintLock,
    alarm: AlarmChannel,
    receiver: PulseReceiver,
    supervisor: &mut Supervisor,
    worker: &mut Option<WorkerHandle>,
) -> Result<()> {
    for role in Role::ALL {
        supervisor
            .spawn(role, launch.command(role, config))
            .with_context(|| format!("spawning {role}"))?;
    }

    let tracker = AlarmTracker::new(monotonic_now(), layout.alarm_height());
    let worker_control = Arc::clone(control);
    *worker = Some(
        std::thread::Builder::new()
            .name("pulse-worker".to_string())
            .spawn(move || {
                let result = PulseWorker::new(receiver, tracker).run(&alarm, &worker_control);
                (alarm, result)
            })
            .context("spawning pulse worker")?,
    );
    block_on_current_thread(PULSE_SIGNAL).context("blocking pulse signal on main thread")?;

    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGHUP] {
        signal_hook::flag::register(signal, Arc::clone(&terminate))
            .context("registering termination handler")?;
    }

    let cwd = std::env::current_dir().context("reading working directory")?;
    let transcript = config.transcript_for(&launch.session);
    let mut shell = match Shell::new(cwd.clone()).with_transcript(&transcript) {
        Ok(shell) => shell,
        Err(err) => {
            warn!(path = %transcript.display(), error = %err, "transcript_open_failed");
            Shell::new(cwd)
        }
    };
    let mut view = ShellView::terminal(layout);
    view.push_output(&[format!(
        "Dashboard pid: {} (run owave-pulse {})",
        std::process::id(),
        std::process::id()
    )]);
    interact(&mut shell, &mut view, &mut LineEditor::default(), control, lock, &terminate, supervisor)
}

fn interact(
    shell: &mut Shell,
    view: &mut ShellView<TerminalSurface>,
    editor: &mut LineEditor,
    control: &ControlRecord,
    lock: &PrintLock,
    terminate: &AtomicBool,
    supervisor: &mut Supervisor,
) -> Result<()> {
    view.edit_prompt(shell.prompt(), editor.input());
    view.present(lock, prompt_cursor(shell.prompt(), editor.input()))?;
    loop {
        if terminate.load(Ordering::Relaxed) {
            info!("termination_signal_received");
            return Ok(());
        }
        if !control.is_running() {
            return Ok(());
        }
        for (role, status) in supervisor.reap_exited() {
            view.push_output(&[format!("{role} exited ({status})")]);
        }
        if !event::poll(LIFECYCLE_CHECK).context("polling terminal input")? {
            continue;
        }
        match event::read().context("reading terminal input")? {
            Event::Key(key) => match editor.handle(key) {
                EditAction::Continue => {}
                EditAction::Quit => {
                    info!("shell_interrupted");
                    return Ok(());
                }
                EditAction::Submit(line) => {
                    let outcome = shell.execute(&line, control);
                    view.push_output(&outcome.lines);
                    view.submit_prompt();
                    if outcome.exit {
                        view.present(lock, 0)?;
                        return Ok(());
                    }
                }
            },
            Event::Resize(cols, rows) => debug!(cols, rows, "terminal_resized_ignored"),
            _ => {}
        }
        view.edit_prompt(shell.prompt(), editor.input());
        view.present(lock, prompt_cursor(shell.prompt(), editor.input()))?;
    }
}

fn prompt_cursor(prompt: &str, input: &str) -> u16 {
    u16::try_from(prompt.chars().count() + 1 + input.chars().count()).unwrap_or(u16::MAX)
}

fn join_worker(handle: WorkerHandle) -> Option<AlarmChannel> {
    match handle.join() {
        Ok((alarm, Ok(report))) => {
            info!(?report, "pulse_worker_joined");
            Some(alarm)
        }
        Ok((alarm, Err(err))) => {
            error!(error = %err, "pulse_worker_failed");
            Some(alarm)
        }
        Err(_) => {
            error!("pulse_worker_panicked");
            None
        }
    }
}

/// Alarm channel first, then the clock channel name in case the updater was
/// killed before it could destroy it, control channel last.
fn teardown_channels(
    session: &str,
    alarm: Option<AlarmChannel>,
    control: Arc<ControlChannel>,
    alarm_name: &str,
) {
    let alarm_result = match alarm {
        Some(alarm) => alarm.destroy(),
        None => unlink_region(alarm_name),
    };
    if let Err(err) = alarm_result {
        warn!(error = %err, "alarm_channel_destroy_failed");
    }
    let clock_name = region_name(session, ClockRecord::KIND);
    match unlink_region(&clock_name) {
        Ok(()) => warn!(region = %clock_name, "clock_channel_left_behind_unlinked"),
        Err(ChannelError::NotFound { .. }) => debug!(region = %clock_name, "clock_channel_already_destroyed"),
        Err(err) => warn!(region = %clock_name, error = %err, "clock_channel_unlink_failed"),
    }
    let control_result = match Arc::try_unwrap(control) {
        Ok(control) => control.destroy(),
        Err(shared) => unlink_region(shared.name()),
    };
    if let Err(err) = control_result {
        warn!(error = %err, "control_channel_destroy_failed");
    }
}

/// Installs the pulse handler before the pid is published anywhere, so an
/// early pulse is latched instead of hitting the default SIGALRM action.
fn arm_receiver(pid_file: Option<&Path>, pid: u32) -> Result<PulseReceiver> {
    let receiver = PulseReceiver::install(PULSE_SIGNAL).context("installing pulse handler")?;
    if let Some(path) = pid_file {
        write_pid_file(path, pid)?;
    }
    Ok(receiver)
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    std::fs::write(path, format!("{pid}\n"))
        .with_context(|| format!("writing pid file {}", path.display()))
}
