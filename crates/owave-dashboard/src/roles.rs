use anyhow::{Context, Result};
use chrono::Utc;
use owave_core::alarm::{AlarmChannel, AlarmRecord};
use owave_core::channel::{region_name, AttachPolicy, SharedRecord};
use owave_core::clock::{ClockChannel, ClockRecord, ClockUpdater};
use owave_core::config::DashboardConfig;
use owave_core::control::{ControlChannel, ControlRecord};
use owave_core::layout::DashboardLayout;
use owave_core::print_lock::PrintLock;
use owave_core::render::{AlarmPanel, ClockPanel, RenderLoop, TerminalSurface};
use std::fmt;
use std::path::Path;
use tracing::info;

/// Child processes the dashboard launches by re-running its own executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    ClockUpdater,
    ClockRenderer,
    AlarmRenderer,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::ClockUpdater, Role::ClockRenderer, Role::AlarmRenderer];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::ClockUpdater => "clock-updater",
            Role::ClockRenderer => "clock-renderer",
            Role::AlarmRenderer => "alarm-renderer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn attach_control(session: &str, policy: &AttachPolicy) -> Result<ControlChannel> {
    let name = region_name(session, ControlRecord::KIND);
    ControlChannel::attach_with_retry(&name, policy)
        .with_context(|| format!("attaching control channel {name}"))
}

fn layout_from(control: &ControlRecord) -> DashboardLayout {
    let (cols, rows) = control.screen_size();
    DashboardLayout::compute(cols, rows)
}

pub fn run_alarm_renderer(config: &DashboardConfig, session: &str, lock_path: &Path) -> Result<()> {
    let policy = AttachPolicy::from(config.attach);
    let control = attach_control(session, &policy)?;
    let name = region_name(session, AlarmRecord::KIND);
    let alarm = AlarmChannel::attach_with_retry(&name, &policy)
        .with_context(|| format!("attaching alarm channel {name}"))?;
    let lock = PrintLock::open(lock_path).context("opening print lock")?;
    let mut render = RenderLoop::new(AlarmPanel::new(&layout_from(&control)), TerminalSurface::stdout());
    let report = render.run(&lock, &control, ControlRecord::alarm_poll, || alarm.read_state());
    info!(?report, "alarm_renderer_exit");
    Ok(())
}

pub fn run_clock_renderer(config: &DashboardConfig, session: &str, lock_path: &Path) -> Result<()> {
    let policy = AttachPolicy::from(config.attach);
    let control = attach_control(session, &policy)?;
    let name = region_name(session, ClockRecord::KIND);
    let clock = ClockChannel::attach_with_retry(&name, &policy)
        .with_context(|| format!("attaching clock channel {name}"))?;
    let lock = PrintLock::open(lock_path).context("opening print lock")?;
    let mut render = RenderLoop::new(ClockPanel::new(&layout_from(&control)), TerminalSurface::stdout());
    let report = render.run(&lock, &control, ControlRecord::clock_refresh, || clock.read_state());
    info!(?report, "clock_renderer_exit");
    Ok(())
}

/// Owns the clock channel: creates it, keeps it current, destroys it on the
/// way out.
pub fn run_clock_updater(config: &DashboardConfig, session: &str) -> Result<()> {
    let policy = AttachPolicy::from(config.attach);
    let control = attach_control(session, &policy)?;
    let name = region_name(session, ClockRecord::KIND);
    let clock = ClockChannel::create_fresh(&name)
        .with_context(|| format!("creating clock channel {name}"))?;
    let report = ClockUpdater::new(config.zones.clone()).run(&clock, &control, Utc::now);
    info!(?report, "clock_updater_exit");
    clock
        .destroy()
        .with_context(|| format!("destroying clock channel {name}"))?;
    Ok(())
}
