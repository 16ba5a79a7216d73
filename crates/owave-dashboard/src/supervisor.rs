use crate::roles::Role;
use owave_core::control::{ControlRecord, Lifecycle};
use std::io;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const REAP_POLL: Duration = Duration::from_millis(20);

struct Supervised {
    role: Role,
    child: Child,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub exited: Vec<(Role, Option<i32>)>,
    pub killed: Vec<Role>,
}

#[derive(Default)]
pub struct Supervisor {
    children: Vec<Supervised>,
}

impl Supervisor {
    pub fn spawn(&mut self, role: Role, mut command: Command) -> io::Result<u32> {
        let child = command.spawn()?;
        let pid = child.id();
        info!(role = %role, pid, "child_spawned");
        self.children.push(Supervised { role, child });
        Ok(pid)
    }

    #[cfg(test)]
    pub fn pids(&self) -> Vec<(Role, u32)> {
        self.children
            .iter()
            .map(|entry| (entry.role, entry.child.id()))
            .collect()
    }

    /// Reaps children that already exited and reports them.
    pub fn reap_exited(&mut self) -> Vec<(Role, ExitStatus)> {
        let mut exited = Vec::new();
        self.children.retain_mut(|entry| match entry.child.try_wait() {
            Ok(Some(status)) => {
                warn!(role = %entry.role, %status, "child_exited_early");
                exited.push((entry.role, status));
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(role = %entry.role, error = %err, "child_wait_failed");
                true
            }
        });
        exited
    }

    /// Requests a drain through the control channel, waits up to `grace` for
    /// children to leave on their own, kills and reaps the rest, then marks
    /// the lifecycle Terminated.
    pub fn shutdown(mut self, control: &ControlRecord, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        control.request_drain();
        let deadline = Instant::now() + grace;
        loop {
            self.children.retain_mut(|entry| match entry.child.try_wait() {
                Ok(Some(status)) => {
                    info!(role = %entry.role, %status, "child_drained");
                    report.exited.push((entry.role, status.code()));
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    warn!(role = %entry.role, error = %err, "child_wait_failed");
                    true
                }
            });
            if self.children.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(REAP_POLL);
        }
        for mut entry in self.children.drain(..) {
            warn!(role = %entry.role, pid = entry.child.id(), "child_force_killed");
            if let Err(err) = entry.child.kill() {
                warn!(role = %entry.role, error = %err, "child_kill_failed");
            }
            if let Err(err) = entry.child.wait() {
                warn!(role = %entry.role, error = %err, "child_reap_failed");
            }
            report.killed.push(entry.role);
        }
        control.advance(Lifecycle::Terminated);
        info!(
            exited = report.exited.len(),
            killed = report.killed.len(),
            "supervisor_shutdown_complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owave_core::control::ControlChannel;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn control() -> ControlChannel {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "/owave-supervisor-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        ControlChannel::create(&name).expect("control")
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn stragglers_are_killed_after_grace() {
        let control = control();
        let mut supervisor = Supervisor::default();
        supervisor
            .spawn(Role::ClockUpdater, sh("exit 0"))
            .expect("spawn quick child");
        supervisor
            .spawn(Role::AlarmRenderer, sh("sleep 30"))
            .expect("spawn hung child");
        assert_eq!(supervisor.pids().len(), 2);

        let started = Instant::now();
        let report = supervisor.shutdown(&control, Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.exited, vec![(Role::ClockUpdater, Some(0))]);
        assert_eq!(report.killed, vec![Role::AlarmRenderer]);
        assert_eq!(control.lifecycle(), Lifecycle::Terminated);
        control.destroy().expect("destroy");
    }

    #[test]
    fn early_exit_is_reported_once() {
        let control = control();
        let mut supervisor = Supervisor::default();
        supervisor
            .spawn(Role::ClockRenderer, sh("exit 3"))
            .expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exited = Vec::new();
        while exited.is_empty() && Instant::now() < deadline {
            exited = supervisor.reap_exited();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].1.code(), Some(3));
        assert!(supervisor.pids().is_empty());
        let report = supervisor.shutdown(&control, Duration::from_millis(50));
        assert!(report.exited.is_empty() && report.killed.is_empty());
        control.destroy().expect("destroy");
    }
}
