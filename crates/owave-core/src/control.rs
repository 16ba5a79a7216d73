use crate::channel::{Region, SharedRecord};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on how long any loop sleeps before re-checking the lifecycle.
pub const LIFECYCLE_CHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifecycle {
    Running,
    Draining,
    Terminated,
}

impl Lifecycle {
    fn code(self) -> u32 {
        match self {
            Lifecycle::Running => 0,
            Lifecycle::Draining => 1,
            Lifecycle::Terminated => 2,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            0 => Lifecycle::Running,
            1 => Lifecycle::Draining,
            _ => Lifecycle::Terminated,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lifecycle::Running => "running",
            Lifecycle::Draining => "draining",
            Lifecycle::Terminated => "terminated",
        })
    }
}

/// Shutdown intent and runtime settings shared by every dashboard process.
#[repr(C)]
pub struct ControlRecord {
    lifecycle: AtomicU32,
    clock_refresh_secs: AtomicU32,
    alarm_poll_ms: AtomicU32,
    screen_cols: AtomicU32,
    screen_rows: AtomicU32,
}

// SAFETY: atomics only; zero reads as Running with unset settings.
unsafe impl SharedRecord for ControlRecord {
    const KIND: &'static str = "control";
}

pub type ControlChannel = Region<ControlRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSettings {
    pub clock_refresh_secs: u32,
    pub alarm_poll_ms: u32,
    pub screen_cols: u16,
    pub screen_rows: u16,
}

impl ControlRecord {
    pub fn initialize(&self, settings: ControlSettings) {
        self.set_clock_refresh_secs(settings.clock_refresh_secs);
        self.alarm_poll_ms
            .store(settings.alarm_poll_ms.max(1), Ordering::Release);
        self.screen_cols
            .store(u32::from(settings.screen_cols), Ordering::Release);
        self.screen_rows
            .store(u32::from(settings.screen_rows), Ordering::Release);
        self.lifecycle
            .store(Lifecycle::Running.code(), Ordering::Release);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_code(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Moves the lifecycle forward only; returns the state before the call.
    pub fn advance(&self, to: Lifecycle) -> Lifecycle {
        Lifecycle::from_code(self.lifecycle.fetch_max(to.code(), Ordering::AcqRel))
    }

    pub fn request_drain(&self) -> Lifecycle {
        self.advance(Lifecycle::Draining)
    }

    pub fn clock_refresh(&self) -> Duration {
        Duration::from_secs(u64::from(self.clock_refresh_secs.load(Ordering::Acquire).max(1)))
    }

    pub fn clock_refresh_secs(&self) -> u32 {
        self.clock_refresh_secs.load(Ordering::Acquire).max(1)
    }

    pub fn set_clock_refresh_secs(&self, secs: u32) {
        self.clock_refresh_secs.store(secs.max(1), Ordering::Release);
    }

    pub fn alarm_poll(&self) -> Duration {
        Duration::from_millis(u64::from(self.alarm_poll_ms.load(Ordering::Acquire).max(1)))
    }

    pub fn screen_size(&self) -> (u16, u16) {
        let cols = self.screen_cols.load(Ordering::Acquire);
        let rows = self.screen_rows.load(Ordering::Acquire);
        (
            u16::try_from(cols).unwrap_or(u16::MAX),
            u16::try_from(rows).unwrap_or(u16::MAX),
        )
    }

    pub fn settings(&self) -> ControlSettings {
        let (screen_cols, screen_rows) = self.screen_size();
        ControlSettings {
            clock_refresh_secs: self.clock_refresh_secs(),
            alarm_poll_ms: self.alarm_poll_ms.load(Ordering::Acquire).max(1),
            screen_cols,
            screen_rows,
        }
    }

    /// Sleeps up to `total`, waking every `LIFECYCLE_CHECK` to look for a
    /// shutdown request. Returns false as soon as the lifecycle leaves Running.
    pub fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if !self.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(LIFECYCLE_CHECK));
        }
    }
}
