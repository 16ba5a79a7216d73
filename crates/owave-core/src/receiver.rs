use crate::alarm::{AlarmRecord, AlarmTracker};
use crate::control::{ControlRecord, LIFECYCLE_CHECK};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::time::{clock_gettime, ClockId};
use signal_hook::SigId;
use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("wake pipe: {0}")]
    Io(#[from] io::Error),
    #[error("signal mask: {0}")]
    Mask(#[from] Errno),
}

/// Monotonic clock reading; the only clock call made from the signal handler.
pub fn monotonic_now() -> Duration {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(Duration::from)
        .unwrap_or_default()
}

/// What the signal handler leaves behind: the two most recent pulse stamps
/// and a count.
#[derive(Debug, Default)]
pub struct PulseLatch {
    prev_nanos: AtomicU64,
    last_nanos: AtomicU64,
    count: AtomicU64,
}

impl PulseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Async-signal-safe: atomic swaps and stores only, no allocation, no locks.
    pub fn record(&self, at: Duration) {
        let nanos = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        let prev = self.last_nanos.swap(nanos, Ordering::Relaxed);
        self.prev_nanos.store(prev, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn last(&self) -> Duration {
        Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed))
    }

    /// Count plus the last two stamps, re-read if a signal lands in between.
    fn sample(&self) -> (u64, Duration, Duration) {
        loop {
            let count = self.count();
            let prev = self.prev_nanos.load(Ordering::Relaxed);
            let last = self.last_nanos.load(Ordering::Relaxed);
            if self.count() == count {
                return (count, Duration::from_nanos(prev), Duration::from_nanos(last));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// Stamp of the signal that arrived just before `at`. Only meaningful
    /// when `coalesced > 1`.
    pub prev: Duration,
    pub at: Duration,
    /// Signals folded into this wakeup.
    pub coalesced: u64,
}

/// Wakeup side of the pulse handler: a socket pair written from the handler
/// plus the shared latch.
pub struct PulseReceiver {
    latch: Arc<PulseLatch>,
    wake: UnixStream,
    seen: u64,
    registrations: Vec<SigId>,
}

impl PulseReceiver {
    /// Installs the handler for `signal`. The handler stamps the latch and
    /// writes one wake byte; everything else happens on the worker.
    pub fn install(signal: Signal) -> Result<Self, ReceiverError> {
        let (read, write) = UnixStream::pair()?;
        write.set_nonblocking(true)?;
        let latch = Arc::new(PulseLatch::new());
        let handler_latch = Arc::clone(&latch);
        // SAFETY: the action only calls clock_gettime(2) and stores atomics,
        // both async-signal-safe; it never allocates or takes locks.
        let stamp = unsafe {
            signal_hook::low_level::register(signal as i32, move || {
                handler_latch.record(monotonic_now());
            })
        }?;
        let wake = signal_hook::low_level::pipe::register(signal as i32, write)?;
        info!(signal = %signal, "pulse_handler_installed");
        let mut receiver = Self::from_parts(latch, read)?;
        receiver.registrations = vec![stamp, wake];
        Ok(receiver)
    }

    /// Builds a receiver around an existing latch and wake socket.
    pub fn from_parts(latch: Arc<PulseLatch>, wake: UnixStream) -> Result<Self, ReceiverError> {
        let seen = latch.count();
        Ok(Self {
            latch,
            wake,
            seen,
            registrations: Vec::new(),
        })
    }

    pub fn latch(&self) -> Arc<PulseLatch> {
        Arc::clone(&self.latch)
    }

    /// Blocks up to `timeout` for a wake byte, then reports any pulse the
    /// latch gained since the last call. The latch is checked even on timeout
    /// so a wake byte that raced ahead of its stamp is never lost.
    pub fn wait(&mut self, timeout: Duration) -> Result<Option<Pulse>, ReceiverError> {
        self.wake.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; 64];
        match self.wake.read(&mut buf) {
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err.into()),
        }
        let (count, prev, at) = self.latch.sample();
        if count == self.seen {
            return Ok(None);
        }
        let coalesced = count.wrapping_sub(self.seen);
        self.seen = count;
        Ok(Some(Pulse { prev, at, coalesced }))
    }
}

impl Drop for PulseReceiver {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Keeps `signal` off the calling thread so only the worker is interrupted.
pub fn block_on_current_thread(signal: Signal) -> Result<(), ReceiverError> {
    let mut set = SigSet::empty();
    set.add(signal);
    set.thread_block()?;
    Ok(())
}

/// Maps a monotonic stamp back onto the wall clock.
pub fn wall_time_of(at: Duration, mono_now: Duration, wall_now: DateTime<Utc>) -> DateTime<Utc> {
    let age = mono_now.saturating_sub(at);
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| wall_now.checked_sub_signed(age))
        .unwrap_or(wall_now)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub pulses: u64,
    pub coalesced: u64,
    pub truncated_labels: u64,
}

/// Classification loop fed by the pulse handler.
pub struct PulseWorker {
    receiver: PulseReceiver,
    tracker: AlarmTracker,
}

impl PulseWorker {
    pub fn new(receiver: PulseReceiver, tracker: AlarmTracker) -> Self {
        Self { receiver, tracker }
    }

    /// Runs until the control channel leaves Running. Each wait is bounded by
    /// `LIFECYCLE_CHECK`, and a pulse seen after shutdown was requested is not
    /// published.
    pub fn run(
        mut self,
        alarm: &AlarmRecord,
        control: &ControlRecord,
    ) -> Result<WorkerReport, ReceiverError> {
        let mut report = WorkerReport::default();
        while control.is_running() {
            let Some(pulse) = self.receiver.wait(LIFECYCLE_CHECK)? else {
                continue;
            };
            if !control.is_running() {
                debug!("pulse_dropped_during_shutdown");
                break;
            }
            let wall = wall_time_of(pulse.at, monotonic_now(), Utc::now());
            let (state, classification) =
                self.tracker.on_pulses(pulse.prev, pulse.at, pulse.coalesced, wall);
            if alarm.publish(&state) {
                report.truncated_labels += 1;
                warn!(label = %state.label, "alarm_label_truncated");
            }
            report.pulses += 1;
            report.coalesced += pulse.coalesced.saturating_sub(1);
            info!(
                severity = %state.severity,
                elapsed_ms = classification.elapsed.map(|e| e.as_millis() as u64),
                label = %state.label,
                cursor = state.cursor,
                coalesced = pulse.coalesced,
                "pulse_classified"
            );
        }
        info!(pulses = report.pulses, lifecycle = %control.lifecycle(), "pulse_worker_stopped");
        Ok(report)
    }
}
