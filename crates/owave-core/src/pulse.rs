use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const MAX_INTERVAL: Duration = Duration::from_secs(25);
pub const PULSE_SIGNAL: Signal = Signal::SIGALRM;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target pid {0:?} is not a number")]
    NotANumber(String),
    #[error("target pid must be positive, got {0}")]
    NotPositive(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPid(i32);

impl TargetPid {
    pub fn new(raw: i32) -> Result<Self, TargetError> {
        if raw <= 0 {
            return Err(TargetError::NotPositive(i64::from(raw)));
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl FromStr for TargetPid {
    type Err = TargetError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let value: i64 = trimmed
            .parse()
            .map_err(|_| TargetError::NotANumber(trimmed.to_string()))?;
        if value <= 0 {
            return Err(TargetError::NotPositive(value));
        }
        i32::try_from(value)
            .map(Self)
            .map_err(|_| TargetError::NotANumber(trimmed.to_string()))
    }
}

impl fmt::Display for TargetPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("target process {0} no longer exists")]
    TargetGone(TargetPid),
    #[error("not permitted to signal process {0}")]
    Denied(TargetPid),
    #[error("delivering pulse to {target}: {source}")]
    Sys {
        target: TargetPid,
        #[source]
        source: Errno,
    },
}

pub trait PulseSink {
    fn deliver(&mut self, target: TargetPid) -> Result<(), GeneratorError>;
}

/// Delivers pulses as a real signal.
pub struct SignalSink {
    signal: Signal,
}

impl SignalSink {
    pub fn new(signal: Signal) -> Self {
        Self { signal }
    }
}

impl Default for SignalSink {
    fn default() -> Self {
        Self::new(PULSE_SIGNAL)
    }
}

impl PulseSink for SignalSink {
    fn deliver(&mut self, target: TargetPid) -> Result<(), GeneratorError> {
        kill(Pid::from_raw(target.get()), self.signal).map_err(|errno| match errno {
            Errno::ESRCH => GeneratorError::TargetGone(target),
            Errno::EPERM => GeneratorError::Denied(target),
            source => GeneratorError::Sys { target, source },
        })
    }
}

/// Uniform delays in `[0, max)` at millisecond resolution.
pub struct PulseSchedule {
    rng: StdRng,
    max: Duration,
}

impl PulseSchedule {
    pub fn new(max: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, max }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn next_delay(&mut self) -> Duration {
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..max_ms))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneratorReport {
    pub pulses: u64,
    pub waited: Duration,
}

pub struct Generator<S: PulseSink> {
    target: TargetPid,
    schedule: PulseSchedule,
    sink: S,
    count: Option<u64>,
}

impl<S: PulseSink> Generator<S> {
    pub fn new(target: TargetPid, schedule: PulseSchedule, sink: S) -> Self {
        Self {
            target,
            schedule,
            sink,
            count: None,
        }
    }

    /// Stop after `count` pulses instead of running forever.
    pub fn with_count(mut self, count: Option<u64>) -> Self {
        self.count = count;
        self
    }

    /// Wait, then deliver; repeat. The first delivery error ends the run and
    /// no pulse is retried.
    pub fn run(
        &mut self,
        mut pause: impl FnMut(Duration),
    ) -> Result<GeneratorReport, GeneratorError> {
        let mut report = GeneratorReport::default();
        while self.count.map_or(true, |count| report.pulses < count) {
            let delay = self.schedule.next_delay();
            debug!(target_pid = %self.target, delay_ms = delay.as_millis() as u64, "pulse_delay");
            pause(delay);
            report.waited += delay;
            self.sink.deliver(self.target)?;
            report.pulses += 1;
            info!(target_pid = %self.target, pulse = report.pulses, "pulse_sent");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeSink {
        delivered: Vec<TargetPid>,
        fail_after: Option<usize>,
    }

    impl PulseSink for FakeSink {
        fn deliver(&mut self, target: TargetPid) -> Result<(), GeneratorError> {
            if self.fail_after == Some(self.delivered.len()) {
                return Err(GeneratorError::TargetGone(target));
            }
            self.delivered.push(target);
            Ok(())
        }
    }

    #[test]
    fn target_pid_must_be_positive_integer() {
        assert_eq!("4242".parse::<TargetPid>().expect("pid").get(), 4242);
        assert_eq!(" 7 ".parse::<TargetPid>().expect("pid").get(), 7);
        assert_eq!("0".parse::<TargetPid>(), Err(TargetError::NotPositive(0)));
        assert_eq!("-3".parse::<TargetPid>(), Err(TargetError::NotPositive(-3)));
        assert!(matches!(
            "abc".parse::<TargetPid>(),
            Err(TargetError::NotANumber(_))
        ));
        assert!(matches!(
            "99999999999".parse::<TargetPid>(),
            Err(TargetError::NotANumber(_))
        ));
        assert!(TargetPid::new(-1).is_err());
    }

    #[test]
    fn delays_stay_below_max() {
        let mut schedule = PulseSchedule::new(MAX_INTERVAL, Some(11));
        for _ in 0..1000 {
            assert!(schedule.next_delay() < MAX_INTERVAL);
        }
        let mut zero = PulseSchedule::new(Duration::ZERO, Some(1));
        assert_eq!(zero.next_delay(), Duration::ZERO);
    }

    #[test]
    fn seeded_schedules_repeat() {
        let mut first = PulseSchedule::new(MAX_INTERVAL, Some(42));
        let mut second = PulseSchedule::new(MAX_INTERVAL, Some(42));
        let a: Vec<_> = (0..8).map(|_| first.next_delay()).collect();
        let b: Vec<_> = (0..8).map(|_| second.next_delay()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn counted_run_pauses_before_each_pulse() {
        let target = TargetPid::new(99).expect("pid");
        let mut generator = Generator::new(
            target,
            PulseSchedule::new(Duration::from_secs(2), Some(3)),
            FakeSink::default(),
        )
        .with_count(Some(4));
        let mut pauses = Vec::new();
        let report = generator.run(|delay| pauses.push(delay)).expect("run");
        assert_eq!(report.pulses, 4);
        assert_eq!(pauses.len(), 4);
        assert_eq!(report.waited, pauses.iter().sum::<Duration>());
        assert_eq!(generator.sink.delivered, vec![target; 4]);
    }

    #[test]
    fn vanished_target_stops_generator() {
        let target = TargetPid::new(1234).expect("pid");
        let mut generator = Generator::new(
            target,
            PulseSchedule::new(Duration::from_millis(5), Some(0)),
            FakeSink {
                delivered: Vec::new(),
                fail_after: Some(2),
            },
        );
        let err = generator.run(|_| {}).err().expect("delivery failure");
        assert!(matches!(err, GeneratorError::TargetGone(pid) if pid == target));
        assert_eq!(generator.sink.delivered.len(), 2);
    }

    #[test]
    fn signalling_missing_process_reports_target_gone() {
        // Spawn and reap a child so its pid is known to be free.
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id() as i32;
        child.wait().expect("reap");
        let mut sink = SignalSink::default();
        let err = sink
            .deliver(TargetPid::new(pid).expect("pid"))
            .err()
            .expect("dead target");
        assert!(matches!(err, GeneratorError::TargetGone(_)));
    }
}
