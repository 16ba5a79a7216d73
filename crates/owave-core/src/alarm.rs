use crate::channel::{ChannelError, Region, SharedRecord};
use crate::seqlock::SeqCounter;
use crate::severity::{Classification, Classifier, DisplayCursor, Severity, CURSOR_TOP};
use crate::text::{load_field, store_field};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::warn;

pub const LABEL_WIDTH: usize = 32;
pub const READ_ATTEMPTS: u32 = 16;

/// Alarm channel layout: severity code (0 = never written, 1..=5 bands),
/// event label, display cursor and event count, behind a sequence counter.
#[repr(C)]
pub struct AlarmRecord {
    seq: SeqCounter,
    severity: AtomicU32,
    cursor: AtomicU32,
    events: AtomicU64,
    label: [AtomicU8; LABEL_WIDTH],
}

// SAFETY: atomics only; all-zero decodes to the default state.
unsafe impl SharedRecord for AlarmRecord {
    const KIND: &'static str = "alarm";
}

pub type AlarmChannel = Region<AlarmRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmState {
    pub severity: Severity,
    pub label: String,
    pub cursor: u16,
    pub events: u64,
}

impl Default for AlarmState {
    fn default() -> Self {
        Self {
            severity: Severity::Calm,
            label: String::new(),
            cursor: CURSOR_TOP,
            events: 0,
        }
    }
}

impl AlarmRecord {
    /// Single-writer update. Returns true when the label had to be truncated.
    pub fn publish(&self, state: &AlarmState) -> bool {
        self.seq.write(|| {
            self.severity.store(state.severity.code(), Ordering::Relaxed);
            self.cursor.store(u32::from(state.cursor), Ordering::Relaxed);
            self.events.store(state.events, Ordering::Relaxed);
            store_field(&self.label, &state.label)
        })
    }

    pub fn snapshot(&self) -> Option<AlarmState> {
        let (code, cursor, events, label) = self.seq.read(READ_ATTEMPTS, || {
            (
                self.severity.load(Ordering::Relaxed),
                self.cursor.load(Ordering::Relaxed),
                self.events.load(Ordering::Relaxed),
                load_field(&self.label),
            )
        })?;
        let severity = match code {
            0 => Severity::Calm,
            code => Severity::from_code(code).unwrap_or_else(|| {
                warn!(code, "alarm_unknown_severity_code");
                Severity::Calm
            }),
        };
        let cursor = u16::try_from(cursor)
            .ok()
            .filter(|line| *line >= CURSOR_TOP)
            .unwrap_or(CURSOR_TOP);
        Some(AlarmState {
            severity,
            label,
            cursor,
            events,
        })
    }
}

impl Region<AlarmRecord> {
    pub fn read_state(&self) -> Result<AlarmState, ChannelError> {
        self.snapshot().ok_or_else(|| ChannelError::Torn {
            name: self.name().to_string(),
            attempts: READ_ATTEMPTS,
        })
    }
}

/// Writer-side bookkeeping: previous pulse, cursor, and event count.
#[derive(Debug, Clone)]
pub struct AlarmTracker {
    classifier: Classifier,
    cursor: DisplayCursor,
    events: u64,
}

impl AlarmTracker {
    pub fn new(started_at: Duration, panel_height: u16) -> Self {
        Self {
            classifier: Classifier::new(started_at),
            cursor: DisplayCursor::new(panel_height),
            events: 0,
        }
    }

    pub fn on_pulse(&mut self, at: Duration, wall: DateTime<Utc>) -> (AlarmState, Classification) {
        self.on_pulses(at, at, 1, wall)
    }

    /// Accounts for `count` pulses seen in one wakeup: every one of them
    /// counts as an event and moves the cursor, the published severity is
    /// the last pulse's own gap (`at - prev`).
    pub fn on_pulses(
        &mut self,
        prev: Duration,
        at: Duration,
        count: u64,
        wall: DateTime<Utc>,
    ) -> (AlarmState, Classification) {
        let count = count.max(1);
        let classification = self.classifier.observe_burst(prev, at, count);
        self.events += count;
        let mut cursor = self.cursor.line();
        for _ in 0..count.min(u64::from(u16::MAX)) {
            cursor = self.cursor.advance();
        }
        let state = AlarmState {
            severity: classification.severity,
            label: event_label(wall),
            cursor,
            events: self.events,
        };
        (state, classification)
    }

    pub fn events(&self) -> u64 {
        self.events
    }
}

pub fn event_label(wall: DateTime<Utc>) -> String {
    wall.format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::unique_name;
    use chrono::TimeZone;

    fn wall(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, min, sec)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn fresh_channel_reads_default_state() {
        let name = unique_name("alarm-default");
        let channel = AlarmChannel::create(&name).expect("create");
        assert_eq!(channel.read_state().expect("read"), AlarmState::default());
        channel.destroy().expect("destroy");
    }

    #[test]
    fn published_state_reads_back_unchanged() {
        let name = unique_name("alarm-roundtrip");
        let owner = AlarmChannel::create(&name).expect("create");
        let reader = AlarmChannel::attach(&name).expect("attach");
        let state = AlarmState {
            severity: Severity::Warning,
            label: "21:04:59".to_string(),
            cursor: 5,
            events: 3,
        };
        assert!(!owner.publish(&state));
        assert_eq!(reader.read_state().expect("read"), state);
        assert_eq!(reader.read_state().expect("read again"), state);
        drop(reader);
        owner.destroy().expect("destroy");
    }

    #[test]
    fn oversized_label_is_truncated_not_overflowed() {
        let name = unique_name("alarm-trunc");
        let owner = AlarmChannel::create(&name).expect("create");
        let state = AlarmState {
            label: "x".repeat(100),
            ..AlarmState::default()
        };
        assert!(owner.publish(&state));
        let read = owner.read_state().expect("read");
        assert_eq!(read.label.len(), LABEL_WIDTH - 1);
        owner.destroy().expect("destroy");
    }

    #[test]
    fn two_pulses_seven_seconds_apart_are_elevated() {
        let mut tracker = AlarmTracker::new(Duration::from_secs(50), 12);
        let (first, _) = tracker.on_pulse(Duration::from_secs(80), wall(9, 0, 0));
        assert_eq!(first.severity, Severity::Calm);
        assert_eq!(first.cursor, 1);

        let (second, classification) = tracker.on_pulse(Duration::from_secs(87), wall(9, 0, 7));
        assert_eq!(second.severity, Severity::Elevated);
        assert_eq!(classification.elapsed, Some(Duration::from_secs(7)));
        assert_eq!(second.label, "09:00:07");
        assert_eq!(second.cursor, 3);
        assert_eq!(second.events, 2);
    }

    #[test]
    fn coalesced_pulses_each_count_and_move_the_cursor() {
        let mut tracker = AlarmTracker::new(Duration::ZERO, 12);
        tracker.on_pulse(Duration::from_secs(100), wall(9, 0, 0));
        let (state, classification) = tracker.on_pulses(
            Duration::from_secs(114),
            Duration::from_millis(114_001),
            2,
            wall(9, 0, 14),
        );
        assert_eq!(state.severity, Severity::Calm);
        assert_eq!(classification.elapsed, Some(Duration::from_millis(1)));
        assert_eq!(state.events, 3);
        assert_eq!(state.cursor, 5);
        assert_eq!(tracker.events(), 3);
    }

    #[test]
    fn labels_are_utc_hms() {
        assert_eq!(event_label(wall(23, 5, 1)), "23:05:01");
    }
}
