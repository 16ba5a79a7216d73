use crate::channel::{ChannelError, Region, SharedRecord};
use crate::control::ControlRecord;
use crate::seqlock::SeqCounter;
use crate::text::{load_field, store_field};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use std::sync::atomic::AtomicU8;
use tracing::{debug, info, warn};

pub const ZONE_SLOTS: usize = 3;
pub const ZONE_TEXT_WIDTH: usize = 64;
const READ_ATTEMPTS: u32 = 16;
const CLOCK_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

#[repr(C)]
pub struct ClockRecord {
    seq: SeqCounter,
    zones: [[AtomicU8; ZONE_TEXT_WIDTH]; ZONE_SLOTS],
}

// SAFETY: atomics only; all-zero decodes to three blank lines.
unsafe impl SharedRecord for ClockRecord {
    const KIND: &'static str = "clock";
}

pub type ClockChannel = Region<ClockRecord>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockState {
    pub lines: [String; ZONE_SLOTS],
}

impl ClockRecord {
    pub fn publish(&self, state: &ClockState) -> usize {
        self.seq.write(|| {
            self.zones
                .iter()
                .zip(state.lines.iter())
                .map(|(slot, line)| store_field(slot, line))
                .filter(|truncated| *truncated)
                .count()
        })
    }

    pub fn snapshot(&self) -> Option<ClockState> {
        self.seq.read(READ_ATTEMPTS, || ClockState {
            lines: std::array::from_fn(|index| load_field(&self.zones[index])),
        })
    }
}

impl Region<ClockRecord> {
    pub fn read_state(&self) -> Result<ClockState, ChannelError> {
        self.snapshot().ok_or_else(|| ChannelError::Torn {
            name: self.name().to_string(),
            attempts: READ_ATTEMPTS,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneSpec {
    pub label: String,
    pub utc_offset_minutes: i32,
}

impl ZoneSpec {
    pub fn new(label: impl Into<String>, utc_offset_minutes: i32) -> Self {
        Self {
            label: label.into(),
            utc_offset_minutes,
        }
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.checked_mul(60)?)
    }
}

pub fn default_zones() -> Vec<ZoneSpec> {
    vec![
        ZoneSpec::new("WHITE HOUSE [USA]", -6 * 60),
        ZoneSpec::new("MALTA [MSIDA]", 60),
        ZoneSpec::new("JAPAN [TOKYO]", 9 * 60),
    ]
}

pub fn format_zone(now: DateTime<Utc>, zone: &ZoneSpec) -> String {
    match zone.offset() {
        Some(offset) => format!(
            "{}: {}",
            zone.label,
            now.with_timezone(&offset).format(CLOCK_FORMAT)
        ),
        None => format!("{}: invalid offset", zone.label),
    }
}

/// Formats up to three zones; unused slots stay blank.
pub fn format_zones(now: DateTime<Utc>, zones: &[ZoneSpec]) -> ClockState {
    ClockState {
        lines: std::array::from_fn(|index| {
            zones
                .get(index)
                .map(|zone| format_zone(now, zone))
                .unwrap_or_default()
        }),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdaterReport {
    pub ticks: u64,
    pub truncated_fields: u64,
}

pub struct ClockUpdater {
    zones: Vec<ZoneSpec>,
}

impl ClockUpdater {
    pub fn new(zones: Vec<ZoneSpec>) -> Self {
        if zones.len() > ZONE_SLOTS {
            warn!(
                configured = zones.len(),
                slots = ZONE_SLOTS,
                "clock_zones_dropped"
            );
        }
        Self { zones }
    }

    /// Publishes immediately, then once per control-channel refresh period
    /// until shutdown is requested. No write happens after the request is seen.
    pub fn run(
        &self,
        clock: &ClockRecord,
        control: &ControlRecord,
        mut now: impl FnMut() -> DateTime<Utc>,
    ) -> UpdaterReport {
        let mut report = UpdaterReport::default();
        while control.is_running() {
            let state = format_zones(now(), &self.zones);
            let truncated = clock.publish(&state);
            report.ticks += 1;
            report.truncated_fields += truncated as u64;
            debug!(tick = report.ticks, "clock_tick");
            if !control.sleep_while_running(control.clock_refresh()) {
                break;
            }
        }
        info!(ticks = report.ticks, lifecycle = %control.lifecycle(), "clock_updater_stopped");
        report
    }
}
