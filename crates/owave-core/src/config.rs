use crate::channel::{sanitize_component, AttachConfig};
use crate::clock::{default_zones, ZoneSpec, ZONE_SLOTS};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "OWAVE_CONFIG";
// Leaves room for "/" and the region kind inside NAME_MAX.
const MAX_SESSION_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DashboardConfig {
    pub session: Option<String>,
    pub alarm_poll_ms: u32,
    pub clock_refresh_secs: u32,
    pub shutdown_grace_ms: u64,
    pub attach: AttachConfig,
    pub zones: Vec<ZoneSpec>,
    pub log_dir: PathBuf,
    pub log_level: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub transcript: Option<PathBuf>,
    pub lock_path: Option<PathBuf>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            session: None,
            alarm_poll_ms: 1000,
            clock_refresh_secs: 1,
            shutdown_grace_ms: 2000,
            attach: AttachConfig::default(),
            zones: default_zones(),
            log_dir: PathBuf::from(".owave/logs"),
            log_level: None,
            pid_file: None,
            transcript: None,
            lock_path: None,
        }
    }
}

impl DashboardConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Overlays `OWAVE_*` variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(value) = get("OWAVE_SESSION") {
            self.session = Some(value);
        }
        if let Some(value) = get("OWAVE_ALARM_POLL_MS") {
            self.alarm_poll_ms = parse_number("alarm_poll_ms", &value)?;
        }
        if let Some(value) = get("OWAVE_CLOCK_REFRESH_SECS") {
            self.clock_refresh_secs = parse_number("clock_refresh_secs", &value)?;
        }
        if let Some(value) = get("OWAVE_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_ms = parse_number("shutdown_grace_ms", &value)?;
        }
        if let Some(value) = get("OWAVE_LOG_DIR") {
            self.log_dir = PathBuf::from(value);
        }
        if let Some(value) = get("OWAVE_LOG_LEVEL") {
            self.log_level = Some(value);
        }
        if let Some(value) = get("OWAVE_PID_FILE") {
            self.pid_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("OWAVE_TRANSCRIPT") {
            self.transcript = Some(PathBuf::from(value));
        }
        if let Some(value) = get("OWAVE_LOCK_PATH") {
            self.lock_path = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alarm_poll_ms == 0 {
            return Err(invalid("alarm_poll_ms", "must be at least 1"));
        }
        if self.clock_refresh_secs == 0 {
            return Err(invalid("clock_refresh_secs", "must be at least 1"));
        }
        if self.attach.attempts == 0 {
            return Err(invalid("attach.attempts", "must be at least 1"));
        }
        if self.zones.is_empty() || self.zones.len() > ZONE_SLOTS {
            return Err(invalid(
                "zones",
                format!("expected 1 to {ZONE_SLOTS} zones, got {}", self.zones.len()),
            ));
        }
        if let Some(zone) = self.zones.iter().find(|zone| zone.offset().is_none()) {
            return Err(invalid(
                "zones",
                format!("{} has out-of-range offset {}", zone.label, zone.utc_offset_minutes),
            ));
        }
        if let Some(session) = &self.session {
            if session.trim().is_empty() || session.len() > MAX_SESSION_LEN {
                return Err(invalid(
                    "session",
                    format!("must be 1 to {MAX_SESSION_LEN} characters"),
                ));
            }
        }
        Ok(())
    }

    pub fn session_name(&self, pid: u32) -> String {
        match &self.session {
            Some(session) => sanitize_component(session),
            None => format!("owave-{pid}"),
        }
    }

    pub fn lock_path_for(&self, session: &str) -> PathBuf {
        self.lock_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("owave-{session}.print.lock")))
    }

    pub fn transcript_for(&self, session: &str) -> PathBuf {
        self.transcript
            .clone()
            .unwrap_or_else(|| self.log_dir.join(format!("owave-{session}-output.log")))
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(field, format!("{value:?} is not a number")))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
