use owave_core::channel::sanitize_component;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "OWAVE_LOG_LEVEL";
pub const LOG_STDOUT_ENV: &str = "OWAVE_LOG_STDOUT";

pub struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl LogGuard {
    #[cfg(test)]
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

/// Every dashboard process shares the terminal, so logs go to
/// `<log_dir>/owave-<session>-<role>.log` and only reach stdout when
/// `OWAVE_LOG_STDOUT=1`.
pub fn init_logging(log_dir: &Path, session: &str, role: &str, level: Option<&str>) -> LogGuard {
    let level = level
        .map(str::to_string)
        .or_else(|| env::var(LOG_LEVEL_ENV).ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir, session, role) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stdout_enabled = resolve_log_stdout();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout_enabled,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}

fn resolve_log_stdout() -> bool {
    env::var(LOG_STDOUT_ENV)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

pub fn log_file_name(session: &str, role: &str) -> String {
    format!(
        "owave-{}-{}.log",
        sanitize_component(session),
        sanitize_component(role)
    )
}

fn open_log_file(log_dir: &Path, session: &str, role: &str) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    std::fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(log_file_name(session, role)))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_names_are_sanitized() {
        assert_eq!(log_file_name("lab 1", "alarm-renderer"), "owave-lab_1-alarm-renderer.log");
    }

    #[test]
    fn log_file_is_created_under_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = dir.path().join("logs");
        let guard = open_log_file(&logs, "s", "dashboard").expect("open");
        assert!(guard.has_file());
        assert!(logs.join("owave-s-dashboard.log").exists());
    }

    #[test]
    fn empty_log_dir_disables_file() {
        let guard = open_log_file(Path::new(""), "s", "dashboard").expect("open");
        assert!(!guard.has_file());
    }
}
