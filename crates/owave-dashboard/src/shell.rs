use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use owave_core::control::{ControlRecord, LIFECYCLE_CHECK};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as Process, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest an external command may run without printing before it is killed.
const COMMAND_WAIT: Duration = Duration::from_secs(10);
/// Longest output line kept from an external command.
const MAX_OUTPUT_LINE: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Chdir(String),
    Shdir,
    Print(String),
    PrintVar(String),
    Set { var: String, value: String },
    Move(String),
    Exit,
    External(String),
}

/// First word selects the command; the rest of the line is its argument.
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word {
        "" => Command::Empty,
        "chdir" => Command::Chdir(rest.to_string()),
        "shdir" => Command::Shdir,
        "print" => Command::Print(rest.to_string()),
        "printvar" => Command::PrintVar(rest.to_string()),
        "set" => match rest.split_once('=') {
            Some((var, value)) => Command::Set {
                var: var.trim().to_string(),
                value: value.trim().to_string(),
            },
            None => Command::Set {
                var: rest.to_string(),
                value: String::new(),
            },
        },
        "move" => Command::Move(rest.to_string()),
        "exit" => Command::Exit,
        _ => Command::External(line.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellVars {
    pub prompt: String,
    pub path: String,
    pub buffer: (u16, u16),
}

impl Default for ShellVars {
    fn default() -> Self {
        Self {
            prompt: "OK".to_string(),
            path: String::new(),
            buffer: (80, 256),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub lines: Vec<String>,
    pub exit: bool,
}

impl Outcome {
    fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
            exit: false,
        }
    }
}

pub struct Shell {
    vars: ShellVars,
    cwd: PathBuf,
    transcript: Option<File>,
}

impl Shell {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            vars: ShellVars::default(),
            cwd,
            transcript: None,
        }
    }

    pub fn with_transcript(mut self, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.transcript = Some(file);
        Ok(self)
    }

    #[cfg(test)]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn prompt(&self) -> &str {
        &self.vars.prompt
    }

    /// Runs one command line. The refresh variable lives in the control
    /// channel so the clock processes pick it up.
    pub fn execute(&mut self, line: &str, control: &ControlRecord) -> Outcome {
        let command = parse_command(line);
        info!(command = ?command, "shell_command");
        let outcome = match command {
            Command::Empty => Outcome::default(),
            Command::Chdir(dir) => self.chdir(&dir),
            Command::Shdir => Outcome::line(format!("Current Directory: {}", self.cwd.display())),
            Command::Print(text) => Outcome::line(text),
            Command::PrintVar(var) => Outcome::line(self.print_var(&var, control)),
            Command::Set { var, value } => Outcome::line(self.set_var(&var, &value, control)),
            Command::Move(amount) => Outcome::line(format!(
                "Window was moved by {}",
                amount.parse::<i32>().unwrap_or(0)
            )),
            Command::Exit => Outcome {
                lines: vec!["Orange Wave will now exit".to_string()],
                exit: true,
            },
            Command::External(line) => self.external(&line, control),
        };
        self.record(&outcome.lines);
        outcome
    }

    fn chdir(&mut self, dir: &str) -> Outcome {
        let target = self.cwd.join(dir);
        match target.canonicalize() {
            Ok(resolved) if resolved.is_dir() => {
                let line = format!(
                    "Directory changed from: {} to: {}",
                    self.cwd.display(),
                    resolved.display()
                );
                self.cwd = resolved;
                Outcome::line(line)
            }
            Ok(resolved) => Outcome::line(format!("Not a directory: {}", resolved.display())),
            Err(err) => Outcome::line(format!("Cannot change directory to {dir}: {err}")),
        }
    }

    fn print_var(&self, var: &str, control: &ControlRecord) -> String {
        match var {
            "prompt" => format!("prompt: {}", self.vars.prompt),
            "path" => format!("path: {}", self.vars.path),
            "refresh" => format!("refresh: {}", control.clock_refresh_secs()),
            "buffer" => format!("buffer: {}x{}", self.vars.buffer.0, self.vars.buffer.1),
            other => format!("Unknown variable: {other}"),
        }
    }

    fn set_var(&mut self, var: &str, value: &str, control: &ControlRecord) -> String {
        match var {
            "prompt" => {
                self.vars.prompt = value.to_string();
                format!("prompt was set to: {}", self.vars.prompt)
            }
            "path" => {
                self.vars.path = value.to_string();
                format!("path was set to: {}", self.vars.path)
            }
            "refresh" => match value.parse::<u32>() {
                Ok(secs) if secs > 0 => {
                    control.set_clock_refresh_secs(secs);
                    info!(secs, "clock_refresh_changed");
                    format!("refresh was set to: {secs}")
                }
                _ => format!("refresh must be a positive number of seconds, got {value:?}"),
            },
            "buffer" => match parse_buffer(value) {
                Some(buffer) => {
                    self.vars.buffer = buffer;
                    format!("buffer was set to: {}x{}", buffer.0, buffer.1)
                }
                None => format!("buffer must look like ROWSxCOLS, got {value:?}"),
            },
            other => format!("Unknown variable: {other}"),
        }
    }

    /// Shows the first line the command prints (stdout, else stderr). The
    /// command is killed with its process group once that line is in, after
    /// `COMMAND_WAIT` of silence, or when shutdown is requested.
    fn external(&mut self, line: &str, control: &ControlRecord) -> Outcome {
        let mut lines = vec![format!(
            "{line} was not found as a built-in function, trying to run as an external command"
        )];
        match first_output_line(line, &self.cwd, control) {
            Ok(first) => lines.push(first),
            Err(err) => {
                warn!(command = line, error = %err, "external_command_spawn_failed");
                lines.push(format!("could not run {line}: {err}"));
            }
        }
        Outcome { lines, exit: false }
    }

    fn record(&mut self, lines: &[String]) {
        let Some(file) = self.transcript.as_mut() else {
            return;
        };
        for line in lines {
            if let Err(err) = writeln!(file, "{line}") {
                warn!(error = %err, "transcript_write_failed");
                return;
            }
        }
    }
}

fn first_output_line(line: &str, cwd: &Path, control: &ControlRecord) -> io::Result<String> {
    let mut child = Process::new("sh")
        .arg("-c")
        .arg(line)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let first = stdout
            .and_then(read_first_line)
            .or_else(|| stderr.and_then(read_first_line));
        let _ = tx.send(first);
    });

    let deadline = Instant::now() + COMMAND_WAIT;
    let first = loop {
        match rx.recv_timeout(LIFECYCLE_CHECK) {
            Ok(first) => break first,
            Err(RecvTimeoutError::Disconnected) => break None,
            Err(RecvTimeoutError::Timeout) => {
                if !control.is_running() || Instant::now() >= deadline {
                    warn!(command = line, lifecycle = %control.lifecycle(), "external_command_abandoned");
                    break None;
                }
            }
        }
    };
    stop_child(&mut child, line);
    Ok(first.unwrap_or_default())
}

fn read_first_line(pipe: impl Read) -> Option<String> {
    let mut first = String::new();
    match BufReader::new(pipe.take(MAX_OUTPUT_LINE)).read_line(&mut first) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(first.trim_end_matches(['\n', '\r']).to_string()),
    }
}

/// Gives the command one lifecycle check to finish on its own, then kills
/// its process group and reaps it.
fn stop_child(child: &mut Child, line: &str) {
    let grace = Instant::now() + LIFECYCLE_CHECK;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    info!(command = line, %status, "external_command_failed");
                }
                return;
            }
            Ok(None) if Instant::now() < grace => std::thread::sleep(Duration::from_millis(5)),
            Ok(None) => break,
            Err(err) => {
                warn!(command = line, error = %err, "external_command_wait_failed");
                break;
            }
        }
    }
    if let Ok(pid) = i32::try_from(child.id()) {
        if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(command = line, error = %err, "external_command_kill_failed");
        }
    }
    match child.wait() {
        Ok(status) => debug!(command = line, %status, "external_command_stopped"),
        Err(err) => warn!(command = line, error = %err, "external_command_reap_failed"),
    }
}

fn parse_buffer(value: &str) -> Option<(u16, u16)> {
    let (rows, cols) = value.split_once('x')?;
    Some((rows.trim().parse().ok()?, cols.trim().parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditAction {
    Continue,
    Submit(String),
    Quit,
}

#[derive(Debug, Default)]
pub struct LineEditor {
    input: String,
}

impl LineEditor {
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn handle(&mut self, key: KeyEvent) -> EditAction {
        if key.kind != KeyEventKind::Press {
            return EditAction::Continue;
        }
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => EditAction::Quit,
            KeyCode::Char(ch) => {
                self.input.push(ch);
                EditAction::Continue
            }
            KeyCode::Backspace => {
                self.input.pop();
                EditAction::Continue
            }
            KeyCode::Enter => EditAction::Submit(std::mem::take(&mut self.input)),
            _ => EditAction::Continue,
        }
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
            "/owave-shell-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        ControlChannel::create(&name).expect("control")
    }

    #[test]
    fn parses_builtins_and_arguments() {
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("shdir"), Command::Shdir);
        assert_eq!(parse_command("print  hello world "), Command::Print("hello world".into()));
        assert_eq!(parse_command("printvar refresh"), Command::PrintVar("refresh".into()));
        assert_eq!(
            parse_command("set prompt=READY"),
            Command::Set {
                var: "prompt".into(),
                value: "READY".into()
            }
        );
        assert_eq!(
            parse_command("set refresh"),
            Command::Set {
                var: "refresh".into(),
                value: String::new()
            }
        );
        assert_eq!(parse_command("exit"), Command::Exit);
        assert_eq!(parse_command("ls -la"), Command::External("ls -la".into()));
    }

    #[test]
    fn builtins_update_state_and_transcript() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transcript = dir.path().join("out/output.log");
        let control = control();
        let mut shell = Shell::new(dir.path().to_path_buf())
            .with_transcript(&transcript)
            .expect("transcript");

        let outcome = shell.execute("set prompt=READY", &control);
        assert_eq!(outcome.lines, vec!["prompt was set to: READY"]);
        assert_eq!(shell.prompt(), "READY");

        let outcome = shell.execute("set refresh=3", &control);
        assert_eq!(outcome.lines, vec!["refresh was set to: 3"]);
        assert_eq!(control.clock_refresh_secs(), 3);
        let outcome = shell.execute("set refresh=0", &control);
        assert!(outcome.lines[0].starts_with("refresh must be"));
        assert_eq!(control.clock_refresh_secs(), 3);

        assert_eq!(
            shell.execute("set buffer=40x120", &control).lines,
            vec!["buffer was set to: 40x120"]
        );
        assert_eq!(shell.execute("printvar buffer", &control).lines, vec!["buffer: 40x120"]);
        assert_eq!(shell.execute("move 4", &control).lines, vec!["Window was moved by 4"]);

        let exit = shell.execute("exit", &control);
        assert!(exit.exit);

        let recorded = std::fs::read_to_string(&transcript).expect("read transcript");
        assert!(recorded.starts_with("prompt was set to: READY\n"));
        assert!(recorded.ends_with("Orange Wave will now exit\n"));
        control.destroy().expect("destroy");
    }

    #[test]
    fn chdir_is_tracked_per_shell() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        let control = control();
        let root = dir.path().canonicalize().expect("canonical");
        let mut shell = Shell::new(root.clone());
        let outcome = shell.execute("chdir sub", &control);
        assert_eq!(
            outcome.lines,
            vec![format!(
                "Directory changed from: {} to: {}",
                root.display(),
                root.join("sub").display()
            )]
        );
        assert_eq!(shell.cwd(), root.join("sub"));
        let missing = shell.execute("chdir nowhere", &control);
        assert!(missing.lines[0].starts_with("Cannot change directory"));
        assert_eq!(shell.cwd(), root.join("sub"));
        control.destroy().expect("destroy");
    }

    #[test]
    fn external_command_shows_first_output_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("marker.txt"), "x").expect("write");
        let control = control();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let outcome = shell.execute("ls", &control);
        assert_eq!(outcome.lines.len(), 2);
        assert!(outcome.lines[0].starts_with("ls was not found as a built-in function"));
        assert_eq!(outcome.lines[1], "marker.txt");

        let outcome = shell.execute("printf 'one\\ntwo\\n'", &control);
        assert_eq!(outcome.lines[1], "one");
        control.destroy().expect("destroy");
    }

    #[test]
    fn endless_command_returns_its_first_line_promptly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = control();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let started = Instant::now();
        let outcome = shell.execute("yes", &control);
        assert_eq!(outcome.lines[1], "y");
        assert!(started.elapsed() < Duration::from_secs(5));
        control.destroy().expect("destroy");
    }

    #[test]
    fn silent_command_is_abandoned_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = control();
        control.request_drain();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let started = Instant::now();
        let outcome = shell.execute("sleep 30", &control);
        assert_eq!(outcome.lines[1], "");
        assert!(started.elapsed() < Duration::from_secs(5));
        control.destroy().expect("destroy");
    }

    #[test]
    fn stderr_is_shown_when_stdout_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = control();
        let mut shell = Shell::new(dir.path().to_path_buf());
        let outcome = shell.execute("echo oops >&2; exit 3", &control);
        assert_eq!(outcome.lines[1], "oops");
        control.destroy().expect("destroy");
    }

    #[test]
    fn editor_collects_line_until_enter() {
        let mut editor = LineEditor::default();
        for ch in "lsx".chars() {
            editor.handle(KeyEvent::new(KeyCode::Char(ch), KeyModifiers::NONE));
        }
        editor.handle(KeyEvent::new(KeyCode::Backspace, KeyModifiers::NONE));
        assert_eq!(editor.input(), "ls");
        assert_eq!(
            editor.handle(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE)),
            EditAction::Submit("ls".to_string())
        );
        assert_eq!(editor.input(), "");
        assert_eq!(
            editor.handle(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            EditAction::Quit
        );
    }
}
