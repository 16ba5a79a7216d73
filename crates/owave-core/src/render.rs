use crate::alarm::AlarmState;
use crate::channel::ChannelError;
use crate::clock::{ClockState, ZONE_SLOTS};
use crate::control::ControlRecord;
use crate::layout::DashboardLayout;
use crate::print_lock::PrintLock;
use crate::severity::{Severity, ENTRY_LINES};
use crossterm::cursor::{MoveTo, RestorePosition, SavePosition, Show};
use crossterm::{execute, queue};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::style::Style;
use ratatui::widgets::{Block, Borders, Widget};
use std::io::{self, Stdout, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a finished panel frame goes.
pub trait Surface {
    fn present(&mut self, frame: &Buffer) -> io::Result<()>;

    /// Surfaces without a visible cursor ignore this.
    fn park_cursor(&mut self, _x: u16, _y: u16) -> io::Result<()> {
        Ok(())
    }
}

/// Writes only the cells of the frame's own area, so several processes can
/// share one terminal as long as their areas are disjoint.
pub struct TerminalSurface {
    backend: CrosstermBackend<Stdout>,
}

impl TerminalSurface {
    pub fn stdout() -> Self {
        Self {
            backend: CrosstermBackend::new(io::stdout()),
        }
    }
}

impl Surface for TerminalSurface {
    fn present(&mut self, frame: &Buffer) -> io::Result<()> {
        // The shell owns the cursor; put it back where it was.
        execute!(io::stdout(), SavePosition)?;
        let cells = frame.content.iter().enumerate().map(|(index, cell)| {
            let (x, y) = frame.pos_of(index);
            (x, y, cell)
        });
        self.backend.draw(cells)?;
        Backend::flush(&mut self.backend)?;
        let mut out = io::stdout();
        queue!(out, RestorePosition)?;
        out.flush()
    }

    fn park_cursor(&mut self, x: u16, y: u16) -> io::Result<()> {
        execute!(io::stdout(), MoveTo(x, y), Show)
    }
}

pub trait Panel {
    type State: Clone + PartialEq;

    fn name(&self) -> &'static str;
    fn apply(&mut self, state: &Self::State);
    fn frame(&self) -> &Buffer;
}

/// Alarm log plus the severity colour bar next to it.
pub struct AlarmPanel {
    log: Rect,
    bar: Rect,
    buffer: Buffer,
}

impl AlarmPanel {
    pub fn new(layout: &DashboardLayout) -> Self {
        let log = layout.alarm;
        let bar = layout.colour;
        let mut buffer = Buffer::empty(log.union(bar));
        Block::default()
            .borders(Borders::ALL)
            .title("Alarms")
            .render(log, &mut buffer);
        Block::default().borders(Borders::ALL).render(bar, &mut buffer);
        let mut panel = Self { log, bar, buffer };
        panel.paint_bar(Severity::Calm);
        panel
    }

    fn paint_bar(&mut self, severity: Severity) {
        self.buffer
            .set_style(self.bar, Style::default().bg(severity.color()));
    }

    pub fn entry_lines(label: &str) -> [String; ENTRY_LINES as usize] {
        [
            format!("[{label}] Alarm Received"),
            format!("[{label}] Alarm Handled"),
        ]
    }
}

impl Panel for AlarmPanel {
    type State = AlarmState;

    fn name(&self) -> &'static str {
        "alarm"
    }

    fn apply(&mut self, state: &AlarmState) {
        // Entries from earlier events stay until the cursor wraps over them.
        if state.events > 0 {
            for (offset, line) in Self::entry_lines(&state.label).iter().enumerate() {
                let at = state.cursor.saturating_add(offset as u16);
                write_row(&mut self.buffer, self.log, at, line);
            }
        }
        self.paint_bar(state.severity);
    }

    fn frame(&self) -> &Buffer {
        &self.buffer
    }
}

pub struct ClockPanel {
    area: Rect,
    buffer: Buffer,
}

impl ClockPanel {
    pub fn new(layout: &DashboardLayout) -> Self {
        let area = layout.time;
        let mut buffer = Buffer::empty(area);
        Block::default()
            .borders(Borders::ALL)
            .title("Time")
            .render(area, &mut buffer);
        Self { area, buffer }
    }
}

impl Panel for ClockPanel {
    type State = ClockState;

    fn name(&self) -> &'static str {
        "clock"
    }

    fn apply(&mut self, state: &ClockState) {
        for (index, line) in state.lines.iter().enumerate().take(ZONE_SLOTS) {
            write_row(&mut self.buffer, self.area, index as u16 + 1, line);
        }
    }

    fn frame(&self) -> &Buffer {
        &self.buffer
    }
}

/// Blanks row `line` inside the border of `area` and writes `text` there.
/// Rows that fall on or outside the border are ignored.
pub fn write_row(buffer: &mut Buffer, area: Rect, line: u16, text: &str) {
    let inner_width = area.width.saturating_sub(2);
    if line == 0 || inner_width == 0 || line >= area.height.saturating_sub(1) {
        return;
    }
    let x = area.x + 1;
    let y = area.y + line;
    let width = usize::from(inner_width);
    buffer.set_stringn(x, y, " ".repeat(width), width, Style::default());
    buffer.set_stringn(x, y, text, width, Style::default());
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenderReport {
    pub passes: u64,
    pub presented: u64,
    pub skipped_busy: u64,
    pub stale_reads: u64,
    pub draw_errors: u64,
}

/// Poll, draw under the print lock, sleep; until the lifecycle leaves Running.
pub struct RenderLoop<P: Panel, S: Surface> {
    panel: P,
    surface: S,
}

impl<P: Panel, S: Surface> RenderLoop<P, S> {
    pub fn new(panel: P, surface: S) -> Self {
        Self { panel, surface }
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// A failed poll keeps the previous frame. A busy lock skips the pass and
    /// the next one comes on the normal cadence. The lock is released before
    /// every sleep.
    pub fn run(
        &mut self,
        lock: &PrintLock,
        control: &ControlRecord,
        cadence: fn(&ControlRecord) -> Duration,
        mut poll: impl FnMut() -> Result<P::State, ChannelError>,
    ) -> RenderReport {
        let mut report = RenderReport::default();
        let mut last: Option<P::State> = None;
        while control.is_running() {
            report.passes += 1;
            match poll() {
                Ok(state) => {
                    if last.as_ref() != Some(&state) {
                        self.panel.apply(&state);
                        last = Some(state);
                    }
                }
                Err(err) => {
                    report.stale_reads += 1;
                    warn!(panel = self.panel.name(), error = %err, "render_poll_failed");
                }
            }
            match lock.try_acquire() {
                Ok(Some(_guard)) => match self.surface.present(self.panel.frame()) {
                    Ok(()) => report.presented += 1,
                    Err(err) => {
                        report.draw_errors += 1;
                        warn!(panel = self.panel.name(), error = %err, "render_draw_failed");
                    }
                },
                Ok(None) => {
                    report.skipped_busy += 1;
                    debug!(panel = self.panel.name(), "render_lock_busy");
                }
                Err(err) => {
                    report.draw_errors += 1;
                    warn!(panel = self.panel.name(), error = %err, "render_lock_failed");
                }
            }
            if !control.sleep_while_running(cadence(control)) {
                break;
            }
        }
        info!(
            panel = self.panel.name(),
            passes = report.passes,
            presented = report.presented,
            skipped = report.skipped_busy,
            "render_loop_stopped"
        );
        report
    }
}
