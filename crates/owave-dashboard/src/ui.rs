use anyhow::Result;
use crossterm::cursor::Show;
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen,
};
use owave_core::layout::DashboardLayout;
use owave_core::print_lock::PrintLock;
use owave_core::render::{write_row, Surface, TerminalSurface};
use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::widgets::{Block, Borders, Widget};
use std::io;

pub fn setup_terminal() -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, Clear(ClearType::All))?;
    Ok(())
}

pub fn restore_terminal() -> Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), LeaveAlternateScreen, Show)?;
    Ok(())
}

/// Next line for a wrapping panel counter: advances while inside the border,
/// back to the top after the last usable row.
pub fn advance_line(line: u16, panel_height: u16) -> u16 {
    if line < panel_height.saturating_sub(2) {
        line + 1
    } else {
        1
    }
}

struct TextPanel {
    area: Rect,
    buffer: Buffer,
    line: u16,
}

impl TextPanel {
    fn new(area: Rect, title: &'static str) -> Self {
        let mut buffer = Buffer::empty(area);
        Block::default()
            .borders(Borders::ALL)
            .title(title)
            .render(area, &mut buffer);
        Self {
            area,
            buffer,
            line: 1,
        }
    }

    fn write_current(&mut self, text: &str) {
        write_row(&mut self.buffer, self.area, self.line, text);
    }

    fn advance(&mut self) {
        self.line = advance_line(self.line, self.area.height);
    }
}

/// Prompt and output panels owned by the shell process.
pub struct ShellView<S: Surface> {
    prompt: TextPanel,
    output: TextPanel,
    surface: S,
}

impl ShellView<TerminalSurface> {
    pub fn terminal(layout: &DashboardLayout) -> Self {
        Self::new(layout, TerminalSurface::stdout())
    }
}

impl<S: Surface> ShellView<S> {
    pub fn new(layout: &DashboardLayout, surface: S) -> Self {
        Self {
            prompt: TextPanel::new(layout.prompt, "Prompt"),
            output: TextPanel::new(layout.output, "Output"),
            surface,
        }
    }

    pub fn edit_prompt(&mut self, prompt: &str, input: &str) {
        self.prompt.write_current(&format!("{prompt}>{input}"));
    }

    /// Moves the prompt to its next line after a command was submitted.
    pub fn submit_prompt(&mut self) {
        self.prompt.advance();
    }

    /// Writes each line on its own row; a command's output then leaves the
    /// counter one row further down.
    pub fn push_output(&mut self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        for (index, line) in lines.iter().enumerate() {
            if index > 0 {
                self.output.advance();
            }
            self.output.write_current(line);
        }
        self.output.advance();
    }

    #[cfg(test)]
    pub fn prompt_line(&self) -> u16 {
        self.prompt.line
    }

    #[cfg(test)]
    pub fn output_line(&self) -> u16 {
        self.output.line
    }

    /// Draws both panels under the print lock and parks the cursor after the
    /// typed input. The lock is held only for the draw.
    pub fn present(&mut self, lock: &PrintLock, cursor_col: u16) -> Result<()> {
        let _guard = lock.acquire()?;
        self.surface.present(&self.output.buffer)?;
        self.surface.present(&self.prompt.buffer)?;
        let area = self.prompt.area;
        let max_col = area.right().saturating_sub(2);
        self.surface.park_cursor(
            (area.x + 1).saturating_add(cursor_col).min(max_col),
            area.y + self.prompt.line,
        )?;
        Ok(())
    }

    #[cfg(test)]
    fn surface(&self) -> &S {
        &self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Frames(Vec<Buffer>);

    impl Surface for Frames {
        fn present(&mut self, frame: &Buffer) -> io::Result<()> {
            self.0.push(frame.clone());
            Ok(())
        }
    }

    fn row(buffer: &Buffer, area: Rect, line: u16) -> String {
        (area.x + 1..area.right() - 1)
            .map(|x| buffer.get(x, area.y + line).symbol().to_string())
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    #[test]
    fn counters_wrap_inside_border() {
        assert_eq!(advance_line(1, 6), 2);
        assert_eq!(advance_line(3, 6), 4);
        assert_eq!(advance_line(4, 6), 1);
        assert_eq!(advance_line(1, 2), 1);
    }

    #[test]
    fn prompt_shows_typed_input_and_moves_on_submit() {
        let layout = DashboardLayout::compute(80, 24);
        let mut view = ShellView::new(&layout, Frames::default());
        view.edit_prompt("OK", "ls -la");
        assert_eq!(row(&view.prompt.buffer, layout.prompt, 1), "OK>ls -la");
        view.submit_prompt();
        assert_eq!(view.prompt_line(), 2);
        view.edit_prompt("OK", "");
        assert_eq!(row(&view.prompt.buffer, layout.prompt, 2), "OK>");
    }

    #[test]
    fn output_lines_stack_and_wrap() {
        let layout = DashboardLayout::compute(80, 24);
        let mut view = ShellView::new(&layout, Frames::default());
        view.push_output(&["first".to_string(), "second".to_string()]);
        assert_eq!(row(&view.output.buffer, layout.output, 1), "first");
        assert_eq!(row(&view.output.buffer, layout.output, 2), "second");
        assert_eq!(view.output_line(), 3);
        // Output panel is 12 rows: usable rows 1..=10.
        for n in 0..8 {
            view.push_output(&[format!("line {n}")]);
        }
        assert_eq!(view.output_line(), 1);
        view.push_output(&["wrapped".to_string()]);
        assert_eq!(row(&view.output.buffer, layout.output, 1), "wrapped");
        assert!(view.surface().0.is_empty());
    }

    #[test]
    fn present_draws_both_panels_under_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = PrintLock::create(dir.path().join("print.lock")).expect("lock");
        let layout = DashboardLayout::compute(80, 24);
        let mut view = ShellView::new(&layout, Frames::default());
        view.edit_prompt("OK", "");
        view.present(&lock, 3).expect("present");
        assert_eq!(view.surface().0.len(), 2);
        assert!(lock.try_acquire().expect("try").is_some());
    }
}
