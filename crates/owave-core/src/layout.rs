use ratatui::layout::Rect;

/// Panel placement for a `cols x rows` terminal.
///
/// Top quarter: time (left half), alarm log (next 3/8), colour bar (last 1/8).
/// Middle half: command output. Bottom quarter: prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardLayout {
    pub time: Rect,
    pub alarm: Rect,
    pub colour: Rect,
    pub output: Rect,
    pub prompt: Rect,
}

impl DashboardLayout {
    pub fn compute(cols: u16, rows: u16) -> Self {
        let top = rows / 4;
        let time_width = cols / 2;
        let alarm_width = fraction(cols, 3, 8);
        let colour_width = cols / 8;
        Self {
            time: Rect::new(0, 0, time_width, top),
            alarm: Rect::new(time_width, 0, alarm_width, top),
            colour: Rect::new(time_width + alarm_width, 0, colour_width, top),
            output: Rect::new(0, top, cols, rows / 2),
            prompt: Rect::new(0, fraction(rows, 3, 4), cols, top),
        }
    }

    pub fn alarm_height(&self) -> u16 {
        self.alarm.height
    }
}

fn fraction(value: u16, numerator: u32, denominator: u32) -> u16 {
    (u32::from(value) * numerator / denominator) as u16
}
