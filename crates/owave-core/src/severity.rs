use ratatui::style::Color;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const ELEVATED_FROM: Duration = Duration::from_secs(5);
const WARNING_FROM: Duration = Duration::from_secs(10);
const CAUTION_FROM: Duration = Duration::from_secs(15);
const CAUTION_THROUGH: Duration = Duration::from_secs(20);

/// Heartbeat severity band derived from the gap between two pulses.
///
/// Wire codes are 1..=5 in band order; 0 is reserved for "never written".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Severity {
    #[default]
    Calm,
    Elevated,
    Warning,
    Caution,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Calm,
        Severity::Elevated,
        Severity::Warning,
        Severity::Caution,
        Severity::Critical,
    ];

    /// `[0,5)` Calm, `[5,10)` Elevated, `[10,15)` Warning, `[15,20]` Caution,
    /// anything longer Critical. Exactly 20s stays Caution.
    pub fn classify(elapsed: Duration) -> Self {
        if elapsed < ELEVATED_FROM {
            Severity::Calm
        } else if elapsed < WARNING_FROM {
            Severity::Elevated
        } else if elapsed < CAUTION_FROM {
            Severity::Warning
        } else if elapsed <= CAUTION_THROUGH {
            Severity::Caution
        } else {
            Severity::Critical
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Severity::Calm => 1,
            Severity::Elevated => 2,
            Severity::Warning => 3,
            Severity::Caution => 4,
            Severity::Critical => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Severity::Calm),
            2 => Some(Severity::Elevated),
            3 => Some(Severity::Warning),
            4 => Some(Severity::Caution),
            5 => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Calm => "calm",
            Severity::Elevated => "elevated",
            Severity::Warning => "warning",
            Severity::Caution => "caution",
            Severity::Critical => "critical",
        }
    }

    pub fn color(self) -> Color {
        match self {
            Severity::Calm => Color::White,
            Severity::Elevated => Color::Red,
            Severity::Warning => Color::Rgb(255, 165, 0),
            Severity::Caution => Color::Green,
            Severity::Critical => Color::Blue,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "calm" => Ok(Severity::Calm),
            "elevated" => Ok(Severity::Elevated),
            "warning" => Ok(Severity::Warning),
            "caution" => Ok(Severity::Caution),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

/// Tracks the previous pulse on the monotonic clock.
///
/// The baseline is the receiver start; the very first pulse is reported as
/// Calm regardless of how long the receiver waited for it.
#[derive(Debug, Clone)]
pub struct Classifier {
    prev: Duration,
    pulses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub severity: Severity,
    pub elapsed: Option<Duration>,
}

impl Classifier {
    pub fn new(started_at: Duration) -> Self {
        Self {
            prev: started_at,
            pulses: 0,
        }
    }

    pub fn observe(&mut self, now: Duration) -> Classification {
        // A pulse stamped before the previous one (coalesced wakeups) counts as zero gap.
        let elapsed = now.saturating_sub(self.prev);
        self.prev = self.prev.max(now);
        self.pulses += 1;
        if self.pulses == 1 {
            return Classification {
                severity: Severity::Calm,
                elapsed: None,
            };
        }
        Classification {
            severity: Severity::classify(elapsed),
            elapsed: Some(elapsed),
        }
    }

    /// Folds `count` pulses that arrived before the worker woke. Only the last
    /// one is classified, against `prev`, the stamp of the pulse before it.
    pub fn observe_burst(&mut self, prev: Duration, now: Duration, count: u64) -> Classification {
        if count > 1 {
            self.pulses += count - 1;
            self.prev = self.prev.max(prev);
        }
        self.observe(now)
    }

    pub fn pulses(&self) -> u64 {
        self.pulses
    }
}

/// Number of rows each alarm entry occupies (received + handled).
pub const ENTRY_LINES: u16 = 2;
pub const CURSOR_STEP: u16 = 2;
pub const CURSOR_TOP: u16 = 1;

/// Rolling line offset inside the alarm panel.
///
/// Row 0 and row `height-1` are the border, so an entry starting at `line`
/// needs `line + ENTRY_LINES - 1 <= height - 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayCursor {
    line: u16,
    panel_height: u16,
    placed: bool,
}

impl DisplayCursor {
    pub fn new(panel_height: u16) -> Self {
        Self {
            line: CURSOR_TOP,
            panel_height,
            placed: false,
        }
    }

    pub fn line(&self) -> u16 {
        self.line
    }

    pub fn panel_height(&self) -> u16 {
        self.panel_height
    }

    /// Returns the line for the next event. The first event lands on the top line.
    pub fn advance(&mut self) -> u16 {
        if self.placed {
            self.line = next_line(self.line, self.panel_height);
        } else {
            self.line = CURSOR_TOP;
            self.placed = true;
        }
        self.line
    }
}

pub fn next_line(current: u16, panel_height: u16) -> u16 {
    let last_start = panel_height.saturating_sub(1 + ENTRY_LINES);
    let next = current.saturating_add(CURSOR_STEP);
    if next <= last_start {
        next
    } else {
        CURSOR_TOP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs_f(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    #[test]
    fn boundaries_land_in_documented_bands() {
        assert_eq!(Severity::classify(secs_f(0.0)), Severity::Calm);
        assert_eq!(Severity::classify(secs_f(4.999)), Severity::Calm);
        assert_eq!(Severity::classify(secs_f(5.0)), Severity::Elevated);
        assert_eq!(Severity::classify(secs_f(10.0)), Severity::Warning);
        assert_eq!(Severity::classify(secs_f(15.0)), Severity::Caution);
        assert_eq!(Severity::classify(secs_f(20.0)), Severity::Caution);
        assert_eq!(Severity::classify(secs_f(20.0001)), Severity::Critical);
        assert_eq!(Severity::classify(Duration::from_secs(3600)), Severity::Critical);
    }

    #[test]
    fn every_millisecond_up_to_thirty_seconds_matches_its_band() {
        for ms in 0..30_000u64 {
            let expected = match ms {
                0..=4_999 => Severity::Calm,
                5_000..=9_999 => Severity::Elevated,
                10_000..=14_999 => Severity::Warning,
                15_000..=20_000 => Severity::Caution,
                _ => Severity::Critical,
            };
            assert_eq!(
                Severity::classify(Duration::from_millis(ms)),
                expected,
                "elapsed {ms}ms"
            );
        }
    }

    #[test]
    fn codes_follow_band_order() {
        for (index, severity) in Severity::ALL.iter().enumerate() {
            assert_eq!(severity.code(), index as u32 + 1);
            assert_eq!(Severity::from_code(severity.code()), Some(*severity));
        }
        assert_eq!(Severity::from_code(0), None);
        assert_eq!(Severity::from_code(6), None);
        assert_eq!("Caution".parse::<Severity>(), Ok(Severity::Caution));
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn first_pulse_is_calm_then_gaps_are_classified() {
        let mut classifier = Classifier::new(Duration::from_secs(100));
        let first = classifier.observe(Duration::from_secs(160));
        assert_eq!(first.severity, Severity::Calm);
        assert_eq!(first.elapsed, None);

        let second = classifier.observe(Duration::from_secs(167));
        assert_eq!(second.severity, Severity::Elevated);
        assert_eq!(second.elapsed, Some(Duration::from_secs(7)));

        let third = classifier.observe(Duration::from_secs(188));
        assert_eq!(third.severity, Severity::Critical);
        assert_eq!(classifier.pulses(), 3);
    }

    #[test]
    fn out_of_order_stamp_counts_as_zero_gap() {
        let mut classifier = Classifier::new(Duration::ZERO);
        classifier.observe(Duration::from_secs(10));
        let late = classifier.observe(Duration::from_secs(9));
        assert_eq!(late.severity, Severity::Calm);
        let next = classifier.observe(Duration::from_secs(22));
        assert_eq!(next.elapsed, Some(Duration::from_secs(12)));
    }

    #[test]
    fn burst_is_classified_by_its_last_gap() {
        let mut classifier = Classifier::new(Duration::ZERO);
        classifier.observe(Duration::from_secs(100));
        let burst = classifier.observe_burst(
            Duration::from_secs(114),
            Duration::from_millis(114_001),
            2,
        );
        assert_eq!(burst.severity, Severity::Calm);
        assert_eq!(burst.elapsed, Some(Duration::from_millis(1)));
        assert_eq!(classifier.pulses(), 3);
    }

    #[test]
    fn burst_on_first_wake_is_not_treated_as_first_pulse() {
        let mut classifier = Classifier::new(Duration::ZERO);
        let burst = classifier.observe_burst(Duration::from_secs(3), Duration::from_secs(9), 2);
        assert_eq!(burst.severity, Severity::Elevated);
        assert_eq!(burst.elapsed, Some(Duration::from_secs(6)));
    }

    #[test]
    fn single_pulse_burst_ignores_prev() {
        let mut classifier = Classifier::new(Duration::ZERO);
        classifier.observe(Duration::from_secs(10));
        let next = classifier.observe_burst(Duration::from_secs(1), Duration::from_secs(22), 1);
        assert_eq!(next.elapsed, Some(Duration::from_secs(12)));
        assert_eq!(next.severity, Severity::Warning);
    }

    #[test]
    fn cursor_starts_at_top_and_steps_by_two() {
        let mut cursor = DisplayCursor::new(10);
        assert_eq!(cursor.line(), 1);
        let lines: Vec<u16> = (0..6).map(|_| cursor.advance()).collect();
        assert_eq!(lines, vec![1, 3, 5, 7, 1, 3]);
    }

    #[test]
    fn cursor_entry_never_leaves_panel() {
        for height in 0..40u16 {
            let mut cursor = DisplayCursor::new(height);
            for _ in 0..200 {
                let line = cursor.advance();
                assert!(line >= 1, "height {height}");
                if height >= ENTRY_LINES + 2 {
                    assert!(
                        line + ENTRY_LINES - 1 <= height - 2,
                        "height {height} line {line}"
                    );
                } else {
                    assert_eq!(line, CURSOR_TOP);
                }
            }
        }
    }

    #[test]
    fn tiny_panels_pin_cursor_to_top() {
        assert_eq!(next_line(1, 4), 1);
        assert_eq!(next_line(1, 5), 1);
        assert_eq!(next_line(1, 6), 3);
        assert_eq!(next_line(3, 6), 1);
    }
}
