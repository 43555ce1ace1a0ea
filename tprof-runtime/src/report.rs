//! Text report for a finished [`Aggregate`].

use std::cmp::Ordering;

use anstyle::{AnsiColor, Color, Style};

use crate::collector::Aggregate;

const BOLD: Style = Style::new().bold();
const DIM: Style = Style::new().dimmed();
const GREEN: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightGreen)));
const CYAN: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan)));
const MAGENTA: Style = Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta)));
const RED_BOLD: Style = Style::new()
    .bold()
    .fg_color(Some(Color::Ansi(AnsiColor::Red)));
const BLUE_BOLD: Style = Style::new()
    .bold()
    .fg_color(Some(Color::Ansi(AnsiColor::BrightBlue)));
const FASTER: Style = Style::new()
    .bold()
    .fg_color(Some(Color::Ansi(AnsiColor::BrightGreen)));
const SLOWER: Style = Style::new()
    .bold()
    .fg_color(Some(Color::Ansi(AnsiColor::BrightRed)));

/// Applies ANSI styles, or passes text through untouched when disabled.
#[derive(Debug, Clone, Copy)]
pub struct Colourizer {
    enabled: bool,
}

impl Colourizer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn paint(&self, style: Style, text: &str) -> String {
        if !self.enabled || style == Style::new() {
            return text.to_owned();
        }
        format!("{style}{text}{style:#}")
    }

    pub fn bold(&self, text: &str) -> String {
        self.paint(BOLD, text)
    }

    pub fn red_bold(&self, text: &str) -> String {
        self.paint(RED_BOLD, text)
    }
}

/// Summary statistics over one target's durations, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub calls: usize,
    pub total: u64,
    pub mean: Option<f64>,
    /// Sample standard deviation; needs at least two calls.
    pub stdev: Option<f64>,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl Stats {
    pub fn of(durations: &[u64]) -> Self {
        let calls = durations.len();
        let total: u64 = durations.iter().sum();
        let mean = (calls > 0).then(|| total as f64 / calls as f64);
        let stdev = match mean {
            Some(mean) if calls > 1 => {
                let squares: f64 = durations
                    .iter()
                    .map(|&d| (d as f64 - mean).powi(2))
                    .sum();
                Some((squares / (calls - 1) as f64).sqrt())
            }
            _ => None,
        };
        Self {
            calls,
            total,
            mean,
            stdev,
            min: durations.iter().copied().min(),
            max: durations.iter().copied().max(),
        }
    }
}

/// A row's mean relative to the baseline row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delta {
    Baseline,
    NotApplicable,
    Percent(f64),
}

impl Delta {
    pub fn of(mean: Option<f64>, baseline: Option<f64>) -> Self {
        match (mean, baseline) {
            (Some(mean), Some(base)) if base != 0.0 => Delta::Percent((mean - base) / base * 100.0),
            _ => Delta::NotApplicable,
        }
    }
}

/// Split `ns` into a display value and unit, rounded to the nearest unit
/// with ties going to the even value.
fn scale(ns: u64) -> (String, &'static str) {
    let (divisor, unit) = match ns {
        0..1_000 => (1, "ns"),
        1_000..1_000_000 => (1_000, "μs"),
        1_000_000..1_000_000_000 => (1_000_000, "ms"),
        _ => (1_000_000_000, "s"),
    };
    let (quotient, remainder) = (ns / divisor, ns % divisor);
    let round_up = match (remainder * 2).cmp(&divisor) {
        Ordering::Greater => true,
        Ordering::Equal => quotient % 2 == 1,
        Ordering::Less => false,
    };
    (group_thousands(quotient + u64::from(round_up)), unit)
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Format nanoseconds at the coarsest unit that keeps the value at least 1.
pub fn format_time(ns: u64) -> String {
    let (value, unit) = scale(ns);
    format!("{value}{unit}")
}

#[derive(Clone, Copy)]
enum Align {
    Left,
    Right,
}

struct Cell {
    text: String,
    painted: String,
}

impl Cell {
    fn plain(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            painted: text.to_owned(),
        }
    }

    fn styled(text: &str, style: Style, colourizer: &Colourizer) -> Self {
        Self {
            text: text.to_owned(),
            painted: colourizer.paint(style, text),
        }
    }

    /// Only the number is painted, never the unit.
    fn time(ns: u64, style: Style, colourizer: &Colourizer) -> Self {
        let (value, unit) = scale(ns);
        Self {
            text: format!("{value}{unit}"),
            painted: format!("{}{unit}", colourizer.paint(style, &value)),
        }
    }

    fn width(&self) -> usize {
        self.text.chars().count()
    }
}

const COLUMNS: [(&str, Align, Style); 9] = [
    ("function", Align::Left, BOLD),
    ("calls", Align::Right, BOLD),
    ("total", Align::Right, BOLD),
    ("mean", Align::Right, GREEN.bold()),
    ("±", Align::Right, BOLD),
    ("σ", Align::Left, GREEN.bold()),
    ("min", Align::Right, CYAN.bold()),
    ("…", Align::Right, BOLD),
    ("max", Align::Left, MAGENTA.bold()),
];

const DELTA_COLUMN: (&str, Align, Style) = ("delta", Align::Left, BOLD);

fn delta_cell(delta: Delta, colourizer: &Colourizer) -> Cell {
    match delta {
        Delta::Baseline => Cell::styled("-", DIM, colourizer),
        Delta::NotApplicable => Cell::styled("n/a", DIM, colourizer),
        Delta::Percent(percent) => {
            let style = if percent <= 0.0 { FASTER } else { SLOWER };
            Cell::styled(&format!("{percent:+.2}%"), style, colourizer)
        }
    }
}

fn time_or_na(ns: Option<u64>, style: Style, colourizer: &Colourizer) -> Cell {
    match ns {
        Some(ns) => Cell::time(ns, style, colourizer),
        None => Cell::styled("n/a", DIM, colourizer),
    }
}

/// Render the heading and table. Every line ends with a newline.
pub fn render(aggregate: &Aggregate, compare: bool, colourizer: &Colourizer) -> String {
    let mut out = format!("{} results", colourizer.red_bold("🎯 tprof"));
    if let Some(label) = aggregate.label() {
        out.push_str(" @ ");
        out.push_str(&colourizer.paint(BLUE_BOLD, label));
    }
    out.push_str(":\n");

    let mut columns = COLUMNS.to_vec();
    if compare {
        columns.push(DELTA_COLUMN);
    }

    let mut rows: Vec<Vec<Cell>> = vec![
        columns
            .iter()
            .map(|&(name, _, style)| Cell::styled(name, style, colourizer))
            .collect(),
    ];

    let baseline = aggregate
        .entries()
        .first()
        .and_then(|entry| Stats::of(entry.durations()).mean);

    for (i, entry) in aggregate.entries().iter().enumerate() {
        let stats = Stats::of(entry.durations());
        let spread = stats.stdev.map(|stdev| stdev as u64);
        let mut row = vec![
            Cell::styled(&format!("{}()", entry.label()), BOLD, colourizer),
            Cell::plain(&stats.calls.to_string()),
            Cell::time(stats.total, Style::new(), colourizer),
            time_or_na(stats.mean.map(|mean| mean as u64), GREEN, colourizer),
            Cell::plain(if spread.is_some() { "±" } else { "" }),
            match spread {
                Some(ns) => Cell::time(ns, GREEN, colourizer),
                None => Cell::plain(""),
            },
            time_or_na(stats.min, CYAN, colourizer),
            Cell::plain("…"),
            time_or_na(stats.max, MAGENTA, colourizer),
        ];
        if compare {
            let delta = if i == 0 {
                Delta::Baseline
            } else {
                Delta::of(stats.mean, baseline)
            };
            row.push(delta_cell(delta, colourizer));
        }
        rows.push(row);
    }

    let widths: Vec<usize> = (0..columns.len())
        .map(|col| rows.iter().map(|row| row[col].width()).max().unwrap_or(0))
        .collect();

    for row in &rows {
        let mut line = String::new();
        for (col, cell) in row.iter().enumerate() {
            line.push(' ');
            let pad = " ".repeat(widths[col] - cell.width());
            match columns[col].1 {
                Align::Left => {
                    line.push_str(&cell.painted);
                    line.push_str(&pad);
                }
                Align::Right => {
                    line.push_str(&pad);
                    line.push_str(&cell.painted);
                }
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Code;
    use crate::collector::CallTimes;
    use crate::registry::TargetRecord;

    static WALK: Code = Code::new("mini", "walk");
    static RUN: Code = Code::new("mini", "run");
    static JOG: Code = Code::new("mini", "jog");

    fn times(code: &'static Code, label: &str, durations: &[u64]) -> CallTimes {
        CallTimes::new(TargetRecord::new(code, label), durations.to_vec())
    }

    fn plain() -> Colourizer {
        Colourizer::new(false)
    }

    #[test]
    fn format_time_picks_unit_and_rounds() {
        assert_eq!(format_time(0), "0ns");
        assert_eq!(format_time(500), "500ns");
        assert_eq!(format_time(1500), "2μs");
        assert_eq!(format_time(999_999), "1,000μs");
        assert_eq!(format_time(1_500_000), "2ms");
        assert_eq!(format_time(999_999_999), "1,000ms");
        assert_eq!(format_time(1_500_000_000), "2s");
        assert_eq!(format_time(3_600_000_000_000), "3,600s");
        assert_eq!(format_time(1_234_567_000_000_000), "1,234,567s");
    }

    #[test]
    fn format_time_rounds_ties_to_even() {
        assert_eq!(format_time(2_500), "2μs");
        assert_eq!(format_time(3_500), "4μs");
        assert_eq!(format_time(2_500_000), "2ms");
        assert_eq!(format_time(4_500_000_000), "4s");
        assert_eq!(format_time(2_501), "3μs");
    }

    #[test]
    fn colourizer_bold() {
        assert_eq!(Colourizer::new(true).bold("Test"), "\x1b[1mTest\x1b[0m");
        assert_eq!(Colourizer::new(false).bold("Test"), "Test");
    }

    #[test]
    fn colourizer_red_bold() {
        let painted = Colourizer::new(true).red_bold("Error");
        assert!(painted.starts_with("\x1b[1m"), "{painted:?}");
        assert!(painted.contains("31m"), "{painted:?}");
        assert!(painted.ends_with("Error\x1b[0m"), "{painted:?}");
        assert_eq!(Colourizer::new(false).red_bold("Error"), "Error");
    }

    #[test]
    fn stats_need_two_samples_for_spread() {
        let none = Stats::of(&[]);
        assert_eq!((none.calls, none.mean, none.min), (0, None, None));

        let one = Stats::of(&[700]);
        assert_eq!(one.mean, Some(700.0));
        assert_eq!(one.stdev, None);

        let many = Stats::of(&[2, 4, 4, 4, 5, 5, 7, 9]);
        assert_eq!(many.total, 40);
        assert_eq!(many.mean, Some(5.0));
        let stdev = many.stdev.unwrap();
        assert!((stdev - 2.138).abs() < 0.001, "{stdev}");
        assert_eq!((many.min, many.max), (Some(2), Some(9)));
    }

    #[test]
    fn delta_against_baseline() {
        assert_eq!(Delta::of(Some(150.0), Some(100.0)), Delta::Percent(50.0));
        assert_eq!(Delta::of(Some(50.0), Some(100.0)), Delta::Percent(-50.0));
        assert_eq!(Delta::of(Some(50.0), None), Delta::NotApplicable);
        assert_eq!(Delta::of(None, Some(100.0)), Delta::NotApplicable);
    }

    #[test]
    fn single_call_table_layout() {
        let aggregate = Aggregate::new(None, vec![times(&WALK, "mini:walk", &[500])]);
        let text = render(&aggregate, false, &plain());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "🎯 tprof results:",
                " function    calls total  mean ± σ   min … max",
                " mini:walk()     1 500ns 500ns     500ns … 500ns",
            ]
        );
    }

    #[test]
    fn label_appears_in_heading() {
        let aggregate = Aggregate::new(Some("warm".into()), vec![times(&WALK, "walk", &[])]);
        let text = render(&aggregate, false, &plain());
        assert!(text.starts_with("🎯 tprof results @ warm:\n"), "{text}");
    }

    #[test]
    fn missing_calls_show_not_applicable() {
        let aggregate = Aggregate::new(None, vec![times(&WALK, "mini:walk", &[])]);
        let text = render(&aggregate, false, &plain());
        let row = text.lines().nth(2).unwrap();
        assert!(row.starts_with(" mini:walk() "), "{row}");
        assert_eq!(row.matches("n/a").count(), 3, "{row}");
        assert!(!row.contains('±'), "{row}");
    }

    #[test]
    fn spread_column_needs_two_calls() {
        let aggregate = Aggregate::new(None, vec![times(&WALK, "mini:walk", &[1_000, 3_000])]);
        let text = render(&aggregate, false, &plain());
        let row = text.lines().nth(2).unwrap();
        assert!(row.contains("2μs ± 1μs"), "{row}");
    }

    #[test]
    fn compare_mode_adds_delta_column() {
        let aggregate = Aggregate::new(
            None,
            vec![
                times(&WALK, "mini:walk", &[100, 100]),
                times(&RUN, "mini:run", &[150, 150]),
                times(&JOG, "mini:jog", &[]),
            ],
        );
        let text = render(&aggregate, true, &plain());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].starts_with(" function"));
        assert!(lines[1].ends_with(" delta"), "{}", lines[1]);
        assert!(lines[2].ends_with(" -"), "{}", lines[2]);
        assert!(lines[3].ends_with(" +50.00%"), "{}", lines[3]);
        assert!(lines[4].ends_with(" n/a"), "{}", lines[4]);
    }

    #[test]
    fn baseline_without_calls_makes_every_delta_not_applicable() {
        let aggregate = Aggregate::new(
            None,
            vec![
                times(&WALK, "mini:walk", &[]),
                times(&RUN, "mini:run", &[150]),
            ],
        );
        let text = render(&aggregate, true, &plain());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[2].ends_with(" -"), "{}", lines[2]);
        assert!(lines[3].ends_with(" n/a"), "{}", lines[3]);
    }

    #[test]
    fn faster_rows_are_green_and_slower_red() {
        let colourizer = Colourizer::new(true);
        let faster = delta_cell(Delta::Percent(-5.0), &colourizer);
        let slower = delta_cell(Delta::Percent(12.5), &colourizer);
        assert_eq!(faster.text, "-5.00%");
        assert_eq!(faster.painted, format!("{FASTER}-5.00%{FASTER:#}"));
        assert_eq!(slower.text, "+12.50%");
        assert_eq!(slower.painted, format!("{SLOWER}+12.50%{SLOWER:#}"));
    }

    #[test]
    fn colour_codes_do_not_affect_alignment() {
        let aggregate = Aggregate::new(None, vec![times(&WALK, "mini:walk", &[500])]);
        let painted = render(&aggregate, false, &Colourizer::new(true));
        let stripped: String = anstream::adapter::strip_str(&painted).to_string();
        assert_eq!(stripped, render(&aggregate, false, &plain()));
    }
}
