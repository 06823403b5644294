// Output formatting and display for CLI

use crate::error::Result;
use crate::logs::TaggedLine;
use crate::mux::{SessionSummary, SourceState};
use chrono::{DateTime, Local, Utc};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;

/// Separator between a source label and its payload
const LABEL_SEPARATOR: &str = "\t\t|  ";

/// Destination for the merged stream of tagged lines
///
/// Writes must complete (or fail) rather than drop lines; a slow sink
/// simply delays the next pull from the session.
pub trait OutputSink {
    fn write_line(&mut self, line: &TaggedLine) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Renders tagged lines as `<label>\t\t|  <payload>`
pub struct TerminalSink<W: Write> {
    writer: W,
    show_timestamps: bool,
}

impl<W: Write> TerminalSink<W> {
    pub fn new(writer: W, show_timestamps: bool) -> Self {
        Self {
            writer,
            show_timestamps,
        }
    }
}

impl<W: Write> OutputSink for TerminalSink<W> {
    fn write_line(&mut self, line: &TaggedLine) -> Result<()> {
        writeln!(self.writer, "{}", format_line(line, self.show_timestamps))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Format one tagged line for the terminal
pub fn format_line(line: &TaggedLine, show_timestamps: bool) -> String {
    let label = line.tag.label.color(line.tag.color()).bold();

    if show_timestamps {
        format!(
            "{} {}{}{}",
            format_timestamp(line.line.timestamp).dimmed(),
            label,
            LABEL_SEPARATOR,
            line.line.payload
        )
    } else {
        format!("{}{}{}", label, LABEL_SEPARATOR, line.line.payload)
    }
}

/// Format a line timestamp in local time, using the current time when absent
fn format_timestamp(timestamp: Option<DateTime<Utc>>) -> String {
    let local: DateTime<Local> = match timestamp {
        Some(ts) => ts.with_timezone(&Local),
        None => Local::now(),
    };
    format!("[{}]", local.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Report a container that dropped out of the session
pub fn print_source_failure(identity: &str, error: &str) {
    eprintln!(
        "{} {} {}",
        "✗ Error:".red().bold(),
        format!("[{}]", identity).bold(),
        error
    );
}

/// One-line account of how each container finished
pub fn format_summary(summary: &SessionSummary) -> String {
    let count = |state: SourceState| summary.sources_in(state).count();

    let mut parts = vec![format!("{} line(s)", summary.lines_emitted)];
    for state in [
        SourceState::Drained,
        SourceState::Ended,
        SourceState::Failed,
        SourceState::Canceled,
    ] {
        let n = count(state);
        if n > 0 {
            parts.push(format!("{} {}", n, state));
        }
    }

    format!("Session {}: {}", summary.outcome, parts.join(", "))
}

/// Spinner shown on stderr while container tails are fetched
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
