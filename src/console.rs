//! Terminal presentation: progress bars and coloured result lines.

use colored::Colorize;
use humansize::{format_size, DECIMAL};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::sync::engine::{SessionState, SyncReport};
use crate::sync::progress::ProgressSnapshot;
use crate::sync::status::StatusSink;
use crate::sync::task::{TaskKind, TransferResult, TransferStatus};

const BAR_TEMPLATE: &str =
    "{prefix:.bold} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% | {msg}";

/// [`StatusSink`] drawing one progress bar per host.
pub struct ConsoleStatus {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    /// Print a line for every successful transfer, not only failures.
    show_each: bool,
}

impl ConsoleStatus {
    pub fn new(show_each: bool) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            bars: Mutex::new(HashMap::new()),
            show_each,
        }
    }

    fn println(&self, line: String) {
        if self.multi.println(&line).is_err() {
            eprintln!("{}", line);
        }
    }

    fn bar(&self, target: &str) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(|p| p.into_inner());
        bars.entry(target.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template(BAR_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                bar.set_prefix(target.to_string());
                bar
            })
            .clone()
    }

    fn finish_bar(&self, target: &str) {
        let bar = self
            .bars
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(target);
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }
}

impl StatusSink for ConsoleStatus {
    fn on_state(&self, target: &str, state: SessionState) {
        match state {
            SessionState::Watching => {
                self.println(format!("{} {}", target.bold(), "watching for changes".cyan()))
            }
            SessionState::Failed => self.println(format!("{} {}", target.bold(), "failed".red().bold())),
            _ => {}
        }
    }

    fn on_result(&self, target: &str, result: &TransferResult) {
        let path = &result.task.relative_path;
        match (result.status, result.task.kind) {
            (TransferStatus::Failed, _) => self.println(format!(
                "{} {} {} ({} attempts): {}",
                target.bold(),
                "✗".red(),
                path,
                result.attempts,
                result.error.as_deref().unwrap_or("unknown error").red()
            )),
            (TransferStatus::Ok, TaskKind::Upload) if self.show_each => self.println(format!(
                "{} {} {} ({})",
                target.bold(),
                "↑".green(),
                path,
                format_size(result.bytes_sent, DECIMAL)
            )),
            (TransferStatus::Ok, TaskKind::Remove) if self.show_each => {
                self.println(format!("{} {} {}", target.bold(), "−".yellow(), path))
            }
            _ => {}
        }
    }

    fn on_progress(&self, target: &str, snapshot: &ProgressSnapshot) {
        if snapshot.finished {
            self.finish_bar(target);
            return;
        }
        if snapshot.total_files == 0 {
            return;
        }
        let bar = self.bar(target);
        bar.set_length(snapshot.total_bytes.max(1));
        bar.set_position(snapshot.bytes_done);
        bar.set_message(format!(
            "{}/{} files | {}/s | {}",
            snapshot.files_done,
            snapshot.total_files,
            format_size(snapshot.throughput() as u64, DECIMAL),
            snapshot.current_path.as_deref().unwrap_or("")
        ));
    }
}

/// One-line summary of a finished host.
pub fn summary_line(report: &SyncReport) -> String {
    let counts = format!(
        "{} uploaded, {} removed, {} skipped, {} failed, {} in {:.1}s",
        report.count_ok(TaskKind::Upload),
        report.count_ok(TaskKind::Remove),
        report.skipped,
        report.failed,
        format_size(report.bytes_sent, DECIMAL),
        report.elapsed.as_secs_f64()
    );
    let status = if report.is_success() {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    format!("{} {} {}", status, report.target.bold(), counts)
}
