use colored::*;
use import_triage::{PassReport, PipelineObserver};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Spinner that shows the pass counter between ticks.
pub struct CliObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliObserver {
    pub fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.set_message("Waiting for first pass... (Enter or Ctrl+C to stop)");
        pb.enable_steady_tick(Duration::from_millis(80));
        Self {
            bar: Mutex::new(Some(pb)),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

impl PipelineObserver for CliObserver {
    fn on_pass_start(&self, pass: u64) {
        self.with_bar(|pb| pb.set_message(format!("Pass {}... (Enter or Ctrl+C to stop)", pass)));
    }

    fn on_part_complete(&self, part: &str, report: &PassReport) {
        if report.is_quiet() {
            return;
        }
        self.with_bar(|pb| {
            pb.println(format!(
                "  {} {}: {} imported, {} discarded, {} retrying, {} unclaimed",
                "✓".green(),
                part,
                report.imported.to_string().green(),
                report.discarded.to_string().red(),
                report.retrying.to_string().yellow(),
                report.unclaimed,
            ))
        });
    }

    fn on_snapshot_failed(&self, part: &str, error: &str) {
        self.with_bar(|pb| pb.println(format!("  {} {}: {}", "✗".red(), part, error)));
    }

    fn on_stopped(&self, passes: u64) {
        let mut guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
        eprintln!("  {} Stopped after {} passes", "✓".green(), passes);
    }
}
