use indicatif::{ProgressBar, ProgressStyle};

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub const fn total(&self) -> usize {
        self.processed + self.skipped
    }
}

/// Progress bar plus the run counters.
pub(crate) struct ProgressTracker {
    progress_bar: ProgressBar,
    summary: RunSummary,
}

impl ProgressTracker {
    pub(crate) fn new(total: usize) -> Self {
        let progress_bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress_bar.set_style(style);

        Self {
            progress_bar,
            summary: RunSummary::default(),
        }
    }

    pub(crate) fn processed(&mut self) {
        self.summary.processed += 1;
        self.progress_bar.inc(1);
    }

    pub(crate) fn skipped(&mut self) {
        self.summary.skipped += 1;
        self.progress_bar.inc(1);
    }

    /// Runs `f` with the bar hidden so log lines are not torn.
    pub(crate) fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.progress_bar.suspend(f)
    }

    pub(crate) fn finish(self) -> RunSummary {
        self.progress_bar.finish_with_message(format!(
            "processed {}, skipped {}",
            self.summary.processed, self.summary.skipped
        ));
        self.summary
    }
}
