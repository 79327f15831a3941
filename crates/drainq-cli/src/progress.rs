use drainq::Progress;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing the counters of the run in progress.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn new(show: bool) -> Self {
        let bar = if show {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Callback handed to the engine; updates the spinner after every batch.
    pub fn callback(&self) -> impl Fn(&Progress) + Send + Sync + 'static {
        let bar = self.bar.clone();
        move |progress| bar.set_message(describe(progress))
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

pub fn describe(progress: &Progress) -> String {
    let c = &progress.counters;
    let mut done = Vec::new();
    if c.deleted > 0 {
        done.push(format!("{} deleted", c.deleted));
    }
    if c.moved > 0 {
        done.push(format!("{} moved", c.moved));
    }
    if c.matched > 0 {
        done.push(format!("{} matched", c.matched));
    }
    if c.skipped > 0 {
        done.push(format!("{} skipped", c.skipped));
    }

    let mut line = format!("{}: {} checked", progress.sub_queue, c.checked);
    for part in done {
        line.push_str(", ");
        line.push_str(&part);
    }
    line.push_str(&format!(
        " | {:.0} msg/s (last batch of {} at {:.0} msg/s)",
        c.throughput(),
        progress.batch_len,
        progress.batch_throughput
    ));
    line
}
