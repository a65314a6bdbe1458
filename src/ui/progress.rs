use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Single stderr spinner naming the cell currently running.
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        match ProgressStyle::with_template("{spinner:.blue} [{elapsed_precise}] {msg}") {
            Ok(style) => bar.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
            ),
            Err(e) => tracing::debug!("Falling back to default spinner style: {}", e),
        }
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// Draws nothing; for tests and non-interactive use.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn update(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
