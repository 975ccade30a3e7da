use crate::cli::error::CliResult;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal};
use std::time::Duration;

/// Spinner shown on stderr while the model loads
#[derive(Clone)]
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a spinner; it stays hidden when `visible` is false or stderr is
    /// not a terminal
    pub fn new(message: &str, visible: bool) -> CliResult<Self> {
        if !visible || !io::stderr().is_terminal() {
            return Ok(Self {
                bar: ProgressBar::hidden(),
            });
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .map_err(anyhow::Error::from)?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        Ok(Self { bar })
    }

    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}
