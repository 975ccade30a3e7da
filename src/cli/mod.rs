pub mod args;
pub mod config;
pub mod error;
pub mod logging;
pub mod progress;
pub mod run;

pub use args::{Cli, PromptSource};
pub use error::{CliError, CliResult};
