//! Top-level command flow: resolve the prompt, load the model, respond

use crate::apply::ModelLoader;
use crate::cli::args::{Cli, PromptSource};
use crate::cli::config::Config;
use crate::cli::error::{CliError, CliResult};
use crate::cli::progress::ProgressReporter;
use crate::device;
use crate::infer::InferenceEngine;
use crate::session;
use clap::CommandFactory;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

/// Prompt text after the file check, before any model work
enum Work {
    Interactive,
    Single(String),
}

pub async fn execute(cli: Cli, config: Config) -> CliResult<()> {
    let work = match cli.prompt_source() {
        PromptSource::None => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
        PromptSource::Interactive => Work::Interactive,
        PromptSource::Inline(prompt) => Work::Single(prompt),
        PromptSource::File(path) => Work::Single(read_prompt_file(&path)?),
    };

    let mut engine = load_engine(&config, !cli.quiet).await?;
    let params = config.generation.clone();

    match work {
        Work::Interactive => {
            let mut stdout = io::stdout();
            let summary = session::run(
                session::stdin_lines(),
                &mut stdout,
                // Generation blocks; let the runtime move other tasks off this worker
                |prompt| {
                    tokio::task::block_in_place(|| engine.generate(&params.request(prompt)))
                        .map(|response| response.text)
                },
                session::ctrl_c(),
            )
            .await?;
            info!(
                "Session ended ({:?}): {} responses, {} failures",
                summary.end, summary.responses, summary.failures
            );
        }
        Work::Single(prompt) => {
            let response = engine.generate(&params.request(prompt))?;
            info!(
                "Prompt {} tokens, completion {} tokens ({:?})",
                response.usage.prompt_tokens, response.usage.completion_tokens, response.finish_reason
            );
            emit_response(&response.text, cli.output.as_deref(), &mut io::stdout())?;
        }
    }

    Ok(())
}

async fn load_engine(config: &Config, show_progress: bool) -> CliResult<InferenceEngine> {
    let progress = ProgressReporter::new("Loading model...", show_progress)?;
    let spinner = progress.clone();

    let loader = ModelLoader::new(device::resolver_for(config.model.device), config.model.dtype)
        .with_progress(move |stage| spinner.set_message(stage));

    let loaded = loader
        .load(&config.model.base_model, &config.model.adapter_path)
        .await;
    progress.finish_and_clear();

    Ok(InferenceEngine::from(loaded?))
}

/// Read and trim a prompt file
pub fn read_prompt_file(path: &Path) -> CliResult<String> {
    if !path.is_file() {
        return Err(CliError::FileNotFound(path.to_path_buf()));
    }
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Print the response, or save it when an output path is given
pub fn emit_response<W: Write>(text: &str, output: Option<&Path>, out: &mut W) -> CliResult<()> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, text)?;
            writeln!(out, "Response saved to {}", path.display())?;
        }
        None => {
            writeln!(out, "\nResponse:")?;
            writeln!(out, "{}", text)?;
        }
    }
    Ok(())
}
