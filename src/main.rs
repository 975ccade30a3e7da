use clap::Parser;
use policy_llm::cli::{self, Cli, CliResult};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            e.print_error();
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut config = cli::config::load_config(cli.config.as_deref())?;
    cli.apply_to(&mut config);
    config.validate()?;

    cli::logging::init_logging(
        cli.verbose,
        cli.quiet,
        config.logging.json_format,
        &config.logging.level,
    )?;

    cli::run::execute(cli, config).await
}
