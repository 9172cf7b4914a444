use std::process::ExitCode;

use clap::Parser;
use llama_cli::{format_metrics, generate, CliError, GenerateArgs};
use tracing_subscriber::EnvFilter;

/// llama.rs: streaming inference session demo
#[derive(Parser)]
#[command(name = "llama-cli")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Stream a completion for a prompt to stdout. Ctrl-C cancels.
    Generate(GenerateArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries only the generated text.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Generate(args) => {
            let mut stdout = std::io::stdout();
            match generate(&args, &mut stdout, ctrl_c()).await {
                Ok(outcome) => {
                    eprintln!("{}", format_metrics(&outcome.metrics));
                    ExitCode::SUCCESS
                }
                Err(CliError::Cancelled) => {
                    eprintln!("\ncancelled");
                    ExitCode::from(130)
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
