//! Colloquy CLI entry point.
//!
//! Binary name: `colloquy`
//!
//! Parses CLI arguments, sets up tracing, loads configuration and dispatches
//! to the chat loop or a one-shot command.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use colloquy_observe::tracing_setup::{init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,colloquy_core=debug,colloquy_infra=debug",
        _ => "trace",
    };
    init_tracing(filter, cli.otel).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "colloquy", &mut std::io::stdout());
        }

        Commands::Config { action } => {
            cli::config::run(action, &cli.model).await?;
        }

        Commands::Chat => {
            let state = AppState::init(&cli.model).await?;
            cli::chat::loop_runner::run_chat_loop(&state, cli.model.compare_enabled()).await?;
        }

        Commands::Ask {
            prompt,
            images,
            context,
        } => {
            let state = AppState::init(&cli.model).await?;
            cli::ask::run_ask(
                &state,
                prompt.join(" "),
                images,
                context,
                cli.model.compare_enabled(),
            )
            .await?;
        }
    }

    Ok(())
}
