// Ledger node binary entry point.

use std::io::IsTerminal;

use clap::{Parser, Subcommand};

use ledger_node::{run_node, NodeArgs};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "ledger-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fjall=warn,lsm_tree=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}
