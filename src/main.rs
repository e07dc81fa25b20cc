use clap::Parser;

use transfer_restart_manager::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The daemon installs its own subscriber with a file layer.
    let runs_daemon = matches!(cli.command, Some(Commands::Start { foreground: true, .. }));
    if cli.verbose && !runs_daemon {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
