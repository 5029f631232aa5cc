//! archive-backup - change-gated document archive backups
//!
//! Main binary entry point for the command-line interface.

use archive_backup::cli::{Cli, Commands};
use archive_backup::logging::init_logging;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Run(args) => archive_backup::cli::run::run(args, config).await,
        Commands::Status(args) => archive_backup::cli::status::run(args, config).await.map(|_| 0),
        Commands::InitConfig(args) => {
            archive_backup::cli::init_config::run(args, config).await.map(|_| 0)
        }
        Commands::Schedule(args) => archive_backup::cli::schedule::run(args, config).await.map(|_| 0),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
