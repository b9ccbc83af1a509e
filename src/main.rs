use clap::Parser;
use tokenkeep::cli::{self, Cli};
use tokenkeep::ops::Outcome;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenkeep=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.command.common().json;

    info!(command = ?cli.command, "tokenkeep starting");

    let code = match cli::run(&cli.command).await {
        Ok(report) => {
            match cli::render(&report, json) {
                Ok(text) => println!("{text}"),
                Err(e) => error!(error = %e, "Failed to render report"),
            }
            report.exit_code()
        }
        Err(e) => {
            error!(error = ?e, "tokenkeep failed");
            eprintln!("error: {e:#}");
            Outcome::Fatal.exit_code()
        }
    };

    std::process::exit(code);
}
