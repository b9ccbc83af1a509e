//! Command-line surface of the `tokenkeep` binary.

use crate::config::{load_config, TokenkeepConfig};
use crate::context::CredentialContext;
use crate::ops::{self, OperationReport};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Credential key management for unattended OAuth clients
#[derive(Parser, Debug)]
#[command(name = "tokenkeep", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Re-encrypt the stored credential under another key version
    Rotate {
        /// Key version to rotate to (must have key material configured)
        #[arg(long)]
        to: String,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Convert a legacy credential file to the current format
    Migrate {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Check that the stored credential decrypts and is unexpired
    Verify {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run the OAuth authorization flow and store the result
    Authorize {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML config file (defaults apply when omitted)
    #[arg(long, env = "TOKENKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Command {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::Rotate { common, .. }
            | Command::Migrate { common }
            | Command::Verify { common }
            | Command::Authorize { common } => common,
        }
    }
}

impl CommonArgs {
    pub fn load_config(&self) -> Result<TokenkeepConfig> {
        match &self.config {
            Some(path) => load_config(path),
            None => {
                let mut config = TokenkeepConfig::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }
}

/// Builds the context and runs the selected command.
///
/// Setup failures (unreadable config, missing key material) are errors;
/// everything after that is reported through the returned report.
pub async fn run(command: &Command) -> Result<OperationReport> {
    let config = command.common().load_config()?;
    let ctx = CredentialContext::from_config(config)?;

    let report = match command {
        Command::Rotate { to, .. } => ops::rotate_key(&ctx, to),
        Command::Migrate { .. } => ops::migrate_legacy(&ctx),
        Command::Verify { .. } => ops::verify(&ctx),
        Command::Authorize { .. } => {
            let issuer = Arc::new(ctx.oauth_issuer());
            ops::authorize(&ctx, issuer).await
        }
    };
    Ok(report)
}

/// Renders `report` the way `--json` asks for.
pub fn render(report: &OperationReport, json: bool) -> Result<String> {
    if json {
        Ok(report.to_json()?)
    } else {
        Ok(report.to_string())
    }
}
