//! idbkit demo
//!
//! Keeps a "members" table: list it, add a member, or bump a member's age.
//!
//! ```text
//! idbkit-demo [--config <file>] [list | add | bump <id> | remove <id> | reset]
//! ```

mod members;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use idbkit_core::{connect, is_supported, Config};

use members::Members;

#[derive(Debug, Parser)]
#[command(name = "idbkit-demo", version, about = "Members table demo")]
struct Cli {
    /// JSON config file; defaults to SQLite under the data directory
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Print the members table
    List,
    /// Add the next member
    Add,
    /// Increment a member's age
    Bump { id: i64 },
    /// Delete a member
    Remove { id: i64 },
    /// Delete every member
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    idbkit_core::init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };

    let engine = config.build_engine()?;
    if !is_supported(engine.as_ref()) {
        bail!("the configured storage engine is not supported here");
    }
    let model = connect(engine, &config.database_name, config.version).await?;
    let members = Members::new(model);

    match cli.command.unwrap_or(Command::List) {
        Command::List => {}
        Command::Add => members.add_next().await?,
        Command::Bump { id } => members.bump_age(id).await?,
        Command::Remove { id } => members.remove(id).await?,
        Command::Reset => members.reset().await?,
    }

    print!("{}", members.render().await?);
    Ok(())
}
