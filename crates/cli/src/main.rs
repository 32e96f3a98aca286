//! vdiamond CLI - migrations and operator tools.
//!
//! # Usage
//!
//! ```bash
//! # Apply database migrations
//! vd-cli migrate
//!
//! # Run one registration sweep cycle
//! vd-cli sweep
//!
//! # Grant or revoke the admin role
//! vd-cli admin promote -e ops@example.com
//! vd-cli admin demote -e ops@example.com
//! ```
//!
//! Every command reads `DATABASE_URL` (a `.env` file is honored).

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use vdiamond_core::Role;

mod commands;

#[derive(Parser)]
#[command(name = "vd-cli")]
#[command(author, version, about = "vdiamond operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Delete pending registrations whose confirmation window has passed
    Sweep,
    /// Manage subject roles
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Give a subject the admin role
    Promote {
        /// Subject email address
        #[arg(short, long)]
        email: String,
    },
    /// Return a subject to the user role
    Demote {
        /// Subject email address
        #[arg(short, long)]
        email: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), commands::CommandError> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Sweep => {
            let report = commands::sweep::run().await?;
            #[allow(clippy::print_stdout)]
            {
                println!(
                    "scanned={} removed={} failed={}",
                    report.scanned, report.removed, report.failed
                );
            }
        }
        Commands::Admin { action } => match action {
            AdminAction::Promote { email } => {
                commands::admin::set_role(&email, Role::Admin).await?;
            }
            AdminAction::Demote { email } => {
                commands::admin::set_role(&email, Role::User).await?;
            }
        },
    }
    Ok(())
}
