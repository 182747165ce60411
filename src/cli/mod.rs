use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::api::{AccountApi, ApiResponse};
use crate::error::{BinderError, Result};

#[derive(Parser)]
#[command(name = "storage-binder")]
#[command(about = "Bind a local storage file to a recoverable identity", long_about = None)]
pub struct Cli {
    /// Path to the TOML config (written with defaults if absent)
    #[arg(long, default_value = "storage_binder.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Allocate a new storage file under DIR
    Allocate {
        dir: PathBuf,
        #[arg(long, default_value_t = 500)]
        size_mb: u64,
    },
    /// Check the bound storage file
    Verify,
    /// Bind an existing storage file
    Select { path: PathBuf },
    /// Create a new account on the bound storage
    Create,
    /// Log in with a recovery phrase (read from stdin when omitted)
    Login {
        #[arg(long)]
        phrase: Option<String>,
    },
    /// Show the recovery phrase
    Phrase,
    /// Show the account address
    Address,
    /// Delete the account and its storage file
    Reset,
    /// Report whether an account exists
    CheckUser,
    /// Re-send capacity and address to the server
    UpdateServer,
    /// Tell the server this storage is gone, keeping local state
    RemoveStorage,
    /// Monitor storage and send heartbeats until Ctrl-C
    Watch,
}

fn print_response<T: Serialize>(res: &ApiResponse<T>) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(res)?);
    Ok(res.success)
}

async fn read_phrase() -> Result<String> {
    eprintln!("Enter recovery phrase:");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

/// Run one command, printing its JSON response. Returns whether it succeeded.
pub async fn run(api: &AccountApi, command: Commands) -> Result<bool> {
    match command {
        Commands::Allocate { dir, size_mb } => print_response(&api.allocate(&dir, size_mb).await),
        Commands::Verify => print_response(&api.verify().await),
        Commands::Select { path } => print_response(&api.select_manually(&path).await),
        Commands::Create => print_response(&api.create_account().await),
        Commands::Login { phrase } => {
            let phrase = match phrase {
                Some(p) => p,
                None => read_phrase().await?,
            };
            print_response(&api.login_with_phrase(&phrase).await)
        }
        Commands::Phrase => print_response(&api.get_recovery_phrase().await),
        Commands::Address => print_response(&api.get_address().await),
        Commands::Reset => print_response(&api.reset().await),
        Commands::CheckUser => print_response(&api.check_existing_user().await),
        Commands::UpdateServer => print_response(&api.update_server().await),
        Commands::RemoveStorage => print_response(&api.remove_storage().await),
        Commands::Watch => watch(api).await,
    }
}

async fn watch(api: &AccountApi) -> Result<bool> {
    let controller = api.controller();
    let mut events = controller.subscribe();

    // verify first so a stopped watcher is re-armed
    let initial = api.verify().await;
    print_response(&initial)?;
    let heartbeat = controller.start_heartbeat();
    info!("Watching storage (state: {}), press Ctrl-C to stop", controller.state().await);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
            ev = events.recv() => match ev {
                Ok(ev) => println!("{}", serde_json::to_string(&ev)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} lifecycle events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(BinderError::InvalidState("event channel closed".to_string()));
                }
            },
        }
    }

    heartbeat.stop().await;
    Ok(initial.success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allocate() {
        let cli = Cli::try_parse_from(["storage-binder", "allocate", "/tmp", "--size-mb", "700"]).unwrap();
        assert_eq!(cli.config, "storage_binder.toml");
        match cli.command {
            Commands::Allocate { dir, size_mb } => {
                assert_eq!(dir, PathBuf::from("/tmp"));
                assert_eq!(size_mb, 700);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_parse_login_and_config() {
        let cli = Cli::try_parse_from([
            "storage-binder",
            "--config",
            "other.toml",
            "login",
            "--phrase",
            "abandon about",
        ])
        .unwrap();
        assert_eq!(cli.config, "other.toml");
        assert!(matches!(cli.command, Commands::Login { phrase: Some(ref p) } if p == "abandon about"));
    }

    #[test]
    fn test_parse_server_commands() {
        let cli = Cli::try_parse_from(["storage-binder", "update-server"]).unwrap();
        assert!(matches!(cli.command, Commands::UpdateServer));
        let cli = Cli::try_parse_from(["storage-binder", "remove-storage"]).unwrap();
        assert!(matches!(cli.command, Commands::RemoveStorage));
        let cli = Cli::try_parse_from(["storage-binder", "check-user"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckUser));
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["storage-binder"]).is_err());
    }
}
