//! sharecache daemon - keeps a local cache of shared files in sync
//!
//! Driver for the sync engine against a B2 bucket and an HTTP metadata
//! service. Meant for running one user's cache and for poking at records by
//! hand.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sharecache::b2::B2Client;
use sharecache::remote::HttpMetadataClient;
use sharecache::sync::MutationOutcome;
use sharecache::{CacheStore, Config, FileRecord, MetadataClient, SyncEngine, SyncEvent};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Follow shared files and keep the cache current until Ctrl+C
    Sync { user: String },
    /// List an owner's records
    List { owner: String },
    /// Publish a local file
    Publish {
        owner: String,
        source: PathBuf,
        name: Option<String>,
    },
    /// Grant a recipient access to a record
    Share {
        owner: String,
        record_id: String,
        recipient: String,
    },
    /// Revoke a recipient's access to a record
    Unshare {
        owner: String,
        record_id: String,
        recipient: String,
    },
    Rename {
        owner: String,
        record_id: String,
        new_name: String,
    },
    Delete { owner: String, record_id: String },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"sharecache daemon - Local cache of files shared through B2

USAGE:
    sharecache-daemon sync <user>
    sharecache-daemon list <owner>
    sharecache-daemon publish <owner> <path> [name]
    sharecache-daemon share <owner> <record_id> <recipient>
    sharecache-daemon unshare <owner> <record_id> <recipient>
    sharecache-daemon rename <owner> <record_id> <new_name>
    sharecache-daemon delete <owner> <record_id>
    sharecache-daemon help

COMMANDS:
    sync     Download the user's files and everything shared with them,
             then follow changes until Ctrl+C
    list     List the records an owner has published
    publish  Upload a file and record it (name defaults to the file name)
    share    Give a recipient access to a record
    unshare  Take a recipient's access away
    rename   Rename a record (and the local cached copy)
    delete   Delete a record, its blob and the local cached copy
    help     Show this help message

ENVIRONMENT:
    SHARECACHE_METADATA_URL   Base URL of the metadata service (required)
    B2_KEY_ID                 B2 application key ID (required)
    B2_KEY                    B2 application key (required)
    B2_BUCKET                 Bucket holding shared blobs (required)
    SHARECACHE_CACHE_DIR      Cache directory (default: <user cache dir>/sharecache/<user>)
    SHARECACHE_MAX_DOWNLOADS  Concurrent downloads, 0 for unbounded (default: 4)
    SHARECACHE_POLL_SECS      Metadata polling interval (default: 5)
    RUST_LOG                  Log level (trace, debug, info, warn, error)
"#
    );
}

fn usage(line: &str) -> anyhow::Error {
    anyhow!("Usage: sharecache-daemon {}", line)
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "sync" => {
            if args.len() < 3 {
                return Err(usage("sync <user>"));
            }
            Ok(Command::Sync {
                user: args[2].clone(),
            })
        }
        "list" => {
            if args.len() < 3 {
                return Err(usage("list <owner>"));
            }
            Ok(Command::List {
                owner: args[2].clone(),
            })
        }
        "publish" => {
            if args.len() < 4 {
                return Err(usage("publish <owner> <path> [name]"));
            }
            Ok(Command::Publish {
                owner: args[2].clone(),
                source: PathBuf::from(&args[3]),
                name: args.get(4).cloned(),
            })
        }
        "share" | "unshare" => {
            if args.len() < 5 {
                return Err(usage(&format!("{} <owner> <record_id> <recipient>", args[1])));
            }
            let (owner, record_id, recipient) = (args[2].clone(), args[3].clone(), args[4].clone());
            Ok(if args[1] == "share" {
                Command::Share {
                    owner,
                    record_id,
                    recipient,
                }
            } else {
                Command::Unshare {
                    owner,
                    record_id,
                    recipient,
                }
            })
        }
        "rename" => {
            if args.len() < 5 {
                return Err(usage("rename <owner> <record_id> <new_name>"));
            }
            Ok(Command::Rename {
                owner: args[2].clone(),
                record_id: args[3].clone(),
                new_name: args[4].clone(),
            })
        }
        "delete" => {
            if args.len() < 4 {
                return Err(usage("delete <owner> <record_id>"));
            }
            Ok(Command::Delete {
                owner: args[2].clone(),
                record_id: args[3].clone(),
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Wire the engine to the configured services
async fn connect(
    config: &Config,
    user: &str,
) -> Result<(SyncEngine, tokio::sync::mpsc::UnboundedReceiver<SyncEvent>)> {
    let metadata = HttpMetadataClient::new(&config.metadata_url, config.poll_interval)
        .context("Failed to create metadata client")?;

    let b2_client = match B2Client::authorize(&config.b2.key_id, &config.b2.key, &config.b2.bucket).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to authorize with B2");
            return Err(e.into());
        }
    };

    let cache = CacheStore::with_root(config.cache_dir_for(user))
        .context("Failed to open cache directory")?;

    Ok(SyncEngine::new(
        user,
        Arc::new(metadata),
        Arc::new(b2_client),
        cache,
        config.engine_options(),
    ))
}

/// Look up one of an owner's records by id
async fn owned_record(engine: &SyncEngine, config: &Config, record_id: &str) -> Result<FileRecord> {
    let metadata = HttpMetadataClient::new(&config.metadata_url, config.poll_interval)?;
    metadata
        .list_owned(engine.user_id())
        .await?
        .into_iter()
        .find(|r| r.id == record_id)
        .ok_or_else(|| anyhow!("{} has no record with id {}", engine.user_id(), record_id))
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Progress { .. } => {}
        SyncEvent::Downloaded { entry } => info!(file = %entry.file_name, "Downloaded"),
        SyncEvent::DownloadFailed { file_name, error } => {
            warn!(file = %file_name, error = %error, "Download failed; will retry on next change")
        }
        SyncEvent::Evicted { file_name } => info!(file = %file_name, "Removed from cache"),
        SyncEvent::Renamed { from, to } => info!(from = %from, to = %to, "Renamed in cache"),
        SyncEvent::Reconciled { .. } => {}
        SyncEvent::Published { record } => info!(file = %record.file_name, id = %record.id, "Published"),
    }
}

fn print_outcome(outcome: MutationOutcome, action: &str, record_id: &str) {
    match outcome {
        MutationOutcome::Applied => println!("{} applied to {}", action, record_id),
        MutationOutcome::RecordGone => println!("Record {} no longer exists", record_id),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = Config::from_env().context("Invalid configuration")?;

    match command {
        Command::Sync { user } => {
            let (engine, mut events) = connect(&config, &user).await?;
            info!(user = %user, cache_dir = %engine.cache_dir().display(), "Starting sync");

            if let Err(e) = engine.refresh_owned().await {
                warn!(error = %e, "Could not refresh own files; continuing with shared files");
            }
            engine.subscribe_recipient().await?;

            info!("Sync running. Press Ctrl+C to stop.");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => log_event(&event),
                        None => break,
                    },
                    signal = tokio::signal::ctrl_c() => {
                        signal?;
                        break;
                    }
                }
            }

            info!("Received shutdown signal, stopping...");
            engine.unsubscribe();
            engine.wait_idle().await;
            info!("Shutdown complete.");
        }
        Command::List { owner } => {
            let metadata = HttpMetadataClient::new(&config.metadata_url, config.poll_interval)?;
            let records = metadata.list_owned(&owner).await?;
            if records.is_empty() {
                println!("{} has no published files.", owner);
            } else {
                println!("Files published by {}:", owner);
                for record in records {
                    let recipients: Vec<&str> =
                        record.authorized_recipients.iter().map(String::as_str).collect();
                    println!(
                        "  {} {} (shared with: {})",
                        record.id,
                        record.file_name,
                        if recipients.is_empty() {
                            "nobody".to_string()
                        } else {
                            recipients.join(", ")
                        }
                    );
                }
            }
        }
        Command::Publish {
            owner,
            source,
            name,
        } => {
            let name = match name {
                Some(name) => name,
                None => source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("Cannot derive a file name from {}", source.display()))?,
            };
            let (engine, _events) = connect(&config, &owner).await?;
            let record = engine.publish(&source, &name).await?;
            println!("Published {} as {} ({})", source.display(), record.file_name, record.id);
        }
        Command::Share {
            owner,
            record_id,
            recipient,
        } => {
            let (engine, _events) = connect(&config, &owner).await?;
            let outcome = engine.grant(&record_id, &recipient).await?;
            print_outcome(outcome, "Share", &record_id);
        }
        Command::Unshare {
            owner,
            record_id,
            recipient,
        } => {
            let (engine, _events) = connect(&config, &owner).await?;
            let outcome = engine.revoke(&record_id, &recipient).await?;
            print_outcome(outcome, "Unshare", &record_id);
        }
        Command::Rename {
            owner,
            record_id,
            new_name,
        } => {
            let (engine, _events) = connect(&config, &owner).await?;
            let record = owned_record(&engine, &config, &record_id).await?;
            engine.rename(&record, &new_name).await?;
            println!("Renamed {} to {}", record.file_name, new_name);
        }
        Command::Delete { owner, record_id } => {
            let (engine, _events) = connect(&config, &owner).await?;
            let record = owned_record(&engine, &config, &record_id).await?;
            engine.delete(&record).await?;
            println!("Deleted {} ({})", record.file_name, record.id);
        }
        Command::Help => print_help(),
    }

    Ok(())
}
