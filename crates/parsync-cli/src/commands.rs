use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;

use parsync_changelog::ChangeTracker;
use parsync_engine::{EngineConfig, PushOutcome, SqliteOpener, StoreOpener, SyncCoordinator};
use parsync_lease::{LeaseManager, LeaseOptions};
use parsync_snapshot::{SnapshotOutcome, SnapshotPaths, SnapshotReplicator};
use parsync_types::PartitionId;

use crate::cli::{Cli, Command, OutputFormat};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;
    match &cli.command {
        Command::Status(args) => status(&cli, &config, &args.partition).await,
        Command::Push(args) => push(&cli, &config, &args.partition).await,
        Command::Refresh(args) => refresh(&config, &args.partition).await,
        Command::Publish(args) => publish(&config, &args.partition).await,
        Command::CompactLog(args) => {
            compact_log(&config, &args.partition, args.older_than_days).await
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<EngineConfig> {
    if Path::new(path).exists() {
        Ok(EngineConfig::from_file(Path::new(path))?)
    } else {
        Ok(EngineConfig::default())
    }
}

fn parse_partition(raw: &str) -> anyhow::Result<PartitionId> {
    raw.parse()
        .with_context(|| format!("invalid partition id {raw:?}"))
}

async fn status(cli: &Cli, config: &EngineConfig, partition: &str) -> anyhow::Result<()> {
    let partition = parse_partition(partition)?;
    let opener = SqliteOpener::new(config.clone());

    let local = opener
        .open_local(&partition)
        .with_context(|| format!("local store for {partition} not found"))?;
    let pending = ChangeTracker::new(local)?.pending_count()?;

    let lease = match opener.open_shared(&partition) {
        Ok(shared) => {
            let manager =
                LeaseManager::new(shared, partition.clone(), LeaseOptions::default())?;
            Some(manager.current()?)
        }
        Err(_) => None,
    };

    match cli.format {
        OutputFormat::Json => {
            let lease_json = match &lease {
                Some(Some(l)) => serde_json::json!({
                    "holder": l.owner_host,
                    "reason": l.reason,
                    "expires_at": l.expires_at.to_rfc3339(),
                }),
                Some(None) => serde_json::Value::Null,
                None => serde_json::json!("unreachable"),
            };
            println!(
                "{}",
                serde_json::json!({
                    "partition": partition.as_str(),
                    "pending": pending,
                    "shared_reachable": lease.is_some(),
                    "lease": lease_json,
                })
            );
        }
        OutputFormat::Text => {
            let pending_str = if pending == 0 {
                "0".green()
            } else {
                pending.to_string().yellow()
            };
            println!("partition {partition}");
            println!("  pending changes: {pending_str}");
            match lease {
                None => println!("  shared store:    {}", "unreachable".red()),
                Some(None) => println!("  shared store:    {} (lease free)", "reachable".green()),
                Some(Some(l)) => println!(
                    "  shared store:    reachable, leased by {} ({}) until {}",
                    l.owner_host.cyan(),
                    l.reason,
                    l.expires_at.format("%H:%M:%S")
                ),
            }
        }
    }
    Ok(())
}

async fn push(cli: &Cli, config: &EngineConfig, partition: &str) -> anyhow::Result<()> {
    let partition = parse_partition(partition)?;
    let opener: Arc<dyn StoreOpener> = Arc::new(SqliteOpener::new(config.clone()));
    let coordinator = SyncCoordinator::new(opener, config.clone());

    let outcome = coordinator.sync_now(&partition).await?;
    match cli.format {
        OutputFormat::Json => {
            let (state, applied, skipped, pending) = match &outcome {
                PushOutcome::AlreadyInFlight => ("in-flight", 0, 0, 0),
                PushOutcome::NothingToPush => ("up-to-date", 0, 0, 0),
                PushOutcome::Offline { pending } => ("offline-pending", 0, 0, *pending as usize),
                PushOutcome::Applied { applied, skipped } => {
                    ("pushed", *applied, *skipped, 0)
                }
            };
            println!(
                "{}",
                serde_json::json!({
                    "partition": partition.as_str(),
                    "state": state,
                    "applied": applied,
                    "skipped": skipped,
                    "pending": pending,
                })
            );
        }
        OutputFormat::Text => match outcome {
            PushOutcome::AlreadyInFlight => {
                println!("{}: push already in flight", partition)
            }
            PushOutcome::NothingToPush => {
                println!("{}: {}", partition, "nothing to push".green())
            }
            PushOutcome::Offline { pending } => println!(
                "{}: {} ({pending} changes still pending)",
                partition,
                "offline".yellow()
            ),
            PushOutcome::Applied { applied, skipped } => println!(
                "{}: {} ({applied} applied, {skipped} skipped)",
                partition,
                "pushed".green()
            ),
        },
    }
    Ok(())
}

fn snapshot_paths(config: &EngineConfig, partition: &PartitionId) -> SnapshotPaths {
    let locations = config.locations(partition);
    SnapshotPaths::derive(locations.local_path, locations.shared_path)
}

async fn refresh(config: &EngineConfig, partition: &str) -> anyhow::Result<()> {
    let partition = parse_partition(partition)?;
    let paths = snapshot_paths(config, &partition);
    let replicator = SnapshotReplicator::new();
    let outcome = replicator
        .refresh_local_from_shared(&partition, &paths)
        .await?;
    report_snapshot(&partition, "refreshed", outcome);
    Ok(())
}

async fn publish(config: &EngineConfig, partition: &str) -> anyhow::Result<()> {
    let partition = parse_partition(partition)?;
    let paths = snapshot_paths(config, &partition);
    let replicator = SnapshotReplicator::new();
    let outcome = replicator
        .publish_local_to_shared(&partition, &paths)
        .await?;
    report_snapshot(&partition, "published", outcome);
    Ok(())
}

fn report_snapshot(partition: &PartitionId, verb: &str, outcome: SnapshotOutcome) {
    match outcome {
        SnapshotOutcome::Copied { bytes } => {
            println!("{partition}: {} ({bytes} bytes)", verb.green())
        }
        SnapshotOutcome::SkippedUnchanged => {
            println!("{partition}: snapshot unchanged, nothing to do")
        }
    }
}

async fn compact_log(
    config: &EngineConfig,
    partition: &str,
    older_than_days: Option<u32>,
) -> anyhow::Result<()> {
    let partition = parse_partition(partition)?;
    let opener = SqliteOpener::new(config.clone());
    let local = opener
        .open_local(&partition)
        .with_context(|| format!("local store for {partition} not found"))?;

    let days = older_than_days.unwrap_or(config.compact_keep_days);
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
    let deleted = ChangeTracker::new(local)?.compact(cutoff)?;
    println!("{partition}: removed {deleted} synchronized entries older than {days} days");
    Ok(())
}
