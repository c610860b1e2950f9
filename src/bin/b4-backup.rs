use anyhow::{Context as _, Result};
use b4_backup::backup_error::{BackupError, TargetErrors};
use b4_backup::configuration::{BaseConfig, RestoreStrategy};
use b4_backup::engine::BackupEngine;
use b4_backup::host::{host_generator, BackupTargetHost};
use b4_backup::objects::ChoiceSelector;
use clap::{Parser, Subcommand};
use log::{debug, error, warn};
use std::env;
use std::io::{self, BufRead as _, Write as _};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "b4-backup", about = "Atomic btrfs snapshot backups", version)]
struct Cli {
    /// Path of the configuration file; defaults to $B4_BACKUP_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Perform backups on the selected targets
    Backup {
        /// Selected targets; defaults to the configured default targets
        #[arg(short, long)]
        target: Vec<String>,
        /// Name suffix (and retention ruleset) for this backup
        #[arg(short, long, default_value = "manual")]
        name: String,
        /// Perform actions on the source side only
        #[arg(long)]
        offline: bool,
    },
    /// List all snapshots of the selected targets
    List {
        #[arg(short, long)]
        target: Vec<String>,
        /// Also list snapshots on the destination host
        #[arg(long)]
        destination: bool,
    },
    /// Apply the targets' retention rulesets without performing a backup
    Clean {
        #[arg(short, long)]
        target: Vec<String>,
        #[arg(long)]
        offline: bool,
    },
    /// Delete a specific snapshot from the source and/or destination
    Delete {
        snapshot_name: String,
        #[arg(short, long)]
        target: Vec<String>,
        /// Delete from the source host
        #[arg(long)]
        source: bool,
        /// Delete from the destination host
        #[arg(long)]
        destination: bool,
    },
    /// Delete every snapshot of the chosen retention rulesets
    DeleteAll {
        #[arg(short, long)]
        target: Vec<String>,
        /// Retention names to delete; ALL selects every one present
        #[arg(short, long, default_value = "ALL")]
        retention: Vec<String>,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
        #[arg(long)]
        source: bool,
        #[arg(long)]
        destination: bool,
    },
    /// Restore a target from a previously created snapshot; the name and
    /// strategy REPLACE together revert the last REPLACE restore
    Restore {
        snapshot_name: String,
        #[arg(short, long)]
        target: Vec<String>,
        /// Restore strategy (SAFE or REPLACE); defaults to the target's
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        offline: bool,
    },
    /// Send pending snapshots to the destination
    Sync {
        #[arg(short, long)]
        target: Vec<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| env::var("B4_BACKUP_CONFIG").ok().map(PathBuf::from))
        .context("no configuration file given, use --config or B4_BACKUP_CONFIG")?;
    let config = BaseConfig::read_from_file(&config_path)?;

    debug!("configuration read from \"{}\"", config_path.display());

    let engine = BackupEngine::new(&config.timezone);

    match cli.command {
        Command::Backup {
            target,
            name,
            offline,
        } => {
            let snapshot_name = engine.generate_snapshot_name(Some(&name))?;

            run_targets(&config, &target, offline, |source, destination| {
                engine.backup(source, destination, &snapshot_name)
            })
        }
        Command::List {
            target,
            destination,
        } => run_targets(&config, &target, !destination, |source, destination| {
            print_snapshots(source)?;

            match destination {
                Some(destination) => print_snapshots(destination),
                None => Ok(()),
            }
        }),
        Command::Clean { target, offline } => {
            run_targets(&config, &target, offline, |source, destination| {
                engine.clean(source, destination)
            })
        }
        Command::Delete {
            snapshot_name,
            target,
            source,
            destination,
        } => run_targets(&config, &target, !destination, |source_host, destination_host| {
            if source {
                engine.delete(source_host, &snapshot_name)?;
            }

            match destination_host {
                Some(destination_host) => engine.delete(destination_host, &snapshot_name),
                None => Ok(()),
            }
        }),
        Command::DeleteAll {
            target,
            retention,
            force,
            source,
            destination,
        } => {
            warn!(
                "about to delete all snapshots with retention names [{}]",
                retention.join(", ")
            );

            if !force && !confirm("Continue")? {
                std::process::exit(1);
            }

            let retention_names = ChoiceSelector::new(retention);

            run_targets(&config, &target, !destination, |source_host, destination_host| {
                if source {
                    engine.delete_all(source_host, &retention_names)?;
                }

                match destination_host {
                    Some(destination_host) => engine.delete_all(destination_host, &retention_names),
                    None => Ok(()),
                }
            })
        }
        Command::Restore {
            snapshot_name,
            target,
            strategy,
            offline,
        } => {
            let strategy = strategy.map(|s| parse_strategy(&s)).transpose()?;

            run_targets(&config, &target, offline, |source, destination| {
                let target_strategy =
                    strategy.unwrap_or(source.target_config.restore_strategy);

                engine.restore(source, destination, &snapshot_name, target_strategy)
            })
        }
        Command::Sync { target } => run_targets(&config, &target, false, |source, destination| {
            let destination = destination.ok_or_else(|| {
                BackupError::InvalidConnectionUrl(
                    "sync requires a destination to be configured".to_string(),
                )
            })?;

            engine.sync(source, destination)
        }),
    }
}

/// Run one verb per selected target, accumulating per-target errors so one
/// failing target does not abort the rest.
fn run_targets(
    config: &BaseConfig,
    target: &[String],
    offline: bool,
    verb: impl Fn(&BackupTargetHost, Option<&BackupTargetHost>) -> Result<(), BackupError>,
) -> Result<()> {
    let choice = match target.is_empty() {
        true => ChoiceSelector::new(config.default_targets.clone()),
        false => ChoiceSelector::new(target.to_vec()),
    };

    let mut errors = TargetErrors::default();

    for (target_name, hosts) in host_generator(&choice, config, offline) {
        let outcome =
            hosts.and_then(|(source, destination)| verb(&source, destination.as_ref()));

        if let Err(backup_error) = outcome {
            error!("target \"{}\" failed: {}", target_name, backup_error);
            errors.push(&target_name, backup_error);
        }
    }

    errors.into_result().map_err(Into::into)
}

fn print_snapshots(host: &BackupTargetHost) -> Result<(), BackupError> {
    for (name, snapshot) in host.snapshots()? {
        for subvolume in snapshot.subvolumes_unescaped() {
            println!(
                "{} {} /{}",
                host.role,
                name,
                subvolume.display()
            );
        }
    }

    Ok(())
}

fn parse_strategy(strategy: &str) -> Result<RestoreStrategy> {
    match strategy.to_ascii_uppercase().as_str() {
        "SAFE" => Ok(RestoreStrategy::Safe),
        "REPLACE" => Ok(RestoreStrategy::Replace),
        _ => anyhow::bail!("unknown restore strategy \"{}\"", strategy),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
