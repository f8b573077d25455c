/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Builder;

use velocity_core::config::VelocityConfig;
use velocity_core::schema;
use velocity_core::transit::{TransitWorker, TransitWorkerConfig};
use velocity_core::Store;

#[derive(Parser)]
#[command(author, about = "Migration and transit maintenance tool for the velocity store", long_about = None)]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    /// Read migrations from disk instead of the embedded copy.
    #[arg(long, value_name = "DIR")]
    migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Migration ledger maintenance.
    #[command(subcommand)]
    Migrate(MigrateCommand),

    /// Transit worker maintenance.
    #[command(subcommand)]
    Transits(TransitsCommand),
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Advance the ledger to the latest version (or `--to` if given).
    Up {
        #[arg(long)]
        to: Option<u32>,
    },
    /// Roll the ledger back to `target`.
    Down {
        target: u32,
    },
    /// Mark a legacy, pre-ledger database as already being at `version`.
    Baseline {
        version: u32,
    },
    /// Print the current ledger version and dirty flag.
    Version,
}

#[derive(Subcommand)]
enum TransitsCommand {
    /// Re-cluster the entire observed sample history.
    Analyse {
        #[arg(long, default_value = "rebuild-full")]
        model_version: String,
        #[arg(long, default_value_t = 5.0)]
        threshold_seconds: f64,
    },
    /// Delete every transit tagged `model_version`.
    Delete {
        model_version: String,
    },
    /// Move transit history from one model version tag to another.
    Migrate {
        from: String,
        to: String,
        #[arg(long, default_value_t = 5.0)]
        threshold_seconds: f64,
    },
    /// Alias for `analyse` with the default model version.
    Rebuild,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    Builder::new().filter_level(log::LevelFilter::Info).parse_default_env().init();

    match &cli.command {
        Command::Migrate(cmd) => run_migrate(&cli, cmd),
        Command::Transits(cmd) => run_transits(&cli, cmd),
    }
}

fn open_raw(cli: &Cli) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?;
    Ok(conn)
}

fn run_migrate(cli: &Cli, cmd: &MigrateCommand) -> Result<()> {
    let source = schema::SchemaSource::resolve(cli.migrations_dir.is_some(), cli.migrations_dir.as_deref())?;
    let mut conn = open_raw(cli)?;
    // `gate_pending = false`: the whole point of this tool is to act on a
    // database that might have pending or dirty migrations.
    schema::ensure_ready(&conn, &source, false)?;
    let steps = source.step_views();

    match cmd {
        MigrateCommand::Up { to } => {
            let reached = schema::migrate_up(&mut conn, &steps, *to)?;
            println!("migrated up to version {reached}");
        }
        MigrateCommand::Down { target } => {
            let reached = schema::migrate_down(&mut conn, &steps, *target)?;
            println!("migrated down to version {reached}");
        }
        MigrateCommand::Baseline { version } => {
            schema::baseline(&conn, *version)?;
            println!("baselined at version {version}");
        }
        MigrateCommand::Version => match schema::current_version(&conn)? {
            Some((version, dirty)) => println!("version {version}{}", if dirty { " (dirty)" } else { "" }),
            None => println!("no ledger (fresh database)"),
        },
    }
    Ok(())
}

fn store_for(cli: &Cli) -> Result<Store> {
    let mut config = VelocityConfig::new(&cli.db);
    config.check_migrations = false;
    if let Some(dir) = &cli.migrations_dir {
        config.dev_mode = true;
        config.migrations_dir = Some(dir.clone());
    }
    Store::open(config).map_err(|e| anyhow::anyhow!("opening store: {e}"))
}

fn run_transits(cli: &Cli, cmd: &TransitsCommand) -> Result<()> {
    let store = store_for(cli)?;
    match cmd {
        TransitsCommand::Analyse { model_version, threshold_seconds } => {
            let worker = TransitWorker::new(
                &store,
                TransitWorkerConfig {
                    threshold_seconds: *threshold_seconds,
                    model_version: model_version.clone(),
                    ..Default::default()
                },
            );
            let count = worker.run_full_history().map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("analysed full history: {count} transits");
        }
        TransitsCommand::Delete { model_version } => {
            let worker = TransitWorker::new(&store, TransitWorkerConfig::default());
            let deleted = worker.delete_all_transits(model_version).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("deleted {deleted} transits tagged {model_version:?}");
        }
        TransitsCommand::Migrate { from, to, threshold_seconds } => {
            let worker = TransitWorker::new(
                &store,
                TransitWorkerConfig {
                    threshold_seconds: *threshold_seconds,
                    model_version: to.clone(),
                    ..Default::default()
                },
            );
            let count = worker.migrate_model_version(from, to).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("migrated {from:?} -> {to:?}: {count} transits");
        }
        TransitsCommand::Rebuild => {
            let worker = TransitWorker::new(&store, TransitWorkerConfig::default());
            let count = worker.run_full_history().map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("rebuilt full history: {count} transits");
        }
    }
    Ok(())
}
