use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use optisync::audit::{AuditAction, AuditFilter};
use optisync::{Config, MutationFailure, MutationOutcome, SyncClient};
use serde_json::Value;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "optisync")]
#[command(about = "Cached reads and optimistic writes against a domain-partitioned REST store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/optisync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print every record in a domain
  Get { domain: String },
  /// Create a record from a JSON object
  Create { domain: String, record: String },
  /// Shallow-merge a JSON object into a record
  Update {
    domain: String,
    id: String,
    patch: String,
  },
  /// Delete a record
  Delete { domain: String, id: String },
  /// Show the audit trail, newest first
  History {
    #[arg(long)]
    entity_type: Option<String>,
    #[arg(long)]
    entity_id: Option<String>,
    /// create, update, delete or restore
    #[arg(long)]
    action: Option<AuditAction>,
    #[arg(short = 'n', long, default_value_t = 20)]
    limit: usize,
  },
}

/// Log to a file so output never interleaves with command results.
fn init_tracing(config: &Config) -> Result<WorkerGuard> {
  let directory = config.log_directory()?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::never(&directory, "optisync.log"));
  let filter =
    EnvFilter::try_from_env("OPTISYNC_LOG").unwrap_or_else(|_| EnvFilter::new(&config.log.filter));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(guard)
}

fn parse_json(raw: &str) -> Result<Value> {
  let value: Value = serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON '{}': {}", raw, e))?;
  if !value.is_object() {
    return Err(eyre!("Expected a JSON object, got: {}", raw));
  }
  Ok(value)
}

fn report(result: Result<MutationOutcome, MutationFailure>) -> Result<()> {
  match result {
    Ok(outcome) => {
      if let Some(record) = &outcome.server_result {
        println!("{}", serde_json::to_string_pretty(record)?);
      }
      println!(
        "{:?} after {} attempt(s) [{}]",
        outcome.status, outcome.attempts, outcome.mutation_id
      );
      Ok(())
    }
    Err(failure) => Err(eyre!(
      "{} ({:?} after {} attempt(s))",
      failure.user_message(),
      failure.status,
      failure.attempts
    )),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config)?;

  let client = SyncClient::from_config(&config)?;

  match args.command {
    Command::Get { domain } => {
      let records = client.get(&domain).await?;
      println!("{}", serde_json::to_string_pretty(&records)?);
    }
    Command::Create { domain, record } => {
      report(client.create(&domain, parse_json(&record)?).await)?;
    }
    Command::Update { domain, id, patch } => {
      report(client.update(&domain, &id, parse_json(&patch)?).await)?;
    }
    Command::Delete { domain, id } => {
      report(client.delete(&domain, &id).await)?;
    }
    Command::History {
      entity_type,
      entity_id,
      action,
      limit,
    } => {
      let mut filter = AuditFilter::new().limit(limit);
      if let Some(entity_type) = entity_type {
        filter = filter.entity_type(entity_type);
      }
      if let Some(entity_id) = entity_id {
        filter = filter.entity_id(entity_id);
      }
      if let Some(action) = action {
        filter = filter.action(action);
      }

      for record in client.query_audit(&filter).await? {
        println!(
          "{:>6}  {}  {:<7}  {}/{}  by {}",
          record.id,
          record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
          record.action,
          record.entity_type,
          record.entity_id,
          record.actor_id
        );
      }
    }
  }

  Ok(())
}
