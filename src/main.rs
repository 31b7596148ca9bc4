use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use feed_breaker::breaker::Breaker;
use feed_breaker::cache::{open_store, persistent_key, PersistentStore};
use feed_breaker::config::{Config, SourceConfig};
use feed_breaker::upstream::HttpSource;
use feed_breaker::{logging, BreakerRegistry};

#[derive(Parser, Debug)]
#[command(name = "feed-breaker")]
#[command(about = "Probe dashboard data sources through their circuit breakers")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feed-breaker/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch configured sources through their breakers
  Probe {
    /// Only probe this source
    #[arg(short, long)]
    name: Option<String>,

    /// Number of refresh rounds
    #[arg(short, long, default_value_t = 1)]
    rounds: u32,

    /// Pause between rounds in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,
  },
  /// List persisted cache entries
  Entries,
  /// Delete the persisted cache entry of a source
  Clear {
    name: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;
  let store = open_store(&config.storage)?;

  match args.command {
    Command::Probe {
      name,
      rounds,
      interval_ms,
    } => {
      probe(
        &config,
        store,
        name.as_deref(),
        rounds.max(1),
        Duration::from_millis(interval_ms),
      )
      .await
    }
    Command::Entries => list_entries(store.as_ref()),
    Command::Clear { name } => {
      store.delete_entry(&persistent_key(&name))?;
      println!("Cleared persisted cache for {}", name);
      Ok(())
    }
  }
}

async fn probe(
  config: &Config,
  store: Arc<dyn PersistentStore>,
  only: Option<&str>,
  rounds: u32,
  interval: Duration,
) -> Result<()> {
  let sources: Vec<&SourceConfig> = config
    .sources
    .iter()
    .filter(|s| only.map_or(true, |name| s.name == name))
    .collect();

  if sources.is_empty() {
    return Err(match only {
      Some(name) => eyre!("No source named {} in the configuration", name),
      None => eyre!("No sources configured"),
    });
  }

  let registry = BreakerRegistry::new(store);
  let mut probes: Vec<(Breaker<Value>, HttpSource)> = Vec::with_capacity(sources.len());
  for source in sources {
    let http = HttpSource::new(&source.url, source.timeout())?;
    probes.push((registry.create_breaker(source.breaker_options()), http));
  }

  for round in 1..=rounds {
    for (breaker, http) in &probes {
      let http = http.clone();
      let value = breaker
        .execute(move || async move { http.fetch_json().await }, Value::Null)
        .await;

      let state = breaker.data_state();
      let timestamp = state
        .timestamp
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
      println!(
        "[{}] {:<20} {:<12} {:<26} {:>9}B  {}",
        round,
        breaker.name(),
        state.mode,
        timestamp,
        value.to_string().len(),
        breaker.status()
      );
    }

    if round < rounds {
      tokio::time::sleep(interval).await;
    }
  }

  // Let queued durable writes land before exiting
  for (breaker, _) in &probes {
    breaker.flush().await;
  }

  println!();
  for (name, status) in registry.statuses() {
    println!("{:<20} {}", name, status);
  }

  Ok(())
}

fn list_entries(store: &dyn PersistentStore) -> Result<()> {
  let entries = store.entries()?;
  if entries.is_empty() {
    println!("No persisted entries");
    return Ok(());
  }

  let now = Utc::now();
  for entry in entries {
    let age = now - entry.updated_at;
    println!(
      "{:<30} {:<26} {:>6}m old {:>9}B",
      entry.key,
      entry.updated_at.to_rfc3339(),
      age.num_minutes(),
      entry.size_bytes
    );
  }
  Ok(())
}
