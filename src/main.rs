use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use pokedex_sync::api::{ApiHelper, ApiResponse};
use pokedex_sync::config::Config;
use pokedex_sync::connectivity::{LinkState, ManualLinkMonitor};
use pokedex_sync::pokedex::{PokedexClient, Pokemon, PokemonPage, Species};
use pokedex_sync::queue::Priority;
use pokedex_sync::storage::{KeyValueStore, MemoryStore, SqliteStore};
use pokedex_sync::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "pokedex")]
#[command(about = "Offline-first Pokédex client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pokedex/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the network as unavailable and answer from the cache
  #[arg(long, global = true)]
  offline: bool,

  /// Keep cache and sync queue in memory only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show one Pokémon by id or name
  Pokemon {
    id_or_name: String,
    /// Skip the cache and fetch from the network
    #[arg(short, long)]
    refresh: bool,
  },
  /// List a page of the Pokédex
  List {
    #[arg(short, long, default_value_t = 20)]
    limit: u32,
    #[arg(short, long, default_value_t = 0)]
    offset: u32,
    #[arg(short, long)]
    refresh: bool,
  },
  /// Show species details by id or name
  Species {
    id_or_name: String,
    #[arg(short, long)]
    refresh: bool,
  },
  /// Warm the cache for several Pokémon
  Prefetch {
    #[arg(required = true)]
    ids_or_names: Vec<String>,
  },
  /// Replay requests queued while offline
  Sync,
  /// Show connectivity, cache and sync status
  Status,
  /// Manage the response cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Remove one endpoint URL, or everything when omitted
  Clear { endpoint: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging()?;

  let store: Arc<dyn KeyValueStore> = if args.ephemeral {
    Arc::new(MemoryStore::new())
  } else {
    match &config.storage.path {
      Some(path) => Arc::new(SqliteStore::open_at(path)?),
      None => Arc::new(SqliteStore::open()?),
    }
  };

  let transport = HttpTransport::new(&config.api.user_agent)
    .map_err(|e| eyre!("Failed to create HTTP transport: {}", e))?;
  let link = if args.offline {
    LinkState::None
  } else {
    LinkState::Unknown
  };

  let api = ApiHelper::new(
    config.api_helper_config(),
    Arc::new(transport),
    Arc::new(ManualLinkMonitor::new(link)),
    store,
  );
  api
    .initialize()
    .await
    .map_err(|e| eyre!("Failed to initialize: {}", e))?;

  let client = PokedexClient::new(
    api.clone(),
    &config.api.base_url,
    config.request_timeout(),
    config.prefetch_queue_config(),
  );

  let result = run(args.command, &client).await;
  api.dispose();
  result
}

async fn run(command: Command, client: &PokedexClient) -> Result<()> {
  let api = client.api();

  match command {
    Command::Pokemon {
      id_or_name,
      refresh,
    } => {
      let pokemon = unwrap_response(client.pokemon(&id_or_name, refresh).await)?;
      print_pokemon(&pokemon);
    }
    Command::List {
      limit,
      offset,
      refresh,
    } => {
      let page = unwrap_response(client.list(limit, offset, refresh).await)?;
      print_page(&page, offset);
    }
    Command::Species {
      id_or_name,
      refresh,
    } => {
      let species = unwrap_response(client.species(&id_or_name, refresh).await)?;
      print_species(&species);
    }
    Command::Prefetch { ids_or_names } => {
      let report = client
        .prefetch(&ids_or_names, Priority::Normal)
        .await
        .map_err(|e| eyre!("Failed to prefetch: {}", e))?;
      println!(
        "Prefetched {}/{} ({} failed)",
        report.succeeded, report.requested, report.failed
      );
    }
    Command::Sync => {
      let pending = api.sync().pending_count();
      if pending == 0 {
        println!("Nothing to sync");
        return Ok(());
      }
      if !api.connectivity().is_online() {
        println!("Offline: {} operation(s) waiting", pending);
        return Ok(());
      }
      let report = api
        .sync()
        .sync()
        .await
        .map_err(|e| eyre!("Failed to sync: {}", e))?;
      println!(
        "Synced {} operation(s), {} failed, {} dropped, {} pending",
        report.succeeded,
        report.failed,
        report.dropped,
        api.sync().pending_count()
      );
    }
    Command::Status => print_status(api),
    Command::Cache {
      command: CacheCommand::Clear { endpoint },
    } => match endpoint {
      Some(endpoint) => {
        let removed = api
          .clear_cache(&endpoint)
          .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
        println!("{}", if removed { "Removed" } else { "Not cached" });
      }
      None => {
        api
          .clear_all_cache()
          .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
        println!("Cache cleared");
      }
    },
  }

  Ok(())
}

/// Data from a response, noting on stderr when it came from the cache.
fn unwrap_response<T>(response: ApiResponse<T>) -> Result<T> {
  if response.is_from_cache() {
    match &response.message {
      Some(message) => eprintln!("(cached: {})", message),
      None => eprintln!("(cached)"),
    }
  }
  response.into_result().map_err(|e| eyre!("{}", e))
}

fn print_pokemon(pokemon: &Pokemon) {
  println!("#{} {}", pokemon.id, pokemon.name);
  println!("  types:     {}", pokemon.types.join(", "));
  println!("  abilities: {}", pokemon.abilities.join(", "));
  println!(
    "  height:    {:.1} m, weight: {:.1} kg",
    f64::from(pokemon.height) / 10.0,
    f64::from(pokemon.weight) / 10.0
  );
  for stat in &pokemon.stats {
    println!("  {:<16} {:>3}", stat.name, stat.base);
  }
}

fn print_page(page: &PokemonPage, offset: u32) {
  for (i, entry) in page.entries.iter().enumerate() {
    let id = entry
      .id
      .map(|id| id.to_string())
      .unwrap_or_else(|| (offset as usize + i + 1).to_string());
    println!("{:>5}  {}", id, entry.name);
  }
  match page.next_offset {
    Some(next) => println!("({} total, next page: --offset {})", page.count, next),
    None => println!("({} total)", page.count),
  }
}

fn print_species(species: &Species) {
  println!("#{} {}", species.id, species.name);
  if let Some(genus) = &species.genus {
    println!("  {}", genus);
  }
  if let Some(generation) = &species.generation {
    println!("  generation:   {}", generation);
  }
  if let Some(rate) = species.capture_rate {
    println!("  capture rate: {}", rate);
  }
  if species.is_legendary {
    println!("  legendary");
  }
  if species.is_mythical {
    println!("  mythical");
  }
  if let Some(text) = &species.flavor_text {
    println!();
    println!("  {}", text);
  }
}

fn print_status(api: &ApiHelper) {
  let connectivity = api.connectivity();
  println!("network:  {}", connectivity.state());
  if let Some(latency) = connectivity.average_latency() {
    println!("latency:  {} ms", latency.as_millis());
  }
  if let Some(last) = connectivity.last_online() {
    println!("online:   last seen {}", last.to_rfc3339());
  }

  let cache = api.cache().stats();
  println!(
    "cache:    {} entries, {} / {} bytes",
    cache.entries,
    cache.total_size,
    api.cache().max_size()
  );

  let sync = api.sync();
  println!("sync:     {:?}, {} pending", sync.status(), sync.pending_count());
  for entry in sync.entries() {
    let error = entry.last_error.as_deref().unwrap_or("-");
    println!(
      "  {} {} (retries {}, last error: {})",
      entry.operation, entry.endpoint, entry.retry_count, error
    );
  }
}

/// Log to a daily rolling file next to the store.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = SqliteStore::default_path()?.with_file_name("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "pokedex.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env("POKEDEX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
