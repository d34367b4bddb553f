mod cache;
mod config;
mod event;
mod feed;
mod logging;
mod net;
mod notify;
mod relay;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cache::{CacheManager, CacheSource, CacheStorage, SqliteStorage};
use config::Config;
use event::{EventHandler, PollEvent};
use net::HttpNetwork;
use notify::{Permission, TerminalSink};
use relay::{PollSettings, Poller};

#[derive(Parser, Debug)]
#[command(name = "office-events")]
#[command(about = "Offline-first office events feed with relay-polled notifications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/office-events/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell into the configured cache generation
  Install,
  /// Request a resource through the offline cache and write its body to stdout
  Fetch {
    /// Resource name or URL, relative to the app base URL
    resource: String,
  },
  /// List upcoming office events
  Events,
  /// Print a freshly generated relay topic
  Topic,
  /// Poll a relay topic and show notifications until interrupted
  Subscribe {
    /// Relay topic (generated when omitted)
    topic: Option<String>,
    /// Grant notification permission without asking
    #[arg(long)]
    allow_notifications: bool,
  },
  /// Inspect or evict cache generations
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// List cache generations
  List,
  /// Delete a cache generation and all its entries
  Purge { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let data_dir = Config::data_dir()?;
  let _log_guard = logging::init(&data_dir.join("logs"))?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Install => install(&config, &data_dir).await,
    Command::Fetch { resource } => fetch(&config, &data_dir, &resource).await,
    Command::Events => events(&config, &data_dir).await,
    Command::Topic => {
      println!("{}", relay::generate_topic(&config.relay.topic_prefix)?);
      Ok(())
    }
    Command::Subscribe {
      topic,
      allow_notifications,
    } => subscribe(&config, topic, allow_notifications).await,
    Command::Cache { action } => cache_command(&config, &data_dir, action),
  }
}

fn open_storage(config: &Config, data_dir: &std::path::Path) -> Result<SqliteStorage> {
  let path = config
    .cache
    .path
    .clone()
    .unwrap_or_else(|| data_dir.join("cache.db"));
  SqliteStorage::open(&path)
}

fn open_manager(
  config: &Config,
  data_dir: &std::path::Path,
) -> Result<CacheManager<SqliteStorage, HttpNetwork>> {
  let storage = open_storage(config, data_dir)?;
  let network = Arc::new(HttpNetwork::new()?);
  Ok(CacheManager::new(
    storage,
    network,
    config.app.base()?,
    &config.cache,
  ))
}

/// Start the manager; a failed install leaves requests going straight to the network.
async fn start_manager(manager: &mut CacheManager<SqliteStorage, HttpNetwork>) {
  if let Err(e) = manager.start().await {
    tracing::warn!(error = %e, "cache manager not installed, requests bypass the cache");
    eprintln!("warning: offline cache unavailable: {}", e);
  }
}

async fn install(config: &Config, data_dir: &std::path::Path) -> Result<()> {
  let mut manager = open_manager(config, data_dir)?;
  manager.install().await?;
  println!(
    "Installed {} ({} resources, {:?})",
    manager.generation(),
    config.cache.precache.len(),
    manager.state()
  );
  Ok(())
}

async fn fetch(config: &Config, data_dir: &std::path::Path, resource: &str) -> Result<()> {
  let mut manager = open_manager(config, data_dir)?;
  start_manager(&mut manager).await;

  let result = manager.fetch(resource).await;
  manager.wait_until_idle().await;
  let result = result?;

  eprintln!(
    "{} {} ({}{})",
    result.data.status,
    result.data.header("content-type").unwrap_or("-"),
    result.source,
    result
      .cached_at
      .map(|t| format!(", cached {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
      .unwrap_or_default()
  );
  std::io::stdout().lock().write_all(&result.data.body)?;
  Ok(())
}

async fn events(config: &Config, data_dir: &std::path::Path) -> Result<()> {
  let mut manager = open_manager(config, data_dir)?;
  start_manager(&mut manager).await;

  let result = feed::load_events(&manager).await;
  manager.wait_until_idle().await;

  let result = match result {
    Ok(result) => result,
    Err(e) => {
      eprintln!("Error loading events: {}", e);
      eprintln!("Please check your connection and try again.");
      return Err(e);
    }
  };

  if result.source != CacheSource::Network {
    if let Some(cached_at) = result.cached_at {
      eprintln!(
        "(offline copy from {})",
        cached_at.format("%Y-%m-%d %H:%M:%S UTC")
      );
    }
  }

  if result.data.is_empty() {
    println!("No events scheduled.");
    return Ok(());
  }

  let now = feed::now();
  for event in &result.data {
    println!("{}", event.summary(now));
  }
  Ok(())
}

async fn subscribe(config: &Config, topic: Option<String>, allow_notifications: bool) -> Result<()> {
  let topic = match topic {
    Some(topic) => topic,
    None => {
      let topic = relay::generate_topic(&config.relay.topic_prefix)?;
      eprintln!("Generated topic: {}", topic);
      topic
    }
  };

  let permission = if allow_notifications {
    Permission::Granted
  } else {
    Permission::Default
  };
  let sink = Arc::new(TerminalSink::new(permission));
  let network = Arc::new(HttpNetwork::new()?);

  let mut events = EventHandler::new();
  let mut poller = Poller::new(
    network,
    sink,
    PollSettings::from_config(&config.relay)?,
    events.sender(),
  );

  let subscribed = poller.subscribe(&topic).await.map(|s| s.watch());
  for event in events.drain() {
    print_poll_event(&event);
  }
  let watch = subscribed?;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        poller.unsubscribe();
        break;
      }
      Some(event) = events.next() => print_poll_event(&event),
    }
  }

  for event in events.drain() {
    print_poll_event(&event);
  }
  tracing::info!(topic = %topic, last_seen = watch.last_seen(), "poll loop stopped");
  Ok(())
}

fn print_poll_event(event: &PollEvent) {
  match event {
    PollEvent::Status(status) => eprintln!("status: {}", status),
    other => {
      if let Some(line) = other.log_line() {
        eprintln!("{}", line);
      }
    }
  }
}

fn cache_command(config: &Config, data_dir: &std::path::Path, action: CacheAction) -> Result<()> {
  let storage = open_storage(config, data_dir)?;

  match action {
    CacheAction::List => {
      let generations = storage.generations()?;
      if generations.is_empty() {
        println!("No cache generations.");
      }
      for generation in generations {
        let marker = if generation.name == config.cache.name {
          "*"
        } else {
          " "
        };
        println!(
          "{} {} ({} entries, created {})",
          marker,
          generation.name,
          generation.entries,
          generation.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
      }
    }
    CacheAction::Purge { name } => {
      if storage.delete_generation(&name)? {
        tracing::info!(generation = %name, "purged cache generation");
        println!("Deleted {}", name);
      } else {
        println!("No cache generation named {}", name);
      }
    }
  }
  Ok(())
}
