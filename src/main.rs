use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use gatecache::app::{self, App, Startup};
use gatecache::cache::Tier;
use gatecache::config::Config;
use gatecache::logging;
use gatecache::query::{Query, QueryKind};

#[derive(Parser, Debug)]
#[command(name = "gatecache")]
#[command(about = "Pooled, cached record lookups against a login-gated web service")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./gatecache.yaml, then $XDG_CONFIG_HOME/gatecache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve a query, from cache when possible
  Resolve {
    #[command(subcommand)]
    query: QueryArgs,
  },
  /// Log the pool in and print pool and cache statistics
  Stats,
  /// Remove one cache entry
  Invalidate {
    key: String,
    #[arg(long)]
    tier: Tier,
  },
  /// Remove every entry in a cache tier
  Purge {
    #[arg(long)]
    tier: Tier,
  },
  /// Print the cache key for a query, e.g. `key name given=ana paternal=perez`
  Key {
    kind: QueryKind,
    /// Parameters as name=value
    params: Vec<String>,
  },
}

#[derive(Subcommand, Debug)]
enum QueryArgs {
  Identifier {
    id: String,
  },
  Name {
    #[arg(long, default_value = "")]
    given: String,
    #[arg(long, default_value = "")]
    paternal: String,
    #[arg(long, default_value = "")]
    maternal: String,
  },
  Phone {
    number: String,
  },
}

impl QueryArgs {
  fn to_query(&self) -> gatecache::Result<Query> {
    match self {
      QueryArgs::Identifier { id } => Query::identifier(id),
      QueryArgs::Name {
        given,
        paternal,
        maternal,
      } => Query::name(given, paternal, maternal),
      QueryArgs::Phone { number } => Query::phone(number),
    }
  }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Key computation needs no configuration
  if let Command::Key { kind, params } = &args.command {
    let pairs = params
      .iter()
      .map(|p| {
        p.split_once('=')
          .ok_or_else(|| eyre!("Expected name=value, got '{}'", p))
      })
      .collect::<Result<Vec<_>>>()?;
    println!("{}", Query::new(*kind, pairs)?.cache_key());
    return Ok(());
  }

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  match args.command {
    Command::Resolve { query } => {
      let query = query.to_query()?;
      let mut app = App::new(config, Startup::Lazy).await?;
      app.start_background();
      let resolution = app.orchestrator().resolve(&query).await?;
      print_json(&resolution)?;
    }
    Command::Stats => {
      let app = App::new(config, Startup::Eager).await?;
      print_json(&app.orchestrator().stats()?)?;
    }
    Command::Invalidate { key, tier } => {
      let cache = app::open_cache(&config)?;
      let removed = cache.delete(&key, tier)?;
      println!("{}", if removed { "removed" } else { "not present" });
    }
    Command::Purge { tier } => {
      let cache = app::open_cache(&config)?;
      let removed = cache.purge(tier)?;
      println!("removed {} entries from the {} tier", removed, tier);
    }
    Command::Key { .. } => {}
  }

  Ok(())
}
