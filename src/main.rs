use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use imgcache::cache::Priority;
use imgcache::{logging, Config, ImageCache};

#[derive(Parser, Debug)]
#[command(name = "imgcache")]
#[command(about = "Persistent, throttled image cache with per-page statistics")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/imgcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Page identifier used for statistics attribution
  #[arg(short, long)]
  page: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve image URLs through the cache
  Resolve {
    #[arg(required = true)]
    urls: Vec<String>,

    #[arg(long, value_enum, default_value_t = Priority::Normal)]
    priority: Priority,
  },
  /// Print hit/miss statistics
  Stats,
  /// Print store and ledger state as JSON
  Debug,
  /// Re-check the durable store and correct the unavailable flag
  Sync,
  /// Drop every cached image and statistic
  Reset,
  /// Mark an image for refetch on next use
  Invalidate { url: String },
  /// Delete an image from the cache
  Remove { url: String },
  /// Refetch an image and overwrite the cached copy
  Update { url: String },
  /// Delete images older than store.max_age_hours
  Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let cache = ImageCache::new(&config).await?;
  let page = args.page.as_deref();

  match args.command {
    Command::Resolve { urls, priority } => {
      let resolved = cache.resolve_images_batch(&urls, page, priority).await;
      for url in &urls {
        let Some(reference) = resolved.get(url) else {
          continue;
        };
        let size = cache
          .read_blob(reference)
          .map(|bytes| format!("{} bytes", bytes.len()))
          .unwrap_or_else(|| "not cached".to_string());
        println!("{} -> {} ({})", url, reference, size);
      }
      println!("{}", cache.display_stats());
    }
    Command::Stats => println!("{}", cache.display_stats()),
    Command::Debug => {
      let report = cache.debug_cache().await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Command::Sync => {
      let corrected = cache.sync_cache_status().await?;
      println!(
        "Store {} (flag {})",
        if cache.is_cache_available() { "available" } else { "unavailable" },
        if corrected { "corrected" } else { "unchanged" }
      );
    }
    Command::Reset => {
      let usable = cache.reset_all_caches().await?;
      println!("Caches reset, store {}", if usable { "available" } else { "unavailable" });
    }
    Command::Invalidate { url } => {
      let existed = cache.invalidate_image(&url).await?;
      println!("{} {}", url, if existed { "marked for refetch" } else { "not cached" });
    }
    Command::Remove { url } => {
      let existed = cache.remove_image(&url).await?;
      println!("{} {}", url, if existed { "removed" } else { "not cached" });
    }
    Command::Update { url } => {
      let updated = cache.update_image(&url).await?;
      println!(
        "{} updated ({} bytes, {})",
        url,
        updated.size_bytes,
        if updated.changed { "changed" } else { "unchanged" }
      );
      cache.release_blob(updated.reference.as_str());
    }
    Command::Purge => {
      let removed = cache.purge_expired()?;
      println!("Purged {} expired images", removed);
    }
  }

  Ok(())
}
