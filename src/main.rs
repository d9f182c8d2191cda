use std::path::PathBuf;

use clap::{Parser, Subcommand};

use feedkeeper::cache::Cache;
use feedkeeper::config::Config;
use feedkeeper::core::store::StoreHandle;

/// Inspect and maintain a feedkeeper archive.
#[derive(Parser)]
#[command(name = "feedkeeper")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file. Overrides config and FEEDKEEPER_DB.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show feed spans, open thread gaps and archive totals
    Status,
    /// Clear all sync state; archived messages are kept
    Resync,
    /// Rebuild the projection from the archive
    Rebuild,
    /// Load the cache and list groups with unread thread counts
    Summary,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::resolve();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let store = StoreHandle::open(config.db_path.clone())?;

    match cli.command {
        Commands::Status => status(&store, &config).await?,
        Commands::Resync => {
            store.clear_sync_state().await?;
            println!("sync state cleared");
        }
        Commands::Rebuild => {
            let report = store.rebuild_projection().await?;
            println!("projected {} records", report.projected);
            for problem in &report.protocol_errors {
                println!("  skipped: {problem}");
            }
        }
        Commands::Summary => summary(&store).await?,
    }
    Ok(())
}

async fn status(store: &StoreHandle, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let stats = store.stats().await?;
    let snapshot = store.load_sync_state().await?;

    println!("database:   {}", config.db_path.display());
    println!("algorithm:  {}", config.algorithm);
    match config.history_limit_days {
        0 => println!("history:    unlimited"),
        days => println!("history:    {days} days"),
    }
    println!("archived:   {} messages", stats.archived_messages);
    match stats.last_fetched_utc {
        Some(at) => println!("last fetch: {}", at.to_rfc3339()),
        None => println!("last fetch: never"),
    }

    println!();
    println!("feeds ({}):", snapshot.feeds.len());
    for feed in &snapshot.feeds {
        let flag = if feed.reached_empty_result { " (complete)" } else { "" };
        println!("  {}{flag}", feed.feed_id);
        for span in &feed.spans {
            println!(
                "    {}..={}  from {}",
                span.start_message_id,
                span.end_message_id,
                span.start_time_utc.format("%Y-%m-%d %H:%M")
            );
        }
    }

    println!();
    println!("open thread gaps ({}):", snapshot.threads.len());
    for gap in &snapshot.threads {
        let from = gap
            .last_pulled_message_id
            .map_or_else(|| "newest".to_string(), |id| id.to_string());
        println!(
            "  thread {} in {}: {from} down to {} (retries {})",
            gap.thread_id, gap.feed_id, gap.stop_message_id, gap.retry_count
        );
    }
    Ok(())
}

async fn summary(store: &StoreHandle) -> Result<(), Box<dyn std::error::Error>> {
    let delta = store.load_all().await?;
    let mut cache = Cache::new();
    cache.reload(&delta);

    let mut groups: Vec<_> = cache
        .groups()
        .filter_map(|g| g.row.row().map(|row| (row.full_name.as_str(), g)))
        .collect();
    groups.sort_by(|a, b| a.0.cmp(b.0));

    for (name, group) in groups {
        println!(
            "{name:<40} {:>5} threads {:>5} unread",
            group.threads.len(),
            group.unread_thread_count()
        );
    }
    println!(
        "{} users, {} threads, {} messages",
        cache.users().filter(|u| u.row.is_loaded()).count(),
        cache.threads().filter(|t| t.is_loaded()).count(),
        cache.messages().filter(|m| m.row.is_loaded()).count()
    );
    Ok(())
}
