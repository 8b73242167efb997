use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use punch_kiosk::config;
use punch_kiosk::db;
use punch_kiosk::model::{EntryState, QueueEntry};

#[derive(Parser, Debug)]
#[command(about = "Dump the kiosk's offline queue as JSON")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only entries in this state (pending, in_flight, failed_permanent)
    #[arg(long)]
    state: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = match args.state.as_deref() {
        Some(s) => Some(EntryState::parse_state(s).ok_or_else(|| anyhow!("unknown state: {}", s))?),
        None => None,
    };

    let cfg = config::load(Some(&args.config))?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let entries = db::list_entries(&pool, state)
        .await?
        .into_iter()
        .map(QueueEntry::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    eprintln!("{} entries", entries.len());
    Ok(())
}
