use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use punch_kiosk::clock::SystemClock;
use punch_kiosk::config::{self, Config};
use punch_kiosk::connectivity::{spawn_connectivity_probe, Connectivity};
use punch_kiosk::correction::CorrectionRequest;
use punch_kiosk::credential::{hash_pin, Pbkdf2PinVerifier, PIN_ITERATIONS};
use punch_kiosk::db;
use punch_kiosk::kiosk::{CaptureRequest, Kiosk, KioskSettings};
use punch_kiosk::model::{PunchType, ReasonCategory};
use punch_kiosk::remote::{PayrollClient, RemoteAuthority};
use punch_kiosk::sync::spawn_sync_scheduler;

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline-resilient time clock kiosk")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background sync scheduler and connectivity probe until Ctrl-C
    Serve,
    /// Capture a punch
    Punch {
        #[arg(long)]
        employee: String,
        /// Expected punch type; defaults to the next type in the shift
        #[arg(long = "type", value_parser = parse_punch_type)]
        punch_type: Option<PunchType>,
        #[arg(long)]
        location: Option<String>,
        /// Path of a captured photo to upload with the punch
        #[arg(long)]
        photo: Option<String>,
        #[arg(long)]
        pin: Option<String>,
        /// Scheduled shift length in hours, if known
        #[arg(long)]
        scheduled_hours: Option<u32>,
    },
    /// Submit a correction for a missed clock-out
    Correct {
        #[arg(long)]
        employee: String,
        /// Id of the open punch being corrected
        #[arg(long)]
        punch: String,
        /// Corrected clock-out time (RFC 3339)
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long)]
        reason: String,
        #[arg(long, value_parser = parse_category)]
        category: ReasonCategory,
    },
    /// Print connectivity and queue counts
    Status,
    /// Drain the queue once, ignoring backoff
    Sync,
    /// Return permanently failed entries to the queue
    Resync,
    /// Print a PIN record for the `credentials.pins` config section
    HashPin {
        #[arg(long)]
        pin: String,
    },
}

fn parse_punch_type(s: &str) -> Result<PunchType, String> {
    PunchType::parse_type(s).ok_or_else(|| format!("unknown punch type: {}", s))
}

fn parse_category(s: &str) -> Result<ReasonCategory, String> {
    ReasonCategory::parse_category(s).ok_or_else(|| format!("unknown reason category: {}", s))
}

/// One-shot commands sync in the foreground, so capture-triggered passes are
/// only spawned by `serve`.
async fn open_kiosk(
    cfg: &Config,
    online: bool,
    serve: bool,
) -> Result<(Kiosk, Arc<dyn RemoteAuthority>)> {
    cfg.ensure_dirs()?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let base_url = Url::parse(&cfg.remote.base_url).context("invalid remote.base_url")?;
    let remote: Arc<dyn RemoteAuthority> = Arc::new(PayrollClient::new(
        base_url,
        cfg.remote.api_token.clone(),
        Duration::from_secs(cfg.sync.request_timeout_seconds),
    )?);
    let verifier = Pbkdf2PinVerifier::from_records(&cfg.credentials.pins)?;
    let mut settings = KioskSettings::from_config(cfg)?;
    settings.submit_on_capture &= serve;
    let kiosk = Kiosk::open(
        pool,
        Arc::clone(&remote),
        Arc::new(SystemClock),
        Arc::new(verifier),
        Connectivity::new(online),
        settings,
    )
    .await?;
    Ok((kiosk, remote))
}

/// One-shot commands check the link once instead of running the probe.
async fn probe_once(cfg: &Config) -> bool {
    let Ok(base_url) = Url::parse(&cfg.remote.base_url) else {
        return false;
    };
    let timeout = Duration::from_secs(cfg.sync.request_timeout_seconds);
    let Ok(client) = PayrollClient::new(base_url, cfg.remote.api_token.clone(), timeout) else {
        return false;
    };
    match client.health_check().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "payroll backend unreachable; working offline");
            false
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::HashPin { pin } = &args.command {
        println!("{}", hash_pin(pin, PIN_ITERATIONS)?.encode());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    match args.command {
        Command::Serve => {
            let (kiosk, remote) = open_kiosk(&cfg, false, true).await?;
            let cancel = CancellationToken::new();
            let probe = spawn_connectivity_probe(
                remote,
                kiosk.connectivity().clone(),
                Duration::from_secs(cfg.sync.probe_interval_seconds),
                cancel.clone(),
            );
            let scheduler = spawn_sync_scheduler(
                Arc::clone(kiosk.engine()),
                Duration::from_secs(cfg.sync.interval_seconds),
                cancel.clone(),
            );
            info!(device_id = %kiosk.device_id(), "kiosk serving");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            cancel.cancel();
            let _ = tokio::join!(probe, scheduler);
        }
        Command::Punch {
            employee,
            punch_type,
            location,
            photo,
            pin,
            scheduled_hours,
        } => {
            let online = probe_once(&cfg).await;
            let (kiosk, _) = open_kiosk(&cfg, online, false).await?;
            let mut request = CaptureRequest::new(employee);
            request.punch_type = punch_type;
            request.location = location;
            request.photo_reference = photo;
            request.credential = pin;
            request.scheduled_shift = scheduled_hours.map(|h| ChronoDuration::hours(i64::from(h)));
            let punch = kiosk.capture_punch(request).await?;
            print_json(&punch)?;
            if online {
                print_json(&kiosk.force_sync().await?)?;
            }
        }
        Command::Correct {
            employee,
            punch,
            at,
            reason,
            category,
        } => {
            let online = probe_once(&cfg).await;
            let (kiosk, _) = open_kiosk(&cfg, online, false).await?;
            let correction = kiosk
                .submit_correction(CorrectionRequest {
                    employee_id: employee,
                    original_punch_id: punch,
                    corrected_timestamp: at,
                    reason,
                    reason_category: Some(category),
                })
                .await?;
            print_json(&correction)?;
            if online {
                print_json(&kiosk.force_sync().await?)?;
            }
        }
        Command::Status => {
            let online = probe_once(&cfg).await;
            let (kiosk, _) = open_kiosk(&cfg, online, false).await?;
            print_json(&kiosk.get_offline_status().await?)?;
            for entry in kiosk.failed_entries().await? {
                println!(
                    "failed_permanent {} ({}) retries={} error={}",
                    entry.entry_id,
                    entry.payload.kind(),
                    entry.retry_count,
                    entry.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Sync => {
            let online = probe_once(&cfg).await;
            if !online {
                return Err(anyhow!("payroll backend unreachable"));
            }
            let (kiosk, _) = open_kiosk(&cfg, online, false).await?;
            print_json(&kiosk.force_sync().await?)?;
        }
        Command::Resync => {
            let (kiosk, _) = open_kiosk(&cfg, false, false).await?;
            let requeued = kiosk.resync_failed().await?;
            println!("requeued {} entries", requeued);
        }
        Command::HashPin { .. } => {}
    }

    Ok(())
}
