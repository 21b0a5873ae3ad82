use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, LocalResult, Utc};
use clap::Parser;
use tracing::{error, info, warn};

use wgsteward::config::Config;
use wgsteward::lifecycle::ClientManager;
use wgsteward::reconcile;
use wgsteward::store::Store;
use wgsteward::wg::{Tunnel, WgCli};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Scheduler daemon for the wgsteward VPN console")]
struct Args {
    /// Seconds between expiry sweeps
    #[arg(short, long, default_value_t = 3600)]
    sweep_interval: u64,
}

/// Time until the next local midnight, when the daily usage snapshot runs.
fn until_next_midnight(now: DateTime<Local>) -> Duration {
    let next_day = (now + chrono::Duration::days(1)).date_naive();
    let midnight = match next_day
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_local_timezone(Local)
    {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t,
        // midnight falls in a DST gap; just run a day later
        LocalResult::None => now + chrono::Duration::days(1),
    };
    (midnight - now)
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let config = Config::from_env()?;
    info!(
        interface = %config.interface,
        data_dir = %config.data_dir.display(),
        sweep_interval = args.sweep_interval,
        "starting wgsteward"
    );

    let store = Store::new(&config.data_dir);
    store.init().await?;

    let tunnel = WgCli::new(&config.interface);
    if !tunnel.interface_up().await {
        warn!(interface = %config.interface, "interface is not up");
    }
    let status = tunnel.service_status().await;
    info!(active = status.active, since = ?status.since, "tunnel service status");

    let manager = Arc::new(ClientManager::new(store, tunnel, config));

    let sweep_manager = manager.clone();
    let sweep_interval = Duration::from_secs(args.sweep_interval);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            reconcile::expiry_sweep(&sweep_manager, Utc::now()).await;

            let peers = sweep_manager.tunnel().interface_stats().await;
            match sweep_manager.store().clients().await {
                Ok(clients) => {
                    let diverged = reconcile::divergences(&clients, &peers);
                    if !diverged.is_empty() {
                        warn!(
                            count = diverged.len(),
                            "record store and live peer set diverge"
                        );
                    }
                }
                Err(e) => error!(error = %e, "failed to list clients for divergence check"),
            }
        }
    });

    let usage_manager = manager.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(until_next_midnight(Local::now())).await;
            let date = Local::now().date_naive();
            if let Err(e) = reconcile::record_daily_usage(&usage_manager, date).await {
                error!(error = %e, "daily usage snapshot failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn midnight_delay_is_positive_and_within_a_day() {
        let now = Local.with_ymd_and_hms(2025, 3, 1, 13, 45, 0).unwrap();
        let delay = until_next_midnight(now);
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_secs(24 * 3600));
    }

    #[test]
    fn midnight_delay_just_before_midnight() {
        let now = Local.with_ymd_and_hms(2025, 3, 1, 23, 59, 59).unwrap();
        let delay = until_next_midnight(now);
        assert!(delay <= Duration::from_secs(1));
    }
}
