use std::time::Duration;

use log::info;
use parley_realtime::server::{ChatServer, ServerConfig};

const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

fn stats_interval() -> Duration {
    let secs = std::env::var("PARLEY_STATS_SECS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_STATS_INTERVAL_SECS);
    Duration::from_secs(secs.max(1))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!("Starting Parley chat server on {}...", config.bind_addr);
    let server = ChatServer::new(config);
    let hub = server.hub();

    let mut ticker = tokio::time::interval(stats_interval());
    ticker.tick().await;

    let run = server.run();
    tokio::pin!(run);

    loop {
        tokio::select! {
            result = &mut run => return result,
            _ = ticker.tick() => {
                let stats = hub.stats().await;
                info!(
                    "Stats: {} active / {} total connections, {} online users, {} rooms, \
                     {} messages in, {} copies out, {} dropped, {} rejected",
                    stats.active_connections,
                    stats.total_connections,
                    stats.online_users,
                    stats.active_rooms,
                    stats.total_messages,
                    stats.router.copies_delivered,
                    stats.router.copies_dropped,
                    stats.router.events_rejected,
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}
