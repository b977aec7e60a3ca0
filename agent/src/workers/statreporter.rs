//! Stat reporter worker: pings the control plane with a resource snapshot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::System;
use tracing::{debug, error, info};

use crate::api::client::{ApiClient, PipedStat};

/// Stat reporter options
#[derive(Debug, Clone)]
pub struct Options {
    /// Ping interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Run the stat reporter worker
pub async fn run<S, F>(
    options: &Options,
    api: Arc<dyn ApiClient>,
    piped_id: String,
    version: String,
    started_at: DateTime<Utc>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("stat reporter starting...");

    let mut system = System::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("stat reporter shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        system.refresh_memory();
        let stat = PipedStat {
            piped_id: piped_id.clone(),
            version: version.clone(),
            started_at,
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            memory_used_bytes: system.used_memory(),
            memory_total_bytes: system.total_memory(),
            timestamp: Utc::now(),
        };

        debug!("pinging control plane...");
        if let Err(e) = api.ping(stat).await {
            error!("ping failed: {}", e);
        }
    }
}
