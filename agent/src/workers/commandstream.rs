//! Command stream worker: long-polls unhandled commands and routes them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::api::client::ApiClient;
use crate::commandstream::CommandProcessor;

/// Command stream worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval for unhandled commands
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Run the command stream worker
pub async fn run<S, F>(
    options: &Options,
    api: Arc<dyn ApiClient>,
    processor: Arc<CommandProcessor>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("command stream worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("command stream worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        debug!("polling for commands...");

        let commands = match api.list_unhandled_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                error!("command poll failed: {}", e);
                continue;
            }
        };

        for command in commands {
            if let Err(e) = processor.process(command).await {
                error!("command handling failed: {}", e);
            }
        }
    }
}
