use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::load_config;
use crate::error::Result;
use crate::proxy::config::ProxyTable;

/// Re-reads `conf_path` and swaps in its proxy table. On any error the
/// current table stays in place. Returns the number of proxies now live.
pub fn reload_proxy_table(proxies: &ArcSwap<ProxyTable>, conf_path: &str) -> Result<usize> {
    let config = load_config(conf_path)?;
    let table = ProxyTable::new(config.proxies)?;
    let count = table.configs().len();
    proxies.store(Arc::new(table));
    Ok(count)
}

/// Spawns a background task that listens for SIGHUP (Unix) signals.
/// On SIGHUP, it re-reads the config file and atomically swaps the shared
/// proxy table via `ArcSwap`. In-flight requests keep the table they
/// started with.
pub fn spawn_reload_handler(proxies: Arc<ArcSwap<ProxyTable>>, conf_path: String) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to register SIGHUP handler: {}", e);
                    return;
                }
            };

            loop {
                sighup.recv().await;
                info!("SIGHUP received, reloading {}", conf_path);

                match reload_proxy_table(&proxies, &conf_path) {
                    Ok(count) => info!("Proxy table reloaded: {} proxies", count),
                    Err(e) => error!("Reload rejected, keeping current proxies: {}", e),
                }
            }
        }

        #[cfg(not(unix))]
        {
            tracing::warn!("Hot reload (SIGHUP) is only supported on Unix platforms.");
            let _ = (proxies, conf_path);
            std::future::pending::<()>().await;
        }
    });
}
