use ssr_runtime::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point of the local SSR dev server.
///
/// `main` stays synchronous: the worker thread count comes from `ssr.conf`,
/// so the config is loaded before the Tokio runtime is built.
fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // 1. Logging
    telemetry::init_telemetry();

    // 2. Config: first CLI argument or `ssr.conf`, then the environment.
    // Any configuration error is fatal.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ssr.conf".to_string());
    let cfg = match config::load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Starting SSR runtime with {} worker threads... (Config: {}, {} proxies)",
        cfg.workers,
        config_path,
        cfg.proxies.len()
    );

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers)
        .enable_all()
        .build()?;

    // 4. Serve until Ctrl+C / SIGTERM
    rt.block_on(async {
        // --- Graceful Shutdown ---
        let shutdown_token = CancellationToken::new();
        let shutdown_token_signal = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            shutdown_token_signal.cancel();
        });

        let tls_acceptor = server::tls::load_tls_acceptor(&cfg)?;
        let listener = server::bind(&cfg.listen).await?;
        let runtime = SsrRuntime::builder(cfg).build().await?;

        // --- Hot Reload (SIGHUP) ---
        reload::spawn_reload_handler(Arc::clone(runtime.proxies()), config_path.clone());

        server::serve(runtime, listener, tls_acceptor, shutdown_token).await
    })?;

    Ok(())
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => { tracing::info!("Received Ctrl+C"); }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to listen for Ctrl+C");
    }
}
