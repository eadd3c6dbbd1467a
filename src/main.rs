use anyhow::{Context, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_router::config::AppConfig;
use mail_router::control;
use mail_router::events::EventBus;
use mail_router::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = AppConfig::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;

    eprintln!("📬 Mail Router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Mailbox: {}@{}:{}/{}",
        config.mailbox.username, config.mailbox.imap_host, config.mailbox.imap_port, config.mailbox.folder
    );
    eprintln!("   Ledger: {}", config.watch.ledger_path.display());
    eprintln!("   Control: http://{}/api/watch/status", config.control_addr);
    eprintln!("   Events WS: ws://{}/ws\n", config.control_addr);

    let controller = watch::from_config(&config, EventBus::new()).context("building watch pipeline")?;
    if config.watch.autostart {
        controller.start().context("starting watch session")?;
    }

    let app = control::routes(controller.clone());
    let listener = tokio::net::TcpListener::bind(&config.control_addr)
        .await
        .with_context(|| format!("binding control surface on {}", config.control_addr))?;
    tracing::info!(addr = %config.control_addr, "Control surface started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control surface failed")?;

    if controller.stop().is_ok() {
        tracing::info!("Waiting for the in-flight message to finish");
        controller.wait().await;
    }
    Ok(())
}

/// Stderr logging, plus a daily-rolling file when `MAIL_ROUTER_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file, guard) = match std::env::var("MAIL_ROUTER_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-router.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
