use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roombook::config::Config;
use roombook::mailer::{LogMailer, Mailer, SmtpMailer};
use roombook::service::Service;
use roombook::store::Store;
use roombook::{compactor, observability, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    if !config.jwt_secret_configured {
        tracing::warn!("ROOMBOOK_JWT_SECRET is not set, using the development signing key");
    }
    observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(Store::open(config.wal_path())?);
    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => match SmtpMailer::new(smtp) {
            Ok(mailer) => {
                info!(host = %smtp.host, port = smtp.port, "mail goes through SMTP");
                Arc::new(mailer)
            }
            Err(e) => {
                tracing::warn!("SMTP mailer unavailable, logging mail instead: {e}");
                Arc::new(LogMailer)
            }
        },
        None => {
            info!("ROOMBOOK_SMTP_HOST is not set, logging mail instead of sending it");
            Arc::new(LogMailer)
        }
    };
    let service = Arc::new(Service::from_config(store.clone(), &config, mailer));

    if let Some(admin) = &config.admin {
        if service.bootstrap_admin(admin).await? {
            info!(matricula = %admin.matricula, "administrator account created");
        }
    }

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_store, threshold).await;
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("roombook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  boundary: {:?}", config.boundary);
    info!("  require_approval: {}", config.require_approval);
    info!("  rooms: {}, users: {}", store.room_count(), store.user_count());

    server::serve(listener, service, config.max_connections, shutdown_signal()).await;

    info!("roombook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
