// gitmirror binary entry point

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use common::bootstrap::{self, BackupService};
use common::cipher::generate_key;
use common::config::Settings;
use common::git::Git2Client;
use common::storage::{create_storage, StorageRegistry};
use common::telemetry;
use common::webhook::{self, WebhookState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command() {
        Command::Keygen => {
            println!("{}", generate_key());
            Ok(())
        }
        Command::Encrypt { value } => {
            let settings = load_settings(&cli)?;
            let security = bootstrap::init_security_context(&settings)?;
            println!("{}", security.encrypt_secret(&value)?);
            Ok(())
        }
        Command::Restore {
            repository,
            storage,
            local_path,
        } => {
            let settings = load_settings(&cli)?;
            validate(&settings)?;
            init_telemetry(&settings)?;
            let result = restore(&settings, &repository, &storage, &local_path).await;
            telemetry::shutdown_tracer();
            result
        }
        Command::Run => {
            let settings = load_settings(&cli)?;
            validate(&settings)?;
            init_telemetry(&settings)?;
            let result = run(settings).await;
            if let Err(e) = &result {
                error!(error = %e, "gitmirror exited with error");
            }
            telemetry::shutdown_tracer();
            result
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let settings = match &cli.config {
        Some(path) => Settings::load_with_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Settings::load().context("Failed to load configuration")?,
    };
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))
}

fn init_telemetry(settings: &Settings) -> Result<()> {
    let observability = &settings.observability;
    telemetry::init_logging(
        &observability.log_level,
        observability.log_format,
        observability.tracing_endpoint.as_deref(),
    )?;

    if let Some(port) = observability.metrics_port {
        telemetry::init_metrics(port)?;
    }
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    info!(
        data_path = %settings.data_path.display(),
        repositories = settings.repositories.len(),
        storages = settings.storages.len(),
        timezone = %settings.scheduler.timezone,
        "Starting gitmirror"
    );

    let service =
        Arc::new(BackupService::from_settings(&settings, Arc::new(Git2Client::new())).await?);

    // Bind first so a taken port aborts startup before any timer runs
    let listener = if settings.webhook.enabled {
        let addr: SocketAddr = format!("{}:{}", settings.webhook.host, settings.webhook.port)
            .parse()
            .context("Invalid webhook listen address")?;
        Some(webhook::bind(addr).await?)
    } else {
        info!("Webhook listener disabled");
        None
    };

    service.start().await?;

    let server_shutdown = CancellationToken::new();
    let mut server = listener.map(|listener| {
        let state = WebhookState {
            registry: Arc::clone(service.repositories()),
            runner: service.runner(),
        };
        let token = server_shutdown.clone();
        tokio::spawn(async move {
            webhook::serve(listener, state, async move { token.cancelled().await }).await
        })
    });

    let listener_failed = tokio::select! {
        _ = shutdown_signal() => None,
        result = async { server.as_mut()?.await.ok() }, if server.is_some() => Some(result),
    };
    info!("Shutting down");

    service.stop().await?;

    if let Some(result) = listener_failed {
        return match result {
            Some(Err(e)) => Err(e.context("Webhook listener stopped unexpectedly")),
            Some(Ok(())) => Err(anyhow::anyhow!("Webhook listener stopped unexpectedly")),
            None => Err(anyhow::anyhow!("Webhook listener task panicked")),
        };
    }

    if let Some(server) = server {
        server_shutdown.cancel();
        let timeout = Duration::from_secs(settings.webhook.shutdown_timeout_seconds);
        match tokio::time::timeout(timeout, server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Webhook listener failed"),
            Ok(Err(e)) => error!(error = %e, "Webhook listener task panicked"),
            Err(_) => warn!(
                timeout_seconds = settings.webhook.shutdown_timeout_seconds,
                "Webhook listener did not stop in time"
            ),
        }
    }

    info!("gitmirror stopped");
    Ok(())
}

/// Restore connects only the storage being read from
async fn restore(
    settings: &Settings,
    repository: &str,
    storage: &str,
    local_path: &std::path::Path,
) -> Result<()> {
    let security = bootstrap::init_security_context(settings)?;
    let config = settings
        .storages
        .iter()
        .find(|s| s.name() == storage)
        .with_context(|| format!("Unknown storage '{}'", storage))?;

    let storages = StorageRegistry::new();
    storages.add(create_storage(config, &security).await?);

    let files = bootstrap::restore_repository(&storages, repository, storage, local_path).await?;
    info!(repository = %repository, storage = %storage, files, "Restore complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
