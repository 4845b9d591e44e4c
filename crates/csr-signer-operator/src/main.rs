//! CSR signer - enrolls approved Kubernetes CertificateSigningRequests with EJBCA

mod health;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use csr_signer_authority::AuthorityClient;
use csr_signer_common::config::DEFAULT_CONFIG_PATH;
use csr_signer_common::credentials::DEFAULT_CREDENTIALS_PATH;
use csr_signer_common::telemetry::{component_span, init_telemetry, TelemetryConfig};
use csr_signer_common::{AuthorityCredentials, SignerConfig, DEFAULT_SERVICE_NAME};
use csr_signer_controller::{CertificateController, KubeStatusWriter, SigningHandler};

/// CSR signer - Kubernetes certificate signer backed by EJBCA
#[derive(Parser, Debug)]
#[command(name = "csr-signer", version, about, long_about = None)]
struct Cli {
    /// Signer configuration file
    #[arg(long, env = "CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Authority credentials file
    #[arg(long, env = "CREDENTIALS_PATH", default_value = DEFAULT_CREDENTIALS_PATH)]
    credentials: PathBuf,

    /// Controller name, used to label the object cache and exported spans
    #[arg(long, env = "SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    service_name: String,

    /// Override the configured number of sync workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Override the configured health check port
    #[arg(long, env = "HEALTH_CHECK_PORT")]
    health_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig::new(&cli.service_name))
        .context("failed to initialize telemetry")?;

    let mut config = SignerConfig::load(&cli.config)?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(port) = cli.health_port {
        config.health_check_port = port;
    }
    if config.workers == 0 {
        bail!("at least one worker is required");
    }

    let credentials = AuthorityCredentials::load(&cli.credentials)?;
    let authority = AuthorityClient::from_config(&config, &credentials)?;
    info!(
        controller = %cli.service_name,
        protocol = authority.protocol(),
        hostname = %credentials.hostname,
        workers = config.workers,
        "Starting CSR signer"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let handler = Arc::new(SigningHandler::new(
        authority,
        Arc::new(KubeStatusWriter::new(client.clone())),
        component_span("CertificateSigner-Handler"),
    ));
    let controller =
        CertificateController::new(&cli.service_name, handler, config.cache_sync_timeout());

    let csrs: Api<CertificateSigningRequest> = Api::all(client);
    let events = watcher(csrs, watcher::Config::default()).default_backoff();

    let cancel = CancellationToken::new();
    let mut controller_task = tokio::spawn(controller.run(events, config.workers, cancel.clone()));
    let mut health_task = tokio::spawn(health::serve(config.health_check_port, cancel.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            cancel.cancel();
            controller_task.await.context("controller task panicked")??;
            let _ = health_task.await;
        }
        result = &mut health_task => {
            cancel.cancel();
            let _ = controller_task.await;
            match result.context("health server task panicked")? {
                Ok(()) => bail!("health check server stopped unexpectedly"),
                Err(e) => {
                    error!(error = %e, port = config.health_check_port, "Health check server failed");
                    return Err(e).context("health check server failed");
                }
            }
        }
        result = &mut controller_task => {
            cancel.cancel();
            let _ = health_task.await;
            result.context("controller task panicked")??;
        }
    }

    info!("CSR signer stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
