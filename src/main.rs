//! Confidential Enclave Server
//!
//! Listens on vsock (inside a Nitro Enclave) or TCP (local development) for
//! one-shot JSON requests. See [`confidential_enclave::config`] for the
//! environment variables.

use anyhow::{Context, Result};
use confidential_enclave::attestation::{nsm_available, NsmAttestor};
use confidential_enclave::aws;
use confidential_enclave::config::{EnclaveConfig, TransportMode};
use confidential_enclave::protocol::Dispatcher;
use confidential_enclave::provisioner::KeyProvisioner;
use confidential_enclave::server;
use confidential_enclave::state::EnclaveConfigurationState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EnclaveConfig::from_env().context("Invalid configuration")?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Confidential Enclave Server...");

    // Auto-detect: NSM present means we are inside an enclave
    let in_enclave = nsm_available();
    let transport = config.transport.unwrap_or(if in_enclave {
        TransportMode::Vsock
    } else {
        TransportMode::Tcp
    });
    if !in_enclave {
        warn!("NSM device not found; configure requests will fail with attestation_unavailable");
    }

    let kms = aws::enclave_kms(config.vsock()).await;
    let provisioner = KeyProvisioner::new(Arc::new(NsmAttestor::new()), Arc::new(kms));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(EnclaveConfigurationState::new()),
        provisioner,
    ));

    if let Some(boot_key) = &config.boot_key {
        info!(key_id = %boot_key.key_id, "Provisioning traffic session key at boot");
        if let Err(e) = dispatcher.configure(boot_key).await {
            error!(
                reason = e.reason(),
                error = %e,
                "Boot provisioning failed; serving unconfigured"
            );
        }
    }

    let limits = config.limits();
    info!(
        transport = ?transport,
        port = config.listen_port,
        enclave_detected = in_enclave,
        "Starting listener"
    );

    match transport {
        TransportMode::Tcp => {
            let listener = server::bind_tcp(config.tcp_port()?).await.map_err(|e| {
                error!(error = %e, "Failed to start listener");
                e
            })?;
            server::serve_tcp(listener, dispatcher, limits).await?;
        }
        TransportMode::Vsock => run_vsock(config.listen_port, dispatcher, limits).await?,
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_vsock(
    port: u32,
    dispatcher: Arc<Dispatcher>,
    limits: server::ConnectionLimits,
) -> Result<()> {
    let listener = server::bind_vsock(port).map_err(|e| {
        error!(error = %e, "Failed to start listener");
        e
    })?;
    server::serve_vsock(listener, dispatcher, limits).await?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_vsock(
    _port: u32,
    _dispatcher: Arc<Dispatcher>,
    _limits: server::ConnectionLimits,
) -> Result<()> {
    anyhow::bail!("vsock is only supported on Linux")
}
