//! Bridges a PubTrans ROI XML-over-TCP feed onto an MQTT topic.
//!
//! [`run`] wires the four components together: the MQTT forwarder owns the
//! broker connection for the whole process lifetime; the connection
//! supervisor owns one ROI TCP session at a time and restarts it on
//! failure, gated on MQTT liveness.

pub mod asyncutil;
pub mod config;
pub mod element;
pub mod logging;
pub mod messenger;
pub mod mqtt;
pub mod queue;
pub mod roi;
pub mod supervisor;
pub mod xml;

use element::Element;
use std::path::PathBuf;
use std::sync::Arc;

/// Run the bridge until a shutdown signal is received. `templates_dir` is
/// the directory the five ROI message templates are loaded from.
pub async fn run(config: config::AppConfig, templates_dir: PathBuf) -> anyhow::Result<()> {
    let (xml_to_forwarder_tx, xml_to_forwarder_rx) = queue::channel::<Arc<Element>>();
    let (liveness_tx, liveness_rx) = mqtt::liveness_channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let forwarder_config = config.mqtt.clone();
    let mut forwarder_handle = tokio::spawn(async move {
        if let Err(err) = mqtt::run_forwarder(forwarder_config, xml_to_forwarder_rx, liveness_tx).await
        {
            tracing::error!(error = %err, "MQTT forwarder exited");
        }
    });

    let mut supervisor_handle = tokio::spawn(supervisor::run(
        config.roi,
        templates_dir,
        liveness_rx,
        xml_to_forwarder_tx,
        shutdown_rx,
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(&mut supervisor_handle, &mut forwarder_handle);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
