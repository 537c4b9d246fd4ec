//! Bridge between WebSocket test harnesses and an assistive technology.
//!
//! Harness clients drive the screen reader through the command server
//! ([`server`]); what the screen reader speaks arrives on the local voice
//! server ([`voice`]) and is forwarded to every client holding a session
//! ([`bridge`]).

pub mod applescript;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod keys;
pub mod modules;
pub mod platform;
pub mod server;
pub mod telemetry;
pub mod voice;

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::modules::{CommandModule, MacOsModule, WindowsModule};
use crate::platform::Platform;
use crate::server::{CommandServer, DeliveryError, ListeningServer, ServerError};
use crate::voice::{VoiceEndpoint, VoiceServer, VoiceServerError};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Voice(#[from] VoiceServerError),
}

/// Both servers plus the task connecting them.
pub struct Driver {
    commands: ListeningServer,
    voice: VoiceServer,
    bridge: JoinHandle<()>,
    delivery_log: JoinHandle<()>,
}

impl Driver {
    /// Start the command and voice servers together; either failing to
    /// bind fails the whole start.
    pub async fn start<M: CommandModule>(
        module: M,
        config: &Config,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, DriverError> {
        info!(platform = %module.platform(), "starting command module");
        let mut server = CommandServer::new(module);
        if let Some(handle) = metrics {
            server = server.with_metrics(handle);
        }

        let (commands, voice) = tokio::try_join!(
            async { server.listen(config.listen_addr).await.map_err(DriverError::from) },
            async {
                VoiceServer::listen(config.voice_endpoint.clone(), config.voice.clone())
                    .await
                    .map_err(DriverError::from)
            },
        )?;

        let bridge = bridge::spawn_bridge(voice.subscribe(), commands.broadcaster());
        let delivery_log = spawn_delivery_log(commands.errors());
        Ok(Self {
            commands,
            voice,
            bridge,
            delivery_log,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.commands.local_addr()
    }

    pub fn voice_endpoint(&self) -> &VoiceEndpoint {
        self.voice.endpoint()
    }

    /// Stop both servers and remove the voice socket.
    pub async fn shutdown(self) -> Result<(), DriverError> {
        let voice = self.voice.shutdown().await;
        let commands = self.commands.shutdown().await;
        if let Err(err) = self.bridge.await {
            warn!(error = %err, "voice bridge task failed");
        }
        self.delivery_log.abort();
        voice?;
        commands?;
        Ok(())
    }
}

fn spawn_delivery_log(mut errors: broadcast::Receiver<DeliveryError>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(err) => warn!(
                    connection_id = %err.connection_id,
                    reason = %err.reason,
                    "command server delivery failed"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "delivery error log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Run until Ctrl-C with the command module for `config.platform`.
pub async fn run(config: Config, metrics: Option<PrometheusHandle>) -> anyhow::Result<()> {
    match config.platform {
        Platform::MacOs => serve(MacOsModule::default(), &config, metrics).await,
        Platform::Windows => serve(WindowsModule::default(), &config, metrics).await,
    }
}

async fn serve<M: CommandModule>(
    module: M,
    config: &Config,
    metrics: Option<PrometheusHandle>,
) -> anyhow::Result<()> {
    let driver = Driver::start(module, config, metrics).await?;
    info!(
        platform = %config.platform,
        listen_addr = %driver.local_addr(),
        voice_endpoint = %driver.voice_endpoint(),
        "at-driver ready"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
    driver.shutdown().await?;
    info!("shutdown complete");
    Ok(())
}
