//! Forwards voice events to command clients.

use at_driver_proto::ServerEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::{BroadcastReport, Broadcaster};
use crate::voice::{VoiceEvent, VoiceEventKind};

pub fn spawn_bridge(
    events: broadcast::Receiver<VoiceEvent>,
    broadcaster: Broadcaster,
) -> JoinHandle<()> {
    tokio::spawn(run_bridge(events, broadcaster))
}

/// Runs until the voice server drops its sender.
pub async fn run_bridge(mut events: broadcast::Receiver<VoiceEvent>, broadcaster: Broadcaster) {
    loop {
        match events.recv().await {
            Ok(event) => {
                forward(&broadcaster, event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "voice bridge fell behind; events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("voice bridge finished");
}

/// Log `event` and, for speech, push it to every sessioned client.
pub fn forward(broadcaster: &Broadcaster, event: VoiceEvent) -> Option<BroadcastReport> {
    info!(kind = %event.name, data = %event.data, "voice event");
    if event.name != VoiceEventKind::Speech {
        return None;
    }
    let captured = ServerEvent::CapturedOutput { data: event.data };
    match broadcaster.broadcast(&captured) {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(error = %err, "failed to encode captured output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ClientRegistry, Session};
    use at_driver_proto::Capabilities;
    use tokio::sync::mpsc;

    fn sessioned_client(registry: &ClientRegistry) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let id = registry.register(tx);
        registry.attach_session(
            id,
            Session {
                session_id: "s".into(),
                capabilities: Capabilities {
                    at_name: "Voiceover".into(),
                    at_version: "unknown".into(),
                    platform_name: "macos".into(),
                },
            },
        );
        rx
    }

    #[test_timeout::timeout]
    fn only_speech_is_forwarded() {
        let registry = ClientRegistry::new();
        let mut client = sessioned_client(&registry);
        let broadcaster = registry.broadcaster();

        assert!(forward(&broadcaster, VoiceEvent::parse("lifecycle:ready")).is_none());
        assert!(forward(&broadcaster, VoiceEvent::internal_error("oops")).is_none());
        let report = forward(&broadcaster, VoiceEvent::parse("speech:done")).unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(
            client.try_recv().unwrap(),
            r#"{"method":"interaction.capturedOutput","params":{"data":"done"}}"#
        );
        assert!(client.try_recv().is_err());
    }

    #[test_timeout::timeout]
    async fn bridge_stops_when_voice_server_goes_away() {
        let registry = ClientRegistry::new();
        let mut client = sessioned_client(&registry);
        let (tx, rx) = broadcast::channel(4);
        let bridge = spawn_bridge(rx, registry.broadcaster());

        tx.send(VoiceEvent::parse("speech:one")).unwrap();
        drop(tx);
        bridge.await.unwrap();

        assert!(client.recv().await.unwrap().contains("\"one\""));
    }
}
