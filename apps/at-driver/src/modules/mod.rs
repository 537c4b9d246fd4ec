//! Command modules: the platform back ends behind the protocol methods.
//!
//! Exactly one [`CommandModule`] is chosen when the process starts and the
//! command server is generic over it, so dispatch never goes through a
//! vtable. [`CommandRegistry`] maps protocol methods onto that module.

pub mod macos;
pub mod windows;

use async_trait::async_trait;
use at_driver_proto::{Capabilities, Method, NewSessionResult, PressKeysParams};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::applescript::ScriptError;
use crate::keys::{KeyCombination, KeyError};
use crate::platform::Platform;
use crate::server::{ConnectionContext, Session};

pub use self::macos::MacOsModule;
pub use self::windows::{KeyDirection, KeyToggler, SystemKeyboard, WindowsModule};

/// Placeholder reported when a capability cannot be determined.
pub const UNKNOWN_CAPABILITY: &str = "unknown";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),
    #[error("failed to encode result: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("{0}")]
    Input(String),
}

#[async_trait]
pub trait CommandModule: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    /// Describe the assistive technology. Best-effort: lookups that fail
    /// fall back to [`UNKNOWN_CAPABILITY`] instead of failing the command.
    async fn capabilities(&self) -> Capabilities;

    /// Press and release `keys` as one gesture.
    async fn press_keys(&self, keys: &KeyCombination) -> Result<(), CommandError>;
}

pub struct CommandRegistry<M> {
    module: M,
}

impl<M: CommandModule> CommandRegistry<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }

    pub async fn dispatch(
        &self,
        ctx: &ConnectionContext<'_>,
        method: Method,
        params: Value,
    ) -> Result<Value, CommandError> {
        match method {
            Method::SessionNew => {
                let result = self.new_session(ctx).await;
                serde_json::to_value(result).map_err(CommandError::Encode)
            }
            Method::InteractionPressKeys => {
                let params: PressKeysParams =
                    serde_json::from_value(params).map_err(CommandError::InvalidParams)?;
                self.module.press_keys(&params.keys).await?;
                Ok(json!({}))
            }
        }
    }

    async fn new_session(&self, ctx: &ConnectionContext<'_>) -> NewSessionResult {
        let session = match ctx.session() {
            Some(existing) => existing,
            None => {
                // TODO: match capabilities requested by the client once the protocol defines them.
                let capabilities = self.module.capabilities().await;
                let candidate = Session {
                    session_id: Uuid::new_v4().to_string(),
                    capabilities,
                };
                let session = ctx.attach_session(candidate);
                info!(
                    connection_id = %ctx.id(),
                    session_id = %session.session_id,
                    "session established"
                );
                session
            }
        };
        NewSessionResult {
            session_id: session.session_id,
            capabilities: session.capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::server::ClientRegistry;

    #[derive(Default)]
    struct CountingModule {
        lookups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandModule for CountingModule {
        fn platform(&self) -> Platform {
            Platform::MacOs
        }

        async fn capabilities(&self) -> Capabilities {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Capabilities {
                at_name: "Voiceover".into(),
                at_version: "14.4".into(),
                platform_name: self.platform().to_string(),
            }
        }

        async fn press_keys(&self, _keys: &KeyCombination) -> Result<(), CommandError> {
            Ok(())
        }
    }

    #[test_timeout::timeout]
    async fn repeated_session_new_reuses_the_session_without_new_lookup() {
        let module = CountingModule::default();
        let lookups = Arc::clone(&module.lookups);
        let registry = CommandRegistry::new(module);
        let clients = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let ctx = ConnectionContext::new(clients.register(tx), &clients);

        let first = registry
            .dispatch(&ctx, Method::SessionNew, json!({}))
            .await
            .unwrap();
        let second = registry
            .dispatch(&ctx, Method::SessionNew, json!({}))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first["capabilities"]["platformName"], "macos");
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::timeout]
    async fn press_keys_rejects_missing_keys() {
        let registry = CommandRegistry::new(CountingModule::default());
        let clients = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let ctx = ConnectionContext::new(clients.register(tx), &clients);

        let err = registry
            .dispatch(&ctx, Method::InteractionPressKeys, json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::InvalidParams(_)));
    }
}
