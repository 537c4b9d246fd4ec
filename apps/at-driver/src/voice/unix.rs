use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::{handle_connection, VoiceEndpoint, VoiceEvent, VoiceOptions, VoiceServerError};

/// Bind `path`, replacing a socket left behind by an earlier run. The
/// socket is world-writable so an unprivileged voice integration can
/// connect.
pub(super) async fn bind(path: &Path) -> Result<UnixListener, VoiceServerError> {
    let prepare = |source| VoiceServerError::Prepare {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(prepare)?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale voice socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(prepare(err)),
    }

    let listener = UnixListener::bind(path).map_err(|source| VoiceServerError::Listen {
        endpoint: VoiceEndpoint::UnixSocket(path.to_path_buf()),
        source,
    })?;
    tokio::fs::set_permissions(path, Permissions::from_mode(0o777))
        .await
        .map_err(prepare)?;
    Ok(listener)
}

/// Accept connections one at a time until shutdown is requested.
pub(super) async fn serve(
    listener: UnixListener,
    events: broadcast::Sender<VoiceEvent>,
    options: VoiceOptions,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };
        let mut stream = match accepted {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "failed to accept voice connection");
                continue;
            }
        };
        tokio::select! {
            _ = &mut shutdown => {
                debug!("dropping voice connection for shutdown");
                break;
            }
            _ = handle_connection(&mut stream, &events, &options) => {}
        }
    }
    debug!("voice accept loop finished");
}
