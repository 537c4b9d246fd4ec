use std::ffi::c_void;
use std::io;
use std::ptr;

use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, warn};
use windows_sys::Win32::Foundation::LocalFree;
use windows_sys::Win32::Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW;
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;

use super::{handle_connection, VoiceEvent, VoiceOptions};

const SDDL_REVISION_1: u32 = 1;

// Authenticated users may read and write; administrators and SYSTEM get full
// control. Lets a non-elevated voice integration reach an elevated driver.
const PIPE_SDDL: &str = "D:(A;OICI;GRGW;;;AU)(A;OICI;GA;;;BA)(A;OICI;GA;;;SY)";

/// Security attributes built from an SDDL string; frees the descriptor on drop.
struct PipeSecurity {
    descriptor: *mut c_void,
    attributes: SECURITY_ATTRIBUTES,
}

impl PipeSecurity {
    fn authenticated_users() -> io::Result<Self> {
        let sddl: Vec<u16> = PIPE_SDDL.encode_utf16().chain(Some(0)).collect();
        let mut descriptor: *mut c_void = ptr::null_mut();
        // SAFETY: `sddl` is NUL-terminated and outlives the call; on success
        // the descriptor is owned by us until `LocalFree`.
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor as *mut *mut c_void as *mut _,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            descriptor,
            attributes: SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor as _,
                bInheritHandle: 0,
            },
        })
    }
}

impl Drop for PipeSecurity {
    fn drop(&mut self) {
        // SAFETY: allocated by ConvertStringSecurityDescriptorToSecurityDescriptorW.
        unsafe {
            LocalFree(self.descriptor as _);
        }
    }
}

pub(super) fn create_instance(name: &str, first: bool) -> io::Result<NamedPipeServer> {
    let mut security = PipeSecurity::authenticated_users()?;
    let mut options = ServerOptions::new();
    options.first_pipe_instance(first);
    // SAFETY: the attributes stay alive for the duration of the call, which
    // copies the descriptor into the new pipe object.
    unsafe {
        options.create_with_security_attributes_raw(
            name,
            &mut security.attributes as *mut SECURITY_ATTRIBUTES as *mut c_void,
        )
    }
}

/// Serve connections one at a time, always keeping one instance waiting so
/// clients never see the pipe missing.
pub(super) async fn serve(
    name: String,
    mut server: NamedPipeServer,
    events: broadcast::Sender<VoiceEvent>,
    options: VoiceOptions,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let connected = tokio::select! {
            _ = &mut shutdown => break,
            connected = server.connect() => connected,
        };
        let next = match create_instance(&name, false) {
            Ok(next) => next,
            Err(err) => {
                error!(pipe = %name, error = %err, "failed to create voice pipe instance");
                break;
            }
        };
        let mut client = std::mem::replace(&mut server, next);
        if let Err(err) = connected {
            warn!(error = %err, "failed to accept voice connection");
            continue;
        }
        let stopping = tokio::select! {
            _ = &mut shutdown => true,
            _ = handle_connection(&mut client, &events, &options) => false,
        };
        if let Err(err) = client.disconnect() {
            debug!(error = %err, "voice pipe disconnect failed");
        }
        if stopping {
            debug!("dropped voice connection for shutdown");
            break;
        }
    }
    debug!("voice accept loop finished");
}
