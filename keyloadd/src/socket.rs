//! Agent socket housekeeping.

use std::io;
use std::os::unix::fs::{FileTypeExt as _, PermissionsExt as _};
use std::path::Path;

use anyhow::{Context as _, bail};
use tracing::{debug, warn};

/// Make `socket` bindable.
///
/// Creates the parent directory (mode 0700) if it is missing, and removes a
/// leftover socket file from a previous run.  Fails if another agent is still
/// accepting connections on it, or if the path holds anything other than a
/// socket.
pub fn prepare(socket: &Path) -> anyhow::Result<()> {
    if let Some(dir) = socket.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create socket directory {}", dir.display()))?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("chmod 0700 {}", dir.display()))?;
        debug!(path = %dir.display(), "created socket directory");
    }

    let metadata = match std::fs::symlink_metadata(socket) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", socket.display())),
    };
    if !metadata.file_type().is_socket() {
        bail!(
            "{} exists and is not a socket; refusing to replace it",
            socket.display()
        );
    }

    if std::os::unix::net::UnixStream::connect(socket).is_ok() {
        bail!(
            "an agent is already listening on {}; stop it or choose another [agent] socket",
            socket.display()
        );
    }

    std::fs::remove_file(socket)
        .with_context(|| format!("remove stale agent socket {}", socket.display()))?;
    debug!(path = %socket.display(), "removed stale agent socket");
    Ok(())
}

/// Remove the socket on shutdown.  A missing file is not an error, and
/// anything that is not a socket is left alone.
pub fn cleanup(socket: &Path) {
    match std::fs::symlink_metadata(socket) {
        Ok(m) if m.file_type().is_socket() => {}
        Ok(_) => {
            warn!(path = %socket.display(), "not a socket, leaving it in place");
            return;
        }
        Err(_) => return,
    }
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(path = %socket.display(), "removed agent socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %socket.display(), "failed to remove agent socket: {e}"),
    }
}
