//! OS-level named endpoint: bind, accept, connect.
//!
//! # Platform Behavior
//! - **Unix**: a Unix domain socket file `<runtime dir>/<name>.sock`. A hub
//!   that dies leaves the file behind; the next hub removes it before binding.
//! - **Windows**: a named pipe `\\.\pipe\<name>`. Every accepted client
//!   consumes the waiting pipe instance, so a fresh instance is created before
//!   the connected one is handed off and there is never a moment without a
//!   listener.

use crate::transport::Connection;
use std::io;
use std::path::{Path, PathBuf};

/// Address of the endpoint named `name`.
pub fn endpoint_address(runtime_dir: &Path, name: &str) -> PathBuf {
    #[cfg(unix)]
    {
        runtime_dir.join(format!("{}.sock", super::paths::sanitize(name)))
    }

    #[cfg(windows)]
    {
        let _ = runtime_dir;
        PathBuf::from(format!(r"\\.\pipe\{}", super::paths::sanitize(name)))
    }
}

/// True when a connect error means "nobody is listening (yet)" rather than
/// "something answered and broke".
pub fn is_not_listening(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) {
        return true;
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;
        if err.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) {
            return true;
        }
    }

    false
}

/// True when a bind error means another listener already owns the address.
pub fn is_address_taken(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// One attempt to open a client connection.
pub async fn try_connect(address: &Path) -> io::Result<Connection> {
    #[cfg(unix)]
    {
        let stream = tokio::net::UnixStream::connect(address).await?;
        Ok(Connection::new(stream))
    }

    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;
        let client = ClientOptions::new().open(address)?;
        Ok(Connection::new(client))
    }
}

/// Remove whatever a crashed hub left at `address`.
pub fn clear_stale(address: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        match std::fs::remove_file(address) {
            Ok(()) => {
                tracing::debug!("Removed stale endpoint {}", address.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[cfg(windows)]
    {
        // Pipe instances die with their owning process.
        let _ = address;
        Ok(())
    }
}

/// A bound endpoint that keeps a listening instance ready.
#[derive(Debug)]
pub struct PlatformListener {
    address: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    pending: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl PlatformListener {
    /// Bind the endpoint. Fails with `AddrInUse`/`PermissionDenied` when
    /// another listener owns it.
    pub fn bind(address: &Path) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let listener = tokio::net::UnixListener::bind(address)?;
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                std::fs::set_permissions(address, perms)?;
            }
            Ok(Self {
                address: address.to_path_buf(),
                listener,
            })
        }

        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            let pending = ServerOptions::new()
                .first_pipe_instance(true)
                .create(address)?;
            Ok(Self {
                address: address.to_path_buf(),
                pending,
            })
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> io::Result<Connection> {
        #[cfg(unix)]
        {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(Connection::new(stream))
        }

        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ServerOptions;
            self.pending.connect().await?;
            let fresh = ServerOptions::new().create(&self.address)?;
            let connected = std::mem::replace(&mut self.pending, fresh);
            Ok(Connection::new(connected))
        }
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Err(e) = std::fs::remove_file(&self.address) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        "Failed to remove endpoint {}: {}",
                        self.address.display(),
                        e
                    );
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_endpoint_address_uses_runtime_dir() {
        let address = endpoint_address(Path::new("/run/user/1000/pipehub"), "room");
        assert_eq!(address, PathBuf::from("/run/user/1000/pipehub/room.sock"));
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_not_listening() {
        let temp = TempDir::new().unwrap();
        let address = endpoint_address(temp.path(), "absent");

        let err = try_connect(&address).await.unwrap_err();
        assert!(is_not_listening(&err), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_not_listening_and_clearable() {
        let temp = TempDir::new().unwrap();
        let address = endpoint_address(temp.path(), "stale");

        // A bound-then-dropped std listener leaves the socket file behind.
        drop(std::os::unix::net::UnixListener::bind(&address).unwrap());
        assert!(address.exists());

        let err = try_connect(&address).await.unwrap_err();
        assert!(is_not_listening(&err), "unexpected error: {err}");

        clear_stale(&address).unwrap();
        assert!(!address.exists());
        clear_stale(&address).unwrap();
    }

    #[tokio::test]
    async fn test_listener_removes_socket_on_drop() {
        let temp = TempDir::new().unwrap();
        let address = endpoint_address(temp.path(), "owned");

        let listener = PlatformListener::bind(&address).unwrap();
        assert!(address.exists());
        drop(listener);
        assert!(!address.exists());
    }

    #[tokio::test]
    async fn test_second_bind_reports_address_taken() {
        let temp = TempDir::new().unwrap();
        let address = endpoint_address(temp.path(), "taken");

        let _first = PlatformListener::bind(&address).unwrap();
        let err = PlatformListener::bind(&address).unwrap_err();
        assert!(is_address_taken(&err), "unexpected error: {err}");
    }
}
