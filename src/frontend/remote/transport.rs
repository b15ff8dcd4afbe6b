//! Stream transport for the remote front end
//!
//! Local sessions listen on a Unix domain socket (named pipe on Windows)
//! through the interprocess crate; `--port` switches to TCP.

use std::fmt;
use std::io;
use std::path::PathBuf;

use interprocess::local_socket::traits::tokio::Listener as _;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::common::config::RemoteConfig;
use crate::common::paths;

#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
}

use platform::*;

/// Any byte stream a session can talk over
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

/// Where a session listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Endpoint for this process from configuration
    pub fn from_config(config: &RemoteConfig) -> Self {
        match config.port {
            Some(port) => Endpoint::Tcp {
                host: config.host.clone(),
                port,
            },
            None => Endpoint::Local(
                config
                    .sock_path
                    .clone()
                    .unwrap_or_else(|| paths::socket_path_for(std::process::id())),
            ),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

pub enum Listener {
    Local {
        listener: platform::Listener,
        path: PathBuf,
    },
    Tcp(TcpListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Local(path) => {
                // Ensure socket directory exists and clean up a stale socket
                paths::ensure_socket_dir(path)?;
                paths::remove_socket(path)?;

                let name = paths::socket_name(path);

                #[cfg(unix)]
                let listener = {
                    let name = name.to_fs_name::<GenericFilePath>()?;
                    ListenerOptions::new().name(name).create_tokio()?
                };

                #[cfg(windows)]
                let listener = {
                    let name = name.to_ns_name::<GenericNamespaced>()?;
                    ListenerOptions::new().name(name).create_tokio()?
                };

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }

                Ok(Listener::Local {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    pub async fn accept(&self) -> io::Result<BoxedConnection> {
        match self {
            Listener::Local { listener, .. } => {
                let stream = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(%peer, "TCP client connected");
                Ok(Box::new(stream))
            }
        }
    }

    /// Remove the socket file of a local listener
    pub fn cleanup(&self) {
        if let Listener::Local { path, .. } = self {
            if let Err(e) = paths::remove_socket(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

/// Connect to a listening session
pub async fn connect(endpoint: &Endpoint) -> io::Result<BoxedConnection> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            Ok(Box::new(stream))
        }
        Endpoint::Local(path) => {
            let name = paths::socket_name(path);

            #[cfg(unix)]
            let stream = {
                let name = name.to_fs_name::<GenericFilePath>()?;
                Stream::connect(name).await?
            };

            #[cfg(windows)]
            let stream = {
                let name = name.to_ns_name::<GenericNamespaced>()?;
                Stream::connect(name).await?
            };

            Ok(Box::new(stream))
        }
    }
}

/// Write one protocol line
pub async fn write_line<W, L>(writer: &mut W, line: &L) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    L: fmt::Display,
{
    writer.write_all(format!("{}\n", line).as_bytes()).await?;
    writer.flush().await
}
