//! Named duplex byte-stream transport between instances.
//!
//! The production transport is a unix domain socket at the path derived from
//! the application identity. The traits exist so coordination logic never
//! touches socket specifics; a loopback TCP transport would slot in the same
//! way.

use std::{
    fs::Permissions,
    future::Future,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{UnixListener, UnixStream},
};
use tracing::debug;

use crate::wire::{self, ArgvCodec, WireError};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The primary did not answer within the configured bound. Definitive
    /// "cannot reach primary"; never retried at this layer.
    #[error("timed out after {0:?} waiting for the primary")]
    Timeout(Duration),
    /// Nothing is listening on the channel (stale or missing socket).
    #[error("no primary reachable at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The channel exists but is serving another client and its backlog is
    /// full. Retried locally, then folded into timeout handling upstream.
    #[error("channel busy after {attempts} connect attempts")]
    Busy { attempts: u32 },
    #[error("could not bind listener at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Accepting side of a bound channel, one connection at a time.
pub trait ChannelAcceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = Result<Self::Stream, ChannelError>> + Send;
}

/// A named, addressable, single-client-at-a-time duplex transport.
pub trait DuplexChannel {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Acceptor: ChannelAcceptor<Stream = Self::Stream>;

    /// Connect to the listening side, bounded by `timeout`.
    fn connect(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Stream, ChannelError>> + Send;

    /// Bind the listening side. Only the current lock holder may call this.
    fn bind(&self) -> impl Future<Output = Result<Self::Acceptor, ChannelError>> + Send;
}

/// Unix domain socket transport.
pub struct UnixChannel {
    path: PathBuf,
    busy_retries: u32,
}

impl UnixChannel {
    pub fn new(path: &Path, busy_retries: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            busy_retries,
        }
    }

    async fn connect_once(&self, timeout: Duration) -> Result<UnixStream, ChannelError> {
        let attempt = UnixStream::connect(&self.path);
        match tokio::time::timeout(timeout, attempt).await {
            Err(_) => Err(ChannelError::Timeout(timeout)),
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => Err(ChannelError::Busy {
                attempts: 1,
            }),
            Ok(Err(e)) => Err(ChannelError::Unreachable {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

impl DuplexChannel for UnixChannel {
    type Stream = UnixStream;
    type Acceptor = UnixAcceptor;

    fn connect(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<UnixStream, ChannelError>> + Send {
        async move {
            let mut attempts = 0;
            loop {
                match self.connect_once(timeout).await {
                    Err(ChannelError::Busy { .. }) => {
                        attempts += 1;
                        if attempts >= self.busy_retries {
                            return Err(ChannelError::Busy { attempts });
                        }
                        debug!(attempts, "channel busy, retrying connect");
                    }
                    other => return other,
                }
            }
        }
    }

    fn bind(&self) -> impl Future<Output = Result<UnixAcceptor, ChannelError>> + Send {
        async move {
            // We hold the lock, so any file already at this path is a leftover
            // from a dead primary.
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed stale socket"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ChannelError::Bind {
                        path: self.path.clone(),
                        source: e,
                    });
                }
            }

            let listener = UnixListener::bind(&self.path).map_err(|source| ChannelError::Bind {
                path: self.path.clone(),
                source,
            })?;

            // Any user on the host may marshal to us.
            if let Err(e) =
                std::fs::set_permissions(&self.path, Permissions::from_mode(0o666))
            {
                debug!(path = %self.path.display(), error = %e, "could not relax socket mode");
            }

            Ok(UnixAcceptor { listener })
        }
    }
}

pub struct UnixAcceptor {
    listener: UnixListener,
}

impl ChannelAcceptor for UnixAcceptor {
    type Stream = UnixStream;

    fn accept(&mut self) -> impl Future<Output = Result<UnixStream, ChannelError>> + Send {
        async move {
            let (stream, _addr) = self.listener.accept().await?;
            debug!(peer_pid = ?peer_pid(&stream), "accepted connection");
            Ok(stream)
        }
    }
}

/// Full secondary-side exchange: connect, send the argument vector, wait for
/// the primary's 4-byte exit code. The response wait shares the connect bound
/// so a wedged primary cannot hang the secondary forever.
pub async fn request_exit_code<C>(
    channel: &C,
    codec: &dyn ArgvCodec,
    args: &[String],
    timeout: Duration,
) -> Result<i32, ChannelError>
where
    C: DuplexChannel,
{
    let mut stream = channel.connect(timeout).await?;
    wire::write_request(&mut stream, codec, args).await?;

    match tokio::time::timeout(timeout, wire::read_response(&mut stream)).await {
        Err(_) => Err(ChannelError::Timeout(timeout)),
        Ok(result) => Ok(result?),
    }
}

/// PID of the peer on a unix stream, for tracing accepted connections.
/// Linux reads `SO_PEERCRED`, macOS `LOCAL_PEERPID`.
fn peer_pid(stream: &UnixStream) -> Option<i32> {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsFd;

        use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
        getsockopt(&stream.as_fd(), PeerCredentials)
            .ok()
            .map(|c| c.pid())
    }

    #[cfg(target_os = "macos")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let mut pid: libc::pid_t = 0;
        let mut len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_LOCAL,
                libc::LOCAL_PEERPID,
                (&raw mut pid).cast::<libc::c_void>(),
                &raw mut len,
            )
        };

        if ret == 0 { Some(pid) } else { None }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = stream;
        None
    }
}
