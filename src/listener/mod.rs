//! Listener Abstraction: a uniform accept-producing source over TCP,
//! UNIX-domain, and TLS-wrapped TCP bindings (§4.1).
//!
//! Grounded in the daemon crate's own server module, which dispatches on a
//! bind-kind enum and spawns the TLS handshake off the accept loop so one
//! slow or hostile handshake never stalls other connections.

mod tls;

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::BindSpec;
use crate::errors::{Result, ServerError};

pub use tls::{build_server_config, load_cert_chain};

/// An object-safe byte stream, used for the non-TLS variants so tests can
/// exercise `ConnectionHandler` against any `AsyncRead + AsyncWrite`, not
/// just a live socket.
type BoxedIo = Box<dyn AsyncReadWrite>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// The stream handed to `ConnectionHandler::handle` once a connection has
/// cleared allow-listing (and, for TLS, the handshake).
pub enum Stream {
    Plain(BoxedIo),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A connection fresh off the listener, before allow-listing or (for TLS)
/// the handshake has run.
pub enum Accepted {
    /// Ready to hand to the handler once allow-listed.
    Ready { stream: Stream, remote_address: Option<SocketAddr> },
    /// A raw TCP connection on a `tls://` bind; the handshake runs off the
    /// accept loop so a slow client cannot stall other connections.
    PendingTls {
        tcp: TcpStream,
        acceptor: TlsAcceptor,
        remote_address: SocketAddr,
    },
}

/// The bound, listening half of the Listener Abstraction.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
    Tls(TcpListener, TlsAcceptor),
}

impl Listener {
    /// Bind fresh, per `spec`. Fails with `BindFailed` on address-in-use or
    /// permission errors.
    pub async fn bind_and_listen(spec: &BindSpec) -> Result<Self> {
        match spec {
            BindSpec::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(ServerError::BindFailed)?;
                Ok(Listener::Tcp(listener))
            }
            BindSpec::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(ServerError::BindFailed)?;
                }
                let listener = UnixListener::bind(path).map_err(ServerError::BindFailed)?;
                Ok(Listener::Unix(listener, path.clone()))
            }
            BindSpec::Tls { addr, cert_path, key_path } => {
                let listener = TcpListener::bind(addr).await.map_err(ServerError::BindFailed)?;
                let acceptor = build_tls_acceptor(cert_path, key_path)?;
                Ok(Listener::Tls(listener, acceptor))
            }
        }
    }

    /// Reconstruct a listener around an inherited raw file descriptor,
    /// without rebinding (§4.1, §4.5.2).
    pub fn inherit_from(fd: RawFd, spec: &BindSpec) -> Result<Self> {
        match spec {
            BindSpec::Tcp(_) => {
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener.set_nonblocking(true).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                let listener = TcpListener::from_std(std_listener).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                Ok(Listener::Tcp(listener))
            }
            BindSpec::Unix(path) => {
                let std_listener = unsafe { StdUnixListener::from_raw_fd(fd) };
                std_listener.set_nonblocking(true).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                let listener = UnixListener::from_std(std_listener).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                Ok(Listener::Unix(listener, path.clone()))
            }
            BindSpec::Tls { cert_path, key_path, .. } => {
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener.set_nonblocking(true).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                let listener = TcpListener::from_std(std_listener).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                let acceptor = build_tls_acceptor(cert_path, key_path).map_err(|e| ServerError::InheritFailed(e.to_string()))?;
                Ok(Listener::Tls(listener, acceptor))
            }
        }
    }

    /// Accept one connection. `AcceptTransient` is recoverable — callers
    /// should log and keep looping.
    pub async fn accept(&self) -> Result<Accepted> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(ServerError::AcceptTransient)?;
                Ok(Accepted::Ready {
                    stream: Stream::Plain(Box::new(stream)),
                    remote_address: Some(addr),
                })
            }
            Listener::Unix(listener, _) => {
                let (stream, _addr) = listener.accept().await.map_err(ServerError::AcceptTransient)?;
                Ok(Accepted::Ready {
                    stream: Stream::Plain(Box::new(stream)),
                    // UNIX-domain peers have no IP; allow-listing does not apply (§4.1).
                    remote_address: None,
                })
            }
            Listener::Tls(listener, acceptor) => {
                let (tcp, addr) = listener.accept().await.map_err(ServerError::AcceptTransient)?;
                Ok(Accepted::PendingTls { tcp, acceptor: acceptor.clone(), remote_address: addr })
            }
        }
    }

    /// The raw fd to pass to a successor process across restart handover.
    pub fn underlying_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l, _) => l.as_raw_fd(),
            Listener::Tls(l, _) => l.as_raw_fd(),
        }
    }

    /// `tcp`, `unix`, or `tls`, for `SERVER_INHERITED_KIND`.
    pub fn kind(&self) -> &'static str {
        match self {
            Listener::Tcp(_) => "tcp",
            Listener::Unix(_, _) => "unix",
            Listener::Tls(_, _) => "tls",
        }
    }

    /// Unlink the UNIX-domain socket path, if any. A no-op for TCP/TLS.
    /// Must NOT be called on the predecessor side of a restart handover —
    /// the successor reuses the same path (§4.1).
    pub fn unlink_if_unix(&self) {
        if let Listener::Unix(_, path) = self {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(event = "listener.unix_unlink_failed", path = %path.display(), error = %e);
                }
            } else {
                debug!(event = "listener.unix_unlinked", path = %path.display());
            }
        }
    }
}

/// Complete the TLS handshake for a `PendingTls` connection. Handshake
/// failures are not accept errors: the caller logs and moves on (§4.1, §7).
pub async fn complete_tls_handshake(tcp: TcpStream, acceptor: TlsAcceptor) -> io::Result<Stream> {
    let tls_stream = acceptor.accept(tcp).await?;
    Ok(Stream::Tls(Box::new(tls_stream)))
}

/// Clear `FD_CLOEXEC` on `fd` so it survives the `exec` of a restart
/// successor (§4.5.2 step 1, §9 "cross-process file-descriptor handover").
pub fn mark_inheritable(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
        .map_err(|e| ServerError::RestartHandoverFailed(format!("failed to clear FD_CLOEXEC on fd {fd}: {e}")))?;
    Ok(())
}

fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let (certs, key) = load_cert_chain(cert_path, key_path)?;
    let config = build_server_config(certs, key)?;
    Ok(TlsAcceptor::from(config))
}
