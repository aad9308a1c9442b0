use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{NodeError, Result};
use crate::mesh::Mesh;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 18455;

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a TCP connection with the dial deadline applied.
pub(crate) async fn dial(addr: SocketAddr) -> Result<TcpStream> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| NodeError::Timeout("dial"))??;
    Ok(stream)
}

/// Binds `0.0.0.0:port`. A bind collision maps to `AddressInUse` so the
/// embedder can report it and pick another port rather than crash.
pub(crate) async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            NodeError::AddressInUse(port)
        } else {
            NodeError::Io(e)
        }
    })
}

/// Handle on a running accept loop. The listening socket is owned by the
/// loop task and is provably released once [`Listener::join`] returns.
pub(crate) struct Listener {
    port: u16,
    handle: JoinHandle<()>,
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Awaits the accept loop after cancellation; the socket is closed when
    /// this returns.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawns the accept loop; every accepted connection becomes a server-role
/// session task tracked by the mesh.
pub(crate) fn spawn_accept(
    listener: TcpListener,
    mesh: Arc<Mesh>,
    cancel: CancellationToken,
) -> Result<Listener> {
    let port = listener.local_addr()?.port();
    info!(%port, "listening for connections");

    let handle = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted connection");
                    mesh.track_inbound(stream, addr);
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
        // listener drops here, releasing the socket
    });

    Ok(Listener { port, handle })
}
