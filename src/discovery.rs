use std::net::SocketAddr;

use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};

pub const SERVICE_TYPE: &str = "_openclipboard._tcp.local.";
const INSTANCE_PREFIX: &str = "openclipboard-";

/// Appearance or disappearance of another node on the LAN.
#[derive(Debug, Clone)]
pub(crate) enum DiscoveryEvent {
    Found {
        peer_id: String,
        name: String,
        addr: SocketAddr,
    },
    Lost {
        peer_id: String,
    },
}

/// Advertises this node under `_openclipboard._tcp` and browses for other
/// instances. Observations of our own PeerId are suppressed.
pub(crate) struct Discovery {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Discovery {
    /// Registers the advertisement and spawns the browse task. Dropping the
    /// returned handle does not stop anything; call [`Discovery::shutdown`].
    pub fn start(
        peer_id: &str,
        device_name: &str,
        port: u16,
        tx: mpsc::Sender<DiscoveryEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(mdns_err)?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "openclipboard".to_string());

        let instance = format!("{INSTANCE_PREFIX}{peer_id}");
        let port_str = port.to_string();
        let properties = [
            ("peer_id", peer_id),
            ("name", device_name),
            ("port", port_str.as_str()),
        ];
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{}.local.", host.replace(' ', "-")),
            (),
            port,
            &properties[..],
        )
        .map_err(mdns_err)?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        daemon.register(service).map_err(mdns_err)?;
        info!(name = %device_name, %port, "registered mDNS service");

        let receiver = daemon.browse(SERVICE_TYPE).map_err(mdns_err)?;
        let own_id = peer_id.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv_async() => match event {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("mdns browse ended: {e}");
                            break;
                        }
                    },
                };

                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(found) = parse_resolved(&info) else {
                            continue;
                        };
                        if found.0 == own_id {
                            debug!("ignoring self-advertisement");
                            continue;
                        }
                        let (peer_id, name, addr) = found;
                        debug!(peer = %peer_id, %name, %addr, "discovered peer");
                        if tx
                            .send(DiscoveryEvent::Found { peer_id, name, addr })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let Some(peer_id) = peer_id_from_fullname(&fullname) else {
                            continue;
                        };
                        if peer_id == own_id {
                            continue;
                        }
                        debug!(peer = %peer_id, "peer left");
                        if tx.send(DiscoveryEvent::Lost { peer_id }).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(Self { daemon, fullname })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!("mdns unregister: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mdns shutdown: {e}");
        }
    }
}

fn parse_resolved(info: &ResolvedService) -> Option<(String, String, SocketAddr)> {
    let properties = info.get_properties();
    let peer_id = properties.get("peer_id")?.val_str().to_string();
    let name = properties
        .get("name")
        .map(|p| p.val_str())
        .unwrap_or("unknown")
        .to_string();
    let port = properties
        .get("port")
        .and_then(|p| p.val_str().parse::<u16>().ok())
        .unwrap_or_else(|| info.get_port());

    let addr = info
        .get_addresses()
        .iter()
        .next()
        .map(|ip| SocketAddr::new(ip.to_ip_addr(), port))?;

    Some((peer_id, name, addr))
}

fn peer_id_from_fullname(fullname: &str) -> Option<String> {
    fullname
        .split('.')
        .next()?
        .strip_prefix(INSTANCE_PREFIX)
        .map(str::to_string)
}

fn mdns_err(e: mdns_sd::Error) -> NodeError {
    NodeError::Io(std::io::Error::other(e))
}
