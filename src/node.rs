use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{Discovery, DiscoveryEvent};
use crate::echo::EchoSuppressor;
use crate::error::{NodeError, Result};
use crate::events::{ClipboardCapability, DiscoverySink, EventHub, EventSink, NodeEvent};
use crate::history::{HistoryEntry, HistoryStore};
use crate::identity::Identity;
use crate::mesh::{Mesh, NearbyMap, DEFAULT_POLL_INTERVAL};
use crate::net::{self, Listener, DEFAULT_PORT};
use crate::pairing::{AutoTrustGate, PairingPayload};
use crate::session::establish_outbound;
use crate::trust::{TrustRecord, TrustStore};

/// A peer currently visible on the LAN. Purely ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearbyPeer {
    pub peer_id: String,
    pub display_name: String,
    pub addr: SocketAddr,
    pub is_trusted: bool,
}

#[derive(Default)]
struct RunningState {
    cancel: Option<CancellationToken>,
    listener: Option<Listener>,
    mesh: Option<Arc<Mesh>>,
    discovery: Option<Discovery>,
    discovery_pump: Option<JoinHandle<()>>,
    port: Option<u16>,
}

/// The embeddable node: identity, trust, sessions, discovery, mesh and
/// history behind one object. Platform clients construct one `Node`, hand
/// it their clipboard capability and event sink, and call `start_mesh`.
pub struct Node {
    identity: Identity,
    trust: Arc<TrustStore>,
    history: Arc<HistoryStore>,
    echo: Arc<EchoSuppressor>,
    qr_gate: Arc<AutoTrustGate>,
    hub: EventHub,
    nearby: NearbyMap,
    clipboard: Mutex<Option<Arc<dyn ClipboardCapability>>>,
    device_name: Mutex<String>,
    state: tokio::sync::Mutex<RunningState>,
}

impl Node {
    /// Loads (or lazily creates) the identity and opens the trust store.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(id_path: P, trust_path: Q) -> Result<Self> {
        let identity = Identity::load_or_generate(id_path)?;
        let trust = Arc::new(TrustStore::open(trust_path.as_ref().to_path_buf())?);
        let device_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "openclipboard".to_string());

        info!(peer = %identity.peer_id(), "node ready");
        Ok(Self {
            identity,
            trust,
            history: Arc::new(HistoryStore::new()),
            echo: Arc::new(EchoSuppressor::default()),
            qr_gate: Arc::new(AutoTrustGate::new()),
            hub: EventHub::new(),
            nearby: Arc::new(Mutex::new(Default::default())),
            clipboard: Mutex::new(None),
            device_name: Mutex::new(device_name),
            state: tokio::sync::Mutex::new(RunningState::default()),
        })
    }

    pub fn peer_id(&self) -> String {
        self.identity.peer_id()
    }

    pub fn public_key_b64(&self) -> String {
        self.identity.public_key_b64()
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    pub fn trusted_peers(&self) -> Vec<TrustRecord> {
        self.trust.list()
    }

    /// Starts the accept loop only: inbound sessions deliver clipboard text
    /// to the sink but nothing polls or dials. `start_mesh` supersedes this.
    pub async fn start_listener(&self, port: u16, sink: Arc<dyn EventSink>) -> Result<()> {
        self.hub.set_event_sink(sink);
        self.hub.ensure_dispatch();

        let mut state = self.state.lock().await;
        if state.listener.is_some() {
            debug!("listener already running");
            return Ok(());
        }

        let socket = match net::bind(port).await {
            Ok(socket) => socket,
            Err(e) => {
                self.hub.try_emit(NodeEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let cancel = state
            .cancel
            .get_or_insert_with(CancellationToken::new)
            .clone();
        let mesh = state.mesh.get_or_insert_with(|| {
            Mesh::start(
                self.identity.clone(),
                self.lock_device_name().clone(),
                Arc::clone(&self.trust),
                Arc::clone(&self.history),
                Arc::clone(&self.echo),
                Arc::clone(&self.qr_gate),
                None,
                Arc::clone(&self.nearby),
                self.hub.sender(),
                DEFAULT_POLL_INTERVAL,
                cancel.clone(),
            )
        });

        let listener = net::spawn_accept(socket, Arc::clone(mesh), cancel)?;
        state.port = Some(listener.port());
        state.listener = Some(listener);
        Ok(())
    }

    /// Advertises and scans `_openclipboard._tcp`. Idempotent: calling it
    /// again tears the advertisement down and re-registers, which is the
    /// supported reaction to a network change.
    pub async fn start_discovery(
        &self,
        device_name: &str,
        sink: Arc<dyn DiscoverySink>,
    ) -> Result<()> {
        self.hub.set_discovery_sink(sink);
        self.hub.ensure_dispatch();
        *self.lock_device_name() = device_name.to_string();

        let mut state = self.state.lock().await;
        self.restart_discovery(&mut state, device_name)
    }

    /// Starts listener, discovery and the clipboard mesh in one call.
    pub async fn start_mesh(
        &self,
        port: u16,
        device_name: &str,
        sink: Arc<dyn EventSink>,
        clipboard: Arc<dyn ClipboardCapability>,
        poll_interval: Duration,
    ) -> Result<()> {
        self.hub.set_event_sink(sink);
        self.hub.ensure_dispatch();
        *self.lock_device_name() = device_name.to_string();
        *self.lock_clipboard() = Some(Arc::clone(&clipboard));

        let mut state = self.state.lock().await;
        if state.mesh.is_some() {
            debug!("mesh already running");
            return Ok(());
        }

        let socket = match net::bind(port).await {
            Ok(socket) => socket,
            Err(e) => {
                self.hub.try_emit(NodeEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let cancel = state
            .cancel
            .get_or_insert_with(CancellationToken::new)
            .clone();
        let mesh = Mesh::start(
            self.identity.clone(),
            device_name.to_string(),
            Arc::clone(&self.trust),
            Arc::clone(&self.history),
            Arc::clone(&self.echo),
            Arc::clone(&self.qr_gate),
            Some(clipboard),
            Arc::clone(&self.nearby),
            self.hub.sender(),
            poll_interval,
            cancel.clone(),
        );

        let listener = net::spawn_accept(socket, Arc::clone(&mesh), cancel)?;
        state.port = Some(listener.port());
        state.listener = Some(listener);
        state.mesh = Some(mesh);

        // a dead discovery backend leaves the mesh reachable by address, so
        // it is reported rather than fatal
        if let Err(e) = self.restart_discovery(&mut state, device_name) {
            warn!(error = %e, "discovery unavailable");
            self.hub.try_emit(NodeEvent::Error {
                message: e.to_string(),
            });
        }
        Ok(())
    }

    /// One-shot: dial an address, handshake, deliver a single text, close.
    /// The peer behind the address must already be trusted.
    pub async fn connect_and_send_text(&self, addr: &str, text: &str) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| NodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let cancel = {
            let state = self.state.lock().await;
            state.cancel.clone()
        };
        let device_name = self.lock_device_name().clone();

        let deliver = async {
            let stream = net::dial(addr).await?;
            let established =
                establish_outbound(stream, &self.identity, &self.trust, None, &device_name)
                    .await?;
            established.send_text_once(text).await
        };

        match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(NodeError::Cancelled),
                result = deliver => result,
            },
            None => deliver.await,
        }
    }

    /// Broadcasts to every connected trusted peer, best effort. Also
    /// records to history and marks the text so the poll loop does not
    /// send it again.
    pub async fn send_clipboard_text(&self, text: &str) {
        let mesh = self.state.lock().await.mesh.clone();
        match mesh {
            Some(mesh) => mesh.send_local_text(text).await,
            None => warn!("send_clipboard_text with no running mesh"),
        }
    }

    /// Arms the one-shot auto-trust window for QR pairing.
    pub fn enable_qr_pairing_listener(&self) {
        self.qr_gate.arm();
    }

    /// Arms the window and disarms it automatically after `window`.
    pub fn enable_qr_pairing_listener_for(&self, window: Duration) {
        self.qr_gate.arm_for(window);
    }

    pub fn disable_qr_pairing_listener(&self) {
        self.qr_gate.disarm();
    }

    /// Builds this node's pairing payload for display as a QR code.
    pub fn create_pairing_payload(&self, lan_addrs: Vec<String>) -> PairingPayload {
        let name = self.lock_device_name().clone();
        let port = self
            .state
            .try_lock()
            .ok()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_PORT);
        crate::pairing::create_init(&self.identity, &name, port, lan_addrs)
    }

    /// Scanning side of QR pairing: parse, trust the responder, then dial
    /// its advertised addresses. The responder (with its listener armed)
    /// completes symmetric trust during the handshake. Returns the
    /// responder's PeerId.
    pub async fn pair_via_qr(&self, qr: &str) -> Result<String> {
        let payload = PairingPayload::from_qr_string(qr)?;
        self.trust.add(
            &payload.peer_id,
            &payload.identity_pk_b64(),
            &payload.display_name,
        )?;
        info!(peer = %payload.peer_id, name = %payload.display_name, "trusted via pairing payload");

        let device_name = self.lock_device_name().clone();
        let mesh = self.state.lock().await.mesh.clone();

        let mut last_err = NodeError::MalformedPairing("payload advertises no addresses".into());
        for candidate in payload_addrs(&payload) {
            let attempt = async {
                let stream = net::dial(candidate).await?;
                establish_outbound(
                    stream,
                    &self.identity,
                    &self.trust,
                    Some(&payload.peer_id),
                    &device_name,
                )
                .await
            };
            match attempt.await {
                Ok(established) => {
                    match &mesh {
                        Some(mesh) => mesh.adopt(established).await,
                        // handshake already sealed mutual trust; nothing to keep
                        None => drop(established),
                    }
                    return Ok(payload.peer_id);
                }
                Err(e) => {
                    debug!(addr = %candidate, error = %e, "pairing dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub fn get_clipboard_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.list(limit)
    }

    pub fn get_clipboard_history_for_peer(
        &self,
        source_name: &str,
        limit: usize,
    ) -> Vec<HistoryEntry> {
        self.history.list_for_peer(source_name, limit)
    }

    pub fn search_clipboard_history(
        &self,
        source_name: &str,
        substring: &str,
        limit: usize,
    ) -> Vec<HistoryEntry> {
        self.history.search(source_name, substring, limit)
    }

    pub fn set_history_limit(&self, limit: usize) {
        self.history.set_limit(limit);
    }

    /// Writes a past entry back to the local clipboard. Marks the text in
    /// the echo suppressor first so the poll loop does not rebroadcast it.
    pub fn recall_from_history(&self, entry_id: Uuid) -> Result<()> {
        let entry = self.history.find(entry_id).ok_or(NodeError::NotFound)?;
        self.echo.note_remote_write(&entry.content);
        let clipboard = self.lock_clipboard().clone();
        match clipboard {
            Some(clipboard) => {
                if let Err(e) = clipboard.write_text(&entry.content) {
                    warn!(error = %e, "clipboard write failed during recall");
                }
                Ok(())
            }
            None => Err(NodeError::Io(std::io::Error::other(
                "no clipboard capability installed",
            ))),
        }
    }

    pub fn nearby_peers(&self) -> Vec<NearbyPeer> {
        let mut peers: Vec<NearbyPeer> = self
            .nearby
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(peer_id, (name, addr))| NearbyPeer {
                peer_id: peer_id.clone(),
                display_name: name.clone(),
                addr: *addr,
                is_trusted: self.trust.is_trusted(peer_id),
            })
            .collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        peers
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        match &self.state.lock().await.mesh {
            Some(mesh) => mesh.connected_peers(),
            None => Vec::new(),
        }
    }

    /// Stops everything: accept loop first (socket provably released), then
    /// discovery, then every session and mesh task. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(cancel) = state.cancel.take() else {
            return;
        };
        cancel.cancel();

        if let Some(listener) = state.listener.take() {
            listener.join().await;
        }
        if let Some(discovery) = state.discovery.take() {
            discovery.shutdown();
        }
        if let Some(pump) = state.discovery_pump.take() {
            let _ = pump.await;
        }
        if let Some(mesh) = state.mesh.take() {
            mesh.drain().await;
        }
        state.port = None;
        info!("node stopped");
    }

    fn restart_discovery(&self, state: &mut RunningState, device_name: &str) -> Result<()> {
        if let Some(old) = state.discovery.take() {
            old.shutdown();
        }
        if let Some(pump) = state.discovery_pump.take() {
            pump.abort();
        }

        let cancel = state
            .cancel
            .get_or_insert_with(CancellationToken::new)
            .clone();
        let port = state.port.unwrap_or(DEFAULT_PORT);
        let (tx, rx) = mpsc::channel(32);
        let discovery =
            Discovery::start(&self.peer_id(), device_name, port, tx, cancel.clone())?;

        let hub_tx = self.hub.sender();
        let nearby = Arc::clone(&self.nearby);
        let mesh = state.mesh.clone();
        state.discovery_pump = Some(tokio::spawn(pump_discovery(rx, hub_tx, nearby, mesh)));
        state.discovery = Some(discovery);
        Ok(())
    }

    fn lock_device_name(&self) -> std::sync::MutexGuard<'_, String> {
        self.device_name.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_clipboard(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<Arc<dyn ClipboardCapability>>> {
        self.clipboard.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn pump_discovery(
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    hub_tx: mpsc::Sender<NodeEvent>,
    nearby: NearbyMap,
    mesh: Option<Arc<Mesh>>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            DiscoveryEvent::Found {
                peer_id,
                name,
                addr,
            } => {
                nearby
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(peer_id.clone(), (name.clone(), addr));
                let _ = hub_tx
                    .send(NodeEvent::PeerDiscovered {
                        peer_id: peer_id.clone(),
                        name,
                        addr,
                    })
                    .await;
                if let Some(mesh) = &mesh {
                    mesh.notify_discovered(&peer_id);
                }
            }
            DiscoveryEvent::Lost { peer_id } => {
                nearby
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&peer_id);
                let _ = hub_tx.send(NodeEvent::PeerLost { peer_id }).await;
            }
        }
    }
}

/// Dial candidates from a pairing payload: entries may be full socket
/// addresses or bare IPs that take the advertised port.
fn payload_addrs(payload: &PairingPayload) -> Vec<SocketAddr> {
    payload
        .lan_addrs
        .iter()
        .filter_map(|raw| {
            raw.parse::<SocketAddr>().ok().or_else(|| {
                raw.parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, payload.lan_port))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_addrs_accept_socket_addrs_and_bare_ips() {
        let payload = PairingPayload::new(
            "pid".into(),
            "name".into(),
            [0u8; 32],
            18455,
            [0u8; 32],
            vec![
                "192.168.1.5:29000".into(),
                "10.0.0.7".into(),
                "garbage".into(),
            ],
        );
        let addrs = payload_addrs(&payload);
        assert_eq!(
            addrs,
            vec![
                "192.168.1.5:29000".parse::<SocketAddr>().unwrap(),
                "10.0.0.7:18455".parse::<SocketAddr>().unwrap(),
            ]
        );
    }
}
