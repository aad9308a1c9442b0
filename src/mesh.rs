use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::echo::EchoSuppressor;
use crate::events::NodeEvent;
use crate::history::{HistoryEntry, HistoryStore};
use crate::identity::Identity;
use crate::net;
use crate::pairing::AutoTrustGate;
use crate::session::{
    establish_inbound, establish_outbound, Established, SessionCommand, SessionEvent,
};
use crate::trust::TrustStore;

/// Default clipboard poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub(crate) type NearbyMap = Arc<Mutex<HashMap<String, (String, SocketAddr)>>>;

struct BackoffEntry {
    delay: Duration,
    next_at: tokio::time::Instant,
}

/// The clipboard mesh: owns the poll loop, the table of live sessions and
/// the reconnect machinery. Sessions hold a command channel back into their
/// task; the mesh holds the only strong references.
pub(crate) struct Mesh {
    identity: Identity,
    device_name: String,
    trust: Arc<TrustStore>,
    history: Arc<HistoryStore>,
    echo: Arc<EchoSuppressor>,
    qr_gate: Arc<AutoTrustGate>,
    clipboard: Option<Arc<dyn crate::events::ClipboardCapability>>,
    nearby: NearbyMap,
    connected: Mutex<HashMap<String, mpsc::Sender<SessionCommand>>>,
    connecting: Mutex<HashSet<String>>,
    backoff: Mutex<HashMap<SocketAddr, BackoffEntry>>,
    session_tx: mpsc::Sender<SessionEvent>,
    events: mpsc::Sender<NodeEvent>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Mesh {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        identity: Identity,
        device_name: String,
        trust: Arc<TrustStore>,
        history: Arc<HistoryStore>,
        echo: Arc<EchoSuppressor>,
        qr_gate: Arc<AutoTrustGate>,
        clipboard: Option<Arc<dyn crate::events::ClipboardCapability>>,
        nearby: NearbyMap,
        events: mpsc::Sender<NodeEvent>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (session_tx, session_rx) = mpsc::channel(64);
        let mesh = Arc::new(Self {
            identity,
            device_name,
            trust,
            history,
            echo,
            qr_gate,
            clipboard,
            nearby,
            connected: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            backoff: Mutex::new(HashMap::new()),
            session_tx,
            events,
            tracker: TaskTracker::new(),
            cancel,
        });

        mesh.tracker.spawn(Arc::clone(&mesh).pump(session_rx));
        if mesh.clipboard.is_some() {
            mesh.tracker.spawn(Arc::clone(&mesh).poll_loop(poll_interval));
        }
        mesh
    }

    /// Hands an accepted connection to a tracked server-role session task.
    pub fn track_inbound(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mesh = Arc::clone(self);
        self.tracker.spawn(async move {
            mesh.handle_inbound(stream, addr).await;
        });
    }

    /// Server role for one accepted connection.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        debug!(%addr, "inbound connection");
        let establish = establish_inbound(
            stream,
            &self.identity,
            &self.trust,
            Some(&self.qr_gate),
            &self.device_name,
        );
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return,
            outcome = establish => outcome,
        };
        match outcome {
            Ok(established) => self.adopt(established).await,
            Err(e) => {
                warn!(%addr, error = %e, "inbound session failed");
                let _ = self
                    .events
                    .send(NodeEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Registers an established session and spawns its task. A second
    /// session to an already-connected peer is dropped (first one wins,
    /// closing the new stream).
    pub async fn adopt(self: &Arc<Self>, established: Established<TcpStream>) {
        let peer_id = established.peer_id.clone();
        let peer_name = established.peer_name.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        {
            let mut connected = self.lock_connected();
            if connected.contains_key(&peer_id) {
                debug!(peer = %peer_id, "duplicate session, dropping");
                return;
            }
            connected.insert(peer_id.clone(), cmd_tx);
        }

        info!(peer = %peer_id, name = %peer_name, "session established");
        let _ = self
            .events
            .send(NodeEvent::PeerConnected {
                peer_id: peer_id.clone(),
            })
            .await;

        let session_tx = self.session_tx.clone();
        let cancel = self.cancel.child_token();
        let events = self.events.clone();
        let connected_peer = peer_id;
        let mesh = Arc::clone(self);
        // a panicking session task must not take the node down; it surfaces
        // through on_error and frees its table slot
        self.tracker.spawn(async move {
            let task = tokio::spawn(established.run(cmd_rx, session_tx, cancel));
            if let Err(e) = task.await {
                if e.is_panic() {
                    mesh.lock_connected().remove(&connected_peer);
                    let _ = events
                        .send(NodeEvent::Error {
                            message: format!("session task for {connected_peer} panicked"),
                        })
                        .await;
                }
            }
        });
    }

    /// Queues a CLIP_TEXT to every live session, best effort. Trusted peers
    /// that are nearby but not yet connected get a dial kicked off so the
    /// next change reaches them.
    pub async fn broadcast(self: &Arc<Self>, text: &str) {
        let nearby: Vec<String> = self.lock_nearby().keys().cloned().collect();
        for peer_id in nearby {
            if self.trust.is_trusted(&peer_id) && !self.is_connected(&peer_id) {
                self.spawn_maintain(peer_id);
            }
        }

        let targets: Vec<(String, mpsc::Sender<SessionCommand>)> = self
            .lock_connected()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        debug!(peers = targets.len(), "fanning out clipboard change");
        for (peer_id, tx) in targets {
            if tx
                .send(SessionCommand::SendText(text.to_string()))
                .await
                .is_err()
            {
                warn!(peer = %peer_id, "failed to queue clipboard text");
            }
        }
    }

    /// Explicit local-origin push (the embedder saw its clipboard change).
    /// Marks the text so the poll loop does not send it a second time.
    pub async fn send_local_text(self: &Arc<Self>, text: &str) {
        self.echo.note_remote_write(text);
        self.history.record(HistoryEntry::new(
            text.to_string(),
            self.device_name.clone(),
        ));
        self.broadcast(text).await;
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.lock_connected().contains_key(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.lock_connected().keys().cloned().collect()
    }

    /// A peer appeared on the LAN; connect if we trust it.
    pub fn notify_discovered(self: &Arc<Self>, peer_id: &str) {
        if self.trust.is_trusted(peer_id) && !self.is_connected(peer_id) {
            self.spawn_maintain(peer_id.to_string());
        }
    }

    fn spawn_maintain(self: &Arc<Self>, peer_id: String) {
        {
            let mut connecting = self.lock_connecting();
            if !connecting.insert(peer_id.clone()) {
                return;
            }
        }
        let mesh = Arc::clone(self);
        self.tracker.spawn(async move {
            mesh.maintain(peer_id).await;
        });
    }

    /// Dial loop for one peer: keeps attempting until connected, the peer
    /// disappears, trust is revoked or the mesh stops. Failures to one
    /// address back off exponentially (1 s doubling to 30 s); a successful
    /// handshake resets the address.
    async fn maintain(self: Arc<Self>, peer_id: String) {
        loop {
            if self.cancel.is_cancelled()
                || !self.trust.is_trusted(&peer_id)
                || self.is_connected(&peer_id)
            {
                break;
            }
            let Some((_, addr)) = self.lock_nearby().get(&peer_id).cloned() else {
                break;
            };

            let wait = {
                let backoff = self.lock_backoff();
                backoff
                    .get(&addr)
                    .map(|b| b.next_at.saturating_duration_since(tokio::time::Instant::now()))
                    .filter(|w| !w.is_zero())
            };
            if let Some(wait) = wait {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            debug!(peer = %peer_id, %addr, "dialing");
            let attempt = async {
                let stream = net::dial(addr).await?;
                establish_outbound(
                    stream,
                    &self.identity,
                    &self.trust,
                    Some(&peer_id),
                    &self.device_name,
                )
                .await
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = attempt => result,
            };

            match result {
                Ok(established) => {
                    self.lock_backoff().remove(&addr);
                    self.adopt(established).await;
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer_id, %addr, error = %e, "connect failed");
                    let mut backoff = self.lock_backoff();
                    let entry = backoff.entry(addr).or_insert(BackoffEntry {
                        delay: BACKOFF_START,
                        next_at: tokio::time::Instant::now(),
                    });
                    entry.next_at = tokio::time::Instant::now() + entry.delay;
                    entry.delay = (entry.delay * 2).min(BACKOFF_CAP);
                }
            }
        }
        self.lock_connecting().remove(&peer_id);
    }

    /// Drains session events: applies inbound text (suppress, write, record,
    /// report) and keeps the connected table honest.
    async fn pump(self: Arc<Self>, mut session_rx: mpsc::Receiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = session_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SessionEvent::RemoteText {
                    peer_id,
                    peer_name,
                    text,
                } => {
                    self.echo.note_remote_write(&text);
                    if let Some(clipboard) = &self.clipboard {
                        if let Err(e) = clipboard.write_text(&text) {
                            warn!(error = %e, "clipboard write failed");
                        }
                    }
                    self.history
                        .record(HistoryEntry::new(text.clone(), peer_name));
                    let _ = self
                        .events
                        .send(NodeEvent::ClipboardText {
                            peer_id,
                            text,
                            ts_ms: crate::now_ms(),
                        })
                        .await;
                }
                SessionEvent::Closed { peer_id, reason } => {
                    self.lock_connected().remove(&peer_id);
                    if let Some(message) = reason {
                        let _ = self
                            .events
                            .send(NodeEvent::Error {
                                message: format!("session with {peer_id}: {message}"),
                            })
                            .await;
                    }
                    let _ = self
                        .events
                        .send(NodeEvent::PeerDisconnected {
                            peer_id: peer_id.clone(),
                        })
                        .await;

                    // reconnect while the peer is still around and trusted
                    if !self.cancel.is_cancelled()
                        && self.lock_nearby().contains_key(&peer_id)
                        && self.trust.is_trusted(&peer_id)
                    {
                        self.spawn_maintain(peer_id);
                    }
                }
            }
        }
    }

    /// Single dedicated task watching the local clipboard.
    async fn poll_loop(self: Arc<Self>, interval: Duration) {
        let Some(clipboard) = self.clipboard.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = String::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let text = match clipboard.read_text() {
                Ok(Some(text)) if !text.is_empty() => text,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "clipboard read failed");
                    continue;
                }
            };
            if text == last {
                continue;
            }
            last = text.clone();

            if self.echo.should_ignore_local(&text) {
                debug!("suppressing echo of remote write");
                continue;
            }

            self.history.record(HistoryEntry::new(
                text.clone(),
                self.device_name.clone(),
            ));
            self.broadcast(&text).await;
        }
    }

    /// Drains the mesh: all session, pump and poll tasks have exited when
    /// this returns.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn lock_connected(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<SessionCommand>>> {
        self.connected.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_connecting(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.connecting.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_backoff(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, BackoffEntry>> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_nearby(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, (String, SocketAddr)>> {
        self.nearby.lock().unwrap_or_else(|e| e.into_inner())
    }
}
