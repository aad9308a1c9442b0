use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

pub type CapabilityError = Box<dyn std::error::Error + Send + Sync>;

/// Platform clipboard access, injected by the embedder. Both operations
/// must be quick; failures are logged and swallowed by the core.
pub trait ClipboardCapability: Send + Sync {
    /// Current clipboard text, `None` when empty or non-text.
    fn read_text(&self) -> Result<Option<String>, CapabilityError>;

    fn write_text(&self, text: &str) -> Result<(), CapabilityError>;
}

/// Callbacks the embedder receives from a running node. Invocations are
/// serialised through one channel; the order observed is the order the
/// core emitted.
pub trait EventSink: Send + Sync {
    fn on_clipboard_text(&self, peer_id: &str, text: &str, ts_ms: u64);

    /// Reserved for small-blob delivery; never fired in v0.
    fn on_file_received(&self, _peer_id: &str, _name: &str, _data_path: &Path) {}

    fn on_peer_connected(&self, peer_id: &str);

    fn on_peer_disconnected(&self, peer_id: &str);

    fn on_error(&self, message: &str);
}

/// Callbacks for LAN discovery observations.
pub trait DiscoverySink: Send + Sync {
    fn on_peer_discovered(&self, peer_id: &str, name: &str, addr: SocketAddr);

    fn on_peer_lost(&self, peer_id: &str);
}

/// Internal event record; everything an embedder hears goes through this.
#[derive(Debug, Clone)]
pub(crate) enum NodeEvent {
    ClipboardText {
        peer_id: String,
        text: String,
        ts_ms: u64,
    },
    PeerConnected {
        peer_id: String,
    },
    PeerDisconnected {
        peer_id: String,
    },
    Error {
        message: String,
    },
    PeerDiscovered {
        peer_id: String,
        name: String,
        addr: SocketAddr,
    },
    PeerLost {
        peer_id: String,
    },
}

#[derive(Default)]
struct SinkSet {
    events: Option<Arc<dyn EventSink>>,
    discovery: Option<Arc<dyn DiscoverySink>>,
}

/// Funnel for all embedder callbacks: tasks send [`NodeEvent`]s into one
/// bounded channel; a single dispatch task drains it, giving FIFO delivery
/// regardless of which task produced the event.
pub(crate) struct EventHub {
    tx: mpsc::Sender<NodeEvent>,
    rx: Mutex<Option<mpsc::Receiver<NodeEvent>>>,
    sinks: Arc<Mutex<SinkSet>>,
    dispatching: AtomicBool,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            sinks: Arc::new(Mutex::new(SinkSet::default())),
            dispatching: AtomicBool::new(false),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<NodeEvent> {
        self.tx.clone()
    }

    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.lock_sinks().events = Some(sink);
    }

    pub fn set_discovery_sink(&self, sink: Arc<dyn DiscoverySink>) {
        self.lock_sinks().discovery = Some(sink);
    }

    /// Spawns the dispatch task on first call; later calls are no-ops.
    /// Must run inside a tokio runtime.
    pub fn ensure_dispatch(&self) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let sinks = Arc::clone(&self.sinks);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let (events, discovery) = {
                    let set = sinks.lock().unwrap_or_else(|e| e.into_inner());
                    (set.events.clone(), set.discovery.clone())
                };
                dispatch(event, events.as_deref(), discovery.as_deref());
            }
        });
    }

    /// Best-effort emit from non-async contexts.
    pub fn try_emit(&self, event: NodeEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("event channel full, dropping event");
        }
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, SinkSet> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn dispatch(event: NodeEvent, events: Option<&dyn EventSink>, discovery: Option<&dyn DiscoverySink>) {
    match event {
        NodeEvent::ClipboardText {
            peer_id,
            text,
            ts_ms,
        } => {
            if let Some(sink) = events {
                sink.on_clipboard_text(&peer_id, &text, ts_ms);
            }
        }
        NodeEvent::PeerConnected { peer_id } => {
            if let Some(sink) = events {
                sink.on_peer_connected(&peer_id);
            }
        }
        NodeEvent::PeerDisconnected { peer_id } => {
            if let Some(sink) = events {
                sink.on_peer_disconnected(&peer_id);
            }
        }
        NodeEvent::Error { message } => {
            if let Some(sink) = events {
                sink.on_error(&message);
            }
        }
        NodeEvent::PeerDiscovered {
            peer_id,
            name,
            addr,
        } => {
            if let Some(sink) = discovery {
                sink.on_peer_discovered(&peer_id, &name, addr);
            }
        }
        NodeEvent::PeerLost { peer_id } => {
            if let Some(sink) = discovery {
                sink.on_peer_lost(&peer_id);
            }
        }
    }
}
