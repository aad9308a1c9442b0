//! Two-node scenarios over real loopback sockets, with on-disk state in
//! temp dirs, a channel-backed event sink and an in-memory clipboard.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use openclipboard_node::{ClipboardCapability, EventSink, Node, NodeError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Text { peer_id: String, text: String },
    Connected(String),
    Disconnected(String),
    Error(String),
}

struct ChannelSink(mpsc::UnboundedSender<Event>);

impl EventSink for ChannelSink {
    fn on_clipboard_text(&self, peer_id: &str, text: &str, _ts_ms: u64) {
        let _ = self.0.send(Event::Text {
            peer_id: peer_id.to_string(),
            text: text.to_string(),
        });
    }

    fn on_peer_connected(&self, peer_id: &str) {
        let _ = self.0.send(Event::Connected(peer_id.to_string()));
    }

    fn on_peer_disconnected(&self, peer_id: &str) {
        let _ = self.0.send(Event::Disconnected(peer_id.to_string()));
    }

    fn on_error(&self, message: &str) {
        let _ = self.0.send(Event::Error(message.to_string()));
    }
}

#[derive(Default)]
struct MemClipboard(Mutex<Option<String>>);

impl MemClipboard {
    fn set(&self, text: &str) {
        *self.0.lock().unwrap() = Some(text.to_string());
    }

    fn get(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

impl ClipboardCapability for MemClipboard {
    fn read_text(&self) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.lock().unwrap().clone())
    }

    fn write_text(&self, text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        *self.0.lock().unwrap() = Some(text.to_string());
        Ok(())
    }
}

fn node_in(dir: &Path) -> Node {
    Node::new(dir.join("identity.json"), dir.join("trust.json")).unwrap()
}

fn trust_mutually(a: &Node, b: &Node) {
    a.trust_store()
        .add(&b.peer_id(), &b.public_key_b64(), "b")
        .unwrap();
    b.trust_store()
        .add(&a.peer_id(), &a.public_key_b64(), "a")
        .unwrap();
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within 5s")
        .expect("event channel closed")
}

/// Like [`next_event`] but skips `Error` noise (e.g. discovery being
/// unavailable in a sandboxed test environment).
async fn next_non_error(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    loop {
        match next_event(rx).await {
            Event::Error(_) => continue,
            event => return event,
        }
    }
}

#[tokio::test]
async fn trusted_one_shot_text_reaches_the_listener() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node_in(dir_a.path());
    let b = node_in(dir_b.path());
    trust_mutually(&a, &b);

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.start_listener(29000, Arc::new(ChannelSink(tx)))
        .await
        .unwrap();

    b.connect_and_send_text("127.0.0.1:29000", "hello")
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, Event::Connected(b.peer_id()));
    assert_eq!(
        next_event(&mut rx).await,
        Event::Text {
            peer_id: b.peer_id(),
            text: "hello".to_string(),
        }
    );

    a.stop().await;
}

#[tokio::test]
async fn untrusted_dialer_is_reported_and_delivers_nothing() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node_in(dir_a.path()); // trusts nobody
    let b = node_in(dir_b.path());
    b.trust_store()
        .add(&a.peer_id(), &a.public_key_b64(), "a")
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.start_listener(29010, Arc::new(ChannelSink(tx)))
        .await
        .unwrap();

    let result = b.connect_and_send_text("127.0.0.1:29010", "secret").await;
    assert!(result.is_err());

    match next_event(&mut rx).await {
        Event::Error(message) => assert!(
            message.contains("not trusted"),
            "unexpected error: {message}"
        ),
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(rx.try_recv().is_err(), "no clipboard event may follow");

    a.stop().await;
}

#[tokio::test]
async fn dialing_an_untrusted_responder_fails_locally() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node_in(dir_a.path());
    let b = node_in(dir_b.path()); // b does not trust a, a does not trust b
    a.trust_store()
        .add(&b.peer_id(), &b.public_key_b64(), "b")
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    b.start_listener(29015, Arc::new(ChannelSink(tx)))
        .await
        .unwrap();

    // b rejects the handshake, so a's one-shot errors out
    let err = a
        .connect_and_send_text("127.0.0.1:29015", "anyone there")
        .await
        .unwrap_err();
    assert!(!matches!(err, NodeError::NotFound));

    b.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_releases_the_port() {
    let dir = tempfile::tempdir().unwrap();
    let node = node_in(dir.path());

    let (tx, _rx) = mpsc::unbounded_channel();
    node.start_listener(29020, Arc::new(ChannelSink(tx)))
        .await
        .unwrap();

    node.stop().await;
    node.stop().await;

    // the port is free again: a fresh listener can bind it
    let (tx, _rx) = mpsc::unbounded_channel();
    node.start_listener(29020, Arc::new(ChannelSink(tx)))
        .await
        .unwrap();
    node.stop().await;
}

#[tokio::test]
async fn bind_collision_surfaces_address_in_use() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node_in(dir_a.path());
    let b = node_in(dir_b.path());

    let (tx, _rx_a) = mpsc::unbounded_channel();
    a.start_listener(29025, Arc::new(ChannelSink(tx)))
        .await
        .unwrap();

    let (tx, mut rx_b) = mpsc::unbounded_channel();
    let err = b
        .start_listener(29025, Arc::new(ChannelSink(tx)))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::AddressInUse(29025)));
    match next_event(&mut rx_b).await {
        Event::Error(message) => assert!(message.contains("in use")),
        other => panic!("expected an error event, got {other:?}"),
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn qr_pairing_connects_two_meshes_and_replicates_the_clipboard() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node_in(dir_a.path());
    let b = node_in(dir_b.path());

    let clip_a = Arc::new(MemClipboard::default());
    let clip_b = Arc::new(MemClipboard::default());
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    a.start_mesh(
        29030,
        "Alice",
        Arc::new(ChannelSink(tx_a)),
        Arc::clone(&clip_a) as Arc<dyn ClipboardCapability>,
        Duration::from_millis(50),
    )
    .await
    .unwrap();
    b.start_mesh(
        29031,
        "Bob",
        Arc::new(ChannelSink(tx_b)),
        Arc::clone(&clip_b) as Arc<dyn ClipboardCapability>,
        Duration::from_millis(50),
    )
    .await
    .unwrap();

    // a displays a payload and arms its auto-trust window; b scans it
    a.enable_qr_pairing_listener();
    let payload = a.create_pairing_payload(vec!["127.0.0.1:29030".to_string()]);
    let paired = b.pair_via_qr(&payload.to_qr_string()).await.unwrap();
    assert_eq!(paired, a.peer_id());

    assert_eq!(next_non_error(&mut rx_a).await, Event::Connected(b.peer_id()));
    assert_eq!(next_non_error(&mut rx_b).await, Event::Connected(a.peer_id()));
    assert!(a.trust_store().is_trusted(&b.peer_id()));
    assert!(b.trust_store().is_trusted(&a.peer_id()));

    // a local change on b propagates to a...
    clip_b.set("sync me");
    assert_eq!(
        next_non_error(&mut rx_a).await,
        Event::Text {
            peer_id: b.peer_id(),
            text: "sync me".to_string(),
        }
    );
    assert_eq!(clip_a.get().as_deref(), Some("sync me"));

    // ...and does not reflect back to b
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = rx_b.try_recv() {
        assert!(
            !matches!(event, Event::Text { .. }),
            "remote write must not echo back to its origin"
        );
    }

    // move b's clipboard forward, then recall the old entry: the recall
    // must restore the clipboard without fanning out again
    clip_b.set("second clip");
    assert_eq!(
        next_non_error(&mut rx_a).await,
        Event::Text {
            peer_id: b.peer_id(),
            text: "second clip".to_string(),
        }
    );
    let old = b
        .get_clipboard_history_for_peer("Bob", 10)
        .into_iter()
        .find(|e| e.content == "sync me")
        .expect("local entry recorded");
    b.recall_from_history(old.id).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(clip_b.get().as_deref(), Some("sync me"));
    while let Ok(event) = rx_a.try_recv() {
        assert!(
            !matches!(event, Event::Text { .. }),
            "recall must not broadcast"
        );
    }

    a.stop().await;
    b.stop().await;
}
