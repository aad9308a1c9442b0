use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{NodeError, Result};
use crate::frame::{Frame, HelloPayload, MsgType, HEADER_LEN, MAX_FRAME};
use crate::identity::{peer_id_from_public_key, Identity};
use crate::pairing::AutoTrustGate;
use crate::trust::TrustStore;

pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const PONG_TIMEOUT: Duration = Duration::from_secs(10);

const TAG_LEN: usize = 16;
const ZERO_NONCE: [u8; 12] = [0u8; 12];

type HmacSha256 = Hmac<Sha256>;

/// Commands the mesh pushes into a running session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    SendText(String),
    Shutdown,
}

/// What a session task reports back to the mesh.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    RemoteText {
        peer_id: String,
        peer_name: String,
        text: String,
    },
    Closed {
        peer_id: String,
        reason: Option<String>,
    },
}

/// An authenticated channel after handshake + HELLO. Each direction has its
/// own AEAD key and sequence counter.
#[derive(Debug)]
pub(crate) struct Established<S> {
    pub peer_id: String,
    pub peer_name: String,
    stream: S,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_seq: u64,
    recv_seq: u64,
}

// ---- key schedule -----------------------------------------------------------

fn kdf(label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn seal(key: &[u8; 32], nonce: &[u8; 12], ad: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .ok()
}

fn open(key: &[u8; 32], nonce: &[u8; 12], ad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .ok()
}

fn confirm_tag(key: &[u8; 32], transcript: &[u8; 32], role: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(transcript);
    mac.update(role);
    mac.finalize().into_bytes().into()
}

fn verify_confirm_tag(key: &[u8; 32], transcript: &[u8; 32], role: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(transcript);
    mac.update(role);
    mac.verify_slice(tag).is_ok()
}

struct SessionKeys {
    send_key: [u8; 32],
    recv_key: [u8; 32],
    peer_static: [u8; 32],
}

// ---- handshake --------------------------------------------------------------
//
// Noise-IK-class agreement over x25519 + AES-256-GCM. The dialer's static
// key crosses the wire only encrypted; the responder's static is released
// under the ephemeral-ephemeral key. Each side proves possession of its
// static key through the HMAC confirmation tags (the shared master secret
// mixes in both static DHs).

async fn handshake_dialer<S>(stream: &mut S, identity: &Identity) -> Result<SessionKeys>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let eph = StaticSecret::random();
    let eph_pub = PublicKey::from(&eph);

    stream.write_all(eph_pub.as_bytes()).await?;

    let mut re_bytes = [0u8; 32];
    stream.read_exact(&mut re_bytes).await?;
    let re_pub = PublicKey::from(re_bytes);

    let dh_ee = eph.diffie_hellman(&re_pub);
    let k1 = kdf(b"oc/k1", &[dh_ee.as_bytes()]);
    let th1 = kdf(b"oc/th", &[eph_pub.as_bytes(), &re_bytes]);

    let mut m2 = [0u8; 32 + TAG_LEN];
    stream.read_exact(&mut m2).await?;
    let rs_bytes: [u8; 32] = open(&k1, &ZERO_NONCE, &th1, &m2)
        .ok_or(NodeError::Handshake("responder static key unreadable"))?
        .try_into()
        .map_err(|_| NodeError::Handshake("responder static key malformed"))?;
    let rs_pub = PublicKey::from(rs_bytes);

    let dh_es = eph.diffie_hellman(&rs_pub);
    let th2 = kdf(b"oc/th2", &[&th1, &m2]);
    let k2 = kdf(b"oc/k2", &[dh_ee.as_bytes(), dh_es.as_bytes()]);

    let m3 = seal(&k2, &ZERO_NONCE, &th2, &identity.public_key())
        .ok_or(NodeError::Handshake("seal static key"))?;
    stream.write_all(&m3).await?;

    let dh_se = identity.secret().diffie_hellman(&re_pub);
    let ms = kdf(
        b"oc/ms",
        &[dh_ee.as_bytes(), dh_es.as_bytes(), dh_se.as_bytes()],
    );
    let km = kdf(b"oc/confirm", &[&ms]);
    let th3 = kdf(b"oc/th3", &[&th2, &m3]);

    let tag_d = confirm_tag(&km, &th3, b"dialer");
    stream.write_all(&tag_d).await?;
    stream.flush().await?;

    let mut tag_r = [0u8; 32];
    stream.read_exact(&mut tag_r).await?;
    if !verify_confirm_tag(&km, &th3, b"responder", &tag_r) {
        return Err(NodeError::Handshake("responder key confirmation failed"));
    }

    Ok(SessionKeys {
        send_key: kdf(b"oc/d2r", &[&ms]),
        recv_key: kdf(b"oc/r2d", &[&ms]),
        peer_static: rs_bytes,
    })
}

async fn handshake_responder<S, F>(
    stream: &mut S,
    identity: &Identity,
    authorize: F,
) -> Result<SessionKeys>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&str) -> Result<()>,
{
    let mut e_bytes = [0u8; 32];
    stream.read_exact(&mut e_bytes).await?;
    let e_pub = PublicKey::from(e_bytes);

    let eph = StaticSecret::random();
    let eph_pub = PublicKey::from(&eph);
    stream.write_all(eph_pub.as_bytes()).await?;

    let dh_ee = eph.diffie_hellman(&e_pub);
    let k1 = kdf(b"oc/k1", &[dh_ee.as_bytes()]);
    let th1 = kdf(b"oc/th", &[&e_bytes, eph_pub.as_bytes()]);

    let m2 = seal(&k1, &ZERO_NONCE, &th1, &identity.public_key())
        .ok_or(NodeError::Handshake("seal static key"))?;
    stream.write_all(&m2).await?;
    stream.flush().await?;

    let dh_es = identity.secret().diffie_hellman(&e_pub);
    let th2 = kdf(b"oc/th2", &[&th1, &m2]);
    let k2 = kdf(b"oc/k2", &[dh_ee.as_bytes(), dh_es.as_bytes()]);

    let mut m3 = [0u8; 32 + TAG_LEN];
    stream.read_exact(&mut m3).await?;
    let s_bytes: [u8; 32] = open(&k2, &ZERO_NONCE, &th2, &m3)
        .ok_or(NodeError::Handshake("dialer static key unreadable"))?
        .try_into()
        .map_err(|_| NodeError::Handshake("dialer static key malformed"))?;
    let s_pub = PublicKey::from(s_bytes);

    // trust decision happens before any key confirmation leaves this side
    authorize(&peer_id_from_public_key(&s_bytes))?;

    let dh_se = eph.diffie_hellman(&s_pub);
    let ms = kdf(
        b"oc/ms",
        &[dh_ee.as_bytes(), dh_es.as_bytes(), dh_se.as_bytes()],
    );
    let km = kdf(b"oc/confirm", &[&ms]);
    let th3 = kdf(b"oc/th3", &[&th2, &m3]);

    let mut tag_d = [0u8; 32];
    stream.read_exact(&mut tag_d).await?;
    if !verify_confirm_tag(&km, &th3, b"dialer", &tag_d) {
        return Err(NodeError::Handshake("dialer key confirmation failed"));
    }

    let tag_r = confirm_tag(&km, &th3, b"responder");
    stream.write_all(&tag_r).await?;
    stream.flush().await?;

    Ok(SessionKeys {
        send_key: kdf(b"oc/r2d", &[&ms]),
        recv_key: kdf(b"oc/d2r", &[&ms]),
        peer_static: s_bytes,
    })
}

// ---- record layer -----------------------------------------------------------
//
// Post-handshake wire record: seq(8 BE) | len(4 BE) | ct(len). The whole
// encoded frame is sealed; the sequence doubles as nonce material and
// associated data, so a replayed or reordered record cannot decrypt into
// an acceptable frame.

fn record_nonce(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

pub(crate) async fn write_record<W>(writer: &mut W, key: &[u8; 32], frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let seq_bytes = frame.seq.to_be_bytes();
    let ct = seal(key, &record_nonce(frame.seq), &seq_bytes, &frame.encode())
        .ok_or_else(|| NodeError::InvalidFrame("seal failed".into()))?;
    writer.write_u64(frame.seq).await?;
    writer.write_u32(ct.len() as u32).await?;
    writer.write_all(&ct).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_record<R>(
    reader: &mut R,
    key: &[u8; 32],
    last_seq: &mut u64,
) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let seq = reader.read_u64().await?;
    let len = reader.read_u32().await? as usize;
    if len < TAG_LEN || len > HEADER_LEN + MAX_FRAME as usize + TAG_LEN {
        return Err(NodeError::InvalidFrame(format!(
            "record length {len} out of bounds"
        )));
    }
    let mut ct = vec![0u8; len];
    reader.read_exact(&mut ct).await?;

    if seq <= *last_seq {
        return Err(NodeError::BadSequence {
            expected_above: *last_seq,
            got: seq,
        });
    }

    let plaintext = open(key, &record_nonce(seq), &seq.to_be_bytes(), &ct)
        .ok_or_else(|| NodeError::InvalidFrame("record failed to decrypt".into()))?;
    let frame = Frame::decode(&plaintext)?;
    if frame.seq != seq {
        return Err(NodeError::InvalidFrame(
            "frame sequence disagrees with record".into(),
        ));
    }
    *last_seq = seq;
    Ok(frame)
}

// ---- establishment ----------------------------------------------------------

async fn exchange_hello<S>(
    stream: &mut S,
    send_key: &[u8; 32],
    recv_key: &[u8; 32],
    expected_peer_id: &str,
    our_hello: &HelloPayload,
) -> Result<(HelloPayload, u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut send_seq = 0u64;
    let mut recv_seq = 0u64;

    send_seq += 1;
    let frame = Frame::new(MsgType::Hello, send_seq, our_hello.to_bytes());
    write_record(stream, send_key, &frame).await?;

    let frame = read_record(stream, recv_key, &mut recv_seq).await?;
    if frame.msg_type != MsgType::Hello {
        return Err(NodeError::InvalidFrame("expected hello".into()));
    }
    let hello = HelloPayload::from_bytes(&frame.payload)?;
    if hello.peer_id != expected_peer_id {
        return Err(NodeError::IdentityMismatch);
    }
    Ok((hello, send_seq, recv_seq))
}

/// Client-role establishment. The caller must already trust the peer it is
/// dialing; when `expected_peer_id` is given (mesh dials a discovered peer)
/// the responder must turn out to be exactly that peer.
pub(crate) async fn establish_outbound<S>(
    stream: S,
    identity: &Identity,
    trust: &TrustStore,
    expected_peer_id: Option<&str>,
    our_name: &str,
) -> Result<Established<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let mut stream = stream;
        let keys = handshake_dialer(&mut stream, identity).await?;
        let peer_id = peer_id_from_public_key(&keys.peer_static);

        if let Some(expected) = expected_peer_id {
            if peer_id != expected {
                return Err(NodeError::IdentityMismatch);
            }
        }
        match trust.decoded_key(&peer_id) {
            Some(pk) if pk == keys.peer_static => {}
            Some(_) => return Err(NodeError::IdentityMismatch),
            None => return Err(NodeError::UntrustedPeer(peer_id)),
        }

        let ours = HelloPayload::new(identity.peer_id(), our_name.to_string());
        let (hello, send_seq, recv_seq) =
            exchange_hello(&mut stream, &keys.send_key, &keys.recv_key, &peer_id, &ours).await?;

        Ok(Established {
            peer_id,
            peer_name: hello.name,
            stream,
            send_key: keys.send_key,
            recv_key: keys.recv_key,
            send_seq,
            recv_seq,
        })
    })
    .await
    .map_err(|_| NodeError::Timeout("handshake"))?
}

/// Server-role establishment. The dialer must be in the trust store, or the
/// QR auto-trust gate must be armed; in the latter case the dialer is
/// recorded (under its HELLO display name) before the session is reported
/// established, and the gate disarms.
pub(crate) async fn establish_inbound<S>(
    stream: S,
    identity: &Identity,
    trust: &TrustStore,
    qr_gate: Option<&AutoTrustGate>,
    our_name: &str,
) -> Result<Established<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let mut stream = stream;
        let armed = qr_gate.map(AutoTrustGate::is_armed).unwrap_or(false);
        let keys = handshake_responder(&mut stream, identity, |peer_id| {
            if trust.is_trusted(peer_id) || armed {
                Ok(())
            } else {
                Err(NodeError::UntrustedPeer(peer_id.to_string()))
            }
        })
        .await?;
        let peer_id = peer_id_from_public_key(&keys.peer_static);

        let ours = HelloPayload::new(identity.peer_id(), our_name.to_string());
        let (hello, send_seq, recv_seq) =
            exchange_hello(&mut stream, &keys.send_key, &keys.recv_key, &peer_id, &ours).await?;

        if !trust.is_trusted(&peer_id) {
            // one-shot auto-trust window
            let gate = qr_gate.ok_or_else(|| NodeError::UntrustedPeer(peer_id.clone()))?;
            if !gate.consume() {
                return Err(NodeError::UntrustedPeer(peer_id));
            }
            let pk_b64 = B64.encode(keys.peer_static);
            trust.add(&peer_id, &pk_b64, &hello.name)?;
            debug!(peer = %peer_id, name = %hello.name, "auto-trusted via qr pairing window");
        }

        Ok(Established {
            peer_id,
            peer_name: hello.name,
            stream,
            send_key: keys.send_key,
            recv_key: keys.recv_key,
            send_seq,
            recv_seq,
        })
    })
    .await
    .map_err(|_| NodeError::Timeout("handshake"))?
}

// ---- running session --------------------------------------------------------

impl<S> Established<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// One-shot delivery: send a single CLIP_TEXT and close.
    pub(crate) async fn send_text_once(mut self, text: &str) -> Result<()> {
        self.send_seq += 1;
        let frame = Frame::new(MsgType::ClipText, self.send_seq, text.as_bytes().to_vec());
        write_record(&mut self.stream, &self.send_key, &frame).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Long-lived session loop: pumps inbound frames, outbound commands and
    /// keep-alive until error, shutdown command, remote close or
    /// cancellation. Emits `Closed` exactly once on the way out.
    pub(crate) async fn run(
        self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        events_tx: mpsc::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) {
        let peer_id = self.peer_id.clone();
        let peer_name = self.peer_name.clone();
        let (read_half, mut write_half) = tokio::io::split(self.stream);

        let (in_tx, mut in_rx) = mpsc::channel::<Result<Frame>>(16);
        let recv_key = self.recv_key;
        let mut recv_seq = self.recv_seq;
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_record(&mut read_half, &recv_key, &mut recv_seq).await {
                    Ok(frame) => {
                        if in_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = in_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let send_key = self.send_key;
        let mut send_seq = self.send_seq;
        let mut ping_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        let mut pong_deadline: Option<tokio::time::Instant> = None;

        let reason: Option<String> = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,

                inbound = in_rx.recv() => match inbound {
                    Some(Ok(frame)) => match frame.msg_type {
                        MsgType::ClipText => {
                            let text = match String::from_utf8(frame.payload) {
                                Ok(text) => text,
                                Err(_) => break Some("clip text is not utf-8".to_string()),
                            };
                            debug!(peer = %peer_id, len = text.len(), "received clipboard text");
                            let _ = events_tx
                                .send(SessionEvent::RemoteText {
                                    peer_id: peer_id.clone(),
                                    peer_name: peer_name.clone(),
                                    text,
                                })
                                .await;
                        }
                        MsgType::Ping => {
                            send_seq += 1;
                            let pong = Frame::new(MsgType::Pong, send_seq, frame.payload);
                            if write_record(&mut write_half, &send_key, &pong).await.is_err() {
                                break Some("failed to answer ping".to_string());
                            }
                        }
                        MsgType::Pong => pong_deadline = None,
                        MsgType::Hello => warn!(peer = %peer_id, "unexpected hello after establishment"),
                        // file transfer frames are reserved
                        other => debug!(peer = %peer_id, ?other, "ignoring reserved frame"),
                    },
                    Some(Err(e)) => match e {
                        NodeError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                            debug!(peer = %peer_id, "remote closed");
                            break None;
                        }
                        other => break Some(other.to_string()),
                    },
                    None => break None,
                },

                command = cmd_rx.recv() => match command {
                    Some(SessionCommand::SendText(text)) => {
                        send_seq += 1;
                        let frame = Frame::new(MsgType::ClipText, send_seq, text.into_bytes());
                        if let Err(e) = write_record(&mut write_half, &send_key, &frame).await {
                            break Some(e.to_string());
                        }
                    }
                    Some(SessionCommand::Shutdown) | None => break None,
                },

                _ = ping_timer.tick() => {
                    if pong_deadline.is_none() {
                        send_seq += 1;
                        let token = rand::random::<u64>();
                        let ping = Frame::new(MsgType::Ping, send_seq, token.to_be_bytes().to_vec());
                        if write_record(&mut write_half, &send_key, &ping).await.is_err() {
                            break Some("failed to send ping".to_string());
                        }
                        pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                    }
                }

                _ = async {
                    match pong_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => break Some(NodeError::Timeout("keep-alive").to_string()),
            }
        };

        let _ = write_half.shutdown().await;
        reader.abort();
        let _ = reader.await;
        let _ = events_tx
            .send(SessionEvent::Closed { peer_id, reason })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trusting(dir: &std::path::Path, name: &str, others: &[&Identity]) -> TrustStore {
        let store = TrustStore::open(dir.join(format!("{name}.json"))).unwrap();
        for other in others {
            store
                .add(&other.peer_id(), &other.public_key_b64(), name)
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn record_round_trip_and_replay_rejection() {
        let key = [0x11u8; 32];
        let frame = Frame::new(MsgType::ClipText, 1, b"hello".to_vec());

        let mut wire = Vec::new();
        write_record(&mut wire, &key, &frame).await.unwrap();
        let replayed = [wire.clone(), wire.clone()].concat();

        let mut reader = replayed.as_slice();
        let mut last = 0u64;
        let decoded = read_record(&mut reader, &key, &mut last).await.unwrap();
        assert_eq!(decoded, frame);

        let err = read_record(&mut reader, &key, &mut last).await.unwrap_err();
        assert!(matches!(err, NodeError::BadSequence { got: 1, .. }));
    }

    #[tokio::test]
    async fn tampered_record_fails_to_decrypt() {
        let key = [0x22u8; 32];
        let frame = Frame::new(MsgType::ClipText, 1, b"hello".to_vec());
        let mut wire = Vec::new();
        write_record(&mut wire, &key, &frame).await.unwrap();

        let last_byte = wire.len() - 1;
        wire[last_byte] ^= 0x01;
        let mut reader = wire.as_slice();
        let mut last = 0u64;
        let err = read_record(&mut reader, &key, &mut last).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn mutual_trust_establishes_and_binds_peer_ids() {
        let dir = tempdir().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let trust_a = trusting(dir.path(), "alice", &[&bob]);
        let trust_b = trusting(dir.path(), "bob", &[&alice]);

        let (sa, sb) = tokio::io::duplex(4096);
        let bob_peer_id = bob.peer_id();
        let (out, inn) = tokio::join!(
            establish_outbound(sa, &alice, &trust_a, Some(&bob_peer_id), "Alice"),
            establish_inbound(sb, &bob, &trust_b, None, "Bob"),
        );
        let out = out.unwrap();
        let inn = inn.unwrap();

        assert_eq!(out.peer_id, bob.peer_id());
        assert_eq!(out.peer_name, "Bob");
        assert_eq!(inn.peer_id, alice.peer_id());
        assert_eq!(inn.peer_name, "Alice");
    }

    #[tokio::test]
    async fn untrusted_dialer_is_rejected_by_responder() {
        let dir = tempdir().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let trust_a = trusting(dir.path(), "alice", &[&bob]);
        let trust_b = trusting(dir.path(), "bob", &[]); // empty

        let (sa, sb) = tokio::io::duplex(4096);
        let bob_peer_id = bob.peer_id();
        let (out, inn) = tokio::join!(
            establish_outbound(sa, &alice, &trust_a, Some(&bob_peer_id), "Alice"),
            establish_inbound(sb, &bob, &trust_b, None, "Bob"),
        );
        assert!(matches!(inn.unwrap_err(), NodeError::UntrustedPeer(p) if p == alice.peer_id()));
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn untrusted_responder_is_rejected_by_dialer() {
        let dir = tempdir().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let trust_a = trusting(dir.path(), "alice", &[]); // empty
        let trust_b = trusting(dir.path(), "bob", &[&alice]);

        let (sa, sb) = tokio::io::duplex(4096);
        let (out, _inn) = tokio::join!(
            establish_outbound(sa, &alice, &trust_a, None, "Alice"),
            establish_inbound(sb, &bob, &trust_b, None, "Bob"),
        );
        assert!(matches!(out.unwrap_err(), NodeError::UntrustedPeer(p) if p == bob.peer_id()));
    }

    #[tokio::test]
    async fn armed_qr_gate_auto_trusts_the_dialer() {
        let dir = tempdir().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let trust_a = trusting(dir.path(), "alice", &[&bob]);
        let trust_b = trusting(dir.path(), "bob", &[]); // empty, gate armed
        let gate = AutoTrustGate::new();
        gate.arm();

        let (sa, sb) = tokio::io::duplex(4096);
        let bob_peer_id = bob.peer_id();
        let (out, inn) = tokio::join!(
            establish_outbound(sa, &alice, &trust_a, Some(&bob_peer_id), "Alice"),
            establish_inbound(sb, &bob, &trust_b, Some(&gate), "Bob"),
        );
        out.unwrap();
        inn.unwrap();

        let record = trust_b.get(&alice.peer_id()).unwrap();
        assert_eq!(record.display_name, "Alice");
        assert_eq!(record.identity_pk, alice.public_key_b64());
        assert!(!gate.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_the_handshake() {
        let dir = tempdir().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let trust_a = trusting(dir.path(), "alice", &[&bob]);

        let (sa, _sb) = tokio::io::duplex(4096);
        let err = establish_outbound(sa, &alice, &trust_a, None, "Alice")
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Timeout("handshake")));
    }
}
