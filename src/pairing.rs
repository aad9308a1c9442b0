use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;
use url::Url;

use crate::error::{NodeError, Result};
use crate::identity::Identity;

pub const PAIRING_SCHEME: &str = "openclipboard";
pub const PAIRING_VERSION: u8 = 1;

/// One-shot bootstrap record exchanged between two devices, QR-encoded as
/// `openclipboard://pair?v=1&pid=…&n=…&pk=…&p=…&nonce=…&a=…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPayload {
    pub version: u8,
    pub peer_id: String,
    pub display_name: String,
    pub identity_pk: [u8; 32],
    pub lan_port: u16,
    pub nonce: [u8; 32],
    pub lan_addrs: Vec<String>,
}

impl PairingPayload {
    pub fn new(
        peer_id: String,
        display_name: String,
        identity_pk: [u8; 32],
        lan_port: u16,
        nonce: [u8; 32],
        lan_addrs: Vec<String>,
    ) -> Self {
        Self {
            version: PAIRING_VERSION,
            peer_id,
            display_name,
            identity_pk,
            lan_port,
            nonce,
            lan_addrs,
        }
    }

    pub fn to_qr_string(&self) -> String {
        let mut qr = format!(
            "{PAIRING_SCHEME}://pair?v={}&pid={}&n={}&pk={}&p={}&nonce={}",
            self.version,
            self.peer_id,
            URL_SAFE_NO_PAD.encode(self.display_name.as_bytes()),
            URL_SAFE_NO_PAD.encode(self.identity_pk),
            self.lan_port,
            URL_SAFE_NO_PAD.encode(self.nonce),
        );
        if !self.lan_addrs.is_empty() {
            qr.push_str("&a=");
            qr.push_str(&self.lan_addrs.join(","));
        }
        qr
    }

    /// Parses a scanned string. Surrounding whitespace is tolerated.
    pub fn from_qr_string(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| NodeError::MalformedPairing(format!("not a url: {e}")))?;
        if url.scheme() != PAIRING_SCHEME {
            return Err(NodeError::MalformedPairing(format!(
                "unknown scheme {:?}",
                url.scheme()
            )));
        }
        if url.host_str() != Some("pair") {
            return Err(NodeError::MalformedPairing("expected pair host".into()));
        }

        let mut version = None;
        let mut peer_id = None;
        let mut display_name = None;
        let mut identity_pk = None;
        let mut lan_port = None;
        let mut nonce = None;
        let mut lan_addrs = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "v" => {
                    version = Some(value.parse::<u8>().map_err(|_| {
                        NodeError::MalformedPairing(format!("bad version {value:?}"))
                    })?)
                }
                "pid" => peer_id = Some(value.to_string()),
                "n" => display_name = Some(decode_utf8_field("n", &value)?),
                "pk" => identity_pk = Some(decode_key_field("pk", &value)?),
                "p" => {
                    lan_port = Some(value.parse::<u16>().map_err(|_| {
                        NodeError::MalformedPairing(format!("bad port {value:?}"))
                    })?)
                }
                "nonce" => nonce = Some(decode_key_field("nonce", &value)?),
                "a" => {
                    lan_addrs = value
                        .split(',')
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                _ => {} // unknown keys are ignored
            }
        }

        let version = require("v", version)?;
        if version != PAIRING_VERSION {
            return Err(NodeError::MalformedPairing(format!(
                "unsupported version {version}"
            )));
        }

        Ok(Self {
            version,
            peer_id: require("pid", peer_id)?,
            display_name: require("n", display_name)?,
            identity_pk: require("pk", identity_pk)?,
            lan_port: require("p", lan_port)?,
            nonce: require("nonce", nonce)?,
            lan_addrs,
        })
    }

    pub fn identity_pk_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.identity_pk)
    }
}

fn require<T>(key: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| NodeError::MalformedPairing(format!("missing field {key:?}")))
}

fn decode_utf8_field(key: &str, value: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| NodeError::MalformedPairing(format!("bad base64 in {key:?}: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| NodeError::MalformedPairing(format!("field {key:?} is not utf-8")))
}

fn decode_key_field(key: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| NodeError::MalformedPairing(format!("bad base64 in {key:?}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| NodeError::MalformedPairing(format!("field {key:?} is not 32 bytes")))
}

/// Builds the initiator payload with a fresh random nonce.
pub fn create_init(
    identity: &Identity,
    display_name: &str,
    lan_port: u16,
    lan_addrs: Vec<String>,
) -> PairingPayload {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    PairingPayload::new(
        identity.peer_id(),
        display_name.to_string(),
        identity.public_key(),
        lan_port,
        nonce,
        lan_addrs,
    )
}

/// Builds the responder payload, echoing the initiator's nonce.
pub fn respond_to_init(
    init: &PairingPayload,
    identity: &Identity,
    display_name: &str,
    lan_port: u16,
    lan_addrs: Vec<String>,
) -> PairingPayload {
    PairingPayload::new(
        identity.peer_id(),
        display_name.to_string(),
        identity.public_key(),
        lan_port,
        init.nonce,
        lan_addrs,
    )
}

/// Checks the nonce echo and derives the shared confirmation code.
pub fn finalize(init: &PairingPayload, resp: &PairingPayload) -> Result<String> {
    if init.nonce != resp.nonce {
        return Err(NodeError::NonceMismatch);
    }
    Ok(confirmation_code(&init.nonce, &init.peer_id, &resp.peer_id))
}

/// Six decimal digits, zero-padded, shown on both screens for
/// out-of-band verification:
/// `sha256(nonce ‖ initiator_peer_id ‖ responder_peer_id)` truncated to
/// its first 8 bytes, reduced mod 10^6.
pub fn confirmation_code(
    nonce: &[u8; 32],
    initiator_peer_id: &str,
    responder_peer_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(initiator_peer_id.as_bytes());
    hasher.update(responder_peer_id.as_bytes());
    let digest = hasher.finalize();
    let word = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    format!("{:06}", word % 1_000_000)
}

/// Arming state for QR auto-trust: while armed, the next inbound session
/// from an unknown peer is trusted and the gate disarms. A generation
/// counter keeps a stale timed window from disarming a newer one.
pub struct AutoTrustGate {
    state: Mutex<GateState>,
}

struct GateState {
    armed: bool,
    generation: u64,
}

impl AutoTrustGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                armed: false,
                generation: 0,
            }),
        }
    }

    pub fn arm(&self) -> u64 {
        let mut state = self.lock();
        state.armed = true;
        state.generation += 1;
        info!("qr pairing listener armed");
        state.generation
    }

    /// Arms the gate and disarms it again after `window` unless consumed
    /// or re-armed first.
    pub fn arm_for(self: &Arc<Self>, window: Duration) {
        let generation = self.arm();
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            gate.disarm_if(generation);
        });
    }

    pub fn disarm(&self) {
        self.lock().armed = false;
    }

    fn disarm_if(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.armed {
            state.armed = false;
            info!("qr pairing window expired");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    /// One-shot: reports armed and disarms in the same step.
    pub fn consume(&self) -> bool {
        let mut state = self.lock();
        let was_armed = state.armed;
        state.armed = false;
        was_armed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AutoTrustGate {
    fn default() -> Self {
        Self::new()
    }
}
