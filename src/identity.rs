use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{NodeError, Result};

/// Derives a PeerId from an identity public key: the first 16 bytes of
/// SHA-256 over the key, rendered as lowercase hex.
pub fn peer_id_from_public_key(pk: &[u8; 32]) -> String {
    let digest = Sha256::digest(pk);
    hex::encode(&digest[..16])
}

/// Long-term device identity: an x25519 static keypair.
///
/// The same keypair is the handshake static key; possession is proven by
/// static Diffie-Hellman, so no second signing key is carried.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    sk: String,
    pk: String,
}

impl Identity {
    pub fn generate() -> Self {
        let secret = StaticSecret::random();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Loads an identity from disk. Absent file is `NotFound` (as an `Io`
    /// kind); anything unparseable or internally inconsistent is
    /// `CorruptFile`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: IdentityFile = serde_json::from_str(&raw)
            .map_err(|e| NodeError::CorruptFile(format!("identity: {e}")))?;

        let sk = decode_key(&file.sk)?;
        let pk = decode_key(&file.pk)?;

        let secret = StaticSecret::from(sk);
        let public = PublicKey::from(&secret);
        if public.as_bytes() != &pk {
            return Err(NodeError::CorruptFile(
                "identity: public key does not match secret key".into(),
            ));
        }

        Ok(Self { secret, public })
    }

    /// Atomic save: write to a temp file in the same directory, then rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = IdentityFile {
            sk: B64.encode(self.secret.to_bytes()),
            pk: B64.encode(self.public.as_bytes()),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| NodeError::CorruptFile(format!("identity: {e}")))?;
        write_atomic(path.as_ref(), json.as_bytes())?;
        Ok(())
    }

    /// The lazy-creation entry point: load if present, otherwise generate
    /// and persist. The identity is immutable once written.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }

    /// Explicitly destroys the on-disk identity. The only way to lose one.
    pub fn reset<P: AsRef<Path>>(path: P) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn peer_id(&self) -> String {
        peer_id_from_public_key(self.public.as_bytes())
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn public_key_b64(&self) -> String {
        B64.encode(self.public.as_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

fn decode_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = B64
        .decode(b64)
        .map_err(|e| NodeError::CorruptFile(format!("identity: bad base64: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| NodeError::CorruptFile("identity: key is not 32 bytes".into()))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn peer_id_is_truncated_sha256_of_public_key() {
        let identity = Identity::generate();
        let digest = Sha256::digest(identity.public_key());
        assert_eq!(identity.peer_id(), hex::encode(&digest[..16]));
        assert_eq!(identity.peer_id().len(), 32);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = Identity::generate();
        identity.save(&path).unwrap();

        let loaded = Identity::load(&path).unwrap();
        assert_eq!(loaded.peer_id(), identity.peer_id());
        assert_eq!(loaded.public_key(), identity.public_key());
    }

    #[test]
    fn load_missing_file_is_io_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Identity::load(dir.path().join("absent.json")).unwrap_err();
        match err {
            NodeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn load_rejects_garbage_and_short_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            Identity::load(&path),
            Err(NodeError::CorruptFile(_))
        ));

        std::fs::write(&path, r#"{"sk": "c2hvcnQ=", "pk": "c2hvcnQ="}"#).unwrap();
        assert!(matches!(
            Identity::load(&path),
            Err(NodeError::CorruptFile(_))
        ));

        std::fs::write(&path, r#"{"sk": "***", "pk": "***"}"#).unwrap();
        assert!(matches!(
            Identity::load(&path),
            Err(NodeError::CorruptFile(_))
        ));
    }

    #[test]
    fn load_rejects_mismatched_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let a = Identity::generate();
        let b = Identity::generate();
        let file = format!(
            r#"{{"sk": "{}", "pk": "{}"}}"#,
            B64.encode(a.secret.to_bytes()),
            b.public_key_b64()
        );
        std::fs::write(&path, file).unwrap();
        assert!(matches!(
            Identity::load(&path),
            Err(NodeError::CorruptFile(_))
        ));
    }

    #[test]
    fn load_or_generate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn reset_removes_the_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = Identity::load_or_generate(&path).unwrap();
        Identity::reset(&path).unwrap();
        Identity::reset(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_ne!(first.peer_id(), second.peer_id());
    }
}
