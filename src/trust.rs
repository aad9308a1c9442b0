use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};
use crate::identity::{peer_id_from_public_key, write_atomic};

/// One accepted peer. `peer_id` is derivable from `identity_pk`; `add`
/// enforces that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    pub peer_id: String,
    pub identity_pk: String,
    pub display_name: String,
    pub created_at: u64,
}

/// Persistent set of trusted peers, keyed by PeerId.
///
/// The whole document is a JSON array at a fixed path, replaced atomically
/// (temp + rename) on every mutation. An absent file is an empty store.
/// Callers may use the store from any thread; it serialises internally.
pub struct TrustStore {
    path: PathBuf,
    records: Mutex<HashMap<String, TrustRecord>>,
}

impl TrustStore {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let list: Vec<TrustRecord> = serde_json::from_str(&raw)
                    .map_err(|e| NodeError::CorruptFile(format!("trust store: {e}")))?;
                list.into_iter().map(|r| (r.peer_id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Adds (or replaces) a record. Rejects a PeerId that is not derivable
    /// from the given public key.
    pub fn add(&self, peer_id: &str, identity_pk_b64: &str, display_name: &str) -> Result<()> {
        let pk = decode_pk(identity_pk_b64)?;
        if peer_id_from_public_key(&pk) != peer_id {
            return Err(NodeError::IdentityMismatch);
        }

        let record = TrustRecord {
            peer_id: peer_id.to_string(),
            identity_pk: identity_pk_b64.to_string(),
            display_name: display_name.to_string(),
            created_at: crate::now_ms(),
        };

        let mut records = self.lock();
        records.insert(record.peer_id.clone(), record);
        self.flush(&records)
    }

    pub fn get(&self, peer_id: &str) -> Option<TrustRecord> {
        self.lock().get(peer_id).cloned()
    }

    pub fn is_trusted(&self, peer_id: &str) -> bool {
        self.lock().contains_key(peer_id)
    }

    /// Decoded 32-byte identity key for a trusted peer, if present.
    pub fn decoded_key(&self, peer_id: &str) -> Option<[u8; 32]> {
        let b64 = self.lock().get(peer_id)?.identity_pk.clone();
        decode_pk(&b64).ok()
    }

    pub fn remove(&self, peer_id: &str) -> Result<bool> {
        let mut records = self.lock();
        let removed = records.remove(peer_id).is_some();
        if removed {
            self.flush(&records)?;
        }
        Ok(removed)
    }

    /// All records, sorted by display name for determinism.
    pub fn list(&self) -> Vec<TrustRecord> {
        let mut list: Vec<TrustRecord> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        list
    }

    pub fn clear(&self) -> Result<()> {
        let mut records = self.lock();
        records.clear();
        self.flush(&records)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrustRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flushes the whole document. A failed write leaves the previous file
    /// intact: new content only lands via rename.
    fn flush(&self, records: &HashMap<String, TrustRecord>) -> Result<()> {
        let mut list: Vec<&TrustRecord> = records.values().collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| NodeError::CorruptFile(format!("trust store: {e}")))?;
        write_atomic(&self.path, json.as_bytes())?;
        Ok(())
    }
}

fn decode_pk(b64: &str) -> Result<[u8; 32]> {
    let bytes = B64
        .decode(b64)
        .map_err(|e| NodeError::CorruptFile(format!("trust store: bad base64: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| NodeError::CorruptFile("trust store: key is not 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn peer() -> (String, String) {
        let id = Identity::generate();
        (id.peer_id(), id.public_key_b64())
    }

    #[test]
    fn absent_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("trust.json")).unwrap();
        assert!(store.is_empty());
        assert!(store.list().is_empty());
    }

    #[test]
    fn add_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("trust.json")).unwrap();
        let (pid, pk) = peer();

        store.add(&pid, &pk, "laptop").unwrap();
        let record = store.get(&pid).unwrap();
        assert_eq!(record.display_name, "laptop");
        assert_eq!(record.identity_pk, pk);
        assert!(store.is_trusted(&pid));

        assert!(store.remove(&pid).unwrap());
        assert!(store.get(&pid).is_none());
        assert!(!store.remove(&pid).unwrap());
    }

    #[test]
    fn add_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let (pid, pk) = peer();

        {
            let store = TrustStore::open(&path).unwrap();
            store.add(&pid, &pk, "phone").unwrap();
        }
        let store = TrustStore::open(&path).unwrap();
        assert_eq!(store.get(&pid).unwrap().display_name, "phone");
    }

    #[test]
    fn duplicate_add_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("trust.json")).unwrap();
        let (pid, pk) = peer();

        store.add(&pid, &pk, "old name").unwrap();
        store.add(&pid, &pk, "new name").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&pid).unwrap().display_name, "new name");
    }

    #[test]
    fn rejects_peer_id_not_derived_from_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("trust.json")).unwrap();
        let (_, pk) = peer();

        let err = store.add("00112233445566778899aabbccddeeff", &pk, "x");
        assert!(matches!(err, Err(NodeError::IdentityMismatch)));
        assert!(store.is_empty());
    }

    #[test]
    fn list_is_sorted_by_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("trust.json")).unwrap();

        let (pid_a, pk_a) = peer();
        let (pid_b, pk_b) = peer();
        let (pid_c, pk_c) = peer();
        store.add(&pid_a, &pk_a, "zebra").unwrap();
        store.add(&pid_b, &pk_b, "alpaca").unwrap();
        store.add(&pid_c, &pk_c, "mule").unwrap();

        let names: Vec<String> = store.list().into_iter().map(|r| r.display_name).collect();
        assert_eq!(names, ["alpaca", "mule", "zebra"]);
    }

    #[test]
    fn clear_empties_store_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let store = TrustStore::open(&path).unwrap();
        let (pid, pk) = peer();

        store.add(&pid, &pk, "laptop").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());

        let reloaded = TrustStore::open(&path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn on_disk_form_is_a_json_array_of_camel_case_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let store = TrustStore::open(&path).unwrap();
        let (pid, pk) = peer();
        store.add(&pid, &pk, "laptop").unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &parsed.as_array().unwrap()[0];
        assert_eq!(entry["peerId"], pid);
        assert_eq!(entry["identityPk"], pk);
        assert_eq!(entry["displayName"], "laptop");
        assert!(entry["createdAt"].is_u64());
    }

    #[test]
    fn corrupt_file_is_rejected_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        std::fs::write(&path, "{ definitely not an array").unwrap();

        assert!(matches!(
            TrustStore::open(&path),
            Err(NodeError::CorruptFile(_))
        ));
        // broken file stays for inspection
        assert!(path.exists());
    }
}
