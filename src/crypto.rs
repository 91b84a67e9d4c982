//! # Cryptographic Operations
//!
//! This module provides the confidentiality layer for everything that crosses
//! the peer boundary:
//! - AES-256-GCM envelopes with a fresh random 96-bit nonce per encryption
//! - A keyring that keeps every historical key so old envelopes stay readable
//! - JWK export/import for provisioning a shared key on another device
//! - An Ed25519 device identity whose public key is the device id
//!
//! Keys are never re-encrypted or expired on rotation. A device keeps the
//! ability to open any envelope sealed under a key it once held.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SyncError};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Device identity backed by an Ed25519 key pair.
///
/// The hex-encoded public key is the stable device id stamped on every
/// operation and used as `senderId` on the wire.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: String,
}

impl Identity {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: IdentityFile =
            toml::from_str(&content).map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut bytes = hex::decode(&file.secret_key)
            .map_err(|e| SyncError::InvalidKey(format!("identity key is not hex: {}", e)))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SyncError::InvalidKey(format!("identity key has {} bytes", bytes.len())))?;
        bytes.zeroize();

        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = IdentityFile {
            secret_key: hex::encode(self.signing_key.to_bytes()),
        };
        let content = toml::to_string_pretty(&file).map_err(|e| SyncError::Storage(e.to_string()))?;
        write_private_file(path, &content)
    }

    pub fn device_id(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }
}

/// Raw 256-bit key material, wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| SyncError::InvalidKey(e.to_string()))
    }
}

/// A symmetric key held by the [`EncryptionManager`].
#[derive(Clone)]
pub struct EncryptionKey {
    pub id: String,
    material: KeyMaterial,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Sealed payload. Only the holder of `key_id` can open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub key_id: String,
    #[serde(with = "b64_nonce")]
    pub iv: [u8; NONCE_SIZE],
    #[serde(with = "b64_bytes")]
    pub data: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// JSON Web Key form of a symmetric AES-GCM key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub k: String,
    pub alg: String,
    pub ext: bool,
    pub key_ops: Vec<String>,
}

#[derive(Default)]
struct KeyRing {
    keys: HashMap<String, EncryptionKey>,
    current_key_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct KeyRingFile {
    current_key_id: Option<String>,
    #[serde(default)]
    keys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    id: String,
    material: String,
    created_at: DateTime<Utc>,
}

/// Owns every symmetric key this device holds.
///
/// Callers only ever see key ids and exported copies; the map itself never
/// leaves the manager.
pub struct EncryptionManager {
    ring: RwLock<KeyRing>,
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionManager {
    /// Empty keyring. `encrypt` fails with `NoKeyAvailable` until a key exists.
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(KeyRing::default()),
        }
    }

    /// Keyring with one freshly generated current key.
    pub fn with_new_key() -> Self {
        let manager = Self::new();
        manager.generate_new_key();
        manager
    }

    pub fn generate_new_key(&self) -> String {
        let key_id = Uuid::new_v4().to_string();
        let material = KeyMaterial(Aes256Gcm::generate_key(&mut OsRng).into());

        let mut ring = self.ring.write();
        ring.keys.insert(
            key_id.clone(),
            EncryptionKey {
                id: key_id.clone(),
                material,
                created_at: Utc::now(),
            },
        );
        ring.current_key_id = Some(key_id.clone());

        debug!("Generated encryption key {}", key_id);
        key_id
    }

    /// New current key; older keys stay available for decryption.
    pub fn rotate_key(&self) -> String {
        let previous = self.current_key_id();
        let key_id = self.generate_new_key();
        info!(
            "Rotated encryption key {} -> {}",
            previous.as_deref().unwrap_or("<none>"),
            key_id
        );
        key_id
    }

    /// Point `currentKeyId` at a key already in the ring.
    pub fn use_key(&self, key_id: &str) -> Result<()> {
        let mut ring = self.ring.write();
        if !ring.keys.contains_key(key_id) {
            return Err(SyncError::UnknownKey(key_id.to_string()));
        }
        ring.current_key_id = Some(key_id.to_string());
        Ok(())
    }

    pub fn current_key_id(&self) -> Option<String> {
        self.ring.read().current_key_id.clone()
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.ring.read().keys.contains_key(key_id)
    }

    /// Held keys, oldest first.
    pub fn keys(&self) -> Vec<EncryptionKey> {
        let mut keys: Vec<EncryptionKey> = self.ring.read().keys.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        keys
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.keys().into_iter().map(|key| key.id).collect()
    }

    pub fn encrypt<T: Serialize + ?Sized>(&self, payload: &T) -> Result<EncryptedEnvelope> {
        let plaintext = serde_json::to_vec(payload)?;
        self.encrypt_bytes(&plaintext)
    }

    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let (key_id, cipher) = {
            let ring = self.ring.read();
            let key_id = ring.current_key_id.clone().ok_or(SyncError::NoKeyAvailable)?;
            let key = ring
                .keys
                .get(&key_id)
                .ok_or_else(|| SyncError::UnknownKey(key_id.clone()))?;
            (key_id, key.material.cipher()?)
        };

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let data = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SyncError::EncryptionFailed(e.to_string()))?;

        Ok(EncryptedEnvelope {
            key_id,
            iv: nonce.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Open an envelope and parse its JSON payload.
    ///
    /// A payload that authenticates but does not parse as `T` is
    /// `InvalidSyncPayload`.
    pub fn decrypt<T: DeserializeOwned>(&self, envelope: &EncryptedEnvelope) -> Result<T> {
        let plaintext = self.decrypt_bytes(envelope)?;
        serde_json::from_slice(&plaintext).map_err(|e| SyncError::InvalidSyncPayload(e.to_string()))
    }

    pub fn decrypt_bytes(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let cipher = {
            let ring = self.ring.read();
            let key = ring
                .keys
                .get(&envelope.key_id)
                .ok_or_else(|| SyncError::UnknownKey(envelope.key_id.clone()))?;
            key.material.cipher()?
        };

        cipher
            .decrypt(Nonce::from_slice(&envelope.iv), envelope.data.as_slice())
            .map_err(|_| SyncError::DecryptionFailed)
    }

    pub fn export_key(&self, key_id: &str) -> Result<Jwk> {
        let ring = self.ring.read();
        let key = ring
            .keys
            .get(key_id)
            .ok_or_else(|| SyncError::UnknownKey(key_id.to_string()))?;

        Ok(Jwk {
            kty: "oct".to_string(),
            k: BASE64_URL_SAFE_NO_PAD.encode(key.material.0),
            alg: "A256GCM".to_string(),
            ext: true,
            key_ops: vec!["encrypt".to_string(), "decrypt".to_string()],
        })
    }

    /// Add a key received out of band. Does not change the current key.
    pub fn import_key(&self, key_id: &str, jwk: &Jwk) -> Result<()> {
        if key_id.is_empty() {
            return Err(SyncError::InvalidKey("key id must not be empty".to_string()));
        }
        if jwk.kty != "oct" {
            return Err(SyncError::InvalidKey(format!("unsupported key type {}", jwk.kty)));
        }
        if jwk.alg != "A256GCM" {
            return Err(SyncError::InvalidKey(format!("unsupported algorithm {}", jwk.alg)));
        }

        let material = decode_material(&BASE64_URL_SAFE_NO_PAD, &jwk.k)?;
        let mut ring = self.ring.write();
        if let Some(held) = ring.keys.get(key_id) {
            // A held id keeps its material for good
            if held.material.0 != material.0 {
                return Err(SyncError::InvalidKey(format!(
                    "key {} is already held with different material",
                    key_id
                )));
            }
            debug!("Key {} already held, import is a no-op", key_id);
            return Ok(());
        }

        ring.keys.insert(
            key_id.to_string(),
            EncryptionKey {
                id: key_id.to_string(),
                material,
                created_at: Utc::now(),
            },
        );

        info!("Imported encryption key {}", key_id);
        Ok(())
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let manager = Self::with_new_key();
            manager.save(path)?;
            Ok(manager)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: KeyRingFile =
            toml::from_str(&content).map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut ring = KeyRing {
            keys: HashMap::with_capacity(file.keys.len()),
            current_key_id: file.current_key_id,
        };
        for stored in file.keys {
            let material = decode_material(&BASE64_STANDARD, &stored.material)?;
            ring.keys.insert(
                stored.id.clone(),
                EncryptionKey {
                    id: stored.id,
                    material,
                    created_at: stored.created_at,
                },
            );
        }

        if let Some(current) = &ring.current_key_id {
            if !ring.keys.contains_key(current) {
                return Err(SyncError::UnknownKey(current.clone()));
            }
        }

        Ok(Self {
            ring: RwLock::new(ring),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = {
            let ring = self.ring.read();
            KeyRingFile {
                current_key_id: ring.current_key_id.clone(),
                keys: ring
                    .keys
                    .values()
                    .map(|key| StoredKey {
                        id: key.id.clone(),
                        material: BASE64_STANDARD.encode(key.material.0),
                        created_at: key.created_at,
                    })
                    .collect(),
            }
        };

        let content = toml::to_string_pretty(&file).map_err(|e| SyncError::Storage(e.to_string()))?;
        write_private_file(path, &content)
    }
}

fn decode_material<E: base64::Engine>(engine: &E, encoded: &str) -> Result<KeyMaterial> {
    let mut bytes = engine
        .decode(encoded)
        .map_err(|e| SyncError::InvalidKey(format!("bad key encoding: {}", e)))?;
    let material: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        SyncError::InvalidKey(format!("expected {} key bytes, got {}", KEY_SIZE, bytes.len()))
    })?;
    bytes.zeroize();
    Ok(KeyMaterial(material))
}

fn write_private_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    // Key material: owner read/write only, from the moment the file exists
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;

    // `mode` only applies on creation; tighten a file that predates us
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

mod b64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod b64_nonce {
    use super::NONCE_SIZE;
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        nonce: &[u8; NONCE_SIZE],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(nonce))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; NONCE_SIZE], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64_STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
        bytes.as_slice().try_into().map_err(|_| {
            serde::de::Error::custom(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                bytes.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_without_key_fails() {
        let manager = EncryptionManager::new();
        assert_matches!(manager.encrypt(&json!({"a": 1})), Err(SyncError::NoKeyAvailable));
    }

    #[test]
    fn test_round_trip() {
        let manager = EncryptionManager::with_new_key();
        let payload = json!({"tasks": [{"id": "t1"}], "userPattern": null});

        let envelope = manager.encrypt(&payload).unwrap();
        let decrypted: serde_json::Value = manager.decrypt(&envelope).unwrap();

        assert_eq!(decrypted, payload);
        assert_eq!(Some(envelope.key_id), manager.current_key_id());
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let manager = EncryptionManager::with_new_key();
        let payload = json!("same plaintext");

        let first = manager.encrypt(&payload).unwrap();
        let second = manager.encrypt(&payload).unwrap();

        assert_ne!(first.iv, second.iv);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn test_unknown_key_is_closed_failure() {
        let sender = EncryptionManager::with_new_key();
        let receiver = EncryptionManager::with_new_key();

        let envelope = sender.encrypt(&json!(1)).unwrap();
        assert_matches!(
            receiver.decrypt::<serde_json::Value>(&envelope),
            Err(SyncError::UnknownKey(_))
        );
    }

    #[test]
    fn test_wrong_key_material_fails_authentication() {
        let sender = EncryptionManager::with_new_key();
        let receiver = EncryptionManager::with_new_key();

        let envelope = sender.encrypt(&json!({"secret": true})).unwrap();

        // Same id, different material
        let foreign = receiver.current_key_id().unwrap();
        let jwk = receiver.export_key(&foreign).unwrap();
        let impostor = EncryptionManager::new();
        impostor.import_key(&envelope.key_id, &jwk).unwrap();

        assert_matches!(impostor.decrypt_bytes(&envelope), Err(SyncError::DecryptionFailed));
    }

    #[test]
    fn test_tampering_detected() {
        let manager = EncryptionManager::with_new_key();
        let mut envelope = manager.encrypt(&json!({"title": "Updated"})).unwrap();
        envelope.data[0] ^= 0xFF;
        assert_matches!(manager.decrypt_bytes(&envelope), Err(SyncError::DecryptionFailed));

        let mut envelope = manager.encrypt(&json!({"title": "Updated"})).unwrap();
        envelope.iv[0] ^= 0xFF;
        assert_matches!(manager.decrypt_bytes(&envelope), Err(SyncError::DecryptionFailed));
    }

    #[test]
    fn test_rotation_keeps_old_keys() {
        let manager = EncryptionManager::with_new_key();
        let old_envelope = manager.encrypt(&json!("before rotation")).unwrap();
        let old_key = manager.current_key_id().unwrap();

        let new_key = manager.rotate_key();
        assert_ne!(old_key, new_key);
        assert_eq!(manager.current_key_id(), Some(new_key.clone()));
        assert!(manager.has_key(&old_key));

        let decrypted: String = manager.decrypt(&old_envelope).unwrap();
        assert_eq!(decrypted, "before rotation");
        assert_eq!(manager.encrypt(&json!(1)).unwrap().key_id, new_key);
    }

    #[test]
    fn test_export_import_between_devices() {
        let laptop = EncryptionManager::with_new_key();
        let phone = EncryptionManager::new();

        let key_id = laptop.current_key_id().unwrap();
        let jwk = laptop.export_key(&key_id).unwrap();
        assert_eq!(jwk.kty, "oct");
        assert_eq!(jwk.alg, "A256GCM");

        phone.import_key(&key_id, &jwk).unwrap();
        assert!(phone.current_key_id().is_none());
        phone.use_key(&key_id).unwrap();

        let envelope = phone.encrypt(&json!({"from": "phone"})).unwrap();
        let opened: serde_json::Value = laptop.decrypt(&envelope).unwrap();
        assert_eq!(opened["from"], "phone");
    }

    #[test]
    fn test_import_rejects_bad_jwk() {
        let manager = EncryptionManager::new();
        assert_matches!(manager.export_key("missing"), Err(SyncError::UnknownKey(_)));

        let source = EncryptionManager::with_new_key();
        let good = source.export_key(&source.current_key_id().unwrap()).unwrap();

        let mut wrong_type = good.clone();
        wrong_type.kty = "RSA".into();
        assert_matches!(manager.import_key("k", &wrong_type), Err(SyncError::InvalidKey(_)));

        let mut short = good.clone();
        short.k = BASE64_URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert_matches!(manager.import_key("k", &short), Err(SyncError::InvalidKey(_)));

        assert_matches!(manager.import_key("", &good), Err(SyncError::InvalidKey(_)));
        assert!(manager.keys().is_empty());
    }

    #[test]
    fn test_import_never_replaces_held_key() {
        let manager = EncryptionManager::with_new_key();
        let key_id = manager.current_key_id().unwrap();
        let envelope = manager.encrypt(&json!("sealed before import")).unwrap();

        let foreign = EncryptionManager::with_new_key();
        let foreign_jwk = foreign.export_key(&foreign.current_key_id().unwrap()).unwrap();
        assert_matches!(
            manager.import_key(&key_id, &foreign_jwk),
            Err(SyncError::InvalidKey(_))
        );

        let opened: String = manager.decrypt(&envelope).unwrap();
        assert_eq!(opened, "sealed before import");

        // Same material under the same id is accepted and changes nothing
        let own_jwk = manager.export_key(&key_id).unwrap();
        manager.import_key(&key_id, &own_jwk).unwrap();
        assert_eq!(manager.keys().len(), 1);
        assert_eq!(manager.current_key_id(), Some(key_id));
    }

    #[test]
    fn test_use_unknown_key_fails() {
        let manager = EncryptionManager::with_new_key();
        assert_matches!(manager.use_key("missing"), Err(SyncError::UnknownKey(_)));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let manager = EncryptionManager::with_new_key();
        let envelope = manager.encrypt(&json!([1, 2, 3])).unwrap();

        let wire = serde_json::to_value(&envelope).unwrap();
        assert!(wire["keyId"].is_string());
        assert!(wire["iv"].is_string());
        assert!(wire["data"].is_string());
        assert!(wire["timestamp"].is_i64());

        let parsed: EncryptedEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_keyring_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys.toml");

        let manager = EncryptionManager::with_new_key();
        let envelope = manager.encrypt(&json!("persisted")).unwrap();
        manager.rotate_key();
        manager.save(&path).unwrap();

        let loaded = EncryptionManager::load(&path).unwrap();
        assert_eq!(loaded.current_key_id(), manager.current_key_id());
        assert_eq!(loaded.keys().len(), 2);

        let opened: String = loaded.decrypt(&envelope).unwrap();
        assert_eq!(opened, "persisted");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_keyring_load_or_generate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("keys.toml");

        let created = EncryptionManager::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let reloaded = EncryptionManager::load_or_generate(&path).unwrap();
        assert_eq!(created.current_key_id(), reloaded.current_key_id());
    }

    #[test]
    fn test_identity_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");

        let identity = Identity::generate();
        identity.save(&path).unwrap();
        let loaded = Identity::load(&path).unwrap();

        // Ed25519 public keys are 32 bytes = 64 hex chars
        assert_eq!(identity.device_id().len(), 64);
        assert_eq!(identity.device_id(), loaded.device_id());
    }

    #[test]
    fn test_identity_load_or_generate_new() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("new_identity.key");

        let identity = Identity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Identity::load(&path).unwrap().device_id(), identity.device_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let identity_path = temp_dir.path().join("identity.key");
        let keyring_path = temp_dir.path().join("keys.toml");

        for path in [&identity_path, &keyring_path] {
            std::fs::write(path, "stale").unwrap();
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).unwrap();
        }

        let identity = Identity::generate();
        identity.save(&identity_path).unwrap();
        EncryptionManager::with_new_key().save(&keyring_path).unwrap();

        for path in [&identity_path, &keyring_path] {
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert_eq!(Identity::load(&identity_path).unwrap().device_id(), identity.device_id());
    }
}
