//! Persistence collaborator and the object store facade.
//!
//! [`TokenStore`] is the narrow interface to durable storage: one token
//! record per slot plus any number of object records. [`ObjectStore`] sits in
//! front of it and keeps every live object, token or session owned, behind a
//! single handle table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::attributes::AttributeSet;
use crate::config::Limits;
use crate::crypto::{Curve, EncodedMaterial, KeyMaterial, MaterialKind, RandomSource, StorageKey};
use crate::error::{TokenError, TokenResult};
use crate::fs_utils;
use crate::handle::{Handle, HandleTable};
use crate::object::{Object, Owner};
use crate::slot::{PinRecord, SlotId};

pub(crate) mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Durable state of one token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub slot: SlotId,
    pub label: String,
    pub serial: String,
    pub so_pin: Option<PinRecord>,
    pub user_pin: Option<PinRecord>,
}

impl TokenRecord {
    pub fn blank(slot: SlotId) -> Self {
        let serial = hex::encode_upper(&Uuid::new_v4().as_bytes()[..8]);
        Self {
            slot,
            label: String::new(),
            serial,
            so_pin: None,
            user_pin: None,
        }
    }
}

/// Key material encrypted under the engine's [`StorageKey`], bound to the
/// object id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub kind: MaterialKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve: Option<Curve>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Durable form of a token object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: Uuid,
    pub slot: SlotId,
    pub attributes: AttributeSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<MaterialRecord>,
}

impl ObjectRecord {
    fn from_parts(
        id: Uuid,
        slot: SlotId,
        attributes: &AttributeSet,
        material: Option<&KeyMaterial>,
        sealing: &StorageKey,
        random: &dyn RandomSource,
    ) -> TokenResult<Self> {
        let material = match material {
            Some(material) => {
                let encoded = material.encode()?;
                let (nonce, ciphertext) = sealing.seal(random, id.as_bytes(), &encoded.bytes)?;
                Some(MaterialRecord {
                    kind: encoded.kind,
                    curve: encoded.curve,
                    nonce,
                    ciphertext,
                })
            }
            None => None,
        };
        Ok(Self {
            id,
            slot,
            attributes: attributes.clone(),
            material,
        })
    }

    fn open_material(&self, sealing: &StorageKey) -> TokenResult<Option<KeyMaterial>> {
        self.material
            .as_ref()
            .map(|record| {
                EncodedMaterial {
                    kind: record.kind,
                    curve: record.curve,
                    bytes: sealing.open(&record.nonce, self.id.as_bytes(), &record.ciphertext)?,
                }
                .decode()
            })
            .transpose()
    }
}

/// Durable storage for tokens and their objects.
pub trait TokenStore: Send + Sync {
    fn load_token(&self, slot: SlotId) -> TokenResult<Option<TokenRecord>>;

    fn save_token(&self, record: &TokenRecord) -> TokenResult<()>;

    fn load_objects(&self, slot: SlotId) -> TokenResult<Vec<ObjectRecord>>;

    /// Create or replace an object record.
    fn save_object(&self, record: &ObjectRecord) -> TokenResult<()>;

    fn delete_object(&self, slot: SlotId, id: Uuid) -> TokenResult<()>;

    /// Remove every object of a slot.
    fn clear_objects(&self, slot: SlotId) -> TokenResult<()>;
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<SlotId, TokenRecord>>,
    objects: RwLock<HashMap<(SlotId, Uuid), ObjectRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load_token(&self, slot: SlotId) -> TokenResult<Option<TokenRecord>> {
        Ok(self.tokens.read().get(&slot).cloned())
    }

    fn save_token(&self, record: &TokenRecord) -> TokenResult<()> {
        self.tokens.write().insert(record.slot, record.clone());
        Ok(())
    }

    fn load_objects(&self, slot: SlotId) -> TokenResult<Vec<ObjectRecord>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|record| record.slot == slot)
            .cloned()
            .collect())
    }

    fn save_object(&self, record: &ObjectRecord) -> TokenResult<()> {
        self.objects
            .write()
            .insert((record.slot, record.id), record.clone());
        Ok(())
    }

    fn delete_object(&self, slot: SlotId, id: Uuid) -> TokenResult<()> {
        self.objects.write().remove(&(slot, id));
        Ok(())
    }

    fn clear_objects(&self, slot: SlotId) -> TokenResult<()> {
        self.objects.write().retain(|(owner, _), _| *owner != slot);
        Ok(())
    }
}

/// JSON files under a private directory, one per token and one per object.
pub struct FileTokenStore {
    dir: PathBuf,
    lock: parking_lot::Mutex<()>,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> TokenResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs_utils::ensure_secure_dir(&dir).map_err(TokenError::device)?;
        Ok(Self {
            dir,
            lock: parking_lot::Mutex::new(()),
        })
    }

    fn slot_dir(&self, slot: SlotId) -> PathBuf {
        self.dir.join(format!("slot-{slot}"))
    }

    fn objects_dir(&self, slot: SlotId) -> PathBuf {
        self.slot_dir(slot).join("objects")
    }

    fn object_path(&self, slot: SlotId, id: Uuid) -> PathBuf {
        self.objects_dir(slot).join(format!("{id}.json"))
    }
}

impl TokenStore for FileTokenStore {
    fn load_token(&self, slot: SlotId) -> TokenResult<Option<TokenRecord>> {
        let _guard = self.lock.lock();
        fs_utils::read_json(&self.slot_dir(slot).join("token.json"))
    }

    fn save_token(&self, record: &TokenRecord) -> TokenResult<()> {
        let _guard = self.lock.lock();
        let dir = self.slot_dir(record.slot);
        fs_utils::ensure_secure_dir(&dir).map_err(TokenError::device)?;
        fs_utils::write_json(&dir.join("token.json"), record)
    }

    fn load_objects(&self, slot: SlotId) -> TokenResult<Vec<ObjectRecord>> {
        let _guard = self.lock.lock();
        let dir = self.objects_dir(slot);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).map_err(TokenError::device)? {
            let path = entry.map_err(TokenError::device)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = fs_utils::read_json::<ObjectRecord>(&path)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn save_object(&self, record: &ObjectRecord) -> TokenResult<()> {
        let _guard = self.lock.lock();
        let dir = self.objects_dir(record.slot);
        fs_utils::ensure_secure_dir(&dir).map_err(TokenError::device)?;
        fs_utils::write_json(&self.object_path(record.slot, record.id), record)
    }

    fn delete_object(&self, slot: SlotId, id: Uuid) -> TokenResult<()> {
        let _guard = self.lock.lock();
        fs_utils::remove_if_exists(&self.object_path(slot, id))
    }

    fn clear_objects(&self, slot: SlotId) -> TokenResult<()> {
        let _guard = self.lock.lock();
        let dir = self.objects_dir(slot);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(TokenError::device)?;
        }
        Ok(())
    }
}

/// Every live object, resolved through one generational handle table.
pub struct ObjectStore {
    objects: HandleTable<Object>,
    backend: Arc<dyn TokenStore>,
    sealing: StorageKey,
    random: Arc<dyn RandomSource>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn TokenStore>, sealing: StorageKey, random: Arc<dyn RandomSource>) -> Self {
        Self {
            objects: HandleTable::new(Limits::MAX_OBJECT_COUNT),
            backend,
            sealing,
            random,
        }
    }

    fn record(
        &self,
        id: Uuid,
        slot: SlotId,
        attributes: &AttributeSet,
        material: Option<&KeyMaterial>,
    ) -> TokenResult<ObjectRecord> {
        ObjectRecord::from_parts(id, slot, attributes, material, &self.sealing, self.random.as_ref())
    }

    pub fn backend(&self) -> &Arc<dyn TokenStore> {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Bring a slot's persisted objects into the table.
    pub fn load_slot(&mut self, slot: SlotId) -> TokenResult<usize> {
        let records = self.backend.load_objects(slot)?;
        let mut loaded = 0;
        for record in records {
            let material = match record.open_material(&self.sealing) {
                Ok(material) => material.map(Arc::new),
                Err(err) => {
                    warn!(slot, object = %record.id, error = %err, "skipping unreadable token object");
                    continue;
                }
            };
            let object = Object {
                slot,
                owner: Owner::Token,
                attributes: record.attributes,
                material,
                store_id: Some(record.id),
            };
            self.objects.insert(object).ok_or(TokenError::DeviceMemory)?;
            loaded += 1;
        }
        debug!(slot, loaded, "loaded token objects");
        Ok(loaded)
    }

    /// Insert a new object, persisting token objects. On a storage failure the
    /// table is left as it was.
    pub fn insert(
        &mut self,
        slot: SlotId,
        owner: Owner,
        attributes: AttributeSet,
        material: Option<Arc<KeyMaterial>>,
    ) -> TokenResult<Handle> {
        let store_id = (owner == Owner::Token).then(Uuid::new_v4);
        let record = match store_id {
            Some(id) => Some(self.record(id, slot, &attributes, material.as_deref())?),
            None => None,
        };
        let handle = self
            .objects
            .insert(Object {
                slot,
                owner,
                attributes,
                material,
                store_id,
            })
            .ok_or(TokenError::DeviceMemory)?;
        if let Some(record) = record {
            if let Err(err) = self.backend.save_object(&record) {
                self.objects.remove(handle);
                return Err(err);
            }
        }
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&Object> {
        self.objects.get(handle)
    }

    /// Replace an object's attributes, persisting first for token objects.
    pub fn replace_attributes(&mut self, handle: Handle, attributes: AttributeSet) -> TokenResult<()> {
        let object = self.objects.get(handle).ok_or(TokenError::ObjectHandleInvalid)?;
        if let Some(id) = object.store_id {
            let record = self.record(id, object.slot, &attributes, object.material.as_deref())?;
            self.backend.save_object(&record)?;
        }
        let object = self
            .objects
            .get_mut(handle)
            .ok_or(TokenError::ObjectHandleInvalid)?;
        object.attributes = attributes;
        Ok(())
    }

    pub fn remove(&mut self, handle: Handle) -> TokenResult<Object> {
        let object = self.objects.get(handle).ok_or(TokenError::ObjectHandleInvalid)?;
        if let Some(id) = object.store_id {
            self.backend.delete_object(object.slot, id)?;
        }
        self.objects.remove(handle).ok_or(TokenError::ObjectHandleInvalid)
    }

    /// Drop every object owned by `session`. Session objects are never
    /// persisted, so this cannot fail.
    pub fn remove_session_objects(&mut self, session: Handle) -> usize {
        self.objects
            .remove_where(|object| object.owner == Owner::Session(session))
            .len()
    }

    /// Destroy all token objects of a slot, durable copies first.
    pub fn clear_token(&mut self, slot: SlotId) -> TokenResult<usize> {
        self.backend.clear_objects(slot)?;
        Ok(self
            .objects
            .remove_where(|object| object.slot == slot && object.owner == Owner::Token)
            .len())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Object)> {
        self.objects.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use crate::crypto::OsRandom;
    use cryptoki_sys::{CKA_CLASS, CKA_LABEL, CKO_DATA};
    use tempfile::TempDir;

    fn object_store(backend: Arc<dyn TokenStore>, key_byte: u8) -> ObjectStore {
        let sealing = StorageKey::from_bytes(&[key_byte; StorageKey::LEN]).expect("key");
        ObjectStore::new(backend, sealing, Arc::new(OsRandom))
    }

    fn data_attributes(label: &str) -> AttributeSet {
        let mut attrs = AttributeSet::new();
        attrs.insert(CKA_CLASS, AttributeValue::Ulong(CKO_DATA));
        attrs.insert(CKA_LABEL, AttributeValue::Bytes(label.as_bytes().to_vec()));
        attrs
    }

    #[test]
    fn token_objects_survive_reload() {
        let dir = TempDir::new().expect("tempdir");
        let backend: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()).expect("store"));
        let mut store = object_store(backend.clone(), 3);
        let material = Arc::new(KeyMaterial::Secret(zeroize::Zeroizing::new(vec![9; 16])));
        store
            .insert(0, Owner::Token, data_attributes("kept"), Some(material))
            .expect("insert");
        store
            .insert(0, Owner::Session(Handle::from_raw(7)), data_attributes("volatile"), None)
            .expect("insert");

        let mut reloaded = object_store(backend, 3);
        assert_eq!(reloaded.load_slot(0).expect("load"), 1);
        let (_, object) = reloaded.iter().next().expect("object");
        assert_eq!(object.attributes.bytes(CKA_LABEL), Some(&b"kept"[..]));
        assert_eq!(
            object.material.as_ref().and_then(|m| m.secret().map(<[u8]>::to_vec)),
            Some(vec![9; 16])
        );
    }

    #[test]
    fn removing_session_objects_leaves_token_objects() {
        let mut store = object_store(Arc::new(MemoryTokenStore::new()), 3);
        let session = Handle::from_raw(42);
        let token = store
            .insert(0, Owner::Token, data_attributes("t"), None)
            .expect("insert");
        let volatile = store
            .insert(0, Owner::Session(session), data_attributes("s"), None)
            .expect("insert");
        assert_eq!(store.remove_session_objects(session), 1);
        assert!(store.get(volatile).is_none());
        assert!(store.get(token).is_some());
    }

    #[test]
    fn key_material_is_encrypted_on_disk() {
        let dir = TempDir::new().expect("tempdir");
        let backend: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(dir.path()).expect("store"));
        let secret = vec![0xA5; 32];
        let mut store = object_store(backend.clone(), 3);
        store
            .insert(
                0,
                Owner::Token,
                data_attributes("wrapped"),
                Some(Arc::new(KeyMaterial::Secret(zeroize::Zeroizing::new(secret.clone())))),
            )
            .expect("insert");

        let objects = dir.path().join("slot-0").join("objects");
        for entry in fs::read_dir(&objects).expect("objects dir") {
            let raw = fs::read(entry.expect("entry").path()).expect("read");
            let record: ObjectRecord = serde_json::from_slice(&raw).expect("record");
            let sealed = record.material.expect("material");
            assert!(!sealed.ciphertext.windows(secret.len()).any(|w| w == secret.as_slice()));
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &secret);
            assert!(!String::from_utf8_lossy(&raw).contains(&encoded));
        }

        // A different master key cannot open the record, so it is skipped.
        let mut foreign = object_store(backend, 4);
        assert_eq!(foreign.load_slot(0).expect("load"), 0);
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let store = FileTokenStore::new(dir.path().join("tokens")).expect("store");
        store.save_token(&TokenRecord::blank(3)).expect("save");
        let path = dir.path().join("tokens").join("slot-3").join("token.json");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            store.load_token(3).expect("load").map(|record| record.slot),
            Some(3)
        );
    }
}
