//! The dispatcher. Every call enters through an [`Engine`] value, which owns
//! the slot registry, the session table and the object store behind one
//! coarse lock.
//!
//! Lock order: the registry lock may be taken while a session's operation
//! mutex is held, never the other way round.

use std::sync::Arc;

use cryptoki_sys::*;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::attributes::{AttributeTemplate, AttributeType};
use crate::config::{EngineConfig, Limits, StorageConfig};
use crate::crypto::{CryptoProvider, OsRandom, RandomSource, SoftwareCrypto, StorageKey};
use crate::error::{TokenError, TokenResult};
use crate::handle::{Handle, HandleTable};
use crate::mechanism::{self, MechanismType};
use crate::object::{self, AttributeLookup, Object, Owner};
use crate::operation::FindOperation;
use crate::quote::QuoteProvider;
use crate::session::SessionEntry;
use crate::slot::{LoginState, Slot, SlotId, SlotInfo, Token, TokenInfo, utc_time};
use crate::store::{FileTokenStore, MemoryTokenStore, ObjectStore, TokenRecord, TokenStore};

const CRYPTOKI_VERSION: (u8, u8) = (2, 40);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryInfo {
    pub manufacturer: String,
    pub description: String,
    pub cryptoki_version: (u8, u8),
    pub library_version: (u8, u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub flags: CK_FLAGS,
}

/// Shared state guarded by the engine lock.
pub(crate) struct Registry {
    pub(crate) slots: Vec<Slot>,
    pub(crate) sessions: HandleTable<Arc<SessionEntry>>,
    pub(crate) objects: ObjectStore,
}

impl Registry {
    pub(crate) fn slot(&self, id: SlotId) -> TokenResult<&Slot> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.slots.get(index))
            .ok_or(TokenError::SlotIdInvalid(id))
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> TokenResult<&mut Slot> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.slots.get_mut(index))
            .ok_or(TokenError::SlotIdInvalid(id))
    }

    pub(crate) fn session(&self, handle: Handle) -> TokenResult<&Arc<SessionEntry>> {
        self.sessions
            .get(handle)
            .ok_or(TokenError::SessionHandleInvalid)
    }

    pub(crate) fn login(&self, slot: SlotId) -> LoginState {
        self.slot(slot)
            .map(|slot| slot.token.login)
            .unwrap_or(LoginState::Public)
    }

    pub(crate) fn sessions_on(
        &self,
        slot: SlotId,
    ) -> impl Iterator<Item = (Handle, &Arc<SessionEntry>)> {
        self.sessions
            .iter()
            .filter(move |(_, entry)| entry.slot == slot)
    }

    /// Visibility is decided on every resolve since login state can change
    /// between handle acquisition and use.
    pub(crate) fn can_see(&self, session: &SessionEntry, object: &Object) -> bool {
        object.slot == session.slot
            && (!object.is_private() || self.login(session.slot) == LoginState::User)
    }

    pub(crate) fn object(&self, session: &SessionEntry, handle: Handle) -> TokenResult<&Object> {
        self.objects
            .get(handle)
            .filter(|object| self.can_see(session, object))
            .ok_or(TokenError::ObjectHandleInvalid)
    }

    /// Authorize creating or modifying an object with the given scope.
    pub(crate) fn check_write(
        &self,
        session: &SessionEntry,
        token: bool,
        private: bool,
    ) -> TokenResult<()> {
        if token && !session.read_write() {
            return Err(TokenError::SessionReadOnly);
        }
        if private && self.login(session.slot) != LoginState::User {
            return Err(TokenError::UserNotLoggedIn);
        }
        Ok(())
    }
}

/// Explicit engine context. A process creates one and passes it to every call.
pub struct Engine {
    config: EngineConfig,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) random: Arc<dyn RandomSource>,
    pub(crate) quote: Option<Arc<dyn QuoteProvider>>,
}

impl Engine {
    /// Build an engine with the storage backend named by `config` and the
    /// software crypto provider.
    pub fn new(config: EngineConfig) -> TokenResult<Self> {
        config.validate()?;
        let backend: Arc<dyn TokenStore> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryTokenStore::new()),
            StorageConfig::File { directory, .. } => Arc::new(FileTokenStore::new(directory)?),
        };
        let storage_key = match &config.storage {
            StorageConfig::Memory => StorageKey::random(&OsRandom)?,
            StorageConfig::File { master_key, .. } => StorageKey::from_base64(master_key)?,
        };
        Self::with_collaborators(
            config,
            backend,
            Arc::new(SoftwareCrypto::new()),
            Arc::new(OsRandom),
            storage_key,
        )
    }

    pub fn with_collaborators(
        config: EngineConfig,
        backend: Arc<dyn TokenStore>,
        crypto: Arc<dyn CryptoProvider>,
        random: Arc<dyn RandomSource>,
        storage_key: StorageKey,
    ) -> TokenResult<Self> {
        config.validate()?;
        let mut objects = ObjectStore::new(backend.clone(), storage_key, random.clone());
        let mut slots = Vec::with_capacity(config.slot_count);
        for index in 0..config.slot_count {
            let id = index as SlotId;
            let record = backend
                .load_token(id)?
                .unwrap_or_else(|| TokenRecord::blank(id));
            let token = Token::new(record);
            if token.is_initialized() {
                objects.load_slot(id)?;
            }
            slots.push(Slot { id, token });
        }
        info!(
            slots = slots.len(),
            objects = objects.len(),
            crypto = crypto.provider_id(),
            "engine started"
        );
        Ok(Self {
            config,
            registry: RwLock::new(Registry {
                slots,
                sessions: HandleTable::new(Limits::MAX_SESSIONS),
                objects,
            }),
            crypto,
            random,
            quote: None,
        })
    }

    pub fn with_quote_provider(mut self, provider: Arc<dyn QuoteProvider>) -> Self {
        self.quote = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn session_entry(&self, handle: Handle) -> TokenResult<Arc<SessionEntry>> {
        self.registry.read().session(handle).cloned()
    }

    pub fn info(&self) -> LibraryInfo {
        let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
        let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
        LibraryInfo {
            manufacturer: self.config.manufacturer.clone(),
            description: self.config.library_description.clone(),
            cryptoki_version: CRYPTOKI_VERSION,
            library_version: (major, minor),
        }
    }

    /// Every slot permanently holds a token, so `token_present` does not
    /// narrow the list.
    pub fn slot_list(&self, _token_present: bool) -> Vec<SlotId> {
        self.registry.read().slots.iter().map(|slot| slot.id).collect()
    }

    pub fn slot_info(&self, slot: SlotId) -> TokenResult<SlotInfo> {
        let registry = self.registry.read();
        let slot = registry.slot(slot)?;
        Ok(SlotInfo {
            description: format!("{} slot {}", self.config.model, slot.id),
            manufacturer: self.config.manufacturer.clone(),
            flags: CKF_TOKEN_PRESENT,
        })
    }

    pub fn token_info(&self, slot: SlotId) -> TokenResult<TokenInfo> {
        let registry = self.registry.read();
        let token = &registry.slot(slot)?.token;
        let (session_count, rw_session_count) =
            registry
                .sessions_on(slot)
                .fold((0, 0), |(all, rw), (_, entry)| {
                    (all + 1, rw + usize::from(entry.read_write()))
                });
        Ok(TokenInfo {
            label: token.record.label.clone(),
            manufacturer: self.config.manufacturer.clone(),
            model: self.config.model.clone(),
            serial: token.record.serial.clone(),
            flags: token.flags(),
            max_sessions: Limits::MAX_SESSIONS,
            session_count,
            rw_session_count,
            min_pin_len: Limits::MIN_PIN_LEN,
            max_pin_len: Limits::MAX_PIN_LEN,
            utc_time: utc_time(),
        })
    }

    pub fn mechanism_list(&self, slot: SlotId) -> TokenResult<Vec<MechanismType>> {
        self.registry.read().slot(slot)?;
        Ok(mechanism::supported().map(|spec| spec.mechanism).collect())
    }

    pub fn mechanism_info(&self, slot: SlotId, mechanism: MechanismType) -> TokenResult<MechanismInfo> {
        self.registry.read().slot(slot)?;
        let spec = mechanism::lookup(mechanism)?;
        Ok(MechanismInfo {
            min_key_size: spec.min_key_size,
            max_key_size: spec.max_key_size,
            flags: spec.flags,
        })
    }

    pub fn create_object(&self, session: Handle, template: &AttributeTemplate) -> TokenResult<Handle> {
        let new = object::from_template(template)?;
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        registry.check_write(&entry, new.is_token(), new.is_private())?;
        let owner = if new.is_token() {
            Owner::Token
        } else {
            Owner::Session(session)
        };
        let handle = registry.objects.insert(
            entry.slot,
            owner,
            new.attributes,
            new.material.map(Arc::new),
        )?;
        info!(session = %session, object = %handle, "object created");
        Ok(handle)
    }

    pub fn copy_object(
        &self,
        session: Handle,
        source: Handle,
        template: &AttributeTemplate,
    ) -> TokenResult<Handle> {
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        let original = registry.object(&entry, source)?;
        object::check_copy(original, template)?;
        let mut attributes = original.attributes.clone();
        attributes.apply(template);
        let material = original.material.clone();
        let token = attributes.bool_or(CKA_TOKEN, false);
        let private = attributes.bool_or(CKA_PRIVATE, false);
        registry.check_write(&entry, token, private)?;
        let owner = if token {
            Owner::Token
        } else {
            Owner::Session(session)
        };
        let handle = registry
            .objects
            .insert(entry.slot, owner, attributes, material)?;
        info!(session = %session, source = %source, object = %handle, "object copied");
        Ok(handle)
    }

    /// Key material held by in-flight operations stays alive until those
    /// operations finish; the handle stops resolving immediately.
    pub fn destroy_object(&self, session: Handle, handle: Handle) -> TokenResult<()> {
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        let object = registry.object(&entry, handle)?;
        registry.check_write(&entry, object.is_token(), false)?;
        if !object.attributes.bool_or(CKA_DESTROYABLE, true) {
            return Err(TokenError::ActionProhibited);
        }
        registry.objects.remove(handle)?;
        info!(session = %session, object = %handle, "object destroyed");
        Ok(())
    }

    pub fn object_size(&self, session: Handle, handle: Handle) -> TokenResult<usize> {
        let registry = self.registry.read();
        let entry = registry.session(session)?;
        Ok(registry.object(entry, handle)?.size())
    }

    pub fn attribute_values(
        &self,
        session: Handle,
        handle: Handle,
        attributes: &[AttributeType],
    ) -> TokenResult<Vec<AttributeLookup>> {
        let registry = self.registry.read();
        let entry = registry.session(session)?;
        let object = registry.object(entry, handle)?;
        Ok(attributes
            .iter()
            .map(|attribute| object.lookup(*attribute))
            .collect())
    }

    /// All-or-nothing: the template is validated in full before anything is
    /// applied, and token objects are persisted before the change is visible.
    pub fn set_attribute_values(
        &self,
        session: Handle,
        handle: Handle,
        template: &AttributeTemplate,
    ) -> TokenResult<()> {
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        let object = registry.object(&entry, handle)?;
        registry.check_write(&entry, object.is_token(), false)?;
        object::check_set(object, template)?;
        let mut attributes = object.attributes.clone();
        attributes.apply(template);
        registry.objects.replace_attributes(handle, attributes)?;
        debug!(session = %session, object = %handle, count = template.len(), "attributes updated");
        Ok(())
    }

    pub fn find_objects_init(&self, session: Handle, template: &AttributeTemplate) -> TokenResult<()> {
        let (entry, matches) = {
            let registry = self.registry.read();
            let entry = registry.session(session)?.clone();
            let matches: Vec<Handle> = registry
                .objects
                .iter()
                .filter(|(_, object)| registry.can_see(&entry, object))
                .filter(|(_, object)| object.attributes.matches_template(template))
                .map(|(handle, _)| handle)
                .collect();
            (entry, matches)
        };
        let mut ops = entry.ops()?;
        if ops.find.is_some() {
            return Err(TokenError::OperationActive);
        }
        debug!(session = %session, matches = matches.len(), "find started");
        ops.find = Some(FindOperation::new(matches));
        Ok(())
    }

    pub fn find_objects(&self, session: Handle, max: usize) -> TokenResult<Vec<Handle>> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let find = ops
            .find
            .as_mut()
            .ok_or(TokenError::OperationNotInitialized)?;
        Ok(find.next_batch(max))
    }

    pub fn find_objects_final(&self, session: Handle) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        ops.find
            .take()
            .map(|_| ())
            .ok_or(TokenError::OperationNotInitialized)
    }

    pub fn generate_random(&self, session: Handle, len: usize) -> TokenResult<Vec<u8>> {
        self.session_entry(session)?;
        if len > Limits::MAX_CRYPTO_INPUT_LEN {
            return Err(TokenError::DataLenRange);
        }
        let mut out = vec![0u8; len];
        self.random.fill(&mut out)?;
        Ok(out)
    }

    pub fn seed_random(&self, session: Handle, seed: &[u8]) -> TokenResult<()> {
        self.session_entry(session)?;
        if seed.len() > Limits::MAX_CRYPTO_INPUT_LEN {
            return Err(TokenError::DataLenRange);
        }
        self.random.seed(seed)
    }
}
