//! Sessions and the token-wide login state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cryptoki_sys::*;
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{TokenError, TokenResult};
use crate::handle::Handle;
use crate::operation::SessionOps;
use crate::slot::{LoginState, PinRecord, SlotId, check_pin_len};

/// Role named in a login call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserType {
    SecurityOfficer,
    User,
}

impl TryFrom<CK_USER_TYPE> for UserType {
    type Error = TokenError;

    fn try_from(value: CK_USER_TYPE) -> TokenResult<Self> {
        match value {
            CKU_SO => Ok(Self::SecurityOfficer),
            CKU_USER => Ok(Self::User),
            _ => Err(TokenError::UserTypeInvalid),
        }
    }
}

impl From<UserType> for CK_USER_TYPE {
    fn from(value: UserType) -> Self {
        match value {
            UserType::SecurityOfficer => CKU_SO,
            UserType::User => CKU_USER,
        }
    }
}

/// A live session. Entries are shared through `Arc` so an in-flight call keeps
/// its operation state while the registry lock is released.
pub struct SessionEntry {
    pub slot: SlotId,
    pub flags: CK_FLAGS,
    closed: AtomicBool,
    ops: Mutex<SessionOps>,
}

impl SessionEntry {
    fn new(slot: SlotId, flags: CK_FLAGS) -> Self {
        Self {
            slot,
            flags,
            closed: AtomicBool::new(false),
            ops: Mutex::new(SessionOps::default()),
        }
    }

    pub fn read_write(&self) -> bool {
        self.flags & CKF_RW_SESSION != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Lock the session's operation contexts. Fails once the session is closed.
    pub(crate) fn ops(&self) -> TokenResult<MutexGuard<'_, SessionOps>> {
        let guard = self.ops.lock();
        if self.is_closed() {
            return Err(TokenError::SessionClosed);
        }
        Ok(guard)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot: SlotId,
    pub state: CK_STATE,
    pub flags: CK_FLAGS,
    pub device_error: CK_ULONG,
}

pub fn session_state(login: LoginState, read_write: bool) -> CK_STATE {
    match (login, read_write) {
        (LoginState::Public, false) => CKS_RO_PUBLIC_SESSION,
        (LoginState::Public, true) => CKS_RW_PUBLIC_SESSION,
        (LoginState::User, false) => CKS_RO_USER_FUNCTIONS,
        (LoginState::User, true) => CKS_RW_USER_FUNCTIONS,
        (LoginState::SecurityOfficer, _) => CKS_RW_SO_FUNCTIONS,
    }
}

impl Engine {
    pub fn init_token(&self, slot: SlotId, so_pin: &[u8], label: &str) -> TokenResult<()> {
        check_pin_len(so_pin)?;
        let mut registry = self.registry.write();
        let token = &registry.slot(slot)?.token;
        if registry.sessions_on(slot).next().is_some() {
            return Err(TokenError::SessionExists);
        }
        if let Some(existing) = &token.record.so_pin {
            if !existing.matches(so_pin) {
                warn!(slot, "token initialization refused: wrong SO PIN");
                return Err(TokenError::PinIncorrect);
            }
        }
        let pin = PinRecord::new(so_pin, self.config().pin_iterations, self.random.as_ref())?;
        let mut record = token.record.clone();
        record.label = label.trim_end().to_string();
        record.so_pin = Some(pin.clone());
        record.user_pin = None;

        let removed = registry.objects.clear_token(slot)?;
        registry.objects.backend().save_token(&record)?;
        let token = &mut registry.slot_mut(slot)?.token;
        token.reinitialize(label, pin);
        info!(slot, removed, "token objects cleared");
        Ok(())
    }

    pub fn open_session(&self, slot: SlotId, flags: CK_FLAGS) -> TokenResult<Handle> {
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(TokenError::SessionParallelNotSupported);
        }
        let mut registry = self.registry.write();
        let token = &registry.slot(slot)?.token;
        if !token.is_initialized() {
            return Err(TokenError::TokenNotRecognized(slot));
        }
        let read_write = flags & CKF_RW_SESSION != 0;
        if !read_write && token.login == LoginState::SecurityOfficer {
            return Err(TokenError::SessionReadWriteSoExists);
        }
        let entry = Arc::new(SessionEntry::new(slot, flags));
        let handle = registry
            .sessions
            .insert(entry)
            .ok_or(TokenError::SessionCount)?;
        info!(slot, session = %handle, read_write, "session opened");
        Ok(handle)
    }

    /// Close a session, dropping its objects and operations. The token logs
    /// out when its last session closes.
    pub fn close_session(&self, session: Handle) -> TokenResult<()> {
        let mut registry = self.registry.write();
        let entry = registry
            .sessions
            .remove(session)
            .ok_or(TokenError::SessionHandleInvalid)?;
        entry.close();
        let removed = registry.objects.remove_session_objects(session);
        let slot = entry.slot;
        if registry.sessions_on(slot).next().is_none() {
            registry.slot_mut(slot)?.token.login = LoginState::Public;
        }
        info!(slot, session = %session, removed, "session closed");
        Ok(())
    }

    pub fn close_all_sessions(&self, slot: SlotId) -> TokenResult<()> {
        let mut registry = self.registry.write();
        registry.slot(slot)?;
        let closed = registry.sessions.remove_where(|entry| entry.slot == slot);
        for (handle, entry) in &closed {
            entry.close();
            registry.objects.remove_session_objects(*handle);
        }
        registry.slot_mut(slot)?.token.login = LoginState::Public;
        info!(slot, closed = closed.len(), "all sessions closed");
        Ok(())
    }

    pub fn session_info(&self, session: Handle) -> TokenResult<SessionInfo> {
        let registry = self.registry.read();
        let entry = registry.session(session)?;
        Ok(SessionInfo {
            slot: entry.slot,
            state: session_state(registry.login(entry.slot), entry.read_write()),
            flags: entry.flags,
            device_error: 0,
        })
    }

    pub fn login(&self, session: Handle, user_type: CK_USER_TYPE, pin: &[u8]) -> TokenResult<()> {
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        let role = UserType::try_from(user_type)?;
        let token = &registry.slot(entry.slot)?.token;
        if token.login != LoginState::Public {
            return Err(TokenError::UserAlreadyLoggedIn);
        }
        let record = match role {
            UserType::SecurityOfficer => {
                if registry
                    .sessions_on(entry.slot)
                    .any(|(_, other)| !other.read_write())
                {
                    return Err(TokenError::SessionReadOnlyExists);
                }
                token.record.so_pin.as_ref()
            }
            UserType::User => Some(
                token
                    .record
                    .user_pin
                    .as_ref()
                    .ok_or(TokenError::UserPinNotInitialized)?,
            ),
        };
        if !record.is_some_and(|record| record.matches(pin)) {
            warn!(slot = entry.slot, session = %session, ?role, "login failed");
            return Err(TokenError::PinIncorrect);
        }
        registry.slot_mut(entry.slot)?.token.login = match role {
            UserType::SecurityOfficer => LoginState::SecurityOfficer,
            UserType::User => LoginState::User,
        };
        info!(slot = entry.slot, session = %session, ?role, "logged in");
        Ok(())
    }

    pub fn logout(&self, session: Handle) -> TokenResult<()> {
        let mut registry = self.registry.write();
        let slot = registry.session(session)?.slot;
        let token = &mut registry.slot_mut(slot)?.token;
        if token.login == LoginState::Public {
            return Err(TokenError::UserNotLoggedIn);
        }
        token.login = LoginState::Public;
        info!(slot, session = %session, "logged out");
        Ok(())
    }

    pub fn init_pin(&self, session: Handle, pin: &[u8]) -> TokenResult<()> {
        check_pin_len(pin)?;
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        if !entry.read_write() {
            return Err(TokenError::SessionReadOnly);
        }
        let token = &registry.slot(entry.slot)?.token;
        if token.login != LoginState::SecurityOfficer {
            return Err(TokenError::UserNotLoggedIn);
        }
        let mut record = token.record.clone();
        record.user_pin = Some(PinRecord::new(
            pin,
            self.config().pin_iterations,
            self.random.as_ref(),
        )?);
        registry.objects.backend().save_token(&record)?;
        registry.slot_mut(entry.slot)?.token.record = record;
        info!(slot = entry.slot, "user PIN initialized");
        Ok(())
    }

    /// Change the SO PIN while the SO is logged in, otherwise the user PIN.
    pub fn set_pin(&self, session: Handle, old_pin: &[u8], new_pin: &[u8]) -> TokenResult<()> {
        check_pin_len(new_pin)?;
        let mut registry = self.registry.write();
        let entry = registry.session(session)?.clone();
        if !entry.read_write() {
            return Err(TokenError::SessionReadOnly);
        }
        let token = &registry.slot(entry.slot)?.token;
        let so = token.login == LoginState::SecurityOfficer;
        let current = if so {
            token.record.so_pin.as_ref()
        } else {
            Some(
                token
                    .record
                    .user_pin
                    .as_ref()
                    .ok_or(TokenError::UserPinNotInitialized)?,
            )
        };
        if !current.is_some_and(|record| record.matches(old_pin)) {
            return Err(TokenError::PinIncorrect);
        }
        let pin = PinRecord::new(new_pin, self.config().pin_iterations, self.random.as_ref())?;
        let mut record = token.record.clone();
        if so {
            record.so_pin = Some(pin);
        } else {
            record.user_pin = Some(pin);
        }
        registry.objects.backend().save_token(&record)?;
        registry.slot_mut(entry.slot)?.token.record = record;
        info!(slot = entry.slot, so, "PIN changed");
        Ok(())
    }

    /// Saving operation state is not offered; the session must still exist.
    pub fn operation_state(&self, session: Handle) -> TokenResult<Vec<u8>> {
        self.session_entry(session)?;
        Err(TokenError::FunctionNotSupported)
    }

    pub fn set_operation_state(&self, session: Handle, _state: &[u8]) -> TokenResult<()> {
        self.session_entry(session)?;
        Err(TokenError::FunctionNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    const SO_PIN: &[u8] = b"so-secret";
    const USER_PIN: &[u8] = b"user-secret";
    const RW: CK_FLAGS = CKF_SERIAL_SESSION | CKF_RW_SESSION;

    fn engine_with_user() -> Engine {
        let engine = Engine::new(EngineConfig {
            pin_iterations: 10,
            ..EngineConfig::default()
        })
        .expect("engine");
        engine.init_token(0, SO_PIN, "sessions").expect("init");
        let session = engine.open_session(0, RW).expect("session");
        engine.login(session, CKU_SO, SO_PIN).expect("so login");
        engine.init_pin(session, USER_PIN).expect("init pin");
        engine.close_session(session).expect("close");
        engine
    }

    #[test]
    fn uninitialized_token_refuses_sessions() {
        let engine = Engine::new(EngineConfig::default()).expect("engine");
        assert_eq!(
            engine.open_session(0, CKF_SERIAL_SESSION),
            Err(TokenError::TokenNotRecognized(0))
        );
        let engine = engine_with_user();
        assert_eq!(
            engine.open_session(0, CKF_RW_SESSION),
            Err(TokenError::SessionParallelNotSupported)
        );
    }

    #[test]
    fn login_is_token_wide() {
        let engine = engine_with_user();
        let first = engine.open_session(0, RW).expect("first");
        let second = engine.open_session(0, CKF_SERIAL_SESSION).expect("second");
        engine.login(first, CKU_USER, USER_PIN).expect("login");
        assert_eq!(
            engine.session_info(second).map(|info| info.state),
            Ok(CKS_RO_USER_FUNCTIONS)
        );
        assert_eq!(
            engine.login(second, CKU_USER, USER_PIN),
            Err(TokenError::UserAlreadyLoggedIn)
        );
        engine.logout(second).expect("logout");
        assert_eq!(engine.logout(first), Err(TokenError::UserNotLoggedIn));
    }

    #[test]
    fn security_officer_needs_read_write_sessions() {
        let engine = engine_with_user();
        let rw = engine.open_session(0, RW).expect("rw");
        let ro = engine.open_session(0, CKF_SERIAL_SESSION).expect("ro");
        assert_eq!(
            engine.login(rw, CKU_SO, SO_PIN),
            Err(TokenError::SessionReadOnlyExists)
        );
        engine.close_session(ro).expect("close ro");
        engine.login(rw, CKU_SO, SO_PIN).expect("so login");
        assert_eq!(
            engine.open_session(0, CKF_SERIAL_SESSION),
            Err(TokenError::SessionReadWriteSoExists)
        );
        assert_eq!(
            engine.login(rw, CKU_CONTEXT_SPECIFIC, SO_PIN),
            Err(TokenError::UserTypeInvalid)
        );
    }

    #[test]
    fn wrong_pin_leaves_state_public() {
        let engine = engine_with_user();
        let session = engine.open_session(0, RW).expect("session");
        assert_eq!(
            engine.login(session, CKU_USER, b"not-the-pin"),
            Err(TokenError::PinIncorrect)
        );
        assert_eq!(
            engine.session_info(session).map(|info| info.state),
            Ok(CKS_RW_PUBLIC_SESSION)
        );
    }

    #[test]
    fn set_pin_replaces_user_pin() {
        let engine = engine_with_user();
        let session = engine.open_session(0, RW).expect("session");
        engine.set_pin(session, USER_PIN, b"fresh-pin").expect("set pin");
        assert_eq!(
            engine.login(session, CKU_USER, USER_PIN),
            Err(TokenError::PinIncorrect)
        );
        engine.login(session, CKU_USER, b"fresh-pin").expect("login");
    }

    #[test]
    fn init_token_requires_no_sessions_and_matching_pin() {
        let engine = engine_with_user();
        let session = engine.open_session(0, RW).expect("session");
        assert_eq!(
            engine.init_token(0, SO_PIN, "again"),
            Err(TokenError::SessionExists)
        );
        engine.close_all_sessions(0).expect("close all");
        assert_eq!(
            engine.session_info(session),
            Err(TokenError::SessionHandleInvalid)
        );
        assert_eq!(
            engine.init_token(0, b"wrong-pin", "again"),
            Err(TokenError::PinIncorrect)
        );
        engine.init_token(0, SO_PIN, "again").expect("reinit");
        assert_eq!(
            engine.token_info(0).map(|info| info.flags & CKF_USER_PIN_INITIALIZED),
            Ok(0)
        );
    }
}
