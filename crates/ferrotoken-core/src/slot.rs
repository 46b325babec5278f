//! Slots, the token each one holds, and the token-wide login state.

use cryptoki_sys::*;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::config::Limits;
use crate::crypto::RandomSource;
use crate::error::{TokenError, TokenResult};
use crate::store::{TokenRecord, b64};

pub type SlotId = CK_SLOT_ID;

const PIN_SALT_LEN: usize = 16;
const PIN_HASH_LEN: usize = 32;

/// Salted PBKDF2 verifier for a PIN. The PIN itself is never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub hash: Vec<u8>,
    pub iterations: u32,
}

impl PinRecord {
    pub fn new(pin: &[u8], iterations: u32, random: &dyn RandomSource) -> TokenResult<Self> {
        check_pin_len(pin)?;
        let mut salt = vec![0u8; PIN_SALT_LEN];
        random.fill(&mut salt)?;
        let hash = derive(pin, &salt, iterations);
        Ok(Self {
            salt,
            hash,
            iterations,
        })
    }

    pub fn matches(&self, pin: &[u8]) -> bool {
        let candidate = derive(pin, &self.salt, self.iterations);
        candidate.ct_eq(&self.hash).into()
    }
}

fn derive(pin: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; PIN_HASH_LEN];
    pbkdf2_hmac::<Sha256>(pin, salt, iterations, &mut out);
    out
}

pub fn check_pin_len(pin: &[u8]) -> TokenResult<()> {
    if (Limits::MIN_PIN_LEN..=Limits::MAX_PIN_LEN).contains(&pin.len()) {
        Ok(())
    } else {
        Err(TokenError::PinLenRange)
    }
}

/// Who is authenticated to a token. Shared by every session on the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    Public,
    User,
    SecurityOfficer,
}

pub struct Token {
    pub record: TokenRecord,
    pub login: LoginState,
}

impl Token {
    pub fn new(record: TokenRecord) -> Self {
        Self {
            record,
            login: LoginState::Public,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.record.so_pin.is_some()
    }

    pub fn user_pin_initialized(&self) -> bool {
        self.record.user_pin.is_some()
    }

    /// Reinitialize with a fresh SO PIN and label, clearing the user PIN.
    pub fn reinitialize(&mut self, label: &str, so_pin: PinRecord) {
        self.record.label = label.trim_end().to_string();
        self.record.so_pin = Some(so_pin);
        self.record.user_pin = None;
        self.login = LoginState::Public;
        info!(slot = self.record.slot, label = %self.record.label, "token initialized");
    }

    pub fn flags(&self) -> CK_FLAGS {
        let mut flags = CKF_RNG | CKF_LOGIN_REQUIRED | CKF_CLOCK_ON_TOKEN;
        if self.is_initialized() {
            flags |= CKF_TOKEN_INITIALIZED;
        }
        if self.user_pin_initialized() {
            flags |= CKF_USER_PIN_INITIALIZED;
        }
        flags
    }
}

pub struct Slot {
    pub id: SlotId,
    pub token: Token,
}

/// `C_GetSlotInfo` answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub description: String,
    pub manufacturer: String,
    pub flags: CK_FLAGS,
}

/// `C_GetTokenInfo` answer. Counters are snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub flags: CK_FLAGS,
    pub max_sessions: usize,
    pub session_count: usize,
    pub rw_session_count: usize,
    pub min_pin_len: usize,
    pub max_pin_len: usize,
    /// `YYYYMMDDhhmmss00` in UTC.
    pub utc_time: String,
}

pub fn utc_time() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}00",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
