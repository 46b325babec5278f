//! FerroToken core: a software token engine with the PKCS#11 object model.
//!
//! The [`Engine`] validates every call, tracks sessions and their operation
//! state machines, resolves handles under the token's access rules, and drives
//! key generation, derivation and wrapping. Primitive crypto, persistence,
//! randomness and attestation sit behind narrow traits so they can be swapped.
//! The C ABI lives in the `ferrotoken-pkcs11` crate.

pub mod attributes;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fs_utils;
pub mod handle;
pub mod keys;
pub mod mechanism;
pub mod object;
pub mod operation;
pub mod quote;
pub mod session;
pub mod slot;
pub mod store;

pub use attributes::{AttributeSet, AttributeTemplate, AttributeType, AttributeValue};
pub use config::{EngineConfig, Limits, StorageConfig};
pub use crypto::{
    CryptoProvider, KeyMaterial, OsRandom, RandomSource, SoftwareCrypto, StorageKey,
};
pub use engine::{Engine, LibraryInfo, MechanismInfo};
pub use error::{TokenError, TokenResult};
pub use handle::Handle;
pub use mechanism::{Mechanism, MechanismParams, MechanismType};
pub use object::AttributeLookup;
pub use operation::Output;
pub use quote::QuoteProvider;
pub use session::{SessionInfo, UserType};
pub use slot::{SlotId, SlotInfo, TokenInfo};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
