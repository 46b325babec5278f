//! Engine configuration and the hard resource ceilings enforced at the call
//! boundary.

use std::{fmt, fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::StorageKey;
use crate::error::{TokenError, TokenResult};

/// Fixed capacity constants. These are not configurable.
pub struct Limits;

impl Limits {
    pub const MAX_TEMPLATE_ATTRIBUTES: usize = 0x200;
    pub const MAX_PARAMETER_LEN: usize = 0x1000;
    pub const MAX_CRYPTO_INPUT_LEN: usize = 0x320_0000;
    pub const MAX_SLOTS: usize = 0x1000;
    pub const MAX_MECHANISM_COUNT: usize = 0x200;
    pub const MAX_OBJECT_COUNT: usize = 0x8000_0000;
    pub const MIN_PIN_LEN: usize = 4;
    pub const MAX_PIN_LEN: usize = 255;
    pub const MAX_SESSIONS: usize = 0x10000;
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        directory: PathBuf,
        /// Base64 encoded 32 byte AES-256 key sealing key material at rest.
        master_key: String,
    },
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::File { directory, .. } => f
                .debug_struct("File")
                .field("directory", directory)
                .field("master_key", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of virtual slots, each holding one token.
    pub slot_count: usize,
    pub storage: StorageConfig,
    /// PBKDF2-HMAC-SHA256 rounds used when hashing PINs.
    pub pin_iterations: u32,
    pub manufacturer: String,
    pub model: String,
    pub library_description: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_count: 1,
            storage: StorageConfig::default(),
            pin_iterations: 10_000,
            manufacturer: "FerroLabs AG".to_string(),
            model: "FerroToken".to_string(),
            library_description: "FerroToken PKCS#11 Engine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> TokenResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| TokenError::GeneralError(format!("{}: {err}", path.display())))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|err| TokenError::GeneralError(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TokenResult<()> {
        if self.slot_count == 0 || self.slot_count > Limits::MAX_SLOTS {
            return Err(TokenError::GeneralError(format!(
                "slot_count must be between 1 and {}",
                Limits::MAX_SLOTS
            )));
        }
        if self.pin_iterations == 0 {
            return Err(TokenError::GeneralError(
                "pin_iterations must be non-zero".to_string(),
            ));
        }
        if let StorageConfig::File { master_key, .. } = &self.storage {
            StorageKey::from_base64(master_key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_file_backend_from_toml() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ferrotoken.toml");
        fs::write(
            &path,
            "slot_count = 3\n[storage]\nbackend = \"file\"\ndirectory = \"/var/lib/ferrotoken\"\nmaster_key = \"AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=\"\n",
        )
        .expect("write config");

        let config = EngineConfig::load(&path).expect("config");
        assert_eq!(config.slot_count, 3);
        assert_eq!(
            config.storage,
            StorageConfig::File {
                directory: PathBuf::from("/var/lib/ferrotoken"),
                master_key: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string(),
            }
        );
        assert_eq!(config.pin_iterations, EngineConfig::default().pin_iterations);
    }

    #[test]
    fn rejects_slot_count_over_ceiling() {
        let config = EngineConfig {
            slot_count: Limits::MAX_SLOTS + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TokenError::GeneralError(_))
        ));
    }

    #[test]
    fn file_backend_requires_a_usable_master_key() {
        let config = EngineConfig {
            storage: StorageConfig::File {
                directory: PathBuf::from("/var/lib/ferrotoken"),
                master_key: "c2hvcnQ=".to_string(),
            },
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TokenError::GeneralError(_))
        ));
        assert!(!format!("{:?}", config.storage).contains("c2hvcnQ"));
    }
}
