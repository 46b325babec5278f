//! Attestation hook. A platform may plug in a provider that produces a quote
//! over report data; the engine only ever hands it a public-key digest.

use tracing::info;

use crate::crypto::HashAlg;
use crate::engine::Engine;
use crate::error::{TokenError, TokenResult};
use crate::handle::Handle;
use crate::operation::Output;

pub trait QuoteProvider: Send + Sync {
    /// Produce an opaque attestation blob binding `report_data`.
    fn quote(&self, report_data: &[u8]) -> TokenResult<Vec<u8>>;
}

impl Engine {
    /// Return the key's public encoding followed by a quote over its SHA-256
    /// digest.
    pub fn attest_public_key(
        &self,
        session: Handle,
        key: Handle,
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let provider = self.quote.as_ref().ok_or(TokenError::FunctionNotSupported)?;
        let encoding = {
            let registry = self.registry.read();
            let entry = registry.session(session)?;
            let object = registry
                .object(entry, key)
                .map_err(|_| TokenError::KeyHandleInvalid)?;
            object
                .material
                .as_ref()
                .ok_or(TokenError::KeyHandleInvalid)?
                .public_encoding()?
        };
        let quote = provider.quote(&HashAlg::Sha256.digest(&encoding))?;
        let required = encoding.len() + quote.len();
        if !capacity.is_some_and(|capacity| capacity >= required) {
            return Ok(Output::Required(required));
        }
        let mut out = encoding;
        out.extend_from_slice(&quote);
        info!(session = %session, key = %key, "public key attested");
        Ok(Output::Data(out))
    }
}
