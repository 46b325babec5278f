//! Per-session crypto operation contexts and the init/update/final calls that
//! drive them.
//!
//! Every output-producing call takes the caller's buffer capacity. When the
//! capacity is absent or too small the call answers [`Output::Required`] and
//! leaves the operation untouched. Any other failure ends the operation.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use zeroize::Zeroizing;

use crate::config::Limits;
use crate::crypto::{
    AES_BLOCK, AesKey, CryptoProvider, GCM_TAG_LEN, HashAlg, Hasher, KeyMaterial, MacState,
    RsaPadding, SignScheme, gcm_open, gcm_seal, pad_block, unpad_block,
};
use crate::engine::Engine;
use crate::error::{TokenError, TokenResult};
use crate::handle::Handle;
use crate::mechanism::{self, Family, Mechanism, MechanismParams, MechanismSpec, Usage};
use crate::session::SessionEntry;

/// Result of an output-producing call: either the size the caller must
/// provide, or the produced bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Required(usize),
    Data(Vec<u8>),
}

impl Output {
    pub fn len(&self) -> usize {
        match self {
            Output::Required(len) => *len,
            Output::Data(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Output::Data(data) => Some(data),
            Output::Required(_) => None,
        }
    }
}

fn fits(required: usize, capacity: Option<usize>) -> bool {
    capacity.is_some_and(|capacity| capacity >= required)
}

/// Operation contexts of one session, one slot per category.
#[derive(Default)]
pub struct SessionOps {
    pub(crate) find: Option<FindOperation>,
    pub(crate) encrypt: Option<CipherOperation>,
    pub(crate) decrypt: Option<CipherOperation>,
    pub(crate) digest: Option<DigestOperation>,
    pub(crate) sign: Option<SignOperation>,
    pub(crate) verify: Option<SignOperation>,
}

pub(crate) struct FindOperation {
    pending: VecDeque<Handle>,
}

impl FindOperation {
    pub(crate) fn new(matches: Vec<Handle>) -> Self {
        Self {
            pending: matches.into(),
        }
    }

    pub(crate) fn next_batch(&mut self, max: usize) -> Vec<Handle> {
        let take = max.min(self.pending.len());
        self.pending.drain(..take).collect()
    }
}

/// A key captured at init. The material stays alive for as long as the
/// context holds it, even if the object is destroyed meanwhile.
pub(crate) struct BoundKey {
    pub(crate) handle: Handle,
    pub(crate) material: Arc<KeyMaterial>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    fn usage(self) -> Usage {
        match self {
            Direction::Encrypt => Usage::Encrypt,
            Direction::Decrypt => Usage::Decrypt,
        }
    }

    fn length_error(self) -> TokenError {
        match self {
            Direction::Encrypt => TokenError::DataLenRange,
            Direction::Decrypt => TokenError::EncryptedDataLenRange,
        }
    }

    fn slot(self, ops: &mut SessionOps) -> &mut Option<CipherOperation> {
        match self {
            Direction::Encrypt => &mut ops.encrypt,
            Direction::Decrypt => &mut ops.decrypt,
        }
    }
}

enum CipherMode {
    Ecb(AesKey),
    Cbc {
        cipher: AesKey,
        iv: [u8; AES_BLOCK],
        pad: bool,
    },
    Gcm {
        key: Zeroizing<Vec<u8>>,
        iv: Vec<u8>,
        aad: Vec<u8>,
    },
    Rsa(RsaPadding),
}

pub(crate) struct CipherOperation {
    direction: Direction,
    key: BoundKey,
    mode: CipherMode,
    buffer: Zeroizing<Vec<u8>>,
    multipart: bool,
    started: bool,
}

fn secret(key: &BoundKey) -> TokenResult<&[u8]> {
    key.material.secret().ok_or(TokenError::KeyTypeInconsistent)
}

fn oaep_padding(params: &MechanismParams) -> TokenResult<RsaPadding> {
    match params {
        MechanismParams::Oaep { hash, label, .. } => {
            let hash = HashAlg::from_mechanism(*hash)
                .ok_or_else(|| TokenError::param("unsupported OAEP hash"))?;
            let label = String::from_utf8(label.clone()).map_err(TokenError::param)?;
            Ok(RsaPadding::Oaep { hash, label })
        }
        _ => Err(TokenError::param("OAEP parameters missing")),
    }
}

impl CipherOperation {
    fn new(
        direction: Direction,
        mechanism: &Mechanism,
        spec: &MechanismSpec,
        key: BoundKey,
    ) -> TokenResult<Self> {
        let mode = match (spec.family, &mechanism.params) {
            (Family::AesEcb, _) => CipherMode::Ecb(AesKey::new(secret(&key)?)?),
            (Family::AesCbc | Family::AesCbcPad, MechanismParams::Iv(iv)) => CipherMode::Cbc {
                cipher: AesKey::new(secret(&key)?)?,
                iv: iv
                    .as_slice()
                    .try_into()
                    .map_err(|_| TokenError::param("CBC requires a 16 byte IV"))?,
                pad: spec.family == Family::AesCbcPad,
            },
            (Family::AesGcm, MechanismParams::Gcm { iv, aad, .. }) => CipherMode::Gcm {
                key: Zeroizing::new(secret(&key)?.to_vec()),
                iv: iv.clone(),
                aad: aad.clone(),
            },
            (Family::RsaPkcs, _) => CipherMode::Rsa(RsaPadding::Pkcs1),
            (Family::RsaOaep, params) => CipherMode::Rsa(oaep_padding(params)?),
            _ => return Err(TokenError::MechanismInvalid(spec.mechanism)),
        };
        Ok(Self {
            direction,
            key,
            mode,
            buffer: Zeroizing::new(Vec::new()),
            multipart: spec.multipart,
            started: false,
        })
    }

    fn modulus_len(&self) -> usize {
        self.key.material.modulus_len().unwrap_or(0)
    }

    fn check_input(&self, len: usize) -> TokenResult<()> {
        if len > Limits::MAX_CRYPTO_INPUT_LEN
            || self.buffer.len() + len > Limits::MAX_CRYPTO_INPUT_LEN
        {
            return Err(self.direction.length_error());
        }
        Ok(())
    }

    /// Bytes an update of `input` bytes will emit.
    fn update_len(&self, input: usize) -> usize {
        let total = self.buffer.len() + input;
        match (&self.mode, self.direction) {
            (CipherMode::Gcm { .. } | CipherMode::Rsa(_), _) => 0,
            (CipherMode::Cbc { pad: true, .. }, Direction::Decrypt) => {
                // The last full block is held back until final strips padding.
                total.saturating_sub(1) / AES_BLOCK * AES_BLOCK
            }
            _ => total / AES_BLOCK * AES_BLOCK,
        }
    }

    /// Upper bound on the bytes final will emit.
    fn final_len(&self) -> usize {
        let buffered = self.buffer.len();
        match (&self.mode, self.direction) {
            (CipherMode::Ecb(_) | CipherMode::Cbc { pad: false, .. }, _) => 0,
            (CipherMode::Cbc { pad: true, .. }, Direction::Encrypt) => AES_BLOCK,
            (CipherMode::Cbc { pad: true, .. }, Direction::Decrypt) => buffered,
            (CipherMode::Gcm { .. }, Direction::Encrypt) => buffered + GCM_TAG_LEN,
            (CipherMode::Gcm { .. }, Direction::Decrypt) => buffered.saturating_sub(GCM_TAG_LEN),
            (CipherMode::Rsa(_), _) => self.modulus_len(),
        }
    }

    /// Upper bound on the output of a single-part call.
    fn single_len(&self, input: usize) -> usize {
        match (&self.mode, self.direction) {
            (CipherMode::Cbc { pad: true, .. }, Direction::Encrypt) => {
                (input / AES_BLOCK + 1) * AES_BLOCK
            }
            (CipherMode::Gcm { .. }, Direction::Encrypt) => input + GCM_TAG_LEN,
            (CipherMode::Gcm { .. }, Direction::Decrypt) => input.saturating_sub(GCM_TAG_LEN),
            (CipherMode::Rsa(_), _) => self.modulus_len(),
            _ => input,
        }
    }

    fn update(&mut self, input: &[u8]) -> TokenResult<Vec<u8>> {
        let emit = self.update_len(input.len());
        self.buffer.extend_from_slice(input);
        let out = match (&mut self.mode, self.direction) {
            (CipherMode::Gcm { .. } | CipherMode::Rsa(_), _) => Vec::new(),
            (CipherMode::Ecb(cipher), Direction::Encrypt) => cipher.ecb_encrypt(&self.buffer[..emit]),
            (CipherMode::Ecb(cipher), Direction::Decrypt) => cipher.ecb_decrypt(&self.buffer[..emit]),
            (CipherMode::Cbc { cipher, iv, .. }, Direction::Encrypt) => {
                cipher.cbc_encrypt(iv, &self.buffer[..emit])
            }
            (CipherMode::Cbc { cipher, iv, .. }, Direction::Decrypt) => {
                cipher.cbc_decrypt(iv, &self.buffer[..emit])
            }
        };
        self.buffer.drain(..emit);
        Ok(out)
    }

    fn finish(&mut self, crypto: &dyn CryptoProvider) -> TokenResult<Vec<u8>> {
        let buffered = std::mem::take(&mut *self.buffer);
        let buffered = Zeroizing::new(buffered);
        match (&mut self.mode, self.direction) {
            (CipherMode::Ecb(_) | CipherMode::Cbc { pad: false, .. }, direction) => {
                if buffered.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(direction.length_error())
                }
            }
            (CipherMode::Cbc { cipher, iv, .. }, Direction::Encrypt) => {
                let mut block = buffered.to_vec();
                pad_block(&mut block);
                Ok(cipher.cbc_encrypt(iv, &block))
            }
            (CipherMode::Cbc { cipher, iv, .. }, Direction::Decrypt) => {
                if buffered.len() != AES_BLOCK {
                    return Err(TokenError::EncryptedDataLenRange);
                }
                unpad_block(cipher.cbc_decrypt(iv, &buffered))
            }
            (CipherMode::Gcm { key, iv, aad }, Direction::Encrypt) => {
                gcm_seal(key, iv, aad, &buffered)
            }
            (CipherMode::Gcm { key, iv, aad }, Direction::Decrypt) => {
                gcm_open(key, iv, aad, &buffered)
            }
            (CipherMode::Rsa(padding), Direction::Encrypt) => {
                crypto.encrypt(&self.key.material, padding, &buffered)
            }
            (CipherMode::Rsa(padding), Direction::Decrypt) => crypto
                .decrypt(&self.key.material, padding, &buffered)
                .map(|plain| plain.to_vec()),
        }
    }
}

pub(crate) struct DigestOperation {
    hash: HashAlg,
    hasher: Hasher,
    started: bool,
}

impl DigestOperation {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.started = true;
    }
}

enum SignMode {
    Mac {
        state: MacState,
        hash: HashAlg,
    },
    /// The token hashes the data, then signs the digest.
    Hashed {
        hasher: Hasher,
        hash: HashAlg,
        scheme: SignScheme,
    },
    /// The caller supplies the exact input in a single part.
    Raw(SignScheme),
}

/// A sign, verify, sign-recover or verify-recover context.
pub(crate) struct SignOperation {
    key: BoundKey,
    mode: SignMode,
    buffer: Zeroizing<Vec<u8>>,
    multipart: bool,
    started: bool,
    recover: bool,
}

impl SignOperation {
    fn new(
        mechanism: &Mechanism,
        spec: &MechanismSpec,
        key: BoundKey,
        recover: bool,
    ) -> TokenResult<Self> {
        let hash = || {
            spec.hash
                .ok_or(TokenError::MechanismInvalid(spec.mechanism))
        };
        let mode = match spec.family {
            Family::Hmac => SignMode::Mac {
                state: MacState::new(hash()?, secret(&key)?)?,
                hash: hash()?,
            },
            Family::RsaPkcsHashed => SignMode::Hashed {
                hasher: hash()?.hasher(),
                hash: hash()?,
                scheme: SignScheme::RsaPkcs1,
            },
            Family::RsaPss => {
                let MechanismParams::Pss { salt_len, .. } = &mechanism.params else {
                    return Err(TokenError::param("PSS parameters missing"));
                };
                let salt_len = *salt_len;
                SignMode::Hashed {
                    hasher: hash()?.hasher(),
                    hash: hash()?,
                    scheme: SignScheme::RsaPss {
                        hash: hash()?,
                        salt_len,
                    },
                }
            }
            Family::EcdsaHashed => SignMode::Hashed {
                hasher: hash()?.hasher(),
                hash: hash()?,
                scheme: SignScheme::Ecdsa,
            },
            Family::RsaPkcs => SignMode::Raw(SignScheme::RsaPkcs1),
            Family::Ecdsa => SignMode::Raw(SignScheme::Ecdsa),
            Family::EdDsa => SignMode::Raw(SignScheme::EdDsa),
            _ => return Err(TokenError::MechanismInvalid(spec.mechanism)),
        };
        Ok(Self {
            key,
            mode,
            buffer: Zeroizing::new(Vec::new()),
            multipart: spec.multipart,
            started: false,
            recover,
        })
    }

    fn signature_len(&self) -> usize {
        match &self.mode {
            SignMode::Mac { hash, .. } => hash.output_len(),
            _ => self.key.material.signature_len(),
        }
    }

    fn update(&mut self, data: &[u8]) -> TokenResult<()> {
        if !self.multipart {
            return Err(TokenError::FunctionNotSupported);
        }
        if data.len() > Limits::MAX_CRYPTO_INPUT_LEN {
            return Err(TokenError::DataLenRange);
        }
        match &mut self.mode {
            SignMode::Mac { state, .. } => state.update(data),
            SignMode::Hashed { hasher, .. } => hasher.update(data),
            SignMode::Raw(_) => return Err(TokenError::FunctionNotSupported),
        }
        self.started = true;
        Ok(())
    }

    /// Feed the whole message of a single-part call.
    fn absorb(&mut self, data: &[u8]) -> TokenResult<()> {
        if data.len() > Limits::MAX_CRYPTO_INPUT_LEN {
            return Err(TokenError::DataLenRange);
        }
        match &mut self.mode {
            SignMode::Mac { state, .. } => state.update(data),
            SignMode::Hashed { hasher, .. } => hasher.update(data),
            SignMode::Raw(_) => self.buffer.extend_from_slice(data),
        }
        Ok(())
    }

    fn prepared(self) -> (BoundKey, SignMode, Zeroizing<Vec<u8>>) {
        (self.key, self.mode, self.buffer)
    }

    fn sign(self, crypto: &dyn CryptoProvider) -> TokenResult<Vec<u8>> {
        let (key, mode, buffer) = self.prepared();
        match mode {
            SignMode::Mac { state, .. } => Ok(state.finalize()),
            SignMode::Hashed {
                hasher,
                hash,
                scheme,
            } => {
                let input = signing_input(hash, scheme, hasher.finalize());
                crypto.sign(&key.material, scheme, &input)
            }
            SignMode::Raw(scheme) => crypto.sign(&key.material, scheme, &buffer),
        }
    }

    fn verify(self, crypto: &dyn CryptoProvider, signature: &[u8]) -> TokenResult<()> {
        let (key, mode, buffer) = self.prepared();
        match mode {
            SignMode::Mac { state, hash } => {
                if signature.len() != hash.output_len() {
                    return Err(TokenError::SignatureLenRange);
                }
                if state.verify(signature) {
                    Ok(())
                } else {
                    Err(TokenError::SignatureInvalid)
                }
            }
            SignMode::Hashed {
                hasher,
                hash,
                scheme,
            } => {
                let input = signing_input(hash, scheme, hasher.finalize());
                crypto.verify(&key.material, scheme, &input, signature)
            }
            SignMode::Raw(scheme) => crypto.verify(&key.material, scheme, &buffer, signature),
        }
    }
}

fn signing_input(hash: HashAlg, scheme: SignScheme, digest: Vec<u8>) -> Vec<u8> {
    match scheme {
        SignScheme::RsaPkcs1 => hash.digest_info(&digest),
        _ => digest,
    }
}

/// Clear an operation slot when a call failed.
fn settle<T, R>(slot: &mut Option<T>, result: TokenResult<R>) -> TokenResult<R> {
    if result.is_err() {
        *slot = None;
    }
    result
}

/// Clear an operation slot unless the call was only a size query.
fn conclude<T>(slot: &mut Option<T>, result: TokenResult<Output>) -> TokenResult<Output> {
    if !matches!(result, Ok(Output::Required(_))) {
        *slot = None;
    }
    result
}

impl Engine {
    /// Resolve and authorize the key for an operation init.
    pub(crate) fn bind_key(
        &self,
        entry: &SessionEntry,
        key: Handle,
        spec: &MechanismSpec,
        usage: Usage,
    ) -> TokenResult<BoundKey> {
        let registry = self.registry.read();
        let object = registry
            .object(entry, key)
            .map_err(|_| TokenError::KeyHandleInvalid)?;
        mechanism::is_mechanism_permitted(spec, usage, &object.attributes)?;
        let material = object
            .material
            .clone()
            .ok_or(TokenError::KeyTypeInconsistent)?;
        let size = material.key_size();
        if size < spec.min_key_size || size > spec.max_key_size {
            return Err(TokenError::KeySizeRange);
        }
        Ok(BoundKey {
            handle: key,
            material,
        })
    }

    /// A destroyed key, or one the session can no longer see, ends the
    /// operation on its next step.
    fn ensure_key_live(&self, entry: &SessionEntry, key: &BoundKey) -> TokenResult<()> {
        self.registry
            .read()
            .object(entry, key.handle)
            .map(|_| ())
            .map_err(|_| TokenError::KeyHandleInvalid)
    }

    fn cipher_init(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        key: Handle,
        direction: Direction,
    ) -> TokenResult<()> {
        let spec = mechanism.validate()?;
        let entry = self.session_entry(session)?;
        if direction.slot(&mut *entry.ops()?).is_some() {
            return Err(TokenError::OperationActive);
        }
        let bound = self.bind_key(&entry, key, spec, direction.usage())?;
        let operation = CipherOperation::new(direction, mechanism, spec, bound)?;
        let mut ops = entry.ops()?;
        let slot = direction.slot(&mut ops);
        if slot.is_some() {
            return Err(TokenError::OperationActive);
        }
        *slot = Some(operation);
        debug!(session = %session, key = %key, mechanism = spec.name, ?direction, "cipher initialized");
        Ok(())
    }

    fn cipher_single(
        &self,
        session: Handle,
        direction: Direction,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let slot = direction.slot(&mut ops);
        let operation = slot.as_mut().ok_or(TokenError::OperationNotInitialized)?;
        let result = (|| -> TokenResult<Output> {
            if operation.started {
                return Err(TokenError::OperationActive);
            }
            operation.check_input(data.len())?;
            self.ensure_key_live(&entry, &operation.key)?;
            let required = operation.single_len(data.len());
            if !fits(required, capacity) {
                return Ok(Output::Required(required));
            }
            let mut out = operation.update(data)?;
            out.extend(operation.finish(self.crypto.as_ref())?);
            Ok(Output::Data(out))
        })();
        conclude(slot, result)
    }

    fn cipher_step(
        &self,
        entry: &SessionEntry,
        operation: &mut CipherOperation,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        if !operation.multipart {
            return Err(TokenError::FunctionNotSupported);
        }
        operation.check_input(data.len())?;
        self.ensure_key_live(entry, &operation.key)?;
        let required = operation.update_len(data.len());
        if !fits(required, capacity) {
            return Ok(Output::Required(required));
        }
        let out = operation.update(data)?;
        operation.started = true;
        Ok(Output::Data(out))
    }

    fn cipher_update(
        &self,
        session: Handle,
        direction: Direction,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let slot = direction.slot(&mut ops);
        let operation = slot.as_mut().ok_or(TokenError::OperationNotInitialized)?;
        let result = self.cipher_step(&entry, operation, data, capacity);
        settle(slot, result)
    }

    fn cipher_final(
        &self,
        session: Handle,
        direction: Direction,
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let slot = direction.slot(&mut ops);
        let operation = slot.as_mut().ok_or(TokenError::OperationNotInitialized)?;
        let result = (|| -> TokenResult<Output> {
            self.ensure_key_live(&entry, &operation.key)?;
            let required = operation.final_len();
            if !fits(required, capacity) {
                return Ok(Output::Required(required));
            }
            operation.finish(self.crypto.as_ref()).map(Output::Data)
        })();
        conclude(slot, result)
    }

    pub fn encrypt_init(&self, session: Handle, mechanism: &Mechanism, key: Handle) -> TokenResult<()> {
        self.cipher_init(session, mechanism, key, Direction::Encrypt)
    }

    pub fn encrypt(&self, session: Handle, data: &[u8], capacity: Option<usize>) -> TokenResult<Output> {
        self.cipher_single(session, Direction::Encrypt, data, capacity)
    }

    pub fn encrypt_update(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        self.cipher_update(session, Direction::Encrypt, data, capacity)
    }

    pub fn encrypt_final(&self, session: Handle, capacity: Option<usize>) -> TokenResult<Output> {
        self.cipher_final(session, Direction::Encrypt, capacity)
    }

    pub fn decrypt_init(&self, session: Handle, mechanism: &Mechanism, key: Handle) -> TokenResult<()> {
        self.cipher_init(session, mechanism, key, Direction::Decrypt)
    }

    pub fn decrypt(&self, session: Handle, data: &[u8], capacity: Option<usize>) -> TokenResult<Output> {
        self.cipher_single(session, Direction::Decrypt, data, capacity)
    }

    pub fn decrypt_update(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        self.cipher_update(session, Direction::Decrypt, data, capacity)
    }

    pub fn decrypt_final(&self, session: Handle, capacity: Option<usize>) -> TokenResult<Output> {
        self.cipher_final(session, Direction::Decrypt, capacity)
    }

    pub fn digest_init(&self, session: Handle, mechanism: &Mechanism) -> TokenResult<()> {
        let spec = mechanism.validate()?;
        let hash = match (spec.family, spec.hash) {
            (Family::Digest, Some(hash)) => hash,
            _ => return Err(TokenError::MechanismInvalid(spec.mechanism)),
        };
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        if ops.digest.is_some() {
            return Err(TokenError::OperationActive);
        }
        ops.digest = Some(DigestOperation {
            hash,
            hasher: hash.hasher(),
            started: false,
        });
        debug!(session = %session, mechanism = spec.name, "digest initialized");
        Ok(())
    }

    pub fn digest(&self, session: Handle, data: &[u8], capacity: Option<usize>) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .digest
            .as_ref()
            .ok_or(TokenError::OperationNotInitialized)?;
        let required = operation.hash.output_len();
        let checked = if operation.started {
            Err(TokenError::OperationActive)
        } else if data.len() > Limits::MAX_CRYPTO_INPUT_LEN {
            Err(TokenError::DataLenRange)
        } else {
            Ok(())
        };
        if let Err(err) = checked {
            ops.digest = None;
            return Err(err);
        }
        if !fits(required, capacity) {
            return Ok(Output::Required(required));
        }
        let mut operation = ops
            .digest
            .take()
            .ok_or(TokenError::OperationNotInitialized)?;
        operation.update(data);
        Ok(Output::Data(operation.hasher.finalize()))
    }

    pub fn digest_update(&self, session: Handle, data: &[u8]) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .digest
            .as_mut()
            .ok_or(TokenError::OperationNotInitialized)?;
        if data.len() > Limits::MAX_CRYPTO_INPUT_LEN {
            ops.digest = None;
            return Err(TokenError::DataLenRange);
        }
        operation.update(data);
        Ok(())
    }

    /// Feed a secret key's value into the active digest.
    pub fn digest_key(&self, session: Handle, key: Handle) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        if ops.digest.is_none() {
            return Err(TokenError::OperationNotInitialized);
        }
        let material = {
            let registry = self.registry.read();
            registry
                .object(&entry, key)
                .map_err(|_| TokenError::KeyHandleInvalid)
                .and_then(|object| {
                    object
                        .material
                        .clone()
                        .filter(|material| material.secret().is_some())
                        .ok_or(TokenError::KeyIndigestible)
                })
        };
        let result = material.map(|material| {
            if let (Some(operation), Some(value)) = (ops.digest.as_mut(), material.secret()) {
                operation.update(value);
            }
        });
        settle(&mut ops.digest, result)
    }

    pub fn digest_final(&self, session: Handle, capacity: Option<usize>) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .digest
            .as_ref()
            .ok_or(TokenError::OperationNotInitialized)?;
        let required = operation.hash.output_len();
        if !fits(required, capacity) {
            return Ok(Output::Required(required));
        }
        let operation = ops
            .digest
            .take()
            .ok_or(TokenError::OperationNotInitialized)?;
        Ok(Output::Data(operation.hasher.finalize()))
    }

    fn signature_init(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        key: Handle,
        usage: Usage,
    ) -> TokenResult<()> {
        let spec = mechanism.validate()?;
        let entry = self.session_entry(session)?;
        let verifying = matches!(usage, Usage::Verify | Usage::VerifyRecover);
        let recover = matches!(usage, Usage::SignRecover | Usage::VerifyRecover);
        {
            let ops = entry.ops()?;
            let active = if verifying { &ops.verify } else { &ops.sign };
            if active.is_some() {
                return Err(TokenError::OperationActive);
            }
        }
        let bound = self.bind_key(&entry, key, spec, usage)?;
        let operation = SignOperation::new(mechanism, spec, bound, recover)?;
        let mut ops = entry.ops()?;
        let slot = if verifying { &mut ops.verify } else { &mut ops.sign };
        if slot.is_some() {
            return Err(TokenError::OperationActive);
        }
        *slot = Some(operation);
        debug!(session = %session, key = %key, mechanism = spec.name, ?usage, "signature operation initialized");
        Ok(())
    }

    pub fn sign_init(&self, session: Handle, mechanism: &Mechanism, key: Handle) -> TokenResult<()> {
        self.signature_init(session, mechanism, key, Usage::Sign)
    }

    pub fn sign(&self, session: Handle, data: &[u8], capacity: Option<usize>) -> TokenResult<Output> {
        self.sign_single(session, data, capacity, false)
    }

    fn sign_single(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
        recover: bool,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .sign
            .as_ref()
            .filter(|operation| operation.recover == recover)
            .ok_or(TokenError::OperationNotInitialized)?;
        let checked = if operation.started {
            Err(TokenError::OperationActive)
        } else {
            self.ensure_key_live(&entry, &operation.key)
        };
        let required = operation.signature_len();
        if let Err(err) = checked {
            ops.sign = None;
            return Err(err);
        }
        if !fits(required, capacity) {
            return Ok(Output::Required(required));
        }
        let mut operation = ops.sign.take().ok_or(TokenError::OperationNotInitialized)?;
        operation.absorb(data)?;
        operation.sign(self.crypto.as_ref()).map(Output::Data)
    }

    pub fn sign_update(&self, session: Handle, data: &[u8]) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .sign
            .as_mut()
            .filter(|operation| !operation.recover)
            .ok_or(TokenError::OperationNotInitialized)?;
        let result = self
            .ensure_key_live(&entry, &operation.key)
            .and_then(|()| operation.update(data));
        settle(&mut ops.sign, result)
    }

    pub fn sign_final(&self, session: Handle, capacity: Option<usize>) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .sign
            .as_ref()
            .filter(|operation| !operation.recover)
            .ok_or(TokenError::OperationNotInitialized)?;
        let required = operation.signature_len();
        if let Err(err) = self.ensure_key_live(&entry, &operation.key) {
            ops.sign = None;
            return Err(err);
        }
        if !fits(required, capacity) {
            return Ok(Output::Required(required));
        }
        let operation = ops.sign.take().ok_or(TokenError::OperationNotInitialized)?;
        operation.sign(self.crypto.as_ref()).map(Output::Data)
    }

    pub fn sign_recover_init(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        key: Handle,
    ) -> TokenResult<()> {
        self.signature_init(session, mechanism, key, Usage::SignRecover)
    }

    pub fn sign_recover(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        self.sign_single(session, data, capacity, true)
    }

    pub fn verify_init(&self, session: Handle, mechanism: &Mechanism, key: Handle) -> TokenResult<()> {
        self.signature_init(session, mechanism, key, Usage::Verify)
    }

    pub fn verify(&self, session: Handle, data: &[u8], signature: &[u8]) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        if ops.verify.as_ref().filter(|operation| !operation.recover).is_none() {
            return Err(TokenError::OperationNotInitialized);
        }
        let mut operation = ops.verify.take().ok_or(TokenError::OperationNotInitialized)?;
        if operation.started {
            return Err(TokenError::OperationActive);
        }
        self.ensure_key_live(&entry, &operation.key)?;
        operation.absorb(data)?;
        operation.verify(self.crypto.as_ref(), signature)
    }

    pub fn verify_update(&self, session: Handle, data: &[u8]) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .verify
            .as_mut()
            .filter(|operation| !operation.recover)
            .ok_or(TokenError::OperationNotInitialized)?;
        let result = self
            .ensure_key_live(&entry, &operation.key)
            .and_then(|()| operation.update(data));
        settle(&mut ops.verify, result)
    }

    pub fn verify_final(&self, session: Handle, signature: &[u8]) -> TokenResult<()> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        if ops.verify.as_ref().filter(|operation| !operation.recover).is_none() {
            return Err(TokenError::OperationNotInitialized);
        }
        let operation = ops.verify.take().ok_or(TokenError::OperationNotInitialized)?;
        self.ensure_key_live(&entry, &operation.key)?;
        operation.verify(self.crypto.as_ref(), signature)
    }

    pub fn verify_recover_init(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        key: Handle,
    ) -> TokenResult<()> {
        self.signature_init(session, mechanism, key, Usage::VerifyRecover)
    }

    /// Recover the data embedded in a signature. A size query reports the
    /// modulus length, an upper bound on the recovered data.
    pub fn verify_recover(
        &self,
        session: Handle,
        signature: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut ops = entry.ops()?;
        let operation = ops
            .verify
            .as_ref()
            .filter(|operation| operation.recover)
            .ok_or(TokenError::OperationNotInitialized)?;
        let required = operation.signature_len();
        if let Err(err) = self.ensure_key_live(&entry, &operation.key) {
            ops.verify = None;
            return Err(err);
        }
        if !fits(required, capacity) {
            return Ok(Output::Required(required));
        }
        let operation = ops
            .verify
            .take()
            .ok_or(TokenError::OperationNotInitialized)?;
        self.crypto
            .verify_recover(&operation.key.material, signature)
            .map(Output::Data)
    }

    /// Encrypt a chunk and digest the same plaintext.
    pub fn digest_encrypt_update(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut guard = entry.ops()?;
        let ops = &mut *guard;
        let (Some(digest), Some(encrypt)) = (ops.digest.as_mut(), ops.encrypt.as_mut()) else {
            return Err(TokenError::OperationNotInitialized);
        };
        let result = self
            .cipher_step(&entry, encrypt, data, capacity)
            .inspect(|output| {
                if let Output::Data(_) = output {
                    digest.update(data);
                }
            });
        if result.is_err() {
            ops.digest = None;
            ops.encrypt = None;
        }
        result
    }

    /// Decrypt a chunk and digest the recovered plaintext.
    pub fn decrypt_digest_update(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut guard = entry.ops()?;
        let ops = &mut *guard;
        let (Some(digest), Some(decrypt)) = (ops.digest.as_mut(), ops.decrypt.as_mut()) else {
            return Err(TokenError::OperationNotInitialized);
        };
        let result = self
            .cipher_step(&entry, decrypt, data, capacity)
            .inspect(|output| {
                if let Output::Data(plain) = output {
                    digest.update(plain);
                }
            });
        if result.is_err() {
            ops.digest = None;
            ops.decrypt = None;
        }
        result
    }

    /// Encrypt a chunk and feed the same plaintext to the signature.
    pub fn sign_encrypt_update(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut guard = entry.ops()?;
        let ops = &mut *guard;
        let (Some(sign), Some(encrypt)) = (
            ops.sign.as_mut().filter(|operation| !operation.recover),
            ops.encrypt.as_mut(),
        ) else {
            return Err(TokenError::OperationNotInitialized);
        };
        let result = if sign.multipart {
            self.ensure_key_live(&entry, &sign.key)
                .and_then(|()| self.cipher_step(&entry, encrypt, data, capacity))
                .and_then(|output| {
                    if let Output::Data(_) = output {
                        sign.update(data)?;
                    }
                    Ok(output)
                })
        } else {
            Err(TokenError::FunctionNotSupported)
        };
        if result.is_err() {
            ops.sign = None;
            ops.encrypt = None;
        }
        result
    }

    /// Decrypt a chunk and feed the recovered plaintext to the verification.
    pub fn decrypt_verify_update(
        &self,
        session: Handle,
        data: &[u8],
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let entry = self.session_entry(session)?;
        let mut guard = entry.ops()?;
        let ops = &mut *guard;
        let (Some(verify), Some(decrypt)) = (
            ops.verify.as_mut().filter(|operation| !operation.recover),
            ops.decrypt.as_mut(),
        ) else {
            return Err(TokenError::OperationNotInitialized);
        };
        let result = if verify.multipart {
            self.ensure_key_live(&entry, &verify.key)
                .and_then(|()| self.cipher_step(&entry, decrypt, data, capacity))
                .and_then(|output| {
                    if let Output::Data(plain) = &output {
                        verify.update(plain)?;
                    }
                    Ok(output)
                })
        } else {
            Err(TokenError::FunctionNotSupported)
        };
        if result.is_err() {
            ops.verify = None;
            ops.decrypt = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;
    use cryptoki_sys::{CKM_AES_CBC_PAD, CKM_AES_GCM};

    fn bound(value: &[u8]) -> BoundKey {
        BoundKey {
            handle: Handle::from_raw(1),
            material: Arc::new(KeyMaterial::Secret(Zeroizing::new(value.to_vec()))),
        }
    }

    fn cbc_pad(direction: Direction) -> CipherOperation {
        let mechanism = Mechanism::with_params(CKM_AES_CBC_PAD, MechanismParams::Iv(vec![7; 16]));
        let spec = mechanism.validate().expect("spec");
        CipherOperation::new(direction, &mechanism, spec, bound(&[1; 16])).expect("operation")
    }

    #[test]
    fn cbc_pad_withholds_final_block_on_decrypt() {
        let mut encrypt = cbc_pad(Direction::Encrypt);
        let plaintext = [0x5a_u8; 37];
        assert_eq!(encrypt.single_len(plaintext.len()), 48);
        let mut ciphertext = encrypt.update(&plaintext).expect("update");
        assert_eq!(ciphertext.len(), 32);
        ciphertext.extend(encrypt.finish(&SoftwareCrypto).expect("final"));
        assert_eq!(ciphertext.len(), 48);

        let mut decrypt = cbc_pad(Direction::Decrypt);
        assert_eq!(decrypt.update_len(32), 16);
        let mut recovered = decrypt.update(&ciphertext[..32]).expect("update");
        assert_eq!(recovered.len(), 16);
        recovered.extend(decrypt.update(&ciphertext[32..]).expect("update"));
        assert_eq!(decrypt.final_len(), 16);
        recovered.extend(decrypt.finish(&SoftwareCrypto).expect("final"));
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn gcm_buffers_until_final() {
        let mechanism = Mechanism::with_params(
            CKM_AES_GCM,
            MechanismParams::Gcm {
                iv: vec![3; 12],
                aad: b"header".to_vec(),
                tag_bits: 128,
            },
        );
        let spec = mechanism.validate().expect("spec");
        let mut encrypt =
            CipherOperation::new(Direction::Encrypt, &mechanism, spec, bound(&[2; 32])).expect("op");
        assert!(encrypt.update(b"streamed ").expect("update").is_empty());
        assert!(encrypt.update(b"payload").expect("update").is_empty());
        assert_eq!(encrypt.final_len(), 16 + GCM_TAG_LEN);
        let sealed = encrypt.finish(&SoftwareCrypto).expect("final");

        let mut decrypt =
            CipherOperation::new(Direction::Decrypt, &mechanism, spec, bound(&[2; 32])).expect("op");
        decrypt.update(&sealed).expect("update");
        assert_eq!(
            decrypt.finish(&SoftwareCrypto).expect("final"),
            b"streamed payload".to_vec()
        );
    }

    #[test]
    fn find_batches_drain_in_order() {
        let handles: Vec<Handle> = (1..=5).map(Handle::from_raw).collect();
        let mut find = FindOperation::new(handles.clone());
        let mut seen = find.next_batch(2);
        seen.extend(find.next_batch(10));
        assert_eq!(seen, handles);
        assert!(find.next_batch(1).is_empty());
    }

    #[test]
    fn output_reports_length() {
        assert_eq!(Output::Required(48).len(), 48);
        assert_eq!(Output::Data(vec![1, 2]).into_data(), Some(vec![1, 2]));
        assert!(Output::Data(Vec::new()).is_empty());
    }
}
