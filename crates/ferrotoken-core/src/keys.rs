//! Key lifecycle: generation, wrap and unwrap, derivation.
//!
//! Material is produced outside the registry lock; the objects are checked
//! and inserted under a single write lock so a failed pair insert leaves
//! nothing behind.

use std::sync::Arc;

use cryptoki_sys::*;
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::attributes::{AttributeTemplate, AttributeValue};
use crate::crypto::{
    AES_BLOCK, AesKey, Curve, HashAlg, KeyMaterial, RsaPadding, aes_key_unwrap,
    aes_key_unwrap_pad, aes_key_wrap, aes_key_wrap_pad, is_ed25519_params, pad_block, unpad_block,
};
use crate::engine::Engine;
use crate::error::{TokenError, TokenResult};
use crate::handle::Handle;
use crate::mechanism::{self, Family, Mechanism, MechanismParams, MechanismSpec, Usage};
use crate::object::{self, NewObject, Origin, Owner};
use crate::operation::Output;
use crate::session::SessionEntry;

const DEFAULT_PUBLIC_EXPONENT: &[u8] = &[0x01, 0x00, 0x01];
const MAX_GENERIC_SECRET_LEN: CK_ULONG = 512;

fn secret_len(key_type: CK_KEY_TYPE, len: CK_ULONG) -> TokenResult<usize> {
    let valid = match key_type {
        CKK_AES => matches!(len, 16 | 24 | 32),
        _ => (1..=MAX_GENERIC_SECRET_LEN).contains(&len),
    };
    if valid {
        Ok(len as usize)
    } else {
        Err(TokenError::KeySizeRange)
    }
}

fn template_key_type(template: &AttributeTemplate, default: CK_KEY_TYPE) -> TokenResult<CK_KEY_TYPE> {
    let key_type = template.ulong(CKA_KEY_TYPE).unwrap_or(default);
    match key_type {
        CKK_AES | CKK_GENERIC_SECRET => Ok(key_type),
        _ => Err(TokenError::TemplateInconsistent),
    }
}

fn owner_for(new: &NewObject, session: Handle) -> Owner {
    if new.is_token() {
        Owner::Token
    } else {
        Owner::Session(session)
    }
}

/// ANSI X9.63 KDF: concatenated `H(Z || counter || shared_info)` blocks.
fn x963_kdf(hash: HashAlg, z: &[u8], shared_info: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(len + hash.output_len()));
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut hasher = hash.hasher();
        hasher.update(z);
        hasher.update(&counter.to_be_bytes());
        hasher.update(shared_info);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn wrapped_error(err: TokenError) -> TokenError {
    match err {
        TokenError::EncryptedDataLenRange | TokenError::WrappedKeyLenRange => {
            TokenError::WrappedKeyLenRange
        }
        TokenError::MechanismParamInvalid(message) => TokenError::MechanismParamInvalid(message),
        _ => TokenError::WrappedKeyInvalid,
    }
}

fn iv_param(mechanism: &Mechanism) -> TokenResult<[u8; AES_BLOCK]> {
    match &mechanism.params {
        MechanismParams::Iv(iv) => iv
            .as_slice()
            .try_into()
            .map_err(|_| TokenError::param("CBC requires a 16 byte IV")),
        _ => Err(TokenError::param("CBC requires a 16 byte IV")),
    }
}

fn rsa_padding(mechanism: &Mechanism, spec: &MechanismSpec) -> TokenResult<RsaPadding> {
    match (spec.family, &mechanism.params) {
        (Family::RsaPkcs, _) => Ok(RsaPadding::Pkcs1),
        (Family::RsaOaep, MechanismParams::Oaep { hash, label, .. }) => {
            let hash = HashAlg::from_mechanism(*hash)
                .ok_or_else(|| TokenError::param("unsupported OAEP hash"))?;
            let label = String::from_utf8(label.clone()).map_err(TokenError::param)?;
            Ok(RsaPadding::Oaep { hash, label })
        }
        _ => Err(TokenError::param("OAEP parameters missing")),
    }
}

impl Engine {
    /// Check write access before spending time on key material.
    fn precheck_write(&self, entry: &SessionEntry, token: bool, private: bool) -> TokenResult<()> {
        self.registry.read().check_write(entry, token, private)
    }

    fn store_new(&self, session: Handle, entry: &SessionEntry, new: NewObject) -> TokenResult<Handle> {
        let mut registry = self.registry.write();
        registry.session(session)?;
        registry.check_write(entry, new.is_token(), new.is_private())?;
        let owner = owner_for(&new, session);
        registry
            .objects
            .insert(entry.slot, owner, new.attributes, new.material.map(Arc::new))
    }

    pub fn generate_key(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        template: &AttributeTemplate,
    ) -> TokenResult<Handle> {
        let spec = mechanism.validate()?;
        if spec.family != Family::KeyGen {
            return Err(TokenError::MechanismInvalid(spec.mechanism));
        }
        let key_type = match spec.mechanism {
            CKM_AES_KEY_GEN => CKK_AES,
            _ => CKK_GENERIC_SECRET,
        };
        if template.ulong(CKA_CLASS).is_some_and(|class| class != CKO_SECRET_KEY) {
            return Err(TokenError::TemplateInconsistent);
        }
        let len = template
            .ulong(CKA_VALUE_LEN)
            .ok_or(TokenError::TemplateIncomplete)?;
        let len = secret_len(key_type, len)?;

        let entry = self.session_entry(session)?;
        self.precheck_write(
            &entry,
            template.bool(CKA_TOKEN).unwrap_or(false),
            template.bool(CKA_PRIVATE).unwrap_or(true),
        )?;

        let mut value = Zeroizing::new(vec![0u8; len]);
        self.random.fill(&mut value)?;
        let new = object::new_key(
            CKO_SECRET_KEY,
            key_type,
            template,
            KeyMaterial::Secret(value),
            Origin::Generated(spec.mechanism),
        )?;
        let handle = self.store_new(session, &entry, new)?;
        info!(session = %session, key = %handle, mechanism = spec.name, "secret key generated");
        Ok(handle)
    }

    pub fn generate_key_pair(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        public_template: &AttributeTemplate,
        private_template: &AttributeTemplate,
    ) -> TokenResult<(Handle, Handle)> {
        let spec = mechanism.validate()?;
        if spec.family != Family::KeyPairGen {
            return Err(TokenError::MechanismInvalid(spec.mechanism));
        }
        let entry = self.session_entry(session)?;
        self.precheck_write(
            &entry,
            public_template.bool(CKA_TOKEN).unwrap_or(false),
            public_template.bool(CKA_PRIVATE).unwrap_or(false),
        )?;
        self.precheck_write(
            &entry,
            private_template.bool(CKA_TOKEN).unwrap_or(false),
            private_template.bool(CKA_PRIVATE).unwrap_or(true),
        )?;

        let (key_type, material) = match spec.mechanism {
            CKM_RSA_PKCS_KEY_PAIR_GEN => {
                let bits = public_template
                    .ulong(CKA_MODULUS_BITS)
                    .ok_or(TokenError::TemplateIncomplete)?;
                if bits < spec.min_key_size || bits > spec.max_key_size {
                    return Err(TokenError::KeySizeRange);
                }
                let exponent = public_template
                    .bytes(CKA_PUBLIC_EXPONENT)
                    .unwrap_or(DEFAULT_PUBLIC_EXPONENT);
                (CKK_RSA, self.crypto.generate_rsa(bits as usize, exponent)?)
            }
            CKM_EC_KEY_PAIR_GEN => {
                let params = public_template
                    .bytes(CKA_EC_PARAMS)
                    .ok_or(TokenError::TemplateIncomplete)?;
                let curve = Curve::from_params(params)?;
                (CKK_EC, self.crypto.generate_ec(curve)?)
            }
            _ => {
                if public_template
                    .bytes(CKA_EC_PARAMS)
                    .is_some_and(|params| !is_ed25519_params(params))
                {
                    return Err(TokenError::CurveNotSupported);
                }
                (CKK_EC_EDWARDS, self.crypto.generate_ed25519()?)
            }
        };

        let origin = Origin::Generated(spec.mechanism);
        let public = object::new_key(
            CKO_PUBLIC_KEY,
            key_type,
            public_template,
            material.public()?,
            origin,
        )?;
        let private = object::new_key(CKO_PRIVATE_KEY, key_type, private_template, material, origin)?;

        let mut registry = self.registry.write();
        registry.session(session)?;
        registry.check_write(&entry, public.is_token(), public.is_private())?;
        registry.check_write(&entry, private.is_token(), private.is_private())?;
        let public_owner = owner_for(&public, session);
        let private_owner = owner_for(&private, session);
        let public_handle = registry.objects.insert(
            entry.slot,
            public_owner,
            public.attributes,
            public.material.map(Arc::new),
        )?;
        let private_handle = match registry.objects.insert(
            entry.slot,
            private_owner,
            private.attributes,
            private.material.map(Arc::new),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                // The pair is created together or not at all.
                if let Err(rollback) = registry.objects.remove(public_handle) {
                    error!(
                        public = %public_handle,
                        cause = %err,
                        error = %rollback,
                        "key pair rollback failed, public half left behind"
                    );
                    return Err(TokenError::GeneralError(format!(
                        "key pair rollback failed: {rollback}"
                    )));
                }
                return Err(err);
            }
        };
        info!(
            session = %session,
            public = %public_handle,
            private = %private_handle,
            mechanism = spec.name,
            "key pair generated"
        );
        Ok((public_handle, private_handle))
    }

    /// Export `key` encrypted under `wrapping`. Secret keys travel as their
    /// raw value, private keys as PKCS#8.
    pub fn wrap_key(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        wrapping: Handle,
        key: Handle,
        capacity: Option<usize>,
    ) -> TokenResult<Output> {
        let spec = mechanism.validate()?;
        let entry = self.session_entry(session)?;
        let (wrapping_material, payload) = {
            let registry = self.registry.read();
            let wrapper = registry
                .object(&entry, wrapping)
                .map_err(|_| TokenError::WrappingKeyHandleInvalid)?;
            mechanism::is_mechanism_permitted(spec, Usage::Wrap, &wrapper.attributes)?;
            let wrapping_material = wrapper
                .material
                .clone()
                .ok_or(TokenError::WrappingKeyHandleInvalid)?;
            let target = registry
                .object(&entry, key)
                .map_err(|_| TokenError::KeyHandleInvalid)?;
            let material = target.material.as_ref().ok_or(TokenError::KeyHandleInvalid)?;
            if !target.attributes.bool_or(CKA_EXTRACTABLE, true) {
                return Err(TokenError::KeyUnextractable);
            }
            if target.attributes.bool_or(CKA_WRAP_WITH_TRUSTED, false)
                && !wrapper.attributes.bool_or(CKA_TRUSTED, false)
            {
                return Err(TokenError::KeyUnextractable);
            }
            let payload = match (target.class(), material.secret()) {
                (CKO_SECRET_KEY, Some(value)) => Zeroizing::new(value.to_vec()),
                (CKO_PRIVATE_KEY, _) if !matches!(spec.family, Family::RsaPkcs | Family::RsaOaep) => {
                    material.to_pkcs8()?
                }
                _ => return Err(TokenError::KeyUnextractable),
            };
            (wrapping_material, payload)
        };

        let wrapped = match spec.family {
            Family::AesKeyWrap | Family::AesKeyWrapPad | Family::AesCbcPad => {
                let kek = AesKey::new(
                    wrapping_material
                        .secret()
                        .ok_or(TokenError::KeyTypeInconsistent)?,
                )?;
                match spec.family {
                    Family::AesKeyWrap => {
                        // RFC 3394 only takes whole 64 bit blocks; the fault lies with the key.
                        if payload.len() < 16 || payload.len() % 8 != 0 {
                            return Err(TokenError::KeySizeRange);
                        }
                        aes_key_wrap(&kek, &payload)?
                    }
                    Family::AesKeyWrapPad => aes_key_wrap_pad(&kek, &payload)?,
                    _ => {
                        let mut iv = iv_param(mechanism)?;
                        let mut padded = Zeroizing::new(payload.to_vec());
                        pad_block(&mut padded);
                        kek.cbc_encrypt(&mut iv, &padded)
                    }
                }
            }
            Family::RsaPkcs | Family::RsaOaep => {
                let padding = rsa_padding(mechanism, spec)?;
                self.crypto.encrypt(&wrapping_material, &padding, &payload)?
            }
            _ => return Err(TokenError::MechanismInvalid(spec.mechanism)),
        };
        if capacity.is_some_and(|capacity| capacity >= wrapped.len()) {
            info!(session = %session, key = %key, wrapping = %wrapping, mechanism = spec.name, "key wrapped");
            Ok(Output::Data(wrapped))
        } else {
            Ok(Output::Required(wrapped.len()))
        }
    }

    /// Import a wrapped key as a new object described by `template`.
    pub fn unwrap_key(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        unwrapping: Handle,
        wrapped: &[u8],
        template: &AttributeTemplate,
    ) -> TokenResult<Handle> {
        let spec = mechanism.validate()?;
        let class = template
            .ulong(CKA_CLASS)
            .ok_or(TokenError::TemplateIncomplete)?;
        let key_type = template
            .ulong(CKA_KEY_TYPE)
            .ok_or(TokenError::TemplateIncomplete)?;
        if !matches!(class, CKO_SECRET_KEY | CKO_PRIVATE_KEY) {
            return Err(TokenError::TemplateInconsistent);
        }
        if wrapped.is_empty() {
            return Err(TokenError::WrappedKeyLenRange);
        }
        let entry = self.session_entry(session)?;
        let unwrapping_material = {
            let registry = self.registry.read();
            let unwrapper = registry
                .object(&entry, unwrapping)
                .map_err(|_| TokenError::UnwrappingKeyHandleInvalid)?;
            mechanism::is_mechanism_permitted(spec, Usage::Unwrap, &unwrapper.attributes)?;
            unwrapper
                .material
                .clone()
                .ok_or(TokenError::UnwrappingKeyHandleInvalid)?
        };
        self.precheck_write(
            &entry,
            template.bool(CKA_TOKEN).unwrap_or(false),
            template.bool(CKA_PRIVATE).unwrap_or(true),
        )?;

        let plain = match spec.family {
            Family::AesKeyWrap | Family::AesKeyWrapPad | Family::AesCbcPad => {
                let kek = AesKey::new(
                    unwrapping_material
                        .secret()
                        .ok_or(TokenError::KeyTypeInconsistent)?,
                )?;
                match spec.family {
                    Family::AesKeyWrap => aes_key_unwrap(&kek, wrapped).map_err(wrapped_error)?,
                    Family::AesKeyWrapPad => {
                        aes_key_unwrap_pad(&kek, wrapped).map_err(wrapped_error)?
                    }
                    _ => {
                        if wrapped.len() % AES_BLOCK != 0 {
                            return Err(TokenError::WrappedKeyLenRange);
                        }
                        let mut iv = iv_param(mechanism)?;
                        let decrypted = kek.cbc_decrypt(&mut iv, wrapped);
                        Zeroizing::new(unpad_block(decrypted).map_err(wrapped_error)?)
                    }
                }
            }
            Family::RsaPkcs | Family::RsaOaep => {
                if class != CKO_SECRET_KEY {
                    return Err(TokenError::TemplateInconsistent);
                }
                let padding = rsa_padding(mechanism, spec)?;
                self.crypto
                    .decrypt(&unwrapping_material, &padding, wrapped)
                    .map_err(wrapped_error)?
            }
            _ => return Err(TokenError::MechanismInvalid(spec.mechanism)),
        };

        let material = if class == CKO_SECRET_KEY {
            let mut value = plain;
            if let Some(len) = template.ulong(CKA_VALUE_LEN) {
                let len = len as usize;
                if len > value.len() {
                    return Err(TokenError::TemplateInconsistent);
                }
                value.truncate(len);
            }
            secret_len(template_key_type(template, CKK_GENERIC_SECRET)?, value.len() as CK_ULONG)
                .map_err(|_| TokenError::WrappedKeyInvalid)?;
            KeyMaterial::Secret(value)
        } else {
            KeyMaterial::from_pkcs8(key_type, &plain)?
        };
        let new = object::new_key(class, key_type, template, material, Origin::Unwrapped)?;
        let handle = self.store_new(session, &entry, new)?;
        info!(session = %session, key = %handle, unwrapping = %unwrapping, mechanism = spec.name, "key unwrapped");
        Ok(handle)
    }

    /// Derive a secret key from `base`. The new key's value never leaves the
    /// engine except through its own attributes.
    pub fn derive_key(
        &self,
        session: Handle,
        mechanism: &Mechanism,
        base: Handle,
        template: &AttributeTemplate,
    ) -> TokenResult<Handle> {
        let spec = mechanism.validate()?;
        if template
            .ulong(CKA_CLASS)
            .is_some_and(|class| class != CKO_SECRET_KEY)
        {
            return Err(TokenError::TemplateInconsistent);
        }
        let key_type = template_key_type(template, CKK_GENERIC_SECRET)?;
        let entry = self.session_entry(session)?;
        let bound = self.bind_key(&entry, base, spec, Usage::Derive)?;
        let (base_always_sensitive, base_never_extractable) = {
            let registry = self.registry.read();
            registry
                .object(&entry, base)
                .map(|object| {
                    (
                        object.attributes.bool_or(CKA_ALWAYS_SENSITIVE, false),
                        object.attributes.bool_or(CKA_NEVER_EXTRACTABLE, false),
                    )
                })
                .map_err(|_| TokenError::KeyHandleInvalid)?
        };
        self.precheck_write(
            &entry,
            template.bool(CKA_TOKEN).unwrap_or(false),
            template.bool(CKA_PRIVATE).unwrap_or(true),
        )?;

        let requested = template.ulong(CKA_VALUE_LEN);
        let value = match (spec.family, &mechanism.params) {
            (
                Family::EcdhDerive,
                MechanismParams::Ecdh {
                    kdf,
                    shared_data,
                    public_data,
                },
            ) => {
                let shared = self.crypto.ecdh(&bound.material, public_data)?;
                let natural = match key_type {
                    CKK_AES => shared.len().min(32) as CK_ULONG,
                    _ => shared.len() as CK_ULONG,
                };
                let len = secret_len(key_type, requested.unwrap_or(natural))?;
                match *kdf {
                    CKD_NULL => {
                        if !shared_data.is_empty() {
                            return Err(TokenError::param("null KDF takes no shared data"));
                        }
                        if len > shared.len() {
                            return Err(TokenError::KeySizeRange);
                        }
                        Zeroizing::new(shared[..len].to_vec())
                    }
                    CKD_SHA1_KDF => x963_kdf(HashAlg::Sha1, &shared, shared_data, len),
                    CKD_SHA256_KDF => x963_kdf(HashAlg::Sha256, &shared, shared_data, len),
                    _ => return Err(TokenError::param("unsupported KDF")),
                }
            }
            (Family::AesEncryptData, params) => {
                let cipher = AesKey::new(bound.material.secret().ok_or(TokenError::KeyTypeInconsistent)?)?;
                let encrypted = match (spec.mechanism, params) {
                    (CKM_AES_ECB_ENCRYPT_DATA, MechanismParams::DeriveData(data))
                        if !data.is_empty() && data.len() % AES_BLOCK == 0 =>
                    {
                        Zeroizing::new(cipher.ecb_encrypt(data))
                    }
                    (CKM_AES_CBC_ENCRYPT_DATA, MechanismParams::CbcDeriveData { iv, data })
                        if !data.is_empty() && data.len() % AES_BLOCK == 0 =>
                    {
                        let mut iv: [u8; AES_BLOCK] = iv
                            .as_slice()
                            .try_into()
                            .map_err(|_| TokenError::param("CBC requires a 16 byte IV"))?;
                        Zeroizing::new(cipher.cbc_encrypt(&mut iv, data))
                    }
                    _ => return Err(TokenError::param("derivation data must be whole blocks")),
                };
                let len = secret_len(key_type, requested.unwrap_or(encrypted.len() as CK_ULONG))?;
                if len > encrypted.len() {
                    return Err(TokenError::KeySizeRange);
                }
                Zeroizing::new(encrypted[..len].to_vec())
            }
            _ => return Err(TokenError::MechanismInvalid(spec.mechanism)),
        };

        let mut new = object::new_key(
            CKO_SECRET_KEY,
            key_type,
            template,
            KeyMaterial::Secret(value),
            Origin::Derived,
        )?;
        // A derived key can only keep a lifecycle guarantee its base key had.
        if !base_always_sensitive {
            new.attributes
                .insert(CKA_ALWAYS_SENSITIVE, AttributeValue::Bool(false));
        }
        if !base_never_extractable {
            new.attributes
                .insert(CKA_NEVER_EXTRACTABLE, AttributeValue::Bool(false));
        }
        let handle = self.store_new(session, &entry, new)?;
        info!(session = %session, base = %base, key = %handle, mechanism = spec.name, "key derived");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x963_kdf_stretches_across_blocks() {
        let out = x963_kdf(HashAlg::Sha256, b"shared", b"info", 40);
        assert_eq!(out.len(), 40);
        let mut first = HashAlg::Sha256.hasher();
        first.update(b"shared");
        first.update(&1u32.to_be_bytes());
        first.update(b"info");
        assert_eq!(&out[..32], first.finalize().as_slice());
    }

    #[test]
    fn secret_lengths_follow_key_type() {
        assert_eq!(secret_len(CKK_AES, 24), Ok(24));
        assert_eq!(secret_len(CKK_AES, 20), Err(TokenError::KeySizeRange));
        assert_eq!(secret_len(CKK_GENERIC_SECRET, 0), Err(TokenError::KeySizeRange));
        assert_eq!(secret_len(CKK_GENERIC_SECRET, 512), Ok(512));
    }

    #[test]
    fn unwrap_failures_are_reported_as_wrapped_key_errors() {
        assert_eq!(
            wrapped_error(TokenError::EncryptedDataInvalid),
            TokenError::WrappedKeyInvalid
        );
        assert_eq!(
            wrapped_error(TokenError::EncryptedDataLenRange),
            TokenError::WrappedKeyLenRange
        );
    }
}
