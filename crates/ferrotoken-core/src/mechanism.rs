//! Mechanism table and the dispatcher that routes a (mechanism, key) pair to an
//! algorithm path.
//!
//! The table is a sorted static slice built at compile time and never mutated,
//! so concurrent readers share it without locking. Every permission decision
//! consults it the same way instead of branching per call.

use cryptoki_sys::*;

use crate::attributes::AttributeSet;
use crate::config::Limits;
use crate::crypto::HashAlg;
use crate::error::{TokenError, TokenResult};

pub type MechanismType = CK_MECHANISM_TYPE;

/// Algorithm family a mechanism belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Digest,
    Hmac,
    AesEcb,
    AesCbc,
    AesCbcPad,
    AesGcm,
    AesKeyWrap,
    AesKeyWrapPad,
    RsaPkcs,
    RsaOaep,
    RsaPkcsHashed,
    RsaPss,
    Ecdsa,
    EcdsaHashed,
    EdDsa,
    KeyGen,
    KeyPairGen,
    EcdhDerive,
    AesEncryptData,
}

impl Family {
    pub fn is_symmetric(self) -> bool {
        matches!(
            self,
            Family::Hmac
                | Family::AesEcb
                | Family::AesCbc
                | Family::AesCbcPad
                | Family::AesGcm
                | Family::AesKeyWrap
                | Family::AesKeyWrapPad
                | Family::AesEncryptData
        )
    }
}

/// The route `select_path` picks for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationPath {
    Symmetric,
    Mac,
    AsymmetricPublic,
    AsymmetricPrivate,
}

/// What the caller intends to do with the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    SignRecover,
    VerifyRecover,
    Wrap,
    Unwrap,
    Derive,
}

impl Usage {
    pub fn flag(self) -> CK_FLAGS {
        match self {
            Usage::Encrypt => CKF_ENCRYPT,
            Usage::Decrypt => CKF_DECRYPT,
            Usage::Sign => CKF_SIGN,
            Usage::Verify => CKF_VERIFY,
            Usage::SignRecover => CKF_SIGN_RECOVER,
            Usage::VerifyRecover => CKF_VERIFY_RECOVER,
            Usage::Wrap => CKF_WRAP,
            Usage::Unwrap => CKF_UNWRAP,
            Usage::Derive => CKF_DERIVE,
        }
    }

    /// The boolean key attribute that grants this usage.
    pub fn attribute(self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Usage::Encrypt => CKA_ENCRYPT,
            Usage::Decrypt => CKA_DECRYPT,
            Usage::Sign => CKA_SIGN,
            Usage::Verify => CKA_VERIFY,
            Usage::SignRecover => CKA_SIGN_RECOVER,
            Usage::VerifyRecover => CKA_VERIFY_RECOVER,
            Usage::Wrap => CKA_WRAP,
            Usage::Unwrap => CKA_UNWRAP,
            Usage::Derive => CKA_DERIVE,
        }
    }

    fn public_side(self) -> bool {
        matches!(
            self,
            Usage::Encrypt | Usage::Verify | Usage::VerifyRecover | Usage::Wrap
        )
    }
}

#[derive(Debug)]
pub struct MechanismSpec {
    pub mechanism: MechanismType,
    pub name: &'static str,
    pub family: Family,
    pub key_types: &'static [CK_KEY_TYPE],
    pub hash: Option<HashAlg>,
    pub flags: CK_FLAGS,
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub multipart: bool,
}

const AES: &[CK_KEY_TYPE] = &[CKK_AES];
const SECRET: &[CK_KEY_TYPE] = &[CKK_GENERIC_SECRET];
const RSA: &[CK_KEY_TYPE] = &[CKK_RSA];
const EC: &[CK_KEY_TYPE] = &[CKK_EC];
const EDWARDS: &[CK_KEY_TYPE] = &[CKK_EC_EDWARDS];
const NONE: &[CK_KEY_TYPE] = &[];

const RSA_SIGN: CK_FLAGS = CKF_SIGN | CKF_VERIFY;
const CIPHER: CK_FLAGS = CKF_ENCRYPT | CKF_DECRYPT;
const WRAPPING: CK_FLAGS = CKF_WRAP | CKF_UNWRAP;
const EC_CAPS: CK_FLAGS = CKF_EC_F_P | CKF_EC_UNCOMPRESS;

macro_rules! spec {
    ($mech:ident, $family:ident, $keys:expr, $hash:expr, $flags:expr, $min:expr, $max:expr, $multi:expr) => {
        MechanismSpec {
            mechanism: $mech,
            name: stringify!($mech),
            family: Family::$family,
            key_types: $keys,
            hash: $hash,
            flags: $flags,
            min_key_size: $min,
            max_key_size: $max,
            multipart: $multi,
        }
    };
}

// Sorted by mechanism type.
static MECHANISMS: &[MechanismSpec] = &[
    spec!(CKM_RSA_PKCS_KEY_PAIR_GEN, KeyPairGen, RSA, None, CKF_GENERATE_KEY_PAIR, 1024, 4096, false),
    spec!(CKM_RSA_PKCS, RsaPkcs, RSA, None, CIPHER | RSA_SIGN | CKF_SIGN_RECOVER | CKF_VERIFY_RECOVER | WRAPPING, 1024, 4096, false),
    spec!(CKM_SHA1_RSA_PKCS, RsaPkcsHashed, RSA, Some(HashAlg::Sha1), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_RSA_PKCS_OAEP, RsaOaep, RSA, None, CIPHER | WRAPPING, 1024, 4096, false),
    spec!(CKM_SHA256_RSA_PKCS, RsaPkcsHashed, RSA, Some(HashAlg::Sha256), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_SHA384_RSA_PKCS, RsaPkcsHashed, RSA, Some(HashAlg::Sha384), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_SHA512_RSA_PKCS, RsaPkcsHashed, RSA, Some(HashAlg::Sha512), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_SHA256_RSA_PKCS_PSS, RsaPss, RSA, Some(HashAlg::Sha256), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_SHA384_RSA_PKCS_PSS, RsaPss, RSA, Some(HashAlg::Sha384), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_SHA512_RSA_PKCS_PSS, RsaPss, RSA, Some(HashAlg::Sha512), RSA_SIGN, 1024, 4096, true),
    spec!(CKM_SHA_1, Digest, NONE, Some(HashAlg::Sha1), CKF_DIGEST, 0, 0, true),
    spec!(CKM_SHA_1_HMAC, Hmac, SECRET, Some(HashAlg::Sha1), RSA_SIGN, 1, 512, true),
    spec!(CKM_SHA256, Digest, NONE, Some(HashAlg::Sha256), CKF_DIGEST, 0, 0, true),
    spec!(CKM_SHA256_HMAC, Hmac, SECRET, Some(HashAlg::Sha256), RSA_SIGN, 1, 512, true),
    spec!(CKM_SHA224, Digest, NONE, Some(HashAlg::Sha224), CKF_DIGEST, 0, 0, true),
    spec!(CKM_SHA224_HMAC, Hmac, SECRET, Some(HashAlg::Sha224), RSA_SIGN, 1, 512, true),
    spec!(CKM_SHA384, Digest, NONE, Some(HashAlg::Sha384), CKF_DIGEST, 0, 0, true),
    spec!(CKM_SHA384_HMAC, Hmac, SECRET, Some(HashAlg::Sha384), RSA_SIGN, 1, 512, true),
    spec!(CKM_SHA512, Digest, NONE, Some(HashAlg::Sha512), CKF_DIGEST, 0, 0, true),
    spec!(CKM_SHA512_HMAC, Hmac, SECRET, Some(HashAlg::Sha512), RSA_SIGN, 1, 512, true),
    spec!(CKM_GENERIC_SECRET_KEY_GEN, KeyGen, SECRET, None, CKF_GENERATE, 1, 512, false),
    spec!(CKM_EC_KEY_PAIR_GEN, KeyPairGen, EC, None, CKF_GENERATE_KEY_PAIR | EC_CAPS, 256, 384, false),
    spec!(CKM_ECDSA, Ecdsa, EC, None, RSA_SIGN | EC_CAPS, 256, 384, false),
    spec!(CKM_ECDSA_SHA1, EcdsaHashed, EC, Some(HashAlg::Sha1), RSA_SIGN | EC_CAPS, 256, 384, true),
    spec!(CKM_ECDSA_SHA224, EcdsaHashed, EC, Some(HashAlg::Sha224), RSA_SIGN | EC_CAPS, 256, 384, true),
    spec!(CKM_ECDSA_SHA256, EcdsaHashed, EC, Some(HashAlg::Sha256), RSA_SIGN | EC_CAPS, 256, 384, true),
    spec!(CKM_ECDSA_SHA384, EcdsaHashed, EC, Some(HashAlg::Sha384), RSA_SIGN | EC_CAPS, 256, 384, true),
    spec!(CKM_ECDSA_SHA512, EcdsaHashed, EC, Some(HashAlg::Sha512), RSA_SIGN | EC_CAPS, 256, 384, true),
    spec!(CKM_ECDH1_DERIVE, EcdhDerive, EC, None, CKF_DERIVE | EC_CAPS, 256, 384, false),
    spec!(CKM_EC_EDWARDS_KEY_PAIR_GEN, KeyPairGen, EDWARDS, None, CKF_GENERATE_KEY_PAIR, 256, 256, false),
    spec!(CKM_EDDSA, EdDsa, EDWARDS, None, RSA_SIGN, 256, 256, false),
    spec!(CKM_AES_KEY_GEN, KeyGen, AES, None, CKF_GENERATE, 16, 32, false),
    spec!(CKM_AES_ECB, AesEcb, AES, None, CIPHER, 16, 32, true),
    spec!(CKM_AES_CBC, AesCbc, AES, None, CIPHER, 16, 32, true),
    spec!(CKM_AES_CBC_PAD, AesCbcPad, AES, None, CIPHER | WRAPPING, 16, 32, true),
    spec!(CKM_AES_GCM, AesGcm, AES, None, CIPHER, 16, 32, true),
    spec!(CKM_AES_ECB_ENCRYPT_DATA, AesEncryptData, AES, None, CKF_DERIVE, 16, 32, false),
    spec!(CKM_AES_CBC_ENCRYPT_DATA, AesEncryptData, AES, None, CKF_DERIVE, 16, 32, false),
    spec!(CKM_AES_KEY_WRAP, AesKeyWrap, AES, None, WRAPPING, 16, 32, false),
    spec!(CKM_AES_KEY_WRAP_PAD, AesKeyWrapPad, AES, None, WRAPPING, 16, 32, false),
];

/// Resolve a mechanism identifier. Unknown mechanisms are never mapped onto a
/// default.
pub fn lookup(mechanism: MechanismType) -> TokenResult<&'static MechanismSpec> {
    MECHANISMS
        .binary_search_by_key(&mechanism, |spec| spec.mechanism)
        .map(|index| &MECHANISMS[index])
        .map_err(|_| TokenError::MechanismInvalid(mechanism))
}

pub fn supported() -> impl Iterator<Item = &'static MechanismSpec> {
    MECHANISMS.iter().take(Limits::MAX_MECHANISM_COUNT)
}

/// Pick the algorithm path for a key of `class` under `spec`.
pub fn select_path(spec: &MechanismSpec, class: CK_OBJECT_CLASS) -> TokenResult<OperationPath> {
    match (spec.family, class) {
        (Family::Hmac, CKO_SECRET_KEY) => Ok(OperationPath::Mac),
        (family, CKO_SECRET_KEY) if family.is_symmetric() => Ok(OperationPath::Symmetric),
        (family, CKO_PUBLIC_KEY) if !family.is_symmetric() => Ok(OperationPath::AsymmetricPublic),
        (family, CKO_PRIVATE_KEY) if !family.is_symmetric() => Ok(OperationPath::AsymmetricPrivate),
        _ => Err(TokenError::KeyTypeInconsistent),
    }
}

/// Decide whether `key` may be used with `spec` for `usage`. Checks run in a
/// fixed order: mechanism capability, key class, key type, usage flag, then
/// the key's allowed-mechanism list.
pub fn is_mechanism_permitted(
    spec: &MechanismSpec,
    usage: Usage,
    key: &AttributeSet,
) -> TokenResult<OperationPath> {
    if spec.flags & usage.flag() == 0 {
        return Err(TokenError::MechanismInvalid(spec.mechanism));
    }
    let class = key.ulong(CKA_CLASS).ok_or(TokenError::KeyTypeInconsistent)?;
    let path = select_path(spec, class)?;
    match path {
        OperationPath::AsymmetricPublic if !usage.public_side() => {
            return Err(TokenError::KeyTypeInconsistent);
        }
        OperationPath::AsymmetricPrivate if usage.public_side() => {
            return Err(TokenError::KeyTypeInconsistent);
        }
        _ => {}
    }
    let key_type = key.ulong(CKA_KEY_TYPE).ok_or(TokenError::KeyTypeInconsistent)?;
    if !spec.key_types.contains(&key_type) {
        return Err(TokenError::KeyTypeInconsistent);
    }
    if !key.bool_or(usage.attribute(), false) {
        return Err(TokenError::KeyFunctionNotPermitted);
    }
    if let Some(crate::attributes::AttributeValue::Mechanisms(allowed)) =
        key.get(CKA_ALLOWED_MECHANISMS)
    {
        if !allowed.is_empty() && !allowed.contains(&spec.mechanism) {
            return Err(TokenError::MechanismInvalid(spec.mechanism));
        }
    }
    Ok(path)
}

/// Mechanism together with its decoded parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism: MechanismType,
    pub params: MechanismParams,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MechanismParams {
    None,
    Iv(Vec<u8>),
    Gcm {
        iv: Vec<u8>,
        aad: Vec<u8>,
        tag_bits: usize,
    },
    Oaep {
        hash: MechanismType,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        source: CK_RSA_PKCS_OAEP_SOURCE_TYPE,
        label: Vec<u8>,
    },
    Pss {
        hash: MechanismType,
        mgf: CK_RSA_PKCS_MGF_TYPE,
        salt_len: usize,
    },
    Ecdh {
        kdf: CK_EC_KDF_TYPE,
        shared_data: Vec<u8>,
        public_data: Vec<u8>,
    },
    DeriveData(Vec<u8>),
    CbcDeriveData {
        iv: Vec<u8>,
        data: Vec<u8>,
    },
}

impl Mechanism {
    pub fn new(mechanism: MechanismType) -> Self {
        Self {
            mechanism,
            params: MechanismParams::None,
        }
    }

    pub fn with_params(mechanism: MechanismType, params: MechanismParams) -> Self {
        Self { mechanism, params }
    }

    pub fn spec(&self) -> TokenResult<&'static MechanismSpec> {
        lookup(self.mechanism)
    }

    fn buffers(&self) -> Vec<&[u8]> {
        match &self.params {
            MechanismParams::None | MechanismParams::Pss { .. } => Vec::new(),
            MechanismParams::Iv(iv) => vec![iv],
            MechanismParams::Gcm { iv, aad, .. } => vec![iv, aad],
            MechanismParams::Oaep { label, .. } => vec![label],
            MechanismParams::Ecdh {
                shared_data,
                public_data,
                ..
            } => vec![shared_data, public_data],
            MechanismParams::DeriveData(data) => vec![data],
            MechanismParams::CbcDeriveData { iv, data } => vec![iv, data],
        }
    }

    /// Check the parameter shape for this mechanism, including the length cap.
    /// Runs before any key material is touched.
    pub fn validate(&self) -> TokenResult<&'static MechanismSpec> {
        let spec = self.spec()?;
        if self
            .buffers()
            .iter()
            .any(|buffer| buffer.len() > Limits::MAX_PARAMETER_LEN)
        {
            return Err(TokenError::param("parameter exceeds length limit"));
        }
        match (spec.family, &self.params) {
            (Family::AesCbc | Family::AesCbcPad, MechanismParams::Iv(iv)) if iv.len() == 16 => {}
            (Family::AesCbc | Family::AesCbcPad, _) => {
                return Err(TokenError::param("CBC requires a 16 byte IV"));
            }
            (Family::AesGcm, MechanismParams::Gcm { iv, tag_bits, .. }) => {
                if iv.len() != 12 {
                    return Err(TokenError::param("GCM requires a 96 bit IV"));
                }
                if *tag_bits != 128 {
                    return Err(TokenError::param("GCM tag length must be 128 bits"));
                }
            }
            (Family::AesGcm, _) => return Err(TokenError::param("GCM parameters missing")),
            (Family::AesKeyWrap | Family::AesKeyWrapPad, MechanismParams::None) => {}
            (Family::AesKeyWrap | Family::AesKeyWrapPad, MechanismParams::Iv(iv)) if iv.is_empty() => {}
            (Family::AesKeyWrap | Family::AesKeyWrapPad, _) => {
                return Err(TokenError::param("custom key wrap IVs are not supported"));
            }
            (Family::RsaOaep, MechanismParams::Oaep { hash, mgf, source, label }) => {
                let digest = HashAlg::from_mechanism(*hash)
                    .ok_or_else(|| TokenError::param("unsupported OAEP hash"))?;
                if *mgf != digest.mgf() {
                    return Err(TokenError::param("OAEP MGF must match hash"));
                }
                if *source != 0 && *source != CKZ_DATA_SPECIFIED {
                    return Err(TokenError::param("unsupported OAEP source"));
                }
                if std::str::from_utf8(label).is_err() {
                    return Err(TokenError::param("OAEP label must be UTF-8"));
                }
            }
            (Family::RsaOaep, _) => return Err(TokenError::param("OAEP parameters missing")),
            (Family::RsaPss, MechanismParams::Pss { hash, mgf, .. }) => {
                let digest = HashAlg::from_mechanism(*hash)
                    .ok_or_else(|| TokenError::param("unsupported PSS hash"))?;
                if Some(digest) != spec.hash || *mgf != digest.mgf() {
                    return Err(TokenError::param("PSS hash does not match mechanism"));
                }
            }
            (Family::RsaPss, _) => return Err(TokenError::param("PSS parameters missing")),
            (Family::EcdhDerive, MechanismParams::Ecdh { kdf, public_data, .. }) => {
                if ![CKD_NULL, CKD_SHA1_KDF, CKD_SHA256_KDF].contains(kdf) {
                    return Err(TokenError::param("unsupported ECDH KDF"));
                }
                if public_data.is_empty() {
                    return Err(TokenError::param("ECDH public data missing"));
                }
            }
            (Family::EcdhDerive, _) => return Err(TokenError::param("ECDH parameters missing")),
            (Family::AesEncryptData, MechanismParams::DeriveData(data))
                if spec.mechanism == CKM_AES_ECB_ENCRYPT_DATA =>
            {
                if data.is_empty() || data.len() % 16 != 0 {
                    return Err(TokenError::param("derivation data must be whole blocks"));
                }
            }
            (Family::AesEncryptData, MechanismParams::CbcDeriveData { iv, data })
                if spec.mechanism == CKM_AES_CBC_ENCRYPT_DATA =>
            {
                if iv.len() != 16 || data.is_empty() || data.len() % 16 != 0 {
                    return Err(TokenError::param("CBC derivation data is malformed"));
                }
            }
            (Family::AesEncryptData, _) => {
                return Err(TokenError::param("derivation parameters missing"));
            }
            (_, MechanismParams::None) => {}
            _ => return Err(TokenError::param("mechanism takes no parameters")),
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;

    fn aes_key(encrypt: bool) -> AttributeSet {
        let mut attrs = AttributeSet::new();
        attrs.insert(CKA_CLASS, AttributeValue::Ulong(CKO_SECRET_KEY));
        attrs.insert(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_AES));
        attrs.insert(CKA_ENCRYPT, AttributeValue::Bool(encrypt));
        attrs.insert(CKA_DECRYPT, AttributeValue::Bool(true));
        attrs
    }

    #[test]
    fn table_is_sorted_and_unique() {
        assert!(MECHANISMS.windows(2).all(|pair| pair[0].mechanism < pair[1].mechanism));
    }

    #[test]
    fn unknown_mechanism_is_invalid() {
        assert_eq!(
            lookup(0x8000_1234).map(|spec| spec.mechanism),
            Err(TokenError::MechanismInvalid(0x8000_1234))
        );
    }

    #[test]
    fn usage_flag_gates_permission() {
        let spec = lookup(CKM_AES_CBC_PAD).expect("spec");
        assert_eq!(
            is_mechanism_permitted(spec, Usage::Encrypt, &aes_key(true)),
            Ok(OperationPath::Symmetric)
        );
        assert_eq!(
            is_mechanism_permitted(spec, Usage::Encrypt, &aes_key(false)),
            Err(TokenError::KeyFunctionNotPermitted)
        );
        assert_eq!(
            is_mechanism_permitted(spec, Usage::Sign, &aes_key(true)),
            Err(TokenError::MechanismInvalid(CKM_AES_CBC_PAD))
        );
    }

    #[test]
    fn key_class_must_match_family() {
        let spec = lookup(CKM_SHA256_RSA_PKCS).expect("spec");
        let mut attrs = aes_key(true);
        attrs.insert(CKA_SIGN, AttributeValue::Bool(true));
        assert_eq!(
            is_mechanism_permitted(spec, Usage::Sign, &attrs),
            Err(TokenError::KeyTypeInconsistent)
        );
    }

    #[test]
    fn allowed_mechanisms_restrict_use() {
        let spec = lookup(CKM_AES_ECB).expect("spec");
        let mut attrs = aes_key(true);
        attrs.insert(
            CKA_ALLOWED_MECHANISMS,
            AttributeValue::Mechanisms(vec![CKM_AES_CBC_PAD]),
        );
        assert_eq!(
            is_mechanism_permitted(spec, Usage::Encrypt, &attrs),
            Err(TokenError::MechanismInvalid(CKM_AES_ECB))
        );
    }

    #[test]
    fn parameters_are_validated_before_use() {
        let short_iv = Mechanism::with_params(CKM_AES_CBC, MechanismParams::Iv(vec![0; 8]));
        assert!(matches!(
            short_iv.validate(),
            Err(TokenError::MechanismParamInvalid(_))
        ));

        let oversized = Mechanism::with_params(
            CKM_AES_GCM,
            MechanismParams::Gcm {
                iv: vec![0; 12],
                aad: vec![0; Limits::MAX_PARAMETER_LEN + 1],
                tag_bits: 128,
            },
        );
        assert!(matches!(
            oversized.validate(),
            Err(TokenError::MechanismParamInvalid(_))
        ));

        let ecb_with_iv = Mechanism::with_params(CKM_AES_ECB, MechanismParams::Iv(vec![0; 16]));
        assert!(ecb_with_iv.validate().is_err());
        assert!(Mechanism::new(CKM_SHA256).validate().is_ok());
    }
}
