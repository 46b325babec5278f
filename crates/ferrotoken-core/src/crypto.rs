//! Primitive cryptography consumed by the engine.
//!
//! The engine sequences operations and enforces policy; the math itself is
//! delegated to RustCrypto crates through [`CryptoProvider`] for asymmetric
//! work and a handful of small helpers for digests, HMAC and AES.

use ::rand::RngCore;
use ::rand::rngs::OsRng;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, Payload, consts::U12},
};
use cryptoki_sys::*;
use hmac::{Hmac, Mac};
use rsa::{
    BigUint, Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    traits::{PrivateKeyParts, PublicKeyParts},
};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::attributes::{AttributeSet, AttributeType, AttributeValue};
use crate::error::{TokenError, TokenResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// Map a digest mechanism (`CKM_SHA*`) onto the algorithm.
    pub fn from_mechanism(mechanism: CK_MECHANISM_TYPE) -> Option<Self> {
        match mechanism {
            CKM_SHA_1 => Some(Self::Sha1),
            CKM_SHA224 => Some(Self::Sha224),
            CKM_SHA256 => Some(Self::Sha256),
            CKM_SHA384 => Some(Self::Sha384),
            CKM_SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    pub fn mgf(self) -> CK_RSA_PKCS_MGF_TYPE {
        match self {
            Self::Sha1 => CKG_MGF1_SHA1,
            Self::Sha224 => CKG_MGF1_SHA224,
            Self::Sha256 => CKG_MGF1_SHA256,
            Self::Sha384 => CKG_MGF1_SHA384,
            Self::Sha512 => CKG_MGF1_SHA512,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(Sha1::new()),
            Self::Sha224 => Hasher::Sha224(Sha224::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha384 => Hasher::Sha384(Sha384::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// DER prefix of the PKCS#1 `DigestInfo` for this hash.
    pub fn digest_info_prefix(self) -> &'static [u8] {
        match self {
            Self::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04,
                0x14,
            ],
            Self::Sha224 => &[
                0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x04, 0x05, 0x00, 0x04, 0x1c,
            ],
            Self::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            Self::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            Self::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// Wrap a digest into a `DigestInfo` structure.
    pub fn digest_info(self, digest: &[u8]) -> Vec<u8> {
        let mut info = self.digest_info_prefix().to_vec();
        info.extend_from_slice(digest);
        info
    }
}

/// Streaming digest state.
#[derive(Clone)]
pub enum Hasher {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => Digest::update(h, data),
            Self::Sha224(h) => Digest::update(h, data),
            Self::Sha256(h) => Digest::update(h, data),
            Self::Sha384(h) => Digest::update(h, data),
            Self::Sha512(h) => Digest::update(h, data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha224(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Streaming HMAC state.
#[derive(Clone)]
pub enum MacState {
    Sha1(Hmac<Sha1>),
    Sha224(Hmac<Sha224>),
    Sha256(Hmac<Sha256>),
    Sha384(Hmac<Sha384>),
    Sha512(Hmac<Sha512>),
}

impl MacState {
    pub fn new(hash: HashAlg, key: &[u8]) -> TokenResult<Self> {
        let bad_key = |_| TokenError::KeySizeRange;
        Ok(match hash {
            HashAlg::Sha1 => Self::Sha1(<Hmac<Sha1> as Mac>::new_from_slice(key).map_err(bad_key)?),
            HashAlg::Sha224 => Self::Sha224(<Hmac<Sha224> as Mac>::new_from_slice(key).map_err(bad_key)?),
            HashAlg::Sha256 => Self::Sha256(<Hmac<Sha256> as Mac>::new_from_slice(key).map_err(bad_key)?),
            HashAlg::Sha384 => Self::Sha384(<Hmac<Sha384> as Mac>::new_from_slice(key).map_err(bad_key)?),
            HashAlg::Sha512 => Self::Sha512(<Hmac<Sha512> as Mac>::new_from_slice(key).map_err(bad_key)?),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(m) => m.update(data),
            Self::Sha224(m) => m.update(data),
            Self::Sha256(m) => m.update(data),
            Self::Sha384(m) => m.update(data),
            Self::Sha512(m) => m.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(m) => m.finalize().into_bytes().to_vec(),
            Self::Sha224(m) => m.finalize().into_bytes().to_vec(),
            Self::Sha256(m) => m.finalize().into_bytes().to_vec(),
            Self::Sha384(m) => m.finalize().into_bytes().to_vec(),
            Self::Sha512(m) => m.finalize().into_bytes().to_vec(),
        }
    }

    /// Constant-time tag comparison.
    pub fn verify(self, tag: &[u8]) -> bool {
        let computed = self.finalize();
        computed.len() == tag.len() && bool::from(computed.ct_eq(tag))
    }
}

pub const AES_BLOCK: usize = 16;

/// An expanded AES key of any supported length.
#[derive(Clone)]
pub enum AesKey {
    Aes128(aes::Aes128),
    Aes192(aes::Aes192),
    Aes256(aes::Aes256),
}

impl AesKey {
    pub fn new(key: &[u8]) -> TokenResult<Self> {
        let bad_key = |_| TokenError::KeySizeRange;
        match key.len() {
            16 => Ok(Self::Aes128(aes::Aes128::new_from_slice(key).map_err(bad_key)?)),
            24 => Ok(Self::Aes192(aes::Aes192::new_from_slice(key).map_err(bad_key)?)),
            32 => Ok(Self::Aes256(aes::Aes256::new_from_slice(key).map_err(bad_key)?)),
            _ => Err(TokenError::KeySizeRange),
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8; AES_BLOCK]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(cipher) => cipher.encrypt_block(block),
            Self::Aes192(cipher) => cipher.encrypt_block(block),
            Self::Aes256(cipher) => cipher.encrypt_block(block),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8; AES_BLOCK]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(cipher) => cipher.decrypt_block(block),
            Self::Aes192(cipher) => cipher.decrypt_block(block),
            Self::Aes256(cipher) => cipher.decrypt_block(block),
        }
    }

    /// Encrypt whole blocks in CBC mode, chaining through `iv`.
    pub fn cbc_encrypt(&self, iv: &mut [u8; AES_BLOCK], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(AES_BLOCK) {
            let mut block = *iv;
            block.iter_mut().zip(chunk).for_each(|(b, d)| *b ^= d);
            self.encrypt_block(&mut block);
            out.extend_from_slice(&block);
            *iv = block;
        }
        out
    }

    pub fn cbc_decrypt(&self, iv: &mut [u8; AES_BLOCK], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(AES_BLOCK) {
            let mut block = [0u8; AES_BLOCK];
            block.copy_from_slice(chunk);
            let next_iv = block;
            self.decrypt_block(&mut block);
            block.iter_mut().zip(iv.iter()).for_each(|(b, v)| *b ^= v);
            out.extend_from_slice(&block);
            *iv = next_iv;
        }
        out
    }

    pub fn ecb_encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(AES_BLOCK) {
            let mut block = [0u8; AES_BLOCK];
            block.copy_from_slice(chunk);
            self.encrypt_block(&mut block);
            out.extend_from_slice(&block);
        }
        out
    }

    pub fn ecb_decrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(AES_BLOCK) {
            let mut block = [0u8; AES_BLOCK];
            block.copy_from_slice(chunk);
            self.decrypt_block(&mut block);
            out.extend_from_slice(&block);
        }
        out
    }
}

/// Append PKCS#7 padding up to the next block boundary.
pub fn pad_block(data: &mut Vec<u8>) {
    let pad = AES_BLOCK - data.len() % AES_BLOCK;
    data.extend(std::iter::repeat_n(pad as u8, pad));
}

/// Strip PKCS#7 padding, rejecting malformed trailers.
pub fn unpad_block(mut data: Vec<u8>) -> TokenResult<Vec<u8>> {
    let pad = *data.last().ok_or(TokenError::EncryptedDataLenRange)? as usize;
    if pad == 0 || pad > AES_BLOCK || pad > data.len() {
        return Err(TokenError::EncryptedDataInvalid);
    }
    if !data[data.len() - pad..].iter().all(|byte| *byte as usize == pad) {
        return Err(TokenError::EncryptedDataInvalid);
    }
    data.truncate(data.len() - pad);
    Ok(data)
}

pub const GCM_TAG_LEN: usize = 16;

pub fn gcm_seal(key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> TokenResult<Vec<u8>> {
    if iv.len() != 12 {
        return Err(TokenError::param("GCM requires a 96 bit IV"));
    }
    let nonce = Nonce::from_slice(iv);
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let sealed = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| TokenError::KeySizeRange)?
            .encrypt(nonce, payload),
        24 => AesGcm::<aes::Aes192, U12>::new_from_slice(key)
            .map_err(|_| TokenError::KeySizeRange)?
            .encrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| TokenError::KeySizeRange)?
            .encrypt(nonce, payload),
        _ => return Err(TokenError::KeySizeRange),
    };
    sealed.map_err(TokenError::crypto)
}

pub fn gcm_open(key: &[u8], iv: &[u8], aad: &[u8], ciphertext: &[u8]) -> TokenResult<Vec<u8>> {
    if ciphertext.len() < GCM_TAG_LEN {
        return Err(TokenError::EncryptedDataLenRange);
    }
    if iv.len() != 12 {
        return Err(TokenError::param("GCM requires a 96 bit IV"));
    }
    let nonce = Nonce::from_slice(iv);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let opened = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| TokenError::KeySizeRange)?
            .decrypt(nonce, payload),
        24 => AesGcm::<aes::Aes192, U12>::new_from_slice(key)
            .map_err(|_| TokenError::KeySizeRange)?
            .decrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| TokenError::KeySizeRange)?
            .decrypt(nonce, payload),
        _ => return Err(TokenError::KeySizeRange),
    };
    opened.map_err(|_| TokenError::EncryptedDataInvalid)
}

const KW_IV: [u8; 8] = [0xa6; 8];
const KWP_MAGIC: [u8; 4] = [0xa6, 0x59, 0x59, 0xa6];

fn kw_wrap_core(key: &AesKey, iv: [u8; 8], plaintext: &[u8]) -> Vec<u8> {
    let n = plaintext.len() / 8;
    let mut a = iv;
    let mut r: Vec<[u8; 8]> = plaintext
        .chunks_exact(8)
        .map(|chunk| {
            let mut block = [0u8; 8];
            block.copy_from_slice(chunk);
            block
        })
        .collect();
    for j in 0..6 {
        for i in 0..n {
            let mut block = [0u8; AES_BLOCK];
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&r[i]);
            key.encrypt_block(&mut block);
            let t = (n * j + i + 1) as u64;
            a.copy_from_slice(&block[..8]);
            a.iter_mut().zip(t.to_be_bytes()).for_each(|(x, y)| *x ^= y);
            r[i].copy_from_slice(&block[8..]);
        }
    }
    let mut out = a.to_vec();
    r.iter().for_each(|block| out.extend_from_slice(block));
    out
}

fn kw_unwrap_core(key: &AesKey, wrapped: &[u8]) -> ([u8; 8], Zeroizing<Vec<u8>>) {
    let n = wrapped.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&wrapped[..8]);
    let mut r: Vec<[u8; 8]> = wrapped[8..]
        .chunks_exact(8)
        .map(|chunk| {
            let mut block = [0u8; 8];
            block.copy_from_slice(chunk);
            block
        })
        .collect();
    for j in (0..6).rev() {
        for i in (0..n).rev() {
            let t = (n * j + i + 1) as u64;
            let mut block = [0u8; AES_BLOCK];
            block[..8].copy_from_slice(&a);
            block[..8]
                .iter_mut()
                .zip(t.to_be_bytes())
                .for_each(|(x, y)| *x ^= y);
            block[8..].copy_from_slice(&r[i]);
            key.decrypt_block(&mut block);
            a.copy_from_slice(&block[..8]);
            r[i].copy_from_slice(&block[8..]);
        }
    }
    let mut plaintext = Zeroizing::new(Vec::with_capacity(n * 8));
    r.iter().for_each(|block| plaintext.extend_from_slice(block));
    (a, plaintext)
}

/// RFC 3394 key wrap. Input must be at least two 64-bit blocks.
pub fn aes_key_wrap(key: &AesKey, plaintext: &[u8]) -> TokenResult<Vec<u8>> {
    if plaintext.len() < 16 || plaintext.len() % 8 != 0 {
        return Err(TokenError::DataLenRange);
    }
    Ok(kw_wrap_core(key, KW_IV, plaintext))
}

pub fn aes_key_unwrap(key: &AesKey, wrapped: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(TokenError::WrappedKeyLenRange);
    }
    let (a, plaintext) = kw_unwrap_core(key, wrapped);
    if !bool::from(a.ct_eq(&KW_IV)) {
        return Err(TokenError::WrappedKeyInvalid);
    }
    Ok(plaintext)
}

/// RFC 5649 key wrap with padding.
pub fn aes_key_wrap_pad(key: &AesKey, plaintext: &[u8]) -> TokenResult<Vec<u8>> {
    if plaintext.is_empty() || plaintext.len() > u32::MAX as usize {
        return Err(TokenError::DataLenRange);
    }
    let mut iv = [0u8; 8];
    iv[..4].copy_from_slice(&KWP_MAGIC);
    iv[4..].copy_from_slice(&(plaintext.len() as u32).to_be_bytes());
    let mut padded = Zeroizing::new(plaintext.to_vec());
    padded.resize(plaintext.len().div_ceil(8) * 8, 0);
    if padded.len() == 8 {
        let mut block = [0u8; AES_BLOCK];
        block[..8].copy_from_slice(&iv);
        block[8..].copy_from_slice(&padded);
        key.encrypt_block(&mut block);
        return Ok(block.to_vec());
    }
    Ok(kw_wrap_core(key, iv, &padded))
}

pub fn aes_key_unwrap_pad(key: &AesKey, wrapped: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
    if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
        return Err(TokenError::WrappedKeyLenRange);
    }
    let (a, mut padded) = if wrapped.len() == 16 {
        let mut block = [0u8; AES_BLOCK];
        block.copy_from_slice(wrapped);
        key.decrypt_block(&mut block);
        let mut a = [0u8; 8];
        a.copy_from_slice(&block[..8]);
        (a, Zeroizing::new(block[8..].to_vec()))
    } else {
        kw_unwrap_core(key, wrapped)
    };
    if !bool::from(a[..4].ct_eq(&KWP_MAGIC)) {
        return Err(TokenError::WrappedKeyInvalid);
    }
    let length = u32::from_be_bytes([a[4], a[5], a[6], a[7]]) as usize;
    if length == 0 || length > padded.len() || padded.len() - length >= 8 {
        return Err(TokenError::WrappedKeyInvalid);
    }
    if padded[length..].iter().any(|byte| *byte != 0) {
        return Err(TokenError::WrappedKeyInvalid);
    }
    padded.truncate(length);
    Ok(padded)
}

/// Named curves supported for EC keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    P256,
    P384,
}

const P256_OID: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const P384_OID: &[u8] = &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22];
/// DER OID 1.3.101.112 used as `CKA_EC_PARAMS` for Ed25519 keys.
pub const ED25519_OID: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x70];
const ED25519_NAME: &[u8] = b"\x13\x0cedwards25519";

impl Curve {
    pub fn from_params(params: &[u8]) -> TokenResult<Self> {
        match params {
            P256_OID => Ok(Self::P256),
            P384_OID => Ok(Self::P384),
            _ => Err(TokenError::CurveNotSupported),
        }
    }

    pub fn params(self) -> &'static [u8] {
        match self {
            Self::P256 => P256_OID,
            Self::P384 => P384_OID,
        }
    }

    pub fn field_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    pub fn bits(self) -> CK_ULONG {
        (self.field_len() * 8) as CK_ULONG
    }
}

pub fn is_ed25519_params(params: &[u8]) -> bool {
    params == ED25519_OID || params == ED25519_NAME
}

/// Wrap a point in a DER OCTET STRING, the `CKA_EC_POINT` encoding.
pub fn der_octet_string(point: &[u8]) -> Vec<u8> {
    let mut out = vec![0x04];
    if point.len() < 0x80 {
        out.push(point.len() as u8);
    } else {
        out.push(0x81);
        out.push(point.len() as u8);
    }
    out.extend_from_slice(point);
    out
}

/// Accept either a raw point or one wrapped in a DER OCTET STRING.
pub fn unwrap_point(bytes: &[u8], raw_len: usize) -> TokenResult<&[u8]> {
    if bytes.len() == raw_len {
        return Ok(bytes);
    }
    match bytes {
        [0x04, len, rest @ ..] if *len as usize == rest.len() && rest.len() == raw_len => Ok(rest),
        [0x04, 0x81, len, rest @ ..] if *len as usize == rest.len() && rest.len() == raw_len => {
            Ok(rest)
        }
        _ => Err(TokenError::AttributeValueInvalid(CKA_EC_POINT)),
    }
}

fn uncompressed_len(curve: Curve) -> usize {
    1 + 2 * curve.field_len()
}

/// Decoded key material held beside an object's attributes.
pub enum KeyMaterial {
    Secret(Zeroizing<Vec<u8>>),
    RsaPrivate(Box<RsaPrivateKey>),
    RsaPublic(RsaPublicKey),
    EcPrivate {
        curve: Curve,
        scalar: Zeroizing<Vec<u8>>,
    },
    EcPublic {
        curve: Curve,
        point: Vec<u8>,
    },
    EdPrivate(Zeroizing<[u8; 32]>),
    EdPublic([u8; 32]),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Secret(_) => "Secret",
            Self::RsaPrivate(_) => "RsaPrivate",
            Self::RsaPublic(_) => "RsaPublic",
            Self::EcPrivate { .. } => "EcPrivate",
            Self::EcPublic { .. } => "EcPublic",
            Self::EdPrivate(_) => "EdPrivate",
            Self::EdPublic(_) => "EdPublic",
        };
        f.debug_tuple("KeyMaterial").field(&kind).finish()
    }
}

fn big(bytes: &BigUint) -> Vec<u8> {
    bytes.to_bytes_be()
}

fn left_pad(bytes: Vec<u8>, len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes;
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

fn required(attrs: &AttributeSet, id: AttributeType) -> TokenResult<&[u8]> {
    attrs.bytes(id).ok_or(TokenError::TemplateIncomplete)
}

impl KeyMaterial {
    pub fn class(&self) -> CK_OBJECT_CLASS {
        match self {
            Self::Secret(_) => CKO_SECRET_KEY,
            Self::RsaPublic(_) | Self::EcPublic { .. } | Self::EdPublic(_) => CKO_PUBLIC_KEY,
            _ => CKO_PRIVATE_KEY,
        }
    }

    pub fn secret(&self) -> Option<&[u8]> {
        match self {
            Self::Secret(value) => Some(value),
            _ => None,
        }
    }

    /// Key length in bytes for secrets, in bits for asymmetric keys.
    pub fn key_size(&self) -> CK_ULONG {
        match self {
            Self::Secret(value) => value.len() as CK_ULONG,
            Self::RsaPrivate(key) => (key.size() * 8) as CK_ULONG,
            Self::RsaPublic(key) => (key.size() * 8) as CK_ULONG,
            Self::EcPrivate { curve, .. } | Self::EcPublic { curve, .. } => curve.bits(),
            Self::EdPrivate(_) | Self::EdPublic(_) => 256,
        }
    }

    /// Public counterpart of a private key; public keys return a copy.
    pub fn public(&self) -> TokenResult<KeyMaterial> {
        match self {
            Self::Secret(_) => Err(TokenError::KeyTypeInconsistent),
            Self::RsaPrivate(key) => Ok(Self::RsaPublic(key.to_public_key())),
            Self::RsaPublic(key) => Ok(Self::RsaPublic(key.clone())),
            Self::EcPrivate { curve, scalar } => Ok(Self::EcPublic {
                curve: *curve,
                point: ec_public_point(*curve, scalar)?,
            }),
            Self::EcPublic { curve, point } => Ok(Self::EcPublic {
                curve: *curve,
                point: point.clone(),
            }),
            Self::EdPrivate(seed) => Ok(Self::EdPublic(
                ed25519_dalek::SigningKey::from_bytes(seed)
                    .verifying_key()
                    .to_bytes(),
            )),
            Self::EdPublic(bytes) => Ok(Self::EdPublic(*bytes)),
        }
    }

    /// Length of a signature produced with this key.
    pub fn signature_len(&self) -> usize {
        match self {
            Self::RsaPrivate(key) => key.size(),
            Self::RsaPublic(key) => key.size(),
            Self::EcPrivate { curve, .. } | Self::EcPublic { curve, .. } => 2 * curve.field_len(),
            Self::EdPrivate(_) | Self::EdPublic(_) => 64,
            Self::Secret(_) => 0,
        }
    }

    pub fn modulus_len(&self) -> Option<usize> {
        match self {
            Self::RsaPrivate(key) => Some(key.size()),
            Self::RsaPublic(key) => Some(key.size()),
            _ => None,
        }
    }

    /// Attributes anyone may read.
    pub fn public_attributes(&self) -> Vec<(AttributeType, AttributeValue)> {
        let bytes = |value: Vec<u8>| AttributeValue::Bytes(value);
        match self {
            Self::Secret(value) => vec![(CKA_VALUE_LEN, AttributeValue::Ulong(value.len() as CK_ULONG))],
            Self::RsaPrivate(key) => vec![
                (CKA_MODULUS, bytes(big(key.n()))),
                (CKA_PUBLIC_EXPONENT, bytes(big(key.e()))),
            ],
            Self::RsaPublic(key) => vec![
                (CKA_MODULUS, bytes(big(key.n()))),
                (CKA_PUBLIC_EXPONENT, bytes(big(key.e()))),
                (CKA_MODULUS_BITS, AttributeValue::Ulong((key.size() * 8) as CK_ULONG)),
            ],
            Self::EcPrivate { curve, .. } => vec![(CKA_EC_PARAMS, bytes(curve.params().to_vec()))],
            Self::EcPublic { curve, point } => vec![
                (CKA_EC_PARAMS, bytes(curve.params().to_vec())),
                (CKA_EC_POINT, bytes(der_octet_string(point))),
            ],
            Self::EdPrivate(_) => vec![(CKA_EC_PARAMS, bytes(ED25519_OID.to_vec()))],
            Self::EdPublic(point) => vec![
                (CKA_EC_PARAMS, bytes(ED25519_OID.to_vec())),
                (CKA_EC_POINT, bytes(der_octet_string(point))),
            ],
        }
    }

    /// Attributes withheld from sensitive or non-extractable keys.
    pub fn sensitive_attributes(&self) -> Vec<(AttributeType, AttributeValue)> {
        let bytes = |value: Vec<u8>| AttributeValue::Bytes(value);
        match self {
            Self::Secret(value) => vec![(CKA_VALUE, bytes(value.to_vec()))],
            Self::RsaPrivate(key) => {
                let mut attrs = vec![(CKA_PRIVATE_EXPONENT, bytes(big(key.d())))];
                let primes = key.primes();
                if primes.len() == 2 {
                    attrs.push((CKA_PRIME_1, bytes(big(&primes[0]))));
                    attrs.push((CKA_PRIME_2, bytes(big(&primes[1]))));
                }
                if let Some(dp) = key.dp() {
                    attrs.push((CKA_EXPONENT_1, bytes(big(dp))));
                }
                if let Some(dq) = key.dq() {
                    attrs.push((CKA_EXPONENT_2, bytes(big(dq))));
                }
                if let Some(qinv) = key.qinv() {
                    attrs.push((CKA_COEFFICIENT, bytes(qinv.to_bytes_be().1)));
                }
                attrs
            }
            Self::EcPrivate { scalar, .. } => vec![(CKA_VALUE, bytes(scalar.to_vec()))],
            Self::EdPrivate(seed) => vec![(CKA_VALUE, bytes(seed.to_vec()))],
            _ => Vec::new(),
        }
    }

    /// Build key material from a creation template.
    pub fn from_attributes(
        class: CK_OBJECT_CLASS,
        key_type: CK_KEY_TYPE,
        attrs: &AttributeSet,
    ) -> TokenResult<KeyMaterial> {
        match (class, key_type) {
            (CKO_SECRET_KEY, _) => {
                let value = required(attrs, CKA_VALUE)?;
                Ok(Self::Secret(Zeroizing::new(value.to_vec())))
            }
            (CKO_PUBLIC_KEY, CKK_RSA) => {
                let n = BigUint::from_bytes_be(required(attrs, CKA_MODULUS)?);
                let e = BigUint::from_bytes_be(required(attrs, CKA_PUBLIC_EXPONENT)?);
                RsaPublicKey::new(n, e)
                    .map(Self::RsaPublic)
                    .map_err(|_| TokenError::AttributeValueInvalid(CKA_MODULUS))
            }
            (CKO_PRIVATE_KEY, CKK_RSA) => {
                let component = |id| required(attrs, id).map(BigUint::from_bytes_be);
                let primes = vec![component(CKA_PRIME_1)?, component(CKA_PRIME_2)?];
                let mut key = RsaPrivateKey::from_components(
                    component(CKA_MODULUS)?,
                    component(CKA_PUBLIC_EXPONENT)?,
                    component(CKA_PRIVATE_EXPONENT)?,
                    primes,
                )
                .map_err(|_| TokenError::AttributeValueInvalid(CKA_PRIVATE_EXPONENT))?;
                key.validate()
                    .map_err(|_| TokenError::AttributeValueInvalid(CKA_PRIVATE_EXPONENT))?;
                key.precompute().map_err(TokenError::crypto)?;
                Ok(Self::RsaPrivate(Box::new(key)))
            }
            (CKO_PUBLIC_KEY, CKK_EC) => {
                let curve = Curve::from_params(required(attrs, CKA_EC_PARAMS)?)?;
                let point = unwrap_point(required(attrs, CKA_EC_POINT)?, uncompressed_len(curve))?;
                ec_check_point(curve, point)?;
                Ok(Self::EcPublic {
                    curve,
                    point: point.to_vec(),
                })
            }
            (CKO_PRIVATE_KEY, CKK_EC) => {
                let curve = Curve::from_params(required(attrs, CKA_EC_PARAMS)?)?;
                let scalar = required(attrs, CKA_VALUE)?;
                let scalar = Zeroizing::new(left_pad(scalar.to_vec(), curve.field_len()));
                ec_public_point(curve, &scalar)
                    .map_err(|_| TokenError::AttributeValueInvalid(CKA_VALUE))?;
                Ok(Self::EcPrivate { curve, scalar })
            }
            (CKO_PUBLIC_KEY, CKK_EC_EDWARDS) => {
                if !is_ed25519_params(required(attrs, CKA_EC_PARAMS)?) {
                    return Err(TokenError::CurveNotSupported);
                }
                let point = unwrap_point(required(attrs, CKA_EC_POINT)?, 32)?;
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(point);
                ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|_| TokenError::AttributeValueInvalid(CKA_EC_POINT))?;
                Ok(Self::EdPublic(bytes))
            }
            (CKO_PRIVATE_KEY, CKK_EC_EDWARDS) => {
                if !is_ed25519_params(required(attrs, CKA_EC_PARAMS)?) {
                    return Err(TokenError::CurveNotSupported);
                }
                let seed: [u8; 32] = required(attrs, CKA_VALUE)?
                    .try_into()
                    .map_err(|_| TokenError::AttributeValueInvalid(CKA_VALUE))?;
                Ok(Self::EdPrivate(Zeroizing::new(seed)))
            }
            (CKO_PUBLIC_KEY | CKO_PRIVATE_KEY, _) => {
                Err(TokenError::AttributeValueInvalid(CKA_KEY_TYPE))
            }
            _ => Err(TokenError::AttributeValueInvalid(CKA_CLASS)),
        }
    }

    /// DER encoding used when a key is hashed for attestation: the
    /// SubjectPublicKeyInfo for RSA and the raw point for EC curves.
    pub fn public_encoding(&self) -> TokenResult<Vec<u8>> {
        match self.public()? {
            Self::RsaPublic(key) => key
                .to_public_key_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(TokenError::crypto),
            Self::EcPublic { point, .. } => Ok(point),
            Self::EdPublic(bytes) => Ok(bytes.to_vec()),
            _ => Err(TokenError::KeyTypeInconsistent),
        }
    }

    /// Serialise a private key as PKCS#8 DER for wrapping.
    pub fn to_pkcs8(&self) -> TokenResult<Zeroizing<Vec<u8>>> {
        let document = match self {
            Self::RsaPrivate(key) => key.to_pkcs8_der(),
            Self::EcPrivate { curve: Curve::P256, scalar } => p256::SecretKey::from_slice(scalar)
                .map_err(TokenError::crypto)?
                .to_pkcs8_der(),
            Self::EcPrivate { curve: Curve::P384, scalar } => p384::SecretKey::from_slice(scalar)
                .map_err(TokenError::crypto)?
                .to_pkcs8_der(),
            Self::EdPrivate(seed) => ed25519_dalek::SigningKey::from_bytes(seed).to_pkcs8_der(),
            _ => return Err(TokenError::KeyTypeInconsistent),
        };
        document
            .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
            .map_err(TokenError::crypto)
    }

    pub fn from_pkcs8(key_type: CK_KEY_TYPE, der: &[u8]) -> TokenResult<KeyMaterial> {
        fn invalid<E>(_: E) -> TokenError {
            TokenError::WrappedKeyInvalid
        }
        match key_type {
            CKK_RSA => Ok(Self::RsaPrivate(Box::new(
                RsaPrivateKey::from_pkcs8_der(der).map_err(invalid)?,
            ))),
            CKK_EC => {
                if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
                    return Ok(Self::EcPrivate {
                        curve: Curve::P256,
                        scalar: Zeroizing::new(key.to_bytes().to_vec()),
                    });
                }
                let key = p384::SecretKey::from_pkcs8_der(der).map_err(invalid)?;
                Ok(Self::EcPrivate {
                    curve: Curve::P384,
                    scalar: Zeroizing::new(key.to_bytes().to_vec()),
                })
            }
            CKK_EC_EDWARDS => {
                let key = ed25519_dalek::SigningKey::from_pkcs8_der(der).map_err(invalid)?;
                Ok(Self::EdPrivate(Zeroizing::new(key.to_bytes())))
            }
            _ => Err(TokenError::TemplateInconsistent),
        }
    }

    /// Plaintext storage encoding of the material. Callers encrypt it with a
    /// [`StorageKey`] before it leaves the process.
    pub fn encode(&self) -> TokenResult<EncodedMaterial> {
        let (kind, curve, bytes) = match self {
            Self::Secret(value) => (MaterialKind::Secret, None, Zeroizing::new(value.to_vec())),
            Self::RsaPrivate(_) | Self::EdPrivate(_) => {
                let kind = if matches!(self, Self::RsaPrivate(_)) {
                    MaterialKind::RsaPrivate
                } else {
                    MaterialKind::EdPrivate
                };
                (kind, None, self.to_pkcs8()?)
            }
            Self::RsaPublic(key) => (
                MaterialKind::RsaPublic,
                None,
                Zeroizing::new(
                    key.to_public_key_der()
                        .map_err(TokenError::crypto)?
                        .as_bytes()
                        .to_vec(),
                ),
            ),
            Self::EcPrivate { curve, scalar } => {
                (MaterialKind::EcPrivate, Some(*curve), Zeroizing::new(scalar.to_vec()))
            }
            Self::EcPublic { curve, point } => {
                (MaterialKind::EcPublic, Some(*curve), Zeroizing::new(point.clone()))
            }
            Self::EdPublic(bytes) => (MaterialKind::EdPublic, None, Zeroizing::new(bytes.to_vec())),
        };
        Ok(EncodedMaterial { kind, curve, bytes })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Secret,
    RsaPrivate,
    RsaPublic,
    EcPrivate,
    EcPublic,
    EdPrivate,
    EdPublic,
}

pub struct EncodedMaterial {
    pub kind: MaterialKind,
    pub curve: Option<Curve>,
    pub bytes: Zeroizing<Vec<u8>>,
}

impl EncodedMaterial {
    pub fn decode(&self) -> TokenResult<KeyMaterial> {
        use rsa::pkcs8::DecodePublicKey;

        fn corrupt<E>(_: E) -> TokenError {
            TokenError::device("stored key material is corrupt")
        }
        let curve = || self.curve.ok_or_else(|| TokenError::device("stored EC key lacks a curve"));
        match self.kind {
            MaterialKind::Secret => Ok(KeyMaterial::Secret(self.bytes.clone())),
            MaterialKind::RsaPrivate => Ok(KeyMaterial::RsaPrivate(Box::new(
                RsaPrivateKey::from_pkcs8_der(&self.bytes).map_err(corrupt)?,
            ))),
            MaterialKind::RsaPublic => Ok(KeyMaterial::RsaPublic(
                RsaPublicKey::from_public_key_der(&self.bytes).map_err(corrupt)?,
            )),
            MaterialKind::EcPrivate => Ok(KeyMaterial::EcPrivate {
                curve: curve()?,
                scalar: self.bytes.clone(),
            }),
            MaterialKind::EcPublic => Ok(KeyMaterial::EcPublic {
                curve: curve()?,
                point: self.bytes.to_vec(),
            }),
            MaterialKind::EdPrivate => {
                let key = ed25519_dalek::SigningKey::from_pkcs8_der(&self.bytes).map_err(corrupt)?;
                Ok(KeyMaterial::EdPrivate(Zeroizing::new(key.to_bytes())))
            }
            MaterialKind::EdPublic => {
                let bytes: [u8; 32] = self
                    .bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| TokenError::device("stored key material is corrupt"))?;
                Ok(KeyMaterial::EdPublic(bytes))
            }
        }
    }
}

/// AES-256-GCM key that protects token key material at rest.
pub struct StorageKey(Zeroizing<[u8; StorageKey::LEN]>);

impl StorageKey {
    pub const LEN: usize = 32;
    const NONCE_LEN: usize = 12;

    pub fn from_bytes(bytes: &[u8]) -> TokenResult<Self> {
        let key: [u8; Self::LEN] = bytes.try_into().map_err(|_| {
            TokenError::GeneralError(format!(
                "master key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(Zeroizing::new(key)))
    }

    /// Decode a base64 key as written in configuration.
    pub fn from_base64(encoded: &str) -> TokenResult<Self> {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let bytes = STANDARD
            .decode(encoded.trim())
            .map(Zeroizing::new)
            .map_err(|_| TokenError::GeneralError("master key is not valid base64".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// A throwaway key for stores whose contents die with the process.
    pub fn random(random: &dyn RandomSource) -> TokenResult<Self> {
        let mut key = Zeroizing::new([0u8; Self::LEN]);
        random.fill(&mut key[..])?;
        Ok(Self(key))
    }

    /// Encrypt `plaintext` bound to `context`. Returns the nonce and the
    /// ciphertext with its tag.
    pub fn seal(
        &self,
        random: &dyn RandomSource,
        context: &[u8],
        plaintext: &[u8],
    ) -> TokenResult<(Vec<u8>, Vec<u8>)> {
        let mut nonce = vec![0u8; Self::NONCE_LEN];
        random.fill(&mut nonce)?;
        let ciphertext = gcm_seal(&self.0[..], &nonce, context, plaintext)?;
        Ok((nonce, ciphertext))
    }

    pub fn open(&self, nonce: &[u8], context: &[u8], ciphertext: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        gcm_open(&self.0[..], nonce, context, ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| TokenError::device("stored key material failed authentication"))
    }
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StorageKey(..)")
    }
}

fn ec_public_point(curve: Curve, scalar: &[u8]) -> TokenResult<Vec<u8>> {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    match curve {
        Curve::P256 => Ok(p256::SecretKey::from_slice(scalar)
            .map_err(TokenError::crypto)?
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()),
        Curve::P384 => Ok(p384::SecretKey::from_slice(scalar)
            .map_err(TokenError::crypto)?
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()),
    }
}

fn ec_check_point(curve: Curve, point: &[u8]) -> TokenResult<()> {
    let valid = match curve {
        Curve::P256 => p256::PublicKey::from_sec1_bytes(point).is_ok(),
        Curve::P384 => p384::PublicKey::from_sec1_bytes(point).is_ok(),
    };
    if valid {
        Ok(())
    } else {
        Err(TokenError::AttributeValueInvalid(CKA_EC_POINT))
    }
}

/// Fit a digest to the curve order width: shorter digests are left padded,
/// longer ones keep their leftmost bytes.
fn ecdsa_prehash(curve: Curve, digest: &[u8]) -> Vec<u8> {
    let width = curve.field_len();
    if digest.len() >= width {
        digest[..width].to_vec()
    } else {
        left_pad(digest.to_vec(), width)
    }
}

/// How `sign`/`verify` treat their input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignScheme {
    /// PKCS#1 v1.5 type 1 padding around caller-prepared data.
    RsaPkcs1,
    /// RSASSA-PSS over a digest.
    RsaPss { hash: HashAlg, salt_len: usize },
    /// ECDSA over a digest.
    Ecdsa,
    /// Pure Ed25519 over the whole message.
    EdDsa,
}

/// RSA encryption padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RsaPadding {
    Pkcs1,
    Oaep { hash: HashAlg, label: String },
}

impl RsaPadding {
    /// Largest plaintext accepted for a modulus of `k` bytes.
    pub fn max_input(&self, k: usize) -> usize {
        match self {
            Self::Pkcs1 => k.saturating_sub(11),
            Self::Oaep { hash, .. } => k.saturating_sub(2 * hash.output_len() + 2),
        }
    }

    fn oaep(hash: HashAlg, label: &str) -> Oaep {
        let label = label.to_string();
        match (hash, label.is_empty()) {
            (HashAlg::Sha1, true) => Oaep::new::<Sha1>(),
            (HashAlg::Sha224, true) => Oaep::new::<Sha224>(),
            (HashAlg::Sha256, true) => Oaep::new::<Sha256>(),
            (HashAlg::Sha384, true) => Oaep::new::<Sha384>(),
            (HashAlg::Sha512, true) => Oaep::new::<Sha512>(),
            (HashAlg::Sha1, false) => Oaep::new_with_label::<Sha1, _>(label),
            (HashAlg::Sha224, false) => Oaep::new_with_label::<Sha224, _>(label),
            (HashAlg::Sha256, false) => Oaep::new_with_label::<Sha256, _>(label),
            (HashAlg::Sha384, false) => Oaep::new_with_label::<Sha384, _>(label),
            (HashAlg::Sha512, false) => Oaep::new_with_label::<Sha512, _>(label),
        }
    }
}

fn pss(hash: HashAlg, salt_len: usize) -> Pss {
    match hash {
        HashAlg::Sha1 => Pss::new_with_salt::<Sha1>(salt_len),
        HashAlg::Sha224 => Pss::new_with_salt::<Sha224>(salt_len),
        HashAlg::Sha256 => Pss::new_with_salt::<Sha256>(salt_len),
        HashAlg::Sha384 => Pss::new_with_salt::<Sha384>(salt_len),
        HashAlg::Sha512 => Pss::new_with_salt::<Sha512>(salt_len),
    }
}

/// Asymmetric primitive library the engine calls into.
pub trait CryptoProvider: Send + Sync {
    fn generate_rsa(&self, bits: usize, public_exponent: &[u8]) -> TokenResult<KeyMaterial>;

    fn generate_ec(&self, curve: Curve) -> TokenResult<KeyMaterial>;

    fn generate_ed25519(&self) -> TokenResult<KeyMaterial>;

    fn sign(&self, key: &KeyMaterial, scheme: SignScheme, input: &[u8]) -> TokenResult<Vec<u8>>;

    /// Succeeds only for a valid signature.
    fn verify(
        &self,
        key: &KeyMaterial,
        scheme: SignScheme,
        input: &[u8],
        signature: &[u8],
    ) -> TokenResult<()>;

    /// Apply the public RSA operation to a type 1 padded signature and
    /// return the embedded data.
    fn verify_recover(&self, key: &KeyMaterial, signature: &[u8]) -> TokenResult<Vec<u8>>;

    fn encrypt(&self, key: &KeyMaterial, padding: &RsaPadding, data: &[u8]) -> TokenResult<Vec<u8>>;

    fn decrypt(
        &self,
        key: &KeyMaterial,
        padding: &RsaPadding,
        data: &[u8],
    ) -> TokenResult<Zeroizing<Vec<u8>>>;

    /// Raw ECDH shared secret (the x coordinate).
    fn ecdh(&self, key: &KeyMaterial, peer_point: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>>;

    fn provider_id(&self) -> &'static str;
}

/// Software implementation over RustCrypto.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl SoftwareCrypto {
    pub fn new() -> Self {
        Self
    }
}

fn rsa_public(key: &KeyMaterial) -> TokenResult<RsaPublicKey> {
    match key {
        KeyMaterial::RsaPublic(key) => Ok(key.clone()),
        KeyMaterial::RsaPrivate(key) => Ok(key.to_public_key()),
        _ => Err(TokenError::KeyTypeInconsistent),
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn generate_rsa(&self, bits: usize, public_exponent: &[u8]) -> TokenResult<KeyMaterial> {
        let exponent = if public_exponent.is_empty() {
            BigUint::from(65_537u32)
        } else {
            BigUint::from_bytes_be(public_exponent)
        };
        let key = RsaPrivateKey::new_with_exp(&mut OsRng, bits, &exponent)
            .map_err(|_| TokenError::AttributeValueInvalid(CKA_PUBLIC_EXPONENT))?;
        Ok(KeyMaterial::RsaPrivate(Box::new(key)))
    }

    fn generate_ec(&self, curve: Curve) -> TokenResult<KeyMaterial> {
        let scalar = match curve {
            Curve::P256 => p256::SecretKey::random(&mut OsRng).to_bytes().to_vec(),
            Curve::P384 => p384::SecretKey::random(&mut OsRng).to_bytes().to_vec(),
        };
        Ok(KeyMaterial::EcPrivate {
            curve,
            scalar: Zeroizing::new(scalar),
        })
    }

    fn generate_ed25519(&self) -> TokenResult<KeyMaterial> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(TokenError::device)?;
        Ok(KeyMaterial::EdPrivate(seed))
    }

    fn sign(&self, key: &KeyMaterial, scheme: SignScheme, input: &[u8]) -> TokenResult<Vec<u8>> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;

        match (key, scheme) {
            (KeyMaterial::RsaPrivate(key), SignScheme::RsaPkcs1) => {
                if input.len() > key.size().saturating_sub(11) {
                    return Err(TokenError::DataLenRange);
                }
                key.sign(Pkcs1v15Sign::new_unprefixed(), input)
                    .map_err(TokenError::crypto)
            }
            (KeyMaterial::RsaPrivate(key), SignScheme::RsaPss { hash, salt_len }) => {
                if input.len() != hash.output_len() {
                    return Err(TokenError::DataLenRange);
                }
                key.sign_with_rng(&mut OsRng, pss(hash, salt_len), input)
                    .map_err(TokenError::crypto)
            }
            (KeyMaterial::EcPrivate { curve, scalar }, SignScheme::Ecdsa) => {
                let prehash = ecdsa_prehash(*curve, input);
                match curve {
                    Curve::P256 => {
                        let signer = p256::ecdsa::SigningKey::from_slice(scalar)
                            .map_err(TokenError::crypto)?;
                        let signature: p256::ecdsa::Signature =
                            signer.sign_prehash(&prehash).map_err(TokenError::crypto)?;
                        Ok(signature.to_bytes().to_vec())
                    }
                    Curve::P384 => {
                        let signer = p384::ecdsa::SigningKey::from_slice(scalar)
                            .map_err(TokenError::crypto)?;
                        let signature: p384::ecdsa::Signature =
                            signer.sign_prehash(&prehash).map_err(TokenError::crypto)?;
                        Ok(signature.to_bytes().to_vec())
                    }
                }
            }
            (KeyMaterial::EdPrivate(seed), SignScheme::EdDsa) => {
                use ed25519_dalek::Signer;
                let signer = ed25519_dalek::SigningKey::from_bytes(seed);
                Ok(signer.sign(input).to_bytes().to_vec())
            }
            _ => Err(TokenError::KeyTypeInconsistent),
        }
    }

    fn verify(
        &self,
        key: &KeyMaterial,
        scheme: SignScheme,
        input: &[u8],
        signature: &[u8],
    ) -> TokenResult<()> {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;

        if signature.len() != key.signature_len() {
            return Err(TokenError::SignatureLenRange);
        }
        match (key, scheme) {
            (KeyMaterial::RsaPublic(_) | KeyMaterial::RsaPrivate(_), SignScheme::RsaPkcs1) => {
                rsa_public(key)?
                    .verify(Pkcs1v15Sign::new_unprefixed(), input, signature)
                    .map_err(|_| TokenError::SignatureInvalid)
            }
            (
                KeyMaterial::RsaPublic(_) | KeyMaterial::RsaPrivate(_),
                SignScheme::RsaPss { hash, salt_len },
            ) => rsa_public(key)?
                .verify(pss(hash, salt_len), input, signature)
                .map_err(|_| TokenError::SignatureInvalid),
            (KeyMaterial::EcPublic { curve, point }, SignScheme::Ecdsa) => {
                let prehash = ecdsa_prehash(*curve, input);
                let valid = match curve {
                    Curve::P256 => {
                        let verifier = p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                            .map_err(TokenError::crypto)?;
                        p256::ecdsa::Signature::from_slice(signature)
                            .map(|sig| verifier.verify_prehash(&prehash, &sig).is_ok())
                            .unwrap_or(false)
                    }
                    Curve::P384 => {
                        let verifier = p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
                            .map_err(TokenError::crypto)?;
                        p384::ecdsa::Signature::from_slice(signature)
                            .map(|sig| verifier.verify_prehash(&prehash, &sig).is_ok())
                            .unwrap_or(false)
                    }
                };
                if valid {
                    Ok(())
                } else {
                    Err(TokenError::SignatureInvalid)
                }
            }
            (KeyMaterial::EdPublic(bytes), SignScheme::EdDsa) => {
                let verifier = ed25519_dalek::VerifyingKey::from_bytes(bytes)
                    .map_err(TokenError::crypto)?;
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| TokenError::SignatureInvalid)?;
                verifier
                    .verify_strict(input, &signature)
                    .map_err(|_| TokenError::SignatureInvalid)
            }
            _ => Err(TokenError::KeyTypeInconsistent),
        }
    }

    fn verify_recover(&self, key: &KeyMaterial, signature: &[u8]) -> TokenResult<Vec<u8>> {
        let public = rsa_public(key)?;
        let k = public.size();
        if signature.len() != k {
            return Err(TokenError::SignatureLenRange);
        }
        let s = BigUint::from_bytes_be(signature);
        if &s >= public.n() {
            return Err(TokenError::SignatureInvalid);
        }
        let encoded = left_pad(s.modpow(public.e(), public.n()).to_bytes_be(), k);
        // 0x00 0x01 0xff.. 0x00 data
        if encoded.len() != k || encoded[0] != 0x00 || encoded[1] != 0x01 {
            return Err(TokenError::SignatureInvalid);
        }
        let separator = encoded[2..]
            .iter()
            .position(|byte| *byte != 0xff)
            .map(|offset| offset + 2)
            .ok_or(TokenError::SignatureInvalid)?;
        if encoded[separator] != 0x00 || separator < 10 {
            return Err(TokenError::SignatureInvalid);
        }
        Ok(encoded[separator + 1..].to_vec())
    }

    fn encrypt(&self, key: &KeyMaterial, padding: &RsaPadding, data: &[u8]) -> TokenResult<Vec<u8>> {
        let KeyMaterial::RsaPublic(public) = key else {
            return Err(TokenError::KeyTypeInconsistent);
        };
        if data.len() > padding.max_input(public.size()) {
            return Err(TokenError::DataLenRange);
        }
        match padding {
            RsaPadding::Pkcs1 => public.encrypt(&mut OsRng, Pkcs1v15Encrypt, data),
            RsaPadding::Oaep { hash, label } => {
                public.encrypt(&mut OsRng, RsaPadding::oaep(*hash, label), data)
            }
        }
        .map_err(TokenError::crypto)
    }

    fn decrypt(
        &self,
        key: &KeyMaterial,
        padding: &RsaPadding,
        data: &[u8],
    ) -> TokenResult<Zeroizing<Vec<u8>>> {
        let KeyMaterial::RsaPrivate(private) = key else {
            return Err(TokenError::KeyTypeInconsistent);
        };
        if data.len() != private.size() {
            return Err(TokenError::EncryptedDataLenRange);
        }
        match padding {
            RsaPadding::Pkcs1 => private.decrypt(Pkcs1v15Encrypt, data),
            RsaPadding::Oaep { hash, label } => {
                private.decrypt(RsaPadding::oaep(*hash, label), data)
            }
        }
        .map(Zeroizing::new)
        .map_err(|_| TokenError::EncryptedDataInvalid)
    }

    fn ecdh(&self, key: &KeyMaterial, peer_point: &[u8]) -> TokenResult<Zeroizing<Vec<u8>>> {
        let KeyMaterial::EcPrivate { curve, scalar } = key else {
            return Err(TokenError::KeyTypeInconsistent);
        };
        let point = unwrap_point(peer_point, uncompressed_len(*curve))
            .map_err(|_| TokenError::param("peer point is malformed"))?;
        fn bad_point<E>(_: E) -> TokenError {
            TokenError::param("peer point is not on the curve")
        }
        let shared = match curve {
            Curve::P256 => {
                let secret = p256::SecretKey::from_slice(scalar).map_err(TokenError::crypto)?;
                let peer = p256::PublicKey::from_sec1_bytes(point).map_err(bad_point)?;
                p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine())
                    .raw_secret_bytes()
                    .to_vec()
            }
            Curve::P384 => {
                let secret = p384::SecretKey::from_slice(scalar).map_err(TokenError::crypto)?;
                let peer = p384::PublicKey::from_sec1_bytes(point).map_err(bad_point)?;
                p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine())
                    .raw_secret_bytes()
                    .to_vec()
            }
        };
        Ok(Zeroizing::new(shared))
    }

    fn provider_id(&self) -> &'static str {
        "software"
    }
}

/// Random-byte collaborator.
pub trait RandomSource: Send + Sync {
    fn fill(&self, buffer: &mut [u8]) -> TokenResult<()>;

    /// Mix caller-supplied entropy into the generator.
    fn seed(&self, seed: &[u8]) -> TokenResult<()>;
}

/// Operating system CSPRNG. Seeding is accepted and ignored because the OS
/// pool cannot be reseeded from user space.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buffer: &mut [u8]) -> TokenResult<()> {
        OsRng.try_fill_bytes(buffer).map_err(TokenError::device)
    }

    fn seed(&self, _seed: &[u8]) -> TokenResult<()> {
        Ok(())
    }
}
