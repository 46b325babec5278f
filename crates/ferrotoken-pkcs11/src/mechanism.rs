//! Decoding of `CK_MECHANISM` and its parameter structures.
//!
//! Each mechanism family has one parameter layout. The decoder copies the
//! caller's buffers into an owned [`Mechanism`]; shape checks beyond the
//! layout (IV lengths, tag sizes, KDF choices) belong to the engine.

use std::mem::size_of;

use cryptoki_sys::*;
use ferrotoken_core::{Limits, Mechanism, MechanismParams, TokenError};

use crate::FrontendError;
use crate::abi;

/// Copy a caller buffer into an owned vector.
///
/// # Safety
/// Same contract as [`abi::bytes`].
unsafe fn owned(data: *const CK_BYTE, len: CK_ULONG) -> Result<Vec<u8>, FrontendError> {
    if len as usize > Limits::MAX_PARAMETER_LEN {
        return Err(TokenError::param("parameter exceeds length limit").into());
    }
    Ok(unsafe { abi::bytes(data, len) }?.to_vec())
}

/// Read the parameter block as `T`, insisting on an exact size match.
///
/// # Safety
/// `raw.pParameter` must point at `raw.ulParameterLen` readable bytes.
unsafe fn params<T: Copy>(raw: &CK_MECHANISM) -> Result<T, FrontendError> {
    if raw.pParameter.is_null() || raw.ulParameterLen as usize != size_of::<T>() {
        return Err(TokenError::param("parameter block has the wrong size").into());
    }
    Ok(unsafe { std::ptr::read_unaligned(raw.pParameter as *const T) })
}

/// Decode a caller mechanism.
///
/// # Safety
/// `mechanism` must be null or point at a valid `CK_MECHANISM` whose
/// parameter pointers honour their declared lengths.
pub unsafe fn read_mechanism(mechanism: CK_MECHANISM_PTR) -> Result<Mechanism, FrontendError> {
    let Some(raw) = (unsafe { mechanism.as_ref() }) else {
        return Err(abi::bad_arguments("null mechanism"));
    };
    let kind = raw.mechanism;
    let has_params = !raw.pParameter.is_null() && raw.ulParameterLen != 0;
    let params = match kind {
        CKM_AES_CBC | CKM_AES_CBC_PAD => {
            MechanismParams::Iv(unsafe { owned(raw.pParameter as *const CK_BYTE, raw.ulParameterLen) }?)
        }
        CKM_AES_KEY_WRAP | CKM_AES_KEY_WRAP_PAD if has_params => {
            MechanismParams::Iv(unsafe { owned(raw.pParameter as *const CK_BYTE, raw.ulParameterLen) }?)
        }
        CKM_AES_GCM => {
            let gcm: CK_GCM_PARAMS = unsafe { params(raw) }?;
            MechanismParams::Gcm {
                iv: unsafe { owned(gcm.pIv, gcm.ulIvLen) }?,
                aad: unsafe { owned(gcm.pAAD, gcm.ulAADLen) }?,
                tag_bits: gcm.ulTagBits as usize,
            }
        }
        CKM_RSA_PKCS_OAEP => {
            let oaep: CK_RSA_PKCS_OAEP_PARAMS = unsafe { params(raw) }?;
            MechanismParams::Oaep {
                hash: oaep.hashAlg,
                mgf: oaep.mgf,
                source: oaep.source,
                label: unsafe { owned(oaep.pSourceData as *const CK_BYTE, oaep.ulSourceDataLen) }?,
            }
        }
        CKM_SHA256_RSA_PKCS_PSS | CKM_SHA384_RSA_PKCS_PSS | CKM_SHA512_RSA_PKCS_PSS => {
            let pss: CK_RSA_PKCS_PSS_PARAMS = unsafe { params(raw) }?;
            MechanismParams::Pss {
                hash: pss.hashAlg,
                mgf: pss.mgf,
                salt_len: pss.sLen as usize,
            }
        }
        CKM_ECDH1_DERIVE => {
            let ecdh: CK_ECDH1_DERIVE_PARAMS = unsafe { params(raw) }?;
            MechanismParams::Ecdh {
                kdf: ecdh.kdf,
                shared_data: unsafe { owned(ecdh.pSharedData, ecdh.ulSharedDataLen) }?,
                public_data: unsafe { owned(ecdh.pPublicData, ecdh.ulPublicDataLen) }?,
            }
        }
        CKM_AES_ECB_ENCRYPT_DATA => {
            let data: CK_KEY_DERIVATION_STRING_DATA = unsafe { params(raw) }?;
            MechanismParams::DeriveData(unsafe { owned(data.pData, data.ulLen) }?)
        }
        CKM_AES_CBC_ENCRYPT_DATA => {
            let data: CK_AES_CBC_ENCRYPT_DATA_PARAMS = unsafe { params(raw) }?;
            MechanismParams::CbcDeriveData {
                iv: data.iv.to_vec(),
                data: unsafe { owned(data.pData, data.length) }?,
            }
        }
        _ if has_params => {
            // An unknown mechanism is reported as such, not as a bad parameter.
            ferrotoken_core::mechanism::lookup(kind)?;
            return Err(TokenError::param("mechanism takes no parameters").into());
        }
        _ => MechanismParams::None,
    };
    Ok(Mechanism::with_params(kind, params))
}
