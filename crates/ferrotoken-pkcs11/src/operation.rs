//! Encrypt, decrypt, digest, sign and verify entry points, single-part,
//! multi-part and combined.
//!
//! Every call that produces bytes follows the two-call convention: a null
//! output pointer is a size query, a short buffer answers
//! `CKR_BUFFER_TOO_SMALL` with the required length, and neither ends the
//! operation.

use cryptoki_sys::*;
use ferrotoken_core::{Output, TokenResult};

use crate::mechanism::read_mechanism;
use crate::{FrontendError, abi, call};

/// Run an output-producing engine call against a caller buffer.
fn emit<F>(out: CK_BYTE_PTR, out_len: CK_ULONG_PTR, produce: F) -> Result<CK_RV, FrontendError>
where
    F: FnOnce(Option<usize>) -> TokenResult<Output>,
{
    let capacity = unsafe { abi::capacity(out, out_len) }?;
    let output = produce(capacity)?;
    Ok(unsafe { abi::write_output(output, out, out_len) })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_EncryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_EncryptInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.encrypt_init(abi::handle(hSession), &mechanism, abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Encrypt(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pEncryptedData: CK_BYTE_PTR,
    pulEncryptedDataLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_Encrypt", |engine| {
        let data = unsafe { abi::bytes(pData, ulDataLen) }?;
        emit(pEncryptedData, pulEncryptedDataLen, |capacity| {
            engine.encrypt(abi::handle(hSession), data, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_EncryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_EncryptUpdate", |engine| {
        let part = unsafe { abi::bytes(pPart, ulPartLen) }?;
        emit(pEncryptedPart, pulEncryptedPartLen, |capacity| {
            engine.encrypt_update(abi::handle(hSession), part, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_EncryptFinal(
    hSession: CK_SESSION_HANDLE,
    pLastEncryptedPart: CK_BYTE_PTR,
    pulLastEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_EncryptFinal", |engine| {
        emit(pLastEncryptedPart, pulLastEncryptedPartLen, |capacity| {
            engine.encrypt_final(abi::handle(hSession), capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_DecryptInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.decrypt_init(abi::handle(hSession), &mechanism, abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Decrypt(
    hSession: CK_SESSION_HANDLE,
    pEncryptedData: CK_BYTE_PTR,
    ulEncryptedDataLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_Decrypt", |engine| {
        let encrypted = unsafe { abi::bytes(pEncryptedData, ulEncryptedDataLen) }?;
        emit(pData, pulDataLen, |capacity| {
            engine.decrypt(abi::handle(hSession), encrypted, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_DecryptUpdate", |engine| {
        let encrypted = unsafe { abi::bytes(pEncryptedPart, ulEncryptedPartLen) }?;
        emit(pPart, pulPartLen, |capacity| {
            engine.decrypt_update(abi::handle(hSession), encrypted, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptFinal(
    hSession: CK_SESSION_HANDLE,
    pLastPart: CK_BYTE_PTR,
    pulLastPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_DecryptFinal", |engine| {
        emit(pLastPart, pulLastPartLen, |capacity| {
            engine.decrypt_final(abi::handle(hSession), capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DigestInit(hSession: CK_SESSION_HANDLE, pMechanism: CK_MECHANISM_PTR) -> CK_RV {
    call("C_DigestInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.digest_init(abi::handle(hSession), &mechanism)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Digest(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pDigest: CK_BYTE_PTR,
    pulDigestLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_Digest", |engine| {
        let data = unsafe { abi::bytes(pData, ulDataLen) }?;
        emit(pDigest, pulDigestLen, |capacity| {
            engine.digest(abi::handle(hSession), data, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DigestUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG) -> CK_RV {
    call("C_DigestUpdate", |engine| {
        let part = unsafe { abi::bytes(pPart, ulPartLen) }?;
        engine.digest_update(abi::handle(hSession), part)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DigestKey(hSession: CK_SESSION_HANDLE, hKey: CK_OBJECT_HANDLE) -> CK_RV {
    call("C_DigestKey", |engine| {
        engine.digest_key(abi::handle(hSession), abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DigestFinal(
    hSession: CK_SESSION_HANDLE,
    pDigest: CK_BYTE_PTR,
    pulDigestLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_DigestFinal", |engine| {
        emit(pDigest, pulDigestLen, |capacity| {
            engine.digest_final(abi::handle(hSession), capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_SignInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.sign_init(abi::handle(hSession), &mechanism, abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Sign(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_Sign", |engine| {
        let data = unsafe { abi::bytes(pData, ulDataLen) }?;
        emit(pSignature, pulSignatureLen, |capacity| {
            engine.sign(abi::handle(hSession), data, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG) -> CK_RV {
    call("C_SignUpdate", |engine| {
        let part = unsafe { abi::bytes(pPart, ulPartLen) }?;
        engine.sign_update(abi::handle(hSession), part)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignFinal(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_SignFinal", |engine| {
        emit(pSignature, pulSignatureLen, |capacity| {
            engine.sign_final(abi::handle(hSession), capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignRecoverInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_SignRecoverInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.sign_recover_init(abi::handle(hSession), &mechanism, abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignRecover(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_SignRecover", |engine| {
        let data = unsafe { abi::bytes(pData, ulDataLen) }?;
        emit(pSignature, pulSignatureLen, |capacity| {
            engine.sign_recover(abi::handle(hSession), data, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_VerifyInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.verify_init(abi::handle(hSession), &mechanism, abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Verify(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
) -> CK_RV {
    call("C_Verify", |engine| {
        let data = unsafe { abi::bytes(pData, ulDataLen) }?;
        let signature = unsafe { abi::bytes(pSignature, ulSignatureLen) }?;
        engine.verify(abi::handle(hSession), data, signature)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyUpdate(hSession: CK_SESSION_HANDLE, pPart: CK_BYTE_PTR, ulPartLen: CK_ULONG) -> CK_RV {
    call("C_VerifyUpdate", |engine| {
        let part = unsafe { abi::bytes(pPart, ulPartLen) }?;
        engine.verify_update(abi::handle(hSession), part)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyFinal(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
) -> CK_RV {
    call("C_VerifyFinal", |engine| {
        let signature = unsafe { abi::bytes(pSignature, ulSignatureLen) }?;
        engine.verify_final(abi::handle(hSession), signature)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyRecoverInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_VerifyRecoverInit", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        engine.verify_recover_init(abi::handle(hSession), &mechanism, abi::handle(hKey))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_VerifyRecover(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_VerifyRecover", |engine| {
        let signature = unsafe { abi::bytes(pSignature, ulSignatureLen) }?;
        emit(pData, pulDataLen, |capacity| {
            engine.verify_recover(abi::handle(hSession), signature, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DigestEncryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_DigestEncryptUpdate", |engine| {
        let part = unsafe { abi::bytes(pPart, ulPartLen) }?;
        emit(pEncryptedPart, pulEncryptedPartLen, |capacity| {
            engine.digest_encrypt_update(abi::handle(hSession), part, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptDigestUpdate(
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_DecryptDigestUpdate", |engine| {
        let encrypted = unsafe { abi::bytes(pEncryptedPart, ulEncryptedPartLen) }?;
        emit(pPart, pulPartLen, |capacity| {
            engine.decrypt_digest_update(abi::handle(hSession), encrypted, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SignEncryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_SignEncryptUpdate", |engine| {
        let part = unsafe { abi::bytes(pPart, ulPartLen) }?;
        emit(pEncryptedPart, pulEncryptedPartLen, |capacity| {
            engine.sign_encrypt_update(abi::handle(hSession), part, capacity)
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DecryptVerifyUpdate(
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_DecryptVerifyUpdate", |engine| {
        let encrypted = unsafe { abi::bytes(pEncryptedPart, ulEncryptedPartLen) }?;
        emit(pPart, pulPartLen, |capacity| {
            engine.decrypt_verify_update(abi::handle(hSession), encrypted, capacity)
        })
    })
}
