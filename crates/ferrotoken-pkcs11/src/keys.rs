//! Key generation, wrapping, derivation and the random number entry points.

use std::ptr;

use cryptoki_sys::*;

use crate::attribute::read_template;
use crate::mechanism::read_mechanism;
use crate::{abi, call};

#[unsafe(no_mangle)]
pub extern "C" fn C_GenerateKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    call("C_GenerateKey", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        let template = unsafe { read_template(pTemplate, ulCount) }?;
        let out = unsafe { abi::out_param(phKey) }?;
        *out = abi::raw_handle(engine.generate_key(abi::handle(hSession), &mechanism, &template)?)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GenerateKeyPair(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pPublicKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPublicKeyAttributeCount: CK_ULONG,
    pPrivateKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPrivateKeyAttributeCount: CK_ULONG,
    phPublicKey: CK_OBJECT_HANDLE_PTR,
    phPrivateKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    call("C_GenerateKeyPair", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        let public = unsafe { read_template(pPublicKeyTemplate, ulPublicKeyAttributeCount) }?;
        let private = unsafe { read_template(pPrivateKeyTemplate, ulPrivateKeyAttributeCount) }?;
        let public_out = unsafe { abi::out_param(phPublicKey) }?;
        let private_out = unsafe { abi::out_param(phPrivateKey) }?;
        let (public_key, private_key) =
            engine.generate_key_pair(abi::handle(hSession), &mechanism, &public, &private)?;
        *public_out = abi::raw_handle(public_key)?;
        *private_out = abi::raw_handle(private_key)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_WrapKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hWrappingKey: CK_OBJECT_HANDLE,
    hKey: CK_OBJECT_HANDLE,
    pWrappedKey: CK_BYTE_PTR,
    pulWrappedKeyLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_WrapKey", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        let capacity = unsafe { abi::capacity(pWrappedKey, pulWrappedKeyLen) }?;
        let output = engine.wrap_key(
            abi::handle(hSession),
            &mechanism,
            abi::handle(hWrappingKey),
            abi::handle(hKey),
            capacity,
        )?;
        Ok(unsafe { abi::write_output(output, pWrappedKey, pulWrappedKeyLen) })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_UnwrapKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hUnwrappingKey: CK_OBJECT_HANDLE,
    pWrappedKey: CK_BYTE_PTR,
    ulWrappedKeyLen: CK_ULONG,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulAttributeCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    call("C_UnwrapKey", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        let wrapped = unsafe { abi::bytes(pWrappedKey, ulWrappedKeyLen) }?;
        let template = unsafe { read_template(pTemplate, ulAttributeCount) }?;
        let out = unsafe { abi::out_param(phKey) }?;
        let key = engine.unwrap_key(
            abi::handle(hSession),
            &mechanism,
            abi::handle(hUnwrappingKey),
            wrapped,
            &template,
        )?;
        *out = abi::raw_handle(key)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DeriveKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hBaseKey: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulAttributeCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    call("C_DeriveKey", |engine| {
        let mechanism = unsafe { read_mechanism(pMechanism) }?;
        let template = unsafe { read_template(pTemplate, ulAttributeCount) }?;
        let out = unsafe { abi::out_param(phKey) }?;
        let key = engine.derive_key(abi::handle(hSession), &mechanism, abi::handle(hBaseKey), &template)?;
        *out = abi::raw_handle(key)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SeedRandom(hSession: CK_SESSION_HANDLE, pSeed: CK_BYTE_PTR, ulSeedLen: CK_ULONG) -> CK_RV {
    call("C_SeedRandom", |engine| {
        let seed = unsafe { abi::bytes(pSeed, ulSeedLen) }?;
        engine.seed_random(abi::handle(hSession), seed)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GenerateRandom(
    hSession: CK_SESSION_HANDLE,
    RandomData: CK_BYTE_PTR,
    ulRandomLen: CK_ULONG,
) -> CK_RV {
    call("C_GenerateRandom", |engine| {
        if RandomData.is_null() && ulRandomLen != 0 {
            return Err(abi::bad_arguments("null random buffer"));
        }
        let random = engine.generate_random(abi::handle(hSession), ulRandomLen as usize)?;
        unsafe { ptr::copy_nonoverlapping(random.as_ptr(), RandomData, random.len()) };
        Ok(CKR_OK)
    })
}
