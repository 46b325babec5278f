//! Attribute templates and the object management entry points.
//!
//! Templates are decoded into an [`AttributeTemplate`] before the engine sees
//! them. `C_GetAttributeValue` answers each requested attribute on its own and
//! reports the most significant failure across the whole template.

use std::ptr;

use cryptoki_sys::*;
use ferrotoken_core::{AttributeLookup, AttributeTemplate, AttributeType, Limits};

use crate::{FrontendError, abi, call};

/// Decode a caller template.
///
/// # Safety
/// `template` must point at `count` `CK_ATTRIBUTE` entries whose value
/// pointers honour their lengths.
pub unsafe fn read_template(template: CK_ATTRIBUTE_PTR, count: CK_ULONG) -> Result<AttributeTemplate, FrontendError> {
    if count == 0 {
        return Ok(AttributeTemplate::new());
    }
    if template.is_null() {
        return Err(abi::bad_arguments("null template with non-zero count"));
    }
    if count as usize > Limits::MAX_TEMPLATE_ATTRIBUTES {
        return Err(abi::bad_arguments("template has too many attributes"));
    }
    let entries = unsafe { std::slice::from_raw_parts(template, count as usize) };
    let raw = entries
        .iter()
        .map(|entry| {
            let value = unsafe { abi::bytes(entry.pValue as *const CK_BYTE, entry.ulValueLen) }?;
            Ok((entry.type_, value.to_vec()))
        })
        .collect::<Result<Vec<_>, FrontendError>>()?;
    Ok(AttributeTemplate::parse(&raw)?)
}

/// Weight of each per-attribute outcome; the heaviest one becomes the call's
/// return value.
fn severity(rv: CK_RV) -> u8 {
    match rv {
        CKR_ATTRIBUTE_SENSITIVE => 3,
        CKR_ATTRIBUTE_TYPE_INVALID => 2,
        CKR_BUFFER_TOO_SMALL => 1,
        _ => 0,
    }
}

/// Fill one requested attribute from its lookup result.
///
/// # Safety
/// A non-null `entry.pValue` must be writable for `entry.ulValueLen` bytes.
unsafe fn fill(entry: &mut CK_ATTRIBUTE, lookup: AttributeLookup) -> CK_RV {
    match lookup {
        AttributeLookup::Sensitive => {
            entry.ulValueLen = CK_UNAVAILABLE_INFORMATION;
            CKR_ATTRIBUTE_SENSITIVE
        }
        AttributeLookup::Invalid => {
            entry.ulValueLen = CK_UNAVAILABLE_INFORMATION;
            CKR_ATTRIBUTE_TYPE_INVALID
        }
        AttributeLookup::Value(value) => {
            if entry.pValue.is_null() {
                entry.ulValueLen = value.len() as CK_ULONG;
                CKR_OK
            } else if (entry.ulValueLen as usize) < value.len() {
                entry.ulValueLen = CK_UNAVAILABLE_INFORMATION;
                CKR_BUFFER_TOO_SMALL
            } else {
                unsafe { ptr::copy_nonoverlapping(value.as_ptr(), entry.pValue as *mut CK_BYTE, value.len()) };
                entry.ulValueLen = value.len() as CK_ULONG;
                CKR_OK
            }
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CreateObject(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phObject: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    call("C_CreateObject", |engine| {
        let template = unsafe { read_template(pTemplate, ulCount) }?;
        let out = unsafe { abi::out_param(phObject) }?;
        *out = abi::raw_handle(engine.create_object(abi::handle(hSession), &template)?)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CopyObject(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phNewObject: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    call("C_CopyObject", |engine| {
        let template = unsafe { read_template(pTemplate, ulCount) }?;
        let out = unsafe { abi::out_param(phNewObject) }?;
        let copy = engine.copy_object(abi::handle(hSession), abi::handle(hObject), &template)?;
        *out = abi::raw_handle(copy)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_DestroyObject(hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE) -> CK_RV {
    call("C_DestroyObject", |engine| {
        engine.destroy_object(abi::handle(hSession), abi::handle(hObject))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetObjectSize(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pulSize: CK_ULONG_PTR,
) -> CK_RV {
    call("C_GetObjectSize", |engine| {
        let out = unsafe { abi::out_param(pulSize) }?;
        *out = engine.object_size(abi::handle(hSession), abi::handle(hObject))? as CK_ULONG;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    call("C_GetAttributeValue", |engine| {
        if ulCount == 0 {
            return Ok(CKR_OK);
        }
        if pTemplate.is_null() {
            return Err(abi::bad_arguments("null template with non-zero count"));
        }
        if ulCount as usize > Limits::MAX_TEMPLATE_ATTRIBUTES {
            return Err(abi::bad_arguments("template has too many attributes"));
        }
        let entries = unsafe { std::slice::from_raw_parts_mut(pTemplate, ulCount as usize) };
        let wanted: Vec<AttributeType> = entries.iter().map(|entry| entry.type_).collect();
        let lookups = engine.attribute_values(abi::handle(hSession), abi::handle(hObject), &wanted)?;
        let rv = entries
            .iter_mut()
            .zip(lookups)
            .map(|(entry, lookup)| unsafe { fill(entry, lookup) })
            .max_by_key(|rv| severity(*rv))
            .unwrap_or(CKR_OK);
        Ok(rv)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    call("C_SetAttributeValue", |engine| {
        let template = unsafe { read_template(pTemplate, ulCount) }?;
        engine.set_attribute_values(abi::handle(hSession), abi::handle(hObject), &template)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsInit(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    call("C_FindObjectsInit", |engine| {
        let template = unsafe { read_template(pTemplate, ulCount) }?;
        engine.find_objects_init(abi::handle(hSession), &template)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjects(
    hSession: CK_SESSION_HANDLE,
    phObject: CK_OBJECT_HANDLE_PTR,
    ulMaxObjectCount: CK_ULONG,
    pulObjectCount: CK_ULONG_PTR,
) -> CK_RV {
    call("C_FindObjects", |engine| {
        if phObject.is_null() && ulMaxObjectCount != 0 {
            return Err(abi::bad_arguments("null handle buffer"));
        }
        let count = unsafe { abi::out_param(pulObjectCount) }?;
        let batch = engine.find_objects(abi::handle(hSession), ulMaxObjectCount as usize)?;
        let raw = batch
            .iter()
            .map(|handle| abi::raw_handle(*handle))
            .collect::<Result<Vec<_>, _>>()?;
        for (index, handle) in raw.into_iter().enumerate() {
            unsafe { *phObject.add(index) = handle };
        }
        *count = batch.len() as CK_ULONG;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) -> CK_RV {
    call("C_FindObjectsFinal", |engine| {
        engine.find_objects_final(abi::handle(hSession))?;
        Ok(CKR_OK)
    })
}

/// Build a `CK_ATTRIBUTE` over a caller-owned buffer, for tests and callers
/// assembling templates from Rust.
pub fn attribute(type_: CK_ATTRIBUTE_TYPE, value: &mut [u8]) -> CK_ATTRIBUTE {
    CK_ATTRIBUTE {
        type_,
        pValue: value.as_mut_ptr() as CK_VOID_PTR,
        ulValueLen: value.len() as CK_ULONG,
    }
}
