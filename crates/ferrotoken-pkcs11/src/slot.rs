//! Slot, token and mechanism queries plus token initialization.

use cryptoki_sys::*;
use ferrotoken_core::Engine;
use tracing::info;

use crate::{FrontendError, abi, call};

const LABEL_LEN: usize = 32;

fn engine_version(engine: &Engine) -> CK_VERSION {
    let (major, minor) = engine.info().library_version;
    CK_VERSION { major, minor }
}

/// Decode the blank-padded 32 byte label handed to `C_InitToken`.
///
/// # Safety
/// `label` must be null or point at 32 readable bytes.
unsafe fn read_label(label: CK_UTF8CHAR_PTR) -> Result<String, FrontendError> {
    if label.is_null() {
        return Err(abi::bad_arguments("null label"));
    }
    let raw = unsafe { abi::bytes(label, LABEL_LEN as CK_ULONG) }?;
    let text = std::str::from_utf8(raw).map_err(|_| abi::bad_arguments("label is not UTF-8"))?;
    Ok(text.trim_end_matches(' ').to_string())
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotList(
    tokenPresent: CK_BBOOL,
    pSlotList: CK_SLOT_ID_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    call("C_GetSlotList", |engine| {
        let slots = engine.slot_list(tokenPresent != CK_FALSE);
        unsafe { abi::write_list(&slots, pSlotList, pulCount) }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR) -> CK_RV {
    call("C_GetSlotInfo", |engine| {
        let info = engine.slot_info(slotID)?;
        let out = unsafe { abi::out_param(pInfo) }?;
        *out = CK_SLOT_INFO {
            slotDescription: abi::padded(&info.description),
            manufacturerID: abi::padded(&info.manufacturer),
            flags: info.flags,
            hardwareVersion: engine_version(engine),
            firmwareVersion: engine_version(engine),
        };
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR) -> CK_RV {
    call("C_GetTokenInfo", |engine| {
        let info = engine.token_info(slotID)?;
        let out = unsafe { abi::out_param(pInfo) }?;
        *out = CK_TOKEN_INFO {
            label: abi::padded(&info.label),
            manufacturerID: abi::padded(&info.manufacturer),
            model: abi::padded(&info.model),
            serialNumber: abi::padded(&info.serial),
            flags: info.flags,
            ulMaxSessionCount: info.max_sessions as CK_ULONG,
            ulSessionCount: info.session_count as CK_ULONG,
            ulMaxRwSessionCount: info.max_sessions as CK_ULONG,
            ulRwSessionCount: info.rw_session_count as CK_ULONG,
            ulMaxPinLen: info.max_pin_len as CK_ULONG,
            ulMinPinLen: info.min_pin_len as CK_ULONG,
            ulTotalPublicMemory: CK_UNAVAILABLE_INFORMATION,
            ulFreePublicMemory: CK_UNAVAILABLE_INFORMATION,
            ulTotalPrivateMemory: CK_UNAVAILABLE_INFORMATION,
            ulFreePrivateMemory: CK_UNAVAILABLE_INFORMATION,
            hardwareVersion: engine_version(engine),
            firmwareVersion: engine_version(engine),
            utcTime: abi::padded(&info.utc_time),
        };
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismList(
    slotID: CK_SLOT_ID,
    pMechanismList: CK_MECHANISM_TYPE_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    call("C_GetMechanismList", |engine| {
        let mechanisms = engine.mechanism_list(slotID)?;
        unsafe { abi::write_list(&mechanisms, pMechanismList, pulCount) }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetMechanismInfo(
    slotID: CK_SLOT_ID,
    type_: CK_MECHANISM_TYPE,
    pInfo: CK_MECHANISM_INFO_PTR,
) -> CK_RV {
    call("C_GetMechanismInfo", |engine| {
        let info = engine.mechanism_info(slotID, type_)?;
        let out = unsafe { abi::out_param(pInfo) }?;
        *out = CK_MECHANISM_INFO {
            ulMinKeySize: info.min_key_size,
            ulMaxKeySize: info.max_key_size,
            flags: info.flags,
        };
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_InitToken(
    slotID: CK_SLOT_ID,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
    pLabel: CK_UTF8CHAR_PTR,
) -> CK_RV {
    call("C_InitToken", |engine| {
        let pin = unsafe { abi::bytes(pPin, ulPinLen) }?;
        let label = unsafe { read_label(pLabel) }?;
        engine.init_token(slotID, pin, &label)?;
        info!(slot = slotID, "token initialized through C_InitToken");
        Ok(CKR_OK)
    })
}

/// Slot events are never raised: every slot holds its token for the life of
/// the process.
#[unsafe(no_mangle)]
pub extern "C" fn C_WaitForSlotEvent(
    _flags: CK_FLAGS,
    _pSlot: CK_SLOT_ID_PTR,
    _pReserved: CK_VOID_PTR,
) -> CK_RV {
    call("C_WaitForSlotEvent", |_| Ok(CKR_FUNCTION_NOT_SUPPORTED))
}
