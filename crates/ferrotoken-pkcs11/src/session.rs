//! Session lifecycle, login state and PIN management.

use cryptoki_sys::*;

use crate::{abi, call};

/// Opens a session. `pApplication` and `Notify` are accepted but no callbacks
/// are ever made.
#[unsafe(no_mangle)]
pub extern "C" fn C_OpenSession(
    slotID: CK_SLOT_ID,
    flags: CK_FLAGS,
    _pApplication: CK_VOID_PTR,
    _Notify: CK_NOTIFY,
    phSession: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    call("C_OpenSession", |engine| {
        let out = unsafe { abi::out_param(phSession) }?;
        *out = abi::raw_handle(engine.open_session(slotID, flags)?)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseSession(hSession: CK_SESSION_HANDLE) -> CK_RV {
    call("C_CloseSession", |engine| {
        engine.close_session(abi::handle(hSession))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CloseAllSessions(slotID: CK_SLOT_ID) -> CK_RV {
    call("C_CloseAllSessions", |engine| {
        engine.close_all_sessions(slotID)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR) -> CK_RV {
    call("C_GetSessionInfo", |engine| {
        let info = engine.session_info(abi::handle(hSession))?;
        let out = unsafe { abi::out_param(pInfo) }?;
        *out = CK_SESSION_INFO {
            slotID: info.slot,
            state: info.state,
            flags: info.flags,
            ulDeviceError: info.device_error,
        };
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Login(
    hSession: CK_SESSION_HANDLE,
    userType: CK_USER_TYPE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    call("C_Login", |engine| {
        let pin = unsafe { abi::bytes(pPin, ulPinLen) }?;
        engine.login(abi::handle(hSession), userType, pin)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Logout(hSession: CK_SESSION_HANDLE) -> CK_RV {
    call("C_Logout", |engine| {
        engine.logout(abi::handle(hSession))?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_InitPIN(hSession: CK_SESSION_HANDLE, pPin: CK_UTF8CHAR_PTR, ulPinLen: CK_ULONG) -> CK_RV {
    call("C_InitPIN", |engine| {
        let pin = unsafe { abi::bytes(pPin, ulPinLen) }?;
        engine.init_pin(abi::handle(hSession), pin)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SetPIN(
    hSession: CK_SESSION_HANDLE,
    pOldPin: CK_UTF8CHAR_PTR,
    ulOldLen: CK_ULONG,
    pNewPin: CK_UTF8CHAR_PTR,
    ulNewLen: CK_ULONG,
) -> CK_RV {
    call("C_SetPIN", |engine| {
        let old_pin = unsafe { abi::bytes(pOldPin, ulOldLen) }?;
        let new_pin = unsafe { abi::bytes(pNewPin, ulNewLen) }?;
        engine.set_pin(abi::handle(hSession), old_pin, new_pin)?;
        Ok(CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetOperationState(
    hSession: CK_SESSION_HANDLE,
    pOperationState: CK_BYTE_PTR,
    pulOperationStateLen: CK_ULONG_PTR,
) -> CK_RV {
    call("C_GetOperationState", |engine| {
        let capacity = unsafe { abi::capacity(pOperationState, pulOperationStateLen) }?;
        let state = engine.operation_state(abi::handle(hSession))?;
        Ok(unsafe { abi::write_output(abi::fit(state, capacity), pOperationState, pulOperationStateLen) })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_SetOperationState(
    hSession: CK_SESSION_HANDLE,
    pOperationState: CK_BYTE_PTR,
    ulOperationStateLen: CK_ULONG,
    _hEncryptionKey: CK_OBJECT_HANDLE,
    _hAuthenticationKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    call("C_SetOperationState", |engine| {
        let state = unsafe { abi::bytes(pOperationState, ulOperationStateLen) }?;
        engine.set_operation_state(abi::handle(hSession), state)?;
        Ok(CKR_OK)
    })
}

/// Legacy parallel-function query.
#[unsafe(no_mangle)]
pub extern "C" fn C_GetFunctionStatus(_hSession: CK_SESSION_HANDLE) -> CK_RV {
    call("C_GetFunctionStatus", |_| Ok(CKR_FUNCTION_NOT_PARALLEL))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_CancelFunction(_hSession: CK_SESSION_HANDLE) -> CK_RV {
    call("C_CancelFunction", |_| Ok(CKR_FUNCTION_NOT_PARALLEL))
}
