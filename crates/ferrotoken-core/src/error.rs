use cryptoki_sys::*;
use thiserror::Error;

use crate::attributes::AttributeType;
use crate::mechanism::MechanismType;
use crate::slot::SlotId;

pub type TokenResult<T> = Result<T, TokenError>;

/// Failure conditions raised by the engine. Every variant maps onto exactly one
/// `CKR_*` code through [`TokenError::code`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("engine not initialized")]
    NotInitialized,
    #[error("invalid arguments: {0}")]
    ArgumentsBad(String),
    #[error("slot {0} does not exist")]
    SlotIdInvalid(SlotId),
    #[error("token in slot {0} is not initialized")]
    TokenNotRecognized(SlotId),
    #[error("session handle is invalid")]
    SessionHandleInvalid,
    #[error("session was closed")]
    SessionClosed,
    #[error("a session is open on the slot")]
    SessionExists,
    #[error("session limit reached")]
    SessionCount,
    #[error("parallel sessions are not supported")]
    SessionParallelNotSupported,
    #[error("session is read-only")]
    SessionReadOnly,
    #[error("a read-only session exists on the slot")]
    SessionReadOnlyExists,
    #[error("security officer is logged in on a read-write session")]
    SessionReadWriteSoExists,
    #[error("incorrect PIN")]
    PinIncorrect,
    #[error("PIN length out of range")]
    PinLenRange,
    #[error("user is not logged in")]
    UserNotLoggedIn,
    #[error("user is already logged in")]
    UserAlreadyLoggedIn,
    #[error("user PIN has not been initialized")]
    UserPinNotInitialized,
    #[error("invalid user type")]
    UserTypeInvalid,
    #[error("template is incomplete")]
    TemplateIncomplete,
    #[error("template is inconsistent")]
    TemplateInconsistent,
    #[error("attribute type {0:#x} is invalid")]
    AttributeTypeInvalid(AttributeType),
    #[error("attribute {0:#x} has an invalid value")]
    AttributeValueInvalid(AttributeType),
    #[error("attribute {0:#x} is read-only")]
    AttributeReadOnly(AttributeType),
    #[error("attribute {0:#x} is sensitive")]
    AttributeSensitive(AttributeType),
    #[error("object handle is invalid")]
    ObjectHandleInvalid,
    #[error("key handle is invalid")]
    KeyHandleInvalid,
    #[error("wrapping key handle is invalid")]
    WrappingKeyHandleInvalid,
    #[error("unwrapping key handle is invalid")]
    UnwrappingKeyHandleInvalid,
    #[error("action prohibited by object policy")]
    ActionProhibited,
    #[error("mechanism {0:#x} is invalid")]
    MechanismInvalid(MechanismType),
    #[error("mechanism parameter is invalid: {0}")]
    MechanismParamInvalid(String),
    #[error("key function not permitted")]
    KeyFunctionNotPermitted,
    #[error("key type inconsistent with mechanism")]
    KeyTypeInconsistent,
    #[error("key size out of range")]
    KeySizeRange,
    #[error("key is not extractable")]
    KeyUnextractable,
    #[error("key cannot be digested")]
    KeyIndigestible,
    #[error("curve not supported")]
    CurveNotSupported,
    #[error("operation not initialized")]
    OperationNotInitialized,
    #[error("operation already active")]
    OperationActive,
    #[error("output buffer too small")]
    BufferTooSmall,
    #[error("data length out of range")]
    DataLenRange,
    #[error("encrypted data is invalid")]
    EncryptedDataInvalid,
    #[error("encrypted data length out of range")]
    EncryptedDataLenRange,
    #[error("signature is invalid")]
    SignatureInvalid,
    #[error("signature length out of range")]
    SignatureLenRange,
    #[error("wrapped key is invalid")]
    WrappedKeyInvalid,
    #[error("wrapped key length out of range")]
    WrappedKeyLenRange,
    #[error("device memory exhausted")]
    DeviceMemory,
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("function failed: {0}")]
    FunctionFailed(String),
    #[error("general error: {0}")]
    GeneralError(String),
    #[error("function not supported")]
    FunctionNotSupported,
}

impl TokenError {
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::ArgumentsBad(err.to_string())
    }

    /// Storage and other collaborator failures surface as device errors.
    pub fn device<E: std::fmt::Display>(err: E) -> Self {
        Self::DeviceError(err.to_string())
    }

    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::FunctionFailed(err.to_string())
    }

    pub fn param<E: std::fmt::Display>(err: E) -> Self {
        Self::MechanismParamInvalid(err.to_string())
    }

    pub fn code(&self) -> CK_RV {
        match self {
            Self::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
            Self::ArgumentsBad(_) => CKR_ARGUMENTS_BAD,
            Self::SlotIdInvalid(_) => CKR_SLOT_ID_INVALID,
            Self::TokenNotRecognized(_) => CKR_TOKEN_NOT_RECOGNIZED,
            Self::SessionHandleInvalid => CKR_SESSION_HANDLE_INVALID,
            Self::SessionClosed => CKR_SESSION_CLOSED,
            Self::SessionExists => CKR_SESSION_EXISTS,
            Self::SessionCount => CKR_SESSION_COUNT,
            Self::SessionParallelNotSupported => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
            Self::SessionReadOnly => CKR_SESSION_READ_ONLY,
            Self::SessionReadOnlyExists => CKR_SESSION_READ_ONLY_EXISTS,
            Self::SessionReadWriteSoExists => CKR_SESSION_READ_WRITE_SO_EXISTS,
            Self::PinIncorrect => CKR_PIN_INCORRECT,
            Self::PinLenRange => CKR_PIN_LEN_RANGE,
            Self::UserNotLoggedIn => CKR_USER_NOT_LOGGED_IN,
            Self::UserAlreadyLoggedIn => CKR_USER_ALREADY_LOGGED_IN,
            Self::UserPinNotInitialized => CKR_USER_PIN_NOT_INITIALIZED,
            Self::UserTypeInvalid => CKR_USER_TYPE_INVALID,
            Self::TemplateIncomplete => CKR_TEMPLATE_INCOMPLETE,
            Self::TemplateInconsistent => CKR_TEMPLATE_INCONSISTENT,
            Self::AttributeTypeInvalid(_) => CKR_ATTRIBUTE_TYPE_INVALID,
            Self::AttributeValueInvalid(_) => CKR_ATTRIBUTE_VALUE_INVALID,
            Self::AttributeReadOnly(_) => CKR_ATTRIBUTE_READ_ONLY,
            Self::AttributeSensitive(_) => CKR_ATTRIBUTE_SENSITIVE,
            Self::ObjectHandleInvalid => CKR_OBJECT_HANDLE_INVALID,
            Self::KeyHandleInvalid => CKR_KEY_HANDLE_INVALID,
            Self::WrappingKeyHandleInvalid => CKR_WRAPPING_KEY_HANDLE_INVALID,
            Self::UnwrappingKeyHandleInvalid => CKR_UNWRAPPING_KEY_HANDLE_INVALID,
            Self::ActionProhibited => CKR_ACTION_PROHIBITED,
            Self::MechanismInvalid(_) => CKR_MECHANISM_INVALID,
            Self::MechanismParamInvalid(_) => CKR_MECHANISM_PARAM_INVALID,
            Self::KeyFunctionNotPermitted => CKR_KEY_FUNCTION_NOT_PERMITTED,
            Self::KeyTypeInconsistent => CKR_KEY_TYPE_INCONSISTENT,
            Self::KeySizeRange => CKR_KEY_SIZE_RANGE,
            Self::KeyUnextractable => CKR_KEY_UNEXTRACTABLE,
            Self::KeyIndigestible => CKR_KEY_INDIGESTIBLE,
            Self::CurveNotSupported => CKR_CURVE_NOT_SUPPORTED,
            Self::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
            Self::OperationActive => CKR_OPERATION_ACTIVE,
            Self::BufferTooSmall => CKR_BUFFER_TOO_SMALL,
            Self::DataLenRange => CKR_DATA_LEN_RANGE,
            Self::EncryptedDataInvalid => CKR_ENCRYPTED_DATA_INVALID,
            Self::EncryptedDataLenRange => CKR_ENCRYPTED_DATA_LEN_RANGE,
            Self::SignatureInvalid => CKR_SIGNATURE_INVALID,
            Self::SignatureLenRange => CKR_SIGNATURE_LEN_RANGE,
            Self::WrappedKeyInvalid => CKR_WRAPPED_KEY_INVALID,
            Self::WrappedKeyLenRange => CKR_WRAPPED_KEY_LEN_RANGE,
            Self::DeviceMemory => CKR_DEVICE_MEMORY,
            Self::DeviceError(_) => CKR_DEVICE_ERROR,
            Self::FunctionFailed(_) => CKR_FUNCTION_FAILED,
            Self::GeneralError(_) => CKR_GENERAL_ERROR,
            Self::FunctionNotSupported => CKR_FUNCTION_NOT_SUPPORTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_query_signal_maps_to_buffer_too_small() {
        assert_eq!(TokenError::BufferTooSmall.code(), CKR_BUFFER_TOO_SMALL);
    }

    #[test]
    fn collaborator_failures_are_device_errors() {
        let err = TokenError::device("disk full");
        assert_eq!(err.code(), CKR_DEVICE_ERROR);
        assert_eq!(err.to_string(), "device error: disk full");
    }
}
