//! PKCS#11 C ABI front-end for the FerroToken software token.
//!
//! The crate owns the one process-wide [`Engine`], decodes raw `CK_*`
//! structures into core types and exports the `C_*` symbols. Calls are thin:
//! they validate pointers, hand the work to the engine and translate the
//! outcome into a `CK_RV`. A panic never crosses the boundary; it surfaces as
//! `CKR_GENERAL_ERROR`.
//!
//! Environment:
//! - `FERROTOKEN_CONF` names a TOML [`EngineConfig`]; defaults apply if unset.
//! - `FERROTOKEN_LOG` is an `EnvFilter` directive, `warn` if unset.

#![allow(non_snake_case)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use cryptoki_sys::{
    CK_C_INITIALIZE_ARGS, CK_INFO, CK_INFO_PTR, CK_RV, CK_VERSION, CK_VOID_PTR,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_GENERAL_ERROR, CKR_OK,
};
use ferrotoken_core::{Engine, EngineConfig, TokenError};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod abi;
pub mod attribute;
pub mod functions;
pub mod keys;
pub mod mechanism;
pub mod operation;
pub mod session;
pub mod slot;

const CONFIG_ENV: &str = "FERROTOKEN_CONF";
const LOG_ENV: &str = "FERROTOKEN_LOG";

static STATE: Lazy<RwLock<Option<Arc<Engine>>>> = Lazy::new(|| RwLock::new(None));

/// Errors raised by the PKCS#11 front-end prior to translation into
/// CKR_* return codes.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("cryptoki already initialized")]
    AlreadyInitialized,
    #[error("cryptoki not initialized")]
    NotInitialized,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("internal error: {0}")]
    Internal(String),
}

fn translate_error(err: FrontendError) -> CK_RV {
    match err {
        FrontendError::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
        FrontendError::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
        FrontendError::Token(err) => err.code(),
        FrontendError::Internal(_) => CKR_GENERAL_ERROR,
    }
}

fn install_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // A host that already installed a subscriber keeps it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config() -> Result<EngineConfig, FrontendError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => EngineConfig::load(Path::new(&path)).map_err(|err| {
            FrontendError::Internal(format!("configuration {}: {err}", Path::new(&path).display()))
        }),
        None => Ok(EngineConfig::default()),
    }
}

/// Reject initialize arguments this library cannot honour. Locking is always
/// internal, so supplied mutex callbacks are accepted and ignored as long as
/// they come as a complete set.
///
/// # Safety
/// `args` must be null or point at a `CK_C_INITIALIZE_ARGS`.
unsafe fn check_init_args(args: CK_VOID_PTR) -> Result<(), FrontendError> {
    let Some(args) = (unsafe { (args as *const CK_C_INITIALIZE_ARGS).as_ref() }) else {
        return Ok(());
    };
    if !args.pReserved.is_null() {
        return Err(abi::bad_arguments("pReserved must be null"));
    }
    let supplied = [
        args.CreateMutex.is_some(),
        args.DestroyMutex.is_some(),
        args.LockMutex.is_some(),
        args.UnlockMutex.is_some(),
    ];
    if supplied.iter().any(|set| *set) && !supplied.iter().all(|set| *set) {
        return Err(abi::bad_arguments("mutex callbacks must be supplied together"));
    }
    Ok(())
}

/// Build the engine from the environment and publish it.
pub fn initialize(args: CK_VOID_PTR) -> Result<(), FrontendError> {
    install_logging();
    unsafe { check_init_args(args) }?;
    let mut guard = STATE.write();
    if guard.is_some() {
        return Err(FrontendError::AlreadyInitialized);
    }
    let config = load_config()?;
    let engine = Engine::new(config)
        .map_err(|err| FrontendError::Internal(format!("engine start failed: {err}")))?;
    info!(slots = engine.config().slot_count, "cryptoki initialized");
    *guard = Some(Arc::new(engine));
    Ok(())
}

/// Drop the engine. Sessions and their operations go with it.
pub fn finalize() -> Result<(), FrontendError> {
    let mut guard = STATE.write();
    if guard.take().is_none() {
        return Err(FrontendError::NotInitialized);
    }
    info!("cryptoki finalized");
    Ok(())
}

/// The live engine. The global lock is released before the call proceeds,
/// so a slow operation never blocks `C_Finalize`.
fn engine() -> Result<Arc<Engine>, FrontendError> {
    STATE.read().clone().ok_or(FrontendError::NotInitialized)
}

fn report(function: &'static str, err: FrontendError) -> CK_RV {
    match &err {
        FrontendError::Internal(msg) => error!(function, "internal error: {msg}"),
        FrontendError::Token(TokenError::DeviceError(msg)) => error!(function, "device error: {msg}"),
        FrontendError::Token(err) => debug!(function, error = %err, "call failed"),
        _ => {}
    }
    translate_error(err)
}

/// Run an entry point body against the live engine.
pub(crate) fn call<F>(function: &'static str, body: F) -> CK_RV
where
    F: FnOnce(&Engine) -> Result<CK_RV, FrontendError>,
{
    guarded(function, || {
        let engine = engine()?;
        body(engine.as_ref())
    })
}

/// Run an entry point body that does not need the engine.
pub(crate) fn guarded<F>(function: &'static str, body: F) -> CK_RV
where
    F: FnOnce() -> Result<CK_RV, FrontendError>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(rv)) => rv,
        Ok(Err(err)) => report(function, err),
        Err(_) => {
            error!(function, "panic caught at the C boundary");
            CKR_GENERAL_ERROR
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Initialize(pInitArgs: CK_VOID_PTR) -> CK_RV {
    guarded("C_Initialize", || initialize(pInitArgs).map(|()| CKR_OK))
}

#[unsafe(no_mangle)]
pub extern "C" fn C_Finalize(pReserved: CK_VOID_PTR) -> CK_RV {
    guarded("C_Finalize", || {
        if !pReserved.is_null() {
            return Err(abi::bad_arguments("pReserved must be null"));
        }
        finalize().map(|()| CKR_OK)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn C_GetInfo(pInfo: CK_INFO_PTR) -> CK_RV {
    call("C_GetInfo", |engine| {
        let out = unsafe { abi::out_param(pInfo) }?;
        let info = engine.info();
        *out = CK_INFO {
            cryptokiVersion: CK_VERSION {
                major: info.cryptoki_version.0,
                minor: info.cryptoki_version.1,
            },
            manufacturerID: abi::padded(&info.manufacturer),
            flags: 0,
            libraryDescription: abi::padded(&info.description),
            libraryVersion: CK_VERSION {
                major: info.library_version.0,
                minor: info.library_version.1,
            },
        };
        Ok(CKR_OK)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ptr;

    /// The engine is process-wide; tests that touch it take this lock.
    pub(crate) static SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn initialize_and_finalize_follow_the_state_machine() {
        let _serial = SERIAL.lock();
        let _ = finalize();

        assert_eq!(C_Finalize(ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
        assert_eq!(C_Initialize(ptr::null_mut()), CKR_OK);
        assert_eq!(C_Initialize(ptr::null_mut()), CKR_CRYPTOKI_ALREADY_INITIALIZED);
        assert_eq!(C_Finalize(ptr::null_mut()), CKR_OK);
        assert_eq!(C_Finalize(ptr::null_mut()), CKR_CRYPTOKI_NOT_INITIALIZED);
    }

    #[test]
    fn calls_before_initialize_are_refused() {
        let _serial = SERIAL.lock();
        let _ = finalize();

        let mut info = std::mem::MaybeUninit::<CK_INFO>::zeroed();
        assert_eq!(C_GetInfo(info.as_mut_ptr()), CKR_CRYPTOKI_NOT_INITIALIZED);
    }

    #[test]
    fn partial_mutex_callbacks_are_rejected() {
        let _serial = SERIAL.lock();
        let _ = finalize();

        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: 0,
            pReserved: ptr::null_mut(),
        };
        unsafe extern "C" fn create(_mutex: *mut CK_VOID_PTR) -> CK_RV {
            CKR_OK
        }
        args.CreateMutex = Some(create);
        let rv = C_Initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as CK_VOID_PTR);
        assert_eq!(rv, cryptoki_sys::CKR_ARGUMENTS_BAD);
        assert!(STATE.read().is_none());
    }

    #[test]
    fn library_info_is_blank_padded() {
        let _serial = SERIAL.lock();
        let _ = finalize();
        assert_eq!(C_Initialize(ptr::null_mut()), CKR_OK);

        let mut info = std::mem::MaybeUninit::<CK_INFO>::zeroed();
        assert_eq!(C_GetInfo(info.as_mut_ptr()), CKR_OK);
        let info = unsafe { info.assume_init() };
        assert_eq!(info.cryptokiVersion.major, 2);
        assert_eq!(info.cryptokiVersion.minor, 40);
        assert!(info.manufacturerID.starts_with(b"FerroLabs AG "));
        assert_eq!(C_GetInfo(ptr::null_mut()), cryptoki_sys::CKR_ARGUMENTS_BAD);

        assert_eq!(C_Finalize(ptr::null_mut()), CKR_OK);
    }
}
