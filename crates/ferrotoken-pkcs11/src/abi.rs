//! Raw pointer plumbing shared by the exported entry points.
//!
//! Everything that dereferences caller memory lives here so the entry points
//! only deal in slices, core types and [`Output`] values.

use std::ptr;

use cryptoki_sys::{CK_BYTE, CK_RV, CK_ULONG, CK_ULONG_PTR, CKR_BUFFER_TOO_SMALL, CKR_OK};
use ferrotoken_core::{Handle, Output, TokenError};

use crate::FrontendError;

pub(crate) fn handle(raw: CK_ULONG) -> Handle {
    Handle::from_raw(u64::from(raw))
}

/// A handle the caller cannot hold without truncation is never handed out.
pub(crate) fn raw_handle(handle: Handle) -> Result<CK_ULONG, FrontendError> {
    CK_ULONG::try_from(handle.raw()).map_err(|_| {
        FrontendError::Token(TokenError::GeneralError(format!(
            "handle {handle} does not fit in CK_ULONG"
        )))
    })
}

pub(crate) fn bad_arguments(reason: &str) -> FrontendError {
    FrontendError::Token(TokenError::invalid(reason))
}

/// Borrow a caller buffer. A zero length yields an empty slice whatever the
/// pointer holds.
///
/// # Safety
/// `data` must point at `len` readable bytes when `len` is non-zero.
pub(crate) unsafe fn bytes<'a>(data: *const CK_BYTE, len: CK_ULONG) -> Result<&'a [u8], FrontendError> {
    if len == 0 {
        return Ok(&[]);
    }
    if data.is_null() {
        return Err(bad_arguments("null buffer with non-zero length"));
    }
    Ok(unsafe { std::slice::from_raw_parts(data, len as usize) })
}

/// Read the caller's output capacity. A null output buffer is a size query.
///
/// # Safety
/// `out_len` must be null or point at a readable `CK_ULONG`.
pub(crate) unsafe fn capacity(out: *const CK_BYTE, out_len: CK_ULONG_PTR) -> Result<Option<usize>, FrontendError> {
    if out_len.is_null() {
        return Err(bad_arguments("null output length"));
    }
    if out.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { *out_len } as usize))
}

/// Publish an engine result under the two-call length convention.
///
/// # Safety
/// `out_len` must be writable, and `out` must hold at least the capacity that
/// was passed to the engine when it is non-null.
pub(crate) unsafe fn write_output(output: Output, out: *mut CK_BYTE, out_len: CK_ULONG_PTR) -> CK_RV {
    match output {
        Output::Required(len) => {
            unsafe { *out_len = len as CK_ULONG };
            if out.is_null() { CKR_OK } else { CKR_BUFFER_TOO_SMALL }
        }
        Output::Data(data) => {
            if !out.is_null() {
                unsafe { ptr::copy_nonoverlapping(data.as_ptr(), out, data.len()) };
            }
            unsafe { *out_len = data.len() as CK_ULONG };
            CKR_OK
        }
    }
}

/// Size a finished buffer against a capacity, for calls whose result is
/// produced in full before the caller's buffer is considered.
pub(crate) fn fit(data: Vec<u8>, capacity: Option<usize>) -> Output {
    match capacity {
        Some(capacity) if capacity >= data.len() => Output::Data(data),
        _ => Output::Required(data.len()),
    }
}

/// Copy a list of identifiers out under the two-call convention.
///
/// # Safety
/// `count` must be writable and `out` must hold `*count` items when non-null.
pub(crate) unsafe fn write_list<T: Copy>(items: &[T], out: *mut T, count: CK_ULONG_PTR) -> Result<CK_RV, FrontendError> {
    if count.is_null() {
        return Err(bad_arguments("null count"));
    }
    let available = unsafe { *count } as usize;
    unsafe { *count = items.len() as CK_ULONG };
    if out.is_null() {
        return Ok(CKR_OK);
    }
    if available < items.len() {
        return Ok(CKR_BUFFER_TOO_SMALL);
    }
    unsafe { ptr::copy_nonoverlapping(items.as_ptr(), out, items.len()) };
    Ok(CKR_OK)
}

/// Borrow a caller-owned out parameter.
///
/// # Safety
/// `target` must be null or valid for writes.
pub(crate) unsafe fn out_param<'a, T>(target: *mut T) -> Result<&'a mut T, FrontendError> {
    unsafe { target.as_mut() }.ok_or_else(|| bad_arguments("null out parameter"))
}

/// Blank-padded fixed-width text field. Input longer than the field is cut on
/// a character boundary.
pub(crate) fn padded<const N: usize>(text: &str) -> [CK_BYTE; N] {
    let mut field = [b' '; N];
    let mut end = text.len().min(N);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&text.as_bytes()[..end]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_cross_the_boundary_without_truncation() {
        let issued = Handle::from_raw(0x0000_0001_2345_6789);
        match raw_handle(issued) {
            Ok(raw) => assert_eq!(handle(raw), issued),
            Err(err) => {
                assert!(std::mem::size_of::<CK_ULONG>() < std::mem::size_of::<u64>());
                assert!(matches!(err, FrontendError::Token(TokenError::GeneralError(_))));
            }
        }
        let small = Handle::from_raw(0x42);
        assert_eq!(raw_handle(small).map(handle).ok(), Some(small));
    }

    #[test]
    fn padded_fields_are_blank_filled_and_truncated() {
        assert_eq!(&padded::<6>("abc"), b"abc   ");
        assert_eq!(&padded::<4>("abcdef"), b"abcd");
        // 'é' is two bytes; it must not be split.
        assert_eq!(&padded::<4>("abcé"), b"abc ");
    }

    #[test]
    fn size_query_reports_length_and_ok() {
        let mut len: CK_ULONG = 0;
        let rv = unsafe { write_output(Output::Required(48), ptr::null_mut(), &mut len) };
        assert_eq!(rv, CKR_OK);
        assert_eq!(len, 48);
    }

    #[test]
    fn short_buffer_reports_length_and_too_small() {
        let mut buffer = [0u8; 4];
        let mut len: CK_ULONG = buffer.len() as CK_ULONG;
        let rv = unsafe { write_output(Output::Required(16), buffer.as_mut_ptr(), &mut len) };
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
        assert_eq!(len, 16);
    }

    #[test]
    fn list_copy_honours_two_call_convention() {
        let items: [CK_ULONG; 3] = [7, 8, 9];
        let mut count: CK_ULONG = 0;
        assert_eq!(unsafe { write_list(&items, ptr::null_mut(), &mut count) }.ok(), Some(CKR_OK));
        assert_eq!(count, 3);

        let mut short = [0 as CK_ULONG; 2];
        count = 2;
        let rv = unsafe { write_list(&items, short.as_mut_ptr(), &mut count) };
        assert_eq!(rv.ok(), Some(CKR_BUFFER_TOO_SMALL));
        assert_eq!(count, 3);

        let mut out = [0 as CK_ULONG; 3];
        let rv = unsafe { write_list(&items, out.as_mut_ptr(), &mut count) };
        assert_eq!(rv.ok(), Some(CKR_OK));
        assert_eq!(out, items);
    }

    #[test]
    fn null_buffer_with_length_is_rejected() {
        assert!(unsafe { bytes(ptr::null(), 4) }.is_err());
        assert_eq!(unsafe { bytes(ptr::null(), 0) }.ok(), Some(&[][..]));
    }
}
