//! Account database of the running Windows system
//!
//! Used by the `get-user-info` helper inside a container to map an account
//! name of the image to its SID.

use crate::error::{ExecutorError, Result};
use std::ffi::c_void;
use std::io;
use std::ptr;
use windows_sys::Win32::Foundation::{LocalFree, ERROR_INSUFFICIENT_BUFFER, ERROR_NONE_MAPPED};
use windows_sys::Win32::Security::Authorization::ConvertSidToStringSidW;
use windows_sys::Win32::Security::{LookupAccountNameW, SID_NAME_USE};

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn lookup_failed(name: &str, err: io::Error) -> ExecutorError {
    if err.raw_os_error() == Some(ERROR_NONE_MAPPED as i32) {
        ExecutorError::IdentityNotFound(name.to_string())
    } else {
        ExecutorError::Io(io::Error::new(err.kind(), format!("looking up account {}: {}", name, err)))
    }
}

/// Resolve `name` to the string form of its SID
pub fn lookup_account_sid(name: &str) -> Result<String> {
    let account = wide(name);
    let mut sid_len = 0u32;
    let mut domain_len = 0u32;
    let mut kind: SID_NAME_USE = 0;

    // The first call only reports the buffer sizes
    let ok = unsafe {
        LookupAccountNameW(
            ptr::null(),
            account.as_ptr(),
            ptr::null_mut(),
            &mut sid_len,
            ptr::null_mut(),
            &mut domain_len,
            &mut kind,
        )
    };
    if ok == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_INSUFFICIENT_BUFFER as i32) {
            return Err(lookup_failed(name, err));
        }
    }

    // SIDs are DWORD aligned
    let mut sid = vec![0u32; (sid_len as usize).div_ceil(4)];
    let mut domain = vec![0u16; domain_len as usize];
    let ok = unsafe {
        LookupAccountNameW(
            ptr::null(),
            account.as_ptr(),
            sid.as_mut_ptr() as *mut c_void,
            &mut sid_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut kind,
        )
    };
    if ok == 0 {
        return Err(lookup_failed(name, io::Error::last_os_error()));
    }

    let mut text: *mut u16 = ptr::null_mut();
    if unsafe { ConvertSidToStringSidW(sid.as_mut_ptr() as *mut c_void, &mut text) } == 0 {
        return Err(ExecutorError::Io(io::Error::last_os_error()));
    }
    let sid = unsafe {
        let len = (0..).take_while(|&i| *text.add(i) != 0).count();
        let value = String::from_utf16_lossy(std::slice::from_raw_parts(text, len));
        LocalFree(text as _);
        value
    };
    Ok(sid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_well_known_account() {
        assert_eq!(lookup_account_sid("SYSTEM").unwrap(), "S-1-5-18");
    }

    #[test]
    fn test_lookup_unknown_account() {
        assert!(matches!(
            lookup_account_sid("rune-no-such-account"),
            Err(ExecutorError::IdentityNotFound(_))
        ));
    }
}
