//! C ABI for verification. Every returned string must be released with
//! [`FreeString`] exactly once.

#![allow(non_snake_case)]

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::slice;

use log::warn;
use serde_json::json;

use crate::error::{self, Result};
use crate::verify::{verify_attestation, MachineState};

const ERROR_STATUS: c_int = -1;

unsafe fn bytes_arg<'a>(ptr: *const c_char, len: c_int, name: &str) -> Result<&'a [u8]> {
    if len < 0 {
        return Err(error::invalid_argument(format!("{} length is negative", name)));
    }
    if ptr.is_null() || len == 0 {
        return Ok(&[]);
    }

    Ok(slice::from_raw_parts(ptr as *const u8, len as usize))
}

unsafe fn str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(error::invalid_argument(format!("{} is null", name)));
    }

    CStr::from_ptr(ptr).to_str()
        .map_err(|e| error::conversion(e, Some(format!("{} is not UTF-8", name))))
}

unsafe fn verify(data: *const c_char, len: c_int, format: *const c_char,
                 nonce: *const c_char, nonce_len: c_int,
                 tee_nonce: *const c_char, tee_nonce_len: c_int) -> Result<MachineState> {
    let data = bytes_arg(data, len, "attestation")?;
    let format = str_arg(format, "format")?;
    let nonce = bytes_arg(nonce, nonce_len, "nonce")?;
    let tee_nonce = bytes_arg(tee_nonce, tee_nonce_len, "TEE nonce")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| error::io(e, Some("failed to start runtime".into())))?;

    runtime.block_on(verify_attestation(data, format, nonce, tee_nonce))
}

fn into_raw(payload: String) -> *mut c_char {
    match CString::new(payload) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Verifies an attestation and returns the machine state as JSON. On failure
/// returns `{"error": ..., "success": false}` and sets `out_len` to -1;
/// otherwise `out_len` is the JSON length.
///
/// # Safety
///
/// Pointers must be valid for their lengths, `format` must be NUL-terminated
/// and `out_len` must be writable or null.
#[no_mangle]
pub unsafe extern "C" fn VerifyAttestationFFI(data: *const c_char, len: c_int,
                                              format: *const c_char,
                                              nonce: *const c_char, nonce_len: c_int,
                                              tee_nonce: *const c_char, tee_nonce_len: c_int,
                                              out_len: *mut c_int) -> *mut c_char {
    let result = verify(data, len, format, nonce, nonce_len, tee_nonce, tee_nonce_len)
        .and_then(|state| serde_json::to_string(&state).map_err(error::map_conversion_err));

    let (payload, status) = match result {
        Ok(payload) => {
            let status = payload.len() as c_int;
            (payload, status)
        }
        Err(err) => {
            warn!("attestation verification failed: {}", err);
            (json!({ "error": err.to_string(), "success": false }).to_string(), ERROR_STATUS)
        }
    };

    if !out_len.is_null() {
        *out_len = status;
    }

    into_raw(payload)
}

/// Releases a string returned by [`VerifyAttestationFFI`].
///
/// # Safety
///
/// `s` must come from this library and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn FreeString(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::{CStr, CString};
    use std::os::raw::{c_char, c_int};

    use crate::attest::Attester;
    use crate::metadata::fake::FakeMetadata;
    use crate::options::AttestOptions;
    use crate::tee::simulated::SimulatedTeeProviders;
    use crate::tpm::platform::ConfidentialTechnology;
    use crate::tpm::simulated::SimulatedTpm;

    use super::{FreeString, VerifyAttestationFFI};

    fn call(data: &[u8], format: &str, nonce: &[u8]) -> (serde_json::Value, c_int) {
        let format = CString::new(format).unwrap();
        let mut out_len: c_int = 0;

        unsafe {
            let out = VerifyAttestationFFI(data.as_ptr() as *const c_char, data.len() as c_int,
                                           format.as_ptr(),
                                           nonce.as_ptr() as *const c_char, nonce.len() as c_int,
                                           std::ptr::null(), 0, &mut out_len);
            let value = serde_json::from_str(CStr::from_ptr(out).to_str().unwrap()).unwrap();
            FreeString(out);

            (value, out_len)
        }
    }

    fn attestation() -> Vec<u8> {
        let attester = Attester::new(Box::new(SimulatedTpm::new(ConfidentialTechnology::None)),
                                     Box::new(SimulatedTeeProviders::default()),
                                     Box::new(FakeMetadata::default()));
        let opts = AttestOptions { nonce: b"nonce".to_vec(), ..Default::default() };

        tokio::runtime::Runtime::new().unwrap().block_on(attester.attest(&opts)).unwrap()
    }

    #[test]
    fn returns_machine_state() {
        let (value, status) = call(&attestation(), "binarypb", b"nonce");

        assert!(status > 0);
        assert_eq!(value["platform"]["technology"], "NONE");
        assert!(value["tee_attestation"].is_null());
    }

    #[test]
    fn returns_error_payload() {
        let (value, status) = call(&attestation(), "binarypb", b"wrong nonce");

        assert_eq!(status, -1);
        assert_eq!(value["success"], false);
        assert!(value["error"].as_str().unwrap().starts_with("verification error"));

        let (value, status) = call(b"", "yaml", b"nonce");
        assert_eq!(status, -1);
        assert!(value["error"].as_str().unwrap().starts_with("decode error"));
    }

    #[test]
    fn free_null_is_noop() {
        unsafe { FreeString(std::ptr::null_mut()) };
    }
}
