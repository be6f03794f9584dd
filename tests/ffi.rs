//! C ABI lifecycle and status codes.

use std::ptr;

use sgn_engine::ffi::*;
use sgn_engine::{emulator, Architecture};

#[test]
fn test_create_encode_free_lifecycle() {
    let handle = sgn_encoder_aarch64_new(0x21, false, 2, true);
    assert_ne!(handle, SGN_INVALID_HANDLE);

    let payload = [0xD5u8, 0x03, 0x20, 0x1F, 0xAA];
    let mut out = SgnByteArray::empty();
    let status = unsafe { sgn_encoder_encode(handle, payload.as_ptr(), payload.len(), &mut out) };
    assert_eq!(status, SGN_OK);
    assert!(!out.data.is_null());

    let bytes = unsafe { out.as_slice() }.to_vec();
    let stub_len = bytes.len() - payload.len();
    let outcome =
        emulator::execute_raw(Architecture::AArch64, &bytes, stub_len, emulator::DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(outcome.payload, payload);

    unsafe { sgn_free_byte_array(&mut out) };
    assert!(out.data.is_null());
    assert_eq!(out.len, 0);
    unsafe { sgn_free_byte_array(&mut out) };

    sgn_encoder_free(handle);
}

#[test]
fn test_generic_constructor_matches_specific() {
    let generic = sgn_encoder_new(1, 0x10, true, 1, false);
    let specific = sgn_encoder_x32_new(0x10, true, 1, false);
    let payload = b"abc";
    let (mut a, mut b) = (SgnByteArray::empty(), SgnByteArray::empty());
    unsafe {
        assert_eq!(sgn_encoder_encode(generic, payload.as_ptr(), payload.len(), &mut a), SGN_OK);
        assert_eq!(sgn_encoder_encode(specific, payload.as_ptr(), payload.len(), &mut b), SGN_OK);
        assert_eq!(a.as_slice(), b.as_slice());
        sgn_free_byte_array(&mut a);
        sgn_free_byte_array(&mut b);
    }
    sgn_encoder_free(generic);
    sgn_encoder_free(specific);
}

#[test]
fn test_rejected_configurations() {
    assert_eq!(sgn_encoder_x64_new(1, false, 0, false), SGN_INVALID_HANDLE);
    assert_eq!(sgn_encoder_new(3, 1, false, 1, false), SGN_INVALID_HANDLE);
}

#[test]
fn test_invalid_arguments_leave_empty_buffer() {
    let handle = sgn_encoder_x64_new(5, true, 1, false);
    let mut out = SgnByteArray::empty();
    unsafe {
        assert_eq!(sgn_encoder_encode(handle, ptr::null(), 4, &mut out), SGN_ERR_INVALID_ARGUMENT);
        assert!(out.data.is_null());
        assert_eq!(
            sgn_encoder_encode(handle, [1u8].as_ptr(), 1, ptr::null_mut()),
            SGN_ERR_INVALID_ARGUMENT
        );
        assert_eq!(
            sgn_encoder_encode(u64::MAX, [1u8].as_ptr(), 1, &mut out),
            SGN_ERR_INVALID_ARGUMENT
        );
        assert!(out.data.is_null());
    }
    sgn_encoder_free(handle);

    let mut stale = SgnByteArray::empty();
    let status = unsafe { sgn_encoder_encode(handle, [1u8].as_ptr(), 1, &mut stale) };
    assert_eq!(status, SGN_ERR_INVALID_ARGUMENT);
}

#[test]
fn test_empty_payload_with_null_pointer() {
    let handle = sgn_encoder_x32_new(5, false, 2, true);
    let mut out = SgnByteArray::empty();
    let status = unsafe { sgn_encoder_encode(handle, ptr::null(), 0, &mut out) };
    assert_eq!(status, SGN_OK);
    assert!(out.len > 0);
    unsafe { sgn_free_byte_array(&mut out) };
    sgn_encoder_free(handle);
}
