// C ABI over the encoder, declared for C callers in include/sgn_encoder.h. Encoders live in a
// process-wide registry keyed by opaque 64-bit handles; handle 0 is never issued and doubles
// as the construction-failure value. The registry lock is held only to insert, clone out or
// remove an Arc<Encoder>, so concurrent encode calls on one handle run in parallel. Results
// cross the boundary as an SgnByteArray that owns a Rust Vec's allocation until it is passed
// back to sgn_free_byte_array, which resets it to the empty array.

//! C ABI: handle registry, status codes and result buffers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::{mem, ptr, slice};

use hashbrown::HashMap;
use log::debug;
use once_cell::sync::Lazy;

use crate::core::config::Architecture;
use crate::core::error::SgnError;
use crate::encoder::Encoder;

/// Opaque encoder handle.
pub type SgnHandle = u64;

pub const SGN_INVALID_HANDLE: SgnHandle = 0;

pub const SGN_OK: i32 = 0;
pub const SGN_ERR_INVALID_ARGUMENT: i32 = -1;
pub const SGN_ERR_CONFIGURATION: i32 = -2;
pub const SGN_ERR_ENCODING: i32 = -3;
pub const SGN_ERR_ALLOCATION: i32 = -4;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Lazy<Mutex<HashMap<SgnHandle, Arc<Encoder>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn register(encoder: Encoder) -> SgnHandle {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(handle, Arc::new(encoder));
    handle
}

fn lookup(handle: SgnHandle) -> Option<Arc<Encoder>> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&handle)
        .cloned()
}

fn unregister(handle: SgnHandle) -> bool {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&handle)
        .is_some()
}

/// Status code for an encode failure.
pub fn status_code(error: &SgnError) -> i32 {
    match error {
        SgnError::Configuration(_) => SGN_ERR_CONFIGURATION,
        SgnError::Encoding(_) => SGN_ERR_ENCODING,
        SgnError::Allocation(_) => SGN_ERR_ALLOCATION,
    }
}

/// Heap buffer handed to C. `data` is null exactly when the array is empty.
#[repr(C)]
#[derive(Debug)]
pub struct SgnByteArray {
    pub data: *mut u8,
    pub len: usize,
    pub capacity: usize,
}

impl SgnByteArray {
    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
        }
    }

    fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.capacity() == 0 {
            return Self::empty();
        }
        let mut bytes = mem::ManuallyDrop::new(bytes);
        Self {
            data: bytes.as_mut_ptr(),
            len: bytes.len(),
            capacity: bytes.capacity(),
        }
    }

    /// Borrow the contents.
    ///
    /// # Safety
    /// `self` must be empty or have been produced by `sgn_encoder_encode` and not yet freed.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            slice::from_raw_parts(self.data, self.len)
        }
    }
}

fn create(architecture: Architecture, seed: u8, plain_decoder: bool, encoding_count: u32, save_registers: bool) -> SgnHandle {
    match Encoder::new(architecture, seed, plain_decoder, encoding_count, save_registers) {
        Ok(encoder) => {
            let handle = register(encoder);
            debug!("ffi: created {architecture} encoder handle {handle}");
            handle
        }
        Err(err) => {
            debug!("ffi: rejected {architecture} encoder: {err}");
            SGN_INVALID_HANDLE
        }
    }
}

/// Create an encoder for architecture id `arch` (0 x64, 1 x32, 2 aarch64).
/// Returns 0 on a configuration error.
#[no_mangle]
pub extern "C" fn sgn_encoder_new(
    arch: u32,
    seed: u8,
    plain_decoder: bool,
    encoding_count: u32,
    save_registers: bool,
) -> SgnHandle {
    match Architecture::from_id(arch) {
        Ok(architecture) => create(architecture, seed, plain_decoder, encoding_count, save_registers),
        Err(err) => {
            debug!("ffi: {err}");
            SGN_INVALID_HANDLE
        }
    }
}

#[no_mangle]
pub extern "C" fn sgn_encoder_x64_new(seed: u8, plain_decoder: bool, encoding_count: u32, save_registers: bool) -> SgnHandle {
    create(Architecture::X64, seed, plain_decoder, encoding_count, save_registers)
}

#[no_mangle]
pub extern "C" fn sgn_encoder_x32_new(seed: u8, plain_decoder: bool, encoding_count: u32, save_registers: bool) -> SgnHandle {
    create(Architecture::X32, seed, plain_decoder, encoding_count, save_registers)
}

#[no_mangle]
pub extern "C" fn sgn_encoder_aarch64_new(
    seed: u8,
    plain_decoder: bool,
    encoding_count: u32,
    save_registers: bool,
) -> SgnHandle {
    create(Architecture::AArch64, seed, plain_decoder, encoding_count, save_registers)
}

/// Release an encoder. Unknown handles are ignored.
#[no_mangle]
pub extern "C" fn sgn_encoder_free(handle: SgnHandle) {
    if !unregister(handle) {
        debug!("ffi: free of unknown handle {handle}");
    }
}

/// Encode `payload_len` bytes at `payload` into `*out`.
///
/// # Safety
/// `payload` must point to `payload_len` readable bytes (it may be null when `payload_len`
/// is 0) and `out` must point to writable storage for one `SgnByteArray`.
#[no_mangle]
pub unsafe extern "C" fn sgn_encoder_encode(
    handle: SgnHandle,
    payload: *const u8,
    payload_len: usize,
    out: *mut SgnByteArray,
) -> i32 {
    if out.is_null() {
        return SGN_ERR_INVALID_ARGUMENT;
    }
    ptr::write(out, SgnByteArray::empty());

    if payload.is_null() && payload_len != 0 {
        return SGN_ERR_INVALID_ARGUMENT;
    }
    let Some(encoder) = lookup(handle) else {
        return SGN_ERR_INVALID_ARGUMENT;
    };
    let payload = if payload_len == 0 {
        &[][..]
    } else {
        slice::from_raw_parts(payload, payload_len)
    };

    match catch_unwind(AssertUnwindSafe(|| encoder.encode(payload))) {
        Ok(Ok(buffer)) => {
            ptr::write(out, SgnByteArray::from_vec(buffer.into_vec()));
            SGN_OK
        }
        Ok(Err(err)) => {
            debug!("ffi: encode on handle {handle} failed: {err}");
            status_code(&err)
        }
        Err(_) => SGN_ERR_ENCODING,
    }
}

/// Free a buffer produced by `sgn_encoder_encode` and reset it to empty.
///
/// # Safety
/// `out` must be null or point to an `SgnByteArray` that is empty or was produced by
/// `sgn_encoder_encode`.
#[no_mangle]
pub unsafe extern "C" fn sgn_free_byte_array(out: *mut SgnByteArray) {
    if out.is_null() {
        return;
    }
    let array = ptr::replace(out, SgnByteArray::empty());
    if !array.data.is_null() {
        drop(Vec::from_raw_parts(array.data, array.len, array.capacity));
    }
}
