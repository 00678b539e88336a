use ctor::ctor;
use libsodium_sys;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Fills `length` raw bytes at `address` with cryptographically secure random bytes.
///
/// The caller must guarantee that `address` points at `length` writable bytes.
#[inline]
pub unsafe fn random_fill(address: *mut u8, length: usize) {
    libsodium_sys::randombytes_buf(address as *mut ::std::ffi::c_void, length);
}
