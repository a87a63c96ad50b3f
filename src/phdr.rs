//! Load-address capture (§4.F "Load-address capture").
//!
//! Walks the dynamic linker's phdr list once and caches the main
//! executable's load base (the entry whose name is empty), so PIE-relative
//! emission can subtract it from every absolute PC written to disk. The
//! walk itself happens off the signal-handler path; the cached value is a
//! plain atomic the handler only reads.

use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicU64, Ordering};

static LOAD_ADDRESS: AtomicU64 = AtomicU64::new(u64::MAX);

/// Returns the cached load address, walking `dl_iterate_phdr` on first use.
/// Per §3 "Invariants", this is captured once after linkage is quiescent
/// and is a monotonic constant thereafter.
pub fn load_address() -> u64 {
    let cached = LOAD_ADDRESS.load(Ordering::Acquire);
    if cached != u64::MAX {
        return cached;
    }
    let found = capture();
    LOAD_ADDRESS.store(found, Ordering::Release);
    found
}

#[cfg(target_os = "linux")]
fn capture() -> u64 {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let out = &mut *(data as *mut u64);
        let name = (*info).dlpi_name;
        if name.is_null() || *name == 0 {
            *out = (*info).dlpi_addr as u64;
            return 1;
        }
        0
    }

    let mut base: u64 = 0;
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut base as *mut u64 as *mut c_void);
    }
    base
}

#[cfg(not(target_os = "linux"))]
fn capture() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_a_stable_value() {
        let a = load_address();
        let b = load_address();
        assert_eq!(a, b);
    }
}
