use std::ptr::NonNull;

#[cfg(unix)]
mod os {
    use core::ffi::c_void;

    const PROT_READ_WRITE: i32 = 0x1 | 0x2;
    #[cfg(target_os = "linux")]
    const MAP_PRIVATE_ANON: i32 = 0x02 | 0x20;
    #[cfg(not(target_os = "linux"))]
    const MAP_PRIVATE_ANON: i32 = 0x02 | 0x1000;

    unsafe extern "C" {
        fn mmap(addr: *mut c_void, len: usize, prot: i32, flags: i32, fd: i32, off: isize) -> *mut c_void;
        fn munmap(addr: *mut c_void, len: usize) -> i32;
    }

    /// Zero-filled private mapping, null on failure.
    ///
    /// # Safety
    /// `len` must be non-zero.
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: anonymous mapping, no fd, kernel picks the address
        let p = unsafe { mmap(core::ptr::null_mut(), len, PROT_READ_WRITE, MAP_PRIVATE_ANON, -1, 0) };
        // MAP_FAILED
        if p as isize == -1 { core::ptr::null_mut() } else { p.cast() }
    }

    /// # Safety
    /// `ptr`/`len` must describe one live mapping from `anonymous_mmap`.
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: contract of the caller
        let rc = unsafe { munmap(ptr.cast(), len) };
        debug_assert_eq!(rc, 0, "munmap of {len} bytes failed");
    }
}

#[cfg(not(unix))]
mod fallback {
    use std::alloc::{self, Layout};

    use super::OS_PAGE_SIZE;

    pub fn layout(len: usize) -> Option<Layout> {
        Layout::from_size_align(len, OS_PAGE_SIZE).ok()
    }

    /// # Safety
    /// `len` must be non-zero; null must be checked
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        match layout(len) {
            // SAFETY: layout has non-zero size
            Some(layout) => unsafe { alloc::alloc_zeroed(layout) },
            None => core::ptr::null_mut(),
        }
    }

    /// # Safety
    /// must come from `anonymous_mmap` with the same length
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        if let Some(layout) = layout(len) {
            // SAFETY: contract of the caller
            unsafe { alloc::dealloc(ptr, layout) };
        }
    }
}

#[cfg(not(unix))]
use fallback as os;

pub const OS_PAGE_SIZE: usize = 4096;

/// Maps `size` bytes of zeroed, page aligned memory.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    // SAFETY: size is non-zero, the result is null checked
    let ptr = unsafe { os::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// # Safety
/// `ptr` must come from [`map_memory`] called with the same `size`,
/// and nothing may reference the range afterwards.
pub unsafe fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: contract of the caller
    unsafe { os::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Address of a local in the caller's frame, an approximation of the
/// current stack pointer. Stacks grow toward lower addresses.
#[inline(never)]
pub fn approx_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_zeroed_and_page_aligned() {
        let size = 4 * OS_PAGE_SIZE;
        let ptr = map_memory(size).expect("mapping should succeed");
        assert_eq!(ptr.as_ptr() as usize % OS_PAGE_SIZE, 0);

        // SAFETY: freshly mapped range of `size` bytes
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0), "mapping must be zero filled");

        // SAFETY: mapped above with the same size
        unsafe { unmap_memory(ptr, size) };
    }

    #[test]
    fn zero_sized_mapping_is_refused() {
        assert!(map_memory(0).is_none());
    }

    #[test]
    fn approx_sp_moves_down_in_nested_frames() {
        #[inline(never)]
        fn nested() -> usize {
            let pad = [0u8; 256];
            std::hint::black_box(&pad);
            approx_sp()
        }
        let outer = approx_sp();
        let inner = nested();
        assert!(inner < outer, "deeper frames must have lower addresses");
    }
}
