//! Rust bindings for the host's virtual memory calls: `mmap` and
//! friends on unix, `VirtualAlloc` and friends on windows.
//!
//! Errors are reported as raw OS error numbers.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::backend::Access;

#[cfg(not(any(unix, windows)))]
compile_error!("quarry only knows how to map memory on unix and windows");

/// Returns the raw OS error for the last failed call.
fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(unix)]
mod sys {
    use super::*;

    // `MAP_NORESERVE` keeps reservations out of the commit charge
    // where the platform supports it.
    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
    const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    const MAP_NORESERVE: libc::c_int = 0;

    pub fn page_size() -> Result<usize, i32> {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        if ret <= 0 {
            Err(last_errno())
        } else {
            Ok(ret as usize)
        }
    }

    pub unsafe fn reserve(size: usize) -> Result<NonNull<c_void>, i32> {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_NORESERVE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(last_errno());
        }

        NonNull::new(ptr).ok_or(libc::ENOMEM)
    }

    pub unsafe fn protect(base: NonNull<c_void>, size: usize, access: Access) -> Result<(), i32> {
        let prot = match access {
            Access::NoAccess => libc::PROT_NONE,
            Access::Read => libc::PROT_READ,
            Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        if libc::mprotect(base.as_ptr(), size, prot) == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    pub unsafe fn discard(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        if libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    pub unsafe fn release(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        if libc::munmap(base.as_ptr(), size) == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;

    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE,
        MEM_RESERVE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub fn page_size() -> Result<usize, i32> {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };

        Ok(info.dwPageSize as usize)
    }

    pub unsafe fn reserve(size: usize) -> Result<NonNull<c_void>, i32> {
        NonNull::new(VirtualAlloc(
            std::ptr::null(),
            size,
            MEM_RESERVE,
            PAGE_NOACCESS,
        ))
        .ok_or_else(last_errno)
    }

    unsafe fn decommit(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        if VirtualFree(base.as_ptr(), size, MEM_DECOMMIT) != 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    pub unsafe fn protect(base: NonNull<c_void>, size: usize, access: Access) -> Result<(), i32> {
        // Windows only grants access to committed pages, so any
        // access right implies a commit, and revoking all access
        // decommits.
        let flags = match access {
            Access::NoAccess => return decommit(base, size),
            Access::Read => PAGE_READONLY,
            Access::ReadWrite => PAGE_READWRITE,
        };

        if VirtualAlloc(base.as_ptr(), size, MEM_COMMIT, PAGE_READWRITE).is_null() {
            return Err(last_errno());
        }

        if flags == PAGE_READWRITE {
            return Ok(());
        }

        let mut old: PAGE_PROTECTION_FLAGS = 0;
        if VirtualProtect(base.as_ptr(), size, flags, &mut old) != 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    pub unsafe fn discard(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        decommit(base, size)
    }

    pub unsafe fn release(base: NonNull<c_void>, _size: usize) -> Result<(), i32> {
        // MEM_RELEASE always frees the whole allocation, and insists
        // on a zero size.
        if VirtualFree(base.as_ptr(), 0, MEM_RELEASE) != 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }
}

fn page_size_or_die() -> usize {
    let ret = sys::page_size().unwrap_or_else(|errno| {
        panic!("Unable to find page_size: errno={}", errno);
    });

    assert!(ret.is_power_of_two(), "Bad page_size={}", ret);
    ret
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn check_region(size: usize) {
    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );
}

/// Attempts to reserve an *address space* region of `size` bytes,
/// without access rights or backing memory.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    unsafe { sys::reserve(size) }
}

/// Changes the access rights for the region of `size` bytes starting
/// at `base`.  Granting access also backs the region with
/// (demand-faulted) memory.
///
/// The size argument must be a multiple of the page size.
pub fn protect_region(base: NonNull<c_void>, size: usize, access: Access) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(size);
    unsafe { sys::protect(base, size, access) }
}

/// Drops the memory backing the region of `size` bytes starting at
/// `base`.  The address space stays reserved.
///
/// The size argument must be a multiple of the page size.
pub fn discard_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(size);
    unsafe { sys::discard(base, size) }
}

/// Releases a region of `size` bytes starting at `base`.  The region
/// must be exactly one range returned by `reserve_region`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    check_region(size);
    unsafe { sys::release(base, size) }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

// Reserve a range, commit a page in the middle, scribble on it,
// decommit, and release everything.
#[test]
fn smoke_test() {
    let region_size = 16 * page_size();
    let base = reserve_region(region_size).expect("reserve should succeed");

    let middle = NonNull::new((base.as_ptr() as usize + 4 * page_size()) as *mut c_void)
        .expect("Should be non-null");

    protect_region(middle, 2 * page_size(), Access::ReadWrite).expect("should commit middle");
    unsafe {
        let bytes = middle.as_ptr() as *mut u8;

        std::ptr::write_bytes(bytes, 42, 2 * page_size());
        assert_eq!(std::ptr::read(bytes.add(2 * page_size() - 1)), 42);
    }

    protect_region(middle, page_size(), Access::Read).expect("should downgrade");
    assert_eq!(unsafe { std::ptr::read(middle.as_ptr() as *const u8) }, 42);

    protect_region(middle, 2 * page_size(), Access::NoAccess).expect("should revoke");
    discard_region(middle, 2 * page_size()).expect("should discard");

    protect_region(middle, 2 * page_size(), Access::ReadWrite).expect("should recommit");
    // Darwin's MADV_DONTNEED is only a hint.
    #[cfg(any(target_os = "linux", windows))]
    assert_eq!(unsafe { std::ptr::read(middle.as_ptr() as *const u8) }, 0);

    release_region(base, region_size).expect("should release everything");
}

#[test]
fn empty_regions_are_noops() {
    let base = NonNull::new(page_size() as *mut c_void).expect("Should be non-null");

    protect_region(base, 0, Access::ReadWrite).expect("empty protect should succeed");
    discard_region(base, 0).expect("empty discard should succeed");
    release_region(base, 0).expect("empty release should succeed");
}
