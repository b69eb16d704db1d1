//! A `Reservation` owns a contiguous range of address space, and lets
//! its owner commit (`map`) and decommit (`unmap`) prefixes of that
//! range.  The whole range goes back to the operating system when the
//! `Reservation` is dropped.
//!
//! The backend only hands out spans aligned to its own page size.
//! When the caller asks for a page size or an alignment stronger than
//! that, we over-reserve by `max(page_size, alignment)` bytes and skip
//! to the first such aligned address past the beginning of the span.
//! The layout looks like
//!
//! | slack ... adjustment | data ... data | tail slack |
//!
//! where the adjustment word immediately precedes `base` and holds
//! the distance from the OS span's start to `base`.  The slack is
//! read-only for the reservation's lifetime.
//!
//! Backend failures are fatal: we log them and abort the process.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr::NonNull;

use crate::align::{align_down, align_up, is_valid_granule};
use crate::backend::{get_backend, Access, Backend};

/// Reservations default to 16 KB pages on ARM64 and Apple targets.
#[cfg(any(target_arch = "aarch64", target_vendor = "apple"))]
pub const DEFAULT_PAGE_SIZE: usize = 16 << 10;
/// Reservations default to 4 KB pages everywhere else.
#[cfg(not(any(target_arch = "aarch64", target_vendor = "apple")))]
pub const DEFAULT_PAGE_SIZE: usize = 4 << 10;

static_assertions::const_assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
// The adjustment word must fit in the slack before `base`, and the
// slack is always at least one page.
static_assertions::const_assert!(DEFAULT_PAGE_SIZE >= std::mem::size_of::<usize>());

/// A reservation is configured with a size, an optional page size and
/// alignment, and an optional backend name.
#[derive(Clone, Debug, Default)]
pub struct ReservationConfig {
    pub reserve_size: usize,
    /// `None` or `Some(0)` picks the `DEFAULT_PAGE_SIZE`.
    pub page_size: Option<usize>,
    /// 0 means "page-aligned".
    pub alignment: usize,
    /// `None` picks the operating system's backend.
    pub backend_name: Option<String>,
}

/// The extern "C" interface uses this version of `ReservationConfig`.
#[repr(C)]
pub struct ForeignReservationConfig {
    pub reserve_size: usize,
    /// 0 picks the `DEFAULT_PAGE_SIZE`.
    pub page_size: usize,
    pub alignment: usize,
    /// NULL picks the operating system's backend.
    pub backend_name: *const c_char,
}

impl ReservationConfig {
    pub fn new(reserve_size: usize) -> ReservationConfig {
        ReservationConfig {
            reserve_size,
            ..Default::default()
        }
    }

    /// Attempts to convert a `ForeignReservationConfig` pointer to a
    /// native `ReservationConfig`.
    ///
    /// # Safety
    ///
    /// This function assumes `config_ptr` is NULL or valid.
    pub unsafe fn from_c(config_ptr: *const ForeignReservationConfig) -> Option<ReservationConfig> {
        if config_ptr.is_null() {
            return None;
        }

        let config: &ForeignReservationConfig = &*config_ptr;
        if config.reserve_size == 0
            || !is_valid_granule(config.page_size)
            || !is_valid_granule(config.alignment)
        {
            return None;
        }

        let backend_name = if config.backend_name.is_null() {
            None
        } else {
            Some(CStr::from_ptr(config.backend_name).to_str().ok()?.to_owned())
        };

        Some(ReservationConfig {
            reserve_size: config.reserve_size,
            page_size: Some(config.page_size),
            alignment: config.alignment,
            backend_name,
        })
    }
}

pub struct Reservation {
    /// First byte of the logical region, aligned to
    /// `max(page_size, alignment)`.
    base: NonNull<u8>,
    reserved_size: usize,
    page_size: usize,
    alignment: usize,
    /// Start of the span we got from the backend.  Equal to `base`
    /// unless `max(page_size, alignment)` exceeds the backend's page
    /// size.
    os_base: NonNull<u8>,
    backend: &'static dyn Backend,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &self.base)
            .field("reserved_size", &self.reserved_size)
            .field("page_size", &self.page_size)
            .field("alignment", &self.alignment)
            .field("os_base", &self.os_base)
            .field("backend_page_size", &self.backend.page_size())
            .finish()
    }
}

/// A `Reservation` is the only handle to its range of address space,
/// so it's safe to move it across threads.  It is not `Sync`: callers
/// must serialise `map` / `unmap`, and `&mut self` does that for us.
unsafe impl Send for Reservation {}

/// Aborts the process after logging that `what` failed with `errno`.
#[cold]
#[inline(never)]
fn die(what: &str, errno: i32) -> ! {
    log::error!("quarry: {} failed: errno={}", what, errno);
    std::process::abort()
}

#[inline]
fn or_die<T>(result: Result<T, i32>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(errno) => die(what, errno),
    }
}

/// Returns the number of bytes of slack to reserve in front of the
/// data, or 0 if the backend's own alignment is enough.
#[inline]
fn padding_for(page_size: usize, alignment: usize, backend_page_size: usize) -> usize {
    let granule = page_size.max(alignment);

    if granule > backend_page_size {
        granule
    } else {
        0
    }
}

impl Reservation {
    /// Reserves `reserve_size` bytes of address space from the
    /// operating system, with the default page size and no extra
    /// alignment.
    pub fn new(reserve_size: usize) -> Reservation {
        Reservation::with_backend(
            reserve_size,
            0,
            0,
            get_backend(None).expect("the default backend always exists"),
        )
    }

    /// Reserves address space as described by `config`.
    ///
    /// Panics if `config` names an unknown backend.
    pub fn with_config(config: ReservationConfig) -> Reservation {
        let backend = get_backend(config.backend_name.as_deref())
            .expect("backend_name must name a registered backend");

        Reservation::with_backend(
            config.reserve_size,
            config.page_size.unwrap_or(0),
            config.alignment,
            backend,
        )
    }

    /// Reserves `reserve_size` bytes of address space from `backend`.
    /// The first byte will be aligned to `max(page_size, alignment)`.
    ///
    /// A `page_size` of 0 picks `DEFAULT_PAGE_SIZE` (or the backend's
    /// own page size, if that's larger), and an `alignment` of 0 means
    /// page alignment.  Otherwise, both must be powers of two, and
    /// `page_size` must be a multiple of the backend's page size.
    /// Violations panic.
    ///
    /// Aborts the process if the backend fails.
    #[requires(reserve_size > 0, "Reservations must not be empty.")]
    #[ensures(ret.base.as_ptr() as usize % ret.page_size.max(ret.alignment) == 0,
              "The base is aligned to the page size and to the alignment.")]
    #[ensures(ret.reserved_size == reserve_size)]
    pub fn with_backend(
        reserve_size: usize,
        page_size: usize,
        alignment: usize,
        backend: &'static dyn Backend,
    ) -> Reservation {
        assert!(reserve_size > 0, "Bad reserve_size={}", reserve_size);
        assert!(
            is_valid_granule(page_size) && is_valid_granule(alignment),
            "Bad page_size={} alignment={}",
            page_size,
            alignment
        );

        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE.max(backend.page_size())
        } else {
            page_size
        };

        assert!(
            page_size % backend.page_size() == 0,
            "page_size={} must be a multiple of the backend's page size={}",
            page_size,
            backend.page_size()
        );

        let aligned_size = align_up(reserve_size, page_size);
        let padding = padding_for(page_size, alignment, backend.page_size());

        if padding == 0 {
            let base = or_die(backend.reserve(aligned_size), "reserve").cast::<u8>();

            log::debug!(
                "reserved {} bytes at {:p} (page_size={})",
                aligned_size,
                base.as_ptr(),
                page_size
            );

            let reservation = Reservation {
                base,
                reserved_size: reserve_size,
                page_size,
                alignment,
                os_base: base,
                backend,
            };

            reservation.check_rep();
            return reservation;
        }

        let padded_size = aligned_size
            .checked_add(padding)
            .expect("overflow while padding reservation for alignment");
        let raw = or_die(backend.reserve(padded_size), "reserve");

        // The first `padding`-aligned address strictly after `raw`:
        // there's always at least one backend page of slack for the
        // adjustment word, and at most `padding` bytes, so the data
        // fits in the span.
        let raw_address = raw.as_ptr() as usize;
        let up = align_down(raw_address + padding, padding);
        let diff = up - raw_address;

        // The slack is only writable while we store the adjustment.
        or_die(backend.protect(raw, diff, Access::ReadWrite), "protect");
        unsafe { (up as *mut usize).sub(1).write(diff) };
        or_die(backend.protect(raw, diff, Access::Read), "protect");

        let base = NonNull::new(up as *mut u8).expect("aligned address is past a non-null span");
        log::debug!(
            "reserved {} bytes at {:p} for {} bytes at {:p} (page_size={} alignment={})",
            padded_size,
            raw.as_ptr(),
            aligned_size,
            base.as_ptr(),
            page_size,
            alignment
        );

        let reservation = Reservation {
            base,
            reserved_size: reserve_size,
            page_size,
            alignment,
            os_base: raw.cast::<u8>(),
            backend,
        };

        reservation.check_rep();
        reservation
    }

    /// Returns the address of the first byte in the reservation.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size the reservation was created with.  This is
    /// never rounded to the page size.
    #[inline]
    pub fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    fn padding(&self) -> usize {
        padding_for(self.page_size, self.alignment, self.backend.page_size())
    }

    /// Returns the distance between the start of the OS span and
    /// `base`, as stored in the word just before `base`, when the
    /// reservation is aligned more strongly than the backend's pages.
    pub fn adjustment(&self) -> Option<usize> {
        if self.padding() == 0 {
            return None;
        }

        // The slack page stays readable until we drop the reservation.
        Some(unsafe { (self.base.as_ptr() as *const usize).sub(1).read() })
    }

    /// Returns the start and size of the whole span of address space
    /// obtained from the backend, slack included.
    #[ensures(ret.1 % self.page_size == 0)]
    pub fn os_span(&self) -> (NonNull<u8>, usize) {
        let size = align_up(self.reserved_size, self.page_size) + self.padding();

        (self.os_base, size)
    }

    /// Asserts against internal invariants.
    pub fn check_rep(&self) {
        let base = self.base.as_ptr() as usize;
        let os_base = self.os_base.as_ptr() as usize;
        let (_, span_size) = self.os_span();

        assert!(self.page_size.is_power_of_two(), "self: {:?}", self);
        assert!(is_valid_granule(self.alignment), "self: {:?}", self);
        assert!(self.reserved_size > 0, "self: {:?}", self);
        assert_eq!(
            base % self.page_size.max(self.alignment),
            0,
            "self: {:?}",
            self
        );
        assert_eq!(os_base % self.backend.page_size(), 0, "self: {:?}", self);

        // The data must fit in the OS span.
        assert!(os_base <= base, "self: {:?}", self);
        assert!(
            base + align_up(self.reserved_size, self.page_size) <= os_base + span_size,
            "self: {:?}",
            self
        );

        match self.adjustment() {
            None => assert_eq!(base, os_base, "self: {:?}", self),
            Some(diff) => {
                assert_eq!(base - diff, os_base, "self: {:?}", self);
                assert!(
                    diff >= self.backend.page_size() && diff <= self.padding(),
                    "self: {:?}",
                    self
                );
            }
        }
    }

    /// Returns the page-aligned window that covers `[base, base + size)`.
    #[ensures(ret.1 % self.page_size == 0)]
    #[ensures(ret.1 >= size && ret.1 - size < self.page_size)]
    fn window(&self, size: usize) -> (NonNull<c_void>, usize) {
        let begin = align_down(self.base.as_ptr() as usize, self.page_size);
        let end = align_up(self.base.as_ptr() as usize + size, self.page_size);

        (
            NonNull::new(begin as *mut c_void).expect("base is non-null and page-aligned"),
            end - begin,
        )
    }

    /// Grants read and write access to (and backs with memory) every
    /// page that overlaps `[base, base + size)`.  Mapping pages that
    /// are already mapped is a no-op.
    ///
    /// Aborts the process if the backend fails.
    #[requires(size > 0 && size <= self.reserved_size,
               "Only the reserved range may be mapped.")]
    pub fn map(&mut self, size: usize) {
        let (begin, len) = self.window(size);

        log::trace!("mapping {} bytes at {:p}", len, begin.as_ptr());
        or_die(self.backend.protect(begin, len, Access::ReadWrite), "map");
    }

    /// Revokes all access to every page that overlaps
    /// `[base, base + size)`, and lets go of the memory backing them.
    /// The address space stays reserved.
    ///
    /// Aborts the process if the backend fails.
    #[requires(size > 0 && size <= self.reserved_size,
               "Only the reserved range may be unmapped.")]
    pub fn unmap(&mut self, size: usize) {
        let (begin, len) = self.window(size);

        log::trace!("unmapping {} bytes at {:p}", len, begin.as_ptr());
        or_die(self.backend.protect(begin, len, Access::NoAccess), "unmap");
        or_die(self.backend.discard(begin, len), "unmap");
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // A failed `check_rep` during construction unwinds through here.
        if cfg!(debug_assertions) && !std::thread::panicking() {
            self.check_rep();
        }

        let (os_base, size) = self.os_span();

        log::debug!("releasing {} bytes at {:p}", size, os_base.as_ptr());
        or_die(self.backend.release(os_base.cast::<c_void>(), size), "release");
    }
}
