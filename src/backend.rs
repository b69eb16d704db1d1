//! A `Backend` is responsible for acquiring address space and backing
//! memory from the operating system.  Each `Reservation` is
//! parameterised on such a `Backend`.
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

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_span_map;

/// Access rights for a page-aligned range of address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    /// Reserved: any access faults, and nothing backs the range.
    NoAccess,
    Read,
    /// Committed: readable, writable, and backed by memory.
    ReadWrite,
}

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Backend: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this backend.  All calls
    /// into the backend will align addresses and sizes to that page
    /// size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Attempts to reserve `size` bytes of address space, without any
    /// access right or backing memory.  On success, returns the
    /// address of the first byte in the reserved range, aligned to
    /// `page_size()`.
    #[requires(size % self.page_size() == 0)]
    #[requires(size > 0)]
    #[ensures(ret.is_ok() -> ret.unwrap().as_ptr() as usize % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> size < usize::MAX - ret.unwrap().as_ptr() as usize,
              "The reserved range never overflows")]
    #[ensures(ret.is_ok() -> debug_span_map::reserve_span(ret.unwrap().as_ptr() as usize, size, self.page_size()).is_ok())]
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32>;

    /// Changes the access rights of a page-aligned range.  The range
    /// is always a subset of a range that was returned by a single
    /// `reserve` call.
    ///
    /// Granting `Read` or `ReadWrite` access backs the range with
    /// memory; the contents of pages that were never written are
    /// zero.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_span_map::protectable_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() -> debug_span_map::protect_range(base.as_ptr() as usize, size, access).is_ok())]
    fn protect(&self, base: NonNull<c_void>, size: usize, access: Access) -> Result<(), i32>;

    /// Drops the memory backing a page-aligned range, while keeping
    /// the range reserved.  The range is always a subset of a range
    /// that was returned by a single `reserve` call.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_span_map::protectable_range(base.as_ptr() as usize, size).is_ok())]
    fn discard(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Releases a range that was previously obtained with a single
    /// call to `reserve`.  Releases are all or nothing: `base` and
    /// `size` always match the `reserve` call.
    //
    // We unregister the span *before* returning it to the OS: once
    // it's released, another thread may reserve the same addresses.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_span_map::release_span(base.as_ptr() as usize, size).is_ok(),
               "Only whole reserved spans may be released")]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

/// The `DefaultBackend` calls straight into the operating system's
/// virtual memory interface.
#[derive(Debug)]
pub struct DefaultBackend {}

lazy_static::lazy_static! {
    static ref NAMED_BACKENDS: Mutex<HashMap<String, &'static dyn Backend>> = {
        let mut map: HashMap<String, &'static dyn Backend> = HashMap::new();

        map.insert("heap".to_string(), Box::leak(Box::new(crate::heap_backend::HeapBackend::default())));
        Mutex::new(map)
    };
}

/// Upserts the backend associated with `name`.
pub fn register_backend(name: String, backend: &'static dyn Backend) {
    let mut backends = NAMED_BACKENDS.lock().unwrap();

    log::debug!("registering quarry backend {:?}: {:?}", name, backend);
    backends.insert(name, backend);
}

/// Returns the backend for the given `name`, if one exists, or the
/// default backend if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such backend is defined.
pub fn get_backend(name: Option<&str>) -> Result<&'static dyn Backend, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_BACKEND: DefaultBackend = DefaultBackend{};
    }

    match name {
        Some(key) => {
            let backends = NAMED_BACKENDS.lock().unwrap();

            Ok(*backends.get(key).ok_or("Backend not found")?)
        }
        None => Ok(&*DEFAULT_BACKEND),
    }
}

#[contract_trait]
impl Backend for DefaultBackend {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn protect(&self, base: NonNull<c_void>, size: usize, access: Access) -> Result<(), i32> {
        crate::map::protect_region(base, size, access)
    }

    fn discard(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::discard_region(base, size)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup() {
        let default = get_backend(None).expect("default backend exists");
        assert_eq!(default.page_size(), crate::map::page_size());

        let heap = get_backend(Some("heap")).expect("heap backend is registered");
        assert!(heap.page_size().is_power_of_two());

        assert!(get_backend(Some("no_such_backend")).is_err());
    }

    #[test]
    fn register() {
        lazy_static::lazy_static! {
            static ref CUSTOM: DefaultBackend = DefaultBackend{};
        }

        register_backend("custom_os".to_string(), &*CUSTOM);

        let backend = get_backend(Some("custom_os")).expect("just registered");
        assert!(std::ptr::eq(
            backend as *const dyn Backend as *const u8,
            &*CUSTOM as *const DefaultBackend as *const u8
        ));
    }

    // Walk one span through the page states with the default backend.
    #[test]
    fn default_backend_cycle() {
        let backend = get_backend(None).expect("default backend exists");
        let size = 4 * backend.page_size();

        let base = backend.reserve(size).expect("reserve should succeed");
        backend
            .protect(base, size, Access::ReadWrite)
            .expect("commit should succeed");
        unsafe { std::ptr::write_bytes(base.as_ptr() as *mut u8, 7, size) };

        backend
            .protect(base, size, Access::NoAccess)
            .expect("decommit should succeed");
        backend.discard(base, size).expect("discard should succeed");
        backend.release(base, size).expect("release should succeed");
    }
}
