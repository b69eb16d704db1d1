//! The heap backend simulates reservations with allocations from the
//! global allocator.  It records the access rights of each page
//! instead of enforcing them, so tests can observe exactly which
//! pages a `Reservation` touches.  It also works where real mappings
//! are unavailable (e.g., under miri).
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

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::backend::Access;
use crate::Backend;

// POSIX error numbers; the CRT uses the same values on windows.
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;

#[derive(Debug)]
struct HeapSpan {
    layout: Layout,
    pages: Vec<Access>,
}

#[derive(Debug)]
pub struct HeapBackend {
    page_size: usize,
    spans: Mutex<BTreeMap<usize, HeapSpan>>,
}

impl Default for HeapBackend {
    fn default() -> Self {
        HeapBackend::new(crate::DEFAULT_PAGE_SIZE)
    }
}

impl HeapBackend {
    /// Returns a fresh backend that pretends pages are `page_size`
    /// bytes.
    pub fn new(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= std::mem::size_of::<usize>(),
            "Bad page_size={}",
            page_size
        );

        HeapBackend {
            page_size,
            spans: Default::default(),
        }
    }

    /// Returns the access rights last granted to the page that
    /// contains `address`, or `None` if `address` isn't in a live
    /// span.
    pub fn access_at(&self, address: usize) -> Option<Access> {
        let spans = self.spans.lock().unwrap();
        let (begin, span) = spans.range(0..=address).next_back()?;

        if address >= begin + span.layout.size() {
            return None;
        }

        Some(span.pages[(address - begin) / self.page_size])
    }

    /// Returns the number of spans reserved and not yet released.
    pub fn live_spans(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    /// Calls `f` on the page indices of `[base, base + size)` in the
    /// span that contains them.
    fn with_pages(
        &self,
        base: NonNull<c_void>,
        size: usize,
        f: impl FnOnce(&mut [Access]),
    ) -> Result<(), i32> {
        let begin = base.as_ptr() as usize;
        let mut spans = self.spans.lock().unwrap();
        let (span_begin, span) = spans.range_mut(0..=begin).next_back().ok_or(EINVAL)?;

        if begin + size > span_begin + span.layout.size() {
            return Err(EINVAL);
        }

        let first = (begin - span_begin) / self.page_size;
        f(&mut span.pages[first..first + size / self.page_size]);
        Ok(())
    }
}

#[contract_trait]
impl Backend for HeapBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        let layout = Layout::from_size_align(size, self.page_size).map_err(|_| EINVAL)?;
        let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) } as *mut c_void)
            .ok_or(ENOMEM)?;

        let mut spans = self.spans.lock().unwrap();
        spans.insert(
            base.as_ptr() as usize,
            HeapSpan {
                layout,
                pages: vec![Access::NoAccess; size / self.page_size],
            },
        );

        Ok(base)
    }

    fn protect(&self, base: NonNull<c_void>, size: usize, access: Access) -> Result<(), i32> {
        self.with_pages(base, size, |pages| {
            for page in pages.iter_mut() {
                *page = access;
            }
        })
    }

    fn discard(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        self.with_pages(base, size, |_| {})?;

        // Dropped backing memory comes back zero-filled.
        unsafe { std::ptr::write_bytes(base.as_ptr() as *mut u8, 0, size) };
        Ok(())
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let mut spans = self.spans.lock().unwrap();
        let key = base.as_ptr() as usize;

        match spans.get(&key) {
            Some(span) if span.layout.size() == size => {}
            _ => return Err(EINVAL),
        }

        let span = spans.remove(&key).ok_or(EINVAL)?;
        unsafe { std::alloc::dealloc(base.as_ptr() as *mut u8, span.layout) };
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn smoke_test() {
        let backend: &'static HeapBackend = Box::leak(Box::new(HeapBackend::new(4096)));
        let base = backend.reserve(4 * 4096).expect("reserve should succeed");
        let begin = base.as_ptr() as usize;

        assert_eq!(begin % 4096, 0);
        assert_eq!(backend.live_spans(), 1);
        assert_eq!(backend.access_at(begin), Some(Access::NoAccess));

        let second = NonNull::new((begin + 4096) as *mut c_void).expect("non-null");
        backend
            .protect(second, 2 * 4096, Access::ReadWrite)
            .expect("protect should succeed");
        assert_eq!(backend.access_at(begin), Some(Access::NoAccess));
        assert_eq!(backend.access_at(begin + 4096), Some(Access::ReadWrite));
        assert_eq!(backend.access_at(begin + 3 * 4096 - 1), Some(Access::ReadWrite));
        assert_eq!(backend.access_at(begin + 3 * 4096), Some(Access::NoAccess));
        assert_eq!(backend.access_at(begin + 4 * 4096), None);

        unsafe { std::ptr::write_bytes(second.as_ptr() as *mut u8, 42, 4096) };
        backend
            .protect(second, 2 * 4096, Access::NoAccess)
            .expect("protect should succeed");
        backend.discard(second, 2 * 4096).expect("discard should succeed");
        assert_eq!(unsafe { std::ptr::read(second.as_ptr() as *const u8) }, 0);

        backend.release(base, 4 * 4096).expect("release should succeed");
        assert_eq!(backend.live_spans(), 0);
        assert_eq!(backend.access_at(begin), None);
    }

    #[test]
    fn bad_ranges() {
        let backend: &'static HeapBackend = Box::leak(Box::new(HeapBackend::new(4096)));
        let base = backend.reserve(2 * 4096).expect("reserve should succeed");
        let begin = base.as_ptr() as usize;

        // These bypass the contract checks on purpose, by calling
        // the helper directly.
        let tail = NonNull::new((begin + 4096) as *mut c_void).expect("non-null");
        assert_eq!(backend.with_pages(tail, 2 * 4096, |_| {}), Err(EINVAL));

        backend.release(base, 2 * 4096).expect("release should succeed");
    }
}
