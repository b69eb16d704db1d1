//! This module tracks reserved spans of address space, and the access
//! rights of each page in them, in contract-checking builds.
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::backend::Access;

#[derive(Clone, Debug)]
struct Span {
    /// The range of address space reserved.
    begin: usize,
    size: usize,

    page_size: usize,
    /// Access rights for each page in the span.
    pages: Vec<Access>,
}

lazy_static::lazy_static! {
    static ref SPAN_MAP: Mutex<BTreeMap<usize, Span>> = Default::default();
}

impl Span {
    fn end(&self) -> usize {
        self.begin + self.size
    }

    /// Returns the page indices for `[begin, begin + size)`, which
    /// must be inside the span.
    fn page_indices(&self, begin: usize, size: usize) -> Result<std::ops::Range<usize>, &'static str> {
        if begin % self.page_size != 0 || size % self.page_size != 0 {
            return Err("Range is not page-aligned");
        }

        if begin < self.begin || begin + size > self.end() {
            return Err("Range overflows its span");
        }

        let first = (begin - self.begin) / self.page_size;
        Ok(first..(first + size / self.page_size))
    }
}

/// Returns the span associated with the highest key less than or
/// equal to `ptr`.
fn predecessor(map: &BTreeMap<usize, Span>, ptr: usize) -> Option<&Span> {
    map.range(0..=ptr).last().map(|x| x.1)
}

/// Registers a new span of `size` bytes, with every page inaccessible.
/// It must not overlap with any other registered span.
pub fn reserve_span(begin: usize, size: usize, page_size: usize) -> Result<(), &'static str> {
    if usize::MAX - begin < size {
        return Err("Address is too high.");
    }

    if size == 0 || page_size == 0 || size % page_size != 0 {
        return Err("Span size must be a positive multiple of the page size");
    }

    let mut map = SPAN_MAP.lock().unwrap();

    // Spans are disjoint, so only the highest span that starts below
    // our end may overlap with the new one.
    if let Some((_, info)) = map.range(0..(begin + size)).next_back() {
        if info.end() > begin {
            return Err("Found overlapping span");
        }
    }

    map.insert(
        begin,
        Span {
            begin,
            size,
            page_size,
            pages: vec![Access::NoAccess; size / page_size],
        },
    );
    Ok(())
}

/// Returns Ok if `[begin, begin + size)` is a page-aligned subrange of
/// one registered span.
pub fn protectable_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    if size == 0 {
        return Ok(());
    }

    let map = SPAN_MAP.lock().unwrap();
    let span = predecessor(&map, begin).ok_or("Parent span not found")?;

    span.page_indices(begin, size).map(|_| ())
}

/// Updates the access rights for every page in `[begin, begin + size)`.
pub fn protect_range(begin: usize, size: usize, access: Access) -> Result<(), &'static str> {
    if size > usize::MAX - begin {
        return Err("Range too large");
    }

    if size == 0 {
        return Ok(());
    }

    let mut map = SPAN_MAP.lock().unwrap();
    let key = predecessor(&map, begin).ok_or("Parent span not found")?.begin;
    let span = map
        .get_mut(&key)
        .ok_or("Parent span not found on second lookup")?;

    for index in span.page_indices(begin, size)? {
        span.pages[index] = access;
    }

    Ok(())
}

/// Returns Ok if the range is a whole registered span: releases are
/// all or nothing.
pub fn releasable_span(begin: usize, size: usize) -> Result<(), &'static str> {
    let map = SPAN_MAP.lock().unwrap();
    let span = map.get(&begin).ok_or("Released range does not start a span")?;

    if span.size != size {
        return Err("Released range does not cover its whole span");
    }

    Ok(())
}

/// Unregisters a whole span.
pub fn release_span(begin: usize, size: usize) -> Result<(), &'static str> {
    releasable_span(begin, size)?;

    let mut map = SPAN_MAP.lock().unwrap();
    map.remove(&begin)
        .map(|_| ())
        .ok_or("Span vanished on second lookup")
}

/// Returns the recorded access rights for the page that contains
/// `address`, if any.
#[cfg(test)]
pub fn access_at(address: usize) -> Option<Access> {
    let map = SPAN_MAP.lock().unwrap();
    let span = predecessor(&map, address)?;

    if address >= span.end() {
        return None;
    }

    Some(span.pages[(address - span.begin) / span.page_size])
}

#[cfg(test)]
mod test {
    use super::*;

    // Use made-up addresses very high in the address space: the map
    // never touches memory, and real reservations won't land there.
    const FAKE_BASE: usize = usize::MAX - (1usize << 40);
    const PAGE: usize = 4096;

    #[test]
    fn span_lifecycle() {
        let begin = FAKE_BASE;

        reserve_span(begin, 4 * PAGE, PAGE).expect("should register");
        assert_eq!(access_at(begin), Some(Access::NoAccess));

        protectable_range(begin + PAGE, 2 * PAGE).expect("inside the span");
        protect_range(begin + PAGE, 2 * PAGE, Access::ReadWrite).expect("should protect");

        assert_eq!(access_at(begin), Some(Access::NoAccess));
        assert_eq!(access_at(begin + PAGE), Some(Access::ReadWrite));
        assert_eq!(access_at(begin + 3 * PAGE - 1), Some(Access::ReadWrite));
        assert_eq!(access_at(begin + 3 * PAGE), Some(Access::NoAccess));
        assert_eq!(access_at(begin + 4 * PAGE), None);

        assert!(protectable_range(begin + 3 * PAGE, 2 * PAGE).is_err());
        assert!(protectable_range(begin + 1, PAGE).is_err());

        assert!(releasable_span(begin, 2 * PAGE).is_err());
        assert!(releasable_span(begin + PAGE, 3 * PAGE).is_err());
        release_span(begin, 4 * PAGE).expect("should release");
        assert_eq!(access_at(begin), None);
    }

    #[test]
    fn overlapping_spans() {
        let begin = FAKE_BASE + (1usize << 30);

        reserve_span(begin, 4 * PAGE, PAGE).expect("should register");
        assert!(reserve_span(begin + 3 * PAGE, 4 * PAGE, PAGE).is_err());
        assert!(reserve_span(begin - PAGE, 2 * PAGE, PAGE).is_err());

        reserve_span(begin + 4 * PAGE, PAGE, PAGE).expect("adjacent spans are fine");
        reserve_span(begin - PAGE, PAGE, PAGE).expect("adjacent spans are fine");

        release_span(begin - PAGE, PAGE).expect("should release");
        release_span(begin, 4 * PAGE).expect("should release");
        release_span(begin + 4 * PAGE, PAGE).expect("should release");
    }
}
