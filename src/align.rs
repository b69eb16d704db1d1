//! Rounding helpers for page sizes and alignments.  Every granule we
//! round to is a power of two, so rounding is a mask operation.
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

/// Returns whether `value` may be used as a page size or alignment:
/// either 0 ("unspecified"), or a power of two.
#[inline]
pub fn is_valid_granule(value: usize) -> bool {
    value == 0 || value.is_power_of_two()
}

/// Rounds `value` up to the next multiple of `align`.
///
/// Panics on overflow.
#[requires(align.is_power_of_two(), "alignment must be a power of 2")]
#[ensures(ret % align == 0)]
#[ensures(ret >= value && ret - value < align)]
#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    let mask = align - 1;

    value
        .checked_add(mask)
        .expect("overflow while rounding up to alignment")
        & !mask
}

/// Rounds `value` down to the previous multiple of `align`.
#[requires(align.is_power_of_two(), "alignment must be a power of 2")]
#[ensures(ret % align == 0)]
#[ensures(ret <= value && value - ret < align)]
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn granules() {
        assert!(is_valid_granule(0));
        assert!(is_valid_granule(1));
        assert!(is_valid_granule(4096));
        assert!(is_valid_granule(1 << 30));

        assert!(!is_valid_granule(3));
        assert!(!is_valid_granule(4095));
        assert!(!is_valid_granule(4096 + 4096 / 2));
    }

    #[test]
    fn rounding() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(0, 4096), 0);

        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_down(8191, 4096), 4096);
    }

    #[test]
    #[should_panic]
    fn align_up_overflow() {
        align_up(usize::MAX - 10, 4096);
    }

    proptest! {
        // Rounding up then down (or down then up) lands on a multiple
        // of the alignment within one granule of the input.
        #[test]
        fn bracket(value in 0..(1usize << 48), shift in 0..30u32) {
            let align = 1usize << shift;
            let up = align_up(value, align);
            let down = align_down(value, align);

            prop_assert!(down <= value && value <= up);
            prop_assert!(up - down == 0 || up - down == align);
            prop_assert_eq!(align_up(up, align), up);
            prop_assert_eq!(align_down(down, align), down);
        }
    }
}
