mod align;
mod backend;
mod heap_backend;
mod map;
mod reservation;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_span_map;

use std::ffi::c_void;

pub use align::align_down;
pub use align::align_up;
pub use backend::get_backend;
pub use backend::register_backend;
pub use backend::Access;
pub use backend::Backend;
pub use backend::DefaultBackend;
pub use heap_backend::HeapBackend;
pub use reservation::ForeignReservationConfig;
pub use reservation::Reservation;
pub use reservation::ReservationConfig;
pub use reservation::DEFAULT_PAGE_SIZE;

/// Reserves address space as described by `config_ptr`.
///
/// Returns NULL if the configuration is invalid, names an unknown
/// backend, or asks for pages smaller than the backend's.  Aborts the
/// process if the operating system refuses the reservation.
///
/// # Safety
///
/// This function assumes `config_ptr` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn quarry_reserve(
    config_ptr: *const ForeignReservationConfig,
) -> *mut Reservation {
    let config = match ReservationConfig::from_c(config_ptr) {
        Some(config) => config,
        None => return std::ptr::null_mut(),
    };

    match get_backend(config.backend_name.as_deref()) {
        Ok(backend) if config.page_size.unwrap_or(0) % backend.page_size() == 0 => {}
        _ => return std::ptr::null_mut(),
    }

    Box::into_raw(Box::new(Reservation::with_config(config)))
}

/// Returns the first byte of `reservation`, or NULL if `reservation`
/// is NULL.
///
/// # Safety
///
/// This function assumes `reservation` is NULL or was returned by
/// `quarry_reserve` and not yet released.
#[no_mangle]
pub unsafe extern "C" fn quarry_base(reservation: *const Reservation) -> *mut c_void {
    match reservation.as_ref() {
        Some(reservation) => reservation.as_ptr() as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

/// Commits the pages covering the first `size` bytes of `reservation`.
///
/// # Safety
///
/// This function assumes `reservation` is NULL or was returned by
/// `quarry_reserve` and not yet released, and that no other thread
/// is using it.
#[no_mangle]
pub unsafe extern "C" fn quarry_map(reservation: *mut Reservation, size: usize) {
    if let Some(reservation) = reservation.as_mut() {
        reservation.map(size);
    }
}

/// Decommits the pages covering the first `size` bytes of `reservation`.
///
/// # Safety
///
/// Same as `quarry_map`.
#[no_mangle]
pub unsafe extern "C" fn quarry_unmap(reservation: *mut Reservation, size: usize) {
    if let Some(reservation) = reservation.as_mut() {
        reservation.unmap(size);
    }
}

/// Returns all of `reservation`'s address space to the operating system.
///
/// # Safety
///
/// This function assumes `reservation` is NULL or was returned by
/// `quarry_reserve` and not yet released.
#[no_mangle]
pub unsafe extern "C" fn quarry_release(reservation: *mut Reservation) {
    if !reservation.is_null() {
        drop(Box::from_raw(reservation));
    }
}

#[no_mangle]
pub extern "C" fn quarry_default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}
