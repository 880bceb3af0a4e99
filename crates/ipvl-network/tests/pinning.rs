//! Process-wide namespace worker pinning.
//!
//! Lives in its own test binary: the pin is fixed for the whole process.

use ipvl_common::IpvlError;
use ipvl_network::pin_current_thread;

#[test]
fn pin_is_fixed_to_first_thread() {
    let pin = pin_current_thread().unwrap();
    assert!(pin.is_current());

    // Pinning again from the same thread is fine.
    assert!(pin_current_thread().is_ok());

    let other = std::thread::spawn(|| pin_current_thread().map(|_| ()))
        .join()
        .unwrap();
    assert!(matches!(other, Err(IpvlError::Namespace { .. })));
}
