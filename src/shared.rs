//! A device shared between interrupt handlers and the main loop

use crate::{
    control::Handler,
    device::{Device, Interrupt, Serviced},
    hal::{Hardware, Nvm},
};
use core::cell::RefCell;
use critical_section::Mutex;

/// A [`Device`] in a `static`
///
/// Both USB interrupt vectors, and the firmware's main loop, reach the device
/// through [`with`](SharedDevice::with). Each access runs in a critical
/// section, so an interrupt never observes a half-finished request.
///
/// ```ignore
/// static USB: SharedDevice<'static, Mmio, Firmware> = SharedDevice::new();
///
/// #[avr_device::interrupt(atxmega128a4u)]
/// fn USB_TRNCOMPL() {
///     USB.service(Interrupt::TransactionComplete);
/// }
/// ```
pub struct SharedDevice<'a, H, C> {
    device: Mutex<RefCell<Option<Device<'a, H, C>>>>,
}

impl<'a, H, C> SharedDevice<'a, H, C> {
    pub const fn new() -> Self {
        SharedDevice {
            device: Mutex::new(RefCell::new(None)),
        }
    }
}

impl<'a, H: Hardware + Nvm, C: Handler> SharedDevice<'a, H, C> {
    /// Hand over an initialized device
    ///
    /// Returns the previous device, if any.
    pub fn install(&self, device: Device<'a, H, C>) -> Option<Device<'a, H, C>> {
        critical_section::with(|cs| self.device.borrow_ref_mut(cs).replace(device))
    }

    /// Take the device back
    pub fn take(&self) -> Option<Device<'a, H, C>> {
        critical_section::with(|cs| self.device.borrow_ref_mut(cs).take())
    }

    /// Exclusive access to the device
    ///
    /// Returns `None` if no device is installed.
    ///
    /// # Panics
    ///
    /// Panics if called from inside of another `with`.
    pub fn with<R>(&self, func: impl FnOnce(&mut Device<'a, H, C>) -> R) -> Option<R> {
        critical_section::with(|cs| {
            let mut device = self.device.borrow_ref_mut(cs);
            device.as_mut().map(func)
        })
    }

    /// Service one interrupt source, if a device is installed
    pub fn service(&self, interrupt: Interrupt) -> Option<Serviced> {
        self.with(|device| device.service(interrupt))
    }
}

impl<H, C> Default for SharedDevice<'_, H, C> {
    fn default() -> Self {
        Self::new()
    }
}
