//! A minimal USB device stack for XMEGA processors
//!
//! `xmega-usbd` drives the USB module found on ATxmega AU, B and C parts.
//! It answers the standard control requests on endpoint 0, and hands the
//! rest to a [`Handler`] that you provide, or to the ready-made
//! [`DescriptorTable`](descriptors::DescriptorTable).
//!
//! The crate is split along the hardware:
//!
//! - [`Endpoint`] models one direction of one endpoint in the descriptor
//!   table that the SIE reads.
//! - [`Device`] services the module's two interrupt vectors, and runs the
//!   control transfer state machine.
//! - [`progmem`] reads constant data from flash without upsetting the NVM
//!   controller.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`], then build an [`Mmio`] from it and a `static`
//! [`EndpointTable`].
//!
//! ```ignore
//! use xmega_usbd::{Config, Device, Ep0Memory, EndpointTable, Mmio};
//!
//! static ENDPOINTS: EndpointTable<3> = EndpointTable::new();
//! static EP0_MEMORY: Ep0Memory = Ep0Memory::new();
//!
//! let hw = Mmio::new(peripherals, &ENDPOINTS);
//! let mut device = Device::new(hw, &EP0_MEMORY, descriptors, Config::new());
//! device.initialize();
//! ```
//!
//! Enable the `defmt-03` feature to log through `defmt`.

#![no_std]
#![cfg_attr(target_arch = "avr", feature(asm_experimental_arch))]

#[macro_use]
mod log;

mod buffer;
mod control;
mod device;
mod endpoint;
mod mmio;
mod ral;
mod setup;
mod shared;
mod table;
mod vcell;

pub mod descriptors;
pub mod hal;
pub mod progmem;
pub mod sim;

pub use buffer::{Ep0Memory, EP0_SIZE, MAX_IN_SIZE};
pub use control::{Descriptor, Handler, Response, Stage};
pub use device::{BusEvent, Config, Device, Dispatched, Interrupt, Serviced};
pub use endpoint::{Bank, Endpoint};
pub use mmio::Mmio;
pub use setup::SetupPacket;
pub use shared::SharedDevice;
pub use table::{EndpointPair, EndpointTable, EpDescriptor, Status};

/// A type that owns the USB module and NVM controller register blocks
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USB and
/// NVM register blocks. The pointers returned by the methods are assumed to
/// be valid, and will be cast to register definitions.
///
/// # Example
///
/// A safe implementation of `Peripherals` on top of the `avr-device`
/// singletons.
///
/// ```ignore
/// use avr_device::atxmega128a4u::{NVM, USB};
/// use xmega_usbd::Peripherals;
///
/// struct Instances {
///     usb: USB,
///     nvm: NVM,
/// }
///
/// unsafe impl Peripherals for Instances {
///     fn usb(&self) -> *const () {
///         USB::ptr() as _
///     }
///     fn nvm(&self) -> *const () {
///         NVM::ptr() as _
///     }
/// }
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB module registers
    fn usb(&self) -> *const ();
    /// Returns the address of the NVM controller registers
    fn nvm(&self) -> *const ();
}

/// The USB module and NVM controller at their datasheet addresses
///
/// Use this when no peripheral access crate owns the registers.
pub struct Instances {
    _private: (),
}

impl Instances {
    /// # Safety
    ///
    /// Nothing else may use the USB or NVM registers while the instances, or
    /// the [`Mmio`] built from them, exist. Only construct one.
    pub const unsafe fn new() -> Self {
        Instances { _private: () }
    }
}

unsafe impl Peripherals for Instances {
    fn usb(&self) -> *const () {
        ral::usb::USB.cast()
    }
    fn nvm(&self) -> *const () {
        ral::nvm::NVM.cast()
    }
}
