//! Hardware abstraction
//!
//! The rest of the crate talks to the USB module only through [`Hardware`]
//! and to the NVM controller only through [`Nvm`]. [`Mmio`](crate::Mmio)
//! implements both for the real peripherals. [`Simulated`](crate::sim::Simulated)
//! implements both for host tests.

use crate::table::{EndpointPair, Status};
use usb_device::endpoint::EndpointAddress;

bitflags::bitflags! {
    /// Bus event interrupt flags (`INTFLAGSA`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusFlags : u8 {
        const SOF = 1 << 7;
        const SUSPEND = 1 << 6;
        const RESUME = 1 << 5;
        const RESET = 1 << 4;
        const CRC = 1 << 3;
        const UNDERFLOW = 1 << 2;
        const OVERFLOW = 1 << 1;
        const STALL = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Transaction interrupt flags (`INTFLAGSB`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags : u8 {
        const TRANSACTION = 1 << 1;
        const SETUP = 1 << 0;
    }
}

/// USB bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    #[default]
    Full,
}

/// Interrupt level for the USB module's two interrupt vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptLevel {
    /// No interrupts; poll the device instead
    Off,
    Low,
    #[default]
    Medium,
    High,
}

/// An NVM controller command
///
/// The command register selects what the `LPM` instruction reads: program
/// memory, or one of the signature rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmCommand(pub u8);

impl NvmCommand {
    /// Neutral mode; `LPM` reads program memory
    pub const NO_OPERATION: Self = Self(0x00);
    /// `LPM` reads the production signature (calibration) row
    pub const READ_CALIBRATION_ROW: Self = Self(0x02);
}

/// Access to the USB module and its endpoint descriptor table
///
/// Endpoint `STATUS` bytes change underneath the CPU. Implementations must
/// make [`load_and_clear`](Hardware::load_and_clear) and
/// [`load_and_set`](Hardware::load_and_set) atomic with respect to the SIE.
/// Everything else is a plain register access.
pub trait Hardware {
    /// The endpoint descriptor table used by the SIE
    fn endpoints(&self) -> &[EndpointPair];
    /// Atomically clear `mask` in the endpoint's `STATUS`, returning the
    /// prior value
    fn load_and_clear(&mut self, address: EndpointAddress, mask: Status) -> Status;
    /// Atomically set `mask` in the endpoint's `STATUS`, returning the
    /// prior value
    fn load_and_set(&mut self, address: EndpointAddress, mask: Status) -> Status;

    /// Pending bus event flags
    fn bus_flags(&self) -> BusFlags;
    fn clear_bus_flags(&mut self, flags: BusFlags);
    fn clear_transaction_flags(&mut self, flags: TransactionFlags);
    /// Reset the FIFO write pointer
    fn reset_fifo(&mut self);
    /// `true` if the bus status reports a reset
    fn bus_reset(&self) -> bool;
    fn clear_bus_reset(&mut self);

    fn set_address(&mut self, address: u8);
    fn address(&self) -> u8;

    /// Load pad calibration, point the SIE at the endpoint table, and
    /// enable the module
    fn enable(&mut self, speed: Speed, calibration: [u8; 2]);
    fn set_interrupts(&mut self, level: InterruptLevel);
    /// Connect or disconnect the D+ / D- pull-up
    fn set_attached(&mut self, attached: bool);
}

/// Access to the NVM controller
pub trait Nvm {
    fn command(&self) -> NvmCommand;
    fn set_command(&mut self, command: NvmCommand);
    /// Read one byte with `LPM`, interpreted under the current command
    ///
    /// # Safety
    ///
    /// `address` must be valid in the memory selected by the current
    /// command.
    unsafe fn load_program_byte(&self, address: usize) -> u8;
}
