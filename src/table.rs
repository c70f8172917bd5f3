//! Endpoint descriptor table
//!
//! The XMEGA USB module keeps no per-endpoint registers of its own. Instead,
//! it reads and updates a table of endpoint descriptors in SRAM, located by
//! the `EPPTR` register. Each endpoint number owns an OUT and an IN
//! descriptor. When an endpoint runs in ping-pong mode, the descriptor of
//! the opposite direction becomes the endpoint's second bank.
//!
//! The module implements a RAL-compatible interface for the descriptors.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::vcell::VCell;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

bitflags::bitflags! {
    /// Endpoint `STATUS` flags
    ///
    /// The SIE updates these concurrently with the CPU. Only change them
    /// through the load-and-clear / load-and-set primitives of the
    /// [`Hardware`](crate::hal::Hardware) implementation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status : u8 {
        /// Stall sent (CRC error on isochronous endpoints)
        const STALLF = 1 << 7;
        /// Underflow (IN) or overflow (OUT)
        const UNF_OVF = 1 << 6;
        const TRNCOMPL0 = 1 << 5;
        const TRNCOMPL1 = 1 << 4;
        /// Shares its bit with `TRNCOMPL1` on control endpoints
        const SETUP = 1 << 4;
        const BANK = 1 << 3;
        const BUSNACK1 = 1 << 2;
        const BUSNACK0 = 1 << 1;
        const TOGGLE = 1 << 0;
    }
}

/// One endpoint descriptor, as the SIE reads it
///
/// `DATAPTR` is pointer-sized, which is 16 bits on the AVR target.
#[repr(C)]
pub struct EpDescriptor {
    pub STATUS: VCell<u8>,
    pub CTRL: VCell<u8>,
    pub CNT: VCell<u16>,
    pub DATAPTR: VCell<usize>,
    pub AUXDATA: VCell<u16>,
}

impl EpDescriptor {
    pub const fn new() -> Self {
        EpDescriptor {
            STATUS: VCell::new(0),
            CTRL: VCell::new(0),
            CNT: VCell::new(0),
            DATAPTR: VCell::new(0),
            AUXDATA: VCell::new(0),
        }
    }
    pub fn status(&self) -> Status {
        Status::from_bits_retain(self.STATUS.read())
    }
}

/// The OUT and IN descriptors of one endpoint number
#[repr(C)]
pub struct EndpointPair {
    pub OUT: EpDescriptor,
    pub IN: EpDescriptor,
}

impl EndpointPair {
    pub const fn new() -> Self {
        EndpointPair {
            OUT: EpDescriptor::new(),
            IN: EpDescriptor::new(),
        }
    }
}

/// Storage for the endpoint descriptor table
///
/// `PAIRS` is the number of endpoint numbers, including endpoint 0. The
/// hardware supports up to 16. Allocate it in a `static`, and hand it to
/// [`Mmio`](crate::Mmio); the table's address is programmed into `EPPTR`.
#[repr(C, align(2))]
pub struct EndpointTable<const PAIRS: usize = 16> {
    pairs: [EndpointPair; PAIRS],
}

unsafe impl<const PAIRS: usize> Sync for EndpointTable<PAIRS> {}

impl<const PAIRS: usize> EndpointTable<PAIRS> {
    /// Create storage for the endpoint descriptor table
    pub const fn new() -> Self {
        const PAIR: EndpointPair = EndpointPair::new();
        EndpointTable {
            pairs: [PAIR; PAIRS],
        }
    }
    pub fn pairs(&self) -> &[EndpointPair] {
        &self.pairs
    }
}

impl<const PAIRS: usize> Default for EndpointTable<PAIRS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the descriptor for `address`
///
/// # Panics
///
/// Panics if the table has no pair for the endpoint number.
pub fn descriptor(pairs: &[EndpointPair], address: EndpointAddress) -> &EpDescriptor {
    let pair = &pairs[address.index()];
    match address.direction() {
        UsbDirection::Out => &pair.OUT,
        UsbDirection::In => &pair.IN,
    }
}

/// Address of the descriptor that backs `bank` of `address`
///
/// Bank 0 is the endpoint's own descriptor. Bank 1 borrows the descriptor of
/// the opposite direction.
pub fn bank_address(address: EndpointAddress, bank: u8) -> EndpointAddress {
    if bank == 0 {
        address
    } else {
        let opposite = match address.direction() {
            UsbDirection::Out => UsbDirection::In,
            UsbDirection::In => UsbDirection::Out,
        };
        EndpointAddress::from_parts(address.index(), opposite)
    }
}

pub mod CTRL {
    pub mod TYPE {
        pub const offset: u8 = 6;
        pub const mask: u8 = 0b11 << offset;
        pub mod RW {
            pub const DISABLE: u8 = 0;
            pub const CONTROL: u8 = 1;
            pub const BULK: u8 = 2;
            pub const ISOCHRONOUS: u8 = 3;
        }
        pub mod R {}
        pub mod W {}
    }
    pub mod MULTIPKT {
        pub const offset: u8 = 5;
        pub const mask: u8 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod PINGPONG {
        pub const offset: u8 = 4;
        pub const mask: u8 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod STALL {
        pub const offset: u8 = 2;
        pub const mask: u8 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BUFSIZE {
        pub const offset: u8 = 0;
        pub const mask: u8 = 0b111 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod CNT {
    pub mod COUNT {
        pub const offset: u16 = 0;
        pub const mask: u16 = 0x3FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Automatic zero length packet, IN only
    pub mod AZLP {
        pub const offset: u16 = 15;
        pub const mask: u16 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Converts a buffer size to its `BUFSIZE` group code
///
/// Sizes between the hardware's classes round down. 1023 is the largest
/// isochronous buffer.
pub const fn buffer_size_code(size: u16) -> u8 {
    match size {
        1023.. => 7,
        512.. => 6,
        256.. => 5,
        128.. => 4,
        64.. => 3,
        32.. => 2,
        16.. => 1,
        _ => 0,
    }
}

/// The buffer size described by a `BUFSIZE` group code
pub const fn buffer_size(code: u8) -> usize {
    match code & 0b111 {
        7 => 1023,
        code => 8 << code,
    }
}

#[cfg(target_arch = "avr")]
const _: [(); 1] = [(); (core::mem::size_of::<EpDescriptor>() == 8) as usize];
