//! Register access layer for the XMEGA USB and NVM controllers
//!
//! The register blocks and field modules follow the layout the
//! `ral-registers` macros expect, so that `read_reg!`, `write_reg!`
//! and `modify_reg!` work on the peripherals exactly the way they
//! work on the endpoint descriptor table.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg, RWRegister};

use core::ops::Deref;

/// A handle to a register block at a fixed address
pub struct Instance<RB> {
    ptr: *const RB,
}

impl<RB> Instance<RB> {
    /// # Safety
    ///
    /// `ptr` must point to the register block `RB`, and it must remain valid
    /// for the lifetime of the instance.
    pub const unsafe fn new(ptr: *const RB) -> Self {
        Instance { ptr }
    }
}

impl<RB> Deref for Instance<RB> {
    type Target = RB;
    fn deref(&self) -> &RB {
        // Safety: validity upheld by the caller of `new`.
        unsafe { &*self.ptr }
    }
}

/// Defines a one-field module with the RAL's expected shape.
macro_rules! field {
    ($name:ident, $ty:ty, $offset:expr, $width:expr) => {
        pub mod $name {
            pub const offset: $ty = $offset;
            pub const mask: $ty = ((1 << $width) - 1) << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    };
    ($name:ident, $ty:ty, $offset:expr, $width:expr, { $($value:ident = $val:expr),+ $(,)? }) => {
        pub mod $name {
            pub const offset: $ty = $offset;
            pub const mask: $ty = ((1 << $width) - 1) << offset;
            pub mod RW {
                $(pub const $value: $ty = $val;)+
            }
            pub mod R {}
            pub mod W {}
        }
    };
}

/// USB controller registers
pub mod usb {
    use super::RWRegister;

    #[repr(C)]
    pub struct RegisterBlock {
        pub CTRLA: RWRegister<u8>,
        pub CTRLB: RWRegister<u8>,
        pub STATUS: RWRegister<u8>,
        pub ADDR: RWRegister<u8>,
        pub FIFOWP: RWRegister<u8>,
        pub FIFORP: RWRegister<u8>,
        pub EPPTR: RWRegister<u16>,
        pub INTCTRLA: RWRegister<u8>,
        pub INTCTRLB: RWRegister<u8>,
        pub INTFLAGSACLR: RWRegister<u8>,
        pub INTFLAGSASET: RWRegister<u8>,
        pub INTFLAGSBCLR: RWRegister<u8>,
        pub INTFLAGSBSET: RWRegister<u8>,
        _reserved0: [u8; 0x3A - 0x0E],
        pub CAL0: RWRegister<u8>,
        pub CAL1: RWRegister<u8>,
    }

    pub type Instance = super::Instance<RegisterBlock>;

    /// Default USB module address on ATxmega AU / B / C parts
    pub const USB: *const RegisterBlock = 0x04C0 as *const _;

    pub mod CTRLA {
        field!(ENABLE, u8, 7, 1);
        field!(SPEED, u8, 6, 1, { LOW = 0, FULL = 1 });
        field!(MAXEP, u8, 0, 4);
    }

    pub mod CTRLB {
        field!(ATTACH, u8, 0, 1);
    }

    pub mod STATUS {
        field!(RESUME, u8, 2, 1);
        field!(SUSPEND, u8, 1, 1);
        field!(BUSRST, u8, 0, 1);
    }

    pub mod ADDR {
        field!(ADDR, u8, 0, 7);
    }

    pub mod FIFOWP {
        field!(FIFOWP, u8, 0, 5);
    }

    pub mod INTCTRLA {
        field!(BUSEVIE, u8, 6, 1);
        field!(BUSERRIE, u8, 5, 1);
        field!(STALLIE, u8, 4, 1);
        field!(INTLVL, u8, 0, 2, { OFF = 0, LO = 1, MED = 2, HI = 3 });
    }

    pub mod INTCTRLB {
        field!(TRNIE, u8, 1, 1);
        field!(SETUPIE, u8, 0, 1);
    }
}

/// Non-volatile memory controller registers
pub mod nvm {
    use super::RWRegister;

    #[repr(C)]
    pub struct RegisterBlock {
        pub ADDR0: RWRegister<u8>,
        pub ADDR1: RWRegister<u8>,
        pub ADDR2: RWRegister<u8>,
        _reserved0: u8,
        pub DATA0: RWRegister<u8>,
        pub DATA1: RWRegister<u8>,
        pub DATA2: RWRegister<u8>,
        _reserved1: [u8; 3],
        pub CMD: RWRegister<u8>,
        pub CTRLA: RWRegister<u8>,
        pub CTRLB: RWRegister<u8>,
        pub INTCTRL: RWRegister<u8>,
        _reserved2: u8,
        pub STATUS: RWRegister<u8>,
        pub LOCKBITS: RWRegister<u8>,
    }

    pub type Instance = super::Instance<RegisterBlock>;

    /// Default NVM controller address on ATxmega parts
    pub const NVM: *const RegisterBlock = 0x01C0 as *const _;

    pub mod CMD {
        field!(CMD, u8, 0, 7);
    }
}

#[cfg(target_arch = "avr")]
const _: [(); 1] = [(); (core::mem::size_of::<usb::RegisterBlock>() == 0x3C) as usize];
#[cfg(target_arch = "avr")]
const _: [(); 1] = [(); (core::mem::size_of::<nvm::RegisterBlock>() == 0x11) as usize];
