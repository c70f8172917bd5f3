//! Memory-mapped hardware backend

use crate::{
    hal::{BusFlags, Hardware, InterruptLevel, Nvm, NvmCommand, Speed, TransactionFlags},
    ral,
    table::{self, EndpointPair, EndpointTable, Status},
    vcell::VCell,
    Peripherals,
};
use usb_device::endpoint::EndpointAddress;

/// The XMEGA USB module and NVM controller
///
/// Owns the register blocks described by a [`Peripherals`] implementation,
/// and the endpoint descriptor table that the SIE reads.
pub struct Mmio {
    usb: ral::usb::Instance,
    nvm: ral::nvm::Instance,
    endpoints: &'static [EndpointPair],
}

// Safety: the register blocks and the table exist once, and `Mmio` is
// their only user.
unsafe impl Send for Mmio {}

impl Mmio {
    /// Take the peripherals and the endpoint descriptor table
    ///
    /// # Panics
    ///
    /// Panics if `PAIRS` is zero, or larger than the 16 endpoints the
    /// hardware supports.
    pub fn new<P: Peripherals, const PAIRS: usize>(
        peripherals: P,
        table: &'static EndpointTable<PAIRS>,
    ) -> Self {
        assert!(
            (1..=16).contains(&PAIRS),
            "Endpoint table must describe 1 to 16 endpoints"
        );
        // Safety: the `Peripherals` implementation promises these
        // pointers reference the register blocks.
        let (usb, nvm) = unsafe {
            (
                ral::usb::Instance::new(peripherals.usb() as *const _),
                ral::nvm::Instance::new(peripherals.nvm() as *const _),
            )
        };
        Mmio {
            usb,
            nvm,
            endpoints: table.pairs(),
        }
    }

    fn status(&self, address: EndpointAddress) -> &VCell<u8> {
        &table::descriptor(self.endpoints, address).STATUS
    }
}

#[cfg(target_arch = "avr")]
fn lac(status: &VCell<u8>, mask: u8) -> u8 {
    let mut value = mask;
    // Safety: `status` references a byte in the endpoint table.
    unsafe {
        core::arch::asm!(
            "lac Z, {value}",
            value = inout(reg) value,
            in("Z") status.as_ptr(),
            options(nostack),
        );
    }
    value
}

#[cfg(target_arch = "avr")]
fn las(status: &VCell<u8>, mask: u8) -> u8 {
    let mut value = mask;
    // Safety: `status` references a byte in the endpoint table.
    unsafe {
        core::arch::asm!(
            "las Z, {value}",
            value = inout(reg) value,
            in("Z") status.as_ptr(),
            options(nostack),
        );
    }
    value
}

// Off target there's no SIE racing the CPU. A critical section keeps the
// read-modify-write whole with respect to interrupts.
#[cfg(not(target_arch = "avr"))]
fn lac(status: &VCell<u8>, mask: u8) -> u8 {
    critical_section::with(|_| {
        let prior = status.read();
        status.write(prior & !mask);
        prior
    })
}

#[cfg(not(target_arch = "avr"))]
fn las(status: &VCell<u8>, mask: u8) -> u8 {
    critical_section::with(|_| {
        let prior = status.read();
        status.write(prior | mask);
        prior
    })
}

impl Hardware for Mmio {
    fn endpoints(&self) -> &[EndpointPair] {
        self.endpoints
    }

    fn load_and_clear(&mut self, address: EndpointAddress, mask: Status) -> Status {
        Status::from_bits_retain(lac(self.status(address), mask.bits()))
    }

    fn load_and_set(&mut self, address: EndpointAddress, mask: Status) -> Status {
        Status::from_bits_retain(las(self.status(address), mask.bits()))
    }

    fn bus_flags(&self) -> BusFlags {
        BusFlags::from_bits_retain(ral::read_reg!(ral::usb, self.usb, INTFLAGSACLR))
    }

    fn clear_bus_flags(&mut self, flags: BusFlags) {
        ral::write_reg!(ral::usb, self.usb, INTFLAGSACLR, flags.bits());
    }

    fn clear_transaction_flags(&mut self, flags: TransactionFlags) {
        ral::write_reg!(ral::usb, self.usb, INTFLAGSBCLR, flags.bits());
    }

    fn reset_fifo(&mut self) {
        ral::write_reg!(ral::usb, self.usb, FIFOWP, 0);
    }

    fn bus_reset(&self) -> bool {
        ral::read_reg!(ral::usb, self.usb, STATUS, BUSRST == 1)
    }

    fn clear_bus_reset(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, STATUS, BUSRST: 0);
    }

    fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral::usb, self.usb, ADDR, ADDR: address);
    }

    fn address(&self) -> u8 {
        ral::read_reg!(ral::usb, self.usb, ADDR, ADDR)
    }

    fn enable(&mut self, speed: Speed, calibration: [u8; 2]) {
        ral::write_reg!(ral::usb, self.usb, CAL0, calibration[0]);
        ral::write_reg!(ral::usb, self.usb, CAL1, calibration[1]);
        ral::write_reg!(ral::usb, self.usb, EPPTR, self.endpoints.as_ptr() as usize as u16);
        let speed = match speed {
            Speed::Low => ral::usb::CTRLA::SPEED::RW::LOW,
            Speed::Full => ral::usb::CTRLA::SPEED::RW::FULL,
        };
        ral::write_reg!(
            ral::usb,
            self.usb,
            CTRLA,
            ENABLE: 1,
            SPEED: speed,
            MAXEP: (self.endpoints.len() - 1) as u8
        );
    }

    fn set_interrupts(&mut self, level: InterruptLevel) {
        use ral::usb::INTCTRLA::INTLVL::RW::{HI, LO, MED, OFF};
        let (level, enable) = match level {
            InterruptLevel::Off => (OFF, 0),
            InterruptLevel::Low => (LO, 1),
            InterruptLevel::Medium => (MED, 1),
            InterruptLevel::High => (HI, 1),
        };
        ral::write_reg!(
            ral::usb,
            self.usb,
            INTCTRLA,
            BUSEVIE: enable,
            BUSERRIE: enable,
            STALLIE: enable,
            INTLVL: level
        );
        ral::write_reg!(ral::usb, self.usb, INTCTRLB, TRNIE: enable, SETUPIE: enable);
    }

    fn set_attached(&mut self, attached: bool) {
        ral::modify_reg!(ral::usb, self.usb, CTRLB, ATTACH: attached as u8);
    }
}

impl Nvm for Mmio {
    fn command(&self) -> NvmCommand {
        NvmCommand(ral::read_reg!(ral::nvm, self.nvm, CMD, CMD))
    }

    fn set_command(&mut self, command: NvmCommand) {
        ral::write_reg!(ral::nvm, self.nvm, CMD, CMD: command.0);
    }

    #[cfg(target_arch = "avr")]
    unsafe fn load_program_byte(&self, address: usize) -> u8 {
        let byte: u8;
        core::arch::asm!(
            "lpm {byte}, Z",
            byte = out(reg) byte,
            in("Z") address,
            options(pure, readonly, nostack),
        );
        byte
    }

    #[cfg(not(target_arch = "avr"))]
    unsafe fn load_program_byte(&self, address: usize) -> u8 {
        (address as *const u8).read_volatile()
    }
}
