//! Simulated USB module for host-side testing
//!
//! [`Simulated`] implements [`Hardware`] and [`Nvm`] on an in-memory
//! register file, and plays the part of the SIE and the host: it accepts
//! SETUP packets, OUT data and IN requests the way the peripheral would,
//! updating the endpoint descriptor table the firmware armed.
//!
//! The simulation trusts the firmware's data pointers. Arm endpoints with
//! valid buffers, exactly as you would on hardware.

use crate::{
    hal::{BusFlags, Hardware, InterruptLevel, Nvm, NvmCommand, Speed, TransactionFlags},
    ral,
    table::{self, EndpointPair, EndpointTable, EpDescriptor, Status},
};
use core::cell::Cell;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// Endpoint numbers in the simulated table
pub const ENDPOINTS: usize = 4;

/// Bytes in the simulated production signature row
pub const SIGNATURE_ROW_SIZE: usize = 0x40;

/// Largest transfer the SIE can describe
pub const MAX_TRANSFER: usize = 1023;

/// The device's response to a host token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
}

/// Data the host received from an IN endpoint
#[derive(Clone)]
pub struct Transfer {
    data: [u8; MAX_TRANSFER],
    len: usize,
    zlp: bool,
}

impl Transfer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
    /// `true` if the SIE finished the transfer with a zero length packet
    pub fn zlp(&self) -> bool {
        self.zlp
    }
}

impl core::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transfer")
            .field("data", &self.as_slice())
            .field("zlp", &self.zlp)
            .finish()
    }
}

/// A simulated USB module and NVM controller
pub struct Simulated {
    table: EndpointTable<ENDPOINTS>,
    bus_flags: BusFlags,
    transaction_flags: TransactionFlags,
    bus_reset: bool,
    address: u8,
    enabled: Option<(Speed, [u8; 2])>,
    interrupts: InterruptLevel,
    attached: bool,
    fifo_resets: usize,
    nvm_command: NvmCommand,
    signature_row: [u8; SIGNATURE_ROW_SIZE],
    program_reads: Cell<usize>,
    misdirected_reads: Cell<usize>,
    auto_complete_in: bool,
    auto_completed: Option<Transfer>,
    setup_on_arm: Option<[u8; 8]>,
    setup_on_reopen: Option<[u8; 8]>,
}

impl Default for Simulated {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulated {
    pub fn new() -> Self {
        Simulated {
            table: EndpointTable::new(),
            bus_flags: BusFlags::empty(),
            transaction_flags: TransactionFlags::empty(),
            bus_reset: false,
            address: 0,
            enabled: None,
            interrupts: InterruptLevel::Off,
            attached: false,
            fifo_resets: 0,
            nvm_command: NvmCommand::NO_OPERATION,
            signature_row: [0xFF; SIGNATURE_ROW_SIZE],
            program_reads: Cell::new(0),
            misdirected_reads: Cell::new(0),
            auto_complete_in: false,
            auto_completed: None,
            setup_on_arm: None,
            setup_on_reopen: None,
        }
    }

    /// Program bytes into the production signature row
    pub fn set_signature_row(&mut self, offset: usize, bytes: &[u8]) {
        self.signature_row[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn ep(&self, address: EndpointAddress) -> &EpDescriptor {
        table::descriptor(self.table.pairs(), address)
    }

    fn set_status(&self, address: EndpointAddress, set: Status) {
        let ep = self.ep(address);
        ep.STATUS.write(ep.STATUS.read() | set.bits());
    }

    /// Force flags into an endpoint's `STATUS`, as the SIE would
    pub fn inject_status(&mut self, address: EndpointAddress, set: Status) {
        self.set_status(address, set);
    }

    pub fn raise_bus_flags(&mut self, flags: BusFlags) {
        self.bus_flags |= flags;
    }

    /// Signal a bus reset
    pub fn host_reset(&mut self) {
        self.bus_flags |= BusFlags::RESET;
        self.bus_reset = true;
    }

    /// Send a SETUP packet to endpoint 0
    ///
    /// The SIE accepts SETUP regardless of NACK or STALL state, and clears
    /// STALL on both endpoint 0 directions.
    pub fn host_setup(&mut self, packet: [u8; 8]) -> Handshake {
        if self.enabled.is_none() {
            return Handshake::Nak;
        }
        let out = EndpointAddress::from_parts(0, UsbDirection::Out);
        let ep = self.ep(out);
        let data = ep.DATAPTR.read() as *mut u8;
        if data.is_null() {
            return Handshake::Nak;
        }
        // Safety: the firmware armed EP0 OUT with at least one packet.
        unsafe { core::ptr::copy_nonoverlapping(packet.as_ptr(), data, packet.len()) };
        ral::write_reg!(crate::table, ep, CNT, COUNT: packet.len() as u16);
        self.set_status(out, Status::SETUP | Status::BUSNACK0);

        for ep in [&self.table.pairs()[0].OUT, &self.table.pairs()[0].IN] {
            ral::modify_reg!(crate::table, ep, CTRL, STALL: 0);
        }
        self.transaction_flags |= TransactionFlags::SETUP;
        Handshake::Ack
    }

    /// Selects the descriptor the SIE services next for `address`
    fn active_bank(&self, address: EndpointAddress) -> (u8, bool) {
        let ep = self.ep(address);
        let pingpong = ral::read_reg!(crate::table, ep, CTRL, PINGPONG == 1);
        let bank = if pingpong && ep.status().contains(Status::BANK) {
            1
        } else {
            0
        };
        (bank, pingpong)
    }

    fn finish(&mut self, address: EndpointAddress, bank: u8, pingpong: bool) {
        let (complete, nack) = if bank == 0 {
            (Status::TRNCOMPL0, Status::BUSNACK0)
        } else {
            (Status::TRNCOMPL1, Status::BUSNACK1)
        };
        let ep = self.ep(address);
        let mut status = ep.status() | complete | nack;
        status.toggle(Status::TOGGLE);
        if pingpong {
            status.toggle(Status::BANK);
        }
        ep.STATUS.write(status.bits());
        self.transaction_flags |= TransactionFlags::TRANSACTION;
    }

    /// Send an OUT data packet to endpoint `number`
    pub fn host_out(&mut self, number: usize, data: &[u8]) -> Handshake {
        let address = EndpointAddress::from_parts(number, UsbDirection::Out);
        let ep = self.ep(address);
        if ral::read_reg!(crate::table, ep, CTRL, TYPE == DISABLE) {
            return Handshake::Nak;
        }
        if ral::read_reg!(crate::table, ep, CTRL, STALL == 1) {
            return Handshake::Stall;
        }
        let (bank, pingpong) = self.active_bank(address);
        let nack = if bank == 0 {
            Status::BUSNACK0
        } else {
            Status::BUSNACK1
        };
        if ep.status().contains(nack) {
            return Handshake::Nak;
        }

        let capacity = table::buffer_size(ral::read_reg!(crate::table, ep, CTRL, BUFSIZE));
        let len = data.len().min(capacity);
        let target = table::descriptor(self.table.pairs(), table::bank_address(address, bank));
        // Safety: the firmware armed this bank with one full packet.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), target.DATAPTR.read() as *mut u8, len)
        };
        ral::write_reg!(crate::table, target, CNT, COUNT: len as u16);
        if data.len() > capacity {
            self.set_status(address, Status::UNF_OVF);
        }
        self.finish(address, bank, pingpong);
        Handshake::Ack
    }

    /// Request IN data from endpoint `number`
    ///
    /// Returns the complete armed transfer. A multi-packet transfer appears
    /// as a single transfer.
    pub fn host_in(&mut self, number: usize) -> Result<Transfer, Handshake> {
        let address = EndpointAddress::from_parts(number, UsbDirection::In);
        let ep = self.ep(address);
        if ral::read_reg!(crate::table, ep, CTRL, TYPE == DISABLE) {
            return Err(Handshake::Nak);
        }
        if ral::read_reg!(crate::table, ep, CTRL, STALL == 1) {
            return Err(Handshake::Stall);
        }
        let (bank, pingpong) = self.active_bank(address);
        let nack = if bank == 0 {
            Status::BUSNACK0
        } else {
            Status::BUSNACK1
        };
        if ep.status().contains(nack) {
            return Err(Handshake::Nak);
        }

        let packet_size = table::buffer_size(ral::read_reg!(crate::table, ep, CTRL, BUFSIZE));
        let source = table::descriptor(self.table.pairs(), table::bank_address(address, bank));
        let len = (ral::read_reg!(crate::table, source, CNT, COUNT) as usize).min(MAX_TRANSFER);
        let azlp = ral::read_reg!(crate::table, source, CNT, AZLP == 1);
        let mut transfer = Transfer {
            data: [0; MAX_TRANSFER],
            len,
            zlp: azlp && len % packet_size == 0,
        };
        // Safety: the firmware armed this bank with `len` bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                source.DATAPTR.read() as *const u8,
                transfer.data.as_mut_ptr(),
                len,
            )
        };
        source.AUXDATA.write(len as u16);
        self.finish(address, bank, pingpong);
        Ok(transfer)
    }

    /// Complete every IN transfer as soon as it's armed
    pub fn set_auto_complete_in(&mut self, auto_complete: bool) {
        self.auto_complete_in = auto_complete;
    }

    /// The last transfer completed automatically
    pub fn take_auto_completed(&mut self) -> Option<Transfer> {
        self.auto_completed.take()
    }

    /// Deliver `packet` the next time the firmware arms an IN endpoint
    ///
    /// This lands a SETUP in the middle of the firmware's request handling.
    pub fn setup_on_next_arm(&mut self, packet: [u8; 8]) {
        self.setup_on_arm = Some(packet);
    }

    /// Deliver `packet` just before the firmware next re-opens an OUT
    /// endpoint
    ///
    /// This lands a SETUP after the firmware read the previous one, but
    /// before it cleared the endpoint's NACK flag.
    pub fn setup_on_next_reopen(&mut self, packet: [u8; 8]) {
        self.setup_on_reopen = Some(packet);
    }

    pub fn transaction_flags(&self) -> TransactionFlags {
        self.transaction_flags
    }

    pub fn is_stalled(&self, address: EndpointAddress) -> bool {
        let ep = self.ep(address);
        ral::read_reg!(crate::table, ep, CTRL, STALL == 1)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.is_some()
    }

    pub fn speed(&self) -> Option<Speed> {
        self.enabled.map(|(speed, _)| speed)
    }

    /// Pad calibration loaded by the last [`enable`](Hardware::enable)
    pub fn calibration(&self) -> Option<[u8; 2]> {
        self.enabled.map(|(_, calibration)| calibration)
    }

    pub fn interrupt_level(&self) -> InterruptLevel {
        self.interrupts
    }

    pub fn fifo_resets(&self) -> usize {
        self.fifo_resets
    }

    /// Program memory reads made with the NVM in neutral mode
    pub fn program_reads(&self) -> usize {
        self.program_reads.get()
    }

    /// `LPM` reads made while the NVM was set up for something else
    pub fn misdirected_reads(&self) -> usize {
        self.misdirected_reads.get()
    }
}

impl Hardware for Simulated {
    fn endpoints(&self) -> &[EndpointPair] {
        self.table.pairs()
    }

    fn load_and_clear(&mut self, address: EndpointAddress, mask: Status) -> Status {
        if address.is_out() && mask.contains(Status::BUSNACK0) {
            if let Some(packet) = self.setup_on_reopen.take() {
                self.host_setup(packet);
            }
        }
        let ep = self.ep(address);
        let prior = ep.status();
        ep.STATUS.write((prior - mask).bits());

        let armed = prior.intersection(mask) & (Status::BUSNACK0 | Status::BUSNACK1);
        if address.is_in() && !armed.is_empty() {
            if let Some(packet) = self.setup_on_arm.take() {
                self.host_setup(packet);
            }
            if self.auto_complete_in {
                self.auto_completed = self.host_in(address.index()).ok();
            }
        }
        prior
    }

    fn load_and_set(&mut self, address: EndpointAddress, mask: Status) -> Status {
        let ep = self.ep(address);
        let prior = ep.status();
        ep.STATUS.write((prior | mask).bits());
        prior
    }

    fn bus_flags(&self) -> BusFlags {
        self.bus_flags
    }

    fn clear_bus_flags(&mut self, flags: BusFlags) {
        self.bus_flags -= flags;
    }

    fn clear_transaction_flags(&mut self, flags: TransactionFlags) {
        self.transaction_flags -= flags;
    }

    fn reset_fifo(&mut self) {
        self.fifo_resets += 1;
    }

    fn bus_reset(&self) -> bool {
        self.bus_reset
    }

    fn clear_bus_reset(&mut self) {
        self.bus_reset = false;
    }

    fn set_address(&mut self, address: u8) {
        self.address = address & 0x7F;
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn enable(&mut self, speed: Speed, calibration: [u8; 2]) {
        self.enabled = Some((speed, calibration));
    }

    fn set_interrupts(&mut self, level: InterruptLevel) {
        self.interrupts = level;
    }

    fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }
}

impl Nvm for Simulated {
    fn command(&self) -> NvmCommand {
        self.nvm_command
    }

    fn set_command(&mut self, command: NvmCommand) {
        self.nvm_command = command;
    }

    unsafe fn load_program_byte(&self, address: usize) -> u8 {
        match self.nvm_command {
            NvmCommand::NO_OPERATION => {
                self.program_reads.set(self.program_reads.get() + 1);
                (address as *const u8).read_volatile()
            }
            NvmCommand::READ_CALIBRATION_ROW => {
                self.signature_row.get(address).copied().unwrap_or(0xFF)
            }
            _ => {
                self.misdirected_reads.set(self.misdirected_reads.get() + 1);
                0xFF
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Handshake, Simulated};
    use crate::{
        endpoint::Endpoint,
        hal::{Hardware, Speed, TransactionFlags},
        table::Status,
    };
    use usb_device::endpoint::{EndpointAddress, EndpointType};

    fn enabled_control() -> (Simulated, [u8; 64]) {
        let mut hw = Simulated::new();
        hw.enable(Speed::Full, [0, 0]);
        Endpoint::new(EndpointAddress::from(0x00)).init(&mut hw, EndpointType::Control, 64);
        Endpoint::new(EndpointAddress::from(0x80)).init(&mut hw, EndpointType::Control, 64);
        (hw, [0; 64])
    }

    #[test]
    fn setup_ignored_while_disabled() {
        let mut hw = Simulated::new();
        assert_eq!(hw.host_setup([0; 8]), Handshake::Nak);
    }

    #[test]
    fn setup_lands_in_out_buffer() {
        let (mut hw, mut buffer) = enabled_control();
        let ep0 = Endpoint::new(EndpointAddress::from(0x00));
        unsafe { ep0.start_out(&mut hw, buffer.as_mut_ptr()) };
        ep0.set_stalled(&mut hw, true);

        assert_eq!(hw.host_setup([1, 2, 3, 4, 5, 6, 7, 8]), Handshake::Ack);
        assert_eq!(&buffer[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!ep0.is_stalled(&hw));
        assert!(hw.transaction_flags().contains(TransactionFlags::SETUP));
        let status = crate::table::descriptor(hw.endpoints(), EndpointAddress::from(0x00)).status();
        assert!(status.contains(Status::SETUP | Status::BUSNACK0));
    }

    #[test]
    fn out_overflow_truncates() {
        let (mut hw, mut buffer) = enabled_control();
        let ep0 = Endpoint::new(EndpointAddress::from(0x00));
        unsafe { ep0.start_out(&mut hw, buffer.as_mut_ptr()) };
        assert_eq!(hw.host_out(0, &[0x55; 70]), Handshake::Ack);
        assert_eq!(ep0.count(&hw), 64);
        let status = crate::table::descriptor(hw.endpoints(), EndpointAddress::from(0x00)).status();
        assert!(status.contains(Status::UNF_OVF));
    }

    #[test]
    fn auto_zlp_on_full_packets() {
        let (mut hw, _) = enabled_control();
        let ep0 = Endpoint::new(EndpointAddress::from(0x80));
        let data = [0u8; 64];
        unsafe { ep0.start_in(&mut hw, data.as_ptr(), 64, true) };
        assert!(hw.host_in(0).unwrap().zlp());
        unsafe { ep0.start_in(&mut hw, data.as_ptr(), 10, true) };
        assert!(!hw.host_in(0).unwrap().zlp());
    }

    #[test]
    fn auto_complete() {
        let (mut hw, _) = enabled_control();
        hw.set_auto_complete_in(true);
        let ep0 = Endpoint::new(EndpointAddress::from(0x80));
        let data = [9u8; 3];
        unsafe { ep0.start_in(&mut hw, data.as_ptr(), 3, false) };
        assert!(ep0.is_done(&hw));
        assert_eq!(hw.take_auto_completed().unwrap().as_slice(), &[9, 9, 9]);
    }
}
