//! Endpoint register model
//!
//! An [`Endpoint`] names one direction of one endpoint number, and whether
//! it runs in ping-pong mode. It holds no state of its own; every query
//! reads the endpoint descriptor table through the [`Hardware`] interface,
//! and every flag change goes through the hardware's atomic primitives.

use crate::{
    hal::Hardware,
    ral,
    table::{self, EpDescriptor, Status},
};
use usb_device::endpoint::{EndpointAddress, EndpointType};

/// The two hardware banks of an endpoint
///
/// Non-ping-pong endpoints only use bank 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Zero,
    One,
}

impl Bank {
    const fn index(self) -> u8 {
        match self {
            Bank::Zero => 0,
            Bank::One => 1,
        }
    }
    const fn busy_nack(self) -> Status {
        match self {
            Bank::Zero => Status::BUSNACK0,
            Bank::One => Status::BUSNACK1,
        }
    }
    const fn complete(self) -> Status {
        match self {
            Bank::Zero => Status::TRNCOMPL0,
            Bank::One => Status::TRNCOMPL1,
        }
    }
}

/// A USB endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    address: EndpointAddress,
    pingpong: bool,
}

impl Endpoint {
    /// A single-bank endpoint
    pub const fn new(address: EndpointAddress) -> Self {
        Endpoint {
            address,
            pingpong: false,
        }
    }

    /// A double-banked endpoint
    ///
    /// The endpoint takes the opposite direction's descriptor as its second
    /// bank, so that direction is unusable as an independent endpoint.
    pub const fn pingpong(address: EndpointAddress) -> Self {
        Endpoint {
            address,
            pingpong: true,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn is_pingpong(&self) -> bool {
        self.pingpong
    }

    fn bank_descriptor<'h, H: Hardware>(&self, hw: &'h H, bank: Bank) -> &'h EpDescriptor {
        table::descriptor(
            hw.endpoints(),
            table::bank_address(self.address, bank.index()),
        )
    }

    fn status<H: Hardware>(&self, hw: &H) -> Status {
        self.bank_descriptor(hw, Bank::Zero).status()
    }

    /// Both completion flags for ping-pong endpoints, otherwise only bank 0's
    ///
    /// `TRNCOMPL1` doubles as `SETUP` on control endpoints, so a single-bank
    /// endpoint must never look at it.
    fn complete_mask(&self) -> Status {
        if self.pingpong {
            Status::TRNCOMPL0 | Status::TRNCOMPL1
        } else {
            Status::TRNCOMPL0
        }
    }

    /// Configure the endpoint type and buffer size, and NACK the host
    ///
    /// # Panics
    ///
    /// Panics if the endpoint number is outside of the endpoint table.
    pub fn init<H: Hardware>(&self, hw: &mut H, kind: EndpointType, max_packet_size: u16) {
        use crate::table::CTRL::TYPE::RW::{BULK, CONTROL, ISOCHRONOUS};
        let kind = match kind {
            EndpointType::Control => CONTROL,
            // The SIE treats interrupt endpoints as bulk endpoints.
            EndpointType::Bulk | EndpointType::Interrupt => BULK,
            EndpointType::Isochronous { .. } => ISOCHRONOUS,
        };
        let size = table::buffer_size_code(max_packet_size);

        let ep = self.bank_descriptor(hw, Bank::Zero);
        if self.pingpong {
            ep.STATUS.write((Status::BUSNACK0 | Status::BUSNACK1).bits());
            ral::write_reg!(crate::table, ep, CTRL, TYPE: kind, PINGPONG: 1, BUFSIZE: size);

            let other = self.bank_descriptor(hw, Bank::One);
            ral::write_reg!(crate::table, other, CTRL, 0);
            other.STATUS.write(Status::BUSNACK0.bits());
        } else {
            ep.STATUS.write(Status::BUSNACK0.bits());
            ral::write_reg!(crate::table, ep, CTRL, TYPE: kind, BUFSIZE: size);
        }
        debug!(
            "EP{=usize} {=bool} INIT TYPE={=u8} SIZE={=u16} PINGPONG={=bool}",
            self.address.index(),
            self.address.is_in(),
            kind,
            max_packet_size,
            self.pingpong
        );
    }

    /// Disable the endpoint in the descriptor table
    pub fn disable<H: Hardware>(&self, hw: &mut H) {
        let ep = self.bank_descriptor(hw, Bank::Zero);
        ral::write_reg!(crate::table, ep, CTRL, 0);
        ep.STATUS.write(Status::BUSNACK0.bits());
    }

    /// Split the endpoint's IN data into packets in hardware
    pub fn set_multi_packet<H: Hardware>(&self, hw: &mut H, multi_packet: bool) {
        let ep = self.bank_descriptor(hw, Bank::Zero);
        ral::modify_reg!(crate::table, ep, CTRL, MULTIPKT: multi_packet as u8);
    }

    /// Abort any armed transfer, and NACK the host
    pub fn cancel<H: Hardware>(&self, hw: &mut H) {
        if self.pingpong {
            hw.load_and_set(self.address, Status::BUSNACK0 | Status::BUSNACK1);
            hw.load_and_clear(self.address, Status::BANK);
        } else {
            hw.load_and_set(self.address, Status::BUSNACK0);
        }
    }

    /// Hand a buffer to one bank, and stop NACKing the host
    ///
    /// For an IN endpoint, `size` is the number of bytes to send, and `zlp`
    /// requests a zero length packet when `size` is a multiple of the packet
    /// size. For an OUT endpoint, `size` and `zlp` are ignored; the buffer
    /// must hold one full packet.
    ///
    /// Arming clears the bank's completion flag in the same atomic operation
    /// that clears its NACK flag.
    ///
    /// # Safety
    ///
    /// `data` must remain valid, and must not be used by anything else,
    /// until the bank completes or is cancelled. The bank must not already
    /// be armed.
    pub unsafe fn start_bank<H: Hardware>(
        &self,
        hw: &mut H,
        bank: Bank,
        data: *mut u8,
        size: u16,
        zlp: bool,
    ) {
        let ep = self.bank_descriptor(hw, bank);
        ep.DATAPTR.write(data as usize);
        if self.address.is_in() {
            ep.AUXDATA.write(0);
            ral::write_reg!(crate::table, ep, CNT, COUNT: size, AZLP: zlp as u16);
        }
        trace!(
            "EP{=usize} {=bool} ARM BANK={=u8} SIZE={=u16}",
            self.address.index(),
            self.address.is_in(),
            bank.index(),
            size
        );
        hw.load_and_clear(self.address, bank.busy_nack() | bank.complete());
    }

    /// Start an IN transfer on bank 0
    ///
    /// # Safety
    ///
    /// See [`start_bank`](Endpoint::start_bank).
    pub unsafe fn start_in<H: Hardware>(&self, hw: &mut H, data: *const u8, size: u16, zlp: bool) {
        self.start_bank(hw, Bank::Zero, data as *mut u8, size, zlp)
    }

    /// Start an OUT transfer on bank 0
    ///
    /// # Safety
    ///
    /// See [`start_bank`](Endpoint::start_bank).
    pub unsafe fn start_out<H: Hardware>(&self, hw: &mut H, data: *mut u8) {
        self.start_bank(hw, Bank::Zero, data, 0, false)
    }

    /// Re-open endpoint 0 OUT for the next OUT packet or SETUP
    ///
    /// Clears stale completion and overflow state along with the NACK flag.
    /// A pending `SETUP` stays set for the next transaction interrupt. The
    /// data pointer stays where reset put it.
    pub fn enable_control_out<H: Hardware>(&self, hw: &mut H) {
        hw.load_and_clear(
            self.address,
            Status::BUSNACK0 | Status::TRNCOMPL0 | Status::UNF_OVF,
        );
    }

    /// `true` if a transfer completed
    ///
    /// Completion is level sensitive. It stays set until
    /// [`clear_done`](Endpoint::clear_done), or until the bank is re-armed.
    pub fn is_done<H: Hardware>(&self, hw: &H) -> bool {
        self.status(hw).intersects(self.complete_mask())
    }

    /// `true` if the given bank completed a transfer
    pub fn is_bank_done<H: Hardware>(&self, hw: &H, bank: Bank) -> bool {
        self.status(hw).contains(bank.complete())
    }

    /// Acknowledge completion
    pub fn clear_done<H: Hardware>(&self, hw: &mut H) {
        hw.load_and_clear(self.address, self.complete_mask());
    }

    /// `true` if at least one bank is idle, and may be armed
    pub fn is_ready<H: Hardware>(&self, hw: &H) -> bool {
        self.status(hw)
            .intersects(Status::BUSNACK0 | Status::BUSNACK1)
    }

    /// `true` if no bank is armed
    pub fn is_empty<H: Hardware>(&self, hw: &H) -> bool {
        let status = self.status(hw);
        if self.pingpong {
            status.contains(Status::BUSNACK0 | Status::BUSNACK1)
        } else {
            status.contains(Status::BUSNACK0)
        }
    }

    /// Bytes received into, or armed for sending from, bank 0
    pub fn count<H: Hardware>(&self, hw: &H) -> u16 {
        self.count_bank(hw, Bank::Zero)
    }

    pub fn count_bank<H: Hardware>(&self, hw: &H, bank: Bank) -> u16 {
        let ep = self.bank_descriptor(hw, bank);
        ral::read_reg!(crate::table, ep, CNT, COUNT)
    }

    /// The bank the SIE services next
    pub fn bank<H: Hardware>(&self, hw: &H) -> Bank {
        if self.status(hw).contains(Status::BANK) {
            Bank::One
        } else {
            Bank::Zero
        }
    }

    pub fn set_bank<H: Hardware>(&self, hw: &mut H, bank: Bank) {
        match bank {
            Bank::Zero => hw.load_and_clear(self.address, Status::BANK),
            Bank::One => hw.load_and_set(self.address, Status::BANK),
        };
    }

    /// Respond to the host with STALL, or stop stalling
    pub fn set_stalled<H: Hardware>(&self, hw: &mut H, stalled: bool) {
        let ep = self.bank_descriptor(hw, Bank::Zero);
        ral::modify_reg!(crate::table, ep, CTRL, STALL: stalled as u8);
    }

    pub fn is_stalled<H: Hardware>(&self, hw: &H) -> bool {
        let ep = self.bank_descriptor(hw, Bank::Zero);
        ral::read_reg!(crate::table, ep, CTRL, STALL == 1)
    }

    /// Spin until a transfer completes
    ///
    /// This blocks the caller, and any interrupt of equal or lower priority.
    /// Only use it where the device has nothing else left to do.
    pub fn wait<H: Hardware>(&self, hw: &H) {
        while !self.is_done(hw) {
            core::hint::spin_loop();
        }
    }
}
