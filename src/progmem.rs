//! Program memory bridge
//!
//! Constant descriptor data lives in flash, which the CPU can't address
//! like RAM. The `LPM` instruction reads it, but what `LPM` returns depends
//! on the NVM controller's command register. Other code (calibration reads,
//! self-programming) changes that register, so every read happens inside a
//! [`ProgramSpace`] scope that selects the right mode, and restores the
//! caller's mode when the scope ends.

use crate::hal::{Nvm, NvmCommand};

/// A span of bytes in program memory
///
/// The handle never dereferences its address. On the AVR target, place the
/// bytes in flash with `#[link_section = ".progmem.data"]`; elsewhere,
/// program and data memory share an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progmem {
    ptr: *const u8,
    len: usize,
}

impl Progmem {
    /// Describe bytes placed in program memory
    pub const fn new(bytes: &'static [u8]) -> Self {
        Progmem {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// # Safety
    ///
    /// `address` must be the program memory address of `len` readable
    /// bytes.
    pub const unsafe fn from_raw_parts(address: *const u8, len: usize) -> Self {
        Progmem { ptr: address, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-span, or `None` if the range falls outside the span
    pub fn get(&self, range: core::ops::Range<usize>) -> Option<Progmem> {
        if range.start > range.end || range.end > self.len {
            return None;
        }
        Some(Progmem {
            ptr: self.ptr.wrapping_add(range.start),
            len: range.end - range.start,
        })
    }
}

/// Production signature row offsets
pub mod signature {
    pub const LOTNUM0: usize = 0x08;
    pub const WAFNUM: usize = 0x10;
    pub const COORDX0: usize = 0x12;
    pub const USBCAL0: usize = 0x1A;
    pub const USBCAL1: usize = 0x1B;
}

/// A scope with the NVM command register set to one mode
///
/// Dropping the scope restores the command the caller had selected, on
/// every exit path.
pub struct ProgramSpace<'a, N: Nvm> {
    nvm: &'a mut N,
    saved: NvmCommand,
}

impl<'a, N: Nvm> ProgramSpace<'a, N> {
    /// Save the current command, and select `command`
    pub fn open(nvm: &'a mut N, command: NvmCommand) -> Self {
        let saved = nvm.command();
        nvm.set_command(command);
        ProgramSpace { nvm, saved }
    }

    /// Read one byte at `offset` into `source`
    ///
    /// Returns `None` past the end of `source`.
    pub fn read(&self, source: Progmem, offset: usize) -> Option<u8> {
        if offset >= source.len {
            return None;
        }
        // Safety: `Progmem` guarantees the span is readable, and offset is
        // inside of the span.
        Some(unsafe {
            self.nvm
                .load_program_byte(source.ptr.wrapping_add(offset) as usize)
        })
    }

    /// Copy `source` into `destination`, returning the number of bytes copied
    pub fn copy(&self, source: Progmem, destination: &mut [u8]) -> usize {
        let size = source.len.min(destination.len());
        for (offset, byte) in destination.iter_mut().take(size).enumerate() {
            // Safety: see read().
            *byte = unsafe {
                self.nvm
                    .load_program_byte(source.ptr.wrapping_add(offset) as usize)
            };
        }
        size
    }

    /// Read a byte from a signature row selected by the scope's command
    pub fn read_row(&self, offset: usize) -> u8 {
        // Safety: signature rows are addressed from zero, and the command
        // selected a row.
        unsafe { self.nvm.load_program_byte(offset) }
    }
}

impl<N: Nvm> Drop for ProgramSpace<'_, N> {
    fn drop(&mut self) {
        self.nvm.set_command(self.saved);
    }
}

/// Copy bytes from program memory, with the NVM in neutral mode
///
/// Returns the number of bytes copied, which is the smaller of the two
/// lengths.
pub fn copy<N: Nvm>(nvm: &mut N, source: Progmem, destination: &mut [u8]) -> usize {
    ProgramSpace::open(nvm, NvmCommand::NO_OPERATION).copy(source, destination)
}

/// Read one byte of the production signature row
pub fn read_calibration<N: Nvm>(nvm: &mut N, offset: usize) -> u8 {
    ProgramSpace::open(nvm, NvmCommand::READ_CALIBRATION_ROW).read_row(offset)
}

/// The USB pad calibration bytes, in `CAL0`, `CAL1` order
pub fn usb_calibration<N: Nvm>(nvm: &mut N) -> [u8; 2] {
    let row = ProgramSpace::open(nvm, NvmCommand::READ_CALIBRATION_ROW);
    [
        row.read_row(signature::USBCAL0),
        row.read_row(signature::USBCAL1),
    ]
}

/// A unique device serial number, from the production signature row
///
/// Six lot number bytes, the wafer number, and four die coordinate bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialNumber([u8; SerialNumber::BYTES]);

impl SerialNumber {
    pub const BYTES: usize = 11;
    /// Length of the serial number string, in characters
    pub const CHARS: usize = Self::BYTES * 2;

    pub const fn new(bytes: [u8; Self::BYTES]) -> Self {
        SerialNumber(bytes)
    }

    pub fn read<N: Nvm>(nvm: &mut N) -> Self {
        let row = ProgramSpace::open(nvm, NvmCommand::READ_CALIBRATION_ROW);
        let mut bytes = [0; Self::BYTES];
        for (idx, byte) in bytes[..6].iter_mut().enumerate() {
            *byte = row.read_row(signature::LOTNUM0 + idx);
        }
        bytes[6] = row.read_row(signature::WAFNUM);
        for (idx, byte) in bytes[7..].iter_mut().enumerate() {
            *byte = row.read_row(signature::COORDX0 + idx);
        }
        SerialNumber(bytes)
    }

    pub fn bytes(&self) -> &[u8; Self::BYTES] {
        &self.0
    }

    /// Upper case hex digits, most significant nibble first
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.0.iter().flat_map(|byte| [byte >> 4, byte & 0xF]).map(|nibble| {
            char::from_digit(u32::from(nibble), 16)
                .unwrap_or('0')
                .to_ascii_uppercase()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{copy, read_calibration, signature, usb_calibration, Progmem, SerialNumber};
    use crate::{
        hal::{Nvm, NvmCommand},
        sim::Simulated,
    };

    static TABLE: [u8; 6] = [1, 2, 3, 4, 5, 6];

    #[test]
    fn copy_restores_command() {
        let mut nvm = Simulated::new();
        let page_buffer = NvmCommand(0x26);
        nvm.set_command(page_buffer);

        let mut destination = [0; 8];
        assert_eq!(copy(&mut nvm, Progmem::new(&TABLE), &mut destination), 6);
        assert_eq!(&destination[..6], &TABLE);
        assert_eq!(nvm.command(), page_buffer);
        assert_eq!(nvm.program_reads(), 6);
        assert_eq!(nvm.misdirected_reads(), 0);
    }

    #[test]
    fn copy_truncates() {
        let mut nvm = Simulated::new();
        let mut destination = [0; 4];
        assert_eq!(copy(&mut nvm, Progmem::new(&TABLE), &mut destination), 4);
        assert_eq!(destination, [1, 2, 3, 4]);
        assert_eq!(nvm.command(), NvmCommand::NO_OPERATION);
    }

    #[test]
    fn sub_spans() {
        let table = Progmem::new(&TABLE);
        let mut nvm = Simulated::new();
        let mut destination = [0; 2];
        copy(&mut nvm, table.get(2..4).unwrap(), &mut destination);
        assert_eq!(destination, [3, 4]);
        assert!(table.get(4..7).is_none());
        assert!(table.get(6..6).unwrap().is_empty());
    }

    #[test]
    fn calibration() {
        let mut nvm = Simulated::new();
        nvm.set_signature_row(signature::USBCAL0, &[0x12, 0x34]);
        assert_eq!(read_calibration(&mut nvm, signature::USBCAL1), 0x34);
        assert_eq!(usb_calibration(&mut nvm), [0x12, 0x34]);
        assert_eq!(nvm.command(), NvmCommand::NO_OPERATION);
    }

    #[test]
    fn serial_number() {
        let mut nvm = Simulated::new();
        nvm.set_signature_row(signature::LOTNUM0, &[0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]);
        nvm.set_signature_row(signature::WAFNUM, &[0x0C]);
        nvm.set_signature_row(signature::COORDX0, &[0xDE, 0xF0, 0x00, 0x7F]);
        let serial = SerialNumber::read(&mut nvm);
        let mut chars = [' '; SerialNumber::CHARS];
        for (dst, src) in chars.iter_mut().zip(serial.chars()) {
            *dst = src;
        }
        let expected: [char; SerialNumber::CHARS] = [
            '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', '0', 'C', 'D', 'E', 'F',
            '0', '0', '0', '7', 'F',
        ];
        assert_eq!(chars, expected);
        assert_eq!(serial.chars().count(), SerialNumber::CHARS);
    }
}
