//! SETUP packets

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// The eight bytes of a SETUP packet
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }

    /// Direction of the data stage
    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Descriptor type of a GET_DESCRIPTOR request
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index of a GET_DESCRIPTOR request
    pub fn descriptor_index(&self) -> u8 {
        self.value as u8
    }
}
