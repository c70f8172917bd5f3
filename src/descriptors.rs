//! Reference descriptor tables
//!
//! [`DescriptorTable`] is a ready-made [`Handler`] for two device shapes: a
//! HID joystick with one interrupt IN endpoint, or a vendor class device with
//! a bulk IN / bulk OUT pair. Either shape can add a DFU runtime interface,
//! a serial number string, and Microsoft OS descriptors that bind WinUSB
//! without an INF file.
//!
//! Constant tables live in program memory. Strings, the device descriptor
//! and the extended properties descriptor depend on the [`Identity`], and
//! are built on request.

use crate::{
    control::{Descriptor, Handler, Response},
    progmem::{Progmem, SerialNumber},
    setup::SetupPacket,
};
use usb_device::{
    control::{Recipient, RequestType},
    descriptor::descriptor_type,
    UsbError,
};

/// HID class descriptor type
pub const HID: u8 = 0x21;
/// HID report descriptor type
pub const HID_REPORT: u8 = 0x22;
/// String index of the DFU runtime interface name
pub const DFU_STRING: u8 = 0x10;
/// String index Windows reads to find the OS descriptor vendor code
pub const OS_STRING: u8 = 0xEE;
/// Vendor request code for the OS descriptors
pub const OS_VENDOR_CODE: u8 = 0x22;
/// Interface number of the DFU runtime interface
pub const DFU_INTERFACE: u16 = 1;

const MANUFACTURER_STRING: u8 = 1;
const PRODUCT_STRING: u8 = 2;
const SERIAL_STRING: u8 = 3;

/// The device's function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Eight buttons and two axes on endpoint 1 IN
    Hid,
    /// Bulk endpoints 1 IN and 2 OUT
    VendorBulk,
}

/// Which descriptors the device presents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub class: Class,
    /// Add a DFU runtime interface, so a host can request a firmware update
    pub dfu_runtime: bool,
    /// Answer Microsoft OS descriptor requests
    pub os_descriptors: bool,
}

/// Vendor-specific values in the descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`
    pub release: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
    /// `DeviceInterfaceGUID` extended property, with braces
    pub interface_guid: &'static str,
    /// Optional `Label` extended property
    pub label: Option<&'static str>,
}

macro_rules! progmem {
    ($(#[$attr:meta])* static $name:ident: [u8; $len:expr] = $value:expr;) => {
        $(#[$attr])*
        #[cfg_attr(target_arch = "avr", link_section = ".progmem.data")]
        static $name: [u8; $len] = $value;
    };
}

const HID_REPORT_LEN: usize = 39;

progmem! {
    static HID_REPORT_DESCRIPTOR: [u8; HID_REPORT_LEN] = [
        0x05, 0x01, // Usage page (generic desktop)
        0x09, 0x04, // Usage (joystick)
        0xA1, 0x00, // Collection (physical)
        0x05, 0x09, //   Usage page (button)
        0x19, 0x01, //   Usage minimum (1)
        0x29, 0x08, //   Usage maximum (8)
        0x15, 0x00, //   Logical minimum (0)
        0x25, 0x01, //   Logical maximum (1)
        0x95, 0x08, //   Report count (8)
        0x75, 0x01, //   Report size (1)
        0x81, 0x02, //   Input (data, variable, absolute)
        0x05, 0x01, //   Usage page (generic desktop)
        0x09, 0x30, //   Usage (X)
        0x09, 0x31, //   Usage (Y)
        0x15, 0x81, //   Logical minimum (-127)
        0x25, 0x7F, //   Logical maximum (127)
        0x75, 0x08, //   Report size (8)
        0x95, 0x02, //   Report count (2)
        0x81, 0x02, //   Input (data, variable, absolute)
        0xC0,       // End collection
    ];
}

/// Configuration header; bus powered, 100 mA
const fn configuration(total: u16, interfaces: u8) -> [u8; 9] {
    let [lo, hi] = total.to_le_bytes();
    [9, descriptor_type::CONFIGURATION, lo, hi, interfaces, 1, 0, 0x80, 50]
}

/// Offset of the HID class descriptor in the HID configurations
const HID_CLASS_OFFSET: usize = 18;
const HID_CLASS_LEN: usize = 9;

const HID_FUNCTION: [u8; 25] = [
    // Interface 0: HID, no subclass, no protocol
    9, 4, 0, 0, 1, 0x03, 0x00, 0x00, 0,
    // HID 1.11, one report descriptor
    9, HID, 0x11, 0x01, 0, 1, HID_REPORT, HID_REPORT_LEN as u8, 0,
    // Endpoint 1 IN, interrupt, 64 bytes, 1 ms
    7, 5, 0x81, 0x03, 64, 0, 1,
];

const VENDOR_FUNCTION: [u8; 23] = [
    // Interface 0: vendor specific
    9, 4, 0, 0, 2, 0xFF, 0x00, 0x00, 0,
    // Endpoint 1 IN, bulk, 64 bytes
    7, 5, 0x81, 0x02, 64, 0, 0,
    // Endpoint 2 OUT, bulk, 64 bytes
    7, 5, 0x02, 0x02, 64, 0, 0,
];

const DFU_FUNCTION: [u8; 18] = [
    // Interface 1: application specific, DFU, runtime protocol
    9, 4, DFU_INTERFACE as u8, 0, 0, 0xFE, 0x01, 0x01, DFU_STRING,
    // DFU functional: can download, will detach, 256 byte transfers, DFU 1.1
    9, 0x21, 0x09, 0, 0, 0x00, 0x01, 0x01, 0x01,
];

/// Concatenate descriptor parts at compile time
const fn join<const N: usize>(parts: &[&[u8]]) -> [u8; N] {
    let mut out = [0; N];
    let mut idx = 0;
    let mut part = 0;
    while part < parts.len() {
        let mut byte = 0;
        while byte < parts[part].len() {
            out[idx] = parts[part][byte];
            idx += 1;
            byte += 1;
        }
        part += 1;
    }
    assert!(idx == N, "descriptor parts don't fill the descriptor");
    out
}

progmem! {
    static HID_CONFIGURATION: [u8; 34] = join(&[&configuration(34, 1), &HID_FUNCTION]);
}
progmem! {
    static HID_DFU_CONFIGURATION: [u8; 52] =
        join(&[&configuration(52, 2), &HID_FUNCTION, &DFU_FUNCTION]);
}
progmem! {
    static VENDOR_CONFIGURATION: [u8; 32] = join(&[&configuration(32, 1), &VENDOR_FUNCTION]);
}
progmem! {
    static VENDOR_DFU_CONFIGURATION: [u8; 50] =
        join(&[&configuration(50, 2), &VENDOR_FUNCTION, &DFU_FUNCTION]);
}
progmem! {
    /// US English only
    static LANGUAGES: [u8; 4] = [4, descriptor_type::STRING, 0x09, 0x04];
}

/// Compatible ID descriptor header, and one WinUSB function
const fn compatible_id(first_interface: u8) -> [u8; 40] {
    let mut descriptor = [0; 40];
    // dwLength, bcdVersion 1.00, wIndex, bCount
    descriptor[0] = 40;
    descriptor[5] = 0x01;
    descriptor[6] = 4;
    descriptor[8] = 1;
    descriptor[16] = first_interface;
    descriptor[17] = 0x01;
    let id = *b"WINUSB";
    let mut idx = 0;
    while idx < id.len() {
        descriptor[18 + idx] = id[idx];
        idx += 1;
    }
    descriptor
}

progmem! {
    /// WinUSB for the vendor interface, and the DFU interface that follows
    static VENDOR_COMPATIBLE_ID: [u8; 40] = compatible_id(0);
}
progmem! {
    /// WinUSB for the DFU interface only; the HID driver keeps interface 0
    static HID_COMPATIBLE_ID: [u8; 40] = compatible_id(1);
}

/// Builds a descriptor in a caller's buffer
struct Writer<'b> {
    buffer: &'b mut [u8],
    len: usize,
}

impl<'b> Writer<'b> {
    fn new(buffer: &'b mut [u8]) -> Self {
        Writer { buffer, len: 0 }
    }

    fn bytes(&mut self, bytes: &[u8]) -> Result<(), UsbError> {
        let end = self.len + bytes.len();
        self.buffer
            .get_mut(self.len..end)
            .ok_or(UsbError::BufferOverflow)?
            .copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    fn u16(&mut self, value: u16) -> Result<(), UsbError> {
        self.bytes(&value.to_le_bytes())
    }

    fn u32(&mut self, value: u32) -> Result<(), UsbError> {
        self.bytes(&value.to_le_bytes())
    }

    fn utf16(&mut self, chars: impl Iterator<Item = char>) -> Result<(), UsbError> {
        let mut units = [0; 2];
        for ch in chars {
            for unit in ch.encode_utf16(&mut units) {
                self.u16(*unit)?;
            }
        }
        Ok(())
    }

    /// Patch a length field written earlier
    fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Write a string descriptor, returning its length
fn string(buffer: &mut [u8], chars: impl Iterator<Item = char>) -> Result<usize, UsbError> {
    let mut writer = Writer::new(buffer);
    writer.bytes(&[0, descriptor_type::STRING])?;
    writer.utf16(chars)?;
    let len = u8::try_from(writer.len).map_err(|_| UsbError::BufferOverflow)?;
    writer.patch(0, &[len]);
    Ok(writer.len)
}

const GUID_PROPERTY: &str = "DeviceInterfaceGUID";
const LABEL_PROPERTY: &str = "Label";
const REG_SZ: u32 = 1;

/// Size of one `REG_SZ` property section
fn property_len(name: &str, data: &str) -> usize {
    let utf16z = |text: &str| text.encode_utf16().count() * 2 + 2;
    4 + 4 + 2 + utf16z(name) + 4 + utf16z(data)
}

fn property(writer: &mut Writer<'_>, name: &str, data: &str) -> Result<(), UsbError> {
    writer.u32(property_len(name, data) as u32)?;
    writer.u32(REG_SZ)?;
    writer.u16((name.encode_utf16().count() * 2 + 2) as u16)?;
    writer.utf16(name.chars().chain(['\0']))?;
    writer.u32((data.encode_utf16().count() * 2 + 2) as u32)?;
    writer.utf16(data.chars().chain(['\0']))
}

/// Write an extended properties descriptor
///
/// Carries `DeviceInterfaceGUID`, and `Label` when one is given.
fn extended_properties(
    buffer: &mut [u8],
    guid: &str,
    label: Option<&str>,
) -> Result<usize, UsbError> {
    let total = 10
        + property_len(GUID_PROPERTY, guid)
        + label.map_or(0, |label| property_len(LABEL_PROPERTY, label));

    let mut writer = Writer::new(buffer);
    writer.u32(total as u32)?;
    writer.u16(0x0100)?;
    writer.u16(5)?;
    writer.u16(1 + u16::from(label.is_some()))?;
    property(&mut writer, GUID_PROPERTY, guid)?;
    if let Some(label) = label {
        property(&mut writer, LABEL_PROPERTY, label)?;
    }
    Ok(writer.len)
}

/// DFU class requests
mod dfu {
    pub const DETACH: u8 = 0;
    pub const CLRSTATUS: u8 = 4;
    pub const GETSTATUS: u8 = 3;
    pub const GETSTATE: u8 = 5;
    pub const ABORT: u8 = 6;

    /// `appIDLE`
    pub const APP_IDLE: u8 = 0;
    /// `OK`, no poll timeout, `appIDLE`, no string
    pub const STATUS: [u8; 6] = [0, 0, 0, 0, APP_IDLE, 0];
}

/// A [`Handler`] serving one of the reference device shapes
pub struct DescriptorTable {
    shape: Shape,
    identity: Identity,
    serial: Option<SerialNumber>,
    device: [u8; 18],
}

impl DescriptorTable {
    /// Select the descriptors for `shape`
    ///
    /// Pass a serial number, usually [`SerialNumber::read`], to present a
    /// serial number string.
    pub const fn new(shape: Shape, identity: Identity, serial: Option<SerialNumber>) -> Self {
        let class = match shape.class {
            Class::Hid => 0x00,
            Class::VendorBulk => 0xFF,
        };
        let [vid_lo, vid_hi] = identity.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = identity.product_id.to_le_bytes();
        let [rel_lo, rel_hi] = identity.release.to_le_bytes();
        let serial_string = if serial.is_some() { SERIAL_STRING } else { 0 };
        let device = [
            18,
            descriptor_type::DEVICE,
            0x00,
            0x02,
            class,
            0,
            0,
            crate::buffer::EP0_SIZE as u8,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            rel_lo,
            rel_hi,
            MANUFACTURER_STRING,
            PRODUCT_STRING,
            serial_string,
            1,
        ];
        DescriptorTable {
            shape,
            identity,
            serial,
            device,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    fn configuration(&self) -> Progmem {
        match (self.shape.class, self.shape.dfu_runtime) {
            (Class::Hid, false) => Progmem::new(&HID_CONFIGURATION),
            (Class::Hid, true) => Progmem::new(&HID_DFU_CONFIGURATION),
            (Class::VendorBulk, false) => Progmem::new(&VENDOR_CONFIGURATION),
            (Class::VendorBulk, true) => Progmem::new(&VENDOR_DFU_CONFIGURATION),
        }
    }

    fn string(&self, index: u8, buffer: &mut [u8]) -> Option<Descriptor<'_>> {
        let written = match index {
            0 => return Some(Descriptor::Program(Progmem::new(&LANGUAGES))),
            MANUFACTURER_STRING => string(buffer, self.identity.manufacturer.chars()),
            PRODUCT_STRING => string(buffer, self.identity.product.chars()),
            SERIAL_STRING => string(buffer, self.serial.as_ref()?.chars()),
            DFU_STRING if self.shape.dfu_runtime => string(buffer, "Runtime".chars()),
            OS_STRING if self.shape.os_descriptors => string(
                buffer,
                "MSFT100".chars().chain([char::from(OS_VENDOR_CODE)]),
            ),
            _ => return None,
        };
        match written {
            Ok(len) => Some(Descriptor::Buffer(len)),
            Err(_) => {
                warn!("STRING {=u8} DOESN'T FIT", index);
                None
            }
        }
    }

    fn dfu_request(&self, setup: &SetupPacket, buffer: &mut [u8]) -> Response {
        match setup.request {
            dfu::DETACH => Response::Detach,
            dfu::GETSTATUS => match buffer.get_mut(..dfu::STATUS.len()) {
                Some(status) => {
                    status.copy_from_slice(&dfu::STATUS);
                    Response::Data(dfu::STATUS.len())
                }
                None => Response::Stall,
            },
            dfu::GETSTATE => match buffer.first_mut() {
                Some(state) => {
                    *state = dfu::APP_IDLE;
                    Response::Data(1)
                }
                None => Response::Stall,
            },
            dfu::ABORT | dfu::CLRSTATUS => Response::Ack,
            _ => Response::Stall,
        }
    }
}

impl Handler for DescriptorTable {
    fn descriptor(&mut self, kind: u8, index: u8, buffer: &mut [u8]) -> Option<Descriptor<'_>> {
        let hid = self.shape.class == Class::Hid;
        match kind {
            descriptor_type::DEVICE => Some(Descriptor::Data(&self.device)),
            descriptor_type::CONFIGURATION => Some(Descriptor::Program(self.configuration())),
            descriptor_type::STRING => self.string(index, buffer),
            HID if hid => self
                .configuration()
                .get(HID_CLASS_OFFSET..HID_CLASS_OFFSET + HID_CLASS_LEN)
                .map(Descriptor::Program),
            HID_REPORT if hid => Some(Descriptor::Program(Progmem::new(&HID_REPORT_DESCRIPTOR))),
            _ => None,
        }
    }

    fn os_vendor_code(&self) -> Option<u8> {
        self.shape.os_descriptors.then_some(OS_VENDOR_CODE)
    }

    fn os_descriptor(&mut self, index: u16, buffer: &mut [u8]) -> Option<Descriptor<'_>> {
        if !self.shape.os_descriptors {
            return None;
        }
        match index {
            4 => Some(Descriptor::Program(match self.shape.class {
                Class::Hid => Progmem::new(&HID_COMPATIBLE_ID),
                Class::VendorBulk => Progmem::new(&VENDOR_COMPATIBLE_ID),
            })),
            5 => extended_properties(buffer, self.identity.interface_guid, self.identity.label)
                .ok()
                .map(Descriptor::Buffer),
            _ => None,
        }
    }

    fn set_configuration(&mut self, configuration: u8) -> bool {
        configuration <= 1
    }

    fn control_setup(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> Response {
        if self.shape.dfu_runtime
            && setup.kind() == RequestType::Class
            && setup.recipient() == Recipient::Interface
            && setup.index == DFU_INTERFACE
        {
            self.dfu_request(setup, buffer)
        } else {
            Response::Stall
        }
    }
}
