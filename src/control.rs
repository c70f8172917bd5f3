//! Control transfer engine
//!
//! The engine owns the setup record and the endpoint 0 buffers, and moves
//! each control transfer through its stages:
//!
//! ```text
//! Idle -> Setup -> DataIn  -> StatusOut -> Idle
//!               -> DataOut -> StatusIn  -> Idle
//!               -> StatusIn            -> Idle
//! ```
//!
//! It answers standard requests itself, consulting a [`Handler`] for
//! descriptors and configuration changes, and forwards class and vendor
//! requests to the handler. Every request ends in exactly one [`Response`],
//! so every branch re-opens endpoint 0 for the next SETUP.
//!
//! Protocol errors answer with STALL on both endpoint 0 directions. The SIE
//! clears the stall when the next SETUP arrives; the engine never unstalls.

use crate::{
    buffer::{Buffer, EP0_SIZE},
    endpoint::Endpoint,
    hal::{Hardware, Nvm},
    progmem::{self, Progmem},
    setup::SetupPacket,
};
use usb_device::{
    control::{Request, RequestType},
    device::UsbDeviceState,
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

/// Where a handler found descriptor bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor<'a> {
    /// Bytes in program memory, read through the memory-space bridge
    Program(Progmem),
    /// Bytes in data memory
    Data(&'a [u8]),
    /// The handler wrote this many bytes into the IN buffer it was given
    Buffer(usize),
}

/// How to finish a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Send this many bytes from the IN buffer, then accept the status stage
    Data(usize),
    /// Finish a request without a data stage
    Ack,
    /// Accept an OUT data stage; see [`Handler::control_out`]
    Receive,
    /// Reject the request
    Stall,
    /// Acknowledge, wait for the host to see it, and leave the bus
    ///
    /// Used for firmware update hand-off. The device is unusable until the
    /// next [`Device::initialize`](crate::Device::initialize).
    Detach,
}

/// Device-specific behavior of the control pipe
pub trait Handler {
    /// Resolve a GET_DESCRIPTOR request
    ///
    /// `buffer` is the endpoint 0 IN buffer, for descriptors built on
    /// request. Return `None` for descriptors that don't exist. The engine
    /// truncates the result to the host's requested length.
    fn descriptor(&mut self, kind: u8, index: u8, buffer: &mut [u8]) -> Option<Descriptor<'_>>;

    /// The vendor request code that fetches OS descriptors, if any
    fn os_vendor_code(&self) -> Option<u8> {
        None
    }

    /// Resolve an OS descriptor request, selected by the request's index
    fn os_descriptor(&mut self, index: u16, buffer: &mut [u8]) -> Option<Descriptor<'_>> {
        let _ = (index, buffer);
        None
    }

    /// Accept or reject a SET_CONFIGURATION value
    fn set_configuration(&mut self, configuration: u8) -> bool;

    /// Accept or reject a SET_INTERFACE request
    fn set_interface(&mut self, interface: u16, alternate_setting: u16) -> bool {
        let _ = (interface, alternate_setting);
        false
    }

    /// Handle a class or vendor request
    ///
    /// `buffer` is the endpoint 0 IN buffer, for a [`Response::Data`] reply.
    fn control_setup(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> Response {
        let _ = (setup, buffer);
        Response::Stall
    }

    /// Consume the data stage of a class or vendor OUT request
    ///
    /// Return `true` to acknowledge, or `false` to STALL.
    fn control_out(&mut self, setup: &SetupPacket, data: &[u8]) -> bool {
        let _ = (setup, data);
        false
    }

    /// The IN stage of a class or vendor request finished
    fn control_in_complete(&mut self, setup: &SetupPacket) {
        let _ = setup;
    }

    /// The host reset the bus
    fn reset(&mut self) {}
}

/// Control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    /// Dispatching a SETUP
    Setup,
    DataIn,
    DataOut,
    StatusIn,
    StatusOut,
}

pub(crate) fn ep0_out() -> Endpoint {
    Endpoint::new(EndpointAddress::from_parts(0, UsbDirection::Out))
}

pub(crate) fn ep0_in() -> Endpoint {
    Endpoint::new(EndpointAddress::from_parts(0, UsbDirection::In))
}

/// The control transfer state machine
pub struct Control<'a> {
    setup: SetupPacket,
    stage: Stage,
    out: Buffer<'a>,
    r#in: Buffer<'a>,
    configuration: u8,
    state: UsbDeviceState,
    detached: bool,
}

impl<'a> Control<'a> {
    pub(crate) fn new(out: Buffer<'a>, r#in: Buffer<'a>) -> Self {
        Control {
            setup: SetupPacket::default(),
            stage: Stage::Idle,
            out,
            r#in,
            configuration: 0,
            state: UsbDeviceState::Default,
            detached: false,
        }
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn state(&self) -> UsbDeviceState {
        self.state
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Return to the Default state, and open endpoint 0 for SETUP
    pub(crate) fn reset<H: Hardware>(&mut self, hw: &mut H) {
        hw.set_address(0);

        let out = ep0_out();
        out.init(hw, EndpointType::Control, EP0_SIZE as u16);
        // Safety: the OUT buffer belongs to endpoint 0 OUT for the engine's
        // lifetime.
        unsafe { out.start_out(hw, self.out.as_ptr_mut()) };

        let r#in = ep0_in();
        r#in.init(hw, EndpointType::Control, EP0_SIZE as u16);
        r#in.set_multi_packet(hw, true);

        self.setup = SetupPacket::default();
        self.stage = Stage::Idle;
        self.configuration = 0;
        self.state = UsbDeviceState::Default;
        self.detached = false;
    }

    /// A SETUP packet landed in the OUT buffer
    pub(crate) fn on_setup<H: Hardware + Nvm, C: Handler>(&mut self, hw: &mut H, handler: &mut C) {
        let mut bytes = [0; SetupPacket::LEN];
        self.out.volatile_read(&mut bytes);
        self.setup = SetupPacket::from_bytes(bytes);
        self.stage = Stage::Setup;
        debug!(
            "SETUP {=u8:#x} {=u8:#x} VALUE={=u16:#x} INDEX={=u16} LENGTH={=u16}",
            self.setup.request_type,
            self.setup.request,
            self.setup.value,
            self.setup.index,
            self.setup.length
        );

        let response = match self.setup.kind() {
            RequestType::Standard => self.standard(hw, handler),
            RequestType::Vendor
                if handler.os_vendor_code() == Some(self.setup.request)
                    && self.setup.direction() == UsbDirection::In =>
            {
                let descriptor = handler.os_descriptor(self.setup.index, self.r#in.as_mut_slice());
                self.load(hw, descriptor)
            }
            _ => handler.control_setup(&self.setup, self.r#in.as_mut_slice()),
        };
        self.respond(hw, response);
    }

    fn standard<H: Hardware + Nvm, C: Handler>(&mut self, hw: &mut H, handler: &mut C) -> Response {
        let setup = self.setup;
        let device_to_host = setup.direction() == UsbDirection::In;
        match (device_to_host, setup.request) {
            (true, Request::GET_STATUS) => self.reply(&[0, 0]),
            (false, Request::CLEAR_FEATURE | Request::SET_FEATURE) => Response::Ack,
            (false, Request::SET_ADDRESS) if setup.value < 128 => Response::Ack,
            (true, Request::GET_DESCRIPTOR) => {
                let descriptor = handler.descriptor(
                    setup.descriptor_type(),
                    setup.descriptor_index(),
                    self.r#in.as_mut_slice(),
                );
                self.load(hw, descriptor)
            }
            (true, Request::GET_CONFIGURATION) => self.reply(&[self.configuration]),
            (false, Request::SET_CONFIGURATION) => match u8::try_from(setup.value) {
                Ok(configuration) if handler.set_configuration(configuration) => {
                    self.configuration = configuration;
                    self.state = if configuration == 0 {
                        UsbDeviceState::Addressed
                    } else {
                        UsbDeviceState::Configured
                    };
                    Response::Ack
                }
                _ => Response::Stall,
            },
            (true, Request::GET_INTERFACE) if self.configuration != 0 => self.reply(&[0]),
            (false, Request::SET_INTERFACE) if handler.set_interface(setup.index, setup.value) => {
                Response::Ack
            }
            _ => Response::Stall,
        }
    }

    /// Put `bytes` in the IN buffer
    fn reply(&mut self, bytes: &[u8]) -> Response {
        Response::Data(self.r#in.volatile_write(bytes))
    }

    /// Move a resolved descriptor into the IN buffer
    ///
    /// Missing and empty descriptors STALL.
    fn load<N: Nvm>(&mut self, nvm: &mut N, descriptor: Option<Descriptor<'_>>) -> Response {
        let limit = usize::from(self.setup.length).min(self.r#in.len());
        let size = match descriptor {
            Some(Descriptor::Program(source)) if !source.is_empty() => {
                progmem::copy(nvm, source, &mut self.r#in.as_mut_slice()[..limit])
            }
            Some(Descriptor::Data(bytes)) if !bytes.is_empty() => {
                self.r#in.volatile_write(&bytes[..bytes.len().min(limit)])
            }
            Some(Descriptor::Buffer(size)) if size > 0 => size.min(limit),
            _ => {
                debug!(
                    "NO DESCRIPTOR VALUE={=u16:#x} INDEX={=u16}",
                    self.setup.value,
                    self.setup.index
                );
                return Response::Stall;
            }
        };
        Response::Data(size)
    }

    fn respond<H: Hardware>(&mut self, hw: &mut H, response: Response) {
        let setup = self.setup;
        match response {
            Response::Data(size) if setup.direction() == UsbDirection::In => {
                let size = size.min(usize::from(setup.length)).min(self.r#in.len());
                self.send(hw, size);
            }
            Response::Ack => self.ack(hw),
            Response::Receive
                if setup.direction() == UsbDirection::Out
                    && setup.length > 0
                    && usize::from(setup.length) <= EP0_SIZE =>
            {
                ep0_out().enable_control_out(hw);
                self.stage = Stage::DataOut;
            }
            Response::Detach => {
                self.ack(hw);
                ep0_in().wait(hw);
                hw.set_attached(false);
                self.detached = true;
                self.stage = Stage::Idle;
                debug!("DETACHED");
            }
            Response::Stall => self.stall(hw),
            Response::Data(_) | Response::Receive => {
                warn!(
                    "RESPONSE DOESN'T MATCH REQUEST {=u8:#x} {=u8:#x}",
                    setup.request_type,
                    setup.request
                );
                self.stall(hw);
            }
        }
    }

    /// Start the IN data stage, and accept the host's status stage
    fn send<H: Hardware>(&mut self, hw: &mut H, size: usize) {
        // A short reply needs a zero length packet if it ends on a packet
        // boundary. The SIE decides that when the flag is set.
        let zlp = size < usize::from(self.setup.length);
        ep0_out().enable_control_out(hw);
        // Safety: the IN buffer belongs to endpoint 0 IN, and holds `size`
        // bytes.
        unsafe { ep0_in().start_in(hw, self.r#in.as_ptr_mut(), size as u16, zlp) };
        self.stage = if self.setup.length == 0 {
            Stage::StatusIn
        } else {
            Stage::DataIn
        };
    }

    /// Send the zero length status packet
    fn ack<H: Hardware>(&mut self, hw: &mut H) {
        ep0_out().enable_control_out(hw);
        // Safety: nothing is read from a zero length buffer.
        unsafe { ep0_in().start_in(hw, self.r#in.as_ptr_mut(), 0, false) };
        self.stage = Stage::StatusIn;
    }

    fn stall<H: Hardware>(&mut self, hw: &mut H) {
        ep0_out().set_stalled(hw, true);
        ep0_in().set_stalled(hw, true);
        ep0_out().enable_control_out(hw);
        self.stage = Stage::Idle;
        debug!(
            "STALL {=u8:#x} {=u8:#x}",
            self.setup.request_type,
            self.setup.request
        );
    }

    /// Endpoint 0 OUT completed a data or status stage
    pub(crate) fn on_out_complete<H: Hardware, C: Handler>(&mut self, hw: &mut H, handler: &mut C) {
        match self.stage {
            Stage::DataOut => {
                let mut data = [0; EP0_SIZE];
                let size = usize::from(ep0_out().count(hw)).min(EP0_SIZE);
                let size = self.out.volatile_read(&mut data[..size]);
                let accepted = self.setup.kind() != RequestType::Standard
                    && handler.control_out(&self.setup, &data[..size]);
                if accepted {
                    self.ack(hw);
                } else {
                    self.stall(hw);
                }
            }
            Stage::StatusOut => {
                ep0_out().enable_control_out(hw);
                self.stage = Stage::Idle;
            }
            _ => {
                trace!("STALE OUT COMPLETE");
            }
        }
    }

    /// Endpoint 0 IN completed a data or status stage
    pub(crate) fn on_in_complete<H: Hardware, C: Handler>(&mut self, hw: &mut H, handler: &mut C) {
        let standard = self.setup.kind() == RequestType::Standard;
        match self.stage {
            Stage::DataIn => self.stage = Stage::StatusOut,
            Stage::StatusIn => {
                if standard && self.setup.request == Request::SET_ADDRESS {
                    let address = self.setup.value as u8;
                    hw.set_address(address);
                    self.state = if address == 0 {
                        UsbDeviceState::Default
                    } else {
                        UsbDeviceState::Addressed
                    };
                    debug!("ADDRESS {=u8}", address);
                }
                self.stage = Stage::Idle;
            }
            _ => {
                trace!("STALE IN COMPLETE");
                return;
            }
        }
        if !standard {
            handler.control_in_complete(&self.setup);
        }
    }
}
