//! The USB device, and its interrupt handlers
//!
//! The USB module has two interrupt vectors. The bus event vector signals
//! start of frame, bus errors, stalls, and suspend / resume / reset. The
//! transaction complete vector signals SETUP packets and finished
//! transactions. Call [`Device::service`] with the matching [`Interrupt`]
//! from each vector, or poll both from a loop when interrupts are off.
//!
//! Each call runs to completion, including any request dispatch, before it
//! returns. A SETUP is never serviced while the previous one is still being
//! dispatched.

use crate::{
    buffer::Ep0Memory,
    control::{self, Control, Handler, Stage},
    hal::{BusFlags, Hardware, InterruptLevel, Nvm, Speed, TransactionFlags},
    progmem,
    setup::SetupPacket,
    table::{self, Status},
};
use usb_device::device::UsbDeviceState;

/// Device configuration
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub speed: Speed,
    pub interrupts: InterruptLevel,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            speed: Speed::Full,
            interrupts: InterruptLevel::Medium,
        }
    }
}

/// The USB module's interrupt sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    BusEvent,
    TransactionComplete,
}

/// The bus condition serviced by a bus event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    StartOfFrame,
    /// CRC, underflow or overflow; the host retries
    Error(BusFlags),
    Stall,
    /// The device returned to the Default state
    Reset,
    Suspend,
    Resume,
}

bitflags::bitflags! {
    /// Dispatches made while servicing a transaction complete event
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dispatched : u8 {
        const SETUP = 1 << 0;
        const CONTROL_OUT = 1 << 1;
        const CONTROL_IN = 1 << 2;
    }
}

/// What a call to [`Device::service`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serviced {
    Bus(Option<BusEvent>),
    Transaction(Dispatched),
}

/// A USB device on the XMEGA USB module
///
/// The device owns the hardware, the endpoint 0 buffers, and the request
/// handler. Firmware reaches its own endpoints through
/// [`hardware_mut`](Device::hardware_mut) and [`Endpoint`](crate::Endpoint).
pub struct Device<'a, H, C> {
    hw: H,
    handler: C,
    control: Control<'a>,
    config: Config,
    suspended: bool,
}

impl<'a, H: Hardware + Nvm, C: Handler> Device<'a, H, C> {
    /// Create a device
    ///
    /// Call [`initialize`](Device::initialize) to bring up the USB module.
    ///
    /// # Panics
    ///
    /// Panics if `memory` already belongs to another device.
    pub fn new<const IN_SIZE: usize>(
        hw: H,
        memory: &'a Ep0Memory<IN_SIZE>,
        handler: C,
        config: Config,
    ) -> Self {
        let (out, r#in) = memory
            .take()
            .expect("Endpoint 0 memory already assigned");
        Device {
            hw,
            handler,
            control: Control::new(out, r#in),
            config,
            suspended: false,
        }
    }

    /// Calibrate and enable the USB module, reset endpoint 0, and attach
    ///
    /// The device enters the Default state. A bus reset repeats this.
    pub fn initialize(&mut self) {
        let calibration = progmem::usb_calibration(&mut self.hw);
        self.control.reset(&mut self.hw);
        self.hw.enable(self.config.speed, calibration);
        self.hw.set_interrupts(self.config.interrupts);
        self.hw.set_attached(true);
        self.suspended = false;
        self.handler.reset();
        debug!("INITIALIZED");
    }

    /// Disconnect from the bus
    pub fn detach(&mut self) {
        self.hw.set_attached(false);
    }

    /// Service one interrupt source
    pub fn service(&mut self, interrupt: Interrupt) -> Serviced {
        match interrupt {
            Interrupt::BusEvent => Serviced::Bus(self.on_bus_event()),
            Interrupt::TransactionComplete => Serviced::Transaction(self.on_transaction_complete()),
        }
    }

    /// Service the highest priority bus condition
    ///
    /// Other pending conditions stay pending for the next call.
    pub fn on_bus_event(&mut self) -> Option<BusEvent> {
        let flags = self.hw.bus_flags();
        let errors = BusFlags::CRC | BusFlags::UNDERFLOW | BusFlags::OVERFLOW;

        if flags.contains(BusFlags::SOF) {
            self.hw.clear_bus_flags(BusFlags::SOF);
            Some(BusEvent::StartOfFrame)
        } else if flags.intersects(errors) {
            let errors = flags & errors;
            self.hw.clear_bus_flags(errors);
            warn!("BUS ERROR {=u8:#x}", errors.bits());
            Some(BusEvent::Error(errors))
        } else if flags.contains(BusFlags::STALL) {
            self.hw.clear_bus_flags(BusFlags::STALL);
            Some(BusEvent::Stall)
        } else {
            self.hw
                .clear_bus_flags(BusFlags::SUSPEND | BusFlags::RESUME | BusFlags::RESET);
            if self.hw.bus_reset() {
                self.hw.clear_bus_reset();
                debug!("BUS RESET");
                self.initialize();
                Some(BusEvent::Reset)
            } else if flags.contains(BusFlags::SUSPEND) {
                self.suspended = true;
                Some(BusEvent::Suspend)
            } else if flags.contains(BusFlags::RESUME) {
                self.suspended = false;
                Some(BusEvent::Resume)
            } else {
                None
            }
        }
    }

    /// Service SETUP and completed endpoint 0 transfers
    ///
    /// The IN completion of the previous transfer is delivered before a new
    /// SETUP, so both dispatch in the same call when they arrive together.
    pub fn on_transaction_complete(&mut self) -> Dispatched {
        self.hw.reset_fifo();
        self.hw
            .clear_transaction_flags(TransactionFlags::SETUP | TransactionFlags::TRANSACTION);

        let out = control::ep0_out();
        let r#in = control::ep0_in();
        let status = table::descriptor(self.hw.endpoints(), out.address()).status();
        let mut dispatched = Dispatched::empty();

        if r#in.is_done(&self.hw) {
            r#in.clear_done(&mut self.hw);
            self.control.on_in_complete(&mut self.hw, &mut self.handler);
            dispatched |= Dispatched::CONTROL_IN;
        }

        if status.contains(Status::SETUP) {
            self.hw
                .load_and_clear(out.address(), Status::SETUP | Status::TRNCOMPL0);
            self.control.on_setup(&mut self.hw, &mut self.handler);
            dispatched |= Dispatched::SETUP;
        } else if status.contains(Status::TRNCOMPL0) {
            out.clear_done(&mut self.hw);
            self.control.on_out_complete(&mut self.hw, &mut self.handler);
            dispatched |= Dispatched::CONTROL_OUT;
        }

        dispatched
    }

    /// The enumeration state
    ///
    /// Reports `Suspend` while the bus is suspended, whatever the underlying
    /// state.
    pub fn state(&self) -> UsbDeviceState {
        if self.suspended {
            UsbDeviceState::Suspend
        } else {
            self.control.state()
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The accepted SET_CONFIGURATION value, or zero
    pub fn configuration(&self) -> u8 {
        self.control.configuration()
    }

    /// The most recent SETUP packet
    pub fn setup(&self) -> &SetupPacket {
        self.control.setup()
    }

    pub fn stage(&self) -> Stage {
        self.control.stage()
    }

    /// `true` after a request answered with [`Response::Detach`](crate::Response::Detach)
    pub fn is_detached(&self) -> bool {
        self.control.is_detached()
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn handler(&self) -> &C {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut C {
        &mut self.handler
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::{BusEvent, Config, Device, Dispatched, Interrupt, Serviced};
    use crate::{
        buffer::Ep0Memory,
        control::{Descriptor, Handler, Response, Stage},
        hal::{BusFlags, Hardware, InterruptLevel, Speed},
        progmem::{signature, Progmem},
        setup::SetupPacket,
        sim::{Handshake, Simulated},
        table::Status,
    };
    use std::vec::Vec;
    use usb_device::{device::UsbDeviceState, endpoint::EndpointAddress};

    static DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 0, 1,
    ];

    /// Records what the engine asked for
    #[derive(Default)]
    struct Recorder {
        configurations: usize,
        in_completions: usize,
        received: [u8; 8],
        resets: usize,
    }

    impl Handler for Recorder {
        fn descriptor(&mut self, kind: u8, index: u8, buffer: &mut [u8]) -> Option<Descriptor<'_>> {
            match (kind, index) {
                (1, 0) => Some(Descriptor::Program(Progmem::new(&DEVICE))),
                (3, 1) => {
                    buffer[..4].copy_from_slice(&[4, 3, b'A', 0]);
                    Some(Descriptor::Buffer(4))
                }
                (3, 2) => Some(Descriptor::Buffer(0)),
                _ => None,
            }
        }
        fn set_configuration(&mut self, configuration: u8) -> bool {
            self.configurations += 1;
            configuration <= 1
        }
        fn control_setup(&mut self, setup: &SetupPacket, buffer: &mut [u8]) -> Response {
            match setup.request {
                0x01 => {
                    buffer[..3].copy_from_slice(&[7, 8, 9]);
                    Response::Data(3)
                }
                0x02 => Response::Receive,
                0x03 => Response::Detach,
                _ => Response::Stall,
            }
        }
        fn control_out(&mut self, _: &SetupPacket, data: &[u8]) -> bool {
            self.received[..data.len()].copy_from_slice(data);
            data.len() == 8
        }
        fn control_in_complete(&mut self, _: &SetupPacket) {
            self.in_completions += 1;
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
        SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        }
        .to_bytes()
    }

    fn device(memory: &Ep0Memory) -> Device<'_, Simulated, Recorder> {
        let mut hw = Simulated::new();
        hw.set_signature_row(signature::USBCAL0, &[0xC0, 0xC1]);
        let mut device = Device::new(hw, memory, Recorder::default(), Config::new());
        device.initialize();
        device
    }

    fn transact(device: &mut Device<'_, Simulated, Recorder>) -> Dispatched {
        match device.service(Interrupt::TransactionComplete) {
            Serviced::Transaction(dispatched) => dispatched,
            other => panic!("unexpected {other:?}"),
        }
    }

    /// Run a complete IN control transfer, returning the data stage
    fn control_in(device: &mut Device<'_, Simulated, Recorder>, packet: [u8; 8]) -> Vec<u8> {
        assert_eq!(device.hardware_mut().host_setup(packet), Handshake::Ack);
        assert_eq!(transact(device), Dispatched::SETUP);
        let data = device.hardware_mut().host_in(0).unwrap().as_slice().to_vec();
        assert_eq!(transact(device), Dispatched::CONTROL_IN);
        assert_eq!(device.stage(), Stage::StatusOut);
        assert_eq!(device.hardware_mut().host_out(0, &[]), Handshake::Ack);
        assert_eq!(transact(device), Dispatched::CONTROL_OUT);
        assert_eq!(device.stage(), Stage::Idle);
        data
    }

    /// Run a no-data control transfer, returning the status handshake
    fn control_no_data(device: &mut Device<'_, Simulated, Recorder>, packet: [u8; 8]) -> Handshake {
        device.hardware_mut().host_setup(packet);
        assert_eq!(transact(device), Dispatched::SETUP);
        match device.hardware_mut().host_in(0) {
            Ok(transfer) => {
                assert!(transfer.as_slice().is_empty());
                assert_eq!(transact(device), Dispatched::CONTROL_IN);
                Handshake::Ack
            }
            Err(handshake) => handshake,
        }
    }

    fn ep0_stalled(device: &Device<'_, Simulated, Recorder>) -> bool {
        let hw = device.hardware();
        hw.is_stalled(EndpointAddress::from(0x00)) && hw.is_stalled(EndpointAddress::from(0x80))
    }

    #[test]
    fn initialize() {
        let memory = Ep0Memory::new();
        let device = device(&memory);
        let hw = device.hardware();
        assert!(hw.is_attached());
        assert_eq!(hw.speed(), Some(Speed::Full));
        assert_eq!(hw.calibration(), Some([0xC0, 0xC1]));
        assert_eq!(hw.interrupt_level(), InterruptLevel::Medium);
        assert_eq!(device.state(), UsbDeviceState::Default);
        assert_eq!(device.handler().resets, 1);
    }

    #[test]
    fn descriptor_shorter_than_request() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let data = control_in(&mut device, setup(0x80, 6, 0x0100, 0, 64));
        assert_eq!(data, DEVICE);
    }

    #[test]
    fn descriptor_truncated_to_request() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let data = control_in(&mut device, setup(0x80, 6, 0x0100, 0, 8));
        assert_eq!(data, DEVICE[..8]);
    }

    #[test]
    fn descriptor_built_in_buffer() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let data = control_in(&mut device, setup(0x80, 6, 0x0301, 0x0409, 255));
        assert_eq!(data, [4u8, 3, b'A', 0]);
    }

    #[test]
    fn missing_and_empty_descriptors_stall() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        for value in [0x0200, 0x0302] {
            device.hardware_mut().host_setup(setup(0x80, 6, value, 0, 64));
            assert_eq!(transact(&mut device), Dispatched::SETUP);
            assert!(ep0_stalled(&device));
            assert_eq!(device.hardware_mut().host_in(0).unwrap_err(), Handshake::Stall);
        }
    }

    #[test]
    fn stall_holds_until_next_setup() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x80, 6, 0x0200, 0, 64));
        transact(&mut device);
        assert!(ep0_stalled(&device));

        // The host retries the data stage, and the status stage.
        assert_eq!(device.hardware_mut().host_in(0).unwrap_err(), Handshake::Stall);
        assert_eq!(device.hardware_mut().host_out(0, &[]), Handshake::Stall);
        assert!(ep0_stalled(&device));

        let data = control_in(&mut device, setup(0x80, 6, 0x0100, 0, 18));
        assert_eq!(data, DEVICE);
        assert!(!ep0_stalled(&device));
    }

    #[test]
    fn set_address_after_status() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x00, 5, 42, 0, 0));
        assert_eq!(transact(&mut device), Dispatched::SETUP);
        // Still the default address until the status stage finishes.
        assert_eq!(device.hardware().address(), 0);
        assert_eq!(device.stage(), Stage::StatusIn);

        assert!(device.hardware_mut().host_in(0).unwrap().as_slice().is_empty());
        assert_eq!(transact(&mut device), Dispatched::CONTROL_IN);
        assert_eq!(device.hardware().address(), 42);
        assert_eq!(device.state(), UsbDeviceState::Addressed);
    }

    #[test]
    fn configuration() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        assert_eq!(control_no_data(&mut device, setup(0x00, 9, 1, 0, 0)), Handshake::Ack);
        assert_eq!(device.configuration(), 1);
        assert_eq!(device.state(), UsbDeviceState::Configured);

        assert_eq!(control_no_data(&mut device, setup(0x00, 9, 2, 0, 0)), Handshake::Stall);
        assert_eq!(device.configuration(), 1);

        // Out of the u8 range; never reaches the handler.
        assert_eq!(control_no_data(&mut device, setup(0x00, 9, 0x101, 0, 0)), Handshake::Stall);
        assert_eq!(device.handler().configurations, 2);

        assert_eq!(control_in(&mut device, setup(0x80, 8, 0, 0, 1)), [1u8]);
        assert_eq!(control_in(&mut device, setup(0x81, 10, 0, 0, 1)), [0u8]);

        assert_eq!(control_no_data(&mut device, setup(0x00, 9, 0, 0, 0)), Handshake::Ack);
        assert_eq!(device.state(), UsbDeviceState::Addressed);
    }

    #[test]
    fn interface_rejected_by_default() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        assert_eq!(control_no_data(&mut device, setup(0x01, 11, 1, 0, 0)), Handshake::Stall);
    }

    #[test]
    fn get_interface_needs_configuration() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x81, 10, 0, 0, 1));
        transact(&mut device);
        assert!(ep0_stalled(&device));
    }

    #[test]
    fn get_status() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        assert_eq!(control_in(&mut device, setup(0x80, 0, 0, 0, 2)), [0u8, 0]);
    }

    #[test]
    fn features_acknowledged() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        assert_eq!(control_no_data(&mut device, setup(0x00, 3, 1, 0, 0)), Handshake::Ack);
        assert_eq!(control_no_data(&mut device, setup(0x02, 1, 0, 0x81, 0)), Handshake::Ack);
    }

    #[test]
    fn wrong_direction_stalls() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        // GET_DESCRIPTOR as host-to-device
        device.hardware_mut().host_setup(setup(0x00, 6, 0x0100, 0, 18));
        transact(&mut device);
        assert!(ep0_stalled(&device));
    }

    #[test]
    fn class_in_request() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let data = control_in(&mut device, setup(0xA1, 0x01, 0, 0, 2));
        assert_eq!(data, [7u8, 8]);
        assert_eq!(device.handler().in_completions, 1);
    }

    #[test]
    fn class_out_request() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x21, 0x02, 0, 0, 8));
        assert_eq!(transact(&mut device), Dispatched::SETUP);
        assert_eq!(device.stage(), Stage::DataOut);

        assert_eq!(device.hardware_mut().host_out(0, &[1, 2, 3, 4, 5, 6, 7, 8]), Handshake::Ack);
        assert_eq!(transact(&mut device), Dispatched::CONTROL_OUT);
        assert_eq!(device.handler().received, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(device.stage(), Stage::StatusIn);

        assert!(device.hardware_mut().host_in(0).unwrap().as_slice().is_empty());
        assert_eq!(transact(&mut device), Dispatched::CONTROL_IN);
        assert_eq!(device.stage(), Stage::Idle);
    }

    #[test]
    fn class_out_rejected() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x21, 0x02, 0, 0, 4));
        transact(&mut device);
        device.hardware_mut().host_out(0, &[1, 2, 3, 4]);
        transact(&mut device);
        assert!(ep0_stalled(&device));
    }

    #[test]
    fn unknown_class_request_stalls() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x21, 0x7F, 0, 0, 0));
        transact(&mut device);
        assert!(ep0_stalled(&device));
    }

    #[test]
    fn detach() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().set_auto_complete_in(true);
        device.hardware_mut().host_setup(setup(0x21, 0x03, 1000, 1, 0));
        assert_eq!(transact(&mut device), Dispatched::SETUP);
        assert!(device.is_detached());
        assert!(!device.hardware().is_attached());
        let status = device.hardware_mut().take_auto_completed().unwrap();
        assert!(status.as_slice().is_empty());
    }

    #[test]
    fn setup_and_in_completion_together() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x80, 6, 0x0100, 0, 64));
        transact(&mut device);
        assert_eq!(device.stage(), Stage::DataIn);

        // The data stage completes, and the host moves on to the next SETUP
        // before the firmware services the completion.
        device.hardware_mut().host_in(0).unwrap();
        device.hardware_mut().host_setup(setup(0x80, 0, 0, 0, 2));
        assert_eq!(transact(&mut device), Dispatched::SETUP | Dispatched::CONTROL_IN);
        assert_eq!(device.setup().request, 0);
        assert_eq!(device.stage(), Stage::DataIn);
        assert_eq!(device.hardware_mut().host_in(0).unwrap().as_slice(), &[0, 0]);
    }

    #[test]
    fn stale_completion_with_setup() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let out = EndpointAddress::from(0x00);
        let r#in = EndpointAddress::from(0x80);
        device.hardware_mut().host_setup(setup(0x00, 9, 1, 0, 0));
        device.hardware_mut().inject_status(out, Status::TRNCOMPL0);
        device.hardware_mut().inject_status(r#in, Status::TRNCOMPL0);
        let dispatched = transact(&mut device);
        assert!(dispatched.contains(Dispatched::SETUP | Dispatched::CONTROL_IN));
        assert!(!dispatched.contains(Dispatched::CONTROL_OUT));
        assert_eq!(device.configuration(), 1);
    }

    #[test]
    fn stray_out_completion_ignored() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device
            .hardware_mut()
            .inject_status(EndpointAddress::from(0x00), Status::TRNCOMPL0);
        assert_eq!(transact(&mut device), Dispatched::CONTROL_OUT);
        assert_eq!(device.stage(), Stage::Idle);
        assert!(!ep0_stalled(&device));

        let data = control_in(&mut device, setup(0x80, 6, 0x0100, 0, 18));
        assert_eq!(data, DEVICE);
    }

    #[test]
    fn setup_during_dispatch() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let first = setup(0x80, 6, 0x0100, 0, 64);
        let second = setup(0x80, 8, 0, 0, 1);

        device.hardware_mut().setup_on_next_arm(second);
        device.hardware_mut().host_setup(first);
        assert_eq!(transact(&mut device), Dispatched::SETUP);
        // The first request's record and reply survive.
        assert_eq!(device.setup().to_bytes(), first);
        assert_eq!(device.hardware_mut().host_in(0).unwrap().as_slice(), &DEVICE);

        // The second SETUP waits for the next call.
        let dispatched = transact(&mut device);
        assert!(dispatched.contains(Dispatched::SETUP));
        assert_eq!(device.setup().to_bytes(), second);
        assert_eq!(device.hardware_mut().host_in(0).unwrap().as_slice(), &[0]);
    }

    #[test]
    fn setup_before_out_reopens() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        let first = setup(0x80, 6, 0x0100, 0, 64);
        let second = setup(0x00, 9, 1, 0, 0);

        device.hardware_mut().setup_on_next_reopen(second);
        device.hardware_mut().host_setup(first);
        assert_eq!(transact(&mut device), Dispatched::SETUP);
        assert_eq!(device.setup().to_bytes(), first);
        let status = device.hardware().endpoints()[0].OUT.status();
        assert!(status.contains(Status::SETUP));
        assert!(!status.contains(Status::BUSNACK0));

        assert_eq!(transact(&mut device), Dispatched::SETUP);
        assert_eq!(device.setup().to_bytes(), second);
        assert_eq!(device.configuration(), 1);
        assert!(device.hardware_mut().host_in(0).unwrap().as_slice().is_empty());
        assert_eq!(transact(&mut device), Dispatched::CONTROL_IN);
        assert_eq!(device.state(), UsbDeviceState::Configured);
    }

    #[test]
    fn bus_event_priority() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device
            .hardware_mut()
            .raise_bus_flags(BusFlags::SOF | BusFlags::CRC | BusFlags::STALL | BusFlags::SUSPEND);

        let mut events = Vec::new();
        while let Serviced::Bus(Some(event)) = device.service(Interrupt::BusEvent) {
            events.push(event);
        }
        assert_eq!(
            events,
            [
                BusEvent::StartOfFrame,
                BusEvent::Error(BusFlags::CRC),
                BusEvent::Stall,
                BusEvent::Suspend,
            ]
        );
        assert_eq!(device.state(), UsbDeviceState::Suspend);

        device.hardware_mut().raise_bus_flags(BusFlags::RESUME);
        assert_eq!(device.on_bus_event(), Some(BusEvent::Resume));
        assert_eq!(device.state(), UsbDeviceState::Default);
    }

    #[test]
    fn bus_reset_reinitializes() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        control_no_data(&mut device, setup(0x00, 5, 9, 0, 0));
        control_no_data(&mut device, setup(0x00, 9, 1, 0, 0));
        assert_eq!(device.hardware().address(), 9);
        assert_eq!(device.state(), UsbDeviceState::Configured);

        // Leave a transfer half done.
        device.hardware_mut().host_setup(setup(0x80, 6, 0x0100, 0, 64));
        transact(&mut device);

        device.hardware_mut().host_reset();
        assert_eq!(device.on_bus_event(), Some(BusEvent::Reset));
        assert_eq!(device.hardware().address(), 0);
        assert_eq!(device.state(), UsbDeviceState::Default);
        assert_eq!(device.configuration(), 0);
        assert_eq!(device.stage(), Stage::Idle);
        assert_eq!(device.handler().resets, 2);
        assert!(!device.hardware().bus_reset());
        assert_eq!(device.hardware_mut().host_in(0).unwrap_err(), Handshake::Nak);

        let data = control_in(&mut device, setup(0x80, 6, 0x0100, 0, 64));
        assert_eq!(data, DEVICE);
    }

    #[test]
    fn fifo_and_flags_reset_every_call() {
        let memory = Ep0Memory::new();
        let mut device = device(&memory);
        device.hardware_mut().host_setup(setup(0x80, 0, 0, 0, 2));
        assert!(!device.hardware().transaction_flags().is_empty());
        transact(&mut device);
        assert!(device.hardware().transaction_flags().is_empty());
        assert_eq!(device.hardware().fifo_resets(), 1);
    }
}
