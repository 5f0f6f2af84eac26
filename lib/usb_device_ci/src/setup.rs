//! The control endpoint's setup stage: reading setup packets out of the control queue head and
//! answering the standard (and the few class-specific) requests a device has to support.

use crate::{
    controller::Controller,
    device::Device,
    endpoint::Direction,
    error::{Error, Result},
    queue::check_endpoint,
    reg::{device_address, endpoint_bit, Register, RegisterAccess},
    wait::{spin_until, wait_for, WaitLimit},
};
use log::{debug, trace, warn};
use usb::{
    cdc::SET_ETHERNET_PACKET_FILTER,
    descriptor::{DescriptorType, FeatureSelector},
    hid::HidRequest,
    setup::{Request, SetupPacket},
};

/// Swap the two bytes of the packet's `wValue`.
///
/// The rest of the dispatcher reads `wValue` in this swapped form: the descriptor type of
/// `GET_DESCRIPTOR` is the low byte and the descriptor index the high byte, and the value of
/// `SET_CONFIGURATION`/`SET_INTERFACE` is the high byte. `wIndex` and `wLength` are left as the
/// controller wrote them.
pub fn swap_value(setup: SetupPacket) -> SetupPacket {
    SetupPacket { value: setup.value.swap_bytes(), ..setup }
}

/// The first `length` bytes of `data`, or all of it if it is shorter.
pub fn trim(data: &[u8], length: u16) -> &[u8] {
    &data[..data.len().min(length as usize)]
}

impl<R> Controller<R>
where
    R: RegisterAccess,
{
    /// Wait up to the setup poll interval for a setup packet to arrive on the control endpoint.
    pub fn wait_for_setup(&self) -> bool {
        let bit = endpoint_bit(0, Direction::Out);
        wait_for(WaitLimit::Deadline(self.config.setup_poll_interval), || {
            self.registers.read(Register::EndpointSetupStatus) & bit != 0
        })
        .is_ok()
    }

    /// Acknowledge the pending setup packet, abandon anything still queued on the control
    /// endpoint, and return the packet.
    pub fn get_setup(&self) -> SetupPacket {
        let registers = &self.registers;
        registers.write(Register::EndpointSetupStatus, endpoint_bit(0, Direction::Out));

        let flush = endpoint_bit(0, Direction::In) | endpoint_bit(0, Direction::Out);
        registers.write(Register::EndpointFlush, flush);
        spin_until(|| registers.read(Register::EndpointFlush) & flush == 0);

        let mut bytes = [0u8; SetupPacket::SIZE];
        self.dma.read_bytes(self.queue_heads.setup_buffer_address(), &mut bytes);
        let setup = swap_value(SetupPacket::from_bytes(bytes));
        trace!("Setup packet: {:?}", setup);
        setup
    }

    /// Answer a setup packet. If the device has a setup handler it gets the first look at the
    /// packet, and can answer it itself.
    pub fn handle_setup(&self, device: &mut Device, setup: &SetupPacket) -> Result<()> {
        if let Some(handler) = device.setup.as_mut() {
            let response = match handler.handle(setup) {
                Ok(response) => response,
                Err(err) => {
                    self.stall(0, Direction::In);
                    return Err(err);
                }
            };

            if !response.data.is_empty() {
                self.send(0, false, trim(&response.data, setup.length))?;
            } else if response.ack {
                self.ack(0)?;
            }

            if response.done {
                return Ok(());
            }
        }

        if setup.is_class_request() {
            self.handle_class_setup(setup)
        } else {
            self.handle_standard_setup(device, setup)
        }
    }

    fn handle_standard_setup(&self, device: &mut Device, setup: &SetupPacket) -> Result<()> {
        match setup.standard_request() {
            Some(Request::GetStatus) => self.send(0, false, &[0x00, 0x00]).map(|_| ()),
            Some(Request::ClearFeature) => match FeatureSelector::try_from(setup.value) {
                Ok(FeatureSelector::EndpointHalt) => {
                    let endpoint = (setup.index & 0xf) as u8;
                    let direction = if setup.index & 0x80 != 0 { Direction::In } else { Direction::Out };
                    self.clear_halt(endpoint, direction)?;
                    self.ack(0)
                }
                _ => self.unsupported(setup),
            },
            Some(Request::SetAddress) => {
                let address = (setup.value.swap_bytes() & 0x7f) as u8;
                debug!("Host assigned address {}", address);
                self.set_address(address);
                self.ack(0)
            }
            Some(Request::GetDescriptor) => self.get_descriptor(device, setup),
            Some(Request::GetConfiguration) => self.send(0, false, &[device.configuration_value]).map(|_| ()),
            Some(Request::SetConfiguration) => {
                device.configuration_value = (setup.value >> 8) as u8;
                debug!("Host selected configuration {}", device.configuration_value);
                self.ack(0)
            }
            Some(Request::GetInterface) => self.send(0, false, &[device.alternate_setting]).map(|_| ()),
            Some(Request::SetInterface) => {
                device.alternate_setting = (setup.value >> 8) as u8;
                self.ack(0)
            }
            _ if setup.request == SET_ETHERNET_PACKET_FILTER => self.ack(0),
            _ => self.unsupported(setup),
        }
    }

    fn handle_class_setup(&self, setup: &SetupPacket) -> Result<()> {
        match HidRequest::try_from(setup.request) {
            Ok(HidRequest::SetIdle) => self.ack(0),
            _ => self.unsupported(setup),
        }
    }

    fn get_descriptor(&self, device: &Device, setup: &SetupPacket) -> Result<()> {
        let descriptor_type = setup.value as u8;
        let index = (setup.value >> 8) as u8;

        let data = match DescriptorType::try_from(descriptor_type) {
            Ok(DescriptorType::Device) => &device.descriptor,
            Ok(DescriptorType::Configuration) => match device.configurations.get(index as usize) {
                Some(configuration) => &configuration.descriptor,
                None => return self.invalid_index(descriptor_type, index),
            },
            Ok(DescriptorType::String) => match device.strings.get(index as usize) {
                Some(string) => string,
                None => return self.invalid_index(descriptor_type, index),
            },
            Ok(DescriptorType::DeviceQualifier) => &device.qualifier,
            Ok(DescriptorType::HidReport) => match &device.hid_report {
                Some(report) => report,
                None => return self.unsupported(setup),
            },
            _ => return self.unsupported(setup),
        };

        trace!("GET_DESCRIPTOR({:#04x}, {}): {} of {} bytes", descriptor_type, index, setup.length, data.len());
        self.send(0, false, trim(data, setup.length)).map(|_| ())
    }

    /// `CLEAR_FEATURE(ENDPOINT_HALT)`: reset the endpoint's data toggle and queue head status,
    /// and lift any stall.
    fn clear_halt(&self, endpoint: u8, direction: Direction) -> Result<()> {
        if let Err(err) = check_endpoint(endpoint) {
            self.stall(0, Direction::In);
            return Err(err);
        }

        self.reset_toggle(endpoint, direction);
        {
            let _guard = self.structure.lock();
            self.queue_heads.clear_status(&self.dma, endpoint, direction);
        }
        self.unstall(endpoint, direction);
        Ok(())
    }

    fn unsupported(&self, setup: &SetupPacket) -> Result<()> {
        warn!("Unsupported setup request: {:?}", setup);
        self.stall(0, Direction::In);
        Err(Error::UnsupportedRequest { request_type: setup.typ.bits(), request: setup.request, value: setup.value })
    }

    fn invalid_index(&self, descriptor_type: u8, index: u8) -> Result<()> {
        self.stall(0, Direction::In);
        Err(Error::InvalidDescriptorIndex { descriptor_type, index })
    }

    /// Set the device's address. It takes effect once the status stage of the current control
    /// transfer has completed.
    pub fn set_address(&self, address: u8) {
        self.registers.write(Register::DeviceAddress, device_address(address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::Config,
        device::SetupResponse,
        dma::DmaPool,
        queue::TdToken,
        reg::EndpointControl,
        sim::Simulation,
    };
    use std::sync::Arc;
    use usb::setup::RequestType;

    fn controller() -> (Arc<Simulation>, Controller<Arc<Simulation>>) {
        let dma = Arc::new(DmaPool::host(1 << 20, 0x8000_0000));
        let sim = Arc::new(Simulation::new(dma.clone()));
        let controller = Controller::new(sim.clone(), dma, Config::default()).unwrap();
        controller.enter_device_mode();
        (sim, controller)
    }

    fn packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        SetupPacket { typ: RequestType::from_bits(request_type), request, value, index, length }
    }

    /// Deliver `setup` through the simulated controller and dispatch it.
    fn dispatch(sim: &Simulation, controller: &Controller<Arc<Simulation>>, device: &mut Device, setup: SetupPacket) -> Result<()> {
        sim.setup(setup);
        assert!(controller.wait_for_setup());
        let setup = controller.get_setup();
        controller.handle_setup(device, &setup)
    }

    fn ep0_stalled(sim: &Simulation) -> bool {
        EndpointControl::from_bits_retain(sim.register(Register::EndpointControl(0))).contains(EndpointControl::TX_STALL)
    }

    fn device() -> Device {
        let mut device = Device::new((0..18).collect());
        device.qualifier = vec![10, 6, 0, 2, 0, 0, 0, 64, 1, 0];
        device.add_string("Test");
        device.add_string("Device");
        device.add_configuration(1, (0..32).collect(), Vec::new());
        device
    }

    #[test]
    fn only_value_is_swapped() {
        let setup = swap_value(packet(0x80, 6, 0x0302, 0x0409, 0xff));
        assert_eq!(setup.value, 0x0203);
        assert_eq!(setup.index, 0x0409);
        assert_eq!(setup.length, 0xff);
    }

    #[test]
    fn get_setup_clears_status_and_flushes() {
        let (sim, controller) = controller();
        sim.setup(packet(0x80, 6, 0x0100, 0, 18));

        assert!(controller.wait_for_setup());
        let setup = controller.get_setup();
        assert_eq!(setup.value, 0x0001);
        assert_eq!(setup.length, 18);
        assert_eq!(sim.register(Register::EndpointSetupStatus), 0);
        assert_eq!(sim.flush_count(0, Direction::In), 1);
        assert_eq!(sim.flush_count(0, Direction::Out), 1);
        assert!(!controller.wait_for_setup());
    }

    #[test]
    fn device_descriptor_then_status_stage() {
        let (sim, controller) = controller();
        let mut device = device();

        dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0100, 0, 18)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In), vec![(0..18).collect::<Vec<u8>>()]);
        assert_eq!(sim.transfers(0, Direction::Out), vec![vec![]]);
    }

    #[test]
    fn descriptors_are_trimmed() {
        let (sim, controller) = controller();
        let mut device = device();

        for (length, expected) in [(0u16, 0usize), (1, 1), (9, 9), (32, 32), (33, 32), (0xffff, 32)] {
            dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0200, 0, length)).unwrap();
            assert_eq!(sim.transfers(0, Direction::In).last().map(Vec::len), Some(expected));
        }

        dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0600, 0, 4)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![10, 6, 0, 2]));
    }

    #[test]
    fn strings_by_index() {
        let (sim, controller) = controller();
        let mut device = device();

        dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0302, 0x0409, 0xff)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&device.strings[2]));
        assert!(!ep0_stalled(&sim));

        assert_eq!(
            dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0305, 0x0409, 0xff)),
            Err(Error::InvalidDescriptorIndex { descriptor_type: 3, index: 5 })
        );
        assert!(ep0_stalled(&sim));
    }

    #[test]
    fn configuration_index_out_of_range() {
        let (sim, controller) = controller();
        let mut device = device();

        assert_eq!(
            dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0201, 0, 9)),
            Err(Error::InvalidDescriptorIndex { descriptor_type: 2, index: 1 })
        );
        assert!(ep0_stalled(&sim));
    }

    #[test]
    fn hid_report_descriptor() {
        let (sim, controller) = controller();
        let mut device = device();

        assert!(matches!(
            dispatch(&sim, &controller, &mut device, packet(0x81, 6, 0x2200, 0, 64)),
            Err(Error::UnsupportedRequest { request: 6, .. })
        ));

        device.hid_report = Some(vec![0x05, 0x01, 0x09, 0x06, 0xa1, 0x01, 0xc0]);
        dispatch(&sim, &controller, &mut device, packet(0x81, 6, 0x2200, 0, 64)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), device.hid_report.as_ref());
    }

    #[test]
    fn unknown_descriptor_type_stalls() {
        let (sim, controller) = controller();
        let mut device = device();

        assert_eq!(
            dispatch(&sim, &controller, &mut device, packet(0x80, 6, 0x0a00, 0, 8)),
            Err(Error::UnsupportedRequest { request_type: 0x80, request: 6, value: 0x000a })
        );
        assert!(ep0_stalled(&sim));
    }

    #[test]
    fn status_configuration_and_interface() {
        let (sim, controller) = controller();
        let mut device = device();

        dispatch(&sim, &controller, &mut device, packet(0x80, 0, 0, 0, 2)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![0, 0]));

        dispatch(&sim, &controller, &mut device, packet(0x00, 9, 1, 0, 0)).unwrap();
        assert_eq!(device.configuration_value, 1);
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![]));

        dispatch(&sim, &controller, &mut device, packet(0x80, 8, 0, 0, 1)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![1]));

        dispatch(&sim, &controller, &mut device, packet(0x01, 11, 2, 0, 0)).unwrap();
        assert_eq!(device.alternate_setting, 2);
        dispatch(&sim, &controller, &mut device, packet(0x81, 10, 0, 0, 1)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![2]));
    }

    #[test]
    fn set_address() {
        let (sim, controller) = controller();
        let mut device = device();

        dispatch(&sim, &controller, &mut device, packet(0x00, 5, 0x0012, 0, 0)).unwrap();
        assert_eq!(sim.register(Register::DeviceAddress), device_address(0x12));
    }

    #[test]
    fn clear_endpoint_halt() {
        let (sim, controller) = controller();
        let mut device = device();

        controller.enable(3, Direction::Out, crate::endpoint::TransferType::Bulk);
        controller.stall(3, Direction::Out);
        sim.write_register(
            Register::EndpointControl(3),
            sim.register(Register::EndpointControl(3)) & !EndpointControl::RX_TOGGLE_RESET.bits(),
        );
        let halted = TdToken::new().with(TdToken::ACTIVE, true).with(TdToken::HALTED, true).with(TdToken::TOTAL_BYTES, 7);
        controller.dma.write_u32(controller.queue_heads.address_of(3, Direction::Out) + 12, halted.bits());

        dispatch(&sim, &controller, &mut device, packet(0x02, 1, 0, 0x03, 0)).unwrap();
        let control = EndpointControl::from_bits_retain(sim.register(Register::EndpointControl(3)));
        assert!(control.contains(EndpointControl::RX_TOGGLE_RESET));
        assert!(!control.contains(EndpointControl::RX_STALL));
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![]));

        let token = controller.queue_heads.token(&controller.dma, 3, Direction::Out);
        assert!(!token.get(TdToken::ACTIVE));
        assert!(!token.get(TdToken::HALTED));
        assert_eq!(token.remaining(), 7);

        assert_eq!(
            dispatch(&sim, &controller, &mut device, packet(0x02, 1, 0, 0x89, 0)),
            Err(Error::InvalidEndpoint(9))
        );
    }

    #[test]
    fn class_and_vendor_requests() {
        let (sim, controller) = controller();
        let mut device = device();

        dispatch(&sim, &controller, &mut device, packet(0x21, 0x0a, 0, 0, 0)).unwrap();
        dispatch(&sim, &controller, &mut device, packet(0x21, SET_ETHERNET_PACKET_FILTER, 0x0e00, 0, 0)).unwrap_err();
        assert!(ep0_stalled(&sim));

        sim.write_register(Register::EndpointControl(0), 0);
        dispatch(&sim, &controller, &mut device, packet(0x41, SET_ETHERNET_PACKET_FILTER, 0x0e00, 0, 0)).unwrap();
        assert!(!ep0_stalled(&sim));
        assert_eq!(
            dispatch(&sim, &controller, &mut device, packet(0x00, 3, 1, 0, 0)),
            Err(Error::UnsupportedRequest { request_type: 0, request: 3, value: 0x0100 })
        );
    }

    #[test]
    fn setup_handler_comes_first() {
        let (sim, controller) = controller();
        let mut device = device();

        device.set_setup_handler(|setup: &SetupPacket| match setup.request {
            0x20 => Ok(SetupResponse { data: vec![0x42; 8], ack: false, done: true }),
            0x21 => Ok(SetupResponse { data: Vec::new(), ack: true, done: true }),
            0x22 => Err(Error::Handler("refused".to_string())),
            _ => Ok(SetupResponse::default()),
        });

        dispatch(&sim, &controller, &mut device, packet(0xc0, 0x20, 0, 0, 4)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![0x42; 4]));

        dispatch(&sim, &controller, &mut device, packet(0x40, 0x21, 0, 0, 0)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![]));

        assert_eq!(
            dispatch(&sim, &controller, &mut device, packet(0x40, 0x22, 0, 0, 0)),
            Err(Error::Handler("refused".to_string()))
        );
        assert!(ep0_stalled(&sim));

        // Not done: falls through to standard handling
        dispatch(&sim, &controller, &mut device, packet(0x80, 8, 0, 0, 1)).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).last(), Some(&vec![0]));
    }
}
