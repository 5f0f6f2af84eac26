use crate::{
    controller::Controller,
    device::{Device, EndpointFunction},
    error::{Error, Result},
    queue::{check_endpoint, MAX_TRANSFER_DESCRIPTOR_LENGTH},
    reg::{EndpointControl, Register, RegisterAccess},
    task::{CancellationToken, TaskGroup},
};
use log::{debug, warn};
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Direction {
    /// Host to device. Called "RX" by the controller.
    Out = 0,
    /// Device to host. Called "TX" by the controller.
    In = 1,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TransferType {
    Control = 0b00,
    Isochronous = 0b01,
    Bulk = 0b10,
    Interrupt = 0b11,
}

/// The logical identity of an endpoint. Its physical state lives in the queue head table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Endpoint {
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub zero_length_termination: bool,
}

impl Endpoint {
    pub fn new(number: u8, direction: Direction, transfer_type: TransferType, max_packet_size: u16) -> Result<Endpoint> {
        check_endpoint(number)?;
        if transfer_type == TransferType::Isochronous {
            return Err(Error::UnsupportedTransferType);
        }

        Ok(Endpoint { number, direction, transfer_type, max_packet_size, zero_length_termination: false })
    }

    pub fn with_zero_length_termination(self, zero_length_termination: bool) -> Endpoint {
        Endpoint { zero_length_termination, ..self }
    }

    /// The `bEndpointAddress` of this endpoint, as it appears in its endpoint descriptor.
    pub fn address(&self) -> u8 {
        self.number | ((self.direction as u8) << 7)
    }
}

impl<R> Controller<R>
where
    R: RegisterAccess,
{
    /// Enable a non-control endpoint for transfers of the given type. The control endpoint is
    /// always enabled.
    pub fn enable(&self, endpoint: u8, direction: Direction, transfer_type: TransferType) {
        let _guard = self.structure.lock();
        self.enable_locked(endpoint, direction, transfer_type);
    }

    pub(crate) fn enable_locked(&self, endpoint: u8, direction: Direction, transfer_type: TransferType) {
        if endpoint == 0 {
            return;
        }

        let register = Register::EndpointControl(endpoint);
        let mut control = EndpointControl::from_bits_retain(self.registers.read(register))
            .union(EndpointControl::enable(direction))
            .union(EndpointControl::toggle_reset(direction))
            .with_transfer_type(direction, transfer_type as u32)
            .difference(EndpointControl::stall(direction));

        /*
         * If one direction of an endpoint is enabled and the other is left with the reset
         * transfer type of control, the controller misbehaves. Park the unused direction on bulk.
         */
        if !control.contains(EndpointControl::enable(direction.opposite())) {
            control = control.with_transfer_type(direction.opposite(), TransferType::Bulk as u32);
        }

        self.registers.write(register, control.bits());
    }

    /// Reset the data toggle of an endpoint. The control endpoint has no toggle to reset.
    pub fn reset_toggle(&self, endpoint: u8, direction: Direction) {
        if endpoint == 0 {
            return;
        }

        let _guard = self.structure.lock();
        self.set_control_bits(endpoint, EndpointControl::toggle_reset(direction), true);
    }

    pub fn stall(&self, endpoint: u8, direction: Direction) {
        let _guard = self.structure.lock();
        warn!("Stalling EP{} {:?}", endpoint, direction);
        self.set_control_bits(endpoint, EndpointControl::stall(direction), true);
    }

    pub fn unstall(&self, endpoint: u8, direction: Direction) {
        let _guard = self.structure.lock();
        self.set_control_bits(endpoint, EndpointControl::stall(direction), false);
    }

    fn set_control_bits(&self, endpoint: u8, bits: EndpointControl, value: bool) {
        self.registers.modify(Register::EndpointControl(endpoint), |control| {
            let mut control = EndpointControl::from_bits_retain(control);
            control.set(bits, value);
            control.bits()
        });
    }

    /// Program an endpoint's queue head and enable it, as one structural change.
    fn bring_up(&self, endpoint: &Endpoint) {
        let _guard = self.structure.lock();
        self.queue_heads.configure(
            &self.dma,
            endpoint.number,
            endpoint.direction,
            endpoint.max_packet_size,
            endpoint.zero_length_termination,
            0,
        );
        self.enable_locked(endpoint.number, endpoint.direction, endpoint.transfer_type);
        self.reclaim_abandoned();
    }

    /// Serve one endpoint until `token` is cancelled. IN endpoints ask the function for data and
    /// transmit it; OUT endpoints receive data and hand it to the function. Any other error
    /// stalls the endpoint and is passed to the function on its next call.
    fn serve(&self, endpoint: Endpoint, function: &dyn EndpointFunction, token: &CancellationToken) -> Result<()> {
        let mut last_error = None;

        loop {
            let result = match endpoint.direction {
                Direction::In => function
                    .call(None, last_error.as_ref())
                    .and_then(|data| self.send_with(endpoint.number, false, &data, token).map(|_| ())),
                Direction::Out => {
                    let mut buffer = vec![0u8; MAX_TRANSFER_DESCRIPTOR_LENGTH];
                    self.receive_with(endpoint.number, false, &mut buffer, token).and_then(|received| {
                        buffer.truncate(received);
                        function.call(Some(&buffer), last_error.as_ref()).map(|_| ())
                    })
                }
            };

            match result {
                Ok(()) => last_error = None,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!("EP{} {:?} function error: {}", endpoint.number, endpoint.direction, err);
                    self.stall(endpoint.number, endpoint.direction);
                    last_error = Some(err);
                }
            }

            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
    }
}

impl<R> Controller<R>
where
    R: RegisterAccess + 'static,
{
    /// Start one task per endpoint of configuration `value`. Configuration `0` (unconfigured),
    /// or a value the device doesn't declare, starts nothing.
    pub(crate) fn start_endpoints(self: &Arc<Self>, device: &Device, value: u8) -> Result<TaskGroup> {
        let mut group = TaskGroup::new();
        let Some(configuration) = device.configuration(value) else {
            return Ok(group);
        };

        for (endpoint, function) in &configuration.endpoints {
            debug!("Starting EP{} {:?} for configuration {}", endpoint.number, endpoint.direction, value);
            self.bring_up(endpoint);

            let controller = self.clone();
            let endpoint = *endpoint;
            let function = function.clone();
            let spawned = group.spawn(format!("usb-ep{}-{:?}", endpoint.number, endpoint.direction), move |token| {
                controller.serve(endpoint, function.as_ref(), &token)
            });

            if let Err(err) = spawned {
                group.cancel_and_join();
                return Err(err);
            }
        }

        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{controller::Config, dma::DmaPool, reg::endpoint_bit, sim::Simulation};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
    };

    fn controller() -> (Arc<Simulation>, Arc<Controller<Arc<Simulation>>>) {
        let dma = Arc::new(DmaPool::host(1 << 20, 0x8000_0000));
        let sim = Arc::new(Simulation::new(dma.clone()));
        let controller = Arc::new(Controller::new(sim.clone(), dma, Config::default()).unwrap());
        controller.enter_device_mode();
        (sim, controller)
    }

    #[test]
    fn endpoint_validation() {
        assert_eq!(Endpoint::new(8, Direction::In, TransferType::Bulk, 512), Err(Error::InvalidEndpoint(8)));
        assert_eq!(Endpoint::new(1, Direction::In, TransferType::Isochronous, 512), Err(Error::UnsupportedTransferType));

        let endpoint = Endpoint::new(1, Direction::In, TransferType::Interrupt, 8).unwrap();
        assert!(!endpoint.zero_length_termination);
        assert_eq!(endpoint.address(), 0x81);
        assert!(endpoint.with_zero_length_termination(true).zero_length_termination);
    }

    #[test]
    fn enable_parks_unused_direction_on_bulk() {
        let (sim, controller) = controller();

        controller.enable(2, Direction::In, TransferType::Interrupt);
        let control = EndpointControl::from_bits_retain(sim.register(Register::EndpointControl(2)));
        assert!(control.contains(EndpointControl::TX_ENABLE | EndpointControl::TX_TOGGLE_RESET));
        assert_eq!(control.transfer_type(Direction::In), TransferType::Interrupt as u32);
        assert_eq!(control.transfer_type(Direction::Out), TransferType::Bulk as u32);

        // With IN already enabled, enabling OUT leaves the IN type alone
        controller.enable(2, Direction::Out, TransferType::Interrupt);
        let control = EndpointControl::from_bits_retain(sim.register(Register::EndpointControl(2)));
        assert_eq!(control.transfer_type(Direction::In), TransferType::Interrupt as u32);
        assert_eq!(control.transfer_type(Direction::Out), TransferType::Interrupt as u32);

        // The control endpoint is never touched
        controller.enable(0, Direction::In, TransferType::Bulk);
        assert_eq!(sim.register(Register::EndpointControl(0)), 0);
    }

    #[test]
    fn stall_and_unstall() {
        let (sim, controller) = controller();

        controller.enable(1, Direction::Out, TransferType::Bulk);
        controller.stall(1, Direction::Out);
        assert_ne!(sim.register(Register::EndpointControl(1)) & EndpointControl::RX_STALL.bits(), 0);

        controller.unstall(1, Direction::Out);
        let control = EndpointControl::from_bits_retain(sim.register(Register::EndpointControl(1)));
        assert!(!control.contains(EndpointControl::RX_STALL));
        assert!(control.contains(EndpointControl::RX_ENABLE));
    }

    #[test]
    fn out_endpoint_feeds_function() {
        let (sim, controller) = controller();
        let received = Arc::new(Mutex::new(Vec::new()));

        let function: Arc<dyn EndpointFunction> = {
            let received = received.clone();
            Arc::new(move |data: Option<&[u8]>, _: Option<&Error>| {
                received.lock().unwrap().push(data.unwrap_or(&[]).to_vec());
                Ok(Vec::new())
            })
        };
        let endpoint = Endpoint::new(1, Direction::Out, TransferType::Bulk, 512).unwrap();
        let mut device = Device::new(vec![0; 18]);
        device.add_configuration(1, vec![0; 9], vec![(endpoint, function)]);

        sim.host_out(1, b"hello".to_vec());
        sim.host_out(1, b"world".to_vec());
        let group = controller.start_endpoints(&device, 1).unwrap();
        assert_eq!(group.len(), 1);

        while received.lock().unwrap().len() < 2 {
            thread::yield_now();
        }
        assert_eq!(group.cancel_and_join(), vec![Err(Error::Cancelled)]);
        assert_eq!(*received.lock().unwrap(), vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn in_endpoint_reports_errors_to_function() {
        let (sim, controller) = controller();
        let calls = Arc::new(AtomicUsize::new(0));
        let saw_error = Arc::new(AtomicUsize::new(0));

        let function: Arc<dyn EndpointFunction> = {
            let calls = calls.clone();
            let saw_error = saw_error.clone();
            Arc::new(move |_: Option<&[u8]>, last_error: Option<&Error>| {
                if last_error.is_some() {
                    saw_error.fetch_add(1, Ordering::SeqCst);
                }
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Error::Handler("not ready".to_string())),
                    _ => Ok(vec![0xaa; 4]),
                }
            })
        };
        let endpoint = Endpoint::new(2, Direction::In, TransferType::Interrupt, 64).unwrap();
        let mut device = Device::new(vec![0; 18]);
        device.add_configuration(1, vec![0; 9], vec![(endpoint, function)]);

        let group = controller.start_endpoints(&device, 1).unwrap();
        while sim.transfers(2, Direction::In).is_empty() {
            thread::yield_now();
        }
        group.cancel_and_join();

        assert_eq!(saw_error.load(Ordering::SeqCst), 1);
        assert_eq!(sim.transfers(2, Direction::In)[0], vec![0xaa; 4]);
        let control = EndpointControl::from_bits_retain(sim.register(Register::EndpointControl(2)));
        assert!(control.contains(EndpointControl::TX_STALL));
    }

    #[test]
    fn unknown_configuration_starts_nothing() {
        let (sim, controller) = controller();
        let device = Device::new(vec![0; 18]);

        assert!(controller.start_endpoints(&device, 0).unwrap().is_empty());
        assert!(controller.start_endpoints(&device, 3).unwrap().is_empty());
        assert_eq!(sim.register(Register::EndpointPrime) & endpoint_bit(1, Direction::In), 0);
    }
}
