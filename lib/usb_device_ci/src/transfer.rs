use crate::{
    controller::Controller,
    dma::DmaPool,
    endpoint::Direction,
    error::{Error, Result},
    queue::{check_endpoint, DescriptorHandle, TdPtr, TdToken, MAX_TRANSFER_DESCRIPTOR_LENGTH, TRANSFER_DESCRIPTOR_PAGE_SIZE},
    reg::{endpoint_bit, Register, RegisterAccess},
    task::CancellationToken,
    wait::{spin_until, wait_for, WaitError, WaitLimit},
};
use log::{debug, trace, warn};
use std::collections::VecDeque;

/// The data side of a transfer.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Send these bytes to the host (IN).
    Transmit(&'a [u8]),
    /// Receive into this buffer (OUT). At most `buffer.len()` bytes are requested.
    Receive(&'a mut [u8]),
    /// Receive one full descriptor's worth of data and throw it away. Used for status stages.
    Discard,
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Payload::Transmit(data) => data.len(),
            Payload::Receive(buffer) => buffer.len(),
            Payload::Discard => MAX_TRANSFER_DESCRIPTOR_LENGTH,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The descriptors and data region of one in-flight transfer. Descriptors are popped off the
/// front as their completion is confirmed; whatever is left when the chain is dropped belongs to
/// a transfer that failed or was abandoned.
struct Chain<'a, R>
where
    R: RegisterAccess,
{
    controller: &'a Controller<R>,
    endpoint: u8,
    direction: Direction,
    region: Option<u32>,
    descriptors: VecDeque<DescriptorHandle>,
    finished: bool,
}

impl<'a, R> Chain<'a, R>
where
    R: RegisterAccess,
{
    fn new(controller: &'a Controller<R>, endpoint: u8, direction: Direction, region: Option<u32>) -> Chain<'a, R> {
        Chain { controller, endpoint, direction, region, descriptors: VecDeque::new(), finished: false }
    }
}

impl<R> Drop for Chain<'_, R>
where
    R: RegisterAccess,
{
    fn drop(&mut self) {
        let controller = self.controller;
        let abandoned = AbandonedChain {
            endpoint: self.endpoint,
            direction: self.direction,
            region: self.region.take(),
            descriptors: self.descriptors.drain(..).collect(),
        };

        if self.finished {
            abandoned.release(&controller.dma);
            return;
        }

        /*
         * Flushing stops the controller executing the chain but leaves the descriptors marked
         * active. Once the endpoint reads as idle the controller no longer owns any of them.
         */
        let bit = abandoned.bit();
        let registers = &controller.registers;
        registers.write(Register::EndpointFlush, bit);
        spin_until(|| registers.read(Register::EndpointFlush) & bit == 0);

        let idle = wait_for(WaitLimit::Deadline(controller.config.control_timeout), || {
            registers.read(Register::EndpointStatus) & bit == 0
        });
        match idle {
            Ok(()) => abandoned.release(&controller.dma),
            Err(_) => {
                warn!(
                    "EP{} {:?} still busy after flush, parking {} dTDs",
                    abandoned.endpoint,
                    abandoned.direction,
                    abandoned.descriptors.len()
                );
                controller.abandoned.lock().push(abandoned);
            }
        }
    }
}

/// A chain the controller may still have been executing when its transfer was abandoned. Its
/// memory is reclaimed once the endpoint goes idle.
#[derive(Debug)]
pub(crate) struct AbandonedChain {
    endpoint: u8,
    direction: Direction,
    region: Option<u32>,
    descriptors: Vec<DescriptorHandle>,
}

impl AbandonedChain {
    fn bit(&self) -> u32 {
        endpoint_bit(self.endpoint, self.direction)
    }

    fn release(self, dma: &DmaPool) {
        for descriptor in self.descriptors {
            descriptor.retire(dma);
            descriptor.free(dma);
        }
        if let Some(region) = self.region {
            dma.free(region);
        }
    }
}

impl<R> Controller<R>
where
    R: RegisterAccess,
{
    /// Move `payload` to or from the host on an endpoint, returning the number of bytes moved.
    ///
    /// Waits on the control endpoint are bounded by the configured timeouts. Waits on any other
    /// endpoint last until the transfer completes or `cancel` is cancelled.
    pub fn transfer(
        &self,
        endpoint: u8,
        direction: Direction,
        interrupt_on_complete: bool,
        payload: Payload<'_>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        check_endpoint(endpoint)?;
        let bit = endpoint_bit(endpoint, direction);
        let size = payload.len();
        let (limit, descriptor_limit) = if endpoint == 0 {
            (WaitLimit::Deadline(self.config.control_timeout), WaitLimit::Deadline(self.config.descriptor_timeout))
        } else {
            (WaitLimit::Cancellable(cancel), WaitLimit::Cancellable(cancel))
        };

        let region = if size > 0 { Some(self.dma.alloc(size, TRANSFER_DESCRIPTOR_PAGE_SIZE)?) } else { None };
        if let (Some(region), Payload::Transmit(data)) = (region, &payload) {
            self.dma.write_bytes(region, data);
        }
        let mut chain = Chain::new(self, endpoint, direction, region);

        /*
         * Split the region into descriptor-sized chunks and chain them together. Each new
         * descriptor is linked onto the previous one first; if the controller is still working
         * through the chain, it will follow the link by itself and priming again would corrupt
         * its state. Only if it has already gone idle do we prime the new descriptor.
         */
        let mut offset = 0;
        loop {
            let length = (size - offset).min(MAX_TRANSFER_DESCRIPTOR_LENGTH);
            let buffer = region.map_or(0, |region| region + offset as u32);
            let descriptor = DescriptorHandle::build(&self.dma, endpoint, direction, interrupt_on_complete, buffer, length)?;

            let prime = match chain.descriptors.back() {
                Some(previous) => {
                    previous.link(&self.dma, &descriptor);
                    self.registers.read(Register::EndpointPrime) & bit == 0
                        && self.registers.read(Register::EndpointStatus) & bit == 0
                }
                None => true,
            };
            let address = descriptor.address;
            chain.descriptors.push_back(descriptor);

            if prime {
                self.prime(endpoint, direction, address, limit)?;
            }

            offset += length;
            if offset >= size {
                break;
            }
        }

        self.wait(endpoint, direction, limit, || self.registers.read(Register::EndpointPrime) & bit == 0)?;
        self.wait(endpoint, direction, limit, || self.is_complete(bit))?;
        self.clear_complete(bit);

        let mut transferred = 0;
        let mut index = 0;
        while let Some(descriptor) = chain.descriptors.front() {
            self.wait(endpoint, direction, descriptor_limit, || !descriptor.is_active(&self.dma))?;

            let token = descriptor.token(&self.dma);
            if token.status() != 0 {
                warn!("dTD[{}] of EP{} {:?} failed: {:?}", index, endpoint, direction, token);
                return Err(Error::HardwareTransferError { endpoint, direction, descriptor: index, token: token.bits() });
            }

            let moved = match descriptor.size.checked_sub(token.remaining()) {
                Some(moved) => moved,
                None => {
                    warn!("dTD[{}] of EP{} {:?} reports more bytes remaining than it was given", index, endpoint, direction);
                    return Err(Error::HardwareTransferError {
                        endpoint,
                        direction,
                        descriptor: index,
                        token: token.bits(),
                    });
                }
            };
            if direction == Direction::In && token.remaining() != 0 {
                return Err(Error::PartialTransfer {
                    endpoint,
                    direction,
                    descriptor: index,
                    transferred: moved,
                    size: descriptor.size,
                });
            }

            transferred += moved;
            index += 1;
            if let Some(descriptor) = chain.descriptors.pop_front() {
                descriptor.free(&self.dma);
            }
        }
        chain.finished = true;

        trace!("EP{} {:?} transfer complete: {} bytes in {} dTDs", endpoint, direction, transferred, index);

        if let (Some(region), Payload::Receive(buffer)) = (region, payload) {
            let length = transferred.min(buffer.len());
            self.dma.read_bytes(region, &mut buffer[..length]);
        }

        Ok(transferred)
    }

    /// Free the chains of abandoned transfers whose endpoints have since gone idle.
    pub(crate) fn reclaim_abandoned(&self) {
        let status = self.registers.read(Register::EndpointStatus);
        let idle: Vec<AbandonedChain> = {
            let mut abandoned = self.abandoned.lock();
            let (idle, busy): (Vec<_>, Vec<_>) = abandoned.drain(..).partition(|chain| status & chain.bit() == 0);
            *abandoned = busy;
            idle
        };

        for chain in idle {
            debug!("Reclaiming {} dTDs abandoned on EP{} {:?}", chain.descriptors.len(), chain.endpoint, chain.direction);
            chain.release(&self.dma);
        }
    }

    /// Send a zero-length packet.
    ///
    /// This and [`Controller::send`], [`Controller::receive`] and [`Controller::receive_packet`]
    /// can't be cancelled: on any endpoint but the control endpoint, they wait for as long as the
    /// host takes. Endpoint tasks use the `_with` forms, which take a [`CancellationToken`].
    pub fn ack(&self, endpoint: u8) -> Result<()> {
        self.transfer(endpoint, Direction::In, false, Payload::Transmit(&[]), &self.control).map(|_| ())
    }

    /// Send `data` to the host. On the control endpoint, this is followed by the status stage.
    pub fn send(&self, endpoint: u8, interrupt_on_complete: bool, data: &[u8]) -> Result<usize> {
        self.send_with(endpoint, interrupt_on_complete, data, &self.control)
    }

    pub fn send_with(
        &self,
        endpoint: u8,
        interrupt_on_complete: bool,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let sent = self.transfer(endpoint, Direction::In, interrupt_on_complete, Payload::Transmit(data), cancel)?;
        if endpoint == 0 {
            self.transfer(0, Direction::Out, false, Payload::Discard, cancel)?;
        }
        Ok(sent)
    }

    /// Receive into `buffer`. Not cancellable; see [`Controller::ack`].
    pub fn receive(&self, endpoint: u8, interrupt_on_complete: bool, buffer: &mut [u8]) -> Result<usize> {
        self.receive_with(endpoint, interrupt_on_complete, buffer, &self.control)
    }

    pub fn receive_with(
        &self,
        endpoint: u8,
        interrupt_on_complete: bool,
        buffer: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.transfer(endpoint, Direction::Out, interrupt_on_complete, Payload::Receive(buffer), cancel)
    }

    /// Receive up to one full descriptor's worth of data.
    pub fn receive_packet(&self, endpoint: u8, interrupt_on_complete: bool) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; MAX_TRANSFER_DESCRIPTOR_LENGTH];
        let received = self.receive(endpoint, interrupt_on_complete, &mut buffer)?;
        buffer.truncate(received);
        Ok(buffer)
    }

    fn prime(&self, endpoint: u8, direction: Direction, descriptor: u32, limit: WaitLimit<'_>) -> Result<()> {
        self.queue_heads.clear_status(&self.dma, endpoint, direction);
        self.wait(endpoint, direction, limit, || {
            let token = self.queue_heads.token(&self.dma, endpoint, direction);
            !token.get(TdToken::ACTIVE) && !token.get(TdToken::HALTED)
        })?;
        self.queue_heads.set_next(&self.dma, endpoint, direction, TdPtr::new(descriptor, false));

        trace!("Priming EP{} {:?} with dTD {:#x}", endpoint, direction, descriptor);
        self.registers.write(Register::EndpointPrime, endpoint_bit(endpoint, direction));
        Ok(())
    }

    fn wait<F>(&self, endpoint: u8, direction: Direction, limit: WaitLimit<'_>, condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        wait_for(limit, condition).map_err(|err| match err {
            WaitError::TimedOut => {
                warn!("Transfer on EP{} {:?} timed out", endpoint, direction);
                Error::TransferTimeout { endpoint, direction }
            }
            WaitError::Cancelled => Error::Cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::Config,
        dma::DmaPool,
        sim::{Fault, Simulation},
    };
    use std::{sync::Arc, thread, time::Duration};

    fn controller(config: Config) -> (Arc<Simulation>, Arc<DmaPool>, Controller<Arc<Simulation>>) {
        let dma = Arc::new(DmaPool::host(1 << 20, 0x8000_0000));
        let sim = Arc::new(Simulation::new(dma.clone()));
        let controller = Controller::new(sim.clone(), dma.clone(), config).unwrap();
        controller.enter_device_mode();
        (sim, dma, controller)
    }

    #[test]
    fn large_transfers_are_chained() {
        let (sim, dma, controller) = controller(Config::default());
        let baseline = dma.live_allocations();

        for (size, expected) in [
            (0, vec![0]),
            (1, vec![1]),
            (20480, vec![20480]),
            (20481, vec![20480, 1]),
            (50000, vec![20480, 20480, 9040]),
            (61440, vec![20480, 20480, 20480]),
        ] {
            let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let cancel = CancellationToken::new();
            assert_eq!(controller.transfer(1, Direction::In, false, Payload::Transmit(&data), &cancel), Ok(size));

            assert_eq!(sim.descriptor_sizes(1, Direction::In).last(), Some(&expected));
            assert_eq!(sim.transfers(1, Direction::In).last(), Some(&data));
        }

        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn chain_is_primed_once() {
        let (sim, _, controller) = controller(Config::default());
        let data = vec![0x55; 50000];

        assert_eq!(controller.send(2, false, &data), Ok(50000));
        assert_eq!(sim.prime_count(2, Direction::In), 1);
        assert_eq!(sim.transfers(2, Direction::In).len(), 1);
    }

    #[test]
    fn control_send_has_status_stage() {
        let (sim, _, controller) = controller(Config::default());

        assert_eq!(controller.send(0, false, &[1, 2, 3]), Ok(3));
        assert_eq!(sim.transfers(0, Direction::In), vec![vec![1, 2, 3]]);
        assert_eq!(sim.transfers(0, Direction::Out), vec![vec![]]);

        // A bare ack has no status stage of its own
        controller.ack(0).unwrap();
        assert_eq!(sim.transfers(0, Direction::In).len(), 2);
        assert_eq!(sim.transfers(0, Direction::Out).len(), 1);
    }

    #[test]
    fn receive_truncates_to_bytes_moved() {
        let (sim, _, controller) = controller(Config::default());
        sim.host_out(3, vec![9; 10]);

        let mut buffer = [0u8; 64];
        assert_eq!(controller.receive(3, false, &mut buffer), Ok(10));
        assert_eq!(&buffer[..10], &[9; 10]);
        assert!(buffer[10..].iter().all(|&byte| byte == 0));

        sim.host_out(3, vec![1, 2, 3]);
        assert_eq!(controller.receive_packet(3, false), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn control_endpoint_times_out() {
        let config = Config { control_timeout: Duration::from_millis(5), ..Config::default() };
        let (sim, dma, controller) = controller(config);
        let baseline = dma.live_allocations();

        sim.hold(0, Direction::In);
        assert_eq!(
            controller.send(0, false, &[0; 18]),
            Err(Error::TransferTimeout { endpoint: 0, direction: Direction::In })
        );
        assert_eq!(sim.flush_count(0, Direction::In), 1);
        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn busy_chain_is_parked_until_reset() {
        let config = Config { control_timeout: Duration::from_millis(5), ..Config::default() };
        let (sim, dma, controller) = controller(config);
        let baseline = dma.live_allocations();

        sim.hold(0, Direction::In);
        sim.ignore_flush(0, Direction::In, true);
        assert_eq!(
            controller.send(0, false, &[0; 18]),
            Err(Error::TransferTimeout { endpoint: 0, direction: Direction::In })
        );
        assert_eq!(controller.abandoned.lock().len(), 1);
        assert_eq!(dma.live_allocations(), baseline + 2);

        // Still executing, so a reclaim has to leave it alone
        controller.reclaim_abandoned();
        assert_eq!(controller.abandoned.lock().len(), 1);

        sim.ignore_flush(0, Direction::In, false);
        controller.reset();
        assert!(controller.abandoned.lock().is_empty());
        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn cancelled_receives_release_memory() {
        let (sim, dma, controller) = controller(Config::default());
        let controller = Arc::new(controller);
        let baseline = dma.live_allocations();
        sim.hold(4, Direction::Out);

        // Enough rounds to run the pool dry if each one lost a full descriptor's buffer
        for round in 1..=64 {
            let cancel = CancellationToken::new();
            let receiver = {
                let controller = controller.clone();
                let cancel = cancel.clone();
                thread::spawn(move || {
                    let mut buffer = vec![0u8; MAX_TRANSFER_DESCRIPTOR_LENGTH];
                    controller.receive_with(4, false, &mut buffer, &cancel)
                })
            };

            while sim.prime_count(4, Direction::Out) < round {
                thread::yield_now();
            }
            cancel.cancel();
            assert_eq!(receiver.join().unwrap(), Err(Error::Cancelled));
            assert_eq!(dma.live_allocations(), baseline);
        }

        assert_eq!(controller.send(0, false, &[0; 18]), Ok(18));
    }

    #[test]
    fn cancelled_send_is_released() {
        let (sim, dma, controller) = controller(Config::default());
        let controller = Arc::new(controller);
        let baseline = dma.live_allocations();
        sim.hold(1, Direction::In);

        let cancel = CancellationToken::new();
        let sender = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            thread::spawn(move || controller.send_with(1, false, &[7; 64], &cancel))
        };

        while sim.prime_count(1, Direction::In) == 0 {
            thread::yield_now();
        }
        cancel.cancel();
        assert_eq!(sender.join().unwrap(), Err(Error::Cancelled));
        assert_eq!(sim.flush_count(1, Direction::In), 1);
        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn idle_endpoint_is_primed_per_descriptor() {
        let (sim, dma, controller) = controller(Config::default());
        let baseline = dma.live_allocations();
        sim.execute_on_prime(true);

        let data: Vec<u8> = (0..50000).map(|i| (i % 251) as u8).collect();
        assert_eq!(controller.send(2, false, &data), Ok(50000));

        assert_eq!(sim.prime_count(2, Direction::In), 3);
        assert_eq!(sim.descriptor_sizes(2, Direction::In), vec![vec![20480], vec![20480], vec![9040]]);
        assert_eq!(sim.transfers(2, Direction::In).concat(), data);
        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn remaining_count_larger_than_descriptor() {
        let (sim, dma, controller) = controller(Config::default());
        let baseline = dma.live_allocations();

        sim.inject(1, Direction::In, Fault::Remaining(200));
        match controller.send(1, false, &[0; 100]) {
            Err(Error::HardwareTransferError { endpoint: 1, direction: Direction::In, descriptor: 0, token }) => {
                assert_eq!(TdToken::from_bits(token).remaining(), 200)
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn hardware_error_is_reported() {
        let (sim, dma, controller) = controller(Config::default());
        let baseline = dma.live_allocations();

        sim.inject(1, Direction::In, Fault::Error(1 << 3));
        match controller.send(1, false, &[0; 100]) {
            Err(Error::HardwareTransferError { endpoint: 1, direction: Direction::In, descriptor: 0, token }) => {
                assert_eq!(token & 0xff, 1 << 3)
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_eq!(dma.live_allocations(), baseline);
    }

    #[test]
    fn short_in_transfer_is_partial() {
        let (sim, _, controller) = controller(Config::default());

        sim.inject(1, Direction::In, Fault::ShortRead(60));
        assert_eq!(
            controller.send(1, false, &[0; 100]),
            Err(Error::PartialTransfer {
                endpoint: 1,
                direction: Direction::In,
                descriptor: 0,
                transferred: 60,
                size: 100
            })
        );
    }

    #[test]
    fn cancelled_wait_does_not_copy() {
        let (sim, _, controller) = controller(Config::default());
        let controller = Arc::new(controller);
        sim.hold(4, Direction::Out);
        sim.host_out(4, vec![0xee; 8]);

        let cancel = CancellationToken::new();
        let receiver = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                let mut buffer = [0u8; 8];
                let result = controller.receive_with(4, false, &mut buffer, &cancel);
                (result, buffer)
            })
        };

        while sim.prime_count(4, Direction::Out) == 0 {
            thread::yield_now();
        }
        cancel.cancel();

        let (result, buffer) = receiver.join().unwrap();
        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(buffer, [0; 8]);
    }

    #[test]
    fn notified_completion_is_observed() {
        let (sim, _, controller) = controller(Config::default());
        sim.suppress_completion_bit(true);

        let controller = Arc::new(controller);
        let sender = {
            let controller = controller.clone();
            thread::spawn(move || controller.send(5, false, &[1, 2]))
        };

        while sim.transfers(5, Direction::In).is_empty() {
            thread::yield_now();
        }
        controller.notify_completion(5, Direction::In);
        assert_eq!(sender.join().unwrap(), Ok(2));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let (_, _, controller) = controller(Config::default());
        assert_eq!(controller.ack(8), Err(Error::InvalidEndpoint(8)));
    }
}
