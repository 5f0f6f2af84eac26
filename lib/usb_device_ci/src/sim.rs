//! A software model of the controller, for testing code that drives it without hardware.
//!
//! The model implements the register interface, and plays the controller's side of the
//! descriptor protocol against a [`DmaPool`]: priming an endpoint loads the chain its queue head
//! points at, and the chain is executed (data moved, descriptors retired, completion signalled)
//! the next time software polls `ENDPTCOMPLETE`. The host side is scripted: data for OUT
//! endpoints is queued up front, and IN data is recorded for inspection.

use crate::{
    dma::DmaPool,
    endpoint::Direction,
    queue::{TdToken, TransferDescriptor, QUEUE_HEAD_SIZE},
    reg::{endpoint_bit, endpoint_position, Command, Register, RegisterAccess, Status},
};
use spinning_top::Spinlock;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use usb::setup::SetupPacket;

const TD_TOKEN: u32 = 4;
const QH_NEXT: u32 = 8;
const QH_SETUP: u32 = 40;

/// A fault to apply to the next transfer descriptor an endpoint retires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// Retire the descriptor with this (non-zero) status byte.
    Error(u8),
    /// The host only moves this many bytes of the descriptor.
    ShortRead(usize),
    /// Retire the descriptor with this many bytes remaining, whatever its size.
    Remaining(usize),
}

#[derive(Default)]
struct State {
    registers: BTreeMap<usize, u32>,
    /// The next descriptor to execute, for each endpoint bit position.
    executing: BTreeMap<u32, u32>,
    held: u32,
    /// Endpoints that keep executing through a flush.
    stuck: u32,
    execute_on_prime: bool,
    suppress_completion: bool,
    host_out: BTreeMap<u32, VecDeque<Vec<u8>>>,
    faults: BTreeMap<u32, VecDeque<Fault>>,
    transfers: BTreeMap<u32, Vec<Vec<u8>>>,
    sizes: BTreeMap<u32, Vec<Vec<usize>>>,
    primes: BTreeMap<u32, usize>,
    flushes: BTreeMap<u32, usize>,
}

impl State {
    fn stored(&self, register: Register) -> u32 {
        self.registers.get(&register.offset()).copied().unwrap_or(0)
    }

    fn store(&mut self, register: Register, value: u32) {
        self.registers.insert(register.offset(), value);
    }
}

pub struct Simulation {
    state: Spinlock<State>,
    dma: Arc<DmaPool>,
}

impl Simulation {
    /// Create a controller model that finds the driver's descriptors in `dma`.
    pub fn new(dma: Arc<DmaPool>) -> Simulation {
        Simulation { state: Spinlock::new(State::default()), dma }
    }

    /// Deliver a setup packet to the control endpoint.
    pub fn setup(&self, setup: SetupPacket) {
        let mut state = self.state.lock();
        let list = state.stored(Register::EndpointListAddress);
        self.dma.write_bytes(list + QH_SETUP, &setup.to_bytes());

        let status = state.stored(Register::EndpointSetupStatus);
        state.store(Register::EndpointSetupStatus, status | endpoint_bit(0, Direction::Out));
    }

    pub fn bus_reset(&self) {
        let mut state = self.state.lock();
        let status = state.stored(Register::Status);
        state.store(Register::Status, status | Status::RESET_RECEIVED.bits());
    }

    /// Stop the endpoint from executing anything it has been primed with, until released.
    pub fn hold(&self, endpoint: u8, direction: Direction) {
        self.state.lock().held |= endpoint_bit(endpoint, direction);
    }

    pub fn release(&self, endpoint: u8, direction: Direction) {
        self.state.lock().held &= !endpoint_bit(endpoint, direction);
    }

    /// Make flushes of the endpoint leave whatever it is executing in place, as a controller
    /// that is in the middle of a packet would.
    pub fn ignore_flush(&self, endpoint: u8, direction: Direction, ignore: bool) {
        let bit = endpoint_bit(endpoint, direction);
        let mut state = self.state.lock();
        if ignore {
            state.stuck |= bit;
        } else {
            state.stuck &= !bit;
        }
    }

    /// Execute chains as soon as they are primed, rather than when `ENDPTCOMPLETE` is next read.
    /// The endpoint then goes idle before software can link anything else onto the chain.
    pub fn execute_on_prime(&self, immediate: bool) {
        self.state.lock().execute_on_prime = immediate;
    }

    /// Queue a packet for the host to send to an OUT endpoint.
    pub fn host_out(&self, endpoint: u8, data: Vec<u8>) {
        let position = endpoint_position(endpoint, Direction::Out);
        self.state.lock().host_out.entry(position).or_default().push_back(data);
    }

    pub fn inject(&self, endpoint: u8, direction: Direction, fault: Fault) {
        let position = endpoint_position(endpoint, direction);
        self.state.lock().faults.entry(position).or_default().push_back(fault);
    }

    /// Retire descriptors without setting their `ENDPTCOMPLETE` bit, as if an interrupt handler
    /// had already acknowledged it.
    pub fn suppress_completion_bit(&self, suppress: bool) {
        self.state.lock().suppress_completion = suppress;
    }

    /// The data moved by each chain the endpoint has executed, in order.
    pub fn transfers(&self, endpoint: u8, direction: Direction) -> Vec<Vec<u8>> {
        let position = endpoint_position(endpoint, direction);
        self.state.lock().transfers.get(&position).cloned().unwrap_or_default()
    }

    /// The size of each descriptor of each chain the endpoint has executed.
    pub fn descriptor_sizes(&self, endpoint: u8, direction: Direction) -> Vec<Vec<usize>> {
        let position = endpoint_position(endpoint, direction);
        self.state.lock().sizes.get(&position).cloned().unwrap_or_default()
    }

    pub fn prime_count(&self, endpoint: u8, direction: Direction) -> usize {
        let position = endpoint_position(endpoint, direction);
        self.state.lock().primes.get(&position).copied().unwrap_or(0)
    }

    pub fn flush_count(&self, endpoint: u8, direction: Direction) -> usize {
        let position = endpoint_position(endpoint, direction);
        self.state.lock().flushes.get(&position).copied().unwrap_or(0)
    }

    /// Peek at a register without any of the side effects a read by the driver would have.
    pub fn register(&self, register: Register) -> u32 {
        let state = self.state.lock();
        match register {
            Register::EndpointStatus => Self::endpoint_status(&state),
            _ => state.stored(register),
        }
    }

    /// Set a register's value directly, bypassing the write semantics of the real register.
    pub fn write_register(&self, register: Register, value: u32) {
        self.state.lock().store(register, value);
    }

    fn endpoint_status(state: &State) -> u32 {
        state.executing.keys().fold(0, |status, position| status | (1 << position))
    }

    fn prime(&self, state: &mut State, bits: u32) {
        let list = state.stored(Register::EndpointListAddress);
        let dma = &self.dma;

        for position in (0..32).filter(|position| bits & (1 << position) != 0) {
            let index = (position % 16) * 2 + position / 16;
            let next = dma.read_u32(list + index * QUEUE_HEAD_SIZE as u32 + QH_NEXT);
            state.executing.insert(position, next & !0x1f);
            *state.primes.entry(position).or_default() += 1;
        }
    }

    fn flush(state: &mut State, bits: u32) {
        for position in (0..32).filter(|position| bits & (1 << position) != 0) {
            if state.stuck & (1 << position) == 0 {
                state.executing.remove(&position);
            }
            *state.flushes.entry(position).or_default() += 1;
        }
    }

    /// Execute every chain that is primed, not held, and (for OUT endpoints) has host data to
    /// receive.
    fn run(&self, state: &mut State) {
        let dma = &self.dma;
        let ready: Vec<(u32, u32)> = state
            .executing
            .iter()
            .map(|(&position, &address)| (position, address))
            .filter(|&(position, _)| state.held & (1 << position) == 0)
            .collect();

        for (position, first) in ready {
            let direction = if position >= 16 { Direction::In } else { Direction::Out };
            let mut incoming = match direction {
                Direction::In => None,
                Direction::Out => match state.host_out.get_mut(&position).and_then(VecDeque::pop_front) {
                    Some(data) => Some(VecDeque::from(data)),
                    // The status stage of a control transfer is a zero-length OUT
                    None if position == 0 => Some(VecDeque::new()),
                    None => continue,
                },
            };

            let mut fault = state.faults.get_mut(&position).and_then(VecDeque::pop_front);
            let mut moved_data = Vec::new();
            let mut sizes = Vec::new();
            let mut address = first;

            loop {
                let descriptor = TransferDescriptor::read(dma, address);
                let size = descriptor.token.remaining();
                let buffer = descriptor.buffer[0];
                sizes.push(size);

                let mut status = 0;
                let mut reported = None;
                let moved = match direction {
                    Direction::In => {
                        let moved = match fault.take() {
                            Some(Fault::ShortRead(bytes)) => bytes.min(size),
                            Some(Fault::Remaining(bytes)) => {
                                reported = Some(bytes);
                                size.saturating_sub(bytes)
                            }
                            Some(Fault::Error(error)) => {
                                status = error;
                                0
                            }
                            None => size,
                        };
                        if moved > 0 {
                            let mut data = vec![0u8; moved];
                            dma.read_bytes(buffer, &mut data);
                            moved_data.extend(data);
                        }
                        moved
                    }
                    Direction::Out => {
                        if let Some(Fault::Error(error)) = fault.take() {
                            status = error;
                        }
                        let incoming = incoming.get_or_insert_with(VecDeque::new);
                        let available = size.min(incoming.len());
                        let data: Vec<u8> = incoming.drain(..available).collect();
                        if !data.is_empty() {
                            dma.write_bytes(buffer, &data);
                        }
                        moved_data.extend(&data);
                        data.len()
                    }
                };

                let token = descriptor
                    .token
                    .with(TdToken::ACTIVE, false)
                    .with(TdToken::TOTAL_BYTES, reported.unwrap_or(size - moved) as u32);
                dma.write_u32(address + TD_TOKEN, (token.bits() & !0xff) | status as u32);

                if descriptor.next.is_terminate() {
                    break;
                }
                address = descriptor.next.address();
            }

            state.executing.remove(&position);
            state.transfers.entry(position).or_default().push(moved_data);
            state.sizes.entry(position).or_default().push(sizes);
            if !state.suppress_completion {
                let complete = state.stored(Register::EndpointComplete);
                state.store(Register::EndpointComplete, complete | (1 << position));
            }
        }
    }
}

impl RegisterAccess for Simulation {
    fn read(&self, register: Register) -> u32 {
        let mut state = self.state.lock();
        match register {
            Register::EndpointPrime | Register::EndpointFlush => 0,
            Register::EndpointStatus => Self::endpoint_status(&state),
            Register::EndpointComplete => {
                self.run(&mut state);
                state.stored(register)
            }
            _ => state.stored(register),
        }
    }

    fn write(&self, register: Register, value: u32) {
        let mut state = self.state.lock();
        match register {
            Register::Status | Register::EndpointSetupStatus | Register::EndpointComplete => {
                let current = state.stored(register);
                state.store(register, current & !value);
            }
            Register::Command => state.store(register, value & !Command::RESET.bits()),
            Register::EndpointPrime => {
                self.prime(&mut state, value);
                if state.execute_on_prime {
                    self.run(&mut state);
                }
            }
            Register::EndpointFlush => Self::flush(&mut state, value),
            _ => state.store(register, value),
        }
    }
}
