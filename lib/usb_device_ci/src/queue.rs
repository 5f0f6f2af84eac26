//! The device controller's in-memory data structures: the endpoint queue head (dQH) list and the
//! transfer descriptors (dTDs) that get linked onto each queue head.
//!
//! Both live in DMA memory and are written by the controller as transfers progress, so they are
//! never cached on our side: every read goes back to the pool. The explicit `encode`/`decode`
//! pairs here define the exact layout the controller expects.

use crate::{
    dma::DmaPool,
    endpoint::Direction,
    error::Error,
    reg::{Register, RegisterAccess},
};
use bit_field::BitField;
use log::trace;

/// The controller supports up to 8 endpoint numbers, each with an OUT and an IN queue head.
pub const MAX_ENDPOINTS: usize = 8;

pub const QUEUE_HEAD_LIST_ALIGN: usize = 2048;
pub const QUEUE_HEAD_SIZE: usize = 64;

pub const TRANSFER_DESCRIPTOR_ALIGN: usize = 32;
pub const TRANSFER_DESCRIPTOR_SIZE: usize = 28;
pub const TRANSFER_DESCRIPTOR_PAGES: usize = 5;
pub const TRANSFER_DESCRIPTOR_PAGE_SIZE: usize = 4096;
/// The most data a single transfer descriptor can describe.
pub const MAX_TRANSFER_DESCRIPTOR_LENGTH: usize = TRANSFER_DESCRIPTOR_PAGES * TRANSFER_DESCRIPTOR_PAGE_SIZE;

const QH_NEXT: u32 = 8;
const QH_TOKEN: u32 = 12;
const QH_SETUP: usize = 40;
const TD_NEXT: u32 = 0;
const TD_TOKEN: u32 = 4;

mycelium_bitfield::bitfield! {
    /// The endpoint capabilities/characteristics word of a queue head.
    pub struct QueueHeadInfo<u32> {
        const _RESERVED_0 = 15;
        /// Raise an interrupt when a setup packet is received on this endpoint.
        pub const INTERRUPT_ON_SETUP: bool;
        pub const MAX_PACKET_LENGTH = 11;
        const _RESERVED_1 = 2;
        /// Zero length termination must be disabled for transfers spanning multiple dTDs.
        pub const ZERO_LENGTH_TERMINATION_DISABLE: bool;
        pub const MULT = 2;
    }
}

mycelium_bitfield::bitfield! {
    /// The token word shared by transfer descriptors and the overlay area of queue heads.
    pub struct TdToken<u32> {
        pub const TRANSACTION_ERROR: bool;
        const _RESERVED_0 = 2;
        pub const DATA_BUFFER_ERROR: bool;
        const _RESERVED_1 = 2;
        pub const HALTED: bool;
        /// Set by software when a descriptor is handed to the controller, and cleared by the
        /// controller once it has retired the descriptor.
        pub const ACTIVE: bool;
        const _RESERVED_2 = 2;
        pub const MULT_OVERRIDE = 2;
        const _RESERVED_3 = 3;
        pub const INTERRUPT_ON_COMPLETE: bool;
        /// Bytes still to be moved. Decremented by the controller as data is transferred.
        pub const TOTAL_BYTES = 16;
    }
}

impl TdToken {
    /// The status byte. Only meaningful once the controller has cleared `ACTIVE`, at which point
    /// any non-zero value is an error.
    pub fn status(self) -> u8 {
        self.bits() as u8
    }

    pub fn remaining(self) -> usize {
        self.get(TdToken::TOTAL_BYTES) as usize
    }
}

/// A link to the next transfer descriptor. Bit 0 set marks the end of the chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct TdPtr(pub u32);

impl TdPtr {
    pub const TERMINATE: TdPtr = TdPtr(1);

    pub fn new(ptr: u32, terminate: bool) -> TdPtr {
        let mut value = ptr;
        value.set_bit(0, terminate);
        TdPtr(value)
    }

    pub fn is_terminate(self) -> bool {
        self.0.get_bit(0)
    }

    pub fn address(self) -> u32 {
        self.0 & !0x1f
    }
}

/// Endpoint Queue Head (dQH). 64 bytes, laid out as:
///
/// | Offset | Field                   |
/// |--------|-------------------------|
/// | 0x00   | info                    |
/// | 0x04   | current dTD pointer     |
/// | 0x08   | next dTD pointer        |
/// | 0x0c   | token                   |
/// | 0x10   | buffer pointers (5)     |
/// | 0x24   | reserved                |
/// | 0x28   | setup buffer (8 bytes)  |
/// | 0x30   | padding to 64 bytes     |
#[derive(Clone, Copy, Debug)]
pub struct QueueHead {
    pub info: QueueHeadInfo,
    pub current: u32,
    pub next: TdPtr,
    pub token: TdToken,
    pub buffer: [u32; 5],
    /// The last setup packet received, exactly as the controller wrote it.
    pub setup: [u8; 8],
}

impl QueueHead {
    pub fn new(max_packet_size: u16, zero_length_termination: bool, mult: u8, interrupt_on_setup: bool) -> QueueHead {
        QueueHead {
            info: QueueHeadInfo::new()
                .with(QueueHeadInfo::MAX_PACKET_LENGTH, max_packet_size as u32)
                .with(QueueHeadInfo::ZERO_LENGTH_TERMINATION_DISABLE, !zero_length_termination)
                .with(QueueHeadInfo::MULT, mult as u32)
                .with(QueueHeadInfo::INTERRUPT_ON_SETUP, interrupt_on_setup),
            current: 0,
            next: TdPtr::new(0, false),
            token: TdToken::new()
                .with(TdToken::TOTAL_BYTES, 0)
                .with(TdToken::INTERRUPT_ON_COMPLETE, true)
                .with(TdToken::MULT_OVERRIDE, 0),
            buffer: [0; 5],
            setup: [0; 8],
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        self.info.get(QueueHeadInfo::MAX_PACKET_LENGTH) as u16
    }

    pub fn zero_length_termination(&self) -> bool {
        !self.info.get(QueueHeadInfo::ZERO_LENGTH_TERMINATION_DISABLE)
    }

    pub fn mult(&self) -> u8 {
        self.info.get(QueueHeadInfo::MULT) as u8
    }

    pub fn interrupt_on_setup(&self) -> bool {
        self.info.get(QueueHeadInfo::INTERRUPT_ON_SETUP)
    }

    pub fn encode(&self) -> [u32; QUEUE_HEAD_SIZE / 4] {
        let mut words = [0u32; QUEUE_HEAD_SIZE / 4];
        words[0] = self.info.bits();
        words[1] = self.current;
        words[2] = self.next.0;
        words[3] = self.token.bits();
        words[4..9].copy_from_slice(&self.buffer);
        words[10] = u32::from_le_bytes([self.setup[0], self.setup[1], self.setup[2], self.setup[3]]);
        words[11] = u32::from_le_bytes([self.setup[4], self.setup[5], self.setup[6], self.setup[7]]);
        words
    }

    pub fn decode(words: &[u32; QUEUE_HEAD_SIZE / 4]) -> QueueHead {
        let mut buffer = [0u32; 5];
        buffer.copy_from_slice(&words[4..9]);
        let mut setup = [0u8; 8];
        setup[0..4].copy_from_slice(&words[10].to_le_bytes());
        setup[4..8].copy_from_slice(&words[11].to_le_bytes());

        QueueHead {
            info: QueueHeadInfo::from_bits(words[0]),
            current: words[1],
            next: TdPtr(words[2]),
            token: TdToken::from_bits(words[3]),
            buffer,
            setup,
        }
    }
}

/// The list of queue heads, one OUT/IN pair per endpoint number, that the controller finds
/// through `ENDPOINTLISTADDR`. It is allocated once and lives as long as the controller.
#[derive(Clone, Copy, Debug)]
pub struct QueueHeadTable {
    base: u32,
}

impl QueueHeadTable {
    pub fn allocate(dma: &DmaPool) -> crate::error::Result<QueueHeadTable> {
        let base = dma.alloc(MAX_ENDPOINTS * 2 * QUEUE_HEAD_SIZE, QUEUE_HEAD_LIST_ALIGN)?;
        Ok(QueueHeadTable { base })
    }

    /// Clear every queue head and point the controller at the list.
    pub fn initialize<R: RegisterAccess>(&self, dma: &DmaPool, registers: &R) {
        dma.write_bytes(self.base, &[0u8; MAX_ENDPOINTS * 2 * QUEUE_HEAD_SIZE]);
        registers.write(Register::EndpointListAddress, self.base);
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn address_of(&self, endpoint: u8, direction: Direction) -> u32 {
        assert!((endpoint as usize) < MAX_ENDPOINTS);
        self.base + ((endpoint as u32 * 2 + direction as u32) * QUEUE_HEAD_SIZE as u32)
    }

    pub fn configure(&self, dma: &DmaPool, endpoint: u8, direction: Direction, max_packet_size: u16, zlt: bool, mult: u8) {
        // The controller raises setup interrupts from the control endpoint's IN queue head
        let head = QueueHead::new(max_packet_size, zlt, mult, endpoint == 0 && direction == Direction::In);
        trace!("Configuring dQH for EP{} {:?}: {:?}", endpoint, direction, head.info);
        dma.write_words(self.address_of(endpoint, direction), &head.encode());
    }

    pub fn read(&self, dma: &DmaPool, endpoint: u8, direction: Direction) -> QueueHead {
        let mut words = [0u32; QUEUE_HEAD_SIZE / 4];
        dma.read_words(self.address_of(endpoint, direction), &mut words);
        QueueHead::decode(&words)
    }

    pub fn token(&self, dma: &DmaPool, endpoint: u8, direction: Direction) -> TdToken {
        TdToken::from_bits(dma.read_u32(self.address_of(endpoint, direction) + QH_TOKEN))
    }

    /// Reset the active and halted bits of the queue head's overlay token.
    pub fn clear_status(&self, dma: &DmaPool, endpoint: u8, direction: Direction) {
        let token = self.token(dma, endpoint, direction).with(TdToken::ACTIVE, false).with(TdToken::HALTED, false);
        dma.write_u32(self.address_of(endpoint, direction) + QH_TOKEN, token.bits());
    }

    pub fn set_next(&self, dma: &DmaPool, endpoint: u8, direction: Direction, next: TdPtr) {
        dma.write_u32(self.address_of(endpoint, direction) + QH_NEXT, next.0);
    }

    /// The setup buffer of the control endpoint's OUT queue head, as written by the controller.
    pub fn setup_buffer_address(&self) -> u32 {
        self.address_of(0, Direction::Out) + QH_SETUP as u32
    }
}

/// Endpoint Transfer Descriptor (dTD). The controller sees the first 28 bytes: the next pointer,
/// the token, and five page pointers.
#[derive(Clone, Copy, Debug)]
pub struct TransferDescriptor {
    pub next: TdPtr,
    pub token: TdToken,
    pub buffer: [u32; TRANSFER_DESCRIPTOR_PAGES],
}

impl TransferDescriptor {
    pub fn new(interrupt_on_complete: bool, buffer: u32, size: usize) -> TransferDescriptor {
        let mut pages = [0u32; TRANSFER_DESCRIPTOR_PAGES];
        for (i, page) in pages.iter_mut().enumerate() {
            *page = buffer + (TRANSFER_DESCRIPTOR_PAGE_SIZE * i) as u32;
        }

        TransferDescriptor {
            next: TdPtr::TERMINATE,
            token: TdToken::new()
                .with(TdToken::INTERRUPT_ON_COMPLETE, interrupt_on_complete)
                .with(TdToken::MULT_OVERRIDE, 0)
                .with(TdToken::ACTIVE, true)
                .with(TdToken::TOTAL_BYTES, size as u32),
            buffer: pages,
        }
    }

    pub fn encode(&self) -> [u32; TRANSFER_DESCRIPTOR_SIZE / 4] {
        let mut words = [0u32; TRANSFER_DESCRIPTOR_SIZE / 4];
        words[0] = self.next.0;
        words[1] = self.token.bits();
        words[2..7].copy_from_slice(&self.buffer);
        words
    }

    pub fn decode(words: &[u32; TRANSFER_DESCRIPTOR_SIZE / 4]) -> TransferDescriptor {
        let mut buffer = [0u32; TRANSFER_DESCRIPTOR_PAGES];
        buffer.copy_from_slice(&words[2..7]);
        TransferDescriptor { next: TdPtr(words[0]), token: TdToken::from_bits(words[1]), buffer }
    }

    pub fn read(dma: &DmaPool, address: u32) -> TransferDescriptor {
        let mut words = [0u32; TRANSFER_DESCRIPTOR_SIZE / 4];
        dma.read_words(address, &mut words);
        TransferDescriptor::decode(&words)
    }
}

/// A transfer descriptor that has been built in DMA memory, along with the parts of it the
/// controller doesn't see: where its data lives and how much of it there is.
#[derive(Debug)]
pub struct DescriptorHandle {
    pub address: u32,
    pub buffer: u32,
    pub size: usize,
}

impl DescriptorHandle {
    /// Build an active transfer descriptor describing `size` bytes at `buffer`.
    pub fn build(
        dma: &DmaPool,
        endpoint: u8,
        direction: Direction,
        interrupt_on_complete: bool,
        buffer: u32,
        size: usize,
    ) -> crate::error::Result<DescriptorHandle> {
        assert!(size <= MAX_TRANSFER_DESCRIPTOR_LENGTH);

        let descriptor = TransferDescriptor::new(interrupt_on_complete, buffer, size);
        let address = dma.alloc(TRANSFER_DESCRIPTOR_SIZE, TRANSFER_DESCRIPTOR_ALIGN)?;
        dma.write_words(address, &descriptor.encode());
        trace!("Built dTD at {:#x} for EP{} {:?} ({} bytes at {:#x})", address, endpoint, direction, size, buffer);

        Ok(DescriptorHandle { address, buffer, size })
    }

    pub fn token(&self, dma: &DmaPool) -> TdToken {
        TdToken::from_bits(dma.read_u32(self.address + TD_TOKEN))
    }

    pub fn is_active(&self, dma: &DmaPool) -> bool {
        self.token(dma).get(TdToken::ACTIVE)
    }

    /// Point this descriptor at `next`, extending the chain.
    pub fn link(&self, dma: &DmaPool, next: &DescriptorHandle) {
        dma.write_u32(self.address + TD_NEXT, TdPtr::new(next.address, false).0);
    }

    /// Take back a descriptor the controller has stopped executing without retiring it, as it
    /// does when the endpoint is flushed.
    pub fn retire(&self, dma: &DmaPool) {
        let token = self.token(dma).with(TdToken::ACTIVE, false);
        dma.write_u32(self.address + TD_TOKEN, token.bits());
    }

    /// Release the descriptor's memory. Must only be called once its active bit is clear, either
    /// by the controller or through [`DescriptorHandle::retire`].
    pub fn free(self, dma: &DmaPool) {
        debug_assert!(!self.is_active(dma), "Freeing dTD at {:#x} while it is still active", self.address);
        dma.free(self.address);
    }
}

/// Reject endpoint numbers the controller doesn't have.
pub fn check_endpoint(endpoint: u8) -> crate::error::Result<u8> {
    if (endpoint as usize) < MAX_ENDPOINTS {
        Ok(endpoint)
    } else {
        Err(Error::InvalidEndpoint(endpoint))
    }
}
