use crate::endpoint::Direction;
use bit_field::BitField;
use bitflags::bitflags;
use std::sync::Arc;

/// The device-mode registers of the controller, as offsets from the base of the `USB_UOGx` block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Register {
    Command,
    Status,
    DeviceAddress,
    EndpointListAddress,
    OtgStatusControl,
    Mode,
    EndpointSetupStatus,
    EndpointPrime,
    EndpointFlush,
    EndpointStatus,
    EndpointComplete,
    EndpointControl(u8),
}

impl Register {
    pub fn offset(self) -> usize {
        match self {
            Register::Command => 0x140,
            Register::Status => 0x144,
            Register::DeviceAddress => 0x154,
            Register::EndpointListAddress => 0x158,
            Register::OtgStatusControl => 0x1a4,
            Register::Mode => 0x1a8,
            Register::EndpointSetupStatus => 0x1ac,
            Register::EndpointPrime => 0x1b0,
            Register::EndpointFlush => 0x1b4,
            Register::EndpointStatus => 0x1b8,
            Register::EndpointComplete => 0x1bc,
            Register::EndpointControl(n) => 0x1c0 + 4 * n as usize,
        }
    }
}

/// Access to the controller's register block. Real hardware is reached through [`Mmio`]; tests
/// substitute a simulated register bank.
pub trait RegisterAccess: Send + Sync {
    fn read(&self, register: Register) -> u32;
    fn write(&self, register: Register, value: u32);

    fn modify(&self, register: Register, f: impl FnOnce(u32) -> u32)
    where
        Self: Sized,
    {
        let value = self.read(register);
        self.write(register, f(value));
    }
}

impl<T> RegisterAccess for Arc<T>
where
    T: RegisterAccess + ?Sized,
{
    fn read(&self, register: Register) -> u32 {
        (**self).read(register)
    }

    fn write(&self, register: Register, value: u32) {
        (**self).write(register, value)
    }
}

/// Memory-mapped register block.
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// ### Safety
    /// `base` must be the mapped address of a `USB_UOGx` register block, and nothing else may
    /// access the block while this `Mmio` exists.
    pub unsafe fn new(base: usize) -> Mmio {
        Mmio { base }
    }
}

impl RegisterAccess for Mmio {
    fn read(&self, register: Register) -> u32 {
        unsafe { std::ptr::read_volatile((self.base + register.offset()) as *const u32) }
    }

    fn write(&self, register: Register, value: u32) {
        unsafe { std::ptr::write_volatile((self.base + register.offset()) as *mut u32, value) }
    }
}

/// The bit that represents an endpoint in `ENDPTPRIME`, `ENDPTFLUSH`, `ENDPTSTAT`, and
/// `ENDPTCOMPLETE`. Receive (OUT) endpoints occupy the low half-word, transmit (IN) endpoints the
/// high half-word.
pub fn endpoint_bit(endpoint: u8, direction: Direction) -> u32 {
    1 << endpoint_position(endpoint, direction)
}

pub fn endpoint_position(endpoint: u8, direction: Direction) -> u32 {
    match direction {
        Direction::Out => endpoint as u32,
        Direction::In => 16 + endpoint as u32,
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Command: u32 {
        const RUN = 1 << 0;
        const RESET = 1 << 1;

        /*
         * Mark the interrupt threshold, frame list size, and setup/add-dTD tripwire fields as
         * known bits, so read-modify-write cycles preserve them.
         */
        const _ = !0;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Status: u32 {
        const INTERRUPT = 1 << 0;
        const ERROR = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const SYSTEM_ERROR = 1 << 4;
        /// Set when the host signals a bus reset. Write `1` to clear.
        const RESET_RECEIVED = 1 << 6;
        const SOF_RECEIVED = 1 << 7;
        const SUSPEND = 1 << 8;

        const _ = !0;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Mode: u32 {
        /// Setup lockout mode off: setup packets overwrite the queue head's setup buffer and the
        /// tripwire mechanism is used instead.
        const SETUP_LOCKOUT_OFF = 1 << 3;
        const STREAM_DISABLE = 1 << 4;

        const _ = !0;
    }
}

pub const CONTROLLER_MODE_DEVICE: u32 = 0b10;

impl Mode {
    pub fn controller_mode(self) -> u32 {
        self.bits().get_bits(0..2)
    }

    pub fn with_controller_mode(self, mode: u32) -> Mode {
        let mut value = self.bits();
        value.set_bits(0..2, mode);
        Mode::from_bits_retain(value)
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct OtgStatusControl: u32 {
        const OTG_TERMINATION = 1 << 3;

        const _ = !0;
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EndpointControl: u32 {
        const RX_STALL = 1 << 0;
        const RX_TOGGLE_RESET = 1 << 6;
        const RX_ENABLE = 1 << 7;
        const TX_STALL = 1 << 16;
        const TX_TOGGLE_RESET = 1 << 22;
        const TX_ENABLE = 1 << 23;

        /*
         * Mark the two transfer type fields (bits 2..4 and 18..20) as known bits.
         */
        const _ = !0;
    }
}

impl EndpointControl {
    pub fn stall(direction: Direction) -> EndpointControl {
        match direction {
            Direction::Out => EndpointControl::RX_STALL,
            Direction::In => EndpointControl::TX_STALL,
        }
    }

    pub fn toggle_reset(direction: Direction) -> EndpointControl {
        match direction {
            Direction::Out => EndpointControl::RX_TOGGLE_RESET,
            Direction::In => EndpointControl::TX_TOGGLE_RESET,
        }
    }

    pub fn enable(direction: Direction) -> EndpointControl {
        match direction {
            Direction::Out => EndpointControl::RX_ENABLE,
            Direction::In => EndpointControl::TX_ENABLE,
        }
    }

    pub fn transfer_type(self, direction: Direction) -> u32 {
        match direction {
            Direction::Out => self.bits().get_bits(2..4),
            Direction::In => self.bits().get_bits(18..20),
        }
    }

    pub fn with_transfer_type(self, direction: Direction, typ: u32) -> EndpointControl {
        let mut value = self.bits();
        match direction {
            Direction::Out => value.set_bits(2..4, typ),
            Direction::In => value.set_bits(18..20, typ),
        };
        EndpointControl::from_bits_retain(value)
    }
}

/// `DEVICEADDR`: the address is held in bits 25..32. Setting `USBADRA` alongside it defers the
/// change until the status stage of the `SET_ADDRESS` request has completed.
pub fn device_address(address: u8) -> u32 {
    let mut value = 0u32;
    value.set_bit(24, true);
    value.set_bits(25..32, address as u32 & 0x7f);
    value
}
