use crate::endpoint::Direction;
use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// A standard or class request (or a descriptor type) we don't implement. The control
    /// endpoint is stalled.
    UnsupportedRequest { request_type: u8, request: u8, value: u16 },
    /// A descriptor index past the end of the device's string or configuration table. The control
    /// endpoint is stalled.
    InvalidDescriptorIndex { descriptor_type: u8, index: u8 },
    /// The control endpoint did not complete within its deadline.
    TransferTimeout { endpoint: u8, direction: Direction },
    /// A retired transfer descriptor reported a non-zero error status.
    HardwareTransferError { endpoint: u8, direction: Direction, descriptor: usize, token: u32 },
    /// The host did not consume all of the data of an IN transfer descriptor.
    PartialTransfer { endpoint: u8, direction: Direction, descriptor: usize, transferred: usize, size: usize },
    /// A wait on a non-control endpoint was interrupted because its configuration was torn down.
    Cancelled,
    OutOfDmaMemory { size: usize, align: usize },
    InvalidEndpoint(u8),
    UnsupportedTransferType,
    TaskSpawn(String),
    /// Reported by a setup override or an endpoint function.
    Handler(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedRequest { request_type, request, value } => write!(
                f,
                "unsupported request (bmRequestType {:#04x}, bRequest {:#04x}, wValue {:#06x})",
                request_type, request, value
            ),
            Error::InvalidDescriptorIndex { descriptor_type, index } => {
                write!(f, "invalid index {} for descriptor type {:#04x}", index, descriptor_type)
            }
            Error::TransferTimeout { endpoint, direction } => {
                write!(f, "transfer on EP{} {:?} timed out", endpoint, direction)
            }
            Error::HardwareTransferError { endpoint, direction, descriptor, token } => {
                write!(f, "dTD[{}] on EP{} {:?} completed with error status (token {:#x})", descriptor, endpoint, direction, token)
            }
            Error::PartialTransfer { endpoint, direction, descriptor, transferred, size } => write!(
                f,
                "dTD[{}] on EP{} {:?} partial transfer ({}/{} bytes)",
                descriptor, endpoint, direction, transferred, size
            ),
            Error::Cancelled => write!(f, "transfer cancelled"),
            Error::OutOfDmaMemory { size, align } => {
                write!(f, "out of DMA memory (wanted {} bytes aligned to {})", size, align)
            }
            Error::InvalidEndpoint(number) => write!(f, "invalid endpoint number {}", number),
            Error::UnsupportedTransferType => write!(f, "isochronous endpoints are not supported"),
            Error::TaskSpawn(reason) => write!(f, "failed to spawn endpoint task: {}", reason),
            Error::Handler(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for Error {}
