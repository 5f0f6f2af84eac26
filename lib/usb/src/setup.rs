use bit_field::BitField;
use core::fmt;

/// The eight-byte packet that opens every control transfer. On the wire, the fields are laid out
/// in declaration order, with the multi-byte fields little-endian.
#[derive(Clone, Copy)]
pub struct SetupPacket {
    pub typ: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> SetupPacket {
        SetupPacket {
            typ: RequestType::from_bits(bytes[0]),
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.typ.bits();
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    /// Class-specific requests are marked by bit 5 of `bmRequestType`. Everything else (standard
    /// and vendor requests) is handled by the standard request path.
    pub fn is_class_request(&self) -> bool {
        self.typ.bits().get_bit(5)
    }

    pub fn standard_request(&self) -> Option<Request> {
        Request::try_from(self.request).ok()
    }
}

impl PartialEq for SetupPacket {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for SetupPacket {}

impl fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupPacket")
            .field("typ", &format_args!("{:#04x}", self.typ.bits()))
            .field("request", &format_args!("{:#04x}", self.request))
            .field("value", &format_args!("{:#06x}", self.value))
            .field("index", &format_args!("{:#06x}", self.index))
            .field("length", &self.length)
            .finish()
    }
}

mycelium_bitfield::bitfield! {
    pub struct RequestType<u8> {
        pub const RECIPIENT: Recipient;
        pub const TYP: RequestTypeType;
        pub const DIRECTION: Direction;
    }
}

mycelium_bitfield::enum_from_bits! {
    #[derive(PartialEq, Eq, Debug)]
    pub enum Recipient<u8> {
        Device = 0b00000,
        Interface = 0b00001,
        Endpoint = 0b00010,
        Other = 0b00100,
        // XXX: required to make it take up the required number of bits.
        _Dummy = 0b10000,
    }
}

mycelium_bitfield::enum_from_bits! {
    #[derive(PartialEq, Eq, Debug)]
    pub enum RequestTypeType<u8> {
        Standard = 0b00,
        Class = 0b01,
        Vendor = 0b10,
    }
}

mycelium_bitfield::enum_from_bits! {
    #[derive(PartialEq, Eq, Debug)]
    pub enum Direction<u8> {
        HostToDevice = 0b0,
        DeviceToHost = 0b1,
    }
}

/// Standard request codes (USB 2.0, Table 9-4).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

impl TryFrom<u8> for Request {
    type Error = u8;

    fn try_from(code: u8) -> Result<Request, u8> {
        Ok(match code {
            0 => Request::GetStatus,
            1 => Request::ClearFeature,
            3 => Request::SetFeature,
            5 => Request::SetAddress,
            6 => Request::GetDescriptor,
            7 => Request::SetDescriptor,
            8 => Request::GetConfiguration,
            9 => Request::SetConfiguration,
            10 => Request::GetInterface,
            11 => Request::SetInterface,
            12 => Request::SynchFrame,
            other => return Err(other),
        })
    }
}
