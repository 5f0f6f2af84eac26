//! Definitions from the Device Class Definition for Human Interface Devices (HID), version 1.11.

/// Class-specific requests (HID 1.11, section 7.2). These arrive with a `bmRequestType` of
/// `0x21` (host-to-device) or `0xa1` (device-to-host).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum HidRequest {
    GetReport = 0x01,
    GetIdle = 0x02,
    GetProtocol = 0x03,
    SetReport = 0x09,
    SetIdle = 0x0a,
    SetProtocol = 0x0b,
}

impl TryFrom<u8> for HidRequest {
    type Error = u8;

    fn try_from(code: u8) -> Result<HidRequest, u8> {
        match code {
            0x01 => Ok(HidRequest::GetReport),
            0x02 => Ok(HidRequest::GetIdle),
            0x03 => Ok(HidRequest::GetProtocol),
            0x09 => Ok(HidRequest::SetReport),
            0x0a => Ok(HidRequest::SetIdle),
            0x0b => Ok(HidRequest::SetProtocol),
            other => Err(other),
        }
    }
}
