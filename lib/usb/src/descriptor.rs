/// Descriptor type codes (USB 2.0, Table 9-5), plus the class-specific types we need to serve.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Otg = 9,
    Debug = 10,
    InterfaceAssociation = 11,
    Hid = 0x21,
    HidReport = 0x22,
}

impl TryFrom<u8> for DescriptorType {
    type Error = u8;

    fn try_from(code: u8) -> Result<DescriptorType, u8> {
        Ok(match code {
            1 => DescriptorType::Device,
            2 => DescriptorType::Configuration,
            3 => DescriptorType::String,
            4 => DescriptorType::Interface,
            5 => DescriptorType::Endpoint,
            6 => DescriptorType::DeviceQualifier,
            7 => DescriptorType::OtherSpeedConfiguration,
            8 => DescriptorType::InterfacePower,
            9 => DescriptorType::Otg,
            10 => DescriptorType::Debug,
            11 => DescriptorType::InterfaceAssociation,
            0x21 => DescriptorType::Hid,
            0x22 => DescriptorType::HidReport,
            other => return Err(other),
        })
    }
}

/// Standard feature selectors (USB 2.0, Table 9-6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum FeatureSelector {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
    TestMode = 2,
}

impl TryFrom<u16> for FeatureSelector {
    type Error = u16;

    fn try_from(value: u16) -> Result<FeatureSelector, u16> {
        match value {
            0 => Ok(FeatureSelector::EndpointHalt),
            1 => Ok(FeatureSelector::DeviceRemoteWakeup),
            2 => Ok(FeatureSelector::TestMode),
            other => Err(other),
        }
    }
}
