use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
};
use std::sync::Arc;
use usb::setup::SetupPacket;

/// What a setup override wants done with a packet.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SetupResponse {
    /// Bytes to transmit on the control endpoint, trimmed to the requested length.
    pub data: Vec<u8>,
    /// Send a zero-length acknowledgement.
    pub ack: bool,
    /// The packet has been fully handled, and standard processing should be skipped.
    pub done: bool,
}

/// Consulted before standard processing for every setup packet.
pub trait SetupHandler: Send {
    fn handle(&mut self, setup: &SetupPacket) -> Result<SetupResponse>;
}

impl<F> SetupHandler for F
where
    F: FnMut(&SetupPacket) -> Result<SetupResponse> + Send,
{
    fn handle(&mut self, setup: &SetupPacket) -> Result<SetupResponse> {
        self(setup)
    }
}

/// Runs on an endpoint of the active configuration. IN endpoints are called with no data and
/// return the next data to send; OUT endpoints are called with the data that was received.
/// `last_error` is the error the previous iteration hit, if it hit one.
pub trait EndpointFunction: Send + Sync {
    fn call(&self, data: Option<&[u8]>, last_error: Option<&Error>) -> Result<Vec<u8>>;
}

impl<F> EndpointFunction for F
where
    F: Fn(Option<&[u8]>, Option<&Error>) -> Result<Vec<u8>> + Send + Sync,
{
    fn call(&self, data: Option<&[u8]>, last_error: Option<&Error>) -> Result<Vec<u8>> {
        self(data, last_error)
    }
}

pub struct Configuration {
    /// The `bConfigurationValue` the host selects this configuration with.
    pub value: u8,
    /// The complete configuration descriptor, including its interface, endpoint, and class
    /// descriptors, as returned by `GET_DESCRIPTOR(CONFIGURATION)`.
    pub descriptor: Vec<u8>,
    pub endpoints: Vec<(Endpoint, Arc<dyn EndpointFunction>)>,
}

/// The device as presented to the host. Owned by the caller and lent to the control loop, which
/// updates `configuration_value` and `alternate_setting` as the host issues requests.
pub struct Device {
    pub descriptor: Vec<u8>,
    pub qualifier: Vec<u8>,
    /// String descriptors, indexed by string index. Index 0 is the language ID table.
    pub strings: Vec<Vec<u8>>,
    pub hid_report: Option<Vec<u8>>,
    pub configurations: Vec<Configuration>,
    pub configuration_value: u8,
    pub alternate_setting: u8,
    pub setup: Option<Box<dyn SetupHandler>>,
}

impl Device {
    pub fn new(descriptor: Vec<u8>) -> Device {
        Device {
            descriptor,
            qualifier: Vec::new(),
            strings: Vec::new(),
            hid_report: None,
            configurations: Vec::new(),
            configuration_value: 0,
            alternate_setting: 0,
            setup: None,
        }
    }

    pub fn add_configuration(
        &mut self,
        value: u8,
        descriptor: Vec<u8>,
        endpoints: Vec<(Endpoint, Arc<dyn EndpointFunction>)>,
    ) {
        self.configurations.push(Configuration { value, descriptor, endpoints });
    }

    /// Add a string descriptor built from `string`, returning its index. The first string added
    /// also installs the language ID table (US English) at index 0.
    pub fn add_string(&mut self, string: &str) -> u8 {
        if self.strings.is_empty() {
            self.strings.push(vec![4, usb::descriptor::DescriptorType::String as u8, 0x09, 0x04]);
        }

        let mut descriptor = vec![0, usb::descriptor::DescriptorType::String as u8];
        descriptor.extend(string.encode_utf16().take(126).flat_map(u16::to_le_bytes));
        descriptor[0] = descriptor.len() as u8;
        self.strings.push(descriptor);
        (self.strings.len() - 1) as u8
    }

    pub fn set_setup_handler<H>(&mut self, handler: H)
    where
        H: SetupHandler + 'static,
    {
        self.setup = Some(Box::new(handler));
    }

    pub fn configuration(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|configuration| configuration.value == value)
    }
}
