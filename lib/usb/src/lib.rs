#![no_std]

pub mod descriptor;
pub mod hid;
pub mod setup;

/// Requests defined by the CDC Ethernet Control Model that a network-function device is expected
/// to accept on its control endpoint.
pub mod cdc {
    pub const SET_ETHERNET_PACKET_FILTER: u8 = 0x43;
}
