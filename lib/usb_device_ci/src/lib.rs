//! Device-mode driver for the ChipIdea-derived USB controllers found in NXP i.MX parts (`USBOH3`
//! / `USB_UOGx`).
//!
//! A [`Controller`] owns the register block, a [`DmaPool`] for the controller's data structures
//! and buffers, and the endpoint queue head table. [`Controller::run`] serves the control
//! endpoint and starts and stops one task per endpoint of whichever configuration the host
//! selects on the caller's [`Device`].

pub mod controller;
pub mod device;
pub mod dma;
pub mod endpoint;
pub mod error;
pub mod queue;
pub mod reg;
pub mod setup;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod task;
pub mod transfer;
pub mod wait;

pub use controller::{Config, ConfigurationChange, Controller, Poll, Session};
pub use device::{Configuration, Device, EndpointFunction, SetupHandler, SetupResponse};
pub use dma::DmaPool;
pub use endpoint::{Direction, Endpoint, TransferType};
pub use error::{Error, Result};
pub use reg::{Mmio, RegisterAccess};
pub use task::CancellationToken;
pub use transfer::Payload;
