use crate::{
    device::Device,
    dma::DmaPool,
    endpoint::Direction,
    error::Result,
    queue::QueueHeadTable,
    reg::{endpoint_bit, Command, Mode, OtgStatusControl, Register, RegisterAccess, Status, CONTROLLER_MODE_DEVICE},
    task::{CancellationToken, TaskGroup},
    transfer::AbandonedChain,
    wait::{spin_until, wait_for, WaitLimit},
};
use log::{debug, info, warn};
use spinning_top::Spinlock;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use usb::setup::SetupPacket;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// How long a transfer on the control endpoint may wait for the controller.
    pub control_timeout: Duration,
    /// How long the control loop waits for a setup packet before checking for a bus reset again.
    pub setup_poll_interval: Duration,
    /// How long a completed control transfer may wait for its descriptors to be retired.
    pub descriptor_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            control_timeout: Duration::from_millis(20),
            setup_poll_interval: Duration::from_millis(10),
            descriptor_timeout: Duration::from_secs(1),
        }
    }
}

pub struct Controller<R>
where
    R: RegisterAccess,
{
    pub(crate) registers: R,
    pub(crate) dma: Arc<DmaPool>,
    pub(crate) queue_heads: QueueHeadTable,
    pub(crate) config: Config,

    /// Held while changing the controller's mode, the queue head table, or endpoint control
    /// registers. Transfers themselves don't take it.
    pub(crate) structure: Spinlock<()>,
    /// Completions reported through [`Controller::notify_completion`], as `ENDPTCOMPLETE` bits.
    pub(crate) completions: AtomicU32,
    /// Never cancelled. Used for transfers that aren't part of an endpoint task.
    pub(crate) control: CancellationToken,
    /// Chains of abandoned transfers that the controller hadn't let go of yet.
    pub(crate) abandoned: Spinlock<Vec<AbandonedChain>>,
}

impl<R> Controller<R>
where
    R: RegisterAccess,
{
    pub fn new(registers: R, dma: Arc<DmaPool>, config: Config) -> Result<Controller<R>> {
        let queue_heads = QueueHeadTable::allocate(&dma)?;

        Ok(Controller {
            registers,
            dma,
            queue_heads,
            config,
            structure: Spinlock::new(()),
            completions: AtomicU32::new(0),
            control: CancellationToken::new(),
            abandoned: Spinlock::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reset the controller and bring it up as a device, with the control endpoint ready to
    /// receive setup packets.
    pub fn enter_device_mode(&self) {
        let _guard = self.structure.lock();
        let registers = &self.registers;

        registers.modify(Register::Command, |command| (Command::from_bits_retain(command) | Command::RESET).bits());
        spin_until(|| !Command::from_bits_retain(registers.read(Register::Command)).contains(Command::RESET));

        /*
         * Device mode only, with setup lockout off: a setup packet that arrives while we're still
         * reading the last one just overwrites it.
         */
        let mode = Mode::from_bits_retain(registers.read(Register::Mode))
            .with_controller_mode(CONTROLLER_MODE_DEVICE)
            .union(Mode::SETUP_LOCKOUT_OFF)
            .difference(Mode::STREAM_DISABLE);
        registers.write(Register::Mode, mode.bits());
        spin_until(|| Mode::from_bits_retain(registers.read(Register::Mode)).controller_mode() == CONTROLLER_MODE_DEVICE);

        self.queue_heads.initialize(&self.dma, registers);
        self.queue_heads.configure(&self.dma, 0, Direction::Out, 64, true, 0);
        self.queue_heads.configure(&self.dma, 0, Direction::In, 64, true, 0);

        registers.modify(Register::OtgStatusControl, |otg| {
            (OtgStatusControl::from_bits_retain(otg) | OtgStatusControl::OTG_TERMINATION).bits()
        });
        registers.write(Register::Status, registers.read(Register::Status));
        registers.modify(Register::Command, |command| (Command::from_bits_retain(command) | Command::RUN).bits());

        info!("USB controller running in device mode");
    }

    /// Whether the host has signalled a bus reset since the last call to [`Controller::reset`].
    pub fn bus_reset_pending(&self) -> bool {
        Status::from_bits_retain(self.registers.read(Register::Status)).contains(Status::RESET_RECEIVED)
    }

    /// Respond to a bus reset: discard pending setup packets and completions, abandon everything
    /// queued on every endpoint, and go back to the default address.
    pub fn reset(&self) {
        let _guard = self.structure.lock();
        let registers = &self.registers;

        registers.write(Register::EndpointSetupStatus, registers.read(Register::EndpointSetupStatus));
        registers.write(Register::EndpointComplete, registers.read(Register::EndpointComplete));
        self.completions.store(0, Ordering::Release);

        if wait_for(WaitLimit::Deadline(self.config.control_timeout), || registers.read(Register::EndpointPrime) == 0)
            .is_err()
        {
            warn!("Endpoint priming still pending during bus reset");
        }

        registers.write(Register::EndpointFlush, 0xffff_ffff);
        spin_until(|| registers.read(Register::EndpointFlush) == 0);
        self.reclaim_abandoned();

        registers.write(Register::Status, Status::RESET_RECEIVED.bits());
        registers.write(Register::DeviceAddress, 0);

        info!("USB bus reset");
    }

    /// Report that the controller has completed a transfer on an endpoint. Called from the
    /// interrupt path, which may have already acknowledged the `ENDPTCOMPLETE` bit itself.
    pub fn notify_completion(&self, endpoint: u8, direction: Direction) {
        self.completions.fetch_or(endpoint_bit(endpoint, direction), Ordering::AcqRel);
    }

    pub(crate) fn is_complete(&self, bit: u32) -> bool {
        self.registers.read(Register::EndpointComplete) & bit != 0 || self.completions.load(Ordering::Acquire) & bit != 0
    }

    pub(crate) fn clear_complete(&self, bit: u32) {
        self.registers.write(Register::EndpointComplete, bit);
        self.completions.fetch_and(!bit, Ordering::AcqRel);
    }
}

/// State the control loop carries between iterations: which configuration is running, and the
/// tasks serving its endpoints.
#[derive(Default)]
pub struct Session {
    configuration: u8,
    endpoints: Option<TaskGroup>,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Stop the running configuration's endpoint tasks, returning how each exited.
    pub fn shutdown(&mut self) -> Vec<Result<()>> {
        self.configuration = 0;
        self.endpoints.take().map(TaskGroup::cancel_and_join).unwrap_or_default()
    }
}

/// What one iteration of the control loop did.
#[derive(Debug, Default)]
pub struct Poll {
    pub bus_reset: bool,
    /// The setup packet that was handled, and how handling it went.
    pub setup: Option<(SetupPacket, Result<()>)>,
    pub configuration: Option<ConfigurationChange>,
}

#[derive(Debug)]
pub struct ConfigurationChange {
    pub value: u8,
    /// How each of the previous configuration's endpoint tasks exited.
    pub stopped: Vec<Result<()>>,
    /// The number of endpoint tasks started for the new configuration.
    pub started: Result<usize>,
}

impl<R> Controller<R>
where
    R: RegisterAccess + 'static,
{
    /// Run one iteration of the control loop: handle a bus reset if one happened, handle a setup
    /// packet if one arrives within the poll interval, and restart the endpoint tasks if the
    /// device's configuration changed.
    pub fn poll(self: &Arc<Self>, device: &mut Device, session: &mut Session) -> Poll {
        let mut poll = Poll::default();

        if self.bus_reset_pending() {
            device.configuration_value = 0;
            self.reset();
            poll.bus_reset = true;
        }

        if self.wait_for_setup() {
            let setup = self.get_setup();
            let result = self.handle_setup(device, &setup);
            if let Err(err) = &result {
                warn!("Setup request {:?} failed: {}", setup, err);
            }
            poll.setup = Some((setup, result));
        }

        if device.configuration_value != session.configuration {
            poll.configuration = Some(self.change_configuration(device, session));
        }

        poll
    }

    /// Serve the host forever.
    pub fn run(self: &Arc<Self>, device: &mut Device) -> ! {
        let mut session = Session::new();
        loop {
            self.poll(device, &mut session);
        }
    }

    fn change_configuration(self: &Arc<Self>, device: &Device, session: &mut Session) -> ConfigurationChange {
        let value = device.configuration_value;
        debug!("Switching from configuration {} to {}", session.configuration, value);

        let stopped = session.shutdown();
        let started = match self.start_endpoints(device, value) {
            Ok(group) => {
                let started = group.len();
                session.endpoints = Some(group);
                Ok(started)
            }
            Err(err) => {
                warn!("Failed to start configuration {}: {}", value, err);
                Err(err)
            }
        };
        session.configuration = value;

        ConfigurationChange { value, stopped, started }
    }
}
