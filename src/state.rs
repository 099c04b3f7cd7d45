//! The device lifecycle state machine: Unattached → Attached → Default →
//! Addressed → Configured, and the entry actions that run on each
//! transition.
//!
//! State is data, not a set of booleans scattered across the struct; each
//! transition is a method that takes the hardware and the collaborators it
//! needs and runs the entry action for the state it lands in.

use crate::bd::{BdManager, MAX_ENDPOINTS};
use crate::callback::Callbacks;
use crate::control::ControlEngine;
use crate::hal::{DeviceBus, EndpointControl};
use crate::{Error, Result};

/// Where the device currently sits in the USB enumeration lifecycle.
///
/// Declaration order matters: it defines the `Unattached < Attached <
/// Default < Addressed < Configured` ordering used to check that the
/// lifecycle never skips a step.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, defmt::Format)]
pub enum DeviceState {
    Unattached,
    Attached,
    Default,
    Addressed,
    Configured,
}

/// Owns device state and the transitions between states. Entry actions
/// reach into the [`DeviceBus`], the [`BdManager`] and the [`ControlEngine`]
/// as needed.
pub struct DeviceLifecycle {
    state: DeviceState,
}

impl DeviceLifecycle {
    pub const fn new() -> Self {
        Self {
            state: DeviceState::Unattached,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Disable the USB module (which also clears the SIE's suspend latch).
    pub fn enter_unattached(&mut self, bus: &mut impl DeviceBus) {
        bus.disable();
        self.state = DeviceState::Unattached;
        defmt::trace!("lifecycle: -> Unattached");
    }

    /// Enable the USB module and wait out any boot-time SE0 before treating
    /// a RESET interrupt as a real bus reset.
    pub fn enter_attached(&mut self, bus: &mut impl DeviceBus) {
        bus.clear_reset_interrupt();
        bus.enable();
        while bus.se0() {}
        bus.clear_reset_interrupt();
        self.state = DeviceState::Attached;
        defmt::trace!("lifecycle: -> Attached");
    }

    /// Disable every non-zero endpoint, arm EP0 as a bidirectional control
    /// endpoint, and reinitialize the control engine.
    pub fn enter_default(
        &mut self,
        bus: &mut impl DeviceBus,
        bd: &BdManager,
        control: &mut ControlEngine,
    ) -> Result<()> {
        for endpoint in 1..MAX_ENDPOINTS as u8 {
            bus.set_endpoint_control(endpoint, EndpointControl::DISABLED);
        }
        bus.set_endpoint_control(0, EndpointControl::CONTROL);
        control.init(bus, bd)?;
        bus.clear_packet_disable();
        self.state = DeviceState::Default;
        defmt::trace!("lifecycle: -> Default");
        Ok(())
    }

    /// A RESET interrupt: drives the device to Default from any attached
    /// state. Dropped if the device isn't attached yet.
    pub fn on_reset(
        &mut self,
        bus: &mut impl DeviceBus,
        bd: &BdManager,
        control: &mut ControlEngine,
    ) -> Result<()> {
        if self.state == DeviceState::Unattached {
            defmt::warn!("lifecycle: RESET while Unattached, dropped");
            return Ok(());
        }
        self.enter_default(bus, bd, control)
    }

    /// Commit a validated bus address and move to Addressed. Called only
    /// from the control engine, at the IN side of a SET_ADDRESS Status
    /// stage — never from SETUP parsing.
    pub(crate) fn set_address(&mut self, bus: &mut impl DeviceBus, address: u8) -> Result<()> {
        if !matches!(self.state, DeviceState::Default | DeviceState::Addressed) {
            return Err(Error::BadState);
        }
        if address == 0 || address > 127 {
            return Err(Error::BadParam);
        }
        bus.set_address(address);
        self.state = DeviceState::Addressed;
        defmt::debug!("lifecycle: address set to {}", address);
        Ok(())
    }

    /// Run the application's CONFIG callback and move to Configured (index
    /// non-zero, success) or Addressed (index zero, unconditionally).
    pub(crate) fn set_config(&mut self, callbacks: &Callbacks, index: u8) -> Result<()> {
        if !matches!(self.state, DeviceState::Addressed | DeviceState::Configured) {
            return Err(Error::BadState);
        }
        let Some(callback) = callbacks.config() else {
            defmt::warn!("lifecycle: SET_CONFIGURATION with no CONFIG callback registered");
            return Err(Error::NotImpl);
        };
        let outcome = callback(index);
        if index == 0 {
            self.state = DeviceState::Addressed;
            defmt::debug!("lifecycle: deconfigured -> Addressed");
            return Ok(());
        }
        outcome?;
        self.state = DeviceState::Configured;
        defmt::debug!("lifecycle: configured (index={})", index);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_state_for_test(&mut self, state: DeviceState) {
        self.state = state;
    }
}

impl Default for DeviceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
