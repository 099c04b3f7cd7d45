//! Interface for host MCU hardware (the Serial Interface Engine and its
//! shared memory).
//!
//! In order to use this crate on a given microcontroller, there must be a
//! [`DeviceBus`] implementation specific to that device.
//!
//! This trait is the boundary named in the crate's design: hardware register
//! bit-twiddling lives on the other side of it, in the integrator's HAL. This
//! crate only ever calls these methods; it never assumes a particular
//! register layout.

use crate::bd::{BdSlot, Direction, MAX_BDS};

/// Interrupt conditions the SIE can report.
///
/// Both fields may be set in the same poll; the device core handles `reset`
/// before `transaction`, giving a bus reset priority over whatever was
/// in flight.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InterruptStatus {
    /// A RESET condition (SE0 for the qualification interval) was seen on
    /// the bus.
    pub reset: bool,
    /// At least one buffer descriptor transaction has completed and is
    /// waiting to be read out of the SIE's completion FIFO.
    pub transaction: bool,
}

/// Configuration written to a single endpoint's control register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointControl {
    /// Endpoint responds with handshake packets (ACK/NAK/STALL).
    pub handshake: bool,
    /// Endpoint accepts control transfers (SETUP tokens bypass STALL).
    pub control: bool,
    /// OUT direction is enabled.
    pub out_enabled: bool,
    /// IN direction is enabled.
    pub in_enabled: bool,
}

impl EndpointControl {
    /// The configuration for a disabled endpoint.
    pub const DISABLED: Self = Self {
        handshake: false,
        control: false,
        out_enabled: false,
        in_enabled: false,
    };

    /// The configuration for endpoint 0: bidirectional control with
    /// handshaking enabled.
    pub const CONTROL: Self = Self {
        handshake: true,
        control: true,
        out_enabled: true,
        in_enabled: true,
    };
}

/// The hardware contract the device core and BD manager are built against.
///
/// Everything here is pure I/O with no policy: deciding *when* to enable the
/// module, *what* to write to an endpoint's control register, and *how* to
/// interpret a completed transaction belongs to the core, not to this trait.
pub trait DeviceBus {
    /// Enable the USB module (pull-up, transceiver, packet processing).
    fn enable(&mut self);

    /// Disable the USB module.
    fn disable(&mut self);

    /// Borrow the buffer descriptor table: memory shared between the CPU
    /// and the SIE. Index `i` corresponds to [`BdHandle::into_raw`](crate::bd::BdHandle::into_raw) `== i`.
    fn bd_table(&mut self) -> &mut [BdSlot; MAX_BDS];

    /// Borrow the endpoint memory arena: a second shared-memory region that
    /// buffer addresses are allocated from.
    fn endpoint_arena(&mut self) -> &mut [u8];

    /// Read (without clearing) the pending interrupt conditions.
    fn interrupt_status(&mut self) -> InterruptStatus;

    /// Clear the RESET interrupt. Safe to call immediately, unlike
    /// [`DeviceBus::clear_transaction_interrupt`].
    fn clear_reset_interrupt(&mut self);

    /// Clear the TRANSACTION interrupt, advancing the SIE's completion FIFO
    /// to the next entry.
    ///
    /// Must only be called after the current completion has been fully read
    /// via [`DeviceBus::last_transaction`] and the corresponding BD fields —
    /// clearing earlier invalidates the data this poll cycle is reading.
    fn clear_transaction_interrupt(&mut self);

    /// Read the bus's current Single-Ended-Zero condition.
    ///
    /// Used only while entering the Attached state, to avoid mistaking a
    /// boot-time SE0 for a bus reset.
    fn se0(&self) -> bool;

    /// Identify the `(endpoint, direction)` of the most recently completed
    /// transaction, from the SIE's USTAT-equivalent register.
    fn last_transaction(&self) -> (u8, Direction);

    /// Write the device's bus address.
    fn set_address(&mut self, address: u8);

    /// Configure one endpoint's control register.
    fn set_endpoint_control(&mut self, endpoint: u8, control: EndpointControl);

    /// Clear the packet-disable latch that the SIE sets on every SETUP
    /// token, re-enabling packet processing.
    fn clear_packet_disable(&mut self);
}
