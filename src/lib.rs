//! Device-side core of a USB 1.1 full-speed function stack for a
//! microcontroller with a Serial Interface Engine (SIE) and a buffer
//! descriptor table shared between the CPU and the SIE.
//!
//! This crate is the device-side counterpart of a host-side stack: instead
//! of driving a host controller through enumeration, it brings the *device*
//! itself through attach/reset/address/configure and services endpoint 0.
//! It consumes a single [`hal::DeviceBus`] implementation the integrator
//! writes for their specific SIE, and exposes a small application surface:
//! [`UsbDevice::init`], [`UsbDevice::work`], [`UsbDevice::post_event`],
//! [`UsbDevice::set_callback`] and [`UsbDevice::set_power_state`], plus the
//! buffer-descriptor I/O surface on [`bd::BdManager`] for non-EP0 endpoints.

#![no_std]

pub mod bd;
pub mod callback;
pub mod descriptor;
pub mod hal;
pub mod state;

mod control;

use bd::{BdHandle, BdManager, Direction};
use callback::{Callbacks, ConfigCallback, TransactionCallback};
use control::ControlEngine;
use descriptor::DescriptorTable;
use hal::DeviceBus;
use state::{DeviceLifecycle, DeviceState};

/// Error codes returned across the crate's ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum Error {
    /// Programmer error: a caller-supplied value was out of range or
    /// otherwise invalid. Never occurs in a correct application.
    BadParam,
    /// An invalid value arrived from the host (e.g. a SET_ADDRESS value
    /// outside 1..=127). Results in the endpoint being stalled.
    BadData,
    /// The endpoint arena could not fit a requested `bd.setup` allocation.
    NoMem,
    /// A second event arrived before `work` drained the mailbox.
    Overflow,
    /// The BD is currently owned by the SIE; retry the call later.
    Access,
    /// The request isn't implemented by this core (non-Standard requests,
    /// unrecognized Standard requests, EP0 OUT-data-stage writes).
    NotImpl,
    /// The operation isn't legal in the device's current lifecycle state.
    BadState,
    /// Generic failure (e.g. out-of-order or duplicate BD setup).
    Error,
}

/// Result type used throughout the crate.
pub type Result<T = ()> = core::result::Result<T, Error>;

/// Which callback slot a caller is registering.
pub enum Callback {
    /// Invoked from within SET_CONFIGURATION dispatch.
    Config(ConfigCallback),
    /// Invoked for every non-EP0 completion while Configured.
    Transaction(TransactionCallback),
}

/// The two sources of device power the host can be told about via
/// GET_STATUS.
#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum PowerState {
    Bus = 0,
    SelfPowered = 1,
}

/// The single-entry event mailbox.
///
/// Writers are the application (`Attached`/`Detached`, via [`UsbDevice::post_event`])
/// and the interrupt handler (`Reset`/`Transaction`, via the same method called
/// from an ISR context). A depth-1 mailbox is sufficient only because `work`
/// is called far more often than events arrive; a second event before the
/// first drains is reported as [`Error::Overflow`], never silently dropped
/// or overwritten.
#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum Event {
    None,
    Attached,
    Detached,
    Reset,
    Transaction,
}

/// The device-side USB core.
///
/// Owns the device lifecycle, the buffer descriptor manager, the endpoint-0
/// control engine, the descriptor table and the two application callback
/// slots. Generic over the integrator's [`DeviceBus`] implementation, which
/// is the only place hardware registers are touched.
pub struct UsbDevice<'d, B> {
    bus: B,
    lifecycle: DeviceLifecycle,
    bd: BdManager,
    control: ControlEngine,
    descriptors: DescriptorTable<'d>,
    callbacks: Callbacks,
    event: Event,
}

impl<'d, B: DeviceBus> UsbDevice<'d, B> {
    /// Construct the core around a HAL implementation and a descriptor
    /// table. Does not touch hardware; call [`UsbDevice::init`] before
    /// anything else.
    pub const fn new(bus: B, descriptors: DescriptorTable<'d>) -> Self {
        Self {
            bus,
            lifecycle: DeviceLifecycle::new(),
            bd: BdManager::new(),
            control: ControlEngine::new(),
            descriptors,
            callbacks: Callbacks::new(),
            event: Event::None,
        }
    }

    /// Zero all state, initialize the BD table, allocate EP0's 8-byte
    /// OUT/IN buffers, and transition to Unattached. Must be called first,
    /// before `post_event(Attached)` or any `setup_endpoint` calls for
    /// non-zero endpoints.
    pub fn init(&mut self) -> Result<()> {
        self.bd.init(&mut self.bus);
        self.bd.setup(&mut self.bus, 0, Direction::Out, 8)?;
        self.bd.setup(&mut self.bus, 0, Direction::In, 8)?;
        self.callbacks = Callbacks::new();
        self.event = Event::None;
        self.lifecycle.enter_unattached(&mut self.bus);
        defmt::debug!("usb: init");
        Ok(())
    }

    /// Must precede the first GET_STATUS the host can send.
    pub fn set_power_state(&mut self, state: PowerState) {
        self.control.set_power_state(state);
    }

    /// Register a callback. Re-registering a slot overwrites it; only one
    /// callback per slot is kept.
    pub fn set_callback(&mut self, callback: Callback) {
        match callback {
            Callback::Config(f) => self.callbacks.set_config(f),
            Callback::Transaction(f) => self.callbacks.set_transaction(f),
        }
    }

    /// Set up a non-zero endpoint's buffer. Must be called OUT-before-IN,
    /// in ascending endpoint order, after `init`.
    pub fn setup_endpoint(&mut self, endpoint: u8, direction: Direction, size: u16) -> Result<BdHandle> {
        self.bd.setup(&mut self.bus, endpoint, direction, size)
    }

    /// Borrow the buffer descriptor manager, for the non-EP0 I/O surface
    /// (`get_buf`/`send`/`receive`/`stall`/`set_sync`/`get_sent`/`get_pid`).
    pub fn bd(&mut self) -> (&BdManager, &mut B) {
        (&self.bd, &mut self.bus)
    }

    /// The device's current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.lifecycle.state()
    }

    /// Post an event into the single-slot mailbox. The application calls
    /// this with `Attached`/`Detached` from its sense-pin debouncer; an
    /// interrupt handler calls it with `Reset`/`Transaction`.
    ///
    /// Fails with [`Error::Overflow`] if a prior event hasn't yet been
    /// drained by [`UsbDevice::work`] — the caller should retry after the
    /// next `work` call.
    pub fn post_event(&mut self, event: Event) -> Result<()> {
        if !matches!(self.event, Event::None) {
            defmt::warn!("usb: event mailbox overflow, dropping {}", event);
            return Err(Error::Overflow);
        }
        self.event = event;
        Ok(())
    }

    /// Drain the event mailbox, dispatch its handler, then poll the
    /// interrupt-status register and post any newly observed interrupts as
    /// events, one pass at a time, until a pass finds nothing left to do.
    /// Call frequently.
    pub fn work(&mut self) -> Result<()> {
        loop {
            let event = core::mem::replace(&mut self.event, Event::None);

            match event {
                Event::None => {}
                Event::Attached => self.lifecycle.enter_attached(&mut self.bus),
                Event::Detached => self.lifecycle.enter_unattached(&mut self.bus),
                Event::Reset => {
                    self.lifecycle
                        .on_reset(&mut self.bus, &self.bd, &mut self.control)?;
                }
                Event::Transaction => self.handle_transaction()?,
            }

            let status = self.bus.interrupt_status();
            if status.reset {
                self.bus.clear_reset_interrupt();
                self.post_event(Event::Reset).ok();
            }
            if status.transaction {
                // The TRN interrupt bit is deliberately left uncleared here:
                // clearing it advances the SIE's completion FIFO, which must
                // only happen after `handle_transaction` has read the
                // current entry's identity. It is cleared by
                // `handle_transaction` itself, on the next pass through
                // this loop.
                self.post_event(Event::Transaction).ok();
            }

            if matches!(self.event, Event::None) {
                return Ok(());
            }
        }
    }

    fn handle_transaction(&mut self) -> Result<()> {
        let handle = self.bd.handle_for_transaction(&mut self.bus);
        let result = if handle.endpoint() == 0 {
            self.control.handle_transaction(
                &mut self.bus,
                &self.bd,
                &self.descriptors,
                &mut self.lifecycle,
                &self.callbacks,
                handle,
            )
        } else if self.lifecycle.state() == DeviceState::Configured {
            if let Some(callback) = self.callbacks.transaction() {
                callback(handle);
            }
            Ok(())
        } else {
            defmt::warn!("usb: transaction on ep {} while not configured, ignored", handle.endpoint());
            Ok(())
        };
        self.bus.clear_transaction_interrupt();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use descriptor::{DescriptorEntry, TYPE_CONFIGURATION, TYPE_DEVICE};
    use hal::fake::FakeBus;

    const DEVICE_DESCRIPTOR: [u8; 18] = [
        0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0, 0,
        0, 1,
    ];
    const CONFIG_DESCRIPTOR: [u8; 9] = [0x09, 0x02, 0x09, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32];

    static ENTRIES: [DescriptorEntry; 2] = [
        DescriptorEntry::new(TYPE_DEVICE, 0, &DEVICE_DESCRIPTOR),
        DescriptorEntry::new(TYPE_CONFIGURATION, 0, &CONFIG_DESCRIPTOR),
    ];

    fn device() -> UsbDevice<'static, FakeBus> {
        let mut dev = UsbDevice::new(FakeBus::new(), DescriptorTable::new(&ENTRIES));
        dev.init().unwrap();
        dev
    }

    #[test]
    fn lifecycle_reaches_default_after_attach_and_reset() {
        let mut dev = device();
        assert_eq!(dev.state(), DeviceState::Unattached);
        dev.post_event(Event::Attached).unwrap();
        dev.work().unwrap();
        assert_eq!(dev.state(), DeviceState::Attached);
        dev.post_event(Event::Reset).unwrap();
        dev.work().unwrap();
        assert_eq!(dev.state(), DeviceState::Default);
    }

    #[test]
    fn event_mailbox_overflow_then_recovers_after_drain() {
        let mut dev = device();
        dev.post_event(Event::Reset).unwrap();
        assert_eq!(dev.post_event(Event::Transaction).unwrap_err(), Error::Overflow);
        dev.work().unwrap();
        dev.post_event(Event::Transaction).unwrap();
    }

    #[test]
    fn work_drains_the_whole_mailbox_in_one_call() {
        let mut dev = device();
        dev.post_event(Event::Attached).unwrap();
        dev.work().unwrap();
        // The mailbox is empty again: a second post succeeds immediately,
        // without needing another `work` call first to make room.
        dev.post_event(Event::Reset).unwrap();
    }

    #[test]
    fn setup_endpoint_before_init_order_enforced() {
        let mut dev = device();
        dev.post_event(Event::Attached).unwrap();
        dev.work().unwrap();
        dev.post_event(Event::Reset).unwrap();
        dev.work().unwrap();
        assert!(dev.setup_endpoint(1, Direction::Out, 8).is_ok());
        assert!(dev.setup_endpoint(1, Direction::In, 8).is_ok());
    }

    #[test]
    fn power_state_round_trips_through_get_status() {
        let mut dev = device();
        dev.set_power_state(PowerState::SelfPowered);
        dev.post_event(Event::Attached).unwrap();
        dev.work().unwrap();
        dev.post_event(Event::Reset).unwrap();
        dev.work().unwrap();

        let out = BdManager::handle_for_endpoint(0, Direction::Out);
        let (bd, bus) = dev.bd();
        let idx = out.into_raw();
        let addr = bus.bd_table()[idx].addr as usize;
        bus.endpoint_arena()[addr..addr + 8]
            .copy_from_slice(&[0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00]);
        bus.bd_table()[idx].set_total_count(8);
        bus.bd_table()[idx].stat |= bd::PID_SETUP << 2;
        bus.bd_table()[idx].set_uown(false);

        dev.post_event(Event::Transaction).unwrap();
        dev.work().unwrap();

        let inh = BdManager::handle_for_endpoint(0, Direction::In);
        let (_bd, bus) = dev.bd();
        let addr = bus.bd_table()[inh.into_raw()].addr as usize;
        assert_eq!(&bus.endpoint_arena()[addr..addr + 2], &[1, 0]);
    }
}
