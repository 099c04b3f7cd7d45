//! The control-transfer engine on endpoint 0: the SETUP/DATA/STATUS state
//! machine, descriptor lookup, and the handful of standard requests needed
//! to enumerate.
//!
//! The transfer state is an explicit enum matched exhaustively, with a
//! `trace!`/`warn!` on every transition, so a log replay tells the whole
//! story of a control transfer without attaching a bus analyzer.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

/// Decode the eight-byte SETUP packet into a [`Request`].
///
/// `usb_device::control::Request::parse` is private to that crate — it is
/// meant to be called only by `usb_device`'s own `UsbDevice::poll`, which we
/// bypass entirely since the SIE hands us raw SETUP bytes directly. This is
/// the same bitfield layout `usb_ctl.c`'s `usbCtlRequestType` union decodes.
fn parse_setup(raw: &[u8; 8]) -> Request {
    let bm_request_type = raw[0];
    let direction = if bm_request_type & 0x80 != 0 {
        UsbDirection::In
    } else {
        UsbDirection::Out
    };
    let request_type = match (bm_request_type >> 5) & 0b11 {
        0 => RequestType::Standard,
        1 => RequestType::Class,
        2 => RequestType::Vendor,
        _ => RequestType::Reserved,
    };
    let recipient = match bm_request_type & 0b1_1111 {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    Request {
        direction,
        request_type,
        recipient,
        request: raw[1],
        value: u16::from_le_bytes([raw[2], raw[3]]),
        index: u16::from_le_bytes([raw[4], raw[5]]),
        length: u16::from_le_bytes([raw[6], raw[7]]),
    }
}

use crate::bd::{BdHandle, BdManager, DataToggle, Direction, PID_SETUP};
use crate::callback::Callbacks;
use crate::descriptor::DescriptorTable;
use crate::hal::DeviceBus;
use crate::state::DeviceLifecycle;
use crate::{Error, PowerState, Result};

/// Where the bytes of an in-flight Data-In stage come from.
enum DataSource {
    /// A descriptor table entry.
    Rom { data: &'static [u8], offset: usize },
    /// The small RAM staging buffer used for GET_STATUS.
    Ram { data: [u8; 2], offset: usize },
}

impl DataSource {
    fn read_into(&mut self, out: &mut [u8]) {
        let len = out.len();
        match self {
            DataSource::Rom { data, offset } => {
                out.copy_from_slice(&data[*offset..*offset + len]);
                *offset += len;
            }
            DataSource::Ram { data, offset } => {
                out.copy_from_slice(&data[*offset..*offset + len]);
                *offset += len;
            }
        }
    }
}

/// The three control-transfer stages, tagged with the transfer's overall
/// direction (the direction of the SETUP packet's data phase — In for
/// reads, Out for writes and no-data transfers).
#[derive(Copy, Clone, PartialEq, Eq, defmt::Format)]
enum Stage {
    Setup,
    Data(UsbDirection),
    Status(UsbDirection),
}

/// The outcome of dispatching a parsed standard request: either a Data-In
/// stage to arm, or a direct Status-only acknowledgement.
enum Plan {
    DataIn { source: DataSource, length: u16 },
    StatusOnly,
}

/// Owns the EP0 transfer state. Talks to the [`BdManager`] for all actual
/// I/O, and to [`DeviceLifecycle`] only to commit SET_ADDRESS/
/// SET_CONFIGURATION once their control transfer's Status stage completes.
pub struct ControlEngine {
    stage: Stage,
    out_handle: BdHandle,
    in_handle: BdHandle,
    source: Option<DataSource>,
    bytes_to_transfer: u16,
    power_state: PowerState,
    status_buf: [u8; 2],
    pending_address: u8,
}

impl ControlEngine {
    pub const fn new() -> Self {
        Self {
            stage: Stage::Setup,
            out_handle: BdHandle::zero(),
            in_handle: BdHandle::zero(),
            source: None,
            bytes_to_transfer: 0,
            power_state: PowerState::Bus,
            status_buf: [0; 2],
            pending_address: 0,
        }
    }

    pub fn set_power_state(&mut self, state: PowerState) {
        self.power_state = state;
    }

    /// Resolve EP0's handles and stall both, so only the next SETUP token
    /// (which bypasses STALL) is accepted. Does not touch `power_state`,
    /// which may already have been configured by the application.
    pub fn init(&mut self, bus: &mut impl DeviceBus, bd: &BdManager) -> Result<()> {
        self.out_handle = BdManager::handle_for_endpoint(0, Direction::Out);
        self.in_handle = BdManager::handle_for_endpoint(0, Direction::In);
        self.stage = Stage::Setup;
        self.source = None;
        self.bytes_to_transfer = 0;
        self.pending_address = 0;
        bd.stall(bus, self.out_handle)?;
        bd.stall(bus, self.in_handle)?;
        defmt::trace!("control: init");
        Ok(())
    }

    /// Entry point for any EP0 completion.
    pub fn handle_transaction(
        &mut self,
        bus: &mut impl DeviceBus,
        bd: &BdManager,
        descriptors: &DescriptorTable,
        lifecycle: &mut DeviceLifecycle,
        callbacks: &Callbacks,
        handle: BdHandle,
    ) -> Result<()> {
        if handle == self.in_handle {
            self.handle_in(bus, bd, lifecycle)
        } else {
            let pid = bd.get_pid(bus, self.out_handle)?;
            if pid == PID_SETUP {
                self.stage = Stage::Setup;
                self.source = None;
                bd.stall(bus, self.in_handle)?;
                let result = self.parse_and_dispatch(bus, bd, descriptors, lifecycle, callbacks);
                bus.clear_packet_disable();
                result
            } else {
                self.handle_out(bus, bd)
            }
        }
    }

    fn parse_and_dispatch(
        &mut self,
        bus: &mut impl DeviceBus,
        bd: &BdManager,
        descriptors: &DescriptorTable,
        lifecycle: &mut DeviceLifecycle,
        callbacks: &Callbacks,
    ) -> Result<()> {
        let (buf, size) = bd.get_buf(bus, self.out_handle)?;
        if size != 8 {
            defmt::warn!("control: malformed SETUP packet, size={}", size);
            bd.stall(bus, self.out_handle)?;
            return Err(Error::BadData);
        }
        let raw: [u8; 8] = buf[..8].try_into().unwrap();
        let request = parse_setup(&raw);

        match self.dispatch_standard(&request, descriptors, lifecycle, callbacks) {
            Ok(plan) => self.arm_stage(bus, bd, plan),
            Err(err) => {
                defmt::warn!("control: request rejected: {}", err);
                bd.stall(bus, self.out_handle)?;
                Err(err)
            }
        }
    }

    fn dispatch_standard(
        &mut self,
        request: &Request,
        descriptors: &DescriptorTable,
        lifecycle: &mut DeviceLifecycle,
        callbacks: &Callbacks,
    ) -> Result<Plan> {
        if request.request_type != RequestType::Standard {
            return Err(Error::NotImpl);
        }
        match request.request {
            Request::GET_STATUS if request.recipient == Recipient::Device => {
                self.status_buf = [self.power_state as u8, 0];
                Ok(Plan::DataIn {
                    source: DataSource::Ram {
                        data: self.status_buf,
                        offset: 0,
                    },
                    length: 2,
                })
            }
            Request::SET_ADDRESS => {
                if request.value == 0 || request.value > 127 {
                    return Err(Error::BadData);
                }
                self.pending_address = request.value as u8;
                Ok(Plan::StatusOnly)
            }
            Request::GET_DESCRIPTOR => {
                let descriptor_type = (request.value >> 8) as u8;
                let index = request.value as u8;
                let entry = descriptors
                    .find(descriptor_type, index)
                    .ok_or(Error::BadParam)?;
                let length = core::cmp::min(request.length, entry.size());
                Ok(Plan::DataIn {
                    source: DataSource::Rom {
                        data: entry.data,
                        offset: 0,
                    },
                    length,
                })
            }
            Request::SET_CONFIGURATION => {
                let index = request.value as u8;
                lifecycle.set_config(callbacks, index)?;
                Ok(Plan::StatusOnly)
            }
            _ => Err(Error::NotImpl),
        }
    }

    fn arm_stage(&mut self, bus: &mut impl DeviceBus, bd: &BdManager, plan: Plan) -> Result<()> {
        // The IN handle was stalled (SIE-owned) on entry to every SETUP;
        // claim it back before writing or queueing anything on it.
        bd.claim(bus, self.in_handle);
        match plan {
            Plan::DataIn { source, length } => {
                self.source = Some(source);
                self.bytes_to_transfer = length;
                self.stage = Stage::Data(UsbDirection::In);
                bd.set_sync(bus, self.in_handle, true, DataToggle::Data1)?;
                self.load_and_send(bus, bd)?;
                bd.set_sync(bus, self.out_handle, true, DataToggle::Data1)?;
                bd.receive(bus, self.out_handle)?;
            }
            Plan::StatusOnly => {
                self.stage = Stage::Status(UsbDirection::Out);
                bd.send(bus, self.in_handle, 0)?;
                bd.stall(bus, self.out_handle)?;
            }
        }
        Ok(())
    }

    fn load_and_send(&mut self, bus: &mut impl DeviceBus, bd: &BdManager) -> Result<()> {
        let (buf, capacity) = bd.get_buf(bus, self.in_handle)?;
        let chunk = core::cmp::min(self.bytes_to_transfer, capacity) as usize;
        if let Some(source) = &mut self.source {
            source.read_into(&mut buf[..chunk]);
        }
        bd.send(bus, self.in_handle, chunk as u16)?;
        self.bytes_to_transfer -= chunk as u16;
        Ok(())
    }

    fn handle_in(
        &mut self,
        bus: &mut impl DeviceBus,
        bd: &BdManager,
        lifecycle: &mut DeviceLifecycle,
    ) -> Result<()> {
        match self.stage {
            Stage::Data(UsbDirection::In) => {
                let capacity = bd.size(bus, self.in_handle)?;
                let sent = bd.get_sent(bus, self.in_handle)?;
                if sent < capacity {
                    if self.bytes_to_transfer == 0 {
                        self.stage = Stage::Status(UsbDirection::In);
                    } else {
                        defmt::warn!(
                            "control: short IN packet with {} bytes still pending, resetting",
                            self.bytes_to_transfer
                        );
                        self.stage = Stage::Setup;
                    }
                    bd.stall(bus, self.in_handle)?;
                    Ok(())
                } else {
                    self.load_and_send(bus, bd)
                }
            }
            Stage::Data(UsbDirection::Out) => {
                defmt::warn!("control: premature IN token during OUT data stage");
                self.stage = Stage::Setup;
                Ok(())
            }
            Stage::Status(UsbDirection::Out) => {
                defmt::trace!("control: status-in complete (control-write/no-data)");
                self.stage = Stage::Setup;
                if self.pending_address != 0 {
                    lifecycle.set_address(bus, self.pending_address)?;
                    self.pending_address = 0;
                }
                Ok(())
            }
            _ => {
                defmt::warn!("control: unexpected IN completion in stage {}", self.stage);
                bd.stall(bus, self.in_handle)
            }
        }
    }

    fn handle_out(&mut self, bus: &mut impl DeviceBus, bd: &BdManager) -> Result<()> {
        let result = match self.stage {
            Stage::Data(UsbDirection::Out) => {
                defmt::warn!("control: OUT data stage unimplemented");
                self.stage = Stage::Setup;
                Err(Error::NotImpl)
            }
            Stage::Data(UsbDirection::In) => {
                defmt::warn!("control: premature OUT token during IN data stage");
                self.stage = Stage::Setup;
                Ok(())
            }
            Stage::Status(UsbDirection::In) => {
                defmt::trace!("control: status-out complete (control-read)");
                self.stage = Stage::Setup;
                Ok(())
            }
            Stage::Setup => Ok(()),
        };
        bd.stall(bus, self.out_handle)?;
        result
    }
}

impl Default for ControlEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bd::BdManager;
    use crate::hal::fake::FakeBus;

    const DEVICE_DESCRIPTOR: [u8; 18] = [
        0x12, 0x01, 0x10, 0x01, 0x00, 0x00, 0x00, 0x08, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0, 0,
        0, 1,
    ];

    fn harness() -> (BdManager, FakeBus, ControlEngine, DescriptorTable<'static>) {
        use crate::descriptor::{DescriptorEntry, TYPE_DEVICE};
        static ENTRIES: [DescriptorEntry; 1] =
            [DescriptorEntry::new(TYPE_DEVICE, 0, &DEVICE_DESCRIPTOR)];

        let mut bd = BdManager::new();
        let mut bus = FakeBus::new();
        bd.init(&mut bus);
        bd.setup(&mut bus, 0, Direction::Out, 8).unwrap();
        bd.setup(&mut bus, 0, Direction::In, 8).unwrap();
        let mut control = ControlEngine::new();
        control.init(&mut bus, &bd).unwrap();
        (bd, bus, control, DescriptorTable::new(&ENTRIES))
    }

    fn deliver_setup(bd: &BdManager, bus: &mut FakeBus, packet: [u8; 8]) {
        let out = BdManager::handle_for_endpoint(0, Direction::Out);
        let idx = out.into_raw();
        let addr = bus.bd_table()[idx].addr as usize;
        bus.endpoint_arena()[addr..addr + 8].copy_from_slice(&packet);
        bus.bd_table()[idx].set_total_count(8);
        bus.bd_table()[idx].stat |= (PID_SETUP) << 2;
        bus.bd_table()[idx].set_uown(false);
        let _ = bd;
    }

    fn complete_in(bus: &mut FakeBus, handle: BdHandle, sent: u16) {
        let idx = handle.into_raw();
        bus.bd_table()[idx].set_total_count(sent);
        bus.bd_table()[idx].set_uown(false);
    }

    #[test]
    fn get_device_descriptor() {
        let (bd, mut bus, mut control, descriptors) = harness();
        let mut lifecycle = DeviceLifecycle::new();
        let callbacks = Callbacks::new();
        let out = BdManager::handle_for_endpoint(0, Direction::Out);
        let inh = BdManager::handle_for_endpoint(0, Direction::In);

        deliver_setup(&bd, &mut bus, [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, out)
            .unwrap();

        // First 8-byte chunk of the 18-byte descriptor should be armed on IN.
        assert!(bus.bd_table()[inh.into_raw()].uown());
        assert_eq!(control.bytes_to_transfer, 10);

        complete_in(&mut bus, inh, 8);
        control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, inh)
            .unwrap();
        assert_eq!(control.bytes_to_transfer, 2);

        complete_in(&mut bus, inh, 2);
        control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, inh)
            .unwrap();
        assert_eq!(control.stage, Stage::Status(UsbDirection::In));

        // Host ACKs with a zero-length OUT.
        let idx = out.into_raw();
        bus.bd_table()[idx].set_total_count(0);
        bus.bd_table()[idx].set_uown(false);
        control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, out)
            .unwrap();
        assert_eq!(control.stage, Stage::Setup);
    }

    #[test]
    fn set_address_commits_only_after_status_in_completes() {
        let (bd, mut bus, mut control, descriptors) = harness();
        let mut lifecycle = DeviceLifecycle::new();
        lifecycle.set_state_for_test(crate::state::DeviceState::Default);
        let callbacks = Callbacks::new();
        let out = BdManager::handle_for_endpoint(0, Direction::Out);
        let inh = BdManager::handle_for_endpoint(0, Direction::In);

        deliver_setup(&bd, &mut bus, [0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00]);
        control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, out)
            .unwrap();
        assert_eq!(bus.address, 0);
        assert!(bus.bd_table()[inh.into_raw()].uown());

        complete_in(&mut bus, inh, 0);
        control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, inh)
            .unwrap();
        assert_eq!(bus.address, 42);
        assert_eq!(lifecycle.state(), crate::state::DeviceState::Addressed);
    }

    #[test]
    fn bad_set_address_value_stalls_and_does_not_change_state() {
        let (bd, mut bus, mut control, descriptors) = harness();
        let mut lifecycle = DeviceLifecycle::new();
        let callbacks = Callbacks::new();
        let out = BdManager::handle_for_endpoint(0, Direction::Out);

        deliver_setup(&bd, &mut bus, [0x00, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        let err = control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, out)
            .unwrap_err();
        assert_eq!(err, Error::BadData);
        assert!(bus.bd_table()[out.into_raw()].uown());
    }

    #[test]
    fn unknown_descriptor_is_bad_param() {
        let (bd, mut bus, mut control, descriptors) = harness();
        let mut lifecycle = DeviceLifecycle::new();
        let callbacks = Callbacks::new();
        let out = BdManager::handle_for_endpoint(0, Direction::Out);

        deliver_setup(&bd, &mut bus, [0x80, 0x06, 0x00, 0xFF, 0x00, 0x00, 0x08, 0x00]);
        let err = control
            .handle_transaction(&mut bus, &bd, &descriptors, &mut lifecycle, &callbacks, out)
            .unwrap_err();
        assert_eq!(err, Error::BadParam);
        assert!(bus.bd_table()[out.into_raw()].uown());
    }
}
