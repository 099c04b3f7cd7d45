//! Buffer Descriptor (BD) manager.
//!
//! A buffer descriptor is a small record, shared between the CPU and the
//! SIE, that names one endpoint-direction buffer: its ownership, its
//! transferred/allocated length, and its address in the endpoint arena. The
//! manager here owns the allocation bookkeeping (which handles exist, where
//! their buffers live) and the protocol for handing a buffer back and forth
//! across the UOWN bit; the actual BD table and arena memory live behind
//! [`crate::hal::DeviceBus`], since on real hardware they are a fixed-address
//! RAM bank the SIE also reads and writes.

use crate::hal::DeviceBus;
use crate::{Error, Result};

/// Number of endpoints the arena and BD table are sized for.
pub const MAX_ENDPOINTS: usize = 16;

/// Two BDs (OUT, IN) per endpoint.
pub const MAX_BDS: usize = MAX_ENDPOINTS * 2;

/// Token PID the SIE writes into a completed BD's status byte when the
/// transaction was a SETUP.
pub const PID_SETUP: u8 = 0x0D;

/// `(endpoint, direction)` as carried by a BD handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum Direction {
    Out = 0,
    In = 1,
}

/// Data-toggle value a BD is configured to expect or send.
#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub enum DataToggle {
    Data0,
    Data1,
}

/// An opaque `(endpoint, direction)` handle: `(endpoint << 1) | direction`.
///
/// The same encoding is used both to address a BD for setup/I-O and to
/// decode the SIE's notion of "the endpoint and direction that just
/// completed" — see [`BdManager::handle_for_transaction`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, defmt::Format)]
pub struct BdHandle(u8);

impl BdHandle {
    /// The handle for endpoint 0 OUT. Used only as a placeholder before
    /// [`BdManager::init`] resolves the real EP0 handles.
    pub const fn zero() -> Self {
        BdHandle(0)
    }

    pub fn endpoint(&self) -> u8 {
        self.0 >> 1
    }

    pub fn direction(&self) -> Direction {
        if self.0 & 1 == 1 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// The raw `usize` index into the BD table this handle names.
    pub fn into_raw(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// One buffer descriptor's shared-memory record.
///
/// Bit layout follows the source hardware exactly: bit 7 is UOWN in both
/// CPU and SIE modes; bits 0-1 are the high two bits of a 10-bit byte count
/// in both modes. The remaining bits mean different things depending on who
/// currently owns the BD (CPU: BSTALL/DTSEN/DTS; SIE: the 4-bit completion
/// PID) and are only meaningful to read while you hold that ownership.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, defmt::Format)]
pub struct BdSlot {
    pub stat: u8,
    pub cnt: u8,
    pub addr: u16,
}

impl BdSlot {
    const UOWN: u8 = 1 << 7;
    const DTS: u8 = 1 << 6;
    const DTSEN: u8 = 1 << 3;
    const BSTALL: u8 = 1 << 2;
    const BC_MASK: u8 = 0b11;
    const PID_SHIFT: u8 = 2;
    const PID_MASK: u8 = 0b1111;

    pub fn uown(&self) -> bool {
        self.stat & Self::UOWN != 0
    }

    pub(crate) fn set_uown(&mut self, sie: bool) {
        if sie {
            self.stat |= Self::UOWN;
        } else {
            self.stat &= !Self::UOWN;
        }
    }

    pub(crate) fn set_bstall(&mut self, stalled: bool) {
        if stalled {
            self.stat |= Self::BSTALL;
        } else {
            self.stat &= !Self::BSTALL;
        }
    }

    pub(crate) fn set_dtsen(&mut self, enabled: bool) {
        if enabled {
            self.stat |= Self::DTSEN;
        } else {
            self.stat &= !Self::DTSEN;
        }
    }

    pub(crate) fn set_dts(&mut self, data1: bool) {
        if data1 {
            self.stat |= Self::DTS;
        } else {
            self.stat &= !Self::DTS;
        }
    }

    /// The 4-bit PID the SIE recorded for the last completed transaction.
    /// Only meaningful while `uown() == false` (i.e. ownership has just
    /// been returned to the CPU).
    pub fn pid(&self) -> u8 {
        (self.stat >> Self::PID_SHIFT) & Self::PID_MASK
    }

    /// The 10-bit transferred/allocated byte count: high two bits from the
    /// status byte, low eight from the count byte.
    pub fn total_count(&self) -> u16 {
        (((self.stat & Self::BC_MASK) as u16) << 8) | self.cnt as u16
    }

    pub(crate) fn set_total_count(&mut self, count: u16) {
        self.stat = (self.stat & !Self::BC_MASK) | ((count >> 8) as u8 & Self::BC_MASK);
        self.cnt = count as u8;
    }
}

/// Owns BD allocation bookkeeping (which handles are set up, and where
/// their buffers live in the endpoint arena). The actual BD table and
/// arena memory are borrowed from the [`DeviceBus`] on every call, since
/// the SIE also has them mapped.
pub struct BdManager {
    end_of_allocated: u16,
    highest_setup: u8,
    allocated: [bool; MAX_BDS],
}

impl Default for BdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BdManager {
    pub const fn new() -> Self {
        Self {
            end_of_allocated: 0,
            highest_setup: 0,
            allocated: [false; MAX_BDS],
        }
    }

    /// The pure `(endpoint << 1) | direction` encoding.
    pub fn handle_for_endpoint(endpoint: u8, direction: Direction) -> BdHandle {
        BdHandle((endpoint << 1) | direction as u8)
    }

    /// Decode the `(endpoint, direction)` of the transaction the SIE most
    /// recently completed.
    pub fn handle_for_transaction(&self, bus: &mut impl DeviceBus) -> BdHandle {
        let (endpoint, direction) = bus.last_transaction();
        Self::handle_for_endpoint(endpoint, direction)
    }

    /// Zero the BD table and reset allocation state. Leaves no allocation
    /// leak from any prior session.
    pub fn init(&mut self, bus: &mut impl DeviceBus) {
        for slot in bus.bd_table().iter_mut() {
            *slot = BdSlot::default();
        }
        self.end_of_allocated = 0;
        self.highest_setup = 0;
        self.allocated = [false; MAX_BDS];
    }

    fn ensure_allocated(&self, handle: BdHandle) -> Result<()> {
        if self.allocated[handle.into_raw()] {
            Ok(())
        } else {
            Err(Error::BadParam)
        }
    }

    /// Allocate `size` bytes of arena space to `(endpoint, direction)` and
    /// return its handle. BDs must be set up in ascending handle order
    /// (OUT before IN, per endpoint); out-of-order or duplicate setup
    /// fails, as does a request the arena cannot fit.
    pub fn setup(
        &mut self,
        bus: &mut impl DeviceBus,
        endpoint: u8,
        direction: Direction,
        size: u16,
    ) -> Result<BdHandle> {
        if endpoint as usize >= MAX_ENDPOINTS || size == 0 {
            return Err(Error::BadParam);
        }
        let handle = Self::handle_for_endpoint(endpoint, direction);
        let idx = handle.into_raw();
        if (idx as u8) < self.highest_setup || self.allocated[idx] {
            defmt::warn!(
                "bd: setup out-of-order or duplicate ep={} dir={}",
                endpoint,
                direction
            );
            return Err(Error::Error);
        }
        let arena_len = bus.endpoint_arena().len() as u16;
        let end = self
            .end_of_allocated
            .checked_add(size)
            .filter(|&end| end <= arena_len);
        let Some(end) = end else {
            return Err(Error::NoMem);
        };

        let addr = self.end_of_allocated;
        let slot = &mut bus.bd_table()[idx];
        *slot = BdSlot::default();
        slot.addr = addr;
        slot.set_total_count(size);

        self.end_of_allocated = end;
        self.highest_setup = idx as u8;
        self.allocated[idx] = true;
        defmt::trace!(
            "bd: setup ep={} dir={} size={} handle={} addr={}",
            endpoint,
            direction,
            size,
            idx,
            addr
        );
        Ok(handle)
    }

    /// The implicit buffer size of `handle`: the distance to the next
    /// allocated BD's address, or to `end_of_allocated` if `handle` is the
    /// most recently allocated BD.
    pub fn size(&self, bus: &mut impl DeviceBus, handle: BdHandle) -> Result<u16> {
        self.ensure_allocated(handle)?;
        let idx = handle.into_raw();
        let addr = bus.bd_table()[idx].addr;
        let mut next_addr = None;
        let mut probe = idx + 1;
        while probe <= self.highest_setup as usize {
            if self.allocated[probe] {
                next_addr = Some(bus.bd_table()[probe].addr);
                break;
            }
            probe += 1;
        }
        Ok(match next_addr {
            Some(next) => next - addr,
            None => self.end_of_allocated - addr,
        })
    }

    /// Borrow the BD's buffer and report its size: received byte count for
    /// an OUT BD, capacity for an IN BD. Fails with [`Error::Access`] while
    /// the SIE owns the BD.
    pub fn get_buf<'b>(
        &self,
        bus: &'b mut impl DeviceBus,
        handle: BdHandle,
    ) -> Result<(&'b mut [u8], u16)> {
        self.ensure_allocated(handle)?;
        let capacity = self.size(bus, handle)?;
        let idx = handle.into_raw();
        let (uown, addr, received) = {
            let slot = &bus.bd_table()[idx];
            (slot.uown(), slot.addr, slot.total_count())
        };
        if uown {
            return Err(Error::Access);
        }
        let reported = match handle.direction() {
            Direction::Out => received,
            Direction::In => capacity,
        };
        let start = addr as usize;
        let end = start + capacity as usize;
        Ok((&mut bus.endpoint_arena()[start..end], reported))
    }

    /// IN-only: the byte count the SIE actually wrote. Fails with
    /// [`Error::Access`] while SIE-owned.
    pub fn get_sent(&self, bus: &mut impl DeviceBus, handle: BdHandle) -> Result<u16> {
        if handle.direction() != Direction::In {
            return Err(Error::BadParam);
        }
        self.ensure_allocated(handle)?;
        let idx = handle.into_raw();
        let slot = &bus.bd_table()[idx];
        if slot.uown() {
            return Err(Error::Access);
        }
        Ok(slot.total_count())
    }

    /// The token PID the SIE recorded for the last completed transaction on
    /// this BD. Fails with [`Error::Access`] while SIE-owned.
    pub fn get_pid(&self, bus: &mut impl DeviceBus, handle: BdHandle) -> Result<u8> {
        self.ensure_allocated(handle)?;
        let idx = handle.into_raw();
        let slot = &bus.bd_table()[idx];
        if slot.uown() {
            return Err(Error::Access);
        }
        Ok(slot.pid())
    }

    /// OUT-only: arm the BD to receive a full-size packet and hand it to
    /// the SIE.
    pub fn receive(&self, bus: &mut impl DeviceBus, handle: BdHandle) -> Result<()> {
        if handle.direction() != Direction::Out {
            return Err(Error::BadParam);
        }
        self.ensure_allocated(handle)?;
        let capacity = self.size(bus, handle)?;
        let idx = handle.into_raw();
        let slot = &mut bus.bd_table()[idx];
        slot.set_total_count(capacity);
        slot.set_bstall(false);
        slot.set_uown(true);
        Ok(())
    }

    /// IN-only: load `size` bytes (`size <= capacity`) and hand the BD to
    /// the SIE to transmit.
    pub fn send(&self, bus: &mut impl DeviceBus, handle: BdHandle, size: u16) -> Result<()> {
        if handle.direction() != Direction::In {
            return Err(Error::BadParam);
        }
        self.ensure_allocated(handle)?;
        let capacity = self.size(bus, handle)?;
        if size > capacity {
            return Err(Error::BadParam);
        }
        let idx = handle.into_raw();
        let slot = &mut bus.bd_table()[idx];
        slot.set_total_count(size);
        slot.set_bstall(false);
        slot.set_uown(true);
        Ok(())
    }

    /// Arm the BD to answer every token with STALL until it is next armed
    /// normally, or a SETUP token reclaims it per the USB spec.
    pub fn stall(&self, bus: &mut impl DeviceBus, handle: BdHandle) -> Result<()> {
        self.ensure_allocated(handle)?;
        let capacity = self.size(bus, handle)?;
        let idx = handle.into_raw();
        let slot = &mut bus.bd_table()[idx];
        slot.set_total_count(capacity);
        slot.set_bstall(true);
        slot.set_uown(true);
        Ok(())
    }

    /// Force ownership back to the CPU. Only safe when the SIE is known
    /// idle on this BD (reset, or right after a SETUP token).
    pub fn claim(&self, bus: &mut impl DeviceBus, handle: BdHandle) {
        let idx = handle.into_raw();
        bus.bd_table()[idx].set_uown(false);
    }

    /// Configure data-toggle checking. Fails with [`Error::Access`] while
    /// SIE-owned.
    pub fn set_sync(
        &self,
        bus: &mut impl DeviceBus,
        handle: BdHandle,
        enabled: bool,
        value: DataToggle,
    ) -> Result<()> {
        self.ensure_allocated(handle)?;
        let idx = handle.into_raw();
        let slot = &mut bus.bd_table()[idx];
        if slot.uown() {
            return Err(Error::Access);
        }
        slot.set_dtsen(enabled);
        slot.set_dts(value == DataToggle::Data1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeBus;

    fn setup_ep0(mgr: &mut BdManager, bus: &mut FakeBus) -> (BdHandle, BdHandle) {
        mgr.init(bus);
        let out = mgr.setup(bus, 0, Direction::Out, 8).unwrap();
        let inh = mgr.setup(bus, 0, Direction::In, 8).unwrap();
        (out, inh)
    }

    #[test]
    fn handle_round_trips_through_encoding() {
        for endpoint in 0..MAX_ENDPOINTS as u8 {
            for direction in [Direction::Out, Direction::In] {
                let h = BdManager::handle_for_endpoint(endpoint, direction);
                assert_eq!(h.endpoint(), endpoint);
                assert_eq!(h.direction(), direction);
            }
        }
    }

    #[test]
    fn ascending_addresses_match_requested_sizes() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        let out = mgr.setup(&mut bus, 0, Direction::Out, 8).unwrap();
        let inh = mgr.setup(&mut bus, 0, Direction::In, 8).unwrap();
        let addr_out = bus.bd_table()[out.into_raw()].addr;
        let addr_in = bus.bd_table()[inh.into_raw()].addr;
        assert!(addr_in > addr_out);
        assert_eq!(addr_in - addr_out, 8);
        assert_eq!(mgr.size(&mut bus, out).unwrap(), 8);
        assert_eq!(mgr.size(&mut bus, inh).unwrap(), 8);
    }

    #[test]
    fn get_buf_fails_access_iff_sie_owns() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        let (out, _inh) = setup_ep0(&mut mgr, &mut bus);
        assert!(mgr.get_buf(&mut bus, out).is_ok());
        mgr.receive(&mut bus, out).unwrap();
        assert_eq!(mgr.get_buf(&mut bus, out).unwrap_err(), Error::Access);
        // Simulate SIE completion.
        bus.bd_table()[out.into_raw()].set_uown(false);
        assert!(mgr.get_buf(&mut bus, out).is_ok());
    }

    #[test]
    fn send_then_completion_returns_ownership_before_next_get_buf() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        let (_out, inh) = setup_ep0(&mut mgr, &mut bus);
        mgr.send(&mut bus, inh, 4).unwrap();
        assert!(bus.bd_table()[inh.into_raw()].uown());
        assert_eq!(mgr.get_buf(&mut bus, inh).unwrap_err(), Error::Access);
        bus.bd_table()[inh.into_raw()].set_uown(false);
        let (_buf, reported) = mgr.get_buf(&mut bus, inh).unwrap();
        assert_eq!(reported, 8); // IN: capacity, not the last sent size
    }

    #[test]
    fn init_after_setup_resets_arena_pointer() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        mgr.setup(&mut bus, 0, Direction::Out, 8).unwrap();
        mgr.setup(&mut bus, 0, Direction::In, 8).unwrap();
        mgr.init(&mut bus);
        let out = mgr.setup(&mut bus, 0, Direction::Out, 8).unwrap();
        assert_eq!(bus.bd_table()[out.into_raw()].addr, 0);
    }

    #[test]
    fn out_of_order_setup_is_rejected() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        mgr.init(&mut bus);
        assert!(mgr.setup(&mut bus, 1, Direction::In, 32).is_ok());
        let before = mgr.end_of_allocated;
        let err = mgr.setup(&mut bus, 1, Direction::Out, 32).unwrap_err();
        assert_eq!(err, Error::Error);
        assert_eq!(mgr.end_of_allocated, before);
    }

    #[test]
    fn duplicate_setup_is_rejected() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        mgr.init(&mut bus);
        mgr.setup(&mut bus, 0, Direction::Out, 8).unwrap();
        assert_eq!(
            mgr.setup(&mut bus, 0, Direction::Out, 8).unwrap_err(),
            Error::Error
        );
    }

    #[test]
    fn setup_rejects_bad_params() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        mgr.init(&mut bus);
        assert_eq!(
            mgr.setup(&mut bus, 16, Direction::Out, 8).unwrap_err(),
            Error::BadParam
        );
        assert_eq!(
            mgr.setup(&mut bus, 0, Direction::Out, 0).unwrap_err(),
            Error::BadParam
        );
    }

    #[test]
    fn stall_is_idempotent() {
        let mut mgr = BdManager::new();
        let mut bus = FakeBus::new();
        let (out, _inh) = setup_ep0(&mut mgr, &mut bus);
        mgr.stall(&mut bus, out).unwrap();
        let first = bus.bd_table()[out.into_raw()];
        bus.bd_table()[out.into_raw()].set_uown(true); // SIE "holds" it, stall again is still legal to request
        mgr.stall(&mut bus, out).unwrap();
        let second = bus.bd_table()[out.into_raw()];
        assert_eq!(first.stat, second.stat);
        assert_eq!(first.cnt, second.cnt);
    }
}
