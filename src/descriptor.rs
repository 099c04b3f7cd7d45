//! The descriptor table the control engine serves GET_DESCRIPTOR requests
//! from.
//!
//! Unlike a host-side stack, which receives descriptors and must parse
//! their contents, a device only ever *serves* descriptors it already knows
//! the bytes of. This module is therefore a flat, read-only lookup table
//! rather than a parser: the integrator builds a [`DescriptorTable`] of
//! [`DescriptorEntry`] records at compile time, and the control engine does
//! a linear `(type, index)` search over it. The core never interprets a
//! descriptor's contents beyond that outer triple.

/// `descriptor_type` of the (mandatory) Device Descriptor.
pub const TYPE_DEVICE: u8 = 1;
/// `descriptor_type` of the (mandatory) Configuration Descriptor.
pub const TYPE_CONFIGURATION: u8 = 2;
/// `descriptor_type` of a String Descriptor.
pub const TYPE_STRING: u8 = 3;
/// `descriptor_type` of an Interface Descriptor. Never requested directly
/// by GET_DESCRIPTOR; always nested inside a Configuration Descriptor.
pub const TYPE_INTERFACE: u8 = 4;
/// `descriptor_type` of an Endpoint Descriptor. Never requested directly;
/// always nested inside a Configuration Descriptor.
pub const TYPE_ENDPOINT: u8 = 5;

/// One entry of the descriptor table: the outer `(type, index)` the host
/// addresses it by, and the bytes served verbatim in response.
#[derive(Copy, Clone, defmt::Format)]
pub struct DescriptorEntry {
    pub descriptor_type: u8,
    pub index: u8,
    pub data: &'static [u8],
}

impl DescriptorEntry {
    pub const fn new(descriptor_type: u8, index: u8, data: &'static [u8]) -> Self {
        Self {
            descriptor_type,
            index,
            data,
        }
    }

    /// Total length of the data this entry serves. A Configuration
    /// Descriptor's entry carries its own nested Interface/Endpoint
    /// descriptors concatenated, so this is usually larger than the
    /// 9-byte header alone.
    pub fn size(&self) -> u16 {
        self.data.len() as u16
    }
}

/// A static, read-only list of descriptors, searched first-match-wins.
///
/// The integrator is responsible for including at minimum a Device
/// Descriptor (type 1, index 0) and a Configuration Descriptor (type 2,
/// index 0); additional entries (report, string descriptors) are optional
/// and looked up exactly the same way.
pub struct DescriptorTable<'a> {
    entries: &'a [DescriptorEntry],
}

impl<'a> DescriptorTable<'a> {
    pub const fn new(entries: &'a [DescriptorEntry]) -> Self {
        Self { entries }
    }

    /// Find the first entry matching `(descriptor_type, index)`.
    pub fn find(&self, descriptor_type: u8, index: u8) -> Option<&DescriptorEntry> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor_type == descriptor_type && entry.index == index)
    }
}
