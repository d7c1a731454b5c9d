// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor tables for our two firmware variants, and the accessors a USB
//! device stack calls during enumeration.
//!
//! Each variant is one `static DescriptorSet`. Everything in it is immutable;
//! the only moving part is the `StringScratch` that callers lend to
//! `string_descriptor`.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, U16};

use crate::usb::{UsbDeviceDescriptor, UsbDeviceQualifierDescriptor};

pub mod audio;
pub mod cdc;
pub mod strings;

pub use strings::{
    HexSerialNumber, NoSerialNumber, SerialNumberSource, StringEntry, StringScratch,
};

/// Vendor ID shared by both variants. This is the TinyUSB test VID -- fine on
/// a bench, not for shipping.
pub const VENDOR_ID: u16 = 0xCAFE;

/// The set of device classes a firmware build exposes. Each one gets a bit in
/// the product ID, so that every combination of drivers shows up to the host
/// as a distinct product. Hosts cache driver bindings by VID/PID; reusing a
/// PID across builds with different interfaces confuses them badly.
///
/// ```text
/// [MSB]  VENDOR | AUDIO | MIDI | HID | MSC | CDC  [LSB]
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EnabledClasses {
    pub cdc: bool,
    pub msc: bool,
    pub hid: bool,
    pub midi: bool,
    pub audio: bool,
    pub vendor: bool,
}

impl EnabledClasses {
    pub const fn product_id(self) -> u16 {
        0x4000
            | (self.cdc as u16)
            | (self.msc as u16) << 1
            | (self.hid as u16) << 2
            | (self.midi as u16) << 3
            | (self.audio as u16) << 4
            | (self.vendor as u16) << 5
    }
}

/// Everything the host can ask us to describe, for one device variant.
///
/// `C` is the complete configuration: a `#[repr(C)]` struct that starts with
/// the configuration header and continues with every interface, class and
/// endpoint descriptor in wire order.
pub struct DescriptorSet<C: 'static> {
    pub device: UsbDeviceDescriptor,
    pub qualifier: UsbDeviceQualifierDescriptor,
    pub configuration: C,
    pub strings: &'static [StringEntry],
}

impl<C: AsBytes> DescriptorSet<C> {
    /// The device descriptor, as sent on the wire.
    pub fn device_descriptor(&'static self) -> &'static [u8] {
        self.device.as_bytes()
    }

    /// The configuration descriptor with everything appended to it. We only
    /// have one configuration, so `_index` is ignored.
    pub fn configuration_descriptor(&'static self, _index: u8) -> &'static [u8] {
        self.configuration.as_bytes()
    }

    /// String descriptor `index`, staged in `scratch`. See
    /// `strings::string_descriptor`.
    pub fn string_descriptor<'b>(
        &self,
        index: u8,
        language_id: u16,
        scratch: &'b mut StringScratch,
        serial: &mut impl SerialNumberSource,
    ) -> Option<&'b [U16<LittleEndian>]> {
        strings::string_descriptor(self.strings, index, language_id, scratch, serial)
    }

    pub fn device_qualifier(&'static self) -> &'static [u8] {
        self.qualifier.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_id_bitmap() {
        assert_eq!(EnabledClasses::default().product_id(), 0x4000);
        let cdc = EnabledClasses { cdc: true, ..Default::default() };
        assert_eq!(cdc.product_id(), 0x4001);
        let audio = EnabledClasses { audio: true, ..Default::default() };
        assert_eq!(audio.product_id(), 0x4010);
        let everything = EnabledClasses {
            cdc: true,
            msc: true,
            hid: true,
            midi: true,
            audio: true,
            vendor: true,
        };
        assert_eq!(everything.product_id(), 0x403F);
    }

    #[test]
    fn variants_do_not_share_a_product_id() {
        assert_ne!(
            cdc::PPM_LOOP.device.product.get(),
            audio::LASER_SOUND_CARD.device.product.get()
        );
    }
}
