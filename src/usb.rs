// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB structure and constant definitions.
//!
//! These are the standard (chapter 9) records every device hands out during
//! enumeration. They're declared `#[repr(C)]` with only byte-aligned fields,
//! so `zerocopy` can hand us their exact wire representation with
//! `as_bytes()` and no serialization step.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16, U32};

/// Builds a little-endian `u16` field in a `const` context.
pub const fn le16(v: u16) -> U16<LittleEndian> {
    U16::from_bytes(v.to_le_bytes())
}

/// Builds a little-endian `u32` field in a `const` context.
pub const fn le32(v: u32) -> U32<LittleEndian> {
    U32::from_bytes(v.to_le_bytes())
}

/// Transfer direction, as seen from the host. The value is the direction bit
/// of an endpoint address or `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// The 8 bytes the host sends to start every control transfer.
#[repr(C)]
#[derive(Debug, AsBytes, FromBytes, Unaligned)]
pub struct UsbSetupPacket {
    /// Request type. The top bit is the data stage direction (see `UsbDir`);
    /// bits 6:5 distinguish standard, class and vendor requests.
    pub request_type: u8,
    /// `bRequest`. The standard ones we handle are `UsbSetupRequest`; class
    /// requests reuse the same numbers with a different type.
    pub request: u8,
    /// Request argument. For GET_DESCRIPTOR, type in the high byte and index
    /// in the low byte.
    pub value: U16<LittleEndian>,
    /// Interface or endpoint the request is aimed at; for string descriptors,
    /// the requested language ID.
    pub index: U16<LittleEndian>,
    /// Size of the data stage: exact for OUT, an upper bound for IN.
    pub length: U16<LittleEndian>,
}

/// Standard requests the firmware acts on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbSetupRequest {
    /// IN.
    GetDescriptor = 0x06,
    /// OUT. Takes effect after the status stage.
    SetAddress = 0x05,
    /// OUT. Zero means unconfigured.
    SetConfiguration = 0x09,
}

/// Device descriptor: the first thing a host reads during enumeration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// 18.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// BCD; `0x0200` is USB 2.0.
    pub bcd_usb: U16<LittleEndian>,
    /// Class triple. All zero defers to the interfaces; `MISC`/`COMMON`/`IAD`
    /// defers to interface associations.
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// EP0 packet size in bytes.
    pub max_packet_size0: u8,
    pub vendor: U16<LittleEndian>,
    pub product: U16<LittleEndian>,
    /// BCD release number.
    pub bcd_device: U16<LittleEndian>,
    /// String indices; 0 means none.
    pub manufacturer_s: u8,
    pub product_s: u8,
    pub serial_s: u8,
    pub num_configurations: u8,
}

/// What the device would look like if it were running at the other speed.
/// Hosts ask for this to decide whether a high-speed hub port would help; a
/// full-speed-only device may answer it with the same class triple as its
/// device descriptor.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceQualifierDescriptor {
    /// Length of this structure, must be 10.
    pub length: u8,
    /// Must be `DeviceQualifier`.
    pub descriptor_type: UsbDescType,
    pub bcd_usb: U16<LittleEndian>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub num_configurations: u8,
    /// Reserved, must be zero.
    pub reserved: u8,
}

/// Configuration header. On the wire it's followed by everything in the
/// configuration: interfaces, class descriptors and endpoints.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Bytes in the whole configuration, this header included.
    pub total_length: U16<LittleEndian>,
    /// Distinct interface numbers; alternate settings don't count.
    pub num_interfaces: u8,
    /// The `wValue` SET_CONFIGURATION uses to select this.
    pub configuration_value: u8,
    pub configuration_s: u8,
    /// Bit 7 always set; bit 6 self-powered; bit 5 remote wakeup.
    pub attributes: u8,
    /// In 2 mA units.
    pub max_power: u8,
}

/// Groups consecutive interfaces that together make up one function, so the
/// host binds a single class driver to all of them. Both of our functions
/// (CDC and audio) span more than one interface and need this.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceAssociationDescriptor {
    /// Length of this structure, must be 8.
    pub length: u8,
    /// Must be `InterfaceAssociation`.
    pub descriptor_type: UsbDescType,
    /// Number of the first interface in the group.
    pub first_interface: u8,
    /// How many contiguous interfaces belong to the group.
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
    /// Index of function name within string descriptor table.
    pub function_s: u8,
}

/// One alternate setting of one interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// 9.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub interface_number: u8,
    /// Audio streaming interfaces offer a zero-bandwidth setting 0 plus one
    /// setting per sample format.
    pub alternate_setting: u8,
    /// Not counting EP0.
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_s: u8,
}

/// Endpoint descriptor, following its interface (and any class descriptors).
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// 7.
    pub length: u8,
    pub descriptor_type: UsbDescType,
    /// Endpoint number in bits 3:0, direction in bit 7 (see `UsbDir`).
    pub endpoint_address: u8,
    /// Endpoint attributes; the bottom 2 bits select the transfer type using
    /// the values from `UsbTransferType`. For isochronous endpoints, bits 3:2
    /// give the synchronization type and bits 5:4 the usage.
    pub attributes: u8,
    /// In bytes.
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval for interrupt/isochronous endpoints. At full speed
    /// this is in frames (milliseconds); isochronous uses 2^(interval-1).
    pub interval: u8,
}

impl UsbEndpointDescriptor {
    pub const fn new(
        endpoint_address: u8,
        attributes: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        Self {
            length: core::mem::size_of::<Self>() as u8,
            descriptor_type: UsbDescType::Endpoint,
            endpoint_address,
            attributes,
            max_packet_size: le16(max_packet_size),
            interval,
        }
    }
}

/// `bDescriptorType` values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    InterfaceAssociation = 0x0B,
    /// Class-specific descriptor attached to an interface.
    CsInterface = 0x24,
    /// Class-specific descriptor attached to an endpoint.
    CsEndpoint = 0x25,
}

/// Transfer types, as encoded in bits 1:0 of an endpoint's `attributes` and
/// in the RP2040's `EP_CONTROL.ENDPOINT_TYPE` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Class codes, as assigned by usb.org, that appear in our descriptors.
pub mod class {
    pub const AUDIO: u8 = 0x01;
    pub const CDC: u8 = 0x02;
    pub const CDC_DATA: u8 = 0x0A;
    /// "Miscellaneous". With subclass `COMMON` and protocol `IAD`, tells the
    /// host to look for interface associations.
    pub const MISC: u8 = 0xEF;

    pub const MISC_SUBCLASS_COMMON: u8 = 0x02;
    pub const MISC_PROTOCOL_IAD: u8 = 0x01;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;
    use num_traits::FromPrimitive;

    #[test]
    fn record_sizes_match_usb_2_0() {
        assert_eq!(size_of::<UsbSetupPacket>(), 8);
        assert_eq!(size_of::<UsbDeviceDescriptor>(), 18);
        assert_eq!(size_of::<UsbDeviceQualifierDescriptor>(), 10);
        assert_eq!(size_of::<UsbConfigurationDescriptor>(), 9);
        assert_eq!(size_of::<UsbInterfaceAssociationDescriptor>(), 8);
        assert_eq!(size_of::<UsbInterfaceDescriptor>(), 9);
        assert_eq!(size_of::<UsbEndpointDescriptor>(), 7);
    }

    #[test]
    fn endpoint_addresses() {
        assert_eq!(UsbDir::In.endpoint(2), 0x82);
        assert_eq!(UsbDir::Out.endpoint(2), 0x02);
        assert_eq!(UsbDir::of_endpoint_addr(0x81), UsbDir::In);
        assert_eq!(UsbDir::of_endpoint_addr(0x01), UsbDir::Out);
    }

    #[test]
    fn endpoint_descriptor_is_little_endian() {
        let ep = UsbEndpointDescriptor::new(0x01, UsbTransferType::Isochronous as u8 | 0x08, 388, 1);
        assert_eq!(ep.as_bytes(), &[7, 0x05, 0x01, 0x09, 0x84, 0x01, 1]);
    }

    #[test]
    fn setup_packet_parses_get_string() {
        // GET_DESCRIPTOR(String, index 2), langid 0x0409, wLength 255.
        let raw = [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xFF, 0x00];
        let setup = zerocopy::LayoutVerified::<_, UsbSetupPacket>::new(&raw[..])
            .unwrap()
            .into_ref();
        assert_eq!(UsbSetupRequest::from_u8(setup.request), Some(UsbSetupRequest::GetDescriptor));
        assert_eq!(UsbDescType::from_u16(setup.value.get() >> 8), Some(UsbDescType::String));
        assert_eq!(setup.value.get() & 0xFF, 2);
        assert_eq!(setup.index.get(), 0x0409);
        assert_eq!(setup.length.get(), 255);
    }
}
