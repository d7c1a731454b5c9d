// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `ppm_loop`: the pulse-loop controller, which shows up on the host as a
//! CDC-ACM serial port.
//!
//! A CDC-ACM function is two interfaces: a "communication" interface with an
//! interrupt endpoint for notifications (which we never actually send), and a
//! "data" interface with a pair of bulk endpoints that carry the byte stream.
//! The class-specific functional descriptors in between tell the host how the
//! two go together.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16, U32};

use super::strings::{StringEntry, LANGUAGE_EN_US};
use super::{DescriptorSet, EnabledClasses, VENDOR_ID};
use crate::usb::{
    class, le16, le32, UsbConfigurationDescriptor, UsbDescType, UsbDeviceDescriptor,
    UsbDeviceQualifierDescriptor, UsbDir, UsbEndpointDescriptor,
    UsbInterfaceAssociationDescriptor, UsbInterfaceDescriptor, UsbTransferType,
};

/// Abstract Control Model, the CDC subclass for "looks like a modem / serial
/// port".
pub const CDC_SUBCLASS_ACM: u8 = 0x02;

const SUBTYPE_HEADER: u8 = 0x00;
const SUBTYPE_CALL_MANAGEMENT: u8 = 0x01;
const SUBTYPE_ACM: u8 = 0x02;
const SUBTYPE_UNION: u8 = 0x06;

pub const ITF_NUM_CDC: u8 = 0;
pub const ITF_NUM_CDC_DATA: u8 = 1;
pub const ITF_NUM_TOTAL: u8 = 2;

pub const EP_NOTIFY_ADDR: u8 = UsbDir::In.endpoint(1);
pub const EP_DATA_OUT_ADDR: u8 = UsbDir::Out.endpoint(2);
pub const EP_DATA_IN_ADDR: u8 = UsbDir::In.endpoint(2);

pub const NOTIFY_PACKET_SIZE: u16 = 8;
pub const DATA_PACKET_SIZE: u16 = 64;

/// String table indices.
pub const STRID_MANUFACTURER: u8 = 1;
pub const STRID_PRODUCT: u8 = 2;
pub const STRID_SERIAL: u8 = 3;
pub const STRID_CDC: u8 = 4;
pub const STRID_RESET: u8 = 5;

/// CDC header functional descriptor: announces the CDC spec version and
/// starts the run of functional descriptors.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct CdcHeaderDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub bcd_cdc: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct CdcCallManagementDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    /// Bit 0: device handles call management itself. Bit 1: ...over the data
    /// interface. We do neither.
    pub capabilities: u8,
    pub data_interface: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct CdcAcmDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    /// Bit 1: line coding / control line state requests. Bit 2: send break.
    pub capabilities: u8,
}

/// Binds the data interface to the communication interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct CdcUnionDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub control_interface: u8,
    pub subordinate_interface: u8,
}

/// The whole CDC-ACM function, in the order the host expects to read it.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct CdcFunction {
    pub association: UsbInterfaceAssociationDescriptor,
    pub comm_interface: UsbInterfaceDescriptor,
    pub header: CdcHeaderDescriptor,
    pub call_management: CdcCallManagementDescriptor,
    pub acm: CdcAcmDescriptor,
    pub union: CdcUnionDescriptor,
    pub notify_endpoint: UsbEndpointDescriptor,
    pub data_interface: UsbInterfaceDescriptor,
    pub data_out: UsbEndpointDescriptor,
    pub data_in: UsbEndpointDescriptor,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct PpmLoopConfiguration {
    pub config: UsbConfigurationDescriptor,
    pub cdc: CdcFunction,
}

const fn cdc_function(itf: u8, string_index: u8) -> CdcFunction {
    CdcFunction {
        association: UsbInterfaceAssociationDescriptor {
            length: core::mem::size_of::<UsbInterfaceAssociationDescriptor>() as u8,
            descriptor_type: UsbDescType::InterfaceAssociation,
            first_interface: itf,
            interface_count: 2,
            function_class: class::CDC,
            function_subclass: CDC_SUBCLASS_ACM,
            function_protocol: 0,
            function_s: 0,
        },
        comm_interface: UsbInterfaceDescriptor {
            length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
            descriptor_type: UsbDescType::Interface,
            interface_number: itf,
            alternate_setting: 0,
            num_endpoints: 1,
            interface_class: class::CDC,
            interface_subclass: CDC_SUBCLASS_ACM,
            interface_protocol: 0,
            interface_s: string_index,
        },
        header: CdcHeaderDescriptor {
            length: core::mem::size_of::<CdcHeaderDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: SUBTYPE_HEADER,
            bcd_cdc: le16(0x0120),
        },
        call_management: CdcCallManagementDescriptor {
            length: core::mem::size_of::<CdcCallManagementDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: SUBTYPE_CALL_MANAGEMENT,
            capabilities: 0,
            data_interface: itf + 1,
        },
        acm: CdcAcmDescriptor {
            length: core::mem::size_of::<CdcAcmDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: SUBTYPE_ACM,
            capabilities: 0x06,
        },
        union: CdcUnionDescriptor {
            length: core::mem::size_of::<CdcUnionDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: SUBTYPE_UNION,
            control_interface: itf,
            subordinate_interface: itf + 1,
        },
        notify_endpoint: UsbEndpointDescriptor::new(
            EP_NOTIFY_ADDR,
            UsbTransferType::Interrupt as u8,
            NOTIFY_PACKET_SIZE,
            16,
        ),
        data_interface: UsbInterfaceDescriptor {
            length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
            descriptor_type: UsbDescType::Interface,
            interface_number: itf + 1,
            alternate_setting: 0,
            num_endpoints: 2,
            interface_class: class::CDC_DATA,
            interface_subclass: 0,
            interface_protocol: 0,
            interface_s: 0,
        },
        data_out: UsbEndpointDescriptor::new(
            EP_DATA_OUT_ADDR,
            UsbTransferType::Bulk as u8,
            DATA_PACKET_SIZE,
            0,
        ),
        data_in: UsbEndpointDescriptor::new(
            EP_DATA_IN_ADDR,
            UsbTransferType::Bulk as u8,
            DATA_PACKET_SIZE,
            0,
        ),
    }
}

pub static PPM_LOOP: DescriptorSet<PpmLoopConfiguration> = DescriptorSet {
    device: UsbDeviceDescriptor {
        length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
        descriptor_type: UsbDescType::Device,
        bcd_usb: le16(0x0200),
        // CDC with an IAD has to advertise itself as "misc / common / IAD" at
        // the device level, or Windows won't look for the association.
        device_class: class::MISC,
        device_subclass: class::MISC_SUBCLASS_COMMON,
        device_protocol: class::MISC_PROTOCOL_IAD,
        max_packet_size0: 64,
        vendor: le16(VENDOR_ID),
        product: le16(
            EnabledClasses {
                cdc: true,
                msc: false,
                hid: false,
                midi: false,
                audio: false,
                vendor: false,
            }
            .product_id(),
        ),
        bcd_device: le16(0x0100),
        manufacturer_s: STRID_MANUFACTURER,
        product_s: STRID_PRODUCT,
        serial_s: STRID_SERIAL,
        num_configurations: 1,
    },
    qualifier: UsbDeviceQualifierDescriptor {
        length: core::mem::size_of::<UsbDeviceQualifierDescriptor>() as u8,
        descriptor_type: UsbDescType::DeviceQualifier,
        bcd_usb: le16(0x0200),
        device_class: class::MISC,
        device_subclass: class::MISC_SUBCLASS_COMMON,
        device_protocol: class::MISC_PROTOCOL_IAD,
        max_packet_size0: 64,
        num_configurations: 1,
        reserved: 0,
    },
    configuration: PpmLoopConfiguration {
        config: UsbConfigurationDescriptor {
            length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
            descriptor_type: UsbDescType::Config,
            total_length: le16(core::mem::size_of::<PpmLoopConfiguration>() as u16),
            num_interfaces: ITF_NUM_TOTAL,
            configuration_value: 1,
            configuration_s: 0,
            // Bus powered, no remote wakeup.
            attributes: 0x80,
            // 100 mA
            max_power: 50,
        },
        cdc: cdc_function(ITF_NUM_CDC, STRID_CDC),
    },
    strings: &[
        StringEntry::Language(LANGUAGE_EN_US),
        StringEntry::Ascii("ppm_loop"),
        StringEntry::Ascii("ppm"),
        StringEntry::SerialNumber,
        StringEntry::Ascii("ppm_loop"),
        StringEntry::Ascii("PPMReset"),
    ],
};

/// ACM class requests we answer on EP0.
pub const SET_LINE_CODING: u8 = 0x20;
pub const GET_LINE_CODING: u8 = 0x21;
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;

/// Serial line settings, as exchanged by SET/GET_LINE_CODING. There is no
/// UART behind our port, so these are only remembered and handed back.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, Unaligned)]
pub struct LineCoding {
    /// Bits per second.
    pub dte_rate: U32<LittleEndian>,
    /// 0: 1 stop bit, 1: 1.5, 2: 2.
    pub char_format: u8,
    /// 0 none, 1 odd, 2 even, 3 mark, 4 space.
    pub parity_type: u8,
    pub data_bits: u8,
}

impl LineCoding {
    /// 115200 8N1.
    pub const DEFAULT: LineCoding = LineCoding {
        dte_rate: le32(115_200),
        char_format: 0,
        parity_type: 0,
        data_bits: 8,
    };

    /// Reads a SET_LINE_CODING data stage. `None` if it's too short.
    pub fn parse(data: &[u8]) -> Option<LineCoding> {
        let bytes = data.get(..core::mem::size_of::<LineCoding>())?;
        let coding = LayoutVerified::<_, LineCoding>::new_unaligned(bytes)?;
        Some(*coding)
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::NoSerialNumber;
    use crate::descriptors::StringScratch;

    #[test]
    fn device_descriptor_bytes() {
        assert_eq!(
            PPM_LOOP.device_descriptor(),
            &[
                18, 0x01, 0x00, 0x02, 0xEF, 0x02, 0x01, 64, 0xFE, 0xCA, 0x01, 0x40, 0x00, 0x01, 1,
                2, 3, 1,
            ]
        );
    }

    #[test]
    fn configuration_total_length_matches() {
        let bytes = PPM_LOOP.configuration_descriptor(0);
        assert_eq!(bytes.len(), 9 + 66);
        assert_eq!(usize::from(u16::from_le_bytes([bytes[2], bytes[3]])), bytes.len());
        assert_eq!(bytes[4], 2, "interface count");
    }

    #[test]
    fn configuration_index_is_ignored() {
        assert_eq!(PPM_LOOP.configuration_descriptor(0), PPM_LOOP.configuration_descriptor(7));
    }

    #[test]
    fn configuration_records_chain() {
        // Walking the bLength fields must land exactly on the end, and each
        // record must be one of the types we expect.
        let bytes = PPM_LOOP.configuration_descriptor(0);
        let mut offset = 0;
        let mut types = Vec::new();
        while offset < bytes.len() {
            let len = usize::from(bytes[offset]);
            assert!(len >= 2);
            types.push(bytes[offset + 1]);
            offset += len;
        }
        assert_eq!(offset, bytes.len());
        assert_eq!(types, [0x02, 0x0B, 0x04, 0x24, 0x24, 0x24, 0x24, 0x05, 0x04, 0x05, 0x05]);
    }

    #[test]
    fn endpoints() {
        let cdc = &PPM_LOOP.configuration.cdc;
        assert_eq!(cdc.notify_endpoint.as_bytes(), &[7, 5, 0x81, 3, 8, 0, 16]);
        assert_eq!(cdc.data_out.as_bytes(), &[7, 5, 0x02, 2, 64, 0, 0]);
        assert_eq!(cdc.data_in.as_bytes(), &[7, 5, 0x82, 2, 64, 0, 0]);
    }

    #[test]
    fn qualifier() {
        assert_eq!(PPM_LOOP.device_qualifier(), &[10, 0x06, 0x00, 0x02, 0xEF, 0x02, 0x01, 64, 1, 0]);
    }

    #[test]
    fn product_string() {
        let mut scratch = StringScratch::new();
        let units = PPM_LOOP
            .string_descriptor(STRID_MANUFACTURER, 0x0409, &mut scratch, &mut NoSerialNumber)
            .unwrap();
        assert_eq!(units[0].get(), 0x0300 | 18);
        assert!(PPM_LOOP
            .string_descriptor(6, 0x0409, &mut scratch, &mut NoSerialNumber)
            .is_none());
        let units = PPM_LOOP
            .string_descriptor(STRID_RESET, 0x0409, &mut scratch, &mut NoSerialNumber)
            .unwrap();
        assert_eq!(units.len(), 1 + "PPMReset".len());
    }

    #[test]
    fn line_coding_wire_format() {
        assert_eq!(LineCoding::DEFAULT.as_bytes(), &[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]);
    }

    #[test]
    fn line_coding_parse() {
        let coding = LineCoding::parse(&[0x80, 0x25, 0x00, 0x00, 2, 2, 7]).unwrap();
        assert_eq!(coding.dte_rate.get(), 9600);
        assert_eq!(coding.char_format, 2);
        assert_eq!(coding.parity_type, 2);
        assert_eq!(coding.data_bits, 7);
        // Trailing bytes are ignored; a short stage is rejected.
        assert_eq!(LineCoding::parse(&[0x00, 0xC2, 0x01, 0x00, 0, 0, 8, 99]), Some(LineCoding::DEFAULT));
        assert_eq!(LineCoding::parse(&[0x00, 0xC2, 0x01]), None);
    }
}
