// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Laser Sound Card: a USB Audio Class 2.0 headset (stereo speaker plus mono
//! microphone).
//!
//! UAC2 splits a device into one AudioControl interface, which describes the
//! signal topology (clock, terminals, units) and owns an interrupt endpoint,
//! and one AudioStreaming interface per direction. Each streaming interface
//! has alternate setting 0 with no endpoints, so that an idle device takes no
//! isochronous bandwidth, plus one alternate per sample format.
//!
//! Topology:
//!
//! ```text
//! speaker: USB streaming IT (0x01) -> feature unit (0x02) -> headphones OT (0x03)
//! mic:     microphone IT (0x11)    -> USB streaming OT (0x13)
//! clock:   internal programmable (0x04), shared by all terminals
//! ```

use byteorder::LittleEndian;
use zerocopy::{AsBytes, U16, U32};

use super::strings::{StringEntry, LANGUAGE_EN_US};
use super::{DescriptorSet, EnabledClasses, VENDOR_ID};
use crate::usb::{
    class, le16, le32, UsbConfigurationDescriptor, UsbDescType, UsbDeviceDescriptor,
    UsbDeviceQualifierDescriptor, UsbDir, UsbEndpointDescriptor,
    UsbInterfaceAssociationDescriptor, UsbInterfaceDescriptor, UsbTransferType,
};

const SUBCLASS_AUDIO_CONTROL: u8 = 0x01;
const SUBCLASS_AUDIO_STREAMING: u8 = 0x02;
/// Interface protocol code meaning "this is UAC 2.0".
const PROTOCOL_UAC2: u8 = 0x20;

// AudioControl descriptor subtypes.
const AC_HEADER: u8 = 0x01;
const AC_INPUT_TERMINAL: u8 = 0x02;
const AC_OUTPUT_TERMINAL: u8 = 0x03;
const AC_FEATURE_UNIT: u8 = 0x06;
const AC_CLOCK_SOURCE: u8 = 0x0A;

// AudioStreaming descriptor subtypes.
const AS_GENERAL: u8 = 0x01;
const AS_FORMAT_TYPE: u8 = 0x02;
const EP_GENERAL: u8 = 0x01;

const FUNCTION_CATEGORY_HEADSET: u8 = 0x04;
const FORMAT_TYPE_I: u8 = 0x01;
const FORMAT_PCM: u32 = 0x0000_0001;

const TERMINAL_USB_STREAMING: u16 = 0x0101;
const TERMINAL_GENERIC_MIC: u16 = 0x0201;
const TERMINAL_HEADPHONES: u16 = 0x0302;

/// Read/write mute and volume, per channel.
const FEATURE_MUTE_VOLUME_RW: u32 = 0b11 | 0b11 << 2;

pub const ENTITY_SPK_INPUT_TERMINAL: u8 = 0x01;
pub const ENTITY_SPK_FEATURE_UNIT: u8 = 0x02;
pub const ENTITY_SPK_OUTPUT_TERMINAL: u8 = 0x03;
pub const ENTITY_CLOCK: u8 = 0x04;
pub const ENTITY_MIC_INPUT_TERMINAL: u8 = 0x11;
pub const ENTITY_MIC_OUTPUT_TERMINAL: u8 = 0x13;

pub const ITF_NUM_AUDIO_CONTROL: u8 = 0;
pub const ITF_NUM_AUDIO_STREAMING_SPK: u8 = 1;
pub const ITF_NUM_AUDIO_STREAMING_MIC: u8 = 2;
pub const ITF_NUM_TOTAL: u8 = 3;

pub const EP_AUDIO_OUT_ADDR: u8 = UsbDir::Out.endpoint(1);
pub const EP_AUDIO_IN_ADDR: u8 = UsbDir::In.endpoint(1);
pub const EP_AUDIO_INT_ADDR: u8 = UsbDir::In.endpoint(2);

pub const MAX_SAMPLE_RATE: u32 = 96_000;
pub const SPEAKER_CHANNELS: u8 = 2;
pub const MIC_CHANNELS: u8 = 1;

/// String table indices.
pub const STRID_MANUFACTURER: u8 = 1;
pub const STRID_PRODUCT: u8 = 2;
pub const STRID_SERIAL: u8 = 3;
pub const STRID_SPEAKERS: u8 = 4;
pub const STRID_MICROPHONE: u8 = 5;

// Isochronous endpoint attribute bits.
const ISO_SYNC_ASYNC: u8 = 0x04;
const ISO_SYNC_ADAPTIVE: u8 = 0x08;

/// Largest isochronous packet one frame can need: one extra sample of slack
/// over the nominal samples-per-millisecond, for every channel.
pub const fn iso_packet_size(sample_rate: u32, bytes_per_sample: u8, channels: u8) -> u16 {
    ((sample_rate / 1000 + 1) * bytes_per_sample as u32 * channels as u32) as u16
}

/// Class-specific AC interface header.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct AcHeaderDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub bcd_adc: U16<LittleEndian>,
    pub category: u8,
    /// Length of the header plus every clock/terminal/unit descriptor after
    /// it. Not the same thing as the configuration total length.
    pub total_length: U16<LittleEndian>,
    pub controls: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct ClockSourceDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub clock_id: u8,
    /// Bits 1:0: clock type (3 = internal programmable).
    pub attributes: u8,
    /// Frequency read/write, validity read-only.
    pub controls: u8,
    pub assoc_terminal: u8,
    pub clock_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct InputTerminalDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub terminal_id: u8,
    pub terminal_type: U16<LittleEndian>,
    pub assoc_terminal: u8,
    pub clock_source_id: u8,
    pub num_channels: u8,
    pub channel_config: U32<LittleEndian>,
    pub channel_names_s: u8,
    pub controls: U16<LittleEndian>,
    pub terminal_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct OutputTerminalDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub terminal_id: u8,
    pub terminal_type: U16<LittleEndian>,
    pub assoc_terminal: u8,
    pub source_id: u8,
    pub clock_source_id: u8,
    pub controls: U16<LittleEndian>,
    pub terminal_s: u8,
}

/// Feature unit with a master channel plus left and right.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct StereoFeatureUnitDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub unit_id: u8,
    pub source_id: u8,
    /// Controls for channel 0 (master), 1 and 2.
    pub channel_controls: [U32<LittleEndian>; 3],
    pub feature_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct AsGeneralDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub terminal_link: u8,
    pub controls: u8,
    pub format_type: u8,
    pub formats: U32<LittleEndian>,
    pub num_channels: u8,
    pub channel_config: U32<LittleEndian>,
    pub channel_names_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct TypeIFormatDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub format_type: u8,
    /// Bytes each sample occupies on the wire.
    pub subslot_size: u8,
    /// Bits of each sample that carry data.
    pub bit_resolution: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct CsIsoEndpointDescriptor {
    pub length: u8,
    pub descriptor_type: UsbDescType,
    pub descriptor_subtype: u8,
    pub attributes: u8,
    pub controls: u8,
    pub lock_delay_units: u8,
    pub lock_delay: U16<LittleEndian>,
}

/// One streaming alternate setting: interface, format, endpoint.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct StreamingAlternate {
    pub interface: UsbInterfaceDescriptor,
    pub general: AsGeneralDescriptor,
    pub format: TypeIFormatDescriptor,
    pub endpoint: UsbEndpointDescriptor,
    pub cs_endpoint: CsIsoEndpointDescriptor,
}

/// A streaming interface: the zero-bandwidth setting, then 16-bit and 24-bit.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct StreamingInterface {
    pub idle: UsbInterfaceDescriptor,
    pub pcm16: StreamingAlternate,
    pub pcm24: StreamingAlternate,
}

/// Class-specific AudioControl descriptors, the part covered by the AC
/// header's total length.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct AudioControlTopology {
    pub header: AcHeaderDescriptor,
    pub clock: ClockSourceDescriptor,
    pub spk_input: InputTerminalDescriptor,
    pub spk_feature: StereoFeatureUnitDescriptor,
    pub spk_output: OutputTerminalDescriptor,
    pub mic_input: InputTerminalDescriptor,
    pub mic_output: OutputTerminalDescriptor,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct HeadsetFunction {
    pub association: UsbInterfaceAssociationDescriptor,
    pub control_interface: UsbInterfaceDescriptor,
    pub topology: AudioControlTopology,
    pub interrupt_endpoint: UsbEndpointDescriptor,
    pub speaker: StreamingInterface,
    pub microphone: StreamingInterface,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct LaserSoundCardConfiguration {
    pub config: UsbConfigurationDescriptor,
    pub headset: HeadsetFunction,
}

const fn interface(number: u8, alternate: u8, endpoints: u8, subclass: u8, string_index: u8) -> UsbInterfaceDescriptor {
    UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: number,
        alternate_setting: alternate,
        num_endpoints: endpoints,
        interface_class: class::AUDIO,
        interface_subclass: subclass,
        interface_protocol: PROTOCOL_UAC2,
        interface_s: string_index,
    }
}

const fn input_terminal(id: u8, terminal_type: u16, channels: u8) -> InputTerminalDescriptor {
    InputTerminalDescriptor {
        length: core::mem::size_of::<InputTerminalDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        descriptor_subtype: AC_INPUT_TERMINAL,
        terminal_id: id,
        terminal_type: le16(terminal_type),
        assoc_terminal: 0,
        clock_source_id: ENTITY_CLOCK,
        num_channels: channels,
        // Channels are not tied to predefined spatial positions.
        channel_config: le32(0),
        channel_names_s: 0,
        controls: le16(0),
        terminal_s: 0,
    }
}

const fn output_terminal(id: u8, terminal_type: u16, source: u8) -> OutputTerminalDescriptor {
    OutputTerminalDescriptor {
        length: core::mem::size_of::<OutputTerminalDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        descriptor_subtype: AC_OUTPUT_TERMINAL,
        terminal_id: id,
        terminal_type: le16(terminal_type),
        assoc_terminal: 0,
        source_id: source,
        clock_source_id: ENTITY_CLOCK,
        controls: le16(0),
        terminal_s: 0,
    }
}

const fn streaming_alternate(
    number: u8,
    alternate: u8,
    string_index: u8,
    terminal_link: u8,
    channels: u8,
    bytes_per_sample: u8,
    bits_per_sample: u8,
    endpoint_address: u8,
    sync: u8,
) -> StreamingAlternate {
    StreamingAlternate {
        interface: interface(number, alternate, 1, SUBCLASS_AUDIO_STREAMING, string_index),
        general: AsGeneralDescriptor {
            length: core::mem::size_of::<AsGeneralDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: AS_GENERAL,
            terminal_link,
            controls: 0,
            format_type: FORMAT_TYPE_I,
            formats: le32(FORMAT_PCM),
            num_channels: channels,
            channel_config: le32(0),
            channel_names_s: 0,
        },
        format: TypeIFormatDescriptor {
            length: core::mem::size_of::<TypeIFormatDescriptor>() as u8,
            descriptor_type: UsbDescType::CsInterface,
            descriptor_subtype: AS_FORMAT_TYPE,
            format_type: FORMAT_TYPE_I,
            subslot_size: bytes_per_sample,
            bit_resolution: bits_per_sample,
        },
        endpoint: UsbEndpointDescriptor::new(
            endpoint_address,
            UsbTransferType::Isochronous as u8 | sync,
            iso_packet_size(MAX_SAMPLE_RATE, bytes_per_sample, channels),
            1,
        ),
        cs_endpoint: CsIsoEndpointDescriptor {
            length: core::mem::size_of::<CsIsoEndpointDescriptor>() as u8,
            descriptor_type: UsbDescType::CsEndpoint,
            descriptor_subtype: EP_GENERAL,
            attributes: 0,
            controls: 0,
            // Milliseconds.
            lock_delay_units: 1,
            lock_delay: le16(1),
        },
    }
}

const fn streaming_interface(
    number: u8,
    string_index: u8,
    terminal_link: u8,
    channels: u8,
    endpoint_address: u8,
    sync: u8,
) -> StreamingInterface {
    StreamingInterface {
        idle: interface(number, 0, 0, SUBCLASS_AUDIO_STREAMING, string_index),
        pcm16: streaming_alternate(
            number, 1, string_index, terminal_link, channels, 2, 16, endpoint_address, sync,
        ),
        pcm24: streaming_alternate(
            number, 2, string_index, terminal_link, channels, 4, 24, endpoint_address, sync,
        ),
    }
}

const fn headset_function(string_index: u8) -> HeadsetFunction {
    HeadsetFunction {
        association: UsbInterfaceAssociationDescriptor {
            length: core::mem::size_of::<UsbInterfaceAssociationDescriptor>() as u8,
            descriptor_type: UsbDescType::InterfaceAssociation,
            first_interface: ITF_NUM_AUDIO_CONTROL,
            interface_count: ITF_NUM_TOTAL,
            function_class: class::AUDIO,
            function_subclass: 0,
            function_protocol: PROTOCOL_UAC2,
            function_s: 0,
        },
        control_interface: interface(ITF_NUM_AUDIO_CONTROL, 0, 1, SUBCLASS_AUDIO_CONTROL, string_index),
        topology: AudioControlTopology {
            header: AcHeaderDescriptor {
                length: core::mem::size_of::<AcHeaderDescriptor>() as u8,
                descriptor_type: UsbDescType::CsInterface,
                descriptor_subtype: AC_HEADER,
                bcd_adc: le16(0x0200),
                category: FUNCTION_CATEGORY_HEADSET,
                total_length: le16(core::mem::size_of::<AudioControlTopology>() as u16),
                controls: 0,
            },
            clock: ClockSourceDescriptor {
                length: core::mem::size_of::<ClockSourceDescriptor>() as u8,
                descriptor_type: UsbDescType::CsInterface,
                descriptor_subtype: AC_CLOCK_SOURCE,
                clock_id: ENTITY_CLOCK,
                attributes: 3,
                controls: 7,
                assoc_terminal: 0,
                clock_s: 0,
            },
            spk_input: input_terminal(ENTITY_SPK_INPUT_TERMINAL, TERMINAL_USB_STREAMING, SPEAKER_CHANNELS),
            spk_feature: StereoFeatureUnitDescriptor {
                length: core::mem::size_of::<StereoFeatureUnitDescriptor>() as u8,
                descriptor_type: UsbDescType::CsInterface,
                descriptor_subtype: AC_FEATURE_UNIT,
                unit_id: ENTITY_SPK_FEATURE_UNIT,
                source_id: ENTITY_SPK_INPUT_TERMINAL,
                channel_controls: [
                    le32(FEATURE_MUTE_VOLUME_RW),
                    le32(FEATURE_MUTE_VOLUME_RW),
                    le32(FEATURE_MUTE_VOLUME_RW),
                ],
                feature_s: 0,
            },
            spk_output: output_terminal(ENTITY_SPK_OUTPUT_TERMINAL, TERMINAL_HEADPHONES, ENTITY_SPK_FEATURE_UNIT),
            mic_input: input_terminal(ENTITY_MIC_INPUT_TERMINAL, TERMINAL_GENERIC_MIC, MIC_CHANNELS),
            mic_output: output_terminal(ENTITY_MIC_OUTPUT_TERMINAL, TERMINAL_USB_STREAMING, ENTITY_MIC_INPUT_TERMINAL),
        },
        // Reports control changes (e.g. volume knob) to the host. 6 bytes is
        // the size of a UAC2 interrupt data message.
        interrupt_endpoint: UsbEndpointDescriptor::new(
            EP_AUDIO_INT_ADDR,
            UsbTransferType::Interrupt as u8,
            6,
            1,
        ),
        // The speaker follows the host's clock; the mic runs on ours.
        speaker: streaming_interface(
            ITF_NUM_AUDIO_STREAMING_SPK,
            STRID_SPEAKERS,
            ENTITY_SPK_INPUT_TERMINAL,
            SPEAKER_CHANNELS,
            EP_AUDIO_OUT_ADDR,
            ISO_SYNC_ADAPTIVE,
        ),
        microphone: streaming_interface(
            ITF_NUM_AUDIO_STREAMING_MIC,
            STRID_MICROPHONE,
            ENTITY_MIC_OUTPUT_TERMINAL,
            MIC_CHANNELS,
            EP_AUDIO_IN_ADDR,
            ISO_SYNC_ASYNC,
        ),
    }
}

pub static LASER_SOUND_CARD: DescriptorSet<LaserSoundCardConfiguration> = DescriptorSet {
    device: UsbDeviceDescriptor {
        length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
        descriptor_type: UsbDescType::Device,
        bcd_usb: le16(0x0200),
        // IAD rules: the device-level class must be misc/common/IAD.
        device_class: class::MISC,
        device_subclass: class::MISC_SUBCLASS_COMMON,
        device_protocol: class::MISC_PROTOCOL_IAD,
        max_packet_size0: 64,
        vendor: le16(VENDOR_ID),
        product: le16(
            EnabledClasses {
                cdc: false,
                msc: false,
                hid: false,
                midi: false,
                audio: true,
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
    configuration: LaserSoundCardConfiguration {
        config: UsbConfigurationDescriptor {
            length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
            descriptor_type: UsbDescType::Config,
            total_length: le16(core::mem::size_of::<LaserSoundCardConfiguration>() as u16),
            num_interfaces: ITF_NUM_TOTAL,
            configuration_value: 1,
            configuration_s: 0,
            attributes: 0x80,
            max_power: 50,
        },
        headset: headset_function(STRID_PRODUCT),
    },
    strings: &[
        StringEntry::Language(LANGUAGE_EN_US),
        StringEntry::Ascii("IPM Group"),
        StringEntry::Ascii("Laser Sound Card"),
        StringEntry::SerialNumber,
        StringEntry::Ascii("Laser Speakers"),
        StringEntry::Ascii("Laser Microphone"),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{NoSerialNumber, StringScratch};
    use core::mem::size_of;

    #[test]
    fn class_specific_record_sizes() {
        assert_eq!(size_of::<AcHeaderDescriptor>(), 9);
        assert_eq!(size_of::<ClockSourceDescriptor>(), 8);
        assert_eq!(size_of::<InputTerminalDescriptor>(), 17);
        assert_eq!(size_of::<OutputTerminalDescriptor>(), 12);
        assert_eq!(size_of::<StereoFeatureUnitDescriptor>(), 18);
        assert_eq!(size_of::<AsGeneralDescriptor>(), 16);
        assert_eq!(size_of::<TypeIFormatDescriptor>(), 6);
        assert_eq!(size_of::<CsIsoEndpointDescriptor>(), 8);
        assert_eq!(size_of::<HeadsetFunction>(), 319);
    }

    #[test]
    fn configuration_total_length_matches() {
        let bytes = LASER_SOUND_CARD.configuration_descriptor(0);
        assert_eq!(bytes.len(), 9 + 319);
        assert_eq!(usize::from(u16::from_le_bytes([bytes[2], bytes[3]])), bytes.len());
        assert_eq!(bytes[4], 3, "interface count");
    }

    #[test]
    fn ac_header_covers_topology() {
        let topology = &LASER_SOUND_CARD.configuration.headset.topology;
        assert_eq!(topology.header.total_length.get(), 93);
        assert_eq!(usize::from(topology.header.total_length.get()), topology.as_bytes().len());
    }

    #[test]
    fn configuration_records_chain() {
        let bytes = LASER_SOUND_CARD.configuration_descriptor(0);
        let mut offset = 0;
        let mut interfaces = 0;
        let mut endpoints = Vec::new();
        while offset < bytes.len() {
            let len = usize::from(bytes[offset]);
            assert!(len >= 2);
            match bytes[offset + 1] {
                0x04 => interfaces += 1,
                0x05 => endpoints.push(bytes[offset + 2]),
                _ => {}
            }
            offset += len;
        }
        assert_eq!(offset, bytes.len());
        // AC + (idle, 16, 24) for each streaming interface.
        assert_eq!(interfaces, 7);
        assert_eq!(endpoints, [0x82, 0x01, 0x01, 0x81, 0x81]);
    }

    #[test]
    fn iso_packet_sizes() {
        let headset = &LASER_SOUND_CARD.configuration.headset;
        assert_eq!(headset.speaker.pcm16.endpoint.max_packet_size.get(), 388);
        assert_eq!(headset.speaker.pcm24.endpoint.max_packet_size.get(), 776);
        assert_eq!(headset.microphone.pcm16.endpoint.max_packet_size.get(), 194);
        assert_eq!(headset.microphone.pcm24.endpoint.max_packet_size.get(), 388);
        assert_eq!(headset.speaker.pcm16.endpoint.attributes, 0x09);
        assert_eq!(headset.microphone.pcm16.endpoint.attributes, 0x05);
    }

    #[test]
    fn device_identity() {
        let device = LASER_SOUND_CARD.device_descriptor();
        assert_eq!(device.len(), 18);
        assert_eq!(&device[8..12], &[0xFE, 0xCA, 0x10, 0x40]);
    }

    #[test]
    fn strings() {
        let mut scratch = StringScratch::new();
        let units = LASER_SOUND_CARD
            .string_descriptor(STRID_PRODUCT, 0x0409, &mut scratch, &mut NoSerialNumber)
            .unwrap();
        // "Laser Sound Card" is 16 characters.
        assert_eq!(units[0].get(), 0x0300 | 34);
        assert!(LASER_SOUND_CARD
            .string_descriptor(6, 0x0409, &mut scratch, &mut NoSerialNumber)
            .is_none());
    }
}
