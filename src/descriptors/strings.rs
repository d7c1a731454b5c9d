// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! String descriptors.
//!
//! USB strings travel as UTF-16LE, prefixed with a two-byte header (length,
//! then type). We keep ours as plain ASCII in flash and widen them on demand
//! into a scratch buffer, one request at a time.

use byteorder::LittleEndian;
use zerocopy::U16;

use crate::usb::UsbDescType;

/// Maximum number of UTF-16 code units a single string descriptor carries,
/// not counting the header unit.
pub const MAX_STRING_UNITS: usize = 32;

/// US English, the only language we offer.
pub const LANGUAGE_EN_US: u16 = 0x0409;

/// One slot in a string table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StringEntry {
    /// Index 0 is special: instead of text, it lists supported languages.
    Language(u16),
    /// An ASCII string. Each byte becomes one UTF-16 code unit, so anything
    /// outside ASCII comes out garbled. Don't put it in here.
    Ascii(&'static str),
    /// Placeholder for the board's unique serial number, fetched from a
    /// `SerialNumberSource` at request time.
    SerialNumber,
}

/// Staging area for one string descriptor response: the header unit followed
/// by up to `MAX_STRING_UNITS` characters.
///
/// A response borrows this buffer, so it stays valid until the next request
/// reuses it. The host only ever has one control transfer in flight, so
/// there's nothing to share.
pub struct StringScratch {
    units: [U16<LittleEndian>; MAX_STRING_UNITS + 1],
}

impl StringScratch {
    pub const fn new() -> Self {
        Self {
            units: [crate::usb::le16(0); MAX_STRING_UNITS + 1],
        }
    }
}

impl Default for StringScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that can produce a device-unique serial number.
pub trait SerialNumberSource {
    /// Writes up to `out.len()` UTF-16 code units into `out` and returns how
    /// many were written. Returning 0 means "no serial number available".
    fn read_serial(&mut self, out: &mut [U16<LittleEndian>]) -> usize;
}

impl<F> SerialNumberSource for F
where
    F: FnMut(&mut [U16<LittleEndian>]) -> usize,
{
    fn read_serial(&mut self, out: &mut [U16<LittleEndian>]) -> usize {
        self(out)
    }
}

/// For boards that don't have a unique ID we can get at.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoSerialNumber;

impl SerialNumberSource for NoSerialNumber {
    fn read_serial(&mut self, _out: &mut [U16<LittleEndian>]) -> usize {
        0
    }
}

/// Presents an 8-byte unique ID (e.g. the one most QSPI flash chips carry) as
/// 16 uppercase hex digits.
#[derive(Copy, Clone, Debug)]
pub struct HexSerialNumber {
    pub bytes: [u8; 8],
}

impl SerialNumberSource for HexSerialNumber {
    fn read_serial(&mut self, out: &mut [U16<LittleEndian>]) -> usize {
        const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

        let nibbles = self
            .bytes
            .iter()
            .flat_map(|b| [b >> 4, b & 0xF]);
        let mut n = 0;
        for (slot, nibble) in out.iter_mut().zip(nibbles) {
            slot.set(u16::from(DIGITS[usize::from(nibble)]));
            n += 1;
        }
        n
    }
}

/// Produces string descriptor `index` from `table` into `scratch`.
///
/// The returned slice is the complete descriptor: a header unit (type in the
/// high byte, byte length in the low byte) followed by the characters. Use
/// `zerocopy::AsBytes::as_bytes` on it to get the wire bytes.
///
/// Returns `None` if `index` is past the end of the table. `_language_id` is
/// accepted for the sake of the request format; we only speak one language.
pub fn string_descriptor<'b>(
    table: &[StringEntry],
    index: u8,
    _language_id: u16,
    scratch: &'b mut StringScratch,
    serial: &mut impl SerialNumberSource,
) -> Option<&'b [U16<LittleEndian>]> {
    let entry = match table.get(usize::from(index)) {
        Some(e) => e,
        None => {
            log::debug!("string descriptor {} not found", index);
            return None;
        }
    };

    let (header, body) = scratch.units.split_at_mut(1);
    let count = match *entry {
        StringEntry::Language(code) => {
            body[0].set(code);
            1
        }
        StringEntry::SerialNumber => {
            // Don't trust the source to stay inside the buffer it was given.
            serial.read_serial(body).min(MAX_STRING_UNITS)
        }
        StringEntry::Ascii(s) => {
            let mut n = 0;
            for (slot, b) in body.iter_mut().zip(s.bytes()) {
                slot.set(u16::from(b));
                n += 1;
            }
            n
        }
    };

    let byte_len = 2 * count as u16 + 2;
    header[0].set((UsbDescType::String as u16) << 8 | byte_len);

    Some(&scratch.units[..1 + count])
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes;

    const TABLE: &[StringEntry] = &[
        StringEntry::Language(LANGUAGE_EN_US),
        StringEntry::Ascii("ppm_loop"),
        StringEntry::Ascii(""),
        StringEntry::SerialNumber,
        StringEntry::Ascii("0123456789abcdefghijklmnopqrstuvwxyz"),
    ];

    fn header_len(units: &[U16<LittleEndian>]) -> usize {
        usize::from(units[0].get() & 0xFF)
    }

    #[test]
    fn ascii_string_is_widened() {
        let mut scratch = StringScratch::new();
        let units = string_descriptor(TABLE, 1, LANGUAGE_EN_US, &mut scratch, &mut NoSerialNumber)
            .unwrap();

        assert_eq!(units[0].get() >> 8, 0x03);
        assert_eq!(header_len(units), 18);
        assert_eq!(units.as_bytes().len(), 18);
        let chars: Vec<u16> = units[1..].iter().map(|u| u.get()).collect();
        let expected: Vec<u16> = "ppm_loop".bytes().map(u16::from).collect();
        assert_eq!(chars, expected);
        // Wire format: length, type, then UTF-16LE.
        assert_eq!(&units.as_bytes()[..4], &[18, 0x03, b'p', 0]);
    }

    #[test]
    fn language_slot() {
        let mut scratch = StringScratch::new();
        let units = string_descriptor(TABLE, 0, 0, &mut scratch, &mut NoSerialNumber).unwrap();
        assert_eq!(units.as_bytes(), &[4, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn out_of_range_index_is_not_found() {
        let mut scratch = StringScratch::new();
        for index in TABLE.len()..=255 {
            assert!(
                string_descriptor(TABLE, index as u8, 0, &mut scratch, &mut NoSerialNumber).is_none(),
                "index {}",
                index
            );
        }
    }

    #[test]
    fn long_strings_are_truncated() {
        let mut scratch = StringScratch::new();
        let units = string_descriptor(TABLE, 4, 0, &mut scratch, &mut NoSerialNumber).unwrap();
        assert_eq!(units.len(), 1 + MAX_STRING_UNITS);
        assert_eq!(header_len(units), 2 * MAX_STRING_UNITS + 2);
        assert_eq!(units[MAX_STRING_UNITS].get(), u16::from(b'v'));
    }

    #[test]
    fn empty_string_is_header_only() {
        let mut scratch = StringScratch::new();
        let units = string_descriptor(TABLE, 2, 0, &mut scratch, &mut NoSerialNumber).unwrap();
        assert_eq!(units.as_bytes(), &[2, 0x03]);
    }

    #[test]
    fn missing_serial_still_has_header() {
        let mut scratch = StringScratch::new();
        let units = string_descriptor(TABLE, 3, 0, &mut scratch, &mut NoSerialNumber).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(header_len(units), 2);
    }

    #[test]
    fn hex_serial() {
        let mut scratch = StringScratch::new();
        let mut serial = HexSerialNumber {
            bytes: [0xE6, 0x60, 0x58, 0x38, 0x83, 0x2F, 0x1A, 0x2B],
        };
        let units = string_descriptor(TABLE, 3, 0, &mut scratch, &mut serial).unwrap();
        assert_eq!(header_len(units), 34);
        let text: Vec<u8> = units[1..].iter().map(|u| u.get() as u8).collect();
        assert_eq!(text, b"E6605838832F1A2B");
    }

    #[test]
    fn serial_source_sees_only_the_payload_area() {
        let mut scratch = StringScratch::new();
        let mut offered = 0;
        let mut source = |out: &mut [U16<LittleEndian>]| {
            offered = out.len();
            // Claims more than it could possibly have written.
            1000
        };
        let units = string_descriptor(TABLE, 3, 0, &mut scratch, &mut source).unwrap();
        assert_eq!(units.len(), 1 + MAX_STRING_UNITS);
        assert_eq!(offered, MAX_STRING_UNITS);
    }

    #[test]
    fn every_valid_index_has_consistent_length() {
        let mut scratch = StringScratch::new();
        for index in 0..TABLE.len() as u8 {
            let units =
                string_descriptor(TABLE, index, 0, &mut scratch, &mut NoSerialNumber).unwrap();
            assert_eq!(header_len(units), units.as_bytes().len());
            assert_eq!(header_len(units), 2 * (units.len() - 1) + 2);
        }
    }
}
