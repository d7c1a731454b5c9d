// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Talking to the flash chip for its unique ID.
//!
//! RP2040 has no unique ID of its own, so the USB serial number comes from
//! the QSPI flash chip's instead. Getting at it means stepping the chip out
//! of execute-in-place mode, clocking a raw command frame through the SSI,
//! and putting XIP back. The firmware does that part (from RAM, through the
//! boot ROM's flash routines); this module has the frames and the boot ROM
//! table codes.

/// Read Unique ID: the command, four dummy bytes, then the ID.
pub const READ_UNIQUE_ID: u8 = 0x4B;
pub const UNIQUE_ID_DUMMY_BYTES: usize = 4;
pub const UNIQUE_ID_BYTES: usize = 8;
pub const UNIQUE_ID_FRAME_LEN: usize = 1 + UNIQUE_ID_DUMMY_BYTES + UNIQUE_ID_BYTES;

/// Read JEDEC ID: the command, then manufacturer, memory type and capacity.
pub const READ_JEDEC_ID: u8 = 0x9F;
pub const JEDEC_ID_FRAME_LEN: usize = 4;

/// The SSI FIFOs are 16 deep. Keeping the number of bytes written but not yet
/// read below this means the RX FIFO never overflows.
pub const MAX_IN_FLIGHT: usize = 16 - 2;

/// Boot ROM function table codes, built the way the ROM's lookup expects.
pub mod rom {
    pub const fn code(c1: u8, c2: u8) -> u32 {
        c1 as u32 | (c2 as u32) << 8
    }

    /// Hands the QSPI pads to the SSI.
    pub const CONNECT_INTERNAL_FLASH: u32 = code(b'I', b'F');
    /// Leaves XIP so raw commands can be sent.
    pub const FLASH_EXIT_XIP: u32 = code(b'E', b'X');
    /// Drops whatever the XIP cache held.
    pub const FLASH_FLUSH_CACHE: u32 = code(b'F', b'C');
    /// Back to (slow, serial) XIP.
    pub const FLASH_ENTER_CMD_XIP: u32 = code(b'C', b'X');

    /// Where the ROM keeps a 16-bit pointer to its function table.
    pub const FUNC_TABLE_PTR: usize = 0x14;
    /// Where the ROM keeps a 16-bit pointer to `rom_table_lookup`.
    pub const TABLE_LOOKUP_PTR: usize = 0x18;
}

/// The bytes to clock out for Read Unique ID. Whatever follows the command
/// is ignored by the chip.
pub const fn unique_id_frame() -> [u8; UNIQUE_ID_FRAME_LEN] {
    let mut frame = [0; UNIQUE_ID_FRAME_LEN];
    frame[0] = READ_UNIQUE_ID;
    frame
}

/// Pulls the ID out of what came back while `unique_id_frame` went out.
pub fn unique_id(response: &[u8; UNIQUE_ID_FRAME_LEN]) -> [u8; UNIQUE_ID_BYTES] {
    let mut id = [0; UNIQUE_ID_BYTES];
    id.copy_from_slice(&response[1 + UNIQUE_ID_DUMMY_BYTES..]);
    id
}

pub const fn jedec_id_frame() -> [u8; JEDEC_ID_FRAME_LEN] {
    [READ_JEDEC_ID, 0, 0, 0]
}

/// Manufacturer, memory type and capacity, as one 24-bit number.
pub fn jedec_id(response: &[u8; JEDEC_ID_FRAME_LEN]) -> u32 {
    u32::from(response[1]) << 16 | u32::from(response[2]) << 8 | u32::from(response[3])
}

/// Chips without a unique ID, or a bus with nothing on it, read back as all
/// zeros or all ones.
pub fn is_plausible(id: &[u8; UNIQUE_ID_BYTES]) -> bool {
    !id.iter().all(|&b| b == 0x00) && !id.iter().all(|&b| b == 0xFF)
}
