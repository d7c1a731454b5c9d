// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control transfer data stages.
//!
//! EP0 moves 64 bytes at a time, and most of what we hand the host during
//! enumeration is longer than that. `ControlIn` holds one response and hands
//! it out a packet at a time, as the host collects each one. `ControlOut`
//! does the reverse for requests that carry data to us, like CDC
//! SET_LINE_CODING.

use heapless::Vec;

/// EP0 max packet size; matches `max_packet_size0` in our device
/// descriptors.
pub const EP0_PACKET_SIZE: usize = 64;

/// Largest response we'll stage. The audio configuration descriptor is the
/// biggest thing we send.
pub const CONTROL_IN_CAPACITY: usize = 512;

/// Largest OUT data stage we keep. Longer ones are acknowledged but cut.
pub const CONTROL_OUT_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct TooLarge(pub usize);

pub struct ControlIn {
    data: Vec<u8, CONTROL_IN_CAPACITY>,
    sent: usize,
    /// Ends a transfer that is shorter than requested but a whole number of
    /// packets, so the host doesn't wait for more.
    zlp_pending: bool,
}

impl ControlIn {
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            sent: 0,
            zlp_pending: false,
        }
    }

    /// Abandons any transfer in progress.
    pub fn clear(&mut self) {
        self.data.clear();
        self.sent = 0;
        self.zlp_pending = false;
    }

    /// Stages `bytes`, cut to the `requested` length from the SETUP packet.
    /// On error nothing is staged.
    pub fn start(&mut self, bytes: &[u8], requested: u16) -> Result<(), TooLarge> {
        self.clear();
        let len = bytes.len().min(usize::from(requested));
        self.data
            .extend_from_slice(&bytes[..len])
            .map_err(|_| TooLarge(len))?;
        self.zlp_pending = len < usize::from(requested) && len % EP0_PACKET_SIZE == 0;
        Ok(())
    }

    /// The next packet to send, if any. A staged empty response still
    /// produces one (empty) packet.
    pub fn next_chunk(&mut self) -> Option<&[u8]> {
        if self.sent < self.data.len() {
            let end = (self.sent + EP0_PACKET_SIZE).min(self.data.len());
            let chunk = &self.data[self.sent..end];
            self.sent = end;
            Some(chunk)
        } else if self.zlp_pending {
            self.zlp_pending = false;
            Some(&[])
        } else {
            None
        }
    }
}

impl Default for ControlIn {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do after an OUT data packet arrived.
#[derive(Debug, PartialEq, Eq)]
pub enum OutProgress {
    /// Arm EP0 OUT again, for this many bytes.
    More(usize),
    /// The data stage is over; send the status ZLP.
    Done,
}

/// An OUT data stage on EP0.
pub struct ControlOut {
    request_type: u8,
    request: u8,
    expected: usize,
    received: usize,
    data: Vec<u8, CONTROL_OUT_CAPACITY>,
    active: bool,
}

impl ControlOut {
    pub const fn new() -> Self {
        Self {
            request_type: 0,
            request: 0,
            expected: 0,
            received: 0,
            data: Vec::new(),
            active: false,
        }
    }

    pub fn clear(&mut self) {
        self.request_type = 0;
        self.request = 0;
        self.expected = 0;
        self.received = 0;
        self.data.clear();
        self.active = false;
    }

    /// Begins the data stage of a request with `wLength` = `length`. Returns
    /// how many bytes to arm EP0 OUT for, or `None` if there is no data stage
    /// and the status ZLP can go out right away.
    pub fn start(&mut self, request_type: u8, request: u8, length: u16) -> Option<usize> {
        self.clear();
        self.request_type = request_type;
        self.request = request;
        self.expected = usize::from(length);
        if self.expected == 0 {
            return None;
        }
        self.active = true;
        Some(self.expected.min(EP0_PACKET_SIZE))
    }

    /// Whether an OUT data stage is in progress. When it isn't, a completed
    /// EP0 OUT buffer is the status stage of an IN transfer.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Takes one packet of the data stage. A short packet ends the stage
    /// early, as does reaching `wLength`.
    pub fn receive(&mut self, packet: &[u8]) -> OutProgress {
        let room = CONTROL_OUT_CAPACITY - self.data.len();
        // Can't fail: at most `room` bytes.
        let _ = self.data.extend_from_slice(&packet[..packet.len().min(room)]);
        self.received += packet.len();
        if self.received >= self.expected || packet.len() < EP0_PACKET_SIZE {
            self.active = false;
            OutProgress::Done
        } else {
            OutProgress::More((self.expected - self.received).min(EP0_PACKET_SIZE))
        }
    }

    pub fn request_type(&self) -> u8 {
        self.request_type
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    /// Bytes received so far, up to `CONTROL_OUT_CAPACITY`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Default for ControlOut {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::cdc::{SET_CONTROL_LINE_STATE, SET_LINE_CODING};

    fn chunk_lengths(c: &mut ControlIn) -> std::vec::Vec<usize> {
        let mut lengths = std::vec::Vec::new();
        while let Some(chunk) = c.next_chunk() {
            lengths.push(chunk.len());
        }
        lengths
    }

    #[test]
    fn short_response_is_one_packet() {
        let mut c = ControlIn::new();
        c.start(&[1; 18], 64).unwrap();
        assert_eq!(chunk_lengths(&mut c), vec![18]);
    }

    #[test]
    fn truncated_to_request() {
        let mut c = ControlIn::new();
        let config = [7u8; 100];
        c.start(&config, 9).unwrap();
        assert_eq!(c.next_chunk(), Some(&config[..9]));
        assert_eq!(c.next_chunk(), None);
    }

    #[test]
    fn long_response_is_split() {
        let mut c = ControlIn::new();
        let bytes: std::vec::Vec<u8> = (0..150).map(|i| i as u8).collect();
        c.start(&bytes, 0xFFFF).unwrap();
        let first = c.next_chunk().unwrap().to_vec();
        assert_eq!(first, &bytes[..64]);
        assert_eq!(chunk_lengths(&mut c), vec![64, 22]);
    }

    #[test]
    fn whole_packets_short_of_request_end_with_zlp() {
        let mut c = ControlIn::new();
        c.start(&[0; 128], 255).unwrap();
        assert_eq!(chunk_lengths(&mut c), vec![64, 64, 0]);

        // Exactly what was asked for: no ZLP.
        c.start(&[0; 128], 128).unwrap();
        assert_eq!(chunk_lengths(&mut c), vec![64, 64]);
    }

    #[test]
    fn empty_response_sends_zlp() {
        let mut c = ControlIn::new();
        c.start(&[], 10).unwrap();
        assert_eq!(chunk_lengths(&mut c), vec![0]);
    }

    #[test]
    fn clear_abandons_transfer() {
        let mut c = ControlIn::new();
        c.start(&[0; 100], 100).unwrap();
        c.next_chunk();
        c.clear();
        assert_eq!(c.next_chunk(), None);
    }

    #[test]
    fn too_large_stages_nothing() {
        let mut c = ControlIn::new();
        let bytes = [0u8; CONTROL_IN_CAPACITY + 1];
        assert!(matches!(c.start(&bytes, 0xFFFF), Err(TooLarge(n)) if n == CONTROL_IN_CAPACITY + 1));
        assert_eq!(c.next_chunk(), None);
    }

    #[test]
    fn out_without_data_stage() {
        let mut c = ControlOut::new();
        assert_eq!(c.start(0x21, SET_CONTROL_LINE_STATE, 0), None);
        assert!(!c.is_active());
    }

    #[test]
    fn line_coding_sized_out() {
        // SET_LINE_CODING: 7 bytes in one packet, then status.
        let mut c = ControlOut::new();
        assert_eq!(c.start(0x21, SET_LINE_CODING, 7), Some(7));
        assert!(c.is_active());
        assert_eq!(c.receive(&[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]), OutProgress::Done);
        assert!(!c.is_active());
        assert_eq!(c.request_type(), 0x21);
        assert_eq!(c.request(), SET_LINE_CODING);
        assert_eq!(c.data(), &[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]);
    }

    #[test]
    fn multi_packet_out() {
        let mut c = ControlOut::new();
        assert_eq!(c.start(0x40, 1, 100), Some(64));
        assert_eq!(c.receive(&[1; 64]), OutProgress::More(36));
        assert_eq!(c.receive(&[2; 36]), OutProgress::Done);
        // Only the first packet fits.
        assert_eq!(c.data().len(), CONTROL_OUT_CAPACITY);
        assert!(c.data().iter().all(|&b| b == 1));
    }

    #[test]
    fn short_packet_ends_out_early() {
        let mut c = ControlOut::new();
        c.start(0x40, 1, 200);
        assert_eq!(c.receive(&[0; 10]), OutProgress::Done);
        assert!(!c.is_active());
    }

    #[test]
    fn new_setup_abandons_out() {
        let mut c = ControlOut::new();
        c.start(0x21, 0x20, 7);
        c.clear();
        assert!(!c.is_active());
        assert!(c.data().is_empty());
    }
}
