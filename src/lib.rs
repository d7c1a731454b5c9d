// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Laser loop firmware support library.
//!
//! Everything here is plain `no_std` data and logic, with no register access,
//! so it builds and tests on the host:
//!
//! - `usb`: standard USB records and constants.
//! - `control`: staging for multi-packet control transfers, both directions.
//! - `descriptors`: the descriptor tables for our two device variants, and the
//!   accessors that serve them during enumeration.
//! - `flash_id`: command frames for reading the flash chip's unique ID, our
//!   serial number.
//! - `pio`: the pulse generator/detector PIO programs, the tooling to encode
//!   and load them, and a simulator to check their timing.
//!
//! The firmware binary (`src/main.rs`) wires these to the hardware.

#![cfg_attr(not(test), no_std)]

pub mod control;
pub mod descriptors;
pub mod flash_id;
pub mod pio;
pub mod usb;
