// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PIO programs and the plumbing around them.
//!
//! The RP2040's PIO blocks run tiny programs, one instruction per clock, out
//! of a shared 32-word instruction memory. This module holds:
//!
//! - `instr`: the instruction set, as const-evaluable encoders, so programs
//!   are written as Rust constants and checked at build time.
//! - `Program` and `SmConfig`: what the firmware writes into the PIO
//!   registers to load and configure a state machine.
//! - `sim`: a cycle-level model of one state machine, so the programs can be
//!   tested on the host.
//! - `pulse_gen` / `pulse_detect`: the two programs this firmware exists for,
//!   each with a reference model of its timing.
//! - `loopback`: pacing commands so the detector measures every one.

use core::fmt;

pub mod instr;
pub mod loopback;
pub mod pulse_detect;
pub mod pulse_gen;
pub mod sim;

pub use instr::SideSet;

/// Words of instruction memory per PIO block.
pub const INSTRUCTION_MEMORY: usize = 32;

/// Depth of each (unjoined) FIFO.
pub const FIFO_DEPTH: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PioError {
    /// Word doesn't decode to any instruction.
    InvalidInstruction(u16),
    /// Valid instruction that the simulator doesn't model.
    Unsupported(&'static str),
    /// Program doesn't fit in instruction memory at the requested offset.
    ProgramTooLarge { len: usize, offset: u8 },
}

impl fmt::Display for PioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PioError::InvalidInstruction(word) => {
                write!(f, "invalid PIO instruction {:#06x}", word)
            }
            PioError::Unsupported(what) => write!(f, "unsupported PIO operation: {}", what),
            PioError::ProgramTooLarge { len, offset } => write!(
                f,
                "program of {} instructions does not fit at offset {}",
                len, offset
            ),
        }
    }
}

/// Program counter values bounding the wrap loop: after executing `source`
/// (without a jump), execution continues at `target`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Wrap {
    pub source: u8,
    pub target: u8,
}

/// An assembled program, with addresses relative to its first instruction.
#[derive(Copy, Clone, Debug)]
pub struct Program {
    pub code: &'static [u16],
    pub wrap: Wrap,
    pub side_set: SideSet,
}

impl Program {
    fn check_fits(&self, offset: u8) -> Result<(), PioError> {
        if usize::from(offset) + self.code.len() > INSTRUCTION_MEMORY {
            return Err(PioError::ProgramTooLarge {
                len: self.code.len(),
                offset,
            });
        }
        Ok(())
    }

    /// Yields the program's words as they should be written to instruction
    /// memory starting at `offset`. JMP targets are absolute in hardware, so
    /// they get `offset` added; nothing else moves.
    pub fn relocated(&self, offset: u8) -> Result<impl Iterator<Item = u16> + '_, PioError> {
        self.check_fits(offset)?;
        Ok(self.code.iter().map(move |&word| {
            if word >> 13 == 0 {
                let target = (word & 0x1F) + u16::from(offset);
                (word & !0x1F) | (target & 0x1F)
            } else {
                word
            }
        }))
    }

    /// The wrap bounds once loaded at `offset`.
    pub fn wrap_at(&self, offset: u8) -> Result<Wrap, PioError> {
        self.check_fits(offset)?;
        let too_large = PioError::ProgramTooLarge {
            len: self.code.len(),
            offset,
        };
        Ok(Wrap {
            source: self.wrap.source.checked_add(offset).ok_or(too_large)?,
            target: self.wrap.target.checked_add(offset).ok_or(too_large)?,
        })
    }
}

/// Fixed-point clock divider, 16.8. Zero in the integer part means 65536.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockDivider {
    pub int: u16,
    pub frac: u8,
}

impl ClockDivider {
    /// Run at the full system clock.
    pub const FULL_SPEED: ClockDivider = ClockDivider { int: 1, frac: 0 };
}

/// What `mov x, status` reads: all ones if the chosen FIFO holds fewer than
/// `n` entries, else all zeroes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MovStatus {
    TxLessThan(u8),
    RxLessThan(u8),
}

/// Configuration of one state machine, in the terms the registers use.
///
/// Autopush and autopull aren't offered. Our programs push and pull by hand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SmConfig {
    pub clock_divider: ClockDivider,
    pub side_set: SideSet,
    pub side_set_base: u8,
    pub set_base: u8,
    pub set_count: u8,
    pub out_base: u8,
    pub out_count: u8,
    pub in_base: u8,
    pub jmp_pin: u8,
    /// Absolute addresses, i.e. already offset.
    pub wrap: Wrap,
    pub in_shift_right: bool,
    pub out_shift_right: bool,
    /// 1..=32
    pub push_threshold: u8,
    /// 1..=32
    pub pull_threshold: u8,
    pub status: MovStatus,
}

impl Default for SmConfig {
    /// The hardware's reset state.
    fn default() -> Self {
        Self {
            clock_divider: ClockDivider::FULL_SPEED,
            side_set: SideSet::NONE,
            side_set_base: 0,
            set_base: 0,
            set_count: 5,
            out_base: 0,
            out_count: 0,
            in_base: 0,
            jmp_pin: 0,
            wrap: Wrap {
                source: (INSTRUCTION_MEMORY - 1) as u8,
                target: 0,
            },
            in_shift_right: true,
            out_shift_right: true,
            push_threshold: 32,
            pull_threshold: 32,
            status: MovStatus::TxLessThan(0),
        }
    }
}

impl SmConfig {
    /// Starting point for a program loaded at `offset`: reset values, plus
    /// the program's own side-set layout and wrap.
    pub fn for_program(program: &Program, offset: u8) -> Result<Self, PioError> {
        Ok(Self {
            side_set: program.side_set,
            wrap: program.wrap_at(offset)?,
            ..Self::default()
        })
    }

    /// Value for `SMx_CLKDIV`.
    pub fn clkdiv_bits(&self) -> u32 {
        u32::from(self.clock_divider.int) << 16 | u32::from(self.clock_divider.frac) << 8
    }

    /// Value for `SMx_EXECCTRL`.
    pub fn execctrl_bits(&self) -> u32 {
        let (status_sel, status_n) = match self.status {
            MovStatus::TxLessThan(n) => (0, n),
            MovStatus::RxLessThan(n) => (1, n),
        };
        let side_en = self.side_set.optional() as u32;
        let side_pindir = self.side_set.pindirs() as u32;
        side_en << 30
            | side_pindir << 29
            | u32::from(self.jmp_pin & 0x1F) << 24
            | u32::from(self.wrap.source & 0x1F) << 12
            | u32::from(self.wrap.target & 0x1F) << 7
            | status_sel << 4
            | u32::from(status_n & 0xF)
    }

    /// Value for `SMx_SHIFTCTRL`.
    pub fn shiftctrl_bits(&self) -> u32 {
        // A threshold of 32 is written as 0.
        u32::from(self.pull_threshold & 0x1F) << 25
            | u32::from(self.push_threshold & 0x1F) << 20
            | (self.out_shift_right as u32) << 19
            | (self.in_shift_right as u32) << 18
    }

    /// Value for `SMx_PINCTRL`.
    pub fn pinctrl_bits(&self) -> u32 {
        u32::from(self.side_set.field_bits()) << 29
            | u32::from(self.set_count & 0x7) << 26
            | u32::from(self.out_count & 0x3F) << 20
            | u32::from(self.in_base & 0x1F) << 15
            | u32::from(self.side_set_base & 0x1F) << 10
            | u32::from(self.set_base & 0x1F) << 5
            | u32::from(self.out_base & 0x1F)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static THREE_JUMPS: Program = Program {
        code: &[0x0001, 0xA042, 0x0040],
        wrap: Wrap {
            source: 2,
            target: 0,
        },
        side_set: SideSet::NONE,
    };

    #[test]
    fn relocation_moves_only_jump_targets() {
        let words: Vec<u16> = THREE_JUMPS.relocated(10).unwrap().collect();
        assert_eq!(words, vec![0x000B, 0xA042, 0x004A]);
        assert_eq!(THREE_JUMPS.wrap_at(10), Ok(Wrap { source: 12, target: 10 }));
    }

    #[test]
    fn relocation_checks_space() {
        assert!(THREE_JUMPS.relocated(29).is_ok());
        assert_eq!(
            THREE_JUMPS.relocated(30).err(),
            Some(PioError::ProgramTooLarge { len: 3, offset: 30 })
        );
    }

    #[test]
    fn wrap_past_instruction_memory_is_an_error() {
        assert_eq!(THREE_JUMPS.wrap_at(29), Ok(Wrap { source: 31, target: 29 }));
        for offset in [30, 200, 255] {
            assert_eq!(
                THREE_JUMPS.wrap_at(offset),
                Err(PioError::ProgramTooLarge { len: 3, offset })
            );
            assert!(SmConfig::for_program(&THREE_JUMPS, offset).is_err());
        }
    }

    #[test]
    fn default_config_is_reset_state() {
        let config = SmConfig::default();
        assert_eq!(config.clkdiv_bits(), 0x0001_0000);
        assert_eq!(config.execctrl_bits(), 0x0001_F000);
        assert_eq!(config.shiftctrl_bits(), 0x000C_0000);
        assert_eq!(config.pinctrl_bits(), 0x1400_0000);
    }

    #[test]
    fn register_fields() {
        let config = SmConfig {
            clock_divider: ClockDivider { int: 2, frac: 0x80 },
            side_set: SideSet::new(1, true, true),
            side_set_base: 14,
            in_base: 15,
            jmp_pin: 15,
            wrap: Wrap { source: 12, target: 4 },
            status: MovStatus::RxLessThan(2),
            push_threshold: 8,
            in_shift_right: false,
            ..SmConfig::default()
        };
        assert_eq!(config.clkdiv_bits(), 0x0002_8000);
        assert_eq!(
            config.execctrl_bits(),
            1 << 30 | 1 << 29 | 15 << 24 | 12 << 12 | 4 << 7 | 1 << 4 | 2
        );
        assert_eq!(config.shiftctrl_bits(), 8 << 20 | 1 << 19);
        assert_eq!(config.pinctrl_bits(), 2 << 29 | 5 << 26 | 15 << 15 | 14 << 10);
    }

    #[test]
    fn error_display() {
        let msg = format!("{}", PioError::InvalidInstruction(0xA018));
        assert_eq!(msg, "invalid PIO instruction 0xa018");
    }
}
