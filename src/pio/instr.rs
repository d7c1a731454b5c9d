// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PIO instruction encoding.
//!
//! Every PIO instruction is 16 bits:
//!
//! ```text
//!  15 13 12      8 7             0
//! +-----+---------+---------------+
//! | op  | dly/ss  |   operands    |
//! +-----+---------+---------------+
//! ```
//!
//! The 5-bit middle field is shared between a delay (extra idle cycles after
//! the instruction completes) and side-set (pin values driven as a side
//! effect). How many of those bits go to side-set is a property of the state
//! machine configuration, not of the instruction, so both encoding and
//! decoding need a `SideSet` to interpret it.

use core::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::PioError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum JmpCondition {
    Always = 0,
    /// `!x`: X is zero.
    XZero = 1,
    /// `x--`: X is nonzero, prior to decrement. X is decremented either way.
    XDecrement = 2,
    YZero = 3,
    YDecrement = 4,
    XNotEqualY = 5,
    /// The pin selected by `EXECCTRL_JMP_PIN` is high.
    Pin = 6,
    /// `!osre`: output shift register not empty.
    OsrNotEmpty = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum WaitSource {
    /// Absolute GPIO number.
    Gpio = 0,
    /// Relative to the input pin base.
    Pin = 1,
    Irq = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum InSource {
    Pins = 0,
    X = 1,
    Y = 2,
    Null = 3,
    Isr = 6,
    Osr = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum OutDestination {
    Pins = 0,
    X = 1,
    Y = 2,
    Null = 3,
    PinDirs = 4,
    Pc = 5,
    Isr = 6,
    Exec = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MovDestination {
    Pins = 0,
    X = 1,
    Y = 2,
    Exec = 4,
    Pc = 5,
    Isr = 6,
    Osr = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MovOp {
    None = 0,
    Invert = 1,
    BitReverse = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MovSource {
    Pins = 0,
    X = 1,
    Y = 2,
    Null = 3,
    Status = 5,
    Isr = 6,
    Osr = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum SetDestination {
    Pins = 0,
    X = 1,
    Y = 2,
    PinDirs = 4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Jmp { condition: JmpCondition, address: u8 },
    Wait { polarity: bool, source: WaitSource, index: u8 },
    /// `bit_count` is 1..=32.
    In { source: InSource, bit_count: u8 },
    /// `bit_count` is 1..=32.
    Out { destination: OutDestination, bit_count: u8 },
    Push { if_full: bool, block: bool },
    Pull { if_empty: bool, block: bool },
    Mov { destination: MovDestination, op: MovOp, source: MovSource },
    Irq { clear: bool, wait: bool, index: u8 },
    Set { destination: SetDestination, data: u8 },
}

/// The assembler's `nop`: `mov y, y`.
pub const NOP: Instruction = Instruction::Mov {
    destination: MovDestination::Y,
    op: MovOp::None,
    source: MovSource::Y,
};

/// How the delay/side-set field is split up for a given program.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SideSet {
    /// Number of side-set data bits, not counting the enable bit.
    bits: u8,
    /// If set, the field's MSB says whether this instruction side-sets at
    /// all, and costs one more delay bit.
    optional: bool,
    /// Side-set drives pin directions rather than pin values.
    pindirs: bool,
}

impl SideSet {
    /// All five bits are delay.
    pub const NONE: SideSet = SideSet {
        bits: 0,
        optional: false,
        pindirs: false,
    };

    pub const fn new(bits: u8, optional: bool, pindirs: bool) -> Self {
        assert!(bits + optional as u8 <= 5, "side-set field is only 5 bits");
        Self {
            bits,
            optional,
            pindirs,
        }
    }

    pub const fn bits(&self) -> u8 {
        self.bits
    }

    pub const fn optional(&self) -> bool {
        self.optional
    }

    pub const fn pindirs(&self) -> bool {
        self.pindirs
    }

    /// Bits of the delay/side-set field taken by side-set, including the
    /// enable bit. This is what goes in `PINCTRL_SIDESET_COUNT`.
    pub const fn field_bits(&self) -> u8 {
        self.bits + self.optional as u8
    }

    const fn delay_bits(&self) -> u8 {
        5 - self.field_bits()
    }

    pub const fn max_delay(&self) -> u8 {
        (1 << self.delay_bits()) - 1
    }
}

/// One instruction word, taken apart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub instruction: Instruction,
    pub side: Option<u8>,
    pub delay: u8,
}

impl Instruction {
    /// Opcode and operand bits, with the delay/side-set field left zero.
    const fn operand_bits(self) -> u16 {
        match self {
            Instruction::Jmp { condition, address } => {
                assert!(address < 32, "jmp target out of range");
                (condition as u16) << 5 | address as u16
            }
            Instruction::Wait {
                polarity,
                source,
                index,
            } => {
                assert!(index < 32, "wait index out of range");
                0x2000 | (polarity as u16) << 7 | (source as u16) << 5 | index as u16
            }
            Instruction::In { source, bit_count } => {
                assert!(bit_count >= 1 && bit_count <= 32, "bit count must be 1..=32");
                0x4000 | (source as u16) << 5 | (bit_count & 0x1F) as u16
            }
            Instruction::Out {
                destination,
                bit_count,
            } => {
                assert!(bit_count >= 1 && bit_count <= 32, "bit count must be 1..=32");
                0x6000 | (destination as u16) << 5 | (bit_count & 0x1F) as u16
            }
            Instruction::Push { if_full, block } => {
                0x8000 | (if_full as u16) << 6 | (block as u16) << 5
            }
            Instruction::Pull { if_empty, block } => {
                0x8080 | (if_empty as u16) << 6 | (block as u16) << 5
            }
            Instruction::Mov {
                destination,
                op,
                source,
            } => 0xA000 | (destination as u16) << 5 | (op as u16) << 3 | source as u16,
            Instruction::Irq { clear, wait, index } => {
                assert!(index < 32, "irq index out of range");
                0xC000 | (clear as u16) << 6 | (wait as u16) << 5 | index as u16
            }
            Instruction::Set { destination, data } => {
                assert!(data < 32, "set data is only 5 bits");
                0xE000 | (destination as u16) << 5 | data as u16
            }
        }
    }

    /// Assembles this instruction for a program using `side_set`.
    ///
    /// `side` must be given when side-set is mandatory and may be omitted when
    /// it's optional. Out-of-range values panic, which in a `const` context
    /// means the build fails.
    pub const fn encode(self, side_set: SideSet, side: Option<u8>, delay: u8) -> u16 {
        assert!(delay <= side_set.max_delay(), "delay too long for this side-set config");
        let delay_bits = side_set.delay_bits();

        let mut field = delay as u16;
        match side {
            Some(value) => {
                assert!(side_set.bits > 0, "program has no side-set");
                assert!(value < 1 << side_set.bits, "side-set value too wide");
                let mut s = value as u16;
                if side_set.optional {
                    s |= 1 << side_set.bits;
                }
                field |= s << delay_bits;
            }
            None => {
                assert!(
                    side_set.optional || side_set.bits == 0,
                    "side-set value is mandatory in this program"
                );
            }
        }

        self.operand_bits() | field << 8
    }

    /// Shorthand for an instruction with no side-set and no delay.
    pub const fn plain(self) -> u16 {
        self.encode(SideSet::NONE, None, 0)
    }
}

/// Takes an instruction word apart, given the program's side-set layout.
pub fn decode(word: u16, side_set: SideSet) -> Result<Decoded, PioError> {
    let invalid = PioError::InvalidInstruction(word);
    let bits_7_5 = (word >> 5) & 0x7;
    let bits_4_0 = (word & 0x1F) as u8;

    let instruction = match word >> 13 {
        0b000 => Instruction::Jmp {
            condition: JmpCondition::from_u16(bits_7_5).ok_or(invalid)?,
            address: bits_4_0,
        },
        0b001 => Instruction::Wait {
            polarity: word & 0x80 != 0,
            source: WaitSource::from_u16((word >> 5) & 0x3).ok_or(invalid)?,
            index: bits_4_0,
        },
        0b010 => Instruction::In {
            source: InSource::from_u16(bits_7_5).ok_or(invalid)?,
            bit_count: if bits_4_0 == 0 { 32 } else { bits_4_0 },
        },
        0b011 => Instruction::Out {
            destination: OutDestination::from_u16(bits_7_5).ok_or(invalid)?,
            bit_count: if bits_4_0 == 0 { 32 } else { bits_4_0 },
        },
        0b100 => {
            if word & 0x1F != 0 {
                return Err(invalid);
            }
            let flag = word & 0x40 != 0;
            let block = word & 0x20 != 0;
            if word & 0x80 == 0 {
                Instruction::Push {
                    if_full: flag,
                    block,
                }
            } else {
                Instruction::Pull {
                    if_empty: flag,
                    block,
                }
            }
        }
        0b101 => Instruction::Mov {
            destination: MovDestination::from_u16(bits_7_5).ok_or(invalid)?,
            op: MovOp::from_u16((word >> 3) & 0x3).ok_or(invalid)?,
            source: MovSource::from_u16(word & 0x7).ok_or(invalid)?,
        },
        0b110 => {
            if word & 0x80 != 0 {
                return Err(invalid);
            }
            Instruction::Irq {
                clear: word & 0x40 != 0,
                wait: word & 0x20 != 0,
                index: bits_4_0,
            }
        }
        _ => Instruction::Set {
            destination: SetDestination::from_u16(bits_7_5).ok_or(invalid)?,
            data: bits_4_0,
        },
    };

    let field = ((word >> 8) & 0x1F) as u8;
    let delay_bits = side_set.delay_bits();
    let delay = field & side_set.max_delay();
    let side_field = field >> delay_bits;
    let side = if side_set.bits == 0 {
        None
    } else if side_set.optional {
        if side_field & (1 << side_set.bits) != 0 {
            Some(side_field & ((1 << side_set.bits) - 1))
        } else {
            None
        }
    } else {
        Some(side_field)
    };

    Ok(Decoded {
        instruction,
        side,
        delay,
    })
}

/// Disassembles into (roughly) `pioasm` syntax, for logs.
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == NOP {
            return f.write_str("nop");
        }
        match *self {
            Instruction::Jmp { condition, address } => {
                let cond = match condition {
                    JmpCondition::Always => "",
                    JmpCondition::XZero => "!x ",
                    JmpCondition::XDecrement => "x-- ",
                    JmpCondition::YZero => "!y ",
                    JmpCondition::YDecrement => "y-- ",
                    JmpCondition::XNotEqualY => "x!=y ",
                    JmpCondition::Pin => "pin ",
                    JmpCondition::OsrNotEmpty => "!osre ",
                };
                write!(f, "jmp {}{}", cond, address)
            }
            Instruction::Wait {
                polarity,
                source,
                index,
            } => {
                let src = match source {
                    WaitSource::Gpio => "gpio",
                    WaitSource::Pin => "pin",
                    WaitSource::Irq => "irq",
                };
                write!(f, "wait {} {} {}", polarity as u8, src, index)
            }
            Instruction::In { source, bit_count } => write!(f, "in {:?}, {}", source, bit_count),
            Instruction::Out {
                destination,
                bit_count,
            } => write!(f, "out {:?}, {}", destination, bit_count),
            Instruction::Push { if_full, block } => write!(
                f,
                "push{} {}",
                if if_full { " iffull" } else { "" },
                if block { "block" } else { "noblock" }
            ),
            Instruction::Pull { if_empty, block } => write!(
                f,
                "pull{} {}",
                if if_empty { " ifempty" } else { "" },
                if block { "block" } else { "noblock" }
            ),
            Instruction::Mov {
                destination,
                op,
                source,
            } => {
                let op = match op {
                    MovOp::None => "",
                    MovOp::Invert => "~",
                    MovOp::BitReverse => "::",
                };
                write!(f, "mov {:?}, {}{:?}", destination, op, source)
            }
            Instruction::Irq { clear, wait, index } => {
                let mode = match (clear, wait) {
                    (true, _) => "clear",
                    (false, true) => "wait",
                    (false, false) => "set",
                };
                write!(f, "irq {} {}", mode, index)
            }
            Instruction::Set { destination, data } => write!(f, "set {:?}, {}", destination, data),
        }
    }
}
