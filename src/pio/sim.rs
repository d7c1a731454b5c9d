// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cycle-level model of a single PIO state machine.
//!
//! Good enough to check the timing of our programs on the host, which is
//! where all the interesting bugs in a PIO program live. Not modeled:
//! autopush/autopull, FIFO joining, `exec`, and the input synchronizer (pins
//! are read as given, as if `INPUT_SYNC_BYPASS` were set).

use heapless::Deque;

use super::instr::{
    self, Instruction, InSource, JmpCondition, MovDestination, MovOp, MovSource, OutDestination,
    SetDestination, WaitSource,
};
use super::{MovStatus, PioError, Program, SmConfig, FIFO_DEPTH, INSTRUCTION_MEMORY};

enum Outcome {
    /// Condition not met; retry the same instruction next cycle.
    Stall,
    Next,
    Jump(u8),
}

pub struct StateMachine {
    instr_mem: [u16; INSTRUCTION_MEMORY],
    config: SmConfig,
    pc: u8,
    x: u32,
    y: u32,
    osr: u32,
    /// Bits shifted out of the OSR since it was last filled. 32 is empty.
    osr_count: u8,
    isr: u32,
    /// Bits shifted into the ISR since it was last cleared.
    isr_count: u8,
    delay: u8,
    stalled: bool,
    /// An `irq wait` has set its flag and is waiting for it to clear.
    irq_waiting: bool,
    irq: u8,
    pins: u32,
    pindirs: u32,
    tx: Deque<u32, FIFO_DEPTH>,
    rx: Deque<u32, FIFO_DEPTH>,
    rx_dropped: u32,
    cycles: u64,
}

fn mask(count: u8) -> u32 {
    if count >= 32 {
        u32::MAX
    } else {
        (1 << count) - 1
    }
}

impl StateMachine {
    /// A freshly reset state machine with empty instruction memory (all
    /// `jmp 0`), running `config`. Execution starts at the wrap target.
    pub fn new(config: SmConfig) -> Self {
        Self {
            instr_mem: [0; INSTRUCTION_MEMORY],
            config,
            pc: config.wrap.target,
            x: 0,
            y: 0,
            osr: 0,
            osr_count: 32,
            isr: 0,
            isr_count: 0,
            delay: 0,
            stalled: false,
            irq_waiting: false,
            irq: 0,
            pins: 0,
            pindirs: 0,
            tx: Deque::new(),
            rx: Deque::new(),
            rx_dropped: 0,
            cycles: 0,
        }
    }

    /// Convenience for the common case: a state machine with `program` loaded
    /// at `offset` and `config` applied.
    pub fn with_program(program: &Program, offset: u8, config: SmConfig) -> Result<Self, PioError> {
        let mut sm = Self::new(config);
        sm.load(program, offset)?;
        Ok(sm)
    }

    /// Writes `program` into instruction memory at `offset`, the same way the
    /// firmware does.
    pub fn load(&mut self, program: &Program, offset: u8) -> Result<(), PioError> {
        let words = program.relocated(offset)?;
        for (slot, word) in self.instr_mem[usize::from(offset)..].iter_mut().zip(words) {
            *slot = word;
        }
        Ok(())
    }

    /// Queues a word for the program to `pull`. Hands the word back if the
    /// FIFO is full.
    pub fn push_tx(&mut self, word: u32) -> Result<(), u32> {
        self.tx.push_back(word)
    }

    pub fn pop_rx(&mut self) -> Option<u32> {
        self.rx.pop_front()
    }

    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Number of `push noblock`s that found the RX FIFO full.
    pub fn rx_dropped(&self) -> u32 {
        self.rx_dropped
    }

    /// Output levels of all 32 pins.
    pub fn pins(&self) -> u32 {
        self.pins
    }

    pub fn pin(&self, n: u8) -> bool {
        self.pins >> n & 1 != 0
    }

    pub fn pindirs(&self) -> u32 {
        self.pindirs
    }

    pub fn pc(&self) -> u8 {
        self.pc
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn isr(&self) -> u32 {
        self.isr
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    pub fn irq_flags(&self) -> u8 {
        self.irq
    }

    /// Sets or clears an IRQ flag from "outside", like another state machine
    /// or the CPU would.
    pub fn set_irq_flag(&mut self, index: u8, value: bool) {
        let bit = 1 << (index & 7);
        if value {
            self.irq |= bit;
        } else {
            self.irq &= !bit;
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Runs one clock cycle, with the GPIO inputs at `inputs`.
    pub fn step(&mut self, inputs: u32) -> Result<(), PioError> {
        self.cycles += 1;
        if self.delay > 0 {
            self.delay -= 1;
            return Ok(());
        }

        let word = self.instr_mem[usize::from(self.pc)];
        let decoded = instr::decode(word, self.config.side_set)?;

        // Side-set happens as soon as the instruction issues, stalled or not.
        if let Some(value) = decoded.side {
            let base = u32::from(self.config.side_set_base);
            let m = mask(self.config.side_set.bits()).rotate_left(base);
            let v = u32::from(value).rotate_left(base);
            if self.config.side_set.pindirs() {
                self.pindirs = (self.pindirs & !m) | (v & m);
            } else {
                self.pins = (self.pins & !m) | (v & m);
            }
        }

        match self.execute(decoded.instruction, inputs)? {
            Outcome::Stall => {
                if !self.stalled {
                    log::trace!("pc {}: stalled on {}", self.pc, decoded.instruction);
                }
                self.stalled = true;
            }
            Outcome::Next => {
                self.stalled = false;
                self.pc = if self.pc == self.config.wrap.source {
                    self.config.wrap.target
                } else {
                    (self.pc + 1) % INSTRUCTION_MEMORY as u8
                };
                self.delay = decoded.delay;
            }
            Outcome::Jump(target) => {
                self.stalled = false;
                self.pc = target & 0x1F;
                self.delay = decoded.delay;
            }
        }
        Ok(())
    }

    /// Runs `cycles` cycles with constant inputs.
    pub fn run(&mut self, cycles: usize, inputs: u32) -> Result<(), PioError> {
        for _ in 0..cycles {
            self.step(inputs)?;
        }
        Ok(())
    }

    fn in_pins(&self, inputs: u32) -> u32 {
        inputs.rotate_right(u32::from(self.config.in_base))
    }

    fn write_pins(&mut self, base: u8, count: u8, value: u32) {
        let m = mask(count).rotate_left(u32::from(base));
        let v = value.rotate_left(u32::from(base));
        self.pins = (self.pins & !m) | (v & m);
    }

    fn write_pindirs(&mut self, base: u8, count: u8, value: u32) {
        let m = mask(count).rotate_left(u32::from(base));
        let v = value.rotate_left(u32::from(base));
        self.pindirs = (self.pindirs & !m) | (v & m);
    }

    fn shift_in(&mut self, data: u32, count: u8) {
        let data = u64::from(data & mask(count));
        let isr = u64::from(self.isr);
        self.isr = if self.config.in_shift_right {
            (isr >> count | data << (32 - count)) as u32
        } else {
            (isr << count | data) as u32
        };
        self.isr_count = (self.isr_count + count).min(32);
    }

    fn shift_out(&mut self, count: u8) -> u32 {
        let osr = u64::from(self.osr);
        let data;
        if self.config.out_shift_right {
            data = self.osr & mask(count);
            self.osr = (osr >> count) as u32;
        } else {
            data = (osr >> (32 - count)) as u32 & mask(count);
            self.osr = (osr << count) as u32;
        }
        self.osr_count = (self.osr_count + count).min(32);
        data
    }

    fn status(&self) -> u32 {
        let (level, n) = match self.config.status {
            MovStatus::TxLessThan(n) => (self.tx.len(), n),
            MovStatus::RxLessThan(n) => (self.rx.len(), n),
        };
        if level < usize::from(n) {
            u32::MAX
        } else {
            0
        }
    }

    fn execute(&mut self, instruction: Instruction, inputs: u32) -> Result<Outcome, PioError> {
        let outcome = match instruction {
            Instruction::Jmp { condition, address } => {
                let take = match condition {
                    JmpCondition::Always => true,
                    JmpCondition::XZero => self.x == 0,
                    JmpCondition::XDecrement => {
                        let take = self.x != 0;
                        self.x = self.x.wrapping_sub(1);
                        take
                    }
                    JmpCondition::YZero => self.y == 0,
                    JmpCondition::YDecrement => {
                        let take = self.y != 0;
                        self.y = self.y.wrapping_sub(1);
                        take
                    }
                    JmpCondition::XNotEqualY => self.x != self.y,
                    JmpCondition::Pin => inputs >> self.config.jmp_pin & 1 != 0,
                    JmpCondition::OsrNotEmpty => self.osr_count < self.config.pull_threshold,
                };
                if take {
                    Outcome::Jump(address)
                } else {
                    Outcome::Next
                }
            }
            Instruction::Wait {
                polarity,
                source,
                index,
            } => {
                let level = match source {
                    WaitSource::Gpio => inputs >> index & 1 != 0,
                    WaitSource::Pin => self.in_pins(inputs) >> index & 1 != 0,
                    WaitSource::Irq => self.irq >> (index & 7) & 1 != 0,
                };
                if level != polarity {
                    Outcome::Stall
                } else {
                    if source == WaitSource::Irq && polarity {
                        self.set_irq_flag(index, false);
                    }
                    Outcome::Next
                }
            }
            Instruction::In { source, bit_count } => {
                let data = match source {
                    InSource::Pins => self.in_pins(inputs),
                    InSource::X => self.x,
                    InSource::Y => self.y,
                    InSource::Null => 0,
                    InSource::Isr => self.isr,
                    InSource::Osr => self.osr,
                };
                self.shift_in(data, bit_count);
                Outcome::Next
            }
            Instruction::Out {
                destination,
                bit_count,
            } => {
                let data = self.shift_out(bit_count);
                match destination {
                    OutDestination::Pins => {
                        self.write_pins(self.config.out_base, self.config.out_count, data)
                    }
                    OutDestination::X => self.x = data,
                    OutDestination::Y => self.y = data,
                    OutDestination::Null => {}
                    OutDestination::PinDirs => {
                        self.write_pindirs(self.config.out_base, self.config.out_count, data)
                    }
                    OutDestination::Pc => return Ok(Outcome::Jump(data as u8)),
                    OutDestination::Isr => {
                        self.isr = data;
                        self.isr_count = bit_count;
                    }
                    OutDestination::Exec => return Err(PioError::Unsupported("out exec")),
                }
                Outcome::Next
            }
            Instruction::Push { if_full, block } => {
                if if_full && self.isr_count < self.config.push_threshold {
                    return Ok(Outcome::Next);
                }
                if let Err(word) = self.rx.push_back(self.isr) {
                    if block {
                        return Ok(Outcome::Stall);
                    }
                    self.rx_dropped = self.rx_dropped.wrapping_add(1);
                    log::trace!("rx fifo full, dropped {:#x}", word);
                }
                self.isr = 0;
                self.isr_count = 0;
                Outcome::Next
            }
            Instruction::Pull { if_empty, block } => {
                if if_empty && self.osr_count < self.config.pull_threshold {
                    return Ok(Outcome::Next);
                }
                match self.tx.pop_front() {
                    Some(word) => self.osr = word,
                    None if block => return Ok(Outcome::Stall),
                    // Non-blocking pull from an empty FIFO copies X.
                    None => self.osr = self.x,
                }
                self.osr_count = 0;
                Outcome::Next
            }
            Instruction::Mov {
                destination,
                op,
                source,
            } => {
                let data = match source {
                    MovSource::Pins => self.in_pins(inputs),
                    MovSource::X => self.x,
                    MovSource::Y => self.y,
                    MovSource::Null => 0,
                    MovSource::Status => self.status(),
                    MovSource::Isr => self.isr,
                    MovSource::Osr => self.osr,
                };
                let data = match op {
                    MovOp::None => data,
                    MovOp::Invert => !data,
                    MovOp::BitReverse => data.reverse_bits(),
                };
                match destination {
                    MovDestination::Pins => {
                        self.write_pins(self.config.out_base, self.config.out_count, data)
                    }
                    MovDestination::X => self.x = data,
                    MovDestination::Y => self.y = data,
                    MovDestination::Exec => return Err(PioError::Unsupported("mov exec")),
                    MovDestination::Pc => return Ok(Outcome::Jump(data as u8)),
                    MovDestination::Isr => {
                        self.isr = data;
                        self.isr_count = 0;
                    }
                    MovDestination::Osr => {
                        self.osr = data;
                        self.osr_count = 0;
                    }
                }
                Outcome::Next
            }
            Instruction::Irq { clear, wait, index } => {
                let bit = 1 << (index & 7);
                if clear {
                    self.irq &= !bit;
                    Outcome::Next
                } else if self.irq_waiting {
                    if self.irq & bit == 0 {
                        self.irq_waiting = false;
                        Outcome::Next
                    } else {
                        Outcome::Stall
                    }
                } else {
                    self.irq |= bit;
                    if wait {
                        self.irq_waiting = true;
                        Outcome::Stall
                    } else {
                        Outcome::Next
                    }
                }
            }
            Instruction::Set { destination, data } => {
                let data = u32::from(data);
                match destination {
                    SetDestination::Pins => {
                        self.write_pins(self.config.set_base, self.config.set_count, data)
                    }
                    SetDestination::X => self.x = data,
                    SetDestination::Y => self.y = data,
                    SetDestination::PinDirs => {
                        self.write_pindirs(self.config.set_base, self.config.set_count, data)
                    }
                }
                Outcome::Next
            }
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pio::instr::{SideSet, NOP};
    use crate::pio::Wrap;

    fn program(code: &'static [u16]) -> Program {
        Program {
            code,
            wrap: Wrap {
                source: code.len() as u8 - 1,
                target: 0,
            },
            side_set: SideSet::NONE,
        }
    }

    fn machine(program: &Program) -> StateMachine {
        StateMachine::with_program(program, 0, SmConfig::for_program(program, 0).unwrap()).unwrap()
    }

    static SET_X_THEN_SPIN: [u16; 2] = [
        Instruction::Set {
            destination: SetDestination::X,
            data: 3,
        }
        .plain(),
        Instruction::Jmp {
            condition: JmpCondition::XDecrement,
            address: 1,
        }
        .plain(),
    ];

    #[test]
    fn jmp_x_decrement_always_decrements() {
        let p = program(&SET_X_THEN_SPIN);
        let mut sm = machine(&p);
        sm.step(0).unwrap();
        assert_eq!(sm.x(), 3);
        // Taken three times (x = 3, 2, 1), falls through on x = 0.
        for expected in [2, 1, 0] {
            sm.step(0).unwrap();
            assert_eq!(sm.pc(), 1);
            assert_eq!(sm.x(), expected);
        }
        sm.step(0).unwrap();
        assert_eq!(sm.x(), u32::MAX);
        // Wrapped back to the set.
        assert_eq!(sm.pc(), 0);
    }

    static DELAYED: [u16; 2] = [
        Instruction::Set {
            destination: SetDestination::Pins,
            data: 1,
        }
        .encode(SideSet::NONE, None, 3),
        Instruction::Set {
            destination: SetDestination::Pins,
            data: 0,
        }
        .plain(),
    ];

    #[test]
    fn delay_holds_after_completion() {
        let p = program(&DELAYED);
        let mut sm = machine(&p);
        let mut trace = Vec::new();
        for _ in 0..6 {
            sm.step(0).unwrap();
            trace.push(sm.pin(0));
        }
        assert_eq!(trace, vec![true, true, true, true, false, true]);
    }

    static SIDE_SET_WAIT: [u16; 2] = [
        Instruction::Wait {
            polarity: true,
            source: WaitSource::Gpio,
            index: 5,
        }
        .encode(SideSet::new(1, false, false), Some(1), 0),
        NOP.encode(SideSet::new(1, false, false), Some(0), 0),
    ];

    #[test]
    fn side_set_applies_while_stalled() {
        let p = Program {
            side_set: SideSet::new(1, false, false),
            ..program(&SIDE_SET_WAIT)
        };
        let config = SmConfig {
            side_set_base: 2,
            ..SmConfig::for_program(&p, 0).unwrap()
        };
        let mut sm = StateMachine::with_program(&p, 0, config).unwrap();
        sm.step(0).unwrap();
        assert!(sm.pin(2));
        assert!(sm.is_stalled());
        sm.step(0).unwrap();
        assert!(sm.pin(2));
        assert_eq!(sm.pc(), 0);

        // Condition met: completes in the same cycle.
        sm.step(1 << 5).unwrap();
        assert!(!sm.is_stalled());
        assert_eq!(sm.pc(), 1);
        sm.step(0).unwrap();
        assert!(!sm.pin(2));
    }

    static PULL_PUSH: [u16; 3] = [
        Instruction::Pull {
            if_empty: false,
            block: false,
        }
        .plain(),
        Instruction::Mov {
            destination: MovDestination::Isr,
            op: MovOp::BitReverse,
            source: MovSource::Osr,
        }
        .plain(),
        Instruction::Push {
            if_full: false,
            block: false,
        }
        .plain(),
    ];

    #[test]
    fn fifo_flow_and_drops() {
        let p = program(&PULL_PUSH);
        let mut sm = machine(&p);
        sm.push_tx(1).unwrap();
        sm.push_tx(2).unwrap();
        // Empty TX: non-blocking pull copies X (zero).
        sm.run(3 * 6, 0).unwrap();
        assert_eq!(sm.rx_len(), FIFO_DEPTH);
        assert_eq!(sm.rx_dropped(), 2);
        assert_eq!(sm.pop_rx(), Some(0x8000_0000));
        assert_eq!(sm.pop_rx(), Some(0x4000_0000));
        assert_eq!(sm.pop_rx(), Some(0));
        assert_eq!(sm.pop_rx(), Some(0));
        assert_eq!(sm.pop_rx(), None);
    }

    #[test]
    fn tx_fifo_reports_full() {
        let p = program(&PULL_PUSH);
        let mut sm = machine(&p);
        for i in 0..FIFO_DEPTH as u32 {
            sm.push_tx(i).unwrap();
        }
        assert_eq!(sm.push_tx(99), Err(99));
        assert_eq!(sm.tx_len(), FIFO_DEPTH);
    }

    static SHIFTS: [u16; 3] = [
        Instruction::In {
            source: InSource::Pins,
            bit_count: 4,
        }
        .plain(),
        Instruction::In {
            source: InSource::Null,
            bit_count: 4,
        }
        .plain(),
        Instruction::Out {
            destination: OutDestination::X,
            bit_count: 8,
        }
        .plain(),
    ];

    #[test]
    fn shift_directions() {
        let p = program(&SHIFTS);
        let config = SmConfig {
            in_base: 8,
            in_shift_right: false,
            out_shift_right: true,
            ..SmConfig::for_program(&p, 0).unwrap()
        };
        let mut sm = StateMachine::with_program(&p, 0, config).unwrap();
        sm.step(0xA00).unwrap();
        assert_eq!(sm.isr(), 0xA);
        sm.step(0).unwrap();
        assert_eq!(sm.isr(), 0xA0);
        sm.step(0).unwrap();
        // OSR was never filled, so shifts out zeroes.
        assert_eq!(sm.x(), 0);
    }

    #[test]
    fn exec_is_unsupported() {
        static EXEC: [u16; 1] = [Instruction::Mov {
            destination: MovDestination::Exec,
            op: MovOp::None,
            source: MovSource::X,
        }
        .plain()];
        let p = program(&EXEC);
        let mut sm = machine(&p);
        assert_eq!(sm.step(0), Err(PioError::Unsupported("mov exec")));
    }

    #[test]
    fn irq_wait_blocks_until_cleared() {
        static IRQ: [u16; 2] = [
            Instruction::Irq {
                clear: false,
                wait: true,
                index: 2,
            }
            .plain(),
            NOP.plain(),
        ];
        let p = program(&IRQ);
        let mut sm = machine(&p);
        sm.run(3, 0).unwrap();
        assert_eq!(sm.irq_flags(), 1 << 2);
        assert_eq!(sm.pc(), 0);
        sm.set_irq_flag(2, false);
        sm.step(0).unwrap();
        assert_eq!(sm.pc(), 1);
        assert_eq!(sm.irq_flags(), 0);
    }
}
