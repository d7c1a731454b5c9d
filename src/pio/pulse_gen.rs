// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pulse-position generator.
//!
//! Each word written to the TX FIFO encodes one interval: the output emits a
//! one-cycle pulse, pauses (low) for `N + 1` cycles, and emits a closing
//! pulse two cycles wide. It then idles low until the next word. A stream of
//! words therefore becomes a stream of pulse pairs whose spacing carries the
//! data.
//!
//! ```text
//!            _             __
//! cmd N   __| |___________|  |______ ...
//!         ^  ^   N + 1    ^
//!      pull  open         close
//! ```
//!
//! The closing pulse is wider than the opening one because the detector
//! polls for it in a two-cycle loop; a one-cycle pulse could fall between
//! polls.
//!
//! The PIO program is four instructions with mandatory one-bit side-set:
//!
//! ```text
//! 0: pull block    side 0   ; wait for a command, output low
//! 1: mov x, osr    side 1   ; opening pulse
//! 2: jmp x-- 2     side 0   ; pause, N + 1 cycles
//! 3: nop           side 1 [1] ; closing pulse
//!    (wrap to 0)
//! ```

use heapless::Deque;

use super::instr::{Instruction, JmpCondition, MovDestination, MovOp, MovSource, SideSet, NOP};
use super::{PioError, Program, SmConfig, Wrap, FIFO_DEPTH};

const SIDE_SET: SideSet = SideSet::new(1, false, false);

/// Width of the closing pulse.
pub const CLOSING_PULSE_CYCLES: u8 = 2;

pub static PULSE_GENERATOR: Program = Program {
    code: &[
        Instruction::Pull {
            if_empty: false,
            block: true,
        }
        .encode(SIDE_SET, Some(0), 0),
        Instruction::Mov {
            destination: MovDestination::X,
            op: MovOp::None,
            source: MovSource::Osr,
        }
        .encode(SIDE_SET, Some(1), 0),
        Instruction::Jmp {
            condition: JmpCondition::XDecrement,
            address: 2,
        }
        .encode(SIDE_SET, Some(0), 0),
        NOP.encode(SIDE_SET, Some(1), CLOSING_PULSE_CYCLES - 1),
    ],
    wrap: Wrap {
        source: 3,
        target: 0,
    },
    side_set: SIDE_SET,
};

/// State machine configuration for the generator loaded at `offset`,
/// driving `pin`.
pub fn config(offset: u8, pin: u8) -> Result<SmConfig, PioError> {
    Ok(SmConfig {
        side_set_base: pin,
        // `set pindirs` during setup targets the same pin.
        set_base: pin,
        set_count: 1,
        ..SmConfig::for_program(&PULSE_GENERATOR, offset)?
    })
}

/// Number of cycles from the pull of command `n` to the end of its closing
/// pulse, inclusive.
pub const fn cycles_per_command(n: u32) -> u64 {
    n as u64 + 3 + CLOSING_PULSE_CYCLES as u64
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GeneratorState {
    /// Output low, waiting for a command.
    AwaitCommand,
    /// Opening pulse.
    RisingEdge,
    /// Output low, counting down.
    Pausing,
    /// Closing pulse, for `remaining` more cycles including this one.
    ClosingPulse { remaining: u8 },
}

/// Reference model of the generator's timing, one call to `step` per PIO
/// cycle. Matches the PIO program cycle for cycle.
pub struct PulseGeneratorModel {
    state: GeneratorState,
    command: u32,
    counter: u32,
    commands: Deque<u32, FIFO_DEPTH>,
}

impl PulseGeneratorModel {
    pub const fn new() -> Self {
        Self {
            state: GeneratorState::AwaitCommand,
            command: 0,
            counter: 0,
            commands: Deque::new(),
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    /// Queues a command. Hands it back if the queue is full.
    pub fn send(&mut self, n: u32) -> Result<(), u32> {
        self.commands.push_back(n)
    }

    /// Advances one cycle and returns the output level during it.
    pub fn step(&mut self) -> bool {
        use GeneratorState::*;

        let (next, level) = match self.state {
            AwaitCommand => match self.commands.pop_front() {
                Some(n) => {
                    self.command = n;
                    (RisingEdge, false)
                }
                None => (AwaitCommand, false),
            },
            RisingEdge => {
                self.counter = self.command;
                (Pausing, true)
            }
            Pausing if self.counter != 0 => {
                self.counter -= 1;
                (Pausing, false)
            }
            Pausing => (
                ClosingPulse {
                    remaining: CLOSING_PULSE_CYCLES,
                },
                false,
            ),
            ClosingPulse { remaining } if remaining > 1 => (
                ClosingPulse {
                    remaining: remaining - 1,
                },
                true,
            ),
            ClosingPulse { .. } => (AwaitCommand, true),
        };
        self.state = next;
        level
    }
}

impl Default for PulseGeneratorModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pio::sim::StateMachine;

    const PIN: u8 = 14;

    fn generator() -> StateMachine {
        StateMachine::with_program(&PULSE_GENERATOR, 0, config(0, PIN).unwrap()).unwrap()
    }

    fn sim_trace(commands: &[u32], cycles: usize) -> Vec<bool> {
        let mut sm = generator();
        let mut pending = commands.iter().copied().peekable();
        let mut trace = Vec::new();
        for _ in 0..cycles {
            while let Some(&n) = pending.peek() {
                if sm.push_tx(n).is_err() {
                    break;
                }
                pending.next();
            }
            sm.step(0).unwrap();
            trace.push(sm.pin(PIN));
        }
        trace
    }

    fn model_trace(commands: &[u32], cycles: usize) -> Vec<bool> {
        let mut model = PulseGeneratorModel::new();
        let mut pending = commands.iter().copied().peekable();
        let mut trace = Vec::new();
        for _ in 0..cycles {
            while let Some(&n) = pending.peek() {
                if model.send(n).is_err() {
                    break;
                }
                pending.next();
            }
            trace.push(model.step());
        }
        trace
    }

    /// Lengths of alternating runs, starting with a low run.
    fn runs(trace: &[bool]) -> Vec<usize> {
        let mut runs = Vec::new();
        let mut level = false;
        let mut len = 0;
        for &bit in trace {
            if bit == level {
                len += 1;
            } else {
                runs.push(len);
                level = bit;
                len = 1;
            }
        }
        runs.push(len);
        runs
    }

    #[test]
    fn program_words() {
        assert_eq!(PULSE_GENERATOR.code, &[0x80A0, 0xB027, 0x0042, 0xB142]);
    }

    #[test]
    fn single_command_shape() {
        for n in [0u32, 1, 5, 20] {
            let trace = sim_trace(&[n], 40);
            // low (pull), pulse, pause, pulse, idle low
            assert_eq!(runs(&trace), vec![1, 1, n as usize + 1, 2, 40 - n as usize - 5], "n = {}", n);
        }
    }

    #[test]
    fn zero_is_the_shortest_pause() {
        let trace = sim_trace(&[0], 8);
        assert_eq!(trace, vec![false, true, false, true, true, false, false, false]);
    }

    #[test]
    fn idles_low_without_commands() {
        let mut sm = generator();
        sm.run(50, 0).unwrap();
        assert!(!sm.pin(PIN));
        assert!(sm.is_stalled());
        assert_eq!(sm.pc(), 0);
    }

    #[test]
    fn model_matches_program() {
        let scripts: &[&[u32]] = &[&[], &[0], &[3], &[0, 0, 0], &[7, 1, 12, 0, 2, 9]];
        for commands in scripts {
            assert_eq!(sim_trace(commands, 80), model_trace(commands, 80), "{:?}", commands);
        }
    }

    #[test]
    fn back_to_back_commands() {
        let trace = sim_trace(&[2, 3], 20);
        // The second pull happens right after the first closing pulse.
        assert_eq!(runs(&trace), vec![1, 1, 3, 2, 1, 1, 4, 2, 5]);
        assert_eq!(
            cycles_per_command(2) + cycles_per_command(3) + 7,
            trace.len() as u64
        );
    }

    #[test]
    fn model_reports_states() {
        let mut model = PulseGeneratorModel::new();
        assert_eq!(model.state(), GeneratorState::AwaitCommand);
        model.send(1).unwrap();
        model.step();
        assert_eq!(model.state(), GeneratorState::RisingEdge);
        model.step();
        assert_eq!(model.state(), GeneratorState::Pausing);
        model.step();
        model.step();
        assert_eq!(model.state(), GeneratorState::ClosingPulse { remaining: 2 });
        model.step();
        assert_eq!(model.state(), GeneratorState::ClosingPulse { remaining: 1 });
        model.step();
        assert_eq!(model.state(), GeneratorState::AwaitCommand);
    }

    #[test]
    fn model_queue_depth() {
        let mut model = PulseGeneratorModel::new();
        for n in 0..FIFO_DEPTH as u32 {
            model.send(n).unwrap();
        }
        assert_eq!(model.send(42), Err(42));
    }
}
