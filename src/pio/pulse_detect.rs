// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pulse-position detector, the receiving end of `pulse_gen`.
//!
//! Synchronizes on an input pulse, then measures how long the pin stays low
//! before the next one, and pushes the measurement to the RX FIFO.
//!
//! ```text
//! 0: wait 0 pin 0 [7]  ; falling edge, then let the line settle
//! 1: wait 1 pin 0      ; opening pulse
//! 2: wait 0 pin 0      ; pause begins
//! 3: mov x, ~null      ; x = 0xffff_ffff
//! 4: jmp pin 7         ; pin high? pause is over
//! 5: jmp x-- 4         ; otherwise count down and look again
//! 6: mov x, null       ; counter ran out: report the maximum
//! 7: mov isr, ~x
//! 8: push noblock      ; never stall here; a full FIFO drops the sample
//!    (wrap to 0)
//! ```
//!
//! The loop at 4..5 takes two cycles per count, so a pause of `L` cycles
//! (measured from the cycle instruction 2 completes) is reported as
//! `ceil((L - 2) / 2)`, and as 0 for `L <= 2`. The counter runs out after
//! 2^32 counts, far beyond anything the generator produces; that branch is
//! there so that a dead line still yields a (maximal) sample instead of
//! hanging the state machine.

use heapless::Deque;

use super::instr::{
    Instruction, JmpCondition, MovDestination, MovOp, MovSource, SideSet, WaitSource,
};
use super::{PioError, Program, SmConfig, Wrap, FIFO_DEPTH};

/// Extra cycles spent after the first falling edge before looking for the
/// opening pulse.
pub const SETTLE_CYCLES: u8 = 7;

const fn wait_pin(polarity: bool) -> Instruction {
    Instruction::Wait {
        polarity,
        source: WaitSource::Pin,
        index: 0,
    }
}

pub static PULSE_DETECTOR: Program = Program {
    code: &[
        wait_pin(false).encode(SideSet::NONE, None, SETTLE_CYCLES),
        wait_pin(true).plain(),
        wait_pin(false).plain(),
        Instruction::Mov {
            destination: MovDestination::X,
            op: MovOp::Invert,
            source: MovSource::Null,
        }
        .plain(),
        Instruction::Jmp {
            condition: JmpCondition::Pin,
            address: 7,
        }
        .plain(),
        Instruction::Jmp {
            condition: JmpCondition::XDecrement,
            address: 4,
        }
        .plain(),
        Instruction::Mov {
            destination: MovDestination::X,
            op: MovOp::None,
            source: MovSource::Null,
        }
        .plain(),
        Instruction::Mov {
            destination: MovDestination::Isr,
            op: MovOp::Invert,
            source: MovSource::X,
        }
        .plain(),
        Instruction::Push {
            if_full: false,
            block: false,
        }
        .plain(),
    ],
    wrap: Wrap {
        source: 8,
        target: 0,
    },
    side_set: SideSet::NONE,
};

/// State machine configuration for the detector loaded at `offset`,
/// listening on `pin`.
pub fn config(offset: u8, pin: u8) -> Result<SmConfig, PioError> {
    Ok(SmConfig {
        in_base: pin,
        jmp_pin: pin,
        ..SmConfig::for_program(&PULSE_DETECTOR, offset)?
    })
}

/// What the detector program reports for a pause of `low_cycles`.
pub const fn cycles_to_count(low_cycles: u32) -> u32 {
    (low_cycles.saturating_sub(2) + 1) / 2
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for the line to go low.
    WaitFalling1,
    /// Waiting for the opening pulse, after ignoring the line for `settle`
    /// more ticks.
    WaitRising { settle: u8 },
    /// Inside the opening pulse.
    WaitFalling2,
    /// Measuring the pause. `remaining` counts down to saturation.
    Counting { remaining: u32 },
    /// Reporting `max - remaining`.
    Finish { remaining: u32 },
}

/// Reference model of the detector, one call to `step` per sampling tick.
///
/// Where the PIO program counts in two-cycle units up to 2^32, the model
/// counts single ticks up to a configurable `max`, which makes saturation
/// testable. Given a pause of `D` ticks it reports `D` if `D < max`, and
/// `max` otherwise.
pub struct PulseDetectorModel {
    max: u32,
    state: DetectorState,
    samples: Deque<u32, FIFO_DEPTH>,
    dropped: u32,
}

impl PulseDetectorModel {
    /// `max` must be at least 1.
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            state: DetectorState::WaitFalling1,
            samples: Deque::new(),
            dropped: 0,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Next completed measurement, oldest first.
    pub fn pop(&mut self) -> Option<u32> {
        self.samples.pop_front()
    }

    /// Measurements lost because nobody drained the queue in time.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Advances one tick with the input at `pin`.
    pub fn step(&mut self, pin: bool) {
        use DetectorState::*;

        self.state = match self.state {
            WaitFalling1 if pin => WaitFalling1,
            WaitFalling1 => WaitRising {
                settle: SETTLE_CYCLES,
            },
            WaitRising { settle } if settle > 0 => WaitRising { settle: settle - 1 },
            WaitRising { settle } if !pin => WaitRising { settle },
            WaitRising { .. } => WaitFalling2,
            WaitFalling2 if pin => WaitFalling2,
            WaitFalling2 => Counting {
                remaining: self.max - 1,
            },
            Counting { remaining } if pin => Finish { remaining },
            Counting { remaining: 0 } => Finish { remaining: 0 },
            Counting { remaining } => Counting {
                remaining: remaining - 1,
            },
            Finish { remaining } => {
                let sample = self.max - remaining;
                if self.samples.push_back(sample).is_err() {
                    self.dropped = self.dropped.wrapping_add(1);
                    log::trace!("sample queue full, dropped {}", sample);
                }
                WaitFalling1
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pio::pulse_gen::{self, PULSE_GENERATOR};
    use crate::pio::sim::StateMachine;

    const PIN: u8 = 15;

    fn detector() -> StateMachine {
        StateMachine::with_program(&PULSE_DETECTOR, 0, config(0, PIN).unwrap()).unwrap()
    }

    /// high 4, low 16, opening pulse 3, pause `pause`, then high.
    fn waveform(pause: usize, t: usize) -> bool {
        match t {
            0..=3 => true,
            4..=19 => false,
            20..=22 => true,
            t => t >= 23 + pause,
        }
    }

    #[test]
    fn program_words() {
        assert_eq!(PULSE_DETECTOR.code.len(), 9);
        assert_eq!(PULSE_DETECTOR.code[0], 0x2720);
        assert_eq!(PULSE_DETECTOR.code[3], 0xA02B);
        assert_eq!(PULSE_DETECTOR.code[4], 0x00C7);
        assert_eq!(PULSE_DETECTOR.code[5], 0x0044);
        assert_eq!(PULSE_DETECTOR.code[7], 0xA0C9);
        assert_eq!(PULSE_DETECTOR.code[8], 0x8000);
    }

    #[test]
    fn measures_pause_length() {
        for pause in [1u32, 2, 3, 4, 10, 11, 50] {
            let mut sm = detector();
            for t in 0..200 {
                let level = waveform(pause as usize, t);
                sm.step((level as u32) << PIN).unwrap();
            }
            assert_eq!(sm.pop_rx(), Some(cycles_to_count(pause)), "pause {}", pause);
            assert_eq!(sm.pop_rx(), None, "pause {}", pause);
        }
    }

    #[test]
    fn count_formula() {
        assert_eq!(cycles_to_count(0), 0);
        assert_eq!(cycles_to_count(2), 0);
        assert_eq!(cycles_to_count(3), 1);
        assert_eq!(cycles_to_count(4), 1);
        assert_eq!(cycles_to_count(21), 10);
    }

    #[test]
    fn relocated_detector_still_measures() {
        let mut sm = StateMachine::with_program(&PULSE_DETECTOR, 4, config(4, PIN).unwrap()).unwrap();
        for t in 0..200 {
            sm.step((waveform(30, t) as u32) << PIN).unwrap();
        }
        assert_eq!(sm.pop_rx(), Some(cycles_to_count(30)));
    }

    #[test]
    fn never_blocks_on_full_fifo() {
        // A square wave with 12-cycle halves gives one measurement every
        // two periods (the second period is spent resynchronizing).
        let mut sm = detector();
        for t in 0..2000 {
            let level = (t / 12) % 2 == 0;
            sm.step((level as u32) << PIN).unwrap();
        }
        assert_eq!(sm.rx_len(), FIFO_DEPTH);
        assert!(sm.rx_dropped() > 0);
        while let Some(sample) = sm.pop_rx() {
            assert_eq!(sample, cycles_to_count(12));
        }
    }

    #[test]
    fn loopback_recovers_commands() {
        let mut gen = StateMachine::with_program(
            &PULSE_GENERATOR,
            0,
            pulse_gen::config(0, PIN).unwrap(),
        )
        .unwrap();
        let offset = PULSE_GENERATOR.code.len() as u8;
        let mut det =
            StateMachine::with_program(&PULSE_DETECTOR, offset, config(offset, PIN).unwrap()).unwrap();

        // Let the detector get past its settle delay while the line idles.
        for _ in 0..16 {
            let line = gen.pins();
            det.step(line).unwrap();
            gen.step(0).unwrap();
        }

        for n in [20u32, 0, 5, 100] {
            gen.push_tx(n).unwrap();
            for _ in 0..n as u64 + 40 {
                // The detector sees the line as it was at the end of the
                // previous cycle.
                let line = gen.pins();
                det.step(line).unwrap();
                gen.step(0).unwrap();
            }
            assert_eq!(det.pop_rx(), Some(cycles_to_count(n + 1)), "n = {}", n);
            assert_eq!(det.pop_rx(), None);
        }
    }

    fn model_waveform(model: &mut PulseDetectorModel, pause: usize) {
        for t in 0..23 + pause + 30 {
            model.step(waveform(pause, t));
        }
    }

    #[test]
    fn model_reports_short_pauses_exactly() {
        for pause in [1usize, 2, 9] {
            let mut model = PulseDetectorModel::new(10);
            model_waveform(&mut model, pause);
            assert_eq!(model.pop(), Some(pause as u32));
            assert_eq!(model.pop(), None);
        }
    }

    #[test]
    fn model_saturates_once() {
        for pause in [10usize, 11, 25] {
            let mut model = PulseDetectorModel::new(10);
            model_waveform(&mut model, pause);
            assert_eq!(model.pop(), Some(10), "pause {}", pause);
            assert_eq!(model.pop(), None, "pause {}", pause);
        }
    }

    #[test]
    fn model_max_of_one() {
        let mut model = PulseDetectorModel::new(1);
        model_waveform(&mut model, 5);
        assert_eq!(model.pop(), Some(1));
        let mut model = PulseDetectorModel::new(0);
        model_waveform(&mut model, 5);
        assert_eq!(model.pop(), Some(1));
    }

    #[test]
    fn model_drops_when_full() {
        let mut model = PulseDetectorModel::new(100);
        for _ in 0..FIFO_DEPTH + 2 {
            // Idle high, then a framed pause of 6.
            for t in 0..23 + 6 + 5 {
                model.step(waveform(6, t));
            }
        }
        assert_eq!(model.dropped(), 2);
        for _ in 0..FIFO_DEPTH {
            assert_eq!(model.pop(), Some(6));
        }
        assert_eq!(model.pop(), None);
    }

    #[test]
    fn model_states() {
        let mut model = PulseDetectorModel::new(10);
        model.step(true);
        assert_eq!(model.state(), DetectorState::WaitFalling1);
        model.step(false);
        assert_eq!(model.state(), DetectorState::WaitRising { settle: SETTLE_CYCLES });
        // High during settle is ignored.
        for _ in 0..SETTLE_CYCLES {
            model.step(true);
        }
        assert_eq!(model.state(), DetectorState::WaitRising { settle: 0 });
        model.step(true);
        assert_eq!(model.state(), DetectorState::WaitFalling2);
        model.step(false);
        assert_eq!(model.state(), DetectorState::Counting { remaining: 9 });
        model.step(true);
        assert_eq!(model.state(), DetectorState::Finish { remaining: 9 });
        model.step(true);
        assert_eq!(model.state(), DetectorState::WaitFalling1);
        assert_eq!(model.pop(), Some(1));
    }
}
