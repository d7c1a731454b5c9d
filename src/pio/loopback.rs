// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pacing commands through a generator-to-detector loopback.
//!
//! The detector resynchronizes after every sample: it waits for the line to
//! go low, ignores it for `SETTLE_CYCLES`, then looks for the next opening
//! pulse. The generator only idles for one cycle between back-to-back
//! commands, so the next opening pulse arrives while the detector is still
//! settling. It then locks onto the closing pulse instead and the following
//! measurement is garbage (or never comes).
//!
//! `CommandPacer` keeps one command in flight: the next one goes out once the
//! previous sample is back and the detector has had time to re-arm, or once
//! the command has had plenty of time to produce a sample and didn't (line
//! unplugged, sample dropped).

use super::pulse_detect::SETTLE_CYCLES;
use super::pulse_gen::cycles_per_command;

/// PIO cycles from a sample showing up in the RX FIFO until the detector is
/// waiting for the next opening pulse, with a little margin.
pub const REARM_CYCLES: u64 = SETTLE_CYCLES as u64 + 4;

/// How much longer than the generator needs we wait for a sample before
/// giving up on it.
pub const SAMPLE_TIMEOUT_SLACK: u64 = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PacerState {
    /// No command outstanding since `since`.
    Idle { since: u64 },
    /// A command went out; its sample is due before `deadline`.
    InFlight { deadline: u64 },
}

/// Decides when the next command may go to the generator. Time is in PIO
/// cycles on any monotonic clock.
#[derive(Debug)]
pub struct CommandPacer {
    state: PacerState,
    timeouts: u32,
}

impl CommandPacer {
    /// A pacer whose detector has been idle since `now`.
    pub const fn new(now: u64) -> Self {
        Self {
            state: PacerState::Idle { since: now },
            timeouts: 0,
        }
    }

    /// Whether a command written to the generator at `now` will be measured.
    pub fn ready(&mut self, now: u64) -> bool {
        match self.state {
            PacerState::Idle { since } => now >= since + REARM_CYCLES,
            PacerState::InFlight { deadline } => {
                if now >= deadline {
                    log::debug!("no sample by cycle {}, moving on", deadline);
                    self.timeouts = self.timeouts.wrapping_add(1);
                    self.state = PacerState::Idle { since: deadline };
                    // The detector may be anywhere; give it the full re-arm.
                    now >= deadline + REARM_CYCLES
                } else {
                    false
                }
            }
        }
    }

    /// Records that command `n` was written to the generator at `now`.
    pub fn sent(&mut self, n: u32, now: u64) {
        self.state = PacerState::InFlight {
            deadline: now + cycles_per_command(n) + SAMPLE_TIMEOUT_SLACK,
        };
    }

    /// Records that a sample was taken from the detector at `now`. Samples
    /// with nothing in flight (a late one after a timeout) change nothing.
    pub fn sample_arrived(&mut self, now: u64) {
        if let PacerState::InFlight { .. } = self.state {
            self.state = PacerState::Idle { since: now };
        }
    }

    /// Commands that never produced a sample.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pio::pulse_detect::{self, cycles_to_count, PULSE_DETECTOR};
    use crate::pio::pulse_gen::{self, PULSE_GENERATOR};
    use crate::pio::sim::StateMachine;

    const PIN: u8 = 15;

    fn loopback() -> (StateMachine, StateMachine) {
        let gen = StateMachine::with_program(
            &PULSE_GENERATOR,
            0,
            pulse_gen::config(0, PIN).unwrap(),
        )
        .unwrap();
        let offset = PULSE_GENERATOR.code.len() as u8;
        let det = StateMachine::with_program(
            &PULSE_DETECTOR,
            offset,
            pulse_detect::config(offset, PIN).unwrap(),
        )
        .unwrap();
        (gen, det)
    }

    /// One PIO cycle. The detector sees the line as it was at the end of the
    /// previous cycle.
    fn tick(gen: &mut StateMachine, det: &mut StateMachine) {
        let line = gen.pins();
        det.step(line).unwrap();
        gen.step(0).unwrap();
    }

    const BURST: [u32; 4] = [20, 5, 30, 7];

    #[test]
    fn paced_burst_is_measured_in_full() {
        let (mut gen, mut det) = loopback();
        for _ in 0..16 {
            tick(&mut gen, &mut det);
        }

        let mut pacer = CommandPacer::new(16);
        let mut commands = BURST.iter().copied();
        let mut next = commands.next();
        let mut samples = Vec::new();
        for t in 16..1000u64 {
            if let Some(n) = next {
                if pacer.ready(t) && gen.tx_len() < crate::pio::FIFO_DEPTH {
                    gen.push_tx(n).unwrap();
                    pacer.sent(n, t);
                    next = commands.next();
                }
            }
            tick(&mut gen, &mut det);
            while let Some(sample) = det.pop_rx() {
                samples.push(sample);
                pacer.sample_arrived(t);
            }
        }

        let expected: Vec<u32> = BURST.iter().map(|&n| cycles_to_count(n + 1)).collect();
        assert_eq!(expected, vec![10, 2, 15, 3]);
        assert_eq!(samples, expected);
        assert_eq!(pacer.timeouts(), 0);
    }

    #[test]
    fn unpaced_burst_loses_commands() {
        // What happens if the whole burst goes straight into the TX FIFO.
        let (mut gen, mut det) = loopback();
        for _ in 0..16 {
            tick(&mut gen, &mut det);
        }
        for n in BURST {
            gen.push_tx(n).unwrap();
        }
        let mut samples = Vec::new();
        for _ in 0..1000 {
            tick(&mut gen, &mut det);
            while let Some(sample) = det.pop_rx() {
                samples.push(sample);
            }
        }
        assert_eq!(samples, vec![10, 15]);
    }

    #[test]
    fn waits_for_rearm_after_sample() {
        let mut pacer = CommandPacer::new(0);
        assert!(!pacer.ready(REARM_CYCLES - 1));
        assert!(pacer.ready(REARM_CYCLES));

        pacer.sent(5, 100);
        assert!(!pacer.ready(110));
        pacer.sample_arrived(112);
        assert!(!pacer.ready(112 + REARM_CYCLES - 1));
        assert!(pacer.ready(112 + REARM_CYCLES));
    }

    #[test]
    fn gives_up_on_missing_sample() {
        let mut pacer = CommandPacer::new(0);
        pacer.sent(10, 0);
        let deadline = cycles_per_command(10) + SAMPLE_TIMEOUT_SLACK;
        assert!(!pacer.ready(deadline - 1));
        assert!(!pacer.ready(deadline));
        assert_eq!(pacer.timeouts(), 1);
        assert!(pacer.ready(deadline + REARM_CYCLES));
        assert_eq!(pacer.timeouts(), 1);
    }

    #[test]
    fn late_sample_is_ignored() {
        let mut pacer = CommandPacer::new(0);
        pacer.sent(0, 0);
        let deadline = cycles_per_command(0) + SAMPLE_TIMEOUT_SLACK;
        pacer.ready(deadline);
        pacer.sample_arrived(deadline + 5);
        assert!(pacer.ready(deadline + REARM_CYCLES));
    }
}
