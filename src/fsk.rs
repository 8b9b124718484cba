//! V.21 channel 2 FSK, 300bps.
//!
//! T.30 control messages use the answering channel of V.21: 1750Hz
//! center, mark (binary 1) at 1650Hz, space at 1850Hz. The demodulator
//! runs two sliding tone correlators and recovers bit timing from the
//! comparator transitions, resetting the clock to mid-bit on every edge.

use std::collections::VecDeque;
use std::f64::consts::PI;

use log::debug;

use crate::dsp::{dbm0_to_amplitude, power_level_dbm0, Cpx, PowerMeter};
use crate::{BitEvent, BitSource, TxBit, TxStatus, SAMPLE_RATE};

const MARK_HZ: f64 = 1650.0;
const SPACE_HZ: f64 = 1850.0;
const BAUD: f64 = 300.0;
const TX_LEVEL_DBM0: f64 = -14.0;

/// Correlator window, a little under one bit period.
const WINDOW: usize = 22;

/// Consecutive loud samples before the carrier is called up.
const CARRIER_UP_SAMPLES: u32 = 160;
/// Consecutive quiet samples before the carrier is called down.
const CARRIER_DOWN_SAMPLES: u32 = 240;

fn rad_per_sample(freq: f64) -> f64 {
    2.0 * PI * freq / SAMPLE_RATE as f64
}

/// V.21 modulator: pulls bits, emits phase-continuous FSK.
#[derive(Debug)]
pub struct FskTx {
    phase: f64,
    amplitude: f64,
    bit_acc: f64,
    cur: bool,
}

impl FskTx {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: 0.0,
            amplitude: dbm0_to_amplitude(TX_LEVEL_DBM0),
            bit_acc: 0.0,
            cur: true,
        }
    }

    /// Fill `amp` with modulated bits from `src`.
    pub fn tx(&mut self, amp: &mut [i16], src: &mut dyn BitSource) -> (usize, TxStatus) {
        let sps = SAMPLE_RATE as f64 / BAUD;
        for (i, slot) in amp.iter_mut().enumerate() {
            if self.bit_acc <= 0.0 {
                match src.get_bit() {
                    TxBit::Bit(b) => self.cur = b,
                    TxBit::Underflow => return (i, TxStatus::Underflow),
                    TxBit::Done => return (i, TxStatus::Done),
                }
                self.bit_acc += sps;
            }
            self.phase = (self.phase
                + rad_per_sample(if self.cur { MARK_HZ } else { SPACE_HZ }))
                % (2.0 * PI);
            *slot = (self.amplitude * self.phase.sin()) as i16;
            self.bit_acc -= 1.0;
        }
        (amp.len(), TxStatus::Filled)
    }
}

impl Default for FskTx {
    fn default() -> Self {
        Self::new()
    }
}

/// One sliding single-tone correlator.
#[derive(Debug)]
struct ToneCorrelator {
    rot: Cpx,
    phasor: Cpx,
    window: VecDeque<Cpx>,
    acc: Cpx,
    renorm: u32,
}

impl ToneCorrelator {
    fn new(freq: f64) -> Self {
        Self {
            rot: Cpx::expj(-rad_per_sample(freq)),
            phasor: Cpx::new(1.0, 0.0),
            window: VecDeque::with_capacity(WINDOW + 1),
            acc: Cpx::default(),
            renorm: 0,
        }
    }

    fn update(&mut self, sample: i16) -> f64 {
        self.phasor = self.phasor * self.rot;
        self.renorm += 1;
        if self.renorm >= 1024 {
            self.renorm = 0;
            self.phasor = self.phasor.scale(1.0 / self.phasor.abs());
        }
        let c = self.phasor.scale(f64::from(sample));
        self.acc += c;
        self.window.push_back(c);
        if self.window.len() > WINDOW {
            let old = self.window.pop_front().unwrap();
            self.acc = self.acc - old;
        }
        self.acc.norm_sq()
    }
}

/// V.21 demodulator: feed samples, collect bits and carrier events.
#[derive(Debug)]
pub struct FskRx {
    mark: ToneCorrelator,
    space: ToneCorrelator,
    power: PowerMeter,
    cutoff: i64,
    carrier_on: bool,
    loud: u32,
    quiet: u32,
    clock: f64,
    last_sense: bool,
}

impl FskRx {
    /// `cutoff_dbm0` is the signal level below which no carrier is
    /// reported. T.31 uses -39.09dBm0 for the V.21 receiver.
    #[must_use]
    pub fn new(cutoff_dbm0: f64) -> Self {
        Self {
            mark: ToneCorrelator::new(MARK_HZ),
            space: ToneCorrelator::new(SPACE_HZ),
            power: PowerMeter::new(5),
            cutoff: power_level_dbm0(cutoff_dbm0),
            carrier_on: false,
            loud: 0,
            quiet: 0,
            clock: 0.0,
            last_sense: true,
        }
    }

    /// Process a block of samples, appending events to `out`.
    pub fn rx(&mut self, amp: &[i16], out: &mut Vec<BitEvent>) {
        let sps = SAMPLE_RATE as f64 / BAUD;
        for &s in amp {
            let e_mark = self.mark.update(s);
            let e_space = self.space.update(s);
            let p = self.power.update(s);

            if self.carrier_on {
                if p < self.cutoff {
                    self.quiet += 1;
                    if self.quiet >= CARRIER_DOWN_SAMPLES {
                        debug!("v21 carrier down");
                        self.carrier_on = false;
                        self.quiet = 0;
                        self.loud = 0;
                        out.push(BitEvent::CarrierDown);
                        continue;
                    }
                } else {
                    self.quiet = 0;
                }
            } else {
                if p > self.cutoff {
                    self.loud += 1;
                    if self.loud >= CARRIER_UP_SAMPLES {
                        debug!("v21 carrier up");
                        self.carrier_on = true;
                        self.loud = 0;
                        self.clock = sps / 2.0;
                        out.push(BitEvent::CarrierUp);
                    }
                } else {
                    self.loud = 0;
                }
                continue;
            }

            let sense = e_mark > e_space;
            if sense != self.last_sense {
                // Edge: resample mid-bit from here.
                self.last_sense = sense;
                self.clock = sps / 2.0;
            } else {
                self.clock -= 1.0;
                if self.clock <= 0.0 {
                    self.clock += sps;
                    out.push(BitEvent::Bit(sense));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bits {
        bits: Vec<bool>,
        pos: usize,
    }

    impl BitSource for Bits {
        fn get_bit(&mut self) -> TxBit {
            if self.pos < self.bits.len() {
                self.pos += 1;
                TxBit::Bit(self.bits[self.pos - 1])
            } else {
                TxBit::Done
            }
        }
    }

    #[test]
    fn bits_survive_loopback() {
        let pattern: Vec<bool> = (0..200).map(|i| (i * 7 + i / 3) % 3 != 0).collect();
        // Lead with idle marks so carrier detect and clock settle.
        let mut bits = vec![true; 40];
        bits.extend_from_slice(&pattern);
        let n = bits.len();
        let mut src = Bits { bits, pos: 0 };

        let mut tx = FskTx::new();
        let mut audio = vec![0i16; (n as f64 * 8000.0 / 300.0) as usize + 100];
        let (produced, status) = tx.tx(&mut audio, &mut src);
        assert_eq!(status, TxStatus::Done);

        let mut rx = FskRx::new(-39.09);
        let mut events = Vec::new();
        for chunk in audio[..produced].chunks(160) {
            rx.rx(chunk, &mut events);
        }
        assert_eq!(events.first(), Some(&BitEvent::CarrierUp));
        let got: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                BitEvent::Bit(b) => Some(*b),
                _ => None,
            })
            .collect();
        // The demodulated stream must contain the pattern contiguously;
        // carrier detection may eat a few of the leading idle bits.
        let pat: Vec<bool> = pattern;
        assert!(
            got.windows(pat.len()).any(|w| w == pat.as_slice()),
            "pattern not recovered: got {} bits",
            got.len()
        );
    }

    #[test]
    fn silence_is_quiet() {
        let mut rx = FskRx::new(-39.09);
        let mut events = Vec::new();
        rx.rx(&[0i16; 8000], &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn carrier_drop_reported() {
        let mut bits = Bits {
            bits: vec![true; 150],
            pos: 0,
        };
        let mut tx = FskTx::new();
        let mut audio = vec![0i16; 150 * 27 + 8000];
        let (produced, _) = tx.tx(&mut audio, &mut bits);
        audio[produced..].fill(0);
        let mut rx = FskRx::new(-39.09);
        let mut events = Vec::new();
        rx.rx(&audio, &mut events);
        assert!(events.contains(&BitEvent::CarrierUp));
        assert_eq!(events.last(), Some(&BitEvent::CarrierDown));
    }
}
