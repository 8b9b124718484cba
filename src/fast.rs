//! The "fast" fax modems: V.27ter, V.29 and V.17.
//!
//! These carry the non-ECM image data. Each is a linear modulation on a
//! single carrier: a training preamble of phase reversals, then PSK/QAM
//! symbols. The demodulator recovers symbol timing from the reversals,
//! takes its phase and gain reference from the double same-phase marker
//! that closes the training, and then makes coherent decisions.
//!
//! With only a handful of samples per symbol the negative-frequency image
//! of the real passband signal does not average out of a plain correlator,
//! so each symbol is recovered by solving the 2x2 real system that couples
//! the symbol and its conjugate through the image term. See `solve_symbol`.

use std::f64::consts::PI;

use log::debug;

use crate::dsp::{dbm0_to_amplitude, power_level_dbm0, Cpx, PowerMeter};
use crate::{BitEvent, BitSource, TxBit, TxStatus, SAMPLE_RATE};

/// Which fast modem family is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastKind {
    V17,
    V27ter,
    V29,
}

const TX_LEVEL_DBM0: f64 = -12.0;

/// Carrier must exceed this to be considered present.
const RISE_DBM0: f64 = -26.0;

/// Symbol boundary guard: samples this close to a boundary are left out
/// of the decision window, buying tolerance for residual timing error.
const GUARD: f64 = 0.6;

/// Phase-reversal crossings averaged before the symbol clock is trusted.
const TIMING_FLIPS: u32 = 24;

/// Alternations required before the end-of-training marker is accepted.
const MIN_ALTERNATIONS: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct Params {
    carrier_hz: f64,
    baud: f64,
    bits_per_symbol: u32,
    training_ms: u64,
}

fn params(kind: FastKind, bit_rate: u32, short_train: bool) -> Params {
    match kind {
        FastKind::V27ter => match bit_rate {
            2400 => Params {
                carrier_hz: 1800.0,
                baud: 1200.0,
                bits_per_symbol: 2,
                training_ms: 943,
            },
            _ => Params {
                carrier_hz: 1800.0,
                baud: 1600.0,
                bits_per_symbol: 3,
                training_ms: 708,
            },
        },
        FastKind::V29 => Params {
            carrier_hz: 1700.0,
            baud: 2400.0,
            bits_per_symbol: if bit_rate == 7200 { 3 } else { 4 },
            training_ms: 234,
        },
        FastKind::V17 => Params {
            carrier_hz: 1800.0,
            baud: 2400.0,
            bits_per_symbol: match bit_rate {
                7200 => 3,
                9600 => 4,
                12000 => 5,
                _ => 6,
            },
            training_ms: if short_train { 142 } else { 1393 },
        },
    }
}

/// Constellation for the given symbol width, scaled to unit mean power.
fn constellation(bits_per_symbol: u32) -> Vec<Cpx> {
    let pts: Vec<Cpx> = match bits_per_symbol {
        2 => [(1.0, 1.0), (-1.0, 1.0), (-1.0, -1.0), (1.0, -1.0)]
            .iter()
            .map(|&(re, im)| Cpx::new(re, im))
            .collect(),
        3 => (0..8).map(|k| Cpx::expj(f64::from(k) * PI / 4.0)).collect(),
        4 => square_grid(&[-3.0, -1.0, 1.0, 3.0]),
        5 => {
            // 32-point cross: the 6x6 grid less its corners.
            let axis = [-5.0, -3.0, -1.0, 1.0, 3.0, 5.0];
            let mut pts = square_grid(&axis);
            pts.retain(|p| !(p.re.abs() > 4.0 && p.im.abs() > 4.0));
            pts
        }
        6 => square_grid(&[-7.0, -5.0, -3.0, -1.0, 1.0, 3.0, 5.0, 7.0]),
        _ => vec![Cpx::new(1.0, 0.0), Cpx::new(-1.0, 0.0)],
    };
    let mean_power = pts.iter().map(|p| p.norm_sq()).sum::<f64>() / pts.len() as f64;
    let k = 1.0 / mean_power.sqrt();
    pts.iter().map(|p| p.scale(k)).collect()
}

fn square_grid(axis: &[f64]) -> Vec<Cpx> {
    let mut pts = Vec::with_capacity(axis.len() * axis.len());
    for &im in axis {
        for &re in axis {
            pts.push(Cpx::new(re, im));
        }
    }
    pts
}

/// Sign of training symbol `k` out of `total`.
///
/// The preamble alternates phase every symbol and ends with two
/// same-phase symbols; the receiver keys its phase reference off that
/// pair. The starting sign is chosen so the alternation runs right up to
/// the marker.
fn training_sign(k: usize, total: usize) -> f64 {
    if k + 2 >= total {
        return 1.0;
    }
    let first = if total % 2 == 0 { 1.0 } else { -1.0 };
    if k % 2 == 0 {
        first
    } else {
        -first
    }
}

#[derive(Debug)]
enum TxStage {
    Training,
    Data,
    /// Last data symbol is on the wire; report Done at its end.
    Draining,
    Done,
}

/// Fast modem modulator.
#[derive(Debug)]
pub struct FastTx {
    kind: FastKind,
    p: Params,
    training_syms: usize,
    points: Vec<Cpx>,
    amplitude: f64,
    n: u64,
    sym: i64,
    point: Cpx,
    carrier: Cpx,
    rot: Cpx,
    stage: TxStage,
}

impl FastTx {
    #[must_use]
    pub fn new(kind: FastKind, bit_rate: u32) -> Self {
        let mut tx = Self {
            kind,
            p: params(kind, bit_rate, false),
            training_syms: 0,
            points: Vec::new(),
            amplitude: dbm0_to_amplitude(TX_LEVEL_DBM0),
            n: 0,
            sym: -1,
            point: Cpx::default(),
            carrier: Cpx::new(1.0, 0.0),
            rot: Cpx::new(1.0, 0.0),
            stage: TxStage::Done,
        };
        tx.restart(bit_rate, false);
        tx
    }

    /// Reset for a new burst at the given rate and training length.
    pub fn restart(&mut self, bit_rate: u32, short_train: bool) {
        self.p = params(self.kind, bit_rate, short_train);
        self.training_syms =
            (self.p.baud * self.p.training_ms as f64 / 1000.0) as usize;
        self.points = constellation(self.p.bits_per_symbol);
        self.n = 0;
        self.sym = -1;
        self.point = Cpx::default();
        self.carrier = Cpx::new(1.0, 0.0);
        self.rot = Cpx::expj(2.0 * PI * self.p.carrier_hz / SAMPLE_RATE as f64);
        self.stage = TxStage::Training;
    }

    fn next_symbol(&mut self, k: usize, src: &mut dyn BitSource) {
        match self.stage {
            TxStage::Training => {
                if k < self.training_syms {
                    self.point = Cpx::new(training_sign(k, self.training_syms), 0.0);
                    return;
                }
                self.stage = TxStage::Data;
                self.next_symbol(k, src);
            }
            TxStage::Data => {
                let mut idx = 0usize;
                for bit in 0..self.p.bits_per_symbol {
                    match src.get_bit() {
                        TxBit::Bit(b) => idx |= usize::from(b) << bit,
                        TxBit::Underflow | TxBit::Done => {
                            if bit == 0 {
                                self.stage = TxStage::Done;
                                return;
                            }
                            // Pad the straggling bits of the last octet.
                            self.stage = TxStage::Draining;
                            break;
                        }
                    }
                }
                self.point = self.points[idx];
            }
            TxStage::Draining => self.stage = TxStage::Done,
            TxStage::Done => {}
        }
    }

    /// Fill `amp` with modulated signal, pulling data bits from `src`.
    pub fn tx(&mut self, amp: &mut [i16], src: &mut dyn BitSource) -> (usize, TxStatus) {
        if matches!(self.stage, TxStage::Done) {
            return (0, TxStatus::Done);
        }
        let sps = SAMPLE_RATE as f64 / self.p.baud;
        for (i, slot) in amp.iter_mut().enumerate() {
            let k = (self.n as f64 / sps) as i64;
            if k != self.sym {
                self.sym = k;
                self.next_symbol(k as usize, src);
                if matches!(self.stage, TxStage::Done) {
                    return (i, TxStatus::Done);
                }
            }
            let s = self.point * self.carrier;
            *slot = (self.amplitude * s.re) as i16;
            self.carrier = self.carrier * self.rot;
            self.n += 1;
            if self.n % 4096 == 0 {
                self.carrier = self.carrier.scale(1.0 / self.carrier.abs());
            }
        }
        (amp.len(), TxStatus::Filled)
    }
}

#[derive(Debug)]
enum RxStage {
    /// Waiting for signal energy.
    Hunt,
    /// Carrier present; averaging phase-reversal crossings for the clock.
    Timing,
    /// Clock locked; counting alternations, waiting for the marker pair.
    Train,
    /// Trained; making symbol decisions.
    Data,
}

/// Fast modem demodulator.
///
/// Reports training and carrier events along with decided bits. It never
/// trains on a V.21 signal: the alternation test fails, which is what
/// lets the session's parallel V.21 receiver win the dual-rail race.
#[derive(Debug)]
pub struct FastRx {
    kind: FastKind,
    p: Params,
    points: Vec<Cpx>,
    rise: i64,
    power: PowerMeter,
    n: u64,
    carrier: Cpx,
    rot: Cpx,
    stage: RxStage,
    loud: u32,
    // Timing recovery.
    bb_prev: Cpx,
    u_ref: Cpx,
    ref_wait: u32,
    prev_proj: f64,
    flip_acc: Cpx,
    flips: u32,
    // Symbol windows.
    next_boundary: f64,
    win_m: Cpx,
    win_s: Cpx,
    win_n: u32,
    // Decisions.
    prev_sym: Cpx,
    have_prev: bool,
    alternations: u32,
    z: Cpx,
    ref_mag: f64,
    quiet_syms: u32,
}

impl FastRx {
    #[must_use]
    pub fn new(kind: FastKind, bit_rate: u32) -> Self {
        let mut rx = Self {
            kind,
            p: params(kind, bit_rate, false),
            points: Vec::new(),
            rise: power_level_dbm0(RISE_DBM0),
            power: PowerMeter::new(3),
            n: 0,
            carrier: Cpx::new(1.0, 0.0),
            rot: Cpx::new(1.0, 0.0),
            stage: RxStage::Hunt,
            loud: 0,
            bb_prev: Cpx::default(),
            u_ref: Cpx::default(),
            ref_wait: 0,
            prev_proj: 0.0,
            flip_acc: Cpx::default(),
            flips: 0,
            next_boundary: 0.0,
            win_m: Cpx::default(),
            win_s: Cpx::default(),
            win_n: 0,
            prev_sym: Cpx::default(),
            have_prev: false,
            alternations: 0,
            z: Cpx::default(),
            ref_mag: 0.0,
            quiet_syms: 0,
        };
        rx.restart(bit_rate, false);
        rx
    }

    /// Reset for a new burst at the given rate and training length.
    pub fn restart(&mut self, bit_rate: u32, short_train: bool) {
        self.p = params(self.kind, bit_rate, short_train);
        self.points = constellation(self.p.bits_per_symbol);
        self.n = 0;
        self.carrier = Cpx::new(1.0, 0.0);
        self.rot = Cpx::expj(-2.0 * PI * self.p.carrier_hz / SAMPLE_RATE as f64);
        self.power = PowerMeter::new(3);
        self.to_hunt();
    }

    fn to_hunt(&mut self) {
        self.stage = RxStage::Hunt;
        self.loud = 0;
        self.flip_acc = Cpx::default();
        self.flips = 0;
        self.prev_proj = 0.0;
        self.ref_wait = 0;
        self.have_prev = false;
        self.alternations = 0;
        self.quiet_syms = 0;
    }

    fn sps(&self) -> f64 {
        SAMPLE_RATE as f64 / self.p.baud
    }

    /// Process a block of samples, appending events to `out`.
    pub fn rx(&mut self, amp: &[i16], out: &mut Vec<BitEvent>) {
        for &s in amp {
            let bb = self.carrier.scale(f64::from(s));
            let c2 = self.carrier * self.carrier;
            let p = self.power.update(s);

            match self.stage {
                RxStage::Hunt => {
                    if p > self.rise {
                        self.loud += 1;
                        if self.loud >= 8 {
                            debug!("fast carrier up at sample {}", self.n);
                            out.push(BitEvent::CarrierUp);
                            self.stage = RxStage::Timing;
                            self.ref_wait = 2;
                        }
                    } else {
                        self.loud = 0;
                    }
                }
                RxStage::Timing => {
                    if self.lost_signal(p) {
                        out.push(BitEvent::TrainingFailed);
                        out.push(BitEvent::CarrierDown);
                        self.to_hunt();
                    } else {
                        self.track_timing(bb);
                    }
                }
                RxStage::Train | RxStage::Data => {
                    if (self.n as f64) >= self.next_boundary {
                        self.finish_symbol(out);
                        self.next_boundary += self.sps();
                    }
                    let pos = self.n as f64 - (self.next_boundary - self.sps());
                    if pos >= GUARD && pos < self.sps() - GUARD {
                        self.win_m += bb;
                        self.win_s += c2;
                        self.win_n += 1;
                    }
                }
            }

            self.carrier = self.carrier * self.rot;
            self.bb_prev = bb;
            self.n += 1;
            if self.n % 4096 == 0 {
                self.carrier = self.carrier.scale(1.0 / self.carrier.abs());
            }
        }
    }

    fn lost_signal(&mut self, p: i64) -> bool {
        if p < self.rise / 4 {
            self.loud += 1;
            self.loud >= 64
        } else {
            self.loud = 0;
            false
        }
    }

    /// Average phase-reversal crossings into a symbol clock estimate.
    fn track_timing(&mut self, bb: Cpx) {
        let smooth = (bb + self.bb_prev).scale(0.5);
        if self.ref_wait > 0 {
            self.ref_wait -= 1;
            if self.ref_wait == 0 {
                self.u_ref = smooth;
            }
            return;
        }
        let proj = smooth.re * self.u_ref.re + smooth.im * self.u_ref.im;
        if proj * self.prev_proj < 0.0 {
            // Interpolated zero crossing of the reversal, in sample time.
            let t = self.n as f64 - 1.0
                + self.prev_proj / (self.prev_proj - proj);
            let frac = (t % self.sps()) / self.sps();
            self.flip_acc += Cpx::expj(2.0 * PI * frac);
            self.flips += 1;
            if self.flips >= TIMING_FLIPS {
                let mut offset =
                    self.flip_acc.im.atan2(self.flip_acc.re) / (2.0 * PI) * self.sps();
                offset = offset.rem_euclid(self.sps());
                let mut boundary = offset;
                while boundary <= self.n as f64 {
                    boundary += self.sps();
                }
                debug!("fast symbol clock locked, offset {:.2}", offset);
                self.next_boundary = boundary;
                self.win_m = Cpx::default();
                self.win_s = Cpx::default();
                self.win_n = 0;
                self.stage = RxStage::Train;
            }
        }
        self.prev_proj = proj;
    }

    /// Recover the transmitted symbol from a window sum.
    ///
    /// The window integral of the real passband signal couples the symbol
    /// q and conj(q) through the image sum S: m = N*q + S*conj(q). Solve
    /// for q exactly rather than hoping S averages away.
    fn solve_symbol(m: Cpx, s: Cpx, n: u32) -> Option<Cpx> {
        let n = f64::from(n);
        let denom = n * n - s.norm_sq();
        if denom.abs() < 0.5 {
            return None;
        }
        Some((m.scale(n) - s * m.conj()).scale(1.0 / denom))
    }

    fn finish_symbol(&mut self, out: &mut Vec<BitEvent>) {
        let (m, s, n) = (self.win_m, self.win_s, self.win_n);
        self.win_m = Cpx::default();
        self.win_s = Cpx::default();
        self.win_n = 0;
        if n == 0 {
            return;
        }
        let Some(q) = Self::solve_symbol(m, s, n) else {
            return;
        };

        match self.stage {
            RxStage::Train => self.train_symbol(q, out),
            RxStage::Data => self.data_symbol(q, out),
            _ => {}
        }
    }

    fn train_symbol(&mut self, q: Cpx, out: &mut Vec<BitEvent>) {
        if q.abs() < dbm0_to_amplitude(RISE_DBM0) / 2.0 {
            // Partial or dead window during training; tolerate a couple.
            self.quiet_syms += 1;
            if self.quiet_syms >= 3 {
                out.push(BitEvent::TrainingFailed);
                out.push(BitEvent::CarrierDown);
                self.to_hunt();
            }
            return;
        }
        self.quiet_syms = 0;
        if !self.have_prev {
            self.prev_sym = q;
            self.have_prev = true;
            return;
        }
        let dot = q.re * self.prev_sym.re + q.im * self.prev_sym.im;
        if dot < 0.0 {
            self.alternations += 1;
        } else if self.alternations >= MIN_ALTERNATIONS {
            // The double same-phase marker: end of training. This symbol
            // is the +1 reference; everything keys off it.
            self.z = q;
            self.ref_mag = q.abs();
            debug!(
                "fast trained: {} alternations, ref {:.1}",
                self.alternations, self.ref_mag
            );
            out.push(BitEvent::TrainingSucceeded);
            self.stage = RxStage::Data;
        } else {
            debug!("fast training alternation broke early ({})", self.alternations);
            out.push(BitEvent::TrainingFailed);
            self.to_hunt();
        }
        self.prev_sym = q;
    }

    fn data_symbol(&mut self, q: Cpx, out: &mut Vec<BitEvent>) {
        if q.abs() < self.ref_mag * 0.1 {
            self.quiet_syms += 1;
            if self.quiet_syms >= 3 {
                debug!("fast carrier down");
                out.push(BitEvent::CarrierDown);
                self.to_hunt();
            }
            return;
        }
        self.quiet_syms = 0;
        // Derotate and rescale by the training reference.
        let est = (q * self.z.conj()).scale(1.0 / self.z.norm_sq());
        let mut best = 0;
        let mut best_d = f64::MAX;
        for (i, pt) in self.points.iter().enumerate() {
            let d = (est - *pt).norm_sq();
            if d < best_d {
                best_d = d;
                best = i;
            }
        }
        for bit in 0..self.p.bits_per_symbol {
            out.push(BitEvent::Bit(best & (1 << bit) != 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytes {
        data: Vec<u8>,
        pos: usize,
    }

    impl Bytes {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
            }
        }
    }

    impl BitSource for Bytes {
        fn get_bit(&mut self) -> TxBit {
            if self.pos >= self.data.len() * 8 {
                return TxBit::Done;
            }
            let b = self.data[self.pos / 8] & (1 << (self.pos % 8)) != 0;
            self.pos += 1;
            TxBit::Bit(b)
        }
    }

    fn collect_bytes(events: &[BitEvent]) -> Vec<u8> {
        let bits: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                BitEvent::Bit(b) => Some(*b),
                _ => None,
            })
            .collect();
        bits.chunks(8)
            .filter(|c| c.len() == 8)
            .map(|c| {
                c.iter()
                    .enumerate()
                    .fold(0u8, |byte, (i, &b)| byte | (u8::from(b) << i))
            })
            .collect()
    }

    fn loopback(kind: FastKind, bit_rate: u32, short_train: bool) {
        let payload: Vec<u8> = (0u16..96).map(|i| (i * 37 + 11) as u8).collect();
        let mut tx = FastTx::new(kind, bit_rate);
        tx.restart(bit_rate, short_train);
        let mut rx = FastRx::new(kind, bit_rate);
        rx.restart(bit_rate, short_train);

        let mut src = Bytes::new(&payload);
        let mut events = Vec::new();
        let mut audio = [0i16; 160];
        loop {
            let (n, status) = tx.tx(&mut audio, &mut src);
            rx.rx(&audio[..n], &mut events);
            if status == TxStatus::Done {
                break;
            }
        }
        // Let the carrier-loss detector run.
        rx.rx(&[0i16; 800], &mut events);

        assert!(
            events.contains(&BitEvent::TrainingSucceeded),
            "{kind:?}@{bit_rate} never trained"
        );
        assert_eq!(events.last(), Some(&BitEvent::CarrierDown));
        let got = collect_bytes(&events);
        assert!(
            got.len() >= payload.len(),
            "{kind:?}@{bit_rate}: {} of {} bytes",
            got.len(),
            payload.len()
        );
        assert_eq!(&got[..payload.len()], &payload[..], "{kind:?}@{bit_rate}");
    }

    #[test]
    fn v29_9600_loopback() {
        loopback(FastKind::V29, 9600, false);
    }

    #[test]
    fn v29_7200_loopback() {
        loopback(FastKind::V29, 7200, false);
    }

    #[test]
    fn v27ter_loopbacks() {
        loopback(FastKind::V27ter, 2400, false);
        loopback(FastKind::V27ter, 4800, false);
    }

    #[test]
    fn v17_loopbacks() {
        loopback(FastKind::V17, 9600, false);
        loopback(FastKind::V17, 14400, true);
    }

    #[test]
    fn constellations_are_unit_power() {
        for bits in 2..=6 {
            let pts = constellation(bits);
            assert_eq!(pts.len(), 1 << bits);
            let power: f64 = pts.iter().map(|p| p.norm_sq()).sum::<f64>() / pts.len() as f64;
            assert!((power - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn training_ends_with_marker_pair() {
        for total in [340, 561, 1132] {
            assert_eq!(training_sign(total - 1, total), 1.0);
            assert_eq!(training_sign(total - 2, total), 1.0);
            assert_eq!(training_sign(total - 3, total), -1.0);
            for k in 0..total - 3 {
                assert_ne!(training_sign(k, total), training_sign(k + 1, total));
            }
        }
    }

    #[test]
    fn no_training_on_silence() {
        let mut rx = FastRx::new(FastKind::V29, 9600);
        let mut events = Vec::new();
        rx.rx(&[0i16; 16000], &mut events);
        assert!(events.is_empty());
    }
}
