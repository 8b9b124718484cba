//! Bit-serial HDLC framing.
//!
//! T.30 control messages ride in HDLC frames over the V.21 modem: opening
//! flags, bit stuffing after five ones, a 16-bit FCS, closing flag. The
//! framer and deframer here speak bits on the line side and whole octet
//! buffers on the session side.
//!
//! The FCS is the X.25 one (RFC 1662), bit-reflected, transmitted low
//! octet first.

use std::collections::VecDeque;

use log::debug;

use crate::{BitSource, TxBit};

const FLAG: u8 = 0x7e;

/// Frames smaller than address + control + FCS are noise.
const MIN_FRAME_LEN: usize = 4;

/// Longest frame payload we will accumulate, FCS included.
const MAX_FRAME_LEN: usize = 256;

/// Compute the HDLC frame check sequence over `data`.
#[must_use]
pub fn compute_fcs(data: &[u8]) -> u16 {
    let mut fcs = 0xffffu16;
    for &byte in data {
        fcs ^= u16::from(byte);
        for _ in 0..8 {
            fcs = if fcs & 1 != 0 {
                (fcs >> 1) ^ 0x8408
            } else {
                fcs >> 1
            };
        }
    }
    fcs ^ 0xffff
}

/// What the deframer found in the bit stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// A complete frame: payload followed by its two FCS octets.
    Frame { data: Vec<u8>, fcs_ok: bool },
    /// Enough consecutive flags seen to call the framing valid.
    FramingOk,
}

#[derive(Debug)]
enum RxState {
    /// Sliding an 8-bit window across the stream looking for a flag.
    Hunt(u8),
    /// Inside (or between) frames, collecting unstuffed bits.
    Sync { ones: u8, bits: Vec<bool> },
    /// Six ones seen: the next bit decides flag (0) or abort (1).
    Closing { bits: Vec<bool> },
}

/// HDLC deframer: feed it line bits, get frames.
#[derive(Debug)]
pub struct HdlcRx {
    state: RxState,
    crc_check: bool,
    framing_ok_threshold: u32,
    flags_seen: u32,
    framing_reported: bool,
}

impl HdlcRx {
    /// `framing_ok_threshold` is how many flags make a valid preamble.
    #[must_use]
    pub fn new(crc_check: bool, framing_ok_threshold: u32) -> Self {
        Self {
            state: RxState::Hunt(0xff),
            crc_check,
            framing_ok_threshold,
            flags_seen: 0,
            framing_reported: false,
        }
    }

    /// Back to hunting, forgetting any partial frame and flag count.
    pub fn reset(&mut self) {
        self.state = RxState::Hunt(0xff);
        self.flags_seen = 0;
        self.framing_reported = false;
    }

    /// Process one received bit, appending any events to `out`.
    pub fn put_bit(&mut self, bit: bool, out: &mut Vec<RxEvent>) {
        let bit = u8::from(bit);
        self.state = match std::mem::replace(&mut self.state, RxState::Hunt(0xff)) {
            RxState::Hunt(reg) => {
                let reg = (reg >> 1) | (bit << 7);
                if reg == FLAG {
                    self.saw_flag(out);
                    RxState::Sync {
                        ones: 0,
                        bits: Vec::new(),
                    }
                } else {
                    RxState::Hunt(reg)
                }
            }
            RxState::Sync { ones, mut bits } => {
                if bits.len() > MAX_FRAME_LEN * 8 {
                    RxState::Hunt(0xff)
                } else if bit != 0 {
                    bits.push(true);
                    if ones == 5 {
                        RxState::Closing { bits }
                    } else {
                        RxState::Sync {
                            ones: ones + 1,
                            bits,
                        }
                    }
                } else if ones == 5 {
                    // Stuffed zero, drop it.
                    RxState::Sync { ones: 0, bits }
                } else {
                    bits.push(false);
                    RxState::Sync { ones: 0, bits }
                }
            }
            RxState::Closing { mut bits } => {
                if bit != 0 {
                    // Seven ones: abort. Drop what we have.
                    debug!("hdlc rx abort");
                    RxState::Hunt(0xff)
                } else {
                    // Closing flag. The trailing "0111111" already made it
                    // into the bit buffer; strip it before packing.
                    self.saw_flag(out);
                    if bits.len() >= 7 {
                        bits.truncate(bits.len() - 7);
                        self.take_frame(&bits, out);
                    }
                    RxState::Sync {
                        ones: 0,
                        bits: Vec::new(),
                    }
                }
            }
        };
    }

    fn saw_flag(&mut self, out: &mut Vec<RxEvent>) {
        self.flags_seen += 1;
        if !self.framing_reported && self.flags_seen >= self.framing_ok_threshold {
            self.framing_reported = true;
            out.push(RxEvent::FramingOk);
        }
    }

    fn take_frame(&mut self, bits: &[bool], out: &mut Vec<RxEvent>) {
        if !self.framing_reported {
            // No believable preamble yet; whatever this was, it was not
            // a frame for us.
            return;
        }
        if bits.len() % 8 != 0 {
            debug!("hdlc frame length {} not a multiple of 8", bits.len());
            return;
        }
        let data: Vec<u8> = bits
            .chunks(8)
            .map(|c| {
                c.iter()
                    .enumerate()
                    .fold(0u8, |b, (i, &bit)| b | (u8::from(bit) << i))
            })
            .collect();
        if data.len() < MIN_FRAME_LEN {
            debug!("hdlc frame too short: {} octets", data.len());
            return;
        }
        let fcs_ok = if self.crc_check {
            let want = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
            compute_fcs(&data[..data.len() - 2]) == want
        } else {
            true
        };
        out.push(RxEvent::Frame { data, fcs_ok });
    }
}

#[derive(Debug, Clone, Copy)]
enum TxState {
    /// Sending `n` more flags, currently `bit` bits into the pattern.
    Flags { n: usize, bit: u8 },
    /// Sending the stuffed bits of the current frame.
    Frame,
    /// Nothing queued; filling with flags until told otherwise.
    Idle { bit: u8 },
    /// Closing flags done, transmission over.
    Finished,
}

/// HDLC framer: queue frames, pull line bits.
///
/// When a frame finishes and nothing is queued, one [`TxBit::Underflow`]
/// is reported so the session can solicit the next frame (or shut the
/// modem down); flags are transmitted in the meantime.
#[derive(Debug)]
pub struct HdlcTx {
    state: TxState,
    bits: VecDeque<bool>,
    pending: VecDeque<Vec<u8>>,
    shutdown: bool,
    underflow_reported: bool,
}

impl HdlcTx {
    /// `preamble_flags` go out before the first frame. The T.30 preamble
    /// is 1s +-15% of flags, so 32 of them at 300bps.
    #[must_use]
    pub fn new(preamble_flags: usize) -> Self {
        Self {
            state: TxState::Flags {
                n: preamble_flags,
                bit: 0,
            },
            bits: VecDeque::new(),
            pending: VecDeque::new(),
            shutdown: false,
            underflow_reported: false,
        }
    }

    /// Queue a frame. The FCS is appended here; `payload` is the bare
    /// frame (address, control, information).
    pub fn frame(&mut self, payload: &[u8]) {
        let mut f = payload.to_vec();
        f.extend_from_slice(&compute_fcs(payload).to_le_bytes());
        self.pending.push_back(f);
        self.underflow_reported = false;
    }

    /// After the current frame and closing flags, end the transmission.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
        self.underflow_reported = false;
    }

    fn load_frame(&mut self, frame: &[u8]) {
        // Stuff a zero after any run of five ones. Flags stay outside.
        let mut ones = 0;
        self.bits.clear();
        for &byte in frame {
            for i in 0..8 {
                let bit = byte & (1 << i) != 0;
                self.bits.push_back(bit);
                if bit {
                    ones += 1;
                    if ones == 5 {
                        self.bits.push_back(false);
                        ones = 0;
                    }
                } else {
                    ones = 0;
                }
            }
        }
    }

    fn flag_bit(bit: u8) -> bool {
        FLAG & (1 << bit) != 0
    }
}

impl BitSource for HdlcTx {
    fn get_bit(&mut self) -> TxBit {
        loop {
            match self.state {
                TxState::Flags { n, bit } => {
                    if n == 0 {
                        self.state = if let Some(f) = self.pending.pop_front() {
                            self.load_frame(&f);
                            TxState::Frame
                        } else if self.shutdown {
                            TxState::Finished
                        } else {
                            TxState::Idle { bit: 0 }
                        };
                        continue;
                    }
                    let out = Self::flag_bit(bit);
                    self.state = if bit == 7 {
                        TxState::Flags { n: n - 1, bit: 0 }
                    } else {
                        TxState::Flags { n, bit: bit + 1 }
                    };
                    return TxBit::Bit(out);
                }
                TxState::Frame => match self.bits.pop_front() {
                    Some(b) => return TxBit::Bit(b),
                    None => {
                        // Closing flag; doubles as the next opening flag.
                        self.state = TxState::Flags { n: 1, bit: 0 };
                    }
                },
                TxState::Idle { bit } => {
                    if !self.pending.is_empty() || self.shutdown {
                        // Let the current flag finish cleanly.
                        self.state = TxState::Flags {
                            n: usize::from(bit != 0),
                            bit,
                        };
                        continue;
                    }
                    if !self.underflow_reported {
                        self.underflow_reported = true;
                        return TxBit::Underflow;
                    }
                    let out = Self::flag_bit(bit);
                    self.state = TxState::Idle {
                        bit: (bit + 1) % 8,
                    };
                    return TxBit::Bit(out);
                }
                TxState::Finished => return TxBit::Done,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_bits(tx: &mut HdlcTx, max: usize) -> Vec<bool> {
        let mut bits = Vec::new();
        for _ in 0..max {
            match tx.get_bit() {
                TxBit::Bit(b) => bits.push(b),
                TxBit::Underflow => {}
                TxBit::Done => break,
            }
        }
        bits
    }

    #[test]
    fn fcs_known_value() {
        // RFC 1662 check sequence property: FCS over data+FCS is constant.
        let data = [0xff, 0x03, 0x2f, 0x11, 0x22];
        let fcs = compute_fcs(&data);
        let mut whole = data.to_vec();
        whole.extend_from_slice(&fcs.to_le_bytes());
        let mut check = 0xffffu16;
        for &byte in &whole {
            check ^= u16::from(byte);
            for _ in 0..8 {
                check = if check & 1 != 0 {
                    (check >> 1) ^ 0x8408
                } else {
                    check >> 1
                };
            }
        }
        assert_eq!(check, 0xf0b8);
    }

    #[test]
    fn frame_roundtrip() {
        let payload = [0xff, 0x13, 0x2f, 0x00, 0x55, 0xaa, 0x7e, 0x7d];
        let mut tx = HdlcTx::new(8);
        tx.frame(&payload);
        tx.shutdown();
        let bits = drain_bits(&mut tx, 4000);

        let mut rx = HdlcRx::new(true, 5);
        let mut events = Vec::new();
        for b in bits {
            rx.put_bit(b, &mut events);
        }
        assert!(events.contains(&RxEvent::FramingOk));
        let frame = events
            .iter()
            .find_map(|e| match e {
                RxEvent::Frame { data, fcs_ok } => Some((data.clone(), *fcs_ok)),
                _ => None,
            })
            .expect("no frame decoded");
        assert!(frame.1);
        assert_eq!(&frame.0[..payload.len()], &payload);
        assert_eq!(frame.0.len(), payload.len() + 2);
    }

    #[test]
    fn back_to_back_frames() {
        let mut tx = HdlcTx::new(4);
        tx.frame(&[0xff, 0x03, 0x01, 0x02]);
        tx.frame(&[0xff, 0x13, 0x03, 0x04]);
        tx.shutdown();
        let bits = drain_bits(&mut tx, 4000);
        let mut rx = HdlcRx::new(true, 2);
        let mut events = Vec::new();
        for b in bits {
            rx.put_bit(b, &mut events);
        }
        let frames: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RxEvent::Frame { data, fcs_ok: true } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..4], &[0xff, 0x03, 0x01, 0x02]);
        assert_eq!(&frames[1][..4], &[0xff, 0x13, 0x03, 0x04]);
    }

    #[test]
    fn corrupt_fcs_flagged() {
        let payload = [0xff, 0x03, 0x2f, 0x42];
        let mut tx = HdlcTx::new(4);
        tx.frame(&payload);
        tx.shutdown();
        let mut bits = drain_bits(&mut tx, 2000);
        // Flip a payload bit mid-frame (past the 4 opening flags).
        let idx = 4 * 8 + 11;
        bits[idx] = !bits[idx];
        let mut rx = HdlcRx::new(true, 2);
        let mut events = Vec::new();
        for b in bits {
            rx.put_bit(b, &mut events);
        }
        let bad = events.iter().any(
            |e| matches!(e, RxEvent::Frame { fcs_ok, .. } if !*fcs_ok),
        );
        let good = events.iter().any(
            |e| matches!(e, RxEvent::Frame { fcs_ok, .. } if *fcs_ok),
        );
        assert!(bad || !good, "corrupted frame must not verify");
    }

    #[test]
    fn underflow_reported_once_then_flags() {
        let mut tx = HdlcTx::new(2);
        tx.frame(&[0xff, 0x03, 0x00, 0x01]);
        let mut saw_underflow = 0;
        let mut bits = 0;
        for _ in 0..2000 {
            match tx.get_bit() {
                TxBit::Bit(_) => bits += 1,
                TxBit::Underflow => saw_underflow += 1,
                TxBit::Done => panic!("no shutdown requested"),
            }
        }
        assert_eq!(saw_underflow, 1);
        assert_eq!(bits, 2000 - 1);
        // A late frame resumes transmission.
        tx.frame(&[0xff, 0x13, 0x00, 0x02]);
        tx.shutdown();
        let more = drain_bits(&mut tx, 2000);
        assert!(more.len() > 48);
    }
}
