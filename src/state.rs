//! The T.31 session core.
//!
//! Three interlocking state machines live here, clocked off the 8kHz
//! sample stream and the DTE byte stream:
//!
//! * the modem-mode machine: which transmit/receive pair is wired up,
//!   including the dual-rail fast+V.21 listen used during reception;
//! * the DTE session machine: command, HDLC, stuffed-data and delivery
//!   modes, with DLE escape handling and flow control;
//! * (over in t38.rs) the timed-step machine pacing IFP packets.
//!
//! The session owns every bit of state; the AT interpreter and the T.38
//! packet transport are borrowed through traits for its lifetime. Entry
//! points run to completion and are never reentered, so there is no
//! locking anywhere.
//!
//! Protocol behavior follows ITU-T T.31 (the class 1 command set) and the
//! T.30 conventions it leans on, e.g. the 1s +-15% V.21 preamble and the
//! 0xFF/0x00 fill rules for non-ECM data.

use std::collections::VecDeque;

use anyhow::{bail, Result};
use log::{debug, warn};

use crate::dsp::{power_level_dbm0, PowerMeter, SilenceGen, ToneDesc, ToneGen};
use crate::fast::{FastKind, FastRx, FastTx};
use crate::fsk::{FskRx, FskTx};
use crate::hdlc::{HdlcRx, HdlcTx, RxEvent as HdlcRxEvent};
use crate::queue::RecordQueue;
use crate::t38::{DataType, Indicator, T38Core, T38Sink, TimedStep};
use crate::{
    ms_to_samples, AtLink, BitEvent, BitSource, CallEvent, ControlOp, ResponseCode, TxBit,
    TxStatus, DLE, ETX, SUB,
};

/// Size of the DTE-to-modem transmit data buffer.
pub const TX_BUF_LEN: usize = 4096;

/// Flow control thresholds on the transmit buffer. CTS is dropped when
/// the buffer fills past the high water mark, and raised again once the
/// consumer has drained past the low one.
const FLOW_OFF_LEVEL: usize = TX_BUF_LEN - 1024;
const FLOW_ON_LEVEL: usize = 1024;

/// Received data is batched towards the DTE in chunks about this size.
const DTE_CHUNK: usize = 250;

/// HDLC frames bigger than this cannot be valid T.30 control messages.
const HDLC_FRAME_MAX: usize = 256 - 2;

/// Without DTE data for this long in HDLC transmit, give up with ERROR.
const DTE_TIMEOUT_MS: u64 = 5000;

/// V.21 receiver signal cutoff, dBm0.
const V21_CUTOFF_DBM0: f64 = -39.09;

/// Silence detector threshold, dBm0.
const SILENCE_DBM0: f64 = -36.0;

/// Byte budget of the queue of received frames waiting for a DTE command
/// to claim them.
const RX_QUEUE_LEN: usize = 4096;

/// The logical modem behaviors the session switches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modem {
    /// 200ms of forced silence to push the last audio out.
    Flush,
    SilenceTx,
    SilenceRx,
    /// Called-station tone: 2100Hz after a 200ms pause.
    Ced,
    /// Calling tone, with a V.21 receiver running in parallel.
    Cng,
    /// Like Cng but answering silently.
    NoCng,
    V21Tx,
    V17Tx,
    V27terTx,
    V29Tx,
    V21Rx,
    V17Rx,
    V27terRx,
    V29Rx,
}

/// Where bytes from the DTE currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtRxMode {
    OnHookCommand,
    OffHookCommand,
    /// DLE-stuffed HDLC frames for transmission.
    Hdlc,
    /// DLE-stuffed non-ECM image data for transmission.
    Stuffed,
    /// We are delivering to the DTE; anything it sends aborts that.
    Delivery,
}

/// Direction of a class 1 operation, from the DTE's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// The three shapes of class 1 command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class1Operation {
    /// +FTS/+FRS: pace or await silence.
    Silence,
    /// +FTH/+FRH: HDLC framed data.
    Hdlc,
    /// +FTM/+FRM: raw modulated data.
    Modulation,
}

/// DLE escape processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DleState {
    Normal,
    EscapePending,
}

/// Active receive wiring. The Early variants run the fast demodulator
/// and the V.21 demodulator on every sample until one of them wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPath {
    Dummy,
    Silence,
    Cng,
    V21,
    EarlyV17,
    EarlyV27ter,
    EarlyV29,
    V17,
    V27ter,
    V29,
}

/// Active transmit wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxPath {
    Silence,
    Tone,
    V21,
    Fast,
}

// Queue-record result codes. One byte in front of each parked frame.
const REC_OK: u8 = 0;
const REC_CONNECT: u8 = 1;
const REC_ERROR: u8 = 2;
const REC_NO_CARRIER: u8 = 3;

fn byte_to_code(b: u8) -> ResponseCode {
    match b {
        REC_OK => ResponseCode::Ok,
        REC_CONNECT => ResponseCode::Connect,
        REC_ERROR => ResponseCode::Error,
        _ => ResponseCode::NoCarrier,
    }
}

/// The byte-to-bit pump feeding non-ECM transmit data to a fast modem.
///
/// Follows T.31/T.30 practice: before any real data has been sent the
/// fill byte is 0xFF, afterwards 0x00, and the end of data (after
/// DLE-ETX) shuts the modem down.
#[derive(Debug)]
pub(crate) struct NonEcmPump {
    buf: Vec<u8>,
    out: usize,
    bit_no: u8,
    current: u8,
    pub(crate) data_final: bool,
    started: bool,
    pub(crate) holding: bool,
    release_cts: bool,
}

impl NonEcmPump {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(TX_BUF_LEN),
            out: 0,
            bit_no: 0,
            current: 0xff,
            data_final: false,
            started: false,
            holding: false,
            release_cts: false,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.out = 0;
        self.bit_no = 0;
        self.current = 0xff;
        self.data_final = false;
        self.started = false;
    }

    /// Drop already-consumed bytes so the buffer can take new data.
    fn compact(&mut self) {
        if self.out > 0 {
            self.buf.drain(..self.out);
            self.out = 0;
        }
    }

    fn push(&mut self, b: u8) -> bool {
        if self.buf.len() >= TX_BUF_LEN {
            return false;
        }
        self.buf.push(b);
        true
    }

    fn level(&self) -> usize {
        self.buf.len()
    }

    fn next_byte(&mut self) -> Option<u8> {
        if self.out >= self.buf.len() {
            return None;
        }
        let b = self.buf[self.out];
        self.out += 1;
        self.started = true;
        if self.holding && self.out > FLOW_ON_LEVEL {
            // Buffer is draining; time to release flow control.
            self.holding = false;
            self.release_cts = true;
        }
        Some(b)
    }

    /// Byte-wise drain for the T.38 pump. A short return means the end
    /// of the image data has been reached.
    pub(crate) fn get_chunk(&mut self, out_buf: &mut [u8]) -> usize {
        for (i, slot) in out_buf.iter_mut().enumerate() {
            match self.next_byte() {
                Some(b) => *slot = b,
                None => {
                    if self.data_final {
                        self.data_final = false;
                        return i;
                    }
                    *slot = if self.started { 0x00 } else { 0xff };
                }
            }
        }
        out_buf.len()
    }
}

impl BitSource for NonEcmPump {
    fn get_bit(&mut self) -> TxBit {
        if self.bit_no == 0 {
            match self.next_byte() {
                Some(b) => self.current = b,
                None => {
                    if self.data_final {
                        self.data_final = false;
                        // The modem runs its shutdown; OK follows once it
                        // has gone quiet.
                        return TxBit::Done;
                    }
                    self.current = if self.started { 0x00 } else { 0xff };
                }
            }
            self.bit_no = 8;
        }
        self.bit_no -= 1;
        let bit = self.current & 1 != 0;
        self.current >>= 1;
        TxBit::Bit(bit)
    }
}

/// One T.31 fax modem session.
pub struct Session {
    pub(crate) link: Box<dyn AtLink>,

    // Modem selection.
    pub(crate) modem: Option<Modem>,
    pub(crate) bit_rate: u32,
    pub(crate) short_train: bool,

    // DTE session state.
    at_rx_mode: AtRxMode,
    pub(crate) transmit: bool,
    pub(crate) dte_is_waiting: bool,
    pub(crate) ok_is_pending: bool,
    pub(crate) rx_signal_present: bool,
    pub(crate) rx_trained: bool,
    rx_message_received: bool,
    dle: DleState,
    dte_buf: Vec<u8>,

    // Transmit plumbing.
    pub(crate) pump: NonEcmPump,
    hdlc_tx: HdlcTx,
    hdlc_tx_buf: Vec<u8>,
    pub(crate) hdlc_final: bool,
    pub(crate) hdlc_tx_frames: VecDeque<Vec<u8>>,
    /// Frame being chunked out by the T.38 pump, with its read cursor.
    pub(crate) t38_cur_frame: Option<(Vec<u8>, usize)>,

    // Receive plumbing.
    hdlc_rx: HdlcRx,
    pub(crate) hdlc_rx_buf: Vec<u8>,
    pub(crate) missing_data: bool,
    rx_bit_no: u8,
    rx_current: u8,
    pub(crate) rx_queue: RecordQueue,

    // Audio paths.
    rx_path: RxPath,
    tx_path: TxPath,
    next_tx_path: Option<TxPath>,
    v21_rx: FskRx,
    v21_tx: FskTx,
    fast_rx: FastRx,
    fast_tx: FastTx,
    tone_gen: ToneGen,
    silence_gen: SilenceGen,

    // Clocks, all in 8kHz samples.
    pub(crate) samples: u64,
    pub(crate) call_samples: u64,
    pub(crate) next_tx_samples: u64,
    pub(crate) timeout_rx_samples: u64,
    dte_data_timeout: u64,
    silence_heard: u64,
    silence_awaited: u64,
    rx_power: PowerMeter,
    last_sample: i16,
    silence_threshold: i64,

    // T.38.
    pub(crate) t38: Option<T38Core>,
    pub(crate) t38_mode: bool,
    pub(crate) timed_step: TimedStep,
    pub(crate) indicator_tx_count: u32,
    pub(crate) data_end_tx_count: u32,
    pub(crate) ms_per_tx_chunk: u64,
    pub(crate) octets_per_data_packet: usize,
    pub(crate) next_tx_indicator: Indicator,
    pub(crate) current_tx_data_type: DataType,
    pub(crate) trailer_bytes: i64,
    pub(crate) use_tep: bool,
    pub(crate) merge_tx_fields: bool,

    // Tunables normally owned by the AT interpreter's S registers.
    transmit_on_idle: bool,
    adaptive_receive: bool,
    answer_timeout_secs: u64,
    hangup_pending: bool,
}

impl Session {
    /// Create a session. `t38_sink` enables the T.38 side; audio-only
    /// sessions pass `None`.
    #[must_use]
    pub fn new(link: Box<dyn AtLink>, t38_sink: Option<Box<dyn T38Sink>>) -> Self {
        let mut s = Self {
            link,
            modem: None,
            bit_rate: 0,
            short_train: false,
            at_rx_mode: AtRxMode::OnHookCommand,
            transmit: true,
            dte_is_waiting: false,
            ok_is_pending: false,
            rx_signal_present: false,
            rx_trained: false,
            rx_message_received: false,
            dle: DleState::Normal,
            dte_buf: Vec::with_capacity(DTE_CHUNK + 8),
            pump: NonEcmPump::new(),
            hdlc_tx: HdlcTx::new(0),
            hdlc_tx_buf: Vec::with_capacity(HDLC_FRAME_MAX),
            hdlc_final: false,
            hdlc_tx_frames: VecDeque::new(),
            t38_cur_frame: None,
            hdlc_rx: HdlcRx::new(true, 5),
            hdlc_rx_buf: Vec::with_capacity(HDLC_FRAME_MAX),
            missing_data: false,
            rx_bit_no: 0,
            rx_current: 0,
            rx_queue: RecordQueue::new(RX_QUEUE_LEN),
            rx_path: RxPath::Dummy,
            tx_path: TxPath::Silence,
            next_tx_path: None,
            v21_rx: FskRx::new(V21_CUTOFF_DBM0),
            v21_tx: FskTx::new(),
            fast_rx: FastRx::new(FastKind::V17, 14400),
            fast_tx: FastTx::new(FastKind::V17, 14400),
            tone_gen: ToneGen::new(ToneDesc {
                freq_hz: 1100.0,
                level_dbm0: -11.0,
                on_ms: 500,
                off_ms: 3000,
                repeat: true,
            }),
            silence_gen: SilenceGen::new(),
            samples: 0,
            call_samples: 0,
            next_tx_samples: 0,
            timeout_rx_samples: 0,
            dte_data_timeout: 0,
            silence_heard: 0,
            silence_awaited: 0,
            rx_power: PowerMeter::new(4),
            last_sample: 0,
            silence_threshold: power_level_dbm0(SILENCE_DBM0),
            t38: t38_sink.map(T38Core::new),
            t38_mode: false,
            timed_step: TimedStep::None,
            indicator_tx_count: 0,
            data_end_tx_count: 0,
            ms_per_tx_chunk: 0,
            octets_per_data_packet: 1,
            next_tx_indicator: Indicator::NoSignal,
            current_tx_data_type: DataType::None,
            trailer_bytes: 0,
            use_tep: false,
            merge_tx_fields: false,
            transmit_on_idle: false,
            adaptive_receive: false,
            answer_timeout_secs: 60,
            hangup_pending: false,
        };
        s.set_t38_config(false);
        s
    }

    /// Which modem behavior is currently selected, if any.
    #[must_use]
    pub fn modem(&self) -> Option<Modem> {
        self.modem
    }

    #[must_use]
    pub fn at_rx_mode(&self) -> AtRxMode {
        self.at_rx_mode
    }

    /// Pad `tx()` output with zero samples up to the requested length.
    pub fn set_transmit_on_idle(&mut self, on: bool) {
        self.transmit_on_idle = on;
    }

    /// Assume the far end sends a TEP burst before training.
    pub fn set_tep_mode(&mut self, on: bool) {
        self.use_tep = on;
    }

    /// Route signals over T.38 instead of line audio.
    pub fn set_t38_mode(&mut self, on: bool) {
        self.t38_mode = on && self.t38.is_some();
    }

    /// +FAR: report an unexpected V.21 as +FRH:3/CONNECT rather than
    /// +FCERROR.
    pub fn set_adaptive_receive(&mut self, on: bool) {
        self.adaptive_receive = on;
    }

    /// S7: how long to listen for an answer before giving up.
    pub fn set_answer_timeout(&mut self, secs: u64) {
        self.answer_timeout_secs = secs;
    }

    /// Hang up once the current transmission has drained.
    pub fn set_hangup_pending(&mut self, on: bool) {
        self.hangup_pending = on;
    }

    /// Choose T.38 pacing. Without pacing (TCP transports) indicators go
    /// once, data ends once, and chunks stream back to back with merged
    /// fields; with pacing (UDP) everything is repeated and paced at
    /// 30ms.
    pub fn set_t38_config(&mut self, without_pacing: bool) {
        if without_pacing {
            self.indicator_tx_count = 0;
            self.data_end_tx_count = 1;
            self.ms_per_tx_chunk = 0;
            self.merge_tx_fields = true;
        } else {
            self.indicator_tx_count = 3;
            self.data_end_tx_count = 3;
            self.ms_per_tx_chunk = 30;
            self.merge_tx_fields = false;
        }
    }

    pub(crate) fn set_at_rx_mode(&mut self, mode: AtRxMode) {
        self.at_rx_mode = mode;
    }

    /// A call progress event from the embedder, for the AT interpreter.
    pub fn call_event(&mut self, event: CallEvent) {
        debug!("call event {event:?}");
        self.link.call_event(event);
    }

    /// A modem control operation from the AT interpreter.
    pub fn modem_control(&mut self, op: ControlOp) {
        match op {
            ControlOp::Answer | ControlOp::Call => self.call_samples = 0,
            ControlOp::OnHook => {
                if self.pump.holding {
                    self.pump.holding = false;
                    self.link.control(ControlOp::Cts(true));
                }
                if self.rx_signal_present {
                    self.dte_buf.push(DLE);
                    self.dte_buf.push(ETX);
                    self.flush_dte_buf();
                }
                self.restart_modem(Modem::SilenceTx);
            }
            ControlOp::Restart(m) => {
                self.restart_modem(m);
                return;
            }
            ControlOp::DteTimeout(ms) => {
                self.dte_data_timeout = match ms {
                    Some(ms) => self.call_samples + ms_to_samples(ms),
                    None => 0,
                };
                return;
            }
            _ => {}
        }
        self.link.control(op);
    }

    // ------------------------------------------------------------------
    // DTE byte stream in.
    // ------------------------------------------------------------------

    /// Ingest bytes from the DTE.
    pub fn at_rx(&mut self, data: &[u8]) {
        if self.dte_data_timeout != 0 {
            self.dte_data_timeout = self.call_samples + ms_to_samples(DTE_TIMEOUT_MS);
        }
        match self.at_rx_mode {
            AtRxMode::OnHookCommand | AtRxMode::OffHookCommand => self.link.interpret(data),
            AtRxMode::Delivery => {
                // Anything from the DTE aborts delivery and returns us to
                // command mode.
                if !data.is_empty() {
                    if self.rx_signal_present {
                        self.dte_buf.push(DLE);
                        self.dte_buf.push(ETX);
                        self.flush_dte_buf();
                    }
                    self.dte_buf.clear();
                    self.transmit = false;
                    self.modem = Some(Modem::SilenceTx);
                    self.rx_path = RxPath::Dummy;
                    self.dte_is_waiting = false;
                    self.silence_awaited = 0;
                    self.silence_heard = 0;
                    self.set_at_rx_mode(AtRxMode::OffHookCommand);
                    self.link.response(ResponseCode::Ok);
                }
            }
            AtRxMode::Hdlc => self.dle_unstuff_hdlc(data),
            AtRxMode::Stuffed => {
                self.pump.compact();
                self.dle_unstuff(data);
            }
        }
    }

    /// Unstuff DTE bytes into the HDLC frame buffer. DLE-ETX submits the
    /// frame; DLE-SUB expands to two DLEs; DLE-anything-else is literal.
    fn dle_unstuff_hdlc(&mut self, data: &[u8]) {
        for &b in data {
            match self.dle {
                DleState::EscapePending => {
                    self.dle = DleState::Normal;
                    match b {
                        ETX => {
                            // The poll/final bit of the control octet
                            // marks the last frame of the batch.
                            self.hdlc_final =
                                self.hdlc_tx_buf.get(1).is_some_and(|c| c & 0x10 != 0);
                            let frame = std::mem::take(&mut self.hdlc_tx_buf);
                            debug!(
                                "DTE frame, {} octets, final={}",
                                frame.len(),
                                self.hdlc_final
                            );
                            if self.t38_mode {
                                self.hdlc_tx_frames.push_back(frame);
                            } else {
                                self.hdlc_tx.frame(&frame);
                            }
                        }
                        SUB => {
                            self.hdlc_tx_push(DLE);
                            self.hdlc_tx_push(DLE);
                        }
                        other => self.hdlc_tx_push(other),
                    }
                }
                DleState::Normal => {
                    if b == DLE {
                        self.dle = DleState::EscapePending;
                    } else {
                        self.hdlc_tx_push(b);
                    }
                }
            }
        }
    }

    fn hdlc_tx_push(&mut self, b: u8) {
        if self.hdlc_tx_buf.len() >= HDLC_FRAME_MAX {
            warn!("HDLC transmit frame overflow, dropping byte");
            return;
        }
        self.hdlc_tx_buf.push(b);
    }

    /// Unstuff DTE bytes into the transmit data buffer. DLE-ETX ends the
    /// data and returns the DTE to command mode.
    fn dle_unstuff(&mut self, data: &[u8]) {
        for &b in data {
            match self.dle {
                DleState::EscapePending => {
                    self.dle = DleState::Normal;
                    if b == ETX {
                        self.pump.data_final = true;
                        self.set_at_rx_mode(AtRxMode::OffHookCommand);
                        return;
                    }
                    // Any other escaped byte is stored as itself, which
                    // covers the DLE-DLE case.
                    if !self.pump.push(b) {
                        warn!("no room in transmit buffer for new data");
                        return;
                    }
                }
                DleState::Normal => {
                    if b == DLE {
                        self.dle = DleState::EscapePending;
                    } else if !self.pump.push(b) {
                        warn!("no room in transmit buffer for new data");
                        return;
                    }
                }
            }
        }
        if !self.pump.holding && self.pump.level() > FLOW_OFF_LEVEL {
            self.pump.holding = true;
            self.link.control(ControlOp::Cts(false));
        }
    }

    // ------------------------------------------------------------------
    // Class 1 command dispatch.
    // ------------------------------------------------------------------

    /// Act on a class 1 command (+FTM/+FRM/+FTH/+FRH/+FTS/+FRS). `val`
    /// is the numeric parameter. Returns whether the AT interpreter
    /// should respond immediately; for every supported command the
    /// session responds itself when the line work completes.
    pub fn process_class1_cmd(
        &mut self,
        direction: Direction,
        operation: Class1Operation,
        val: u16,
    ) -> Result<bool> {
        let new_transmit = direction == Direction::Transmit;
        match operation {
            Class1Operation::Silence => {
                self.transmit = new_transmit;
                if new_transmit {
                    // A specified period of silence, to space
                    // transmissions.
                    self.restart_modem(Modem::SilenceTx);
                    self.silence_gen.alter(u64::from(val) * 80);
                    self.transmit = true;
                } else {
                    // Wait until the line has been quiet long enough.
                    self.rx_queue.flush();
                    self.silence_awaited = u64::from(val) * 80;
                    self.set_at_rx_mode(AtRxMode::Delivery);
                    self.restart_modem(Modem::SilenceRx);
                }
                debug!("silence {}ms", u32::from(val) * 10);
                Ok(false)
            }
            Class1Operation::Hdlc => {
                if val != 3 {
                    bail!("unsupported HDLC carrier {val}");
                }
                let new_modem = if new_transmit {
                    Modem::V21Tx
                } else {
                    Modem::V21Rx
                };
                self.short_train = false;
                self.bit_rate = 300;
                if self.modem != Some(new_modem) {
                    self.restart_modem(new_modem);
                }
                self.transmit = new_transmit;
                if new_transmit {
                    self.set_at_rx_mode(AtRxMode::Hdlc);
                    self.dte_data_timeout =
                        self.call_samples + ms_to_samples(DTE_TIMEOUT_MS);
                    self.link.response(ResponseCode::Connect);
                } else {
                    self.set_at_rx_mode(AtRxMode::Delivery);
                    self.rx_message_received = false;
                    self.deliver_queued_frames();
                }
                Ok(false)
            }
            Class1Operation::Modulation => {
                let (kind, rate, short) = match val {
                    24 => (FastKind::V27ter, 2400, false),
                    48 => (FastKind::V27ter, 4800, false),
                    72 => (FastKind::V29, 7200, false),
                    96 => (FastKind::V29, 9600, false),
                    73 => (FastKind::V17, 7200, false),
                    74 => (FastKind::V17, 7200, true),
                    97 => (FastKind::V17, 9600, false),
                    98 => (FastKind::V17, 9600, true),
                    121 => (FastKind::V17, 12000, false),
                    122 => (FastKind::V17, 12000, true),
                    145 => (FastKind::V17, 14400, false),
                    146 => (FastKind::V17, 14400, true),
                    _ => bail!("unsupported modulation {val}"),
                };
                let new_modem = match (kind, new_transmit) {
                    (FastKind::V27ter, true) => Modem::V27terTx,
                    (FastKind::V27ter, false) => Modem::V27terRx,
                    (FastKind::V29, true) => Modem::V29Tx,
                    (FastKind::V29, false) => Modem::V29Rx,
                    (FastKind::V17, true) => Modem::V17Tx,
                    (FastKind::V17, false) => Modem::V17Rx,
                };
                self.short_train = short;
                self.bit_rate = rate;
                debug!("short training = {short}, bit rate = {rate}");
                if new_transmit {
                    self.set_at_rx_mode(AtRxMode::Stuffed);
                    self.link.response(ResponseCode::Connect);
                } else {
                    self.set_at_rx_mode(AtRxMode::Delivery);
                }
                self.restart_modem(new_modem);
                Ok(false)
            }
        }
    }

    /// Drain any parked frames straight to a freshly arrived +FRH.
    fn deliver_queued_frames(&mut self) {
        loop {
            let Some(msg) = self.rx_queue.read() else {
                self.dte_is_waiting = true;
                return;
            };
            if msg.len() > 1 {
                if msg[0] == REC_OK {
                    self.link.response(ResponseCode::Connect);
                }
                for &b in &msg[1..] {
                    if b == DLE {
                        self.dte_buf.push(DLE);
                    }
                    self.dte_buf.push(b);
                }
                self.dte_buf.push(DLE);
                self.dte_buf.push(ETX);
                self.flush_dte_buf();
            }
            self.link.response(byte_to_code(msg[0]));
            if msg[0] != REC_CONNECT {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Modem-mode machine.
    // ------------------------------------------------------------------

    /// Switch the modem behavior, rewiring the transmit/receive paths.
    /// A no-op when the requested mode is already running.
    pub(crate) fn restart_modem(&mut self, new_modem: Modem) {
        if self.modem == Some(new_modem) {
            return;
        }
        debug!("restart modem {new_modem:?}");
        self.rx_queue.flush();
        self.modem = Some(new_modem);
        self.pump.data_final = false;
        self.rx_signal_present = false;
        self.rx_trained = false;
        self.rx_message_received = false;
        self.rx_path = RxPath::Dummy;
        match new_modem {
            Modem::Cng => {
                if self.t38_mode {
                    self.t38_start_cng();
                } else {
                    // CNG is special: we must receive V.21 HDLC while
                    // sending the tone. Everything else in fax runs one
                    // way at a time. 0.5s of 1100Hz + 3s of silence,
                    // repeating, until a valid preamble arrives.
                    self.tone_gen = ToneGen::new(ToneDesc {
                        freq_hz: 1100.0,
                        level_dbm0: -11.0,
                        on_ms: 500,
                        off_ms: 3000,
                        repeat: true,
                    });
                    self.rx_path = RxPath::Cng;
                    self.v21_rx_setup();
                    self.tx_path = TxPath::Tone;
                    self.next_tx_path = None;
                }
                self.transmit = true;
            }
            Modem::NoCng => {
                if !self.t38_mode {
                    self.rx_path = RxPath::Cng;
                    self.v21_rx_setup();
                    self.silence_gen.set(0);
                    self.tx_path = TxPath::Silence;
                }
                self.transmit = false;
            }
            Modem::Ced => {
                if self.t38_mode {
                    self.t38_start_ced();
                } else {
                    // 200ms of silence, then 2100Hz without phase
                    // reversals for 2.6s.
                    self.silence_gen.alter(ms_to_samples(200));
                    self.tone_gen = ToneGen::new(ToneDesc {
                        freq_hz: 2100.0,
                        level_dbm0: -11.0,
                        on_ms: 2600,
                        off_ms: 75,
                        repeat: false,
                    });
                    self.tx_path = TxPath::Silence;
                    self.next_tx_path = Some(TxPath::Tone);
                }
                self.transmit = true;
            }
            Modem::V21Tx => {
                if self.t38_mode {
                    self.t38_start_hdlc_tx();
                } else {
                    // The spec wants 1s +-15% of preamble, so 32 flags
                    // minimum.
                    self.hdlc_tx = HdlcTx::new(32);
                    self.v21_tx = FskTx::new();
                    self.tx_path = TxPath::V21;
                    self.next_tx_path = None;
                }
                self.hdlc_final = false;
                self.hdlc_tx_buf.clear();
                self.hdlc_tx_frames.clear();
                self.dle = DleState::Normal;
                self.transmit = true;
            }
            Modem::V21Rx => {
                if !self.t38_mode {
                    self.rx_path = RxPath::V21;
                    self.v21_rx_setup();
                }
            }
            Modem::V17Tx | Modem::V27terTx | Modem::V29Tx => {
                if self.t38_mode {
                    self.t38_start_non_ecm();
                } else {
                    let kind = match new_modem {
                        Modem::V17Tx => FastKind::V17,
                        Modem::V27terTx => FastKind::V27ter,
                        _ => FastKind::V29,
                    };
                    self.fast_tx = FastTx::new(kind, self.bit_rate);
                    self.fast_tx.restart(self.bit_rate, self.short_train);
                    self.tx_path = TxPath::Fast;
                    self.next_tx_path = None;
                }
                self.transmit = true;
            }
            Modem::V17Rx | Modem::V27terRx | Modem::V29Rx => {
                if !self.t38_mode {
                    let (kind, path) = match new_modem {
                        Modem::V17Rx => (FastKind::V17, RxPath::EarlyV17),
                        Modem::V27terRx => (FastKind::V27ter, RxPath::EarlyV27ter),
                        _ => (FastKind::V29, RxPath::EarlyV29),
                    };
                    self.rx_path = path;
                    self.fast_rx = FastRx::new(kind, self.bit_rate);
                    self.fast_rx.restart(self.bit_rate, self.short_train);
                    // Allow for +FCERROR/+FRH:3.
                    self.v21_rx_setup();
                }
                self.transmit = false;
            }
            Modem::SilenceTx => {
                if self.t38_mode {
                    self.t38_send_no_signal();
                } else {
                    self.silence_gen.set(0);
                    self.tx_path = TxPath::Silence;
                    self.next_tx_path = None;
                }
                self.transmit = false;
            }
            Modem::SilenceRx => {
                if !self.t38_mode {
                    self.rx_path = RxPath::Silence;
                    self.silence_gen.set(0);
                    self.tx_path = TxPath::Silence;
                    self.next_tx_path = None;
                }
                self.transmit = false;
            }
            Modem::Flush => {
                // Push the last audio out with 200ms of forced silence.
                if self.t38_mode {
                    self.t38_send_no_signal();
                } else {
                    self.modem = Some(Modem::SilenceTx);
                    self.silence_gen.alter(ms_to_samples(200));
                    self.tx_path = TxPath::Silence;
                    self.next_tx_path = None;
                    self.transmit = true;
                }
            }
        }
        self.pump.reset();
        self.rx_bit_no = 0;
        self.rx_current = 0;
    }

    /// Wire up the V.21/HDLC receiver.
    fn v21_rx_setup(&mut self) {
        self.hdlc_rx = HdlcRx::new(true, 5);
        self.ok_is_pending = false;
        self.hdlc_final = false;
        self.hdlc_tx_buf.clear();
        self.dle = DleState::Normal;
        self.v21_rx = FskRx::new(V21_CUTOFF_DBM0);
        self.transmit = true;
    }

    // ------------------------------------------------------------------
    // Line audio in.
    // ------------------------------------------------------------------

    /// Ingest a block of line audio.
    pub fn rx(&mut self, amp: &[i16]) {
        // Track received silence continuously. The longest wait is
        // +FRS=255, i.e. 2550ms, and some of the silence may predate the
        // command.
        for &s in amp {
            // Take out any DC before metering.
            let delta = (i32::from(s) - i32::from(self.last_sample))
                .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            self.last_sample = s;
            if self.rx_power.update(delta) > self.silence_threshold {
                self.silence_heard = 0;
            } else if self.silence_heard <= ms_to_samples(255 * 10) {
                self.silence_heard += 1;
            }
        }

        // Time is counted off incoming audio.
        self.call_samples += amp.len() as u64;

        // In HDLC transmit, five silent seconds from the DTE is an error
        // and drops us back to command mode.
        if self.dte_data_timeout != 0 && self.call_samples > self.dte_data_timeout {
            self.dte_data_timeout = 0;
            self.set_at_rx_mode(AtRxMode::OffHookCommand);
            self.link.response(ResponseCode::Error);
            self.restart_modem(Modem::SilenceTx);
        }

        if !self.transmit || self.modem == Some(Modem::Cng) {
            self.rx_dispatch(amp);
        }
    }

    fn rx_dispatch(&mut self, amp: &[i16]) {
        match self.rx_path {
            RxPath::Dummy => {}
            RxPath::Silence => self.silence_rx(),
            RxPath::Cng => self.cng_rx(amp),
            RxPath::V21 => {
                let mut events = Vec::new();
                self.v21_rx.rx(amp, &mut events);
                self.v21_events(&events);
            }
            RxPath::EarlyV17 | RxPath::EarlyV27ter | RxPath::EarlyV29 => {
                self.early_fast_rx(amp);
            }
            RxPath::V17 | RxPath::V27ter | RxPath::V29 => {
                let mut events = Vec::new();
                self.fast_rx.rx(amp, &mut events);
                self.non_ecm_events(&events);
            }
        }
    }

    /// Watch for the silence period requested by +FRS.
    fn silence_rx(&mut self) {
        if self.silence_awaited != 0 && self.silence_heard >= self.silence_awaited {
            self.link.response(ResponseCode::Ok);
            self.set_at_rx_mode(AtRxMode::OffHookCommand);
            self.silence_heard = 0;
            self.silence_awaited = 0;
        }
    }

    /// Receive V.21 while the calling tone plays, with the S7 no-answer
    /// timeout running.
    fn cng_rx(&mut self, amp: &[i16]) {
        if self.call_samples > ms_to_samples(self.answer_timeout_secs * 1000) {
            // S7 elapsed: no carrier found.
            self.link.response(ResponseCode::NoCarrier);
            self.restart_modem(Modem::SilenceTx);
            self.link.control(ControlOp::Hangup);
            self.set_at_rx_mode(AtRxMode::OnHookCommand);
        } else {
            let mut events = Vec::new();
            self.v21_rx.rx(amp, &mut events);
            self.v21_events(&events);
        }
    }

    /// Dual-rail reception: run the fast demodulator, and until it has
    /// trained, the V.21 demodulator too. First winner keeps the line.
    fn early_fast_rx(&mut self, amp: &[i16]) {
        let mut events = Vec::new();
        self.fast_rx.rx(amp, &mut events);
        self.non_ecm_events(&events);
        if self.rx_trained {
            let fast_only = match self.rx_path {
                RxPath::EarlyV17 => RxPath::V17,
                RxPath::EarlyV27ter => RxPath::V27ter,
                _ => RxPath::V29,
            };
            debug!("switching from {:?} + V.21 to {:?}", self.rx_path, fast_only);
            self.rx_path = fast_only;
            return;
        }
        let mut events = Vec::new();
        self.v21_rx.rx(amp, &mut events);
        self.v21_events(&events);
        if self.rx_message_received {
            // Something valid arrived on V.21 before the fast modem
            // trained; it must be V.21 we are receiving.
            debug!("switching from {:?} + V.21 to V.21", self.rx_path);
            self.rx_path = RxPath::V21;
        }
    }

    // ------------------------------------------------------------------
    // V.21/HDLC receive events.
    // ------------------------------------------------------------------

    fn v21_events(&mut self, events: &[BitEvent]) {
        for &ev in events {
            match ev {
                BitEvent::Bit(b) => {
                    let mut frames = Vec::new();
                    self.hdlc_rx.put_bit(b, &mut frames);
                    for f in frames {
                        match f {
                            HdlcRxEvent::FramingOk => self.hdlc_framing_ok(),
                            HdlcRxEvent::Frame { data, fcs_ok } => {
                                self.hdlc_accept_frame(&data, fcs_ok);
                            }
                        }
                    }
                }
                BitEvent::CarrierUp => self.hdlc_carrier_up(),
                BitEvent::CarrierDown => self.hdlc_carrier_down(),
                BitEvent::TrainingSucceeded => {
                    self.rx_signal_present = true;
                    self.rx_trained = true;
                }
                BitEvent::TrainingFailed => self.rx_trained = false,
            }
        }
    }

    pub(crate) fn hdlc_carrier_up(&mut self) {
        if matches!(
            self.modem,
            Some(Modem::Cng) | Some(Modem::NoCng) | Some(Modem::V21Rx)
        ) {
            self.rx_signal_present = true;
            self.rx_message_received = false;
        }
    }

    pub(crate) fn hdlc_carrier_down(&mut self) {
        if self.rx_message_received {
            if self.dte_is_waiting {
                if self.ok_is_pending {
                    self.link.response(ResponseCode::Ok);
                    self.ok_is_pending = false;
                } else {
                    self.link.response(ResponseCode::NoCarrier);
                }
                self.dte_is_waiting = false;
                self.set_at_rx_mode(AtRxMode::OffHookCommand);
            } else {
                self.rx_queue.write(&[REC_NO_CARRIER]);
            }
        }
        self.rx_signal_present = false;
        self.rx_trained = false;
    }

    /// A valid flag sequence has been seen on the V.21 receiver.
    pub(crate) fn hdlc_framing_ok(&mut self) {
        if matches!(self.modem, Some(Modem::Cng) | Some(Modem::NoCng)) {
            // Any valid HDLC stops the calling tone; drop to plain V.21
            // reception.
            self.modem = Some(Modem::V21Rx);
            self.rx_path = RxPath::V21;
            self.transmit = false;
        }
        if matches!(
            self.modem,
            Some(Modem::V17Rx) | Some(Modem::V27terRx) | Some(Modem::V29Rx)
        ) {
            // V.21 turned up while a fast carrier was expected. +FAR
            // picks between +FCERROR and the +FRH:3 adaptive fallback.
            if self.adaptive_receive {
                self.rx_signal_present = true;
                self.rx_message_received = true;
                self.modem = Some(Modem::V21Rx);
                self.rx_path = RxPath::V21;
                self.transmit = false;
                self.dte_is_waiting = true;
                self.link.response(ResponseCode::Frh3);
                self.link.response(ResponseCode::Connect);
            } else {
                self.modem = Some(Modem::SilenceTx);
                self.rx_path = RxPath::Dummy;
                self.set_at_rx_mode(AtRxMode::OffHookCommand);
                self.rx_message_received = false;
                self.link.response(ResponseCode::FcError);
            }
        } else if !self.rx_message_received {
            if self.dte_is_waiting {
                // Report CONNECT as early as possible so the DTE does
                // not time out.
                self.link.response(ResponseCode::Connect);
            } else {
                self.rx_queue.write(&[REC_CONNECT]);
            }
            self.rx_message_received = true;
        }
    }

    /// A complete HDLC frame has arrived, `data` carrying the payload
    /// plus its two FCS octets.
    pub(crate) fn hdlc_accept_frame(&mut self, data: &[u8], fcs_ok: bool) {
        if !self.rx_message_received {
            if self.dte_is_waiting {
                self.link.response(ResponseCode::Connect);
                self.rx_message_received = true;
            } else {
                self.rx_queue.write(&[REC_CONNECT]);
            }
        }
        // With OK pending for the final frame, anything further is
        // ignored.
        if self.ok_is_pending {
            self.set_at_rx_mode(AtRxMode::OffHookCommand);
            return;
        }
        if self.dte_is_waiting {
            for &b in data {
                if b == DLE {
                    self.dte_buf.push(DLE);
                }
                self.dte_buf.push(b);
            }
            self.dte_buf.push(DLE);
            self.dte_buf.push(ETX);
            self.flush_dte_buf();
            if data.len() > 1 && data[1] == 0x13 && fcs_ok {
                // The final frame of the call (DCN). Hold the OK until
                // the carrier actually drops, to avoid redetecting it.
                self.ok_is_pending = true;
            } else {
                self.link.response(if fcs_ok {
                    ResponseCode::Ok
                } else {
                    ResponseCode::Error
                });
                self.dte_is_waiting = false;
                self.rx_message_received = false;
            }
        } else {
            let mut rec = Vec::with_capacity(data.len() + 1);
            rec.push(if fcs_ok { REC_OK } else { REC_ERROR });
            rec.extend_from_slice(data);
            self.rx_queue.write(&rec);
        }
        self.set_at_rx_mode(AtRxMode::OffHookCommand);
    }

    // ------------------------------------------------------------------
    // Non-ECM receive events.
    // ------------------------------------------------------------------

    pub(crate) fn non_ecm_events(&mut self, events: &[BitEvent]) {
        for &ev in events {
            match ev {
                BitEvent::TrainingFailed => self.rx_trained = false,
                BitEvent::TrainingSucceeded => {
                    self.link.response(ResponseCode::Connect);
                    self.rx_signal_present = true;
                    self.rx_trained = true;
                }
                BitEvent::CarrierUp => {}
                BitEvent::CarrierDown => self.non_ecm_carrier_down(),
                BitEvent::Bit(b) => {
                    self.rx_current = (self.rx_current >> 1) | (u8::from(b) << 7);
                    self.rx_bit_no += 1;
                    if self.rx_bit_no >= 8 {
                        let byte = self.rx_current;
                        self.non_ecm_put_byte(byte);
                        self.rx_bit_no = 0;
                        self.rx_current = 0;
                    }
                }
            }
        }
    }

    pub(crate) fn non_ecm_put_byte(&mut self, byte: u8) {
        if byte == DLE {
            self.dte_buf.push(DLE);
        }
        self.dte_buf.push(byte);
        if self.dte_buf.len() >= DTE_CHUNK {
            self.flush_dte_buf();
        }
    }

    pub(crate) fn non_ecm_carrier_down(&mut self) {
        if self.rx_signal_present {
            self.dte_buf.push(DLE);
            self.dte_buf.push(ETX);
            self.flush_dte_buf();
            self.link.response(ResponseCode::NoCarrier);
            self.set_at_rx_mode(AtRxMode::OffHookCommand);
        }
        self.rx_signal_present = false;
        self.rx_trained = false;
    }

    pub(crate) fn flush_dte_buf(&mut self) {
        if !self.dte_buf.is_empty() {
            let buf = std::mem::take(&mut self.dte_buf);
            self.link.send(&buf);
            self.dte_buf = buf;
            self.dte_buf.clear();
        }
    }

    // ------------------------------------------------------------------
    // Line audio out.
    // ------------------------------------------------------------------

    /// Produce a block of line audio. Returns how many samples were
    /// written; with transmit-on-idle set, the tail is zero padded and
    /// the full length returned.
    pub fn tx(&mut self, amp: &mut [i16]) -> usize {
        let max_len = amp.len();
        let mut len = 0;
        if self.transmit {
            len = self.tx_path_run(amp);
            if len < max_len {
                // Allow for one change of transmit path within a block.
                self.set_next_tx_path();
                len += self.tx_path_run(&mut amp[len..]);
                if len < max_len {
                    self.tx_complete();
                }
            }
        }
        if self.transmit_on_idle {
            amp[len..].fill(0);
            return max_len;
        }
        len
    }

    fn tx_path_run(&mut self, amp: &mut [i16]) -> usize {
        let mut len = 0;
        while len < amp.len() {
            let (n, status) = match self.tx_path {
                TxPath::Silence => {
                    let n = self.silence_gen.tx(&mut amp[len..]);
                    let status = if len + n == amp.len() {
                        TxStatus::Filled
                    } else {
                        TxStatus::Done
                    };
                    (n, status)
                }
                TxPath::Tone => {
                    let n = self.tone_gen.tx(&mut amp[len..]);
                    let status = if len + n == amp.len() {
                        TxStatus::Filled
                    } else {
                        TxStatus::Done
                    };
                    (n, status)
                }
                TxPath::V21 => self.v21_tx.tx(&mut amp[len..], &mut self.hdlc_tx),
                TxPath::Fast => self.fast_tx.tx(&mut amp[len..], &mut self.pump),
            };
            len += n;
            if self.pump.release_cts {
                self.pump.release_cts = false;
                self.link.control(ControlOp::Cts(true));
            }
            match status {
                TxStatus::Underflow => {
                    self.on_hdlc_underflow();
                    continue;
                }
                TxStatus::Filled => break,
                TxStatus::Done => return len,
            }
        }
        len
    }

    /// The HDLC framer ran out of frames mid-transmission.
    fn on_hdlc_underflow(&mut self) {
        if self.hdlc_final {
            self.hdlc_final = false;
            // Orderly shutdown: closing flags, then the modem ends.
            self.hdlc_tx.shutdown();
        } else {
            // Solicit the next frame from the DTE.
            self.link.response(ResponseCode::Connect);
        }
    }

    fn set_next_tx_path(&mut self) {
        if let Some(p) = self.next_tx_path.take() {
            self.tx_path = p;
        } else {
            self.silence_gen.set(0);
            self.tx_path = TxPath::Silence;
        }
    }

    /// Both transmit paths have drained: act on what just finished.
    fn tx_complete(&mut self) {
        match self.modem {
            Some(Modem::SilenceTx) => {
                self.modem = None;
                self.link.response(ResponseCode::Ok);
                if self.hangup_pending {
                    self.hangup_pending = false;
                    self.link.control(ControlOp::Hangup);
                    self.set_at_rx_mode(AtRxMode::OnHookCommand);
                } else {
                    self.set_at_rx_mode(AtRxMode::OffHookCommand);
                }
            }
            Some(Modem::Ced) => {
                // Straight on to V.21/HDLC transmit.
                self.modem = None;
                self.restart_modem(Modem::V21Tx);
                self.set_at_rx_mode(AtRxMode::Hdlc);
            }
            Some(Modem::V21Tx) | Some(Modem::V17Tx) | Some(Modem::V27terTx)
            | Some(Modem::V29Tx) => {
                self.modem = None;
                self.link.response(ResponseCode::Ok);
                self.set_at_rx_mode(AtRxMode::OffHookCommand);
                self.restart_modem(Modem::SilenceTx);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Captures everything the session tells the DTE side.
    #[derive(Debug, Default)]
    pub(crate) struct LinkLog {
        pub(crate) sent: Vec<u8>,
        pub(crate) codes: Vec<ResponseCode>,
        pub(crate) controls: Vec<ControlOp>,
        pub(crate) interpreted: Vec<u8>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeLink(pub(crate) Rc<RefCell<LinkLog>>);

    impl AtLink for FakeLink {
        fn send(&mut self, data: &[u8]) {
            self.0.borrow_mut().sent.extend_from_slice(data);
        }
        fn response(&mut self, code: ResponseCode) {
            self.0.borrow_mut().codes.push(code);
        }
        fn interpret(&mut self, data: &[u8]) {
            self.0.borrow_mut().interpreted.extend_from_slice(data);
        }
        fn control(&mut self, op: ControlOp) {
            self.0.borrow_mut().controls.push(op);
        }
        fn call_event(&mut self, _event: CallEvent) {}
    }

    fn session() -> (Session, FakeLink) {
        let link = FakeLink::default();
        (Session::new(Box::new(link.clone()), None), link)
    }

    /// DLE-stuff a payload the way a DTE would, ending with DLE-ETX.
    fn dle_stuff(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in payload {
            if b == DLE {
                out.push(DLE);
            }
            out.push(b);
        }
        out.push(DLE);
        out.push(ETX);
        out
    }

    #[test]
    fn restart_is_idempotent() {
        let (mut s, _link) = session();
        s.restart_modem(Modem::SilenceTx);
        assert_eq!(s.modem(), Some(Modem::SilenceTx));
        s.rx_queue.write(&[REC_CONNECT]);
        // Same mode again: nothing changes, queue survives.
        s.restart_modem(Modem::SilenceTx);
        assert!(!s.rx_queue.is_empty());
        // A different mode flushes it.
        s.restart_modem(Modem::V21Rx);
        assert!(s.rx_queue.is_empty());
        assert_eq!(s.modem(), Some(Modem::V21Rx));
    }

    #[test]
    fn stuffed_data_reaches_pump_unstuffed() {
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Transmit, Class1Operation::Modulation, 96)
            .unwrap();
        assert_eq!(s.at_rx_mode(), AtRxMode::Stuffed);
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::Connect]);

        let payload = [0x00, 0x10, 0xff, 0x10, 0x10, 0x42];
        s.at_rx(&dle_stuff(&payload));
        assert_eq!(s.at_rx_mode(), AtRxMode::OffHookCommand);
        assert!(s.pump.data_final);
        assert_eq!(&s.pump.buf, &payload);
    }

    #[test]
    fn unknown_class1_val_is_an_error() {
        let (mut s, _link) = session();
        assert!(s
            .process_class1_cmd(Direction::Transmit, Class1Operation::Modulation, 47)
            .is_err());
        assert!(s
            .process_class1_cmd(Direction::Transmit, Class1Operation::Hdlc, 4)
            .is_err());
    }

    #[test]
    fn fts_produces_timed_silence_then_ok() {
        // AT+FTS=8: 800ms of silence, then OK on exhaustion.
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Transmit, Class1Operation::Silence, 80)
            .unwrap();
        assert_eq!(s.modem(), Some(Modem::SilenceTx));
        let mut audio = [999i16; 160];
        let mut total = 0;
        for _ in 0..45 {
            let n = s.tx(&mut audio);
            assert!(audio[..n].iter().all(|&x| x == 0));
            total += n;
            if n < audio.len() {
                break;
            }
        }
        assert_eq!(total, 80 * 80);
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::Ok]);
        assert_eq!(s.at_rx_mode(), AtRxMode::OffHookCommand);
    }

    #[test]
    fn frs_waits_for_silence() {
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Receive, Class1Operation::Silence, 10)
            .unwrap();
        assert_eq!(s.at_rx_mode(), AtRxMode::Delivery);
        // 100ms of noise, then plenty of silence.
        let noise: Vec<i16> = (0..800)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();
        s.rx(&noise);
        assert!(link.0.borrow().codes.is_empty());
        for _ in 0..10 {
            s.rx(&[0i16; 160]);
        }
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::Ok]);
        assert_eq!(s.at_rx_mode(), AtRxMode::OffHookCommand);
    }

    #[test]
    fn delivery_abort_returns_ok() {
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        assert_eq!(s.at_rx_mode(), AtRxMode::Delivery);
        assert!(s.dte_is_waiting);
        // DTE sends a byte: delivery aborts, OK comes back.
        s.at_rx(&[b'A']);
        assert_eq!(s.at_rx_mode(), AtRxMode::OffHookCommand);
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::Ok]);
    }

    #[test]
    fn frh_delivers_queued_frame() {
        let (mut s, link) = session();
        s.restart_modem(Modem::V21Rx);
        // A frame arrives before the DTE asks for it: it gets parked.
        let frame = [0xff, 0x03, 0x2f, 0x11, 0xaa, 0xbb];
        s.hdlc_framing_ok();
        s.hdlc_accept_frame(&frame, true);
        assert!(link.0.borrow().codes.is_empty());
        assert!(!s.rx_queue.is_empty());

        // +FRH=3 drains it: the carrier-up CONNECT, the frame's own
        // CONNECT, stuffed bytes, DLE-ETX, then OK.
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        let log = link.0.borrow();
        assert_eq!(
            log.codes,
            vec![
                ResponseCode::Connect,
                ResponseCode::Connect,
                ResponseCode::Ok
            ]
        );
        let mut want = frame.to_vec();
        want.push(DLE);
        want.push(ETX);
        assert_eq!(log.sent, want);
    }

    #[test]
    fn dcn_frame_defers_ok_until_carrier_down() {
        let (mut s, link) = session();
        s.restart_modem(Modem::V21Rx);
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        assert!(s.dte_is_waiting);

        // Final frame of the call: control octet 0x13.
        let dcn = [0xff, 0x13, 0xfb, 0x00, 0x00];
        s.hdlc_framing_ok();
        s.hdlc_accept_frame(&dcn, true);
        {
            let log = link.0.borrow();
            assert_eq!(log.codes, vec![ResponseCode::Connect]);
        }
        assert!(s.ok_is_pending);

        // OK only arrives with carrier down.
        s.hdlc_carrier_down();
        assert!(!s.ok_is_pending);
        assert_eq!(
            link.0.borrow().codes,
            vec![ResponseCode::Connect, ResponseCode::Ok]
        );
    }

    #[test]
    fn frame_bytes_are_dle_stuffed_to_dte() {
        let (mut s, link) = session();
        s.restart_modem(Modem::V21Rx);
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        let frame = [0xff, 0x03, DLE, 0x42, DLE];
        s.hdlc_framing_ok();
        s.hdlc_accept_frame(&frame, true);
        let log = link.0.borrow();
        assert_eq!(
            log.sent,
            vec![0xff, 0x03, DLE, DLE, 0x42, DLE, DLE, DLE, ETX]
        );
        assert_eq!(log.codes, vec![ResponseCode::Connect, ResponseCode::Ok]);
    }

    #[test]
    fn bad_fcs_reports_error() {
        let (mut s, link) = session();
        s.restart_modem(Modem::V21Rx);
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        s.hdlc_framing_ok();
        s.hdlc_accept_frame(&[0xff, 0x03, 0x2f, 0x00, 0x00], false);
        assert_eq!(
            link.0.borrow().codes,
            vec![ResponseCode::Connect, ResponseCode::Error]
        );
    }

    #[test]
    fn flow_control_asserts_and_releases() {
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Transmit, Class1Operation::Modulation, 96)
            .unwrap();
        // Stuff enough data to cross the high water mark.
        let chunk = vec![0x55u8; 512];
        for _ in 0..7 {
            s.at_rx(&chunk);
        }
        assert!(s.pump.holding);
        assert!(link.0.borrow().controls.contains(&ControlOp::Cts(false)));
        // Drain past the low water mark via the bit pump.
        for _ in 0..(FLOW_ON_LEVEL + 2) * 8 {
            let _ = s.pump.get_bit();
        }
        assert!(!s.pump.holding);
        assert!(s.pump.release_cts);
    }

    #[test]
    fn dte_timeout_in_hdlc_mode() {
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Transmit, Class1Operation::Hdlc, 3)
            .unwrap();
        assert_eq!(s.at_rx_mode(), AtRxMode::Hdlc);
        // More than five seconds of line audio with no DTE data.
        let silence = [0i16; 800];
        for _ in 0..55 {
            s.rx(&silence);
        }
        assert!(link.0.borrow().codes.contains(&ResponseCode::Error));
        assert_eq!(s.at_rx_mode(), AtRxMode::OffHookCommand);
        assert_eq!(s.modem(), Some(Modem::SilenceTx));
    }

    #[test]
    fn cng_answer_timeout_hangs_up() {
        let (mut s, link) = session();
        s.set_answer_timeout(1);
        s.restart_modem(Modem::Cng);
        let silence = [0i16; 800];
        for _ in 0..11 {
            s.rx(&silence);
        }
        let log = link.0.borrow();
        assert!(log.codes.contains(&ResponseCode::NoCarrier));
        assert!(log.controls.contains(&ControlOp::Hangup));
        drop(log);
        assert_eq!(s.at_rx_mode(), AtRxMode::OnHookCommand);
    }

    #[test]
    fn non_ecm_rx_terminates_on_carrier_down() {
        let (mut s, link) = session();
        s.bit_rate = 9600;
        s.restart_modem(Modem::V29Rx);
        s.non_ecm_events(&[BitEvent::TrainingSucceeded]);
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::Connect]);
        // A DLE-valued byte gets doubled on the way to the DTE.
        let mut bits = Vec::new();
        for byte in [0x10u8, 0x5a] {
            for i in 0..8 {
                bits.push(BitEvent::Bit(byte & (1 << i) != 0));
            }
        }
        s.non_ecm_events(&bits);
        s.non_ecm_events(&[BitEvent::CarrierDown]);
        let log = link.0.borrow();
        assert_eq!(log.sent, vec![DLE, DLE, 0x5a, DLE, ETX]);
        assert_eq!(
            log.codes,
            vec![ResponseCode::Connect, ResponseCode::NoCarrier]
        );
    }

    #[test]
    fn adaptive_receive_switches_to_v21() {
        let (mut s, link) = session();
        s.set_adaptive_receive(true);
        s.bit_rate = 9600;
        s.restart_modem(Modem::V29Rx);
        s.hdlc_framing_ok();
        assert_eq!(s.modem(), Some(Modem::V21Rx));
        assert!(s.dte_is_waiting);
        assert_eq!(
            link.0.borrow().codes,
            vec![ResponseCode::Frh3, ResponseCode::Connect]
        );
    }

    #[test]
    fn non_adaptive_receive_reports_fcerror() {
        let (mut s, link) = session();
        s.bit_rate = 9600;
        s.restart_modem(Modem::V29Rx);
        s.hdlc_framing_ok();
        assert_eq!(s.modem(), Some(Modem::SilenceTx));
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::FcError]);
    }

    #[test]
    fn onhook_releases_flow_control() {
        let (mut s, link) = session();
        s.pump.holding = true;
        s.modem_control(ControlOp::OnHook);
        let log = link.0.borrow();
        assert!(log.controls.contains(&ControlOp::Cts(true)));
        assert!(log.controls.contains(&ControlOp::OnHook));
        drop(log);
        assert_eq!(s.modem(), Some(Modem::SilenceTx));
    }

    #[test]
    fn command_mode_bytes_reach_interpreter() {
        let (mut s, link) = session();
        s.at_rx(b"AT+FCLASS=1\r");
        assert_eq!(link.0.borrow().interpreted, b"AT+FCLASS=1\r");
    }

    #[test]
    fn flush_produces_forced_silence_then_ok() {
        let (mut s, link) = session();
        s.modem_control(ControlOp::Restart(Modem::Flush));
        assert_eq!(s.modem(), Some(Modem::SilenceTx));
        let mut audio = [1i16; 160];
        let mut total = 0;
        loop {
            let n = s.tx(&mut audio);
            total += n;
            if n < audio.len() {
                break;
            }
        }
        assert_eq!(total, 1600);
        assert_eq!(link.0.borrow().codes, vec![ResponseCode::Ok]);
    }

    #[test]
    fn transmit_on_idle_pads_with_zeros() {
        let (mut s, _link) = session();
        s.set_transmit_on_idle(true);
        let mut audio = [42i16; 160];
        assert_eq!(s.tx(&mut audio), 160);
        assert!(audio.iter().all(|&x| x == 0));
    }

    // ---- Whole-path tests over generated line audio. ----

    /// Modulate HDLC frames onto V.21, the way a far-end fax would.
    fn v21_frame_audio(frames: &[&[u8]], flags: usize) -> Vec<i16> {
        let mut hdlc = HdlcTx::new(flags);
        for f in frames {
            hdlc.frame(f);
        }
        hdlc.shutdown();
        let mut fsk = FskTx::new();
        let mut audio = vec![0i16; 8000 * 20];
        let mut len = 0;
        while len < audio.len() {
            let (n, status) = fsk.tx(&mut audio[len..], &mut hdlc);
            len += n;
            if status == TxStatus::Done {
                break;
            }
        }
        audio.truncate(len);
        audio
    }

    #[test]
    fn frh_receives_v21_frame_from_line() {
        let (mut s, link) = session();
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        let frame = [0xff, 0x03, 0x2f, 0x11, 0x22, 0x33];
        let audio = v21_frame_audio(&[&frame], 32);
        for chunk in audio.chunks(160) {
            s.rx(chunk);
        }
        for _ in 0..10 {
            s.rx(&[0i16; 160]);
        }
        let log = link.0.borrow();
        assert_eq!(log.codes.first(), Some(&ResponseCode::Connect));
        assert!(log.codes.contains(&ResponseCode::Ok));
        // The DTE sees the frame, its FCS, and a DLE-ETX terminator.
        assert_eq!(&log.sent[..frame.len()], &frame);
        assert!(log.sent.ends_with(&[DLE, ETX]));
    }

    #[test]
    fn cng_drops_to_v21_on_preamble() {
        let (mut s, link) = session();
        s.modem_control(ControlOp::Restart(Modem::Cng));
        // The calling tone is on the line.
        let mut out = [0i16; 160];
        assert_eq!(s.tx(&mut out), out.len());
        assert!(out.iter().any(|&x| x != 0));
        // The far end answers with a V.21 preamble and a frame.
        let frame = [0xff, 0x03, 0x2f, 0x42, 0x55];
        let audio = v21_frame_audio(&[&frame], 32);
        for chunk in audio.chunks(160) {
            s.rx(chunk);
        }
        // The preamble killed the tone.
        assert_eq!(s.modem(), Some(Modem::V21Rx));
        // The frame was parked; +FRH=3 hands it over.
        s.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)
            .unwrap();
        let log = link.0.borrow();
        assert_eq!(log.codes.last(), Some(&ResponseCode::Ok));
        assert_eq!(&log.sent[..frame.len()], &frame);
    }

    #[test]
    fn ftm_transmit_to_frm_receive() {
        // One session transmits V.29 9600 image data, another receives
        // it off the same audio.
        let (mut a, la) = session();
        let (mut b, lb) = session();
        a.process_class1_cmd(Direction::Transmit, Class1Operation::Modulation, 96)
            .unwrap();
        b.process_class1_cmd(Direction::Receive, Class1Operation::Modulation, 96)
            .unwrap();
        let image: Vec<u8> = (0u16..120).map(|i| (i * 31 + 7) as u8).collect();
        a.at_rx(&dle_stuff(&image));

        let mut buf = [0i16; 160];
        for _ in 0..3000 {
            let n = a.tx(&mut buf);
            buf[n..].fill(0);
            b.rx(&buf);
            if la.0.borrow().codes.contains(&ResponseCode::Ok) {
                break;
            }
        }
        for _ in 0..20 {
            b.rx(&[0i16; 160]);
        }

        assert_eq!(
            la.0.borrow().codes,
            vec![ResponseCode::Connect, ResponseCode::Ok]
        );
        let logb = lb.0.borrow();
        assert_eq!(logb.codes.first(), Some(&ResponseCode::Connect));
        assert_eq!(logb.codes.last(), Some(&ResponseCode::NoCarrier));
        // Unstuff what B's DTE saw, up to the DLE-ETX.
        let mut unstuffed = Vec::new();
        let mut i = 0;
        while i + 1 < logb.sent.len() {
            if logb.sent[i] == DLE {
                if logb.sent[i + 1] == ETX {
                    break;
                }
                unstuffed.push(logb.sent[i + 1]);
                i += 2;
            } else {
                unstuffed.push(logb.sent[i]);
                i += 1;
            }
        }
        assert!(unstuffed.len() >= image.len());
        assert_eq!(&unstuffed[..image.len()], &image[..]);
    }

    #[test]
    fn v21_wins_dual_rail_with_adaptive_receive() {
        let (mut s, link) = session();
        s.set_adaptive_receive(true);
        s.process_class1_cmd(Direction::Receive, Class1Operation::Modulation, 96)
            .unwrap();
        // The far end ignores our fast carrier hopes and sends V.21.
        let frame = [0xff, 0x03, 0x2f, 0x99];
        let audio = v21_frame_audio(&[&frame], 32);
        for chunk in audio.chunks(160) {
            s.rx(chunk);
        }
        {
            let log = link.0.borrow();
            assert_eq!(
                &log.codes[..2],
                &[ResponseCode::Frh3, ResponseCode::Connect]
            );
            assert!(log.codes.contains(&ResponseCode::Ok));
            assert_eq!(&log.sent[..frame.len()], &frame);
        }
        assert_eq!(s.modem(), Some(Modem::V21Rx));
    }
}
