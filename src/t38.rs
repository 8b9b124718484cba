//! The T.38 fax relay side of the session.
//!
//! In T.38 mode the audio paths are bypassed. Outbound signals become
//! sequences of IFP packets, paced by a timed-step machine driven from
//! [`Session::t38_send_timeout`]: an indicator announcing the carrier, a
//! pause standing in for modem training, data fields, an end-of-signal
//! field, and a closing no-signal indicator. Inbound packets arrive
//! through [`Session::t38_rx_indicator`] and friends, and feed the same
//! DTE-facing delivery path the audio demodulators use.
//!
//! The packetization below the IFP level (UDPTL, RTP, TPKT) is the
//! transport's business, reached through the [`T38Sink`] trait.

use log::{debug, warn};

use crate::state::{AtRxMode, Modem, Session};
use crate::{bit_reverse, hdlc::compute_fcs, ms_to_samples, ResponseCode};

/// Backstop if reception of packets stops in the middle of a burst.
const MID_RX_TIMEOUT_MS: u64 = 15_000;

/// Longest data chunk when streaming without pacing.
const MAX_OCTETS_PER_UNPACED_CHUNK: usize = 300;

/// T.38 indicator types (the subset a Class 1 modem deals in).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    NoSignal,
    Cng,
    Ced,
    V21Preamble,
    V27ter2400Training,
    V27ter4800Training,
    V29_7200Training,
    V29_9600Training,
    V17_7200ShortTraining,
    V17_7200LongTraining,
    V17_9600ShortTraining,
    V17_9600LongTraining,
    V17_12000ShortTraining,
    V17_12000LongTraining,
    V17_14400ShortTraining,
    V17_14400LongTraining,
}

impl Indicator {
    /// Nominal training time in milliseconds for this indicator, with or
    /// without a TEP burst, and with or without HDLC preamble flags. The
    /// V.21 preamble is 1s +-15%; the fast modems are 200ms + training.
    #[must_use]
    pub fn training_time_ms(self, use_tep: bool, with_flags: bool) -> u64 {
        // (without_tep, with_tep, without_tep_with_flags, with_tep_with_flags)
        let t = match self {
            Indicator::NoSignal | Indicator::Cng | Indicator::Ced => (0, 0, 0, 0),
            Indicator::V21Preamble => (0, 0, 1000, 1000),
            Indicator::V27ter2400Training => (943, 1158, 1143, 1158),
            Indicator::V27ter4800Training => (708, 923, 908, 1123),
            Indicator::V29_7200Training | Indicator::V29_9600Training => (234, 454, 434, 654),
            Indicator::V17_7200ShortTraining
            | Indicator::V17_9600ShortTraining
            | Indicator::V17_14400ShortTraining => (142, 367, 342, 567),
            Indicator::V17_12000ShortTraining => (142, 367, 342, 367),
            Indicator::V17_7200LongTraining
            | Indicator::V17_9600LongTraining
            | Indicator::V17_12000LongTraining
            | Indicator::V17_14400LongTraining => (1393, 1618, 1593, 1818),
        };
        match (use_tep, with_flags) {
            (false, false) => t.0,
            (true, false) => t.1,
            (false, true) => t.2,
            (true, true) => t.3,
        }
    }
}

/// Data carrier a data field rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    None,
    V21,
    V27ter2400,
    V27ter4800,
    V29_7200,
    V29_9600,
    V17_7200,
    V17_9600,
    V17_12000,
    V17_14400,
}

/// IFP data field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    HdlcData,
    HdlcSigEnd,
    HdlcFcsOk,
    HdlcFcsBad,
    HdlcFcsOkSigEnd,
    HdlcFcsBadSigEnd,
    T4NonEcmData,
    T4NonEcmSigEnd,
}

impl FieldType {
    fn is_sig_end(self) -> bool {
        matches!(
            self,
            FieldType::HdlcSigEnd
                | FieldType::HdlcFcsOkSigEnd
                | FieldType::HdlcFcsBadSigEnd
                | FieldType::T4NonEcmSigEnd
        )
    }
}

/// One field of an IFP data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub field_type: FieldType,
    pub data: Vec<u8>,
}

/// One IFP packet, in structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfpPacket {
    Indicator(Indicator),
    Data {
        data_type: DataType,
        fields: Vec<DataField>,
    },
}

/// The borrowed packet transport. `count` is the requested transmit
/// redundancy; 0 leaves it to the transport's default.
pub trait T38Sink {
    fn send_packet(&mut self, seq_no: u16, packet: &IfpPacket, count: u32);
}

/// The thin t38-core shim: sequence numbers and duplicate tracking on
/// top of the packet sink.
pub struct T38Core {
    sink: Box<dyn T38Sink>,
    tx_seq_no: u16,
    current_tx_indicator: Option<Indicator>,
    current_rx_indicator: Option<Indicator>,
    current_rx_field: Option<(DataType, FieldType)>,
}

impl T38Core {
    #[must_use]
    pub fn new(sink: Box<dyn T38Sink>) -> Self {
        Self {
            sink,
            tx_seq_no: 0,
            current_tx_indicator: None,
            current_rx_indicator: None,
            current_rx_field: None,
        }
    }

    #[must_use]
    pub fn current_tx_indicator(&self) -> Option<Indicator> {
        self.current_tx_indicator
    }

    pub fn send_indicator(&mut self, indicator: Indicator, count: u32) {
        let pkt = IfpPacket::Indicator(indicator);
        self.sink.send_packet(self.tx_seq_no, &pkt, count);
        self.tx_seq_no = self.tx_seq_no.wrapping_add(1);
        self.current_tx_indicator = Some(indicator);
    }

    pub fn send_data(
        &mut self,
        data_type: DataType,
        field_type: FieldType,
        data: &[u8],
        count: u32,
    ) {
        self.send_data_multi(
            data_type,
            vec![DataField {
                field_type,
                data: data.to_vec(),
            }],
            count,
        );
    }

    pub fn send_data_multi(&mut self, data_type: DataType, fields: Vec<DataField>, count: u32) {
        let pkt = IfpPacket::Data { data_type, fields };
        self.sink.send_packet(self.tx_seq_no, &pkt, count);
        self.tx_seq_no = self.tx_seq_no.wrapping_add(1);
    }

    /// Record a received indicator. Returns `None` for a repeat of the
    /// current one, otherwise the previous indicator.
    fn note_rx_indicator(&mut self, indicator: Indicator) -> Option<Option<Indicator>> {
        if self.current_rx_indicator == Some(indicator) {
            return None;
        }
        let prev = self.current_rx_indicator.replace(indicator);
        self.current_rx_field = None;
        Some(prev)
    }

    /// Record a received data field; true if it differs from the last
    /// (data type, field type) pair seen.
    fn note_rx_field(&mut self, data_type: DataType, field_type: FieldType) -> bool {
        let new = self.current_rx_field != Some((data_type, field_type));
        self.current_rx_field = Some((data_type, field_type));
        new
    }
}

/// Where the egress pacing machine is in its current sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimedStep {
    None,
    NonEcm(NonEcmStep),
    Hdlc(HdlcStep),
    Ced(ToneStep),
    Cng(ToneStep),
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NonEcmStep {
    /// 75ms of no-signal before the carrier comes up.
    Silence,
    /// Training indicator sent; waiting out the training time.
    Training,
    /// Streaming image data chunks.
    Data,
    /// Zero padding so quirky gateways do not clip the last rows.
    Trailer,
    /// Send the final no-signal and report completion.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HdlcStep {
    Training,
    Data,
    /// Separate FCS field (unmerged mode only).
    Fcs,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToneStep {
    Silence,
    Tone,
}

impl Session {
    // ------------------------------------------------------------------
    // Sequence starters, called from the modem-mode machine.
    // ------------------------------------------------------------------

    fn t38_chunk_octets(&self) -> usize {
        if self.ms_per_tx_chunk == 0 {
            MAX_OCTETS_PER_UNPACED_CHUNK
        } else {
            ((u64::from(self.bit_rate) * self.ms_per_tx_chunk / 8000) as usize).max(1)
        }
    }

    pub(crate) fn t38_start_non_ecm(&mut self) {
        let (ind, dt) = match (self.modem, self.bit_rate, self.short_train) {
            (Some(Modem::V27terTx), 2400, _) => {
                (Indicator::V27ter2400Training, DataType::V27ter2400)
            }
            (Some(Modem::V27terTx), _, _) => (Indicator::V27ter4800Training, DataType::V27ter4800),
            (Some(Modem::V29Tx), 7200, _) => (Indicator::V29_7200Training, DataType::V29_7200),
            (Some(Modem::V29Tx), _, _) => (Indicator::V29_9600Training, DataType::V29_9600),
            (_, 7200, false) => (Indicator::V17_7200LongTraining, DataType::V17_7200),
            (_, 7200, true) => (Indicator::V17_7200ShortTraining, DataType::V17_7200),
            (_, 9600, false) => (Indicator::V17_9600LongTraining, DataType::V17_9600),
            (_, 9600, true) => (Indicator::V17_9600ShortTraining, DataType::V17_9600),
            (_, 12000, false) => (Indicator::V17_12000LongTraining, DataType::V17_12000),
            (_, 12000, true) => (Indicator::V17_12000ShortTraining, DataType::V17_12000),
            (_, _, false) => (Indicator::V17_14400LongTraining, DataType::V17_14400),
            (_, _, true) => (Indicator::V17_14400ShortTraining, DataType::V17_14400),
        };
        self.next_tx_indicator = ind;
        self.current_tx_data_type = dt;
        self.octets_per_data_packet = self.t38_chunk_octets();
        self.timed_step = TimedStep::NonEcm(NonEcmStep::Silence);
        self.next_tx_samples = self.samples;
    }

    pub(crate) fn t38_start_hdlc_tx(&mut self) {
        self.next_tx_indicator = Indicator::V21Preamble;
        self.current_tx_data_type = DataType::V21;
        self.octets_per_data_packet = self.t38_chunk_octets();
        self.t38_cur_frame = None;
        self.timed_step = TimedStep::Hdlc(HdlcStep::Training);
        self.next_tx_samples = self.samples;
    }

    pub(crate) fn t38_start_ced(&mut self) {
        self.timed_step = TimedStep::Ced(ToneStep::Silence);
        self.next_tx_samples = self.samples;
    }

    pub(crate) fn t38_start_cng(&mut self) {
        self.timed_step = TimedStep::Cng(ToneStep::Silence);
        self.next_tx_samples = self.samples;
    }

    /// Going quiet: no more timed sequence, just the indicator.
    pub(crate) fn t38_send_no_signal(&mut self) {
        self.timed_step = TimedStep::None;
        self.t38_send_ind(Indicator::NoSignal);
    }

    fn t38_send_ind(&mut self, indicator: Indicator) {
        let count = self.indicator_tx_count;
        if let Some(t38) = self.t38.as_mut() {
            t38.send_indicator(indicator, count);
        }
    }

    fn t38_send_data(&mut self, field_type: FieldType, data: &[u8], count: u32) {
        let dt = self.current_tx_data_type;
        if let Some(t38) = self.t38.as_mut() {
            t38.send_data(dt, field_type, data, count);
        }
    }

    fn t38_send_multi(&mut self, fields: Vec<DataField>, count: u32) {
        let dt = self.current_tx_data_type;
        if let Some(t38) = self.t38.as_mut() {
            t38.send_data_multi(dt, fields, count);
        }
    }

    /// The T.38 analog of the transmit modem going quiet.
    fn t38_tx_complete(&mut self) {
        self.link.response(ResponseCode::Ok);
        self.set_at_rx_mode(AtRxMode::OffHookCommand);
        self.modem = Some(Modem::SilenceTx);
        self.transmit = false;
    }

    // ------------------------------------------------------------------
    // Egress: the timed-step machine.
    // ------------------------------------------------------------------

    /// Advance the sample clock by `samples` and run at most one timed
    /// step. Call this regularly in T.38 mode; in audio mode it only
    /// keeps the clock.
    pub fn t38_send_timeout(&mut self, samples: u64) {
        self.samples += samples;
        if self.timeout_rx_samples != 0 && self.samples > self.timeout_rx_samples {
            warn!("timeout mid-receive");
            self.timeout_rx_samples = 0;
        }
        if self.timed_step == TimedStep::None {
            return;
        }
        if self.samples < self.next_tx_samples {
            return;
        }
        match self.timed_step {
            TimedStep::None => {}
            TimedStep::NonEcm(step) => self.t38_non_ecm_step(step),
            TimedStep::Hdlc(step) => self.t38_hdlc_step(step),
            TimedStep::Ced(step) => self.t38_ced_step(step),
            TimedStep::Cng(step) => self.t38_cng_step(step),
            TimedStep::Pause => {
                // End of the CED pause: straight on to V.21/HDLC.
                self.timed_step = TimedStep::None;
                self.modem = None;
                self.restart_modem(Modem::V21Tx);
                self.set_at_rx_mode(AtRxMode::Hdlc);
            }
        }
    }

    fn t38_non_ecm_step(&mut self, step: NonEcmStep) {
        match step {
            NonEcmStep::Silence => {
                // 75ms of quiet before switching the fast carrier on.
                if self
                    .t38
                    .as_ref()
                    .is_some_and(|t| t.current_tx_indicator() != Some(Indicator::NoSignal))
                {
                    self.t38_send_ind(Indicator::NoSignal);
                }
                self.timed_step = TimedStep::NonEcm(NonEcmStep::Training);
                self.next_tx_samples += ms_to_samples(75);
            }
            NonEcmStep::Training => {
                let ind = self.next_tx_indicator;
                self.t38_send_ind(ind);
                self.timed_step = TimedStep::NonEcm(NonEcmStep::Data);
                self.next_tx_samples += ms_to_samples(ind.training_time_ms(self.use_tep, false));
            }
            NonEcmStep::Data => {
                let n = self.octets_per_data_packet;
                let mut buf = vec![0u8; n];
                let got = self.pump.get_chunk(&mut buf);
                if got < n {
                    // End of the image data: switch to zero padding so
                    // the far end shuts down cleanly.
                    self.trailer_bytes = (3 * n + got) as i64;
                    self.timed_step = TimedStep::NonEcm(NonEcmStep::Trailer);
                }
                bit_reverse(&mut buf);
                self.t38_send_data(FieldType::T4NonEcmData, &buf, 1);
                self.next_tx_samples += ms_to_samples(self.ms_per_tx_chunk);
            }
            NonEcmStep::Trailer => {
                let n = self.octets_per_data_packet as i64;
                self.trailer_bytes -= n;
                if self.trailer_bytes <= 0 {
                    let len = (n + self.trailer_bytes).max(0) as usize;
                    let buf = vec![0u8; len];
                    let count = self.data_end_tx_count;
                    self.t38_send_data(FieldType::T4NonEcmSigEnd, &buf, count);
                    self.timed_step = TimedStep::NonEcm(NonEcmStep::Done);
                    self.next_tx_samples += ms_to_samples(60);
                } else {
                    let buf = vec![0u8; n as usize];
                    self.t38_send_data(FieldType::T4NonEcmData, &buf, 1);
                    self.next_tx_samples += ms_to_samples(self.ms_per_tx_chunk);
                }
            }
            NonEcmStep::Done => {
                // The signal end already said so, but a final no-signal
                // helps quirky implementations.
                self.t38_send_ind(Indicator::NoSignal);
                self.timed_step = TimedStep::None;
                self.t38_tx_complete();
            }
        }
    }

    fn t38_hdlc_step(&mut self, step: HdlcStep) {
        match step {
            HdlcStep::Training => {
                let ind = self.next_tx_indicator;
                self.t38_send_ind(ind);
                self.next_tx_samples += ms_to_samples(ind.training_time_ms(self.use_tep, true));
                self.timed_step = TimedStep::Hdlc(HdlcStep::Data);
            }
            HdlcStep::Data => {
                if self.t38_cur_frame.is_none() {
                    match self.hdlc_tx_frames.pop_front() {
                        Some(f) => self.t38_cur_frame = Some((f, 0)),
                        // Nothing from the DTE yet; try again next tick.
                        None => return,
                    }
                }
                let (frame, ptr) = self.t38_cur_frame.as_mut().expect("frame just set");
                let remaining = frame.len() - *ptr;
                if self.octets_per_data_packet >= remaining {
                    // The last part of this frame.
                    let mut chunk = frame[*ptr..].to_vec();
                    bit_reverse(&mut chunk);
                    self.t38_cur_frame = None;
                    let last_of_batch = self.hdlc_tx_frames.is_empty() && self.hdlc_final;
                    if self.merge_tx_fields {
                        let fcs_field = if last_of_batch {
                            FieldType::HdlcFcsOkSigEnd
                        } else {
                            FieldType::HdlcFcsOk
                        };
                        self.t38_send_multi(
                            vec![
                                DataField {
                                    field_type: FieldType::HdlcData,
                                    data: chunk,
                                },
                                DataField {
                                    field_type: fcs_field,
                                    data: Vec::new(),
                                },
                            ],
                            1,
                        );
                        if last_of_batch {
                            self.hdlc_final = false;
                            self.timed_step = TimedStep::Hdlc(HdlcStep::Done);
                        } else {
                            // Solicit the next frame from the DTE.
                            self.link.response(ResponseCode::Connect);
                        }
                    } else {
                        self.t38_send_data(FieldType::HdlcData, &chunk, 1);
                        self.timed_step = TimedStep::Hdlc(HdlcStep::Fcs);
                    }
                } else {
                    let mut chunk = frame[*ptr..*ptr + self.octets_per_data_packet].to_vec();
                    *ptr += self.octets_per_data_packet;
                    bit_reverse(&mut chunk);
                    self.t38_send_data(FieldType::HdlcData, &chunk, 1);
                }
                self.next_tx_samples += ms_to_samples(self.ms_per_tx_chunk);
            }
            HdlcStep::Fcs => {
                let last_of_batch = self.hdlc_tx_frames.is_empty() && self.hdlc_final;
                if last_of_batch {
                    self.hdlc_final = false;
                    let count = self.data_end_tx_count;
                    self.t38_send_data(FieldType::HdlcFcsOkSigEnd, &[], count);
                    self.timed_step = TimedStep::Hdlc(HdlcStep::Done);
                    self.next_tx_samples += ms_to_samples(100);
                } else {
                    self.t38_send_data(FieldType::HdlcFcsOk, &[], 1);
                    self.link.response(ResponseCode::Connect);
                    self.timed_step = TimedStep::Hdlc(HdlcStep::Data);
                    self.next_tx_samples += ms_to_samples(self.ms_per_tx_chunk);
                }
            }
            HdlcStep::Done => {
                // Some boxes dislike HDLC_SIG_END here; a no-signal
                // indicator is always acceptable.
                self.t38_send_ind(Indicator::NoSignal);
                if self.hdlc_tx_frames.is_empty() {
                    self.timed_step = TimedStep::None;
                    self.t38_tx_complete();
                } else {
                    // The DTE already queued a whole new sequence.
                    self.timed_step = TimedStep::Hdlc(HdlcStep::Training);
                    self.next_tx_samples += ms_to_samples(self.ms_per_tx_chunk);
                }
            }
        }
    }

    fn t38_ced_step(&mut self, step: ToneStep) {
        match step {
            ToneStep::Silence => {
                // 200ms of silence is a specification requirement before
                // CED; common practice is to announce it with no-signal.
                self.timed_step = TimedStep::Ced(ToneStep::Tone);
                self.next_tx_samples = self.samples + ms_to_samples(200);
                self.t38_send_ind(Indicator::NoSignal);
                self.current_tx_data_type = DataType::None;
            }
            ToneStep::Tone => {
                self.next_tx_samples = self.samples + ms_to_samples(3000);
                self.timed_step = TimedStep::Pause;
                self.t38_send_ind(Indicator::Ced);
                self.current_tx_data_type = DataType::None;
            }
        }
    }

    fn t38_cng_step(&mut self, step: ToneStep) {
        match step {
            ToneStep::Silence => {
                self.timed_step = TimedStep::Cng(ToneStep::Tone);
                self.next_tx_samples = self.samples + ms_to_samples(200);
                self.t38_send_ind(Indicator::NoSignal);
                self.current_tx_data_type = DataType::None;
            }
            ToneStep::Tone => {
                self.timed_step = TimedStep::None;
                self.t38_send_ind(Indicator::Cng);
                self.current_tx_data_type = DataType::None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Ingress.
    // ------------------------------------------------------------------

    /// A received IFP indicator.
    pub fn t38_rx_indicator(&mut self, indicator: Indicator) {
        let prev = match self.t38.as_mut() {
            Some(t38) => match t38.note_rx_indicator(indicator) {
                Some(prev) => prev,
                None => {
                    // The far end repeating itself; harmless.
                    return;
                }
            },
            None => return,
        };
        debug!("rx indicator {indicator:?}");
        match indicator {
            Indicator::NoSignal => {
                if prev == Some(Indicator::V21Preamble)
                    && matches!(
                        self.modem,
                        Some(Modem::V21Rx) | Some(Modem::Cng) | Some(Modem::NoCng)
                    )
                {
                    self.hdlc_carrier_down();
                }
                self.timeout_rx_samples = 0;
            }
            Indicator::Cng | Indicator::Ced => {}
            Indicator::V21Preamble => {
                // Preamble indicators also pop up between HDLC frames;
                // tolerate that. While answering with CNG, the preamble
                // stops the tone just as it does in audio mode.
                if matches!(self.modem, Some(Modem::Cng) | Some(Modem::NoCng)) {
                    self.modem = Some(Modem::V21Rx);
                    self.transmit = false;
                }
                self.hdlc_carrier_up();
                self.timeout_rx_samples = self.samples + ms_to_samples(MID_RX_TIMEOUT_MS);
            }
            _ => {
                // A fast-modem training indicator. Training success is
                // only reported once data actually arrives.
                self.timeout_rx_samples = self.samples + ms_to_samples(MID_RX_TIMEOUT_MS);
            }
        }
        self.hdlc_rx_buf.clear();
        self.missing_data = false;
    }

    /// A received IFP data field.
    pub fn t38_rx_data(&mut self, data_type: DataType, field_type: FieldType, buf: &[u8]) {
        let is_new = self
            .t38
            .as_mut()
            .map(|t38| t38.note_rx_field(data_type, field_type))
            .unwrap_or(true);
        if field_type.is_sig_end() || field_type == FieldType::HdlcFcsOk {
            if !buf.is_empty() && field_type != FieldType::T4NonEcmSigEnd {
                warn!("unexpected data in {field_type:?}");
            }
        }
        match field_type {
            FieldType::HdlcData => {
                if self.timeout_rx_samples == 0 {
                    // HDLC can just start without any signal indicator on
                    // some platforms, even with zero packet loss.
                    self.rx_signal_present = true;
                    // Real fax HDLC messages start with 0xFF; anything
                    // else means octets went missing before this one.
                    if buf.first() != Some(&0xff) {
                        self.missing_data = true;
                    }
                }
                if self.hdlc_rx_buf.len() + buf.len() <= 256 - 2 {
                    let start = self.hdlc_rx_buf.len();
                    self.hdlc_rx_buf.extend_from_slice(buf);
                    bit_reverse(&mut self.hdlc_rx_buf[start..]);
                }
                self.timeout_rx_samples = self.samples + ms_to_samples(MID_RX_TIMEOUT_MS);
            }
            FieldType::HdlcFcsOk => {
                // Zero length frames happen: some implementations send
                // several FCS_OK packets for one frame.
                if self.modem == Some(Modem::V21Rx)
                    && !self.hdlc_rx_buf.is_empty()
                    && !self.missing_data
                {
                    self.t38_deliver_frame();
                }
                self.hdlc_rx_buf.clear();
                self.missing_data = false;
            }
            FieldType::HdlcFcsOkSigEnd => {
                if self.modem == Some(Modem::V21Rx) {
                    if !self.hdlc_rx_buf.is_empty() && !self.missing_data {
                        self.t38_deliver_frame();
                    }
                    self.hdlc_carrier_down();
                }
                self.hdlc_rx_buf.clear();
                self.missing_data = false;
            }
            FieldType::HdlcFcsBad => {
                debug!(
                    "bad FCS ({})",
                    if self.missing_data {
                        "missing octets"
                    } else {
                        "clean"
                    }
                );
                self.hdlc_rx_buf.clear();
                self.missing_data = false;
            }
            FieldType::HdlcFcsBadSigEnd => {
                if self.modem == Some(Modem::V21Rx) {
                    self.hdlc_carrier_down();
                }
                self.hdlc_rx_buf.clear();
                self.missing_data = false;
            }
            FieldType::HdlcSigEnd => {
                // Either the tail of FCS_OK + SIG_END, or the carrier
                // dropping unexpectedly mid-signal.
                if self.modem == Some(Modem::V21Rx) {
                    self.hdlc_carrier_down();
                }
                self.hdlc_rx_buf.clear();
                self.missing_data = false;
            }
            FieldType::T4NonEcmData => {
                self.t38_non_ecm_bytes(buf);
                self.timeout_rx_samples = self.samples + ms_to_samples(MID_RX_TIMEOUT_MS);
            }
            FieldType::T4NonEcmSigEnd => {
                // Some implementations repeat this in packets with fresh
                // sequence numbers; filter contextually.
                if is_new {
                    if !buf.is_empty() {
                        self.t38_non_ecm_bytes(buf);
                    }
                    // Some gateways send HDLC signal end where they mean
                    // non-ECM signal end, so complete generically.
                    self.non_ecm_carrier_down();
                }
                self.rx_signal_present = false;
                self.rx_trained = false;
                self.timeout_rx_samples = 0;
            }
        }
    }

    /// A gap in the IFP sequence numbers: octets are gone for good.
    pub fn t38_rx_missing(&mut self, rx_seq_no: u16, expected_seq_no: u16) {
        debug!("missing packets: got {rx_seq_no}, expected {expected_seq_no}");
        self.missing_data = true;
    }

    /// Convenience: split a structured packet into the three callbacks.
    pub fn t38_rx_packet(&mut self, packet: &IfpPacket) {
        match packet {
            IfpPacket::Indicator(ind) => self.t38_rx_indicator(*ind),
            IfpPacket::Data { data_type, fields } => {
                for f in fields {
                    self.t38_rx_data(*data_type, f.field_type, &f.data);
                }
            }
        }
    }

    fn t38_deliver_frame(&mut self) {
        let mut frame = std::mem::take(&mut self.hdlc_rx_buf);
        // The wire carries no FCS; synthesize one so the DTE sees the
        // same shape as in audio mode.
        let fcs = compute_fcs(&frame);
        frame.extend_from_slice(&fcs.to_le_bytes());
        self.hdlc_accept_frame(&frame, true);
    }

    fn t38_non_ecm_bytes(&mut self, buf: &[u8]) {
        if !self.rx_signal_present {
            // First data of the burst stands in for training success.
            self.link.response(ResponseCode::Connect);
            self.rx_signal_present = true;
            self.rx_trained = true;
        }
        let mut bytes = buf.to_vec();
        bit_reverse(&mut bytes);
        for b in bytes {
            self.non_ecm_put_byte(b);
        }
    }
}
