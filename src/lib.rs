//! A T.31 Class 1 fax modem emulator.
//!
//! T.31 is the ITU-T recommendation for controlling a fax modem (the DCE)
//! from a terminal (the DTE) with AT commands:
//! https://www.itu.int/rec/T-REC-T.31
//!
//! This crate implements the modem side of that contract. The DTE feeds it
//! a DLE-stuffed byte stream; on the far side the session drives either
//! 8kHz linear audio carrying V.21/V.27ter/V.29/V.17 modulations, or a
//! T.38 fax relay (https://www.itu.int/rec/T-REC-T.38) exchanging IFP
//! packets.
//!
//! The AT command interpreter itself is out of scope. The embedder parses
//! command lines, and calls into the session through
//! [`Session::process_class1_cmd`] and [`Session::modem_control`]. The
//! session talks back through the [`AtLink`] trait: data bytes, result
//! codes, and modem control requests such as flow control and hangup.
//!
//! # Example
//!
//! ```no_run
//! use rt31::{AtLink, CallEvent, ControlOp, ResponseCode, Session};
//!
//! struct Dte;
//! impl AtLink for Dte {
//!     fn send(&mut self, data: &[u8]) { /* bytes towards the DTE */ }
//!     fn response(&mut self, code: ResponseCode) { /* OK, CONNECT, ... */ }
//!     fn interpret(&mut self, line: &[u8]) { /* AT command bytes */ }
//!     fn control(&mut self, _op: ControlOp) {}
//!     fn call_event(&mut self, _event: CallEvent) {}
//! }
//!
//! let mut s = Session::new(Box::new(Dte), None);
//! let mut audio = [0i16; 160];
//! s.rx(&audio);
//! let _produced = s.tx(&mut audio);
//! ```

pub mod dsp;
pub mod fast;
pub mod fsk;
pub mod hdlc;
pub mod queue;
pub mod state;
pub mod t38;

pub use state::{AtRxMode, Class1Operation, Direction, Modem, Session};
pub use t38::{DataField, DataType, FieldType, IfpPacket, Indicator, T38Core, T38Sink};

/// Data link escape. Doubled to carry a literal 0x10 in the data stream.
pub const DLE: u8 = 0x10;
/// End of text. DLE-ETX terminates a stuffed data stream.
pub const ETX: u8 = 0x03;
/// Substitute. DLE-SUB expands to two literal DLEs (transmit direction only).
pub const SUB: u8 = 0x1A;

/// Everything is clocked off 8kHz telephony audio.
pub const SAMPLE_RATE: u64 = 8000;

/// Convert a duration in milliseconds to a sample count.
#[must_use]
pub const fn ms_to_samples(ms: u64) -> u64 {
    ms * (SAMPLE_RATE / 1000)
}

/// Result codes the session can hand to the AT interpreter for the DTE.
///
/// The interpreter owns the verbose/numeric formatting (V.250 style), so
/// these stay symbolic here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    Connect,
    Error,
    NoCarrier,
    /// +FCERROR: a V.21 preamble turned up while a fast modem was expected.
    FcError,
    /// +FRH:3, reported before CONNECT when adaptive reception drops to V.21.
    Frh3,
}

/// Modem control operations.
///
/// These flow in both directions across the AT interpreter boundary: the
/// interpreter asks the session to answer, hang up or restart, and the
/// session asks the embedder to toggle flow control or drop the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// An outgoing call has been started.
    Call,
    /// An incoming call has been answered.
    Answer,
    /// The call has been torn down.
    OnHook,
    /// Request the embedder drop the call.
    Hangup,
    /// Clear-to-send towards the DTE. `false` = hold further data.
    Cts(bool),
    /// Restart the modem in the given mode.
    Restart(Modem),
    /// Arm (or with `None`, disarm) the DTE inactivity timeout, in ms.
    DteTimeout(Option<u64>),
}

/// Call progress events, forwarded to the AT interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Alerting,
    Answered,
    Connected,
    Busy,
    NoDialtone,
    NoAnswer,
    Hangup,
}

/// The borrowed DTE/AT-interpreter side of the session.
///
/// Calls are made synchronously from within the session entry points, in
/// emission order. The session drives the trait, it never polls it.
pub trait AtLink {
    /// Deliver received data bytes (already DLE-stuffed) to the DTE.
    fn send(&mut self, data: &[u8]);
    /// Deliver a result code to the DTE.
    fn response(&mut self, code: ResponseCode);
    /// Hand command-mode bytes to the AT command interpreter.
    fn interpret(&mut self, data: &[u8]);
    /// A modem control request for the embedder (CTS, hangup, ...).
    fn control(&mut self, op: ControlOp);
    /// A call progress event for the AT interpreter.
    fn call_event(&mut self, event: CallEvent);
}

/// Reverse the bit order of every octet in `buf`, in place.
///
/// HDLC octets are bit-reversed between the DTE representation and the
/// T.38 wire representation. Applying this twice is a no-op.
pub fn bit_reverse(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = b.reverse_bits();
    }
}

/// One transmit bit pulled from a bit source by a modulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBit {
    Bit(bool),
    /// The source ran dry but expects to be refilled (HDLC inter-frame).
    Underflow,
    /// Orderly end of transmission. The modulator shuts down.
    Done,
}

/// A serial bit producer feeding a modulator.
pub trait BitSource {
    fn get_bit(&mut self) -> TxBit;
}

/// Status of one modulator `tx()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// The whole output buffer was filled; more to come.
    Filled,
    /// Stopped early because the bit source underflowed.
    Underflow,
    /// The transmission has ended; the buffer may be partially filled.
    Done,
}

/// Sideband events a demodulator reports along with its data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitEvent {
    Bit(bool),
    CarrierUp,
    CarrierDown,
    TrainingSucceeded,
    TrainingFailed,
}
