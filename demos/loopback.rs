//! Two T.31 sessions wired back to back over a T.38 packet pipe.
//!
//! The caller's DTE pushes one final HDLC frame with +FTH=3; the
//! answerer's DTE collects it with +FRH=3. Packets are ferried between
//! the two sessions in-process, so this demonstrates the whole timed
//! egress machine and the ingress reassembly without a network.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::Result;
use clap::Parser;

use rt31::{
    AtLink, CallEvent, Class1Operation, ControlOp, Direction, IfpPacket, ResponseCode, Session,
    T38Sink, DLE, ETX,
};

#[derive(Parser, Debug)]
struct Opt {
    /// Log verbosity (0 = warnings only).
    #[clap(short, long, default_value_t = 0)]
    verbosity: usize,

    /// Stream without pacing, as over a TCP transport.
    #[clap(long)]
    unpaced: bool,
}

struct Dte {
    name: &'static str,
    received: Rc<RefCell<Vec<u8>>>,
}

impl AtLink for Dte {
    fn send(&mut self, data: &[u8]) {
        self.received.borrow_mut().extend_from_slice(data);
    }
    fn response(&mut self, code: ResponseCode) {
        println!("{}: {:?}", self.name, code);
    }
    fn interpret(&mut self, data: &[u8]) {
        println!("{}: command {:?}", self.name, String::from_utf8_lossy(data));
    }
    fn control(&mut self, op: ControlOp) {
        println!("{}: control {:?}", self.name, op);
    }
    fn call_event(&mut self, _event: CallEvent) {}
}

#[derive(Clone, Default)]
struct Pipe(Rc<RefCell<VecDeque<IfpPacket>>>);

impl T38Sink for Pipe {
    fn send_packet(&mut self, _seq_no: u16, packet: &IfpPacket, _count: u32) {
        self.0.borrow_mut().push_back(packet.clone());
    }
}

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

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("rt31")
        .verbosity(opt.verbosity)
        .init()
        .unwrap();

    let caller_to_answerer = Pipe::default();
    let answerer_to_caller = Pipe::default();
    let received = Rc::new(RefCell::new(Vec::new()));

    let mut caller = Session::new(
        Box::new(Dte {
            name: "caller",
            received: Rc::new(RefCell::new(Vec::new())),
        }),
        Some(Box::new(caller_to_answerer.clone())),
    );
    caller.set_t38_mode(true);
    caller.set_t38_config(opt.unpaced);

    let mut answerer = Session::new(
        Box::new(Dte {
            name: "answerer",
            received: received.clone(),
        }),
        Some(Box::new(answerer_to_caller.clone())),
    );
    answerer.set_t38_mode(true);
    answerer.set_t38_config(opt.unpaced);

    // The caller transmits one final frame; the answerer waits for it.
    caller.process_class1_cmd(Direction::Transmit, Class1Operation::Hdlc, 3)?;
    answerer.process_class1_cmd(Direction::Receive, Class1Operation::Hdlc, 3)?;

    // A DCN-shaped frame: address, control with the final bit, FCF.
    let frame = [0xff, 0x13, 0xfb];
    caller.at_rx(&dle_stuff(&frame));

    // 160 samples per tick, i.e. 20ms of virtual time.
    for _ in 0..500 {
        caller.t38_send_timeout(160);
        answerer.t38_send_timeout(160);
        while let Some(p) = caller_to_answerer.0.borrow_mut().pop_front() {
            answerer.t38_rx_packet(&p);
        }
        while let Some(p) = answerer_to_caller.0.borrow_mut().pop_front() {
            caller.t38_rx_packet(&p);
        }
    }

    println!(
        "answerer DTE received {} bytes: {:02x?}",
        received.borrow().len(),
        received.borrow()
    );
    Ok(())
}
