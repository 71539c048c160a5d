//! Read engine
//!
//! One logical reader per link pulls bytes off the transport, deframes them,
//! and either retires the matching pending tracker (waking the blocked
//! caller) or routes node-initiated traffic to the attention/data-acq paths.
//!
//! The engine is a small state machine driven by `start()`/`stop()`/
//! `terminate()` from the dispatcher, the recovery engine, and link close.
//! State transitions live under their own lock, distinct from the tracker's
//! queue lock, so a "please stop" never contends with in-flight packet
//! processing.

use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::codec::{ParsedItem, StreamParser};
use super::error::{LinkError, NodeErrorClass, NodeNetCode};
use super::event::LinkEvent;
use super::net::{push_attention, push_data_acq, Attention, DataAcqSample, LinkCore, LinkSessionState};
use super::packet::{ext_high, ext_low, Packet, PacketSource, PacketType};
use super::tracker::QueueClass;
use super::transport::LinkTransport;

/// Read engine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// Actively pulling packets
    Running,
    /// Halt asked for, not yet honored
    HaltRequested,
    /// Parked; `start()` resumes
    Halted,
    /// Shutdown asked for, not yet honored
    ShutdownRequested,
    /// Terminal; thread exited
    Shutdown,
}

/// Start/stop interlock for the read thread
pub(crate) struct ReadControl {
    state: Mutex<ReadState>,
    cv: Condvar,
}

impl ReadControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ReadState::Halted),
            cv: Condvar::new(),
        }
    }

    /// Make sure the engine is running (no-op if it already is)
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            ReadState::Halted | ReadState::HaltRequested => {
                *state = ReadState::Running;
                self.cv.notify_all();
            }
            _ => {}
        }
    }

    /// Ask the engine to park after the current cycle
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ReadState::Running {
            *state = ReadState::HaltRequested;
            self.cv.notify_all();
        }
    }

    /// Ask the engine to park and wait until it has
    pub fn stop_and_wait(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ReadState::Running {
            *state = ReadState::HaltRequested;
            self.cv.notify_all();
        }
        while !matches!(*state, ReadState::Halted | ReadState::Shutdown) {
            let (guard, _) = self
                .cv
                .wait_timeout(state, Duration::from_millis(200))
                .unwrap();
            state = guard;
        }
    }

    /// Ask the thread to exit; terminal
    pub fn request_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != ReadState::Shutdown {
            *state = ReadState::ShutdownRequested;
            self.cv.notify_all();
        }
    }

    pub fn current(&self) -> ReadState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.current() == ReadState::Running
    }

    /// Wait until the engine should run a cycle; `false` means exit
    fn gate(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                ReadState::Running => return true,
                ReadState::HaltRequested => {
                    *state = ReadState::Halted;
                    self.cv.notify_all();
                }
                ReadState::Halted => {
                    state = self.cv.wait(state).unwrap();
                }
                ReadState::ShutdownRequested => {
                    *state = ReadState::Shutdown;
                    self.cv.notify_all();
                    return false;
                }
                ReadState::Shutdown => return false,
            }
        }
    }

    /// Mark the terminal state from inside the loop
    fn enter_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        *state = ReadState::Shutdown;
        self.cv.notify_all();
    }
}

/// Thread body of the read engine
pub(crate) fn read_loop(core: Arc<LinkCore>, mut reader: Box<dyn LinkTransport>) {
    core.register_read_thread();
    let mut parser = StreamParser::new();
    let mut flush_epoch = core.flush_epoch.load(Ordering::SeqCst);
    let mut buf = [0u8; 256];
    let mut items = Vec::new();
    debug!("read engine starting");

    loop {
        if !core.read.gate() {
            break;
        }
        if core.terminate.load(Ordering::SeqCst) {
            core.read.enter_shutdown();
            break;
        }

        // A flush invalidates any partial frame
        let epoch = core.flush_epoch.load(Ordering::SeqCst);
        if epoch != flush_epoch {
            flush_epoch = epoch;
            parser.reset();
        }

        // Bounded poll so stop/terminate requests are observed promptly
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                items.clear();
                parser.feed(&buf[..n], &mut items);
                for item in items.drain(..) {
                    match item {
                        ParsedItem::Packet(pkt) => handle_packet(&core, pkt),
                        ParsedItem::Fault(err) => handle_stream_fault(&core, err),
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) => {}
            Err(err) => {
                if core.session_state() == LinkSessionState::Flashing {
                    // Probing mode owns the port; park without escalating
                    core.read.stop();
                    continue;
                }
                if core.terminate.load(Ordering::SeqCst) {
                    core.read.enter_shutdown();
                    break;
                }
                warn!("read failed: {err}");
                core.report_link_error(LinkError::from(err), None, None);
            }
        }
    }
    debug!("read engine exited");
}

/// Classify and dispatch one decoded packet
fn handle_packet(core: &LinkCore, pkt: Packet) {
    match pkt.src {
        PacketSource::Host => handle_host_sourced(core, pkt),
        PacketSource::Node => handle_node_initiated(core, pkt),
    }
}

/// A frame that originated at the host: either an expected response or a
/// host-side network error report.
fn handle_host_sourced(core: &LinkCore, pkt: Packet) {
    // Error frames in the net class mean corruption was noticed on the wire
    // while this frame circulated; they never retire a tracker.
    if pkt.pkt_type == PacketType::Error {
        let class_byte = pkt.payload.first().copied().unwrap_or(0);
        if NodeErrorClass::from_bits(class_byte) == NodeErrorClass::Net {
            let err = LinkError::NodeNetError {
                node: pkt.addr,
                code: NodeNetCode::from_code(class_byte & 0x1F),
            };
            core.trace
                .log_receive(&pkt.encode(), None, 0, err.trace_code());
            core.report_link_error(err, Some(pkt.addr), Some(pkt));
            return;
        }
    }

    let class = QueueClass::for_packet(&pkt);
    let addr = pkt.addr;
    let frame = pkt.encode();
    let copy = pkt.clone();
    match core.tracker.complete_head(class, pkt) {
        Some(retirement) => {
            if retirement.serial_mismatch {
                // The link guarantees per-node order, so the head is
                // authoritative; note the disagreement and deliver anyway.
                debug!(
                    node = addr,
                    resp_count = retirement.resp_count,
                    "response count mismatch at queue head"
                );
            }
            core.trace.log_receive(
                &frame,
                Some(retirement.send_serial),
                retirement.resp_count,
                0,
            );
            if retirement.remaining > 0 {
                core.read.start();
            }
        }
        None => {
            let known = core.session.lock().unwrap().inventory_now.node_count();
            let err = if (addr as usize) >= known && known > 0 {
                LinkError::AddrRange { node: addr }
            } else {
                LinkError::Unsolicited { node: addr }
            };
            core.trace.log_receive(&frame, None, 0, err.trace_code());
            debug!(node = addr, "unsolicited response");
            // Logged and surfaced, not fatal
            core.events.publish_error(Some(addr), err, Some(copy));
        }
    }
}

/// Packets a node originated on its own: attentions, diagnostics, samples
fn handle_node_initiated(core: &LinkCore, pkt: Packet) {
    core.trace.log_receive(&pkt.encode(), None, 0, 0);
    match pkt.pkt_type {
        PacketType::AttnIrq => {
            let mut bits = [0u8; 4];
            for (i, &b) in pkt.payload.iter().take(4).enumerate() {
                bits[i] = b;
            }
            push_attention(
                core,
                Attention {
                    node: pkt.addr,
                    bits: u32::from_le_bytes(bits),
                },
            );
        }
        PacketType::ExtendLow => match pkt.payload.first().copied() {
            Some(ext_low::DATA_ACQ) => {
                let sequence = pkt.payload.get(1).copied().unwrap_or(0);
                push_data_acq(
                    core,
                    DataAcqSample {
                        node: pkt.addr,
                        sequence,
                        data: pkt.payload.get(2..).unwrap_or(&[]).to_vec(),
                    },
                );
            }
            Some(ext_low::NOP) | None => {}
            Some(code) => trace!(node = pkt.addr, code, "unknown low extension"),
        },
        PacketType::ExtendHigh => match pkt.payload.first().copied() {
            Some(ext_high::NET_DIAG_INFO) => {
                core.events.publish(LinkEvent::DiagInfo {
                    node: pkt.addr,
                    payload: pkt.payload[1..].to_vec(),
                });
            }
            _ => trace!(node = pkt.addr, "unhandled high extension from node"),
        },
        PacketType::Error => {
            // Node announced trouble on its own; classify like a response
            let class_byte = pkt.payload.first().copied().unwrap_or(0);
            let err = match NodeErrorClass::from_bits(class_byte) {
                NodeErrorClass::Net => LinkError::NodeNetError {
                    node: pkt.addr,
                    code: NodeNetCode::from_code(class_byte & 0x1F),
                },
                _ => LinkError::RespFormat,
            };
            core.report_link_error(err, Some(pkt.addr), Some(pkt));
        }
        other => {
            trace!(node = pkt.addr, ?other, "ignoring node-initiated frame");
        }
    }
}

/// Faults raised by the deframer itself (corruption on our own receive path)
fn handle_stream_fault(core: &LinkCore, err: LinkError) {
    core.trace.log_receive(&[], None, 0, err.trace_code());
    debug!("stream fault: {err}");
    core.report_link_error(err, None, None);
}
